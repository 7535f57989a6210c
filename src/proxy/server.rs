//! HTTP server setup and configuration.

use axum::{
    body::Body,
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
    Router,
};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::handlers;
use crate::config::{Config, GatewayMode};
use crate::omni::OmniAdapter;

/// Response header carrying the request correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Correlation id assigned to every inbound request.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub http_client: Client,
    pub config: Arc<Config>,
    /// Present only in omni mode.
    pub omni: Option<Arc<OmniAdapter>>,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        // Total deadlines are per call; the read timeout bounds silence between reads.
        let http_client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(config.backend.timeout())
            .build()?;

        let omni = OmniAdapter::from_config(http_client.clone(), &config).map(Arc::new);

        Ok(Self {
            http_client,
            config: Arc::new(config),
            omni,
        })
    }
}

/// Assign a request id and echo it in the response headers.
async fn assign_request_id(mut request: Request, next: Next) -> Response {
    let request_id = RequestId(Uuid::new_v4());
    request.extensions_mut().insert(request_id);

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id.0.to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        // OpenAI-compatible endpoints
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        // Adapter extensions
        .route("/v1/session", delete(handlers::release_session))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(assign_request_id))
                .layer(TraceLayer::new_for_http().make_span_with(
                    |request: &axum::http::Request<Body>| {
                        let request_id = request
                            .extensions()
                            .get::<RequestId>()
                            .map(|id| id.0.to_string())
                            .unwrap_or_default();
                        tracing::info_span!(
                            "request",
                            method = %request.method(),
                            uri = %request.uri(),
                            request_id = %request_id,
                        )
                    },
                )),
        )
}

/// Run the HTTP server until a shutdown signal, then release sessions.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();

    if config.server.mode == GatewayMode::Passthrough && config.omni.is_some() {
        tracing::warn!("[omni] section present but server.mode is passthrough; ignoring it");
    }

    let state = AppState::new(config)?;
    let omni = state.omni.clone();
    let app = create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(
        address = %listen_addr,
        mode = %state.config.server.mode,
        backend = %state.config.backend.url,
        "Starting minicpm-adapter"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(omni) = omni {
        let released = omni.sessions().cleanup_all().await;
        tracing::info!(released, "Released cached sessions");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::warn!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::warn!("Received SIGTERM, shutting down"),
    }
}
