//! Chat completions through the omni prefill/generate protocol.
//!
//! A turn is extracted from the last user message, prefilled into the
//! caller's backend session, then generated as a text stream that is reshaped
//! into OpenAI `chat.completion` responses.

pub mod client;
pub mod extract;
pub mod response;
pub mod stream;

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use reqwest::Client;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::proxy::types::ChatCompletionRequest;
use crate::session::SessionManager;
use client::{collect_text, text_fragments, OmniClient};
use extract::TurnInput;
use response::{sse_stream, CompletionMeta};

/// Session manager plus inference client for one gateway.
pub struct OmniAdapter {
    sessions: SessionManager,
    client: OmniClient,
    public_model: String,
}

impl OmniAdapter {
    /// Build the adapter when omni mode is enabled.
    pub fn from_config(http: Client, config: &Config) -> Option<Self> {
        if !config.omni_enabled() {
            return None;
        }
        let omni = config.omni.as_ref()?;

        let client = OmniClient::new(http.clone(), omni);
        Some(Self {
            sessions: SessionManager::new(http, omni, client.clone()),
            client,
            public_model: config.backend.public_model.clone(),
        })
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Run one turn for `api_key` and shape the reply.
    pub async fn chat_completion(
        &self,
        api_key: &str,
        request: &ChatCompletionRequest,
    ) -> Result<Response> {
        let turn = TurnInput::from_messages(&request.messages)
            .ok_or_else(|| Error::BadRequest("No user message found".to_string()))?;

        let session = self.sessions.get_or_create(api_key).await?;
        self.client.prefill(&session.session_id, &turn).await?;
        let generation = self.client.generate(&session.session_id).await?;
        let fragments = text_fragments(generation, self.client.generate_timeout());

        let meta = CompletionMeta::new(&self.public_model);
        tracing::info!(
            id = %meta.id,
            session_id = %session.session_id,
            stream = request.is_streaming(),
            "Generating"
        );

        if request.is_streaming() {
            return Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .body(Body::from_stream(sse_stream(meta, fragments)))
                .map_err(|e| Error::Internal(e.to_string()));
        }

        let text = collect_text(fragments).await?;
        Ok(Json(meta.completion(text)).into_response())
    }
}
