//! Integration tests for chat completions in omni mode.
//!
//! Drives the full router against mocked session and inference services.

use std::time::{Duration, Instant};

use axum::body::Body;
use http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use minicpm_adapter::config::{Config, GatewayMode, OmniConfig, ServerConfig};
use minicpm_adapter::proxy::{create_router, AppState};

const GENERATED: &str = concat!(
    "data: {\"type\":\"text\",\"content\":\"Hello\"}\n\n",
    "data: {\"type\":\"audio\",\"data\":\"AAAA\"}\n\n",
    "data: {broken json\n\n",
    "data:{\"type\":\"text\",\"content\":\", world\"}\n\n",
    "data: [DONE]\n\n",
    "data: {\"type\":\"text\",\"content\":\"ignored\"}\n\n"
);

struct Omni {
    sessions: MockServer,
    inference: MockServer,
}

impl Omni {
    /// Session and inference mocks with a healthy login and init.
    async fn start() -> Self {
        let omni = Self {
            sessions: MockServer::start().await,
            inference: MockServer::start().await,
        };

        Mock::given(method("GET"))
            .and(path("/api/inference/services"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"services": []})))
            .mount(&omni.sessions)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "userId": "u1",
                "sessionId": "s1",
                "token": "t1"
            })))
            .mount(&omni.sessions)
            .await;
        Mock::given(method("POST"))
            .and(path("/omni/init_sys_prompt"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&omni.inference)
            .await;

        omni
    }

    async fn mount_generate(&self) {
        Mock::given(method("POST"))
            .and(path("/omni/streaming_generate"))
            .and(body_partial_json(json!({"session_id": "s1"})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(GENERATED, "text/event-stream"))
            .expect(1)
            .mount(&self.inference)
            .await;
    }

    fn omni_config(&self) -> OmniConfig {
        OmniConfig {
            session_url: self.sessions.uri(),
            inference_url: self.inference.uri(),
            ..OmniConfig::default()
        }
    }

    fn app(&self) -> axum::Router {
        self.app_with(self.omni_config())
    }

    fn app_with(&self, omni: OmniConfig) -> axum::Router {
        let config = Config {
            server: ServerConfig {
                mode: GatewayMode::Omni,
                ..ServerConfig::default()
            },
            omni: Some(omni),
            ..Config::default()
        };
        create_router(AppState::new(config).unwrap())
    }
}

fn chat_request(body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("authorization", "Bearer sk-test")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_non_streaming_completion() {
    let omni = Omni::start().await;
    Mock::given(method("POST"))
        .and(path("/omni/streaming_prefill"))
        .and(body_partial_json(json!({
            "session_id": "s1",
            "is_last_chunk": true,
            "text": "second question"
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&omni.inference)
        .await;
    omni.mount_generate().await;

    let response = omni
        .app()
        .oneshot(chat_request(json!({
            "model": "minicpm-o-4.5",
            "messages": [
                {"role": "user", "content": "first question"},
                {"role": "assistant", "content": "first answer"},
                {"role": "user", "content": "second question"}
            ]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(json["object"], "chat.completion");
    assert_eq!(json["model"], "minicpm-o-4.5");
    assert!(json["id"].as_str().unwrap().starts_with("chatcmpl-"));
    assert_eq!(json["choices"][0]["message"]["role"], "assistant");
    assert_eq!(json["choices"][0]["message"]["content"], "Hello, world");
    assert_eq!(json["choices"][0]["finish_reason"], "stop");
    assert_eq!(json["usage"]["total_tokens"], 0);
}

#[tokio::test]
async fn test_streaming_completion() {
    let omni = Omni::start().await;
    Mock::given(method("POST"))
        .and(path("/omni/streaming_prefill"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&omni.inference)
        .await;
    omni.mount_generate().await;

    let response = omni
        .app()
        .oneshot(chat_request(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let raw = body_string(response).await;
    let events: Vec<&str> = raw
        .split("\n\n")
        .filter(|e| !e.is_empty())
        .map(|e| e.strip_prefix("data: ").unwrap())
        .collect();

    assert_eq!(events.len(), 5);
    let chunks: Vec<serde_json::Value> = events[..4]
        .iter()
        .map(|e| serde_json::from_str(e).unwrap())
        .collect();

    assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
    assert_eq!(chunks[1]["choices"][0]["delta"]["content"], "Hello");
    assert_eq!(chunks[2]["choices"][0]["delta"]["content"], ", world");
    assert_eq!(chunks[3]["choices"][0]["finish_reason"], "stop");
    assert!(chunks.iter().all(|c| c["id"] == chunks[0]["id"]));
    assert!(chunks.iter().all(|c| c["object"] == "chat.completion.chunk"));
    assert_eq!(events[4], "[DONE]");
}

#[tokio::test]
async fn test_multimodal_turn_prefilled() {
    let omni = Omni::start().await;
    Mock::given(method("POST"))
        .and(path("/omni/streaming_prefill"))
        .and(header("content-type", "application/json"))
        .and(body_partial_json(json!({
            "session_id": "s1",
            "text": "what is this",
            "image": "iVBORw0KGgo",
            "audio": "UklGRiQ"
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&omni.inference)
        .await;
    omni.mount_generate().await;

    let response = omni
        .app()
        .oneshot(chat_request(json!({
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "what is"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,iVBORw0KGgo"}},
                    {"type": "text", "text": "this"},
                    {"type": "audio_url", "audio_url": {"url": "data:audio/wav;base64,UklGRiQ"}}
                ]
            }]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_prefill_failure_is_500() {
    let omni = Omni::start().await;
    Mock::given(method("POST"))
        .and(path("/omni/streaming_prefill"))
        .respond_with(ResponseTemplate::new(500).set_body_string("decoder crashed"))
        .mount(&omni.inference)
        .await;
    Mock::given(method("POST"))
        .and(path("/omni/streaming_generate"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&omni.inference)
        .await;

    let response = omni
        .app()
        .oneshot(chat_request(json!({"messages": [{"role": "user", "content": "hi"}]})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(json["error"]["type"], "prefill_failed");
    assert!(json["detail"].as_str().unwrap().contains("decoder crashed"));
}

#[tokio::test]
async fn test_generate_failure_is_500() {
    let omni = Omni::start().await;
    Mock::given(method("POST"))
        .and(path("/omni/streaming_prefill"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&omni.inference)
        .await;
    Mock::given(method("POST"))
        .and(path("/omni/streaming_generate"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&omni.inference)
        .await;

    let response = omni
        .app()
        .oneshot(chat_request(json!({"messages": [{"role": "user", "content": "hi"}]})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(json["error"]["type"], "generate_failed");
}

#[tokio::test]
async fn test_silent_generate_times_out() {
    let omni = Omni::start().await;
    Mock::given(method("POST"))
        .and(path("/omni/streaming_prefill"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&omni.inference)
        .await;
    Mock::given(method("POST"))
        .and(path("/omni/streaming_generate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(GENERATED, "text/event-stream")
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&omni.inference)
        .await;

    let app = omni.app_with(OmniConfig {
        generate_timeout_secs: 1,
        ..omni.omni_config()
    });

    let started = Instant::now();
    let response = app
        .oneshot(chat_request(json!({"messages": [{"role": "user", "content": "hi"}]})))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(json["error"]["type"], "generate_failed");
    assert!(json["detail"].as_str().unwrap().contains("no response within 1s"));
}

#[tokio::test]
async fn test_no_user_message_is_400() {
    let omni = Omni::start().await;

    let response = omni
        .app()
        .oneshot(chat_request(json!({"messages": [{"role": "system", "content": "sys"}]})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_release_session() {
    let omni = Omni::start().await;
    Mock::given(method("POST"))
        .and(path("/omni/streaming_prefill"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&omni.inference)
        .await;
    omni.mount_generate().await;
    Mock::given(method("POST"))
        .and(path("/api/logout"))
        .and(body_partial_json(json!({"userId": "u1", "token": "t1"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&omni.sessions)
        .await;

    let app = omni.app();
    let response = app
        .clone()
        .oneshot(chat_request(json!({"messages": [{"role": "user", "content": "hi"}]})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_string(response).await;

    let release = || {
        Request::builder()
            .method("DELETE")
            .uri("/v1/session")
            .header("authorization", "Bearer sk-test")
            .body(Body::empty())
            .unwrap()
    };

    let response = app.clone().oneshot(release()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, r#"{"released":true}"#);

    let response = app.oneshot(release()).await.unwrap();
    assert_eq!(body_string(response).await, r#"{"released":false}"#);
}
