//! HTTP client for the omni prefill/generate inference service.

use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::extract::TurnInput;
use super::stream::{SseDecoder, StreamRecord};
use crate::config::OmniConfig;
use crate::error::{Error, Result};

/// Fragments buffered between the backend reader and the caller.
const FRAGMENT_BUFFER: usize = 64;

#[derive(Serialize)]
struct InitSysPromptRequest<'a> {
    session_id: &'a str,
    system_prompt: &'a str,
    max_turns: u32,
}

#[derive(Serialize)]
struct PrefillRequest<'a> {
    session_id: &'a str,
    is_last_chunk: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio: Option<&'a str>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    session_id: &'a str,
}

/// Client for `/omni/*` endpoints.
#[derive(Clone)]
pub struct OmniClient {
    http: Client,
    base_url: String,
    init_timeout: Duration,
    prefill_timeout: Duration,
    generate_timeout: Duration,
    system_prompt: String,
    max_turns: u32,
}

impl OmniClient {
    pub fn new(http: Client, config: &OmniConfig) -> Self {
        Self {
            http,
            base_url: config.inference_url.trim_end_matches('/').to_string(),
            init_timeout: config.init_timeout(),
            prefill_timeout: config.prefill_timeout(),
            generate_timeout: config.generate_timeout(),
            system_prompt: config.system_prompt.clone(),
            max_turns: config.max_turns,
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/omni/{}", self.base_url, endpoint)
    }

    /// POST a JSON body and require a success status.
    ///
    /// Failures come back as a human-readable reason.
    async fn post_checked<T: Serialize>(
        &self,
        endpoint: &str,
        body: &T,
        timeout: Option<Duration>,
    ) -> std::result::Result<reqwest::Response, String> {
        let mut request = self.http.post(self.url(endpoint)).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("status {}: {}", status, body));
        }
        Ok(response)
    }

    /// Register the default system prompt for a freshly created session.
    #[tracing::instrument(skip(self))]
    pub async fn init_system_prompt(&self, session_id: &str) -> Result<()> {
        let body = InitSysPromptRequest {
            session_id,
            system_prompt: &self.system_prompt,
            max_turns: self.max_turns,
        };

        self.post_checked("init_sys_prompt", &body, Some(self.init_timeout))
            .await
            .map_err(|reason| {
                tracing::error!(reason = %reason, "System prompt initialization failed");
                Error::Session(format!("Session initialization failed: {}", reason))
            })?;

        tracing::info!("Session initialized");
        Ok(())
    }

    /// Submit the turn's content as the final chunk of the turn.
    #[tracing::instrument(skip(self, turn), fields(
        has_text = !turn.text.is_empty(),
        has_image = turn.image.is_some(),
        has_audio = turn.audio.is_some(),
    ))]
    pub async fn prefill(&self, session_id: &str, turn: &TurnInput) -> Result<()> {
        let body = PrefillRequest {
            session_id,
            is_last_chunk: true,
            text: Some(turn.text.as_str()).filter(|t| !t.is_empty()),
            image: turn.image.as_deref(),
            audio: turn.audio.as_deref(),
        };

        self.post_checked("streaming_prefill", &body, Some(self.prefill_timeout))
            .await
            .map_err(|reason| {
                tracing::error!(reason = %reason, "Prefill failed");
                Error::Prefill(reason)
            })?;
        Ok(())
    }

    /// Open the generate stream for a session.
    ///
    /// The response headers must arrive within the generate timeout; the
    /// body itself has no total deadline.
    #[tracing::instrument(skip(self))]
    pub async fn generate(&self, session_id: &str) -> Result<reqwest::Response> {
        let body = GenerateRequest { session_id };
        let send = self.post_checked("streaming_generate", &body, None);

        let outcome = match tokio::time::timeout(self.generate_timeout, send).await {
            Ok(outcome) => outcome,
            Err(_) => Err(format!(
                "no response within {}s",
                self.generate_timeout.as_secs()
            )),
        };
        outcome.map_err(|reason| {
            tracing::error!(reason = %reason, "Generate request failed");
            Error::Generate(reason)
        })
    }

    /// Longest silence tolerated between generate body reads.
    pub fn generate_timeout(&self) -> Duration {
        self.generate_timeout
    }
}

/// Forward the text fragments of a generate response as a lazy stream.
///
/// A reader task decodes the backend body; dropping the returned stream
/// stops the task and closes the backend connection. Transport errors, and
/// a body silent for longer than `idle`, are delivered as a final `Err` item.
pub fn text_fragments(
    response: reqwest::Response,
    idle: Duration,
) -> ReceiverStream<Result<String>> {
    let (tx, rx) = mpsc::channel(FRAGMENT_BUFFER);

    tokio::spawn(async move {
        let mut decoder = SseDecoder::new();
        let mut body = response.bytes_stream();

        loop {
            let chunk = match tokio::time::timeout(idle, body.next()).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(_) => {
                    tracing::error!(idle_secs = idle.as_secs(), "Generate stream stalled");
                    let reason = format!("stream idle for {}s", idle.as_secs());
                    let _ = tx.send(Err(Error::Generate(reason))).await;
                    decoder.summary().log();
                    return;
                }
            };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::error!(error = %e, "Generate stream broke");
                    let _ = tx.send(Err(Error::Generate(e.to_string()))).await;
                    decoder.summary().log();
                    return;
                }
            };

            if !forward_text(&tx, decoder.push(&chunk)).await {
                tracing::debug!("Caller went away; closing generate stream");
                return;
            }
            if decoder.is_finished() {
                break;
            }
        }

        forward_text(&tx, decoder.finish()).await;
        decoder.summary().log();
    });

    ReceiverStream::new(rx)
}

/// Send the text records; `false` once the receiver is gone.
async fn forward_text(tx: &mpsc::Sender<Result<String>>, records: Vec<StreamRecord>) -> bool {
    for record in records {
        if let StreamRecord::Text(text) = record {
            if tx.send(Ok(text)).await.is_err() {
                return false;
            }
        }
    }
    true
}

/// Drain a fragment stream into one string.
pub async fn collect_text<S>(mut fragments: S) -> Result<String>
where
    S: futures::Stream<Item = Result<String>> + Unpin,
{
    let mut text = String::new();
    while let Some(fragment) = fragments.next().await {
        text.push_str(&fragment?);
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn collect_text_concatenates_in_order() {
        let fragments = stream::iter(vec![
            Ok("Hel".to_string()),
            Ok("lo".to_string()),
            Ok(", world".to_string()),
        ]);
        assert_eq!(collect_text(fragments).await.unwrap(), "Hello, world");
    }

    #[tokio::test]
    async fn collect_text_propagates_errors() {
        let fragments = stream::iter(vec![
            Ok("partial".to_string()),
            Err(Error::Generate("connection reset".to_string())),
        ]);
        assert!(matches!(
            collect_text(fragments).await,
            Err(Error::Generate(_))
        ));
    }

    #[test]
    fn prefill_body_omits_absent_media() {
        let body = PrefillRequest {
            session_id: "s1",
            is_last_chunk: true,
            text: Some("hi"),
            image: None,
            audio: None,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"session_id": "s1", "is_last_chunk": true, "text": "hi"})
        );
    }
}
