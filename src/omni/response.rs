//! Reshaping generated text into OpenAI chat-completion responses.

use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use serde::Serialize;

use crate::error::Result;
use crate::proxy::types::{
    ChatCompletionChunk, ChatCompletionResponse, Choice, ChunkChoice, Delta, Message, Usage,
};

/// Identity shared by every chunk of one completion.
#[derive(Debug, Clone)]
pub struct CompletionMeta {
    pub id: String,
    pub created: u64,
    pub model: String,
}

impl CompletionMeta {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: chrono::Utc::now().timestamp().max(0) as u64,
            model: model.to_string(),
        }
    }

    /// Non-streaming response carrying the full generated text.
    pub fn completion(&self, text: String) -> ChatCompletionResponse {
        ChatCompletionResponse {
            id: self.id.clone(),
            object: "chat.completion".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(text),
                finish_reason: Some("stop".to_string()),
            }],
            usage: Usage::default(),
        }
    }

    pub fn chunk(&self, delta: Delta, finish_reason: Option<&str>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_string),
            }],
        }
    }
}

/// Format a value as one SSE `data:` event.
pub fn sse_event<T: Serialize>(value: &T) -> std::io::Result<Bytes> {
    let json = serde_json::to_string(value).map_err(std::io::Error::other)?;
    Ok(Bytes::from(format!("data: {}\n\n", json)))
}

/// The stream terminator.
pub fn sse_done() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

enum Phase<S> {
    Opening(S),
    Content(S),
    Closed,
}

/// Turn text fragments into a `chat.completion.chunk` event stream.
///
/// Emits a role delta, one content delta per fragment, a final `stop` delta
/// and `[DONE]`. If the fragment stream fails the event stream ends without
/// the terminator, so the caller can tell it was cut short.
pub fn sse_stream<S>(
    meta: CompletionMeta,
    fragments: S,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static
where
    S: Stream<Item = Result<String>> + Send + Unpin + 'static,
{
    stream::unfold(Phase::Opening(fragments), move |phase| {
        let meta = meta.clone();
        async move {
            match phase {
                Phase::Opening(fragments) => {
                    let delta = Delta {
                        role: Some("assistant".to_string()),
                        content: None,
                    };
                    Some((sse_event(&meta.chunk(delta, None)), Phase::Content(fragments)))
                }
                Phase::Content(mut fragments) => match fragments.next().await {
                    Some(Ok(text)) => {
                        let delta = Delta {
                            role: None,
                            content: Some(text),
                        };
                        Some((sse_event(&meta.chunk(delta, None)), Phase::Content(fragments)))
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, id = %meta.id, "Generation stream failed");
                        None
                    }
                    None => {
                        let closing = sse_event(&meta.chunk(Delta::default(), Some("stop")))
                            .map(|event| Bytes::from([event, sse_done()].concat()));
                        Some((closing, Phase::Closed))
                    }
                },
                Phase::Closed => None,
            }
        }
    })
}
