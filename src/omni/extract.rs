//! Turn extraction from OpenAI-style message content.

use crate::proxy::types::{ContentPart, Message, MessageContent};

/// Text and media submitted to the inference service for one turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnInput {
    pub text: String,
    /// Base64 image payload, without the `data:` prefix.
    pub image: Option<String>,
    /// Base64 audio payload, without the `data:` prefix.
    pub audio: Option<String>,
}

impl TurnInput {
    /// Extract the turn from the last user message.
    pub fn from_messages(messages: &[Message]) -> Option<Self> {
        messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| Self::from_content(&m.content))
    }

    /// Split message content into text and media.
    ///
    /// Text parts are joined with a single space. Media is only accepted as
    /// inline `data:` URLs; when several are present the last one wins.
    pub fn from_content(content: &MessageContent) -> Self {
        let parts = match content {
            MessageContent::Text(text) => {
                return Self {
                    text: text.clone(),
                    ..Self::default()
                }
            }
            MessageContent::Parts(parts) => parts,
        };

        let mut texts = Vec::new();
        let mut turn = Self::default();

        for part in parts {
            match part {
                ContentPart::Text { text } => texts.push(text.as_str()),
                ContentPart::ImageUrl { image_url } => {
                    if let Some(payload) = data_url_payload(&image_url.url, "image") {
                        turn.image = Some(payload);
                    }
                }
                ContentPart::AudioUrl { audio_url } => {
                    if let Some(payload) = data_url_payload(&audio_url.url, "audio") {
                        turn.audio = Some(payload);
                    }
                }
                ContentPart::Unsupported => {
                    tracing::debug!("Ignoring unsupported content part");
                }
            }
        }

        turn.text = texts.join(" ");
        turn
    }
}

/// Payload of a `data:<kind>/...` URL: everything after the first comma.
fn data_url_payload(url: &str, kind: &str) -> Option<String> {
    if !url
        .strip_prefix("data:")
        .is_some_and(|rest| rest.starts_with(kind))
    {
        tracing::debug!(kind, "Ignoring non-inline media URL");
        return None;
    }

    let payload = url.split_once(',').map(|(_, data)| data).unwrap_or(url);
    Some(payload.to_string())
}
