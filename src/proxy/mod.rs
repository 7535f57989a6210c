//! HTTP gateway module.
//!
//! This module provides the OpenAI-compatible HTTP API that forwards
//! requests to llama-server, or to the omni adapter in omni mode.

mod handlers;
mod server;
pub mod types;

pub use handlers::{api_key_from_headers, HealthReport, DEFAULT_API_KEY};
pub use server::{create_router, run_server, AppState, RequestId, REQUEST_ID_HEADER};
pub use types::{ChatCompletionRequest, ChatCompletionResponse, Message};
