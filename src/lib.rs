//! minicpm-adapter - OpenAI-compatible gateway for MiniCPM-o 4.5
//!
//! This library provides the core functionality for the adapter:
//! configuration, the HTTP gateway, backend session management and the
//! omni prefill/generate client.

pub mod config;
pub mod error;
pub mod omni;
pub mod proxy;
pub mod session;

pub use config::Config;
pub use error::{Error, Result};
