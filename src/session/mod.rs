//! Backend session management for the omni gateway mode.

pub mod backend;
mod manager;
pub mod store;

pub use manager::SessionManager;
pub use store::{Session, SessionOrigin, SessionStore};
