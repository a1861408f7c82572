//! ZincServer HTTP/WebSocket server
//!
//! This crate wires the storage engine to the network:
//! - Datastore registry and configuration lookup
//! - Access keys, profiles and rate limiting
//! - HTTP handlers, CORS and WebSocket update streaming
//! - Random fixture generation

pub mod access;
pub mod error;
pub mod generate;
pub mod handlers;
pub mod rate_limiter;
pub mod registry;
pub mod websocket;

pub use error::ApiError;
pub use handlers::{AppState, router};
pub use registry::ServerRegistry;
