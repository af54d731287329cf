//! HTTP/JSON rendering of the engine's query/command API, plus a regime
//! stream over WebSocket.

pub mod data_health;
pub mod handlers;
pub mod server;
pub mod websocket;

pub use data_health::{DataHealthResponse, SourceHealth};
pub use handlers::{ApiError, ErrorBody};
pub use server::ApiServer;
