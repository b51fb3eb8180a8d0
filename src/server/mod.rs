//! HTTP server: viewer streaming and admin routes

pub mod config;
pub mod http;
pub mod listener;

pub use config::ServerConfig;
pub use http::{router, AppState, ServerCounters, TS_CONTENT_TYPE};
pub use listener::RelayServer;
