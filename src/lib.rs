//! IPTV channel relay with ranked-source failover
//!
//! Viewers tune into logical channels over HTTP. Each channel has an ordered
//! list of upstream candidates; the relay plays one of them and, when it fails
//! or its provider is at capacity, moves on to the next one without
//! disconnecting anybody. Channels playing the same upstream share a single
//! connection.
//!
//! # Architecture
//!
//! ```text
//!   viewer ──HTTP──► server ──attach──► ChannelService
//!                                           │
//!                      ┌────────────────────┼──────────────────┐
//!                      ▼                    ▼                  ▼
//!              ChannelBroadcaster   StreamSelector     SourceRegistry
//!               (state, clients)    (rank, limits)    (one per upstream)
//!                      │                                       │
//!                      └──── ChannelReader ◄── RingBuffer ◄────┘
//!                            (per viewer)    SourceBroadcaster ◄── upstream
//! ```
//!
//! # Example
//!
//! ```no_run
//! use tv_relay::{RelayConfig, RelayContext};
//!
//! # async fn run() -> tv_relay::Result<()> {
//! let config = RelayConfig::load("relay.json")?;
//! let context = RelayContext::initialize(config)?;
//! context.server()?.run().await
//! # }
//! ```

pub mod buffer;
pub mod catalog;
pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod model;
pub mod notify;
pub mod playlist;
pub mod selector;
pub mod server;
pub mod source;
pub mod stats;

pub use buffer::{BufferError, RingBuffer};
pub use channel::{ChannelService, ClientConnection, ClientGuard};
pub use config::RelayConfig;
pub use context::RelayContext;
pub use error::{Error, Result};
pub use server::{RelayServer, ServerConfig};
