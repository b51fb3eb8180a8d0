//! Channels: per-channel live state, viewers and orchestration

pub mod broadcaster;
pub mod client;
pub mod reader;
pub mod service;
pub mod status;

pub use broadcaster::{ChannelBroadcaster, ChannelState, FailoverGuard};
pub use client::{ClientConnection, ClientGuard};
pub use reader::ChannelReader;
pub use service::{
    ChannelService, ChannelServiceSettings, DEFAULT_FLAP_WINDOW, DEFAULT_MAX_FAILOVER_BACKOFF,
    MAX_SOURCE_ATTEMPTS,
};
pub use status::{ChannelStatus, UNSET_RANK};
