//! Relay statistics

pub mod metrics;

pub use metrics::{ChannelStats, ServerStats, SourceStats};
