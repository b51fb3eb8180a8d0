//! Error types for the relay

use crate::buffer::BufferError;
use crate::model::{ChannelId, SourceFileId};

/// Relay error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Upstream connect or read failure; converted into failover, never shown to viewers
    #[error("upstream failure for {url}: {reason}")]
    Upstream { url: String, reason: String },

    /// Every ranked stream is limited or failed and no message fallback exists
    #[error("no viable stream for channel {channel_id}")]
    NoViableCandidate { channel_id: ChannelId },

    /// Source broadcaster creation failed on every retry attempt
    #[error("source broadcaster not found for channel {channel_id} after {attempts} attempts")]
    SourceCreationExhausted { channel_id: ChannelId, attempts: u32 },

    /// The stream's source file has no free connection slot
    #[error("source file {source_file_id} is at its connection limit")]
    SourceFileLimited { source_file_id: SourceFileId },

    #[error("channel {0} not found")]
    ChannelNotFound(ChannelId),

    #[error("client {0} not found")]
    ClientNotFound(uuid::Uuid),

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {reason}")]
    Config { reason: String },

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn upstream(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Upstream {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Whether another candidate or another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream { .. } | Self::Io(_) | Self::Http(_) => true,
            Self::NoViableCandidate { .. }
            | Self::SourceCreationExhausted { .. }
            | Self::SourceFileLimited { .. }
            | Self::ChannelNotFound(_)
            | Self::ClientNotFound(_)
            | Self::Cancelled
            | Self::Config { .. }
            | Self::Buffer(_)
            | Self::Json(_) => false,
        }
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;
