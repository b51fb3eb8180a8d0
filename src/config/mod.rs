//! Relay configuration
//!
//! The whole relay is described by one JSON document. Every section is
//! optional; missing fields take their defaults.
//!
//! ```json
//! {
//!   "server": { "bind": "0.0.0.0:8080", "max_connections": 100 },
//!   "streaming": { "intro_policy": "Once", "retry_delay_ms": 500 },
//!   "profiles": { "Default": { "command": "", "arguments": "" } },
//!   "source_files": [{ "id": 1, "name": "provider", "max_streams": 2 }],
//!   "channels": [{ "id": 1, "name": "News", "streams": [
//!     { "id": "a", "name": "News HD", "url": "http://up/a.ts", "source_file_id": 1 }
//!   ]}]
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::{StaticCatalog, StreamGroup};
use crate::channel::{ChannelServiceSettings, MAX_SOURCE_ATTEMPTS};
use crate::error::{Error, Result};
use crate::model::{Channel, CommandProfile, ProfileTable, Stream, StreamKind};
use crate::playlist::{Playlist, StaticPlaylists};
use crate::selector::{IntroPolicy, SelectionPolicy, SourceFile, DEFAULT_USER_AGENT};
use crate::server::ServerConfig;
use crate::source::{SourceSettings, DEFAULT_CHUNK_SIZE};

/// Listener options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,

    /// Concurrent viewers; 0 means unlimited
    pub max_connections: usize,

    /// End a viewer's response after this long without data; 0 disables
    pub client_read_timeout_ms: u64,

    /// Upper bound on failover detection latency
    pub poll_interval_ms: u64,

    /// Interval of the periodic statistics log line
    pub stats_interval_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            max_connections: 0,
            client_read_timeout_ms: 60_000,
            poll_interval_ms: 1_000,
            stats_interval_ms: 60_000,
        }
    }
}

/// Streaming and selection options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingSection {
    /// Ring buffer capacity per source, in bytes
    pub buffer_capacity: usize,
    pub intro_policy: IntroPolicy,
    pub show_message_videos: bool,
    pub default_user_agent: String,
    pub default_profile_name: String,
    /// Profile used for playlists, intros and message videos
    pub local_profile_name: String,
    /// Pause between source creation attempts
    pub retry_delay_ms: u64,
    /// A failover this soon after the previous switch backs off
    pub flap_window_ms: u64,
    pub max_failover_backoff_ms: u64,
    /// Fail a source after this long without upstream data; 0 disables
    pub upstream_read_timeout_ms: u64,
    pub upstream_connect_timeout_ms: u64,
    /// Read size for files and process pipes
    pub chunk_size: usize,
}

impl Default for StreamingSection {
    fn default() -> Self {
        Self {
            buffer_capacity: 4 * 1024 * 1024,
            intro_policy: IntroPolicy::None,
            show_message_videos: false,
            default_user_agent: DEFAULT_USER_AGENT.to_string(),
            default_profile_name: "Default".to_string(),
            local_profile_name: "Default".to_string(),
            retry_delay_ms: 500,
            flap_window_ms: 10_000,
            max_failover_backoff_ms: 30_000,
            upstream_read_timeout_ms: 30_000,
            upstream_connect_timeout_ms: 10_000,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Complete relay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerSection,
    pub streaming: StreamingSection,
    pub profiles: HashMap<String, CommandProfile>,
    pub source_files: Vec<SourceFile>,
    pub stream_groups: Vec<StreamGroup>,
    pub channels: Vec<Channel>,
    pub playlists: Vec<Playlist>,
    /// Played when no candidate is viable and message videos are enabled
    pub message_no_streams_left: Option<Stream>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert("Default".to_string(), CommandProfile::direct());

        Self {
            server: ServerSection::default(),
            streaming: StreamingSection::default(),
            profiles,
            source_files: Vec::new(),
            stream_groups: Vec::new(),
            channels: Vec::new(),
            playlists: Vec::new(),
            message_no_streams_left: None,
        }
    }
}

impl RelayConfig {
    /// Read and validate a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = Self::from_json(&text)?;

        tracing::info!(
            path = %path.display(),
            channels = config.channels.len(),
            profiles = config.profiles.len(),
            source_files = config.source_files.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check cross references that serde cannot
    pub fn validate(&self) -> Result<()> {
        if self.streaming.buffer_capacity == 0 {
            return Err(Error::config("streaming.buffer_capacity must be greater than 0"));
        }

        self.bind_addr()?;
        self.profile_table()?;

        let mut source_file_ids = HashSet::new();
        for file in &self.source_files {
            if !source_file_ids.insert(file.id) {
                return Err(Error::config(format!("source file id {} is defined twice", file.id)));
            }
        }

        // Stream id reuse across channels is checked by the catalog below
        for channel in &self.channels {
            for stream in &channel.streams {
                if let Some(id) = stream.source_file_id {
                    if !source_file_ids.contains(&id) {
                        return Err(Error::config(format!(
                            "stream `{}` references unknown source file {id}",
                            stream.id
                        )));
                    }
                }
                if stream.kind.is_playlist_backed()
                    && !self.playlists.iter().any(|p| p.name == stream.playlist_name())
                {
                    tracing::warn!(
                        stream_id = %stream.id,
                        playlist = %stream.playlist_name(),
                        "Stream references an unknown playlist and will be skipped"
                    );
                }
            }
        }

        if let Some(message) = &self.message_no_streams_left {
            if message.kind != StreamKind::Message {
                return Err(Error::config("message_no_streams_left must be a Message stream"));
            }
        }

        self.catalog()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .map_err(|e| Error::config(format!("invalid server.bind `{}`: {e}", self.server.bind)))
    }

    /// Profile table requiring the default and local profiles
    pub fn profile_table(&self) -> Result<ProfileTable> {
        ProfileTable::new(
            self.profiles.clone(),
            &[
                self.streaming.default_profile_name.as_str(),
                self.streaming.local_profile_name.as_str(),
            ],
        )
    }

    pub fn catalog(&self) -> Result<StaticCatalog> {
        let mut catalog = StaticCatalog::new(self.channels.clone(), &self.stream_groups)?;
        if let Some(message) = &self.message_no_streams_left {
            catalog.insert_stream(message.clone());
        }
        Ok(catalog)
    }

    pub fn playlists(&self) -> StaticPlaylists {
        StaticPlaylists::new(self.playlists.clone())
    }

    pub fn selection_policy(&self) -> SelectionPolicy {
        let streaming = &self.streaming;
        SelectionPolicy {
            intro_policy: streaming.intro_policy,
            show_message_videos: streaming.show_message_videos,
            default_user_agent: streaming.default_user_agent.clone(),
            default_profile_name: streaming.default_profile_name.clone(),
            local_profile_name: streaming.local_profile_name.clone(),
        }
    }

    pub fn source_settings(&self) -> SourceSettings {
        SourceSettings {
            buffer_capacity: self.streaming.buffer_capacity,
            read_timeout: Duration::from_millis(self.streaming.upstream_read_timeout_ms),
        }
    }

    pub fn service_settings(&self) -> ChannelServiceSettings {
        ChannelServiceSettings {
            retry_delay: Duration::from_millis(self.streaming.retry_delay_ms),
            max_attempts: MAX_SOURCE_ATTEMPTS,
            poll_interval: Duration::from_millis(self.server.poll_interval_ms.max(1)),
            flap_window: Duration::from_millis(self.streaming.flap_window_ms),
            max_failover_backoff: Duration::from_millis(self.streaming.max_failover_backoff_ms),
        }
    }

    pub fn server_config(&self) -> Result<ServerConfig> {
        Ok(ServerConfig::with_addr(self.bind_addr()?)
            .max_connections(self.server.max_connections)
            .client_read_timeout(Duration::from_millis(self.server.client_read_timeout_ms))
            .poll_interval(Duration::from_millis(self.server.poll_interval_ms.max(1)))
            .stats_interval(Duration::from_millis(self.server.stats_interval_ms)))
    }
}
