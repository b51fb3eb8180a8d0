//! Statistics snapshots for sources, channels and the server

use std::time::Duration;

use serde::Serialize;

use crate::model::ChannelId;

/// Per-source statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceStats {
    /// Source key (resolved URL)
    pub url: String,
    pub stream_id: String,
    pub stream_name: String,
    /// Total bytes read from upstream
    pub bytes_read: u64,
    /// Time since the upstream was opened
    pub uptime_secs: u64,
    /// Channels fed by this source
    pub subscribers: usize,
    pub failed: bool,
    /// Average bitrate since start (bits/sec)
    pub bitrate: u64,
}

impl SourceStats {
    /// Fill in the bitrate from bytes read over `duration`
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.uptime_secs = duration.as_secs();
        self.bitrate = bitrate(self.bytes_read, duration);
        self
    }
}

/// Per-channel statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelStats {
    pub channel_id: ChannelId,
    pub name: String,
    /// Idle / Active / FailingOver
    pub state: String,
    pub clients: usize,
    pub current_stream_id: Option<String>,
    pub current_stream_name: Option<String>,
    pub source_url: Option<String>,
    pub uptime_secs: u64,
}

/// Server-wide statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerStats {
    /// Viewer connections ever accepted
    pub total_connections: u64,
    /// Viewer connections currently open
    pub active_connections: u64,
    /// Viewer connections refused for capacity
    pub rejected_connections: u64,
    /// Bytes written to viewers
    pub total_bytes_sent: u64,
    pub uptime_secs: u64,
    pub channels: Vec<ChannelStats>,
    pub sources: Vec<SourceStats>,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn active_sources(&self) -> usize {
        self.sources.len()
    }
}

/// Average bits per second
pub fn bitrate(bytes: u64, duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if secs > 0 {
        (bytes * 8) / secs
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitrate() {
        // 1,000,000 bytes * 8 bits / 10 seconds = 800,000 bps
        assert_eq!(bitrate(1_000_000, Duration::from_secs(10)), 800_000);
        assert_eq!(bitrate(1_000_000, Duration::ZERO), 0);
    }

    #[test]
    fn test_source_stats_with_duration() {
        let stats = SourceStats {
            url: "http://up/a.ts".into(),
            bytes_read: 5_000_000,
            ..Default::default()
        }
        .with_duration(Duration::from_secs(20));

        assert_eq!(stats.uptime_secs, 20);
        assert_eq!(stats.bitrate, 2_000_000);
    }

    #[test]
    fn test_server_stats_counts() {
        let mut stats = ServerStats::new();
        assert_eq!(stats.active_channels(), 0);

        stats.channels.push(ChannelStats {
            channel_id: 1,
            clients: 2,
            ..Default::default()
        });
        stats.sources.push(SourceStats::default());

        assert_eq!(stats.active_channels(), 1);
        assert_eq!(stats.active_sources(), 1);
    }

    #[test]
    fn test_serializes_to_json() {
        let stats = ServerStats {
            total_connections: 3,
            ..Default::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["total_connections"], 3);
        assert!(json["channels"].as_array().unwrap().is_empty());
    }
}
