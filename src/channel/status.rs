//! Mutable selection state of one channel

use crate::model::{Channel, ChannelId, ResolvedStream};

/// Rank position value meaning "nothing selected yet"
pub const UNSET_RANK: i32 = -1;

/// Per-channel selection state
///
/// Only the owning channel broadcaster mutates this, under its own lock.
/// `current_rank` is the position of the selected candidate in rank order.
#[derive(Debug, Clone)]
pub struct ChannelStatus {
    pub channel: Channel,
    pub current_rank: i32,
    /// No selection has happened since the channel started
    pub is_first: bool,
    pub played_intro: bool,
    pub current: Option<ResolvedStream>,
}

impl ChannelStatus {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            current_rank: UNSET_RANK,
            is_first: true,
            played_intro: false,
            current: None,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel.id
    }

    /// Replace the channel snapshot, keeping rank within the new candidate set
    pub fn refresh(&mut self, channel: Channel) {
        let count = channel.streams.len() as i32;
        if count == 0 || self.current_rank >= count {
            self.current_rank = UNSET_RANK;
        }
        self.channel = channel;
    }
}
