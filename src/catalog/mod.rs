//! Configuration source for channels and streams
//!
//! The relay only ever reads channel and stream definitions. Persistence
//! lives elsewhere; [`StaticCatalog`] serves definitions loaded from the
//! relay configuration file.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Channel, ChannelId, Stream};

/// Read-only access to channel and stream definitions
#[async_trait]
pub trait ChannelCatalog: Send + Sync {
    /// Channel snapshot with its candidates ordered by rank
    async fn channel(&self, id: ChannelId) -> Option<Channel>;

    /// Stream by id, regardless of which channel references it
    async fn stream(&self, id: &str) -> Option<Stream>;

    /// Execution profile configured on the stream group serving `channel_id`
    async fn stream_group_profile(&self, channel_id: ChannelId) -> Option<String>;
}

/// Stream group: a named lineup of channels sharing a profile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamGroup {
    pub name: String,

    #[serde(default)]
    pub profile: Option<String>,

    #[serde(default)]
    pub channel_ids: Vec<ChannelId>,
}

/// In-memory catalog
#[derive(Debug, Default)]
pub struct StaticCatalog {
    channels: HashMap<ChannelId, Channel>,
    streams: HashMap<String, Stream>,
    group_profiles: HashMap<ChannelId, String>,
}

impl StaticCatalog {
    /// Build a catalog, validating ids and MultiView references
    pub fn new(channels: Vec<Channel>, groups: &[StreamGroup]) -> Result<Self> {
        let mut by_id = HashMap::with_capacity(channels.len());
        let mut streams = HashMap::new();

        for mut channel in channels {
            channel.sort_streams();

            // One upstream may serve several channels under one stream id
            for stream in &channel.streams {
                if let Some(existing) = streams.get(&stream.id) {
                    if !stream.same_candidate(existing) {
                        return Err(Error::config(format!(
                            "stream id `{}` is defined twice with different settings",
                            stream.id
                        )));
                    }
                } else {
                    streams.insert(stream.id.clone(), stream.clone());
                }
            }

            let id = channel.id;
            if by_id.insert(id, channel).is_some() {
                return Err(Error::config(format!("channel id {id} is defined twice")));
            }
        }

        // Children must be plain channels so composites never nest
        for channel in by_id.values() {
            for child in &channel.children {
                let valid = by_id.get(child).is_some_and(|c| !c.is_multiview());
                if !valid {
                    return Err(Error::config(format!(
                        "channel {} references invalid child channel {child}",
                        channel.id
                    )));
                }
            }
        }

        // First group listing a channel wins
        let mut group_profiles = HashMap::new();
        for group in groups {
            if let Some(profile) = &group.profile {
                for id in &group.channel_ids {
                    group_profiles.entry(*id).or_insert_with(|| profile.clone());
                }
            }
        }

        Ok(Self {
            channels: by_id,
            streams,
            group_profiles,
        })
    }

    /// Register an extra stream reachable only by id (e.g. manual overrides)
    pub fn insert_stream(&mut self, stream: Stream) {
        self.streams.insert(stream.id.clone(), stream);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[async_trait]
impl ChannelCatalog for StaticCatalog {
    async fn channel(&self, id: ChannelId) -> Option<Channel> {
        self.channels.get(&id).cloned()
    }

    async fn stream(&self, id: &str) -> Option<Stream> {
        self.streams.get(id).cloned()
    }

    async fn stream_group_profile(&self, channel_id: ChannelId) -> Option<String> {
        self.group_profiles.get(&channel_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> Vec<Channel> {
        vec![
            Channel::new(1, "One")
                .with_stream(Stream::new("s2", "S2", "http://x/2").rank(1))
                .with_stream(Stream::new("s1", "S1", "http://x/1").rank(0)),
            Channel::new(2, "Two").with_stream(Stream::new("s3", "S3", "http://x/3")),
            Channel::new(3, "Mosaic").multiview(vec![1, 2]),
        ]
    }

    #[tokio::test]
    async fn test_lookup() {
        let groups = vec![StreamGroup {
            name: "Main".into(),
            profile: Some("FFMPEG".into()),
            channel_ids: vec![1],
        }];
        let catalog = StaticCatalog::new(channels(), &groups).unwrap();

        let channel = catalog.channel(1).await.unwrap();
        assert_eq!(channel.streams[0].id, "s1");
        assert_eq!(catalog.stream("s3").await.unwrap().url, "http://x/3");
        assert!(catalog.stream("nope").await.is_none());

        assert_eq!(catalog.stream_group_profile(1).await.as_deref(), Some("FFMPEG"));
        assert!(catalog.stream_group_profile(2).await.is_none());
        assert_eq!(catalog.channel_count(), 3);
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let mut list = channels();
        list.push(Channel::new(1, "Again"));
        assert!(StaticCatalog::new(list, &[]).is_err());
    }

    #[test]
    fn test_conflicting_stream_rejected() {
        let mut list = channels();
        list.push(Channel::new(4, "Four").with_stream(Stream::new("s1", "Other", "http://y/1")));
        assert!(StaticCatalog::new(list, &[]).is_err());
    }

    #[tokio::test]
    async fn test_shared_stream_across_channels() {
        let mut list = channels();
        list.push(Channel::new(4, "Four").with_stream(Stream::new("s1", "S1", "http://x/1").rank(5)));

        let catalog = StaticCatalog::new(list, &[]).unwrap();
        assert_eq!(catalog.channel(4).await.unwrap().streams[0].id, "s1");
        assert_eq!(catalog.stream("s1").await.unwrap().url, "http://x/1");
    }

    #[test]
    fn test_invalid_child_rejected() {
        let mut list = channels();
        list.push(Channel::new(5, "Bad").multiview(vec![42]));
        assert!(StaticCatalog::new(list, &[]).is_err());
    }

    #[test]
    fn test_nested_multiview_rejected() {
        let mut list = channels();
        list.push(Channel::new(6, "Nested").multiview(vec![3]));
        assert!(StaticCatalog::new(list, &[]).is_err());

        let mut list = channels();
        list.push(Channel::new(7, "Self").multiview(vec![7]));
        assert!(StaticCatalog::new(list, &[]).is_err());
    }
}
