//! Channel definitions

use serde::{Deserialize, Serialize};

use super::stream::Stream;

/// Channel identifier
pub type ChannelId = i32;

/// Kind of channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Plays one of its ranked streams
    #[default]
    Regular,
    /// Composite of several child channels
    MultiView,
}

/// Logical output a viewer tunes into
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,

    pub name: String,

    /// Candidate streams, kept ordered by rank
    #[serde(default)]
    pub streams: Vec<Stream>,

    /// Channel default execution profile
    #[serde(default)]
    pub default_profile: Option<String>,

    #[serde(default)]
    pub kind: ChannelKind,

    /// Child channels composed by a MultiView channel
    #[serde(default)]
    pub children: Vec<ChannelId>,
}

impl Channel {
    pub fn new(id: ChannelId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            streams: Vec::new(),
            default_profile: None,
            kind: ChannelKind::Regular,
            children: Vec::new(),
        }
    }

    /// Add a candidate, keeping rank order
    pub fn with_stream(mut self, stream: Stream) -> Self {
        self.streams.push(stream);
        self.sort_streams();
        self
    }

    pub fn with_default_profile(mut self, name: impl Into<String>) -> Self {
        self.default_profile = Some(name.into());
        self
    }

    /// Turn this channel into a MultiView composite of `children`
    pub fn multiview(mut self, children: Vec<ChannelId>) -> Self {
        self.kind = ChannelKind::MultiView;
        self.children = children;
        self
    }

    /// Sort candidates by rank; equal ranks keep their declaration order
    pub fn sort_streams(&mut self) {
        self.streams.sort_by_key(|s| s.rank);
    }

    pub fn is_multiview(&self) -> bool {
        self.kind == ChannelKind::MultiView
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streams_sorted_by_rank() {
        let channel = Channel::new(1, "News")
            .with_stream(Stream::new("b", "B", "http://b").rank(2))
            .with_stream(Stream::new("a", "A", "http://a").rank(0))
            .with_stream(Stream::new("c", "C", "http://c").rank(1));

        let ids: Vec<_> = channel.streams.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["a", "c", "b"]);
    }

    #[test]
    fn test_multiview() {
        let channel = Channel::new(9, "Mosaic").multiview(vec![1, 2]);
        assert!(channel.is_multiview());
        assert_eq!(channel.children, vec![1, 2]);
    }
}
