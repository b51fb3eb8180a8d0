//! Stream candidates and the resolved descriptor of what is playing

use serde::{Deserialize, Serialize};

use super::profile::ExecutionProfile;

/// Identifier of an imported source file (unit of concurrency limiting)
pub type SourceFileId = i32;

/// Kind of a stream candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StreamKind {
    /// Plain upstream URL from an imported playlist
    #[default]
    Regular,
    /// Upstream URL added by hand
    User,
    /// Backed by a looping custom playlist of local files
    Movie,
    /// Intro clip or intro playlist
    Intro,
    /// Static message video (e.g. "no streams available")
    Message,
}

impl StreamKind {
    /// Whether candidates of this kind are served from a local playlist
    pub fn is_playlist_backed(self) -> bool {
        matches!(self, StreamKind::Movie | StreamKind::Intro)
    }
}

/// One ranked upstream candidate of a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub id: String,

    pub name: String,

    /// Upstream URL, or a local path for message streams
    pub url: String,

    /// Ordinal priority within the owning channel
    #[serde(default)]
    pub rank: i32,

    #[serde(default)]
    pub source_file_id: Option<SourceFileId>,

    #[serde(default)]
    pub kind: StreamKind,

    /// Per-stream user-agent override
    #[serde(default)]
    pub user_agent: Option<String>,

    /// Per-stream execution profile override
    #[serde(default)]
    pub profile_name: Option<String>,

    /// Playlist backing a Movie/Intro candidate; defaults to the stream name
    #[serde(default)]
    pub playlist: Option<String>,
}

impl Stream {
    pub fn new(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
            rank: 0,
            source_file_id: None,
            kind: StreamKind::Regular,
            user_agent: None,
            profile_name: None,
            playlist: None,
        }
    }

    pub fn rank(mut self, rank: i32) -> Self {
        self.rank = rank;
        self
    }

    pub fn kind(mut self, kind: StreamKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn source_file(mut self, id: SourceFileId) -> Self {
        self.source_file_id = Some(id);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn profile(mut self, name: impl Into<String>) -> Self {
        self.profile_name = Some(name.into());
        self
    }

    /// Whether both describe the same candidate, ignoring the per-channel rank
    pub fn same_candidate(&self, other: &Stream) -> bool {
        Stream {
            rank: other.rank,
            ..self.clone()
        } == *other
    }

    /// Name of the playlist backing this candidate
    pub fn playlist_name(&self) -> &str {
        self.playlist.as_deref().unwrap_or(&self.name)
    }
}

/// Runtime descriptor of what a channel is actually playing
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStream {
    pub id: String,
    pub name: String,
    /// Upstream URL or local file path; also the source broadcaster key
    pub url: String,
    pub profile: ExecutionProfile,
    pub user_agent: String,
    pub kind: StreamKind,
    pub source_file_id: Option<SourceFileId>,
    /// Offset into the file, for playlist items resumed mid-way
    pub start_seconds: u64,
}

impl ResolvedStream {
    /// Key under which the source broadcaster for this stream is registered
    pub fn source_key(&self) -> &str {
        &self.url
    }
}
