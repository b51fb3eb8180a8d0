//! Next-candidate selection
//!
//! Selection order for one call:
//!
//! 1. An explicit override stream id, looked up directly.
//! 2. An intro clip on the first selection of a channel, if the policy allows.
//! 3. Ranked candidates starting after the current rank, each visited once,
//!    skipping those whose source file is at capacity.
//! 4. The cached "no streams left" message, if message videos are enabled.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::catalog::ChannelCatalog;
use crate::channel::ChannelStatus;
use crate::model::{
    ChannelId, ExecutionProfile, ProfileResolver, ResolvedStream, Stream, StreamKind,
};
use crate::playlist::PlaylistProvider;

use super::limits::StreamLimits;

/// User agent used when neither the stream nor the configuration sets one
pub const DEFAULT_USER_AGENT: &str = "VLC/3.0.20-git LibVLC/3.0.20-git";

/// When intro clips play
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IntroPolicy {
    #[default]
    None,
    /// First start of each channel within the process
    Once,
    /// Every fresh start of a channel
    Always,
}

/// Tunables consulted on every selection
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionPolicy {
    pub intro_policy: IntroPolicy,
    pub show_message_videos: bool,
    pub default_user_agent: String,
    pub default_profile_name: String,
    /// Profile used to play local files (playlists, intros, messages)
    pub local_profile_name: String,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            intro_policy: IntroPolicy::None,
            show_message_videos: false,
            default_user_agent: DEFAULT_USER_AGENT.to_string(),
            default_profile_name: "Default".to_string(),
            local_profile_name: "Default".to_string(),
        }
    }
}

/// Chooses what a channel plays next
pub struct StreamSelector {
    catalog: Arc<dyn ChannelCatalog>,
    profiles: Arc<dyn ProfileResolver>,
    playlists: Arc<dyn PlaylistProvider>,
    limits: Arc<dyn StreamLimits>,
    policy: RwLock<SelectionPolicy>,
    message_stream: RwLock<Option<Stream>>,
    intro_played: Mutex<HashSet<ChannelId>>,
}

impl StreamSelector {
    pub fn new(
        catalog: Arc<dyn ChannelCatalog>,
        profiles: Arc<dyn ProfileResolver>,
        playlists: Arc<dyn PlaylistProvider>,
        limits: Arc<dyn StreamLimits>,
        policy: SelectionPolicy,
    ) -> Self {
        Self {
            catalog,
            profiles,
            playlists,
            limits,
            policy: RwLock::new(policy),
            message_stream: RwLock::new(None),
            intro_played: Mutex::new(HashSet::new()),
        }
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy.read().clone()
    }

    /// Swap the policy; takes effect on the next selection
    pub fn update_policy(&self, policy: SelectionPolicy) {
        *self.policy.write() = policy;
    }

    /// Cache the stream played when no candidate is viable
    pub fn set_message_stream(&self, stream: Option<Stream>) {
        *self.message_stream.write() = stream;
    }

    /// Pick the next stream for a channel
    ///
    /// Returns `None` when an override id is unknown, or when no candidate is
    /// viable and no message fallback applies.
    pub async fn select_next(
        &self,
        status: &mut ChannelStatus,
        override_stream_id: Option<&str>,
    ) -> Option<ResolvedStream> {
        let policy = self.policy();
        let channel_id = status.channel_id();

        if let Some(stream_id) = override_stream_id {
            return self.select_override(status, stream_id, &policy).await;
        }

        if status.is_first {
            status.is_first = false;
            if let Some(intro) = self.select_intro(channel_id, &policy) {
                status.played_intro = true;
                tracing::info!(
                    channel_id = channel_id,
                    intro = %intro.name,
                    "Playing channel intro"
                );
                return Some(intro);
            }
        }

        let count = status.channel.streams.len();
        if count > 0 {
            let start = (status.current_rank + 1).rem_euclid(count as i32) as usize;

            for offset in 0..count {
                let index = (start + offset) % count;
                let stream = &status.channel.streams[index];

                if self.limits.is_limited(stream) {
                    tracing::debug!(
                        channel_id = channel_id,
                        stream_id = %stream.id,
                        source_file_id = ?stream.source_file_id,
                        "Skipping limited stream"
                    );
                    continue;
                }

                let Some(resolved) = self.resolve(channel_id, stream, &policy).await else {
                    continue;
                };

                status.current_rank = index as i32;
                tracing::debug!(
                    channel_id = channel_id,
                    stream_id = %resolved.id,
                    rank = index,
                    "Selected stream"
                );
                return Some(resolved);
            }
        }

        if policy.show_message_videos {
            if let Some(message) = self.message_stream.read().clone() {
                tracing::warn!(
                    channel_id = channel_id,
                    candidates = count,
                    "No viable stream, playing message video"
                );
                return Some(self.resolve_local(
                    &message,
                    StreamKind::Message,
                    &message.name,
                    &message.url,
                    0,
                    &policy,
                ));
            }
        }

        tracing::warn!(
            channel_id = channel_id,
            candidates = count,
            "No viable stream"
        );
        None
    }

    async fn select_override(
        &self,
        status: &mut ChannelStatus,
        stream_id: &str,
        policy: &SelectionPolicy,
    ) -> Option<ResolvedStream> {
        let channel_id = status.channel_id();

        let Some(stream) = self.catalog.stream(stream_id).await else {
            tracing::warn!(
                channel_id = channel_id,
                stream_id = %stream_id,
                "Override stream not found"
            );
            return None;
        };

        let resolved = self.resolve(channel_id, &stream, policy).await?;

        if let Some(index) = status.channel.streams.iter().position(|s| s.id == stream.id) {
            status.current_rank = index as i32;
        }
        status.is_first = false;

        tracing::info!(
            channel_id = channel_id,
            stream_id = %resolved.id,
            "Selected override stream"
        );
        Some(resolved)
    }

    fn select_intro(&self, channel_id: ChannelId, policy: &SelectionPolicy) -> Option<ResolvedStream> {
        match policy.intro_policy {
            IntroPolicy::None => return None,
            IntroPolicy::Once if self.intro_played.lock().contains(&channel_id) => return None,
            IntroPolicy::Once | IntroPolicy::Always => {}
        }

        let item = self.playlists.random_intro(channel_id)?;
        self.intro_played.lock().insert(channel_id);

        Some(ResolvedStream {
            id: format!("intro:{}", item.title),
            name: item.title,
            url: item.path,
            profile: self.local_profile(policy),
            user_agent: policy.default_user_agent.clone(),
            kind: StreamKind::Intro,
            source_file_id: None,
            start_seconds: 0,
        })
    }

    async fn resolve(
        &self,
        channel_id: ChannelId,
        stream: &Stream,
        policy: &SelectionPolicy,
    ) -> Option<ResolvedStream> {
        match stream.kind {
            StreamKind::Movie | StreamKind::Intro => {
                let playlist = stream.playlist_name();
                let Some((item, elapsed)) = self.playlists.current_item(playlist) else {
                    tracing::warn!(
                        channel_id = channel_id,
                        stream_id = %stream.id,
                        playlist = %playlist,
                        "Playlist has nothing to play"
                    );
                    return None;
                };

                // Intro candidates in the ranked list play like any custom playlist
                let name = if stream.kind == StreamKind::Intro {
                    playlist.to_string()
                } else {
                    item.title.clone()
                };
                Some(self.resolve_local(stream, StreamKind::Movie, &name, &item.path, elapsed, policy))
            }
            StreamKind::Message => Some(self.resolve_local(
                stream,
                StreamKind::Message,
                &stream.name,
                &stream.url,
                0,
                policy,
            )),
            StreamKind::Regular | StreamKind::User => {
                let profile = self.resolve_profile(channel_id, stream, policy).await;
                Some(ResolvedStream {
                    id: stream.id.clone(),
                    name: stream.name.clone(),
                    url: stream.url.clone(),
                    profile,
                    user_agent: stream
                        .user_agent
                        .clone()
                        .filter(|ua| !ua.is_empty())
                        .unwrap_or_else(|| policy.default_user_agent.clone()),
                    kind: stream.kind,
                    source_file_id: stream.source_file_id,
                    start_seconds: 0,
                })
            }
        }
    }

    fn resolve_local(
        &self,
        stream: &Stream,
        kind: StreamKind,
        name: &str,
        path: &str,
        start_seconds: u64,
        policy: &SelectionPolicy,
    ) -> ResolvedStream {
        ResolvedStream {
            id: stream.id.clone(),
            name: name.to_string(),
            url: path.to_string(),
            profile: self.local_profile(policy),
            user_agent: policy.default_user_agent.clone(),
            kind,
            source_file_id: None,
            start_seconds,
        }
    }

    /// Stream profile, then stream group, then channel default, then global default
    async fn resolve_profile(
        &self,
        channel_id: ChannelId,
        stream: &Stream,
        policy: &SelectionPolicy,
    ) -> ExecutionProfile {
        let group_profile = self.catalog.stream_group_profile(channel_id).await;
        let channel_default = self
            .catalog
            .channel(channel_id)
            .await
            .and_then(|c| c.default_profile);

        let names = [
            stream.profile_name.as_deref(),
            group_profile.as_deref(),
            channel_default.as_deref(),
            Some(policy.default_profile_name.as_str()),
        ];

        for name in names.into_iter().flatten() {
            if let Some(profile) = self.profiles.profile(name) {
                return profile;
            }
            tracing::debug!(stream_id = %stream.id, profile = %name, "Profile not defined, falling back");
        }

        ExecutionProfile::direct(policy.default_profile_name.as_str())
    }

    fn local_profile(&self, policy: &SelectionPolicy) -> ExecutionProfile {
        self.profiles
            .profile(&policy.local_profile_name)
            .unwrap_or_else(|| ExecutionProfile::direct(policy.local_profile_name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::catalog::{StaticCatalog, StreamGroup};
    use crate::channel::status::UNSET_RANK;
    use crate::model::{Channel, CommandProfile, ProfileTable, SourceFileId};
    use crate::playlist::{Playlist, PlaylistItem, StaticPlaylists};

    /// Limits double with a fixed set of exhausted source files
    #[derive(Default)]
    struct FixedLimits {
        limited: HashSet<SourceFileId>,
        checks: AtomicUsize,
    }

    impl StreamLimits for FixedLimits {
        fn limits(&self, source_file_id: SourceFileId) -> (u32, u32) {
            self.checks.fetch_add(1, Ordering::SeqCst);
            if self.limited.contains(&source_file_id) {
                (1, 1)
            } else {
                (0, 1)
            }
        }
    }

    fn profiles() -> ProfileTable {
        let mut map = HashMap::new();
        map.insert("Default".to_string(), CommandProfile::direct());
        map.insert(
            "Local".to_string(),
            CommandProfile::new("ffmpeg", "-ss {startSeconds} -re -i {streamUrl} -f mpegts pipe:1"),
        );
        map.insert(
            "Group".to_string(),
            CommandProfile::new("ffmpeg", "-i {streamUrl} -c copy -f mpegts pipe:1"),
        );
        map.insert(
            "Custom".to_string(),
            CommandProfile::new("streamlink", "{streamUrl} best -O"),
        );
        ProfileTable::new(map, &["Default", "Local"]).unwrap()
    }

    fn item(title: &str) -> PlaylistItem {
        PlaylistItem {
            title: title.into(),
            path: format!("/media/{title}.ts"),
            duration_secs: 0,
        }
    }

    fn playlists(with_intro: bool) -> StaticPlaylists {
        let mut lists = vec![Playlist {
            name: "Movies".into(),
            intro: false,
            items: vec![item("Feature")],
        }];
        if with_intro {
            lists.push(Playlist {
                name: "Intros".into(),
                intro: true,
                items: vec![item("Welcome")],
            });
        }
        StaticPlaylists::new(lists)
    }

    fn channel() -> Channel {
        Channel::new(1, "News")
            .with_stream(Stream::new("a", "A", "http://up/a").rank(0).source_file(10))
            .with_stream(Stream::new("b", "B", "http://up/b").rank(1).source_file(11))
            .with_stream(Stream::new("c", "C", "http://up/c").rank(2).source_file(12))
    }

    struct Fixture {
        selector: StreamSelector,
        limits: Arc<FixedLimits>,
    }

    fn fixture(
        channels: Vec<Channel>,
        groups: &[StreamGroup],
        limited: &[SourceFileId],
        policy: SelectionPolicy,
        with_intro: bool,
    ) -> Fixture {
        let limits = Arc::new(FixedLimits {
            limited: limited.iter().copied().collect(),
            checks: AtomicUsize::new(0),
        });
        let selector = StreamSelector::new(
            Arc::new(StaticCatalog::new(channels, groups).unwrap()),
            Arc::new(profiles()),
            Arc::new(playlists(with_intro)),
            limits.clone(),
            policy,
        );
        Fixture { selector, limits }
    }

    fn policy() -> SelectionPolicy {
        SelectionPolicy {
            local_profile_name: "Local".into(),
            ..SelectionPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_rotation_and_wraparound() {
        let two = Channel::new(1, "Two")
            .with_stream(Stream::new("a", "A", "http://up/a").rank(0))
            .with_stream(Stream::new("b", "B", "http://up/b").rank(1));
        let f = fixture(vec![two.clone()], &[], &[], policy(), false);
        let mut status = ChannelStatus::new(two);
        status.is_first = false;
        status.current_rank = 0;

        let next = f.selector.select_next(&mut status, None).await.unwrap();
        assert_eq!(next.id, "b");
        assert_eq!(status.current_rank, 1);

        let wrapped = f.selector.select_next(&mut status, None).await.unwrap();
        assert_eq!(wrapped.id, "a");
        assert_eq!(status.current_rank, 0);
    }

    #[tokio::test]
    async fn test_first_selection_starts_at_lowest_rank() {
        let f = fixture(vec![channel()], &[], &[], policy(), false);
        let mut status = ChannelStatus::new(channel());

        let first = f.selector.select_next(&mut status, None).await.unwrap();
        assert_eq!(first.id, "a");
        assert_eq!(first.kind, StreamKind::Regular);
        assert_eq!(first.user_agent, DEFAULT_USER_AGENT);
        assert!(!status.is_first);
        assert!(!status.played_intro);
    }

    #[tokio::test]
    async fn test_skips_limited_candidates() {
        let f = fixture(vec![channel()], &[], &[10, 11], policy(), false);
        let mut status = ChannelStatus::new(channel());

        let selected = f.selector.select_next(&mut status, None).await.unwrap();
        assert_eq!(selected.id, "c");
        assert_eq!(status.current_rank, 2);
    }

    #[tokio::test]
    async fn test_all_limited_visits_each_once() {
        let f = fixture(vec![channel()], &[], &[10, 11, 12], policy(), false);
        let mut status = ChannelStatus::new(channel());

        assert!(f.selector.select_next(&mut status, None).await.is_none());
        assert_eq!(f.limits.checks.load(Ordering::SeqCst), 3);
        assert_eq!(status.current_rank, UNSET_RANK);
    }

    #[tokio::test]
    async fn test_message_fallback_when_all_limited() {
        let f = fixture(vec![channel()], &[], &[10, 11, 12], policy(), false);
        let mut status = ChannelStatus::new(channel());

        assert!(f.selector.select_next(&mut status, None).await.is_none());

        f.selector.set_message_stream(Some(
            Stream::new("msg", "No Streams Left", "/media/no_streams.ts").kind(StreamKind::Message),
        ));
        // Cached message alone is not enough without the policy switch
        assert!(f.selector.select_next(&mut status, None).await.is_none());

        f.selector.update_policy(SelectionPolicy {
            show_message_videos: true,
            ..policy()
        });
        let message = f.selector.select_next(&mut status, None).await.unwrap();
        assert_eq!(message.kind, StreamKind::Message);
        assert_eq!(message.url, "/media/no_streams.ts");
        assert_eq!(message.profile.name, "Local");
    }

    #[tokio::test]
    async fn test_intro_once_then_regular() {
        let intro_policy = SelectionPolicy {
            intro_policy: IntroPolicy::Once,
            ..policy()
        };
        let f = fixture(vec![channel()], &[], &[], intro_policy, true);
        let mut status = ChannelStatus::new(channel());

        let intro = f.selector.select_next(&mut status, None).await.unwrap();
        assert_eq!(intro.kind, StreamKind::Intro);
        assert_eq!(intro.name, "Welcome");
        assert_eq!(intro.profile.name, "Local");
        assert!(status.played_intro);
        assert!(!status.is_first);

        let regular = f.selector.select_next(&mut status, None).await.unwrap();
        assert_eq!(regular.kind, StreamKind::Regular);
        assert_eq!(regular.id, "a");

        // A fresh start of the same channel does not replay a once-only intro
        let mut restarted = ChannelStatus::new(channel());
        let again = f.selector.select_next(&mut restarted, None).await.unwrap();
        assert_eq!(again.id, "a");
        assert!(!restarted.played_intro);
    }

    #[tokio::test]
    async fn test_intro_always_replays_on_fresh_start() {
        let intro_policy = SelectionPolicy {
            intro_policy: IntroPolicy::Always,
            ..policy()
        };
        let f = fixture(vec![channel()], &[], &[], intro_policy, true);

        for _ in 0..2 {
            let mut status = ChannelStatus::new(channel());
            let intro = f.selector.select_next(&mut status, None).await.unwrap();
            assert_eq!(intro.kind, StreamKind::Intro);
        }
    }

    #[tokio::test]
    async fn test_intro_policy_without_clips() {
        let intro_policy = SelectionPolicy {
            intro_policy: IntroPolicy::Once,
            ..policy()
        };
        let f = fixture(vec![channel()], &[], &[], intro_policy, false);
        let mut status = ChannelStatus::new(channel());

        let selected = f.selector.select_next(&mut status, None).await.unwrap();
        assert_eq!(selected.id, "a");
        assert!(!status.played_intro);
    }

    #[tokio::test]
    async fn test_override_bypasses_rank_order() {
        let f = fixture(vec![channel()], &[], &[], policy(), false);
        let mut status = ChannelStatus::new(channel());

        let selected = f.selector.select_next(&mut status, Some("c")).await.unwrap();
        assert_eq!(selected.id, "c");
        assert_eq!(status.current_rank, 2);

        assert!(f.selector.select_next(&mut status, Some("missing")).await.is_none());
        assert_eq!(status.current_rank, 2);
    }

    #[tokio::test]
    async fn test_movie_resolves_playlist_item() {
        let movie_channel = Channel::new(2, "Cinema").with_stream(
            Stream::new("m", "Movies", "").kind(StreamKind::Movie),
        );
        let f = fixture(vec![movie_channel.clone()], &[], &[], policy(), false);
        let mut status = ChannelStatus::new(movie_channel);

        let movie = f.selector.select_next(&mut status, None).await.unwrap();
        assert_eq!(movie.kind, StreamKind::Movie);
        assert_eq!(movie.name, "Feature");
        assert_eq!(movie.url, "/media/Feature.ts");
        assert_eq!(movie.profile.name, "Local");
        assert!(movie.source_file_id.is_none());
    }

    #[tokio::test]
    async fn test_intro_candidate_plays_as_movie() {
        let intro_channel = Channel::new(3, "Loop").with_stream(
            Stream::new("i", "Intros", "").kind(StreamKind::Intro),
        );
        let f = fixture(vec![intro_channel.clone()], &[], &[], policy(), true);
        let mut status = ChannelStatus::new(intro_channel);

        let selected = f.selector.select_next(&mut status, None).await.unwrap();
        assert_eq!(selected.kind, StreamKind::Movie);
        assert_eq!(selected.name, "Intros");
    }

    #[tokio::test]
    async fn test_missing_playlist_is_skipped() {
        let mixed = Channel::new(4, "Mixed")
            .with_stream(
                Stream::new("gone", "Gone", "")
                    .kind(StreamKind::Movie)
                    .rank(0),
            )
            .with_stream(Stream::new("live", "Live", "http://up/live").rank(1));
        let f = fixture(vec![mixed.clone()], &[], &[], policy(), false);
        let mut status = ChannelStatus::new(mixed);

        let selected = f.selector.select_next(&mut status, None).await.unwrap();
        assert_eq!(selected.id, "live");
    }

    #[tokio::test]
    async fn test_profile_precedence() {
        let channels = vec![
            Channel::new(1, "Own")
                .with_default_profile("Group")
                .with_stream(Stream::new("own", "Own", "http://up/own").profile("Custom")),
            Channel::new(2, "Grouped")
                .with_default_profile("Local")
                .with_stream(Stream::new("grouped", "Grouped", "http://up/g")),
            Channel::new(3, "Defaulted")
                .with_default_profile("Local")
                .with_stream(Stream::new("defaulted", "Defaulted", "http://up/d")),
            Channel::new(4, "Global")
                .with_stream(Stream::new("global", "Global", "http://up/x").profile("Nope")),
        ];
        let groups = vec![StreamGroup {
            name: "Sports".into(),
            profile: Some("Group".into()),
            channel_ids: vec![2],
        }];
        let f = fixture(channels.clone(), &groups, &[], policy(), false);

        let expected = ["Custom", "Group", "Local", "Default"];
        for (channel, profile) in channels.into_iter().zip(expected) {
            let mut status = ChannelStatus::new(channel);
            let selected = f.selector.select_next(&mut status, None).await.unwrap();
            assert_eq!(selected.profile.name, profile);
        }
    }

    #[tokio::test]
    async fn test_stream_user_agent_override() {
        let custom = Channel::new(5, "UA").with_stream(
            Stream::new("ua", "UA", "http://up/ua").user_agent("Custom/1.0"),
        );
        let f = fixture(vec![custom.clone()], &[], &[], policy(), false);
        let mut status = ChannelStatus::new(custom);

        let selected = f.selector.select_next(&mut status, None).await.unwrap();
        assert_eq!(selected.user_agent, "Custom/1.0");
    }

    #[tokio::test]
    async fn test_empty_channel_without_fallback() {
        let empty = Channel::new(6, "Empty");
        let f = fixture(vec![empty.clone()], &[], &[], policy(), false);
        let mut status = ChannelStatus::new(empty);

        assert!(f.selector.select_next(&mut status, None).await.is_none());
    }
}
