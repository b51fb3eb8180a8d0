//! Intro clips and looping custom playlists
//!
//! Custom playlists play on a fixed wall-clock schedule: the item that is due
//! right now, and how far into it we are, is derived from an anchor time. A
//! channel that fails over back to a playlist therefore resumes mid-file
//! instead of restarting it.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

use crate::model::ChannelId;

/// One local file in a playlist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistItem {
    pub title: String,
    pub path: String,
    #[serde(default)]
    pub duration_secs: u64,
}

/// Named list of local files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playlist {
    pub name: String,

    /// Items of intro playlists are eligible as channel intros
    #[serde(default)]
    pub intro: bool,

    #[serde(default)]
    pub items: Vec<PlaylistItem>,
}

impl Playlist {
    /// Total loop length in seconds
    pub fn total_duration(&self) -> u64 {
        self.items.iter().map(|i| i.duration_secs).sum()
    }

    /// Item due `position` seconds into the loop, with the offset into it
    pub fn item_at(&self, position: u64) -> Option<(&PlaylistItem, u64)> {
        let first = self.items.first()?;
        let total = self.total_duration();
        if total == 0 {
            return Some((first, 0));
        }

        let mut remaining = position % total;
        for item in &self.items {
            if remaining < item.duration_secs {
                return Some((item, remaining));
            }
            remaining -= item.duration_secs;
        }
        Some((first, 0))
    }
}

/// Source of intro clips and playlist positions
pub trait PlaylistProvider: Send + Sync {
    /// A random intro clip for the channel, if any intro exists
    fn random_intro(&self, channel_id: ChannelId) -> Option<PlaylistItem>;

    fn playlist(&self, name: &str) -> Option<Playlist>;

    /// Currently due item of a playlist and the elapsed seconds within it
    fn current_item(&self, name: &str) -> Option<(PlaylistItem, u64)>;
}

/// Playlists loaded from configuration
#[derive(Debug, Clone)]
pub struct StaticPlaylists {
    playlists: HashMap<String, Playlist>,
    anchor: SystemTime,
}

impl StaticPlaylists {
    /// Playlists scheduled from the Unix epoch
    pub fn new(playlists: Vec<Playlist>) -> Self {
        Self::with_anchor(playlists, UNIX_EPOCH)
    }

    pub fn with_anchor(playlists: Vec<Playlist>, anchor: SystemTime) -> Self {
        Self {
            playlists: playlists.into_iter().map(|p| (p.name.clone(), p)).collect(),
            anchor,
        }
    }

    /// Due item of `name` at the given time
    pub fn current_item_at(&self, name: &str, now: SystemTime) -> Option<(PlaylistItem, u64)> {
        let playlist = self.playlists.get(name)?;
        let position = now
            .duration_since(self.anchor)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        playlist
            .item_at(position)
            .map(|(item, elapsed)| (item.clone(), elapsed))
    }
}

impl PlaylistProvider for StaticPlaylists {
    fn random_intro(&self, _channel_id: ChannelId) -> Option<PlaylistItem> {
        let intros: Vec<&PlaylistItem> = self
            .playlists
            .values()
            .filter(|p| p.intro)
            .flat_map(|p| p.items.iter())
            .collect();

        intros.choose(&mut rand::rng()).map(|item| (*item).clone())
    }

    fn playlist(&self, name: &str) -> Option<Playlist> {
        self.playlists.get(name).cloned()
    }

    fn current_item(&self, name: &str) -> Option<(PlaylistItem, u64)> {
        self.current_item_at(name, SystemTime::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn item(title: &str, secs: u64) -> PlaylistItem {
        PlaylistItem {
            title: title.into(),
            path: format!("/media/{title}.ts"),
            duration_secs: secs,
        }
    }

    fn movies() -> Playlist {
        Playlist {
            name: "Movies".into(),
            intro: false,
            items: vec![item("a", 100), item("b", 50), item("c", 10)],
        }
    }

    #[test]
    fn test_item_at_wraps() {
        let playlist = movies();

        let (first, offset) = playlist.item_at(30).unwrap();
        assert_eq!((first.title.as_str(), offset), ("a", 30));

        let (second, offset) = playlist.item_at(120).unwrap();
        assert_eq!((second.title.as_str(), offset), ("b", 20));

        // 160 second loop
        let (wrapped, offset) = playlist.item_at(165).unwrap();
        assert_eq!((wrapped.title.as_str(), offset), ("a", 5));
    }

    #[test]
    fn test_unknown_durations_play_first_item() {
        let playlist = Playlist {
            name: "x".into(),
            intro: false,
            items: vec![item("only", 0)],
        };
        let (only, offset) = playlist.item_at(999).unwrap();
        assert_eq!((only.title.as_str(), offset), ("only", 0));
    }

    #[test]
    fn test_current_item_from_anchor() {
        let anchor = UNIX_EPOCH + Duration::from_secs(1_000);
        let playlists = StaticPlaylists::with_anchor(vec![movies()], anchor);

        let now = anchor + Duration::from_secs(155);
        let (item, elapsed) = playlists.current_item_at("Movies", now).unwrap();
        assert_eq!(item.title, "c");
        assert_eq!(elapsed, 5);

        assert!(playlists.current_item_at("Missing", now).is_none());
    }

    #[test]
    fn test_random_intro_only_from_intro_playlists() {
        let intro = Playlist {
            name: "Intros".into(),
            intro: true,
            items: vec![item("intro", 5)],
        };
        let playlists = StaticPlaylists::new(vec![movies(), intro]);

        for _ in 0..10 {
            assert_eq!(playlists.random_intro(1).unwrap().title, "intro");
        }

        let none = StaticPlaylists::new(vec![movies()]);
        assert!(none.random_intro(1).is_none());
    }
}
