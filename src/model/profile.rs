//! Execution profiles
//!
//! A profile is a named invocation template: either direct HTTP pass-through
//! (empty command) or a subprocess whose stdout carries the transport stream.
//! Argument templates may contain `{streamUrl}`, `{clientUserAgent}` and
//! `{startSeconds}`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Placeholder replaced by the upstream URL or file path
pub const STREAM_URL: &str = "{streamUrl}";
/// Placeholder replaced by the resolved user agent
pub const CLIENT_USER_AGENT: &str = "{clientUserAgent}";
/// Placeholder replaced by the playlist resume offset in seconds
pub const START_SECONDS: &str = "{startSeconds}";

/// Profile definition as stored in configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandProfile {
    /// Program to run; empty means direct pass-through
    #[serde(default)]
    pub command: String,

    /// Whitespace separated argument template
    #[serde(default)]
    pub arguments: String,
}

impl CommandProfile {
    pub fn new(command: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            arguments: arguments.into(),
        }
    }

    /// Direct pass-through profile
    pub fn direct() -> Self {
        Self::default()
    }
}

/// Profile resolved by name, ready to be executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionProfile {
    pub name: String,
    pub command: String,
    pub arguments: String,
}

impl ExecutionProfile {
    pub fn from_command(name: impl Into<String>, profile: &CommandProfile) -> Self {
        Self {
            name: name.into(),
            command: profile.command.clone(),
            arguments: profile.arguments.clone(),
        }
    }

    /// Pass-through profile under the given name
    pub fn direct(name: impl Into<String>) -> Self {
        Self::from_command(name, &CommandProfile::direct())
    }

    /// Whether the upstream is read directly instead of through a subprocess
    pub fn is_direct(&self) -> bool {
        self.command.trim().is_empty()
    }

    /// Expand the argument template
    ///
    /// The template is split on whitespace before substitution so values
    /// containing spaces stay a single argument.
    pub fn render_arguments(&self, url: &str, user_agent: &str, start_seconds: u64) -> Vec<String> {
        let start = start_seconds.to_string();
        self.arguments
            .split_whitespace()
            .map(|arg| {
                arg.replace(STREAM_URL, url)
                    .replace(CLIENT_USER_AGENT, user_agent)
                    .replace(START_SECONDS, &start)
            })
            .collect()
    }
}

/// Name to profile lookup
pub trait ProfileResolver: Send + Sync {
    /// Look up a profile by name
    fn profile(&self, name: &str) -> Option<ExecutionProfile>;
}

/// Immutable profile table validated at load time
#[derive(Debug, Clone)]
pub struct ProfileTable {
    profiles: HashMap<String, CommandProfile>,
}

impl ProfileTable {
    /// Build and validate a table
    ///
    /// Every name in `required` must be present, and every subprocess profile
    /// must reference `{streamUrl}`.
    pub fn new(profiles: HashMap<String, CommandProfile>, required: &[&str]) -> Result<Self> {
        for name in required {
            if !profiles.contains_key(*name) {
                return Err(Error::config(format!("profile `{name}` is not defined")));
            }
        }

        for (name, profile) in &profiles {
            if !profile.command.trim().is_empty() && !profile.arguments.contains(STREAM_URL) {
                return Err(Error::config(format!(
                    "profile `{name}` runs `{}` but its arguments never reference {STREAM_URL}",
                    profile.command
                )));
            }
        }

        Ok(Self { profiles })
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }
}

impl ProfileResolver for ProfileTable {
    fn profile(&self, name: &str) -> Option<ExecutionProfile> {
        self.profiles
            .get(name)
            .map(|p| ExecutionProfile::from_command(name, p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> HashMap<String, CommandProfile> {
        let mut profiles = HashMap::new();
        profiles.insert("Default".to_string(), CommandProfile::direct());
        profiles.insert(
            "FFMPEG".to_string(),
            CommandProfile::new(
                "ffmpeg",
                "-user_agent {clientUserAgent} -ss {startSeconds} -i {streamUrl} -c copy -f mpegts pipe:1",
            ),
        );
        profiles
    }

    #[test]
    fn test_lookup() {
        let table = ProfileTable::new(table(), &["Default"]).unwrap();

        let direct = table.profile("Default").unwrap();
        assert!(direct.is_direct());
        assert_eq!(direct.name, "Default");

        assert!(table.profile("Missing").is_none());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_missing_required_profile() {
        let err = ProfileTable::new(table(), &["Default", "Local"]).unwrap_err();
        assert!(err.to_string().contains("`Local`"));
    }

    #[test]
    fn test_command_without_url_rejected() {
        let mut profiles = table();
        profiles.insert("Broken".to_string(), CommandProfile::new("ffmpeg", "-f mpegts pipe:1"));

        assert!(matches!(
            ProfileTable::new(profiles, &[]),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_render_arguments() {
        let table = ProfileTable::new(table(), &[]).unwrap();
        let profile = table.profile("FFMPEG").unwrap();

        let args = profile.render_arguments("http://host/a b.ts", "VLC/3.0 LibVLC", 42);

        assert_eq!(
            args,
            vec![
                "-user_agent",
                "VLC/3.0 LibVLC",
                "-ss",
                "42",
                "-i",
                "http://host/a b.ts",
                "-c",
                "copy",
                "-f",
                "mpegts",
                "pipe:1",
            ]
        );
    }
}
