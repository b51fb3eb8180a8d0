//! Data model shared by the relay core
//!
//! These are the read-only DTOs supplied by the configuration source plus the
//! runtime [`ResolvedStream`] produced by stream selection.

pub mod channel;
pub mod profile;
pub mod stream;

pub use channel::{Channel, ChannelId, ChannelKind};
pub use profile::{CommandProfile, ExecutionProfile, ProfileResolver, ProfileTable};
pub use stream::{ResolvedStream, SourceFileId, Stream, StreamKind};
