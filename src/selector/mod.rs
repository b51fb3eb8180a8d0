//! Candidate selection and per-source-file capacity tracking

pub mod limits;
pub mod stream_selector;

pub use limits::{SourceFile, StreamLimits, StreamLimitsService};
pub use stream_selector::{IntroPolicy, SelectionPolicy, StreamSelector, DEFAULT_USER_AGENT};
