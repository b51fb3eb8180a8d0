//! Concurrent-use limits per source file
//!
//! Each imported source file (an M3U provider account, typically) allows a
//! fixed number of simultaneous upstream connections. Counters are atomics so
//! the selector can read them without taking any channel lock while sources
//! come and go on other channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::model::{SourceFileId, Stream};

/// Source file definition from configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub id: SourceFileId,

    #[serde(default)]
    pub name: String,

    /// Simultaneous upstream connections allowed; 0 means unbounded
    #[serde(default)]
    pub max_streams: u32,
}

/// Capacity view used by stream selection
pub trait StreamLimits: Send + Sync {
    /// `(current, max)` connections for a source file; max 0 means unbounded
    fn limits(&self, source_file_id: SourceFileId) -> (u32, u32);

    /// Whether the stream's source file is at capacity
    fn is_limited(&self, stream: &Stream) -> bool {
        match stream.source_file_id {
            Some(id) => {
                let (current, max) = self.limits(id);
                max > 0 && current >= max
            }
            None => false,
        }
    }
}

/// Atomic per-source-file usage counters
#[derive(Debug, Default)]
pub struct StreamLimitsService {
    max: HashMap<SourceFileId, u32>,
    current: DashMap<SourceFileId, AtomicU32>,
}

impl StreamLimitsService {
    pub fn new(source_files: &[SourceFile]) -> Self {
        Self {
            max: source_files.iter().map(|f| (f.id, f.max_streams)).collect(),
            current: DashMap::new(),
        }
    }

    /// Count one more upstream connection for the source file
    pub fn acquire(&self, source_file_id: SourceFileId) -> u32 {
        let prev = self
            .current
            .entry(source_file_id)
            .or_insert_with(|| AtomicU32::new(0))
            .fetch_add(1, Ordering::SeqCst);

        tracing::debug!(
            source_file_id = source_file_id,
            current = prev + 1,
            "Source file slot acquired"
        );
        prev + 1
    }

    /// Reserve a connection slot unless the source file is at capacity
    ///
    /// The check and the increment are one atomic step, so concurrent
    /// reservations never push the count past `max_streams`.
    pub fn try_acquire(&self, source_file_id: SourceFileId) -> bool {
        let max = self.max.get(&source_file_id).copied().unwrap_or(0);
        let counter = self
            .current
            .entry(source_file_id)
            .or_insert_with(|| AtomicU32::new(0));

        let reserved = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
            (max == 0 || v < max).then_some(v + 1)
        });

        match reserved {
            Ok(prev) => {
                tracing::debug!(
                    source_file_id = source_file_id,
                    current = prev + 1,
                    max = max,
                    "Source file slot reserved"
                );
                true
            }
            Err(current) => {
                tracing::debug!(
                    source_file_id = source_file_id,
                    current = current,
                    max = max,
                    "Source file at capacity"
                );
                false
            }
        }
    }

    /// Release a connection; never drops below zero
    pub fn release(&self, source_file_id: SourceFileId) -> u32 {
        let Some(counter) = self.current.get(&source_file_id) else {
            tracing::warn!(source_file_id = source_file_id, "Release without acquire");
            return 0;
        };

        match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1)) {
            Ok(prev) => prev - 1,
            Err(_) => {
                tracing::warn!(
                    source_file_id = source_file_id,
                    "Attempted to release source file slot below zero"
                );
                0
            }
        }
    }

    pub fn current(&self, source_file_id: SourceFileId) -> u32 {
        self.current
            .get(&source_file_id)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

impl StreamLimits for StreamLimitsService {
    fn limits(&self, source_file_id: SourceFileId) -> (u32, u32) {
        let max = self.max.get(&source_file_id).copied().unwrap_or(0);
        (self.current(source_file_id), max)
    }
}
