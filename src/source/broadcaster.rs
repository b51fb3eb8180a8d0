//! One upstream feeding a shared ring buffer
//!
//! A source broadcaster runs a single read loop that copies upstream chunks
//! into its [`RingBuffer`]. Channels register as subscribers by id only; the
//! source never owns them. On the first read or connect failure the source is
//! flagged failed and a [`SourceEvent::Failed`] is published so every
//! subscribed channel can fail over.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashSet;
use futures::StreamExt;
use tokio::sync::futures::Notified;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;

use crate::buffer::{BufferError, CursorRead, RingBuffer};
use crate::model::{ChannelId, SourceFileId};
use crate::stats::SourceStats;

use super::upstream::Upstream;

/// Source lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// The upstream failed; the listed channels were subscribed at that time
    Failed {
        url: String,
        subscribers: Vec<ChannelId>,
    },
}

/// Identity of the stream a source plays
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceInfo {
    /// Registry key: resolved URL, or a synthetic key for composites
    pub url: String,
    pub stream_id: String,
    pub name: String,
    pub source_file_id: Option<SourceFileId>,
}

/// Shared upstream reader
pub struct SourceBroadcaster {
    info: SourceInfo,
    buffer: RingBuffer,
    subscribers: DashSet<ChannelId>,
    failed: AtomicBool,
    data: Notify,
    cancel: CancellationToken,
    events: broadcast::Sender<SourceEvent>,
    bytes_read: AtomicU64,
    started_at: Instant,
}

impl SourceBroadcaster {
    pub fn new(
        info: SourceInfo,
        buffer_capacity: usize,
        events: broadcast::Sender<SourceEvent>,
    ) -> Result<Arc<Self>, BufferError> {
        Ok(Arc::new(Self {
            info,
            buffer: RingBuffer::new(buffer_capacity)?,
            subscribers: DashSet::new(),
            failed: AtomicBool::new(false),
            data: Notify::new(),
            cancel: CancellationToken::new(),
            events,
            bytes_read: AtomicU64::new(0),
            started_at: Instant::now(),
        }))
    }

    pub fn info(&self) -> &SourceInfo {
        &self.info
    }

    pub fn url(&self) -> &str {
        &self.info.url
    }

    /// Spawn the read loop over an established upstream
    ///
    /// A zero `read_timeout` disables the stall check.
    pub fn start(self: &Arc<Self>, upstream: Upstream, read_timeout: Duration) {
        let source = Arc::clone(self);
        tokio::spawn(async move {
            source.read_loop(upstream, read_timeout).await;
        });
    }

    async fn read_loop(&self, mut upstream: Upstream, read_timeout: Duration) {
        tracing::info!(
            url = %self.info.url,
            stream_id = %self.info.stream_id,
            pid = ?upstream.process_id(),
            "Source started"
        );

        loop {
            let next = async {
                if read_timeout.is_zero() {
                    Ok(upstream.body.next().await)
                } else {
                    tokio::time::timeout(read_timeout, upstream.body.next()).await
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!(url = %self.info.url, "Source read loop cancelled");
                    break;
                }
                result = next => match result {
                    Ok(Some(Ok(chunk))) => {
                        if chunk.is_empty() {
                            continue;
                        }
                        if self.buffer.write(&chunk).is_err() {
                            break;
                        }
                        self.bytes_read.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                        self.data.notify_waiters();
                    }
                    Ok(Some(Err(e))) => {
                        self.mark_failed(&format!("read error: {e}"));
                        break;
                    }
                    Ok(None) => {
                        self.mark_failed("upstream ended");
                        break;
                    }
                    Err(_) => {
                        self.mark_failed(&format!(
                            "no data for {} ms",
                            read_timeout.as_millis()
                        ));
                        break;
                    }
                }
            }
        }

        // Dropping the upstream kills any producing subprocess
        drop(upstream);
    }

    /// Flag the source failed and tell the subscribers, once
    pub fn mark_failed(&self, reason: &str) {
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }

        let subscribers = self.subscribers();
        tracing::warn!(
            url = %self.info.url,
            stream_id = %self.info.stream_id,
            reason = %reason,
            subscribers = subscribers.len(),
            "Source failed"
        );

        // No listener is fine; readers also poll `is_failed`
        let _ = self.events.send(SourceEvent::Failed {
            url: self.info.url.clone(),
            subscribers,
        });
        self.data.notify_waiters();
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Cancel the read loop and release the upstream
    ///
    /// Returns true for the call that actually stopped the source.
    pub fn stop(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.cancel.cancel();
        self.buffer.dispose();
        self.data.notify_waiters();

        tracing::info!(
            url = %self.info.url,
            bytes_read = self.bytes_read.load(Ordering::Relaxed),
            "Source stopped"
        );
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether new subscribers may still be served from this source
    pub fn is_healthy(&self) -> bool {
        !self.is_failed() && !self.is_stopped()
    }

    /// Returns true if the channel was not subscribed yet
    pub fn add_subscriber(&self, channel_id: ChannelId) -> bool {
        let added = self.subscribers.insert(channel_id);
        if added {
            tracing::debug!(
                url = %self.info.url,
                channel_id = channel_id,
                subscribers = self.subscribers.len(),
                "Channel subscribed to source"
            );
        }
        added
    }

    /// Returns the number of remaining subscribers
    pub fn remove_subscriber(&self, channel_id: ChannelId) -> usize {
        if self.subscribers.remove(&channel_id).is_some() {
            tracing::debug!(
                url = %self.info.url,
                channel_id = channel_id,
                subscribers = self.subscribers.len(),
                "Channel unsubscribed from source"
            );
        }
        self.subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn subscribers(&self) -> Vec<ChannelId> {
        let mut ids: Vec<_> = self.subscribers.iter().map(|id| *id).collect();
        ids.sort_unstable();
        ids
    }

    /// Read buffered bytes from `cursor` onwards
    pub fn read_from(&self, cursor: u64) -> Result<CursorRead, BufferError> {
        self.buffer.read_from(cursor)
    }

    /// Position of the oldest byte still buffered; new readers start here
    pub fn oldest_position(&self) -> Result<u64, BufferError> {
        self.buffer.oldest_position()
    }

    /// Future resolved on the next write, failure or stop
    pub fn notified(&self) -> Notified<'_> {
        self.data.notified()
    }

    /// Append bytes as if read from upstream
    pub fn feed(&self, chunk: &[u8]) -> Result<(), BufferError> {
        self.buffer.write(chunk)?;
        self.bytes_read.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        self.data.notify_waiters();
        Ok(())
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            url: self.info.url.clone(),
            stream_id: self.info.stream_id.clone(),
            stream_name: self.info.name.clone(),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            subscribers: self.subscribers.len(),
            failed: self.is_failed(),
            ..Default::default()
        }
        .with_duration(self.started_at.elapsed())
    }
}

impl std::fmt::Debug for SourceBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceBroadcaster")
            .field("url", &self.info.url)
            .field("subscribers", &self.subscriber_count())
            .field("failed", &self.is_failed())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
