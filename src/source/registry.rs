//! Registry of live sources
//!
//! Exactly one source exists per resolved URL. Creation is serialized per key
//! with a double-checked creation lock, so concurrent channels asking for the
//! same URL share one upstream. A source is torn down when its last subscriber
//! leaves, which also returns its source-file slot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex};

use crate::error::{Error, Result};
use crate::model::{ChannelId, ResolvedStream};
use crate::selector::StreamLimitsService;

use super::broadcaster::{SourceBroadcaster, SourceEvent, SourceInfo};
use super::multiview::{composite_stream, PacketInterleaver};
use super::upstream::{ByteStream, Upstream, UpstreamConnector};

/// Capacity of the source event channel
const EVENT_CAPACITY: usize = 256;

/// Source settings
#[derive(Debug, Clone)]
pub struct SourceSettings {
    /// Ring buffer capacity per source, in bytes
    pub buffer_capacity: usize,
    /// Fail a source after this long without data; zero disables
    pub read_timeout: Duration,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: 4 * 1024 * 1024,
            read_timeout: Duration::from_secs(30),
        }
    }
}

/// Source lookup used by the channel service
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Existing or newly connected source for `stream`, with `channel_id`
    /// subscribed to it
    async fn get_or_create(
        &self,
        stream: &ResolvedStream,
        channel_id: ChannelId,
    ) -> Result<Arc<SourceBroadcaster>>;

    /// Composite source muxing `inputs`, with `channel_id` subscribed to it
    async fn create_composite(
        &self,
        key: &str,
        name: &str,
        inputs: Vec<ByteStream>,
        channel_id: ChannelId,
    ) -> Result<Arc<SourceBroadcaster>>;

    fn get(&self, url: &str) -> Option<Arc<SourceBroadcaster>>;

    /// Stop the source for `url`; its subscribers observe a failure
    fn stop(&self, url: &str) -> bool;

    /// Unsubscribe a channel, tearing the source down when none remain
    fn release(&self, source: &Arc<SourceBroadcaster>, channel_id: ChannelId);

    fn subscribe_events(&self) -> broadcast::Receiver<SourceEvent>;

    fn sources(&self) -> Vec<Arc<SourceBroadcaster>>;

    /// Stop every source
    fn shutdown(&self);
}

/// Production source provider
pub struct SourceRegistry {
    sources: DashMap<String, Arc<SourceBroadcaster>>,
    creation_locks: DashMap<String, Arc<Mutex<()>>>,
    connector: Arc<dyn UpstreamConnector>,
    limits: Arc<StreamLimitsService>,
    events: broadcast::Sender<SourceEvent>,
    settings: SourceSettings,
}

impl SourceRegistry {
    pub fn new(
        connector: Arc<dyn UpstreamConnector>,
        limits: Arc<StreamLimitsService>,
        settings: SourceSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sources: DashMap::new(),
            creation_locks: DashMap::new(),
            connector,
            limits,
            events,
            settings,
        }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Healthy registered source, with the channel subscribed while the map
    /// entry is held so a concurrent release cannot tear it down in between
    fn subscribe_existing(&self, url: &str, channel_id: ChannelId) -> Option<Arc<SourceBroadcaster>> {
        let entry = self.sources.get(url)?;
        if !entry.is_healthy() {
            return None;
        }
        entry.add_subscriber(channel_id);
        Some(Arc::clone(entry.value()))
    }

    fn creation_lock(&self, url: &str) -> Arc<Mutex<()>> {
        self.creation_locks
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn drop_creation_lock(&self, url: &str) {
        self.creation_locks
            .remove_if(url, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Remove an unhealthy source from the map; it lives on until its
    /// subscribers leave
    fn evict_unhealthy(&self, url: &str) {
        let evicted = self
            .sources
            .remove_if(url, |_, source| !source.is_healthy());

        if let Some((_, source)) = evicted {
            tracing::debug!(
                url = %url,
                subscribers = source.subscriber_count(),
                "Evicted unhealthy source"
            );
            if source.subscriber_count() == 0 {
                self.teardown(&source);
            }
        }
    }

    /// Stop a source and return its source-file slot, once
    fn teardown(&self, source: &Arc<SourceBroadcaster>) {
        if source.stop() {
            if let Some(id) = source.info().source_file_id {
                self.limits.release(id);
            }
        }
    }

    async fn connect(
        &self,
        stream: &ResolvedStream,
        channel_id: ChannelId,
    ) -> Result<Arc<SourceBroadcaster>> {
        // The slot is held while connecting so concurrent creations for the
        // same source file cannot both pass the capacity check
        if let Some(id) = stream.source_file_id {
            if !self.limits.try_acquire(id) {
                return Err(Error::SourceFileLimited { source_file_id: id });
            }
        }

        let created = match self.connector.connect(stream).await {
            Ok(upstream) => SourceBroadcaster::new(
                SourceInfo {
                    url: stream.url.clone(),
                    stream_id: stream.id.clone(),
                    name: stream.name.clone(),
                    source_file_id: stream.source_file_id,
                },
                self.settings.buffer_capacity,
                self.events.clone(),
            )
            .map(|source| (source, upstream))
            .map_err(Error::from),
            Err(e) => Err(e),
        };

        let (source, upstream) = match created {
            Ok(created) => created,
            Err(e) => {
                if let Some(id) = stream.source_file_id {
                    self.limits.release(id);
                }
                return Err(e);
            }
        };

        source.add_subscriber(channel_id);
        source.start(upstream, self.settings.read_timeout);
        self.sources
            .insert(stream.source_key().to_string(), Arc::clone(&source));

        tracing::info!(
            url = %stream.url,
            stream_id = %stream.id,
            profile = %stream.profile.name,
            channel_id = channel_id,
            "Source created"
        );

        Ok(source)
    }
}

#[async_trait]
impl SourceProvider for SourceRegistry {
    async fn get_or_create(
        &self,
        stream: &ResolvedStream,
        channel_id: ChannelId,
    ) -> Result<Arc<SourceBroadcaster>> {
        let url = stream.source_key();

        if let Some(source) = self.subscribe_existing(url, channel_id) {
            tracing::debug!(url = %url, channel_id = channel_id, "Reusing source");
            return Ok(source);
        }

        let lock = self.creation_lock(url);
        let result = {
            let _guard = lock.lock().await;

            // Re-check after acquiring the lock
            if let Some(source) = self.subscribe_existing(url, channel_id) {
                tracing::debug!(
                    url = %url,
                    channel_id = channel_id,
                    "Reusing source created by concurrent request"
                );
                Ok(source)
            } else {
                self.evict_unhealthy(url);
                self.connect(stream, channel_id).await
            }
        };
        drop(lock);
        self.drop_creation_lock(url);

        if let Err(e) = &result {
            tracing::warn!(url = %url, channel_id = channel_id, error = %e, "Source creation failed");
        }
        result
    }

    async fn create_composite(
        &self,
        key: &str,
        name: &str,
        inputs: Vec<ByteStream>,
        channel_id: ChannelId,
    ) -> Result<Arc<SourceBroadcaster>> {
        if let Some((_, previous)) = self.sources.remove(key) {
            self.teardown(&previous);
        }

        let muxer = PacketInterleaver::new(inputs.len());
        let source = SourceBroadcaster::new(
            SourceInfo {
                url: key.to_string(),
                stream_id: key.to_string(),
                name: name.to_string(),
                source_file_id: None,
            },
            self.settings.buffer_capacity,
            self.events.clone(),
        )?;

        source.add_subscriber(channel_id);
        source.start(
            Upstream::from_stream(composite_stream(inputs, muxer)),
            Duration::ZERO,
        );
        self.sources.insert(key.to_string(), Arc::clone(&source));

        tracing::info!(key = %key, channel_id = channel_id, "Composite source created");
        Ok(source)
    }

    fn get(&self, url: &str) -> Option<Arc<SourceBroadcaster>> {
        self.sources.get(url).map(|s| Arc::clone(s.value()))
    }

    fn stop(&self, url: &str) -> bool {
        let Some((_, source)) = self.sources.remove(url) else {
            tracing::debug!(url = %url, "No source to stop");
            return false;
        };

        source.mark_failed("stopped by request");
        self.teardown(&source);
        true
    }

    fn release(&self, source: &Arc<SourceBroadcaster>, channel_id: ChannelId) {
        if source.remove_subscriber(channel_id) > 0 {
            return;
        }

        let url = source.url();
        self.sources
            .remove_if(url, |_, s| Arc::ptr_eq(s, source) && s.subscriber_count() == 0);

        let registered = self
            .sources
            .get(url)
            .is_some_and(|s| Arc::ptr_eq(s.value(), source));

        if !registered && source.subscriber_count() == 0 {
            tracing::debug!(url = %url, "Last subscriber left, tearing source down");
            self.teardown(source);
        }
    }

    fn subscribe_events(&self) -> broadcast::Receiver<SourceEvent> {
        self.events.subscribe()
    }

    fn sources(&self) -> Vec<Arc<SourceBroadcaster>> {
        self.sources.iter().map(|s| Arc::clone(s.value())).collect()
    }

    fn shutdown(&self) {
        let keys: Vec<String> = self.sources.iter().map(|s| s.key().clone()).collect();
        for key in keys {
            if let Some((_, source)) = self.sources.remove(&key) {
                self.teardown(&source);
            }
        }
        tracing::info!("All sources stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use futures::stream;
    use futures::StreamExt;

    use super::*;
    use crate::error::Error;
    use crate::model::{ExecutionProfile, StreamKind};
    use crate::selector::SourceFile;

    /// Connector double: endless silent upstreams, or failures for `bad` URLs
    #[derive(Default)]
    struct TestConnector {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl UpstreamConnector for TestConnector {
        async fn connect(&self, stream: &ResolvedStream) -> Result<Upstream> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if stream.url.contains("bad") {
                return Err(Error::upstream(&stream.url, "connection refused"));
            }
            Ok(Upstream::from_stream(Box::pin(stream::pending::<std::io::Result<Bytes>>())))
        }
    }

    fn resolved(url: &str, source_file_id: Option<i32>) -> ResolvedStream {
        ResolvedStream {
            id: url.into(),
            name: url.into(),
            url: url.into(),
            profile: ExecutionProfile::direct("Default"),
            user_agent: "test".into(),
            kind: StreamKind::Regular,
            source_file_id,
            start_seconds: 0,
        }
    }

    fn registry() -> (SourceRegistry, Arc<TestConnector>, Arc<StreamLimitsService>) {
        let connector = Arc::new(TestConnector::default());
        let limits = Arc::new(StreamLimitsService::new(&[SourceFile {
            id: 1,
            name: "Provider".into(),
            max_streams: 2,
        }]));
        let registry = SourceRegistry::new(
            connector.clone(),
            limits.clone(),
            SourceSettings {
                buffer_capacity: 1024,
                read_timeout: Duration::ZERO,
            },
        );
        (registry, connector, limits)
    }

    #[tokio::test]
    async fn test_one_source_per_url() {
        let (registry, connector, limits) = registry();
        let stream = resolved("http://up/a", Some(1));

        let first = registry.get_or_create(&stream, 1).await.unwrap();
        let second = registry.get_or_create(&stream, 2).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.subscribers(), vec![1, 2]);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(limits.current(1), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_creation_shares_source() {
        let (registry, connector, _limits) = registry();
        let registry = Arc::new(registry);
        let stream = resolved("http://up/shared", None);

        let handles: Vec<_> = (0..8)
            .map(|channel_id| {
                let registry = Arc::clone(&registry);
                let stream = stream.clone();
                tokio::spawn(async move { registry.get_or_create(&stream, channel_id).await.unwrap() })
            })
            .collect();

        let mut sources = Vec::new();
        for handle in handles {
            sources.push(handle.await.unwrap());
        }

        assert!(sources.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(sources[0].subscriber_count(), 8);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_tears_down_last_subscriber() {
        let (registry, _connector, limits) = registry();
        let stream = resolved("http://up/a", Some(1));

        let source = registry.get_or_create(&stream, 1).await.unwrap();
        registry.get_or_create(&stream, 2).await.unwrap();

        registry.release(&source, 1);
        assert!(!source.is_stopped());
        assert!(registry.get("http://up/a").is_some());

        registry.release(&source, 2);
        assert!(source.is_stopped());
        assert!(registry.get("http://up/a").is_none());
        assert_eq!(limits.current(1), 0);

        // Releasing again is harmless
        registry.release(&source, 2);
        assert_eq!(limits.current(1), 0);
    }

    #[tokio::test]
    async fn test_failed_source_is_replaced() {
        let (registry, connector, limits) = registry();
        let stream = resolved("http://up/a", Some(1));

        let failed = registry.get_or_create(&stream, 1).await.unwrap();
        failed.mark_failed("test");

        let replacement = registry.get_or_create(&stream, 2).await.unwrap();
        assert!(!Arc::ptr_eq(&failed, &replacement));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(limits.current(1), 2);

        // The old subscriber leaving stops only the orphaned source
        registry.release(&failed, 1);
        assert!(failed.is_stopped());
        assert!(!replacement.is_stopped());
        assert_eq!(limits.current(1), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_propagates() {
        let (registry, _connector, limits) = registry();

        let err = registry
            .get_or_create(&resolved("http://bad/a", Some(1)), 1)
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert!(registry.is_empty());
        assert_eq!(limits.current(1), 0);
    }

    #[tokio::test]
    async fn test_full_source_file_refused_before_connect() {
        let (registry, connector, limits) = registry();
        registry.get_or_create(&resolved("http://up/a", Some(1)), 1).await.unwrap();
        registry.get_or_create(&resolved("http://up/b", Some(1)), 2).await.unwrap();

        let err = registry
            .get_or_create(&resolved("http://up/c", Some(1)), 3)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::SourceFileLimited { source_file_id: 1 }));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(limits.current(1), 2);
        assert!(registry.get("http://up/c").is_none());

        // Sharing a live upstream needs no extra slot
        registry.get_or_create(&resolved("http://up/a", Some(1)), 4).await.unwrap();
        assert_eq!(limits.current(1), 2);
    }

    #[tokio::test]
    async fn test_stop_fails_subscribers() {
        let (registry, _connector, limits) = registry();
        let mut events = registry.subscribe_events();
        let source = registry.get_or_create(&resolved("http://up/a", Some(1)), 5).await.unwrap();

        assert!(registry.stop("http://up/a"));
        assert!(!registry.stop("http://up/a"));

        assert_eq!(
            events.recv().await.unwrap(),
            SourceEvent::Failed {
                url: "http://up/a".into(),
                subscribers: vec![5],
            }
        );
        assert!(source.is_stopped());
        assert_eq!(limits.current(1), 0);
    }

    #[tokio::test]
    async fn test_composite_source() {
        let (registry, _connector, _limits) = registry();
        let packet = {
            let mut p = vec![0u8; super::super::multiview::TS_PACKET_SIZE];
            p[0] = 0x47;
            Bytes::from(p)
        };
        let inputs: Vec<ByteStream> = vec![
            Box::pin(
                stream::iter(vec![Ok::<_, std::io::Error>(packet.clone())])
                    .chain(stream::pending()),
            ),
            Box::pin(stream::pending::<std::io::Result<Bytes>>()),
        ];

        let source = registry
            .create_composite("multiview:9", "Mosaic", inputs, 9)
            .await
            .unwrap();

        let notified = source.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if source.read_from(0).unwrap().data.is_empty() {
            notified.await;
        }

        assert_eq!(source.read_from(0).unwrap().data, packet);
        assert_eq!(source.subscribers(), vec![9]);
        assert!(registry.get("multiview:9").is_some());
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let (registry, _connector, limits) = registry();
        let a = registry.get_or_create(&resolved("http://up/a", Some(1)), 1).await.unwrap();
        let b = registry.get_or_create(&resolved("http://up/b", None), 2).await.unwrap();

        registry.shutdown();

        assert!(a.is_stopped() && b.is_stopped());
        assert!(registry.is_empty());
        assert_eq!(limits.current(1), 0);
    }
}
