//! Channel orchestration
//!
//! The channel service owns every live [`ChannelBroadcaster`]. It attaches and
//! detaches viewers, drives failover with a bounded number of source-creation
//! attempts, and tears channels down once their last viewer leaves.
//!
//! Failover is triggered three ways: a [`SourceEvent::Failed`] pushed by the
//! source registry, a periodic sweep that catches anything the event channel
//! dropped, and administrative requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::ChannelCatalog;
use crate::error::{Error, Result};
use crate::model::{ChannelId, ExecutionProfile, ResolvedStream, StreamKind};
use crate::notify::{ChannelEvent, ChannelNotifier};
use crate::selector::StreamSelector;
use crate::source::{SourceEvent, SourceProvider};
use crate::stats::{ChannelStats, SourceStats};

use super::broadcaster::{ChannelBroadcaster, ChannelState};
use super::client::ClientConnection;
use super::reader::ChannelReader;
use super::status::ChannelStatus;

/// Source creation attempts per switch: the first try plus three retries
pub const MAX_SOURCE_ATTEMPTS: u32 = 4;

/// A failover within this long of the previous switch counts as flapping
pub const DEFAULT_FLAP_WINDOW: Duration = Duration::from_secs(10);

/// Upper bound of the pause before failing over a flapping channel
pub const DEFAULT_MAX_FAILOVER_BACKOFF: Duration = Duration::from_secs(30);

/// Channel service settings
#[derive(Debug, Clone)]
pub struct ChannelServiceSettings {
    /// Pause between source creation attempts
    pub retry_delay: Duration,
    pub max_attempts: u32,
    /// Interval of the failure/idle sweep and of reader wakeups
    pub poll_interval: Duration,
    /// Background failovers this soon after a switch back off exponentially
    /// from `retry_delay`
    pub flap_window: Duration,
    pub max_failover_backoff: Duration,
}

impl Default for ChannelServiceSettings {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(500),
            max_attempts: MAX_SOURCE_ATTEMPTS,
            poll_interval: Duration::from_secs(1),
            flap_window: DEFAULT_FLAP_WINDOW,
            max_failover_backoff: DEFAULT_MAX_FAILOVER_BACKOFF,
        }
    }
}

/// Orchestrates channels, clients and failover
pub struct ChannelService {
    catalog: Arc<dyn ChannelCatalog>,
    selector: Arc<StreamSelector>,
    sources: Arc<dyn SourceProvider>,
    notifier: Arc<dyn ChannelNotifier>,
    settings: ChannelServiceSettings,
    channels: DashMap<ChannelId, Arc<ChannelBroadcaster>>,
    creation_locks: DashMap<ChannelId, Arc<AsyncMutex<()>>>,
    clients: DashMap<Uuid, ChannelId>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl ChannelService {
    pub fn new(
        catalog: Arc<dyn ChannelCatalog>,
        selector: Arc<StreamSelector>,
        sources: Arc<dyn SourceProvider>,
        notifier: Arc<dyn ChannelNotifier>,
        settings: ChannelServiceSettings,
    ) -> Self {
        Self {
            catalog,
            selector,
            sources,
            notifier,
            settings,
            channels: DashMap::new(),
            creation_locks: DashMap::new(),
            clients: DashMap::new(),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn selector(&self) -> &Arc<StreamSelector> {
        &self.selector
    }

    pub fn settings(&self) -> &ChannelServiceSettings {
        &self.settings
    }

    /// Live channel by id
    pub fn channel(&self, channel_id: ChannelId) -> Option<Arc<ChannelBroadcaster>> {
        self.channels
            .get(&channel_id)
            .filter(|c| !c.is_closed())
            .map(|c| Arc::clone(c.value()))
    }

    /// Whether the catalog defines `channel_id`
    pub async fn has_channel(&self, channel_id: ChannelId) -> bool {
        self.catalog.channel(channel_id).await.is_some()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Start the background failover listener and sweep
    ///
    /// Returns `None` if already started.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return None;
        }

        let service = Arc::clone(self);
        let mut events = self.sources.subscribe_events();

        Some(tokio::spawn(async move {
            let mut sweep = tokio::time::interval(service.settings.poll_interval);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            tracing::info!("Channel service started");

            loop {
                tokio::select! {
                    _ = service.shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(SourceEvent::Failed { url, subscribers }) => {
                            service.on_source_failed(&url, &subscribers);
                        }
                        Err(RecvError::Lagged(missed)) => {
                            tracing::warn!(missed = missed, "Source events lagged, relying on sweep");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = sweep.tick() => service.sweep(),
                }
            }

            tracing::debug!("Channel service listener stopped");
        }))
    }

    fn on_source_failed(self: &Arc<Self>, url: &str, subscribers: &[ChannelId]) {
        for channel_id in subscribers {
            let Some(channel) = self.channel(*channel_id) else {
                continue;
            };

            let affected = channel
                .current_source()
                .is_some_and(|s| s.url() == url && !s.is_healthy());
            if affected {
                self.spawn_failover(channel);
            }
        }
    }

    fn sweep(self: &Arc<Self>) {
        let channels: Vec<_> = self.channels.iter().map(|c| Arc::clone(c.value())).collect();

        for channel in channels {
            if channel.is_closed() || channel.is_failing_over() {
                continue;
            }

            if channel.client_count() == 0 {
                let service = Arc::clone(self);
                tokio::spawn(async move {
                    if let Some(_ops) = channel.try_lock_ops() {
                        if channel.client_count() == 0 && !channel.is_failing_over() {
                            tracing::debug!(channel_id = channel.id(), "Closing unused channel");
                            service.close_channel(&channel).await;
                        }
                    }
                });
                continue;
            }

            if channel.current_source().is_some_and(|s| !s.is_healthy()) {
                self.spawn_failover(channel);
            }
        }
    }

    fn spawn_failover(self: &Arc<Self>, channel: Arc<ChannelBroadcaster>) {
        if channel.is_failing_over() {
            return;
        }

        let service = Arc::clone(self);
        tokio::spawn(async move {
            // Event and sweep may both ask; only one failover runs
            let Some(pending) = channel.try_begin_failover() else {
                return;
            };

            let settings = &service.settings;
            let backoff = channel.failover_backoff(
                settings.retry_delay,
                settings.flap_window,
                settings.max_failover_backoff,
            );
            if !backoff.is_zero() {
                tracing::warn!(
                    channel_id = channel.id(),
                    backoff_ms = backoff.as_millis() as u64,
                    "Source failing repeatedly, backing off"
                );
                tokio::select! {
                    _ = service.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }

            let result = if channel.is_multiview() {
                service.rebuild_multiview(&channel).await
            } else {
                let cancel = service.shutdown.child_token();
                service
                    .switch_inner(&channel, cancel, None, true)
                    .await
                    .map(|_| ())
            };
            drop(pending);

            match result {
                Ok(()) => {}
                Err(Error::Cancelled) => {
                    tracing::debug!(channel_id = channel.id(), "Failover cancelled");
                }
                Err(e) => {
                    tracing::error!(channel_id = channel.id(), error = %e, "Failover failed");
                    channel.complete_clients();
                }
            }

            service.release_child_feeds(&channel).await;
        });
    }

    /// Attach a viewer, establishing a stream if the channel has none
    pub async fn attach_client(
        &self,
        client: Arc<ClientConnection>,
        channel_id: ChannelId,
    ) -> Result<Arc<ChannelBroadcaster>> {
        loop {
            let channel = self.get_or_create_channel_broadcaster(&client, channel_id).await?;
            let _ops = channel.lock_ops().await;

            // Closed while we waited; start over with a fresh channel
            if channel.is_closed() {
                continue;
            }

            if !channel.has_healthy_source() && !channel.is_failing_over() {
                let established = if channel.is_multiview() {
                    self.start_multiview(&channel).await.map(|_| true)
                } else {
                    self.switch_inner(&channel, client.token(), None, true).await
                };

                let error = match established {
                    Ok(true) => None,
                    Ok(false) => Some(Error::NoViableCandidate { channel_id }),
                    Err(e) => Some(e),
                };

                if let Some(e) = error {
                    self.close_if_unused(&channel).await;
                    drop(_ops);
                    self.release_child_feeds(&channel).await;
                    return Err(e);
                }
            }

            channel.add_client(Arc::clone(&client));
            self.clients.insert(client.id(), channel_id);

            tracing::info!(
                channel_id = channel_id,
                client_id = %client.id(),
                peer = ?client.peer_addr(),
                clients = channel.client_count(),
                "Client attached"
            );
            self.notifier.notify(ChannelEvent::ClientAttached {
                channel_id,
                client_id: client.id(),
            });

            return Ok(Arc::clone(&channel));
        }
    }

    fn attach_boxed(
        &self,
        client: Arc<ClientConnection>,
        channel_id: ChannelId,
    ) -> BoxFuture<'_, Result<Arc<ChannelBroadcaster>>> {
        Box::pin(self.attach_client(client, channel_id))
    }

    /// Live channel for `channel_id`, creating it on first use
    ///
    /// A MultiView channel gets a composite source over its child channels.
    pub async fn get_or_create_channel_broadcaster(
        &self,
        client: &Arc<ClientConnection>,
        channel_id: ChannelId,
    ) -> Result<Arc<ChannelBroadcaster>> {
        if let Some(channel) = self.channel(channel_id) {
            return Ok(channel);
        }

        let lock = self
            .creation_locks
            .entry(channel_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;

            // Re-check after acquiring the lock
            match self.channel(channel_id) {
                Some(channel) => Ok(channel),
                None => self.create_channel(client, channel_id).await,
            }
        };

        drop(lock);
        self.creation_locks
            .remove_if(&channel_id, |_, l| Arc::strong_count(l) == 1);

        result
    }

    async fn create_channel(
        &self,
        client: &Arc<ClientConnection>,
        channel_id: ChannelId,
    ) -> Result<Arc<ChannelBroadcaster>> {
        let definition = self
            .catalog
            .channel(channel_id)
            .await
            .ok_or(Error::ChannelNotFound(channel_id))?;

        let channel = ChannelBroadcaster::new(definition);
        if channel.is_multiview() {
            self.start_multiview(&channel).await?;
        }

        self.channels.insert(channel_id, Arc::clone(&channel));
        tracing::info!(
            channel_id = channel_id,
            client_id = %client.id(),
            name = %channel.name(),
            multiview = channel.is_multiview(),
            "Channel created"
        );

        Ok(channel)
    }

    /// Replace a failed MultiView composite
    async fn rebuild_multiview(&self, channel: &Arc<ChannelBroadcaster>) -> Result<()> {
        let _ops = channel.lock_ops().await;
        if channel.is_closed() || channel.has_healthy_source() {
            return Ok(());
        }

        let _failover = channel.begin_failover();
        tracing::info!(channel_id = channel.id(), "Rebuilding MultiView composite");
        self.start_multiview(channel).await
    }

    /// Attach internal clients to every child channel and mux them together
    async fn start_multiview(&self, channel: &Arc<ChannelBroadcaster>) -> Result<()> {
        let channel_id = channel.id();
        self.detach_children(channel).await;

        let children = channel.lock_status().await.channel.children.clone();
        let mut inputs = Vec::with_capacity(children.len());

        for child_id in children {
            let child_client = Arc::new(ClientConnection::internal(child_id, channel_id));
            match self.attach_boxed(Arc::clone(&child_client), child_id).await {
                Ok(child) => {
                    let reader = ChannelReader::new(
                        child,
                        Arc::clone(&child_client),
                        self.settings.poll_interval,
                    );
                    inputs.push(reader.into_stream());
                    channel.add_child(child_client);
                }
                Err(e) => {
                    tracing::warn!(
                        channel_id = channel_id,
                        child_id = child_id,
                        error = %e,
                        "MultiView child unavailable"
                    );
                }
            }
        }

        if inputs.is_empty() {
            return Err(Error::NoViableCandidate { channel_id });
        }

        let key = format!("multiview:{channel_id}");
        let inputs_len = inputs.len();
        let source = match self
            .sources
            .create_composite(&key, channel.name(), inputs, channel_id)
            .await
        {
            Ok(source) => source,
            Err(e) => {
                self.detach_children(channel).await;
                return Err(e);
            }
        };

        if let Some(old) = channel.replace_source(Some(source)) {
            self.sources.release(&old, channel_id);
        }

        let resolved = ResolvedStream {
            id: key.clone(),
            name: channel.name().to_string(),
            url: key,
            profile: ExecutionProfile::direct("MultiView"),
            user_agent: String::new(),
            kind: StreamKind::Regular,
            source_file_id: None,
            start_seconds: 0,
        };
        channel.lock_status().await.current = Some(resolved.clone());
        channel.set_current_stream(Some(resolved.clone()));
        channel.set_state(ChannelState::Active);
        channel.record_switch();

        tracing::info!(
            channel_id = channel_id,
            inputs = inputs_len,
            "MultiView composite started"
        );
        self.notifier.notify(ChannelEvent::StreamSwitched {
            channel_id,
            stream_id: resolved.id,
            stream_name: resolved.name,
        });

        Ok(())
    }

    /// Administrative failover: stop the current source so the channel
    /// re-selects
    pub fn force_next_stream(&self, channel_id: ChannelId) -> bool {
        let Some(channel) = self.channel(channel_id) else {
            tracing::warn!(channel_id = channel_id, "Force next stream on unknown channel");
            return false;
        };
        let Some(source) = channel.current_source() else {
            tracing::debug!(channel_id = channel_id, "Force next stream without a source");
            return false;
        };

        tracing::info!(channel_id = channel_id, url = %source.url(), "Forcing next stream");
        self.sources.stop(source.url())
    }

    /// Play a specific stream on a live channel
    pub async fn switch_to_stream(&self, channel_id: ChannelId, stream_id: &str) -> Result<bool> {
        let channel = self
            .channel(channel_id)
            .ok_or(Error::ChannelNotFound(channel_id))?;
        self.switch_to_next_stream(&channel, None, Some(stream_id)).await
    }

    /// Select the next stream for a channel and subscribe it to the source
    ///
    /// Returns `Ok(false)` when selection yields nothing. Source creation is
    /// attempted up to `max_attempts` times before
    /// [`Error::SourceCreationExhausted`]. Retries stop early when `client`
    /// completes or the service shuts down.
    pub async fn switch_to_next_stream(
        &self,
        channel: &Arc<ChannelBroadcaster>,
        client: Option<&ClientConnection>,
        override_stream_id: Option<&str>,
    ) -> Result<bool> {
        let cancel = client
            .map(|c| c.token())
            .unwrap_or_else(|| self.shutdown.child_token());
        self.switch_inner(channel, cancel, override_stream_id, false)
            .await
    }

    async fn switch_inner(
        &self,
        channel: &Arc<ChannelBroadcaster>,
        cancel: CancellationToken,
        override_stream_id: Option<&str>,
        only_if_unhealthy: bool,
    ) -> Result<bool> {
        let channel_id = channel.id();
        let mut status = channel.lock_status().await;

        // Another switch finished while we waited for the lock
        if only_if_unhealthy && channel.has_healthy_source() {
            return Ok(true);
        }

        let _failover = channel.begin_failover();

        if let Some(snapshot) = self.catalog.channel(channel_id).await {
            status.refresh(snapshot);
        }

        // A dead source still holds its source-file slot
        if let Some(dead) = channel.current_source().filter(|s| !s.is_healthy()) {
            channel.replace_source(None);
            self.sources.release(&dead, channel_id);
        }

        let previous = status.current.as_ref().map(|s| s.id.clone());

        let Some(mut resolved) = self
            .selector
            .select_next(&mut status, override_stream_id)
            .await
        else {
            if override_stream_id.is_some() {
                return Ok(false);
            }
            self.settle_idle(channel, &mut status);
            return Ok(false);
        };

        let max_attempts = self.settings.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match self.sources.get_or_create(&resolved, channel_id).await {
                Ok(source) => {
                    if let Some(old) = channel.replace_source(Some(Arc::clone(&source))) {
                        if !Arc::ptr_eq(&old, &source) {
                            self.sources.release(&old, channel_id);
                        }
                    }

                    status.current = Some(resolved.clone());
                    channel.set_current_stream(Some(resolved.clone()));
                    channel.set_state(ChannelState::Active);
                    channel.record_switch();

                    tracing::info!(
                        channel_id = channel_id,
                        stream_id = %resolved.id,
                        stream = %resolved.name,
                        previous = ?previous,
                        attempt = attempt,
                        "Switched stream"
                    );
                    self.notifier.notify(ChannelEvent::StreamSwitched {
                        channel_id,
                        stream_id: resolved.id.clone(),
                        stream_name: resolved.name.clone(),
                    });
                    return Ok(true);
                }
                // Another channel took the last slot after selection; the
                // selector now sees the source file as limited
                Err(Error::SourceFileLimited { source_file_id }) if override_stream_id.is_none() => {
                    tracing::info!(
                        channel_id = channel_id,
                        stream_id = %resolved.id,
                        source_file_id = source_file_id,
                        "Source file filled up, selecting another stream"
                    );
                    match self.selector.select_next(&mut status, None).await {
                        Some(next) => {
                            resolved = next;
                            continue;
                        }
                        None => {
                            self.settle_idle(channel, &mut status);
                            return Ok(false);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        channel_id = channel_id,
                        stream_id = %resolved.id,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        error = %e,
                        "Source creation failed"
                    );
                }
            }

            if attempt < max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(self.settings.retry_delay) => {}
                }
            }
        }

        // Nothing is playing any more unless the previous source survives
        if !channel.has_healthy_source() {
            status.current = None;
            channel.set_current_stream(None);
        }

        tracing::error!(
            channel_id = channel_id,
            stream_id = %resolved.id,
            attempts = max_attempts,
            "Failed to create source broadcaster"
        );
        Err(Error::SourceCreationExhausted {
            channel_id,
            attempts: max_attempts,
        })
    }

    /// No stream left: drop the source, end every viewer and go idle
    fn settle_idle(&self, channel: &Arc<ChannelBroadcaster>, status: &mut ChannelStatus) {
        let channel_id = channel.id();
        if let Some(old) = channel.replace_source(None) {
            self.sources.release(&old, channel_id);
        }
        status.current = None;
        channel.set_current_stream(None);
        channel.set_state(ChannelState::Idle);
        channel.complete_clients();

        tracing::warn!(channel_id = channel_id, "No stream available, channel idle");
        self.notifier.notify(ChannelEvent::ChannelIdle { channel_id });
    }

    /// Detach a viewer; the last viewer out closes the channel
    ///
    /// Returns false if the client was not attached (or already detached).
    pub async fn detach_client(&self, client_id: Uuid) -> bool {
        let Some((_, channel_id)) = self.clients.remove(&client_id) else {
            tracing::debug!(client_id = %client_id, "Detach of unknown client");
            return false;
        };

        let Some(channel) = self.channel(channel_id) else {
            return true;
        };

        let _ops = channel.lock_ops().await;
        if let Some(client) = channel.remove_client(client_id) {
            client.complete();
        }

        tracing::info!(
            channel_id = channel_id,
            client_id = %client_id,
            clients = channel.client_count(),
            "Client detached"
        );
        self.notifier.notify(ChannelEvent::ClientDetached {
            channel_id,
            client_id,
        });

        if channel.client_count() == 0 && !channel.is_failing_over() {
            self.close_channel(&channel).await;
        }
        true
    }

    fn detach_boxed(&self, client_id: Uuid) -> BoxFuture<'_, bool> {
        Box::pin(self.detach_client(client_id))
    }

    async fn detach_children(&self, channel: &ChannelBroadcaster) {
        for child in channel.take_children() {
            child.complete();
            self.detach_boxed(child.id()).await;
        }
    }

    /// Detach the MultiView feeds of a channel whose clients were completed
    ///
    /// A child that can no longer play drops out of its composite instead of
    /// lingering until the MultiView channel closes.
    async fn release_child_feeds(&self, channel: &ChannelBroadcaster) {
        for client in channel.clients() {
            let Some(parent_id) = client.parent_id() else {
                continue;
            };
            if !client.is_completed() {
                continue;
            }

            if let Some(parent) = self.channel(parent_id) {
                parent.remove_child(client.id());
            }
            tracing::info!(
                channel_id = channel.id(),
                parent_id = parent_id,
                "MultiView child dropped out"
            );
            self.detach_boxed(client.id()).await;
        }
    }

    async fn close_if_unused(&self, channel: &Arc<ChannelBroadcaster>) {
        if channel.client_count() == 0 {
            self.close_channel(channel).await;
        }
    }

    /// Stop a channel, release its source and detach MultiView children
    async fn close_channel(&self, channel: &Arc<ChannelBroadcaster>) {
        let channel_id = channel.id();
        let Some(source) = channel.stop() else {
            return;
        };

        self.channels
            .remove_if(&channel_id, |_, c| Arc::ptr_eq(c, channel));
        if let Some(source) = source {
            self.sources.release(&source, channel_id);
        }
        self.detach_children(channel).await;

        tracing::info!(channel_id = channel_id, "Channel closed");
        self.notifier.notify(ChannelEvent::ChannelClosed { channel_id });
    }

    /// Stop every channel and source
    pub fn shutdown(&self) {
        self.shutdown.cancel();

        let channels: Vec<_> = self.channels.iter().map(|c| Arc::clone(c.value())).collect();
        for channel in &channels {
            if let Some(Some(source)) = channel.stop() {
                self.sources.release(&source, channel.id());
            }
            channel.take_children();
        }

        self.channels.clear();
        self.clients.clear();
        self.sources.shutdown();

        tracing::info!(channels = channels.len(), "Channel service shut down");
    }

    pub fn channel_stats(&self) -> Vec<ChannelStats> {
        let mut stats: Vec<_> = self.channels.iter().map(|c| c.stats()).collect();
        stats.sort_by_key(|s| s.channel_id);
        stats
    }

    pub fn source_stats(&self) -> Vec<SourceStats> {
        let mut stats: Vec<_> = self.sources.sources().iter().map(|s| s.stats()).collect();
        stats.sort_by(|a, b| a.url.cmp(&b.url));
        stats
    }
}
