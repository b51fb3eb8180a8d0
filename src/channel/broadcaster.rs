//! Per-channel live state
//!
//! Lifecycle of a channel:
//!
//! ```text
//! Idle --select--> Active --source failure--> FailingOver --+--> Active
//!                                                            +--> Idle
//! ```
//!
//! A channel is created on the first attach and closed when its last client
//! leaves with no failover in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::futures::Notified;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard, Notify};
use uuid::Uuid;

use crate::model::{Channel, ChannelId, ResolvedStream};
use crate::source::SourceBroadcaster;
use crate::stats::ChannelStats;

use super::client::ClientConnection;
use super::status::ChannelStatus;

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChannelState {
    /// No stream assigned
    Idle,
    /// Serving a resolved stream
    Active,
    /// Switching to another stream
    FailingOver,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChannelState::Idle => "Idle",
            ChannelState::Active => "Active",
            ChannelState::FailingOver => "FailingOver",
        };
        f.write_str(s)
    }
}

/// Recent switch history, used to back off from flapping upstreams
#[derive(Debug, Default)]
struct SwitchHistory {
    last: Option<tokio::time::Instant>,
    /// Consecutive failovers that each followed a switch within the window
    rapid: u32,
}

/// One live channel
pub struct ChannelBroadcaster {
    id: ChannelId,
    name: String,
    multiview: bool,

    /// Selection state; holding this lock serializes stream switches
    status: AsyncMutex<ChannelStatus>,

    /// Serializes attach and detach
    ops: AsyncMutex<()>,

    failover_in_progress: AtomicBool,
    state: RwLock<ChannelState>,
    source: RwLock<Option<Arc<SourceBroadcaster>>>,
    current: RwLock<Option<ResolvedStream>>,
    clients: DashMap<Uuid, Arc<ClientConnection>>,

    /// Internal clients attached to child channels of a MultiView
    children: Mutex<Vec<Arc<ClientConnection>>>,

    switches: Mutex<SwitchHistory>,

    /// Woken whenever the current source changes
    changed: Notify,
    closed: AtomicBool,
    created_at: Instant,
}

impl ChannelBroadcaster {
    pub fn new(channel: Channel) -> Arc<Self> {
        Arc::new(Self {
            id: channel.id,
            name: channel.name.clone(),
            multiview: channel.is_multiview(),
            status: AsyncMutex::new(ChannelStatus::new(channel)),
            ops: AsyncMutex::new(()),
            failover_in_progress: AtomicBool::new(false),
            state: RwLock::new(ChannelState::Idle),
            source: RwLock::new(None),
            current: RwLock::new(None),
            clients: DashMap::new(),
            children: Mutex::new(Vec::new()),
            switches: Mutex::new(SwitchHistory::default()),
            changed: Notify::new(),
            closed: AtomicBool::new(false),
            created_at: Instant::now(),
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_multiview(&self) -> bool {
        self.multiview
    }

    /// Lock the selection state
    pub async fn lock_status(&self) -> MutexGuard<'_, ChannelStatus> {
        self.status.lock().await
    }

    /// Lock attach/detach for this channel
    pub async fn lock_ops(&self) -> MutexGuard<'_, ()> {
        self.ops.lock().await
    }

    pub fn try_lock_ops(&self) -> Option<MutexGuard<'_, ()>> {
        self.ops.try_lock().ok()
    }

    /// Mark a switch in flight until the guard drops
    pub fn begin_failover(&self) -> FailoverGuard<'_> {
        self.failover_in_progress.store(true, Ordering::SeqCst);
        self.set_state(ChannelState::FailingOver);
        FailoverGuard { channel: self }
    }

    /// Like [`begin_failover`](Self::begin_failover), but only if no switch
    /// is in flight
    pub fn try_begin_failover(&self) -> Option<FailoverGuard<'_>> {
        self.failover_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        self.set_state(ChannelState::FailingOver);
        Some(FailoverGuard { channel: self })
    }

    /// Note that the channel settled on a new source
    pub fn record_switch(&self) {
        self.switches.lock().last = Some(tokio::time::Instant::now());
    }

    /// Pause before the next background failover
    ///
    /// Zero unless the last switch happened less than `window` ago. Each
    /// consecutive failover inside the window doubles `base`, up to `max`.
    pub fn failover_backoff(&self, base: Duration, window: Duration, max: Duration) -> Duration {
        let mut history = self.switches.lock();

        let flapping = history.last.is_some_and(|last| last.elapsed() < window);
        if !flapping {
            history.rapid = 0;
            return Duration::ZERO;
        }

        let exponent = history.rapid.min(16);
        history.rapid = history.rapid.saturating_add(1);
        base.saturating_mul(1u32 << exponent).min(max)
    }

    pub fn is_failing_over(&self) -> bool {
        self.failover_in_progress.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ChannelState {
        *self.state.read()
    }

    pub fn set_state(&self, state: ChannelState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            tracing::debug!(
                channel_id = self.id,
                from = %previous,
                to = %state,
                "Channel state changed"
            );
        }
    }

    pub fn current_source(&self) -> Option<Arc<SourceBroadcaster>> {
        self.source.read().clone()
    }

    /// Whether the channel is fed by a live source
    pub fn has_healthy_source(&self) -> bool {
        self.source.read().as_ref().is_some_and(|s| s.is_healthy())
    }

    /// Swap the current source, returning the previous one
    pub fn replace_source(
        &self,
        source: Option<Arc<SourceBroadcaster>>,
    ) -> Option<Arc<SourceBroadcaster>> {
        let previous = std::mem::replace(&mut *self.source.write(), source);
        self.changed.notify_waiters();
        previous
    }

    pub fn current_stream(&self) -> Option<ResolvedStream> {
        self.current.read().clone()
    }

    pub fn set_current_stream(&self, stream: Option<ResolvedStream>) {
        *self.current.write() = stream;
    }

    /// Future resolved on the next source change or close
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    pub fn add_client(&self, client: Arc<ClientConnection>) {
        self.clients.insert(client.id(), client);
    }

    pub fn remove_client(&self, client_id: Uuid) -> Option<Arc<ClientConnection>> {
        self.clients.remove(&client_id).map(|(_, c)| c)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn clients(&self) -> Vec<Arc<ClientConnection>> {
        self.clients.iter().map(|c| Arc::clone(c.value())).collect()
    }

    /// Signal completion to every attached client
    pub fn complete_clients(&self) {
        for client in self.clients.iter() {
            client.complete();
        }
    }

    pub fn add_child(&self, client: Arc<ClientConnection>) {
        self.children.lock().push(client);
    }

    pub fn take_children(&self) -> Vec<Arc<ClientConnection>> {
        std::mem::take(&mut *self.children.lock())
    }

    /// Forget a child feed that was detached on its own
    pub fn remove_child(&self, client_id: Uuid) -> Option<Arc<ClientConnection>> {
        let mut children = self.children.lock();
        let index = children.iter().position(|c| c.id() == client_id)?;
        Some(children.remove(index))
    }

    pub fn child_count(&self) -> usize {
        self.children.lock().len()
    }

    /// Close the channel: complete clients and hand back the source
    ///
    /// Returns `None` when already closed.
    pub fn stop(&self) -> Option<Option<Arc<SourceBroadcaster>>> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return None;
        }

        self.complete_clients();
        let source = self.replace_source(None);
        self.set_current_stream(None);
        self.set_state(ChannelState::Idle);

        tracing::info!(
            channel_id = self.id,
            uptime_secs = self.created_at.elapsed().as_secs(),
            "Channel stopped"
        );
        Some(source)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ChannelStats {
        let current = self.current_stream();
        ChannelStats {
            channel_id: self.id,
            name: self.name.clone(),
            state: self.state().to_string(),
            clients: self.client_count(),
            current_stream_id: current.as_ref().map(|s| s.id.clone()),
            current_stream_name: current.map(|s| s.name),
            source_url: self.current_source().map(|s| s.url().to_string()),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

impl std::fmt::Debug for ChannelBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelBroadcaster")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("clients", &self.client_count())
            .field("failing_over", &self.is_failing_over())
            .finish()
    }
}

/// Resets the failover flag on every exit path
pub struct FailoverGuard<'a> {
    channel: &'a ChannelBroadcaster,
}

impl Drop for FailoverGuard<'_> {
    fn drop(&mut self) {
        self.channel
            .failover_in_progress
            .store(false, Ordering::SeqCst);

        if self.channel.state() == ChannelState::FailingOver {
            let settled = if self.channel.has_healthy_source() {
                ChannelState::Active
            } else {
                ChannelState::Idle
            };
            self.channel.set_state(settled);
        }
    }
}
