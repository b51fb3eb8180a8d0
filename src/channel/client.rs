//! Downstream viewers

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::model::ChannelId;

use super::service::ChannelService;

/// One downstream viewer
#[derive(Debug)]
pub struct ClientConnection {
    id: Uuid,
    channel_id: ChannelId,
    peer_addr: Option<SocketAddr>,
    user_agent: Option<String>,
    completion: CancellationToken,
    connected_at: Instant,
    bytes_sent: AtomicU64,
    /// MultiView channel this connection feeds, for relay-internal clients
    parent: Option<ChannelId>,
}

impl ClientConnection {
    pub fn new(channel_id: ChannelId) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel_id,
            peer_addr: None,
            user_agent: None,
            completion: CancellationToken::new(),
            connected_at: Instant::now(),
            bytes_sent: AtomicU64::new(0),
            parent: None,
        }
    }

    /// Connection feeding the MultiView channel `parent` from a child channel
    pub fn internal(channel_id: ChannelId, parent: ChannelId) -> Self {
        Self {
            parent: Some(parent),
            ..Self::new(channel_id)
        }
    }

    pub fn with_peer(mut self, peer_addr: SocketAddr) -> Self {
        self.peer_addr = Some(peer_addr);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    pub fn is_internal(&self) -> bool {
        self.parent.is_some()
    }

    pub fn parent_id(&self) -> Option<ChannelId> {
        self.parent
    }

    /// Signal that this client is done (disconnect or channel teardown)
    pub fn complete(&self) {
        self.completion.cancel();
    }

    pub fn is_completed(&self) -> bool {
        self.completion.is_cancelled()
    }

    /// Resolves once the client is completed
    pub fn completed(&self) -> WaitForCancellationFuture<'_> {
        self.completion.cancelled()
    }

    /// Token cancelled on completion, for retry loops acting on behalf of
    /// this client
    pub fn token(&self) -> CancellationToken {
        self.completion.clone()
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

/// Detaches a client exactly once
///
/// Dropping the guard without calling [`ClientGuard::release`] detaches in a
/// spawned task, so every exit path of a request unregisters the viewer.
pub struct ClientGuard {
    service: Arc<ChannelService>,
    client: Arc<ClientConnection>,
    released: AtomicBool,
}

impl ClientGuard {
    pub fn new(service: Arc<ChannelService>, client: Arc<ClientConnection>) -> Self {
        Self {
            service,
            client,
            released: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> &Arc<ClientConnection> {
        &self.client
    }

    /// Detach now
    pub async fn release(self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.service.detach_client(self.client.id()).await;
        }
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        self.client.complete();
        let service = Arc::clone(&self.service);
        let client_id = self.client.id();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    service.detach_client(client_id).await;
                });
            }
            Err(_) => {
                tracing::warn!(client_id = %client_id, "No runtime to detach client on drop");
            }
        }
    }
}
