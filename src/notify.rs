//! Best-effort channel state notifications
//!
//! Delivery failures never affect the relay: notifiers are fire-and-forget.

use tokio::sync::broadcast;

use crate::model::ChannelId;

/// Channel state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel now plays a different stream
    StreamSwitched {
        channel_id: ChannelId,
        stream_id: String,
        stream_name: String,
    },
    /// No candidate could be established; the channel went idle
    ChannelIdle { channel_id: ChannelId },
    /// Last client left and the channel was torn down
    ChannelClosed { channel_id: ChannelId },
    ClientAttached {
        channel_id: ChannelId,
        client_id: uuid::Uuid,
    },
    ClientDetached {
        channel_id: ChannelId,
        client_id: uuid::Uuid,
    },
}

/// Receiver of channel events
pub trait ChannelNotifier: Send + Sync {
    fn notify(&self, event: ChannelEvent);
}

/// Notifier that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl ChannelNotifier for LogNotifier {
    fn notify(&self, event: ChannelEvent) {
        tracing::debug!(?event, "Channel event");
    }
}

/// Notifier fanning events out over a broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<ChannelEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.tx.subscribe()
    }
}

impl ChannelNotifier for BroadcastNotifier {
    fn notify(&self, event: ChannelEvent) {
        // No listeners is not an error
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_notifier_delivers() {
        let notifier = BroadcastNotifier::new(8);
        let mut rx = notifier.subscribe();

        notifier.notify(ChannelEvent::ChannelIdle { channel_id: 3 });

        assert_eq!(
            rx.recv().await.unwrap(),
            ChannelEvent::ChannelIdle { channel_id: 3 }
        );
    }

    #[test]
    fn test_notify_without_listeners_is_silent() {
        let notifier = BroadcastNotifier::new(1);
        notifier.notify(ChannelEvent::ChannelClosed { channel_id: 1 });
        LogNotifier.notify(ChannelEvent::ChannelClosed { channel_id: 1 });
    }
}
