//! Per-client reading of a channel's current source
//!
//! Each client keeps its own cursor into the shared ring buffer. When the
//! channel switches sources the reader follows, starting from the oldest byte
//! the new source still holds.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::source::{ByteStream, SourceBroadcaster};

use super::broadcaster::ChannelBroadcaster;
use super::client::ClientConnection;

/// Reads a channel on behalf of one client
pub struct ChannelReader {
    channel: Arc<ChannelBroadcaster>,
    client: Arc<ClientConnection>,
    source: Option<Arc<SourceBroadcaster>>,
    cursor: u64,
    /// Upper bound on how long a missed wakeup can delay a reader
    poll_interval: Duration,
}

impl ChannelReader {
    pub fn new(
        channel: Arc<ChannelBroadcaster>,
        client: Arc<ClientConnection>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            channel,
            client,
            source: None,
            cursor: 0,
            poll_interval,
        }
    }

    pub fn client(&self) -> &Arc<ClientConnection> {
        &self.client
    }

    /// Next chunk of the channel, or `None` once the client is done
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        let channel = Arc::clone(&self.channel);
        let client = Arc::clone(&self.client);

        loop {
            if client.is_completed() || channel.is_closed() {
                return None;
            }

            let changed = channel.changed();
            tokio::pin!(changed);
            changed.as_mut().enable();

            self.follow(channel.current_source());

            let Some(source) = self.source.clone() else {
                tokio::select! {
                    _ = &mut changed => {}
                    _ = client.completed() => return None,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
                continue;
            };

            let data = source.notified();
            tokio::pin!(data);
            data.as_mut().enable();

            if let Ok(read) = source.read_from(self.cursor) {
                if read.skipped > 0 {
                    tracing::debug!(
                        channel_id = channel.id(),
                        client_id = %client.id(),
                        skipped = read.skipped,
                        "Client lagged behind source"
                    );
                }
                self.cursor = read.next;
                if !read.data.is_empty() {
                    client.record_sent(read.data.len());
                    return Some(read.data);
                }
            }

            tokio::select! {
                _ = &mut data => {}
                _ = &mut changed => {}
                _ = client.completed() => return None,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Switch to `current` if it differs from the source being read
    fn follow(&mut self, current: Option<Arc<SourceBroadcaster>>) {
        let same = match (&self.source, &current) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if same {
            return;
        }

        self.cursor = current
            .as_ref()
            .and_then(|s| s.oldest_position().ok())
            .unwrap_or(0);

        if let Some(source) = &current {
            tracing::debug!(
                channel_id = self.channel.id(),
                client_id = %self.client.id(),
                url = %source.url(),
                "Client following new source"
            );
        }
        self.source = current;
    }

    /// Turn the reader into a byte stream ending when the client completes
    pub fn into_stream(self) -> ByteStream {
        Box::pin(futures::stream::unfold(self, |mut reader| async move {
            reader
                .next_chunk()
                .await
                .map(|chunk| (Ok(chunk), reader))
        }))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio::sync::broadcast;

    use super::*;
    use crate::model::Channel;
    use crate::source::SourceInfo;

    fn source(url: &str) -> Arc<SourceBroadcaster> {
        let (tx, _) = broadcast::channel(4);
        SourceBroadcaster::new(
            SourceInfo {
                url: url.into(),
                ..Default::default()
            },
            64,
            tx,
        )
        .unwrap()
    }

    fn reader(channel: &Arc<ChannelBroadcaster>) -> (ChannelReader, Arc<ClientConnection>) {
        let client = Arc::new(ClientConnection::new(channel.id()));
        let reader = ChannelReader::new(Arc::clone(channel), client.clone(), Duration::from_millis(50));
        (reader, client)
    }

    #[tokio::test]
    async fn test_reads_buffered_then_live_data() {
        let channel = ChannelBroadcaster::new(Channel::new(1, "One"));
        let first = source("http://up/a");
        first.feed(b"old").unwrap();
        channel.replace_source(Some(first.clone()));

        let (mut reader, client) = reader(&channel);
        assert_eq!(&reader.next_chunk().await.unwrap()[..], b"old");

        first.feed(b"live").unwrap();
        assert_eq!(&reader.next_chunk().await.unwrap()[..], b"live");
        assert_eq!(client.bytes_sent(), 7);
    }

    #[tokio::test]
    async fn test_follows_source_switch() {
        let channel = ChannelBroadcaster::new(Channel::new(1, "One"));
        let first = source("http://up/a");
        first.feed(b"first").unwrap();
        channel.replace_source(Some(first.clone()));

        let (mut reader, _client) = reader(&channel);
        assert_eq!(&reader.next_chunk().await.unwrap()[..], b"first");

        first.mark_failed("test");
        let second = source("http://up/b");
        second.feed(b"second").unwrap();
        channel.replace_source(Some(second));
        first.stop();

        assert_eq!(&reader.next_chunk().await.unwrap()[..], b"second");
    }

    #[tokio::test]
    async fn test_waits_for_first_source() {
        let channel = ChannelBroadcaster::new(Channel::new(1, "One"));
        let (reader, _client) = reader(&channel);
        let mut stream = reader.into_stream();

        let late = source("http://up/late");
        late.feed(b"hello").unwrap();
        {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                channel.replace_source(Some(late));
            });
        }

        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"hello");
    }

    #[tokio::test]
    async fn test_ends_when_client_completes() {
        let channel = ChannelBroadcaster::new(Channel::new(1, "One"));
        channel.replace_source(Some(source("http://up/a")));
        let (reader, client) = reader(&channel);
        let mut stream = reader.into_stream();

        client.complete();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_ends_when_channel_stops() {
        let channel = ChannelBroadcaster::new(Channel::new(1, "One"));
        channel.replace_source(Some(source("http://up/a")));
        let (mut reader, _client) = reader(&channel);

        let handle = tokio::spawn(async move { reader.next_chunk().await });
        tokio::task::yield_now().await;
        channel.stop();

        assert!(handle.await.unwrap().is_none());
    }
}
