//! Upstream connections
//!
//! A direct profile reads the URL itself: HTTP(S) through `reqwest`, anything
//! else as a local file. A command profile spawns the configured program and
//! reads its stdout. Either way the result is an opaque byte stream.

use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::process::{Child, Command};
use tokio_util::io::ReaderStream;

use crate::error::{Error, Result};
use crate::model::ResolvedStream;

use super::multiview::TS_PACKET_SIZE;

/// Default read size: 348 transport packets
pub const DEFAULT_CHUNK_SIZE: usize = TS_PACKET_SIZE * 348;

/// Opaque transport stream chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// An established upstream
pub struct Upstream {
    pub body: ByteStream,

    /// Subprocess producing `body`; killed when the upstream is dropped
    child: Option<Child>,
}

impl Upstream {
    pub fn from_stream(body: ByteStream) -> Self {
        Self { body, child: None }
    }

    pub fn from_process(body: ByteStream, child: Child) -> Self {
        Self {
            body,
            child: Some(child),
        }
    }

    /// OS process id of the producing subprocess, if any
    pub fn process_id(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("process_id", &self.process_id())
            .finish()
    }
}

/// Opens upstream connections for resolved streams
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self, stream: &ResolvedStream) -> Result<Upstream>;
}

/// Connector used in production
#[derive(Debug, Clone)]
pub struct DefaultConnector {
    client: reqwest::Client,
    /// Read size for files and process pipes
    chunk_size: usize,
}

impl DefaultConnector {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(TS_PACKET_SIZE);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    async fn connect_http(&self, stream: &ResolvedStream) -> Result<Upstream> {
        let response = self
            .client
            .get(&stream.url)
            .header(reqwest::header::USER_AGENT, &stream.user_agent)
            .send()
            .await
            .map_err(|e| Error::upstream(&stream.url, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::upstream(&stream.url, format!("HTTP status {status}")));
        }

        let body = response.bytes_stream().map(|chunk| chunk.map_err(std::io::Error::other));
        Ok(Upstream::from_stream(Box::pin(body)))
    }

    async fn connect_file(&self, stream: &ResolvedStream) -> Result<Upstream> {
        let file = tokio::fs::File::open(Path::new(&stream.url))
            .await
            .map_err(|e| Error::upstream(&stream.url, e.to_string()))?;
        Ok(Upstream::from_stream(Box::pin(ReaderStream::with_capacity(
            file,
            self.chunk_size,
        ))))
    }

    fn spawn_process(&self, stream: &ResolvedStream) -> Result<Upstream> {
        let profile = &stream.profile;
        let args = profile.render_arguments(&stream.url, &stream.user_agent, stream.start_seconds);

        tracing::debug!(
            url = %stream.url,
            profile = %profile.name,
            command = %profile.command,
            ?args,
            "Spawning upstream process"
        );

        let mut child = Command::new(&profile.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::upstream(&stream.url, format!("failed to spawn {}: {e}", profile.command))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::upstream(&stream.url, "failed to capture process stdout"))?;

        Ok(Upstream::from_process(
            Box::pin(ReaderStream::with_capacity(stdout, self.chunk_size)),
            child,
        ))
    }
}

#[async_trait]
impl UpstreamConnector for DefaultConnector {
    async fn connect(&self, stream: &ResolvedStream) -> Result<Upstream> {
        if !stream.profile.is_direct() {
            return self.spawn_process(stream);
        }

        if is_http(&stream.url) {
            self.connect_http(stream).await
        } else {
            self.connect_file(stream).await
        }
    }
}

fn is_http(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}
