//! Fixed-capacity byte ring buffer shared between one writer and many readers
//!
//! The ingest loop of a source writes upstream chunks with [`RingBuffer::write`];
//! oldest bytes are overwritten once the buffer is full. Readers either take a
//! non-destructive snapshot ([`RingBuffer::read_all`]) or follow the stream with
//! their own cursor ([`RingBuffer::read_from`]), so any number of viewers can
//! consume the same upstream independently.
//!
//! Every byte ever written has a sequence number. The buffer retains the range
//! `[written - size, written)`; a reader cursor is simply the sequence number of
//! the next byte it wants.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

/// Errors raised on buffer misuse
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// The buffer was disposed and can no longer be used
    #[error("ring buffer has been disposed")]
    Disposed,

    /// Mark-read count is zero or larger than the buffered size
    #[error("invalid count {count} for marking data as read (size {size})")]
    InvalidCount { count: usize, size: usize },

    /// Capacity must be greater than zero
    #[error("ring buffer capacity must be greater than zero")]
    InvalidCapacity,
}

/// Result of a cursor read
#[derive(Debug, Clone)]
pub struct CursorRead {
    /// Bytes available from the requested cursor, in order
    pub data: Bytes,
    /// Cursor to pass to the next read
    pub next: u64,
    /// Bytes the reader missed because they were overwritten before it caught up
    pub skipped: u64,
}

struct RingState {
    buf: Box<[u8]>,
    start: usize,
    end: usize,
    size: usize,
    /// Total bytes ever written (sequence number of the next byte)
    written: u64,
}

impl RingState {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Copy `len` bytes starting at logical offset `offset` from `start`
    fn copy_range(&self, offset: usize, len: usize) -> Bytes {
        let mut out = BytesMut::with_capacity(len);
        if len == 0 {
            return out.freeze();
        }

        let cap = self.capacity();
        let from = (self.start + offset) % cap;
        let first = len.min(cap - from);
        out.extend_from_slice(&self.buf[from..from + first]);
        if first < len {
            out.extend_from_slice(&self.buf[..len - first]);
        }
        out.freeze()
    }
}

/// Thread-safe circular byte buffer
///
/// All operations are serialized by one internal lock so a reader never
/// observes a torn write. Disposal is idempotent and leaves the contents in
/// place; every later operation fails with [`BufferError::Disposed`].
pub struct RingBuffer {
    state: Mutex<RingState>,
    disposed: AtomicBool,
}

impl RingBuffer {
    /// Create a buffer holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::InvalidCapacity);
        }

        Ok(Self {
            state: Mutex::new(RingState {
                buf: vec![0u8; capacity].into_boxed_slice(),
                start: 0,
                end: 0,
                size: 0,
                written: 0,
            }),
            disposed: AtomicBool::new(false),
        })
    }

    fn check_disposed(&self) -> Result<(), BufferError> {
        if self.disposed.load(Ordering::Acquire) {
            Err(BufferError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Append data, overwriting the oldest bytes when full
    ///
    /// If `data` is larger than the capacity only its trailing `capacity`
    /// bytes are kept.
    pub fn write(&self, data: &[u8]) -> Result<(), BufferError> {
        self.check_disposed()?;
        let mut state = self.state.lock();
        let cap = state.capacity();

        let dropped = data.len().saturating_sub(cap);
        let data = &data[dropped..];
        let len = data.len();
        if len == 0 {
            return Ok(());
        }

        let end = state.end;
        if end + len <= cap {
            state.buf[end..end + len].copy_from_slice(data);
        } else {
            let first = cap - end;
            state.buf[end..].copy_from_slice(&data[..first]);
            state.buf[..len - first].copy_from_slice(&data[first..]);
        }

        state.end = (end + len) % cap;
        state.written += (dropped + len) as u64;

        let new_size = state.size + len;
        if new_size >= cap {
            state.size = cap;
            state.start = state.end;
        } else {
            state.size = new_size;
        }

        Ok(())
    }

    /// Snapshot of all buffered bytes in logical order
    pub fn read_all(&self) -> Result<Bytes, BufferError> {
        self.check_disposed()?;
        let state = self.state.lock();
        Ok(state.copy_range(0, state.size))
    }

    /// Read everything retained from `cursor` onwards
    ///
    /// A cursor older than the oldest retained byte is moved forward and the
    /// gap is reported in [`CursorRead::skipped`]. A cursor ahead of the write
    /// position returns no data and is clamped to it.
    pub fn read_from(&self, cursor: u64) -> Result<CursorRead, BufferError> {
        self.check_disposed()?;
        let state = self.state.lock();
        let oldest = state.written - state.size as u64;

        if cursor >= state.written {
            return Ok(CursorRead {
                data: Bytes::new(),
                next: state.written,
                skipped: 0,
            });
        }

        let (from, skipped) = if cursor < oldest {
            (oldest, oldest - cursor)
        } else {
            (cursor, 0)
        };

        let offset = (from - oldest) as usize;
        let len = (state.written - from) as usize;

        Ok(CursorRead {
            data: state.copy_range(offset, len),
            next: state.written,
            skipped,
        })
    }

    /// Sequence number of the next byte to be written
    ///
    /// New readers start here to receive only live data.
    pub fn write_position(&self) -> Result<u64, BufferError> {
        self.check_disposed()?;
        Ok(self.state.lock().written)
    }

    /// Sequence number of the oldest retained byte
    pub fn oldest_position(&self) -> Result<u64, BufferError> {
        self.check_disposed()?;
        let state = self.state.lock();
        Ok(state.written - state.size as u64)
    }

    /// Consume `count` bytes from the front
    pub fn mark_read(&self, count: usize) -> Result<(), BufferError> {
        self.check_disposed()?;
        let mut state = self.state.lock();

        if count == 0 || count > state.size {
            return Err(BufferError::InvalidCount {
                count,
                size: state.size,
            });
        }

        state.start = (state.start + count) % state.capacity();
        state.size -= count;
        Ok(())
    }

    /// Like [`mark_read`](Self::mark_read) but reports an invalid count as `false`
    pub fn try_mark_read(&self, count: usize) -> Result<bool, BufferError> {
        match self.mark_read(count) {
            Ok(()) => Ok(true),
            Err(BufferError::InvalidCount { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Drop all buffered bytes
    ///
    /// The write sequence keeps counting so existing reader cursors stay valid.
    pub fn clear(&self) -> Result<(), BufferError> {
        self.check_disposed()?;
        let mut state = self.state.lock();
        state.start = 0;
        state.end = 0;
        state.size = 0;
        Ok(())
    }

    /// Number of buffered bytes
    pub fn size(&self) -> Result<usize, BufferError> {
        self.check_disposed()?;
        Ok(self.state.lock().size)
    }

    /// Total capacity in bytes
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity()
    }

    /// Whether the buffer holds `capacity` bytes
    pub fn is_full(&self) -> Result<bool, BufferError> {
        self.check_disposed()?;
        let state = self.state.lock();
        Ok(state.size == state.capacity())
    }

    /// Mark the buffer disposed; contents are left untouched
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    /// Whether [`dispose`](Self::dispose) has been called
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RingBuffer")
            .field("capacity", &state.capacity())
            .field("size", &state.size)
            .field("written", &state.written)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
