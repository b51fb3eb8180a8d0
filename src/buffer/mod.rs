//! Byte buffering between one upstream and many viewers

pub mod ring;

pub use ring::{BufferError, CursorRead, RingBuffer};
