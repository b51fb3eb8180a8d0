//! Composite output for MultiView channels
//!
//! Several child inputs are merged into one output stream. The default muxer
//! interleaves whole 188-byte transport packets, so every child's packets stay
//! intact while inputs take turns in arrival order. Payloads are not inspected.

use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};

use super::upstream::ByteStream;

/// Transport stream packet size
pub const TS_PACKET_SIZE: usize = 188;

/// Merges chunks from several inputs into one output
pub trait Muxer: Send {
    /// Accept a chunk from input `index`; returns bytes ready for output
    fn push(&mut self, index: usize, chunk: &[u8]) -> Option<Bytes>;
}

/// Emits each input's data in whole transport packets
#[derive(Debug)]
pub struct PacketInterleaver {
    pending: Vec<BytesMut>,
}

impl PacketInterleaver {
    pub fn new(inputs: usize) -> Self {
        Self {
            pending: (0..inputs).map(|_| BytesMut::new()).collect(),
        }
    }
}

impl Muxer for PacketInterleaver {
    fn push(&mut self, index: usize, chunk: &[u8]) -> Option<Bytes> {
        let pending = self.pending.get_mut(index)?;
        pending.extend_from_slice(chunk);

        let whole = pending.len() / TS_PACKET_SIZE * TS_PACKET_SIZE;
        if whole == 0 {
            return None;
        }
        Some(pending.split_to(whole).freeze())
    }
}

/// Merge `inputs` through `muxer` into a single stream
///
/// The output ends once every input has ended. An input error is passed
/// through and the remaining inputs keep flowing.
pub fn composite_stream<M>(inputs: Vec<ByteStream>, mut muxer: M) -> ByteStream
where
    M: Muxer + 'static,
{
    let tagged = inputs
        .into_iter()
        .enumerate()
        .map(|(index, input)| input.map(move |item| (index, item)).boxed());

    let merged = stream::select_all(tagged).filter_map(move |(index, item)| {
        let out = match item {
            Ok(chunk) => muxer.push(index, &chunk).map(Ok),
            Err(e) => Some(Err(e)),
        };
        futures::future::ready(out)
    });

    Box::pin(merged)
}
