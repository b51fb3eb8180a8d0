//! Upstream sources shared between channels

pub mod broadcaster;
pub mod multiview;
pub mod registry;
pub mod upstream;

pub use broadcaster::{SourceBroadcaster, SourceEvent, SourceInfo};
pub use multiview::{composite_stream, Muxer, PacketInterleaver, TS_PACKET_SIZE};
pub use registry::{SourceProvider, SourceRegistry, SourceSettings};
pub use upstream::{ByteStream, DefaultConnector, Upstream, UpstreamConnector, DEFAULT_CHUNK_SIZE};
