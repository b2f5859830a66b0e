//! On-demand transcoders (§4.6): decode the ingest H.264 stream into the
//! three consumer-facing representations, each activated only while its kind
//! of subscriber is present.

pub mod decoder;
pub mod hls;
pub mod mjpeg;
pub mod mp4;
pub mod snapshot;

pub use decoder::{DecodedImage, H264Decoder};
pub use hls::{HlsState, Part, Segment};
pub use snapshot::SnapshotDecoder;
