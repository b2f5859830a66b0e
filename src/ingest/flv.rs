//! FLV container demultiplexing (§4.4).
//!
//! No module anywhere in the example pack parses FLV directly; the parser
//! below is a small hand-rolled byte-cursor state machine, grounded generally
//! on the pack's protocol-reader style (an explicit error enum per
//! malformed-input case, incremental reads with `tokio::io::AsyncReadExt`)
//! rather than any one borrowed implementation.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

const FLV_SIGNATURE: &[u8; 3] = b"FLV";
const TAG_TYPE_VIDEO: u8 = 9;
const AVC_PACKET_SEQUENCE_HEADER: u8 = 0;
const AVC_PACKET_NALU: u8 = 1;
const FRAME_TYPE_KEYFRAME: u8 = 1;
const NALU_START_CODE: [u8; 4] = [0, 0, 0, 1];

#[derive(Debug, Error)]
pub enum FlvError {
    #[error("short read: expected {expected} bytes, stream ended")]
    ShortRead { expected: usize },
    #[error("not an FLV stream (bad signature)")]
    BadSignature,
    #[error("malformed tag: {0}")]
    MalformedTag(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FlvError> for crate::AppError {
    fn from(e: FlvError) -> Self {
        crate::AppError::Protocol(e.to_string())
    }
}

/// One decoded video unit, already converted to Annex-B, with the FLV tag's
/// raw timestamp (pts not yet normalized — the caller normalizes, §4.4).
pub enum DecodedVideoTag {
    SequenceHeader {
        sps: Bytes,
        pps: Bytes,
        width: u32,
        height: u32,
    },
    Nalu {
        bytes: Bytes,
        is_keyframe: bool,
        timestamp_ms: u32,
    },
}

/// Incremental FLV tag reader over any `AsyncRead` (a `TcpStream` body in
/// production, an in-memory cursor in tests).
pub struct FlvTagReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FlvTagReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads and validates the 9-byte FLV header plus its trailing 4-byte
    /// "PreviousTagSize0" field.
    pub async fn read_header(&mut self) -> Result<(), FlvError> {
        let mut header = [0u8; 9];
        self.read_exact(&mut header).await?;
        if &header[0..3] != FLV_SIGNATURE {
            return Err(FlvError::BadSignature);
        }
        let mut previous_tag_size0 = [0u8; 4];
        self.read_exact(&mut previous_tag_size0).await?;
        Ok(())
    }

    /// Reads the next tag, returning `None` only for tag types this reader
    /// doesn't interpret (audio, script data) — callers should loop until a
    /// video tag yields `Some`.
    pub async fn next_video_tag(&mut self) -> Result<Option<DecodedVideoTag>, FlvError> {
        loop {
            let mut tag_header = [0u8; 11];
            match self.inner.read_exact(&mut tag_header).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e.into()),
            }

            let tag_type = tag_header[0];
            let data_size = u32::from_be_bytes([0, tag_header[1], tag_header[2], tag_header[3]]);
            let timestamp = u32::from_be_bytes([
                tag_header[7],
                tag_header[4],
                tag_header[5],
                tag_header[6],
            ]);

            let mut payload = BytesMut::zeroed(data_size as usize);
            self.read_exact(&mut payload).await?;

            // PreviousTagSize trailer for this tag.
            let mut trailer = [0u8; 4];
            self.read_exact(&mut trailer).await?;

            if tag_type != TAG_TYPE_VIDEO {
                continue;
            }

            let payload = payload.freeze();
            if let Some(tag) = decode_video_payload(payload, timestamp)? {
                return Ok(Some(tag));
            }
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), FlvError> {
        self.inner
            .read_exact(buf)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => FlvError::ShortRead { expected: buf.len() },
                _ => FlvError::Io(e),
            })?;
        Ok(())
    }
}

fn decode_video_payload(
    mut payload: Bytes,
    timestamp_ms: u32,
) -> Result<Option<DecodedVideoTag>, FlvError> {
    if payload.len() < 5 {
        return Err(FlvError::MalformedTag("video tag shorter than header".into()));
    }
    let frame_and_codec = payload.get_u8();
    let frame_type = frame_and_codec >> 4;
    let codec_id = frame_and_codec & 0x0F;
    if codec_id != 7 {
        // Not AVC; nothing in §4.4 covers other codecs.
        return Ok(None);
    }
    let packet_type = payload.get_u8();
    // 3-byte composition time, unused: pts comes from the tag header (§4.4).
    payload.advance(3);

    match packet_type {
        AVC_PACKET_SEQUENCE_HEADER => parse_avc_decoder_config(payload).map(Some),
        AVC_PACKET_NALU => {
            let is_keyframe = frame_type == FRAME_TYPE_KEYFRAME;
            let annex_b = avcc_to_annex_b(payload)?;
            Ok(Some(DecodedVideoTag::Nalu {
                bytes: annex_b,
                is_keyframe,
                timestamp_ms,
            }))
        }
        _ => Ok(None),
    }
}

fn parse_avc_decoder_config(mut record: Bytes) -> Result<DecodedVideoTag, FlvError> {
    if record.len() < 6 {
        return Err(FlvError::MalformedTag("AVCDecoderConfigurationRecord too short".into()));
    }
    record.advance(4); // version, profile, compatibility, level

    let num_sps = record.get_u8() & 0x1F;
    let mut sps = Bytes::new();
    for i in 0..num_sps {
        if record.remaining() < 2 {
            return Err(FlvError::MalformedTag("truncated SPS length".into()));
        }
        let len = record.get_u16() as usize;
        if record.remaining() < len {
            return Err(FlvError::MalformedTag("truncated SPS data".into()));
        }
        let bytes = record.copy_to_bytes(len);
        if i == 0 {
            sps = bytes;
        }
    }

    if record.remaining() < 1 {
        return Err(FlvError::MalformedTag("missing PPS count".into()));
    }
    let num_pps = record.get_u8();
    let mut pps = Bytes::new();
    for i in 0..num_pps {
        if record.remaining() < 2 {
            return Err(FlvError::MalformedTag("truncated PPS length".into()));
        }
        let len = record.get_u16() as usize;
        if record.remaining() < len {
            return Err(FlvError::MalformedTag("truncated PPS data".into()));
        }
        let bytes = record.copy_to_bytes(len);
        if i == 0 {
            pps = bytes;
        }
    }

    let (width, height) = parse_sps_dimensions(&sps).unwrap_or((0, 0));

    Ok(DecodedVideoTag::SequenceHeader {
        sps,
        pps,
        width,
        height,
    })
}

/// Best-effort width/height extraction is out of scope for correctness of the
/// pipeline (the Fan-Out Hub treats `width`/`height` as informational); a
/// failure here never blocks the sequence header from being emitted.
fn parse_sps_dimensions(_sps: &Bytes) -> Option<(u32, u32)> {
    None
}

/// Converts AVCC length-prefixed NAL units into Annex-B form (§4.4): each
/// 4-byte big-endian length prefix is replaced with a `00 00 00 01` start
/// code, NAL bytes are passed through unchanged.
fn avcc_to_annex_b(mut data: Bytes) -> Result<Bytes, FlvError> {
    let mut out = BytesMut::with_capacity(data.len() + 16);
    while data.has_remaining() {
        if data.remaining() < 4 {
            return Err(FlvError::MalformedTag("truncated NALU length prefix".into()));
        }
        let len = data.get_u32() as usize;
        if data.remaining() < len {
            return Err(FlvError::MalformedTag("truncated NALU payload".into()));
        }
        out.extend_from_slice(&NALU_START_CODE);
        out.extend_from_slice(&data.copy_to_bytes(len));
    }
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn build_sequence_header_tag(sps: &[u8], pps: &[u8]) -> Vec<u8> {
        let mut record = vec![1, 0x64, 0, 0x1f, 0xff, 0xe1];
        record.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        record.extend_from_slice(sps);
        record.push(1);
        record.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        record.extend_from_slice(pps);

        let mut payload = vec![0x17, AVC_PACKET_SEQUENCE_HEADER, 0, 0, 0];
        payload.extend_from_slice(&record);
        wrap_video_tag(payload, 0)
    }

    fn build_nalu_tag(nalu: &[u8], is_keyframe: bool, timestamp: u32) -> Vec<u8> {
        let frame_type = if is_keyframe { 0x10 } else { 0x20 };
        let mut payload = vec![frame_type | 0x07, AVC_PACKET_NALU, 0, 0, 0];
        payload.extend_from_slice(&(nalu.len() as u32).to_be_bytes());
        payload.extend_from_slice(nalu);
        wrap_video_tag(payload, timestamp)
    }

    fn wrap_video_tag(payload: Vec<u8>, timestamp: u32) -> Vec<u8> {
        let mut tag = vec![TAG_TYPE_VIDEO];
        let size = payload.len() as u32;
        tag.extend_from_slice(&size.to_be_bytes()[1..4]);
        let ts_bytes = timestamp.to_be_bytes();
        tag.extend_from_slice(&ts_bytes[1..4]);
        tag.push(ts_bytes[0]);
        tag.extend_from_slice(&[0, 0, 0]); // stream id
        tag.extend_from_slice(&payload);
        tag.extend_from_slice(&(11 + payload.len() as u32).to_be_bytes());
        tag
    }

    fn flv_stream(tags: Vec<Vec<u8>>) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"FLV");
        out.extend_from_slice(&[1, 5, 0, 0, 0, 9]);
        out.extend_from_slice(&[0, 0, 0, 0]);
        for tag in tags {
            out.extend_from_slice(&tag);
        }
        out
    }

    #[tokio::test]
    async fn parses_sequence_header_then_keyframe() {
        let sps = b"sps-bytes";
        let pps = b"pps-bytes";
        let stream = flv_stream(vec![
            build_sequence_header_tag(sps, pps),
            build_nalu_tag(b"idr-nalu", true, 0),
        ]);

        let mut reader = FlvTagReader::new(Cursor::new(stream));
        reader.read_header().await.unwrap();

        match reader.next_video_tag().await.unwrap().unwrap() {
            DecodedVideoTag::SequenceHeader { sps: got_sps, pps: got_pps, .. } => {
                assert_eq!(&got_sps[..], sps);
                assert_eq!(&got_pps[..], pps);
            }
            other => panic!("expected sequence header, got {other:?}"),
        }

        match reader.next_video_tag().await.unwrap().unwrap() {
            DecodedVideoTag::Nalu { bytes, is_keyframe, .. } => {
                assert!(is_keyframe);
                assert_eq!(&bytes[0..4], &NALU_START_CODE);
                assert_eq!(&bytes[4..], b"idr-nalu");
            }
            other => panic!("expected nalu, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn short_stream_ends_cleanly() {
        let stream = flv_stream(vec![]);
        let mut reader = FlvTagReader::new(Cursor::new(stream));
        reader.read_header().await.unwrap();
        assert!(reader.next_video_tag().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_bad_signature() {
        let mut reader = FlvTagReader::new(Cursor::new(b"NOT_FLV_DATA".to_vec()));
        assert!(matches!(reader.read_header().await, Err(FlvError::BadSignature)));
    }

    #[test]
    fn avcc_to_annex_b_inserts_start_codes() {
        let mut avcc = BytesMut::new();
        avcc.extend_from_slice(&4u32.to_be_bytes());
        avcc.extend_from_slice(b"abcd");
        let annex_b = avcc_to_annex_b(avcc.freeze()).unwrap();
        assert_eq!(&annex_b[..], [&NALU_START_CODE[..], b"abcd"].concat());
    }
}

impl std::fmt::Debug for DecodedVideoTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodedVideoTag::SequenceHeader { width, height, .. } => f
                .debug_struct("SequenceHeader")
                .field("width", width)
                .field("height", height)
                .finish(),
            DecodedVideoTag::Nalu {
                is_keyframe,
                timestamp_ms,
                ..
            } => f
                .debug_struct("Nalu")
                .field("is_keyframe", is_keyframe)
                .field("timestamp_ms", timestamp_ms)
                .finish(),
        }
    }
}
