use bytes::Bytes;

/// A decoded piece of the ingest stream, in the tagged-union shape described by
/// §3. Frames are immutable once constructed and are always shared behind an
/// `Arc`, never cloned byte-for-byte, giving the reference-counted-lifetime
/// behaviour described in §9's design notes without a garbage collector.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Emitted whenever codec config changes; must precede any `Keyframe`.
    VideoSequenceHeader {
        sps: Bytes,
        pps: Bytes,
        width: u32,
        height: u32,
    },
    /// IDR frame in Annex-B form, self-contained (prefixed with current SPS/PPS).
    Keyframe {
        bytes: Bytes,
        pts_ms: u64,
        monotonic_seq: u64,
    },
    /// Non-IDR NAL sequence, Annex-B form.
    InterFrame {
        bytes: Bytes,
        pts_ms: u64,
        monotonic_seq: u64,
    },
}

impl Frame {
    pub fn is_keyframe(&self) -> bool {
        matches!(self, Frame::Keyframe { .. })
    }

    pub fn is_header(&self) -> bool {
        matches!(self, Frame::VideoSequenceHeader { .. })
    }

    pub fn monotonic_seq(&self) -> Option<u64> {
        match self {
            Frame::VideoSequenceHeader { .. } => None,
            Frame::Keyframe { monotonic_seq, .. } => Some(*monotonic_seq),
            Frame::InterFrame { monotonic_seq, .. } => Some(*monotonic_seq),
        }
    }

    /// Annex-B payload bytes, for consumers (WS/HLS/MJPEG) that just want the
    /// wire bytes without caring whether this is a key or inter frame.
    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            Frame::VideoSequenceHeader { .. } => None,
            Frame::Keyframe { bytes, .. } => Some(bytes),
            Frame::InterFrame { bytes, .. } => Some(bytes),
        }
    }
}
