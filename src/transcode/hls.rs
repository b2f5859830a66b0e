//! HLS / LL-HLS segmenter (§4.6c) — activated while ≥1 HLS subscriber is
//! attached. Subscribes to the hub as `Hls`, accumulates frames between
//! keyframes into fragmented-MP4 segments (target 2s), subdivided into
//! LL-HLS parts (target 200ms). Maintains a sliding window of the last 6
//! segments; segments that fall out of the window are freed.
//!
//! The hub only *tears down* an overflowing HLS subscriber (§4.5); it is this
//! module's job to notice `recv()` returning `None` and resubscribe itself
//! once it next observes a keyframe, which is the first frame any new
//! subscription is primed with.

use super::mp4::{self, Sample, TrackConfig};
use crate::hub::{Frame, FrameFanOutHub, SubscriberKind};
use arc_swap::ArcSwap;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const SEGMENT_TARGET_MS: u64 = 2_000;
const PART_TARGET_MS: u64 = 200;
const WINDOW_SIZE: usize = 6;
/// Timescale of 1000 lets every duration/pts already tracked in ms pass
/// straight into `trun`/`tfdt` without rescaling.
const TIMESCALE: u32 = 1_000;
/// Used for the final sample in a part/segment, whose true duration isn't
/// known until the *next* frame arrives.
const FALLBACK_FRAME_DURATION_MS: u64 = 40;

pub struct Part {
    pub sequence: u64,
    pub fragment: Bytes,
    pub duration_ms: u64,
}

pub struct Segment {
    pub sequence: u64,
    pub duration_ms: u64,
    pub parts: Vec<Arc<Part>>,
}

impl Segment {
    /// Concatenation of every part's fragment bytes — a standard multi-
    /// fragment CMAF segment.
    pub fn data(&self) -> Bytes {
        let mut out = Vec::with_capacity(self.parts.iter().map(|p| p.fragment.len()).sum());
        for p in &self.parts {
            out.extend_from_slice(&p.fragment);
        }
        out.into()
    }
}

/// Shared, lock-free-readable state consumed by the HTTP front-end: the init
/// segment, the sliding segment window, and the live part sequence number
/// (for LL-HLS blocking playlist requests).
pub struct HlsState {
    init_segment: ArcSwap<Option<Bytes>>,
    window: ArcSwap<VecDeque<Arc<Segment>>>,
    media_sequence_base: std::sync::atomic::AtomicU64,
}

impl HlsState {
    pub fn new() -> Self {
        Self {
            init_segment: ArcSwap::from_pointee(None),
            window: ArcSwap::from_pointee(VecDeque::new()),
            media_sequence_base: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn init_segment(&self) -> Option<Bytes> {
        (**self.init_segment.load()).clone()
    }

    pub fn segment(&self, sequence: u64) -> Option<Arc<Segment>> {
        self.window
            .load()
            .iter()
            .find(|s| s.sequence == sequence)
            .cloned()
    }

    pub fn part(&self, segment_sequence: u64, part_sequence: u64) -> Option<Arc<Part>> {
        self.segment(segment_sequence)?
            .parts
            .iter()
            .find(|p| p.sequence == part_sequence)
            .cloned()
    }

    /// Renders `playlist.m3u8` (legacy, whole-segment-only) per the sliding
    /// window currently held.
    pub fn legacy_playlist(&self) -> String {
        let window = self.window.load();
        let mut out = String::new();
        out.push_str("#EXTM3U\n#EXT-X-VERSION:7\n#EXT-X-TARGETDURATION:2\n");
        out.push_str(&format!(
            "#EXT-X-MEDIA-SEQUENCE:{}\n",
            window.front().map(|s| s.sequence).unwrap_or(0)
        ));
        out.push_str("#EXT-X-MAP:URI=\"init.mp4\"\n");
        for seg in window.iter() {
            out.push_str(&format!("#EXTINF:{:.3},\n", seg.duration_ms as f64 / 1000.0));
            out.push_str(&format!("segment-{}.m4s\n", seg.sequence));
        }
        out
    }

    /// Renders the LL-HLS playlist, advertising the current in-progress
    /// parts alongside complete segments.
    pub fn ll_hls_playlist(&self) -> String {
        let window = self.window.load();
        let mut out = String::new();
        out.push_str("#EXTM3U\n#EXT-X-VERSION:9\n#EXT-X-TARGETDURATION:2\n");
        out.push_str("#EXT-X-PART-INF:PART-TARGET=0.2\n");
        out.push_str("#EXT-X-SERVER-CONTROL:CAN-BLOCK-RELOAD=YES,PART-HOLD-BACK=0.6\n");
        out.push_str(&format!(
            "#EXT-X-MEDIA-SEQUENCE:{}\n",
            window.front().map(|s| s.sequence).unwrap_or(0)
        ));
        out.push_str("#EXT-X-MAP:URI=\"init.mp4\"\n");
        for seg in window.iter() {
            for part in &seg.parts {
                out.push_str(&format!(
                    "#EXT-X-PART:DURATION={:.3},URI=\"part-{}-{}.m4s\"{}\n",
                    part.duration_ms as f64 / 1000.0,
                    seg.sequence,
                    part.sequence,
                    if part.sequence == 0 { ",INDEPENDENT=YES" } else { "" }
                ));
            }
            out.push_str(&format!("#EXTINF:{:.3},\n", seg.duration_ms as f64 / 1000.0));
            out.push_str(&format!("segment-{}.m4s\n", seg.sequence));
        }
        out
    }

    fn set_init_segment(&self, init: Bytes) {
        self.init_segment.store(Arc::new(Some(init)));
    }

    fn push_segment(&self, segment: Arc<Segment>) {
        let mut window = (**self.window.load()).clone();
        window.push_back(segment);
        while window.len() > WINDOW_SIZE {
            window.pop_front();
        }
        self.window.store(Arc::new(window));
    }
}

impl Default for HlsState {
    fn default() -> Self {
        Self::new()
    }
}

struct PartBuilder {
    samples: Vec<(Sample, u64)>, // (sample, absolute pts_ms)
    started_at_ms: Option<u64>,
}

impl PartBuilder {
    fn new() -> Self {
        Self {
            samples: Vec::new(),
            started_at_ms: None,
        }
    }

    fn push(&mut self, data: Bytes, is_keyframe: bool, pts_ms: u64) {
        if self.started_at_ms.is_none() {
            self.started_at_ms = Some(pts_ms);
        }
        self.samples.push((
            Sample {
                data,
                duration: FALLBACK_FRAME_DURATION_MS as u32,
                is_keyframe,
            },
            pts_ms,
        ));
    }

    fn elapsed_ms(&self, now_ms: u64) -> u64 {
        self.started_at_ms.map(|start| now_ms.saturating_sub(start)).unwrap_or(0)
    }

    fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Fix up each sample's duration from the gap to the following sample,
    /// falling back to the nominal frame duration for the last one.
    fn finish(mut self, sequence: u64, base_media_decode_time: u64) -> (Arc<Part>, u64) {
        let n = self.samples.len();
        for i in 0..n.saturating_sub(1) {
            let gap = self.samples[i + 1].1.saturating_sub(self.samples[i].1);
            self.samples[i].0.duration = gap.max(1) as u32;
        }
        let total_duration: u64 = self.samples.iter().map(|(s, _)| s.duration as u64).sum();
        let mp4_samples: Vec<Sample> = self
            .samples
            .into_iter()
            .map(|(s, _)| s)
            .collect();
        let fragment = mp4::build_media_fragment(sequence as u32, base_media_decode_time, &mp4_samples);
        (
            Arc::new(Part {
                sequence,
                fragment,
                duration_ms: total_duration,
            }),
            total_duration,
        )
    }
}

struct SegmentBuilder {
    sequence: u64,
    parts: Vec<Arc<Part>>,
    duration_ms: u64,
    current_part: PartBuilder,
    next_part_sequence: u64,
    base_media_decode_time: u64,
}

impl SegmentBuilder {
    fn new(sequence: u64, base_media_decode_time: u64) -> Self {
        Self {
            sequence,
            parts: Vec::new(),
            duration_ms: 0,
            current_part: PartBuilder::new(),
            next_part_sequence: 0,
            base_media_decode_time,
        }
    }

    fn push_sample(&mut self, data: Bytes, is_keyframe: bool, pts_ms: u64) {
        self.current_part.push(data, is_keyframe, pts_ms);
        if self.current_part.elapsed_ms(pts_ms) >= PART_TARGET_MS {
            self.flush_part();
        }
    }

    fn flush_part(&mut self) {
        if self.current_part.is_empty() {
            return;
        }
        let sequence = self.next_part_sequence;
        self.next_part_sequence += 1;
        let base = self.base_media_decode_time + self.duration_ms;
        let part = std::mem::replace(&mut self.current_part, PartBuilder::new());
        let (part, duration) = part.finish(sequence, base);
        self.duration_ms += duration;
        self.parts.push(part);
    }

    fn finish(mut self) -> Arc<Segment> {
        self.flush_part();
        Arc::new(Segment {
            sequence: self.sequence,
            duration_ms: self.duration_ms,
            parts: self.parts,
        })
    }
}

fn annex_b_to_avcc(annex_b: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(annex_b.len());
    for nalu in split_annex_b(annex_b) {
        out.extend_from_slice(&(nalu.len() as u32).to_be_bytes());
        out.extend_from_slice(nalu);
    }
    out.into()
}

fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push(i + 3);
            i += 3;
        } else if i + 4 <= data.len() && data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 0 && data[i + 3] == 1 {
            starts.push(i + 4);
            i += 4;
        } else {
            i += 1;
        }
    }
    let mut out = Vec::with_capacity(starts.len());
    for (idx, &start) in starts.iter().enumerate() {
        let end = starts
            .get(idx + 1)
            .map(|&next| next - if data.get(next.wrapping_sub(4)) == Some(&1) { 4 } else { 3 })
            .unwrap_or(data.len());
        if end > start {
            out.push(&data[start..end]);
        }
    }
    out
}

/// Runs for the lifetime of the printer. Internally resubscribes whenever the
/// hub tears the HLS subscription down on overflow.
pub async fn run(hub: Arc<FrameFanOutHub>, state: Arc<HlsState>, cancel: CancellationToken) {
    let mut sequence: u64 = 0;
    let mut base_media_decode_time: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return;
        }
        let (next_seq, next_base) = run_session(&hub, &state, &cancel, sequence, base_media_decode_time).await;
        sequence = next_seq;
        base_media_decode_time = next_base;
        if cancel.is_cancelled() {
            return;
        }
    }
}

async fn run_session(
    hub: &Arc<FrameFanOutHub>,
    state: &Arc<HlsState>,
    cancel: &CancellationToken,
    mut sequence: u64,
    mut base_media_decode_time: u64,
) -> (u64, u64) {
    let sub = hub.subscribe(SubscriberKind::Hls);
    let mut segment: Option<SegmentBuilder> = None;

    loop {
        let frame = tokio::select! {
            frame = sub.recv() => frame,
            _ = cancel.cancelled() => return (sequence, base_media_decode_time),
        };

        let Some(frame) = frame else {
            // Torn down by the hub; caller will resubscribe. Drop any
            // partially built segment — it starts again cleanly on the next
            // keyframe.
            return (sequence, base_media_decode_time);
        };

        match &*frame {
            Frame::VideoSequenceHeader { sps, pps, width, height } => {
                let init = mp4::build_init_segment(&TrackConfig {
                    sps: sps.clone(),
                    pps: pps.clone(),
                    width: *width,
                    height: *height,
                    timescale: TIMESCALE,
                });
                state.set_init_segment(init);
            }
            Frame::Keyframe { bytes, pts_ms, .. } => {
                if let Some(builder) = segment.take() {
                    if builder.duration_ms >= SEGMENT_TARGET_MS || builder.parts.is_empty() {
                        // Either past target or nothing usable was ever
                        // flushed (degenerate first GOP); close it out
                        // either way so we don't stall forever.
                        let finished = builder.finish();
                        base_media_decode_time += finished.duration_ms;
                        state.push_segment(finished);
                        sequence += 1;
                        segment = Some(SegmentBuilder::new(sequence, base_media_decode_time));
                    } else {
                        segment = Some(builder);
                    }
                } else {
                    segment = Some(SegmentBuilder::new(sequence, base_media_decode_time));
                }
                if let Some(builder) = segment.as_mut() {
                    builder.push_sample(annex_b_to_avcc(bytes), true, *pts_ms);
                }
            }
            Frame::InterFrame { bytes, pts_ms, .. } => {
                if let Some(builder) = segment.as_mut() {
                    builder.push_sample(annex_b_to_avcc(bytes), false, *pts_ms);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_annex_b_finds_both_nalus() {
        let mut data = Vec::new();
        data.extend_from_slice(&[0, 0, 0, 1]);
        data.extend_from_slice(b"sps-data");
        data.extend_from_slice(&[0, 0, 0, 1]);
        data.extend_from_slice(b"pps");
        let nalus = split_annex_b(&data);
        assert_eq!(nalus.len(), 2);
        assert_eq!(nalus[0], b"sps-data");
        assert_eq!(nalus[1], b"pps");
    }

    #[test]
    fn annex_b_to_avcc_prefixes_each_nalu_with_length() {
        let mut data = Vec::new();
        data.extend_from_slice(&[0, 0, 0, 1]);
        data.extend_from_slice(b"abc");
        let avcc = annex_b_to_avcc(&data);
        assert_eq!(&avcc[0..4], &3u32.to_be_bytes());
        assert_eq!(&avcc[4..7], b"abc");
    }

    #[test]
    fn hls_state_starts_with_empty_playlist_window() {
        let state = HlsState::new();
        assert!(state.init_segment().is_none());
        let playlist = state.legacy_playlist();
        assert!(playlist.starts_with("#EXTM3U"));
    }

    #[test]
    fn part_builder_assigns_durations_from_gaps() {
        let mut builder = PartBuilder::new();
        builder.push(Bytes::from_static(b"a"), true, 0);
        builder.push(Bytes::from_static(b"b"), false, 40);
        builder.push(Bytes::from_static(b"c"), false, 80);
        let (part, duration) = builder.finish(0, 0);
        assert_eq!(duration, 40 + 40 + FALLBACK_FRAME_DURATION_MS);
        assert!(!part.fragment.is_empty());
    }
}
