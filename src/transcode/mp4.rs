//! Minimal fragmented-MP4 box writer (§4.6c). No crate in the example pack
//! mixes in an mp4 muxer — the closest precedent is the dependency *shape* of
//! the pack's SentryShot manifest, which carries dedicated `hls`/`mp4`
//! workspace members rather than an external muxing crate. This module is
//! hand-rolled accordingly: plain big-endian box writers, no external
//! dependency.

use bytes::{BufMut, Bytes, BytesMut};

fn write_box(out: &mut BytesMut, fourcc: &[u8; 4], body: impl FnOnce(&mut BytesMut)) {
    let size_pos = out.len();
    out.put_u32(0); // patched below
    out.put_slice(fourcc);
    body(out);
    let size = (out.len() - size_pos) as u32;
    out[size_pos..size_pos + 4].copy_from_slice(&size.to_be_bytes());
}

fn full_box(out: &mut BytesMut, version: u8, flags: u32) {
    out.put_u8(version);
    out.put_uint(flags as u64, 3);
}

/// Video track parameters learned from the `VideoSequenceHeader` (§3).
pub struct TrackConfig {
    pub sps: Bytes,
    pub pps: Bytes,
    pub width: u32,
    pub height: u32,
    pub timescale: u32,
}

/// Builds `/hls/init.mp4`: `ftyp` + a `moov` describing one AVC video track
/// with no pre-populated samples (all samples arrive in `moof`/`mdat`
/// fragments), per the fragmented-MP4 / CMAF convention.
pub fn build_init_segment(track: &TrackConfig) -> Bytes {
    let mut out = BytesMut::new();

    write_box(&mut out, b"ftyp", |out| {
        out.put_slice(b"iso5");
        out.put_u32(512);
        out.put_slice(b"iso5");
        out.put_slice(b"iso6");
        out.put_slice(b"mp41");
    });

    write_box(&mut out, b"moov", |out| {
        write_box(out, b"mvhd", |out| {
            full_box(out, 0, 0);
            out.put_u32(0); // creation_time
            out.put_u32(0); // modification_time
            out.put_u32(track.timescale);
            out.put_u32(0); // duration (fragmented: unknown up front)
            out.put_u32(0x00010000); // rate 1.0
            out.put_u16(0x0100); // volume 1.0
            out.put_u16(0); // reserved
            out.put_u64(0); // reserved
            write_identity_matrix(out);
            for _ in 0..6 {
                out.put_u32(0); // pre_defined
            }
            out.put_u32(2); // next_track_id
        });

        write_box(out, b"trak", |out| {
            write_box(out, b"tkhd", |out| {
                full_box(out, 0, 0x000007); // enabled, in movie, in preview
                out.put_u32(0);
                out.put_u32(0);
                out.put_u32(1); // track_id
                out.put_u32(0); // reserved
                out.put_u32(0); // duration
                out.put_u64(0); // reserved
                out.put_u16(0); // layer
                out.put_u16(0); // alternate_group
                out.put_u16(0); // volume
                out.put_u16(0); // reserved
                write_identity_matrix(out);
                out.put_u32(track.width << 16);
                out.put_u32(track.height << 16);
            });

            write_box(out, b"mdia", |out| {
                write_box(out, b"mdhd", |out| {
                    full_box(out, 0, 0);
                    out.put_u32(0);
                    out.put_u32(0);
                    out.put_u32(track.timescale);
                    out.put_u32(0);
                    out.put_u16(0x55c4); // language 'und'
                    out.put_u16(0);
                });
                write_box(out, b"hdlr", |out| {
                    full_box(out, 0, 0);
                    out.put_u32(0);
                    out.put_slice(b"vide");
                    out.put_u32(0);
                    out.put_u32(0);
                    out.put_u32(0);
                    out.put_slice(b"acproxycam video handler\0");
                });
                write_box(out, b"minf", |out| {
                    write_box(out, b"vmhd", |out| {
                        full_box(out, 0, 1);
                        out.put_u16(0);
                        out.put_u16(0);
                        out.put_u16(0);
                        out.put_u16(0);
                    });
                    write_box(out, b"dinf", |out| {
                        write_box(out, b"dref", |out| {
                            full_box(out, 0, 0);
                            out.put_u32(1);
                            write_box(out, b"url ", |out| {
                                full_box(out, 0, 1); // self-contained
                            });
                        });
                    });
                    write_box(out, b"stbl", |out| {
                        write_box(out, b"stsd", |out| {
                            full_box(out, 0, 0);
                            out.put_u32(1);
                            write_avc1_entry(out, track);
                        });
                        // Empty sample tables: all sample data lives in moof/mdat.
                        write_box(out, b"stts", |out| {
                            full_box(out, 0, 0);
                            out.put_u32(0);
                        });
                        write_box(out, b"stsc", |out| {
                            full_box(out, 0, 0);
                            out.put_u32(0);
                        });
                        write_box(out, b"stsz", |out| {
                            full_box(out, 0, 0);
                            out.put_u32(0);
                            out.put_u32(0);
                        });
                        write_box(out, b"stco", |out| {
                            full_box(out, 0, 0);
                            out.put_u32(0);
                        });
                    });
                });
            });
        });

        write_box(out, b"mvex", |out| {
            write_box(out, b"trex", |out| {
                full_box(out, 0, 0);
                out.put_u32(1); // track_id
                out.put_u32(1); // default_sample_description_index
                out.put_u32(0); // default_sample_duration
                out.put_u32(0); // default_sample_size
                out.put_u32(0); // default_sample_flags
            });
        });
    });

    out.freeze()
}

fn write_avc1_entry(out: &mut BytesMut, track: &TrackConfig) {
    write_box(out, b"avc1", |out| {
        out.put_u32(0); // reserved + reserved
        out.put_u16(0); // reserved
        out.put_u16(1); // data_reference_index
        out.put_u16(0); // pre_defined
        out.put_u16(0); // reserved
        for _ in 0..3 {
            out.put_u32(0); // pre_defined
        }
        out.put_u16(track.width as u16);
        out.put_u16(track.height as u16);
        out.put_u32(0x00480000); // horizresolution 72dpi
        out.put_u32(0x00480000); // vertresolution 72dpi
        out.put_u32(0); // reserved
        out.put_u16(1); // frame_count
        out.put_bytes(0, 32); // compressorname
        out.put_u16(0x0018); // depth
        out.put_i16(-1); // pre_defined

        write_box(out, b"avcC", |out| {
            out.put_u8(1); // configurationVersion
            out.put_u8(track.sps.get(1).copied().unwrap_or(0x64)); // profile
            out.put_u8(track.sps.get(2).copied().unwrap_or(0));
            out.put_u8(track.sps.get(3).copied().unwrap_or(0x1f)); // level
            out.put_u8(0xff); // 6 bits reserved + lengthSizeMinusOne=3
            out.put_u8(0xe1); // 3 bits reserved + numOfSPS=1
            out.put_u16(track.sps.len() as u16);
            out.put_slice(&track.sps);
            out.put_u8(1); // numOfPPS
            out.put_u16(track.pps.len() as u16);
            out.put_slice(&track.pps);
        });
    });
}

fn write_identity_matrix(out: &mut BytesMut) {
    const MATRIX: [u32; 9] = [
        0x00010000,
        0,
        0,
        0,
        0x00010000,
        0,
        0,
        0,
        0x40000000,
    ];
    for v in MATRIX {
        out.put_u32(v);
    }
}

/// One AVCC-length-prefixed sample (Annex-B NALUs re-joined with 4-byte
/// lengths, as fMP4 `mdat` payloads require).
pub struct Sample {
    pub data: Bytes,
    pub duration: u32,
    pub is_keyframe: bool,
}

/// Builds one `moof` + `mdat` pair for a segment/part, per CMAF fragment
/// layout. `sequence_number` must be unique and increasing across the whole
/// session (used by players to detect gaps).
pub fn build_media_fragment(
    sequence_number: u32,
    base_media_decode_time: u64,
    samples: &[Sample],
) -> Bytes {
    let mut out = BytesMut::new();
    let data_offset_patch_pos;

    write_box(&mut out, b"moof", |out| {
        write_box(out, b"mfhd", |out| {
            full_box(out, 0, 0);
            out.put_u32(sequence_number);
        });
        write_box(out, b"traf", |out| {
            write_box(out, b"tfhd", |out| {
                full_box(out, 0, 0x020000); // default-base-is-moof
                out.put_u32(1); // track_id
            });
            write_box(out, b"tfdt", |out| {
                full_box(out, 1, 0);
                out.put_u64(base_media_decode_time);
            });
            write_box(out, b"trun", |out| {
                full_box(out, 1, 0x000705); // data-offset + first-sample-flags + duration+size+flags present
                out.put_u32(samples.len() as u32);
                out.put_i32(0); // data_offset placeholder, patched below
                let first_flags: u32 = if samples.first().map(|s| s.is_keyframe).unwrap_or(false) {
                    0x0200_0000 // sample_depends_on = 2 (not a keyframe dependency)
                } else {
                    0x0101_0000 // non-sync sample
                };
                out.put_u32(first_flags);
                for s in samples {
                    out.put_u32(s.duration);
                    out.put_u32(s.data.len() as u32);
                    out.put_u32(if s.is_keyframe { 0x0200_0000 } else { 0x0101_0000 });
                }
            });
        });
    });

    data_offset_patch_pos = out.len();
    let moof_len = out.len() as i32;

    write_box(&mut out, b"mdat", |out| {
        for s in samples {
            out.put_slice(&s.data);
        }
    });

    // Patch trun's data_offset: distance from the start of `moof` to the
    // first byte of sample data in `mdat` (moof length + mdat header = 8).
    patch_trun_data_offset(&mut out, moof_len + 8, data_offset_patch_pos);

    out.freeze()
}

/// `trun`'s `data_offset` field sits at a fixed relative position given the
/// flags used above (full box header [4] + sample_count [4] = offset 8 into
/// the trun body, i.e. right after fixed header fields we always write in
/// the same order). We locate it by re-scanning rather than hardcoding a
/// byte offset across nested boxes, which is fragile to box-size changes.
fn patch_trun_data_offset(out: &mut BytesMut, data_offset: i32, search_limit: usize) {
    let needle = b"trun";
    if let Some(pos) = out[..search_limit]
        .windows(4)
        .position(|w| w == needle)
    {
        // Layout after the 4-byte fourcc: version+flags(4) + sample_count(4)
        // + data_offset(4).
        let offset_pos = pos + 4 + 4 + 4;
        if offset_pos + 4 <= out.len() {
            out[offset_pos..offset_pos + 4].copy_from_slice(&data_offset.to_be_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_segment_starts_with_ftyp() {
        let track = TrackConfig {
            sps: Bytes::from_static(&[0x67, 0x64, 0, 0x1f]),
            pps: Bytes::from_static(&[0x68, 0xee]),
            width: 1920,
            height: 1080,
            timescale: 90_000,
        };
        let init = build_init_segment(&track);
        assert_eq!(&init[4..8], b"ftyp");
    }

    #[test]
    fn media_fragment_starts_with_moof_then_mdat() {
        let samples = vec![Sample {
            data: Bytes::from_static(b"nalu-bytes"),
            duration: 3000,
            is_keyframe: true,
        }];
        let frag = build_media_fragment(1, 0, &samples);
        assert_eq!(&frag[4..8], b"moof");
        let moof_size = u32::from_be_bytes(frag[0..4].try_into().unwrap()) as usize;
        assert_eq!(&frag[moof_size + 4..moof_size + 8], b"mdat");
    }
}
