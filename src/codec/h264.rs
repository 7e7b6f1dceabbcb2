// Copyright (C) 2026 the rtsp-pull authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.264](https://www.itu.int/rec/T-REC-H.264-201906-I/en)-encoded video.
//!
//! Converts the RTP payloads of one access unit to an Annex B byte stream as
//! specified in [RFC 6184](https://tools.ietf.org/html/rfc6184): single NAL
//! units, STAP-A aggregates, and FU-A fragments (non-interleaved mode).

use bytes::{Buf, Bytes};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// NAL unit types 1-23 are single-NAL payloads.
const MAX_SINGLE_NAL_TYPE: u8 = 23;
const STAP_A: u8 = 24;
const FU_A: u8 = 28;

#[derive(Debug, Default)]
pub(crate) struct Depacketizer {
    /// An FU-A reassembly in progress, starting with the reconstructed NAL
    /// header. Fragment runs may span packet groups, so this survives between
    /// `assemble` calls.
    fragment: Option<Vec<u8>>,
}

impl Depacketizer {
    pub(crate) fn assemble(&mut self, payloads: &[Bytes]) -> Result<Option<Bytes>, String> {
        let mut out = Vec::new();
        for payload in payloads {
            self.push_payload(payload, &mut out)?;
        }
        if out.is_empty() {
            // Nothing completed; an unfinished fragment (if any) is retained.
            return Ok(None);
        }
        Ok(Some(Bytes::from(out)))
    }

    fn push_payload(&mut self, payload: &[u8], out: &mut Vec<u8>) -> Result<(), String> {
        let mut data = payload;
        if data.is_empty() {
            return Err("empty RTP payload".to_owned());
        }
        let nal_header = data[0];
        if (nal_header >> 7) != 0 {
            return Err(format!("NAL header {nal_header:02x} has F bit set"));
        }
        match nal_header & 0b1_1111 {
            1..=MAX_SINGLE_NAL_TYPE => {
                // https://tools.ietf.org/html/rfc6184#section-5.6
                if self.fragment.take().is_some() {
                    return Err("single NAL while FU-A in progress".to_owned());
                }
                out.extend_from_slice(&START_CODE);
                out.extend_from_slice(data);
            }
            STAP_A => {
                // https://tools.ietf.org/html/rfc6184#section-5.7.1
                if self.fragment.take().is_some() {
                    return Err("STAP-A while FU-A in progress".to_owned());
                }
                data.advance(1);
                while data.has_remaining() {
                    if data.remaining() < 2 {
                        return Err(format!(
                            "STAP-A has {} remaining bytes while expecting 2-byte length",
                            data.remaining()
                        ));
                    }
                    let len = usize::from(data.get_u16());
                    if len == 0 {
                        return Err("zero length in STAP-A".to_owned());
                    }
                    if data.remaining() < len {
                        return Err(format!(
                            "STAP-A too short: {} bytes remaining, expecting {len}-byte NAL",
                            data.remaining()
                        ));
                    }
                    out.extend_from_slice(&START_CODE);
                    out.extend_from_slice(&data[..len]);
                    data.advance(len);
                }
            }
            FU_A => {
                // https://tools.ietf.org/html/rfc6184#section-5.8
                if data.len() < 2 {
                    return Err("FU-A too short".to_owned());
                }
                let fu_header = data[1];
                let start = (fu_header & 0b1000_0000) != 0;
                let end = (fu_header & 0b0100_0000) != 0;
                let reserved = (fu_header & 0b0010_0000) != 0;
                if (start && end) || reserved {
                    return Err(format!("invalid FU-A header {fu_header:08b}"));
                }
                let reconstructed = (nal_header & 0b0110_0000) | (fu_header & 0b1_1111);
                if start {
                    if self.fragment.is_some() {
                        self.fragment = None;
                        return Err("FU-A start bit while fragment in progress".to_owned());
                    }
                    let mut frag = Vec::with_capacity(data.len() - 1);
                    frag.push(reconstructed);
                    frag.extend_from_slice(&data[2..]);
                    self.fragment = Some(frag);
                } else {
                    let frag = match self.fragment.as_mut() {
                        Some(frag) => frag,
                        // Continuation without a start; the head was lost.
                        None => return Err("FU-A continuation without start".to_owned()),
                    };
                    let got = frag[0];
                    if got != reconstructed {
                        self.fragment = None;
                        return Err(format!(
                            "FU-A has inconsistent NAL type: {got:02x} then {reconstructed:02x}"
                        ));
                    }
                    frag.extend_from_slice(&data[2..]);
                }
                if end {
                    let frag = self.fragment.take().expect("fragment present at FU-A end");
                    out.extend_from_slice(&START_CODE);
                    out.extend_from_slice(&frag);
                }
            }
            t => return Err(format!("unimplemented NAL type {t} (header {nal_header:02x})")),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(d: &mut Depacketizer, payloads: &[&[u8]]) -> Result<Option<Bytes>, String> {
        let payloads: Vec<Bytes> = payloads.iter().map(|p| Bytes::copy_from_slice(p)).collect();
        d.assemble(&payloads)
    }

    #[test]
    fn single_nal() {
        let mut d = Depacketizer::default();
        let out = assemble(&mut d, &[b"\x65\x88\x84\x21"]).unwrap().unwrap();
        assert_eq!(&out[..], b"\x00\x00\x00\x01\x65\x88\x84\x21");
    }

    #[test]
    fn stap_a() {
        let mut d = Depacketizer::default();
        // SPS (2 bytes) + PPS (3 bytes) aggregated.
        let out = assemble(&mut d, &[b"\x18\x00\x02\x67\x42\x00\x03\x68\xce\x06"])
            .unwrap()
            .unwrap();
        assert_eq!(
            &out[..],
            b"\x00\x00\x00\x01\x67\x42\x00\x00\x00\x01\x68\xce\x06"
        );
    }

    #[test]
    fn fu_a_within_one_group() {
        let mut d = Depacketizer::default();
        // IDR NAL 0x65 split in three: indicator 0x7c (NRI=3, type 28).
        let out = assemble(
            &mut d,
            &[b"\x7c\x85\xaa\xbb", b"\x7c\x05\xcc", b"\x7c\x45\xdd"],
        )
        .unwrap()
        .unwrap();
        assert_eq!(&out[..], b"\x00\x00\x00\x01\x65\xaa\xbb\xcc\xdd");
    }

    #[test]
    fn fu_a_spanning_groups() {
        let mut d = Depacketizer::default();
        assert!(assemble(&mut d, &[b"\x7c\x85\xaa"]).unwrap().is_none());
        let out = assemble(&mut d, &[b"\x7c\x45\xbb"]).unwrap().unwrap();
        assert_eq!(&out[..], b"\x00\x00\x00\x01\x65\xaa\xbb");
    }

    #[test]
    fn fu_a_continuation_without_start() {
        let mut d = Depacketizer::default();
        assemble(&mut d, &[b"\x7c\x45\xbb"]).unwrap_err();
    }

    #[test]
    fn mixed_stap_then_fragmented_idr() {
        let mut d = Depacketizer::default();
        let out = assemble(
            &mut d,
            &[
                b"\x18\x00\x01\x67\x00\x01\x68",
                b"\x7c\x85\x11",
                b"\x7c\x45\x22",
            ],
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            &out[..],
            b"\x00\x00\x00\x01\x67\x00\x00\x00\x01\x68\x00\x00\x00\x01\x65\x11\x22"
        );
    }

    #[test]
    fn rejects_f_bit() {
        let mut d = Depacketizer::default();
        assemble(&mut d, &[b"\xe5\x01"]).unwrap_err();
    }
}
