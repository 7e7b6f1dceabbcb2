// Copyright (C) 2026 the rtsp-pull authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP handling as described in
//! [RFC 3550 section 5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1),
//! plus grouping of packets into coded frames.
//!
//! Interleaved payloads are routed by RTP payload type rather than by the
//! interleaved channel byte, so a receiver is registered per payload type and
//! the session rejects presentations in which two tracks share one.

use std::collections::BTreeMap;
use std::ops::Range;

use bytes::{Buf, Bytes};
use log::trace;
use smallvec::SmallVec;

use crate::rtcp::RtcpInfo;

/// The minimum length of an RTP header (no CSRCs or extensions).
const MIN_HEADER_LEN: usize = 12;

/// A validated RTP packet.
///
/// Primarily validates the raw buffer on construction, then provides
/// accessors; the payload range is determined once during validation.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           synchronization source (SSRC) identifier            |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// |            contributing source (CSRC) identifiers             |
/// |                             ....                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Clone)]
pub struct RtpPacket {
    data: Bytes,
    payload_range: Range<usize>,
}

impl RtpPacket {
    /// Validates an RTP packet, computing its payload range.
    pub fn parse(data: Bytes) -> Result<Self, String> {
        if data.len() < MIN_HEADER_LEN {
            return Err(format!("RTP packet too short: {} bytes", data.len()));
        }
        if (data[0] & 0b1100_0000) != 2 << 6 {
            return Err(format!("RTP version must be 2; first byte {:02x}", data[0]));
        }
        let has_padding = (data[0] & 0b0010_0000) != 0;
        let has_extension = (data[0] & 0b0001_0000) != 0;
        let csrc_count = usize::from(data[0] & 0b0000_1111);
        let csrc_end = MIN_HEADER_LEN + 4 * csrc_count;
        let payload_start = if has_extension {
            if data.len() < csrc_end + 4 {
                return Err("RTP extension header after end of packet".to_owned());
            }
            let extension_words =
                usize::from(u16::from_be_bytes([data[csrc_end + 2], data[csrc_end + 3]]));
            csrc_end + 4 + 4 * extension_words
        } else {
            csrc_end
        };
        if data.len() < payload_start {
            return Err("RTP payload start after end of packet".to_owned());
        }
        let payload_end = if has_padding {
            let padding_len = usize::from(data[data.len() - 1]);
            if padding_len == 0 {
                return Err("invalid RTP padding length 0".to_owned());
            }
            match data.len().checked_sub(padding_len) {
                Some(e) if e >= payload_start => e,
                _ => return Err("RTP padding larger than payload".to_owned()),
            }
        } else {
            data.len()
        };
        Ok(RtpPacket {
            data,
            payload_range: payload_start..payload_end,
        })
    }

    #[inline]
    pub fn mark(&self) -> bool {
        (self.data[1] & 0b1000_0000) != 0
    }

    #[inline]
    pub fn payload_type(&self) -> u8 {
        self.data[1] & 0b0111_1111
    }

    #[inline]
    pub fn sequence_number(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    #[inline]
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]])
    }

    /// Returns only the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[self.payload_range.clone()]
    }

    /// Consumes the packet and returns the payload without copying.
    pub fn into_payload(self) -> Bytes {
        let mut data = self.data;
        data.truncate(self.payload_range.end);
        data.advance(self.payload_range.start);
        data
    }
}

impl std::fmt::Debug for RtpPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpPacket")
            .field("payload_type", &self.payload_type())
            .field("sequence_number", &self.sequence_number())
            .field("timestamp", &self.timestamp())
            .field("ssrc", &self.ssrc())
            .field("mark", &self.mark())
            .field("payload_len", &self.payload().len())
            .finish()
    }
}

/// One coded frame's worth of RTP packets, in arrival order.
pub(crate) type PacketGroup = SmallVec<[RtpPacket; 4]>;

/// Something the RTP/RTCP layer produced from one interleaved payload.
#[derive(Debug)]
pub(crate) enum RtpEvent {
    /// A complete packet group: all packets of one coded frame, delimited by
    /// marker bit and timestamp continuity.
    Frame(PacketGroup),

    /// A validated RTCP compound packet.
    Rtcp(RtcpInfo),
}

/// Per-payload-type reassembly state.
#[derive(Default)]
struct Receiver {
    /// Packets of the frame currently being accumulated. All share one RTP
    /// timestamp.
    pending: PacketGroup,
}

/// Demultiplexes interleaved payloads into RTCP info and per-track RTP frame
/// groups.
#[derive(Default)]
pub(crate) struct RtpRtcp {
    receivers: BTreeMap<u8, Receiver>,
}

impl RtpRtcp {
    pub(crate) fn new() -> Self {
        RtpRtcp::default()
    }

    /// Registers a receiver for one RTP payload type.
    pub(crate) fn add_rtp_receiver(&mut self, payload_type: u8) {
        self.receivers.insert(payload_type, Receiver::default());
    }

    /// Feeds one interleaved payload, returning any events it completes.
    ///
    /// An RTCP compound packet yields [`RtpEvent::Rtcp`]. An RTP packet is
    /// grouped with its predecessors: a timestamp change flushes the previous
    /// group, and a set marker bit completes the current one.
    pub(crate) fn on_data_received(
        &mut self,
        payload: Bytes,
    ) -> Result<SmallVec<[RtpEvent; 2]>, String> {
        let mut events = SmallVec::new();
        if payload.len() >= 2 && is_rtcp_packet_type(payload[1]) {
            events.push(RtpEvent::Rtcp(RtcpInfo::parse(&payload)?));
            return Ok(events);
        }

        let pkt = RtpPacket::parse(payload)?;
        let pt = pkt.payload_type();
        let receiver = self
            .receivers
            .get_mut(&pt)
            .ok_or_else(|| format!("no RTP receiver registered for payload type {pt}"))?;

        if let Some(first) = receiver.pending.first() {
            if first.timestamp() != pkt.timestamp() {
                // New frame started without a marker on the previous one;
                // flush what we have.
                trace!(
                    "flushing {}-packet group for payload type {pt} on timestamp change",
                    receiver.pending.len()
                );
                events.push(RtpEvent::Frame(std::mem::take(&mut receiver.pending)));
            }
        }
        let mark = pkt.mark();
        receiver.pending.push(pkt);
        if mark {
            events.push(RtpEvent::Frame(std::mem::take(&mut receiver.pending)));
        }
        Ok(events)
    }
}

/// Returns true if a packet whose second byte is `b` is RTCP rather than RTP,
/// per the [RFC 5761](https://datatracker.ietf.org/doc/html/rfc5761#section-4)
/// packet-type ranges (SR/RR/SDES/BYE/APP).
fn is_rtcp_packet_type(b: u8) -> bool {
    (200..=204).contains(&b)
}

#[cfg(test)]
pub(crate) fn build_rtp(
    payload_type: u8,
    sequence_number: u16,
    timestamp: u32,
    mark: bool,
    payload: &[u8],
) -> Bytes {
    let mut data = Vec::with_capacity(MIN_HEADER_LEN + payload.len());
    data.push(2 << 6);
    data.push(if mark { 0b1000_0000 } else { 0 } | payload_type);
    data.extend_from_slice(&sequence_number.to_be_bytes());
    data.extend_from_slice(&timestamp.to_be_bytes());
    data.extend_from_slice(&0x4242_4242u32.to_be_bytes());
    data.extend_from_slice(payload);
    Bytes::from(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accessors() {
        let pkt = RtpPacket::parse(build_rtp(96, 0x1234, 0xdead_beef, true, b"xyz")).unwrap();
        assert_eq!(pkt.payload_type(), 96);
        assert_eq!(pkt.sequence_number(), 0x1234);
        assert_eq!(pkt.timestamp(), 0xdead_beef);
        assert_eq!(pkt.ssrc(), 0x4242_4242);
        assert!(pkt.mark());
        assert_eq!(pkt.payload(), b"xyz");
        assert_eq!(&pkt.into_payload()[..], b"xyz");
    }

    #[test]
    fn parse_rejects_garbage() {
        RtpPacket::parse(Bytes::from_static(b"short")).unwrap_err();
        // Version 0.
        let mut bad = build_rtp(96, 0, 0, false, b"x").to_vec();
        bad[0] = 0;
        RtpPacket::parse(Bytes::from(bad)).unwrap_err();
    }

    #[test]
    fn parse_strips_padding() {
        let mut data = build_rtp(96, 1, 0, true, b"abcd\x00\x00\x03").to_vec();
        data[0] |= 0b0010_0000;
        let pkt = RtpPacket::parse(Bytes::from(data)).unwrap();
        assert_eq!(pkt.payload(), b"abcd");
    }

    #[test]
    fn groups_by_marker() {
        let mut r = RtpRtcp::new();
        r.add_rtp_receiver(96);
        let ev = r
            .on_data_received(build_rtp(96, 1, 1000, false, b"a"))
            .unwrap();
        assert!(ev.is_empty());
        let ev = r
            .on_data_received(build_rtp(96, 2, 1000, true, b"b"))
            .unwrap();
        assert_eq!(ev.len(), 1);
        match &ev[0] {
            RtpEvent::Frame(pkts) => {
                assert_eq!(pkts.len(), 2);
                assert_eq!(pkts[0].payload(), b"a");
                assert_eq!(pkts[1].payload(), b"b");
            }
            o => panic!("unexpected event {o:?}"),
        }
    }

    #[test]
    fn flushes_on_timestamp_change_without_marker() {
        let mut r = RtpRtcp::new();
        r.add_rtp_receiver(96);
        assert!(r
            .on_data_received(build_rtp(96, 1, 1000, false, b"a"))
            .unwrap()
            .is_empty());
        // The next frame starts; the unterminated group flushes and the new
        // packet completes its own group via the marker.
        let ev = r
            .on_data_received(build_rtp(96, 2, 4000, true, b"b"))
            .unwrap();
        assert_eq!(ev.len(), 2);
        assert!(matches!(&ev[0], RtpEvent::Frame(p) if p.len() == 1 && p[0].payload() == b"a"));
        assert!(matches!(&ev[1], RtpEvent::Frame(p) if p.len() == 1 && p[0].payload() == b"b"));
    }

    #[test]
    fn unregistered_payload_type_errors() {
        let mut r = RtpRtcp::new();
        r.on_data_received(build_rtp(96, 1, 0, true, b"a"))
            .unwrap_err();
    }

    #[test]
    fn rtcp_discriminated_from_rtp() {
        let mut r = RtpRtcp::new();
        r.add_rtp_receiver(96);
        // Minimal receiver report: V=2, PT=201, length=1 word, ssrc.
        let rr = Bytes::from_static(b"\x80\xc9\x00\x01\x00\x00\x00\x01");
        let ev = r.on_data_received(rr).unwrap();
        assert_eq!(ev.len(), 1);
        assert!(matches!(&ev[0], RtpEvent::Rtcp(_)));
    }
}
