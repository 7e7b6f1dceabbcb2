// Copyright (C) 2026 the rtsp-pull authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTCP handling as described in
//! [RFC 3550 section 6](https://datatracker.ietf.org/doc/html/rfc3550#section-6).
//!
//! Nothing acts on RTCP yet; compound packets are validated, sender reports
//! are decoded for logging, and everything else is tolerated and skipped.

use crate::NtpTimestamp;

const PT_SENDER_REPORT: u8 = 200;

/// A sender report, as defined in
/// [RFC 3550 section 6.4.1](https://datatracker.ietf.org/doc/html/rfc3550#section-6.4.1).
#[derive(Copy, Clone, Debug)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_timestamp: NtpTimestamp,
    pub rtp_timestamp: u32,
}

/// A validated RTCP compound packet.
///
/// Validation checks that every contained packet is RTCP version 2 and that
/// the packets' lengths add up to the compound packet's length.
#[derive(Debug)]
pub struct RtcpInfo {
    /// The sender report, if the compound packet contains one.
    pub sender_report: Option<SenderReport>,

    /// Number of individual packets in the compound packet.
    pub packet_count: usize,
}

impl RtcpInfo {
    pub(crate) fn parse(raw: &[u8]) -> Result<Self, String> {
        let mut rest = raw;
        let mut sender_report = None;
        let mut packet_count = 0;
        while !rest.is_empty() {
            if rest.len() < 4 {
                return Err(format!("{}-byte truncated RTCP header", rest.len()));
            }
            if (rest[0] & 0b1100_0000) != 2 << 6 {
                return Err(format!("RTCP version must be 2; first byte {:02x}", rest[0]));
            }
            let packet_type = rest[1];
            let len = 4 * (usize::from(u16::from_be_bytes([rest[2], rest[3]])) + 1);
            if len > rest.len() {
                return Err(format!(
                    "RTCP packet length {} exceeds remaining {} bytes",
                    len,
                    rest.len()
                ));
            }
            let (pkt, after) = rest.split_at(len);
            if packet_type == PT_SENDER_REPORT && sender_report.is_none() {
                // Header + ssrc + NTP (8) + RTP timestamp; report blocks follow.
                if pkt.len() < 20 {
                    return Err(format!("{}-byte truncated RTCP sender report", pkt.len()));
                }
                sender_report = Some(SenderReport {
                    ssrc: u32::from_be_bytes([pkt[4], pkt[5], pkt[6], pkt[7]]),
                    ntp_timestamp: NtpTimestamp(u64::from_be_bytes([
                        pkt[8], pkt[9], pkt[10], pkt[11], pkt[12], pkt[13], pkt[14], pkt[15],
                    ])),
                    rtp_timestamp: u32::from_be_bytes([pkt[16], pkt[17], pkt[18], pkt[19]]),
                });
            }
            packet_count += 1;
            rest = after;
        }
        if packet_count == 0 {
            return Err("empty RTCP compound packet".to_owned());
        }
        Ok(RtcpInfo {
            sender_report,
            packet_count,
        })
    }
}
