// Copyright (C) 2026 the rtsp-pull authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP pull client.
//!
//! Pulls a live stream from a remote RTSP server over a single TCP
//! connection: the control dialogue (`DESCRIBE`/`SETUP`/`PLAY`/`TEARDOWN`)
//! and the RTP/RTCP data share the socket via interleaved framing as in
//! [RFC 2326 section 10.12](https://tools.ietf.org/html/rfc2326#section-10.12).
//! Reassembled elementary-stream frames are handed to a caller-supplied
//! [`session::MediaSink`].
//!
//! Setup runs synchronously on the caller thread; after `play` the session
//! is expected to be moved to an event-loop worker which polls the
//! [`session::Session::as_raw_fd`] descriptor and calls
//! [`session::Session::process_media_packet`] on readability.

#![forbid(clippy::print_stderr, clippy::print_stdout)]

use std::fmt::{Debug, Display};
use std::net::{IpAddr, SocketAddr};

mod error;

pub use error::Error;

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

pub mod codec;
mod correlator;
mod demux;
pub mod pool;
mod rtcp;
mod rtp;
pub mod session;

/// The Unix epoch as an [`NtpTimestamp`].
pub const UNIX_EPOCH: NtpTimestamp = NtpTimestamp(2_208_988_800 << 32);

/// A wallclock time in the fixed-point representation of the Network Time
/// Protocol: seconds since 0h UTC on 1 January 1900, integer part in the top
/// 32 bits and fractional part in the bottom 32.
///
/// Seen in RTCP sender reports. Reported values are allowed to jump backwards
/// and/or be complete nonsense; this wrapper only carries and formats them.
#[derive(Copy, Clone, PartialEq, PartialOrd, Eq, Ord)]
pub struct NtpTimestamp(pub u64);

impl Display for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let since_epoch = self.0.wrapping_sub(UNIX_EPOCH.0);
        let secs = (since_epoch >> 32) as i64;
        let frac = (since_epoch & 0xFFFF_FFFF) as f64 / f64::from(u32::MAX);
        let nanos = (frac * 1e9).round() as u32;
        match chrono::DateTime::from_timestamp(secs, nanos) {
            Some(dt) => write!(f, "{}", dt.format("%FT%T%.3fZ")),
            None => write!(f, "ntp {}", self.0),
        }
    }
}

impl Debug for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Write both the raw and display forms.
        write!(f, "{} /* {} */", self.0, self)
    }
}

/// A wall time taken from the local machine's realtime clock, used in error
/// reporting and logging.
#[derive(Copy, Clone, Debug)]
pub struct WallTime(chrono::DateTime<chrono::Utc>);

impl WallTime {
    pub(crate) fn now() -> Self {
        Self(chrono::Utc::now())
    }
}

impl Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%FT%T"))
    }
}

/// RTSP connection context.
///
/// This gives enough information to pick out the flow in a packet capture.
#[derive(Copy, Clone, Debug)]
pub struct ConnectionContext {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    established_wall: WallTime,
}

impl ConnectionContext {
    pub(crate) fn new(local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            peer_addr,
            established_wall: WallTime::now(),
        }
    }

    #[doc(hidden)]
    pub fn dummy() -> Self {
        let addr = SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);
        Self {
            local_addr: addr,
            peer_addr: addr,
            established_wall: WallTime::now(),
        }
    }
}

impl Display for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(me)->{}@{}",
            &self.local_addr, &self.peer_addr, &self.established_wall,
        )
    }
}

/// Returns the range within `buf` that represents `subset`.
/// If `subset` is empty, returns None; otherwise panics if `subset` is not within `buf`.
pub(crate) fn as_range(buf: &[u8], subset: &[u8]) -> Option<std::ops::Range<usize>> {
    if subset.is_empty() {
        return None;
    }
    let subset_p = subset.as_ptr() as usize;
    let buf_p = buf.as_ptr() as usize;
    let off = match subset_p.checked_sub(buf_p) {
        Some(off) => off,
        None => panic!(
            "{}-byte subset not within {}-byte buf",
            subset.len(),
            buf.len()
        ),
    };
    let end = off + subset.len();
    assert!(end <= buf.len());
    Some(off..end)
}
