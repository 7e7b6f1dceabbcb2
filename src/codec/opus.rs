// Copyright (C) 2026 the rtsp-pull authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [Opus](https://datatracker.ietf.org/doc/html/rfc6716)-encoded audio.
//!
//! Per [RFC 7587 section 4.2](https://datatracker.ietf.org/doc/html/rfc7587#section-4.2)
//! an RTP payload is exactly one Opus packet, so depacketization is a raw
//! passthrough. Groups never contain more than one packet in practice, but a
//! multi-packet group is concatenated rather than dropped.

use bytes::Bytes;

#[derive(Debug, Default)]
pub(crate) struct Depacketizer {}

impl Depacketizer {
    pub(crate) fn assemble(&mut self, payloads: &[Bytes]) -> Result<Option<Bytes>, String> {
        match payloads {
            [] => Ok(None),
            [single] if single.is_empty() => Ok(None),
            [single] => Ok(Some(single.clone())),
            many => {
                let mut out = Vec::with_capacity(many.iter().map(Bytes::len).sum());
                for payload in many {
                    out.extend_from_slice(payload);
                }
                if out.is_empty() {
                    return Ok(None);
                }
                Ok(Some(Bytes::from(out)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough() {
        let mut d = Depacketizer::default();
        let payload = Bytes::from_static(b"\xfc\x01\x02\x03");
        let out = d.assemble(&[payload.clone()]).unwrap().unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn empty_yields_nothing() {
        let mut d = Depacketizer::default();
        assert!(d.assemble(&[]).unwrap().is_none());
        assert!(d.assemble(&[Bytes::new()]).unwrap().is_none());
    }
}
