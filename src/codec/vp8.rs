// Copyright (C) 2026 the rtsp-pull authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [VP8](https://datatracker.ietf.org/doc/html/rfc6386)-encoded video.
//!
//! Strips the [RFC 7741](https://datatracker.ietf.org/doc/html/rfc7741)
//! payload descriptor from each packet of a group and concatenates the
//! fragments back into one raw VP8 frame.

use bytes::Bytes;

#[derive(Debug, Default)]
pub(crate) struct Depacketizer {}

impl Depacketizer {
    pub(crate) fn assemble(&mut self, payloads: &[Bytes]) -> Result<Option<Bytes>, String> {
        let mut out = Vec::new();
        for payload in payloads {
            let skip = descriptor_len(payload)?;
            out.extend_from_slice(&payload[skip..]);
        }
        if out.is_empty() {
            return Ok(None);
        }
        Ok(Some(Bytes::from(out)))
    }
}

/// Length of the VP8 payload descriptor, RFC 7741 section 4.2:
///
/// ```text
///      0 1 2 3 4 5 6 7
///     +-+-+-+-+-+-+-+-+
///     |X|R|N|S|R| PID | (REQUIRED)
///     +-+-+-+-+-+-+-+-+
/// X:  |I|L|T|K| RSV   | (OPTIONAL)
///     +-+-+-+-+-+-+-+-+
/// I:  |M| PictureID   | (OPTIONAL)
///     +-+-+-+-+-+-+-+-+
/// L:  |   TL0PICIDX   | (OPTIONAL)
///     +-+-+-+-+-+-+-+-+
/// T/K:|TID|Y| KEYIDX  | (OPTIONAL)
///     +-+-+-+-+-+-+-+-+
/// ```
fn descriptor_len(payload: &[u8]) -> Result<usize, String> {
    if payload.is_empty() {
        return Err("empty VP8 payload".to_owned());
    }
    let required = payload[0];
    let mut len = 1;
    if (required & 0b1000_0000) != 0 {
        // X: extension byte present.
        if payload.len() < 2 {
            return Err("VP8 descriptor missing extension byte".to_owned());
        }
        let extension = payload[1];
        len += 1;
        if (extension & 0b1000_0000) != 0 {
            // I: picture id, one or two bytes depending on its M bit.
            if payload.len() < len + 1 {
                return Err("VP8 descriptor missing picture id".to_owned());
            }
            len += if (payload[len] & 0b1000_0000) != 0 { 2 } else { 1 };
        }
        if (extension & 0b0100_0000) != 0 {
            // L: TL0PICIDX.
            len += 1;
        }
        if (extension & 0b0011_0000) != 0 {
            // T or K: TID/Y/KEYIDX share one byte.
            len += 1;
        }
    }
    if payload.len() < len {
        return Err(format!(
            "{}-byte VP8 payload shorter than its {len}-byte descriptor",
            payload.len()
        ));
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(payloads: &[&[u8]]) -> Result<Option<Bytes>, String> {
        let payloads: Vec<Bytes> = payloads.iter().map(|p| Bytes::copy_from_slice(p)).collect();
        Depacketizer::default().assemble(&payloads)
    }

    #[test]
    fn minimal_descriptor() {
        // S=1, PID=0, no extension.
        let out = assemble(&[b"\x10\x9d\x01\x2a"]).unwrap().unwrap();
        assert_eq!(&out[..], b"\x9d\x01\x2a");
    }

    #[test]
    fn extended_descriptor_with_two_byte_picture_id() {
        // X+S, then I with M (15-bit picture id).
        let out = assemble(&[b"\x90\x80\x81\x23\xaa\xbb"]).unwrap().unwrap();
        assert_eq!(&out[..], b"\xaa\xbb");
    }

    #[test]
    fn extended_descriptor_with_tl0_and_tid() {
        // X+S; I (1-byte picture id) + L + T.
        let out = assemble(&[b"\x90\xe0\x05\x07\x20\xcc"]).unwrap().unwrap();
        assert_eq!(&out[..], b"\xcc");
    }

    #[test]
    fn fragments_concatenate() {
        let out = assemble(&[b"\x10\xaa\xbb", b"\x00\xcc\xdd"]).unwrap().unwrap();
        assert_eq!(&out[..], b"\xaa\xbb\xcc\xdd");
    }

    #[test]
    fn truncated_descriptor_errors() {
        assemble(&[b"\x90"]).unwrap_err();
        assemble(&[b""]).unwrap_err();
    }
}
