// Copyright (C) 2026 the rtsp-pull authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Splits the inbound signalling-socket byte stream into RTSP messages and
//! interleaved `$`-framed binary data.
//!
//! The two forms may interleave arbitrarily across TCP segment boundaries; in
//! particular a single `recv` may yield the tail of a `PLAY` response followed
//! by one or more data frames. The demuxer is a byte-consuming parser with
//! explicit incremental state: bytes are appended in arrival order and parsed
//! greedily from the head into two FIFO queues.

use std::collections::VecDeque;
use std::fmt::Display;

use bytes::{Buf, Bytes, BytesMut};
use rtsp_types::Message;

use crate::WallTime;

/// Context of a received message (or data frame) within the inbound stream.
///
/// When paired with a [`crate::ConnectionContext`], this should allow picking
/// the message out of a packet capture.
#[derive(Copy, Clone, Debug)]
pub(crate) struct MessageContext {
    /// The starting byte position within the input stream. The bottom 32 bits
    /// can be compared to the relative TCP sequence number.
    pos: u64,

    received_wall: WallTime,
}

impl Display for MessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pos, &self.received_wall)
    }
}

/// A complete RTSP request or response popped from the demuxer.
#[derive(Debug)]
pub(crate) struct ReceivedMessage {
    pub(crate) ctx: MessageContext,
    pub(crate) msg: Message<Bytes>,
}

/// A complete interleaved binary frame: `0x24 <channel:u8> <length:u16 be>`
/// followed by `length` payload bytes.
#[derive(Debug)]
pub(crate) struct InterleavedFrame {
    pub(crate) ctx: MessageContext,
    pub(crate) channel_id: u8,
    pub(crate) payload: Bytes,
}

/// A malformed prefix: neither `$` nor a valid RTSP start line.
#[derive(Debug)]
pub(crate) struct FramingError {
    pub(crate) pos: u64,
    pub(crate) description: String,
}

#[derive(Default)]
pub(crate) struct Demuxer {
    buf: BytesMut,

    /// Number of bytes drained from the head of the stream so far.
    pos: u64,

    messages: VecDeque<ReceivedMessage>,
    interleaved: VecDeque<InterleavedFrame>,
}

impl Demuxer {
    pub(crate) fn new() -> Self {
        Demuxer::default()
    }

    /// Appends a chunk and parses greedily. Completed items are queued;
    /// an incomplete tail is retained for the next append.
    pub(crate) fn append(&mut self, data: &[u8]) -> Result<(), FramingError> {
        self.buf.extend_from_slice(data);
        while self.parse_one()? {}
        Ok(())
    }

    pub(crate) fn pop_message(&mut self) -> Option<ReceivedMessage> {
        self.messages.pop_front()
    }

    pub(crate) fn pop_data(&mut self) -> Option<InterleavedFrame> {
        self.interleaved.pop_front()
    }

    /// Parses one item from the head of the buffer, or returns `Ok(false)` if
    /// more bytes are needed.
    fn parse_one(&mut self) -> Result<bool, FramingError> {
        // Skip stray CRLF between messages, as `rtsp_types` does. It must also
        // be done here or the `$` fast path below would miss its prefix.
        while self.buf.starts_with(b"\r\n") {
            self.buf.advance(2);
            self.pos += 2;
        }

        if !self.buf.is_empty() && self.buf[0] == b'$' {
            // Interleaved data frame, RFC 2326 section 10.12.
            if self.buf.len() < 4 {
                return Ok(false);
            }
            let channel_id = self.buf[1];
            let len = 4 + usize::from(u16::from_be_bytes([self.buf[2], self.buf[3]]));
            if self.buf.len() < len {
                self.buf.reserve(len - self.buf.len());
                return Ok(false);
            }
            let ctx = self.next_ctx();
            let mut frame = self.buf.split_to(len);
            frame.advance(4);
            self.interleaved.push_back(InterleavedFrame {
                ctx,
                channel_id,
                payload: frame.freeze(),
            });
            self.pos += len as u64;
            return Ok(true);
        }

        let (msg, len): (Message<&[u8]>, _) = match Message::parse(&self.buf) {
            Ok((m, l)) => (m, l),
            Err(rtsp_types::ParseError::Error) => {
                let dump_len = self.buf.len().min(128);
                return Err(FramingError {
                    pos: self.pos,
                    description: format!(
                        "invalid RTSP message; buffered:\n{}",
                        pretty_hex::pretty_hex(&&self.buf[..dump_len]),
                    ),
                });
            }
            Err(rtsp_types::ParseError::Incomplete(_)) => return Ok(false),
        };

        // Map the message's body to a `Bytes` representation and advance the
        // buffer. The body range must be captured before the message's borrow
        // of `buf` is dropped, and each arm handled separately because the
        // `rtsp_types::Message` enum itself has no body-mapping methods.
        let ctx = self.next_ctx();
        let msg = match msg {
            Message::Request(msg) => {
                let body_range = crate::as_range(&self.buf, msg.body());
                let msg = msg.replace_body(rtsp_types::Empty);
                if let Some(r) = body_range {
                    let mut raw_msg = self.buf.split_to(len);
                    raw_msg.advance(r.start);
                    raw_msg.truncate(r.len());
                    Message::Request(msg.replace_body(raw_msg.freeze()))
                } else {
                    self.buf.advance(len);
                    Message::Request(msg.replace_body(Bytes::new()))
                }
            }
            Message::Response(msg) => {
                let body_range = crate::as_range(&self.buf, msg.body());
                let msg = msg.replace_body(rtsp_types::Empty);
                if let Some(r) = body_range {
                    let mut raw_msg = self.buf.split_to(len);
                    raw_msg.advance(r.start);
                    raw_msg.truncate(r.len());
                    Message::Response(msg.replace_body(raw_msg.freeze()))
                } else {
                    self.buf.advance(len);
                    Message::Response(msg.replace_body(Bytes::new()))
                }
            }
            // Handled by the fast path above.
            Message::Data(_) => unreachable!(),
        };
        self.messages.push_back(ReceivedMessage { ctx, msg });
        self.pos += len as u64;
        Ok(true)
    }

    fn next_ctx(&self) -> MessageContext {
        MessageContext {
            pos: self.pos,
            received_wall: WallTime::now(),
        }
    }
}
