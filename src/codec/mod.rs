// Copyright (C) 2026 the rtsp-pull authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Codec-specific logic: RTP depacketization for each supported codec and the
//! media-packet type handed to the sink.

use bytes::Bytes;

pub(crate) mod h264;
pub(crate) mod opus;
pub(crate) mod vp8;

/// Media type of a track.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => f.pad("video"),
            MediaKind::Audio => f.pad("audio"),
        }
    }
}

/// A supported codec.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CodecId {
    H264,
    Vp8,
    Opus,
}

impl CodecId {
    /// Maps an SDP `rtpmap` encoding name (lowercased) to a codec, checking it
    /// against the media type it was advertised under.
    pub(crate) fn from_encoding_name(media: MediaKind, encoding_name: &str) -> Option<Self> {
        match (media, encoding_name) {
            (MediaKind::Video, "h264") => Some(CodecId::H264),
            (MediaKind::Video, "vp8") => Some(CodecId::Vp8),
            (MediaKind::Audio, "opus") => Some(CodecId::Opus),
            _ => None,
        }
    }

    pub fn bitstream_format(self) -> BitstreamFormat {
        match self {
            // The H.264 depacketizer always produces Annex B.
            CodecId::H264 => BitstreamFormat::H264AnnexB,
            CodecId::Vp8 => BitstreamFormat::Vp8,
            CodecId::Opus => BitstreamFormat::Opus,
        }
    }

    pub fn packet_kind(self) -> PacketKind {
        match self {
            CodecId::H264 => PacketKind::Nalu,
            CodecId::Vp8 | CodecId::Opus => PacketKind::Raw,
        }
    }
}

/// Bitstream layout of [`MediaPacket::data`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BitstreamFormat {
    /// H.264 byte stream with `00 00 00 01` start codes delimiting NAL units.
    H264AnnexB,
    Vp8,
    Opus,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketKind {
    Nalu,
    Raw,
}

/// One assembled elementary-stream frame, ready for a
/// [`crate::session::MediaSink`].
#[derive(Clone)]
pub struct MediaPacket {
    /// Track identifier; equal to the RTP payload type.
    pub track_id: u8,
    pub media: MediaKind,
    pub data: Bytes,

    /// Normalised presentation timestamp in the track's timebase. Decode
    /// timestamps are not reordered here, so `dts == pts`.
    pub pts: u64,
    pub dts: u64,
    pub format: BitstreamFormat,
    pub kind: PacketKind,
}

impl std::fmt::Debug for MediaPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaPacket")
            .field("track_id", &self.track_id)
            .field("media", &self.media)
            .field("pts", &self.pts)
            .field("format", &self.format)
            .field("kind", &self.kind)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Turns one RTP packet group's payloads into an elementary-stream frame.
#[derive(Debug)]
pub(crate) struct Depacketizer(DepacketizerInner);

#[derive(Debug)]
enum DepacketizerInner {
    H264(h264::Depacketizer),
    Vp8(vp8::Depacketizer),
    Opus(opus::Depacketizer),
}

impl Depacketizer {
    pub(crate) fn new(codec: CodecId) -> Self {
        Depacketizer(match codec {
            CodecId::H264 => DepacketizerInner::H264(h264::Depacketizer::default()),
            CodecId::Vp8 => DepacketizerInner::Vp8(vp8::Depacketizer::default()),
            CodecId::Opus => DepacketizerInner::Opus(opus::Depacketizer::default()),
        })
    }

    /// Assembles the ordered payloads of one packet group into a frame.
    ///
    /// Returns `Ok(None)` when the group yields no complete frame yet (for
    /// example a fragment run still awaiting its final packet); this is a
    /// recoverable skip, not an error.
    pub(crate) fn assemble(&mut self, payloads: &[Bytes]) -> Result<Option<Bytes>, String> {
        match &mut self.0 {
            DepacketizerInner::H264(d) => d.assemble(payloads),
            DepacketizerInner::Vp8(d) => d.assemble(payloads),
            DepacketizerInner::Opus(d) => d.assemble(payloads),
        }
    }
}
