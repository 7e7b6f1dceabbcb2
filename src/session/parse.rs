// Copyright (C) 2026 the rtsp-pull authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parsing of RTSP response headers and SDP into session state: the
//! `Session` header, control URLs, and track descriptors.

use bytes::Bytes;
use log::debug;
use url::Url;

use crate::codec::{CodecId, MediaKind};

use super::Track;

/// Returns the `CSeq` from an RTSP response as a `u32`, or `None` if missing/unparseable.
pub(crate) fn get_cseq(response: &rtsp_types::Response<Bytes>) -> Option<u32> {
    response
        .header(&rtsp_types::headers::CSEQ)
        .and_then(|cseq| u32::from_str_radix(cseq.as_str(), 10).ok())
}

/// `Session` response header contents.
///
/// `Session = "Session" ":" session-id [ ";" "timeout" "=" delta-seconds ]`
/// ([RFC 2326 section 12.37](https://datatracker.ietf.org/doc/html/rfc2326#section-12.37)).
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SessionHeader {
    pub(crate) id: Box<str>,
    pub(crate) timeout_sec: u32,
}

pub(crate) fn parse_session_header(value: &str) -> Result<SessionHeader, String> {
    match value.split_once(';') {
        None => Ok(SessionHeader {
            id: value.into(),
            timeout_sec: 60, // default
        }),
        Some((id, timeout_str)) => {
            if let Some(v) = timeout_str.trim().strip_prefix("timeout=") {
                let timeout_sec =
                    u32::from_str_radix(v, 10).map_err(|_| format!("unparseable timeout {v}"))?;
                Ok(SessionHeader {
                    id: id.into(),
                    timeout_sec,
                })
            } else {
                Err(format!("unparseable Session header {value:?}"))
            }
        }
    }
}

/// Produces the absolute control URL for one track.
///
/// A control that is already absolute is used verbatim. Otherwise it is joined
/// to the DESCRIBE response's `Content-Base` when one was returned, and to the
/// request URL (stripped of its query string, which is re-appended) when not.
pub(crate) fn resolve_control_url(
    control: &str,
    content_base: Option<&str>,
    request_url: &Url,
) -> String {
    const SCHEME_PREFIX: &str = "rtsp://";
    if control.len() >= SCHEME_PREFIX.len()
        && control[..SCHEME_PREFIX.len()].eq_ignore_ascii_case(SCHEME_PREFIX)
    {
        return control.to_owned();
    }

    if let Some(base) = content_base.filter(|b| !b.is_empty()) {
        return join_control(base, control);
    }

    let mut stripped = request_url.clone();
    stripped.set_query(None);
    let mut resolved = join_control(stripped.as_str(), control);
    if let Some(query) = request_url.query() {
        resolved.push('?');
        resolved.push_str(query);
    }
    resolved
}

/// Joins a control attribute to a base URL the way live555 and ffmpeg do:
/// inserting a `/` only when the base doesn't already end with one.
fn join_control(base: &str, control: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{control}")
    } else {
        format!("{base}/{control}")
    }
}

#[derive(Debug)]
pub(crate) enum DescribeError {
    Protocol(String),
    UnsupportedCodec { media: MediaKind, encoding: String },
}

#[derive(Debug)]
pub(crate) struct DescribeResult {
    pub(crate) session: SessionHeader,
    pub(crate) content_base: Option<String>,
    pub(crate) tracks: Vec<Track>,
}

/// Parses a successful `DESCRIBE` response: mandatory `Session` header,
/// optional `Content-Base`, and an SDP body yielding one track per supported
/// media description.
pub(crate) fn parse_describe(
    request_url: &Url,
    response: &rtsp_types::Response<Bytes>,
) -> Result<DescribeResult, DescribeError> {
    let session = response
        .header(&rtsp_types::headers::SESSION)
        .ok_or_else(|| {
            DescribeError::Protocol("no Session header in DESCRIBE response".to_owned())
        })
        .and_then(|v| parse_session_header(v.as_str()).map_err(DescribeError::Protocol))?;

    let content_base = response
        .header(&rtsp_types::headers::CONTENT_BASE)
        .map(|v| v.as_str().to_owned());

    let body = response.body();
    if body.is_empty() {
        return Err(DescribeError::Protocol(
            "no SDP body in DESCRIBE response".to_owned(),
        ));
    }
    let sdp = sdp_types::Session::parse(&body[..])
        .map_err(|e| DescribeError::Protocol(format!("unable to parse SDP: {e}")))?;

    let mut tracks: Vec<Track> = Vec::new();
    for media_description in &sdp.medias {
        let media = match media_description.media.as_str() {
            "video" => MediaKind::Video,
            "audio" => MediaKind::Audio,
            other => {
                debug!("skipping media description of type {other:?}");
                continue;
            }
        };
        let track = parse_media(request_url, content_base.as_deref(), media, media_description)?;
        if tracks.iter().any(|t| t.payload_type == track.payload_type) {
            // Interleaved payloads are demultiplexed by payload type, which
            // requires the type to be unique across tracks.
            return Err(DescribeError::Protocol(format!(
                "RTP payload type {} used by more than one media description",
                track.payload_type
            )));
        }
        tracks.push(track);
    }
    if tracks.is_empty() {
        return Err(DescribeError::Protocol(
            "SDP has no video or audio media description".to_owned(),
        ));
    }

    Ok(DescribeResult {
        session,
        content_base,
        tracks,
    })
}

/// Parses one media description to a [`Track`].
fn parse_media(
    request_url: &Url,
    content_base: Option<&str>,
    media: MediaKind,
    media_description: &sdp_types::Media,
) -> Result<Track, DescribeError> {
    // RFC 8866: the first format is the default for the session.
    let payload_type_str = media_description
        .fmt
        .split_ascii_whitespace()
        .next()
        .unwrap_or("");
    let payload_type = u8::from_str_radix(payload_type_str, 10)
        .ok()
        .filter(|pt| (pt & 0x80) == 0)
        .ok_or_else(|| {
            DescribeError::Protocol(format!("invalid RTP payload type {payload_type_str:?}"))
        })?;

    let mut rtpmap = None;
    let mut control = None;
    for a in &media_description.attributes {
        if a.attribute == "rtpmap" {
            // rtpmap-value = payload-type SP encoding-name "/" clock-rate
            //   [ "/" encoding-params ]
            let v = a.value.as_deref().unwrap_or("");
            if let Some((pt, v)) = v.split_once(' ') {
                if pt == payload_type_str {
                    rtpmap = Some(v);
                }
            }
        } else if a.attribute == "control" {
            control = a.value.as_deref();
        }
    }

    let rtpmap = rtpmap.ok_or_else(|| {
        DescribeError::Protocol(format!("no rtpmap for payload type {payload_type}"))
    })?;
    let (encoding_name, rest) = rtpmap
        .split_once('/')
        .ok_or_else(|| DescribeError::Protocol(format!("invalid rtpmap attribute {rtpmap:?}")))?;
    let clock_rate_str = rest.split('/').next().unwrap_or("");
    let clock_rate = u32::from_str_radix(clock_rate_str, 10)
        .ok()
        .filter(|c| *c > 0)
        .ok_or_else(|| {
            DescribeError::Protocol(format!("bad clock rate in rtpmap {rtpmap:?}"))
        })?;

    let encoding_name = encoding_name.to_ascii_lowercase();
    let codec = CodecId::from_encoding_name(media, &encoding_name).ok_or(
        DescribeError::UnsupportedCodec {
            media,
            encoding: encoding_name,
        },
    )?;

    let control = control.filter(|c| !c.is_empty()).ok_or_else(|| {
        DescribeError::Protocol(format!(
            "no control attribute for {media} payload type {payload_type}"
        ))
    })?;
    let control_url = resolve_control_url(control, content_base, request_url);

    Ok(Track {
        payload_type,
        media,
        codec,
        timebase: (1, clock_rate),
        control_url,
    })
}
