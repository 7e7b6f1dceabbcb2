// Copyright (C) 2026 the rtsp-pull authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The RTSP session: state machine, setup dialogue, and the post-`PLAY`
//! processing step.
//!
//! Setup (`start`, `play`) runs synchronously on the caller thread with
//! blocking socket reads. After `play` succeeds, the caller is expected to
//! move the session to an event-loop worker which registers
//! [`Session::as_raw_fd`] with its poll group and calls
//! [`Session::process_media_packet`] whenever the socket is readable.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, info, trace, warn};
use url::Url;

use crate::codec::{CodecId, Depacketizer, MediaKind, MediaPacket};
use crate::correlator::ResponseCorrelator;
use crate::demux::Demuxer;
use crate::error::ErrorInt;
use crate::pool::{RecvMode, RecvOutcome, SignallingSocket, SocketPool};
use crate::rtp::{PacketGroup, RtpEvent, RtpRtcp};
use crate::{ConnectionContext, Error};

pub(crate) mod parse;
mod timeline;

use parse::SessionHeader;
use timeline::TimestampNormalizer;

/// Default RTSP port, used when the source URL specifies none.
pub const DEFAULT_RTSP_PORT: u16 = 554;

const DEFAULT_USER_AGENT: &str = concat!("rtsp-pull/", env!("CARGO_PKG_VERSION"));

/// Lifecycle state of a [`Session`].
///
/// A session in `Stopped` or `Error` is not reusable; construct a new session
/// (possibly on the next URL of the list) instead.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Connected,
    Described,
    Playing,
    Stopping,
    Stopped,
    Error,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            State::Idle => "idle",
            State::Connected => "connected",
            State::Described => "described",
            State::Playing => "playing",
            State::Stopping => "stopping",
            State::Stopped => "stopped",
            State::Error => "error",
        })
    }
}

/// Outcome of one [`Session::process_media_packet`] step.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProcessResult {
    /// Drained what was buffered; more may already be available.
    Success,

    /// Nothing further to do right now; wait for the next readability event.
    TryAgain,

    /// The session moved to [`State::Error`]; stop polling it.
    Failure,
}

/// Consumer of assembled elementary-stream frames.
pub trait MediaSink: Send {
    fn send_frame(&mut self, packet: MediaPacket);
}

/// Description of one negotiated track.
#[derive(Clone, Debug)]
pub struct Track {
    /// Track identifier; equal to the RTP payload type.
    pub payload_type: u8,
    pub media: MediaKind,
    pub codec: CodecId,

    /// `(numerator, denominator)`; the denominator is the RTP clock rate.
    pub timebase: (u32, u32),

    /// Absolute per-track control URL, used as the `SETUP` request URI.
    pub control_url: String,
}

/// Options for a [`Session`].
pub struct SessionOptions {
    url_list: Vec<String>,
    connect_timeout: Duration,
    request_timeout: Duration,
    recv_buffer_size: usize,
    user_agent: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            url_list: Vec::new(),
            connect_timeout: Duration::from_millis(3_000),
            request_timeout: Duration::from_millis(3_000),
            recv_buffer_size: 65_535,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }
}

impl SessionOptions {
    /// Candidate source URLs, in order of preference. The first parsable one
    /// is used; `rtsp://` scheme required; the port defaults to 554.
    pub fn url_list<I, S>(self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            url_list: urls.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    /// Socket connect deadline. Defaults to 3 seconds.
    pub fn connect_timeout(self, connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..self
        }
    }

    /// Deadline for each `DESCRIBE`/`SETUP`/`PLAY`/`TEARDOWN` response.
    /// Defaults to 3 seconds.
    pub fn request_timeout(self, request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            ..self
        }
    }

    /// Maximum single-read size. Defaults to 65535.
    pub fn recv_buffer_size(self, recv_buffer_size: usize) -> Self {
        Self {
            recv_buffer_size,
            ..self
        }
    }

    /// `User-Agent` sent with every request.
    pub fn user_agent(self, user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            ..self
        }
    }
}

/// A pull session over one RTSP TCP connection.
pub struct Session {
    options: SessionOptions,
    urls: Vec<Url>,
    current_url: Url,
    pool: Weak<SocketPool>,
    socket: Option<SignallingSocket>,
    sink: Box<dyn MediaSink>,
    state: State,

    /// The next `CSeq` header value to use when sending an RTSP request.
    next_cseq: u32,

    session: Option<SessionHeader>,
    content_base: Option<String>,
    tracks: BTreeMap<u8, Track>,
    depacketizers: BTreeMap<u8, Depacketizer>,
    normalizer: TimestampNormalizer,
    demuxer: Demuxer,
    correlator: Arc<ResponseCorrelator>,
    rtp_rtcp: RtpRtcp,
    recv_buf: Vec<u8>,

    /// Connect duration, captured once at `start`.
    origin_request_time: Option<Duration>,

    /// Time from end of connect to completion of all `SETUP`s.
    origin_response_time: Option<Duration>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("current_url", &self.current_url)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates an idle session.
    ///
    /// Unparseable candidate URLs are skipped with a warning; at least one
    /// must survive. The socket pool is held as a non-owning handle and
    /// resolved at [`Session::start`].
    pub fn new(
        options: SessionOptions,
        pool: &Arc<SocketPool>,
        sink: Box<dyn MediaSink>,
    ) -> Result<Self, Error> {
        let mut urls = Vec::new();
        for raw in &options.url_list {
            match Url::parse(raw) {
                Ok(url) => urls.push(url),
                Err(e) => warn!("skipping unparseable source url {raw:?}: {e}"),
            }
        }
        let current_url = match urls.first() {
            Some(url) => url.clone(),
            None => bail!(ErrorInt::InvalidConfiguration(
                "no parsable source URL".to_owned()
            )),
        };
        let recv_buffer_size = options.recv_buffer_size.max(1);
        Ok(Session {
            urls,
            current_url,
            pool: Arc::downgrade(pool),
            socket: None,
            sink,
            state: State::Idle,
            next_cseq: 1,
            session: None,
            content_base: None,
            tracks: BTreeMap::new(),
            depacketizers: BTreeMap::new(),
            normalizer: TimestampNormalizer::default(),
            demuxer: Demuxer::new(),
            correlator: Arc::new(ResponseCorrelator::new()),
            rtp_rtcp: RtpRtcp::new(),
            recv_buf: vec![0; recv_buffer_size],
            origin_request_time: None,
            origin_response_time: None,
            options,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The URL the session connects (or connected) to.
    pub fn current_url(&self) -> &Url {
        &self.current_url
    }

    /// All candidate URLs that parsed, first-preferred. A caller rebuilding a
    /// failed session picks the next one from here.
    pub fn url_list(&self) -> &[Url] {
        &self.urls
    }

    /// Tracks negotiated by `DESCRIBE`, in payload-type order.
    pub fn tracks(&self) -> impl Iterator<Item = &Track> + '_ {
        self.tracks.values()
    }

    /// The RTSP session id, once established by `DESCRIBE`.
    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| &*s.id)
    }

    /// The `Content-Base` returned by `DESCRIBE`, if any. Relative SDP
    /// control attributes were resolved against it.
    pub fn content_base(&self) -> Option<&str> {
        self.content_base.as_deref()
    }

    /// The native readable descriptor of the signalling socket, for external
    /// poll-group registration.
    pub fn as_raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().and_then(SignallingSocket::as_raw_fd)
    }

    /// Connect duration, captured once per session.
    pub fn origin_request_time(&self) -> Option<Duration> {
        self.origin_request_time
    }

    /// Time from end of connect to completion of all `SETUP`s, captured once
    /// per session.
    pub fn origin_response_time(&self) -> Option<Duration> {
        self.origin_response_time
    }

    /// Connects and performs `DESCRIBE` plus one `SETUP` per track.
    ///
    /// On any failure the session moves to [`State::Error`] and is not
    /// reusable; no retry or fallback to the next URL happens at this layer.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.state != State::Idle {
            bail!(ErrorInt::FailedPrecondition(format!(
                "start in state {}",
                self.state
            )));
        }
        let connect_started = Instant::now();
        self.connect()?;
        self.origin_request_time = Some(connect_started.elapsed());

        let setup_started = Instant::now();
        self.request_describe()?;
        self.request_setup()?;
        self.origin_response_time = Some(setup_started.elapsed());
        Ok(())
    }

    /// Sends `PLAY`. On 200 the session is [`State::Playing`] and ownership
    /// should pass to the event-loop worker.
    pub fn play(&mut self) -> Result<(), Error> {
        if self.state != State::Described {
            bail!(ErrorInt::FailedPrecondition(format!(
                "play in state {}",
                self.state
            )));
        }
        let request = rtsp_types::Request::builder(rtsp_types::Method::Play, rtsp_types::Version::V1_0)
            .request_uri(self.current_url.clone())
            .header(rtsp_types::headers::SESSION, self.session_id_or_fail()?)
            .build(Bytes::new());
        let cseq = self.send_request(request)?;
        let response = self.receive_response(rtsp_types::Method::Play, cseq)?;
        self.check_status(rtsp_types::Method::Play, cseq, &response)?;
        self.set_state(State::Playing);
        info!(
            "{}: playing (origin request time {:?}, origin response time {:?})",
            self.current_url, self.origin_request_time, self.origin_response_time,
        );
        Ok(())
    }

    /// Tears the session down.
    ///
    /// A no-op unless currently playing. The state moves to
    /// [`State::Stopping`] before `TEARDOWN` is sent, so the response is read
    /// directly from the socket by the calling thread; a 200 yields
    /// [`State::Stopped`], anything else [`State::Error`]. Either way the
    /// socket is closed and pending correlator slots complete with failure.
    pub fn stop(&mut self) -> Result<(), Error> {
        if self.state != State::Playing {
            return Ok(());
        }
        self.set_state(State::Stopping);
        let request =
            rtsp_types::Request::builder(rtsp_types::Method::Teardown, rtsp_types::Version::V1_0)
                .request_uri(self.current_url.clone())
                .header(rtsp_types::headers::SESSION, self.session_id_or_fail()?)
                .build(Bytes::new());
        let cseq = self.send_request(request)?;
        let response = self.receive_response(rtsp_types::Method::Teardown, cseq)?;
        self.check_status(rtsp_types::Method::Teardown, cseq, &response)?;
        self.set_state(State::Stopped);
        self.close_socket();
        Ok(())
    }

    /// One non-blocking processing step, to be called on socket readability.
    ///
    /// Receives once, then drains the demuxer: responses complete correlator
    /// slots, interleaved frames flow through the RTP/RTCP layer and
    /// depacketizers to the sink, and unknown inbound requests are logged and
    /// discarded.
    pub fn process_media_packet(&mut self) -> ProcessResult {
        if self.state != State::Playing {
            return ProcessResult::Failure;
        }
        let bytes_read = match self.recv_into_demuxer(RecvMode::NonBlocking) {
            Ok(n) => n,
            Err(e) => {
                warn!("{}: stopping on receive error: {e}", self.current_url);
                return ProcessResult::Failure;
            }
        };

        loop {
            if let Some(received) = self.demuxer.pop_message() {
                match received.msg {
                    rtsp_types::Message::Response(response) => {
                        match parse::get_cseq(&response) {
                            // A slot-less CSeq is a stale response after a
                            // caller-side timeout; `complete` drops it.
                            Some(cseq) => {
                                self.correlator.complete(cseq, response);
                            }
                            None => {
                                warn!(
                                    "{}: response without CSeq at {}",
                                    self.current_url, received.ctx
                                );
                                self.mark_failed();
                                return ProcessResult::Failure;
                            }
                        }
                    }
                    rtsp_types::Message::Request(request) => {
                        info!(
                            "{}: ignoring {:?} request from server",
                            self.current_url,
                            request.method()
                        );
                    }
                    rtsp_types::Message::Data(_) => {
                        unreachable!("demuxer queues interleaved data separately")
                    }
                }
            } else if let Some(frame) = self.demuxer.pop_data() {
                match self.rtp_rtcp.on_data_received(frame.payload) {
                    Ok(events) => {
                        for event in events {
                            self.handle_rtp_event(event);
                        }
                    }
                    Err(description) => warn!(
                        "{}: dropping interleaved frame on channel {} at {}: {description}",
                        self.current_url, frame.channel_id, frame.ctx
                    ),
                }
            } else if bytes_read == self.recv_buf.len() {
                // A full read; the socket likely has more queued.
                return ProcessResult::Success;
            } else {
                return ProcessResult::TryAgain;
            }
        }
    }

    fn connect(&mut self) -> Result<(), Error> {
        let url = self.current_url.clone();
        info!("{url}: connecting");
        if url.scheme() != "rtsp" {
            return self.fail(ErrorInt::InvalidConfiguration(format!(
                "scheme {:?} is not rtsp in {url}",
                url.scheme()
            )));
        }
        let host = match url.host_str() {
            Some(h) => h.to_owned(),
            None => {
                return self.fail(ErrorInt::InvalidConfiguration(format!("no host in {url}")))
            }
        };
        let port = url.port().unwrap_or(DEFAULT_RTSP_PORT);
        let pool = match self.pool.upgrade() {
            Some(pool) => pool,
            None => {
                return self.fail(ErrorInt::FailedPrecondition(
                    "socket pool is gone".to_owned(),
                ))
            }
        };
        let mut socket = pool.allocate();
        if let Err(e) = socket.connect(&host, port, self.options.connect_timeout) {
            return self.fail(ErrorInt::ConnectError {
                url: url.to_string(),
                source: e,
            });
        }
        self.socket = Some(socket);
        self.set_state(State::Connected);
        Ok(())
    }

    fn request_describe(&mut self) -> Result<(), Error> {
        if self.state != State::Connected {
            bail!(ErrorInt::FailedPrecondition(format!(
                "DESCRIBE in state {}",
                self.state
            )));
        }
        let request =
            rtsp_types::Request::builder(rtsp_types::Method::Describe, rtsp_types::Version::V1_0)
                .request_uri(self.current_url.clone())
                .header(rtsp_types::headers::ACCEPT, "application/sdp")
                .build(Bytes::new());
        let cseq = self.send_request(request)?;
        let response = self.receive_response(rtsp_types::Method::Describe, cseq)?;
        self.check_status(rtsp_types::Method::Describe, cseq, &response)?;

        let result = match parse::parse_describe(&self.current_url, &response) {
            Ok(result) => result,
            Err(parse::DescribeError::UnsupportedCodec { media, encoding }) => {
                return self.fail(ErrorInt::UnsupportedCodec { media, encoding })
            }
            Err(parse::DescribeError::Protocol(description)) => {
                let conn_ctx = self.conn_ctx();
                return self.fail(ErrorInt::ProtocolError {
                    conn_ctx,
                    description,
                });
            }
        };
        for track in result.tracks {
            info!(
                "{}: {} track: payload type {} codec {:?} timebase {}/{} control {}",
                self.current_url,
                track.media,
                track.payload_type,
                track.codec,
                track.timebase.0,
                track.timebase.1,
                track.control_url,
            );
            self.depacketizers
                .insert(track.payload_type, Depacketizer::new(track.codec));
            self.rtp_rtcp.add_rtp_receiver(track.payload_type);
            self.tracks.insert(track.payload_type, track);
        }
        debug!(
            "{}: session {} (timeout {}s)",
            self.current_url, result.session.id, result.session.timeout_sec
        );
        self.session = Some(result.session);
        self.content_base = result.content_base;
        self.set_state(State::Described);
        Ok(())
    }

    fn request_setup(&mut self) -> Result<(), Error> {
        if self.state != State::Described {
            bail!(ErrorInt::FailedPrecondition(format!(
                "SETUP in state {}",
                self.state
            )));
        }
        let setups: Vec<(u8, String)> = self
            .tracks
            .values()
            .map(|t| (t.payload_type, t.control_url.clone()))
            .collect();
        let mut interleaved_channel = 0u8;
        for (payload_type, control_url) in setups {
            let request_uri = match Url::parse(&control_url) {
                Ok(url) => url,
                Err(e) => {
                    let conn_ctx = self.conn_ctx();
                    return self.fail(ErrorInt::ProtocolError {
                        conn_ctx,
                        description: format!("control URL {control_url:?} is unparseable: {e}"),
                    });
                }
            };
            // The server's channel id choice is not parsed: interleaved
            // payloads are routed by RTP payload type, not channel.
            let transport = format!(
                "RTP/AVP/TCP;unicast;interleaved={}-{}",
                interleaved_channel,
                interleaved_channel + 1
            );
            interleaved_channel += 2;
            let request =
                rtsp_types::Request::builder(rtsp_types::Method::Setup, rtsp_types::Version::V1_0)
                    .request_uri(request_uri)
                    .header(rtsp_types::headers::TRANSPORT, transport)
                    .header(rtsp_types::headers::SESSION, self.session_id_or_fail()?)
                    .build(Bytes::new());
            let cseq = self.send_request(request)?;
            let response = self.receive_response(rtsp_types::Method::Setup, cseq)?;
            self.check_status(rtsp_types::Method::Setup, cseq, &response)?;
            debug!(
                "{}: SETUP complete for payload type {payload_type}",
                self.current_url
            );
        }
        Ok(())
    }

    /// Fills in `CSeq` and `User-Agent`, registers the pending-response slot,
    /// and sends. CSeq values are strictly increasing for the session's life.
    fn send_request(&mut self, mut request: rtsp_types::Request<Bytes>) -> Result<u32, Error> {
        let cseq = self.next_cseq;
        self.next_cseq += 1;
        request.insert_header(rtsp_types::headers::CSEQ, cseq.to_string());
        request.insert_header(
            rtsp_types::headers::USER_AGENT,
            self.options.user_agent.clone(),
        );
        let method = request.method().clone();
        if let Err(description) = self.correlator.register(cseq, request.clone()) {
            return self.fail(ErrorInt::FailedPrecondition(description));
        }
        let mut buf = Vec::new();
        rtsp_types::Message::Request(request)
            .write(&mut buf)
            .expect("serializing to a Vec is infallible");
        trace!("{}: sending {:?} CSeq={cseq}", self.current_url, method);
        let socket = match self.socket.as_mut() {
            Some(socket) => socket,
            None => {
                let _ = self.correlator.take_for_direct_receive(cseq);
                return self.fail(ErrorInt::FailedPrecondition(
                    "socket not connected".to_owned(),
                ));
            }
        };
        if let Err(e) = socket.send(&buf) {
            let _ = self.correlator.take_for_direct_receive(cseq);
            let conn_ctx = self.conn_ctx();
            return self.fail(ErrorInt::WriteError {
                conn_ctx,
                source: e,
            });
        }
        Ok(cseq)
    }

    /// Waits for the response to `cseq`.
    ///
    /// While playing, the event-loop worker completes the slot and this
    /// blocks on the correlator. In every other state the caller owns the
    /// socket and drains it directly.
    fn receive_response(
        &mut self,
        method: rtsp_types::Method,
        cseq: u32,
    ) -> Result<rtsp_types::Response<Bytes>, Error> {
        let timeout = self.options.request_timeout;
        if self.state == State::Playing {
            match self.correlator.wait(cseq, timeout) {
                Some(response) => Ok(response),
                None => self.fail(ErrorInt::Timeout {
                    method,
                    cseq,
                    timeout,
                }),
            }
        } else {
            let _ = self.correlator.take_for_direct_receive(cseq);
            self.receive_response_direct(method, cseq, timeout)
        }
    }

    fn receive_response_direct(
        &mut self,
        method: rtsp_types::Method,
        cseq: u32,
        timeout: Duration,
    ) -> Result<rtsp_types::Response<Bytes>, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            while let Some(received) = self.demuxer.pop_message() {
                match received.msg {
                    rtsp_types::Message::Response(response) => {
                        // Outside the playing state, an unexpected CSeq can
                        // only mean the dialogue is out of step.
                        if parse::get_cseq(&response) != Some(cseq) {
                            let conn_ctx = self.conn_ctx();
                            return self.fail(ErrorInt::ProtocolError {
                                conn_ctx,
                                description: format!(
                                    "unexpected CSeq at {} while waiting for CSeq {cseq}",
                                    received.ctx
                                ),
                            });
                        }
                        return Ok(response);
                    }
                    rtsp_types::Message::Request(request) => {
                        info!(
                            "{}: ignoring {:?} request from server during setup",
                            self.current_url,
                            request.method()
                        );
                    }
                    rtsp_types::Message::Data(_) => {
                        unreachable!("demuxer queues interleaved data separately")
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return self.fail(ErrorInt::Timeout {
                    method,
                    cseq,
                    timeout,
                });
            }
            self.recv_into_demuxer(RecvMode::Blocking(deadline - now))?;
        }
    }

    /// Performs one receive and appends whatever arrived to the demuxer.
    /// Returns the number of bytes read (0 on idle).
    fn recv_into_demuxer(&mut self, mode: RecvMode) -> Result<usize, Error> {
        let socket = match self.socket.as_mut() {
            Some(socket) => socket,
            None => {
                return self.fail(ErrorInt::FailedPrecondition(
                    "socket not connected".to_owned(),
                ))
            }
        };
        match socket.recv(&mut self.recv_buf, mode) {
            Ok(RecvOutcome::Data(n)) => {
                if let Err(e) = self.demuxer.append(&self.recv_buf[..n]) {
                    let conn_ctx = self.conn_ctx();
                    return self.fail(ErrorInt::FramingError {
                        conn_ctx,
                        pos: e.pos,
                        description: e.description,
                    });
                }
                Ok(n)
            }
            Ok(RecvOutcome::Idle) => Ok(0),
            Ok(RecvOutcome::Closed) => {
                let conn_ctx = self.conn_ctx();
                self.fail(ErrorInt::ConnectionClosed { conn_ctx })
            }
            Err(e) => {
                let conn_ctx = self.conn_ctx();
                self.fail(ErrorInt::ReadError {
                    conn_ctx,
                    source: e,
                })
            }
        }
    }

    fn handle_rtp_event(&mut self, event: RtpEvent) {
        match event {
            RtpEvent::Frame(packets) => self.dispatch_frame(packets),
            RtpEvent::Rtcp(info) => {
                // No action on RTCP yet.
                match info.sender_report {
                    Some(sr) => trace!(
                        "{}: RTCP sender report ssrc={:08x} ntp={} rtp={}",
                        self.current_url,
                        sr.ssrc,
                        sr.ntp_timestamp,
                        sr.rtp_timestamp
                    ),
                    None => trace!(
                        "{}: RTCP compound packet ({} packets, no sender report)",
                        self.current_url,
                        info.packet_count
                    ),
                }
            }
        }
    }

    /// Depacketizes one reassembled packet group and hands the frame to the
    /// sink with its normalised timestamp.
    fn dispatch_frame(&mut self, packets: PacketGroup) {
        let first = match packets.first() {
            Some(first) => first,
            None => return,
        };
        let payload_type = first.payload_type();
        let raw_timestamp = first.timestamp();
        let (media, codec) = match self.tracks.get(&payload_type) {
            Some(track) => (track.media, track.codec),
            None => {
                warn!(
                    "{}: no track for payload type {payload_type}; dropping frame",
                    self.current_url
                );
                return;
            }
        };
        let depacketizer = match self.depacketizers.get_mut(&payload_type) {
            Some(depacketizer) => depacketizer,
            None => {
                warn!(
                    "{}: no depacketizer for payload type {payload_type}; dropping frame",
                    self.current_url
                );
                return;
            }
        };
        let payloads: Vec<Bytes> = packets.into_iter().map(|p| p.into_payload()).collect();
        let data = match depacketizer.assemble(&payloads) {
            Ok(Some(data)) => data,
            // Partial state awaiting the next packet group.
            Ok(None) => return,
            Err(description) => {
                warn!(
                    "{}: could not depacketize payload type {payload_type}: {description}",
                    self.current_url
                );
                return;
            }
        };
        let timestamp = self.normalizer.normalize(payload_type, raw_timestamp);
        trace!(
            "{}: frame payload_type={payload_type} raw_ts={raw_timestamp} ts={timestamp} len={}",
            self.current_url,
            data.len()
        );
        self.sink.send_frame(MediaPacket {
            track_id: payload_type,
            media,
            data,
            pts: timestamp,
            dts: timestamp,
            format: codec.bitstream_format(),
            kind: codec.packet_kind(),
        });
    }

    fn check_status(
        &mut self,
        method: rtsp_types::Method,
        cseq: u32,
        response: &rtsp_types::Response<Bytes>,
    ) -> Result<(), Error> {
        if response.status() != rtsp_types::StatusCode::Ok {
            let conn_ctx = self.conn_ctx();
            return self.fail(ErrorInt::ResponseError {
                conn_ctx,
                method,
                cseq,
                status: response.status(),
                description: format!("server rejected request: {}", response.reason_phrase()),
            });
        }
        Ok(())
    }

    fn session_id_or_fail(&self) -> Result<String, Error> {
        match &self.session {
            Some(session) => Ok(session.id.to_string()),
            None => bail!(ErrorInt::FailedPrecondition(
                "no session id established".to_owned()
            )),
        }
    }

    fn set_state(&mut self, next: State) {
        if self.state != next {
            debug!("{}: {} -> {}", self.current_url, self.state, next);
            self.state = next;
        }
    }

    /// Moves to [`State::Error`], closes the socket, and fails pending slots.
    fn mark_failed(&mut self) {
        self.set_state(State::Error);
        self.close_socket();
    }

    fn fail<T>(&mut self, e: ErrorInt) -> Result<T, Error> {
        self.mark_failed();
        Err(wrap!(e))
    }

    fn close_socket(&mut self) {
        if let Some(socket) = self.socket.as_mut() {
            socket.close();
        }
        let pending = self.correlator.pending_count();
        if pending > 0 {
            debug!(
                "{}: failing {pending} pending request(s) on socket close",
                self.current_url
            );
        }
        self.correlator.fail_all();
    }

    fn conn_ctx(&self) -> ConnectionContext {
        self.socket
            .as_ref()
            .and_then(|s| s.ctx().copied())
            .unwrap_or_else(ConnectionContext::dummy)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close_socket();
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::Mutex;

    use super::*;
    use crate::codec::BitstreamFormat;

    struct RecordingSink(Arc<Mutex<Vec<MediaPacket>>>);

    impl MediaSink for RecordingSink {
        fn send_frame(&mut self, packet: MediaPacket) {
            self.0.lock().unwrap().push(packet);
        }
    }

    struct NullSink;

    impl MediaSink for NullSink {
        fn send_frame(&mut self, _packet: MediaPacket) {}
    }

    const SDP: &[u8] = b"v=0\r\n\
        o=- 0 0 IN IP4 127.0.0.1\r\n\
        s=cam\r\n\
        t=0 0\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=control:trackID=1\r\n";

    /// Reads one headers-only RTSP request, returning `(method, cseq)`.
    fn read_request(stream: &mut TcpStream, buf: &mut Vec<u8>) -> (String, u32) {
        loop {
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8(buf[..end].to_vec()).unwrap();
                buf.drain(..end + 4);
                let method = head.split_whitespace().next().unwrap().to_owned();
                let cseq = head
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("cseq")
                            .then(|| value.trim().parse().unwrap())
                    })
                    .unwrap();
                return (method, cseq);
            }
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "client closed mid-request");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn serve_happy_session(listener: TcpListener, base: String) {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = Vec::new();
        let mut last_cseq = 0u32;
        loop {
            let (method, cseq) = read_request(&mut stream, &mut buf);
            assert!(cseq > last_cseq, "CSeq not strictly increasing");
            last_cseq = cseq;
            match method.as_str() {
                "DESCRIBE" => {
                    let response = format!(
                        "RTSP/1.0 200 OK\r\n\
                         CSeq: {cseq}\r\n\
                         Session: 12345678;timeout=60\r\n\
                         Content-Base: {base}\r\n\
                         Content-Type: application/sdp\r\n\
                         Content-Length: {}\r\n\r\n",
                        SDP.len()
                    );
                    stream.write_all(response.as_bytes()).unwrap();
                    stream.write_all(SDP).unwrap();
                }
                "SETUP" => {
                    let response = format!(
                        "RTSP/1.0 200 OK\r\n\
                         CSeq: {cseq}\r\n\
                         Session: 12345678\r\n\
                         Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n"
                    );
                    stream.write_all(response.as_bytes()).unwrap();
                }
                "PLAY" => {
                    // Fuse the response and the first interleaved frame into
                    // one segment, as servers routinely do.
                    let rtp = crate::rtp::build_rtp(96, 1, 5000, true, b"\x65\x11\x22\x33");
                    let mut out =
                        format!("RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\nSession: 12345678\r\n\r\n")
                            .into_bytes();
                    out.push(b'$');
                    out.push(0);
                    out.extend_from_slice(&(rtp.len() as u16).to_be_bytes());
                    out.extend_from_slice(&rtp);
                    stream.write_all(&out).unwrap();
                }
                "TEARDOWN" => {
                    let response =
                        format!("RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\nSession: 12345678\r\n\r\n");
                    stream.write_all(response.as_bytes()).unwrap();
                    return;
                }
                o => panic!("unexpected method {o}"),
            }
        }
    }

    #[test]
    fn end_to_end_single_h264_track() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let base = format!("rtsp://{addr}/cam/");
        let server = std::thread::spawn(move || serve_happy_session(listener, base));

        let frames = Arc::new(Mutex::new(Vec::new()));
        let pool = Arc::new(SocketPool::new());
        let options = SessionOptions::default().url_list([format!("rtsp://{addr}/cam")]);
        let mut session = Session::new(
            options,
            &pool,
            Box::new(RecordingSink(Arc::clone(&frames))),
        )
        .unwrap();

        session.start().unwrap();
        assert_eq!(session.state(), State::Described);
        assert_eq!(session.session_id(), Some("12345678"));
        assert_eq!(
            session.content_base(),
            Some(format!("rtsp://{addr}/cam/").as_str())
        );
        let track = session.tracks().next().unwrap();
        assert_eq!(track.payload_type, 96);
        assert_eq!(track.media, MediaKind::Video);
        assert_eq!(track.codec, CodecId::H264);
        assert_eq!(track.timebase, (1, 90_000));
        assert_eq!(track.control_url, format!("rtsp://{addr}/cam/trackID=1"));
        assert!(session.origin_request_time().is_some());
        assert!(session.origin_response_time().is_some());

        session.play().unwrap();
        assert_eq!(session.state(), State::Playing);
        assert!(session.as_raw_fd().is_some());

        let deadline = Instant::now() + Duration::from_secs(5);
        while frames.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "no frame before deadline");
            match session.process_media_packet() {
                ProcessResult::Failure => panic!("process_media_packet failed"),
                ProcessResult::Success => {}
                ProcessResult::TryAgain => std::thread::sleep(Duration::from_millis(5)),
            }
        }
        {
            let frames = frames.lock().unwrap();
            let frame = &frames[0];
            assert_eq!(frame.track_id, 96);
            assert_eq!(frame.media, MediaKind::Video);
            assert_eq!(frame.pts, 0);
            assert_eq!(frame.dts, 0);
            assert_eq!(frame.format, BitstreamFormat::H264AnnexB);
            assert_eq!(frame.kind, crate::codec::PacketKind::Nalu);
            assert_eq!(&frame.data[..], b"\x00\x00\x00\x01\x65\x11\x22\x33");
        }

        session.stop().unwrap();
        assert_eq!(session.state(), State::Stopped);
        server.join().unwrap();
    }

    #[test]
    fn describe_without_session_header_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            let (method, cseq) = read_request(&mut stream, &mut buf);
            assert_eq!(method, "DESCRIBE");
            let response = format!(
                "RTSP/1.0 200 OK\r\n\
                 CSeq: {cseq}\r\n\
                 Content-Type: application/sdp\r\n\
                 Content-Length: {}\r\n\r\n",
                SDP.len()
            );
            stream.write_all(response.as_bytes()).unwrap();
            stream.write_all(SDP).unwrap();
        });

        let pool = Arc::new(SocketPool::new());
        let options = SessionOptions::default().url_list([format!("rtsp://{addr}/cam")]);
        let mut session = Session::new(options, &pool, Box::new(NullSink)).unwrap();
        let e = session.start().unwrap_err();
        assert!(format!("{e}").contains("Session"), "{e}");
        assert_eq!(session.state(), State::Error);
        server.join().unwrap();
    }

    #[test]
    fn describe_rejection_surfaces_status() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            let (_, cseq) = read_request(&mut stream, &mut buf);
            let response = format!("RTSP/1.0 454 Session Not Found\r\nCSeq: {cseq}\r\n\r\n");
            stream.write_all(response.as_bytes()).unwrap();
        });

        let pool = Arc::new(SocketPool::new());
        let options = SessionOptions::default().url_list([format!("rtsp://{addr}/cam")]);
        let mut session = Session::new(options, &pool, Box::new(NullSink)).unwrap();
        let e = session.start().unwrap_err();
        assert_eq!(e.status_code(), Some(454));
        assert_eq!(session.state(), State::Error);
        server.join().unwrap();
    }

    #[test]
    fn new_requires_a_parsable_url() {
        let pool = Arc::new(SocketPool::new());
        Session::new(SessionOptions::default(), &pool, Box::new(NullSink)).unwrap_err();
        Session::new(
            SessionOptions::default().url_list(["not a url"]),
            &pool,
            Box::new(NullSink),
        )
        .unwrap_err();
    }

    #[test]
    fn non_rtsp_scheme_is_rejected() {
        let pool = Arc::new(SocketPool::new());
        let mut session = Session::new(
            SessionOptions::default().url_list(["http://example.com/"]),
            &pool,
            Box::new(NullSink),
        )
        .unwrap();
        session.start().unwrap_err();
        assert_eq!(session.state(), State::Error);
    }

    #[test]
    fn connect_failure_is_an_error_state() {
        // Bind then drop so the port is very likely closed.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = Arc::new(SocketPool::new());
        let mut session = Session::new(
            SessionOptions::default().url_list([format!("rtsp://{addr}/")]),
            &pool,
            Box::new(NullSink),
        )
        .unwrap();
        session.start().unwrap_err();
        assert_eq!(session.state(), State::Error);
        // Once failed, processing reports failure persistently.
        assert_eq!(session.process_media_packet(), ProcessResult::Failure);
    }

    #[test]
    fn play_requires_described() {
        let pool = Arc::new(SocketPool::new());
        let mut session = Session::new(
            SessionOptions::default().url_list(["rtsp://example.com/"]),
            &pool,
            Box::new(NullSink),
        )
        .unwrap();
        session.play().unwrap_err();
        assert_eq!(session.state(), State::Idle);
        // stop outside the playing state is a no-op.
        session.stop().unwrap();
        assert_eq!(session.state(), State::Idle);
    }
}
