// Copyright (C) 2026 the rtsp-pull authors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc, time::Duration};

use crate::ConnectionContext;
use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// The focus is on detailed human-readable messages; in most cases they have
/// enough information to find the offending exchange in a packet capture.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// Returns the status code, if the error was generated from a response.
    pub fn status_code(&self) -> Option<u16> {
        match self.0.as_ref() {
            ErrorInt::ResponseError { status, .. } => Some((*status).into()),
            _ => None,
        }
    }

    /// Returns true if the error is a request/response timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.0.as_ref(), ErrorInt::Timeout { .. })
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The caller provided an unusable configuration (no parsable URL, bad scheme).
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Unable to connect to RTSP server {url}: {source}")]
    ConnectError {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Error writing to RTSP peer: {source}\n\nconn: {conn_ctx}")]
    WriteError {
        conn_ctx: ConnectionContext,
        #[source]
        source: std::io::Error,
    },

    #[error("Error reading from RTSP peer: {source}\n\nconn: {conn_ctx}")]
    ReadError {
        conn_ctx: ConnectionContext,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection closed by RTSP peer\n\nconn: {conn_ctx}")]
    ConnectionClosed { conn_ctx: ConnectionContext },

    /// Unparseable or unexpected bytes on the signalling socket.
    #[error("RTSP framing error at byte {pos}: {description}\n\nconn: {conn_ctx}")]
    FramingError {
        conn_ctx: ConnectionContext,
        pos: u64,
        description: String,
    },

    #[error("{status} response to {} CSeq={cseq}: {description}\n\nconn: {conn_ctx}",
            Into::<&str>::into(.method))]
    ResponseError {
        conn_ctx: ConnectionContext,
        method: rtsp_types::Method,
        cseq: u32,
        status: rtsp_types::StatusCode,
        description: String,
    },

    /// Well-framed but protocol-violating peer behavior: missing mandatory
    /// header, malformed SDP, unexpected CSeq.
    #[error("RTSP protocol error: {description}\n\nconn: {conn_ctx}")]
    ProtocolError {
        conn_ctx: ConnectionContext,
        description: String,
    },

    #[error("Unsupported {media} codec {encoding:?} in SDP")]
    UnsupportedCodec {
        media: crate::codec::MediaKind,
        encoding: String,
    },

    #[error("No response to {} CSeq={cseq} within {timeout:?}", Into::<&str>::into(.method))]
    Timeout {
        method: rtsp_types::Method,
        cseq: u32,
        timeout: Duration,
    },

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),
}
