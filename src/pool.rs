// Copyright (C) 2026 the rtsp-pull authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Signalling-socket allocation and blocking/non-blocking receive control.
//!
//! The pool is owned by the surrounding provider; sessions hold a non-owning
//! [`std::sync::Weak`] handle to it and allocate their signalling socket at
//! `start`.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use log::trace;

use crate::ConnectionContext;

/// Shared pool of signalling sockets.
///
/// Currently this only tracks how many sockets have been handed out; it
/// exists so that a provider owning many sessions has a single place to
/// observe and, later, to bound them.
#[derive(Debug, Default)]
pub struct SocketPool {
    allocated: AtomicUsize,
}

impl SocketPool {
    pub fn new() -> Self {
        SocketPool::default()
    }

    /// Hands out a fresh, unconnected signalling socket.
    pub fn allocate(&self) -> SignallingSocket {
        let n = self.allocated.fetch_add(1, Ordering::Relaxed) + 1;
        trace!("allocated signalling socket #{n}");
        SignallingSocket {
            stream: None,
            ctx: None,
        }
    }

    /// Total sockets allocated over the pool's lifetime.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

/// Outcome of a single receive attempt.
#[derive(Debug)]
pub(crate) enum RecvOutcome {
    /// `n` bytes were read into the caller's buffer.
    Data(usize),

    /// Nothing available within the deadline (blocking mode) or right now
    /// (non-blocking mode).
    Idle,

    /// The peer closed the connection.
    Closed,
}

#[derive(Debug)]
pub(crate) enum RecvMode {
    Blocking(Duration),
    NonBlocking,
}

/// A TCP signalling socket with explicit blocking/timeout control.
pub struct SignallingSocket {
    stream: Option<TcpStream>,
    ctx: Option<ConnectionContext>,
}

impl SignallingSocket {
    /// Connects to `host:port` within `timeout`, trying each resolved address
    /// in turn.
    pub(crate) fn connect(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<(), std::io::Error> {
        let addrs = (host, port).to_socket_addrs()?;
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    let ctx = ConnectionContext::new(stream.local_addr()?, stream.peer_addr()?);
                    self.stream = Some(stream);
                    self.ctx = Some(ctx);
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("no addresses resolved for {host}:{port}"),
            )
        }))
    }

    pub(crate) fn send(&mut self, bytes: &[u8]) -> Result<(), std::io::Error> {
        self.stream_mut()?.write_all(bytes)
    }

    /// Performs one receive into `buf`.
    ///
    /// In blocking mode the socket's receive timeout is set per call; elapsing
    /// it yields [`RecvOutcome::Idle`]. In non-blocking mode an empty socket
    /// yields `Idle` immediately. A zero-byte read means the peer closed.
    pub(crate) fn recv(
        &mut self,
        buf: &mut [u8],
        mode: RecvMode,
    ) -> Result<RecvOutcome, std::io::Error> {
        let stream = self.stream_mut()?;
        match mode {
            RecvMode::Blocking(timeout) => {
                stream.set_nonblocking(false)?;
                // A zero timeout would mean "no timeout"; clamp up.
                stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
            }
            RecvMode::NonBlocking => stream.set_nonblocking(true)?,
        }
        match stream.read(buf) {
            Ok(0) => Ok(RecvOutcome::Closed),
            Ok(n) => Ok(RecvOutcome::Data(n)),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(RecvOutcome::Idle)
            }
            Err(e) => Err(e),
        }
    }

    /// The native descriptor, for external poll-group registration.
    pub fn as_raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub(crate) fn ctx(&self) -> Option<&ConnectionContext> {
        self.ctx.as_ref()
    }

    /// Closes the socket. Safe to call more than once.
    pub(crate) fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream, std::io::Error> {
        self.stream.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "socket not connected")
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn connect_send_recv() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            peer.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"hello");
            peer.write_all(b"world").unwrap();
        });

        let pool = SocketPool::new();
        let mut socket = pool.allocate();
        assert_eq!(pool.allocated(), 1);
        socket
            .connect(&addr.ip().to_string(), addr.port(), Duration::from_secs(3))
            .unwrap();
        assert!(socket.as_raw_fd().is_some());
        socket.send(b"hello").unwrap();

        let mut buf = [0u8; 16];
        let mut got = 0;
        while got < 5 {
            match socket
                .recv(&mut buf[got..], RecvMode::Blocking(Duration::from_secs(3)))
                .unwrap()
            {
                RecvOutcome::Data(n) => got += n,
                o => panic!("unexpected outcome {o:?}"),
            }
        }
        assert_eq!(&buf[..5], b"world");

        server.join().unwrap();
        // After the server side is gone, a blocking read observes the close.
        match socket
            .recv(&mut buf, RecvMode::Blocking(Duration::from_secs(3)))
            .unwrap()
        {
            RecvOutcome::Closed => {}
            o => panic!("unexpected outcome {o:?}"),
        }
    }

    #[test]
    fn nonblocking_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let pool = SocketPool::new();
        let mut socket = pool.allocate();
        socket
            .connect(&addr.ip().to_string(), addr.port(), Duration::from_secs(3))
            .unwrap();
        let mut buf = [0u8; 16];
        match socket.recv(&mut buf, RecvMode::NonBlocking).unwrap() {
            RecvOutcome::Idle => {}
            o => panic!("unexpected outcome {o:?}"),
        }
    }

    #[test]
    fn recv_before_connect_errors() {
        let pool = SocketPool::new();
        let mut socket = pool.allocate();
        let mut buf = [0u8; 4];
        socket.recv(&mut buf, RecvMode::NonBlocking).unwrap_err();
    }
}
