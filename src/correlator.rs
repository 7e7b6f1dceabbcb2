// Copyright (C) 2026 the rtsp-pull authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pairs outgoing RTSP requests with inbound responses by `CSeq`.
//!
//! A pending slot exists only between send and (response or timeout). During
//! setup the caller drains the socket directly and removes the slot with
//! [`ResponseCorrelator::take_for_direct_receive`]; after `PLAY`, responses
//! arrive asynchronously through the event-loop worker, which completes slots
//! while another thread may block in [`ResponseCorrelator::wait`]. The pending
//! map is the only cross-thread structure and is serialised under one mutex;
//! each completion signal is a one-shot rendezvous channel.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use log::debug;

struct Slot {
    request: rtsp_types::Request<Bytes>,
    tx: SyncSender<rtsp_types::Response<Bytes>>,

    /// Taken by the first `wait` on this CSeq. Concurrent waits on the same
    /// CSeq are forbidden.
    rx: Option<Receiver<rtsp_types::Response<Bytes>>>,
}

#[derive(Default)]
pub(crate) struct ResponseCorrelator {
    pending: Mutex<HashMap<u32, Slot>>,
}

impl ResponseCorrelator {
    pub(crate) fn new() -> Self {
        ResponseCorrelator::default()
    }

    /// Inserts a pending slot keyed by the request's CSeq.
    /// Fails if that CSeq is already registered.
    pub(crate) fn register(
        &self,
        cseq: u32,
        request: rtsp_types::Request<Bytes>,
    ) -> Result<(), String> {
        let mut pending = self.pending.lock().unwrap();
        if pending.contains_key(&cseq) {
            return Err(format!("CSeq {cseq} already has a pending response slot"));
        }
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        pending.insert(
            cseq,
            Slot {
                request,
                tx,
                rx: Some(rx),
            },
        );
        Ok(())
    }

    /// Completes the slot matching `cseq`, signalling any waiter.
    ///
    /// Returns `false` if no slot matches; the response is then dropped (it is
    /// a stale/late response after a caller-side timeout).
    pub(crate) fn complete(&self, cseq: u32, response: rtsp_types::Response<Bytes>) -> bool {
        let slot = self.pending.lock().unwrap().remove(&cseq);
        match slot {
            Some(slot) => {
                // The channel has capacity 1 and at most one send per slot, so
                // this never blocks; a send error just means the waiter left.
                let _ = slot.tx.send(response);
                true
            }
            None => {
                debug!("no pending request for response CSeq {cseq}; dropping");
                false
            }
        }
    }

    /// Blocks until the slot is completed or `timeout` elapses.
    /// On timeout the slot is removed and `None` is returned.
    pub(crate) fn wait(
        &self,
        cseq: u32,
        timeout: Duration,
    ) -> Option<rtsp_types::Response<Bytes>> {
        let rx = {
            let mut pending = self.pending.lock().unwrap();
            match pending.get_mut(&cseq) {
                Some(slot) => match slot.rx.take() {
                    Some(rx) => rx,
                    None => {
                        debug!("concurrent wait on CSeq {cseq} rejected");
                        return None;
                    }
                },
                None => return None,
            }
        };
        match rx.recv_timeout(timeout) {
            Ok(response) => Some(response),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                self.pending.lock().unwrap().remove(&cseq);
                None
            }
        }
    }

    /// Removes the slot and returns the original request without waiting, for
    /// the setup phase where the caller drains the socket directly.
    pub(crate) fn take_for_direct_receive(
        &self,
        cseq: u32,
    ) -> Option<rtsp_types::Request<Bytes>> {
        self.pending
            .lock()
            .unwrap()
            .remove(&cseq)
            .map(|slot| slot.request)
    }

    /// Fails every pending slot. Called on socket close; blocked waiters
    /// observe a disconnected channel and return `None`.
    pub(crate) fn fail_all(&self) {
        self.pending.lock().unwrap().clear();
    }

    /// Number of in-flight slots.
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}
