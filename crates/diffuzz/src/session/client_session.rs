// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-connection state machine (ch. 4.3).
//!
//! One dedicated reader thread and one writer thread per session, each
//! doing blocking I/O on a cloned `TcpStream` handle - the same
//! thread-per-connection shape as the admin API's accept loop, just with
//! two threads instead of one since this protocol pushes and pulls
//! independently rather than request/response. A read timeout lets the
//! reader notice `Dead` without a dedicated shutdown socket.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::config::{Arch, BuildFlags, MAX_IN_FLIGHT_BYTES};
use crate::error::SessionError;
use crate::session::handshake::ClientMeta;
use crate::wire::{FrameCodec, MultiResult, ZlibReceiver, ZlibSender};

const READ_TIMEOUT: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshake,
    Ready,
    Running,
    Draining,
    Dead,
}

struct PendingEntry {
    ticket: u64,
    n_results: u32,
    payload: Vec<u8>,
    priority: bool,
}

struct InFlightEntry {
    ticket: u64,
    n_results: u32,
    byte_size: usize,
}

struct Inner {
    state: SessionState,
    pending: VecDeque<PendingEntry>,
    in_flight: VecDeque<InFlightEntry>,
    in_flight_bytes: usize,
    results: HashMap<u64, Vec<MultiResult>>,
    lost: bool,
}

/// One connected runner process.
pub struct ClientSession {
    pub meta: ClientMeta,
    pub arch: Arch,
    pub flags: BuildFlags,
    pub max_batch_n: u32,
    next_ticket: AtomicU64,
    inner: Mutex<Inner>,
    pending_cv: Condvar,
    results_cv: Condvar,
    budget_cv: Condvar,
    writer_handle: Mutex<Option<thread::JoinHandle<()>>>,
    reader_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ClientSession {
    pub fn spawn(
        stream: TcpStream,
        meta: ClientMeta,
        arch: Arch,
        flags: BuildFlags,
        max_batch_n: u32,
    ) -> Result<Arc<ClientSession>, SessionError> {
        stream
            .set_nodelay(true)
            .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;

        let session = Arc::new(ClientSession {
            meta,
            arch,
            flags,
            max_batch_n,
            next_ticket: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                state: SessionState::Ready,
                pending: VecDeque::new(),
                in_flight: VecDeque::new(),
                in_flight_bytes: 0,
                results: HashMap::new(),
                lost: false,
            }),
            pending_cv: Condvar::new(),
            results_cv: Condvar::new(),
            budget_cv: Condvar::new(),
            writer_handle: Mutex::new(None),
            reader_handle: Mutex::new(None),
        });

        let writer_stream = stream
            .try_clone()
            .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;
        let reader_stream = stream;

        let writer_session = session.clone();
        let writer = thread::spawn(move || writer_session.writer_loop(writer_stream));
        let reader_session = session.clone();
        let reader = thread::spawn(move || reader_session.reader_loop(reader_stream));

        *session.writer_handle.lock().unwrap() = Some(writer);
        *session.reader_handle.lock().unwrap() = Some(reader);

        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.state(), SessionState::Dead)
    }

    /// Enqueues a batch for this session. Returns the ticket the caller
    /// should pass to [`Self::get_results`]. `n_results` is the number of
    /// per-input reply chunks the runner will send back for this ticket.
    pub fn schedule(&self, n_results: u32, payload: Vec<u8>, priority: bool) -> u64 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        inner.state = SessionState::Running;
        let entry = PendingEntry { ticket, n_results, payload, priority };
        if priority {
            inner.pending.push_front(entry);
        } else {
            inner.pending.push_back(entry);
        }
        drop(inner);
        self.pending_cv.notify_all();
        ticket
    }

    /// Blocks until `ticket`'s results are available or the session dies.
    pub fn get_results(&self, ticket: u64) -> Result<Vec<MultiResult>, SessionError> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(results) = inner.results.remove(&ticket) {
                return Ok(results);
            }
            if inner.lost {
                let unrelated = inner.in_flight.front().map(|e| e.ticket != ticket).unwrap_or(true);
                return Err(SessionError::LostClient { ticket, unrelated });
            }
            inner = self.results_cv.wait(inner).unwrap();
        }
    }

    fn mark_dead(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = SessionState::Dead;
        inner.lost = true;
        drop(inner);
        self.pending_cv.notify_all();
        self.results_cv.notify_all();
        self.budget_cv.notify_all();
    }

    fn writer_loop(&self, mut stream: TcpStream) {
        let mut codec_buf = Vec::new();
        // ch. 4.2: server->client compression is optional, gated on the
        // COMPRESS_RECV build flag (the runner decompresses on its recv
        // side); client->server is always zlib, handled in `reader_loop`.
        let mut zlib = self.flags.compress_recv.then(ZlibSender::new);
        loop {
            let mut inner = self.inner.lock().unwrap();
            while inner.pending.is_empty() && !inner.lost {
                inner = self.pending_cv.wait(inner).unwrap();
            }
            if inner.lost {
                return;
            }

            let mut batch = vec![inner.pending.pop_front().unwrap()];
            let mut total_results = batch[0].n_results;
            while let Some(front) = inner.pending.front() {
                let would_be = total_results + front.n_results;
                if would_be as u64 > 2 * self.max_batch_n as u64 - 1 {
                    break;
                }
                total_results = would_be;
                batch.push(inner.pending.pop_front().unwrap());
            }
            drop(inner);

            codec_buf.clear();
            let tickets: Vec<(u64, u32)> = batch.iter().map(|e| (e.ticket, e.n_results)).collect();
            let mut payload = Vec::new();
            for entry in &batch {
                payload.extend_from_slice(&entry.payload);
            }
            let wire_bytes = match &mut zlib {
                Some(sender) => match sender.compress_message(&payload) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::warn!("session {}: compression failed: {e}", self.meta.hostname);
                        self.mark_dead();
                        return;
                    }
                },
                None => payload,
            };
            FrameCodec::encode_into(&wire_bytes, &mut codec_buf);
            let byte_size = codec_buf.len();

            let mut inner = self.inner.lock().unwrap();
            while inner.in_flight_bytes + byte_size > MAX_IN_FLIGHT_BYTES && !inner.lost {
                inner = self.budget_cv.wait(inner).unwrap();
            }
            if inner.lost {
                return;
            }
            // Coalesced tickets share one wire frame; split its byte cost
            // evenly so budget accounting still balances when each ticket's
            // results arrive and free their share independently.
            for (ticket, n_results) in &tickets {
                inner.in_flight.push_back(InFlightEntry {
                    ticket: *ticket,
                    n_results: *n_results,
                    byte_size: byte_size / tickets.len().max(1),
                });
            }
            inner.in_flight_bytes += byte_size;
            drop(inner);

            if let Err(e) = stream.write_all(&codec_buf) {
                log::warn!("session {}: write failed: {e}", self.meta.hostname);
                self.mark_dead();
                return;
            }
        }
    }

    fn reader_loop(&self, mut stream: TcpStream) {
        let mut codec = FrameCodec::with_default_max();
        // ch. 4.2: client->server is always zlib streaming, one decompressor
        // instance for the session's whole lifetime.
        let mut zlib = ZlibReceiver::new();
        loop {
            if self.is_dead() {
                return;
            }
            let frame = match codec.decode(&mut stream) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("session {}: terminal read error: {e}", self.meta.hostname);
                    self.mark_dead();
                    return;
                }
            };
            let payload = match zlib.decompress_message(&frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("session {}: decompression failed: {e}", self.meta.hostname);
                    self.mark_dead();
                    return;
                }
            };

            let mut cursor = 0usize;
            let mut inner = self.inner.lock().unwrap();
            while cursor < payload.len() {
                let Some(entry) = inner.in_flight.pop_front() else {
                    log::warn!("session {}: reply with no outstanding ticket", self.meta.hostname);
                    break;
                };
                inner.in_flight_bytes = inner.in_flight_bytes.saturating_sub(entry.byte_size);
                let mut results = Vec::with_capacity(entry.n_results as usize);
                for _ in 0..entry.n_results {
                    match MultiResult::decode_ticket_reply(&payload[cursor..], self.arch, self.flags) {
                        Ok((multi, consumed)) => {
                            cursor += consumed;
                            results.push(multi);
                        }
                        Err(e) => {
                            log::warn!("session {}: malformed reply: {e}", self.meta.hostname);
                            break;
                        }
                    }
                }
                inner.results.insert(entry.ticket, results);
            }
            drop(inner);
            self.results_cv.notify_all();
            self.budget_cv.notify_all();
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.mark_dead();
        if let Some(handle) = self.writer_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.reader_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
