// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-connection state machine for the framed peer protocol.
//!
//! One [`PeerChannel`] per TCP connection, on either side of either surface
//! (topic data or service calls). The machine is strictly non-blocking:
//! socket readiness feeds bytes into the inbound buffer, `advance` consumes
//! whatever is parseable and emits [`ChannelEvent`]s, and queued outbound
//! bytes drain on writability.
//!
//! ```text
//! client side (subscriber / service caller):
//!   Idle -> Connecting -> WritingHeader -> ReadingHeader
//!        -> ReadingSize -> ReadingPayload -> (ReadingSize ...)     topic
//!        -> WritingPayload -> ReadingOkByte -> ReadingSize
//!        -> ReadingPayload -> (WritingPayload ... | Closed)        service
//!
//! server side (publisher / service provider):
//!   Accepted -> ReadingHeader -> WritingHeader
//!            -> WritingPayload                                     topic
//!            -> ReadingSize -> ReadingPayload -> (ReadingSize ...) service
//! ```
//!
//! Header validation is the node's job: the machine surfaces
//! [`ChannelEvent::HeaderReceived`] and the node answers with
//! [`PeerChannel::complete_handshake`], [`PeerChannel::accept_with`] or
//! [`PeerChannel::reject_with`].

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::SocketAddr;

use mio::net::TcpStream;

use super::header::ConnectionHeader;
use crate::buffer::{ByteBuffer, DEFAULT_HIGH_WATER};
use crate::error::{kind_of_io_error, ErrorKind, ErrorPack, RosResult};

/// Largest accepted data frame (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Initial reconnect backoff.
pub const BACKOFF_INITIAL_US: u64 = 100_000;

/// Reconnect backoff cap.
pub const BACKOFF_CAP_US: u64 = 4_000_000;

/// Which side and surface this connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// Client side of a topic connection; receives data frames.
    SubscriberData,
    /// Server side of a topic connection; sends data frames.
    PublisherData,
    /// Client side of a service connection; sends requests, reads responses.
    ServiceCaller,
    /// Server side of a service connection; reads requests, sends responses.
    ServiceProvider,
}

impl ChannelRole {
    /// True for the accepted (server) sides.
    pub fn is_server(&self) -> bool {
        matches!(self, ChannelRole::PublisherData | ChannelRole::ServiceProvider)
    }
}

/// Protocol phase of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No socket yet (outbound before connect, or between reconnects).
    Idle,
    /// Non-blocking connect in progress.
    Connecting,
    /// Own header queued, draining to the socket.
    WritingHeader,
    /// Waiting for the remote header block.
    ReadingHeader,
    /// Accepted inbound socket, header not yet read.
    Accepted,
    /// Waiting for a 4-byte frame length.
    ReadingSize,
    /// Waiting for the frame payload.
    ReadingPayload,
    /// Waiting for the 1-byte service ok flag.
    ReadingOkByte,
    /// Data phase, write side (publisher steady state / caller request slot).
    WritingPayload,
    /// Terminal.
    Closed,
}

/// What `advance` extracted from the inbound buffer.
#[derive(Debug, PartialEq)]
pub enum ChannelEvent {
    /// The remote header block arrived; the node must validate and answer.
    HeaderReceived(ConnectionHeader),
    /// A complete data frame (topic message or service request).
    MessageReceived(Vec<u8>),
    /// A complete service response.
    ServiceResponse { ok: bool, payload: Vec<u8> },
}

/// Outcome of queueing a frame against the high-water mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Frame appended to the outbound buffer.
    Queued,
    /// Outbound buffer over the high-water mark; retry on writability.
    WouldBlock,
}

/// One peer connection's full state.
#[derive(Debug)]
pub struct PeerChannel {
    role: ChannelRole,
    state: ChannelState,

    stream: Option<TcpStream>,
    inbuf: ByteBuffer,
    outbuf: ByteBuffer,

    /// Publisher-side frame queue, drained into `outbuf` as the socket
    /// accepts bytes. Bounded by the owning publisher's queue size with
    /// drop-oldest discipline.
    pending: VecDeque<Vec<u8>>,
    pending_bytes: usize,

    /// Header this side sends; set at construction for client roles, by
    /// `accept_with` for server roles.
    local_header: Option<ConnectionHeader>,

    /// Remote address for outbound connects and reconnects.
    remote: Option<SocketAddr>,

    /// Pending frame length while in `ReadingPayload`.
    pending_len: usize,

    /// Ok flag read ahead of a service response payload.
    pending_ok: bool,

    /// Close once the outbound buffer drains (error-header rejections).
    close_after_flush: bool,

    high_water: usize,
    reconnect_attempts: u32,
    backoff_until_us: u64,
    last_activity_us: u64,
}

impl PeerChannel {
    /// Create an outbound (client-side) channel.
    ///
    /// The channel stays `Idle` until the loop calls [`begin_connect`].
    ///
    /// [`begin_connect`]: PeerChannel::begin_connect
    pub fn outbound(role: ChannelRole, remote: SocketAddr, header: ConnectionHeader) -> Self {
        debug_assert!(!role.is_server());
        Self {
            role,
            state: ChannelState::Idle,
            stream: None,
            inbuf: ByteBuffer::new(),
            outbuf: ByteBuffer::new(),
            pending: VecDeque::new(),
            pending_bytes: 0,
            local_header: Some(header),
            remote: Some(remote),
            pending_len: 0,
            pending_ok: false,
            close_after_flush: false,
            high_water: DEFAULT_HIGH_WATER,
            reconnect_attempts: 0,
            backoff_until_us: 0,
            last_activity_us: 0,
        }
    }

    /// Wrap an accepted (server-side) socket.
    pub fn accepted(role: ChannelRole, stream: TcpStream, now_us: u64) -> Self {
        debug_assert!(role.is_server());
        Self {
            role,
            state: ChannelState::Accepted,
            stream: Some(stream),
            inbuf: ByteBuffer::new(),
            outbuf: ByteBuffer::new(),
            pending: VecDeque::new(),
            pending_bytes: 0,
            local_header: None,
            remote: None,
            pending_len: 0,
            pending_ok: false,
            close_after_flush: false,
            high_water: DEFAULT_HIGH_WATER,
            reconnect_attempts: 0,
            backoff_until_us: 0,
            last_activity_us: now_us,
        }
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn stream(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    pub fn is_closed(&self) -> bool {
        self.state == ChannelState::Closed
    }

    /// Timestamp of the last successful socket activity.
    pub fn last_activity_us(&self) -> u64 {
        self.last_activity_us
    }

    /// Earliest time a reconnect may be attempted.
    pub fn backoff_until_us(&self) -> u64 {
        self.backoff_until_us
    }

    /// True when the loop should register write interest.
    pub fn wants_write(&self) -> bool {
        self.state == ChannelState::Connecting
            || !self.outbuf.is_empty()
            || !self.pending.is_empty()
    }

    /// Server-side channels learn their surface (topic vs service) from the
    /// remote header; the node rebinds the role before answering.
    pub(crate) fn set_role(&mut self, role: ChannelRole) {
        self.role = role;
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Start a non-blocking connect toward the stored remote address.
    pub fn begin_connect(&mut self, now_us: u64) -> RosResult<()> {
        let remote = self
            .remote
            .ok_or_else(|| ErrorPack::new(ErrorKind::InternalInvariant))?;
        let stream = TcpStream::connect(remote)
            .map_err(|e| ErrorPack::new(kind_of_io_error(&e)))?;
        self.stream = Some(stream);
        self.state = ChannelState::Connecting;
        self.inbuf.clear();
        self.outbuf.clear();
        self.last_activity_us = now_us;
        Ok(())
    }

    /// Non-blocking connect completed; queue the header exchange.
    pub fn on_connected(&mut self, now_us: u64) {
        if let Some(header) = &self.local_header {
            self.outbuf.append(&header.encode());
        }
        self.state = ChannelState::WritingHeader;
        self.last_activity_us = now_us;
    }

    /// Node accepted the handshake on a client-side channel.
    ///
    /// Subscribers move to the data phase; service callers become ready to
    /// send their request.
    pub fn complete_handshake(&mut self) {
        self.reconnect_attempts = 0;
        self.backoff_until_us = 0;
        self.state = match self.role {
            ChannelRole::SubscriberData => ChannelState::ReadingSize,
            ChannelRole::ServiceCaller => ChannelState::WritingPayload,
            _ => self.state,
        };
    }

    /// Node accepted the handshake on a server-side channel; queue the
    /// response header and enter the data phase.
    pub fn accept_with(&mut self, header: ConnectionHeader) {
        self.outbuf.append(&header.encode());
        self.local_header = Some(header);
        self.state = match self.role {
            ChannelRole::PublisherData => ChannelState::WritingPayload,
            ChannelRole::ServiceProvider => ChannelState::ReadingSize,
            _ => self.state,
        };
    }

    /// Node rejected the handshake; queue an error header and close once it
    /// drains.
    pub fn reject_with(&mut self, header: ConnectionHeader) {
        self.outbuf.append(&header.encode());
        self.close_after_flush = true;
    }

    /// Record a disconnect and compute the next backoff window.
    pub fn mark_disconnected(&mut self, now_us: u64) {
        self.stream = None;
        self.inbuf.clear();
        self.outbuf.clear();
        self.pending.clear();
        self.pending_bytes = 0;
        self.pending_len = 0;
        self.state = ChannelState::Idle;

        let backoff = BACKOFF_INITIAL_US
            .saturating_mul(1u64 << self.reconnect_attempts.min(6))
            .min(BACKOFF_CAP_US);
        self.backoff_until_us = now_us + backoff;
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
    }

    /// Number of reconnects attempted since the last successful handshake.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Close the socket and mark terminal.
    pub fn close(&mut self) {
        self.stream = None;
        self.state = ChannelState::Closed;
        self.inbuf.clear();
        self.outbuf.clear();
        self.pending.clear();
        self.pending_bytes = 0;
    }

    // ========================================================================
    // Outbound queueing
    // ========================================================================

    /// Queue a length-prefixed data frame, honoring the high-water mark.
    pub fn queue_frame(&mut self, payload: &[u8]) -> SendOutcome {
        if self.outbuf.over_high_water(self.high_water) {
            return SendOutcome::WouldBlock;
        }
        self.outbuf.append_u32_le(payload.len() as u32);
        self.outbuf.append(payload);
        SendOutcome::Queued
    }

    /// Queue a publisher data frame through the bounded frame queue.
    ///
    /// When the queue already holds `queue_size` frames the oldest is
    /// dropped; when total buffered bytes exceed the high-water mark the
    /// publish is refused instead.
    pub fn queue_data_frame(&mut self, payload: &[u8], queue_size: usize) -> SendOutcome {
        if self.outbuf.len() + self.pending_bytes > self.high_water {
            return SendOutcome::WouldBlock;
        }

        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);

        while self.pending.len() >= queue_size.max(1) {
            if let Some(dropped) = self.pending.pop_front() {
                self.pending_bytes -= dropped.len();
                log::debug!("publisher queue full, dropped oldest frame ({}B)", dropped.len());
            }
        }
        self.pending_bytes += frame.len();
        self.pending.push_back(frame);
        SendOutcome::Queued
    }

    /// Queue a service request and switch to awaiting the response.
    pub fn queue_request(&mut self, payload: &[u8]) -> SendOutcome {
        let outcome = self.queue_frame(payload);
        if outcome == SendOutcome::Queued {
            self.state = ChannelState::ReadingOkByte;
        }
        outcome
    }

    /// Queue a service response: ok flag, then the framed payload.
    pub fn queue_service_response(&mut self, ok: bool, payload: &[u8]) {
        self.outbuf.append(&[u8::from(ok)]);
        self.outbuf.append_u32_le(payload.len() as u32);
        self.outbuf.append(payload);
    }

    /// Bytes currently queued outbound (tests, introspection).
    pub fn outbound_len(&self) -> usize {
        self.outbuf.len() + self.pending_bytes
    }

    /// Frames waiting in the publisher queue.
    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }

    // ========================================================================
    // Inbound parsing
    // ========================================================================

    /// Append raw inbound bytes (socket reads, or tests).
    pub fn feed(&mut self, bytes: &[u8]) {
        self.inbuf.append(bytes);
    }

    /// Consume whatever is parseable from the inbound buffer.
    ///
    /// Emits at most one [`ChannelEvent::HeaderReceived`] (the node must
    /// answer before parsing continues) but drains as many data frames as
    /// are buffered.
    pub fn advance(&mut self) -> RosResult<Vec<ChannelEvent>> {
        let mut events = Vec::new();

        loop {
            match self.state {
                ChannelState::Accepted => {
                    self.state = ChannelState::ReadingHeader;
                }
                ChannelState::ReadingHeader => {
                    match ConnectionHeader::try_decode(&mut self.inbuf)? {
                        Some(header) => {
                            if let Some(reason) = header.error() {
                                log::warn!("peer rejected connection: {}", reason);
                                let kind = if reason.contains("md5") {
                                    ErrorKind::ProtocolMd5Mismatch
                                } else {
                                    ErrorKind::ProtocolMalformed
                                };
                                return Err(ErrorPack::new(kind));
                            }
                            events.push(ChannelEvent::HeaderReceived(header));
                            return Ok(events);
                        }
                        None => return Ok(events),
                    }
                }
                ChannelState::ReadingOkByte => match self.inbuf.take(1) {
                    Some(byte) => {
                        self.pending_ok = byte[0] != 0;
                        self.state = ChannelState::ReadingSize;
                    }
                    None => return Ok(events),
                },
                ChannelState::ReadingSize => match self.inbuf.peek_u32_le() {
                    Some(len) => {
                        let len = len as usize;
                        if len > MAX_FRAME_LEN {
                            return Err(ErrorPack::new(ErrorKind::ProtocolMalformed));
                        }
                        self.inbuf.consume(4);
                        self.pending_len = len;
                        self.state = ChannelState::ReadingPayload;
                    }
                    None => return Ok(events),
                },
                ChannelState::ReadingPayload => match self.inbuf.take(self.pending_len) {
                    Some(payload) => {
                        self.pending_len = 0;
                        match self.role {
                            ChannelRole::ServiceCaller => {
                                events.push(ChannelEvent::ServiceResponse {
                                    ok: self.pending_ok,
                                    payload,
                                });
                                // The node decides persistent-vs-close; park
                                // in the write slot until then.
                                self.state = ChannelState::WritingPayload;
                                return Ok(events);
                            }
                            _ => {
                                events.push(ChannelEvent::MessageReceived(payload));
                                self.state = ChannelState::ReadingSize;
                            }
                        }
                    }
                    None => return Ok(events),
                },
                ChannelState::Idle
                | ChannelState::Connecting
                | ChannelState::WritingHeader
                | ChannelState::WritingPayload
                | ChannelState::Closed => return Ok(events),
            }
        }
    }

    // ========================================================================
    // Socket I/O
    // ========================================================================

    /// Drain the socket into the inbound buffer, then parse.
    ///
    /// A clean EOF or I/O error returns an error pack; the caller decides
    /// between reconnect and teardown.
    pub fn handle_readable(&mut self, now_us: u64) -> RosResult<Vec<ChannelEvent>> {
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Ok(Vec::new()),
        };

        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(ErrorPack::new(ErrorKind::TransportIo));
                }
                Ok(n) => {
                    self.inbuf.append(&chunk[..n]);
                    self.last_activity_us = now_us;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(ErrorPack::new(kind_of_io_error(&e)));
                }
            }
        }

        self.advance()
    }

    /// Progress the write side: finish connects, flush the outbound buffer.
    pub fn handle_writable(&mut self, now_us: u64) -> RosResult<()> {
        if self.state == ChannelState::Connecting {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| ErrorPack::new(ErrorKind::InternalInvariant))?;
            // mio surfaces connect completion as writability; a stored
            // socket error or missing peer address means the connect failed.
            if let Ok(Some(e)) | Err(e) = stream.take_error() {
                log::debug!("connect failed: {}", e);
                return Err(ErrorPack::new(kind_of_io_error(&e)));
            }
            match stream.peer_addr() {
                Ok(_) => self.on_connected(now_us),
                Err(e) if e.kind() == std::io::ErrorKind::NotConnected => return Ok(()),
                Err(e) => return Err(ErrorPack::new(kind_of_io_error(&e))),
            }
        }

        loop {
            // Refill from the frame queue once the direct buffer drains.
            if self.outbuf.is_empty() {
                match self.pending.pop_front() {
                    Some(frame) => {
                        self.pending_bytes -= frame.len();
                        self.outbuf.append(&frame);
                    }
                    None => break,
                }
            }
            let stream = match self.stream.as_mut() {
                Some(s) => s,
                None => return Ok(()),
            };
            match stream.write(self.outbuf.as_slice()) {
                Ok(0) => return Err(ErrorPack::new(ErrorKind::TransportIo)),
                Ok(n) => {
                    self.outbuf.consume(n);
                    self.last_activity_us = now_us;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ErrorPack::new(kind_of_io_error(&e))),
            }
        }

        if self.outbuf.is_empty() {
            if self.close_after_flush {
                self.close();
            } else if self.state == ChannelState::WritingHeader {
                self.state = ChannelState::ReadingHeader;
            }
        }
        Ok(())
    }

    /// Drain queued outbound bytes without a socket (tests).
    #[cfg(test)]
    pub(crate) fn take_outbound(&mut self) -> Vec<u8> {
        while let Some(frame) = self.pending.pop_front() {
            self.pending_bytes -= frame.len();
            self.outbuf.append(&frame);
        }
        let n = self.outbuf.len();
        self.outbuf.take(n).unwrap_or_default()
    }

    /// Force a state (tests).
    #[cfg(test)]
    pub(crate) fn set_state(&mut self, state: ChannelState) {
        self.state = state;
    }
}

// ============================================================================
// Tests
// ============================================================================
