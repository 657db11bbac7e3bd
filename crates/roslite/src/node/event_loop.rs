// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The single-threaded cooperative loop.
//!
//! Each iteration: start due connects, pump the call queue, sync poll
//! registrations, compute the wake deadline, wait for readiness, advance
//! every ready state machine one step, fire due timers, check the exit
//! flag. All callbacks run here, on the calling thread, never re-entrantly.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::{Events, Interest, Token};

use super::slave::RpcConn;
use super::slots::CallerEvent;
use super::{Node, PeerOwner, TokenTarget, RPC_CLIENT, TCPROS_LISTENER, XMLRPC_LISTENER};
use crate::arena::SlotRef;
use crate::clock::min_deadline;
use crate::error::{ErrorKind, ErrorPack, RosResult};
use crate::msg::{codec, Message};
use crate::tcpros::{ChannelEvent, ChannelRole, ChannelState, ConnectionHeader};
use crate::xmlrpc::ParseStatus;

/// Events processed per poll round.
const MAX_EVENTS: usize = 128;

/// Run the loop until `exit` is set, `timeout` elapses, or a slave-API
/// shutdown arrives.
///
/// On return no I/O is in progress: every state machine is between steps.
pub fn run(node: &mut Node, timeout: Option<Duration>, exit: &AtomicBool) -> RosResult<()> {
    let overall_deadline = timeout.map(|t| node.clock.now_us() + t.as_micros() as u64);
    let mut events = Events::with_capacity(MAX_EVENTS);

    loop {
        if exit.load(Ordering::Relaxed) || node.shutdown_requested {
            return Ok(());
        }
        let now = node.clock.now_us();
        if let Some(deadline) = overall_deadline {
            if now >= deadline {
                return Ok(());
            }
        }

        check_engine_timeout(node, now);
        check_caller_timeouts(node, now);
        start_due_connects(node, now);
        check_handshake_timeouts(node, now);
        pump_call_queue(node, now);
        sync_registrations(node)?;

        let wake = compute_wake_deadline(node, overall_deadline);
        let poll_timeout = wake.map(|deadline| node.clock.until(deadline));

        match node.poll.poll(&mut events, poll_timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::error!("poll failed: {}", e);
                return Err(ErrorPack::new(ErrorKind::TransportIo)
                    .push(ErrorKind::InternalInvariant));
            }
        }

        let ready: Vec<(Token, bool, bool)> = events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable()))
            .collect();

        let now = node.clock.now_us();
        for (token, readable, writable) in ready {
            match token {
                XMLRPC_LISTENER => accept_rpc_conns(node),
                TCPROS_LISTENER => accept_data_peers(node, now),
                RPC_CLIENT => drive_engine(node, readable, writable, now),
                token => match node.token_map.get(&token).copied() {
                    Some(TokenTarget::Peer(peer_ref)) => {
                        if writable {
                            peer_writable(node, peer_ref, now);
                        }
                        if readable {
                            peer_readable(node, peer_ref, now);
                        }
                    }
                    Some(TokenTarget::RpcConn(conn_ref)) => {
                        if readable {
                            rpc_conn_readable(node, conn_ref);
                        }
                        if writable {
                            rpc_conn_writable(node, conn_ref);
                        }
                    }
                    None => {}
                },
            }
        }

        let now = node.clock.now_us();
        fire_publisher_ticks(node, now);
        fire_caller_ticks(node, now);
    }
}

// ============================================================================
// Queue & engine driving
// ============================================================================

fn check_engine_timeout(node: &mut Node, now: u64) {
    if node.engine.timed_out(now) {
        log::warn!("api call #{:?} timed out", node.engine.current_id());
        node.registered_tokens.remove(&RPC_CLIENT);
        node.handle_call_transport_failure(ErrorPack::new(ErrorKind::TransportTimeout));
    }
}

/// Feed the engine from the queue head; at most one call in flight.
fn pump_call_queue(node: &mut Node, now: u64) {
    while node.engine.is_idle() {
        match node.queue.peek() {
            Some(call) if call.retry_at_us <= now => {}
            _ => return,
        }
        let call = node.queue.dequeue().expect("peeked above");

        match node.engine.begin(call, now) {
            Ok(()) => return,
            Err(mut completion) => {
                // Immediate failure (resolve or socket create): retry with
                // backoff like any transport failure.
                completion.call.attempts += 1;
                if completion.call.attempts < crate::api::call::MAX_CALL_ATTEMPTS {
                    let backoff = 100_000u64
                        .saturating_mul(1 << completion.call.attempts.min(6))
                        .min(4_000_000);
                    completion.call.retry_at_us = now + backoff;
                    node.queue.requeue_front(completion.call);
                    return;
                }
                node.dispatch_completion(completion);
            }
        }
    }
}

fn drive_engine(node: &mut Node, readable: bool, writable: bool, now: u64) {
    if writable {
        if let Err(pack) = node.engine.handle_writable(now) {
            node.registered_tokens.remove(&RPC_CLIENT);
            node.handle_call_transport_failure(pack);
            return;
        }
    }
    if readable || node.engine.wants_read() {
        match node.engine.handle_readable(now) {
            Ok(Some(completion)) => {
                node.registered_tokens.remove(&RPC_CLIENT);
                node.dispatch_completion(completion);
            }
            Ok(None) => {}
            Err(pack) => {
                node.registered_tokens.remove(&RPC_CLIENT);
                if pack.contains(ErrorKind::ProtocolMalformed)
                    || pack.contains(ErrorKind::RpcServerRefused)
                {
                    // The server answered garbage; retrying won't help.
                    if let Some(completion) = node.engine.take_failed(pack) {
                        node.dispatch_completion(completion);
                    }
                } else {
                    node.handle_call_transport_failure(pack);
                }
            }
        }
    }
}

// ============================================================================
// Accept paths
// ============================================================================

fn accept_rpc_conns(node: &mut Node) {
    loop {
        match node.xmlrpc_listener.accept() {
            Ok((stream, remote)) => {
                log::debug!("negotiation connection from {}", remote);
                let token = node.alloc_token();
                match node.rpc_conns.insert(RpcConn::new(stream, token)) {
                    Some(conn_ref) => {
                        node.token_map.insert(token, TokenTarget::RpcConn(conn_ref));
                    }
                    None => {
                        log::warn!("negotiation table full, dropping {}", remote);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                log::warn!("negotiation accept failed: {}", e);
                return;
            }
        }
    }
}

fn accept_data_peers(node: &mut Node, now: u64) {
    loop {
        match node.tcpros_listener.accept() {
            Ok((stream, remote)) => {
                log::debug!("data connection from {}", remote);
                // Role is provisional until the header names topic/service.
                let channel =
                    crate::tcpros::PeerChannel::accepted(ChannelRole::PublisherData, stream, now);
                if node.add_peer(channel, PeerOwner::Unbound).is_none() {
                    log::warn!("peer table full, dropping {}", remote);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                log::warn!("data accept failed: {}", e);
                return;
            }
        }
    }
}

// ============================================================================
// Peer driving
// ============================================================================

fn peer_readable(node: &mut Node, peer_ref: SlotRef, now: u64) {
    let events = match node.peers.get_mut(peer_ref) {
        Some(peer) => peer.channel.handle_readable(now),
        None => return,
    };
    match events {
        Ok(events) => {
            for event in events {
                process_peer_event(node, peer_ref, event, now);
            }
        }
        Err(pack) => handle_peer_failure(node, peer_ref, pack, now),
    }
}

fn peer_writable(node: &mut Node, peer_ref: SlotRef, now: u64) {
    let result = match node.peers.get_mut(peer_ref) {
        Some(peer) => peer.channel.handle_writable(now),
        None => return,
    };
    match result {
        Ok(()) => {
            // A rejection finishes by closing once its error header drained.
            let closed = node
                .peers
                .get(peer_ref)
                .map(|p| p.channel.is_closed())
                .unwrap_or(false);
            if closed {
                node.close_peer(peer_ref);
            }
        }
        Err(pack) => handle_peer_failure(node, peer_ref, pack, now),
    }
}

fn process_peer_event(node: &mut Node, peer_ref: SlotRef, event: ChannelEvent, now: u64) {
    match event {
        ChannelEvent::HeaderReceived(header) => peer_header_received(node, peer_ref, header, now),
        ChannelEvent::MessageReceived(payload) => peer_message_received(node, peer_ref, payload),
        ChannelEvent::ServiceResponse { ok, payload } => {
            caller_response_received(node, peer_ref, ok, payload, now)
        }
    }
}

fn peer_header_received(node: &mut Node, peer_ref: SlotRef, header: ConnectionHeader, now: u64) {
    let owner = match node.peers.get(peer_ref) {
        Some(peer) => peer.owner.clone(),
        None => return,
    };

    match owner {
        PeerOwner::Unbound => accept_inbound_header(node, peer_ref, header, now),

        PeerOwner::SubscriberLink { slot, uri } => {
            let Some(subscriber) = node.subscribers.get(slot) else {
                node.close_peer(peer_ref);
                return;
            };
            if !md5_compatible(header.md5sum(), &subscriber.md5) {
                log::warn!(
                    "md5 mismatch on {} from {}: got {:?}, want {}",
                    subscriber.topic,
                    uri,
                    header.md5sum(),
                    subscriber.md5
                );
                if let Some(sub) = node.subscribers.get_mut(slot) {
                    sub.links.retain(|l| l.uri != uri);
                }
                node.close_peer(peer_ref);
                node.surface_error(
                    Some(slot),
                    ErrorPack::new(ErrorKind::ProtocolMd5Mismatch),
                );
                return;
            }
            if let Some(peer) = node.peers.get_mut(peer_ref) {
                peer.channel.complete_handshake();
            }
            // The remote may have bundled data frames behind its header.
            drain_peer_inbuf(node, peer_ref, now);
        }

        PeerOwner::CallerLink { slot } => {
            let Some(caller) = node.callers.get(slot) else {
                node.close_peer(peer_ref);
                return;
            };
            if !md5_compatible(header.md5sum(), &caller.md5) {
                node.close_peer(peer_ref);
                if let Some(caller) = node.callers.get_mut(slot) {
                    caller.peer = None;
                    caller.pending_request = None;
                    (caller.callback)(CallerEvent::Failed(ErrorPack::new(
                        ErrorKind::ProtocolMd5Mismatch,
                    )));
                }
                return;
            }
            let pending = node
                .callers
                .get(slot)
                .and_then(|c| c.pending_request.clone());
            if let Some(peer) = node.peers.get_mut(peer_ref) {
                peer.channel.complete_handshake();
                if let Some(request) = pending {
                    peer.channel.queue_request(&request);
                }
            }
            drain_peer_inbuf(node, peer_ref, now);
        }

        PeerOwner::PublisherFan { .. } | PeerOwner::ProviderConn { .. } => {
            // Server-side channels exchange exactly one header.
            log::warn!("unexpected second header on peer {}", peer_ref);
            node.close_peer(peer_ref);
        }
    }
}

/// Re-parse whatever the inbound buffer already holds (bytes that arrived
/// bundled with a header must not wait for the next readiness edge).
fn drain_peer_inbuf(node: &mut Node, peer_ref: SlotRef, now: u64) {
    let events = match node.peers.get_mut(peer_ref) {
        Some(peer) => peer.channel.advance(),
        None => return,
    };
    match events {
        Ok(events) => {
            for event in events {
                process_peer_event(node, peer_ref, event, now);
            }
        }
        Err(pack) => handle_peer_failure(node, peer_ref, pack, now),
    }
}

/// Classify an accepted connection by its header and answer it.
fn accept_inbound_header(node: &mut Node, peer_ref: SlotRef, header: ConnectionHeader, now: u64) {
    if let Some(topic) = header.topic() {
        let found = node
            .publishers
            .iter()
            .find(|(_, p)| p.topic == topic)
            .map(|(slot, _)| slot);
        let Some(slot) = found else {
            reject_peer(node, peer_ref, "topic not published here");
            return;
        };
        let publisher = node.publishers.get(slot).expect("just found");
        if !md5_compatible(header.md5sum(), &publisher.md5) {
            log::warn!(
                "subscriber {} has stale hash for {}",
                header.caller_id().unwrap_or("?"),
                topic
            );
            reject_peer(node, peer_ref, "md5sum mismatch");
            node.surface_error(Some(slot), ErrorPack::new(ErrorKind::ProtocolMd5Mismatch));
            return;
        }

        let reply = ConnectionHeader::for_publication(
            &publisher.type_name,
            &publisher.md5,
            &node.config.name,
            publisher.latching,
        );
        let latched = publisher.last_payload.clone();
        let queue_size = publisher.queue_size;

        if let Some(peer) = node.peers.get_mut(peer_ref) {
            peer.channel.set_role(ChannelRole::PublisherData);
            peer.owner = PeerOwner::PublisherFan { slot };
            peer.channel.accept_with(reply);
            if let Some(payload) = latched {
                peer.channel.queue_data_frame(&payload, queue_size);
            }
        }
        if let Some(publisher) = node.publishers.get_mut(slot) {
            publisher.peers.push(peer_ref);
            log::info!(
                "subscriber {} connected to {}",
                header.caller_id().unwrap_or("?"),
                publisher.topic
            );
        }
        return;
    }

    if let Some(service) = header.service() {
        let found = node
            .providers
            .iter()
            .find(|(_, p)| p.service == service)
            .map(|(slot, _)| slot);
        let Some(slot) = found else {
            reject_peer(node, peer_ref, "service not provided here");
            return;
        };
        let provider = node.providers.get(slot).expect("just found");
        if !md5_compatible(header.md5sum(), &provider.md5) {
            reject_peer(node, peer_ref, "md5sum mismatch");
            node.surface_error(Some(slot), ErrorPack::new(ErrorKind::ProtocolMd5Mismatch));
            return;
        }

        let reply = ConnectionHeader::for_service_provision(
            &provider.type_name,
            &provider.md5,
            &node.config.name,
        );
        if let Some(peer) = node.peers.get_mut(peer_ref) {
            peer.channel.set_role(ChannelRole::ServiceProvider);
            peer.owner = PeerOwner::ProviderConn { slot };
            peer.channel.accept_with(reply);
        }
        // Callers may pipeline the first request behind their header.
        drain_peer_inbuf(node, peer_ref, now);
        return;
    }

    reject_peer(node, peer_ref, "header names neither topic nor service");
}

fn reject_peer(node: &mut Node, peer_ref: SlotRef, reason: &str) {
    log::warn!("rejecting peer {}: {}", peer_ref, reason);
    if let Some(peer) = node.peers.get_mut(peer_ref) {
        peer.channel.reject_with(ConnectionHeader::for_error(reason));
    }
}

fn peer_message_received(node: &mut Node, peer_ref: SlotRef, payload: Vec<u8>) {
    let owner = match node.peers.get(peer_ref) {
        Some(peer) => peer.owner.clone(),
        None => return,
    };

    match owner {
        PeerOwner::SubscriberLink { slot, .. } => {
            let Some(subscriber) = node.subscribers.get_mut(slot) else {
                node.close_peer(peer_ref);
                return;
            };
            let schema = subscriber.schema.clone();
            match codec::decode_message(&schema, &payload) {
                Ok(msg) => (subscriber.callback)(&msg),
                Err(pack) => {
                    log::warn!("undecodable message on {}: {}", subscriber.topic, pack);
                    node.close_peer(peer_ref);
                    node.surface_error(Some(slot), pack);
                }
            }
        }

        PeerOwner::ProviderConn { slot } => {
            let Some(provider) = node.providers.get_mut(slot) else {
                node.close_peer(peer_ref);
                return;
            };
            let request_schema = provider.request_schema.clone();
            let response_schema = provider.response_schema.clone();

            let (ok, response_bytes) = match codec::decode_message(&request_schema, &payload) {
                Ok(request) => {
                    let mut response = Message::from_schema(response_schema);
                    let ok = (provider.handler)(&request, &mut response);
                    match codec::message_to_bytes(&response) {
                        Ok(bytes) => (ok, bytes),
                        Err(pack) => {
                            log::error!("response serialization failed: {}", pack);
                            (false, Vec::new())
                        }
                    }
                }
                Err(pack) => {
                    log::warn!("undecodable request on {}: {}", provider.service, pack);
                    (false, Vec::new())
                }
            };
            if let Some(peer) = node.peers.get_mut(peer_ref) {
                peer.channel.queue_service_response(ok, &response_bytes);
            }
        }

        _ => {
            log::warn!("unexpected data frame on peer {}", peer_ref);
            node.close_peer(peer_ref);
        }
    }
}

fn caller_response_received(
    node: &mut Node,
    peer_ref: SlotRef,
    ok: bool,
    payload: Vec<u8>,
    _now: u64,
) {
    let owner = match node.peers.get(peer_ref) {
        Some(peer) => peer.owner.clone(),
        None => return,
    };
    let PeerOwner::CallerLink { slot } = owner else {
        node.close_peer(peer_ref);
        return;
    };

    let Some(caller) = node.callers.get_mut(slot) else {
        node.close_peer(peer_ref);
        return;
    };
    caller.pending_request = None;
    let persistent = caller.persistent;

    if ok {
        let schema = caller.response_schema.clone();
        match codec::decode_message(&schema, &payload) {
            Ok(response) => (caller.callback)(CallerEvent::Response(&response)),
            Err(pack) => (caller.callback)(CallerEvent::Failed(pack)),
        }
    } else {
        (caller.callback)(CallerEvent::Failed(ErrorPack::new(
            ErrorKind::RpcMethodFailed,
        )));
    }

    if !persistent {
        if let Some(caller) = node.callers.get_mut(slot) {
            caller.peer = None;
        }
        node.close_peer(peer_ref);
    }
}

fn handle_peer_failure(node: &mut Node, peer_ref: SlotRef, pack: ErrorPack, now: u64) {
    let owner = match node.peers.get(peer_ref) {
        Some(peer) => peer.owner.clone(),
        None => return,
    };

    // Protocol-level failures (hash mismatch, malformed framing) will not
    // heal on reconnect; tear the link down and surface them directly.
    let protocol_fatal = pack.contains(ErrorKind::ProtocolMd5Mismatch)
        || pack.contains(ErrorKind::ProtocolMalformed);

    match owner {
        PeerOwner::SubscriberLink { slot, uri } => {
            let attempts = node
                .peers
                .get(peer_ref)
                .map(|p| p.channel.reconnect_attempts())
                .unwrap_or(0);
            if protocol_fatal || attempts >= node.peer_retry_cap() {
                log::warn!("giving up on publisher {} ({} after {} attempts)", uri, pack, attempts);
                if let Some(subscriber) = node.subscribers.get_mut(slot) {
                    subscriber.links.retain(|l| l.uri != uri);
                }
                node.close_peer(peer_ref);
                node.surface_error(Some(slot), pack);
            } else {
                disconnect_peer_for_retry(node, peer_ref, now);
            }
        }

        PeerOwner::CallerLink { slot } => {
            let (mid_request, retry) = node
                .callers
                .get(slot)
                .map(|c| (c.pending_request.is_some(), c.retry_on_disconnect))
                .unwrap_or((false, false));
            if mid_request && retry && !protocol_fatal {
                disconnect_peer_for_retry(node, peer_ref, now);
            } else {
                node.close_peer(peer_ref);
                if let Some(caller) = node.callers.get_mut(slot) {
                    caller.peer = None;
                    if mid_request {
                        caller.pending_request = None;
                        (caller.callback)(CallerEvent::Failed(pack));
                    }
                }
            }
        }

        PeerOwner::PublisherFan { slot } => {
            if let Some(publisher) = node.publishers.get_mut(slot) {
                publisher.peers.retain(|&p| p != peer_ref);
                log::debug!("subscriber left {}", publisher.topic);
            }
            node.close_peer(peer_ref);
        }

        PeerOwner::ProviderConn { .. } | PeerOwner::Unbound => {
            node.close_peer(peer_ref);
        }
    }
}

/// Keep the peer slot but drop the socket; the connect scheduler retries
/// after backoff.
fn disconnect_peer_for_retry(node: &mut Node, peer_ref: SlotRef, now: u64) {
    let Some(peer) = node.peers.get_mut(peer_ref) else {
        return;
    };
    if let Some(stream) = peer.channel.stream() {
        let _ = node.poll.registry().deregister(stream);
    }
    node.registered_tokens.remove(&peer.token);
    peer.channel.mark_disconnected(now);
    log::debug!(
        "peer {} disconnected, retry after backoff ({} attempts)",
        peer_ref,
        peer.channel.reconnect_attempts()
    );
}

/// Start connects for idle client channels whose backoff has passed.
fn start_due_connects(node: &mut Node, now: u64) {
    let due: Vec<SlotRef> = node
        .peers
        .iter()
        .filter(|(_, p)| {
            p.channel.state() == ChannelState::Idle
                && !p.channel.role().is_server()
                && p.channel.backoff_until_us() <= now
        })
        .map(|(peer_ref, _)| peer_ref)
        .collect();

    for peer_ref in due {
        let result = match node.peers.get_mut(peer_ref) {
            Some(peer) => peer.channel.begin_connect(now),
            None => continue,
        };
        if let Err(pack) = result {
            log::debug!("connect start failed for {}: {}", peer_ref, pack);
            handle_peer_failure(node, peer_ref, pack, now);
        }
    }
}

/// Fail outstanding service calls whose deadline passed.
fn check_caller_timeouts(node: &mut Node, now: u64) {
    let expired: Vec<SlotRef> = node
        .callers
        .iter()
        .filter(|(_, c)| c.pending_request.is_some() && now >= c.call_deadline_us)
        .map(|(slot, _)| slot)
        .collect();

    for slot in expired {
        let peer_ref = node.callers.get(slot).and_then(|c| c.peer);
        if let Some(peer_ref) = peer_ref {
            // A late response on this socket would desynchronize the
            // request/response alternation; drop the channel.
            node.close_peer(peer_ref);
        }
        if let Some(caller) = node.callers.get_mut(slot) {
            log::warn!("service call on {} timed out", caller.service);
            caller.pending_request = None;
            caller.peer = None;
            caller.lookup_pending = false;
            (caller.callback)(CallerEvent::Failed(ErrorPack::new(
                ErrorKind::TransportTimeout,
            )));
        }
    }
}

/// Fail peers stuck in the handshake beyond the idle timeout.
fn check_handshake_timeouts(node: &mut Node, now: u64) {
    let idle_timeout = node.config.peer_idle_timeout.as_micros() as u64;
    let stuck: Vec<SlotRef> = node
        .peers
        .iter()
        .filter(|(_, p)| {
            matches!(
                p.channel.state(),
                ChannelState::Connecting
                    | ChannelState::WritingHeader
                    | ChannelState::ReadingHeader
                    | ChannelState::Accepted
            ) && now.saturating_sub(p.channel.last_activity_us()) > idle_timeout
        })
        .map(|(peer_ref, _)| peer_ref)
        .collect();

    for peer_ref in stuck {
        log::warn!("peer {} handshake timed out", peer_ref);
        handle_peer_failure(
            node,
            peer_ref,
            ErrorPack::new(ErrorKind::TransportTimeout),
            now,
        );
    }
}

// ============================================================================
// Negotiation connections
// ============================================================================

fn rpc_conn_readable(node: &mut Node, conn_ref: SlotRef) {
    let Some(conn) = node.rpc_conns.get_mut(conn_ref) else {
        return;
    };

    let mut chunk = [0u8; 8192];
    loop {
        match conn.stream.read(&mut chunk) {
            Ok(0) => {
                node.drop_rpc_conn(conn_ref, ErrorPack::OK);
                return;
            }
            Ok(n) => conn.inbuf.append(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => {
                node.drop_rpc_conn(conn_ref, ErrorPack::new(ErrorKind::TransportIo));
                return;
            }
        }
    }

    let body = match conn.parser.advance(&mut conn.inbuf) {
        Ok(ParseStatus::Done) => conn.parser.take_body().unwrap_or_default(),
        Ok(ParseStatus::Incomplete) => return,
        Err(pack) => {
            node.drop_rpc_conn(conn_ref, pack);
            return;
        }
    };

    let response = node.dispatch_rpc_request(&body);
    if let Some(conn) = node.rpc_conns.get_mut(conn_ref) {
        conn.outbuf.append(&response);
        conn.responding = true;
    }
    rpc_conn_writable(node, conn_ref);
}

fn rpc_conn_writable(node: &mut Node, conn_ref: SlotRef) {
    use std::io::Write;

    let Some(conn) = node.rpc_conns.get_mut(conn_ref) else {
        return;
    };

    while !conn.outbuf.is_empty() {
        match conn.stream.write(conn.outbuf.as_slice()) {
            Ok(0) => {
                node.drop_rpc_conn(conn_ref, ErrorPack::new(ErrorKind::TransportIo));
                return;
            }
            Ok(n) => conn.outbuf.consume(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => {
                node.drop_rpc_conn(conn_ref, ErrorPack::new(ErrorKind::TransportIo));
                return;
            }
        }
    }

    if conn.responding {
        node.drop_rpc_conn(conn_ref, ErrorPack::OK);
    }
}

// ============================================================================
// Registration sync & deadlines
// ============================================================================

/// Bring poll registrations in line with every socket's current interest.
fn sync_registrations(node: &mut Node) -> RosResult<()> {
    let registry = node.poll.registry();

    // RPC client socket.
    let engine_interest = interest_of(node.engine.wants_read(), node.engine.wants_write());
    if let Some(stream) = node.engine.stream() {
        if let Some(interest) = engine_interest {
            let result = if node.registered_tokens.contains(&RPC_CLIENT) {
                registry.reregister(stream, RPC_CLIENT, interest)
            } else {
                registry.register(stream, RPC_CLIENT, interest)
            };
            if result.is_ok() {
                node.registered_tokens.insert(RPC_CLIENT);
            }
        }
    } else {
        node.registered_tokens.remove(&RPC_CLIENT);
    }

    // Data peers.
    for (_, peer) in node.peers.iter_mut() {
        let token = peer.token;
        let wants_write = peer.channel.wants_write();
        if let Some(stream) = peer.channel.stream() {
            let interest = interest_of(true, wants_write).expect("read always wanted");
            let result = if node.registered_tokens.contains(&token) {
                registry.reregister(stream, token, interest)
            } else {
                registry.register(stream, token, interest)
            };
            if result.is_ok() {
                node.registered_tokens.insert(token);
            }
        } else {
            node.registered_tokens.remove(&token);
        }
    }

    // Negotiation connections.
    for (_, conn) in node.rpc_conns.iter_mut() {
        let token = conn.token;
        let interest = interest_of(true, !conn.outbuf.is_empty()).expect("read always wanted");
        let result = if node.registered_tokens.contains(&token) {
            registry.reregister(&mut conn.stream, token, interest)
        } else {
            registry.register(&mut conn.stream, token, interest)
        };
        if result.is_ok() {
            node.registered_tokens.insert(token);
        }
    }

    Ok(())
}

fn interest_of(read: bool, write: bool) -> Option<Interest> {
    match (read, write) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

/// The minimum of every pending deadline; `None` waits indefinitely.
fn compute_wake_deadline(node: &Node, overall: Option<u64>) -> Option<u64> {
    let mut wake = overall.and_then(|d| min_deadline(None, d));

    for (_, publisher) in node.publishers.iter() {
        wake = min_deadline(wake, publisher.schedule.next_fire_us());
    }
    for (_, caller) in node.callers.iter() {
        wake = min_deadline(wake, caller.schedule.next_fire_us());
        if caller.pending_request.is_some() {
            wake = min_deadline(wake, caller.call_deadline_us);
        }
    }
    if let Some(deadline) = node.engine.deadline_us() {
        wake = min_deadline(wake, deadline);
    }
    // Queue deadlines only matter when the engine can take the head call;
    // while one is in flight the engine deadline already bounds the wait.
    if node.engine.is_idle() {
        if let Some(head) = node.queue.peek() {
            wake = min_deadline(wake, head.retry_at_us.max(1));
        }
    }
    let idle_timeout = node.config.peer_idle_timeout.as_micros() as u64;
    for (_, peer) in node.peers.iter() {
        match peer.channel.state() {
            ChannelState::Idle if !peer.channel.role().is_server() => {
                wake = min_deadline(wake, peer.channel.backoff_until_us());
            }
            ChannelState::Connecting
            | ChannelState::WritingHeader
            | ChannelState::ReadingHeader
            | ChannelState::Accepted => {
                wake = min_deadline(
                    wake,
                    peer.channel.last_activity_us().saturating_add(idle_timeout),
                );
            }
            _ => {}
        }
    }
    wake
}

// ============================================================================
// Timers
// ============================================================================

fn fire_publisher_ticks(node: &mut Node, now: u64) {
    let due: Vec<SlotRef> = node
        .publishers
        .iter()
        .filter(|(_, p)| p.schedule.due(now))
        .map(|(slot, _)| slot)
        .collect();

    for slot in due {
        let Some(publisher) = node.publishers.get_mut(slot) else {
            continue;
        };
        publisher.schedule.advance(now);
        let schema = publisher.schema.clone();
        let mut msg = Message::from_schema(schema);
        if let Some(fill) = publisher.fill.as_mut() {
            fill(&mut msg);
        }
        if let Err(pack) = node.publish(slot, &msg) {
            node.surface_error(Some(slot), pack);
        }
    }
}

fn fire_caller_ticks(node: &mut Node, now: u64) {
    let due: Vec<SlotRef> = node
        .callers
        .iter()
        .filter(|(_, c)| c.schedule.due(now))
        .map(|(slot, _)| slot)
        .collect();

    for slot in due {
        let Some(caller) = node.callers.get_mut(slot) else {
            continue;
        };
        caller.schedule.advance(now);
        if caller.pending_request.is_some() {
            // Previous call still outstanding; skip this tick.
            continue;
        }
        let schema = caller.request_schema.clone();
        let mut request = Message::from_schema(schema);
        (caller.callback)(CallerEvent::FillRequest(&mut request));
        if let Err(pack) = node.call_service(slot, &request) {
            node.surface_error(Some(slot), pack);
        }
    }
}

/// Md5 fields match when equal or when either side sends the `*` wildcard.
fn md5_compatible(remote: Option<&str>, local: &str) -> bool {
    match remote {
        Some("*") => true,
        Some(remote) => remote == local,
        None => false,
    }
}

// ============================================================================
// Tests
// ============================================================================
