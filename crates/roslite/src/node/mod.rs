// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The node: registries, peer tables, the call queue, and the event loop.
//!
//! A [`Node`] owns every socket and every state machine of one process's
//! participation: the two listeners (negotiation XML-RPC and framed data),
//! the single-in-flight RPC client, the four registries, and the peer
//! channels. All of it is driven by [`Node::run`] on the calling thread;
//! nothing here is shared across threads, and the only cross-thread
//! interaction is the caller-owned exit flag.
//!
//! - [`slots`] - slot types and user callback signatures
//! - [`slave`] - the inbound negotiation RPC surface
//! - [`event_loop`] - the poll loop

pub mod event_loop;
pub mod slave;
pub mod slots;

#[cfg(test)]
pub(crate) mod testutil;

use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, TcpStream as StdTcpStream, ToSocketAddrs};
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::{Interest, Poll, Token};

use crate::api::call::{parse_http_uri, ApiCall, ApiCallQueue, MAX_CALL_ATTEMPTS};
use crate::api::{ApiMethod, CallCompletion, CallId, CallResult, RpcClientEngine};
use crate::arena::{SlotRef, SlotVec};
use crate::clock::{PeriodicSchedule, RosClock};
use crate::config::NodeConfig;
use crate::error::{ErrorKind, ErrorPack, RosResult};
use crate::msg::{codec, Message, MsgRegistry, SchemaSource};
use crate::tcpros::{ChannelRole, ConnectionHeader, PeerChannel};
use crate::xmlrpc::XmlRpcValue;

use slave::RpcConn;
use slots::{
    CallerCallback, CallerOptions, CallerSlot, ProviderSlot, PublisherLink, PublisherOptions,
    PublisherSlot, ServiceHandler, SubscriberCallback, SubscriberSlot,
};

/// Fixed poll token of the negotiation listener.
pub(crate) const XMLRPC_LISTENER: Token = Token(0);

/// Fixed poll token of the data listener.
pub(crate) const TCPROS_LISTENER: Token = Token(1);

/// Fixed poll token of the RPC client socket.
pub(crate) const RPC_CLIENT: Token = Token(2);

/// First dynamically allocated token.
const TOKEN_START: usize = 3;

/// Reconnect attempts before a subscriber link is abandoned.
const PEER_RETRY_CAP: u32 = 30;

/// What a dynamic token points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenTarget {
    Peer(SlotRef),
    RpcConn(SlotRef),
}

/// What a data peer is attached to.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PeerOwner {
    /// Accepted socket whose header has not arrived yet.
    Unbound,
    /// Subscriber-side channel to one discovered publisher.
    SubscriberLink { slot: SlotRef, uri: String },
    /// Publisher-side channel fanning out to one subscriber.
    PublisherFan { slot: SlotRef },
    /// Provider-side channel serving one caller.
    ProviderConn { slot: SlotRef },
    /// Caller-side channel to one provider.
    CallerLink { slot: SlotRef },
}

/// A data peer: the channel plus its attachment.
pub(crate) struct PeerSlot {
    pub channel: PeerChannel,
    pub owner: PeerOwner,
    pub token: Token,
}

/// Node-level error surface: slot (when attributable) plus the packed error.
pub type ErrorHandler = Box<dyn FnMut(Option<SlotRef>, ErrorPack)>;

/// One process's participation in the graph.
pub struct Node {
    pub(crate) config: NodeConfig,
    pub(crate) clock: RosClock,
    pub(crate) schemas: Box<dyn SchemaSource>,

    pub(crate) publishers: SlotVec<PublisherSlot>,
    pub(crate) subscribers: SlotVec<SubscriberSlot>,
    pub(crate) providers: SlotVec<ProviderSlot>,
    pub(crate) callers: SlotVec<CallerSlot>,

    pub(crate) peers: SlotVec<PeerSlot>,
    pub(crate) rpc_conns: SlotVec<RpcConn>,

    pub(crate) queue: ApiCallQueue,
    pub(crate) engine: RpcClientEngine,
    next_call_id: CallId,

    pub(crate) poll: Poll,
    pub(crate) xmlrpc_listener: TcpListener,
    pub(crate) tcpros_listener: TcpListener,
    xmlrpc_port: u16,
    tcpros_port: u16,

    pub(crate) token_map: HashMap<Token, TokenTarget>,
    pub(crate) registered_tokens: HashSet<Token>,
    next_token: usize,

    /// Set by the slave `shutdown` method; checked like the exit flag.
    pub(crate) shutdown_requested: bool,

    pub(crate) on_error: Option<ErrorHandler>,
}

impl Node {
    /// Create a node: validate the config and bind both listeners.
    pub fn new(config: NodeConfig) -> RosResult<Self> {
        config.validate()?;
        let schemas = Box::new(MsgRegistry::new(config.msg_db_root.clone()));
        Self::with_schema_source(config, schemas)
    }

    /// Create a node over a custom schema source.
    pub fn with_schema_source(
        config: NodeConfig,
        schemas: Box<dyn SchemaSource>,
    ) -> RosResult<Self> {
        config.validate()?;

        let poll = Poll::new().map_err(|_| ErrorPack::new(ErrorKind::TransportIo))?;

        let (mut xmlrpc_listener, xmlrpc_port) = bind_listener(config.xmlrpc_port)?;
        let (mut tcpros_listener, tcpros_port) = bind_listener(config.tcpros_port)?;

        poll.registry()
            .register(&mut xmlrpc_listener, XMLRPC_LISTENER, Interest::READABLE)
            .map_err(|_| ErrorPack::new(ErrorKind::TransportIo))?;
        poll.registry()
            .register(&mut tcpros_listener, TCPROS_LISTENER, Interest::READABLE)
            .map_err(|_| ErrorPack::new(ErrorKind::TransportIo))?;

        log::info!(
            "node {} up: xmlrpc={}:{} tcpros={}:{} master={}",
            config.name,
            config.host,
            xmlrpc_port,
            config.host,
            tcpros_port,
            config.master_uri()
        );

        let call_timeout_us = config.call_timeout.as_micros() as u64;
        Ok(Self {
            publishers: SlotVec::new(config.max_publishers),
            subscribers: SlotVec::new(config.max_subscribers),
            providers: SlotVec::new(config.max_providers),
            callers: SlotVec::new(config.max_callers),
            peers: SlotVec::new(config.max_peers),
            rpc_conns: SlotVec::new(config.max_peers),
            queue: ApiCallQueue::new(),
            engine: RpcClientEngine::new(call_timeout_us),
            next_call_id: 1,
            poll,
            xmlrpc_listener,
            tcpros_listener,
            xmlrpc_port,
            tcpros_port,
            token_map: HashMap::new(),
            registered_tokens: HashSet::new(),
            next_token: TOKEN_START,
            shutdown_requested: false,
            on_error: None,
            clock: RosClock::new(),
            schemas,
            config,
        })
    }

    /// The node name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Bound negotiation port.
    pub fn xmlrpc_port(&self) -> u16 {
        self.xmlrpc_port
    }

    /// Bound data port.
    pub fn tcpros_port(&self) -> u16 {
        self.tcpros_port
    }

    /// This node's negotiation URI as advertised to the master.
    pub fn xmlrpc_uri(&self) -> String {
        format!("http://{}:{}/", self.config.host, self.xmlrpc_port)
    }

    /// This node's service URI as advertised to the master.
    pub fn service_uri(&self) -> String {
        format!("rosrpc://{}:{}", self.config.host, self.tcpros_port)
    }

    /// Install the error surface for master-call and peer failures.
    pub fn set_error_handler(&mut self, handler: ErrorHandler) {
        self.on_error = Some(handler);
    }

    pub(crate) fn surface_error(&mut self, slot: Option<SlotRef>, pack: ErrorPack) {
        log::warn!("error on slot {:?}: {}", slot, pack);
        if let Some(handler) = self.on_error.as_mut() {
            handler(slot, pack);
        }
    }

    // ========================================================================
    // Registration API
    // ========================================================================

    /// Advertise a topic; enqueues the master registration.
    pub fn advertise(
        &mut self,
        topic: &str,
        type_name: &str,
        options: PublisherOptions,
    ) -> RosResult<SlotRef> {
        check_graph_name(topic)?;
        let schema = self.schemas.message(type_name)?;
        let now = self.clock.now_us();

        let slot = self
            .publishers
            .insert(PublisherSlot {
                topic: topic.to_string(),
                type_name: type_name.to_string(),
                md5: schema.md5().to_string(),
                schema,
                latching: options.latching,
                queue_size: options.queue_size.max(1),
                fill: options.fill,
                schedule: PeriodicSchedule::new(options.period_us, now),
                registered: false,
                unregister_pending: false,
                peers: Vec::new(),
                last_payload: None,
                last_publish_us: 0,
            })
            .ok_or_else(|| ErrorPack::new(ErrorKind::SlotExhausted))?;

        let params = vec![
            XmlRpcValue::from(self.config.name.as_str()),
            XmlRpcValue::from(topic),
            XmlRpcValue::from(type_name),
            XmlRpcValue::from(self.xmlrpc_uri()),
        ];
        self.enqueue_master_call(ApiMethod::RegisterPublisher, params, Some(slot), None);
        Ok(slot)
    }

    /// Subscribe to a topic; enqueues the master registration.
    pub fn subscribe(
        &mut self,
        topic: &str,
        type_name: &str,
        callback: SubscriberCallback,
    ) -> RosResult<SlotRef> {
        check_graph_name(topic)?;
        let schema = self.schemas.message(type_name)?;

        let slot = self
            .subscribers
            .insert(SubscriberSlot {
                topic: topic.to_string(),
                type_name: type_name.to_string(),
                md5: schema.md5().to_string(),
                schema,
                callback,
                registered: false,
                unregister_pending: false,
                links: Vec::new(),
            })
            .ok_or_else(|| ErrorPack::new(ErrorKind::SlotExhausted))?;

        let params = vec![
            XmlRpcValue::from(self.config.name.as_str()),
            XmlRpcValue::from(topic),
            XmlRpcValue::from(type_name),
            XmlRpcValue::from(self.xmlrpc_uri()),
        ];
        self.enqueue_master_call(ApiMethod::RegisterSubscriber, params, Some(slot), None);
        Ok(slot)
    }

    /// Provide a service; enqueues the master registration.
    pub fn advertise_service(
        &mut self,
        service: &str,
        type_name: &str,
        handler: ServiceHandler,
    ) -> RosResult<SlotRef> {
        check_graph_name(service)?;
        let schema = self.schemas.service(type_name)?;

        let slot = self
            .providers
            .insert(ProviderSlot {
                service: service.to_string(),
                type_name: type_name.to_string(),
                md5: schema.md5.clone(),
                request_schema: schema.request,
                response_schema: schema.response,
                handler,
                registered: false,
                unregister_pending: false,
            })
            .ok_or_else(|| ErrorPack::new(ErrorKind::SlotExhausted))?;

        let params = vec![
            XmlRpcValue::from(self.config.name.as_str()),
            XmlRpcValue::from(service),
            XmlRpcValue::from(self.service_uri()),
            XmlRpcValue::from(self.xmlrpc_uri()),
        ];
        self.enqueue_master_call(ApiMethod::RegisterService, params, Some(slot), None);
        Ok(slot)
    }

    /// Create a caller endpoint for a service.
    pub fn service_caller(
        &mut self,
        service: &str,
        type_name: &str,
        options: CallerOptions,
        callback: CallerCallback,
    ) -> RosResult<SlotRef> {
        check_graph_name(service)?;
        let schema = self.schemas.service(type_name)?;
        let now = self.clock.now_us();

        self.callers
            .insert(CallerSlot {
                service: service.to_string(),
                type_name: type_name.to_string(),
                md5: schema.md5.clone(),
                request_schema: schema.request,
                response_schema: schema.response,
                callback,
                persistent: options.persistent,
                retry_on_disconnect: options.retry_on_disconnect,
                schedule: PeriodicSchedule::new(options.period_us, now),
                peer: None,
                pending_request: None,
                call_deadline_us: 0,
                lookup_pending: false,
            })
            .ok_or_else(|| ErrorPack::new(ErrorKind::SlotExhausted))
    }

    /// Clone a publisher slot's message template.
    pub fn create_message(&mut self, slot: SlotRef) -> RosResult<Message> {
        let publisher = self
            .publishers
            .get(slot)
            .ok_or_else(|| ErrorPack::new(ErrorKind::BadArgument))?;
        Ok(Message::from_schema(publisher.schema.clone()))
    }

    /// Clone a caller slot's request template.
    pub fn create_request(&mut self, slot: SlotRef) -> RosResult<Message> {
        let caller = self
            .callers
            .get(slot)
            .ok_or_else(|| ErrorPack::new(ErrorKind::BadArgument))?;
        Ok(Message::from_schema(caller.request_schema.clone()))
    }

    // ========================================================================
    // Data operations
    // ========================================================================

    /// Serialize `msg` and queue it on every connected subscriber channel.
    ///
    /// Channels over their high-water mark skip this message (the bounded
    /// frame queue already dropped the oldest); that is not an error here.
    pub fn publish(&mut self, slot: SlotRef, msg: &Message) -> RosResult<()> {
        let now = self.clock.now_us();
        let publisher = self
            .publishers
            .get(slot)
            .ok_or_else(|| ErrorPack::new(ErrorKind::BadArgument))?;
        if msg.schema().md5() != publisher.md5 {
            return Err(ErrorPack::new(ErrorKind::BadArgument));
        }

        let payload = codec::message_to_bytes(msg)?;
        let queue_size = publisher.queue_size;
        let peer_refs: Vec<SlotRef> = publisher.peers.clone();

        for peer_ref in peer_refs {
            if let Some(peer) = self.peers.get_mut(peer_ref) {
                peer.channel.queue_data_frame(&payload, queue_size);
            }
        }

        let publisher = self
            .publishers
            .get_mut(slot)
            .ok_or_else(|| ErrorPack::new(ErrorKind::InternalInvariant))?;
        if publisher.latching {
            publisher.last_payload = Some(payload);
        }
        publisher.last_publish_us = now;
        Ok(())
    }

    /// Start a service call: resolve the provider (unless a persistent
    /// channel is already open) and send the request. The response arrives
    /// through the caller callback.
    pub fn call_service(&mut self, slot: SlotRef, request: &Message) -> RosResult<()> {
        let now = self.clock.now_us();
        let deadline = now + self.config.call_timeout.as_micros() as u64;
        let caller = self
            .callers
            .get(slot)
            .ok_or_else(|| ErrorPack::new(ErrorKind::BadArgument))?;
        if request.schema().md5() != caller.request_schema.md5() {
            return Err(ErrorPack::new(ErrorKind::BadArgument));
        }
        if caller.pending_request.is_some() {
            return Err(ErrorPack::new(ErrorKind::RegistrationConflict));
        }

        let payload = codec::message_to_bytes(request)?;
        let service = caller.service.clone();
        let peer_ref = caller.peer;
        let lookup_pending = caller.lookup_pending;

        // Re-use an open persistent channel when the handshake is done.
        if let Some(peer_ref) = peer_ref {
            if let Some(peer) = self.peers.get_mut(peer_ref) {
                if peer.channel.state() == crate::tcpros::ChannelState::WritingPayload {
                    peer.channel.queue_request(&payload);
                    let caller = self.callers.get_mut(slot).unwrap();
                    caller.pending_request = Some(payload);
                    caller.call_deadline_us = deadline;
                    return Ok(());
                }
            }
        }

        let caller = self
            .callers
            .get_mut(slot)
            .ok_or_else(|| ErrorPack::new(ErrorKind::InternalInvariant))?;
        caller.pending_request = Some(payload);
        caller.call_deadline_us = deadline;

        if !lookup_pending {
            let params = vec![
                XmlRpcValue::from(self.config.name.as_str()),
                XmlRpcValue::from(service.as_str()),
            ];
            self.enqueue_master_call(ApiMethod::LookupService, params, Some(slot), None);
            let caller = self.callers.get_mut(slot).unwrap();
            caller.lookup_pending = true;
        }
        Ok(())
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Stop advertising; the slot is freed once the master confirms.
    pub fn unadvertise(&mut self, slot: SlotRef) -> RosResult<()> {
        let publisher = self
            .publishers
            .get_mut(slot)
            .ok_or_else(|| ErrorPack::new(ErrorKind::BadArgument))?;
        if publisher.unregister_pending {
            return Err(ErrorPack::new(ErrorKind::RegistrationConflict));
        }
        publisher.unregister_pending = true;
        let topic = publisher.topic.clone();
        let peer_refs = std::mem::take(&mut publisher.peers);
        for peer_ref in peer_refs {
            self.close_peer(peer_ref);
        }

        let params = vec![
            XmlRpcValue::from(self.config.name.as_str()),
            XmlRpcValue::from(topic.as_str()),
            XmlRpcValue::from(self.xmlrpc_uri()),
        ];
        self.enqueue_master_call(ApiMethod::UnregisterPublisher, params, Some(slot), None);
        Ok(())
    }

    /// Drop a subscription; the slot is freed once the master confirms.
    pub fn unsubscribe(&mut self, slot: SlotRef) -> RosResult<()> {
        let subscriber = self
            .subscribers
            .get_mut(slot)
            .ok_or_else(|| ErrorPack::new(ErrorKind::BadArgument))?;
        if subscriber.unregister_pending {
            return Err(ErrorPack::new(ErrorKind::RegistrationConflict));
        }
        subscriber.unregister_pending = true;
        let topic = subscriber.topic.clone();
        let peer_refs: Vec<SlotRef> = subscriber.links.iter().filter_map(|l| l.peer).collect();
        subscriber.links.clear();
        for peer_ref in peer_refs {
            self.close_peer(peer_ref);
        }

        let params = vec![
            XmlRpcValue::from(self.config.name.as_str()),
            XmlRpcValue::from(topic.as_str()),
            XmlRpcValue::from(self.xmlrpc_uri()),
        ];
        self.enqueue_master_call(ApiMethod::UnregisterSubscriber, params, Some(slot), None);
        Ok(())
    }

    /// Withdraw a service; the slot is freed once the master confirms.
    pub fn unadvertise_service(&mut self, slot: SlotRef) -> RosResult<()> {
        let provider = self
            .providers
            .get_mut(slot)
            .ok_or_else(|| ErrorPack::new(ErrorKind::BadArgument))?;
        if provider.unregister_pending {
            return Err(ErrorPack::new(ErrorKind::RegistrationConflict));
        }
        provider.unregister_pending = true;
        let service = provider.service.clone();

        let params = vec![
            XmlRpcValue::from(self.config.name.as_str()),
            XmlRpcValue::from(service.as_str()),
            XmlRpcValue::from(self.service_uri()),
        ];
        self.enqueue_master_call(ApiMethod::UnregisterService, params, Some(slot), None);
        Ok(())
    }

    /// Free a caller slot (no master state to undo).
    pub fn release_caller(&mut self, slot: SlotRef) -> RosResult<()> {
        let caller = self
            .callers
            .remove(slot)
            .ok_or_else(|| ErrorPack::new(ErrorKind::BadArgument))?;
        if let Some(peer_ref) = caller.peer {
            self.close_peer(peer_ref);
        }
        Ok(())
    }

    /// Unregister everything and drain the queue, bounded by `deadline`.
    ///
    /// Every registered slot gets its unregister call onto the wire before
    /// this returns success.
    pub fn shutdown(&mut self, deadline: Duration) -> RosResult<()> {
        for slot in self.publishers.refs() {
            let pending = self
                .publishers
                .get(slot)
                .map(|p| p.unregister_pending)
                .unwrap_or(true);
            if !pending {
                let _ = self.unadvertise(slot);
            }
        }
        for slot in self.subscribers.refs() {
            let pending = self
                .subscribers
                .get(slot)
                .map(|s| s.unregister_pending)
                .unwrap_or(true);
            if !pending {
                let _ = self.unsubscribe(slot);
            }
        }
        for slot in self.providers.refs() {
            let pending = self
                .providers
                .get(slot)
                .map(|p| p.unregister_pending)
                .unwrap_or(true);
            if !pending {
                let _ = self.unadvertise_service(slot);
            }
        }
        for slot in self.callers.refs() {
            let _ = self.release_caller(slot);
        }

        // Drive the loop until the unregister calls drain.
        let started = Instant::now();
        let exit = AtomicBool::new(false);
        while !(self.queue.is_empty() && self.engine.is_idle()) {
            if started.elapsed() >= deadline {
                log::warn!("shutdown drain timed out with {} calls queued", self.queue.len());
                self.queue.release();
                self.engine.abort();
                return Err(ErrorPack::new(ErrorKind::TransportTimeout));
            }
            event_loop::run(self, Some(Duration::from_millis(50)), &exit)?;
        }

        for peer_ref in self.peers.refs() {
            self.close_peer(peer_ref);
        }
        log::info!("node {} shut down", self.config.name);
        Ok(())
    }

    /// Run the event loop until `exit` is set or `timeout` elapses.
    pub fn run(&mut self, timeout: Option<Duration>, exit: &AtomicBool) -> RosResult<()> {
        event_loop::run(self, timeout, exit)
    }

    // ========================================================================
    // Internals shared with the loop and the slave surface
    // ========================================================================

    pub(crate) fn next_call_id(&mut self) -> CallId {
        let id = self.next_call_id;
        self.next_call_id += 1;
        id
    }

    /// Queue a call to the master.
    pub(crate) fn enqueue_master_call(
        &mut self,
        method: ApiMethod,
        params: Vec<XmlRpcValue>,
        slot: Option<SlotRef>,
        context: Option<String>,
    ) {
        let id = self.next_call_id();
        let mut call = ApiCall::new(
            id,
            method,
            params,
            self.config.master_host.clone(),
            self.config.master_port,
        );
        call.slot = slot;
        call.context = context;
        self.queue.enqueue(call);
    }

    /// Queue a call to a peer's negotiation endpoint.
    pub(crate) fn enqueue_peer_call(
        &mut self,
        method: ApiMethod,
        params: Vec<XmlRpcValue>,
        host: String,
        port: u16,
        slot: Option<SlotRef>,
        context: Option<String>,
    ) {
        let id = self.next_call_id();
        let mut call = ApiCall::new(id, method, params, host, port);
        call.slot = slot;
        call.context = context;
        self.queue.enqueue(call);
    }

    pub(crate) fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Insert a data peer and map its token.
    pub(crate) fn add_peer(&mut self, channel: PeerChannel, owner: PeerOwner) -> Option<SlotRef> {
        let token = self.alloc_token();
        let peer_ref = self.peers.insert(PeerSlot {
            channel,
            owner,
            token,
        })?;
        self.token_map.insert(token, TokenTarget::Peer(peer_ref));
        Some(peer_ref)
    }

    /// Close and remove a data peer, releasing its token.
    pub(crate) fn close_peer(&mut self, peer_ref: SlotRef) {
        if let Some(mut peer) = self.peers.remove(peer_ref) {
            if let Some(stream) = peer.channel.stream() {
                let _ = self.poll.registry().deregister(stream);
            }
            peer.channel.close();
            self.token_map.remove(&peer.token);
            self.registered_tokens.remove(&peer.token);
        }
    }

    /// Apply a fresh publisher URI list to a subscriber slot: open channels
    /// for new URIs, close channels for vanished ones, re-use live ones.
    pub(crate) fn update_subscriber_links(&mut self, slot: SlotRef, uris: &[String]) {
        let Some(subscriber) = self.subscribers.get_mut(slot) else {
            return;
        };
        let topic = subscriber.topic.clone();
        let own_uri = format!("http://{}:{}/", self.config.host, self.xmlrpc_port);

        // Drop links the master no longer reports.
        let (kept, dropped): (Vec<PublisherLink>, Vec<PublisherLink>) = subscriber
            .links
            .drain(..)
            .partition(|link| uris.contains(&link.uri));
        subscriber.links = kept;
        for link in dropped {
            log::debug!("publisher {} left {}", link.uri, topic);
            if let Some(peer_ref) = link.peer {
                self.close_peer(peer_ref);
            }
        }

        // Request the data endpoint for new URIs.
        for uri in uris {
            if *uri == own_uri {
                continue;
            }
            let subscriber = match self.subscribers.get_mut(slot) {
                Some(s) => s,
                None => return,
            };
            if subscriber.links.iter().any(|l| l.uri == *uri) {
                continue;
            }
            subscriber.links.push(PublisherLink {
                uri: uri.clone(),
                peer: None,
            });

            let Some((host, port)) = parse_http_uri(uri) else {
                log::warn!("unparseable publisher uri {}", uri);
                continue;
            };
            let params = vec![
                XmlRpcValue::from(self.config.name.as_str()),
                XmlRpcValue::from(topic.as_str()),
                XmlRpcValue::Array(vec![XmlRpcValue::Array(vec![XmlRpcValue::from("TCPROS")])]),
            ];
            self.enqueue_peer_call(
                ApiMethod::RequestTopic,
                params,
                host,
                port,
                Some(slot),
                Some(uri.clone()),
            );
        }
    }

    // ========================================================================
    // Call completion dispatch
    // ========================================================================

    /// Route a finished API call back to its originating slot.
    pub(crate) fn dispatch_completion(&mut self, completion: CallCompletion) {
        let CallCompletion { call, result } = completion;
        match result {
            Ok(result) => self.dispatch_success(&call, result),
            Err(pack) => {
                // A transport-level failure toward the master is the
                // master-unreachable case; method-level failures are not.
                let transport = pack.contains(ErrorKind::TransportIo)
                    || pack.contains(ErrorKind::TransportTimeout);
                let pack = if call.method.targets_master() && transport {
                    pack.push(ErrorKind::MasterUnreachable)
                } else {
                    pack
                };
                // Callers learn about failures through their own callback.
                if call.method == ApiMethod::LookupService {
                    if let Some(slot) = call.slot {
                        if let Some(caller) = self.callers.get_mut(slot) {
                            caller.lookup_pending = false;
                            caller.pending_request = None;
                            (caller.callback)(slots::CallerEvent::Failed(pack));
                            return;
                        }
                    }
                }
                self.surface_error(call.slot, pack);
            }
        }
    }

    fn dispatch_success(&mut self, call: &ApiCall, result: CallResult) {
        match (call.method, result) {
            (ApiMethod::RegisterPublisher, _) => {
                if let Some(publisher) = call.slot.and_then(|s| self.publishers.get_mut(s)) {
                    publisher.registered = true;
                    log::info!("publisher {} registered", publisher.topic);
                }
            }
            (ApiMethod::RegisterSubscriber, CallResult::Uris(uris)) => {
                if let Some(slot) = call.slot {
                    if let Some(subscriber) = self.subscribers.get_mut(slot) {
                        subscriber.registered = true;
                        log::info!(
                            "subscriber {} registered, {} publisher(s)",
                            subscriber.topic,
                            uris.len()
                        );
                        self.update_subscriber_links(slot, &uris);
                    }
                }
            }
            (ApiMethod::RegisterService, _) => {
                if let Some(provider) = call.slot.and_then(|s| self.providers.get_mut(s)) {
                    provider.registered = true;
                    log::info!("service {} registered", provider.service);
                }
            }
            (ApiMethod::UnregisterPublisher, _) => {
                if let Some(slot) = call.slot {
                    self.publishers.remove(slot);
                }
            }
            (ApiMethod::UnregisterSubscriber, _) => {
                if let Some(slot) = call.slot {
                    self.subscribers.remove(slot);
                }
            }
            (ApiMethod::UnregisterService, _) => {
                if let Some(slot) = call.slot {
                    self.providers.remove(slot);
                }
            }
            (ApiMethod::RequestTopic, CallResult::Endpoint { host, port }) => {
                self.open_subscriber_channel(call, &host, port);
            }
            (ApiMethod::LookupService, CallResult::ServiceEndpoint { host, port }) => {
                self.open_caller_channel(call, &host, port);
            }
            (method, result) => {
                log::debug!("call #{} {} completed: {:?}", call.id, method, result);
            }
        }
    }

    fn open_subscriber_channel(&mut self, call: &ApiCall, host: &str, port: u16) {
        let Some(slot) = call.slot else { return };
        let Some(uri) = call.context.clone() else { return };
        let Some(subscriber) = self.subscribers.get(slot) else {
            return;
        };

        let Ok(addr) = resolve(host, port) else {
            self.surface_error(Some(slot), ErrorPack::new(ErrorKind::TransportIo));
            return;
        };
        let header = ConnectionHeader::for_subscription(
            &subscriber.topic,
            &subscriber.type_name,
            &subscriber.md5,
            &self.config.name,
        );
        let channel = PeerChannel::outbound(ChannelRole::SubscriberData, addr, header);
        let owner = PeerOwner::SubscriberLink {
            slot,
            uri: uri.clone(),
        };
        match self.add_peer(channel, owner) {
            Some(peer_ref) => {
                if let Some(subscriber) = self.subscribers.get_mut(slot) {
                    if let Some(link) = subscriber.links.iter_mut().find(|l| l.uri == uri) {
                        link.peer = Some(peer_ref);
                    }
                }
            }
            None => {
                self.surface_error(Some(slot), ErrorPack::new(ErrorKind::SlotExhausted));
            }
        }
    }

    fn open_caller_channel(&mut self, call: &ApiCall, host: &str, port: u16) {
        let Some(slot) = call.slot else { return };
        let Some(caller) = self.callers.get_mut(slot) else {
            return;
        };
        caller.lookup_pending = false;
        if caller.pending_request.is_none() && !caller.persistent {
            // The call was abandoned (timeout) while the lookup ran.
            return;
        }

        let Ok(addr) = resolve(host, port) else {
            caller.pending_request = None;
            (caller.callback)(slots::CallerEvent::Failed(ErrorPack::new(
                ErrorKind::TransportIo,
            )));
            return;
        };
        let header = ConnectionHeader::for_service_call(
            &caller.service,
            &caller.type_name,
            &caller.md5,
            &self.config.name,
            caller.persistent,
        );
        let channel = PeerChannel::outbound(ChannelRole::ServiceCaller, addr, header);
        match self.add_peer(channel, PeerOwner::CallerLink { slot }) {
            Some(peer_ref) => {
                if let Some(caller) = self.callers.get_mut(slot) {
                    caller.peer = Some(peer_ref);
                }
            }
            None => {
                let caller = self.callers.get_mut(slot).unwrap();
                caller.pending_request = None;
                (caller.callback)(slots::CallerEvent::Failed(ErrorPack::new(
                    ErrorKind::SlotExhausted,
                )));
            }
        }
    }

    /// Decide what to do with a failed in-flight call: retry with backoff or
    /// surface.
    pub(crate) fn handle_call_transport_failure(&mut self, pack: ErrorPack) {
        let now = self.clock.now_us();
        if let Some(mut call) = self.engine.take_current() {
            call.attempts += 1;
            if call.attempts < MAX_CALL_ATTEMPTS {
                let backoff = 100_000u64
                    .saturating_mul(1 << call.attempts.min(6))
                    .min(4_000_000);
                call.retry_at_us = now + backoff;
                log::debug!(
                    "call #{} {} failed (attempt {}), retrying in {}us",
                    call.id,
                    call.method,
                    call.attempts,
                    backoff
                );
                self.queue.requeue_front(call);
            } else {
                log::warn!("call #{} {} failed after {} attempts", call.id, call.method, call.attempts);
                self.dispatch_completion(CallCompletion {
                    call,
                    result: Err(pack),
                });
            }
        }
    }

    pub(crate) fn peer_retry_cap(&self) -> u32 {
        PEER_RETRY_CAP
    }
}

/// Resolve a host/port pair to a socket address.
pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr, std::io::Error> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address"))
}

/// Bind a non-blocking listener with reuse-addr on all interfaces.
fn bind_listener(port: u16) -> RosResult<(TcpListener, u16)> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(|_| ErrorPack::new(ErrorKind::TransportIo))?;
    socket
        .set_reuse_address(true)
        .map_err(|_| ErrorPack::new(ErrorKind::TransportIo))?;
    socket
        .bind(&addr.into())
        .map_err(|_| ErrorPack::new(ErrorKind::TransportIo))?;
    socket
        .listen(128)
        .map_err(|_| ErrorPack::new(ErrorKind::TransportIo))?;
    socket
        .set_nonblocking(true)
        .map_err(|_| ErrorPack::new(ErrorKind::TransportIo))?;

    let listener = TcpListener::from_std(socket.into());
    let port = listener
        .local_addr()
        .map_err(|_| ErrorPack::new(ErrorKind::TransportIo))?
        .port();
    Ok((listener, port))
}

/// Reject topic/service names that are not slash-prefixed identifiers.
fn check_graph_name(name: &str) -> RosResult<()> {
    if !name.starts_with('/') || name.len() < 2 {
        return Err(ErrorPack::new(ErrorKind::BadArgument));
    }
    Ok(())
}

/// Block until `host:port` accepts connections or `timeout` elapses.
///
/// A helper for programs that must wait for the master (or another node) to
/// come up; not used by the loop itself.
pub fn wait_port_open(host: &str, port: u16, timeout: Duration) -> RosResult<()> {
    let deadline = Instant::now() + timeout;
    loop {
        match resolve(host, port) {
            Ok(addr) => {
                match StdTcpStream::connect_timeout(&addr, Duration::from_millis(250)) {
                    Ok(_) => return Ok(()),
                    Err(_) => {}
                }
            }
            Err(_) => {}
        }
        if Instant::now() >= deadline {
            return Err(ErrorPack::new(ErrorKind::TransportTimeout)
                .push(ErrorKind::MasterUnreachable));
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::testutil::{test_node, CannedSchemas};
    use super::*;
    use crate::msg::MessageSchema;

    #[test]
    fn test_node_binds_listeners() {
        let node = test_node();
        assert_ne!(node.xmlrpc_port(), 0);
        assert_ne!(node.tcpros_port(), 0);
        assert_ne!(node.xmlrpc_port(), node.tcpros_port());
        assert!(node.xmlrpc_uri().starts_with("http://127.0.0.1:"));
        assert!(node.service_uri().starts_with("rosrpc://127.0.0.1:"));
    }

    #[test]
    fn test_advertise_enqueues_registration() {
        let mut node = test_node();
        let slot = node
            .advertise("/chatter", "std_msgs/String", PublisherOptions::default())
            .unwrap();

        assert_eq!(node.queue.len(), 1);
        let call = node.queue.peek().unwrap();
        assert_eq!(call.method, ApiMethod::RegisterPublisher);
        assert_eq!(call.slot, Some(slot));
        assert_eq!(call.params[1].as_str(), Some("/chatter"));

        let publisher = node.publishers.get(slot).unwrap();
        assert!(!publisher.registered);
        assert_eq!(publisher.md5, "992ce8a1687cec8c8bd883ec73ca41d1");
    }

    #[test]
    fn test_call_ids_strictly_increase() {
        let mut node = test_node();
        node.advertise("/a", "std_msgs/String", PublisherOptions::default())
            .unwrap();
        node.advertise("/b", "std_msgs/String", PublisherOptions::default())
            .unwrap();

        let first = node.queue.dequeue().unwrap();
        let second = node.queue.dequeue().unwrap();
        assert!(second.id > first.id);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut node = test_node();
        let err = node
            .advertise("/t", "no_such/Type", PublisherOptions::default())
            .unwrap_err();
        assert_eq!(err.first(), ErrorKind::BadArgument);
    }

    #[test]
    fn test_bad_topic_name_rejected() {
        let mut node = test_node();
        assert!(node
            .advertise("chatter", "std_msgs/String", PublisherOptions::default())
            .is_err());
    }

    #[test]
    fn test_slot_exhaustion() {
        let mut config = NodeConfig::new("/n");
        config.max_publishers = 1;
        let mut node = Node::with_schema_source(config, Box::new(CannedSchemas)).unwrap();

        node.advertise("/a", "std_msgs/String", PublisherOptions::default())
            .unwrap();
        let err = node
            .advertise("/b", "std_msgs/String", PublisherOptions::default())
            .unwrap_err();
        assert_eq!(err.first(), ErrorKind::SlotExhausted);
    }

    #[test]
    fn test_create_message_from_template() {
        let mut node = test_node();
        let slot = node
            .advertise("/chatter", "std_msgs/String", PublisherOptions::default())
            .unwrap();

        let mut msg = node.create_message(slot).unwrap();
        msg.set_str("data", "hi").unwrap();
        assert_eq!(msg.get_str("data"), Some("hi"));
    }

    #[test]
    fn test_publish_wrong_schema_rejected() {
        let mut node = test_node();
        let slot = node
            .advertise("/chatter", "std_msgs/String", PublisherOptions::default())
            .unwrap();

        // A message from a different template is refused.
        let other_schema =
            MessageSchema::parse("p/Other", "int32 x\n", &mut |_| unreachable!()).unwrap();
        let other = Message::from_schema(other_schema);
        let err = node.publish(slot, &other).unwrap_err();
        assert_eq!(err.first(), ErrorKind::BadArgument);
    }

    #[test]
    fn test_publish_latching_retains_payload() {
        let mut node = test_node();
        let options = PublisherOptions {
            latching: true,
            ..Default::default()
        };
        let slot = node.advertise("/chatter", "std_msgs/String", options).unwrap();

        let mut msg = node.create_message(slot).unwrap();
        msg.set_str("data", "latched").unwrap();
        node.publish(slot, &msg).unwrap();

        let publisher = node.publishers.get(slot).unwrap();
        let payload = publisher.last_payload.as_ref().unwrap();
        assert_eq!(&payload[4..], b"latched");
    }

    #[test]
    fn test_unadvertise_keeps_slot_until_confirmed() {
        let mut node = test_node();
        let slot = node
            .advertise("/chatter", "std_msgs/String", PublisherOptions::default())
            .unwrap();
        node.queue.release();

        node.unadvertise(slot).unwrap();
        // Slot still present, flagged; unregister call queued.
        assert!(node.publishers.get(slot).unwrap().unregister_pending);
        assert_eq!(node.queue.peek().unwrap().method, ApiMethod::UnregisterPublisher);

        // Master confirms: now the slot is freed.
        let call = node.queue.dequeue().unwrap();
        node.dispatch_completion(CallCompletion {
            call,
            result: Ok(CallResult::Int(1)),
        });
        assert!(node.publishers.get(slot).is_none());
    }

    #[test]
    fn test_double_unadvertise_conflicts() {
        let mut node = test_node();
        let slot = node
            .advertise("/chatter", "std_msgs/String", PublisherOptions::default())
            .unwrap();
        node.unadvertise(slot).unwrap();
        let err = node.unadvertise(slot).unwrap_err();
        assert_eq!(err.first(), ErrorKind::RegistrationConflict);
    }

    #[test]
    fn test_register_subscriber_opens_links() {
        let mut node = test_node();
        let slot = node
            .subscribe("/chatter", "std_msgs/String", Box::new(|_| {}))
            .unwrap();
        let call = node.queue.dequeue().unwrap();

        node.dispatch_completion(CallCompletion {
            call,
            result: Ok(CallResult::Uris(vec!["http://10.0.0.7:3333/".to_string()])),
        });

        let subscriber = node.subscribers.get(slot).unwrap();
        assert!(subscriber.registered);
        assert_eq!(subscriber.links.len(), 1);
        assert_eq!(subscriber.links[0].uri, "http://10.0.0.7:3333/");

        // A requestTopic call to the publisher is now queued.
        let call = node.queue.peek().unwrap();
        assert_eq!(call.method, ApiMethod::RequestTopic);
        assert_eq!(call.host, "10.0.0.7");
        assert_eq!(call.port, 3333);
        assert_eq!(call.context.as_deref(), Some("http://10.0.0.7:3333/"));
    }

    #[test]
    fn test_publisher_update_diff() {
        let mut node = test_node();
        let slot = node
            .subscribe("/chatter", "std_msgs/String", Box::new(|_| {}))
            .unwrap();
        node.queue.release();

        node.update_subscriber_links(
            slot,
            &["http://a:1/".to_string(), "http://b:2/".to_string()],
        );
        assert_eq!(node.subscribers.get(slot).unwrap().links.len(), 2);
        assert_eq!(node.queue.len(), 2);
        node.queue.release();

        // "a" vanishes, "c" appears: one close, one new requestTopic.
        node.update_subscriber_links(
            slot,
            &["http://b:2/".to_string(), "http://c:3/".to_string()],
        );
        let subscriber = node.subscribers.get(slot).unwrap();
        let uris: Vec<_> = subscriber.links.iter().map(|l| l.uri.as_str()).collect();
        assert_eq!(uris, vec!["http://b:2/", "http://c:3/"]);
        assert_eq!(node.queue.len(), 1);
        assert_eq!(node.queue.peek().unwrap().context.as_deref(), Some("http://c:3/"));
    }

    #[test]
    fn test_caller_lookup_flow() {
        let mut node = test_node();
        let slot = node
            .service_caller(
                "/sum",
                "roscpp_tutorials/TwoInts",
                CallerOptions::default(),
                Box::new(|_| {}),
            )
            .unwrap();

        let mut request = node.create_request(slot).unwrap();
        request.set_i64("a", 3).unwrap();
        request.set_i64("b", 4).unwrap();
        node.call_service(slot, &request).unwrap();

        let caller = node.callers.get(slot).unwrap();
        assert!(caller.lookup_pending);
        assert!(caller.pending_request.is_some());
        assert_eq!(node.queue.peek().unwrap().method, ApiMethod::LookupService);

        // Second call while one is pending conflicts.
        let err = node.call_service(slot, &request).unwrap_err();
        assert_eq!(err.first(), ErrorKind::RegistrationConflict);
    }

    #[test]
    fn test_lookup_failure_reaches_caller_callback() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut node = test_node();
        let failures = Rc::new(RefCell::new(Vec::new()));
        let sink = failures.clone();
        let slot = node
            .service_caller(
                "/sum",
                "roscpp_tutorials/TwoInts",
                CallerOptions::default(),
                Box::new(move |event| {
                    if let slots::CallerEvent::Failed(pack) = event {
                        sink.borrow_mut().push(pack);
                    }
                }),
            )
            .unwrap();

        let request = node.create_request(slot).unwrap();
        node.call_service(slot, &request).unwrap();
        let call = node.queue.dequeue().unwrap();

        node.dispatch_completion(CallCompletion {
            call,
            result: Err(ErrorPack::new(ErrorKind::TransportIo)),
        });

        let failures = failures.borrow();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains(ErrorKind::MasterUnreachable));
        assert!(node.callers.get(slot).unwrap().pending_request.is_none());
    }

    #[test]
    fn test_transport_failure_retries_then_surfaces() {
        let mut node = test_node();
        node.advertise("/chatter", "std_msgs/String", PublisherOptions::default())
            .unwrap();

        // Simulate the engine failing the call repeatedly.
        let mut keepalive = Vec::new();
        for attempt in 1..MAX_CALL_ATTEMPTS {
            let call = node.queue.dequeue().unwrap();
            keepalive.push(node.engine_begin_for_test(call));
            node.handle_call_transport_failure(ErrorPack::new(ErrorKind::TransportIo));
            let requeued = node.queue.peek().unwrap();
            assert_eq!(requeued.attempts, attempt);
            assert!(requeued.retry_at_us > 0);
        }

        let call = node.queue.dequeue().unwrap();
        keepalive.push(node.engine_begin_for_test(call));
        node.handle_call_transport_failure(ErrorPack::new(ErrorKind::TransportIo));
        assert!(node.queue.is_empty());
    }

    #[test]
    fn test_wait_port_open() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        wait_port_open("127.0.0.1", port, Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_wait_port_open_timeout() {
        // Bind then drop to get a port that is very likely closed.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = wait_port_open("127.0.0.1", port, Duration::from_millis(300)).unwrap_err();
        assert!(err.contains(ErrorKind::MasterUnreachable));
    }

    impl Node {
        /// Park a call in the engine without touching the network (tests).
        ///
        /// Aims at a bound-but-unaccepted local port so the connect never
        /// completes; returns the listener to keep the port occupied.
        fn engine_begin_for_test(&mut self, call: ApiCall) -> std::net::TcpListener {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let port = listener.local_addr().unwrap().port();
            let mut call = call;
            call.host = "127.0.0.1".to_string();
            call.port = port;
            let now = self.clock.now_us();
            self.engine.begin(call, now).unwrap();
            listener
        }
    }
}
