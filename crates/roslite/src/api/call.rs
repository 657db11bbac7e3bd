// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Call records, method codes, and the FIFO call queue.

use std::collections::VecDeque;
use std::fmt;

use crate::arena::SlotRef;
use crate::error::{ErrorKind, ErrorPack, RosResult};
use crate::xmlrpc::XmlRpcValue;

/// Progressive call id; strictly increasing, never reused.
pub type CallId = u64;

/// Retries before a call is failed to its originator.
pub const MAX_CALL_ATTEMPTS: u32 = 5;

/// The closed set of RPC methods the runtime issues or serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiMethod {
    // Master API.
    RegisterPublisher,
    UnregisterPublisher,
    RegisterSubscriber,
    UnregisterSubscriber,
    RegisterService,
    UnregisterService,
    LookupService,
    // Peer (slave) API.
    RequestTopic,
    PublisherUpdate,
    GetBusInfo,
    GetPid,
    GetMasterUri,
    Shutdown,
}

impl ApiMethod {
    /// Wire method name.
    pub fn name(&self) -> &'static str {
        match self {
            ApiMethod::RegisterPublisher => "registerPublisher",
            ApiMethod::UnregisterPublisher => "unregisterPublisher",
            ApiMethod::RegisterSubscriber => "registerSubscriber",
            ApiMethod::UnregisterSubscriber => "unregisterSubscriber",
            ApiMethod::RegisterService => "registerService",
            ApiMethod::UnregisterService => "unregisterService",
            ApiMethod::LookupService => "lookupService",
            ApiMethod::RequestTopic => "requestTopic",
            ApiMethod::PublisherUpdate => "publisherUpdate",
            ApiMethod::GetBusInfo => "getBusInfo",
            ApiMethod::GetPid => "getPid",
            ApiMethod::GetMasterUri => "getMasterUri",
            ApiMethod::Shutdown => "shutdown",
        }
    }

    /// Reverse mapping for the negotiation server's dispatcher.
    pub fn from_name(name: &str) -> Option<ApiMethod> {
        Some(match name {
            "registerPublisher" => ApiMethod::RegisterPublisher,
            "unregisterPublisher" => ApiMethod::UnregisterPublisher,
            "registerSubscriber" => ApiMethod::RegisterSubscriber,
            "unregisterSubscriber" => ApiMethod::UnregisterSubscriber,
            "registerService" => ApiMethod::RegisterService,
            "unregisterService" => ApiMethod::UnregisterService,
            "lookupService" => ApiMethod::LookupService,
            "requestTopic" => ApiMethod::RequestTopic,
            "publisherUpdate" => ApiMethod::PublisherUpdate,
            "getBusInfo" => ApiMethod::GetBusInfo,
            "getPid" => ApiMethod::GetPid,
            "getMasterUri" => ApiMethod::GetMasterUri,
            "shutdown" => ApiMethod::Shutdown,
            _ => return None,
        })
    }

    /// True for calls addressed to the master rather than a peer.
    pub fn targets_master(&self) -> bool {
        matches!(
            self,
            ApiMethod::RegisterPublisher
                | ApiMethod::UnregisterPublisher
                | ApiMethod::RegisterSubscriber
                | ApiMethod::UnregisterSubscriber
                | ApiMethod::RegisterService
                | ApiMethod::UnregisterService
                | ApiMethod::LookupService
        )
    }
}

impl fmt::Display for ApiMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ============================================================================
// Typed results
// ============================================================================

/// Typed extraction of a method response's value slot.
#[derive(Debug, Clone, PartialEq)]
pub enum CallResult {
    /// Methods whose value we do not consume.
    Ignored,
    /// An integer payload (unregister counts).
    Int(i32),
    /// Publisher URI list (registerSubscriber, publisherUpdate).
    Uris(Vec<String>),
    /// A TCPROS endpoint from requestTopic: `["TCPROS", host, port]`.
    Endpoint { host: String, port: u16 },
    /// A service endpoint from lookupService: `rosrpc://host:port`.
    ServiceEndpoint { host: String, port: u16 },
}

/// Extract the typed result for `method` from the unwrapped value slot.
pub fn fetch_result(method: ApiMethod, value: &XmlRpcValue) -> RosResult<CallResult> {
    let malformed = || ErrorPack::new(ErrorKind::ProtocolMalformed);
    match method {
        ApiMethod::RegisterSubscriber | ApiMethod::PublisherUpdate => {
            let items = value.as_array().ok_or_else(malformed)?;
            let uris = items
                .iter()
                .map(|v| v.as_str().map(|s| s.to_string()).ok_or_else(malformed))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(CallResult::Uris(uris))
        }
        ApiMethod::RequestTopic => {
            let triple = value.as_array().ok_or_else(malformed)?;
            if triple.first().and_then(|v| v.as_str()) != Some("TCPROS") {
                return Err(malformed());
            }
            let host = triple
                .get(1)
                .and_then(|v| v.as_str())
                .ok_or_else(malformed)?
                .to_string();
            let port = triple
                .get(2)
                .and_then(|v| v.as_int())
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(malformed)?;
            Ok(CallResult::Endpoint { host, port })
        }
        ApiMethod::LookupService => {
            let uri = value.as_str().ok_or_else(malformed)?;
            let (host, port) = parse_rosrpc_uri(uri).ok_or_else(malformed)?;
            Ok(CallResult::ServiceEndpoint { host, port })
        }
        ApiMethod::UnregisterPublisher
        | ApiMethod::UnregisterSubscriber
        | ApiMethod::UnregisterService => {
            Ok(CallResult::Int(value.as_int().unwrap_or(0)))
        }
        _ => Ok(CallResult::Ignored),
    }
}

/// Unwrap the `[code, status, value]` triple every master/slave response
/// carries; a non-positive code is `rpc-method-failed`.
pub fn unwrap_envelope_code<'a>(
    id: CallId,
    method: ApiMethod,
    params: &'a [XmlRpcValue],
) -> RosResult<&'a XmlRpcValue> {
    let malformed = || ErrorPack::new(ErrorKind::ProtocolMalformed);
    let triple = params
        .first()
        .and_then(|v| v.as_array())
        .ok_or_else(malformed)?;
    let code = triple
        .first()
        .and_then(|v| v.as_int())
        .ok_or_else(malformed)?;
    let value = triple.get(2).ok_or_else(malformed)?;
    if code <= 0 {
        let status = triple.get(1).and_then(|v| v.as_str()).unwrap_or("");
        log::warn!("api call #{} {} refused (code {}): {}", id, method, code, status);
        return Err(ErrorPack::new(ErrorKind::RpcMethodFailed));
    }
    Ok(value)
}

/// Build the `[code, status, value]` triple for an outgoing response.
pub fn envelope(code: i32, status: &str, value: XmlRpcValue) -> Vec<XmlRpcValue> {
    vec![XmlRpcValue::Array(vec![
        XmlRpcValue::Int(code),
        XmlRpcValue::from(status),
        value,
    ])]
}

/// Parse `http://host:port/` into its parts.
pub fn parse_http_uri(uri: &str) -> Option<(String, u16)> {
    let rest = uri.strip_prefix("http://")?;
    let rest = rest.trim_end_matches('/');
    let (host, port) = rest.rsplit_once(':')?;
    Some((host.to_string(), port.parse().ok()?))
}

/// Parse `rosrpc://host:port` into its parts.
pub fn parse_rosrpc_uri(uri: &str) -> Option<(String, u16)> {
    let rest = uri.strip_prefix("rosrpc://")?;
    let rest = rest.trim_end_matches('/');
    let (host, port) = rest.rsplit_once(':')?;
    Some((host.to_string(), port.parse().ok()?))
}

// ============================================================================
// ApiCall
// ============================================================================

/// One RPC in flight or queued: id, method, parameters, target, and the
/// originating slot.
#[derive(Debug)]
pub struct ApiCall {
    pub id: CallId,
    pub method: ApiMethod,
    pub params: Vec<XmlRpcValue>,
    pub host: String,
    pub port: u16,
    /// Registry slot this call acts for, when any.
    pub slot: Option<SlotRef>,
    /// Free-form routing context (e.g. the publisher URI a requestTopic
    /// call was issued for).
    pub context: Option<String>,
    /// Connect attempts so far.
    pub attempts: u32,
    /// Earliest retry time after a transport failure.
    pub retry_at_us: u64,
}

impl ApiCall {
    pub fn new(
        id: CallId,
        method: ApiMethod,
        params: Vec<XmlRpcValue>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id,
            method,
            params,
            host: host.into(),
            port,
            slot: None,
            context: None,
            attempts: 0,
            retry_at_us: 0,
        }
    }

    pub fn with_slot(mut self, slot: SlotRef) -> Self {
        self.slot = Some(slot);
        self
    }
}

// ============================================================================
// ApiCallQueue
// ============================================================================

/// FIFO of pending calls. Loop-private: no locking.
#[derive(Debug, Default)]
pub struct ApiCallQueue {
    calls: VecDeque<ApiCall>,
}

impl ApiCallQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append at the tail.
    pub fn enqueue(&mut self, call: ApiCall) {
        log::debug!(
            "enqueue api call #{} {} -> {}:{}",
            call.id,
            call.method,
            call.host,
            call.port
        );
        self.calls.push_back(call);
    }

    /// Put a call back at the head (transport retry keeps FIFO order).
    pub fn requeue_front(&mut self, call: ApiCall) {
        self.calls.push_front(call);
    }

    /// The head call, if any.
    pub fn peek(&self) -> Option<&ApiCall> {
        self.calls.front()
    }

    /// Pop the head call.
    pub fn dequeue(&mut self) -> Option<ApiCall> {
        self.calls.pop_front()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Drop every queued call (shutdown).
    pub fn release(&mut self) {
        self.calls.clear();
    }

    /// Earliest retry deadline among queued calls, for loop wake planning.
    pub fn next_retry_us(&self) -> Option<u64> {
        self.calls
            .iter()
            .map(|c| c.retry_at_us)
            .filter(|&t| t > 0)
            .min()
    }
}

// ============================================================================
// Tests
// ============================================================================
