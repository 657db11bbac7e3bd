// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Non-blocking HTTP/XML-RPC client state machine.
//!
//! Drives one [`ApiCall`] at a time: connect, write the POST, read the full
//! response, decode, extract the typed result. The engine never blocks; the
//! event loop feeds it readiness.
//!
//! ```text
//! Idle -> Connecting -> Writing -> Reading -> Idle
//! ```

use std::io::{Read, Write};
use std::net::ToSocketAddrs;

use mio::net::TcpStream;

use super::call::{fetch_result, unwrap_envelope_code, ApiCall, CallResult};
use crate::buffer::ByteBuffer;
use crate::error::{kind_of_io_error, ErrorKind, ErrorPack, RosResult};
use crate::xmlrpc::{self, HttpResponseParser, ParseStatus};

/// Default per-call deadline.
pub const DEFAULT_CALL_TIMEOUT_US: u64 = 5_000_000;

/// Engine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcClientState {
    Idle,
    Connecting,
    Writing,
    Reading,
}

/// A finished call: the record plus its typed outcome.
#[derive(Debug)]
pub struct CallCompletion {
    pub call: ApiCall,
    pub result: RosResult<CallResult>,
}

/// The single-in-flight RPC client.
#[derive(Debug)]
pub struct RpcClientEngine {
    state: RpcClientState,
    stream: Option<TcpStream>,
    outbuf: ByteBuffer,
    inbuf: ByteBuffer,
    parser: HttpResponseParser,
    current: Option<ApiCall>,
    deadline_us: u64,
    call_timeout_us: u64,
}

impl RpcClientEngine {
    pub fn new(call_timeout_us: u64) -> Self {
        Self {
            state: RpcClientState::Idle,
            stream: None,
            outbuf: ByteBuffer::new(),
            inbuf: ByteBuffer::new(),
            parser: HttpResponseParser::new(),
            current: None,
            deadline_us: u64::MAX,
            call_timeout_us,
        }
    }

    pub fn state(&self) -> RpcClientState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == RpcClientState::Idle
    }

    /// Id of the in-flight call.
    pub fn current_id(&self) -> Option<u64> {
        self.current.as_ref().map(|c| c.id)
    }

    /// Deadline of the in-flight call, for loop wake planning.
    pub fn deadline_us(&self) -> Option<u64> {
        if self.is_idle() {
            None
        } else {
            Some(self.deadline_us)
        }
    }

    pub fn stream(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    /// True when the loop should register write interest.
    pub fn wants_write(&self) -> bool {
        matches!(
            self.state,
            RpcClientState::Connecting | RpcClientState::Writing
        )
    }

    /// True when the loop should register read interest.
    pub fn wants_read(&self) -> bool {
        self.state == RpcClientState::Reading
    }

    /// Start driving `call`. The engine must be idle.
    ///
    /// Immediate failures (resolve, socket create) hand the call back as a
    /// completion so the node can retry or surface it.
    pub fn begin(&mut self, call: ApiCall, now_us: u64) -> Result<(), CallCompletion> {
        debug_assert!(self.is_idle());

        let addr = match (call.host.as_str(), call.port).to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    return Err(CallCompletion {
                        call,
                        result: Err(ErrorPack::new(ErrorKind::TransportIo)),
                    })
                }
            },
            Err(e) => {
                return Err(CallCompletion {
                    call,
                    result: Err(ErrorPack::new(kind_of_io_error(&e))),
                })
            }
        };

        let stream = match TcpStream::connect(addr) {
            Ok(s) => s,
            Err(e) => {
                return Err(CallCompletion {
                    call,
                    result: Err(ErrorPack::new(kind_of_io_error(&e))),
                })
            }
        };

        let body = xmlrpc::encode_request(call.method.name(), &call.params);
        self.outbuf.clear();
        self.outbuf
            .append(&xmlrpc::http::build_post_request(&call.host, call.port, &body));
        self.inbuf.clear();
        self.parser.reset();

        log::debug!("api call #{} {} -> {}", call.id, call.method, addr);
        self.stream = Some(stream);
        self.deadline_us = now_us + self.call_timeout_us;
        self.current = Some(call);
        self.state = RpcClientState::Connecting;
        Ok(())
    }

    /// Progress connects and request writes.
    ///
    /// `Err` is a transport failure; the engine still holds the call (see
    /// [`take_current`] / [`take_failed`]).
    ///
    /// [`take_current`]: RpcClientEngine::take_current
    /// [`take_failed`]: RpcClientEngine::take_failed
    pub fn handle_writable(&mut self, _now_us: u64) -> RosResult<()> {
        if self.state == RpcClientState::Connecting {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| ErrorPack::new(ErrorKind::InternalInvariant))?;
            if let Ok(Some(e)) | Err(e) = stream.take_error() {
                return Err(ErrorPack::new(kind_of_io_error(&e)));
            }
            match stream.peer_addr() {
                Ok(_) => self.state = RpcClientState::Writing,
                Err(e) if e.kind() == std::io::ErrorKind::NotConnected => return Ok(()),
                Err(e) => return Err(ErrorPack::new(kind_of_io_error(&e))),
            }
        }

        if self.state != RpcClientState::Writing {
            return Ok(());
        }

        while !self.outbuf.is_empty() {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| ErrorPack::new(ErrorKind::InternalInvariant))?;
            match stream.write(self.outbuf.as_slice()) {
                Ok(0) => return Err(ErrorPack::new(ErrorKind::TransportIo)),
                Ok(n) => self.outbuf.consume(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ErrorPack::new(kind_of_io_error(&e))),
            }
        }
        self.state = RpcClientState::Reading;
        Ok(())
    }

    /// Progress the response read; `Ok(Some)` when the call finished.
    pub fn handle_readable(&mut self, _now_us: u64) -> RosResult<Option<CallCompletion>> {
        if self.state != RpcClientState::Reading {
            return Ok(None);
        }

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ErrorPack::new(ErrorKind::InternalInvariant))?;

        let mut chunk = [0u8; 8192];
        let mut saw_eof = false;
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    saw_eof = true;
                    break;
                }
                Ok(n) => self.inbuf.append(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ErrorPack::new(kind_of_io_error(&e))),
            }
        }

        match self.parser.advance(&mut self.inbuf)? {
            ParseStatus::Done => {
                let body = self.parser.take_body().unwrap_or_default();
                let call = self
                    .current
                    .take()
                    .ok_or_else(|| ErrorPack::new(ErrorKind::InternalInvariant))?;
                let result = parse_response_body(&call, &body);
                self.reset();
                Ok(Some(CallCompletion { call, result }))
            }
            ParseStatus::Incomplete if saw_eof => {
                Err(ErrorPack::new(ErrorKind::TransportIo))
            }
            ParseStatus::Incomplete => Ok(None),
        }
    }

    /// Deadline check; true when the in-flight call timed out.
    pub fn timed_out(&self, now_us: u64) -> bool {
        !self.is_idle() && now_us >= self.deadline_us
    }

    /// Take the in-flight call back for a retry.
    pub fn take_current(&mut self) -> Option<ApiCall> {
        let call = self.current.take();
        self.reset();
        call
    }

    /// Fail the in-flight call with `pack` and hand back the completion.
    pub fn take_failed(&mut self, pack: ErrorPack) -> Option<CallCompletion> {
        let call = self.current.take()?;
        self.reset();
        Some(CallCompletion {
            call,
            result: Err(pack),
        })
    }

    /// Drop any in-flight state (shutdown).
    pub fn abort(&mut self) {
        self.current = None;
        self.reset();
    }

    fn reset(&mut self) {
        self.stream = None;
        self.outbuf.clear();
        self.inbuf.clear();
        self.parser.reset();
        self.state = RpcClientState::Idle;
        self.deadline_us = u64::MAX;
    }
}

/// Decode an XML-RPC response body into the call's typed result.
///
/// The master and slave APIs wrap every result in a `[code, status, value]`
/// triple; a non-positive code or a fault is `rpc-method-failed`.
pub(crate) fn parse_response_body(call: &ApiCall, body: &str) -> RosResult<CallResult> {
    let decoded = xmlrpc::decode_response(body)?;
    let params = match decoded {
        Ok(params) => params,
        Err(fault) => {
            log::warn!("api call #{} {} faulted: {}", call.id, call.method, fault);
            return Err(ErrorPack::new(ErrorKind::RpcMethodFailed));
        }
    };
    let value = unwrap_envelope_code(call.id, call.method, &params)?;
    fetch_result(call.method, value)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::call::ApiMethod;
    use crate::xmlrpc::XmlRpcValue;
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    fn envelope(code: i32, value: XmlRpcValue) -> String {
        let triple = vec![XmlRpcValue::Array(vec![
            XmlRpcValue::Int(code),
            XmlRpcValue::from("status"),
            value,
        ])];
        xmlrpc::encode_response(Ok(&triple))
    }

    #[test]
    fn test_parse_success_envelope() {
        let call = ApiCall::new(1, ApiMethod::RequestTopic, vec![], "h", 1);
        let body = envelope(
            1,
            XmlRpcValue::Array(vec![
                XmlRpcValue::from("TCPROS"),
                XmlRpcValue::from("host"),
                XmlRpcValue::Int(40000),
            ]),
        );
        let result = parse_response_body(&call, &body).unwrap();
        assert_eq!(
            result,
            CallResult::Endpoint {
                host: "host".to_string(),
                port: 40000
            }
        );
    }

    #[test]
    fn test_parse_failure_code() {
        let call = ApiCall::new(1, ApiMethod::RegisterPublisher, vec![], "h", 1);
        let body = envelope(-1, XmlRpcValue::Int(0));
        let err = parse_response_body(&call, &body).unwrap_err();
        assert_eq!(err.first(), ErrorKind::RpcMethodFailed);
    }

    #[test]
    fn test_parse_fault() {
        let call = ApiCall::new(1, ApiMethod::RegisterPublisher, vec![], "h", 1);
        let fault = xmlrpc::Fault {
            code: 2,
            message: "bad".to_string(),
        };
        let body = xmlrpc::encode_response(Err(&fault));
        let err = parse_response_body(&call, &body).unwrap_err();
        assert_eq!(err.first(), ErrorKind::RpcMethodFailed);
    }

    #[test]
    fn test_parse_garbage_body() {
        let call = ApiCall::new(1, ApiMethod::GetPid, vec![], "h", 1);
        let err = parse_response_body(&call, "not xml at all").unwrap_err();
        assert_eq!(err.first(), ErrorKind::ProtocolMalformed);
    }

    /// Full exchange against a canned in-process HTTP server.
    #[test]
    fn test_engine_full_call() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            socket
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            // Read until the request body has arrived.
            let mut request = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).unwrap();
                request.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text
                        .lines()
                        .find_map(|l| l.strip_prefix("Content-Length: "))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
            }
            assert!(String::from_utf8_lossy(&request).contains("registerPublisher"));

            let body = envelope(1, XmlRpcValue::Array(vec![]));
            let response = xmlrpc::http::build_ok_response(&body);
            socket.write_all(&response).unwrap();
        });

        let mut engine = RpcClientEngine::new(DEFAULT_CALL_TIMEOUT_US);
        let call = ApiCall::new(
            7,
            ApiMethod::RegisterPublisher,
            vec![XmlRpcValue::from("/n"), XmlRpcValue::from("/t")],
            "127.0.0.1",
            port,
        );
        engine.begin(call, 0).unwrap();
        assert!(!engine.is_idle());
        assert_eq!(engine.current_id(), Some(7));

        // Drive the machine without a poller: just spin with tiny sleeps.
        let started = Instant::now();
        let completion = loop {
            assert!(started.elapsed() < Duration::from_secs(5), "call stuck");
            if engine.wants_write() {
                engine.handle_writable(0).unwrap();
            }
            if engine.wants_read() {
                if let Some(done) = engine.handle_readable(0).unwrap() {
                    break done;
                }
            }
            std::thread::sleep(Duration::from_millis(2));
        };

        assert_eq!(completion.call.id, 7);
        assert_eq!(completion.result.unwrap(), CallResult::Ignored);
        assert!(engine.is_idle());
        server.join().unwrap();
    }

    #[test]
    fn test_timeout_detection() {
        let mut engine = RpcClientEngine::new(1_000);
        assert!(!engine.timed_out(10_000));

        // Park a call toward a listener that never answers.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let call = ApiCall::new(1, ApiMethod::GetPid, vec![], "127.0.0.1", port);
        engine.begin(call, 5_000).unwrap();

        assert!(!engine.timed_out(5_500));
        assert!(engine.timed_out(6_000));

        let completion = engine
            .take_failed(ErrorPack::new(ErrorKind::TransportTimeout))
            .unwrap();
        assert_eq!(completion.call.id, 1);
        assert!(engine.is_idle());
    }

    #[test]
    fn test_take_current_for_retry() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut engine = RpcClientEngine::new(DEFAULT_CALL_TIMEOUT_US);
        let call = ApiCall::new(3, ApiMethod::GetPid, vec![], "127.0.0.1", port);
        engine.begin(call, 0).unwrap();

        let call = engine.take_current().unwrap();
        assert_eq!(call.id, 3);
        assert!(engine.is_idle());
    }
}
