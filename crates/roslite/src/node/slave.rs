// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The inbound negotiation RPC surface.
//!
//! Every node serves a small XML-RPC API on its negotiation port. Peers use
//! `requestTopic` to learn a publisher's data endpoint; the master uses
//! `publisherUpdate` to push the live publisher set and `shutdown` to ask
//! the node to leave. Each inbound connection runs accept, incremental HTTP
//! parse, dispatch, response write, close.

use mio::net::TcpStream;
use mio::Token;

use super::{Node, PeerOwner};
use crate::api::{envelope, ApiMethod};
use crate::buffer::ByteBuffer;
use crate::error::ErrorPack;
use crate::xmlrpc::{self, Fault, HttpRequestParser, XmlRpcValue};

/// One inbound negotiation connection.
pub(crate) struct RpcConn {
    pub stream: TcpStream,
    pub inbuf: ByteBuffer,
    pub outbuf: ByteBuffer,
    pub parser: HttpRequestParser,
    pub token: Token,
    /// Response queued; close once it drains.
    pub responding: bool,
}

impl RpcConn {
    pub fn new(stream: TcpStream, token: Token) -> Self {
        Self {
            stream,
            inbuf: ByteBuffer::new(),
            outbuf: ByteBuffer::new(),
            parser: HttpRequestParser::new(),
            token,
            responding: false,
        }
    }
}

impl Node {
    /// Decode, dispatch, and encode one negotiation request.
    ///
    /// Always produces a complete HTTP response; protocol problems become
    /// XML-RPC faults rather than dropped connections.
    pub(crate) fn dispatch_rpc_request(&mut self, body: &str) -> Vec<u8> {
        let response_body = match xmlrpc::decode_request(body) {
            Ok((method_name, params)) => match ApiMethod::from_name(&method_name) {
                Some(method) => {
                    log::debug!("slave api: {}", method);
                    let response = self.dispatch_slave_method(method, &params);
                    xmlrpc::encode_response(Ok(&response))
                }
                None => {
                    log::warn!("slave api: unknown method {}", method_name);
                    let fault = Fault {
                        code: -1,
                        message: format!("unknown method: {}", method_name),
                    };
                    xmlrpc::encode_response(Err(&fault))
                }
            },
            Err(pack) => {
                let fault = Fault {
                    code: -1,
                    message: format!("malformed request: {}", pack),
                };
                xmlrpc::encode_response(Err(&fault))
            }
        };
        xmlrpc::http::build_ok_response(&response_body)
    }

    fn dispatch_slave_method(
        &mut self,
        method: ApiMethod,
        params: &[XmlRpcValue],
    ) -> Vec<XmlRpcValue> {
        match method {
            ApiMethod::RequestTopic => self.handle_request_topic(params),
            ApiMethod::PublisherUpdate => self.handle_publisher_update(params),
            ApiMethod::GetBusInfo => self.handle_get_bus_info(),
            ApiMethod::GetPid => {
                envelope(1, "", XmlRpcValue::Int(std::process::id() as i32))
            }
            ApiMethod::GetMasterUri => {
                envelope(1, "", XmlRpcValue::from(self.config.master_uri()))
            }
            ApiMethod::Shutdown => {
                let reason = params
                    .get(1)
                    .and_then(|v| v.as_str())
                    .unwrap_or("(no reason)");
                log::info!("shutdown requested over slave api: {}", reason);
                self.shutdown_requested = true;
                envelope(1, "shutting down", XmlRpcValue::Int(0))
            }
            other => envelope(
                -1,
                &format!("{} is not served on this endpoint", other),
                XmlRpcValue::Int(0),
            ),
        }
    }

    /// `requestTopic(caller_id, topic, protocols)` -> `[TCPROS, host, port]`.
    fn handle_request_topic(&mut self, params: &[XmlRpcValue]) -> Vec<XmlRpcValue> {
        let topic = match params.get(1).and_then(|v| v.as_str()) {
            Some(topic) => topic,
            None => return envelope(-1, "missing topic parameter", XmlRpcValue::Int(0)),
        };

        let published = self.publishers.iter().any(|(_, p)| p.topic == topic);
        if !published {
            return envelope(
                -1,
                &format!("topic {} is not published here", topic),
                XmlRpcValue::Int(0),
            );
        }

        let tcpros_requested = params
            .get(2)
            .and_then(|v| v.as_array())
            .map(|protocols| {
                protocols.iter().any(|p| {
                    p.as_array()
                        .and_then(|entry| entry.first())
                        .and_then(|name| name.as_str())
                        == Some("TCPROS")
                })
            })
            .unwrap_or(false);
        if !tcpros_requested {
            return envelope(-1, "no supported protocol requested", XmlRpcValue::Int(0));
        }

        envelope(
            1,
            "ready",
            XmlRpcValue::Array(vec![
                XmlRpcValue::from("TCPROS"),
                XmlRpcValue::from(self.config.host.as_str()),
                XmlRpcValue::Int(i32::from(self.tcpros_port())),
            ]),
        )
    }

    /// `publisherUpdate(caller_id, topic, uris)` - diff against every
    /// subscriber of the topic.
    fn handle_publisher_update(&mut self, params: &[XmlRpcValue]) -> Vec<XmlRpcValue> {
        let topic = match params.get(1).and_then(|v| v.as_str()) {
            Some(topic) => topic.to_string(),
            None => return envelope(-1, "missing topic parameter", XmlRpcValue::Int(0)),
        };
        let uris: Vec<String> = match params.get(2).and_then(|v| v.as_array()) {
            Some(items) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect(),
            None => return envelope(-1, "missing publishers parameter", XmlRpcValue::Int(0)),
        };

        let slots: Vec<_> = self
            .subscribers
            .iter()
            .filter(|(_, s)| s.topic == topic)
            .map(|(slot, _)| slot)
            .collect();
        for slot in &slots {
            self.update_subscriber_links(*slot, &uris);
        }
        log::debug!(
            "publisherUpdate {}: {} uri(s), {} subscriber slot(s)",
            topic,
            uris.len(),
            slots.len()
        );
        envelope(1, "", XmlRpcValue::Int(0))
    }

    /// `getBusInfo()` - one entry per live peer connection.
    fn handle_get_bus_info(&mut self) -> Vec<XmlRpcValue> {
        let mut info = Vec::new();
        for (peer_ref, peer) in self.peers.iter() {
            let (direction, topic) = match &peer.owner {
                PeerOwner::SubscriberLink { slot, .. } => (
                    "i",
                    self.subscribers
                        .get(*slot)
                        .map(|s| s.topic.clone())
                        .unwrap_or_default(),
                ),
                PeerOwner::PublisherFan { slot } => (
                    "o",
                    self.publishers
                        .get(*slot)
                        .map(|p| p.topic.clone())
                        .unwrap_or_default(),
                ),
                PeerOwner::ProviderConn { slot } => (
                    "i",
                    self.providers
                        .get(*slot)
                        .map(|p| p.service.clone())
                        .unwrap_or_default(),
                ),
                PeerOwner::CallerLink { slot } => (
                    "o",
                    self.callers
                        .get(*slot)
                        .map(|c| c.service.clone())
                        .unwrap_or_default(),
                ),
                PeerOwner::Unbound => ("i", String::new()),
            };
            let remote = peer
                .channel
                .remote()
                .map(|a| a.to_string())
                .unwrap_or_default();
            info.push(XmlRpcValue::Array(vec![
                XmlRpcValue::Int(peer_ref.index as i32),
                XmlRpcValue::from(remote),
                XmlRpcValue::from(direction),
                XmlRpcValue::from("TCPROS"),
                XmlRpcValue::from(topic),
                XmlRpcValue::Bool(!peer.channel.is_closed()),
            ]));
        }
        envelope(1, "bus info", XmlRpcValue::Array(info))
    }

    /// Surface a failed negotiation connection; these are never fatal.
    pub(crate) fn drop_rpc_conn(&mut self, conn_ref: crate::arena::SlotRef, pack: ErrorPack) {
        if let Some(mut conn) = self.rpc_conns.remove(conn_ref) {
            if !pack.is_ok() {
                log::debug!("negotiation connection dropped: {}", pack);
            }
            let _ = self.poll.registry().deregister(&mut conn.stream);
            self.token_map.remove(&conn.token);
            self.registered_tokens.remove(&conn.token);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::super::testutil::test_node;
    use super::*;
    use crate::node::slots::PublisherOptions;

    fn call_body(method: &str, params: &[XmlRpcValue]) -> String {
        xmlrpc::encode_request(method, params)
    }

    /// Decode the dispatcher's HTTP response down to the envelope triple.
    fn response_triple(raw: &[u8]) -> (i32, XmlRpcValue) {
        let text = String::from_utf8(raw.to_vec()).unwrap();
        let body_at = text.find("\r\n\r\n").unwrap() + 4;
        let decoded = xmlrpc::decode_response(&text[body_at..]).unwrap().unwrap();
        let triple = decoded[0].as_array().unwrap();
        (
            triple[0].as_int().unwrap(),
            triple[2].clone(),
        )
    }

    #[test]
    fn test_get_pid() {
        let mut node = test_node();
        let raw = node.dispatch_rpc_request(&call_body("getPid", &[XmlRpcValue::from("/me")]));
        let (code, value) = response_triple(&raw);
        assert_eq!(code, 1);
        assert_eq!(value.as_int(), Some(std::process::id() as i32));
    }

    #[test]
    fn test_get_master_uri() {
        let mut node = test_node();
        let raw = node.dispatch_rpc_request(&call_body("getMasterUri", &[]));
        let (code, value) = response_triple(&raw);
        assert_eq!(code, 1);
        assert_eq!(value.as_str(), Some("http://127.0.0.1:11311/"));
    }

    #[test]
    fn test_shutdown_sets_flag() {
        let mut node = test_node();
        assert!(!node.shutdown_requested);

        let raw = node.dispatch_rpc_request(&call_body(
            "shutdown",
            &[XmlRpcValue::from("/master"), XmlRpcValue::from("bye")],
        ));
        let (code, _) = response_triple(&raw);
        assert_eq!(code, 1);
        assert!(node.shutdown_requested);
    }

    #[test]
    fn test_request_topic_for_published_topic() {
        let mut node = test_node();
        node.advertise("/chatter", "std_msgs/String", PublisherOptions::default())
            .unwrap();

        let params = [
            XmlRpcValue::from("/listener"),
            XmlRpcValue::from("/chatter"),
            XmlRpcValue::Array(vec![XmlRpcValue::Array(vec![XmlRpcValue::from("TCPROS")])]),
        ];
        let raw = node.dispatch_rpc_request(&call_body("requestTopic", &params));
        let (code, value) = response_triple(&raw);

        assert_eq!(code, 1);
        let triple = value.as_array().unwrap();
        assert_eq!(triple[0].as_str(), Some("TCPROS"));
        assert_eq!(triple[1].as_str(), Some("127.0.0.1"));
        assert_eq!(triple[2].as_int(), Some(i32::from(node.tcpros_port())));
    }

    #[test]
    fn test_request_topic_unknown_topic() {
        let mut node = test_node();
        let params = [
            XmlRpcValue::from("/listener"),
            XmlRpcValue::from("/nope"),
            XmlRpcValue::Array(vec![XmlRpcValue::Array(vec![XmlRpcValue::from("TCPROS")])]),
        ];
        let raw = node.dispatch_rpc_request(&call_body("requestTopic", &params));
        let (code, _) = response_triple(&raw);
        assert_eq!(code, -1);
    }

    #[test]
    fn test_request_topic_requires_tcpros() {
        let mut node = test_node();
        node.advertise("/chatter", "std_msgs/String", PublisherOptions::default())
            .unwrap();

        let params = [
            XmlRpcValue::from("/listener"),
            XmlRpcValue::from("/chatter"),
            XmlRpcValue::Array(vec![XmlRpcValue::Array(vec![XmlRpcValue::from("UDPROS")])]),
        ];
        let raw = node.dispatch_rpc_request(&call_body("requestTopic", &params));
        let (code, _) = response_triple(&raw);
        assert_eq!(code, -1);
    }

    #[test]
    fn test_publisher_update_rewires_subscribers() {
        let mut node = test_node();
        let slot = node
            .subscribe("/chatter", "std_msgs/String", Box::new(|_| {}))
            .unwrap();
        node.queue.release();

        let params = [
            XmlRpcValue::from("/master"),
            XmlRpcValue::from("/chatter"),
            XmlRpcValue::Array(vec![XmlRpcValue::from("http://pub:1234/")]),
        ];
        let raw = node.dispatch_rpc_request(&call_body("publisherUpdate", &params));
        let (code, _) = response_triple(&raw);

        assert_eq!(code, 1);
        let subscriber = node.subscribers.get(slot).unwrap();
        assert_eq!(subscriber.links.len(), 1);
        assert_eq!(subscriber.links[0].uri, "http://pub:1234/");
        assert_eq!(node.queue.peek().unwrap().method, ApiMethod::RequestTopic);
    }

    #[test]
    fn test_unknown_method_faults() {
        let mut node = test_node();
        let raw = node.dispatch_rpc_request(&call_body("paramSet", &[]));
        let text = String::from_utf8(raw).unwrap();
        let body_at = text.find("\r\n\r\n").unwrap() + 4;
        let decoded = xmlrpc::decode_response(&text[body_at..]).unwrap();
        assert!(decoded.is_err());
    }

    #[test]
    fn test_malformed_body_faults() {
        let mut node = test_node();
        let raw = node.dispatch_rpc_request("this is not xml");
        let text = String::from_utf8(raw).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.contains("<fault>"));
    }

    #[test]
    fn test_master_method_refused_on_slave_port() {
        let mut node = test_node();
        let raw = node.dispatch_rpc_request(&call_body("registerPublisher", &[]));
        let (code, _) = response_triple(&raw);
        assert_eq!(code, -1);
    }

    #[test]
    fn test_get_bus_info_empty() {
        let mut node = test_node();
        let raw = node.dispatch_rpc_request(&call_body("getBusInfo", &[]));
        let (code, value) = response_triple(&raw);
        assert_eq!(code, 1);
        assert_eq!(value.as_array().unwrap().len(), 0);
    }
}
