// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection-header codec.
//!
//! Wire layout: a 4-byte little-endian total length, then one block per
//! field, each a 4-byte little-endian length followed by `key=value` bytes.

use std::collections::BTreeMap;

use crate::buffer::ByteBuffer;
use crate::error::{ErrorKind, ErrorPack, RosResult};

/// Largest accepted header block; anything bigger is a protocol error.
const MAX_HEADER_LEN: usize = 1024 * 1024;

/// A decoded or under-construction connection header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionHeader {
    fields: BTreeMap<String, String>,
}

impl ConnectionHeader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Header sent by a subscriber when connecting to a publisher.
    pub fn for_subscription(topic: &str, type_name: &str, md5: &str, caller_id: &str) -> Self {
        let mut header = Self::new();
        header.set("topic", topic);
        header.set("type", type_name);
        header.set("md5sum", md5);
        header.set("callerid", caller_id);
        header.set("tcp_nodelay", "1");
        header
    }

    /// Header sent back by a publisher accepting a subscription.
    pub fn for_publication(type_name: &str, md5: &str, caller_id: &str, latching: bool) -> Self {
        let mut header = Self::new();
        header.set("type", type_name);
        header.set("md5sum", md5);
        header.set("callerid", caller_id);
        header.set("latching", if latching { "1" } else { "0" });
        header
    }

    /// Header sent by a service caller.
    pub fn for_service_call(
        service: &str,
        type_name: &str,
        md5: &str,
        caller_id: &str,
        persistent: bool,
    ) -> Self {
        let mut header = Self::new();
        header.set("service", service);
        header.set("type", type_name);
        header.set("md5sum", md5);
        header.set("callerid", caller_id);
        if persistent {
            header.set("persistent", "1");
        }
        header
    }

    /// Header sent back by a service provider accepting a caller.
    pub fn for_service_provision(type_name: &str, md5: &str, caller_id: &str) -> Self {
        let mut header = Self::new();
        header.set("type", type_name);
        header.set("md5sum", md5);
        header.set("callerid", caller_id);
        header
    }

    /// Error header sent before closing a rejected connection.
    pub fn for_error(reason: &str) -> Self {
        let mut header = Self::new();
        header.set("error", reason);
        header
    }

    /// Set a field.
    pub fn set(&mut self, key: &str, value: &str) {
        self.fields.insert(key.to_string(), value.to_string());
    }

    /// Get a field.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(|s| s.as_str())
    }

    /// The `topic` field.
    pub fn topic(&self) -> Option<&str> {
        self.get("topic")
    }

    /// The `service` field.
    pub fn service(&self) -> Option<&str> {
        self.get("service")
    }

    /// The `type` field.
    pub fn type_name(&self) -> Option<&str> {
        self.get("type")
    }

    /// The `md5sum` field.
    pub fn md5sum(&self) -> Option<&str> {
        self.get("md5sum")
    }

    /// The `callerid` field.
    pub fn caller_id(&self) -> Option<&str> {
        self.get("callerid")
    }

    /// The `error` field carried by a rejection.
    pub fn error(&self) -> Option<&str> {
        self.get("error")
    }

    /// True when `latching=1`.
    pub fn latching(&self) -> bool {
        self.get("latching") == Some("1")
    }

    /// True when `persistent=1`.
    pub fn persistent(&self) -> bool {
        self.get("persistent") == Some("1")
    }

    /// Encode into the wire layout, outer length prefix included.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(128);
        for (key, value) in &self.fields {
            let field_len = key.len() + 1 + value.len();
            body.extend_from_slice(&(field_len as u32).to_le_bytes());
            body.extend_from_slice(key.as_bytes());
            body.push(b'=');
            body.extend_from_slice(value.as_bytes());
        }
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Try to decode one header block from the front of `buf`.
    ///
    /// Returns `Ok(None)` while the block is still incomplete; on success the
    /// block is consumed from the buffer.
    pub fn try_decode(buf: &mut ByteBuffer) -> RosResult<Option<ConnectionHeader>> {
        let total = match buf.peek_u32_le() {
            Some(n) => n as usize,
            None => return Ok(None),
        };
        if total > MAX_HEADER_LEN {
            return Err(ErrorPack::new(ErrorKind::ProtocolMalformed));
        }
        if buf.len() < 4 + total {
            return Ok(None);
        }

        buf.consume(4);
        let block = buf.take(total).expect("length checked above");

        let mut fields = BTreeMap::new();
        let mut at = 0usize;
        while at < block.len() {
            if block.len() - at < 4 {
                return Err(ErrorPack::new(ErrorKind::ProtocolMalformed));
            }
            let len = u32::from_le_bytes([
                block[at],
                block[at + 1],
                block[at + 2],
                block[at + 3],
            ]) as usize;
            at += 4;
            if len == 0 || block.len() - at < len {
                return Err(ErrorPack::new(ErrorKind::ProtocolMalformed));
            }
            let field = std::str::from_utf8(&block[at..at + len])
                .map_err(|_| ErrorPack::new(ErrorKind::ProtocolMalformed))?;
            at += len;

            let (key, value) = field
                .split_once('=')
                .ok_or_else(|| ErrorPack::new(ErrorKind::ProtocolMalformed))?;
            fields.insert(key.to_string(), value.to_string());
        }

        Ok(Some(ConnectionHeader { fields }))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let header = ConnectionHeader::for_subscription(
            "/chatter",
            "std_msgs/String",
            "992ce8a1687cec8c8bd883ec73ca41d1",
            "/listener",
        );

        let mut buf = ByteBuffer::new();
        buf.append(&header.encode());

        let decoded = ConnectionHeader::try_decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, header);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_accessors() {
        let header = ConnectionHeader::for_subscription("/t", "p/T", "abc", "/me");
        assert_eq!(header.topic(), Some("/t"));
        assert_eq!(header.type_name(), Some("p/T"));
        assert_eq!(header.md5sum(), Some("abc"));
        assert_eq!(header.caller_id(), Some("/me"));
        assert!(!header.latching());
        assert!(header.service().is_none());
    }

    #[test]
    fn test_publication_latching_flag() {
        let header = ConnectionHeader::for_publication("p/T", "abc", "/pub", true);
        assert!(header.latching());

        let header = ConnectionHeader::for_publication("p/T", "abc", "/pub", false);
        assert!(!header.latching());
    }

    #[test]
    fn test_service_persistent_flag() {
        let header = ConnectionHeader::for_service_call("/sum", "p/S", "abc", "/c", true);
        assert!(header.persistent());

        let header = ConnectionHeader::for_service_call("/sum", "p/S", "abc", "/c", false);
        assert!(!header.persistent());
    }

    #[test]
    fn test_incremental_decode() {
        let header = ConnectionHeader::for_error("boom");
        let raw = header.encode();

        let mut buf = ByteBuffer::new();
        for (i, byte) in raw.iter().enumerate() {
            buf.append(&[*byte]);
            let result = ConnectionHeader::try_decode(&mut buf).unwrap();
            if i + 1 < raw.len() {
                assert!(result.is_none());
            } else {
                assert_eq!(result.unwrap().error(), Some("boom"));
            }
        }
    }

    #[test]
    fn test_value_may_contain_equals() {
        let mut header = ConnectionHeader::new();
        header.set("message_definition", "string data=x");
        let mut buf = ByteBuffer::new();
        buf.append(&header.encode());

        let decoded = ConnectionHeader::try_decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.get("message_definition"), Some("string data=x"));
    }

    #[test]
    fn test_oversized_header_rejected() {
        let mut buf = ByteBuffer::new();
        buf.append(&(MAX_HEADER_LEN as u32 + 1).to_le_bytes());

        let err = ConnectionHeader::try_decode(&mut buf).unwrap_err();
        assert_eq!(err.first(), ErrorKind::ProtocolMalformed);
    }

    #[test]
    fn test_malformed_field_rejected() {
        // One field of 3 bytes with no '=' separator.
        let mut buf = ByteBuffer::new();
        buf.append(&7u32.to_le_bytes());
        buf.append(&3u32.to_le_bytes());
        buf.append(b"abc");

        let err = ConnectionHeader::try_decode(&mut buf).unwrap_err();
        assert_eq!(err.first(), ErrorKind::ProtocolMalformed);
    }

    #[test]
    fn test_field_length_overrun_rejected() {
        // Inner field length claims more bytes than the block holds.
        let mut buf = ByteBuffer::new();
        buf.append(&8u32.to_le_bytes());
        buf.append(&100u32.to_le_bytes());
        buf.append(b"a=b\0");

        assert!(ConnectionHeader::try_decode(&mut buf).is_err());
    }

    #[test]
    fn test_leaves_following_bytes() {
        let header = ConnectionHeader::for_error("x");
        let mut buf = ByteBuffer::new();
        buf.append(&header.encode());
        buf.append(b"tail");

        let _ = ConnectionHeader::try_decode(&mut buf).unwrap().unwrap();
        assert_eq!(buf.as_slice(), b"tail");
    }
}
