// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! XML-RPC method-call and method-response documents.
//!
//! Encoding builds the document as a string; decoding goes through
//! `roxmltree`. Responses may carry a `<fault>` instead of `<params>`, which
//! decodes to a typed [`Fault`].

use std::collections::BTreeMap;
use std::fmt;

use roxmltree::{Document, Node};

use super::value::{escape_into, XmlRpcValue};
use crate::error::{ErrorKind, ErrorPack};

/// A decoded `<fault>` response.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    pub code: i32,
    pub message: String,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fault {}: {}", self.code, self.message)
    }
}

/// Encode a `<methodCall>` document.
pub fn encode_request(method: &str, params: &[XmlRpcValue]) -> String {
    let mut out = String::with_capacity(256);
    out.push_str("<?xml version=\"1.0\"?>\n<methodCall><methodName>");
    escape_into(method, &mut out);
    out.push_str("</methodName><params>");
    for param in params {
        out.push_str("<param>");
        param.write_xml(&mut out);
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>\n");
    out
}

/// Encode a `<methodResponse>` document.
///
/// `Ok(params)` becomes a `<params>` block; `Err(fault)` becomes a
/// `<fault>` struct with the standard faultCode/faultString members.
pub fn encode_response(result: Result<&[XmlRpcValue], &Fault>) -> String {
    let mut out = String::with_capacity(256);
    out.push_str("<?xml version=\"1.0\"?>\n<methodResponse>");
    match result {
        Ok(params) => {
            out.push_str("<params>");
            for param in params {
                out.push_str("<param>");
                param.write_xml(&mut out);
                out.push_str("</param>");
            }
            out.push_str("</params>");
        }
        Err(fault) => {
            out.push_str("<fault>");
            let mut members = BTreeMap::new();
            members.insert("faultCode".to_string(), XmlRpcValue::Int(fault.code));
            members.insert(
                "faultString".to_string(),
                XmlRpcValue::String(fault.message.clone()),
            );
            XmlRpcValue::Struct(members).write_xml(&mut out);
            out.push_str("</fault>");
        }
    }
    out.push_str("</methodResponse>\n");
    out
}

/// Decode a `<methodCall>` document into (method name, parameters).
pub fn decode_request(xml: &str) -> Result<(String, Vec<XmlRpcValue>), ErrorPack> {
    let doc = Document::parse(xml).map_err(|_| ErrorPack::new(ErrorKind::ProtocolMalformed))?;
    let root = doc.root_element();
    if root.tag_name().name() != "methodCall" {
        return Err(ErrorPack::new(ErrorKind::ProtocolMalformed));
    }

    let method = root
        .children()
        .find(|n| n.tag_name().name() == "methodName")
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .ok_or_else(|| ErrorPack::new(ErrorKind::ProtocolMalformed))?;

    let params = match root.children().find(|n| n.tag_name().name() == "params") {
        Some(params_node) => decode_params(&params_node)?,
        None => Vec::new(),
    };

    Ok((method, params))
}

/// Decode a `<methodResponse>` document.
///
/// Returns `Ok(Ok(params))` for a params response, `Ok(Err(fault))` for a
/// fault response, and an error pack when the document itself is malformed.
pub fn decode_response(xml: &str) -> Result<Result<Vec<XmlRpcValue>, Fault>, ErrorPack> {
    let doc = Document::parse(xml).map_err(|_| ErrorPack::new(ErrorKind::ProtocolMalformed))?;
    let root = doc.root_element();
    if root.tag_name().name() != "methodResponse" {
        return Err(ErrorPack::new(ErrorKind::ProtocolMalformed));
    }

    if let Some(params_node) = root.children().find(|n| n.tag_name().name() == "params") {
        return Ok(Ok(decode_params(&params_node)?));
    }

    if let Some(fault_node) = root.children().find(|n| n.tag_name().name() == "fault") {
        let value_node = fault_node
            .children()
            .find(|n| n.tag_name().name() == "value")
            .ok_or_else(|| ErrorPack::new(ErrorKind::ProtocolMalformed))?;
        let value = decode_value(&value_node)?;
        let code = value
            .get("faultCode")
            .and_then(|v| v.as_int())
            .unwrap_or(-1);
        let message = value
            .get("faultString")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        return Ok(Err(Fault { code, message }));
    }

    Err(ErrorPack::new(ErrorKind::ProtocolMalformed))
}

fn decode_params(params_node: &Node) -> Result<Vec<XmlRpcValue>, ErrorPack> {
    let mut out = Vec::new();
    for param in params_node
        .children()
        .filter(|n| n.tag_name().name() == "param")
    {
        let value_node = param
            .children()
            .find(|n| n.tag_name().name() == "value")
            .ok_or_else(|| ErrorPack::new(ErrorKind::ProtocolMalformed))?;
        out.push(decode_value(&value_node)?);
    }
    Ok(out)
}

fn decode_value(value_node: &Node) -> Result<XmlRpcValue, ErrorPack> {
    let malformed = || ErrorPack::new(ErrorKind::ProtocolMalformed);

    // A <value> with no element child is an untyped string per the protocol.
    let typed = value_node.children().find(|n| n.is_element());
    let typed = match typed {
        Some(node) => node,
        None => {
            let text = value_node.text().unwrap_or("");
            return Ok(XmlRpcValue::String(text.to_string()));
        }
    };

    match typed.tag_name().name() {
        "i4" | "int" => {
            let text = typed.text().unwrap_or("").trim();
            text.parse::<i32>()
                .map(XmlRpcValue::Int)
                .map_err(|_| malformed())
        }
        "double" => {
            let text = typed.text().unwrap_or("").trim();
            text.parse::<f64>()
                .map(XmlRpcValue::Double)
                .map_err(|_| malformed())
        }
        "boolean" => match typed.text().unwrap_or("").trim() {
            "1" => Ok(XmlRpcValue::Bool(true)),
            "0" => Ok(XmlRpcValue::Bool(false)),
            _ => Err(malformed()),
        },
        "string" => Ok(XmlRpcValue::String(
            typed.text().unwrap_or("").to_string(),
        )),
        "array" => {
            let data = typed
                .children()
                .find(|n| n.tag_name().name() == "data")
                .ok_or_else(malformed)?;
            let mut items = Vec::new();
            for item in data.children().filter(|n| n.tag_name().name() == "value") {
                items.push(decode_value(&item)?);
            }
            Ok(XmlRpcValue::Array(items))
        }
        "struct" => {
            let mut members = BTreeMap::new();
            for member in typed.children().filter(|n| n.tag_name().name() == "member") {
                let name = member
                    .children()
                    .find(|n| n.tag_name().name() == "name")
                    .and_then(|n| n.text())
                    .ok_or_else(malformed)?
                    .to_string();
                let value_node = member
                    .children()
                    .find(|n| n.tag_name().name() == "value")
                    .ok_or_else(malformed)?;
                members.insert(name, decode_value(&value_node)?);
            }
            Ok(XmlRpcValue::Struct(members))
        }
        _ => Err(malformed()),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let params = vec![
            XmlRpcValue::from("/talker"),
            XmlRpcValue::from("/chatter"),
            XmlRpcValue::Int(3),
        ];
        let xml = encode_request("registerPublisher", &params);

        let (method, decoded) = decode_request(&xml).unwrap();
        assert_eq!(method, "registerPublisher");
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_response_roundtrip() {
        let params = vec![XmlRpcValue::Array(vec![
            XmlRpcValue::Int(1),
            XmlRpcValue::from("ok"),
            XmlRpcValue::Array(vec![XmlRpcValue::from("http://host:1234/")]),
        ])];
        let xml = encode_response(Ok(&params));

        let decoded = decode_response(&xml).unwrap().unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_fault_roundtrip() {
        let fault = Fault {
            code: 4,
            message: "no such method".to_string(),
        };
        let xml = encode_response(Err(&fault));

        let decoded = decode_response(&xml).unwrap().unwrap_err();
        assert_eq!(decoded, fault);
    }

    #[test]
    fn test_nested_values_roundtrip() {
        let mut members = BTreeMap::new();
        members.insert("port".to_string(), XmlRpcValue::Int(40000));
        members.insert(
            "uris".to_string(),
            XmlRpcValue::Array(vec![XmlRpcValue::from("a"), XmlRpcValue::from("b")]),
        );
        let params = vec![XmlRpcValue::Struct(members), XmlRpcValue::Double(1.5)];
        let xml = encode_request("m", &params);

        let (_, decoded) = decode_request(&xml).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_empty_string_roundtrip() {
        let params = vec![XmlRpcValue::from("")];
        let xml = encode_request("m", &params);

        let (_, decoded) = decode_request(&xml).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_escaped_characters_roundtrip() {
        let params = vec![XmlRpcValue::from("a<b>&\"c'")];
        let xml = encode_request("m", &params);

        let (_, decoded) = decode_request(&xml).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_untyped_value_is_string() {
        let xml = "<?xml version=\"1.0\"?><methodCall><methodName>m</methodName>\
                   <params><param><value>plain</value></param></params></methodCall>";
        let (_, params) = decode_request(xml).unwrap();
        assert_eq!(params, vec![XmlRpcValue::from("plain")]);
    }

    #[test]
    fn test_malformed_document_rejected() {
        assert!(decode_request("<not xml").is_err());
        assert!(decode_request("<wrongRoot/>").is_err());
        assert!(decode_response("<methodResponse/>").is_err());
    }

    #[test]
    fn test_bad_scalar_rejected() {
        let xml = "<?xml version=\"1.0\"?><methodCall><methodName>m</methodName>\
                   <params><param><value><i4>abc</i4></value></param></params></methodCall>";
        let err = decode_request(xml).unwrap_err();
        assert!(err.contains(crate::error::ErrorKind::ProtocolMalformed));
    }

    #[test]
    fn test_request_without_params() {
        let xml =
            "<?xml version=\"1.0\"?><methodCall><methodName>getPid</methodName></methodCall>";
        let (method, params) = decode_request(xml).unwrap();
        assert_eq!(method, "getPid");
        assert!(params.is_empty());
    }
}
