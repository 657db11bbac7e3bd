// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! XML-RPC value model, document codec, and HTTP/1.1 framing.
//!
//! The master API and the peer negotiation API both speak XML-RPC carried
//! over HTTP POST. This module owns the three layers:
//!
//! - [`value`] - the closed set of parameter types (int, double, boolean,
//!   string, array, struct)
//! - [`codec`] - method-call / method-response / fault documents
//! - [`http`] - minimal incremental HTTP framing over a [`ByteBuffer`]
//!
//! [`ByteBuffer`]: crate::buffer::ByteBuffer

pub mod codec;
pub mod http;
pub mod value;

pub use codec::{decode_request, decode_response, encode_request, encode_response, Fault};
pub use http::{HttpRequestParser, HttpResponseParser, ParseStatus};
pub use value::XmlRpcValue;
