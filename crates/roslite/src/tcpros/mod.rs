// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The framed peer data protocol.
//!
//! Every topic or service connection starts with a header exchange (one
//! length-prefixed block of `key=value` fields per direction), then settles
//! into the data phase: 4-byte little-endian length + payload frames, with
//! service responses carrying a leading one-byte ok flag.
//!
//! - [`header`] - the connection-header codec and builders
//! - [`channel`] - the per-connection state machine

pub mod channel;
pub mod header;

pub use channel::{ChannelEvent, ChannelRole, ChannelState, PeerChannel, SendOutcome};
pub use header::ConnectionHeader;
