// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # roslite - a ROS1 client node runtime
//!
//! A pure Rust implementation of the ROS1 node side: master registration
//! over XML-RPC, peer negotiation RPC, the TCPROS framed data protocol, and
//! a single-threaded poll loop that owns every socket.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::atomic::AtomicBool;
//! use std::time::Duration;
//! use roslite::{Node, NodeConfig, PublisherOptions};
//!
//! fn main() -> Result<(), roslite::ErrorPack> {
//!     let config = NodeConfig::new("/talker")
//!         .master("127.0.0.1", 11311)
//!         .msg_db("/opt/ros/share");
//!     let mut node = Node::new(config)?;
//!
//!     let chatter = node.advertise("/chatter", "std_msgs/String", PublisherOptions::default())?;
//!     let mut msg = node.create_message(chatter)?;
//!     msg.set_str("data", "hello")?;
//!     node.publish(chatter, &msg)?;
//!
//!     let exit = AtomicBool::new(false);
//!     node.run(Some(Duration::from_secs(10)), &exit)?;
//!     node.shutdown(Duration::from_secs(3))
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +------------------------------------------------------------------+
//! |                        Application Layer                         |
//! |    advertise / subscribe / advertise_service / service_caller    |
//! +------------------------------------------------------------------+
//! |                           Node Layer                             |
//! |   Registries | API call queue | Completion routing | Timers      |
//! +------------------------------------------------------------------+
//! |                         Protocol Layer                           |
//! |   XML-RPC (master + peer negotiation) | TCPROS framed channels   |
//! +------------------------------------------------------------------+
//! |                         Event Loop                               |
//! |   mio poll | per-socket state machines | wake deadlines          |
//! +------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Node`] | One process's participation: sockets, registries, loop |
//! | [`NodeConfig`] | Master endpoint, advertised host, ports, timeouts |
//! | [`Message`] | A field tree cloned from a type template |
//! | [`SlotRef`] | Generation-checked registry index |
//! | [`ErrorPack`] | Up to four layered error kinds in one value |
//!
//! ## Threading model
//!
//! The core is single-threaded and cooperative: every callback runs on the
//! thread inside [`Node::run`], never re-entrantly. The only supported
//! cross-thread interaction is setting the exit flag (an `AtomicBool`).

/// Master/peer API calls: method codes, queue, client engine.
pub mod api;
/// Generational slot arenas backing the registries and peer tables.
pub mod arena;
/// Byte buffers for the non-blocking state machines.
pub mod buffer;
/// Monotonic clock and drift-free periodic schedules.
pub mod clock;
/// Node configuration.
pub mod config;
/// Packed error values.
pub mod error;
/// Typed messages: templates, instances, wire codec, definition loader.
pub mod msg;
/// The node, its registries, and the event loop.
pub mod node;
/// The framed peer data protocol.
pub mod tcpros;
/// XML-RPC values, documents, and HTTP framing.
pub mod xmlrpc;

pub use arena::SlotRef;
pub use config::NodeConfig;
pub use error::{ErrorKind, ErrorPack, RosResult};
pub use msg::{FieldValue, Message, MsgRegistry, SchemaSource};
pub use node::slots::{
    CallerEvent, CallerOptions, PublisherOptions, ServiceHandler, SubscriberCallback,
};
pub use node::{wait_port_open, Node};

/// roslite version string.
pub const VERSION: &str = "0.3.0";
