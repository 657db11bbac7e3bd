// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ErrorKind, ErrorPack, RosResult};

/// Default master port.
pub const DEFAULT_MASTER_PORT: u16 = 11311;

/// Configuration for a [`Node`](crate::node::Node).
///
/// All fields have workable defaults except the node name and the
/// message-database root.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Slash-prefixed node name, e.g. `/talker`.
    pub name: String,

    /// Master endpoint.
    pub master_host: String,
    pub master_port: u16,

    /// Host advertised to the master and to peers.
    pub host: String,

    /// Negotiation (XML-RPC) listen port; 0 picks an ephemeral port.
    pub xmlrpc_port: u16,

    /// Data (framed protocol) listen port; 0 picks an ephemeral port.
    pub tcpros_port: u16,

    /// Root of the on-disk message definition tree.
    pub msg_db_root: PathBuf,

    /// Per-RPC-call deadline.
    pub call_timeout: Duration,

    /// Idle timeout after which a silent peer is considered dead.
    pub peer_idle_timeout: Duration,

    /// Registry capacities.
    pub max_publishers: usize,
    pub max_subscribers: usize,
    pub max_providers: usize,
    pub max_callers: usize,
    pub max_peers: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            master_host: "127.0.0.1".to_string(),
            master_port: DEFAULT_MASTER_PORT,
            host: "127.0.0.1".to_string(),
            xmlrpc_port: 0,
            tcpros_port: 0,
            msg_db_root: PathBuf::new(),
            call_timeout: Duration::from_secs(5),
            peer_idle_timeout: Duration::from_secs(60),
            max_publishers: 32,
            max_subscribers: 32,
            max_providers: 32,
            max_callers: 32,
            max_peers: 128,
        }
    }
}

impl NodeConfig {
    /// Start a config for a named node against the default local master.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the master endpoint.
    pub fn master(mut self, host: impl Into<String>, port: u16) -> Self {
        self.master_host = host.into();
        self.master_port = port;
        self
    }

    /// Set the advertised host.
    pub fn advertised_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the message-database root.
    pub fn msg_db(mut self, root: impl Into<PathBuf>) -> Self {
        self.msg_db_root = root.into();
        self
    }

    /// Pin the listen ports (0 = ephemeral).
    pub fn ports(mut self, xmlrpc: u16, tcpros: u16) -> Self {
        self.xmlrpc_port = xmlrpc;
        self.tcpros_port = tcpros;
        self
    }

    /// Set the per-call deadline.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Check the config for obvious mistakes.
    pub fn validate(&self) -> RosResult<()> {
        if !self.name.starts_with('/') || self.name.len() < 2 {
            return Err(ErrorPack::new(ErrorKind::BadArgument));
        }
        if self.master_host.is_empty() || self.host.is_empty() {
            return Err(ErrorPack::new(ErrorKind::BadArgument));
        }
        Ok(())
    }

    /// The master URI, `http://host:port/`.
    pub fn master_uri(&self) -> String {
        format!("http://{}:{}/", self.master_host, self.master_port)
    }
}

// ============================================================================
// Tests
// ============================================================================
