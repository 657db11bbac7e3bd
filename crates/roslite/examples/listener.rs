// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscriber demo: prints whatever arrives on `/chatter`.
//!
//! Usage: `listener <master-host> <master-port> <msg-db-root>`

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use roslite::{Node, NodeConfig};

fn main() -> Result<(), roslite::ErrorPack> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let master_host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let master_port = args
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(11311);
    let msg_db = args.next().unwrap_or_else(|| ".".to_string());

    roslite::wait_port_open(&master_host, master_port, Duration::from_secs(10))?;

    let config = NodeConfig::new("/listener")
        .master(master_host, master_port)
        .msg_db(msg_db);
    let mut node = Node::new(config)?;

    node.subscribe(
        "/chatter",
        "std_msgs/String",
        Box::new(|msg| {
            println!("heard: {}", msg.get_str("data").unwrap_or("<no data>"));
        }),
    )?;

    let exit = AtomicBool::new(false);
    node.run(Some(Duration::from_secs(60)), &exit)?;
    node.shutdown(Duration::from_secs(3))
}
