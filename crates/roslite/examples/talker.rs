// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Periodic publisher demo: advertises `/chatter` and publishes a counter.
//!
//! Usage: `talker <master-host> <master-port> <msg-db-root>`

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use roslite::{Node, NodeConfig, PublisherOptions};

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

    let config = NodeConfig::new("/talker")
        .master(master_host, master_port)
        .msg_db(msg_db);
    let mut node = Node::new(config)?;

    let mut counter = 0u64;
    let options = PublisherOptions {
        period_us: 1_000_000,
        fill: Some(Box::new(move |msg| {
            counter += 1;
            let _ = msg.set_str("data", &format!("hello world {}", counter));
        })),
        ..Default::default()
    };
    node.advertise("/chatter", "std_msgs/String", options)?;

    let exit = AtomicBool::new(false);
    node.run(Some(Duration::from_secs(60)), &exit)?;
    node.shutdown(Duration::from_secs(3))
}
