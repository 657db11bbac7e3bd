// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Test fixtures shared by the node-layer test modules.

use std::sync::Arc;

use super::Node;
use crate::config::NodeConfig;
use crate::error::{ErrorKind, ErrorPack, RosResult};
use crate::msg::{MessageSchema, SchemaSource, ServiceSchema};

/// Schema source serving a couple of canned definitions, no disk.
pub(crate) struct CannedSchemas;

impl SchemaSource for CannedSchemas {
    fn message(&mut self, type_name: &str) -> RosResult<Arc<MessageSchema>> {
        match type_name {
            "std_msgs/String" => {
                MessageSchema::parse(type_name, "string data\n", &mut |_| unreachable!())
            }
            _ => Err(ErrorPack::new(ErrorKind::BadArgument)),
        }
    }

    fn service(&mut self, type_name: &str) -> RosResult<ServiceSchema> {
        match type_name {
            "roscpp_tutorials/TwoInts" => {
                let request = MessageSchema::parse(
                    "roscpp_tutorials/TwoIntsRequest",
                    "int64 a\nint64 b\n",
                    &mut |_| unreachable!(),
                )?;
                let response = MessageSchema::parse(
                    "roscpp_tutorials/TwoIntsResponse",
                    "int64 sum\n",
                    &mut |_| unreachable!(),
                )?;
                Ok(ServiceSchema {
                    type_name: type_name.to_string(),
                    md5: "canned".to_string(),
                    request,
                    response,
                })
            }
            _ => Err(ErrorPack::new(ErrorKind::BadArgument)),
        }
    }
}

/// A node over [`CannedSchemas`] with default config.
pub(crate) fn test_node() -> Node {
    test_node_named("/test_node")
}

/// A node over [`CannedSchemas`] with a chosen name.
pub(crate) fn test_node_named(name: &str) -> Node {
    let config = NodeConfig::new(name);
    Node::with_schema_source(config, Box::new(CannedSchemas)).unwrap()
}
