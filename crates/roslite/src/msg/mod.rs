// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Self-describing typed messages.
//!
//! A message is a recursive tree of typed fields. Templates
//! ([`MessageSchema`]) are built once per registered type from the on-disk
//! definition database and cloned per use; instances ([`Message`]) carry the
//! values and serialize against the template's declaration order.
//!
//! - [`value`] - the [`FieldValue`] tagged union and typed accessors
//! - [`schema`] - field descriptors, templates, the `.msg`/`.srv` loader,
//!   and the type-level MD5 digest
//! - [`codec`] - the little-endian wire format

pub mod codec;
pub mod schema;
pub mod value;

pub use schema::{
    ArraySpec, FieldDescriptor, FieldType, MessageSchema, MsgRegistry, SchemaSource,
    ServiceSchema,
};
pub use value::{FieldValue, Message};
