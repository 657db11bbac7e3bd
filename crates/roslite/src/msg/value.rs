// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Field values and message instances.

use std::sync::Arc;

use super::schema::{ArraySpec, FieldType, MessageSchema};
use crate::error::{ErrorKind, ErrorPack, RosResult};

/// A single field's value.
///
/// Tagged union over the closed set of wire kinds: the fixed-width integers,
/// floats, bool, string, time, duration, nested message, and arrays of any
/// of these.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    /// Wall-clock stamp: seconds + nanoseconds, both unsigned.
    Time { secs: u32, nsecs: u32 },
    /// Signed span: seconds + nanoseconds.
    Duration { secs: i32, nsecs: i32 },
    Nested(Message),
    Array(Vec<FieldValue>),
}

impl FieldValue {
    /// Default value for a scalar of the given type.
    pub fn default_for(ty: &FieldType) -> FieldValue {
        match ty {
            FieldType::Bool => FieldValue::Bool(false),
            FieldType::I8 => FieldValue::I8(0),
            FieldType::I16 => FieldValue::I16(0),
            FieldType::I32 => FieldValue::I32(0),
            FieldType::I64 => FieldValue::I64(0),
            FieldType::U8 => FieldValue::U8(0),
            FieldType::U16 => FieldValue::U16(0),
            FieldType::U32 => FieldValue::U32(0),
            FieldType::U64 => FieldValue::U64(0),
            FieldType::F32 => FieldValue::F32(0.0),
            FieldType::F64 => FieldValue::F64(0.0),
            FieldType::String => FieldValue::String(String::new()),
            FieldType::Time => FieldValue::Time { secs: 0, nsecs: 0 },
            FieldType::Duration => FieldValue::Duration { secs: 0, nsecs: 0 },
            FieldType::Nested(schema) => FieldValue::Nested(Message::from_schema(schema.clone())),
        }
    }

    /// Try to get as bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Try to get as i32.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::I32(v) => Some(*v),
            _ => None,
        }
    }

    /// Try to get as i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Try to get as f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// Try to get as string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    /// Try to get as array slice.
    pub fn as_array(&self) -> Option<&[FieldValue]> {
        match self {
            Self::Array(v) => Some(v),
            _ => None,
        }
    }

    /// Try to get as nested message.
    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Self::Nested(m) => Some(m),
            _ => None,
        }
    }

    /// True when this value's shape matches the scalar type `ty`.
    pub fn matches(&self, ty: &FieldType) -> bool {
        matches!(
            (self, ty),
            (FieldValue::Bool(_), FieldType::Bool)
                | (FieldValue::I8(_), FieldType::I8)
                | (FieldValue::I16(_), FieldType::I16)
                | (FieldValue::I32(_), FieldType::I32)
                | (FieldValue::I64(_), FieldType::I64)
                | (FieldValue::U8(_), FieldType::U8)
                | (FieldValue::U16(_), FieldType::U16)
                | (FieldValue::U32(_), FieldType::U32)
                | (FieldValue::U64(_), FieldType::U64)
                | (FieldValue::F32(_), FieldType::F32)
                | (FieldValue::F64(_), FieldType::F64)
                | (FieldValue::String(_), FieldType::String)
                | (FieldValue::Time { .. }, FieldType::Time)
                | (FieldValue::Duration { .. }, FieldType::Duration)
                | (FieldValue::Nested(_), FieldType::Nested(_))
        )
    }
}

// ============================================================================
// Message
// ============================================================================

/// A message instance: a template reference plus one value per field.
///
/// Values sit in declaration order, parallel to the schema's field list.
/// Lookup is by name with a linear scan; typical messages have under 16
/// fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    schema: Arc<MessageSchema>,
    values: Vec<FieldValue>,
}

impl Message {
    /// Clone the template into a fresh instance with default values.
    pub fn from_schema(schema: Arc<MessageSchema>) -> Self {
        let values = schema
            .fields()
            .iter()
            .map(|field| match field.array {
                ArraySpec::Scalar => FieldValue::default_for(&field.ty),
                ArraySpec::Variable => FieldValue::Array(Vec::new()),
                ArraySpec::Fixed(n) => {
                    FieldValue::Array(vec![FieldValue::default_for(&field.ty); n])
                }
            })
            .collect();
        Self { schema, values }
    }

    /// The template this instance was cloned from.
    pub fn schema(&self) -> &Arc<MessageSchema> {
        &self.schema
    }

    /// Fully qualified type name (`pkg/Type`).
    pub fn type_name(&self) -> &str {
        self.schema.type_name()
    }

    /// Values in declaration order.
    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    /// Look up a field value by name.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        let idx = self.schema.field_index(name)?;
        Some(&self.values[idx])
    }

    /// Look up a field value by name, mutably.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut FieldValue> {
        let idx = self.schema.field_index(name)?;
        Some(&mut self.values[idx])
    }

    /// Set a field by name, checking the value against the declared type.
    pub fn set(&mut self, name: &str, value: FieldValue) -> RosResult<()> {
        let idx = self
            .schema
            .field_index(name)
            .ok_or_else(|| ErrorPack::new(ErrorKind::BadArgument))?;
        let field = &self.schema.fields()[idx];

        let shape_ok = match field.array {
            ArraySpec::Scalar => value.matches(&field.ty),
            ArraySpec::Variable => matches!(value, FieldValue::Array(_)),
            ArraySpec::Fixed(n) => match &value {
                FieldValue::Array(items) => items.len() == n,
                _ => false,
            },
        };
        if !shape_ok {
            return Err(ErrorPack::new(ErrorKind::BadArgument));
        }
        if let FieldValue::Array(items) = &value {
            if items.iter().any(|item| !item.matches(&field.ty)) {
                return Err(ErrorPack::new(ErrorKind::BadArgument));
            }
        }

        self.values[idx] = value;
        Ok(())
    }

    /// Convenience: set a string field.
    pub fn set_str(&mut self, name: &str, value: &str) -> RosResult<()> {
        self.set(name, FieldValue::String(value.to_string()))
    }

    /// Convenience: set an i64 field.
    pub fn set_i64(&mut self, name: &str, value: i64) -> RosResult<()> {
        self.set(name, FieldValue::I64(value))
    }

    /// Convenience: set an i32 field.
    pub fn set_i32(&mut self, name: &str, value: i32) -> RosResult<()> {
        self.set(name, FieldValue::I32(value))
    }

    /// Convenience: set an f64 field.
    pub fn set_f64(&mut self, name: &str, value: f64) -> RosResult<()> {
        self.set(name, FieldValue::F64(value))
    }

    /// Convenience: read a string field.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.as_str())
    }

    /// Convenience: read an i64 field.
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(|v| v.as_i64())
    }

    /// Replace all values (used by the decoder; lengths must match).
    pub(crate) fn set_values(&mut self, values: Vec<FieldValue>) {
        debug_assert_eq!(values.len(), self.schema.fields().len());
        self.values = values;
    }
}

// ============================================================================
// Tests
// ============================================================================
