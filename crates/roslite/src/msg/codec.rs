// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Little-endian wire codec for message field trees.
//!
//! Serialization walks the template's declaration order: integers and floats
//! little-endian, strings as 4-byte length + bytes, variable arrays as
//! 4-byte count + elements, fixed arrays as bare elements, nested messages
//! inlined. Deserialization walks the same order and populates a clone of
//! the template.
//!
//! The payload here is the frame body only; the peer channel adds the
//! 4-byte outer length prefix.

use std::sync::Arc;

use super::schema::{ArraySpec, FieldDescriptor, FieldType, MessageSchema};
use super::value::{FieldValue, Message};
use crate::error::{ErrorKind, ErrorPack, RosResult};

/// Largest encodable string/array length; anything at or above is rejected.
pub const MAX_WIRE_LEN: usize = i32::MAX as usize;

/// Serialize a message into `out`.
pub fn encode_message(msg: &Message, out: &mut Vec<u8>) -> RosResult<()> {
    for (field, value) in msg.schema().fields().iter().zip(msg.values()) {
        encode_field(field, value, out)?;
    }
    Ok(())
}

/// Serialize a message into a fresh buffer.
pub fn message_to_bytes(msg: &Message) -> RosResult<Vec<u8>> {
    let mut out = Vec::with_capacity(64);
    encode_message(msg, &mut out)?;
    Ok(out)
}

/// Deserialize a payload against a template.
///
/// The whole payload must be consumed; trailing bytes are a protocol error.
pub fn decode_message(schema: &Arc<MessageSchema>, bytes: &[u8]) -> RosResult<Message> {
    let mut reader = Reader::new(bytes);
    let msg = decode_with(schema, &mut reader)?;
    if !reader.is_empty() {
        return Err(ErrorPack::new(ErrorKind::ProtocolMalformed));
    }
    Ok(msg)
}

fn encode_field(field: &FieldDescriptor, value: &FieldValue, out: &mut Vec<u8>) -> RosResult<()> {
    match field.array {
        ArraySpec::Scalar => encode_scalar(&field.ty, value, out),
        ArraySpec::Variable => {
            let items = value
                .as_array()
                .ok_or_else(|| ErrorPack::new(ErrorKind::InternalInvariant))?;
            if items.len() >= MAX_WIRE_LEN {
                return Err(ErrorPack::new(ErrorKind::BadArgument));
            }
            out.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                encode_scalar(&field.ty, item, out)?;
            }
            Ok(())
        }
        ArraySpec::Fixed(n) => {
            let items = value
                .as_array()
                .ok_or_else(|| ErrorPack::new(ErrorKind::InternalInvariant))?;
            if items.len() != n {
                return Err(ErrorPack::new(ErrorKind::InternalInvariant));
            }
            for item in items {
                encode_scalar(&field.ty, item, out)?;
            }
            Ok(())
        }
    }
}

fn encode_scalar(ty: &FieldType, value: &FieldValue, out: &mut Vec<u8>) -> RosResult<()> {
    match (ty, value) {
        (FieldType::Bool, FieldValue::Bool(v)) => out.push(u8::from(*v)),
        (FieldType::I8, FieldValue::I8(v)) => out.push(*v as u8),
        (FieldType::U8, FieldValue::U8(v)) => out.push(*v),
        (FieldType::I16, FieldValue::I16(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (FieldType::U16, FieldValue::U16(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (FieldType::I32, FieldValue::I32(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (FieldType::U32, FieldValue::U32(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (FieldType::I64, FieldValue::I64(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (FieldType::U64, FieldValue::U64(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (FieldType::F32, FieldValue::F32(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (FieldType::F64, FieldValue::F64(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (FieldType::String, FieldValue::String(v)) => {
            if v.len() >= MAX_WIRE_LEN {
                return Err(ErrorPack::new(ErrorKind::BadArgument));
            }
            out.extend_from_slice(&(v.len() as u32).to_le_bytes());
            out.extend_from_slice(v.as_bytes());
        }
        (FieldType::Time, FieldValue::Time { secs, nsecs }) => {
            out.extend_from_slice(&secs.to_le_bytes());
            out.extend_from_slice(&nsecs.to_le_bytes());
        }
        (FieldType::Duration, FieldValue::Duration { secs, nsecs }) => {
            out.extend_from_slice(&secs.to_le_bytes());
            out.extend_from_slice(&nsecs.to_le_bytes());
        }
        (FieldType::Nested(_), FieldValue::Nested(nested)) => {
            encode_message(nested, out)?;
        }
        _ => return Err(ErrorPack::new(ErrorKind::InternalInvariant)),
    }
    Ok(())
}

fn decode_with(schema: &Arc<MessageSchema>, reader: &mut Reader) -> RosResult<Message> {
    let mut values = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        values.push(decode_field(field, reader)?);
    }
    let mut msg = Message::from_schema(schema.clone());
    msg.set_values(values);
    Ok(msg)
}

fn decode_field(field: &FieldDescriptor, reader: &mut Reader) -> RosResult<FieldValue> {
    match field.array {
        ArraySpec::Scalar => decode_scalar(&field.ty, reader),
        ArraySpec::Variable => {
            let count = reader.read_u32()? as usize;
            if count >= MAX_WIRE_LEN {
                return Err(ErrorPack::new(ErrorKind::ProtocolMalformed));
            }
            let mut items = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                items.push(decode_scalar(&field.ty, reader)?);
            }
            Ok(FieldValue::Array(items))
        }
        ArraySpec::Fixed(n) => {
            let mut items = Vec::with_capacity(n);
            for _ in 0..n {
                items.push(decode_scalar(&field.ty, reader)?);
            }
            Ok(FieldValue::Array(items))
        }
    }
}

fn decode_scalar(ty: &FieldType, reader: &mut Reader) -> RosResult<FieldValue> {
    Ok(match ty {
        FieldType::Bool => FieldValue::Bool(reader.read_u8()? != 0),
        FieldType::I8 => FieldValue::I8(reader.read_u8()? as i8),
        FieldType::U8 => FieldValue::U8(reader.read_u8()?),
        FieldType::I16 => FieldValue::I16(i16::from_le_bytes(reader.read_array()?)),
        FieldType::U16 => FieldValue::U16(u16::from_le_bytes(reader.read_array()?)),
        FieldType::I32 => FieldValue::I32(i32::from_le_bytes(reader.read_array()?)),
        FieldType::U32 => FieldValue::U32(reader.read_u32()?),
        FieldType::I64 => FieldValue::I64(i64::from_le_bytes(reader.read_array()?)),
        FieldType::U64 => FieldValue::U64(u64::from_le_bytes(reader.read_array()?)),
        FieldType::F32 => FieldValue::F32(f32::from_le_bytes(reader.read_array()?)),
        FieldType::F64 => FieldValue::F64(f64::from_le_bytes(reader.read_array()?)),
        FieldType::String => {
            let len = reader.read_u32()? as usize;
            if len >= MAX_WIRE_LEN {
                return Err(ErrorPack::new(ErrorKind::ProtocolMalformed));
            }
            let bytes = reader.read_bytes(len)?;
            let text = String::from_utf8(bytes.to_vec())
                .map_err(|_| ErrorPack::new(ErrorKind::ProtocolMalformed))?;
            FieldValue::String(text)
        }
        FieldType::Time => FieldValue::Time {
            secs: reader.read_u32()?,
            nsecs: reader.read_u32()?,
        },
        FieldType::Duration => FieldValue::Duration {
            secs: i32::from_le_bytes(reader.read_array()?),
            nsecs: i32::from_le_bytes(reader.read_array()?),
        },
        FieldType::Nested(nested) => FieldValue::Nested(decode_with(nested, reader)?),
    })
}

// ============================================================================
// Reader
// ============================================================================

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn read_u8(&mut self) -> RosResult<u8> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| ErrorPack::new(ErrorKind::ProtocolMalformed))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u32(&mut self) -> RosResult<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    fn read_bytes(&mut self, n: usize) -> RosResult<&'a [u8]> {
        if self.bytes.len() - self.pos < n {
            return Err(ErrorPack::new(ErrorKind::ProtocolMalformed));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> RosResult<[u8; N]> {
        let slice = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }
}

// ============================================================================
// Tests
// ============================================================================
