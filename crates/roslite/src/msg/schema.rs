// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message templates, the definition-database loader, and type digests.
//!
//! A [`MessageSchema`] is built once per type from its textual definition
//! and cached; instances are cloned from it. The type-level MD5 digest is
//! computed from the canonical definition text: constants first, then fields
//! in declaration order, nested types represented by their own digest. Both
//! ends of a connection exchange the digest in headers and require an exact
//! match.
//!
//! The loader reads a directory tree rooted at a caller-supplied path:
//! `<root>/<pkg>/msg/<Type>.msg` and `<root>/<pkg>/srv/<Srv>.srv`. It is the
//! default [`SchemaSource`]; embedders with their own definition storage
//! implement the trait themselves.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use md5::{Digest, Md5};

use crate::error::{ErrorKind, ErrorPack, RosResult};

/// Scalar field types of the definition language.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    String,
    Time,
    Duration,
    /// Embedded message type.
    Nested(Arc<MessageSchema>),
}

impl FieldType {
    /// The definition-language spelling, used in canonical text.
    pub fn spelling(&self) -> &str {
        match self {
            FieldType::Bool => "bool",
            FieldType::I8 => "int8",
            FieldType::I16 => "int16",
            FieldType::I32 => "int32",
            FieldType::I64 => "int64",
            FieldType::U8 => "uint8",
            FieldType::U16 => "uint16",
            FieldType::U32 => "uint32",
            FieldType::U64 => "uint64",
            FieldType::F32 => "float32",
            FieldType::F64 => "float64",
            FieldType::String => "string",
            FieldType::Time => "time",
            FieldType::Duration => "duration",
            FieldType::Nested(schema) => schema.type_name(),
        }
    }

    fn from_primitive(token: &str) -> Option<FieldType> {
        Some(match token {
            "bool" => FieldType::Bool,
            "int8" | "byte" => FieldType::I8,
            "int16" => FieldType::I16,
            "int32" => FieldType::I32,
            "int64" => FieldType::I64,
            "uint8" | "char" => FieldType::U8,
            "uint16" => FieldType::U16,
            "uint32" => FieldType::U32,
            "uint64" => FieldType::U64,
            "float32" => FieldType::F32,
            "float64" => FieldType::F64,
            "string" => FieldType::String,
            "time" => FieldType::Time,
            "duration" => FieldType::Duration,
            _ => return None,
        })
    }
}

/// Array shape of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArraySpec {
    /// Plain scalar.
    Scalar,
    /// Variable-length array (`type[]`), count on the wire.
    Variable,
    /// Fixed-length array (`type[N]`), no count on the wire.
    Fixed(usize),
}

impl ArraySpec {
    fn suffix(&self) -> String {
        match self {
            ArraySpec::Scalar => String::new(),
            ArraySpec::Variable => "[]".to_string(),
            ArraySpec::Fixed(n) => format!("[{}]", n),
        }
    }
}

/// One declared field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub ty: FieldType,
    pub array: ArraySpec,
}

/// One declared constant. Constants contribute to the digest but carry no
/// wire bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Constant {
    pub ty: String,
    pub name: String,
    pub value: String,
}

// ============================================================================
// MessageSchema
// ============================================================================

/// An immutable message template: ordered fields, constants, and digest.
#[derive(Debug, PartialEq)]
pub struct MessageSchema {
    type_name: String,
    fields: Vec<FieldDescriptor>,
    constants: Vec<Constant>,
    md5: String,
    text: String,
}

impl MessageSchema {
    /// Fully qualified type name (`pkg/Type`).
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Fields in declaration order.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Declared constants.
    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    /// Hex MD5 digest of the canonical definition.
    pub fn md5(&self) -> &str {
        &self.md5
    }

    /// Canonical definition text (the digest input).
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Index of a field by name (linear scan, declaration order).
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Parse a definition body, resolving embedded types through `resolve`.
    pub fn parse(
        type_name: &str,
        body: &str,
        resolve: &mut dyn FnMut(&str) -> RosResult<Arc<MessageSchema>>,
    ) -> RosResult<Arc<MessageSchema>> {
        let package = type_name.split('/').next().unwrap_or("");
        let mut fields = Vec::new();
        let mut constants = Vec::new();

        for raw_line in body.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (type_token, rest) = line
                .split_once(char::is_whitespace)
                .ok_or_else(|| ErrorPack::new(ErrorKind::BadArgument))?;
            let rest = rest.trim();

            if let Some((const_name, const_value)) = parse_constant(type_token, rest) {
                constants.push(Constant {
                    ty: type_token.to_string(),
                    name: const_name,
                    value: const_value,
                });
                continue;
            }

            // Field line: strip trailing comment, then "type name".
            let rest = rest.split('#').next().unwrap_or("").trim();
            let name = rest
                .split_whitespace()
                .next()
                .ok_or_else(|| ErrorPack::new(ErrorKind::BadArgument))?;

            let (base, array) = split_array_suffix(type_token)?;
            let ty = resolve_base_type(base, package, resolve)?;
            fields.push(FieldDescriptor {
                name: name.to_string(),
                ty,
                array,
            });
        }

        let text = canonical_text(&fields, &constants);
        let md5 = md5_hex(text.as_bytes());
        Ok(Arc::new(MessageSchema {
            type_name: type_name.to_string(),
            fields,
            constants,
            md5,
            text,
        }))
    }
}

impl fmt::Display for MessageSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.type_name, self.md5)
    }
}

/// `TYPE NAME=VALUE` constant line; string constants keep the rest of the
/// line verbatim, other types strip trailing comments.
fn parse_constant(type_token: &str, rest: &str) -> Option<(String, String)> {
    if FieldType::from_primitive(type_token).is_none() {
        return None;
    }
    let (name, value) = rest.split_once('=')?;
    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }
    let value = if type_token == "string" {
        value.trim().to_string()
    } else {
        value.split('#').next().unwrap_or("").trim().to_string()
    };
    Some((name.to_string(), value))
}

fn split_array_suffix(token: &str) -> RosResult<(&str, ArraySpec)> {
    match token.find('[') {
        None => Ok((token, ArraySpec::Scalar)),
        Some(open) => {
            let close = token
                .rfind(']')
                .ok_or_else(|| ErrorPack::new(ErrorKind::BadArgument))?;
            let inner = &token[open + 1..close];
            let base = &token[..open];
            if inner.is_empty() {
                Ok((base, ArraySpec::Variable))
            } else {
                let n = inner
                    .parse::<usize>()
                    .map_err(|_| ErrorPack::new(ErrorKind::BadArgument))?;
                Ok((base, ArraySpec::Fixed(n)))
            }
        }
    }
}

fn resolve_base_type(
    base: &str,
    package: &str,
    resolve: &mut dyn FnMut(&str) -> RosResult<Arc<MessageSchema>>,
) -> RosResult<FieldType> {
    if let Some(primitive) = FieldType::from_primitive(base) {
        return Ok(primitive);
    }
    let qualified = if base == "Header" {
        "std_msgs/Header".to_string()
    } else if base.contains('/') {
        base.to_string()
    } else {
        format!("{}/{}", package, base)
    };
    Ok(FieldType::Nested(resolve(&qualified)?))
}

/// Digest input: constants first, then fields; nested fields are their
/// digest plus the field name, array suffix dropped.
fn canonical_text(fields: &[FieldDescriptor], constants: &[Constant]) -> String {
    let mut lines = Vec::with_capacity(fields.len() + constants.len());
    for constant in constants {
        lines.push(format!("{} {}={}", constant.ty, constant.name, constant.value));
    }
    for field in fields {
        match &field.ty {
            FieldType::Nested(schema) => {
                lines.push(format!("{} {}", schema.md5(), field.name));
            }
            scalar => {
                lines.push(format!(
                    "{}{} {}",
                    scalar.spelling(),
                    field.array.suffix(),
                    field.name
                ));
            }
        }
    }
    lines.join("\n")
}

fn md5_hex(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

// ============================================================================
// Service schema
// ============================================================================

/// Request/response template pair for a service type.
#[derive(Debug, Clone)]
pub struct ServiceSchema {
    pub type_name: String,
    pub request: Arc<MessageSchema>,
    pub response: Arc<MessageSchema>,
    /// Digest over request text + response text.
    pub md5: String,
}

// ============================================================================
// SchemaSource & the filesystem registry
// ============================================================================

/// Provider of message and service templates.
///
/// The node core only ever talks to this trait; [`MsgRegistry`] is the
/// built-in filesystem implementation.
pub trait SchemaSource {
    /// Template for `pkg/Type`, building it on first use.
    fn message(&mut self, type_name: &str) -> RosResult<Arc<MessageSchema>>;

    /// Request/response templates for `pkg/Srv`.
    fn service(&mut self, type_name: &str) -> RosResult<ServiceSchema>;
}

/// Filesystem-backed schema registry.
///
/// Reads `<root>/<pkg>/msg/<Type>.msg` and `<root>/<pkg>/srv/<Srv>.srv`,
/// caching parsed templates by type name.
pub struct MsgRegistry {
    root: PathBuf,
    cache: HashMap<String, Arc<MessageSchema>>,
    service_cache: HashMap<String, ServiceSchema>,
    loading: Vec<String>,
}

impl MsgRegistry {
    /// Create a registry over a definition-database root directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: HashMap::new(),
            service_cache: HashMap::new(),
            loading: Vec::new(),
        }
    }

    /// The configured database root.
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// Register a definition from text instead of disk (tests, embedders).
    pub fn register_text(
        &mut self,
        type_name: &str,
        body: &str,
    ) -> RosResult<Arc<MessageSchema>> {
        let schema = self.parse_body(type_name, body)?;
        self.cache.insert(type_name.to_string(), schema.clone());
        Ok(schema)
    }

    fn parse_body(&mut self, type_name: &str, body: &str) -> RosResult<Arc<MessageSchema>> {
        if self.loading.iter().any(|t| t == type_name) {
            log::error!("recursive message definition at {}", type_name);
            return Err(ErrorPack::new(ErrorKind::BadArgument));
        }
        self.loading.push(type_name.to_string());
        let result = MessageSchema::parse(type_name, body, &mut |nested| self.load(nested));
        self.loading.pop();
        result
    }

    fn load(&mut self, type_name: &str) -> RosResult<Arc<MessageSchema>> {
        if let Some(cached) = self.cache.get(type_name) {
            return Ok(cached.clone());
        }

        let (pkg, name) = type_name
            .split_once('/')
            .ok_or_else(|| ErrorPack::new(ErrorKind::BadArgument))?;
        let path = self.root.join(pkg).join("msg").join(format!("{}.msg", name));
        let body = std::fs::read_to_string(&path).map_err(|e| {
            log::warn!("message definition {} not readable: {}", path.display(), e);
            ErrorPack::new(ErrorKind::BadArgument)
        })?;

        let schema = self.parse_body(type_name, &body)?;
        self.cache.insert(type_name.to_string(), schema.clone());
        Ok(schema)
    }
}

impl SchemaSource for MsgRegistry {
    fn message(&mut self, type_name: &str) -> RosResult<Arc<MessageSchema>> {
        self.load(type_name)
    }

    fn service(&mut self, type_name: &str) -> RosResult<ServiceSchema> {
        if let Some(cached) = self.service_cache.get(type_name) {
            return Ok(cached.clone());
        }

        let (pkg, name) = type_name
            .split_once('/')
            .ok_or_else(|| ErrorPack::new(ErrorKind::BadArgument))?;
        let path = self.root.join(pkg).join("srv").join(format!("{}.srv", name));
        let body = std::fs::read_to_string(&path).map_err(|e| {
            log::warn!("service definition {} not readable: {}", path.display(), e);
            ErrorPack::new(ErrorKind::BadArgument)
        })?;

        let (request_body, response_body) = match body.split_once("\n---") {
            Some((req, res)) => (req.to_string(), res.trim_start_matches('-').to_string()),
            None if body.trim_start().starts_with("---") => {
                (String::new(), body.trim_start().trim_start_matches('-').to_string())
            }
            None => (body.clone(), String::new()),
        };

        let request = self.parse_body(&format!("{}Request", type_name), &request_body)?;
        let response = self.parse_body(&format!("{}Response", type_name), &response_body)?;
        let md5 = md5_hex(format!("{}{}", request.text(), response.text()).as_bytes());

        let schema = ServiceSchema {
            type_name: type_name.to_string(),
            request,
            response,
            md5,
        };
        self.service_cache.insert(type_name.to_string(), schema.clone());
        Ok(schema)
    }
}

// ============================================================================
// Test helpers
// ============================================================================

#[cfg(test)]
pub(crate) mod test_helpers {
    use super::*;

    fn parse_standalone(type_name: &str, body: &str) -> Arc<MessageSchema> {
        MessageSchema::parse(type_name, body, &mut |nested| {
            panic!("unexpected nested type {}", nested)
        })
        .unwrap()
    }

    /// `std_msgs/String`: a single string field.
    pub fn simple_string_schema() -> Arc<MessageSchema> {
        parse_standalone("std_msgs/String", "string data\n")
    }

    /// The request half of the TwoInts service: `int64 a`, `int64 b`.
    pub fn schema_two_ints() -> Arc<MessageSchema> {
        parse_standalone("roscpp_tutorials/TwoIntsRequest", "int64 a\nint64 b\n")
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(type_name: &str, body: &str) -> Arc<MessageSchema> {
        MessageSchema::parse(type_name, body, &mut |nested| {
            panic!("unexpected nested type {}", nested)
        })
        .unwrap()
    }

    #[test]
    fn test_well_known_string_digest() {
        let schema = parse("std_msgs/String", "string data\n");
        assert_eq!(schema.md5(), "992ce8a1687cec8c8bd883ec73ca41d1");
        assert_eq!(schema.text(), "string data");
    }

    #[test]
    fn test_well_known_header_digest() {
        let schema = parse(
            "std_msgs/Header",
            "# Standard metadata\nuint32 seq\ntime stamp\nstring frame_id\n",
        );
        assert_eq!(schema.md5(), "2176decaecbce78abc3b96ef049fabed");
    }

    #[test]
    fn test_comments_and_blank_lines_ignored() {
        let with_noise = parse("p/T", "# leading\n\nint32 x  # trailing\n\n");
        let clean = parse("p/T", "int32 x\n");
        assert_eq!(with_noise.md5(), clean.md5());
    }

    #[test]
    fn test_array_suffixes() {
        let schema = parse("p/T", "int32[] dynamic\nfloat64[9] grid\nstring name\n");
        assert_eq!(schema.fields()[0].array, ArraySpec::Variable);
        assert_eq!(schema.fields()[1].array, ArraySpec::Fixed(9));
        assert_eq!(schema.fields()[2].array, ArraySpec::Scalar);
        assert_eq!(schema.text(), "int32[] dynamic\nfloat64[9] grid\nstring name");
    }

    #[test]
    fn test_constants_precede_fields_in_digest() {
        let schema = parse("p/T", "int32 x\nint8 FOO=1\n");
        assert_eq!(schema.text(), "int8 FOO=1\nint32 x");
        assert_eq!(schema.constants().len(), 1);
        assert_eq!(schema.constants()[0].value, "1");
    }

    #[test]
    fn test_string_constant_keeps_hash() {
        let schema = parse("p/T", "string GREETING=hello # world\n");
        assert_eq!(schema.constants()[0].value, "hello # world");
    }

    #[test]
    fn test_nested_type_uses_digest_in_text() {
        let inner = parse("p/Inner", "int32 v\n");
        let inner_md5 = inner.md5().to_string();

        let outer = MessageSchema::parse("p/Outer", "Inner child\n", &mut |name| {
            assert_eq!(name, "p/Inner");
            Ok(inner.clone())
        })
        .unwrap();

        assert_eq!(outer.text(), format!("{} child", inner_md5));
    }

    #[test]
    fn test_header_shorthand_resolves_std_msgs() {
        let header = parse("std_msgs/Header", "uint32 seq\ntime stamp\nstring frame_id\n");
        let schema = MessageSchema::parse("p/T", "Header header\n", &mut |name| {
            assert_eq!(name, "std_msgs/Header");
            Ok(header.clone())
        })
        .unwrap();
        assert!(matches!(schema.fields()[0].ty, FieldType::Nested(_)));
    }

    #[test]
    fn test_bad_lines_rejected() {
        let result = MessageSchema::parse("p/T", "int32\n", &mut |_| unreachable!());
        assert!(result.is_err());

        let result = MessageSchema::parse("p/T", "int32[x] v\n", &mut |_| unreachable!());
        assert!(result.is_err());
    }

    #[test]
    fn test_registry_loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let msg_dir = dir.path().join("std_msgs").join("msg");
        std::fs::create_dir_all(&msg_dir).unwrap();
        std::fs::write(msg_dir.join("String.msg"), "string data\n").unwrap();

        let mut registry = MsgRegistry::new(dir.path());
        let schema = registry.message("std_msgs/String").unwrap();
        assert_eq!(schema.md5(), "992ce8a1687cec8c8bd883ec73ca41d1");

        // Second load hits the cache and returns the same template.
        let again = registry.message("std_msgs/String").unwrap();
        assert!(Arc::ptr_eq(&schema, &again));
    }

    #[test]
    fn test_registry_resolves_cross_package_nesting() {
        let dir = tempfile::tempdir().unwrap();
        let geo = dir.path().join("geometry_msgs").join("msg");
        std::fs::create_dir_all(&geo).unwrap();
        std::fs::write(geo.join("Point.msg"), "float64 x\nfloat64 y\nfloat64 z\n").unwrap();
        let nav = dir.path().join("nav_msgs").join("msg");
        std::fs::create_dir_all(&nav).unwrap();
        std::fs::write(nav.join("Path.msg"), "geometry_msgs/Point[] points\n").unwrap();

        let mut registry = MsgRegistry::new(dir.path());
        let schema = registry.message("nav_msgs/Path").unwrap();
        assert_eq!(schema.fields()[0].array, ArraySpec::Variable);
        assert!(matches!(schema.fields()[0].ty, FieldType::Nested(_)));
    }

    #[test]
    fn test_registry_missing_type() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = MsgRegistry::new(dir.path());
        let err = registry.message("no_such/Type").unwrap_err();
        assert_eq!(err.first(), ErrorKind::BadArgument);
    }

    #[test]
    fn test_registry_detects_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("p").join("msg");
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(pkg.join("A.msg"), "B b\n").unwrap();
        std::fs::write(pkg.join("B.msg"), "A a\n").unwrap();

        let mut registry = MsgRegistry::new(dir.path());
        assert!(registry.message("p/A").is_err());
    }

    #[test]
    fn test_service_split_and_digest() {
        let dir = tempfile::tempdir().unwrap();
        let srv = dir.path().join("roscpp_tutorials").join("srv");
        std::fs::create_dir_all(&srv).unwrap();
        std::fs::write(srv.join("TwoInts.srv"), "int64 a\nint64 b\n---\nint64 sum\n").unwrap();

        let mut registry = MsgRegistry::new(dir.path());
        let service = registry.service("roscpp_tutorials/TwoInts").unwrap();

        assert_eq!(service.request.fields().len(), 2);
        assert_eq!(service.response.fields().len(), 1);
        assert_eq!(service.request.type_name(), "roscpp_tutorials/TwoIntsRequest");
        assert_eq!(service.response.type_name(), "roscpp_tutorials/TwoIntsResponse");
        // Digest spans both halves.
        assert_eq!(
            service.md5,
            super::md5_hex(
                format!("{}{}", service.request.text(), service.response.text()).as_bytes()
            )
        );
    }

    #[test]
    fn test_service_empty_request() {
        let dir = tempfile::tempdir().unwrap();
        let srv = dir.path().join("p").join("srv");
        std::fs::create_dir_all(&srv).unwrap();
        std::fs::write(srv.join("Poll.srv"), "---\nint32 status\n").unwrap();

        let mut registry = MsgRegistry::new(dir.path());
        let service = registry.service("p/Poll").unwrap();
        assert!(service.request.fields().is_empty());
        assert_eq!(service.response.fields().len(), 1);
    }
}
