// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Packed error values for the node runtime.
//!
//! Every public entry point returns an [`ErrorPack`]: a single value carrying
//! up to four [`ErrorKind`]s in priority order, outermost context first. A
//! failing subsystem pushes its own kind on top of whatever the layer below
//! reported, so a caller sees e.g.
//! `master-unreachable <- transport-timeout` without allocating.

use std::fmt;

/// Closed set of error kinds produced by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorKind {
    /// No error.
    Ok = 0,

    /// Socket read/write/connect failure.
    TransportIo = 1,

    /// A socket or call deadline expired.
    TransportTimeout = 2,

    /// A peer sent bytes that do not parse as the expected protocol.
    ProtocolMalformed = 3,

    /// Type hash in a connection header does not match the local template.
    ProtocolMd5Mismatch = 4,

    /// An RPC server answered with an HTTP-level refusal.
    RpcServerRefused = 5,

    /// An RPC method call completed but reported failure.
    RpcMethodFailed = 6,

    /// The master endpoint could not be reached within the retry budget.
    MasterUnreachable = 7,

    /// A registration conflicts with the slot's current master state.
    RegistrationConflict = 8,

    /// All slots of the requested registry are in use.
    SlotExhausted = 9,

    /// Caller-supplied argument is invalid.
    BadArgument = 10,

    /// An internal invariant was violated; the loop aborts.
    InternalInvariant = 11,
}

impl ErrorKind {
    /// Short identifier used in rendered messages.
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Ok => "ok",
            ErrorKind::TransportIo => "transport-io",
            ErrorKind::TransportTimeout => "transport-timeout",
            ErrorKind::ProtocolMalformed => "protocol-malformed",
            ErrorKind::ProtocolMd5Mismatch => "protocol-md5-mismatch",
            ErrorKind::RpcServerRefused => "rpc-server-refused",
            ErrorKind::RpcMethodFailed => "rpc-method-failed",
            ErrorKind::MasterUnreachable => "master-unreachable",
            ErrorKind::RegistrationConflict => "registration-conflict",
            ErrorKind::SlotExhausted => "slot-exhausted",
            ErrorKind::BadArgument => "bad-argument",
            ErrorKind::InternalInvariant => "internal-invariant",
        }
    }

    /// One-line human description.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorKind::Ok => "no error",
            ErrorKind::TransportIo => "socket I/O failed",
            ErrorKind::TransportTimeout => "operation timed out",
            ErrorKind::ProtocolMalformed => "peer sent malformed protocol data",
            ErrorKind::ProtocolMd5Mismatch => "message type hash mismatch",
            ErrorKind::RpcServerRefused => "RPC server refused the request",
            ErrorKind::RpcMethodFailed => "RPC method reported failure",
            ErrorKind::MasterUnreachable => "master endpoint unreachable",
            ErrorKind::RegistrationConflict => "registration state conflict",
            ErrorKind::SlotExhausted => "no free registry slot",
            ErrorKind::BadArgument => "invalid argument",
            ErrorKind::InternalInvariant => "internal invariant violated",
        }
    }

    fn from_u8(v: u8) -> ErrorKind {
        match v {
            0 => ErrorKind::Ok,
            1 => ErrorKind::TransportIo,
            2 => ErrorKind::TransportTimeout,
            3 => ErrorKind::ProtocolMalformed,
            4 => ErrorKind::ProtocolMd5Mismatch,
            5 => ErrorKind::RpcServerRefused,
            6 => ErrorKind::RpcMethodFailed,
            7 => ErrorKind::MasterUnreachable,
            8 => ErrorKind::RegistrationConflict,
            9 => ErrorKind::SlotExhausted,
            10 => ErrorKind::BadArgument,
            _ => ErrorKind::InternalInvariant,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ============================================================================
// ErrorPack
// ============================================================================

/// Up to four error kinds packed into one `u32`, outermost context in the
/// low byte.
///
/// The all-zero pack means success. Pushing onto a full pack drops the oldest
/// (innermost) kind, so the most recent context always survives.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorPack(u32);

/// Shorthand result type used across the crate.
pub type RosResult<T> = Result<T, ErrorPack>;

impl ErrorPack {
    /// The success value.
    pub const OK: ErrorPack = ErrorPack(0);

    /// Pack a single kind.
    pub fn new(kind: ErrorKind) -> Self {
        ErrorPack(kind as u32)
    }

    /// True when no kind is recorded.
    pub fn is_ok(&self) -> bool {
        self.0 == 0
    }

    /// Push `kind` as the new outermost context.
    pub fn push(self, kind: ErrorKind) -> Self {
        if kind == ErrorKind::Ok {
            return self;
        }
        ErrorPack((self.0 << 8) | kind as u32)
    }

    /// The outermost (most recently pushed) kind.
    pub fn first(&self) -> ErrorKind {
        ErrorKind::from_u8((self.0 & 0xff) as u8)
    }

    /// Iterate kinds from outermost to innermost, skipping empty slots.
    pub fn kinds(&self) -> impl Iterator<Item = ErrorKind> {
        let raw = self.0;
        (0..4)
            .map(move |i| ((raw >> (8 * i)) & 0xff) as u8)
            .filter(|&b| b != 0)
            .map(ErrorKind::from_u8)
    }

    /// True if any slot holds `kind`.
    pub fn contains(&self, kind: ErrorKind) -> bool {
        self.kinds().any(|k| k == kind)
    }

    /// Multi-line human-readable rendering, outermost kind first.
    pub fn render(&self) -> String {
        if self.is_ok() {
            return "ok: no error".to_string();
        }
        let mut out = String::new();
        for (depth, kind) in self.kinds().enumerate() {
            if depth > 0 {
                out.push('\n');
            }
            let indent = "  ".repeat(depth);
            out.push_str(&format!("{}{}: {}", indent, kind.name(), kind.description()));
        }
        out
    }
}

impl Default for ErrorPack {
    fn default() -> Self {
        ErrorPack::OK
    }
}

impl From<ErrorKind> for ErrorPack {
    fn from(kind: ErrorKind) -> Self {
        ErrorPack::new(kind)
    }
}

impl fmt::Display for ErrorPack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for kind in self.kinds() {
            if !first {
                write!(f, " <- ")?;
            }
            write!(f, "{}", kind)?;
            first = false;
        }
        if first {
            write!(f, "ok")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ErrorPack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorPack({})", self)
    }
}

impl std::error::Error for ErrorPack {}

/// Map an I/O error to the matching transport kind.
pub fn kind_of_io_error(e: &std::io::Error) -> ErrorKind {
    match e.kind() {
        std::io::ErrorKind::TimedOut => ErrorKind::TransportTimeout,
        _ => ErrorKind::TransportIo,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_pack() {
        let pack = ErrorPack::OK;
        assert!(pack.is_ok());
        assert_eq!(pack.first(), ErrorKind::Ok);
        assert_eq!(pack.kinds().count(), 0);
        assert_eq!(pack.to_string(), "ok");
    }

    #[test]
    fn test_single_kind() {
        let pack = ErrorPack::new(ErrorKind::TransportIo);
        assert!(!pack.is_ok());
        assert_eq!(pack.first(), ErrorKind::TransportIo);
        assert!(pack.contains(ErrorKind::TransportIo));
        assert!(!pack.contains(ErrorKind::BadArgument));
    }

    #[test]
    fn test_push_layers() {
        let pack = ErrorPack::new(ErrorKind::TransportTimeout).push(ErrorKind::MasterUnreachable);
        assert_eq!(pack.first(), ErrorKind::MasterUnreachable);

        let kinds: Vec<_> = pack.kinds().collect();
        assert_eq!(
            kinds,
            vec![ErrorKind::MasterUnreachable, ErrorKind::TransportTimeout]
        );
    }

    #[test]
    fn test_push_ok_is_noop() {
        let pack = ErrorPack::new(ErrorKind::BadArgument).push(ErrorKind::Ok);
        assert_eq!(pack.kinds().count(), 1);
        assert_eq!(pack.first(), ErrorKind::BadArgument);
    }

    #[test]
    fn test_push_overflow_keeps_newest() {
        let pack = ErrorPack::new(ErrorKind::TransportIo)
            .push(ErrorKind::ProtocolMalformed)
            .push(ErrorKind::RpcMethodFailed)
            .push(ErrorKind::MasterUnreachable)
            .push(ErrorKind::InternalInvariant);

        // Oldest kind shifted out, newest survives.
        assert_eq!(pack.first(), ErrorKind::InternalInvariant);
        assert_eq!(pack.kinds().count(), 4);
        assert!(!pack.contains(ErrorKind::TransportIo));
    }

    #[test]
    fn test_render_multiline() {
        let pack = ErrorPack::new(ErrorKind::TransportTimeout).push(ErrorKind::MasterUnreachable);
        let text = pack.render();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("master-unreachable"));
        assert!(lines[1].contains("transport-timeout"));
    }

    #[test]
    fn test_display_chain() {
        let pack = ErrorPack::new(ErrorKind::TransportIo).push(ErrorKind::RpcServerRefused);
        assert_eq!(pack.to_string(), "rpc-server-refused <- transport-io");
    }

    #[test]
    fn test_io_error_mapping() {
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "t");
        assert_eq!(kind_of_io_error(&timeout), ErrorKind::TransportTimeout);

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "r");
        assert_eq!(kind_of_io_error(&refused), ErrorKind::TransportIo);
    }
}
