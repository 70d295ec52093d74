//! Library-wide error type.
//!
//! Every fallible operation in this crate returns `Result<T, XcmError>`. The
//! variant set is exactly the error-kind taxonomy of the spec: transport
//! backends and the control channel convert their own I/O/TLS errors onto the
//! closest variant here rather than leaking `std::io::ErrorKind` or
//! `rustls::Error` to callers.

use std::fmt;
use std::io;

use thiserror::Error;

/// Coarse category of an [`XcmError`], useful when a caller wants to match on
/// "kind of failure" rather than the full variant (and its payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    WouldBlock,
    ClosedByPeer,
    ConnectionRefused,
    Reset,
    Timeout,
    Unreachable,
    Protocol,
    AddrParse,
    ProtoNotAvailable,
    Overflow,
    Permission,
    MessageTooLarge,
    NotAvailable,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::WouldBlock => "would-block",
            ErrorKind::ClosedByPeer => "closed-by-peer",
            ErrorKind::ConnectionRefused => "connection-refused",
            ErrorKind::Reset => "reset",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::Protocol => "protocol",
            ErrorKind::AddrParse => "addr-parse",
            ErrorKind::ProtoNotAvailable => "proto-not-available",
            ErrorKind::Overflow => "overflow",
            ErrorKind::Permission => "permission",
            ErrorKind::MessageTooLarge => "message-too-large",
            ErrorKind::NotAvailable => "not-available",
        };
        f.write_str(s)
    }
}

/// The library's single error type, covering every failure mode described in
/// the spec's error-handling design.
#[derive(Debug, Error)]
pub enum XcmError {
    #[error("would block")]
    WouldBlock,

    #[error("connection closed by peer")]
    ClosedByPeer,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("connection reset by peer")]
    Reset,

    #[error("operation timed out")]
    Timeout,

    #[error("host or network unreachable")]
    Unreachable,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("malformed address: {0}")]
    AddrParse(String),

    #[error("protocol not available: {0}")]
    ProtoNotAvailable(String),

    #[error("value does not fit: {0}")]
    Overflow(String),

    #[error("operation not permitted: {0}")]
    Permission(String),

    #[error("message too large: {size} bytes exceeds max {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("not available: {0}")]
    NotAvailable(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("tls error: {0}")]
    Tls(String),
}

impl XcmError {
    /// Coarse category for this error, for callers that want to branch on
    /// kind rather than match every variant.
    pub fn kind(&self) -> ErrorKind {
        match self {
            XcmError::WouldBlock => ErrorKind::WouldBlock,
            XcmError::ClosedByPeer => ErrorKind::ClosedByPeer,
            XcmError::ConnectionRefused => ErrorKind::ConnectionRefused,
            XcmError::Reset => ErrorKind::Reset,
            XcmError::Timeout => ErrorKind::Timeout,
            XcmError::Unreachable => ErrorKind::Unreachable,
            XcmError::Protocol(_) | XcmError::Tls(_) => ErrorKind::Protocol,
            XcmError::AddrParse(_) => ErrorKind::AddrParse,
            XcmError::ProtoNotAvailable(_) => ErrorKind::ProtoNotAvailable,
            XcmError::Overflow(_) => ErrorKind::Overflow,
            XcmError::Permission(_) => ErrorKind::Permission,
            XcmError::MessageTooLarge { .. } => ErrorKind::MessageTooLarge,
            XcmError::NotAvailable(_) => ErrorKind::NotAvailable,
            XcmError::Io(e) => io_error_kind(e),
        }
    }

    /// True if this error is transient and safe to retry without resetting
    /// the socket's state (i.e. not "sticky" per the spec's error policy).
    pub fn is_would_block(&self) -> bool {
        matches!(self.kind(), ErrorKind::WouldBlock)
    }
}

fn io_error_kind(e: &io::Error) -> ErrorKind {
    use io::ErrorKind as K;
    match e.kind() {
        K::WouldBlock => ErrorKind::WouldBlock,
        K::ConnectionRefused => ErrorKind::ConnectionRefused,
        K::ConnectionReset | K::BrokenPipe => ErrorKind::Reset,
        K::TimedOut => ErrorKind::Timeout,
        K::UnexpectedEof => ErrorKind::ClosedByPeer,
        _ => ErrorKind::Protocol,
    }
}

impl From<rustls::Error> for XcmError {
    fn from(e: rustls::Error) -> Self {
        XcmError::Tls(e.to_string())
    }
}

impl From<nix::errno::Errno> for XcmError {
    fn from(e: nix::errno::Errno) -> Self {
        use nix::errno::Errno;
        match e {
            Errno::EAGAIN => XcmError::WouldBlock,
            Errno::ECONNREFUSED => XcmError::ConnectionRefused,
            Errno::ECONNRESET | Errno::EPIPE => XcmError::Reset,
            Errno::ETIMEDOUT => XcmError::Timeout,
            Errno::ENETUNREACH | Errno::EHOSTUNREACH => XcmError::Unreachable,
            Errno::EACCES | Errno::EPERM => XcmError::Permission(e.to_string()),
            _ => XcmError::Protocol(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, XcmError>;
