//! Error taxonomies for the binder core.
//!
//! Two distinct enums exist on purpose (see `spec.md` §7): [`CoreError`] is
//! the internal "-errno-like" kind table raised by the data registry, event
//! fabric, session/token stores and wire coders. [`ReplyStatus`] is the
//! user-visible status carried back to a caller through a request's `reply`.
//! They are not collapsed into one type because a `CoreError` can occur deep
//! in a converter or a lock and should not leak wire-level vocabulary to a
//! verb's caller.

use thiserror::Error;

/// Internal error kind, conveyed as a small negative integer on the wire
/// paths that still speak the original C ABI's `-errno` convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("invalid argument")]
    Invalid,
    #[error("out of memory")]
    NoMemory,
    #[error("operation not supported")]
    NotSupported,
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    Exists,
    #[error("busy")]
    Busy,
    #[error("cancelled")]
    Cancelled,
    #[error("protocol violation")]
    Protocol,
    #[error("short buffer")]
    Pipe,
    #[error("overflow")]
    Overflow,
}

impl CoreError {
    /// The `-errno`-style code used by wire paths that must emit a single
    /// integer (mirrors the original's small negative-int convention).
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            CoreError::Invalid => -1,
            CoreError::NoMemory => -2,
            CoreError::NotSupported => -3,
            CoreError::NotFound => -4,
            CoreError::Exists => -5,
            CoreError::Busy => -6,
            CoreError::Cancelled => -7,
            CoreError::Protocol => -8,
            CoreError::Pipe => -9,
            CoreError::Overflow => -10,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// User-visible status conveyed by a request's `reply`.
///
/// Each variant carries an optional string payload, matching the
/// `(status, info)` pair the original framework replies with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyStatus {
    #[error("out of memory")]
    OutOfMemory,
    #[error("internal error")]
    InternalError,
    #[error("not available")]
    NotAvailable,
    #[error("unknown api")]
    UnknownApi,
    #[error("bad api state")]
    BadApiState,
    #[error("unknown verb")]
    UnknownVerb,
    #[error("invalid token")]
    InvalidToken,
    #[error("insufficient scope")]
    InsufficientScope,
    #[error("no reply")]
    NoReply,
    #[error("disconnected")]
    Disconnected,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
}

impl ReplyStatus {
    /// Stable string tag used on the wire (V1's `error` field, V3's status
    /// resource) and in `tracing` output.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyStatus::OutOfMemory => "out-of-memory",
            ReplyStatus::InternalError => "internal-error",
            ReplyStatus::NotAvailable => "not-available",
            ReplyStatus::UnknownApi => "unknown-api",
            ReplyStatus::BadApiState => "bad-api-state",
            ReplyStatus::UnknownVerb => "unknown-verb",
            ReplyStatus::InvalidToken => "invalid-token",
            ReplyStatus::InsufficientScope => "insufficient-scope",
            ReplyStatus::NoReply => "no-reply",
            ReplyStatus::Disconnected => "disconnected",
            ReplyStatus::Unauthorized => "unauthorized",
            ReplyStatus::Forbidden => "forbidden",
        }
    }
}
