//! `afb-json-legacy.c`'s reply envelope quirk (`SPEC_FULL.md` §10): a
//! V1 peer expects `call_reply` wrapped as `{object, error, info}`
//! rather than as a plain value list. V3 peers get the plain list.

use serde_json::json;

use binder_core::ReplyStatus;

/// Wraps a reply for a V1 peer. `object` is the first reply value (or
/// `null` if there were none); `status` is `None` on success (a bare
/// `status 0` on the wire carries no error string).
#[must_use]
pub fn wrap_v1_reply(status: Option<ReplyStatus>, object: serde_json::Value) -> serde_json::Value {
    json!({
        "object": object,
        "error": status.map(|s| s.as_str()),
        "info": serde_json::Value::Null,
    })
}

/// V3's `call_reply.status` is a plain `i32`; success is `0`, each
/// [`ReplyStatus`] variant gets a distinct negative code, mirroring
/// `CoreError::code`'s convention.
#[must_use]
pub fn status_to_wire_code(status: Option<ReplyStatus>) -> i32 {
    match status {
        None => 0,
        Some(ReplyStatus::OutOfMemory) => -1,
        Some(ReplyStatus::InternalError) => -2,
        Some(ReplyStatus::NotAvailable) => -3,
        Some(ReplyStatus::UnknownApi) => -4,
        Some(ReplyStatus::BadApiState) => -5,
        Some(ReplyStatus::UnknownVerb) => -6,
        Some(ReplyStatus::InvalidToken) => -7,
        Some(ReplyStatus::InsufficientScope) => -8,
        Some(ReplyStatus::NoReply) => -9,
        Some(ReplyStatus::Disconnected) => -10,
        Some(ReplyStatus::Unauthorized) => -11,
        Some(ReplyStatus::Forbidden) => -12,
    }
}

/// Inverse of [`status_to_wire_code`], for decoding an incoming reply.
#[must_use]
pub fn wire_code_to_status(code: i32) -> Option<ReplyStatus> {
    match code {
        0 => None,
        -1 => Some(ReplyStatus::OutOfMemory),
        -2 => Some(ReplyStatus::InternalError),
        -3 => Some(ReplyStatus::NotAvailable),
        -4 => Some(ReplyStatus::UnknownApi),
        -5 => Some(ReplyStatus::BadApiState),
        -6 => Some(ReplyStatus::UnknownVerb),
        -7 => Some(ReplyStatus::InvalidToken),
        -8 => Some(ReplyStatus::InsufficientScope),
        -9 => Some(ReplyStatus::NoReply),
        -10 => Some(ReplyStatus::Disconnected),
        -11 => Some(ReplyStatus::Unauthorized),
        _ => Some(ReplyStatus::Forbidden),
    }
}
