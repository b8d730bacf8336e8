//! Per-request identity (`spec.md` §4.2): uid, gid, pid, security label.
//! Exportable to and importable from a portable string, used by
//! `process_on_behalf` to move a credential across an RPC boundary.

use crate::error::{CoreError, CoreResult};

/// A caller's identity as seen by the binder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub label: String,
}

impl Credential {
    #[must_use]
    pub fn new(uid: u32, gid: u32, pid: u32, label: impl Into<String>) -> Self {
        Credential {
            uid,
            gid,
            pid,
            label: label.into(),
        }
    }

    /// Serializes to the portable `uid:gid:pid:label` form. `label` must
    /// not itself contain `:`; this is enforced on import, not export.
    #[must_use]
    pub fn export(&self) -> String {
        format!("{}:{}:{}:{}", self.uid, self.gid, self.pid, self.label)
    }

    /// Parses the string produced by [`Credential::export`]. Fails with
    /// [`CoreError::Invalid`] if the format doesn't round-trip.
    pub fn import(text: &str) -> CoreResult<Self> {
        let mut parts = text.splitn(4, ':');
        let uid = parts.next().ok_or(CoreError::Invalid)?;
        let gid = parts.next().ok_or(CoreError::Invalid)?;
        let pid = parts.next().ok_or(CoreError::Invalid)?;
        let label = parts.next().unwrap_or("");
        Ok(Credential {
            uid: uid.parse().map_err(|_| CoreError::Invalid)?,
            gid: gid.parse().map_err(|_| CoreError::Invalid)?,
            pid: pid.parse().map_err(|_| CoreError::Invalid)?,
            label: label.to_owned(),
        })
    }
}
