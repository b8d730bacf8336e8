//! Per-peer proxy state: resources the other side already knows about
//! (`sent` bitmaps) and resources the other side created that we've
//! mapped to local handles (`incoming` tables). `spec.md` §4.7.4:
//! "recorded in sent-flags bitmaps" / "resolve session/token IDs via
//! proxy tables".

use std::collections::{HashMap, HashSet};

use binder_core::data::TypeId;
use binder_core::event::Event;
use binder_core::session::{Session, Token};

/// Tracks which local-id resources of one kind have already been
/// announced to the peer via `resource_create`, so a second reference
/// to the same session/token/type doesn't re-announce it.
#[derive(Default)]
pub struct SentFlags(HashSet<u16>);

impl SentFlags {
    /// Returns `true` if this is the first time `id` is marked sent —
    /// the caller should emit `resource_create` exactly when this
    /// returns `true`.
    pub fn mark(&mut self, id: u16) -> bool {
        self.0.insert(id)
    }

    #[must_use]
    pub fn is_sent(&self, id: u16) -> bool {
        self.0.contains(&id)
    }

    /// Forgets that `id` was announced — the next reference re-sends
    /// `resource_create`. Used on `event_unexpected`: the peer has
    /// dropped its proxy for the id, so our announcement no longer holds.
    pub fn unmark(&mut self, id: u16) {
        self.0.remove(&id);
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

/// Everything the stub knows about resources the peer owns or has
/// announced, dropped wholesale on disconnection.
#[derive(Default)]
pub struct ProxyTables {
    pub sessions_in: HashMap<u16, Session>,
    pub tokens_in: HashMap<u16, Token>,
    pub events_in: HashMap<u16, Event>,
    pub sessions_sent: SentFlags,
    pub tokens_sent: SentFlags,
    pub types_sent: SentFlags,
    pub events_sent: SentFlags,
}

impl ProxyTables {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops all proxy tables — `spec.md` §4.7.4's disconnection step
    /// ("unref all sessions/tokens/events").
    pub fn clear(&mut self) {
        self.sessions_in.clear();
        self.tokens_in.clear();
        self.events_in.clear();
        self.sessions_sent.clear();
        self.tokens_sent.clear();
        self.types_sent.clear();
        self.events_sent.clear();
    }

    #[must_use]
    pub fn type_needs_announce(&mut self, type_id: TypeId) -> bool {
        self.types_sent.mark(type_id.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sent_flags_mark_only_once() {
        let mut flags = SentFlags::default();
        assert!(flags.mark(3));
        assert!(!flags.mark(3));
        assert!(flags.is_sent(3));
    }

    #[test]
    fn clear_drops_every_table() {
        let mut tables = ProxyTables::new();
        tables.sessions_sent.mark(1);
        tables.types_sent.mark(2);
        tables.clear();
        assert!(!tables.sessions_sent.is_sent(1));
        assert!(!tables.types_sent.is_sent(2));
    }
}
