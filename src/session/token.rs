//! Token interning store (`spec.md` §4.2): identical strings share the same
//! token with a shared 16-bit local ID.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

struct Inner {
    text: String,
    local_id: u16,
}

/// A refcounted, interned bearer token. Cloning addrefs the same token.
#[derive(Clone)]
pub struct Token(Arc<Inner>);

impl Token {
    #[must_use]
    pub fn text(&self) -> &str {
        &self.0.text
    }

    #[must_use]
    pub fn local_id(&self) -> u16 {
        self.0.local_id
    }

    #[must_use]
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    #[must_use]
    pub fn is_same(&self, other: &Token) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Process-wide interning table keyed by token text.
#[derive(Default)]
pub struct TokenStore {
    by_text: RwLock<HashMap<String, Token>>,
    next_id: std::sync::atomic::AtomicU16,
}

impl TokenStore {
    #[must_use]
    pub fn new() -> Self {
        TokenStore {
            by_text: RwLock::new(HashMap::new()),
            next_id: std::sync::atomic::AtomicU16::new(1),
        }
    }

    /// Returns the existing token for `text`, interning a fresh one if this
    /// is the first time it's seen.
    pub fn intern(&self, text: &str) -> Token {
        if let Some(existing) = self.by_text.read().get(text) {
            return existing.clone();
        }
        let mut table = self.by_text.write();
        if let Some(existing) = table.get(text) {
            return existing.clone();
        }
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let token = Token(Arc::new(Inner {
            text: text.to_owned(),
            local_id: id,
        }));
        table.insert(text.to_owned(), token.clone());
        token
    }

    #[must_use]
    pub fn lookup(&self, text: &str) -> Option<Token> {
        self.by_text.read().get(text).cloned()
    }

    /// Drops a token from the table once nothing else holds a clone of it.
    /// No-op if other handles remain.
    pub fn drop_if_unreferenced(&self, text: &str) {
        let mut table = self.by_text.write();
        if let Some(tok) = table.get(text) {
            if Arc::strong_count(&tok.0) == 1 {
                table.remove(text);
            }
        }
    }
}
