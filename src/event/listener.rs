//! Listeners (`spec.md` §2 GLOSSARY, §4.3): created against an interface
//! whose `add`/`remove`/`push`/`broadcast` callbacks may each be absent,
//! plus a group used as the job-queue key for ordering.

use std::sync::Arc;

use serde_json::Value;

use crate::scheduler::GroupToken;

/// The optional callback set a listener is created against. Any of the
/// four may be `None`; the fabric simply skips posting the corresponding
/// job in that case.
#[derive(Clone, Default)]
pub struct ListenerInterface {
    pub add: Option<Arc<dyn Fn(&str, u16) + Send + Sync>>,
    pub remove: Option<Arc<dyn Fn(&str, u16) + Send + Sync>>,
    pub push: Option<Arc<dyn Fn(&str, u16, Arc<Value>) + Send + Sync>>,
    pub broadcast: Option<Arc<dyn Fn(&str, Arc<Value>, [u8; 16], u8) + Send + Sync>>,
}

struct Inner {
    itf: ListenerInterface,
    group: GroupToken,
}

/// A refcounted listener handle. Cloning shares the same underlying
/// listener identity (used by `listener_remove` to match the exact
/// registration to tear down).
#[derive(Clone)]
pub struct Listener(Arc<Inner>);

impl Listener {
    #[must_use]
    pub fn new(itf: ListenerInterface, group: GroupToken) -> Self {
        Listener(Arc::new(Inner { itf, group }))
    }

    #[must_use]
    pub fn group(&self) -> GroupToken {
        self.0.group.clone()
    }

    #[must_use]
    pub fn interface(&self) -> &ListenerInterface {
        &self.0.itf
    }

    #[must_use]
    pub fn is_same(&self, other: &Listener) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listeners_with_no_callbacks_are_constructible() {
        let l = Listener::new(ListenerInterface::default(), GroupToken::new());
        assert!(l.interface().push.is_none());
    }

    #[test]
    fn cloned_listeners_share_identity() {
        let l1 = Listener::new(ListenerInterface::default(), GroupToken::new());
        let l2 = l1.clone();
        assert!(l1.is_same(&l2));
    }
}
