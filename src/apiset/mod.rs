//! Component E: the API set (`spec.md` §4.4 dispatch target, §6).
//!
//! The actual verb implementation lives behind `dyn ApiHandler` — the
//! embedder supplies it, the way the teacher's `AppState` holds
//! `Arc<dyn Fn...>`-shaped handles rather than baking in one concrete
//! framework type (`rt_ui_log::UiLogger`'s boxed `map_fn`).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::request::CommonRequest;
use crate::scheduler::GroupToken;

/// A verb implementation an embedder registers under an API name.
pub trait ApiHandler: Send + Sync {
    /// Handles a dispatched request. The handler owns the request's
    /// lifetime from here: it must eventually call `req.reply(...)`.
    fn process(&self, req: CommonRequest);

    /// Machine-readable description of the API's verbs, returned to
    /// `describe` calls (locally or over RPC).
    fn describe(&self) -> Value {
        Value::Null
    }
}

/// An API registration: `{closure, group, itf}` in `spec.md` §6's
/// vocabulary — here, `handler` is the closure/itf and `group` is the
/// job-queue key every request dispatched to this API is serialized on.
#[derive(Clone)]
pub struct ApiItem {
    pub handler: Arc<dyn ApiHandler>,
    pub group: GroupToken,
}

struct Entry {
    item: ApiItem,
    logmask: u32,
}

/// Process-wide registry of declared APIs.
#[derive(Default)]
pub struct ApiSet {
    apis: RwLock<HashMap<String, Entry>>,
}

impl ApiSet {
    #[must_use]
    pub fn new() -> Self {
        ApiSet {
            apis: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, name: &str, item: ApiItem) -> CoreResult<()> {
        let mut apis = self.apis.write();
        if apis.contains_key(name) {
            return Err(CoreError::Exists);
        }
        apis.insert(name.to_owned(), Entry { item, logmask: 0 });
        Ok(())
    }

    pub fn del(&self, name: &str) -> CoreResult<()> {
        self.apis.write().remove(name).map(|_| ()).ok_or(CoreError::NotFound)
    }

    #[must_use]
    pub fn get_api(&self, name: &str) -> Option<ApiItem> {
        self.apis.read().get(name).map(|e| e.item.clone())
    }

    #[must_use]
    pub fn describe(&self, name: &str) -> Option<Value> {
        self.apis.read().get(name).map(|e| e.item.handler.describe())
    }

    /// Lists every declared API name. `spec.md` §6's `enum(set, onalias,
    /// cb, clo)` models alias expansion the original supports; aliasing
    /// is not otherwise in scope here, so this returns the plain name
    /// list an embedder's `onalias` callback would have been invoked
    /// once per, with no aliasing performed.
    #[must_use]
    pub fn enum_names(&self) -> Vec<String> {
        self.apis.read().keys().cloned().collect()
    }

    pub fn set_logmask(&self, name: &str, mask: u32) -> CoreResult<()> {
        let mut apis = self.apis.write();
        let entry = apis.get_mut(name).ok_or(CoreError::NotFound)?;
        entry.logmask = mask;
        Ok(())
    }

    #[must_use]
    pub fn get_logmask(&self, name: &str) -> Option<u32> {
        self.apis.read().get(name).map(|e| e.logmask)
    }
}
