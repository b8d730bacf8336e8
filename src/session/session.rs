//! Sessions (`spec.md` §4.2): a UUID-identified, refcounted container of
//! per-API cookies and levels of assurance, with a fixed-capacity,
//! LRU-evicting process-wide store.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// A dispose callback run when a cookie is dropped, either explicitly via
/// [`Session::drop_key`] or implicitly when the session itself is dropped.
pub type DisposeFn = Box<dyn FnOnce() + Send>;

struct CookieEntry {
    value: Arc<dyn Any + Send + Sync>,
    dispose: Option<DisposeFn>,
}

impl Drop for CookieEntry {
    fn drop(&mut self) {
        if let Some(d) = self.dispose.take() {
            d();
        }
    }
}

struct Inner {
    uuid: String,
    local_id: u16,
    cookies: Mutex<HashMap<String, CookieEntry>>,
    loa: Mutex<HashMap<String, u8>>,
    timeout: Duration,
    last_active: Mutex<Instant>,
    closing: AtomicBool,
}

/// A refcounted session handle; cloning addrefs the same underlying
/// session.
#[derive(Clone)]
pub struct Session(Arc<Inner>);

impl Session {
    fn new(uuid: String, local_id: u16, timeout: Duration) -> Self {
        Session(Arc::new(Inner {
            uuid,
            local_id,
            cookies: Mutex::new(HashMap::new()),
            loa: Mutex::new(HashMap::new()),
            timeout,
            last_active: Mutex::new(Instant::now()),
            closing: AtomicBool::new(false),
        }))
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.0.uuid
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
    pub fn is_same(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn mark_closing(&self) {
        self.0.closing.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.0.closing.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        *self.0.last_active.lock() = Instant::now();
    }

    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        self.0.last_active.lock().elapsed() >= self.0.timeout
    }

    /// Returns the cookie installed for `api`, installing it via `init` the
    /// first time any caller queries it for this session. Installation is
    /// atomic under the session's cookie-table lock: a second caller racing
    /// on the same `api` during `init`'s execution would block on the lock
    /// rather than double-initialize, since `init` runs while the lock is
    /// held.
    pub fn cookie_getinit<T, F>(&self, api: &str, init: F) -> Arc<dyn Any + Send + Sync>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> (T, Option<DisposeFn>),
    {
        let mut table = self.0.cookies.lock();
        if let Some(entry) = table.get(api) {
            return entry.value.clone();
        }
        let (value, dispose) = init();
        let value: Arc<dyn Any + Send + Sync> = Arc::new(value);
        table.insert(
            api.to_owned(),
            CookieEntry {
                value: value.clone(),
                dispose,
            },
        );
        value
    }

    #[must_use]
    pub fn cookie_get(&self, api: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.0.cookies.lock().get(api).map(|e| e.value.clone())
    }

    /// Removes the cookie for `api`, running its dispose callback if any.
    /// Called when a verb marked with the "close" flag succeeds.
    pub fn drop_key(&self, api: &str) {
        self.0.cookies.lock().remove(api);
    }

    /// Level of assurance for `api`, defaulting to 0 if never set.
    #[must_use]
    pub fn loa(&self, api: &str) -> u8 {
        self.0.loa.lock().get(api).copied().unwrap_or(0)
    }

    pub fn set_loa(&self, api: &str, level: u8) {
        self.0.loa.lock().insert(api.to_owned(), level);
    }
}

/// Fixed-capacity, LRU-evicting process-wide session store.
pub struct SessionStore {
    by_uuid: Mutex<HashMap<String, Session>>,
    capacity: usize,
    default_timeout: Duration,
    next_local_id: AtomicU16,
}

impl SessionStore {
    #[must_use]
    pub fn new(capacity: usize, default_timeout: Duration) -> Self {
        SessionStore {
            by_uuid: Mutex::new(HashMap::new()),
            capacity,
            default_timeout,
            next_local_id: AtomicU16::new(1),
        }
    }

    /// Creates or returns the session for `uuid`. If `uuid` is `None`, a
    /// fresh UUID is generated. Evicts timed-out sessions before
    /// allocating a new slot if the store is at capacity; fails with
    /// [`CoreError::Overflow`] if no slot can be freed.
    pub fn get_or_create(&self, uuid: Option<&str>) -> CoreResult<Session> {
        let mut table = self.by_uuid.lock();
        if let Some(uuid) = uuid {
            if let Some(existing) = table.get(uuid) {
                existing.touch();
                return Ok(existing.clone());
            }
        }
        if table.len() >= self.capacity {
            self.evict_one_timed_out(&mut table)?;
        }
        let uuid = uuid.map(str::to_owned).unwrap_or_else(|| Uuid::new_v4().to_string());
        let local_id = self.next_local_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(uuid.clone(), local_id, self.default_timeout);
        table.insert(uuid, session.clone());
        Ok(session)
    }

    fn evict_one_timed_out(&self, table: &mut HashMap<String, Session>) -> CoreResult<()> {
        let victim = table
            .iter()
            .find(|(_, s)| s.is_timed_out())
            .map(|(k, _)| k.clone());
        match victim {
            Some(key) => {
                table.remove(&key);
                Ok(())
            }
            None => Err(CoreError::Overflow),
        }
    }

    #[must_use]
    pub fn get(&self, uuid: &str) -> Option<Session> {
        self.by_uuid.lock().get(uuid).cloned()
    }

    pub fn remove(&self, uuid: &str) -> Option<Session> {
        self.by_uuid.lock().remove(uuid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_uuid.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_reuses_existing_uuid() {
        let store = SessionStore::new(4, Duration::from_secs(60));
        let a = store.get_or_create(Some("fixed-uuid")).unwrap();
        let b = store.get_or_create(Some("fixed-uuid")).unwrap();
        assert!(a.is_same(&b));
    }

    #[test]
    fn get_or_create_with_none_generates_fresh_uuid_each_time() {
        let store = SessionStore::new(4, Duration::from_secs(60));
        let a = store.get_or_create(None).unwrap();
        let b = store.get_or_create(None).unwrap();
        assert!(!a.is_same(&b));
        assert_ne!(a.uuid(), b.uuid());
    }

    #[test]
    fn capacity_overflow_without_timed_out_victims_errors() {
        let store = SessionStore::new(1, Duration::from_secs(3600));
        let _a = store.get_or_create(Some("one")).unwrap();
        assert_eq!(store.get_or_create(Some("two")), Err(CoreError::Overflow));
    }

    #[test]
    fn capacity_overflow_evicts_a_timed_out_session() {
        let store = SessionStore::new(1, Duration::from_millis(1));
        let a = store.get_or_create(Some("old")).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(a.is_timed_out());
        let b = store.get_or_create(Some("new")).unwrap();
        assert!(store.get("old").is_none());
        assert_eq!(b.uuid(), "new");
    }

    #[test]
    fn cookie_getinit_installs_exactly_once() {
        let store = SessionStore::new(4, Duration::from_secs(60));
        let session = store.get_or_create(Some("s")).unwrap();
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let c1 = calls.clone();
        let v1 = session.cookie_getinit("api.a", move || {
            c1.fetch_add(1, Ordering::SeqCst);
            (42i32, None)
        });
        let c2 = calls.clone();
        let v2 = session.cookie_getinit("api.a", move || {
            c2.fetch_add(1, Ordering::SeqCst);
            (0i32, None)
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*v1.downcast_ref::<i32>().unwrap(), 42);
        assert_eq!(*v2.downcast_ref::<i32>().unwrap(), 42);
    }

    #[test]
    fn drop_key_runs_dispose_exactly_once() {
        let store = SessionStore::new(4, Duration::from_secs(60));
        let session = store.get_or_create(Some("s2")).unwrap();
        let disposed = Arc::new(AtomicBool::new(false));
        let d = disposed.clone();
        let _ = session.cookie_getinit("api.b", move || {
            ((), Some(Box::new(move || d.store(true, Ordering::SeqCst)) as DisposeFn))
        });
        assert!(!disposed.load(Ordering::SeqCst));
        session.drop_key("api.b");
        assert!(disposed.load(Ordering::SeqCst));
    }

    #[test]
    fn loa_defaults_to_zero_and_is_per_api() {
        let store = SessionStore::new(4, Duration::from_secs(60));
        let session = store.get_or_create(Some("s3")).unwrap();
        assert_eq!(session.loa("api.x"), 0);
        session.set_loa("api.x", 3);
        assert_eq!(session.loa("api.x"), 3);
        assert_eq!(session.loa("api.y"), 0);
    }
}
