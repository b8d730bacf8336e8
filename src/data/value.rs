//! Reference-counted, lockable, opacifiable data values.
//!
//! A [`DataValue`] is an `Arc` handle; `addref` is `Clone`, `unref` is
//! `Drop`. The dispose callback therefore runs exactly once, for free, the
//! moment the last `Arc` strong reference goes away — no manual refcounting
//! is needed (see DESIGN NOTES in `spec.md` §9: "manual refcount + dispose
//! closure → owned smart pointer with custom drop").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::{CoreError, CoreResult};

use super::types::TypeId;

type DisposeFn = Box<dyn FnOnce() + Send>;

/// Advisory reader/writer lock. Never enforced against `read`/`write`
/// access on the payload itself — callers are expected to cooperate, per
/// `spec.md` §4.1 ("Locks are advisory — no runtime enforcement").
#[derive(Debug)]
struct AdvisoryLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Free,
    Read(u32),
    Write,
}

impl AdvisoryLock {
    fn new() -> Self {
        AdvisoryLock {
            state: Mutex::new(LockState::Free),
            cond: Condvar::new(),
        }
    }

    fn lock_read(&self) {
        let mut state = self.state.lock();
        loop {
            match *state {
                LockState::Write => self.cond.wait(&mut state),
                LockState::Free => {
                    *state = LockState::Read(1);
                    return;
                }
                LockState::Read(n) => {
                    *state = LockState::Read(n + 1);
                    return;
                }
            }
        }
    }

    fn try_lock_read(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        match *state {
            LockState::Write => Err(CoreError::Busy),
            LockState::Free => {
                *state = LockState::Read(1);
                Ok(())
            }
            LockState::Read(n) => {
                *state = LockState::Read(n + 1);
                Ok(())
            }
        }
    }

    fn lock_write(&self) {
        let mut state = self.state.lock();
        while *state != LockState::Free {
            self.cond.wait(&mut state);
        }
        *state = LockState::Write;
    }

    fn try_lock_write(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        if *state == LockState::Free {
            *state = LockState::Write;
            Ok(())
        } else {
            Err(CoreError::Busy)
        }
    }

    /// Releases one unit of whatever the current holder has: the write
    /// lock entirely, or one reader's share of a shared read lock.
    fn unlock(&self) {
        let mut state = self.state.lock();
        *state = match *state {
            LockState::Write => LockState::Free,
            LockState::Read(1) => LockState::Free,
            LockState::Read(n) => LockState::Read(n - 1),
            LockState::Free => LockState::Free,
        };
        self.cond.notify_all();
    }
}

struct Inner {
    type_id: Mutex<TypeId>,
    bytes: RwLock<Vec<u8>>,
    constant: bool,
    volatile: bool,
    advisory: AdvisoryLock,
    opaque_id: Mutex<Option<u64>>,
    cache: Mutex<HashMap<TypeId, DataValue>>,
    dependencies: Mutex<Vec<DataValue>>,
    dispose: Mutex<Option<DisposeFn>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(dispose) = self.dispose.lock().take() {
            dispose();
        }
        self.dependencies.lock().clear();
    }
}

/// A reference-counted typed value. Cloning is `addref`; dropping the last
/// clone is `unref` and runs the dispose callback exactly once.
#[derive(Clone)]
pub struct DataValue(Arc<Inner>);

static NEXT_OPAQUE_ID: AtomicU64 = AtomicU64::new(1);

impl DataValue {
    fn new_inner(type_id: TypeId, bytes: Vec<u8>, constant: bool, volatile: bool) -> Self {
        DataValue(Arc::new(Inner {
            type_id: Mutex::new(type_id),
            bytes: RwLock::new(bytes),
            constant,
            volatile,
            advisory: AdvisoryLock::new(),
            opaque_id: Mutex::new(None),
            cache: Mutex::new(HashMap::new()),
            dependencies: Mutex::new(Vec::new()),
            dispose: Mutex::new(None),
        }))
    }

    /// Creates a data value that takes ownership of `bytes` directly (the
    /// "raw" creation mode): no copy is made.
    #[must_use]
    pub fn create_raw(type_id: TypeId, bytes: Vec<u8>, constant: bool, volatile: bool) -> Self {
        Self::new_inner(type_id, bytes, constant, volatile)
    }

    /// Allocates `size` zeroed bytes.
    #[must_use]
    pub fn create_alloc_zeroed(type_id: TypeId, size: usize) -> Self {
        Self::new_inner(type_id, vec![0u8; size], false, false)
    }

    /// Copies `bytes` into a freshly owned buffer.
    #[must_use]
    pub fn create_copy(type_id: TypeId, bytes: &[u8], constant: bool, volatile: bool) -> Self {
        Self::new_inner(type_id, bytes.to_vec(), constant, volatile)
    }

    /// Re-tags an existing data value under `new_type` without copying the
    /// payload. The new value keeps the original alive via the dependency
    /// set (`spec.md` §3: "data values whose lifetime must outlive this
    /// one").
    #[must_use]
    pub fn alias(&self, new_type: TypeId) -> Self {
        let bytes = self.0.bytes.read().clone();
        let aliased = Self::new_inner(new_type, bytes, self.0.constant, self.0.volatile);
        aliased.add_dependency(self.clone());
        aliased
    }

    /// Registers `dep` as a dependency: `dep` must outlive `self`.
    pub fn add_dependency(&self, dep: DataValue) {
        self.0.dependencies.lock().push(dep);
    }

    /// Drops every dependency this value is holding onto.
    pub fn drop_all_dependencies(&self) {
        self.0.dependencies.lock().clear();
    }

    /// Installs (or replaces) the dispose closure run on final `unref`.
    pub fn on_dispose(&self, f: impl FnOnce() + Send + 'static) {
        *self.0.dispose.lock() = Some(Box::new(f));
    }

    #[must_use]
    pub fn type_id(&self) -> TypeId {
        *self.0.type_id.lock()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.0.bytes.read().len()
    }

    #[must_use]
    pub fn is_constant(&self) -> bool {
        self.0.constant
    }

    #[must_use]
    pub fn is_volatile(&self) -> bool {
        self.0.volatile
    }

    /// Read-only access to the payload. Always available, even for
    /// constant values.
    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, Vec<u8>> {
        self.0.bytes.read()
    }

    /// Mutable access to the payload. Refused for constant values.
    pub fn write(&self) -> CoreResult<parking_lot::RwLockWriteGuard<'_, Vec<u8>>> {
        if self.0.constant {
            return Err(CoreError::Invalid);
        }
        Ok(self.0.bytes.write())
    }

    /// Count of strong references currently alive (the refcount).
    #[must_use]
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Empties the conversion cache. Existing clones of previously cached
    /// results remain perfectly valid — only *new* `convert` calls recompute.
    pub fn notify_changed(&self) {
        self.0.cache.lock().clear();
    }

    pub(crate) fn cached_conversion(&self, target: TypeId) -> Option<DataValue> {
        self.0.cache.lock().get(&target).cloned()
    }

    pub(crate) fn store_conversion(&self, target: TypeId, value: DataValue) {
        if !self.0.volatile {
            self.0.cache.lock().insert(target, value);
        }
    }

    pub fn lock_read(&self) {
        self.0.advisory.lock_read();
    }

    pub fn try_lock_read(&self) -> CoreResult<()> {
        self.0.advisory.try_lock_read()
    }

    pub fn lock_write(&self) {
        self.0.advisory.lock_write();
    }

    pub fn try_lock_write(&self) -> CoreResult<()> {
        self.0.advisory.try_lock_write()
    }

    pub fn unlock(&self) {
        self.0.advisory.unlock();
    }

    /// Assigns the next process-wide opaque id, or returns the one already
    /// assigned (opacify is idempotent).
    pub(crate) fn opacify(&self) -> u64 {
        let mut slot = self.0.opaque_id.lock();
        if let Some(id) = *slot {
            return id;
        }
        let id = NEXT_OPAQUE_ID.fetch_add(1, Ordering::Relaxed);
        *slot = Some(id);
        id
    }

    #[must_use]
    pub fn opaque_id(&self) -> Option<u64> {
        *self.0.opaque_id.lock()
    }

    /// Identity comparison: true if both handles point at the same
    /// underlying value.
    #[must_use]
    pub fn is_same(&self, other: &DataValue) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for DataValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataValue")
            .field("type_id", &self.type_id())
            .field("size", &self.size())
            .field("constant", &self.is_constant())
            .field("volatile", &self.is_volatile())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addref_and_unref_run_dispose_exactly_once() {
        let disposed = Arc::new(Mutex::new(0));
        let value = DataValue::create_copy(TypeId::I32, &42i32.to_le_bytes(), false, false);
        let counter = disposed.clone();
        value.on_dispose(move || {
            *counter.lock() += 1;
        });

        let clone1 = value.clone();
        let clone2 = value.clone();
        drop(value);
        drop(clone1);
        assert_eq!(*disposed.lock(), 0, "dispose must not run while refs remain");
        drop(clone2);
        assert_eq!(*disposed.lock(), 1);
    }

    #[test]
    fn constant_value_refuses_write_access() {
        let value = DataValue::create_copy(TypeId::I32, &[0u8; 4], true, false);
        assert!(value.write().is_err());
        assert!(value.read().len() == 4);
    }

    #[test]
    fn notify_changed_clears_cache_but_preserves_existing_holders() {
        let value = DataValue::create_copy(TypeId::I32, &[1, 0, 0, 0], false, false);
        let converted = DataValue::create_copy(TypeId::I64, &[1, 0, 0, 0, 0, 0, 0, 0], false, false);
        value.store_conversion(TypeId::I64, converted.clone());
        assert!(value.cached_conversion(TypeId::I64).is_some());

        value.notify_changed();
        assert!(value.cached_conversion(TypeId::I64).is_none());
        // The handle obtained before invalidation is still perfectly valid.
        assert_eq!(&*converted.read(), &[1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn opacify_is_idempotent_and_ids_are_unique() {
        let a = DataValue::create_copy(TypeId::OPAQUE, &[], false, false);
        let b = DataValue::create_copy(TypeId::OPAQUE, &[], false, false);
        let id_a1 = a.opacify();
        let id_a2 = a.opacify();
        let id_b = b.opacify();
        assert_eq!(id_a1, id_a2);
        assert_ne!(id_a1, id_b);
    }

    #[test]
    fn advisory_write_lock_excludes_try_read_and_try_write() {
        let value = DataValue::create_copy(TypeId::I32, &[0; 4], false, false);
        value.lock_write();
        assert_eq!(value.try_lock_read(), Err(CoreError::Busy));
        assert_eq!(value.try_lock_write(), Err(CoreError::Busy));
        value.unlock();
        assert!(value.try_lock_read().is_ok());
    }

    #[test]
    fn alias_keeps_the_original_alive_as_a_dependency() {
        let disposed = Arc::new(Mutex::new(false));
        let original = DataValue::create_copy(TypeId::BYTEARRAY, b"hello", false, false);
        let flag = disposed.clone();
        original.on_dispose(move || *flag.lock() = true);

        let aliased = original.alias(TypeId::STRINGZ);
        drop(original);
        assert!(!*disposed.lock(), "original must survive while aliased depends on it");
        assert_eq!(&*aliased.read(), b"hello");
        drop(aliased);
        assert!(*disposed.lock());
    }
}
