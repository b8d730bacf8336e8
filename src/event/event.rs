//! Event identity and the process-wide 16-bit ID allocator
//! (`spec.md` §4.3).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{CoreError, CoreResult};

struct Inner {
    id: u16,
    fullname: String,
    refcount: AtomicU32,
}

/// A refcounted event identity. Cloning does not addref — use
/// [`Event::addref`]/[`Event::unref`] to manage the shared refcount
/// explicitly, since an `Event` handle may outlive the fabric's own
/// internal copy.
#[derive(Clone)]
pub struct Event(Arc<Inner>);

impl Event {
    #[must_use]
    pub fn id(&self) -> u16 {
        self.0.id
    }

    #[must_use]
    pub fn fullname(&self) -> &str {
        &self.0.fullname
    }

    pub fn addref(&self) {
        self.0.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the refcount, returning the count observed *after* the
    /// decrement. The fabric destroys the event (freeing its ID) when this
    /// reaches zero.
    pub fn unref(&self) -> u32 {
        self.0.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    #[must_use]
    pub fn refcount(&self) -> u32 {
        self.0.refcount.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_same(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Process-wide allocator of 16-bit event IDs. Capacity is 65 535 live
/// events (ID 0 is reserved/never issued). IDs are drawn from a counter
/// that wraps and skips any ID still in the free list's "in use" set,
/// so a freed ID is reused only after the counter wraps back around —
/// never while some other live event still holds it, and never
/// immediately after release (matching "a counter that never repeats a
/// live ID").
pub struct EventIdAllocator {
    next: Mutex<AllocatorState>,
}

struct AllocatorState {
    cursor: u16,
    live: std::collections::HashSet<u16>,
}

impl Default for EventIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl EventIdAllocator {
    #[must_use]
    pub fn new() -> Self {
        EventIdAllocator {
            next: Mutex::new(AllocatorState {
                cursor: 0,
                live: std::collections::HashSet::new(),
            }),
        }
    }

    pub fn allocate(&self) -> CoreResult<u16> {
        let mut state = self.next.lock();
        if state.live.len() >= usize::from(u16::MAX) {
            return Err(CoreError::Overflow);
        }
        loop {
            state.cursor = state.cursor.wrapping_add(1);
            if state.cursor == 0 {
                continue;
            }
            if !state.live.contains(&state.cursor) {
                state.live.insert(state.cursor);
                return Ok(state.cursor);
            }
        }
    }

    pub fn release(&self, id: u16) {
        self.next.lock().live.remove(&id);
    }
}

pub(crate) fn new_event(id: u16, fullname: String) -> Event {
    Event(Arc::new(Inner {
        id,
        fullname,
        refcount: AtomicU32::new(1),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_never_hands_out_a_live_id_twice() {
        let alloc = EventIdAllocator::new();
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        assert_ne!(a, b);
        assert_ne!(a, 0);
    }

    #[test]
    fn released_ids_are_eligible_for_reuse() {
        let alloc = EventIdAllocator::new();
        let a = alloc.allocate().unwrap();
        alloc.release(a);
        // Not guaranteed to be the *next* id (counter keeps advancing), but
        // it must no longer be blocked from reuse.
        let mut saw_reuse = false;
        for _ in 0..u16::MAX {
            let id = alloc.allocate().unwrap();
            alloc.release(id);
            if id == a {
                saw_reuse = true;
                break;
            }
        }
        assert!(saw_reuse);
    }

    #[test]
    fn event_refcount_tracks_addref_and_unref() {
        let ev = new_event(1, "demo".to_owned());
        assert_eq!(ev.refcount(), 1);
        ev.addref();
        assert_eq!(ev.refcount(), 2);
        assert_eq!(ev.unref(), 1);
    }
}
