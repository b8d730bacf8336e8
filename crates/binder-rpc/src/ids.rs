//! Small-integer id allocators shared by the stub's call table and its
//! proxy tables. Grounded on the same wrapping-counter-that-skips-live-
//! ids pattern as `binder_core::event::EventIdAllocator`, but capped at
//! `spec.md` §4.7.4's 4095 outstanding calls rather than `u16::MAX`.

use std::collections::HashSet;

use binder_core::CoreError;

pub const MAX_OUTSTANDING_CALLS: usize = 4095;

pub struct CallIdAllocator {
    cursor: u16,
    live: HashSet<u16>,
    /// Registration order of the currently-live ids, oldest first.
    /// `drain` walks this instead of `live` directly, since a `HashSet`'s
    /// iteration order is arbitrary and unrelated to allocation order.
    order: Vec<u16>,
}

impl Default for CallIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl CallIdAllocator {
    #[must_use]
    pub fn new() -> Self {
        CallIdAllocator { cursor: 0, live: HashSet::new(), order: Vec::new() }
    }

    /// Allocates the next free id, skipping 0 and any id still in use.
    /// Errors once 4095 ids are outstanding simultaneously.
    pub fn allocate(&mut self) -> Result<u16, CoreError> {
        if self.live.len() >= MAX_OUTSTANDING_CALLS {
            return Err(CoreError::Overflow);
        }
        loop {
            self.cursor = self.cursor.wrapping_add(1);
            if self.cursor == 0 {
                continue;
            }
            if self.live.insert(self.cursor) {
                self.order.push(self.cursor);
                return Ok(self.cursor);
            }
        }
    }

    pub fn release(&mut self, id: u16) {
        if self.live.remove(&id) {
            self.order.retain(|&live_id| live_id != id);
        }
    }

    #[must_use]
    pub fn is_live(&self, id: u16) -> bool {
        self.live.contains(&id)
    }

    /// Returns every currently-live id in the order it was registered,
    /// oldest first, clearing the allocator.
    pub fn drain(&mut self) -> Vec<u16> {
        self.live.clear();
        std::mem::take(&mut self.order)
    }
}
