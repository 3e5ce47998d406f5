//! Heap Pages
//!
//! A page is a fixed set of object slots filled bump-pointer from the
//! start, plus a logical byte budget. Exactly one thread allocates
//! into a page at a time (each thread owns its current page; the
//! collector owns its evacuation targets), so the bump cursor is a
//! plain atomic. Slot contents are guarded per-slot so readers can
//! resolve handles while other slots are being written.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;

use crate::object::HeapObject;

/// Object slots per page.
pub const SLOTS_PER_PAGE: u32 = 256;

/// Logical byte budget of one page.
pub const PAGE_BYTES: u32 = 64 * 1024;

/// Objects at least this large go to the large-object side table.
pub const LARGE_OBJECT_THRESHOLD: u32 = PAGE_BYTES / 2;

type Slot = RwLock<Option<Arc<HeapObject>>>;

pub struct Page {
    index: u32,
    slots: Vec<Slot>,
    /// Bump cursor; saturates at SLOTS_PER_PAGE.
    next_slot: AtomicU32,
    /// Logical bytes placed on this page.
    used_bytes: AtomicU32,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("index", &self.index)
            .field("next_slot", &self.next_slot.load(Ordering::Relaxed))
            .field("used_bytes", &self.used_bytes.load(Ordering::Relaxed))
            .finish()
    }
}

impl Page {
    pub fn new(index: u32) -> Page {
        let slots = (0..SLOTS_PER_PAGE).map(|_| RwLock::new(None)).collect();
        Page {
            index,
            slots,
            next_slot: AtomicU32::new(0),
            used_bytes: AtomicU32::new(0),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Bump-allocate a slot for `obj`. Returns the slot index, or
    /// `None` when the page is out of slots or past its byte budget.
    pub fn try_alloc(&self, obj: &Arc<HeapObject>) -> Option<u32> {
        let size = obj.header.size();
        if self.used_bytes.load(Ordering::Relaxed) + size > PAGE_BYTES {
            return None;
        }
        let slot = self.next_slot.fetch_add(1, Ordering::AcqRel);
        if slot >= SLOTS_PER_PAGE {
            self.next_slot.store(SLOTS_PER_PAGE, Ordering::Release);
            return None;
        }
        self.used_bytes.fetch_add(size, Ordering::AcqRel);
        *self.slots[slot as usize].write() = Some(obj.clone());
        Some(slot)
    }

    pub fn get(&self, slot: u32) -> Option<Arc<HeapObject>> {
        self.slots[slot as usize].read().clone()
    }

    /// Overwrite a slot. GC use only, with mutators parked.
    pub fn set(&self, slot: u32, value: Option<Arc<HeapObject>>) {
        *self.slots[slot as usize].write() = value;
    }

    /// Slots handed out so far.
    pub fn used_slots(&self) -> u32 {
        self.next_slot.load(Ordering::Acquire).min(SLOTS_PER_PAGE)
    }

    pub fn used_bytes(&self) -> u32 {
        self.used_bytes.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.used_slots() == 0
    }

    /// Iterate occupied slots.
    pub fn for_each(&self, mut f: impl FnMut(u32, &Arc<HeapObject>)) {
        for slot in 0..self.used_slots() {
            let guard = self.slots[slot as usize].read();
            if let Some(obj) = guard.as_ref() {
                f(slot, obj);
            }
        }
    }

    /// Reset to pristine for the free list. GC use only.
    pub fn reset(&self) {
        for slot in 0..self.used_slots() {
            *self.slots[slot as usize].write() = None;
        }
        self.next_slot.store(0, Ordering::Release);
        self.used_bytes.store(0, Ordering::Release);
    }

    /// Subtract logical bytes for objects freed in place.
    pub fn shrink_bytes(&self, bytes: u32) {
        self.used_bytes.fetch_sub(bytes.min(self.used_bytes()), Ordering::AcqRel);
    }
}
