//! Heap
//!
//! A page table plus a large-object side table. Value identifiers
//! carry handles (`page * SLOTS_PER_PAGE + slot`, or a side table
//! index with the large bit set); resolution goes through this module,
//! which is what makes GC forwarding a mechanical handle rewrite.
//!
//! Locking: the global page lists (free list, table growth) are behind
//! the heap mutex; the hot allocation path bumps the current page's
//! cursor without touching it. The page table itself is read-mostly.

pub mod page;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::config::Config;
use crate::object::HeapObject;
use crate::value::Handle;

pub use page::{Page, LARGE_OBJECT_THRESHOLD, PAGE_BYTES, SLOTS_PER_PAGE};

pub struct Heap {
    max_heap_size: usize,
    max_malloc_size: usize,

    /// Page table; index is the page id. Pages are recycled through
    /// the free list, never removed.
    pages: RwLock<Vec<Arc<Page>>>,
    /// Ids of pristine pages available for reuse.
    free_pages: Mutex<Vec<u32>>,

    /// Large objects, indexed by the handle's low bits.
    large: RwLock<Vec<Option<Arc<HeapObject>>>>,
    large_free: Mutex<Vec<u32>>,

    /// Logical bytes of live page objects.
    used_size: AtomicUsize,
    /// Logical bytes of side allocations: large objects, growable
    /// storage, mark groups.
    malloc_size: AtomicUsize,
    /// Used-size level that triggers the next automatic collection.
    gc_threshold: AtomicUsize,
    gc_step: usize,
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("pages", &self.pages.read().len())
            .field("used_size", &self.used_size.load(Ordering::Relaxed))
            .field("malloc_size", &self.malloc_size.load(Ordering::Relaxed))
            .finish()
    }
}

impl Heap {
    pub fn new(config: &Config) -> Heap {
        Heap {
            max_heap_size: config.max_heap_size,
            max_malloc_size: config.max_malloc_size,
            pages: RwLock::new(Vec::new()),
            free_pages: Mutex::new(Vec::new()),
            large: RwLock::new(Vec::new()),
            large_free: Mutex::new(Vec::new()),
            used_size: AtomicUsize::new(0),
            malloc_size: AtomicUsize::new(0),
            gc_threshold: AtomicUsize::new(config.gc_threshold),
            gc_step: config.gc_step,
        }
    }

    // === Accounting ===

    pub fn heap_size(&self) -> usize {
        self.pages.read().len() * PAGE_BYTES as usize
    }

    pub fn used_size(&self) -> usize {
        self.used_size.load(Ordering::Acquire)
    }

    pub fn malloc_size(&self) -> usize {
        self.malloc_size.load(Ordering::Acquire)
    }

    pub fn gc_threshold(&self) -> usize {
        self.gc_threshold.load(Ordering::Acquire)
    }

    /// True when an allocation of `size` more bytes crosses the GC
    /// threshold.
    pub fn crosses_threshold(&self, size: usize) -> bool {
        self.used_size() + size > self.gc_threshold()
    }

    /// Reset the threshold after a collection.
    pub fn rearm_threshold(&self) {
        let next = (self.used_size() + self.gc_step).min(self.max_heap_size);
        self.gc_threshold.store(next, Ordering::Release);
    }

    /// Account side-allocation growth (or release, with a negative
    /// delta). Fails when the cap would be exceeded.
    pub fn adjust_malloc(&self, delta: isize) -> bool {
        if delta >= 0 {
            let prev = self.malloc_size.fetch_add(delta as usize, Ordering::AcqRel);
            if prev + delta as usize > self.max_malloc_size {
                self.malloc_size.fetch_sub(delta as usize, Ordering::AcqRel);
                return false;
            }
            true
        } else {
            let sub = (-delta) as usize;
            let mut current = self.malloc_size.load(Ordering::Acquire);
            loop {
                let new = current.saturating_sub(sub);
                match self.malloc_size.compare_exchange_weak(
                    current,
                    new,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return true,
                    Err(v) => current = v,
                }
            }
        }
    }

    // === Resolution ===

    /// Resolve a handle to its object.
    pub fn resolve(&self, handle: Handle) -> Option<Arc<HeapObject>> {
        if handle.is_large() {
            return self.large.read().get(handle.index() as usize)?.clone();
        }
        let page_idx = (handle.index() / SLOTS_PER_PAGE) as usize;
        let slot = handle.index() % SLOTS_PER_PAGE;
        let page = self.pages.read().get(page_idx)?.clone();
        page.get(slot)
    }

    // === Page management ===

    /// Take a pristine page from the free list, or grow the table.
    /// `None` when the heap cap is reached.
    pub fn acquire_page(&self) -> Option<Arc<Page>> {
        if let Some(index) = self.free_pages.lock().pop() {
            return Some(self.pages.read()[index as usize].clone());
        }
        let mut pages = self.pages.write();
        if (pages.len() + 1) * PAGE_BYTES as usize > self.max_heap_size {
            return None;
        }
        let page = Arc::new(Page::new(pages.len() as u32));
        pages.push(page.clone());
        Some(page)
    }

    /// Place an object on `page`; returns its handle and accounts the
    /// bytes.
    pub fn place(&self, page: &Page, obj: &Arc<HeapObject>) -> Option<Handle> {
        let size = obj.header.size() as usize;
        let slot = page.try_alloc(obj)?;
        self.used_size.fetch_add(size, Ordering::AcqRel);
        Some(Handle(page.index() * SLOTS_PER_PAGE + slot))
    }

    /// Return a pristine page to the free list. GC use.
    pub fn release_page(&self, page: &Page) {
        debug_assert!(page.is_empty());
        self.free_pages.lock().push(page.index());
    }

    /// Subtract freed page-object bytes. GC use.
    pub fn shrink_used(&self, bytes: usize) {
        let mut current = self.used_size.load(Ordering::Acquire);
        loop {
            let new = current.saturating_sub(bytes);
            match self.used_size.compare_exchange_weak(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(v) => current = v,
            }
        }
    }

    /// Snapshot the page table. GC use.
    pub fn pages_snapshot(&self) -> Vec<Arc<Page>> {
        self.pages.read().clone()
    }

    pub fn free_page_count(&self) -> usize {
        self.free_pages.lock().len()
    }

    // === Large objects ===

    /// Install a large object in the side table. Accounts against the
    /// side-allocation cap.
    pub fn alloc_large(&self, obj: Arc<HeapObject>) -> Option<Handle> {
        let size = obj.header.size() as isize;
        if !self.adjust_malloc(size) {
            return None;
        }
        let index = match self.large_free.lock().pop() {
            Some(index) => {
                let table = self.large.read();
                debug_assert!(table[index as usize].is_none());
                drop(table);
                self.large.write()[index as usize] = Some(obj);
                index
            }
            None => {
                let mut table = self.large.write();
                table.push(Some(obj));
                (table.len() - 1) as u32
            }
        };
        Some(Handle::large(index))
    }

    /// Drop a large object, releasing its allocation charge and any
    /// storage growth recorded on its header. GC use.
    pub fn free_large(&self, index: u32) -> Option<u32> {
        let removed = self.large.write()[index as usize].take();
        match removed {
            Some(obj) => {
                let size = obj.header.size();
                let grown = obj.header.malloc_bytes();
                self.adjust_malloc(-((size + grown) as isize));
                self.large_free.lock().push(index);
                Some(size)
            }
            None => None,
        }
    }

    /// Snapshot occupied side table entries. GC use.
    pub fn large_snapshot(&self) -> Vec<(u32, Arc<HeapObject>)> {
        self.large
            .read()
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|obj| (i as u32, obj.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{HeapObject, ObjBody};

    fn heap() -> Heap {
        Heap::new(&Config::default())
    }

    fn obj(i: i64) -> Arc<HeapObject> {
        Arc::new(HeapObject::new(ObjBody::Integer(i)))
    }

    #[test]
    fn test_place_and_resolve() {
        let heap = heap();
        let page = heap.acquire_page().unwrap();
        let handle = heap.place(&page, &obj(42)).unwrap();

        let found = heap.resolve(handle).unwrap();
        match found.body {
            ObjBody::Integer(i) => assert_eq!(i, 42),
            _ => panic!("wrong body"),
        }
        assert!(heap.used_size() > 0);
    }

    #[test]
    fn test_resolve_unknown_handle() {
        let heap = heap();
        assert!(heap.resolve(Handle(12345)).is_none());
        assert!(heap.resolve(Handle::large(0)).is_none());
    }

    #[test]
    fn test_large_objects_round_trip() {
        let heap = heap();
        let handle = heap.alloc_large(obj(7)).unwrap();
        assert!(handle.is_large());
        assert!(heap.resolve(handle).is_some());
        assert!(heap.malloc_size() > 0);

        heap.free_large(handle.index());
        assert!(heap.resolve(handle).is_none());
        assert_eq!(heap.malloc_size(), 0);

        // Freed index is recycled.
        let again = heap.alloc_large(obj(8)).unwrap();
        assert_eq!(again.index(), handle.index());
    }

    #[test]
    fn test_heap_cap_limits_pages() {
        let config = Config {
            max_heap_size: PAGE_BYTES as usize * 2,
            ..Default::default()
        };
        let heap = Heap::new(&config);
        assert!(heap.acquire_page().is_some());
        assert!(heap.acquire_page().is_some());
        assert!(heap.acquire_page().is_none());
    }

    #[test]
    fn test_malloc_cap() {
        let config = Config { max_malloc_size: 100, ..Default::default() };
        let heap = Heap::new(&config);
        assert!(heap.adjust_malloc(60));
        assert!(!heap.adjust_malloc(60));
        assert!(heap.adjust_malloc(-60));
        assert!(heap.adjust_malloc(60));
    }
}
