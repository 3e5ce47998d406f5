//! Parallel Marking
//!
//! Pending work travels in mark groups: bounded batches of object
//! references. Groups live in a two-tier stack: a fixed array of
//! lock-free quick-access slots, with a mutex-guarded overflow vector
//! behind it. A matching free stack recycles group allocations, which
//! are accounted against the side-allocation cap; if a group cannot
//! be allocated, the cycle records a mark error and skips evacuation.
//!
//! Color protocol: an object transitions white to grey when it is
//! first pushed, and grey to black once its fields have been pushed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;

use crate::heap::Heap;
use crate::value::Value;

/// Lock-free quick-access slots before the overflow stack engages.
const QUICK_SLOTS: usize = 16;

/// A bounded batch of pending object references.
pub(crate) struct MarkGroup {
    pub(crate) refs: Vec<Value>,
}

impl MarkGroup {
    fn with_capacity(capacity: usize) -> MarkGroup {
        MarkGroup { refs: Vec::with_capacity(capacity) }
    }

    /// Logical bytes charged against the side-allocation cap.
    pub(crate) fn charge(capacity: usize) -> usize {
        std::mem::size_of::<MarkGroup>() + capacity * 8
    }
}

/// Two-tier group container: quick lock-free slots plus an overflow
/// stack behind a mutex.
pub(crate) struct GroupStack {
    quick: ArrayQueue<Box<MarkGroup>>,
    overflow: Mutex<Vec<Box<MarkGroup>>>,
    count: AtomicUsize,
}

impl GroupStack {
    pub(crate) fn new() -> GroupStack {
        GroupStack {
            quick: ArrayQueue::new(QUICK_SLOTS),
            overflow: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn push(&self, group: Box<MarkGroup>) {
        self.count.fetch_add(1, Ordering::AcqRel);
        if let Err(group) = self.quick.push(group) {
            self.overflow.lock().push(group);
        }
    }

    pub(crate) fn pop(&self) -> Option<Box<MarkGroup>> {
        let group = self.quick.pop().or_else(|| self.overflow.lock().pop());
        if group.is_some() {
            self.count.fetch_sub(1, Ordering::AcqRel);
        }
        group
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.count.load(Ordering::Acquire) == 0
    }

    pub(crate) fn drain(&self) -> Vec<Box<MarkGroup>> {
        let mut groups = Vec::new();
        while let Some(group) = self.pop() {
            groups.push(group);
        }
        groups
    }
}

/// A worker's view of the cycle's shared marking state. The busy and
/// error flags live in the GC control block so the collector, its
/// scoped helpers and threads helping from a safepoint all agree on
/// termination.
pub(crate) struct Marker<'h> {
    heap: &'h Heap,
    pub(crate) pending: &'h GroupStack,
    free: &'h GroupStack,
    group_capacity: usize,
    /// Workers mid-group; used for termination detection.
    busy: &'h AtomicUsize,
    error: &'h AtomicBool,
}

impl<'h> Marker<'h> {
    pub(crate) fn new(
        heap: &'h Heap,
        pending: &'h GroupStack,
        free: &'h GroupStack,
        group_capacity: usize,
        busy: &'h AtomicUsize,
        error: &'h AtomicBool,
    ) -> Marker<'h> {
        Marker { heap, pending, free, group_capacity, busy, error }
    }

    /// Take a recycled group or allocate one against the cap.
    fn acquire_group(&self) -> Option<Box<MarkGroup>> {
        if let Some(mut group) = self.free.pop() {
            group.refs.clear();
            return Some(group);
        }
        if !self.heap.adjust_malloc(MarkGroup::charge(self.group_capacity) as isize) {
            self.error.store(true, Ordering::Release);
            return None;
        }
        Some(Box::new(MarkGroup::with_capacity(self.group_capacity)))
    }

    /// Mark one value grey and queue it, via the per-worker sink.
    fn push_ref(&self, sink: &mut Option<Box<MarkGroup>>, value: Value) {
        if !value.is_heap() {
            return;
        }
        let Some(obj) = self.heap.resolve(value.handle()) else {
            return;
        };
        if !obj.header.mark_grey() {
            return;
        }

        let group = match sink {
            Some(group) if group.refs.len() < self.group_capacity => group,
            _ => {
                if let Some(full) = sink.take() {
                    self.pending.push(full);
                }
                match self.acquire_group() {
                    Some(group) => {
                        *sink = Some(group);
                        sink.as_mut().unwrap()
                    }
                    // Marking is failing; blacken eagerly so the
                    // object is at least not freed this cycle.
                    None => {
                        obj.body.trace(&mut |child| {
                            if child.is_heap() {
                                if let Some(c) = self.heap.resolve(child.handle()) {
                                    c.header.mark_grey();
                                }
                            }
                        });
                        obj.header.mark_black();
                        return;
                    }
                }
            }
        };
        group.refs.push(value);
    }

    /// Seed the root set from a traced container.
    pub(crate) fn seed(&self, sink: &mut Option<Box<MarkGroup>>, trace: impl Fn(&mut dyn FnMut(Value))) {
        let mut visit = |value: Value| self.push_ref(sink, value);
        trace(&mut visit);
    }

    /// Flush a worker's partially filled sink.
    pub(crate) fn flush(&self, sink: &mut Option<Box<MarkGroup>>) {
        if let Some(group) = sink.take() {
            if group.refs.is_empty() {
                self.free.push(group);
            } else {
                self.pending.push(group);
            }
        }
    }

    /// Process groups until the pending stack drains and no worker is
    /// mid-group. The busy counter is raised before the pop so no
    /// worker ever holds a group while appearing idle.
    pub(crate) fn work(&self) {
        let mut sink: Option<Box<MarkGroup>> = None;
        loop {
            self.busy.fetch_add(1, Ordering::AcqRel);
            match self.pending.pop() {
                Some(group) => {
                    self.process_group(&mut sink, group);
                    self.flush(&mut sink);
                    self.busy.fetch_sub(1, Ordering::AcqRel);
                }
                None => {
                    self.busy.fetch_sub(1, Ordering::AcqRel);
                    if self.busy.load(Ordering::Acquire) == 0 && self.pending.is_empty() {
                        break;
                    }
                    std::thread::yield_now();
                }
            }
        }
        self.flush(&mut sink);
    }

    /// Drain whatever is currently pending, without waiting for other
    /// workers. Used by threads helping from a safepoint.
    pub(crate) fn drain_pending(&self) {
        let mut sink: Option<Box<MarkGroup>> = None;
        loop {
            self.busy.fetch_add(1, Ordering::AcqRel);
            match self.pending.pop() {
                Some(group) => {
                    self.process_group(&mut sink, group);
                    self.flush(&mut sink);
                    self.busy.fetch_sub(1, Ordering::AcqRel);
                }
                None => {
                    self.busy.fetch_sub(1, Ordering::AcqRel);
                    break;
                }
            }
        }
    }

    fn process_group(&self, sink: &mut Option<Box<MarkGroup>>, group: Box<MarkGroup>) {
        for &value in &group.refs {
            let Some(obj) = self.heap.resolve(value.handle()) else {
                continue;
            };
            obj.body.trace(&mut |child| self.push_ref(sink, child));
            obj.header.mark_black();
        }
        self.free.push(group);
    }
}
