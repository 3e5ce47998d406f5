//! Garbage Collector
//!
//! A single global heap collected by a multi-threaded mark-and-
//! evacuate cycle. Exactly one cycle runs at a time, triggered when
//! the used heap crosses the threshold or on explicit request; a
//! request made while a cycle is in progress joins it instead.
//!
//! Phases:
//!
//! 1. **Engage** — raise the request flag; wait until every other
//!    registered thread is parked at a safepoint or suspended.
//! 2. **Mark** — parallel tri-color marking through mark groups
//!    ([`mark`]); roots are the thread contexts, the module registry
//!    and the instance's prototype and constant tables.
//! 3. **Evacuate** — single-threaded relocation off sparse pages
//!    ([`evacuate`]); forward slots record the new handles.
//! 4. **Update** — parallel rewrite of every stored reference and all
//!    roots ([`update`]).
//! 5. **Finish** — reclaim dead objects and empty pages, run
//!    finalizers (never under the heap mutex), fill statistics,
//!    release parked threads.

pub(crate) mod evacuate;
pub(crate) mod mark;
pub mod stats;
pub(crate) mod update;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};
use parking_lot::{Condvar, Mutex};

use crate::config::Config;
use crate::error::Raised;
use crate::heap::Heap;
use crate::object::{GcColor, HeapObject};
use crate::runtime::{safepoint, Context, Instance};
use crate::value::Value;

use mark::{GroupStack, Marker};

pub use stats::GcStats;

/// Shared GC state on the instance.
pub(crate) struct GcControl {
    requested: AtomicBool,
    /// Protects the engagement handshake.
    pub(crate) sync: Mutex<()>,
    /// Collector waits here for mutators to park.
    pub(crate) engage_cond: Condvar,
    /// Mutators wait here for the cycle to end.
    pub(crate) release_cond: Condvar,

    /// Mark groups awaiting processing.
    pending: GroupStack,
    /// Recycled group containers.
    free_groups: GroupStack,
    mark_busy: AtomicUsize,
    mark_error: AtomicBool,
    marking_active: AtomicBool,
    group_capacity: usize,

    cycles: AtomicU32,
}

impl std::fmt::Debug for GcControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcControl")
            .field("requested", &self.is_requested())
            .field("cycles", &self.cycles.load(Ordering::Relaxed))
            .finish()
    }
}

impl GcControl {
    pub(crate) fn new(config: &Config) -> GcControl {
        GcControl {
            requested: AtomicBool::new(false),
            sync: Mutex::new(()),
            engage_cond: Condvar::new(),
            release_cond: Condvar::new(),
            pending: GroupStack::new(),
            free_groups: GroupStack::new(),
            mark_busy: AtomicUsize::new(0),
            mark_error: AtomicBool::new(false),
            marking_active: AtomicBool::new(false),
            group_capacity: config.mark_group_capacity,
            cycles: AtomicU32::new(0),
        }
    }

    #[inline]
    pub(crate) fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    pub(crate) fn set_requested(&self, value: bool) {
        self.requested.store(value, Ordering::Release);
    }

    pub(crate) fn cycles(&self) -> u32 {
        self.cycles.load(Ordering::Acquire)
    }

    fn marker<'h>(&'h self, heap: &'h Heap) -> Marker<'h> {
        Marker::new(
            heap,
            &self.pending,
            &self.free_groups,
            self.group_capacity,
            &self.mark_busy,
            &self.mark_error,
        )
    }
}

fn us(since: Instant) -> u32 {
    since.elapsed().as_micros().min(u32::MAX as u128) as u32
}

/// Visit every root of the instance.
fn trace_roots(instance: &Instance, visit: &mut dyn FnMut(Value)) {
    for state in instance.threads.contexts.lock().iter() {
        state.trace(visit);
    }
    instance.threads.handoff.lock().trace(visit);
    instance.prototypes.trace(visit);
    instance.consts.trace(visit);
    visit(instance.args.get());
    instance.modules.trace(visit);
}

/// Run a full collection cycle, filling `stats`.
///
/// If another cycle is already in progress, parks until it completes
/// and returns without running a second one.
pub fn collect(ctx: &Context, stats: &mut GcStats) -> Result<(), Raised> {
    let instance = ctx.instance();
    let gc = &instance.gc;
    let heap = instance.heap();

    // One cycle at a time: either join the running one, or take the
    // spawn mutex (also held by thread creation) and become the
    // collector. Blocking on the mutex while a collector waits for us
    // to park would deadlock, so only try it.
    let spawn_guard = loop {
        if gc.is_requested() {
            safepoint::park(ctx);
            return Ok(());
        }
        match instance.threads.spawn_mutex.try_lock() {
            Some(guard) => break guard,
            None => std::thread::yield_now(),
        }
    };

    let total_timer = Instant::now();
    stats.initial_heap_size = heap.heap_size() as u32;
    stats.initial_used_heap_size = heap.used_size() as u32;
    stats.initial_malloc_size = heap.malloc_size() as u32;

    debug!(
        "gc cycle {} starting: used {} of {} bytes",
        gc.cycles() + 1,
        heap.used_size(),
        heap.heap_size()
    );

    // Engage.
    let phase_timer = Instant::now();
    safepoint::engage(ctx);
    stats.time_stop_us = us(phase_timer);

    // Mark.
    let phase_timer = Instant::now();
    gc.mark_error.store(false, Ordering::Release);
    gc.marking_active.store(true, Ordering::Release);
    {
        let marker = gc.marker(heap);
        let mut sink = None;
        marker.seed(&mut sink, |visit| trace_roots(instance, visit));
        marker.flush(&mut sink);

        let helpers = instance.config().helper_threads();
        std::thread::scope(|scope| {
            for _ in 0..helpers {
                scope.spawn(|| gc.marker(heap).work());
            }
            marker.work();
        });
    }
    gc.marking_active.store(false, Ordering::Release);
    let mark_error = gc.mark_error.load(Ordering::Acquire);
    stats.time_mark_us = us(phase_timer);

    // Evacuate. A mark failure keeps every object where it is.
    let phase_timer = Instant::now();
    if !mark_error {
        evacuate::run(heap, instance.config().evac_density_pct, stats);
    }
    stats.time_evac_us = us(phase_timer);

    // Update pointers.
    let phase_timer = Instant::now();
    if !mark_error {
        update::run(ctx, instance.config().helper_threads());
    }
    stats.time_update_us = us(phase_timer);

    // Finish.
    let phase_timer = Instant::now();
    finish(ctx, stats, mark_error);
    heap.rearm_threshold();
    if instance.flags().contains(crate::config::InstanceFlags::DEBUG) {
        verify_heap(heap);
    }
    stats.time_finish_us = us(phase_timer);

    gc.cycles.fetch_add(1, Ordering::AcqRel);
    safepoint::release(ctx);
    drop(spawn_guard);

    stats.heap_size = heap.heap_size() as u32;
    stats.used_heap_size = heap.used_size() as u32;
    stats.malloc_size = heap.malloc_size() as u32;
    stats.time_total_us = us(total_timer);

    info!(
        "gc cycle {} done in {}us: freed {} objects ({} bytes), evacuated {}, finalized {}",
        gc.cycles(),
        stats.time_total_us,
        stats.num_objs_freed,
        stats.size_freed,
        stats.num_objs_evacuated,
        stats.num_objs_finalized,
    );

    if mark_error {
        Err(ctx.raise_oom())
    } else {
        Ok(())
    }
}

/// Reclaim dead objects and pages, clear cycle flags, run finalizers.
///
/// The page sweep is two-pass. An evacuated survivor is one object
/// behind two slots, and its new home can sit on a recycled page with
/// a lower index than its old one, so clearing the survivor's forward
/// slot while reclaiming in the same walk would make the old copy
/// indistinguishable from a dead object. Pass one reclaims with every
/// survivor header intact; pass two resets the cycle state on the
/// slots that remain.
fn finish(ctx: &Context, stats: &mut GcStats, mark_error: bool) {
    let instance = ctx.instance();
    let heap = instance.heap();

    if mark_error {
        // Marking did not complete; nothing may be freed. Clear the
        // colors so the next cycle starts clean.
        for page in heap.pages_snapshot() {
            page.for_each(|_, obj| obj.header.clear_color());
        }
        for (_, obj) in heap.large_snapshot() {
            obj.header.clear_color();
        }
        return;
    }

    let mut finalize: Vec<Arc<HeapObject>> = Vec::new();
    let pages = heap.pages_snapshot();

    // Pass one: reclaim dead objects and drop the old copies of
    // evacuated survivors.
    for page in &pages {
        let mut live = 0u32;
        for slot in 0..page.used_slots() {
            let Some(obj) = page.get(slot) else { continue };
            let here = Value::from_handle(crate::value::Handle(
                page.index() * crate::heap::SLOTS_PER_PAGE + slot,
            ));

            match obj.header.forward() {
                // New location of an evacuated object: a survivor.
                Some(target) if target == here => live += 1,
                // Old copy of an evacuated object; its bytes were
                // re-accounted at the new location during evacuation.
                Some(_) => {
                    page.set(slot, None);
                    page.shrink_bytes(obj.header.size());
                }
                None if obj.header.color() == GcColor::Black => live += 1,
                // Unreachable.
                None => {
                    stats.num_objs_freed += 1;
                    stats.size_freed += obj.header.size();
                    heap.shrink_used(obj.header.size() as usize);
                    page.shrink_bytes(obj.header.size());
                    let grown = obj.header.malloc_bytes();
                    if grown > 0 {
                        heap.adjust_malloc(-(grown as isize));
                    }
                    if obj.body.has_finalizer() {
                        finalize.push(obj.clone());
                    }
                    page.set(slot, None);
                }
            }
        }

        if live == 0 && page.used_slots() > 0 {
            page.reset();
            heap.release_page(page);
            stats.num_pages_freed += 1;
        } else if live > 0 {
            stats.num_pages_kept += 1;
            stats.size_kept += page.used_bytes();
        }
    }

    // Pass two: every slot still occupied is a survivor's canonical
    // location; reset its forward slot and color.
    for page in &pages {
        page.for_each(|_, obj| {
            obj.header.clear_forward();
            obj.header.clear_color();
        });
    }

    for (index, obj) in heap.large_snapshot() {
        if obj.header.color() == GcColor::Black {
            obj.header.clear_color();
        } else {
            if let Some(size) = heap.free_large(index) {
                stats.num_objs_freed += 1;
                stats.size_freed += size;
            }
            if obj.body.has_finalizer() {
                finalize.push(obj);
            }
        }
    }

    // Threads re-acquire allocation pages; theirs may just have been
    // reclaimed.
    for state in instance.threads.contexts.lock().iter() {
        state.cur_page.lock().take();
    }

    // Finalizers run last, after addresses are stable and with no heap
    // lock held.
    for obj in finalize {
        if obj.body.run_finalizer() {
            stats.num_objs_finalized += 1;
        }
    }
}

/// Post-cycle consistency check, run under the DEBUG instance flag:
/// every surviving object must be white again with a clear forward
/// slot.
fn verify_heap(heap: &Heap) {
    for page in heap.pages_snapshot() {
        page.for_each(|slot, obj| {
            assert_eq!(
                obj.header.color(),
                GcColor::White,
                "page {} slot {} kept its mark color",
                page.index(),
                slot
            );
            assert!(obj.header.forward().is_none(), "forward slot survived the cycle");
        });
    }
    for (index, obj) in heap.large_snapshot() {
        assert_eq!(obj.header.color(), GcColor::White, "large object {} kept its mark color", index);
    }
}

/// Help an in-progress collection: appear parked so engagement can
/// proceed, then drain mark groups while the marking phase runs.
pub(crate) fn help(ctx: &Context) {
    use crate::runtime::context::{THREAD_PARKED, THREAD_RUNNING};
    use std::time::Duration;

    let gc = &ctx.instance().gc;
    if !gc.is_requested() {
        return;
    }

    let mut guard = gc.sync.lock();
    ctx.state.gc_state.store(THREAD_PARKED, Ordering::Release);
    gc.engage_cond.notify_all();

    while gc.is_requested() {
        if gc.marking_active.load(Ordering::Acquire) {
            drop(guard);
            gc.marker(ctx.instance().heap()).drain_pending();
            guard = gc.sync.lock();
        } else {
            gc.release_cond.wait_for(&mut guard, Duration::from_millis(1));
        }
    }

    ctx.state.gc_state.store(THREAD_RUNNING, Ordering::Release);
    drop(guard);
}
