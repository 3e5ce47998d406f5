//! Pointer Update
//!
//! After evacuation every stored reference that points at a forwarded
//! object is rewritten to the new handle. Live objects are re-walked
//! in parallel: worker threads claim pages through a shared cursor
//! (the collector walks the large-object table and the roots itself).
//! Rewriting is idempotent, so an object reachable through both its
//! old and new slot may be visited twice without harm.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::heap::Heap;
use crate::object::GcColor;
use crate::runtime::{Context, Instance};
use crate::value::Value;

/// Map a value through the forward slot of its target, if any.
fn remap(heap: &Heap, value: Value) -> Value {
    if !value.is_heap() {
        return value;
    }
    match heap.resolve(value.handle()) {
        Some(obj) => obj.header.forward().unwrap_or(value),
        None => value,
    }
}

pub(crate) fn run(ctx: &Context, helper_threads: usize) {
    let instance = ctx.instance();
    let heap = instance.heap();
    let pages = heap.pages_snapshot();
    let cursor = AtomicUsize::new(0);

    let workers = helper_threads.max(1);
    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                let remap_fn = |v: Value| remap(heap, v);
                loop {
                    let index = cursor.fetch_add(1, Ordering::AcqRel);
                    let Some(page) = pages.get(index) else {
                        break;
                    };
                    page.for_each(|_, obj| {
                        if obj.header.color() == GcColor::Black {
                            obj.body.update_refs(&remap_fn);
                        }
                    });
                }
            });
        }

        // The collector fixes up the side table and every root set.
        let remap_fn = |v: Value| remap(heap, v);
        for (_, obj) in heap.large_snapshot() {
            if obj.header.color() == GcColor::Black {
                obj.body.update_refs(&remap_fn);
            }
        }
        update_roots(instance, &remap_fn);
    });
}

fn update_roots(instance: &Instance, remap_fn: &dyn Fn(Value) -> Value) {
    for state in instance.threads.contexts.lock().iter() {
        state.update_refs(remap_fn);
    }
    instance.threads.handoff.lock().update_refs(remap_fn);
    instance.prototypes.update_refs(remap_fn);
    instance.consts.update_refs(remap_fn);
    instance.args.set(remap_fn(instance.args.get()));
    instance.modules.update_refs(remap_fn);
}
