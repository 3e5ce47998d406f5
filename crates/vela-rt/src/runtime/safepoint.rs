//! Safepoints and the GC Engagement Protocol
//!
//! The collector raises a global request flag; every other registered
//! thread observes it at a safepoint (backward branches, calls, the
//! allocation slow path, native API entry) and parks on the release
//! condvar. The collector waits on the engagement condvar until every
//! other thread is parked or suspended, runs the cycle, clears the
//! flag and broadcasts the release.
//!
//! Suspended threads are implicitly parked: their registers are
//! settled in the context, so the collector does not wait for them.
//! Resuming while a cycle runs blocks until the release broadcast.

use std::sync::atomic::Ordering;

use crate::runtime::context::{THREAD_PARKED, THREAD_RUNNING, THREAD_SUSPENDED};
use crate::runtime::Context;

/// Observe a pending GC request; park until released.
pub(crate) fn check(ctx: &Context) {
    if !ctx.instance.gc.is_requested() {
        return;
    }
    park(ctx);
}

/// Park the thread for the duration of the current cycle.
pub(crate) fn park(ctx: &Context) {
    let gc = &ctx.instance.gc;

    let mut guard = gc.sync.lock();
    ctx.state.gc_state.store(THREAD_PARKED, Ordering::Release);
    gc.engage_cond.notify_all();

    while gc.is_requested() {
        gc.release_cond.wait(&mut guard);
    }

    ctx.state.gc_state.store(THREAD_RUNNING, Ordering::Release);
}

/// Transition to the suspended state before blocking native work.
pub(crate) fn suspend(ctx: &Context) {
    let gc = &ctx.instance.gc;
    let _guard = gc.sync.lock();
    ctx.state.gc_state.store(THREAD_SUSPENDED, Ordering::Release);
    gc.engage_cond.notify_all();
}

/// Return to the running state; blocks while a cycle is in progress.
pub(crate) fn resume(ctx: &Context) {
    let gc = &ctx.instance.gc;
    let mut guard = gc.sync.lock();
    while gc.is_requested() {
        gc.release_cond.wait(&mut guard);
    }
    ctx.state.gc_state.store(THREAD_RUNNING, Ordering::Release);
}

/// Collector side: raise the request flag and wait until every other
/// registered thread is parked or suspended.
pub(crate) fn engage(ctx: &Context) {
    let gc = &ctx.instance.gc;
    gc.set_requested(true);

    let mut guard = gc.sync.lock();
    loop {
        let all_quiet = {
            let contexts = ctx.instance.threads.contexts.lock();
            contexts.iter().all(|state| {
                std::sync::Arc::ptr_eq(state, &ctx.state)
                    || state.gc_state.load(Ordering::Acquire) != THREAD_RUNNING
            })
        };
        if all_quiet {
            break;
        }
        gc.engage_cond.wait(&mut guard);
    }
}

/// Collector side: clear the flag and release parked threads.
pub(crate) fn release(ctx: &Context) {
    let gc = &ctx.instance.gc;
    let _guard = gc.sync.lock();
    gc.set_requested(false);
    gc.release_cond.notify_all();
}
