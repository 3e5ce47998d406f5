//! Script Threads
//!
//! `spawn` starts an OS thread with its own registered context, calls
//! the given function and keeps the result (or the escaped exception)
//! for `join`. Thread creation is serialized against GC engagement:
//! the collector holds the spawn mutex for a whole cycle, and spawn
//! holds it until the new thread's context is registered, so no
//! thread is ever created in the middle of a collection.
//!
//! Values cross threads through the instance's handoff table, which
//! the GC traces and updates; raw handle bits are never carried over
//! a window in which a collection could complete.

use std::sync::mpsc;
use std::thread::JoinHandle;

use crate::error::{ExcKind, Raised};
use crate::object::TypeTag;
use crate::runtime::Context;
use crate::value::Value;

enum Outcome {
    /// Handoff slot holding the returned value.
    Return(usize),
    /// Handoff slot holding the escaped exception.
    Exception(usize),
}

/// Handle to a spawned script thread.
pub struct VelaThread {
    handle: JoinHandle<Outcome>,
}

/// Launch `func` on a new OS thread with `this` and an argument array.
pub fn spawn(ctx: &Context, func: Value, this: Value, args: Value) -> Result<VelaThread, Raised> {
    if !matches!(ctx.type_of(func), TypeTag::Function | TypeTag::Class) {
        return Err(ctx.raise_kind(ExcKind::TypeError, "spawn needs a function"));
    }

    let instance = ctx.instance_arc();

    // Rooted handoff of the inputs; the child takes them after it has
    // registered.
    let (func_slot, this_slot, args_slot) = {
        let mut handoff = instance.threads.handoff.lock();
        (handoff.store(func), handoff.store(this), handoff.store(args))
    };

    // No collection cycle can start while we hold this. The collector
    // holds the same mutex for a whole cycle, so blocking on it here
    // would keep this thread from parking; park first instead.
    let spawn_guard = loop {
        if instance.gc.is_requested() {
            ctx.check_safepoint();
            continue;
        }
        match instance.threads.spawn_mutex.try_lock() {
            Some(guard) => break guard,
            None => std::thread::yield_now(),
        }
    };
    let (registered_tx, registered_rx) = mpsc::channel::<()>();

    let thread_instance = instance.clone();
    let handle = std::thread::Builder::new()
        .name("vela-thread".into())
        .spawn(move || {
            let child = Context::register(thread_instance.clone());
            let _ = registered_tx.send(());

            // From here on this thread participates in GC like any
            // other; the inputs go straight from rooted handoff slots
            // into rooted locals, with no safepoint in between.
            let (func, this, args) = {
                let mut handoff = thread_instance.threads.handoff.lock();
                (handoff.take(func_slot), handoff.take(this_slot), handoff.take(args_slot))
            };
            let func = child.init_ulocal(func);
            let this = child.init_ulocal(this);
            let args = child.init_ulocal(args);

            let result =
                crate::interp::call_function(&child, func.get(), this.get(), args.get());

            let outcome = match result {
                Ok(value) => {
                    let slot = thread_instance.threads.handoff.lock().store(value);
                    Outcome::Return(slot)
                }
                Err(Raised) => {
                    let exc = child.get_exception();
                    child.clear_exception();
                    let slot = thread_instance.threads.handoff.lock().store(exc);
                    Outcome::Exception(slot)
                }
            };
            drop(args);
            drop(this);
            drop(func);
            outcome
        });

    let handle = match handle {
        Ok(handle) => handle,
        Err(_) => {
            let mut handoff = instance.threads.handoff.lock();
            handoff.take(func_slot);
            handoff.take(this_slot);
            handoff.take(args_slot);
            return Err(ctx.raise_kind(ExcKind::InvalidValue, "thread creation failed"));
        }
    };

    // Wait for the child to register before a collection may run
    // again.
    let _ = registered_rx.recv();
    drop(spawn_guard);

    Ok(VelaThread { handle })
}

impl VelaThread {
    /// Wait for the thread and return its value, or re-raise its
    /// escaped exception on `ctx`. The wait suspends the calling
    /// context so it does not block collection.
    pub fn join(self, ctx: &Context) -> Result<Value, Raised> {
        ctx.suspend();
        let outcome = self.handle.join();
        ctx.resume();

        // This thread is running again, so no collection completes
        // between taking the slot and handing the value to the caller.
        match outcome {
            Ok(Outcome::Return(slot)) => {
                Ok(ctx.instance().threads.handoff.lock().take(slot))
            }
            Ok(Outcome::Exception(slot)) => {
                let exc = ctx.instance().threads.handoff.lock().take(slot);
                Err(ctx.raise(exc))
            }
            Err(_) => Err(ctx.raise_kind(ExcKind::InvalidValue, "thread panicked")),
        }
    }
}
