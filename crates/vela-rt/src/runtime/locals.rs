//! Local Roots
//!
//! Native code holds heap references in Rust variables the collector
//! cannot see. Registering them as locals puts them on the thread's
//! root lists, where marking finds them and the pointer-update phase
//! rewrites them after evacuation.
//!
//! Two disciplines, matching two lifetimes of native state:
//!
//! - [`Local`]: scoped acquisition, released LIFO (grouped releases
//!   leave tombstones that are trimmed when the scope unwinds).
//! - [`ULocal`]: long-lived native state, released in any order.
//!
//! Both are RAII guards; reading a value back after a possible
//! collection must go through `get`, never through a stale copy.

use crate::runtime::Context;
use crate::value::Value;

/// The thread's root lists. The collector walks both.
#[derive(Debug, Default)]
pub(crate) struct LocalRoots {
    /// Scoped roots, stack-ordered. Releasing a group member out of
    /// strict order leaves a tombstone that is trimmed once the
    /// entries above it go away.
    ordered: Vec<Option<Value>>,
    /// Unordered roots; freed entries go on the free list.
    unordered: Vec<Option<Value>>,
    unordered_free: Vec<usize>,
}

impl LocalRoots {
    pub(crate) fn is_empty(&self) -> bool {
        self.ordered.is_empty() && self.unordered.iter().all(|slot| slot.is_none())
    }

    pub(crate) fn trace(&self, visit: &mut dyn FnMut(Value)) {
        for value in self.ordered.iter().flatten() {
            visit(*value);
        }
        for value in self.unordered.iter().flatten() {
            visit(*value);
        }
    }

    pub(crate) fn update_refs(&mut self, remap: &dyn Fn(Value) -> Value) {
        for slot in self.ordered.iter_mut().chain(self.unordered.iter_mut()) {
            if let Some(value) = slot {
                *value = remap(*value);
            }
        }
    }
}

/// Scoped local root, released LIFO on drop.
pub struct Local<'a> {
    ctx: &'a Context,
    index: usize,
}

impl<'a> Local<'a> {
    pub(crate) fn push(ctx: &'a Context, value: Value) -> Local<'a> {
        let mut roots = ctx.state.locals.lock();
        roots.ordered.push(Some(value));
        let index = roots.ordered.len() - 1;
        Local { ctx, index }
    }

    /// Current value; re-read after any operation that may collect.
    pub fn get(&self) -> Value {
        self.ctx.state.locals.lock().ordered[self.index].expect("live local")
    }

    pub fn set(&self, value: Value) {
        self.ctx.state.locals.lock().ordered[self.index] = Some(value);
    }

    /// Release the root and hand back its final value.
    pub fn take(self) -> Value {
        self.get()
    }
}

impl Drop for Local<'_> {
    fn drop(&mut self) {
        let mut roots = self.ctx.state.locals.lock();
        roots.ordered[self.index] = None;
        while roots.ordered.last().is_some_and(|slot| slot.is_none()) {
            roots.ordered.pop();
        }
    }
}

/// Unordered local root, released on drop in any order.
pub struct ULocal<'a> {
    ctx: &'a Context,
    index: usize,
}

impl<'a> ULocal<'a> {
    pub(crate) fn insert(ctx: &'a Context, value: Value) -> ULocal<'a> {
        let mut roots = ctx.state.locals.lock();
        let index = match roots.unordered_free.pop() {
            Some(index) => {
                roots.unordered[index] = Some(value);
                index
            }
            None => {
                roots.unordered.push(Some(value));
                roots.unordered.len() - 1
            }
        };
        ULocal { ctx, index }
    }

    pub fn get(&self) -> Value {
        self.ctx.state.locals.lock().unordered[self.index].expect("live ulocal")
    }

    pub fn set(&self, value: Value) {
        self.ctx.state.locals.lock().unordered[self.index] = Some(value);
    }

    pub fn take(self) -> Value {
        self.get()
    }
}

impl Drop for ULocal<'_> {
    fn drop(&mut self) {
        let mut roots = self.ctx.state.locals.lock();
        roots.unordered[self.index] = None;
        roots.unordered_free.push(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceFlags;
    use crate::runtime::Instance;

    #[test]
    fn test_ordered_locals_lifo() {
        let (_inst, ctx) = Instance::init(InstanceFlags::NONE).unwrap();
        {
            let a = ctx.init_local_with(Value::from_small_int(1));
            let b = ctx.init_local_with(Value::from_small_int(2));
            assert_eq!(a.get(), Value::from_small_int(1));
            assert_eq!(b.get(), Value::from_small_int(2));

            b.set(Value::from_small_int(20));
            assert_eq!(b.take(), Value::from_small_int(20));
            drop(a);
        }
        assert!(ctx.state.locals.lock().is_empty());
    }

    #[test]
    fn test_unordered_locals_any_order() {
        let (_inst, ctx) = Instance::init(InstanceFlags::NONE).unwrap();
        let a = ctx.init_ulocal(Value::from_small_int(1));
        let b = ctx.init_ulocal(Value::from_small_int(2));
        let c = ctx.init_ulocal(Value::from_small_int(3));

        drop(b);
        let d = ctx.init_ulocal(Value::from_small_int(4));
        assert_eq!(a.get(), Value::from_small_int(1));
        assert_eq!(c.get(), Value::from_small_int(3));
        assert_eq!(d.get(), Value::from_small_int(4));

        drop(a);
        drop(d);
        drop(c);
        assert!(ctx.state.locals.lock().is_empty());
    }

    #[test]
    fn test_init_locals_array() {
        let (_inst, ctx) = Instance::init(InstanceFlags::NONE).unwrap();
        {
            let locals = ctx.init_locals::<3>();
            locals[2].set(Value::from_small_int(9));
            assert!(locals[0].get().is_bad());
            assert_eq!(locals[2].get(), Value::from_small_int(9));
        }
        assert!(ctx.state.locals.lock().is_empty());
    }
}
