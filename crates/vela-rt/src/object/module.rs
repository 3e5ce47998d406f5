//! Module Objects
//!
//! A loaded module owns its bytecode blob, constant pool, global
//! table and address-to-line map. Registering a new global takes the
//! per-module lock; reads of existing globals go through the slot
//! index without rehashing.

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::error::{ExcKind, Raised};
use crate::object::props::{PrivFinalizer, PrivateSlot};
use crate::object::ObjBody;
use crate::runtime::Context;
use crate::value::{Value, ValueCell};

#[derive(Debug)]
pub struct ModuleObj {
    pub name: Box<str>,
    pub path: Box<str>,
    /// Position in the instance's module registry.
    pub index: u32,
    pub bytecode: Box<[u8]>,
    pub constants: Box<[ValueCell]>,
    /// Sorted (bytecode offset, source line) pairs.
    pub line_table: Box<[(u32, u32)]>,
    /// Function value running the module's top-level code.
    pub main_fn: ValueCell,
    global_names: RwLock<FxHashMap<Box<str>, u32>>,
    globals: RwLock<Vec<ValueCell>>,
    private: Mutex<Option<PrivateSlot>>,
}

impl ModuleObj {
    pub fn new(
        name: &str,
        path: &str,
        index: u32,
        bytecode: Box<[u8]>,
        constants: Vec<Value>,
        line_table: Vec<(u32, u32)>,
    ) -> ModuleObj {
        ModuleObj {
            name: name.into(),
            path: path.into(),
            index,
            bytecode,
            constants: constants.into_iter().map(ValueCell::new).collect(),
            line_table: line_table.into_boxed_slice(),
            main_fn: ValueCell::bad(),
            global_names: RwLock::new(FxHashMap::default()),
            globals: RwLock::new(Vec::new()),
            private: Mutex::new(None),
        }
    }

    pub fn payload_size(&self) -> u32 {
        (self.bytecode.len() + self.constants.len() * 8 + 128) as u32
    }

    pub fn num_globals(&self) -> u32 {
        self.globals.read().len() as u32
    }

    /// Value of the global at `slot`.
    pub fn global(&self, slot: u32) -> Option<Value> {
        self.globals.read().get(slot as usize).map(|cell| cell.get())
    }

    pub fn set_global(&self, slot: u32, value: Value) -> bool {
        match self.globals.read().get(slot as usize) {
            Some(cell) => {
                cell.set(value);
                true
            }
            None => false,
        }
    }

    /// Slot index of a named global.
    pub fn global_index(&self, name: &str) -> Option<u32> {
        self.global_names.read().get(name).copied()
    }

    /// Register a global, or overwrite it if the name exists. Returns
    /// the slot index.
    pub fn add_global(&self, name: &str, value: Value) -> u32 {
        if let Some(slot) = self.global_index(name) {
            self.globals.read()[slot as usize].set(value);
            return slot;
        }
        let mut globals = self.globals.write();
        let slot = globals.len() as u32;
        globals.push(ValueCell::new(value));
        self.global_names.write().insert(name.into(), slot);
        slot
    }

    pub fn set_private_state<T: std::any::Any + Send>(
        &self,
        value: T,
        finalizer: Option<PrivFinalizer>,
    ) {
        *self.private.lock() = Some(PrivateSlot::new(value, finalizer));
    }

    pub fn has_finalizer(&self) -> bool {
        self.private.lock().as_ref().is_some_and(|s| s.has_finalizer())
    }

    pub fn run_finalizer(&self) -> bool {
        let slot = self.private.lock().take();
        match slot {
            Some(slot) => slot.run(),
            None => false,
        }
    }

    /// Source line for a bytecode offset, from the last table entry at
    /// or before the offset.
    pub fn addr_to_line(&self, offset: u32) -> u32 {
        match self.line_table.binary_search_by_key(&offset, |&(o, _)| o) {
            Ok(i) => self.line_table[i].1,
            Err(0) => 0,
            Err(i) => self.line_table[i - 1].1,
        }
    }

    pub fn trace(&self, visit: &mut dyn FnMut(Value)) {
        visit(self.main_fn.get());
        for cell in self.constants.iter() {
            visit(cell.get());
        }
        for cell in self.globals.read().iter() {
            visit(cell.get());
        }
    }

    pub fn update_refs(&self, remap: &dyn Fn(Value) -> Value) {
        self.main_fn.set(remap(self.main_fn.get()));
        for cell in self.constants.iter() {
            cell.set(remap(cell.get()));
        }
        for cell in self.globals.read().iter() {
            cell.set(remap(cell.get()));
        }
    }
}

/// Lookup used by the property layer: module globals read as
/// properties.
pub fn global_by_name(module: &ModuleObj, name: &str) -> Option<Value> {
    let slot = module.global_index(name)?;
    module.global(slot)
}

/// Write used by the property layer: assigning a module property
/// registers or updates the global.
pub fn set_global_by_name(
    _ctx: &Context,
    module: &ModuleObj,
    name: &str,
    value: Value,
) -> Result<(), Raised> {
    module.add_global(name, value);
    Ok(())
}

pub fn global_names(module: &ModuleObj) -> Vec<Box<str>> {
    let names = module.global_names.read();
    let mut out: Vec<(u32, Box<str>)> =
        names.iter().map(|(k, &v)| (v, k.clone())).collect();
    out.sort_by_key(|&(slot, _)| slot);
    out.into_iter().map(|(_, k)| k).collect()
}

// === Context-level operations ===

fn with_module<T>(
    ctx: &Context,
    module: Value,
    f: impl FnOnce(&ModuleObj) -> T,
) -> Result<T, Raised> {
    let obj = ctx.obj(module)?;
    match &obj.body {
        ObjBody::Module(m) => Ok(f(m)),
        _ => Err(ctx.raise_kind(ExcKind::TypeError, "value is not a module")),
    }
}

/// Register a global on a module; returns its slot index.
pub fn add_global(ctx: &Context, module: Value, name: &str, value: Value) -> Result<u32, Raised> {
    with_module(ctx, module, |m| m.add_global(name, value))
}

/// Read a named global; raises `NotFound` for unknown names.
pub fn get_global(ctx: &Context, module: Value, name: &str) -> Result<(Value, u32), Raised> {
    with_module(ctx, module, |m| {
        m.global_index(name).and_then(|slot| m.global(slot).map(|v| (v, slot)))
    })?
    .ok_or_else(|| ctx.raise_kind(ExcKind::NotFound, "global not found"))
}

/// Read a global by slot; raises `OutOfRange` for bad slots.
pub fn get_global_by_index(ctx: &Context, module: Value, slot: u32) -> Result<Value, Raised> {
    with_module(ctx, module, |m| m.global(slot))?
        .ok_or_else(|| ctx.raise_kind(ExcKind::OutOfRange, "global index out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_module() -> ModuleObj {
        ModuleObj::new("m", "m.vela", 0, Box::new([]), Vec::new(), vec![(0, 1), (10, 2), (20, 5)])
    }

    #[test]
    fn test_globals_register_and_read() {
        let m = test_module();
        let a = m.add_global("a", Value::from_small_int(1));
        let b = m.add_global("b", Value::from_small_int(2));
        assert_ne!(a, b);
        assert_eq!(m.global(a), Some(Value::from_small_int(1)));
        assert_eq!(m.global_index("b"), Some(b));
        assert_eq!(m.global(99), None);

        // Re-registering overwrites in place.
        let a2 = m.add_global("a", Value::from_small_int(10));
        assert_eq!(a2, a);
        assert_eq!(m.global(a), Some(Value::from_small_int(10)));
    }

    #[test]
    fn test_addr_to_line() {
        let m = test_module();
        assert_eq!(m.addr_to_line(0), 1);
        assert_eq!(m.addr_to_line(9), 1);
        assert_eq!(m.addr_to_line(10), 2);
        assert_eq!(m.addr_to_line(19), 2);
        assert_eq!(m.addr_to_line(100), 5);
    }

    #[test]
    fn test_global_names_in_slot_order() {
        let m = test_module();
        m.add_global("z", Value::from_small_int(1));
        m.add_global("a", Value::from_small_int(2));
        assert_eq!(global_names(&m), vec!["z".into(), "a".into()]);
    }
}
