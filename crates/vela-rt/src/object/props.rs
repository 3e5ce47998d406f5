//! Objects and Property Maps
//!
//! A property map keys string names to values. Lookups on existing
//! slots go through the element cell; inserting, deleting and rehashing
//! take the per-object lock. Objects carry an optional prototype and
//! optional type-keyed private native state released by a finalizer
//! when the object is collected.
//!
//! Dynamic properties are getter/setter pairs stored in prototype maps
//! under an internal object type; the property API routes reads and
//! writes through them transparently.

use std::any::{Any, TypeId};
use std::fmt;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use crate::error::{ExcKind, Raised};
use crate::object::{ObjBody, TypeTag};
use crate::runtime::Context;
use crate::value::{Value, ValueCell};

/// Longest prototype chain the runtime will walk.
const MAX_PROTO_DEPTH: usize = 1000;

pub type PrivFinalizer = fn(Box<dyn Any + Send>);

/// Type-keyed private native state attached to an object.
pub struct PrivateSlot {
    key: TypeId,
    data: Box<dyn Any + Send>,
    finalizer: Option<PrivFinalizer>,
}

impl fmt::Debug for PrivateSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateSlot")
            .field("key", &self.key)
            .field("finalizer", &self.finalizer.is_some())
            .finish()
    }
}

impl PrivateSlot {
    pub fn new<T: Any + Send>(value: T, finalizer: Option<PrivFinalizer>) -> PrivateSlot {
        PrivateSlot {
            key: TypeId::of::<T>(),
            data: Box::new(value),
            finalizer,
        }
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizer.is_some()
    }

    /// Consume the slot, running the finalizer if one is attached.
    pub fn run(self) -> bool {
        match self.finalizer {
            Some(fin) => {
                fin(self.data);
                true
            }
            None => false,
        }
    }
}

/// Property-map object body.
#[derive(Debug)]
pub struct PropsObj {
    map: RwLock<IndexMap<Box<str>, ValueCell>>,
    prototype: ValueCell,
    private: Mutex<Option<PrivateSlot>>,
}

impl PropsObj {
    pub fn new(prototype: Value) -> PropsObj {
        PropsObj {
            map: RwLock::new(IndexMap::new()),
            prototype: ValueCell::new(prototype),
            private: Mutex::new(None),
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Shallow lookup.
    pub fn get_own(&self, key: &str) -> Option<Value> {
        self.map.read().get(key).map(|cell| cell.get())
    }

    pub fn has_own(&self, key: &str) -> bool {
        self.map.read().contains_key(key)
    }

    /// Insert or overwrite. Existing slots are updated through the
    /// cell without rehashing.
    pub fn set_own(&self, key: &str, value: Value) {
        {
            let guard = self.map.read();
            if let Some(cell) = guard.get(key) {
                cell.set(value);
                return;
            }
        }
        self.map.write().insert(key.into(), ValueCell::new(value));
    }

    /// Remove a key; missing keys are a no-op.
    pub fn delete_own(&self, key: &str) {
        self.map.write().shift_remove(key);
    }

    pub fn own_keys(&self) -> Vec<Box<str>> {
        self.map.read().keys().cloned().collect()
    }

    pub fn prototype(&self) -> Value {
        self.prototype.get()
    }

    pub fn set_prototype(&self, proto: Value) {
        self.prototype.set(proto);
    }

    // === Private native state ===

    pub fn set_private<T: Any + Send>(&self, value: T, finalizer: Option<PrivFinalizer>) {
        let slot = PrivateSlot {
            key: TypeId::of::<T>(),
            data: Box::new(value),
            finalizer,
        };
        *self.private.lock() = Some(slot);
    }

    /// Access the private state if it was stored under the same type
    /// key.
    pub fn with_private<T: Any + Send, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.private.lock();
        let slot = guard.as_mut()?;
        if slot.key != TypeId::of::<T>() {
            return None;
        }
        slot.data.downcast_mut::<T>().map(f)
    }

    pub fn has_finalizer(&self) -> bool {
        self.private.lock().as_ref().is_some_and(|s| s.finalizer.is_some())
    }

    /// Run and consume the finalizer. Exactly-once: the slot is taken.
    pub fn run_finalizer(&self) -> bool {
        let slot = self.private.lock().take();
        match slot {
            Some(PrivateSlot { data, finalizer: Some(fin), .. }) => {
                fin(data);
                true
            }
            _ => false,
        }
    }

    pub fn trace(&self, visit: &mut dyn FnMut(Value)) {
        visit(self.prototype.get());
        for cell in self.map.read().values() {
            visit(cell.get());
        }
    }

    pub fn update_refs(&self, remap: &dyn Fn(Value) -> Value) {
        self.prototype.set(remap(self.prototype.get()));
        for cell in self.map.read().values() {
            cell.set(remap(cell.get()));
        }
    }
}

/// Getter/setter pair installed on a prototype.
#[derive(Debug)]
pub struct DynPropObj {
    pub getter: ValueCell,
    /// `BAD` when the property is read-only.
    pub setter: ValueCell,
}

impl DynPropObj {
    pub fn new(getter: Value, setter: Value) -> DynPropObj {
        DynPropObj {
            getter: ValueCell::new(getter),
            setter: ValueCell::new(setter),
        }
    }

    pub fn trace(&self, visit: &mut dyn FnMut(Value)) {
        visit(self.getter.get());
        visit(self.setter.get());
    }

    pub fn update_refs(&self, remap: &dyn Fn(Value) -> Value) {
        self.getter.set(remap(self.getter.get()));
        self.setter.set(remap(self.setter.get()));
    }
}

/// Private native state without a property map.
pub struct OpaqueObj {
    private: Mutex<Option<PrivateSlot>>,
}

impl fmt::Debug for OpaqueObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpaqueObj").finish()
    }
}

impl OpaqueObj {
    pub fn new<T: Any + Send>(value: T, finalizer: Option<PrivFinalizer>) -> OpaqueObj {
        let obj = OpaqueObj { private: Mutex::new(None) };
        obj.private.lock().replace(PrivateSlot {
            key: TypeId::of::<T>(),
            data: Box::new(value),
            finalizer,
        });
        obj
    }

    pub fn with_private<T: Any + Send, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.private.lock();
        let slot = guard.as_mut()?;
        if slot.key != TypeId::of::<T>() {
            return None;
        }
        slot.data.downcast_mut::<T>().map(f)
    }

    pub fn has_finalizer(&self) -> bool {
        self.private.lock().as_ref().is_some_and(|s| s.finalizer.is_some())
    }

    pub fn run_finalizer(&self) -> bool {
        let slot = self.private.lock().take();
        match slot {
            Some(PrivateSlot { data, finalizer: Some(fin), .. }) => {
                fin(data);
                true
            }
            _ => false,
        }
    }
}

// === Context-level operations ===

/// Allocate a plain object. `proto` of `BAD` selects the default
/// object prototype.
pub fn new_object(ctx: &Context, proto: Value) -> Result<Value, Raised> {
    let proto = if proto.is_bad() { ctx.instance().prototypes.object.get() } else { proto };
    ctx.alloc(ObjBody::Object(PropsObj::new(proto)))
}

enum PropHit {
    Value(Value),
    Dynamic(Value),
    Missing,
}

/// Walk the receiver and its prototype chain for `key`.
fn lookup(ctx: &Context, receiver: Value, key: &str) -> Result<PropHit, Raised> {
    let mut current = start_of_chain(ctx, receiver)?;
    for _ in 0..MAX_PROTO_DEPTH {
        if current.is_bad() || current == ctx.void_val() {
            return Ok(PropHit::Missing);
        }
        let obj = ctx.obj(current)?;
        let (own, proto) = match &obj.body {
            ObjBody::Object(o) => (o.get_own(key), o.prototype()),
            ObjBody::Class(c) => (c.props.get_own(key), c.props.prototype()),
            ObjBody::Module(m) => (super::module::global_by_name(m, key), Value::BAD),
            _ => (None, Value::BAD),
        };
        if let Some(found) = own {
            if ctx.type_of(found) == TypeTag::DynamicProp {
                return Ok(PropHit::Dynamic(found));
            }
            return Ok(PropHit::Value(found));
        }
        current = proto;
    }
    Err(ctx.raise_kind(ExcKind::TypeError, "prototype chain too deep"))
}

/// Map a receiver to the first object consulted for property lookup.
///
/// Only the object family carries properties: plain objects and
/// classes have their own maps, modules expose their globals, and
/// functions and iterators resolve through the builtin prototypes.
/// Everything else has no property surface.
fn start_of_chain(ctx: &Context, receiver: Value) -> Result<Value, Raised> {
    let protos = &ctx.instance().prototypes;
    let start = match ctx.type_of(receiver) {
        TypeTag::Object | TypeTag::Class | TypeTag::Module => receiver,
        TypeTag::Function => protos.function.get(),
        TypeTag::Iterator => protos.generator.get(),
        _ => Value::BAD,
    };
    Ok(start)
}

fn is_object_family(ctx: &Context, receiver: Value) -> bool {
    matches!(
        ctx.type_of(receiver),
        TypeTag::Object | TypeTag::Class | TypeTag::Module | TypeTag::Function | TypeTag::Iterator
    )
}

/// `get(key)`: prototype-walking property read. Missing keys raise
/// `NotFound`; receivers without properties raise `TypeError`.
pub fn get_prop(ctx: &Context, receiver: Value, key: &str) -> Result<Value, Raised> {
    if !is_object_family(ctx, receiver) {
        return Err(ctx.raise_kind(ExcKind::TypeError, "value has no properties"));
    }
    match lookup(ctx, receiver, key)? {
        PropHit::Value(v) => Ok(v),
        PropHit::Dynamic(dyn_prop) => call_getter(ctx, dyn_prop, receiver),
        PropHit::Missing => Err(ctx.raise_kind(ExcKind::NotFound, "property not found")),
    }
}

/// `get_opt(key)`: total variant; yields `void` for missing keys and
/// for receivers without properties.
pub fn get_prop_opt(ctx: &Context, receiver: Value, key: &str) -> Result<Value, Raised> {
    if !is_object_family(ctx, receiver) {
        return Ok(ctx.void_val());
    }
    match lookup(ctx, receiver, key)? {
        PropHit::Value(v) => Ok(v),
        PropHit::Dynamic(dyn_prop) => call_getter(ctx, dyn_prop, receiver),
        PropHit::Missing => Ok(ctx.void_val()),
    }
}

fn call_getter(ctx: &Context, dyn_prop: Value, this: Value) -> Result<Value, Raised> {
    let obj = ctx.obj(dyn_prop)?;
    let getter = match &obj.body {
        ObjBody::DynamicProp(d) => d.getter.get(),
        _ => return Err(ctx.raise_kind(ExcKind::TypeError, "corrupt dynamic property")),
    };
    let empty = ctx.instance().consts.empty_array.get();
    crate::interp::call_function(ctx, getter, this, empty)
}

/// `set(key, value)`: writes the receiver's own map, or routes through
/// a dynamic property's setter found on the chain.
pub fn set_prop(ctx: &Context, receiver: Value, key: &str, value: Value) -> Result<(), Raised> {
    match ctx.type_of(receiver) {
        TypeTag::Object | TypeTag::Class => {}
        TypeTag::Module => {
            let obj = ctx.obj(receiver)?;
            if let ObjBody::Module(m) = &obj.body {
                super::module::set_global_by_name(ctx, m, key, value)?;
            }
            return Ok(());
        }
        _ => return Err(ctx.raise_kind(ExcKind::TypeError, "value has no properties")),
    }

    if let PropHit::Dynamic(dyn_prop) = lookup(ctx, receiver, key)? {
        let obj = ctx.obj(dyn_prop)?;
        let setter = match &obj.body {
            ObjBody::DynamicProp(d) => d.setter.get(),
            _ => Value::BAD,
        };
        if setter.is_bad() {
            return Err(ctx.raise_kind(ExcKind::ReadOnly, "property has no setter"));
        }
        // Root across the argument-array allocation.
        let setter_root = ctx.init_local_with(setter);
        let recv_root = ctx.init_local_with(receiver);
        let args = super::array::new_array_from(ctx, &[value])?;
        let result = crate::interp::call_function(ctx, setter_root.get(), recv_root.get(), args);
        drop(recv_root);
        drop(setter_root);
        result?;
        return Ok(());
    }

    let obj = ctx.obj(receiver)?;
    if obj.header.is_read_only() {
        return Err(ctx.raise_kind(ExcKind::ReadOnly, "object is read-only"));
    }
    match &obj.body {
        ObjBody::Object(o) => o.set_own(key, value),
        ObjBody::Class(c) => c.props.set_own(key, value),
        _ => unreachable!("filtered above"),
    }
    Ok(())
}

/// `delete(key)`: removes an own key; missing keys are a no-op; frozen
/// receivers raise `ReadOnly`. Receivers outside the object family are
/// a no-op.
pub fn delete_prop(ctx: &Context, receiver: Value, key: &str) -> Result<(), Raised> {
    let obj = match ctx.type_of(receiver) {
        TypeTag::Object | TypeTag::Class => ctx.obj(receiver)?,
        _ => return Ok(()),
    };
    if obj.header.is_read_only() {
        return Err(ctx.raise_kind(ExcKind::ReadOnly, "object is read-only"));
    }
    match &obj.body {
        ObjBody::Object(o) => o.delete_own(key),
        ObjBody::Class(c) => c.props.delete_own(key),
        _ => {}
    }
    Ok(())
}

/// Shallow `has`.
pub fn has_shallow(ctx: &Context, receiver: Value, key: &str) -> Result<bool, Raised> {
    if !is_object_family(ctx, receiver) {
        return Ok(false);
    }
    let obj = ctx.obj(receiver)?;
    Ok(match &obj.body {
        ObjBody::Object(o) => o.has_own(key),
        ObjBody::Class(c) => c.props.has_own(key),
        ObjBody::Module(m) => super::module::global_by_name(m, key).is_some(),
        _ => false,
    })
}

/// Prototype-walking `has`.
pub fn has_deep(ctx: &Context, receiver: Value, key: &str) -> Result<bool, Raised> {
    if !is_object_family(ctx, receiver) {
        return Ok(false);
    }
    Ok(!matches!(lookup(ctx, receiver, key)?, PropHit::Missing))
}

pub fn get_prototype(ctx: &Context, receiver: Value) -> Result<Value, Raised> {
    let protos = &ctx.instance().prototypes;
    let proto = match ctx.type_of(receiver) {
        TypeTag::Object => {
            let obj = ctx.obj(receiver)?;
            match &obj.body {
                ObjBody::Object(o) => o.prototype(),
                _ => unreachable!(),
            }
        }
        TypeTag::Class => {
            let obj = ctx.obj(receiver)?;
            match &obj.body {
                ObjBody::Class(c) => c.props.prototype(),
                _ => unreachable!(),
            }
        }
        TypeTag::Integer | TypeTag::Float => protos.number.get(),
        TypeTag::String => protos.string.get(),
        TypeTag::Boolean => protos.boolean.get(),
        TypeTag::Array => protos.array.get(),
        TypeTag::Buffer => protos.buffer.get(),
        TypeTag::Function => protos.function.get(),
        TypeTag::Iterator => protos.generator.get(),
        _ => ctx.void_val(),
    };
    Ok(if proto.is_bad() { ctx.void_val() } else { proto })
}

/// Replace an object's prototype. `void` clears it.
pub fn set_prototype(ctx: &Context, receiver: Value, proto: Value) -> Result<(), Raised> {
    let obj = ctx.obj(receiver)?;
    if obj.header.is_read_only() {
        return Err(ctx.raise_kind(ExcKind::ReadOnly, "object is read-only"));
    }
    match &obj.body {
        ObjBody::Object(o) => {
            o.set_prototype(proto);
            Ok(())
        }
        ObjBody::Class(c) => {
            c.props.set_prototype(proto);
            Ok(())
        }
        _ => Err(ctx.raise_kind(ExcKind::TypeError, "value has no prototype slot")),
    }
}

/// Own keys, or with `deep` the union along the prototype chain
/// (outermost first, duplicates removed).
pub fn walk_keys(ctx: &Context, receiver: Value, deep: bool) -> Result<Vec<Box<str>>, Raised> {
    let mut keys: Vec<Box<str>> = Vec::new();
    let mut current = start_of_chain(ctx, receiver)?;
    for _ in 0..MAX_PROTO_DEPTH {
        if current.is_bad() || current == ctx.void_val() {
            return Ok(keys);
        }
        let obj = ctx.obj(current)?;
        let (own, proto) = match &obj.body {
            ObjBody::Object(o) => (o.own_keys(), o.prototype()),
            ObjBody::Class(c) => (c.props.own_keys(), c.props.prototype()),
            ObjBody::Module(m) => (super::module::global_names(m), Value::BAD),
            _ => (Vec::new(), Value::BAD),
        };
        for key in own {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        if !deep {
            return Ok(keys);
        }
        current = proto;
    }
    Err(ctx.raise_kind(ExcKind::TypeError, "prototype chain too deep"))
}
