//! Builtin Registration
//!
//! Attaches native handlers to modules and prototypes: plain
//! functions, constructors (which hand back the prototype of the
//! objects they build), generators, member functions and dynamic
//! properties. Every registration carries an argument descriptor
//! slice; binding fills defaults and rejects missing mandatory
//! arguments before the handler runs.

use crate::error::{ExcKind, Raised};
use crate::object::function::{ArgDesc, FuncKind, FunctionObj, NativeHandler};
use crate::object::props::DynPropObj;
use crate::object::{ObjBody, TypeTag};
use crate::runtime::Context;
use crate::value::Value;

/// Register a native function as a module global.
pub fn add_function(
    ctx: &Context,
    module: Value,
    name: &str,
    handler: NativeHandler,
    args: Vec<ArgDesc>,
) -> Result<Value, Raised> {
    let fun = FunctionObj::native(name, module, handler, args, FuncKind::Plain);
    let value = crate::object::function::new_function(ctx, fun)?;
    super::add_global(ctx, module, name, value)?;
    Ok(value)
}

/// Register a native generator as a module global. The handler is
/// invoked once per resumption; it signals exhaustion by raising the
/// generator-end exception.
pub fn add_generator(
    ctx: &Context,
    module: Value,
    name: &str,
    handler: NativeHandler,
    args: Vec<ArgDesc>,
) -> Result<Value, Raised> {
    let fun = FunctionObj::native(name, module, handler, args, FuncKind::GenInit);
    let value = crate::object::function::new_function(ctx, fun)?;
    super::add_global(ctx, module, name, value)?;
    Ok(value)
}

/// Register a native constructor as a module global. Returns the
/// prototype that constructed objects will carry.
pub fn add_constructor(
    ctx: &Context,
    module: Value,
    name: &str,
    handler: NativeHandler,
    args: Vec<ArgDesc>,
) -> Result<(Value, Value), Raised> {
    let fun = FunctionObj::native(name, module, handler, args, FuncKind::Ctor);
    let class = crate::object::function::new_class(ctx, fun)?;
    let class_root = ctx.init_local_with(class);
    super::add_global(ctx, module, name, class_root.get())?;

    let class = class_root.take();
    let proto = match &ctx.obj(class)?.body {
        ObjBody::Class(c) => c.fun.proto.get(),
        _ => return Err(ctx.raise_kind(ExcKind::TypeError, "constructor registration failed")),
    };
    Ok((class, proto))
}

/// Install a native member function on a prototype object.
pub fn add_member_function(
    ctx: &Context,
    module: Value,
    proto: Value,
    name: &str,
    handler: NativeHandler,
    args: Vec<ArgDesc>,
) -> Result<Value, Raised> {
    let fun = FunctionObj::native(name, module, handler, args, FuncKind::Plain);
    let value = crate::object::function::new_function(ctx, fun)?;
    let root = ctx.init_local_with(value);
    crate::object::props::set_prop(ctx, proto, name, root.get())?;
    Ok(root.take())
}

/// Install a native generator member on a prototype object.
pub fn add_member_generator(
    ctx: &Context,
    module: Value,
    proto: Value,
    name: &str,
    handler: NativeHandler,
    args: Vec<ArgDesc>,
) -> Result<Value, Raised> {
    let fun = FunctionObj::native(name, module, handler, args, FuncKind::GenInit);
    let value = crate::object::function::new_function(ctx, fun)?;
    let root = ctx.init_local_with(value);
    crate::object::props::set_prop(ctx, proto, name, root.get())?;
    Ok(root.take())
}

/// Install a dynamic property (getter plus optional setter) on a
/// prototype. Reads through the property call the getter with the
/// receiver as `this`; writes call the setter or raise `ReadOnly`.
pub fn add_dynamic_property(
    ctx: &Context,
    module: Value,
    proto: Value,
    name: &str,
    getter: NativeHandler,
    setter: Option<NativeHandler>,
) -> Result<(), Raised> {
    let getter_fun =
        FunctionObj::native(&format!("get {}", name), module, getter, Vec::new(), FuncKind::Plain);
    let getter_value = crate::object::function::new_function(ctx, getter_fun)?;
    let getter_root = ctx.init_local_with(getter_value);

    let setter_value = match setter {
        Some(handler) => {
            let setter_fun = FunctionObj::native(
                &format!("set {}", name),
                module,
                handler,
                vec![ArgDesc::mandatory("value")],
                FuncKind::Plain,
            );
            crate::object::function::new_function(ctx, setter_fun)?
        }
        None => Value::BAD,
    };
    let setter_root = ctx.init_local_with(setter_value);

    let pair = ctx.alloc(ObjBody::DynamicProp(DynPropObj::new(
        getter_root.get(),
        setter_root.get(),
    )))?;
    drop(setter_root);
    drop(getter_root);

    // The pair is stored raw; the property layer intercepts it.
    let obj = ctx.obj(proto)?;
    match &obj.body {
        ObjBody::Object(o) => {
            o.set_own(name, pair);
            Ok(())
        }
        _ => Err(ctx.raise_kind(ExcKind::TypeError, "dynamic properties need an object prototype")),
    }
}

// === Argument extraction helpers (native-ABI hints) ===

/// Extract an `i64` from an argument value.
pub fn to_i64(ctx: &Context, value: Value) -> Result<i64, Raised> {
    match crate::interp::ops::to_numeric(ctx, value)? {
        crate::value::Numeric::Integer(i) => Ok(i),
        crate::value::Numeric::Float(f) => Ok(f as i64),
    }
}

/// Extract an `f64` from an argument value.
pub fn to_f64(ctx: &Context, value: Value) -> Result<f64, Raised> {
    Ok(crate::interp::ops::to_numeric(ctx, value)?.as_f64())
}

/// Extract string content from an argument value.
pub fn to_string(ctx: &Context, value: Value) -> Result<String, Raised> {
    if ctx.type_of(value) != TypeTag::String {
        return Err(ctx.raise_kind(ExcKind::TypeError, "argument is not a string"));
    }
    crate::object::string::rust_string(ctx, value)
}

/// Extract a boolean by truthiness.
pub fn to_bool(ctx: &Context, value: Value) -> bool {
    crate::interp::ops::is_truthy(ctx, value)
}
