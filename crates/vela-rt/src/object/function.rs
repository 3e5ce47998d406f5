//! Functions and Classes
//!
//! A function bundles its module reference, an entry offset into the
//! module's bytecode or a native handler, the register-file size, the
//! argument descriptors used for binding, and a kind flag (plain,
//! constructor, generator initializer). A class is a function that
//! constructs objects with a given prototype and carries its own
//! property map for statics.

use crate::error::{ExcKind, Raised};
use crate::object::{ObjBody, PropsObj};
use crate::runtime::Context;
use crate::value::{Value, ValueCell};
use vela_bytecode::NO_REG;

/// Native handler shape. Handlers may allocate, raise and
/// suspend/resume around blocking work.
pub type NativeHandler = fn(&Context, Value, Value) -> Result<Value, Raised>;

/// What invoking the function does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncKind {
    /// Ordinary call.
    Plain,
    /// Constructs a new object with the function's prototype as its
    /// prototype and `this` bound to it.
    Ctor,
    /// Returns an iterator that runs the body lazily.
    GenInit,
}

/// Native-ABI extraction hint for an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiHint {
    None,
    Int64,
    Float64,
    Str,
    Bool,
}

/// Descriptor for one declared parameter.
#[derive(Debug)]
pub struct ArgDesc {
    pub name: Box<str>,
    /// Default value; `BAD` marks a mandatory argument.
    pub default: ValueCell,
    pub hint: AbiHint,
}

impl ArgDesc {
    pub fn mandatory(name: &str) -> ArgDesc {
        ArgDesc { name: name.into(), default: ValueCell::bad(), hint: AbiHint::None }
    }

    pub fn optional(name: &str, default: Value) -> ArgDesc {
        ArgDesc { name: name.into(), default: ValueCell::new(default), hint: AbiHint::None }
    }

    pub fn with_hint(mut self, hint: AbiHint) -> ArgDesc {
        self.hint = hint;
        self
    }
}

#[derive(Debug)]
pub struct FunctionObj {
    pub name: Box<str>,
    /// Owning module object, or `BAD` for module-less natives.
    pub module: ValueCell,
    /// Bytecode entry offset; unused when `handler` is set.
    pub entry: u32,
    /// Register-file size for the frame.
    pub num_regs: u8,
    /// First register receiving bound arguments.
    pub args_reg: u8,
    /// Register receiving `this`, or NO_REG.
    pub this_reg: u8,
    pub args: Box<[ArgDesc]>,
    pub handler: Option<NativeHandler>,
    pub kind: FuncKind,
    /// Prototype handed to constructed objects (constructors only).
    pub proto: ValueCell,
}

impl FunctionObj {
    /// Bytecode-backed function.
    pub fn bytecode(
        name: &str,
        module: Value,
        entry: u32,
        num_regs: u8,
        args_reg: u8,
        this_reg: u8,
        args: Vec<ArgDesc>,
        kind: FuncKind,
    ) -> FunctionObj {
        FunctionObj {
            name: name.into(),
            module: ValueCell::new(module),
            entry,
            num_regs,
            args_reg,
            this_reg,
            args: args.into_boxed_slice(),
            handler: None,
            kind,
            proto: ValueCell::bad(),
        }
    }

    /// Native-handler function.
    pub fn native(
        name: &str,
        module: Value,
        handler: NativeHandler,
        args: Vec<ArgDesc>,
        kind: FuncKind,
    ) -> FunctionObj {
        FunctionObj {
            name: name.into(),
            module: ValueCell::new(module),
            entry: 0,
            num_regs: 0,
            args_reg: 0,
            this_reg: NO_REG,
            args: args.into_boxed_slice(),
            handler: Some(handler),
            kind,
            proto: ValueCell::bad(),
        }
    }

    pub fn is_native(&self) -> bool {
        self.handler.is_some()
    }

    pub fn trace(&self, visit: &mut dyn FnMut(Value)) {
        visit(self.module.get());
        visit(self.proto.get());
        for arg in self.args.iter() {
            visit(arg.default.get());
        }
    }

    pub fn update_refs(&self, remap: &dyn Fn(Value) -> Value) {
        self.module.set(remap(self.module.get()));
        self.proto.set(remap(self.proto.get()));
        for arg in self.args.iter() {
            arg.default.set(remap(arg.default.get()));
        }
    }
}

/// A class: constructor function plus a property map for statics.
#[derive(Debug)]
pub struct ClassObj {
    pub fun: FunctionObj,
    pub props: PropsObj,
}

// === Context-level operations ===

/// Allocate a bytecode-backed function value.
pub fn new_function(ctx: &Context, fun: FunctionObj) -> Result<Value, Raised> {
    ctx.alloc(ObjBody::Function(fun))
}

/// Allocate a class. The constructed-object prototype is created here
/// and reachable through the class.
pub fn new_class(ctx: &Context, mut fun: FunctionObj) -> Result<Value, Raised> {
    fun.kind = FuncKind::Ctor;
    // Root the fresh prototype against a collection triggered by the
    // class allocation itself.
    let proto = super::props::new_object(ctx, Value::BAD)?;
    let proto_local = ctx.init_local_with(proto);
    fun.proto.set(proto_local.get());
    let class_proto = ctx.instance().prototypes.class.get();
    let result = ctx.alloc(ObjBody::Class(ClassObj {
        fun,
        props: PropsObj::new(class_proto),
    }));
    drop(proto_local);
    result
}

/// Bind a call's argument array against the descriptors.
///
/// Returns the values to place in the argument registers: one per
/// descriptor, defaults filled in; missing mandatory arguments raise
/// `TypeError`. Surplus arguments are dropped.
pub fn bind_args(
    ctx: &Context,
    fun_value: Value,
    args_array: Value,
) -> Result<Vec<Value>, Raised> {
    let obj = ctx.obj(fun_value)?;
    let fun = match &obj.body {
        ObjBody::Function(f) => f,
        ObjBody::Class(c) => &c.fun,
        _ => return Err(ctx.raise_kind(ExcKind::TypeError, "value is not callable")),
    };

    let supplied = if args_array.is_bad() {
        Vec::new()
    } else {
        let mut v = Vec::new();
        let n = super::array::len(ctx, args_array)?;
        for i in 0..n {
            v.push(super::array::read(ctx, args_array, i as i64)?);
        }
        v
    };

    let mut bound = Vec::with_capacity(fun.args.len());
    for (i, desc) in fun.args.iter().enumerate() {
        match supplied.get(i) {
            Some(&v) => bound.push(v),
            None => {
                let default = desc.default.get();
                if default.is_bad() {
                    return Err(ctx.raise_kind(ExcKind::TypeError, "missing mandatory argument"));
                }
                bound.push(default);
            }
        }
    }
    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_desc_defaults() {
        let mandatory = ArgDesc::mandatory("path");
        assert!(mandatory.default.get().is_bad());
        assert_eq!(mandatory.hint, AbiHint::None);

        let optional = ArgDesc::optional("count", Value::from_small_int(1)).with_hint(AbiHint::Int64);
        assert_eq!(optional.default.get(), Value::from_small_int(1));
        assert_eq!(optional.hint, AbiHint::Int64);
    }

    #[test]
    fn test_function_kinds() {
        let f = FunctionObj::bytecode("f", Value::BAD, 0, 4, 0, NO_REG, vec![], FuncKind::Plain);
        assert!(!f.is_native());
        assert_eq!(f.kind, FuncKind::Plain);
    }
}
