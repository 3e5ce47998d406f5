//! Module manager integration: loading through the compiler seam,
//! search paths, import cycles, globals, builtin registration and
//! dynamic properties.

mod common;

use common::{as_int, instance};
use vela_bytecode::NO_REG;
use vela_rt::error::Raised;
use vela_rt::module::{self, builtin, CompiledUnit, ConstSpec, ModuleCompiler};
use vela_rt::object::function::ArgDesc;
use vela_rt::object::{array, props, string, TypeTag};
use vela_rt::{call_function, Context, ExcKind, Value};

/// Test compiler: ignores the source and emits `return 7`.
struct SevenCompiler;

impl ModuleCompiler for SevenCompiler {
    fn compile(&self, _name: &str, _source: &[u8]) -> Result<CompiledUnit, String> {
        let mut asm = vela_bytecode::Assembler::new();
        asm.load_int8(0, 7);
        asm.ret(0);
        Ok(CompiledUnit {
            bytecode: asm.finish().expect("assembly"),
            constants: vec![],
            line_table: vec![(0, 1)],
            main_entry: 0,
            main_num_regs: 1,
        })
    }
}

/// Test compiler that rejects everything.
struct FailingCompiler;

impl ModuleCompiler for FailingCompiler {
    fn compile(&self, _name: &str, _source: &[u8]) -> Result<CompiledUnit, String> {
        Err("syntax error at line 1".into())
    }
}

#[test]
fn test_load_from_memory_and_run() {
    let (inst, ctx) = instance();
    inst.set_compiler(Box::new(SevenCompiler));

    let module = module::load_from_memory(&ctx, "seven", b"whatever").unwrap();
    assert_eq!(ctx.type_of(module), TypeTag::Module);

    let result = module::run_module(&ctx, module).unwrap();
    assert_eq!(as_int(result), 7);

    // Loading the same name again returns the existing module.
    let again = module::load_from_memory(&ctx, "seven", b"other").unwrap();
    assert_eq!(again, module);
}

#[test]
fn test_load_without_compiler_fails() {
    let (_inst, ctx) = instance();
    assert!(module::load_from_memory(&ctx, "m", b"src").is_err());
    assert_eq!(ctx.exception_kind(), Some(ExcKind::ModuleInitFailed));
    ctx.clear_exception();
}

#[test]
fn test_compile_error_reported() {
    let (inst, ctx) = instance();
    inst.set_compiler(Box::new(FailingCompiler));
    assert!(module::load_from_memory(&ctx, "bad", b"src").is_err());
    assert_eq!(ctx.exception_kind(), Some(ExcKind::ModuleInitFailed));
    ctx.clear_exception();
}

#[test]
fn test_load_from_path_with_search_paths() {
    let (inst, ctx) = instance();
    inst.set_compiler(Box::new(SevenCompiler));

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("disk.vela"), b"source text").unwrap();

    // Without the search path the bare name cannot resolve.
    assert!(module::load_from_path(&ctx, "disk").is_err());
    assert_eq!(ctx.exception_kind(), Some(ExcKind::ModuleNotFound));
    ctx.clear_exception();

    module::add_search_path(&ctx, dir.path());
    let module = module::load_from_path(&ctx, "disk").unwrap();
    assert_eq!(ctx.type_of(module), TypeTag::Module);
    assert_eq!(as_int(module::run_module(&ctx, module).unwrap()), 7);
}

#[test]
fn test_missing_file_reports_not_found() {
    let (inst, ctx) = instance();
    inst.set_compiler(Box::new(SevenCompiler));

    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.vela");
    assert!(module::load_from_path(&ctx, missing.to_str().unwrap()).is_err());
    assert_eq!(ctx.exception_kind(), Some(ExcKind::ModuleNotFound));
    ctx.clear_exception();
}

// === Import cycles ===

fn init_cycle_a(ctx: &Context, _module: Value) -> Result<(), Raised> {
    module::load_from_memory(ctx, "cycle_b", b"").map(|_| ())
}

fn init_cycle_b(ctx: &Context, _module: Value) -> Result<(), Raised> {
    module::load_from_memory(ctx, "cycle_a", b"").map(|_| ())
}

#[test]
fn test_import_cycle_detected() {
    let (inst, ctx) = instance();
    inst.set_compiler(Box::new(SevenCompiler));

    module::register_builtin(&ctx, "cycle_a", init_cycle_a);
    module::register_builtin(&ctx, "cycle_b", init_cycle_b);

    assert!(module::load_from_memory(&ctx, "cycle_a", b"").is_err());
    assert_eq!(ctx.exception_kind(), Some(ExcKind::ImportCycle));
    ctx.clear_exception();
}

// === Globals ===

#[test]
fn test_module_globals_register_and_read() {
    let (_inst, ctx) = instance();

    let module = common::load_program(&ctx, 1, |asm| {
        asm.load_void(0);
        asm.ret(0);
        vec![]
    })
    .unwrap();

    let slot = module::add_global(&ctx, module, "answer", Value::from_small_int(42)).unwrap();
    let (value, found_slot) = module::get_global(&ctx, module, "answer").unwrap();
    assert_eq!(as_int(value), 42);
    assert_eq!(found_slot, slot);
    assert_eq!(as_int(module::get_global_by_index(&ctx, module, slot).unwrap()), 42);

    assert!(module::get_global(&ctx, module, "missing").is_err());
    assert_eq!(ctx.exception_kind(), Some(ExcKind::NotFound));
    ctx.clear_exception();

    // Globals read through the property surface as well.
    assert_eq!(as_int(props::get_prop(&ctx, module, "answer").unwrap()), 42);
}

#[test]
fn test_cross_module_global_access_from_bytecode() {
    let (_inst, ctx) = instance();

    // Module A exports x = 31.
    let module_a = common::load_program(&ctx, 1, |asm| {
        asm.load_void(0);
        asm.ret(0);
        vec![]
    })
    .unwrap();
    module::add_global(&ctx, module_a, "x", Value::from_small_int(31)).unwrap();
    let a_index = match &ctx.obj(module_a).unwrap().body {
        vela_rt::object::ObjBody::Module(m) => m.index,
        _ => unreachable!(),
    };

    // Module B reads it by name and by slot.
    let result = common::run_program(&ctx, 4, |asm| {
        asm.load_const(0, 0);
        asm.get_mod_global(1, a_index, 0);
        asm.get_mod_elem(2, a_index, 0);
        asm.add(3, 1, 2);
        asm.ret(3);
        vec![ConstSpec::String("x".into())]
    })
    .unwrap();
    assert_eq!(as_int(result), 62);
}

#[test]
fn test_get_mod_global_opt_tolerates_misses() {
    let (_inst, ctx) = instance();
    let result = common::run_program(&ctx, 4, |asm| {
        asm.load_const(0, 0);
        asm.get_mod_global_opt(1, 9999, 0);
        asm.ret(1);
        vec![ConstSpec::String("nope".into())]
    })
    .unwrap();
    assert_eq!(result, ctx.void_val());
}

#[test]
fn test_get_global_reads_own_module() {
    let (_inst, ctx) = instance();

    // The module's top level registers nothing; the global is added
    // natively, then a function reads it with GET.GLOBAL.
    let module = common::load_program(&ctx, 4, |asm| {
        asm.load_const(0, 0);
        asm.ret(0);

        let reader = asm.here() as u32;
        asm.get_global(0, 0);
        asm.ret(0);

        vec![ConstSpec::Function {
            name: "reader".into(),
            entry: reader,
            num_regs: 1,
            args_reg: 0,
            this_reg: NO_REG,
            params: vec![],
            kind: vela_rt::object::function::FuncKind::Plain,
        }]
    })
    .unwrap();

    module::add_global(&ctx, module, "g", Value::from_small_int(5)).unwrap();
    let reader = module::run_module(&ctx, module).unwrap();
    let empty = array::new_array(&ctx, 0).unwrap();
    let result = call_function(&ctx, reader, ctx.void_val(), empty).unwrap();
    assert_eq!(as_int(result), 5);
}

// === Builtin registration ===

fn native_double(ctx: &Context, _this: Value, args: Value) -> Result<Value, Raised> {
    let n = builtin::to_i64(ctx, array::read(ctx, args, 0)?)?;
    Ok(Value::from_small_int(n * 2))
}

fn native_counter_get(ctx: &Context, this: Value, _args: Value) -> Result<Value, Raised> {
    props::get_prop(ctx, this, "count")
}

fn native_counter_bump(ctx: &Context, this: Value, _args: Value) -> Result<Value, Raised> {
    let n = match props::get_prop_opt(ctx, this, "count")? {
        v if v.is_small_int() => v.as_small_int(),
        _ => 0,
    };
    props::set_prop(ctx, this, "count", Value::from_small_int(n + 1))?;
    Ok(ctx.void_val())
}

fn native_counter_ctor(ctx: &Context, this: Value, _args: Value) -> Result<Value, Raised> {
    props::set_prop(ctx, this, "count", Value::from_small_int(0))?;
    Ok(ctx.void_val())
}

#[test]
fn test_native_function_with_defaults() {
    let (_inst, ctx) = instance();
    let module = common::load_program(&ctx, 1, |asm| {
        asm.load_void(0);
        asm.ret(0);
        vec![]
    })
    .unwrap();

    let f = builtin::add_function(
        &ctx,
        module,
        "double",
        native_double,
        vec![ArgDesc::optional("n", Value::from_small_int(21))],
    )
    .unwrap();

    // Explicit argument.
    let args = array::new_array_from(&ctx, &[Value::from_small_int(5)]).unwrap();
    assert_eq!(as_int(call_function(&ctx, f, ctx.void_val(), args).unwrap()), 10);

    // Default fills in.
    let empty = array::new_array(&ctx, 0).unwrap();
    assert_eq!(as_int(call_function(&ctx, f, ctx.void_val(), empty).unwrap()), 42);

    // Registered as a module global too.
    let (global, _) = module::get_global(&ctx, module, "double").unwrap();
    assert_eq!(global, f);
}

#[test]
fn test_native_constructor_and_member_functions() {
    let (_inst, ctx) = instance();
    let module = common::load_program(&ctx, 1, |asm| {
        asm.load_void(0);
        asm.ret(0);
        vec![]
    })
    .unwrap();

    let (class, proto) =
        builtin::add_constructor(&ctx, module, "Counter", native_counter_ctor, vec![]).unwrap();
    builtin::add_member_function(&ctx, module, proto, "bump", native_counter_bump, vec![]).unwrap();
    builtin::add_member_function(&ctx, module, proto, "get", native_counter_get, vec![]).unwrap();

    let empty = array::new_array(&ctx, 0).unwrap();
    let counter = call_function(&ctx, class, ctx.void_val(), empty).unwrap();
    assert_eq!(ctx.type_of(counter), TypeTag::Object);

    // Member functions resolve through the prototype chain.
    let bump = props::get_prop(&ctx, counter, "bump").unwrap();
    call_function(&ctx, bump, counter, empty).unwrap();
    call_function(&ctx, bump, counter, empty).unwrap();

    let get = props::get_prop(&ctx, counter, "get").unwrap();
    assert_eq!(as_int(call_function(&ctx, get, counter, empty).unwrap()), 2);
}

fn native_size_getter(ctx: &Context, this: Value, _args: Value) -> Result<Value, Raised> {
    props::get_prop_opt(ctx, this, "raw").and_then(|raw| {
        if raw.is_small_int() {
            Ok(Value::from_small_int(raw.as_small_int() * 10))
        } else {
            Ok(Value::from_small_int(0))
        }
    })
}

fn native_size_setter(ctx: &Context, this: Value, args: Value) -> Result<Value, Raised> {
    let v = builtin::to_i64(ctx, array::read(ctx, args, 0)?)?;
    props::set_prop(ctx, this, "raw", Value::from_small_int(v / 10))?;
    Ok(ctx.void_val())
}

#[test]
fn test_dynamic_property_getter_setter() {
    let (_inst, ctx) = instance();
    let module = common::load_program(&ctx, 1, |asm| {
        asm.load_void(0);
        asm.ret(0);
        vec![]
    })
    .unwrap();

    let proto = props::new_object(&ctx, Value::BAD).unwrap();
    builtin::add_dynamic_property(
        &ctx,
        module,
        proto,
        "size",
        native_size_getter,
        Some(native_size_setter),
    )
    .unwrap();

    let obj = props::new_object(&ctx, proto).unwrap();
    props::set_prop(&ctx, obj, "raw", Value::from_small_int(4)).unwrap();

    // Reading routes through the getter.
    assert_eq!(as_int(props::get_prop(&ctx, obj, "size").unwrap()), 40);

    // Writing routes through the setter.
    props::set_prop(&ctx, obj, "size", Value::from_small_int(90)).unwrap();
    assert_eq!(as_int(props::get_prop(&ctx, obj, "raw").unwrap()), 9);
}

#[test]
fn test_dynamic_property_without_setter_is_read_only() {
    let (_inst, ctx) = instance();
    let module = common::load_program(&ctx, 1, |asm| {
        asm.load_void(0);
        asm.ret(0);
        vec![]
    })
    .unwrap();

    let proto = props::new_object(&ctx, Value::BAD).unwrap();
    builtin::add_dynamic_property(&ctx, module, proto, "size", native_size_getter, None).unwrap();

    let obj = props::new_object(&ctx, proto).unwrap();
    assert!(props::set_prop(&ctx, obj, "size", Value::from_small_int(1)).is_err());
    assert_eq!(ctx.exception_kind(), Some(ExcKind::ReadOnly));
    ctx.clear_exception();
}

#[test]
fn test_run_function_by_name() {
    let (_inst, ctx) = instance();
    let module = common::load_program(&ctx, 1, |asm| {
        asm.load_void(0);
        asm.ret(0);
        vec![]
    })
    .unwrap();

    builtin::add_function(&ctx, module, "double", native_double, vec![ArgDesc::optional(
        "n",
        Value::from_small_int(3),
    )])
    .unwrap();

    assert_eq!(as_int(module::run_function(&ctx, module, "double", true).unwrap()), 6);
    assert_eq!(module::run_function(&ctx, module, "nothing", false).unwrap(), ctx.void_val());
    assert!(module::run_function(&ctx, module, "nothing", true).is_err());
    ctx.clear_exception();
}

#[test]
fn test_addr_to_line_mapping() {
    let (_inst, ctx) = instance();
    let module = common::load_program(&ctx, 1, |asm| {
        asm.load_void(0);
        asm.ret(0);
        vec![]
    })
    .unwrap();

    match &ctx.obj(module).unwrap().body {
        vela_rt::object::ObjBody::Module(m) => {
            assert_eq!(m.addr_to_line(0), 1);
            assert_eq!(m.addr_to_line(100), 1);
        }
        _ => unreachable!(),
    }
}

#[test]
fn test_string_module_roundtrip_through_interp() {
    let (_inst, ctx) = instance();
    // A constant string survives the pool and compares structurally.
    let result = common::run_program(&ctx, 2, |asm| {
        asm.load_const(0, 0);
        asm.ret(0);
        vec![ConstSpec::String("from the pool".into())]
    })
    .unwrap();
    assert_eq!(string::rust_string(&ctx, result).unwrap(), "from the pool");
    let other = string::new_string(&ctx, "from the pool").unwrap();
    assert!(string::eq(&ctx, result, other).unwrap());
    assert_ne!(result, other);
}
