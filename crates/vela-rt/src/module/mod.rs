//! Module Manager
//!
//! Keeps the vector of loaded modules, the name-to-index map, the
//! registered built-in module initializers and the search paths.
//! Loading resolves a path or bare name, reads the source, hands it to
//! the external compiler, installs the module object, runs the
//! built-in initializer (if any) and then the compiled top-level code.
//! Import cycles are detected through a per-load chain.

pub mod builtin;

pub use crate::object::module::{add_global, get_global, get_global_by_index};

use std::path::{Path, PathBuf};

use log::debug;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::error::{ExcKind, Raised};
use crate::object::function::{FuncKind, FunctionObj};
use crate::object::{ModuleObj, ObjBody};
use crate::runtime::Context;
use crate::value::{Value, ValueCell};
use vela_bytecode::NO_REG;

/// Source file extension for bare module names.
const MODULE_EXT: &str = "vela";

/// Built-in module initializer, run before the module's top-level
/// code.
pub type BuiltinInit = fn(&Context, Value) -> Result<(), Raised>;

/// One constant-pool entry produced by the compiler.
#[derive(Debug, Clone)]
pub enum ConstSpec {
    Integer(i64),
    Float(f64),
    String(String),
    Function {
        name: String,
        entry: u32,
        num_regs: u8,
        args_reg: u8,
        this_reg: u8,
        params: Vec<String>,
        kind: FuncKind,
    },
}

/// Compiler output for one module.
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    pub bytecode: Vec<u8>,
    pub constants: Vec<ConstSpec>,
    /// Sorted (bytecode offset, source line) pairs.
    pub line_table: Vec<(u32, u32)>,
    /// Entry offset of the top-level code.
    pub main_entry: u32,
    /// Register-file size of the top-level frame.
    pub main_num_regs: u8,
}

/// External compiler seam: source text in, bytecode out.
pub trait ModuleCompiler: Send + Sync {
    fn compile(&self, name: &str, source: &[u8]) -> Result<CompiledUnit, String>;
}

/// Instance-wide module state.
#[derive(Default)]
pub struct ModuleRegistry {
    /// Loaded module objects, indexed by module id.
    modules: RwLock<Vec<ValueCell>>,
    names: RwLock<FxHashMap<Box<str>, u32>>,
    inits: RwLock<FxHashMap<Box<str>, BuiltinInit>>,
    search_paths: RwLock<Vec<PathBuf>>,
    /// Names being loaded right now, for import cycle detection.
    load_chain: Mutex<Vec<Box<str>>>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.modules.read().len())
            .finish()
    }
}

impl ModuleRegistry {
    pub fn count(&self) -> u32 {
        self.modules.read().len() as u32
    }

    /// Module object by registry index.
    pub fn by_index(&self, index: u32) -> Option<Value> {
        self.modules.read().get(index as usize).map(|cell| cell.get())
    }

    pub fn by_name(&self, name: &str) -> Option<Value> {
        let index = *self.names.read().get(name)?;
        self.by_index(index)
    }

    fn install(&self, name: &str, module: Value) -> u32 {
        let mut modules = self.modules.write();
        let index = modules.len() as u32;
        modules.push(ValueCell::new(module));
        self.names.write().insert(name.into(), index);
        index
    }

    pub(crate) fn trace(&self, visit: &mut dyn FnMut(Value)) {
        for cell in self.modules.read().iter() {
            visit(cell.get());
        }
    }

    pub(crate) fn update_refs(&self, remap: &dyn Fn(Value) -> Value) {
        for cell in self.modules.read().iter() {
            cell.set(remap(cell.get()));
        }
    }
}

/// Append a directory to the module search paths.
pub fn add_search_path(ctx: &Context, path: impl Into<PathBuf>) {
    ctx.instance().modules.search_paths.write().push(path.into());
}

/// Derive the default search path from the interpreter binary's
/// location.
pub fn add_default_path(ctx: &Context, argv0: &str) {
    let dir = Path::new(argv0).parent().unwrap_or_else(|| Path::new("."));
    add_search_path(ctx, dir.join("modules"));
}

/// Register a built-in module initializer under `name`.
pub fn register_builtin(ctx: &Context, name: &str, init: BuiltinInit) {
    ctx.instance().modules.inits.write().insert(name.into(), init);
}

/// Module of the function currently executing on `ctx`, or `void`.
pub fn get_module(ctx: &Context) -> Value {
    let current = crate::interp::current_function(ctx);
    match current {
        Some(func) => match ctx.resolve(func) {
            Some(obj) => match &obj.body {
                ObjBody::Function(f) => f.module.get(),
                ObjBody::Class(c) => c.fun.module.get(),
                _ => ctx.void_val(),
            },
            None => ctx.void_val(),
        },
        None => ctx.void_val(),
    }
}

/// A module that is mid-load must not be handed out half-initialized:
/// requesting it again from inside its own load is an import cycle,
/// even though it is already installed in the registry.
fn check_cycle(ctx: &Context, name: &str) -> Result<(), Raised> {
    let chain = ctx.instance().modules.load_chain.lock();
    if chain.iter().any(|entry| &**entry == name) {
        let path = chain.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(" -> ");
        drop(chain);
        return Err(ctx.raise_kind(
            ExcKind::ImportCycle,
            &format!("import cycle: {} -> {}", path, name),
        ));
    }
    Ok(())
}

/// Resolve a path or bare name against the search paths and load the
/// module. Loading the same name twice returns the existing module.
pub fn load_from_path(ctx: &Context, path: &str) -> Result<Value, Raised> {
    let (name, file) = resolve_path(ctx, path)?;
    check_cycle(ctx, &name)?;
    if let Some(existing) = ctx.instance().modules.by_name(&name) {
        return Ok(existing);
    }

    // Blocking file I/O happens with the context suspended so it does
    // not hold up a collection.
    ctx.suspend();
    let source = std::fs::read(&file);
    ctx.resume();

    let source = source.map_err(|err| {
        ctx.raise_kind(
            ExcKind::ModuleNotFound,
            &format!("cannot read module {}: {}", file.display(), err),
        )
    })?;

    load_impl(ctx, &name, &file.display().to_string(), &source)
}

/// Load a module from an in-memory source buffer.
pub fn load_from_memory(ctx: &Context, name: &str, source: &[u8]) -> Result<Value, Raised> {
    check_cycle(ctx, name)?;
    if let Some(existing) = ctx.instance().modules.by_name(name) {
        return Ok(existing);
    }
    load_impl(ctx, name, "<memory>", source)
}

/// Load a precompiled unit directly, bypassing the compiler. Used by
/// embedders that ship bytecode.
pub fn load_precompiled(
    ctx: &Context,
    name: &str,
    unit: &CompiledUnit,
) -> Result<Value, Raised> {
    check_cycle(ctx, name)?;
    if let Some(existing) = ctx.instance().modules.by_name(name) {
        return Ok(existing);
    }
    let _chain = ChainGuard::enter(ctx, name)?;
    install_and_run(ctx, name, "<precompiled>", unit)
}

fn resolve_path(ctx: &Context, spec: &str) -> Result<(String, PathBuf), Raised> {
    let as_path = Path::new(spec);
    if as_path.extension().is_some() || spec.contains(std::path::MAIN_SEPARATOR) {
        let name = as_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(spec)
            .to_string();
        return Ok((name, as_path.to_path_buf()));
    }

    let paths = ctx.instance().modules.search_paths.read().clone();
    for dir in &paths {
        let candidate = dir.join(format!("{}.{}", spec, MODULE_EXT));
        if candidate.is_file() {
            return Ok((spec.to_string(), candidate));
        }
    }
    Err(ctx.raise_kind(
        ExcKind::ModuleNotFound,
        &format!("module {} not found on search paths", spec),
    ))
}

/// RAII entry in the import chain; detects cycles. Entries are
/// removed by name so concurrent loads on other threads are not
/// disturbed.
struct ChainGuard<'a> {
    ctx: &'a Context,
    name: Box<str>,
}

impl<'a> ChainGuard<'a> {
    fn enter(ctx: &'a Context, name: &str) -> Result<ChainGuard<'a>, Raised> {
        let mut chain = ctx.instance().modules.load_chain.lock();
        if chain.iter().any(|entry| &**entry == name) {
            let path = chain.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(" -> ");
            drop(chain);
            return Err(ctx.raise_kind(
                ExcKind::ImportCycle,
                &format!("import cycle: {} -> {}", path, name),
            ));
        }
        chain.push(name.into());
        Ok(ChainGuard { ctx, name: name.into() })
    }
}

impl Drop for ChainGuard<'_> {
    fn drop(&mut self) {
        let mut chain = self.ctx.instance().modules.load_chain.lock();
        if let Some(pos) = chain.iter().rposition(|entry| *entry == self.name) {
            chain.remove(pos);
        }
    }
}

fn load_impl(ctx: &Context, name: &str, path: &str, source: &[u8]) -> Result<Value, Raised> {
    let _chain = ChainGuard::enter(ctx, name)?;

    let compiled = {
        let compiler = ctx.instance().compiler.read();
        let Some(compiler) = compiler.as_ref() else {
            return Err(ctx.raise_kind(
                ExcKind::ModuleInitFailed,
                "no compiler installed on this instance",
            ));
        };
        compiler.compile(name, source)
    };
    let unit = compiled
        .map_err(|err| ctx.raise_kind(ExcKind::ModuleInitFailed, &format!("compile failed: {}", err)))?;

    install_and_run(ctx, name, path, &unit)
}

fn install_and_run(
    ctx: &Context,
    name: &str,
    path: &str,
    unit: &CompiledUnit,
) -> Result<Value, Raised> {
    if let Err(err) = vela_bytecode::validate(&unit.bytecode) {
        return Err(ctx.raise_kind(ExcKind::InvalidValue, &format!("bad bytecode: {}", err)));
    }

    if ctx.instance().flags().contains(crate::config::InstanceFlags::DISASM) {
        match vela_bytecode::disassemble(&unit.bytecode) {
            Ok(listing) => debug!("module {} bytecode:\n{}", name, listing),
            Err(err) => debug!("module {} disassembly failed: {}", name, err),
        }
    }
    if ctx.instance().flags().contains(crate::config::InstanceFlags::VERBOSE) {
        debug!("loading module {} from {}", name, path);
    }

    // The module is installed with placeholder constants, then the
    // pool is filled in place: function constants need the module
    // value, and every allocated constant must be rooted through the
    // registered module while the rest of the pool is built.
    let index = ctx.instance().modules.count();
    let placeholder = vec![Value::BAD; unit.constants.len()];
    let module_obj = ModuleObj::new(
        name,
        path,
        index,
        unit.bytecode.clone().into_boxed_slice(),
        placeholder,
        unit.line_table.clone(),
    );
    let module = ctx.alloc(ObjBody::Module(module_obj))?;
    let installed = ctx.instance().modules.install(name, module);
    debug_assert_eq!(installed, index);

    // Re-read the module value from the registry after every
    // allocation; the constants themselves are rooted by the module.
    for (i, spec) in unit.constants.iter().enumerate() {
        let module = ctx.instance().modules.by_index(index).expect("just installed");
        let value = build_constant(ctx, module, spec)?;
        let module = ctx.instance().modules.by_index(index).expect("just installed");
        with_module_obj(ctx, module, |m| m.constants[i].set(value))?;
    }

    // Top-level code runs as an ordinary function.
    let module = ctx.instance().modules.by_index(index).expect("just installed");
    let main = FunctionObj::bytecode(
        &format!("<{}>", name),
        module,
        unit.main_entry,
        unit.main_num_regs,
        0,
        NO_REG,
        Vec::new(),
        FuncKind::Plain,
    );
    let main_fn = crate::object::function::new_function(ctx, main)?;
    let module = ctx.instance().modules.by_index(index).expect("just installed");
    with_module_obj(ctx, module, |m| m.main_fn.set(main_fn))?;

    // Built-in initializer first, then the compiled top-level code.
    let init = ctx.instance().modules.inits.read().get(name).copied();
    if let Some(init) = init {
        let module = ctx.instance().modules.by_index(index).expect("just installed");
        init(ctx, module).map_err(|raised| {
            if !ctx.is_exception_pending() {
                ctx.raise_kind(ExcKind::ModuleInitFailed, "builtin initializer failed");
            }
            raised
        })?;
    }

    run_module(ctx, ctx.instance().modules.by_index(index).expect("just installed"))?;
    Ok(ctx.instance().modules.by_index(index).expect("just installed"))
}

fn with_module_obj<T>(
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

fn build_constant(ctx: &Context, module: Value, spec: &ConstSpec) -> Result<Value, Raised> {
    match spec {
        ConstSpec::Integer(i) => {
            if crate::value::small_int_fits(*i) {
                Ok(Value::from_small_int(*i))
            } else {
                ctx.alloc(ObjBody::Integer(*i))
            }
        }
        ConstSpec::Float(f) => ctx.alloc(ObjBody::Float(*f)),
        ConstSpec::String(s) => crate::object::string::new_string(ctx, s),
        ConstSpec::Function { name, entry, num_regs, args_reg, this_reg, params, kind } => {
            let args = params
                .iter()
                .map(|p| crate::object::function::ArgDesc::mandatory(p))
                .collect();
            let fun = FunctionObj::bytecode(
                name, module, *entry, *num_regs, *args_reg, *this_reg, args, *kind,
            );
            if *kind == FuncKind::Ctor {
                crate::object::function::new_class(ctx, fun)
            } else {
                crate::object::function::new_function(ctx, fun)
            }
        }
    }
}

/// Execute a module's top-level code; returns its result value.
pub fn run_module(ctx: &Context, module: Value) -> Result<Value, Raised> {
    let main_fn = with_module_obj(ctx, module, |m| m.main_fn.get())?;
    if main_fn.is_bad() {
        return Ok(ctx.void_val());
    }
    let empty = ctx.instance().consts.empty_array.get();
    crate::interp::call_function(ctx, main_fn, ctx.void_val(), empty)
}

/// Look up a function global on a module and call it with no
/// arguments. With `required` false, a missing global yields `void`.
pub fn run_function(
    ctx: &Context,
    module: Value,
    name: &str,
    required: bool,
) -> Result<Value, Raised> {
    let found = with_module_obj(ctx, module, |m| {
        m.global_index(name).and_then(|slot| m.global(slot))
    })?;
    let func = match found {
        Some(func) => func,
        None if required => {
            return Err(ctx.raise_kind(ExcKind::NotFound, "function not found in module"));
        }
        None => return Ok(ctx.void_val()),
    };
    let empty = ctx.instance().consts.empty_array.get();
    crate::interp::call_function(ctx, func, ctx.void_val(), empty)
}
