//! Runtime Instance
//!
//! The instance is the ambient shared state of a running interpreter:
//! the heap, the prototype table for built-in types, the canonical
//! constant values, the module registry, the thread registry and the
//! GC control block. All threads share one instance through `Arc`;
//! per-thread state lives in [`Context`].

pub mod context;
pub mod locals;
pub mod safepoint;
pub mod thread;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::{Config, InstanceFlags};
use crate::error::{Error, Raised};
use crate::gc::GcControl;
use crate::heap::Heap;
use crate::module::{ModuleCompiler, ModuleRegistry};
use crate::object::{ArrayObj, ObjBody, PropsObj, StringObj, TypeTag};
use crate::value::{Value, ValueCell};

pub use context::Context;
pub use locals::{Local, ULocal};
pub use thread::{spawn, VelaThread};

/// Prototype table for built-in types, rooted by the GC.
#[derive(Debug, Default)]
pub struct Prototypes {
    pub object: ValueCell,
    pub number: ValueCell,
    pub integer: ValueCell,
    pub float: ValueCell,
    pub string: ValueCell,
    pub boolean: ValueCell,
    pub array: ValueCell,
    pub buffer: ValueCell,
    pub function: ValueCell,
    pub class: ValueCell,
    pub generator: ValueCell,
    pub exception: ValueCell,
    pub generator_end: ValueCell,
}

impl Prototypes {
    fn cells(&self) -> [&ValueCell; 13] {
        [
            &self.object,
            &self.number,
            &self.integer,
            &self.float,
            &self.string,
            &self.boolean,
            &self.array,
            &self.buffer,
            &self.function,
            &self.class,
            &self.generator,
            &self.exception,
            &self.generator_end,
        ]
    }

    pub fn trace(&self, visit: &mut dyn FnMut(Value)) {
        for cell in self.cells() {
            visit(cell.get());
        }
    }

    pub fn update_refs(&self, remap: &dyn Fn(Value) -> Value) {
        for cell in self.cells() {
            cell.set(remap(cell.get()));
        }
    }
}

/// Canonical values allocated once per instance on the first pages:
/// the singletons, the empty containers, common key strings, the type
/// name strings, and the preallocated out-of-memory exception.
#[derive(Debug, Default)]
pub struct ConstTable {
    pub void: ValueCell,
    pub bool_false: ValueCell,
    pub bool_true: ValueCell,
    pub empty_string: ValueCell,
    pub empty_array: ValueCell,
    pub str_value: ValueCell,
    pub str_backtrace: ValueCell,
    pub str_file: ValueCell,
    pub str_line: ValueCell,
    pub str_function: ValueCell,
    pub str_offset: ValueCell,
    /// Raised without allocating when the heap is exhausted.
    pub out_of_memory: ValueCell,
    /// Type name strings in `type_name_index` order.
    pub type_names: Vec<ValueCell>,
}

/// Index of a tag's name in `ConstTable::type_names`.
pub(crate) fn type_name_index(tag: TypeTag) -> usize {
    match tag {
        TypeTag::Void => 0,
        TypeTag::Boolean => 1,
        TypeTag::Integer => 2,
        TypeTag::Float => 3,
        TypeTag::String => 4,
        TypeTag::Array => 5,
        TypeTag::Buffer => 6,
        TypeTag::Object | TypeTag::DynamicProp => 7,
        TypeTag::Function => 8,
        TypeTag::Class => 9,
        TypeTag::Module => 10,
        TypeTag::Stack => 11,
        TypeTag::Iterator => 12,
        TypeTag::Opaque => 13,
    }
}

const TYPE_NAME_COUNT: usize = 14;

impl ConstTable {
    fn cells(&self) -> Vec<&ValueCell> {
        let mut cells = vec![
            &self.void,
            &self.bool_false,
            &self.bool_true,
            &self.empty_string,
            &self.empty_array,
            &self.str_value,
            &self.str_backtrace,
            &self.str_file,
            &self.str_line,
            &self.str_function,
            &self.str_offset,
            &self.out_of_memory,
        ];
        cells.extend(self.type_names.iter());
        cells
    }

    pub fn trace(&self, visit: &mut dyn FnMut(Value)) {
        for cell in self.cells() {
            visit(cell.get());
        }
    }

    pub fn update_refs(&self, remap: &dyn Fn(Value) -> Value) {
        for cell in self.cells() {
            cell.set(remap(cell.get()));
        }
    }
}

/// Rooted value slots used to pass values between threads (spawn
/// arguments in, join results out). Traced and updated by the GC, so
/// a slot's value survives collections between the two ends of the
/// handoff.
#[derive(Debug, Default)]
pub(crate) struct HandoffTable {
    slots: Vec<Option<Value>>,
    free: Vec<usize>,
}

impl HandoffTable {
    pub(crate) fn store(&mut self, value: Value) -> usize {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(value);
                index
            }
            None => {
                self.slots.push(Some(value));
                self.slots.len() - 1
            }
        }
    }

    pub(crate) fn take(&mut self, index: usize) -> Value {
        let value = self.slots[index].take().expect("live handoff slot");
        self.free.push(index);
        value
    }

    pub(crate) fn trace(&self, visit: &mut dyn FnMut(Value)) {
        for value in self.slots.iter().flatten() {
            visit(*value);
        }
    }

    pub(crate) fn update_refs(&mut self, remap: &dyn Fn(Value) -> Value) {
        for slot in self.slots.iter_mut() {
            if let Some(value) = slot {
                *value = remap(*value);
            }
        }
    }
}

/// Registry of per-thread contexts.
#[derive(Debug, Default)]
pub(crate) struct ThreadRegistry {
    pub(crate) contexts: Mutex<Vec<Arc<context::ThreadState>>>,
    /// Serializes thread creation against GC engagement: the
    /// collector holds this for the whole cycle, spawn holds it until
    /// the new thread has registered its context.
    pub(crate) spawn_mutex: Mutex<()>,
    pub(crate) handoff: Mutex<HandoffTable>,
}

pub struct Instance {
    pub(crate) flags: InstanceFlags,
    pub(crate) config: Config,
    pub(crate) heap: Heap,
    pub prototypes: Prototypes,
    pub consts: ConstTable,
    pub(crate) modules: ModuleRegistry,
    pub(crate) threads: ThreadRegistry,
    pub(crate) gc: GcControl,
    pub(crate) args: ValueCell,
    pub(crate) compiler: RwLock<Option<Box<dyn ModuleCompiler>>>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("flags", &self.flags)
            .field("heap", &self.heap)
            .finish()
    }
}

impl Instance {
    /// Create an instance with default configuration and register the
    /// calling thread.
    pub fn init(flags: InstanceFlags) -> Result<(Arc<Instance>, Context), Error> {
        Instance::init_with_config(Config::default(), flags)
    }

    pub fn init_with_config(
        config: Config,
        flags: InstanceFlags,
    ) -> Result<(Arc<Instance>, Context), Error> {
        config.validate()?;

        let instance = Arc::new(Instance {
            flags,
            heap: Heap::new(&config),
            gc: GcControl::new(&config),
            config,
            prototypes: Prototypes::default(),
            consts: ConstTable {
                type_names: (0..TYPE_NAME_COUNT).map(|_| ValueCell::bad()).collect(),
                ..Default::default()
            },
            modules: ModuleRegistry::default(),
            threads: ThreadRegistry::default(),
            args: ValueCell::bad(),
            compiler: RwLock::new(None),
        });

        let ctx = Context::register(instance.clone());
        instance
            .bootstrap(&ctx)
            .map_err(|_| Error::Configuration("instance bootstrap ran out of memory".into()))?;
        Ok((instance, ctx))
    }

    /// Allocate the singletons, canonical constants and builtin
    /// prototypes.
    fn bootstrap(&self, ctx: &Context) -> Result<(), Raised> {
        // Singletons first; they land on the first page and are
        // compared by identity from then on.
        self.consts.void.set(ctx.alloc_read_only(ObjBody::Void)?);
        self.consts.bool_false.set(ctx.alloc_read_only(ObjBody::Boolean(false))?);
        self.consts.bool_true.set(ctx.alloc_read_only(ObjBody::Boolean(true))?);

        self.consts
            .empty_string
            .set(ctx.alloc_read_only(ObjBody::String(StringObj::from_str("")))?);

        let empty = ArrayObj::new(0, self.consts.void.get());
        let empty_array = ctx.alloc(ObjBody::Array(empty))?;
        ctx.obj(empty_array)?.header.set_read_only();
        self.consts.empty_array.set(empty_array);

        for (name, cell) in [
            ("value", &self.consts.str_value),
            ("backtrace", &self.consts.str_backtrace),
            ("file", &self.consts.str_file),
            ("line", &self.consts.str_line),
            ("function", &self.consts.str_function),
            ("offset", &self.consts.str_offset),
        ] {
            cell.set(crate::object::string::new_string(ctx, name)?);
        }

        self.consts
            .out_of_memory
            .set(crate::object::string::new_string(ctx, "OutOfMemory: allocation failed")?);

        for tag in [
            TypeTag::Void,
            TypeTag::Boolean,
            TypeTag::Integer,
            TypeTag::Float,
            TypeTag::String,
            TypeTag::Array,
            TypeTag::Buffer,
            TypeTag::Object,
            TypeTag::Function,
            TypeTag::Class,
            TypeTag::Module,
            TypeTag::Stack,
            TypeTag::Iterator,
            TypeTag::Opaque,
        ] {
            let name = crate::object::string::new_string(ctx, tag.name())?;
            self.consts.type_names[type_name_index(tag)].set(name);
        }

        // Prototype chain: every builtin prototype is a plain object
        // whose own prototype is the object prototype. The object
        // prototype is re-read from its rooted cell on every use so a
        // collection between allocations cannot leave a stale handle.
        self.prototypes
            .object
            .set(ctx.alloc(ObjBody::Object(PropsObj::new(Value::BAD)))?);
        for cell in [
            &self.prototypes.number,
            &self.prototypes.integer,
            &self.prototypes.float,
            &self.prototypes.string,
            &self.prototypes.boolean,
            &self.prototypes.array,
            &self.prototypes.buffer,
            &self.prototypes.function,
            &self.prototypes.class,
            &self.prototypes.generator,
            &self.prototypes.exception,
            &self.prototypes.generator_end,
        ] {
            let proto = PropsObj::new(self.prototypes.object.get());
            cell.set(ctx.alloc(ObjBody::Object(proto))?);
        }

        // Number subtype prototypes chain through the number prototype.
        let number = self.prototypes.number.get();
        crate::object::props::set_prototype(ctx, self.prototypes.integer.get(), number)?;
        crate::object::props::set_prototype(ctx, self.prototypes.float.get(), number)?;

        Ok(())
    }

    /// Register the calling OS thread; it participates in GC until the
    /// returned context drops.
    pub fn register_thread(self: &Arc<Instance>) -> Context {
        Context::register(self.clone())
    }

    pub fn flags(&self) -> InstanceFlags {
        self.flags
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Install the external compiler used by source-module loading.
    pub fn set_compiler(&self, compiler: Box<dyn ModuleCompiler>) {
        *self.compiler.write() = Some(compiler);
    }

    /// Store the program arguments as an array of strings, reachable
    /// from scripts through the module API.
    pub fn set_args(&self, ctx: &Context, argv: &[&str]) -> Result<(), Raised> {
        // The array is rooted first; each string is stored into it
        // immediately so no argument outlives an allocation unrooted.
        let array = crate::object::array::new_array(ctx, argv.len() as i64)?;
        let root = ctx.init_local_with(array);
        for (i, arg) in argv.iter().enumerate() {
            let s = crate::object::string::new_string(ctx, arg)?;
            crate::object::array::write(ctx, root.get(), i as i64, s)?;
        }
        self.args.set(root.get());
        Ok(())
    }

    pub fn args(&self) -> Value {
        self.args.get()
    }
}

impl Drop for Instance {
    /// Run remaining finalizers: every live object with private state
    /// still owns it when the instance goes away.
    fn drop(&mut self) {
        for page in self.heap.pages_snapshot() {
            page.for_each(|_, obj| {
                obj.body.run_finalizer();
            });
        }
        for (_, obj) in self.heap.large_snapshot() {
            obj.body.run_finalizer();
        }
    }
}
