//! Shared helpers for the integration suites.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use vela_bytecode::Assembler;
use vela_rt::error::Raised;
use vela_rt::module::{self, CompiledUnit, ConstSpec};
use vela_rt::{Config, Context, Instance, InstanceFlags, Value};

static NEXT_MODULE: AtomicU32 = AtomicU32::new(0);

#[allow(dead_code)]
pub fn instance() -> (Arc<Instance>, Context) {
    Instance::init(InstanceFlags::NONE).expect("instance init")
}

#[allow(dead_code)]
pub fn instance_with(config: Config, flags: InstanceFlags) -> (Arc<Instance>, Context) {
    Instance::init_with_config(config, flags).expect("instance init")
}

/// Assemble and load a one-off module. The builder returns the
/// constant pool (so function constants can reference label offsets).
#[allow(dead_code)]
pub fn load_program(
    ctx: &Context,
    num_regs: u8,
    build: impl FnOnce(&mut Assembler) -> Vec<ConstSpec>,
) -> Result<Value, Raised> {
    let mut asm = Assembler::new();
    let constants = build(&mut asm);
    let bytecode = asm.finish().expect("assembly");

    let unit = CompiledUnit {
        bytecode,
        constants,
        line_table: vec![(0, 1)],
        main_entry: 0,
        main_num_regs: num_regs,
    };
    let name = format!("test_{}", NEXT_MODULE.fetch_add(1, Ordering::Relaxed));
    module::load_precompiled(ctx, &name, &unit)
}

/// Assemble, load and execute; returns the top-level result.
#[allow(dead_code)]
pub fn run_program(
    ctx: &Context,
    num_regs: u8,
    build: impl FnOnce(&mut Assembler) -> Vec<ConstSpec>,
) -> Result<Value, Raised> {
    let module = load_program(ctx, num_regs, build)?;
    module::run_module(ctx, module)
}

/// Unwrap a value known to be a small integer.
#[allow(dead_code)]
pub fn as_int(value: Value) -> i64 {
    assert!(value.is_small_int(), "expected small integer, got {:?}", value);
    value.as_small_int()
}
