//! Bytecode Interpreter
//!
//! Register-based, flat dispatch: ordinary calls push frames onto the
//! thread's stack chain and continue in the same loop, so script
//! recursion does not consume native stack. Only generator resumption
//! nests the executor, bounded by generator nesting depth.
//!
//! Frames live in heap Stack objects (the GC walks and rewrites them),
//! laid out as `[func, catch_word, instr_offs, r0..rN-1, N]`. The
//! program counter is written back to the frame before every call,
//! yield and unwind, so a collection or a backtrace always observes a
//! settled stack.
//!
//! Exception flow: operations return `Err(Raised)` with the pending
//! exception set; the loop unwinds to the nearest armed CATCH, popping
//! frames (and detaching generator stacks) on the way. An exception
//! that leaves the entry frame propagates to the native caller.

pub mod ops;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use vela_bytecode::{decode, Instr, Opcode, NO_REG};

use crate::error::{ExcKind, Raised};
use crate::object::function::{FuncKind, FunctionObj};
use crate::object::stack::{self, StackObj, FLAG_CAN_YIELD, FLAG_GENERATOR_DONE, NO_CATCH};
use crate::object::{GenState, HeapObject, IterObj, ModuleObj, ObjBody, TypeTag};
use crate::runtime::Context;
use crate::value::Value;

/// How a frame left the executor.
enum Flow {
    Return(Value),
    Yield(Value),
}

/// Call flavors of the embedding API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Function,
    Generator,
    Apply,
}

/// Call a function, constructor, generator function or iterator.
pub fn call_function(ctx: &Context, func: Value, this: Value, args: Value) -> Result<Value, Raised> {
    call(ctx, func, this, args, Flavor::Function)
}

/// Drive a generator: `Ok(Some(value))` per yield, `Ok(None)` once the
/// generator finishes.
pub fn call_generator(
    ctx: &Context,
    func: Value,
    this: Value,
    args: Value,
) -> Result<Option<Value>, Raised> {
    match call(ctx, func, this, args, Flavor::Generator) {
        Ok(value) => Ok(Some(value)),
        Err(Raised) => {
            if ctx.exception_kind() == Some(ExcKind::GeneratorEnd) {
                ctx.clear_exception();
                Ok(None)
            } else {
                Err(Raised)
            }
        }
    }
}

/// Like `call_function`, but the argument array is passed through
/// without descriptor re-binding: no defaults are filled and missing
/// arguments arrive as `void`.
pub fn apply_function(ctx: &Context, func: Value, this: Value, args: Value) -> Result<Value, Raised> {
    call(ctx, func, this, args, Flavor::Apply)
}

/// Function object of the innermost frame, if any.
pub(crate) fn current_function(ctx: &Context) -> Option<Value> {
    let stack_val = ctx.state.stack.get();
    if stack_val.is_bad() {
        return None;
    }
    let obj = ctx.resolve(stack_val)?;
    let stack = as_stack(&obj);
    let regs_idx = stack.top_regs_idx()?;
    Some(stack.func(regs_idx))
}

// === Frame plumbing ===

fn as_stack(obj: &Arc<HeapObject>) -> &StackObj {
    match &obj.body {
        ObjBody::Stack(s) => s,
        _ => unreachable!("stack chain holds stack objects"),
    }
}

fn with_function<T>(
    ctx: &Context,
    func: Value,
    f: impl FnOnce(&FunctionObj) -> T,
) -> Result<T, Raised> {
    let obj = ctx.obj(func)?;
    match &obj.body {
        ObjBody::Function(fun) => Ok(f(fun)),
        ObjBody::Class(c) => Ok(f(&c.fun)),
        _ => Err(ctx.raise_kind(ExcKind::TypeError, "value is not callable")),
    }
}

/// Create the thread's root stack on first use.
fn ensure_stack(ctx: &Context) -> Result<(), Raised> {
    if ctx.state.stack.get().is_bad() {
        let stack = ctx.alloc(ObjBody::Stack(StackObj::new_root()))?;
        ctx.state.stack.set(stack);
        ctx.state.regs_idx.store(0, Ordering::Release);
    }
    Ok(())
}

fn cur_stack(ctx: &Context) -> Result<Arc<HeapObject>, Raised> {
    ctx.obj(ctx.state.stack.get())
}

/// Push a frame onto the current stack and make it current.
fn push_frame(ctx: &Context, func: Value, entry: u32, num_regs: u8) -> Result<u32, Raised> {
    let stack_arc = cur_stack(ctx)?;
    let regs_idx = as_stack(&stack_arc).push_frame(func, entry, num_regs, ctx.void_val());
    ctx.state.regs_idx.store(regs_idx, Ordering::Release);
    ctx.state.stack_depth.fetch_add(1, Ordering::AcqRel);
    Ok(regs_idx)
}

/// Pop the current frame; restores the register base of the frame
/// below on the same stack.
fn pop_frame(ctx: &Context) -> Result<(), Raised> {
    let stack_arc = cur_stack(ctx)?;
    let below = as_stack(&stack_arc).pop_frame();
    ctx.state.regs_idx.store(below.unwrap_or(0), Ordering::Release);
    ctx.state.stack_depth.fetch_sub(1, Ordering::AcqRel);
    Ok(())
}

fn depth(ctx: &Context) -> u32 {
    ctx.state.stack_depth.load(Ordering::Acquire)
}

/// Unlink a suspended or finished reentrant stack from the chain and
/// restore the caller's frame.
fn detach_reentrant(ctx: &Context, ren: &StackObj) -> Result<(), Raised> {
    let prev = ren.prev();
    ren.set_prev(Value::BAD);
    ctx.state.stack.set(prev);
    if prev.is_bad() {
        ctx.state.regs_idx.store(0, Ordering::Release);
    } else {
        let prev_arc = ctx.obj(prev)?;
        let regs = as_stack(&prev_arc).top_regs_idx().unwrap_or(0);
        ctx.state.regs_idx.store(regs, Ordering::Release);
    }
    Ok(())
}

// === Entry point ===

fn call(ctx: &Context, func: Value, this: Value, args: Value, flavor: Flavor) -> Result<Value, Raised> {
    // Native-to-interpreter entry is a safepoint.
    ctx.check_safepoint();

    let func_root = ctx.init_local_with(func);
    let this_root = ctx.init_local_with(this);
    let args_root = ctx.init_local_with(args);

    let result = call_rooted(ctx, &func_root, &this_root, &args_root, flavor);

    drop(args_root);
    drop(this_root);
    drop(func_root);
    result
}

fn call_rooted(
    ctx: &Context,
    func: &crate::runtime::Local<'_>,
    this: &crate::runtime::Local<'_>,
    args: &crate::runtime::Local<'_>,
    flavor: Flavor,
) -> Result<Value, Raised> {
    match ctx.type_of(func.get()) {
        TypeTag::Iterator => {
            return resume_iterator(ctx, func.get(), args.get());
        }
        TypeTag::Function | TypeTag::Class => {}
        _ => return Err(ctx.raise_kind(ExcKind::TypeError, "value is not callable")),
    }

    let (kind, is_native) = with_function(ctx, func.get(), |f| (f.kind, f.is_native()))?;

    match kind {
        FuncKind::GenInit => {
            let iterator = instantiate_iterator(ctx, func.get(), this.get(), args.get(), flavor)?;
            if flavor == Flavor::Generator {
                let iter_root = ctx.init_local_with(iterator);
                let empty = ctx.instance().consts.empty_array.get();
                resume_iterator(ctx, iter_root.get(), empty)
            } else {
                Ok(iterator)
            }
        }
        FuncKind::Plain if is_native => call_native(ctx, func.get(), this.get(), args.get(), flavor),
        FuncKind::Ctor if is_native => {
            let proto = with_function(ctx, func.get(), |f| f.proto.get())?;
            let new_obj = crate::object::props::new_object(ctx, proto)?;
            let obj_root = ctx.init_local_with(new_obj);
            let returned = call_native(ctx, func.get(), obj_root.get(), args.get(), flavor)?;
            if returned == ctx.void_val() {
                Ok(obj_root.take())
            } else {
                Ok(returned)
            }
        }
        FuncKind::Plain => {
            ensure_stack(ctx)?;
            // Binding happens before the frame exists so a binding
            // failure cannot leak a frame; it performs no allocation,
            // so the bound values stay valid until they are written.
            let bound = bind_values(ctx, func.get(), args.get(), flavor)?;
            let (entry, num_regs) = with_function(ctx, func.get(), |f| (f.entry, f.num_regs))?;
            push_frame(ctx, func.get(), entry, num_regs)?;
            write_frame_args(ctx, func.get(), this.get(), &bound)?;
            match exec(ctx, depth(ctx) - 1)? {
                Flow::Return(value) => Ok(value),
                Flow::Yield(_) => unreachable!("plain frames cannot yield"),
            }
        }
        FuncKind::Ctor => {
            ensure_stack(ctx)?;
            let proto = with_function(ctx, func.get(), |f| f.proto.get())?;
            let new_obj = crate::object::props::new_object(ctx, proto)?;
            let obj_root = ctx.init_local_with(new_obj);

            let bound = bind_values(ctx, func.get(), args.get(), flavor)?;
            let (entry, num_regs) = with_function(ctx, func.get(), |f| (f.entry, f.num_regs))?;
            push_frame(ctx, func.get(), entry, num_regs)?;
            write_frame_args(ctx, func.get(), obj_root.get(), &bound)?;
            drop(obj_root);
            match exec(ctx, depth(ctx) - 1)? {
                Flow::Return(value) => Ok(value),
                Flow::Yield(_) => unreachable!("constructor frames cannot yield"),
            }
        }
    }
}

/// Fill the freshly pushed current frame's argument and `this`
/// registers. Performs no allocation.
fn write_frame_args(
    ctx: &Context,
    func: Value,
    this: Value,
    bound: &[Value],
) -> Result<(), Raised> {
    let stack_arc = cur_stack(ctx)?;
    let stack = as_stack(&stack_arc);
    let regs_idx = ctx.state.regs_idx.load(Ordering::Acquire);

    let (args_reg, this_reg, num_regs) =
        with_function(ctx, func, |f| (f.args_reg, f.this_reg, f.num_regs))?;
    for (i, value) in bound.iter().enumerate() {
        let reg = args_reg as usize + i;
        if reg < num_regs as usize {
            stack.set_reg(regs_idx, reg as u8, *value);
        }
    }
    if this_reg != NO_REG && (this_reg as u32) < num_regs as u32 {
        stack.set_reg(regs_idx, this_reg, this);
    }
    Ok(())
}

/// Bind a call's argument array against the descriptors, without
/// allocating. Strict binding fills defaults and rejects missing
/// mandatory arguments; apply binding passes positionally with `void`
/// holes.
fn bind_values(
    ctx: &Context,
    func: Value,
    args: Value,
    flavor: Flavor,
) -> Result<Vec<Value>, Raised> {
    if flavor == Flavor::Apply {
        let count = with_function(ctx, func, |f| f.args.len())?;
        let supplied = if args.is_bad() { 0 } else { crate::object::array::len(ctx, args)? };
        let mut bound = Vec::with_capacity(count);
        for i in 0..count {
            if (i as u32) < supplied {
                bound.push(crate::object::array::read(ctx, args, i as i64)?);
            } else {
                bound.push(ctx.void_val());
            }
        }
        return Ok(bound);
    }
    crate::object::function::bind_args(ctx, func, args)
}

/// Invoke a native handler under a marker frame (for backtraces and
/// `get_module`).
fn call_native(
    ctx: &Context,
    func: Value,
    this: Value,
    args: Value,
    flavor: Flavor,
) -> Result<Value, Raised> {
    let func_root = ctx.init_local_with(func);
    let this_root = ctx.init_local_with(this);
    let completed = complete_args(ctx, func_root.get(), args, flavor)?;
    let args_root = ctx.init_local_with(completed);

    ensure_stack(ctx)?;
    push_frame(ctx, func_root.get(), 0, 0)?;

    let handler = with_function(ctx, func_root.get(), |f| f.handler)?
        .ok_or_else(|| ctx.raise_kind(ExcKind::TypeError, "function has no native handler"))?;
    let result = handler(ctx, this_root.get(), args_root.get());

    pop_frame(ctx)?;
    drop(args_root);
    drop(this_root);
    drop(func_root);
    result
}

/// Argument array a native handler receives: defaults filled when the
/// caller supplied fewer arguments than declared.
fn complete_args(ctx: &Context, func: Value, args: Value, flavor: Flavor) -> Result<Value, Raised> {
    let empty = ctx.instance().consts.empty_array.get();
    let args = if args.is_bad() { empty } else { args };
    if flavor == Flavor::Apply {
        return Ok(args);
    }

    let declared = with_function(ctx, func, |f| f.args.len() as u32)?;
    let supplied = crate::object::array::len(ctx, args)?;
    if supplied >= declared {
        return Ok(args);
    }

    let func_root = ctx.init_local_with(func);
    let args_root = ctx.init_local_with(args);
    let out = crate::object::array::new_array(ctx, declared as i64)?;
    let out_root = ctx.init_local_with(out);

    for i in 0..declared {
        let value = if i < supplied {
            crate::object::array::read(ctx, args_root.get(), i as i64)?
        } else {
            let default = with_function(ctx, func_root.get(), |f| f.args[i as usize].default.get())?;
            if default.is_bad() {
                return Err(ctx.raise_kind(ExcKind::TypeError, "missing mandatory argument"));
            }
            default
        };
        crate::object::array::write(ctx, out_root.get(), i as i64, value)?;
    }
    Ok(out_root.take())
}

// === Generators ===

/// Build the iterator for a generator-init call: a reentrant stack
/// holding the suspended first frame.
fn instantiate_iterator(
    ctx: &Context,
    func: Value,
    this: Value,
    args: Value,
    flavor: Flavor,
) -> Result<Value, Raised> {
    let func_root = ctx.init_local_with(func);
    let this_root = ctx.init_local_with(this);
    let args_root = ctx.init_local_with(args);

    let is_native = with_function(ctx, func_root.get(), |f| f.is_native())?;

    let iterator = if is_native {
        // Native generators keep `this` and the completed argument
        // array in a two-register frame; each resume calls the
        // handler with them.
        let completed = complete_args(ctx, func_root.get(), args_root.get(), flavor)?;
        let comp_root = ctx.init_local_with(completed);

        let stack_val = ctx.alloc(ObjBody::Stack(StackObj::new_reentrant()))?;
        let stack_root = ctx.init_local_with(stack_val);
        {
            let stack_arc = ctx.obj(stack_root.get())?;
            let stack = as_stack(&stack_arc);
            let regs_idx = stack.push_frame(func_root.get(), 0, 2, ctx.void_val());
            stack.set_reg(regs_idx, 0, this_root.get());
            stack.set_reg(regs_idx, 1, comp_root.get());
            stack.set_flag(FLAG_CAN_YIELD);
        }
        ctx.alloc(ObjBody::Iterator(IterObj::new(stack_root.get())))?
    } else {
        let stack_val = ctx.alloc(ObjBody::Stack(StackObj::new_reentrant()))?;
        let stack_root = ctx.init_local_with(stack_val);
        {
            let stack_arc = ctx.obj(stack_root.get())?;
            let stack = as_stack(&stack_arc);
            let (entry, num_regs, args_reg, this_reg) = with_function(ctx, func_root.get(), |f| {
                (f.entry, f.num_regs, f.args_reg, f.this_reg)
            })?;
            let regs_idx = stack.push_frame(func_root.get(), entry, num_regs, ctx.void_val());

            let bound = bind_values(ctx, func_root.get(), args_root.get(), flavor)?;
            for (i, value) in bound.iter().enumerate() {
                let reg = args_reg as usize + i;
                if reg < num_regs as usize {
                    stack.set_reg(regs_idx, reg as u8, *value);
                }
            }
            if this_reg != NO_REG && (this_reg as u32) < num_regs as u32 {
                stack.set_reg(regs_idx, this_reg, this_root.get());
            }
            stack.set_flag(FLAG_CAN_YIELD);
        }
        ctx.alloc(ObjBody::Iterator(IterObj::new(stack_root.get())))?
    };

    Ok(iterator)
}

/// Resume a suspended iterator; returns the next yielded value.
/// Finishing (or resuming a finished iterator) raises generator-end.
fn resume_iterator(ctx: &Context, iter: Value, args: Value) -> Result<Value, Raised> {
    let iter_arc = ctx.obj(iter)?;
    let iterator = match &iter_arc.body {
        ObjBody::Iterator(i) => i,
        _ => return Err(ctx.raise_kind(ExcKind::TypeError, "value is not an iterator")),
    };

    let prev_state = match iterator.try_start() {
        Ok(state) => state,
        Err(GenState::Done) => return Err(ctx.raise_generator_end()),
        Err(_) => {
            return Err(ctx.raise_kind(ExcKind::TypeError, "generator is already running"));
        }
    };

    let ren_val = iterator.stack.get();
    let ren_arc = ctx.obj(ren_val)?;
    let ren = as_stack(&ren_arc);
    let Some(frame_regs) = ren.top_regs_idx() else {
        iterator.set_state(GenState::Done);
        return Err(ctx.raise_generator_end());
    };

    let gen_func = ren.func(frame_regs);
    let handler = with_function(ctx, gen_func, |f| f.handler)?;

    if let Some(handler) = handler {
        // Native generator: one handler call per resumption.
        let this = ren.reg(frame_regs, 0);
        let gen_args = ren.reg(frame_regs, 1);
        match handler(ctx, this, gen_args) {
            Ok(value) => {
                iterator.set_state(GenState::Active);
                Ok(value)
            }
            Err(Raised) => {
                iterator.set_state(GenState::Done);
                ren.set_flag(FLAG_GENERATOR_DONE);
                Err(Raised)
            }
        }
    } else {
        if prev_state == GenState::Active {
            // Deliver the resume value into the yield register.
            let resume_value = if !args.is_bad() && crate::object::array::len(ctx, args)? > 0 {
                crate::object::array::read(ctx, args, 0)?
            } else {
                ctx.void_val()
            };
            ren.set_reg(frame_regs, ren.yield_reg(), resume_value);
        }

        ren.set_prev(ctx.state.stack.get());
        ctx.state.stack.set(ren_val);
        ctx.state.regs_idx.store(frame_regs, Ordering::Release);
        ctx.state.stack_depth.fetch_add(1, Ordering::AcqRel);

        match exec(ctx, depth(ctx) - 1) {
            Ok(Flow::Yield(value)) => {
                iterator.set_state(GenState::Active);
                Ok(value)
            }
            Ok(Flow::Return(_)) => {
                iterator.set_state(GenState::Done);
                Err(ctx.raise_generator_end())
            }
            Err(Raised) => {
                iterator.set_state(GenState::Done);
                Err(Raised)
            }
        }
    }
}

// === Dispatch loop ===

/// What an instruction asked the loop to do next.
enum Step {
    /// Advance past the instruction.
    Next,
    /// Transfer to an absolute offset.
    Jump(usize),
    /// Reload the frame context (a frame was pushed or replaced).
    Reload,
    /// Unwind the current frame with `value` as its result.
    Return(Value),
    /// Leave the executor.
    Finish(Flow),
}

/// Run frames until the one at `base_depth + 1` returns or yields.
fn exec(ctx: &Context, base_depth: u32) -> Result<Flow, Raised> {
    'frames: loop {
        let stack_arc = cur_stack(ctx)?;
        let stack = as_stack(&stack_arc);
        let regs_idx = ctx.state.regs_idx.load(Ordering::Acquire);
        let func_val = stack.func(regs_idx);

        let func_arc = ctx.obj(func_val)?;
        let fun = match &func_arc.body {
            ObjBody::Function(f) => f,
            ObjBody::Class(c) => &c.fun,
            _ => return Err(ctx.raise_kind(ExcKind::InvalidValue, "frame without a function")),
        };
        let module_arc = ctx.obj(fun.module.get())?;
        let module = match &module_arc.body {
            ObjBody::Module(m) => m,
            _ => return Err(ctx.raise_kind(ExcKind::InvalidValue, "function without a module")),
        };
        let code: &[u8] = &module.bytecode;
        let num_regs = fun.num_regs;
        let fun_kind = fun.kind;
        let this_reg = fun.this_reg;

        let mut pc = stack.instr_offs(regs_idx) as usize;

        loop {
            let instr = match decode(code, pc) {
                Ok(instr) => instr,
                Err(err) => {
                    let raised =
                        ctx.raise_kind(ExcKind::InvalidValue, &format!("bad instruction: {}", err));
                    stack.set_instr_offs(regs_idx, pc as u32);
                    unwind(ctx, base_depth, raised)?;
                    continue 'frames;
                }
            };

            let outcome = step(
                ctx, stack, regs_idx, num_regs, fun_kind, this_reg, module, &instr, pc, base_depth,
            );

            match outcome {
                Ok(Step::Next) => pc += instr.len,
                Ok(Step::Jump(target)) => {
                    if target <= pc {
                        ctx.check_safepoint();
                    }
                    pc = target;
                }
                Ok(Step::Reload) => continue 'frames,
                Ok(Step::Return(value)) => {
                    match do_return(ctx, base_depth, value)? {
                        Some(flow) => return Ok(flow),
                        None => continue 'frames,
                    }
                }
                Ok(Step::Finish(flow)) => return Ok(flow),
                Err(raised) => {
                    stack.set_instr_offs(regs_idx, pc as u32);
                    unwind(ctx, base_depth, raised)?;
                    continue 'frames;
                }
            }
        }
    }
}

/// Return `value` from the current frame. Yields `Some(flow)` when
/// control leaves the executor, `None` when it continues in a caller
/// frame.
fn do_return(ctx: &Context, base_depth: u32, value: Value) -> Result<Option<Flow>, Raised> {
    let mut value = value;
    loop {
        let stack_arc = cur_stack(ctx)?;
        let stack = as_stack(&stack_arc);

        if stack.is_reentrant() && stack.frame_count() == 1 {
            // The generator frame itself is returning.
            stack.clear_flag(FLAG_CAN_YIELD);
            stack.set_flag(FLAG_GENERATOR_DONE);
            stack.pop_frame();
            ctx.state.stack_depth.fetch_sub(1, Ordering::AcqRel);
            detach_reentrant(ctx, stack)?;
            debug_assert_eq!(depth(ctx), base_depth);
            return Ok(Some(Flow::Return(value)));
        }

        pop_frame(ctx)?;
        if depth(ctx) == base_depth {
            return Ok(Some(Flow::Return(value)));
        }

        // Hand the value to the calling frame: re-decode the call
        // instruction it is parked on.
        let stack_arc = cur_stack(ctx)?;
        let stack = as_stack(&stack_arc);
        let regs_idx = ctx.state.regs_idx.load(Ordering::Acquire);
        let caller_pc = stack.instr_offs(regs_idx) as usize;

        let caller_func = stack.func(regs_idx);
        let module_val = with_function(ctx, caller_func, |f| f.module.get())?;
        let module_arc = ctx.obj(module_val)?;
        let code: &[u8] = match &module_arc.body {
            ObjBody::Module(m) => &m.bytecode,
            _ => return Err(ctx.raise_kind(ExcKind::InvalidValue, "function without a module")),
        };
        let instr = decode(code, caller_pc)
            .map_err(|e| ctx.raise_kind(ExcKind::InvalidValue, &format!("bad call site: {}", e)))?;

        match instr.op {
            Opcode::Call => {
                stack.set_reg(regs_idx, instr.regs[0], value);
                stack.set_instr_offs(regs_idx, (caller_pc + instr.len) as u32);
                return Ok(None);
            }
            // A degraded tail call: the callee's result is also this
            // frame's result, so keep unwinding.
            Opcode::TailCall => {
                let fun_kind = with_function(ctx, caller_func, |f| f.kind)?;
                let caller_this_reg = with_function(ctx, caller_func, |f| f.this_reg)?;
                if fun_kind == FuncKind::Ctor && caller_this_reg != NO_REG {
                    value = stack.reg(regs_idx, caller_this_reg);
                }
                continue;
            }
            _ => {
                return Err(ctx.raise_kind(ExcKind::InvalidValue, "return to a non-call site"));
            }
        }
    }
}

/// Unwind after an exception: find the nearest armed CATCH at or
/// below the current frame, popping frames on the way. `Ok` means a
/// handler took over; `Err` means the exception left the entry frame.
fn unwind(ctx: &Context, base_depth: u32, raised: Raised) -> Result<(), Raised> {
    wrap_exception(ctx);

    loop {
        let stack_arc = cur_stack(ctx)?;
        let stack = as_stack(&stack_arc);
        let regs_idx = ctx.state.regs_idx.load(Ordering::Acquire);

        let (catch_offs, catch_reg) = stack::unpack_catch(stack.catch_word(regs_idx));
        if catch_offs != NO_CATCH {
            // One-shot handler: disarm, deliver, resume there.
            stack.set_catch_word(regs_idx, stack::pack_catch(NO_CATCH, 0));
            let exception = ctx.get_exception();
            ctx.clear_exception();
            stack.set_reg(regs_idx, catch_reg, exception);
            stack.set_instr_offs(regs_idx, catch_offs);
            return Ok(());
        }

        if stack.is_reentrant() && stack.frame_count() == 1 {
            // Unwinding through a generator frame finishes it.
            stack.clear_flag(FLAG_CAN_YIELD);
            stack.set_flag(FLAG_GENERATOR_DONE);
            stack.pop_frame();
            ctx.state.stack_depth.fetch_sub(1, Ordering::AcqRel);
            detach_reentrant(ctx, stack)?;
        } else {
            pop_frame(ctx)?;
        }

        if depth(ctx) == base_depth {
            return Err(raised);
        }
    }
}

/// Execute one instruction.
#[allow(clippy::too_many_arguments)]
fn step(
    ctx: &Context,
    stack: &StackObj,
    regs_idx: u32,
    num_regs: u8,
    fun_kind: FuncKind,
    this_reg: u8,
    module: &ModuleObj,
    instr: &Instr,
    pc: usize,
    base_depth: u32,
) -> Result<Step, Raised> {
    let reg = |r: u8| -> Result<Value, Raised> {
        if r >= num_regs {
            return Err(ctx.raise_kind(ExcKind::InvalidValue, "register out of range"));
        }
        Ok(stack.reg(regs_idx, r))
    };
    let set = |r: u8, v: Value| -> Result<(), Raised> {
        if r >= num_regs {
            return Err(ctx.raise_kind(ExcKind::InvalidValue, "register out of range"));
        }
        stack.set_reg(regs_idx, r, v);
        Ok(())
    };
    let const_at = |index: i64| -> Result<Value, Raised> {
        module
            .constants
            .get(index as usize)
            .map(|cell| cell.get())
            .filter(|v| !v.is_bad())
            .ok_or_else(|| ctx.raise_kind(ExcKind::InvalidValue, "constant index out of range"))
    };
    let const_string = |index: i64| -> Result<String, Raised> {
        let value = const_at(index)?;
        crate::object::string::rust_string(ctx, value)
    };
    let module_at = |index: i64| -> Result<Value, Raised> {
        ctx.instance()
            .modules
            .by_index(index as u32)
            .ok_or_else(|| ctx.raise_kind(ExcKind::OutOfRange, "module index out of range"))
    };

    match instr.op {
        // === Value construction ===
        Opcode::LoadVoid => {
            set(instr.regs[0], ctx.void_val())?;
            Ok(Step::Next)
        }
        Opcode::LoadFalse => {
            set(instr.regs[0], ctx.false_val())?;
            Ok(Step::Next)
        }
        Opcode::LoadTrue => {
            set(instr.regs[0], ctx.true_val())?;
            Ok(Step::Next)
        }
        Opcode::LoadInt8 => {
            set(instr.regs[0], Value::from_small_int(instr.imms[0]))?;
            Ok(Step::Next)
        }
        Opcode::LoadConst => {
            let value = const_at(instr.imms[0])?;
            set(instr.regs[0], value)?;
            Ok(Step::Next)
        }
        Opcode::NewArray8 => {
            let array = crate::object::array::new_array(ctx, instr.imms[0])?;
            set(instr.regs[0], array)?;
            Ok(Step::Next)
        }
        Opcode::NewObj => {
            let proto = if instr.regs[1] == NO_REG { Value::BAD } else { reg(instr.regs[1])? };
            let object = crate::object::props::new_object(ctx, proto)?;
            set(instr.regs[0], object)?;
            Ok(Step::Next)
        }

        // === Generic data access ===
        Opcode::Get => {
            let value = ops::get_generic(ctx, reg(instr.regs[1])?, reg(instr.regs[2])?, false)?;
            set(instr.regs[0], value)?;
            Ok(Step::Next)
        }
        Opcode::GetOpt => {
            let value = ops::get_generic(ctx, reg(instr.regs[1])?, reg(instr.regs[2])?, true)?;
            set(instr.regs[0], value)?;
            Ok(Step::Next)
        }
        Opcode::GetElem8 => {
            let value = ops::get_elem(ctx, reg(instr.regs[1])?, instr.imms[0], false)?;
            set(instr.regs[0], value)?;
            Ok(Step::Next)
        }
        Opcode::GetElem8Opt => {
            let value = ops::get_elem(ctx, reg(instr.regs[1])?, instr.imms[0], true)?;
            set(instr.regs[0], value)?;
            Ok(Step::Next)
        }
        Opcode::GetRange => {
            let begin = if instr.regs[2] == NO_REG { ctx.void_val() } else { reg(instr.regs[2])? };
            let end = if instr.regs[3] == NO_REG { ctx.void_val() } else { reg(instr.regs[3])? };
            let value = ops::get_range(ctx, reg(instr.regs[1])?, begin, end)?;
            set(instr.regs[0], value)?;
            Ok(Step::Next)
        }
        Opcode::GetProp8 => {
            let name = const_string(instr.imms[0])?;
            let value = crate::object::props::get_prop(ctx, reg(instr.regs[1])?, &name)?;
            set(instr.regs[0], value)?;
            Ok(Step::Next)
        }
        Opcode::GetProp8Opt => {
            let name = const_string(instr.imms[0])?;
            let value = crate::object::props::get_prop_opt(ctx, reg(instr.regs[1])?, &name)?;
            set(instr.regs[0], value)?;
            Ok(Step::Next)
        }
        Opcode::GetProto => {
            let proto = crate::object::props::get_prototype(ctx, reg(instr.regs[1])?)?;
            set(instr.regs[0], proto)?;
            Ok(Step::Next)
        }
        Opcode::Set => {
            ops::set_generic(ctx, reg(instr.regs[0])?, reg(instr.regs[1])?, reg(instr.regs[2])?)?;
            Ok(Step::Next)
        }
        Opcode::SetElem8 => {
            ops::set_elem(ctx, reg(instr.regs[0])?, instr.imms[0], reg(instr.regs[1])?)?;
            Ok(Step::Next)
        }
        Opcode::SetProp8 => {
            let name = const_string(instr.imms[0])?;
            crate::object::props::set_prop(ctx, reg(instr.regs[0])?, &name, reg(instr.regs[1])?)?;
            Ok(Step::Next)
        }
        Opcode::Del => {
            ops::del_generic(ctx, reg(instr.regs[0])?, reg(instr.regs[1])?)?;
            Ok(Step::Next)
        }
        Opcode::Push => {
            crate::object::array::push(ctx, reg(instr.regs[0])?, reg(instr.regs[1])?)?;
            Ok(Step::Next)
        }
        Opcode::PushEx => {
            ops::push_expanded(ctx, reg(instr.regs[0])?, reg(instr.regs[1])?)?;
            Ok(Step::Next)
        }

        // === Module-scoped access ===
        Opcode::GetMod => {
            let value = module_at(instr.imms[0])?;
            set(instr.regs[0], value)?;
            Ok(Step::Next)
        }
        Opcode::GetModElem => {
            let target = module_at(instr.imms[0])?;
            let value = crate::module::get_global_by_index(ctx, target, instr.imms[1] as u32)?;
            set(instr.regs[0], value)?;
            Ok(Step::Next)
        }
        Opcode::GetModGlobal => {
            let target = module_at(instr.imms[0])?;
            let name = crate::object::string::rust_string(ctx, reg(instr.regs[1])?)?;
            let (value, _) = crate::module::get_global(ctx, target, &name)?;
            set(instr.regs[0], value)?;
            Ok(Step::Next)
        }
        Opcode::GetModGlobalOpt => {
            let result = (|| -> Result<Value, Raised> {
                let target = module_at(instr.imms[0])?;
                let name = crate::object::string::rust_string(ctx, reg(instr.regs[1])?)?;
                Ok(crate::module::get_global(ctx, target, &name)?.0)
            })();
            let value = match result {
                Ok(value) => value,
                Err(Raised) => {
                    ctx.clear_exception();
                    ctx.void_val()
                }
            };
            set(instr.regs[0], value)?;
            Ok(Step::Next)
        }
        Opcode::GetGlobal => {
            let value = module.global(instr.imms[0] as u32).ok_or_else(|| {
                ctx.raise_kind(ExcKind::OutOfRange, "global index out of range")
            })?;
            set(instr.regs[0], value)?;
            Ok(Step::Next)
        }

        // === Type queries ===
        Opcode::Type => {
            let name = ops::type_name(ctx, reg(instr.regs[1])?);
            set(instr.regs[0], name)?;
            Ok(Step::Next)
        }
        Opcode::HasDp | Opcode::HasSh => {
            let recv = reg(instr.regs[1])?;
            let key = reg(instr.regs[2])?;
            let found = match ctx.type_of(key) {
                TypeTag::String => {
                    let name = crate::object::string::rust_string(ctx, key)?;
                    if instr.op == Opcode::HasDp {
                        crate::object::props::has_deep(ctx, recv, &name)?
                    } else {
                        crate::object::props::has_shallow(ctx, recv, &name)?
                    }
                }
                _ => false,
            };
            set(instr.regs[0], ctx.bool_val(found))?;
            Ok(Step::Next)
        }
        Opcode::HasDpProp8 | Opcode::HasShProp8 => {
            let recv = reg(instr.regs[1])?;
            let name = const_string(instr.imms[0])?;
            let found = if instr.op == Opcode::HasDpProp8 {
                crate::object::props::has_deep(ctx, recv, &name)?
            } else {
                crate::object::props::has_shallow(ctx, recv, &name)?
            };
            set(instr.regs[0], ctx.bool_val(found))?;
            Ok(Step::Next)
        }

        // === Arithmetic ===
        Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
            let op = match instr.op {
                Opcode::Add => ops::ArithOp::Add,
                Opcode::Sub => ops::ArithOp::Sub,
                Opcode::Mul => ops::ArithOp::Mul,
                Opcode::Div => ops::ArithOp::Div,
                _ => ops::ArithOp::Mod,
            };
            let value = ops::arith(ctx, op, reg(instr.regs[1])?, reg(instr.regs[2])?)?;
            set(instr.regs[0], value)?;
            Ok(Step::Next)
        }

        // === Bitwise ===
        Opcode::And | Opcode::Or | Opcode::Xor | Opcode::Shl | Opcode::Shr | Opcode::Shru => {
            let op = match instr.op {
                Opcode::And => ops::BitOp::And,
                Opcode::Or => ops::BitOp::Or,
                Opcode::Xor => ops::BitOp::Xor,
                Opcode::Shl => ops::BitOp::Shl,
                Opcode::Shr => ops::BitOp::Shr,
                _ => ops::BitOp::Shru,
            };
            let value = ops::bitwise(ctx, op, reg(instr.regs[1])?, reg(instr.regs[2])?)?;
            set(instr.regs[0], value)?;
            Ok(Step::Next)
        }
        Opcode::Not => {
            let value = ops::bit_not(ctx, reg(instr.regs[1])?)?;
            set(instr.regs[0], value)?;
            Ok(Step::Next)
        }

        // === Comparison ===
        Opcode::CmpEq | Opcode::CmpNe => {
            let equal = ops::equal(ctx, reg(instr.regs[1])?, reg(instr.regs[2])?)?;
            let result = if instr.op == Opcode::CmpEq { equal } else { !equal };
            set(instr.regs[0], ctx.bool_val(result))?;
            Ok(Step::Next)
        }
        Opcode::CmpLe | Opcode::CmpLt => {
            let order = ops::compare(ctx, reg(instr.regs[1])?, reg(instr.regs[2])?)?;
            let result = if instr.op == Opcode::CmpLe {
                order != std::cmp::Ordering::Greater
            } else {
                order == std::cmp::Ordering::Less
            };
            set(instr.regs[0], ctx.bool_val(result))?;
            Ok(Step::Next)
        }

        // === Control flow ===
        Opcode::Jump => Ok(Step::Jump(instr.jump_target(pc) as usize)),
        Opcode::JumpCond => {
            if ops::is_truthy(ctx, reg(instr.regs[0])?) {
                Ok(Step::Jump(instr.jump_target(pc) as usize))
            } else {
                Ok(Step::Next)
            }
        }
        Opcode::JumpNotCond => {
            if !ops::is_truthy(ctx, reg(instr.regs[0])?) {
                Ok(Step::Jump(instr.jump_target(pc) as usize))
            } else {
                Ok(Step::Next)
            }
        }
        Opcode::Catch => {
            if instr.regs[0] == NO_REG {
                stack.set_catch_word(regs_idx, stack::pack_catch(NO_CATCH, 0));
            } else {
                let target = instr.jump_target(pc);
                stack.set_catch_word(regs_idx, stack::pack_catch(target as u32, instr.regs[0]));
            }
            Ok(Step::Next)
        }
        Opcode::Throw => Err(ctx.raise(reg(instr.regs[0])?)),
        Opcode::Return => {
            let mut value = reg(instr.regs[0])?;
            if fun_kind == FuncKind::Ctor && this_reg != NO_REG {
                value = reg(this_reg)?;
            }
            Ok(Step::Return(value))
        }
        Opcode::Yield => {
            if !stack.is_reentrant()
                || stack.frame_count() != 1
                || stack.flags() & FLAG_CAN_YIELD == 0
            {
                return Err(ctx.raise_kind(ExcKind::TypeError, "yield outside a generator"));
            }
            let value = reg(instr.regs[0])?;
            stack.set_yield_reg(instr.regs[0]);
            stack.set_instr_offs(regs_idx, (pc + instr.len) as u32);
            ctx.state.stack_depth.fetch_sub(1, Ordering::AcqRel);
            detach_reentrant(ctx, stack)?;
            debug_assert_eq!(depth(ctx), base_depth);
            Ok(Step::Finish(Flow::Yield(value)))
        }
        Opcode::Call => exec_call(ctx, stack, regs_idx, instr, pc, false),
        Opcode::TailCall => exec_call(ctx, stack, regs_idx, instr, pc, true),
    }
}

/// CALL and TAIL.CALL. For CALL the operands are
/// `(dst, func, this, args)`; for TAIL.CALL `(func, this, args)`.
fn exec_call(
    ctx: &Context,
    stack: &StackObj,
    regs_idx: u32,
    instr: &Instr,
    pc: usize,
    tail: bool,
) -> Result<Step, Raised> {
    ctx.check_safepoint();

    let (rfunc, rthis, rargs) = if tail {
        (instr.regs[0], instr.regs[1], instr.regs[2])
    } else {
        (instr.regs[1], instr.regs[2], instr.regs[3])
    };

    let read = |r: u8, missing: Value| -> Value {
        if r == NO_REG {
            missing
        } else {
            stack.reg(regs_idx, r)
        }
    };
    let callee = read(rfunc, Value::BAD);
    let this = read(rthis, ctx.void_val());
    let args = read(rargs, ctx.instance().consts.empty_array.get());

    // The frame's program counter parks on this instruction; returns
    // re-decode it to find the destination.
    stack.set_instr_offs(regs_idx, pc as u32);

    match ctx.type_of(callee) {
        TypeTag::Iterator => {
            let result = resume_iterator(ctx, callee, args)?;
            if tail {
                return Ok(Step::Return(result));
            }
            stack.set_reg(regs_idx, instr.regs[0], result);
            stack.set_instr_offs(regs_idx, (pc + instr.len) as u32);
            Ok(Step::Next)
        }
        TypeTag::Function | TypeTag::Class => {
            let (kind, is_native) = with_function(ctx, callee, |f| (f.kind, f.is_native()))?;

            match kind {
                FuncKind::GenInit => {
                    let iterator =
                        instantiate_iterator(ctx, callee, this, args, Flavor::Function)?;
                    if tail {
                        return Ok(Step::Return(iterator));
                    }
                    stack.set_reg(regs_idx, instr.regs[0], iterator);
                    stack.set_instr_offs(regs_idx, (pc + instr.len) as u32);
                    Ok(Step::Next)
                }
                _ if is_native => {
                    let result = if kind == FuncKind::Ctor {
                        let proto = with_function(ctx, callee, |f| f.proto.get())?;
                        let callee_root = ctx.init_local_with(callee);
                        let args_root = ctx.init_local_with(args);
                        let new_obj = crate::object::props::new_object(ctx, proto)?;
                        let obj_root = ctx.init_local_with(new_obj);
                        let returned = call_native(
                            ctx,
                            callee_root.get(),
                            obj_root.get(),
                            args_root.get(),
                            Flavor::Function,
                        )?;
                        if returned == ctx.void_val() { obj_root.take() } else { returned }
                    } else {
                        call_native(ctx, callee, this, args, Flavor::Function)?
                    };
                    if tail {
                        return Ok(Step::Return(result));
                    }
                    stack.set_reg(regs_idx, instr.regs[0], result);
                    stack.set_instr_offs(regs_idx, (pc + instr.len) as u32);
                    Ok(Step::Next)
                }
                FuncKind::Plain | FuncKind::Ctor => {
                    let reuse_frame = tail
                        && kind == FuncKind::Plain
                        && !ctx
                            .instance()
                            .flags()
                            .contains(crate::config::InstanceFlags::DISABLE_TAIL_CALL);

                    // Constructors allocate `this` before any frame
                    // changes; the operands are rooted across the
                    // allocation so a collection cannot strand them.
                    let (this_value, callee, args) = if kind == FuncKind::Ctor {
                        let proto = with_function(ctx, callee, |f| f.proto.get())?;
                        let callee_root = ctx.init_local_with(callee);
                        let args_root = ctx.init_local_with(args);
                        let new_obj = crate::object::props::new_object(ctx, proto)?;
                        (new_obj, callee_root.get(), args_root.take())
                    } else {
                        (this, callee, args)
                    };

                    // Argument binding performs no allocation, so the
                    // bound values stay valid across the frame switch.
                    let bound = bind_values(ctx, callee, args, Flavor::Function)?;
                    let (entry, callee_regs, args_reg, callee_this_reg) =
                        with_function(ctx, callee, |f| {
                            (f.entry, f.num_regs, f.args_reg, f.this_reg)
                        })?;

                    if reuse_frame {
                        // True tail call: the current frame goes away
                        // before the callee's is pushed.
                        pop_frame(ctx)?;
                    }
                    let new_regs = push_frame(ctx, callee, entry, callee_regs)?;

                    let stack_arc = cur_stack(ctx)?;
                    let new_stack = as_stack(&stack_arc);
                    for (i, value) in bound.iter().enumerate() {
                        let r = args_reg as usize + i;
                        if r < callee_regs as usize {
                            new_stack.set_reg(new_regs, r as u8, *value);
                        }
                    }
                    if callee_this_reg != NO_REG && (callee_this_reg as u32) < callee_regs as u32 {
                        new_stack.set_reg(new_regs, callee_this_reg, this_value);
                    }
                    Ok(Step::Reload)
                }
            }
        }
        _ => Err(ctx.raise_kind(ExcKind::TypeError, "value is not callable")),
    }
}

// === Exception presentation ===

/// Wrap a freshly raised exception value into an exception object
/// carrying a backtrace, unless it is already wrapped. Failure to
/// allocate leaves the original value pending.
fn wrap_exception(ctx: &Context) {
    let exc = ctx.get_exception();
    if exc.is_bad() || is_wrapped(ctx, exc) {
        return;
    }
    // The generator-end marker is control flow, not an error worth a
    // backtrace.
    if ctx.exception_kind() == Some(ExcKind::GeneratorEnd) {
        return;
    }

    // Snapshot the frame chain as plain data before allocating.
    let frames = backtrace_frames(ctx);

    let exc_root = ctx.init_local_with(exc);
    ctx.clear_exception();

    let built = build_exception_object(ctx, &exc_root, &frames);
    match built {
        Ok(wrapped) => {
            ctx.raise(wrapped);
        }
        Err(Raised) => {
            // Keep the unwrapped value; whatever the failed build
            // raised is discarded.
            ctx.raise(exc_root.get());
        }
    }
    drop(exc_root);
}

fn is_wrapped(ctx: &Context, exc: Value) -> bool {
    match ctx.resolve(exc).as_ref().map(|obj| &obj.body) {
        Some(ObjBody::Object(o)) => o.has_own("value") && o.has_own("backtrace"),
        _ => false,
    }
}

struct BtFrame {
    function: String,
    file: String,
    line: u32,
    offset: u32,
}

/// Collect the frame chain top-down without allocating on the value
/// heap.
fn backtrace_frames(ctx: &Context) -> Vec<BtFrame> {
    let mut frames = Vec::new();
    let mut stack_val = ctx.state.stack.get();

    while stack_val.is_heap() {
        let Some(stack_arc) = ctx.resolve(stack_val) else { break };
        let stack = as_stack(&stack_arc);

        let mut regs = stack.top_regs_idx();
        while let Some(regs_idx) = regs {
            let func = stack.func(regs_idx);
            let offset = stack.instr_offs(regs_idx);

            let mut entry = BtFrame {
                function: "<unknown>".into(),
                file: "<native>".into(),
                line: 0,
                offset,
            };
            if let Some(func_arc) = ctx.resolve(func) {
                let fun = match &func_arc.body {
                    ObjBody::Function(f) => Some(f),
                    ObjBody::Class(c) => Some(&c.fun),
                    _ => None,
                };
                if let Some(fun) = fun {
                    entry.function = fun.name.to_string();
                    if let Some(module_arc) = ctx.resolve(fun.module.get()) {
                        if let ObjBody::Module(m) = &module_arc.body {
                            entry.file = m.path.to_string();
                            entry.line = m.addr_to_line(offset);
                        }
                    }
                }
            }
            frames.push(entry);

            // Next frame below on this stack object.
            let buf = stack.buf.read();
            let frame_start = regs_idx as usize - 3;
            regs = if frame_start > 1 {
                let below_n = buf[frame_start - 1].as_small_int() as usize;
                Some((frame_start - 1 - below_n) as u32)
            } else {
                None
            };
            drop(buf);
        }

        stack_val = stack.prev();
    }

    frames
}

fn build_exception_object(
    ctx: &Context,
    exc: &crate::runtime::Local<'_>,
    frames: &[BtFrame],
) -> Result<Value, Raised> {
    let proto = ctx.instance().prototypes.exception.get();
    let wrapped = crate::object::props::new_object(ctx, proto)?;
    let wrapped_root = ctx.init_local_with(wrapped);

    crate::object::props::set_prop(ctx, wrapped_root.get(), "value", exc.get())?;

    let backtrace = crate::object::array::new_array(ctx, 0)?;
    let bt_root = ctx.init_local_with(backtrace);

    for frame in frames {
        let entry = crate::object::props::new_object(ctx, Value::BAD)?;
        let entry_root = ctx.init_local_with(entry);

        let file = crate::object::string::new_string(ctx, &frame.file)?;
        crate::object::props::set_prop(ctx, entry_root.get(), "file", file)?;
        crate::object::props::set_prop(
            ctx,
            entry_root.get(),
            "line",
            Value::from_small_int(frame.line as i64),
        )?;
        let function = crate::object::string::new_string(ctx, &frame.function)?;
        crate::object::props::set_prop(ctx, entry_root.get(), "function", function)?;
        crate::object::props::set_prop(
            ctx,
            entry_root.get(),
            "offset",
            Value::from_small_int(frame.offset as i64),
        )?;

        crate::object::array::push(ctx, bt_root.get(), entry_root.get())?;
        drop(entry_root);
    }

    crate::object::props::set_prop(ctx, wrapped_root.get(), "backtrace", bt_root.take())?;
    Ok(wrapped_root.take())
}

/// Render an exception value (wrapped or raw) with its backtrace.
pub(crate) fn format_exception(ctx: &Context, exception: Value) -> Result<String, Raised> {
    use std::fmt::Write;

    let mut out = String::new();

    let inner = match ctx.resolve(exception).as_ref().map(|obj| &obj.body) {
        Some(ObjBody::Object(o)) if o.has_own("value") => o.get_own("value").unwrap_or(exception),
        _ => exception,
    };
    writeln!(out, "Exception: {}", ops::display(ctx, inner)).unwrap();

    if let Some(ObjBody::Object(o)) = ctx.resolve(exception).as_ref().map(|obj| &obj.body) {
        if let Some(backtrace) = o.get_own("backtrace") {
            if let Some(ObjBody::Array(bt)) = ctx.resolve(backtrace).as_ref().map(|obj| &obj.body) {
                for (i, entry) in bt.to_vec().iter().enumerate() {
                    let (file, line, function, offset) = match ctx.resolve(*entry).as_ref().map(|e| &e.body)
                    {
                        Some(ObjBody::Object(e)) => (
                            e.get_own("file"),
                            e.get_own("line"),
                            e.get_own("function"),
                            e.get_own("offset"),
                        ),
                        _ => (None, None, None, None),
                    };
                    let file = file.map(|v| ops::display(ctx, v)).unwrap_or_default();
                    let line = line.map(|v| ops::display(ctx, v)).unwrap_or_default();
                    let function = function.map(|v| ops::display(ctx, v)).unwrap_or_default();
                    let offset = offset.map(|v| ops::display(ctx, v)).unwrap_or_default();
                    writeln!(out, "  #{} {}:{} in {} @{}", i, file, line, function, offset).unwrap();
                }
            }
        }
    }

    Ok(out)
}
