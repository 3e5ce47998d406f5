//! Interpreter integration: arithmetic promotion, the comparison
//! total order, truthiness, exception catch/unwind, generators and
//! tail calls, all through hand-assembled bytecode.

mod common;

use common::{as_int, instance, run_program};
use vela_bytecode::NO_REG;
use vela_rt::module::ConstSpec;
use vela_rt::object::function::FuncKind;
use vela_rt::object::{array, string, ObjBody, TypeTag};
use vela_rt::{call_function, call_generator, ExcKind, Value};

fn as_f64(ctx: &vela_rt::Context, value: Value) -> f64 {
    match vela_rt::interp::ops::to_numeric(ctx, value).unwrap() {
        vela_rt::Numeric::Float(f) => f,
        vela_rt::Numeric::Integer(i) => panic!("expected float, got integer {}", i),
    }
}

// === Scenario: integer/float arithmetic ===

#[test]
fn test_add_int_and_float_promotes() {
    let (_inst, ctx) = instance();
    let result = run_program(&ctx, 4, |asm| {
        asm.load_int8(0, 1);
        asm.load_const(1, 0);
        asm.add(2, 0, 1);
        asm.ret(2);
        vec![ConstSpec::Float(1.0)]
    })
    .unwrap();
    assert_eq!(ctx.type_of(result), TypeTag::Float);
    assert_eq!(as_f64(&ctx, result), 2.0);
}

#[test]
fn test_integer_division_truncates() {
    let (_inst, ctx) = instance();
    let result = run_program(&ctx, 4, |asm| {
        asm.load_int8(0, 6);
        asm.load_int8(1, 4);
        asm.div(2, 0, 1);
        asm.ret(2);
        vec![]
    })
    .unwrap();
    assert_eq!(as_int(result), 1);
}

#[test]
fn test_float_division() {
    let (_inst, ctx) = instance();
    let result = run_program(&ctx, 4, |asm| {
        asm.load_const(0, 0);
        asm.load_int8(1, 2);
        asm.div(2, 0, 1);
        asm.ret(2);
        vec![ConstSpec::Float(1.0)]
    })
    .unwrap();
    assert_eq!(as_f64(&ctx, result), 0.5);
}

#[test]
fn test_float_modulo_keeps_sign_of_dividend() {
    let (_inst, ctx) = instance();
    let result = run_program(&ctx, 4, |asm| {
        asm.load_const(0, 0);
        asm.load_const(1, 1);
        asm.modulo(2, 0, 1);
        asm.ret(2);
        vec![ConstSpec::Float(2.0), ConstSpec::Float(-3.0)]
    })
    .unwrap();
    assert_eq!(as_f64(&ctx, result), 2.0);
}

#[test]
fn test_division_by_zero_raises() {
    let (_inst, ctx) = instance();
    let err = run_program(&ctx, 4, |asm| {
        asm.load_int8(0, 6);
        asm.load_int8(1, 0);
        asm.div(2, 0, 1);
        asm.ret(2);
        vec![]
    });
    assert!(err.is_err());
    assert_eq!(ctx.exception_kind(), Some(ExcKind::DivisionByZero));
    ctx.clear_exception();
}

#[test]
fn test_arith_type_error_on_strings() {
    let (_inst, ctx) = instance();
    let err = run_program(&ctx, 4, |asm| {
        asm.load_const(0, 0);
        asm.load_int8(1, 1);
        asm.add(2, 0, 1);
        asm.ret(2);
        vec![ConstSpec::String("1".into())]
    });
    assert!(err.is_err());
    assert_eq!(ctx.exception_kind(), Some(ExcKind::TypeError));
    ctx.clear_exception();
}

#[test]
fn test_integer_wraparound() {
    let (_inst, ctx) = instance();
    let result = run_program(&ctx, 4, |asm| {
        asm.load_const(0, 0);
        asm.load_const(1, 0);
        asm.mul(2, 0, 1);
        asm.ret(2);
        vec![ConstSpec::Integer(i64::MAX / 2 + 1)]
    })
    .unwrap();
    // Two's-complement wrap, boxed back into an integer.
    let expected = (i64::MAX / 2 + 1).wrapping_mul(i64::MAX / 2 + 1);
    match &ctx.obj(result).unwrap().body {
        ObjBody::Integer(i) => assert_eq!(*i, expected),
        other => panic!("expected boxed integer, got {:?}", other.tag()),
    }
}

// === Scenario: comparison total order ===

/// Runs CMP on two constants and returns the boolean result.
fn cmp(ctx: &vela_rt::Context, a: ConstSpec, b: ConstSpec, lt: bool, eq_op: bool) -> bool {
    let result = run_program(ctx, 4, |asm| {
        asm.load_const(0, 0);
        asm.load_const(1, 1);
        if eq_op {
            asm.cmp_eq(2, 0, 1);
        } else if lt {
            asm.cmp_lt(2, 0, 1);
        } else {
            asm.cmp_le(2, 0, 1);
        }
        asm.ret(2);
        vec![a, b]
    })
    .unwrap();
    result == ctx.true_val()
}

#[test]
fn test_comparison_kind_order() {
    let (_inst, ctx) = instance();

    // void < boolean via registers (void has no constant form).
    let result = run_program(&ctx, 4, |asm| {
        asm.load_void(0);
        asm.load_false(1);
        asm.cmp_lt(2, 0, 1);
        asm.ret(2);
        vec![]
    })
    .unwrap();
    assert_eq!(result, ctx.true_val());

    // false < true.
    let result = run_program(&ctx, 4, |asm| {
        asm.load_false(0);
        asm.load_true(1);
        asm.cmp_lt(2, 0, 1);
        asm.ret(2);
        vec![]
    })
    .unwrap();
    assert_eq!(result, ctx.true_val());

    // true < 0 (boolean kind precedes numeric kind).
    let result = run_program(&ctx, 4, |asm| {
        asm.load_true(0);
        asm.load_int8(1, 0);
        asm.cmp_lt(2, 0, 1);
        asm.ret(2);
        vec![]
    })
    .unwrap();
    assert_eq!(result, ctx.true_val());

    // 1 < "0" (numeric kind precedes string kind).
    assert!(cmp(&ctx, ConstSpec::Integer(1), ConstSpec::String("0".into()), true, false));
}

#[test]
fn test_nan_comparisons() {
    let (_inst, ctx) = instance();
    assert!(!cmp(&ctx, ConstSpec::Float(f64::NAN), ConstSpec::Float(f64::NAN), false, true));

    // CMP.NE is the negation.
    let result = run_program(&ctx, 4, |asm| {
        asm.load_const(0, 0);
        asm.load_const(1, 0);
        asm.cmp_ne(2, 0, 1);
        asm.ret(2);
        vec![ConstSpec::Float(f64::NAN)]
    })
    .unwrap();
    assert_eq!(result, ctx.true_val());
}

#[test]
fn test_numeric_equality_across_tags() {
    let (_inst, ctx) = instance();
    assert!(cmp(&ctx, ConstSpec::Integer(2), ConstSpec::Float(2.0), false, true));
    assert!(!cmp(&ctx, ConstSpec::Integer(2), ConstSpec::String("2".into()), false, true));
    assert!(cmp(&ctx, ConstSpec::String("ab".into()), ConstSpec::String("ab".into()), false, true));
    assert!(cmp(&ctx, ConstSpec::String("ab".into()), ConstSpec::String("b".into()), true, false));
}

// === Truthiness ===

#[test]
fn test_jump_cond_truthiness() {
    let (_inst, ctx) = instance();

    // Returns 1 when the tested constant is truthy, 0 otherwise.
    let run_truthy = |spec: ConstSpec| -> i64 {
        let result = run_program(&ctx, 4, |asm| {
            let truthy = asm.label();
            asm.load_const(0, 0);
            asm.jump_cond(truthy, 0);
            asm.load_int8(1, 0);
            asm.ret(1);
            asm.bind(truthy);
            asm.load_int8(1, 1);
            asm.ret(1);
            vec![spec]
        })
        .unwrap();
        as_int(result)
    };

    assert_eq!(run_truthy(ConstSpec::Integer(0)), 0);
    assert_eq!(run_truthy(ConstSpec::Float(0.0)), 0);
    assert_eq!(run_truthy(ConstSpec::Integer(1)), 1);
    assert_eq!(run_truthy(ConstSpec::Float(f64::NAN)), 1);
    assert_eq!(run_truthy(ConstSpec::String("".into())), 1);

    // void and false are falsy; the empty array is truthy.
    let result = run_program(&ctx, 4, |asm| {
        let truthy = asm.label();
        asm.load_void(0);
        asm.jump_cond(truthy, 0);
        asm.load_int8(1, 0);
        asm.ret(1);
        asm.bind(truthy);
        asm.load_int8(1, 1);
        asm.ret(1);
        vec![]
    })
    .unwrap();
    assert_eq!(as_int(result), 0);

    let result = run_program(&ctx, 4, |asm| {
        let truthy = asm.label();
        asm.new_array8(0, 0);
        asm.jump_cond(truthy, 0);
        asm.load_int8(1, 0);
        asm.ret(1);
        asm.bind(truthy);
        asm.load_int8(1, 1);
        asm.ret(1);
        vec![]
    })
    .unwrap();
    assert_eq!(as_int(result), 1);
}

// === Loops and register traffic ===

#[test]
fn test_backward_jump_loop() {
    let (_inst, ctx) = instance();
    // Sum 1..=10 with a conditional backward jump.
    let result = run_program(&ctx, 6, |asm| {
        asm.load_int8(0, 0); // sum
        asm.load_int8(1, 10); // counter
        asm.load_int8(2, 1); // one
        let top = asm.label();
        asm.bind(top);
        asm.add(0, 0, 1);
        asm.sub(1, 1, 2);
        asm.jump_cond(top, 1);
        asm.ret(0);
        vec![]
    })
    .unwrap();
    assert_eq!(as_int(result), 55);
}

// === Exceptions ===

#[test]
fn test_throw_and_catch_in_frame() {
    let (_inst, ctx) = instance();
    // The caught exception is the wrapped object; its "value"
    // property carries the thrown value.
    let result = run_program(&ctx, 6, |asm| {
        let handler = asm.label();
        asm.catch(5, handler);
        asm.load_int8(1, 42);
        asm.throw(1);
        asm.load_void(0);
        asm.ret(0);
        asm.bind(handler);
        asm.get_prop8(0, 5, 0);
        asm.ret(0);
        vec![ConstSpec::String("value".into())]
    })
    .unwrap();
    assert_eq!(as_int(result), 42);
    assert!(!ctx.is_exception_pending());
}

#[test]
fn test_uncaught_exception_escapes_with_backtrace() {
    let (_inst, ctx) = instance();
    let err = run_program(&ctx, 4, |asm| {
        asm.load_int8(0, 7);
        asm.throw(0);
        asm.ret(0);
        vec![]
    });
    assert!(err.is_err());

    let exc = ctx.get_exception();
    let formatted = ctx.format_exception(exc).unwrap();
    assert!(formatted.contains("Exception: 7"), "got: {}", formatted);
    ctx.clear_exception();
}

#[test]
fn test_catch_across_call_frames() {
    let (_inst, ctx) = instance();
    // main arms a catch, calls a function that throws; the handler
    // receives the exception after the callee frame unwinds.
    let result = run_program(&ctx, 8, |asm| {
        let handler = asm.label();
        asm.catch(5, handler);
        asm.load_const(0, 0);
        asm.new_array8(1, 0);
        asm.call(2, 0, NO_REG, 1);
        asm.load_void(2);
        asm.ret(2);
        asm.bind(handler);
        asm.load_int8(0, 1);
        asm.ret(0);

        let thrower = asm.here() as u32;
        asm.load_int8(0, 13);
        asm.throw(0);
        asm.ret(0);

        vec![ConstSpec::Function {
            name: "thrower".into(),
            entry: thrower,
            num_regs: 2,
            args_reg: 0,
            this_reg: NO_REG,
            params: vec![],
            kind: FuncKind::Plain,
        }]
    })
    .unwrap();
    assert_eq!(as_int(result), 1);
    assert!(!ctx.is_exception_pending());
}

#[test]
fn test_one_shot_catch_and_cancel() {
    let (_inst, ctx) = instance();
    // A disarmed catch no longer intercepts.
    let err = run_program(&ctx, 6, |asm| {
        let handler = asm.label();
        asm.catch(5, handler);
        asm.cancel_catch();
        asm.load_int8(1, 3);
        asm.throw(1);
        asm.ret(1);
        asm.bind(handler);
        asm.load_int8(0, 99);
        asm.ret(0);
        vec![]
    });
    assert!(err.is_err());
    ctx.clear_exception();
}

// === Calls ===

#[test]
fn test_call_with_args_and_return() {
    let (_inst, ctx) = instance();
    // add3(a, b, c) called with [4, 5, 6].
    let result = run_program(&ctx, 8, |asm| {
        asm.load_const(0, 0);
        asm.new_array8(1, 0);
        asm.load_int8(2, 4);
        asm.push(1, 2);
        asm.load_int8(2, 5);
        asm.push(1, 2);
        asm.load_int8(2, 6);
        asm.push(1, 2);
        asm.call(3, 0, NO_REG, 1);
        asm.ret(3);

        let add3 = asm.here() as u32;
        asm.add(0, 0, 1);
        asm.add(0, 0, 2);
        asm.ret(0);

        vec![ConstSpec::Function {
            name: "add3".into(),
            entry: add3,
            num_regs: 4,
            args_reg: 0,
            this_reg: NO_REG,
            params: vec!["a".into(), "b".into(), "c".into()],
            kind: FuncKind::Plain,
        }]
    })
    .unwrap();
    assert_eq!(as_int(result), 15);
}

#[test]
fn test_missing_mandatory_argument() {
    let (_inst, ctx) = instance();
    let err = run_program(&ctx, 6, |asm| {
        asm.load_const(0, 0);
        asm.new_array8(1, 0);
        asm.call(2, 0, NO_REG, 1);
        asm.ret(2);

        let f = asm.here() as u32;
        asm.ret(0);

        vec![ConstSpec::Function {
            name: "f".into(),
            entry: f,
            num_regs: 2,
            args_reg: 0,
            this_reg: NO_REG,
            params: vec!["x".into()],
            kind: FuncKind::Plain,
        }]
    });
    assert!(err.is_err());
    assert_eq!(ctx.exception_kind(), Some(ExcKind::TypeError));
    ctx.clear_exception();
}

#[test]
fn test_deep_recursion_does_not_overflow_native_stack() {
    let (_inst, ctx) = instance();
    // down(n) = n == 0 ? 0 : down(n - 1), for n = 20000. Frames live
    // on the heap stack, not the native one.
    let result = run_program(&ctx, 8, |asm| {
        asm.load_const(0, 0);
        asm.new_array8(1, 0);
        asm.load_const(2, 1);
        asm.push(1, 2);
        asm.call(3, 0, NO_REG, 1);
        asm.ret(3);

        let down = asm.here() as u32;
        let recurse = asm.label();
        asm.jump_cond(recurse, 0);
        asm.ret(0);
        asm.bind(recurse);
        asm.load_int8(1, 1);
        asm.sub(0, 0, 1);
        asm.load_const(2, 0);
        asm.new_array8(3, 0);
        asm.push(3, 0);
        asm.call(4, 2, NO_REG, 3);
        asm.ret(4);

        vec![
            ConstSpec::Function {
                name: "down".into(),
                entry: down,
                num_regs: 5,
                args_reg: 0,
                this_reg: NO_REG,
                params: vec!["n".into()],
                kind: FuncKind::Plain,
            },
            ConstSpec::Integer(20_000),
        ]
    })
    .unwrap();
    assert_eq!(as_int(result), 0);
}

#[test]
fn test_tail_call_reuses_stack() {
    let (_inst, ctx) = instance();
    // loop(n) tail-calls itself until n == 0, then returns 99. The
    // stack must not grow with n.
    let result = run_program(&ctx, 8, |asm| {
        asm.load_const(0, 0);
        asm.new_array8(1, 0);
        asm.load_const(2, 1);
        asm.push(1, 2);
        asm.call(3, 0, NO_REG, 1);
        asm.ret(3);

        let entry = asm.here() as u32;
        let recurse = asm.label();
        asm.jump_cond(recurse, 0);
        asm.load_int8(1, 99);
        asm.ret(1);
        asm.bind(recurse);
        asm.load_int8(1, 1);
        asm.sub(0, 0, 1);
        asm.load_const(2, 0);
        asm.new_array8(3, 0);
        asm.push(3, 0);
        asm.tail_call(2, NO_REG, 3);

        vec![
            ConstSpec::Function {
                name: "loop".into(),
                entry,
                num_regs: 5,
                args_reg: 0,
                this_reg: NO_REG,
                params: vec!["n".into()],
                kind: FuncKind::Plain,
            },
            ConstSpec::Integer(50_000),
        ]
    })
    .unwrap();
    assert_eq!(as_int(result), 99);
}

// === Generators ===

#[test]
fn test_generator_yield_resume_from_native() {
    let (_inst, ctx) = instance();
    // gen() yields 1 then 2 then finishes.
    let module = common::load_program(&ctx, 4, |asm| {
        asm.load_const(0, 0);
        asm.ret(0);

        let gen = asm.here() as u32;
        asm.load_int8(0, 1);
        asm.yield_(0);
        asm.load_int8(0, 2);
        asm.yield_(0);
        asm.load_void(0);
        asm.ret(0);

        vec![ConstSpec::Function {
            name: "gen".into(),
            entry: gen,
            num_regs: 2,
            args_reg: 0,
            this_reg: NO_REG,
            params: vec![],
            kind: FuncKind::GenInit,
        }]
    })
    .unwrap();

    let gen_fn = vela_rt::module::run_module(&ctx, module).unwrap();
    let empty = array::new_array(&ctx, 0).unwrap();

    // Calling the generator function instantiates an iterator.
    let iter = call_function(&ctx, gen_fn, ctx.void_val(), empty).unwrap();
    assert_eq!(ctx.type_of(iter), TypeTag::Iterator);

    assert_eq!(call_generator(&ctx, iter, ctx.void_val(), empty).unwrap().map(as_int), Some(1));
    assert_eq!(call_generator(&ctx, iter, ctx.void_val(), empty).unwrap().map(as_int), Some(2));
    assert_eq!(call_generator(&ctx, iter, ctx.void_val(), empty).unwrap(), None);
    // Past the end it stays done.
    assert_eq!(call_generator(&ctx, iter, ctx.void_val(), empty).unwrap(), None);
}

#[test]
fn test_generator_receives_resume_value() {
    let (_inst, ctx) = instance();
    // echo: first yield hands out 1, the resumed value comes back in
    // the yield register and is returned via the second yield.
    let module = common::load_program(&ctx, 4, |asm| {
        asm.load_const(0, 0);
        asm.ret(0);

        let gen = asm.here() as u32;
        asm.load_int8(0, 1);
        asm.yield_(0);
        asm.yield_(0);
        asm.load_void(0);
        asm.ret(0);

        vec![ConstSpec::Function {
            name: "echo".into(),
            entry: gen,
            num_regs: 2,
            args_reg: 0,
            this_reg: NO_REG,
            params: vec![],
            kind: FuncKind::GenInit,
        }]
    })
    .unwrap();

    let gen_fn = vela_rt::module::run_module(&ctx, module).unwrap();
    let empty = array::new_array(&ctx, 0).unwrap();
    let iter = call_function(&ctx, gen_fn, ctx.void_val(), empty).unwrap();

    assert_eq!(call_generator(&ctx, iter, ctx.void_val(), empty).unwrap().map(as_int), Some(1));

    let sent = array::new_array_from(&ctx, &[Value::from_small_int(42)]).unwrap();
    assert_eq!(call_generator(&ctx, iter, ctx.void_val(), sent).unwrap().map(as_int), Some(42));
}

#[test]
fn test_generator_driven_by_bytecode_call() {
    let (_inst, ctx) = instance();
    // main instantiates gen and pulls two values through CALL.
    let result = run_program(&ctx, 8, |asm| {
        asm.load_const(0, 0);
        asm.new_array8(1, 0);
        asm.call(2, 0, NO_REG, 1); // iterator
        asm.call(3, 2, NO_REG, 1); // first yield -> 10
        asm.call(4, 2, NO_REG, 1); // second yield -> 20
        asm.add(5, 3, 4);
        asm.ret(5);

        let gen = asm.here() as u32;
        asm.load_int8(0, 10);
        asm.yield_(0);
        asm.load_int8(0, 20);
        asm.yield_(0);
        asm.load_void(0);
        asm.ret(0);

        vec![ConstSpec::Function {
            name: "gen".into(),
            entry: gen,
            num_regs: 2,
            args_reg: 0,
            this_reg: NO_REG,
            params: vec![],
            kind: FuncKind::GenInit,
        }]
    })
    .unwrap();
    assert_eq!(as_int(result), 30);
}

#[test]
fn test_yield_outside_generator_raises() {
    let (_inst, ctx) = instance();
    let err = run_program(&ctx, 4, |asm| {
        asm.load_int8(0, 1);
        asm.yield_(0);
        asm.ret(0);
        vec![]
    });
    assert!(err.is_err());
    assert_eq!(ctx.exception_kind(), Some(ExcKind::TypeError));
    ctx.clear_exception();
}

// === Generic access instructions ===

#[test]
fn test_get_opt_is_total() {
    let (_inst, ctx) = instance();
    // GET.PROP8.OPT on a small integer yields void.
    let result = run_program(&ctx, 4, |asm| {
        asm.load_int8(0, 5);
        asm.get_prop8_opt(1, 0, 0);
        asm.ret(1);
        vec![ConstSpec::String("anything".into())]
    })
    .unwrap();
    assert_eq!(result, ctx.void_val());

    // GET.ELEM8.OPT out of range yields void; GET.ELEM8 raises.
    let result = run_program(&ctx, 4, |asm| {
        asm.new_array8(0, 2);
        asm.get_elem8_opt(1, 0, 7);
        asm.ret(1);
        vec![]
    })
    .unwrap();
    assert_eq!(result, ctx.void_val());

    let err = run_program(&ctx, 4, |asm| {
        asm.new_array8(0, 2);
        asm.get_elem8(1, 0, 7);
        asm.ret(1);
        vec![]
    });
    assert!(err.is_err());
    assert_eq!(ctx.exception_kind(), Some(ExcKind::OutOfRange));
    ctx.clear_exception();
}

#[test]
fn test_get_elem_on_string_and_range() {
    let (_inst, ctx) = instance();
    let result = run_program(&ctx, 6, |asm| {
        asm.load_const(0, 0);
        asm.get_elem8(1, 0, 1); // "a"
        asm.get_range(2, 0, NO_REG, NO_REG); // whole string copy
        asm.ret(2);
        vec![ConstSpec::String("bad".into())]
    })
    .unwrap();
    assert_eq!(string::rust_string(&ctx, result).unwrap(), "bad");
}

#[test]
fn test_push_ex_expands_iterables() {
    let (_inst, ctx) = instance();
    let result = run_program(&ctx, 6, |asm| {
        asm.new_array8(0, 0);
        asm.new_array8(1, 0);
        asm.load_int8(2, 1);
        asm.push(1, 2);
        asm.load_int8(2, 2);
        asm.push(1, 2);
        asm.push_ex(0, 1); // [1, 2]
        asm.load_const(3, 0);
        asm.push_ex(0, 3); // + "xy" as two one-char strings
        asm.ret(0);
        vec![ConstSpec::String("xy".into())]
    })
    .unwrap();
    assert_eq!(array::len(&ctx, result).unwrap(), 4);
    assert_eq!(as_int(array::read(&ctx, result, 0).unwrap()), 1);
    assert_eq!(as_int(array::read(&ctx, result, 1).unwrap()), 2);
    let x = array::read(&ctx, result, 2).unwrap();
    assert_eq!(string::rust_string(&ctx, x).unwrap(), "x");
}

#[test]
fn test_type_instruction() {
    let (_inst, ctx) = instance();
    let result = run_program(&ctx, 4, |asm| {
        asm.new_array8(0, 0);
        asm.type_of(1, 0);
        asm.ret(1);
        vec![]
    })
    .unwrap();
    assert_eq!(string::rust_string(&ctx, result).unwrap(), "array");
}

#[test]
fn test_object_instructions() {
    let (_inst, ctx) = instance();
    // Build {k: 5}, check HAS, DEL, and SET/GET round trip.
    let result = run_program(&ctx, 8, |asm| {
        asm.new_obj_default(0);
        asm.load_int8(1, 5);
        asm.set_prop8(0, 0, 1);
        asm.has_sh_prop8(2, 0, 0); // true
        asm.get_prop8(3, 0, 0); // 5
        asm.load_const(4, 0);
        asm.del(0, 4);
        asm.has_sh_prop8(5, 0, 0); // false
        // result = has_before(1/0)*100 + value*10 + has_after(1/0)
        asm.new_array8(6, 0);
        asm.push(6, 2);
        asm.push(6, 3);
        asm.push(6, 5);
        asm.ret(6);
        vec![ConstSpec::String("k".into())]
    })
    .unwrap();
    assert_eq!(array::read(&ctx, result, 0).unwrap(), ctx.true_val());
    assert_eq!(as_int(array::read(&ctx, result, 1).unwrap()), 5);
    assert_eq!(array::read(&ctx, result, 2).unwrap(), ctx.false_val());
}

#[test]
fn test_bitwise_instructions() {
    let (_inst, ctx) = instance();
    let result = run_program(&ctx, 8, |asm| {
        asm.load_int8(0, 12);
        asm.load_int8(1, 10);
        asm.and(2, 0, 1); // 8
        asm.or(3, 0, 1); // 14
        asm.xor(4, 0, 1); // 6
        asm.load_int8(5, 2);
        asm.shl(6, 0, 5); // 48
        asm.new_array8(7, 0);
        asm.push(7, 2);
        asm.push(7, 3);
        asm.push(7, 4);
        asm.push(7, 6);
        asm.ret(7);
        vec![]
    })
    .unwrap();
    let got: Vec<i64> = (0..4).map(|i| as_int(array::read(&ctx, result, i).unwrap())).collect();
    assert_eq!(got, vec![8, 14, 6, 48]);
}
