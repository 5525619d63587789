// Integration tests for the Slate virtual machine.
//
// These tests assemble complete bytecode programs and execute them in Test
// context, checking results and error records. Coverage:
// - Arithmetic promotion ladder and overflow into BigInt
// - Stack shuffles, locals, globals, upvalues
// - Construction opcodes and indexing
// - Property resolution and CALL dispatch over every callable tag
// - Error taxonomy and context policies
// - Reference-count discipline observed through Rc strong counts

use num_bigint::BigInt;
use slate::asm::assemble;
use slate::class::{define_adt, AdtCaseKind, Class};
use slate::errors::{ErrorKind, SlateError};
use slate::value::{values_equal, Value};
use slate::vm::{Context, FloatWidth, Vm, VmOptions};
use std::rc::Rc;

fn test_vm() -> Vm {
    let mut vm = Vm::new();
    vm.set_context(Context::Test);
    vm
}

fn run_in(vm: &mut Vm, source: &str) -> Result<Value, SlateError> {
    let program = assemble(source).expect("program should assemble");
    let entry = vm.load_program(program).expect("program should load");
    vm.execute(entry)
}

fn run(source: &str) -> Result<Value, SlateError> {
    run_in(&mut test_vm(), source)
}

fn run_ok(source: &str) -> Value {
    run(source).expect("program should run")
}

// === Scenario S1: integer overflow promotion ===

#[test]
fn int_addition_overflow_promotes_to_bigint() {
    let result = run_ok(
        r#"
        .const 2147483647
        PUSH_CONSTANT 0
        PUSH_CONSTANT 0
        ADD
        SET_RESULT
        HALT
        "#,
    );
    match result {
        Value::BigInt(n) => assert_eq!(*n, BigInt::from(4294967294u64)),
        other => panic!("expected BigInt, got {:?}", other),
    }
}

#[test]
fn int_arithmetic_stays_int_when_in_range() {
    assert!(matches!(
        run_ok(".const 20\n.const 22\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nADD\nSET_RESULT\nHALT"),
        Value::Int(42)
    ));
}

#[test]
fn subtract_multiply_negate_overflow_promote() {
    // i32::MIN - 1
    match run_ok(".const -2147483648\n.const 1\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nSUBTRACT\nSET_RESULT\nHALT")
    {
        Value::BigInt(n) => assert_eq!(*n, BigInt::from(i32::MIN as i64 - 1)),
        other => panic!("expected BigInt, got {:?}", other),
    }
    // 65536 * 65536
    match run_ok(".const 65536\nPUSH_CONSTANT 0\nPUSH_CONSTANT 0\nMULTIPLY\nSET_RESULT\nHALT") {
        Value::BigInt(n) => assert_eq!(*n, BigInt::from(65536u64 * 65536)),
        other => panic!("expected BigInt, got {:?}", other),
    }
    // -(i32::MIN)
    match run_ok(".const -2147483648\nPUSH_CONSTANT 0\nNEGATE\nSET_RESULT\nHALT") {
        Value::BigInt(n) => assert_eq!(*n, BigInt::from(2147483648u64)),
        other => panic!("expected BigInt, got {:?}", other),
    }
}

#[test]
fn increment_and_decrement_saturate_into_bigint() {
    match run_ok(".const 2147483647\nPUSH_CONSTANT 0\nINCREMENT\nSET_RESULT\nHALT") {
        Value::BigInt(n) => assert_eq!(*n, BigInt::from(2147483648u64)),
        other => panic!("expected BigInt, got {:?}", other),
    }
    match run_ok(".const -2147483648\nPUSH_CONSTANT 0\nDECREMENT\nSET_RESULT\nHALT") {
        Value::BigInt(n) => assert_eq!(*n, BigInt::from(i32::MIN as i64 - 1)),
        other => panic!("expected BigInt, got {:?}", other),
    }
}

#[test]
fn bigint_combinations_stay_bigint() {
    let result = run_ok(".const 2b\n.const 3b\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nMULTIPLY\nSET_RESULT\nHALT");
    match result {
        Value::BigInt(n) => assert_eq!(*n, BigInt::from(6)),
        other => panic!("expected BigInt, got {:?}", other),
    }
}

#[test]
fn float_involvement_promotes_to_widest_float() {
    assert!(matches!(
        run_ok(".const 1\n.const 2.5\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nADD\nSET_RESULT\nHALT"),
        Value::Float64(f) if f == 3.5
    ));
    assert!(matches!(
        run_ok(".const 1\n.const 2.5f32\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nADD\nSET_RESULT\nHALT"),
        Value::Float32(f) if f == 3.5
    ));
    assert!(matches!(
        run_ok(".const 1.5f32\n.const 2.0\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nADD\nSET_RESULT\nHALT"),
        Value::Float64(f) if f == 3.5
    ));
}

// === Scenario S2: division by zero ===

#[test]
fn division_by_zero_is_an_arithmetic_error() {
    let err = run(".const 10\n.const 0\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nDIVIDE\nHALT")
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Arithmetic);
    assert_eq!(err.message, "Division by zero");
}

#[test]
fn modulo_by_zero_is_an_arithmetic_error() {
    let err = run(".const 10\n.const 0\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nMOD\nHALT")
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Arithmetic);
    assert!(err.message.contains("Modulo by zero"));
}

#[test]
fn integer_division_produces_a_float() {
    assert!(matches!(
        run_ok(".const 7\n.const 2\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nDIVIDE\nSET_RESULT\nHALT"),
        Value::Float64(f) if f == 3.5
    ));

    let mut vm = Vm::with_options(VmOptions::default().with_default_float(FloatWidth::F32));
    vm.set_context(Context::Test);
    let result = run_in(
        &mut vm,
        ".const 7\n.const 2\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nDIVIDE\nSET_RESULT\nHALT",
    )
    .unwrap();
    assert!(matches!(result, Value::Float32(f) if f == 3.5));
}

#[test]
fn floor_division_rounds_toward_negative_infinity() {
    assert!(matches!(
        run_ok(".const -7\n.const 2\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nFLOOR_DIV\nSET_RESULT\nHALT"),
        Value::Int(-4)
    ));
    assert!(matches!(
        run_ok(".const 7\n.const 2\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nFLOOR_DIV\nSET_RESULT\nHALT"),
        Value::Int(3)
    ));
}

#[test]
fn power_always_produces_a_float() {
    assert!(matches!(
        run_ok(".const 2\n.const 10\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nPOWER\nSET_RESULT\nHALT"),
        Value::Float64(f) if f == 1024.0
    ));
}

// === Bitwise family ===

#[test]
fn bitwise_ops_coerce_to_int32() {
    assert!(matches!(
        run_ok(".const 6\n.const 3\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nBITWISE_AND\nSET_RESULT\nHALT"),
        Value::Int(2)
    ));
    assert!(matches!(
        run_ok(".const 6.9\n.const 3\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nBITWISE_OR\nSET_RESULT\nHALT"),
        Value::Int(7)
    ));
    assert!(matches!(
        run_ok(".const 0\nPUSH_CONSTANT 0\nBITWISE_NOT\nSET_RESULT\nHALT"),
        Value::Int(-1)
    ));
}

#[test]
fn shift_amount_is_taken_mod_32() {
    assert!(matches!(
        run_ok(".const 1\n.const 33\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nLEFT_SHIFT\nSET_RESULT\nHALT"),
        Value::Int(2)
    ));
    assert!(matches!(
        run_ok(".const -8\n.const 1\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nRIGHT_SHIFT\nSET_RESULT\nHALT"),
        Value::Int(-4)
    ));
    assert!(matches!(
        run_ok(".const -1\n.const 28\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nLOGICAL_RIGHT_SHIFT\nSET_RESULT\nHALT"),
        Value::Int(15)
    ));
}

#[test]
fn negative_shift_is_a_range_error() {
    let err = run(".const 1\n.const -1\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nLEFT_SHIFT\nHALT")
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Range);
}

// === Scenario S3: closure capture ===

#[test]
fn closure_captures_enclosing_local() {
    let result = run_ok(
        r#"
        .fn adder arity=0 locals=0 upvalues=local:0
        .const 1
        GET_UPVALUE 0
        PUSH_CONSTANT 0
        ADD
        RETURN
        .end
        .const 41
        .const 0
        PUSH_CONSTANT 0      ; local 0 = 41
        CLOSURE 1
        CALL 0
        SET_RESULT
        HALT
        "#,
    );
    assert!(matches!(result, Value::Int(42)));
}

#[test]
fn upvalue_capture_happens_at_creation_time() {
    // The closure reads 41 even though local 0 is overwritten afterwards.
    let result = run_ok(
        r#"
        .fn reader arity=0 locals=0 upvalues=local:0
        GET_UPVALUE 0
        RETURN
        .end
        .const 41
        .const 0
        .const 99
        PUSH_CONSTANT 0
        CLOSURE 1
        PUSH_CONSTANT 2
        SET_LOCAL 0
        POP
        CALL 0
        SET_RESULT
        HALT
        "#,
    );
    assert!(matches!(result, Value::Int(41)));
}

#[test]
fn set_upvalue_is_visible_to_later_reads() {
    // Each call bumps the closure's own upvalue: 10 -> 11 -> 12.
    let result = run_ok(
        r#"
        .fn bump arity=0 locals=0 upvalues=local:0
        .const 1
        GET_UPVALUE 0
        PUSH_CONSTANT 0
        ADD
        SET_UPVALUE 0
        RETURN
        .end
        .const 10
        .const 0
        PUSH_CONSTANT 0
        CLOSURE 1
        DUP
        CALL 0
        POP
        CALL 0
        SET_RESULT
        HALT
        "#,
    );
    assert!(matches!(result, Value::Int(12)));
}

#[test]
fn closures_capture_enclosing_upvalues_transitively() {
    let result = run_ok(
        r#"
        .fn inner arity=0 locals=0 upvalues=up:0
        GET_UPVALUE 0
        RETURN
        .end
        .fn outer arity=0 locals=0 upvalues=local:0
        .const 0
        CLOSURE 0
        CALL 0
        RETURN
        .end
        .const 7
        .const 1
        PUSH_CONSTANT 0
        CLOSURE 1
        CALL 0
        SET_RESULT
        HALT
        "#,
    );
    assert!(matches!(result, Value::Int(7)));
}

#[test]
fn call_arity_mismatch_is_a_type_error() {
    let err = run(
        r#"
        .fn f arity=2 locals=2
        PUSH_NULL
        RETURN
        .end
        .const 0
        CLOSURE 0
        CALL 0
        HALT
        "#,
    )
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);
    assert!(err.message.contains("expects 2 arguments"));
}

#[test]
fn returning_from_the_entry_frame_halts_with_the_value() {
    let result = run(".const 9\nPUSH_CONSTANT 0\nRETURN").unwrap();
    assert!(matches!(result, Value::Int(9)));
}

// === Scenario S4: property chain and bound methods ===

#[test]
fn get_property_on_object_wraps_natives_into_bound_methods() {
    let result = run_ok(
        r#"
        .const "toString"
        BUILD_OBJECT 0
        PUSH_CONSTANT 0
        GET_PROPERTY
        SET_RESULT
        HALT
        "#,
    );
    match result {
        Value::BoundMethod(bound) => {
            assert_eq!(bound.name, "toString");
            assert!(matches!(bound.receiver, Value::Object(_)));
        }
        other => panic!("expected bound method, got {:?}", other),
    }
}

#[test]
fn calling_a_bound_method_passes_the_receiver() {
    let result = run_ok(
        r#"
        .const "a"
        .const 1
        .const "toString"
        PUSH_CONSTANT 0
        PUSH_CONSTANT 1
        BUILD_OBJECT 1
        PUSH_CONSTANT 2
        GET_PROPERTY
        CALL 0
        SET_RESULT
        HALT
        "#,
    );
    match result {
        Value::Str(s) => assert_eq!(s.as_ref(), "{a: 1}"),
        other => panic!("expected string, got {:?}", other),
    }
}

#[test]
fn missing_properties_yield_undefined_not_an_error() {
    let result = run_ok(
        r#"
        .const "missing"
        BUILD_OBJECT 0
        PUSH_CONSTANT 0
        GET_PROPERTY
        SET_RESULT
        HALT
        "#,
    );
    assert!(matches!(result, Value::Undefined));
}

#[test]
fn own_properties_shadow_the_class_chain() {
    let result = run_ok(
        r#"
        .const "x"
        .const 5
        PUSH_CONSTANT 0
        PUSH_CONSTANT 1
        BUILD_OBJECT 1
        PUSH_CONSTANT 0
        GET_PROPERTY
        SET_RESULT
        HALT
        "#,
    );
    assert!(matches!(result, Value::Int(5)));
}

#[test]
fn primitive_values_dispatch_through_core_classes() {
    let result = run_ok(
        r#"
        .const "length"
        .const "hello"
        PUSH_CONSTANT 1
        PUSH_CONSTANT 0
        GET_PROPERTY
        CALL 0
        SET_RESULT
        HALT
        "#,
    );
    assert!(matches!(result, Value::Int(5)));
}

#[test]
fn set_property_stores_and_returns_the_value() {
    let result = run_ok(
        r#"
        .const "k"
        .const 3
        BUILD_OBJECT 0
        PUSH_CONSTANT 0
        PUSH_CONSTANT 1
        SET_PROPERTY
        SET_RESULT
        HALT
        "#,
    );
    assert!(matches!(result, Value::Int(3)));
}

#[test]
fn set_property_rejects_undefined() {
    let err = run(
        r#"
        .const "k"
        BUILD_OBJECT 0
        PUSH_CONSTANT 0
        PUSH_UNDEFINED
        SET_PROPERTY
        HALT
        "#,
    )
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);
}

// === Scenario S5: falsy OR keeps the live operand ===

#[test]
fn or_returns_right_operand_when_left_is_falsy() {
    let mut vm = test_vm();
    let program = assemble(
        r#"
        .const "x"
        PUSH_NULL
        PUSH_CONSTANT 0
        OR
        SET_RESULT
        HALT
        "#,
    )
    .unwrap();
    let entry = vm.load_program(program).unwrap();
    let constant = match entry.chunk.constant(0) {
        Some(Value::Str(s)) => Rc::clone(s),
        other => panic!("expected string constant, got {:?}", other),
    };

    let before = Rc::strong_count(&constant);
    let result = vm.execute(entry).unwrap();
    match result {
        Value::Str(ref s) => {
            assert_eq!(s.as_ref(), "x");
            // The result is the same retained payload, not a copy. Two new
            // counts: the returned value and the result register.
            assert!(Rc::ptr_eq(s, &constant));
            assert_eq!(Rc::strong_count(&constant), before + 2);
        }
        other => panic!("expected string, got {:?}", other),
    }
}

#[test]
fn and_or_null_coalesce_value_semantics() {
    assert!(matches!(
        run_ok(".const 1\n.const 2\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nAND\nSET_RESULT\nHALT"),
        Value::Int(2)
    ));
    assert!(matches!(
        run_ok(".const 0\n.const 2\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nAND\nSET_RESULT\nHALT"),
        Value::Int(0)
    ));
    // false is falsy but not null: NULL_COALESCE keeps it.
    assert!(matches!(
        run_ok(".const 7\nPUSH_FALSE\nPUSH_CONSTANT 0\nNULL_COALESCE\nSET_RESULT\nHALT"),
        Value::Bool(false)
    ));
    assert!(matches!(
        run_ok(".const 7\nPUSH_UNDEFINED\nPUSH_CONSTANT 0\nNULL_COALESCE\nSET_RESULT\nHALT"),
        Value::Int(7)
    ));
}

// === Scenario S6: range construction ===

#[test]
fn default_step_range_auto_reverses() {
    let result = run_ok(
        ".const 5\n.const 1\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nPUSH_CONSTANT 1\nBUILD_RANGE 0\nSET_RESULT\nHALT",
    );
    match result {
        Value::Range(range) => {
            assert!(matches!(range.start, Value::Int(5)));
            assert!(matches!(range.end, Value::Int(1)));
            assert!(matches!(range.step, Value::Int(-1)));
            assert!(!range.exclusive);
        }
        other => panic!("expected range, got {:?}", other),
    }
}

#[test]
fn explicit_step_with_wrong_direction_is_a_range_error() {
    let err = run(
        ".const 5\n.const 1\n.const 2\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nPUSH_CONSTANT 2\nBUILD_RANGE 0\nHALT",
    )
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Range);
}

#[test]
fn zero_step_is_a_range_error() {
    let err = run(
        ".const 1\n.const 5\n.const 0\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nPUSH_CONSTANT 2\nBUILD_RANGE 0\nHALT",
    )
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Range);
}

#[test]
fn exclusive_flag_is_carried() {
    let result = run_ok(
        ".const 1\n.const 5\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nPUSH_CONSTANT 0\nBUILD_RANGE 1\nSET_RESULT\nHALT",
    );
    match result {
        Value::Range(range) => assert!(range.exclusive),
        other => panic!("expected range, got {:?}", other),
    }
}

// === Stack shuffles ===

#[test]
fn stack_shuffles_rearrange_operands() {
    // SWAP: 1, 2 -> 2, 1; SUBTRACT gives 2 - 1.
    assert!(matches!(
        run_ok(".const 1\n.const 2\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nSWAP\nSUBTRACT\nSET_RESULT\nHALT"),
        Value::Int(1)
    ));
    // OVER: 5, 3 -> 5, 3, 5.
    assert!(matches!(
        run_ok(".const 5\n.const 3\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nOVER\nADD\nADD\nSET_RESULT\nHALT"),
        Value::Int(13)
    ));
    // NIP: 9, 4 -> 4.
    assert!(matches!(
        run_ok(".const 9\n.const 4\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nNIP\nSET_RESULT\nHALT"),
        Value::Int(4)
    ));
    // ROT: 1, 2, 3 -> 2, 3, 1; top is now 1.
    assert!(matches!(
        run_ok(".const 1\n.const 2\n.const 3\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nPUSH_CONSTANT 2\nROT\nSET_RESULT\nHALT"),
        Value::Int(1)
    ));
}

#[test]
fn dup_then_pop_is_a_no_op() {
    assert!(matches!(
        run_ok(".const 8\nPUSH_CONSTANT 0\nDUP\nPOP\nSET_RESULT\nHALT"),
        Value::Int(8)
    ));
}

#[test]
fn swap_on_a_single_value_underflows() {
    let err = run(".const 1\nPUSH_CONSTANT 0\nSWAP\nHALT").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Internal);
    assert!(err.message.contains("stack underflow"));
}

#[test]
fn pop_n_preserve_top_keeps_the_top() {
    let result = run_ok(
        ".const 1\n.const 2\n.const 3\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nPUSH_CONSTANT 2\nPOP_N_PRESERVE_TOP 2\nSET_RESULT\nHALT",
    );
    assert!(matches!(result, Value::Int(3)));
}

// === Locals & control flow ===

#[test]
fn set_local_does_not_pop_the_rvalue() {
    // Chained assignments observe the rvalue: local 0 and the top both
    // become 2, so the ADD sees 2 + 2.
    let result = run_ok(
        ".const 1\n.const 2\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nSET_LOCAL 0\nGET_LOCAL 0\nADD\nSET_RESULT\nHALT",
    );
    assert!(matches!(result, Value::Int(4)));
}

#[test]
fn jump_if_false_selects_the_else_branch() {
    let result = run_ok(
        r#"
        .const "then"
        .const "else"
        PUSH_FALSE
        JUMP_IF_FALSE else_branch
        PUSH_CONSTANT 0
        JUMP done
        else_branch:
        PUSH_CONSTANT 1
        done:
        SET_RESULT
        HALT
        "#,
    );
    match result {
        Value::Str(s) => assert_eq!(s.as_ref(), "else"),
        other => panic!("expected string, got {:?}", other),
    }
}

#[test]
fn loop_counts_down_with_backward_jump() {
    // local 0 starts at 3 and decrements until falsy.
    let result = run_ok(
        r#"
        .const 3
        PUSH_CONSTANT 0
        top:
        GET_LOCAL 0
        JUMP_IF_FALSE done
        GET_LOCAL 0
        DECREMENT
        SET_LOCAL 0
        POP
        LOOP top
        done:
        GET_LOCAL 0
        SET_RESULT
        HALT
        "#,
    );
    assert!(matches!(result, Value::Int(0)));
}

#[test]
fn backward_jumps_use_twos_complement_offsets() {
    // JUMP 2 lands on the trailing JUMP -5, which wraps back to
    // SET_RESULT; the stack is untouched by the jumps themselves.
    let result = run_ok(
        r#"
        PUSH_TRUE
        JUMP 2
        SET_RESULT
        HALT
        JUMP -5
        "#,
    );
    assert!(matches!(result, Value::Bool(true)));
}

// === Globals ===

#[test]
fn define_get_set_global_roundtrip() {
    let result = run_ok(
        r#"
        .const "x"
        .const 1
        .const 2
        PUSH_CONSTANT 1
        DEFINE_GLOBAL 0 0
        PUSH_CONSTANT 2
        SET_GLOBAL 0
        POP
        GET_GLOBAL 0
        SET_RESULT
        HALT
        "#,
    );
    assert!(matches!(result, Value::Int(2)));
}

#[test]
fn duplicate_definition_is_a_reference_error_in_script_context() {
    let source = r#"
        .const "x"
        .const 1
        PUSH_CONSTANT 1
        DEFINE_GLOBAL 0 0
        PUSH_CONSTANT 1
        DEFINE_GLOBAL 0 0
        HALT
    "#;
    let err = run(source).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Reference);
    assert!(err.message.contains("already defined"));
}

#[test]
fn interactive_context_allows_redefinition() {
    let mut vm = Vm::new();
    vm.set_context(Context::Interactive);
    let first = r#"
        .const "x"
        .const 1
        PUSH_CONSTANT 1
        DEFINE_GLOBAL 0 0
        HALT
    "#;
    run_in(&mut vm, first).unwrap();
    let second = r#"
        .const "x"
        .const 5
        PUSH_CONSTANT 1
        DEFINE_GLOBAL 0 0
        GET_GLOBAL 0
        SET_RESULT
        HALT
    "#;
    let result = run_in(&mut vm, second).unwrap();
    assert!(matches!(result, Value::Int(5)));
}

#[test]
fn assigning_an_immutable_global_is_a_type_error() {
    let err = run(
        r#"
        .const "x"
        .const 1
        PUSH_CONSTANT 1
        DEFINE_GLOBAL 0 1
        PUSH_CONSTANT 1
        SET_GLOBAL 0
        HALT
        "#,
    )
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);
    assert!(err.message.contains("immutable"));
}

#[test]
fn reading_or_writing_an_undefined_global_is_a_reference_error() {
    let err = run(".const \"nope\"\nGET_GLOBAL 0\nHALT").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Reference);

    let err = run(".const \"nope\"\n.const 1\nPUSH_CONSTANT 1\nSET_GLOBAL 0\nHALT").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Reference);
}

#[test]
fn storing_undefined_in_a_global_is_a_type_error() {
    let err = run(".const \"x\"\nPUSH_UNDEFINED\nDEFINE_GLOBAL 0 0\nHALT").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);
}

#[test]
fn module_definitions_stay_in_the_module_namespace() {
    let mut vm = test_vm();
    vm.define_global("shared", Value::Int(1));
    vm.push_module("mod");

    // The module defines x and can still read through to VM globals.
    let result = run_in(
        &mut vm,
        r#"
        .const "x"
        .const "shared"
        .const 9
        PUSH_CONSTANT 2
        DEFINE_GLOBAL 0 0
        GET_GLOBAL 1
        SET_RESULT
        HALT
        "#,
    )
    .unwrap();
    assert!(matches!(result, Value::Int(1)));

    let module = vm.pop_module().unwrap();
    assert_eq!(module.name, "mod");
    // The module-local definition never reached the VM namespace.
    assert!(vm.global("x").is_none());
}

// === Construction & indexing ===

#[test]
fn build_array_preserves_source_order() {
    let result = run_ok(
        ".const 1\n.const 2\n.const 3\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nPUSH_CONSTANT 2\nBUILD_ARRAY 3\nSET_RESULT\nHALT",
    );
    match result {
        Value::Array(elements) => {
            let elements = elements.borrow();
            assert_eq!(elements.len(), 3);
            for (index, expected) in [1, 2, 3].iter().enumerate() {
                assert!(values_equal(&elements[index], &Value::Int(*expected)));
            }
        }
        other => panic!("expected array, got {:?}", other),
    }
}

#[test]
fn build_array_rejects_undefined_elements() {
    let err = run("PUSH_UNDEFINED\nBUILD_ARRAY 1\nHALT").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);
}

#[test]
fn build_object_reads_back_every_pair() {
    let result = run_ok(
        r#"
        .const "a"
        .const 1
        .const "b"
        .const 2
        PUSH_CONSTANT 0
        PUSH_CONSTANT 1
        PUSH_CONSTANT 2
        PUSH_CONSTANT 3
        BUILD_OBJECT 2
        DUP
        PUSH_CONSTANT 0
        GET_PROPERTY
        SWAP
        PUSH_CONSTANT 2
        GET_PROPERTY
        ADD
        SET_RESULT
        HALT
        "#,
    );
    assert!(matches!(result, Value::Int(3)));
}

#[test]
fn build_object_requires_string_keys() {
    let err = run(".const 1\nPUSH_CONSTANT 0\nPUSH_CONSTANT 0\nBUILD_OBJECT 1\nHALT").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);
}

#[test]
fn array_indexing_is_bounds_checked() {
    assert!(matches!(
        run_ok(".const 10\n.const 0\nPUSH_CONSTANT 0\nBUILD_ARRAY 1\nPUSH_CONSTANT 1\nGET_INDEX\nSET_RESULT\nHALT"),
        Value::Int(10)
    ));
    let err = run(".const 10\n.const 5\nPUSH_CONSTANT 0\nBUILD_ARRAY 1\nPUSH_CONSTANT 1\nGET_INDEX\nHALT")
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Range);
}

#[test]
fn set_index_stores_and_returns_the_value() {
    let result = run_ok(
        ".const 1\n.const 0\n.const 42\nPUSH_CONSTANT 0\nBUILD_ARRAY 1\nPUSH_CONSTANT 1\nPUSH_CONSTANT 2\nSET_INDEX\nSET_RESULT\nHALT",
    );
    assert!(matches!(result, Value::Int(42)));
}

#[test]
fn string_indexing_returns_one_char_strings_or_null() {
    match run_ok(".const \"abc\"\n.const 1\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nGET_INDEX\nSET_RESULT\nHALT") {
        Value::Str(s) => assert_eq!(s.as_ref(), "b"),
        other => panic!("expected string, got {:?}", other),
    }
    assert!(matches!(
        run_ok(".const \"abc\"\n.const 9\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nGET_INDEX\nSET_RESULT\nHALT"),
        Value::Null
    ));
}

#[test]
fn empty_array_concat_retains_the_element_exactly_once() {
    let mut vm = test_vm();
    let program = assemble(
        r#"
        .const "x"
        BUILD_ARRAY 0
        PUSH_CONSTANT 0
        BUILD_ARRAY 1
        ADD
        SET_RESULT
        HALT
        "#,
    )
    .unwrap();
    let entry = vm.load_program(program).unwrap();
    let constant = match entry.chunk.constant(0) {
        Some(Value::Str(s)) => Rc::clone(s),
        other => panic!("expected string constant, got {:?}", other),
    };
    let before = Rc::strong_count(&constant);

    let result = vm.execute(entry).unwrap();
    match result {
        Value::Array(elements) => {
            let elements = elements.borrow();
            assert_eq!(elements.len(), 1);
            match &elements[0] {
                Value::Str(s) => assert!(Rc::ptr_eq(s, &constant)),
                other => panic!("expected string element, got {:?}", other),
            }
        }
        other => panic!("expected array, got {:?}", other),
    }
    // Exactly one new strong count: the element inside the result array.
    assert_eq!(Rc::strong_count(&constant), before + 1);
}

// === Equality & comparison ===

#[test]
fn equality_spans_numeric_variants() {
    assert!(matches!(
        run_ok(".const 1\n.const 1.0\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nEQUAL\nSET_RESULT\nHALT"),
        Value::Bool(true)
    ));
    assert!(matches!(
        run_ok(".const \"a\"\n.const \"b\"\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nNOT_EQUAL\nSET_RESULT\nHALT"),
        Value::Bool(true)
    ));
}

#[test]
fn string_ordering_is_bytewise() {
    assert!(matches!(
        run_ok(".const \"abc\"\n.const \"abd\"\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nLESS\nSET_RESULT\nHALT"),
        Value::Bool(true)
    ));
}

#[test]
fn ordering_mixed_tags_is_a_type_error() {
    let err = run(".const 1\n.const \"a\"\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nLESS\nHALT")
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);
}

#[test]
fn not_pushes_the_boolean_of_falsiness() {
    assert!(matches!(
        run_ok(".const \"\"\nPUSH_CONSTANT 0\nNOT\nSET_RESULT\nHALT"),
        Value::Bool(true)
    ));
    assert!(matches!(
        run_ok(".const \"x\"\nPUSH_CONSTANT 0\nNOT\nSET_RESULT\nHALT"),
        Value::Bool(false)
    ));
}

// === CALL dispatch over non-function callables ===

#[test]
fn arrays_and_strings_are_callable_with_an_index() {
    assert!(matches!(
        run_ok(".const 7\n.const 0\nPUSH_CONSTANT 0\nBUILD_ARRAY 1\nPUSH_CONSTANT 1\nCALL 1\nSET_RESULT\nHALT"),
        Value::Int(7)
    ));
    // Out-of-bounds array call yields Null, unlike GET_INDEX.
    assert!(matches!(
        run_ok(".const 7\n.const 9\nPUSH_CONSTANT 0\nBUILD_ARRAY 1\nPUSH_CONSTANT 1\nCALL 1\nSET_RESULT\nHALT"),
        Value::Null
    ));
    match run_ok(".const \"hey\"\n.const 0\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nCALL 1\nSET_RESULT\nHALT") {
        Value::Str(s) => assert_eq!(s.as_ref(), "h"),
        other => panic!("expected string, got {:?}", other),
    }
}

#[test]
fn calling_a_non_callable_is_a_type_error() {
    let err = run(".const 3\nPUSH_CONSTANT 0\nCALL 0\nHALT").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);
    assert!(err.message.contains("not callable"));
}

#[test]
fn native_globals_are_callable() {
    let mut vm = test_vm();
    slate::builtins::install_globals(&mut vm);
    let result = run_in(
        &mut vm,
        ".const \"println\"\n.const \"hi\"\nGET_GLOBAL 0\nPUSH_CONSTANT 1\nCALL 1\nSET_RESULT\nHALT",
    )
    .unwrap();
    assert!(matches!(result, Value::Null));
}

// === Classes & ADTs ===

#[test]
fn classes_without_factories_are_not_callable() {
    let mut vm = test_vm();
    let class = Rc::new(Class::new("Marker"));
    vm.define_global("Marker", Value::Class(class));
    let err = run_in(&mut vm, ".const \"Marker\"\nGET_GLOBAL 0\nCALL 0\nHALT").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);
    assert!(err.message.contains("not callable"));
}

#[test]
fn adt_constructors_build_classed_instances() {
    let mut vm = test_vm();
    let (base, _constructors) = define_adt(
        "Option",
        vec![
            ("Some".to_string(), AdtCaseKind::Tuple, vec!["value".to_string()]),
            ("None".to_string(), AdtCaseKind::Singleton, vec![]),
        ],
    );
    vm.define_global("Option", Value::Class(base));

    let result = run_in(
        &mut vm,
        r#"
        .const "Option"
        .const "Some"
        .const 5
        .const "value"
        GET_GLOBAL 0
        PUSH_CONSTANT 1
        GET_PROPERTY
        PUSH_CONSTANT 2
        CALL 1
        PUSH_CONSTANT 3
        GET_PROPERTY
        SET_RESULT
        HALT
        "#,
    )
    .unwrap();
    assert!(matches!(result, Value::Int(5)));
}

#[test]
fn adt_singletons_are_shared_instances() {
    let mut vm = test_vm();
    let (base, _constructors) = define_adt(
        "Option",
        vec![("None".to_string(), AdtCaseKind::Singleton, vec![])],
    );
    vm.define_global("Option", Value::Class(base));

    // Fetching the singleton twice yields the same instance.
    let result = run_in(
        &mut vm,
        r#"
        .const "Option"
        .const "None"
        GET_GLOBAL 0
        PUSH_CONSTANT 1
        GET_PROPERTY
        GET_GLOBAL 0
        PUSH_CONSTANT 1
        GET_PROPERTY
        EQUAL
        SET_RESULT
        HALT
        "#,
    )
    .unwrap();
    assert!(matches!(result, Value::Bool(true)));
}

#[test]
fn adt_arity_mismatch_is_a_type_error() {
    let mut vm = test_vm();
    let (base, _constructors) = define_adt(
        "Option",
        vec![("Some".to_string(), AdtCaseKind::Tuple, vec!["value".to_string()])],
    );
    vm.define_global("Option", Value::Class(base));

    let err = run_in(
        &mut vm,
        ".const \"Option\"\n.const \"Some\"\nGET_GLOBAL 0\nPUSH_CONSTANT 1\nGET_PROPERTY\nCALL 0\nHALT",
    )
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);
}

#[test]
fn class_statics_resolve_and_misses_yield_undefined() {
    let mut vm = test_vm();
    let class = Rc::new(Class::new("Config"));
    class.define_static("version", Value::Int(3));
    vm.define_global("Config", Value::Class(class));

    let result = run_in(
        &mut vm,
        ".const \"Config\"\n.const \"version\"\nGET_GLOBAL 0\nPUSH_CONSTANT 1\nGET_PROPERTY\nSET_RESULT\nHALT",
    )
    .unwrap();
    assert!(matches!(result, Value::Int(3)));

    let result = run_in(
        &mut vm,
        ".const \"Config\"\n.const \"missing\"\nGET_GLOBAL 0\nPUSH_CONSTANT 1\nGET_PROPERTY\nSET_RESULT\nHALT",
    )
    .unwrap();
    assert!(matches!(result, Value::Undefined));
}

// === Context policies & debug locations ===

#[test]
fn test_context_keeps_state_across_errors() {
    let mut vm = test_vm();
    run_in(
        &mut vm,
        ".const \"x\"\n.const 1\nPUSH_CONSTANT 1\nDEFINE_GLOBAL 0 0\nHALT",
    )
    .unwrap();

    // A failing program unwinds but the global survives.
    let err = run_in(&mut vm, ".const 1\n.const 0\nPUSH_CONSTANT 0\nPUSH_CONSTANT 1\nDIVIDE\nHALT");
    assert!(err.is_err());
    assert!(matches!(vm.global("x"), Some(Value::Int(1))));

    let result = run_in(&mut vm, ".const \"x\"\nGET_GLOBAL 0\nSET_RESULT\nHALT").unwrap();
    assert!(matches!(result, Value::Int(1)));
}

#[test]
fn set_debug_location_attaches_to_errors() {
    let err = run(
        r#"
        .const "let y = 10 / 0"
        .const 10
        .const 0
        SET_DEBUG_LOCATION 0 3 9
        PUSH_CONSTANT 1
        PUSH_CONSTANT 2
        DIVIDE
        HALT
        "#,
    )
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Arithmetic);
    assert_eq!(err.line, 3);
    assert_eq!(err.column, 9);
    assert_eq!(err.source_line.as_deref(), Some("let y = 10 / 0"));
}

#[test]
fn clear_debug_location_discards_the_record() {
    let err = run(
        r#"
        .const "source text"
        .const 10
        .const 0
        SET_DEBUG_LOCATION 0 3 9
        CLEAR_DEBUG_LOCATION
        PUSH_CONSTANT 1
        PUSH_CONSTANT 2
        DIVIDE
        HALT
        "#,
    )
    .unwrap_err();
    assert_eq!(err.line, 0);
    assert!(err.source_line.is_none());
}

#[test]
fn call_depth_is_limited() {
    let mut vm = Vm::with_options(VmOptions::default().with_frame_limit(8));
    vm.set_context(Context::Test);
    // f calls itself forever.
    let err = run_in(
        &mut vm,
        r#"
        .fn f arity=0 locals=0
        .const 0
        CLOSURE 0
        CALL 0
        RETURN
        .end
        .const 0
        CLOSURE 0
        CALL 0
        HALT
        "#,
    )
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Internal);
    assert!(err.message.contains("call depth"));
}

#[test]
fn push_constant_out_of_range_is_an_internal_error() {
    let err = run("PUSH_CONSTANT 7\nHALT").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Internal);
}

#[test]
fn interactive_sessions_can_reuse_closures_across_loads() {
    let mut vm = Vm::new();
    vm.set_context(Context::Interactive);
    // First snippet defines a function-valued global.
    run_in(
        &mut vm,
        r#"
        .fn two arity=0 locals=0
        .const 2
        PUSH_CONSTANT 0
        RETURN
        .end
        .const "two"
        .const 0
        CLOSURE 1
        DEFINE_GLOBAL 0 0
        HALT
        "#,
    )
    .unwrap();
    // Second snippet defines another function and calls both; the CLOSURE
    // indices of each snippet stay valid after rebasing.
    let result = run_in(
        &mut vm,
        r#"
        .fn three arity=0 locals=0
        .const 3
        PUSH_CONSTANT 0
        RETURN
        .end
        .const "two"
        .const 0
        GET_GLOBAL 0
        CALL 0
        CLOSURE 1
        CALL 0
        ADD
        SET_RESULT
        HALT
        "#,
    )
    .unwrap();
    assert!(matches!(result, Value::Int(5)));
}
