//! Interpreter and invocation-protocol tests: bytecode execution, argument
//! passing, exceptions, the self-caching global forms, and the operator
//! fast paths.

use quill::api::{FuncCode, FunctionDef, TypeDef};
use quill::context::{ExecResult, Thrown};
use quill::interp::instr::{
    make_abc, make_abscs, make_absw, make_abw, make_asbc, make_aw, make_call, operands_abw, Opcode,
};
use quill::object::func_obj::FuncMeta;
use quill::object::type_obj::SizeSpec;
use quill::{ApiError, ApiValue, Context};

fn def(na: u8, no: i8, nr: u16, code: &[u32]) -> FunctionDef<'_> {
    FunctionDef {
        meta: FuncMeta { na, no, nr },
        code: FuncCode::Bytecode(code),
    }
}

#[test]
fn small_int_arithmetic() {
    let mut ctx = Context::new();
    let code = [
        make_absw(Opcode::MkInt, 1, 6),
        make_absw(Opcode::MkInt, 2, 7),
        make_abc(Opcode::Add, 0, 1, 2),
        make_aw(Opcode::Ret, 0),
    ];
    ctx.make_function(1, &def(0, 0, 3, &code), &[], None, None)
        .unwrap();
    ctx.invoke(&[0, 1]).unwrap();
    assert_eq!(ctx.read_int(0).unwrap(), 13);
}

#[test]
fn nested_calls() {
    let mut ctx = Context::new();
    // B(a, b) = a + b
    let b_code = [
        make_abc(Opcode::Add, 0, 1, 2),
        make_aw(Opcode::Ret, 0),
    ];
    ctx.make_function(2, &def(2, 0, 3, &b_code), &[], None, None)
        .unwrap();
    // A() = B(5, 8)
    ctx.make_values(3, "(%)", &[ApiValue::Reg(2)]).unwrap();
    let a_code = [
        make_abw(Opcode::LdCon, 1, 0),
        make_absw(Opcode::MkInt, 2, 5),
        make_absw(Opcode::MkInt, 3, 8),
        make_abw(Opcode::LdLoc, 0, 1),
        make_call(4, 2, [2, 3, 0]),
        make_aw(Opcode::Ret, 4),
    ];
    ctx.make_function(1, &def(0, 0, 5, &a_code), &[], Some(3), None)
        .unwrap();
    ctx.invoke(&[0, 1]).unwrap();
    assert_eq!(ctx.read_int(0).unwrap(), 13);
}

#[test]
fn callv_and_callp_opcodes() {
    let mut ctx = Context::new();
    let adder = [
        make_abc(Opcode::Add, 0, 1, 2),
        make_aw(Opcode::Ret, 0),
    ];
    ctx.make_function(2, &def(2, 0, 3, &adder), &[], None, None)
        .unwrap();
    ctx.make_values(3, "(%)", &[ApiValue::Reg(2)]).unwrap();

    // CALLV over a contiguous register vector.
    let a_code = [
        make_abw(Opcode::LdCon, 1, 0),
        make_absw(Opcode::MkInt, 2, 30),
        make_absw(Opcode::MkInt, 3, 12),
        make_abw(Opcode::LdLoc, 0, 1),
        make_abc(Opcode::CallV, 4, 2, 2),
        make_aw(Opcode::Ret, 4),
    ];
    ctx.make_function(1, &def(0, 0, 5, &a_code), &[], Some(3), None)
        .unwrap();
    ctx.invoke(&[0, 1]).unwrap();
    assert_eq!(ctx.read_int(0).unwrap(), 42);

    // CALLP over a packed tuple.
    let p_code = [
        make_abw(Opcode::LdCon, 1, 0),
        make_absw(Opcode::MkInt, 2, 4),
        make_absw(Opcode::MkInt, 3, 6),
        make_abc(Opcode::MkTup, 4, 2, 2),
        make_abw(Opcode::LdLoc, 0, 1),
        make_abw(Opcode::CallP, 5, 4),
        make_aw(Opcode::Ret, 5),
    ];
    ctx.make_function(1, &def(0, 0, 6, &p_code), &[], Some(3), None)
        .unwrap();
    ctx.invoke(&[0, 1]).unwrap();
    assert_eq!(ctx.read_int(0).unwrap(), 10);
}

#[test]
fn argument_passing_paths_agree() {
    let mut ctx = Context::new();
    // V(req, ...rest) returns the rest tuple.
    let v_code = [make_aw(Opcode::Ret, 2)];
    ctx.make_function(1, &def(1, -1, 4, &v_code), &[], None, None)
        .unwrap();
    ctx.make_int(2, 1).unwrap();
    ctx.make_int(3, 2).unwrap();
    ctx.make_int(4, 3).unwrap();

    // Discrete argument registers.
    ctx.invoke(&[0, 1, 2, 3, 4]).unwrap();
    let direct = ctx.read_values(0, "*(i)").unwrap();

    // Packed tuple.
    ctx.make_values(5, "(%%%)", &[ApiValue::Reg(2), ApiValue::Reg(3), ApiValue::Reg(4)])
        .unwrap();
    ctx.invoke_packed(0, 1, 5).unwrap();
    let packed_tuple = ctx.read_values(0, "*(i)").unwrap();

    // Packed array.
    ctx.make_values(5, "[%%%]", &[ApiValue::Reg(2), ApiValue::Reg(3), ApiValue::Reg(4)])
        .unwrap();
    ctx.invoke_packed(0, 1, 5).unwrap();
    let packed_array = ctx.read_values(0, "*(i)").unwrap();

    let expect = vec![ApiValue::Tuple(vec![ApiValue::Int(2), ApiValue::Int(3)])];
    assert_eq!(direct, expect);
    assert_eq!(packed_tuple, expect);
    assert_eq!(packed_array, expect);

    // No extra arguments: the rest parameter is the empty tuple.
    ctx.invoke(&[0, 1, 2]).unwrap();
    let none = ctx.read_values(0, "*(i)").unwrap();
    assert_eq!(none, vec![ApiValue::Tuple(vec![])]);
}

#[test]
fn optional_arguments_fill_with_nil() {
    let mut ctx = Context::new();
    // O(req, ?opt1, ?opt2) returns opt2.
    let o_code = [make_aw(Opcode::Ret, 3)];
    ctx.make_function(1, &def(1, 2, 4, &o_code), &[], None, None)
        .unwrap();
    ctx.make_int(2, 1).unwrap();
    ctx.invoke(&[0, 1, 2]).unwrap();
    ctx.read_nil(0).unwrap();

    ctx.make_int(3, 7).unwrap();
    ctx.make_int(4, 9).unwrap();
    ctx.invoke(&[0, 1, 2, 3, 4]).unwrap();
    assert_eq!(ctx.read_int(0).unwrap(), 9);

    // Too many arguments raise a type exception.
    assert_eq!(ctx.invoke(&[0, 1, 2, 3, 4, 4]), Err(ApiError::Exc));
    let info = ctx.read_exception(0).unwrap();
    assert_eq!(info.kind, "type");
    assert!(info.what.unwrap().contains("wrong number of arguments"));
}

#[test]
fn thrown_non_exception_propagates() {
    let mut ctx = Context::new();
    // B() throws the int 0.
    let b_code = [
        make_absw(Opcode::MkInt, 1, 0),
        make_aw(Opcode::Thr, 1),
    ];
    ctx.make_function(2, &def(0, 0, 2, &b_code), &[], None, None)
        .unwrap();
    ctx.make_values(3, "(%)", &[ApiValue::Reg(2)]).unwrap();
    // A() = B()
    let a_code = [
        make_abw(Opcode::LdCon, 1, 0),
        make_abw(Opcode::LdLoc, 0, 1),
        make_call(1, 0, [0, 0, 0]),
        make_aw(Opcode::Ret, 1),
    ];
    ctx.make_function(1, &def(0, 0, 2, &a_code), &[], Some(3), None)
        .unwrap();
    assert_eq!(ctx.invoke(&[0, 1]), Err(ApiError::Exc));
    // The thrown value was a plain int; it propagates as-is.
    assert_eq!(ctx.read_int(0).unwrap(), 0);
}

fn native_boom(ctx: &mut Context) -> ExecResult {
    ctx.make_exception(0, "sys", "boom").unwrap();
    Err(Thrown)
}

#[test]
fn exception_collects_stack_trace() {
    let mut ctx = Context::new();
    ctx.make_function(
        2,
        &FunctionDef {
            meta: FuncMeta { na: 0, no: 0, nr: 1 },
            code: FuncCode::Native(native_boom),
        },
        &[],
        None,
        None,
    )
    .unwrap();
    ctx.make_values(3, "(%)", &[ApiValue::Reg(2)]).unwrap();
    // B() = boom()
    let b_code = [
        make_abw(Opcode::LdCon, 1, 0),
        make_abw(Opcode::LdLoc, 0, 1),
        make_call(1, 0, [0, 0, 0]),
        make_aw(Opcode::Ret, 1),
    ];
    ctx.make_function(1, &def(0, 0, 2, &b_code), &[], Some(3), None)
        .unwrap();
    ctx.make_values(3, "(%)", &[ApiValue::Reg(1)]).unwrap();
    // A() = B()
    let a_code = [
        make_abw(Opcode::LdCon, 1, 0),
        make_abw(Opcode::LdLoc, 0, 1),
        make_call(1, 0, [0, 0, 0]),
        make_aw(Opcode::Ret, 1),
    ];
    ctx.make_function(4, &def(0, 0, 2, &a_code), &[], Some(3), None)
        .unwrap();

    assert_eq!(ctx.invoke(&[0, 4]), Err(ApiError::Exc));
    let info = ctx.read_exception(0).unwrap();
    assert_eq!(info.kind, "sys");
    assert_eq!(info.what.as_deref(), Some("boom"));
    assert!(info.trace_len >= 2, "trace has {} frames", info.trace_len);
}

#[test]
fn ldglb_rewrites_itself() {
    let mut ctx = Context::new();
    ctx.make_int(0, 42).unwrap();
    ctx.set_global("counter", 0).unwrap();

    let code = [make_abw(Opcode::LdGlb, 1, 0), make_aw(Opcode::Ret, 1)];
    ctx.make_function(1, &def(0, 0, 2, &code), &["counter"], None, None)
        .unwrap();

    for _ in 0..1000 {
        ctx.invoke(&[0, 1]).unwrap();
        assert_eq!(ctx.read_int(0).unwrap(), 42);
    }

    // The first execution rewrote the instruction to the direct-indexed
    // form; the disassembly shows LDGLBX at that address.
    let words = ctx.read_function_bytecode(1).unwrap();
    assert_eq!(Opcode::of(words[0]), Some(Opcode::LdGlbX));
    let (reg, _index) = operands_abw(words[0]);
    assert_eq!(reg, 1);

    // The cache reads the variable, not a snapshot.
    ctx.make_int(0, 99).unwrap();
    ctx.set_global("counter", 0).unwrap();
    ctx.invoke(&[0, 1]).unwrap();
    assert_eq!(ctx.read_int(0).unwrap(), 99);
}

#[test]
fn map_set_get_remove() {
    let mut ctx = Context::new();
    // REG-0 is the volatile callable/result register; the map lives in
    // register 1.
    ctx.make_values(1, "{}", &[]).unwrap();
    for k in 0..200i64 {
        ctx.make_int(2, k).unwrap();
        ctx.make_int(3, -k).unwrap();
        ctx.set_element(1, 2, 3).unwrap();
    }
    for k in (0..200i64).step_by(2) {
        ctx.make_int(2, k).unwrap();
        ctx.remove_element(1, 2).unwrap();
    }
    for k in 0..200i64 {
        ctx.make_int(2, k).unwrap();
        let r = ctx.get_element(1, 2, 3);
        if k % 2 == 1 {
            r.unwrap();
            assert_eq!(ctx.read_int(3).unwrap(), -k);
        } else {
            assert_eq!(r, Err(ApiError::Exc));
            assert_eq!(ctx.read_exception(0).unwrap().kind, "key");
        }
    }
}

#[test]
fn load_opcodes() {
    let mut ctx = Context::new();
    let code = [
        make_abw(Opcode::LdBln, 1, 1),
        make_aw(Opcode::Ret, 1),
    ];
    ctx.make_function(1, &def(0, 0, 2, &code), &[], None, None)
        .unwrap();
    ctx.invoke(&[0, 1]).unwrap();
    assert!(ctx.read_bool(0).unwrap());

    let code = [
        make_abw(Opcode::LdNil, 1, 1),
        make_aw(Opcode::Ret, 1),
    ];
    ctx.make_function(1, &def(0, 0, 2, &code), &[], None, None)
        .unwrap();
    ctx.invoke(&[0, 1]).unwrap();
    ctx.read_nil(0).unwrap();

    let code = [
        make_abw(Opcode::LdSym, 1, 0),
        make_aw(Opcode::Ret, 1),
    ];
    ctx.make_function(1, &def(0, 0, 2, &code), &["marker"], None, None)
        .unwrap();
    ctx.invoke(&[0, 1]).unwrap();
    assert_eq!(ctx.read_symbol(0).unwrap(), "marker");
}

#[test]
fn materialised_comparisons() {
    let mut ctx = Context::new();
    // CMP yields -1/0/1; CMPLT yields a boolean.
    let cmp_code = [make_abc(Opcode::Cmp, 0, 1, 2), make_aw(Opcode::Ret, 0)];
    ctx.make_function(1, &def(2, 0, 3, &cmp_code), &[], None, None)
        .unwrap();
    for (a, b, expect) in [(1, 2, -1), (2, 2, 0), (3, 2, 1)] {
        ctx.make_int(2, a).unwrap();
        ctx.make_int(3, b).unwrap();
        ctx.invoke(&[0, 1, 2, 3]).unwrap();
        assert_eq!(ctx.read_int(0).unwrap(), expect);
    }

    let lt_code = [make_abc(Opcode::CmpLt, 0, 1, 2), make_aw(Opcode::Ret, 0)];
    ctx.make_function(1, &def(2, 0, 3, &lt_code), &[], None, None)
        .unwrap();
    ctx.make_int(2, 1).unwrap();
    ctx.make_float(3, 1.5).unwrap();
    ctx.invoke(&[0, 1, 2, 3]).unwrap();
    assert!(ctx.read_bool(0).unwrap());

    // Incomparable operands throw.
    ctx.make_string(3, "x").unwrap();
    assert_eq!(ctx.invoke(&[0, 1, 2, 3]), Err(ApiError::Exc));
    assert_eq!(ctx.read_exception(0).unwrap().kind, "type");
}

#[test]
fn ranges_are_built_by_mkrng() {
    let mut ctx = Context::new();
    let code = [
        make_absw(Opcode::MkInt, 1, 1),
        make_absw(Opcode::MkInt, 2, 5),
        make_abc(Opcode::MkRng, 3, 1, 2),
        make_aw(Opcode::Ret, 3),
    ];
    ctx.make_function(1, &def(0, 0, 4, &code), &[], None, None)
        .unwrap();
    ctx.invoke(&[0, 1]).unwrap();
    // The result is a heap object (a young Range).
    assert!(ctx.reg_gc_state(0).unwrap().is_some());
}

#[test]
fn conditional_jumps() {
    let mut ctx = Context::new();
    // |a - b|
    let code = [
        make_asbc(Opcode::JmpLt, 3, 1, 2),
        make_abc(Opcode::Sub, 3, 1, 2),
        make_aw(Opcode::Ret, 3),
        make_abc(Opcode::Sub, 3, 2, 1),
        make_aw(Opcode::Ret, 3),
    ];
    ctx.make_function(1, &def(2, 0, 4, &code), &[], None, None)
        .unwrap();
    for (a, b, expect) in [(9, 4, 5), (4, 9, 5), (7, 7, 0)] {
        ctx.make_int(2, a).unwrap();
        ctx.make_int(3, b).unwrap();
        ctx.invoke(&[0, 1, 2, 3]).unwrap();
        assert_eq!(ctx.read_int(0).unwrap(), expect);
    }
}

#[test]
fn boolean_jumps_reject_non_booleans() {
    let mut ctx = Context::new();
    let code = [
        make_abw(Opcode::Not, 0, 1),
        make_aw(Opcode::Ret, 0),
    ];
    ctx.make_function(1, &def(1, 0, 2, &code), &[], None, None)
        .unwrap();
    ctx.make_bool(2, true).unwrap();
    ctx.invoke(&[0, 1, 2]).unwrap();
    assert!(!ctx.read_bool(0).unwrap());

    ctx.make_int(2, 3).unwrap();
    assert_eq!(ctx.invoke(&[0, 1, 2]), Err(ApiError::Exc));
    assert_eq!(ctx.read_exception(0).unwrap().kind, "type");
}

#[test]
fn mkflt_builds_doubles() {
    let mut ctx = Context::new();
    let code = [
        make_abscs(Opcode::MkFlt, 1, 3, 2),
        make_aw(Opcode::Ret, 1),
    ];
    ctx.make_function(1, &def(0, 0, 2, &code), &[], None, None)
        .unwrap();
    ctx.invoke(&[0, 1]).unwrap();
    assert_eq!(ctx.read_float(0).unwrap(), 12.0);
}

#[test]
fn mixed_numeric_dispatch() {
    let mut ctx = Context::new();
    let add = [make_abc(Opcode::Add, 0, 1, 2), make_aw(Opcode::Ret, 0)];
    ctx.make_function(1, &def(2, 0, 3, &add), &[], None, None)
        .unwrap();

    ctx.make_float(2, 2.5).unwrap();
    ctx.make_int(3, 1).unwrap();
    ctx.invoke(&[0, 1, 2, 3]).unwrap();
    assert_eq!(ctx.read_float(0).unwrap(), 3.5);

    // The other operand order goes through Int's table, same result.
    ctx.invoke(&[0, 1, 3, 2]).unwrap();
    assert_eq!(ctx.read_float(0).unwrap(), 3.5);

    // Integer division yields a Float.
    let divide = [make_abc(Opcode::Div, 0, 1, 2), make_aw(Opcode::Ret, 0)];
    ctx.make_function(1, &def(2, 0, 3, &divide), &[], None, None)
        .unwrap();
    ctx.make_int(2, 7).unwrap();
    ctx.make_int(3, 2).unwrap();
    ctx.invoke(&[0, 1, 2, 3]).unwrap();
    assert_eq!(ctx.read_float(0).unwrap(), 3.5);
}

#[test]
fn small_int_overflow_promotes() {
    let mut ctx = Context::new();
    let add = [make_abc(Opcode::Add, 0, 1, 2), make_aw(Opcode::Ret, 0)];
    ctx.make_function(1, &def(2, 0, 3, &add), &[], None, None)
        .unwrap();
    let big = i64::MAX / 2; // small-int max on 64-bit targets
    ctx.make_int(2, big).unwrap();
    ctx.make_int(3, big).unwrap();
    ctx.invoke(&[0, 1, 2, 3]).unwrap();
    assert_eq!(ctx.read_int(0).unwrap(), big + big);
}

#[test]
fn element_opcodes_build_and_index_collections() {
    let mut ctx = Context::new();
    // arr = [10, 20]; arr[1]
    let arr_code = [
        make_absw(Opcode::MkInt, 1, 10),
        make_absw(Opcode::MkInt, 2, 20),
        make_abc(Opcode::MkArr, 3, 1, 2),
        make_absw(Opcode::MkInt, 4, 1),
        make_abc(Opcode::LdElm, 4, 5, 3),
        make_aw(Opcode::Ret, 5),
    ];
    ctx.make_function(1, &def(0, 0, 6, &arr_code), &[], None, None)
        .unwrap();
    ctx.invoke(&[0, 1]).unwrap();
    assert_eq!(ctx.read_int(0).unwrap(), 20);

    // m = {1: 42}; m[1]
    let map_code = [
        make_absw(Opcode::MkInt, 1, 1),
        make_absw(Opcode::MkInt, 2, 42),
        make_abc(Opcode::MkMap, 3, 1, 1),
        make_absw(Opcode::MkInt, 4, 1),
        make_abc(Opcode::LdElm, 4, 5, 3),
        make_aw(Opcode::Ret, 5),
    ];
    ctx.make_function(1, &def(0, 0, 6, &map_code), &[], None, None)
        .unwrap();
    ctx.invoke(&[0, 1]).unwrap();
    assert_eq!(ctx.read_int(0).unwrap(), 42);
}

#[test]
fn modules_import_and_field_access() {
    let mut ctx = Context::new();
    ctx.make_module(3).unwrap();
    ctx.make_int(4, 77).unwrap();
    ctx.module_set_global(3, "x", 4).unwrap();
    ctx.register_module("mymod", 3).unwrap();

    let code = [
        make_abw(Opcode::Imp, 1, 0),
        make_abc(Opcode::LdFldY, 1, 2, 1),
        make_aw(Opcode::Ret, 2),
    ];
    ctx.make_function(1, &def(0, 0, 3, &code), &["mymod", "x"], None, None)
        .unwrap();
    ctx.invoke(&[0, 1]).unwrap();
    assert_eq!(ctx.read_int(0).unwrap(), 77);

    // Importing an unregistered module raises a key exception.
    let missing = [
        make_abw(Opcode::Imp, 1, 0),
        make_aw(Opcode::Ret, 1),
    ];
    ctx.make_function(1, &def(0, 0, 2, &missing), &["nope"], None, None)
        .unwrap();
    assert_eq!(ctx.invoke(&[0, 1]), Err(ApiError::Exc));
    assert_eq!(ctx.read_exception(0).unwrap().kind, "key");
}

#[test]
fn named_and_indexed_fields() {
    let mut ctx = Context::new();
    ctx.make_type(
        2,
        &TypeDef {
            slots: SizeSpec::Fixed(2),
            bytes: SizeSpec::Fixed(0),
            fields: &["a", "b"],
        },
    )
    .unwrap();
    ctx.make_instance(3, 2).unwrap();

    // obj.a = 5 (by name); then read it back by slot index 0.
    let code = [
        make_absw(Opcode::MkInt, 2, 5),
        make_abc(Opcode::StFldY, 0, 2, 1),
        make_abc(Opcode::LdFldX, 0, 2, 1),
        make_aw(Opcode::Ret, 2),
    ];
    ctx.make_function(1, &def(1, 0, 3, &code), &["a"], None, None)
        .unwrap();
    ctx.invoke(&[0, 1, 3]).unwrap();
    assert_eq!(ctx.read_int(0).unwrap(), 5);

    // Unknown field names raise a key exception.
    let bad = [
        make_abc(Opcode::LdFldY, 0, 2, 1),
        make_aw(Opcode::Ret, 2),
    ];
    ctx.make_function(1, &def(1, 0, 3, &bad), &["zzz"], None, None)
        .unwrap();
    assert_eq!(ctx.invoke(&[0, 1, 3]), Err(ApiError::Exc));
    assert_eq!(ctx.read_exception(0).unwrap().kind, "key");
}

#[test]
fn callable_objects_resolve_through_call_method() {
    let mut ctx = Context::new();
    // A type whose `call` method returns the instance's first field plus
    // the argument.  Layout on entry: R1 = the callable object (threaded as
    // the leading self-like argument), R2 = the argument.
    let call_code = [
        make_abc(Opcode::LdFldX, 0, 3, 1),
        make_abc(Opcode::Add, 0, 3, 2),
        make_aw(Opcode::Ret, 0),
    ];
    ctx.make_type(
        2,
        &TypeDef {
            slots: SizeSpec::Fixed(1),
            bytes: SizeSpec::Fixed(0),
            fields: &["base"],
        },
    )
    .unwrap();
    ctx.make_function(3, &def(2, 0, 4, &call_code), &[], None, None)
        .unwrap();
    ctx.type_add_method(2, "call", 3).unwrap();

    ctx.make_instance(4, 2).unwrap();
    // instance.base = 100
    let init = [
        make_absw(Opcode::MkInt, 2, 100),
        make_abc(Opcode::StFldX, 0, 2, 1),
        make_aw(Opcode::RetNil, 0),
    ];
    ctx.make_function(5, &def(1, 0, 3, &init), &[], None, None)
        .unwrap();
    ctx.invoke(&[0, 5, 4]).unwrap();

    // Now invoke the instance itself.
    ctx.make_int(5, 23).unwrap();
    ctx.invoke(&[0, 4, 5]).unwrap();
    assert_eq!(ctx.read_int(0).unwrap(), 123);
}
