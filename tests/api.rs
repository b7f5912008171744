//! Embedder-API tests: scalar round trips, the value format mini-language,
//! variables, globals and native blocks.

use quill::{ApiError, ApiValue, Context};

#[test]
fn int_round_trip() {
    let mut ctx = Context::new();
    for v in [0i64, 1, -1, 42, -42, 1 << 40, i64::MAX, i64::MIN] {
        ctx.make_int(0, v).unwrap();
        assert_eq!(ctx.read_int(0).unwrap(), v);
    }
}

#[test]
fn wide_ints_box_transparently() {
    let mut ctx = Context::new();
    // i64::MAX is outside the small-int range on 64-bit targets, so this
    // exercises the boxed representation.
    ctx.make_int(0, i64::MAX).unwrap();
    assert_eq!(ctx.read_int(0).unwrap(), i64::MAX);
    ctx.make_int(1, i64::MIN).unwrap();
    assert_eq!(ctx.read_int(1).unwrap(), i64::MIN);
}

#[test]
fn string_round_trip() {
    let mut ctx = Context::new();
    ctx.make_string(0, "Héllo").unwrap();
    let s = ctx.read_string(0).unwrap();
    assert_eq!(ctx.read_string_len(0).unwrap(), 6);
    assert_eq!(&s.as_bytes()[..6], &[0x48, 0xC3, 0xA9, 0x6C, 0x6C, 0x6F]);
}

#[test]
fn scalar_type_errors() {
    let mut ctx = Context::new();
    ctx.make_string(0, "x").unwrap();
    assert_eq!(ctx.read_int(0), Err(ApiError::Type));
    assert_eq!(ctx.read_float(0), Err(ApiError::Type));
    assert_eq!(ctx.read_bool(0), Err(ApiError::Type));
    assert_eq!(ApiError::Type.code(), -13);
    assert_eq!(ApiError::Exc.code(), -1);
    assert_eq!(ApiError::Idx.code(), -12);
}

#[test]
fn register_bounds_are_checked() {
    let mut ctx = Context::new();
    assert_eq!(ctx.make_int(10_000, 1), Err(ApiError::Idx));
    assert_eq!(ctx.read_int(10_000), Err(ApiError::Idx));
}

#[test]
fn nil_bool_float_symbol() {
    let mut ctx = Context::new();
    ctx.make_nil(0).unwrap();
    ctx.read_nil(0).unwrap();
    ctx.make_bool(1, true).unwrap();
    assert!(ctx.read_bool(1).unwrap());
    ctx.make_float(2, 2.5).unwrap();
    assert_eq!(ctx.read_float(2).unwrap(), 2.5);
    ctx.make_symbol(3, "hello").unwrap();
    assert_eq!(ctx.read_symbol(3).unwrap(), "hello");
}

#[test]
fn symbols_are_interned() {
    let mut ctx = Context::new();
    ctx.make_symbol(0, "greeting").unwrap();
    ctx.make_symbol(1, "greeting").unwrap();
    assert!(ctx.values_identical(0, 1).unwrap());
    ctx.make_symbol(2, "other").unwrap();
    assert!(!ctx.values_identical(0, 2).unwrap());
}

#[test]
fn make_and_read_values() {
    let mut ctx = Context::new();
    let n = ctx
        .make_values(
            0,
            "ixs",
            &[
                ApiValue::Int(7),
                ApiValue::Bool(false),
                ApiValue::Str("hey".into()),
            ],
        )
        .unwrap();
    assert_eq!(n, 3);
    let out = ctx.read_values(0, "ixs").unwrap();
    assert_eq!(
        out,
        vec![
            ApiValue::Int(7),
            ApiValue::Bool(false),
            ApiValue::Str("hey".into())
        ]
    );
}

#[test]
fn values_tuple_and_array() {
    let mut ctx = Context::new();
    ctx.make_values(
        0,
        "(ii)[ss]",
        &[
            ApiValue::Int(1),
            ApiValue::Int(2),
            ApiValue::Str("a".into()),
            ApiValue::Str("b".into()),
        ],
    )
    .unwrap();
    let out = ctx.read_values(0, "(ii)*[s]").unwrap();
    assert_eq!(
        out,
        vec![
            ApiValue::Tuple(vec![ApiValue::Int(1), ApiValue::Int(2)]),
            ApiValue::Array(vec![ApiValue::Str("a".into()), ApiValue::Str("b".into())]),
        ]
    );
}

#[test]
fn values_map_and_nilable() {
    let mut ctx = Context::new();
    ctx.make_values(
        0,
        "{is}?i",
        &[
            ApiValue::Int(5),
            ApiValue::Str("five".into()),
            ApiValue::Nil,
        ],
    )
    .unwrap();
    let out = ctx.read_values(0, "{is}?i").unwrap();
    assert_eq!(
        out,
        vec![
            ApiValue::Map(vec![(ApiValue::Int(5), ApiValue::Str("five".into()))]),
            ApiValue::Nil,
        ]
    );
}

#[test]
fn values_skip_and_register_refs() {
    let mut ctx = Context::new();
    ctx.make_int(5, 99).unwrap();
    let n = ctx
        .make_values(0, "-%", &[ApiValue::Reg(5)])
        .unwrap();
    assert_eq!(n, 2);
    // Register 0 was skipped; register 1 received a copy of register 5.
    assert_eq!(ctx.read_int(1).unwrap(), 99);
}

#[test]
fn malformed_formats_are_rejected() {
    let mut ctx = Context::new();
    assert_eq!(ctx.make_values(0, "(", &[]), Err(ApiError::Arg));
    assert_eq!(ctx.make_values(0, "q", &[]), Err(ApiError::Arg));
    assert_eq!(ctx.make_values(0, "((i))", &[]), Err(ApiError::Arg));
    assert_eq!(ctx.make_values(0, "i", &[]), Err(ApiError::Arg));
}

#[test]
fn move_local_copies_registers() {
    let mut ctx = Context::new();
    ctx.make_int(0, 11).unwrap();
    ctx.move_local(3, 0).unwrap();
    assert_eq!(ctx.read_int(3).unwrap(), 11);
}

#[test]
fn globals_in_the_entry_module() {
    let mut ctx = Context::new();
    ctx.make_int(0, 1234).unwrap();
    ctx.set_global("answer", 0).unwrap();
    ctx.make_nil(1).unwrap();
    ctx.get_global("answer", 1).unwrap();
    assert_eq!(ctx.read_int(1).unwrap(), 1234);
    assert_eq!(ctx.get_global("missing", 1), Err(ApiError::Arg));

    // Updating keeps the same variable.
    ctx.make_int(0, 5678).unwrap();
    ctx.set_global("answer", 0).unwrap();
    ctx.get_global("answer", 1).unwrap();
    assert_eq!(ctx.read_int(1).unwrap(), 5678);
}

#[test]
fn native_block_scopes_registers() {
    let mut ctx = Context::new();
    ctx.make_int(1, 7).unwrap();
    ctx.make_int(0, 10).unwrap();
    ctx.native_block(4, |ctx| {
        // REG-0 is forwarded in.
        assert_eq!(ctx.read_int(0).unwrap(), 10);
        // This frame's registers are fresh.
        ctx.make_int(1, 1000).unwrap();
        // The block's REG-0 is forwarded back out.
        ctx.make_int(0, 20).unwrap();
        Ok(())
    })
    .unwrap();
    assert_eq!(ctx.read_int(0).unwrap(), 20);
    // The outer register 1 is untouched.
    assert_eq!(ctx.read_int(1).unwrap(), 7);
}

#[test]
fn element_access_on_arrays_and_maps() {
    let mut ctx = Context::new();
    ctx.make_values(
        0,
        "[iii]",
        &[ApiValue::Int(10), ApiValue::Int(20), ApiValue::Int(30)],
    )
    .unwrap();
    ctx.make_int(1, 1).unwrap();
    ctx.get_element(0, 1, 2).unwrap();
    assert_eq!(ctx.read_int(2).unwrap(), 20);

    ctx.make_int(2, 99).unwrap();
    ctx.set_element(0, 1, 2).unwrap();
    ctx.get_element(0, 1, 3).unwrap();
    assert_eq!(ctx.read_int(3).unwrap(), 99);

    // Out-of-range array access raises a key exception.
    ctx.make_int(1, 7).unwrap();
    assert_eq!(ctx.get_element(0, 1, 2), Err(ApiError::Exc));
    let info = ctx.read_exception(0).unwrap();
    assert_eq!(info.kind, "key");
}

#[test]
fn exceptions_are_inspectable() {
    let mut ctx = Context::new();
    ctx.make_exception(0, "sys", "something happened").unwrap();
    let info = ctx.read_exception(0).unwrap();
    assert_eq!(info.kind, "sys");
    assert_eq!(info.what.as_deref(), Some("something happened"));
    assert_eq!(info.trace_len, 0);
}
