//! Object-wide protocol operations: hashing, ordering, equality.
//!
//! Built-in scalar types take allocation-free fast paths; everything else
//! dispatches the corresponding operator method (`hash`, `<=>`) through the
//! interpreter, so user types participate.  A failed dispatch surfaces as a
//! thrown exception in REG-0.

use std::cmp::Ordering;

use crate::context::{Context, Thrown};
use crate::interp::invoke;

use super::value::Value;
use super::{bool_obj, exception_obj, float_obj, int_obj, string_obj, symbol_obj};

/// Hash a value.  Stable across collections (never derived from addresses).
pub fn hash(ctx: &mut Context, v: Value) -> Result<usize, Thrown> {
    if v.is_smallint() {
        return Ok(v.as_smallint() as usize);
    }
    let g = &ctx.globals;
    if v.type_is(g.type_float) {
        return Ok(float_obj::hash(float_obj::get(v)));
    }
    if v.type_is(g.type_int) {
        if let Some(i) = int_obj::boxed_to_i128(v.as_obj()) {
            return Ok(int_obj::hash(i));
        }
    }
    if v.type_is(g.type_symbol) {
        return Ok(symbol_obj::hash(v));
    }
    if v.type_is(g.type_string) {
        return Ok(string_obj::hash(v));
    }
    if v == g.val_nil {
        return Ok(bool_obj::NIL_HASH);
    }
    if v == g.val_true {
        return Ok(bool_obj::TRUE_HASH);
    }
    if v == g.val_false {
        return Ok(bool_obj::FALSE_HASH);
    }

    let name = ctx.globals.sym_hash;
    let result = invoke::invoke_method_vals(ctx, name, &[v])?;
    if result.is_smallint() {
        Ok(result.as_smallint() as usize)
    } else {
        Err(exception_obj::throw_format(
            ctx,
            "type",
            result,
            "hash method did not return an integer".to_string(),
        ))
    }
}

/// Compare two values.  Small-int pairs and numeric pairs short-circuit;
/// otherwise the left-hand type's `<=>` method decides.  Incomparable
/// values surface as a thrown type exception (the interpreter's compare
/// opcodes re-throw it).
pub fn compare(ctx: &mut Context, lhs: Value, rhs: Value) -> Result<Ordering, Thrown> {
    if lhs.is_smallint() && rhs.is_smallint() {
        return Ok(lhs.as_smallint().cmp(&rhs.as_smallint()));
    }
    if let (Some(a), Some(b)) = (int_obj::classify(ctx, lhs), int_obj::classify(ctx, rhs)) {
        return Ok(int_obj::compare_nums(a, b));
    }

    let name = ctx.globals.sym_cmp;
    let result = invoke::invoke_method_vals(ctx, name, &[lhs, rhs])?;
    if result.is_smallint() {
        Ok(result.as_smallint().cmp(&0))
    } else {
        Err(exception_obj::throw_format(
            ctx,
            "type",
            lhs,
            "values are not comparable".to_string(),
        ))
    }
}

/// Are two values equal?  Never fails: pointer equality first, then the
/// ordering protocol; a dispatch failure counts as "not equal" (REG-0 may
/// be clobbered with the swallowed exception, as thrown-and-discarded).
pub fn equals(ctx: &mut Context, lhs: Value, rhs: Value) -> bool {
    if lhs == rhs {
        return true;
    }
    if lhs.is_smallint() && rhs.is_smallint() {
        return false;
    }
    // Identity types: interning (symbols) and singleton-ness (nil, bools)
    // make pointer inequality definitive, without a dispatch.
    let g = &ctx.globals;
    for v in [lhs, rhs] {
        if !v.is_smallint()
            && (v.type_is(g.type_symbol) || v.type_is(g.type_bool) || v.type_is(g.type_nil))
        {
            return false;
        }
    }
    matches!(compare(ctx, lhs, rhs), Ok(Ordering::Equal))
}
