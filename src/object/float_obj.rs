//! The `Float` type: a boxed IEEE-754 double.

use crate::context::{Context, ExecResult};

use super::type_obj::SizeSpec;
use super::value::{ObjRef, Value, SMALLINT_MAX, SMALLINT_MIN};
use super::ObjectMeta;

pub const LAYOUT: (SizeSpec, SizeSpec) = (
    SizeSpec::Fixed(0),
    SizeSpec::Fixed(std::mem::size_of::<f64>()),
);

#[repr(C)]
struct FloatObj {
    _meta: ObjectMeta,
    value: f64,
}

/// Box a double.
pub fn new(ctx: &mut Context, value: f64) -> Value {
    let ty = ctx.globals.type_float.as_obj();
    let obj = ctx.mem.alloc(ty);
    unsafe { obj.deref::<FloatObj>() }.value = value;
    Value::from_obj(obj)
}

/// Read a boxed double.  The value must be a `Float`.
pub fn get(v: Value) -> f64 {
    get_ref(v.as_obj())
}

fn get_ref(obj: ObjRef) -> f64 {
    unsafe { obj.deref::<FloatObj>() }.value
}

/// Hash value shared by every NaN.
const NAN_HASH: usize = 0x7ff8_0000;

/// Hash a double.  Values numerically equal to a small integer hash like
/// that small integer, so mixed-type map keys behave; zeroes of either sign
/// hash to zero; NaNs collapse to one canonical hash.  Everything else folds
/// the mantissa and exponent bits into one word.
pub fn hash(value: f64) -> usize {
    if value.is_nan() {
        return NAN_HASH;
    }
    if value == 0.0 {
        return 0;
    }
    if value.fract() == 0.0 && value >= SMALLINT_MIN as f64 && value <= SMALLINT_MAX as f64 {
        return value as isize as usize;
    }
    let bits = value.to_bits();
    (bits ^ (bits >> 32)) as usize
}

// ----- native methods ----------------------------------------------------
//
// The arithmetic and comparison surface is shared with `Int`: both types
// resolve their operator methods to the mixed-numeric helpers in
// `int_obj`, so `1 + 2.5` and `2.5 + 1` go down the same path.

pub(crate) fn native_hash(ctx: &mut Context) -> ExecResult {
    let v = ctx.stack.reg(1);
    let h = hash(get(v));
    ctx.stack.set_reg(0, Value::smallint(h as isize));
    Ok(())
}
