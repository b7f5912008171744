//! The `Int` type.
//!
//! Integers in the small-int range live unboxed in the value word.  Anything
//! wider is boxed: sign flag plus magnitude cells in the bytes region.  The
//! interpreter's arithmetic fast paths promote small-int overflow into the
//! boxed representation through [`make`].
//!
//! This module also hosts the mixed-numeric operator natives shared by `Int`
//! and `Float` method tables: both types dispatch `1 + 2.5` and `2.5 + 1`
//! down the same helpers.

use std::cmp::Ordering;

use crate::context::{Context, ExecResult, Thrown};
use crate::util::constants::BYTES_IN_WORD;

use super::exception_obj;
use super::float_obj;
use super::type_obj::SizeSpec;
use super::value::{ObjRef, Value, SMALLINT_MAX, SMALLINT_MIN};
use super::{bool_obj, ObjectMeta};

pub const LAYOUT: (SizeSpec, SizeSpec) = (SizeSpec::Fixed(0), SizeSpec::Extendable);

/// Fixed prefix of the bytes region: the size word, the sign flag.
const BYTES_FIXED_WORDS: usize = 2;

#[repr(C)]
struct IntObj {
    _meta: ObjectMeta,
    // --- BYTES ---
    _bytes_size: usize,
    negative: usize,
    // magnitude cells follow, least significant first
}

/// Number of magnitude cells an `i128` needs.
const fn cells_for_i128() -> usize {
    128 / (BYTES_IN_WORD * 8)
}

/// Make an integer value: unboxed when it fits the small-int range, boxed
/// otherwise.
pub fn make(ctx: &mut Context, v: i128) -> Value {
    if v >= SMALLINT_MIN as i128 && v <= SMALLINT_MAX as i128 {
        return Value::smallint(v as isize);
    }
    new_boxed(ctx, v)
}

fn new_boxed(ctx: &mut Context, v: i128) -> Value {
    let magnitude = v.unsigned_abs();
    let mut cells = [0usize; cells_for_i128()];
    let mut m = magnitude;
    let mut n_cells = 0;
    while m != 0 {
        cells[n_cells] = m as usize;
        m >>= BYTES_IN_WORD * 8;
        n_cells += 1;
    }
    debug_assert!(n_cells >= 1, "small magnitudes stay unboxed");

    let ty = ctx.globals.type_int.as_obj();
    let ext_bytes = (BYTES_FIXED_WORDS + n_cells) * BYTES_IN_WORD;
    let obj = ctx
        .mem
        .alloc_ex(crate::mem::objmem::AllocHint::Auto, ty, 0, ext_bytes);
    let raw = unsafe { obj.deref::<IntObj>() };
    raw.negative = (v < 0) as usize;
    for (i, &cell) in cells[..n_cells].iter().enumerate() {
        unsafe { cell_addr(obj, i).store(cell) };
    }
    Value::from_obj(obj)
}

fn cell_addr(obj: ObjRef, i: usize) -> crate::util::Address {
    obj.bytes_base() + (BYTES_FIXED_WORDS + i) * BYTES_IN_WORD
}

fn cell_count(obj: ObjRef) -> usize {
    obj.bytes_size() / BYTES_IN_WORD - BYTES_FIXED_WORDS
}

/// Read a boxed integer back as an `i128`.  All boxed ints constructed by
/// this runtime fit; `None` signals a foreign/corrupt cell count.
pub fn boxed_to_i128(obj: ObjRef) -> Option<i128> {
    let n = cell_count(obj);
    if n > cells_for_i128() {
        return None;
    }
    let mut magnitude: u128 = 0;
    for i in (0..n).rev() {
        magnitude = (magnitude << (BYTES_IN_WORD * 8)) | unsafe { cell_addr(obj, i).load::<usize>() } as u128;
    }
    let negative = unsafe { obj.deref::<IntObj>() }.negative != 0;
    if negative {
        Some((magnitude as i128).wrapping_neg())
    } else if magnitude > i128::MAX as u128 {
        None
    } else {
        Some(magnitude as i128)
    }
}

/// Is `v` an integer (unboxed or boxed)?
pub fn is_int(ctx: &Context, v: Value) -> bool {
    v.is_smallint() || v.type_is(ctx.globals.type_int)
}

/// Read any integer value as `i128`.
pub fn to_i128(ctx: &Context, v: Value) -> Option<i128> {
    if v.is_smallint() {
        return Some(v.as_smallint() as i128);
    }
    if v.type_is(ctx.globals.type_int) {
        return boxed_to_i128(v.as_obj());
    }
    None
}

/// Hash an integer.  Values in the small-int range hash as the sign-extended
/// word; wider values hash through the float fold so that an `Int` and a
/// `Float` that compare equal also hash equal.
pub fn hash(v: i128) -> usize {
    if v >= SMALLINT_MIN as i128 && v <= SMALLINT_MAX as i128 {
        return v as isize as usize;
    }
    float_obj::hash(v as f64)
}

// ----- mixed-numeric helpers ---------------------------------------------

/// A numeric operand: any integer, or a float.
#[derive(Copy, Clone, Debug)]
pub(crate) enum Num {
    Int(i128),
    Float(f64),
}

pub(crate) fn classify(ctx: &Context, v: Value) -> Option<Num> {
    if let Some(i) = to_i128(ctx, v) {
        return Some(Num::Int(i));
    }
    if v.type_is(ctx.globals.type_float) {
        return Some(Num::Float(float_obj::get(v)));
    }
    None
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

/// Total order over numerics.  Never incomparable: NaN sorts via the IEEE
/// total order when an ordinary comparison has no answer.
pub(crate) fn compare_nums(lhs: Num, rhs: Num) -> Ordering {
    if let (Num::Int(a), Num::Int(b)) = (lhs, rhs) {
        return a.cmp(&b);
    }
    let (a, b) = (lhs.as_f64(), rhs.as_f64());
    match a.partial_cmp(&b) {
        Some(ord) => ord,
        None => a.total_cmp(&b),
    }
}

fn throw_not_numeric(ctx: &mut Context, op: &str, v: Value) -> Thrown {
    exception_obj::throw_format(
        ctx,
        "type",
        v,
        format!("unsupported operand for `{}'", op),
    )
}

fn throw_overflow(ctx: &mut Context, op: &str) -> Thrown {
    exception_obj::throw_format(
        ctx,
        "sys",
        Value::SMALLINT_ZERO,
        format!("integer overflow in `{}'", op),
    )
}

fn binary_operands(ctx: &mut Context, op: &str) -> Result<(Num, Num), Thrown> {
    let lhs = ctx.stack.reg(1);
    let rhs = ctx.stack.reg(2);
    let Some(a) = classify(ctx, lhs) else {
        return Err(throw_not_numeric(ctx, op, lhs));
    };
    let Some(b) = classify(ctx, rhs) else {
        return Err(throw_not_numeric(ctx, op, rhs));
    };
    Ok((a, b))
}

fn finish_int(ctx: &mut Context, result: Option<i128>, op: &str) -> ExecResult {
    match result {
        Some(v) => {
            let val = make(ctx, v);
            ctx.stack.set_reg(0, val);
            Ok(())
        }
        None => Err(throw_overflow(ctx, op)),
    }
}

fn finish_float(ctx: &mut Context, result: f64) -> ExecResult {
    let val = float_obj::new(ctx, result);
    ctx.stack.set_reg(0, val);
    Ok(())
}

// ----- native methods ----------------------------------------------------
//
// Layout on entry: REG-1 = self, REG-2 = the other operand (binary only);
// the result goes to REG-0.

pub(crate) fn native_add(ctx: &mut Context) -> ExecResult {
    match binary_operands(ctx, "+")? {
        (Num::Int(a), Num::Int(b)) => finish_int(ctx, a.checked_add(b), "+"),
        (a, b) => finish_float(ctx, a.as_f64() + b.as_f64()),
    }
}

pub(crate) fn native_sub(ctx: &mut Context) -> ExecResult {
    match binary_operands(ctx, "-")? {
        (Num::Int(a), Num::Int(b)) => finish_int(ctx, a.checked_sub(b), "-"),
        (a, b) => finish_float(ctx, a.as_f64() - b.as_f64()),
    }
}

pub(crate) fn native_mul(ctx: &mut Context) -> ExecResult {
    match binary_operands(ctx, "*")? {
        (Num::Int(a), Num::Int(b)) => finish_int(ctx, a.checked_mul(b), "*"),
        (a, b) => finish_float(ctx, a.as_f64() * b.as_f64()),
    }
}

pub(crate) fn native_div(ctx: &mut Context) -> ExecResult {
    // Division always yields a Float, even between integers.
    let (a, b) = binary_operands(ctx, "/")?;
    finish_float(ctx, a.as_f64() / b.as_f64())
}

pub(crate) fn native_rem(ctx: &mut Context) -> ExecResult {
    match binary_operands(ctx, "%")? {
        (Num::Int(a), Num::Int(b)) => {
            if b == 0 {
                return Err(exception_obj::throw_format(
                    ctx,
                    "sys",
                    Value::SMALLINT_ZERO,
                    "remainder by zero".to_string(),
                ));
            }
            finish_int(ctx, a.checked_rem(b), "%")
        }
        (a, b) => finish_float(ctx, a.as_f64() % b.as_f64()),
    }
}

pub(crate) fn native_pow(ctx: &mut Context) -> ExecResult {
    match binary_operands(ctx, "**")? {
        (Num::Int(a), Num::Int(b)) if b >= 0 => {
            let exp = u32::try_from(b).ok();
            let result = exp.and_then(|e| a.checked_pow(e));
            finish_int(ctx, result, "**")
        }
        (a, b) => finish_float(ctx, a.as_f64().powf(b.as_f64())),
    }
}

fn shift_operands(ctx: &mut Context, op: &str) -> Result<(i128, u32), Thrown> {
    match binary_operands(ctx, op)? {
        (Num::Int(a), Num::Int(b)) => {
            if b < 0 {
                Err(throw_overflow(ctx, op))
            } else {
                match u32::try_from(b) {
                    Ok(sh) if sh < 128 => Ok((a, sh)),
                    _ => Err(throw_overflow(ctx, op)),
                }
            }
        }
        _ => {
            let lhs = ctx.stack.reg(1);
            Err(throw_not_numeric(ctx, op, lhs))
        }
    }
}

pub(crate) fn native_shl(ctx: &mut Context) -> ExecResult {
    let (a, sh) = shift_operands(ctx, "<<")?;
    let result = a.checked_shl(sh).filter(|r| r >> sh == a);
    finish_int(ctx, result, "<<")
}

pub(crate) fn native_shr(ctx: &mut Context) -> ExecResult {
    let (a, sh) = shift_operands(ctx, ">>")?;
    finish_int(ctx, Some(a >> sh), ">>")
}

fn bitwise_operands(ctx: &mut Context, op: &str) -> Result<(i128, i128), Thrown> {
    match binary_operands(ctx, op)? {
        (Num::Int(a), Num::Int(b)) => Ok((a, b)),
        _ => {
            let lhs = ctx.stack.reg(1);
            Err(throw_not_numeric(ctx, op, lhs))
        }
    }
}

pub(crate) fn native_bitand(ctx: &mut Context) -> ExecResult {
    let (a, b) = bitwise_operands(ctx, "&")?;
    finish_int(ctx, Some(a & b), "&")
}

pub(crate) fn native_bitor(ctx: &mut Context) -> ExecResult {
    let (a, b) = bitwise_operands(ctx, "|")?;
    finish_int(ctx, Some(a | b), "|")
}

pub(crate) fn native_bitxor(ctx: &mut Context) -> ExecResult {
    let (a, b) = bitwise_operands(ctx, "^")?;
    finish_int(ctx, Some(a ^ b), "^")
}

pub(crate) fn native_neg(ctx: &mut Context) -> ExecResult {
    let v = ctx.stack.reg(1);
    match classify(ctx, v) {
        Some(Num::Int(a)) => finish_int(ctx, a.checked_neg(), "-#"),
        Some(Num::Float(f)) => finish_float(ctx, -f),
        None => Err(throw_not_numeric(ctx, "-#", v)),
    }
}

pub(crate) fn native_bitnot(ctx: &mut Context) -> ExecResult {
    let v = ctx.stack.reg(1);
    match classify(ctx, v) {
        Some(Num::Int(a)) => finish_int(ctx, Some(!a), "~"),
        _ => Err(throw_not_numeric(ctx, "~", v)),
    }
}

pub(crate) fn native_cmp(ctx: &mut Context) -> ExecResult {
    let (a, b) = binary_operands(ctx, "<=>")?;
    let ord = match compare_nums(a, b) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    };
    ctx.stack.set_reg(0, Value::smallint(ord));
    Ok(())
}

pub(crate) fn native_equ(ctx: &mut Context) -> ExecResult {
    let lhs = ctx.stack.reg(1);
    let rhs = ctx.stack.reg(2);
    let eq = match (classify(ctx, lhs), classify(ctx, rhs)) {
        (Some(a), Some(b)) => compare_nums(a, b) == Ordering::Equal,
        _ => false,
    };
    let result = bool_obj::make(ctx, eq);
    ctx.stack.set_reg(0, result);
    Ok(())
}

pub(crate) fn native_hash(ctx: &mut Context) -> ExecResult {
    let v = ctx.stack.reg(1);
    let h = match classify(ctx, v) {
        Some(Num::Int(i)) => hash(i),
        Some(Num::Float(f)) => float_obj::hash(f),
        None => return Err(throw_not_numeric(ctx, "hash", v)),
    };
    ctx.stack.set_reg(0, Value::smallint(h as isize));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_compare_is_total() {
        let cases = [
            (Num::Int(1), Num::Int(2), Ordering::Less),
            (Num::Int(3), Num::Float(3.0), Ordering::Equal),
            (Num::Float(0.5), Num::Int(0), Ordering::Greater),
            (Num::Float(-0.0), Num::Float(0.0), Ordering::Equal),
        ];
        for (a, b, expect) in cases {
            assert_eq!(compare_nums(a, b), expect);
        }
        // NaN falls back to the IEEE total order rather than failing.
        let nan = Num::Float(f64::NAN);
        assert_ne!(compare_nums(nan, Num::Int(0)), Ordering::Equal);
    }

    #[test]
    fn int_hash_matches_float_hash_for_equal_values() {
        assert_eq!(hash(5), 5usize);
        assert_eq!(hash(1 << 80), float_obj::hash((1i128 << 80) as f64));
    }
}
