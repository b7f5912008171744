//! The `String` type: an immutable UTF-8 byte sequence with cached lengths.

use std::cmp::Ordering;

use crate::context::{Context, ExecResult};
use crate::util::constants::BYTES_IN_WORD;
use crate::util::hash::hash_bytes;

use super::exception_obj;
use super::type_obj::SizeSpec;
use super::value::{ObjRef, Value};
use super::bool_obj;

pub const LAYOUT: (SizeSpec, SizeSpec) = (SizeSpec::Fixed(0), SizeSpec::Extendable);

/// Fixed prefix of the bytes region: size word, byte length, character
/// length.
const BYTES_FIXED_WORDS: usize = 3;

/// Create a `String` from UTF-8 text.
pub fn new(ctx: &mut Context, s: &str) -> Value {
    new_raw(ctx, s.as_bytes(), s.chars().count())
}

/// Create a `String` carrying raw bytes (the embedder's byte-string
/// scalar).  The cached character length falls back to the byte count.
pub fn new_bytes(ctx: &mut Context, bytes: &[u8]) -> Value {
    new_raw(ctx, bytes, bytes.len())
}

fn new_raw(ctx: &mut Context, bytes: &[u8], char_len: usize) -> Value {
    let ty = ctx.globals.type_string.as_obj();
    let ext_bytes = BYTES_FIXED_WORDS * BYTES_IN_WORD + bytes.len();
    let obj = ctx
        .mem
        .alloc_ex(crate::mem::objmem::AllocHint::Auto, ty, 0, ext_bytes);
    unsafe {
        let base = obj.bytes_base();
        (base + BYTES_IN_WORD).store::<usize>(bytes.len());
        (base + 2 * BYTES_IN_WORD).store::<usize>(char_len);
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            (base + BYTES_FIXED_WORDS * BYTES_IN_WORD).to_mut_ptr::<u8>(),
            bytes.len(),
        );
    }
    Value::from_obj(obj)
}

/// Length in bytes.
pub fn byte_len(v: Value) -> usize {
    unsafe { (v.as_obj().bytes_base() + BYTES_IN_WORD).load() }
}

/// Length in characters (cached at construction).
pub fn char_len(v: Value) -> usize {
    unsafe { (v.as_obj().bytes_base() + 2 * BYTES_IN_WORD).load() }
}

/// Borrow the raw bytes.  The borrow is only valid until the next
/// allocation: a collection may move the object under it.
pub fn as_bytes(v: Value) -> &'static [u8] {
    let obj = v.as_obj();
    let len = byte_len(v);
    unsafe {
        let data = (obj.bytes_base() + BYTES_FIXED_WORDS * BYTES_IN_WORD).to_ptr::<u8>();
        std::slice::from_raw_parts(data, len)
    }
}

/// Borrow the text.  The caller must know the content is UTF-8 (everything
/// built through [`new`] is; byte-strings may not be).  Same lifetime
/// caveat as [`as_bytes`].
pub fn as_str(v: Value) -> &'static str {
    unsafe { std::str::from_utf8_unchecked(as_bytes(v)) }
}

pub fn hash(v: Value) -> usize {
    hash_bytes(as_str(v).as_bytes())
}

fn expect_string(ctx: &mut Context, v: Value) -> Result<ObjRef, crate::context::Thrown> {
    if v.type_is(ctx.globals.type_string) {
        Ok(v.as_obj())
    } else {
        Err(exception_obj::throw_format(
            ctx,
            "type",
            v,
            "not a String".to_string(),
        ))
    }
}

// ----- native methods ----------------------------------------------------

pub(crate) fn native_equ(ctx: &mut Context) -> ExecResult {
    let lhs = ctx.stack.reg(1);
    let rhs = ctx.stack.reg(2);
    let eq = lhs == rhs
        || (rhs.type_is(ctx.globals.type_string) && as_str(lhs) == as_str(rhs));
    let result = bool_obj::make(ctx, eq);
    ctx.stack.set_reg(0, result);
    Ok(())
}

pub(crate) fn native_cmp(ctx: &mut Context) -> ExecResult {
    let lhs = ctx.stack.reg(1);
    let rhs = ctx.stack.reg(2);
    expect_string(ctx, rhs)?;
    let ord = match as_str(lhs).cmp(as_str(rhs)) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    };
    ctx.stack.set_reg(0, Value::smallint(ord));
    Ok(())
}

pub(crate) fn native_hash(ctx: &mut Context) -> ExecResult {
    let h = hash(ctx.stack.reg(1));
    ctx.stack.set_reg(0, Value::smallint(h as isize));
    Ok(())
}

/// `+` concatenates.
pub(crate) fn native_add(ctx: &mut Context) -> ExecResult {
    let rhs = ctx.stack.reg(2);
    expect_string(ctx, rhs)?;
    // Copy out before allocating: the operands may move.
    let mut text = String::with_capacity(byte_len(ctx.stack.reg(1)) + byte_len(rhs));
    text.push_str(as_str(ctx.stack.reg(1)));
    text.push_str(as_str(rhs));
    let result = new(ctx, &text);
    ctx.stack.set_reg(0, result);
    Ok(())
}
