//! The `Symbol` type: an interned immutable byte sequence with a cached
//! hash.
//!
//! Symbols are created only through the registry in [`crate::symbols`],
//! which holds them weakly; the registry chain threads through the
//! `registry_next` slot.  Symbols are always allocated in old space.

use std::cmp::Ordering;

use crate::context::{Context, ExecResult};
use crate::mem::objmem::AllocHint;
use crate::util::constants::BYTES_IN_WORD;
use crate::util::hash::hash_bytes;

use super::bool_obj;
use super::exception_obj;
use super::type_obj::SizeSpec;
use super::value::{ObjRef, Value};

pub const LAYOUT: (SizeSpec, SizeSpec) = (SizeSpec::Fixed(1), SizeSpec::Extendable);

/// Slot index of the registry chain link.
pub(crate) const SLOT_REGISTRY_NEXT: usize = 0;

/// Fixed prefix of the bytes region: size word, cached hash, byte length.
const BYTES_FIXED_WORDS: usize = 3;

/// Allocate a symbol object.  Interning (and the registry chain) is the
/// caller's business; see [`crate::symbols::SymbolRegistry::intern`].
pub(crate) fn new_uninterned(ctx: &mut Context, text: &str) -> ObjRef {
    let ty = ctx.globals.type_symbol.as_obj();
    let ext_bytes = BYTES_FIXED_WORDS * BYTES_IN_WORD + text.len();
    let obj = ctx.mem.alloc_ex(AllocHint::Survivor, ty, 0, ext_bytes);
    obj.set_slot_no_barrier(SLOT_REGISTRY_NEXT, Value::SMALLINT_ZERO);
    unsafe {
        let base = obj.bytes_base();
        (base + BYTES_IN_WORD).store::<usize>(hash_bytes(text.as_bytes()));
        (base + 2 * BYTES_IN_WORD).store::<usize>(text.len());
        std::ptr::copy_nonoverlapping(
            text.as_ptr(),
            (base + BYTES_FIXED_WORDS * BYTES_IN_WORD).to_mut_ptr::<u8>(),
            text.len(),
        );
    }
    obj
}

/// The cached hash.
pub fn hash(v: Value) -> usize {
    unsafe { (v.as_obj().bytes_base() + BYTES_IN_WORD).load() }
}

pub fn byte_len(v: Value) -> usize {
    unsafe { (v.as_obj().bytes_base() + 2 * BYTES_IN_WORD).load() }
}

/// Borrow the text.  Only valid until the next allocation.
pub fn as_str(v: Value) -> &'static str {
    let obj = v.as_obj();
    let len = byte_len(v);
    unsafe {
        let data = (obj.bytes_base() + BYTES_FIXED_WORDS * BYTES_IN_WORD).to_ptr::<u8>();
        std::str::from_utf8_unchecked(std::slice::from_raw_parts(data, len))
    }
}

pub(crate) fn registry_next(sym: ObjRef) -> Value {
    sym.slot(SLOT_REGISTRY_NEXT)
}

pub(crate) fn set_registry_next(sym: ObjRef, next: Value) {
    // Symbols are old and so are their chain successors: no barrier needed.
    sym.set_slot_no_barrier(SLOT_REGISTRY_NEXT, next);
}

// ----- native methods ----------------------------------------------------

pub(crate) fn native_equ(ctx: &mut Context) -> ExecResult {
    // Interning makes equality pointer equality.
    let eq = ctx.stack.reg(1) == ctx.stack.reg(2);
    let result = bool_obj::make(ctx, eq);
    ctx.stack.set_reg(0, result);
    Ok(())
}

pub(crate) fn native_cmp(ctx: &mut Context) -> ExecResult {
    let lhs = ctx.stack.reg(1);
    let rhs = ctx.stack.reg(2);
    if !rhs.type_is(ctx.globals.type_symbol) {
        return Err(exception_obj::throw_format(
            ctx,
            "type",
            rhs,
            "unsupported operand for `<=>'".to_string(),
        ));
    }
    let ord = if lhs == rhs {
        0
    } else {
        match as_str(lhs).cmp(as_str(rhs)) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    };
    ctx.stack.set_reg(0, Value::smallint(ord));
    Ok(())
}

pub(crate) fn native_hash(ctx: &mut Context) -> ExecResult {
    let h = hash(ctx.stack.reg(1));
    ctx.stack.set_reg(0, Value::smallint(h as isize));
    Ok(())
}
