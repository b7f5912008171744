//! The `Nil` and `Bool` singletons.
//!
//! Both types are plain headers with no slots and no bytes; identity is the
//! value.  The canonical instances live in the context globals and are
//! allocated in old space at startup.

use crate::context::{Context, ExecResult};
use crate::mem::objmem::AllocHint;

use super::type_obj::SizeSpec;
use super::value::Value;

pub const LAYOUT: (SizeSpec, SizeSpec) = (SizeSpec::Fixed(0), SizeSpec::Fixed(0));

/// Allocate a singleton instance of a header-only type.
pub(crate) fn new_singleton(ctx: &mut Context, ty: Value) -> Value {
    let obj = ctx.mem.alloc_ex(AllocHint::Survivor, ty.as_obj(), 0, 0);
    Value::from_obj(obj)
}

/// The canonical boolean for `b`.
pub fn make(ctx: &Context, b: bool) -> Value {
    if b {
        ctx.globals.val_true
    } else {
        ctx.globals.val_false
    }
}

/// `Some(b)` if `v` is a canonical boolean.
pub fn read(ctx: &Context, v: Value) -> Option<bool> {
    if v == ctx.globals.val_true {
        Some(true)
    } else if v == ctx.globals.val_false {
        Some(false)
    } else {
        None
    }
}

// Hash constants for the identity singletons.  Object addresses cannot be
// used: a full GC may move the singletons, and hashes must survive GC.
pub(crate) const NIL_HASH: usize = 0;
pub(crate) const FALSE_HASH: usize = 2;
pub(crate) const TRUE_HASH: usize = 3;

// ----- native methods ----------------------------------------------------

pub(crate) fn native_equ(ctx: &mut Context) -> ExecResult {
    let eq = ctx.stack.reg(1) == ctx.stack.reg(2);
    let result = make(ctx, eq);
    ctx.stack.set_reg(0, result);
    Ok(())
}

pub(crate) fn native_hash(ctx: &mut Context) -> ExecResult {
    let v = ctx.stack.reg(1);
    let h = if v == ctx.globals.val_true {
        TRUE_HASH
    } else if v == ctx.globals.val_false {
        FALSE_HASH
    } else {
        NIL_HASH
    };
    ctx.stack.set_reg(0, Value::smallint(h as isize));
    Ok(())
}
