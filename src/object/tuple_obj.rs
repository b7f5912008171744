//! The `Tuple` type: an immutable slot vector.
//!
//! Extendable-slots layout: slot 0 holds the total slot count (including
//! itself) as a small int, so a tuple of length `n` occupies `n + 1` slots.

use crate::context::{Context, ExecResult};
use crate::mem::objmem::{self, AllocHint};

use super::exception_obj;
use super::int_obj;
use super::type_obj::SizeSpec;
use super::value::{ObjRef, Value};

pub const LAYOUT: (SizeSpec, SizeSpec) = (SizeSpec::Extendable, SizeSpec::Fixed(0));

/// Number of elements.
pub fn length(v: Value) -> usize {
    let header = v.as_obj().slot(0);
    debug_assert!(header.is_smallint());
    header.as_smallint() as usize - 1
}

/// Element access.  `index` must be below [`length`].
pub fn get(v: Value, index: usize) -> Value {
    debug_assert!(index < length(v));
    v.as_obj().slot(1 + index)
}

/// Create a tuple of `count` elements, all small-int zero.  The caller
/// fills the elements with [`set_uninit`] before the tuple escapes.
pub fn new_uninit(ctx: &mut Context, count: usize) -> Value {
    let ty = ctx.globals.type_tuple.as_obj();
    let obj = ctx.mem.alloc_ex(AllocHint::Auto, ty, 1 + count, 0);
    for i in 0..count {
        obj.set_slot_no_barrier(1 + i, Value::SMALLINT_ZERO);
    }
    Value::from_obj(obj)
}

/// Fill one element of a tuple under construction.
pub fn set_uninit(v: Value, index: usize, element: Value) {
    debug_assert!(index < length(v));
    v.as_obj().set_slot(1 + index, element);
}

/// Build a tuple from `count` consecutive stack slots starting at
/// `src_slot` (absolute).  Reading from the stack after the allocation
/// keeps the elements correct across a collection.
pub fn new_from_stack(ctx: &mut Context, src_slot: usize, count: usize) -> Value {
    let v = new_uninit(ctx, count);
    let obj = v.as_obj();
    for i in 0..count {
        obj.set_slot_no_barrier(1 + i, ctx.stack.get(src_slot + i));
    }
    objmem::write_barrier_n(obj, 1, count);
    v
}

/// Copy the elements of a tuple (or an `ArraySlots`: same layout) into a
/// freshly made tuple, starting at element `from`.  `src_slot` names a
/// stack slot holding the source, so it survives the allocation.
pub fn new_from_packed_tail(ctx: &mut Context, src_slot: usize, from: usize, count: usize) -> Value {
    let v = new_uninit(ctx, count);
    let obj = v.as_obj();
    let src: ObjRef = ctx.stack.get(src_slot).as_obj();
    for i in 0..count {
        obj.set_slot_no_barrier(1 + i, src.slot(1 + from + i));
    }
    objmem::write_barrier_n(obj, 1, count);
    v
}

// ----- native methods ----------------------------------------------------

/// `[]`: REG-1 = tuple, REG-2 = index.
pub(crate) fn native_get_element(ctx: &mut Context) -> ExecResult {
    let tup = ctx.stack.reg(1);
    let key = ctx.stack.reg(2);
    let index = match int_obj::to_i128(ctx, key) {
        Some(i) if i >= 0 && (i as usize) < length(tup) => i as usize,
        _ => {
            return Err(exception_obj::throw_format(
                ctx,
                "key",
                key,
                "index out of range".to_string(),
            ))
        }
    };
    let v = get(ctx.stack.reg(1), index);
    ctx.stack.set_reg(0, v);
    Ok(())
}
