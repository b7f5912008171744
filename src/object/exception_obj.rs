//! The `Exception` type.
//!
//! An exception is a `(type, what, data)` triple: a symbol naming the kind
//! (`type`, `key`, `syntax`, `sys`, ...), a human-readable message string,
//! and an arbitrary payload.  While it propagates, the interpreter appends
//! one `(function, instruction offset)` pair per unwound frame to the
//! stack-trace array.

use crate::context::{Context, Thrown};
use crate::mem::objmem::AllocHint;

use super::array_obj;
use super::string_obj;
use super::type_obj::SizeSpec;
use super::value::Value;

pub const LAYOUT: (SizeSpec, SizeSpec) = (SizeSpec::Fixed(4), SizeSpec::Fixed(0));

const SLOT_KIND: usize = 0; // Symbol
const SLOT_WHAT: usize = 1; // String or nil
const SLOT_DATA: usize = 2; // arbitrary payload
const SLOT_TRACE: usize = 3; // small-int 0 until the first unwind

/// Build an exception and store it in REG-0, returning the [`Thrown`]
/// marker that propagates through `?`.
pub fn throw_format(ctx: &mut Context, kind: &str, data: Value, msg: String) -> Thrown {
    let t = ctx.stack.alloc_temp(3);
    ctx.stack.set(t, data);
    let kind_sym = crate::symbols::intern(ctx, kind);
    ctx.stack.set(t + 1, kind_sym);
    let what = string_obj::new(ctx, &msg);
    ctx.stack.set(t + 2, what);

    let ty = ctx.globals.type_exception.as_obj();
    let obj = ctx.mem.alloc_ex(AllocHint::Auto, ty, 0, 0);
    obj.set_slot_no_barrier(SLOT_KIND, ctx.stack.get(t + 1));
    obj.set_slot_no_barrier(SLOT_WHAT, ctx.stack.get(t + 2));
    obj.set_slot_no_barrier(SLOT_DATA, ctx.stack.get(t));
    obj.set_slot_no_barrier(SLOT_TRACE, Value::SMALLINT_ZERO);
    ctx.stack.free_temp(3);

    debug!("throw {}: {}", kind, msg);
    ctx.stack.set_reg(0, Value::from_obj(obj));
    Thrown
}

/// The kind symbol.
pub fn kind(v: Value) -> Value {
    v.as_obj().slot(SLOT_KIND)
}

/// The message.
pub fn what(v: Value) -> Value {
    v.as_obj().slot(SLOT_WHAT)
}

/// The payload.
pub fn data(v: Value) -> Value {
    v.as_obj().slot(SLOT_DATA)
}

/// Number of `(function, offset)` pairs collected so far.
pub fn stack_trace_len(v: Value) -> usize {
    let trace = v.as_obj().slot(SLOT_TRACE);
    if trace.is_smallint() {
        0
    } else {
        array_obj::length(trace) / 2
    }
}

/// One stack-trace entry.
pub fn stack_trace_entry(v: Value, index: usize) -> Option<(Value, u32)> {
    let trace = v.as_obj().slot(SLOT_TRACE);
    if trace.is_smallint() {
        return None;
    }
    let func = array_obj::get(trace, index * 2)?;
    let ip = array_obj::get(trace, index * 2 + 1)?;
    Some((func, ip.as_smallint() as u32))
}

/// Append the currently executing function and `ip` to the trace of the
/// exception held in stack slot `exc_slot`.
pub fn stack_trace_append(ctx: &mut Context, exc_slot: usize, ip: u32) {
    let exc = ctx.stack.get(exc_slot);
    debug_assert!(exc.type_is(ctx.globals.type_exception));
    if exc.as_obj().slot(SLOT_TRACE).is_smallint() {
        let trace = array_obj::new_with_capacity(ctx, 8);
        let exc = ctx.stack.get(exc_slot);
        exc.as_obj().set_slot(SLOT_TRACE, trace);
    }

    let t = ctx.stack.alloc_temp(2);
    let exc = ctx.stack.get(exc_slot);
    ctx.stack.set(t, exc.as_obj().slot(SLOT_TRACE));
    ctx.stack.set(t + 1, ctx.stack.current_function());
    array_obj::push(ctx, t, t + 1);
    ctx.stack.set(t + 1, Value::smallint(ip as isize));
    array_obj::push(ctx, t, t + 1);
    ctx.stack.free_temp(2);
}
