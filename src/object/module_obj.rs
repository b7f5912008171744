//! The `Module` type: named global variables plus parent modules.
//!
//! A module maps names (symbols) to indices into its variable vector; reads
//! that miss locally may fall back to the parents (one module, or an array
//! of them).

use crate::context::{Context, Thrown};
use crate::mem::objmem::{self, AllocHint};

use super::array_obj::{self, slots as array_slots};
use super::map_obj;
use super::type_obj::SizeSpec;
use super::value::{ObjRef, Value};

pub const LAYOUT: (SizeSpec, SizeSpec) = (SizeSpec::Fixed(3), SizeSpec::Fixed(0));

const SLOT_NAME_MAP: usize = 0; // Map { Symbol -> var index (small int) }
const SLOT_VARIABLES: usize = 1; // ArraySlots
const SLOT_PARENT: usize = 2; // small-int 0 / Module / Array of Modules

/// Create an empty module.
pub fn new(ctx: &mut Context) -> Value {
    let name_map = map_obj::new(ctx, 0.0, 8);
    let t = ctx.stack.alloc_temp(2);
    ctx.stack.set(t, name_map);
    let variables = array_slots::new(ctx, 0);
    ctx.stack.set(t + 1, variables);
    let ty = ctx.globals.type_module.as_obj();
    let obj = ctx.mem.alloc_ex(AllocHint::Survivor, ty, 0, 0);
    obj.set_slot(SLOT_NAME_MAP, ctx.stack.get(t));
    obj.set_slot(SLOT_VARIABLES, ctx.stack.get(t + 1));
    obj.set_slot(SLOT_PARENT, Value::SMALLINT_ZERO);
    ctx.stack.free_temp(2);
    Value::from_obj(obj)
}

/// Number of global variables.
pub fn var_count(module: ObjRef) -> usize {
    array_slots::length(module.slot(SLOT_VARIABLES))
}

/// Read a global by index.  No bounds checking beyond debug assertions.
pub fn get_i(module: ObjRef, index: usize) -> Value {
    array_slots::get(module.slot(SLOT_VARIABLES), index)
}

/// Write a global by index.
pub fn set_i(module: ObjRef, index: usize, value: Value) {
    array_slots::set(module.slot(SLOT_VARIABLES), index, value);
}

/// Index of a named global, if defined here.
pub fn find(module: ObjRef, name_sym: Value) -> Option<usize> {
    let idx = map_obj::sym_get(module.slot(SLOT_NAME_MAP).as_obj(), name_sym)?;
    debug_assert!(idx.is_smallint());
    Some(idx.as_smallint() as usize)
}

/// Read a named global defined in this module.
pub fn get(module: ObjRef, name_sym: Value) -> Option<Value> {
    find(module, name_sym).map(|i| get_i(module, i))
}

/// Define or update a named global.  Returns the variable index.  The
/// module, name symbol and value are read from stack slots: defining a new
/// name grows the variable vector and the name map.
pub fn set(
    ctx: &mut Context,
    module_slot: usize,
    name_slot: usize,
    val_slot: usize,
) -> Result<usize, Thrown> {
    let module = ctx.stack.get(module_slot).as_obj();
    let name = ctx.stack.get(name_slot);
    if let Some(index) = find(module, name) {
        set_i(module, index, ctx.stack.get(val_slot));
        return Ok(index);
    }

    // New variable: append storage, then bind the name.
    let index = var_count(module);
    let new_vars = array_slots::new(ctx, index + 1);
    let module = ctx.stack.get(module_slot).as_obj();
    {
        let old_vars = module.slot(SLOT_VARIABLES);
        let new_ref = new_vars.as_obj();
        for i in 0..index {
            new_ref.set_slot_no_barrier(1 + i, array_slots::get(old_vars, i));
        }
        objmem::write_barrier_n(new_ref, 1, index);
        module.set_slot(SLOT_VARIABLES, new_vars);
    }
    array_slots::set(module.slot(SLOT_VARIABLES), index, ctx.stack.get(val_slot));

    let t = ctx.stack.alloc_temp(2);
    let map = ctx.stack.get(module_slot).as_obj().slot(SLOT_NAME_MAP);
    ctx.stack.set(t, map);
    ctx.stack.set(t + 1, Value::smallint(index as isize));
    let bound = map_obj::set(ctx, t, name_slot, t + 1);
    ctx.stack.free_temp(2);
    bound?;
    Ok(index)
}

/// Register a parent module.  A second parent turns the slot into an array
/// of parents.
pub fn add_parent(ctx: &mut Context, module_slot: usize, parent_slot: usize) {
    let module = ctx.stack.get(module_slot).as_obj();
    let parent = module.slot(SLOT_PARENT);
    if parent.is_smallint() {
        let new_parent = ctx.stack.get(parent_slot);
        let module = ctx.stack.get(module_slot).as_obj();
        module.set_slot(SLOT_PARENT, new_parent);
        return;
    }
    if parent.type_is(ctx.globals.type_array) {
        let t = ctx.stack.alloc_temp(1);
        ctx.stack.set(t, parent);
        array_obj::push(ctx, t, parent_slot);
        ctx.stack.free_temp(1);
        return;
    }
    // One existing parent: build [old, new].
    let t = ctx.stack.alloc_temp(2);
    ctx.stack.set(t, parent);
    let arr = array_obj::new_from_stack(ctx, t, 1);
    ctx.stack.set(t + 1, arr);
    array_obj::push(ctx, t + 1, parent_slot);
    let module = ctx.stack.get(module_slot).as_obj();
    module.set_slot(SLOT_PARENT, ctx.stack.get(t + 1));
    ctx.stack.free_temp(2);
}

/// Look a name up in the direct parents.  Allocation-free.
pub fn parent_get(ctx: &Context, module: ObjRef, name_sym: Value) -> Option<Value> {
    let parent = module.slot(SLOT_PARENT);
    if parent.is_smallint() {
        return None;
    }
    if parent.type_is(ctx.globals.type_module) {
        return get(parent.as_obj(), name_sym);
    }
    debug_assert!(parent.type_is(ctx.globals.type_array));
    for i in 0..array_obj::length(parent) {
        let p = array_obj::get(parent, i)?;
        if let Some(v) = get(p.as_obj(), name_sym) {
            return Some(v);
        }
    }
    None
}
