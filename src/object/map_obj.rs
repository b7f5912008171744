//! The `Map` type: a chained hash map.
//!
//! Buckets live in an `ArraySlots`; each entry is either the small-int 0
//! sentinel or the head of a singly linked chain of bucket nodes carrying
//! `(next, key, value)` slots and the cached key hash in bytes.  Key hashing
//! and equality go through the object protocol, so user-defined keys
//! dispatch methods (and may allocate); every walk therefore keeps its
//! cursor in a rooted stack slot.

use crate::context::{Context, ExecResult, Thrown};
use crate::mem::objmem;
use crate::util::constants::BYTES_IN_WORD;

use super::array_obj::slots as array_slots;
use super::exception_obj;
use super::protocol;
use super::symbol_obj;
use super::type_obj::SizeSpec;
use super::value::{ObjRef, Value};
use super::ObjectMeta;

pub const LAYOUT: (SizeSpec, SizeSpec) = (SizeSpec::Fixed(1), SizeSpec::Fixed(3 * BYTES_IN_WORD));

pub mod node {
    use super::*;

    pub const LAYOUT: (SizeSpec, SizeSpec) =
        (SizeSpec::Fixed(3), SizeSpec::Fixed(BYTES_IN_WORD));

    pub(super) const SLOT_NEXT: usize = 0;
    pub(super) const SLOT_KEY: usize = 1;
    pub(super) const SLOT_VALUE: usize = 2;
}

#[repr(C)]
struct MapObj {
    _meta: ObjectMeta,
    // --- SLOTS ---
    buckets: Value, // ArraySlots
    // --- BYTES ---
    node_count: usize,
    node_count_threshold: usize,
    load_factor: f64,
}

#[repr(C)]
struct MapNodeObj {
    _meta: ObjectMeta,
    // --- SLOTS ---
    next: Value, // node chain, small-int 0 terminated
    key: Value,
    value: Value,
    // --- BYTES ---
    key_hash: usize,
}

// Header (2 words) + 1 slot + 3 bytes-region words.
const_assert!(BYTES_IN_WORD != 8 || std::mem::size_of::<MapObj>() == 6 * 8);

/// Default load factor.
pub const DEFAULT_LOAD_FACTOR: f64 = 0.9;

const BUCKET_COUNT_MIN: usize = 4;

fn bucket_count_for(reserve: usize, load_factor: f64) -> usize {
    (((reserve as f64) / load_factor).ceil() as usize).max(BUCKET_COUNT_MIN)
}

fn threshold_for(bucket_count: usize, load_factor: f64) -> usize {
    (bucket_count as f64 * load_factor) as usize
}

/// Create an empty map.  `load_factor <= 0` selects the default; `reserve`
/// sizes the initial bucket array.
pub fn new(ctx: &mut Context, load_factor: f64, reserve: usize) -> Value {
    let load_factor = if load_factor > 0.0 {
        load_factor
    } else {
        DEFAULT_LOAD_FACTOR
    };
    let bucket_count = bucket_count_for(reserve.max(1), load_factor);
    let buckets = array_slots::new(ctx, bucket_count);
    let t = ctx.stack.alloc_temp(1);
    ctx.stack.set(t, buckets);
    let ty = ctx.globals.type_map.as_obj();
    let obj = ctx.mem.alloc(ty);
    let raw = unsafe { obj.deref::<MapObj>() };
    raw.buckets = ctx.stack.get(t);
    raw.node_count = 0;
    raw.node_count_threshold = threshold_for(bucket_count, load_factor);
    raw.load_factor = load_factor;
    objmem::write_barrier(obj, raw.buckets);
    ctx.stack.free_temp(1);
    Value::from_obj(obj)
}

/// Number of entries.
pub fn length(v: Value) -> usize {
    unsafe { v.as_obj().deref::<MapObj>() }.node_count
}

fn buckets_of(v: Value) -> Value {
    unsafe { v.as_obj().deref::<MapObj>() }.buckets
}

fn node_raw(v: Value) -> &'static mut MapNodeObj {
    unsafe { v.as_obj().deref::<MapNodeObj>() }
}

/// Look up by interned symbol.  Symbol identity makes this allocation-free,
/// which is what the hot method-lookup path needs.
pub fn sym_get(map: ObjRef, sym: Value) -> Option<Value> {
    let hash = symbol_obj::hash(sym);
    let buckets = unsafe { map.deref::<MapObj>() }.buckets;
    let index = hash % array_slots::length(buckets);
    let mut cursor = array_slots::get(buckets, index);
    while !cursor.is_smallint() {
        let node = node_raw(cursor);
        if node.key == sym {
            return Some(node.value);
        }
        cursor = node.next;
    }
    None
}

/// Find the node holding `key` (general protocol walk).  The cursor lives
/// in a temp register because key equality may dispatch user code and
/// collect.  Returns the node as a `Value`.
fn find_node(
    ctx: &mut Context,
    map_slot: usize,
    key_slot: usize,
    hash: usize,
) -> Result<Option<Value>, Thrown> {
    let map = ctx.stack.get(map_slot);
    let buckets = buckets_of(map);
    let index = hash % array_slots::length(buckets);
    let t = ctx.stack.alloc_temp(1);
    ctx.stack.set(t, array_slots::get(buckets, index));
    let result = loop {
        let cursor = ctx.stack.get(t);
        if cursor.is_smallint() {
            break Ok(None);
        }
        let node = node_raw(cursor);
        if node.key_hash == hash {
            let key = ctx.stack.get(key_slot);
            if node.key == key {
                break Ok(Some(cursor));
            }
            // Equality may dispatch user code and collect: `cursor` is dead
            // after this call, the rooted slot `t` is not.
            if protocol::equals(ctx, node.key, key) {
                break Ok(Some(ctx.stack.get(t)));
            }
        }
        let next = node_raw(ctx.stack.get(t)).next;
        ctx.stack.set(t, next);
    };
    ctx.stack.free_temp(1);
    result
}

/// Get the value for the key in `key_slot`.  `Ok(None)` when absent.
pub fn get(ctx: &mut Context, map_slot: usize, key_slot: usize) -> Result<Option<Value>, Thrown> {
    let key = ctx.stack.get(key_slot);
    let hash = protocol::hash(ctx, key)?;
    Ok(find_node(ctx, map_slot, key_slot, hash)?.map(|n| node_raw(n).value))
}

/// Add or update an entry.  Duplicate keys overwrite.  Rehashes (buckets
/// doubled) when the node count has reached the load-factor threshold and
/// the target bucket already collides.
pub fn set(ctx: &mut Context, map_slot: usize, key_slot: usize, val_slot: usize) -> Result<(), Thrown> {
    let key = ctx.stack.get(key_slot);
    let hash = protocol::hash(ctx, key)?;

    if let Some(found) = find_node(ctx, map_slot, key_slot, hash)? {
        let node = found.as_obj();
        node.set_slot(node::SLOT_VALUE, ctx.stack.get(val_slot));
        return Ok(());
    }

    let map = ctx.stack.get(map_slot);
    {
        let raw = unsafe { map.as_obj().deref::<MapObj>() };
        let buckets = raw.buckets;
        let index = hash % array_slots::length(buckets);
        if raw.node_count >= raw.node_count_threshold
            && !array_slots::get(buckets, index).is_smallint()
        {
            let new_count = array_slots::length(buckets) * 2;
            rehash(ctx, map_slot, new_count);
        }
    }

    // Make the node, then splice it in front of its bucket chain.
    let node_ty = ctx.globals.type_map_node.as_obj();
    let node_ref = ctx.mem.alloc(node_ty);
    let map = ctx.stack.get(map_slot); // re-read: the allocation may move things
    let raw = unsafe { map.as_obj().deref::<MapObj>() };
    let buckets = raw.buckets;
    let index = hash % array_slots::length(buckets);
    {
        let node = unsafe { node_ref.deref::<MapNodeObj>() };
        node.next = array_slots::get(buckets, index);
        node.key = ctx.stack.get(key_slot);
        node.value = ctx.stack.get(val_slot);
        node.key_hash = hash;
        objmem::write_barrier_n(node_ref, 0, 3);
    }
    array_slots::set(buckets, index, Value::from_obj(node_ref));
    raw.node_count += 1;
    Ok(())
}

/// Delete an entry.  `Ok(true)` when it existed.
pub fn unset(ctx: &mut Context, map_slot: usize, key_slot: usize) -> Result<bool, Thrown> {
    let key = ctx.stack.get(key_slot);
    let hash = protocol::hash(ctx, key)?;
    let Some(found) = find_node(ctx, map_slot, key_slot, hash)? else {
        return Ok(false);
    };

    // Re-walk the chain to find the predecessor; nothing below allocates.
    let map = ctx.stack.get(map_slot);
    let raw = unsafe { map.as_obj().deref::<MapObj>() };
    let buckets = raw.buckets;
    let index = hash % array_slots::length(buckets);
    let mut cursor = array_slots::get(buckets, index);
    let mut prev: Option<Value> = None;
    while cursor != found {
        debug_assert!(!cursor.is_smallint(), "node vanished from its bucket");
        prev = Some(cursor);
        cursor = node_raw(cursor).next;
    }
    let next = node_raw(found).next;
    match prev {
        Some(p) => p.as_obj().set_slot(node::SLOT_NEXT, next),
        None => array_slots::set(buckets, index, next),
    }
    raw.node_count -= 1;
    Ok(true)
}

/// Redistribute all nodes over `new_bucket_count` buckets.
pub fn rehash(ctx: &mut Context, map_slot: usize, new_bucket_count: usize) {
    let new_bucket_count = new_bucket_count.max(BUCKET_COUNT_MIN);
    let new_buckets = array_slots::new(ctx, new_bucket_count);
    let map = ctx.stack.get(map_slot); // re-read after the allocation
    let raw = unsafe { map.as_obj().deref::<MapObj>() };
    let old_buckets = raw.buckets;
    for i in 0..array_slots::length(old_buckets) {
        let mut cursor = array_slots::get(old_buckets, i);
        while !cursor.is_smallint() {
            let node = node_raw(cursor);
            let next = node.next;
            let index = node.key_hash % new_bucket_count;
            node.next = array_slots::get(new_buckets, index);
            objmem::write_barrier(cursor.as_obj(), node.next);
            array_slots::set(new_buckets, index, cursor);
            cursor = next;
        }
    }
    raw.buckets = new_buckets;
    objmem::write_barrier(map.as_obj(), new_buckets);
    raw.node_count_threshold = threshold_for(new_bucket_count, raw.load_factor);
    trace!("map rehashed to {} buckets", new_bucket_count);
}

/// Visit every entry, in bucket order.  Allocation-free; the callback must
/// not mutate the map.
pub fn for_each_entry<F: FnMut(Value, Value)>(map: ObjRef, mut f: F) {
    let buckets = unsafe { map.deref::<MapObj>() }.buckets;
    for i in 0..array_slots::length(buckets) {
        let mut cursor = array_slots::get(buckets, i);
        while !cursor.is_smallint() {
            let node = node_raw(cursor);
            f(node.key, node.value);
            cursor = node.next;
        }
    }
}

// ----- native methods ----------------------------------------------------

fn throw_key_missing(ctx: &mut Context, key: Value) -> Thrown {
    exception_obj::throw_format(ctx, "key", key, "key not found".to_string())
}

/// `[]`: REG-1 = map, REG-2 = key.  Missing keys raise a key exception.
pub(crate) fn native_get_element(ctx: &mut Context) -> ExecResult {
    let map_slot = ctx.stack.frame() + 1;
    let key_slot = ctx.stack.frame() + 2;
    match get(ctx, map_slot, key_slot)? {
        Some(v) => {
            ctx.stack.set_reg(0, v);
            Ok(())
        }
        None => {
            let key = ctx.stack.get(key_slot);
            Err(throw_key_missing(ctx, key))
        }
    }
}

/// `[]=` / `insert`: REG-1 = map, REG-2 = key, REG-3 = value.
pub(crate) fn native_set_element(ctx: &mut Context) -> ExecResult {
    let map_slot = ctx.stack.frame() + 1;
    let key_slot = ctx.stack.frame() + 2;
    let val_slot = ctx.stack.frame() + 3;
    set(ctx, map_slot, key_slot, val_slot)?;
    let nil = ctx.globals.val_nil;
    ctx.stack.set_reg(0, nil);
    Ok(())
}

/// `remove`: REG-1 = map, REG-2 = key.  Missing keys raise a key exception.
pub(crate) fn native_remove(ctx: &mut Context) -> ExecResult {
    let map_slot = ctx.stack.frame() + 1;
    let key_slot = ctx.stack.frame() + 2;
    if unset(ctx, map_slot, key_slot)? {
        let nil = ctx.globals.val_nil;
        ctx.stack.set_reg(0, nil);
        Ok(())
    } else {
        let key = ctx.stack.get(key_slot);
        Err(throw_key_missing(ctx, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::OBJECT_HEAD_SIZE;
    use memoffset::offset_of;

    // The overlays must line up with the uniform header + slots + bytes
    // layout the collector walks.
    #[test]
    fn overlay_layouts_match_the_object_model() {
        assert_eq!(offset_of!(MapObj, buckets), OBJECT_HEAD_SIZE);
        assert_eq!(offset_of!(MapObj, node_count), OBJECT_HEAD_SIZE + BYTES_IN_WORD);
        assert_eq!(offset_of!(MapNodeObj, next), OBJECT_HEAD_SIZE);
        assert_eq!(
            offset_of!(MapNodeObj, key_hash),
            OBJECT_HEAD_SIZE + 3 * BYTES_IN_WORD
        );
    }

    #[test]
    fn bucket_sizing() {
        assert_eq!(bucket_count_for(0, DEFAULT_LOAD_FACTOR), BUCKET_COUNT_MIN);
        let n = bucket_count_for(100, DEFAULT_LOAD_FACTOR);
        assert!(threshold_for(n, DEFAULT_LOAD_FACTOR) >= 100);
    }
}
