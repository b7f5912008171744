//! The interned-symbol registry.
//!
//! A chained hash set of `Symbol` objects, referenced only weakly: the
//! registry is registered as a weak-reference container, so symbols nobody
//! else holds are reclaimed by a full collection.  Chains thread through a
//! slot inside the symbol objects themselves; the registry's own references
//! are the bucket heads.  (The in-object chain links are ordinary slots and
//! are relocated by the space walkers — the container only maintains the
//! heads, and excises dead entries during the finalize pass, which runs
//! before anything moves.)

use crate::context::Context;
use crate::mem::objmem::{self, WeakVisitOp};
use crate::object::symbol_obj;
use crate::object::value::{ObjRef, Value};
use crate::util::hash::hash_bytes;

const LOAD_FACTOR: f64 = 0.9;
const INIT_CAPACITY: usize = 500;

pub struct SymbolRegistry {
    buckets: Vec<Value>, // Symbol chain heads; small-int 0 when empty
    symbol_count: usize,
    symbol_count_threshold: usize,
}

impl SymbolRegistry {
    pub fn new() -> Box<SymbolRegistry> {
        let mut sr = Box::new(SymbolRegistry {
            buckets: Vec::new(),
            symbol_count: 0,
            symbol_count_threshold: 0,
        });
        sr.resize(INIT_CAPACITY);
        sr
    }

    pub fn len(&self) -> usize {
        self.symbol_count
    }

    pub fn is_empty(&self) -> bool {
        self.symbol_count == 0
    }

    fn resize(&mut self, new_symbol_count_max: usize) {
        let new_bucket_count = ((new_symbol_count_max as f64) / LOAD_FACTOR).ceil() as usize;
        let mut new_buckets = vec![Value::SMALLINT_ZERO; new_bucket_count];
        for &head in &self.buckets {
            let mut cursor = head;
            while !cursor.is_smallint() {
                let sym = cursor.as_obj();
                let next = symbol_obj::registry_next(sym);
                let index = symbol_obj::hash(cursor) % new_bucket_count;
                symbol_obj::set_registry_next(sym, new_buckets[index]);
                new_buckets[index] = cursor;
                cursor = next;
            }
        }
        self.buckets = new_buckets;
        self.symbol_count_threshold = new_symbol_count_max;
        info!("symbol registry resized (max {})", new_symbol_count_max);
    }

    fn find(&self, text: &str) -> Option<Value> {
        let hash = hash_bytes(text.as_bytes());
        let index = hash % self.buckets.len();
        let mut cursor = self.buckets[index];
        while !cursor.is_smallint() {
            if symbol_obj::hash(cursor) == hash && symbol_obj::as_str(cursor) == text {
                return Some(cursor);
            }
            cursor = symbol_obj::registry_next(cursor.as_obj());
        }
        None
    }

    fn add(&mut self, sym: ObjRef) {
        debug_assert!(!sym.is_young());
        let sym_v = Value::from_obj(sym);
        let mut index = symbol_obj::hash(sym_v) % self.buckets.len();
        if self.symbol_count >= self.symbol_count_threshold && !self.buckets[index].is_smallint() {
            self.resize(self.symbol_count_threshold * 2);
            index = symbol_obj::hash(sym_v) % self.buckets.len();
        }
        debug_assert!(symbol_obj::registry_next(sym).is_smallint());
        symbol_obj::set_registry_next(sym, self.buckets[index]);
        self.buckets[index] = sym_v;
        self.symbol_count += 1;
        trace!("new symbol `{}'", symbol_obj::as_str(sym_v));
    }

    /// Weak-reference visitor.  Finalize excises symbols the collector did
    /// not mark; Move relocates the bucket heads (chain links inside the
    /// symbols are object slots and are moved by the space walkers).
    ///
    /// # Safety
    /// `ptr` must be the address of a live `SymbolRegistry` registered with
    /// the object memory.
    pub unsafe fn weak_visitor(ptr: *mut u8, op: WeakVisitOp) {
        let sr = &mut *(ptr as *mut SymbolRegistry);
        match op {
            WeakVisitOp::FinalizeYoung => {
                // Symbols are always old; a fast collection frees none.
            }
            WeakVisitOp::Finalize => {
                let mut freed = 0usize;
                for head in sr.buckets.iter_mut() {
                    // Walk with an excising cursor: `head` first, then each
                    // predecessor's chain slot.
                    let mut slot: *mut Value = head;
                    while !(*slot).is_smallint() {
                        if objmem::visit_weak_ref(slot, op) {
                            let dead = *slot;
                            trace!("free symbol `{}'", symbol_obj::as_str(dead));
                            *slot = symbol_obj::registry_next(dead.as_obj());
                            freed += 1;
                        } else {
                            let sym = (*slot).as_obj();
                            slot = sym.slot_addr(symbol_obj::SLOT_REGISTRY_NEXT).to_mut_ptr();
                        }
                    }
                }
                debug_assert!(freed <= sr.symbol_count);
                sr.symbol_count -= freed;
                if freed > 0 {
                    debug!("{} symbols freed, {} left", freed, sr.symbol_count);
                }
            }
            WeakVisitOp::Move => {
                for head in sr.buckets.iter_mut() {
                    if !head.is_smallint() {
                        objmem::visit_weak_ref(head, op);
                    }
                }
            }
        }
    }
}

/// Intern a byte sequence: equal text always yields the pointer-identical
/// symbol.
pub fn intern(ctx: &mut Context, text: &str) -> Value {
    if let Some(sym) = ctx.symbols.find(text) {
        return sym;
    }
    let sym = symbol_obj::new_uninterned(ctx, text);
    ctx.symbols.add(sym);
    Value::from_obj(sym)
}
