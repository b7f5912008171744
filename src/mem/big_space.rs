//! Large objects: individually allocated, collected by mark-sweep.
//!
//! All big objects sit on a singly linked list threaded through meta word 1.
//! Bit 2 of that word is the per-object "contains young reference" flag (the
//! big-space analogue of a remembered set); the pointer payload above it is
//! the next object in the list.  Nothing in this space ever moves.

use crate::object::value::ObjRef;
use crate::object::{GcState, OBJECT_HEAD_SIZE};
use crate::util::memory;
use crate::util::Address;

use super::objmem;
use super::MemConfig;

const YOUNG_REF_FLAG: usize = 0b100;
const NEXT_PTR_MASK: usize = !0b111;

fn unpack(gc_ptr: usize) -> (Option<ObjRef>, bool) {
    let next = gc_ptr & NEXT_PTR_MASK;
    let has_young = gc_ptr & YOUNG_REF_FLAG != 0;
    let next = if next == 0 {
        None
    } else {
        Some(unsafe { ObjRef::from_addr(Address::from_usize(next)) })
    };
    (next, has_young)
}

fn pack(next: Option<ObjRef>, has_young: bool) -> usize {
    let next = next.map_or(0, |o| o.addr().as_usize());
    debug_assert_eq!(next & !NEXT_PTR_MASK, 0);
    next | if has_young { YOUNG_REF_FLAG } else { 0 }
}

/// Write barrier slow path: flag `obj` as containing a young reference.
pub fn remember_object(obj: ObjRef) {
    debug_assert_eq!(obj.gc_state(), GcState::Big);
    obj.set_gc_ptr(obj.gc_ptr() | YOUNG_REF_FLAG);
}

pub struct BigSpace {
    allocated_size: usize,
    threshold_size: usize,
    size_limit: usize,
    first: Option<ObjRef>,
}

impl BigSpace {
    pub fn new(conf: &MemConfig) -> BigSpace {
        BigSpace {
            allocated_size: 0,
            threshold_size: conf.big_threshold_init,
            size_limit: conf.big_size_limit,
            first: None,
        }
    }

    pub fn allocated_size(&self) -> usize {
        self.allocated_size
    }

    pub fn size_limit(&self) -> usize {
        self.size_limit
    }

    /// Grow the collection threshold so that an allocation of `size` more
    /// bytes can succeed.  Used after a full GC still left no room.
    pub fn raise_threshold_for(&mut self, size: usize) {
        self.threshold_size = self.allocated_size + size;
    }

    /// Allocate storage for an object.  Fails when the space would exceed
    /// its collection threshold; the caller runs a full GC and retries.
    pub fn alloc(&mut self, ty: ObjRef, size: usize) -> Option<ObjRef> {
        debug_assert!(size >= OBJECT_HEAD_SIZE);
        let new_allocated = self.allocated_size + size;
        if new_allocated > self.threshold_size {
            return None;
        }
        self.allocated_size = new_allocated;
        let addr = memory::mem_alloc(size);
        debug_assert!(addr.is_aligned_to(8));
        let obj = unsafe { ObjRef::from_addr(addr) };
        obj.init_meta(GcState::Big, pack(self.first, false), ty);
        self.first = Some(obj);
        Some(obj)
    }

    fn for_each<F: FnMut(ObjRef, bool)>(&self, mut f: F) {
        let mut cursor = self.first;
        while let Some(obj) = cursor {
            // Read the link before the callback: it may rewrite the word.
            let (next, has_young) = unpack(obj.gc_ptr());
            f(obj, has_young);
            cursor = next;
        }
    }

    /// Fast GC: mark young objects referenced from flagged objects.
    /// Returns the number of flagged objects found.
    pub fn mark_remembered_young(&mut self) -> usize {
        let mut count = 0;
        self.for_each(|obj, has_young| {
            if has_young {
                count += 1;
                debug_assert!(!obj.is_young());
                objmem::mark_object_slots_o2y(obj);
            }
        });
        count
    }

    /// Fast GC: update references in flagged objects and clear the flags.
    pub fn update_remembered_and_forget(&mut self, hint_max_count: usize) {
        let mut count = 0;
        let mut cursor = self.first;
        while let Some(obj) = cursor {
            if count >= hint_max_count {
                break;
            }
            let (next, has_young) = unpack(obj.gc_ptr());
            if has_young {
                count += 1;
                objmem::move_object_slots(obj);
                obj.set_gc_ptr(pack(next, false));
            }
            cursor = next;
        }
    }

    /// Full GC: free unreachable objects; clear the mark bits and young-ref
    /// flags of the survivors.
    pub fn sweep(&mut self) {
        let mut freed_size = 0;
        // `prev` is the location holding the link to the current object.
        let mut cursor = self.first;
        let mut prev: Option<ObjRef> = None;
        while let Some(obj) = cursor {
            let (next, has_young) = unpack(obj.gc_ptr());
            if obj.test_gc_mark() {
                obj.reset_gc_mark();
                if has_young {
                    obj.set_gc_ptr(pack(next, false));
                }
                prev = Some(obj);
            } else {
                // Object dies here: unlink, then free the storage.
                freed_size += obj.size();
                match prev {
                    Some(p) => {
                        let (_, p_young) = unpack(p.gc_ptr());
                        p.set_gc_ptr(pack(next, p_young));
                    }
                    None => self.first = next,
                }
                memory::mem_free(obj.addr());
            }
            cursor = next;
        }
        debug_assert!(freed_size <= self.allocated_size);
        self.allocated_size -= freed_size;
        trace!("big space sweep freed {} bytes", freed_size);
    }

    /// Full GC: update references held by the (surviving) objects.
    pub fn update_references(&mut self) {
        self.for_each(|obj, _has_young| objmem::move_object_slots(obj));
    }

    #[cfg(debug_assertions)]
    pub fn post_gc_check(&self) -> Result<(), &'static str> {
        let mut err = None;
        self.for_each(|obj, has_young| {
            if has_young {
                err = Some("big object keeps its young-ref flag after GC");
            } else if obj.gc_state() != GcState::Big {
                err = Some("non-BIG object in big space");
            } else if obj.test_gc_mark() {
                err = Some("marked big object after GC");
            }
        });
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn dump_usage(&self) {
        debug!(
            "big space: {} / {} bytes allocated",
            self.allocated_size, self.threshold_size
        );
    }
}

impl Drop for BigSpace {
    fn drop(&mut self) {
        let mut cursor = self.first;
        while let Some(obj) = cursor {
            let (next, _) = unpack(obj.gc_ptr());
            memory::mem_free(obj.addr());
            cursor = next;
        }
    }
}
