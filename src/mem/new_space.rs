//! The young generation: two equal bump-allocated semispaces.
//!
//! Objects are first placed in the working chunk with state `NEW`.  A fast
//! collection copies survivors either into the other chunk (`NEW` → `MID`,
//! first survival) or into old space (`MID` → promotion), then the chunks
//! swap roles.  The GC pointer in the meta word is unused outside
//! collections; during them it carries the forwarding pointer.

use crate::object::value::ObjRef;
use crate::object::{GcState, OBJECT_HEAD_SIZE};
use crate::util::Address;

use super::chunk::{walk_objects, walk_objects_stashed, Chunk};
use super::objmem;
use super::old_space::{OldReallocCtx, OldSpace, OldSpaceIter};
use super::MemConfig;

pub struct NewSpace {
    working_chunk: Chunk,
    free_chunk: Chunk,
}

impl NewSpace {
    pub fn new(conf: &MemConfig) -> NewSpace {
        NewSpace {
            working_chunk: Chunk::create(conf.new_chunk_size),
            free_chunk: Chunk::create(conf.new_chunk_size),
        }
    }

    /// Allocate storage for an object.  On failure (space full), returns
    /// `None`; the caller runs a fast GC and retries.
    pub fn alloc(&mut self, ty: ObjRef, size: usize) -> Option<ObjRef> {
        debug_assert!(size >= OBJECT_HEAD_SIZE);
        let addr = self.working_chunk.alloc(size)?;
        let obj = unsafe { ObjRef::from_addr(addr) };
        obj.init_meta(GcState::New, 0, ty);
        Some(obj)
    }

    /// Bytes currently allocated in the working semispace.
    pub fn used_bytes(&self) -> usize {
        self.working_chunk.free_ptr() - self.working_chunk.mem_start()
    }

    pub fn capacity_bytes(&self) -> usize {
        self.working_chunk.end() - self.working_chunk.mem_start()
    }

    /// GC: swap the two semispaces.
    pub fn swap_chunks(&mut self) {
        std::mem::swap(&mut self.working_chunk, &mut self.free_chunk);
    }

    /// Fast GC: reallocate and copy the objects marked alive.
    ///
    /// `NEW` survivors go to the other semispace as `MID`; `MID` survivors
    /// are promoted into old space.  If old space refuses a promotion, the
    /// object stays `MID` in the other semispace and `false` is returned so
    /// the caller can force a full collection next cycle.  The new storage
    /// address is written into the old object's meta word as the forwarding
    /// pointer.
    pub fn realloc_and_copy_survivors(&mut self, old_space: &mut OldSpace) -> bool {
        let to_chunk = self.free_chunk;
        to_chunk.reset();

        let mut old_space_is_full = false;
        unsafe {
            walk_objects(
                self.working_chunk.mem_start(),
                self.working_chunk.free_ptr(),
                |obj, size| {
                    debug_assert!(obj.is_young());
                    if !obj.test_gc_mark() {
                        // Object dies here.
                        return;
                    }
                    let ty = obj.type_of();
                    let new_obj = if obj.gc_state() == GcState::New {
                        Self::evacuate_within(to_chunk, ty, size)
                    } else if old_space_is_full {
                        Self::evacuate_within(to_chunk, ty, size)
                    } else {
                        match old_space.alloc(ty, size) {
                            Some(promoted) => promoted,
                            None => {
                                old_space_is_full = true;
                                Self::evacuate_within(to_chunk, ty, size)
                            }
                        }
                    };
                    obj.set_gc_ptr(new_obj.addr().as_usize());
                    debug_assert!(
                        new_obj.addr() < obj.addr() || new_obj.addr() >= obj.addr() + size
                    );
                    std::ptr::copy_nonoverlapping::<u8>(
                        (obj.addr() + OBJECT_HEAD_SIZE).to_ptr(),
                        (new_obj.addr() + OBJECT_HEAD_SIZE).to_mut_ptr(),
                        size - OBJECT_HEAD_SIZE,
                    );
                },
            );
        }

        !old_space_is_full
    }

    fn evacuate_within(to_chunk: Chunk, ty: ObjRef, size: usize) -> ObjRef {
        // The destination semispace has the same capacity, so survivors of
        // the working chunk always fit.
        let addr = to_chunk.alloc(size).expect("semispace evacuation overflow");
        let obj = unsafe { ObjRef::from_addr(addr) };
        obj.init_meta(GcState::Mid, 0, ty);
        obj
    }

    /// Full GC: reserve new storage for survivors without copying.  The
    /// rules match [`NewSpace::realloc_and_copy_survivors`], except that
    /// `MID` promotions go through the old-space reallocation cursor.  Dead
    /// objects get their size stashed in the GC pointer for the later walks.
    pub fn realloc_survivors(&mut self, old_space: &mut OldSpace, iter: &mut OldSpaceIter) {
        let to_chunk = self.free_chunk;
        to_chunk.reset();

        unsafe {
            walk_objects(
                self.working_chunk.mem_start(),
                self.working_chunk.free_ptr(),
                |obj, size| {
                    debug_assert!(obj.is_young());
                    if !obj.test_gc_mark() {
                        // Object dies here; keep its size readable.
                        obj.set_gc_ptr(size);
                        return;
                    }
                    let new_mem = if obj.gc_state() == GcState::New {
                        to_chunk.alloc(size).expect("semispace evacuation overflow")
                    } else {
                        old_space.pre_alloc(iter, size)
                    };
                    obj.set_gc_ptr(new_mem.as_usize());
                },
            );
        }
    }

    /// Fast GC: update references in the newly copied objects.  Call after
    /// the semispace swap: the working chunk is the destination.
    pub fn update_references(&mut self) {
        unsafe {
            walk_objects(
                self.working_chunk.mem_start(),
                self.working_chunk.free_ptr(),
                |obj, _size| objmem::move_object_slots(obj),
            );
        }
    }

    /// Full GC: update references in marked objects (still in the source
    /// semispace; nothing has moved yet).
    pub fn update_marked_references(&mut self) {
        unsafe {
            walk_objects_stashed(
                self.working_chunk.mem_start(),
                self.working_chunk.free_ptr(),
                |obj, _size, marked| {
                    if marked {
                        objmem::move_object_slots(obj);
                    }
                },
            );
        }
    }

    /// Full GC: move survivors to the storage reserved by
    /// [`NewSpace::realloc_survivors`].
    pub fn move_marked_objects(&mut self, old_space: &OldSpace, ctx: &mut OldReallocCtx) {
        unsafe {
            walk_objects_stashed(
                self.working_chunk.mem_start(),
                self.working_chunk.free_ptr(),
                |obj, size, marked| {
                    if !marked {
                        return;
                    }
                    obj.reset_gc_mark();
                    let new_obj = ObjRef::from_addr(Address::from_usize(obj.gc_ptr()));
                    let ty = obj.type_of();
                    if obj.gc_state() == GcState::New {
                        new_obj.init_meta(GcState::Mid, 0, ty);
                    } else {
                        old_space.init_reallocated_meta(ctx, new_obj, ty);
                    }
                    std::ptr::copy_nonoverlapping::<u8>(
                        (obj.addr() + OBJECT_HEAD_SIZE).to_ptr(),
                        (new_obj.addr() + OBJECT_HEAD_SIZE).to_mut_ptr(),
                        size - OBJECT_HEAD_SIZE,
                    );
                },
            );
        }
    }

    #[cfg(debug_assertions)]
    pub fn post_gc_check(&self) -> Result<(), &'static str> {
        let mut err = None;
        unsafe {
            walk_objects(
                self.working_chunk.mem_start(),
                self.working_chunk.free_ptr(),
                |obj, _size| {
                    if !obj.is_young() {
                        err = Some("non-young object in new space");
                    } else if obj.test_gc_mark() {
                        err = Some("marked object in new space after GC");
                    }
                },
            );
        }
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn dump_usage(&self) {
        debug!(
            "new space: working {} / {} bytes used",
            self.used_bytes(),
            self.capacity_bytes()
        );
    }
}

impl Drop for NewSpace {
    fn drop(&mut self) {
        self.working_chunk.destroy();
        self.free_chunk.destroy();
    }
}
