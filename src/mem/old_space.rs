//! The old generation: a list of fixed-size chunks collected by mark-compact.
//!
//! The first allocation in every chunk is a two-word [`ChunkMeta`]: a pointer
//! to the chunk's lazily created remembered set, and a cursor slot used only
//! while compacting.  Old objects keep the address of their chunk's meta in
//! meta word 1, which is how the write barrier finds the remembered set
//! without consulting the space.

use crate::object::value::ObjRef;
use crate::object::{GcState, OBJECT_HEAD_SIZE};
use crate::util::bitset::Bitset;
use crate::util::constants::{BYTES_IN_WORD, LOG_BYTES_IN_WORD};
use crate::util::Address;

use super::chunk::{walk_objects, walk_objects_stashed, Chunk, CHUNK_HEADER_BYTES};
use super::objmem;
use super::MemConfig;

/// Bits covered by one lazily allocated remembered-set bucket.
pub const REMEMBERED_SET_BUCKET_BITS: usize = 1024;

/// Remembered set for one chunk.  Records word offsets (relative to the
/// chunk meta) of objects that may hold references to young objects.
pub struct RememberedSet {
    buckets: Box<[Option<Box<Bitset>>]>,
}

impl RememberedSet {
    fn new(chunk_size: usize) -> RememberedSet {
        let bucket_count = chunk_size / BYTES_IN_WORD / REMEMBERED_SET_BUCKET_BITS;
        let mut buckets = Vec::with_capacity(bucket_count);
        buckets.resize_with(bucket_count, || None);
        RememberedSet {
            buckets: buckets.into_boxed_slice(),
        }
    }

    /// Record a byte offset (word-aligned, relative to the chunk meta).
    fn record(&mut self, offset: usize) {
        debug_assert_eq!(offset % BYTES_IN_WORD, 0);
        let word = offset >> LOG_BYTES_IN_WORD;
        let bucket_index = word / REMEMBERED_SET_BUCKET_BITS;
        let bit_index = word % REMEMBERED_SET_BUCKET_BITS;
        debug_assert!(bucket_index < self.buckets.len());
        let bucket = self.buckets[bucket_index]
            .get_or_insert_with(|| Box::new(Bitset::new(REMEMBERED_SET_BUCKET_BITS)));
        bucket.set(bit_index);
    }

    /// Visit every recorded byte offset in increasing order.
    fn for_each<F: FnMut(usize)>(&self, mut f: F) {
        for (i, bucket) in self.buckets.iter().enumerate() {
            let Some(bucket) = bucket else { continue };
            let offset_base = i * REMEMBERED_SET_BUCKET_BITS;
            bucket.for_each_set(|bit| f((offset_base + bit) << LOG_BYTES_IN_WORD));
        }
    }
}

/// Per-chunk metadata; the first block of memory allocated from the chunk.
#[repr(C)]
pub struct ChunkMeta {
    remembered_set: *mut RememberedSet,
    /// During compaction: where the reallocation cursor stopped in this
    /// chunk; becomes the chunk's new `free` pointer at truncation.
    iter_visited_end: Address,
}

/// Size of [`ChunkMeta`] in bytes.
pub const CHUNK_META_BYTES: usize = 2 * BYTES_IN_WORD;

const_assert_eq!(std::mem::size_of::<ChunkMeta>(), CHUNK_META_BYTES);

#[allow(clippy::mut_from_ref)]
unsafe fn chunk_meta(chunk: Chunk) -> &'static mut ChunkMeta {
    chunk.mem_start().as_mut_ref()
}

fn chunk_of_meta(meta_addr: Address) -> Chunk {
    // The meta is the first allocation in the chunk, right after the header.
    unsafe { Chunk::from_start(meta_addr.sub(CHUNK_HEADER_BYTES)) }
}

fn first_obj_addr(chunk: Chunk) -> Address {
    chunk.mem_start() + CHUNK_META_BYTES
}

unsafe fn chunk_meta_fini(chunk: Chunk) {
    let meta = chunk_meta(chunk);
    if !meta.remembered_set.is_null() {
        drop(Box::from_raw(meta.remembered_set));
        meta.remembered_set = std::ptr::null_mut();
    }
}

/// Write barrier slow path: record `obj` in its chunk's remembered set.
/// Reaches the set through the chunk-meta pointer in the object's meta word,
/// so no space lookup is needed.
pub fn remember_object(obj: ObjRef) {
    debug_assert_eq!(obj.gc_state(), GcState::Old);
    let meta_addr = unsafe { Address::from_usize(obj.gc_ptr()) };
    let meta: &mut ChunkMeta = unsafe { meta_addr.as_mut_ref() };
    if meta.remembered_set.is_null() {
        let chunk = chunk_of_meta(meta_addr);
        meta.remembered_set = Box::into_raw(Box::new(RememberedSet::new(chunk.size_bytes())));
    }
    unsafe { (*meta.remembered_set).record(obj.addr() - meta_addr) };
}

/// Storage iterator over allocated old-space memory.  Doubles as the
/// reallocation cursor during compaction.  Invalidated by truncation.
#[derive(Copy, Clone)]
pub struct OldSpaceIter {
    chunk_index: usize,
    point: Address,
}

/// Chunk-tracking state for initialising reallocated object metas in
/// allocation-cursor order.
pub struct OldReallocCtx {
    chunk_index: usize,
}

pub struct OldSpace {
    chunks: Vec<Chunk>,
    chunk_size: usize,
    size_limit: usize,
}

impl OldSpace {
    pub fn new(conf: &MemConfig) -> OldSpace {
        let mut space = OldSpace {
            chunks: Vec::new(),
            chunk_size: conf.old_chunk_size,
            size_limit: conf.old_size_limit,
        };
        space.add_chunk();
        space
    }

    fn add_chunk(&mut self) -> Chunk {
        if (self.chunks.len() + 1) * self.chunk_size > self.size_limit {
            error!("old space exceeded its size limit ({} bytes)", self.size_limit);
            crate::context::raise_panic(crate::context::PanicCode::Oom);
        }
        let chunk = Chunk::create(self.chunk_size);
        let meta_addr = chunk.alloc(CHUNK_META_BYTES).unwrap();
        debug_assert_eq!(meta_addr, chunk.mem_start());
        let meta: &mut ChunkMeta = unsafe { meta_addr.as_mut_ref() };
        meta.remembered_set = std::ptr::null_mut();
        meta.iter_visited_end = Address::ZERO;
        self.chunks.push(chunk);
        chunk
    }

    /// Allocate storage for an object from the last chunk.  Old space does
    /// not grow outside compaction: on failure the caller runs a full GC.
    pub fn alloc(&mut self, ty: ObjRef, size: usize) -> Option<ObjRef> {
        let (obj, chunk_meta) = self.alloc_raw(size)?;
        obj.init_meta(GcState::Old, chunk_meta.as_usize(), ty);
        Some(obj)
    }

    /// Allocate storage without initialising the header; returns the object
    /// and its chunk-meta address.  Exists for the type-system bootstrap,
    /// where the root type descriptor must reference itself.
    pub(crate) fn alloc_raw(&mut self, size: usize) -> Option<(ObjRef, Address)> {
        debug_assert!(size >= OBJECT_HEAD_SIZE);
        let chunk = *self.chunks.last().unwrap();
        let addr = chunk.alloc(size)?;
        let obj = unsafe { ObjRef::from_addr(addr) };
        Some((obj, chunk.mem_start()))
    }

    /// Iterator at the first allocated object.
    pub fn allocated_begin(&self) -> OldSpaceIter {
        OldSpaceIter {
            chunk_index: 0,
            point: first_obj_addr(self.chunks[0]),
        }
    }

    /// Iterator after the last allocated object.
    pub fn allocated_end(&self) -> OldSpaceIter {
        let last = self.chunks.len() - 1;
        OldSpaceIter {
            chunk_index: last,
            point: self.chunks[last].free_ptr(),
        }
    }

    /// Move the iterator forward `size` bytes, recording the visited end of
    /// any chunk it leaves.  Returns the pre-step position, or `None` at the
    /// end of the last chunk.
    fn iter_forward(&self, iter: &mut OldSpaceIter, size: usize) -> Option<Address> {
        let mut chunk = self.chunks[iter.chunk_index];
        let mut point = iter.point;
        let mut new_point = point + size;
        if new_point >= chunk.end() {
            if iter.chunk_index + 1 >= self.chunks.len() {
                return None;
            }
            let meta = unsafe { chunk_meta(chunk) };
            debug_assert!(meta.iter_visited_end.is_zero());
            meta.iter_visited_end = point;
            iter.chunk_index += 1;
            chunk = self.chunks[iter.chunk_index];
            point = first_obj_addr(chunk);
            new_point = point + size;
            debug_assert!(new_point < chunk.end());
        }
        iter.point = new_point;
        Some(point)
    }

    /// Full GC: reserve the next aligned region at the reallocation cursor,
    /// adding chunks when the cursor falls off the end.  The chunk bump
    /// cursors are not modified; truncation installs the final extents.
    pub fn pre_alloc(&mut self, iter: &mut OldSpaceIter, size: usize) -> Address {
        loop {
            if let Some(ptr) = self.iter_forward(iter, size) {
                return ptr;
            }
            debug_assert_eq!(iter.chunk_index, self.chunks.len() - 1);
            self.add_chunk();
        }
    }

    /// Full GC: drop chunks past the reallocation cursor and install each
    /// chunk's compacted extent as its new bump cursor.
    pub fn truncate(&mut self, trunc_from: OldSpaceIter) {
        for chunk in self.chunks.drain(trunc_from.chunk_index + 1..) {
            unsafe { chunk_meta_fini(chunk) };
            chunk.destroy();
        }
        let last = self.chunks[trunc_from.chunk_index];
        let last_meta = unsafe { chunk_meta(last) };
        debug_assert!(last_meta.iter_visited_end.is_zero());
        last_meta.iter_visited_end = trunc_from.point;

        for &chunk in &self.chunks {
            let meta = unsafe { chunk_meta(chunk) };
            let new_free = meta.iter_visited_end;
            meta.iter_visited_end = Address::ZERO;
            debug_assert!(!new_free.is_zero());
            chunk.set_free_ptr(new_free);
        }
    }

    /// Full GC: reserve new storage for every marked object (writing the
    /// forwarding pointer into meta word 1), stash the size of every dead
    /// one, and drop all remembered sets.  The cursor starts at the very
    /// beginning so moves never overlap forward.
    pub fn realloc_survivors_and_forget_remembered(&mut self, iter: &mut OldSpaceIter) {
        debug_assert_eq!(iter.chunk_index, 0);
        debug_assert_eq!(iter.point, first_obj_addr(self.chunks[0]));

        // `pre_alloc` may append chunks; they hold no allocated objects, so
        // walking the pre-existing ones is enough.
        let chunk_count = self.chunks.len();
        for i in 0..chunk_count {
            let chunk = self.chunks[i];
            unsafe { chunk_meta_fini(chunk) };
            let mut p = first_obj_addr(chunk);
            let end = chunk.free_ptr();
            while p < end {
                let obj = unsafe { ObjRef::from_addr(p) };
                let size = obj.size();
                p += size;
                if !obj.test_gc_mark() {
                    // Object dies here; keep its size readable.
                    obj.set_gc_ptr(size);
                    continue;
                }
                let new_mem = self.pre_alloc(iter, size);
                obj.set_gc_ptr(new_mem.as_usize());
            }
        }
    }

    /// Fast GC: mark young objects referenced from remembered objects.
    /// Returns the number of chunks with a remembered set, as a hint for the
    /// later update pass.
    pub fn mark_remembered_young(&mut self) -> usize {
        let mut count = 0;
        for &chunk in &self.chunks {
            let meta = unsafe { chunk_meta(chunk) };
            if meta.remembered_set.is_null() {
                continue;
            }
            count += 1;
            let meta_addr = chunk.mem_start();
            unsafe {
                (*meta.remembered_set).for_each(|offset| {
                    let obj = ObjRef::from_addr(meta_addr + offset);
                    debug_assert!(!obj.is_young());
                    objmem::mark_object_slots_o2y(obj);
                });
            }
        }
        count
    }

    /// Fast GC: update references in objects allocated after `begin`
    /// (the promotions of this cycle).
    pub fn update_references_from(&mut self, begin: OldSpaceIter) {
        for (i, &chunk) in self.chunks[begin.chunk_index..].iter().enumerate() {
            let start = if i == 0 {
                begin.point
            } else {
                first_obj_addr(chunk)
            };
            unsafe {
                walk_objects(start, chunk.free_ptr(), |obj, _size| {
                    objmem::move_object_slots(obj);
                });
            }
        }
    }

    /// GC: update references in remembered objects, then drop the sets.
    pub fn update_remembered_and_forget(&mut self, hint_max_count: usize) {
        let mut count = 0;
        for &chunk in &self.chunks {
            if count >= hint_max_count {
                break;
            }
            let meta = unsafe { chunk_meta(chunk) };
            if meta.remembered_set.is_null() {
                continue;
            }
            count += 1;
            let meta_addr = chunk.mem_start();
            unsafe {
                (*meta.remembered_set).for_each(|offset| {
                    let obj = ObjRef::from_addr(meta_addr + offset);
                    objmem::move_object_slots(obj);
                });
                chunk_meta_fini(chunk);
            }
        }
    }

    /// Full GC: update references in every marked object.
    pub fn update_references(&mut self) {
        for &chunk in &self.chunks {
            unsafe {
                walk_objects_stashed(first_obj_addr(chunk), chunk.free_ptr(), |obj, _size, marked| {
                    if marked {
                        objmem::move_object_slots(obj);
                    }
                });
            }
        }
    }

    pub fn realloc_ctx(&self) -> OldReallocCtx {
        OldReallocCtx { chunk_index: 0 }
    }

    /// Initialise the meta of an object whose storage was reserved with
    /// [`OldSpace::pre_alloc`].  Must be called in the same order as the
    /// reservations, so the chunk scan only ever moves forward.
    pub fn init_reallocated_meta(&self, ctx: &mut OldReallocCtx, obj: ObjRef, ty: ObjRef) {
        let addr = obj.addr();
        let mut i = ctx.chunk_index;
        loop {
            let chunk = self.chunks[i];
            if addr > chunk.start() && addr < chunk.end() {
                debug_assert!(addr >= first_obj_addr(chunk));
                ctx.chunk_index = i;
                obj.init_meta(GcState::Old, chunk.mem_start().as_usize(), ty);
                return;
            }
            i += 1;
            assert!(
                i < self.chunks.len(),
                "reallocated object not within old space"
            );
        }
    }

    /// Full GC: move every marked object to its reserved storage.  Moves may
    /// overlap (compaction slides objects downward), so copies go through
    /// `memmove` semantics.
    pub fn move_reallocated(&mut self, ctx: &mut OldReallocCtx) {
        debug_assert_eq!(ctx.chunk_index, 0);
        let chunk_count = self.chunks.len();
        for i in 0..chunk_count {
            let chunk = self.chunks[i];
            unsafe {
                walk_objects_stashed(first_obj_addr(chunk), chunk.free_ptr(), |obj, size, marked| {
                    if !marked {
                        return;
                    }
                    obj.reset_gc_mark();
                    let new_obj = ObjRef::from_addr(Address::from_usize(obj.gc_ptr()));
                    let ty = obj.type_of();
                    if new_obj == obj {
                        // Not moving: only the meta needs re-initialising.
                        obj.init_meta(GcState::Old, chunk.mem_start().as_usize(), ty);
                        return;
                    }
                    self.init_reallocated_meta(ctx, new_obj, ty);
                    std::ptr::copy::<u8>(
                        (obj.addr() + OBJECT_HEAD_SIZE).to_ptr(),
                        (new_obj.addr() + OBJECT_HEAD_SIZE).to_mut_ptr(),
                        size - OBJECT_HEAD_SIZE,
                    );
                });
            }
        }
    }

    #[cfg(debug_assertions)]
    pub fn post_gc_check(&self) -> Result<(), &'static str> {
        let mut err = None;
        for &chunk in &self.chunks {
            let meta = unsafe { chunk_meta(chunk) };
            if !meta.remembered_set.is_null() {
                return Err("old chunk keeps a remembered set after GC");
            }
            if !meta.iter_visited_end.is_zero() {
                return Err("old chunk keeps a compaction cursor after GC");
            }
            let meta_addr = chunk.mem_start();
            unsafe {
                walk_objects(first_obj_addr(chunk), chunk.free_ptr(), |obj, _size| {
                    if obj.gc_state() != GcState::Old {
                        err = Some("non-OLD object in old space");
                    } else if obj.test_gc_mark() {
                        err = Some("marked object in old space after GC");
                    } else if obj.gc_ptr() != meta_addr.as_usize() {
                        err = Some("old object does not point at its chunk meta");
                    }
                });
            }
        }
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn dump_usage(&self) {
        let mut used = 0;
        for &chunk in &self.chunks {
            used += chunk.free_ptr() - chunk.mem_start();
        }
        debug!(
            "old space: {} chunks, {} bytes used",
            self.chunks.len(),
            used
        );
    }
}

impl Drop for OldSpace {
    fn drop(&mut self) {
        for &chunk in &self.chunks {
            unsafe { chunk_meta_fini(chunk) };
            chunk.destroy();
        }
    }
}
