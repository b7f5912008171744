//! Object-memory orchestration: allocation, the two collection cycles, root
//! and weak-reference registries, and the write barrier.
//!
//! ## Fast GC (young generation only)
//!
//! 1. Mark reachable young objects from the registered roots, then from the
//!    remembered sets of old and big space (marking as if reached from an
//!    old object, so promotion decisions come out right).
//! 2. Finalize weak references to unreached young objects.
//! 3. Evacuate survivors (`NEW` → other semispace as `MID`; `MID` → old
//!    space), writing forwarding pointers into the vacated headers.
//! 4. Swap semispaces and update references: new copies, the old-space
//!    promotion tail, remembered objects (clearing the sets), roots, and
//!    weak containers.
//!
//! ## Full GC (all spaces)
//!
//! 1. Mark everything reachable from the roots (`NEW` upgrades to `MID` on
//!    the way, so full-GC survivors never stay `NEW`).
//! 2. Finalize weak references to unreached objects.
//! 3. Sweep big space.  Reserve compacted storage for old-space and
//!    new-space survivors through a single reallocation cursor.
//! 4. Update every reference (marked objects in all spaces, roots, weak
//!    containers) to the forwarding addresses.
//! 5. Move survivors (`memmove`: old-space moves may overlap), swap the
//!    semispaces, and truncate old space past the cursor.
//!
//! All moves of a phase complete before the next phase begins, which is what
//! makes the forwarding pointers sound.

use crate::object::type_obj::{SizeSpec, TypeObj};
use crate::object::value::{ObjRef, Value};
use crate::object::{GcState, OBJECT_HEAD_SIZE};
use crate::util::constants::BYTES_IN_WORD;
use crate::util::conversions::round_up_to;
use crate::util::Address;

use super::big_space::{self, BigSpace};
use super::new_space::NewSpace;
use super::old_space::{self, OldSpace};
use super::{MemConfig, NON_BIG_SPACE_MAX_ALLOC_SIZE};

/// Which collection to run.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum GcKind {
    /// Collect the young generation only.
    Fast,
    /// Collect all three spaces.
    Full,
}

/// Allocation placement hint.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AllocHint {
    /// Place by size: new space, or big space above the size threshold.
    Auto,
    /// The object is expected to be long-lived: place directly in old space.
    /// Type descriptors must use this.
    Survivor,
    /// Treat as a large object regardless of size.
    Huge,
}

/// Operation selector passed to GC-root visitors.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum VisitOp {
    /// Mark the object and everything reachable from it.
    Mark,
    /// Mark reachable young objects only.
    MarkYoung,
    /// Rewrite the reference if the object has moved.
    Move,
}

/// Operation selector passed to weak-reference container visitors.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WeakVisitOp {
    /// Finalize references to unreached objects.
    Finalize,
    /// Finalize references to unreached young objects.
    FinalizeYoung,
    /// Rewrite references to moved objects.
    Move,
}

/// A GC-root scanning function.  Receives the opaque pointer the root was
/// registered with; walks the root's objects via [`visit_slot`].
pub type RootVisitor = unsafe fn(*mut u8, VisitOp);

/// A weak-reference container scanning function.  Walks the container's
/// references via [`visit_weak_ref`], excising the entries it reports dead.
pub type WeakVisitor = unsafe fn(*mut u8, WeakVisitOp);

pub struct ObjMem {
    force_full_gc: bool,
    current_gc: Option<GcKind>,
    new_space: NewSpace,
    old_space: OldSpace,
    big_space: BigSpace,
    gc_roots: Vec<(*mut u8, RootVisitor)>,
    weak_refs: Vec<(*mut u8, WeakVisitor)>,
    /// Keeps the type of an in-flight allocation visible to the collector:
    /// a GC inside the allocation retry loop may move the type descriptor.
    alloc_type_root: Value,
}

impl ObjMem {
    pub fn new(conf: &MemConfig) -> ObjMem {
        ObjMem {
            force_full_gc: false,
            current_gc: None,
            new_space: NewSpace::new(conf),
            old_space: OldSpace::new(conf),
            big_space: BigSpace::new(conf),
            gc_roots: Vec::new(),
            weak_refs: Vec::new(),
            alloc_type_root: Value::SMALLINT_ZERO,
        }
    }

    // ----- roots and weak-reference containers ----------------------------

    /// Register a GC root.  Re-registering the same pointer replaces the
    /// visitor.
    pub fn add_gc_root(&mut self, root: *mut u8, visitor: RootVisitor) {
        for entry in &mut self.gc_roots {
            if entry.0 == root {
                entry.1 = visitor;
                return;
            }
        }
        self.gc_roots.push((root, visitor));
    }

    /// Remove a registered GC root.  Returns whether it was present.
    pub fn remove_gc_root(&mut self, root: *mut u8) -> bool {
        let before = self.gc_roots.len();
        self.gc_roots.retain(|&(p, _)| p != root);
        self.gc_roots.len() != before
    }

    /// Register a weak-reference container.
    pub fn register_weak_ref_container(&mut self, container: *mut u8, visitor: WeakVisitor) {
        for entry in &mut self.weak_refs {
            if entry.0 == container {
                entry.1 = visitor;
                return;
            }
        }
        self.weak_refs.push((container, visitor));
    }

    /// Remove a registered weak-reference container.
    pub fn unregister_weak_ref_container(&mut self, container: *mut u8) -> bool {
        let before = self.weak_refs.len();
        self.weak_refs.retain(|&(p, _)| p != container);
        self.weak_refs.len() != before
    }

    // ----- allocation -----------------------------------------------------

    /// Allocate an object of a type with fully fixed layout.
    pub fn alloc(&mut self, ty: ObjRef) -> ObjRef {
        self.alloc_ex(AllocHint::Auto, ty, 0, 0)
    }

    /// Bootstrap the root `Type` descriptor: the one object whose meta must
    /// reference itself.  Layout words are left for the caller.
    pub fn alloc_boot_type(&mut self) -> ObjRef {
        use crate::object::type_obj::TYPE_OBJ_SIZE;
        let (obj, chunk_meta) = self
            .old_space
            .alloc_raw(TYPE_OBJ_SIZE)
            .expect("old space exhausted during bootstrap");
        obj.init_meta(GcState::Old, chunk_meta.as_usize(), obj);
        obj
    }

    /// Allocate an object.  For extendable types, `ext_slots` is the total
    /// slot count (including the count slot itself) and `ext_bytes` the
    /// bytes-region payload request (rounded up to a word multiple,
    /// including the leading size word).  Only the header and the extension
    /// size fields are initialised.
    ///
    /// May run garbage collection; on repeated failure the out-of-memory
    /// panic is raised.
    pub fn alloc_ex(
        &mut self,
        hint: AllocHint,
        ty: ObjRef,
        ext_slots: usize,
        ext_bytes: usize,
    ) -> ObjRef {
        debug_assert!(self.current_gc.is_none(), "allocation during GC");
        let t = unsafe { TypeObj::deref(ty) };
        let mut size = t.cached_obj_size();
        let has_ext = size == 0;
        let mut ext_slots_here = false;
        let mut ext_bytes_here = false;
        let mut slots_num = 0usize;
        let mut bytes_rounded = 0usize;
        debug_assert!(has_ext || (ext_slots == 0 && ext_bytes == 0));
        if has_ext {
            ext_slots_here = t.slots_spec().is_extendable();
            ext_bytes_here = t.bytes_spec().is_extendable();
            debug_assert!(!ext_slots_here || ext_slots >= 1);
            debug_assert!(!ext_bytes_here || ext_bytes >= 1);
            slots_num = match t.slots_spec() {
                SizeSpec::Fixed(n) => n,
                SizeSpec::Extendable => ext_slots,
            };
            size = OBJECT_HEAD_SIZE + slots_num * BYTES_IN_WORD;
            size += match t.bytes_spec() {
                SizeSpec::Fixed(n) => n,
                SizeSpec::Extendable => {
                    bytes_rounded = round_up_to(ext_bytes, BYTES_IN_WORD);
                    bytes_rounded
                }
            };
        }

        let obj = self.alloc_storage(hint, ty, size);

        if has_ext {
            if ext_slots_here {
                let n = Value::try_smallint(ext_slots as isize)
                    .expect("extendable slot count exceeds small-int range");
                obj.set_slot_no_barrier(0, n);
            }
            if ext_bytes_here {
                unsafe {
                    (obj.slots_base() + slots_num * BYTES_IN_WORD).store::<usize>(bytes_rounded)
                };
            }
        }
        debug_assert_eq!(obj.size(), size);
        obj
    }

    fn alloc_storage(&mut self, hint: AllocHint, ty: ObjRef, size: usize) -> ObjRef {
        // Collections below may move the type descriptor; keep it reachable
        // and re-read it after every cycle.
        debug_assert!(self.alloc_type_root.is_smallint());
        self.alloc_type_root = Value::from_obj(ty);
        let obj = match hint {
            AllocHint::Auto if size <= NON_BIG_SPACE_MAX_ALLOC_SIZE => {
                let mut retry = 0;
                loop {
                    let ty = self.alloc_type_root.as_obj();
                    if let Some(obj) = self.new_space.alloc(ty, size) {
                        break obj;
                    }
                    if retry > 2 {
                        self.oom(size);
                    }
                    retry += 1;
                    self.collect(GcKind::Fast);
                }
            }
            AllocHint::Survivor if size <= NON_BIG_SPACE_MAX_ALLOC_SIZE => {
                let mut retry = 0;
                loop {
                    let ty = self.alloc_type_root.as_obj();
                    if let Some(obj) = self.old_space.alloc(ty, size) {
                        break obj;
                    }
                    if retry > 1 {
                        self.oom(size);
                    }
                    retry += 1;
                    self.collect(GcKind::Full);
                }
            }
            _ => {
                let mut retry = 0;
                loop {
                    let ty = self.alloc_type_root.as_obj();
                    if let Some(obj) = self.big_space.alloc(ty, size) {
                        break obj;
                    }
                    if retry == 0 {
                        self.collect(GcKind::Full);
                    } else {
                        if self.big_space.allocated_size() + size > self.big_space.size_limit() {
                            self.oom(size);
                        }
                        self.big_space.raise_threshold_for(size);
                    }
                    retry += 1;
                }
            }
        };
        self.alloc_type_root = Value::SMALLINT_ZERO;
        obj
    }

    fn oom(&mut self, size: usize) -> ! {
        error!("object memory exhausted allocating {} bytes", size);
        self.dump_usage();
        crate::context::raise_panic(crate::context::PanicCode::Oom);
    }

    // ----- collection -----------------------------------------------------

    /// The collection currently running, if any.
    pub fn current_gc(&self) -> Option<GcKind> {
        self.current_gc
    }

    /// Run a collection.  A pending force-full flag (set when old space
    /// refused a promotion) upgrades a fast request to a full one.
    pub fn collect(&mut self, kind: GcKind) {
        let kind = if self.force_full_gc {
            self.force_full_gc = false;
            GcKind::Full
        } else {
            kind
        };
        debug!("{:?} GC starts", kind);
        self.current_gc = Some(kind);
        match kind {
            GcKind::Fast => self.gc_fast(),
            GcKind::Full => self.gc_full(),
        }
        self.current_gc = None;
        debug!("{:?} GC ends", kind);

        #[cfg(debug_assertions)]
        {
            if let Err(e) = self.new_space.post_gc_check() {
                panic!("post-GC check failed: {}", e);
            }
            if let Err(e) = self.old_space.post_gc_check() {
                panic!("post-GC check failed: {}", e);
            }
            if let Err(e) = self.big_space.post_gc_check() {
                panic!("post-GC check failed: {}", e);
            }
        }
    }

    fn gc_fast(&mut self) {
        // 1  Mark reachable young objects: roots first...
        unsafe { visit_slot(&mut self.alloc_type_root, VisitOp::MarkYoung) };
        for &(root, visitor) in &self.gc_roots {
            unsafe { visitor(root, VisitOp::MarkYoung) };
        }
        // ...then the remembered sets, marking as if reached from old
        // objects so the referred young objects get promoted.
        let old_count_hint = self.old_space.mark_remembered_young();
        let big_count_hint = self.big_space.mark_remembered_young();

        // 2  Clean up unused weak references.
        for &(container, visitor) in &self.weak_refs {
            unsafe { visitor(container, WeakVisitOp::FinalizeYoung) };
        }

        // 3  Reallocate storage for survivors and copy them over.  Record
        // the pre-GC old-space extent first: the promotion tail needs its
        // references updated below.
        let old_orig_end = self.old_space.allocated_end();
        if !self
            .new_space
            .realloc_and_copy_survivors(&mut self.old_space)
        {
            // Old space refused a promotion; run a full GC next cycle.
            self.force_full_gc = true;
        }

        // 4  Update references.
        self.new_space.swap_chunks();
        self.new_space.update_references();
        self.old_space.update_references_from(old_orig_end);
        self.old_space.update_remembered_and_forget(old_count_hint);
        self.big_space.update_remembered_and_forget(big_count_hint);
        unsafe { visit_slot(&mut self.alloc_type_root, VisitOp::Move) };
        for &(root, visitor) in &self.gc_roots {
            unsafe { visitor(root, VisitOp::Move) };
        }
        for &(container, visitor) in &self.weak_refs {
            unsafe { visitor(container, WeakVisitOp::Move) };
        }
    }

    fn gc_full(&mut self) {
        // 1  Mark everything reachable.
        unsafe { visit_slot(&mut self.alloc_type_root, VisitOp::Mark) };
        for &(root, visitor) in &self.gc_roots {
            unsafe { visitor(root, VisitOp::Mark) };
        }

        // 2  Clean up unused weak references.
        for &(container, visitor) in &self.weak_refs {
            unsafe { visitor(container, WeakVisitOp::Finalize) };
        }

        // 3  Reallocate storage for survivors; remove the dead.
        self.big_space.sweep();
        let mut realloc_iter = self.old_space.allocated_begin();
        self.old_space
            .realloc_survivors_and_forget_remembered(&mut realloc_iter);
        self.new_space
            .realloc_survivors(&mut self.old_space, &mut realloc_iter);

        // 4  Update references everywhere before anything moves.
        self.new_space.update_marked_references();
        self.old_space.update_references();
        self.big_space.update_references();
        unsafe { visit_slot(&mut self.alloc_type_root, VisitOp::Move) };
        for &(root, visitor) in &self.gc_roots {
            unsafe { visitor(root, VisitOp::Move) };
        }
        for &(container, visitor) in &self.weak_refs {
            unsafe { visitor(container, WeakVisitOp::Move) };
        }

        // 5  Move survivors to their new storage, then drop the surplus.
        let mut realloc_ctx = self.old_space.realloc_ctx();
        self.old_space.move_reallocated(&mut realloc_ctx);
        self.new_space
            .move_marked_objects(&self.old_space, &mut realloc_ctx);
        self.new_space.swap_chunks();
        self.old_space.truncate(realloc_iter);
    }

    /// Log a per-space usage summary.
    pub fn dump_usage(&self) {
        self.new_space.dump_usage();
        self.old_space.dump_usage();
        self.big_space.dump_usage();
    }
}

// ----- write barrier ----------------------------------------------------

/// Record a cross-generation edge after storing `val` into a slot of `obj`.
/// Young stores and non-reference stores are filtered inline; the slow path
/// records the object in its chunk's remembered set (OLD) or sets its
/// young-ref flag (BIG).
#[inline]
pub fn write_barrier(obj: ObjRef, val: Value) {
    if obj.is_young() {
        return;
    }
    if val.is_smallint() || !val.as_obj().is_young() {
        return;
    }
    record_old_to_young(obj);
}

/// Barrier over a vector store: record `obj` if any stored value is young.
pub fn write_barrier_n(obj: ObjRef, first_slot: usize, n: usize) {
    if obj.is_young() {
        return;
    }
    for i in 0..n {
        let val = obj.slot(first_slot + i);
        if !val.is_smallint() && val.as_obj().is_young() {
            record_old_to_young(obj);
            return;
        }
    }
}

/// Record an old-generation object that stores a young reference.
pub fn record_old_to_young(obj: ObjRef) {
    debug_assert!(!obj.is_young());
    if obj.gc_state() == GcState::Old {
        old_space::remember_object(obj);
    } else {
        big_space::remember_object(obj);
    }
}

// ----- uniform visit primitives -----------------------------------------

/// Visit one object slot of a GC root.  Small ints are ignored; otherwise
/// the slot is marked or rewritten according to `op`.
///
/// # Safety
/// `slot` must point at a live tagged value word owned by the root.
pub unsafe fn visit_slot(slot: *mut Value, op: VisitOp) {
    let v = *slot;
    if v.is_smallint() {
        return;
    }
    match op {
        VisitOp::Mark => mark_object_x(v.as_obj()),
        VisitOp::MarkYoung => mark_object_y(v.as_obj()),
        VisitOp::Move => {
            move_ref(&mut *slot);
        }
    }
}

/// Apply [`visit_slot`] to `n` consecutive value words starting at `base`.
///
/// # Safety
/// The whole range must be live tagged value words owned by the root.
pub unsafe fn visit_slot_range(base: *mut Value, n: usize, op: VisitOp) {
    for i in 0..n {
        visit_slot(base.add(i), op);
    }
}

/// Visit one weak reference.  For the finalize operations, returns `true`
/// when the referent is unreached and the container must excise the entry.
/// For [`WeakVisitOp::Move`], rewrites the reference in place.
///
/// # Safety
/// `slot` must point at a live non-small-int value word owned by the
/// container.
pub unsafe fn visit_weak_ref(slot: *mut Value, op: WeakVisitOp) -> bool {
    let v = *slot;
    debug_assert!(!v.is_smallint());
    let obj = v.as_obj();
    match op {
        WeakVisitOp::Move => {
            move_ref(&mut *slot);
            false
        }
        WeakVisitOp::FinalizeYoung if !obj.is_young() => false,
        _ => !obj.test_gc_mark(),
    }
}

// ----- marking and moving -----------------------------------------------

/// Full GC: mark an object and everything reachable from it.
pub fn mark_object_x(obj: ObjRef) {
    if obj.test_gc_mark() {
        return;
    }
    obj.set_gc_mark();
    if obj.gc_state() == GcState::New {
        mark_object_slots_x(obj);
    } else {
        // MID objects will be promoted; treat their referents as
        // old-reachable.
        mark_object_slots_o2x(obj);
    }
}

/// Fast GC: mark a young object and the young objects reachable from it.
pub fn mark_object_y(obj: ObjRef) {
    if !obj.is_young() || obj.test_gc_mark() {
        return;
    }
    obj.set_gc_mark();
    if obj.gc_state() == GcState::New {
        mark_object_slots_y(obj);
    } else {
        mark_object_slots_o2y(obj);
    }
}

/// Full GC: mark an object reached from an old object.  `NEW` upgrades to
/// `MID` so the object is promoted rather than kept young.
fn mark_object_o2x(obj: ObjRef) {
    if obj.gc_state() == GcState::New {
        obj.set_gc_state(GcState::Mid);
    }
    if obj.test_gc_mark() {
        return;
    }
    obj.set_gc_mark();
    mark_object_slots_o2x(obj);
}

/// Fast GC: mark a young object reached from an old object, upgrading `NEW`
/// to `MID` for promotion.
fn mark_object_o2y(obj: ObjRef) {
    if !obj.is_young() {
        return;
    }
    if obj.gc_state() == GcState::New {
        obj.set_gc_state(GcState::Mid);
    }
    if obj.test_gc_mark() {
        return;
    }
    obj.set_gc_mark();
    mark_object_slots_o2y(obj);
}

fn for_each_reference_slot<F: FnMut(ObjRef)>(obj: ObjRef, mut f: F) {
    let ty = unsafe { TypeObj::deref(obj.type_of()) };
    let (mut i, n) = match ty.slots_spec() {
        SizeSpec::Fixed(n) => (0, n),
        SizeSpec::Extendable => {
            let header = obj.slot(0);
            debug_assert!(header.is_smallint());
            (1, header.as_smallint() as usize)
        }
    };
    while i < n {
        let v = obj.slot(i);
        if !v.is_smallint() {
            f(v.as_obj());
        }
        i += 1;
    }
}

fn mark_object_slots_x(obj: ObjRef) {
    mark_object_x(obj.type_of());
    for_each_reference_slot(obj, mark_object_x);
}

fn mark_object_slots_y(obj: ObjRef) {
    debug_assert!(!obj.type_of().is_young());
    for_each_reference_slot(obj, mark_object_y);
}

fn mark_object_slots_o2x(obj: ObjRef) {
    mark_object_o2x(obj.type_of());
    for_each_reference_slot(obj, mark_object_o2x);
}

/// Mark the young slots of an old-reachable object (used directly by the
/// remembered-set scans).
pub fn mark_object_slots_o2y(obj: ObjRef) {
    debug_assert!(!obj.type_of().is_young());
    for_each_reference_slot(obj, mark_object_o2y);
}

/// Update one reference to a moved object.  Marked objects hold their new
/// address in meta word 1; the rewrite is not recursive.
pub fn move_ref(slot: &mut Value) {
    let v = *slot;
    debug_assert!(!v.is_smallint());
    let obj = v.as_obj();
    if !obj.test_gc_mark() {
        return;
    }
    *slot = Value::from_obj(unsafe { ObjRef::from_addr(Address::from_usize(obj.gc_ptr())) });
}

/// Update the references held in an object's slots (and its type pointer).
pub fn move_object_slots(obj: ObjRef) {
    // Read the layout before the type pointer is rewritten.
    let ty = obj.type_of();
    let spec = unsafe { TypeObj::deref(ty) }.slots_spec();

    let mut ty_val = Value::from_obj(ty);
    move_ref(&mut ty_val);
    if ty_val != Value::from_obj(ty) {
        obj.set_type(ty_val.as_obj());
    }

    let (mut i, n) = match spec {
        SizeSpec::Fixed(n) => (0, n),
        SizeSpec::Extendable => {
            let header = obj.slot(0);
            debug_assert!(header.is_smallint());
            (1, header.as_smallint() as usize)
        }
    };
    while i < n {
        let mut v = obj.slot(i);
        if !v.is_smallint() {
            move_ref(&mut v);
            // Raw store: GC rewrites need no barrier, the remembered sets
            // are rebuilt or already account for this object.
            unsafe { obj.slot_addr(i).store(v) };
        }
        i += 1;
    }
}
