//! Per-context globals: the built-in type descriptors, the singletons, and
//! the pre-interned operator symbols.
//!
//! The struct is a flat vector of tagged values and is registered as a GC
//! root that visits itself as one slot range.  During bootstrap the fields
//! start as small-int zero, which every GC walk ignores, so collections are
//! safe at any point of the boot sequence.

use crate::context::Context;
use crate::mem::objmem::{self, AllocHint, VisitOp};
use crate::object::func_obj::{FuncMeta, NativeFn};
use crate::object::type_obj::{SizeSpec, TypeObj};
use crate::object::value::Value;
use crate::object::{
    array_obj, bool_obj, exception_obj, float_obj, func_obj, int_obj, map_obj, module_obj,
    range_obj, string_obj, symbol_obj, tuple_obj,
};
use crate::symbols::intern;
use crate::util::constants::BYTES_IN_WORD;

#[repr(C)]
pub(crate) struct Globals {
    // ----- built-in types -----
    pub type_type: Value,
    pub type_nil: Value,
    pub type_bool: Value,
    pub type_int: Value,
    pub type_float: Value,
    pub type_string: Value,
    pub type_symbol: Value,
    pub type_tuple: Value,
    pub type_array_slots: Value,
    pub type_array: Value,
    pub type_map: Value,
    pub type_map_node: Value,
    pub type_range: Value,
    pub type_function: Value,
    pub type_module: Value,
    pub type_exception: Value,
    // ----- singletons -----
    pub val_nil: Value,
    pub val_true: Value,
    pub val_false: Value,
    pub val_empty_tuple: Value,
    // ----- operator symbols -----
    pub sym_call: Value,
    pub sym_hash: Value,
    pub sym_cmp: Value,
    pub sym_equ: Value,
    pub sym_add: Value,
    pub sym_sub: Value,
    pub sym_mul: Value,
    pub sym_div: Value,
    pub sym_rem: Value,
    pub sym_pow: Value,
    pub sym_shl: Value,
    pub sym_shr: Value,
    pub sym_bitand: Value,
    pub sym_bitor: Value,
    pub sym_bitxor: Value,
    pub sym_neg: Value,
    pub sym_bitnot: Value,
    pub sym_get_element: Value,
    pub sym_set_element: Value,
    pub sym_insert: Value,
    pub sym_remove: Value,
    // ----- modules -----
    pub entry_module: Value,
}

const GLOBALS_VALUE_COUNT: usize = std::mem::size_of::<Globals>() / BYTES_IN_WORD;
const_assert_eq!(std::mem::size_of::<Globals>() % BYTES_IN_WORD, 0);

impl Globals {
    pub fn zeroed() -> Box<Globals> {
        // Every field is one tagged word; small-int zero is the inert fill.
        let this: Globals = unsafe { std::mem::zeroed() };
        let mut boxed = Box::new(this);
        let base = &mut *boxed as *mut Globals as *mut Value;
        for i in 0..GLOBALS_VALUE_COUNT {
            unsafe { base.add(i).write(Value::SMALLINT_ZERO) };
        }
        boxed
    }

    /// GC-root visitor: the whole struct is one slot vector.
    ///
    /// # Safety
    /// `ptr` must be the address of a live `Globals` registered as a root.
    pub unsafe fn gc_visitor(ptr: *mut u8, op: VisitOp) {
        objmem::visit_slot_range(ptr as *mut Value, GLOBALS_VALUE_COUNT, op);
    }
}

fn new_type(ctx: &mut Context, layout: (SizeSpec, SizeSpec)) -> Value {
    let type_ty = ctx.globals.type_type.as_obj();
    let obj = ctx.mem.alloc_ex(AllocHint::Survivor, type_ty, 0, 0);
    unsafe { TypeObj::deref(obj) }.init_layout(layout.0, layout.1);
    Value::from_obj(obj)
}

/// Create a bare type descriptor for the embedder API.
pub(crate) fn new_type_for_api(ctx: &mut Context, slots: SizeSpec, bytes: SizeSpec) -> Value {
    new_type(ctx, (slots, bytes))
}

/// Accessor into the (GC-updated) globals, so boot helpers never hold a
/// type value across an allocation.
type GlobalGet = fn(&Globals) -> Value;

fn set_type_name(ctx: &mut Context, get: GlobalGet, name: &str) {
    let sym = intern(ctx, name);
    let ty_v = get(&ctx.globals);
    let ty = unsafe { TypeObj::deref(ty_v.as_obj()) };
    ty.set_name(ty_v.as_obj(), sym);
}

fn ensure_methods_map(ctx: &mut Context, get: GlobalGet) {
    let map = map_obj::new(ctx, 0.0, 16);
    let ty_v = get(&ctx.globals);
    let ty = unsafe { TypeObj::deref(ty_v.as_obj()) };
    ty.set_methods_map(ty_v.as_obj(), map);
}

fn def_method(
    ctx: &mut Context,
    get: GlobalGet,
    name: &str,
    na: u8,
    nr: u16,
    native: NativeFn,
) {
    let func = func_obj::new_native(ctx, FuncMeta { na, no: 0, nr }, native);
    let t = ctx.stack.alloc_temp(3);
    ctx.stack.set(t, func);
    let sym = intern(ctx, name);
    ctx.stack.set(t + 1, sym);
    let ty_v = get(&ctx.globals);
    let map = unsafe { TypeObj::deref(ty_v.as_obj()) }.methods_map();
    ctx.stack.set(t + 2, map);
    map_obj::set(ctx, t + 2, t + 1, t).expect("method-table insertion failed");
    ctx.stack.free_temp(3);
}

/// Build the whole built-in world.  Called once from `Context::new`, after
/// the stack, globals, symbol registry and loader roots are registered and
/// the base frame is entered.
pub(crate) fn boot(ctx: &mut Context) {
    // The root type describes itself; everything else is ordinary.
    let type_type = ctx.mem.alloc_boot_type();
    unsafe { TypeObj::deref(type_type) }
        .init_layout(SizeSpec::Fixed(4), SizeSpec::Fixed(3 * BYTES_IN_WORD));
    ctx.globals.type_type = Value::from_obj(type_type);

    ctx.globals.type_nil = new_type(ctx, bool_obj::LAYOUT);
    ctx.globals.type_bool = new_type(ctx, bool_obj::LAYOUT);
    ctx.globals.type_int = new_type(ctx, int_obj::LAYOUT);
    ctx.globals.type_float = new_type(ctx, float_obj::LAYOUT);
    ctx.globals.type_string = new_type(ctx, string_obj::LAYOUT);
    ctx.globals.type_symbol = new_type(ctx, symbol_obj::LAYOUT);
    ctx.globals.type_tuple = new_type(ctx, tuple_obj::LAYOUT);
    ctx.globals.type_array_slots = new_type(ctx, array_obj::slots::LAYOUT);
    ctx.globals.type_array = new_type(ctx, array_obj::LAYOUT);
    ctx.globals.type_map = new_type(ctx, map_obj::LAYOUT);
    ctx.globals.type_map_node = new_type(ctx, map_obj::node::LAYOUT);
    ctx.globals.type_range = new_type(ctx, range_obj::LAYOUT);
    ctx.globals.type_function = new_type(ctx, func_obj::LAYOUT);
    ctx.globals.type_module = new_type(ctx, module_obj::LAYOUT);
    ctx.globals.type_exception = new_type(ctx, exception_obj::LAYOUT);

    // Singletons.
    let nil_ty = ctx.globals.type_nil;
    ctx.globals.val_nil = bool_obj::new_singleton(ctx, nil_ty);
    let bool_ty = ctx.globals.type_bool;
    ctx.globals.val_true = bool_obj::new_singleton(ctx, bool_ty);
    let bool_ty = ctx.globals.type_bool;
    ctx.globals.val_false = bool_obj::new_singleton(ctx, bool_ty);
    let tuple_ty = ctx.globals.type_tuple.as_obj();
    let empty = ctx.mem.alloc_ex(AllocHint::Survivor, tuple_ty, 1, 0);
    ctx.globals.val_empty_tuple = Value::from_obj(empty);

    // Operator symbols.
    ctx.globals.sym_call = intern(ctx, "call");
    ctx.globals.sym_hash = intern(ctx, "hash");
    ctx.globals.sym_cmp = intern(ctx, "<=>");
    ctx.globals.sym_equ = intern(ctx, "==");
    ctx.globals.sym_add = intern(ctx, "+");
    ctx.globals.sym_sub = intern(ctx, "-");
    ctx.globals.sym_mul = intern(ctx, "*");
    ctx.globals.sym_div = intern(ctx, "/");
    ctx.globals.sym_rem = intern(ctx, "%");
    ctx.globals.sym_pow = intern(ctx, "**");
    ctx.globals.sym_shl = intern(ctx, "<<");
    ctx.globals.sym_shr = intern(ctx, ">>");
    ctx.globals.sym_bitand = intern(ctx, "&");
    ctx.globals.sym_bitor = intern(ctx, "|");
    ctx.globals.sym_bitxor = intern(ctx, "^");
    ctx.globals.sym_neg = intern(ctx, "-#");
    ctx.globals.sym_bitnot = intern(ctx, "~");
    ctx.globals.sym_get_element = intern(ctx, "[]");
    ctx.globals.sym_set_element = intern(ctx, "[]=");
    ctx.globals.sym_insert = intern(ctx, "insert");
    ctx.globals.sym_remove = intern(ctx, "remove");

    // Type names, for diagnostics.
    let names: [(GlobalGet, &str); 16] = [
        (|g| g.type_type, "Type"),
        (|g| g.type_nil, "Nil"),
        (|g| g.type_bool, "Bool"),
        (|g| g.type_int, "Int"),
        (|g| g.type_float, "Float"),
        (|g| g.type_string, "String"),
        (|g| g.type_symbol, "Symbol"),
        (|g| g.type_tuple, "Tuple"),
        (|g| g.type_array_slots, "Array.Slots"),
        (|g| g.type_array, "Array"),
        (|g| g.type_map, "Map"),
        (|g| g.type_map_node, "Map.BucketNode"),
        (|g| g.type_range, "Range"),
        (|g| g.type_function, "Function"),
        (|g| g.type_module, "Module"),
        (|g| g.type_exception, "Exception"),
    ];
    for (get, name) in names {
        set_type_name(ctx, get, name);
    }

    // Method tables.  Int and Float share the mixed-numeric natives so that
    // either operand order dispatches identically.
    for get in [
        (|g: &Globals| g.type_int) as GlobalGet,
        |g| g.type_float,
        |g| g.type_string,
        |g| g.type_symbol,
        |g| g.type_bool,
        |g| g.type_nil,
        |g| g.type_tuple,
        |g| g.type_array,
        |g| g.type_map,
    ] {
        ensure_methods_map(ctx, get);
    }

    for get in [(|g: &Globals| g.type_int) as GlobalGet, |g| g.type_float] {
        def_method(ctx, get, "+", 2, 3, int_obj::native_add);
        def_method(ctx, get, "-", 2, 3, int_obj::native_sub);
        def_method(ctx, get, "*", 2, 3, int_obj::native_mul);
        def_method(ctx, get, "/", 2, 3, int_obj::native_div);
        def_method(ctx, get, "%", 2, 3, int_obj::native_rem);
        def_method(ctx, get, "**", 2, 3, int_obj::native_pow);
        def_method(ctx, get, "<<", 2, 3, int_obj::native_shl);
        def_method(ctx, get, ">>", 2, 3, int_obj::native_shr);
        def_method(ctx, get, "&", 2, 3, int_obj::native_bitand);
        def_method(ctx, get, "|", 2, 3, int_obj::native_bitor);
        def_method(ctx, get, "^", 2, 3, int_obj::native_bitxor);
        def_method(ctx, get, "-#", 1, 2, int_obj::native_neg);
        def_method(ctx, get, "~", 1, 2, int_obj::native_bitnot);
        def_method(ctx, get, "<=>", 2, 3, int_obj::native_cmp);
        def_method(ctx, get, "==", 2, 3, int_obj::native_equ);
        def_method(ctx, get, "hash", 1, 2, int_obj::native_hash);
    }

    {
        let get: GlobalGet = |g| g.type_string;
        def_method(ctx, get, "==", 2, 3, string_obj::native_equ);
        def_method(ctx, get, "<=>", 2, 3, string_obj::native_cmp);
        def_method(ctx, get, "hash", 1, 2, string_obj::native_hash);
        def_method(ctx, get, "+", 2, 3, string_obj::native_add);
    }
    {
        let get: GlobalGet = |g| g.type_symbol;
        def_method(ctx, get, "==", 2, 3, symbol_obj::native_equ);
        def_method(ctx, get, "<=>", 2, 3, symbol_obj::native_cmp);
        def_method(ctx, get, "hash", 1, 2, symbol_obj::native_hash);
    }
    for get in [(|g: &Globals| g.type_bool) as GlobalGet, |g| g.type_nil] {
        def_method(ctx, get, "==", 2, 3, bool_obj::native_equ);
        def_method(ctx, get, "hash", 1, 2, bool_obj::native_hash);
    }
    {
        let get: GlobalGet = |g| g.type_tuple;
        def_method(ctx, get, "[]", 2, 3, tuple_obj::native_get_element);
    }
    {
        let get: GlobalGet = |g| g.type_array;
        def_method(ctx, get, "[]", 2, 3, array_obj::native_get_element);
        def_method(ctx, get, "[]=", 3, 4, array_obj::native_set_element);
        def_method(ctx, get, "insert", 3, 4, array_obj::native_insert);
        def_method(ctx, get, "remove", 2, 3, array_obj::native_remove);
    }
    {
        let get: GlobalGet = |g| g.type_map;
        def_method(ctx, get, "[]", 2, 3, map_obj::native_get_element);
        def_method(ctx, get, "[]=", 3, 4, map_obj::native_set_element);
        def_method(ctx, get, "insert", 3, 4, map_obj::native_set_element);
        def_method(ctx, get, "remove", 2, 3, map_obj::native_remove);
    }

    // The entry module: where the embedder's named globals live.
    ctx.globals.entry_module = module_obj::new(ctx);

    info!("runtime globals bootstrapped");
}
