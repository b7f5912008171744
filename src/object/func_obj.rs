//! The `Function` type.
//!
//! A function's slots hold its interned symbol table, its constant table
//! (both tuples) and its owning module.  The bytes region starts with the
//! arity metadata, the native entry point (zero for bytecode functions) and
//! the instruction count, followed by the bytecode itself.  Keeping the
//! bytecode inside the object means a relocation moves it atomically with
//! the function, so the self-modifying global-access instructions stay
//! valid across collections.

use crate::context::{Context, ExecResult};
use crate::mem::objmem::{self, AllocHint};
use crate::util::constants::{BYTES_IN_INSTR, BYTES_IN_WORD};
use crate::util::conversions::round_up_to;

use super::type_obj::SizeSpec;
use super::value::{ObjRef, Value};

pub const LAYOUT: (SizeSpec, SizeSpec) = (SizeSpec::Fixed(3), SizeSpec::Extendable);

const SLOT_SYMBOLS: usize = 0;
const SLOT_CONSTANTS: usize = 1;
const SLOT_MODULE: usize = 2;

/// Fixed prefix of the bytes region: size word, arity word, native entry,
/// instruction count.
const BYTES_FIXED_WORDS: usize = 4;

/// A native function: executes in Rust, reads its arguments from the frame
/// registers, and leaves its result (or thrown exception) in REG-0.
pub type NativeFn = fn(&mut Context) -> ExecResult;

/// Function arity metadata.
///
/// `na` is the required argument count and `nr` the frame register count.
/// `no` encodes the optionals: `0` means none; `n > 0` means `n` fixed
/// optionals (so at most `na + n` arguments); `-1` means pure variadic (the
/// remainder is gathered into a tuple); `n < -1` means `-n - 1` fixed
/// optionals followed by a variadic tail.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct FuncMeta {
    pub na: u8,
    pub no: i8,
    pub nr: u16,
}

impl FuncMeta {
    /// Argument slots the callee frame layout reserves beyond REG-0.
    pub fn arg_slots(self) -> usize {
        let opt = match self.no {
            0 => 0,
            n if n > 0 => n as usize,
            -1 => 1,
            n => (-n as usize - 1) + 1,
        };
        self.na as usize + opt
    }

    /// Is the frame large enough for the argument layout?
    pub fn is_valid(self) -> bool {
        self.nr as usize >= 1 + self.arg_slots()
    }

    fn to_word(self) -> usize {
        self.na as usize | ((self.no as u8 as usize) << 8) | ((self.nr as usize) << 16)
    }

    fn from_word(word: usize) -> FuncMeta {
        FuncMeta {
            na: word as u8,
            no: (word >> 8) as u8 as i8,
            nr: (word >> 16) as u16,
        }
    }
}

fn alloc_func(ctx: &mut Context, meta: FuncMeta, code_words: usize) -> ObjRef {
    debug_assert!(meta.is_valid());
    let ty = ctx.globals.type_function.as_obj();
    let ext_bytes =
        BYTES_FIXED_WORDS * BYTES_IN_WORD + round_up_to(code_words * BYTES_IN_INSTR, BYTES_IN_WORD);
    let obj = ctx.mem.alloc_ex(AllocHint::Survivor, ty, 0, ext_bytes);
    unsafe {
        let base = obj.bytes_base();
        (base + BYTES_IN_WORD).store(meta.to_word());
        (base + 2 * BYTES_IN_WORD).store(0usize);
        (base + 3 * BYTES_IN_WORD).store(code_words);
    }
    obj
}

/// Create a native function.  Natives carry no symbol or constant tables
/// and no owning module.
pub fn new_native(ctx: &mut Context, meta: FuncMeta, native: NativeFn) -> Value {
    let empty = ctx.globals.val_empty_tuple;
    let obj = alloc_func(ctx, meta, 0);
    obj.set_slot(SLOT_SYMBOLS, empty);
    obj.set_slot(SLOT_CONSTANTS, empty);
    obj.set_slot(SLOT_MODULE, Value::SMALLINT_ZERO);
    unsafe { (obj.bytes_base() + 2 * BYTES_IN_WORD).store(native as usize) };
    Value::from_obj(obj)
}

/// Create a bytecode function.  The tables and the owning module are read
/// from stack slots (tuples in `symbols_slot` / `constants_slot`, module or
/// small-int 0 in `module_slot`) so they survive the allocation.
pub fn new_bytecode(
    ctx: &mut Context,
    meta: FuncMeta,
    code: &[u32],
    symbols_slot: usize,
    constants_slot: usize,
    module_slot: usize,
) -> Value {
    let obj = alloc_func(ctx, meta, code.len());
    obj.set_slot(SLOT_SYMBOLS, ctx.stack.get(symbols_slot));
    obj.set_slot(SLOT_CONSTANTS, ctx.stack.get(constants_slot));
    obj.set_slot(SLOT_MODULE, ctx.stack.get(module_slot));
    objmem::write_barrier_n(obj, 0, 3);
    unsafe {
        let dst = (obj.bytes_base() + BYTES_FIXED_WORDS * BYTES_IN_WORD).to_mut_ptr::<u32>();
        std::ptr::copy_nonoverlapping(code.as_ptr(), dst, code.len());
    }
    Value::from_obj(obj)
}

pub fn meta(func: ObjRef) -> FuncMeta {
    FuncMeta::from_word(unsafe { (func.bytes_base() + BYTES_IN_WORD).load() })
}

/// The native entry point, or `None` for a bytecode function.
pub fn native(func: ObjRef) -> Option<NativeFn> {
    let word: usize = unsafe { (func.bytes_base() + 2 * BYTES_IN_WORD).load() };
    if word == 0 {
        None
    } else {
        Some(unsafe { std::mem::transmute::<usize, NativeFn>(word) })
    }
}

/// Number of bytecode instructions.
pub fn bytecode_len(func: ObjRef) -> usize {
    unsafe { (func.bytes_base() + 3 * BYTES_IN_WORD).load() }
}

fn code_base(func: ObjRef) -> crate::util::Address {
    func.bytes_base() + BYTES_FIXED_WORDS * BYTES_IN_WORD
}

/// Fetch one instruction word.
pub fn bytecode_word(func: ObjRef, index: usize) -> Option<u32> {
    if index < bytecode_len(func) {
        Some(unsafe { (code_base(func) + index * BYTES_IN_INSTR).load() })
    } else {
        None
    }
}

/// Rewrite one instruction word in place (the `LDGLB`/`STGLB` self-caching
/// forms are the only users).
pub fn rewrite_bytecode_word(func: ObjRef, index: usize, word: u32) {
    debug_assert!(index < bytecode_len(func));
    unsafe { (code_base(func) + index * BYTES_IN_INSTR).store(word) };
}

/// Copy the bytecode out (disassembly interface).
pub fn bytecode_to_vec(func: ObjRef) -> Vec<u32> {
    (0..bytecode_len(func))
        .map(|i| bytecode_word(func, i).unwrap())
        .collect()
}

pub fn symbol_count(func: ObjRef) -> usize {
    super::tuple_obj::length(func.slot(SLOT_SYMBOLS))
}

pub fn symbol(func: ObjRef, index: usize) -> Value {
    super::tuple_obj::get(func.slot(SLOT_SYMBOLS), index)
}

pub fn constant_count(func: ObjRef) -> usize {
    super::tuple_obj::length(func.slot(SLOT_CONSTANTS))
}

pub fn constant(func: ObjRef, index: usize) -> Value {
    super::tuple_obj::get(func.slot(SLOT_CONSTANTS), index)
}

/// The owning module, or small-int 0 for module-less natives.
pub fn module(func: ObjRef) -> Value {
    func.slot(SLOT_MODULE)
}

#[cfg(test)]
mod tests {
    use super::FuncMeta;

    #[test]
    fn meta_word_round_trip() {
        for meta in [
            FuncMeta { na: 0, no: 0, nr: 1 },
            FuncMeta { na: 2, no: 0, nr: 4 },
            FuncMeta { na: 1, no: -1, nr: 8 },
            FuncMeta { na: 3, no: -3, nr: 16 },
            FuncMeta { na: 2, no: 5, nr: 255 },
        ] {
            assert_eq!(FuncMeta::from_word(meta.to_word()), meta);
            assert!(meta.is_valid());
        }
    }

    #[test]
    fn arg_slot_layout() {
        // na required, k fixed optionals, optional variadic tail.
        assert_eq!(FuncMeta { na: 2, no: 0, nr: 8 }.arg_slots(), 2);
        assert_eq!(FuncMeta { na: 2, no: 3, nr: 8 }.arg_slots(), 5);
        assert_eq!(FuncMeta { na: 2, no: -1, nr: 8 }.arg_slots(), 3);
        assert_eq!(FuncMeta { na: 2, no: -3, nr: 8 }.arg_slots(), 5);
    }
}
