//! The instruction word.
//!
//! Instructions are 32-bit little-endian words.  Bits `[6:0]` hold the
//! opcode (128 slots, 67 defined); the remaining 25 bits hold the operands
//! in one of a small set of shapes:
//!
//! ```text
//! Aw     |         A:25          | op:7 |      unsigned A
//! Asw    |         A:25          | op:7 |      signed A
//! ABw    |    B:18     |  A:7    | op:7 |      A, unsigned B
//! ABsw   |    Bs:18    |  A:7    | op:7 |      A, signed B
//! AsBw   |    B:18     |  As:7   | op:7 |      signed A, unsigned B
//! ABC    | C:9  | B:9  |  A:7    | op:7 |      A, B, C
//! AsBC   | C:9  | B:9  |  As:7   | op:7 |      signed A, B, C
//! ABsCs  | Cs:9 | Bs:9 |  A:7    | op:7 |      A, signed B, signed C
//! ```
//!
//! `CALL` packs its own layout: bits `[31:27]` = return register, bits
//! `[26:25]` = argument count (at most 3), and three 6-bit argument
//! registers from bit 7.
//!
//! Register operands index the current frame.  Jump offsets are relative to
//! the jump instruction, in instruction words.

use std::fmt;

use strum_macros::FromRepr;

/// One instruction word.
pub type InstrWord = u32;

/// Number of defined opcodes.
pub const OPCODE_COUNT: usize = 67;

/// Largest variable index the self-caching global forms can encode.
pub const GLOBAL_INDEX_MAX: u32 = u16::MAX as u32;

/// The opcodes.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, FromRepr)]
pub enum Opcode {
    Nop = 0x00,
    Arg = 0x01,
    Brk = 0x03,
    LdNil = 0x04,
    LdBln = 0x05,
    LdCon = 0x06,
    LdSym = 0x07,
    MkInt = 0x08,
    MkFlt = 0x09,
    MkTup = 0x0a,
    MkArr = 0x0b,
    MkMap = 0x0c,
    MkRng = 0x0d,
    MkRngX = 0x0e,
    Thr = 0x10,
    RetNil = 0x11,
    Ret = 0x12,
    Call = 0x13,
    CallV = 0x15,
    CallP = 0x16,
    LdMth = 0x17,
    Imp = 0x18,
    ImpSub = 0x19,
    LdLoc = 0x1a,
    StLoc = 0x1b,
    LdGlb = 0x1c,
    StGlb = 0x1d,
    LdGlbX = 0x1e,
    StGlbX = 0x1f,
    LdFldY = 0x20,
    StFldY = 0x21,
    LdFldX = 0x22,
    StFldX = 0x23,
    LdElm = 0x24,
    StElm = 0x25,
    LdElmI = 0x26,
    StElmI = 0x27,
    Jmp = 0x28,
    JmpT = 0x29,
    JmpF = 0x2a,
    JmpLe = 0x2b,
    JmpLt = 0x2c,
    JmpEq = 0x2d,
    JmpGt = 0x2e,
    JmpGe = 0x2f,
    JmpNe = 0x30,
    Cmp = 0x31,
    CmpLe = 0x32,
    CmpLt = 0x33,
    CmpEq = 0x34,
    CmpGt = 0x35,
    CmpGe = 0x36,
    CmpNe = 0x37,
    Add = 0x38,
    Sub = 0x39,
    Mul = 0x3a,
    Div = 0x3b,
    Rem = 0x3c,
    Pow = 0x3d,
    Shl = 0x3e,
    Shr = 0x3f,
    BitAnd = 0x40,
    BitOr = 0x41,
    BitXor = 0x42,
    Not = 0x44,
    Neg = 0x45,
    BitNot = 0x46,
}

impl Opcode {
    /// Decode the opcode field of an instruction word.
    pub fn of(word: InstrWord) -> Option<Opcode> {
        Opcode::from_repr((word & 0x7f) as u8)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", format!("{:?}", self).to_uppercase())
    }
}

const fn sign_extend(v: u32, bits: u32) -> i32 {
    ((v << (32 - bits)) as i32) >> (32 - bits)
}

// ----- operand extraction ------------------------------------------------

pub fn operands_aw(w: InstrWord) -> u32 {
    w >> 7
}

pub fn operands_asw(w: InstrWord) -> i32 {
    (w as i32) >> 7
}

pub fn operands_abw(w: InstrWord) -> (u32, u32) {
    ((w >> 7) & 0x7f, w >> 14)
}

pub fn operands_absw(w: InstrWord) -> (u32, i32) {
    ((w >> 7) & 0x7f, (w as i32) >> 14)
}

pub fn operands_asbw(w: InstrWord) -> (i32, u32) {
    (sign_extend((w >> 7) & 0x7f, 7), w >> 14)
}

pub fn operands_abc(w: InstrWord) -> (u32, u32, u32) {
    ((w >> 7) & 0x7f, (w >> 14) & 0x1ff, w >> 23)
}

pub fn operands_asbc(w: InstrWord) -> (i32, u32, u32) {
    (sign_extend((w >> 7) & 0x7f, 7), (w >> 14) & 0x1ff, w >> 23)
}

pub fn operands_abscs(w: InstrWord) -> (u32, i32, i32) {
    (
        (w >> 7) & 0x7f,
        sign_extend((w >> 14) & 0x1ff, 9),
        (w as i32) >> 23,
    )
}

/// `CALL`: return register, argument count, argument registers.
pub fn operands_call(w: InstrWord) -> (u32, u32, [u32; 3]) {
    let ret = w >> 27;
    let argc = (w >> 25) & 3;
    let args = [(w >> 7) & 63, (w >> 13) & 63, (w >> 19) & 63];
    (ret, argc, args)
}

// ----- encoding ----------------------------------------------------------

pub fn make_aw(op: Opcode, a: u32) -> InstrWord {
    debug_assert!(a < (1 << 25));
    op as u32 | (a << 7)
}

pub fn make_asw(op: Opcode, a: i32) -> InstrWord {
    debug_assert!((-(1 << 24)..(1 << 24)).contains(&a));
    op as u32 | (((a as u32) & 0x01ff_ffff) << 7)
}

pub fn make_abw(op: Opcode, a: u32, b: u32) -> InstrWord {
    debug_assert!(a < (1 << 7) && b < (1 << 18));
    op as u32 | (a << 7) | (b << 14)
}

pub fn make_absw(op: Opcode, a: u32, b: i32) -> InstrWord {
    debug_assert!(a < (1 << 7) && (-(1 << 17)..(1 << 17)).contains(&b));
    op as u32 | (a << 7) | (((b as u32) & 0x3ffff) << 14)
}

pub fn make_asbw(op: Opcode, a: i32, b: u32) -> InstrWord {
    debug_assert!((-(1 << 6)..(1 << 6)).contains(&a) && b < (1 << 18));
    op as u32 | (((a as u32) & 0x7f) << 7) | (b << 14)
}

pub fn make_abc(op: Opcode, a: u32, b: u32, c: u32) -> InstrWord {
    debug_assert!(a < (1 << 7) && b < (1 << 9) && c < (1 << 9));
    op as u32 | (a << 7) | (b << 14) | (c << 23)
}

pub fn make_asbc(op: Opcode, a: i32, b: u32, c: u32) -> InstrWord {
    debug_assert!((-(1 << 6)..(1 << 6)).contains(&a) && b < (1 << 9) && c < (1 << 9));
    op as u32 | (((a as u32) & 0x7f) << 7) | (b << 14) | (c << 23)
}

pub fn make_abscs(op: Opcode, a: u32, b: i32, c: i32) -> InstrWord {
    debug_assert!(a < (1 << 7));
    debug_assert!((-(1 << 8)..(1 << 8)).contains(&b) && (-(1 << 8)..(1 << 8)).contains(&c));
    op as u32 | (a << 7) | (((b as u32) & 0x1ff) << 14) | (((c as u32) & 0x1ff) << 23)
}

pub fn make_call(ret: u32, argc: u32, args: [u32; 3]) -> InstrWord {
    debug_assert!(ret < (1 << 5) && argc <= 3);
    debug_assert!(args.iter().all(|&r| r < (1 << 6)));
    Opcode::Call as u32 | (args[0] << 7) | (args[1] << 13) | (args[2] << 19) | (argc << 25) | (ret << 27)
}

/// Format one instruction word, for debug dumps and disassembly.
pub fn format_instr(w: InstrWord) -> String {
    let Some(op) = Opcode::of(w) else {
        return format!("<illegal {:#010x}>", w);
    };
    use Opcode::*;
    match op {
        Nop | Arg | Brk | RetNil => format!("{}", op),
        Thr | Ret => format!("{} {}", op, operands_aw(w)),
        Jmp => format!("{} {}", op, operands_asw(w)),
        MkInt => {
            let (a, b) = operands_absw(w);
            format!("{} {}, {}", op, a, b)
        }
        MkFlt => {
            let (a, b, c) = operands_abscs(w);
            format!("{} {}, {}, {}", op, a, b, c)
        }
        JmpT | JmpF => {
            let (a, b) = operands_asbw(w);
            format!("{} {}, {}", op, a, b)
        }
        JmpLe | JmpLt | JmpEq | JmpGt | JmpGe | JmpNe => {
            let (a, b, c) = operands_asbc(w);
            format!("{} {}, {}, {}", op, a, b, c)
        }
        LdElmI | StElmI => {
            let (a, b, c) = operands_asbc(w);
            format!("{} {}, {}, {}", op, a, b, c)
        }
        Call => {
            let (ret, argc, args) = operands_call(w);
            format!("{} {}, {:?}", op, ret, &args[..argc as usize])
        }
        MkTup | MkArr | MkMap | MkRng | MkRngX | CallV | LdFldY | StFldY | LdFldX | StFldX
        | LdElm | StElm | Cmp | CmpLe | CmpLt | CmpEq | CmpGt | CmpGe | CmpNe | Add | Sub
        | Mul | Div | Rem | Pow | Shl | Shr | BitAnd | BitOr | BitXor => {
            let (a, b, c) = operands_abc(w);
            format!("{} {}, {}, {}", op, a, b, c)
        }
        _ => {
            let (a, b) = operands_abw(w);
            format!("{} {}, {}", op, a, b)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defined_opcode_count() {
        let n = (0u8..128).filter(|&b| Opcode::from_repr(b).is_some()).count();
        assert_eq!(n, OPCODE_COUNT);
    }

    #[test]
    fn operand_round_trips() {
        let w = make_abw(Opcode::LdCon, 5, 1234);
        assert_eq!(Opcode::of(w), Some(Opcode::LdCon));
        assert_eq!(operands_abw(w), (5, 1234));

        let w = make_absw(Opcode::MkInt, 3, -77);
        assert_eq!(operands_absw(w), (3, -77));

        let w = make_asw(Opcode::Jmp, -1000);
        assert_eq!(operands_asw(w), -1000);

        let w = make_asbc(Opcode::JmpLt, -9, 2, 3);
        assert_eq!(operands_asbc(w), (-9, 2, 3));

        let w = make_abscs(Opcode::MkFlt, 1, -200, -3);
        assert_eq!(operands_abscs(w), (1, -200, -3));

        let w = make_asbw(Opcode::JmpT, -4, 7);
        assert_eq!(operands_asbw(w), (-4, 7));
    }

    #[test]
    fn call_packing() {
        let w = make_call(4, 3, [1, 2, 3]);
        assert_eq!(Opcode::of(w), Some(Opcode::Call));
        assert_eq!(operands_call(w), (4, 3, [1, 2, 3]));
    }

    #[test]
    fn global_cache_rewrite_form() {
        let w = make_abw(Opcode::LdGlb, 2, 17);
        let rewritten = make_abw(Opcode::LdGlbX, (w >> 7) & 0x7f, 5);
        assert_eq!(Opcode::of(rewritten), Some(Opcode::LdGlbX));
        assert_eq!(operands_abw(rewritten), (2, 5));
    }
}
