//! Opcode definitions for the Lumen virtual machine.
//!
//! Instructions are host machine words: one opcode word followed by a
//! fixed number of operand words (zero to three, per opcode). Jump
//! operands are offsets relative to the opcode's own address, so code is
//! position independent.

use crate::error::{VmError, VmResult};

/// The instruction set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum Opcode {
    /// No operation.
    Nop = 0,
    /// Push VALR onto the operand stack.
    Push = 1,
    /// Pop the stack into VALR.
    Pop = 2,
    /// Push a copy of the top of stack.
    Dup = 3,
    /// VALR ← tagged immediate operand.
    Ldi = 4,
    /// VALR ← literal N of the running code object.
    Ldl = 5,
    /// VALR ← global binding of symbol literal N; faults when unbound.
    Ldg = 6,
    /// Bind symbol literal N globally to VALR.
    Stg = 7,
    /// VALR ← environment slot (depth D, index I).
    Lde = 8,
    /// Environment slot (depth D, index I) ← VALR.
    Ste = 9,
    /// VALR ← environment slot (depth 0, index I).
    Ldei = 10,
    /// Environment slot (depth 0, index I) ← VALR.
    Stei = 11,
    /// Build an environment frame: P required, O optional, X extra slots.
    Env = 12,
    /// As `Env`, plus a rest slot collecting trailing arguments.
    Envr = 13,
    /// Tail merge: drop the current frame, keep the top N stack values
    /// as the pending arguments.
    Menv = 14,
    /// Push a continuation resuming at (own address + Δ); clear stack.
    Cont = 15,
    /// ARGC ← N, then hand VALR to the trampoline for application.
    Apply = 16,
    /// Return through the topmost continuation.
    Ret = 17,
    /// Unconditional relative jump.
    Jmp = 18,
    /// Jump when VALR is true.
    Jt = 19,
    /// Jump when VALR is nil.
    Jf = 20,
    /// Jump when VALR is bound (not the unbound sentinel).
    Jbnd = 21,
    /// VALR ← t.
    True = 22,
    /// VALR ← nil.
    Nil = 23,
    /// Release the thread.
    Hlt = 24,
    Add = 25,
    Sub = 26,
    Mul = 27,
    Div = 28,
    /// VALR ← (pop . VALR).
    Cons = 29,
    Car = 30,
    Cdr = 31,
    /// Set car of popped cons to VALR.
    Scar = 32,
    /// Set cdr of popped cons to VALR.
    Scdr = 33,
    /// VALR ← (VALR . pop).
    Consr = 34,
    /// Splice the popped list onto the end of the list in VALR.
    Spl = 35,
    /// Shallow equality.
    Is = 36,
    /// Structural equality.
    Iso = 37,
    /// VALR ← pop > VALR.
    Gt = 38,
    /// VALR ← pop < VALR.
    Lt = 39,
    /// VALR ← closure over the current environment and the code in VALR.
    Cls = 40,
}

const OPCODE_MAX: i64 = Opcode::Cls as i64;

impl Opcode {
    /// Number of operand words following the opcode word.
    pub fn operand_count(self) -> usize {
        use Opcode::*;
        match self {
            Ldi | Ldl | Ldg | Stg | Ldei | Stei | Menv | Cont | Apply | Jmp | Jt | Jf | Jbnd => 1,
            Lde | Ste => 2,
            Env | Envr => 3,
            _ => 0,
        }
    }

    /// Assembler mnemonic.
    pub fn mnemonic(self) -> &'static str {
        use Opcode::*;
        match self {
            Nop => "nop",
            Push => "push",
            Pop => "pop",
            Dup => "dup",
            Ldi => "ldi",
            Ldl => "ldl",
            Ldg => "ldg",
            Stg => "stg",
            Lde => "lde",
            Ste => "ste",
            Ldei => "ldei",
            Stei => "stei",
            Env => "env",
            Envr => "envr",
            Menv => "menv",
            Cont => "cont",
            Apply => "apply",
            Ret => "ret",
            Jmp => "jmp",
            Jt => "jt",
            Jf => "jf",
            Jbnd => "jbnd",
            True => "true",
            Nil => "nil",
            Hlt => "hlt",
            Add => "add",
            Sub => "sub",
            Mul => "mul",
            Div => "div",
            Cons => "cons",
            Car => "car",
            Cdr => "cdr",
            Scar => "scar",
            Scdr => "scdr",
            Consr => "consr",
            Spl => "spl",
            Is => "is",
            Iso => "iso",
            Gt => "gt",
            Lt => "lt",
            Cls => "cls",
        }
    }

    /// Decode an instruction word.
    pub fn decode(word: i64) -> VmResult<Opcode> {
        use Opcode::*;
        Ok(match word {
            0 => Nop,
            1 => Push,
            2 => Pop,
            3 => Dup,
            4 => Ldi,
            5 => Ldl,
            6 => Ldg,
            7 => Stg,
            8 => Lde,
            9 => Ste,
            10 => Ldei,
            11 => Stei,
            12 => Env,
            13 => Envr,
            14 => Menv,
            15 => Cont,
            16 => Apply,
            17 => Ret,
            18 => Jmp,
            19 => Jt,
            20 => Jf,
            21 => Jbnd,
            22 => True,
            23 => Nil,
            24 => Hlt,
            25 => Add,
            26 => Sub,
            27 => Mul,
            28 => Div,
            29 => Cons,
            30 => Car,
            31 => Cdr,
            32 => Scar,
            33 => Scdr,
            34 => Consr,
            35 => Spl,
            36 => Is,
            37 => Iso,
            38 => Gt,
            39 => Lt,
            40 => Cls,
            _ => return Err(VmError::InvalidOpcode { word }),
        })
    }
}

impl TryFrom<i64> for Opcode {
    type Error = VmError;

    fn try_from(word: i64) -> VmResult<Opcode> {
        Opcode::decode(word)
    }
}
