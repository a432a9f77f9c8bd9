//! Code objects and the bytecode assembler.
//!
//! A code object is `(version, literal vector, instruction vector,
//! source name)`. Instruction words are host machine words and the
//! format is not portable across builds; literal operands index the
//! per-code literal vector, and jump operands are relative to their
//! opcode word.

use crate::error::{VmError, VmResult};
use crate::heap::{Heap, ObjKind};
use crate::opcode::Opcode;
use crate::value::{ObjRef, Value};

/// Bytecode format version.
pub const CODE_VERSION: u32 = 1;

/// Payload of a code object.
#[derive(Debug)]
pub struct CodeData {
    pub version: u32,
    pub literals: Vec<Value>,
    pub words: Vec<i64>,
    /// Source name, for backtraces and the trace hook.
    pub name: String,
}

impl CodeData {
    /// Fetch the literal at `index`.
    pub fn literal(&self, index: usize) -> VmResult<Value> {
        self.literals
            .get(index)
            .copied()
            .ok_or(VmError::LiteralOutOfRange { index })
    }
}

/// Incremental assembler for code objects, used by the compiler and by
/// tests that hand-assemble programs.
#[derive(Debug, Default)]
pub struct CodeBuilder {
    words: Vec<i64>,
    literals: Vec<Value>,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address of the next instruction to be emitted.
    pub fn here(&self) -> usize {
        self.words.len()
    }

    /// Append an operand-less instruction.
    pub fn emit(&mut self, op: Opcode) -> &mut Self {
        self.words.push(op as i64);
        self
    }

    pub fn emit1(&mut self, op: Opcode, a: i64) -> &mut Self {
        self.words.push(op as i64);
        self.words.push(a);
        self
    }

    pub fn emit2(&mut self, op: Opcode, a: i64, b: i64) -> &mut Self {
        self.words.push(op as i64);
        self.words.push(a);
        self.words.push(b);
        self
    }

    pub fn emit3(&mut self, op: Opcode, a: i64, b: i64, c: i64) -> &mut Self {
        self.words.push(op as i64);
        self.words.push(a);
        self.words.push(b);
        self.words.push(c);
        self
    }

    /// Emit `ldi` with a tagged immediate operand.
    pub fn emit_ldi(&mut self, v: Value) -> VmResult<&mut Self> {
        let word = v
            .encode_word()
            .ok_or(VmError::mismatch("ldi", "non-immediate value"))?;
        Ok(self.emit1(Opcode::Ldi, word))
    }

    /// Intern a literal and return its index.
    pub fn literal(&mut self, v: Value) -> usize {
        if let Some(i) = self.literals.iter().position(|&l| l == v) {
            return i;
        }
        self.literals.push(v);
        self.literals.len() - 1
    }

    /// Emit a jump-family instruction with a zero offset, returning the
    /// address of the opcode word for later patching.
    pub fn emit_jump(&mut self, op: Opcode) -> usize {
        let at = self.here();
        self.emit1(op, 0);
        at
    }

    /// Patch the jump emitted at `at` to land on `target`.
    pub fn patch_jump(&mut self, at: usize, target: usize) {
        self.words[at + 1] = target as i64 - at as i64;
    }

    /// Finish assembly into a heap code object.
    pub fn finish(self, heap: &mut Heap, name: &str) -> VmResult<Value> {
        let code = CodeData {
            version: CODE_VERSION,
            literals: self.literals,
            words: self.words,
            name: name.to_string(),
        };
        Ok(Value::Obj(heap.alloc(ObjKind::Code(code))?))
    }
}

/// Pair a code object with an environment.
pub fn mkclosure(heap: &mut Heap, code: Value, env: Value) -> VmResult<Value> {
    let code_ref = match code {
        Value::Obj(r) if matches!(heap.kind(r), ObjKind::Code(_)) => r,
        _ => return Err(VmError::mismatch("closure", heap.type_name(code))),
    };
    Ok(Value::Obj(heap.alloc(ObjKind::Closure {
        code: code_ref,
        env,
    })?))
}

/// The code object behind a closure value, when there is one.
pub fn closure_code(heap: &Heap, clos: Value) -> Option<ObjRef> {
    match clos {
        Value::Obj(r) => match heap.kind(r) {
            ObjKind::Closure { code, .. } => Some(*code),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_words_and_literals() {
        let mut heap = Heap::new();
        let mut cb = CodeBuilder::new();
        let pi = heap.flonum(3.25).expect("flonum");
        let l = cb.literal(pi);
        assert_eq!(l, 0);
        assert_eq!(cb.literal(pi), 0, "literals dedupe");
        cb.emit1(Opcode::Ldl, l as i64);
        cb.emit(Opcode::Hlt);
        let code = cb.finish(&mut heap, "test").expect("finish");
        let Value::Obj(r) = code else {
            panic!("code is a heap value")
        };
        match heap.kind(r) {
            ObjKind::Code(c) => {
                assert_eq!(c.version, CODE_VERSION);
                assert_eq!(c.words, vec![Opcode::Ldl as i64, 0, Opcode::Hlt as i64]);
                assert_eq!(c.literal(0).expect("literal"), pi);
                assert!(c.literal(1).is_err());
            }
            _ => panic!("expected code object"),
        }
    }

    #[test]
    fn jump_patching_is_relative_to_opcode() {
        let mut cb = CodeBuilder::new();
        cb.emit(Opcode::True);
        let j = cb.emit_jump(Opcode::Jt);
        cb.emit_ldi(Value::Fixnum(1)).expect("immediate");
        let target = cb.here();
        cb.patch_jump(j, target);
        assert_eq!(cb.words[j + 1], (target - j) as i64);
    }

    #[test]
    fn closures_require_code() {
        let mut heap = Heap::new();
        let s = heap.string("nope").expect("string");
        assert!(mkclosure(&mut heap, s, Value::Nil).is_err());
        let code = CodeBuilder::new().finish(&mut heap, "empty").expect("code");
        let clos = mkclosure(&mut heap, code, Value::Nil).expect("closure");
        assert!(closure_code(&heap, clos).is_some());
    }
}
