//! Written representation of values.
//!
//! Used by the instruction trace hook, exception details and tests.
//! Output follows the reader syntax where one exists; opaque objects
//! print as `#<kind ...>`.

use crate::code::CodeData;
use crate::heap::{Heap, ObjKind};
use crate::opcode::Opcode;
use crate::symbols::SymbolTable;
use crate::value::Value;

const MAX_DEPTH: usize = 24;

/// Render a value.
pub fn write_value(heap: &Heap, symbols: &SymbolTable, v: Value) -> String {
    let mut out = String::new();
    write_into(&mut out, heap, symbols, v, MAX_DEPTH);
    out
}

fn write_into(out: &mut String, heap: &Heap, symbols: &SymbolTable, v: Value, depth: usize) {
    if depth == 0 {
        out.push_str("...");
        return;
    }
    match v {
        Value::Nil => out.push_str("nil"),
        Value::True => out.push('t'),
        Value::Unbound => out.push_str("#<unbound>"),
        Value::Fixnum(n) => out.push_str(&n.to_string()),
        Value::Char(c) => write_char(out, c),
        Value::Sym(s) => out.push_str(symbols.name(s)),
        Value::StackEnv(_) => out.push_str("#<environment>"),
        Value::Obj(r) => match heap.kind(r) {
            ObjKind::Cons(..) => write_list(out, heap, symbols, v, depth),
            ObjKind::Vector(items) => {
                out.push_str("#(");
                for (i, &item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    write_into(out, heap, symbols, item, depth - 1);
                }
                out.push(')');
            }
            ObjKind::Str(s) => {
                out.push('"');
                for c in s.chars() {
                    match c {
                        '"' => out.push_str("\\\""),
                        '\\' => out.push_str("\\\\"),
                        '\n' => out.push_str("\\n"),
                        _ => out.push(c),
                    }
                }
                out.push('"');
            }
            ObjKind::Flonum(f) => out.push_str(&write_flonum(*f)),
            ObjKind::Bignum(n) => out.push_str(&n.to_string()),
            ObjKind::Rational(q) => out.push_str(&format!("{}/{}", q.numer(), q.denom())),
            ObjKind::Complex(z) => out.push_str(&format!(
                "{}{}{}i",
                write_flonum(z.re),
                if z.im >= 0.0 { "+" } else { "-" },
                write_flonum(z.im.abs())
            )),
            ObjKind::Code(code) => out.push_str(&format!("#<code: {}>", code.name)),
            ObjKind::Closure { code, .. } => match heap.kind(*code) {
                ObjKind::Code(c) => out.push_str(&format!("#<fn: {}>", c.name)),
                _ => out.push_str("#<fn>"),
            },
            ObjKind::Sff(f) => out.push_str(&format!("#<builtin: {}>", f.name)),
            ObjKind::Rff(f) => out.push_str(&format!("#<builtin: {}>", f.name)),
            ObjKind::Cont(_) => out.push_str("#<continuation>"),
            ObjKind::HeapEnv(_) => out.push_str("#<environment>"),
            ObjKind::Exception(exc) => {
                out.push_str("#<exception: ");
                write_into(out, heap, symbols, exc.details, depth - 1);
                out.push('>');
            }
            ObjKind::Handler(_) => out.push_str("#<handler>"),
            ObjKind::Channel(_) => out.push_str("#<channel>"),
            ObjKind::Thread(tid) => out.push_str(&format!("#<thread: {}>", tid.0)),
        },
    }
}

fn write_list(out: &mut String, heap: &Heap, symbols: &SymbolTable, v: Value, depth: usize) {
    out.push('(');
    let mut cur = v;
    let mut budget = 64;
    loop {
        match heap.pair(cur) {
            Some((car, cdr)) => {
                write_into(out, heap, symbols, car, depth - 1);
                match cdr {
                    Value::Nil => break,
                    _ if heap.pair(cdr).is_some() => {
                        out.push(' ');
                        cur = cdr;
                        budget -= 1;
                        if budget == 0 {
                            out.push_str("...");
                            break;
                        }
                    }
                    _ => {
                        out.push_str(" . ");
                        write_into(out, heap, symbols, cdr, depth - 1);
                        break;
                    }
                }
            }
            None => break,
        }
    }
    out.push(')');
}

fn write_char(out: &mut String, c: char) {
    match c {
        '\n' => out.push_str("#\\newline"),
        '\t' => out.push_str("#\\tab"),
        ' ' => out.push_str("#\\space"),
        _ => {
            out.push_str("#\\");
            out.push(c);
        }
    }
}

/// Flonum rendering in the classic `%g` spirit: plain notation in the
/// middle of the range, exponent notation at the extremes.
pub fn write_flonum(f: f64) -> String {
    if f.is_nan() {
        return "+nan.0".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "+inf.0" } else { "-inf.0" }.to_string();
    }
    let a = f.abs();
    if f != 0.0 && !(1e-4..1e17).contains(&a) {
        format!("{f:e}")
    } else {
        format!("{f}")
    }
}

/// Disassemble the instruction at `addr`, for the trace hook.
pub fn disasm(code: &CodeData, addr: usize) -> String {
    let Some(&word) = code.words.get(addr) else {
        return format!("{addr:05} <end>");
    };
    match Opcode::decode(word) {
        Ok(op) => {
            let mut s = format!("{addr:05} {}", op.mnemonic());
            for i in 0..op.operand_count() {
                match code.words.get(addr + 1 + i) {
                    Some(&w) => s.push_str(&format!(" {w}")),
                    None => s.push_str(" ?"),
                }
            }
            s
        }
        Err(_) => format!("{addr:05} .word {word:#x}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::SymbolTable;

    #[test]
    fn immediates() {
        let heap = Heap::new();
        let mut syms = SymbolTable::new();
        let s = syms.intern_value("caught");
        assert_eq!(write_value(&heap, &syms, Value::Nil), "nil");
        assert_eq!(write_value(&heap, &syms, Value::True), "t");
        assert_eq!(write_value(&heap, &syms, Value::Fixnum(-7)), "-7");
        assert_eq!(write_value(&heap, &syms, Value::Char('a')), "#\\a");
        assert_eq!(write_value(&heap, &syms, s), "caught");
    }

    #[test]
    fn lists_and_strings() {
        let mut heap = Heap::new();
        let syms = SymbolTable::new();
        let tail = heap.cons(Value::Fixnum(2), Value::Fixnum(3)).expect("cons");
        let l = heap.cons(Value::Fixnum(1), tail).expect("cons");
        assert_eq!(write_value(&heap, &syms, l), "(1 2 . 3)");
        let s = heap.string("a\"b").expect("string");
        assert_eq!(write_value(&heap, &syms, s), "\"a\\\"b\"");
    }

    #[test]
    fn flonums() {
        assert_eq!(write_flonum(3.25), "3.25");
        assert_eq!(write_flonum(f64::INFINITY), "+inf.0");
        assert!(write_flonum(1e20).contains('e'));
    }
}
