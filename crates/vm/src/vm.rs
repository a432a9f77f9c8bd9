//! The virtual machine: context object, trampoline and dispatch loop.
//!
//! [`Vm`] is the single context threaded through every entry point; it
//! owns the heap, the symbol and global tables, the thread list and the
//! host error sink. Nothing in the runtime is a hidden static.
//!
//! The trampoline is the only entry from the scheduler into a running
//! thread. It loops over four states: `Resume` steps bytecode or
//! re-enters a resumable native function, `FnApp` applies whatever sits
//! in the value register, `Rc` restores the topmost continuation, and
//! `Suspend` hands control back to the scheduler. All `Rc` and `FnApp`
//! work drains inside the loop, so tail-call chains never grow the
//! native stack and quantum accounting stays in one place.

use hashbrown::HashMap;

use crate::arith;
use crate::code::{self, CodeBuilder};
use crate::cont;
use crate::env;
use crate::error::{VmError, VmResult};
use crate::exception;
use crate::ffi::{self, SffFn};
use crate::fmt;
use crate::heap::{Heap, ObjKind};
use crate::opcode::Opcode;
use crate::symbols::SymbolTable;
use crate::thread::{Thread, ThreadId, ThreadState};
use crate::value::{ObjRef, Sym, Value};

/// Trampoline states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tramp {
    /// Step the current function (bytecode or resumable native).
    Resume,
    /// Return control to the scheduler.
    Suspend,
    /// Apply the value register as a function.
    FnApp,
    /// Restore the topmost continuation.
    Rc,
}

/// Default instruction quantum per scheduling round.
const DEFAULT_QUANTUM: i64 = 4096;

/// Default operand stack size, in value slots.
const DEFAULT_STACK_SIZE: usize = 4096;

/// The interpreter context.
pub struct Vm {
    pub heap: Heap,
    pub symbols: SymbolTable,
    globals: HashMap<Sym, Value>,
    pub(crate) threads: Vec<Option<Thread>>,
    pub(crate) finished: HashMap<u32, Value>,
    pinned: Vec<Value>,
    /// Internal resumable function that drives protect unwinding.
    pub(crate) unwinder: Value,
    error_sink: Box<dyn FnMut(&str)>,
    /// Instruction trace hook; logs at trace level when set.
    pub trace: bool,
    pub(crate) quantum: i64,
    pub(crate) stack_size: usize,
    next_tid: u32,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let unwinder =
            ffi::mkrff(&mut heap, "unwind", cont::unwind_rff).expect("fresh heap allocates");
        Self {
            heap,
            symbols: SymbolTable::new(),
            globals: HashMap::new(),
            threads: Vec::new(),
            finished: HashMap::new(),
            pinned: vec![unwinder],
            unwinder,
            error_sink: Box::new(|details| log::error!("uncaught exception: {details}")),
            trace: false,
            quantum: DEFAULT_QUANTUM,
            stack_size: DEFAULT_STACK_SIZE,
            next_tid: 0,
        }
    }

    /// Install the host error sink called for uncaught exceptions.
    pub fn set_error_sink(&mut self, sink: Box<dyn FnMut(&str)>) {
        self.error_sink = sink;
    }

    /// Instruction budget per scheduling round.
    pub fn set_quantum(&mut self, quantum: i64) {
        self.quantum = quantum.max(1);
    }

    /// Initial operand stack size for new threads.
    pub fn set_stack_size(&mut self, slots: usize) {
        self.stack_size = slots.max(8);
    }

    /// Intern a symbol name.
    pub fn intern(&mut self, name: &str) -> Value {
        self.symbols.intern_value(name)
    }

    /// Bind a global by name.
    pub fn bind_global(&mut self, name: &str, v: Value) {
        let sym = self.symbols.intern(name);
        self.globals.insert(sym, v);
    }

    /// Look up a global by name.
    pub fn global(&self, name: &str) -> Option<Value> {
        let sym = self.symbols.lookup(name)?;
        self.globals.get(&sym).copied()
    }

    /// Keep a host-held value alive across collections.
    pub fn pin(&mut self, v: Value) {
        self.pinned.push(v);
    }

    /// Render a value for humans.
    pub fn display(&self, v: Value) -> String {
        fmt::write_value(&self.heap, &self.symbols, v)
    }

    /// Pair a code object with an environment.
    pub fn mkclosure(&mut self, code: Value, env: Value) -> VmResult<Value> {
        code::mkclosure(&mut self.heap, code, env)
    }

    /// Register a synchronous native function under a global name.
    pub fn defsff(&mut self, name: &str, arity: i32, f: SffFn) -> VmResult<Value> {
        let v = ffi::mksff(&mut self.heap, name, arity, f)?;
        self.bind_global(name, v);
        Ok(v)
    }

    /// Register a resumable native function under a global name.
    pub fn defrff(&mut self, name: &str, f: ffi::RffFn) -> VmResult<Value> {
        let v = ffi::mkrff(&mut self.heap, name, f)?;
        self.bind_global(name, v);
        Ok(v)
    }

    /// Create an unscheduled thread, for direct trampoline entry.
    pub fn make_thread(&mut self) -> Thread {
        let id = ThreadId(self.next_tid);
        self.next_tid += 1;
        Thread::new(id, self.stack_size)
    }

    /// Hand an uncaught exception to the host error sink.
    pub(crate) fn signal_uncaught(&mut self, exc: Value) {
        let details = exception::details_text(self, exc);
        log::warn!("uncaught exception: {details}");
        (self.error_sink)(&details);
    }

    /// Every value the collector must treat as a root.
    pub(crate) fn gc_roots(&self) -> Vec<Value> {
        let mut roots = Vec::with_capacity(64);
        roots.extend(self.globals.values().copied());
        roots.extend_from_slice(&self.pinned);
        roots.extend(self.finished.values().copied());
        for thr in self.threads.iter().flatten() {
            thr.gc_roots(&mut roots);
        }
        roots
    }

    // ---- trampoline ----

    /// Run a thread until it suspends. Faults become Lumen exceptions
    /// and are delivered inside the loop; only fatal ones break the
    /// thread directly.
    pub fn trampoline(&mut self, thr: &mut Thread, mut state: Tramp) {
        loop {
            let next = match state {
                Tramp::Suspend => return,
                Tramp::Resume => self.resume(thr),
                Tramp::FnApp => self.apply_valr(thr),
                Tramp::Rc => cont::apply_return(self, thr),
            };
            state = match next {
                Ok(s) => s,
                Err(e) if e.is_fatal() => {
                    log::error!("thread {}: fatal fault: {e}", thr.id.0);
                    (self.error_sink)(&e.to_string());
                    thr.state = ThreadState::Broken;
                    thr.quanta = 0;
                    return;
                }
                Err(e) => match exception::deliver_error(self, thr, &e) {
                    Ok(s) => s,
                    Err(inner) => {
                        log::error!("thread {}: fault during delivery: {inner}", thr.id.0);
                        (self.error_sink)(&inner.to_string());
                        thr.state = ThreadState::Broken;
                        thr.quanta = 0;
                        return;
                    }
                },
            };
        }
    }

    fn resume(&mut self, thr: &mut Thread) -> VmResult<Tramp> {
        if let Value::Obj(r) = thr.funr {
            if let ObjKind::Rff(rff) = self.heap.kind(r) {
                let f = rff.f;
                return f(self, thr);
            }
        }
        self.step(thr)
    }

    /// Apply the value register as a function, by callee type.
    fn apply_valr(&mut self, thr: &mut Thread) -> VmResult<Tramp> {
        let callee = thr.valr;
        let r = match callee {
            Value::Obj(r) => r,
            other => {
                return Err(VmError::NotApplicable {
                    type_name: self.heap.type_name(other),
                })
            }
        };
        enum Callee {
            Closure(Value),
            Sff(SffFn, i32),
            Rff,
            Cont,
            Other(&'static str),
        }
        let kind = match self.heap.kind(r) {
            ObjKind::Closure { env, .. } => Callee::Closure(*env),
            ObjKind::Sff(s) => Callee::Sff(s.f, s.arity),
            ObjKind::Rff(_) => Callee::Rff,
            ObjKind::Cont(_) => Callee::Cont,
            other => Callee::Other(other.type_name()),
        };
        thr.funr = callee;
        match kind {
            Callee::Closure(env) => {
                thr.ip = 0;
                thr.envr = env;
                Ok(Tramp::Resume)
            }
            Callee::Sff(f, arity) => {
                if arity >= 0 && arity as usize != thr.argc {
                    return Err(VmError::wrong_arity(thr.argc, arity.to_string()));
                }
                let args = thr.pop_args(thr.argc)?;
                thr.valr = f(self, &args)?;
                Ok(Tramp::Rc)
            }
            Callee::Rff => {
                thr.ip = 0;
                thr.envr = Value::Nil;
                Ok(Tramp::Resume)
            }
            Callee::Cont => cont::apply_continuation(self, thr, r),
            Callee::Other(type_name) => Err(VmError::NotApplicable { type_name }),
        }
    }

    fn code_literal(&self, code_ref: ObjRef, index: usize) -> VmResult<Value> {
        match self.heap.kind(code_ref) {
            ObjKind::Code(c) => c.literal(index),
            _ => Err(VmError::LiteralOutOfRange { index }),
        }
    }

    fn literal_sym(&self, code_ref: ObjRef, index: usize) -> VmResult<Sym> {
        match self.code_literal(code_ref, index)? {
            Value::Sym(s) => Ok(s),
            other => Err(VmError::mismatch(
                "global reference",
                self.heap.type_name(other),
            )),
        }
    }

    // ---- the interpreter loop ----

    /// Step bytecode until the quantum runs out or control leaves the
    /// function.
    fn step(&mut self, thr: &mut Thread) -> VmResult<Tramp> {
        let code_ref = code::closure_code(&self.heap, thr.funr).ok_or(VmError::NotApplicable {
            type_name: self.heap.type_name(thr.funr),
        })?;
        loop {
            if thr.quanta <= 0 {
                return Ok(Tramp::Suspend);
            }
            let addr = thr.ip;
            let (op, a, b, c) = {
                let ObjKind::Code(code) = self.heap.kind(code_ref) else {
                    return Err(VmError::NotApplicable { type_name: "value" });
                };
                let Some(&word) = code.words.get(addr) else {
                    return Err(VmError::IpOutOfRange {
                        ip: addr,
                        name: code.name.clone(),
                    });
                };
                let op = Opcode::decode(word)?;
                let mut operands = [0i64; 3];
                for (i, slot) in operands.iter_mut().enumerate().take(op.operand_count()) {
                    *slot = *code.words.get(addr + 1 + i).ok_or(VmError::IpOutOfRange {
                        ip: addr + 1 + i,
                        name: code.name.clone(),
                    })?;
                }
                if self.trace {
                    log::trace!("[t{}] {}", thr.id.0, fmt::disasm(code, addr));
                }
                (op, operands[0], operands[1], operands[2])
            };
            thr.ip = addr + 1 + op.operand_count();
            if op == Opcode::Hlt {
                thr.state = ThreadState::Released;
                return Ok(Tramp::Suspend);
            }
            thr.quanta -= 1;
            match op {
                Opcode::Nop => {}
                Opcode::Push => thr.cpush(thr.valr)?,
                Opcode::Pop => thr.valr = thr.cpop()?,
                Opcode::Dup => {
                    let top = thr.top()?;
                    thr.cpush(top)?;
                }
                Opcode::Ldi => thr.valr = Value::decode_word(a)?,
                Opcode::Ldl => thr.valr = self.code_literal(code_ref, a as usize)?,
                Opcode::Ldg => {
                    let sym = self.literal_sym(code_ref, a as usize)?;
                    match self.globals.get(&sym).copied() {
                        Some(v) if v != Value::Unbound => thr.valr = v,
                        _ => return Err(VmError::unbound(self.symbols.name(sym))),
                    }
                }
                Opcode::Stg => {
                    let sym = self.literal_sym(code_ref, a as usize)?;
                    self.globals.insert(sym, thr.valr);
                }
                Opcode::Lde => thr.valr = env::getenv(&self.heap, thr, a as usize, b as usize)?,
                Opcode::Ste => {
                    let v = thr.valr;
                    env::setenv(&mut self.heap, thr, a as usize, b as usize, v)?;
                }
                Opcode::Ldei => thr.valr = env::getenv(&self.heap, thr, 0, a as usize)?,
                Opcode::Stei => {
                    let v = thr.valr;
                    env::setenv(&mut self.heap, thr, 0, a as usize, v)?;
                }
                Opcode::Env => {
                    env::env_instruction(thr, a as usize, b as usize, c as usize)?;
                }
                Opcode::Envr => {
                    env::envr_instruction(&mut self.heap, thr, a as usize, b as usize, c as usize)?;
                }
                Opcode::Menv => env::menv(&self.heap, thr, a as usize)?,
                Opcode::Cont => {
                    let resume_ip = offset(addr, a)?;
                    cont::push_cont(self, thr, resume_ip)?;
                }
                Opcode::Apply => {
                    thr.argc = a as usize;
                    return Ok(Tramp::FnApp);
                }
                Opcode::Ret => return Ok(Tramp::Rc),
                Opcode::Jmp => thr.ip = offset(addr, a)?,
                Opcode::Jt => {
                    if thr.valr.truthy() {
                        thr.ip = offset(addr, a)?;
                    }
                }
                Opcode::Jf => {
                    if !thr.valr.truthy() {
                        thr.ip = offset(addr, a)?;
                    }
                }
                Opcode::Jbnd => {
                    if thr.valr != Value::Unbound {
                        thr.ip = offset(addr, a)?;
                    }
                }
                Opcode::True => thr.valr = Value::True,
                Opcode::Nil => thr.valr = Value::Nil,
                Opcode::Hlt => unreachable!("handled above"),
                Opcode::Add => {
                    let x = thr.cpop()?;
                    thr.valr = arith::add(&mut self.heap, x, thr.valr)?;
                }
                Opcode::Sub => {
                    let x = thr.cpop()?;
                    thr.valr = arith::sub(&mut self.heap, x, thr.valr)?;
                }
                Opcode::Mul => {
                    let x = thr.cpop()?;
                    thr.valr = arith::mul(&mut self.heap, x, thr.valr)?;
                }
                Opcode::Div => {
                    let x = thr.cpop()?;
                    thr.valr = arith::div(&mut self.heap, x, thr.valr)?;
                }
                Opcode::Cons => {
                    let x = thr.cpop()?;
                    thr.valr = self.heap.cons(x, thr.valr)?;
                }
                Opcode::Consr => {
                    let x = thr.cpop()?;
                    thr.valr = self.heap.cons(thr.valr, x)?;
                }
                Opcode::Car => {
                    thr.valr = match thr.valr {
                        Value::Nil => Value::Nil,
                        v => self.heap.car(v)?,
                    }
                }
                Opcode::Cdr => {
                    thr.valr = match thr.valr {
                        Value::Nil => Value::Nil,
                        v => self.heap.cdr(v)?,
                    }
                }
                Opcode::Scar => {
                    let target = thr.cpop()?;
                    self.heap.set_car(target, thr.valr)?;
                }
                Opcode::Scdr => {
                    let target = thr.cpop()?;
                    self.heap.set_cdr(target, thr.valr)?;
                }
                Opcode::Spl => {
                    let tail = thr.cpop()?;
                    thr.valr = self.splice(thr.valr, tail)?;
                }
                Opcode::Is => {
                    let x = thr.cpop()?;
                    thr.valr = Value::from_bool(arith::is(&self.heap, x, thr.valr));
                }
                Opcode::Iso => {
                    let x = thr.cpop()?;
                    thr.valr = Value::from_bool(arith::iso(&self.heap, x, thr.valr));
                }
                Opcode::Gt => {
                    let x = thr.cpop()?;
                    thr.valr = Value::from_bool(arith::gt(&self.heap, x, thr.valr)?);
                }
                Opcode::Lt => {
                    let x = thr.cpop()?;
                    thr.valr = Value::from_bool(arith::lt(&self.heap, x, thr.valr)?);
                }
                Opcode::Cls => {
                    let cur = thr.envr;
                    let env = env::promote(&mut self.heap, thr, cur)?;
                    thr.envr = env;
                    thr.valr = code::mkclosure(&mut self.heap, thr.valr, env)?;
                }
            }
        }
    }

    /// Join `tail` onto the end of the list in `list`.
    fn splice(&mut self, list: Value, tail: Value) -> VmResult<Value> {
        if list.is_nil() {
            return Ok(tail);
        }
        let mut last = list;
        loop {
            let (_, cdr) = self
                .heap
                .pair(last)
                .ok_or(VmError::mismatch("spl", self.heap.type_name(last)))?;
            match cdr {
                Value::Nil => break,
                _ if self.heap.pair(cdr).is_some() => last = cdr,
                _ => return Err(VmError::mismatch("spl", "improper list")),
            }
        }
        self.heap.set_cdr(last, tail)?;
        Ok(list)
    }
}

/// Resolve a relative jump operand against the opcode's own address.
fn offset(addr: usize, delta: i64) -> VmResult<usize> {
    let target = addr as i64 + delta;
    usize::try_from(target).map_err(|_| VmError::IpOutOfRange {
        ip: 0,
        name: "jump target".to_string(),
    })
}

/// Convenience assembler entry: build a closure over `nil` from a
/// builder.
pub fn closure_from(vm: &mut Vm, builder: CodeBuilder, name: &str) -> VmResult<Value> {
    let code = builder.finish(&mut vm.heap, name)?;
    vm.mkclosure(code, Value::Nil)
}
