//! Arena heap and garbage collector.
//!
//! Objects live in a slotted arena indexed by [`ObjRef`]; a free list
//! recycles slots. Collection is mark/sweep in two flavors: minor passes
//! sweep only the nursery (objects allocated since the last collection),
//! using the remembered set fed by the write barrier to find
//! old-to-young edges; major passes sweep the whole arena.
//!
//! The collector only runs at scheduler safe points, between thread
//! quanta, and can be paused for nested evaluation loops whose values
//! are not rooted anywhere the collector can see.

use hashbrown::HashSet;
use num_bigint::BigInt;

use crate::arith::{Complex, Rational};
use crate::channel::ChannelData;
use crate::code::CodeData;
use crate::cont::ContData;
use crate::env::EnvData;
use crate::error::{VmError, VmResult};
use crate::exception::{ExcData, HandlerData};
use crate::ffi::{RffData, SffData};
use crate::thread::ThreadId;
use crate::value::{ObjRef, Value};

/// Default allocation count between minor collections.
const MINOR_THRESHOLD: usize = 32 * 1024;

/// Minor collections between major collections.
const MAJOR_EVERY: u32 = 8;

/// Hard cap on arena slots.
const ARENA_LIMIT: usize = 1 << 22;

/// Payload of a heap object.
#[derive(Debug)]
pub enum ObjKind {
    Cons(Value, Value),
    Vector(Vec<Value>),
    Str(String),
    Flonum(f64),
    Bignum(BigInt),
    Rational(Rational),
    Complex(Complex),
    Code(CodeData),
    Closure { code: ObjRef, env: Value },
    Sff(SffData),
    Rff(RffData),
    Cont(ContData),
    HeapEnv(EnvData),
    Exception(ExcData),
    Handler(HandlerData),
    Channel(ChannelData),
    Thread(ThreadId),
}

impl ObjKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjKind::Cons(..) => "cons",
            ObjKind::Vector(_) => "vector",
            ObjKind::Str(_) => "string",
            ObjKind::Flonum(_) => "flonum",
            ObjKind::Bignum(_) => "bignum",
            ObjKind::Rational(_) => "rational",
            ObjKind::Complex(_) => "complex",
            ObjKind::Code(_) => "code",
            ObjKind::Closure { .. } => "fn",
            ObjKind::Sff(_) | ObjKind::Rff(_) => "fn",
            ObjKind::Cont(_) => "continuation",
            ObjKind::HeapEnv(_) => "environment",
            ObjKind::Exception(_) => "exception",
            ObjKind::Handler(_) => "handler",
            ObjKind::Channel(_) => "channel",
            ObjKind::Thread(_) => "thread",
        }
    }

    /// Collect the values this object keeps alive.
    fn children(&self, out: &mut Vec<Value>) {
        match self {
            ObjKind::Cons(car, cdr) => {
                out.push(*car);
                out.push(*cdr);
            }
            ObjKind::Vector(items) => out.extend_from_slice(items),
            ObjKind::Str(_)
            | ObjKind::Flonum(_)
            | ObjKind::Bignum(_)
            | ObjKind::Rational(_)
            | ObjKind::Complex(_)
            | ObjKind::Sff(_)
            | ObjKind::Rff(_)
            | ObjKind::Thread(_) => {}
            ObjKind::Code(code) => out.extend_from_slice(&code.literals),
            ObjKind::Closure { code, env } => {
                out.push(Value::Obj(*code));
                out.push(*env);
            }
            ObjKind::Cont(cont) => {
                out.push(cont.funr);
                out.push(cont.envr);
                out.push(cont.conr);
                out.push(cont.econr);
                out.push(cont.protect);
                out.push(cont.saved);
                out.extend_from_slice(&cont.stack);
            }
            ObjKind::HeapEnv(env) => {
                out.push(env.parent);
                out.push(env.names);
                out.extend_from_slice(&env.slots);
            }
            ObjKind::Exception(exc) => {
                out.push(exc.details);
                out.push(exc.last_call);
                out.push(exc.backtrace);
            }
            ObjKind::Handler(handler) => {
                out.push(handler.handler);
                out.push(handler.cont);
            }
            ObjKind::Channel(ch) => out.extend(ch.buffered()),
        }
    }
}

#[derive(Debug)]
struct Object {
    color: u32,
    young: bool,
    kind: ObjKind,
}

/// The arena heap.
pub struct Heap {
    slots: Vec<Option<Object>>,
    free: Vec<u32>,
    nursery: Vec<u32>,
    remembered: HashSet<u32>,
    epoch: u32,
    allocated_since_gc: usize,
    minor_count: u32,
    pause_depth: u32,
    minor_threshold: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            nursery: Vec::new(),
            remembered: HashSet::new(),
            epoch: 0,
            allocated_since_gc: 0,
            minor_count: 0,
            pause_depth: 0,
            minor_threshold: MINOR_THRESHOLD,
        }
    }

    /// Number of live objects.
    pub fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Allocate a new object.
    pub fn alloc(&mut self, kind: ObjKind) -> VmResult<ObjRef> {
        let obj = Object {
            color: self.epoch,
            young: true,
            kind,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(obj);
                idx
            }
            None => {
                if self.slots.len() >= ARENA_LIMIT {
                    return Err(VmError::OutOfMemory);
                }
                self.slots.push(Some(obj));
                (self.slots.len() - 1) as u32
            }
        };
        self.nursery.push(idx);
        self.allocated_since_gc += 1;
        Ok(ObjRef(idx))
    }

    /// Borrow an object's payload. A stale handle is a VM bug, not a
    /// recoverable condition.
    pub fn kind(&self, r: ObjRef) -> &ObjKind {
        &self.object(r).kind
    }

    fn object(&self, r: ObjRef) -> &Object {
        self.slots[r.index()]
            .as_ref()
            .expect("stale object reference")
    }

    fn object_mut(&mut self, r: ObjRef) -> &mut Object {
        self.slots[r.index()]
            .as_mut()
            .expect("stale object reference")
    }

    pub(crate) fn kind_mut(&mut self, r: ObjRef) -> &mut ObjKind {
        &mut self.object_mut(r).kind
    }

    /// Record a store of `child` into a slot of `parent`.
    ///
    /// Old-to-young edges go into the remembered set so minor
    /// collections can treat the parent as a root.
    pub fn write_barrier(&mut self, parent: ObjRef, child: Value) {
        if let Value::Obj(c) = child {
            if self.object(c).young && !self.object(parent).young {
                self.remembered.insert(parent.0);
            }
        }
    }

    /// Pause collection (nested evaluation with unrooted host values).
    pub fn pause_gc(&mut self) {
        self.pause_depth += 1;
    }

    pub fn resume_gc(&mut self) {
        debug_assert!(self.pause_depth > 0);
        self.pause_depth = self.pause_depth.saturating_sub(1);
    }

    /// Whether allocation pressure warrants a collection right now.
    pub fn should_collect(&self) -> bool {
        self.pause_depth == 0 && self.allocated_since_gc >= self.minor_threshold
    }

    /// Tune the minor-collection threshold (mainly for stress tests).
    pub fn set_minor_threshold(&mut self, threshold: usize) {
        self.minor_threshold = threshold.max(1);
    }

    /// Whether the next collection should be a major pass.
    pub fn wants_major(&self) -> bool {
        self.minor_count >= MAJOR_EVERY
    }

    /// Run a collection over the given roots.
    pub fn collect(&mut self, roots: &[Value], major: bool) {
        let before = self.live();
        self.epoch = self.epoch.wrapping_add(1);
        let mut worklist: Vec<u32> = Vec::new();
        for &v in roots {
            self.mark_value(v, major, &mut worklist);
        }
        if !major {
            // Remembered parents stand in for the old generation.
            let parents: Vec<u32> = self.remembered.iter().copied().collect();
            let mut children = Vec::new();
            for idx in parents {
                if let Some(obj) = &self.slots[idx as usize] {
                    obj.kind.children(&mut children);
                }
            }
            for v in children.drain(..) {
                self.mark_value(v, major, &mut worklist);
            }
        }
        let mut children = Vec::new();
        while let Some(idx) = worklist.pop() {
            children.clear();
            if let Some(obj) = &self.slots[idx as usize] {
                obj.kind.children(&mut children);
            }
            for &v in &children {
                self.mark_value(v, major, &mut worklist);
            }
        }
        if major {
            for idx in 0..self.slots.len() {
                let dead = matches!(&self.slots[idx], Some(obj) if obj.color != self.epoch);
                if dead {
                    self.slots[idx] = None;
                    self.free.push(idx as u32);
                } else if let Some(obj) = &mut self.slots[idx] {
                    obj.young = false;
                }
            }
            self.nursery.clear();
            self.minor_count = 0;
        } else {
            let nursery = std::mem::take(&mut self.nursery);
            for idx in nursery {
                let dead = matches!(&self.slots[idx as usize], Some(obj) if obj.color != self.epoch);
                if dead {
                    self.slots[idx as usize] = None;
                    self.free.push(idx);
                } else if let Some(obj) = &mut self.slots[idx as usize] {
                    obj.young = false;
                }
            }
            self.minor_count += 1;
        }
        self.remembered.clear();
        self.allocated_since_gc = 0;
        log::debug!(
            "gc: {} pass, {} -> {} live objects",
            if major { "major" } else { "minor" },
            before,
            self.live()
        );
    }

    fn mark_value(&mut self, v: Value, major: bool, worklist: &mut Vec<u32>) {
        if let Value::Obj(r) = v {
            let epoch = self.epoch;
            let obj = self.object_mut(r);
            if obj.color == epoch {
                return;
            }
            if !major && !obj.young {
                return;
            }
            obj.color = epoch;
            worklist.push(r.0);
        }
    }

    // ---- typed constructors ----

    pub fn cons(&mut self, car: Value, cdr: Value) -> VmResult<Value> {
        Ok(Value::Obj(self.alloc(ObjKind::Cons(car, cdr))?))
    }

    pub fn string<S: Into<String>>(&mut self, s: S) -> VmResult<Value> {
        Ok(Value::Obj(self.alloc(ObjKind::Str(s.into()))?))
    }

    pub fn flonum(&mut self, f: f64) -> VmResult<Value> {
        Ok(Value::Obj(self.alloc(ObjKind::Flonum(f))?))
    }

    /// Build a proper list from a slice.
    pub fn list(&mut self, items: &[Value]) -> VmResult<Value> {
        let mut acc = Value::Nil;
        for &v in items.iter().rev() {
            acc = self.cons(v, acc)?;
        }
        Ok(acc)
    }

    // ---- typed accessors ----

    pub fn type_name(&self, v: Value) -> &'static str {
        match v {
            Value::Obj(r) => self.kind(r).type_name(),
            other => other.immediate_type_name().unwrap_or("value"),
        }
    }

    /// Car and cdr of a cons, or `None` for any other value.
    pub fn pair(&self, v: Value) -> Option<(Value, Value)> {
        match v {
            Value::Obj(r) => match self.kind(r) {
                ObjKind::Cons(car, cdr) => Some((*car, *cdr)),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn car(&self, v: Value) -> VmResult<Value> {
        self.pair(v)
            .map(|(car, _)| car)
            .ok_or_else(|| VmError::mismatch("car", self.type_name(v)))
    }

    pub fn cdr(&self, v: Value) -> VmResult<Value> {
        self.pair(v)
            .map(|(_, cdr)| cdr)
            .ok_or_else(|| VmError::mismatch("cdr", self.type_name(v)))
    }

    pub fn set_car(&mut self, v: Value, new: Value) -> VmResult<()> {
        let r = self.cons_ref(v)?;
        if let ObjKind::Cons(car, _) = self.kind_mut(r) {
            *car = new;
        }
        self.write_barrier(r, new);
        Ok(())
    }

    pub fn set_cdr(&mut self, v: Value, new: Value) -> VmResult<()> {
        let r = self.cons_ref(v)?;
        if let ObjKind::Cons(_, cdr) = self.kind_mut(r) {
            *cdr = new;
        }
        self.write_barrier(r, new);
        Ok(())
    }

    fn cons_ref(&self, v: Value) -> VmResult<ObjRef> {
        match v {
            Value::Obj(r) if matches!(self.kind(r), ObjKind::Cons(..)) => Ok(r),
            _ => Err(VmError::mismatch("scar/scdr", self.type_name(v))),
        }
    }

    pub fn str_value(&self, v: Value) -> Option<&str> {
        match v {
            Value::Obj(r) => match self.kind(r) {
                ObjKind::Str(s) => Some(s),
                _ => None,
            },
            _ => None,
        }
    }

    /// Collect a proper list into a vector; improper tails are an error.
    pub fn list_to_vec(&self, mut v: Value) -> VmResult<Vec<Value>> {
        let mut out = Vec::new();
        loop {
            match v {
                Value::Nil => return Ok(out),
                _ => match self.pair(v) {
                    Some((car, cdr)) => {
                        out.push(car);
                        v = cdr;
                    }
                    None => return Err(VmError::mismatch("list traversal", self.type_name(v))),
                },
            }
        }
    }
}
