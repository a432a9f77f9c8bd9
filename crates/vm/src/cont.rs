//! First-class continuations.
//!
//! A continuation snapshots everything a return needs: the resume
//! offset, function and environment registers, the used portion of the
//! operand stack, both continuation registers, and the two protect
//! slots that implement dynamic-wind. Restoring one overwrites the
//! stack's used region and the registers in a single step, as far as
//! the VM can observe.
//!
//! The protect slots work as a small state machine on every
//! restoration: an armed slot diverts control to the after clause,
//! parking the in-flight value in the saved slot; the pending slot then
//! routes the revisit back to the original restoration with that value
//! intact, so `protect` returns the body's value, not the cleanup's.

use crate::error::{VmError, VmResult};
use crate::exception;
use crate::ffi;
use crate::heap::ObjKind;
use crate::thread::{Thread, ThreadState};
use crate::value::{ObjRef, Value};
use crate::vm::{Tramp, Vm};

/// Payload of a continuation object.
#[derive(Debug)]
pub struct ContData {
    /// Resume offset in the owning code object, or the resume line of a
    /// resumable native function.
    pub ip: usize,
    pub funr: Value,
    pub envr: Value,
    /// Snapshot of the used stack region.
    pub stack: Vec<Value>,
    pub conr: Value,
    pub econr: Value,
    /// After clause installed by `protect`, or nil.
    pub protect: Value,
    /// Whether the after clause is currently running.
    pub pending: bool,
    /// VALR parked while the after clause runs.
    pub saved: Value,
}

/// Capture the current state as a continuation resuming at `resume_ip`.
///
/// The environment chain is promoted first, so the snapshot holds no
/// stack-resident environment references of its own frame.
pub(crate) fn capture(vm: &mut Vm, thr: &mut Thread, resume_ip: usize) -> VmResult<ObjRef> {
    let env = thr.envr;
    thr.envr = crate::env::promote(&mut vm.heap, thr, env)?;
    let cont = ContData {
        ip: resume_ip,
        funr: thr.funr,
        envr: thr.envr,
        stack: thr.stack[..thr.sp].to_vec(),
        conr: thr.conr,
        econr: thr.econr,
        protect: Value::Nil,
        pending: false,
        saved: Value::Unbound,
    };
    vm.heap.alloc(ObjKind::Cont(cont))
}

/// Capture a continuation, push it on CONR and clear the operand stack
/// for the callee's arguments. This is the `cont` instruction and the
/// call half of the resumable-function convention.
pub(crate) fn push_cont(vm: &mut Vm, thr: &mut Thread, resume_ip: usize) -> VmResult<ObjRef> {
    let k = capture(vm, thr, resume_ip)?;
    thr.conr = vm.heap.cons(Value::Obj(k), thr.conr)?;
    thr.sp = 0;
    Ok(k)
}

fn cont_data(vm: &Vm, k: ObjRef) -> VmResult<&ContData> {
    match vm.heap.kind(k) {
        ObjKind::Cont(c) => Ok(c),
        other => Err(VmError::mismatch("continuation restore", other.type_name())),
    }
}

/// Install an after clause in a continuation's protect slot.
pub(crate) fn set_protect(vm: &mut Vm, k: ObjRef, after: Value) -> VmResult<()> {
    match vm.heap.kind_mut(k) {
        ObjKind::Cont(c) => c.protect = after,
        other => return Err(VmError::mismatch("protect", other.type_name())),
    }
    vm.heap.write_barrier(k, after);
    Ok(())
}

fn begin_protect(vm: &mut Vm, k: ObjRef, parked: Value) {
    if let ObjKind::Cont(c) = vm.heap.kind_mut(k) {
        c.pending = true;
        c.saved = parked;
    }
    vm.heap.write_barrier(k, parked);
}

fn clear_protect(vm: &mut Vm, k: ObjRef) {
    if let ObjKind::Cont(c) = vm.heap.kind_mut(k) {
        c.protect = Value::Nil;
        c.pending = false;
        c.saved = Value::Unbound;
    }
}

/// Restore registers and stack from a continuation.
pub(crate) fn restore(vm: &mut Vm, thr: &mut Thread, k: ObjRef) -> VmResult<()> {
    let (ip, funr, envr, conr, econr, snapshot) = {
        let c = cont_data(vm, k)?;
        (c.ip, c.funr, c.envr, c.conr, c.econr, c.stack.clone())
    };
    if thr.stack.len() < snapshot.len() {
        thr.stack.resize(snapshot.len(), Value::Nil);
    }
    thr.stack[..snapshot.len()].copy_from_slice(&snapshot);
    thr.sp = snapshot.len();
    thr.ip = ip;
    thr.funr = funr;
    thr.envr = envr;
    thr.conr = conr;
    thr.econr = econr;
    Ok(())
}

/// The `ret` path: pop and restore the topmost continuation, running
/// its protect clause first when one is armed.
pub(crate) fn apply_return(vm: &mut Vm, thr: &mut Thread) -> VmResult<Tramp> {
    let Some((head, tail)) = vm.heap.pair(thr.conr) else {
        // Nothing to return into: the thread is done.
        if thr.state == ThreadState::Exiting {
            if let Some(exc) = thr.interrupt.take() {
                vm.signal_uncaught(exc);
            }
        }
        thr.quanta = 0;
        thr.state = ThreadState::Released;
        return Ok(Tramp::Suspend);
    };
    let Value::Obj(k) = head else {
        return Err(VmError::mismatch("continuation restore", "value"));
    };
    let (protect, pending, saved) = {
        let c = cont_data(vm, k)?;
        (c.protect, c.pending, c.saved)
    };
    if !protect.is_nil() && !pending {
        // Divert to the after clause; this continuation stays on CONR
        // and is revisited when the clause returns.
        begin_protect(vm, k, thr.valr);
        thr.valr = protect;
        thr.argc = 0;
        return Ok(Tramp::FnApp);
    }
    thr.conr = tail;
    restore(vm, thr, k)?;
    if pending {
        clear_protect(vm, k);
        thr.valr = saved;
    }
    Ok(Tramp::Resume)
}

/// Walk CONR from its head down to `target` (exclusive), disarming and
/// collecting every armed protect clause on the way. With no target the
/// walk covers the whole register.
pub(crate) fn collect_unwinds(
    vm: &mut Vm,
    thr: &Thread,
    target: Option<ObjRef>,
) -> VmResult<Vec<Value>> {
    let mut afters = Vec::new();
    let mut cur = thr.conr;
    while let Some((head, tail)) = vm.heap.pair(cur) {
        let Value::Obj(k) = head else { break };
        if target == Some(k) {
            break;
        }
        let armed = match vm.heap.kind(k) {
            ObjKind::Cont(c) if !c.protect.is_nil() && !c.pending => Some(c.protect),
            _ => None,
        };
        if let Some(after) = armed {
            // Disarm: once collected the clause is committed to run,
            // and must not fire again if the unwind itself unwinds.
            clear_protect(vm, k);
            afters.push(after);
        }
        cur = tail;
    }
    Ok(afters)
}

/// Apply a first-class continuation to a value: run the after clauses
/// of every protect-bearing continuation between here and the target,
/// then restore the target with the value in VALR.
pub(crate) fn apply_continuation(vm: &mut Vm, thr: &mut Thread, k: ObjRef) -> VmResult<Tramp> {
    let args = thr.pop_args(thr.argc)?;
    let value = args.first().copied().unwrap_or(Value::Nil);
    let afters = collect_unwinds(vm, thr, Some(k))?;
    if afters.is_empty() {
        restore(vm, thr, k)?;
        thr.valr = value;
        return Ok(Tramp::Resume);
    }
    start_unwind(vm, thr, &afters, Value::Obj(k), value, Value::Nil)
}

/// Kick off the unwinder with a batch of after clauses and a final
/// action: restore `target` with `payload` in VALR, apply `handler` to
/// `payload` after restoring `target`, or, with no target, signal the
/// payload as an uncaught exception.
pub(crate) fn start_unwind(
    vm: &mut Vm,
    thr: &mut Thread,
    afters: &[Value],
    target: Value,
    payload: Value,
    handler: Value,
) -> VmResult<Tramp> {
    let list = vm.heap.list(afters)?;
    thr.cpush(list)?;
    thr.cpush(target)?;
    thr.cpush(payload)?;
    thr.cpush(handler)?;
    thr.argc = 4;
    thr.valr = vm.unwinder;
    Ok(Tramp::FnApp)
}

/// Resumable native function driving an unwind. Locals: the remaining
/// after clauses, the target continuation, the payload, the handler.
pub(crate) fn unwind_rff(vm: &mut Vm, thr: &mut Thread) -> VmResult<Tramp> {
    match thr.ip {
        0 | 1 => {
            ffi::aff_env(thr, 4, 0)?;
            let afters = ffi::aff_local(&vm.heap, thr, 0)?;
            if let Some((clause, rest)) = vm.heap.pair(afters) {
                ffi::aff_set_local(&mut vm.heap, thr, 0, rest)?;
                return ffi::aff_call(vm, thr, 1, clause, &[]);
            }
            let target = ffi::aff_local(&vm.heap, thr, 1)?;
            let payload = ffi::aff_local(&vm.heap, thr, 2)?;
            let handler = ffi::aff_local(&vm.heap, thr, 3)?;
            match target {
                Value::Obj(k) => {
                    restore(vm, thr, k)?;
                    if handler.truthy() {
                        thr.cpush(payload)?;
                        thr.argc = 1;
                        thr.valr = handler;
                        Ok(Tramp::FnApp)
                    } else {
                        thr.valr = payload;
                        Ok(Tramp::Resume)
                    }
                }
                _ => {
                    // Unwound off the top: the exception was never
                    // caught.
                    exception::signal_to_host(vm, thr, payload);
                    Ok(Tramp::Suspend)
                }
            }
        }
        line => Err(ffi::bad_resume_line("unwind", line)),
    }
}
