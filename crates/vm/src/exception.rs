//! Exceptions and error delivery.
//!
//! Raising walks the error-continuation register: the topmost entry
//! names a handler and the continuation that was current when `on-err`
//! installed it. Delivery runs every armed protect clause between the
//! raise point and that continuation, restores it, and applies the
//! handler to the exception. With no handler installed, the same walk
//! covers the whole continuation register and ends at the host error
//! sink with the thread broken.

use crate::cont;
use crate::error::{VmError, VmResult};
use crate::fmt;
use crate::heap::ObjKind;
use crate::thread::{Thread, ThreadState};
use crate::value::Value;
use crate::vm::{Tramp, Vm};

/// Payload of an exception object: a details string, the source name of
/// the last bytecode function in progress, and the continuation chain
/// at raise time for backtraces.
#[derive(Debug)]
pub struct ExcData {
    pub details: Value,
    pub last_call: Value,
    pub backtrace: Value,
}

/// One entry of the error-continuation register.
#[derive(Debug)]
pub struct HandlerData {
    pub handler: Value,
    /// Continuation current when the handler was installed.
    pub cont: Value,
}

/// Build an exception object capturing the raise site.
pub(crate) fn make_exception(vm: &mut Vm, thr: &Thread, details: Value) -> VmResult<Value> {
    let last_call = match crate::code::closure_code(&vm.heap, thr.funr) {
        Some(code_ref) => match vm.heap.kind(code_ref) {
            ObjKind::Code(c) => {
                let name = c.name.clone();
                vm.heap.string(name)?
            }
            _ => Value::Nil,
        },
        None => Value::Nil,
    };
    Ok(Value::Obj(vm.heap.alloc(ObjKind::Exception(ExcData {
        details,
        last_call,
        backtrace: thr.conr,
    }))?))
}

/// The details string of an exception, or a rendering of any other
/// value used as one.
pub fn details_text(vm: &Vm, exc: Value) -> String {
    let details = match exc {
        Value::Obj(r) => match vm.heap.kind(r) {
            ObjKind::Exception(e) => e.details,
            _ => exc,
        },
        _ => exc,
    };
    match vm.heap.str_value(details) {
        Some(s) => s.to_string(),
        None => fmt::write_value(&vm.heap, &vm.symbols, details),
    }
}

/// Convert a runtime fault into an exception and deliver it.
pub(crate) fn deliver_error(vm: &mut Vm, thr: &mut Thread, err: &VmError) -> VmResult<Tramp> {
    log::debug!(
        "thread {}: raising {} fault: {}",
        thr.id.0,
        err.category(),
        err
    );
    let details = vm.heap.string(err.to_string())?;
    let exc = make_exception(vm, thr, details)?;
    deliver(vm, thr, exc)
}

/// Deliver an exception to the innermost handler, or to the host sink
/// when none is installed. Every armed protect clause on the way runs
/// first.
pub(crate) fn deliver(vm: &mut Vm, thr: &mut Thread, exc: Value) -> VmResult<Tramp> {
    match vm.heap.pair(thr.econr) {
        None => {
            let afters = cont::collect_unwinds(vm, thr, None)?;
            if afters.is_empty() {
                signal_to_host(vm, thr, exc);
                return Ok(Tramp::Suspend);
            }
            // Unwind in the exiting state; the unwinder reaches the
            // host sink once the clauses have run.
            thr.state = ThreadState::Exiting;
            cont::start_unwind(vm, thr, &afters, Value::Nil, exc, Value::Nil)
        }
        Some((entry, rest)) => {
            thr.econr = rest;
            let (handler, cont_value) = match entry {
                Value::Obj(r) => match vm.heap.kind(r) {
                    ObjKind::Handler(h) => (h.handler, h.cont),
                    other => return Err(VmError::mismatch("error delivery", other.type_name())),
                },
                _ => return Err(VmError::mismatch("error delivery", "value")),
            };
            let Value::Obj(k) = cont_value else {
                return Err(VmError::mismatch("error delivery", "value"));
            };
            let afters = cont::collect_unwinds(vm, thr, Some(k))?;
            if afters.is_empty() {
                cont::restore(vm, thr, k)?;
                thr.cpush(exc)?;
                thr.argc = 1;
                thr.valr = handler;
                return Ok(Tramp::FnApp);
            }
            cont::start_unwind(vm, thr, &afters, cont_value, exc, handler)
        }
    }
}

/// Terminal delivery: hand the exception to the host error sink and
/// break the thread.
pub(crate) fn signal_to_host(vm: &mut Vm, thr: &mut Thread, exc: Value) {
    vm.signal_uncaught(exc);
    thr.state = ThreadState::Broken;
    thr.quanta = 0;
}
