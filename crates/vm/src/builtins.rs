//! Builtin native functions.
//!
//! The control-flow builtins (`ccc`, `protect`, `on-err`, `err`) and
//! everything that can block (`sleep`, `join`, channel operations) use
//! the resumable convention so they cooperate with continuations and
//! the scheduler; the rest are plain synchronous functions.

use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

use crate::channel;
use crate::cont;
use crate::error::{VmError, VmResult};
use crate::exception::{self, HandlerData};
use crate::ffi::{self, RffFn, SffFn, VARIADIC};
use crate::heap::{Heap, ObjKind};
use crate::thread::{Thread, ThreadId, ThreadState};
use crate::value::{ObjRef, Value};
use crate::vm::{Tramp, Vm};

#[derive(Clone, Copy)]
enum Builtin {
    Sff {
        name: &'static str,
        arity: i32,
        f: SffFn,
    },
    Rff {
        name: &'static str,
        f: RffFn,
    },
}

static BUILTINS: Lazy<Vec<Builtin>> = Lazy::new(|| {
    vec![
        Builtin::Sff {
            name: "type",
            arity: 1,
            f: type_of,
        },
        Builtin::Sff {
            name: "details",
            arity: 1,
            f: details,
        },
        Builtin::Sff {
            name: "spawn",
            arity: 1,
            f: spawn,
        },
        Builtin::Sff {
            name: "chan",
            arity: VARIADIC,
            f: chan,
        },
        Builtin::Rff { name: "ccc", f: ccc },
        Builtin::Rff {
            name: "protect",
            f: protect,
        },
        Builtin::Rff {
            name: "on-err",
            f: on_err,
        },
        Builtin::Rff { name: "err", f: err },
        Builtin::Rff {
            name: "sleep",
            f: sleep,
        },
        Builtin::Rff {
            name: "yield",
            f: yield_thread,
        },
        Builtin::Rff {
            name: "join",
            f: join,
        },
        Builtin::Rff {
            name: "send",
            f: send,
        },
        Builtin::Rff {
            name: "recv",
            f: recv,
        },
        Builtin::Rff { name: "alt", f: alt },
        Builtin::Rff {
            name: "apply",
            f: apply,
        },
        Builtin::Rff {
            name: "atomic",
            f: atomic,
        },
    ]
});

impl Vm {
    /// Bind every builtin into the global table.
    pub fn install_builtins(&mut self) -> VmResult<()> {
        for b in BUILTINS.iter() {
            match *b {
                Builtin::Sff { name, arity, f } => {
                    self.defsff(name, arity, f)?;
                }
                Builtin::Rff { name, f } => {
                    self.defrff(name, f)?;
                }
            }
        }
        Ok(())
    }
}

// ---- synchronous builtins ----

/// `(type v)` — type of a value, as a symbol.
fn type_of(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let name = vm.heap.type_name(args[0]);
    Ok(vm.intern(name))
}

/// `(details exc)` — details string of an exception.
fn details(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    match args[0] {
        Value::Obj(r) => match vm.heap.kind(r) {
            ObjKind::Exception(e) => Ok(e.details),
            other => Err(VmError::mismatch("details", other.type_name())),
        },
        other => Err(VmError::mismatch("details", vm.heap.type_name(other))),
    }
}

/// `(spawn thunk)` — run a thunk on a new green thread.
fn spawn(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let tid = vm.spawn_closure(args[0], &[])?;
    vm.thread_handle(tid)
}

/// `(chan)` or `(chan capacity)` — create a channel.
fn chan(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let capacity = match args {
        [] => 1,
        [Value::Fixnum(n)] if *n > 0 => *n as usize,
        [other] => {
            return Err(VmError::mismatch("chan", vm.heap.type_name(*other)));
        }
        _ => return Err(VmError::wrong_arity(args.len(), "0 or 1".to_string())),
    };
    channel::mkchannel(&mut vm.heap, capacity)
}

// ---- resumable builtins ----

/// `(ccc f)` — call `f` with the current continuation.
fn ccc(vm: &mut Vm, thr: &mut Thread) -> VmResult<Tramp> {
    match thr.ip {
        0 => {
            ffi::aff_env(thr, 1, 0)?;
            let f = ffi::aff_local(&vm.heap, thr, 0)?;
            let k = vm
                .heap
                .pair(thr.conr)
                .map(|(head, _)| head)
                .unwrap_or(Value::Nil);
            ffi::aff_tailcall(vm, thr, f, &[k])
        }
        line => Err(ffi::bad_resume_line("ccc", line)),
    }
}

/// `(protect during after)` — dynamic-wind: `after` runs exactly once
/// when control leaves `during`, by return or by continuation.
fn protect(vm: &mut Vm, thr: &mut Thread) -> VmResult<Tramp> {
    match thr.ip {
        0 => {
            ffi::aff_env(thr, 2, 0)?;
            let during = ffi::aff_local(&vm.heap, thr, 0)?;
            let after = ffi::aff_local(&vm.heap, thr, 1)?;
            // The continuation that runs when `during` returns carries
            // the after clause in its protect slot.
            let k = cont::push_cont(vm, thr, 1)?;
            cont::set_protect(vm, k, after)?;
            thr.argc = 0;
            thr.valr = during;
            Ok(Tramp::FnApp)
        }
        1 => {
            let v = thr.valr;
            ffi::aff_return(thr, v)
        }
        line => Err(ffi::bad_resume_line("protect", line)),
    }
}

/// `(on-err handler body)` — call `body`; an error raised inside it
/// applies `handler` to the exception at the installation point.
fn on_err(vm: &mut Vm, thr: &mut Thread) -> VmResult<Tramp> {
    match thr.ip {
        0 => {
            ffi::aff_env(thr, 2, 0)?;
            let handler = ffi::aff_local(&vm.heap, thr, 0)?;
            let body = ffi::aff_local(&vm.heap, thr, 1)?;
            // The install-point continuation doubles as the normal
            // return path; restoring it discards this handler entry
            // because its saved ECONR predates the install.
            let k = cont::push_cont(vm, thr, 1)?;
            let entry = vm.heap.alloc(ObjKind::Handler(HandlerData {
                handler,
                cont: Value::Obj(k),
            }))?;
            thr.econr = vm.heap.cons(Value::Obj(entry), thr.econr)?;
            thr.argc = 0;
            thr.valr = body;
            Ok(Tramp::FnApp)
        }
        1 => {
            let v = thr.valr;
            ffi::aff_return(thr, v)
        }
        line => Err(ffi::bad_resume_line("on-err", line)),
    }
}

/// `(err details)` — raise a user error.
fn err(vm: &mut Vm, thr: &mut Thread) -> VmResult<Tramp> {
    match thr.ip {
        0 => {
            if thr.argc != 1 {
                return Err(VmError::wrong_arity(thr.argc, "1".to_string()));
            }
            let msg = thr.cpop()?;
            let details = if vm.heap.str_value(msg).is_some() {
                msg
            } else {
                let rendered = vm.display(msg);
                vm.heap.string(rendered)?
            };
            let exc = exception::make_exception(vm, thr, details)?;
            exception::deliver(vm, thr, exc)
        }
        line => Err(ffi::bad_resume_line("err", line)),
    }
}

fn seconds_arg(heap: &Heap, v: Value) -> VmResult<f64> {
    let secs = match v {
        Value::Fixnum(n) => n as f64,
        Value::Obj(r) => match heap.kind(r) {
            ObjKind::Flonum(f) => *f,
            other => return Err(VmError::mismatch("sleep", other.type_name())),
        },
        other => return Err(VmError::mismatch("sleep", heap.type_name(other))),
    };
    Ok(secs.max(0.0))
}

/// `(sleep secs)` — yield until the monotonic clock passes now + secs.
fn sleep(vm: &mut Vm, thr: &mut Thread) -> VmResult<Tramp> {
    match thr.ip {
        0 => {
            ffi::aff_env(thr, 1, 0)?;
            let secs = seconds_arg(&vm.heap, ffi::aff_local(&vm.heap, thr, 0)?)?;
            thr.wakeup_at = Some(Instant::now() + Duration::from_secs_f64(secs));
            thr.state = ThreadState::Sleeping;
            ffi::aff_yield(thr, 1)
        }
        1 => ffi::aff_return(thr, Value::Nil),
        line => Err(ffi::bad_resume_line("sleep", line)),
    }
}

/// `(yield)` — give up the rest of the quantum.
fn yield_thread(_vm: &mut Vm, thr: &mut Thread) -> VmResult<Tramp> {
    match thr.ip {
        0 => {
            if thr.argc != 0 {
                return Err(VmError::wrong_arity(thr.argc, "0".to_string()));
            }
            ffi::aff_yield(thr, 1)
        }
        1 => ffi::aff_return(thr, Value::Nil),
        line => Err(ffi::bad_resume_line("yield", line)),
    }
}

fn thread_arg(heap: &Heap, v: Value) -> VmResult<ThreadId> {
    match v {
        Value::Obj(r) => match heap.kind(r) {
            ObjKind::Thread(tid) => Ok(*tid),
            other => Err(VmError::mismatch("join", other.type_name())),
        },
        other => Err(VmError::mismatch("join", heap.type_name(other))),
    }
}

/// `(join thread)` — block until a thread finishes; its final value.
fn join(vm: &mut Vm, thr: &mut Thread) -> VmResult<Tramp> {
    match thr.ip {
        0 | 1 => {
            ffi::aff_env(thr, 1, 0)?;
            let tid = thread_arg(&vm.heap, ffi::aff_local(&vm.heap, thr, 0)?)?;
            if let Some(v) = vm.finished_value(tid) {
                return ffi::aff_return(thr, v);
            }
            if vm.thread_mut(tid).is_some() {
                return ffi::aff_yield(thr, 1);
            }
            ffi::aff_return(thr, Value::Nil)
        }
        line => Err(ffi::bad_resume_line("join", line)),
    }
}

fn channel_arg(heap: &Heap, op: &'static str, v: Value) -> VmResult<ObjRef> {
    match v {
        Value::Obj(r) if matches!(heap.kind(r), ObjKind::Channel(_)) => Ok(r),
        other => Err(VmError::mismatch(op, heap.type_name(other))),
    }
}

/// `(send ch v)` — enqueue `v`, blocking while the channel is full.
fn send(vm: &mut Vm, thr: &mut Thread) -> VmResult<Tramp> {
    match thr.ip {
        0 | 1 => {
            ffi::aff_env(thr, 2, 0)?;
            let ch = channel_arg(&vm.heap, "send", ffi::aff_local(&vm.heap, thr, 0)?)?;
            let v = ffi::aff_local(&vm.heap, thr, 1)?;
            let tid = thr.id;
            let woken = match vm.heap.kind_mut(ch) {
                ObjKind::Channel(c) => {
                    if c.is_full() {
                        c.send_waiters.push(tid);
                        None
                    } else {
                        c.push(v);
                        Some(std::mem::take(&mut c.recv_waiters))
                    }
                }
                _ => return Err(VmError::mismatch("send", "value")),
            };
            match woken {
                Some(waiters) => {
                    vm.heap.write_barrier(ch, v);
                    for w in waiters {
                        vm.wake_channel_waiter(w);
                    }
                    ffi::aff_return(thr, v)
                }
                None => {
                    thr.state = ThreadState::Send;
                    ffi::aff_yield(thr, 1)
                }
            }
        }
        line => Err(ffi::bad_resume_line("send", line)),
    }
}

/// `(recv ch)` — dequeue a value, blocking while the channel is empty.
fn recv(vm: &mut Vm, thr: &mut Thread) -> VmResult<Tramp> {
    match thr.ip {
        0 | 1 => {
            ffi::aff_env(thr, 1, 0)?;
            let ch = channel_arg(&vm.heap, "recv", ffi::aff_local(&vm.heap, thr, 0)?)?;
            let tid = thr.id;
            let taken = match vm.heap.kind_mut(ch) {
                ObjKind::Channel(c) => match c.pop() {
                    Some(v) => Some((v, std::mem::take(&mut c.send_waiters))),
                    None => {
                        c.recv_waiters.push(tid);
                        None
                    }
                },
                _ => return Err(VmError::mismatch("recv", "value")),
            };
            match taken {
                Some((v, waiters)) => {
                    for w in waiters {
                        vm.wake_channel_waiter(w);
                    }
                    ffi::aff_return(thr, v)
                }
                None => {
                    thr.state = ThreadState::Recv;
                    ffi::aff_yield(thr, 1)
                }
            }
        }
        line => Err(ffi::bad_resume_line("recv", line)),
    }
}

/// `(alt chans)` — receive from the first ready channel in a list;
/// the result is `(channel . value)`.
fn alt(vm: &mut Vm, thr: &mut Thread) -> VmResult<Tramp> {
    match thr.ip {
        0 | 1 => {
            ffi::aff_env(thr, 1, 0)?;
            let chans = vm
                .heap
                .list_to_vec(ffi::aff_local(&vm.heap, thr, 0)?)?;
            let tid = thr.id;
            for &chv in &chans {
                let ch = channel_arg(&vm.heap, "alt", chv)?;
                let taken = match vm.heap.kind_mut(ch) {
                    ObjKind::Channel(c) => c
                        .pop()
                        .map(|v| (v, std::mem::take(&mut c.send_waiters))),
                    _ => None,
                };
                if let Some((v, waiters)) = taken {
                    for w in waiters {
                        vm.wake_channel_waiter(w);
                    }
                    let pair = vm.heap.cons(chv, v)?;
                    return ffi::aff_return(thr, pair);
                }
            }
            for &chv in &chans {
                let ch = channel_arg(&vm.heap, "alt", chv)?;
                if let ObjKind::Channel(c) = vm.heap.kind_mut(ch) {
                    c.recv_waiters.push(tid);
                }
            }
            thr.state = ThreadState::Alt;
            ffi::aff_yield(thr, 1)
        }
        line => Err(ffi::bad_resume_line("alt", line)),
    }
}

/// `(apply f args)` — tail-call `f` with a list of arguments.
fn apply(vm: &mut Vm, thr: &mut Thread) -> VmResult<Tramp> {
    match thr.ip {
        0 => {
            if thr.argc != 2 {
                return Err(VmError::wrong_arity(thr.argc, "2".to_string()));
            }
            let popped = thr.pop_args(2)?;
            let spread = vm.heap.list_to_vec(popped[1])?;
            ffi::aff_tailcall(vm, thr, popped[0], &spread)
        }
        line => Err(ffi::bad_resume_line("apply", line)),
    }
}

/// `(atomic thunk)` — run a thunk without interleaving other threads.
fn atomic(vm: &mut Vm, thr: &mut Thread) -> VmResult<Tramp> {
    match thr.ip {
        0 => {
            ffi::aff_env(thr, 1, 0)?;
            let thunk = ffi::aff_local(&vm.heap, thr, 0)?;
            thr.state = ThreadState::Critical;
            ffi::aff_call(vm, thr, 1, thunk, &[])
        }
        1 => {
            thr.state = ThreadState::Running;
            let v = thr.valr;
            ffi::aff_return(thr, v)
        }
        line => Err(ffi::bad_resume_line("atomic", line)),
    }
}
