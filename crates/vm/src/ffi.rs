//! Foreign function interface.
//!
//! Native code plugs into the VM under one of two conventions:
//!
//! * **Synchronous foreign functions** ([`SffData`]) declare an arity,
//!   receive their arguments as a slice, return one value, and must not
//!   suspend. The trampoline pops the arguments and restores the
//!   pending continuation around the call.
//!
//! * **Resumable foreign functions** ([`RffData`]) are written as state
//!   machines over a resume line saved in the thread's instruction
//!   pointer. Through the `aff_*` primitives they can call back into
//!   Lumen code, yield the processor, or park on a file descriptor, and
//!   so participate in continuations, tail calls and I/O suspension
//!   exactly like bytecode. Blocking native code belongs here; the
//!   runtime never captures the native call stack.

use crate::cont;
use crate::env;
use crate::error::{VmError, VmResult};
use crate::heap::{Heap, ObjKind};
use crate::thread::{Thread, ThreadState};
use crate::value::Value;
use crate::vm::{Tramp, Vm};

/// Synchronous native function.
pub type SffFn = fn(&mut Vm, &[Value]) -> VmResult<Value>;

/// Resumable native function body; dispatches on `thr.ip`.
pub type RffFn = fn(&mut Vm, &mut Thread) -> VmResult<Tramp>;

/// Variadic arity marker for synchronous foreign functions.
pub const VARIADIC: i32 = -1;

/// Payload of a synchronous foreign function object.
#[derive(Debug)]
pub struct SffData {
    pub name: String,
    /// Declared arity; [`VARIADIC`] accepts any count.
    pub arity: i32,
    pub f: SffFn,
}

/// Payload of a resumable foreign function object.
#[derive(Debug)]
pub struct RffData {
    pub name: String,
    pub f: RffFn,
}

/// Wrap a synchronous native function.
pub fn mksff(heap: &mut Heap, name: &str, arity: i32, f: SffFn) -> VmResult<Value> {
    Ok(Value::Obj(heap.alloc(ObjKind::Sff(SffData {
        name: name.to_string(),
        arity,
        f,
    }))?))
}

/// Wrap a resumable native function.
pub fn mkrff(heap: &mut Heap, name: &str, f: RffFn) -> VmResult<Value> {
    Ok(Value::Obj(heap.alloc(ObjKind::Rff(RffData {
        name: name.to_string(),
        f,
    }))?))
}

/// Declare the environment of a resumable function: `req` arguments
/// from the stack plus `extra` locals. A no-op when the environment
/// already exists, so resumed lines can fall through it.
pub fn aff_env(thr: &mut Thread, req: usize, extra: usize) -> VmResult<()> {
    if !thr.envr.is_nil() {
        return Ok(());
    }
    if thr.argc != req {
        return Err(VmError::wrong_arity(thr.argc, req.to_string()));
    }
    env::mkenv(thr, req, extra)
}

/// Read local `index` of the resumable function's environment.
pub fn aff_local(heap: &Heap, thr: &Thread, index: usize) -> VmResult<Value> {
    env::getenv(heap, thr, 0, index)
}

/// Write local `index` of the resumable function's environment.
pub fn aff_set_local(heap: &mut Heap, thr: &mut Thread, index: usize, v: Value) -> VmResult<()> {
    env::setenv(heap, thr, 0, index, v)
}

/// Call `func`, resuming this function at `line` with the result in
/// VALR.
pub fn aff_call(
    vm: &mut Vm,
    thr: &mut Thread,
    line: usize,
    func: Value,
    args: &[Value],
) -> VmResult<Tramp> {
    cont::push_cont(vm, thr, line)?;
    for &a in args {
        thr.cpush(a)?;
    }
    thr.argc = args.len();
    thr.valr = func;
    Ok(Tramp::FnApp)
}

/// Tail-call `func`: the caller's frame is merged away and the pending
/// continuation is reused.
pub fn aff_tailcall(vm: &mut Vm, thr: &mut Thread, func: Value, args: &[Value]) -> VmResult<Tramp> {
    for &a in args {
        thr.cpush(a)?;
    }
    env::menv(&vm.heap, thr, args.len())?;
    thr.valr = func;
    Ok(Tramp::FnApp)
}

/// Give up the processor; execution resumes at `line`.
pub fn aff_yield(thr: &mut Thread, line: usize) -> VmResult<Tramp> {
    thr.ip = line;
    Ok(Tramp::Suspend)
}

/// Park the thread until `fd` is readable; execution resumes at `line`.
pub fn aff_iowait(vm: &mut Vm, thr: &mut Thread, line: usize, fd: i32) -> VmResult<Tramp> {
    // The frame outlives the suspension, so it moves to the heap now.
    let env = thr.envr;
    thr.envr = env::promote(&mut vm.heap, thr, env)?;
    thr.wait_fd = Some(fd);
    thr.state = ThreadState::IoWait;
    aff_yield(thr, line)
}

/// Return `v` through the pending continuation.
pub fn aff_return(thr: &mut Thread, v: Value) -> VmResult<Tramp> {
    thr.valr = v;
    Ok(Tramp::Rc)
}

/// Resume line that does not exist in the function: an internal fault.
pub fn bad_resume_line(name: &str, line: usize) -> VmError {
    VmError::IpOutOfRange {
        ip: line,
        name: name.to_string(),
    }
}
