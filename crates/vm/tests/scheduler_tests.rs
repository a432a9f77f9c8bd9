//! Green-thread scheduling: spawning, fairness, sleep, channels, join,
//! I/O waits and collection under allocation pressure.

use lumen_vm::{ffi, CodeBuilder, Opcode, Thread, Tramp, Value, Vm, VmResult};

fn fix(n: i64) -> Value {
    Value::Fixnum(n)
}

fn new_vm() -> Vm {
    let mut vm = Vm::new();
    vm.set_quantum(1000);
    vm.install_builtins().expect("builtins");
    vm
}

fn closure(vm: &mut Vm, cb: CodeBuilder, name: &str) -> Value {
    let code = cb.finish(&mut vm.heap, name).expect("assemble");
    vm.mkclosure(code, Value::Nil).expect("closure")
}

/// Count to `n`, appending each value to the global list `out`, with a
/// cooperative yield per step.
fn counter_program(vm: &mut Vm, n: i64, tag: i64) -> Value {
    let out = vm.intern("out");
    let yield_sym = vm.intern("yield");
    let mut cb = CodeBuilder::new();
    let l_out = cb.literal(out);
    let l_yield = cb.literal(yield_sym);
    cb.emit3(Opcode::Env, 0, 0, 1);
    cb.emit_ldi(fix(0)).expect("immediate");
    cb.emit1(Opcode::Stei, 0);
    let loop_start = cb.here();
    cb.emit1(Opcode::Ldei, 0);
    cb.emit(Opcode::Push);
    cb.emit_ldi(fix(n)).expect("immediate");
    cb.emit(Opcode::Is);
    let j_done = cb.emit_jump(Opcode::Jt);
    // out := (tag*100 + i) . out
    cb.emit1(Opcode::Ldei, 0);
    cb.emit(Opcode::Push);
    cb.emit_ldi(fix(tag * 100)).expect("immediate");
    cb.emit(Opcode::Add);
    cb.emit(Opcode::Push);
    cb.emit1(Opcode::Ldg, l_out as i64);
    cb.emit(Opcode::Cons);
    cb.emit1(Opcode::Stg, l_out as i64);
    // i := i + 1
    cb.emit1(Opcode::Ldei, 0);
    cb.emit(Opcode::Push);
    cb.emit_ldi(fix(1)).expect("immediate");
    cb.emit(Opcode::Add);
    cb.emit1(Opcode::Stei, 0);
    // (yield)
    let j = cb.emit_jump(Opcode::Cont);
    cb.emit1(Opcode::Ldg, l_yield as i64);
    cb.emit1(Opcode::Apply, 0);
    let back = cb.here();
    cb.patch_jump(j, back);
    let j_loop = cb.emit_jump(Opcode::Jmp);
    cb.patch_jump(j_loop, loop_start);
    let done = cb.here();
    cb.patch_jump(j_done, done);
    cb.emit1(Opcode::Ldei, 0);
    cb.emit(Opcode::Hlt);
    closure(vm, cb, "counter")
}

#[test]
fn threads_interleave_on_yield() {
    let mut vm = new_vm();
    vm.bind_global("out", Value::Nil);
    let a = counter_program(&mut vm, 3, 1);
    let b = counter_program(&mut vm, 3, 2);
    let ta = vm.spawn_closure(a, &[]).expect("spawn");
    let tb = vm.spawn_closure(b, &[]).expect("spawn");
    vm.run().expect("run");
    assert_eq!(vm.finished_value(ta), Some(fix(3)));
    assert_eq!(vm.finished_value(tb), Some(fix(3)));

    let entries = vm
        .heap
        .list_to_vec(vm.global("out").expect("out"))
        .expect("list");
    // Most recent first; yields interleave the two counters.
    assert_eq!(
        entries,
        vec![
            fix(202),
            fix(102),
            fix(201),
            fix(101),
            fix(200),
            fix(100)
        ]
    );
}

#[test]
fn spawn_builtin_returns_a_handle() {
    let mut vm = new_vm();
    vm.bind_global("hit", Value::Nil);
    let hit = vm.intern("hit");
    let spawn = vm.intern("spawn");
    let join = vm.intern("join");

    let mut thunk = CodeBuilder::new();
    let l_hit = thunk.literal(hit);
    thunk.emit(Opcode::True);
    thunk.emit1(Opcode::Stg, l_hit as i64);
    thunk.emit_ldi(fix(99)).expect("immediate");
    thunk.emit(Opcode::Ret);
    let thunk = closure(&mut vm, thunk, "thunk");

    // (join (spawn thunk))
    let mut cb = CodeBuilder::new();
    let l_thunk = cb.literal(thunk);
    let l_spawn = cb.literal(spawn);
    let l_join = cb.literal(join);
    let j1 = cb.emit_jump(Opcode::Cont);
    cb.emit1(Opcode::Ldl, l_thunk as i64);
    cb.emit(Opcode::Push);
    cb.emit1(Opcode::Ldg, l_spawn as i64);
    cb.emit1(Opcode::Apply, 1);
    let after1 = cb.here();
    cb.patch_jump(j1, after1);
    let j2 = cb.emit_jump(Opcode::Cont);
    cb.emit(Opcode::Push);
    cb.emit1(Opcode::Ldg, l_join as i64);
    cb.emit1(Opcode::Apply, 1);
    let after2 = cb.here();
    cb.patch_jump(j2, after2);
    cb.emit(Opcode::Hlt);
    let main = closure(&mut vm, cb, "main");

    let tid = vm.spawn_closure(main, &[]).expect("spawn");
    vm.run().expect("run");
    assert_eq!(vm.finished_value(tid), Some(fix(99)));
    assert_eq!(vm.global("hit"), Some(Value::True));
}

#[test]
fn sleep_orders_wakeups() {
    let mut vm = new_vm();
    vm.bind_global("out", Value::Nil);
    let out = vm.intern("out");
    let sleep = vm.intern("sleep");

    // (fn () (sleep secs) (= out (cons tag out)))
    let sleeper = |vm: &mut Vm, secs: Value, tag: i64| -> Value {
        let mut cb = CodeBuilder::new();
        let l_out = cb.literal(out);
        let l_secs = cb.literal(secs);
        let l_sleep = cb.literal(sleep);
        let j = cb.emit_jump(Opcode::Cont);
        cb.emit1(Opcode::Ldl, l_secs as i64);
        cb.emit(Opcode::Push);
        cb.emit1(Opcode::Ldg, l_sleep as i64);
        cb.emit1(Opcode::Apply, 1);
        let after = cb.here();
        cb.patch_jump(j, after);
        cb.emit_ldi(fix(tag)).expect("immediate");
        cb.emit(Opcode::Push);
        cb.emit1(Opcode::Ldg, l_out as i64);
        cb.emit(Opcode::Cons);
        cb.emit1(Opcode::Stg, l_out as i64);
        cb.emit(Opcode::Hlt);
        closure(vm, cb, "sleeper")
    };

    let slow_secs = vm.heap.flonum(0.05).expect("flonum");
    let fast_secs = vm.heap.flonum(0.01).expect("flonum");
    let slow = sleeper(&mut vm, slow_secs, 1);
    let fast = sleeper(&mut vm, fast_secs, 2);
    vm.spawn_closure(slow, &[]).expect("spawn");
    vm.spawn_closure(fast, &[]).expect("spawn");
    let start = std::time::Instant::now();
    vm.run().expect("run");
    assert!(start.elapsed() >= std::time::Duration::from_millis(50));

    let entries = vm
        .heap
        .list_to_vec(vm.global("out").expect("out"))
        .expect("list");
    // The slow sleeper finished last, so it consed last.
    assert_eq!(entries, vec![fix(1), fix(2)]);
}

#[test]
fn channels_pass_values_between_threads() {
    let mut vm = new_vm();
    vm.bind_global("got", Value::Nil);
    let got = vm.intern("got");
    let send = vm.intern("send");
    let recv = vm.intern("recv");
    let ch = {
        let chan = vm.global("chan").expect("builtin");
        let mut thr = vm.make_thread();
        vm.call_thread(&mut thr, chan, &[]).expect("chan");
        thr.value()
    };
    vm.pin(ch);

    // Consumer first, so it parks in the receive state.
    let mut consumer = CodeBuilder::new();
    let l_got = consumer.literal(got);
    let l_ch = consumer.literal(ch);
    let l_recv = consumer.literal(recv);
    let j = consumer.emit_jump(Opcode::Cont);
    consumer.emit1(Opcode::Ldl, l_ch as i64);
    consumer.emit(Opcode::Push);
    consumer.emit1(Opcode::Ldg, l_recv as i64);
    consumer.emit1(Opcode::Apply, 1);
    let after = consumer.here();
    consumer.patch_jump(j, after);
    consumer.emit1(Opcode::Stg, l_got as i64);
    consumer.emit(Opcode::Hlt);
    let consumer = closure(&mut vm, consumer, "consumer");

    let mut producer = CodeBuilder::new();
    let l_ch = producer.literal(ch);
    let l_send = producer.literal(send);
    let j = producer.emit_jump(Opcode::Cont);
    producer.emit1(Opcode::Ldl, l_ch as i64);
    producer.emit(Opcode::Push);
    producer.emit_ldi(fix(777)).expect("immediate");
    producer.emit(Opcode::Push);
    producer.emit1(Opcode::Ldg, l_send as i64);
    producer.emit1(Opcode::Apply, 2);
    let after = producer.here();
    producer.patch_jump(j, after);
    producer.emit(Opcode::Hlt);
    let producer = closure(&mut vm, producer, "producer");

    vm.spawn_closure(consumer, &[]).expect("spawn");
    vm.spawn_closure(producer, &[]).expect("spawn");
    vm.run().expect("run");
    assert_eq!(vm.global("got"), Some(fix(777)));
}

#[test]
fn channel_deadlock_is_reported() {
    let mut vm = new_vm();
    let recv = vm.intern("recv");
    let ch = {
        let chan = vm.global("chan").expect("builtin");
        let mut thr = vm.make_thread();
        vm.call_thread(&mut thr, chan, &[]).expect("chan");
        thr.value()
    };
    vm.pin(ch);

    let mut cb = CodeBuilder::new();
    let l_ch = cb.literal(ch);
    let l_recv = cb.literal(recv);
    let j = cb.emit_jump(Opcode::Cont);
    cb.emit1(Opcode::Ldl, l_ch as i64);
    cb.emit(Opcode::Push);
    cb.emit1(Opcode::Ldg, l_recv as i64);
    cb.emit1(Opcode::Apply, 1);
    let after = cb.here();
    cb.patch_jump(j, after);
    cb.emit(Opcode::Hlt);
    let clos = closure(&mut vm, cb, "stuck");

    vm.spawn_closure(clos, &[]).expect("spawn");
    assert_eq!(vm.run(), Err(lumen_vm::VmError::Deadlocked));
}

/// Resumable native function that parks on a descriptor, then reads
/// one byte once it is readable.
fn read_byte(vm: &mut Vm, thr: &mut Thread) -> VmResult<Tramp> {
    match thr.ip {
        0 => {
            ffi::aff_env(thr, 1, 0)?;
            let fd = match ffi::aff_local(&vm.heap, thr, 0)? {
                Value::Fixnum(fd) => fd as i32,
                _ => unreachable!("test passes a fixnum"),
            };
            ffi::aff_iowait(vm, thr, 1, fd)
        }
        1 => {
            let fd = match ffi::aff_local(&vm.heap, thr, 0)? {
                Value::Fixnum(fd) => fd as i32,
                _ => unreachable!("test passes a fixnum"),
            };
            let mut byte = 0u8;
            let n = unsafe { libc::read(fd, (&mut byte as *mut u8).cast(), 1) };
            assert_eq!(n, 1, "descriptor was reported readable");
            ffi::aff_return(thr, Value::Fixnum(byte as i64))
        }
        line => panic!("bad resume line {line}"),
    }
}

/// Synchronous native that writes one byte.
fn write_byte(_vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let Value::Fixnum(fd) = args[0] else {
        unreachable!("test passes a fixnum")
    };
    let byte = [0x2au8];
    let n = unsafe { libc::write(fd as i32, byte.as_ptr().cast(), 1) };
    assert_eq!(n, 1);
    Ok(Value::Nil)
}

#[test]
fn iowait_suspends_until_readable() {
    let mut vm = new_vm();
    vm.bind_global("byte", Value::Nil);
    let byte_sym = vm.intern("byte");
    let read_sym = vm.intern("read-byte");
    let write_sym = vm.intern("write-byte");
    let sleep = vm.intern("sleep");
    vm.defrff("read-byte", read_byte).expect("defrff");
    vm.defsff("write-byte", 1, write_byte).expect("defsff");

    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    let (rfd, wfd) = (fds[0], fds[1]);

    // Reader: (= byte (read-byte rfd))
    let mut reader = CodeBuilder::new();
    let l_byte = reader.literal(byte_sym);
    let l_read = reader.literal(read_sym);
    let j = reader.emit_jump(Opcode::Cont);
    reader.emit_ldi(fix(rfd as i64)).expect("immediate");
    reader.emit(Opcode::Push);
    reader.emit1(Opcode::Ldg, l_read as i64);
    reader.emit1(Opcode::Apply, 1);
    let after = reader.here();
    reader.patch_jump(j, after);
    reader.emit1(Opcode::Stg, l_byte as i64);
    reader.emit(Opcode::Hlt);
    let reader = closure(&mut vm, reader, "reader");

    // Writer: (sleep 0.02) then (write-byte wfd)
    let secs = vm.heap.flonum(0.02).expect("flonum");
    let mut writer = CodeBuilder::new();
    let l_secs = writer.literal(secs);
    let l_sleep = writer.literal(sleep);
    let l_write = writer.literal(write_sym);
    let j1 = writer.emit_jump(Opcode::Cont);
    writer.emit1(Opcode::Ldl, l_secs as i64);
    writer.emit(Opcode::Push);
    writer.emit1(Opcode::Ldg, l_sleep as i64);
    writer.emit1(Opcode::Apply, 1);
    let after1 = writer.here();
    writer.patch_jump(j1, after1);
    let j2 = writer.emit_jump(Opcode::Cont);
    writer.emit_ldi(fix(wfd as i64)).expect("immediate");
    writer.emit(Opcode::Push);
    writer.emit1(Opcode::Ldg, l_write as i64);
    writer.emit1(Opcode::Apply, 1);
    let after2 = writer.here();
    writer.patch_jump(j2, after2);
    writer.emit(Opcode::Hlt);
    let writer = closure(&mut vm, writer, "writer");

    vm.spawn_closure(reader, &[]).expect("spawn");
    vm.spawn_closure(writer, &[]).expect("spawn");
    vm.run().expect("run");
    assert_eq!(vm.global("byte"), Some(fix(0x2a)));

    unsafe {
        libc::close(rfd);
        libc::close(wfd);
    }
}

#[test]
fn collection_runs_under_pressure() {
    let mut vm = new_vm();
    vm.set_quantum(64);
    vm.heap.set_minor_threshold(256);
    vm.bind_global("lst", Value::Nil);
    let lst = vm.intern("lst");

    // Cons the numbers n..1 onto lst.
    let mut cb = CodeBuilder::new();
    let l_lst = cb.literal(lst);
    cb.emit3(Opcode::Env, 0, 0, 1);
    cb.emit_ldi(fix(1000)).expect("immediate");
    cb.emit1(Opcode::Stei, 0);
    let loop_start = cb.here();
    cb.emit1(Opcode::Ldei, 0);
    cb.emit(Opcode::Push);
    cb.emit_ldi(fix(0)).expect("immediate");
    cb.emit(Opcode::Is);
    let j_done = cb.emit_jump(Opcode::Jt);
    cb.emit1(Opcode::Ldei, 0);
    cb.emit(Opcode::Push);
    cb.emit1(Opcode::Ldg, l_lst as i64);
    cb.emit(Opcode::Cons);
    cb.emit1(Opcode::Stg, l_lst as i64);
    cb.emit1(Opcode::Ldei, 0);
    cb.emit(Opcode::Push);
    cb.emit_ldi(fix(1)).expect("immediate");
    cb.emit(Opcode::Sub);
    cb.emit1(Opcode::Stei, 0);
    let j_loop = cb.emit_jump(Opcode::Jmp);
    cb.patch_jump(j_loop, loop_start);
    let done = cb.here();
    cb.patch_jump(j_done, done);
    cb.emit1(Opcode::Ldg, l_lst as i64);
    cb.emit(Opcode::Hlt);
    let clos = closure(&mut vm, cb, "consing");

    let live_before = vm.heap.live();
    let tid = vm.spawn_closure(clos, &[]).expect("spawn");
    vm.run().expect("run");

    let out = vm.finished_value(tid).expect("finished");
    let entries = vm.heap.list_to_vec(out).expect("list");
    assert_eq!(entries.len(), 1000);
    assert_eq!(entries[0], fix(1));
    assert_eq!(entries[999], fix(1000));
    // The loop's garbage did not accumulate unboundedly.
    assert!(vm.heap.live() < live_before + 3000);
}

#[test]
fn apply_sync_runs_to_completion() {
    let mut vm = new_vm();
    let mut cb = CodeBuilder::new();
    cb.emit3(Opcode::Env, 2, 0, 0);
    cb.emit2(Opcode::Lde, 0, 0);
    cb.emit(Opcode::Push);
    cb.emit2(Opcode::Lde, 0, 1);
    cb.emit(Opcode::Add);
    cb.emit(Opcode::Ret);
    let clos = closure(&mut vm, cb, "adder");
    let v = vm.apply_sync(clos, &[fix(30), fix(12)]).expect("apply");
    assert_eq!(v, fix(42));
}

#[test]
fn interrupt_unwinds_and_signals() {
    let mut vm = new_vm();
    let seen = {
        use std::cell::RefCell;
        use std::rc::Rc;
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        vm.set_error_sink(Box::new(move |m| sink.borrow_mut().push(m.to_string())));
        seen
    };
    let yield_sym = vm.intern("yield");

    // Yield a few times, then return off the top.
    let mut cb = CodeBuilder::new();
    let l_yield = cb.literal(yield_sym);
    for _ in 0..3 {
        let j = cb.emit_jump(Opcode::Cont);
        cb.emit1(Opcode::Ldg, l_yield as i64);
        cb.emit1(Opcode::Apply, 0);
        let back = cb.here();
        cb.patch_jump(j, back);
    }
    cb.emit(Opcode::Ret);
    let clos = closure(&mut vm, cb, "yielder");

    let tid = vm.spawn_closure(clos, &[]).expect("spawn");
    vm.interrupt(tid, "stop now").expect("interrupt");
    vm.run().expect("run");
    // The thread still unwound its pending returns, then the final pop
    // signaled the interruption.
    assert!(vm.finished_value(tid).is_some());
    assert_eq!(seen.borrow().as_slice(), ["stop now"]);
}
