//! Cooperative green-thread scheduler.
//!
//! One OS thread multiplexes every green thread in round-robin order.
//! Each pass grants runnable threads an instruction quantum through the
//! trampoline, wakes sleepers whose deadline has passed, registers
//! I/O-waiting threads with the event facility, and unlinks finished
//! ones. When nothing ran, the pass either waits on the event facility
//! (timeout shaped by the sleepers), sleeps until the earliest wakeup,
//! or reports deadlock if every live thread is channel-blocked.
//!
//! Collection runs between passes, never while a thread holds the
//! interpreter, and [`Vm::apply_sync`] runs a nested loop with
//! collection paused for host calls whose values are not rooted.

use std::time::{Duration, Instant};

use crate::error::{VmError, VmResult};
use crate::heap::ObjKind;
use crate::iopoll;
use crate::thread::{Thread, ThreadId, ThreadState};
use crate::value::Value;
use crate::vm::{Tramp, Vm};

impl Vm {
    /// Queue a closure as a new green thread.
    pub fn spawn_closure(&mut self, f: Value, args: &[Value]) -> VmResult<ThreadId> {
        let mut thr = self.make_thread();
        thr.valr = f;
        for &a in args {
            thr.cpush(a)?;
        }
        thr.argc = args.len();
        thr.entry = Tramp::FnApp;
        thr.state = ThreadState::Ready;
        let id = thr.id;
        log::debug!("thread {}: spawned", id.0);
        self.threads.push(Some(thr));
        Ok(id)
    }

    /// First-class handle for a thread.
    pub fn thread_handle(&mut self, tid: ThreadId) -> VmResult<Value> {
        Ok(Value::Obj(self.heap.alloc(ObjKind::Thread(tid))?))
    }

    pub(crate) fn thread_mut(&mut self, tid: ThreadId) -> Option<&mut Thread> {
        self.threads.iter_mut().flatten().find(|t| t.id == tid)
    }

    /// Unblock a thread parked on a channel operation.
    pub(crate) fn wake_channel_waiter(&mut self, tid: ThreadId) {
        if let Some(thr) = self.thread_mut(tid) {
            if thr.state.channel_blocked() {
                thr.state = ThreadState::Ready;
            }
        }
    }

    /// Ask a thread to terminate: it unwinds through its protect
    /// clauses on its next returns, and the host sink receives
    /// `details` when the last continuation pops.
    pub fn interrupt(&mut self, tid: ThreadId, details: &str) -> VmResult<()> {
        let exc = self.heap.string(details)?;
        match self.thread_mut(tid) {
            Some(thr) => {
                thr.state = ThreadState::Exiting;
                thr.interrupt = Some(exc);
                Ok(())
            }
            None => Err(VmError::user(format!("no such thread: {}", tid.0))),
        }
    }

    /// Final value of a finished thread.
    pub fn finished_value(&self, tid: ThreadId) -> Option<Value> {
        self.finished.get(&tid.0).copied()
    }

    /// Number of threads still linked into the scheduler.
    pub fn live_threads(&self) -> usize {
        self.threads.iter().flatten().count()
    }

    fn run_quantum(&mut self, slot: usize) {
        let Some(mut thr) = self.threads[slot].take() else {
            return;
        };
        thr.quanta = self.quantum;
        if matches!(thr.state, ThreadState::Ready | ThreadState::IoReady) {
            thr.state = ThreadState::Running;
        }
        let entry = std::mem::replace(&mut thr.entry, Tramp::Resume);
        self.trampoline(&mut thr, entry);
        if thr.state == ThreadState::Running {
            thr.state = ThreadState::Ready;
        }
        self.threads[slot] = Some(thr);
    }

    fn slot_state(&self, slot: usize) -> Option<ThreadState> {
        self.threads[slot].as_ref().map(|t| t.state)
    }

    /// Drive the scheduler until the thread list empties.
    pub fn run(&mut self) -> VmResult<()> {
        loop {
            if self.live_threads() == 0 {
                log::debug!("scheduler: all threads finished");
                return Ok(());
            }
            let mut ran_any = false;
            let mut min_sleep: Option<Duration> = None;
            for slot in 0..self.threads.len() {
                let Some(state) = self.slot_state(slot) else {
                    continue;
                };
                match state {
                    ThreadState::Released | ThreadState::Broken => {}
                    ThreadState::Send | ThreadState::Recv | ThreadState::Alt => {}
                    ThreadState::IoWait => {}
                    ThreadState::Sleeping => {
                        let now = Instant::now();
                        let due = match self.threads[slot].as_ref().and_then(|t| t.wakeup_at) {
                            Some(at) if at > now => {
                                let remaining = at - now;
                                min_sleep = Some(match min_sleep {
                                    Some(d) => d.min(remaining),
                                    None => remaining,
                                });
                                false
                            }
                            _ => true,
                        };
                        if due {
                            if let Some(thr) = &mut self.threads[slot] {
                                thr.state = ThreadState::Ready;
                                thr.wakeup_at = None;
                            }
                            self.run_quantum(slot);
                            ran_any = true;
                        }
                    }
                    ThreadState::IoReady => {
                        if let Some(thr) = &mut self.threads[slot] {
                            thr.state = ThreadState::Ready;
                        }
                        self.run_quantum(slot);
                        ran_any = true;
                    }
                    ThreadState::Critical => {
                        // Uninterruptible: keep granting quanta until the
                        // thread leaves the critical state.
                        loop {
                            self.run_quantum(slot);
                            if !matches!(self.slot_state(slot), Some(ThreadState::Critical)) {
                                break;
                            }
                        }
                        ran_any = true;
                    }
                    ThreadState::Ready | ThreadState::Exiting | ThreadState::Running => {
                        self.run_quantum(slot);
                        ran_any = true;
                    }
                }
            }
            self.unlink_finished();
            let iowaits: Vec<i32> = self
                .threads
                .iter()
                .flatten()
                .filter(|t| t.state == ThreadState::IoWait)
                .filter_map(|t| t.wait_fd)
                .collect();
            if !iowaits.is_empty() {
                let blocked_elsewhere = self
                    .threads
                    .iter()
                    .flatten()
                    .filter(|t| t.state != ThreadState::IoWait)
                    .count();
                let sleeping = self
                    .threads
                    .iter()
                    .flatten()
                    .filter(|t| t.state == ThreadState::Sleeping)
                    .count();
                let timeout_ms = if blocked_elsewhere == 0 {
                    -1
                } else if !ran_any && blocked_elsewhere == sleeping {
                    min_sleep
                        .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
                        .unwrap_or(0)
                } else {
                    0
                };
                for fd in iopoll::poll_read(&iowaits, timeout_ms)? {
                    for thr in self.threads.iter_mut().flatten() {
                        if thr.state == ThreadState::IoWait && thr.wait_fd == Some(fd) {
                            thr.state = ThreadState::IoReady;
                            thr.wait_fd = None;
                        }
                    }
                }
            } else if !ran_any {
                match min_sleep {
                    Some(d) => std::thread::sleep(d),
                    None => {
                        if self.live_threads() > 0 {
                            return Err(VmError::Deadlocked);
                        }
                    }
                }
            }
            self.maybe_collect();
        }
    }

    fn unlink_finished(&mut self) {
        for slot in 0..self.threads.len() {
            let finished = matches!(
                self.slot_state(slot),
                Some(ThreadState::Released) | Some(ThreadState::Broken)
            );
            if !finished {
                continue;
            }
            if let Some(thr) = self.threads[slot].take() {
                let value = if thr.state == ThreadState::Released {
                    thr.value()
                } else {
                    Value::Nil
                };
                log::debug!(
                    "thread {}: unlinked ({})",
                    thr.id.0,
                    if thr.state == ThreadState::Released {
                        "released"
                    } else {
                        "broken"
                    }
                );
                self.finished.insert(thr.id.0, value);
            }
        }
    }

    /// Collect if allocation pressure crossed the threshold.
    pub(crate) fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let roots = self.gc_roots();
        let major = self.heap.wants_major();
        self.heap.collect(&roots, major);
    }

    /// Apply a closure on a private thread and run it to completion in
    /// a nested loop, with collection paused. This is the entry used
    /// for macro expansion, where compiler-local values are not rooted.
    pub fn apply_sync(&mut self, f: Value, args: &[Value]) -> VmResult<Value> {
        self.heap.pause_gc();
        let result = self.apply_sync_inner(f, args);
        self.heap.resume_gc();
        result
    }

    fn apply_sync_inner(&mut self, f: Value, args: &[Value]) -> VmResult<Value> {
        let mut thr = self.make_thread();
        thr.state = ThreadState::Critical;
        thr.valr = f;
        for &a in args {
            thr.cpush(a)?;
        }
        thr.argc = args.len();
        let mut entry = Tramp::FnApp;
        loop {
            thr.quanta = self.quantum;
            self.trampoline(&mut thr, entry);
            entry = Tramp::Resume;
            match thr.state {
                ThreadState::Released => return Ok(thr.value()),
                ThreadState::Broken => {
                    return Err(VmError::Broken {
                        details: "uncaught exception".to_string(),
                    })
                }
                ThreadState::Sleeping => {
                    if let Some(at) = thr.wakeup_at.take() {
                        let now = Instant::now();
                        if at > now {
                            std::thread::sleep(at - now);
                        }
                    }
                    thr.state = ThreadState::Critical;
                }
                ThreadState::IoWait => {
                    if let Some(fd) = thr.wait_fd.take() {
                        iopoll::poll_read(&[fd], -1)?;
                    }
                    thr.state = ThreadState::Critical;
                }
                ThreadState::Send | ThreadState::Recv | ThreadState::Alt => {
                    return Err(VmError::Deadlocked)
                }
                _ => {}
            }
        }
    }

    /// Call a closure on a caller-owned thread: set up the registers,
    /// grant one quantum and enter the trampoline in application state.
    pub fn call_thread(&mut self, thr: &mut Thread, f: Value, args: &[Value]) -> VmResult<()> {
        thr.valr = f;
        for &a in args {
            thr.cpush(a)?;
        }
        thr.argc = args.len();
        thr.quanta = self.quantum;
        thr.state = ThreadState::Running;
        self.trampoline(thr, Tramp::FnApp);
        Ok(())
    }
}
