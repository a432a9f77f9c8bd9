//! Channels.
//!
//! Fixed-capacity FIFO queues for inter-thread communication. A thread
//! sending on a full channel parks in the `Send` state, a receiver on
//! an empty one in `Recv` (or `Alt` when waiting on several); the
//! scheduler skips parked threads until the counterpart operation wakes
//! them. Everything runs on one OS thread, so no locking is involved.

use std::collections::VecDeque;

use crate::error::VmResult;
use crate::heap::{Heap, ObjKind};
use crate::thread::ThreadId;
use crate::value::Value;

/// Payload of a channel object.
#[derive(Debug)]
pub struct ChannelData {
    capacity: usize,
    buf: VecDeque<Value>,
    /// Threads parked waiting to receive.
    pub(crate) recv_waiters: Vec<ThreadId>,
    /// Threads parked waiting to send.
    pub(crate) send_waiters: Vec<ThreadId>,
}

impl ChannelData {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buf: VecDeque::new(),
            recv_waiters: Vec::new(),
            send_waiters: Vec::new(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn push(&mut self, v: Value) {
        self.buf.push_back(v);
    }

    pub fn pop(&mut self) -> Option<Value> {
        self.buf.pop_front()
    }

    /// Values currently buffered, for the collector.
    pub(crate) fn buffered(&self) -> impl Iterator<Item = Value> + '_ {
        self.buf.iter().copied()
    }
}

/// Allocate a channel value.
pub fn mkchannel(heap: &mut Heap, capacity: usize) -> VmResult<Value> {
    Ok(Value::Obj(heap.alloc(ObjKind::Channel(ChannelData::new(
        capacity,
    )))?))
}
