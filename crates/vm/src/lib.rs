//! # Lumen Virtual Machine
//!
//! Runtime core of the Lumen language: a word-coded bytecode virtual
//! machine with first-class continuations, dynamic-wind, catchable
//! errors, a resumable foreign-function interface, and a cooperative
//! green-thread scheduler multiplexed over one OS thread.
//!
//! ## Architecture
//!
//! - **Vm**: the single context object — heap, symbol table, globals,
//!   thread list, host error sink — threaded through every entry point
//! - **Trampoline**: alternates between stepping bytecode, applying
//!   functions and restoring continuations without growing the native
//!   stack
//! - **Heap**: slotted arena with generational mark/sweep collection
//!   and a write barrier feeding the remembered set
//! - **Environments**: stack-resident frames promoted to the heap when
//!   captured by a closure, a continuation or an I/O suspension
//! - **Scheduler**: round-robin instruction quanta, sleep queues and
//!   poll(2)-based I/O readiness
//!
//! ## Example
//!
//! ```
//! use lumen_vm::{CodeBuilder, Opcode, Value, Vm};
//!
//! # fn main() -> lumen_vm::VmResult<()> {
//! let mut vm = Vm::new();
//! let mut cb = CodeBuilder::new();
//! cb.emit_ldi(Value::Fixnum(2))?;
//! cb.emit(Opcode::Push);
//! cb.emit_ldi(Value::Fixnum(3))?;
//! cb.emit(Opcode::Add);
//! cb.emit(Opcode::Hlt);
//! let code = cb.finish(&mut vm.heap, "example")?;
//! let clos = vm.mkclosure(code, Value::Nil)?;
//!
//! let mut thr = vm.make_thread();
//! vm.call_thread(&mut thr, clos, &[])?;
//! assert_eq!(thr.value(), Value::Fixnum(5));
//! # Ok(())
//! # }
//! ```

/// Arithmetic tower and comparisons.
pub mod arith;
/// Builtin native functions.
pub mod builtins;
/// Channels for inter-thread communication.
pub mod channel;
/// Code objects and the bytecode assembler.
pub mod code;
/// First-class continuations and dynamic-wind.
pub mod cont;
/// Environments, stack- and heap-resident.
pub mod env;
/// Error types.
pub mod error;
/// Exceptions and error delivery.
pub mod exception;
/// Foreign function interface.
pub mod ffi;
/// Written representation of values.
pub mod fmt;
/// Arena heap and garbage collector.
pub mod heap;
/// I/O event notification.
pub mod iopoll;
/// Opcode definitions.
pub mod opcode;
/// Cooperative scheduler.
pub mod sched;
/// Symbol table.
pub mod symbols;
/// Green threads.
pub mod thread;
/// Value representation.
pub mod value;
/// The virtual machine proper.
pub mod vm;

pub use code::{CodeBuilder, CODE_VERSION};
pub use error::{VmError, VmResult};
pub use heap::{Heap, ObjKind};
pub use opcode::Opcode;
pub use symbols::SymbolTable;
pub use thread::{Thread, ThreadId, ThreadState};
pub use value::{ObjRef, Sym, Value};
pub use vm::{Tramp, Vm};
