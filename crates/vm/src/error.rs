//! Error types for the Lumen VM crate.
//!
//! Faults raised while a thread is running are converted into Lumen
//! exception objects and delivered through the error-continuation
//! register; only the fatal ones tear the thread down directly.

use thiserror::Error;

/// VM execution errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// A word in the instruction stream does not decode to an opcode.
    #[error("invalid opcode {word:#x}")]
    InvalidOpcode { word: i64 },

    /// The instruction pointer ran off the end of the code object.
    #[error("instruction pointer {ip} out of range for {name}")]
    IpOutOfRange { ip: usize, name: String },

    /// A literal index does not fit the code object's literal vector.
    #[error("literal index {index} out of range")]
    LiteralOutOfRange { index: usize },

    /// Pop or peek on an empty operand stack.
    #[error("stack underflow")]
    StackUnderflow,

    /// The operand stack grew past the hard cap.
    #[error("stack overflow: {limit} slots exceeded")]
    StackOverflow { limit: usize },

    /// An environment reference walked off the chain or past a frame.
    #[error("environment reference out of range (depth {depth}, index {index})")]
    BadEnvRef { depth: usize, index: usize },

    /// Global lookup of a symbol with no binding.
    #[error("unbound symbol: {name}")]
    UnboundSymbol { name: String },

    /// Application of a value that is not a function.
    #[error("cannot apply value of type {type_name}")]
    NotApplicable { type_name: &'static str },

    /// Call with an argument count the callee does not accept.
    #[error("wrong number of arguments ({given} for {expected})")]
    WrongArity { given: usize, expected: String },

    /// An operand had the wrong type for the instruction.
    #[error("can't take {op} of {type_name}")]
    TypeMismatch {
        op: &'static str,
        type_name: &'static str,
    },

    /// Exact (fixnum, bignum or rational) division by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// No coercion path between two numeric operands.
    #[error("cannot coerce {from} to {to}")]
    Coercion {
        from: &'static str,
        to: &'static str,
    },

    /// Error raised from Lumen code via `err`.
    #[error("{details}")]
    User { details: String },

    /// The heap refused an allocation.
    #[error("out of memory")]
    OutOfMemory,

    /// Every live thread is blocked on a channel operation.
    #[error("all threads blocked on channel operations")]
    Deadlocked,

    /// A thread ended in the broken state while the host was waiting on it.
    #[error("thread broken: {details}")]
    Broken { details: String },

    /// Underlying I/O failure in the event-notification facility.
    #[error("i/o error: {message}")]
    Io { message: String },
}

impl VmError {
    /// Create a new unbound-symbol error.
    pub fn unbound<S: Into<String>>(name: S) -> Self {
        Self::UnboundSymbol { name: name.into() }
    }

    /// Create a new wrong-arity error.
    pub fn wrong_arity<S: Into<String>>(given: usize, expected: S) -> Self {
        Self::WrongArity {
            given,
            expected: expected.into(),
        }
    }

    /// Create a new type-mismatch error.
    pub fn mismatch(op: &'static str, type_name: &'static str) -> Self {
        Self::TypeMismatch { op, type_name }
    }

    /// Create a new user error.
    pub fn user<S: Into<String>>(details: S) -> Self {
        Self::User {
            details: details.into(),
        }
    }

    /// Create a new I/O error.
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Fatal faults bypass `on-err` delivery: the thread is marked broken
    /// and the host error sink is called directly.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VmError::OutOfMemory | VmError::StackOverflow { .. } | VmError::Io { .. }
        )
    }

    /// Error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            VmError::InvalidOpcode { .. }
            | VmError::IpOutOfRange { .. }
            | VmError::LiteralOutOfRange { .. } => "instruction",
            VmError::StackUnderflow | VmError::StackOverflow { .. } => "stack",
            VmError::BadEnvRef { .. } => "environment",
            VmError::UnboundSymbol { .. } => "binding",
            VmError::NotApplicable { .. } | VmError::WrongArity { .. } => "apply",
            VmError::TypeMismatch { .. } | VmError::Coercion { .. } => "type",
            VmError::DivisionByZero => "arithmetic",
            VmError::User { .. } => "user",
            VmError::OutOfMemory => "memory",
            VmError::Deadlocked | VmError::Broken { .. } => "scheduler",
            VmError::Io { .. } => "io",
        }
    }
}

/// Result type for VM operations.
pub type VmResult<T> = std::result::Result<T, VmError>;

impl From<std::io::Error> for VmError {
    fn from(error: std::io::Error) -> Self {
        VmError::io(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_forms() {
        let e = VmError::unbound("foo");
        assert_eq!(e.to_string(), "unbound symbol: foo");

        let e = VmError::wrong_arity(3, "2");
        assert_eq!(e.to_string(), "wrong number of arguments (3 for 2)");

        let e = VmError::mismatch("car", "fixnum");
        assert_eq!(e.to_string(), "can't take car of fixnum");
    }

    #[test]
    fn classification() {
        assert!(VmError::OutOfMemory.is_fatal());
        assert!(VmError::StackOverflow { limit: 1 }.is_fatal());
        assert!(!VmError::DivisionByZero.is_fatal());
        assert!(!VmError::user("boom").is_fatal());

        assert_eq!(VmError::DivisionByZero.category(), "arithmetic");
        assert_eq!(VmError::StackUnderflow.category(), "stack");
    }
}
