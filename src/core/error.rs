// This module defines the error types shared by every stage of the rtjit backend, using the
// thiserror crate for the Display and Error implementations. JitError separates the failure
// categories the runtime must treat differently: configuration and legalization failures
// (an unsupported type or an opcode with no encoding on the target), internal compiler
// errors raised when an allocator or lowering invariant breaks (carrying method, block,
// instruction index and opcode so the failing instruction can be found), unresolved patch
// targets, compile failures observed by a trampoline, textual IR parse errors, executable
// memory failures and encoder errors reported by iced-x86. JitResult<T> is the alias used
// throughout the crate. None of these errors abort the process; they end the compilation
// attempt of one method and propagate to its caller.

//! Error types for the rtjit backend.

use crate::codegen::patch::PatchTarget;
use thiserror::Error;

/// Main error type for compilation, patching and runtime dispatch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JitError {
    #[error("unsupported operation: {what}")]
    UnsupportedOperation { what: String },

    #[error("internal compiler error in {method} (block {block}, instruction {index}, {opcode}): {reason}")]
    InternalCompilerError {
        method: String,
        block: u32,
        index: usize,
        opcode: &'static str,
        reason: String,
    },

    #[error("unresolved reference: {0}")]
    UnresolvedReference(PatchTarget),

    #[error("compilation of {method} failed: {reason}")]
    CompileFailed { method: String, reason: String },

    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("executable memory: {0}")]
    Memory(String),

    #[error("encoding failed: {0}")]
    Encoding(String),
}

impl JitError {
    pub fn unsupported(what: impl Into<String>) -> Self {
        JitError::UnsupportedOperation { what: what.into() }
    }

    /// Build an internal error that is not tied to a particular instruction.
    pub fn internal(method: &str, reason: impl Into<String>) -> Self {
        JitError::InternalCompilerError {
            method: method.to_string(),
            block: 0,
            index: 0,
            opcode: "-",
            reason: reason.into(),
        }
    }

    /// Build an internal error pointing at instruction `index` of `block`.
    pub fn at_inst(
        method: &str,
        block: u32,
        index: usize,
        opcode: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        JitError::InternalCompilerError {
            method: method.to_string(),
            block,
            index,
            opcode,
            reason: reason.into(),
        }
    }
}

impl From<iced_x86::IcedError> for JitError {
    fn from(e: iced_x86::IcedError) -> Self {
        JitError::Encoding(e.to_string())
    }
}

/// Result type alias for backend operations.
pub type JitResult<T> = Result<T, JitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_error_message_names_the_instruction() {
        let err = JitError::InternalCompilerError {
            method: "Foo::bar".into(),
            block: 2,
            index: 7,
            opcode: "div",
            reason: "no free register".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Foo::bar"));
        assert!(msg.contains("block 2"));
        assert!(msg.contains("instruction 7"));
        assert!(msg.contains("div"));
    }

    #[test]
    fn test_unsupported_helper() {
        let err = JitError::unsupported("float add on x86-64");
        assert!(matches!(err, JitError::UnsupportedOperation { .. }));
    }
}
