// This module defines error types for the lower32 backend using the thiserror crate for
// idiomatic Rust error handling. CompileError is the main error enum covering the failure
// taxonomy of the backend: IR instructions with no legal lowering under the active
// instruction-set variant, operands that remain unencodable after addressing-mode
// resolution, malformed input function graphs, and internal invariant violations such as
// register-allocation exhaustion (which cannot occur by construction because stack spilling
// is always available). Each variant carries the offending function and instruction identity
// where applicable, since failures are reported at compilation-unit granularity. The module
// also provides CompileResult<T> as a convenience type alias for Result<T, CompileError>.

//! Error types for the lower32 backend.
//!
//! Using thiserror for more idiomatic error handling.

use thiserror::Error;

/// Main error type for compilation-unit lowering.
///
/// A function-local failure escalates to whole-unit failure; no partial
/// object output is produced and no retries are attempted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// An IR instruction has no legal lowering under the active
    /// instruction-set variant. Fatal at compilation-unit granularity.
    #[error("unsupported operation in `{function}`: {inst}")]
    UnsupportedInst { function: String, inst: String },

    /// An operand exceeds the target's encodable range even after
    /// addressing-mode resolution forced an explicit address computation.
    #[error("unencodable operand in `{function}`: {reason}")]
    Encoding { function: String, reason: String },

    /// The input function graph violates a structural invariant.
    #[error("malformed function graph in `{function}`: {reason}")]
    InvalidGraph { function: String, reason: String },

    /// Internal invariant violation, e.g. register allocation failing even
    /// though spilling to a stack slot is always available.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;
