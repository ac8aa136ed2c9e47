// This module serves as the hub for infrastructure shared across the backend: the
// compilation-unit context (target configuration, global declaration list, synchronized
// constant pool accumulator, unit statistics) and the error taxonomy. Everything here is
// target-independent; the x86 module consumes these types but never the other way around.

//! Core infrastructure shared across the backend.
//!
//! # Key Components
//!
//! ## Compilation context (`context`)
//! - Target configuration resolved once per unit
//! - Append-only, mutex-guarded constant pool with bit-pattern dedup
//! - Unit statistics
//!
//! ## Errors (`error`)
//! - [`CompileError`] taxonomy: unsupported operation, encoding range
//!   violation, malformed graph, internal invariant violation

pub mod context;
pub mod error;

pub use context::{
    CompilationContext, ConstantPool, InstructionSet, PoolConstant, TargetConfig, UnitStats,
};
pub use error::{CompileError, CompileResult};
