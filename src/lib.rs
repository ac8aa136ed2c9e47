// lower32 is an instruction-lowering and code-generation backend for 32-bit x86. It takes a
// machine-independent IR module, lowers every function through instruction selection,
// addressing-mode resolution, register allocation, and frame layout, encodes the result to
// machine code with relocation records, and writes a relocatable ELF object. Two instruction
// set variants are supported behind one selection contract: a baseline that assumes only
// SSE2, and an extended variant that uses SSE4.1 forms where they shorten the lowering.
// Functions compile independently and in parallel; everything the threads share is owned by
// one synchronized compilation context, and the merge is deterministic.

//! A retargetable lowering backend for 32-bit x86.
//!
//! # Pipeline
//!
//! [`unit::compile_unit`] validates the input [`ir::Module`], compiles every
//! function through the [`x86`] backend, lowers globals and the deduplicated
//! constant pool into sections, and returns an [`unit::AssembledUnit`].
//! [`obj::write_object`] serializes that unit as a relocatable ELF object.
//!
//! # Example
//!
//! ```
//! use lower32::{compile_unit, parse_module, write_object, TargetConfig};
//!
//! let module = parse_module(
//!     "func @answer() -> i32 {\nentry:\n  ret i32 42\n}\n",
//! )?;
//! let unit = compile_unit(&module, TargetConfig::default(), 1)?;
//! let elf = write_object(&unit)?;
//! assert_eq!(&elf[..4], b"\x7fELF");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod core;
pub mod ir;
pub mod obj;
pub mod tir;
pub mod unit;
pub mod x86;

pub use crate::core::{CompileError, CompileResult, InstructionSet, TargetConfig, UnitStats};
pub use crate::obj::write_object;
pub use crate::tir::{parse_module, print_module, ParseError};
pub use crate::unit::{compile_unit, AssembledUnit};
