// This module is the x86-32 target backend. The per-function pipeline runs lowering
// (IR to target instructions with virtual registers), addressing-mode resolution (folding
// address arithmetic into memory operands), register allocation (greedy live-range scan
// with pinning and spilling), frame finalization (layout, prologue/epilogue insertion,
// frame elision for simple leaves), and encoding (deterministic per-instruction machine
// code with branch patching and relocation records). Data and header lowering run once per
// unit, after every function pipeline has finished, because only then is the constant pool
// complete.

//! x86-32 target backend.
//!
//! # Key Components
//!
//! - [`lower`]: IR-to-target lowering with variant instruction selection
//! - [`regalloc`]: live-range register allocation
//! - [`addr`]: addressing-mode resolution
//! - [`frame`]: stack frame layout and prologue/epilogue
//! - [`encode`]: machine-code emission and relocations
//! - [`data`]: data-section and unit-header lowering
//! - [`compile_function`]: the pipeline tying the per-function passes together

pub mod addr;
pub mod data;
pub mod encode;
pub mod frame;
pub mod inst;
pub mod lower;
pub mod regalloc;
pub mod regs;

use crate::core::{CompilationContext, CompileResult};
use crate::ir;
use bumpalo::Bump;

pub use encode::{EncodedFunction, Reloc, RelocKind};

/// Fully compiled body of one function.
#[derive(Debug)]
pub struct CompiledFunction {
    pub name: String,
    pub code: Vec<u8>,
    pub relocs: Vec<Reloc>,
    /// Machine instructions in the final stream, prologue included.
    pub insts: usize,
    pub spills: usize,
}

/// Run the whole per-function pipeline.
pub fn compile_function(
    func: &ir::Function,
    ctx: &CompilationContext<'_>,
) -> CompileResult<CompiledFunction> {
    func.validate()?;
    let rules = lower::isel_rules(ctx.instruction_set());
    let arena = Bump::new();
    let mut lowered = lower::lower_function(func, ctx, rules, &arena)?;
    addr::resolve(&mut lowered);
    let alloc = regalloc::allocate(&mut lowered)?;
    let layout = frame::FrameLayout::finalize(&lowered.frame, alloc.used, lowered.has_call);
    let (insts, starts) = layout.insert(
        std::mem::take(&mut lowered.insts),
        &lowered.block_starts,
    );
    lowered.insts = insts;
    lowered.block_starts = starts;
    let encoded = encode::encode_function(&lowered, &layout)?;
    ctx.record_function(lowered.insts.len(), alloc.spills, encoded.code.len());
    log::debug!(
        "compiled {}: {} bytes, frame {} bytes, {} spill(s)",
        func.name,
        encoded.code.len(),
        layout.frame_size(),
        alloc.spills
    );
    Ok(CompiledFunction {
        name: func.name.clone(),
        code: encoded.code,
        relocs: encoded.relocs,
        insts: lowered.insts.len(),
        spills: alloc.spills,
    })
}
