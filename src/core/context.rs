// This module provides the per-compilation-unit context shared by all function lowerings.
// CompilationContext replaces what would otherwise be ambient global state: it owns the
// target configuration (selected instruction-set variant), borrows the unit's global
// declaration list, and accumulates the constant pool behind a mutex so that functions
// lowered on parallel workers can register literals concurrently. The pool deduplicates by
// exact bit pattern and size; two literals with identical bits and size share one entry,
// while literals differing only in size never do. Pool entry symbol names are derived from
// the bit pattern, so names are stable regardless of which worker registers an entry first.
// The context also gathers unit-level statistics (functions lowered, spills, code bytes)
// in the style of a compilation session, reported through the log crate.

//! Compilation-unit context: target config, globals, constant pool.
//!
//! One context exists per compilation unit. It is created before any function
//! is lowered and torn down after section emission completes. Appending to the
//! constant pool is the only cross-function mutation and is synchronized.

use crate::ir::GlobalDecl;
use hashbrown::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Instruction-set variant selector.
///
/// `Sse2` is the baseline; `Sse41` additionally enables the extended
/// (vectorized) instruction-selection rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstructionSet {
    Sse2,
    Sse41,
}

impl fmt::Display for InstructionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstructionSet::Sse2 => f.write_str("sse2"),
            InstructionSet::Sse41 => f.write_str("sse4.1"),
        }
    }
}

/// Target configuration resolved once per compilation unit.
#[derive(Debug, Clone, Copy)]
pub struct TargetConfig {
    pub instruction_set: InstructionSet,
}

impl Default for TargetConfig {
    fn default() -> Self {
        TargetConfig {
            instruction_set: InstructionSet::Sse2,
        }
    }
}

/// A deduplicated literal that must be addressed from memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolConstant {
    /// Raw bit pattern, zero-extended to 64 bits.
    pub bits: u64,
    /// Size in bytes: 4 or 8.
    pub size: u8,
}

impl PoolConstant {
    /// Local symbol name for this entry. Derived from the bit pattern so the
    /// name does not depend on registration order across workers.
    pub fn symbol(&self) -> String {
        format!(".L$c{}${:0width$x}", self.size, self.bits, width = self.size as usize * 2)
    }
}

/// Constant pool accumulator. Created lazily on first use; one entry per
/// unique (value, size) pair per compilation unit.
#[derive(Debug, Default)]
pub struct ConstantPool {
    entries: HashMap<PoolConstant, ()>,
}

impl ConstantPool {
    /// Register a literal, deduplicating by exact bit pattern and size.
    pub fn register(&mut self, c: PoolConstant) {
        self.entries.entry(c).or_insert(());
    }

    /// All entries in deterministic layout order: larger entries first (for
    /// natural alignment when packed), then by bit pattern.
    pub fn layout_order(&self) -> Vec<PoolConstant> {
        let mut v: Vec<PoolConstant> = self.entries.keys().copied().collect();
        v.sort_by(|a, b| b.size.cmp(&a.size).then(a.bits.cmp(&b.bits)));
        v
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Unit-level statistics, reported when emission completes.
#[derive(Debug, Default, Clone)]
pub struct UnitStats {
    pub functions_lowered: usize,
    pub insts_selected: usize,
    pub spills_generated: usize,
    pub code_bytes: usize,
}

impl fmt::Display for UnitStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} functions, {} machine insts, {} spills, {} code bytes",
            self.functions_lowered, self.insts_selected, self.spills_generated, self.code_bytes
        )
    }
}

/// Process-wide state for one compilation unit.
pub struct CompilationContext<'unit> {
    config: TargetConfig,
    globals: &'unit [GlobalDecl],
    pool: Mutex<ConstantPool>,
    stats: Mutex<UnitStats>,
}

impl<'unit> CompilationContext<'unit> {
    pub fn new(config: TargetConfig, globals: &'unit [GlobalDecl]) -> Self {
        CompilationContext {
            config,
            globals,
            pool: Mutex::new(ConstantPool::default()),
            stats: Mutex::new(UnitStats::default()),
        }
    }

    pub fn config(&self) -> TargetConfig {
        self.config
    }

    pub fn instruction_set(&self) -> InstructionSet {
        self.config.instruction_set
    }

    pub fn globals(&self) -> &'unit [GlobalDecl] {
        self.globals
    }

    // Worker panics are reported as errors by the unit driver; a poisoned
    // lock does not invalidate the pool or the counters, so recover the guard.
    fn lock<'m, T>(m: &'m Mutex<T>) -> MutexGuard<'m, T> {
        m.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a literal in the constant pool, returning its symbol name.
    pub fn pool_constant(&self, c: PoolConstant) -> String {
        let mut pool = Self::lock(&self.pool);
        pool.register(c);
        log::trace!("constant pool entry {} ({} bytes)", c.symbol(), c.size);
        c.symbol()
    }

    /// Run `f` with the pool locked. Used by data lowering, which must only
    /// run after every function has registered its literals.
    pub fn with_pool<R>(&self, f: impl FnOnce(&ConstantPool) -> R) -> R {
        f(&Self::lock(&self.pool))
    }

    /// Merge per-function statistics into the unit totals.
    pub fn record_function(&self, insts: usize, spills: usize, code_bytes: usize) {
        let mut stats = Self::lock(&self.stats);
        stats.functions_lowered += 1;
        stats.insts_selected += insts;
        stats.spills_generated += spills;
        stats.code_bytes += code_bytes;
    }

    pub fn stats(&self) -> UnitStats {
        Self::lock(&self.stats).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_dedups_by_bits_and_size() {
        let mut pool = ConstantPool::default();
        pool.register(PoolConstant { bits: 0x3f800000, size: 4 });
        pool.register(PoolConstant { bits: 0x3f800000, size: 4 });
        assert_eq!(pool.len(), 1);
        // Same bits, different size: distinct entries.
        pool.register(PoolConstant { bits: 0x3f800000, size: 8 });
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn pool_layout_is_size_major_then_bits() {
        let mut pool = ConstantPool::default();
        pool.register(PoolConstant { bits: 2, size: 4 });
        pool.register(PoolConstant { bits: 1, size: 8 });
        pool.register(PoolConstant { bits: 1, size: 4 });
        let order = pool.layout_order();
        assert_eq!(order[0], PoolConstant { bits: 1, size: 8 });
        assert_eq!(order[1], PoolConstant { bits: 1, size: 4 });
        assert_eq!(order[2], PoolConstant { bits: 2, size: 4 });
    }

    #[test]
    fn pool_symbols_are_order_independent() {
        let a = PoolConstant { bits: 0x400921fb54442d18, size: 8 };
        assert_eq!(a.symbol(), ".L$c8$400921fb54442d18");
        let b = PoolConstant { bits: 0x40490fdb, size: 4 };
        assert_eq!(b.symbol(), ".L$c4$40490fdb");
    }

    #[test]
    fn context_accumulates_stats() {
        let globals = [];
        let ctx = CompilationContext::new(TargetConfig::default(), &globals);
        ctx.record_function(10, 1, 40);
        ctx.record_function(5, 0, 12);
        let stats = ctx.stats();
        assert_eq!(stats.functions_lowered, 2);
        assert_eq!(stats.insts_selected, 15);
        assert_eq!(stats.spills_generated, 1);
        assert_eq!(stats.code_bytes, 52);
    }
}
