// This module lowers the non-code parts of a compilation unit. Global declarations split
// into a read-only and a read-write section, each member aligned as declared and zero-filled
// past its initializer. The constant pool lands in its own read-only section with one symbol
// per deduplicated entry; entries are laid out in a canonical order (8-byte entries first,
// then 4-byte, each group sorted by bit pattern) so that the section contents are a pure
// function of the pool's membership and never depend on which worker registered an entry
// first. The unit header carries the instruction-set tag and the attribute list for every
// symbol the unit defines; the object writer turns these into the container's symbol table.

//! Data-section and unit-header lowering.

use crate::core::{CompilationContext, InstructionSet};
use crate::ir::GlobalDecl;

/// Contents of one data section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionData {
    pub bytes: Vec<u8>,
    pub symbols: Vec<DataSymbol>,
    pub align: u32,
}

/// A symbol defined inside a data section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSymbol {
    pub name: String,
    pub offset: u32,
    pub size: u32,
}

impl SectionData {
    fn new() -> Self {
        SectionData {
            bytes: Vec::new(),
            symbols: Vec::new(),
            align: 1,
        }
    }

    fn align_to(&mut self, align: u32) {
        let align = align.max(1);
        self.align = self.align.max(align);
        while self.bytes.len() as u32 % align != 0 {
            self.bytes.push(0);
        }
    }

    fn push_global(&mut self, g: &GlobalDecl) {
        self.align_to(g.align);
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(&g.init);
        // Zero-filled tail past the initializer.
        self.bytes.resize(offset as usize + g.size as usize, 0);
        self.symbols.push(DataSymbol {
            name: g.name.clone(),
            offset,
            size: g.size,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty() && self.symbols.is_empty()
    }
}

/// All lowered data sections of a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSections {
    pub rodata: SectionData,
    pub data: SectionData,
    /// Constant-pool section; read-only, one symbol per entry.
    pub pool: SectionData,
}

/// Lower globals and the accumulated constant pool. Must run after every
/// function has been lowered; by then the pool is complete.
pub fn lower_data(ctx: &CompilationContext<'_>) -> DataSections {
    let mut rodata = SectionData::new();
    let mut data = SectionData::new();
    for g in ctx.globals() {
        if g.read_only {
            rodata.push_global(g);
        } else {
            data.push_global(g);
        }
    }

    let pool = ctx.with_pool(|pool| {
        let mut section = SectionData::new();
        for c in pool.layout_order() {
            section.align_to(c.size as u32);
            let offset = section.bytes.len() as u32;
            section
                .bytes
                .extend_from_slice(&c.bits.to_le_bytes()[..c.size as usize]);
            section.symbols.push(DataSymbol {
                name: c.symbol(),
                offset,
                size: c.size as u32,
            });
        }
        section
    });
    log::debug!(
        "data lowering: {} ro bytes, {} rw bytes, {} pool entries",
        rodata.bytes.len(),
        data.bytes.len(),
        pool.symbols.len()
    );

    DataSections { rodata, data, pool }
}

/// Kind of a defined symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Data,
}

/// Attributes of one symbol the unit defines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolAttr {
    pub name: String,
    pub kind: SymbolKind,
    /// Local symbols (constant-pool entries) are invisible outside the unit.
    pub local: bool,
}

/// Unit header: instruction-set tag plus the defined-symbol attribute list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitHeader {
    pub arch_tag: String,
    pub symbols: Vec<SymbolAttr>,
}

/// Lower the unit header. `functions` is the unit's function list in module
/// order, which the attribute list preserves.
pub fn lower_header(ctx: &CompilationContext<'_>, functions: &[String]) -> UnitHeader {
    let arch_tag = match ctx.instruction_set() {
        InstructionSet::Sse2 => "x86-sse2".to_string(),
        InstructionSet::Sse41 => "x86-sse4.1".to_string(),
    };
    let mut symbols = Vec::new();
    for name in functions {
        symbols.push(SymbolAttr {
            name: name.clone(),
            kind: SymbolKind::Function,
            local: false,
        });
    }
    for g in ctx.globals() {
        symbols.push(SymbolAttr {
            name: g.name.clone(),
            kind: SymbolKind::Data,
            local: false,
        });
    }
    for c in ctx.with_pool(|pool| pool.layout_order()) {
        symbols.push(SymbolAttr {
            name: c.symbol(),
            kind: SymbolKind::Data,
            local: true,
        });
    }
    UnitHeader { arch_tag, symbols }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PoolConstant, TargetConfig};

    fn ctx_with_pool<'a>(globals: &'a [GlobalDecl]) -> CompilationContext<'a> {
        let ctx = CompilationContext::new(TargetConfig::default(), globals);
        ctx.pool_constant(PoolConstant { bits: 0x3f800000, size: 4 });
        ctx.pool_constant(PoolConstant { bits: 0x4000000000000000, size: 8 });
        ctx.pool_constant(PoolConstant { bits: 0x3f800000, size: 4 });
        ctx
    }

    #[test]
    fn pool_section_groups_wide_entries_first() {
        let globals = [];
        let ctx = ctx_with_pool(&globals);
        let sections = lower_data(&ctx);
        let pool = &sections.pool;
        // Duplicate f32 registration collapsed to one entry.
        assert_eq!(pool.symbols.len(), 2);
        assert_eq!(pool.symbols[0].size, 8);
        assert_eq!(pool.symbols[0].offset, 0);
        assert_eq!(pool.symbols[1].size, 4);
        assert_eq!(pool.symbols[1].offset, 8);
        assert_eq!(pool.align, 8);
        assert_eq!(&pool.bytes[..8], &0x4000000000000000u64.to_le_bytes());
        assert_eq!(&pool.bytes[8..12], &0x3f800000u32.to_le_bytes());
    }

    #[test]
    fn data_lowering_is_idempotent() {
        let globals = [GlobalDecl {
            name: "g".into(),
            size: 12,
            align: 4,
            read_only: true,
            init: vec![1, 2, 3],
        }];
        let ctx = ctx_with_pool(&globals);
        assert_eq!(lower_data(&ctx), lower_data(&ctx));
    }

    #[test]
    fn globals_split_by_writability_and_zero_fill() {
        let globals = [
            GlobalDecl {
                name: "ro".into(),
                size: 6,
                align: 2,
                read_only: true,
                init: vec![0xaa, 0xbb],
            },
            GlobalDecl {
                name: "rw".into(),
                size: 4,
                align: 4,
                read_only: false,
                init: vec![],
            },
        ];
        let ctx = CompilationContext::new(TargetConfig::default(), &globals);
        let sections = lower_data(&ctx);
        assert_eq!(sections.rodata.symbols[0].name, "ro");
        assert_eq!(sections.rodata.bytes, vec![0xaa, 0xbb, 0, 0, 0, 0]);
        assert_eq!(sections.data.symbols[0].name, "rw");
        assert_eq!(sections.data.bytes, vec![0, 0, 0, 0]);
        assert!(sections.pool.is_empty());
    }

    #[test]
    fn header_carries_arch_tag_and_symbol_attributes() {
        let globals = [GlobalDecl {
            name: "table".into(),
            size: 4,
            align: 4,
            read_only: false,
            init: vec![],
        }];
        let ctx = ctx_with_pool(&globals);
        let header = lower_header(&ctx, &["main".into()]);
        assert_eq!(header.arch_tag, "x86-sse2");
        assert_eq!(header.symbols[0].kind, SymbolKind::Function);
        assert!(!header.symbols[0].local);
        // Pool entries are unit-local.
        assert!(header.symbols.iter().any(|s| s.local));

        let ext = CompilationContext::new(
            TargetConfig {
                instruction_set: InstructionSet::Sse41,
            },
            &globals,
        );
        assert_eq!(lower_header(&ext, &[]).arch_tag, "x86-sse4.1");
    }
}
