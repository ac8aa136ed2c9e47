// This module writes an assembled unit into a relocatable ELF object for 32-bit x86. Code
// goes into .text with one function symbol each, globals into .rodata/.data, and the
// constant pool into its own mergeable read-only section with unit-local symbols. Code
// relocations are emitted against symbol names: PC-relative for calls (the rel32 field
// already holds the -4 addend) and absolute for memory references to data or pool symbols.
// Section layout follows the order produced by the unit driver, so the written object is
// byte-for-byte reproducible for the same input module.

//! ELF object emission.

use crate::core::{CompileError, CompileResult};
use crate::unit::AssembledUnit;
use crate::x86::data::{SectionData, SymbolKind};
use crate::x86::RelocKind;
use hashbrown::HashMap;
use object::write::{Object, Relocation, StandardSection, StandardSegment, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind,
    SectionKind, SymbolFlags, SymbolScope,
};

fn obj_err(e: object::write::Error) -> CompileError {
    CompileError::Internal(format!("object write: {e}"))
}

/// Write an assembled unit as a relocatable ELF object.
pub fn write_object(unit: &AssembledUnit) -> CompileResult<Vec<u8>> {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::I386, Endianness::Little);

    // Unit-local symbols per the header's attribute list.
    let local: HashMap<&str, bool> = unit
        .header
        .symbols
        .iter()
        .map(|s| (s.name.as_str(), s.local))
        .collect();
    let scope_for = |name: &str| {
        if local.get(name).copied().unwrap_or(false) {
            SymbolScope::Compilation
        } else {
            SymbolScope::Dynamic
        }
    };

    let mut symbol_ids: HashMap<String, object::write::SymbolId> = HashMap::new();

    // Data sections first so code relocations can name their symbols.
    let mut add_data = |obj: &mut Object,
                        symbol_ids: &mut HashMap<String, object::write::SymbolId>,
                        section: object::write::SectionId,
                        data: &SectionData| {
        if data.is_empty() {
            return;
        }
        let base = obj.append_section_data(section, &data.bytes, data.align.max(1) as u64);
        for sym in &data.symbols {
            let id = obj.add_symbol(Symbol {
                name: sym.name.clone().into_bytes(),
                value: base + sym.offset as u64,
                size: sym.size as u64,
                kind: object::SymbolKind::Data,
                scope: scope_for(&sym.name),
                weak: false,
                section: SymbolSection::Section(section),
                flags: SymbolFlags::None,
            });
            symbol_ids.insert(sym.name.clone(), id);
        }
    };

    let rodata = obj.section_id(StandardSection::ReadOnlyData);
    add_data(&mut obj, &mut symbol_ids, rodata, &unit.sections.rodata);
    let data = obj.section_id(StandardSection::Data);
    add_data(&mut obj, &mut symbol_ids, data, &unit.sections.data);
    if !unit.sections.pool.is_empty() {
        let pool = obj.add_section(
            obj.segment_name(StandardSegment::Data).to_vec(),
            b".rodata.cst".to_vec(),
            SectionKind::ReadOnlyData,
        );
        add_data(&mut obj, &mut symbol_ids, pool, &unit.sections.pool);
    }

    // Code, then relocations once every defined symbol has an id.
    let text = obj.section_id(StandardSection::Text);
    let mut pending: Vec<(u64, &crate::x86::Reloc)> = Vec::new();
    for func in &unit.functions {
        let base = obj.append_section_data(text, &func.code, 16);
        let id = obj.add_symbol(Symbol {
            name: func.name.clone().into_bytes(),
            value: base,
            size: func.code.len() as u64,
            kind: object::SymbolKind::Text,
            scope: scope_for(&func.name),
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        symbol_ids.insert(func.name.clone(), id);
        for reloc in &func.relocs {
            pending.push((base + reloc.offset as u64, reloc));
        }
    }

    for (offset, reloc) in pending {
        let symbol = match symbol_ids.get(&reloc.symbol) {
            Some(&id) => id,
            None => {
                // External reference: undefined until link time.
                let id = obj.add_symbol(Symbol {
                    name: reloc.symbol.clone().into_bytes(),
                    value: 0,
                    size: 0,
                    kind: object::SymbolKind::Unknown,
                    scope: SymbolScope::Dynamic,
                    weak: false,
                    section: SymbolSection::Undefined,
                    flags: SymbolFlags::None,
                });
                symbol_ids.insert(reloc.symbol.clone(), id);
                id
            }
        };
        let kind = match reloc.kind {
            RelocKind::Abs32 => RelocationKind::Absolute,
            RelocKind::Pc32 => RelocationKind::Relative,
        };
        obj.add_relocation(
            text,
            Relocation {
                offset,
                symbol,
                addend: reloc.addend,
                flags: RelocationFlags::Generic {
                    kind,
                    encoding: RelocationEncoding::Generic,
                    size: 32,
                },
            },
        )
        .map_err(obj_err)?;
    }

    // Instruction-set tag, readable with `readelf -p .comment`.
    let comment = obj.add_section(Vec::new(), b".comment".to_vec(), SectionKind::Other);
    let mut tag = unit.header.arch_tag.clone().into_bytes();
    tag.push(0);
    obj.append_section_data(comment, &tag, 1);

    // Function/data distinction is already encoded above; assert the header
    // agrees in debug builds.
    debug_assert!(unit
        .header
        .symbols
        .iter()
        .filter(|s| s.kind == SymbolKind::Function)
        .all(|s| unit.functions.iter().any(|f| f.name == s.name)));

    obj.write().map_err(obj_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TargetConfig;
    use crate::ir::{AddrExpr, Function, GlobalDecl, InstKind, Module, Operand, Type};
    use crate::unit::compile_unit;
    use object::read::{Object as _, ObjectSection, ObjectSymbol};

    fn sample_unit() -> AssembledUnit {
        let mut caller = Function::new("caller", vec![], Some(Type::I32));
        let b = caller.add_block("entry");
        let r = caller.push(
            b,
            Type::I32,
            InstKind::Call {
                callee: "external".into(),
                args: vec![(Type::I32, Operand::ConstInt(1))],
                ret: Some(Type::I32),
            },
        );
        caller.push_void(b, InstKind::Ret { value: Some(Operand::Value(r)) });

        let mut loader = Function::new("loader", vec![], Some(Type::F64));
        let lb = loader.add_block("entry");
        let v = loader.push(
            lb,
            Type::F64,
            InstKind::Load {
                ty: Type::F64,
                addr: AddrExpr::sym("table", 0),
            },
        );
        loader.push_void(lb, InstKind::Ret { value: Some(Operand::Value(v)) });

        let module = Module {
            functions: vec![caller, loader],
            globals: vec![GlobalDecl {
                name: "table".into(),
                size: 8,
                align: 8,
                read_only: true,
                init: vec![0; 8],
            }],
        };
        compile_unit(&module, TargetConfig::default(), 1).unwrap()
    }

    #[test]
    fn written_object_parses_back() {
        let bytes = write_object(&sample_unit()).unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        assert_eq!(file.architecture(), Architecture::I386);
        assert!(!file.is_64());

        let names: Vec<String> = file
            .symbols()
            .filter_map(|s| s.name().ok().map(str::to_string))
            .collect();
        assert!(names.iter().any(|n| n == "caller"));
        assert!(names.iter().any(|n| n == "loader"));
        assert!(names.iter().any(|n| n == "table"));
        assert!(names.iter().any(|n| n == "external"));
    }

    #[test]
    fn call_and_data_references_become_relocations() {
        let bytes = write_object(&sample_unit()).unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        let text = file.section_by_name(".text").unwrap();
        let relocs: Vec<_> = text.relocations().collect();
        // One call to `external`, one absolute reference to `table`.
        assert_eq!(relocs.len(), 2);
    }

    #[test]
    fn function_symbols_carry_sizes() {
        let unit = sample_unit();
        let bytes = write_object(&unit).unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        let sym = file
            .symbols()
            .find(|s| s.name() == Ok("caller"))
            .unwrap();
        assert_eq!(sym.size(), unit.functions[0].code.len() as u64);
        assert!(sym.is_definition());
    }

    #[test]
    fn arch_tag_lands_in_the_comment_section() {
        let bytes = write_object(&sample_unit()).unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        let comment = file.section_by_name(".comment").unwrap();
        let data = comment.data().unwrap();
        assert!(data.starts_with(b"x86-sse2"));
    }
}
