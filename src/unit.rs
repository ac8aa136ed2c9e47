// This module drives compilation of a whole unit. Functions are independent once the shared
// context exists, so they are distributed across scoped worker threads; the only shared
// mutation is constant-pool registration, which the context synchronizes. Workers take
// functions by stride and report results tagged with the module index, and the merge sorts
// by that index, so the output order (and therefore section layout and symbol order) is the
// module order no matter how the threads interleave. The end of the thread scope is the
// barrier that data and header lowering require: after it, the constant pool can no longer
// grow. Any function failing to compile fails the unit; the reported error is the one from
// the earliest function in module order, again independent of scheduling.

//! Compilation-unit driver: parallel function compilation and merge.

use crate::core::{CompilationContext, CompileError, CompileResult, TargetConfig, UnitStats};
use crate::ir;
use crate::x86::data::{self, DataSections, UnitHeader};
use crate::x86::{compile_function, CompiledFunction};

/// Everything produced for one compilation unit, ready for the object writer.
#[derive(Debug)]
pub struct AssembledUnit {
    /// In module order.
    pub functions: Vec<CompiledFunction>,
    pub sections: DataSections,
    pub header: UnitHeader,
    pub stats: UnitStats,
}

/// Compile a module into an assembled unit using up to `workers` threads.
pub fn compile_unit(
    module: &ir::Module,
    config: TargetConfig,
    workers: usize,
) -> CompileResult<AssembledUnit> {
    module.validate()?;
    let ctx = CompilationContext::new(config, &module.globals);
    let workers = workers.max(1).min(module.functions.len().max(1));

    let mut tagged: Vec<(usize, CompileResult<CompiledFunction>)> = if workers == 1 {
        module
            .functions
            .iter()
            .enumerate()
            .map(|(i, f)| (i, compile_function(f, &ctx)))
            .collect()
    } else {
        compile_parallel(module, &ctx, workers)?
    };
    // The scope above has joined: the pool is complete from here on.

    tagged.sort_by_key(|&(i, _)| i);
    let mut functions = Vec::with_capacity(tagged.len());
    for (_, result) in tagged {
        functions.push(result?);
    }

    let sections = data::lower_data(&ctx);
    let names: Vec<String> = functions.iter().map(|f| f.name.clone()).collect();
    let header = data::lower_header(&ctx, &names);
    let stats = ctx.stats();
    log::info!("unit compiled ({}): {stats}", header.arch_tag);

    Ok(AssembledUnit {
        functions,
        sections,
        header,
        stats,
    })
}

fn compile_parallel(
    module: &ir::Module,
    ctx: &CompilationContext<'_>,
    workers: usize,
) -> CompileResult<Vec<(usize, CompileResult<CompiledFunction>)>> {
    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers);
        for w in 0..workers {
            let funcs = &module.functions;
            handles.push(scope.spawn(move || {
                let mut out = Vec::new();
                let mut i = w;
                while i < funcs.len() {
                    out.push((i, compile_function(&funcs[i], ctx)));
                    i += workers;
                }
                out
            }));
        }
        let mut all = Vec::with_capacity(module.functions.len());
        for handle in handles {
            let part = handle
                .join()
                .map_err(|_| CompileError::Internal("worker thread panicked".into()))?;
            all.extend(part);
        }
        Ok(all)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Function, GlobalDecl, InstKind, Module, Operand, Type};

    fn ret_const(name: &str, value: i64) -> Function {
        let mut f = Function::new(name, vec![], Some(Type::I32));
        let b = f.add_block("entry");
        f.push_void(
            b,
            InstKind::Ret {
                value: Some(Operand::ConstInt(value)),
            },
        );
        f
    }

    fn fp_const(name: &str, bits: u64) -> Function {
        let mut f = Function::new(name, vec![], Some(Type::F64));
        let b = f.add_block("entry");
        f.push_void(
            b,
            InstKind::Ret {
                value: Some(Operand::ConstF64(bits)),
            },
        );
        f
    }

    fn module() -> Module {
        Module {
            functions: vec![
                ret_const("a", 1),
                fp_const("b", 0x3ff0000000000000),
                ret_const("c", 3),
                fp_const("d", 0x3ff0000000000000),
            ],
            globals: vec![GlobalDecl {
                name: "g".into(),
                size: 8,
                align: 4,
                read_only: false,
                init: vec![],
            }],
        }
    }

    #[test]
    fn merge_preserves_module_order() {
        let unit = compile_unit(&module(), TargetConfig::default(), 3).unwrap();
        let names: Vec<&str> = unit.functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn parallel_and_sequential_output_match() {
        let seq = compile_unit(&module(), TargetConfig::default(), 1).unwrap();
        let par = compile_unit(&module(), TargetConfig::default(), 4).unwrap();
        for (a, b) in seq.functions.iter().zip(par.functions.iter()) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.code, b.code);
            assert_eq!(a.relocs, b.relocs);
        }
        assert_eq!(seq.sections, par.sections);
        assert_eq!(seq.header, par.header);
    }

    #[test]
    fn shared_fp_literal_is_pooled_once() {
        let unit = compile_unit(&module(), TargetConfig::default(), 2).unwrap();
        assert_eq!(unit.sections.pool.symbols.len(), 1);
        assert_eq!(unit.sections.pool.symbols[0].size, 8);
    }

    #[test]
    fn invalid_function_fails_the_unit() {
        let mut m = module();
        m.functions.push(Function::new("empty", vec![], None));
        let err = compile_unit(&m, TargetConfig::default(), 2).unwrap_err();
        assert!(matches!(err, CompileError::InvalidGraph { .. }));
    }

    #[test]
    fn stats_cover_every_function() {
        let unit = compile_unit(&module(), TargetConfig::default(), 2).unwrap();
        assert_eq!(unit.stats.functions_lowered, 4);
        assert!(unit.stats.code_bytes > 0);
    }
}
