// This module defines the machine-independent IR consumed by the backend: a Module holding
// an ordered list of Functions plus the compilation unit's GlobalDecl list. A Function is a
// control-flow graph of Blocks, each holding an ordered sequence of Insts; edges are implicit
// in block terminators (br/condbr/ret). Values are SSA-like: each ValueId is defined exactly
// once, by a function parameter or by an instruction's destination, and carries a Type.
// Address expressions (base + optional index*scale + displacement + optional symbol) appear
// directly on loads and stores so the addressing-mode resolver can fold them. The module is
// read-only from the backend's perspective; validate() checks the structural invariants the
// lowering engine relies on (single entry, reachability, terminator placement, def-before-use
// in block order).

//! Input IR data model.
//!
//! The upstream optimizer/IR builder supplies one [`Module`] per compilation
//! unit. The backend treats it as an opaque but well-defined input: it never
//! mutates the graph, only walks it block by block during lowering.

use crate::core::{CompileError, CompileResult};
use std::fmt;

/// Value types understood by the target lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    I1,
    I8,
    I16,
    I32,
    F32,
    F64,
}

impl Type {
    /// Size of the type in bytes.
    pub fn size(self) -> u32 {
        match self {
            Type::I1 | Type::I8 => 1,
            Type::I16 => 2,
            Type::I32 | Type::F32 => 4,
            Type::F64 => 8,
        }
    }

    /// Whether this is a floating-point type.
    pub fn is_fp(self) -> bool {
        matches!(self, Type::F32 | Type::F64)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Type::I1 => "i1",
            Type::I8 => "i8",
            Type::I16 => "i16",
            Type::I32 => "i32",
            Type::F32 => "f32",
            Type::F64 => "f64",
        };
        f.write_str(s)
    }
}

/// Identity of an IR value within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

/// Identity of a basic block within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

/// An instruction operand: a value reference or an inline constant.
///
/// Floating-point constants are kept as bit patterns so that equality is
/// exact-bit-pattern equality, which is also the constant pool's dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Value(ValueId),
    ConstInt(i64),
    /// f32 constant as raw bits.
    ConstF32(u32),
    /// f64 constant as raw bits.
    ConstF64(u64),
}

/// Integer comparison predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntCond {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

/// Ordered floating-point comparison predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpCond {
    Oeq,
    One,
    Olt,
    Ole,
    Ogt,
    Oge,
    Une,
}

/// Two-operand arithmetic operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Lshr,
    Ashr,
    Sdiv,
    Udiv,
    Srem,
    Urem,
    Fadd,
    Fsub,
    Fmul,
    Fdiv,
}

/// Value conversions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastOp {
    Sext,
    Zext,
    Trunc,
    Sitofp,
    Fptosi,
    Fpext,
    Fptrunc,
}

/// A memory address expression as produced by the IR builder.
///
/// The addressing-mode resolver folds these (plus any feeding constant
/// arithmetic) into legal x86 memory operands. Scale is restricted to
/// {1, 2, 4, 8}; this is validated, not assumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrExpr {
    pub base: Option<Operand>,
    pub index: Option<(Operand, u8)>,
    pub offset: i32,
    /// Global symbol this address is relative to, if any.
    pub sym: Option<String>,
}

impl AddrExpr {
    /// Address of a global symbol plus a constant offset.
    pub fn sym(name: impl Into<String>, offset: i32) -> Self {
        AddrExpr {
            base: None,
            index: None,
            offset,
            sym: Some(name.into()),
        }
    }

    /// Plain base-register address.
    pub fn base(base: Operand) -> Self {
        AddrExpr {
            base: Some(base),
            index: None,
            offset: 0,
            sym: None,
        }
    }
}

/// IR instruction payload.
#[derive(Debug, Clone, PartialEq)]
pub enum InstKind {
    /// Binary arithmetic on `ty` operands.
    Arith {
        op: ArithOp,
        ty: Type,
        a: Operand,
        b: Operand,
    },
    /// Integer compare producing an i1.
    Icmp {
        cond: IntCond,
        ty: Type,
        a: Operand,
        b: Operand,
    },
    /// Floating-point compare producing an i1.
    Fcmp {
        cond: FpCond,
        ty: Type,
        a: Operand,
        b: Operand,
    },
    /// Load `ty` from memory.
    Load { ty: Type, addr: AddrExpr },
    /// Store `ty` value to memory.
    Store {
        ty: Type,
        value: Operand,
        addr: AddrExpr,
    },
    /// Materialize a constant or copy a value.
    Copy { ty: Type, src: Operand },
    /// Value conversion.
    Cast {
        op: CastOp,
        from: Type,
        to: Type,
        src: Operand,
    },
    /// Direct call. Arguments are passed per the target calling convention.
    Call {
        callee: String,
        args: Vec<(Type, Operand)>,
        ret: Option<Type>,
    },
    /// Unconditional branch terminator.
    Br { target: BlockId },
    /// Conditional branch terminator; `cond` must be an i1.
    CondBr {
        cond: Operand,
        then_blk: BlockId,
        else_blk: BlockId,
    },
    /// Return terminator.
    Ret { value: Option<Operand> },
}

impl InstKind {
    /// Whether this instruction ends its block.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Br { .. } | InstKind::CondBr { .. } | InstKind::Ret { .. }
        )
    }

    /// Short mnemonic used in diagnostics.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            InstKind::Arith { op, .. } => match op {
                ArithOp::Add => "add",
                ArithOp::Sub => "sub",
                ArithOp::Mul => "mul",
                ArithOp::And => "and",
                ArithOp::Or => "or",
                ArithOp::Xor => "xor",
                ArithOp::Shl => "shl",
                ArithOp::Lshr => "lshr",
                ArithOp::Ashr => "ashr",
                ArithOp::Sdiv => "sdiv",
                ArithOp::Udiv => "udiv",
                ArithOp::Srem => "srem",
                ArithOp::Urem => "urem",
                ArithOp::Fadd => "fadd",
                ArithOp::Fsub => "fsub",
                ArithOp::Fmul => "fmul",
                ArithOp::Fdiv => "fdiv",
            },
            InstKind::Icmp { .. } => "icmp",
            InstKind::Fcmp { .. } => "fcmp",
            InstKind::Load { .. } => "load",
            InstKind::Store { .. } => "store",
            InstKind::Copy { .. } => "copy",
            InstKind::Cast { .. } => "cast",
            InstKind::Call { .. } => "call",
            InstKind::Br { .. } => "br",
            InstKind::CondBr { .. } => "condbr",
            InstKind::Ret { .. } => "ret",
        }
    }
}

/// An IR instruction: optional destination value plus payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub dest: Option<ValueId>,
    pub kind: InstKind,
}

/// A basic block: ordered instruction sequence ending in a terminator.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub name: String,
    pub insts: Vec<Inst>,
}

/// A function graph. Block 0 is the entry block.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<Type>,
    pub ret: Option<Type>,
    pub blocks: Vec<Block>,
    /// Type of every value; indices 0..params.len() are the parameters.
    pub value_types: Vec<Type>,
}

impl Function {
    /// Create an empty function; parameters become values 0..params.len().
    pub fn new(name: impl Into<String>, params: Vec<Type>, ret: Option<Type>) -> Self {
        let value_types = params.clone();
        Function {
            name: name.into(),
            params,
            ret,
            blocks: Vec::new(),
            value_types,
        }
    }

    /// Append an empty block, returning its id.
    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        self.blocks.push(Block {
            name: name.into(),
            insts: Vec::new(),
        });
        BlockId(self.blocks.len() as u32 - 1)
    }

    /// Allocate a fresh value of the given type.
    pub fn new_value(&mut self, ty: Type) -> ValueId {
        self.value_types.push(ty);
        ValueId(self.value_types.len() as u32 - 1)
    }

    /// Append an instruction with a destination to `block`.
    pub fn push(&mut self, block: BlockId, ty: Type, kind: InstKind) -> ValueId {
        let dest = self.new_value(ty);
        self.blocks[block.0 as usize].insts.push(Inst {
            dest: Some(dest),
            kind,
        });
        dest
    }

    /// Append an instruction with no destination to `block`.
    pub fn push_void(&mut self, block: BlockId, kind: InstKind) {
        self.blocks[block.0 as usize].insts.push(Inst { dest: None, kind });
    }

    /// Type of a value.
    pub fn value_type(&self, v: ValueId) -> Type {
        self.value_types[v.0 as usize]
    }

    /// Successor blocks of `block`, derived from its terminator.
    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        match self.blocks[block.0 as usize].insts.last() {
            Some(Inst {
                kind: InstKind::Br { target },
                ..
            }) => vec![*target],
            Some(Inst {
                kind:
                    InstKind::CondBr {
                        then_blk, else_blk, ..
                    },
                ..
            }) => vec![*then_blk, *else_blk],
            _ => Vec::new(),
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> CompileError {
        CompileError::InvalidGraph {
            function: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Check the structural invariants the lowering engine relies on.
    pub fn validate(&self) -> CompileResult<()> {
        if self.blocks.is_empty() {
            return Err(self.invalid("no entry block"));
        }
        for (bi, block) in self.blocks.iter().enumerate() {
            let Some(last) = block.insts.last() else {
                return Err(self.invalid(format!("block {bi} is empty")));
            };
            if !last.kind.is_terminator() {
                return Err(self.invalid(format!("block {bi} does not end in a terminator")));
            }
            for inst in &block.insts[..block.insts.len() - 1] {
                if inst.kind.is_terminator() {
                    return Err(self.invalid(format!(
                        "terminator before end of block {bi}"
                    )));
                }
            }
            for target in self.successors(BlockId(bi as u32)) {
                if target.0 as usize >= self.blocks.len() {
                    return Err(self.invalid(format!("branch to unknown block {}", target.0)));
                }
            }
        }
        // Every block except the entry must be reachable.
        let mut seen = vec![false; self.blocks.len()];
        let mut work = vec![BlockId(0)];
        seen[0] = true;
        while let Some(b) = work.pop() {
            for s in self.successors(b) {
                if !seen[s.0 as usize] {
                    seen[s.0 as usize] = true;
                    work.push(s);
                }
            }
        }
        if let Some(bi) = seen.iter().position(|s| !s) {
            return Err(self.invalid(format!("block {bi} is unreachable")));
        }
        Ok(())
    }
}

/// A named, optionally initialized block of global data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalDecl {
    pub name: String,
    pub size: u32,
    pub align: u32,
    /// Read-only globals land in the read-only section, the rest in the
    /// read-write section.
    pub read_only: bool,
    /// Initializer bytes; shorter than `size` means zero-filled tail.
    pub init: Vec<u8>,
}

/// A compilation unit: functions plus the global declaration list.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub functions: Vec<Function>,
    pub globals: Vec<GlobalDecl>,
}

impl Module {
    pub fn validate(&self) -> CompileResult<()> {
        for f in &self.functions {
            f.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ret_zero() -> Function {
        let mut f = Function::new("f", vec![], Some(Type::I32));
        let b = f.add_block("entry");
        f.push_void(
            b,
            InstKind::Ret {
                value: Some(Operand::ConstInt(0)),
            },
        );
        f
    }

    #[test]
    fn validate_accepts_minimal_function() {
        assert!(ret_zero().validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_terminator() {
        let mut f = Function::new("f", vec![], None);
        let b = f.add_block("entry");
        f.push(
            b,
            Type::I32,
            InstKind::Copy {
                ty: Type::I32,
                src: Operand::ConstInt(1),
            },
        );
        assert!(matches!(
            f.validate(),
            Err(CompileError::InvalidGraph { .. })
        ));
    }

    #[test]
    fn validate_rejects_unreachable_block() {
        let mut f = ret_zero();
        let dead = f.add_block("dead");
        f.push_void(dead, InstKind::Ret { value: None });
        let err = f.validate().unwrap_err();
        assert!(err.to_string().contains("unreachable"));
    }

    #[test]
    fn validate_rejects_mid_block_terminator() {
        let mut f = Function::new("f", vec![], None);
        let b = f.add_block("entry");
        f.push_void(b, InstKind::Ret { value: None });
        f.push_void(b, InstKind::Ret { value: None });
        assert!(f.validate().is_err());
    }

    #[test]
    fn successors_follow_terminators() {
        let mut f = Function::new("f", vec![Type::I32], Some(Type::I32));
        let entry = f.add_block("entry");
        let then_blk = f.add_block("then");
        let else_blk = f.add_block("else");
        let c = f.push(
            entry,
            Type::I1,
            InstKind::Icmp {
                cond: IntCond::Eq,
                ty: Type::I32,
                a: Operand::Value(ValueId(0)),
                b: Operand::ConstInt(0),
            },
        );
        f.push_void(
            entry,
            InstKind::CondBr {
                cond: Operand::Value(c),
                then_blk,
                else_blk,
            },
        );
        f.push_void(then_blk, InstKind::Ret { value: Some(Operand::ConstInt(1)) });
        f.push_void(else_blk, InstKind::Ret { value: Some(Operand::ConstInt(2)) });
        assert_eq!(f.successors(entry), vec![then_blk, else_blk]);
        assert!(f.validate().is_ok());
    }
}
