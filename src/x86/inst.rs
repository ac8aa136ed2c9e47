// This module defines the target-instruction form produced by the lowering engine and
// consumed by the register allocator, the addressing-mode resolver, and the encoder.
// MachineInst is an opcode tag plus an ordered operand list (destination first), an operand
// size class (which selects encoding width and prefix bytes), and an explicit liveness
// summary: defined vregs, used vregs, and the physical registers the instruction implicitly
// clobbers (calls clobber the caller-saved set, division clobbers EAX/EDX). Operands form a
// tagged union over virtual registers, physical registers, stack slots, immediates, and
// memory references; a memory reference's base and index must be rewritten to physical
// registers before encoding, and its scale is restricted to 1, 2, 4 or 8. Instructions are
// immutable once emitted except for the in-place operand rewriting done by allocation and
// addressing-mode resolution; folded-away instructions become Nop and are skipped by the
// encoder.

//! Target instruction form for x86-32.

use crate::core::PoolConstant;
use crate::ir::BlockId;
use crate::x86::regs::{Reg, RegClass, RegSet};
use std::fmt;

/// A symbolic variable created during lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(pub u32);

/// A stack slot assigned by the allocator or frame builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackSlot(pub u32);

/// Storage assigned to a variable once allocation completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Reg(Reg),
    Slot(StackSlot),
}

/// Per-variable allocation state.
#[derive(Debug, Clone)]
pub struct VarInfo {
    pub class: RegClass,
    /// Calling-convention or encoding-mandated register, if any. The
    /// allocator pins these before the greedy scan.
    pub fixed: Option<Reg>,
    /// `None` until the allocator finalizes the variable.
    pub storage: Option<Storage>,
}

impl VarInfo {
    pub fn new(class: RegClass) -> Self {
        VarInfo { class, fixed: None, storage: None }
    }

    pub fn fixed(class: RegClass, reg: Reg) -> Self {
        VarInfo { class, fixed: Some(reg), storage: None }
    }
}

/// Symbol referenced by a memory operand or call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymTarget {
    Global(String),
    Pool(PoolConstant),
}

impl SymTarget {
    pub fn name(&self) -> String {
        match self {
            SymTarget::Global(name) => name.clone(),
            SymTarget::Pool(c) => c.symbol(),
        }
    }
}

/// A register position inside a memory reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrReg {
    Virt(VReg),
    Phys(Reg),
}

/// Memory reference: base + index*scale + displacement (+ symbol).
#[derive(Debug, Clone, PartialEq)]
pub struct Address {
    pub base: Option<AddrReg>,
    pub index: Option<(AddrReg, u8)>,
    pub disp: i32,
    pub sym: Option<SymTarget>,
}

impl Address {
    pub fn base(base: AddrReg) -> Self {
        Address { base: Some(base), index: None, disp: 0, sym: None }
    }

    pub fn base_disp(base: AddrReg, disp: i32) -> Self {
        Address { base: Some(base), index: None, disp, sym: None }
    }

    pub fn sym(sym: SymTarget, disp: i32) -> Self {
        Address { base: None, index: None, disp, sym: Some(sym) }
    }

    /// Whether base and index are resolved to physical registers.
    pub fn is_resolved(&self) -> bool {
        !matches!(self.base, Some(AddrReg::Virt(_)))
            && !matches!(self.index, Some((AddrReg::Virt(_), _)))
    }
}

/// Instruction operand. Destination comes first in the operand list.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Virt(VReg),
    Phys(Reg),
    Slot(StackSlot),
    Imm(i32),
    Mem(Address),
}

/// Operand size class; selects encoding width and prefix bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpSize {
    B,
    W,
    D,
}

impl OpSize {
    pub fn bytes(self) -> u32 {
        match self {
            OpSize::B => 1,
            OpSize::W => 2,
            OpSize::D => 4,
        }
    }
}

/// Condition codes for jcc/setcc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    E,
    Ne,
    L,
    Le,
    G,
    Ge,
    B,
    Be,
    A,
    Ae,
    P,
    Np,
}

/// Opcode tags. Operand shapes are carried by the operand list; the encoder
/// maps each (opcode, shape, size) combination to exactly one encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Folded away; skipped by the encoder.
    Nop,
    Mov,
    Movzx { from: OpSize },
    Movsx { from: OpSize },
    Lea,
    Add,
    Sub,
    And,
    Or,
    Xor,
    Neg,
    Not,
    Imul,
    Cmp,
    Test,
    /// Shift count is operand 1: either an immediate or CL.
    Shl,
    Shr,
    Sar,
    Cdq,
    Idiv,
    Div,
    Push,
    Pop,
    Call { callee: String },
    Ret,
    Jmp { target: BlockId },
    Jcc { cc: Cond, target: BlockId },
    Setcc { cc: Cond },
    // Scalar SSE.
    Movss,
    Movsd,
    /// GPR <-> XMM move; direction follows the operand shapes.
    Movd,
    Addss,
    Addsd,
    Subss,
    Subsd,
    Mulss,
    Mulsd,
    Divss,
    Divsd,
    Ucomiss,
    Ucomisd,
    /// Vectorized compare with predicate immediate (extended variant only).
    Cmpss { pred: u8 },
    Cmpsd { pred: u8 },
    Cvtsi2ss,
    Cvtsi2sd,
    Cvttss2si,
    Cvttsd2si,
    Cvtss2sd,
    Cvtsd2ss,
    Xorps,
}

/// A lowered target instruction with its liveness summary.
#[derive(Debug, Clone)]
pub struct MachineInst {
    pub op: Op,
    pub size: OpSize,
    pub operands: Vec<Operand>,
    pub defs: Vec<VReg>,
    pub uses: Vec<VReg>,
    /// Physical registers implicitly written, beyond the operand list.
    pub clobbers: RegSet,
}

impl MachineInst {
    pub fn new(op: Op, size: OpSize, operands: Vec<Operand>) -> Self {
        MachineInst {
            op,
            size,
            operands,
            defs: Vec::new(),
            uses: Vec::new(),
            clobbers: RegSet::empty(),
        }
    }

    pub fn nop() -> Self {
        MachineInst::new(Op::Nop, OpSize::D, Vec::new())
    }

    pub fn with_defs(mut self, defs: &[VReg]) -> Self {
        self.defs.extend_from_slice(defs);
        self
    }

    pub fn with_uses(mut self, uses: &[VReg]) -> Self {
        self.uses.extend_from_slice(uses);
        self
    }

    pub fn with_clobbers(mut self, clobbers: RegSet) -> Self {
        self.clobbers = clobbers;
        self
    }

    pub fn is_nop(&self) -> bool {
        matches!(self.op, Op::Nop)
    }

    /// Rewrite every reference to `v` with the given storage, including
    /// memory-operand base/index positions (registers only there; slot-based
    /// bases are materialized by the addressing resolver, not here).
    pub fn rewrite_vreg(&mut self, v: VReg, storage: Storage) {
        for operand in &mut self.operands {
            match operand {
                Operand::Virt(x) if *x == v => {
                    *operand = match storage {
                        Storage::Reg(r) => Operand::Phys(r),
                        Storage::Slot(s) => Operand::Slot(s),
                    };
                }
                Operand::Mem(addr) => {
                    if let Storage::Reg(r) = storage {
                        if addr.base == Some(AddrReg::Virt(v)) {
                            addr.base = Some(AddrReg::Phys(r));
                        }
                        if let Some((AddrReg::Virt(x), scale)) = addr.index {
                            if x == v {
                                addr.index = Some((AddrReg::Phys(r), scale));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Substitute one virtual register for another, in operands (including
    /// memory base/index positions) and in the liveness summary. Used when
    /// spill code splits a variable into short-lived fragments.
    pub fn replace_vreg(&mut self, from: VReg, to: VReg) {
        for operand in &mut self.operands {
            match operand {
                Operand::Virt(x) if *x == from => *x = to,
                Operand::Mem(addr) => {
                    if addr.base == Some(AddrReg::Virt(from)) {
                        addr.base = Some(AddrReg::Virt(to));
                    }
                    if let Some((AddrReg::Virt(x), scale)) = addr.index {
                        if x == from {
                            addr.index = Some((AddrReg::Virt(to), scale));
                        }
                    }
                }
                _ => {}
            }
        }
        for v in self.defs.iter_mut().chain(self.uses.iter_mut()) {
            if *v == from {
                *v = to;
            }
        }
    }

    /// Virtual registers referenced from memory operands.
    pub fn mem_vregs(&self) -> Vec<VReg> {
        let mut out = Vec::new();
        for operand in &self.operands {
            if let Operand::Mem(addr) = operand {
                if let Some(AddrReg::Virt(v)) = addr.base {
                    out.push(v);
                }
                if let Some((AddrReg::Virt(v), _)) = addr.index {
                    out.push(v);
                }
            }
        }
        out
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Virt(v) => write!(f, "v{}", v.0),
            Operand::Phys(r) => write!(f, "{r}"),
            Operand::Slot(s) => write!(f, "slot{}", s.0),
            Operand::Imm(i) => write!(f, "{i}"),
            Operand::Mem(a) => {
                write!(f, "[")?;
                let mut sep = "";
                if let Some(sym) = &a.sym {
                    write!(f, "{}", sym.name())?;
                    sep = "+";
                }
                match a.base {
                    Some(AddrReg::Phys(r)) => {
                        write!(f, "{sep}{r}")?;
                        sep = "+";
                    }
                    Some(AddrReg::Virt(v)) => {
                        write!(f, "{sep}v{}", v.0)?;
                        sep = "+";
                    }
                    None => {}
                }
                if let Some((idx, scale)) = &a.index {
                    match idx {
                        AddrReg::Phys(r) => write!(f, "{sep}{r}*{scale}")?,
                        AddrReg::Virt(v) => write!(f, "{sep}v{}*{scale}", v.0)?,
                    }
                    sep = "+";
                }
                if a.disp != 0 || (a.base.is_none() && a.index.is_none() && a.sym.is_none()) {
                    if a.disp >= 0 && sep == "+" {
                        write!(f, "+{}", a.disp)?;
                    } else {
                        write!(f, "{}", a.disp)?;
                    }
                }
                write!(f, "]")
            }
        }
    }
}

/// Writes `op operand, operand, ...` in Intel-ish syntax; used by logging
/// and by the lowering tests that assert on selected shapes.
impl fmt::Display for MachineInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let name: String = match &self.op {
                Op::Nop => "nop".into(),
                Op::Mov => "mov".into(),
                Op::Movzx { .. } => "movzx".into(),
                Op::Movsx { .. } => "movsx".into(),
                Op::Lea => "lea".into(),
                Op::Add => "add".into(),
                Op::Sub => "sub".into(),
                Op::And => "and".into(),
                Op::Or => "or".into(),
                Op::Xor => "xor".into(),
                Op::Neg => "neg".into(),
                Op::Not => "not".into(),
                Op::Imul => "imul".into(),
                Op::Cmp => "cmp".into(),
                Op::Test => "test".into(),
                Op::Shl => "shl".into(),
                Op::Shr => "shr".into(),
                Op::Sar => "sar".into(),
                Op::Cdq => "cdq".into(),
                Op::Idiv => "idiv".into(),
                Op::Div => "div".into(),
                Op::Push => "push".into(),
                Op::Pop => "pop".into(),
                Op::Call { callee } => format!("call {callee}"),
                Op::Ret => "ret".into(),
                Op::Jmp { target } => format!("jmp .b{}", target.0),
                Op::Jcc { cc, target } => format!("j{} .b{}", cc_name(*cc), target.0),
                Op::Setcc { cc } => format!("set{}", cc_name(*cc)),
                Op::Movss => "movss".into(),
                Op::Movsd => "movsd".into(),
                Op::Movd => "movd".into(),
                Op::Addss => "addss".into(),
                Op::Addsd => "addsd".into(),
                Op::Subss => "subss".into(),
                Op::Subsd => "subsd".into(),
                Op::Mulss => "mulss".into(),
                Op::Mulsd => "mulsd".into(),
                Op::Divss => "divss".into(),
                Op::Divsd => "divsd".into(),
                Op::Ucomiss => "ucomiss".into(),
                Op::Ucomisd => "ucomisd".into(),
                Op::Cmpss { pred } => format!("cmpss.{pred}"),
                Op::Cmpsd { pred } => format!("cmpsd.{pred}"),
                Op::Cvtsi2ss => "cvtsi2ss".into(),
                Op::Cvtsi2sd => "cvtsi2sd".into(),
                Op::Cvttss2si => "cvttss2si".into(),
                Op::Cvttsd2si => "cvttsd2si".into(),
                Op::Cvtss2sd => "cvtss2sd".into(),
                Op::Cvtsd2ss => "cvtsd2ss".into(),
                Op::Xorps => "xorps".into(),
            };
            write!(f, "{name}")?;
            for (i, operand) in self.operands.iter().enumerate() {
                if i == 0 {
                    write!(f, " {operand}")?;
                } else {
                    write!(f, ", {operand}")?;
                }
            }
            Ok(())
    }
}

fn cc_name(cc: Cond) -> &'static str {
    match cc {
        Cond::E => "e",
        Cond::Ne => "ne",
        Cond::L => "l",
        Cond::Le => "le",
        Cond::G => "g",
        Cond::Ge => "ge",
        Cond::B => "b",
        Cond::Be => "be",
        Cond::A => "a",
        Cond::Ae => "ae",
        Cond::P => "p",
        Cond::Np => "np",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_replaces_value_and_address_positions() {
        let v = VReg(3);
        let mut inst = MachineInst::new(
            Op::Mov,
            OpSize::D,
            vec![
                Operand::Virt(v),
                Operand::Mem(Address {
                    base: Some(AddrReg::Virt(v)),
                    index: Some((AddrReg::Virt(v), 4)),
                    disp: 8,
                    sym: None,
                }),
            ],
        );
        inst.rewrite_vreg(v, Storage::Reg(Reg::Esi));
        assert_eq!(inst.operands[0], Operand::Phys(Reg::Esi));
        match &inst.operands[1] {
            Operand::Mem(a) => {
                assert_eq!(a.base, Some(AddrReg::Phys(Reg::Esi)));
                assert_eq!(a.index, Some((AddrReg::Phys(Reg::Esi), 4)));
            }
            other => panic!("unexpected operand {other:?}"),
        }
    }

    #[test]
    fn mem_vregs_reports_unresolved_parts() {
        let inst = MachineInst::new(
            Op::Mov,
            OpSize::D,
            vec![
                Operand::Phys(Reg::Eax),
                Operand::Mem(Address {
                    base: Some(AddrReg::Virt(VReg(1))),
                    index: Some((AddrReg::Virt(VReg(2)), 2)),
                    disp: 0,
                    sym: None,
                }),
            ],
        );
        assert_eq!(inst.mem_vregs(), vec![VReg(1), VReg(2)]);
    }

    #[test]
    fn display_is_readable() {
        let inst = MachineInst::new(
            Op::Mov,
            OpSize::D,
            vec![Operand::Phys(Reg::Eax), Operand::Imm(42)],
        );
        assert_eq!(inst.to_string(), "mov eax, 42");
    }
}
