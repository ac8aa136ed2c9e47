// This module implements the lowering engine: it walks an IR function graph block by block
// and emits the target-instruction sequence, allocating virtual registers for temporaries,
// pinning calling-convention and encoding-mandated registers (EAX/EDX around division, ECX
// for variable shift counts, EAX/XMM0 for returns), registering constant-pool entries for
// floating-point literals, and recording argument slots for the frame builder. Instruction
// selection that differs between the two instruction-set variants lives behind the IselRules
// trait: Sse2Rules lowers floating-point compares to the legacy compare-then-set sequence
// (ucomiss/ucomisd + setcc with parity fixups), while Sse41Rules emits the single vectorized
// compare (cmpss/cmpsd with a predicate immediate) and extracts the mask. The variant is
// resolved once per compilation unit; an operation with no legal lowering under the active
// variant is a fatal unit-level error. Liveness summaries (defs/uses) are derived from
// operand shapes for regular instructions and written explicitly for instructions with
// implicit register effects.

//! IR-to-x86 lowering engine.

use crate::core::{
    CompilationContext, CompileError, CompileResult, InstructionSet, PoolConstant,
};
use crate::ir::{
    self, AddrExpr, ArithOp, CastOp, FpCond, Inst, InstKind, IntCond, Type, ValueId,
};
use crate::x86::frame::FrameBuilder;
use crate::x86::inst::{
    Address, AddrReg, Cond, MachineInst, Op, OpSize, Operand, SymTarget, VarInfo, VReg,
};
use crate::x86::regs::{Reg, RegClass, RegSet, RET_FP_REG, RET_REG};
use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;
use hashbrown::HashMap;

/// Result of lowering one function: the instruction sequence plus everything
/// the later passes need (variables, frame builder, block boundaries).
#[derive(Debug)]
pub struct Lowered {
    pub name: String,
    pub insts: Vec<MachineInst>,
    /// Instruction index where each block begins.
    pub block_starts: Vec<usize>,
    pub vars: Vec<VarInfo>,
    pub frame: FrameBuilder,
    pub has_call: bool,
    /// Spill count, filled in by the register allocator.
    pub spills: usize,
}

/// Variant-specific instruction-selection rules.
///
/// Exactly one implementation exists per instruction-set variant; the active
/// one is resolved once per compilation unit from the target configuration.
pub trait IselRules: Sync {
    fn instruction_set(&self) -> InstructionSet;

    /// Lower a floating-point compare producing an i1 in `dst`.
    fn lower_fcmp(
        &self,
        lo: &mut FuncLowering<'_>,
        cond: FpCond,
        ty: Type,
        a: VReg,
        b: VReg,
        dst: VReg,
    ) -> CompileResult<()>;
}

/// Baseline rules: SSE2 only.
pub struct Sse2Rules;

/// Extended rules: SSE4.1-level selection (vectorized compares).
pub struct Sse41Rules;

/// Resolve the rules for a variant. Called once per compilation unit.
pub fn isel_rules(set: InstructionSet) -> &'static dyn IselRules {
    match set {
        InstructionSet::Sse2 => &Sse2Rules,
        InstructionSet::Sse41 => &Sse41Rules,
    }
}

/// Lower one function to the target-instruction form.
pub fn lower_function<'a>(
    func: &'a ir::Function,
    ctx: &'a CompilationContext<'_>,
    rules: &dyn IselRules,
    arena: &'a Bump,
) -> CompileResult<Lowered> {
    let mut lo = FuncLowering::new(func, ctx, arena);
    lo.lower_params();
    for (bi, block) in func.blocks.iter().enumerate() {
        lo.block_starts.push(lo.insts.len());
        log::trace!("lowering {}: block {} ({})", func.name, bi, block.name);
        for inst in &block.insts {
            lo.lower_inst(inst, rules)?;
        }
    }
    log::debug!(
        "lowered {}: {} machine insts, {} vregs",
        func.name,
        lo.insts.len(),
        lo.vars.len()
    );
    Ok(Lowered {
        name: func.name.clone(),
        insts: lo.insts,
        block_starts: lo.block_starts,
        vars: lo.vars,
        frame: lo.frame,
        has_call: lo.has_call,
        spills: 0,
    })
}

/// Per-function lowering state.
pub struct FuncLowering<'a> {
    func: &'a ir::Function,
    ctx: &'a CompilationContext<'a>,
    arena: &'a Bump,
    insts: Vec<MachineInst>,
    block_starts: Vec<usize>,
    vars: Vec<VarInfo>,
    value_map: HashMap<ValueId, VReg>,
    frame: FrameBuilder,
    has_call: bool,
}

impl<'a> FuncLowering<'a> {
    fn new(func: &'a ir::Function, ctx: &'a CompilationContext<'a>, arena: &'a Bump) -> Self {
        FuncLowering {
            func,
            ctx,
            arena,
            insts: Vec::new(),
            block_starts: Vec::new(),
            vars: Vec::new(),
            value_map: HashMap::new(),
            frame: FrameBuilder::default(),
            has_call: false,
        }
    }

    fn dest_of(&self, inst: &Inst) -> CompileResult<ValueId> {
        inst.dest.ok_or_else(|| CompileError::InvalidGraph {
            function: self.func.name.clone(),
            reason: format!("{} without destination", inst.kind.mnemonic()),
        })
    }

    fn unsupported(&self, inst: &Inst) -> CompileError {
        CompileError::UnsupportedInst {
            function: self.func.name.clone(),
            inst: inst.kind.mnemonic().to_string(),
        }
    }

    pub fn new_vreg(&mut self, class: RegClass) -> VReg {
        self.vars.push(VarInfo::new(class));
        VReg(self.vars.len() as u32 - 1)
    }

    pub fn new_fixed(&mut self, class: RegClass, reg: Reg) -> VReg {
        self.vars.push(VarInfo::fixed(class, reg));
        VReg(self.vars.len() as u32 - 1)
    }

    fn class_for(ty: Type) -> RegClass {
        match ty {
            Type::I1 | Type::I8 => RegClass::Gpr8,
            Type::I16 | Type::I32 => RegClass::Gpr,
            Type::F32 | Type::F64 => RegClass::Xmm,
        }
    }

    fn value_vreg(&mut self, v: ValueId) -> VReg {
        if let Some(&vr) = self.value_map.get(&v) {
            return vr;
        }
        let class = Self::class_for(self.func.value_type(v));
        let vr = self.new_vreg(class);
        self.value_map.insert(v, vr);
        vr
    }

    /// Emit with defs/uses derived from operand shapes.
    pub fn emit(&mut self, inst: MachineInst) {
        let inst = derive_liveness(inst);
        self.insts.push(inst);
    }

    /// Emit an instruction whose liveness summary is written explicitly
    /// (implicit register effects the operand list cannot express).
    pub fn emit_raw(&mut self, inst: MachineInst) {
        self.insts.push(inst);
    }

    /// Load incoming arguments into fresh variables at function entry.
    fn lower_params(&mut self) {
        let mut offset = 0u32;
        for (i, &ty) in self.func.params.iter().enumerate() {
            let slot = self.frame.arg(offset);
            offset += if ty == Type::F64 { 8 } else { 4 };
            let dst = self.value_vreg(ValueId(i as u32));
            let (op, size) = match ty {
                Type::F32 => (Op::Movss, OpSize::D),
                Type::F64 => (Op::Movsd, OpSize::D),
                Type::I8 | Type::I1 => (Op::Movzx { from: OpSize::B }, OpSize::D),
                Type::I16 => (Op::Movzx { from: OpSize::W }, OpSize::D),
                Type::I32 => (Op::Mov, OpSize::D),
            };
            self.emit(MachineInst::new(
                op,
                size,
                vec![Operand::Virt(dst), Operand::Slot(slot)],
            ));
        }
    }

    /// Materialize an integer operand as either an immediate or a vreg.
    fn int_operand(&mut self, op: ir::Operand, inst: &Inst) -> CompileResult<Operand> {
        match op {
            ir::Operand::Value(v) => Ok(Operand::Virt(self.value_vreg(v))),
            ir::Operand::ConstInt(c) => {
                let imm = i32::try_from(c).map_err(|_| self.unsupported(inst))?;
                Ok(Operand::Imm(imm))
            }
            ir::Operand::ConstF32(_) | ir::Operand::ConstF64(_) => Err(self.unsupported(inst)),
        }
    }

    /// Force an operand into a vreg of the right class.
    fn operand_vreg(&mut self, op: ir::Operand, ty: Type, inst: &Inst) -> CompileResult<VReg> {
        match op {
            ir::Operand::Value(v) => Ok(self.value_vreg(v)),
            ir::Operand::ConstInt(c) => {
                let imm = i32::try_from(c).map_err(|_| self.unsupported(inst))?;
                let dst = self.new_vreg(Self::class_for(ty));
                self.emit(MachineInst::new(
                    Op::Mov,
                    OpSize::D,
                    vec![Operand::Virt(dst), Operand::Imm(imm)],
                ));
                Ok(dst)
            }
            ir::Operand::ConstF32(bits) => Ok(self.pool_load(bits as u64, 4)),
            ir::Operand::ConstF64(bits) => Ok(self.pool_load(bits, 8)),
        }
    }

    /// Load a floating-point literal from the constant pool.
    fn pool_load(&mut self, bits: u64, size: u8) -> VReg {
        let c = PoolConstant { bits, size };
        self.ctx.pool_constant(c);
        let dst = self.new_vreg(RegClass::Xmm);
        let op = if size == 8 { Op::Movsd } else { Op::Movss };
        self.emit(MachineInst::new(
            op,
            OpSize::D,
            vec![
                Operand::Virt(dst),
                Operand::Mem(Address::sym(SymTarget::Pool(c), 0)),
            ],
        ));
        dst
    }

    /// Translate an IR address expression into a memory operand, folding
    /// constant base/index contributions into the displacement.
    fn lower_addr(&mut self, addr: &AddrExpr, inst: &Inst) -> CompileResult<Address> {
        let mut out = Address {
            base: None,
            index: None,
            disp: addr.offset,
            sym: addr.sym.clone().map(SymTarget::Global),
        };
        if let Some(base) = addr.base {
            match base {
                ir::Operand::Value(v) => out.base = Some(AddrReg::Virt(self.value_vreg(v))),
                ir::Operand::ConstInt(c) => {
                    out.disp = out
                        .disp
                        .checked_add(i32::try_from(c).map_err(|_| self.unsupported(inst))?)
                        .ok_or_else(|| self.unsupported(inst))?;
                }
                _ => return Err(self.unsupported(inst)),
            }
        }
        if let Some((index, scale)) = addr.index {
            if !matches!(scale, 1 | 2 | 4 | 8) {
                return Err(self.unsupported(inst));
            }
            match index {
                ir::Operand::Value(v) => {
                    out.index = Some((AddrReg::Virt(self.value_vreg(v)), scale));
                }
                ir::Operand::ConstInt(c) => {
                    let scaled = c
                        .checked_mul(scale as i64)
                        .and_then(|x| i32::try_from(x).ok())
                        .ok_or_else(|| self.unsupported(inst))?;
                    out.disp = out
                        .disp
                        .checked_add(scaled)
                        .ok_or_else(|| self.unsupported(inst))?;
                }
                _ => return Err(self.unsupported(inst)),
            }
        }
        Ok(out)
    }

    fn lower_inst(&mut self, inst: &Inst, rules: &dyn IselRules) -> CompileResult<()> {
        match &inst.kind {
            InstKind::Arith { op, ty, a, b } => self.lower_arith(inst, *op, *ty, *a, *b),
            InstKind::Icmp { cond, ty, a, b } => self.lower_icmp(inst, *cond, *ty, *a, *b),
            InstKind::Fcmp { cond, ty, a, b } => {
                let av = self.operand_vreg(*a, *ty, inst)?;
                let bv = self.operand_vreg(*b, *ty, inst)?;
                let dest = self.dest_of(inst)?;
                let dst = self.value_vreg(dest);
                rules.lower_fcmp(self, *cond, *ty, av, bv, dst)
            }
            InstKind::Load { ty, addr } => self.lower_load(inst, *ty, addr),
            InstKind::Store { ty, value, addr } => self.lower_store(inst, *ty, *value, addr),
            InstKind::Copy { ty, src } => {
                let dest = self.dest_of(inst)?;
                let dst = self.value_vreg(dest);
                self.lower_copy_into(dst, *ty, *src, inst)
            }
            InstKind::Cast { op, from, to, src } => self.lower_cast(inst, *op, *from, *to, *src),
            InstKind::Call { callee, args, ret } => self.lower_call(inst, callee, args, *ret),
            InstKind::Br { target } => {
                self.emit_raw(MachineInst::new(
                    Op::Jmp { target: *target },
                    OpSize::D,
                    Vec::new(),
                ));
                Ok(())
            }
            InstKind::CondBr {
                cond,
                then_blk,
                else_blk,
            } => {
                let c = self.operand_vreg(*cond, Type::I1, inst)?;
                self.emit(MachineInst::new(
                    Op::Test,
                    OpSize::D,
                    vec![Operand::Virt(c), Operand::Virt(c)],
                ));
                self.emit_raw(MachineInst::new(
                    Op::Jcc {
                        cc: Cond::Ne,
                        target: *then_blk,
                    },
                    OpSize::D,
                    Vec::new(),
                ));
                self.emit_raw(MachineInst::new(
                    Op::Jmp { target: *else_blk },
                    OpSize::D,
                    Vec::new(),
                ));
                Ok(())
            }
            InstKind::Ret { value } => self.lower_ret(inst, *value),
        }
    }

    fn lower_arith(
        &mut self,
        inst: &Inst,
        op: ArithOp,
        ty: Type,
        a: ir::Operand,
        b: ir::Operand,
    ) -> CompileResult<()> {
        let dest = self.dest_of(inst)?;
        let dst = self.value_vreg(dest);
        if ty.is_fp() {
            return self.lower_fp_arith(inst, op, ty, a, b, dst);
        }
        match op {
            ArithOp::Add
            | ArithOp::Sub
            | ArithOp::And
            | ArithOp::Or
            | ArithOp::Xor => {
                let machine_op = match op {
                    ArithOp::Add => Op::Add,
                    ArithOp::Sub => Op::Sub,
                    ArithOp::And => Op::And,
                    ArithOp::Or => Op::Or,
                    _ => Op::Xor,
                };
                let a_op = self.int_operand(a, inst)?;
                let b_op = self.int_operand(b, inst)?;
                self.emit(MachineInst::new(
                    Op::Mov,
                    OpSize::D,
                    vec![Operand::Virt(dst), a_op],
                ));
                self.emit(MachineInst::new(
                    machine_op,
                    OpSize::D,
                    vec![Operand::Virt(dst), b_op],
                ));
            }
            ArithOp::Mul => {
                let a_op = self.int_operand(a, inst)?;
                let bv = self.operand_vreg(b, ty, inst)?;
                self.emit(MachineInst::new(
                    Op::Mov,
                    OpSize::D,
                    vec![Operand::Virt(dst), a_op],
                ));
                self.emit(MachineInst::new(
                    Op::Imul,
                    OpSize::D,
                    vec![Operand::Virt(dst), Operand::Virt(bv)],
                ));
            }
            ArithOp::Shl | ArithOp::Lshr | ArithOp::Ashr => {
                let machine_op = match op {
                    ArithOp::Shl => Op::Shl,
                    ArithOp::Lshr => Op::Shr,
                    _ => Op::Sar,
                };
                let a_op = self.int_operand(a, inst)?;
                self.emit(MachineInst::new(
                    Op::Mov,
                    OpSize::D,
                    vec![Operand::Virt(dst), a_op],
                ));
                match b {
                    ir::Operand::ConstInt(c) => {
                        self.emit(MachineInst::new(
                            machine_op,
                            OpSize::D,
                            vec![Operand::Virt(dst), Operand::Imm((c & 31) as i32)],
                        ));
                    }
                    _ => {
                        // Shift counts are hard-wired to CL by the encoding.
                        let count = self.new_fixed(RegClass::Gpr8, Reg::Ecx);
                        let b_op = self.int_operand(b, inst)?;
                        self.emit(MachineInst::new(
                            Op::Mov,
                            OpSize::D,
                            vec![Operand::Virt(count), b_op],
                        ));
                        self.emit(MachineInst::new(
                            machine_op,
                            OpSize::D,
                            vec![Operand::Virt(dst), Operand::Virt(count)],
                        ));
                    }
                }
            }
            ArithOp::Sdiv | ArithOp::Udiv | ArithOp::Srem | ArithOp::Urem => {
                self.lower_div(inst, op, ty, a, b, dst)?;
            }
            ArithOp::Fadd | ArithOp::Fsub | ArithOp::Fmul | ArithOp::Fdiv => {
                return Err(self.unsupported(inst));
            }
        }
        Ok(())
    }

    /// Division hard-wires EDX:EAX; the quotient and remainder come back in
    /// fixed registers as well, so four pinned variables bracket the idiv.
    fn lower_div(
        &mut self,
        inst: &Inst,
        op: ArithOp,
        ty: Type,
        a: ir::Operand,
        b: ir::Operand,
        dst: VReg,
    ) -> CompileResult<()> {
        let signed = matches!(op, ArithOp::Sdiv | ArithOp::Srem);
        let want_rem = matches!(op, ArithOp::Srem | ArithOp::Urem);

        let a_op = self.int_operand(a, inst)?;
        let bv = self.operand_vreg(b, ty, inst)?;

        let lo = self.new_fixed(RegClass::Gpr, RET_REG);
        self.emit(MachineInst::new(
            Op::Mov,
            OpSize::D,
            vec![Operand::Virt(lo), a_op],
        ));
        let hi = self.new_fixed(RegClass::Gpr, Reg::Edx);
        if signed {
            self.emit_raw(
                MachineInst::new(Op::Cdq, OpSize::D, Vec::new())
                    .with_defs(&[hi])
                    .with_uses(&[lo]),
            );
        } else {
            self.emit(MachineInst::new(
                Op::Mov,
                OpSize::D,
                vec![Operand::Virt(hi), Operand::Imm(0)],
            ));
        }
        let quot = self.new_fixed(RegClass::Gpr, RET_REG);
        let rem = self.new_fixed(RegClass::Gpr, Reg::Edx);
        let div_op = if signed { Op::Idiv } else { Op::Div };
        self.emit_raw(
            MachineInst::new(div_op, OpSize::D, vec![Operand::Virt(bv)])
                .with_defs(&[quot, rem])
                .with_uses(&[bv, lo, hi]),
        );
        let result = if want_rem { rem } else { quot };
        self.emit(MachineInst::new(
            Op::Mov,
            OpSize::D,
            vec![Operand::Virt(dst), Operand::Virt(result)],
        ));
        Ok(())
    }

    fn lower_fp_arith(
        &mut self,
        inst: &Inst,
        op: ArithOp,
        ty: Type,
        a: ir::Operand,
        b: ir::Operand,
        dst: VReg,
    ) -> CompileResult<()> {
        let wide = ty == Type::F64;
        let machine_op = match op {
            ArithOp::Fadd | ArithOp::Add => {
                if wide {
                    Op::Addsd
                } else {
                    Op::Addss
                }
            }
            ArithOp::Fsub | ArithOp::Sub => {
                if wide {
                    Op::Subsd
                } else {
                    Op::Subss
                }
            }
            ArithOp::Fmul | ArithOp::Mul => {
                if wide {
                    Op::Mulsd
                } else {
                    Op::Mulss
                }
            }
            ArithOp::Fdiv | ArithOp::Sdiv => {
                if wide {
                    Op::Divsd
                } else {
                    Op::Divss
                }
            }
            _ => return Err(self.unsupported(inst)),
        };
        let av = self.operand_vreg(a, ty, inst)?;
        let bv = self.operand_vreg(b, ty, inst)?;
        let mov = if wide { Op::Movsd } else { Op::Movss };
        self.emit(MachineInst::new(
            mov,
            OpSize::D,
            vec![Operand::Virt(dst), Operand::Virt(av)],
        ));
        self.emit(MachineInst::new(
            machine_op,
            OpSize::D,
            vec![Operand::Virt(dst), Operand::Virt(bv)],
        ));
        Ok(())
    }

    fn lower_icmp(
        &mut self,
        inst: &Inst,
        cond: IntCond,
        _ty: Type,
        a: ir::Operand,
        b: ir::Operand,
    ) -> CompileResult<()> {
        let dest = self.dest_of(inst)?;
        let dst = self.value_vreg(dest);
        let av = self.operand_vreg(a, Type::I32, inst)?;
        let b_op = self.int_operand(b, inst)?;
        self.emit(MachineInst::new(
            Op::Cmp,
            OpSize::D,
            vec![Operand::Virt(av), b_op],
        ));
        let cc = match cond {
            IntCond::Eq => Cond::E,
            IntCond::Ne => Cond::Ne,
            IntCond::Slt => Cond::L,
            IntCond::Sle => Cond::Le,
            IntCond::Sgt => Cond::G,
            IntCond::Sge => Cond::Ge,
            IntCond::Ult => Cond::B,
            IntCond::Ule => Cond::Be,
            IntCond::Ugt => Cond::A,
            IntCond::Uge => Cond::Ae,
        };
        self.emit(MachineInst::new(
            Op::Setcc { cc },
            OpSize::B,
            vec![Operand::Virt(dst)],
        ));
        self.emit(MachineInst::new(
            Op::Movzx { from: OpSize::B },
            OpSize::D,
            vec![Operand::Virt(dst), Operand::Virt(dst)],
        ));
        Ok(())
    }

    fn lower_load(&mut self, inst: &Inst, ty: Type, addr: &AddrExpr) -> CompileResult<()> {
        let dest = self.dest_of(inst)?;
        let dst = self.value_vreg(dest);
        let mem = self.lower_addr(addr, inst)?;
        let (op, size) = match ty {
            Type::I1 | Type::I8 => (Op::Movzx { from: OpSize::B }, OpSize::D),
            Type::I16 => (Op::Movzx { from: OpSize::W }, OpSize::D),
            Type::I32 => (Op::Mov, OpSize::D),
            Type::F32 => (Op::Movss, OpSize::D),
            Type::F64 => (Op::Movsd, OpSize::D),
        };
        self.emit(MachineInst::new(
            op,
            size,
            vec![Operand::Virt(dst), Operand::Mem(mem)],
        ));
        Ok(())
    }

    fn lower_store(
        &mut self,
        inst: &Inst,
        ty: Type,
        value: ir::Operand,
        addr: &AddrExpr,
    ) -> CompileResult<()> {
        let mem = self.lower_addr(addr, inst)?;
        match ty {
            Type::F32 | Type::F64 => {
                let src = self.operand_vreg(value, ty, inst)?;
                let op = if ty == Type::F64 { Op::Movsd } else { Op::Movss };
                self.emit(MachineInst::new(
                    op,
                    OpSize::D,
                    vec![Operand::Mem(mem), Operand::Virt(src)],
                ));
            }
            _ => {
                let size = match ty {
                    Type::I1 | Type::I8 => OpSize::B,
                    Type::I16 => OpSize::W,
                    _ => OpSize::D,
                };
                let src = match value {
                    ir::Operand::ConstInt(c) => {
                        Operand::Imm(i32::try_from(c).map_err(|_| self.unsupported(inst))?)
                    }
                    _ => {
                        // Byte stores can only encode AL/CL/DL/BL sources.
                        let v = self.operand_vreg(value, ty, inst)?;
                        if size == OpSize::B && self.vars[v.0 as usize].class == RegClass::Gpr {
                            let tmp = self.new_vreg(RegClass::Gpr8);
                            self.emit(MachineInst::new(
                                Op::Mov,
                                OpSize::D,
                                vec![Operand::Virt(tmp), Operand::Virt(v)],
                            ));
                            Operand::Virt(tmp)
                        } else {
                            Operand::Virt(v)
                        }
                    }
                };
                self.emit(MachineInst::new(
                    Op::Mov,
                    size,
                    vec![Operand::Mem(mem), src],
                ));
            }
        }
        Ok(())
    }

    fn lower_copy_into(
        &mut self,
        dst: VReg,
        ty: Type,
        src: ir::Operand,
        inst: &Inst,
    ) -> CompileResult<()> {
        match (ty.is_fp(), src) {
            (false, src) => {
                let s = self.int_operand(src, inst)?;
                self.emit(MachineInst::new(
                    Op::Mov,
                    OpSize::D,
                    vec![Operand::Virt(dst), s],
                ));
            }
            (true, src) => {
                let sv = self.operand_vreg(src, ty, inst)?;
                let op = if ty == Type::F64 { Op::Movsd } else { Op::Movss };
                self.emit(MachineInst::new(
                    op,
                    OpSize::D,
                    vec![Operand::Virt(dst), Operand::Virt(sv)],
                ));
            }
        }
        Ok(())
    }

    fn lower_cast(
        &mut self,
        inst: &Inst,
        op: CastOp,
        from: Type,
        to: Type,
        src: ir::Operand,
    ) -> CompileResult<()> {
        let dest = self.dest_of(inst)?;
        let dst = self.value_vreg(dest);
        match op {
            CastOp::Zext | CastOp::Sext => {
                let sv = self.operand_vreg(src, from, inst)?;
                let from_size = match from {
                    Type::I1 | Type::I8 => OpSize::B,
                    Type::I16 => OpSize::W,
                    _ => return Err(self.unsupported(inst)),
                };
                let machine_op = if op == CastOp::Zext || from == Type::I1 {
                    Op::Movzx { from: from_size }
                } else {
                    Op::Movsx { from: from_size }
                };
                self.emit(MachineInst::new(
                    machine_op,
                    OpSize::D,
                    vec![Operand::Virt(dst), Operand::Virt(sv)],
                ));
                if op == CastOp::Sext && from == Type::I1 {
                    // i1 sign-extension: 0/1 -> 0/-1.
                    self.emit(MachineInst::new(
                        Op::Neg,
                        OpSize::D,
                        vec![Operand::Virt(dst)],
                    ));
                }
            }
            CastOp::Trunc => {
                let s = self.int_operand(src, inst)?;
                self.emit(MachineInst::new(
                    Op::Mov,
                    OpSize::D,
                    vec![Operand::Virt(dst), s],
                ));
                let mask = match to {
                    Type::I1 => 1,
                    Type::I8 => 0xff,
                    Type::I16 => 0xffff,
                    _ => return Err(self.unsupported(inst)),
                };
                self.emit(MachineInst::new(
                    Op::And,
                    OpSize::D,
                    vec![Operand::Virt(dst), Operand::Imm(mask)],
                ));
            }
            CastOp::Sitofp => {
                let sv = self.operand_vreg(src, from, inst)?;
                let machine_op = if to == Type::F64 { Op::Cvtsi2sd } else { Op::Cvtsi2ss };
                self.emit(MachineInst::new(
                    machine_op,
                    OpSize::D,
                    vec![Operand::Virt(dst), Operand::Virt(sv)],
                ));
            }
            CastOp::Fptosi => {
                let sv = self.operand_vreg(src, from, inst)?;
                let machine_op = if from == Type::F64 { Op::Cvttsd2si } else { Op::Cvttss2si };
                self.emit(MachineInst::new(
                    machine_op,
                    OpSize::D,
                    vec![Operand::Virt(dst), Operand::Virt(sv)],
                ));
            }
            CastOp::Fpext => {
                let sv = self.operand_vreg(src, from, inst)?;
                self.emit(MachineInst::new(
                    Op::Cvtss2sd,
                    OpSize::D,
                    vec![Operand::Virt(dst), Operand::Virt(sv)],
                ));
            }
            CastOp::Fptrunc => {
                let sv = self.operand_vreg(src, from, inst)?;
                self.emit(MachineInst::new(
                    Op::Cvtsd2ss,
                    OpSize::D,
                    vec![Operand::Virt(dst), Operand::Virt(sv)],
                ));
            }
        }
        Ok(())
    }

    /// cdecl-style call: arguments pushed right to left, caller cleans up.
    fn lower_call(
        &mut self,
        inst: &Inst,
        callee: &str,
        args: &[(Type, ir::Operand)],
        ret: Option<Type>,
    ) -> CompileResult<()> {
        self.has_call = true;

        // Stage argument vregs first so their defining code runs before any
        // ESP adjustment.
        let mut staged = BumpVec::new_in(self.arena);
        for &(ty, op) in args {
            match op {
                ir::Operand::ConstInt(c) if !ty.is_fp() => {
                    let imm = i32::try_from(c).map_err(|_| self.unsupported(inst))?;
                    staged.push((ty, Operand::Imm(imm)));
                }
                _ => {
                    let v = self.operand_vreg(op, ty, inst)?;
                    staged.push((ty, Operand::Virt(v)));
                }
            }
        }

        let mut pushed = 0i32;
        for (ty, staged_op) in staged.iter().rev() {
            match ty {
                Type::F32 | Type::F64 => {
                    let bytes = ty.size() as i32;
                    self.emit(MachineInst::new(
                        Op::Sub,
                        OpSize::D,
                        vec![Operand::Phys(Reg::Esp), Operand::Imm(bytes)],
                    ));
                    let op = if *ty == Type::F64 { Op::Movsd } else { Op::Movss };
                    self.emit(MachineInst::new(
                        op,
                        OpSize::D,
                        vec![
                            Operand::Mem(Address::base(AddrReg::Phys(Reg::Esp))),
                            staged_op.clone(),
                        ],
                    ));
                    pushed += bytes;
                }
                _ => {
                    self.emit(MachineInst::new(
                        Op::Push,
                        OpSize::D,
                        vec![staged_op.clone()],
                    ));
                    pushed += 4;
                }
            }
        }

        let ret_vreg = ret.map(|ty| {
            if ty.is_fp() {
                self.new_fixed(RegClass::Xmm, RET_FP_REG)
            } else {
                self.new_fixed(RegClass::Gpr, RET_REG)
            }
        });
        let mut call = MachineInst::new(
            Op::Call {
                callee: callee.to_string(),
            },
            OpSize::D,
            Vec::new(),
        )
        .with_clobbers(RegSet::caller_saved());
        if let Some(rv) = ret_vreg {
            call.defs.push(rv);
        }
        self.emit_raw(call);

        if pushed > 0 {
            self.emit(MachineInst::new(
                Op::Add,
                OpSize::D,
                vec![Operand::Phys(Reg::Esp), Operand::Imm(pushed)],
            ));
        }

        if let (Some(rv), Some(ty), Some(dest)) = (ret_vreg, ret, inst.dest) {
            let dst = self.value_vreg(dest);
            let op = match ty {
                Type::F64 => Op::Movsd,
                Type::F32 => Op::Movss,
                _ => Op::Mov,
            };
            self.emit(MachineInst::new(
                op,
                OpSize::D,
                vec![Operand::Virt(dst), Operand::Virt(rv)],
            ));
        }
        Ok(())
    }

    fn lower_ret(&mut self, inst: &Inst, value: Option<ir::Operand>) -> CompileResult<()> {
        let mut uses = Vec::new();
        if let Some(v) = value {
            let ty = self.func.ret.ok_or_else(|| self.unsupported(inst))?;
            if ty.is_fp() {
                let rv = self.new_fixed(RegClass::Xmm, RET_FP_REG);
                let sv = self.operand_vreg(v, ty, inst)?;
                let op = if ty == Type::F64 { Op::Movsd } else { Op::Movss };
                self.emit(MachineInst::new(
                    op,
                    OpSize::D,
                    vec![Operand::Virt(rv), Operand::Virt(sv)],
                ));
                uses.push(rv);
            } else {
                let rv = self.new_fixed(RegClass::Gpr, RET_REG);
                let s = self.int_operand(v, inst)?;
                self.emit(MachineInst::new(
                    Op::Mov,
                    OpSize::D,
                    vec![Operand::Virt(rv), s],
                ));
                uses.push(rv);
            }
        }
        self.emit_raw(
            MachineInst::new(Op::Ret, OpSize::D, Vec::new()).with_uses(&uses),
        );
        Ok(())
    }
}

impl Sse2Rules {
    fn set_and_fix(
        lo: &mut FuncLowering<'_>,
        dst: VReg,
        first: Cond,
        fix: Option<(Cond, Op)>,
    ) {
        lo.emit(MachineInst::new(
            Op::Setcc { cc: first },
            OpSize::B,
            vec![Operand::Virt(dst)],
        ));
        if let Some((cc, combine)) = fix {
            let tmp = lo.new_vreg(RegClass::Gpr8);
            lo.emit(MachineInst::new(
                Op::Setcc { cc },
                OpSize::B,
                vec![Operand::Virt(tmp)],
            ));
            lo.emit(MachineInst::new(
                combine,
                OpSize::B,
                vec![Operand::Virt(dst), Operand::Virt(tmp)],
            ));
        }
        lo.emit(MachineInst::new(
            Op::Movzx { from: OpSize::B },
            OpSize::D,
            vec![Operand::Virt(dst), Operand::Virt(dst)],
        ));
    }
}

impl IselRules for Sse2Rules {
    fn instruction_set(&self) -> InstructionSet {
        InstructionSet::Sse2
    }

    /// Legacy sequence: unordered compare sets flags, setcc materializes the
    /// predicate, with a parity fixup where ZF alone cannot distinguish
    /// unordered operands.
    fn lower_fcmp(
        &self,
        lo: &mut FuncLowering<'_>,
        cond: FpCond,
        ty: Type,
        a: VReg,
        b: VReg,
        dst: VReg,
    ) -> CompileResult<()> {
        let wide = ty == Type::F64;
        let cmp = if wide { Op::Ucomisd } else { Op::Ucomiss };
        // Below/above flavors are unordered-safe only in one direction, so
        // less-than compares swap their operands.
        let (x, y, cc, fix) = match cond {
            FpCond::Oeq => (a, b, Cond::E, Some((Cond::Np, Op::And))),
            FpCond::One => (a, b, Cond::Ne, Some((Cond::Np, Op::And))),
            FpCond::Une => (a, b, Cond::Ne, Some((Cond::P, Op::Or))),
            FpCond::Ogt => (a, b, Cond::A, None),
            FpCond::Oge => (a, b, Cond::Ae, None),
            FpCond::Olt => (b, a, Cond::A, None),
            FpCond::Ole => (b, a, Cond::Ae, None),
        };
        lo.emit(MachineInst::new(
            cmp,
            OpSize::D,
            vec![Operand::Virt(x), Operand::Virt(y)],
        ));
        Sse2Rules::set_and_fix(lo, dst, cc, fix);
        Ok(())
    }
}

impl IselRules for Sse41Rules {
    fn instruction_set(&self) -> InstructionSet {
        InstructionSet::Sse41
    }

    /// Vectorized selection: one cmpss/cmpsd with a predicate immediate
    /// produces an all-ones/all-zeros mask, extracted with movd.
    fn lower_fcmp(
        &self,
        lo: &mut FuncLowering<'_>,
        cond: FpCond,
        ty: Type,
        a: VReg,
        b: VReg,
        dst: VReg,
    ) -> CompileResult<()> {
        let wide = ty == Type::F64;
        let (x, y, pred) = match cond {
            FpCond::Oeq => (a, b, 0u8),
            FpCond::Olt => (a, b, 1),
            FpCond::Ole => (a, b, 2),
            FpCond::Ogt => (b, a, 1),
            FpCond::Oge => (b, a, 2),
            FpCond::Une => (a, b, 4),
            // No single predicate expresses ordered-and-not-equal.
            FpCond::One => return Sse2Rules.lower_fcmp(lo, cond, ty, a, b, dst),
        };
        let mask = lo.new_vreg(RegClass::Xmm);
        let mov = if wide { Op::Movsd } else { Op::Movss };
        let cmp = if wide { Op::Cmpsd { pred } } else { Op::Cmpss { pred } };
        lo.emit(MachineInst::new(
            mov,
            OpSize::D,
            vec![Operand::Virt(mask), Operand::Virt(x)],
        ));
        lo.emit(MachineInst::new(
            cmp,
            OpSize::D,
            vec![Operand::Virt(mask), Operand::Virt(y)],
        ));
        lo.emit(MachineInst::new(
            Op::Movd,
            OpSize::D,
            vec![Operand::Virt(dst), Operand::Virt(mask)],
        ));
        lo.emit(MachineInst::new(
            Op::And,
            OpSize::D,
            vec![Operand::Virt(dst), Operand::Imm(1)],
        ));
        Ok(())
    }
}

/// Derive the liveness summary from operand shapes for instructions without
/// implicit register effects.
fn derive_liveness(mut inst: MachineInst) -> MachineInst {
    fn mem_uses(addr: &Address, uses: &mut Vec<VReg>) {
        if let Some(AddrReg::Virt(v)) = addr.base {
            uses.push(v);
        }
        if let Some((AddrReg::Virt(v), _)) = addr.index {
            uses.push(v);
        }
    }

    let dst_is_also_use = matches!(
        inst.op,
        Op::Add
            | Op::Sub
            | Op::And
            | Op::Or
            | Op::Xor
            | Op::Neg
            | Op::Not
            | Op::Imul
            | Op::Shl
            | Op::Shr
            | Op::Sar
            | Op::Addss
            | Op::Addsd
            | Op::Subss
            | Op::Subsd
            | Op::Mulss
            | Op::Mulsd
            | Op::Divss
            | Op::Divsd
            | Op::Cmpss { .. }
            | Op::Cmpsd { .. }
            | Op::Xorps
    );
    let no_def = matches!(
        inst.op,
        Op::Cmp | Op::Test | Op::Ucomiss | Op::Ucomisd | Op::Push
    );

    let mut defs = Vec::new();
    let mut uses = Vec::new();
    for (i, operand) in inst.operands.iter().enumerate() {
        match operand {
            Operand::Virt(v) => {
                if i == 0 && !no_def {
                    defs.push(*v);
                    if dst_is_also_use {
                        uses.push(*v);
                    }
                } else {
                    uses.push(*v);
                }
            }
            Operand::Mem(addr) => mem_uses(addr, &mut uses),
            _ => {}
        }
    }
    inst.defs.extend(defs);
    inst.uses.extend(uses);
    inst
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TargetConfig;
    use crate::ir::Function;

    fn lower(func: &Function, set: InstructionSet) -> Lowered {
        let globals = [];
        let ctx = CompilationContext::new(
            TargetConfig {
                instruction_set: set,
            },
            &globals,
        );
        let arena = Bump::new();
        lower_function(func, &ctx, isel_rules(set), &arena).expect("lowering failed")
    }

    fn fcmp_func() -> Function {
        let mut f = Function::new("f", vec![Type::F32, Type::F32], Some(Type::I1));
        let b = f.add_block("entry");
        let c = f.push(
            b,
            Type::I1,
            InstKind::Fcmp {
                cond: FpCond::Olt,
                ty: Type::F32,
                a: ir::Operand::Value(ValueId(0)),
                b: ir::Operand::Value(ValueId(1)),
            },
        );
        f.push_void(
            b,
            InstKind::Ret {
                value: Some(ir::Operand::Value(c)),
            },
        );
        f
    }

    #[test]
    fn return_constant_is_two_instructions() {
        let mut f = Function::new("f", vec![], Some(Type::I32));
        let b = f.add_block("entry");
        f.push_void(
            b,
            InstKind::Ret {
                value: Some(ir::Operand::ConstInt(0)),
            },
        );
        let lowered = lower(&f, InstructionSet::Sse2);
        assert_eq!(lowered.insts.len(), 2);
        assert!(matches!(lowered.insts[0].op, Op::Mov));
        assert!(matches!(lowered.insts[1].op, Op::Ret));
        // The return value is pinned to EAX.
        let rv = lowered.insts[0].defs[0];
        assert_eq!(lowered.vars[rv.0 as usize].fixed, Some(RET_REG));
    }

    #[test]
    fn baseline_fcmp_uses_legacy_sequence() {
        let lowered = lower(&fcmp_func(), InstructionSet::Sse2);
        assert!(lowered
            .insts
            .iter()
            .any(|i| matches!(i.op, Op::Ucomiss)));
        assert!(lowered
            .insts
            .iter()
            .any(|i| matches!(i.op, Op::Setcc { .. })));
        assert!(!lowered
            .insts
            .iter()
            .any(|i| matches!(i.op, Op::Cmpss { .. })));
    }

    #[test]
    fn extended_fcmp_uses_single_vector_compare() {
        let lowered = lower(&fcmp_func(), InstructionSet::Sse41);
        let compares = lowered
            .insts
            .iter()
            .filter(|i| matches!(i.op, Op::Cmpss { .. }))
            .count();
        assert_eq!(compares, 1);
        assert!(!lowered
            .insts
            .iter()
            .any(|i| matches!(i.op, Op::Ucomiss | Op::Setcc { .. })));
    }

    #[test]
    fn division_pins_eax_and_edx() {
        let mut f = Function::new("f", vec![Type::I32, Type::I32], Some(Type::I32));
        let b = f.add_block("entry");
        let q = f.push(
            b,
            Type::I32,
            InstKind::Arith {
                op: ArithOp::Sdiv,
                ty: Type::I32,
                a: ir::Operand::Value(ValueId(0)),
                b: ir::Operand::Value(ValueId(1)),
            },
        );
        f.push_void(
            b,
            InstKind::Ret {
                value: Some(ir::Operand::Value(q)),
            },
        );
        let lowered = lower(&f, InstructionSet::Sse2);
        let idiv = lowered
            .insts
            .iter()
            .find(|i| matches!(i.op, Op::Idiv))
            .expect("idiv emitted");
        let fixed: Vec<Option<Reg>> = idiv
            .defs
            .iter()
            .map(|v| lowered.vars[v.0 as usize].fixed)
            .collect();
        assert!(fixed.contains(&Some(Reg::Eax)));
        assert!(fixed.contains(&Some(Reg::Edx)));
    }

    #[test]
    fn fp_literal_registers_pool_entry() {
        let globals = [];
        let ctx = CompilationContext::new(TargetConfig::default(), &globals);
        let arena = Bump::new();
        let mut f = Function::new("f", vec![], Some(Type::F64));
        let b = f.add_block("entry");
        f.push_void(
            b,
            InstKind::Ret {
                value: Some(ir::Operand::ConstF64(0x4000000000000000)),
            },
        );
        lower_function(&f, &ctx, isel_rules(InstructionSet::Sse2), &arena).unwrap();
        ctx.with_pool(|pool| assert_eq!(pool.len(), 1));
    }

    #[test]
    fn variable_shift_pins_ecx() {
        let mut f = Function::new("f", vec![Type::I32, Type::I32], Some(Type::I32));
        let b = f.add_block("entry");
        let s = f.push(
            b,
            Type::I32,
            InstKind::Arith {
                op: ArithOp::Shl,
                ty: Type::I32,
                a: ir::Operand::Value(ValueId(0)),
                b: ir::Operand::Value(ValueId(1)),
            },
        );
        f.push_void(
            b,
            InstKind::Ret {
                value: Some(ir::Operand::Value(s)),
            },
        );
        let lowered = lower(&f, InstructionSet::Sse2);
        assert!(lowered
            .vars
            .iter()
            .any(|v| v.fixed == Some(Reg::Ecx)));
    }

    #[test]
    fn call_clobbers_caller_saved() {
        let mut f = Function::new("f", vec![], Some(Type::I32));
        let b = f.add_block("entry");
        let r = f.push(
            b,
            Type::I32,
            InstKind::Call {
                callee: "ext".into(),
                args: vec![(Type::I32, ir::Operand::ConstInt(7))],
                ret: Some(Type::I32),
            },
        );
        f.push_void(
            b,
            InstKind::Ret {
                value: Some(ir::Operand::Value(r)),
            },
        );
        let lowered = lower(&f, InstructionSet::Sse2);
        assert!(lowered.has_call);
        let call = lowered
            .insts
            .iter()
            .find(|i| matches!(i.op, Op::Call { .. }))
            .unwrap();
        assert!(call.clobbers.contains(Reg::Ecx));
        assert!(!call.clobbers.contains(Reg::Ebx));
    }
}
