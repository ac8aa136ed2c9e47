// This module turns the fully resolved instruction stream into machine code. Encoding is
// per-instruction and pure: each (opcode, operand shape, size) combination maps to exactly
// one iced-x86 instruction, so the same stream always produces the same bytes. Branches to
// blocks are encoded in rel32 form with a placeholder and patched once every block offset
// is known. Calls and symbol-addressed memory operands produce relocation records against
// the function's code; the in-place field already holds the addend, so the object writer
// can emit either explicit- or implicit-addend relocations from the same record. Stack
// slots are resolved to frame-relative memory operands here, using the finalized layout.
// An operand still in virtual form at this point is an allocator bug, not an input error.

//! Machine-code emission via iced-x86.

use crate::core::{CompileError, CompileResult};
use crate::x86::frame::FrameLayout;
use crate::x86::inst::{Address, AddrReg, Cond, MachineInst, Op, OpSize, Operand, StackSlot};
use crate::x86::lower::Lowered;
use crate::x86::regs::Reg;
use iced_x86::{Code, Encoder, Instruction, MemoryOperand, Register};

/// Relocation against a function's code bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reloc {
    /// Byte offset of the 32-bit field inside the code.
    pub offset: u32,
    pub symbol: String,
    pub kind: RelocKind,
    /// Addend, also already written into the field at `offset`.
    pub addend: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// Absolute 32-bit address.
    Abs32,
    /// PC-relative 32-bit (call target).
    Pc32,
}

/// Encoded body of one function.
#[derive(Debug)]
pub struct EncodedFunction {
    pub code: Vec<u8>,
    pub relocs: Vec<Reloc>,
}

struct Fixup {
    /// Offset of the rel32 field.
    field: usize,
    /// IP after the branch instruction.
    end: usize,
    target: usize,
}

/// Encode a function whose operands are fully physical.
pub fn encode_function(lowered: &Lowered, layout: &FrameLayout) -> CompileResult<EncodedFunction> {
    let mut code: Vec<u8> = Vec::new();
    let mut relocs: Vec<Reloc> = Vec::new();
    let mut fixups: Vec<Fixup> = Vec::new();
    let mut inst_offsets: Vec<usize> = Vec::with_capacity(lowered.insts.len());
    let mut encoder = Encoder::new(32);

    let err = |reason: String| CompileError::Encoding {
        function: lowered.name.clone(),
        reason,
    };

    for inst in &lowered.insts {
        inst_offsets.push(code.len());
        if inst.is_nop() {
            continue;
        }
        match &inst.op {
            Op::Jmp { target } => {
                let instr = Instruction::with_branch(Code::Jmp_rel32_32, 0)
                    .map_err(|e| err(e.to_string()))?;
                let len = encoder
                    .encode(&instr, code.len() as u64)
                    .map_err(|e| err(e.to_string()))?;
                code.extend_from_slice(&encoder.take_buffer());
                fixups.push(Fixup {
                    field: code.len() - 4,
                    end: code.len(),
                    target: target.0 as usize,
                });
                debug_assert_eq!(len, 5);
            }
            Op::Jcc { cc, target } => {
                let instr = Instruction::with_branch(jcc_code(*cc), 0)
                    .map_err(|e| err(e.to_string()))?;
                encoder
                    .encode(&instr, code.len() as u64)
                    .map_err(|e| err(e.to_string()))?;
                code.extend_from_slice(&encoder.take_buffer());
                fixups.push(Fixup {
                    field: code.len() - 4,
                    end: code.len(),
                    target: target.0 as usize,
                });
            }
            Op::Call { callee } => {
                let instr = Instruction::with_branch(Code::Call_rel32_32, 0)
                    .map_err(|e| err(e.to_string()))?;
                encoder
                    .encode(&instr, code.len() as u64)
                    .map_err(|e| err(e.to_string()))?;
                code.extend_from_slice(&encoder.take_buffer());
                // rel32 field counts from the end of the instruction.
                let field = code.len() - 4;
                code[field..].copy_from_slice(&(-4i32).to_le_bytes());
                relocs.push(Reloc {
                    offset: field as u32,
                    symbol: callee.clone(),
                    kind: RelocKind::Pc32,
                    addend: -4,
                });
            }
            _ => {
                let (instr, sym) = select(lowered, layout, inst)?;
                let inst_off = code.len();
                encoder
                    .encode(&instr, inst_off as u64)
                    .map_err(|e| err(e.to_string()))?;
                let offsets = encoder.get_constant_offsets();
                code.extend_from_slice(&encoder.take_buffer());
                if let Some((symbol, addend)) = sym {
                    if !offsets.has_displacement() {
                        return Err(err(format!(
                            "symbol reference without displacement field in `{inst}`"
                        )));
                    }
                    relocs.push(Reloc {
                        offset: (inst_off + offsets.displacement_offset()) as u32,
                        symbol,
                        kind: RelocKind::Abs32,
                        addend,
                    });
                }
            }
        }
    }

    // Block offsets, then branch patching. A block starting at a folded-away
    // instruction begins at the next encoded byte, which is exactly what the
    // recorded offset already says.
    let block_offsets: Vec<usize> = lowered
        .block_starts
        .iter()
        .map(|&si| inst_offsets.get(si).copied().unwrap_or(code.len()))
        .collect();
    for fixup in fixups {
        let target = *block_offsets.get(fixup.target).ok_or_else(|| {
            err(format!("branch to unknown block {}", fixup.target))
        })?;
        let rel = target as i64 - fixup.end as i64;
        let rel = i32::try_from(rel)
            .map_err(|_| err(format!("branch displacement {rel} out of range")))?;
        code[fixup.field..fixup.field + 4].copy_from_slice(&rel.to_le_bytes());
    }

    Ok(EncodedFunction { code, relocs })
}

fn jcc_code(cc: Cond) -> Code {
    match cc {
        Cond::E => Code::Je_rel32_32,
        Cond::Ne => Code::Jne_rel32_32,
        Cond::L => Code::Jl_rel32_32,
        Cond::Le => Code::Jle_rel32_32,
        Cond::G => Code::Jg_rel32_32,
        Cond::Ge => Code::Jge_rel32_32,
        Cond::B => Code::Jb_rel32_32,
        Cond::Be => Code::Jbe_rel32_32,
        Cond::A => Code::Ja_rel32_32,
        Cond::Ae => Code::Jae_rel32_32,
        Cond::P => Code::Jp_rel32_32,
        Cond::Np => Code::Jnp_rel32_32,
    }
}

fn setcc_code(cc: Cond) -> Code {
    match cc {
        Cond::E => Code::Sete_rm8,
        Cond::Ne => Code::Setne_rm8,
        Cond::L => Code::Setl_rm8,
        Cond::Le => Code::Setle_rm8,
        Cond::G => Code::Setg_rm8,
        Cond::Ge => Code::Setge_rm8,
        Cond::B => Code::Setb_rm8,
        Cond::Be => Code::Setbe_rm8,
        Cond::A => Code::Seta_rm8,
        Cond::Ae => Code::Setae_rm8,
        Cond::P => Code::Setp_rm8,
        Cond::Np => Code::Setnp_rm8,
    }
}

fn gpr32(r: Reg) -> Register {
    match r {
        Reg::Eax => Register::EAX,
        Reg::Ecx => Register::ECX,
        Reg::Edx => Register::EDX,
        Reg::Ebx => Register::EBX,
        Reg::Esp => Register::ESP,
        Reg::Ebp => Register::EBP,
        Reg::Esi => Register::ESI,
        Reg::Edi => Register::EDI,
        _ => Register::None,
    }
}

fn gpr16(r: Reg) -> Register {
    match r {
        Reg::Eax => Register::AX,
        Reg::Ecx => Register::CX,
        Reg::Edx => Register::DX,
        Reg::Ebx => Register::BX,
        Reg::Esp => Register::SP,
        Reg::Ebp => Register::BP,
        Reg::Esi => Register::SI,
        Reg::Edi => Register::DI,
        _ => Register::None,
    }
}

fn gpr8(r: Reg) -> Register {
    match r {
        Reg::Eax => Register::AL,
        Reg::Ecx => Register::CL,
        Reg::Edx => Register::DL,
        Reg::Ebx => Register::BL,
        _ => Register::None,
    }
}

fn xmm(r: Reg) -> Register {
    match r {
        Reg::Xmm0 => Register::XMM0,
        Reg::Xmm1 => Register::XMM1,
        Reg::Xmm2 => Register::XMM2,
        Reg::Xmm3 => Register::XMM3,
        Reg::Xmm4 => Register::XMM4,
        Reg::Xmm5 => Register::XMM5,
        Reg::Xmm6 => Register::XMM6,
        Reg::Xmm7 => Register::XMM7,
        _ => Register::None,
    }
}

fn reg_for(r: Reg, size: OpSize) -> Register {
    if r.is_xmm() {
        return xmm(r);
    }
    match size {
        OpSize::B => gpr8(r),
        OpSize::W => gpr16(r),
        OpSize::D => gpr32(r),
    }
}

/// A classified operand, ready for iced.
enum Val {
    R(Reg),
    M(MemoryOperand, Option<(String, i64)>),
    I(i32),
}

fn addr_reg(a: AddrReg) -> Option<Register> {
    match a {
        AddrReg::Phys(r) => Some(gpr32(r)),
        AddrReg::Virt(_) => None,
    }
}

fn mem_from_address(addr: &Address) -> Option<(MemoryOperand, Option<(String, i64)>)> {
    let base = match addr.base {
        Some(a) => addr_reg(a)?,
        None => Register::None,
    };
    let (index, scale) = match addr.index {
        Some((a, s)) => (addr_reg(a)?, s as u32),
        None => (Register::None, 1),
    };
    let sym = addr.sym.as_ref().map(|s| (s.name(), addr.disp as i64));
    let displ_size = if sym.is_some() {
        4
    } else if addr.disp != 0 {
        1
    } else {
        0
    };
    Some((
        MemoryOperand::new(
            base,
            index,
            scale,
            addr.disp as i64,
            displ_size,
            false,
            Register::None,
        ),
        sym,
    ))
}

fn mem_from_slot(slot: StackSlot, layout: &FrameLayout) -> MemoryOperand {
    MemoryOperand::new(
        gpr32(layout.slot_base()),
        Register::None,
        1,
        layout.slot_offset(slot) as i64,
        1,
        false,
        Register::None,
    )
}

fn classify(
    lowered: &Lowered,
    layout: &FrameLayout,
    inst: &MachineInst,
    operand: &Operand,
) -> CompileResult<Val> {
    match operand {
        Operand::Phys(r) => Ok(Val::R(*r)),
        Operand::Imm(i) => Ok(Val::I(*i)),
        Operand::Slot(s) => Ok(Val::M(mem_from_slot(*s, layout), None)),
        Operand::Mem(addr) => mem_from_address(addr)
            .map(|(m, sym)| Val::M(m, sym))
            .ok_or_else(|| {
                CompileError::Internal(format!(
                    "{}: unresolved address in `{inst}`",
                    lowered.name
                ))
            }),
        Operand::Virt(v) => Err(CompileError::Internal(format!(
            "{}: unallocated v{} reaches the encoder in `{inst}`",
            lowered.name, v.0
        ))),
    }
}

/// ALU opcodes share an encoding family; these triples are
/// (r_rm, rm_r, rm_imm).
fn alu_codes(op: &Op, size: OpSize) -> Option<(Code, Code, Code)> {
    match (op, size) {
        (Op::Add, OpSize::D) => Some((Code::Add_r32_rm32, Code::Add_rm32_r32, Code::Add_rm32_imm32)),
        (Op::Sub, OpSize::D) => Some((Code::Sub_r32_rm32, Code::Sub_rm32_r32, Code::Sub_rm32_imm32)),
        (Op::And, OpSize::D) => Some((Code::And_r32_rm32, Code::And_rm32_r32, Code::And_rm32_imm32)),
        (Op::Or, OpSize::D) => Some((Code::Or_r32_rm32, Code::Or_rm32_r32, Code::Or_rm32_imm32)),
        (Op::Xor, OpSize::D) => Some((Code::Xor_r32_rm32, Code::Xor_rm32_r32, Code::Xor_rm32_imm32)),
        (Op::Cmp, OpSize::D) => Some((Code::Cmp_r32_rm32, Code::Cmp_rm32_r32, Code::Cmp_rm32_imm32)),
        (Op::Add, OpSize::B) => Some((Code::Add_r8_rm8, Code::Add_rm8_r8, Code::Add_rm8_imm8)),
        (Op::And, OpSize::B) => Some((Code::And_r8_rm8, Code::And_rm8_r8, Code::And_rm8_imm8)),
        (Op::Or, OpSize::B) => Some((Code::Or_r8_rm8, Code::Or_rm8_r8, Code::Or_rm8_imm8)),
        (Op::Cmp, OpSize::B) => Some((Code::Cmp_r8_rm8, Code::Cmp_rm8_r8, Code::Cmp_rm8_imm8)),
        _ => None,
    }
}

fn mov_codes(size: OpSize) -> (Code, Code, Code, Code) {
    // (r_rm, rm_r, r_imm, rm_imm)
    match size {
        OpSize::B => (
            Code::Mov_r8_rm8,
            Code::Mov_rm8_r8,
            Code::Mov_r8_imm8,
            Code::Mov_rm8_imm8,
        ),
        OpSize::W => (
            Code::Mov_r16_rm16,
            Code::Mov_rm16_r16,
            Code::Mov_r16_imm16,
            Code::Mov_rm16_imm16,
        ),
        OpSize::D => (
            Code::Mov_r32_rm32,
            Code::Mov_rm32_r32,
            Code::Mov_r32_imm32,
            Code::Mov_rm32_imm32,
        ),
    }
}

fn shift_codes(op: &Op) -> Option<(Code, Code)> {
    // (rm_imm8, rm_cl)
    match op {
        Op::Shl => Some((Code::Shl_rm32_imm8, Code::Shl_rm32_CL)),
        Op::Shr => Some((Code::Shr_rm32_imm8, Code::Shr_rm32_CL)),
        Op::Sar => Some((Code::Sar_rm32_imm8, Code::Sar_rm32_CL)),
        _ => None,
    }
}

/// Scalar SSE opcodes with an xmm destination and xmm/mem source.
fn sse_rr_code(op: &Op) -> Option<Code> {
    match op {
        Op::Movss => Some(Code::Movss_xmm_xmmm32),
        Op::Movsd => Some(Code::Movsd_xmm_xmmm64),
        Op::Addss => Some(Code::Addss_xmm_xmmm32),
        Op::Addsd => Some(Code::Addsd_xmm_xmmm64),
        Op::Subss => Some(Code::Subss_xmm_xmmm32),
        Op::Subsd => Some(Code::Subsd_xmm_xmmm64),
        Op::Mulss => Some(Code::Mulss_xmm_xmmm32),
        Op::Mulsd => Some(Code::Mulsd_xmm_xmmm64),
        Op::Divss => Some(Code::Divss_xmm_xmmm32),
        Op::Divsd => Some(Code::Divsd_xmm_xmmm64),
        Op::Ucomiss => Some(Code::Ucomiss_xmm_xmmm32),
        Op::Ucomisd => Some(Code::Ucomisd_xmm_xmmm64),
        Op::Cvtss2sd => Some(Code::Cvtss2sd_xmm_xmmm32),
        Op::Cvtsd2ss => Some(Code::Cvtsd2ss_xmm_xmmm64),
        Op::Xorps => Some(Code::Xorps_xmm_xmmm128),
        _ => None,
    }
}

/// Map one instruction to its unique iced form. Returns the instruction plus
/// any symbol reference carried by a memory operand.
fn select(
    lowered: &Lowered,
    layout: &FrameLayout,
    inst: &MachineInst,
) -> CompileResult<(Instruction, Option<(String, i64)>)> {
    let bad = || {
        CompileError::Encoding {
            function: lowered.name.clone(),
            reason: format!("no encoding for `{inst}`"),
        }
    };
    let ice = |e: iced_x86::IcedError| CompileError::Encoding {
        function: lowered.name.clone(),
        reason: e.to_string(),
    };

    let vals: Vec<Val> = inst
        .operands
        .iter()
        .map(|o| classify(lowered, layout, inst, o))
        .collect::<CompileResult<_>>()?;
    let mut sym = None;
    for v in &vals {
        if let Val::M(_, Some(s)) = v {
            sym = Some(s.clone());
        }
    }
    let size = inst.size;

    let instr = match &inst.op {
        Op::Mov => {
            let (r_rm, rm_r, r_imm, rm_imm) = mov_codes(size);
            match (&vals[0], &vals[1]) {
                (Val::R(d), Val::R(s)) => {
                    Instruction::with2(r_rm, reg_for(*d, size), reg_for(*s, size)).map_err(ice)?
                }
                (Val::R(d), Val::M(m, _)) => {
                    Instruction::with2(r_rm, reg_for(*d, size), *m).map_err(ice)?
                }
                (Val::R(d), Val::I(i)) => {
                    Instruction::with2(r_imm, reg_for(*d, size), *i).map_err(ice)?
                }
                (Val::M(m, _), Val::R(s)) => {
                    Instruction::with2(rm_r, *m, reg_for(*s, size)).map_err(ice)?
                }
                (Val::M(m, _), Val::I(i)) => Instruction::with2(rm_imm, *m, *i).map_err(ice)?,
                _ => return Err(bad()),
            }
        }
        Op::Movzx { from } | Op::Movsx { from } => {
            let code = match (&inst.op, from) {
                (Op::Movzx { .. }, OpSize::B) => Code::Movzx_r32_rm8,
                (Op::Movzx { .. }, OpSize::W) => Code::Movzx_r32_rm16,
                (Op::Movsx { .. }, OpSize::B) => Code::Movsx_r32_rm8,
                (Op::Movsx { .. }, OpSize::W) => Code::Movsx_r32_rm16,
                _ => return Err(bad()),
            };
            match (&vals[0], &vals[1]) {
                (Val::R(d), Val::R(s)) => {
                    Instruction::with2(code, gpr32(*d), reg_for(*s, *from)).map_err(ice)?
                }
                (Val::R(d), Val::M(m, _)) => {
                    Instruction::with2(code, gpr32(*d), *m).map_err(ice)?
                }
                _ => return Err(bad()),
            }
        }
        Op::Lea => match (&vals[0], &vals[1]) {
            (Val::R(d), Val::M(m, _)) => {
                Instruction::with2(Code::Lea_r32_m, gpr32(*d), *m).map_err(ice)?
            }
            _ => return Err(bad()),
        },
        Op::Add | Op::Sub | Op::And | Op::Or | Op::Xor | Op::Cmp => {
            let (r_rm, rm_r, rm_imm) = alu_codes(&inst.op, size).ok_or_else(bad)?;
            match (&vals[0], &vals[1]) {
                (Val::R(d), Val::R(s)) => {
                    Instruction::with2(r_rm, reg_for(*d, size), reg_for(*s, size)).map_err(ice)?
                }
                (Val::R(d), Val::M(m, _)) => {
                    Instruction::with2(r_rm, reg_for(*d, size), *m).map_err(ice)?
                }
                (Val::R(d), Val::I(i)) => {
                    Instruction::with2(rm_imm, reg_for(*d, size), *i).map_err(ice)?
                }
                (Val::M(m, _), Val::R(s)) => {
                    Instruction::with2(rm_r, *m, reg_for(*s, size)).map_err(ice)?
                }
                (Val::M(m, _), Val::I(i)) => Instruction::with2(rm_imm, *m, *i).map_err(ice)?,
                _ => return Err(bad()),
            }
        }
        Op::Neg | Op::Not => {
            let code = if matches!(inst.op, Op::Neg) {
                Code::Neg_rm32
            } else {
                Code::Not_rm32
            };
            match &vals[0] {
                Val::R(d) => Instruction::with1(code, gpr32(*d)).map_err(ice)?,
                Val::M(m, _) => Instruction::with1(code, *m).map_err(ice)?,
                _ => return Err(bad()),
            }
        }
        Op::Imul => match (&vals[0], &vals[1]) {
            (Val::R(d), Val::R(s)) => {
                Instruction::with2(Code::Imul_r32_rm32, gpr32(*d), gpr32(*s)).map_err(ice)?
            }
            (Val::R(d), Val::M(m, _)) => {
                Instruction::with2(Code::Imul_r32_rm32, gpr32(*d), *m).map_err(ice)?
            }
            _ => return Err(bad()),
        },
        Op::Test => match (&vals[0], &vals[1]) {
            (Val::R(a), Val::R(b)) => {
                Instruction::with2(Code::Test_rm32_r32, gpr32(*a), gpr32(*b)).map_err(ice)?
            }
            _ => return Err(bad()),
        },
        Op::Shl | Op::Shr | Op::Sar => {
            let (rm_imm, rm_cl) = shift_codes(&inst.op).ok_or_else(bad)?;
            match (&vals[0], &vals[1]) {
                (Val::R(d), Val::I(i)) => {
                    Instruction::with2(rm_imm, gpr32(*d), *i).map_err(ice)?
                }
                // Variable count; allocation pinned it to ECX.
                (Val::R(d), Val::R(Reg::Ecx)) => {
                    Instruction::with2(rm_cl, gpr32(*d), Register::CL).map_err(ice)?
                }
                _ => return Err(bad()),
            }
        }
        Op::Cdq => Instruction::with(Code::Cdq),
        Op::Idiv | Op::Div => {
            let code = if matches!(inst.op, Op::Idiv) {
                Code::Idiv_rm32
            } else {
                Code::Div_rm32
            };
            match &vals[0] {
                Val::R(d) => Instruction::with1(code, gpr32(*d)).map_err(ice)?,
                Val::M(m, _) => Instruction::with1(code, *m).map_err(ice)?,
                _ => return Err(bad()),
            }
        }
        Op::Push => match &vals[0] {
            Val::R(r) => Instruction::with1(Code::Push_r32, gpr32(*r)).map_err(ice)?,
            Val::I(i) => Instruction::with1(Code::Pushd_imm32, *i).map_err(ice)?,
            Val::M(m, _) => Instruction::with1(Code::Push_rm32, *m).map_err(ice)?,
        },
        Op::Pop => match &vals[0] {
            Val::R(r) => Instruction::with1(Code::Pop_r32, gpr32(*r)).map_err(ice)?,
            _ => return Err(bad()),
        },
        Op::Ret => Instruction::with(Code::Retnd),
        Op::Setcc { cc } => match &vals[0] {
            Val::R(d) => Instruction::with1(setcc_code(*cc), gpr8(*d)).map_err(ice)?,
            Val::M(m, _) => Instruction::with1(setcc_code(*cc), *m).map_err(ice)?,
            _ => return Err(bad()),
        },
        Op::Movss | Op::Movsd => {
            let store_code = if matches!(inst.op, Op::Movss) {
                Code::Movss_xmmm32_xmm
            } else {
                Code::Movsd_xmmm64_xmm
            };
            let load_code = sse_rr_code(&inst.op).ok_or_else(bad)?;
            match (&vals[0], &vals[1]) {
                (Val::R(d), Val::R(s)) => {
                    Instruction::with2(load_code, xmm(*d), xmm(*s)).map_err(ice)?
                }
                (Val::R(d), Val::M(m, _)) => {
                    Instruction::with2(load_code, xmm(*d), *m).map_err(ice)?
                }
                (Val::M(m, _), Val::R(s)) => {
                    Instruction::with2(store_code, *m, xmm(*s)).map_err(ice)?
                }
                _ => return Err(bad()),
            }
        }
        Op::Movd => match (&vals[0], &vals[1]) {
            (Val::R(d), Val::R(s)) if d.is_gpr() && s.is_xmm() => {
                Instruction::with2(Code::Movd_rm32_xmm, gpr32(*d), xmm(*s)).map_err(ice)?
            }
            (Val::R(d), Val::R(s)) if d.is_xmm() && s.is_gpr() => {
                Instruction::with2(Code::Movd_xmm_rm32, xmm(*d), gpr32(*s)).map_err(ice)?
            }
            _ => return Err(bad()),
        },
        Op::Addss
        | Op::Addsd
        | Op::Subss
        | Op::Subsd
        | Op::Mulss
        | Op::Mulsd
        | Op::Divss
        | Op::Divsd
        | Op::Ucomiss
        | Op::Ucomisd
        | Op::Cvtss2sd
        | Op::Cvtsd2ss
        | Op::Xorps => {
            let code = sse_rr_code(&inst.op).ok_or_else(bad)?;
            match (&vals[0], &vals[1]) {
                (Val::R(d), Val::R(s)) => Instruction::with2(code, xmm(*d), xmm(*s)).map_err(ice)?,
                (Val::R(d), Val::M(m, _)) => Instruction::with2(code, xmm(*d), *m).map_err(ice)?,
                _ => return Err(bad()),
            }
        }
        Op::Cmpss { pred } | Op::Cmpsd { pred } => {
            let code = if matches!(inst.op, Op::Cmpss { .. }) {
                Code::Cmpss_xmm_xmmm32_imm8
            } else {
                Code::Cmpsd_xmm_xmmm64_imm8
            };
            match (&vals[0], &vals[1]) {
                (Val::R(d), Val::R(s)) => {
                    Instruction::with3(code, xmm(*d), xmm(*s), *pred as i32).map_err(ice)?
                }
                (Val::R(d), Val::M(m, _)) => {
                    Instruction::with3(code, xmm(*d), *m, *pred as i32).map_err(ice)?
                }
                _ => return Err(bad()),
            }
        }
        Op::Cvtsi2ss | Op::Cvtsi2sd => {
            let code = if matches!(inst.op, Op::Cvtsi2ss) {
                Code::Cvtsi2ss_xmm_rm32
            } else {
                Code::Cvtsi2sd_xmm_rm32
            };
            match (&vals[0], &vals[1]) {
                (Val::R(d), Val::R(s)) => {
                    Instruction::with2(code, xmm(*d), gpr32(*s)).map_err(ice)?
                }
                (Val::R(d), Val::M(m, _)) => Instruction::with2(code, xmm(*d), *m).map_err(ice)?,
                _ => return Err(bad()),
            }
        }
        Op::Cvttss2si | Op::Cvttsd2si => {
            let code = if matches!(inst.op, Op::Cvttss2si) {
                Code::Cvttss2si_r32_xmmm32
            } else {
                Code::Cvttsd2si_r32_xmmm64
            };
            match (&vals[0], &vals[1]) {
                (Val::R(d), Val::R(s)) => {
                    Instruction::with2(code, gpr32(*d), xmm(*s)).map_err(ice)?
                }
                (Val::R(d), Val::M(m, _)) => Instruction::with2(code, gpr32(*d), *m).map_err(ice)?,
                _ => return Err(bad()),
            }
        }
        Op::Nop | Op::Jmp { .. } | Op::Jcc { .. } | Op::Call { .. } => {
            return Err(CompileError::Internal(format!(
                "{}: `{inst}` must not reach operand selection",
                lowered.name
            )));
        }
    };
    Ok((instr, sym))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PoolConstant;
    use crate::x86::frame::FrameBuilder;
    use crate::x86::inst::{SymTarget, VarInfo};
    use crate::x86::regs::RegSet;
    use iced_x86::{Decoder, DecoderOptions, Mnemonic};

    fn layout() -> FrameLayout {
        FrameLayout::finalize(&FrameBuilder::default(), RegSet::empty(), false)
    }

    fn lowered(insts: Vec<MachineInst>, block_starts: Vec<usize>) -> Lowered {
        Lowered {
            name: "t".into(),
            insts,
            block_starts,
            vars: Vec::<VarInfo>::new(),
            frame: FrameBuilder::default(),
            has_call: false,
            spills: 0,
        }
    }

    fn decode_all(code: &[u8]) -> Vec<iced_x86::Instruction> {
        let mut decoder = Decoder::with_ip(32, code, 0, DecoderOptions::NONE);
        let mut out = Vec::new();
        while decoder.can_decode() {
            out.push(decoder.decode());
        }
        out
    }

    #[test]
    fn return_zero_is_mov_then_ret() {
        let l = lowered(
            vec![
                MachineInst::new(
                    Op::Mov,
                    OpSize::D,
                    vec![Operand::Phys(Reg::Eax), Operand::Imm(0)],
                ),
                MachineInst::new(Op::Ret, OpSize::D, Vec::new()),
            ],
            vec![0],
        );
        let enc = encode_function(&l, &layout()).unwrap();
        assert_eq!(enc.code, vec![0xB8, 0, 0, 0, 0, 0xC3]);
        assert!(enc.relocs.is_empty());
    }

    #[test]
    fn forward_branch_is_patched() {
        use crate::ir::BlockId;
        let l = lowered(
            vec![
                MachineInst::new(Op::Jmp { target: BlockId(1) }, OpSize::D, Vec::new()),
                MachineInst::new(
                    Op::Mov,
                    OpSize::D,
                    vec![Operand::Phys(Reg::Eax), Operand::Imm(1)],
                ),
                MachineInst::new(Op::Ret, OpSize::D, Vec::new()),
            ],
            vec![0, 1],
        );
        let enc = encode_function(&l, &layout()).unwrap();
        // jmp rel32 0: falls through to the next instruction.
        assert_eq!(&enc.code[..5], &[0xE9, 0, 0, 0, 0]);
        let insts = decode_all(&enc.code);
        assert_eq!(insts[0].mnemonic(), Mnemonic::Jmp);
        assert_eq!(insts[0].near_branch32(), 5);
    }

    #[test]
    fn call_emits_pc_relative_relocation() {
        let l = lowered(
            vec![
                MachineInst::new(
                    Op::Call { callee: "helper".into() },
                    OpSize::D,
                    Vec::new(),
                ),
                MachineInst::new(Op::Ret, OpSize::D, Vec::new()),
            ],
            vec![0],
        );
        let enc = encode_function(&l, &layout()).unwrap();
        assert_eq!(enc.code[0], 0xE8);
        assert_eq!(&enc.code[1..5], &(-4i32).to_le_bytes());
        assert_eq!(
            enc.relocs,
            vec![Reloc {
                offset: 1,
                symbol: "helper".into(),
                kind: RelocKind::Pc32,
                addend: -4,
            }]
        );
    }

    #[test]
    fn pool_reference_emits_absolute_relocation() {
        let c = PoolConstant { bits: 0x3f800000, size: 4 };
        let l = lowered(
            vec![
                MachineInst::new(
                    Op::Movss,
                    OpSize::D,
                    vec![
                        Operand::Phys(Reg::Xmm0),
                        Operand::Mem(Address::sym(SymTarget::Pool(c), 0)),
                    ],
                ),
                MachineInst::new(Op::Ret, OpSize::D, Vec::new()),
            ],
            vec![0],
        );
        let enc = encode_function(&l, &layout()).unwrap();
        assert_eq!(enc.relocs.len(), 1);
        let reloc = &enc.relocs[0];
        assert_eq!(reloc.kind, RelocKind::Abs32);
        assert_eq!(reloc.symbol, c.symbol());
        assert_eq!(reloc.addend, 0);
        // The in-place field matches the addend.
        let field = reloc.offset as usize;
        assert_eq!(&enc.code[field..field + 4], &[0, 0, 0, 0]);
    }

    #[test]
    fn encoding_round_trips_through_the_decoder() {
        let l = lowered(
            vec![
                MachineInst::new(
                    Op::Mov,
                    OpSize::D,
                    vec![Operand::Phys(Reg::Ecx), Operand::Imm(7)],
                ),
                MachineInst::new(
                    Op::Add,
                    OpSize::D,
                    vec![Operand::Phys(Reg::Ecx), Operand::Phys(Reg::Eax)],
                ),
                MachineInst::new(
                    Op::Setcc { cc: Cond::E },
                    OpSize::B,
                    vec![Operand::Phys(Reg::Ecx)],
                ),
                MachineInst::new(
                    Op::Movzx { from: OpSize::B },
                    OpSize::D,
                    vec![Operand::Phys(Reg::Ecx), Operand::Phys(Reg::Ecx)],
                ),
                MachineInst::new(Op::Ret, OpSize::D, Vec::new()),
            ],
            vec![0],
        );
        let enc = encode_function(&l, &layout()).unwrap();
        let decoded = decode_all(&enc.code);
        let mnemonics: Vec<Mnemonic> = decoded.iter().map(|i| i.mnemonic()).collect();
        assert_eq!(
            mnemonics,
            vec![
                Mnemonic::Mov,
                Mnemonic::Add,
                Mnemonic::Sete,
                Mnemonic::Movzx,
                Mnemonic::Ret,
            ]
        );
    }

    #[test]
    fn slot_operands_resolve_against_the_frame() {
        let mut builder = FrameBuilder::default();
        let slot = builder.new_local(4);
        let layout = FrameLayout::finalize(&builder, RegSet::empty(), false);
        let l = lowered(
            vec![
                MachineInst::new(
                    Op::Mov,
                    OpSize::D,
                    vec![Operand::Phys(Reg::Eax), Operand::Slot(slot)],
                ),
                MachineInst::new(Op::Ret, OpSize::D, Vec::new()),
            ],
            vec![0],
        );
        let enc = encode_function(&l, &layout).unwrap();
        let decoded = decode_all(&enc.code);
        assert_eq!(decoded[0].mnemonic(), Mnemonic::Mov);
        assert_eq!(decoded[0].memory_base(), iced_x86::Register::EBP);
        assert_eq!(decoded[0].memory_displacement32() as i32, -4);
    }
}
