// This module folds address arithmetic into memory operands after lowering and before
// register allocation. Two shapes are recognized: a single-use immediate mov feeding a base
// position folds into the displacement, and a mov-then-add-immediate chain computing a
// pointer folds into base + displacement. Folded instructions become nops so that block
// boundaries stay stable. Every fold is checked against the 32-bit displacement range; a
// fold that would overflow is simply not taken, leaving the computation in registers, which
// is always encodable. The pass iterates until no further fold applies, so chains collapse
// one link per pass.

//! Addressing-mode resolution: displacement folding over the lowered stream.

use crate::x86::inst::{AddrReg, MachineInst, Op, OpSize, Operand, VReg};
use crate::x86::lower::Lowered;

/// Fold addressing arithmetic into memory operands. Returns the number of
/// folds performed.
pub fn resolve(lowered: &mut Lowered) -> usize {
    let mut folds = 0;
    loop {
        let n = fold_pass(lowered);
        if n == 0 {
            break;
        }
        folds += n;
    }
    if folds > 0 {
        log::trace!("{}: folded {} address computation(s)", lowered.name, folds);
    }
    folds
}

enum Fold {
    /// Base register holds a known immediate: fold it into the displacement.
    Imm {
        mem_inst: usize,
        v: VReg,
        add: i64,
        kill: Vec<usize>,
    },
    /// Base register is `new_base + immediate`: rewrite base and displacement.
    Chain {
        mem_inst: usize,
        v: VReg,
        new_base: VReg,
        add: i64,
        kill: Vec<usize>,
    },
}

fn as_mov_imm(inst: &MachineInst, v: VReg) -> Option<i64> {
    if matches!(inst.op, Op::Mov)
        && inst.size == OpSize::D
        && inst.operands.len() == 2
        && inst.operands[0] == Operand::Virt(v)
    {
        if let Operand::Imm(k) = inst.operands[1] {
            return Some(k as i64);
        }
    }
    None
}

fn as_mov_vreg(inst: &MachineInst, v: VReg) -> Option<VReg> {
    if matches!(inst.op, Op::Mov)
        && inst.size == OpSize::D
        && inst.operands.len() == 2
        && inst.operands[0] == Operand::Virt(v)
    {
        if let Operand::Virt(w) = inst.operands[1] {
            return Some(w);
        }
    }
    None
}

fn as_add_imm(inst: &MachineInst, v: VReg) -> Option<i64> {
    if matches!(inst.op, Op::Add)
        && inst.size == OpSize::D
        && inst.operands.len() == 2
        && inst.operands[0] == Operand::Virt(v)
    {
        if let Operand::Imm(k) = inst.operands[1] {
            return Some(k as i64);
        }
    }
    None
}

fn fold_pass(lowered: &mut Lowered) -> usize {
    let nvars = lowered.vars.len();
    let mut def_sites: Vec<Vec<usize>> = vec![Vec::new(); nvars];
    let mut use_count = vec![0u32; nvars];
    for (i, inst) in lowered.insts.iter().enumerate() {
        for &d in &inst.defs {
            def_sites[d.0 as usize].push(i);
        }
        for &u in &inst.uses {
            use_count[u.0 as usize] += 1;
        }
    }

    let mut plans: Vec<Fold> = Vec::new();
    let mut claimed: Vec<VReg> = Vec::new();
    for (i, inst) in lowered.insts.iter().enumerate() {
        for operand in &inst.operands {
            let Operand::Mem(addr) = operand else { continue };
            let Some(AddrReg::Virt(v)) = addr.base else { continue };
            if claimed.contains(&v) {
                continue;
            }
            // A base that also appears in the index position stays put.
            if matches!(addr.index, Some((AddrReg::Virt(x), _)) if x == v) {
                continue;
            }
            let sites = &def_sites[v.0 as usize];
            match (sites.len(), use_count[v.0 as usize]) {
                (1, 1) => {
                    let j = sites[0];
                    if j >= i {
                        continue;
                    }
                    let Some(k) = as_mov_imm(&lowered.insts[j], v) else { continue };
                    let total = addr.disp as i64 + k;
                    if i32::try_from(total).is_err() {
                        // Out of displacement range; the register form is
                        // always encodable, so leave it alone.
                        continue;
                    }
                    claimed.push(v);
                    plans.push(Fold::Imm {
                        mem_inst: i,
                        v,
                        add: k,
                        kill: vec![j],
                    });
                }
                (2, 2) => {
                    let (j0, j1) = (sites[0], sites[1]);
                    if j1 >= i || j1 <= j0 {
                        continue;
                    }
                    let Some(w) = as_mov_vreg(&lowered.insts[j0], v) else { continue };
                    let Some(k) = as_add_imm(&lowered.insts[j1], v) else { continue };
                    let total = addr.disp as i64 + k;
                    if i32::try_from(total).is_err() {
                        continue;
                    }
                    claimed.push(v);
                    plans.push(Fold::Chain {
                        mem_inst: i,
                        v,
                        new_base: w,
                        add: k,
                        kill: vec![j0, j1],
                    });
                }
                _ => {}
            }
        }
    }

    let count = plans.len();
    for plan in plans {
        let (mem_inst, v, new_base, add, kill) = match plan {
            Fold::Imm { mem_inst, v, add, kill } => (mem_inst, v, None, add, kill),
            Fold::Chain { mem_inst, v, new_base, add, kill } => {
                (mem_inst, v, Some(new_base), add, kill)
            }
        };
        let inst = &mut lowered.insts[mem_inst];
        for operand in &mut inst.operands {
            let Operand::Mem(addr) = operand else { continue };
            if addr.base != Some(AddrReg::Virt(v)) {
                continue;
            }
            addr.disp = (addr.disp as i64 + add) as i32;
            addr.base = new_base.map(AddrReg::Virt);
        }
        if let Some(pos) = inst.uses.iter().position(|&u| u == v) {
            inst.uses.remove(pos);
        }
        if let Some(w) = new_base {
            inst.uses.push(w);
        }
        for j in kill {
            lowered.insts[j] = MachineInst::nop();
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x86::frame::FrameBuilder;
    use crate::x86::inst::{Address, VarInfo};
    use crate::x86::regs::RegClass;

    fn lowered(insts: Vec<MachineInst>, nvars: usize) -> Lowered {
        Lowered {
            name: "t".into(),
            insts,
            block_starts: vec![0],
            vars: vec![VarInfo::new(RegClass::Gpr); nvars],
            frame: FrameBuilder::default(),
            has_call: false,
            spills: 0,
        }
    }

    fn mov_imm(v: VReg, k: i32) -> MachineInst {
        let mut inst = MachineInst::new(
            Op::Mov,
            OpSize::D,
            vec![Operand::Virt(v), Operand::Imm(k)],
        );
        inst.defs.push(v);
        inst
    }

    fn load(dst: VReg, base: VReg, disp: i32) -> MachineInst {
        let mut inst = MachineInst::new(
            Op::Mov,
            OpSize::D,
            vec![
                Operand::Virt(dst),
                Operand::Mem(Address::base_disp(AddrReg::Virt(base), disp)),
            ],
        );
        inst.defs.push(dst);
        inst.uses.push(base);
        inst
    }

    fn mem_of(inst: &MachineInst) -> &Address {
        inst.operands
            .iter()
            .find_map(|o| match o {
                Operand::Mem(a) => Some(a),
                _ => None,
            })
            .expect("memory operand")
    }

    #[test]
    fn immediate_base_folds_into_displacement() {
        let v0 = VReg(0);
        let d = VReg(1);
        let mut l = lowered(vec![mov_imm(v0, 100), load(d, v0, 8)], 2);
        assert_eq!(resolve(&mut l), 1);
        assert!(l.insts[0].is_nop());
        let addr = mem_of(&l.insts[1]);
        assert_eq!(addr.base, None);
        assert_eq!(addr.disp, 108);
        assert!(l.insts[1].uses.is_empty());
    }

    #[test]
    fn pointer_plus_immediate_chain_folds() {
        let p = VReg(0);
        let t = VReg(1);
        let d = VReg(2);
        let mut mov = MachineInst::new(
            Op::Mov,
            OpSize::D,
            vec![Operand::Virt(t), Operand::Virt(p)],
        );
        mov.defs.push(t);
        mov.uses.push(p);
        let mut add = MachineInst::new(
            Op::Add,
            OpSize::D,
            vec![Operand::Virt(t), Operand::Imm(16)],
        );
        add.defs.push(t);
        add.uses.push(t);
        let mut l = lowered(vec![mov, add, load(d, t, 4)], 3);
        assert_eq!(resolve(&mut l), 1);
        assert!(l.insts[0].is_nop());
        assert!(l.insts[1].is_nop());
        let addr = mem_of(&l.insts[2]);
        assert_eq!(addr.base, Some(AddrReg::Virt(p)));
        assert_eq!(addr.disp, 20);
        assert_eq!(l.insts[2].uses, vec![p]);
    }

    #[test]
    fn multiply_used_base_is_left_alone() {
        let v0 = VReg(0);
        let mut l = lowered(
            vec![mov_imm(v0, 100), load(VReg(1), v0, 0), load(VReg(2), v0, 4)],
            3,
        );
        assert_eq!(resolve(&mut l), 0);
        assert!(!l.insts[0].is_nop());
    }

    #[test]
    fn overflowing_fold_keeps_register_form() {
        let v0 = VReg(0);
        let d = VReg(1);
        let mut l = lowered(vec![mov_imm(v0, i32::MAX), load(d, v0, 8)], 2);
        assert_eq!(resolve(&mut l), 0);
        let addr = mem_of(&l.insts[1]);
        assert_eq!(addr.base, Some(AddrReg::Virt(v0)));
        assert_eq!(addr.disp, 8);
    }
}
