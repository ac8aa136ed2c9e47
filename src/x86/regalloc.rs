// This module assigns physical registers to the virtual registers produced by lowering.
// Live ranges are linear over the flattened instruction order (first definition to last
// use, conservatively extended across loop back edges), and allocation is a greedy scan in
// range-start order. Calling-convention and encoding-mandated registers arrive as pinned
// variables and are honored before anything else; two pinned ranges demanding the same
// register at overlapping positions is an internal invariant violation, not a user error.
// Ranges that cross a call site avoid that call's clobber set. When no register of the
// required class is free, the conflicting range with the furthest end is spilled to a stack
// slot; spill code splits the variable into short single-instruction fragments and the scan
// repeats on the rewritten stream until it converges. The repeat count is capped; hitting
// the cap means the allocator itself is broken and compilation of the unit aborts.

//! Greedy live-range register allocation.

use crate::core::{CompileError, CompileResult};
use crate::x86::inst::{MachineInst, Op, OpSize, Operand, Storage, VarInfo, VReg};
use crate::x86::lower::Lowered;
use crate::x86::regs::{allocation_order, Reg, RegClass, RegSet};

const MAX_SPILL_ROUNDS: usize = 8;

/// Result of a completed allocation.
#[derive(Debug)]
pub struct Allocation {
    /// Every physical register handed out, pinned ones included. Drives the
    /// callee-saved save area in the frame layout.
    pub used: RegSet,
    /// Spill slots created during this allocation.
    pub spills: usize,
}

#[derive(Debug, Clone, Copy)]
struct LiveRange {
    start: usize,
    end: usize,
}

impl LiveRange {
    fn interferes(&self, other: &LiveRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

enum ScanOutcome {
    Assigned {
        map: Vec<Option<Reg>>,
        used: RegSet,
    },
    Spill(Vec<VReg>),
}

/// Allocate registers for a lowered function, rewriting virtual-register
/// operands in place. Re-entrant: variables that already carry a register
/// assignment (from an earlier round, before addressing-mode resolution
/// introduced new temporaries) keep it.
pub fn allocate(lowered: &mut Lowered) -> CompileResult<Allocation> {
    let mut total_spills = 0usize;
    for round in 0..MAX_SPILL_ROUNDS {
        let ranges = build_ranges(lowered);
        match scan(lowered, &ranges)? {
            ScanOutcome::Assigned { map, used } => {
                apply(lowered, &map);
                lowered.spills += total_spills;
                log::trace!(
                    "{}: allocation converged after {} round(s), {} spill(s)",
                    lowered.name,
                    round + 1,
                    total_spills
                );
                return Ok(Allocation {
                    used,
                    spills: total_spills,
                });
            }
            ScanOutcome::Spill(victims) => {
                log::trace!(
                    "{}: spilling {} variable(s) in round {}",
                    lowered.name,
                    victims.len(),
                    round + 1
                );
                total_spills += victims.len();
                insert_spill_code(lowered, &victims);
            }
        }
    }
    Err(CompileError::Internal(format!(
        "register allocation did not converge for {}",
        lowered.name
    )))
}

/// First-definition-to-last-use ranges over the flattened instruction order,
/// extended across loop back edges. Variables already assigned or spilled in
/// earlier rounds still appear (their defs/uses keep the vreg id), which keeps
/// their registers reserved against new temporaries.
fn build_ranges(lowered: &Lowered) -> Vec<Option<LiveRange>> {
    let mut ranges: Vec<Option<LiveRange>> = vec![None; lowered.vars.len()];
    let mut touch = |v: VReg, i: usize| {
        let r = ranges[v.0 as usize].get_or_insert(LiveRange { start: i, end: i });
        r.start = r.start.min(i);
        r.end = r.end.max(i);
    };
    for (i, inst) in lowered.insts.iter().enumerate() {
        for &v in inst.defs.iter().chain(inst.uses.iter()) {
            touch(v, i);
        }
        for v in inst.mem_vregs() {
            touch(v, i);
        }
    }
    extend_for_loops(&mut ranges, lowered);
    ranges
}

/// Anything live inside a loop must survive until its back edge: a register
/// reused after the last layout-order use would be clobbered before the next
/// iteration reads it.
fn extend_for_loops(ranges: &mut [Option<LiveRange>], lowered: &Lowered) {
    let mut back_edges = Vec::new();
    for (i, inst) in lowered.insts.iter().enumerate() {
        let target = match inst.op {
            Op::Jmp { target } => target,
            Op::Jcc { target, .. } => target,
            _ => continue,
        };
        let loop_start = lowered.block_starts[target.0 as usize];
        if loop_start <= i {
            back_edges.push((loop_start, i));
        }
    }
    let mut changed = true;
    while changed {
        changed = false;
        for &(loop_start, loop_end) in &back_edges {
            for range in ranges.iter_mut().flatten() {
                if range.start <= loop_end && range.end >= loop_start && range.end < loop_end {
                    range.end = loop_end;
                    changed = true;
                }
            }
        }
    }
}

fn pinned_reg(var: &VarInfo) -> Option<Reg> {
    var.fixed.or(match var.storage {
        Some(Storage::Reg(r)) => Some(r),
        _ => None,
    })
}

fn scan(lowered: &Lowered, ranges: &[Option<LiveRange>]) -> CompileResult<ScanOutcome> {
    let vars = &lowered.vars;

    // Call sites whose clobber sets constrain ranges living across them.
    let clobber_sites: Vec<(usize, RegSet)> = lowered
        .insts
        .iter()
        .enumerate()
        .filter(|(_, inst)| !inst.clobbers.is_empty())
        .map(|(i, inst)| (i, inst.clobbers))
        .collect();
    let crosses_clobber = |range: &LiveRange, reg: Reg| {
        clobber_sites
            .iter()
            .any(|&(i, set)| range.start < i && range.end > i && set.contains(reg))
    };

    let mut assigned: Vec<Option<Reg>> = vec![None; vars.len()];
    let mut used = RegSet::empty();

    // Pinned variables first. Cross-checking fixed pairs catches lowering
    // bugs before they turn into silently wrong code.
    let mut fixed_ranges: Vec<(usize, Reg, LiveRange)> = Vec::new();
    for (vi, var) in vars.iter().enumerate() {
        let Some(range) = ranges[vi] else { continue };
        let Some(reg) = pinned_reg(var) else { continue };
        if var.fixed.is_some() {
            for &(other, other_reg, other_range) in &fixed_ranges {
                if other_reg == reg && range.interferes(&other_range) {
                    return Err(CompileError::Internal(format!(
                        "{}: conflicting fixed assignments of {} to v{} and v{}",
                        lowered.name, reg, vi, other
                    )));
                }
            }
            if crosses_clobber(&range, reg) {
                return Err(CompileError::Internal(format!(
                    "{}: fixed assignment of {} to v{} crosses a clobbering call",
                    lowered.name, reg, vi
                )));
            }
            fixed_ranges.push((vi, reg, range));
        }
        assigned[vi] = Some(reg);
        used.insert(reg);
    }

    // Remaining variables in range-start order.
    let mut order: Vec<usize> = (0..vars.len())
        .filter(|&vi| ranges[vi].is_some() && assigned[vi].is_none())
        .collect();
    order.sort_by_key(|&vi| (ranges[vi].map(|r| r.start), vi));

    let mut spilled: Vec<VReg> = Vec::new();
    for vi in order {
        let range = ranges[vi].ok_or_else(|| {
            CompileError::Internal(format!("{}: missing range for v{vi}", lowered.name))
        })?;
        let class = vars[vi].class;

        let conflicts_at = |reg: Reg, assigned: &[Option<Reg>], spilled: &[VReg]| {
            (0..vars.len()).find(|&other| {
                assigned[other] == Some(reg)
                    && !spilled.contains(&VReg(other as u32))
                    && ranges[other].is_some_and(|o| o.interferes(&range))
            })
        };

        // Most-recently-freed register first; fresh registers only when no
        // freed one fits, which keeps the callee-saved save area small.
        let mut best: Option<(i64, Reg)> = None;
        for &reg in allocation_order(class) {
            if crosses_clobber(&range, reg) {
                continue;
            }
            if conflicts_at(reg, &assigned, &spilled).is_some() {
                continue;
            }
            let free_time = (0..vars.len())
                .filter(|&other| {
                    assigned[other] == Some(reg)
                        && ranges[other].is_some_and(|o| o.end <= range.start)
                })
                .filter_map(|other| ranges[other].map(|o| o.end as i64))
                .max()
                .unwrap_or(-1);
            if best.map_or(true, |(t, _)| free_time > t) {
                best = Some((free_time, reg));
            }
        }

        if let Some((_, reg)) = best {
            assigned[vi] = Some(reg);
            used.insert(reg);
            continue;
        }

        // No register free: evict the conflicting unpinned range that ends
        // furthest away, or this one if everything else outlives it.
        let mut victim: Option<(usize, usize)> = None;
        for &reg in allocation_order(class) {
            if let Some(other) = conflicts_at(reg, &assigned, &spilled) {
                if pinned_reg(&vars[other]).is_some() {
                    continue;
                }
                let end = ranges[other].map(|o| o.end).unwrap_or(0);
                if victim.map_or(true, |(_, e)| end > e) {
                    victim = Some((other, end));
                }
            }
        }
        match victim {
            Some((other, end)) if end > range.end => {
                spilled.push(VReg(other as u32));
                let reg = assigned[other].ok_or_else(|| {
                    CompileError::Internal(format!(
                        "{}: spill victim v{other} has no register",
                        lowered.name
                    ))
                })?;
                assigned[other] = None;
                assigned[vi] = Some(reg);
                used.insert(reg);
            }
            _ => spilled.push(VReg(vi as u32)),
        }
    }

    if spilled.is_empty() {
        Ok(ScanOutcome::Assigned { map: assigned, used })
    } else {
        Ok(ScanOutcome::Spill(spilled))
    }
}

/// Rewrite every instruction that touches a spilled variable: a fill before
/// each use, a store after each definition, each through a fresh short-lived
/// temporary of the same class.
fn insert_spill_code(lowered: &mut Lowered, victims: &[VReg]) {
    for &v in victims {
        let class = lowered.vars[v.0 as usize].class;
        let size = if class == RegClass::Xmm { 8 } else { 4 };
        let slot = lowered.frame.new_local(size);
        lowered.vars[v.0 as usize].storage = Some(Storage::Slot(slot));
    }

    let old = std::mem::take(&mut lowered.insts);
    let old_starts = std::mem::take(&mut lowered.block_starts);
    let mut out = Vec::with_capacity(old.len() + victims.len() * 2);
    let mut new_starts = Vec::with_capacity(old_starts.len());
    let mut next_block = 0usize;

    for (i, mut inst) in old.into_iter().enumerate() {
        while next_block < old_starts.len() && old_starts[next_block] == i {
            new_starts.push(out.len());
            next_block += 1;
        }
        let mut stores = Vec::new();
        for &v in victims {
            let uses_v = inst.uses.contains(&v);
            let defs_v = inst.defs.contains(&v);
            if !uses_v && !defs_v {
                continue;
            }
            let class = lowered.vars[v.0 as usize].class;
            let slot = match lowered.vars[v.0 as usize].storage {
                Some(Storage::Slot(s)) => s,
                _ => continue,
            };
            let mov = if class == RegClass::Xmm { Op::Movsd } else { Op::Mov };
            lowered.vars.push(VarInfo::new(class));
            let tmp = VReg(lowered.vars.len() as u32 - 1);
            if uses_v {
                let mut fill = MachineInst::new(
                    mov.clone(),
                    OpSize::D,
                    vec![Operand::Virt(tmp), Operand::Slot(slot)],
                );
                fill.defs.push(tmp);
                out.push(fill);
            }
            inst.replace_vreg(v, tmp);
            if defs_v {
                let mut store = MachineInst::new(
                    mov,
                    OpSize::D,
                    vec![Operand::Slot(slot), Operand::Virt(tmp)],
                );
                store.uses.push(tmp);
                stores.push(store);
            }
        }
        out.push(inst);
        out.append(&mut stores);
    }

    lowered.insts = out;
    lowered.block_starts = new_starts;
}

/// Commit the assignment map: record storage and rewrite operands.
fn apply(lowered: &mut Lowered, map: &[Option<Reg>]) {
    for (vi, reg) in map.iter().enumerate() {
        let Some(reg) = *reg else { continue };
        lowered.vars[vi].storage = Some(Storage::Reg(reg));
        for inst in &mut lowered.insts {
            inst.rewrite_vreg(VReg(vi as u32), Storage::Reg(reg));
        }
    }
}
