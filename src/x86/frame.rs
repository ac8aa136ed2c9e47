// This module owns the stack frame layout for a lowered function: incoming-argument slots,
// spill/local slots, the callee-saved register save area, and prologue/epilogue insertion.
// The frame is elided entirely for leaf functions with no locals and no saved registers,
// in which case incoming arguments are addressed relative to ESP; otherwise EBP is
// established as the frame pointer and arguments live at EBP+8 upward while locals grow
// downward past the save area. Epilogues are expanded in place of every return instruction
// once the final layout is known, which is only after register allocation has created all
// spill slots and fixed the set of callee-saved registers actually used.

//! Stack frame layout and prologue/epilogue lowering.

use crate::x86::inst::{MachineInst, Op, OpSize, Operand, StackSlot};
use crate::x86::regs::{Reg, RegSet, FRAME_REG, STACK_REG};

/// What a stack slot refers to before the frame is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Spill or local storage of the given size.
    Local { size: u32 },
    /// Incoming argument at the given byte offset in the caller's argument
    /// area.
    Arg { offset: u32 },
}

/// Accumulates slots during lowering and allocation.
#[derive(Debug, Default)]
pub struct FrameBuilder {
    slots: Vec<SlotKind>,
}

impl FrameBuilder {
    pub fn new_local(&mut self, size: u32) -> StackSlot {
        self.slots.push(SlotKind::Local { size });
        StackSlot(self.slots.len() as u32 - 1)
    }

    pub fn arg(&mut self, offset: u32) -> StackSlot {
        self.slots.push(SlotKind::Arg { offset });
        StackSlot(self.slots.len() as u32 - 1)
    }

    pub fn slot_kind(&self, slot: StackSlot) -> SlotKind {
        self.slots[slot.0 as usize]
    }

    pub fn local_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, SlotKind::Local { .. }))
            .count()
    }
}

/// Finalized frame layout.
#[derive(Debug, Clone)]
pub struct FrameLayout {
    /// EBP-relative (or ESP-relative when the frame is elided) offset per slot.
    offsets: Vec<i32>,
    /// Callee-saved registers pushed by the prologue, in push order.
    pub saved: Vec<Reg>,
    /// Bytes reserved below the save area for locals.
    pub local_bytes: u32,
    /// Whether a frame pointer is established.
    pub has_frame: bool,
}

impl FrameLayout {
    /// Compute the layout. `used_regs` is every physical register the
    /// allocator handed out; `has_call` forces a frame so that ESP motion
    /// during argument pushes cannot disturb slot addressing.
    pub fn finalize(builder: &FrameBuilder, used_regs: RegSet, has_call: bool) -> FrameLayout {
        let saved: Vec<Reg> = [Reg::Ebx, Reg::Esi, Reg::Edi]
            .into_iter()
            .filter(|r| used_regs.contains(*r))
            .collect();
        let has_locals = builder.local_count() > 0;
        let has_frame = has_call || has_locals || !saved.is_empty();

        let save_bytes = 4 * saved.len() as u32;
        let mut cursor = save_bytes;
        let mut local_bytes = 0u32;
        let mut offsets = Vec::with_capacity(builder.slots.len());
        for kind in &builder.slots {
            match *kind {
                SlotKind::Local { size } => {
                    cursor += size.max(4);
                    local_bytes += size.max(4);
                    offsets.push(-(cursor as i32));
                }
                SlotKind::Arg { offset } => {
                    if has_frame {
                        // push ebp + return address.
                        offsets.push(8 + offset as i32);
                    } else {
                        // Return address only.
                        offsets.push(4 + offset as i32);
                    }
                }
            }
        }
        // Keep ESP 4-aligned.
        local_bytes = (local_bytes + 3) & !3;

        FrameLayout {
            offsets,
            saved,
            local_bytes,
            has_frame,
        }
    }

    /// Base register for slot addressing.
    pub fn slot_base(&self) -> Reg {
        if self.has_frame {
            FRAME_REG
        } else {
            STACK_REG
        }
    }

    /// Displacement of a slot from [`Self::slot_base`].
    pub fn slot_offset(&self, slot: StackSlot) -> i32 {
        self.offsets[slot.0 as usize]
    }

    fn prologue(&self) -> Vec<MachineInst> {
        if !self.has_frame {
            return Vec::new();
        }
        let mut out = vec![
            MachineInst::new(Op::Push, OpSize::D, vec![Operand::Phys(FRAME_REG)]),
            MachineInst::new(
                Op::Mov,
                OpSize::D,
                vec![Operand::Phys(FRAME_REG), Operand::Phys(STACK_REG)],
            ),
        ];
        for &r in &self.saved {
            out.push(MachineInst::new(Op::Push, OpSize::D, vec![Operand::Phys(r)]));
        }
        if self.local_bytes > 0 {
            out.push(MachineInst::new(
                Op::Sub,
                OpSize::D,
                vec![Operand::Phys(STACK_REG), Operand::Imm(self.local_bytes as i32)],
            ));
        }
        out
    }

    fn epilogue(&self) -> Vec<MachineInst> {
        if !self.has_frame {
            return vec![MachineInst::new(Op::Ret, OpSize::D, Vec::new())];
        }
        let mut out = Vec::new();
        if self.local_bytes > 0 {
            out.push(MachineInst::new(
                Op::Add,
                OpSize::D,
                vec![Operand::Phys(STACK_REG), Operand::Imm(self.local_bytes as i32)],
            ));
        }
        for &r in self.saved.iter().rev() {
            out.push(MachineInst::new(Op::Pop, OpSize::D, vec![Operand::Phys(r)]));
        }
        out.push(MachineInst::new(Op::Pop, OpSize::D, vec![Operand::Phys(FRAME_REG)]));
        out.push(MachineInst::new(Op::Ret, OpSize::D, Vec::new()));
        out
    }

    /// Insert the prologue at function entry and expand every `ret` into the
    /// epilogue sequence. Returns the rewritten instruction stream together
    /// with updated block start indices.
    pub fn insert(
        &self,
        insts: Vec<MachineInst>,
        block_starts: &[usize],
    ) -> (Vec<MachineInst>, Vec<usize>) {
        let mut out = Vec::with_capacity(insts.len() + 8);
        let mut new_starts = Vec::with_capacity(block_starts.len());
        let mut next_block = 0usize;
        for (i, inst) in insts.into_iter().enumerate() {
            while next_block < block_starts.len() && block_starts[next_block] == i {
                new_starts.push(out.len());
                next_block += 1;
            }
            if i == 0 {
                out.extend(self.prologue());
            }
            if matches!(inst.op, Op::Ret) {
                out.extend(self.epilogue());
            } else {
                out.push(inst);
            }
        }
        (out, new_starts)
    }

    /// Total frame size in bytes (saves + locals), excluding the pushed EBP.
    pub fn frame_size(&self) -> u32 {
        if self.has_frame {
            4 * self.saved.len() as u32 + self.local_bytes
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::BlockId;

    #[test]
    fn leaf_without_locals_elides_frame() {
        let builder = FrameBuilder::default();
        let layout = FrameLayout::finalize(&builder, RegSet::empty(), false);
        assert!(!layout.has_frame);
        assert_eq!(layout.frame_size(), 0);
        let (insts, _) = layout.insert(
            vec![MachineInst::new(Op::Ret, OpSize::D, Vec::new())],
            &[0],
        );
        assert_eq!(insts.len(), 1);
        assert!(matches!(insts[0].op, Op::Ret));
    }

    #[test]
    fn arg_offsets_depend_on_frame() {
        let mut builder = FrameBuilder::default();
        let a0 = builder.arg(0);
        let a1 = builder.arg(4);
        let elided = FrameLayout::finalize(&builder, RegSet::empty(), false);
        assert_eq!(elided.slot_offset(a0), 4);
        assert_eq!(elided.slot_offset(a1), 8);
        assert_eq!(elided.slot_base(), STACK_REG);

        let framed = FrameLayout::finalize(&builder, RegSet::empty(), true);
        assert_eq!(framed.slot_offset(a0), 8);
        assert_eq!(framed.slot_offset(a1), 12);
        assert_eq!(framed.slot_base(), FRAME_REG);
    }

    #[test]
    fn locals_grow_below_save_area() {
        let mut builder = FrameBuilder::default();
        let s0 = builder.new_local(4);
        let s1 = builder.new_local(8);
        let mut used = RegSet::empty();
        used.insert(Reg::Ebx);
        let layout = FrameLayout::finalize(&builder, used, false);
        assert!(layout.has_frame);
        assert_eq!(layout.saved, vec![Reg::Ebx]);
        assert_eq!(layout.slot_offset(s0), -8); // below the 4-byte save area
        assert_eq!(layout.slot_offset(s1), -16);
        assert_eq!(layout.local_bytes, 12);
        assert_eq!(layout.frame_size(), 16);
    }

    #[test]
    fn epilogue_expands_every_ret() {
        let mut builder = FrameBuilder::default();
        builder.new_local(4);
        let layout = FrameLayout::finalize(&builder, RegSet::empty(), false);
        let insts = vec![
            MachineInst::new(Op::Jmp { target: BlockId(1) }, OpSize::D, Vec::new()),
            MachineInst::new(Op::Ret, OpSize::D, Vec::new()),
        ];
        let (out, starts) = layout.insert(insts, &[0, 1]);
        assert_eq!(starts[0], 0);
        // Prologue: push ebp, mov ebp esp, sub esp -> jmp is at index 3.
        assert_eq!(starts[1], 4);
        let rets = out.iter().filter(|i| matches!(i.op, Op::Ret)).count();
        assert_eq!(rets, 1);
        // add esp / pop ebp / ret tail.
        assert!(matches!(out[out.len() - 2].op, Op::Pop));
    }
}
