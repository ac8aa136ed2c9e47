// This module enumerates the physical register model for the 32-bit x86 target: the eight
// general-purpose registers and the eight XMM registers, their register classes, their
// calling-convention roles (return registers, callee-saved set, stack/frame pointers), and
// compact bit sets for tracking availability during allocation. Sub-register aliasing (AL
// inside EAX, AX inside EAX) is modeled by identity: a byte or word access names the same
// Reg with a smaller operand size, so overlap tracking only ever deals in whole registers.
// The Gpr8 class exists because byte-sized destinations (setcc) can only encode AL/CL/DL/BL.

//! Physical register model for x86-32.

use std::fmt;

/// A physical register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reg {
    Eax,
    Ecx,
    Edx,
    Ebx,
    Esp,
    Ebp,
    Esi,
    Edi,
    Xmm0,
    Xmm1,
    Xmm2,
    Xmm3,
    Xmm4,
    Xmm5,
    Xmm6,
    Xmm7,
}

/// Register classes a variable may be allocated in.
///
/// `Gpr8` is the subset of `Gpr` with byte-addressable low halves; variables
/// written by `setcc` are restricted to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegClass {
    Gpr,
    Gpr8,
    Xmm,
}

impl Reg {
    /// Linear index for bitset tracking; GPRs are 0..8, XMMs 8..16.
    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(i: u8) -> Reg {
        const ALL: [Reg; 16] = [
            Reg::Eax,
            Reg::Ecx,
            Reg::Edx,
            Reg::Ebx,
            Reg::Esp,
            Reg::Ebp,
            Reg::Esi,
            Reg::Edi,
            Reg::Xmm0,
            Reg::Xmm1,
            Reg::Xmm2,
            Reg::Xmm3,
            Reg::Xmm4,
            Reg::Xmm5,
            Reg::Xmm6,
            Reg::Xmm7,
        ];
        ALL[i as usize]
    }

    pub fn is_gpr(self) -> bool {
        self.index() < 8
    }

    pub fn is_xmm(self) -> bool {
        self.index() >= 8
    }

    /// Whether the register has an encodable 8-bit low half.
    pub fn has_byte_form(self) -> bool {
        matches!(self, Reg::Eax | Reg::Ecx | Reg::Edx | Reg::Ebx)
    }

    /// Whether the register belongs to the given allocation class.
    pub fn in_class(self, class: RegClass) -> bool {
        match class {
            RegClass::Gpr => self.is_gpr(),
            RegClass::Gpr8 => self.has_byte_form(),
            RegClass::Xmm => self.is_xmm(),
        }
    }

    /// Callee-saved under the target calling convention.
    pub fn is_callee_saved(self) -> bool {
        matches!(self, Reg::Ebx | Reg::Esi | Reg::Edi | Reg::Ebp)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reg::Eax => "eax",
            Reg::Ecx => "ecx",
            Reg::Edx => "edx",
            Reg::Ebx => "ebx",
            Reg::Esp => "esp",
            Reg::Ebp => "ebp",
            Reg::Esi => "esi",
            Reg::Edi => "edi",
            Reg::Xmm0 => "xmm0",
            Reg::Xmm1 => "xmm1",
            Reg::Xmm2 => "xmm2",
            Reg::Xmm3 => "xmm3",
            Reg::Xmm4 => "xmm4",
            Reg::Xmm5 => "xmm5",
            Reg::Xmm6 => "xmm6",
            Reg::Xmm7 => "xmm7",
        };
        f.write_str(s)
    }
}

/// Integer return register.
pub const RET_REG: Reg = Reg::Eax;
/// High half of a wide integer return.
pub const RET_HI_REG: Reg = Reg::Edx;
/// Floating-point return register.
pub const RET_FP_REG: Reg = Reg::Xmm0;
/// Stack pointer; never allocatable.
pub const STACK_REG: Reg = Reg::Esp;
/// Frame pointer; allocatable only when the frame is elided (it never is
/// today: the allocator excludes it unconditionally to keep frame lowering
/// simple).
pub const FRAME_REG: Reg = Reg::Ebp;

/// Registers an allocator may hand out, in preference order, per class.
pub fn allocation_order(class: RegClass) -> &'static [Reg] {
    match class {
        RegClass::Gpr => &[Reg::Eax, Reg::Ecx, Reg::Edx, Reg::Ebx, Reg::Esi, Reg::Edi],
        RegClass::Gpr8 => &[Reg::Eax, Reg::Ecx, Reg::Edx, Reg::Ebx],
        RegClass::Xmm => &[
            Reg::Xmm0,
            Reg::Xmm1,
            Reg::Xmm2,
            Reg::Xmm3,
            Reg::Xmm4,
            Reg::Xmm5,
            Reg::Xmm6,
            Reg::Xmm7,
        ],
    }
}

/// Bit set over the sixteen physical registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegSet(u16);

impl RegSet {
    pub const fn empty() -> Self {
        RegSet(0)
    }

    /// Registers clobbered by a call: the caller-saved GPRs plus every XMM.
    pub fn caller_saved() -> Self {
        let mut set = RegSet::empty();
        set.insert(Reg::Eax);
        set.insert(Reg::Ecx);
        set.insert(Reg::Edx);
        for i in 8..16 {
            set.insert(Reg::from_index(i));
        }
        set
    }

    pub fn insert(&mut self, reg: Reg) {
        self.0 |= 1 << reg.index();
    }

    pub fn remove(&mut self, reg: Reg) {
        self.0 &= !(1 << reg.index());
    }

    pub fn contains(&self, reg: Reg) -> bool {
        self.0 & (1 << reg.index()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn union(&mut self, other: RegSet) {
        self.0 |= other.0;
    }

    pub fn iter(&self) -> impl Iterator<Item = Reg> + '_ {
        let bits = self.0;
        (0u8..16).filter_map(move |i| (bits & (1 << i) != 0).then(|| Reg::from_index(i)))
    }
}

impl FromIterator<Reg> for RegSet {
    fn from_iter<T: IntoIterator<Item = Reg>>(iter: T) -> Self {
        let mut set = RegSet::empty();
        for r in iter {
            set.insert(r);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_round_trips() {
        for i in 0..16 {
            assert_eq!(Reg::from_index(i).index(), i);
        }
    }

    #[test]
    fn allocation_orders_exclude_stack_and_frame() {
        for class in [RegClass::Gpr, RegClass::Gpr8, RegClass::Xmm] {
            let order = allocation_order(class);
            assert!(!order.contains(&STACK_REG));
            assert!(!order.contains(&FRAME_REG));
            for r in order {
                assert!(r.in_class(class));
            }
        }
    }

    #[test]
    fn regset_basics() {
        let mut set = RegSet::empty();
        assert!(set.is_empty());
        set.insert(Reg::Ebx);
        set.insert(Reg::Xmm3);
        assert!(set.contains(Reg::Ebx));
        assert!(!set.contains(Reg::Eax));
        assert_eq!(set.iter().count(), 2);
        set.remove(Reg::Ebx);
        assert!(!set.contains(Reg::Ebx));
    }

    #[test]
    fn caller_saved_covers_all_xmm() {
        let set = RegSet::caller_saved();
        assert!(set.contains(Reg::Eax));
        assert!(set.contains(Reg::Ecx));
        assert!(set.contains(Reg::Edx));
        assert!(!set.contains(Reg::Ebx));
        for i in 8..16 {
            assert!(set.contains(Reg::from_index(i)));
        }
    }
}
