// This module holds the register-level bookkeeping used by the local allocator. AsmReg names a
// physical register by bank and hardware number, RegMask is a 64-bit set of general-purpose
// registers with the handful of set operations the allocator needs, and RegisterState is the
// per-block allocation state: for every virtual register its current assignment (a physical
// register, unassigned, or spilled to a pending spill slot), the reverse map from physical
// register to the virtual register it holds, and the free mask. A RegisterState is built
// fresh for each basic block on the compilation session's arena and dropped once the block
// has been allocated, so no allocator state survives from one block to the next. The
// free mask is kept as the exact complement of the registers holding a live value; freeing
// a register that is already free is reported to the caller instead of being ignored.

//! Register identifiers, register sets and per-block allocation state.

use crate::ir::{SpillSlot, VReg};
use bumpalo::{collections::Vec as BumpVec, Bump};
use std::fmt;

/// Type for register bank indices.
pub type RegBank = u8;

/// Type for register IDs within a bank.
pub type RegId = u8;

/// General purpose integer registers.
pub const GP_BANK: RegBank = 0;

/// Floating point / vector registers. Only used for argument classification.
pub const FP_BANK: RegBank = 1;

/// Combined register identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AsmReg {
    pub bank: RegBank,
    pub id: RegId,
}

impl AsmReg {
    pub const fn new(bank: RegBank, id: RegId) -> Self {
        Self { bank, id }
    }

    /// A general purpose register.
    pub const fn gp(id: RegId) -> Self {
        Self { bank: GP_BANK, id }
    }

    /// A floating point register.
    pub const fn fp(id: RegId) -> Self {
        Self { bank: FP_BANK, id }
    }

    pub const fn is_gp(&self) -> bool {
        self.bank == GP_BANK
    }
}

impl fmt::Display for AsmReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bank {
            GP_BANK => write!(f, "r{}", self.id),
            FP_BANK => write!(f, "f{}", self.id),
            b => write!(f, "b{}r{}", b, self.id),
        }
    }
}

/// Set of general purpose registers, one bit per hardware register number.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegMask(u64);

impl RegMask {
    pub const EMPTY: RegMask = RegMask(0);

    pub const fn from_bits(bits: u64) -> Self {
        RegMask(bits)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Build a mask from a list of registers.
    pub fn of(regs: &[AsmReg]) -> Self {
        regs.iter().fold(RegMask::EMPTY, |m, r| m.with(*r))
    }

    pub const fn single(reg: AsmReg) -> Self {
        RegMask(1u64 << reg.id)
    }

    pub const fn contains(&self, reg: AsmReg) -> bool {
        reg.id < 64 && (self.0 & (1u64 << reg.id)) != 0
    }

    pub fn insert(&mut self, reg: AsmReg) {
        self.0 |= 1u64 << reg.id;
    }

    pub fn remove(&mut self, reg: AsmReg) {
        self.0 &= !(1u64 << reg.id);
    }

    #[must_use]
    pub const fn with(self, reg: AsmReg) -> Self {
        RegMask(self.0 | (1u64 << reg.id))
    }

    #[must_use]
    pub const fn without(self, reg: AsmReg) -> Self {
        RegMask(self.0 & !(1u64 << reg.id))
    }

    #[must_use]
    pub const fn union(self, other: RegMask) -> Self {
        RegMask(self.0 | other.0)
    }

    #[must_use]
    pub const fn intersect(self, other: RegMask) -> Self {
        RegMask(self.0 & other.0)
    }

    #[must_use]
    pub const fn difference(self, other: RegMask) -> Self {
        RegMask(self.0 & !other.0)
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// Lowest numbered register in the set.
    pub fn first(&self) -> Option<AsmReg> {
        if self.0 == 0 {
            None
        } else {
            Some(AsmReg::gp(self.0.trailing_zeros() as RegId))
        }
    }

    /// Iterate registers in ascending hardware number.
    pub fn iter(&self) -> impl Iterator<Item = AsmReg> {
        let bits = self.0;
        (0..64u8).filter(move |i| bits & (1u64 << i) != 0).map(AsmReg::gp)
    }
}

impl fmt::Debug for RegMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Assignment of one virtual register inside the block being allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VAssign {
    /// No physical location yet (or the value is dead at this point).
    Unassigned,
    /// Held in a physical register.
    Reg(AsmReg),
    /// Evicted: a reload from this slot was placed after a later instruction,
    /// the matching store is still to be emitted at an earlier reference.
    Spilled(SpillSlot),
}

/// Misuse of the register state, surfaced by the allocator as an internal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegStateError {
    AlreadyFree(AsmReg),
    NotUsable(AsmReg),
    UnknownVReg(VReg),
}

impl fmt::Display for RegStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegStateError::AlreadyFree(r) => write!(f, "register {r} freed twice"),
            RegStateError::NotUsable(r) => write!(f, "register {r} is not usable by the allocator"),
            RegStateError::UnknownVReg(v) => write!(f, "virtual register {v} above the block watermark"),
        }
    }
}

/// Per-block register state: vreg assignments, reverse map and free mask.
pub struct RegisterState<'arena> {
    vassign: BumpVec<'arena, VAssign>,
    symbolic: [Option<VReg>; 64],
    free: RegMask,
    usable: RegMask,
}

impl<'arena> RegisterState<'arena> {
    /// Create the state for a block whose virtual registers are all below `max_vreg`.
    ///
    /// `usable` is every register an instruction may be bound to, including fixed
    /// registers that are not part of the general allocation mask.
    pub fn new(arena: &'arena Bump, max_vreg: u32, usable: RegMask) -> Self {
        let mut vassign = BumpVec::with_capacity_in(max_vreg as usize, arena);
        vassign.resize(max_vreg as usize, VAssign::Unassigned);
        Self {
            vassign,
            symbolic: [None; 64],
            free: usable,
            usable,
        }
    }

    pub fn get(&self, vreg: VReg) -> Result<VAssign, RegStateError> {
        self.vassign
            .get(vreg.index())
            .copied()
            .ok_or(RegStateError::UnknownVReg(vreg))
    }

    pub fn set(&mut self, vreg: VReg, value: VAssign) -> Result<(), RegStateError> {
        match self.vassign.get_mut(vreg.index()) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(RegStateError::UnknownVReg(vreg)),
        }
    }

    /// Physical register of `vreg`, if it currently has one.
    pub fn hreg_of(&self, vreg: VReg) -> Option<AsmReg> {
        match self.vassign.get(vreg.index()) {
            Some(VAssign::Reg(r)) => Some(*r),
            _ => None,
        }
    }

    pub fn free_mask(&self) -> RegMask {
        self.free
    }

    pub fn usable_mask(&self) -> RegMask {
        self.usable
    }

    pub fn is_free(&self, reg: AsmReg) -> bool {
        self.free.contains(reg)
    }

    /// Virtual register currently held in `reg`.
    pub fn occupant(&self, reg: AsmReg) -> Option<VReg> {
        self.symbolic.get(reg.id as usize).copied().flatten()
    }

    /// Take the lowest free register in `allow`, marking it busy.
    pub fn alloc(&mut self, allow: RegMask) -> Option<AsmReg> {
        let reg = allow.intersect(self.free).first()?;
        self.free.remove(reg);
        Some(reg)
    }

    /// Return `reg` to the free set and forget its occupant.
    pub fn free_reg(&mut self, reg: AsmReg) -> Result<(), RegStateError> {
        if !self.usable.contains(reg) {
            return Err(RegStateError::NotUsable(reg));
        }
        if self.free.contains(reg) {
            return Err(RegStateError::AlreadyFree(reg));
        }
        self.free.insert(reg);
        self.symbolic[reg.id as usize] = None;
        Ok(())
    }

    /// Like `free_reg` but tolerates a register that is already free.
    pub fn release(&mut self, reg: AsmReg) {
        if self.usable.contains(reg) {
            self.free.insert(reg);
            self.symbolic[reg.id as usize] = None;
        }
    }

    /// Bind `vreg` to `reg` and mark the register busy.
    pub fn assign(&mut self, vreg: VReg, reg: AsmReg) -> Result<(), RegStateError> {
        if !self.usable.contains(reg) {
            return Err(RegStateError::NotUsable(reg));
        }
        self.set(vreg, VAssign::Reg(reg))?;
        self.symbolic[reg.id as usize] = Some(vreg);
        self.free.remove(reg);
        Ok(())
    }

    /// Registers currently holding a value.
    pub fn busy_mask(&self) -> RegMask {
        self.usable.difference(self.free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gp(ids: &[u8]) -> RegMask {
        RegMask::of(&ids.iter().map(|i| AsmReg::gp(*i)).collect::<Vec<_>>())
    }

    #[test]
    fn test_mask_operations() {
        let m = gp(&[0, 3, 5]);
        assert_eq!(m.count(), 3);
        assert!(m.contains(AsmReg::gp(3)));
        assert!(!m.contains(AsmReg::gp(4)));
        assert_eq!(m.first(), Some(AsmReg::gp(0)));
        assert_eq!(m.without(AsmReg::gp(0)).first(), Some(AsmReg::gp(3)));
        assert_eq!(m.intersect(gp(&[3, 4])), gp(&[3]));
        assert_eq!(m.difference(gp(&[3])), gp(&[0, 5]));
        assert!(RegMask::EMPTY.first().is_none());
        let regs: Vec<u8> = m.iter().map(|r| r.id).collect();
        assert_eq!(regs, vec![0, 3, 5]);
    }

    #[test]
    fn test_alloc_takes_lowest_free() {
        let arena = Bump::new();
        let mut rs = RegisterState::new(&arena, 16, gp(&[1, 2, 3]));
        assert_eq!(rs.alloc(gp(&[2, 3])), Some(AsmReg::gp(2)));
        assert_eq!(rs.alloc(gp(&[2, 3])), Some(AsmReg::gp(3)));
        assert_eq!(rs.alloc(gp(&[2, 3])), None);
        assert_eq!(rs.alloc(gp(&[1, 2, 3])), Some(AsmReg::gp(1)));
    }

    #[test]
    fn test_assign_and_free_keep_mask_consistent() {
        let arena = Bump::new();
        let usable = gp(&[0, 1, 2]);
        let mut rs = RegisterState::new(&arena, 8, usable);
        let v = VReg::new(5);
        rs.assign(v, AsmReg::gp(1)).unwrap();
        assert_eq!(rs.occupant(AsmReg::gp(1)), Some(v));
        assert_eq!(rs.hreg_of(v), Some(AsmReg::gp(1)));
        assert_eq!(rs.busy_mask(), gp(&[1]));
        assert_eq!(rs.free_mask().union(rs.busy_mask()), usable);

        rs.free_reg(AsmReg::gp(1)).unwrap();
        assert_eq!(rs.occupant(AsmReg::gp(1)), None);
        assert_eq!(
            rs.free_reg(AsmReg::gp(1)),
            Err(RegStateError::AlreadyFree(AsmReg::gp(1)))
        );
    }

    #[test]
    fn test_unknown_vreg_is_reported() {
        let arena = Bump::new();
        let rs = RegisterState::new(&arena, 4, gp(&[0]));
        assert_eq!(rs.get(VReg::new(9)), Err(RegStateError::UnknownVReg(VReg::new(9))));
    }

    #[test]
    fn test_unusable_register_rejected() {
        let arena = Bump::new();
        let mut rs = RegisterState::new(&arena, 4, gp(&[0]));
        assert_eq!(
            rs.assign(VReg::new(1), AsmReg::gp(4)),
            Err(RegStateError::NotUsable(AsmReg::gp(4)))
        );
    }
}
