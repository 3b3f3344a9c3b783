// Local register allocator. Each basic block is allocated on its own, in two passes over its
// instruction list. The forward pass records, for every virtual register, the position of its
// first mention (`born_in`), its last read and its last write, and a preferred register mask
// collected from fixed-register constraints. Every read must come after a write in the same
// block; cross-block values are demoted to frame variables before this pass runs.
//
// The backward pass walks the block from its last instruction to its first. Going backward, a
// register becomes live at its last read and dies at its definition, so the destination of an
// instruction is handled first (its register is released right after), then the sources. When
// no register is free, the first register in the allowed set whose occupant is not an operand
// of the current instruction is evicted: its occupant is marked `Spilled(slot)`, a reload from
// the slot is placed after the current instruction, and the matching store is emitted lazily
// when allocation reaches the occupant's definition or an earlier read. Spill slots come from a
// pool; a slot whose store has been emitted is returned to the pool once the walk moves on to
// the previous instruction, so non-overlapping spill ranges share storage.
//
// Instructions inserted by the allocator are collected per instruction in a "before" list, in
// which later entries sit closer to the instruction, and an "after" list with a cursor that
// keeps reloads behind the copies and stores that must directly follow the instruction.

//! Per-block register allocation with spilling.

use crate::codegen::TargetIsa;
use crate::core::error::{JitError, JitResult};
use crate::core::register_file::{AsmReg, RegMask, RegStateError, RegisterState, VAssign};
use crate::core::session::CompilationSession;
use crate::ir::inst::RegRole;
use crate::ir::{BasicBlock, Inst, MethodBody, Reg, SpillSlot, VReg};
use bumpalo::collections::Vec as BumpVec;

/// Result of allocating a block or a whole method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocSummary {
    /// Number of distinct spill slots the frame must provide.
    pub spill_slots: u32,
    /// Every physical register that appears in the allocated code.
    pub used_regs: RegMask,
    pub spills: usize,
    pub reloads: usize,
    pub copies: usize,
}

impl AllocSummary {
    fn merge(&mut self, other: &AllocSummary) {
        self.spill_slots = self.spill_slots.max(other.spill_slots);
        self.used_regs = self.used_regs.union(other.used_regs);
        self.spills += other.spills;
        self.reloads += other.reloads;
        self.copies += other.copies;
    }

    /// Registers the prologue must preserve.
    pub fn used_callee_saved(&self, callee_saved: RegMask) -> RegMask {
        self.used_regs.intersect(callee_saved)
    }
}

/// Recycled spill slots of one block.
#[derive(Debug, Default)]
pub struct SpillPool {
    free: Vec<SpillSlot>,
    deferred: Vec<SpillSlot>,
    next: u32,
}

impl SpillPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&mut self) -> SpillSlot {
        match self.free.pop() {
            Some(slot) => slot,
            None => {
                let slot = SpillSlot(self.next);
                self.next += 1;
                slot
            }
        }
    }

    /// Return `slot`; it becomes reusable after the next call to `advance`.
    pub fn release(&mut self, slot: SpillSlot) {
        self.deferred.push(slot);
    }

    pub fn advance(&mut self) {
        self.free.append(&mut self.deferred);
    }

    /// Number of slots ever handed out.
    pub fn high_water(&self) -> u32 {
        self.next
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct RegTrack {
    born_in: usize,
    killed_in: usize,
    last_use: usize,
    preferred: RegMask,
}

struct BlockAllocator<'a, 'arena> {
    method: &'a str,
    block: u32,
    isa: &'a dyn TargetIsa,
    session: &'a CompilationSession<'arena>,
    allocatable: RegMask,
    rs: RegisterState<'arena>,
    tracks: BumpVec<'arena, RegTrack>,
    pool: SpillPool,
    stats: AllocSummary,
    index: usize,
    opcode: &'static str,
    before: Vec<Inst>,
    after: Vec<Inst>,
    last_pos: usize,
}

impl<'a, 'arena> BlockAllocator<'a, 'arena> {
    fn ice(&self, reason: impl Into<String>) -> JitError {
        JitError::at_inst(self.method, self.block, self.index, self.opcode, reason)
    }

    fn state<T>(&self, r: Result<T, RegStateError>) -> JitResult<T> {
        r.map_err(|e| self.ice(e.to_string()))
    }

    fn virt(&self, reg: Reg) -> JitResult<VReg> {
        match reg {
            Reg::Virt(v) => Ok(v),
            Reg::Phys(r) => Err(self.ice(format!("physical register {r} before allocation"))),
        }
    }

    fn get(&self, v: VReg) -> JitResult<VAssign> {
        self.state(self.rs.get(v))
    }

    fn set(&mut self, v: VReg, a: VAssign) -> JitResult<()> {
        let r = self.rs.set(v, a);
        self.state(r)
    }

    fn assign(&mut self, v: VReg, reg: AsmReg) -> JitResult<()> {
        let r = self.rs.assign(v, reg);
        self.state(r)
    }

    fn free(&mut self, reg: AsmReg) -> JitResult<()> {
        let r = self.rs.free_reg(reg);
        self.state(r)
    }

    fn track(&mut self, v: VReg) -> JitResult<&mut RegTrack> {
        let (method, block, index, opcode) = (self.method, self.block, self.index, self.opcode);
        self.tracks.get_mut(v.index()).ok_or_else(|| {
            JitError::at_inst(method, block, index, opcode, format!("{v} above the block watermark"))
        })
    }

    /// Place `inst` directly after the current instruction.
    fn insert_after_ins(&mut self, inst: Inst) {
        self.after.insert(0, inst);
        self.last_pos = 1;
    }

    /// Place `inst` after everything already queued behind the cursor.
    fn insert_after_last(&mut self, inst: Inst) {
        self.after.insert(self.last_pos, inst);
        self.last_pos += 1;
    }

    fn copy(&mut self, dst: AsmReg, src: AsmReg) -> Inst {
        self.stats.copies += 1;
        self.session.record_copy();
        log::trace!("  copy {dst} <- {src}");
        Inst::Move {
            dst: Reg::Phys(dst),
            src: Reg::Phys(src),
        }
    }

    /// Store for a pending spill; ends the slot's range.
    fn spilled_store(&mut self, slot: SpillSlot, reg: AsmReg) -> Inst {
        self.pool.release(slot);
        self.stats.spills += 1;
        self.session.record_spill();
        log::trace!("  spill store {slot} <- {reg}");
        Inst::SpillStore {
            slot,
            src: Reg::Phys(reg),
        }
    }

    /// Evict `vreg` from its register, reloading it after the current instruction.
    /// The register stays reserved for the caller.
    fn evict(&mut self, vreg: VReg) -> JitResult<AsmReg> {
        let VAssign::Reg(sel) = self.get(vreg)? else {
            return Err(self.ice(format!("{vreg} is not in a register")));
        };
        let slot = self.pool.take();
        self.set(vreg, VAssign::Spilled(slot))?;
        self.free(sel)?;
        self.insert_after_last(Inst::SpillLoad {
            dst: Reg::Phys(sel),
            slot,
        });
        self.stats.reloads += 1;
        self.session.record_reload();
        log::trace!("  evict {vreg} from {sel} to {slot}");
        match self.rs.alloc(RegMask::single(sel)) {
            Some(r) => Ok(r),
            None => Err(self.ice(format!("evicted register {sel} is not free"))),
        }
    }

    fn force_spill(&mut self, vreg: VReg) -> JitResult<()> {
        let sel = self.evict(vreg)?;
        self.free(sel)
    }

    fn free_up(&mut self, hreg: AsmReg) -> JitResult<()> {
        if self.rs.is_free(hreg) {
            return Ok(());
        }
        match self.rs.occupant(hreg) {
            Some(v) => self.force_spill(v),
            None => Err(self.ice(format!("busy register {hreg} has no occupant"))),
        }
    }

    fn operand_hreg(&self, op: Option<Reg>, requester: Option<VReg>) -> Option<AsmReg> {
        match op {
            Some(Reg::Phys(r)) => Some(r),
            Some(Reg::Virt(v)) if Some(v) != requester => self.rs.hreg_of(v),
            _ => None,
        }
    }

    /// Registers read by the copies and stores already queued before the current instruction.
    fn queued_reads(&self) -> RegMask {
        let mut mask = RegMask::default();
        for queued in &self.before {
            for (r, role) in queued.regs() {
                if let (Reg::Phys(r), RegRole::Use) = (r, role) {
                    mask.insert(r);
                }
            }
        }
        mask
    }

    /// Free a register of `mask` by evicting the first occupant that is neither an operand
    /// of `ins` nor read by a queued copy.
    fn get_register_spilling(
        &mut self,
        ins: &Inst,
        mask: RegMask,
        requester: Option<VReg>,
    ) -> JitResult<AsmReg> {
        let mut mask = mask.difference(self.queued_reads());
        for op in [ins.sreg1(), ins.sreg2()] {
            if let Some(r) = self.operand_hreg(op, requester) {
                mask.remove(r);
            }
        }
        if let Some(Reg::Phys(r)) = ins.dreg() {
            mask.remove(r);
        }
        let Some(sel) = mask.first() else {
            return Err(self.ice("more live operands than allocatable registers"));
        };
        let Some(victim) = self.rs.occupant(sel) else {
            return Err(self.ice(format!("spill candidate {sel} has no occupant")));
        };
        self.evict(victim)
    }

    fn alloc_reg(
        &mut self,
        ins: &Inst,
        mask: RegMask,
        vreg: Option<VReg>,
        use_preferred: bool,
    ) -> JitResult<AsmReg> {
        if let (Some(v), true) = (vreg, use_preferred) {
            let preferred = self.track(v)?.preferred.intersect(mask);
            if !preferred.is_empty() {
                if let Some(r) = self.rs.alloc(preferred) {
                    return Ok(r);
                }
            }
        }
        if let Some(r) = self.rs.alloc(mask) {
            return Ok(r);
        }
        self.get_register_spilling(ins, mask, vreg)
    }

    fn forward_pass(&mut self, insts: &[Inst]) -> JitResult<()> {
        for (i, ins) in insts.iter().enumerate() {
            let pos = i + 1;
            self.index = i;
            self.opcode = ins.name();
            let c = self.isa.constraints(ins);

            let sources = [(ins.sreg1(), c.dest_sreg1), (ins.sreg2(), c.dest_sreg2)];
            let outs = ins.out_regs().iter().map(|(r, h)| (Some(*r), Some(*h)));
            for (op, fixed) in sources.into_iter().chain(outs) {
                let Some(op) = op else { continue };
                let v = self.virt(op)?;
                if self.track(v)?.born_in == 0 {
                    return Err(self.ice(format!("{v} is read before it is written in this block")));
                }
                let t = self.track(v)?;
                t.last_use = pos;
                if let Some(r) = fixed {
                    t.preferred.insert(r);
                }
            }

            if let Some(d) = ins.dreg() {
                let v = self.virt(d)?;
                let base = ins.dreg_is_base();
                if base && self.track(v)?.born_in == 0 {
                    return Err(self.ice(format!("store base {v} is never written")));
                }
                let t = self.track(v)?;
                if base {
                    t.last_use = pos;
                } else {
                    if t.born_in == 0 {
                        t.born_in = pos;
                    }
                    t.killed_in = pos;
                    if let Some(r) = c.dest_dreg {
                        t.preferred.insert(r);
                    }
                }
            }
        }
        Ok(())
    }

    fn allocate_inst(&mut self, ins: &mut Inst) -> JitResult<()> {
        let c = self.isa.constraints(ins);
        let mut dreg_mask = self.allocatable;
        let mut sreg1_mask = self.allocatable;
        let mut sreg2_mask = self.allocatable.difference(c.sreg2_exclude);

        // Fixed second source.
        if let Some(fixed) = c.dest_sreg2 {
            let Some(op) = ins.sreg2() else {
                return Err(self.ice("fixed second source without an operand"));
            };
            let s2 = self.virt(op)?;
            if self.rs.is_free(fixed) {
                match self.get(s2)? {
                    VAssign::Unassigned => self.assign(s2, fixed)?,
                    VAssign::Reg(val) => {
                        let copy = self.copy(fixed, val);
                        self.before.push(copy);
                        dreg_mask.remove(fixed);
                        sreg1_mask.remove(fixed);
                    }
                    VAssign::Spilled(slot) => {
                        let store = self.spilled_store(slot, fixed);
                        self.before.push(store);
                        self.assign(s2, fixed)?;
                    }
                }
            } else {
                let mut need_spill = true;
                dreg_mask.remove(fixed);
                sreg1_mask.remove(fixed);

                if let Some(Reg::Virt(d)) = ins.dreg() {
                    if d != s2 && self.rs.hreg_of(d) == Some(fixed) {
                        let new_dest = self.alloc_reg(ins, dreg_mask, Some(d), true)?;
                        log::trace!("  moving {d} from {fixed} to {new_dest}");
                        self.assign(d, new_dest)?;
                        let copy = self.copy(fixed, new_dest);
                        self.insert_after_ins(copy);
                        self.free(fixed)?;
                        need_spill = false;
                    }
                }

                match self.get(s2)? {
                    VAssign::Reg(val) if val == fixed => need_spill = false,
                    VAssign::Reg(val) => self.free_up(val)?,
                    _ => {}
                }
                if need_spill {
                    self.free_up(fixed)?;
                }
                if let VAssign::Spilled(slot) = self.get(s2)? {
                    let store = self.spilled_store(slot, fixed);
                    self.before.push(store);
                }
                self.assign(s2, fixed)?;
            }
            if let Some(r) = ins.sreg2_mut() {
                *r = Reg::Phys(fixed);
            }
        }

        // Destination.
        let base = ins.dreg_is_base();
        if let Some(op) = ins.dreg() {
            let d = self.virt(op)?;
            if base {
                if let Some(r) = c.dest_sreg1 {
                    dreg_mask.remove(r);
                }
                if let Some(r) = c.dest_sreg2 {
                    dreg_mask.remove(r);
                }
                if let VAssign::Reg(val) = self.get(d)? {
                    if !dreg_mask.contains(val) {
                        self.force_spill(d)?;
                    }
                }
            }
            let val = match self.get(d)? {
                VAssign::Reg(r) => r,
                previous => {
                    if !base && previous == VAssign::Unassigned {
                        log::trace!("  {d} is never read");
                    }
                    let r = self.alloc_reg(ins, dreg_mask, Some(d), true)?;
                    self.assign(d, r)?;
                    if let VAssign::Spilled(slot) = previous {
                        let store = self.spilled_store(slot, r);
                        self.insert_after_ins(store);
                    }
                    r
                }
            };
            log::trace!("  dreg {d} -> {val}");
            if let Some(r) = ins.dreg_mut() {
                *r = Reg::Phys(val);
            }
            if !base {
                self.free(val)?;
                self.set(d, VAssign::Unassigned)?;
            }
        }

        // Fixed destination.
        if let (Some(fixed), Some(Reg::Phys(cur))) = (c.dest_dreg, ins.dreg()) {
            if cur != fixed {
                let copy = self.copy(cur, fixed);
                self.insert_after_ins(copy);
                if let Some(r) = ins.dreg_mut() {
                    *r = Reg::Phys(fixed);
                }
                if self.rs.occupant(fixed).is_some() {
                    self.free_up(fixed)?;
                }
            }
        }

        if base {
            if let Some(Reg::Phys(r)) = ins.dreg() {
                sreg1_mask.remove(r);
                sreg2_mask.remove(r);
            }
        }

        if let Some(clob) = c.clob_reg() {
            if !self.rs.is_free(clob) {
                self.free_up(clob)?;
            }
        }

        if c.is_call() {
            let clobbered = self.isa.caller_saved().intersect(self.rs.busy_mask());
            for r in clobbered.iter() {
                self.free_up(r)?;
            }
        }

        // Outgoing argument registers.
        let outs: Vec<(Reg, AsmReg)> = ins.out_regs().to_vec();
        for (i, (op, hreg)) in outs.into_iter().enumerate() {
            let v = self.virt(op)?;
            if !self.rs.is_free(hreg) && self.rs.occupant(hreg) != Some(v) {
                self.free_up(hreg)?;
            }
            match self.get(v)? {
                VAssign::Unassigned => self.assign(v, hreg)?,
                VAssign::Reg(r) if r == hreg => {}
                VAssign::Reg(r) => {
                    let copy = self.copy(r, hreg);
                    self.before.push(copy);
                    self.free(r)?;
                    sreg1_mask.remove(r);
                    self.assign(v, hreg)?;
                }
                VAssign::Spilled(slot) => {
                    let store = self.spilled_store(slot, hreg);
                    self.before.push(store);
                    self.assign(v, hreg)?;
                }
            }
            log::trace!("  arg {v} -> {hreg}");
            sreg1_mask.remove(hreg);
            if let Some(out) = ins.out_regs_mut() {
                if let Some(entry) = out.get_mut(i) {
                    entry.0 = Reg::Phys(hreg);
                }
            }
        }

        // First source.
        if let Some(op) = ins.sreg1() {
            let s1 = self.virt(op)?;
            if let Some(fixed) = c.dest_sreg1 {
                sreg1_mask = RegMask::single(fixed);
                if self.rs.hreg_of(s1) != Some(fixed) && !self.rs.is_free(fixed) {
                    self.free_up(fixed)?;
                }
                // The copy into `fixed` reads the current register until the instruction
                // executes, so the second source may not take it. With no other register
                // left for the second source, reload the first one after the instruction.
                if let VAssign::Reg(val) = self.get(s1)? {
                    let needs_sreg2 = match ins.sreg2() {
                        Some(Reg::Virt(s2)) if s2 != s1 => match self.get(s2)? {
                            VAssign::Reg(r) => c.sreg2_exclude.contains(r),
                            _ => true,
                        },
                        _ => false,
                    };
                    if val != fixed && needs_sreg2 && sreg2_mask.without(fixed).without(val).is_empty() {
                        log::trace!("  {s1} leaves {val} for the second source");
                        self.force_spill(s1)?;
                    }
                }
            }
            let val = match self.get(s1)? {
                VAssign::Reg(val) => match c.dest_sreg1 {
                    Some(fixed) if fixed != val => {
                        let copy = self.copy(fixed, val);
                        self.before.push(copy);
                        sreg2_mask.remove(fixed);
                        sreg2_mask.remove(val);
                        fixed
                    }
                    _ => val,
                },
                previous => {
                    let pending = match previous {
                        VAssign::Spilled(slot) => Some(slot),
                        _ => None,
                    };
                    if let (Some(Reg::Phys(d)), None) = (ins.dreg(), c.dest_sreg1) {
                        let d_free = self.rs.is_free(d);
                        if ins.is_move() && pending.is_none() && d_free && self.allocatable.contains(d)
                        {
                            sreg1_mask = RegMask::single(d);
                        }
                        if c.clobbers_sreg1() && d_free {
                            sreg1_mask = RegMask::single(d);
                        }
                    }
                    let r = self.alloc_reg(ins, sreg1_mask, Some(s1), true)?;
                    self.assign(s1, r)?;
                    if let Some(slot) = pending {
                        let store = self.spilled_store(slot, r);
                        self.before.push(store);
                    }
                    r
                }
            };
            log::trace!("  sreg1 {s1} -> {val}");
            if let Some(r) = ins.sreg1_mut() {
                *r = Reg::Phys(val);
            }
            sreg2_mask.remove(val);
        }

        // Two-operand forms: the destination starts as a copy of the first source.
        if c.clobbers_sreg1() {
            if let (Some(Reg::Phys(d)), Some(Reg::Phys(s1))) = (ins.dreg(), ins.sreg1()) {
                if d != s1 {
                    let requester = ins.sreg2().and_then(|r| r.as_virt());
                    let mut sreg2_copy = None;
                    if self.operand_hreg(ins.sreg2(), None) == Some(d) {
                        let r2 = self.alloc_reg(ins, dreg_mask, requester, false)?;
                        sreg2_copy = Some(self.copy(r2, d));
                        if let Some(r) = ins.sreg2_mut() {
                            *r = Reg::Phys(r2);
                        }
                        self.free(r2)?;
                    }
                    let copy = self.copy(d, s1);
                    self.before.push(copy);
                    if let Some(c2) = sreg2_copy {
                        let at = self.before.len() - 1;
                        self.before.insert(at, c2);
                    }
                    sreg2_mask.remove(s1);
                    sreg2_mask.remove(d);
                    if let Some(r) = ins.sreg1_mut() {
                        *r = Reg::Phys(d);
                    }
                }
            }
        }

        // Second source.
        if let Some(Reg::Virt(s2)) = ins.sreg2() {
            let val = match self.get(s2)? {
                VAssign::Reg(r) if c.sreg2_exclude.contains(r) => {
                    let r2 = self.alloc_reg(ins, sreg2_mask, None, false)?;
                    let copy = self.copy(r2, r);
                    self.before.push(copy);
                    self.free(r2)?;
                    r2
                }
                VAssign::Reg(r) => r,
                previous => {
                    let r = self.alloc_reg(ins, sreg2_mask, Some(s2), true)?;
                    self.assign(s2, r)?;
                    if let VAssign::Spilled(slot) = previous {
                        let store = self.spilled_store(slot, r);
                        self.before.push(store);
                    }
                    r
                }
            };
            log::trace!("  sreg2 {s2} -> {val}");
            if let Some(r) = ins.sreg2_mut() {
                *r = Reg::Phys(val);
            }
        }
        Ok(())
    }

    fn run(&mut self, insts: Vec<Inst>) -> JitResult<Vec<Inst>> {
        self.forward_pass(&insts)?;

        let mut chunks: Vec<Vec<Inst>> = Vec::with_capacity(insts.len());
        for (i, mut ins) in insts.into_iter().enumerate().rev() {
            self.index = i;
            self.opcode = ins.name();
            self.pool.advance();
            self.before.clear();
            self.after.clear();
            self.last_pos = 0;
            log::trace!("{}:bb{}[{}] {}", self.method, self.block, i, ins);

            self.allocate_inst(&mut ins)?;

            let mut chunk = std::mem::take(&mut self.before);
            chunk.push(ins);
            chunk.append(&mut self.after);
            chunks.push(chunk);
        }

        for (i, t) in self.tracks.iter().enumerate() {
            if t.born_in != 0 {
                log::trace!(
                    "  v{i}: born {} last read {} last write {}",
                    t.born_in,
                    t.last_use,
                    t.killed_in
                );
            }
        }
        for v in 0..self.tracks.len() {
            if let VAssign::Spilled(slot) = self.get(VReg::new(v as u32))? {
                self.index = 0;
                return Err(self.ice(format!("v{v} still pending in {slot} at block entry")));
            }
        }

        Ok(chunks.into_iter().rev().flatten().collect())
    }
}

/// Allocate one block in place.
pub fn allocate_block(
    block: &mut BasicBlock,
    method: &str,
    isa: &dyn TargetIsa,
    allocatable: RegMask,
    session: &CompilationSession<'_>,
) -> JitResult<AllocSummary> {
    let arena = session.arena();
    let max_vreg = block
        .insts
        .iter()
        .flat_map(|i| i.regs())
        .filter_map(|(r, _)| r.as_virt())
        .map(|v| v.id() + 1)
        .max()
        .unwrap_or(0)
        .max(block.max_vreg);

    let mut tracks = BumpVec::with_capacity_in(max_vreg as usize, arena);
    tracks.resize(max_vreg as usize, RegTrack::default());

    let mut alloc = BlockAllocator {
        method,
        block: block.id.0,
        isa,
        session,
        allocatable,
        rs: RegisterState::new(arena, max_vreg, isa.usable_regs()),
        tracks,
        pool: SpillPool::new(),
        stats: AllocSummary::default(),
        index: 0,
        opcode: "-",
        before: Vec::new(),
        after: Vec::new(),
        last_pos: 0,
    };

    let insts = std::mem::take(&mut block.insts);
    let out = alloc.run(insts)?;

    let usable = isa.usable_regs();
    let mut used = RegMask::EMPTY;
    for (i, ins) in out.iter().enumerate() {
        for (reg, _) in ins.regs() {
            match reg {
                Reg::Phys(r) if usable.contains(r) => used.insert(r),
                other => {
                    return Err(JitError::at_inst(
                        method,
                        block.id.0,
                        i,
                        ins.name(),
                        format!("operand {other} left unallocated"),
                    ))
                }
            }
        }
    }

    let mut stats = alloc.stats;
    stats.spill_slots = alloc.pool.high_water();
    stats.used_regs = used;
    block.insts = out;
    session.record_block_allocated();
    log::debug!(
        "{method}: allocated bb{} ({} spills, {} reloads, {} slots)",
        block.id.0,
        stats.spills,
        stats.reloads,
        stats.spill_slots
    );
    Ok(stats)
}

/// Allocate every block of `body`.
///
/// `allocatable` restricts the registers handed out for unconstrained operands;
/// registers required by fixed constraints are always available.
pub fn allocate_method(
    body: &mut MethodBody,
    isa: &dyn TargetIsa,
    allocatable: Option<RegMask>,
    session: &CompilationSession<'_>,
) -> JitResult<AllocSummary> {
    let allocatable = match allocatable {
        Some(mask) => mask.intersect(isa.usable_regs()),
        None => isa.usable_regs(),
    };
    if allocatable.is_empty() {
        return Err(JitError::unsupported("empty allocatable register set"));
    }
    let mut summary = AllocSummary::default();
    let name = body.name.clone();
    for block in &mut body.blocks {
        let s = allocate_block(block, &name, isa, allocatable, session)?;
        summary.merge(&s);
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AluOp, BlockId, CallTarget, OpSize, ShiftOp};
    use crate::x64::{self, X64Isa};
    use bumpalo::Bump;

    fn v(n: u32) -> Reg {
        Reg::Virt(VReg::new(n))
    }

    fn phys(r: AsmReg) -> Reg {
        Reg::Phys(r)
    }

    fn block(insts: Vec<Inst>) -> BasicBlock {
        let mut b = BasicBlock::new(BlockId(0));
        b.insts = insts;
        b
    }

    fn run(insts: Vec<Inst>, allocatable: RegMask) -> JitResult<(Vec<Inst>, AllocSummary)> {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut b = block(insts);
        let summary = allocate_block(&mut b, "test", &X64Isa, allocatable, &session)?;
        Ok((b.insts, summary))
    }

    #[test]
    fn test_shift_count_is_placed_in_rcx() {
        let insts = vec![
            Inst::Iconst { dst: v(0), value: 5 },
            Inst::Iconst { dst: v(1), value: 2 },
            Inst::Shift {
                op: ShiftOp::Shl,
                size: OpSize::S64,
                dst: v(2),
                lhs: v(0),
                count: v(1),
            },
            Inst::Return { src: Some(v(2)) },
        ];
        let (out, _) = run(insts, X64Isa.usable_regs()).unwrap();
        let shift = out
            .iter()
            .find(|i| matches!(i, Inst::Shift { .. }))
            .unwrap();
        assert_eq!(shift.sreg2(), Some(phys(x64::RCX)));
        assert_eq!(shift.dreg(), shift.sreg1());
        assert_eq!(out.last().and_then(|i| i.sreg1()), Some(phys(x64::RAX)));
    }

    #[test]
    fn test_division_uses_rax_and_avoids_rdx_for_divisor() {
        let insts = vec![
            Inst::Iconst { dst: v(0), value: 100 },
            Inst::Iconst { dst: v(1), value: 7 },
            Inst::Div {
                signed: true,
                rem: false,
                size: OpSize::S64,
                dst: v(2),
                lhs: v(0),
                rhs: v(1),
            },
            Inst::Return { src: Some(v(2)) },
        ];
        let (out, _) = run(insts, X64Isa.usable_regs()).unwrap();
        let div = out.iter().find(|i| matches!(i, Inst::Div { .. })).unwrap();
        assert_eq!(div.sreg1(), Some(phys(x64::RAX)));
        assert_eq!(div.dreg(), Some(phys(x64::RAX)));
        let rhs = div.sreg2().and_then(|r| r.as_phys()).unwrap();
        assert_ne!(rhs, x64::RAX);
        assert_ne!(rhs, x64::RDX);
    }

    #[test]
    fn test_value_live_across_call_is_spilled_and_reloaded() {
        let insts = vec![
            Inst::Iconst { dst: v(0), value: 1 },
            Inst::Call {
                dst: None,
                target: CallTarget::Native("f".into()),
                out_regs: vec![],
            },
            Inst::Return { src: Some(v(0)) },
        ];
        let (out, summary) = run(insts, X64Isa.usable_regs()).unwrap();
        assert_eq!(summary.spills, 1);
        assert_eq!(summary.reloads, 1);
        assert!(matches!(out[0], Inst::Iconst { .. }));
        assert!(matches!(out[1], Inst::SpillStore { .. }));
        assert!(matches!(out[2], Inst::Call { .. }));
        assert!(matches!(out[3], Inst::SpillLoad { .. }));
        assert_eq!(out[4].sreg1(), Some(phys(x64::RAX)));
    }

    #[test]
    fn test_spill_slots_are_recycled() {
        let call = || Inst::Call {
            dst: None,
            target: CallTarget::Native("f".into()),
            out_regs: vec![],
        };
        let insts = vec![
            Inst::Iconst { dst: v(0), value: 1 },
            call(),
            Inst::AluImm {
                op: AluOp::Add,
                size: OpSize::S64,
                dst: v(1),
                lhs: v(0),
                imm: 1,
            },
            call(),
            Inst::Return { src: Some(v(1)) },
        ];
        let (out, summary) = run(insts, X64Isa.usable_regs()).unwrap();
        assert_eq!(summary.spills, 2);
        assert_eq!(summary.reloads, 2);
        assert_eq!(summary.spill_slots, 1);
        assert_eq!(out.len(), 9);
    }

    #[test]
    fn test_three_register_budget_spills() {
        let budget = RegMask::of(&[x64::RAX, x64::RCX, x64::RDX]);
        let mut insts: Vec<Inst> = (0..6)
            .map(|n| Inst::Iconst {
                dst: v(n),
                value: i64::from(n) + 1,
            })
            .collect();
        let mut acc = v(0);
        for n in 1..6 {
            let dst = v(5 + n);
            insts.push(Inst::Alu {
                op: AluOp::Add,
                size: OpSize::S64,
                dst,
                lhs: acc,
                rhs: v(n),
            });
            acc = dst;
        }
        insts.push(Inst::Return { src: Some(acc) });
        let (out, summary) = run(insts, budget).unwrap();
        assert!(summary.spills >= 1);
        assert!(summary.reloads >= 1);
        for ins in &out {
            for (reg, _) in ins.regs() {
                assert!(budget.contains(reg.as_phys().unwrap()), "{ins}");
            }
        }
    }

    #[test]
    fn test_duplicate_call_argument_is_copied() {
        let insts = vec![
            Inst::Iconst { dst: v(0), value: 4 },
            Inst::Call {
                dst: None,
                target: CallTarget::Native("f".into()),
                out_regs: vec![(v(0), x64::RDI), (v(0), x64::RSI)],
            },
            Inst::Return { src: None },
        ];
        let (out, _) = run(insts, X64Isa.usable_regs()).unwrap();
        assert_eq!(out[0].dreg(), Some(phys(x64::RSI)));
        assert_eq!(
            out[1],
            Inst::Move {
                dst: phys(x64::RDI),
                src: phys(x64::RSI)
            }
        );
        assert_eq!(
            out[2].out_regs(),
            &[(phys(x64::RDI), x64::RDI), (phys(x64::RSI), x64::RSI)]
        );
    }

    #[test]
    fn test_read_before_write_is_internal_error() {
        let insts = vec![Inst::Return { src: Some(v(3)) }];
        let err = run(insts, X64Isa.usable_regs()).unwrap_err();
        assert!(matches!(
            err,
            JitError::InternalCompilerError { index: 0, opcode: "ret", .. }
        ));
    }

    #[test]
    fn test_physical_operand_before_allocation_is_rejected() {
        let insts = vec![Inst::Iconst {
            dst: phys(x64::RAX),
            value: 1,
        }];
        assert!(matches!(
            run(insts, X64Isa.usable_regs()),
            Err(JitError::InternalCompilerError { .. })
        ));
    }

    #[test]
    fn test_spill_pool_defers_reuse() {
        let mut pool = SpillPool::new();
        let a = pool.take();
        pool.release(a);
        let b = pool.take();
        assert_ne!(a, b);
        pool.advance();
        assert_eq!(pool.take(), a);
        assert_eq!(pool.high_water(), 2);
    }

    #[test]
    fn test_dividend_copy_source_survives_second_source_allocation() {
        use crate::ir::interp::interpret;
        use crate::ir::parser::parse_method;

        let text = "\
method remkeep(i64, i64) -> i64 {
bb0:
  v0 = ldvar var0
  v1 = ldvar var1
  v2 = ori.i64 v1, 1
  v3 = remu.i64 v0, v2
  v4 = add.i64 v3, v0
  ret v4
}
";
        let original = parse_method(text).unwrap();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        for budget in [3usize, 4, 6] {
            let regs: Vec<AsmReg> = X64Isa.usable_regs().iter().take(budget).collect();
            let mut body = original.clone();
            allocate_method(&mut body, &X64Isa, Some(RegMask::of(&regs)), &session).unwrap();
            for args in [[47u64, 10], [5, 0], [u64::MAX, 6]] {
                assert_eq!(
                    interpret(&body, &args).unwrap(),
                    interpret(&original, &args).unwrap(),
                    "budget {budget} args {args:?}"
                );
            }
        }
    }
}
