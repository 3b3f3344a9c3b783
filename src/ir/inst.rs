// This module defines the instruction enum of the rtjit IR. Every opcode is its own variant
// carrying exactly the operands it needs, so lowering, allocation and encoding match
// exhaustively instead of reading untyped operand slots. The allocator does not look at
// variants directly; it works through a uniform operand view modelled on three-address code:
// an optional destination (`dreg`), up to two sources (`sreg1`, `sreg2`) and, for calls, the
// list of argument registers that must hold specific values at the call. Stores expose their
// base address register as a "base destination": it occupies the destination slot of the view
// but is read, never written, which lets the allocator keep the value live through the store.

//! IR instructions and their register operand views.

use super::{BlockId, MethodId, Reg, SpillSlot, VarId};
use crate::core::register_file::AsmReg;

/// Operand width of integer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpSize {
    S32,
    S64,
}

impl OpSize {
    pub fn bits(&self) -> u32 {
        match self {
            OpSize::S32 => 32,
            OpSize::S64 => 64,
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            OpSize::S32 => "i32",
            OpSize::S64 => "i64",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
}

impl AluOp {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::Sub => "sub",
            AluOp::Mul => "mul",
            AluOp::And => "and",
            AluOp::Or => "or",
            AluOp::Xor => "xor",
        }
    }

    pub fn from_mnemonic(s: &str) -> Option<Self> {
        Some(match s {
            "add" => AluOp::Add,
            "sub" => AluOp::Sub,
            "mul" => AluOp::Mul,
            "and" => AluOp::And,
            "or" => AluOp::Or,
            "xor" => AluOp::Xor,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShiftOp {
    Shl,
    /// Logical right shift.
    Shr,
    /// Arithmetic right shift.
    Sar,
}

impl ShiftOp {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            ShiftOp::Shl => "shl",
            ShiftOp::Shr => "shr",
            ShiftOp::Sar => "sar",
        }
    }

    pub fn from_mnemonic(s: &str) -> Option<Self> {
        Some(match s {
            "shl" => ShiftOp::Shl,
            "shr" => ShiftOp::Shr,
            "sar" => ShiftOp::Sar,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// Branch and set conditions over the flags of the last compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Ltu,
    Leu,
    Gtu,
    Geu,
}

impl Cond {
    pub const ALL: [Cond; 10] = [
        Cond::Eq,
        Cond::Ne,
        Cond::Lt,
        Cond::Le,
        Cond::Gt,
        Cond::Ge,
        Cond::Ltu,
        Cond::Leu,
        Cond::Gtu,
        Cond::Geu,
    ];

    pub fn mnemonic(&self) -> &'static str {
        match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Lt => "lt",
            Cond::Le => "le",
            Cond::Gt => "gt",
            Cond::Ge => "ge",
            Cond::Ltu => "ltu",
            Cond::Leu => "leu",
            Cond::Gtu => "gtu",
            Cond::Geu => "geu",
        }
    }

    pub fn from_mnemonic(s: &str) -> Option<Self> {
        Cond::ALL.iter().copied().find(|c| c.mnemonic() == s)
    }

    /// Evaluate the condition on two operands of width `size`.
    pub fn eval(&self, a: u64, b: u64, size: OpSize) -> bool {
        let (ua, ub, sa, sb) = match size {
            OpSize::S32 => (
                u64::from(a as u32),
                u64::from(b as u32),
                i64::from(a as u32 as i32),
                i64::from(b as u32 as i32),
            ),
            OpSize::S64 => (a, b, a as i64, b as i64),
        };
        match self {
            Cond::Eq => ua == ub,
            Cond::Ne => ua != ub,
            Cond::Lt => sa < sb,
            Cond::Le => sa <= sb,
            Cond::Gt => sa > sb,
            Cond::Ge => sa >= sb,
            Cond::Ltu => ua < ub,
            Cond::Leu => ua <= ub,
            Cond::Gtu => ua > ub,
            Cond::Geu => ua >= ub,
        }
    }
}

/// Width and signedness of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemSize {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
}

impl MemSize {
    pub fn bytes(&self) -> u32 {
        match self {
            MemSize::I8 | MemSize::U8 => 1,
            MemSize::I16 | MemSize::U16 => 2,
            MemSize::I32 | MemSize::U32 => 4,
            MemSize::I64 => 8,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, MemSize::I8 | MemSize::I16 | MemSize::I32)
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            MemSize::I8 => "i8",
            MemSize::U8 => "u8",
            MemSize::I16 => "i16",
            MemSize::U16 => "u16",
            MemSize::I32 => "i32",
            MemSize::U32 => "u32",
            MemSize::I64 => "i64",
        }
    }

    pub fn from_suffix(s: &str) -> Option<Self> {
        Some(match s {
            "i8" => MemSize::I8,
            "u8" => MemSize::U8,
            "i16" => MemSize::I16,
            "u16" => MemSize::U16,
            "i32" => MemSize::I32,
            "u32" => MemSize::U32,
            "i64" => MemSize::I64,
            _ => return None,
        })
    }

    /// Narrow or extend a raw 64-bit value as a load of this size would.
    pub fn extend(&self, raw: u64) -> u64 {
        match self {
            MemSize::I8 => raw as u8 as i8 as i64 as u64,
            MemSize::U8 => u64::from(raw as u8),
            MemSize::I16 => raw as u16 as i16 as i64 as u64,
            MemSize::U16 => u64::from(raw as u16),
            MemSize::I32 => raw as u32 as i32 as i64 as u64,
            MemSize::U32 => u64::from(raw as u32),
            MemSize::I64 => raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallTarget {
    Method(MethodId),
    /// Native function resolved by name at patch time.
    Native(String),
    Address(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inst {
    Nop,
    Iconst {
        dst: Reg,
        value: i64,
    },
    Move {
        dst: Reg,
        src: Reg,
    },
    Alu {
        op: AluOp,
        size: OpSize,
        dst: Reg,
        lhs: Reg,
        rhs: Reg,
    },
    AluImm {
        op: AluOp,
        size: OpSize,
        dst: Reg,
        lhs: Reg,
        imm: i64,
    },
    Shift {
        op: ShiftOp,
        size: OpSize,
        dst: Reg,
        lhs: Reg,
        count: Reg,
    },
    ShiftImm {
        op: ShiftOp,
        size: OpSize,
        dst: Reg,
        lhs: Reg,
        imm: u8,
    },
    Div {
        signed: bool,
        rem: bool,
        size: OpSize,
        dst: Reg,
        lhs: Reg,
        rhs: Reg,
    },
    Unary {
        op: UnaryOp,
        size: OpSize,
        dst: Reg,
        src: Reg,
    },
    Cmp {
        size: OpSize,
        lhs: Reg,
        rhs: Reg,
    },
    CmpImm {
        size: OpSize,
        lhs: Reg,
        imm: i64,
    },
    SetCc {
        cond: Cond,
        dst: Reg,
    },
    Load {
        size: MemSize,
        dst: Reg,
        base: Reg,
        disp: i32,
    },
    Store {
        size: MemSize,
        base: Reg,
        disp: i32,
        src: Reg,
    },
    StoreImm {
        size: MemSize,
        base: Reg,
        disp: i32,
        imm: i64,
    },
    LoadVar {
        dst: Reg,
        var: VarId,
    },
    StoreVar {
        var: VarId,
        src: Reg,
    },
    VarAddr {
        dst: Reg,
        var: VarId,
    },
    SpillLoad {
        dst: Reg,
        slot: SpillSlot,
    },
    SpillStore {
        slot: SpillSlot,
        src: Reg,
    },
    /// Store an outgoing stack argument at `[sp + offset]`.
    OutArg {
        offset: u32,
        src: Reg,
    },
    /// Dynamic stack allocation of `size` bytes; the result is the block address.
    Localloc {
        dst: Reg,
        size: Reg,
    },
    /// Address of an exception clause entry, resolved lazily by the exception collaborator.
    ExcAddr {
        dst: Reg,
        clause: u32,
    },
    Jump {
        target: BlockId,
    },
    Branch {
        cond: Cond,
        taken: BlockId,
        not_taken: BlockId,
    },
    Call {
        dst: Option<Reg>,
        target: CallTarget,
        out_regs: Vec<(Reg, AsmReg)>,
    },
    /// Indirect call through `[vtable + disp]`.
    CallVirt {
        dst: Option<Reg>,
        vtable: Reg,
        disp: i32,
        out_regs: Vec<(Reg, AsmReg)>,
    },
    Return {
        src: Option<Reg>,
    },
}

/// How an instruction touches a register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegRole {
    Def,
    Use,
}

impl Inst {
    /// Opcode name, as printed in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Inst::Nop => "nop",
            Inst::Iconst { .. } => "iconst",
            Inst::Move { .. } => "mov",
            Inst::Alu { .. } => "alu",
            Inst::AluImm { .. } => "alu_imm",
            Inst::Shift { .. } => "shift",
            Inst::ShiftImm { .. } => "shift_imm",
            Inst::Div { .. } => "div",
            Inst::Unary { .. } => "unary",
            Inst::Cmp { .. } => "cmp",
            Inst::CmpImm { .. } => "cmp_imm",
            Inst::SetCc { .. } => "setcc",
            Inst::Load { .. } => "load",
            Inst::Store { .. } => "store",
            Inst::StoreImm { .. } => "store_imm",
            Inst::LoadVar { .. } => "ldvar",
            Inst::StoreVar { .. } => "stvar",
            Inst::VarAddr { .. } => "varaddr",
            Inst::SpillLoad { .. } => "spill_load",
            Inst::SpillStore { .. } => "spill_store",
            Inst::OutArg { .. } => "outarg",
            Inst::Localloc { .. } => "localloc",
            Inst::ExcAddr { .. } => "ehaddr",
            Inst::Jump { .. } => "jmp",
            Inst::Branch { .. } => "br",
            Inst::Call { .. } => "call",
            Inst::CallVirt { .. } => "callvirt",
            Inst::Return { .. } => "ret",
        }
    }

    /// Destination operand; for stores this is the base address register.
    pub fn dreg(&self) -> Option<Reg> {
        match self {
            Inst::Iconst { dst, .. }
            | Inst::Move { dst, .. }
            | Inst::Alu { dst, .. }
            | Inst::AluImm { dst, .. }
            | Inst::Shift { dst, .. }
            | Inst::ShiftImm { dst, .. }
            | Inst::Div { dst, .. }
            | Inst::Unary { dst, .. }
            | Inst::SetCc { dst, .. }
            | Inst::Load { dst, .. }
            | Inst::LoadVar { dst, .. }
            | Inst::VarAddr { dst, .. }
            | Inst::SpillLoad { dst, .. }
            | Inst::Localloc { dst, .. }
            | Inst::ExcAddr { dst, .. } => Some(*dst),
            Inst::Store { base, .. } | Inst::StoreImm { base, .. } => Some(*base),
            Inst::Call { dst, .. } | Inst::CallVirt { dst, .. } => *dst,
            _ => None,
        }
    }

    pub fn dreg_mut(&mut self) -> Option<&mut Reg> {
        match self {
            Inst::Iconst { dst, .. }
            | Inst::Move { dst, .. }
            | Inst::Alu { dst, .. }
            | Inst::AluImm { dst, .. }
            | Inst::Shift { dst, .. }
            | Inst::ShiftImm { dst, .. }
            | Inst::Div { dst, .. }
            | Inst::Unary { dst, .. }
            | Inst::SetCc { dst, .. }
            | Inst::Load { dst, .. }
            | Inst::LoadVar { dst, .. }
            | Inst::VarAddr { dst, .. }
            | Inst::SpillLoad { dst, .. }
            | Inst::Localloc { dst, .. }
            | Inst::ExcAddr { dst, .. } => Some(dst),
            Inst::Store { base, .. } | Inst::StoreImm { base, .. } => Some(base),
            Inst::Call { dst, .. } | Inst::CallVirt { dst, .. } => dst.as_mut(),
            _ => None,
        }
    }

    /// The destination slot holds a base address that is read, not written.
    pub fn dreg_is_base(&self) -> bool {
        matches!(self, Inst::Store { .. } | Inst::StoreImm { .. })
    }

    pub fn sreg1(&self) -> Option<Reg> {
        match self {
            Inst::Move { src, .. }
            | Inst::Unary { src, .. }
            | Inst::StoreVar { src, .. }
            | Inst::SpillStore { src, .. }
            | Inst::OutArg { src, .. }
            | Inst::Store { src, .. } => Some(*src),
            Inst::Alu { lhs, .. }
            | Inst::AluImm { lhs, .. }
            | Inst::Shift { lhs, .. }
            | Inst::ShiftImm { lhs, .. }
            | Inst::Div { lhs, .. }
            | Inst::Cmp { lhs, .. }
            | Inst::CmpImm { lhs, .. } => Some(*lhs),
            Inst::Load { base, .. } => Some(*base),
            Inst::Localloc { size, .. } => Some(*size),
            Inst::CallVirt { vtable, .. } => Some(*vtable),
            Inst::Return { src } => *src,
            _ => None,
        }
    }

    pub fn sreg1_mut(&mut self) -> Option<&mut Reg> {
        match self {
            Inst::Move { src, .. }
            | Inst::Unary { src, .. }
            | Inst::StoreVar { src, .. }
            | Inst::SpillStore { src, .. }
            | Inst::OutArg { src, .. }
            | Inst::Store { src, .. } => Some(src),
            Inst::Alu { lhs, .. }
            | Inst::AluImm { lhs, .. }
            | Inst::Shift { lhs, .. }
            | Inst::ShiftImm { lhs, .. }
            | Inst::Div { lhs, .. }
            | Inst::Cmp { lhs, .. }
            | Inst::CmpImm { lhs, .. } => Some(lhs),
            Inst::Load { base, .. } => Some(base),
            Inst::Localloc { size, .. } => Some(size),
            Inst::CallVirt { vtable, .. } => Some(vtable),
            Inst::Return { src } => src.as_mut(),
            _ => None,
        }
    }

    pub fn sreg2(&self) -> Option<Reg> {
        match self {
            Inst::Alu { rhs, .. } | Inst::Div { rhs, .. } | Inst::Cmp { rhs, .. } => Some(*rhs),
            Inst::Shift { count, .. } => Some(*count),
            _ => None,
        }
    }

    pub fn sreg2_mut(&mut self) -> Option<&mut Reg> {
        match self {
            Inst::Alu { rhs, .. } | Inst::Div { rhs, .. } | Inst::Cmp { rhs, .. } => Some(rhs),
            Inst::Shift { count, .. } => Some(count),
            _ => None,
        }
    }

    /// Values that must sit in fixed argument registers at a call.
    pub fn out_regs(&self) -> &[(Reg, AsmReg)] {
        match self {
            Inst::Call { out_regs, .. } | Inst::CallVirt { out_regs, .. } => out_regs,
            _ => &[],
        }
    }

    pub fn out_regs_mut(&mut self) -> Option<&mut Vec<(Reg, AsmReg)>> {
        match self {
            Inst::Call { out_regs, .. } | Inst::CallVirt { out_regs, .. } => Some(out_regs),
            _ => None,
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Inst::Call { .. } | Inst::CallVirt { .. })
    }

    pub fn is_move(&self) -> bool {
        matches!(self, Inst::Move { .. })
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Inst::Jump { .. } | Inst::Branch { .. } | Inst::Return { .. }
        )
    }

    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Inst::Jump { target } => vec![*target],
            Inst::Branch {
                taken, not_taken, ..
            } => vec![*taken, *not_taken],
            _ => Vec::new(),
        }
    }

    /// Visit every register operand with its role, uses before the definition.
    pub fn for_each_reg_mut(&mut self, mut f: impl FnMut(&mut Reg, RegRole)) {
        let base = self.dreg_is_base();
        if let Some(r) = self.sreg1_mut() {
            f(r, RegRole::Use);
        }
        if let Some(r) = self.sreg2_mut() {
            f(r, RegRole::Use);
        }
        if let Some(out) = self.out_regs_mut() {
            for (r, _) in out.iter_mut() {
                f(r, RegRole::Use);
            }
        }
        if let Some(r) = self.dreg_mut() {
            f(r, if base { RegRole::Use } else { RegRole::Def });
        }
    }

    /// All register operands with their roles.
    pub fn regs(&self) -> Vec<(Reg, RegRole)> {
        let mut out = Vec::new();
        let mut copy = self.clone();
        copy.for_each_reg_mut(|r, role| out.push((*r, role)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::VReg;

    fn v(n: u32) -> Reg {
        Reg::Virt(VReg::new(n))
    }

    #[test]
    fn test_store_base_is_read() {
        let st = Inst::Store {
            size: MemSize::I64,
            base: v(1),
            disp: 8,
            src: v(2),
        };
        assert!(st.dreg_is_base());
        assert_eq!(st.dreg(), Some(v(1)));
        assert_eq!(st.sreg1(), Some(v(2)));
        let roles = st.regs();
        assert!(roles.iter().all(|(_, role)| *role == RegRole::Use));
    }

    #[test]
    fn test_operand_views() {
        let mut shift = Inst::Shift {
            op: ShiftOp::Shl,
            size: OpSize::S64,
            dst: v(3),
            lhs: v(1),
            count: v(2),
        };
        assert_eq!(shift.sreg2(), Some(v(2)));
        if let Some(r) = shift.sreg2_mut() {
            *r = v(9);
        }
        assert_eq!(shift.sreg2(), Some(v(9)));

        let call = Inst::Call {
            dst: None,
            target: CallTarget::Address(0),
            out_regs: vec![(v(4), AsmReg::gp(7))],
        };
        assert_eq!(call.dreg(), None);
        assert_eq!(call.out_regs().len(), 1);
        assert!(call.is_call());
    }

    #[test]
    fn test_cond_eval_respects_width() {
        assert!(Cond::Lt.eval(0xffff_ffff, 0, OpSize::S32));
        assert!(!Cond::Lt.eval(0xffff_ffff, 0, OpSize::S64));
        assert!(Cond::Gtu.eval(0xffff_ffff, 0, OpSize::S32));
        assert!(Cond::Eq.eval(0x1_0000_0005, 5, OpSize::S32));
    }

    #[test]
    fn test_mem_size_extend() {
        assert_eq!(MemSize::I8.extend(0xff), u64::MAX);
        assert_eq!(MemSize::U8.extend(0x1ff), 0xff);
        assert_eq!(MemSize::I32.extend(0x8000_0000), 0xffff_ffff_8000_0000);
    }
}
