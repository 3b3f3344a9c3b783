//! x86-64 architecture-specific components.
//!
//! This module contains all x86-64 specific code:
//! - System V calling convention
//! - Lowering rules (immediate and displacement ranges)
//! - Register constraints and the instruction encoder built on iced-x86

pub mod calling_convention;
pub mod encoder;
pub mod isa;
pub mod lowering;

pub use calling_convention::SysVConvention;
pub use isa::X64Isa;
pub use lowering::X64Rules;

use crate::core::register_file::{AsmReg, RegMask};

pub const RAX: AsmReg = AsmReg::gp(0);
pub const RCX: AsmReg = AsmReg::gp(1);
pub const RDX: AsmReg = AsmReg::gp(2);
pub const RBX: AsmReg = AsmReg::gp(3);
pub const RSP: AsmReg = AsmReg::gp(4);
pub const RBP: AsmReg = AsmReg::gp(5);
pub const RSI: AsmReg = AsmReg::gp(6);
pub const RDI: AsmReg = AsmReg::gp(7);
pub const R8: AsmReg = AsmReg::gp(8);
pub const R9: AsmReg = AsmReg::gp(9);
pub const R10: AsmReg = AsmReg::gp(10);
pub const R11: AsmReg = AsmReg::gp(11);
pub const R12: AsmReg = AsmReg::gp(12);
pub const R13: AsmReg = AsmReg::gp(13);
pub const R14: AsmReg = AsmReg::gp(14);
pub const R15: AsmReg = AsmReg::gp(15);

/// Number of general purpose registers.
pub const GP_REG_COUNT: u8 = 16;

/// Registers the callee must preserve.
pub const CALLEE_SAVED: RegMask = RegMask::from_bits(
    (1 << 3) | (1 << 12) | (1 << 13) | (1 << 14) | (1 << 15),
);

/// Registers a call may clobber.
pub const CALLER_SAVED: RegMask = RegMask::from_bits(
    (1 << 0) | (1 << 1) | (1 << 2) | (1 << 6) | (1 << 7) | (1 << 8) | (1 << 9) | (1 << 10) | (1 << 11),
);

/// Registers the allocator may hand out: everything except the stack and frame
/// pointers and the two scratch registers used by emitted sequences.
pub const USABLE: RegMask = RegMask::from_bits(0xffff & !((1 << 4) | (1 << 5) | (1 << 10) | (1 << 11)));

pub fn reg_name(reg: AsmReg) -> &'static str {
    const NAMES: [&str; 16] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];
    NAMES.get(reg.id as usize).copied().unwrap_or("?")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_sets() {
        assert!(!USABLE.contains(RSP));
        assert!(!USABLE.contains(RBP));
        assert!(!USABLE.contains(R11));
        assert_eq!(USABLE.count(), 12);
        assert!(CALLEE_SAVED.intersect(CALLER_SAVED).is_empty());
        assert_eq!(reg_name(R12), "r12");
    }
}
