//! 32-bit ARM target: calling convention and lowering rules.
//!
//! No encoder is provided for this target; its rules are exercised by the
//! calling-convention and lowering passes only.

pub mod calling_convention;
pub mod lowering;

pub use calling_convention::ArmConvention;
pub use lowering::{is_rotated_imm8, ArmRules};

use crate::core::register_file::{AsmReg, RegMask};

pub const R0: AsmReg = AsmReg::gp(0);
pub const R1: AsmReg = AsmReg::gp(1);
pub const R2: AsmReg = AsmReg::gp(2);
pub const R3: AsmReg = AsmReg::gp(3);
pub const FP: AsmReg = AsmReg::gp(11);
pub const IP: AsmReg = AsmReg::gp(12);
pub const SP: AsmReg = AsmReg::gp(13);
pub const LR: AsmReg = AsmReg::gp(14);

/// r4-r11.
pub const CALLEE_SAVED: RegMask = RegMask::from_bits(0x0ff0);
