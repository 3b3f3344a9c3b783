//! 32-bit x86 target: the stack-only cdecl calling convention.

pub mod calling_convention;

pub use calling_convention::CdeclConvention;

use crate::core::register_file::AsmReg;

pub const EAX: AsmReg = AsmReg::gp(0);
pub const ECX: AsmReg = AsmReg::gp(1);
pub const EDX: AsmReg = AsmReg::gp(2);
