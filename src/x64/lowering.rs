//! x86-64 immediate and displacement limits.

use crate::codegen::lower::LoweringRules;
use crate::ir::{AluOp, MemSize, OpSize};

fn fits_i32(imm: i64) -> bool {
    i32::try_from(imm).is_ok()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct X64Rules;

impl LoweringRules for X64Rules {
    fn alu_imm_ok(&self, _op: AluOp, size: OpSize, imm: i64) -> bool {
        // 32-bit forms take any value that truncates without loss.
        match size {
            OpSize::S32 => fits_i32(imm) || u32::try_from(imm).is_ok(),
            OpSize::S64 => fits_i32(imm),
        }
    }

    fn cmp_imm_ok(&self, size: OpSize, imm: i64) -> bool {
        self.alu_imm_ok(AluOp::Sub, size, imm)
    }

    fn mem_disp_ok(&self, _size: MemSize, _is_store: bool, _disp: i32) -> bool {
        true
    }

    fn has_store_imm(&self) -> bool {
        true
    }

    fn store_imm_ok(&self, size: MemSize, imm: i64) -> bool {
        match size {
            MemSize::I64 => fits_i32(imm),
            MemSize::I8 | MemSize::U8 => i8::try_from(imm).is_ok() || u8::try_from(imm).is_ok(),
            MemSize::I16 | MemSize::U16 => i16::try_from(imm).is_ok() || u16::try_from(imm).is_ok(),
            MemSize::I32 | MemSize::U32 => fits_i32(imm) || u32::try_from(imm).is_ok(),
        }
    }
}
