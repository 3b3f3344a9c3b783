//! Encoding limits of the ARM data-processing and load/store forms.

use crate::codegen::lower::LoweringRules;
use crate::ir::{AluOp, MemSize, OpSize};

/// `value` is an 8-bit constant rotated right by an even amount.
pub fn is_rotated_imm8(value: u32) -> bool {
    (0..16).any(|r| value.rotate_left(2 * r) <= 0xff)
}

fn as_word(imm: i64) -> Option<u32> {
    if imm >= i64::from(i32::MIN) && imm <= i64::from(u32::MAX) {
        Some(imm as u32)
    } else {
        None
    }
}

fn fits_imm12(disp: i32) -> bool {
    (-4095..=4095).contains(&disp)
}

fn fits_imm8(disp: i32) -> bool {
    (-255..=255).contains(&disp)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ArmRules;

impl LoweringRules for ArmRules {
    fn alu_imm_ok(&self, op: AluOp, _size: OpSize, imm: i64) -> bool {
        match op {
            AluOp::Mul => false,
            _ => as_word(imm).is_some_and(is_rotated_imm8),
        }
    }

    fn cmp_imm_ok(&self, _size: OpSize, imm: i64) -> bool {
        as_word(imm).is_some_and(is_rotated_imm8)
    }

    fn mem_disp_ok(&self, size: MemSize, is_store: bool, disp: i32) -> bool {
        match size {
            // ldrd/strd are avoided; a doubleword is two word accesses.
            MemSize::I64 => fits_imm12(disp) && disp.checked_add(4).is_some_and(fits_imm12),
            MemSize::I32 | MemSize::U32 => fits_imm12(disp),
            MemSize::U8 => fits_imm12(disp),
            MemSize::I8 if is_store => fits_imm12(disp),
            MemSize::I8 | MemSize::I16 | MemSize::U16 => fits_imm8(disp),
        }
    }

    fn has_store_imm(&self) -> bool {
        false
    }

    fn store_imm_ok(&self, _size: MemSize, _imm: i64) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotated_immediates() {
        assert!(is_rotated_imm8(0));
        assert!(is_rotated_imm8(0xff));
        assert!(is_rotated_imm8(0xff00));
        assert!(is_rotated_imm8(0xf000_000f));
        assert!(is_rotated_imm8(0x3fc));
        assert!(!is_rotated_imm8(0x101));
        assert!(!is_rotated_imm8(0x102));
    }

    #[test]
    fn test_displacement_ranges() {
        let r = ArmRules;
        assert!(r.mem_disp_ok(MemSize::I32, false, 4095));
        assert!(!r.mem_disp_ok(MemSize::I32, false, 4096));
        assert!(r.mem_disp_ok(MemSize::U8, false, -4095));
        assert!(!r.mem_disp_ok(MemSize::I8, false, 256));
        assert!(r.mem_disp_ok(MemSize::I8, true, 256));
        assert!(!r.mem_disp_ok(MemSize::U16, true, 256));
        assert!(!r.mem_disp_ok(MemSize::I64, false, 4092));
    }

    #[test]
    fn test_no_multiply_immediate() {
        assert!(!ArmRules.alu_imm_ok(AluOp::Mul, OpSize::S32, 3));
        assert!(ArmRules.alu_imm_ok(AluOp::Add, OpSize::S32, 0x400));
        assert!(!ArmRules.alu_imm_ok(AluOp::Add, OpSize::S32, 0x401));
    }
}
