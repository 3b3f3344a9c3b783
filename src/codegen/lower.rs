// This module implements the lowering pass that runs between IR construction and register
// allocation. It walks a block in order and rewrites every instruction whose operands the
// target cannot encode, consulting a per-target LoweringRules value for the limits:
// immediates outside the encodable range are materialized with an Iconst into a fresh virtual
// register and the instruction switches to its register form; multiplications by constants
// are specialized (by one becomes a move, by zero a constant, by a power of two a left shift);
// memory accesses whose displacement does not fit the addressing mode get their address
// computed into a fresh register first and then use displacement zero; store-immediate
// becomes Iconst plus a register store on targets without that form, and the resulting store
// is checked again for its displacement. Inserted instructions always go immediately before
// the instruction they feed and never change the relative order of existing ones. An
// instruction that is already legal is left untouched, so running the pass twice gives the
// same block as running it once. Fresh registers come from the method's counter, and the
// block's watermark is raised to cover them.

//! IR-to-IR legalization of immediates and displacements.

use crate::core::error::{JitError, JitResult};
use crate::ir::{AluOp, BasicBlock, Inst, MemSize, MethodBody, OpSize, Reg, ShiftOp, VReg};

/// Encoding limits of one target.
pub trait LoweringRules {
    /// The immediate form of `op` accepts `imm`.
    fn alu_imm_ok(&self, op: AluOp, size: OpSize, imm: i64) -> bool;

    /// Compare-with-immediate accepts `imm`.
    fn cmp_imm_ok(&self, size: OpSize, imm: i64) -> bool;

    /// A memory access of `size` accepts displacement `disp`.
    fn mem_disp_ok(&self, size: MemSize, is_store: bool, disp: i32) -> bool;

    /// The target has a store-immediate form at all.
    fn has_store_imm(&self) -> bool;

    /// Store-immediate of `size` accepts `imm`.
    fn store_imm_ok(&self, size: MemSize, imm: i64) -> bool;
}

struct Lowerer<'a> {
    rules: &'a dyn LoweringRules,
    next_vreg: &'a mut u32,
    method: &'a str,
    block: u32,
}

impl Lowerer<'_> {
    fn fresh(&mut self) -> Reg {
        let v = VReg::new(*self.next_vreg);
        *self.next_vreg += 1;
        Reg::Virt(v)
    }

    fn constant(&mut self, value: i64, out: &mut Vec<Inst>) -> Reg {
        let dst = self.fresh();
        out.push(Inst::Iconst { dst, value });
        dst
    }

    /// Compute `base + disp` into a fresh register.
    fn address(&mut self, base: Reg, disp: i32, out: &mut Vec<Inst>) -> Reg {
        let dst = self.fresh();
        if self.rules.alu_imm_ok(AluOp::Add, OpSize::S64, i64::from(disp)) {
            out.push(Inst::AluImm {
                op: AluOp::Add,
                size: OpSize::S64,
                dst,
                lhs: base,
                imm: i64::from(disp),
            });
        } else {
            let rhs = self.constant(i64::from(disp), out);
            out.push(Inst::Alu {
                op: AluOp::Add,
                size: OpSize::S64,
                dst,
                lhs: base,
                rhs,
            });
        }
        dst
    }

    fn lower_mul_imm(&mut self, size: OpSize, dst: Reg, lhs: Reg, imm: i64, out: &mut Vec<Inst>) {
        let shift = imm.trailing_zeros();
        match imm {
            1 => out.push(Inst::Move { dst, src: lhs }),
            0 => out.push(Inst::Iconst { dst, value: 0 }),
            n if n > 0 && n & (n - 1) == 0 && shift < size.bits() => out.push(Inst::ShiftImm {
                op: ShiftOp::Shl,
                size,
                dst,
                lhs,
                imm: shift as u8,
            }),
            _ if self.rules.alu_imm_ok(AluOp::Mul, size, imm) => out.push(Inst::AluImm {
                op: AluOp::Mul,
                size,
                dst,
                lhs,
                imm,
            }),
            _ => {
                let rhs = self.constant(imm, out);
                out.push(Inst::Alu {
                    op: AluOp::Mul,
                    size,
                    dst,
                    lhs,
                    rhs,
                });
            }
        }
    }

    fn lower_inst(&mut self, index: usize, inst: Inst, out: &mut Vec<Inst>) -> JitResult<()> {
        match inst {
            Inst::AluImm {
                op: AluOp::Mul,
                size,
                dst,
                lhs,
                imm,
            } => self.lower_mul_imm(size, dst, lhs, imm, out),
            Inst::AluImm {
                op,
                size,
                dst,
                lhs,
                imm,
            } if !self.rules.alu_imm_ok(op, size, imm) => {
                let rhs = self.constant(imm, out);
                out.push(Inst::Alu {
                    op,
                    size,
                    dst,
                    lhs,
                    rhs,
                });
            }
            Inst::CmpImm { size, lhs, imm } if !self.rules.cmp_imm_ok(size, imm) => {
                let rhs = self.constant(imm, out);
                out.push(Inst::Cmp { size, lhs, rhs });
            }
            Inst::ShiftImm { imm, size, .. } if u32::from(imm) >= size.bits() => {
                return Err(JitError::at_inst(
                    self.method,
                    self.block,
                    index,
                    inst.name(),
                    format!("shift by {imm} exceeds operand width"),
                ));
            }
            Inst::Load {
                size,
                dst,
                base,
                disp,
            } if !self.rules.mem_disp_ok(size, false, disp) => {
                let base = self.address(base, disp, out);
                out.push(Inst::Load {
                    size,
                    dst,
                    base,
                    disp: 0,
                });
            }
            Inst::Store {
                size,
                base,
                disp,
                src,
            } if !self.rules.mem_disp_ok(size, true, disp) => {
                let base = self.address(base, disp, out);
                out.push(Inst::Store {
                    size,
                    base,
                    disp: 0,
                    src,
                });
            }
            Inst::StoreImm {
                size,
                base,
                disp,
                imm,
            } if !self.rules.has_store_imm() || !self.rules.store_imm_ok(size, imm) => {
                let src = self.constant(imm, out);
                let store = Inst::Store {
                    size,
                    base,
                    disp,
                    src,
                };
                return self.lower_inst(index, store, out);
            }
            Inst::StoreImm {
                size,
                base,
                disp,
                imm,
            } if !self.rules.mem_disp_ok(size, true, disp) => {
                let base = self.address(base, disp, out);
                out.push(Inst::StoreImm {
                    size,
                    base,
                    disp: 0,
                    imm,
                });
            }
            other => out.push(other),
        }
        Ok(())
    }
}

/// Legalize one block in place, drawing fresh registers from `next_vreg`.
pub fn lower_block(
    block: &mut BasicBlock,
    next_vreg: &mut u32,
    rules: &dyn LoweringRules,
    method: &str,
) -> JitResult<()> {
    let before = block.insts.len();
    let insts = std::mem::take(&mut block.insts);
    let mut out = Vec::with_capacity(insts.len());
    let mut lowerer = Lowerer {
        rules,
        next_vreg,
        method,
        block: block.id.0,
    };
    for (index, inst) in insts.into_iter().enumerate() {
        lowerer.lower_inst(index, inst, &mut out)?;
    }
    block.insts = out;
    block.max_vreg = block.max_vreg.max(*next_vreg);
    if block.insts.len() != before {
        log::trace!(
            "lowered {}: {} -> {} instructions",
            block.id,
            before,
            block.insts.len()
        );
    }
    Ok(())
}

/// Legalize every block of `body`.
pub fn lower_method(body: &mut MethodBody, rules: &dyn LoweringRules) -> JitResult<()> {
    let mut next = body.next_vreg;
    for block in &mut body.blocks {
        lower_block(block, &mut next, rules, &body.name)?;
    }
    body.next_vreg = next;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::ArmRules;
    use crate::ir::BlockId;
    use crate::x64::X64Rules;

    fn v(n: u32) -> Reg {
        Reg::Virt(VReg::new(n))
    }

    fn block(insts: Vec<Inst>) -> BasicBlock {
        let mut b = BasicBlock::new(BlockId(0));
        b.insts = insts;
        b.max_vreg = 10;
        b
    }

    #[test]
    fn test_large_immediate_is_materialized_before_use() {
        let mut b = block(vec![Inst::AluImm {
            op: AluOp::Add,
            size: OpSize::S32,
            dst: v(1),
            lhs: v(0),
            imm: 0x101,
        }]);
        let mut next = 10;
        lower_block(&mut b, &mut next, &ArmRules, "t").unwrap();
        assert_eq!(
            b.insts,
            vec![
                Inst::Iconst {
                    dst: v(10),
                    value: 0x101
                },
                Inst::Alu {
                    op: AluOp::Add,
                    size: OpSize::S32,
                    dst: v(1),
                    lhs: v(0),
                    rhs: v(10)
                },
            ]
        );
        assert_eq!(next, 11);
        assert_eq!(b.max_vreg, 11);
    }

    #[test]
    fn test_multiply_specializations() {
        let mul = |imm| Inst::AluImm {
            op: AluOp::Mul,
            size: OpSize::S64,
            dst: v(1),
            lhs: v(0),
            imm,
        };
        let mut b = block(vec![mul(1), mul(0), mul(8), mul(12)]);
        let mut next = 10;
        lower_block(&mut b, &mut next, &ArmRules, "t").unwrap();
        assert_eq!(b.insts[0], Inst::Move { dst: v(1), src: v(0) });
        assert_eq!(b.insts[1], Inst::Iconst { dst: v(1), value: 0 });
        assert_eq!(
            b.insts[2],
            Inst::ShiftImm {
                op: ShiftOp::Shl,
                size: OpSize::S64,
                dst: v(1),
                lhs: v(0),
                imm: 3
            }
        );
        assert_eq!(b.insts[3], Inst::Iconst { dst: v(10), value: 12 });
        assert!(matches!(b.insts[4], Inst::Alu { op: AluOp::Mul, .. }));
    }

    #[test]
    fn test_x64_keeps_three_operand_multiply() {
        let mut b = block(vec![Inst::AluImm {
            op: AluOp::Mul,
            size: OpSize::S32,
            dst: v(1),
            lhs: v(0),
            imm: 12,
        }]);
        let expected = b.insts.clone();
        let mut next = 10;
        lower_block(&mut b, &mut next, &X64Rules, "t").unwrap();
        assert_eq!(b.insts, expected);
    }

    #[test]
    fn test_far_displacement_is_split() {
        let mut b = block(vec![Inst::Load {
            size: MemSize::I32,
            dst: v(1),
            base: v(0),
            disp: 5000,
        }]);
        let mut next = 10;
        lower_block(&mut b, &mut next, &ArmRules, "t").unwrap();
        assert_eq!(b.insts.len(), 3);
        assert_eq!(b.insts[0], Inst::Iconst { dst: v(11), value: 5000 });
        assert_eq!(
            b.insts[1],
            Inst::Alu {
                op: AluOp::Add,
                size: OpSize::S64,
                dst: v(10),
                lhs: v(0),
                rhs: v(11)
            }
        );
        assert_eq!(
            b.insts[2],
            Inst::Load {
                size: MemSize::I32,
                dst: v(1),
                base: v(10),
                disp: 0
            }
        );
    }

    #[test]
    fn test_store_immediate_without_native_form() {
        let mut b = block(vec![Inst::StoreImm {
            size: MemSize::U16,
            base: v(0),
            disp: 300,
            imm: 7,
        }]);
        let mut next = 10;
        lower_block(&mut b, &mut next, &ArmRules, "t").unwrap();
        assert_eq!(b.insts[0], Inst::Iconst { dst: v(10), value: 7 });
        assert!(matches!(
            b.insts.last(),
            Some(Inst::Store { disp: 0, src, .. }) if *src == v(10)
        ));
    }

    #[test]
    fn test_lowering_is_idempotent() {
        let insts = vec![
            Inst::AluImm {
                op: AluOp::Sub,
                size: OpSize::S32,
                dst: v(1),
                lhs: v(0),
                imm: 100_000,
            },
            Inst::CmpImm {
                size: OpSize::S32,
                lhs: v(1),
                imm: -3,
            },
            Inst::StoreImm {
                size: MemSize::I32,
                base: v(2),
                disp: 8000,
                imm: 0x12345,
            },
            Inst::AluImm {
                op: AluOp::Mul,
                size: OpSize::S32,
                dst: v(3),
                lhs: v(1),
                imm: 16,
            },
        ];
        for rules in [&ArmRules as &dyn LoweringRules, &X64Rules] {
            let mut once = block(insts.clone());
            let mut next = 10;
            lower_block(&mut once, &mut next, rules, "t").unwrap();
            let mut twice = once.clone();
            lower_block(&mut twice, &mut next, rules, "t").unwrap();
            assert_eq!(once.insts, twice.insts);
        }
    }

    #[test]
    fn test_oversized_shift_is_internal_error() {
        let mut b = block(vec![Inst::ShiftImm {
            op: ShiftOp::Shl,
            size: OpSize::S32,
            dst: v(1),
            lhs: v(0),
            imm: 32,
        }]);
        let mut next = 10;
        let err = lower_block(&mut b, &mut next, &X64Rules, "M").unwrap_err();
        assert!(matches!(err, JitError::InternalCompilerError { index: 0, .. }));
    }
}
