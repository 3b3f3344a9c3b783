//! The x86-64 System V target.

use super::encoder::X64Encoder;
use super::{SysVConvention, X64Rules, CALLEE_SAVED, CALLER_SAVED, RAX, RCX, RDX, USABLE};
use crate::codegen::abi::CallingConvention;
use crate::codegen::emit::EmitContext;
use crate::codegen::frame::{FrameLayout, FrameParams};
use crate::codegen::lower::LoweringRules;
use crate::codegen::{Clobber, InstConstraints, TargetIsa};
use crate::core::error::JitResult;
use crate::core::register_file::RegMask;
use crate::ir::{AluOp, Inst};

/// Bytes reserved for the unwind record linked by the prologue.
pub const LMF_SIZE: u32 = 32;

const MAX_INST_LEN: usize = 32;

#[derive(Debug, Default, Clone, Copy)]
pub struct X64Isa;

impl X64Isa {
    fn epilogue_bound(frame: &FrameLayout) -> usize {
        128 + 2 * frame.pushes() as usize
    }
}

impl TargetIsa for X64Isa {
    fn name(&self) -> &'static str {
        "x86_64"
    }

    fn calling_convention(&self) -> &dyn CallingConvention {
        &SysVConvention
    }

    fn lowering_rules(&self) -> &dyn LoweringRules {
        &X64Rules
    }

    fn usable_regs(&self) -> RegMask {
        USABLE
    }

    fn caller_saved(&self) -> RegMask {
        CALLER_SAVED
    }

    fn callee_saved(&self) -> RegMask {
        CALLEE_SAVED
    }

    fn frame_params(&self) -> FrameParams {
        FrameParams {
            word: 8,
            stack_align: 16,
            callee_saved: CALLEE_SAVED,
            lmf_size: LMF_SIZE,
        }
    }

    fn constraints(&self, inst: &Inst) -> InstConstraints {
        let two_operand = InstConstraints {
            clobber: Clobber::Sreg1,
            ..InstConstraints::default()
        };
        match inst {
            Inst::AluImm { op: AluOp::Mul, .. } => InstConstraints::default(),
            Inst::Alu { .. }
            | Inst::AluImm { .. }
            | Inst::ShiftImm { .. }
            | Inst::Unary { .. }
            | Inst::Localloc { .. } => two_operand,
            Inst::Shift { .. } => InstConstraints {
                dest_sreg2: Some(RCX),
                ..two_operand
            },
            Inst::Div { rem, .. } => InstConstraints {
                dest_dreg: Some(if *rem { RDX } else { RAX }),
                dest_sreg1: Some(RAX),
                clobber: Clobber::Reg(if *rem { RAX } else { RDX }),
                sreg2_exclude: RegMask::of(&[RAX, RDX]),
                ..InstConstraints::default()
            },
            Inst::Call { .. } | Inst::CallVirt { .. } => InstConstraints {
                dest_dreg: Some(RAX),
                clobber: Clobber::Call,
                ..InstConstraints::default()
            },
            Inst::Return { src: Some(_) } => InstConstraints {
                dest_sreg1: Some(RAX),
                ..InstConstraints::default()
            },
            _ => InstConstraints::default(),
        }
    }

    fn max_length(&self, inst: &Inst, frame: &FrameLayout) -> usize {
        match inst {
            Inst::Return { .. } => Self::epilogue_bound(frame),
            _ => MAX_INST_LEN,
        }
    }

    fn max_prologue_length(&self, frame: &FrameLayout) -> usize {
        160 + 24 * frame.vars.len() + 2 * frame.pushes() as usize
    }

    fn emit_prologue(&self, ctx: &mut EmitContext<'_>) -> JitResult<()> {
        let mut enc = X64Encoder::new(ctx)?;
        enc.prologue()?;
        enc.finish()
    }

    fn encode(&self, ctx: &mut EmitContext<'_>, inst: &Inst) -> JitResult<()> {
        let mut enc = X64Encoder::new(ctx)?;
        enc.encode(inst)?;
        enc.finish()
    }
}
