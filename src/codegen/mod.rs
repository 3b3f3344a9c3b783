// Target-independent half of the backend. Each stage lives in its own module: `abi` holds the
// calling-convention data model and trait, `globals` demotes virtual registers that cross block
// boundaries, `lower` rewrites unencodable operands, `regalloc` is the local register
// allocator, `frame` lays out the stack frame, `emit` drives per-instruction encoding into a
// growable buffer and `patch` resolves the recorded patch sites. Everything that differs
// between architectures is reached through the `TargetIsa` trait defined here: the register
// universe, the calling convention, the lowering rules, the per-instruction register
// constraints consulted by the allocator, and the encoder itself. A target describes each
// instruction's fixed-register requirements with an `InstConstraints` value instead of a
// global opcode-indexed table.

//! Target-independent code generation and the target interface.

pub mod abi;
pub mod emit;
pub mod frame;
pub mod globals;
pub mod lower;
pub mod patch;
pub mod regalloc;

use crate::core::error::JitResult;
use crate::core::register_file::{AsmReg, RegMask};
use crate::ir::Inst;
use abi::CallingConvention;
use emit::EmitContext;
use frame::{FrameLayout, FrameParams};
use lower::LoweringRules;

/// What an instruction destroys besides its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Clobber {
    #[default]
    None,
    /// Two-operand form: the destination must be the first source register.
    Sreg1,
    /// A fixed scratch register is overwritten.
    Reg(AsmReg),
    /// Every caller-saved register is overwritten.
    Call,
}

/// Fixed-register requirements of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstConstraints {
    pub dest_dreg: Option<AsmReg>,
    pub dest_sreg1: Option<AsmReg>,
    pub dest_sreg2: Option<AsmReg>,
    pub clobber: Clobber,
    /// Registers the second source may not be assigned to.
    pub sreg2_exclude: RegMask,
}

impl InstConstraints {
    pub fn clobbers_sreg1(&self) -> bool {
        self.clobber == Clobber::Sreg1
    }

    pub fn is_call(&self) -> bool {
        self.clobber == Clobber::Call
    }

    pub fn clob_reg(&self) -> Option<AsmReg> {
        match self.clobber {
            Clobber::Reg(r) => Some(r),
            _ => None,
        }
    }
}

/// Per-architecture backend interface.
pub trait TargetIsa: Send + Sync {
    fn name(&self) -> &'static str;

    fn calling_convention(&self) -> &dyn CallingConvention;

    fn lowering_rules(&self) -> &dyn LoweringRules;

    /// Registers the allocator may hand out.
    fn usable_regs(&self) -> RegMask;

    fn caller_saved(&self) -> RegMask;

    fn callee_saved(&self) -> RegMask;

    fn frame_params(&self) -> FrameParams;

    fn constraints(&self, inst: &Inst) -> InstConstraints;

    /// Upper bound on the encoded size of `inst`, epilogue included for returns.
    fn max_length(&self, inst: &Inst, frame: &FrameLayout) -> usize;

    /// Upper bound on the prologue size.
    fn max_prologue_length(&self, frame: &FrameLayout) -> usize;

    fn emit_prologue(&self, ctx: &mut EmitContext<'_>) -> JitResult<()>;

    /// Encode one allocated instruction.
    fn encode(&self, ctx: &mut EmitContext<'_>, inst: &Inst) -> JitResult<()>;
}
