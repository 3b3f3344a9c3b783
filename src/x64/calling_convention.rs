// This module implements the System V AMD64 calling convention for managed methods on x86-64
// Linux. SysVAssigner walks a signature slot by slot and hands out argument locations the way
// the ABI does: integer-class values take RDI, RSI, RDX, RCX, R8, R9 in order, floating values
// take XMM0-XMM7, and everything else lands in 8-byte stack slots of the outgoing area. Value
// types up to 8 bytes travel in one register, up to 16 bytes in a register pair when two
// registers remain (otherwise wholly on the stack), and larger ones are copied to the stack
// rounded to 8 bytes. Struct returns are always written through a hidden pointer passed in
// RDI. Managed vararg calls switch the assigner to stack-only mode at the sentinel: the
// signature cookie takes the next stack slot and every variadic argument follows it. The
// outgoing area is rounded to the 16-byte alignment the ABI requires at call sites.

//! System V x86-64 calling convention implementation.

use super::{R8, R9, RAX, RCX, RDI, RDX, RSI};
use crate::codegen::abi::{align_up, param_size, ArgInfo, ArgStorage, CallInfo, CallingConvention};
use crate::core::error::{JitError, JitResult};
use crate::core::register_file::AsmReg;
use crate::ir::{Signature, ValueType};

/// System V x86-64 GP argument registers.
pub const GP_ARG_REGS: [AsmReg; 6] = [RDI, RSI, RDX, RCX, R8, R9];

/// System V x86-64 XMM argument registers.
const XMM_ARG_REGS: [AsmReg; 8] = [
    AsmReg::fp(0),
    AsmReg::fp(1),
    AsmReg::fp(2),
    AsmReg::fp(3),
    AsmReg::fp(4),
    AsmReg::fp(5),
    AsmReg::fp(6),
    AsmReg::fp(7),
];

/// Per-signature assignment state.
#[derive(Debug, Default)]
pub struct SysVAssigner {
    /// Current GP argument register index.
    gp_cnt: usize,
    /// Current XMM argument register index.
    xmm_cnt: usize,
    /// Current stack offset for arguments.
    stack: u32,
    /// Force remaining args to stack (after a vararg sentinel).
    must_assign_stack: bool,
}

impl SysVAssigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force remaining arguments to be assigned to stack.
    pub fn set_must_assign_stack(&mut self) {
        self.must_assign_stack = true;
        self.gp_cnt = GP_ARG_REGS.len();
        self.xmm_cnt = XMM_ARG_REGS.len();
    }

    pub fn gp_used(&self) -> usize {
        self.gp_cnt
    }

    pub fn stack_size(&self) -> u32 {
        self.stack
    }

    fn stack_slot(&mut self, size: u32) -> ArgStorage {
        let offset = self.stack;
        self.stack += align_up(size.max(1), 8);
        ArgStorage::Stack { offset }
    }

    fn assign_general(&mut self) -> ArgStorage {
        if !self.must_assign_stack && self.gp_cnt < GP_ARG_REGS.len() {
            let reg = GP_ARG_REGS[self.gp_cnt];
            self.gp_cnt += 1;
            ArgStorage::Reg(reg)
        } else {
            self.stack_slot(8)
        }
    }

    fn assign_float(&mut self) -> ArgStorage {
        if !self.must_assign_stack && self.xmm_cnt < XMM_ARG_REGS.len() {
            let reg = XMM_ARG_REGS[self.xmm_cnt];
            self.xmm_cnt += 1;
            ArgStorage::Reg(reg)
        } else {
            self.stack_slot(8)
        }
    }

    fn assign_struct(&mut self, size: u32) -> ArgStorage {
        let remaining = GP_ARG_REGS.len() - self.gp_cnt;
        if !self.must_assign_stack && size <= 8 && remaining >= 1 {
            self.assign_general()
        } else if !self.must_assign_stack && size <= 16 && remaining >= 2 {
            let lo = GP_ARG_REGS[self.gp_cnt];
            let hi = GP_ARG_REGS[self.gp_cnt + 1];
            self.gp_cnt += 2;
            ArgStorage::RegPair(lo, hi)
        } else {
            self.stack_slot(size)
        }
    }

    /// Assign one argument of type `ty` with byte size `size`.
    pub fn assign_arg(&mut self, ty: &ValueType, size: u32) -> ArgStorage {
        match ty {
            ValueType::Struct(_) => self.assign_struct(size),
            t if t.is_float() => self.assign_float(),
            _ => self.assign_general(),
        }
    }
}

/// The System V convention as seen by the rest of the backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysVConvention;

impl CallingConvention for SysVConvention {
    fn name(&self) -> &'static str {
        "sysv-x64"
    }

    fn word_size(&self) -> u32 {
        8
    }

    fn stack_alignment(&self) -> u32 {
        16
    }

    fn int_arg_regs(&self) -> &'static [AsmReg] {
        &GP_ARG_REGS
    }

    fn return_reg(&self) -> AsmReg {
        RAX
    }

    fn compute_call_info(&self, sig: &Signature) -> JitResult<CallInfo> {
        let mut cc = SysVAssigner::new();
        let mut struct_ret = None;

        let ret = match &sig.ret {
            ValueType::Void => ArgInfo::NONE,
            ValueType::Struct(_) => {
                let storage = cc.assign_general();
                struct_ret = Some(RDI);
                ArgInfo {
                    storage,
                    size: 8,
                    by_address: true,
                }
            }
            t if t.is_float() => ArgInfo::new(ArgStorage::Reg(AsmReg::fp(0)), param_size(t, 8, false)?),
            ValueType::TypeVar(_) => return Err(JitError::unsupported(format!("return type {}", sig.ret))),
            t => ArgInfo::new(ArgStorage::Reg(RAX), param_size(t, 8, false)?),
        };

        let mut args = Vec::with_capacity(sig.arg_count());
        let mut sig_cookie = None;
        let this_slots = usize::from(sig.has_this);
        for i in 0..sig.arg_count() {
            if i >= this_slots && sig.sentinel == Some(i - this_slots) {
                cc.set_must_assign_stack();
                sig_cookie = Some(ArgInfo::new(cc.assign_general(), 8));
            }
            let ty = sig
                .arg_type(i)
                .ok_or_else(|| JitError::unsupported(format!("argument {i} out of range")))?;
            let size = param_size(&ty, 8, sig.pinvoke)?;
            args.push(ArgInfo::new(cc.assign_arg(&ty, size), size));
        }
        if sig.sentinel == Some(sig.params.len()) {
            cc.set_must_assign_stack();
            sig_cookie = Some(ArgInfo::new(cc.assign_general(), 8));
        }

        let stack_usage = align_up(cc.stack_size(), 16);
        log::trace!("sysv call info for {sig}: {} stack bytes", stack_usage);
        Ok(CallInfo {
            ret,
            args,
            sig_cookie,
            struct_ret,
            stack_usage,
        })
    }
}
