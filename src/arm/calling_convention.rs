// This module implements argument placement for the 32-bit ARM target. Arguments are assigned
// from r0 upwards, one 4-byte word at a time. Word-sized scalars (including single floats,
// which travel in integer registers in this soft-float model) take the next register while
// one of r0-r3 is left and a 4-byte stack slot otherwise. 64-bit scalars take a register pair
// when at least two registers remain and 8 bytes of 8-aligned stack otherwise; the register
// cursor advances by two either way. Optionally, pairs start on an even register and the odd
// register in between is skipped. Value types are split: as many of their words as fit go in
// the remaining registers and the rest (`vtsize` words) follow on the stack, with the caller
// reserving the whole struct in its outgoing area. pinvoke signatures size value types by
// their native layout. A vararg sentinel exhausts the registers so the cookie and every
// variadic argument go on the stack. The outgoing area is rounded to 8 bytes.

//! ARM calling convention.

use super::{R0, R1, R2, R3};
use crate::codegen::abi::{align_up, param_size, ArgInfo, ArgStorage, CallInfo, CallingConvention};
use crate::core::error::{JitError, JitResult};
use crate::core::register_file::AsmReg;
use crate::ir::{Signature, ValueType};

const ARG_REGS: [AsmReg; 4] = [R0, R1, R2, R3];
const LAST_ARG_REG: u8 = 3;

#[derive(Debug, Default, Clone, Copy)]
pub struct ArmConvention {
    /// Start register pairs on an even register.
    pub even_reg_pairs: bool,
}

impl ArmConvention {
    pub fn new(even_reg_pairs: bool) -> Self {
        Self { even_reg_pairs }
    }
}

struct ArmAssigner {
    gr: u8,
    stack_size: u32,
    even_pairs: bool,
}

impl ArmAssigner {
    fn word(&mut self) -> ArgStorage {
        let storage = if self.gr > LAST_ARG_REG {
            let offset = self.stack_size;
            self.stack_size += 4;
            ArgStorage::Stack { offset }
        } else {
            ArgStorage::Reg(AsmReg::gp(self.gr))
        };
        self.gr += 1;
        storage
    }

    fn double_word(&mut self) -> ArgStorage {
        if self.even_pairs && self.gr <= LAST_ARG_REG && self.gr % 2 == 1 {
            self.gr += 1;
        }
        let storage = if self.gr > LAST_ARG_REG - 1 {
            self.stack_size = align_up(self.stack_size, 8);
            let offset = self.stack_size;
            self.stack_size += 8;
            ArgStorage::Stack { offset }
        } else {
            ArgStorage::RegPair(AsmReg::gp(self.gr), AsmReg::gp(self.gr + 1))
        };
        self.gr += 2;
        storage
    }

    fn value_type(&mut self, size: u32) -> (ArgStorage, u32) {
        let nwords = align_up(size, 4) / 4;
        let offset = self.stack_size;
        self.stack_size += nwords * 4;
        if self.gr > LAST_ARG_REG {
            return (ArgStorage::Stack { offset }, nwords * 4);
        }
        let rest = u32::from(LAST_ARG_REG - self.gr + 1);
        let nregs = rest.min(nwords);
        let first = AsmReg::gp(self.gr);
        self.gr += nregs as u8;
        (
            ArgStorage::Split {
                first,
                nregs,
                offset,
                vtsize: nwords - nregs,
            },
            size,
        )
    }

    fn assign(&mut self, ty: &ValueType, size: u32) -> JitResult<(ArgStorage, u32)> {
        Ok(match ty {
            ValueType::Struct(_) => self.value_type(size),
            ValueType::I64 | ValueType::U64 | ValueType::F64 => (self.double_word(), 8),
            ValueType::Void | ValueType::TypeVar(_) => {
                return Err(JitError::unsupported(format!("argument of type {ty}")));
            }
            _ => (self.word(), size),
        })
    }
}

impl CallingConvention for ArmConvention {
    fn name(&self) -> &'static str {
        "arm"
    }

    fn word_size(&self) -> u32 {
        4
    }

    fn stack_alignment(&self) -> u32 {
        8
    }

    fn int_arg_regs(&self) -> &'static [AsmReg] {
        &ARG_REGS
    }

    fn return_reg(&self) -> AsmReg {
        R0
    }

    fn compute_call_info(&self, sig: &Signature) -> JitResult<CallInfo> {
        let mut cc = ArmAssigner {
            gr: 0,
            stack_size: 0,
            even_pairs: self.even_reg_pairs,
        };
        let mut ret = ArgInfo::NONE;
        let mut struct_ret = None;
        if sig.ret.is_struct() {
            ret = ArgInfo {
                storage: cc.word(),
                size: 4,
                by_address: true,
            };
            struct_ret = Some(R0);
        }

        let mut args = Vec::with_capacity(sig.arg_count());
        let mut sig_cookie = None;
        if sig.has_this {
            args.push(ArgInfo::new(cc.word(), 4));
        }
        for (i, ty) in sig.params.iter().enumerate() {
            if sig.sentinel == Some(i) {
                cc.gr = LAST_ARG_REG + 1;
                sig_cookie = Some(ArgInfo::new(cc.word(), 4));
            }
            let size = param_size(ty, 4, sig.pinvoke)?;
            let (storage, size) = cc.assign(ty, size)?;
            args.push(ArgInfo::new(storage, size));
        }
        if sig.sentinel == Some(sig.params.len()) {
            cc.gr = LAST_ARG_REG + 1;
            sig_cookie = Some(ArgInfo::new(cc.word(), 4));
        }

        if !ret.by_address {
            ret = match &sig.ret {
                ValueType::Void => ArgInfo::NONE,
                ValueType::I64 | ValueType::U64 | ValueType::F64 => {
                    ArgInfo::new(ArgStorage::RegPair(R0, R1), 8)
                }
                ValueType::TypeVar(_) => {
                    return Err(JitError::unsupported(format!("return type {}", sig.ret)));
                }
                t => ArgInfo::new(ArgStorage::Reg(R0), param_size(t, 4, false)?),
            };
        }

        Ok(CallInfo {
            ret,
            args,
            sig_cookie,
            struct_ret,
            stack_usage: align_up(cc.stack_size, 8),
        })
    }
}
