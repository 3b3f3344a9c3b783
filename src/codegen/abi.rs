// This module holds the target-independent half of argument passing. A CallingConvention turns
// a method signature into a CallInfo: one ArgInfo per argument slot (the implicit `this`
// first, then every declared and variadic parameter), an ArgInfo for the return value, the
// optional signature cookie of managed vararg calls, the register that carries a hidden
// struct-return pointer and the size of the outgoing stack area. Storage is described
// structurally: a single register, a register pair for 64-bit values on 32-bit targets, a
// stack offset in the caller's outgoing area, or a split struct whose first words travel in
// consecutive registers while the remaining `vtsize` words follow on the stack. The
// computation is pure; callers (call marshalling in the method builder, prologue generation)
// consume the result. Classification of a type without a size is a configuration error
// reported as UnsupportedOperation.

//! Calling-convention interface and argument placement records.

use crate::core::error::{JitError, JitResult};
use crate::core::register_file::AsmReg;
use crate::ir::{Signature, ValueType};

/// Where one argument (or the return value) lives at the call boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgStorage {
    /// Nothing is passed (void return).
    None,
    Reg(AsmReg),
    /// Low word in the first register, high word in the second.
    RegPair(AsmReg, AsmReg),
    /// At `offset` bytes into the outgoing argument area.
    Stack { offset: u32 },
    /// Struct split between `nregs` consecutive registers starting at `first` and
    /// `vtsize` words on the stack. The caller reserves the whole struct at `offset`;
    /// the stack-resident words are its tail.
    Split {
        first: AsmReg,
        nregs: u32,
        offset: u32,
        vtsize: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgInfo {
    pub storage: ArgStorage,
    /// Byte size of the value.
    pub size: u32,
    /// The storage holds the address of the value rather than the value.
    pub by_address: bool,
}

impl ArgInfo {
    pub const NONE: ArgInfo = ArgInfo {
        storage: ArgStorage::None,
        size: 0,
        by_address: false,
    };

    pub fn new(storage: ArgStorage, size: u32) -> Self {
        Self {
            storage,
            size,
            by_address: false,
        }
    }

    pub fn is_stack(&self) -> bool {
        matches!(self.storage, ArgStorage::Stack { .. })
    }

    /// Registers occupied by this argument.
    pub fn regs(&self) -> Vec<AsmReg> {
        match self.storage {
            ArgStorage::Reg(r) => vec![r],
            ArgStorage::RegPair(a, b) => vec![a, b],
            ArgStorage::Split { first, nregs, .. } => (0..nregs)
                .map(|i| AsmReg::new(first.bank, first.id + i as u8))
                .collect(),
            ArgStorage::None | ArgStorage::Stack { .. } => Vec::new(),
        }
    }

    /// Byte range of the outgoing area used by this argument.
    pub fn stack_range(&self, word: u32) -> Option<(u32, u32)> {
        match self.storage {
            ArgStorage::Stack { offset } => Some((offset, offset + self.size.max(1))),
            ArgStorage::Split {
                nregs,
                offset,
                vtsize,
                ..
            } => Some((offset, offset + (nregs + vtsize) * word)),
            _ => None,
        }
    }
}

/// Placement of a whole signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    /// Return value. For struct returns this describes the hidden buffer pointer
    /// and has `by_address` set.
    pub ret: ArgInfo,
    /// One entry per argument slot, `this` first.
    pub args: Vec<ArgInfo>,
    /// Signature cookie of vararg calls, always on the stack.
    pub sig_cookie: Option<ArgInfo>,
    /// Register carrying the hidden struct-return pointer.
    pub struct_ret: Option<AsmReg>,
    /// Size of the outgoing argument area, rounded to the stack alignment.
    pub stack_usage: u32,
}

impl CallInfo {
    pub fn returns_struct(&self) -> bool {
        self.ret.by_address
    }

    /// Check that no two arguments share a register or overlapping stack bytes.
    pub fn check_disjoint(&self, word: u32) -> Result<(), String> {
        let mut regs: Vec<AsmReg> = Vec::new();
        let mut ranges: Vec<(u32, u32)> = Vec::new();
        let hidden = if self.ret.by_address { Some(&self.ret) } else { None };
        let all = hidden
            .into_iter()
            .chain(self.args.iter())
            .chain(self.sig_cookie.iter());
        for (i, info) in all.enumerate() {
            for r in info.regs() {
                if regs.contains(&r) {
                    return Err(format!("argument {i} reuses register {r}"));
                }
                regs.push(r);
            }
            if let Some((lo, hi)) = info.stack_range(word) {
                if hi > self.stack_usage {
                    return Err(format!("argument {i} ends at {hi} beyond stack usage"));
                }
                if ranges.iter().any(|(a, b)| lo < *b && *a < hi) {
                    return Err(format!("argument {i} overlaps another stack argument"));
                }
                ranges.push((lo, hi));
            }
        }
        Ok(())
    }
}

/// Per-target argument placement.
pub trait CallingConvention: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pointer size in bytes.
    fn word_size(&self) -> u32;

    /// Alignment the outgoing area is rounded to.
    fn stack_alignment(&self) -> u32;

    /// Integer argument registers, in assignment order.
    fn int_arg_regs(&self) -> &'static [AsmReg];

    /// Register holding scalar return values.
    fn return_reg(&self) -> AsmReg;

    fn compute_call_info(&self, sig: &Signature) -> JitResult<CallInfo>;
}

pub(crate) fn align_up(value: u32, align: u32) -> u32 {
    if align <= 1 {
        value
    } else {
        (value + align - 1) & !(align - 1)
    }
}

/// Size of a parameter type, honouring the native layout of pinvoke structs.
pub(crate) fn param_size(ty: &ValueType, word: u32, pinvoke: bool) -> JitResult<u32> {
    match ty {
        ValueType::Struct(layout) if pinvoke => Ok(layout.native_size),
        ValueType::Void => Err(JitError::unsupported("void parameter")),
        other => other
            .size(word)
            .ok_or_else(|| JitError::unsupported(format!("unsized type {other} in signature"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_struct_registers_are_consecutive() {
        let info = ArgInfo::new(
            ArgStorage::Split {
                first: AsmReg::gp(2),
                nregs: 2,
                offset: 0,
                vtsize: 1,
            },
            12,
        );
        assert_eq!(info.regs(), vec![AsmReg::gp(2), AsmReg::gp(3)]);
        assert_eq!(info.stack_range(4), Some((0, 12)));
    }

    #[test]
    fn test_check_disjoint_detects_register_clash() {
        let ci = CallInfo {
            ret: ArgInfo::NONE,
            args: vec![
                ArgInfo::new(ArgStorage::Reg(AsmReg::gp(0)), 4),
                ArgInfo::new(ArgStorage::RegPair(AsmReg::gp(0), AsmReg::gp(1)), 8),
            ],
            sig_cookie: None,
            struct_ret: None,
            stack_usage: 0,
        };
        assert!(ci.check_disjoint(4).is_err());
    }

    #[test]
    fn test_check_disjoint_detects_stack_overlap() {
        let ci = CallInfo {
            ret: ArgInfo::NONE,
            args: vec![
                ArgInfo::new(ArgStorage::Stack { offset: 0 }, 8),
                ArgInfo::new(ArgStorage::Stack { offset: 4 }, 4),
            ],
            sig_cookie: None,
            struct_ret: None,
            stack_usage: 8,
        };
        assert!(ci.check_disjoint(4).is_err());
    }

    #[test]
    fn test_param_size_rejects_unsized() {
        assert!(param_size(&ValueType::TypeVar(1), 8, false).is_err());
        assert!(param_size(&ValueType::Void, 8, false).is_err());
        let s = ValueType::Struct(crate::ir::StructLayout {
            size: 12,
            align: 4,
            native_size: 16,
        });
        assert_eq!(param_size(&s, 4, true).unwrap(), 16);
        assert_eq!(param_size(&s, 4, false).unwrap(), 12);
    }
}
