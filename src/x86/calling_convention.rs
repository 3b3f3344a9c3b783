// cdecl passes every argument on the stack. The hidden struct-return pointer comes first,
// then `this`, then the parameters in order, each occupying its size rounded up to whole
// 4-byte words with no further alignment padding (8-byte values take two words at whatever
// offset they land on). pinvoke signatures size value types by their native layout. The
// signature cookie of a managed vararg call takes one word just ahead of the variadic tail.
// Integer results come back in EAX, 64-bit results in EAX:EDX.

//! x86 cdecl calling convention.

use super::{EAX, EDX};
use crate::codegen::abi::{align_up, param_size, ArgInfo, ArgStorage, CallInfo, CallingConvention};
use crate::core::error::{JitError, JitResult};
use crate::core::register_file::AsmReg;
use crate::ir::{Signature, ValueType};

#[derive(Debug, Default, Clone, Copy)]
pub struct CdeclConvention;

impl CallingConvention for CdeclConvention {
    fn name(&self) -> &'static str {
        "cdecl-x86"
    }

    fn word_size(&self) -> u32 {
        4
    }

    fn stack_alignment(&self) -> u32 {
        4
    }

    fn int_arg_regs(&self) -> &'static [AsmReg] {
        &[]
    }

    fn return_reg(&self) -> AsmReg {
        EAX
    }

    fn compute_call_info(&self, sig: &Signature) -> JitResult<CallInfo> {
        let mut offset = 0u32;
        let mut push = |size: u32| {
            let at = offset;
            offset += align_up(size.max(1), 4);
            ArgStorage::Stack { offset: at }
        };

        let ret = match &sig.ret {
            ValueType::Void => ArgInfo::NONE,
            ValueType::Struct(_) => ArgInfo {
                storage: push(4),
                size: 4,
                by_address: true,
            },
            ValueType::I64 | ValueType::U64 => ArgInfo::new(ArgStorage::RegPair(EAX, EDX), 8),
            ValueType::TypeVar(_) => {
                return Err(JitError::unsupported(format!("return type {}", sig.ret)));
            }
            t => ArgInfo::new(ArgStorage::Reg(EAX), param_size(t, 4, false)?),
        };

        let mut args = Vec::with_capacity(sig.arg_count());
        let mut sig_cookie = None;
        if sig.has_this {
            args.push(ArgInfo::new(push(4), 4));
        }
        for (i, ty) in sig.params.iter().enumerate() {
            if sig.sentinel == Some(i) {
                sig_cookie = Some(ArgInfo::new(push(4), 4));
            }
            let size = param_size(ty, 4, sig.pinvoke)?;
            args.push(ArgInfo::new(push(size), size));
        }
        if sig.sentinel == Some(sig.params.len()) {
            sig_cookie = Some(ArgInfo::new(push(4), 4));
        }

        Ok(CallInfo {
            struct_ret: None,
            ret,
            args,
            sig_cookie,
            stack_usage: align_up(offset, 4),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::StructLayout;

    #[test]
    fn test_everything_on_stack() {
        let sig = Signature::new(vec![ValueType::I8, ValueType::I64, ValueType::I32], ValueType::I64);
        let ci = CdeclConvention.compute_call_info(&sig).unwrap();
        assert_eq!(ci.args[0].storage, ArgStorage::Stack { offset: 0 });
        assert_eq!(ci.args[1].storage, ArgStorage::Stack { offset: 4 });
        assert_eq!(ci.args[2].storage, ArgStorage::Stack { offset: 12 });
        assert_eq!(ci.ret.storage, ArgStorage::RegPair(EAX, EDX));
        assert_eq!(ci.stack_usage, 16);
        ci.check_disjoint(4).unwrap();
    }

    #[test]
    fn test_hidden_return_pointer_comes_first() {
        let sig = Signature::new(vec![ValueType::Struct(StructLayout::new(6, 2))], ValueType::Struct(StructLayout::new(8, 4)))
            .with_this();
        let ci = CdeclConvention.compute_call_info(&sig).unwrap();
        assert_eq!(ci.ret.storage, ArgStorage::Stack { offset: 0 });
        assert!(ci.returns_struct());
        assert_eq!(ci.args[0].storage, ArgStorage::Stack { offset: 4 });
        assert_eq!(ci.args[1].storage, ArgStorage::Stack { offset: 8 });
        assert_eq!(ci.stack_usage, 16);
        ci.check_disjoint(4).unwrap();
    }

    #[test]
    fn test_vararg_cookie_precedes_tail() {
        let sig = Signature::new(vec![ValueType::I32, ValueType::I32], ValueType::Void).with_sentinel(1);
        let ci = CdeclConvention.compute_call_info(&sig).unwrap();
        assert_eq!(ci.sig_cookie.unwrap().storage, ArgStorage::Stack { offset: 4 });
        assert_eq!(ci.args[1].storage, ArgStorage::Stack { offset: 8 });
        assert_eq!(ci.stack_usage, 12);
    }
}
