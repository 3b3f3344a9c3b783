// MethodBuilder constructs a MethodBody block by block. Besides plain instruction helpers it
// performs call marshalling: given the callee's signature it asks the calling convention for
// the CallInfo and turns every argument into what the call instruction expects. Register
// arguments become `(value, register)` entries of the call's out-register list, stack
// arguments become OutArg stores into the outgoing area, 64-bit values on 32-bit targets are
// split into a low and a high word, struct arguments (passed as the address of the value)
// are copied word by word into their registers or stack slots, and vararg calls receive the
// signature cookie as an extra stack argument. The allocator later pins each out-register
// value to its register at the call.

//! Programmatic construction of method bodies with call marshalling.

use super::{
    AluOp, BasicBlock, BlockId, CallTarget, Cond, Inst, MemSize, MethodBody, MethodFlags, OpSize, Reg,
    ShiftOp, Signature, UnaryOp, ValueType, VarId, VReg,
};
use crate::codegen::abi::{ArgInfo, ArgStorage, CallingConvention};
use crate::core::error::{JitError, JitResult};
use crate::core::register_file::AsmReg;

fn chunk_size(remaining: u32, word: u32) -> MemSize {
    match remaining.min(word) {
        1 => MemSize::U8,
        2 => MemSize::U16,
        3 | 4 => MemSize::U32,
        _ => MemSize::I64,
    }
}

pub struct MethodBuilder<'cc> {
    body: MethodBody,
    cc: &'cc dyn CallingConvention,
    current: usize,
}

impl<'cc> MethodBuilder<'cc> {
    /// Start a method with an empty entry block selected.
    pub fn new(name: impl Into<String>, sig: Signature, cc: &'cc dyn CallingConvention) -> Self {
        let mut body = MethodBody::new(name, sig);
        body.blocks.push(BasicBlock::new(BlockId(0)));
        Self { body, cc, current: 0 }
    }

    pub fn flags_mut(&mut self) -> &mut MethodFlags {
        &mut self.body.flags
    }

    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    pub fn create_block(&mut self) -> BlockId {
        let id = BlockId(self.body.blocks.len() as u32);
        self.body.blocks.push(BasicBlock::new(id));
        id
    }

    /// Append subsequent instructions to `block`.
    ///
    /// Panics if `block` was not created by this builder.
    pub fn switch_to(&mut self, block: BlockId) {
        assert!(
            (block.0 as usize) < self.body.blocks.len(),
            "{block} does not belong to {}",
            self.body.name
        );
        self.current = block.0 as usize;
    }

    pub fn current_block(&self) -> BlockId {
        BlockId(self.current as u32)
    }

    pub fn vreg(&mut self) -> VReg {
        self.body.new_vreg()
    }

    pub fn local(&mut self, ty: ValueType) -> VarId {
        self.body.add_local(ty)
    }

    pub fn push(&mut self, inst: Inst) {
        self.body.blocks[self.current].insts.push(inst);
    }

    fn def(&mut self, make: impl FnOnce(Reg) -> Inst) -> VReg {
        let v = self.vreg();
        let inst = make(v.into());
        self.push(inst);
        v
    }

    /// Load argument slot `n` (`this` is slot 0 when present).
    pub fn arg(&mut self, n: u32) -> JitResult<VReg> {
        let var = self
            .body
            .arg_var(n)
            .ok_or_else(|| JitError::unsupported(format!("{} has no argument {n}", self.body.name)))?;
        Ok(self.load_var(var))
    }

    pub fn iconst(&mut self, value: i64) -> VReg {
        self.def(|dst| Inst::Iconst { dst, value })
    }

    pub fn mov(&mut self, src: VReg) -> VReg {
        self.def(|dst| Inst::Move { dst, src: src.into() })
    }

    pub fn alu(&mut self, op: AluOp, size: OpSize, lhs: VReg, rhs: VReg) -> VReg {
        self.def(|dst| Inst::Alu {
            op,
            size,
            dst,
            lhs: lhs.into(),
            rhs: rhs.into(),
        })
    }

    pub fn alu_imm(&mut self, op: AluOp, size: OpSize, lhs: VReg, imm: i64) -> VReg {
        self.def(|dst| Inst::AluImm {
            op,
            size,
            dst,
            lhs: lhs.into(),
            imm,
        })
    }

    pub fn shift(&mut self, op: ShiftOp, size: OpSize, lhs: VReg, count: VReg) -> VReg {
        self.def(|dst| Inst::Shift {
            op,
            size,
            dst,
            lhs: lhs.into(),
            count: count.into(),
        })
    }

    pub fn shift_imm(&mut self, op: ShiftOp, size: OpSize, lhs: VReg, imm: u8) -> VReg {
        self.def(|dst| Inst::ShiftImm {
            op,
            size,
            dst,
            lhs: lhs.into(),
            imm,
        })
    }

    pub fn div(&mut self, signed: bool, rem: bool, size: OpSize, lhs: VReg, rhs: VReg) -> VReg {
        self.def(|dst| Inst::Div {
            signed,
            rem,
            size,
            dst,
            lhs: lhs.into(),
            rhs: rhs.into(),
        })
    }

    pub fn unary(&mut self, op: UnaryOp, size: OpSize, src: VReg) -> VReg {
        self.def(|dst| Inst::Unary {
            op,
            size,
            dst,
            src: src.into(),
        })
    }

    pub fn cmp(&mut self, size: OpSize, lhs: VReg, rhs: VReg) {
        self.push(Inst::Cmp {
            size,
            lhs: lhs.into(),
            rhs: rhs.into(),
        });
    }

    pub fn cmp_imm(&mut self, size: OpSize, lhs: VReg, imm: i64) {
        self.push(Inst::CmpImm {
            size,
            lhs: lhs.into(),
            imm,
        });
    }

    pub fn setcc(&mut self, cond: Cond) -> VReg {
        self.def(|dst| Inst::SetCc { cond, dst })
    }

    pub fn load(&mut self, size: MemSize, base: VReg, disp: i32) -> VReg {
        self.def(|dst| Inst::Load {
            size,
            dst,
            base: base.into(),
            disp,
        })
    }

    pub fn store(&mut self, size: MemSize, base: VReg, disp: i32, src: VReg) {
        self.push(Inst::Store {
            size,
            base: base.into(),
            disp,
            src: src.into(),
        });
    }

    pub fn store_imm(&mut self, size: MemSize, base: VReg, disp: i32, imm: i64) {
        self.push(Inst::StoreImm {
            size,
            base: base.into(),
            disp,
            imm,
        });
    }

    pub fn load_var(&mut self, var: VarId) -> VReg {
        self.def(|dst| Inst::LoadVar { dst, var })
    }

    pub fn store_var(&mut self, var: VarId, src: VReg) {
        self.push(Inst::StoreVar { var, src: src.into() });
    }

    pub fn var_addr(&mut self, var: VarId) -> VReg {
        self.def(|dst| Inst::VarAddr { dst, var })
    }

    pub fn localloc(&mut self, size: VReg) -> VReg {
        self.def(|dst| Inst::Localloc {
            dst,
            size: size.into(),
        })
    }

    pub fn exc_addr(&mut self, clause: u32) -> VReg {
        self.def(|dst| Inst::ExcAddr { dst, clause })
    }

    pub fn jump(&mut self, target: BlockId) {
        self.push(Inst::Jump { target });
    }

    pub fn branch(&mut self, cond: Cond, taken: BlockId, not_taken: BlockId) {
        self.push(Inst::Branch {
            cond,
            taken,
            not_taken,
        });
    }

    pub fn ret(&mut self, src: Option<VReg>) {
        self.push(Inst::Return {
            src: src.map(Reg::from),
        });
    }

    /// Call `target` with `args` (including `this`) marshalled for `sig`.
    /// Returns the result register unless the callee returns nothing or a struct.
    pub fn call(&mut self, target: CallTarget, sig: &Signature, args: &[VReg]) -> JitResult<Option<VReg>> {
        let out_regs = self.marshal(sig, None, args)?;
        let dst = self.result_reg(sig);
        self.push(Inst::Call {
            dst: dst.map(Reg::from),
            target,
            out_regs,
        });
        Ok(dst)
    }

    /// Call a struct-returning method, passing the address of the result buffer.
    pub fn call_with_buffer(
        &mut self,
        target: CallTarget,
        sig: &Signature,
        buffer: VReg,
        args: &[VReg],
    ) -> JitResult<()> {
        let out_regs = self.marshal(sig, Some(buffer), args)?;
        self.push(Inst::Call {
            dst: None,
            target,
            out_regs,
        });
        Ok(())
    }

    /// Call through the vtable slot at `vtable + disp`.
    pub fn call_virt(
        &mut self,
        vtable: VReg,
        disp: i32,
        sig: &Signature,
        args: &[VReg],
    ) -> JitResult<Option<VReg>> {
        let out_regs = self.marshal(sig, None, args)?;
        let dst = self.result_reg(sig);
        self.push(Inst::CallVirt {
            dst: dst.map(Reg::from),
            vtable: vtable.into(),
            disp,
            out_regs,
        });
        Ok(dst)
    }

    fn result_reg(&mut self, sig: &Signature) -> Option<VReg> {
        match sig.ret {
            ValueType::Void | ValueType::Struct(_) => None,
            _ => Some(self.vreg()),
        }
    }

    fn marshal(
        &mut self,
        sig: &Signature,
        buffer: Option<VReg>,
        args: &[VReg],
    ) -> JitResult<Vec<(Reg, AsmReg)>> {
        let info = self.cc.compute_call_info(sig)?;
        if args.len() != info.args.len() {
            return Err(JitError::unsupported(format!(
                "call with {} arguments to a signature {sig} taking {}",
                args.len(),
                info.args.len()
            )));
        }
        let mut out = Vec::new();
        if info.returns_struct() {
            let buf = buffer.ok_or_else(|| JitError::unsupported(format!("struct return of {sig} needs a buffer")))?;
            self.place_scalar(buf, &info.ret, &mut out)?;
        }
        for (i, (&value, arg)) in args.iter().zip(&info.args).enumerate() {
            match sig.arg_type(i) {
                Some(ValueType::Struct(_)) => self.place_struct(value, arg, &mut out)?,
                _ => self.place_scalar(value, arg, &mut out)?,
            }
        }
        if let Some(cookie) = info.sig_cookie {
            let token = self.iconst(sig.cookie());
            self.place_scalar(token, &cookie, &mut out)?;
        }
        log::trace!(
            "marshalled call {sig}: {} register, {} stack bytes",
            out.len(),
            info.stack_usage
        );
        Ok(out)
    }

    fn place_scalar(&mut self, value: VReg, arg: &ArgInfo, out: &mut Vec<(Reg, AsmReg)>) -> JitResult<()> {
        match arg.storage {
            ArgStorage::None => {}
            ArgStorage::Reg(r) => out.push((value.into(), r)),
            ArgStorage::RegPair(lo, hi) => {
                let high = self.shift_imm(ShiftOp::Shr, OpSize::S64, value, 32);
                out.push((value.into(), lo));
                out.push((high.into(), hi));
            }
            ArgStorage::Stack { offset } => self.push(Inst::OutArg {
                offset,
                src: value.into(),
            }),
            ArgStorage::Split { .. } => {
                return Err(JitError::unsupported("scalar argument split across registers and stack"));
            }
        }
        Ok(())
    }

    /// Copy the struct at `addr` into its argument storage.
    fn place_struct(&mut self, addr: VReg, arg: &ArgInfo, out: &mut Vec<(Reg, AsmReg)>) -> JitResult<()> {
        let word = self.cc.word_size();
        let words = arg.size.div_ceil(word);
        let chunk = |b: &mut Self, i: u32| {
            let remaining = arg.size.saturating_sub(i * word).max(1);
            b.load(chunk_size(remaining, word), addr, (i * word) as i32)
        };
        match arg.storage {
            ArgStorage::None => {}
            ArgStorage::Reg(r) => {
                let v = chunk(self, 0);
                out.push((v.into(), r));
            }
            ArgStorage::RegPair(lo, hi) => {
                let a = chunk(self, 0);
                let b = chunk(self, 1);
                out.push((a.into(), lo));
                out.push((b.into(), hi));
            }
            ArgStorage::Stack { offset } => {
                for i in 0..words {
                    let v = chunk(self, i);
                    self.push(Inst::OutArg {
                        offset: offset + i * word,
                        src: v.into(),
                    });
                }
            }
            ArgStorage::Split {
                first,
                nregs,
                offset,
                vtsize,
            } => {
                for i in 0..nregs {
                    let v = chunk(self, i);
                    out.push((v.into(), AsmReg::new(first.bank, first.id + i as u8)));
                }
                for j in 0..vtsize {
                    let i = nregs + j;
                    let v = chunk(self, i);
                    self.push(Inst::OutArg {
                        offset: offset + i * word,
                        src: v.into(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn finish(mut self) -> MethodBody {
        self.body.sync_watermarks();
        self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::ArmConvention;
    use crate::ir::StructLayout;
    use crate::x64::{self, SysVConvention};

    #[test]
    fn test_register_arguments_become_out_regs() {
        let sig = Signature::new(vec![ValueType::I32, ValueType::I32], ValueType::I32);
        let mut b = MethodBuilder::new("caller", Signature::new(vec![], ValueType::I32), &SysVConvention);
        let a = b.iconst(3);
        let c = b.iconst(4);
        let r = b.call(CallTarget::Method(crate::ir::MethodId(1)), &sig, &[a, c]).unwrap();
        b.ret(r);
        let body = b.finish();
        let call = &body.blocks[0].insts[2];
        assert_eq!(call.out_regs(), &[(a.into(), x64::RDI), (c.into(), x64::RSI)]);
        assert_eq!(call.dreg(), r.map(Reg::from));
        assert_eq!(body.blocks[0].max_vreg, body.next_vreg);
    }

    #[test]
    fn test_vararg_call_stores_cookie_and_tail_on_stack() {
        let sig = Signature::new(vec![ValueType::I32, ValueType::I64], ValueType::Void).with_sentinel(1);
        let mut b = MethodBuilder::new("caller", Signature::new(vec![], ValueType::Void), &SysVConvention);
        let a = b.iconst(1);
        let c = b.iconst(2);
        b.call(CallTarget::Native("printf".into()), &sig, &[a, c]).unwrap();
        let body = b.finish();
        let insts = &body.blocks[0].insts;
        assert!(insts.contains(&Inst::OutArg {
            offset: 8,
            src: c.into()
        }));
        let cookie = insts.iter().find_map(|i| match i {
            Inst::Iconst { value, .. } if *value == sig.cookie() => Some(*value),
            _ => None,
        });
        assert_eq!(cookie, Some(sig.cookie()));
        assert!(insts.iter().any(|i| matches!(i, Inst::OutArg { offset: 0, .. })));
        let call = insts.last().unwrap();
        assert_eq!(call.out_regs(), &[(a.into(), x64::RDI)]);
        assert_eq!(body.param_area(), 16);
    }

    #[test]
    fn test_long_on_arm_is_split_into_halves() {
        let cc = ArmConvention::new(false);
        let sig = Signature::new(vec![ValueType::I64], ValueType::Void);
        let mut b = MethodBuilder::new("caller", Signature::new(vec![], ValueType::Void), &cc);
        let v = b.iconst(0x1_0000_0002);
        b.call(CallTarget::Address(0x1000), &sig, &[v]).unwrap();
        let body = b.finish();
        let insts = &body.blocks[0].insts;
        assert!(matches!(
            insts[1],
            Inst::ShiftImm {
                op: ShiftOp::Shr,
                imm: 32,
                ..
            }
        ));
        let out = insts[2].out_regs();
        assert_eq!(out[0], (v.into(), AsmReg::gp(0)));
        assert_eq!(out[1].1, AsmReg::gp(1));
    }

    #[test]
    fn test_split_struct_is_copied_word_by_word() {
        let cc = ArmConvention::new(false);
        let sig = Signature::new(
            vec![ValueType::I32, ValueType::I32, ValueType::Struct(StructLayout::new(12, 4))],
            ValueType::Void,
        );
        let mut b = MethodBuilder::new("caller", Signature::new(vec![], ValueType::Void), &cc);
        let x = b.iconst(1);
        let buf = b.local(ValueType::Struct(StructLayout::new(12, 4)));
        let addr = b.var_addr(buf);
        b.call(CallTarget::Address(0), &sig, &[x, x, addr]).unwrap();
        let body = b.finish();
        let insts = &body.blocks[0].insts;
        let loads = insts.iter().filter(|i| matches!(i, Inst::Load { .. })).count();
        assert_eq!(loads, 3);
        let call = insts.last().unwrap();
        assert_eq!(call.out_regs().len(), 4);
        assert_eq!(call.out_regs()[3].1, AsmReg::gp(3));
        assert!(insts.iter().any(|i| matches!(i, Inst::OutArg { offset: 8, .. })));
    }

    #[test]
    fn test_struct_return_requires_buffer() {
        let sig = Signature::new(vec![], ValueType::Struct(StructLayout::new(24, 8)));
        let mut b = MethodBuilder::new("caller", Signature::new(vec![], ValueType::Void), &SysVConvention);
        assert!(b.call(CallTarget::Address(0), &sig, &[]).is_err());
        let local = b.local(ValueType::Struct(StructLayout::new(24, 8)));
        let addr = b.var_addr(local);
        b.call_with_buffer(CallTarget::Address(0), &sig, addr, &[]).unwrap();
        let body = b.finish();
        let call = body.blocks[0].insts.last().unwrap();
        assert_eq!(call.out_regs(), &[(addr.into(), x64::RDI)]);
    }

    #[test]
    fn test_argument_count_mismatch_is_rejected() {
        let sig = Signature::new(vec![ValueType::I32], ValueType::Void);
        let mut b = MethodBuilder::new("caller", Signature::new(vec![], ValueType::Void), &SysVConvention);
        let err = b.call(CallTarget::Address(0), &sig, &[]).unwrap_err();
        assert!(matches!(err, JitError::UnsupportedOperation { .. }));
    }
}
