// Reference interpreter for method bodies. It runs IR either before register allocation
// (operands are virtual registers) or after it (operands are physical registers, spill
// slots hold evicted values), so a method can be executed at both stages and the results
// compared. The machine model is small: a map of virtual registers, a map of physical
// registers, spill slots, the flags of the last compare, and a flat byte-addressed memory
// that holds the frame variables, dynamic stack allocations and anything a test places
// there (for example a vtable). Reading a register that was never written is an error, and
// after every call the caller-saved registers are forgotten, which turns a value wrongly
// kept in a clobbered register across a call into an error instead of a silent success.
// Calls are delegated to an InterpEnv that sees the argument registers and the outgoing
// stack area exactly as the call instruction left them.

//! Reference interpreter over the IR, before and after allocation.

use super::{
    AluOp, BlockId, CallTarget, Inst, MethodBody, OpSize, Reg, ShiftOp, SpillSlot, UnaryOp, VReg, VarId, VarKind,
};
use crate::codegen::abi::{ArgStorage, CallInfo};
use crate::codegen::frame::var_mem_size;
use crate::core::error::{JitError, JitResult};
use crate::core::register_file::{AsmReg, RegMask};
use hashbrown::HashMap;

/// Flat little-endian memory starting at [`Memory::BASE`].
#[derive(Debug, Default, Clone)]
pub struct Memory {
    bytes: Vec<u8>,
}

impl Memory {
    pub const BASE: u64 = 0x1_0000;

    /// Reserve `size` zeroed bytes aligned to `align`.
    pub fn alloc(&mut self, size: u64, align: u64) -> u64 {
        let align = align.max(1);
        let start = (Self::BASE + self.bytes.len() as u64).div_ceil(align) * align;
        let end = start + size;
        self.bytes.resize((end - Self::BASE) as usize, 0);
        start
    }

    fn range(&self, addr: u64, n: u64) -> Option<std::ops::Range<usize>> {
        let lo = addr.checked_sub(Self::BASE)?;
        let hi = lo.checked_add(n)?;
        (hi <= self.bytes.len() as u64).then(|| lo as usize..hi as usize)
    }

    /// Read `n` (at most 8) bytes zero-extended.
    pub fn read(&self, addr: u64, n: u32) -> Option<u64> {
        let r = self.range(addr, u64::from(n))?;
        let mut raw = [0u8; 8];
        raw[..n as usize].copy_from_slice(&self.bytes[r]);
        Some(u64::from_le_bytes(raw))
    }

    /// Write the low `n` bytes of `value`.
    pub fn write(&mut self, addr: u64, n: u32, value: u64) -> bool {
        match self.range(addr, u64::from(n)) {
            Some(r) => {
                self.bytes[r].copy_from_slice(&value.to_le_bytes()[..n as usize]);
                true
            }
            None => false,
        }
    }
}

/// What a call instruction invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callee<'a> {
    Direct(&'a CallTarget),
    /// Address loaded from a vtable slot.
    Indirect(u64),
}

/// Argument registers and outgoing stack area at a call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallFrame {
    pub regs: Vec<(AsmReg, u64)>,
    pub stack: Vec<u8>,
}

impl CallFrame {
    pub fn reg(&self, reg: AsmReg) -> Option<u64> {
        self.regs.iter().find(|(r, _)| *r == reg).map(|(_, v)| *v)
    }

    pub fn stack_word(&self, offset: u32, word: u32) -> Option<u64> {
        let lo = offset as usize;
        let bytes = self.stack.get(lo..lo + word as usize)?;
        let mut raw = [0u8; 8];
        raw[..bytes.len()].copy_from_slice(bytes);
        Some(u64::from_le_bytes(raw))
    }

    /// Scalar argument values in argument-slot order, as described by `info`.
    pub fn args(&self, info: &CallInfo, word: u32) -> Option<Vec<u64>> {
        info.args
            .iter()
            .map(|a| match a.storage {
                ArgStorage::Reg(r) => self.reg(r),
                ArgStorage::RegPair(lo, hi) => Some((self.reg(lo)? & 0xffff_ffff) | (self.reg(hi)? << 32)),
                ArgStorage::Stack { offset } => self.stack_word(offset, word),
                ArgStorage::Split { .. } | ArgStorage::None => None,
            })
            .collect()
    }
}

/// Host side of the interpreter.
pub trait InterpEnv {
    fn call(&mut self, callee: Callee<'_>, frame: &CallFrame) -> JitResult<u64>;

    /// Address of exception clause `clause`.
    fn exception_entry(&mut self, clause: u32) -> u64 {
        0xE000_0000 + u64::from(clause)
    }
}

/// Environment for methods that make no calls.
pub struct NoCalls;

impl InterpEnv for NoCalls {
    fn call(&mut self, callee: Callee<'_>, _frame: &CallFrame) -> JitResult<u64> {
        Err(JitError::unsupported(format!("call to {callee:?} while interpreting")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpConfig {
    pub word: u32,
    /// Registers forgotten after every call.
    pub caller_saved: RegMask,
    /// Instruction budget; running out is an error.
    pub fuel: u64,
}

impl Default for InterpConfig {
    fn default() -> Self {
        Self {
            word: 8,
            caller_saved: crate::x64::CALLER_SAVED,
            fuel: 1_000_000,
        }
    }
}

enum Flow {
    Next,
    Jump(BlockId),
    Return(Option<u64>),
}

fn mask(v: u64, size: OpSize) -> u64 {
    match size {
        OpSize::S32 => v & 0xffff_ffff,
        OpSize::S64 => v,
    }
}

pub struct Interpreter<'b> {
    body: &'b MethodBody,
    cfg: InterpConfig,
    memory: Memory,
    vregs: HashMap<VReg, u64>,
    phys: HashMap<AsmReg, u64>,
    spills: HashMap<SpillSlot, u64>,
    var_addrs: Vec<u64>,
    out_area: Vec<u8>,
    flags: Option<(u64, u64, OpSize)>,
    block: usize,
    index: usize,
}

impl<'b> Interpreter<'b> {
    pub fn new(body: &'b MethodBody, cfg: InterpConfig) -> Self {
        Self {
            body,
            cfg,
            memory: Memory::default(),
            vregs: HashMap::new(),
            phys: HashMap::new(),
            spills: HashMap::new(),
            var_addrs: Vec::new(),
            out_area: Vec::new(),
            flags: None,
            block: 0,
            index: 0,
        }
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    fn fault(&self, reason: impl Into<String>) -> JitError {
        let (block, opcode) = match self.body.blocks.get(self.block) {
            Some(b) => (b.id.0, b.insts.get(self.index).map_or("-", |i| i.name())),
            None => (0, "-"),
        };
        JitError::at_inst(&self.body.name, block, self.index, opcode, reason)
    }

    fn read(&self, reg: Reg) -> JitResult<u64> {
        match reg {
            Reg::Virt(v) => self.vregs.get(&v).copied().ok_or_else(|| self.fault(format!("{v} read before it was written"))),
            Reg::Phys(r) => self
                .phys
                .get(&r)
                .copied()
                .ok_or_else(|| self.fault(format!("register {r} holds no value"))),
        }
    }

    fn write(&mut self, reg: Reg, value: u64) {
        match reg {
            Reg::Virt(v) => {
                self.vregs.insert(v, value);
            }
            Reg::Phys(r) => {
                self.phys.insert(r, value);
            }
        }
    }

    fn load(&self, addr: u64, bytes: u32) -> JitResult<u64> {
        self.memory
            .read(addr, bytes)
            .ok_or_else(|| self.fault(format!("load of {bytes} bytes at {addr:#x} is out of bounds")))
    }

    fn store(&mut self, addr: u64, bytes: u32, value: u64) -> JitResult<()> {
        if self.memory.write(addr, bytes, value) {
            Ok(())
        } else {
            Err(self.fault(format!("store of {bytes} bytes at {addr:#x} is out of bounds")))
        }
    }

    fn var_addr(&self, var: VarId) -> JitResult<u64> {
        self.var_addrs
            .get(var.index())
            .copied()
            .ok_or_else(|| self.fault(format!("unknown variable {var}")))
    }

    fn setup_frame(&mut self, args: &[u64]) -> JitResult<()> {
        let word = self.cfg.word;
        let argc = self.body.sig.arg_count();
        if args.len() < argc {
            return Err(JitError::unsupported(format!(
                "{} takes {argc} arguments, {} given",
                self.body.name,
                args.len()
            )));
        }
        for info in &self.body.vars {
            let size = info.ty.size(word).unwrap_or(word).max(8);
            let addr = self.memory.alloc(u64::from(size), 8);
            self.var_addrs.push(addr);
            let init = match info.kind {
                VarKind::Arg(n) => args.get(n as usize).copied(),
                VarKind::VRet => args.get(argc).copied(),
                VarKind::Local => None,
            };
            if let Some(v) = init {
                let width = var_mem_size(info.ty, word).bytes();
                self.memory.write(addr, width, v);
            }
        }
        Ok(())
    }

    /// Run the method with `args` (one value per argument slot, then the struct return
    /// buffer address if the method has one).
    pub fn run(&mut self, args: &[u64], env: &mut dyn InterpEnv) -> JitResult<Option<u64>> {
        self.setup_frame(args)?;
        self.block = 0;
        self.index = 0;
        let body = self.body;
        let mut fuel = self.cfg.fuel;
        loop {
            let Some(block) = body.blocks.get(self.block) else {
                return Err(self.fault("execution ran past the last block"));
            };
            let Some(inst) = block.insts.get(self.index) else {
                self.block += 1;
                self.index = 0;
                continue;
            };
            if fuel == 0 {
                return Err(self.fault("instruction budget exhausted"));
            }
            fuel -= 1;
            match self.step(inst, env)? {
                Flow::Next => self.index += 1,
                Flow::Jump(target) => {
                    self.block = body
                        .blocks
                        .iter()
                        .position(|b| b.id == target)
                        .ok_or_else(|| self.fault(format!("jump to unknown block {target}")))?;
                    self.index = 0;
                }
                Flow::Return(v) => {
                    log::trace!("{} returned {v:?}", self.body.name);
                    return Ok(v);
                }
            }
        }
    }

    fn flags(&self) -> JitResult<(u64, u64, OpSize)> {
        self.flags.ok_or_else(|| self.fault("condition read without a preceding compare"))
    }

    fn alu(&self, op: AluOp, size: OpSize, a: u64, b: u64) -> u64 {
        let r = match op {
            AluOp::Add => a.wrapping_add(b),
            AluOp::Sub => a.wrapping_sub(b),
            AluOp::Mul => a.wrapping_mul(b),
            AluOp::And => a & b,
            AluOp::Or => a | b,
            AluOp::Xor => a ^ b,
        };
        mask(r, size)
    }

    fn shift(&self, op: ShiftOp, size: OpSize, a: u64, count: u64) -> u64 {
        let c = (count & u64::from(size.bits() - 1)) as u32;
        match (op, size) {
            (ShiftOp::Shl, _) => mask(a << c, size),
            (ShiftOp::Shr, OpSize::S32) => u64::from((a as u32) >> c),
            (ShiftOp::Shr, OpSize::S64) => a >> c,
            (ShiftOp::Sar, OpSize::S32) => u64::from(((a as u32 as i32) >> c) as u32),
            (ShiftOp::Sar, OpSize::S64) => ((a as i64) >> c) as u64,
        }
    }

    fn divide(&self, signed: bool, rem: bool, size: OpSize, a: u64, b: u64) -> JitResult<u64> {
        let r = match (size, signed) {
            (OpSize::S32, true) => {
                let (x, y) = (a as u32 as i32, b as u32 as i32);
                let r = if rem { x.checked_rem(y) } else { x.checked_div(y) };
                r.map(|v| u64::from(v as u32))
            }
            (OpSize::S32, false) => {
                let (x, y) = (a as u32, b as u32);
                let r = if rem { x.checked_rem(y) } else { x.checked_div(y) };
                r.map(u64::from)
            }
            (OpSize::S64, true) => {
                let (x, y) = (a as i64, b as i64);
                let r = if rem { x.checked_rem(y) } else { x.checked_div(y) };
                r.map(|v| v as u64)
            }
            (OpSize::S64, false) => {
                if rem {
                    a.checked_rem(b)
                } else {
                    a.checked_div(b)
                }
            }
        };
        r.ok_or_else(|| self.fault(format!("division fault: {a:#x} / {b:#x}")))
    }

    fn call(&mut self, callee: Callee<'_>, inst: &Inst, env: &mut dyn InterpEnv) -> JitResult<()> {
        let mut frame = CallFrame {
            regs: Vec::with_capacity(inst.out_regs().len()),
            stack: std::mem::take(&mut self.out_area),
        };
        for (value, reg) in inst.out_regs() {
            frame.regs.push((*reg, self.read(*value)?));
        }
        let result = env.call(callee, &frame)?;
        let clobbered = self.cfg.caller_saved;
        self.phys.retain(|r, _| !clobbered.contains(*r));
        if let Some(dst) = inst.dreg() {
            self.write(dst, result);
        }
        Ok(())
    }

    fn step(&mut self, inst: &Inst, env: &mut dyn InterpEnv) -> JitResult<Flow> {
        match inst {
            Inst::Nop => {}
            Inst::Iconst { dst, value } => self.write(*dst, *value as u64),
            Inst::Move { dst, src } => {
                let v = self.read(*src)?;
                self.write(*dst, v);
            }
            Inst::Alu {
                op,
                size,
                dst,
                lhs,
                rhs,
            } => {
                let v = self.alu(*op, *size, self.read(*lhs)?, self.read(*rhs)?);
                self.write(*dst, v);
            }
            Inst::AluImm {
                op,
                size,
                dst,
                lhs,
                imm,
            } => {
                let v = self.alu(*op, *size, self.read(*lhs)?, *imm as u64);
                self.write(*dst, v);
            }
            Inst::Shift {
                op,
                size,
                dst,
                lhs,
                count,
            } => {
                let v = self.shift(*op, *size, self.read(*lhs)?, self.read(*count)?);
                self.write(*dst, v);
            }
            Inst::ShiftImm {
                op,
                size,
                dst,
                lhs,
                imm,
            } => {
                let v = self.shift(*op, *size, self.read(*lhs)?, u64::from(*imm));
                self.write(*dst, v);
            }
            Inst::Div {
                signed,
                rem,
                size,
                dst,
                lhs,
                rhs,
            } => {
                let v = self.divide(*signed, *rem, *size, self.read(*lhs)?, self.read(*rhs)?)?;
                self.write(*dst, v);
            }
            Inst::Unary { op, size, dst, src } => {
                let a = self.read(*src)?;
                let v = match op {
                    UnaryOp::Neg => a.wrapping_neg(),
                    UnaryOp::Not => !a,
                };
                self.write(*dst, mask(v, *size));
            }
            Inst::Cmp { size, lhs, rhs } => {
                self.flags = Some((self.read(*lhs)?, self.read(*rhs)?, *size));
            }
            Inst::CmpImm { size, lhs, imm } => {
                self.flags = Some((self.read(*lhs)?, *imm as u64, *size));
            }
            Inst::SetCc { cond, dst } => {
                let (a, b, size) = self.flags()?;
                self.write(*dst, u64::from(cond.eval(a, b, size)));
            }
            Inst::Load {
                size,
                dst,
                base,
                disp,
            } => {
                let addr = self.read(*base)?.wrapping_add(*disp as i64 as u64);
                let v = size.extend(self.load(addr, size.bytes())?);
                self.write(*dst, v);
            }
            Inst::Store {
                size,
                base,
                disp,
                src,
            } => {
                let addr = self.read(*base)?.wrapping_add(*disp as i64 as u64);
                let v = self.read(*src)?;
                self.store(addr, size.bytes(), v)?;
            }
            Inst::StoreImm {
                size,
                base,
                disp,
                imm,
            } => {
                let addr = self.read(*base)?.wrapping_add(*disp as i64 as u64);
                self.store(addr, size.bytes(), *imm as u64)?;
            }
            Inst::LoadVar { dst, var } => {
                let addr = self.var_addr(*var)?;
                let ty = self.body.vars[var.index()].ty;
                let width = var_mem_size(ty, self.cfg.word);
                let v = width.extend(self.load(addr, width.bytes())?);
                self.write(*dst, v);
            }
            Inst::StoreVar { var, src } => {
                let addr = self.var_addr(*var)?;
                let ty = self.body.vars[var.index()].ty;
                let v = self.read(*src)?;
                self.store(addr, var_mem_size(ty, self.cfg.word).bytes(), v)?;
            }
            Inst::VarAddr { dst, var } => {
                let addr = self.var_addr(*var)?;
                self.write(*dst, addr);
            }
            Inst::SpillLoad { dst, slot } => {
                let v = self
                    .spills
                    .get(slot)
                    .copied()
                    .ok_or_else(|| self.fault(format!("reload from {slot} before any spill")))?;
                self.write(*dst, v);
            }
            Inst::SpillStore { slot, src } => {
                let v = self.read(*src)?;
                self.spills.insert(*slot, v);
            }
            Inst::OutArg { offset, src } => {
                let v = self.read(*src)?;
                let lo = *offset as usize;
                let hi = lo + 8;
                if self.out_area.len() < hi {
                    self.out_area.resize(hi, 0);
                }
                self.out_area[lo..hi].copy_from_slice(&v.to_le_bytes());
            }
            Inst::Localloc { dst, size } => {
                let n = self.read(*size)?.div_ceil(16) * 16;
                let addr = self.memory.alloc(n, 16);
                self.write(*dst, addr);
            }
            Inst::ExcAddr { dst, clause } => {
                let v = env.exception_entry(*clause);
                self.write(*dst, v);
            }
            Inst::Jump { target } => return Ok(Flow::Jump(*target)),
            Inst::Branch {
                cond,
                taken,
                not_taken,
            } => {
                let (a, b, size) = self.flags()?;
                return Ok(Flow::Jump(if cond.eval(a, b, size) { *taken } else { *not_taken }));
            }
            Inst::Call { target, .. } => self.call(Callee::Direct(target), inst, env)?,
            Inst::CallVirt { vtable, disp, .. } => {
                let slot = self.read(*vtable)?.wrapping_add(*disp as i64 as u64);
                let fnptr = self.load(slot, 8)?;
                self.call(Callee::Indirect(fnptr), inst, env)?;
            }
            Inst::Return { src } => {
                let v = match src {
                    Some(r) => Some(self.read(*r)?),
                    None => None,
                };
                return Ok(Flow::Return(v));
            }
        }
        Ok(Flow::Next)
    }
}

/// Run `body` with no callees and the default configuration.
pub fn interpret(body: &MethodBody, args: &[u64]) -> JitResult<Option<u64>> {
    Interpreter::new(body, InterpConfig::default()).run(args, &mut NoCalls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::MethodBuilder;
    use crate::ir::parser::parse_method;
    use crate::ir::{Cond, MemSize, MethodId, Signature, ValueType};
    use crate::x64::{SysVConvention, RAX, RDI, RSI};

    #[test]
    fn test_loop_sums_to_n() {
        let body = parse_method(
            "method sum(i64) -> i64 {
bb0:
  v0 = ldvar var0
  v1 = iconst 0
  v2 = iconst 0
  jmp bb1
bb1:
  v1 = add.i64 v1, v2
  v2 = addi.i64 v2, 1
  cmp.i64 v2, v0
  br.le bb1, bb2
bb2:
  ret v1
}",
        )
        .unwrap();
        assert_eq!(interpret(&body, &[10]).unwrap(), Some(55));
    }

    #[test]
    fn test_thirty_two_bit_ops_zero_extend() {
        let mut b = MethodBuilder::new("m", Signature::new(vec![], ValueType::I64), &SysVConvention);
        let a = b.iconst(-1);
        let one = b.iconst(1);
        let s = b.alu(AluOp::Add, OpSize::S32, a, one);
        let n = b.unary(UnaryOp::Neg, OpSize::S32, one);
        let sar = b.shift_imm(ShiftOp::Sar, OpSize::S32, n, 4);
        let r = b.alu(AluOp::Or, OpSize::S64, s, sar);
        b.ret(Some(r));
        let body = b.finish();
        assert_eq!(interpret(&body, &[]).unwrap(), Some(0xffff_ffff));
    }

    #[test]
    fn test_division_by_zero_faults() {
        let mut b = MethodBuilder::new("m", Signature::new(vec![ValueType::I32], ValueType::I32), &SysVConvention);
        let x = b.arg(0).unwrap();
        let z = b.iconst(0);
        let q = b.div(true, false, OpSize::S32, x, z);
        b.ret(Some(q));
        let body = b.finish();
        assert!(matches!(
            interpret(&body, &[7]),
            Err(JitError::InternalCompilerError { opcode: "div", .. })
        ));
    }

    #[test]
    fn test_memory_and_variables() {
        let mut b = MethodBuilder::new("m", Signature::new(vec![], ValueType::I64), &SysVConvention);
        let local = b.local(ValueType::I64);
        let p = b.var_addr(local);
        b.store_imm(MemSize::I64, p, 0, -2);
        let lo = b.load(MemSize::U8, p, 0);
        let whole = b.load_var(local);
        b.cmp(OpSize::S64, whole, lo);
        let lt = b.setcc(Cond::Lt);
        let r = b.alu(AluOp::Add, OpSize::S64, lo, lt);
        b.ret(Some(r));
        let body = b.finish();
        assert_eq!(interpret(&body, &[]).unwrap(), Some(0xfe + 1));
    }

    struct Adder;

    impl InterpEnv for Adder {
        fn call(&mut self, callee: Callee<'_>, frame: &CallFrame) -> JitResult<u64> {
            assert_eq!(callee, Callee::Direct(&CallTarget::Method(MethodId(2))));
            Ok(frame.reg(RDI).unwrap_or(0) + frame.reg(RSI).unwrap_or(0))
        }
    }

    #[test]
    fn test_calls_see_marshalled_arguments() {
        let callee = Signature::new(vec![ValueType::I64, ValueType::I64], ValueType::I64);
        let mut b = MethodBuilder::new("m", Signature::new(vec![], ValueType::I64), &SysVConvention);
        let x = b.iconst(40);
        let y = b.iconst(2);
        let r = b.call(CallTarget::Method(MethodId(2)), &callee, &[x, y]).unwrap();
        b.ret(r);
        let body = b.finish();
        let mut interp = Interpreter::new(&body, InterpConfig::default());
        assert_eq!(interp.run(&[], &mut Adder).unwrap(), Some(42));
    }

    #[test]
    fn test_caller_saved_registers_are_forgotten_after_calls() {
        let body = parse_method(
            "method m() -> i64 {
bb0:
  %r0 = iconst 5
  %r3 = iconst 6
  call @#2 []
  ret %r0
}",
        )
        .unwrap();
        let mut interp = Interpreter::new(&body, InterpConfig::default());
        let err = interp.run(&[], &mut Adder).unwrap_err();
        assert!(err.to_string().contains(&format!("register {RAX} holds no value")));
    }
}
