// This module turns allocated rtjit instructions into x86-64 machine code. X64Encoder wraps an
// iced-x86 CodeAssembler for the ordinary instructions (moves, ALU operations, loads and stores
// of every width, division, condition materialization) and appends the assembled bytes to the
// method's CodeBuffer. Everything whose bytes must sit at a known place is written raw instead:
// jmp/jcc/call with a rel32 placeholder, 64-bit immediates that are patched later and the
// fixed 8-byte `call [reg+disp32]` form used for virtual calls, whose shape the trampoline
// relies on when it decodes a call site. Direct calls are padded with nops so their
// displacement is 4-byte aligned and can be rewritten with one atomic store. The prologue and
// epilogue also live here: saved registers, the stack adjustment, the optional frame pointer,
// argument homes, LMF record linking and the trace hooks.

//! x86-64 instruction encoding using iced-x86.

use super::{R11, RAX, RBP, RCX, RDI, RDX, RSI, RSP};
use crate::codegen::abi::ArgStorage;
use crate::codegen::emit::{EmitContext, LMF_ADDR_SYMBOL, TRACE_ENTER_SYMBOL, TRACE_LEAVE_SYMBOL};
use crate::codegen::frame::var_mem_size;
use crate::codegen::patch::{PatchKind, PatchTarget};
use crate::core::error::{JitError, JitResult};
use crate::core::register_file::AsmReg;
use crate::ir::{AluOp, CallTarget, Cond, Inst, MemSize, OpSize, Reg, ShiftOp, UnaryOp, ValueType, VarId};
use iced_x86::code_asm::*;

/// Size of the fixed virtual call encoding.
pub const CALL_VIRT_LEN: usize = 8;

fn bad_reg(reg: AsmReg) -> JitError {
    JitError::unsupported(format!("register {reg} on x86-64"))
}

pub(crate) fn gp64(reg: AsmReg) -> JitResult<AsmRegister64> {
    const GP64_REGS: [AsmRegister64; 16] = [
        rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
    ];
    if !reg.is_gp() {
        return Err(bad_reg(reg));
    }
    GP64_REGS.get(reg.id as usize).copied().ok_or_else(|| bad_reg(reg))
}

fn gp32(reg: AsmReg) -> JitResult<AsmRegister32> {
    const GP32_REGS: [AsmRegister32; 16] = [
        eax, ecx, edx, ebx, esp, ebp, esi, edi, r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
    ];
    if !reg.is_gp() {
        return Err(bad_reg(reg));
    }
    GP32_REGS.get(reg.id as usize).copied().ok_or_else(|| bad_reg(reg))
}

fn gp16(reg: AsmReg) -> JitResult<AsmRegister16> {
    const GP16_REGS: [AsmRegister16; 16] = [
        ax, cx, dx, bx, sp, bp, si, di, r8w, r9w, r10w, r11w, r12w, r13w, r14w, r15w,
    ];
    if !reg.is_gp() {
        return Err(bad_reg(reg));
    }
    GP16_REGS.get(reg.id as usize).copied().ok_or_else(|| bad_reg(reg))
}

fn gp8(reg: AsmReg) -> JitResult<AsmRegister8> {
    const GP8_REGS: [AsmRegister8; 16] = [
        al, cl, dl, bl, spl, bpl, sil, dil, r8b, r9b, r10b, r11b, r12b, r13b, r14b, r15b,
    ];
    if !reg.is_gp() {
        return Err(bad_reg(reg));
    }
    GP8_REGS.get(reg.id as usize).copied().ok_or_else(|| bad_reg(reg))
}

/// Low nibble of the jcc/setcc opcode.
pub fn cond_code(cond: Cond) -> u8 {
    match cond {
        Cond::Eq => 0x4,
        Cond::Ne => 0x5,
        Cond::Lt => 0xC,
        Cond::Le => 0xE,
        Cond::Gt => 0xF,
        Cond::Ge => 0xD,
        Cond::Ltu => 0x2,
        Cond::Leu => 0x6,
        Cond::Gtu => 0x7,
        Cond::Geu => 0x3,
    }
}

fn invert(cond: Cond) -> Cond {
    match cond {
        Cond::Eq => Cond::Ne,
        Cond::Ne => Cond::Eq,
        Cond::Lt => Cond::Ge,
        Cond::Ge => Cond::Lt,
        Cond::Le => Cond::Gt,
        Cond::Gt => Cond::Le,
        Cond::Ltu => Cond::Geu,
        Cond::Geu => Cond::Ltu,
        Cond::Leu => Cond::Gtu,
        Cond::Gtu => Cond::Leu,
    }
}

/// `mov reg, imm64` with the immediate at byte 2.
pub fn mov_imm64_bytes(reg: AsmReg, imm: u64) -> [u8; 10] {
    let mut out = [0u8; 10];
    out[0] = 0x48 | u8::from(reg.id >= 8);
    out[1] = 0xB8 + (reg.id & 7);
    out[2..].copy_from_slice(&imm.to_le_bytes());
    out
}

/// `call qword ptr [base + disp32]` in its fixed 8-byte form.
pub fn call_virt_bytes(base: AsmReg, disp: i32) -> [u8; CALL_VIRT_LEN] {
    let mut out = [0u8; CALL_VIRT_LEN];
    out[0] = 0x40 | u8::from(base.id >= 8);
    out[1] = 0xFF;
    out[2] = 0x94;
    out[3] = 0x20 | (base.id & 7);
    out[4..].copy_from_slice(&disp.to_le_bytes());
    out
}

macro_rules! sized_rr {
    ($enc:expr, $size:expr, $method:ident, $dst:expr, $src:expr) => {
        match $size {
            OpSize::S32 => $enc.asm.$method(gp32($dst)?, gp32($src)?)?,
            OpSize::S64 => $enc.asm.$method(gp64($dst)?, gp64($src)?)?,
        }
    };
}

macro_rules! sized_ri {
    ($enc:expr, $size:expr, $method:ident, $dst:expr, $imm:expr) => {
        match $size {
            OpSize::S32 => $enc.asm.$method(gp32($dst)?, $imm)?,
            OpSize::S64 => $enc.asm.$method(gp64($dst)?, $imm)?,
        }
    };
}

/// x86-64 encoder writing into one method's code buffer.
pub struct X64Encoder<'c, 'a> {
    asm: CodeAssembler,
    ctx: &'c mut EmitContext<'a>,
}

impl<'c, 'a> X64Encoder<'c, 'a> {
    pub fn new(ctx: &'c mut EmitContext<'a>) -> JitResult<Self> {
        Ok(Self {
            asm: CodeAssembler::new(64)?,
            ctx,
        })
    }

    /// Append the instructions queued in the assembler to the code buffer.
    pub fn flush(&mut self) -> JitResult<()> {
        if self.asm.instructions().is_empty() {
            return Ok(());
        }
        let mut asm = std::mem::replace(&mut self.asm, CodeAssembler::new(64)?);
        let bytes = asm.assemble(self.ctx.offset() as u64)?;
        self.ctx.buf.put(&bytes);
        Ok(())
    }

    pub fn finish(mut self) -> JitResult<()> {
        self.flush()
    }

    fn raw(&mut self, bytes: &[u8]) -> JitResult<()> {
        self.flush()?;
        self.ctx.buf.put(bytes);
        Ok(())
    }

    fn phys(&self, inst: &Inst, reg: Reg) -> JitResult<AsmReg> {
        match reg {
            Reg::Phys(r) => Ok(r),
            Reg::Virt(v) => Err(self.ctx.ice(inst, format!("{v} reached the encoder"))),
        }
    }

    /// Register the frame is addressed from.
    fn frame_reg(&self) -> AsmReg {
        if self.ctx.frame.pinned_frame_pointer {
            RBP
        } else {
            RSP
        }
    }

    fn var_slot(&self, inst: &Inst, var: VarId) -> JitResult<(i32, MemSize)> {
        let slot = self
            .ctx
            .frame
            .var(var)
            .ok_or_else(|| self.ctx.ice(inst, format!("{var} has no frame slot")))?;
        let info = self
            .ctx
            .body
            .var(var)
            .ok_or_else(|| self.ctx.ice(inst, format!("{var} is not declared")))?;
        Ok((slot.offset, var_mem_size(info.ty, self.ctx.frame.word)))
    }

    fn mov_rr(&mut self, dst: AsmReg, src: AsmReg) -> JitResult<()> {
        if dst != src {
            self.asm.mov(gp64(dst)?, gp64(src)?)?;
        }
        Ok(())
    }

    fn mov_imm(&mut self, dst: AsmReg, value: i64) -> JitResult<()> {
        if let Ok(v) = u32::try_from(value) {
            self.asm.mov(gp32(dst)?, v)?;
        } else {
            self.asm.mov(gp64(dst)?, value)?;
        }
        Ok(())
    }

    fn load(&mut self, size: MemSize, dst: AsmReg, base: AsmReg, disp: i32) -> JitResult<()> {
        let b = gp64(base)?;
        match size {
            MemSize::I8 => self.asm.movsx(gp64(dst)?, byte_ptr(b + disp))?,
            MemSize::U8 => self.asm.movzx(gp32(dst)?, byte_ptr(b + disp))?,
            MemSize::I16 => self.asm.movsx(gp64(dst)?, word_ptr(b + disp))?,
            MemSize::U16 => self.asm.movzx(gp32(dst)?, word_ptr(b + disp))?,
            MemSize::I32 => self.asm.movsxd(gp64(dst)?, dword_ptr(b + disp))?,
            MemSize::U32 => self.asm.mov(gp32(dst)?, dword_ptr(b + disp))?,
            MemSize::I64 => self.asm.mov(gp64(dst)?, qword_ptr(b + disp))?,
        }
        Ok(())
    }

    fn store(&mut self, size: MemSize, base: AsmReg, disp: i32, src: AsmReg) -> JitResult<()> {
        let b = gp64(base)?;
        match size.bytes() {
            1 => self.asm.mov(byte_ptr(b + disp), gp8(src)?)?,
            2 => self.asm.mov(word_ptr(b + disp), gp16(src)?)?,
            4 => self.asm.mov(dword_ptr(b + disp), gp32(src)?)?,
            _ => self.asm.mov(qword_ptr(b + disp), gp64(src)?)?,
        }
        Ok(())
    }

    fn store_imm(&mut self, inst: &Inst, size: MemSize, base: AsmReg, disp: i32, imm: i64) -> JitResult<()> {
        let b = gp64(base)?;
        match size.bytes() {
            1 => self.asm.mov(byte_ptr(b + disp), i32::from(imm as u8 as i8))?,
            2 => self.asm.mov(word_ptr(b + disp), i32::from(imm as u16 as i16))?,
            4 => self.asm.mov(dword_ptr(b + disp), imm as u32 as i32)?,
            _ => {
                let v = i32::try_from(imm)
                    .map_err(|_| self.ctx.ice(inst, format!("store immediate {imm:#x} was not lowered")))?;
                self.asm.mov(qword_ptr(b + disp), v)?
            }
        }
        Ok(())
    }

    fn rel32_placeholder(&mut self, target: PatchTarget) {
        let at = self.ctx.offset();
        self.ctx.buf.put_u32(0);
        self.ctx.record(at, PatchKind::Rel32, target);
    }

    fn jump(&mut self, target: PatchTarget) -> JitResult<()> {
        self.raw(&[0xE9])?;
        self.rel32_placeholder(target);
        Ok(())
    }

    fn jcc(&mut self, cond: Cond, target: PatchTarget) -> JitResult<()> {
        self.raw(&[0x0F, 0x80 | cond_code(cond)])?;
        self.rel32_placeholder(target);
        Ok(())
    }

    /// `call rel32` with the displacement aligned for atomic patching.
    fn call_direct(&mut self, target: PatchTarget) -> JitResult<()> {
        self.flush()?;
        while (self.ctx.buf.len() + 1) % 4 != 0 {
            self.ctx.buf.put_u8(0x90);
        }
        self.ctx.buf.put_u8(0xE8);
        self.rel32_placeholder(target);
        Ok(())
    }

    fn call_absolute(&mut self, address: u64) -> JitResult<()> {
        self.raw(&mov_imm64_bytes(R11, address))?;
        self.raw(&[0x41, 0xFF, 0xD3])
    }

    fn two_operand(&mut self, inst: &Inst, dst: AsmReg, lhs: AsmReg, other: Option<AsmReg>) -> JitResult<()> {
        if dst != lhs {
            if other == Some(dst) {
                return Err(self.ctx.ice(inst, "destination overlaps the second source"));
            }
            self.mov_rr(dst, lhs)?;
        }
        Ok(())
    }

    pub fn prologue(&mut self) -> JitResult<()> {
        let frame = self.ctx.frame;
        let body = self.ctx.body;
        if frame.pinned_frame_pointer {
            self.asm.push(rbp)?;
        }
        for r in frame.used_callee_saved.iter() {
            self.asm.push(gp64(r)?)?;
        }
        if frame.frame_size > 0 {
            self.asm.sub(rsp, frame.frame_size as i32)?;
        }
        if frame.pinned_frame_pointer {
            self.asm.mov(rbp, rsp)?;
        }
        let fr = self.frame_reg();

        for (var, storage) in frame.register_args(body) {
            let slot = frame
                .var(var)
                .ok_or_else(|| JitError::internal(&body.name, format!("{var} has no frame slot")))?;
            let ty = body.var(var).map(|v| v.ty).unwrap_or(ValueType::I64);
            match storage {
                ArgStorage::Reg(r) => self.store(var_mem_size(ty, 8), fr, slot.offset, r)?,
                ArgStorage::RegPair(lo, hi) => {
                    self.store(MemSize::I64, fr, slot.offset, lo)?;
                    self.store(MemSize::I64, fr, slot.offset + 8, hi)?;
                }
                other => {
                    return Err(JitError::unsupported(format!(
                        "argument storage {other:?} on x86-64"
                    )))
                }
            }
        }

        if let Some(lmf) = frame.lmf_offset {
            let f = gp64(fr)?;
            self.call_direct(PatchTarget::NativeSymbol(LMF_ADDR_SYMBOL.to_string()))?;
            self.asm.mov(qword_ptr(f + (lmf + 8)), rax)?;
            self.asm.mov(rcx, qword_ptr(rax + 0))?;
            self.asm.mov(qword_ptr(f + lmf), rcx)?;
            self.asm.lea(rcx, f + lmf)?;
            self.asm.mov(qword_ptr(rax + 0), rcx)?;
            self.mov_imm(R11, i64::from(self.ctx.opts.method_id.0))?;
            self.asm.mov(qword_ptr(f + (lmf + 16)), r11)?;
            self.asm.mov(qword_ptr(f + (lmf + 24)), rsp)?;
        }

        if frame.trace_offset.is_some() {
            self.mov_imm(RDI, i64::from(self.ctx.opts.method_id.0))?;
            match body.arg_var(0) {
                Some(var) => {
                    let slot = frame
                        .var(var)
                        .ok_or_else(|| JitError::internal(&body.name, format!("{var} has no frame slot")))?;
                    let ty = body.var(var).map(|v| v.ty).unwrap_or(ValueType::I64);
                    self.load(var_mem_size(ty, 8), RSI, fr, slot.offset)?;
                }
                None => self.asm.xor(esi, esi)?,
            }
            self.call_direct(PatchTarget::NativeSymbol(TRACE_ENTER_SYMBOL.to_string()))?;
        }
        self.flush()
    }

    fn epilogue(&mut self, returns_value: bool) -> JitResult<()> {
        let frame = self.ctx.frame;
        let fr = gp64(self.frame_reg())?;
        if let Some(t) = frame.trace_offset {
            self.mov_imm(RDI, i64::from(self.ctx.opts.method_id.0))?;
            if returns_value {
                self.asm.mov(qword_ptr(fr + t), rax)?;
                self.asm.mov(rsi, rax)?;
            } else {
                self.asm.xor(esi, esi)?;
            }
            self.call_direct(PatchTarget::NativeSymbol(TRACE_LEAVE_SYMBOL.to_string()))?;
            if returns_value {
                self.asm.mov(rax, qword_ptr(fr + t))?;
            }
        }
        if let Some(lmf) = frame.lmf_offset {
            self.asm.mov(rcx, qword_ptr(fr + (lmf + 8)))?;
            self.asm.mov(rdx, qword_ptr(fr + lmf))?;
            self.asm.mov(qword_ptr(rcx + 0), rdx)?;
        }
        if frame.pinned_frame_pointer {
            self.asm.mov(rsp, rbp)?;
        }
        if frame.frame_size > 0 {
            self.asm.add(rsp, frame.frame_size as i32)?;
        }
        let saved: Vec<AsmReg> = frame.used_callee_saved.iter().collect();
        for r in saved.into_iter().rev() {
            self.asm.pop(gp64(r)?)?;
        }
        if frame.pinned_frame_pointer {
            self.asm.pop(rbp)?;
        }
        self.asm.ret()?;
        Ok(())
    }

    /// Encode one allocated instruction.
    pub fn encode(&mut self, inst: &Inst) -> JitResult<()> {
        match inst {
            Inst::Nop => self.asm.nop()?,
            Inst::Iconst { dst, value } => {
                let d = self.phys(inst, *dst)?;
                self.mov_imm(d, *value)?;
            }
            Inst::Move { dst, src } => {
                let (d, s) = (self.phys(inst, *dst)?, self.phys(inst, *src)?);
                self.mov_rr(d, s)?;
            }
            Inst::Alu {
                op,
                size,
                dst,
                lhs,
                rhs,
            } => {
                let (d, l, r) = (
                    self.phys(inst, *dst)?,
                    self.phys(inst, *lhs)?,
                    self.phys(inst, *rhs)?,
                );
                self.two_operand(inst, d, l, Some(r))?;
                match op {
                    AluOp::Add => sized_rr!(self, size, add, d, r),
                    AluOp::Sub => sized_rr!(self, size, sub, d, r),
                    AluOp::Mul => sized_rr!(self, size, imul_2, d, r),
                    AluOp::And => sized_rr!(self, size, and, d, r),
                    AluOp::Or => sized_rr!(self, size, or, d, r),
                    AluOp::Xor => sized_rr!(self, size, xor, d, r),
                }
            }
            Inst::AluImm {
                op,
                size,
                dst,
                lhs,
                imm,
            } => {
                let (d, l) = (self.phys(inst, *dst)?, self.phys(inst, *lhs)?);
                let v = match size {
                    OpSize::S32 => *imm as u32 as i32,
                    OpSize::S64 => i32::try_from(*imm)
                        .map_err(|_| self.ctx.ice(inst, format!("immediate {imm:#x} was not lowered")))?,
                };
                if *op == AluOp::Mul {
                    match size {
                        OpSize::S32 => self.asm.imul_3(gp32(d)?, gp32(l)?, v)?,
                        OpSize::S64 => self.asm.imul_3(gp64(d)?, gp64(l)?, v)?,
                    }
                } else {
                    self.two_operand(inst, d, l, None)?;
                    match op {
                        AluOp::Add => sized_ri!(self, size, add, d, v),
                        AluOp::Sub => sized_ri!(self, size, sub, d, v),
                        AluOp::And => sized_ri!(self, size, and, d, v),
                        AluOp::Or => sized_ri!(self, size, or, d, v),
                        AluOp::Xor => sized_ri!(self, size, xor, d, v),
                        AluOp::Mul => {}
                    }
                }
            }
            Inst::Shift {
                op,
                size,
                dst,
                lhs,
                count,
            } => {
                let (d, l, c) = (
                    self.phys(inst, *dst)?,
                    self.phys(inst, *lhs)?,
                    self.phys(inst, *count)?,
                );
                if c != RCX || d == RCX {
                    return Err(self.ctx.ice(inst, "shift count must be in rcx and the result elsewhere"));
                }
                self.two_operand(inst, d, l, Some(c))?;
                match op {
                    ShiftOp::Shl => sized_ri!(self, size, shl, d, cl),
                    ShiftOp::Shr => sized_ri!(self, size, shr, d, cl),
                    ShiftOp::Sar => sized_ri!(self, size, sar, d, cl),
                }
            }
            Inst::ShiftImm {
                op,
                size,
                dst,
                lhs,
                imm,
            } => {
                let (d, l) = (self.phys(inst, *dst)?, self.phys(inst, *lhs)?);
                self.two_operand(inst, d, l, None)?;
                let n = i32::from(*imm);
                match op {
                    ShiftOp::Shl => sized_ri!(self, size, shl, d, n),
                    ShiftOp::Shr => sized_ri!(self, size, shr, d, n),
                    ShiftOp::Sar => sized_ri!(self, size, sar, d, n),
                }
            }
            Inst::Div {
                signed,
                rem,
                size,
                dst,
                lhs,
                rhs,
            } => {
                let (d, l, r) = (
                    self.phys(inst, *dst)?,
                    self.phys(inst, *lhs)?,
                    self.phys(inst, *rhs)?,
                );
                let want = if *rem { RDX } else { RAX };
                if l != RAX || d != want || r == RAX || r == RDX {
                    return Err(self.ctx.ice(inst, "division operands are not in rax/rdx"));
                }
                match (signed, size) {
                    (true, OpSize::S32) => {
                        self.asm.cdq()?;
                        self.asm.idiv(gp32(r)?)?;
                    }
                    (true, OpSize::S64) => {
                        self.asm.cqo()?;
                        self.asm.idiv(gp64(r)?)?;
                    }
                    (false, OpSize::S32) => {
                        self.asm.xor(edx, edx)?;
                        self.asm.div(gp32(r)?)?;
                    }
                    (false, OpSize::S64) => {
                        self.asm.xor(edx, edx)?;
                        self.asm.div(gp64(r)?)?;
                    }
                }
            }
            Inst::Unary { op, size, dst, src } => {
                let (d, s) = (self.phys(inst, *dst)?, self.phys(inst, *src)?);
                self.two_operand(inst, d, s, None)?;
                match (op, size) {
                    (UnaryOp::Neg, OpSize::S32) => self.asm.neg(gp32(d)?)?,
                    (UnaryOp::Neg, OpSize::S64) => self.asm.neg(gp64(d)?)?,
                    (UnaryOp::Not, OpSize::S32) => self.asm.not(gp32(d)?)?,
                    (UnaryOp::Not, OpSize::S64) => self.asm.not(gp64(d)?)?,
                }
            }
            Inst::Cmp { size, lhs, rhs } => {
                let (l, r) = (self.phys(inst, *lhs)?, self.phys(inst, *rhs)?);
                sized_rr!(self, size, cmp, l, r);
            }
            Inst::CmpImm { size, lhs, imm } => {
                let l = self.phys(inst, *lhs)?;
                let v = match size {
                    OpSize::S32 => *imm as u32 as i32,
                    OpSize::S64 => i32::try_from(*imm)
                        .map_err(|_| self.ctx.ice(inst, format!("immediate {imm:#x} was not lowered")))?,
                };
                sized_ri!(self, size, cmp, l, v);
            }
            Inst::SetCc { cond, dst } => {
                let d = self.phys(inst, *dst)?;
                let b = gp8(d)?;
                match cond {
                    Cond::Eq => self.asm.sete(b)?,
                    Cond::Ne => self.asm.setne(b)?,
                    Cond::Lt => self.asm.setl(b)?,
                    Cond::Le => self.asm.setle(b)?,
                    Cond::Gt => self.asm.setg(b)?,
                    Cond::Ge => self.asm.setge(b)?,
                    Cond::Ltu => self.asm.setb(b)?,
                    Cond::Leu => self.asm.setbe(b)?,
                    Cond::Gtu => self.asm.seta(b)?,
                    Cond::Geu => self.asm.setae(b)?,
                }
                self.asm.movzx(gp32(d)?, b)?;
            }
            Inst::Load {
                size,
                dst,
                base,
                disp,
            } => {
                let (d, b) = (self.phys(inst, *dst)?, self.phys(inst, *base)?);
                self.load(*size, d, b, *disp)?;
            }
            Inst::Store {
                size,
                base,
                disp,
                src,
            } => {
                let (b, s) = (self.phys(inst, *base)?, self.phys(inst, *src)?);
                self.store(*size, b, *disp, s)?;
            }
            Inst::StoreImm {
                size,
                base,
                disp,
                imm,
            } => {
                let b = self.phys(inst, *base)?;
                self.store_imm(inst, *size, b, *disp, *imm)?;
            }
            Inst::LoadVar { dst, var } => {
                let d = self.phys(inst, *dst)?;
                let (off, size) = self.var_slot(inst, *var)?;
                let fr = self.frame_reg();
                self.load(size, d, fr, off)?;
            }
            Inst::StoreVar { var, src } => {
                let s = self.phys(inst, *src)?;
                let (off, size) = self.var_slot(inst, *var)?;
                let fr = self.frame_reg();
                self.store(size, fr, off, s)?;
            }
            Inst::VarAddr { dst, var } => {
                let d = self.phys(inst, *dst)?;
                let (off, _) = self.var_slot(inst, *var)?;
                let fr = gp64(self.frame_reg())?;
                self.asm.lea(gp64(d)?, fr + off)?;
            }
            Inst::SpillLoad { dst, slot } => {
                let d = self.phys(inst, *dst)?;
                let off = self
                    .ctx
                    .frame
                    .spill_offset(*slot)
                    .ok_or_else(|| self.ctx.ice(inst, format!("{slot} is outside the spill area")))?;
                let fr = self.frame_reg();
                self.load(MemSize::I64, d, fr, off)?;
            }
            Inst::SpillStore { slot, src } => {
                let s = self.phys(inst, *src)?;
                let off = self
                    .ctx
                    .frame
                    .spill_offset(*slot)
                    .ok_or_else(|| self.ctx.ice(inst, format!("{slot} is outside the spill area")))?;
                let fr = self.frame_reg();
                self.store(MemSize::I64, fr, off, s)?;
            }
            Inst::OutArg { offset, src } => {
                let s = self.phys(inst, *src)?;
                self.store(MemSize::I64, RSP, *offset as i32, s)?;
            }
            Inst::Localloc { dst, size } => {
                let (d, s) = (self.phys(inst, *dst)?, self.phys(inst, *size)?);
                self.two_operand(inst, d, s, None)?;
                let r = gp64(d)?;
                self.asm.add(r, 15)?;
                self.asm.and(r, -16)?;
                self.asm.sub(rsp, r)?;
                self.asm.lea(r, rsp + self.ctx.frame.param_area as i32)?;
            }
            Inst::ExcAddr { dst, clause } => {
                let d = self.phys(inst, *dst)?;
                self.raw(&mov_imm64_bytes(d, 0))?;
                let at = self.ctx.offset() - 8;
                self.ctx
                    .record(at, PatchKind::Deferred, PatchTarget::ExceptionEntry(*clause));
            }
            Inst::Jump { target } => {
                if self.ctx.next_block() != Some(*target) {
                    self.jump(PatchTarget::Block(*target))?;
                }
            }
            Inst::Branch {
                cond,
                taken,
                not_taken,
            } => {
                let next = self.ctx.next_block();
                if next == Some(*taken) {
                    self.jcc(invert(*cond), PatchTarget::Block(*not_taken))?;
                } else {
                    self.jcc(*cond, PatchTarget::Block(*taken))?;
                    if next != Some(*not_taken) {
                        self.jump(PatchTarget::Block(*not_taken))?;
                    }
                }
            }
            Inst::Call { target, .. } => match target {
                CallTarget::Method(m) => self.call_direct(PatchTarget::Method(*m))?,
                CallTarget::Native(name) => {
                    self.call_direct(PatchTarget::NativeSymbol(name.clone()))?
                }
                CallTarget::Address(a) => self.call_absolute(*a)?,
            },
            Inst::CallVirt { vtable, disp, .. } => {
                let v = self.phys(inst, *vtable)?;
                self.raw(&call_virt_bytes(v, *disp))?;
            }
            Inst::Return { src } => {
                if let Some(s) = src {
                    if self.phys(inst, *s)? != RAX {
                        return Err(self.ctx.ice(inst, "return value is not in rax"));
                    }
                }
                self.epilogue(src.is_some())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::emit::{emit_method, EmitOptions};
    use crate::codegen::frame::allocate_frame;
    use crate::codegen::regalloc::AllocSummary;
    use crate::codegen::TargetIsa;
    use crate::core::register_file::RegMask;
    use crate::ir::{BasicBlock, BlockId, MethodBody, MethodId, Signature};
    use crate::x64::{SysVConvention, X64Isa, R12};
    use iced_x86::{Decoder, DecoderOptions, Mnemonic, OpKind};

    fn p(r: AsmReg) -> Reg {
        Reg::Phys(r)
    }

    fn emit(body: &MethodBody, used: &[AsmReg]) -> crate::codegen::emit::EmittedCode {
        let summary = AllocSummary {
            used_regs: RegMask::of(used),
            ..AllocSummary::default()
        };
        let frame = allocate_frame(body, &X64Isa.frame_params(), &SysVConvention, &summary).unwrap();
        let opts = EmitOptions {
            method_id: MethodId(7),
        };
        emit_method(&X64Isa, body, &frame, &opts).unwrap()
    }

    fn mnemonics(code: &[u8]) -> Vec<Mnemonic> {
        let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
        let mut out = Vec::new();
        while decoder.can_decode() {
            out.push(decoder.decode().mnemonic());
        }
        out
    }

    #[test]
    fn test_add_method_encoding() {
        let sig = Signature::new(vec![ValueType::I32, ValueType::I32], ValueType::I32);
        let mut body = MethodBody::new("add", sig);
        let mut b0 = BasicBlock::new(BlockId(0));
        b0.insts = vec![
            Inst::LoadVar { dst: p(RAX), var: VarId(0) },
            Inst::LoadVar { dst: p(RCX), var: VarId(1) },
            Inst::Alu {
                op: AluOp::Add,
                size: OpSize::S32,
                dst: p(RAX),
                lhs: p(RAX),
                rhs: p(RCX),
            },
            Inst::Return { src: Some(p(RAX)) },
        ];
        body.blocks = vec![b0];
        let code = emit(&body, &[RAX, RCX]);
        assert_eq!(
            mnemonics(&code.code),
            vec![
                Mnemonic::Sub,
                Mnemonic::Mov,
                Mnemonic::Mov,
                Mnemonic::Movsxd,
                Mnemonic::Movsxd,
                Mnemonic::Add,
                Mnemonic::Add,
                Mnemonic::Ret
            ]
        );
        assert!(code.patches.is_empty());
    }

    #[test]
    fn test_constants_keep_their_full_value() {
        let values = [-5i64, 0xffff_ffff, 0x1_0000_0000, i64::MIN];
        let sig = Signature::new(vec![], ValueType::I64);
        let mut body = MethodBody::new("consts", sig);
        let mut b0 = BasicBlock::new(BlockId(0));
        b0.insts = values
            .iter()
            .map(|v| Inst::Iconst { dst: p(RAX), value: *v })
            .collect();
        b0.insts.push(Inst::Return { src: Some(p(RAX)) });
        body.blocks = vec![b0];
        let code = emit(&body, &[RAX]);

        let mut decoder = Decoder::with_ip(64, &code.code, 0, DecoderOptions::NONE);
        let mut loaded = Vec::new();
        while decoder.can_decode() {
            let inst = decoder.decode();
            if inst.mnemonic() == Mnemonic::Mov
                && matches!(
                    inst.op1_kind(),
                    OpKind::Immediate32 | OpKind::Immediate32to64 | OpKind::Immediate64
                )
            {
                loaded.push(inst.immediate(1));
            }
        }
        let expected: Vec<u64> = values.iter().map(|v| *v as u64).collect();
        assert_eq!(loaded, expected);
    }

    #[test]
    fn test_virtual_call_has_fixed_form() {
        assert_eq!(
            call_virt_bytes(R12, 0x40),
            [0x41, 0xFF, 0x94, 0x24, 0x40, 0x00, 0x00, 0x00]
        );
        let bytes = call_virt_bytes(RAX, -8);
        let mut decoder = Decoder::with_ip(64, &bytes, 0, DecoderOptions::NONE);
        let call = decoder.decode();
        assert_eq!(call.mnemonic(), Mnemonic::Call);
        assert_eq!(call.len(), CALL_VIRT_LEN);
        assert_eq!(call.memory_base(), iced_x86::Register::RAX);
        assert_eq!(call.memory_displacement64() as i64, -8);
    }

    #[test]
    fn test_direct_call_displacement_is_aligned() {
        let mut body = MethodBody::new("caller", Signature::new(vec![], ValueType::Void));
        let mut b0 = BasicBlock::new(BlockId(0));
        b0.insts = vec![
            Inst::Iconst { dst: p(RDI), value: 1 },
            Inst::Call {
                dst: None,
                target: CallTarget::Method(MethodId(3)),
                out_regs: vec![(p(RDI), RDI)],
            },
            Inst::Return { src: None },
        ];
        body.blocks = vec![b0];
        let code = emit(&body, &[RDI]);
        assert_eq!(code.patches.len(), 1);
        let site = &code.patches[0];
        assert_eq!(site.target, PatchTarget::Method(MethodId(3)));
        assert_eq!(site.offset % 4, 0);
        assert_eq!(code.code[site.offset as usize - 1], 0xE8);
    }

    #[test]
    fn test_fallthrough_branch_records_one_site() {
        let mut body = MethodBody::new("br", Signature::new(vec![], ValueType::I64));
        let mut b0 = BasicBlock::new(BlockId(0));
        b0.insts = vec![
            Inst::Iconst { dst: p(RAX), value: 5 },
            Inst::CmpImm {
                size: OpSize::S64,
                lhs: p(RAX),
                imm: 3,
            },
            Inst::Branch {
                cond: Cond::Lt,
                taken: BlockId(2),
                not_taken: BlockId(1),
            },
        ];
        let mut b1 = BasicBlock::new(BlockId(1));
        b1.insts = vec![Inst::Return { src: Some(p(RAX)) }];
        let mut b2 = BasicBlock::new(BlockId(2));
        b2.insts = vec![Inst::Jump { target: BlockId(1) }];
        body.blocks = vec![b0, b1, b2];
        let code = emit(&body, &[RAX]);
        let targets: Vec<_> = code.patches.iter().map(|s| s.target.clone()).collect();
        assert_eq!(
            targets,
            vec![PatchTarget::Block(BlockId(2)), PatchTarget::Block(BlockId(1))]
        );
        let jcc = code.patches[0].offset as usize;
        assert_eq!(code.code[jcc - 2..jcc], [0x0F, 0x8C]);
        assert!(code.block_offset(BlockId(2)).is_some());
    }

    #[test]
    fn test_virtual_register_is_rejected() {
        let mut body = MethodBody::new("bad", Signature::new(vec![], ValueType::I64));
        let mut b0 = BasicBlock::new(BlockId(0));
        b0.insts = vec![Inst::Iconst {
            dst: Reg::Virt(crate::ir::VReg::new(0)),
            value: 1,
        }];
        body.blocks = vec![b0];
        let frame = allocate_frame(&body, &X64Isa.frame_params(), &SysVConvention, &AllocSummary::default())
            .unwrap();
        let err = emit_method(&X64Isa, &body, &frame, &EmitOptions::default()).unwrap_err();
        assert!(matches!(err, JitError::InternalCompilerError { opcode: "iconst", .. }));
    }

    #[test]
    fn test_mov_imm64_layout() {
        let bytes = mov_imm64_bytes(R11, 0x1122_3344_5566_7788);
        assert_eq!(bytes[..2], [0x49, 0xBB]);
        assert_eq!(bytes[2..], 0x1122_3344_5566_7788u64.to_le_bytes());
    }
}
