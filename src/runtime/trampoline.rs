// Machine code for lazy compilation. Every method gets up to two small trampolines: a vtable
// trampoline stored in vtable slots and a direct trampoline that unresolved direct calls
// are linked against. Both load the address of their TrampInfo into r10 and jump to the one
// generic trampoline. The generic trampoline saves all sixteen general registers in a block
// on the stack, calls the runtime's handler with a pointer to that block, the info and the
// return address of the original call, restores every register except r11 and jumps to the
// address the handler returned, so the original call completes as if it had gone there
// directly. The handler finds what to patch by looking at the bytes in front of the return
// address: the fixed `call [reg+disp32]` of a virtual call or the `call rel32` of a direct
// call. Unbox stubs move `this` past the object header of a boxed value type and breakpoint
// stubs call the debugger notification before entering the method.

//! Trampolines, stubs and call-site decoding for x86-64.

use super::jit::Shared;
use crate::core::error::JitResult;
use crate::core::register_file::AsmReg;
use crate::ir::MethodId;
use crate::x64::encoder::{gp64, mov_imm64_bytes, CALL_VIRT_LEN};
use crate::x64::{R10, R11};
use iced_x86::code_asm::*;
use iced_x86::{Decoder, DecoderOptions, Mnemonic, OpKind, Register};
use std::sync::atomic::{AtomicU64, Ordering};

/// Bytes of the register block saved by the generic trampoline.
pub const SAVE_AREA: i32 = 128;

/// Bytes between a boxed object's address and its payload.
pub const OBJECT_HEADER_SIZE: u8 = 16;

pub const METHOD_TRAMPOLINE_SIZE: usize = 32;
pub const UNBOX_STUB_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrampKind {
    VTable,
    Direct,
}

/// Data a method trampoline passes to the handler.
#[derive(Debug)]
#[repr(C)]
pub struct TrampInfo {
    pub(crate) runtime: *const Shared,
    pub method: MethodId,
    pub kind: TrampKind,
}

// SAFETY: `runtime` points at the shared state of the runtime that owns this info and is
// only read through shared references.
unsafe impl Send for TrampInfo {}
unsafe impl Sync for TrampInfo {}

/// Signature of the routine the generic trampoline calls.
pub type TrampHandler = extern "C" fn(regs: *const u64, info: *const TrampInfo, ret: u64) -> u64;

const GP64_REGS: [Register; 16] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::RBX,
    Register::RSP,
    Register::RBP,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

fn jmp_r11(out: &mut [u8], target: u64) {
    out[..10].copy_from_slice(&mov_imm64_bytes(R11, target));
    out[10..13].copy_from_slice(&[0x41, 0xFF, 0xE3]);
}

/// The shared trampoline; position independent.
pub fn generic_trampoline(handler: TrampHandler) -> JitResult<Vec<u8>> {
    let mut a = CodeAssembler::new(64)?;
    a.sub(rsp, SAVE_AREA)?;
    for id in 0..16u8 {
        if id != 4 {
            a.mov(qword_ptr(rsp + 8 * i32::from(id)), gp64(AsmReg::gp(id))?)?;
        }
    }
    a.lea(r11, rsp + (SAVE_AREA + 8))?;
    a.mov(qword_ptr(rsp + 32), r11)?;
    a.mov(rdi, rsp)?;
    a.mov(rsi, r10)?;
    a.mov(rdx, qword_ptr(rsp + SAVE_AREA))?;
    a.sub(rsp, 8)?;
    a.mov(rax, handler as usize as u64)?;
    a.call(rax)?;
    a.add(rsp, 8)?;
    a.mov(r11, rax)?;
    for id in 0..16u8 {
        if id != 4 && id != 11 {
            a.mov(gp64(AsmReg::gp(id))?, qword_ptr(rsp + 8 * i32::from(id)))?;
        }
    }
    a.add(rsp, SAVE_AREA)?;
    a.jmp(r11)?;
    Ok(a.assemble(0)?)
}

/// `mov r10, info; mov r11, generic; jmp r11`.
pub fn method_trampoline(info: u64, generic: u64) -> [u8; METHOD_TRAMPOLINE_SIZE] {
    let mut out = [0xCC; METHOD_TRAMPOLINE_SIZE];
    out[..10].copy_from_slice(&mov_imm64_bytes(R10, info));
    jmp_r11(&mut out[10..], generic);
    out
}

/// `add rdi, OBJECT_HEADER_SIZE; mov r11, target; jmp r11`.
pub fn unbox_stub(target: u64) -> [u8; UNBOX_STUB_SIZE] {
    let mut out = [0xCC; UNBOX_STUB_SIZE];
    out[..4].copy_from_slice(&[0x48, 0x83, 0xC7, OBJECT_HEADER_SIZE]);
    jmp_r11(&mut out[4..], target);
    out
}

/// Calls `notify(ctx, method)` with the argument registers preserved, then enters `target`.
pub fn breakpoint_stub(ctx: u64, method: MethodId, notify: u64, target: u64) -> JitResult<Vec<u8>> {
    let saved = [rdi, rsi, rdx, rcx, r8, r9, rax];
    let mut a = CodeAssembler::new(64)?;
    for r in saved {
        a.push(r)?;
    }
    a.mov(rdi, ctx)?;
    a.mov(esi, method.0)?;
    a.mov(rax, notify)?;
    a.call(rax)?;
    for r in saved.into_iter().rev() {
        a.pop(r)?;
    }
    a.mov(r11, target)?;
    a.jmp(r11)?;
    Ok(a.assemble(0)?)
}

/// Location of the vtable slot a virtual call read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualCallSite {
    pub base: AsmReg,
    pub disp: i32,
}

/// Decode the `call [reg+disp32]` that ends at `ret`; `before` holds the bytes in front of it.
pub fn decode_virtual_call(before: &[u8], ret: u64) -> Option<VirtualCallSite> {
    let bytes = before.get(before.len().checked_sub(CALL_VIRT_LEN)?..)?;
    let mut decoder = Decoder::with_ip(64, bytes, ret - CALL_VIRT_LEN as u64, DecoderOptions::NONE);
    let inst = decoder.decode();
    if inst.is_invalid()
        || inst.len() != CALL_VIRT_LEN
        || inst.mnemonic() != Mnemonic::Call
        || inst.op0_kind() != OpKind::Memory
        || inst.memory_index() != Register::None
    {
        return None;
    }
    let id = GP64_REGS.iter().position(|r| *r == inst.memory_base())?;
    Some(VirtualCallSite {
        base: AsmReg::gp(id as u8),
        disp: inst.memory_displacement64() as i64 as i32,
    })
}

/// Address of the rel32 field of the `call rel32` ending at `ret`.
pub fn direct_call_field(before: &[u8], ret: u64) -> Option<u64> {
    let at = before.len().checked_sub(5)?;
    (before[at] == 0xE8).then_some(ret - 4)
}

/// A vtable whose slots start out pointing at vtable trampolines.
#[derive(Debug)]
pub struct VTable {
    slots: Box<[AtomicU64]>,
}

impl VTable {
    pub fn new(entries: &[u64]) -> Self {
        Self {
            slots: entries.iter().map(|e| AtomicU64::new(*e)).collect(),
        }
    }

    /// Address of slot 0, as loaded into the vtable register.
    pub fn address(&self) -> u64 {
        self.slots.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> Option<&AtomicU64> {
        self.slots.get(index)
    }

    pub fn get(&self, index: usize) -> Option<u64> {
        self.slot(index).map(|s| s.load(Ordering::Relaxed))
    }

    /// Displacement of slot `index` from the vtable address.
    pub fn disp(index: usize) -> i32 {
        (index * 8) as i32
    }
}
