// Stack frame layout. Offsets are positive and relative to the frame register, which is the
// stack pointer after the prologue's fixed adjustment (or the frame pointer copied from it
// when the frame pointer is pinned). From the bottom up the frame holds the outgoing argument
// area, the LMF record, the trace scratch slot, one slot per frame variable and finally the
// allocator's spill slots; above that sit the saved callee-saved registers, the return
// address and the caller's outgoing area with the incoming stack arguments.
//
// Arguments that arrive in registers get a home slot in the frame and are stored there by the
// prologue. Arguments that arrive on the stack are addressed in place in the caller's area.

//! Frame layout: variable homes, spill slots and saved registers.

use crate::codegen::abi::{ArgStorage, CallInfo, CallingConvention};
use crate::codegen::regalloc::AllocSummary;
use crate::core::error::{JitError, JitResult};
use crate::core::register_file::RegMask;
use crate::ir::{MemSize, MethodBody, SpillSlot, ValueType, VarId, VarKind};

/// Target facts the layout depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameParams {
    /// Pointer size in bytes; also the size of a pushed register and of a spill slot.
    pub word: u32,
    pub stack_align: u32,
    pub callee_saved: RegMask,
    pub lmf_size: u32,
}

/// Home of one frame variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarSlot {
    pub offset: i32,
    pub size: u32,
    /// Lives in the caller's outgoing area.
    pub incoming: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    /// Bytes subtracted from the stack pointer after the pushes.
    pub frame_size: u32,
    pub param_area: u32,
    pub lmf_offset: Option<i32>,
    pub trace_offset: Option<i32>,
    pub vars: Vec<VarSlot>,
    pub spill_base: i32,
    pub spill_slots: u32,
    pub used_callee_saved: RegMask,
    /// The frame pointer is kept for unwinding and dynamic allocation.
    pub pinned_frame_pointer: bool,
    pub call_info: CallInfo,
    pub word: u32,
}

impl FrameLayout {
    /// Number of registers pushed by the prologue.
    pub fn pushes(&self) -> u32 {
        self.used_callee_saved.count() + u32::from(self.pinned_frame_pointer)
    }

    pub fn var(&self, var: VarId) -> Option<&VarSlot> {
        self.vars.get(var.index())
    }

    pub fn spill_offset(&self, slot: SpillSlot) -> Option<i32> {
        if slot.0 >= self.spill_slots {
            return None;
        }
        Some(self.spill_base + (slot.0 * self.word) as i32)
    }

    /// Register arguments the prologue must store to their home slots.
    pub fn register_args(&self, body: &MethodBody) -> Vec<(VarId, ArgStorage)> {
        let mut out = Vec::new();
        for (i, info) in body.vars.iter().enumerate() {
            let storage = match info.kind {
                VarKind::Arg(n) => self.call_info.args.get(n as usize).map(|a| a.storage),
                VarKind::VRet => self.call_info.struct_ret.map(ArgStorage::Reg),
                VarKind::Local => None,
            };
            match storage {
                Some(s @ (ArgStorage::Reg(_) | ArgStorage::RegPair(..) | ArgStorage::Split { .. })) => {
                    out.push((VarId(i as u32), s))
                }
                _ => {}
            }
        }
        out
    }
}

/// Width used to move a variable of type `ty` between memory and a register.
pub fn var_mem_size(ty: ValueType, word: u32) -> MemSize {
    match ty {
        ValueType::Bool | ValueType::U8 => MemSize::U8,
        ValueType::I8 => MemSize::I8,
        ValueType::I16 => MemSize::I16,
        ValueType::Char | ValueType::U16 => MemSize::U16,
        ValueType::I32 => MemSize::I32,
        ValueType::U32 | ValueType::F32 => MemSize::U32,
        ValueType::IntPtr | ValueType::Ptr | ValueType::Object if word == 4 => MemSize::U32,
        ValueType::Struct(l) if l.size < 8 => match l.size {
            1 => MemSize::U8,
            2 | 3 => MemSize::U16,
            _ => MemSize::U32,
        },
        _ => MemSize::I64,
    }
}

fn align_up(v: u32, a: u32) -> u32 {
    v.div_ceil(a.max(1)) * a.max(1)
}

/// Lay out the frame of an allocated method.
pub fn allocate_frame(
    body: &MethodBody,
    params: &FrameParams,
    cc: &dyn CallingConvention,
    summary: &AllocSummary,
) -> JitResult<FrameLayout> {
    let word = params.word;
    let call_info = cc.compute_call_info(&body.sig)?;
    let pinned_frame_pointer = body.flags.has_eh_clauses || body.uses_alloca();
    let used_callee_saved = summary.used_callee_saved(params.callee_saved);
    let pushes = used_callee_saved.count() + u32::from(pinned_frame_pointer);

    let param_area = body.param_area();
    let mut offset = param_area;

    let lmf_offset = if body.flags.save_lmf {
        offset = align_up(offset, word);
        let at = offset;
        offset += params.lmf_size;
        Some(at)
    } else {
        None
    };
    let trace_offset = if body.flags.trace {
        offset = align_up(offset, word);
        let at = offset;
        offset += word;
        Some(at)
    } else {
        None
    };

    let mut vars = Vec::with_capacity(body.vars.len());
    let mut incoming: Vec<(usize, u32)> = Vec::new();
    for (i, info) in body.vars.iter().enumerate() {
        let size = info
            .ty
            .size(word)
            .ok_or_else(|| JitError::unsupported(format!("variable {i} of unsized type {}", info.ty)))?;
        let arg = match info.kind {
            VarKind::Arg(n) => call_info.args.get(n as usize),
            _ => None,
        };
        if let Some(ArgStorage::Stack { offset: o }) = arg.map(|a| a.storage) {
            incoming.push((i, o));
            vars.push(VarSlot {
                offset: 0,
                size,
                incoming: true,
            });
            continue;
        }
        let align = info.ty.align(word).unwrap_or(word).max(4);
        let size = if info.ty.is_struct() {
            align_up(size.max(1), word)
        } else {
            size.max(4)
        };
        offset = align_up(offset, align);
        vars.push(VarSlot {
            offset: offset as i32,
            size,
            incoming: false,
        });
        offset += size;
    }

    let spill_base = align_up(offset, word);
    let spill_slots = summary.spill_slots;
    offset = spill_base + spill_slots * word;

    let mut frame_size = align_up(offset, word);
    while (word + pushes * word + frame_size) % params.stack_align != 0 {
        frame_size += word;
    }

    let above = u64::from(frame_size) + u64::from((pushes + 1) * word);
    let limit = above + u64::from(call_info.stack_usage);
    if limit > i32::MAX as u64 {
        return Err(JitError::internal(
            &body.name,
            format!("frame of {limit} bytes exceeds the displacement range"),
        ));
    }
    for (i, o) in incoming {
        vars[i].offset = (above + u64::from(o)) as i32;
    }

    let layout = FrameLayout {
        frame_size,
        param_area,
        lmf_offset: lmf_offset.map(|o| o as i32),
        trace_offset: trace_offset.map(|o| o as i32),
        vars,
        spill_base: spill_base as i32,
        spill_slots,
        used_callee_saved,
        pinned_frame_pointer,
        call_info,
        word,
    };
    log::debug!(
        "{}: frame {} bytes, {} pushes, {} spill slots",
        body.name,
        layout.frame_size,
        pushes,
        spill_slots
    );
    Ok(layout)
}
