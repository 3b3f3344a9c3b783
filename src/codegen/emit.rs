// Code emission driver. `emit_method` walks the allocated blocks in layout order and lets the
// target encode one instruction at a time into a CodeBuffer. Before each instruction the
// buffer is grown so that at least the target's worst-case length for that instruction is
// available; growth doubles the logical capacity, so a method of n bytes is copied O(log n)
// times. The encoder writes zero placeholders for anything whose address is not known yet
// and records a PatchSite next to it; block offsets are collected on the way so the patch
// resolver can turn block labels into displacements once the code has its final address.

//! Instruction emission into a growable code buffer.

use crate::codegen::frame::FrameLayout;
use crate::codegen::patch::{PatchKind, PatchSite, PatchTarget};
use crate::codegen::TargetIsa;
use crate::core::error::{JitError, JitResult};
use crate::ir::{BlockId, Inst, MethodBody, MethodId};

/// Native helper returning the address of the current thread's LMF list head.
pub const LMF_ADDR_SYMBOL: &str = "rtjit_get_lmf_addr";
/// Trace hook called on method entry with (method id, first argument).
pub const TRACE_ENTER_SYMBOL: &str = "rtjit_trace_enter";
/// Trace hook called on method exit with (method id, return value).
pub const TRACE_LEAVE_SYMBOL: &str = "rtjit_trace_leave";

const INITIAL_CAPACITY: usize = 256;

/// Growable byte buffer with doubling growth.
#[derive(Debug, Default, Clone)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
    capacity: usize,
    growths: u32,
}

impl CodeBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            capacity,
            growths: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of times the buffer has grown.
    pub fn growths(&self) -> u32 {
        self.growths
    }

    /// Make room for at least `headroom` more bytes.
    pub fn ensure(&mut self, headroom: usize) {
        if self.capacity - self.bytes.len() >= headroom {
            return;
        }
        let mut cap = self.capacity.max(16);
        while cap - self.bytes.len() < headroom {
            cap *= 2;
        }
        self.bytes.reserve(cap - self.bytes.len());
        self.capacity = cap;
        self.growths += 1;
    }

    pub fn put(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
        if self.bytes.len() > self.capacity {
            self.capacity = self.bytes.len();
        }
    }

    pub fn put_u8(&mut self, b: u8) {
        self.put(&[b]);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.put(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.put(&v.to_le_bytes());
    }

    /// Overwrite four bytes at `at`.
    pub fn patch_u32(&mut self, at: usize, v: u32) {
        if let Some(field) = self.bytes.get_mut(at..at + 4) {
            field.copy_from_slice(&v.to_le_bytes());
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Per-method emission settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmitOptions {
    /// Identity passed to the trace hooks and stored in the LMF record.
    pub method_id: MethodId,
}

impl Default for EmitOptions {
    fn default() -> Self {
        Self {
            method_id: MethodId(0),
        }
    }
}

/// State shared between the driver and the target encoder.
pub struct EmitContext<'a> {
    pub buf: CodeBuffer,
    pub body: &'a MethodBody,
    pub frame: &'a FrameLayout,
    pub opts: &'a EmitOptions,
    pub patches: Vec<PatchSite>,
    block_index: usize,
    inst_index: usize,
}

impl<'a> EmitContext<'a> {
    pub fn new(body: &'a MethodBody, frame: &'a FrameLayout, opts: &'a EmitOptions) -> Self {
        Self {
            buf: CodeBuffer::with_capacity(INITIAL_CAPACITY),
            body,
            frame,
            opts,
            patches: Vec::new(),
            block_index: 0,
            inst_index: 0,
        }
    }

    pub fn offset(&self) -> u32 {
        self.buf.len() as u32
    }

    /// Block laid out right after the current one.
    pub fn next_block(&self) -> Option<BlockId> {
        self.body.blocks.get(self.block_index + 1).map(|b| b.id)
    }

    pub fn record(&mut self, offset: u32, kind: PatchKind, target: PatchTarget) {
        log::trace!("  patch site +{offset:#x} {kind:?} -> {target}");
        self.patches.push(PatchSite::new(offset, kind, target));
    }

    /// Internal error pointing at the instruction being encoded.
    pub fn ice(&self, inst: &Inst, reason: impl Into<String>) -> JitError {
        let block = self.body.blocks.get(self.block_index).map_or(0, |b| b.id.0);
        JitError::at_inst(&self.body.name, block, self.inst_index, inst.name(), reason)
    }
}

/// Machine code of one method before it is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedCode {
    pub code: Vec<u8>,
    pub patches: Vec<PatchSite>,
    pub block_offsets: Vec<(BlockId, u32)>,
    pub prologue_len: u32,
}

impl EmittedCode {
    pub fn block_offset(&self, id: BlockId) -> Option<u32> {
        self.block_offsets.iter().find(|(b, _)| *b == id).map(|(_, o)| *o)
    }
}

/// Encode an allocated method.
pub fn emit_method(
    isa: &dyn TargetIsa,
    body: &MethodBody,
    frame: &FrameLayout,
    opts: &EmitOptions,
) -> JitResult<EmittedCode> {
    let mut ctx = EmitContext::new(body, frame, opts);
    ctx.buf.ensure(isa.max_prologue_length(frame));
    isa.emit_prologue(&mut ctx)?;
    let prologue_len = ctx.offset();

    let mut block_offsets = Vec::with_capacity(body.blocks.len());
    for (bi, block) in body.blocks.iter().enumerate() {
        ctx.block_index = bi;
        block_offsets.push((block.id, ctx.offset()));
        for (ii, inst) in block.insts.iter().enumerate() {
            ctx.inst_index = ii;
            let max = isa.max_length(inst, frame);
            ctx.buf.ensure(max);
            let start = ctx.buf.len();
            isa.encode(&mut ctx, inst)?;
            let used = ctx.buf.len() - start;
            if used > max {
                return Err(ctx.ice(inst, format!("encoded {used} bytes, limit is {max}")));
            }
            log::trace!("  +{start:#06x} {inst} ({used} bytes)");
        }
    }

    log::debug!(
        "{}: emitted {} bytes, {} patch sites, buffer grew {} times",
        body.name,
        ctx.buf.len(),
        ctx.patches.len(),
        ctx.buf.growths()
    );
    Ok(EmittedCode {
        code: ctx.buf.into_bytes(),
        patches: ctx.patches,
        block_offsets,
        prologue_len,
    })
}
