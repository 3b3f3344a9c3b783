// This module defines the method-level IR consumed by the rtjit backend. A MethodBody owns its
// signature, its frame variables (arguments first, then the hidden struct-return pointer if
// any, then locals), and an ordered list of basic blocks whose instructions are three-address
// operations over an unbounded supply of virtual registers. Virtual register ids are handed out
// by the body's monotonically increasing `next_vreg` counter; passes that introduce temporaries
// (call marshalling, cross-block demotion, lowering, allocation copies) draw from the same
// counter and refresh the per-block `max_vreg` watermark so allocator bookkeeping can be sized
// up front. Value types only matter at the boundaries the backend cares about: argument
// classification by calling conventions and the byte size of frame variables. Instruction
// operands are 64-bit integer registers; floating point code is not generated.

//! Intermediate representation: identifiers, types, signatures and method bodies.

pub mod builder;
pub mod display;
pub mod inst;
pub mod interp;
pub mod parser;

pub use inst::{AluOp, CallTarget, Cond, Inst, MemSize, OpSize, ShiftOp, UnaryOp};

use crate::core::register_file::AsmReg;
use std::fmt;

/// Virtual register id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(u32);

impl VReg {
    pub const fn new(id: u32) -> Self {
        VReg(id)
    }

    pub const fn id(&self) -> u32 {
        self.0
    }

    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for VReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Register operand: virtual before allocation, physical after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Virt(VReg),
    Phys(AsmReg),
}

impl Reg {
    pub fn as_virt(&self) -> Option<VReg> {
        match self {
            Reg::Virt(v) => Some(*v),
            Reg::Phys(_) => None,
        }
    }

    pub fn as_phys(&self) -> Option<AsmReg> {
        match self {
            Reg::Phys(r) => Some(*r),
            Reg::Virt(_) => None,
        }
    }
}

impl From<VReg> for Reg {
    fn from(v: VReg) -> Self {
        Reg::Virt(v)
    }
}

impl From<AsmReg> for Reg {
    fn from(r: AsmReg) -> Self {
        Reg::Phys(r)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::Virt(v) => write!(f, "{v}"),
            Reg::Phys(r) => write!(f, "%r{}", r.id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Frame variable (argument, hidden return pointer or local).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub u32);

impl VarId {
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "var{}", self.0)
    }
}

/// Spill slot handed out by the local allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpillSlot(pub u32);

impl fmt::Display for SpillSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Runtime identity of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Size and alignment of a value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StructLayout {
    pub size: u32,
    pub align: u32,
    /// Size of the native (marshalled) representation, used for pinvoke signatures.
    pub native_size: u32,
}

impl StructLayout {
    pub const fn new(size: u32, align: u32) -> Self {
        Self {
            size,
            align,
            native_size: size,
        }
    }
}

/// Types as seen by calling conventions and frame layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Void,
    Bool,
    Char,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    IntPtr,
    Ptr,
    Object,
    F32,
    F64,
    Struct(StructLayout),
    /// Uninstantiated generic parameter; has no size.
    TypeVar(u32),
}

impl ValueType {
    /// Byte size for a target with `word`-byte pointers, `None` when unsized.
    pub fn size(&self, word: u32) -> Option<u32> {
        Some(match self {
            ValueType::Void => 0,
            ValueType::Bool | ValueType::I8 | ValueType::U8 => 1,
            ValueType::Char | ValueType::I16 | ValueType::U16 => 2,
            ValueType::I32 | ValueType::U32 | ValueType::F32 => 4,
            ValueType::I64 | ValueType::U64 | ValueType::F64 => 8,
            ValueType::IntPtr | ValueType::Ptr | ValueType::Object => word,
            ValueType::Struct(layout) => layout.size,
            ValueType::TypeVar(_) => return None,
        })
    }

    pub fn align(&self, word: u32) -> Option<u32> {
        match self {
            ValueType::Struct(layout) => Some(layout.align.max(1)),
            other => other.size(word).map(|s| s.max(1)),
        }
    }

    pub fn is_struct(&self) -> bool {
        matches!(self, ValueType::Struct(_))
    }

    pub fn is_float(&self) -> bool {
        matches!(self, ValueType::F32 | ValueType::F64)
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            ValueType::I8 | ValueType::I16 | ValueType::I32 | ValueType::I64 | ValueType::IntPtr
        )
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Void => write!(f, "void"),
            ValueType::Bool => write!(f, "bool"),
            ValueType::Char => write!(f, "char"),
            ValueType::I8 => write!(f, "i8"),
            ValueType::U8 => write!(f, "u8"),
            ValueType::I16 => write!(f, "i16"),
            ValueType::U16 => write!(f, "u16"),
            ValueType::I32 => write!(f, "i32"),
            ValueType::U32 => write!(f, "u32"),
            ValueType::I64 => write!(f, "i64"),
            ValueType::U64 => write!(f, "u64"),
            ValueType::IntPtr => write!(f, "intptr"),
            ValueType::Ptr => write!(f, "ptr"),
            ValueType::Object => write!(f, "object"),
            ValueType::F32 => write!(f, "f32"),
            ValueType::F64 => write!(f, "f64"),
            ValueType::Struct(l) if l.native_size != l.size => {
                write!(f, "struct<{},{},{}>", l.size, l.align, l.native_size)
            }
            ValueType::Struct(l) => write!(f, "struct<{},{}>", l.size, l.align),
            ValueType::TypeVar(n) => write!(f, "!{n}"),
        }
    }
}

/// Method signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub params: Vec<ValueType>,
    pub ret: ValueType,
    pub has_this: bool,
    pub pinvoke: bool,
    /// Index of the first variadic parameter for vararg signatures.
    pub sentinel: Option<usize>,
}

impl Signature {
    pub fn new(params: Vec<ValueType>, ret: ValueType) -> Self {
        Self {
            params,
            ret,
            has_this: false,
            pinvoke: false,
            sentinel: None,
        }
    }

    pub fn with_this(mut self) -> Self {
        self.has_this = true;
        self
    }

    pub fn with_sentinel(mut self, pos: usize) -> Self {
        self.sentinel = Some(pos);
        self
    }

    pub fn pinvoke(mut self) -> Self {
        self.pinvoke = true;
        self
    }

    /// Number of argument slots including the implicit `this`.
    pub fn arg_count(&self) -> usize {
        self.params.len() + usize::from(self.has_this)
    }

    /// Type of argument slot `i`, counting `this` as slot 0 when present.
    pub fn arg_type(&self, i: usize) -> Option<ValueType> {
        if self.has_this {
            if i == 0 {
                Some(ValueType::Object)
            } else {
                self.params.get(i - 1).copied()
            }
        } else {
            self.params.get(i).copied()
        }
    }

    /// Token passed as the signature cookie of vararg calls (FNV-1a over the fixed part).
    pub fn cookie(&self) -> i64 {
        let fixed = self.sentinel.unwrap_or(self.params.len());
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for ty in &self.params[..fixed.min(self.params.len())] {
            for b in ty.to_string().bytes() {
                h ^= u64::from(b);
                h = h.wrapping_mul(0x0100_0000_01b3);
            }
        }
        (h & 0x7fff_ffff) as i64
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        let mut first = true;
        if self.has_this {
            write!(f, "this")?;
            first = false;
        }
        for (i, p) in self.params.iter().enumerate() {
            if self.sentinel == Some(i) {
                write!(f, "{}...", if first { "" } else { ", " })?;
                first = false;
            }
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{p}")?;
            first = false;
        }
        if self.sentinel == Some(self.params.len()) {
            write!(f, "{}...", if first { "" } else { ", " })?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

/// Role of a frame variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    /// Argument slot `n` of the signature (`this` is slot 0 when present).
    Arg(u32),
    /// Hidden pointer to the caller's struct return buffer.
    VRet,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarInfo {
    pub kind: VarKind,
    pub ty: ValueType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MethodFlags {
    /// The method has exception clauses; the frame pointer is pinned.
    pub has_eh_clauses: bool,
    /// Link an unwind (LMF) record in the prologue.
    pub save_lmf: bool,
    /// Call the trace hooks on entry and exit.
    pub trace: bool,
    /// Instance method of a value type; virtual dispatch passes a boxed `this`.
    pub value_type_this: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    pub id: BlockId,
    pub insts: Vec<Inst>,
    /// All virtual registers referenced in the block are below this id.
    pub max_vreg: u32,
    /// Offset of the block's first byte in the emitted code.
    pub native_offset: Option<u32>,
}

impl BasicBlock {
    pub fn new(id: BlockId) -> Self {
        Self {
            id,
            insts: Vec::new(),
            max_vreg: 0,
            native_offset: None,
        }
    }
}

/// A method body ready for the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodBody {
    pub name: String,
    pub sig: Signature,
    pub vars: Vec<VarInfo>,
    pub blocks: Vec<BasicBlock>,
    pub next_vreg: u32,
    pub flags: MethodFlags,
}

impl MethodBody {
    /// Create an empty body whose argument variables mirror `sig`.
    pub fn new(name: impl Into<String>, sig: Signature) -> Self {
        let mut vars = Vec::new();
        for i in 0..sig.arg_count() {
            let ty = sig.arg_type(i).unwrap_or(ValueType::Object);
            vars.push(VarInfo {
                kind: VarKind::Arg(i as u32),
                ty,
            });
        }
        if sig.ret.is_struct() {
            vars.push(VarInfo {
                kind: VarKind::VRet,
                ty: ValueType::Ptr,
            });
        }
        Self {
            name: name.into(),
            sig,
            vars,
            blocks: Vec::new(),
            next_vreg: 0,
            flags: MethodFlags::default(),
        }
    }

    pub fn new_vreg(&mut self) -> VReg {
        let v = VReg::new(self.next_vreg);
        self.next_vreg += 1;
        v
    }

    pub fn add_local(&mut self, ty: ValueType) -> VarId {
        self.vars.push(VarInfo {
            kind: VarKind::Local,
            ty,
        });
        VarId(self.vars.len() as u32 - 1)
    }

    pub fn arg_var(&self, n: u32) -> Option<VarId> {
        self.vars
            .iter()
            .position(|v| v.kind == VarKind::Arg(n))
            .map(|i| VarId(i as u32))
    }

    pub fn vret_var(&self) -> Option<VarId> {
        self.vars
            .iter()
            .position(|v| v.kind == VarKind::VRet)
            .map(|i| VarId(i as u32))
    }

    pub fn var(&self, id: VarId) -> Option<&VarInfo> {
        self.vars.get(id.index())
    }

    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.iter().find(|b| b.id == id)
    }

    /// Refresh every block's vreg watermark from the method counter.
    pub fn sync_watermarks(&mut self) {
        let next = self.next_vreg;
        for b in &mut self.blocks {
            b.max_vreg = next;
        }
    }

    /// Bytes of outgoing stack arguments needed by the calls in this body.
    pub fn param_area(&self) -> u32 {
        let mut area = 0u32;
        for inst in self.blocks.iter().flat_map(|b| b.insts.iter()) {
            if let Inst::OutArg { offset, .. } = inst {
                area = area.max(offset + 8);
            }
        }
        (area + 15) & !15
    }

    pub fn uses_alloca(&self) -> bool {
        self.blocks
            .iter()
            .flat_map(|b| b.insts.iter())
            .any(|i| matches!(i, Inst::Localloc { .. }))
    }

    pub fn inst_count(&self) -> usize {
        self.blocks.iter().map(|b| b.insts.len()).sum()
    }
}
