// This module drives one method through the backend. JitConfig is the configuration the
// runtime and the command-line tool share: the target, an optional override of the
// allocatable register set (used to squeeze the allocator into a small register budget),
// whether every method links an LMF record or calls the trace hooks, and the sizes of the
// executable regions for code and thunks. `compile_body` runs the fixed pipeline on a
// method body: cross-block demotion, lowering with the target's rules, local register
// allocation, frame layout and emission. The result keeps the allocated body and the frame
// next to the bytes so callers can print or interpret them. Installing the bytes and
// resolving patch sites is the runtime's job.

//! Compilation pipeline and configuration.

use super::error::{JitError, JitResult};
use super::register_file::RegMask;
use super::session::CompilationSession;
use crate::arm::{ArmConvention, ArmRules};
use crate::codegen::abi::CallingConvention;
use crate::codegen::emit::{emit_method, EmitOptions, EmittedCode};
use crate::codegen::frame::{allocate_frame, FrameLayout};
use crate::codegen::globals::demote_block_crossing;
use crate::codegen::lower::{lower_method, LoweringRules};
use crate::codegen::regalloc::{allocate_method, AllocSummary};
use crate::codegen::TargetIsa;
use crate::ir::{MethodBody, MethodId};
use crate::x64::{SysVConvention, X64Isa, X64Rules};
use crate::x86::CdeclConvention;
use std::fmt;
use std::str::FromStr;

/// Architectures the backend knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Target {
    #[default]
    X64,
    Arm,
    X86,
}

static X64_ISA: X64Isa = X64Isa;
static SYSV: SysVConvention = SysVConvention;
static ARM_CC: ArmConvention = ArmConvention {
    even_reg_pairs: true,
};
static CDECL: CdeclConvention = CdeclConvention;

impl Target {
    pub fn calling_convention(&self) -> &'static dyn CallingConvention {
        match self {
            Target::X64 => &SYSV,
            Target::Arm => &ARM_CC,
            Target::X86 => &CDECL,
        }
    }

    /// Lowering rules, for targets that have them.
    pub fn lowering_rules(&self) -> Option<&'static dyn LoweringRules> {
        match self {
            Target::X64 => Some(&X64Rules),
            Target::Arm => Some(&ArmRules),
            Target::X86 => None,
        }
    }

    /// Full code generator; only x86-64 emits machine code.
    pub fn isa(&self) -> JitResult<&'static dyn TargetIsa> {
        match self {
            Target::X64 => Ok(&X64_ISA),
            other => Err(JitError::unsupported(format!("code generation for {other}"))),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Target::X64 => "x86_64",
            Target::Arm => "arm",
            Target::X86 => "x86",
        })
    }
}

impl FromStr for Target {
    type Err = JitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86_64" | "x64" | "amd64" => Ok(Target::X64),
            "arm" | "arm32" => Ok(Target::Arm),
            "x86" | "i386" => Ok(Target::X86),
            other => Err(JitError::unsupported(format!("target `{other}`"))),
        }
    }
}

/// Settings shared by the runtime and the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitConfig {
    pub target: Target,
    /// Replaces the target's allocatable registers when set.
    pub allocatable: Option<RegMask>,
    /// Call the trace hooks in every method.
    pub trace: bool,
    /// Link an LMF record in every method.
    pub save_lmf: bool,
    /// Bytes reserved per executable code region.
    pub code_region_size: usize,
    /// Maximum number of thunks.
    pub thunk_pool_size: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            target: Target::X64,
            allocatable: None,
            trace: false,
            save_lmf: false,
            code_region_size: 1 << 20,
            thunk_pool_size: 1024,
        }
    }
}

/// Output of the pipeline for one method.
#[derive(Debug, Clone)]
pub struct CompiledMethod {
    pub id: MethodId,
    /// The body after demotion, lowering and allocation.
    pub body: MethodBody,
    pub frame: FrameLayout,
    pub alloc: AllocSummary,
    pub code: EmittedCode,
    /// Virtual registers turned into frame variables.
    pub demoted: usize,
}

/// Demote, lower and allocate `body` in place.
pub fn prepare_body(
    body: &mut MethodBody,
    config: &JitConfig,
    isa: &dyn TargetIsa,
    session: &CompilationSession<'_>,
) -> JitResult<(usize, AllocSummary)> {
    body.flags.trace |= config.trace;
    body.flags.save_lmf |= config.save_lmf;
    let demoted = demote_block_crossing(body);
    if demoted > 0 {
        log::debug!("{}: demoted {demoted} block-crossing registers", body.name);
    }
    lower_method(body, isa.lowering_rules())?;
    let summary = allocate_method(body, isa, config.allocatable, session)?;
    Ok((demoted, summary))
}

/// Run the whole pipeline on `body`.
pub fn compile_body(
    id: MethodId,
    mut body: MethodBody,
    config: &JitConfig,
    session: &CompilationSession<'_>,
) -> JitResult<CompiledMethod> {
    let isa = config.target.isa()?;
    let (demoted, alloc) = prepare_body(&mut body, config, isa, session)?;
    let frame = allocate_frame(&body, &isa.frame_params(), isa.calling_convention(), &alloc)?;
    let code = emit_method(isa, &body, &frame, &EmitOptions { method_id: id })?;
    for (block, offset) in &code.block_offsets {
        if let Some(b) = body.blocks.iter_mut().find(|b| b.id == *block) {
            b.native_offset = Some(*offset);
        }
    }
    session.record_method_compiled(&body.name, code.code.len());
    log::debug!(
        "{}: {} bytes, frame {} bytes, {} spills, {} reloads",
        body.name,
        code.code.len(),
        frame.frame_size,
        alloc.spills,
        alloc.reloads
    );
    Ok(CompiledMethod {
        id,
        body,
        frame,
        alloc,
        code,
        demoted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parser::parse_method;
    use bumpalo::Bump;

    #[test]
    fn test_target_names_parse() {
        assert_eq!("x86_64".parse::<Target>().unwrap(), Target::X64);
        assert_eq!("arm".parse::<Target>().unwrap(), Target::Arm);
        assert!("mips".parse::<Target>().is_err());
        assert_eq!(Target::X86.to_string(), "x86");
    }

    #[test]
    fn test_only_x64_generates_code() {
        assert!(Target::X64.isa().is_ok());
        assert!(matches!(
            Target::Arm.isa(),
            Err(JitError::UnsupportedOperation { .. })
        ));
        assert!(Target::X86.lowering_rules().is_none());
        assert_eq!(Target::Arm.calling_convention().word_size(), 4);
    }

    #[test]
    fn test_pipeline_leaves_no_virtual_registers() {
        let body = parse_method(
            "method add(i32, i32) -> i32 {\n\
             bb0:\n\
             \x20 v0 = ldvar var0\n\
             \x20 v1 = ldvar var1\n\
             \x20 v2 = add.i32 v0, v1\n\
             \x20 ret v2\n\
             }\n",
        )
        .unwrap();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let compiled = compile_body(MethodId(1), body, &JitConfig::default(), &session).unwrap();
        for block in &compiled.body.blocks {
            for inst in &block.insts {
                assert!(inst.regs().iter().all(|(r, _)| r.as_virt().is_none()), "{inst}");
            }
        }
        assert_eq!(compiled.body.blocks[0].native_offset, Some(compiled.code.prologue_len));
        assert_eq!(session.stats().methods_compiled, 1);
        assert!(!compiled.code.code.is_empty());
    }
}
