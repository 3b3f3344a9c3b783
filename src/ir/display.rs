//! Textual form of the IR.
//!
//! The output is accepted back by [`crate::ir::parser`], so a printed method can be
//! edited and fed to the `rtjit` tool again. Calls print in their marshalled form,
//! with the argument registers listed explicitly.

use super::{BasicBlock, CallTarget, Inst, MethodBody, UnaryOp};
use std::fmt;

struct Disp(i32);

impl fmt::Display for Disp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 < 0 {
            write!(f, "-{}", -(i64::from(self.0)))
        } else {
            write!(f, "+{}", self.0)
        }
    }
}

impl fmt::Display for CallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallTarget::Method(id) => write!(f, "@#{}", id.0),
            CallTarget::Native(name) => write!(f, "${name}"),
            CallTarget::Address(addr) => write!(f, "*{addr:#x}"),
        }
    }
}

fn write_out_regs(f: &mut fmt::Formatter<'_>, inst: &Inst) -> fmt::Result {
    write!(f, " [")?;
    for (i, (r, h)) in inst.out_regs().iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{r}:%r{}", h.id)?;
    }
    write!(f, "]")
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inst::Nop => write!(f, "nop"),
            Inst::Iconst { dst, value } => write!(f, "{dst} = iconst {value}"),
            Inst::Move { dst, src } => write!(f, "{dst} = mov {src}"),
            Inst::Alu {
                op,
                size,
                dst,
                lhs,
                rhs,
            } => write!(f, "{dst} = {}.{} {lhs}, {rhs}", op.mnemonic(), size.suffix()),
            Inst::AluImm {
                op,
                size,
                dst,
                lhs,
                imm,
            } => write!(f, "{dst} = {}i.{} {lhs}, {imm}", op.mnemonic(), size.suffix()),
            Inst::Shift {
                op,
                size,
                dst,
                lhs,
                count,
            } => write!(f, "{dst} = {}.{} {lhs}, {count}", op.mnemonic(), size.suffix()),
            Inst::ShiftImm {
                op,
                size,
                dst,
                lhs,
                imm,
            } => write!(f, "{dst} = {}i.{} {lhs}, {imm}", op.mnemonic(), size.suffix()),
            Inst::Div {
                signed,
                rem,
                size,
                dst,
                lhs,
                rhs,
            } => {
                let m = match (rem, signed) {
                    (false, true) => "div",
                    (false, false) => "divu",
                    (true, true) => "rem",
                    (true, false) => "remu",
                };
                write!(f, "{dst} = {m}.{} {lhs}, {rhs}", size.suffix())
            }
            Inst::Unary { op, size, dst, src } => {
                let m = match op {
                    UnaryOp::Neg => "neg",
                    UnaryOp::Not => "not",
                };
                write!(f, "{dst} = {m}.{} {src}", size.suffix())
            }
            Inst::Cmp { size, lhs, rhs } => write!(f, "cmp.{} {lhs}, {rhs}", size.suffix()),
            Inst::CmpImm { size, lhs, imm } => write!(f, "cmpi.{} {lhs}, {imm}", size.suffix()),
            Inst::SetCc { cond, dst } => write!(f, "{dst} = set.{}", cond.mnemonic()),
            Inst::Load {
                size,
                dst,
                base,
                disp,
            } => write!(f, "{dst} = load.{} [{base}{}]", size.suffix(), Disp(*disp)),
            Inst::Store {
                size,
                base,
                disp,
                src,
            } => write!(f, "store.{} [{base}{}], {src}", size.suffix(), Disp(*disp)),
            Inst::StoreImm {
                size,
                base,
                disp,
                imm,
            } => write!(f, "storei.{} [{base}{}], {imm}", size.suffix(), Disp(*disp)),
            Inst::LoadVar { dst, var } => write!(f, "{dst} = ldvar {var}"),
            Inst::StoreVar { var, src } => write!(f, "stvar {var}, {src}"),
            Inst::VarAddr { dst, var } => write!(f, "{dst} = varaddr {var}"),
            Inst::SpillLoad { dst, slot } => write!(f, "{dst} = spill.load {slot}"),
            Inst::SpillStore { slot, src } => write!(f, "spill.store {slot}, {src}"),
            Inst::OutArg { offset, src } => write!(f, "outarg {offset}, {src}"),
            Inst::Localloc { dst, size } => write!(f, "{dst} = localloc {size}"),
            Inst::ExcAddr { dst, clause } => write!(f, "{dst} = ehaddr {clause}"),
            Inst::Jump { target } => write!(f, "jmp {target}"),
            Inst::Branch {
                cond,
                taken,
                not_taken,
            } => write!(f, "br.{} {taken}, {not_taken}", cond.mnemonic()),
            Inst::Call { dst, target, .. } => {
                if let Some(d) = dst {
                    write!(f, "{d} = ")?;
                }
                write!(f, "call {target}")?;
                write_out_regs(f, self)
            }
            Inst::CallVirt {
                dst, vtable, disp, ..
            } => {
                if let Some(d) = dst {
                    write!(f, "{d} = ")?;
                }
                write!(f, "callvirt [{vtable}{}]", Disp(*disp))?;
                write_out_regs(f, self)
            }
            Inst::Return { src: Some(r) } => write!(f, "ret {r}"),
            Inst::Return { src: None } => write!(f, "ret"),
        }
    }
}

impl fmt::Display for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.id)?;
        for inst in &self.insts {
            writeln!(f, "  {inst}")?;
        }
        Ok(())
    }
}

impl fmt::Display for MethodBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method {}{}", self.name, self.sig)?;
        let mut attrs = Vec::new();
        if self.sig.pinvoke {
            attrs.push("pinvoke");
        }
        if self.flags.has_eh_clauses {
            attrs.push("eh");
        }
        if self.flags.save_lmf {
            attrs.push("lmf");
        }
        if self.flags.trace {
            attrs.push("trace");
        }
        if self.flags.value_type_this {
            attrs.push("valuetype");
        }
        if !attrs.is_empty() {
            write!(f, " [{}]", attrs.join(", "))?;
        }
        writeln!(f, " {{")?;
        for var in &self.vars {
            if var.kind == super::VarKind::Local {
                writeln!(f, "  local {}", var.ty)?;
            }
        }
        for block in &self.blocks {
            write!(f, "{block}")?;
        }
        writeln!(f, "}}")
    }
}
