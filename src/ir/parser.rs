//! Parser for the textual IR printed by [`crate::ir::display`].
//!
//! A file holds one or more methods:
//!
//! ```text
//! ; comment
//! method add(i32, i32) -> i32 [trace] {
//!   local i64
//! bb0:
//!   v0 = ldvar var0
//!   v1 = ldvar var1
//!   v2 = add.i32 v0, v1
//!   ret v2
//! }
//! ```
//!
//! The parser is line oriented; each line is read by a small recursive-descent cursor.

use super::{
    AluOp, BasicBlock, BlockId, CallTarget, Cond, Inst, MemSize, MethodBody, MethodId, OpSize, Reg,
    ShiftOp, Signature, SpillSlot, StructLayout, UnaryOp, ValueType, VarId, VReg,
};
use crate::core::error::{JitError, JitResult};
use crate::core::register_file::AsmReg;

/// Parse a file holding exactly one method.
pub fn parse_method(text: &str) -> JitResult<MethodBody> {
    let mut methods = parse_module(text)?;
    match methods.len() {
        1 => Ok(methods.remove(0)),
        n => Err(error_at(0, format!("expected one method, found {n}"))),
    }
}

/// Parse every method in `text`, in file order.
pub fn parse_module(text: &str) -> JitResult<Vec<MethodBody>> {
    let mut parser = Parser::default();
    for (i, raw) in text.lines().enumerate() {
        let line = match raw.find(';') {
            Some(at) => &raw[..at],
            None => raw,
        }
        .trim();
        if line.is_empty() {
            continue;
        }
        parser.line = i + 1;
        parser.parse_line(line)?;
    }
    if parser.method.is_some() {
        return Err(parser.error("unterminated method at end of input"));
    }
    Ok(parser.done)
}

fn error_at(line: usize, message: impl Into<String>) -> JitError {
    JitError::Parse {
        line,
        message: message.into(),
    }
}

#[derive(Default)]
struct Parser {
    line: usize,
    method: Option<MethodBody>,
    /// Branch targets to check once the method is complete, with their lines.
    targets: Vec<(BlockId, usize)>,
    done: Vec<MethodBody>,
}

impl Parser {
    fn error(&self, message: impl Into<String>) -> JitError {
        error_at(self.line, message)
    }

    fn parse_line(&mut self, line: &str) -> JitResult<()> {
        let at = self.line;
        let Some(body) = self.method.as_mut() else {
            let body = self.header(line)?;
            self.method = Some(body);
            return Ok(());
        };
        if line == "}" {
            return self.finish_method();
        }
        let mut cur = Cursor::new(line, at);
        if cur.eat_word("local") {
            if !body.blocks.is_empty() {
                return Err(error_at(at, "locals must precede the first block"));
            }
            let ty = cur.ty()?;
            cur.end()?;
            body.add_local(ty);
            return Ok(());
        }
        if let Some(label) = line.strip_suffix(':') {
            let id = Cursor::new(label, at).block()?;
            if body.block(id).is_some() {
                return Err(error_at(at, format!("duplicate block {id}")));
            }
            body.blocks.push(BasicBlock::new(id));
            return Ok(());
        }
        let inst = cur.inst()?;
        cur.end()?;
        let block = body
            .blocks
            .last_mut()
            .ok_or_else(|| error_at(at, "instruction outside of a block"))?;
        for t in inst.successors() {
            self.targets.push((t, at));
        }
        block.insts.push(inst);
        Ok(())
    }

    fn header(&self, line: &str) -> JitResult<MethodBody> {
        let mut cur = Cursor::new(line, self.line);
        if !cur.eat_word("method") {
            return Err(self.error("expected `method`"));
        }
        let name = cur.name()?;
        let mut sig = cur.signature()?;
        let mut attrs = Vec::new();
        if cur.eat('[') {
            loop {
                attrs.push(cur.word()?);
                if cur.eat(']') {
                    break;
                }
                cur.expect(',')?;
            }
        }
        cur.expect('{')?;
        cur.end()?;
        if attrs.contains(&"pinvoke") {
            sig.pinvoke = true;
        }
        let mut body = MethodBody::new(name, sig);
        for a in attrs {
            match a {
                "pinvoke" => {}
                "eh" => body.flags.has_eh_clauses = true,
                "lmf" => body.flags.save_lmf = true,
                "trace" => body.flags.trace = true,
                "valuetype" => body.flags.value_type_this = true,
                other => return Err(self.error(format!("unknown attribute `{other}`"))),
            }
        }
        Ok(body)
    }

    fn finish_method(&mut self) -> JitResult<()> {
        let Some(mut body) = self.method.take() else {
            return Err(self.error("`}` outside of a method"));
        };
        for (t, line) in self.targets.drain(..) {
            if body.block(t).is_none() {
                return Err(error_at(line, format!("branch to undefined block {t}")));
            }
        }
        let max = body
            .blocks
            .iter()
            .flat_map(|b| b.insts.iter())
            .flat_map(|i| i.regs())
            .filter_map(|(r, _)| r.as_virt())
            .map(|v| v.id() + 1)
            .max()
            .unwrap_or(0);
        body.next_vreg = max;
        body.sync_watermarks();
        log::debug!("parsed {} ({} blocks)", body.name, body.blocks.len());
        self.done.push(body);
        Ok(())
    }
}

struct Cursor<'a> {
    text: &'a str,
    pos: usize,
    line: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str, line: usize) -> Self {
        Self { text, pos: 0, line }
    }

    fn error(&self, message: impl Into<String>) -> JitError {
        error_at(self.line, message)
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.text.len() - trimmed.len();
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.rest().chars().next()
    }

    fn eat(&mut self, ch: char) -> bool {
        if self.peek() == Some(ch) {
            self.pos += ch.len_utf8();
            true
        } else {
            false
        }
    }

    fn eat_str(&mut self, s: &str) -> bool {
        self.skip_ws();
        if self.rest().starts_with(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> JitResult<()> {
        if self.eat(ch) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{ch}` at `{}`", self.rest())))
        }
    }

    fn end(&mut self) -> JitResult<()> {
        match self.peek() {
            None => Ok(()),
            Some(_) => Err(self.error(format!("unexpected `{}`", self.rest()))),
        }
    }

    fn take_while(&mut self, f: impl Fn(char) -> bool) -> &'a str {
        self.skip_ws();
        let rest = self.rest();
        let len = rest.find(|c: char| !f(c)).unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }

    /// Lower-case keyword or mnemonic part.
    fn word(&mut self) -> JitResult<&'a str> {
        let w = self.take_while(|c| c.is_ascii_alphanumeric() || c == '_');
        if w.is_empty() {
            return Err(self.error(format!("expected a word at `{}`", self.rest())));
        }
        Ok(w)
    }

    fn eat_word(&mut self, w: &str) -> bool {
        self.skip_ws();
        let rest = self.rest();
        if !rest.starts_with(w) {
            return false;
        }
        let boundary = !matches!(rest[w.len()..].chars().next(), Some(c) if c.is_ascii_alphanumeric() || c == '_');
        if boundary {
            self.pos += w.len();
            true
        } else {
            false
        }
    }

    fn name(&mut self) -> JitResult<&'a str> {
        let n = self.take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '$'));
        if n.is_empty() {
            return Err(self.error("expected a method name"));
        }
        Ok(n)
    }

    fn int(&mut self) -> JitResult<i64> {
        self.skip_ws();
        let neg = self.eat('-');
        if !neg {
            self.eat('+');
        }
        let text = self.take_while(|c| c.is_ascii_hexdigit() || c == 'x' || c == 'X');
        let magnitude = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => text.parse::<u64>(),
        }
        .map_err(|_| self.error(format!("invalid integer `{text}`")))?;
        if neg {
            if magnitude > i64::MAX as u64 + 1 {
                return Err(self.error(format!("integer -{text} out of range")));
            }
            Ok((magnitude as i64).wrapping_neg())
        } else {
            Ok(magnitude as i64)
        }
    }

    fn uint<T: TryFrom<i64>>(&mut self) -> JitResult<T> {
        let v = self.int()?;
        T::try_from(v).map_err(|_| self.error(format!("{v} out of range")))
    }

    fn prefixed_number(&mut self, prefix: &str) -> JitResult<u32> {
        if !self.eat_str(prefix) {
            return Err(self.error(format!("expected `{prefix}` at `{}`", self.rest())));
        }
        let digits = self.take_while(|c| c.is_ascii_digit());
        digits
            .parse()
            .map_err(|_| self.error(format!("expected a number after `{prefix}`")))
    }

    fn reg(&mut self) -> JitResult<Reg> {
        match self.peek() {
            Some('v') => Ok(Reg::Virt(VReg::new(self.prefixed_number("v")?))),
            Some('%') => {
                let id = self.prefixed_number("%r")?;
                let id = u8::try_from(id).map_err(|_| self.error(format!("register %r{id} out of range")))?;
                Ok(Reg::Phys(AsmReg::gp(id)))
            }
            _ => Err(self.error(format!("expected a register at `{}`", self.rest()))),
        }
    }

    fn phys(&mut self) -> JitResult<AsmReg> {
        match self.reg()? {
            Reg::Phys(r) => Ok(r),
            Reg::Virt(v) => Err(self.error(format!("expected a physical register, found {v}"))),
        }
    }

    fn block(&mut self) -> JitResult<BlockId> {
        Ok(BlockId(self.prefixed_number("bb")?))
    }

    fn var(&mut self) -> JitResult<VarId> {
        Ok(VarId(self.prefixed_number("var")?))
    }

    fn slot(&mut self) -> JitResult<SpillSlot> {
        Ok(SpillSlot(self.prefixed_number("s")?))
    }

    fn ty(&mut self) -> JitResult<ValueType> {
        if self.eat('!') {
            let n = self.take_while(|c| c.is_ascii_digit());
            return n
                .parse()
                .map(ValueType::TypeVar)
                .map_err(|_| self.error("expected a type variable number"));
        }
        let w = self.word()?;
        Ok(match w {
            "void" => ValueType::Void,
            "bool" => ValueType::Bool,
            "char" => ValueType::Char,
            "i8" => ValueType::I8,
            "u8" => ValueType::U8,
            "i16" => ValueType::I16,
            "u16" => ValueType::U16,
            "i32" => ValueType::I32,
            "u32" => ValueType::U32,
            "i64" => ValueType::I64,
            "u64" => ValueType::U64,
            "intptr" => ValueType::IntPtr,
            "ptr" => ValueType::Ptr,
            "object" => ValueType::Object,
            "f32" => ValueType::F32,
            "f64" => ValueType::F64,
            "struct" => {
                self.expect('<')?;
                let size = self.uint()?;
                self.expect(',')?;
                let align = self.uint()?;
                let mut layout = StructLayout::new(size, align);
                if self.eat(',') {
                    layout.native_size = self.uint()?;
                }
                self.expect('>')?;
                ValueType::Struct(layout)
            }
            other => return Err(self.error(format!("unknown type `{other}`"))),
        })
    }

    fn signature(&mut self) -> JitResult<Signature> {
        self.expect('(')?;
        let mut sig = Signature::new(Vec::new(), ValueType::Void);
        if !self.eat(')') {
            loop {
                if self.eat_str("...") {
                    if sig.sentinel.is_some() {
                        return Err(self.error("more than one `...`"));
                    }
                    sig.sentinel = Some(sig.params.len());
                } else if self.eat_word("this") {
                    if sig.has_this || !sig.params.is_empty() {
                        return Err(self.error("`this` must be the first parameter"));
                    }
                    sig.has_this = true;
                } else {
                    sig.params.push(self.ty()?);
                }
                if self.eat(')') {
                    break;
                }
                self.expect(',')?;
            }
        }
        if !self.eat_str("->") {
            return Err(self.error("expected `->` after the parameter list"));
        }
        sig.ret = self.ty()?;
        Ok(sig)
    }

    /// `[base+disp]`
    fn mem(&mut self) -> JitResult<(Reg, i32)> {
        self.expect('[')?;
        let base = self.reg()?;
        let disp = match self.peek() {
            Some('+' | '-') => self.uint()?,
            _ => 0,
        };
        self.expect(']')?;
        Ok((base, disp))
    }

    fn op_size(&mut self) -> JitResult<OpSize> {
        self.expect('.')?;
        match self.word()? {
            "i32" => Ok(OpSize::S32),
            "i64" => Ok(OpSize::S64),
            other => Err(self.error(format!("unknown operation size `{other}`"))),
        }
    }

    fn mem_size(&mut self) -> JitResult<MemSize> {
        self.expect('.')?;
        let w = self.word()?;
        MemSize::from_suffix(w).ok_or_else(|| self.error(format!("unknown access size `{w}`")))
    }

    fn call_target(&mut self) -> JitResult<CallTarget> {
        if self.eat_str("@#") {
            return Ok(CallTarget::Method(MethodId(self.uint()?)));
        }
        if self.eat('$') {
            let name = self.take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':'));
            if name.is_empty() {
                return Err(self.error("expected a native symbol name"));
            }
            return Ok(CallTarget::Native(name.to_string()));
        }
        if self.eat('*') {
            return Ok(CallTarget::Address(self.int()? as u64));
        }
        Err(self.error(format!("expected a call target at `{}`", self.rest())))
    }

    fn out_regs(&mut self) -> JitResult<Vec<(Reg, AsmReg)>> {
        let mut out = Vec::new();
        self.expect('[')?;
        if self.eat(']') {
            return Ok(out);
        }
        loop {
            let value = self.reg()?;
            self.expect(':')?;
            out.push((value, self.phys()?));
            if self.eat(']') {
                return Ok(out);
            }
            self.expect(',')?;
        }
    }

    fn inst(&mut self) -> JitResult<Inst> {
        let dst = if matches!(self.peek(), Some('v' | '%')) {
            let r = self.reg()?;
            self.expect('=')?;
            Some(r)
        } else {
            None
        };
        let mnemonic = self.word()?;
        match dst {
            Some(dst) => self.def_inst(dst, mnemonic),
            None => self.effect_inst(mnemonic),
        }
    }

    /// Instructions of the form `dst = ...`.
    fn def_inst(&mut self, dst: Reg, m: &str) -> JitResult<Inst> {
        if let Some(op) = AluOp::from_mnemonic(m) {
            let size = self.op_size()?;
            let lhs = self.reg()?;
            self.expect(',')?;
            let rhs = self.reg()?;
            return Ok(Inst::Alu {
                op,
                size,
                dst,
                lhs,
                rhs,
            });
        }
        if let Some(op) = m.strip_suffix('i').and_then(AluOp::from_mnemonic) {
            let size = self.op_size()?;
            let lhs = self.reg()?;
            self.expect(',')?;
            let imm = self.int()?;
            return Ok(Inst::AluImm {
                op,
                size,
                dst,
                lhs,
                imm,
            });
        }
        if let Some(op) = ShiftOp::from_mnemonic(m) {
            let size = self.op_size()?;
            let lhs = self.reg()?;
            self.expect(',')?;
            let count = self.reg()?;
            return Ok(Inst::Shift {
                op,
                size,
                dst,
                lhs,
                count,
            });
        }
        if let Some(op) = m.strip_suffix('i').and_then(ShiftOp::from_mnemonic) {
            let size = self.op_size()?;
            let lhs = self.reg()?;
            self.expect(',')?;
            let imm = self.uint()?;
            return Ok(Inst::ShiftImm {
                op,
                size,
                dst,
                lhs,
                imm,
            });
        }
        Ok(match m {
            "iconst" => Inst::Iconst {
                dst,
                value: self.int()?,
            },
            "mov" => Inst::Move { dst, src: self.reg()? },
            "div" | "divu" | "rem" | "remu" => {
                let size = self.op_size()?;
                let lhs = self.reg()?;
                self.expect(',')?;
                let rhs = self.reg()?;
                Inst::Div {
                    signed: !m.ends_with('u'),
                    rem: m.starts_with("rem"),
                    size,
                    dst,
                    lhs,
                    rhs,
                }
            }
            "neg" | "not" => {
                let op = if m == "neg" { UnaryOp::Neg } else { UnaryOp::Not };
                let size = self.op_size()?;
                Inst::Unary {
                    op,
                    size,
                    dst,
                    src: self.reg()?,
                }
            }
            "set" => {
                self.expect('.')?;
                let c = self.word()?;
                let cond = Cond::from_mnemonic(c).ok_or_else(|| self.error(format!("unknown condition `{c}`")))?;
                Inst::SetCc { cond, dst }
            }
            "load" => {
                let size = self.mem_size()?;
                let (base, disp) = self.mem()?;
                Inst::Load {
                    size,
                    dst,
                    base,
                    disp,
                }
            }
            "ldvar" => Inst::LoadVar { dst, var: self.var()? },
            "varaddr" => Inst::VarAddr { dst, var: self.var()? },
            "spill" => {
                self.expect('.')?;
                if !self.eat_word("load") {
                    return Err(self.error("expected `spill.load`"));
                }
                Inst::SpillLoad {
                    dst,
                    slot: self.slot()?,
                }
            }
            "localloc" => Inst::Localloc {
                dst,
                size: self.reg()?,
            },
            "ehaddr" => Inst::ExcAddr {
                dst,
                clause: self.uint()?,
            },
            "call" => {
                let target = self.call_target()?;
                Inst::Call {
                    dst: Some(dst),
                    target,
                    out_regs: self.out_regs()?,
                }
            }
            "callvirt" => {
                let (vtable, disp) = self.mem()?;
                Inst::CallVirt {
                    dst: Some(dst),
                    vtable,
                    disp,
                    out_regs: self.out_regs()?,
                }
            }
            other => return Err(self.error(format!("unknown instruction `{other}` with a result"))),
        })
    }

    /// Instructions without a result.
    fn effect_inst(&mut self, m: &str) -> JitResult<Inst> {
        Ok(match m {
            "nop" => Inst::Nop,
            "cmp" => {
                let size = self.op_size()?;
                let lhs = self.reg()?;
                self.expect(',')?;
                Inst::Cmp {
                    size,
                    lhs,
                    rhs: self.reg()?,
                }
            }
            "cmpi" => {
                let size = self.op_size()?;
                let lhs = self.reg()?;
                self.expect(',')?;
                Inst::CmpImm {
                    size,
                    lhs,
                    imm: self.int()?,
                }
            }
            "store" | "storei" => {
                let size = self.mem_size()?;
                let (base, disp) = self.mem()?;
                self.expect(',')?;
                if m == "store" {
                    Inst::Store {
                        size,
                        base,
                        disp,
                        src: self.reg()?,
                    }
                } else {
                    Inst::StoreImm {
                        size,
                        base,
                        disp,
                        imm: self.int()?,
                    }
                }
            }
            "stvar" => {
                let var = self.var()?;
                self.expect(',')?;
                Inst::StoreVar { var, src: self.reg()? }
            }
            "spill" => {
                self.expect('.')?;
                if !self.eat_word("store") {
                    return Err(self.error("expected `spill.store`"));
                }
                let slot = self.slot()?;
                self.expect(',')?;
                Inst::SpillStore { slot, src: self.reg()? }
            }
            "outarg" => {
                let offset = self.uint()?;
                self.expect(',')?;
                Inst::OutArg {
                    offset,
                    src: self.reg()?,
                }
            }
            "jmp" => Inst::Jump { target: self.block()? },
            "br" => {
                self.expect('.')?;
                let c = self.word()?;
                let cond = Cond::from_mnemonic(c).ok_or_else(|| self.error(format!("unknown condition `{c}`")))?;
                let taken = self.block()?;
                self.expect(',')?;
                Inst::Branch {
                    cond,
                    taken,
                    not_taken: self.block()?,
                }
            }
            "call" => {
                let target = self.call_target()?;
                Inst::Call {
                    dst: None,
                    target,
                    out_regs: self.out_regs()?,
                }
            }
            "callvirt" => {
                let (vtable, disp) = self.mem()?;
                Inst::CallVirt {
                    dst: None,
                    vtable,
                    disp,
                    out_regs: self.out_regs()?,
                }
            }
            "ret" => Inst::Return {
                src: match self.peek() {
                    Some(_) => Some(self.reg()?),
                    None => None,
                },
            },
            other => return Err(self.error(format!("unknown instruction `{other}`"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOOP: &str = "
; sum 0..n
method sum(i32) -> i32 [trace] {
  local i64
bb0:
  v0 = ldvar var0
  v1 = iconst 0
  v2 = iconst 0
  jmp bb1
bb1:
  v1 = add.i32 v1, v2
  v2 = addi.i32 v2, 1
  cmp.i32 v2, v0
  br.lt bb1, bb2
bb2:
  ret v1
}
";

    #[test]
    fn test_parse_loop_method() {
        let body = parse_method(LOOP).unwrap();
        assert_eq!(body.name, "sum");
        assert!(body.flags.trace);
        assert_eq!(body.vars.len(), 2);
        assert_eq!(body.blocks.len(), 3);
        assert_eq!(body.next_vreg, 3);
        assert_eq!(
            body.blocks[1].insts[3],
            Inst::Branch {
                cond: Cond::Lt,
                taken: BlockId(1),
                not_taken: BlockId(2),
            }
        );
    }

    #[test]
    fn test_display_round_trip() {
        let text = "\
method f(this, i32, ..., i64) -> struct<12,4> [eh, lmf] {
  local struct<8,4,6>
bb0:
  v0 = ldvar var0
  v1 = load.u16 [v0-16]
  store.i64 [v0+8], v1
  storei.i32 [v0+0], -5
  v2 = shri.i64 v1, 3
  v3 = remu.i32 v1, v2
  v4 = set.geu
  v5 = call @#7 [v0:%r7, v3:%r6]
  callvirt [v5+24] [v0:%r7]
  call $puts []
  v6 = call *0x1000 []
  outarg 8, v6
  spill.store s1, v6
  v7 = spill.load s1
  v8 = ehaddr 2
  v9 = localloc v8
  ret
}
";
        let body = parse_method(text).unwrap();
        assert_eq!(body.to_string(), text);
        let again = parse_method(&body.to_string()).unwrap();
        assert_eq!(again, body);
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        let err = parse_method("method f() -> void {\nbb0:\n  v0 = frob v1\n}\n").unwrap_err();
        assert!(matches!(err, JitError::Parse { line: 3, .. }));

        let err = parse_method("method f() -> void {\nbb0:\n  jmp bb4\n}\n").unwrap_err();
        assert!(matches!(err, JitError::Parse { line: 3, .. }));

        let err = parse_method("method f() -> void {\nbb0:\n  ret\n").unwrap_err();
        assert!(matches!(err, JitError::Parse { .. }));
    }

    #[test]
    fn test_module_with_several_methods() {
        let text = "method a() -> void {\nbb0:\n  ret\n}\nmethod b() -> i64 {\nbb0:\n  v0 = iconst -0x10\n  ret v0\n}\n";
        let methods = parse_module(text).unwrap();
        assert_eq!(methods.len(), 2);
        assert_eq!(
            methods[1].blocks[0].insts[0],
            Inst::Iconst {
                dst: Reg::Virt(VReg::new(0)),
                value: -16
            }
        );
        assert!(parse_method(text).is_err());
    }
}
