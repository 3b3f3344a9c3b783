//! Backend pipeline tests that need no executable memory.
//!
//! Bodies are interpreted before and after each stage and compared; calling conventions
//! are checked on all three targets and emitted patch sites are resolved against a fake
//! load address.

use bumpalo::Bump;
use rtjit::codegen::abi::ArgStorage;
use rtjit::codegen::emit::{LMF_ADDR_SYMBOL, TRACE_ENTER_SYMBOL};
use rtjit::codegen::lower::lower_method;
use rtjit::codegen::patch::{resolve, PatchKind, PatchTarget, ThunkPool};
use rtjit::core::{compile_body, CompilationSession, CompiledMethod, JitConfig, RegMask, Target};
use rtjit::ir::interp::interpret;
use rtjit::ir::parser::parse_method;
use rtjit::ir::{MethodId, Signature, StructLayout, ValueType};
use rtjit::JitResult;

fn compile(text: &str, config: &JitConfig) -> CompiledMethod {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    compile_body(MethodId(0), parse_method(text).unwrap(), config, &session).unwrap()
}

const IMMEDIATES: &str = "\
method imm(i64) -> i64 {
bb0:
  v0 = ldvar var0
  v1 = addi.i32 v0, 100000
  v2 = muli.i64 v0, 16
  v3 = muli.i64 v0, 0x123456789
  cmpi.i32 v1, 5000
  v4 = set.gt
  v5 = add.i64 v2, v3
  v6 = add.i64 v5, v4
  v7 = xori.i64 v6, 0x7fff0000ffff
  ret v7
}
";

#[test]
fn test_lowering_preserves_results_on_every_target() {
    let original = parse_method(IMMEDIATES).unwrap();
    let expected = interpret(&original, &[3]).unwrap();
    for target in [Target::X64, Target::Arm] {
        let rules = target.lowering_rules().unwrap();
        let mut once = original.clone();
        lower_method(&mut once, rules).unwrap();
        assert_eq!(interpret(&once, &[3]).unwrap(), expected, "{target}");

        let mut twice = once.clone();
        lower_method(&mut twice, rules).unwrap();
        assert_eq!(twice.blocks, once.blocks, "lowering for {target} is not idempotent");
    }
    // ARM cannot encode these immediates, so its lowering must add instructions.
    let mut arm = original.clone();
    lower_method(&mut arm, Target::Arm.lowering_rules().unwrap()).unwrap();
    assert!(arm.inst_count() > original.inst_count());
}

const PRESSURE: &str = "\
method pressure(i64) -> i64 {
bb0:
  v0 = ldvar var0
  v1 = addi.i64 v0, 1
  v2 = addi.i64 v0, 2
  v3 = addi.i64 v0, 3
  v4 = addi.i64 v0, 4
  v5 = addi.i64 v0, 5
  v6 = mul.i64 v1, v2
  v7 = mul.i64 v3, v4
  v8 = add.i64 v6, v7
  v9 = add.i64 v8, v5
  ret v9
}
";

#[test]
fn test_three_register_budget_spills_and_stays_correct() {
    let isa = Target::X64.isa().unwrap();
    let regs: Vec<_> = isa.usable_regs().iter().take(3).collect();
    let config = JitConfig {
        allocatable: Some(RegMask::of(&regs)),
        ..JitConfig::default()
    };
    let compiled = compile(PRESSURE, &config);
    assert!(compiled.alloc.spills >= 1);
    assert!(compiled.alloc.reloads >= 1);
    assert!(compiled.frame.spill_slots >= 1);

    let original = parse_method(PRESSURE).unwrap();
    for arg in [0u64, 1, 7, 1000] {
        assert_eq!(
            interpret(&compiled.body, &[arg]).unwrap(),
            interpret(&original, &[arg]).unwrap()
        );
    }
}

/// Xorshift sequence for building allocator stress programs.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

/// A single-block method that mixes fixed-register instructions with plain arithmetic and
/// keeps every value live until the final fold.
fn stress_program(seed: u64) -> String {
    let mut rng = XorShift(seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1);
    let mut lines: Vec<String> = (0..3).map(|i| format!("v{i} = ldvar var{i}")).collect();
    let mut next = 3u32;
    let mut def = |lines: &mut Vec<String>, rhs: String| {
        lines.push(format!("v{next} = {rhs}"));
        next += 1;
        next - 1
    };
    for _ in 0..12 {
        let live = def_count(&lines);
        let a = rng.below(live);
        let b = rng.below(live);
        match rng.below(8) {
            0 => {
                let op = ["add", "sub", "mul", "xor", "and", "or"][rng.below(6)];
                def(&mut lines, format!("{op}.i64 v{a}, v{b}"));
            }
            1 => {
                let d = def(&mut lines, format!("ori.i64 v{b}, 1"));
                let op = ["divu", "remu"][rng.below(2)];
                def(&mut lines, format!("{op}.i64 v{a}, v{d}"));
            }
            2 => {
                let low = def(&mut lines, format!("andi.i64 v{b}, 255"));
                let d = def(&mut lines, format!("ori.i64 v{low}, 1"));
                let op = ["div", "rem"][rng.below(2)];
                def(&mut lines, format!("{op}.i64 v{a}, v{d}"));
            }
            3 => {
                let op = ["shl", "shr", "sar"][rng.below(3)];
                def(&mut lines, format!("{op}.i64 v{a}, v{b}"));
            }
            4 => {
                let cond = ["eq", "ne", "lt", "ge", "ltu", "gtu"][rng.below(6)];
                lines.push(format!("cmp.i64 v{a}, v{b}"));
                def(&mut lines, format!("set.{cond}"));
            }
            5 => {
                lines.push(format!("cmpi.i64 v{a}, 100"));
                def(&mut lines, "set.gt".to_string());
            }
            6 => {
                let op = ["addi", "muli", "xori"][rng.below(3)];
                def(&mut lines, format!("{op}.i64 v{a}, 77"));
            }
            _ => {
                let op = ["shli", "shri", "sari"][rng.below(3)];
                def(&mut lines, format!("{op}.i64 v{a}, {}", 1 + rng.below(40)));
            }
        }
    }
    let values = def_count(&lines) as u32;
    let mut acc = 0;
    for v in 1..values {
        let op = if v % 2 == 0 { "add" } else { "xor" };
        acc = def(&mut lines, format!("{op}.i64 v{acc}, v{v}"));
    }
    let mut text = String::from("method stress(i64, i64, i64) -> i64 {\nbb0:\n");
    for line in &lines {
        text.push_str("  ");
        text.push_str(line);
        text.push('\n');
    }
    text.push_str(&format!("  ret v{acc}\n}}\n"));
    text
}

fn def_count(lines: &[String]) -> usize {
    lines.iter().filter(|l| l.starts_with('v')).count()
}

#[test]
fn test_reduced_budgets_preserve_fixed_register_instructions() {
    let isa = Target::X64.isa().unwrap();
    let inputs: [[u64; 3]; 3] = [[3, 4, 5], [u64::MAX, 17, 1 << 40], [1000, 0, 63]];
    for budget in 3..=6 {
        let regs: Vec<_> = isa.usable_regs().iter().take(budget).collect();
        let config = JitConfig {
            allocatable: Some(RegMask::of(&regs)),
            ..JitConfig::default()
        };
        for seed in 0..48 {
            let text = stress_program(seed);
            let original = parse_method(&text).unwrap();
            let compiled = compile(&text, &config);
            for args in &inputs {
                assert_eq!(
                    interpret(&compiled.body, args).unwrap(),
                    interpret(&original, args).unwrap(),
                    "budget {budget} seed {seed} args {args:?}\n{text}"
                );
            }
        }
    }
}

#[test]
fn test_block_crossing_registers_are_demoted() {
    let text = "\
method sum(i64) -> i64 {
bb0:
  v0 = ldvar var0
  v1 = iconst 0
  v2 = iconst 0
  jmp bb1
bb1:
  v1 = add.i64 v1, v2
  v2 = addi.i64 v2, 1
  cmp.i64 v2, v0
  br.lt bb1, bb2
bb2:
  ret v1
}
";
    let compiled = compile(text, &JitConfig::default());
    assert!(compiled.demoted >= 2, "demoted {}", compiled.demoted);
    assert!(compiled.body.vars.len() >= 3);
    assert_eq!(interpret(&compiled.body, &[10]).unwrap(), Some(45));
    for block in &compiled.body.blocks {
        assert!(block.native_offset.is_some());
    }
}

fn signatures() -> Vec<Signature> {
    let small = ValueType::Struct(StructLayout::new(8, 4));
    let odd = ValueType::Struct(StructLayout::new(12, 4));
    let big = ValueType::Struct(StructLayout::new(40, 8));
    vec![
        Signature::new(vec![], ValueType::Void),
        Signature::new(vec![ValueType::I32, ValueType::I64, ValueType::I32], ValueType::I64),
        Signature::new(vec![ValueType::I64; 9], ValueType::I32),
        Signature::new(vec![ValueType::I32, ValueType::I64, ValueType::I64, ValueType::I32], ValueType::U64)
            .with_this(),
        Signature::new(vec![small, ValueType::I32, odd], ValueType::Void),
        Signature::new(vec![big, ValueType::I8, ValueType::U16], big),
        Signature::new(vec![ValueType::Ptr, ValueType::Object, ValueType::Bool], ValueType::Object),
        Signature::new(vec![ValueType::I32, ValueType::I64, ValueType::I32], ValueType::Void).with_sentinel(1),
        Signature::new(vec![ValueType::I64], ValueType::I64).with_sentinel(1),
        Signature::new(vec![ValueType::I32], ValueType::I32).with_sentinel(1),
    ]
}

#[test]
fn test_calling_conventions_keep_arguments_disjoint() {
    for target in [Target::X64, Target::Arm, Target::X86] {
        let cc = target.calling_convention();
        let word = cc.word_size();
        for sig in signatures() {
            let info = cc.compute_call_info(&sig).unwrap();
            assert_eq!(info.args.len(), sig.arg_count(), "{target} {sig}");
            info.check_disjoint(word)
                .unwrap_or_else(|e| panic!("{target} {sig}: {e}"));
            assert_eq!(info.stack_usage % cc.stack_alignment(), 0, "{target} {sig}");
            assert_eq!(info.returns_struct(), sig.ret.is_struct(), "{target} {sig}");
        }
    }
}

#[test]
fn test_two_int32_arguments_use_the_first_registers() {
    let sig = Signature::new(vec![ValueType::I32, ValueType::I32], ValueType::I32);
    for target in [Target::X64, Target::Arm] {
        let cc = target.calling_convention();
        let info = cc.compute_call_info(&sig).unwrap();
        let regs = cc.int_arg_regs();
        assert_eq!(info.args[0].storage, ArgStorage::Reg(regs[0]), "{target}");
        assert_eq!(info.args[1].storage, ArgStorage::Reg(regs[1]), "{target}");
        assert_eq!(info.ret.storage, ArgStorage::Reg(cc.return_reg()), "{target}");
        assert_eq!(info.stack_usage, 0);
    }
    let x86 = Target::X86.calling_convention().compute_call_info(&sig).unwrap();
    assert_eq!(x86.args[1].storage, ArgStorage::Stack { offset: 4 });
}

#[test]
fn test_vararg_cookie_is_in_the_outgoing_area() {
    for target in [Target::X64, Target::Arm, Target::X86] {
        let cc = target.calling_convention();
        for sig in signatures().into_iter().filter(|s| s.sentinel.is_some()) {
            let info = cc.compute_call_info(&sig).unwrap();
            let cookie = info.sig_cookie.expect("vararg signature without cookie");
            let (lo, hi) = cookie.stack_range(cc.word_size()).unwrap();
            assert!(lo < info.stack_usage && hi <= info.stack_usage, "{target} {sig}");
        }
        let fixed = Signature::new(vec![ValueType::I32], ValueType::Void);
        assert!(cc.compute_call_info(&fixed).unwrap().sig_cookie.is_none());
    }
}

#[test]
fn test_unsized_parameters_are_rejected() {
    let sig = Signature::new(vec![ValueType::TypeVar(0)], ValueType::Void);
    for target in [Target::X64, Target::Arm, Target::X86] {
        assert!(target.calling_convention().compute_call_info(&sig).is_err());
    }
}

struct NoThunks;

impl ThunkPool for NoThunks {
    fn thunk_for(&mut self, target: u64) -> JitResult<u64> {
        panic!("{target:#x} should be in reach")
    }
}

#[test]
fn test_every_patch_site_is_resolved() {
    let text = "\
method caller(i64) -> i64 [eh] {
bb0:
  v0 = ldvar var0
  v1 = call @#3 [v0:%r7]
  v2 = call $helper [v1:%r7]
  cmpi.i64 v2, 0
  br.eq bb1, bb2
bb1:
  v3 = ehaddr 1
  ret v3
bb2:
  ret v2
}
";
    let compiled = compile(text, &JitConfig::default());
    let base = 0x7f00_0000_0000u64;
    let method_addr = base + 0x10_0000;
    let helper_addr = base + 0x20_0000;
    let mut code = compiled.code.code.clone();
    let sites = &compiled.code.patches;
    assert!(sites.iter().any(|s| s.target == PatchTarget::Method(MethodId(3))));
    assert!(sites.iter().any(|s| s.kind == PatchKind::Deferred));

    let blocks = &compiled.code.block_offsets;
    let report = resolve(
        &mut code,
        base,
        sites,
        |t| match t {
            PatchTarget::Method(_) => Some(method_addr),
            PatchTarget::NativeSymbol(_) => Some(helper_addr),
            PatchTarget::Block(b) => blocks
                .iter()
                .find(|(id, _)| id == b)
                .map(|(_, off)| base + u64::from(*off)),
            _ => None,
        },
        &mut NoThunks,
    )
    .unwrap();

    let live = sites.iter().filter(|s| s.kind != PatchKind::Deferred).count();
    assert_eq!(report.resolved, live);
    assert_eq!(report.through_thunk, 0);
    assert_eq!(report.deferred.len(), sites.len() - live);

    for site in sites.iter().filter(|s| s.kind == PatchKind::Rel32) {
        let at = site.offset as usize;
        let disp = i32::from_le_bytes(code[at..at + 4].try_into().unwrap());
        let reached = (base + u64::from(site.offset) + 4).wrapping_add(disp as i64 as u64);
        match &site.target {
            PatchTarget::Method(_) => assert_eq!(reached, method_addr),
            PatchTarget::NativeSymbol(_) => assert_eq!(reached, helper_addr),
            _ => {}
        }
    }
}

#[test]
fn test_lmf_and_trace_reserve_frame_records() {
    let text = "\
method f(i64) -> i64 {
bb0:
  v0 = ldvar var0
  ret v0
}
";
    let config = JitConfig {
        save_lmf: true,
        trace: true,
        ..JitConfig::default()
    };
    let compiled = compile(text, &config);
    assert!(compiled.frame.lmf_offset.is_some());
    assert!(compiled.frame.trace_offset.is_some());
    let symbols: Vec<_> = compiled
        .code
        .patches
        .iter()
        .filter_map(|s| match &s.target {
            PatchTarget::NativeSymbol(name) => Some(name.as_str()),
            _ => None,
        })
        .collect();
    assert!(symbols.contains(&LMF_ADDR_SYMBOL));
    assert!(symbols.contains(&TRACE_ENTER_SYMBOL));

    let plain = compile(text, &JitConfig::default());
    assert!(plain.frame.lmf_offset.is_none());
    assert!(plain.code.code.len() < compiled.code.code.len());
}
