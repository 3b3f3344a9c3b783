//! Runs every `.rir` file under `tests/ir`.
//!
//! Each file names an entry method and its expected result in comment directives:
//!
//! ```text
//! ; ENTRY: main
//! ; ARGS: 5
//! ; EXPECT: 33
//! ; REGS: 3        (optional register budget)
//! ```
//!
//! The entry is interpreted before and after allocation, and on x86-64 Linux it is also
//! compiled and executed.

use bumpalo::Bump;
use rtjit::core::{compile_body, CompilationSession, JitConfig, ModuleProvider, RegMask, Target};
use rtjit::ir::interp::{CallFrame, Callee, InterpConfig, InterpEnv, Interpreter};
use rtjit::ir::{CallTarget, MethodBody};
use rtjit::{JitError, JitResult};
use std::fs;
use std::path::{Path, PathBuf};

fn discover_rir_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .into_iter()
        .flatten()
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("rir"))
        .collect();
    files.sort();
    files
}

#[derive(Debug, Default)]
struct Directives {
    entry: String,
    args: Vec<u64>,
    expect: i64,
    regs: Option<usize>,
}

fn directives(text: &str) -> Directives {
    let mut d = Directives::default();
    for line in text.lines() {
        let Some(rest) = line.trim().strip_prefix(';') else { continue };
        let Some((key, value)) = rest.split_once(':') else { continue };
        let value = value.trim();
        match key.trim() {
            "ENTRY" => d.entry = value.to_string(),
            "ARGS" => {
                d.args = value
                    .split_whitespace()
                    .map(|a| a.parse::<i64>().unwrap() as u64)
                    .collect()
            }
            "EXPECT" => d.expect = value.parse().unwrap(),
            "REGS" => d.regs = Some(value.parse().unwrap()),
            _ => {}
        }
    }
    d
}

/// Interprets direct calls with the callee's original body.
struct ModuleEnv<'m> {
    provider: &'m ModuleProvider,
}

impl InterpEnv for ModuleEnv<'_> {
    fn call(&mut self, callee: Callee<'_>, frame: &CallFrame) -> JitResult<u64> {
        let Callee::Direct(CallTarget::Method(id)) = callee else {
            return Err(JitError::unsupported(format!("call to {callee:?}")));
        };
        let provider = self.provider;
        let body = provider
            .get(*id)
            .ok_or_else(|| JitError::unsupported(format!("unknown method {id}")))?;
        let info = Target::X64.calling_convention().compute_call_info(&body.sig)?;
        let args = frame
            .args(&info, 8)
            .ok_or_else(|| JitError::unsupported("argument missing at call"))?;
        let ret = Interpreter::new(body, InterpConfig::default()).run(&args, self)?;
        Ok(ret.unwrap_or(0))
    }
}

fn run_interpreted(body: &MethodBody, provider: &ModuleProvider, args: &[u64]) -> i64 {
    let mut env = ModuleEnv { provider };
    let ret = Interpreter::new(body, InterpConfig::default())
        .run(args, &mut env)
        .unwrap_or_else(|e| panic!("{}: {e}", body.name));
    ret.unwrap_or(0) as i64
}

fn config_for(d: &Directives) -> JitConfig {
    let mut config = JitConfig::default();
    if let Some(n) = d.regs {
        let isa = Target::X64.isa().unwrap();
        let regs: Vec<_> = isa.usable_regs().iter().take(n).collect();
        config.allocatable = Some(RegMask::of(&regs));
    }
    config
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
fn run_native(provider: &ModuleProvider, config: &JitConfig, d: &Directives) -> Option<i64> {
    let runtime = rtjit::JitRuntime::new(provider.clone(), config.clone());
    let id = provider.lookup(&d.entry)?;
    // SAFETY: every filetest entry takes integer register arguments.
    let ret = unsafe { runtime.invoke(id, &d.args) }.unwrap();
    Some(ret as i64)
}

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
fn run_native(_: &ModuleProvider, _: &JitConfig, _: &Directives) -> Option<i64> {
    None
}

fn run_file(path: &Path) {
    let text = fs::read_to_string(path).unwrap();
    let d = directives(&text);
    let provider = ModuleProvider::parse(&text).unwrap_or_else(|e| panic!("{}: {e}", path.display()));
    let entry = provider
        .lookup(&d.entry)
        .unwrap_or_else(|| panic!("{}: no method `{}`", path.display(), d.entry));
    let body = provider.get(entry).unwrap();
    assert_eq!(
        run_interpreted(body, &provider, &d.args),
        d.expect,
        "{}: interpreter",
        path.display()
    );

    let config = config_for(&d);
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    for id in provider.ids() {
        let body = provider.get(id).unwrap().clone();
        let compiled = compile_body(id, body, &config, &session)
            .unwrap_or_else(|e| panic!("{}: {e}", path.display()));
        for block in &compiled.body.blocks {
            for inst in &block.insts {
                for (reg, _) in inst.regs() {
                    assert!(reg.as_phys().is_some(), "{}: {inst} after allocation", path.display());
                }
            }
        }
        if id == entry {
            assert_eq!(
                run_interpreted(&compiled.body, &provider, &d.args),
                d.expect,
                "{}: interpreter after allocation",
                path.display()
            );
        }
    }
    assert_eq!(session.stats().methods_compiled, provider.len());

    if let Some(native) = run_native(&provider, &config, &d) {
        assert_eq!(native, d.expect, "{}: native", path.display());
    }
}

#[test]
fn test_all_filetests() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/ir");
    let files = discover_rir_files(&dir);
    assert!(files.len() >= 6, "found only {} filetests", files.len());
    for file in files {
        log::info!("running {}", file.display());
        run_file(&file);
    }
}
