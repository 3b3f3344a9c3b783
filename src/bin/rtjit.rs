//! Command-line driver for the rtjit backend.
//!
//! Reads a module in the textual IR format and prints, for each selected method, the body
//! after lowering and register allocation, the frame layout and a disassembly of the emitted
//! code. `--interp` runs the method in the reference interpreter and `--run` executes the
//! compiled code natively.

use bumpalo::Bump;
use clap::Parser;
use iced_x86::{Decoder, DecoderOptions, Formatter, IntelFormatter};
use rtjit::codegen::globals::demote_block_crossing;
use rtjit::codegen::lower::lower_method;
use rtjit::core::{compile_body, CompilationSession, CompiledMethod, JitConfig, ModuleProvider, RegMask, Target};
use rtjit::ir::interp::interpret;
use rtjit::ir::{MethodBody, MethodId};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "rtjit", about = "Compile textual rtjit IR and show each backend stage")]
struct Args {
    /// IR module to read
    input: PathBuf,

    /// Only process the method with this name
    #[arg(long, value_name = "NAME")]
    method: Option<String>,

    /// Target architecture (x86_64, arm, x86)
    #[arg(long, default_value = "x86_64")]
    target: String,

    /// Restrict the allocator to the first N allocatable registers
    #[arg(long, value_name = "N")]
    regs: Option<usize>,

    /// Call the trace hooks in every method
    #[arg(long, action = clap::ArgAction::SetTrue)]
    trace: bool,

    /// Link an LMF record in every method
    #[arg(long, action = clap::ArgAction::SetTrue)]
    lmf: bool,

    /// Print session statistics at the end
    #[arg(long, action = clap::ArgAction::SetTrue)]
    stats: bool,

    /// Interpret the method with these integer arguments
    #[arg(long, value_name = "ARG", num_args = 0.., allow_negative_numbers = true)]
    interp: Option<Vec<i64>>,

    /// Execute the compiled method with these integer arguments
    #[arg(long, value_name = "ARG", num_args = 0.., allow_negative_numbers = true)]
    run: Option<Vec<i64>>,
}

fn disassemble(code: &[u8]) -> String {
    let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
    let mut formatter = IntelFormatter::new();
    let mut out = String::new();
    let mut text = String::new();
    while decoder.can_decode() {
        let inst = decoder.decode();
        text.clear();
        formatter.format(&inst, &mut text);
        let at = inst.ip() as usize;
        let bytes: Vec<String> = code[at..at + inst.len()].iter().map(|b| format!("{b:02x}")).collect();
        out.push_str(&format!("  {:04x}  {:<30} {text}\n", inst.ip(), bytes.join(" ")));
    }
    out
}

fn print_compiled(compiled: &CompiledMethod) {
    println!("; after lowering and allocation");
    print!("{}", compiled.body);
    let frame = &compiled.frame;
    println!("; frame");
    println!(
        ";   size {} (outgoing {}), {} pushes, frame pointer {}",
        frame.frame_size,
        frame.param_area,
        frame.pushes(),
        if frame.pinned_frame_pointer { "pinned" } else { "omitted" }
    );
    for (i, slot) in frame.vars.iter().enumerate() {
        println!(";   var{i} at {:+}", slot.offset);
    }
    if frame.spill_slots > 0 {
        println!(";   {} spill slots from {:+}", frame.spill_slots, frame.spill_base);
    }
    if let Some(lmf) = frame.lmf_offset {
        println!(";   lmf record at {lmf:+}");
    }
    println!(
        "; {} spills, {} reloads, {} copies, {} demoted",
        compiled.alloc.spills, compiled.alloc.reloads, compiled.alloc.copies, compiled.demoted
    );
    println!("; code ({} bytes, prologue {})", compiled.code.code.len(), compiled.code.prologue_len);
    print!("{}", disassemble(&compiled.code.code));
    for site in &compiled.code.patches {
        println!(";   patch +{:#x} {:?} -> {}", site.offset, site.kind, site.target);
    }
}

fn lower_only(mut body: MethodBody, target: Target) -> rtjit::JitResult<()> {
    let cc = target.calling_convention();
    let info = cc.compute_call_info(&body.sig)?;
    println!("; {} arguments, {} bytes on the stack", info.args.len(), info.stack_usage);
    for (i, arg) in info.args.iter().enumerate() {
        println!(";   arg{i}: {:?}", arg.storage);
    }
    demote_block_crossing(&mut body);
    if let Some(rules) = target.lowering_rules() {
        lower_method(&mut body, rules)?;
    }
    println!("; after lowering for {target}");
    print!("{body}");
    Ok(())
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
fn run_native(provider: &ModuleProvider, config: &JitConfig, id: MethodId, args: &[i64]) -> rtjit::JitResult<i64> {
    let runtime = rtjit::JitRuntime::new(provider.clone(), config.clone());
    let args: Vec<u64> = args.iter().map(|a| *a as u64).collect();
    // SAFETY: the user asked for the method to be executed with these arguments.
    let ret = unsafe { runtime.invoke(id, &args)? };
    Ok(ret as i64)
}

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
fn run_native(_: &ModuleProvider, _: &JitConfig, _: MethodId, _: &[i64]) -> rtjit::JitResult<i64> {
    Err(rtjit::JitError::unsupported("native execution on this host"))
}

fn process(args: &Args, provider: &ModuleProvider, config: &JitConfig, session: &CompilationSession<'_>) -> rtjit::JitResult<()> {
    for id in provider.ids() {
        let Some(body) = provider.get(id) else { continue };
        if args.method.as_deref().is_some_and(|m| m != body.name) {
            continue;
        }
        println!("; ==== {} ({id})", body.name);
        if let Some(values) = &args.interp {
            let values: Vec<u64> = values.iter().map(|a| *a as u64).collect();
            match interpret(body, &values)? {
                Some(v) => println!("; interpreter returned {} ({v:#x})", v as i64),
                None => println!("; interpreter returned nothing"),
            }
        }
        if config.target.isa().is_err() {
            lower_only(body.clone(), config.target)?;
            continue;
        }
        let compiled = compile_body(id, body.clone(), config, session)?;
        print_compiled(&compiled);
        if let Some(values) = &args.run {
            let ret = run_native(provider, config, id, values)?;
            println!("; native code returned {ret} ({ret:#x})");
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("RTJIT_LOG", "warn")).init();
    let args = Args::parse();

    let text = match fs::read_to_string(&args.input) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("error: cannot read {}: {e}", args.input.display());
            return ExitCode::FAILURE;
        }
    };
    let target: Target = match args.target.parse() {
        Ok(t) => t,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let mut config = JitConfig {
        target,
        trace: args.trace,
        save_lmf: args.lmf,
        ..JitConfig::default()
    };
    if let (Some(n), Ok(isa)) = (args.regs, target.isa()) {
        config.allocatable = Some(RegMask::of(&isa.usable_regs().iter().take(n).collect::<Vec<_>>()));
    }

    let provider = match ModuleProvider::parse(&text) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("error: {}: {e}", args.input.display());
            return ExitCode::FAILURE;
        }
    };
    log::info!("{} methods in {}", provider.len(), args.input.display());

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    if let Err(e) = process(&args, &provider, &config, &session) {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }
    if args.stats {
        println!("{}", session.stats());
    }
    ExitCode::SUCCESS
}
