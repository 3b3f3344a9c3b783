//! rtjit - code generation backend of a managed-language runtime.
//!
//! rtjit takes the IR of a method body (basic blocks of three-address instructions over an
//! unbounded set of virtual registers), lowers it to encodable forms, allocates registers one
//! block at a time, lays out the frame and encodes x86-64 machine code. The runtime installs
//! the code in executable memory, resolves its patch sites and links calls lazily through
//! trampolines that patch vtable slots and call sites on first use.
//!
//! # Usage
//!
//! ```ignore
//! use rtjit::core::{JitConfig, ModuleProvider};
//! use rtjit::runtime::{JitRuntime, MethodLoader};
//!
//! let provider = ModuleProvider::parse(source)?;
//! let main = provider.lookup("main").unwrap();
//! let runtime = JitRuntime::new(provider, JitConfig::default());
//! let entry = runtime.compile_method(main)?;
//! ```
//!
//! # Architecture
//!
//! - [`ir`] - instructions, methods, builder, text format and reference interpreter
//! - [`codegen`] - calling conventions, lowering, register allocation, frames, emission, patching
//! - [`core`] - errors, register model, compilation sessions and the pipeline driver
//! - [`x64`] - the x86-64 System V target
//! - [`arm`] - ARM32 calling convention and lowering rules
//! - [`x86`] - 32-bit x86 cdecl calling convention
//! - [`runtime`] - executable memory, thunks, trampolines and the JIT runtime

pub mod arm;
pub mod codegen;
pub mod core;
pub mod ir;
pub mod runtime;
pub mod x64;
pub mod x86;

pub use crate::core::{JitConfig, JitError, JitResult, Target};
pub use crate::runtime::JitRuntime;
