//! Executable memory, thunks, trampolines and the JIT runtime.

pub mod codeman;
pub mod collaborators;
pub mod jit;
pub mod thunk;
pub mod trampoline;

pub use codeman::CodeManager;
pub use collaborators::{
    AbortingSink, DebuggerNotifier, ExceptionSink, LogTraceHooks, MethodLoader, NativeSymbols, NoDebugger,
    SymbolTable, TraceHooks,
};
pub use jit::{current_lmf, JitRuntime, LmfRecord, MethodState, RuntimeBuilder};
pub use trampoline::{VTable, OBJECT_HEADER_SIZE};
