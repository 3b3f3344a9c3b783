// The runtime talks to the rest of the managed runtime through the traits in this module.
// MethodLoader is the compile-on-demand entry point the trampolines call and JitRuntime
// implements it. ExceptionSink turns a failed lazy compilation into the address control
// continues at, so the failure surfaces as an exception at the original call site instead
// of killing the process. TraceHooks hands out the native entry and exit hooks the
// prologue and epilogue call when tracing is on. DebuggerNotifier is invoked from
// breakpoint stubs, and NativeSymbols maps the named native call targets of the IR to
// addresses. Every trait has a small default implementation so a runtime can be put
// together without a full host.

//! Interfaces to the host runtime.

use crate::core::error::{JitError, JitResult};
use crate::ir::MethodId;
use hashbrown::HashMap;

/// Compile-on-demand entry point.
pub trait MethodLoader {
    /// Compile `id` if needed and return its entry address.
    fn compile_method(&self, id: MethodId) -> JitResult<u64>;

    fn lookup_compiled_address(&self, id: MethodId) -> Option<u64>;
}

/// Receives failures that must be raised in managed code.
pub trait ExceptionSink: Send + Sync {
    /// Address control is transferred to after `method` failed to compile.
    fn fault_handler(&self, method: MethodId, error: &JitError) -> u64;

    /// Entry address of exception clause `clause` of `method`, when known.
    fn exception_entry(&self, _method: MethodId, _clause: u32, _code_start: u64) -> Option<u64> {
        None
    }
}

/// Native hooks with the signature `extern "C" fn(method_id: u64, value: u64)`.
pub trait TraceHooks: Send + Sync {
    fn enter_hook(&self) -> u64;
    fn leave_hook(&self) -> u64;
}

pub trait DebuggerNotifier: Send + Sync {
    fn notify_compiled(&self, method: MethodId);
}

pub trait NativeSymbols: Send + Sync {
    fn resolve(&self, name: &str) -> Option<u64>;
}

extern "C" fn unhandled_fault() -> ! {
    log::error!("lazy compilation failed and no exception handler is installed");
    std::process::abort()
}

/// Logs the failure and aborts when the faulting call is reached.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortingSink;

impl ExceptionSink for AbortingSink {
    fn fault_handler(&self, method: MethodId, error: &JitError) -> u64 {
        log::error!("{method}: {error}");
        unhandled_fault as usize as u64
    }
}

extern "C" fn log_enter(method: u64, arg0: u64) {
    log::trace!("enter method #{method} (arg0 = {arg0:#x})");
}

extern "C" fn log_leave(method: u64, ret: u64) {
    log::trace!("leave method #{method} (ret = {ret:#x})");
}

/// Trace hooks that write to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTraceHooks;

impl TraceHooks for LogTraceHooks {
    fn enter_hook(&self) -> u64 {
        log_enter as usize as u64
    }

    fn leave_hook(&self) -> u64 {
        log_leave as usize as u64
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoDebugger;

impl DebuggerNotifier for NoDebugger {
    fn notify_compiled(&self, method: MethodId) {
        log::debug!("breakpoint hit in {method}");
    }
}

/// Named native functions registered by the host.
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    symbols: HashMap<String, u64>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, address: u64) -> &mut Self {
        self.symbols.insert(name.into(), address);
        self
    }
}

impl NativeSymbols for SymbolTable {
    fn resolve(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }
}
