// JitRuntime ties the backend to executable memory and to the host. It owns the code
// manager, the thunk table, the per-method records (state, trampolines, stubs) and the
// collaborators, all behind one process-wide re-entrant lock: compiling a method, creating a
// trampoline and allocating a thunk all happen with it held, and a thread that already holds
// it (a compilation that needs a trampoline, a patch that needs a compilation) simply enters
// again. Compilation builds the code in a private buffer, reserves its final address,
// resolves every patch site against that address and only then copies the bytes into
// executable memory and marks the method bound. Calls to methods that are not compiled yet
// are linked against the method's direct trampoline; vtables are filled with vtable
// trampolines. When a trampoline fires, the handler compiles the method, wraps the entry in
// unbox and breakpoint stubs as needed and rewrites the vtable slot or the call site so the
// next call goes straight to the code. A failed compilation is handed to the exception sink
// and the slot keeps pointing at the trampoline.

//! The JIT runtime: compile-on-demand, installation and lazy patching.

use super::codeman::CodeManager;
use super::collaborators::{
    AbortingSink, DebuggerNotifier, ExceptionSink, LogTraceHooks, MethodLoader, NativeSymbols, NoDebugger,
    SymbolTable, TraceHooks,
};
use super::thunk::{ThunkAllocator, ThunkTable};
use super::trampoline::{
    breakpoint_stub, decode_virtual_call, direct_call_field, generic_trampoline, method_trampoline, unbox_stub,
    TrampInfo, TrampKind, VTable,
};
use crate::codegen::emit::{LMF_ADDR_SYMBOL, TRACE_ENTER_SYMBOL, TRACE_LEAVE_SYMBOL};
use crate::codegen::patch::{rel32, resolve, PatchKind, PatchSite, PatchTarget, ResolveReport};
use crate::core::adaptor::MethodProvider;
use crate::core::compiler::{compile_body, JitConfig};
use crate::core::error::{JitError, JitResult};
use crate::core::session::CompilationSession;
use crate::ir::{BlockId, MethodBody, MethodId};
use crate::x64::encoder::CALL_VIRT_LEN;
use bumpalo::Bump;
use hashbrown::{HashMap, HashSet};
use parking_lot::ReentrantMutex;
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

thread_local! {
    static LMF_HEAD: Cell<u64> = const { Cell::new(0) };
}

/// The record a prologue links into the thread's LMF list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct LmfRecord {
    pub previous: u64,
    /// Address of the list head the record was linked into.
    pub head: u64,
    pub method: u64,
    pub sp: u64,
}

extern "C" fn get_lmf_addr() -> *mut u64 {
    LMF_HEAD.with(|h| h.as_ptr())
}

/// Innermost LMF record of the current thread, or 0.
pub fn current_lmf() -> u64 {
    LMF_HEAD.with(|h| h.get())
}

/// Compilation state of one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MethodState {
    #[default]
    Unbound,
    Compiling,
    Bound(u64),
}

#[derive(Debug, Default)]
struct MethodEntry {
    state: MethodState,
    vtable_trampoline: Option<u64>,
    direct_trampoline: Option<u64>,
    unbox_stub: Option<u64>,
    value_type_this: bool,
    code_size: usize,
    /// Deferred sites no collaborator has filled in yet.
    deferred: Vec<PatchSite>,
}

struct State {
    code: CodeManager,
    thunks: ThunkTable,
    methods: HashMap<MethodId, MethodEntry>,
    generic: Option<u64>,
    infos: Vec<Box<TrampInfo>>,
    breakpoints: HashSet<MethodId>,
    /// Breakpoint stubs keyed by the address they enter.
    breakpoint_stubs: HashMap<u64, u64>,
}

impl State {
    fn entry(&mut self, id: MethodId) -> &mut MethodEntry {
        self.methods.entry(id).or_default()
    }

    fn bound(&self, id: MethodId) -> Option<u64> {
        match self.methods.get(&id).map(|m| m.state) {
            Some(MethodState::Bound(addr)) => Some(addr),
            _ => None,
        }
    }
}

pub(crate) struct Shared {
    lock: ReentrantMutex<RefCell<State>>,
    config: JitConfig,
    provider: Box<dyn MethodProvider>,
    exceptions: Box<dyn ExceptionSink>,
    trace: Box<dyn TraceHooks>,
    debugger: Box<dyn DebuggerNotifier>,
    symbols: Box<dyn NativeSymbols>,
    compilations: AtomicUsize,
    trampoline_entries: AtomicUsize,
}

extern "C" fn trampoline_handler(regs: *const u64, info: *const TrampInfo, ret: u64) -> u64 {
    // SAFETY: `info` is one of the boxed records owned by the runtime whose trampoline
    // passed it, and that runtime outlives its code.
    let info = unsafe { &*info };
    let shared = unsafe { &*info.runtime };
    shared.trampoline_entries.fetch_add(1, Ordering::Relaxed);
    match shared.dispatch(regs, info, ret) {
        Ok(addr) => addr,
        Err(e) => {
            log::error!("{e}");
            shared.exceptions.fault_handler(info.method, &e)
        }
    }
}

extern "C" fn breakpoint_hit(runtime: *const Shared, method: u32) {
    // SAFETY: the stub was created by this runtime and embeds its address.
    let shared = unsafe { &*runtime };
    shared.debugger.notify_compiled(MethodId(method));
}

/// Read `n` bytes of code ending at `end`.
///
/// # Safety
/// The range must be mapped and readable.
unsafe fn code_before<'a>(end: u64, n: usize) -> &'a [u8] {
    unsafe { std::slice::from_raw_parts((end - n as u64) as *const u8, n) }
}

impl Shared {
    fn ptr(&self) -> u64 {
        self as *const Shared as u64
    }

    fn method_name(&self, id: MethodId) -> String {
        self.provider.method_name(id)
    }

    fn generic(&self, st: &mut State) -> JitResult<u64> {
        if let Some(g) = st.generic {
            return Ok(g);
        }
        let bytes = generic_trampoline(trampoline_handler)?;
        let addr = st.code.install(&bytes, 16)?;
        log::debug!("generic trampoline at {addr:#x}");
        st.generic = Some(addr);
        Ok(addr)
    }

    fn trampoline(&self, st: &mut State, id: MethodId, kind: TrampKind) -> JitResult<u64> {
        let entry = st.entry(id);
        let cached = match kind {
            TrampKind::VTable => entry.vtable_trampoline,
            TrampKind::Direct => entry.direct_trampoline,
        };
        if let Some(t) = cached {
            return Ok(t);
        }
        let generic = self.generic(st)?;
        let info = Box::new(TrampInfo {
            runtime: self as *const Shared,
            method: id,
            kind,
        });
        let info_addr = &*info as *const TrampInfo as u64;
        st.infos.push(info);
        let addr = st.code.install(&method_trampoline(info_addr, generic), 16)?;
        log::debug!("{kind:?} trampoline for {id} at {addr:#x}");
        let entry = st.entry(id);
        match kind {
            TrampKind::VTable => entry.vtable_trampoline = Some(addr),
            TrampKind::Direct => entry.direct_trampoline = Some(addr),
        }
        Ok(addr)
    }

    /// Entry reached through a call: breakpoint stub first, then unbox stub, then the code.
    fn wrap_entry(&self, st: &mut State, id: MethodId, addr: u64, via_vtable: bool) -> JitResult<u64> {
        let mut target = addr;
        let entry = st.entry(id);
        let (unbox, cached) = (entry.value_type_this, entry.unbox_stub);
        if via_vtable && unbox {
            target = match cached {
                Some(s) => s,
                None => {
                    let s = st.code.install(&unbox_stub(addr), 16)?;
                    st.entry(id).unbox_stub = Some(s);
                    s
                }
            };
        }
        if st.breakpoints.contains(&id) {
            if let Some(s) = st.breakpoint_stubs.get(&target) {
                return Ok(*s);
            }
            let bytes = breakpoint_stub(self.ptr(), id, breakpoint_hit as usize as u64, target)?;
            let s = st.code.install(&bytes, 16)?;
            st.breakpoint_stubs.insert(target, s);
            target = s;
        }
        Ok(target)
    }

    fn symbol(&self, name: &str) -> Option<u64> {
        match name {
            LMF_ADDR_SYMBOL => Some(get_lmf_addr as usize as u64),
            TRACE_ENTER_SYMBOL => Some(self.trace.enter_hook()),
            TRACE_LEAVE_SYMBOL => Some(self.trace.leave_hook()),
            other => self.symbols.resolve(other),
        }
    }

    /// Copy `code` into executable memory with every non-deferred site resolved.
    fn install(
        &self,
        cell: &RefCell<State>,
        code: &[u8],
        sites: &[PatchSite],
        blocks: &[(BlockId, u32)],
    ) -> JitResult<(u64, ResolveReport)> {
        let mut targets: HashMap<PatchTarget, u64> = HashMap::new();
        // Host symbol tables are consulted before the state is borrowed.
        for site in sites.iter().filter(|s| s.kind != PatchKind::Deferred) {
            let addr = match &site.target {
                PatchTarget::NativeSymbol(name) => self.symbol(name),
                PatchTarget::Absolute(a) => Some(*a),
                _ => None,
            };
            if let Some(a) = addr {
                targets.insert(site.target.clone(), a);
            }
        }

        let mut st = cell.borrow_mut();
        for site in sites.iter().filter(|s| s.kind != PatchKind::Deferred) {
            if let PatchTarget::Method(m) = site.target {
                if targets.contains_key(&site.target) {
                    continue;
                }
                let addr = match st.bound(m) {
                    Some(a) => self.wrap_entry(&mut st, m, a, false)?,
                    None => self.trampoline(&mut st, m, TrampKind::Direct)?,
                };
                targets.insert(site.target.clone(), addr);
            }
        }

        let base = st.code.reserve(code.len(), 16)?;
        for site in sites.iter().filter(|s| s.kind != PatchKind::Deferred) {
            if let PatchTarget::Block(b) = &site.target {
                if let Some((_, off)) = blocks.iter().find(|(id, _)| id == b) {
                    targets.insert(site.target.clone(), base + u64::from(*off));
                }
            }
        }

        let mut bytes = code.to_vec();
        let State { code: cm, thunks, .. } = &mut *st;
        let report = resolve(
            &mut bytes,
            base,
            sites,
            |t| targets.get(t).copied(),
            &mut ThunkAllocator { table: thunks, code: cm },
        )?;
        cm.write(base, &bytes)?;
        Ok((base, report))
    }

    fn compile(&self, id: MethodId) -> JitResult<u64> {
        let guard = self.lock.lock();
        if let Some(addr) = guard.borrow().bound(id) {
            return Ok(addr);
        }
        let body = self
            .provider
            .method_body(id)
            .ok_or_else(|| JitError::unsupported(format!("unknown method {id}")))?;
        guard.borrow_mut().entry(id).state = MethodState::Compiling;

        let result = self.compile_locked(&guard, id, body);
        let mut st = guard.borrow_mut();
        let entry = st.entry(id);
        match result {
            Ok(addr) => {
                entry.state = MethodState::Bound(addr);
                Ok(addr)
            }
            Err(e) => {
                entry.state = MethodState::Unbound;
                Err(e)
            }
        }
    }

    fn compile_locked(&self, cell: &RefCell<State>, id: MethodId, body: MethodBody) -> JitResult<u64> {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let compiled = compile_body(id, body, &self.config, &session)?;
        self.compilations.fetch_add(1, Ordering::Relaxed);

        let emitted = &compiled.code;
        let (addr, report) = self.install(cell, &emitted.code, &emitted.patches, &emitted.block_offsets)?;
        session.record_patches(report.resolved, report.through_thunk);

        // The sink may re-enter the runtime, so no state is borrowed while it runs.
        let entries: Vec<(PatchSite, Option<u64>)> = report
            .deferred
            .into_iter()
            .map(|site| {
                let entry = match site.target {
                    PatchTarget::ExceptionEntry(clause) => self.exceptions.exception_entry(id, clause, addr),
                    _ => None,
                };
                (site, entry)
            })
            .collect();

        let mut st = cell.borrow_mut();
        let mut pending = Vec::new();
        for (site, entry) in entries {
            match entry {
                Some(a) => st.code.write(addr + u64::from(site.offset), &a.to_le_bytes())?,
                None => pending.push(site),
            }
        }
        let entry = st.entry(id);
        entry.value_type_this = compiled.body.flags.value_type_this;
        entry.code_size = emitted.code.len();
        entry.deferred = pending;
        log::info!("compiled {} ({id}) at {addr:#x}", compiled.body.name);
        log::debug!("{}", session.stats());
        Ok(addr)
    }

    /// Compile `id` and return the address a call of the given kind should reach.
    fn bound_entry(&self, id: MethodId, via_vtable: bool) -> JitResult<u64> {
        let guard = self.lock.lock();
        let addr = self.compile(id).map_err(|e| JitError::CompileFailed {
            method: self.method_name(id),
            reason: e.to_string(),
        })?;
        let mut st = guard.borrow_mut();
        self.wrap_entry(&mut st, id, addr, via_vtable)
    }

    fn dispatch(&self, regs: *const u64, info: &TrampInfo, ret: u64) -> JitResult<u64> {
        match info.kind {
            TrampKind::VTable => {
                let entry = self.bound_entry(info.method, true)?;
                // SAFETY: `ret` follows a call instruction in mapped code.
                let before = unsafe { code_before(ret, CALL_VIRT_LEN) };
                match decode_virtual_call(before, ret) {
                    Some(site) => {
                        // SAFETY: the generic trampoline saved all sixteen registers.
                        let base = unsafe { *regs.add(usize::from(site.base.id)) };
                        let slot = base.wrapping_add(site.disp as i64 as u64);
                        if slot % 8 == 0 {
                            // SAFETY: the call just loaded its target from this slot.
                            unsafe { (*(slot as *const AtomicU64)).store(entry, Ordering::Relaxed) };
                            log::debug!("patched vtable slot {slot:#x} -> {entry:#x}");
                        } else {
                            unsafe { (slot as *mut u64).write_unaligned(entry) };
                        }
                    }
                    None => log::warn!("no virtual call before {ret:#x}, slot left unpatched"),
                }
                Ok(entry)
            }
            TrampKind::Direct => {
                let entry = self.bound_entry(info.method, false)?;
                self.patch_call_site(ret, entry)?;
                Ok(entry)
            }
        }
    }

    fn patch_call_site(&self, ret: u64, target: u64) -> JitResult<()> {
        let guard = self.lock.lock();
        let mut st = guard.borrow_mut();
        if !st.code.contains(ret - 5) {
            log::warn!("call site before {ret:#x} is not JIT code, left unpatched");
            return Ok(());
        }
        // SAFETY: the five bytes before `ret` are inside a code region.
        let before = unsafe { code_before(ret, 5) };
        let Some(field) = direct_call_field(before, ret) else {
            log::warn!("no call rel32 before {ret:#x}, left unpatched");
            return Ok(());
        };
        if field % 4 != 0 {
            log::warn!("call site field {field:#x} is not aligned, left unpatched");
            return Ok(());
        }
        let disp = match rel32(field, target) {
            Some(d) => d,
            None => {
                let State { code, thunks, .. } = &mut *st;
                let thunk = thunks.thunk_for(code, target)?;
                match rel32(field, thunk) {
                    Some(d) => d,
                    None => {
                        log::warn!("thunk {thunk:#x} is out of reach from {field:#x}, left unpatched");
                        return Ok(());
                    }
                }
            }
        };
        // SAFETY: aligned field inside a writable code region.
        unsafe { (*(field as *const AtomicU32)).store(disp as u32, Ordering::Release) };
        log::debug!("patched call site {field:#x} -> {target:#x}");
        Ok(())
    }
}

/// Builder for a [`JitRuntime`] with custom collaborators.
pub struct RuntimeBuilder {
    config: JitConfig,
    provider: Box<dyn MethodProvider>,
    exceptions: Box<dyn ExceptionSink>,
    trace: Box<dyn TraceHooks>,
    debugger: Box<dyn DebuggerNotifier>,
    symbols: Box<dyn NativeSymbols>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: JitConfig) -> Self {
        self.config = config;
        self
    }

    pub fn exception_sink(mut self, sink: impl ExceptionSink + 'static) -> Self {
        self.exceptions = Box::new(sink);
        self
    }

    pub fn trace_hooks(mut self, hooks: impl TraceHooks + 'static) -> Self {
        self.trace = Box::new(hooks);
        self
    }

    pub fn debugger(mut self, debugger: impl DebuggerNotifier + 'static) -> Self {
        self.debugger = Box::new(debugger);
        self
    }

    pub fn symbols(mut self, symbols: impl NativeSymbols + 'static) -> Self {
        self.symbols = Box::new(symbols);
        self
    }

    pub fn build(self) -> JitRuntime {
        let state = State {
            code: CodeManager::new(self.config.code_region_size),
            thunks: ThunkTable::new(self.config.thunk_pool_size),
            methods: HashMap::new(),
            generic: None,
            infos: Vec::new(),
            breakpoints: HashSet::new(),
            breakpoint_stubs: HashMap::new(),
        };
        JitRuntime {
            shared: Arc::new(Shared {
                lock: ReentrantMutex::new(RefCell::new(state)),
                config: self.config,
                provider: self.provider,
                exceptions: self.exceptions,
                trace: self.trace,
                debugger: self.debugger,
                symbols: self.symbols,
                compilations: AtomicUsize::new(0),
                trampoline_entries: AtomicUsize::new(0),
            }),
        }
    }
}

/// Process-wide JIT state; clones share it.
#[derive(Clone)]
pub struct JitRuntime {
    shared: Arc<Shared>,
}

impl JitRuntime {
    pub fn builder(provider: impl MethodProvider + 'static) -> RuntimeBuilder {
        RuntimeBuilder {
            config: JitConfig::default(),
            provider: Box::new(provider),
            exceptions: Box::new(AbortingSink),
            trace: Box::new(LogTraceHooks),
            debugger: Box::new(NoDebugger),
            symbols: Box::new(SymbolTable::new()),
        }
    }

    pub fn new(provider: impl MethodProvider + 'static, config: JitConfig) -> Self {
        Self::builder(provider).config(config).build()
    }

    pub fn config(&self) -> &JitConfig {
        &self.shared.config
    }

    pub fn method_state(&self, id: MethodId) -> MethodState {
        let guard = self.shared.lock.lock();
        let state = guard.borrow().methods.get(&id).map(|m| m.state).unwrap_or_default();
        state
    }

    /// Size of the installed code of `id`, once bound.
    pub fn code_size(&self, id: MethodId) -> Option<usize> {
        let guard = self.shared.lock.lock();
        let st = guard.borrow();
        st.bound(id)?;
        st.methods.get(&id).map(|m| m.code_size)
    }

    /// Deferred sites of `id` still waiting for a collaborator.
    pub fn pending_sites(&self, id: MethodId) -> Vec<PatchSite> {
        let guard = self.shared.lock.lock();
        let pending = guard
            .borrow()
            .methods
            .get(&id)
            .map(|m| m.deferred.clone())
            .unwrap_or_default();
        pending
    }

    /// Number of pipeline runs, including redundant ones.
    pub fn compilations(&self) -> usize {
        self.shared.compilations.load(Ordering::Relaxed)
    }

    /// Number of times any trampoline handed control to the handler.
    pub fn trampoline_entries(&self) -> usize {
        self.shared.trampoline_entries.load(Ordering::Relaxed)
    }

    pub fn thunk_count(&self) -> usize {
        let guard = self.shared.lock.lock();
        let n = guard.borrow().thunks.len();
        n
    }

    pub fn vtable_trampoline(&self, id: MethodId) -> JitResult<u64> {
        let guard = self.shared.lock.lock();
        let mut st = guard.borrow_mut();
        self.shared.trampoline(&mut st, id, TrampKind::VTable)
    }

    pub fn direct_trampoline(&self, id: MethodId) -> JitResult<u64> {
        let guard = self.shared.lock.lock();
        let mut st = guard.borrow_mut();
        self.shared.trampoline(&mut st, id, TrampKind::Direct)
    }

    /// A vtable for `methods` with every slot unbound.
    pub fn new_vtable(&self, methods: &[MethodId]) -> JitResult<VTable> {
        let entries = methods
            .iter()
            .map(|m| self.vtable_trampoline(*m))
            .collect::<JitResult<Vec<_>>>()?;
        Ok(VTable::new(&entries))
    }

    /// Notify the debugger whenever `id` is entered through a patched slot or call site.
    pub fn set_breakpoint(&self, id: MethodId) {
        let guard = self.shared.lock.lock();
        guard.borrow_mut().breakpoints.insert(id);
    }

    /// The trampoline sequence for a vtable slot, driven from Rust.
    pub fn compile_and_patch(&self, slot: &AtomicU64, id: MethodId) -> JitResult<u64> {
        let entry = self.shared.bound_entry(id, true)?;
        slot.store(entry, Ordering::Relaxed);
        Ok(entry)
    }

    /// Install raw code, resolving its patch sites; block targets use `blocks`.
    pub fn install_code(
        &self,
        code: &[u8],
        sites: &[PatchSite],
        blocks: &[(BlockId, u32)],
    ) -> JitResult<(u64, ResolveReport)> {
        let guard = self.shared.lock.lock();
        self.shared.install(&guard, code, sites, blocks)
    }

    /// Compile `id` and call it with integer arguments.
    ///
    /// # Safety
    /// The method must take `args.len()` integer register arguments and return an integer
    /// or nothing; every method it reaches must be sound to run.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn invoke(&self, id: MethodId, args: &[u64]) -> JitResult<u64> {
        if args.len() > 6 {
            return Err(JitError::unsupported(format!("invoke with {} arguments", args.len())));
        }
        let addr = self.compile_method(id)?;
        let mut a = [0u64; 6];
        a[..args.len()].copy_from_slice(args);
        type Entry = extern "C" fn(u64, u64, u64, u64, u64, u64) -> u64;
        // SAFETY: `addr` is the entry of code compiled for the System V convention.
        let f: Entry = unsafe { std::mem::transmute::<usize, Entry>(addr as usize) };
        Ok(f(a[0], a[1], a[2], a[3], a[4], a[5]))
    }
}

impl MethodLoader for JitRuntime {
    fn compile_method(&self, id: MethodId) -> JitResult<u64> {
        self.shared.compile(id)
    }

    fn lookup_compiled_address(&self, id: MethodId) -> Option<u64> {
        let guard = self.shared.lock.lock();
        let addr = guard.borrow().bound(id);
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::adaptor::ModuleProvider;

    fn runtime(text: &str) -> JitRuntime {
        JitRuntime::new(ModuleProvider::parse(text).unwrap(), JitConfig::default())
    }

    const TWO: &str = "\
method answer() -> i64 {
bb0:
  v0 = iconst 42
  ret v0
}
method broken() -> i64 {
bb0:
  v0 = call $missing_symbol []
  ret v0
}
";

    #[test]
    fn test_compile_binds_once() {
        let rt = runtime(TWO);
        assert_eq!(rt.method_state(MethodId(0)), MethodState::Unbound);
        let a = rt.compile_method(MethodId(0)).unwrap();
        assert_eq!(rt.method_state(MethodId(0)), MethodState::Bound(a));
        assert_eq!(rt.compile_method(MethodId(0)).unwrap(), a);
        assert_eq!(rt.compilations(), 1);
        assert_eq!(rt.lookup_compiled_address(MethodId(0)), Some(a));
        assert!(rt.code_size(MethodId(0)).unwrap() > 0);
    }

    #[test]
    fn test_failed_compile_stays_unbound() {
        let rt = runtime(TWO);
        let err = rt.compile_method(MethodId(1)).unwrap_err();
        assert_eq!(
            err,
            JitError::UnresolvedReference(PatchTarget::NativeSymbol("missing_symbol".into()))
        );
        assert_eq!(rt.method_state(MethodId(1)), MethodState::Unbound);
        let slot = AtomicU64::new(7);
        let err = rt.compile_and_patch(&slot, MethodId(1)).unwrap_err();
        assert!(matches!(err, JitError::CompileFailed { ref method, .. } if method == "broken"));
        assert_eq!(slot.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn test_trampolines_are_cached() {
        let rt = runtime(TWO);
        let v = rt.vtable_trampoline(MethodId(0)).unwrap();
        assert_eq!(rt.vtable_trampoline(MethodId(0)).unwrap(), v);
        let d = rt.direct_trampoline(MethodId(0)).unwrap();
        assert_ne!(v, d);
        let vt = rt.new_vtable(&[MethodId(0), MethodId(1)]).unwrap();
        assert_eq!(vt.get(0), Some(v));
    }

    #[test]
    fn test_unknown_method() {
        let rt = runtime(TWO);
        assert!(matches!(
            rt.compile_method(MethodId(5)),
            Err(JitError::UnsupportedOperation { .. })
        ));
    }
}
