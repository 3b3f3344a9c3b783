// Patch sites and their resolution. The emitter leaves a zero placeholder wherever the final
// value is not known yet (a block label, a method that may not be compiled, a native helper,
// an exception clause entry) and records a PatchSite naming the placeholder's byte offset,
// its encoding and the symbolic target. Once the code has been copied to its final address,
// `resolve` asks a caller-supplied callback for each target's address and rewrites the bytes.
// A rel32 displacement that cannot reach its target is redirected to a thunk obtained from a
// ThunkPool; the pool hands out one thunk per distinct target. Deferred sites are left alone
// and handed back to the caller, who re-queues them with the collaborator that owns them.

//! Patch site records and the patch resolver.

use crate::core::error::{JitError, JitResult};
use crate::ir::{BlockId, MethodId};
use std::fmt;

/// Encoding of a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchKind {
    /// Signed 32-bit displacement relative to the end of the field.
    Rel32,
    /// Absolute 64-bit address.
    Abs64,
    /// Resolved later by another collaborator.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PatchTarget {
    Block(BlockId),
    Method(MethodId),
    NativeSymbol(String),
    Absolute(u64),
    ExceptionEntry(u32),
}

impl fmt::Display for PatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchTarget::Block(b) => write!(f, "block {b}"),
            PatchTarget::Method(m) => write!(f, "method {m}"),
            PatchTarget::NativeSymbol(s) => write!(f, "native symbol `{s}`"),
            PatchTarget::Absolute(a) => write!(f, "address {a:#x}"),
            PatchTarget::ExceptionEntry(c) => write!(f, "exception clause {c}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSite {
    /// Offset of the placeholder field in the method's code.
    pub offset: u32,
    pub kind: PatchKind,
    pub target: PatchTarget,
}

impl PatchSite {
    pub fn new(offset: u32, kind: PatchKind, target: PatchTarget) -> Self {
        Self {
            offset,
            kind,
            target,
        }
    }

    fn width(&self) -> usize {
        match self.kind {
            PatchKind::Rel32 => 4,
            PatchKind::Abs64 | PatchKind::Deferred => 8,
        }
    }
}

/// Source of out-of-line jump stubs for displacements that do not fit.
pub trait ThunkPool {
    /// Address of a stub that jumps to `target`, reusing an existing one when possible.
    fn thunk_for(&mut self, target: u64) -> JitResult<u64>;
}

/// Outcome of one `resolve` call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResolveReport {
    pub resolved: usize,
    /// Rel32 sites redirected through a thunk.
    pub through_thunk: usize,
    pub deferred: Vec<PatchSite>,
}

/// Displacement from the end of a rel32 field at `field` to `target`, if it fits.
pub fn rel32(field: u64, target: u64) -> Option<i32> {
    let delta = i128::from(target) - (i128::from(field) + 4);
    i32::try_from(delta).ok()
}

/// Rewrite every non-deferred site of `code`, which will run at address `base`.
pub fn resolve(
    code: &mut [u8],
    base: u64,
    sites: &[PatchSite],
    mut resolve_target: impl FnMut(&PatchTarget) -> Option<u64>,
    thunks: &mut dyn ThunkPool,
) -> JitResult<ResolveReport> {
    let mut report = ResolveReport::default();
    for site in sites {
        if site.kind == PatchKind::Deferred {
            report.deferred.push(site.clone());
            continue;
        }
        let at = site.offset as usize;
        let end = at + site.width();
        if end > code.len() {
            return Err(JitError::internal(
                "patch",
                format!("site at {at} runs past the end of {} bytes of code", code.len()),
            ));
        }
        let target = resolve_target(&site.target)
            .ok_or_else(|| JitError::UnresolvedReference(site.target.clone()))?;
        match site.kind {
            PatchKind::Rel32 => {
                let field = base + u64::from(site.offset);
                let disp = match rel32(field, target) {
                    Some(d) => d,
                    None => {
                        let thunk = thunks.thunk_for(target)?;
                        report.through_thunk += 1;
                        log::debug!("{} out of reach from {field:#x}, using thunk {thunk:#x}", site.target);
                        rel32(field, thunk).ok_or_else(|| {
                            JitError::Memory(format!("thunk {thunk:#x} is out of reach from {field:#x}"))
                        })?
                    }
                };
                code[at..end].copy_from_slice(&disp.to_le_bytes());
            }
            PatchKind::Abs64 => code[at..end].copy_from_slice(&target.to_le_bytes()),
            PatchKind::Deferred => {}
        }
        log::trace!("patched {} at +{:#x}", site.target, site.offset);
        report.resolved += 1;
    }
    Ok(report)
}

/// Write the 8-byte address of a deferred site once its collaborator knows it.
pub fn apply_deferred(code: &mut [u8], site: &PatchSite, address: u64) -> JitResult<()> {
    let at = site.offset as usize;
    let field = code
        .get_mut(at..at + 8)
        .ok_or_else(|| JitError::internal("patch", format!("deferred site at {at} is out of range")))?;
    field.copy_from_slice(&address.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashMap;

    /// Pool placed just above the code under test.
    #[derive(Default)]
    struct FakePool {
        by_target: HashMap<u64, u64>,
        next: u64,
    }

    impl ThunkPool for FakePool {
        fn thunk_for(&mut self, target: u64) -> JitResult<u64> {
            if let Some(t) = self.by_target.get(&target) {
                return Ok(*t);
            }
            let addr = 0x2000 + self.next * 16;
            self.next += 1;
            self.by_target.insert(target, addr);
            Ok(addr)
        }
    }

    fn read_i32(code: &[u8], at: usize) -> i32 {
        i32::from_le_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]])
    }

    #[test]
    fn test_near_target_is_patched_in_place() {
        let mut code = vec![0xE9, 0, 0, 0, 0, 0x90];
        let sites = vec![PatchSite::new(1, PatchKind::Rel32, PatchTarget::Block(BlockId(1)))];
        let mut pool = FakePool::default();
        let report = resolve(&mut code, 0x1000, &sites, |_| Some(0x1005), &mut pool).unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(report.through_thunk, 0);
        assert_eq!(read_i32(&code, 1), 0);
        assert_eq!(pool.next, 0);
    }

    #[test]
    fn test_far_branches_share_one_thunk() {
        let mut code = vec![0xE8, 0, 0, 0, 0, 0xE8, 0, 0, 0, 0];
        let far = 0x7_0000_0000u64;
        let sites = vec![
            PatchSite::new(1, PatchKind::Rel32, PatchTarget::Absolute(far)),
            PatchSite::new(6, PatchKind::Rel32, PatchTarget::Absolute(far)),
        ];
        let mut pool = FakePool::default();
        let report = resolve(
            &mut code,
            0x1000,
            &sites,
            |t| match t {
                PatchTarget::Absolute(a) => Some(*a),
                _ => None,
            },
            &mut pool,
        )
        .unwrap();
        assert_eq!(report.through_thunk, 2);
        assert_eq!(pool.next, 1);
        assert_eq!(i64::from(read_i32(&code, 1)), 0x2000 - 0x1005);
        assert_eq!(i64::from(read_i32(&code, 6)), 0x2000 - 0x100a);
    }

    #[test]
    fn test_deferred_sites_are_returned() {
        let mut code = vec![0u8; 10];
        let sites = vec![
            PatchSite::new(2, PatchKind::Deferred, PatchTarget::ExceptionEntry(3)),
            PatchSite::new(2, PatchKind::Abs64, PatchTarget::Absolute(0x1122_3344_5566_7788)),
        ];
        let mut pool = FakePool::default();
        let report = resolve(&mut code, 0, &sites, |_| Some(0x1122_3344_5566_7788), &mut pool).unwrap();
        assert_eq!(report.deferred, vec![sites[0].clone()]);
        assert_eq!(&code[2..10], &0x1122_3344_5566_7788u64.to_le_bytes());

        apply_deferred(&mut code, &sites[0], 0xdead).unwrap();
        assert_eq!(&code[2..10], &0xdeadu64.to_le_bytes());
    }

    #[test]
    fn test_unknown_target_is_unresolved_reference() {
        let mut code = vec![0u8; 5];
        let sites = vec![PatchSite::new(
            1,
            PatchKind::Rel32,
            PatchTarget::NativeSymbol("missing".into()),
        )];
        let err = resolve(&mut code, 0, &sites, |_| None, &mut FakePool::default()).unwrap_err();
        assert_eq!(
            err,
            JitError::UnresolvedReference(PatchTarget::NativeSymbol("missing".into()))
        );
    }
}
