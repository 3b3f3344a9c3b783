// This module provides arena-based compilation session management using the bumpalo crate.
// CompilationSession owns nothing but a reference to the arena and a set of statistics; every
// per-block scratch structure of the register allocator (the vreg assignment table, the
// liveness records) is allocated in that arena and lives exactly as long as the session, so
// one compilation does not pay for individual heap allocations and nothing survives into the
// next method. Statistics are kept in a RefCell because the passes only hold shared
// references to the session: methods and blocks compiled, spill stores and reloads inserted
// by the allocator, bytes emitted, patch sites resolved and thunks handed out by the patch
// resolver. SessionStats implements Display so the CLI can print a summary after a run.

//! Arena-based compilation session management.
//!
//! All scratch data of one compilation is allocated in the session arena and
//! released together when the arena is dropped.

use bumpalo::Bump;
use std::cell::RefCell;
use std::fmt;

/// Arena-based compilation session.
pub struct CompilationSession<'arena> {
    /// Arena allocator for compilation objects.
    arena: &'arena Bump,

    /// Session statistics for debugging and optimization.
    stats: RefCell<SessionStats>,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new compilation session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
        }
    }

    /// Get access to the arena allocator.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Record that a method was compiled.
    pub fn record_method_compiled(&self, name: &str, code_size: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.methods_compiled += 1;
        stats.total_code_size += code_size;

        if stats.largest_method_size < code_size {
            stats.largest_method_size = code_size;
            stats.largest_method_name = name.to_string();
        }
    }

    pub fn record_block_allocated(&self) {
        self.stats.borrow_mut().blocks_allocated += 1;
    }

    /// Record a spill store inserted by the allocator.
    pub fn record_spill(&self) {
        self.stats.borrow_mut().spills_generated += 1;
    }

    /// Record a reload inserted by the allocator.
    pub fn record_reload(&self) {
        self.stats.borrow_mut().reloads_generated += 1;
    }

    /// Record a register-to-register copy inserted by the allocator.
    pub fn record_copy(&self) {
        self.stats.borrow_mut().copies_generated += 1;
    }

    /// Record the outcome of resolving one method's patch sites.
    pub fn record_patches(&self, resolved: usize, through_thunk: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.patches_resolved += resolved;
        stats.thunks_used += through_thunk;
    }

    /// Get compilation statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub methods_compiled: usize,
    /// Total code size generated (bytes).
    pub total_code_size: usize,
    pub largest_method_size: usize,
    pub largest_method_name: String,
    pub blocks_allocated: usize,
    pub spills_generated: usize,
    pub reloads_generated: usize,
    pub copies_generated: usize,
    pub patches_resolved: usize,
    pub thunks_used: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Statistics:")?;
        writeln!(f, "  Methods compiled: {}", self.methods_compiled)?;
        writeln!(f, "  Total code size: {} bytes", self.total_code_size)?;
        if self.methods_compiled > 0 {
            writeln!(
                f,
                "  Largest method: {} ({} bytes)",
                self.largest_method_name, self.largest_method_size
            )?;
        }
        writeln!(f, "  Blocks allocated: {}", self.blocks_allocated)?;
        writeln!(
            f,
            "  Spills / reloads / copies: {} / {} / {}",
            self.spills_generated, self.reloads_generated, self.copies_generated
        )?;
        write!(
            f,
            "  Patches resolved: {} ({} through thunks)",
            self.patches_resolved, self.thunks_used
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_records_statistics() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        session.record_method_compiled("A::b", 40);
        session.record_method_compiled("A::c", 90);
        session.record_spill();
        session.record_reload();
        session.record_reload();

        let stats = session.stats();
        assert_eq!(stats.methods_compiled, 2);
        assert_eq!(stats.total_code_size, 130);
        assert_eq!(stats.largest_method_name, "A::c");
        assert_eq!(stats.spills_generated, 1);
        assert_eq!(stats.reloads_generated, 2);
        session.record_patches(3, 1);
        assert_eq!(session.stats().patches_resolved, 3);
        assert!(stats.to_string().contains("Methods compiled: 2"));
    }
}
