//! Out-of-line jump stubs for rel32 displacements that cannot reach their target.

use super::codeman::CodeManager;
use crate::codegen::patch::ThunkPool;
use crate::core::error::{JitError, JitResult};
use crate::x64::encoder::mov_imm64_bytes;
use crate::x64::R11;
use hashbrown::HashMap;

pub const THUNK_SIZE: usize = 16;

/// `mov r11, target; jmp r11`, padded with `int3`.
pub fn thunk_bytes(target: u64) -> [u8; THUNK_SIZE] {
    let mut out = [0xCC; THUNK_SIZE];
    out[..10].copy_from_slice(&mov_imm64_bytes(R11, target));
    out[10..13].copy_from_slice(&[0x41, 0xFF, 0xE3]);
    out
}

/// One thunk per distinct target.
#[derive(Debug)]
pub struct ThunkTable {
    by_target: HashMap<u64, u64>,
    limit: usize,
}

impl ThunkTable {
    pub fn new(limit: usize) -> Self {
        Self {
            by_target: HashMap::new(),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.by_target.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_target.is_empty()
    }

    pub fn get(&self, target: u64) -> Option<u64> {
        self.by_target.get(&target).copied()
    }

    pub fn thunk_for(&mut self, code: &mut CodeManager, target: u64) -> JitResult<u64> {
        if let Some(t) = self.get(target) {
            return Ok(t);
        }
        if self.by_target.len() >= self.limit {
            return Err(JitError::Memory(format!(
                "thunk pool is full ({} thunks)",
                self.limit
            )));
        }
        let addr = code.install(&thunk_bytes(target), THUNK_SIZE)?;
        log::debug!("thunk {addr:#x} -> {target:#x}");
        self.by_target.insert(target, addr);
        Ok(addr)
    }
}

/// A thunk table paired with the memory its thunks are placed in.
pub struct ThunkAllocator<'a> {
    pub table: &'a mut ThunkTable,
    pub code: &'a mut CodeManager,
}

impl ThunkPool for ThunkAllocator<'_> {
    fn thunk_for(&mut self, target: u64) -> JitResult<u64> {
        self.table.thunk_for(self.code, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thunk_encoding() {
        let bytes = thunk_bytes(0x1122_3344_5566_7788);
        assert_eq!(&bytes[..2], &[0x49, 0xBB]);
        assert_eq!(&bytes[2..10], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&bytes[10..13], &[0x41, 0xFF, 0xE3]);
        assert!(bytes[13..].iter().all(|b| *b == 0xCC));
    }

    #[test]
    fn test_thunks_are_shared_per_target() {
        let mut code = CodeManager::new(4096);
        let mut table = ThunkTable::new(2);
        let a = table.thunk_for(&mut code, 0x7000_0000_0000).unwrap();
        let b = table.thunk_for(&mut code, 0x7000_0000_0000).unwrap();
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
        table.thunk_for(&mut code, 0x7000_0000_1000).unwrap();
        let full = table.thunk_for(&mut code, 0x7000_0000_2000).unwrap_err();
        assert!(matches!(full, JitError::Memory(_)));
    }
}
