//! Executable memory for compiled methods, thunks and trampolines.
//!
//! Memory is obtained from `mmap` in page-multiple regions, first mapped read/write and then
//! switched to read/write/execute. The write permission stays because vtable trampolines and
//! direct call sites are patched after publication. Allocation inside a region is a bump
//! pointer; nothing is freed until the manager is dropped. Each new region is requested right
//! after the previous one so that rel32 displacements between methods, thunks and trampolines
//! usually fit.

use crate::core::error::{JitError, JitResult};
use libc::{
    mmap, mprotect, munmap, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE,
};
use std::ffi::c_void;

#[derive(Debug)]
struct Region {
    base: *mut u8,
    len: usize,
    used: usize,
}

impl Region {
    fn end(&self) -> usize {
        self.base as usize + self.len
    }

    fn contains(&self, addr: u64) -> bool {
        let a = addr as usize;
        a >= self.base as usize && a < self.end()
    }
}

/// Owner of every executable region the runtime allocates.
#[derive(Debug)]
pub struct CodeManager {
    regions: Vec<Region>,
    region_size: usize,
}

// SAFETY: the raw region pointers are owned exclusively by the manager and only dereferenced
// through `&mut self`.
unsafe impl Send for CodeManager {}

impl CodeManager {
    pub fn new(region_size: usize) -> Self {
        Self {
            regions: Vec::new(),
            region_size: region_size.max(1),
        }
    }

    /// Bytes handed out so far.
    pub fn used(&self) -> usize {
        self.regions.iter().map(|r| r.used).sum()
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Whether `addr` lies inside memory owned by this manager.
    pub fn contains(&self, addr: u64) -> bool {
        self.regions.iter().any(|r| r.contains(addr))
    }

    fn map_region(&mut self, min_len: usize) -> JitResult<()> {
        let len = min_len.max(self.region_size).next_multiple_of(page_size::get());
        let hint = self
            .regions
            .last()
            .map(|r| r.end() as *mut c_void)
            .unwrap_or(std::ptr::null_mut());
        let buf = unsafe {
            mmap(
                hint,
                len,
                PROT_READ | PROT_WRITE,
                MAP_ANON | MAP_PRIVATE,
                -1,
                0,
            )
        };
        if buf == MAP_FAILED {
            return Err(JitError::Memory(format!(
                "mmap of {len} bytes failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        let rc = unsafe { mprotect(buf, len, PROT_READ | PROT_WRITE | PROT_EXEC) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                munmap(buf, len);
            }
            return Err(JitError::Memory(format!("mprotect failed: {err}")));
        }
        log::debug!("mapped code region {:#x} ({len} bytes)", buf as usize);
        self.regions.push(Region {
            base: buf as *mut u8,
            len,
            used: 0,
        });
        Ok(())
    }

    /// Reserve `size` bytes aligned to `align` and return their address.
    pub fn reserve(&mut self, size: usize, align: usize) -> JitResult<u64> {
        let align = align.max(1);
        if !align.is_power_of_two() {
            return Err(JitError::Memory(format!("alignment {align} is not a power of two")));
        }
        let fits = |r: &Region| {
            let start = (r.base as usize + r.used).next_multiple_of(align);
            start + size <= r.end()
        };
        if !self.regions.last().is_some_and(fits) {
            self.map_region(size + align)?;
        }
        let region = self
            .regions
            .last_mut()
            .ok_or_else(|| JitError::Memory("no code region".into()))?;
        let start = (region.base as usize + region.used).next_multiple_of(align);
        region.used = start + size - region.base as usize;
        Ok(start as u64)
    }

    /// Copy `bytes` into memory previously returned by `reserve`.
    pub fn write(&mut self, addr: u64, bytes: &[u8]) -> JitResult<()> {
        let end = addr
            .checked_add(bytes.len() as u64)
            .ok_or_else(|| JitError::Memory(format!("write at {addr:#x} overflows")))?;
        let region = self
            .regions
            .iter()
            .find(|r| r.contains(addr))
            .ok_or_else(|| JitError::Memory(format!("{addr:#x} is not code memory")))?;
        if end > region.base as u64 + region.used as u64 {
            return Err(JitError::Memory(format!(
                "write of {} bytes at {addr:#x} passes the reserved area",
                bytes.len()
            )));
        }
        // SAFETY: the destination range was reserved from a live region above.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        }
        Ok(())
    }

    /// Reserve room for `bytes`, copy them in and return their address.
    pub fn install(&mut self, bytes: &[u8], align: usize) -> JitResult<u64> {
        let addr = self.reserve(bytes.len(), align)?;
        self.write(addr, bytes)?;
        Ok(addr)
    }
}

impl Drop for CodeManager {
    fn drop(&mut self) {
        for r in self.regions.drain(..) {
            let rc = unsafe { munmap(r.base as *mut c_void, r.len) };
            if rc != 0 {
                log::warn!("munmap of code region {:#x} failed", r.base as usize);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservations_are_aligned_and_disjoint() {
        let mut code = CodeManager::new(4096);
        let a = code.reserve(10, 16).unwrap();
        let b = code.reserve(3, 16).unwrap();
        assert_eq!(a % 16, 0);
        assert_eq!(b % 16, 0);
        assert!(b >= a + 10);
        assert_eq!(code.region_count(), 1);
        assert!(code.contains(a) && code.contains(b));
    }

    #[test]
    fn test_large_request_maps_a_new_region() {
        let mut code = CodeManager::new(4096);
        code.reserve(64, 8).unwrap();
        let big = code.reserve(3 * page_size::get(), 16).unwrap();
        assert_eq!(code.region_count(), 2);
        assert!(code.contains(big + 2 * page_size::get() as u64));
    }

    #[test]
    fn test_install_copies_bytes() {
        let mut code = CodeManager::new(4096);
        let at = code.install(&[0xC3, 0x90, 0x90], 16).unwrap();
        let copied = unsafe { std::slice::from_raw_parts(at as *const u8, 3) };
        assert_eq!(copied, &[0xC3, 0x90, 0x90]);
        assert!(code.write(at + 2, &[0, 0, 0, 0]).is_err());
        assert!(code.write(0x10, &[0]).is_err());
    }
}
