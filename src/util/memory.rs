//! Raw memory primitives: byte-granular heap allocation and page-granular
//! virtual memory, both through `libc`.
//!
//! The GC spaces obtain their arena chunks from [`vmem_alloc`]; auxiliary
//! tables (remembered-set buckets, frame-info pools) live in ordinary heap
//! memory from [`mem_alloc`].

use std::io::{Error, Result};

use crate::util::constants::BYTES_IN_WORD;
use crate::util::Address;

/// Allocate `size` bytes of heap memory.  Aborts the process on failure:
/// auxiliary-table allocation failure is not a recoverable condition.
pub fn mem_alloc(size: usize) -> Address {
    debug_assert!(size > 0);
    let ptr = unsafe { libc::malloc(size) };
    if ptr.is_null() {
        eprintln!("quill: heap allocation of {} bytes failed", size);
        std::process::abort();
    }
    Address::from_mut_ptr(ptr)
}

/// Grow or shrink a block from [`mem_alloc`].  Aborts the process on failure.
pub fn mem_realloc(addr: Address, new_size: usize) -> Address {
    debug_assert!(new_size > 0);
    let ptr = unsafe { libc::realloc(addr.to_mut_ptr(), new_size) };
    if ptr.is_null() {
        eprintln!("quill: heap reallocation to {} bytes failed", new_size);
        std::process::abort();
    }
    Address::from_mut_ptr(ptr)
}

/// Release a block from [`mem_alloc`].
pub fn mem_free(addr: Address) {
    if !addr.is_zero() {
        unsafe { libc::free(addr.to_mut_ptr()) };
    }
}

/// Query the virtual-memory page size.
pub fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    debug_assert!(sz > 0);
    sz as usize
}

/// Reserve and commit a zeroed, page-aligned region of `size` bytes of
/// virtual memory (demand-zero anonymous mapping).
pub fn vmem_try_alloc(size: usize) -> Result<Address> {
    debug_assert!(size > 0 && size % BYTES_IN_WORD == 0);
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }
    Ok(Address::from_mut_ptr(ptr))
}

/// Like [`vmem_try_alloc`], but aborts the process when the mapping fails.
/// Space growth is bounded by the space size limits well below the point
/// where `mmap` fails on any reasonable host, so failures here indicate a
/// broken environment rather than script-level memory pressure.
pub fn vmem_alloc(size: usize) -> Address {
    match vmem_try_alloc(size) {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("quill: failed to mmap {} bytes: {}", size, e);
            std::process::abort();
        }
    }
}

/// Release a region from [`vmem_alloc`].
pub fn vmem_free(addr: Address, size: usize) {
    let ret = unsafe { libc::munmap(addr.to_mut_ptr(), size) };
    debug_assert_eq!(ret, 0, "munmap({}, {}) failed", addr, size);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_roundtrip() {
        let a = mem_alloc(64);
        unsafe { a.store::<u64>(0xdead_beef) };
        assert_eq!(unsafe { a.load::<u64>() }, 0xdead_beef);
        let b = mem_realloc(a, 128);
        assert_eq!(unsafe { b.load::<u64>() }, 0xdead_beef);
        mem_free(b);
    }

    #[test]
    fn vmem_roundtrip() {
        let size = 4 * page_size();
        let a = vmem_alloc(size);
        // Demand-zero mapping reads as zero and is writable.
        assert_eq!(unsafe { a.load::<usize>() }, 0);
        unsafe { (a + (size - BYTES_IN_WORD)).store::<usize>(1) };
        vmem_free(a, size);
    }

    #[test]
    fn page_size_is_power_of_two() {
        let sz = page_size();
        assert!(sz.is_power_of_two());
    }
}
