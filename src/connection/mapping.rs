//! Memory backing for registered regions. Regions are either plain heap buffers or anonymous
//! mappings pinned to a chosen virtual address, so that they land on a chosen
//! translation-cache bucket.
use crate::connection::Address;
use crate::error::{Error, Result};
use std::io;
use tracing::debug;

fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

/// An anonymous private mapping that starts exactly at the requested address.
pub struct FixedMapping {
    ptr: *mut u8,
    len: usize,
    mapped: usize,
}

// the mapping is owned exclusively, like a heap buffer
unsafe impl Send for FixedMapping {}

impl FixedMapping {
    /// Maps `len` bytes (rounded up to whole pages) at `addr`. The address is only a hint to
    /// the kernel, so an existing mapping is never clobbered; if the kernel places the mapping
    /// elsewhere it is released and an error is returned.
    pub fn map_at(addr: Address, len: usize) -> Result<FixedMapping> {
        let page = page_size();
        let mapped = ((len.max(1) + page - 1) / page) * page;
        debug!("mapping {} bytes at {:#x}", mapped, addr);

        let ptr = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::transport("mmap", io::Error::last_os_error()));
        }

        if ptr as Address != addr {
            let placed = ptr as Address;
            if unsafe { libc::munmap(ptr, mapped) } != 0 {
                return Err(Error::transport("munmap", io::Error::last_os_error()));
            }
            return Err(Error::transport(
                "mmap",
                format!("kernel placed the mapping at {:#x} instead of {:#x}", placed, addr),
            ));
        }

        Ok(FixedMapping {
            ptr: ptr as *mut u8,
            len,
            mapped,
        })
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for FixedMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.mapped);
        }
    }
}

/// Owner of the bytes behind a registered region.
pub enum Backing {
    Heap(Box<[u8]>),
    Mapped(FixedMapping),
}

impl Backing {
    /// Heap buffer, or a mapping at `placement` when one is requested.
    pub fn allocate(size: usize, placement: Option<Address>) -> Result<Backing> {
        match placement {
            Some(addr) => Ok(Backing::Mapped(FixedMapping::map_at(addr, size)?)),
            None => Ok(Backing::Heap(vec![0u8; size].into_boxed_slice())),
        }
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            Backing::Heap(buf) => buf.as_mut_ptr(),
            Backing::Mapped(m) => m.as_mut_ptr(),
        }
    }

    pub fn address(&mut self) -> Address {
        self.as_mut_ptr() as Address
    }

    pub fn len(&self) -> usize {
        match self {
            Backing::Heap(buf) => buf.len(),
            Backing::Mapped(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reserves and releases a large scratch mapping and returns its lowest address. New mappings
/// are handed out top-down, so the bottom of the hole stays free for a while.
#[cfg(test)]
fn free_address() -> Address {
    let len = 64 << 20;
    unsafe {
        let p = libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
            -1,
            0,
        );
        assert_ne!(p, libc::MAP_FAILED);
        libc::munmap(p, len);
        p as Address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_at_requested_address() {
        let addr = free_address();
        let mut m = FixedMapping::map_at(addr, 3 * 4096).unwrap();

        assert_eq!(m.as_mut_ptr() as Address, addr);
        assert_eq!(m.len(), 3 * 4096);
        unsafe {
            *m.as_mut_ptr() = 0x42;
            assert_eq!(*m.as_mut_ptr(), 0x42);
        }
    }

    #[test]
    fn occupied_address_is_refused() {
        let addr = free_address();
        let _first = FixedMapping::map_at(addr, 4096).unwrap();

        let second = FixedMapping::map_at(addr, 4096);
        assert!(matches!(second, Err(Error::Transport { op: "mmap", .. })));
    }

    #[test]
    fn heap_backing_without_placement() {
        let mut b = Backing::allocate(100, None).unwrap();
        assert_eq!(b.len(), 100);
        assert!(!b.is_empty());
        assert_ne!(b.address(), 0);
    }
}
