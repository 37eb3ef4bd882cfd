use std::io;

use tracing::debug;

/// A `PROT_NONE` reservation at an exact virtual address.
///
/// Driver code dereferences literal addresses, so the reservation must
/// land precisely where the driver expects it; any relocation would break
/// transparency. `MAP_FIXED_NOREPLACE` asks the kernel for exactly that
/// (and, unlike `MAP_FIXED`, refuses rather than clobbers an existing
/// mapping). Kernels that predate the flag treat it as a hint, so the
/// returned address is verified as well.
pub(crate) struct ProtectedWindow {
    base: u64,
    len: usize,
}

impl ProtectedWindow {
    pub(crate) fn reserve(base: u64, len: usize) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                base as *mut libc::c_void,
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        if ptr as u64 != base {
            unsafe { libc::munmap(ptr, len) };
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                "kernel placed the reservation at a different address",
            ));
        }
        Ok(Self { base, len })
    }

    pub(crate) fn base(&self) -> u64 {
        self.base
    }
}

impl Drop for ProtectedWindow {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.base as *mut libc::c_void, self.len) };
        if rc != 0 {
            debug!(base = self.base, "munmap failed while releasing window");
        }
    }
}
