use std::ptr::NonNull;


/// Where a mapping is allowed to land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Exactly at the requested address, or not at all. Existing mappings
    /// are never replaced.
    Fixed,
    /// The requested address is only a hint, any address is accepted.
    Anywhere,
}

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. The allocator, our top level view of this, has nothing to do
/// with the concrete implementations / APIs offered by each kernel.
///
/// It is also the seam tests use to count or refuse mapping requests.
///
/// # Safety
///
/// A mapping returned by [`PlatformMemory::map_pages`] must be readable and
/// writable for `len` bytes, aligned to [`PlatformMemory::page_size`], must
/// not overlap any other live memory, and must stay mapped for as long as
/// the platform value (or anything it handed memory to) is alive.
pub unsafe trait PlatformMemory {
    /// Request a private, anonymous, read-write mapping of `len` bytes at
    /// `addr`. It returns a pointer to the mapping or `None` if the
    /// underlying syscall fails or `placement` can't be honored.
    fn map_pages(&self, addr: usize, len: usize, placement: Placement) -> Option<NonNull<u8>>;

    /// Returns the virtual memory page size of the computer in bytes.
    fn page_size(&self) -> usize;
}

/// The operating system's own memory mapping primitives.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemory;

#[cfg(unix)]
mod unix {
    use super::{Placement, PlatformMemory, SystemMemory};

    use libc::{mmap, munmap, off_t, size_t};

    use std::{os::raw::{c_int, c_void}, ptr::NonNull};

    /// Linux refuses (instead of clobbering) when something already lives at
    /// the address. Elsewhere the address is only a hint and gets checked.
    #[cfg(target_os = "linux")]
    const FIXED: c_int = libc::MAP_FIXED_NOREPLACE;
    #[cfg(not(target_os = "linux"))]
    const FIXED: c_int = 0;

    unsafe impl PlatformMemory for SystemMemory {
        fn map_pages(&self, addr: usize, len: usize, placement: Placement) -> Option<NonNull<u8>> {
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            let flags = match placement {
                Placement::Fixed => FLAGS | FIXED,
                Placement::Anywhere => FLAGS,
            };

            unsafe {
                let mapped = mmap(addr as *mut c_void, len as size_t, PROT, flags, FD, OFFSET);

                if mapped == libc::MAP_FAILED {
                    return None;
                }

                // Kernels predating MAP_FIXED_NOREPLACE treat it as a hint.
                if placement == Placement::Fixed && mapped as usize != addr {
                    munmap(mapped, len as size_t);
                    return None;
                }

                NonNull::new(mapped.cast::<u8>())
            }
        }

        fn page_size(&self) -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use super::{Placement, PlatformMemory, SystemMemory};

    use windows::Win32::System::{Memory, SystemInformation};

    unsafe impl PlatformMemory for SystemMemory {
        fn map_pages(&self, addr: usize, len: usize, placement: Placement) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            let at = match placement {
                Placement::Fixed => Some(addr as *const c_void),
                Placement::Anywhere => None,
            };

            unsafe {
                let mapped = Memory::VirtualAlloc(at, len, flags, protection);

                // VirtualAlloc rounds the address down to the allocation granularity.
                if placement == Placement::Fixed && !mapped.is_null() && mapped as usize != addr {
                    let _ = Memory::VirtualFree(mapped, 0, Memory::MEM_RELEASE);
                    return None;
                }

                NonNull::new(mapped.cast())
            }
        }

        fn page_size(&self) -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}


#[cfg(test)]
pub(crate) mod testing {
    use std::{cell::Cell, ptr::NonNull};

    use super::{Placement, PlatformMemory, SystemMemory};

    /// [`SystemMemory`] wrapper that counts mapping requests and can be told
    /// to refuse some of them.
    #[derive(Debug, Default)]
    pub(crate) struct TestMemory {
        /// Every call to `map_pages`, failed ones included.
        pub calls: Cell<usize>,
        /// Successful mappings.
        pub mapped: Cell<usize>,
        /// Refuse every `Placement::Fixed` request.
        pub refuse_fixed: bool,
        /// Refuse everything once this many mappings succeeded.
        pub limit: Option<usize>,
    }

    impl TestMemory {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn scattered() -> Self {
            Self { refuse_fixed: true, ..Self::default() }
        }

        pub(crate) fn limited(limit: usize) -> Self {
            Self { limit: Some(limit), ..Self::default() }
        }
    }

    unsafe impl PlatformMemory for TestMemory {
        fn map_pages(&self, addr: usize, len: usize, placement: Placement) -> Option<NonNull<u8>> {
            self.calls.set(self.calls.get() + 1);

            if self.limit.is_some_and(|limit| self.mapped.get() >= limit) {
                return None;
            }
            if self.refuse_fixed && placement == Placement::Fixed {
                return None;
            }

            let mapped = SystemMemory.map_pages(addr, len, placement)?;
            self.mapped.set(self.mapped.get() + 1);

            Some(mapped)
        }

        fn page_size(&self) -> usize {
            SystemMemory.page_size()
        }
    }

    /// Hands out consecutive slices of one reservation, so a
    /// `Placement::Fixed` request at the end of the previous mapping always
    /// succeeds and regions come out physically adjacent.
    #[derive(Debug)]
    pub(crate) struct ContiguousMemory {
        /// Start of the next slice.
        cursor: Cell<usize>,
        /// End of the reservation.
        end: usize,
    }

    impl ContiguousMemory {
        pub(crate) fn new(len: usize) -> Self {
            let base = SystemMemory
                .map_pages(0, len, Placement::Anywhere)
                .unwrap()
                .as_ptr() as usize;

            Self { cursor: Cell::new(base), end: base + len }
        }
    }

    unsafe impl PlatformMemory for ContiguousMemory {
        fn map_pages(&self, addr: usize, len: usize, placement: Placement) -> Option<NonNull<u8>> {
            let start = self.cursor.get();

            if placement == Placement::Fixed && addr != start {
                return None;
            }
            if self.end - start < len {
                return None;
            }

            self.cursor.set(start + len);
            NonNull::new(start as *mut u8)
        }

        fn page_size(&self) -> usize {
            SystemMemory.page_size()
        }
    }
}
