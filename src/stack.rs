//! Coroutine stacks: fixed-size mmap regions with a guard page at the low
//! end. Stacks grow downwards on every architecture we support, so the
//! context primitive enters a fresh coroutine at `top()`.

use std::io;
use std::ptr::NonNull;
use std::sync::OnceLock;

use crate::error::Error;

pub(crate) fn page_size() -> usize {
    static VALUE: OnceLock<usize> = OnceLock::new();
    *VALUE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

#[derive(Debug)]
pub(crate) struct Stack {
    base: NonNull<u8>,
    total: usize,
}

impl Stack {
    /// Maps a region of at least `size` usable bytes plus one guard page.
    pub fn new(size: usize) -> Result<Self, Error> {
        let page = page_size();
        let usable = size.max(page).next_multiple_of(page);
        let total = usable + page;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::Stack(io::Error::last_os_error()));
        }
        // overflow tramples the guard page instead of a neighbouring heap block
        if unsafe { libc::mprotect(ptr, page, libc::PROT_NONE) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(ptr, total) };
            return Err(Error::Stack(err));
        }
        Ok(Self {
            base: unsafe { NonNull::new_unchecked(ptr.cast()) },
            total,
        })
    }

    /// One past the highest usable byte; page-aligned, so also 16-aligned
    /// as both SysV x86_64 and AAPCS64 require.
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.total) }
    }

    /// Lowest usable byte, just above the guard page. The ucontext backend
    /// enters through here; the assembly backends only need `top`.
    #[allow(dead_code)]
    pub fn usable_base(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(page_size()) }
    }

    #[allow(dead_code)]
    pub fn usable_len(&self) -> usize {
        self.total - page_size()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base.as_ptr().cast(), self.total) };
    }
}
