//! Fiber stack allocation
//!
//! Each fiber owns a fixed-size anonymous mapping with a PROT_NONE guard
//! page at the low end, so overflowing the stack faults instead of
//! corrupting a neighbour.

use strand_core::{RtError, RtResult};

const PAGE_SIZE: usize = 4096;

pub struct Stack {
    base: *mut u8,
    total: usize, // guard page included
}

// Safety: the mapping is exclusively owned and only ever executed on by
// one fiber at a time.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Map `size` usable bytes plus a guard page.
    pub fn alloc(size: usize) -> RtResult<Stack> {
        let usable = size.max(PAGE_SIZE).next_multiple_of(PAGE_SIZE);
        let total = usable + PAGE_SIZE;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(RtError::StackAllocFailed);
        }

        // Guard page at the low end; the stack grows down toward it.
        let rt = unsafe { libc::mprotect(base, PAGE_SIZE, libc::PROT_NONE) };
        if rt != 0 {
            unsafe { libc::munmap(base, total) };
            return Err(RtError::StackProtectFailed);
        }

        Ok(Stack {
            base: base as *mut u8,
            total,
        })
    }

    /// Highest usable address; initial stack pointer for a new fiber.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes (guard page excluded).
    #[inline]
    pub fn size(&self) -> usize {
        self.total - PAGE_SIZE
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_touch() {
        let stack = Stack::alloc(64 * 1024).unwrap();
        assert!(stack.size() >= 64 * 1024);
        // Top of stack must be writable
        unsafe {
            let p = stack.top().sub(8) as *mut u64;
            p.write(0xdead_beef);
            assert_eq!(p.read(), 0xdead_beef);
        }
    }

    #[test]
    fn test_rounds_up_to_page() {
        let stack = Stack::alloc(1).unwrap();
        assert_eq!(stack.size(), 4096);
    }
}
