//! Executable memory for generated kernels.
//!
//! `ExecutableBuffer` owns one mmap'd region holding immutable machine code
//! (PROT_READ|PROT_EXEC after installation). `JitRuntime` is the
//! process-wide owner of every installed buffer: kernels are cached by
//! signature for the lifetime of the process, so buffers are never freed
//! individually — they drop together at process teardown.

use std::sync::{Mutex, OnceLock};

use crate::types::KernelError;

/// An executable memory buffer backed by mmap.
pub struct ExecutableBuffer {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: ExecutableBuffer owns its mmap'd memory exclusively. The mapping is
// immutable (PROT_READ|PROT_EXEC) after construction and the pointer is never
// handed out mutably.
unsafe impl Send for ExecutableBuffer {}
unsafe impl Sync for ExecutableBuffer {}

impl ExecutableBuffer {
    /// Allocate an executable region, copy `code` into it and seal it.
    fn new(code: &[u8]) -> Result<Self, KernelError> {
        if code.is_empty() {
            return Err(KernelError::ExecMemory("empty code buffer".into()));
        }

        let page_size = page_size();
        let len = (code.len() + page_size - 1) & !(page_size - 1);

        // SAFETY: anonymous private mapping, no fd; result is checked.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(KernelError::ExecMemory(
                "mmap failed for kernel code buffer".into(),
            ));
        }
        let ptr = ptr as *mut u8;

        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        }

        let ret = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_READ | libc::PROT_EXEC) };
        if ret != 0 {
            unsafe {
                libc::munmap(ptr as *mut _, len);
            }
            return Err(KernelError::ExecMemory(
                "mprotect failed for kernel code buffer".into(),
            ));
        }

        Ok(ExecutableBuffer { ptr, len })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for ExecutableBuffer {
    fn drop(&mut self) {
        if !self.ptr.is_null() && self.len > 0 {
            unsafe {
                libc::munmap(self.ptr as *mut _, self.len);
            }
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Process-wide owner of installed kernel code.
///
/// Installation (allocate, copy, seal) is serialized by a mutex; code
/// *emission* happens outside the lock, so concurrent compilations of
/// distinct signatures only contend for the short install step.
pub struct JitRuntime {
    installed: Mutex<Vec<ExecutableBuffer>>,
}

impl JitRuntime {
    pub fn global() -> &'static JitRuntime {
        static RUNTIME: OnceLock<JitRuntime> = OnceLock::new();
        RUNTIME.get_or_init(|| JitRuntime {
            installed: Mutex::new(Vec::new()),
        })
    }

    /// Install assembled code and return its (process-lifetime) entry point.
    pub fn install(&self, code: &[u8]) -> Result<*const u8, KernelError> {
        let mut installed = self.installed.lock().unwrap();
        let buf = ExecutableBuffer::new(code)?;
        let entry = buf.as_ptr();
        installed.push(buf);
        Ok(entry)
    }

    /// Number of installed code buffers (for diagnostics and tests).
    pub fn installed_count(&self) -> usize {
        self.installed.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_rejects_empty_code() {
        assert!(ExecutableBuffer::new(&[]).is_err());
    }

    #[test]
    fn buffer_is_callable() {
        // `ret` on x86_64.
        let code = [0xC3u8];
        let buf = ExecutableBuffer::new(&code).unwrap();
        assert!(buf.len() >= 1);
        unsafe {
            let f: extern "C" fn() = std::mem::transmute(buf.as_ptr());
            f();
        }
    }

    #[test]
    fn install_returns_distinct_entries() {
        // Other tests may install concurrently; only the lower bound holds.
        let rt = JitRuntime::global();
        let before = rt.installed_count();
        let a = rt.install(&[0xC3]).unwrap();
        let b = rt.install(&[0x90, 0xC3]).unwrap();
        assert_ne!(a, b);
        assert!(rt.installed_count() >= before + 2);
    }
}
