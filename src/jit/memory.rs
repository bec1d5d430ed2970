//! Executable memory management.
//!
//! Compiled code is copied into a fresh mapping that starts out writable and
//! is then flipped to read+execute. The mapping is released exactly once,
//! when its owner is dropped.

use std::ptr::NonNull;

use crate::vm::LmntError;

/// Error type for memory operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    AllocationFailed,
    ProtectionFailed,
    InvalidSize,
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "memory allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "memory protection change failed"),
            MemoryError::InvalidSize => write!(f, "invalid memory size"),
        }
    }
}

impl std::error::Error for MemoryError {}

impl From<MemoryError> for LmntError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::AllocationFailed | MemoryError::InvalidSize => LmntError::MemorySize,
            MemoryError::ProtectionFailed => LmntError::Internal,
        }
    }
}

/// A platform mapping that can hold machine code.
pub trait ExecutableMemory: Sized {
    /// Map at least `len` writable bytes.
    fn alloc(len: usize) -> Result<Self, MemoryError>;

    /// Copy `code` to the start of the mapping. Fails once executable.
    fn write(&mut self, code: &[u8]) -> Result<(), MemoryError>;

    /// Make the mapping read+execute and flush the instruction cache.
    fn make_executable(&mut self) -> Result<(), MemoryError>;

    fn as_ptr(&self) -> *const u8;

    fn len(&self) -> usize;

    fn is_executable(&self) -> bool;

    /// Allocate, fill and protect in one go.
    fn from_code(code: &[u8]) -> Result<Self, MemoryError> {
        let mut mem = Self::alloc(code.len())?;
        mem.write(code)?;
        mem.make_executable()?;
        Ok(mem)
    }
}

#[cfg(unix)]
fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

#[cfg(not(unix))]
fn page_size() -> usize {
    4096
}

fn round_to_page(len: usize) -> Result<usize, MemoryError> {
    if len == 0 {
        return Err(MemoryError::InvalidSize);
    }
    let page = page_size();
    len.checked_add(page - 1).map(|l| l & !(page - 1)).ok_or(MemoryError::InvalidSize)
}

/// Flush the instruction cache for freshly written code.
#[allow(unused_variables)]
fn flush_icache(ptr: *const u8, len: usize) {
    #[cfg(all(target_os = "linux", any(target_arch = "aarch64", target_arch = "arm")))]
    unsafe {
        __clear_cache(ptr as *mut libc::c_char, ptr.add(len) as *mut libc::c_char);
    }
    #[cfg(target_os = "macos")]
    unsafe {
        sys_icache_invalidate(ptr as *mut libc::c_void, len);
    }
    #[cfg(windows)]
    unsafe {
        use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
        use windows_sys::Win32::System::Threading::GetCurrentProcess;
        FlushInstructionCache(GetCurrentProcess(), ptr as *const _, len);
    }
}

#[cfg(all(target_os = "linux", any(target_arch = "aarch64", target_arch = "arm")))]
unsafe extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}

#[cfg(target_os = "macos")]
unsafe extern "C" {
    fn pthread_jit_write_protect_supported_np() -> libc::c_int;
    fn pthread_jit_write_protect_np(enabled: libc::c_int);
    fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
}

/// Anonymous `mmap` mapping.
#[cfg(unix)]
pub struct MmapMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

#[cfg(unix)]
impl ExecutableMemory for MmapMemory {
    fn alloc(len: usize) -> Result<Self, MemoryError> {
        let size = round_to_page(len)?;
        // macOS hands out MAP_JIT pages as RWX and toggles writability per
        // thread instead of through mprotect.
        #[cfg(target_os = "macos")]
        let (prot, flags) = (
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_JIT,
        );
        #[cfg(not(target_os = "macos"))]
        let (prot, flags) = (libc::PROT_READ | libc::PROT_WRITE, libc::MAP_PRIVATE | libc::MAP_ANON);

        let ptr = unsafe { libc::mmap(std::ptr::null_mut(), size, prot, flags, -1, 0) };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)?;
        Ok(MmapMemory { ptr, size, executable: false })
    }

    fn write(&mut self, code: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::ProtectionFailed);
        }
        if code.len() > self.size {
            return Err(MemoryError::InvalidSize);
        }
        #[cfg(target_os = "macos")]
        unsafe {
            let toggle = pthread_jit_write_protect_supported_np() != 0;
            if toggle {
                pthread_jit_write_protect_np(0);
            }
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.ptr.as_ptr(), code.len());
            if toggle {
                pthread_jit_write_protect_np(1);
            }
        }
        #[cfg(not(target_os = "macos"))]
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.ptr.as_ptr(), code.len());
        }
        Ok(())
    }

    fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }
        #[cfg(not(target_os = "macos"))]
        {
            let rc = unsafe {
                libc::mprotect(self.ptr.as_ptr() as *mut libc::c_void, self.size, libc::PROT_READ | libc::PROT_EXEC)
            };
            if rc != 0 {
                return Err(MemoryError::ProtectionFailed);
            }
        }
        flush_icache(self.ptr.as_ptr(), self.size);
        self.executable = true;
        Ok(())
    }

    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.size
    }

    fn is_executable(&self) -> bool {
        self.executable
    }
}

#[cfg(unix)]
impl Drop for MmapMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

/// `VirtualAlloc` mapping.
#[cfg(windows)]
pub struct VirtualMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

#[cfg(windows)]
impl ExecutableMemory for VirtualMemory {
    fn alloc(len: usize) -> Result<Self, MemoryError> {
        use windows_sys::Win32::System::Memory::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE, VirtualAlloc};

        let size = round_to_page(len)?;
        let ptr = unsafe { VirtualAlloc(std::ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        let ptr = NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)?;
        Ok(VirtualMemory { ptr, size, executable: false })
    }

    fn write(&mut self, code: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::ProtectionFailed);
        }
        if code.len() > self.size {
            return Err(MemoryError::InvalidSize);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.ptr.as_ptr(), code.len());
        }
        Ok(())
    }

    fn make_executable(&mut self) -> Result<(), MemoryError> {
        use windows_sys::Win32::System::Memory::{PAGE_EXECUTE_READ, VirtualProtect};

        if self.executable {
            return Ok(());
        }
        let mut old = 0;
        let ok = unsafe { VirtualProtect(self.ptr.as_ptr() as *const _, self.size, PAGE_EXECUTE_READ, &mut old) };
        if ok == 0 {
            return Err(MemoryError::ProtectionFailed);
        }
        flush_icache(self.ptr.as_ptr(), self.size);
        self.executable = true;
        Ok(())
    }

    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.size
    }

    fn is_executable(&self) -> bool {
        self.executable
    }
}

#[cfg(windows)]
impl Drop for VirtualMemory {
    fn drop(&mut self) {
        use windows_sys::Win32::System::Memory::{MEM_RELEASE, VirtualFree};
        unsafe {
            VirtualFree(self.ptr.as_ptr() as *mut _, 0, MEM_RELEASE);
        }
    }
}

/// The mapping type used on this host.
#[cfg(unix)]
pub type HostMemory = MmapMemory;
#[cfg(windows)]
pub type HostMemory = VirtualMemory;

// The mapping is exclusively owned and immutable once executable.
#[cfg(unix)]
unsafe impl Send for MmapMemory {}
#[cfg(unix)]
unsafe impl Sync for MmapMemory {}
#[cfg(windows)]
unsafe impl Send for VirtualMemory {}
#[cfg(windows)]
unsafe impl Sync for VirtualMemory {}
