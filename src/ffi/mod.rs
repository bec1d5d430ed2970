//! C API for embedding LMNT
//!
//! Every function uses the `extern "C"` ABI and reports failures as the
//! negative codes of [`LmntError`](crate::vm::LmntError). Execution entry
//! points return the number of return values on success and
//! `LMNT_INTERRUPTED` (-1) when a def was suspended.
//!
//! # Safety
//!
//! All FFI functions that take raw pointers require:
//! - Non-null pointers (unless documented otherwise)
//! - Contexts created by `lmnt_ictx_new()`
//! - Def records obtained from the same context's archive

mod call;
mod error;
#[cfg(all(feature = "jit", any(unix, windows)))]
mod jit;
mod load;
mod stack;
mod types;
mod vm_ffi;

// Re-export all FFI types and functions for public use
#[allow(unused_imports)]
pub use call::*;
#[allow(unused_imports)]
pub use error::*;
#[cfg(all(feature = "jit", any(unix, windows)))]
#[allow(unused_imports)]
pub use jit::*;
#[allow(unused_imports)]
pub use load::*;
#[allow(unused_imports)]
pub use stack::*;
#[allow(unused_imports)]
pub use types::*;
#[allow(unused_imports)]
pub use vm_ffi::*;

/// Version information
pub const LMNT_VERSION_MAJOR: u32 = 0;
pub const LMNT_VERSION_MINOR: u32 = 1;
pub const LMNT_VERSION_PATCH: u32 = 0;

pub const LMNT_OK: i32 = 0;
pub const LMNT_INTERRUPTED: i32 = -1;

/// Get the version string
#[unsafe(no_mangle)]
pub extern "C" fn lmnt_version() -> *const std::ffi::c_char {
    static VERSION: &[u8] = b"0.1.0\0";
    VERSION.as_ptr() as *const std::ffi::c_char
}
