//! Error handling FFI functions.

#![allow(unsafe_op_in_unsafe_fn)]

use std::ffi::c_char;

use super::types::LmntIctx;
use super::vm_ffi::{get_wrapper, get_wrapper_mut};

/// Get the message of the last failed call on `ctx`.
///
/// Returns NULL if the last call succeeded. The pointer is valid until the
/// next call on the same context.
///
/// # Example (C)
/// ```c
/// int32_t res = lmnt_execute(ctx, &def, rvals, 1);
/// if (res < 0 && res != LMNT_INTERRUPTED) {
///     printf("Error: %s\n", lmnt_get_error(ctx));
/// }
/// ```
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lmnt_get_error(ctx: *const LmntIctx) -> *const c_char {
    match get_wrapper(ctx).and_then(|w| w.last_error.as_ref()) {
        Some(error) => error.as_ptr(),
        None => std::ptr::null(),
    }
}

/// Clear the last error.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lmnt_clear_error(ctx: *mut LmntIctx) {
    if let Some(wrapper) = get_wrapper_mut(ctx) {
        wrapper.clear_error();
    }
}

/// Map a result code to a static description.
#[unsafe(no_mangle)]
pub extern "C" fn lmnt_result_name(code: i32) -> *const c_char {
    let name: &'static [u8] = match code {
        0 => b"ok\0",
        -1 => b"interrupted\0",
        -2 => b"invalid pointer\0",
        -3 => b"invalid size\0",
        -4 => b"invalid archive\0",
        -0x10 => b"stack depth exceeded\0",
        -0x11 => b"stack too small\0",
        -0x12 => b"stack in use\0",
        -0x20 => b"argument count mismatch\0",
        -0x21 => b"return value count mismatch\0",
        -0x22 => b"def mismatch\0",
        -0x30 => b"not found\0",
        -0x40 => b"access violation\0",
        -0x41 => b"not enough memory\0",
        -0x50 => b"missing extcall\0",
        -0x51 => b"feature disabled\0",
        -0x60 => b"unprepared archive\0",
        -0xF0 => b"internal error\0",
        -0xF1 => b"no implementation\0",
        c if c > 0 => b"count\0",
        _ => b"extcall error\0",
    };
    name.as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::load::lmnt_prepare_archive;
    use crate::ffi::vm_ffi::{lmnt_ictx_free, lmnt_ictx_new};
    use crate::vm::error::LmntError;
    use std::ffi::CStr;

    #[test]
    fn test_get_error() {
        unsafe {
            let ctx = lmnt_ictx_new(4096);
            assert!(lmnt_get_error(ctx).is_null());

            // Nothing loaded yet.
            assert!(lmnt_prepare_archive(ctx, std::ptr::null_mut()) < 0);
            let error = lmnt_get_error(ctx);
            assert!(!error.is_null());
            assert!(!CStr::from_ptr(error).to_str().unwrap().is_empty());

            lmnt_clear_error(ctx);
            assert!(lmnt_get_error(ctx).is_null());
            lmnt_ictx_free(ctx);
        }
    }

    #[test]
    fn test_error_null_ctx() {
        unsafe {
            assert!(lmnt_get_error(std::ptr::null()).is_null());
            lmnt_clear_error(std::ptr::null_mut());
        }
    }

    #[test]
    fn test_result_name() {
        let name = |code| unsafe { CStr::from_ptr(lmnt_result_name(code)).to_str().unwrap() };
        assert_eq!(name(LmntError::NotFound.code()), "not found");
        assert_eq!(name(LmntError::INTERRUPTED), "interrupted");
        assert_eq!(name(-0x1234), "extcall error");
        assert_eq!(name(3), "count");
    }
}
