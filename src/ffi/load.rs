//! Archive loading FFI functions.

#![allow(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_safety_doc)]

use super::types::{LmntIctx, LmntResult};
use super::vm_ffi::get_wrapper_mut;
use crate::vm::error::LmntError;

/// Copy an archive into the context.
///
/// Equivalent to `lmnt_load_archive_begin`, one `lmnt_load_archive_append`
/// and `lmnt_load_archive_end`. The archive must be smaller than the
/// context's memory budget.
///
/// # Returns
/// - `LMNT_OK` on success
/// - `LMNT_ERROR_INVALID_PTR` if `ctx` or `data` is NULL
/// - `LMNT_ERROR_MEMORY_SIZE` if the archive does not fit
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lmnt_load_archive(ctx: *mut LmntIctx, data: *const u8, size: usize) -> LmntResult {
    let Some(wrapper) = get_wrapper_mut(ctx) else {
        return LmntError::InvalidPtr.code();
    };
    if data.is_null() {
        return wrapper.fail(LmntError::InvalidPtr);
    }
    let bytes = std::slice::from_raw_parts(data, size);
    let result = wrapper.ctx.load_archive(bytes);
    wrapper.result(result)
}

/// Start loading an archive in chunks, discarding any loaded one.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lmnt_load_archive_begin(ctx: *mut LmntIctx) -> LmntResult {
    let Some(wrapper) = get_wrapper_mut(ctx) else {
        return LmntError::InvalidPtr.code();
    };
    let result = wrapper.ctx.load_archive_begin();
    wrapper.result(result)
}

/// Append a chunk to the archive being loaded.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lmnt_load_archive_append(ctx: *mut LmntIctx, data: *const u8, size: usize) -> LmntResult {
    let Some(wrapper) = get_wrapper_mut(ctx) else {
        return LmntError::InvalidPtr.code();
    };
    if data.is_null() {
        return wrapper.fail(LmntError::InvalidPtr);
    }
    let bytes = std::slice::from_raw_parts(data, size);
    let result = wrapper.ctx.load_archive_append(bytes);
    wrapper.result(result)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn lmnt_load_archive_end(ctx: *mut LmntIctx) -> LmntResult {
    let Some(wrapper) = get_wrapper_mut(ctx) else {
        return LmntError::InvalidPtr.code();
    };
    let result = wrapper.ctx.load_archive_end();
    wrapper.result(result)
}

/// Use caller-owned archive bytes without copying them.
///
/// # Safety
///
/// `data` must stay valid and unmodified until another archive is loaded
/// or the context is freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lmnt_load_inplace_archive(ctx: *mut LmntIctx, data: *const u8, size: usize) -> LmntResult {
    let Some(wrapper) = get_wrapper_mut(ctx) else {
        return LmntError::InvalidPtr.code();
    };
    if data.is_null() {
        return wrapper.fail(LmntError::InvalidPtr);
    }
    let bytes: &'static [u8] = std::slice::from_raw_parts(data, size);
    let result = wrapper.ctx.load_inplace_archive(bytes);
    wrapper.result(result)
}

/// Validate the loaded archive and lay out the stack.
///
/// When the archive is invalid, `LMNT_ERROR_INVALID_ARCHIVE` is returned
/// and the detailed validation code is stored through `validation`, if not
/// NULL. It is set to 0 on success.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lmnt_prepare_archive(ctx: *mut LmntIctx, validation: *mut i32) -> LmntResult {
    let Some(wrapper) = get_wrapper_mut(ctx) else {
        return LmntError::InvalidPtr.code();
    };
    let result = wrapper.ctx.prepare_archive();
    if !validation.is_null() {
        *validation = match &result {
            Err(LmntError::InvalidArchive(detail)) => detail.code(),
            _ => 0,
        };
    }
    wrapper.result(result)
}
