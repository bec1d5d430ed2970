//! Context lifecycle FFI functions.

#![allow(unsafe_op_in_unsafe_fn)]

use super::types::{IctxCell, IctxWrapper, LmntIctx, LmntResult};
use crate::vm::error::LmntError;
use crate::vm::interpreter::Context;

/// Create a context with a memory budget of `memory_size` bytes, shared by
/// the archive copy and the value stack.
///
/// Returns NULL if the budget is below the minimum. The context must be
/// freed with `lmnt_ictx_free()`.
///
/// # Example (C)
/// ```c
/// lmnt_ictx *ctx = lmnt_ictx_new(64 * 1024);
/// if (ctx == NULL) {
///     // memory_size too small
/// }
/// lmnt_ictx_free(ctx);
/// ```
#[unsafe(no_mangle)]
pub extern "C" fn lmnt_ictx_new(memory_size: usize) -> *mut LmntIctx {
    match Context::new(memory_size) {
        Ok(ctx) => Box::into_raw(Box::new(IctxCell::new(ctx))) as *mut LmntIctx,
        Err(_) => std::ptr::null_mut(),
    }
}

/// Free a context.
///
/// # Safety
///
/// - `ctx` must be NULL or a pointer returned by `lmnt_ictx_new()`
/// - `ctx` must not have been freed already
/// - No JIT function compiled from it may run afterwards
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lmnt_ictx_free(ctx: *mut LmntIctx) {
    if ctx.is_null() {
        return;
    }
    drop(Box::from_raw(ctx as *mut IctxCell));
}

/// Request that the def running on `ctx` stop at the next interrupt check.
///
/// May be called from another thread while the def runs.
///
/// # Safety
///
/// `ctx` must be a live context.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lmnt_interrupt(ctx: *const LmntIctx) -> LmntResult {
    if ctx.is_null() {
        return LmntError::InvalidPtr.code();
    }
    // the running call holds the wrapper, so stay on the handle
    let cell = &*(ctx as *const IctxCell);
    cell.interrupt.interrupt();
    LmntError::OK
}

/// Helper to get a mutable reference to the wrapper from a raw pointer.
///
/// Returns None if the pointer is null.
pub(crate) unsafe fn get_wrapper_mut(ctx: *mut LmntIctx) -> Option<&'static mut IctxWrapper> {
    if ctx.is_null() {
        return None;
    }
    let cell = &*(ctx as *const IctxCell);
    Some(&mut *cell.wrapper.get())
}

/// Helper to get an immutable reference to the wrapper from a raw pointer.
///
/// Returns None if the pointer is null.
pub(crate) unsafe fn get_wrapper(ctx: *const LmntIctx) -> Option<&'static IctxWrapper> {
    if ctx.is_null() {
        return None;
    }
    let cell = &*(ctx as *const IctxCell);
    Some(&*cell.wrapper.get())
}
