//! JIT FFI functions.

#![allow(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_safety_doc)]

use super::types::{LmntIctx, LmntJitStats, LmntResult, LmntTarget};
use super::vm_ffi::get_wrapper_mut;
use crate::jit::{self, CompileOptions, JitFunction};
use crate::vm::archive::Def;
use crate::vm::error::LmntError;

/// Opaque compiled def.
///
/// Created by `lmnt_jit_compile()` and released with
/// `lmnt_jit_delete_function()`.
#[repr(C)]
pub struct LmntJitFn {
    _private: [u8; 0],
}

unsafe fn get_function<'f>(function: *const LmntJitFn) -> Option<&'f JitFunction> {
    if function.is_null() { None } else { Some(&*(function as *const JitFunction)) }
}

/// Compile a def for `target` (an `LmntTarget` value).
///
/// Code for a target other than the host can be compiled and inspected but
/// not executed. `stats` may be NULL.
///
/// # Returns
/// - `LMNT_OK` with `*function` set on success
/// - `LMNT_ERROR_NO_IMPL` if the build has no backend for `target`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lmnt_jit_compile(
    ctx: *mut LmntIctx,
    def: *const Def,
    target: i32,
    function: *mut *mut LmntJitFn,
    stats: *mut LmntJitStats,
) -> LmntResult {
    let Some(wrapper) = get_wrapper_mut(ctx) else {
        return LmntError::InvalidPtr.code();
    };
    if def.is_null() || function.is_null() {
        return wrapper.fail(LmntError::InvalidPtr);
    }
    let Some(target) = LmntTarget::from_raw(target) else {
        return wrapper.fail(LmntError::NoImpl);
    };
    match jit::compile(&wrapper.ctx, &*def, &CompileOptions::for_target(target)) {
        Ok(compiled) => {
            if !stats.is_null() {
                let s = compiled.stats();
                *stats = LmntJitStats {
                    codesize: s.codesize,
                    reg_alloc: s.reg_alloc,
                    reg_aligned: s.reg_aligned,
                    reg_unaligned: s.reg_unaligned,
                    reg_evicted: s.reg_evicted,
                    reg_evicted_written: s.reg_evicted_written,
                    fallbacks: s.fallbacks,
                };
            }
            *function = Box::into_raw(Box::new(compiled)) as *mut LmntJitFn;
            wrapper.clear_error();
            LmntError::OK
        }
        Err(err) => wrapper.fail(err),
    }
}

/// Run a compiled def from its first instruction.
///
/// Same results as `lmnt_execute`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lmnt_jit_execute(
    ctx: *mut LmntIctx,
    function: *const LmntJitFn,
    rvals: *mut f32,
    rvals_count: usize,
) -> LmntResult {
    let Some(wrapper) = get_wrapper_mut(ctx) else {
        return LmntError::InvalidPtr.code();
    };
    let Some(function) = get_function(function) else {
        return wrapper.fail(LmntError::InvalidPtr);
    };
    let rvals = if rvals.is_null() { None } else { Some(std::slice::from_raw_parts_mut(rvals, rvals_count)) };
    let result = jit::jit_execute(&mut wrapper.ctx, function, rvals);
    wrapper.execution(result)
}

/// Continue a compiled def stopped by `lmnt_interrupt`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lmnt_jit_resume(
    ctx: *mut LmntIctx,
    function: *const LmntJitFn,
    rvals: *mut f32,
    rvals_count: usize,
) -> LmntResult {
    let Some(wrapper) = get_wrapper_mut(ctx) else {
        return LmntError::InvalidPtr.code();
    };
    let Some(function) = get_function(function) else {
        return wrapper.fail(LmntError::InvalidPtr);
    };
    let rvals = if rvals.is_null() { None } else { Some(std::slice::from_raw_parts_mut(rvals, rvals_count)) };
    let result = jit::jit_resume(&mut wrapper.ctx, function, rvals);
    wrapper.execution(result)
}

/// Free a compiled def.
///
/// # Safety
///
/// `function` must be NULL or come from `lmnt_jit_compile()`, and must not
/// be running.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lmnt_jit_delete_function(function: *mut LmntJitFn) {
    if function.is_null() {
        return;
    }
    drop(Box::from_raw(function as *mut JitFunction));
}

/// Whether `ip` lies in the interrupt-polling body of `function`.
///
/// Meant for signal handlers deciding whether a fault or timer tick landed
/// in compiled code.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lmnt_jit_is_interruptible(function: *const LmntJitFn, ip: usize) -> bool {
    get_function(function).is_some_and(|f| f.is_interruptible(ip))
}

/// Copy the generated machine code into `out`.
///
/// Returns the code size in bytes; at most `capacity` bytes are written.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lmnt_jit_get_code(function: *const LmntJitFn, out: *mut u8, capacity: usize) -> usize {
    let Some(function) = get_function(function) else {
        return 0;
    };
    let bytes = function.bytes();
    if !out.is_null() {
        let n = capacity.min(bytes.len());
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), out, n);
    }
    bytes.len()
}

/// Whether the build can compile for `target`.
#[unsafe(no_mangle)]
pub extern "C" fn lmnt_jit_has_backend(target: i32) -> bool {
    LmntTarget::from_raw(target).is_some_and(jit::has_backend)
}
