//! Def lookup and argument FFI functions.

#![allow(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_safety_doc)]

use std::ffi::{CStr, c_char};

use super::types::{LmntIctx, LmntInstruction, LmntResult};
use super::vm_ffi::{get_wrapper, get_wrapper_mut};
use crate::vm::archive::Def;
use crate::vm::error::LmntError;

/// Look up a def by name.
///
/// # Arguments
/// - `ctx`: Context with a prepared archive
/// - `name`: NUL-terminated def name
/// - `def`: Receives a copy of the def record
///
/// # Returns
/// - `LMNT_OK` on success
/// - `LMNT_ERROR_NOT_FOUND` if no def has that name
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lmnt_find_def(ctx: *mut LmntIctx, name: *const c_char, def: *mut Def) -> LmntResult {
    let Some(wrapper) = get_wrapper_mut(ctx) else {
        return LmntError::InvalidPtr.code();
    };
    if name.is_null() || def.is_null() {
        return wrapper.fail(LmntError::InvalidPtr);
    }
    let Ok(name) = CStr::from_ptr(name).to_str() else {
        return wrapper.fail(LmntError::NotFound);
    };
    match wrapper.ctx.find_def(name) {
        Ok(found) => {
            *def = found;
            wrapper.clear_error();
            LmntError::OK
        }
        Err(err) => wrapper.fail(err),
    }
}

/// Write `count` argument values starting at argument `offset`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lmnt_update_args(
    ctx: *mut LmntIctx,
    def: *const Def,
    offset: u16,
    args: *const f32,
    count: usize,
) -> LmntResult {
    let Some(wrapper) = get_wrapper_mut(ctx) else {
        return LmntError::InvalidPtr.code();
    };
    if def.is_null() || (args.is_null() && count > 0) {
        return wrapper.fail(LmntError::InvalidPtr);
    }
    let values = if count == 0 { &[][..] } else { std::slice::from_raw_parts(args, count) };
    let result = wrapper.ctx.update_args(&*def, offset, values);
    wrapper.result(result)
}

/// Copy a def's instructions into `out`.
///
/// Returns the number of instructions the def has. At most `capacity` are
/// written; pass a NULL `out` to query the count.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lmnt_get_def_code(
    ctx: *mut LmntIctx,
    def: *const Def,
    out: *mut LmntInstruction,
    capacity: usize,
) -> LmntResult {
    let Some(wrapper) = get_wrapper_mut(ctx) else {
        return LmntError::InvalidPtr.code();
    };
    if def.is_null() {
        return wrapper.fail(LmntError::InvalidPtr);
    }
    let ctx = &wrapper.ctx;
    let code = ctx.checked_def(&*def).and_then(|d| ctx.archive().get_def_code(&d).map(|c| c.to_vec()));
    let code = match code {
        Ok(code) => code,
        Err(err) => return wrapper.fail(err),
    };
    if !out.is_null() {
        let out = std::slice::from_raw_parts_mut(out, capacity.min(code.len()));
        for (slot, ins) in out.iter_mut().zip(&code) {
            *slot = LmntInstruction { opcode: ins.opcode, arg1: ins.arg1, arg2: ins.arg2, arg3: ins.arg3 };
        }
    }
    wrapper.clear_error();
    code.len() as LmntResult
}

/// Number of values in the prepared stack, constants included.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lmnt_get_stack_count(ctx: *const LmntIctx) -> usize {
    get_wrapper(ctx).map(|w| w.ctx.stack_count()).unwrap_or(0)
}
