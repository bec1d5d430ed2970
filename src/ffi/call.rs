//! Execution and extcall registration FFI functions.

#![allow(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_safety_doc)]

use std::ffi::{CStr, c_char};

use super::types::{LmntExtcallInfo, LmntIctx, LmntResult};
use super::vm_ffi::get_wrapper_mut;
use crate::vm::archive::Def;
use crate::vm::error::LmntError;
use crate::vm::extcall::{ExtcallInfo, ExtcallTable};

unsafe fn rvals_slice<'r>(rvals: *mut f32, count: usize) -> Option<&'r mut [f32]> {
    if rvals.is_null() { None } else { Some(std::slice::from_raw_parts_mut(rvals, count)) }
}

/// Run a def from its first instruction.
///
/// # Arguments
/// - `ctx`: Context with a prepared archive
/// - `def`: Def record obtained from `lmnt_find_def`
/// - `rvals`: Receives the return values, or NULL to leave them on the stack
/// - `rvals_count`: Capacity of `rvals`
///
/// # Returns
/// - The number of return values copied on success
/// - `LMNT_INTERRUPTED` if `lmnt_interrupt` stopped the def
/// - A negative error code otherwise
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lmnt_execute(
    ctx: *mut LmntIctx,
    def: *const Def,
    rvals: *mut f32,
    rvals_count: usize,
) -> LmntResult {
    let Some(wrapper) = get_wrapper_mut(ctx) else {
        return LmntError::InvalidPtr.code();
    };
    if def.is_null() {
        return wrapper.fail(LmntError::InvalidPtr);
    }
    let result = wrapper.ctx.execute(&*def, rvals_slice(rvals, rvals_count));
    wrapper.execution(result)
}

/// Continue a def stopped by `lmnt_interrupt`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lmnt_resume(
    ctx: *mut LmntIctx,
    def: *const Def,
    rvals: *mut f32,
    rvals_count: usize,
) -> LmntResult {
    let Some(wrapper) = get_wrapper_mut(ctx) else {
        return LmntError::InvalidPtr.code();
    };
    if def.is_null() {
        return wrapper.fail(LmntError::InvalidPtr);
    }
    let result = wrapper.ctx.resume(&*def, rvals_slice(rvals, rvals_count));
    wrapper.execution(result)
}

/// Install the extcall table. Names are copied.
///
/// Every entry needs a name and a function. If an archive is prepared, its
/// extern defs are rebound to the new table.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lmnt_set_extcalls(ctx: *mut LmntIctx, table: *const LmntExtcallInfo, count: usize) -> LmntResult {
    let Some(wrapper) = get_wrapper_mut(ctx) else {
        return LmntError::InvalidPtr.code();
    };
    if table.is_null() && count > 0 {
        return wrapper.fail(LmntError::InvalidPtr);
    }
    let entries = if count == 0 { &[][..] } else { std::slice::from_raw_parts(table, count) };
    let mut infos = Vec::with_capacity(entries.len());
    for entry in entries {
        let (false, Some(function)) = (entry.name.is_null(), entry.function) else {
            return wrapper.fail(LmntError::InvalidPtr);
        };
        let name = CStr::from_ptr(entry.name).to_string_lossy();
        infos.push(ExtcallInfo::foreign(&name, entry.args_count, entry.rvals_count, function));
    }
    let result = wrapper.ctx.set_extcalls(ExtcallTable::new(infos));
    wrapper.result(result)
}

/// Find an extcall by signature and store its table index in `index`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lmnt_find_extcall(
    ctx: *mut LmntIctx,
    name: *const c_char,
    args_count: u16,
    rvals_count: u16,
    index: *mut usize,
) -> LmntResult {
    let Some(wrapper) = get_wrapper_mut(ctx) else {
        return LmntError::InvalidPtr.code();
    };
    if name.is_null() || index.is_null() {
        return wrapper.fail(LmntError::InvalidPtr);
    }
    let name = CStr::from_ptr(name).to_string_lossy();
    match wrapper.ctx.find_extcall(&name, args_count, rvals_count) {
        Ok(found) => {
            *index = found;
            wrapper.clear_error();
            LmntError::OK
        }
        Err(err) => wrapper.fail(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::load::{lmnt_load_archive, lmnt_prepare_archive};
    use crate::ffi::stack::{lmnt_find_def, lmnt_update_args};
    use crate::ffi::vm_ffi::{lmnt_ictx_free, lmnt_ictx_new, lmnt_interrupt};
    use crate::vm::builder::{ArchiveBuilder, create_archive};
    use crate::vm::opcodes::{Instruction, Opcode};

    unsafe extern "C" fn double(args: *const f32, _args_count: u16, rvals: *mut f32, _rvals_count: u16) -> i32 {
        unsafe { *rvals = *args * 2.0 };
        0
    }

    unsafe fn prepared(bytes: &[u8]) -> *mut LmntIctx {
        let ctx = lmnt_ictx_new(4096);
        assert_eq!(lmnt_load_archive(ctx, bytes.as_ptr(), bytes.len()), 0);
        assert_eq!(lmnt_prepare_archive(ctx, std::ptr::null_mut()), 0);
        ctx
    }

    #[test]
    fn test_execute() {
        let bytes = create_archive("f", 2, 1, 3, &[], &[Instruction::new(Opcode::MulSS, 0, 1, 2)]);
        unsafe {
            let ctx = prepared(&bytes);
            let mut def = std::mem::zeroed::<Def>();
            assert_eq!(lmnt_find_def(ctx, c"f".as_ptr(), &mut def), 0);
            let args = [3.0f32, 4.0];
            assert_eq!(lmnt_update_args(ctx, &def, 0, args.as_ptr(), 2), 0);
            let mut rvals = [0.0f32; 1];
            assert_eq!(lmnt_execute(ctx, &def, rvals.as_mut_ptr(), 1), 1);
            assert_eq!(rvals[0], 12.0);
            assert_eq!(lmnt_execute(ctx, &def, rvals.as_mut_ptr(), 0), LmntError::RvalsMismatch.code());
            lmnt_ictx_free(ctx);
        }
    }

    #[test]
    fn test_interrupt_and_resume() {
        let bytes = create_archive("f", 1, 1, 2, &[], &[Instruction::new(Opcode::AddSS, 0, 0, 1)]);
        unsafe {
            let ctx = prepared(&bytes);
            let mut def = std::mem::zeroed::<Def>();
            assert_eq!(lmnt_find_def(ctx, c"f".as_ptr(), &mut def), 0);
            let args = [2.5f32];
            assert_eq!(lmnt_update_args(ctx, &def, 0, args.as_ptr(), 1), 0);
            let mut rvals = [0.0f32; 1];
            // Execute clears pending requests, so resume with no suspended
            // def reports a mismatch.
            assert_eq!(lmnt_interrupt(ctx), 0);
            assert_eq!(lmnt_execute(ctx, &def, rvals.as_mut_ptr(), 1), 1);
            assert_eq!(rvals[0], 5.0);
            assert_eq!(lmnt_resume(ctx, &def, rvals.as_mut_ptr(), 1), LmntError::DefMismatch.code());
            lmnt_ictx_free(ctx);
        }
    }

    #[test]
    fn test_interrupt_from_another_thread() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        // counts up forever
        let code = [Instruction::new(Opcode::AddSS, 0, 1, 1), Instruction::new(Opcode::Branch, 0, 0, 0)];
        let bytes = create_archive("spin", 1, 1, 2, &[], &code);
        unsafe {
            let ctx = prepared(&bytes);
            let mut def = std::mem::zeroed::<Def>();
            assert_eq!(lmnt_find_def(ctx, c"spin".as_ptr(), &mut def), 0);
            let args = [1.0f32];
            assert_eq!(lmnt_update_args(ctx, &def, 0, args.as_ptr(), 1), 0);

            let done = Arc::new(AtomicBool::new(false));
            let poker = {
                let done = done.clone();
                let addr = ctx as usize;
                std::thread::spawn(move || {
                    while !done.load(Ordering::Relaxed) {
                        assert_eq!(lmnt_interrupt(addr as *const LmntIctx), 0);
                        std::thread::sleep(std::time::Duration::from_millis(1));
                    }
                })
            };
            let mut rvals = [0.0f32; 1];
            assert_eq!(lmnt_execute(ctx, &def, rvals.as_mut_ptr(), 1), crate::ffi::LMNT_INTERRUPTED);
            assert_eq!(lmnt_resume(ctx, &def, rvals.as_mut_ptr(), 1), crate::ffi::LMNT_INTERRUPTED);
            done.store(true, Ordering::Relaxed);
            poker.join().unwrap();
            lmnt_ictx_free(ctx);
        }
    }

    #[test]
    fn test_extcalls() {
        let mut b = ArchiveBuilder::new();
        b.extern_def("double", 1, 1);
        let bytes = b.build();
        let table = [LmntExtcallInfo { name: c"double".as_ptr(), args_count: 1, rvals_count: 1, function: Some(double) }];
        unsafe {
            let ctx = lmnt_ictx_new(4096);
            assert_eq!(lmnt_set_extcalls(ctx, table.as_ptr(), table.len()), 0);
            assert_eq!(lmnt_load_archive(ctx, bytes.as_ptr(), bytes.len()), 0);
            assert_eq!(lmnt_prepare_archive(ctx, std::ptr::null_mut()), 0);

            let mut index = usize::MAX;
            assert_eq!(lmnt_find_extcall(ctx, c"double".as_ptr(), 1, 1, &mut index), 0);
            assert_eq!(index, 0);
            assert_eq!(lmnt_find_extcall(ctx, c"double".as_ptr(), 2, 1, &mut index), LmntError::NotFound.code());

            let mut def = std::mem::zeroed::<Def>();
            assert_eq!(lmnt_find_def(ctx, c"double".as_ptr(), &mut def), 0);
            let args = [21.0f32];
            assert_eq!(lmnt_update_args(ctx, &def, 0, args.as_ptr(), 1), 0);
            let mut rvals = [0.0f32; 1];
            assert_eq!(lmnt_execute(ctx, &def, rvals.as_mut_ptr(), 1), 1);
            assert_eq!(rvals[0], 42.0);
            lmnt_ictx_free(ctx);
        }
    }

    #[test]
    fn test_missing_function_rejected() {
        let table = [LmntExtcallInfo { name: c"f".as_ptr(), args_count: 1, rvals_count: 1, function: None }];
        unsafe {
            let ctx = lmnt_ictx_new(4096);
            assert_eq!(lmnt_set_extcalls(ctx, table.as_ptr(), 1), LmntError::InvalidPtr.code());
            lmnt_ictx_free(ctx);
        }
    }
}
