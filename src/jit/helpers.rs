//! The boundary between compiled code and the interpreter.
//!
//! Compiled code receives one pointer, to a [`JitFrame`]. Values live in the
//! context's stack; everything else the code needs (interrupt byte, status
//! word, resume point) is a frame field at a fixed offset. Opcodes a backend
//! does not lower natively call back into [`fallback`], which runs the
//! interpreter's implementation of that one instruction.

use std::ffi::c_void;
use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::vm::archive::Archive;
use crate::vm::error::LmntError;
use crate::vm::extcall::ExtcallTable;
use crate::vm::opcodes::Instruction;
use crate::vm::ops::{ControlFlow, ExecState, execute_instruction};

/// Native entry point: returns 0 on return, -1 on interrupt, anything else
/// on error.
pub type EntryFn = unsafe extern "C" fn(frame: *mut JitFrame) -> i32;

/// Runs instruction `index` of the def being executed.
pub type HelperFn = unsafe extern "C" fn(frame: *mut JitFrame, index: u32) -> i32;

pub const RESULT_RETURNED: i32 = 0;
pub const RESULT_INTERRUPTED: i32 = LmntError::INTERRUPTED;
/// Returned by the helper when it recorded an error in the environment.
pub const RESULT_FAILED: i32 = 1;

#[repr(C)]
pub struct JitFrame {
    pub stack: *mut f32,
    pub interrupt: *const u8,
    pub helper: HelperFn,
    pub env: *mut c_void,
    /// Instruction to start at; 0 runs the def from the top.
    pub resume_at: u32,
    pub status: u32,
    /// Where to resume after an interrupt.
    pub cur_instr: u32,
}

/// Field offsets of [`JitFrame`] for a target with `pointer_size`-byte
/// pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub stack: u32,
    pub interrupt: u32,
    pub helper: u32,
    pub env: u32,
    pub resume_at: u32,
    pub status: u32,
    pub cur_instr: u32,
}

impl FrameLayout {
    pub const fn new(pointer_size: u32) -> Self {
        FrameLayout {
            stack: 0,
            interrupt: pointer_size,
            helper: 2 * pointer_size,
            env: 3 * pointer_size,
            resume_at: 4 * pointer_size,
            status: 4 * pointer_size + 4,
            cur_instr: 4 * pointer_size + 8,
        }
    }
}

pub const FRAME_64: FrameLayout = FrameLayout::new(8);
pub const FRAME_32: FrameLayout = FrameLayout::new(4);

/// Borrowed interpreter state the helper executes against.
pub struct HelperEnv<'e, 'a> {
    pub archive: &'e Archive<'a>,
    pub extcalls: &'e ExtcallTable,
    pub code: &'e [Instruction],
    pub stack_len: usize,
    pub cur_stack_count: usize,
    pub error: Option<LmntError>,
}

/// Execute one instruction through the interpreter on behalf of compiled
/// code. Only straight-line instructions are routed here.
///
/// # Safety
/// `frame` must point to a live frame whose `env` is a `HelperEnv` and whose
/// `stack` holds `env.stack_len` values.
pub unsafe extern "C" fn fallback(frame: *mut JitFrame, index: u32) -> i32 {
    let Some(frame) = (unsafe { frame.as_mut() }) else {
        return LmntError::Internal.code();
    };
    let Some(env) = (unsafe { (frame.env as *mut HelperEnv<'_, '_>).as_mut() }) else {
        return LmntError::Internal.code();
    };
    let stack = unsafe { std::slice::from_raw_parts_mut(frame.stack, env.stack_len) };

    let result = match env.code.get(index as usize) {
        Some(ins) => {
            let mut state = ExecState {
                stack,
                status: &mut frame.status,
                cur_stack_count: env.cur_stack_count,
                archive: env.archive,
                extcalls: env.extcalls,
            };
            // Extcalls are user code; a panic must not unwind into JIT frames.
            catch_unwind(AssertUnwindSafe(|| execute_instruction(&mut state, ins)))
                .unwrap_or(Err(LmntError::Internal))
        }
        None => Err(LmntError::Internal),
    };

    match result {
        Ok(ControlFlow::Continue) => RESULT_RETURNED,
        Ok(_) => {
            env.error = Some(LmntError::Internal);
            RESULT_FAILED
        }
        Err(e) => {
            env.error = Some(e);
            RESULT_FAILED
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::builder::ArchiveBuilder;
    use crate::vm::opcodes::Opcode;
    use crate::vm::verifier::validate;

    #[test]
    fn test_layout_matches_host() {
        let layout = FrameLayout::new(std::mem::size_of::<usize>() as u32);
        assert_eq!(std::mem::offset_of!(JitFrame, stack) as u32, layout.stack);
        assert_eq!(std::mem::offset_of!(JitFrame, interrupt) as u32, layout.interrupt);
        assert_eq!(std::mem::offset_of!(JitFrame, helper) as u32, layout.helper);
        assert_eq!(std::mem::offset_of!(JitFrame, env) as u32, layout.env);
        assert_eq!(std::mem::offset_of!(JitFrame, resume_at) as u32, layout.resume_at);
        assert_eq!(std::mem::offset_of!(JitFrame, status) as u32, layout.status);
        assert_eq!(std::mem::offset_of!(JitFrame, cur_instr) as u32, layout.cur_instr);
    }

    fn run_fallback(code: &[Instruction], stack: &mut [f32], index: u32) -> (i32, Option<LmntError>, u32) {
        let mut archive = Archive::new(ArchiveBuilder::new().build());
        validate(&mut archive, 4096).unwrap();
        let extcalls = ExtcallTable::default();
        let mut env = HelperEnv {
            archive: &archive,
            extcalls: &extcalls,
            code,
            stack_len: stack.len(),
            cur_stack_count: stack.len(),
            error: None,
        };
        let interrupt = 0u8;
        let mut frame = JitFrame {
            stack: stack.as_mut_ptr(),
            interrupt: &interrupt,
            helper: fallback,
            env: &mut env as *mut HelperEnv<'_, '_> as *mut c_void,
            resume_at: 0,
            status: 0,
            cur_instr: 0,
        };
        let rc = unsafe { fallback(&mut frame, index) };
        let status = frame.status;
        (rc, env.error, status)
    }

    #[test]
    fn test_fallback_runs_instruction() {
        let code = [Instruction::new(Opcode::PowSS, 0, 1, 2), Instruction::new(Opcode::Cmp, 0, 1, 0)];
        let mut stack = [2.0f32, 3.0, 0.0];
        assert_eq!(run_fallback(&code, &mut stack, 0), (RESULT_RETURNED, None, 0));
        assert_eq!(stack[2], 8.0);
        let (rc, _, status) = run_fallback(&code, &mut stack, 1);
        assert_eq!(rc, RESULT_RETURNED);
        assert_eq!(status, crate::vm::ops::status::CMP_LT);
    }

    #[test]
    fn test_fallback_reports_errors() {
        let code = [Instruction::new(Opcode::IndexRIS, 0, 0, 1), Instruction::new(Opcode::Branch, 0, 0, 0)];
        let mut stack = [100.0f32, 0.0];
        assert_eq!(run_fallback(&code, &mut stack, 0), (RESULT_FAILED, Some(LmntError::AccessViolation), 0));
        // Control flow never goes through the helper.
        assert_eq!(run_fallback(&code, &mut stack, 1), (RESULT_FAILED, Some(LmntError::Internal), 0));
        assert_eq!(run_fallback(&code, &mut stack, 7).1, Some(LmntError::Internal));
    }
}
