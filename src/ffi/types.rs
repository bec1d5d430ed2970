//! FFI type definitions for the C API.

use std::cell::UnsafeCell;
use std::ffi::{CString, c_char};

use crate::vm::error::LmntError;
use crate::vm::extcall::ForeignExtcall;
use crate::vm::interpreter::{Context, Execution, InterruptHandle};

/// Result of an `lmnt_*` call: zero or a count on success, a negative
/// error code otherwise. `LMNT_INTERRUPTED` (-1) reports a suspended def.
pub type LmntResult = i32;

/// Opaque interpreter context.
///
/// Created by `lmnt_ictx_new()` and released with `lmnt_ictx_free()`.
#[repr(C)]
pub struct LmntIctx {
    _private: [u8; 0],
}

/// One instruction, as laid out in an archive's code segment.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LmntInstruction {
    pub opcode: u16,
    pub arg1: u16,
    pub arg2: u16,
    pub arg3: u16,
}

/// An extcall supplied by the host.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LmntExtcallInfo {
    /// NUL-terminated name, copied by `lmnt_set_extcalls`.
    pub name: *const c_char,
    pub args_count: u16,
    pub rvals_count: u16,
    pub function: Option<ForeignExtcall>,
}

/// JIT statistics of one compiled def.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LmntJitStats {
    pub codesize: u32,
    pub reg_alloc: u32,
    pub reg_aligned: u32,
    pub reg_unaligned: u32,
    pub reg_evicted: u32,
    pub reg_evicted_written: u32,
    pub fallbacks: u32,
}

/// JIT targets, as passed to `lmnt_jit_compile`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LmntTarget {
    Current = 0,
    X86_64 = 1,
    Armv7a = 2,
    Armv7m = 3,
    Arm64 = 4,
}

impl LmntTarget {
    pub fn from_raw(value: i32) -> Option<crate::config::Target> {
        use crate::config::Target;
        Some(match value {
            0 => Target::Current,
            1 => Target::X86_64,
            2 => Target::Armv7a,
            3 => Target::Armv7m,
            4 => Target::Arm64,
            _ => return None,
        })
    }
}

/// Context plus the FFI-side state that goes with it.
/// The allocation behind an `LmntIctx` pointer.
///
/// Calls on the owning thread borrow `wrapper` mutably through the cell.
/// `lmnt_interrupt` only ever touches `interrupt`, so it never overlaps
/// that borrow.
pub(crate) struct IctxCell {
    pub interrupt: InterruptHandle,
    pub wrapper: UnsafeCell<IctxWrapper>,
}

impl IctxCell {
    pub fn new(ctx: Context<'static>) -> Self {
        Self { interrupt: ctx.interrupt_handle(), wrapper: UnsafeCell::new(IctxWrapper::new(ctx)) }
    }
}

pub(crate) struct IctxWrapper {
    pub ctx: Context<'static>,
    /// Message of the last failed call.
    pub last_error: Option<CString>,
}

impl IctxWrapper {
    pub fn new(ctx: Context<'static>) -> Self {
        Self { ctx, last_error: None }
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(CString::new(message.into()).unwrap_or_default());
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    /// Record the outcome of a call and turn it into a result code.
    pub fn result(&mut self, result: Result<(), LmntError>) -> LmntResult {
        match result {
            Ok(()) => {
                self.clear_error();
                LmntError::OK
            }
            Err(err) => self.fail(err),
        }
    }

    pub fn fail(&mut self, err: LmntError) -> LmntResult {
        self.set_error(err.to_string());
        err.code()
    }

    pub fn execution(&mut self, result: Result<Execution, LmntError>) -> LmntResult {
        match result {
            Ok(Execution::Complete(count)) => {
                self.clear_error();
                count as LmntResult
            }
            Ok(Execution::Interrupted) => {
                self.clear_error();
                LmntError::INTERRUPTED
            }
            Err(err) => self.fail(err),
        }
    }
}
