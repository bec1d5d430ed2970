//! Interpreter context and run loop.
//!
//! A [`Context`] owns the value stack (constants followed by the writable
//! region) and the resumption state of the def currently executing. Only one
//! def is current at a time; an interrupted def must be resumed (or the
//! context reloaded) before its state is discarded.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::{debug, trace};

use super::archive::{Archive, Def};
use super::error::LmntError;
use super::extcall::{ExtcallInfo, ExtcallTable};
use super::ops::{execute_instruction, ControlFlow, ExecState};
use super::verifier::validate;

/// Smallest memory budget a context accepts: room for 16 values.
pub const MIN_MEMORY_SIZE: usize = 16 * std::mem::size_of::<f32>();

/// Result of a successful `execute` or `resume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// The def returned; holds the number of return values copied out.
    Complete(usize),
    /// The def stopped at an interrupt and can be resumed.
    Interrupted,
}

/// How the run loop treats the next instruction.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Normal = 0,
    Interrupted = 1,
}

/// Requests cooperative interruption of a context.
///
/// The flag is a relaxed atomic: a request is observed at the next
/// instruction (or the next backward branch in compiled code) but is not a
/// synchronisation point for anything else.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    mode: Arc<AtomicU8>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.mode.store(DispatchMode::Interrupted as u8, Ordering::Relaxed);
    }

    pub fn mode(&self) -> DispatchMode {
        if self.is_interrupted() { DispatchMode::Interrupted } else { DispatchMode::Normal }
    }

    #[inline]
    pub(crate) fn is_interrupted(&self) -> bool {
        self.mode.load(Ordering::Relaxed) != DispatchMode::Normal as u8
    }

    pub(crate) fn reset(&self) {
        self.mode.store(DispatchMode::Normal as u8, Ordering::Relaxed);
    }

    /// Address of the mode byte, polled by compiled code.
    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.mode.as_ptr()
    }
}

/// How a run of a def ended, before return values are copied out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Returned,
    Interrupted,
}

/// Disjoint borrows of the state compiled code runs against.
pub(crate) struct NativeParts<'c, 'a> {
    pub stack: &'c mut [f32],
    pub status: &'c mut u32,
    pub cur_instr: &'c mut u32,
    pub archive: &'c Archive<'a>,
    pub extcalls: &'c ExtcallTable,
    pub cur_stack_count: usize,
    pub interrupt: *const u8,
}

pub struct Context<'a> {
    memory_size: usize,
    archive: Archive<'a>,
    loading: Option<Vec<u8>>,
    extcalls: ExtcallTable,
    pub(crate) stack: Vec<f32>,
    constants_count: usize,
    def_offsets: Vec<u32>,
    pub(crate) cur_def: Option<Def>,
    pub(crate) cur_instr: u32,
    pub(crate) cur_stack_count: usize,
    pub(crate) status: u32,
    interrupt: InterruptHandle,
}

impl<'a> Context<'a> {
    pub fn new(memory_size: usize) -> Result<Self, LmntError> {
        if memory_size < MIN_MEMORY_SIZE {
            return Err(LmntError::MemorySize);
        }
        Ok(Context {
            memory_size,
            archive: Archive::new(Vec::new()),
            loading: None,
            extcalls: ExtcallTable::default(),
            stack: Vec::new(),
            constants_count: 0,
            def_offsets: Vec::new(),
            cur_def: None,
            cur_instr: 0,
            cur_stack_count: 0,
            status: 0,
            interrupt: InterruptHandle::default(),
        })
    }

    pub fn memory_size(&self) -> usize {
        self.memory_size
    }

    pub fn archive(&self) -> &Archive<'a> {
        &self.archive
    }

    pub fn extcalls(&self) -> &ExtcallTable {
        &self.extcalls
    }

    /// Total stack size in values, constants included. Zero until prepared.
    pub fn stack_count(&self) -> usize {
        self.stack.len()
    }

    pub fn constants_count(&self) -> usize {
        self.constants_count
    }

    /// The stack region following the constants.
    pub fn writable_stack(&self) -> &[f32] {
        self.stack.get(self.constants_count..).unwrap_or(&[])
    }

    pub fn current_def(&self) -> Option<Def> {
        self.cur_def
    }

    /// Index of the next instruction of the current def.
    pub fn current_instruction(&self) -> u32 {
        self.cur_instr
    }

    pub fn status_flags(&self) -> u32 {
        self.status
    }

    pub fn is_prepared(&self) -> bool {
        self.archive.is_validated() && !self.stack.is_empty()
    }

    fn reset(&mut self, archive: Archive<'a>) {
        self.archive = archive;
        self.stack.clear();
        self.constants_count = 0;
        self.def_offsets.clear();
        self.cur_def = None;
        self.cur_instr = 0;
        self.cur_stack_count = 0;
        self.status = 0;
    }

    // ==== Loading ====

    /// Copy `data` into the context and use it as the archive.
    pub fn load_archive(&mut self, data: &[u8]) -> Result<(), LmntError> {
        self.load_archive_begin()?;
        self.load_archive_append(data)?;
        self.load_archive_end()
    }

    pub fn load_archive_begin(&mut self) -> Result<(), LmntError> {
        self.reset(Archive::new(Vec::new()));
        self.loading = Some(Vec::new());
        Ok(())
    }

    /// Append a chunk to an archive being loaded. The archive must stay
    /// smaller than the memory budget.
    pub fn load_archive_append(&mut self, data: &[u8]) -> Result<(), LmntError> {
        let loading = self.loading.as_mut().ok_or(LmntError::InvalidPtr)?;
        if data.len() >= self.memory_size.saturating_sub(loading.len()) {
            return Err(LmntError::MemorySize);
        }
        loading.extend_from_slice(data);
        Ok(())
    }

    pub fn load_archive_end(&mut self) -> Result<(), LmntError> {
        let data = self.loading.take().ok_or(LmntError::InvalidPtr)?;
        debug!(size = data.len(), "archive loaded");
        self.reset(Archive::new(data));
        Ok(())
    }

    /// Use `data` as the archive without copying it.
    pub fn load_inplace_archive(&mut self, data: &'a [u8]) -> Result<(), LmntError> {
        self.loading = None;
        debug!(size = data.len(), "archive loaded in place");
        self.reset(Archive::inplace(data));
        Ok(())
    }

    /// Validate the loaded archive, lay out the stack and bind extern defs
    /// to the extcall table.
    pub fn prepare_archive(&mut self) -> Result<(), LmntError> {
        let stack_count = validate(&mut self.archive, self.memory_size)?;
        let constants = self.archive.get_constants()?;
        let mut stack = vec![0.0; stack_count];
        stack[..constants.len()].copy_from_slice(&constants);
        self.stack = stack;
        self.constants_count = constants.len();
        self.def_offsets = self.archive.defs()?.iter().map(|d| d.offset).collect();
        self.archive.update_def_extcalls(&self.extcalls)?;
        debug!(
            stack_count,
            constants = self.constants_count,
            defs = self.def_offsets.len(),
            inplace = self.archive.is_inplace(),
            "archive prepared"
        );
        Ok(())
    }

    // ==== Extcalls ====

    /// Replace the extcall table. A prepared archive is rebound immediately.
    pub fn set_extcalls(&mut self, table: ExtcallTable) -> Result<(), LmntError> {
        debug!(count = table.len(), "extcall table set");
        self.extcalls = table;
        if self.archive.is_validated() {
            self.archive.update_def_extcalls(&self.extcalls)?;
        }
        Ok(())
    }

    pub fn find_extcall(&self, name: &str, args_count: u16, rvals_count: u16) -> Result<usize, LmntError> {
        self.extcalls.find_index(name, args_count, rvals_count)
    }

    pub fn get_extcall(&self, index: usize) -> Result<&ExtcallInfo, LmntError> {
        self.extcalls.get(index)
    }

    // ==== Execution ====

    pub fn find_def(&self, name: &str) -> Result<Def, LmntError> {
        self.archive.find_def(name)
    }

    /// The archive's own record for `def`, rejecting defs from elsewhere.
    pub(crate) fn checked_def(&self, def: &Def) -> Result<Def, LmntError> {
        if !self.is_prepared() {
            return Err(LmntError::UnpreparedArchive);
        }
        if self.def_offsets.binary_search(&def.offset).is_err() {
            return Err(LmntError::NotFound);
        }
        let stored = self.archive.get_def(def.offset)?;
        if stored != *def {
            return Err(LmntError::NotFound);
        }
        Ok(stored)
    }

    /// Copy `values` into the def's arguments starting at `offset`.
    pub fn update_args(&mut self, def: &Def, offset: u16, values: &[f32]) -> Result<(), LmntError> {
        let def = self.checked_def(def)?;
        let end = offset as usize + values.len();
        if end > self.stack.len() {
            return Err(LmntError::AccessViolation);
        }
        if end > def.args_count as usize {
            return Err(LmntError::ArgsMismatch);
        }
        let start = self.constants_count + offset as usize;
        let slot = self
            .stack
            .get_mut(start..start + values.len())
            .ok_or(LmntError::AccessViolation)?;
        slot.copy_from_slice(values);
        Ok(())
    }

    pub fn update_arg(&mut self, def: &Def, index: u16, value: f32) -> Result<(), LmntError> {
        self.update_args(def, index, &[value])
    }

    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub(crate) fn native_parts(&mut self) -> NativeParts<'_, 'a> {
        NativeParts {
            stack: &mut self.stack,
            status: &mut self.status,
            cur_instr: &mut self.cur_instr,
            archive: &self.archive,
            extcalls: &self.extcalls,
            cur_stack_count: self.cur_stack_count,
            interrupt: self.interrupt.as_ptr(),
        }
    }

    /// Start `def` from its first instruction. Arguments are whatever
    /// [`Context::update_args`] last wrote.
    pub fn execute(&mut self, def: &Def, rvals: Option<&mut [f32]>) -> Result<Execution, LmntError> {
        let def = self.begin_execute(def, rvals.as_deref())?;
        let outcome = self.run(&def);
        self.finish(&def, outcome, rvals)
    }

    /// Continue an interrupted `def`.
    pub fn resume(&mut self, def: &Def, rvals: Option<&mut [f32]>) -> Result<Execution, LmntError> {
        let def = self.begin_resume(def, rvals.as_deref())?;
        let outcome = self.run(&def);
        self.finish(&def, outcome, rvals)
    }

    pub(crate) fn begin_execute(&mut self, def: &Def, rvals: Option<&[f32]>) -> Result<Def, LmntError> {
        let def = self.checked_def(def)?;
        check_rvals(&def, rvals)?;
        trace!(def = def.offset, "execute");
        self.cur_def = Some(def);
        self.cur_instr = 0;
        self.cur_stack_count = self.constants_count + def.stack_count_unaligned as usize;
        self.interrupt.reset();
        Ok(def)
    }

    pub(crate) fn begin_resume(&mut self, def: &Def, rvals: Option<&[f32]>) -> Result<Def, LmntError> {
        let def = self.checked_def(def)?;
        if self.cur_def.map(|d| d.offset) != Some(def.offset) {
            return Err(LmntError::DefMismatch);
        }
        check_rvals(&def, rvals)?;
        trace!(def = def.offset, instr = self.cur_instr, "resume");
        self.interrupt.reset();
        Ok(def)
    }

    /// Interpret `def` from `cur_instr` until it returns, fails or sees an
    /// interrupt request.
    pub(crate) fn run(&mut self, def: &Def) -> Result<Outcome, LmntError> {
        if def.is_extern() {
            return self.call_extern(def);
        }
        let code = self.archive.get_def_code(def)?;
        let mut state = ExecState {
            stack: &mut self.stack,
            status: &mut self.status,
            cur_stack_count: self.cur_stack_count,
            archive: &self.archive,
            extcalls: &self.extcalls,
        };
        let count = code.len() as u32;
        let mut instr = self.cur_instr;
        let outcome = loop {
            if instr >= count {
                break Ok(Outcome::Returned);
            }
            if self.interrupt.is_interrupted() {
                break Ok(Outcome::Interrupted);
            }
            let Some(ins) = code.get(instr as usize) else {
                break Err(LmntError::Internal);
            };
            match execute_instruction(&mut state, &ins) {
                Ok(ControlFlow::Continue) => instr += 1,
                Ok(ControlFlow::Branch(target)) => instr = target,
                Ok(ControlFlow::Return) => break Ok(Outcome::Returned),
                Err(e) => break Err(e),
            }
        };
        self.cur_instr = instr;
        outcome
    }

    /// Run an extern def directly: its arguments and return values sit at
    /// the start of the writable stack.
    fn call_extern(&mut self, def: &Def) -> Result<Outcome, LmntError> {
        let info = self.extcalls.get(def.code as usize).map_err(|_| LmntError::MissingExtcall)?;
        let args_count = def.args_count as usize;
        let start = self.constants_count;
        let end = start + args_count + def.rvals_count as usize;
        let window = self.stack.get_mut(start..end).ok_or(LmntError::StackSize)?;
        let (args, rvals) = window.split_at_mut(args_count);
        info.call(args, rvals)?;
        Ok(Outcome::Returned)
    }

    /// Settle the resumption state after a run and copy return values out.
    pub(crate) fn finish(
        &mut self,
        def: &Def,
        outcome: Result<Outcome, LmntError>,
        rvals: Option<&mut [f32]>,
    ) -> Result<Execution, LmntError> {
        if !matches!(outcome, Ok(Outcome::Interrupted)) {
            self.cur_def = None;
            self.cur_instr = 0;
            self.cur_stack_count = 0;
        }
        match outcome? {
            Outcome::Interrupted => Ok(Execution::Interrupted),
            Outcome::Returned => {
                let Some(out) = rvals else {
                    return Ok(Execution::Complete(0));
                };
                let count = def.rvals_count as usize;
                let start = self.constants_count + def.args_count as usize;
                let values = self.stack.get(start..start + count).ok_or(LmntError::AccessViolation)?;
                out[..count].copy_from_slice(values);
                Ok(Execution::Complete(count))
            }
        }
    }
}

fn check_rvals(def: &Def, rvals: Option<&[f32]>) -> Result<(), LmntError> {
    match rvals {
        Some(out) if out.len() < def.rvals_count as usize => Err(LmntError::RvalsMismatch),
        _ => Ok(()),
    }
}
