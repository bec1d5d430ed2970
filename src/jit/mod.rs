//! Native code generation for LMNT defs.
//!
//! [`compile`] turns one def into machine code for any supported target.
//! Code for the host can be run with [`jit_execute`] and [`jit_resume`],
//! which follow the same contract as the interpreter: arguments come from
//! the context stack, return values are copied out, and an interrupted def
//! can be resumed by either engine.
//!
//! Backends are selected by Cargo feature (`jit-x86-64`, `jit-arm64`,
//! `jit-armv7a`, `jit-armv7m`); compiling for a disabled target yields
//! [`LmntError::NoImpl`].

use std::ffi::c_void;
use std::ops::Range;

use tracing::debug;

pub mod aarch64;
pub mod armv7;
#[cfg(feature = "jit-arm64")]
pub mod backend_aarch64;
#[cfg(any(feature = "jit-armv7a", feature = "jit-armv7m"))]
pub mod backend_armv7;
#[cfg(feature = "jit-x86-64")]
pub mod backend_x86_64;
pub mod codebuf;
pub mod compiler;
pub mod helpers;
pub mod memory;
pub mod regcache;
pub mod x86_64;

pub use crate::config::Target;
pub use compiler::JitStats;

use crate::config::RuntimeConfig;
use crate::vm::archive::Def;
use crate::vm::error::LmntError;
use crate::vm::interpreter::{Context, Execution, Outcome};
use crate::vm::opcodes::Instruction;
use compiler::Emitted;
use helpers::{EntryFn, HelperEnv, JitFrame, RESULT_INTERRUPTED, RESULT_RETURNED};
use memory::{ExecutableMemory, HostMemory};

/// How to compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    pub target: Target,
    /// Use the Windows x64 calling convention for x86-64 code.
    pub windows_abi: bool,
    pub allow_nonvolatile_registers: bool,
    pub validate_register_cache: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            target: Target::Current,
            windows_abi: cfg!(windows),
            allow_nonvolatile_registers: false,
            validate_register_cache: false,
        }
    }
}

impl CompileOptions {
    pub fn for_target(target: Target) -> Self {
        CompileOptions { target, ..Default::default() }
    }
}

impl From<&RuntimeConfig> for CompileOptions {
    fn from(config: &RuntimeConfig) -> Self {
        CompileOptions {
            target: config.jit_target,
            windows_abi: cfg!(windows),
            allow_nonvolatile_registers: config.allow_nonvolatile_registers,
            validate_register_cache: config.validate_register_cache,
        }
    }
}

/// Whether this build has a backend for `target`.
pub fn has_backend(target: Target) -> bool {
    match target.resolve() {
        Some(Target::X86_64) => cfg!(feature = "jit-x86-64"),
        Some(Target::Arm64) => cfg!(feature = "jit-arm64"),
        Some(Target::Armv7a) => cfg!(feature = "jit-armv7a"),
        Some(Target::Armv7m) => cfg!(feature = "jit-armv7m"),
        _ => false,
    }
}

/// A compiled def.
pub struct JitFunction {
    def: Def,
    target: Target,
    code: Vec<Instruction>,
    bytes: Vec<u8>,
    /// Present only when the code can run on this host.
    memory: Option<HostMemory>,
    thumb: bool,
    body: Range<usize>,
    resume_points: Vec<u32>,
    stats: JitStats,
}

impl std::fmt::Debug for JitFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitFunction")
            .field("def", &self.def.offset)
            .field("target", &self.target)
            .field("codesize", &self.bytes.len())
            .field("executable", &self.memory.is_some())
            .finish()
    }
}

impl JitFunction {
    pub fn def(&self) -> Def {
        self.def
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// The generated machine code.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn stats(&self) -> JitStats {
        self.stats
    }

    /// Instructions compiled code can resume at, besides the first.
    pub fn resume_points(&self) -> &[u32] {
        &self.resume_points
    }

    /// Whether [`jit_execute`] can run this function on this host.
    pub fn is_executable(&self) -> bool {
        self.memory.is_some() || self.def.is_extern()
    }

    /// Whether `ip` lies in the part of the code that polls for interrupts.
    /// Only reads immutable fields, so it may be called from a signal
    /// handler.
    pub fn is_interruptible(&self, ip: usize) -> bool {
        match &self.memory {
            Some(memory) => {
                let base = memory.as_ptr() as usize;
                ip >= base + self.body.start && ip < base + self.body.end
            }
            None => false,
        }
    }

    fn entry(&self) -> Option<EntryFn> {
        let memory = self.memory.as_ref()?;
        let addr = memory.as_ptr() as usize | self.thumb as usize;
        // SAFETY: the mapping holds code generated for this host's calling
        // convention, starting with the entry prologue.
        Some(unsafe { std::mem::transmute::<usize, EntryFn>(addr) })
    }

    fn can_resume_at(&self, index: u32) -> bool {
        index == 0 || self.resume_points.binary_search(&index).is_ok()
    }
}

fn emit_for(target: Target, code: &[Instruction], options: &CompileOptions) -> Result<Emitted, LmntError> {
    let validate = options.validate_register_cache;
    match target {
        #[cfg(feature = "jit-x86-64")]
        Target::X86_64 => {
            use backend_x86_64::{Abi, X86_64Backend};
            let abi = if options.windows_abi {
                Abi::Win64 { nonvolatile: options.allow_nonvolatile_registers }
            } else {
                Abi::SysV
            };
            compiler::emit(X86_64Backend::new(abi), code, validate)
        }
        #[cfg(feature = "jit-arm64")]
        Target::Arm64 => compiler::emit(backend_aarch64::AArch64Backend, code, validate),
        #[cfg(feature = "jit-armv7a")]
        Target::Armv7a => compiler::emit(backend_armv7::Armv7Backend::a(), code, validate),
        #[cfg(feature = "jit-armv7m")]
        Target::Armv7m => compiler::emit(backend_armv7::Armv7Backend::m(), code, validate),
        _ => Err(LmntError::NoImpl),
    }
}

/// Whether code for `target` compiled with `options` runs on this host.
fn runs_on_host(target: Target, options: &CompileOptions) -> bool {
    Target::host() == Some(target) && (target != Target::X86_64 || options.windows_abi == cfg!(windows))
}

/// Compile `def` from the context's prepared archive.
///
/// Extern defs compile to an empty function that calls the bound extcall
/// when executed.
pub fn compile(ctx: &Context<'_>, def: &Def, options: &CompileOptions) -> Result<JitFunction, LmntError> {
    let def = ctx.checked_def(def)?;
    let target = options.target.resolve().ok_or(LmntError::NoImpl)?;
    if !has_backend(target) {
        return Err(LmntError::NoImpl);
    }
    if def.is_extern() {
        return Ok(JitFunction {
            def,
            target,
            code: Vec::new(),
            bytes: Vec::new(),
            memory: None,
            thumb: false,
            body: 0..0,
            resume_points: Vec::new(),
            stats: JitStats::default(),
        });
    }

    let code = ctx.archive().get_def_code(&def)?.to_vec();
    let emitted = emit_for(target, &code, options)?;
    let memory = if runs_on_host(target, options) && !emitted.bytes.is_empty() {
        Some(HostMemory::from_code(&emitted.bytes)?)
    } else {
        None
    };
    let stats = emitted.stats;
    debug!(
        def = def.offset,
        target = %target,
        codesize = stats.codesize,
        reg_alloc = stats.reg_alloc,
        reg_evicted = stats.reg_evicted,
        fallbacks = stats.fallbacks,
        executable = memory.is_some(),
        "def compiled"
    );
    Ok(JitFunction {
        def,
        target,
        code,
        bytes: emitted.bytes,
        memory,
        thumb: target == Target::Armv7m,
        body: emitted.body,
        resume_points: emitted.resume_points,
        stats,
    })
}

/// Run compiled code from `resume_at` (0 for the first instruction).
fn run_native(ctx: &mut Context<'_>, function: &JitFunction, def: &Def, resume_at: u32) -> Result<Outcome, LmntError> {
    if def.is_extern() {
        return ctx.run(def);
    }
    let entry = function.entry().ok_or(LmntError::NoImpl)?;
    let parts = ctx.native_parts();
    let mut env = HelperEnv {
        archive: parts.archive,
        extcalls: parts.extcalls,
        code: &function.code,
        stack_len: parts.stack.len(),
        cur_stack_count: parts.cur_stack_count,
        error: None,
    };
    let mut frame = JitFrame {
        stack: parts.stack.as_mut_ptr(),
        interrupt: parts.interrupt,
        helper: helpers::fallback,
        env: &mut env as *mut HelperEnv<'_, '_> as *mut c_void,
        resume_at,
        status: *parts.status,
        cur_instr: resume_at,
    };
    // SAFETY: the frame points at the context's stack, which the validator
    // sized for every operand of this def, and at an environment that
    // outlives the call.
    let rc = unsafe { entry(&mut frame) };
    *parts.status = frame.status;
    match rc {
        RESULT_RETURNED => Ok(Outcome::Returned),
        RESULT_INTERRUPTED => {
            *parts.cur_instr = frame.cur_instr;
            Ok(Outcome::Interrupted)
        }
        rc => Err(env.error.take().or_else(|| LmntError::from_code(rc)).unwrap_or(LmntError::Internal)),
    }
}

fn check_executable(function: &JitFunction) -> Result<(), LmntError> {
    if function.is_executable() { Ok(()) } else { Err(LmntError::NoImpl) }
}

/// Run a compiled def from its first instruction.
pub fn jit_execute(
    ctx: &mut Context<'_>,
    function: &JitFunction,
    rvals: Option<&mut [f32]>,
) -> Result<Execution, LmntError> {
    check_executable(function)?;
    let def = ctx.begin_execute(&function.def, rvals.as_deref())?;
    let outcome = run_native(ctx, function, &def, 0);
    ctx.finish(&def, outcome, rvals)
}

/// Continue an interrupted def. Compiled code picks up at the backward
/// branch target it stopped at; a def the interpreter interrupted elsewhere
/// is finished by the interpreter.
pub fn jit_resume(
    ctx: &mut Context<'_>,
    function: &JitFunction,
    rvals: Option<&mut [f32]>,
) -> Result<Execution, LmntError> {
    check_executable(function)?;
    let def = ctx.begin_resume(&function.def, rvals.as_deref())?;
    let at = ctx.cur_instr;
    let outcome = if function.can_resume_at(at) {
        run_native(ctx, function, &def, at)
    } else {
        ctx.run(&def)
    };
    ctx.finish(&def, outcome, rvals)
}
