//! LMNT - a compact bytecode VM for single-precision math
//!
//! This library loads and validates LMNT archives, interprets their defs
//! and, with the `jit` feature, compiles them to native code.
//! For C/C++ embedding, use the FFI module functions.

pub mod config;
pub mod ffi;
#[cfg(all(feature = "jit", any(unix, windows)))]
pub mod jit;
pub mod logging;
pub mod vm;

// Re-export commonly used types
pub use config::{JitMode, RuntimeConfig, Target};
pub use vm::{Archive, Context, Def, Execution, ExtcallInfo, ExtcallTable, Instruction, LmntError, Opcode, ValidationError};

// Re-export FFI types for C bindings
pub use ffi::*;
