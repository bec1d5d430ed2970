//! The LMNT virtual machine: archive format, validation and interpretation.

pub mod archive;
pub mod builder;
pub mod error;
pub mod extcall;
pub mod interpreter;
pub mod opcodes;
pub mod ops;
pub mod verifier;

pub use archive::{Archive, ArchiveFlags, ArchiveHeader, Code, DataSection, Def};
pub use builder::{ArchiveBuilder, DefRecord, create_archive};
pub use error::{LmntError, ValidationError};
pub use extcall::{ExtcallFunction, ExtcallInfo, ExtcallTable, ForeignExtcall, NativeExtcall};
pub use interpreter::{Context, DispatchMode, Execution, InterruptHandle};
pub use opcodes::{Instruction, Opcode, Operand};
pub use verifier::validate;
