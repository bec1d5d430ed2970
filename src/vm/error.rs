//! Result taxonomies for the LMNT engine.
//!
//! [`LmntError`] is what every operational entry point fails with, while
//! [`ValidationError`] is the fine-grained verdict of the archive validator.
//! Both carry stable negative `i32` codes that cross the C ABI unchanged.

/// Operational error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LmntError {
    InvalidPtr,
    InvalidSize,
    /// The archive failed validation; the payload is the detailed verdict.
    InvalidArchive(ValidationError),
    StackDepth,
    StackSize,
    StackInUse,
    ArgsMismatch,
    RvalsMismatch,
    DefMismatch,
    NotFound,
    AccessViolation,
    MemorySize,
    MissingExtcall,
    FeatureDisabled,
    UnpreparedArchive,
    Internal,
    NoImpl,
    /// A code returned by an extcall that is not one of the known ones.
    Extcall(i32),
}

impl LmntError {
    pub const OK: i32 = 0;
    pub const INTERRUPTED: i32 = -1;

    /// The stable numeric code of this error.
    pub fn code(&self) -> i32 {
        match self {
            LmntError::InvalidPtr => -2,
            LmntError::InvalidSize => -3,
            LmntError::InvalidArchive(_) => -4,
            LmntError::StackDepth => -0x10,
            LmntError::StackSize => -0x11,
            LmntError::StackInUse => -0x12,
            LmntError::ArgsMismatch => -0x20,
            LmntError::RvalsMismatch => -0x21,
            LmntError::DefMismatch => -0x22,
            LmntError::NotFound => -0x30,
            LmntError::AccessViolation => -0x40,
            LmntError::MemorySize => -0x41,
            LmntError::MissingExtcall => -0x50,
            LmntError::FeatureDisabled => -0x51,
            LmntError::UnpreparedArchive => -0x60,
            LmntError::Internal => -0xF0,
            LmntError::NoImpl => -0xF1,
            LmntError::Extcall(code) => *code,
        }
    }

    /// Map a numeric code back to an error.
    ///
    /// `0` and `-1` are not errors and yield `None`. Positive codes are
    /// counts and also yield `None`.
    pub fn from_code(code: i32) -> Option<LmntError> {
        let err = match code {
            c if c >= Self::INTERRUPTED => return None,
            -2 => LmntError::InvalidPtr,
            -3 => LmntError::InvalidSize,
            -4 => LmntError::InvalidArchive(ValidationError::Unknown),
            -0x10 => LmntError::StackDepth,
            -0x11 => LmntError::StackSize,
            -0x12 => LmntError::StackInUse,
            -0x20 => LmntError::ArgsMismatch,
            -0x21 => LmntError::RvalsMismatch,
            -0x22 => LmntError::DefMismatch,
            -0x30 => LmntError::NotFound,
            -0x40 => LmntError::AccessViolation,
            -0x41 => LmntError::MemorySize,
            -0x50 => LmntError::MissingExtcall,
            -0x51 => LmntError::FeatureDisabled,
            -0x60 => LmntError::UnpreparedArchive,
            -0xF0 => LmntError::Internal,
            -0xF1 => LmntError::NoImpl,
            other => LmntError::Extcall(other),
        };
        Some(err)
    }
}

impl std::fmt::Display for LmntError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LmntError::InvalidPtr => write!(f, "invalid pointer"),
            LmntError::InvalidSize => write!(f, "invalid size"),
            LmntError::InvalidArchive(detail) => write!(f, "invalid archive: {}", detail),
            LmntError::StackDepth => write!(f, "stack depth exceeded"),
            LmntError::StackSize => write!(f, "stack too small"),
            LmntError::StackInUse => write!(f, "stack in use"),
            LmntError::ArgsMismatch => write!(f, "argument count mismatch"),
            LmntError::RvalsMismatch => write!(f, "return value count mismatch"),
            LmntError::DefMismatch => write!(f, "def does not match the suspended def"),
            LmntError::NotFound => write!(f, "not found"),
            LmntError::AccessViolation => write!(f, "access violation"),
            LmntError::MemorySize => write!(f, "not enough memory"),
            LmntError::MissingExtcall => write!(f, "extern def has no matching extcall"),
            LmntError::FeatureDisabled => write!(f, "feature disabled"),
            LmntError::UnpreparedArchive => write!(f, "archive has not been prepared"),
            LmntError::Internal => write!(f, "internal error"),
            LmntError::NoImpl => write!(f, "no implementation for the requested target"),
            LmntError::Extcall(code) => write!(f, "extcall failed with code {}", code),
        }
    }
}

impl std::error::Error for LmntError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LmntError::InvalidArchive(detail) => Some(detail),
            _ => None,
        }
    }
}

/// Validation verdicts, one per violated archive invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    StringHeader,
    StringSize,
    StringData,
    StringAlign,
    DefHeader,
    DefFlags,
    DefSize,
    DefCyclic,
    AccessViolation,
    BadInstruction,
    CodeHeader,
    CodeSize,
    HeaderMagic,
    SegmentsSize,
    SegmentsAlign,
    ConstantsAlign,
    StackSize,
    StackDepth,
    DataHeader,
    DataSize,
    /// Only produced when decoding a bare `INVALID_ARCHIVE` code.
    Unknown,
}

impl ValidationError {
    pub const OK: i32 = 0;

    pub fn code(&self) -> i32 {
        match self {
            ValidationError::StringHeader => -0x10,
            ValidationError::StringSize => -0x11,
            ValidationError::StringData => -0x12,
            ValidationError::StringAlign => -0x13,
            ValidationError::DefHeader => -0x20,
            ValidationError::DefFlags => -0x21,
            ValidationError::DefSize => -0x22,
            ValidationError::DefCyclic => -0x23,
            ValidationError::AccessViolation => -0x30,
            ValidationError::BadInstruction => -0x31,
            ValidationError::CodeHeader => -0x40,
            ValidationError::CodeSize => -0x41,
            ValidationError::HeaderMagic => -0x50,
            ValidationError::SegmentsSize => -0x51,
            ValidationError::SegmentsAlign => -0x52,
            ValidationError::ConstantsAlign => -0x53,
            ValidationError::StackSize => -0x60,
            ValidationError::StackDepth => -0x61,
            ValidationError::DataHeader => -0x70,
            ValidationError::DataSize => -0x71,
            ValidationError::Unknown => -0xFF,
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            ValidationError::StringHeader => "string header out of bounds",
            ValidationError::StringSize => "string size out of bounds",
            ValidationError::StringData => "string is not NUL-terminated",
            ValidationError::StringAlign => "string entry is not 4-byte aligned",
            ValidationError::DefHeader => "malformed def header",
            ValidationError::DefFlags => "invalid def flags",
            ValidationError::DefSize => "def extends past the defs segment",
            ValidationError::DefCyclic => "cyclic def reference",
            ValidationError::AccessViolation => "operand out of bounds",
            ValidationError::BadInstruction => "unknown opcode",
            ValidationError::CodeHeader => "code header out of bounds",
            ValidationError::CodeSize => "instructions extend past the code segment",
            ValidationError::HeaderMagic => "bad archive magic",
            ValidationError::SegmentsSize => "segment lengths do not match archive size",
            ValidationError::SegmentsAlign => "segment length is not 4-byte aligned",
            ValidationError::ConstantsAlign => "constants segment is not 8-byte aligned",
            ValidationError::StackSize => "stack too small for archive",
            ValidationError::StackDepth => "def nesting too deep",
            ValidationError::DataHeader => "malformed data segment header",
            ValidationError::DataSize => "data section out of bounds",
            ValidationError::Unknown => "unknown validation failure",
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for LmntError {
    fn from(err: ValidationError) -> Self {
        LmntError::InvalidArchive(err)
    }
}
