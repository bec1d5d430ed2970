//! Archive accessor.
//!
//! An archive is a flat little-endian byte buffer:
//!
//! ```text
//! "LMNT" major minor reserved[2]
//! strings_len defs_len code_len data_len constants_len   (u32 each)
//! [strings][defs][code][data][constants]
//! ```
//!
//! Everything past the header is only reachable through the getters once
//! the validator has marked the archive as validated. Before that the
//! getters fail with [`LmntError::UnpreparedArchive`].

use std::borrow::Cow;

use super::error::LmntError;
use super::extcall::ExtcallTable;
use super::opcodes::Instruction;

/// Archive magic bytes.
pub const MAGIC: &[u8; 4] = b"LMNT";

/// Size of the fixed archive header in bytes.
pub const HEADER_SIZE: usize = 28;

/// Def flag bits.
pub mod def_flags {
    pub const NONE: u16 = 0;
    pub const INTERFACE: u16 = 1 << 0;
    pub const EXTERN: u16 = 1 << 1;
    pub const LAMBDA: u16 = 1 << 2;
    pub const HAS_BACKBRANCHES: u16 = 1 << 3;
    pub const ALL: u16 = INTERFACE | EXTERN | LAMBDA | HAS_BACKBRANCHES;
}

/// Archive state bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArchiveFlags(u8);

impl ArchiveFlags {
    pub const VALIDATED: ArchiveFlags = ArchiveFlags(1 << 0);
    pub const USES_EXTCALLS: ArchiveFlags = ArchiveFlags(1 << 1);
    pub const INPLACE: ArchiveFlags = ArchiveFlags(1 << 2);

    pub fn contains(self, other: ArchiveFlags) -> bool {
        self.0 & other.0 == other.0
    }

    fn insert(&mut self, other: ArchiveFlags) {
        self.0 |= other.0;
    }

    fn remove(&mut self, other: ArchiveFlags) {
        self.0 &= !other.0;
    }
}

/// The fixed archive header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub version_major: u8,
    pub version_minor: u8,
    pub strings_length: u32,
    pub defs_length: u32,
    pub code_length: u32,
    pub data_length: u32,
    pub constants_length: u32,
}

impl ArchiveHeader {
    /// Parse the header, returning `None` if the buffer is too short or the
    /// magic does not match.
    pub fn parse(bytes: &[u8]) -> Option<ArchiveHeader> {
        if bytes.len() < HEADER_SIZE || &bytes[0..4] != MAGIC {
            return None;
        }
        let word = |off: usize| u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]]);
        Some(ArchiveHeader {
            version_major: bytes[4],
            version_minor: bytes[5],
            strings_length: word(8),
            defs_length: word(12),
            code_length: word(16),
            data_length: word(20),
            constants_length: word(24),
        })
    }

    pub fn strings_offset(&self) -> usize {
        HEADER_SIZE
    }

    pub fn defs_offset(&self) -> usize {
        self.strings_offset() + self.strings_length as usize
    }

    pub fn code_offset(&self) -> usize {
        self.defs_offset() + self.defs_length as usize
    }

    pub fn data_offset(&self) -> usize {
        self.code_offset() + self.code_length as usize
    }

    pub fn constants_offset(&self) -> usize {
        self.data_offset() + self.data_length as usize
    }

    /// Sum of all segment lengths, computed without overflow.
    pub fn segments_length(&self) -> u64 {
        self.strings_length as u64
            + self.defs_length as u64
            + self.code_length as u64
            + self.data_length as u64
            + self.constants_length as u64
    }

    pub fn constants_count(&self) -> usize {
        self.constants_length as usize / 4
    }
}

/// A def ("function") record.
///
/// `offset` is the def's byte offset within the defs segment and is the
/// identity used everywhere else (resume checks, EXTCALL operands, C ABI).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Def {
    pub offset: u32,
    pub length: u16,
    pub name: u16,
    pub flags: u16,
    pub code: u32,
    pub stack_count_unaligned: u16,
    pub stack_count_aligned: u16,
    pub base_args_count: u16,
    pub args_count: u16,
    pub rvals_count: u16,
    pub bases_count: u8,
}

impl Def {
    /// Size of the packed def header, without bases.
    pub const HEADER_SIZE: usize = 21;
    /// Byte offset of the `code` field within a def record.
    pub const CODE_FIELD: usize = 6;

    /// Minimum record length for a def with `bases_count` bases.
    pub fn min_length(bases_count: u8) -> usize {
        Self::HEADER_SIZE + bases_count as usize * 4
    }

    fn parse(bytes: &[u8], offset: u32) -> Option<Def> {
        let rec = bytes.get(..Self::HEADER_SIZE)?;
        let half = |i: usize| u16::from_le_bytes([rec[i], rec[i + 1]]);
        Some(Def {
            offset,
            length: half(0),
            name: half(2),
            flags: half(4),
            code: u32::from_le_bytes([rec[6], rec[7], rec[8], rec[9]]),
            stack_count_unaligned: half(10),
            stack_count_aligned: half(12),
            base_args_count: half(14),
            args_count: half(16),
            rvals_count: half(18),
            bases_count: rec[20],
        })
    }

    pub fn is_extern(&self) -> bool {
        self.flags & def_flags::EXTERN != 0
    }

    pub fn is_interface(&self) -> bool {
        self.flags & def_flags::INTERFACE != 0
    }

    pub fn is_lambda(&self) -> bool {
        self.flags & def_flags::LAMBDA != 0
    }

    pub fn has_backbranches(&self) -> bool {
        self.flags & def_flags::HAS_BACKBRANCHES != 0
    }

    /// Human readable kind, used by diagnostics.
    pub fn kind(&self) -> &'static str {
        if self.is_extern() {
            "extern"
        } else if self.is_interface() {
            "interface"
        } else {
            "function"
        }
    }
}

/// A validated instruction stream.
#[derive(Debug, Clone, Copy)]
pub struct Code<'b> {
    bytes: &'b [u8],
}

impl<'b> Code<'b> {
    pub(crate) fn new(bytes: &'b [u8]) -> Self {
        Code { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len() / Instruction::SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Instruction> {
        let start = index.checked_mul(Instruction::SIZE)?;
        self.bytes
            .get(start..start + Instruction::SIZE)
            .map(Instruction::read)
    }

    pub fn iter(&self) -> impl Iterator<Item = Instruction> + 'b {
        self.bytes.chunks_exact(Instruction::SIZE).map(Instruction::read)
    }

    pub fn to_vec(&self) -> Vec<Instruction> {
        self.iter().collect()
    }
}

/// A data section directory entry. `offset` is in bytes from the start of
/// the data segment, `count` in values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSection {
    pub offset: u32,
    pub count: u32,
}

/// An LMNT archive, either owned or borrowed from the embedder.
#[derive(Debug, Clone)]
pub struct Archive<'a> {
    data: Cow<'a, [u8]>,
    flags: ArchiveFlags,
}

impl Archive<'static> {
    /// An archive owning its bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Archive { data: Cow::Owned(data), flags: ArchiveFlags::default() }
    }
}

impl<'a> Archive<'a> {
    /// An archive that reads the embedder's bytes in place.
    pub fn inplace(data: &'a [u8]) -> Self {
        Archive { data: Cow::Borrowed(data), flags: ArchiveFlags::INPLACE }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn flags(&self) -> ArchiveFlags {
        self.flags
    }

    pub fn is_validated(&self) -> bool {
        self.flags.contains(ArchiveFlags::VALIDATED)
    }

    pub fn is_inplace(&self) -> bool {
        self.flags.contains(ArchiveFlags::INPLACE)
    }

    pub fn uses_extcalls(&self) -> bool {
        self.flags.contains(ArchiveFlags::USES_EXTCALLS)
    }

    pub(crate) fn mark_validated(&mut self) {
        self.flags.insert(ArchiveFlags::VALIDATED);
    }

    /// Parse the header without requiring validation.
    pub fn header(&self) -> Option<ArchiveHeader> {
        ArchiveHeader::parse(&self.data)
    }

    fn ensure_validated(&self) -> Result<ArchiveHeader, LmntError> {
        if !self.is_validated() {
            return Err(LmntError::UnpreparedArchive);
        }
        self.header().ok_or(LmntError::UnpreparedArchive)
    }

    // ==== Raw reads (used by the validator) ====

    pub(crate) fn read_u16(&self, offset: usize) -> Option<u16> {
        let b = self.data.get(offset..offset.checked_add(2)?)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn read_u32(&self, offset: usize) -> Option<u32> {
        let b = self.data.get(offset..offset.checked_add(4)?)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn read_f32(&self, offset: usize) -> Option<f32> {
        self.read_u32(offset).map(f32::from_bits)
    }

    /// Read a def record at `offset` within the defs segment, without
    /// checking that it fits the segment.
    pub(crate) fn raw_def(&self, hdr: &ArchiveHeader, offset: u32) -> Option<Def> {
        let start = hdr.defs_offset().checked_add(offset as usize)?;
        Def::parse(self.data.get(start..)?, offset)
    }

    pub(crate) fn raw_def_base(&self, hdr: &ArchiveHeader, def: &Def, index: u8) -> Option<u32> {
        let start = hdr.defs_offset() + def.offset as usize + Def::HEADER_SIZE + index as usize * 4;
        self.read_u32(start)
    }

    pub(crate) fn raw_data_sections_count(&self, hdr: &ArchiveHeader) -> u32 {
        if hdr.data_length == 0 {
            return 0;
        }
        self.read_u32(hdr.data_offset()).unwrap_or(0)
    }

    pub(crate) fn raw_data_section(&self, hdr: &ArchiveHeader, index: u32) -> Option<DataSection> {
        let start = hdr.data_offset() + 4 + index as usize * 8;
        Some(DataSection { offset: self.read_u32(start)?, count: self.read_u32(start + 4)? })
    }

    fn string_bytes(&self, hdr: &ArchiveHeader, offset: u16) -> Option<&[u8]> {
        let start = hdr.strings_offset() + offset as usize;
        let size = self.read_u16(start)? as usize;
        let body = self.data.get(start + 2..start + 2 + size)?;
        let nul = body.iter().position(|&b| b == 0).unwrap_or(body.len());
        Some(&body[..nul])
    }

    // ==== Validated getters ====

    pub fn get_header(&self) -> Result<ArchiveHeader, LmntError> {
        self.ensure_validated()
    }

    /// Name bytes of the string at `offset`, without the trailing NUL.
    pub fn get_string_bytes(&self, offset: u16) -> Result<&[u8], LmntError> {
        let hdr = self.ensure_validated()?;
        if offset as u32 + 2 >= hdr.strings_length {
            return Err(LmntError::AccessViolation);
        }
        self.string_bytes(&hdr, offset).ok_or(LmntError::AccessViolation)
    }

    pub fn get_string(&self, offset: u16) -> Result<Cow<'_, str>, LmntError> {
        self.get_string_bytes(offset).map(String::from_utf8_lossy)
    }

    pub fn get_def(&self, offset: u32) -> Result<Def, LmntError> {
        let hdr = self.ensure_validated()?;
        if offset as u64 + Def::HEADER_SIZE as u64 > hdr.defs_length as u64 {
            return Err(LmntError::AccessViolation);
        }
        self.raw_def(&hdr, offset).ok_or(LmntError::AccessViolation)
    }

    /// Base def offsets of `def`.
    pub fn get_def_bases(&self, def: &Def) -> Result<Vec<u32>, LmntError> {
        let hdr = self.ensure_validated()?;
        (0..def.bases_count)
            .map(|i| self.raw_def_base(&hdr, def, i).ok_or(LmntError::AccessViolation))
            .collect()
    }

    /// All defs in archive order.
    pub fn defs(&self) -> Result<Vec<Def>, LmntError> {
        let hdr = self.ensure_validated()?;
        let mut defs = Vec::new();
        let mut pos = 0u32;
        while pos < hdr.defs_length {
            let def = self.raw_def(&hdr, pos).ok_or(LmntError::AccessViolation)?;
            if def.length == 0 {
                return Err(LmntError::Internal);
            }
            pos += def.length as u32;
            defs.push(def);
        }
        Ok(defs)
    }

    /// Linear scan for a def by name.
    pub fn find_def(&self, name: &str) -> Result<Def, LmntError> {
        let hdr = self.ensure_validated()?;
        let mut pos = 0u32;
        while pos < hdr.defs_length {
            let def = self.raw_def(&hdr, pos).ok_or(LmntError::AccessViolation)?;
            if self.string_bytes(&hdr, def.name) == Some(name.as_bytes()) {
                return Ok(def);
            }
            if def.length == 0 {
                break;
            }
            pos += def.length as u32;
        }
        Err(LmntError::NotFound)
    }

    /// Instruction stream of the code block at `offset` within the code segment.
    pub fn get_code(&self, offset: u32) -> Result<Code<'_>, LmntError> {
        let hdr = self.ensure_validated()?;
        let start = hdr.code_offset() + offset as usize;
        let count = self.read_u32(start).ok_or(LmntError::AccessViolation)? as usize;
        let body = start + 4;
        let end = body + count * Instruction::SIZE;
        if end > hdr.data_offset() {
            return Err(LmntError::AccessViolation);
        }
        Ok(Code::new(&self.data[body..end]))
    }

    /// Instruction stream of a non-extern def.
    pub fn get_def_code(&self, def: &Def) -> Result<Code<'_>, LmntError> {
        if def.is_extern() || def.is_interface() {
            return Err(LmntError::NotFound);
        }
        self.get_code(def.code)
    }

    pub fn get_constants_count(&self) -> Result<usize, LmntError> {
        Ok(self.ensure_validated()?.constants_count())
    }

    pub fn get_constant(&self, index: usize) -> Result<f32, LmntError> {
        let hdr = self.ensure_validated()?;
        if index >= hdr.constants_count() {
            return Err(LmntError::AccessViolation);
        }
        self.read_f32(hdr.constants_offset() + index * 4).ok_or(LmntError::AccessViolation)
    }

    pub fn get_constants(&self) -> Result<Vec<f32>, LmntError> {
        let hdr = self.ensure_validated()?;
        let start = hdr.constants_offset();
        let end = start + hdr.constants_length as usize;
        let bytes = self.data.get(start..end).ok_or(LmntError::AccessViolation)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn get_data_sections_count(&self) -> Result<u32, LmntError> {
        let hdr = self.ensure_validated()?;
        Ok(self.raw_data_sections_count(&hdr))
    }

    pub fn get_data_section(&self, index: u32) -> Result<DataSection, LmntError> {
        let hdr = self.ensure_validated()?;
        if index >= self.raw_data_sections_count(&hdr) {
            return Err(LmntError::AccessViolation);
        }
        self.raw_data_section(&hdr, index).ok_or(LmntError::AccessViolation)
    }

    /// One value of a data section.
    pub fn get_data_value(&self, section: &DataSection, index: u32) -> Result<f32, LmntError> {
        let hdr = self.ensure_validated()?;
        if index >= section.count {
            return Err(LmntError::AccessViolation);
        }
        let offset = hdr.data_offset() + section.offset as usize + index as usize * 4;
        self.read_f32(offset).ok_or(LmntError::AccessViolation)
    }

    /// All values of a data section.
    pub fn get_data_block(&self, section: &DataSection) -> Result<Vec<f32>, LmntError> {
        (0..section.count).map(|i| self.get_data_value(section, i)).collect()
    }

    /// Rewrite the `code` field of every non-interface extern def to the
    /// index of its extcall in `table`.
    pub fn update_def_extcalls(&mut self, table: &ExtcallTable) -> Result<(), LmntError> {
        let hdr = self.ensure_validated()?;
        self.flags.remove(ArchiveFlags::USES_EXTCALLS);

        let mut patches = Vec::new();
        let mut pos = 0u32;
        while pos < hdr.defs_length {
            let def = self.raw_def(&hdr, pos).ok_or(LmntError::AccessViolation)?;
            if def.is_extern() && !def.is_interface() {
                let name = self.string_bytes(&hdr, def.name).ok_or(LmntError::AccessViolation)?;
                let name = String::from_utf8_lossy(name);
                let index = table
                    .find_index(&name, def.args_count, def.rvals_count)
                    .map_err(|_| LmntError::MissingExtcall)?;
                patches.push((hdr.defs_offset() + pos as usize + Def::CODE_FIELD, index as u32));
            }
            if def.length == 0 {
                break;
            }
            pos += def.length as u32;
        }

        if patches.is_empty() {
            return Ok(());
        }
        // An in-place archive is the embedder's memory and is never written.
        let Cow::Owned(bytes) = &mut self.data else {
            return Err(LmntError::AccessViolation);
        };
        for (field, index) in patches {
            bytes[field..field + 4].copy_from_slice(&index.to_le_bytes());
        }
        self.flags.insert(ArchiveFlags::USES_EXTCALLS);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::builder::ArchiveBuilder;
    use crate::vm::opcodes::{Instruction, Opcode};
    use crate::vm::verifier::validate;

    fn sample() -> Vec<u8> {
        let mut b = ArchiveBuilder::new();
        b.constants(&[1.5, 2.5]);
        let code = b.code(&[
            Instruction::new(Opcode::AddSS, 0, 1, 2),
            Instruction::new(Opcode::Return, 0, 0, 0),
        ]);
        b.def("first", 0, code, 1, 0, 1);
        let code = b.code(&[Instruction::new(Opcode::Return, 0, 0, 0)]);
        b.def("second", 0, code, 2, 1, 1);
        b.data_section(&[7.0, 8.0, 9.0]);
        b.build()
    }

    #[test]
    fn test_getters_require_validation() {
        let archive = Archive::new(sample());
        assert_eq!(archive.find_def("first"), Err(LmntError::UnpreparedArchive));
        assert_eq!(archive.get_constant(0), Err(LmntError::UnpreparedArchive));
        assert_eq!(archive.get_data_sections_count(), Err(LmntError::UnpreparedArchive));
    }

    #[test]
    fn test_header_offsets() {
        let archive = Archive::new(sample());
        let hdr = archive.header().unwrap();
        assert_eq!(hdr.strings_offset(), HEADER_SIZE);
        assert_eq!(hdr.constants_offset() % 8, 0);
        assert_eq!(hdr.constants_offset() + hdr.constants_length as usize, archive.len());
    }

    #[test]
    fn test_find_def_and_code() {
        let mut archive = Archive::new(sample());
        validate(&mut archive, 4096).unwrap();

        let first = archive.find_def("first").unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(first.stack_count_unaligned, 1);
        let code = archive.get_def_code(&first).unwrap();
        assert_eq!(code.len(), 2);
        assert_eq!(code.get(0).unwrap().op(), Some(Opcode::AddSS));
        assert!(code.get(2).is_none());

        let second = archive.find_def("second").unwrap();
        assert_eq!(second.offset, first.length as u32);
        assert_eq!(second.args_count, 1);
        assert_eq!(archive.get_string(second.name).unwrap(), "second");

        assert_eq!(archive.find_def("third"), Err(LmntError::NotFound));
        assert_eq!(archive.defs().unwrap().len(), 2);
    }

    #[test]
    fn test_constants_and_data() {
        let mut archive = Archive::new(sample());
        validate(&mut archive, 4096).unwrap();
        assert_eq!(archive.get_constants().unwrap(), vec![1.5, 2.5]);
        assert_eq!(archive.get_constant(1).unwrap(), 2.5);
        assert_eq!(archive.get_constant(2), Err(LmntError::AccessViolation));

        assert_eq!(archive.get_data_sections_count().unwrap(), 1);
        let sec = archive.get_data_section(0).unwrap();
        assert_eq!(sec.count, 3);
        assert_eq!(archive.get_data_block(&sec).unwrap(), vec![7.0, 8.0, 9.0]);
        assert_eq!(archive.get_data_section(1), Err(LmntError::AccessViolation));
    }
}
