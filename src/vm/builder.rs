//! Archive builder.
//!
//! Produces archives in the layout read by [`Archive`](super::archive::Archive):
//! strings are padded so each entry stays 4-byte aligned, def records are
//! padded to a multiple of 4 bytes, and the code segment is padded so that
//! the constants segment starts on an 8-byte boundary.

use std::collections::HashMap;

use super::archive::{def_flags, Def, HEADER_SIZE, MAGIC};
use super::opcodes::Instruction;
use super::verifier::has_backbranches;

/// A def record as the builder sees it.
#[derive(Debug, Clone, Default)]
pub struct DefRecord {
    pub name: String,
    pub flags: u16,
    pub code: u32,
    pub stack_count: u16,
    pub base_args_count: u16,
    pub args_count: u16,
    pub rvals_count: u16,
    pub bases: Vec<u32>,
}

#[derive(Debug, Default)]
pub struct ArchiveBuilder {
    version: (u8, u8),
    strings: Vec<u8>,
    string_offsets: HashMap<String, u16>,
    defs: Vec<u8>,
    code: Vec<u8>,
    code_blocks: HashMap<u32, Vec<Instruction>>,
    data_sections: Vec<Vec<f32>>,
    constants: Vec<f32>,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&mut self, major: u8, minor: u8) -> &mut Self {
        self.version = (major, minor);
        self
    }

    /// Intern a string, returning its offset in the strings segment.
    pub fn string(&mut self, s: &str) -> u16 {
        if let Some(&offset) = self.string_offsets.get(s) {
            return offset;
        }
        let offset = self.strings.len() as u16;
        // size covers the bytes, the NUL and the padding
        let mut size = s.len() + 1;
        while (2 + size) % 4 != 0 {
            size += 1;
        }
        self.strings.extend_from_slice(&(size as u16).to_le_bytes());
        self.strings.extend_from_slice(s.as_bytes());
        self.strings.resize(self.strings.len() + size - s.len(), 0);
        self.string_offsets.insert(s.to_string(), offset);
        offset
    }

    /// Append a code block, returning its offset in the code segment.
    pub fn code(&mut self, instructions: &[Instruction]) -> u32 {
        let offset = self.code.len() as u32;
        self.code.extend_from_slice(&(instructions.len() as u32).to_le_bytes());
        for ins in instructions {
            self.code.extend_from_slice(&ins.to_bytes());
        }
        self.code_blocks.insert(offset, instructions.to_vec());
        offset
    }

    /// Offset the next def will be written at.
    pub fn next_def_offset(&self) -> u32 {
        self.defs.len() as u32
    }

    /// Append a def record, deriving `HAS_BACKBRANCHES` from its code block.
    pub fn add_def(&mut self, mut rec: DefRecord) -> u32 {
        if rec.flags & (def_flags::EXTERN | def_flags::INTERFACE) == 0 {
            rec.flags &= !def_flags::HAS_BACKBRANCHES;
            if self.code_blocks.get(&rec.code).is_some_and(|c| has_backbranches(c)) {
                rec.flags |= def_flags::HAS_BACKBRANCHES;
            }
        }
        self.add_def_raw(rec)
    }

    /// Append a def record exactly as given.
    pub fn add_def_raw(&mut self, rec: DefRecord) -> u32 {
        let offset = self.defs.len() as u32;
        let name = self.string(&rec.name);
        let bases_count = rec.bases.len() as u8;
        let length = Def::min_length(bases_count).div_ceil(4) * 4;

        let d = &mut self.defs;
        d.extend_from_slice(&(length as u16).to_le_bytes());
        d.extend_from_slice(&name.to_le_bytes());
        d.extend_from_slice(&rec.flags.to_le_bytes());
        d.extend_from_slice(&rec.code.to_le_bytes());
        d.extend_from_slice(&rec.stack_count.to_le_bytes());
        d.extend_from_slice(&rec.stack_count.div_ceil(4).saturating_mul(4).to_le_bytes());
        d.extend_from_slice(&rec.base_args_count.to_le_bytes());
        d.extend_from_slice(&rec.args_count.to_le_bytes());
        d.extend_from_slice(&rec.rvals_count.to_le_bytes());
        d.push(bases_count);
        for base in &rec.bases {
            d.extend_from_slice(&base.to_le_bytes());
        }
        d.resize(offset as usize + length, 0);
        offset
    }

    /// A locally coded def.
    pub fn def(&mut self, name: &str, flags: u16, code: u32, stack_count: u16, args_count: u16, rvals_count: u16) -> u32 {
        self.add_def(DefRecord {
            name: name.to_string(),
            flags,
            code,
            stack_count,
            args_count,
            rvals_count,
            ..Default::default()
        })
    }

    /// An extern def, bound to an extcall of the same name at prepare time.
    pub fn extern_def(&mut self, name: &str, args_count: u16, rvals_count: u16) -> u32 {
        self.add_def(DefRecord {
            name: name.to_string(),
            flags: def_flags::EXTERN,
            stack_count: args_count + rvals_count,
            args_count,
            rvals_count,
            ..Default::default()
        })
    }

    /// An interface def: a signature with no body.
    pub fn interface_def(&mut self, name: &str, args_count: u16, rvals_count: u16) -> u32 {
        self.add_def(DefRecord {
            name: name.to_string(),
            flags: def_flags::INTERFACE,
            stack_count: args_count + rvals_count,
            args_count,
            rvals_count,
            ..Default::default()
        })
    }

    /// Append a data section, returning its index.
    pub fn data_section(&mut self, values: &[f32]) -> u16 {
        self.data_sections.push(values.to_vec());
        (self.data_sections.len() - 1) as u16
    }

    /// Append constants, returning the stack index of the first one.
    pub fn constants(&mut self, values: &[f32]) -> u16 {
        let first = self.constants.len() as u16;
        self.constants.extend_from_slice(values);
        first
    }

    fn data_segment(&self) -> Vec<u8> {
        if self.data_sections.is_empty() {
            return Vec::new();
        }
        let count = self.data_sections.len();
        let mut out = Vec::new();
        out.extend_from_slice(&(count as u32).to_le_bytes());
        let mut offset = 4 + count * 8;
        for sec in &self.data_sections {
            out.extend_from_slice(&(offset as u32).to_le_bytes());
            out.extend_from_slice(&(sec.len() as u32).to_le_bytes());
            offset += sec.len() * 4;
        }
        for sec in &self.data_sections {
            for v in sec {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        out
    }

    pub fn build(&self) -> Vec<u8> {
        let data = self.data_segment();
        let mut code = self.code.clone();
        let before_constants = HEADER_SIZE + self.strings.len() + self.defs.len() + code.len() + data.len();
        if before_constants % 8 != 0 {
            code.resize(code.len() + 8 - before_constants % 8, 0);
        }

        let mut out = Vec::with_capacity(before_constants + 8 + self.constants.len() * 4);
        out.extend_from_slice(MAGIC);
        out.push(self.version.0);
        out.push(self.version.1);
        out.extend_from_slice(&[0, 0]);
        for len in [self.strings.len(), self.defs.len(), code.len(), data.len(), self.constants.len() * 4] {
            out.extend_from_slice(&(len as u32).to_le_bytes());
        }
        out.extend_from_slice(&self.strings);
        out.extend_from_slice(&self.defs);
        out.extend_from_slice(&code);
        out.extend_from_slice(&data);
        for c in &self.constants {
            out.extend_from_slice(&c.to_le_bytes());
        }
        out
    }
}

/// Build a single-def archive.
pub fn create_archive(
    def_name: &str,
    args_count: u16,
    rvals_count: u16,
    stack_count: u16,
    constants: &[f32],
    instructions: &[Instruction],
) -> Vec<u8> {
    let mut b = ArchiveBuilder::new();
    b.constants(constants);
    let code = b.code(instructions);
    b.def(def_name, def_flags::NONE, code, stack_count, args_count, rvals_count);
    b.build()
}
