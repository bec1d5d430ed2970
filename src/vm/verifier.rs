//! Archive validator.
//!
//! Proves, once, that every instruction in every def can only touch stack
//! slots in `[0, constants_count + rw_stack_count)`, only branch within
//! `[0, instructions_count]`, and that def references form no cycles.
//! After this the interpreter and the JIT run without operand checks,
//! except for the runtime-indexed opcodes which check their index.
//!
//! Each `validate_*` step returns the number of bytes it consumed so the
//! top-level walk can advance its cursor.

use super::archive::{def_flags, Archive, ArchiveHeader, Code, Def, HEADER_SIZE};
use super::error::ValidationError;
use super::opcodes::{combine, Instruction, Opcode};

/// Maximum nesting of def references (EXTCALL targets and bases).
pub const DEFSTACK_LIMIT: usize = 16;

type VResult<T> = Result<T, ValidationError>;

/// Validate `archive` for a context with `memory_size` bytes of memory.
///
/// On success the archive is marked validated and the total stack count
/// (constants plus writable slots) is returned.
pub fn validate(archive: &mut Archive<'_>, memory_size: usize) -> VResult<usize> {
    let total = Validator::new(archive, memory_size)?.run()?;
    archive.mark_validated();
    Ok(total)
}

/// Whether any branch targets an earlier instruction.
pub fn has_backbranches(instructions: &[Instruction]) -> bool {
    instructions
        .iter()
        .enumerate()
        .any(|(i, ins)| ins.op().is_some_and(|op| op.is_branch()) && (ins.branch_target() as usize) < i)
}

struct Validator<'v, 'a> {
    archive: &'v Archive<'a>,
    hdr: ArchiveHeader,
    total_stack_count: usize,
    constants_count: usize,
    rw_stack_count: usize,
    data_sections_count: u32,
}

impl<'v, 'a> Validator<'v, 'a> {
    fn new(archive: &'v Archive<'a>, memory_size: usize) -> VResult<Self> {
        let hdr = archive.header().ok_or(ValidationError::HeaderMagic)?;

        if archive.len() as u64 != HEADER_SIZE as u64 + hdr.segments_length() {
            return Err(ValidationError::SegmentsSize);
        }
        let lengths = hdr.strings_length | hdr.defs_length | hdr.code_length | hdr.data_length | hdr.constants_length;
        if lengths & 0x03 != 0 {
            return Err(ValidationError::SegmentsAlign);
        }
        if hdr.constants_length > 0 && hdr.constants_offset() % 8 != 0 {
            return Err(ValidationError::ConstantsAlign);
        }

        // A copied archive shares the memory budget with the stack that
        // follows its constants; an in-place one leaves all of it to the stack.
        let stack_base = if archive.is_inplace() { 0 } else { hdr.constants_offset() };
        let total_stack_count = memory_size.checked_sub(stack_base).ok_or(ValidationError::StackSize)? / 4;
        let constants_count = hdr.constants_count();
        let rw_stack_count = total_stack_count
            .checked_sub(constants_count)
            .ok_or(ValidationError::StackSize)?;

        Ok(Validator {
            archive,
            hdr,
            total_stack_count,
            constants_count,
            rw_stack_count,
            data_sections_count: 0,
        })
    }

    fn run(mut self) -> VResult<usize> {
        let mut index = 0u32;
        while index < self.hdr.strings_length {
            index += self.validate_string(index)?;
        }

        self.validate_data()?;

        let mut index = 0u32;
        let mut defstack = Vec::with_capacity(DEFSTACK_LIMIT);
        while index < self.hdr.defs_length {
            index += self.validate_def(index, self.rw_stack_count, &mut defstack)?;
        }
        Ok(self.total_stack_count)
    }

    fn validate_string(&self, index: u32) -> VResult<u32> {
        let strings_length = self.hdr.strings_length as u64;
        if index as u64 + 2 > strings_length {
            return Err(ValidationError::StringHeader);
        }
        let start = self.hdr.strings_offset() + index as usize;
        let size = self.archive.read_u16(start).ok_or(ValidationError::StringHeader)? as u32;
        if size == 0 || size as u64 > strings_length - (index as u64 + 2) {
            return Err(ValidationError::StringSize);
        }
        if (2 + size) % 4 != 0 {
            return Err(ValidationError::StringAlign);
        }
        let last = self.archive.bytes().get(start + 2 + size as usize - 1);
        if last != Some(&0) {
            return Err(ValidationError::StringData);
        }
        Ok(2 + size)
    }

    fn validate_data(&mut self) -> VResult<()> {
        if self.hdr.data_length == 0 {
            return Ok(());
        }
        let data_length = self.hdr.data_length as u64;
        let count = self.archive.raw_data_sections_count(&self.hdr);
        let directory_end = 4 + count as u64 * 8;
        if directory_end > data_length {
            return Err(ValidationError::DataHeader);
        }
        for s in 0..count {
            let sec = self.archive.raw_data_section(&self.hdr, s).ok_or(ValidationError::DataHeader)?;
            if (sec.offset as u64) < directory_end || sec.offset % 4 != 0 {
                return Err(ValidationError::DataHeader);
            }
            if sec.offset as u64 + sec.count as u64 * 4 > data_length {
                return Err(ValidationError::DataSize);
            }
        }
        self.data_sections_count = count;
        Ok(())
    }

    fn validate_def(&self, index: u32, rw_stack_count: usize, defstack: &mut Vec<u32>) -> VResult<u32> {
        if defstack.len() >= DEFSTACK_LIMIT {
            return Err(ValidationError::StackDepth);
        }
        if defstack.contains(&index) {
            return Err(ValidationError::DefCyclic);
        }

        let defs_length = self.hdr.defs_length as u64;
        if index as u64 + Def::HEADER_SIZE as u64 > defs_length {
            return Err(ValidationError::DefSize);
        }
        let def = self.archive.raw_def(&self.hdr, index).ok_or(ValidationError::DefSize)?;
        if (def.length as usize) < Def::min_length(def.bases_count) {
            return Err(ValidationError::DefHeader);
        }
        if index as u64 + def.length as u64 > defs_length {
            return Err(ValidationError::DefSize);
        }
        if def.flags & !def_flags::ALL != 0 {
            return Err(ValidationError::DefFlags);
        }

        self.validate_string(def.name as u32)?;

        if def.stack_count_unaligned as usize > rw_stack_count {
            return Err(ValidationError::StackSize);
        }

        defstack.push(index);
        let result = self.validate_def_body(&def, defstack);
        defstack.pop();
        result?;

        Ok(def.length as u32)
    }

    fn validate_def_body(&self, def: &Def, defstack: &mut Vec<u32>) -> VResult<()> {
        let no_body = def.flags & (def_flags::EXTERN | def_flags::INTERFACE) != 0;
        if no_body {
            if def.stack_count_unaligned as u32 != def.args_count as u32 + def.rvals_count as u32 {
                return Err(ValidationError::DefHeader);
            }
        } else {
            self.validate_code(def, def.stack_count_unaligned as usize, defstack)?;
        }

        for i in 0..def.bases_count {
            let base = self.archive.raw_def_base(&self.hdr, def, i).ok_or(ValidationError::DefSize)?;
            self.validate_def(base, self.rw_stack_count, defstack)?;
        }
        Ok(())
    }

    fn validate_code(&self, def: &Def, rw_stack_count: usize, defstack: &mut Vec<u32>) -> VResult<u32> {
        let code_length = self.hdr.code_length as u64;
        if def.code as u64 + 4 > code_length {
            return Err(ValidationError::CodeHeader);
        }
        let start = self.hdr.code_offset() + def.code as usize;
        let count = self.archive.read_u32(start).ok_or(ValidationError::CodeHeader)?;
        let size = 4 + count as u64 * Instruction::SIZE as u64;
        if def.code as u64 + size > code_length {
            return Err(ValidationError::CodeSize);
        }
        let body = &self.archive.bytes()[start + 4..start + size as usize];
        let code = Code::new(body);

        for ins in code.iter() {
            self.validate_instruction(count, &ins, rw_stack_count, defstack)?;
        }

        let mut backbranches = false;
        for (i, ins) in code.iter().enumerate() {
            if ins.op().is_some_and(|op| op.is_branch()) {
                let target = ins.branch_target() as usize;
                if target == i {
                    return Err(ValidationError::DefCyclic);
                }
                backbranches |= target < i;
            }
        }
        if backbranches != def.has_backbranches() {
            return Err(ValidationError::DefFlags);
        }

        Ok(size as u32)
    }

    // ==== Operand checks ====

    fn stack(&self, arg: u16, count: usize, rw_stack_count: usize) -> VResult<()> {
        if arg as usize + count <= self.constants_count + rw_stack_count {
            Ok(())
        } else {
            Err(ValidationError::AccessViolation)
        }
    }

    fn data_section(&self, index: u16) -> VResult<()> {
        if (index as u32) < self.data_sections_count {
            Ok(())
        } else {
            Err(ValidationError::AccessViolation)
        }
    }

    fn data_imm(&self, index: u16, offset: u16, width: u32) -> VResult<()> {
        self.data_section(index)?;
        let sec = self
            .archive
            .raw_data_section(&self.hdr, index as u32)
            .ok_or(ValidationError::AccessViolation)?;
        if offset as u32 + width <= sec.count {
            Ok(())
        } else {
            Err(ValidationError::AccessViolation)
        }
    }

    fn code_ptr(&self, instructions_count: u32, lo: u16, hi: u16) -> VResult<()> {
        // one past the end means "branch to return"
        if combine(lo, hi) <= instructions_count {
            Ok(())
        } else {
            Err(ValidationError::AccessViolation)
        }
    }

    fn def_ptr(&self, lo: u16, hi: u16, stack: u16, rw_stack_count: usize, defstack: &mut Vec<u32>) -> VResult<()> {
        let target_offset = combine(lo, hi);
        self.validate_def(target_offset, rw_stack_count, defstack)?;
        let target = self
            .archive
            .raw_def(&self.hdr, target_offset)
            .ok_or(ValidationError::DefSize)?;
        if target.is_interface() || !target.is_extern() {
            return Err(ValidationError::DefFlags);
        }
        self.stack(stack, target.args_count as usize, rw_stack_count)?;
        self.stack(stack.saturating_add(target.args_count), target.rvals_count as usize, rw_stack_count)?;
        if stack as usize + target.args_count as usize + target.rvals_count as usize
            > self.constants_count + rw_stack_count
        {
            return Err(ValidationError::AccessViolation);
        }
        Ok(())
    }

    fn validate_instruction(
        &self,
        instructions_count: u32,
        ins: &Instruction,
        rw: usize,
        defstack: &mut Vec<u32>,
    ) -> VResult<()> {
        use Opcode::*;

        let op = ins.op().ok_or(ValidationError::BadInstruction)?;
        let (a1, a2, a3) = (ins.arg1, ins.arg2, ins.arg3);
        match op {
            Noop | Return => Ok(()),
            AssignSS => {
                self.stack(a1, 1, rw)?;
                self.stack(a3, 1, rw)
            }
            AssignVV => {
                self.stack(a1, 4, rw)?;
                self.stack(a3, 4, rw)
            }
            AssignSV => {
                self.stack(a1, 1, rw)?;
                self.stack(a3, 4, rw)
            }
            AssignIIS | AssignIBS => self.stack(a3, 1, rw),
            AssignIIV | AssignIBV => self.stack(a3, 4, rw),
            DloadIIS => {
                self.data_imm(a1, a2, 1)?;
                self.stack(a3, 1, rw)
            }
            DloadIIV => {
                self.data_imm(a1, a2, 4)?;
                self.stack(a3, 4, rw)
            }
            DloadIRS => {
                self.data_section(a1)?;
                self.stack(a2, 1, rw)?;
                self.stack(a3, 1, rw)
            }
            DloadIRV => {
                self.data_section(a1)?;
                self.stack(a2, 1, rw)?;
                self.stack(a3, 4, rw)
            }
            DsecLen => {
                self.data_section(a1)?;
                self.stack(a3, 1, rw)
            }
            AddSS | SubSS | MulSS | DivSS | ModSS | PowSS | Log | MinSS | MaxSS | Atan2 => {
                self.stack(a1, 1, rw)?;
                self.stack(a2, 1, rw)?;
                self.stack(a3, 1, rw)
            }
            AddVV | SubVV | MulVV | DivVV | ModVV | PowVV | MinVV | MaxVV => {
                self.stack(a1, 4, rw)?;
                self.stack(a2, 4, rw)?;
                self.stack(a3, 4, rw)
            }
            PowVS | MinVS | MaxVS => {
                self.stack(a1, 4, rw)?;
                self.stack(a2, 1, rw)?;
                self.stack(a3, 4, rw)
            }
            Sin | Cos | Tan | Asin | Acos | Atan | SqrtS | Ln | Log2 | Log10 | AbsS | FloorS | RoundS
            | CeilS | TruncS => {
                self.stack(a1, 1, rw)?;
                self.stack(a3, 1, rw)
            }
            SinCos => {
                self.stack(a1, 1, rw)?;
                self.stack(a2, 1, rw)?;
                self.stack(a3, 1, rw)
            }
            SqrtV | AbsV | FloorV | RoundV | CeilV | TruncV => {
                self.stack(a1, 4, rw)?;
                self.stack(a3, 4, rw)
            }
            SumV => {
                self.stack(a1, 4, rw)?;
                self.stack(a3, 1, rw)
            }
            IndexRIS => {
                // the indexed source is checked at runtime
                self.stack(a1, 1, rw)?;
                self.stack(a3, 1, rw)
            }
            IndexRIR => {
                self.stack(a1, 1, rw)?;
                self.stack(a3, 1, rw)
            }
            Cmp => {
                self.stack(a1, 1, rw)?;
                self.stack(a2, 1, rw)
            }
            CmpZ => self.stack(a1, 1, rw),
            BranchZ | BranchNZ | BranchPos | BranchNeg | BranchUn => {
                self.stack(a1, 1, rw)?;
                self.code_ptr(instructions_count, a2, a3)
            }
            Branch | BranchCEQ | BranchCNE | BranchCLT | BranchCLE | BranchCGT | BranchCGE | BranchCUN => {
                self.code_ptr(instructions_count, a2, a3)
            }
            AssignCEQ | AssignCNE | AssignCLT | AssignCLE | AssignCGT | AssignCGE | AssignCUN => {
                self.stack(a3, 1, rw)
            }
            Extcall => self.def_ptr(a1, a2, a3, rw, defstack),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::builder::{create_archive, ArchiveBuilder, DefRecord};

    fn ret() -> Instruction {
        Instruction::new(Opcode::Return, 0, 0, 0)
    }

    fn check(bytes: Vec<u8>) -> VResult<usize> {
        let mut archive = Archive::new(bytes);
        validate(&mut archive, 4096)
    }

    fn simple() -> Vec<u8> {
        create_archive("test", 2, 1, 3, &[], &[Instruction::new(Opcode::AddSS, 0, 1, 2), ret()])
    }

    #[test]
    fn test_valid_archive() {
        let bytes = simple();
        let hdr = ArchiveHeader::parse(&bytes).unwrap();
        let total = check(bytes).unwrap();
        assert_eq!(total, (4096 - hdr.constants_offset()) / 4);
    }

    #[test]
    fn test_inplace_stack_count() {
        let bytes = simple();
        let mut archive = Archive::inplace(&bytes);
        assert_eq!(validate(&mut archive, 4096), Ok(1024));
        assert!(archive.is_validated());
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = simple();
        bytes[0] = b'X';
        assert_eq!(check(bytes), Err(ValidationError::HeaderMagic));
        assert_eq!(check(vec![b'L', b'M', b'N', b'T']), Err(ValidationError::HeaderMagic));
    }

    #[test]
    fn test_segments_size() {
        let mut bytes = simple();
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(check(bytes), Err(ValidationError::SegmentsSize));
    }

    #[test]
    fn test_segments_align() {
        let mut bytes = simple();
        // move two bytes from the code segment to the data segment
        let code_len = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
        bytes[16..20].copy_from_slice(&(code_len - 2).to_le_bytes());
        bytes[20..24].copy_from_slice(&2u32.to_le_bytes());
        assert_eq!(check(bytes), Err(ValidationError::SegmentsAlign));
    }

    #[test]
    fn test_constants_align() {
        let mut bytes = create_archive("test", 2, 1, 3, &[1.0, 2.0], &[Instruction::new(Opcode::AddSS, 0, 1, 2), ret()]);
        let hdr = ArchiveHeader::parse(&bytes).unwrap();
        let at = hdr.data_offset();
        bytes.splice(at..at, [0u8; 4]);
        bytes[16..20].copy_from_slice(&(hdr.code_length + 4).to_le_bytes());
        assert_eq!(check(bytes), Err(ValidationError::ConstantsAlign));
    }

    #[test]
    fn test_string_missing_nul() {
        let mut bytes = simple();
        // "test" is stored as size=6, "test\0\0"
        bytes[HEADER_SIZE + 2 + 5] = b'x';
        assert_eq!(check(bytes), Err(ValidationError::StringData));
    }

    #[test]
    fn test_string_zero_size() {
        let mut bytes = simple();
        bytes[HEADER_SIZE] = 0;
        assert_eq!(check(bytes), Err(ValidationError::StringSize));
    }

    #[test]
    fn test_cyclic_bases() {
        let mut b = ArchiveBuilder::new();
        let a = b.add_def(DefRecord { name: "a".into(), flags: def_flags::INTERFACE, bases: vec![28], ..Default::default() });
        assert_eq!(a, 0);
        assert_eq!(b.next_def_offset(), 28);
        b.add_def(DefRecord { name: "b".into(), flags: def_flags::INTERFACE, bases: vec![0], ..Default::default() });
        assert_eq!(check(b.build()), Err(ValidationError::DefCyclic));
    }

    #[test]
    fn test_def_depth_limit() {
        let mut b = ArchiveBuilder::new();
        for i in 0..=DEFSTACK_LIMIT as u32 {
            let bases = if i < DEFSTACK_LIMIT as u32 { vec![(i + 1) * 28] } else { vec![] };
            b.add_def(DefRecord { name: format!("d{}", i), flags: def_flags::INTERFACE, bases, ..Default::default() });
        }
        assert_eq!(check(b.build()), Err(ValidationError::StackDepth));
    }

    #[test]
    fn test_branch_out_of_range() {
        let bytes = create_archive("test", 0, 0, 1, &[], &[Instruction::new(Opcode::Branch, 0, 5, 0)]);
        assert_eq!(check(bytes), Err(ValidationError::AccessViolation));
        // one past the end is a return
        let bytes = create_archive("test", 0, 0, 1, &[], &[Instruction::new(Opcode::Branch, 0, 1, 0)]);
        assert!(check(bytes).is_ok());
    }

    #[test]
    fn test_branch_to_self() {
        let mut b = ArchiveBuilder::new();
        let code = b.code(&[Instruction::new(Opcode::Branch, 0, 0, 0)]);
        b.def("spin", 0, code, 0, 0, 0);
        assert_eq!(check(b.build()), Err(ValidationError::DefCyclic));
    }

    #[test]
    fn test_backbranch_flag_must_match() {
        let mut b = ArchiveBuilder::new();
        let code = b.code(&[Instruction::new(Opcode::Noop, 0, 0, 0), Instruction::new(Opcode::Branch, 0, 0, 0)]);
        b.add_def_raw(DefRecord { name: "loop".into(), code, ..Default::default() });
        assert_eq!(check(b.build()), Err(ValidationError::DefFlags));
    }

    #[test]
    fn test_stack_access() {
        let bytes = create_archive("test", 2, 1, 4, &[], &[Instruction::new(Opcode::AddVV, 0, 0, 0), ret()]);
        assert!(check(bytes).is_ok());
        let bytes = create_archive("test", 2, 1, 3, &[], &[Instruction::new(Opcode::AddVV, 0, 0, 0), ret()]);
        assert_eq!(check(bytes), Err(ValidationError::AccessViolation));

        let bytes = create_archive("test", 2, 1, 3, &[], &[Instruction::new(Opcode::AddSS, 0, 1, 0xFFFF), ret()]);
        assert_eq!(check(bytes), Err(ValidationError::AccessViolation));
    }

    #[test]
    fn test_index_destination_bounds() {
        // the immediate offsets the source, the write is always one slot
        let index = |dst| create_archive("test", 1, 0, 16, &[], &[Instruction::new(Opcode::IndexRIS, 0, 0, dst)]);
        assert!(check(index(15)).is_ok());
        assert_eq!(check(index(16)), Err(ValidationError::AccessViolation));
        let bytes = create_archive("test", 1, 0, 16, &[], &[Instruction::new(Opcode::IndexRIS, 0, 8, 15)]);
        assert!(check(bytes).is_ok());
    }

    #[test]
    fn test_stack_too_small() {
        let mut archive = Archive::new(simple());
        assert_eq!(validate(&mut archive, 16), Err(ValidationError::StackSize));
    }

    #[test]
    fn test_bad_opcode() {
        let bytes = create_archive("test", 0, 0, 1, &[], &[Instruction { opcode: 0x200, arg1: 0, arg2: 0, arg3: 0 }]);
        assert_eq!(check(bytes), Err(ValidationError::BadInstruction));
    }

    #[test]
    fn test_extcall_target_must_be_extern() {
        let mut b = ArchiveBuilder::new();
        let body = b.code(&[ret()]);
        let local = b.def("local", 0, body, 2, 1, 1);
        let (lo, hi) = crate::vm::opcodes::split(local);
        let code = b.code(&[Instruction::new(Opcode::Extcall, lo, hi, 0), ret()]);
        b.def("caller", 0, code, 2, 1, 1);
        assert_eq!(check(b.build()), Err(ValidationError::DefFlags));

        let mut b = ArchiveBuilder::new();
        let ext = b.extern_def("ext", 1, 1);
        let (lo, hi) = crate::vm::opcodes::split(ext);
        let code = b.code(&[Instruction::new(Opcode::Extcall, lo, hi, 0), ret()]);
        b.def("caller", 0, code, 2, 1, 1);
        assert!(check(b.build()).is_ok());
    }

    #[test]
    fn test_extern_must_have_no_locals() {
        let mut b = ArchiveBuilder::new();
        b.add_def(DefRecord {
            name: "ext".into(),
            flags: def_flags::EXTERN,
            stack_count: 3,
            args_count: 1,
            rvals_count: 1,
            ..Default::default()
        });
        assert_eq!(check(b.build()), Err(ValidationError::DefHeader));
    }

    #[test]
    fn test_data_sections() {
        let mut b = ArchiveBuilder::new();
        b.data_section(&[1.0, 2.0]);
        let code = b.code(&[Instruction::new(Opcode::DloadIIS, 0, 1, 0), ret()]);
        b.def("ok", 0, code, 1, 0, 1);
        assert!(check(b.build()).is_ok());

        let mut b = ArchiveBuilder::new();
        b.data_section(&[1.0, 2.0]);
        let code = b.code(&[Instruction::new(Opcode::DloadIIV, 0, 0, 0), ret()]);
        b.def("bad", 0, code, 4, 0, 4);
        assert_eq!(check(b.build()), Err(ValidationError::AccessViolation));
    }

    #[test]
    fn test_data_section_bounds() {
        let mut b = ArchiveBuilder::new();
        b.data_section(&[1.0, 2.0]);
        let mut bytes = b.build();
        let hdr = ArchiveHeader::parse(&bytes).unwrap();
        // section count field of entry 0
        let field = hdr.data_offset() + 8;
        bytes[field..field + 4].copy_from_slice(&3u32.to_le_bytes());
        assert_eq!(check(bytes), Err(ValidationError::DataSize));
    }
}
