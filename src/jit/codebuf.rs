//! Code buffer for building JIT code.
//!
//! Machine code is assembled into a plain byte vector. Branches to code that
//! has not been emitted yet go through numbered labels: the branch is
//! emitted with a zero offset and recorded as a fixup, and every fixup is
//! patched once the whole function has been emitted.

/// A branch target inside one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

impl Label {
    pub fn index(self) -> u32 {
        self.0
    }
}

/// How a reference to a label is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fixup {
    /// x86-64 32-bit displacement, relative to the end of the field.
    Rel32,
    /// AArch64 `B`/`BL`: imm26 in bits 0..26, in words.
    A64Branch26,
    /// AArch64 `B.cond`/`CBZ`/`CBNZ`: imm19 in bits 5..24, in words.
    A64Cond19,
    /// A32 `B<cond>`: imm24 in words, relative to the instruction + 8.
    A32Branch24,
    /// Thumb-2 `B.W` (encoding T4), relative to the instruction + 4.
    T32Branch24,
    /// Thumb-2 `B<cond>.W` (encoding T3), relative to the instruction + 4.
    T32Cond20,
}

/// A buffer for building machine code.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
    /// Bound offset per label, `None` until bound.
    labels: Vec<Option<usize>>,
    /// Pending references: (instruction offset, label, encoding).
    fixups: Vec<(usize, Label, Fixup)>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { code: Vec::with_capacity(capacity), ..Self::default() }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Current emission offset.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit a 16-bit value (little-endian).
    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit value (little-endian).
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit value (little-endian).
    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Allocate an unbound label.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    /// Bind `label` to the current offset.
    pub fn bind(&mut self, label: Label) {
        if let Some(slot) = self.labels.get_mut(label.0 as usize) {
            *slot = Some(self.code.len());
        }
    }

    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0 as usize).copied().flatten()
    }

    /// Record that the instruction (or field, for `Rel32`) at `offset`
    /// refers to `label`.
    pub fn add_fixup(&mut self, offset: usize, label: Label, kind: Fixup) {
        self.fixups.push((offset, label, kind));
    }

    /// Emit a zeroed rel32 field referring to `label`.
    pub fn emit_rel32(&mut self, label: Label) {
        self.add_fixup(self.code.len(), label, Fixup::Rel32);
        self.emit_u32(0);
    }

    fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([self.code[offset], self.code[offset + 1], self.code[offset + 2], self.code[offset + 3]])
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.code[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn read_halves(&self, offset: usize) -> (u32, u32) {
        let hw1 = u16::from_le_bytes([self.code[offset], self.code[offset + 1]]) as u32;
        let hw2 = u16::from_le_bytes([self.code[offset + 2], self.code[offset + 3]]) as u32;
        (hw1, hw2)
    }

    fn write_halves(&mut self, offset: usize, hw1: u32, hw2: u32) {
        self.code[offset..offset + 2].copy_from_slice(&(hw1 as u16).to_le_bytes());
        self.code[offset + 2..offset + 4].copy_from_slice(&(hw2 as u16).to_le_bytes());
    }

    /// Patch every recorded reference.
    pub fn patch_fixups(&mut self) -> Result<(), String> {
        let fixups = std::mem::take(&mut self.fixups);
        for (offset, label, kind) in fixups {
            let target = self
                .label_offset(label)
                .ok_or_else(|| format!("unbound label: {}", label.0))?;
            if offset + 4 > self.code.len() {
                return Err(format!("fixup outside of code at {:#x}", offset));
            }
            let out_of_range = || format!("branch to label {} out of range at {:#x}", label.0, offset);
            let target = target as i64;
            let at = offset as i64;
            match kind {
                Fixup::Rel32 => {
                    let rel = target - (at + 4);
                    let rel = i32::try_from(rel).map_err(|_| out_of_range())?;
                    self.write_u32(offset, rel as u32);
                }
                Fixup::A64Branch26 => {
                    let rel = (target - at) / 4;
                    if !(-(1 << 25)..(1 << 25)).contains(&rel) {
                        return Err(out_of_range());
                    }
                    let ins = (self.read_u32(offset) & 0xFC00_0000) | (rel as u32 & 0x03FF_FFFF);
                    self.write_u32(offset, ins);
                }
                Fixup::A64Cond19 => {
                    let rel = (target - at) / 4;
                    if !(-(1 << 18)..(1 << 18)).contains(&rel) {
                        return Err(out_of_range());
                    }
                    let ins = (self.read_u32(offset) & 0xFF00_001F) | ((rel as u32 & 0x7FFFF) << 5);
                    self.write_u32(offset, ins);
                }
                Fixup::A32Branch24 => {
                    let rel = (target - (at + 8)) / 4;
                    if !(-(1 << 23)..(1 << 23)).contains(&rel) {
                        return Err(out_of_range());
                    }
                    let ins = (self.read_u32(offset) & 0xFF00_0000) | (rel as u32 & 0x00FF_FFFF);
                    self.write_u32(offset, ins);
                }
                Fixup::T32Branch24 => {
                    let rel = target - (at + 4);
                    if !(-(1 << 24)..(1 << 24)).contains(&rel) {
                        return Err(out_of_range());
                    }
                    let imm = rel as u32;
                    let s = (imm >> 24) & 1;
                    let i1 = (imm >> 23) & 1;
                    let i2 = (imm >> 22) & 1;
                    let j1 = (!(i1 ^ s)) & 1;
                    let j2 = (!(i2 ^ s)) & 1;
                    let (hw1, hw2) = self.read_halves(offset);
                    let hw1 = (hw1 & 0xF800) | (s << 10) | ((imm >> 12) & 0x3FF);
                    let hw2 = (hw2 & 0xD000) | (j1 << 13) | (j2 << 11) | ((imm >> 1) & 0x7FF);
                    self.write_halves(offset, hw1, hw2);
                }
                Fixup::T32Cond20 => {
                    let rel = target - (at + 4);
                    if !(-(1 << 20)..(1 << 20)).contains(&rel) {
                        return Err(out_of_range());
                    }
                    let imm = rel as u32;
                    let s = (imm >> 20) & 1;
                    let j2 = (imm >> 19) & 1;
                    let j1 = (imm >> 18) & 1;
                    let (hw1, hw2) = self.read_halves(offset);
                    let hw1 = (hw1 & 0xFBC0) | (s << 10) | ((imm >> 12) & 0x3F);
                    let hw2 = (hw2 & 0xD000) | (j1 << 13) | (j2 << 11) | ((imm >> 1) & 0x7FF);
                    self.write_halves(offset, hw1, hw2);
                }
            }
        }
        Ok(())
    }

    /// Patch references and hand out the finished code.
    pub fn finish(mut self) -> Result<Vec<u8>, String> {
        self.patch_fixups()?;
        Ok(self.code)
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Pad to `alignment` bytes with `fill`.
    pub fn align(&mut self, alignment: usize, fill: u8) {
        while self.code.len() % alignment != 0 {
            self.emit_u8(fill);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_bytes() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0x90);
        buf.emit_u16(0x1234);
        buf.emit_u32(0xDEADBEEF);

        assert_eq!(buf.len(), 7);
        assert_eq!(buf.code(), &[0x90, 0x34, 0x12, 0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn test_labels() {
        let mut buf = CodeBuffer::new();
        let label = buf.new_label();
        buf.emit_u8(0x90);
        assert_eq!(buf.label_offset(label), None);
        buf.bind(label);
        buf.emit_u8(0x90);
        assert_eq!(buf.label_offset(label), Some(1));
    }

    #[test]
    fn test_rel32_forward_and_backward() {
        let mut buf = CodeBuffer::new();
        let top = buf.new_label();
        let end = buf.new_label();
        buf.bind(top);
        buf.emit_u8(0xE9);
        buf.emit_rel32(end);
        buf.emit_u8(0xE9);
        buf.emit_rel32(top);
        buf.bind(end);
        let code = buf.finish().unwrap();
        assert_eq!(&code[1..5], &5i32.to_le_bytes());
        assert_eq!(&code[6..10], &(-10i32).to_le_bytes());
    }

    #[test]
    fn test_a64_branches() {
        let mut buf = CodeBuffer::new();
        let target = buf.new_label();
        buf.add_fixup(0, target, Fixup::A64Branch26);
        buf.emit_u32(0x1400_0000);
        buf.add_fixup(4, target, Fixup::A64Cond19);
        buf.emit_u32(0x5400_0000);
        buf.bind(target);
        let code = buf.finish().unwrap();
        assert_eq!(&code[0..4], &0x1400_0002u32.to_le_bytes());
        assert_eq!(&code[4..8], &0x5400_0020u32.to_le_bytes());
    }

    #[test]
    fn test_a32_branch_backward() {
        let mut buf = CodeBuffer::new();
        let top = buf.new_label();
        buf.bind(top);
        buf.add_fixup(0, top, Fixup::A32Branch24);
        buf.emit_u32(0xEA00_0000);
        let code = buf.finish().unwrap();
        // b . encodes as offset -2 words
        assert_eq!(&code[0..4], &0xEAFF_FFFEu32.to_le_bytes());
    }

    #[test]
    fn test_t32_branch_forward() {
        let mut buf = CodeBuffer::new();
        let target = buf.new_label();
        buf.add_fixup(0, target, Fixup::T32Branch24);
        buf.emit_u16(0xF000);
        buf.emit_u16(0xB800);
        buf.emit_u32(0);
        buf.bind(target);
        let code = buf.finish().unwrap();
        // b.w +8 from the instruction: offset 4 from pc
        assert_eq!(&code[0..4], &[0x00, 0xF0, 0x02, 0xB8]);
    }

    #[test]
    fn test_unbound_label() {
        let mut buf = CodeBuffer::new();
        let label = buf.new_label();
        buf.emit_u8(0xE9);
        buf.emit_rel32(label);
        assert!(buf.finish().is_err());
    }

    #[test]
    fn test_alignment() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0x90);
        buf.align(4, 0xCC);
        assert_eq!(buf.code(), &[0x90, 0xCC, 0xCC, 0xCC]);
    }
}
