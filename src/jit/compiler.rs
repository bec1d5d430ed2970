//! Target-independent compilation driver.
//!
//! A def is compiled one instruction at a time. Values are kept in the
//! register cache within a straight-line block and written back at every
//! block boundary, so the stack in memory is authoritative whenever control
//! reaches a branch target, a helper call or the exit. That is what lets an
//! interrupted def resume in either the interpreter or compiled code.
//!
//! Backward branches poll the interrupt byte before jumping; their targets
//! are the only places compiled code can resume at.

use std::collections::BTreeSet;
use std::ops::Range;

use serde::Serialize;
use tracing::warn;

use super::codebuf::{CodeBuffer, Label};
use super::regcache::{Access, Acquired, Overlap, RegStats, RegisterCache, RegisterFile, SlotIo, Width, overlap};
use crate::vm::error::LmntError;
use crate::vm::opcodes::{Instruction, Opcode, Operand, combine};
use crate::vm::ops::status::{CMP_EQ, CMP_GT, CMP_LT, CMP_UN};

/// Instructions scanned ahead when weighing a stack slot.
pub const LOOKAHEAD: usize = 16;

/// Condition under which a conditional branch or `ASSIGNC*` takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchCond {
    /// `|v| == 0`
    Zero,
    /// Neither zero nor NaN.
    NonZero,
    /// Sign bit clear.
    Positive,
    /// Sign bit set.
    Negative,
    Unordered,
    /// Any bit of `mask` set in the status word (`set`), or none (`!set`).
    Flags { mask: u32, set: bool },
}

impl BranchCond {
    /// Condition tested by a branch opcode; `None` for `BRANCH`.
    pub fn of_branch(op: Opcode) -> Option<BranchCond> {
        match op {
            Opcode::BranchZ => Some(BranchCond::Zero),
            Opcode::BranchNZ => Some(BranchCond::NonZero),
            Opcode::BranchPos => Some(BranchCond::Positive),
            Opcode::BranchNeg => Some(BranchCond::Negative),
            Opcode::BranchUn => Some(BranchCond::Unordered),
            Opcode::BranchCEQ => Some(BranchCond::flags(CMP_EQ, true)),
            Opcode::BranchCNE => Some(BranchCond::flags(CMP_EQ, false)),
            Opcode::BranchCLT => Some(BranchCond::flags(CMP_LT, true)),
            Opcode::BranchCLE => Some(BranchCond::flags(CMP_LT | CMP_EQ, true)),
            Opcode::BranchCGT => Some(BranchCond::flags(CMP_GT, true)),
            Opcode::BranchCGE => Some(BranchCond::flags(CMP_GT | CMP_EQ, true)),
            Opcode::BranchCUN => Some(BranchCond::flags(CMP_UN, true)),
            _ => None,
        }
    }

    /// Status test of an `ASSIGNC*` opcode.
    pub fn of_assign(op: Opcode) -> Option<BranchCond> {
        match op {
            Opcode::AssignCEQ => Some(BranchCond::flags(CMP_EQ, true)),
            Opcode::AssignCNE => Some(BranchCond::flags(CMP_EQ, false)),
            Opcode::AssignCLT => Some(BranchCond::flags(CMP_LT, true)),
            Opcode::AssignCLE => Some(BranchCond::flags(CMP_LT | CMP_EQ, true)),
            Opcode::AssignCGT => Some(BranchCond::flags(CMP_GT, true)),
            Opcode::AssignCGE => Some(BranchCond::flags(CMP_GT | CMP_EQ, true)),
            Opcode::AssignCUN => Some(BranchCond::flags(CMP_UN, true)),
            _ => None,
        }
    }

    const fn flags(mask: u32, set: bool) -> BranchCond {
        BranchCond::Flags { mask, set }
    }

    pub fn needs_value(self) -> bool {
        !matches!(self, BranchCond::Flags { .. })
    }
}

/// Bits `(bits << 1)` above which a float is NaN.
pub const NAN_THRESHOLD: u32 = 0xFF00_0000;

/// The float an `ASSIGNI*`/`ASSIGNC*` immediate stands for, as bits.
pub fn int_immediate_bits(lo: u16, hi: u16) -> u32 {
    (combine(lo, hi) as i32 as f32).to_bits()
}

/// The sign-extended 16-bit immediate of `ASSIGNC*`, as float bits.
pub fn short_immediate_bits(value: u16) -> u32 {
    (value as i16 as f32).to_bits()
}

/// Code generation for one target.
///
/// Register numbers handed to and from a backend are physical numbers whose
/// meaning depends on the width: on ARMv7 a scalar is an `S` register and a
/// vector a `Q` register.
pub trait Backend: Copy {
    fn register_file(&self) -> RegisterFile;

    /// Physical register of a cache unit.
    fn phys(&self, unit: u8, width: Width) -> u8;

    /// One of three scratch registers outside the cache.
    fn scratch(&self, index: usize, width: Width) -> u8;

    fn load(&self, buf: &mut CodeBuffer, reg: u8, pos: u16, width: Width);

    fn store(&self, buf: &mut CodeBuffer, reg: u8, pos: u16, width: Width);

    /// Copy a register. A scalar move leaves the other lanes of `dst` alone.
    fn mov(&self, buf: &mut CodeBuffer, dst: u8, src: u8, width: Width);

    /// Save registers, bind the frame, then continue at the resume label
    /// matching the frame's resume point (falling through for 0).
    fn prologue(&self, buf: &mut CodeBuffer, resume: &[(u32, Label)], exit: Label);

    /// Restore registers and return the result already set.
    fn epilogue(&self, buf: &mut CodeBuffer);

    fn set_result(&self, buf: &mut CodeBuffer, value: i32);

    fn jump(&self, buf: &mut CodeBuffer, label: Label);

    /// Leave with the interrupted result, recording `resume_at`, when an
    /// interrupt was requested.
    fn check_interrupt(&self, buf: &mut CodeBuffer, resume_at: u32, exit: Label);

    /// Run instruction `index` through the helper; leave on failure.
    fn call_fallback(&self, buf: &mut CodeBuffer, index: u32, exit: Label);

    /// Jump to `skip` unless `cond` holds. `value` is the register holding
    /// the tested value; flag conditions ignore it.
    fn branch_unless(&self, buf: &mut CodeBuffer, cond: BranchCond, value: u8, skip: Label);

    /// Emit native code for `ins`. Returns `false`, without emitting
    /// anything, for opcodes left to the helper.
    fn lower(&self, lw: &mut Lowering<'_, Self>, ins: &Instruction, op: Opcode) -> Result<bool, LmntError>;
}

/// JIT statistics for one compiled def.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JitStats {
    pub codesize: u32,
    pub reg_alloc: u32,
    pub reg_aligned: u32,
    pub reg_unaligned: u32,
    pub reg_evicted: u32,
    pub reg_evicted_written: u32,
    /// Instructions run through the interpreter helper.
    pub fallbacks: u32,
}

impl JitStats {
    fn new(codesize: usize, reg: RegStats, fallbacks: u32) -> Self {
        JitStats {
            codesize: codesize as u32,
            reg_alloc: reg.reg_alloc,
            reg_aligned: reg.reg_aligned,
            reg_unaligned: reg.reg_unaligned,
            reg_evicted: reg.reg_evicted,
            reg_evicted_written: reg.reg_evicted_written,
            fallbacks,
        }
    }
}

/// Output of [`emit`].
#[derive(Debug, Clone)]
pub struct Emitted {
    pub bytes: Vec<u8>,
    /// Code between the prologue and the exit, where interrupts are polled.
    pub body: Range<usize>,
    /// Instruction indices compiled code can resume at, besides 0.
    pub resume_points: Vec<u32>,
    pub stats: JitStats,
}

struct Io<'b, B: Backend> {
    backend: B,
    buf: &'b mut CodeBuffer,
}

impl<B: Backend> SlotIo for Io<'_, B> {
    fn load(&mut self, unit: u8, pos: u16, width: Width) {
        let reg = self.backend.phys(unit, width);
        self.backend.load(self.buf, reg, pos, width);
    }

    fn store(&mut self, unit: u8, pos: u16, width: Width) {
        let reg = self.backend.phys(unit, width);
        self.backend.store(self.buf, reg, pos, width);
    }
}

/// State of one compilation, handed to [`Backend::lower`].
pub struct Lowering<'c, B: Backend> {
    backend: B,
    buf: CodeBuffer,
    cache: RegisterCache,
    code: &'c [Instruction],
    /// Branch targets, indexed by instruction (one past the end included).
    targets: Vec<bool>,
    index: usize,
    fallbacks: u32,
}

impl<'c, B: Backend> Lowering<'c, B> {
    pub fn buf(&mut self) -> &mut CodeBuffer {
        &mut self.buf
    }

    pub fn scratch(&self, index: usize, width: Width) -> u8 {
        self.backend.scratch(index, width)
    }

    fn io(&mut self) -> (&mut RegisterCache, Io<'_, B>) {
        (&mut self.cache, Io { backend: self.backend, buf: &mut self.buf })
    }

    /// A register holding the value at `pos`; uncached values are loaded
    /// into scratch register `tmp`.
    pub fn read(&mut self, pos: u16, width: Width, tmp: usize) -> Result<u8, LmntError> {
        let (code, index, targets) = (self.code, self.index, &self.targets);
        let weigh = |p: u16, w: Width| lookahead(code, targets, index, p, w);
        let backend = self.backend;
        let (cache, mut io) = (&mut self.cache, Io { backend, buf: &mut self.buf });
        match cache.acquire(&mut io, pos, width, Access::Read, &weigh)? {
            Acquired::Reg(unit) => Ok(backend.phys(unit, width)),
            Acquired::Scratch => {
                let reg = backend.scratch(tmp, width);
                backend.load(io.buf, reg, pos, width);
                Ok(reg)
            }
        }
    }

    /// Store the value in `src` to `pos`, through the cache.
    pub fn write(&mut self, pos: u16, width: Width, src: u8) -> Result<(), LmntError> {
        let (code, index, targets) = (self.code, self.index, &self.targets);
        let weigh = |p: u16, w: Width| lookahead(code, targets, index, p, w);
        let backend = self.backend;
        let (cache, mut io) = (&mut self.cache, Io { backend, buf: &mut self.buf });
        match cache.acquire(&mut io, pos, width, Access::Write, &weigh)? {
            Acquired::Reg(unit) => {
                let dst = backend.phys(unit, width);
                if dst != src {
                    backend.mov(io.buf, dst, src, width);
                }
                cache.notify_written(unit);
            }
            Acquired::Scratch => backend.store(io.buf, src, pos, width),
        }
        Ok(())
    }

    fn flush_all(&mut self) -> Result<(), LmntError> {
        let (cache, mut io) = self.io();
        cache.flush_all(&mut io)
    }

    fn invalidate_all(&mut self) -> Result<(), LmntError> {
        let (cache, mut io) = self.io();
        cache.invalidate_all(&mut io)
    }

    fn branch(&mut self, ins: &Instruction, op: Opcode, labels: &[Label], exit: Label) -> Result<(), LmntError> {
        let target = ins.branch_target();
        let label = *labels.get(target as usize).ok_or(LmntError::Internal)?;
        let cond = BranchCond::of_branch(op);
        let value = match cond {
            Some(c) if c.needs_value() => self.read(ins.arg1, Width::Scalar, 0)?,
            _ => 0,
        };
        self.flush_all()?;
        let skip = self.buf.new_label();
        if let Some(cond) = cond {
            self.backend.branch_unless(&mut self.buf, cond, value, skip);
        }
        if target as usize <= self.index {
            self.backend.check_interrupt(&mut self.buf, target, exit);
        }
        self.backend.jump(&mut self.buf, label);
        self.buf.bind(skip);
        Ok(())
    }

    fn instruction(&mut self, ins: &Instruction, labels: &[Label], exit: Label) -> Result<(), LmntError> {
        let op = ins.op().ok_or(LmntError::Internal)?;
        match op {
            Opcode::Noop => {}
            Opcode::Return => {
                self.flush_all()?;
                self.backend.set_result(&mut self.buf, 0);
                self.backend.jump(&mut self.buf, exit);
            }
            op if op.is_branch() => self.branch(ins, op, labels, exit)?,
            op => {
                let backend = self.backend;
                if writes_over_inputs(ins, op) || !backend.lower(self, ins, op)? {
                    self.invalidate_all()?;
                    backend.call_fallback(&mut self.buf, self.index as u32, exit);
                    self.fallbacks += 1;
                }
            }
        }
        self.cache.unlock_all();
        Ok(())
    }
}

/// Whether operand `k` of `op` is written.
fn is_written(op: Opcode, k: usize) -> bool {
    match op {
        Opcode::SinCos => k >= 1,
        Opcode::Cmp | Opcode::CmpZ => false,
        op if op.is_branch() => false,
        _ => k == 2,
    }
}

/// Whether a vector result lands partly on one of its inputs. The
/// interpreter computes vector ops lane by lane, so later lanes read the
/// lanes already written; only the helper reproduces that.
fn writes_over_inputs(ins: &Instruction, op: Opcode) -> bool {
    let kinds = op.operands();
    let args = [ins.arg1, ins.arg2, ins.arg3];
    let Some(out) = (0..3).find(|&k| is_written(op, k) && kinds[k] == Operand::Stack4) else {
        return false;
    };
    (0..3).filter(|&k| !is_written(op, k)).any(|k| {
        let width = match kinds[k] {
            Operand::Stack1 => Width::Scalar,
            Operand::Stack4 => Width::Vector,
            _ => return false,
        };
        !matches!(overlap(args[out], Width::Vector, args[k], width), Overlap::None | Overlap::Aligned)
    })
}

/// How much the code after instruction `index` cares about `[pos, pos + width)`.
///
/// Each upcoming operand overlapping the range adds a weight that falls off
/// with distance; reads count double since a write makes the old value dead.
/// The scan stops at the end of the block.
pub fn lookahead(code: &[Instruction], targets: &[bool], index: usize, pos: u16, width: Width) -> u32 {
    let window = LOOKAHEAD as u32;
    let mut score = 0u32;
    for (d, ins) in code.iter().enumerate().skip(index + 1).take(LOOKAHEAD) {
        if targets.get(d).copied().unwrap_or(false) {
            break;
        }
        let Some(op) = ins.op() else { break };
        if op == Opcode::Extcall {
            break;
        }
        let weight = window + 1 - (d - index) as u32;
        let args = [ins.arg1, ins.arg2, ins.arg3];
        for (k, kind) in op.operands().into_iter().enumerate() {
            let w = match kind {
                Operand::Stack1 => Width::Scalar,
                Operand::Stack4 => Width::Vector,
                _ => continue,
            };
            if overlap(pos, width, args[k], w) != Overlap::None {
                score += if is_written(op, k) { weight } else { 2 * weight };
            }
        }
        if op.is_branch() || op == Opcode::Return {
            break;
        }
    }
    score
}

/// Compile `code` with `backend`.
pub fn emit<B: Backend>(backend: B, code: &[Instruction], validate_cache: bool) -> Result<Emitted, LmntError> {
    let len = code.len();
    let mut targets = vec![false; len + 1];
    let mut resume = BTreeSet::new();
    for (i, ins) in code.iter().enumerate() {
        let op = ins.op().ok_or(LmntError::Internal)?;
        if op.is_branch() {
            let target = ins.branch_target() as usize;
            if target > len {
                return Err(LmntError::Internal);
            }
            targets[target] = true;
            if target <= i && target != 0 {
                resume.insert(target as u32);
            }
        }
    }

    let mut lw = Lowering {
        backend,
        buf: CodeBuffer::with_capacity(64 + 32 * len),
        cache: RegisterCache::new(backend.register_file(), validate_cache),
        code,
        targets,
        index: 0,
        fallbacks: 0,
    };
    let labels: Vec<Label> = (0..=len).map(|_| lw.buf.new_label()).collect();
    let exit = lw.buf.new_label();
    let resume_labels: Vec<(u32, Label)> = resume.iter().map(|&t| (t, labels[t as usize])).collect();

    backend.prologue(&mut lw.buf, &resume_labels, exit);
    let body_start = lw.buf.offset();
    for (i, ins) in code.iter().enumerate() {
        lw.index = i;
        if lw.targets[i] {
            lw.invalidate_all()?;
            lw.buf.bind(labels[i]);
        }
        lw.instruction(ins, &labels, exit)?;
    }
    lw.index = len;
    lw.invalidate_all()?;
    lw.buf.bind(labels[len]);
    backend.set_result(&mut lw.buf, 0);
    lw.buf.bind(exit);
    let body_end = lw.buf.offset();
    backend.epilogue(&mut lw.buf);

    let stats = lw.cache.stats();
    let fallbacks = lw.fallbacks;
    let bytes = lw.buf.finish().map_err(|msg| {
        warn!(%msg, "failed to link compiled code");
        LmntError::Internal
    })?;
    Ok(Emitted {
        stats: JitStats::new(bytes.len(), stats, fallbacks),
        bytes,
        body: body_start..body_end,
        resume_points: resume.into_iter().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_conditions() {
        assert_eq!(BranchCond::of_branch(Opcode::Branch), None);
        assert_eq!(BranchCond::of_branch(Opcode::BranchZ), Some(BranchCond::Zero));
        assert_eq!(
            BranchCond::of_branch(Opcode::BranchCGE),
            Some(BranchCond::Flags { mask: CMP_GT | CMP_EQ, set: true })
        );
        assert_eq!(BranchCond::of_assign(Opcode::AssignCNE), Some(BranchCond::Flags { mask: CMP_EQ, set: false }));
        assert!(!BranchCond::Flags { mask: CMP_EQ, set: true }.needs_value());
        for op in Opcode::ALL {
            if op.is_branch() && *op != Opcode::Branch {
                assert!(BranchCond::of_branch(*op).is_some(), "{op}");
            }
        }
    }

    #[test]
    fn test_nan_threshold() {
        for (v, nan) in [(f32::NAN, true), (f32::INFINITY, false), (f32::NEG_INFINITY, false), (-0.0, false)] {
            assert_eq!(v.to_bits() << 1 > NAN_THRESHOLD, nan, "{v}");
        }
    }

    #[test]
    fn test_vector_results_over_inputs() {
        let partial = |op, a1, a2, a3| writes_over_inputs(&Instruction::new(op, a1, a2, a3), op);
        assert!(partial(Opcode::AddVV, 0, 0, 1));
        assert!(partial(Opcode::MulVV, 4, 0, 2));
        assert!(partial(Opcode::FloorV, 3, 0, 0));
        // the scalar is read again for every lane
        assert!(partial(Opcode::MaxVS, 0, 8, 8));
        assert!(partial(Opcode::MinVS, 0, 10, 8));

        assert!(!partial(Opcode::AddVV, 0, 4, 0));
        assert!(!partial(Opcode::AddVV, 0, 0, 4));
        assert!(!partial(Opcode::MaxVS, 0, 4, 8));
        assert!(!partial(Opcode::SumV, 0, 0, 1));
        assert!(!partial(Opcode::AddSS, 0, 1, 0));
    }

    #[test]
    fn test_immediates() {
        assert_eq!(f32::from_bits(int_immediate_bits(0xFFFB, 0xFFFF)), -5.0);
        assert_eq!(f32::from_bits(short_immediate_bits(0xFFFF)), -1.0);
        assert_eq!(f32::from_bits(short_immediate_bits(7)), 7.0);
    }

    #[test]
    fn test_lookahead_weights() {
        let code = [
            Instruction::new(Opcode::AddSS, 0, 1, 2),
            Instruction::new(Opcode::MulSS, 2, 2, 3),
            Instruction::new(Opcode::AssignSS, 4, 0, 2),
            Instruction::new(Opcode::Return, 0, 0, 0),
            Instruction::new(Opcode::AddSS, 2, 2, 2),
        ];
        let targets = vec![false; code.len() + 1];
        let w = LOOKAHEAD as u32;
        // Two reads at distance 1, one write at distance 2; nothing past RETURN.
        assert_eq!(lookahead(&code, &targets, 0, 2, Width::Scalar), 4 * w + (w - 1));
        // The vector at 0 overlaps slots 2 and 3 as well.
        assert!(lookahead(&code, &targets, 0, 0, Width::Vector) > lookahead(&code, &targets, 0, 2, Width::Scalar));
        assert_eq!(lookahead(&code, &targets, 0, 9, Width::Scalar), 0);
    }

    #[test]
    fn test_lookahead_stops_at_labels() {
        let code = [
            Instruction::new(Opcode::AddSS, 0, 1, 2),
            Instruction::new(Opcode::AddSS, 2, 2, 2),
        ];
        let targets = vec![false, true, false];
        assert_eq!(lookahead(&code, &targets, 0, 2, Width::Scalar), 0);
    }
}
