//! ARMv7 backends (AAPCS, hard-float register use).
//!
//! R4 holds the frame and R5 the stack base; R0-R3 and R12 are temporaries.
//!
//! ARMv7-A is emitted as A32 with NEON. The cache covers S0-S19, grouped in
//! banks of four so a vector lives in Q0-Q4 and its lanes stay addressable
//! as S registers. Q5-Q7 are scratch.
//!
//! ARMv7-M is emitted as Thumb-2 with single precision VFP only. Vectors are
//! never cached or lowered; S0-S28 cache scalars and S29-S31 are scratch.

use super::armv7::{Armv7Assembler, Cond, Mode, Reg, VfpOp};
use super::codebuf::{CodeBuffer, Label};
use super::compiler::{Backend, BranchCond, Lowering, NAN_THRESHOLD, int_immediate_bits, short_immediate_bits};
use super::helpers::FRAME_32;
use super::regcache::{RegisterFile, Width};
use crate::vm::error::LmntError;
use crate::vm::opcodes::{Instruction, Opcode, combine};

const FRAME: Reg = Reg::R4;
const STACK: Reg = Reg::R5;
/// Largest `vldr` offset.
const MAX_VLDR: u32 = 1024;

#[derive(Debug, Clone, Copy)]
pub struct Armv7Backend {
    mode: Mode,
}

impl Armv7Backend {
    /// ARMv7-A: A32 with NEON.
    pub fn a() -> Self {
        Armv7Backend { mode: Mode::Arm }
    }

    /// ARMv7-M: Thumb-2 with VFP.
    pub fn m() -> Self {
        Armv7Backend { mode: Mode::Thumb }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn neon(&self) -> bool {
        self.mode == Mode::Arm
    }

    fn asm<'b>(&self, buf: &'b mut CodeBuffer) -> Armv7Assembler<'b> {
        Armv7Assembler::new(buf, self.mode)
    }

    fn access(&self, buf: &mut CodeBuffer, reg: u8, pos: u16, width: Width, store: bool) {
        let mut asm = self.asm(buf);
        let offset = pos as u32 * 4;
        match width {
            Width::Scalar if offset < MAX_VLDR => {
                if store {
                    asm.vstr_s(reg, STACK, offset);
                } else {
                    asm.vldr_s(reg, STACK, offset);
                }
            }
            Width::Scalar => {
                asm.mov_imm32(Reg::R12, offset);
                asm.add(Reg::R12, STACK, Reg::R12);
                if store {
                    asm.vstr_s(reg, Reg::R12, 0);
                } else {
                    asm.vldr_s(reg, Reg::R12, 0);
                }
            }
            Width::Vector if self.neon() => {
                let base = if offset == 0 {
                    STACK
                } else {
                    asm.mov_imm32(Reg::R12, offset);
                    asm.add(Reg::R12, STACK, Reg::R12);
                    Reg::R12
                };
                if store {
                    asm.vst1_q(reg, base);
                } else {
                    asm.vld1_q(reg, base);
                }
            }
            Width::Vector => {
                drop(asm);
                for lane in 0..4u8 {
                    self.access(buf, reg + lane, pos + lane as u16, Width::Scalar, store);
                }
            }
        }
    }

    fn binary(&self, lw: &mut Lowering<'_, Self>, op: VfpOp, ins: &Instruction) -> Result<(), LmntError> {
        let a = lw.read(ins.arg1, Width::Scalar, 0)?;
        let b = lw.read(ins.arg2, Width::Scalar, 1)?;
        let t = lw.scratch(2, Width::Scalar);
        self.asm(lw.buf()).vfp(op, t, a, b);
        lw.write(ins.arg3, Width::Scalar, t)
    }

    fn binary_q(&self, lw: &mut Lowering<'_, Self>, op: Opcode, ins: &Instruction) -> Result<(), LmntError> {
        let a = lw.read(ins.arg1, Width::Vector, 0)?;
        let b = lw.read(ins.arg2, Width::Vector, 1)?;
        let t = lw.scratch(2, Width::Vector);
        let mut asm = self.asm(lw.buf());
        match op {
            Opcode::AddVV => asm.vadd_q(t, a, b),
            Opcode::SubVV => asm.vsub_q(t, a, b),
            _ => asm.vmul_q(t, a, b),
        }
        lw.write(ins.arg3, Width::Vector, t)
    }

    fn unary(&self, lw: &mut Lowering<'_, Self>, op: Opcode, ins: &Instruction) -> Result<(), LmntError> {
        let a = lw.read(ins.arg1, Width::Scalar, 0)?;
        let t = lw.scratch(2, Width::Scalar);
        let mut asm = self.asm(lw.buf());
        match op {
            Opcode::SqrtS => asm.vsqrt_s(t, a),
            _ => asm.vabs_s(t, a),
        }
        lw.write(ins.arg3, Width::Scalar, t)
    }

    /// MIN/MAX: start from `a` and take `b` only on a strict ordered
    /// comparison.
    fn select(&self, lw: &mut Lowering<'_, Self>, max: bool, ins: &Instruction) -> Result<(), LmntError> {
        let a = lw.read(ins.arg1, Width::Scalar, 0)?;
        let b = lw.read(ins.arg2, Width::Scalar, 1)?;
        let t = lw.scratch(2, Width::Scalar);
        let keep = lw.buf().new_label();
        let mut asm = self.asm(lw.buf());
        asm.vmov_s(t, a);
        if max {
            asm.vcmp_s(a, b);
        } else {
            asm.vcmp_s(b, a);
        }
        asm.vmrs_flags();
        asm.b_cond(Cond::Pl, keep);
        asm.vmov_s(t, b);
        lw.buf().bind(keep);
        lw.write(ins.arg3, Width::Scalar, t)
    }

    fn constant(&self, lw: &mut Lowering<'_, Self>, bits: u32, width: Width, pos: u16) -> Result<(), LmntError> {
        let s = lw.scratch(2, Width::Scalar);
        let q = lw.scratch(2, Width::Vector);
        let mut asm = self.asm(lw.buf());
        asm.mov_imm32(Reg::R0, bits);
        asm.vmov_s_r(s, Reg::R0);
        match width {
            Width::Scalar => lw.write(pos, Width::Scalar, s),
            Width::Vector => {
                asm.vdup_q_s(q, s);
                lw.write(pos, Width::Vector, q)
            }
        }
    }

    /// Lanes are read one at a time, so this works whether or not the
    /// vector is cached.
    fn sum(&self, lw: &mut Lowering<'_, Self>, ins: &Instruction) -> Result<(), LmntError> {
        let t = lw.scratch(2, Width::Scalar);
        let first = lw.read(ins.arg1, Width::Scalar, 0)?;
        self.asm(lw.buf()).vmov_s(t, first);
        for lane in 1..4 {
            let x = lw.read(ins.arg1 + lane, Width::Scalar, 0)?;
            self.asm(lw.buf()).vfp(VfpOp::Add, t, t, x);
        }
        lw.write(ins.arg3, Width::Scalar, t)
    }

    fn compare(&self, lw: &mut Lowering<'_, Self>, ins: &Instruction, zero: bool) -> Result<(), LmntError> {
        let a = lw.read(ins.arg1, Width::Scalar, 0)?;
        let b = if zero {
            let z = lw.scratch(1, Width::Scalar);
            let mut asm = self.asm(lw.buf());
            asm.mov_imm32(Reg::R1, 0);
            asm.vmov_s_r(z, Reg::R1);
            z
        } else {
            lw.read(ins.arg2, Width::Scalar, 1)?
        };
        let mut asm = self.asm(lw.buf());
        asm.mov_imm32(Reg::R0, 0);
        asm.vcmp_s(a, b);
        asm.vmrs_flags();
        asm.orr_imm_cond(Cond::Eq, Reg::R0, Reg::R0, 0x01);
        asm.orr_imm_cond(Cond::Mi, Reg::R0, Reg::R0, 0x02);
        asm.orr_imm_cond(Cond::Gt, Reg::R0, Reg::R0, 0x04);
        asm.orr_imm_cond(Cond::Vs, Reg::R0, Reg::R0, 0x80);
        asm.str(Reg::R0, FRAME, FRAME_32.status);
        Ok(())
    }

    fn assign_cond(&self, lw: &mut Lowering<'_, Self>, ins: &Instruction, cond: BranchCond) -> Result<(), LmntError> {
        let BranchCond::Flags { mask, set } = cond else {
            return Err(LmntError::Internal);
        };
        let t = lw.scratch(2, Width::Scalar);
        let done = lw.buf().new_label();
        let mut asm = self.asm(lw.buf());
        asm.ldr(Reg::R0, FRAME, FRAME_32.status);
        asm.mov_imm32(Reg::R1, mask);
        asm.tst(Reg::R0, Reg::R1);
        asm.mov_imm32(Reg::R2, short_immediate_bits(ins.arg2));
        asm.b_cond(if set { Cond::Eq } else { Cond::Ne }, done);
        asm.mov_imm32(Reg::R2, short_immediate_bits(ins.arg1));
        lw.buf().bind(done);
        self.asm(lw.buf()).vmov_s_r(t, Reg::R2);
        lw.write(ins.arg3, Width::Scalar, t)
    }

    fn lower_vector(&self, lw: &mut Lowering<'_, Self>, ins: &Instruction, op: Opcode) -> Result<bool, LmntError> {
        match op {
            Opcode::AssignVV => {
                let a = lw.read(ins.arg1, Width::Vector, 0)?;
                lw.write(ins.arg3, Width::Vector, a)?;
            }
            Opcode::AssignSV => {
                let a = lw.read(ins.arg1, Width::Scalar, 0)?;
                let t = lw.scratch(2, Width::Vector);
                self.asm(lw.buf()).vdup_q_s(t, a);
                lw.write(ins.arg3, Width::Vector, t)?;
            }
            Opcode::AssignIIV => self.constant(lw, int_immediate_bits(ins.arg1, ins.arg2), Width::Vector, ins.arg3)?,
            Opcode::AssignIBV => self.constant(lw, combine(ins.arg1, ins.arg2), Width::Vector, ins.arg3)?,
            Opcode::AddVV | Opcode::SubVV | Opcode::MulVV => self.binary_q(lw, op, ins)?,
            Opcode::AbsV => {
                let a = lw.read(ins.arg1, Width::Vector, 0)?;
                let t = lw.scratch(2, Width::Vector);
                self.asm(lw.buf()).vabs_q(t, a);
                lw.write(ins.arg3, Width::Vector, t)?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl Backend for Armv7Backend {
    fn register_file(&self) -> RegisterFile {
        if self.neon() { RegisterFile::banked(20) } else { RegisterFile::scalar_only(29) }
    }

    fn phys(&self, unit: u8, width: Width) -> u8 {
        match width {
            Width::Scalar => unit,
            Width::Vector => unit / 4,
        }
    }

    fn scratch(&self, index: usize, width: Width) -> u8 {
        let index = index as u8;
        match (self.neon(), width) {
            (true, Width::Scalar) => 20 + 4 * index,
            (true, Width::Vector) => 5 + index,
            (false, _) => 29 + index,
        }
    }

    fn load(&self, buf: &mut CodeBuffer, reg: u8, pos: u16, width: Width) {
        self.access(buf, reg, pos, width, false);
    }

    fn store(&self, buf: &mut CodeBuffer, reg: u8, pos: u16, width: Width) {
        self.access(buf, reg, pos, width, true);
    }

    fn mov(&self, buf: &mut CodeBuffer, dst: u8, src: u8, width: Width) {
        let mut asm = self.asm(buf);
        match width {
            Width::Scalar => asm.vmov_s(dst, src),
            Width::Vector if self.neon() => asm.vmov_q(dst, src),
            Width::Vector => {
                for lane in 0..4 {
                    asm.vmov_s(dst + lane, src + lane);
                }
            }
        }
    }

    fn prologue(&self, buf: &mut CodeBuffer, resume: &[(u32, Label)], exit: Label) {
        let body = buf.new_label();
        let mut asm = self.asm(buf);
        // 16 bytes of core registers plus 64 of VFP keep SP 8-byte aligned.
        asm.push(&[Reg::R4, Reg::R5, Reg::R6, Reg::Lr]);
        if self.neon() {
            asm.vpush_d8_d15();
        } else {
            asm.vpush_s16_s31();
        }
        asm.mov(FRAME, Reg::R0);
        asm.ldr(STACK, FRAME, FRAME_32.stack);
        if !resume.is_empty() {
            asm.ldr(Reg::R0, FRAME, FRAME_32.resume_at);
            asm.cmp_zero(Reg::R0);
            asm.b_cond(Cond::Eq, body);
            for &(index, label) in resume {
                asm.mov_imm32(Reg::R1, index);
                asm.cmp(Reg::R0, Reg::R1);
                asm.b_cond(Cond::Eq, label);
            }
            asm.mov_imm32(Reg::R0, LmntError::Internal.code() as u32);
            asm.b(exit);
        }
        buf.bind(body);
    }

    fn epilogue(&self, buf: &mut CodeBuffer) {
        let mut asm = self.asm(buf);
        if self.neon() {
            asm.vpop_d8_d15();
        } else {
            asm.vpop_s16_s31();
        }
        asm.pop(&[Reg::R4, Reg::R5, Reg::R6, Reg::Pc]);
    }

    fn set_result(&self, buf: &mut CodeBuffer, value: i32) {
        let mut asm = self.asm(buf);
        if value == -1 {
            asm.mov_minus_one(Reg::R0);
        } else {
            asm.mov_imm32(Reg::R0, value as u32);
        }
    }

    fn jump(&self, buf: &mut CodeBuffer, label: Label) {
        self.asm(buf).b(label);
    }

    fn check_interrupt(&self, buf: &mut CodeBuffer, resume_at: u32, exit: Label) {
        let skip = buf.new_label();
        let mut asm = self.asm(buf);
        asm.ldr(Reg::R0, FRAME, FRAME_32.interrupt);
        asm.ldrb(Reg::R0, Reg::R0, 0);
        asm.cmp_zero(Reg::R0);
        asm.b_cond(Cond::Eq, skip);
        asm.mov_imm32(Reg::R1, resume_at);
        asm.str(Reg::R1, FRAME, FRAME_32.cur_instr);
        asm.mov_minus_one(Reg::R0);
        asm.b(exit);
        buf.bind(skip);
    }

    fn call_fallback(&self, buf: &mut CodeBuffer, index: u32, exit: Label) {
        let mut asm = self.asm(buf);
        asm.mov(Reg::R0, FRAME);
        asm.mov_imm32(Reg::R1, index);
        asm.ldr(Reg::R12, FRAME, FRAME_32.helper);
        asm.blx(Reg::R12);
        asm.cmp_zero(Reg::R0);
        asm.b_cond(Cond::Ne, exit);
    }

    fn branch_unless(&self, buf: &mut CodeBuffer, cond: BranchCond, value: u8, skip: Label) {
        let mut asm = self.asm(buf);
        if let BranchCond::Flags { mask, set } = cond {
            asm.ldr(Reg::R0, FRAME, FRAME_32.status);
            asm.mov_imm32(Reg::R1, mask);
            asm.tst(Reg::R0, Reg::R1);
            asm.b_cond(if set { Cond::Eq } else { Cond::Ne }, skip);
            return;
        }
        asm.vmov_r_s(Reg::R0, value);
        match cond {
            BranchCond::Positive => {
                asm.cmp_zero(Reg::R0);
                asm.b_cond(Cond::Mi, skip);
            }
            BranchCond::Negative => {
                asm.cmp_zero(Reg::R0);
                asm.b_cond(Cond::Pl, skip);
            }
            BranchCond::Zero => {
                asm.lsl1(Reg::R1, Reg::R0);
                asm.cmp_zero(Reg::R1);
                asm.b_cond(Cond::Ne, skip);
            }
            BranchCond::NonZero => {
                asm.lsl1(Reg::R1, Reg::R0);
                asm.cmp_zero(Reg::R1);
                asm.b_cond(Cond::Eq, skip);
                asm.mov_imm32(Reg::R2, NAN_THRESHOLD);
                asm.cmp(Reg::R1, Reg::R2);
                asm.b_cond(Cond::Hi, skip);
            }
            BranchCond::Unordered => {
                asm.lsl1(Reg::R1, Reg::R0);
                asm.mov_imm32(Reg::R2, NAN_THRESHOLD);
                asm.cmp(Reg::R1, Reg::R2);
                asm.b_cond(Cond::Ls, skip);
            }
            BranchCond::Flags { .. } => {}
        }
    }

    fn lower(&self, lw: &mut Lowering<'_, Self>, ins: &Instruction, op: Opcode) -> Result<bool, LmntError> {
        match op {
            Opcode::AssignSS => {
                let a = lw.read(ins.arg1, Width::Scalar, 0)?;
                lw.write(ins.arg3, Width::Scalar, a)?;
            }
            Opcode::AssignIIS => self.constant(lw, int_immediate_bits(ins.arg1, ins.arg2), Width::Scalar, ins.arg3)?,
            Opcode::AssignIBS => self.constant(lw, combine(ins.arg1, ins.arg2), Width::Scalar, ins.arg3)?,
            Opcode::AddSS => self.binary(lw, VfpOp::Add, ins)?,
            Opcode::SubSS => self.binary(lw, VfpOp::Sub, ins)?,
            Opcode::MulSS => self.binary(lw, VfpOp::Mul, ins)?,
            Opcode::DivSS => self.binary(lw, VfpOp::Div, ins)?,
            Opcode::SqrtS | Opcode::AbsS => self.unary(lw, op, ins)?,
            Opcode::MinSS => self.select(lw, false, ins)?,
            Opcode::MaxSS => self.select(lw, true, ins)?,
            Opcode::SumV => self.sum(lw, ins)?,
            Opcode::Cmp => self.compare(lw, ins, false)?,
            Opcode::CmpZ => self.compare(lw, ins, true)?,
            op => {
                if let Some(cond) = BranchCond::of_assign(op) {
                    self.assign_cond(lw, ins, cond)?;
                } else if self.neon() {
                    return self.lower_vector(lw, ins, op);
                } else {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}
