//! AArch64 backend (AAPCS64).
//!
//! X19 holds the frame and X20 the stack base. X16/X17 are temporaries.
//! V8-V15 are partly callee-saved, so the cache uses V0-V7 and V16-V28,
//! with V29-V31 as scratch.

use super::aarch64::{AArch64Assembler, Cond, FpOp, FpUnary, Reg};
use super::codebuf::{CodeBuffer, Label};
use super::compiler::{Backend, BranchCond, Lowering, NAN_THRESHOLD, int_immediate_bits, short_immediate_bits};
use super::helpers::FRAME_64;
use super::regcache::{RegisterFile, Width};
use crate::vm::error::LmntError;
use crate::vm::opcodes::{Instruction, Opcode, combine};

const FRAME: Reg = Reg::X19;
const STACK: Reg = Reg::X20;
const UNITS: u8 = 21;
const SCRATCH: u8 = 29;
/// Largest `ldr s` offset.
const MAX_SCALED: u32 = 16384;

#[derive(Debug, Clone, Copy, Default)]
pub struct AArch64Backend;

impl AArch64Backend {
    /// Emit a stack access, going through X16 when the offset does not fit
    /// the scaled immediate form.
    fn access(&self, buf: &mut CodeBuffer, reg: u8, pos: u16, width: Width, store: bool) {
        let mut asm = AArch64Assembler::new(buf);
        let offset = pos as u32 * 4;
        let direct = match width {
            Width::Scalar => offset < MAX_SCALED,
            Width::Vector => offset % 16 == 0,
        };
        let (base, imm) = if direct {
            (STACK, offset)
        } else {
            asm.add_imm(Reg::X16, STACK, offset >> 12, true);
            asm.add_imm(Reg::X16, Reg::X16, offset & 0xFFF, false);
            (Reg::X16, 0)
        };
        match (width, store) {
            (Width::Scalar, false) => asm.ldr_s(reg, base, imm),
            (Width::Scalar, true) => asm.str_s(reg, base, imm),
            (Width::Vector, false) => asm.ldr_q(reg, base, imm),
            (Width::Vector, true) => asm.str_q(reg, base, imm),
        }
    }

    fn binary(&self, lw: &mut Lowering<'_, Self>, op: FpOp, width: Width, ins: &Instruction) -> Result<(), LmntError> {
        let a = lw.read(ins.arg1, width, 0)?;
        let b = lw.read(ins.arg2, width, 1)?;
        let t = lw.scratch(2, width);
        let mut asm = AArch64Assembler::new(lw.buf());
        match width {
            Width::Scalar => asm.fp_s(op, t, a, b),
            Width::Vector => asm.fp_4s(op, t, a, b),
        }
        lw.write(ins.arg3, width, t)
    }

    fn unary(&self, lw: &mut Lowering<'_, Self>, op: FpUnary, width: Width, ins: &Instruction) -> Result<(), LmntError> {
        let a = lw.read(ins.arg1, width, 0)?;
        let t = lw.scratch(2, width);
        let mut asm = AArch64Assembler::new(lw.buf());
        match width {
            Width::Scalar => asm.unary_s(op, t, a),
            Width::Vector => asm.unary_4s(op, t, a),
        }
        lw.write(ins.arg3, width, t)
    }

    /// Scalar MIN/MAX with the interpreter's NaN behaviour: the second
    /// operand wins only on a strict ordered comparison.
    fn select(&self, lw: &mut Lowering<'_, Self>, max: bool, ins: &Instruction) -> Result<(), LmntError> {
        let a = lw.read(ins.arg1, Width::Scalar, 0)?;
        let b = lw.read(ins.arg2, Width::Scalar, 1)?;
        let t = lw.scratch(2, Width::Scalar);
        let mut asm = AArch64Assembler::new(lw.buf());
        if max {
            asm.fcmp_s(a, b);
        } else {
            asm.fcmp_s(b, a);
        }
        asm.fcsel_s(t, b, a, Cond::Mi);
        lw.write(ins.arg3, Width::Scalar, t)
    }

    fn constant(&self, lw: &mut Lowering<'_, Self>, bits: u32, width: Width, pos: u16) -> Result<(), LmntError> {
        let t = lw.scratch(2, width);
        let mut asm = AArch64Assembler::new(lw.buf());
        asm.mov_imm32(Reg::X16, bits);
        match width {
            Width::Scalar => asm.fmov_s_w(t, Reg::X16),
            Width::Vector => asm.dup_4s_w(t, Reg::X16),
        }
        lw.write(pos, width, t)
    }

    fn sum(&self, lw: &mut Lowering<'_, Self>, ins: &Instruction) -> Result<(), LmntError> {
        let a = lw.read(ins.arg1, Width::Vector, 0)?;
        let t = lw.scratch(2, Width::Scalar);
        let x = lw.scratch(1, Width::Scalar);
        let mut asm = AArch64Assembler::new(lw.buf());
        asm.dup_s_lane(t, a, 0);
        for lane in 1..4 {
            asm.dup_s_lane(x, a, lane);
            asm.fp_s(FpOp::Add, t, t, x);
        }
        lw.write(ins.arg3, Width::Scalar, t)
    }

    fn compare(&self, lw: &mut Lowering<'_, Self>, ins: &Instruction, zero: bool) -> Result<(), LmntError> {
        let a = lw.read(ins.arg1, Width::Scalar, 0)?;
        let b = if zero {
            let z = lw.scratch(1, Width::Scalar);
            AArch64Assembler::new(lw.buf()).fmov_s_w(z, Reg::XZR);
            z
        } else {
            lw.read(ins.arg2, Width::Scalar, 1)?
        };
        let mut asm = AArch64Assembler::new(lw.buf());
        asm.fcmp_s(a, b);
        asm.cset_w(Reg::X16, Cond::Eq);
        asm.cset_w(Reg::X17, Cond::Mi);
        asm.orr_w_lsl(Reg::X16, Reg::X16, Reg::X17, 1);
        asm.cset_w(Reg::X17, Cond::Gt);
        asm.orr_w_lsl(Reg::X16, Reg::X16, Reg::X17, 2);
        asm.cset_w(Reg::X17, Cond::Vs);
        asm.orr_w_lsl(Reg::X16, Reg::X16, Reg::X17, 7);
        asm.str_w(Reg::X16, FRAME, FRAME_64.status);
        Ok(())
    }

    fn assign_cond(&self, lw: &mut Lowering<'_, Self>, ins: &Instruction, cond: BranchCond) -> Result<(), LmntError> {
        let BranchCond::Flags { mask, set } = cond else {
            return Err(LmntError::Internal);
        };
        let t = lw.scratch(2, Width::Scalar);
        let mut asm = AArch64Assembler::new(lw.buf());
        asm.ldr_w(Reg::X16, FRAME, FRAME_64.status);
        asm.mov_imm32(Reg::X17, mask);
        asm.tst_w(Reg::X16, Reg::X17);
        asm.mov_imm32(Reg::X16, short_immediate_bits(ins.arg1));
        asm.mov_imm32(Reg::X17, short_immediate_bits(ins.arg2));
        asm.csel_w(Reg::X16, Reg::X16, Reg::X17, if set { Cond::Ne } else { Cond::Eq });
        asm.fmov_s_w(t, Reg::X16);
        lw.write(ins.arg3, Width::Scalar, t)
    }
}

impl Backend for AArch64Backend {
    fn register_file(&self) -> RegisterFile {
        RegisterFile::flat(UNITS)
    }

    fn phys(&self, unit: u8, _width: Width) -> u8 {
        if unit < 8 { unit } else { unit + 8 }
    }

    fn scratch(&self, index: usize, _width: Width) -> u8 {
        SCRATCH + index as u8
    }

    fn load(&self, buf: &mut CodeBuffer, reg: u8, pos: u16, width: Width) {
        self.access(buf, reg, pos, width, false);
    }

    fn store(&self, buf: &mut CodeBuffer, reg: u8, pos: u16, width: Width) {
        self.access(buf, reg, pos, width, true);
    }

    fn mov(&self, buf: &mut CodeBuffer, dst: u8, src: u8, width: Width) {
        let mut asm = AArch64Assembler::new(buf);
        match width {
            Width::Scalar => asm.ins_s0(dst, src),
            Width::Vector => asm.mov_v(dst, src),
        }
    }

    fn prologue(&self, buf: &mut CodeBuffer, resume: &[(u32, Label)], exit: Label) {
        let body = buf.new_label();
        let mut asm = AArch64Assembler::new(buf);
        asm.stp_pre(Reg::Fp, Reg::Lr, Reg::Sp, -32);
        asm.stp(FRAME, STACK, Reg::Sp, 16);
        asm.add_imm(Reg::Fp, Reg::Sp, 0, false);
        asm.mov(FRAME, Reg::X0);
        asm.ldr_x(STACK, FRAME, FRAME_64.stack);
        if !resume.is_empty() {
            asm.ldr_w(Reg::X16, FRAME, FRAME_64.resume_at);
            asm.cbz_w(Reg::X16, body);
            for &(index, label) in resume {
                asm.mov_imm32(Reg::X17, index);
                asm.cmp_w(Reg::X16, Reg::X17);
                asm.b_cond(Cond::Eq, label);
            }
            asm.mov_imm32(Reg::X0, LmntError::Internal.code() as u32);
            asm.b(exit);
        }
        buf.bind(body);
    }

    fn epilogue(&self, buf: &mut CodeBuffer) {
        let mut asm = AArch64Assembler::new(buf);
        asm.ldp(FRAME, STACK, Reg::Sp, 16);
        asm.ldp_post(Reg::Fp, Reg::Lr, Reg::Sp, 32);
        asm.ret();
    }

    fn set_result(&self, buf: &mut CodeBuffer, value: i32) {
        AArch64Assembler::new(buf).mov_imm32(Reg::X0, value as u32);
    }

    fn jump(&self, buf: &mut CodeBuffer, label: Label) {
        AArch64Assembler::new(buf).b(label);
    }

    fn check_interrupt(&self, buf: &mut CodeBuffer, resume_at: u32, exit: Label) {
        let skip = buf.new_label();
        let mut asm = AArch64Assembler::new(buf);
        asm.ldr_x(Reg::X16, FRAME, FRAME_64.interrupt);
        asm.ldrb(Reg::X16, Reg::X16, 0);
        asm.cbz_w(Reg::X16, skip);
        asm.mov_imm32(Reg::X17, resume_at);
        asm.str_w(Reg::X17, FRAME, FRAME_64.cur_instr);
        asm.mov_imm32(Reg::X0, LmntError::INTERRUPTED as u32);
        asm.b(exit);
        buf.bind(skip);
    }

    fn call_fallback(&self, buf: &mut CodeBuffer, index: u32, exit: Label) {
        let mut asm = AArch64Assembler::new(buf);
        asm.mov(Reg::X0, FRAME);
        asm.mov_imm32(Reg::X1, index);
        asm.ldr_x(Reg::X16, FRAME, FRAME_64.helper);
        asm.blr(Reg::X16);
        asm.cbnz_w(Reg::X0, exit);
    }

    fn branch_unless(&self, buf: &mut CodeBuffer, cond: BranchCond, value: u8, skip: Label) {
        let mut asm = AArch64Assembler::new(buf);
        if let BranchCond::Flags { mask, set } = cond {
            asm.ldr_w(Reg::X16, FRAME, FRAME_64.status);
            asm.mov_imm32(Reg::X17, mask);
            asm.tst_w(Reg::X16, Reg::X17);
            asm.b_cond(if set { Cond::Eq } else { Cond::Ne }, skip);
            return;
        }
        asm.fmov_w_s(Reg::X16, value);
        match cond {
            BranchCond::Positive => {
                asm.tst_w(Reg::X16, Reg::X16);
                asm.b_cond(Cond::Mi, skip);
            }
            BranchCond::Negative => {
                asm.tst_w(Reg::X16, Reg::X16);
                asm.b_cond(Cond::Pl, skip);
            }
            BranchCond::Zero => {
                asm.lsl_w(Reg::X17, Reg::X16, 1);
                asm.cbnz_w(Reg::X17, skip);
            }
            BranchCond::NonZero => {
                asm.lsl_w(Reg::X17, Reg::X16, 1);
                asm.cbz_w(Reg::X17, skip);
                asm.mov_imm32(Reg::X16, NAN_THRESHOLD);
                asm.cmp_w(Reg::X17, Reg::X16);
                asm.b_cond(Cond::Hi, skip);
            }
            BranchCond::Unordered => {
                asm.lsl_w(Reg::X17, Reg::X16, 1);
                asm.mov_imm32(Reg::X16, NAN_THRESHOLD);
                asm.cmp_w(Reg::X17, Reg::X16);
                asm.b_cond(Cond::Ls, skip);
            }
            BranchCond::Flags { .. } => {}
        }
    }

    fn lower(&self, lw: &mut Lowering<'_, Self>, ins: &Instruction, op: Opcode) -> Result<bool, LmntError> {
        use Width::{Scalar, Vector};
        match op {
            Opcode::AssignSS => {
                let a = lw.read(ins.arg1, Scalar, 0)?;
                lw.write(ins.arg3, Scalar, a)?;
            }
            Opcode::AssignVV => {
                let a = lw.read(ins.arg1, Vector, 0)?;
                lw.write(ins.arg3, Vector, a)?;
            }
            Opcode::AssignSV => {
                let a = lw.read(ins.arg1, Scalar, 0)?;
                let t = lw.scratch(2, Vector);
                AArch64Assembler::new(lw.buf()).dup_4s(t, a);
                lw.write(ins.arg3, Vector, t)?;
            }
            Opcode::AssignIIS => self.constant(lw, int_immediate_bits(ins.arg1, ins.arg2), Scalar, ins.arg3)?,
            Opcode::AssignIIV => self.constant(lw, int_immediate_bits(ins.arg1, ins.arg2), Vector, ins.arg3)?,
            Opcode::AssignIBS => self.constant(lw, combine(ins.arg1, ins.arg2), Scalar, ins.arg3)?,
            Opcode::AssignIBV => self.constant(lw, combine(ins.arg1, ins.arg2), Vector, ins.arg3)?,
            Opcode::AddSS => self.binary(lw, FpOp::Add, Scalar, ins)?,
            Opcode::AddVV => self.binary(lw, FpOp::Add, Vector, ins)?,
            Opcode::SubSS => self.binary(lw, FpOp::Sub, Scalar, ins)?,
            Opcode::SubVV => self.binary(lw, FpOp::Sub, Vector, ins)?,
            Opcode::MulSS => self.binary(lw, FpOp::Mul, Scalar, ins)?,
            Opcode::MulVV => self.binary(lw, FpOp::Mul, Vector, ins)?,
            Opcode::DivSS => self.binary(lw, FpOp::Div, Scalar, ins)?,
            Opcode::DivVV => self.binary(lw, FpOp::Div, Vector, ins)?,
            Opcode::SqrtS => self.unary(lw, FpUnary::Sqrt, Scalar, ins)?,
            Opcode::SqrtV => self.unary(lw, FpUnary::Sqrt, Vector, ins)?,
            Opcode::AbsS => self.unary(lw, FpUnary::Abs, Scalar, ins)?,
            Opcode::AbsV => self.unary(lw, FpUnary::Abs, Vector, ins)?,
            Opcode::FloorS => self.unary(lw, FpUnary::RintM, Scalar, ins)?,
            Opcode::FloorV => self.unary(lw, FpUnary::RintM, Vector, ins)?,
            Opcode::CeilS => self.unary(lw, FpUnary::RintP, Scalar, ins)?,
            Opcode::CeilV => self.unary(lw, FpUnary::RintP, Vector, ins)?,
            Opcode::TruncS => self.unary(lw, FpUnary::RintZ, Scalar, ins)?,
            Opcode::TruncV => self.unary(lw, FpUnary::RintZ, Vector, ins)?,
            Opcode::RoundS => self.unary(lw, FpUnary::RintN, Scalar, ins)?,
            Opcode::RoundV => self.unary(lw, FpUnary::RintN, Vector, ins)?,
            Opcode::SumV => self.sum(lw, ins)?,
            Opcode::MinSS => self.select(lw, false, ins)?,
            Opcode::MaxSS => self.select(lw, true, ins)?,
            Opcode::Cmp => self.compare(lw, ins, false)?,
            Opcode::CmpZ => self.compare(lw, ins, true)?,
            op => match BranchCond::of_assign(op) {
                Some(cond) => self.assign_cond(lw, ins, cond)?,
                None => return Ok(false),
            },
        }
        Ok(true)
    }
}
