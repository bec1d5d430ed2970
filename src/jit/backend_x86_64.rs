//! x86-64 backend.
//!
//! Only SSE2 is assumed. Register use:
//! - RBX: frame pointer, R12: stack base (both callee-saved)
//! - RAX, RCX, RDX: temporaries
//! - XMM: cache units first, then three scratch registers
//!
//! Under the System V ABI every XMM register is volatile, so 13 are cached.
//! Under Win64, XMM6-15 are callee-saved: either cache only XMM0-2, or save
//! XMM6-15 in the prologue and cache XMM0-12.

use super::codebuf::{CodeBuffer, Label};
use super::compiler::{Backend, BranchCond, Lowering, NAN_THRESHOLD, int_immediate_bits, short_immediate_bits};
use super::helpers::FRAME_64;
use super::regcache::{RegisterFile, Width};
use super::x86_64::{Cond, Reg, SseOp, X86_64Assembler};
use crate::vm::error::LmntError;
use crate::vm::opcodes::{Instruction, Opcode};

const FRAME: Reg = Reg::Rbx;
const STACK: Reg = Reg::R12;

/// Win64 shadow space for the helper call.
const SHADOW_SPACE: i32 = 32;
/// XMM6-15 saved under Win64 with non-volatile registers.
const SAVED_XMM: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abi {
    SysV,
    Win64 { nonvolatile: bool },
}

impl Abi {
    /// The calling convention of this host.
    pub fn host(allow_nonvolatile: bool) -> Abi {
        if cfg!(windows) { Abi::Win64 { nonvolatile: allow_nonvolatile } } else { Abi::SysV }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct X86_64Backend {
    abi: Abi,
}

impl X86_64Backend {
    pub fn new(abi: Abi) -> Self {
        X86_64Backend { abi }
    }

    fn cached(&self) -> u8 {
        match self.abi {
            Abi::Win64 { nonvolatile: false } => 3,
            _ => 13,
        }
    }

    fn saves_xmm(&self) -> bool {
        self.abi == Abi::Win64 { nonvolatile: true }
    }

    fn frame_size(&self) -> i32 {
        match self.abi {
            Abi::SysV => 0,
            Abi::Win64 { nonvolatile } => SHADOW_SPACE + if nonvolatile { 16 * SAVED_XMM as i32 } else { 0 },
        }
    }

    fn args(&self) -> (Reg, Reg) {
        match self.abi {
            Abi::SysV => (Reg::Rdi, Reg::Rsi),
            Abi::Win64 { .. } => (Reg::Rcx, Reg::Rdx),
        }
    }

    fn binary(&self, lw: &mut Lowering<'_, Self>, op: SseOp, width: Width, ins: &Instruction) -> Result<(), LmntError> {
        let a = lw.read(ins.arg1, width, 0)?;
        let b = lw.read(ins.arg2, width, 1)?;
        let t = lw.scratch(2, width);
        let mut asm = X86_64Assembler::new(lw.buf());
        asm.movaps_rr(t, a);
        match width {
            Width::Scalar => asm.op_ss(op, t, b),
            Width::Vector => asm.op_ps(op, t, b),
        }
        lw.write(ins.arg3, width, t)
    }

    /// MIN/MAX: `minss b, a` yields `b < a ? b : a`.
    fn select(&self, lw: &mut Lowering<'_, Self>, op: SseOp, width: Width, ins: &Instruction) -> Result<(), LmntError> {
        let a = lw.read(ins.arg1, width, 0)?;
        let b = lw.read(ins.arg2, width, 1)?;
        let t = lw.scratch(2, width);
        let mut asm = X86_64Assembler::new(lw.buf());
        asm.movaps_rr(t, b);
        match width {
            Width::Scalar => asm.op_ss(op, t, a),
            Width::Vector => asm.op_ps(op, t, a),
        }
        lw.write(ins.arg3, width, t)
    }

    fn select_vs(&self, lw: &mut Lowering<'_, Self>, op: SseOp, ins: &Instruction) -> Result<(), LmntError> {
        let a = lw.read(ins.arg1, Width::Vector, 0)?;
        let b = lw.read(ins.arg2, Width::Scalar, 1)?;
        let t = lw.scratch(2, Width::Vector);
        let mut asm = X86_64Assembler::new(lw.buf());
        asm.movaps_rr(t, b);
        asm.shufps(t, t, 0);
        asm.op_ps(op, t, a);
        lw.write(ins.arg3, Width::Vector, t)
    }

    fn unary(&self, lw: &mut Lowering<'_, Self>, op: SseOp, width: Width, ins: &Instruction) -> Result<(), LmntError> {
        let a = lw.read(ins.arg1, width, 0)?;
        let t = lw.scratch(2, width);
        let mut asm = X86_64Assembler::new(lw.buf());
        match width {
            Width::Scalar => asm.op_ss(op, t, a),
            Width::Vector => asm.op_ps(op, t, a),
        }
        lw.write(ins.arg3, width, t)
    }

    fn abs(&self, lw: &mut Lowering<'_, Self>, width: Width, ins: &Instruction) -> Result<(), LmntError> {
        let a = lw.read(ins.arg1, width, 0)?;
        let t = lw.scratch(2, width);
        let mut asm = X86_64Assembler::new(lw.buf());
        asm.mov_r32_imm(Reg::Rax, 0x7FFF_FFFF);
        asm.movd_xmm_r32(t, Reg::Rax);
        asm.shufps(t, t, 0);
        asm.op_ps(SseOp::And, t, a);
        lw.write(ins.arg3, width, t)
    }

    fn constant(&self, lw: &mut Lowering<'_, Self>, bits: u32, width: Width, pos: u16) -> Result<(), LmntError> {
        let t = lw.scratch(2, width);
        let mut asm = X86_64Assembler::new(lw.buf());
        asm.mov_r32_imm(Reg::Rax, bits);
        asm.movd_xmm_r32(t, Reg::Rax);
        if width == Width::Vector {
            asm.shufps(t, t, 0);
        }
        lw.write(pos, width, t)
    }

    /// Lanes are added in order, as the interpreter does.
    fn sum(&self, lw: &mut Lowering<'_, Self>, ins: &Instruction) -> Result<(), LmntError> {
        let a = lw.read(ins.arg1, Width::Vector, 0)?;
        let t = lw.scratch(2, Width::Scalar);
        let x = lw.scratch(1, Width::Scalar);
        let mut asm = X86_64Assembler::new(lw.buf());
        asm.movaps_rr(t, a);
        for lane in [0x55, 0xAA, 0xFF] {
            asm.movaps_rr(x, a);
            asm.shufps(x, x, lane);
            asm.op_ss(SseOp::Add, t, x);
        }
        lw.write(ins.arg3, Width::Scalar, t)
    }

    fn compare(&self, lw: &mut Lowering<'_, Self>, ins: &Instruction, zero: bool) -> Result<(), LmntError> {
        let a = lw.read(ins.arg1, Width::Scalar, 0)?;
        let b = if zero {
            let z = lw.scratch(1, Width::Scalar);
            X86_64Assembler::new(lw.buf()).op_ps(SseOp::Xor, z, z);
            z
        } else {
            lw.read(ins.arg2, Width::Scalar, 1)?
        };
        let mut asm = X86_64Assembler::new(lw.buf());
        asm.xor_r32(Reg::Rax, Reg::Rax);
        asm.xor_r32(Reg::Rcx, Reg::Rcx);
        asm.xor_r32(Reg::Rdx, Reg::Rdx);
        // ZF, PF and CF are all set when unordered.
        asm.ucomiss(a, b);
        asm.setcc(Cond::A, Reg::Rdx);
        asm.setcc(Cond::E, Reg::Rcx);
        asm.cmov_r32(Cond::P, Reg::Rcx, Reg::Rax);
        asm.setcc(Cond::P, Reg::Rax);
        asm.shl_r32_imm(Reg::Rax, 7);
        asm.shl_r32_imm(Reg::Rdx, 2);
        asm.or_r32(Reg::Rax, Reg::Rcx);
        asm.or_r32(Reg::Rax, Reg::Rdx);
        asm.xor_r32(Reg::Rcx, Reg::Rcx);
        asm.ucomiss(b, a);
        asm.setcc(Cond::A, Reg::Rcx);
        asm.shl_r32_imm(Reg::Rcx, 1);
        asm.or_r32(Reg::Rax, Reg::Rcx);
        asm.mov_m32_r(FRAME, FRAME_64.status as i32, Reg::Rax);
        Ok(())
    }

    fn assign_cond(&self, lw: &mut Lowering<'_, Self>, ins: &Instruction, cond: BranchCond) -> Result<(), LmntError> {
        let BranchCond::Flags { mask, set } = cond else {
            return Err(LmntError::Internal);
        };
        let t = lw.scratch(2, Width::Scalar);
        let mut asm = X86_64Assembler::new(lw.buf());
        asm.mov_r32_m(Reg::Rax, FRAME, FRAME_64.status as i32);
        asm.mov_r32_imm(Reg::Rcx, short_immediate_bits(ins.arg2));
        asm.mov_r32_imm(Reg::Rdx, short_immediate_bits(ins.arg1));
        asm.test_r32_imm(Reg::Rax, mask);
        asm.cmov_r32(if set { Cond::Ne } else { Cond::E }, Reg::Rcx, Reg::Rdx);
        asm.movd_xmm_r32(t, Reg::Rcx);
        lw.write(ins.arg3, Width::Scalar, t)
    }
}

fn disp(pos: u16) -> i32 {
    pos as i32 * 4
}

impl Backend for X86_64Backend {
    fn register_file(&self) -> RegisterFile {
        RegisterFile::flat(self.cached())
    }

    fn phys(&self, unit: u8, _width: Width) -> u8 {
        unit
    }

    fn scratch(&self, index: usize, _width: Width) -> u8 {
        self.cached() + index as u8
    }

    fn load(&self, buf: &mut CodeBuffer, reg: u8, pos: u16, width: Width) {
        let mut asm = X86_64Assembler::new(buf);
        match width {
            Width::Scalar => asm.movss_load(reg, STACK, disp(pos)),
            Width::Vector => asm.movups_load(reg, STACK, disp(pos)),
        }
    }

    fn store(&self, buf: &mut CodeBuffer, reg: u8, pos: u16, width: Width) {
        let mut asm = X86_64Assembler::new(buf);
        match width {
            Width::Scalar => asm.movss_store(STACK, disp(pos), reg),
            Width::Vector => asm.movups_store(STACK, disp(pos), reg),
        }
    }

    fn mov(&self, buf: &mut CodeBuffer, dst: u8, src: u8, width: Width) {
        let mut asm = X86_64Assembler::new(buf);
        match width {
            Width::Scalar => asm.movss_rr(dst, src),
            Width::Vector => asm.movaps_rr(dst, src),
        }
    }

    fn prologue(&self, buf: &mut CodeBuffer, resume: &[(u32, Label)], exit: Label) {
        let body = buf.new_label();
        let mut asm = X86_64Assembler::new(buf);
        // Three pushes over the return address keep RSP 16-byte aligned.
        asm.push(Reg::Rbx);
        asm.push(Reg::R12);
        asm.push(Reg::Rbp);
        let size = self.frame_size();
        if size > 0 {
            asm.sub_r64_imm32(Reg::Rsp, size);
        }
        if self.saves_xmm() {
            for i in 0..SAVED_XMM {
                asm.movups_store(Reg::Rsp, SHADOW_SPACE + 16 * i as i32, 6 + i);
            }
        }
        asm.mov_rr(FRAME, self.args().0);
        asm.mov_rm(STACK, FRAME, FRAME_64.stack as i32);
        if !resume.is_empty() {
            asm.mov_r32_m(Reg::Rax, FRAME, FRAME_64.resume_at as i32);
            asm.test_r32(Reg::Rax, Reg::Rax);
            asm.jcc(Cond::E, body);
            for &(index, label) in resume {
                asm.cmp_r32_imm(Reg::Rax, index);
                asm.jcc(Cond::E, label);
            }
            asm.mov_r32_imm(Reg::Rax, LmntError::Internal.code() as u32);
            asm.jmp(exit);
        }
        buf.bind(body);
    }

    fn epilogue(&self, buf: &mut CodeBuffer) {
        let mut asm = X86_64Assembler::new(buf);
        if self.saves_xmm() {
            for i in 0..SAVED_XMM {
                asm.movups_load(6 + i, Reg::Rsp, SHADOW_SPACE + 16 * i as i32);
            }
        }
        let size = self.frame_size();
        if size > 0 {
            asm.add_r64_imm32(Reg::Rsp, size);
        }
        asm.pop(Reg::Rbp);
        asm.pop(Reg::R12);
        asm.pop(Reg::Rbx);
        asm.ret();
    }

    fn set_result(&self, buf: &mut CodeBuffer, value: i32) {
        X86_64Assembler::new(buf).mov_r32_imm(Reg::Rax, value as u32);
    }

    fn jump(&self, buf: &mut CodeBuffer, label: Label) {
        X86_64Assembler::new(buf).jmp(label);
    }

    fn check_interrupt(&self, buf: &mut CodeBuffer, resume_at: u32, exit: Label) {
        let skip = buf.new_label();
        let mut asm = X86_64Assembler::new(buf);
        asm.mov_rm(Reg::Rax, FRAME, FRAME_64.interrupt as i32);
        asm.cmp_m8_imm(Reg::Rax, 0, 0);
        asm.jcc(Cond::E, skip);
        asm.mov_m32_imm(FRAME, FRAME_64.cur_instr as i32, resume_at);
        asm.mov_r32_imm(Reg::Rax, LmntError::INTERRUPTED as u32);
        asm.jmp(exit);
        buf.bind(skip);
    }

    fn call_fallback(&self, buf: &mut CodeBuffer, index: u32, exit: Label) {
        let (frame_arg, index_arg) = self.args();
        let mut asm = X86_64Assembler::new(buf);
        asm.mov_rr(frame_arg, FRAME);
        asm.mov_r32_imm(index_arg, index);
        asm.mov_rm(Reg::Rax, FRAME, FRAME_64.helper as i32);
        asm.call_r(Reg::Rax);
        asm.test_r32(Reg::Rax, Reg::Rax);
        asm.jcc(Cond::Ne, exit);
    }

    fn branch_unless(&self, buf: &mut CodeBuffer, cond: BranchCond, value: u8, skip: Label) {
        let mut asm = X86_64Assembler::new(buf);
        if let BranchCond::Flags { mask, set } = cond {
            asm.mov_r32_m(Reg::Rax, FRAME, FRAME_64.status as i32);
            asm.test_r32_imm(Reg::Rax, mask);
            asm.jcc(if set { Cond::E } else { Cond::Ne }, skip);
            return;
        }
        asm.movd_r32_xmm(Reg::Rax, value);
        match cond {
            BranchCond::Positive => {
                asm.test_r32(Reg::Rax, Reg::Rax);
                asm.jcc(Cond::S, skip);
            }
            BranchCond::Negative => {
                asm.test_r32(Reg::Rax, Reg::Rax);
                asm.jcc(Cond::Ns, skip);
            }
            // The remaining tests look at the bits without the sign.
            BranchCond::Zero => {
                asm.shl_r32_imm(Reg::Rax, 1);
                asm.jcc(Cond::Ne, skip);
            }
            BranchCond::NonZero => {
                asm.shl_r32_imm(Reg::Rax, 1);
                asm.jcc(Cond::E, skip);
                asm.cmp_r32_imm(Reg::Rax, NAN_THRESHOLD);
                asm.jcc(Cond::A, skip);
            }
            BranchCond::Unordered => {
                asm.shl_r32_imm(Reg::Rax, 1);
                asm.cmp_r32_imm(Reg::Rax, NAN_THRESHOLD);
                asm.jcc(Cond::Be, skip);
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
                let mut asm = X86_64Assembler::new(lw.buf());
                asm.movaps_rr(t, a);
                asm.shufps(t, t, 0);
                lw.write(ins.arg3, Vector, t)?;
            }
            Opcode::AssignIIS => self.constant(lw, int_immediate_bits(ins.arg1, ins.arg2), Scalar, ins.arg3)?,
            Opcode::AssignIIV => self.constant(lw, int_immediate_bits(ins.arg1, ins.arg2), Vector, ins.arg3)?,
            Opcode::AssignIBS => self.constant(lw, crate::vm::opcodes::combine(ins.arg1, ins.arg2), Scalar, ins.arg3)?,
            Opcode::AssignIBV => self.constant(lw, crate::vm::opcodes::combine(ins.arg1, ins.arg2), Vector, ins.arg3)?,
            Opcode::AddSS => self.binary(lw, SseOp::Add, Scalar, ins)?,
            Opcode::AddVV => self.binary(lw, SseOp::Add, Vector, ins)?,
            Opcode::SubSS => self.binary(lw, SseOp::Sub, Scalar, ins)?,
            Opcode::SubVV => self.binary(lw, SseOp::Sub, Vector, ins)?,
            Opcode::MulSS => self.binary(lw, SseOp::Mul, Scalar, ins)?,
            Opcode::MulVV => self.binary(lw, SseOp::Mul, Vector, ins)?,
            Opcode::DivSS => self.binary(lw, SseOp::Div, Scalar, ins)?,
            Opcode::DivVV => self.binary(lw, SseOp::Div, Vector, ins)?,
            Opcode::SqrtS => self.unary(lw, SseOp::Sqrt, Scalar, ins)?,
            Opcode::SqrtV => self.unary(lw, SseOp::Sqrt, Vector, ins)?,
            Opcode::AbsS => self.abs(lw, Scalar, ins)?,
            Opcode::AbsV => self.abs(lw, Vector, ins)?,
            Opcode::SumV => self.sum(lw, ins)?,
            Opcode::MinSS => self.select(lw, SseOp::Min, Scalar, ins)?,
            Opcode::MinVV => self.select(lw, SseOp::Min, Vector, ins)?,
            Opcode::MaxSS => self.select(lw, SseOp::Max, Scalar, ins)?,
            Opcode::MaxVV => self.select(lw, SseOp::Max, Vector, ins)?,
            Opcode::MinVS => self.select_vs(lw, SseOp::Min, ins)?,
            Opcode::MaxVS => self.select_vs(lw, SseOp::Max, ins)?,
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
