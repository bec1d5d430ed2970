//! ARMv7 instruction encoding for JIT compilation.
//!
//! One assembler serves both instruction sets: ARMv7-A code is emitted as
//! A32, ARMv7-M code as Thumb-2. VFP instructions share their bit layout
//! between the two (the A32 form with the `AL` condition), so only the
//! integer forms are encoded twice. NEON is available in A32 mode only.

use super::codebuf::{CodeBuffer, Fixup, Label};

/// ARM core registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    R0 = 0,
    R1 = 1,
    R2 = 2,
    R3 = 3,
    R4 = 4,
    R5 = 5,
    R6 = 6,
    R12 = 12,
    Sp = 13,
    Lr = 14,
    Pc = 15,
}

impl Reg {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// ARM condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    Eq = 0x0,
    Ne = 0x1,
    Hs = 0x2,
    Lo = 0x3,
    Mi = 0x4,
    Pl = 0x5,
    Vs = 0x6,
    Vc = 0x7,
    Hi = 0x8,
    Ls = 0x9,
    Ge = 0xA,
    Lt = 0xB,
    Gt = 0xC,
    Le = 0xD,
    Al = 0xE,
}

/// Instruction set to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// A32, used for ARMv7-A.
    Arm,
    /// Thumb-2, used for ARMv7-M.
    Thumb,
}

/// VFP single precision binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfpOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Split an S register number into its (Vx, bit) fields.
fn sreg(s: u8) -> (u32, u32) {
    ((s as u32) >> 1, (s as u32) & 1)
}

/// D register number of a Q register, as (Vx, bit) fields.
fn qreg(q: u8) -> (u32, u32) {
    let d = 2 * q as u32;
    (d & 0xF, d >> 4)
}

/// ARMv7 assembler.
pub struct Armv7Assembler<'a> {
    buf: &'a mut CodeBuffer,
    mode: Mode,
}

impl<'a> Armv7Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer, mode: Mode) -> Self {
        Self { buf, mode }
    }

    /// Emit a 32-bit instruction: a little-endian word in A32, two
    /// halfwords (high first) in Thumb-2.
    fn word(&mut self, inst: u32) {
        match self.mode {
            Mode::Arm => self.buf.emit_u32(inst),
            Mode::Thumb => {
                self.buf.emit_u16((inst >> 16) as u16);
                self.buf.emit_u16(inst as u16);
            }
        }
    }

    fn thumb(&mut self, hw1: u32, hw2: u32) {
        self.buf.emit_u16(hw1 as u16);
        self.buf.emit_u16(hw2 as u16);
    }

    // ==================== Integer ====================

    /// PUSH {regs}
    pub fn push(&mut self, regs: &[Reg]) {
        let list = regs.iter().fold(0, |acc, r| acc | r.bit());
        match self.mode {
            Mode::Arm => self.word(0xE92D0000 | list),
            Mode::Thumb => self.thumb(0xE92D, list),
        }
    }

    /// POP {regs}
    pub fn pop(&mut self, regs: &[Reg]) {
        let list = regs.iter().fold(0, |acc, r| acc | r.bit());
        match self.mode {
            Mode::Arm => self.word(0xE8BD0000 | list),
            Mode::Thumb => self.thumb(0xE8BD, list),
        }
    }

    /// MOV Rd, Rm
    pub fn mov(&mut self, rd: Reg, rm: Reg) {
        match self.mode {
            Mode::Arm => self.word(0xE1A00000 | (rd.code() << 12) | rm.code()),
            Mode::Thumb => {
                let d = rd.code();
                self.buf.emit_u16((0x4600 | ((d >> 3) << 7) | (rm.code() << 3) | (d & 7)) as u16);
            }
        }
    }

    fn movw_movt(&mut self, top: bool, rd: Reg, imm16: u16) {
        let imm = imm16 as u32;
        match self.mode {
            Mode::Arm => {
                let base = if top { 0xE3400000 } else { 0xE3000000 };
                self.word(base | ((imm >> 12) << 16) | (rd.code() << 12) | (imm & 0xFFF));
            }
            Mode::Thumb => {
                let base = if top { 0xF2C0 } else { 0xF240 };
                let hw1 = base | (((imm >> 11) & 1) << 10) | (imm >> 12);
                let hw2 = (((imm >> 8) & 7) << 12) | (rd.code() << 8) | (imm & 0xFF);
                self.thumb(hw1, hw2);
            }
        }
    }

    /// MOVW Rd, #imm16
    pub fn movw(&mut self, rd: Reg, imm16: u16) {
        self.movw_movt(false, rd, imm16);
    }

    /// MOVT Rd, #imm16
    pub fn movt(&mut self, rd: Reg, imm16: u16) {
        self.movw_movt(true, rd, imm16);
    }

    /// Load a 32-bit constant with MOVW (+MOVT).
    pub fn mov_imm32(&mut self, rd: Reg, value: u32) {
        self.movw(rd, value as u16);
        if value >> 16 != 0 {
            self.movt(rd, (value >> 16) as u16);
        }
    }

    /// MVN Rd, #0 (all ones)
    pub fn mov_minus_one(&mut self, rd: Reg) {
        match self.mode {
            Mode::Arm => self.word(0xE3E00000 | (rd.code() << 12)),
            Mode::Thumb => self.thumb(0xF06F, rd.code() << 8),
        }
    }

    fn mem_imm(&mut self, arm: u32, thumb: u32, rt: Reg, rn: Reg, imm: u32) {
        match self.mode {
            Mode::Arm => self.word(arm | (rn.code() << 16) | (rt.code() << 12) | (imm & 0xFFF)),
            Mode::Thumb => self.thumb(thumb | rn.code(), (rt.code() << 12) | (imm & 0xFFF)),
        }
    }

    /// LDR Rt, [Rn, #imm12]
    pub fn ldr(&mut self, rt: Reg, rn: Reg, imm: u32) {
        self.mem_imm(0xE5900000, 0xF8D0, rt, rn, imm);
    }

    /// STR Rt, [Rn, #imm12]
    pub fn str(&mut self, rt: Reg, rn: Reg, imm: u32) {
        self.mem_imm(0xE5800000, 0xF8C0, rt, rn, imm);
    }

    /// LDRB Rt, [Rn, #imm12]
    pub fn ldrb(&mut self, rt: Reg, rn: Reg, imm: u32) {
        self.mem_imm(0xE5D00000, 0xF890, rt, rn, imm);
    }

    /// ADD Rd, Rn, Rm
    pub fn add(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        match self.mode {
            Mode::Arm => self.word(0xE0800000 | (rn.code() << 16) | (rd.code() << 12) | rm.code()),
            Mode::Thumb => self.thumb(0xEB00 | rn.code(), (rd.code() << 8) | rm.code()),
        }
    }

    /// CMP Rn, #0
    pub fn cmp_zero(&mut self, rn: Reg) {
        match self.mode {
            Mode::Arm => self.word(0xE3500000 | (rn.code() << 16)),
            Mode::Thumb => self.thumb(0xF1B0 | rn.code(), 0x0F00),
        }
    }

    /// CMP Rn, Rm
    pub fn cmp(&mut self, rn: Reg, rm: Reg) {
        match self.mode {
            Mode::Arm => self.word(0xE1500000 | (rn.code() << 16) | rm.code()),
            Mode::Thumb => self.thumb(0xEBB0 | rn.code(), 0x0F00 | rm.code()),
        }
    }

    /// TST Rn, Rm
    pub fn tst(&mut self, rn: Reg, rm: Reg) {
        match self.mode {
            Mode::Arm => self.word(0xE1100000 | (rn.code() << 16) | rm.code()),
            Mode::Thumb => self.thumb(0xEA10 | rn.code(), 0x0F00 | rm.code()),
        }
    }

    /// ORR<cond> Rd, Rn, #imm8 (an IT block in Thumb-2)
    pub fn orr_imm_cond(&mut self, cond: Cond, rd: Reg, rn: Reg, imm8: u8) {
        match self.mode {
            Mode::Arm => {
                let inst = ((cond as u32) << 28) | 0x03800000 | (rn.code() << 16) | (rd.code() << 12);
                self.word(inst | imm8 as u32);
            }
            Mode::Thumb => {
                if cond != Cond::Al {
                    self.it(cond);
                }
                self.thumb(0xF040 | rn.code(), (rd.code() << 8) | imm8 as u32);
            }
        }
    }

    /// LSL Rd, Rm, #1
    pub fn lsl1(&mut self, rd: Reg, rm: Reg) {
        match self.mode {
            Mode::Arm => self.word(0xE1A00080 | (rd.code() << 12) | rm.code()),
            Mode::Thumb => self.thumb(0xEA4F, (rd.code() << 8) | 0x40 | rm.code()),
        }
    }

    /// IT <cond> covering one instruction (Thumb-2 only).
    pub fn it(&mut self, cond: Cond) {
        self.buf.emit_u16(0xBF08 | ((cond as u16) << 4));
    }

    /// BLX Rm
    pub fn blx(&mut self, rm: Reg) {
        match self.mode {
            Mode::Arm => self.word(0xE12FFF30 | rm.code()),
            Mode::Thumb => self.buf.emit_u16((0x4780 | (rm.code() << 3)) as u16),
        }
    }

    /// B<cond> label
    pub fn b_cond(&mut self, cond: Cond, label: Label) {
        let at = self.buf.offset();
        match self.mode {
            Mode::Arm => {
                self.buf.add_fixup(at, label, Fixup::A32Branch24);
                self.word(((cond as u32) << 28) | 0x0A000000);
            }
            Mode::Thumb if cond == Cond::Al => {
                self.buf.add_fixup(at, label, Fixup::T32Branch24);
                self.thumb(0xF000, 0xB800);
            }
            Mode::Thumb => {
                self.buf.add_fixup(at, label, Fixup::T32Cond20);
                self.thumb(0xF000 | ((cond as u32) << 6), 0x8000);
            }
        }
    }

    /// B label
    pub fn b(&mut self, label: Label) {
        self.b_cond(Cond::Al, label);
    }

    // ==================== VFP ====================

    /// `op.F32 Sd, Sn, Sm`
    pub fn vfp(&mut self, op: VfpOp, sd: u8, sn: u8, sm: u8) {
        let base = match op {
            VfpOp::Add => 0xEE300A00,
            VfpOp::Sub => 0xEE300A40,
            VfpOp::Mul => 0xEE200A00,
            VfpOp::Div => 0xEE800A00,
        };
        let (vd, d) = sreg(sd);
        let (vn, n) = sreg(sn);
        let (vm, m) = sreg(sm);
        self.word(base | (d << 22) | (vn << 16) | (vd << 12) | (n << 7) | (m << 5) | vm);
    }

    fn vfp_unary(&mut self, base: u32, sd: u8, sm: u8) {
        let (vd, d) = sreg(sd);
        let (vm, m) = sreg(sm);
        self.word(base | (d << 22) | (vd << 12) | (m << 5) | vm);
    }

    /// VMOV.F32 Sd, Sm
    pub fn vmov_s(&mut self, sd: u8, sm: u8) {
        self.vfp_unary(0xEEB00A40, sd, sm);
    }

    /// VABS.F32 Sd, Sm
    pub fn vabs_s(&mut self, sd: u8, sm: u8) {
        self.vfp_unary(0xEEB00AC0, sd, sm);
    }

    /// VSQRT.F32 Sd, Sm
    pub fn vsqrt_s(&mut self, sd: u8, sm: u8) {
        self.vfp_unary(0xEEB10AC0, sd, sm);
    }

    /// VCMP.F32 Sd, Sm (quiet)
    pub fn vcmp_s(&mut self, sd: u8, sm: u8) {
        self.vfp_unary(0xEEB40A40, sd, sm);
    }

    /// VMRS APSR_nzcv, FPSCR
    pub fn vmrs_flags(&mut self) {
        self.word(0xEEF1FA10);
    }

    /// VMOV Sn, Rt
    pub fn vmov_s_r(&mut self, sn: u8, rt: Reg) {
        let (vn, n) = sreg(sn);
        self.word(0xEE000A10 | (vn << 16) | (rt.code() << 12) | (n << 7));
    }

    /// VMOV Rt, Sn
    pub fn vmov_r_s(&mut self, rt: Reg, sn: u8) {
        let (vn, n) = sreg(sn);
        self.word(0xEE100A10 | (vn << 16) | (rt.code() << 12) | (n << 7));
    }

    /// VLDR Sd, [Rn, #imm] (imm a multiple of 4, below 1024)
    pub fn vldr_s(&mut self, sd: u8, rn: Reg, imm: u32) {
        let (vd, d) = sreg(sd);
        self.word(0xED900A00 | (d << 22) | (rn.code() << 16) | (vd << 12) | ((imm / 4) & 0xFF));
    }

    /// VSTR Sd, [Rn, #imm] (imm a multiple of 4, below 1024)
    pub fn vstr_s(&mut self, sd: u8, rn: Reg, imm: u32) {
        let (vd, d) = sreg(sd);
        self.word(0xED800A00 | (d << 22) | (rn.code() << 16) | (vd << 12) | ((imm / 4) & 0xFF));
    }

    /// VPUSH {d8-d15}
    pub fn vpush_d8_d15(&mut self) {
        self.word(0xED2D8B10);
    }

    /// VPOP {d8-d15}
    pub fn vpop_d8_d15(&mut self) {
        self.word(0xECBD8B10);
    }

    /// VPUSH {s16-s31}
    pub fn vpush_s16_s31(&mut self) {
        self.word(0xED2D8A10);
    }

    /// VPOP {s16-s31}
    pub fn vpop_s16_s31(&mut self) {
        self.word(0xECBD8A10);
    }

    // ==================== NEON (A32 only) ====================

    fn neon3(&mut self, base: u32, qd: u8, qn: u8, qm: u8) {
        let (vd, d) = qreg(qd);
        let (vn, n) = qreg(qn);
        let (vm, m) = qreg(qm);
        self.word(base | (d << 22) | (vn << 16) | (vd << 12) | (n << 7) | (m << 5) | vm);
    }

    /// VADD.F32 Qd, Qn, Qm
    pub fn vadd_q(&mut self, qd: u8, qn: u8, qm: u8) {
        self.neon3(0xF2000D40, qd, qn, qm);
    }

    /// VSUB.F32 Qd, Qn, Qm
    pub fn vsub_q(&mut self, qd: u8, qn: u8, qm: u8) {
        self.neon3(0xF2200D40, qd, qn, qm);
    }

    /// VMUL.F32 Qd, Qn, Qm
    pub fn vmul_q(&mut self, qd: u8, qn: u8, qm: u8) {
        self.neon3(0xF3000D50, qd, qn, qm);
    }

    /// VMOV Qd, Qm (VORR)
    pub fn vmov_q(&mut self, qd: u8, qm: u8) {
        self.neon3(0xF2200150, qd, qm, qm);
    }

    /// VABS.F32 Qd, Qm
    pub fn vabs_q(&mut self, qd: u8, qm: u8) {
        let (vd, d) = qreg(qd);
        let (vm, m) = qreg(qm);
        self.word(0xF3B90740 | (d << 22) | (vd << 12) | (m << 5) | vm);
    }

    /// VDUP.32 Qd, Sm (as a D register lane)
    pub fn vdup_q_s(&mut self, qd: u8, sm: u8) {
        let (vd, d) = qreg(qd);
        let dm = (sm / 2) as u32;
        let imm4 = (((sm % 2) as u32) << 3) | 0b0100;
        self.word(0xF3B00C40 | (d << 22) | (imm4 << 16) | (vd << 12) | ((dm >> 4) << 5) | (dm & 0xF));
    }

    /// VLD1.32 {Qd}, [Rn]
    pub fn vld1_q(&mut self, qd: u8, rn: Reg) {
        let (vd, d) = qreg(qd);
        self.word(0xF4200A8F | (d << 22) | (rn.code() << 16) | (vd << 12));
    }

    /// VST1.32 {Qd}, [Rn]
    pub fn vst1_q(&mut self, qd: u8, rn: Reg) {
        let (vd, d) = qreg(qd);
        self.word(0xF4000A8F | (d << 22) | (rn.code() << 16) | (vd << 12));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(mode: Mode, f: impl FnOnce(&mut Armv7Assembler<'_>)) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        f(&mut Armv7Assembler::new(&mut buf, mode));
        buf.code().to_vec()
    }

    fn words(bytes: &[u8]) -> Vec<u32> {
        bytes.chunks(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()
    }

    #[test]
    fn test_push_pop_arm() {
        let code = assemble(Mode::Arm, |a| {
            a.push(&[Reg::R4, Reg::R5, Reg::R6, Reg::Lr]);
            a.pop(&[Reg::R4, Reg::R5, Reg::R6, Reg::Pc]);
        });
        assert_eq!(words(&code), [0xE92D4070, 0xE8BD8070]);
    }

    #[test]
    fn test_push_thumb() {
        let code = assemble(Mode::Thumb, |a| a.push(&[Reg::R4, Reg::Lr]));
        assert_eq!(code, [0x2D, 0xE9, 0x10, 0x40]);
    }

    #[test]
    fn test_vfp_same_bits_both_modes() {
        // vadd.f32 s0, s1, s2
        let arm = assemble(Mode::Arm, |a| a.vfp(VfpOp::Add, 0, 1, 2));
        assert_eq!(words(&arm), [0xEE300A81]);
        let thumb = assemble(Mode::Thumb, |a| a.vfp(VfpOp::Add, 0, 1, 2));
        assert_eq!(thumb, [0x30, 0xEE, 0x81, 0x0A]);
    }

    #[test]
    fn test_vldr() {
        // vldr s0, [r5, #8]
        assert_eq!(words(&assemble(Mode::Arm, |a| a.vldr_s(0, Reg::R5, 8))), [0xED950A02]);
        assert_eq!(words(&assemble(Mode::Arm, |a| a.vmrs_flags())), [0xEEF1FA10]);
    }

    #[test]
    fn test_movw() {
        assert_eq!(words(&assemble(Mode::Arm, |a| a.movw(Reg::R0, 0x1234))), [0xE3010234]);
        assert_eq!(assemble(Mode::Thumb, |a| a.movw(Reg::R0, 0x1234)), [0x41, 0xF2, 0x34, 0x20]);
    }

    #[test]
    fn test_blx() {
        assert_eq!(words(&assemble(Mode::Arm, |a| a.blx(Reg::R2))), [0xE12FFF32]);
        assert_eq!(assemble(Mode::Thumb, |a| a.blx(Reg::R2)), [0x90, 0x47]);
    }

    #[test]
    fn test_fp_register_saves() {
        assert_eq!(words(&assemble(Mode::Arm, |a| a.vpush_d8_d15())), [0xED2D8B10]);
        assert_eq!(words(&assemble(Mode::Arm, |a| a.vpush_s16_s31())), [0xED2D8A10]);
    }

    #[test]
    fn test_neon_add() {
        // vadd.f32 q0, q1, q2
        assert_eq!(words(&assemble(Mode::Arm, |a| a.vadd_q(0, 1, 2))), [0xF2020D44]);
    }

    #[test]
    fn test_conditional_branch_arm() {
        let mut buf = CodeBuffer::new();
        let label = buf.new_label();
        buf.bind(label);
        Armv7Assembler::new(&mut buf, Mode::Arm).b_cond(Cond::Ne, label);
        let code = buf.finish().unwrap();
        assert_eq!(words(&code), [0x1AFFFFFE]);
    }
}
