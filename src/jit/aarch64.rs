//! AArch64 instruction encoding for JIT compilation.
//!
//! Integer forms operate on the 32-bit `W` view unless the name says
//! otherwise; floating point forms use single precision scalars (`S`) or
//! four-lane vectors (`.4S`). FP/SIMD registers are plain numbers 0..32.

use super::codebuf::{CodeBuffer, Fixup, Label};

/// AArch64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    X0 = 0,
    X1 = 1,
    X2 = 2,
    X3 = 3,
    X16 = 16,
    X17 = 17,
    X19 = 19,
    X20 = 20,
    Fp = 29,
    Lr = 30,
    /// Stack pointer or the zero register, depending on the instruction.
    Sp = 31,
}

impl Reg {
    pub const XZR: Reg = Reg::Sp;

    pub fn code(self) -> u32 {
        self as u32
    }
}

/// AArch64 condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    Eq = 0b0000,
    Ne = 0b0001,
    Cs = 0b0010,
    Cc = 0b0011,
    Mi = 0b0100,
    Pl = 0b0101,
    Vs = 0b0110,
    Vc = 0b0111,
    Hi = 0b1000,
    Ls = 0b1001,
    Ge = 0b1010,
    Lt = 0b1011,
    Gt = 0b1100,
    Le = 0b1101,
}

impl Cond {
    pub fn invert(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Cs => Cond::Cc,
            Cond::Cc => Cond::Cs,
            Cond::Mi => Cond::Pl,
            Cond::Pl => Cond::Mi,
            Cond::Vs => Cond::Vc,
            Cond::Vc => Cond::Vs,
            Cond::Hi => Cond::Ls,
            Cond::Ls => Cond::Hi,
            Cond::Ge => Cond::Lt,
            Cond::Lt => Cond::Ge,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
        }
    }
}

/// Three-operand single precision operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Two-operand single precision operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpUnary {
    Sqrt,
    Abs,
    /// Round toward minus infinity (floor).
    RintM,
    /// Round toward plus infinity (ceil).
    RintP,
    /// Round toward zero (trunc).
    RintZ,
    /// Round to nearest, ties to even.
    RintN,
}

/// AArch64 assembler.
pub struct AArch64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> AArch64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    pub fn emit_raw(&mut self, inst: u32) {
        self.buf.emit_u32(inst);
    }

    fn rd_rn(inst: u32, rd: u32, rn: u32) -> u32 {
        inst | ((rn & 0x1F) << 5) | (rd & 0x1F)
    }

    // ==================== Integer ====================

    /// MOV Xd, Xm
    pub fn mov(&mut self, rd: Reg, rm: Reg) {
        self.emit_raw(0xAA0003E0 | (rm.code() << 16) | rd.code());
    }

    /// MOVZ Wd, #imm16, LSL #(16 * shift)
    pub fn movz_w(&mut self, rd: Reg, imm16: u16, shift: u32) {
        self.emit_raw(0x52800000 | ((shift & 1) << 21) | ((imm16 as u32) << 5) | rd.code());
    }

    /// MOVK Wd, #imm16, LSL #(16 * shift)
    pub fn movk_w(&mut self, rd: Reg, imm16: u16, shift: u32) {
        self.emit_raw(0x72800000 | ((shift & 1) << 21) | ((imm16 as u32) << 5) | rd.code());
    }

    /// Load a 32-bit constant into `Wd` with one or two moves.
    pub fn mov_imm32(&mut self, rd: Reg, value: u32) {
        let (lo, hi) = (value as u16, (value >> 16) as u16);
        if hi == 0 {
            self.movz_w(rd, lo, 0);
        } else if lo == 0 {
            self.movz_w(rd, hi, 1);
        } else {
            self.movz_w(rd, lo, 0);
            self.movk_w(rd, hi, 1);
        }
    }

    /// ADD Xd, Xn, #imm12 {, LSL #12}
    pub fn add_imm(&mut self, rd: Reg, rn: Reg, imm12: u32, lsl12: bool) {
        let inst = 0x91000000 | ((lsl12 as u32) << 22) | ((imm12 & 0xFFF) << 10);
        self.emit_raw(Self::rd_rn(inst, rd.code(), rn.code()));
    }

    /// CMP Wn, #imm12
    pub fn cmp_w_imm(&mut self, rn: Reg, imm12: u32) {
        self.emit_raw(0x7100001F | ((imm12 & 0xFFF) << 10) | (rn.code() << 5));
    }

    /// CMP Wn, Wm
    pub fn cmp_w(&mut self, rn: Reg, rm: Reg) {
        self.emit_raw(0x6B00001F | (rm.code() << 16) | (rn.code() << 5));
    }

    /// TST Wn, Wm
    pub fn tst_w(&mut self, rn: Reg, rm: Reg) {
        self.emit_raw(0x6A00001F | (rm.code() << 16) | (rn.code() << 5));
    }

    /// ORR Wd, Wn, Wm, LSL #shift
    pub fn orr_w_lsl(&mut self, rd: Reg, rn: Reg, rm: Reg, shift: u32) {
        let inst = 0x2A000000 | (rm.code() << 16) | ((shift & 0x1F) << 10);
        self.emit_raw(Self::rd_rn(inst, rd.code(), rn.code()));
    }

    /// LSL Wd, Wn, #shift (UBFM alias)
    pub fn lsl_w(&mut self, rd: Reg, rn: Reg, shift: u32) {
        let immr = (32 - shift) % 32;
        let imms = 31 - shift;
        let inst = 0x53000000 | (immr << 16) | (imms << 10);
        self.emit_raw(Self::rd_rn(inst, rd.code(), rn.code()));
    }

    /// CSET Wd, cond
    pub fn cset_w(&mut self, rd: Reg, cond: Cond) {
        self.emit_raw(0x1A9F07E0 | ((cond.invert() as u32) << 12) | rd.code());
    }

    /// CSEL Wd, Wn, Wm, cond
    pub fn csel_w(&mut self, rd: Reg, rn: Reg, rm: Reg, cond: Cond) {
        let inst = 0x1A800000 | (rm.code() << 16) | ((cond as u32) << 12);
        self.emit_raw(Self::rd_rn(inst, rd.code(), rn.code()));
    }

    // ==================== Memory ====================

    /// LDR Xt, [Xn, #imm] (imm a multiple of 8)
    pub fn ldr_x(&mut self, rt: Reg, rn: Reg, imm: u32) {
        self.emit_raw(Self::rd_rn(0xF9400000 | ((imm / 8) << 10), rt.code(), rn.code()));
    }

    /// LDR Wt, [Xn, #imm] (imm a multiple of 4)
    pub fn ldr_w(&mut self, rt: Reg, rn: Reg, imm: u32) {
        self.emit_raw(Self::rd_rn(0xB9400000 | ((imm / 4) << 10), rt.code(), rn.code()));
    }

    /// STR Wt, [Xn, #imm] (imm a multiple of 4)
    pub fn str_w(&mut self, rt: Reg, rn: Reg, imm: u32) {
        self.emit_raw(Self::rd_rn(0xB9000000 | ((imm / 4) << 10), rt.code(), rn.code()));
    }

    /// LDRB Wt, [Xn, #imm]
    pub fn ldrb(&mut self, rt: Reg, rn: Reg, imm: u32) {
        self.emit_raw(Self::rd_rn(0x39400000 | ((imm & 0xFFF) << 10), rt.code(), rn.code()));
    }

    /// STP Xt1, Xt2, [Xn, #imm]! (imm a multiple of 8)
    pub fn stp_pre(&mut self, rt1: Reg, rt2: Reg, rn: Reg, imm: i32) {
        let imm7 = ((imm / 8) as u32) & 0x7F;
        self.emit_raw(0xA9800000 | (imm7 << 15) | (rt2.code() << 10) | (rn.code() << 5) | rt1.code());
    }

    /// LDP Xt1, Xt2, [Xn], #imm (imm a multiple of 8)
    pub fn ldp_post(&mut self, rt1: Reg, rt2: Reg, rn: Reg, imm: i32) {
        let imm7 = ((imm / 8) as u32) & 0x7F;
        self.emit_raw(0xA8C00000 | (imm7 << 15) | (rt2.code() << 10) | (rn.code() << 5) | rt1.code());
    }

    /// STP Xt1, Xt2, [Xn, #imm]
    pub fn stp(&mut self, rt1: Reg, rt2: Reg, rn: Reg, imm: i32) {
        let imm7 = ((imm / 8) as u32) & 0x7F;
        self.emit_raw(0xA9000000 | (imm7 << 15) | (rt2.code() << 10) | (rn.code() << 5) | rt1.code());
    }

    /// LDP Xt1, Xt2, [Xn, #imm]
    pub fn ldp(&mut self, rt1: Reg, rt2: Reg, rn: Reg, imm: i32) {
        let imm7 = ((imm / 8) as u32) & 0x7F;
        self.emit_raw(0xA9400000 | (imm7 << 15) | (rt2.code() << 10) | (rn.code() << 5) | rt1.code());
    }

    /// LDR St, [Xn, #imm] (imm a multiple of 4, below 16384)
    pub fn ldr_s(&mut self, vt: u8, rn: Reg, imm: u32) {
        self.emit_raw(Self::rd_rn(0xBD400000 | ((imm / 4) << 10), vt as u32, rn.code()));
    }

    /// STR St, [Xn, #imm]
    pub fn str_s(&mut self, vt: u8, rn: Reg, imm: u32) {
        self.emit_raw(Self::rd_rn(0xBD000000 | ((imm / 4) << 10), vt as u32, rn.code()));
    }

    /// LDR Qt, [Xn, #imm] (imm a multiple of 16)
    pub fn ldr_q(&mut self, vt: u8, rn: Reg, imm: u32) {
        self.emit_raw(Self::rd_rn(0x3DC00000 | ((imm / 16) << 10), vt as u32, rn.code()));
    }

    /// STR Qt, [Xn, #imm] (imm a multiple of 16)
    pub fn str_q(&mut self, vt: u8, rn: Reg, imm: u32) {
        self.emit_raw(Self::rd_rn(0x3D800000 | ((imm / 16) << 10), vt as u32, rn.code()));
    }

    // ==================== Branches ====================

    pub fn b(&mut self, label: Label) {
        self.buf.add_fixup(self.buf.offset(), label, Fixup::A64Branch26);
        self.emit_raw(0x14000000);
    }

    pub fn b_cond(&mut self, cond: Cond, label: Label) {
        self.buf.add_fixup(self.buf.offset(), label, Fixup::A64Cond19);
        self.emit_raw(0x54000000 | cond as u32);
    }

    /// CBZ Wt, label
    pub fn cbz_w(&mut self, rt: Reg, label: Label) {
        self.buf.add_fixup(self.buf.offset(), label, Fixup::A64Cond19);
        self.emit_raw(0x34000000 | rt.code());
    }

    /// CBNZ Wt, label
    pub fn cbnz_w(&mut self, rt: Reg, label: Label) {
        self.buf.add_fixup(self.buf.offset(), label, Fixup::A64Cond19);
        self.emit_raw(0x35000000 | rt.code());
    }

    pub fn blr(&mut self, rn: Reg) {
        self.emit_raw(0xD63F0000 | (rn.code() << 5));
    }

    pub fn ret(&mut self) {
        self.emit_raw(0xD65F03C0);
    }

    // ==================== Floating point ====================

    /// Scalar `op Sd, Sn, Sm`
    pub fn fp_s(&mut self, op: FpOp, rd: u8, rn: u8, rm: u8) {
        let base = match op {
            FpOp::Mul => 0x1E200800,
            FpOp::Div => 0x1E201800,
            FpOp::Add => 0x1E202800,
            FpOp::Sub => 0x1E203800,
        };
        self.emit_raw(Self::rd_rn(base | ((rm as u32) << 16), rd as u32, rn as u32));
    }

    /// Vector `op Vd.4S, Vn.4S, Vm.4S`
    pub fn fp_4s(&mut self, op: FpOp, rd: u8, rn: u8, rm: u8) {
        let base = match op {
            FpOp::Add => 0x4E20D400,
            FpOp::Sub => 0x4EA0D400,
            FpOp::Mul => 0x6E20DC00,
            FpOp::Div => 0x6E20FC00,
        };
        self.emit_raw(Self::rd_rn(base | ((rm as u32) << 16), rd as u32, rn as u32));
    }

    /// Scalar `op Sd, Sn`
    pub fn unary_s(&mut self, op: FpUnary, rd: u8, rn: u8) {
        let base = match op {
            FpUnary::Abs => 0x1E20C000,
            FpUnary::Sqrt => 0x1E21C000,
            FpUnary::RintN => 0x1E244000,
            FpUnary::RintP => 0x1E24C000,
            FpUnary::RintM => 0x1E254000,
            FpUnary::RintZ => 0x1E25C000,
        };
        self.emit_raw(Self::rd_rn(base, rd as u32, rn as u32));
    }

    /// Vector `op Vd.4S, Vn.4S`
    pub fn unary_4s(&mut self, op: FpUnary, rd: u8, rn: u8) {
        let base = match op {
            FpUnary::Abs => 0x4EA0F800,
            FpUnary::Sqrt => 0x6EA1F800,
            FpUnary::RintN => 0x4E218800,
            FpUnary::RintM => 0x4E219800,
            FpUnary::RintP => 0x4EA18800,
            FpUnary::RintZ => 0x4EA19800,
        };
        self.emit_raw(Self::rd_rn(base, rd as u32, rn as u32));
    }

    /// FMOV Sd, Sn
    pub fn fmov_s(&mut self, rd: u8, rn: u8) {
        self.emit_raw(Self::rd_rn(0x1E204000, rd as u32, rn as u32));
    }

    /// MOV Vd.16B, Vn.16B
    pub fn mov_v(&mut self, rd: u8, rn: u8) {
        self.emit_raw(Self::rd_rn(0x4EA01C00 | ((rn as u32) << 16), rd as u32, rn as u32));
    }

    /// MOV Vd.S[0], Vn.S[0], leaving the other lanes of `rd` alone.
    pub fn ins_s0(&mut self, rd: u8, rn: u8) {
        self.emit_raw(Self::rd_rn(0x6E040400, rd as u32, rn as u32));
    }

    /// MOV Sd, Vn.S[lane]
    pub fn dup_s_lane(&mut self, rd: u8, rn: u8, lane: u32) {
        let imm5 = ((lane & 3) << 3) | 0b100;
        self.emit_raw(Self::rd_rn(0x5E000400 | (imm5 << 16), rd as u32, rn as u32));
    }

    /// DUP Vd.4S, Vn.S[0]
    pub fn dup_4s(&mut self, rd: u8, rn: u8) {
        self.emit_raw(Self::rd_rn(0x4E040400, rd as u32, rn as u32));
    }

    /// DUP Vd.4S, Wn
    pub fn dup_4s_w(&mut self, rd: u8, rn: Reg) {
        self.emit_raw(Self::rd_rn(0x4E040C00, rd as u32, rn.code()));
    }

    /// FMOV Sd, Wn
    pub fn fmov_s_w(&mut self, rd: u8, rn: Reg) {
        self.emit_raw(Self::rd_rn(0x1E270000, rd as u32, rn.code()));
    }

    /// FMOV Wd, Sn
    pub fn fmov_w_s(&mut self, rd: Reg, rn: u8) {
        self.emit_raw(Self::rd_rn(0x1E260000, rd.code(), rn as u32));
    }

    /// FCMP Sn, Sm
    pub fn fcmp_s(&mut self, rn: u8, rm: u8) {
        self.emit_raw(0x1E202000 | ((rm as u32) << 16) | ((rn as u32) << 5));
    }

    /// FCSEL Sd, Sn, Sm, cond
    pub fn fcsel_s(&mut self, rd: u8, rn: u8, rm: u8, cond: Cond) {
        let inst = 0x1E200C00 | ((rm as u32) << 16) | ((cond as u32) << 12);
        self.emit_raw(Self::rd_rn(inst, rd as u32, rn as u32));
    }
}
