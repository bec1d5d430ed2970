//! x86-64 instruction encoding for JIT compilation.
//!
//! Only the general purpose and SSE/SSE2 forms the backend needs are
//! provided. Everything stays within the x86-64 baseline, so the emitted
//! code runs on any 64-bit x86 CPU.

use super::codebuf::{CodeBuffer, Label};

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Register code (lower 3 bits).
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    pub fn index(self) -> u8 {
        self as u8
    }
}

/// Condition codes (for Jcc, SETcc, CMOVcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl Cond {
    pub fn invert(self) -> Self {
        // Conditions come in pairs differing in the lowest bit.
        match self as u8 ^ 1 {
            0x0 => Cond::O,
            0x1 => Cond::No,
            0x2 => Cond::B,
            0x3 => Cond::Ae,
            0x4 => Cond::E,
            0x5 => Cond::Ne,
            0x6 => Cond::Be,
            0x7 => Cond::A,
            0x8 => Cond::S,
            0x9 => Cond::Ns,
            0xA => Cond::P,
            0xB => Cond::Np,
            0xC => Cond::L,
            0xD => Cond::Ge,
            0xE => Cond::Le,
            _ => Cond::G,
        }
    }
}

/// Single-precision SSE operations sharing the `0F xx /r` layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SseOp {
    Sqrt = 0x51,
    And = 0x54,
    Xor = 0x57,
    Add = 0x58,
    Mul = 0x59,
    Sub = 0x5C,
    Min = 0x5D,
    Div = 0x5E,
    Max = 0x5F,
}

/// x86-64 assembler.
pub struct X86_64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86_64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    // ==================== Prefix and operand helpers ====================

    /// Emit a REX prefix when any bit is needed, or always with `force`
    /// (byte registers 4..8 mean SPL..DIL only under REX).
    fn rex(&mut self, w: bool, reg: u8, rm: u8, force: bool) {
        let rex = 0x40 | ((w as u8) << 3) | (((reg >> 3) & 1) << 2) | ((rm >> 3) & 1);
        if rex != 0x40 || force {
            self.buf.emit_u8(rex);
        }
    }

    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// ModR/M (+SIB) and displacement for `[base + disp]`.
    fn mem(&mut self, reg: u8, base: Reg, disp: i32) {
        let rm = base.code();
        let mode = if disp == 0 && rm != 0b101 {
            0b00
        } else if (-128..=127).contains(&disp) {
            0b01
        } else {
            0b10
        };
        self.buf.emit_u8(Self::modrm(mode, reg, rm));
        if rm == 0b100 {
            // RSP/R12 as base needs a SIB byte with no index
            self.buf.emit_u8(0x24);
        }
        match mode {
            0b01 => self.buf.emit_u8(disp as u8),
            0b10 => self.buf.emit_u32(disp as u32),
            _ => {}
        }
    }

    // ==================== Data Movement ====================

    pub fn push(&mut self, reg: Reg) {
        self.rex(false, 0, reg.index(), false);
        self.buf.emit_u8(0x50 + reg.code());
    }

    pub fn pop(&mut self, reg: Reg) {
        self.rex(false, 0, reg.index(), false);
        self.buf.emit_u8(0x58 + reg.code());
    }

    /// MOV r64, r64
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.rex(true, src.index(), dst.index(), false);
        self.buf.emit_u8(0x89);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// MOV r64, imm64
    pub fn mov_ri64(&mut self, dst: Reg, imm: i64) {
        self.rex(true, 0, dst.index(), false);
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u64(imm as u64);
    }

    /// MOV r32, imm32 (zero-extends into the full register)
    pub fn mov_r32_imm(&mut self, dst: Reg, imm: u32) {
        self.rex(false, 0, dst.index(), false);
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u32(imm);
    }

    /// MOV r64, [base + disp]
    pub fn mov_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(true, dst.index(), base.index(), false);
        self.buf.emit_u8(0x8B);
        self.mem(dst.index(), base, disp);
    }

    /// MOV r32, [base + disp]
    pub fn mov_r32_m(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(false, dst.index(), base.index(), false);
        self.buf.emit_u8(0x8B);
        self.mem(dst.index(), base, disp);
    }

    /// MOV [base + disp], r32
    pub fn mov_m32_r(&mut self, base: Reg, disp: i32, src: Reg) {
        self.rex(false, src.index(), base.index(), false);
        self.buf.emit_u8(0x89);
        self.mem(src.index(), base, disp);
    }

    /// MOV dword [base + disp], imm32
    pub fn mov_m32_imm(&mut self, base: Reg, disp: i32, imm: u32) {
        self.rex(false, 0, base.index(), false);
        self.buf.emit_u8(0xC7);
        self.mem(0, base, disp);
        self.buf.emit_u32(imm);
    }

    /// MOVZX r32, r8
    pub fn movzx_r32_r8(&mut self, dst: Reg, src: Reg) {
        self.rex(false, dst.index(), src.index(), src.index() >= 4);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB6);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// CMOVcc r32, r32
    pub fn cmov_r32(&mut self, cond: Cond, dst: Reg, src: Reg) {
        self.rex(false, dst.index(), src.index(), false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x40 + cond as u8);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    // ==================== Integer Arithmetic ====================

    /// Group-1 ALU op with a 32-bit immediate (`81 /ext id`).
    fn alu_r32_imm(&mut self, ext: u8, dst: Reg, imm: u32) {
        self.rex(false, 0, dst.index(), false);
        self.buf.emit_u8(0x81);
        self.buf.emit_u8(Self::modrm(0b11, ext, dst.code()));
        self.buf.emit_u32(imm);
    }

    pub fn and_r32_imm(&mut self, dst: Reg, imm: u32) {
        self.alu_r32_imm(4, dst, imm);
    }

    pub fn cmp_r32_imm(&mut self, dst: Reg, imm: u32) {
        self.alu_r32_imm(7, dst, imm);
    }

    /// XOR r32, r32
    pub fn xor_r32(&mut self, dst: Reg, src: Reg) {
        self.rex(false, src.index(), dst.index(), false);
        self.buf.emit_u8(0x31);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// OR r32, r32
    pub fn or_r32(&mut self, dst: Reg, src: Reg) {
        self.rex(false, src.index(), dst.index(), false);
        self.buf.emit_u8(0x09);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// TEST r32, r32
    pub fn test_r32(&mut self, a: Reg, b: Reg) {
        self.rex(false, b.index(), a.index(), false);
        self.buf.emit_u8(0x85);
        self.buf.emit_u8(Self::modrm(0b11, b.code(), a.code()));
    }

    /// TEST r32, imm32
    pub fn test_r32_imm(&mut self, dst: Reg, imm: u32) {
        self.rex(false, 0, dst.index(), false);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
        self.buf.emit_u32(imm);
    }

    /// SHL r32, imm8
    pub fn shl_r32_imm(&mut self, dst: Reg, imm: u8) {
        self.rex(false, 0, dst.index(), false);
        self.buf.emit_u8(0xC1);
        self.buf.emit_u8(Self::modrm(0b11, 4, dst.code()));
        self.buf.emit_u8(imm);
    }

    /// CMP byte [base + disp], imm8
    pub fn cmp_m8_imm(&mut self, base: Reg, disp: i32, imm: u8) {
        self.rex(false, 0, base.index(), false);
        self.buf.emit_u8(0x80);
        self.mem(7, base, disp);
        self.buf.emit_u8(imm);
    }

    /// ADD r64, imm8 (sign-extended)
    pub fn add_r64_imm8(&mut self, dst: Reg, imm: i8) {
        self.rex(true, 0, dst.index(), false);
        self.buf.emit_u8(0x83);
        self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
        self.buf.emit_u8(imm as u8);
    }

    /// SUB r64, imm8 (sign-extended)
    pub fn sub_r64_imm8(&mut self, dst: Reg, imm: i8) {
        self.rex(true, 0, dst.index(), false);
        self.buf.emit_u8(0x83);
        self.buf.emit_u8(Self::modrm(0b11, 5, dst.code()));
        self.buf.emit_u8(imm as u8);
    }

    /// ADD r64, imm32 (sign-extended)
    pub fn add_r64_imm32(&mut self, dst: Reg, imm: i32) {
        self.rex(true, 0, dst.index(), false);
        self.buf.emit_u8(0x81);
        self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
        self.buf.emit_u32(imm as u32);
    }

    /// SUB r64, imm32 (sign-extended)
    pub fn sub_r64_imm32(&mut self, dst: Reg, imm: i32) {
        self.rex(true, 0, dst.index(), false);
        self.buf.emit_u8(0x81);
        self.buf.emit_u8(Self::modrm(0b11, 5, dst.code()));
        self.buf.emit_u32(imm as u32);
    }

    /// SETcc r8
    pub fn setcc(&mut self, cond: Cond, dst: Reg) {
        self.rex(false, 0, dst.index(), dst.index() >= 4);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x90 + cond as u8);
        self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
    }

    // ==================== Control Flow ====================

    /// JMP rel32 to a label.
    pub fn jmp(&mut self, label: Label) {
        self.buf.emit_u8(0xE9);
        self.buf.emit_rel32(label);
    }

    /// Jcc rel32 to a label.
    pub fn jcc(&mut self, cond: Cond, label: Label) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        self.buf.emit_rel32(label);
    }

    /// CALL r64
    pub fn call_r(&mut self, reg: Reg) {
        self.rex(false, 0, reg.index(), false);
        self.buf.emit_u8(0xFF);
        self.buf.emit_u8(Self::modrm(0b11, 2, reg.code()));
    }

    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    // ==================== SSE ====================

    fn sse_rr(&mut self, prefix: Option<u8>, opcode: u8, dst: u8, src: u8) {
        if let Some(p) = prefix {
            self.buf.emit_u8(p);
        }
        self.rex(false, dst, src, false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(opcode);
        self.buf.emit_u8(Self::modrm(0b11, dst, src));
    }

    fn sse_rm(&mut self, prefix: Option<u8>, opcode: u8, reg: u8, base: Reg, disp: i32) {
        if let Some(p) = prefix {
            self.buf.emit_u8(p);
        }
        self.rex(false, reg, base.index(), false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(opcode);
        self.mem(reg, base, disp);
    }

    /// MOVSS xmm, [base + disp] (zeroes lanes 1..4)
    pub fn movss_load(&mut self, dst: u8, base: Reg, disp: i32) {
        self.sse_rm(Some(0xF3), 0x10, dst, base, disp);
    }

    /// MOVSS [base + disp], xmm
    pub fn movss_store(&mut self, base: Reg, disp: i32, src: u8) {
        self.sse_rm(Some(0xF3), 0x11, src, base, disp);
    }

    /// MOVUPS xmm, [base + disp]
    pub fn movups_load(&mut self, dst: u8, base: Reg, disp: i32) {
        self.sse_rm(None, 0x10, dst, base, disp);
    }

    /// MOVUPS [base + disp], xmm
    pub fn movups_store(&mut self, base: Reg, disp: i32, src: u8) {
        self.sse_rm(None, 0x11, src, base, disp);
    }

    /// MOVSS xmm, xmm (lane 0 only; the other lanes of `dst` are kept)
    pub fn movss_rr(&mut self, dst: u8, src: u8) {
        self.sse_rr(Some(0xF3), 0x10, dst, src);
    }

    /// MOVAPS xmm, xmm
    pub fn movaps_rr(&mut self, dst: u8, src: u8) {
        self.sse_rr(None, 0x28, dst, src);
    }

    /// Scalar single form (`F3 0F op`).
    pub fn op_ss(&mut self, op: SseOp, dst: u8, src: u8) {
        self.sse_rr(Some(0xF3), op as u8, dst, src);
    }

    /// Packed single form (`0F op`).
    pub fn op_ps(&mut self, op: SseOp, dst: u8, src: u8) {
        self.sse_rr(None, op as u8, dst, src);
    }

    /// UCOMISS xmm, xmm
    pub fn ucomiss(&mut self, a: u8, b: u8) {
        self.sse_rr(None, 0x2E, a, b);
    }

    /// SHUFPS xmm, xmm, imm8
    pub fn shufps(&mut self, dst: u8, src: u8, imm: u8) {
        self.sse_rr(None, 0xC6, dst, src);
        self.buf.emit_u8(imm);
    }

    /// MOVD xmm, r32
    pub fn movd_xmm_r32(&mut self, dst: u8, src: Reg) {
        self.buf.emit_u8(0x66);
        self.rex(false, dst, src.index(), false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x6E);
        self.buf.emit_u8(Self::modrm(0b11, dst, src.code()));
    }

    /// MOVD r32, xmm
    pub fn movd_r32_xmm(&mut self, dst: Reg, src: u8) {
        self.buf.emit_u8(0x66);
        self.rex(false, src, dst.index(), false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x7E);
        self.buf.emit_u8(Self::modrm(0b11, src, dst.code()));
    }
}
