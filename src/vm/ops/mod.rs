//! Instruction semantics.
//!
//! Every opcode is a plain function over an [`ExecState`]. Operands were
//! bounds-checked by the validator, so stack indexing here cannot go out of
//! range for a validated def. The runtime-indexed opcodes (`INDEXR*`,
//! `DLOADIR*`) check their computed index themselves.

mod bounds;
mod branch;
mod math;
mod misc;
mod trig;

use super::archive::Archive;
use super::error::LmntError;
use super::extcall::ExtcallTable;
use super::opcodes::{Instruction, Opcode};

/// Compare flags written by `CMP`/`CMPZ`.
pub mod status {
    pub const CMP_EQ: u32 = 1 << 0;
    pub const CMP_LT: u32 = 1 << 1;
    pub const CMP_GT: u32 = 1 << 2;
    pub const CMP_UN: u32 = 1 << 7;
    pub const CMP_MASK: u32 = CMP_EQ | CMP_LT | CMP_GT | CMP_UN;
}

/// What the run loop does after an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    Continue,
    /// Continue at the given instruction index.
    Branch(u32),
    Return,
}

pub type OpResult = Result<ControlFlow, LmntError>;

/// Mutable view of a context used while executing instructions.
pub struct ExecState<'s, 'a> {
    pub stack: &'s mut [f32],
    pub status: &'s mut u32,
    pub cur_stack_count: usize,
    pub archive: &'s Archive<'a>,
    pub extcalls: &'s ExtcallTable,
}

pub type OpFn = fn(&mut ExecState<'_, '_>, u16, u16, u16) -> OpResult;

/// Floor a stack value into an index. Negative and NaN values map to
/// `usize::MAX` so that any bounds check rejects them.
#[inline]
pub(crate) fn value_to_index(v: f32) -> usize {
    let f = v.floor();
    if f.is_nan() || f < 0.0 { usize::MAX } else { f as usize }
}

#[inline]
fn unary_s(s: &mut ExecState<'_, '_>, a1: u16, a3: u16, f: impl Fn(f32) -> f32) -> OpResult {
    s.stack[a3 as usize] = f(s.stack[a1 as usize]);
    Ok(ControlFlow::Continue)
}

#[inline]
fn unary_v(s: &mut ExecState<'_, '_>, a1: u16, a3: u16, f: impl Fn(f32) -> f32) -> OpResult {
    let (a1, a3) = (a1 as usize, a3 as usize);
    for i in 0..4 {
        s.stack[a3 + i] = f(s.stack[a1 + i]);
    }
    Ok(ControlFlow::Continue)
}

#[inline]
fn binary_ss(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16, f: impl Fn(f32, f32) -> f32) -> OpResult {
    s.stack[a3 as usize] = f(s.stack[a1 as usize], s.stack[a2 as usize]);
    Ok(ControlFlow::Continue)
}

#[inline]
fn binary_vv(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16, f: impl Fn(f32, f32) -> f32) -> OpResult {
    let (a1, a2, a3) = (a1 as usize, a2 as usize, a3 as usize);
    for i in 0..4 {
        s.stack[a3 + i] = f(s.stack[a1 + i], s.stack[a2 + i]);
    }
    Ok(ControlFlow::Continue)
}

#[inline]
fn binary_vs(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16, f: impl Fn(f32, f32) -> f32) -> OpResult {
    let (a1, a2, a3) = (a1 as usize, a2 as usize, a3 as usize);
    for i in 0..4 {
        s.stack[a3 + i] = f(s.stack[a1 + i], s.stack[a2]);
    }
    Ok(ControlFlow::Continue)
}

/// The implementation of `op`.
pub fn op_function(op: Opcode) -> OpFn {
    use Opcode::*;
    match op {
        Noop => misc::noop,
        Return => branch::ret,
        AssignSS => misc::assignss,
        AssignVV => misc::assignvv,
        AssignSV => misc::assignsv,
        AssignIIS => misc::assigniis,
        AssignIBS => misc::assignibs,
        AssignIIV => misc::assigniiv,
        AssignIBV => misc::assignibv,
        DloadIIS => misc::dloadiis,
        DloadIIV => misc::dloadiiv,
        DloadIRS => misc::dloadirs,
        DloadIRV => misc::dloadirv,
        DsecLen => misc::dseclen,
        AddSS => math::addss,
        AddVV => math::addvv,
        SubSS => math::subss,
        SubVV => math::subvv,
        MulSS => math::mulss,
        MulVV => math::mulvv,
        DivSS => math::divss,
        DivVV => math::divvv,
        ModSS => math::modss,
        ModVV => math::modvv,
        Sin => trig::sin,
        Cos => trig::cos,
        Tan => trig::tan,
        Asin => trig::asin,
        Acos => trig::acos,
        Atan => trig::atan,
        Atan2 => trig::atan2,
        SinCos => trig::sincos,
        PowSS => math::powss,
        PowVV => math::powvv,
        PowVS => math::powvs,
        SqrtS => math::sqrts,
        SqrtV => math::sqrtv,
        Log => math::log,
        Ln => math::ln,
        Log2 => math::log2,
        Log10 => math::log10,
        AbsS => bounds::abss,
        AbsV => bounds::absv,
        SumV => math::sumv,
        MinSS => bounds::minss,
        MinVV => bounds::minvv,
        MaxSS => bounds::maxss,
        MaxVV => bounds::maxvv,
        MinVS => bounds::minvs,
        MaxVS => bounds::maxvs,
        FloorS => bounds::floors,
        FloorV => bounds::floorv,
        RoundS => bounds::rounds,
        RoundV => bounds::roundv,
        CeilS => bounds::ceils,
        CeilV => bounds::ceilv,
        TruncS => bounds::truncs,
        TruncV => bounds::truncv,
        IndexRIS => misc::indexris,
        IndexRIR => misc::indexrir,
        Branch => branch::branch,
        BranchZ => branch::branchz,
        BranchNZ => branch::branchnz,
        BranchPos => branch::branchpos,
        BranchNeg => branch::branchneg,
        BranchUn => branch::branchun,
        Cmp => branch::cmp,
        CmpZ => branch::cmpz,
        BranchCEQ => branch::branchceq,
        BranchCNE => branch::branchcne,
        BranchCLT => branch::branchclt,
        BranchCLE => branch::branchcle,
        BranchCGT => branch::branchcgt,
        BranchCGE => branch::branchcge,
        BranchCUN => branch::branchcun,
        AssignCEQ => branch::assignceq,
        AssignCNE => branch::assigncne,
        AssignCLT => branch::assignclt,
        AssignCLE => branch::assigncle,
        AssignCGT => branch::assigncgt,
        AssignCGE => branch::assigncge,
        AssignCUN => branch::assigncun,
        Extcall => misc::extcall,
    }
}

/// Execute one instruction.
#[inline]
pub fn execute_instruction(s: &mut ExecState<'_, '_>, ins: &Instruction) -> OpResult {
    let op = ins.op().ok_or(LmntError::Internal)?;
    op_function(op)(s, ins.arg1, ins.arg2, ins.arg3)
}
