use super::status::{CMP_EQ, CMP_GT, CMP_LT, CMP_MASK, CMP_UN};
use super::{ControlFlow, ExecState, OpResult};
use crate::vm::opcodes::combine;

#[inline]
fn branch_if(cond: bool, a2: u16, a3: u16) -> OpResult {
    Ok(if cond { ControlFlow::Branch(combine(a2, a3)) } else { ControlFlow::Continue })
}

/// Compare flags for `a` against `b`.
#[inline]
pub(crate) fn compare(a: f32, b: f32) -> u32 {
    let mut flags = 0;
    if a == b {
        flags |= CMP_EQ;
    }
    if a < b {
        flags |= CMP_LT;
    }
    if a > b {
        flags |= CMP_GT;
    }
    if a.is_nan() || b.is_nan() {
        flags |= CMP_UN;
    }
    flags
}

pub(super) fn ret(_s: &mut ExecState<'_, '_>, _a1: u16, _a2: u16, _a3: u16) -> OpResult {
    Ok(ControlFlow::Return)
}

pub(super) fn cmp(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, _a3: u16) -> OpResult {
    let flags = compare(s.stack[a1 as usize], s.stack[a2 as usize]);
    *s.status = (*s.status & !CMP_MASK) | flags;
    Ok(ControlFlow::Continue)
}

pub(super) fn cmpz(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, _a3: u16) -> OpResult {
    let flags = compare(s.stack[a1 as usize], 0.0);
    *s.status = (*s.status & !CMP_MASK) | flags;
    Ok(ControlFlow::Continue)
}

pub(super) fn branch(_s: &mut ExecState<'_, '_>, _a1: u16, a2: u16, a3: u16) -> OpResult {
    Ok(ControlFlow::Branch(combine(a2, a3)))
}

pub(super) fn branchz(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    branch_if(s.stack[a1 as usize].abs() == 0.0, a2, a3)
}

pub(super) fn branchnz(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    let v = s.stack[a1 as usize];
    branch_if(!v.is_nan() && v.abs() != 0.0, a2, a3)
}

pub(super) fn branchpos(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    branch_if(!s.stack[a1 as usize].is_sign_negative(), a2, a3)
}

pub(super) fn branchneg(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    branch_if(s.stack[a1 as usize].is_sign_negative(), a2, a3)
}

pub(super) fn branchun(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    branch_if(s.stack[a1 as usize].is_nan(), a2, a3)
}

/// Whether the flag condition of a `BRANCHC*`/`ASSIGNC*` holds.
macro_rules! flag_ops {
    ($( $branch:ident, $assign:ident => |$f:ident| $cond:expr; )*) => {
        $(
            pub(super) fn $branch(s: &mut ExecState<'_, '_>, _a1: u16, a2: u16, a3: u16) -> OpResult {
                let $f = *s.status;
                branch_if($cond, a2, a3)
            }

            pub(super) fn $assign(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
                let $f = *s.status;
                let value = if $cond { a1 } else { a2 };
                s.stack[a3 as usize] = value as i16 as f32;
                Ok(ControlFlow::Continue)
            }
        )*
    };
}

flag_ops! {
    branchceq, assignceq => |f| f & CMP_EQ != 0;
    branchcne, assigncne => |f| f & CMP_EQ == 0;
    branchclt, assignclt => |f| f & CMP_LT != 0;
    branchcle, assigncle => |f| f & (CMP_LT | CMP_EQ) != 0;
    branchcgt, assigncgt => |f| f & CMP_GT != 0;
    branchcge, assigncge => |f| f & (CMP_GT | CMP_EQ) != 0;
    branchcun, assigncun => |f| f & CMP_UN != 0;
}
