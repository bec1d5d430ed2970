use super::{binary_ss, unary_s, ControlFlow, ExecState, OpResult};

pub(super) fn sin(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    unary_s(s, a1, a3, f32::sin)
}

pub(super) fn cos(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    unary_s(s, a1, a3, f32::cos)
}

pub(super) fn tan(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    unary_s(s, a1, a3, f32::tan)
}

pub(super) fn asin(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    unary_s(s, a1, a3, f32::asin)
}

pub(super) fn acos(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    unary_s(s, a1, a3, f32::acos)
}

pub(super) fn atan(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    unary_s(s, a1, a3, f32::atan)
}

pub(super) fn atan2(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    binary_ss(s, a1, a2, a3, f32::atan2)
}

/// `sin` into `arg2`, `cos` into `arg3`.
pub(super) fn sincos(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    let (sin, cos) = s.stack[a1 as usize].sin_cos();
    s.stack[a2 as usize] = sin;
    s.stack[a3 as usize] = cos;
    Ok(ControlFlow::Continue)
}
