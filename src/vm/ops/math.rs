use super::{binary_ss, binary_vs, binary_vv, unary_s, unary_v, ControlFlow, ExecState, OpResult};

pub(super) fn addss(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    binary_ss(s, a1, a2, a3, |a, b| a + b)
}

pub(super) fn addvv(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    binary_vv(s, a1, a2, a3, |a, b| a + b)
}

pub(super) fn subss(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    binary_ss(s, a1, a2, a3, |a, b| a - b)
}

pub(super) fn subvv(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    binary_vv(s, a1, a2, a3, |a, b| a - b)
}

pub(super) fn mulss(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    binary_ss(s, a1, a2, a3, |a, b| a * b)
}

pub(super) fn mulvv(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    binary_vv(s, a1, a2, a3, |a, b| a * b)
}

pub(super) fn divss(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    binary_ss(s, a1, a2, a3, |a, b| a / b)
}

pub(super) fn divvv(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    binary_vv(s, a1, a2, a3, |a, b| a / b)
}

// `%` on floats is C fmod: the result takes the sign of the dividend.
pub(super) fn modss(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    binary_ss(s, a1, a2, a3, |a, b| a % b)
}

pub(super) fn modvv(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    binary_vv(s, a1, a2, a3, |a, b| a % b)
}

pub(super) fn powss(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    binary_ss(s, a1, a2, a3, f32::powf)
}

pub(super) fn powvv(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    binary_vv(s, a1, a2, a3, f32::powf)
}

pub(super) fn powvs(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    binary_vs(s, a1, a2, a3, f32::powf)
}

pub(super) fn sqrts(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    unary_s(s, a1, a3, f32::sqrt)
}

pub(super) fn sqrtv(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    unary_v(s, a1, a3, f32::sqrt)
}

/// Logarithm of `a` in base `b`.
pub(super) fn log(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    binary_ss(s, a1, a2, a3, |a, b| if b != 0.0 { a.ln() / b.ln() } else { f32::NAN })
}

pub(super) fn ln(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    unary_s(s, a1, a3, f32::ln)
}

pub(super) fn log2(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    unary_s(s, a1, a3, f32::log2)
}

pub(super) fn log10(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    unary_s(s, a1, a3, f32::log10)
}

pub(super) fn sumv(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    let a1 = a1 as usize;
    let st = &mut *s.stack;
    st[a3 as usize] = st[a1] + st[a1 + 1] + st[a1 + 2] + st[a1 + 3];
    Ok(ControlFlow::Continue)
}
