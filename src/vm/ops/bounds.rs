use super::{binary_ss, binary_vs, binary_vv, unary_s, unary_v, ExecState, OpResult};

// MIN/MAX pick the second operand only on a strict comparison, so a NaN in
// `a` propagates and a NaN in `b` is ignored. The JIT relies on this
// matching minss/maxss operand order.
#[inline]
fn min(a: f32, b: f32) -> f32 {
    if b < a { b } else { a }
}

#[inline]
fn max(a: f32, b: f32) -> f32 {
    if a < b { b } else { a }
}

pub(super) fn abss(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    unary_s(s, a1, a3, f32::abs)
}

pub(super) fn absv(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    unary_v(s, a1, a3, f32::abs)
}

pub(super) fn floors(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    unary_s(s, a1, a3, f32::floor)
}

pub(super) fn floorv(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    unary_v(s, a1, a3, f32::floor)
}

pub(super) fn rounds(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    unary_s(s, a1, a3, f32::round_ties_even)
}

pub(super) fn roundv(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    unary_v(s, a1, a3, f32::round_ties_even)
}

pub(super) fn ceils(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    unary_s(s, a1, a3, f32::ceil)
}

pub(super) fn ceilv(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    unary_v(s, a1, a3, f32::ceil)
}

pub(super) fn truncs(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    unary_s(s, a1, a3, f32::trunc)
}

pub(super) fn truncv(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    unary_v(s, a1, a3, f32::trunc)
}

pub(super) fn minss(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    binary_ss(s, a1, a2, a3, min)
}

pub(super) fn minvv(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    binary_vv(s, a1, a2, a3, min)
}

pub(super) fn maxss(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    binary_ss(s, a1, a2, a3, max)
}

pub(super) fn maxvv(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    binary_vv(s, a1, a2, a3, max)
}

pub(super) fn minvs(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    binary_vs(s, a1, a2, a3, min)
}

pub(super) fn maxvs(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    binary_vs(s, a1, a2, a3, max)
}
