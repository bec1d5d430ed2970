use super::{value_to_index, ControlFlow, ExecState, OpResult};
use crate::vm::error::LmntError;
use crate::vm::opcodes::combine;

pub(super) fn noop(_s: &mut ExecState<'_, '_>, _a1: u16, _a2: u16, _a3: u16) -> OpResult {
    Ok(ControlFlow::Continue)
}

pub(super) fn assignss(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    s.stack[a3 as usize] = s.stack[a1 as usize];
    Ok(ControlFlow::Continue)
}

pub(super) fn assignvv(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    let (a1, a3) = (a1 as usize, a3 as usize);
    s.stack.copy_within(a1..a1 + 4, a3);
    Ok(ControlFlow::Continue)
}

pub(super) fn assignsv(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    let v = s.stack[a1 as usize];
    s.stack[a3 as usize..a3 as usize + 4].fill(v);
    Ok(ControlFlow::Continue)
}

/// The immediate pair read as a signed integer.
#[inline]
fn imm_int(a1: u16, a2: u16) -> f32 {
    combine(a1, a2) as i32 as f32
}

/// The immediate pair read as the bits of a float.
#[inline]
fn imm_bits(a1: u16, a2: u16) -> f32 {
    f32::from_bits(combine(a1, a2))
}

pub(super) fn assigniis(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    s.stack[a3 as usize] = imm_int(a1, a2);
    Ok(ControlFlow::Continue)
}

pub(super) fn assignibs(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    s.stack[a3 as usize] = imm_bits(a1, a2);
    Ok(ControlFlow::Continue)
}

pub(super) fn assigniiv(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    s.stack[a3 as usize..a3 as usize + 4].fill(imm_int(a1, a2));
    Ok(ControlFlow::Continue)
}

pub(super) fn assignibv(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    s.stack[a3 as usize..a3 as usize + 4].fill(imm_bits(a1, a2));
    Ok(ControlFlow::Continue)
}

pub(super) fn dloadiis(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    let sec = s.archive.get_data_section(a1 as u32)?;
    s.stack[a3 as usize] = s.archive.get_data_value(&sec, a2 as u32)?;
    Ok(ControlFlow::Continue)
}

pub(super) fn dloadiiv(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    let sec = s.archive.get_data_section(a1 as u32)?;
    for i in 0..4 {
        s.stack[a3 as usize + i] = s.archive.get_data_value(&sec, a2 as u32 + i as u32)?;
    }
    Ok(ControlFlow::Continue)
}

pub(super) fn dloadirs(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    let sec = s.archive.get_data_section(a1 as u32)?;
    let index = value_to_index(s.stack[a2 as usize]);
    if index >= sec.count as usize {
        return Err(LmntError::AccessViolation);
    }
    s.stack[a3 as usize] = s.archive.get_data_value(&sec, index as u32)?;
    Ok(ControlFlow::Continue)
}

pub(super) fn dloadirv(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    let sec = s.archive.get_data_section(a1 as u32)?;
    let index = value_to_index(s.stack[a2 as usize]);
    if sec.count < 4 || index > sec.count as usize - 4 {
        return Err(LmntError::AccessViolation);
    }
    for i in 0..4 {
        s.stack[a3 as usize + i] = s.archive.get_data_value(&sec, (index + i) as u32)?;
    }
    Ok(ControlFlow::Continue)
}

pub(super) fn dseclen(s: &mut ExecState<'_, '_>, a1: u16, _a2: u16, a3: u16) -> OpResult {
    let sec = s.archive.get_data_section(a1 as u32)?;
    s.stack[a3 as usize] = sec.count as f32;
    Ok(ControlFlow::Continue)
}

/// A stack value used as a runtime index: finite, floored, non-negative.
#[inline]
fn stack_ref(s: &ExecState<'_, '_>, arg: u16) -> Result<usize, LmntError> {
    let v = s.stack[arg as usize];
    if !v.is_finite() {
        return Err(LmntError::AccessViolation);
    }
    Ok(value_to_index(v))
}

pub(super) fn indexris(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    let src = stack_ref(s, a1)?.saturating_add(a2 as usize);
    if src >= s.cur_stack_count {
        return Err(LmntError::AccessViolation);
    }
    s.stack[a3 as usize] = s.stack[src];
    Ok(ControlFlow::Continue)
}

pub(super) fn indexrir(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    let src = stack_ref(s, a1)?.saturating_add(a2 as usize);
    let dst = stack_ref(s, a3)?;
    if src >= s.cur_stack_count || dst >= s.cur_stack_count {
        return Err(LmntError::AccessViolation);
    }
    s.stack[dst] = s.stack[src];
    Ok(ControlFlow::Continue)
}

/// Call the extern def at `COMBINE(arg1, arg2)`. Arguments are read from
/// `arg3` onwards and return values written after them.
pub(super) fn extcall(s: &mut ExecState<'_, '_>, a1: u16, a2: u16, a3: u16) -> OpResult {
    let def = s.archive.get_def(combine(a1, a2))?;
    let info = s.extcalls.get(def.code as usize).map_err(|_| LmntError::MissingExtcall)?;
    let start = a3 as usize;
    let end = start + def.args_count as usize + def.rvals_count as usize;
    let window = s.stack.get_mut(start..end).ok_or(LmntError::AccessViolation)?;
    let (args, rvals) = window.split_at_mut(def.args_count as usize);
    info.call(args, rvals)?;
    Ok(ControlFlow::Continue)
}

#[cfg(test)]
mod tests {
    use crate::vm::error::LmntError;
    use crate::vm::opcodes::{split, Instruction, Opcode};
    use crate::vm::ops::tests::{run, run_with_data};

    #[test]
    fn test_assign_immediates() {
        let mut stack = [0.0f32; 4];
        let (lo, hi) = split((-5i32) as u32);
        run(&mut stack, Instruction::new(Opcode::AssignIIS, lo, hi, 0)).unwrap();
        assert_eq!(stack[0], -5.0);
        let (lo, hi) = split(1.25f32.to_bits());
        run(&mut stack, Instruction::new(Opcode::AssignIBV, lo, hi, 0)).unwrap();
        assert_eq!(stack, [1.25; 4]);
    }

    #[test]
    fn test_assign_vectors() {
        let mut stack = [1.0, 2.0, 3.0, 4.0, 0.0, 0.0, 0.0, 0.0, 9.0];
        run(&mut stack, Instruction::new(Opcode::AssignVV, 0, 0, 4)).unwrap();
        assert_eq!(&stack[4..8], &[1.0, 2.0, 3.0, 4.0]);
        run(&mut stack, Instruction::new(Opcode::AssignSV, 8, 0, 0)).unwrap();
        assert_eq!(&stack[0..4], &[9.0; 4]);
    }

    #[test]
    fn test_data_loads() {
        let data: &[&[f32]] = &[&[1.0, 2.0], &[10.0, 20.0, 30.0, 40.0, 50.0]];
        let mut status = 0;
        let mut stack = [0.0f32; 6];

        run_with_data(data, &mut stack, &mut status, Instruction::new(Opcode::DloadIIS, 1, 2, 0)).unwrap();
        assert_eq!(stack[0], 30.0);
        run_with_data(data, &mut stack, &mut status, Instruction::new(Opcode::DsecLen, 1, 0, 0)).unwrap();
        assert_eq!(stack[0], 5.0);

        stack[0] = 1.9;
        run_with_data(data, &mut stack, &mut status, Instruction::new(Opcode::DloadIRV, 1, 0, 1)).unwrap();
        assert_eq!(&stack[1..5], &[20.0, 30.0, 40.0, 50.0]);

        stack[0] = 2.0;
        let out = run_with_data(data, &mut stack, &mut status, Instruction::new(Opcode::DloadIRV, 1, 0, 1));
        assert_eq!(out, Err(LmntError::AccessViolation));
        let out = run_with_data(data, &mut stack, &mut status, Instruction::new(Opcode::DloadIRS, 0, 0, 1));
        assert_eq!(out, Err(LmntError::AccessViolation));

        stack[0] = -1.0;
        let out = run_with_data(data, &mut stack, &mut status, Instruction::new(Opcode::DloadIRS, 1, 0, 1));
        assert_eq!(out, Err(LmntError::AccessViolation));
    }

    #[test]
    fn test_index_reads() {
        let mut stack = [1.0f32, 5.0, 6.0, 7.0, 0.0];
        run(&mut stack, Instruction::new(Opcode::IndexRIS, 0, 2, 4)).unwrap();
        assert_eq!(stack[4], 7.0);

        stack[0] = 4.0;
        assert_eq!(run(&mut stack, Instruction::new(Opcode::IndexRIS, 0, 1, 4)), Err(LmntError::AccessViolation));
        stack[0] = f32::INFINITY;
        assert_eq!(run(&mut stack, Instruction::new(Opcode::IndexRIS, 0, 0, 4)), Err(LmntError::AccessViolation));
    }

    #[test]
    fn test_index_writes() {
        let mut stack = [1.0f32, 5.0, 6.0, 7.0, 3.0];
        run(&mut stack, Instruction::new(Opcode::IndexRIR, 0, 0, 4)).unwrap();
        assert_eq!(stack[3], 5.0);

        stack[4] = 5.0;
        assert_eq!(run(&mut stack, Instruction::new(Opcode::IndexRIR, 0, 0, 4)), Err(LmntError::AccessViolation));
        stack[4] = f32::NAN;
        assert_eq!(run(&mut stack, Instruction::new(Opcode::IndexRIR, 0, 0, 4)), Err(LmntError::AccessViolation));
    }
}
