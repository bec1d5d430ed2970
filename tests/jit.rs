#![cfg(all(feature = "jit", any(unix, windows)))]

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use lmnt::config::Target;
use lmnt::jit::{self, CompileOptions};
use lmnt::vm::archive::def_flags;
use lmnt::vm::opcodes::split;
use lmnt::vm::{
    ArchiveBuilder, Context, Execution, ExtcallInfo, ExtcallTable, Instruction, InterruptHandle, LmntError, Opcode,
    Operand, create_archive,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn host_jit() -> bool {
    Target::host().is_some_and(jit::has_backend)
}

fn options(validate: bool) -> CompileOptions {
    CompileOptions { validate_register_cache: validate, ..CompileOptions::default() }
}

/// Seeded inputs in [-50, 50).
fn inputs(seed: u64, count: usize) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count).map(|_| rng.gen_range(-50.0..50.0)).collect()
}

fn same(a: f32, b: f32) -> bool {
    a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan())
}

/// Run `name` through the interpreter and through compiled code for every
/// argument set and require bit-identical results.
fn assert_equivalent(ctx: &mut Context<'_>, name: &str, arg_sets: &[Vec<f32>]) {
    let def = ctx.find_def(name).unwrap();
    for validate in [false, true] {
        let function = jit::compile(ctx, &def, &options(validate)).unwrap();
        assert!(function.is_executable());
        for args in arg_sets {
            let mut expected = vec![0.0; def.rvals_count as usize];
            ctx.update_args(&def, 0, args).unwrap();
            assert_eq!(ctx.execute(&def, Some(&mut expected)), Ok(Execution::Complete(expected.len())));

            let mut actual = vec![0.0; def.rvals_count as usize];
            ctx.update_args(&def, 0, args).unwrap();
            assert_eq!(jit::jit_execute(ctx, &function, Some(&mut actual)), Ok(Execution::Complete(actual.len())));

            for (i, (e, a)) in expected.iter().zip(&actual).enumerate() {
                assert!(same(*e, *a), "{} rval {} with args {:?}: interpreter {} jit {}", name, i, args, e, a);
            }
        }
    }
}

fn prepared(bytes: &[u8]) -> Context<'_> {
    let mut ctx = Context::new(16384).unwrap();
    ctx.load_inplace_archive(bytes).unwrap();
    ctx.prepare_archive().unwrap();
    ctx
}

#[test]
fn test_circle_equivalence() {
    if !host_jit() {
        return;
    }
    let mut b = ArchiveBuilder::new();
    b.constants(&[std::f32::consts::TAU, 1.0]);
    let (z_lo, z_hi) = split(0.15f32.to_bits());
    let code = b.code(&[
        Instruction::new(Opcode::DivSS, 2, 5, 7),
        Instruction::new(Opcode::ModSS, 7, 1, 7),
        Instruction::new(Opcode::MulSS, 7, 0, 7),
        Instruction::new(Opcode::SinCos, 7, 8, 6),
        Instruction::new(Opcode::MulSS, 6, 4, 6),
        Instruction::new(Opcode::MulSS, 8, 4, 7),
        Instruction::new(Opcode::AssignIBS, z_lo, z_hi, 8),
        Instruction::new(Opcode::AssignIIS, 1, 0, 9),
    ]);
    b.def("Circle", def_flags::NONE, code, 8, 4, 4);
    let bytes = b.build();
    let mut ctx = prepared(&bytes);
    let sets: Vec<Vec<f32>> = (0..16).map(|s| {
        let v = inputs(s, 4);
        vec![v[0], v[1], v[2], v[3].abs() + 0.5]
    }).collect();
    assert_equivalent(&mut ctx, "Circle", &sets);
}

#[test]
fn test_simple125_equivalence() {
    if !host_jit() {
        return;
    }
    let mut code = vec![Instruction::new(Opcode::AddSS, 0, 1, 2)];
    code.extend(std::iter::repeat_n(Instruction::new(Opcode::AddSS, 2, 1, 2), 124));
    let bytes = create_archive("Potato", 2, 1, 3, &[], &code);
    let mut ctx = prepared(&bytes);
    let sets: Vec<Vec<f32>> = (0..8).map(|s| inputs(s, 2)).collect();
    assert_equivalent(&mut ctx, "Potato", &sets);

    let def = ctx.find_def("Potato").unwrap();
    let function = jit::compile(&ctx, &def, &CompileOptions::default()).unwrap();
    assert_eq!(function.stats().fallbacks, 0);
    assert!(function.resume_points().is_empty());
}

#[test]
fn test_vector_equivalence() {
    if !host_jit() {
        return;
    }
    // args 0..8 (two vectors and a scalar at 8), rvals 9..29
    let code = [
        Instruction::new(Opcode::AddVV, 0, 4, 9),
        Instruction::new(Opcode::SubVV, 0, 4, 13),
        Instruction::new(Opcode::MulVV, 9, 13, 13),
        Instruction::new(Opcode::DivVV, 13, 4, 17),
        Instruction::new(Opcode::AbsV, 17, 0, 17),
        Instruction::new(Opcode::SqrtV, 17, 0, 21),
        Instruction::new(Opcode::SumV, 21, 0, 25),
        Instruction::new(Opcode::MinVV, 0, 4, 9),
        Instruction::new(Opcode::MaxVS, 9, 8, 9),
        Instruction::new(Opcode::MinVS, 4, 8, 26),
        Instruction::new(Opcode::FloorV, 0, 0, 13),
        Instruction::new(Opcode::RoundS, 8, 0, 25),
        Instruction::new(Opcode::AssignSV, 25, 0, 21),
    ];
    let bytes = create_archive("vec", 9, 21, 30, &[], &code);
    let mut ctx = prepared(&bytes);
    let mut sets: Vec<Vec<f32>> = (0..12).map(|s| inputs(s, 9)).collect();
    sets.push(vec![2.5, -2.5, 0.5, -0.0, 1.0, f32::NAN, -1.5, 3.0, 2.5]);
    assert_equivalent(&mut ctx, "vec", &sets);
}

#[test]
fn test_compare_and_select_equivalence() {
    if !host_jit() {
        return;
    }
    let (end_lo, end_hi) = split(11);
    let minus_three = (-3i16) as u16;
    let code = [
        Instruction::new(Opcode::Cmp, 0, 1, 0),
        Instruction::new(Opcode::AssignCLT, 1, 2, 2),
        Instruction::new(Opcode::AssignCGE, minus_three, 7, 3),
        Instruction::new(Opcode::AssignCEQ, 4, 5, 4),
        Instruction::new(Opcode::AssignCUN, 6, 8, 5),
        Instruction::new(Opcode::MinSS, 0, 1, 6),
        Instruction::new(Opcode::MaxSS, 0, 1, 7),
        Instruction::new(Opcode::CmpZ, 0, 0, 0),
        Instruction::new(Opcode::AssignCNE, 1, 0, 8),
        Instruction::new(Opcode::BranchCGT, 0, end_lo, end_hi),
        Instruction::new(Opcode::SubSS, 6, 7, 6),
        Instruction::new(Opcode::Return, 0, 0, 0),
    ];
    let bytes = create_archive("cmp", 2, 7, 9, &[], &code);
    let mut ctx = prepared(&bytes);
    let mut sets: Vec<Vec<f32>> = (0..12).map(|s| inputs(s, 2)).collect();
    sets.extend([
        vec![1.0, 1.0],
        vec![0.0, -0.0],
        vec![f32::NAN, 1.0],
        vec![1.0, f32::NAN],
        vec![-4.0, 4.0],
    ]);
    assert_equivalent(&mut ctx, "cmp", &sets);
}

fn triple(_info: &ExtcallInfo, args: &[f32], rvals: &mut [f32]) -> Result<(), LmntError> {
    rvals[0] = args[0] * 3.0;
    Ok(())
}

#[test]
fn test_fallback_and_extcall_equivalence() {
    if !host_jit() {
        return;
    }
    let mut b = ArchiveBuilder::new();
    let callee = b.extern_def("triple", 1, 1);
    let (lo, hi) = split(callee);
    b.data_section(&[10.0, 20.0, 30.0]);
    let code = b.code(&[
        Instruction::new(Opcode::Extcall, lo, hi, 0),
        Instruction::new(Opcode::PowSS, 1, 0, 2),
        Instruction::new(Opcode::DloadIIS, 0, 2, 3),
        Instruction::new(Opcode::Atan2, 0, 3, 4),
        Instruction::new(Opcode::AddSS, 4, 1, 4),
    ]);
    b.def("f", def_flags::NONE, code, 5, 1, 4);
    let bytes = b.build();

    let mut ctx = Context::new(16384).unwrap();
    ctx.set_extcalls(ExtcallTable::new(vec![ExtcallInfo::native("triple", 1, 1, triple)])).unwrap();
    ctx.load_inplace_archive(&bytes).unwrap();
    ctx.prepare_archive().unwrap();
    let sets: Vec<Vec<f32>> = (0..8).map(|s| vec![inputs(s, 1)[0] / 25.0]).collect();
    assert_equivalent(&mut ctx, "f", &sets);

    let def = ctx.find_def("f").unwrap();
    let function = jit::compile(&ctx, &def, &CompileOptions::default()).unwrap();
    assert!(function.stats().fallbacks >= 3);
}

#[test]
fn test_register_pressure_equivalence() {
    if !host_jit() {
        return;
    }
    // a running sum across 40 distinct slots outgrows every register file
    let mut code = Vec::new();
    for i in 0..40u16 {
        code.push(Instruction::new(Opcode::MulSS, i, i + 1, 41 + i));
    }
    for i in 0..39u16 {
        code.push(Instruction::new(Opcode::AddSS, 41 + i, 42 + i, 42 + i));
    }
    code.push(Instruction::new(Opcode::AssignSS, 80, 0, 81));
    let bytes = create_archive("pressure", 41, 1, 82, &[], &code);
    let mut ctx = prepared(&bytes);
    let sets: Vec<Vec<f32>> = (0..4).map(|s| inputs(s, 41)).collect();
    assert_equivalent(&mut ctx, "pressure", &sets);

    let def = ctx.find_def("pressure").unwrap();
    let function = jit::compile(&ctx, &def, &CompileOptions::default()).unwrap();
    assert!(function.stats().reg_evicted > 0);
}

#[test]
fn test_extern_def_compiles_to_delegate() {
    if !host_jit() {
        return;
    }
    let mut b = ArchiveBuilder::new();
    b.extern_def("triple", 1, 1);
    let bytes = b.build();
    let mut ctx = Context::new(4096).unwrap();
    ctx.set_extcalls(ExtcallTable::new(vec![ExtcallInfo::native("triple", 1, 1, triple)])).unwrap();
    ctx.load_inplace_archive(&bytes).unwrap();
    ctx.prepare_archive().unwrap();
    let def = ctx.find_def("triple").unwrap();
    let function = jit::compile(&ctx, &def, &CompileOptions::default()).unwrap();
    assert!(function.bytes().is_empty());
    ctx.update_args(&def, 0, &[5.0]).unwrap();
    let mut out = [0.0];
    assert_eq!(jit::jit_execute(&mut ctx, &function, Some(&mut out)), Ok(Execution::Complete(1)));
    assert_eq!(out[0], 15.0);
}

#[test]
fn test_jit_interrupt_from_another_thread() {
    if !host_jit() {
        return;
    }
    let (one_lo, one_hi) = split(1.0f32.to_bits());
    let (loop_lo, loop_hi) = split(1);
    let bytes = create_archive(
        "count",
        1,
        1,
        3,
        &[],
        &[
            Instruction::new(Opcode::AssignIBS, one_lo, one_hi, 2),
            Instruction::new(Opcode::AddSS, 1, 2, 1),
            Instruction::new(Opcode::Cmp, 1, 0, 0),
            Instruction::new(Opcode::BranchCLT, 0, loop_lo, loop_hi),
        ],
    );
    let mut ctx = prepared(&bytes);
    let def = ctx.find_def("count").unwrap();
    let function = jit::compile(&ctx, &def, &CompileOptions::default()).unwrap();
    assert_eq!(function.resume_points(), &[1]);

    ctx.update_args(&def, 0, &[1.0e30]).unwrap();
    let done = Arc::new(AtomicBool::new(false));
    let handle = ctx.interrupt_handle();
    let poker = {
        let done = done.clone();
        thread::spawn(move || {
            while !done.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(5));
                handle.interrupt();
            }
        })
    };
    let mut rvals = [0.0];
    let first = jit::jit_execute(&mut ctx, &function, Some(&mut rvals));
    done.store(true, Ordering::Relaxed);
    poker.join().unwrap();
    assert_eq!(first, Ok(Execution::Interrupted));
    assert_eq!(ctx.current_instruction(), 1);
    let reached = ctx.writable_stack()[1];
    assert!(reached >= 1.0);

    ctx.update_args(&def, 0, &[0.0]).unwrap();
    assert_eq!(jit::jit_resume(&mut ctx, &function, Some(&mut rvals)), Ok(Execution::Complete(1)));
    assert!(rvals[0] >= reached);
    assert_eq!(ctx.current_def(), None);
}

#[test]
fn test_cross_compiled_code_is_inspectable_only() {
    let bytes = create_archive("f", 2, 1, 3, &[], &[Instruction::new(Opcode::AddSS, 0, 1, 2)]);
    let mut ctx = prepared(&bytes);
    let def = ctx.find_def("f").unwrap();
    for target in [Target::X86_64, Target::Arm64, Target::Armv7a, Target::Armv7m] {
        if !jit::has_backend(target) || Target::host() == Some(target) {
            continue;
        }
        let function = jit::compile(&ctx, &def, &CompileOptions::for_target(target)).unwrap();
        assert!(!function.bytes().is_empty());
        assert!(!function.is_executable());
        assert_eq!(jit::jit_execute(&mut ctx, &function, None), Err(LmntError::NoImpl));
    }
}

#[test]
fn test_shifted_vector_result_equivalence() {
    if !host_jit() {
        return;
    }
    // each lane of the sum reads the lane written just before it
    let code = [Instruction::new(Opcode::AddVV, 0, 0, 1), Instruction::new(Opcode::AssignVV, 1, 0, 5)];
    let bytes = create_archive("shift", 5, 4, 9, &[], &code);
    let mut ctx = prepared(&bytes);
    let def = ctx.find_def("shift").unwrap();
    let function = jit::compile(&ctx, &def, &CompileOptions::default()).unwrap();
    assert_eq!(function.stats().fallbacks, 1);

    ctx.update_args(&def, 0, &[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
    let mut rvals = [0.0; 4];
    assert_eq!(jit::jit_execute(&mut ctx, &function, Some(&mut rvals)), Ok(Execution::Complete(4)));
    assert_eq!(rvals, [2.0, 4.0, 8.0, 16.0]);

    let code = [
        Instruction::new(Opcode::AssignSV, 2, 0, 12),
        Instruction::new(Opcode::MinVS, 3, 4, 4),
        Instruction::new(Opcode::AssignVV, 0, 0, 8),
        Instruction::new(Opcode::SubVV, 8, 9, 10),
        Instruction::new(Opcode::FloorV, 9, 0, 7),
    ];
    let bytes = create_archive("mixed", 8, 8, 16, &[], &code);
    let mut ctx = prepared(&bytes);
    let sets: Vec<Vec<f32>> = (0..16).map(|s| inputs(s, 8)).collect();
    assert_equivalent(&mut ctx, "mixed", &sets);
}

const FUZZ_ARGS: u16 = 8;
const FUZZ_RVALS: u16 = 24;
const FUZZ_STACK: u16 = FUZZ_ARGS + FUZZ_RVALS;

/// Opcodes whose operands are all plain stack slots.
const FUZZ_OPS: &[Opcode] = &[
    Opcode::AssignSS,
    Opcode::AssignVV,
    Opcode::AssignSV,
    Opcode::AddSS,
    Opcode::AddVV,
    Opcode::SubSS,
    Opcode::SubVV,
    Opcode::MulSS,
    Opcode::MulVV,
    Opcode::DivSS,
    Opcode::DivVV,
    Opcode::ModSS,
    Opcode::SqrtS,
    Opcode::SqrtV,
    Opcode::AbsS,
    Opcode::AbsV,
    Opcode::SumV,
    Opcode::MinSS,
    Opcode::MinVV,
    Opcode::MaxSS,
    Opcode::MaxVV,
    Opcode::MinVS,
    Opcode::MaxVS,
    Opcode::FloorS,
    Opcode::FloorV,
    Opcode::RoundS,
    Opcode::RoundV,
    Opcode::CeilV,
    Opcode::TruncS,
    Opcode::Sin,
    Opcode::Atan2,
    Opcode::PowVS,
];

/// A slot for an operand of `kind`. Half the time slots come from a narrow
/// window so that operands alias each other.
fn fuzz_slot(rng: &mut StdRng, kind: Operand, narrow: bool) -> u16 {
    let (lo, hi) = if narrow { (FUZZ_ARGS, FUZZ_ARGS + 8) } else { (0, FUZZ_STACK) };
    match kind {
        Operand::Stack1 => rng.gen_range(lo..hi),
        Operand::Stack4 => rng.gen_range(lo..=hi - 4),
        _ => 0,
    }
}

/// A straight-line program with forward branches over `FUZZ_STACK` slots.
/// Every return value slot is written before anything else runs.
fn fuzz_code(rng: &mut StdRng, len: usize) -> Vec<Instruction> {
    let mut code = Vec::new();
    for v in 0..FUZZ_RVALS / 4 {
        let (lo, hi) = split((v as f32 * 1.5 - 3.0).to_bits());
        code.push(Instruction::new(Opcode::AssignIBV, lo, hi, FUZZ_ARGS + 4 * v));
    }
    code.push(Instruction::new(Opcode::Cmp, 0, 1, 0));

    let end = code.len() + len;
    while code.len() < end {
        let narrow = rng.gen_bool(0.5);
        match rng.gen_range(0..12) {
            0 => {
                let (a, b) = (fuzz_slot(rng, Operand::Stack1, narrow), fuzz_slot(rng, Operand::Stack1, false));
                code.push(Instruction::new(Opcode::Cmp, a, b, 0));
                let op = [Opcode::BranchCEQ, Opcode::BranchCLT, Opcode::BranchCGE, Opcode::BranchCUN][rng.gen_range(0..4)];
                let at = code.len() + 1;
                let target = rng.gen_range(at..=end.max(at)) as u32;
                let (lo, hi) = split(target);
                code.push(Instruction::new(op, 0, lo, hi));
            }
            1 => {
                let op = [Opcode::BranchZ, Opcode::BranchNZ, Opcode::BranchPos, Opcode::BranchNeg][rng.gen_range(0..4)];
                let at = code.len() + 1;
                let target = rng.gen_range(at..=end.max(at)) as u32;
                let (lo, hi) = split(target);
                code.push(Instruction::new(op, fuzz_slot(rng, Operand::Stack1, narrow), lo, hi));
            }
            2 => {
                let (a, b) = (fuzz_slot(rng, Operand::Stack1, narrow), fuzz_slot(rng, Operand::Stack1, narrow));
                code.push(Instruction::new(Opcode::Cmp, a, b, 0));
                let op = [Opcode::AssignCLT, Opcode::AssignCNE, Opcode::AssignCUN][rng.gen_range(0..3)];
                let yes = rng.gen_range(-8i16..8) as u16;
                let no = rng.gen_range(-8i16..8) as u16;
                code.push(Instruction::new(op, yes, no, fuzz_slot(rng, Operand::Stack1, narrow)));
            }
            3 => {
                let (lo, hi) = split(rng.gen_range(-10.0f32..10.0).to_bits());
                let (op, kind) = if rng.gen_bool(0.5) {
                    (Opcode::AssignIBS, Operand::Stack1)
                } else {
                    (Opcode::AssignIBV, Operand::Stack4)
                };
                code.push(Instruction::new(op, lo, hi, fuzz_slot(rng, kind, narrow)));
            }
            _ => {
                let op = FUZZ_OPS[rng.gen_range(0..FUZZ_OPS.len())];
                let [a1, a2, a3] = op.operands().map(|kind| fuzz_slot(rng, kind, narrow));
                code.push(Instruction::new(op, a1, a2, a3));
            }
        }
    }
    code
}

#[test]
fn test_random_code_equivalence() {
    if !host_jit() {
        return;
    }
    let mut rng = StdRng::seed_from_u64(0x4C4D_4E54);
    for round in 0..300 {
        let code = fuzz_code(&mut rng, 24);
        let bytes = create_archive("fuzz", FUZZ_ARGS, FUZZ_RVALS, FUZZ_STACK, &[], &code);
        let mut ctx = prepared(&bytes);
        let mut sets: Vec<Vec<f32>> = (0..3).map(|s| inputs(round * 3 + s, FUZZ_ARGS as usize)).collect();
        sets.push(vec![0.0, -0.0, f32::NAN, 1.0, -1.0, 0.5, f32::INFINITY, 2.5]);
        assert_equivalent(&mut ctx, "fuzz", &sets);
    }
}

thread_local! {
    /// Handle to interrupt and the number of `tick` calls left before it fires.
    static TICK_INTERRUPT: RefCell<Option<(InterruptHandle, u32)>> = const { RefCell::new(None) };
}

fn interrupt_on_tick(handle: InterruptHandle, n: u32) {
    TICK_INTERRUPT.with_borrow_mut(|slot| *slot = Some((handle, n)));
}

fn tick(_info: &ExtcallInfo, args: &[f32], rvals: &mut [f32]) -> Result<(), LmntError> {
    TICK_INTERRUPT.with_borrow_mut(|slot| {
        let fire = match slot {
            Some((_, remaining)) => {
                *remaining -= 1;
                *remaining == 0
            }
            None => false,
        };
        if fire {
            if let Some((handle, _)) = slot.take() {
                handle.interrupt();
            }
        }
    });
    rvals[0] = args[0] * 0.5 + 0.25;
    Ok(())
}

/// `ticks(limit)`: sums `tick(i)` for `i` in `1..=limit`, looping back to
/// instruction 3.
fn ticking_context(bytes: &[u8]) -> Context<'_> {
    let mut ctx = Context::new(8192).unwrap();
    ctx.set_extcalls(ExtcallTable::new(vec![ExtcallInfo::native("tick", 1, 1, tick)])).unwrap();
    ctx.load_inplace_archive(bytes).unwrap();
    ctx.prepare_archive().unwrap();
    ctx
}

fn ticking_archive() -> Vec<u8> {
    let mut b = ArchiveBuilder::new();
    let tick = b.extern_def("tick", 1, 1);
    let (tick_lo, tick_hi) = split(tick);
    let (one_lo, one_hi) = split(1.0f32.to_bits());
    let (loop_lo, loop_hi) = split(3);
    let code = b.code(&[
        Instruction::new(Opcode::AssignIBS, one_lo, one_hi, 2),
        Instruction::new(Opcode::AssignIIS, 0, 0, 3),
        Instruction::new(Opcode::AssignIIS, 0, 0, 1),
        Instruction::new(Opcode::AddSS, 3, 2, 3),
        Instruction::new(Opcode::Extcall, tick_lo, tick_hi, 3),
        Instruction::new(Opcode::AddSS, 1, 4, 1),
        Instruction::new(Opcode::Cmp, 3, 0, 0),
        Instruction::new(Opcode::BranchCLT, 0, loop_lo, loop_hi),
    ]);
    b.def("ticks", def_flags::NONE, code, 5, 1, 1);
    b.build()
}

#[test]
fn test_jit_resume_after_interrupt_at_every_iteration() {
    if !host_jit() {
        return;
    }
    let bytes = ticking_archive();
    let mut ctx = ticking_context(&bytes);
    let def = ctx.find_def("ticks").unwrap();
    let function = jit::compile(&ctx, &def, &CompileOptions::default()).unwrap();
    assert_eq!(function.resume_points(), &[3]);
    let limit = 12;
    ctx.update_args(&def, 0, &[limit as f32]).unwrap();

    let mut expected = [0.0];
    assert_eq!(ctx.execute(&def, Some(&mut expected)), Ok(Execution::Complete(1)));
    assert_eq!(expected[0], 42.0);
    let mut uninterrupted = [0.0];
    assert_eq!(jit::jit_execute(&mut ctx, &function, Some(&mut uninterrupted)), Ok(Execution::Complete(1)));
    assert_eq!(uninterrupted, expected);

    for n in 1..=limit {
        // compiled code notices the request at the next backward branch
        interrupt_on_tick(ctx.interrupt_handle(), n);
        let mut rvals = [0.0];
        let mut outcome = jit::jit_execute(&mut ctx, &function, Some(&mut rvals)).unwrap();
        if n < limit {
            assert_eq!(outcome, Execution::Interrupted, "tick {}", n);
            assert_eq!(ctx.current_instruction(), 3);
        }
        while outcome == Execution::Interrupted {
            outcome = jit::jit_resume(&mut ctx, &function, Some(&mut rvals)).unwrap();
        }
        assert_eq!(outcome, Execution::Complete(1));
        assert_eq!(rvals, expected, "compiled code interrupted at tick {}", n);
    }
}

#[test]
fn test_resume_across_engines() {
    if !host_jit() {
        return;
    }
    let bytes = ticking_archive();
    let mut ctx = ticking_context(&bytes);
    let def = ctx.find_def("ticks").unwrap();
    let function = jit::compile(&ctx, &def, &CompileOptions::default()).unwrap();
    ctx.update_args(&def, 0, &[9.0]).unwrap();
    let mut expected = [0.0];
    assert_eq!(ctx.execute(&def, Some(&mut expected)), Ok(Execution::Complete(1)));

    for n in 1..9 {
        // interpreted, stopped mid-block, finished through the compiled entry
        interrupt_on_tick(ctx.interrupt_handle(), n);
        let mut rvals = [0.0];
        assert_eq!(ctx.execute(&def, Some(&mut rvals)), Ok(Execution::Interrupted));
        assert_eq!(jit::jit_resume(&mut ctx, &function, Some(&mut rvals)), Ok(Execution::Complete(1)));
        assert_eq!(rvals, expected, "interpreter interrupted at tick {}", n);

        // compiled, stopped at the loop head, finished by the interpreter
        interrupt_on_tick(ctx.interrupt_handle(), n);
        let mut rvals = [0.0];
        assert_eq!(jit::jit_execute(&mut ctx, &function, Some(&mut rvals)), Ok(Execution::Interrupted));
        assert_eq!(ctx.resume(&def, Some(&mut rvals)), Ok(Execution::Complete(1)));
        assert_eq!(rvals, expected, "compiled code interrupted at tick {}", n);
    }
}
