use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use lmnt::vm::archive::def_flags;
use lmnt::vm::opcodes::split;
use lmnt::vm::{
    ArchiveBuilder, Context, Execution, ExtcallInfo, ExtcallTable, Instruction, InterruptHandle, LmntError, Opcode,
    create_archive,
};

fn prepared(bytes: &[u8]) -> Context<'_> {
    let mut ctx = Context::new(8192).unwrap();
    ctx.load_inplace_archive(bytes).unwrap();
    ctx.prepare_archive().unwrap();
    ctx
}

fn run(ctx: &mut Context<'_>, name: &str, args: &[f32]) -> Result<Vec<f32>, LmntError> {
    let def = ctx.find_def(name)?;
    ctx.update_args(&def, 0, args)?;
    let mut rvals = vec![0.0; def.rvals_count as usize];
    match ctx.execute(&def, Some(&mut rvals))? {
        Execution::Complete(n) => {
            assert_eq!(n, rvals.len());
            Ok(rvals)
        }
        Execution::Interrupted => panic!("unexpected interrupt"),
    }
}

/// The circle fixture: `[tau, 1 | t, i, radius, interval | x, y, z, intensity]`.
fn circle_archive() -> Vec<u8> {
    let mut b = ArchiveBuilder::new();
    b.constants(&[std::f32::consts::TAU, 1.0]);
    let (z_lo, z_hi) = split(0.15f32.to_bits());
    let (one_lo, one_hi) = split(1.0f32.to_bits());
    let code = b.code(&[
        Instruction::new(Opcode::DivSS, 2, 5, 7),
        Instruction::new(Opcode::ModSS, 7, 1, 7),
        Instruction::new(Opcode::MulSS, 7, 0, 7),
        Instruction::new(Opcode::Cos, 7, 0, 6),
        Instruction::new(Opcode::MulSS, 6, 4, 6),
        Instruction::new(Opcode::Sin, 7, 0, 7),
        Instruction::new(Opcode::MulSS, 7, 4, 7),
        Instruction::new(Opcode::AssignIBS, z_lo, z_hi, 8),
        Instruction::new(Opcode::AssignIBS, one_lo, one_hi, 9),
    ]);
    b.def("Circle", def_flags::NONE, code, 8, 4, 4);
    b.build()
}

fn simple125_archive() -> Vec<u8> {
    let mut code = vec![Instruction::new(Opcode::AddSS, 0, 1, 2)];
    code.extend(std::iter::repeat_n(Instruction::new(Opcode::AddSS, 2, 1, 2), 124));
    create_archive("Potato", 2, 1, 3, &[], &code)
}

/// Counts slot 1 up by one until it reaches the limit in slot 0.
fn counter_archive() -> Vec<u8> {
    let (one_lo, one_hi) = split(1.0f32.to_bits());
    let (target_lo, target_hi) = split(1);
    create_archive(
        "count",
        1,
        1,
        3,
        &[],
        &[
            Instruction::new(Opcode::AssignIBS, one_lo, one_hi, 2),
            Instruction::new(Opcode::AddSS, 1, 2, 1),
            Instruction::new(Opcode::Cmp, 1, 0, 0),
            Instruction::new(Opcode::BranchCLT, 0, target_lo, target_hi),
        ],
    )
}

#[test]
fn test_add_two_numbers() {
    let bytes = create_archive(
        "f",
        2,
        1,
        3,
        &[],
        &[Instruction::new(Opcode::AddSS, 0, 1, 2), Instruction::new(Opcode::Return, 0, 0, 0)],
    );
    let mut ctx = prepared(&bytes);
    let def = ctx.find_def("f").unwrap();
    ctx.update_args(&def, 0, &[2.0, 3.0]).unwrap();
    let mut rvals = [0.0];
    assert_eq!(ctx.execute(&def, Some(&mut rvals)), Ok(Execution::Complete(1)));
    assert_eq!(rvals[0], 5.0);
    assert_eq!(ctx.current_def(), None);
}

#[test]
fn test_circle() {
    let bytes = circle_archive();
    let mut ctx = prepared(&bytes);
    let (t, radius, interval) = (0.25f32, 2.0f32, 1.0f32);
    let out = run(&mut ctx, "Circle", &[t, 0.0, radius, interval]).unwrap();

    let angle = ((t / interval) % 1.0) * std::f32::consts::TAU;
    assert!((out[0] - angle.cos() * radius).abs() < 1e-5);
    assert!((out[1] - angle.sin() * radius).abs() < 1e-5);
    assert_eq!(out[2], 0.15);
    assert_eq!(out[3], 1.0);
}

#[test]
fn test_simple125() {
    let bytes = simple125_archive();
    let mut ctx = prepared(&bytes);
    assert_eq!(run(&mut ctx, "Potato", &[1.0, 2.0]).unwrap(), vec![251.0]);
    assert_eq!(run(&mut ctx, "Potato", &[-250.0, 2.0]).unwrap(), vec![0.0]);
}

#[test]
fn test_counter_loop() {
    let bytes = counter_archive();
    let mut ctx = prepared(&bytes);
    assert_eq!(run(&mut ctx, "count", &[10.0]).unwrap(), vec![10.0]);
}

#[test]
fn test_interrupt_from_another_thread() {
    let bytes = counter_archive();
    let mut ctx = prepared(&bytes);
    let def = ctx.find_def("count").unwrap();
    // float addition stalls at 2^24, so this never terminates by itself
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
    let first = ctx.execute(&def, Some(&mut rvals));
    done.store(true, Ordering::Relaxed);
    poker.join().unwrap();
    assert_eq!(first, Ok(Execution::Interrupted));
    assert_eq!(ctx.current_def().map(|d| d.offset), Some(def.offset));
    assert!(ctx.current_instruction() < 4);

    // Lower the limit; the loop exits at its next comparison.
    ctx.update_args(&def, 0, &[0.0]).unwrap();
    assert_eq!(ctx.resume(&def, Some(&mut rvals)), Ok(Execution::Complete(1)));
    assert!(rvals[0] >= 1.0);
    assert_eq!(ctx.current_def(), None);
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

/// `ticks(limit)`: sums `tick(i)` for `i` in `1..=limit`. The loop head is
/// instruction 3 and the extcall instruction 4.
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
fn test_resume_after_interrupt_at_every_iteration() {
    let bytes = ticking_archive();
    let mut ctx = Context::new(8192).unwrap();
    ctx.set_extcalls(ExtcallTable::new(vec![ExtcallInfo::native("tick", 1, 1, tick)])).unwrap();
    ctx.load_inplace_archive(&bytes).unwrap();
    ctx.prepare_archive().unwrap();
    let def = ctx.find_def("ticks").unwrap();
    let limit = 12;
    ctx.update_args(&def, 0, &[limit as f32]).unwrap();

    let mut expected = [0.0];
    assert_eq!(ctx.execute(&def, Some(&mut expected)), Ok(Execution::Complete(1)));
    assert_eq!(expected[0], 42.0);

    for n in 1..=limit {
        interrupt_on_tick(ctx.interrupt_handle(), n);
        let mut rvals = [0.0];
        assert_eq!(ctx.execute(&def, Some(&mut rvals)), Ok(Execution::Interrupted), "tick {}", n);
        // stopped right after the extcall
        assert_eq!(ctx.current_instruction(), 5);
        assert_eq!(ctx.resume(&def, Some(&mut rvals)), Ok(Execution::Complete(1)));
        assert_eq!(rvals, expected, "interrupted at tick {}", n);
    }
}

#[test]
fn test_resume_requires_same_def() {
    let mut b = ArchiveBuilder::new();
    let code = b.code(&[Instruction::new(Opcode::AssignSS, 0, 0, 1)]);
    b.def("a", def_flags::NONE, code, 2, 1, 1);
    b.def("b", def_flags::NONE, code, 2, 1, 1);
    let bytes = b.build();
    let mut ctx = prepared(&bytes);
    let b_def = ctx.find_def("b").unwrap();
    assert_eq!(ctx.resume(&b_def, None), Err(LmntError::DefMismatch));
}

fn double(_info: &ExtcallInfo, args: &[f32], rvals: &mut [f32]) -> Result<(), LmntError> {
    rvals[0] = args[0] * 2.0;
    Ok(())
}

fn refuse(_info: &ExtcallInfo, _args: &[f32], _rvals: &mut [f32]) -> Result<(), LmntError> {
    Err(LmntError::Extcall(-0x1234))
}

fn extcall_archive(callee: &str) -> Vec<u8> {
    let mut b = ArchiveBuilder::new();
    let target = b.extern_def(callee, 1, 1);
    let (lo, hi) = split(target);
    let code = b.code(&[Instruction::new(Opcode::Extcall, lo, hi, 0)]);
    b.def("f", def_flags::NONE, code, 2, 1, 1);
    b.build()
}

#[test]
fn test_extcall_from_code() {
    let bytes = extcall_archive("double");
    let mut ctx = Context::new(8192).unwrap();
    ctx.set_extcalls(ExtcallTable::new(vec![
        ExtcallInfo::native("refuse", 1, 1, refuse),
        ExtcallInfo::native("double", 1, 1, double),
    ]))
    .unwrap();
    ctx.load_inplace_archive(&bytes).unwrap();
    ctx.prepare_archive().unwrap();
    assert_eq!(ctx.find_extcall("double", 1, 1), Ok(1));
    assert_eq!(run(&mut ctx, "f", &[21.0]).unwrap(), vec![42.0]);
}

#[test]
fn test_extcall_error_propagates() {
    let bytes = extcall_archive("refuse");
    let mut ctx = Context::new(8192).unwrap();
    ctx.set_extcalls(ExtcallTable::new(vec![ExtcallInfo::native("refuse", 1, 1, refuse)])).unwrap();
    ctx.load_inplace_archive(&bytes).unwrap();
    ctx.prepare_archive().unwrap();
    let err = run(&mut ctx, "f", &[1.0]).unwrap_err();
    assert_eq!(err, LmntError::Extcall(-0x1234));
    assert_eq!(err.code(), -0x1234);
    // the context stays usable
    assert_eq!(ctx.current_def(), None);
}

#[test]
fn test_extcall_signature_must_match() {
    let bytes = extcall_archive("double");
    let mut ctx = Context::new(8192).unwrap();
    ctx.set_extcalls(ExtcallTable::new(vec![ExtcallInfo::native("double", 2, 1, double)])).unwrap();
    ctx.load_inplace_archive(&bytes).unwrap();
    assert_eq!(ctx.prepare_archive(), Err(LmntError::MissingExtcall));
}

#[test]
fn test_unprepared_archive() {
    let bytes = simple125_archive();
    let mut ctx = Context::new(8192).unwrap();
    ctx.load_inplace_archive(&bytes).unwrap();
    assert!(ctx.find_def("Potato").is_err());
}
