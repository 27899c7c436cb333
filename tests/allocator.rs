//! Whole-pipeline tests: build a function, allocate it under every
//! combination of options, and re-check the result with the independent
//! register state verifier.

use tracealloc::debug_utils::{
    validate_function, verify_output, GenericFunction, GenericRegInfo,
};
use tracealloc::function::{Function, Operand};
use tracealloc::output::Allocation;
use tracealloc::{Options, RegAllocError, TraceAllocator, TraceStrategy};

fn all_options() -> Vec<Options> {
    let mut out = Vec::new();
    for trace_strategy in [
        TraceStrategy::SingleBlock,
        TraceStrategy::UniDirectional,
        TraceStrategy::BiDirectional,
    ] {
        for schedule_trivial_traces_early in [false, true] {
            for inter_trace_hints in [false, true] {
                for cache_stack_slots in [false, true] {
                    out.push(Options {
                        trace_strategy,
                        schedule_trivial_traces_early,
                        inter_trace_hints,
                        cache_stack_slots,
                        ..Options::default()
                    });
                }
            }
        }
    }
    out
}

/// Allocates `func` under every option combination and verifies each result.
/// Returns the number of spill slots used under default options.
fn check(func: &GenericFunction, reginfo: &GenericRegInfo) -> usize {
    validate_function(func, reginfo).expect("invalid test function");
    let mut spillslots = 0;
    for options in all_options() {
        let mut allocator = TraceAllocator::new();
        let output = allocator
            .allocate_registers(func, reginfo, &options)
            .expect("allocation failed");
        verify_output(&output).unwrap_or_else(|err| {
            panic!("verification failed with {options:?}:\n{err}\noutput:\n{output}")
        });
        if options.trace_strategy == TraceStrategy::BiDirectional {
            spillslots = output.num_spillslots();
        }
    }
    spillslots
}

#[test]
fn straight_line() {
    let (reginfo, class) = GenericRegInfo::with_reg_count(4);
    let mut func = GenericFunction::new();
    let v0 = func.new_value(class);
    let v1 = func.new_value(class);
    let v2 = func.new_value(class);

    let b0 = func.create_block(1.0);
    func.add_inst(b0, &[Operand::regclass_def(v0, class)]);
    func.add_inst(
        b0,
        &[
            Operand::regclass_def(v1, class),
            Operand::regclass_use(v0, class),
        ],
    );
    func.add_inst(
        b0,
        &[
            Operand::regclass_def(v2, class),
            Operand::regclass_use(v0, class),
            Operand::regclass_use(v1, class),
        ],
    );
    func.add_ret(b0, &[Operand::regclass_use(v2, class)]);

    let spillslots = check(&func, &reginfo);
    assert_eq!(spillslots, 0);
}

#[test]
fn single_block_function_has_no_edits() {
    let (reginfo, class) = GenericRegInfo::with_reg_count(2);
    let mut func = GenericFunction::new();
    let v0 = func.new_value(class);
    let b0 = func.create_block(1.0);
    func.add_inst(b0, &[Operand::regclass_def(v0, class)]);
    func.add_ret(b0, &[Operand::regclass_use(v0, class)]);

    let mut allocator = TraceAllocator::new();
    let output = allocator
        .allocate_registers(&func, &reginfo, &Options::default())
        .unwrap();
    verify_output(&output).unwrap();
    assert!(output.edits().is_empty());
    assert!(output.allocs(func.block_insts(b0).from)[0].is_reg());
}

#[test]
fn diamond_with_block_params() {
    let (reginfo, class) = GenericRegInfo::with_reg_count(4);
    let mut func = GenericFunction::new();
    let v0 = func.new_value(class);
    let t = func.new_value(class);
    let e = func.new_value(class);
    let phi = func.new_value(class);

    let b0 = func.create_block(1.0);
    let b1 = func.create_block(0.5);
    let b2 = func.create_block(0.5);
    let b3 = func.create_block(1.0);
    func.set_block_params(b3, &[phi]);

    func.add_inst(b0, &[Operand::regclass_def(v0, class)]);
    func.add_branch(b0, &[], &[b1, b2]);
    func.add_inst(
        b1,
        &[
            Operand::regclass_def(t, class),
            Operand::regclass_use(v0, class),
        ],
    );
    func.add_jump(b1, b3, &[t]);
    func.add_inst(
        b2,
        &[
            Operand::regclass_def(e, class),
            Operand::regclass_use(v0, class),
        ],
    );
    func.add_jump(b2, b3, &[e]);
    func.add_ret(
        b3,
        &[
            Operand::regclass_use(phi, class),
            Operand::regclass_use(v0, class),
        ],
    );

    check(&func, &reginfo);
}

#[test]
fn trivial_pass_through_arm() {
    let (reginfo, class) = GenericRegInfo::with_reg_count(4);
    let mut func = GenericFunction::new();
    let v0 = func.new_value(class);
    let v1 = func.new_value(class);

    // b1 does work, b2 is a bare pass-through jump eligible for the trivial
    // fast path.
    let b0 = func.create_block(1.0);
    let b1 = func.create_block(0.9);
    let b2 = func.create_block(0.1);
    let b3 = func.create_block(1.0);

    func.add_inst(b0, &[Operand::regclass_def(v0, class)]);
    func.add_branch(b0, &[], &[b1, b2]);
    func.add_inst(
        b1,
        &[
            Operand::regclass_def(v1, class),
            Operand::regclass_use(v0, class),
        ],
    );
    func.add_jump(b1, b3, &[]);
    func.add_jump(b2, b3, &[]);
    func.add_ret(b3, &[Operand::regclass_use(v0, class)]);

    check(&func, &reginfo);
}

#[test]
fn loop_with_carried_value() {
    let (reginfo, class) = GenericRegInfo::with_reg_count(3);
    let mut func = GenericFunction::new();
    let init = func.new_value(class);
    let outer = func.new_value(class);
    let p = func.new_value(class);
    let next = func.new_value(class);

    // b0 -> b1(p) -> b2 -> b1 (back-edge), b1 -> b3
    let b0 = func.create_block(1.0);
    let b1 = func.create_block(10.0);
    let b2 = func.create_block(9.0);
    let b3 = func.create_block(1.0);
    func.set_loop_flags(b1, true, false);
    func.set_loop_flags(b2, false, true);
    func.set_block_params(b1, &[p]);

    func.add_inst(b0, &[Operand::regclass_def(init, class)]);
    func.add_inst(b0, &[Operand::regclass_def(outer, class)]);
    func.add_jump(b0, b1, &[init]);
    func.add_branch(b1, &[], &[b2, b3]);
    func.add_inst(
        b2,
        &[
            Operand::regclass_def(next, class),
            Operand::regclass_use(p, class),
        ],
    );
    func.add_jump(b2, b1, &[next]);
    func.add_ret(
        b3,
        &[
            Operand::regclass_use(p, class),
            Operand::regclass_use(outer, class),
        ],
    );

    check(&func, &reginfo);
}

#[test]
fn register_pressure_forces_spills() {
    let (reginfo, class) = GenericRegInfo::with_reg_count(2);
    let mut func = GenericFunction::new();
    let values: Vec<_> = (0..4).map(|_| func.new_value(class)).collect();

    let b0 = func.create_block(1.0);
    for &v in &values {
        func.add_inst(b0, &[Operand::regclass_def(v, class)]);
    }
    for &v in &values {
        func.add_inst(b0, &[Operand::regclass_use(v, class)]);
    }
    func.add_ret(b0, &[]);

    let spillslots = check(&func, &reginfo);
    assert!(spillslots > 0, "4 live values in 2 registers must spill");
}

#[test]
fn spilled_value_survives_across_blocks() {
    let (reginfo, class) = GenericRegInfo::with_reg_count(2);
    let mut func = GenericFunction::new();
    let values: Vec<_> = (0..4).map(|_| func.new_value(class)).collect();

    // All four values are defined in b0 and only used in b2, forcing some
    // of them to cross b1 on the stack.
    let b0 = func.create_block(1.0);
    let b1 = func.create_block(1.0);
    let b2 = func.create_block(1.0);
    for &v in &values {
        func.add_inst(b0, &[Operand::regclass_def(v, class)]);
    }
    func.add_jump(b0, b1, &[]);
    func.add_jump(b1, b2, &[]);
    for &v in &values {
        func.add_inst(b2, &[Operand::regclass_use(v, class)]);
    }
    func.add_ret(b2, &[]);

    let spillslots = check(&func, &reginfo);
    assert!(spillslots > 0);
}

#[test]
fn call_clobbers_are_respected() {
    let mut reginfo = GenericRegInfo::new();
    let class = reginfo.add_class();
    let r0 = reginfo.add_reg(class, true);
    let r1 = reginfo.add_reg(class, true);
    let _r2 = reginfo.add_reg(class, false);

    let mut func = GenericFunction::new();
    let v0 = func.new_value(class);
    let v1 = func.new_value(class);

    let b0 = func.create_block(1.0);
    func.add_inst(b0, &[Operand::regclass_def(v0, class)]);
    func.add_inst(b0, &[Operand::regclass_def(v1, class)]);
    // A call destroying r0 and r1 while both values are live.
    func.add_inst_with_clobbers(b0, &[], &[r0, r1]);
    func.add_inst(b0, &[Operand::regclass_use(v0, class)]);
    func.add_ret(b0, &[Operand::regclass_use(v1, class)]);

    check(&func, &reginfo);
}

#[test]
fn fixed_register_constraints() {
    let mut reginfo = GenericRegInfo::new();
    let class = reginfo.add_class();
    let r0 = reginfo.add_reg(class, true);
    let r1 = reginfo.add_reg(class, true);
    let _r2 = reginfo.add_reg(class, true);

    let mut func = GenericFunction::new();
    let v0 = func.new_value(class);
    let v1 = func.new_value(class);

    let b0 = func.create_block(1.0);
    // v0 is produced in r1 (e.g. a call return value) and later consumed
    // from r0 (e.g. an argument register).
    func.add_inst(b0, &[Operand::fixed_def(v0, r1)]);
    func.add_inst(
        b0,
        &[
            Operand::regclass_def(v1, class),
            Operand::regclass_use(v0, class),
        ],
    );
    func.add_inst(
        b0,
        &[
            Operand::fixed_use(v0, r0),
            Operand::regclass_use(v1, class),
        ],
    );
    func.add_ret(b0, &[]);

    let mut allocator = TraceAllocator::new();
    let output = allocator
        .allocate_registers(&func, &reginfo, &Options::default())
        .unwrap();
    verify_output(&output).unwrap();

    // The fixed operands must report exactly the required registers.
    let insts: Vec<_> = func.block_insts(b0).iter().collect();
    assert_eq!(output.allocs(insts[0]), &[Allocation::reg(r1)]);
    assert_eq!(output.allocs(insts[2])[0], Allocation::reg(r0));
}

#[test]
fn constant_block_argument_is_rematerialized() {
    let (reginfo, class) = GenericRegInfo::with_reg_count(3);
    let mut func = GenericFunction::new();
    let v0 = func.new_value(class);
    let k = func.new_constant(class);
    let phi = func.new_value(class);

    let b0 = func.create_block(1.0);
    let b1 = func.create_block(0.5);
    let b2 = func.create_block(0.5);
    let b3 = func.create_block(1.0);
    func.set_block_params(b3, &[phi]);

    func.add_inst(b0, &[Operand::regclass_def(v0, class)]);
    func.add_branch(b0, &[], &[b1, b2]);
    func.add_jump(b1, b3, &[v0]);
    func.add_jump(b2, b3, &[k]);
    func.add_ret(b3, &[Operand::regclass_use(phi, class)]);

    check(&func, &reginfo);

    // On the b2 edge the parameter must be created by a rematerialization.
    let mut allocator = TraceAllocator::new();
    let output = allocator
        .allocate_registers(&func, &reginfo, &Options::default())
        .unwrap();
    let b2_term = func.block_insts(b2).last();
    let remat = output
        .edits()
        .iter()
        .any(|(pos, edit)| pos.inst() == b2_term && edit.from.is_none());
    assert!(remat, "expected a rematerialization on the b2 edge");
}

#[test]
fn impossible_constraints_are_reported() {
    let (reginfo, class) = GenericRegInfo::with_reg_count(1);
    let mut func = GenericFunction::new();
    let v0 = func.new_value(class);
    let v1 = func.new_value(class);

    let b0 = func.create_block(1.0);
    func.add_inst(b0, &[Operand::regclass_def(v0, class)]);
    func.add_inst(b0, &[Operand::regclass_def(v1, class)]);
    // Two mandatory-register reads with a single register: unsatisfiable.
    func.add_inst(
        b0,
        &[
            Operand::regclass_use(v0, class),
            Operand::regclass_use(v1, class),
        ],
    );
    func.add_ret(b0, &[]);

    let mut allocator = TraceAllocator::new();
    let result = allocator.allocate_registers(&func, &reginfo, &Options::default());
    assert!(matches!(result, Err(RegAllocError::TooManyLiveRegs)));
}

#[test]
fn stats_are_printable() {
    let (reginfo, class) = GenericRegInfo::with_reg_count(2);
    let mut func = GenericFunction::new();
    let v0 = func.new_value(class);
    let b0 = func.create_block(1.0);
    func.add_inst(b0, &[Operand::regclass_def(v0, class)]);
    func.add_ret(b0, &[Operand::regclass_use(v0, class)]);

    let mut allocator = TraceAllocator::new();
    let output = allocator
        .allocate_registers(&func, &reginfo, &Options::default())
        .unwrap();
    let stats = format!("{}", output.stats());
    assert!(stats.contains("traces"));
}
