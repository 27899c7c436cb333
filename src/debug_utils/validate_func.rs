//! Validation of the structural contract on input functions.
//!
//! The allocator itself only `debug_assert!`s its input contract; this
//! validator gives clients a non-panicking way to check a function before
//! handing it to the allocator. Passing validation does not guarantee that
//! allocation succeeds (constraints may still be unsatisfiable), but failing
//! it means the allocator's behavior is undefined.

use anyhow::{bail, ensure, Result};

use crate::entity::EntitySet;
use crate::function::{Block, Function, OperandConstraint, OperandKind, Value};
use crate::reginfo::RegInfo;

/// Checks the structural invariants of a [`Function`].
pub fn validate_function<F: Function, R: RegInfo>(func: &F, reginfo: &R) -> Result<()> {
    ensure!(func.num_blocks() > 0, "function has no blocks");
    ensure!(
        func.block_preds(Block::ENTRY_BLOCK).is_empty(),
        "the entry block cannot have predecessors"
    );

    let mut next_inst = 0;
    for block in func.blocks() {
        let insts = func.block_insts(block);
        ensure!(!insts.is_empty(), "{block} has no instructions");
        ensure!(
            insts.from.index() == next_inst,
            "{block} instructions are not contiguous with the previous block"
        );
        next_inst = insts.to.index();

        for inst in insts.iter() {
            ensure!(
                func.inst_is_terminator(inst) == (inst == insts.last()),
                "{inst} must be a terminator exactly if it ends {block}"
            );
            ensure!(
                func.inst_block(inst) == block,
                "{inst} does not map back to {block}"
            );
        }

        // Predecessor/successor consistency.
        for &succ in func.block_succs(block) {
            ensure!(
                func.block_preds(succ).contains(&block),
                "{block} -> {succ} edge missing from predecessor list"
            );
        }
        for &pred in func.block_preds(block) {
            ensure!(
                func.block_succs(pred).contains(&block),
                "{pred} -> {block} edge missing from successor list"
            );
        }

        // Critical edges must be split before allocation: the move resolver
        // needs a block in which edge moves can be placed.
        if func.block_succs(block).len() > 1 {
            for &succ in func.block_succs(block) {
                ensure!(
                    func.block_preds(succ).len() == 1,
                    "critical edge {block} -> {succ} must be split"
                );
            }
        }

        // A def on a terminator has no boundary after it at which its result
        // could be reconciled with the successors.
        ensure!(
            func.inst_operands(insts.last())
                .iter()
                .all(|operand| !operand.is_def()),
            "terminator of {block} has a def operand"
        );

        if !func.block_params(block).is_empty() {
            ensure!(
                func.block_preds(block).len() > 1,
                "{block} has block parameters but a single predecessor"
            );
        }
        // Single-successor terminators are where edge moves get inserted, so
        // they must not read or write anything themselves.
        if func.block_succs(block).len() == 1 {
            ensure!(
                func.inst_operands(insts.last()).is_empty(),
                "jump terminator of {block} cannot have operands"
            );
        }

        let jump_params = func.jump_blockparams(block);
        if !jump_params.is_empty() {
            let &[succ] = func.block_succs(block) else {
                bail!("{block} passes jump arguments but has multiple successors");
            };
            ensure!(
                jump_params.len() == func.block_params(succ).len(),
                "{block} passes {} jump arguments but {succ} expects {}",
                jump_params.len(),
                func.block_params(succ).len()
            );
            for (&arg, &param) in jump_params.iter().zip(func.block_params(succ)) {
                ensure!(
                    func.value_class(arg) == func.value_class(param),
                    "jump argument {arg} and parameter {param} are in different register classes"
                );
            }
        }
    }
    ensure!(
        next_inst == func.num_insts(),
        "blocks do not cover all instructions"
    );

    validate_ssa(func)?;
    validate_operands(func, reginfo)?;
    Ok(())
}

/// Checks that every value is defined exactly once, before its uses in the
/// linear order.
fn validate_ssa<F: Function>(func: &F) -> Result<()> {
    let mut defined = EntitySet::<Value>::new();
    defined.clear_and_resize(func.num_values());

    for block in func.blocks() {
        for &param in func.block_params(block) {
            ensure!(
                defined.insert(param),
                "block parameter {param} defined more than once"
            );
        }
        for inst in func.block_insts(block).iter() {
            for operand in func.inst_operands(inst) {
                match operand.kind() {
                    OperandKind::Def(value) => {
                        ensure!(
                            !func.value_is_constant(value),
                            "{inst} defines constant value {value}"
                        );
                        ensure!(defined.insert(value), "{value} defined more than once");
                    }
                    OperandKind::Use(value) => {
                        ensure!(
                            !func.value_is_constant(value),
                            "constant {value} used as an operand at {inst}; constants may only \
                             appear as outgoing block arguments"
                        );
                        ensure!(
                            defined.contains(value),
                            "{value} used at {inst} before its definition"
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

/// Checks operand constraints against the register description.
fn validate_operands<F: Function, R: RegInfo>(func: &F, reginfo: &R) -> Result<()> {
    for inst in func.insts() {
        for operand in func.inst_operands(inst) {
            let value = operand.value();
            ensure!(
                value.index() < func.num_values(),
                "{inst} references out-of-range {value}"
            );
            let class = func.value_class(value);
            ensure!(
                class.index() < reginfo.num_classes(),
                "{value} is in out-of-range {class}"
            );
            match operand.constraint() {
                OperandConstraint::Reg(c) | OperandConstraint::Any(c) => {
                    ensure!(
                        c == class,
                        "operand constraint class {c} does not match {value}'s class {class}"
                    );
                    ensure!(
                        !reginfo.allocation_order(c).is_empty(),
                        "{c} has an empty allocation order"
                    );
                }
                OperandConstraint::Fixed(reg) => {
                    ensure!(
                        reg.index() < reginfo.num_regs(),
                        "{inst} references out-of-range {reg}"
                    );
                    ensure!(
                        reginfo.reg_class(reg) == class,
                        "fixed register {reg} is not in {value}'s class {class}"
                    );
                }
            }
        }
        for &reg in func.inst_clobbers(inst) {
            ensure!(
                reg.index() < reginfo.num_regs(),
                "{inst} clobbers out-of-range {reg}"
            );
        }
    }
    Ok(())
}
