//! Register state verifier: an independent dataflow re-check of an
//! allocation.
//!
//! The verifier re-derives, by a forward dataflow pass over the finished
//! code (original instructions plus inserted edits), which value occupies
//! which location at every program point, and cross-checks every operand
//! read against the allocation the allocator assigned to it.
//!
//! The pass is a classic iterative worklist fixpoint: the entry block starts
//! with an empty location file, each block propagates its exit state to its
//! successors, and conflicting occupants at a join are demoted to "unknown"
//! (removed), re-enqueueing the successor. Occupant sets only shrink, so the
//! fixpoint terminates.
//!
//! Any mismatch is a hard error: it indicates a logic defect in the
//! allocator, not a property of the input.

use alloc::vec::Vec;

use anyhow::{ensure, Result};
use hashbrown::HashMap;
use rustc_hash::FxBuildHasher;

use crate::entity::packed_option::ReservedValue;
use crate::entity::{EntitySet, SecondaryMap};
use crate::function::{Block, Function, Inst, OperandKind, Value};
use crate::output::{Allocation, Edit, MovePosition, Output};
use crate::reginfo::RegInfo;

/// Which value each location is known to hold. Absent entries are unknown.
type LocationState = HashMap<Allocation, Value, FxBuildHasher>;

/// Re-checks the output of the register allocator.
///
/// Returns an error describing the first inconsistency found. Intended for
/// debug builds and tests; the pass is far too slow for production use.
pub fn verify_output<F: Function, R: RegInfo>(output: &Output<'_, F, R>) -> Result<()> {
    Verifier {
        output,
        edits: output.edits(),
        block_entry: SecondaryMap::new(),
        state: LocationState::default(),
        worklist: Vec::new(),
        queued: EntitySet::new(),
    }
    .run()
}

struct Verifier<'a, F, R> {
    output: &'a Output<'a, F, R>,
    edits: &'a [(MovePosition, Edit)],
    block_entry: SecondaryMap<Block, Option<LocationState>>,
    state: LocationState,
    worklist: Vec<Block>,
    queued: EntitySet<Block>,
}

impl<F: Function, R: RegInfo> Verifier<'_, F, R> {
    fn run(&mut self) -> Result<()> {
        trace!("verifying register allocator output");
        let func = self.output.function();
        self.block_entry.clear_and_resize(func.num_blocks());
        self.queued.clear_and_resize(func.num_blocks());

        self.block_entry[Block::ENTRY_BLOCK] = Some(LocationState::default());
        self.worklist.push(Block::ENTRY_BLOCK);
        self.queued.insert(Block::ENTRY_BLOCK);
        while let Some(block) = self.worklist.pop() {
            self.queued.remove(block);
            self.check_block(block)?;
        }
        trace!("verification complete");
        Ok(())
    }

    fn check_block(&mut self, block: Block) -> Result<()> {
        let func = self.output.function();
        self.state = self.block_entry[block].clone().unwrap();
        trace!("verifying {block}");

        for inst in func.block_insts(block).iter() {
            self.apply_edits_at(inst)?;
            self.check_inst(inst)?;
        }

        // Propagate the exit state to the successors, keeping only occupants
        // all predecessors agree on.
        for &succ in func.block_succs(block) {
            let changed = match &mut self.block_entry[succ] {
                Some(entry) => {
                    let before = entry.len();
                    entry.retain(|alloc, value| self.state.get(alloc).copied() == Some(*value));
                    entry.len() != before
                }
                entry @ None => {
                    *entry = Some(self.state.clone());
                    true
                }
            };
            if changed && self.queued.insert(succ) {
                self.worklist.push(succ);
            }
        }
        Ok(())
    }

    /// Applies the edits inserted at the boundary before `inst`, early ones
    /// first.
    fn apply_edits_at(&mut self, inst: Inst) -> Result<()> {
        let start = self
            .edits
            .partition_point(|&(pos, _)| pos < MovePosition::early(inst));
        for &(pos, edit) in &self.edits[start..] {
            if pos.inst() != inst {
                break;
            }
            self.apply_edit(pos, edit)?;
        }
        Ok(())
    }

    fn apply_edit(&mut self, pos: MovePosition, edit: Edit) -> Result<()> {
        trace!("  applying {edit} at {pos}");
        match (edit.value.expand(), edit.from.expand()) {
            // Rematerialization defines the value out of thin air.
            (Some(value), None) => {
                self.state.insert(edit.to, value);
            }
            (Some(value), Some(from)) => {
                let occupant = self.state.get(&from).copied();
                ensure!(
                    occupant.is_some(),
                    "move at {pos} reads {from} whose contents are unknown"
                );
                // Block-parameter moves on a jump retarget the value: the
                // source holds the outgoing argument, the destination
                // receives the parameter. Everywhere else the value must
                // match.
                ensure!(
                    occupant == Some(value) || pos.is_late(),
                    "move at {pos} expects {value} in {from} but found {:?}",
                    occupant
                );
                self.state.insert(edit.to, value);
            }
            // Scratch save/restore: transfer whatever the source holds.
            (None, Some(from)) => match self.state.get(&from).copied() {
                Some(value) => {
                    self.state.insert(edit.to, value);
                }
                None => {
                    self.state.remove(&edit.to);
                }
            },
            (None, None) => {}
        }
        Ok(())
    }

    fn check_inst(&mut self, inst: Inst) -> Result<()> {
        let func = self.output.function();
        let allocs = self.output.allocs(inst);
        let operands = func.inst_operands(inst);

        // Reads first: every use must find its value where the allocator
        // said it would be.
        for (operand, &alloc) in operands.iter().zip(allocs) {
            if let OperandKind::Use(value) = operand.kind() {
                if func.value_is_constant(value) {
                    continue;
                }
                if alloc.is_reserved_value() {
                    // Operand skipped by the allocator (dead code path).
                    continue;
                }
                let occupant = self.state.get(&alloc).copied();
                ensure!(
                    occupant == Some(value),
                    "{inst} reads {value} from {alloc} which holds {occupant:?}"
                );
            }
        }

        // Clobbers destroy their registers.
        for &reg in func.inst_clobbers(inst) {
            self.state.remove(&Allocation::reg(reg));
        }

        // Then writes.
        for (operand, &alloc) in operands.iter().zip(allocs) {
            if let OperandKind::Def(value) = operand.kind() {
                if alloc.is_reserved_value() {
                    continue;
                }
                self.state.insert(alloc, value);
            }
        }
        Ok(())
    }
}
