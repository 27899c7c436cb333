//! Global move resolution across trace boundaries and merge edges.
//!
//! After every trace has been allocated, each block carries a location set
//! for its entry and exit boundary. For every control-flow edge this pass
//! computes the relocations needed to make the source block's outgoing
//! locations match the destination block's incoming locations:
//!
//! 1. At a merge point, every incoming block parameter is paired with the
//!    predecessor's outgoing argument.
//! 2. The remaining live values are matched pairwise by a merge join over
//!    the sorted value arrays; a differing pair yields a relocation. An edge
//!    whose two boundaries reference the *same* location set is skipped
//!    outright — strategies share a set when nothing changes.
//! 3. Moves are placed before the terminator of the source block when it has
//!    a single successor, and at the start of the destination block
//!    otherwise. Critical edges must have been split upstream; this is
//!    asserted, not handled.
//!
//! The accumulated relocations for one edge are serialized by the parallel
//! move resolver, which orders them safely and breaks cycles.

use alloc::vec::Vec;

use crate::entity::EntitySet;
use crate::function::{Block, Function, Value};
use crate::internal::liveness::{GlobalLiveness, VarLocation};
use crate::internal::parallel_moves::ParallelMoves;
use crate::internal::spill_slots::SpillSlots;
use crate::output::{Allocation, Edit, MovePosition};
use crate::reginfo::{PhysReg, RegInfo};
use crate::Stats;

pub struct MoveResolver {
    /// All edits of the function, sorted by position once resolution is
    /// done.
    edits: Vec<(MovePosition, Edit)>,

    parallel_moves: ParallelMoves,

    /// Scratch: registers holding a live value around the current edge.
    occupied: EntitySet<PhysReg>,
}

impl MoveResolver {
    pub fn new() -> Self {
        Self {
            edits: Vec::new(),
            parallel_moves: ParallelMoves::new(),
            occupied: EntitySet::new(),
        }
    }

    /// Discards the edits of the previous function.
    pub fn clear(&mut self) {
        self.edits.clear();
    }

    /// The function's edits, sorted by position.
    pub fn edits(&self) -> &[(MovePosition, Edit)] {
        &self.edits
    }

    /// Edit list for the per-trace strategies to append to.
    pub fn edits_mut(&mut self) -> &mut Vec<(MovePosition, Edit)> {
        &mut self.edits
    }

    /// Walks every control-flow edge and inserts the reconciling moves.
    ///
    /// Edges internal to a trace where nothing changed reference the same
    /// location set on both sides and cost one id comparison.
    pub fn resolve<F: Function, R: RegInfo>(
        &mut self,
        func: &F,
        reginfo: &R,
        liveness: &GlobalLiveness,
        spill_slots: &mut SpillSlots,
        stats: &mut Stats,
    ) {
        for from in func.blocks() {
            for &to in func.block_succs(from) {
                self.resolve_edge(func, reginfo, liveness, spill_slots, stats, from, to);
            }
        }

        // Late edits sort after early edits at the same boundary; edits at
        // one position keep their emission order.
        self.edits.sort_by_key(|&(pos, _)| pos);
    }

    fn resolve_edge<F: Function, R: RegInfo>(
        &mut self,
        func: &F,
        reginfo: &R,
        liveness: &GlobalLiveness,
        spill_slots: &mut SpillSlots,
        stats: &mut Stats,
        from: Block,
        to: Block,
    ) {
        let merge = func.block_preds(to).len() > 1;
        let out_set = liveness.out_set(from).expect("source block not allocated");
        let in_set = liveness.in_set(to).expect("destination block not allocated");

        // Shared set: the strategies already guarantee both sides agree.
        if out_set == in_set && !merge {
            return;
        }

        assert!(
            func.block_succs(from).len() == 1 || func.block_preds(to).len() == 1,
            "critical edge {from}->{to} must be split before register allocation",
        );

        trace!("resolving edge {from}->{to}");
        self.parallel_moves.new_parallel_move();
        let out_data = liveness.set_data(out_set);
        let in_data = liveness.set_data(in_set);

        // Incoming block parameters receive the predecessor's outgoing
        // argument.
        for (&param, &arg) in func
            .block_params(to)
            .iter()
            .zip(func.jump_blockparams(from))
        {
            let to_loc = in_data
                .location_of(param)
                .unwrap_or_else(VarLocation::none);
            let from_loc = out_data
                .location_of(arg)
                .unwrap_or_else(VarLocation::none);
            self.add_mapping(func, arg, param, from_loc, to_loc);
        }

        // Values live across the edge in their own right: merge join over
        // the sorted value arrays.
        if out_set != in_set {
            let (mut i, mut j) = (0, 0);
            while i < out_data.values.len() && j < in_data.values.len() {
                let out_value = out_data.values[i];
                let in_value = in_data.values[j];
                if out_value < in_value {
                    i += 1;
                } else if out_value > in_value {
                    // Typically an incoming block parameter, already paired
                    // above.
                    j += 1;
                } else {
                    self.add_mapping(func, out_value, out_value, out_data.locs[i], in_data.locs[j]);
                    i += 1;
                    j += 1;
                }
            }
        }

        if self.parallel_moves.is_empty() {
            return;
        }
        stat!(stats, resolved_edges);

        // Placement: before the terminator when the source block falls
        // through to a single successor, otherwise at the very start of the
        // destination (its other predecessors are unaffected since critical
        // edges are split).
        let pos = if func.block_succs(from).len() == 1 {
            MovePosition::late(func.block_insts(from).last())
        } else {
            MovePosition::early(func.block_insts(to).from)
        };

        // A register may serve as scratch if it holds no live value on
        // either side of the edge.
        self.occupied.clear_and_resize(reginfo.num_regs());
        for loc in out_data.locs.iter().chain(&in_data.locs) {
            if let Some(reg) = loc.alloc.expand().and_then(Allocation::as_reg) {
                self.occupied.insert(reg);
            }
        }

        let occupied = &self.occupied;
        self.parallel_moves.resolve(
            reginfo,
            |value| func.value_class(value),
            |reg| !occupied.contains(reg),
            |stats| spill_slots.alloc_emergency(stats),
            stats,
        );
        for edit in self.parallel_moves.edits() {
            stat!(stats, resolution_moves);
            self.edits.push((pos, edit));
        }
    }

    /// Queues the relocation of one value across an edge.
    ///
    /// `dest_value` names the value as the destination block knows it (the
    /// block parameter at a merge, the value itself otherwise).
    fn add_mapping<F: Function>(
        &mut self,
        func: &F,
        src_value: Value,
        dest_value: Value,
        from_loc: VarLocation,
        to_loc: VarLocation,
    ) {
        // A destination with no location needs no data movement: either the
        // value is a constant or it has no legal location on this path.
        let Some(to_alloc) = to_loc.alloc.expand() else {
            return;
        };

        // A shadowed destination is two independent destinations, one per
        // physical location.
        let mut dests: [Option<Allocation>; 2] = [Some(to_alloc), None];
        if let Some(shadow) = to_loc.shadow.expand() {
            dests[1] = Some(Allocation::spillslot(shadow));
        }

        for dest in dests.into_iter().flatten() {
            if func.value_is_constant(src_value) {
                self.parallel_moves.add_remat(dest, dest_value);
                continue;
            }
            let Some(from_alloc) = Self::pick_source(from_loc, dest) else {
                // No live source on this path; nothing to relocate.
                continue;
            };
            if from_alloc == dest {
                continue;
            }
            self.parallel_moves.add_move(from_alloc, dest, dest_value);
        }
    }

    /// Chooses which physical location of a (possibly shadowed) source to
    /// read from, or `None` when the move is unnecessary.
    fn pick_source(from_loc: VarLocation, dest: Allocation) -> Option<Allocation> {
        // If the destination is the source's stack shadow, the value is
        // already there.
        if let Some(shadow) = from_loc.shadow.expand() {
            if dest == Allocation::spillslot(shadow) {
                return None;
            }
        }
        match from_loc.alloc.expand() {
            Some(alloc) => Some(alloc),
            // Register gone but the stack shadow survives.
            None => from_loc
                .shadow
                .expand()
                .map(Allocation::spillslot),
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;

    use super::*;
    use crate::debug_utils::{GenericFunction, GenericRegInfo};
    use crate::function::Operand;
    use crate::internal::spill_slots::SpillSlots;
    use crate::output::SpillSlot;
    use crate::reginfo::PhysReg;

    fn reg_loc(index: usize) -> VarLocation {
        VarLocation::new(Allocation::reg(PhysReg::new(index)))
    }

    fn slot_loc(index: usize) -> VarLocation {
        VarLocation::new(Allocation::spillslot(SpillSlot::new(index)))
    }

    /// Three registers live across a trivial pass-through block; the
    /// destination block expects one of them spilled. Exactly one store must
    /// be inserted, on the pass-through block's outgoing edge.
    #[test]
    fn spilled_value_crossing_trivial_block_gets_one_store() {
        let (reginfo, class) = GenericRegInfo::with_reg_count(3);
        let mut func = GenericFunction::new();
        let v1 = func.new_value(class);
        let v2 = func.new_value(class);
        let v3 = func.new_value(class);

        let b0 = func.create_block(1.0);
        let b1 = func.create_block(1.0);
        let b2 = func.create_block(1.0);
        func.add_inst(b0, &[Operand::regclass_def(v1, class)]);
        func.add_inst(b0, &[Operand::regclass_def(v2, class)]);
        func.add_inst(b0, &[Operand::regclass_def(v3, class)]);
        func.add_jump(b0, b1, &[]);
        func.add_jump(b1, b2, &[]);
        func.add_ret(
            b2,
            &[
                Operand::regclass_use(v1, class),
                Operand::any_use(v2, class),
                Operand::regclass_use(v3, class),
            ],
        );

        let mut liveness = GlobalLiveness::new();
        liveness.compute(&func, &mut crate::Stats::default());

        // Boundary state as the strategies would have recorded it: b0 exits
        // with {v1:r0, v2:r1, v3:r2}; b1 shares that set on both sides (the
        // trivial fast path); b2 expects v2 spilled to slot 0.
        let exit = liveness.push_set(
            vec![v1, v2, v3],
            vec![reg_loc(0), reg_loc(1), reg_loc(2)],
        );
        let entry2 = liveness.push_set(
            vec![v1, v2, v3],
            vec![reg_loc(0), slot_loc(0), reg_loc(2)],
        );
        liveness.set_out_set(b0, exit);
        liveness.set_in_set(b1, exit);
        liveness.set_out_set(b1, exit);
        liveness.set_in_set(b2, entry2);

        let mut resolver = MoveResolver::new();
        let mut spill_slots = SpillSlots::new();
        spill_slots.clear(func.num_values());
        let mut stats = crate::Stats::default();
        resolver.resolve(&func, &reginfo, &liveness, &mut spill_slots, &mut stats);

        let edits = resolver.edits();
        assert_eq!(edits.len(), 1, "{edits:?}");
        let (pos, edit) = edits[0];
        assert_eq!(pos, MovePosition::late(func.block_insts(b1).last()));
        assert_eq!(edit.value.expand(), Some(v2));
        assert_eq!(edit.from.expand(), Some(Allocation::reg(PhysReg::new(1))));
        assert_eq!(edit.to, Allocation::spillslot(SpillSlot::new(0)));
    }

    /// A single-block function has no edges and therefore no resolution
    /// moves.
    #[test]
    fn single_block_has_no_resolution_edges() {
        let (reginfo, class) = GenericRegInfo::with_reg_count(2);
        let mut func = GenericFunction::new();
        let v0 = func.new_value(class);
        let b0 = func.create_block(1.0);
        func.add_inst(b0, &[Operand::regclass_def(v0, class)]);
        func.add_ret(b0, &[Operand::regclass_use(v0, class)]);

        let mut liveness = GlobalLiveness::new();
        liveness.compute(&func, &mut crate::Stats::default());

        let mut resolver = MoveResolver::new();
        let mut spill_slots = SpillSlots::new();
        spill_slots.clear(func.num_values());
        let mut stats = crate::Stats::default();
        resolver.resolve(&func, &reginfo, &liveness, &mut spill_slots, &mut stats);
        assert!(resolver.edits().is_empty());
        assert_eq!(stats.resolved_edges, 0);
    }

    /// Phi mappings at a merge pair the predecessor's outgoing argument with
    /// the incoming block parameter, rotating through a scratch location
    /// when the mappings form a cycle.
    #[test]
    fn phi_swap_cycle_is_resolved() {
        let (reginfo, class) = GenericRegInfo::with_reg_count(3);
        let mut func = GenericFunction::new();
        let a = func.new_value(class);
        let b = func.new_value(class);
        let pa = func.new_value(class);
        let pb = func.new_value(class);

        let b0 = func.create_block(1.0);
        let b1 = func.create_block(1.0);
        let b2 = func.create_block(1.0);
        func.set_block_params(b2, &[pa, pb]);
        func.add_inst(b0, &[Operand::regclass_def(a, class)]);
        func.add_inst(b0, &[Operand::regclass_def(b, class)]);
        func.add_branch(b0, &[], &[b1]);
        func.add_jump(b1, b2, &[a, b]);
        func.add_ret(
            b2,
            &[
                Operand::regclass_use(pa, class),
                Operand::regclass_use(pb, class),
            ],
        );
        // A second predecessor, filled last, so that b2 is a genuine merge.
        let b3 = func.create_block(0.1);
        func.add_jump(b3, b2, &[a, b]);

        let mut liveness = GlobalLiveness::new();
        liveness.compute(&func, &mut crate::Stats::default());

        // b1 exits with {a:r0, b:r1}; b2 wants the parameters swapped:
        // {pa:r1, pb:r0}.
        let exit = liveness.push_set(vec![a, b], vec![reg_loc(0), reg_loc(1)]);
        let entry = liveness.push_set(vec![pa, pb], vec![reg_loc(1), reg_loc(0)]);
        liveness.set_out_set(b1, exit);
        liveness.set_in_set(b2, entry);
        liveness.set_out_set(b3, exit);

        let mut resolver = MoveResolver::new();
        let mut spill_slots = SpillSlots::new();
        spill_slots.clear(func.num_values());
        let mut stats = crate::Stats::default();
        for &pred in func.block_preds(b2) {
            resolver.resolve_edge(
                &func,
                &reginfo,
                &liveness,
                &mut spill_slots,
                &mut stats,
                pred,
                b2,
            );
        }
        assert!(stats.move_cycles >= 1);

        // Execute the b1 -> b2 edge moves and check the final state.
        let mut state: Vec<(Allocation, Value)> =
            vec![(Allocation::reg(PhysReg::new(0)), a), (Allocation::reg(PhysReg::new(1)), b)];
        let lookup = |state: &Vec<(Allocation, Value)>, alloc: Allocation| {
            state.iter().find(|&&(a, _)| a == alloc).map(|&(_, v)| v)
        };
        for &(pos, edit) in resolver.edits() {
            if pos.inst() != func.block_insts(b1).last() {
                continue;
            }
            let value = match edit.from.expand() {
                Some(from) => lookup(&state, from).expect("read of dead location"),
                None => edit.value.unwrap(),
            };
            let value = if edit.value.is_some() {
                edit.value.unwrap()
            } else {
                value
            };
            state.retain(|&(a, _)| a != edit.to);
            state.push((edit.to, value));
        }
        assert_eq!(lookup(&state, Allocation::reg(PhysReg::new(1))), Some(pa));
        assert_eq!(lookup(&state, Allocation::reg(PhysReg::new(0))), Some(pb));
    }

    #[test]
    fn constant_source_is_rematerialized() {
        let (reginfo, class) = GenericRegInfo::with_reg_count(2);
        let mut func = GenericFunction::new();
        let k = func.new_constant(class);
        let b0 = func.create_block(1.0);
        let b1 = func.create_block(1.0);
        func.add_jump(b0, b1, &[]);
        func.add_ret(b1, &[Operand::regclass_use(k, class)]);

        let mut liveness = GlobalLiveness::new();
        liveness.compute(&func, &mut crate::Stats::default());

        // The constant has no storage on exit from b0 but b1 wants it in a
        // register: a rematerialization, not a move.
        let exit = liveness.push_set(vec![k], vec![VarLocation::none()]);
        let entry = liveness.push_set(vec![k], vec![reg_loc(0)]);
        liveness.set_out_set(b0, exit);
        liveness.set_in_set(b1, entry);

        let mut resolver = MoveResolver::new();
        let mut spill_slots = SpillSlots::new();
        spill_slots.clear(func.num_values());
        let mut stats = crate::Stats::default();
        resolver.resolve(&func, &reginfo, &liveness, &mut spill_slots, &mut stats);

        let edits = resolver.edits();
        assert_eq!(edits.len(), 1);
        assert!(edits[0].1.from.is_none());
        assert_eq!(edits[0].1.value.expand(), Some(k));
    }
}
