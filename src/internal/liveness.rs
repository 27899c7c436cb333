//! Global liveness information and per-block boundary locations.
//!
//! For every block this pass computes the sorted arrays of values live on
//! entry and live on exit. The arrays are sorted by value index so that the
//! move resolver can match values across a block boundary with a merge join
//! or a binary search.
//!
//! As traces are allocated, each block additionally records *where* each of
//! those values lives at the block boundary. The location arrays are owned by
//! a shared pool and referenced by [`LocSet`] id: a strategy which makes no
//! changes between two boundaries shares one set between them (the trivial
//! fast path relies on this), and the resolver skips an edge entirely when
//! both sides reference the same set.

use alloc::vec::Vec;
use core::fmt;

use crate::entity::{EntitySet, PackedOption, PrimaryMap, SecondaryMap};
use crate::function::{Block, Function, OperandKind, Value};
use crate::output::{Allocation, SpillSlot};
use crate::Stats;

entity_def! {
    /// A reference to a set of boundary locations in the shared pool.
    pub entity LocSet(u32, "locs");
}

/// The concrete storage of one live value at a block boundary.
///
/// A *shadowed* value is resident in a register and simultaneously has an
/// up-to-date copy in a spill slot; keeping both locations avoids a reload
/// after a spill-store. Constant values have no storage at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VarLocation {
    /// Primary location, or `None` for values without storage (constants,
    /// or values with no legal location on this path).
    pub alloc: PackedOption<Allocation>,

    /// Backing stack copy of a shadowed value.
    pub shadow: PackedOption<SpillSlot>,
}

impl VarLocation {
    /// A value resident in the given location only.
    pub fn new(alloc: Allocation) -> Self {
        Self {
            alloc: alloc.into(),
            shadow: None.into(),
        }
    }

    /// A value with no storage.
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether the value is register-resident with a backing stack copy.
    pub fn is_shadowed(self) -> bool {
        self.shadow.is_some()
    }
}

impl fmt::Display for VarLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.alloc.expand(), self.shadow.expand()) {
            (Some(alloc), Some(shadow)) => write!(f, "{alloc}+{shadow}"),
            (Some(alloc), None) => write!(f, "{alloc}"),
            (None, _) => f.write_str("-"),
        }
    }
}

/// One entry in the location pool: a sorted value array with the parallel
/// location array.
pub struct LocSetData {
    /// Values covered by this set, sorted by value index.
    pub values: Vec<Value>,

    /// Location of each value, parallel to `values`.
    pub locs: Vec<VarLocation>,
}

impl LocSetData {
    /// Looks up the location of a value by binary search.
    pub fn location_of(&self, value: Value) -> Option<VarLocation> {
        let idx = self.values.binary_search(&value).ok()?;
        Some(self.locs[idx])
    }
}

/// Per-block live-in/live-out value sets and their boundary locations.
pub struct GlobalLiveness {
    live_in: SecondaryMap<Block, Vec<Value>>,
    live_out: SecondaryMap<Block, Vec<Value>>,

    pool: PrimaryMap<LocSet, LocSetData>,
    in_sets: SecondaryMap<Block, PackedOption<LocSet>>,
    out_sets: SecondaryMap<Block, PackedOption<LocSet>>,

    /// Scratch bitsets used by the dataflow loop, kept for reuse.
    scratch_in: Vec<EntitySet<Value>>,
    scratch: EntitySet<Value>,
}

impl GlobalLiveness {
    pub fn new() -> Self {
        Self {
            live_in: SecondaryMap::new(),
            live_out: SecondaryMap::new(),
            pool: PrimaryMap::new(),
            in_sets: SecondaryMap::new(),
            out_sets: SecondaryMap::new(),
            scratch_in: Vec::new(),
            scratch: EntitySet::new(),
        }
    }

    /// Computes live-in/live-out sets for every block with a backward
    /// dataflow fixpoint.
    ///
    /// Block parameters count as live-in of their block (they need a location
    /// on entry) but never propagate into predecessors; the matching
    /// outgoing jump arguments are ordinary uses at the predecessor's
    /// terminator.
    pub fn compute(&mut self, func: &impl Function, stats: &mut Stats) {
        let num_blocks = func.num_blocks();
        let num_values = func.num_values();
        self.live_in.clear_and_resize(num_blocks);
        self.live_out.clear_and_resize(num_blocks);
        self.pool.clear();
        self.in_sets.clear_and_resize(num_blocks);
        self.out_sets.clear_and_resize(num_blocks);

        self.scratch_in.clear();
        self.scratch_in
            .resize_with(num_blocks, EntitySet::default);
        for set in &mut self.scratch_in {
            set.clear_and_resize(num_values);
        }

        // Iterate to a fixpoint. Liveness can only grow, so this terminates;
        // a single backward pass already converges for reducible CFGs without
        // values live across a loop back-edge.
        loop {
            let mut changed = false;
            for block in func.blocks().rev() {
                let live = &mut self.scratch;
                live.clear_and_resize(num_values);

                // Live-out: union of successor live-ins minus their params.
                for &succ in func.block_succs(block) {
                    for value in self.scratch_in[succ.index()].iter() {
                        if !func.block_params(succ).contains(&value) {
                            live.insert(value);
                        }
                    }
                }
                self.live_out[block].clear();
                self.live_out[block].extend(live.iter());

                // Walk the block backwards, killing defs and adding uses.
                for inst in func.block_insts(block).iter().rev() {
                    if func.inst_is_terminator(inst) {
                        // Constants have no storage to track; they are
                        // rematerialized at the receiving edge.
                        for &value in func.jump_blockparams(block) {
                            if !func.value_is_constant(value) {
                                live.insert(value);
                            }
                        }
                    }
                    for operand in func.inst_operands(inst) {
                        match operand.kind() {
                            OperandKind::Def(value) => {
                                live.remove(value);
                            }
                            OperandKind::Use(value) => {
                                if !func.value_is_constant(value) {
                                    live.insert(value);
                                }
                            }
                        }
                    }
                }
                for &param in func.block_params(block) {
                    live.insert(param);
                }

                if *live != self.scratch_in[block.index()] {
                    changed = true;
                    core::mem::swap(live, &mut self.scratch_in[block.index()]);
                }
            }
            if !changed {
                break;
            }
        }

        for block in func.blocks() {
            self.live_in[block].clear();
            self.live_in[block].extend(self.scratch_in[block.index()].iter());
            stat!(stats, live_in_values, self.live_in[block].len());
            stat!(stats, live_out_values, self.live_out[block].len());
        }
    }

    /// Values live on entry to the block, sorted by value index.
    pub fn live_in(&self, block: Block) -> &[Value] {
        &self.live_in[block]
    }

    /// Values live on exit from the block, sorted by value index.
    pub fn live_out(&self, block: Block) -> &[Value] {
        &self.live_out[block]
    }

    /// Adds a location set to the pool.
    pub fn push_set(&mut self, values: Vec<Value>, locs: Vec<VarLocation>) -> LocSet {
        debug_assert_eq!(values.len(), locs.len());
        debug_assert!(values.is_sorted());
        self.pool.push(LocSetData { values, locs })
    }

    /// The contents of a location set.
    pub fn set_data(&self, set: LocSet) -> &LocSetData {
        &self.pool[set]
    }

    /// Location set at the entry of a block, once its trace is allocated.
    pub fn in_set(&self, block: Block) -> Option<LocSet> {
        self.in_sets[block].expand()
    }

    /// Location set at the exit of a block, once its trace is allocated.
    pub fn out_set(&self, block: Block) -> Option<LocSet> {
        self.out_sets[block].expand()
    }

    pub fn set_in_set(&mut self, block: Block, set: LocSet) {
        self.in_sets[block] = Some(set).into();
    }

    pub fn set_out_set(&mut self, block: Block, set: LocSet) {
        self.out_sets[block] = Some(set).into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug_utils::{GenericFunction, GenericRegInfo};
    use crate::function::Operand;

    #[test]
    fn live_across_blocks() {
        let (_reginfo, class) = GenericRegInfo::with_reg_count(4);
        let mut func = GenericFunction::new();
        let v0 = func.new_value(class);
        let v1 = func.new_value(class);

        let b0 = func.create_block(1.0);
        let b1 = func.create_block(1.0);
        func.add_inst(b0, &[Operand::regclass_def(v0, class)]);
        func.add_inst(b0, &[Operand::regclass_def(v1, class)]);
        func.add_inst(b0, &[Operand::regclass_use(v1, class)]);
        func.add_jump(b0, b1, &[]);
        func.add_ret(b1, &[Operand::regclass_use(v0, class)]);

        let mut liveness = GlobalLiveness::new();
        liveness.compute(&func, &mut crate::Stats::default());

        // v1 dies inside b0; only v0 crosses the edge.
        assert_eq!(liveness.live_in(b0), &[]);
        assert_eq!(liveness.live_out(b0), &[v0]);
        assert_eq!(liveness.live_in(b1), &[v0]);
        assert_eq!(liveness.live_out(b1), &[]);
    }

    #[test]
    fn loop_carried_value() {
        let (_reginfo, class) = GenericRegInfo::with_reg_count(4);
        let mut func = GenericFunction::new();
        let v0 = func.new_value(class);

        // v0 is defined in b0 and used only in b2; it must be found live
        // through the self-looping block b1, which requires the dataflow to
        // iterate over the back-edge.
        let b0 = func.create_block(1.0);
        let b1 = func.create_block(10.0);
        let b2 = func.create_block(1.0);
        func.set_loop_flags(b1, true, true);
        func.add_inst(b0, &[Operand::regclass_def(v0, class)]);
        func.add_jump(b0, b1, &[]);
        func.add_branch(b1, &[], &[b1, b2]);
        func.add_ret(b2, &[Operand::regclass_use(v0, class)]);

        let mut liveness = GlobalLiveness::new();
        liveness.compute(&func, &mut crate::Stats::default());
        assert_eq!(liveness.live_in(b1), &[v0]);
        assert_eq!(liveness.live_out(b1), &[v0]);
    }

    #[test]
    fn block_params_are_live_in_but_do_not_propagate() {
        let (_reginfo, class) = GenericRegInfo::with_reg_count(4);
        let mut func = GenericFunction::new();
        let v0 = func.new_value(class);
        let v1 = func.new_value(class);
        let phi = func.new_value(class);

        //      b0
        //     /  \
        //    b1  b2
        //     \  /
        //      b3(phi)
        let b0 = func.create_block(1.0);
        let b1 = func.create_block(0.5);
        let b2 = func.create_block(0.5);
        let b3 = func.create_block(1.0);
        func.set_block_params(b3, &[phi]);

        func.add_inst(b0, &[Operand::regclass_def(v0, class)]);
        func.add_inst(b0, &[Operand::regclass_def(v1, class)]);
        func.add_branch(b0, &[], &[b1, b2]);
        func.add_jump(b1, b3, &[v0]);
        func.add_jump(b2, b3, &[v1]);
        func.add_ret(b3, &[Operand::regclass_use(phi, class)]);

        let mut liveness = GlobalLiveness::new();
        liveness.compute(&func, &mut crate::Stats::default());

        // The phi is live into b3 (it needs a location on entry) but is not
        // live out of the predecessors; the outgoing arguments are.
        assert_eq!(liveness.live_in(b3), &[phi]);
        assert_eq!(liveness.live_out(b1), &[v0]);
        assert_eq!(liveness.live_out(b2), &[v1]);
        assert_eq!(liveness.live_in(b1), &[v0]);
    }
}
