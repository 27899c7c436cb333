//! Resolution of parallel moves into a sequence of move operations, possibly
//! using a scratch register to resolve cycles.
//!
//! The mappings collected for one control-flow edge are conceptually
//! parallel: they all read their sources before any destination is written.
//! Serializing them requires ordering moves so that no source is clobbered
//! before it is read, and breaking cycles (two values swapping registers)
//! with a scratch location.
//!
//! The algorithm does a depth-first search over the move graph, emitting
//! moves in *reverse* program order as the stack unwinds. When a cycle is
//! detected, the endangered value is diverted to a scratch register (or an
//! emergency spill slot when no register is free) until the move that would
//! have clobbered it has been emitted.

use alloc::vec::Vec;

use hashbrown::HashMap;
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;

use crate::entity::{EntitySet, PackedOption, PrimaryMap};
use crate::function::Value;
use crate::output::{Allocation, AllocationKind, Edit, SpillSlot};
use crate::reginfo::{PhysReg, RegClass, RegInfo};
use crate::Stats;

entity_def! {
    /// An index into the set of parallel moves currently being resolved.
    entity MoveIndex(u16, "move");
}

/// State tracking for the DFS.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    /// Not on the stack, not visited.
    New,
    /// On the stack, not yet emitted.
    Pending,
    /// Emitted.
    Done,
}

/// DFS stack marker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Visit {
    First,
    Last,
}

/// Information about one parallel move.
struct Move {
    source: Allocation,
    dest: Allocation,
    value: Value,
    state: State,

    /// Values diverted to scratch locations because this move would
    /// overwrite them; released once this move is emitted.
    diverted_values: SmallVec<[Value; 2]>,
}

/// An active diversion of a value to a scratch location.
#[derive(Clone, Copy)]
struct Diversion {
    /// Location that was originally holding the value.
    alloc: Allocation,

    /// Scratch location the value has been diverted to.
    scratch: Allocation,

    /// Number of pending moves that still require the diversion.
    ref_count: u32,
}

/// Allocator for scratch locations used during move resolution.
struct ScratchPool {
    /// Registers verified to currently hold no live value.
    available: EntitySet<PhysReg>,

    /// Registers whose freeness has been probed; lazily filled.
    probed: EntitySet<PhysReg>,

    /// A register temporarily saved to an emergency spill slot so it can
    /// serve as a scratch register. At most one at a time.
    evicted: Option<(PhysReg, SpillSlot)>,
}

impl ScratchPool {
    fn new() -> Self {
        Self {
            available: EntitySet::new(),
            probed: EntitySet::new(),
            evicted: None,
        }
    }

    fn clear(&mut self) {
        self.available.clear();
        self.probed.clear();
        self.evicted = None;
    }

    /// Marks a register free for scratch use. Called after emitting the move
    /// that writes it: since moves are emitted in reverse, earlier moves in
    /// program order may clobber it freely.
    fn make_available(&mut self, reg: PhysReg) {
        self.available.insert(reg);
        self.probed.insert(reg);
    }

    /// Marks a register unusable as scratch. Called after emitting a move
    /// that reads it: earlier moves in program order must not clobber it.
    fn make_unavailable(&mut self, reg: PhysReg) {
        self.available.remove(reg);
        self.probed.insert(reg);
    }
}

/// Resolver which turns a set of parallel move operations into a linear
/// sequence of moves.
pub struct ParallelMoves {
    /// Emitted edits, in *reverse* program order.
    edits: Vec<Edit>,

    moves: PrimaryMap<MoveIndex, Move>,

    /// Constant values re-materialized directly into their destination.
    remats: Vec<(Value, Allocation)>,

    /// The move writing to each destination. Destinations are unique within
    /// one parallel move set.
    writes_to: HashMap<Allocation, MoveIndex, FxBuildHasher>,

    /// Currently diverted values.
    diverted: HashMap<Value, Diversion, FxBuildHasher>,

    scratch: ScratchPool,

    /// Stack for the DFS.
    stack: Vec<(Visit, MoveIndex)>,
}

impl ParallelMoves {
    pub fn new() -> Self {
        Self {
            edits: Vec::new(),
            moves: PrimaryMap::new(),
            remats: Vec::new(),
            writes_to: HashMap::default(),
            diverted: HashMap::default(),
            scratch: ScratchPool::new(),
            stack: Vec::new(),
        }
    }

    /// Starts collecting a new set of parallel moves.
    pub fn new_parallel_move(&mut self) {
        self.moves.clear();
        self.remats.clear();
        self.writes_to.clear();
    }

    /// Whether any moves or rematerializations have been collected.
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty() && self.remats.is_empty()
    }

    /// Adds a rematerialization of a constant value into `dest`.
    pub fn add_remat(&mut self, dest: Allocation, value: Value) {
        self.remats.push((value, dest));
    }

    /// Adds a move of `value` from `source` to `dest`.
    pub fn add_move(&mut self, source: Allocation, dest: Allocation, value: Value) {
        // Self-moves would confuse the cycle detection; callers filter them.
        debug_assert_ne!(source, dest);

        // Ignore duplicate moves to the same destination. These arise when a
        // phi pairing and the liveness diff request the same relocation.
        if let Some(&index) = self.writes_to.get(&dest) {
            debug_assert_eq!(self.moves[index].source, source);
            debug_assert_eq!(self.moves[index].value, value);
            return;
        }

        let index = self.moves.push(Move {
            source,
            dest,
            value,
            state: State::New,
            diverted_values: SmallVec::new(),
        });
        self.writes_to.insert(dest, index);
    }

    /// Serializes the collected moves.
    ///
    /// `is_reg_free` reports whether a register holds no live value at this
    /// edge and may be clobbered; `alloc_emergency_slot` provides a stack
    /// slot when no register is free for a required scratch.
    pub fn resolve<R: RegInfo>(
        &mut self,
        reginfo: &R,
        class_of: impl Fn(Value) -> RegClass,
        is_reg_free: impl Fn(PhysReg) -> bool,
        mut alloc_emergency_slot: impl FnMut(&mut Stats) -> SpillSlot,
        stats: &mut Stats,
    ) {
        self.edits.clear();
        if self.is_empty() {
            return;
        }

        self.scratch.clear();
        self.diverted.clear();

        // Rematerializations first: emitted here, they run *after* all moves
        // in program order, and their destination registers serve as scratch
        // space for the moves.
        for i in 0..self.remats.len() {
            let (value, dest) = self.remats[i];
            trace!("remat of {value} into {dest}");
            stat!(stats, remat_moves);
            self.edits.push(Edit {
                value: Some(value).into(),
                from: None.into(),
                to: dest,
            });
            if let AllocationKind::PhysReg(reg) = dest.kind() {
                self.scratch.make_available(reg);
            }
        }

        // Topologically order the move graph with a DFS, emitting moves in
        // post-order while unwinding. Cycles are broken as they are
        // discovered by diverting the endangered value to a scratch
        // location.
        self.stack.clear();
        for m in self.moves.keys() {
            if self.moves[m].state != State::New {
                debug_assert_eq!(self.moves[m].state, State::Done);
                continue;
            }
            self.stack.push((Visit::First, m));
            while let Some((visit, m)) = self.stack.pop() {
                let source = self.moves[m].source;
                let dest = self.moves[m].dest;
                let value = self.moves[m].value;
                match visit {
                    Visit::First => {
                        if self.moves[m].state != State::New {
                            debug_assert_eq!(self.moves[m].state, State::Done);
                            continue;
                        }
                        trace!("first visit of {value}: {source} -> {dest}");

                        // Emit the move on the second visit, after any move
                        // that overwrites our source has been visited.
                        self.moves[m].state = State::Pending;
                        self.stack.push((Visit::Last, m));
                        if let Some(&m2) = self.writes_to.get(&source) {
                            if self.moves[m2].state == State::New {
                                self.stack.push((Visit::First, m2));
                            }
                        }
                    }
                    Visit::Last => {
                        debug_assert_eq!(self.moves[m].state, State::Pending);
                        self.moves[m].state = State::Done;
                        trace!("second visit of {value}: {source} -> {dest}");

                        // A cycle exists if the move overwriting our source
                        // is still on the stack.
                        let cycle_writer = self
                            .writes_to
                            .get(&source)
                            .copied()
                            .filter(|&m2| self.moves[m2].state == State::Pending);

                        let adjusted_source = if let Some(m2) = cycle_writer {
                            // Break the cycle: read the value from a scratch
                            // location instead. The move that overwrites our
                            // source emits the fill of the scratch location
                            // once it is processed (which, in reversed
                            // order, places the fill before the overwrite).
                            stat!(stats, move_cycles);
                            // The diversion is released once per *writer*,
                            // not once per reader.
                            let newly = !self.moves[m2].diverted_values.contains(&value);
                            let scratch = self.divert(
                                value,
                                source,
                                newly,
                                reginfo,
                                &class_of,
                                &is_reg_free,
                                &mut alloc_emergency_slot,
                                stats,
                            );
                            if newly {
                                self.moves[m2].diverted_values.push(value);
                            }
                            trace!("-> cycle: diverting {value} from {source} to {scratch}");
                            scratch
                        } else {
                            source
                        };

                        self.do_move(
                            adjusted_source,
                            dest,
                            Some(value),
                            reginfo,
                            &class_of,
                            &is_reg_free,
                            &mut alloc_emergency_slot,
                            stats,
                        );

                        // Release diversions that were waiting for this move:
                        // this emits the scratch fills, which end up before
                        // this move in program order.
                        while let Some(diverted) = self.moves[m].diverted_values.pop() {
                            self.undivert(
                                diverted,
                                reginfo,
                                &class_of,
                                &is_reg_free,
                                &mut alloc_emergency_slot,
                                stats,
                            );
                        }
                    }
                }
            }
        }

        // Emit the save of any evicted register. Pushed last, it lands first
        // in program order, before every use of the scratch register.
        if let Some((reg, slot)) = self.scratch.evicted.take() {
            self.edits.push(Edit {
                value: None.into(),
                from: Some(Allocation::reg(reg)).into(),
                to: Allocation::spillslot(slot),
            });
        }
    }

    /// The move sequence resolved by [`ParallelMoves::resolve`], in program
    /// order.
    pub fn edits(&self) -> impl Iterator<Item = Edit> + '_ {
        self.edits.iter().rev().copied()
    }

    /// Emits a single move, inserting a scratch register for stack-to-stack
    /// transfers.
    fn do_move<R: RegInfo>(
        &mut self,
        from: Allocation,
        to: Allocation,
        value: Option<Value>,
        reginfo: &R,
        class_of: &impl Fn(Value) -> RegClass,
        is_reg_free: &impl Fn(PhysReg) -> bool,
        alloc_emergency_slot: &mut impl FnMut(&mut Stats) -> SpillSlot,
        stats: &mut Stats,
    ) {
        trace!("emitting move {to} <- {from}");
        if from.is_memory() && to.is_memory() {
            // Stack-to-stack moves need to go through a register.
            stat!(stats, stack_to_stack_moves);
            let class = class_of(value.expect("scratch shuffle between two stack slots"));
            let scratch =
                self.get_scratch_reg(class, reginfo, is_reg_free, alloc_emergency_slot, stats);
            self.edits.push(Edit {
                value: value.into(),
                from: Some(Allocation::reg(scratch)).into(),
                to,
            });
            self.edits.push(Edit {
                value: value.into(),
                from: Some(from).into(),
                to: Allocation::reg(scratch),
            });
        } else {
            self.edits.push(Edit {
                value: value.into(),
                from: Some(from).into(),
                to,
            });
        }

        // The destination is clobbered by this move, so earlier moves in
        // program order can use it as scratch; the source must survive until
        // this move reads it.
        if let AllocationKind::PhysReg(reg) = to.kind() {
            self.scratch.make_available(reg);
        }
        if let AllocationKind::PhysReg(reg) = from.kind() {
            self.scratch.make_unavailable(reg);
        }
    }

    /// Diverts `value` (currently in `alloc`) to a scratch location.
    fn divert<R: RegInfo>(
        &mut self,
        value: Value,
        alloc: Allocation,
        new_writer: bool,
        reginfo: &R,
        class_of: &impl Fn(Value) -> RegClass,
        is_reg_free: &impl Fn(PhysReg) -> bool,
        alloc_emergency_slot: &mut impl FnMut(&mut Stats) -> SpillSlot,
        stats: &mut Stats,
    ) -> Allocation {
        if let Some(diversion) = self.diverted.get_mut(&value) {
            if new_writer {
                diversion.ref_count += 1;
            }
            return diversion.scratch;
        }
        debug_assert!(new_writer);

        // Scratch registers for cycle breaking must avoid every move source:
        // those registers are still read by moves in the cycle.
        let scratch = match self.try_get_scratch_reg(class_of(value), true, reginfo, is_reg_free)
        {
            Some(reg) => Allocation::reg(reg),
            None => Allocation::spillslot(alloc_emergency_slot(stats)),
        };
        if let AllocationKind::PhysReg(reg) = scratch.kind() {
            self.scratch.available.remove(reg);
        }
        self.diverted.insert(
            value,
            Diversion {
                alloc,
                scratch,
                ref_count: 1,
            },
        );
        scratch
    }

    /// Fills the scratch location of a diversion once the clobbering move
    /// has been emitted.
    fn undivert<R: RegInfo>(
        &mut self,
        value: Value,
        reginfo: &R,
        class_of: &impl Fn(Value) -> RegClass,
        is_reg_free: &impl Fn(PhysReg) -> bool,
        alloc_emergency_slot: &mut impl FnMut(&mut Stats) -> SpillSlot,
        stats: &mut Stats,
    ) {
        let diversion = self.diverted[&value];
        debug_assert!(diversion.ref_count > 0);
        if diversion.ref_count > 1 {
            self.diverted.get_mut(&value).unwrap().ref_count -= 1;
            return;
        }
        self.diverted.remove(&value);
        trace!("ending diversion of {value}");
        self.do_move(
            diversion.alloc,
            diversion.scratch,
            Some(value),
            reginfo,
            class_of,
            is_reg_free,
            alloc_emergency_slot,
            stats,
        );
    }

    /// Returns a free register of `class` to use as scratch, evicting one to
    /// an emergency spill slot as a last resort.
    fn get_scratch_reg<R: RegInfo>(
        &mut self,
        class: RegClass,
        reginfo: &R,
        is_reg_free: &impl Fn(PhysReg) -> bool,
        alloc_emergency_slot: &mut impl FnMut(&mut Stats) -> SpillSlot,
        stats: &mut Stats,
    ) -> PhysReg {
        if let Some(reg) = self.try_get_scratch_reg(class, false, reginfo, is_reg_free) {
            return reg;
        }

        // Reuse an already-evicted register when possible; otherwise close
        // its window before opening a new one.
        if let Some((reg, slot)) = self.scratch.evicted {
            if reginfo.reg_class(reg) == class {
                return reg;
            }
            self.scratch.evicted = None;
            self.edits.push(Edit {
                value: None.into(),
                from: Some(Allocation::reg(reg)).into(),
                to: Allocation::spillslot(slot),
            });
        }

        // Evict the last register of the class: it is least likely to hold a
        // hot value. The restore is pushed now, so in program order it runs
        // after the register's scratch duty; the matching save is emitted
        // once the register stops being needed.
        let reg = *reginfo
            .allocation_order(class)
            .last()
            .expect("register class with empty allocation order");
        let slot = alloc_emergency_slot(stats);
        trace!("evicting {reg} to {slot} for scratch");
        stat!(stats, scratch_evictions);
        self.edits.push(Edit {
            value: None.into(),
            from: Some(Allocation::spillslot(slot)).into(),
            to: Allocation::reg(reg),
        });
        self.scratch.evicted = Some((reg, slot));
        reg
    }

    /// Probes for a register of `class` which holds no live value.
    fn try_get_scratch_reg<R: RegInfo>(
        &mut self,
        class: RegClass,
        exclude_sources: bool,
        reginfo: &R,
        is_reg_free: &impl Fn(PhysReg) -> bool,
    ) -> Option<PhysReg> {
        for &reg in reginfo.allocation_order(class) {
            if exclude_sources
                && self
                    .moves
                    .values()
                    .any(|m| m.source == Allocation::reg(reg))
            {
                continue;
            }
            if !self.scratch.probed.contains(reg) {
                self.scratch.probed.insert(reg);
                if is_reg_free(reg) {
                    self.scratch.available.insert(reg);
                }
            }
            if self.scratch.available.contains(reg) {
                return Some(reg);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use hashbrown::HashMap;

    use super::*;
    use crate::debug_utils::GenericRegInfo;

    fn value(index: usize) -> Value {
        Value::new(index)
    }

    fn reg(index: usize) -> Allocation {
        Allocation::reg(PhysReg::new(index))
    }

    fn slot(index: usize) -> Allocation {
        Allocation::spillslot(SpillSlot::new(index))
    }

    /// Executes the resolved edits over a symbolic location file and returns
    /// the final contents.
    fn execute(
        pm: &ParallelMoves,
        init: &[(Allocation, u32)],
    ) -> HashMap<Allocation, u32> {
        let mut state: HashMap<Allocation, u32> = init.iter().copied().collect();
        for edit in pm.edits() {
            match (edit.value.expand(), edit.from.expand()) {
                (_, Some(from)) => {
                    let contents = state
                        .get(&from)
                        .copied()
                        .expect("move reads a location with no value");
                    state.insert(edit.to, contents);
                }
                (Some(v), None) => {
                    state.insert(edit.to, 1000 + v.index() as u32);
                }
                (None, None) => unreachable!(),
            }
        }
        state
    }

    fn resolve(
        pm: &mut ParallelMoves,
        reginfo: &GenericRegInfo,
        free: &[usize],
    ) -> crate::Stats {
        let mut stats = crate::Stats::default();
        let mut next_emergency = 100;
        pm.resolve(
            reginfo,
            |_| crate::reginfo::RegClass::new(0),
            |r| free.contains(&r.index()),
            |_| {
                next_emergency += 1;
                SpillSlot::new(next_emergency)
            },
            &mut stats,
        );
        stats
    }

    #[test]
    fn chain_is_ordered() {
        let (reginfo, _) = GenericRegInfo::with_reg_count(3);
        let mut pm = ParallelMoves::new();
        pm.new_parallel_move();
        pm.add_move(reg(0), reg(1), value(0));
        pm.add_move(reg(1), reg(2), value(1));
        resolve(&mut pm, &reginfo, &[]);

        let state = execute(&pm, &[(reg(0), 10), (reg(1), 20)]);
        assert_eq!(state[&reg(1)], 10);
        assert_eq!(state[&reg(2)], 20);
    }

    #[test]
    fn swap_uses_scratch_register() {
        let (reginfo, _) = GenericRegInfo::with_reg_count(3);
        let mut pm = ParallelMoves::new();
        pm.new_parallel_move();
        pm.add_move(reg(0), reg(1), value(0));
        pm.add_move(reg(1), reg(0), value(1));
        let stats = resolve(&mut pm, &reginfo, &[2]);
        assert_eq!(stats.move_cycles, 1);

        let state = execute(&pm, &[(reg(0), 10), (reg(1), 20)]);
        assert_eq!(state[&reg(0)], 20);
        assert_eq!(state[&reg(1)], 10);
    }

    #[test]
    fn swap_without_free_register_uses_emergency_slot() {
        let (reginfo, _) = GenericRegInfo::with_reg_count(2);
        let mut pm = ParallelMoves::new();
        pm.new_parallel_move();
        pm.add_move(reg(0), reg(1), value(0));
        pm.add_move(reg(1), reg(0), value(1));
        resolve(&mut pm, &reginfo, &[]);

        let state = execute(&pm, &[(reg(0), 10), (reg(1), 20)]);
        assert_eq!(state[&reg(0)], 20);
        assert_eq!(state[&reg(1)], 10);
    }

    #[test]
    fn three_cycle() {
        let (reginfo, _) = GenericRegInfo::with_reg_count(4);
        let mut pm = ParallelMoves::new();
        pm.new_parallel_move();
        pm.add_move(reg(0), reg(1), value(0));
        pm.add_move(reg(1), reg(2), value(1));
        pm.add_move(reg(2), reg(0), value(2));
        resolve(&mut pm, &reginfo, &[3]);

        let state = execute(&pm, &[(reg(0), 10), (reg(1), 20), (reg(2), 30)]);
        assert_eq!(state[&reg(1)], 10);
        assert_eq!(state[&reg(2)], 20);
        assert_eq!(state[&reg(0)], 30);
    }

    #[test]
    fn stack_to_stack_goes_through_register() {
        let (reginfo, _) = GenericRegInfo::with_reg_count(2);
        let mut pm = ParallelMoves::new();
        pm.new_parallel_move();
        pm.add_move(slot(0), slot(1), value(0));
        let stats = resolve(&mut pm, &reginfo, &[1]);
        assert_eq!(stats.stack_to_stack_moves, 1);

        let state = execute(&pm, &[(slot(0), 42)]);
        assert_eq!(state[&slot(1)], 42);
    }

    #[test]
    fn remat_replaces_move() {
        let (reginfo, _) = GenericRegInfo::with_reg_count(2);
        let mut pm = ParallelMoves::new();
        pm.new_parallel_move();
        pm.add_remat(reg(0), value(7));
        resolve(&mut pm, &reginfo, &[]);

        let state = execute(&pm, &[]);
        assert_eq!(state[&reg(0)], 1007);
    }
}
