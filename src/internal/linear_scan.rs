//! Per-trace linear scan allocation.
//!
//! The allocator sweeps over the intervals of one trace in order of
//! increasing start point, driving each interval through the classic state
//! machine: unhandled -> active (live and assigned) -> inactive (assigned
//! but inside a lifetime hole) -> handled. At each step a free register is
//! selected if one is available; otherwise the interval occupying the needed
//! register class whose next use is furthest in the future is split and
//! spilled ("spill the value needed latest").
//!
//! Program points are even/odd integers per instruction (see
//! [`ProgramPoint`]); every split lands on an even boundary.
//!
//! After the walk, the pass records each block's boundary locations in the
//! global liveness info, maps instruction operands to the allocation of the
//! covering split child, and emits the moves that connect split children
//! within a block. Location changes at block boundaries are left to the
//! global move resolver.

use alloc::vec::Vec;
use core::cmp::Reverse;

use crate::entity::{PackedOption, SecondaryMap};
use crate::function::{Block, Function, Inst, OperandConstraint, OperandKind, Value};
use crate::internal::intervals::{
    Interval, Intervals, OperandMode, ProgramPoint, UseKind, UsePos,
};
use crate::internal::liveness::{LocSet, VarLocation};
use crate::internal::trace::Trace;
use crate::internal::TraceContext;
use crate::output::{Allocation, AllocationKind, Edit, MovePosition};
use crate::reginfo::{PhysReg, RegInfo};
use crate::RegAllocError;

pub struct LinearScan {
    intervals: Intervals,

    /// Intervals not yet reached by the walk, sorted by descending start so
    /// the next interval is popped from the back.
    unhandled: Vec<Interval>,

    /// Intervals live and register-assigned at the current position.
    active: Vec<Interval>,

    /// Register-assigned intervals currently inside a lifetime hole.
    inactive: Vec<Interval>,

    /// Fixed reservation interval per physical register.
    fixed: SecondaryMap<PhysReg, PackedOption<Interval>>,

    /// Scratch: first position at which each register stops being free.
    free_until: Vec<ProgramPoint>,

    /// Scratch: next use of each register's current occupant.
    use_pos: Vec<ProgramPoint>,
}

impl LinearScan {
    pub fn new() -> Self {
        Self {
            intervals: Intervals::new(),
            unhandled: Vec::new(),
            active: Vec::new(),
            inactive: Vec::new(),
            fixed: SecondaryMap::new(),
            free_until: Vec::new(),
            use_pos: Vec::new(),
        }
    }

    /// Allocates one non-trivial trace.
    pub fn run<F: Function, R: RegInfo>(
        &mut self,
        ctx: &mut TraceContext<'_, F, R>,
        trace: Trace,
    ) -> Result<(), RegAllocError> {
        trace!("linear scan over {trace}");
        stat!(ctx.stats, linear_scan_traces);
        self.build_intervals(ctx, trace);
        self.walk(ctx, trace)?;
        self.record_boundary_locations(ctx, trace);
        self.assign_operand_allocations(ctx, trace);
        self.connect_split_children(ctx, trace);
        Ok(())
    }

    fn fixed_interval(&mut self, reg: PhysReg) -> Interval {
        match self.fixed[reg].expand() {
            Some(interval) => interval,
            None => {
                let interval = self.intervals.create_fixed(reg);
                self.fixed[reg] = Some(interval).into();
                interval
            }
        }
    }

    /// Builds the intervals for one trace by walking its blocks and
    /// instructions in reverse.
    ///
    /// Values live out of a block provisionally cover the whole block; a def
    /// found later in the backward walk shortens the range to start at the
    /// defining instruction. Fixed operand constraints and clobbers reserve
    /// the affected register with a fixed interval for the duration of the
    /// instruction.
    fn build_intervals<F: Function, R: RegInfo>(
        &mut self,
        ctx: &mut TraceContext<'_, F, R>,
        trace: Trace,
    ) {
        let func = ctx.func;
        self.intervals.clear(func.num_values());
        self.fixed.clear_and_resize(ctx.reginfo.num_regs());

        for &block in ctx.traces.blocks(trace).iter().rev() {
            let insts = func.block_insts(block);
            let block_from = ProgramPoint::before(insts.from);
            let block_to = ProgramPoint::before(Inst::new(insts.to.index()));

            for &value in ctx.liveness.live_out(block) {
                let interval = self.intervals.ensure_for_value(value);
                self.intervals.add_range(interval, block_from, block_to);
            }

            for inst in insts.iter().rev() {
                let before = ProgramPoint::before(inst);
                let after = ProgramPoint::after(inst);

                if func.inst_is_terminator(inst) {
                    // Outgoing block arguments are read by the resolver at
                    // the block exit boundary. Constant arguments are
                    // rematerialized there and need no interval.
                    for &value in func.jump_blockparams(block) {
                        if func.value_is_constant(value) {
                            continue;
                        }
                        let interval = self.intervals.ensure_for_value(value);
                        self.intervals.add_range(interval, block_from, block_to);
                        self.intervals.add_use(
                            interval,
                            UsePos {
                                pos: before,
                                kind: UseKind::Any,
                            },
                        );
                    }
                }

                for &reg in func.inst_clobbers(inst) {
                    let fixed = self.fixed_interval(reg);
                    self.intervals.add_range(fixed, before, after);
                }

                for operand in func.inst_operands(inst) {
                    let use_kind = match operand.constraint() {
                        OperandConstraint::Reg(_) | OperandConstraint::Fixed(_) => UseKind::Reg,
                        OperandConstraint::Any(_) => UseKind::Any,
                    };
                    if let OperandConstraint::Fixed(reg) = operand.constraint() {
                        let fixed = self.fixed_interval(reg);
                        self.intervals.add_range(fixed, before, after);
                    }
                    match operand.kind() {
                        OperandKind::Def(value) => {
                            let interval = self.intervals.ensure_for_value(value);
                            if self.intervals[interval].ranges.is_empty() {
                                // Dead def: reserve just the def slot.
                                self.intervals.add_range(interval, before, after);
                            } else {
                                self.intervals.set_from(interval, before);
                            }
                            self.intervals.add_use(
                                interval,
                                UsePos {
                                    pos: before,
                                    kind: use_kind,
                                },
                            );
                            if let OperandConstraint::Fixed(reg) = operand.constraint() {
                                self.intervals[interval].hint = Some(reg).into();
                            }
                        }
                        OperandKind::Use(value) => {
                            let interval = self.intervals.ensure_for_value(value);
                            self.intervals.add_range(interval, block_from, after);
                            self.intervals.add_use(
                                interval,
                                UsePos {
                                    pos: before,
                                    kind: use_kind,
                                },
                            );
                            if let OperandConstraint::Fixed(reg) = operand.constraint() {
                                if self.intervals[interval].hint.is_none() {
                                    self.intervals[interval].hint = Some(reg).into();
                                }
                            }
                        }
                    }
                }
            }
        }

        if ctx.options.inter_trace_hints {
            self.apply_inter_trace_hints(ctx, trace);
        }

        stat!(ctx.stats, intervals_built, self.intervals.keys().len());
    }

    /// Hints values entering the trace towards the register they occupy at
    /// the end of an already-allocated predecessor, avoiding a reconciling
    /// move on the connecting edge.
    fn apply_inter_trace_hints<F: Function, R: RegInfo>(
        &mut self,
        ctx: &mut TraceContext<'_, F, R>,
        trace: Trace,
    ) {
        let func = ctx.func;
        let head = ctx.traces.blocks(trace)[0];
        let Some(&pred) = func.block_preds(head).first() else {
            return;
        };
        let Some(out_set) = ctx.liveness.out_set(pred) else {
            return;
        };

        let out_data = ctx.liveness.set_data(out_set);
        for &value in ctx.liveness.live_in(head) {
            let Some(interval) = self.intervals.value_interval(value) else {
                continue;
            };
            if self.intervals[interval].hint.is_some() {
                continue;
            }
            if let Some(loc) = out_data.location_of(value) {
                if let Some(reg) = loc.alloc.expand().and_then(Allocation::as_reg) {
                    self.intervals[interval].hint = Some(reg).into();
                }
            }
        }

        // Block parameters take their hint from the matching outgoing
        // argument of the predecessor.
        for (&param, &arg) in func
            .block_params(head)
            .iter()
            .zip(func.jump_blockparams(pred))
        {
            let Some(interval) = self.intervals.value_interval(param) else {
                continue;
            };
            if self.intervals[interval].hint.is_none() {
                if let Some(loc) = out_data.location_of(arg) {
                    if let Some(reg) = loc.alloc.expand().and_then(Allocation::as_reg) {
                        self.intervals[interval].hint = Some(reg).into();
                    }
                }
            }
        }
    }

    /// The main sweep over the trace's intervals.
    fn walk<F: Function, R: RegInfo>(
        &mut self,
        ctx: &mut TraceContext<'_, F, R>,
        _trace: Trace,
    ) -> Result<(), RegAllocError> {
        self.unhandled.clear();
        self.active.clear();
        self.inactive.clear();
        for interval in self.intervals.keys() {
            let data = &self.intervals[interval];
            if data.ranges.is_empty() {
                continue;
            }
            if data.fixed.is_some() {
                // Fixed reservations come pre-assigned and only participate
                // as blockers.
                self.inactive.push(interval);
            } else {
                self.unhandled.push(interval);
            }
        }
        self.unhandled
            .sort_unstable_by_key(|&interval| Reverse(self.intervals[interval].from()));

        while let Some(cur) = self.unhandled.pop() {
            let position = self.intervals[cur].from();
            trace!(
                "walk: {cur} ({:?}) starting at {position}",
                self.intervals[cur].value
            );
            self.expire_and_demote(position);
            if !self.try_allocate_free_reg(ctx, cur) {
                self.allocate_blocked_reg(ctx, cur)?;
            }
        }
        Ok(())
    }

    /// Retires intervals that ended before `position` and moves intervals
    /// in/out of lifetime holes.
    fn expire_and_demote(&mut self, position: ProgramPoint) {
        let mut i = 0;
        while i < self.active.len() {
            let interval = self.active[i];
            let data = &self.intervals[interval];
            if data.to() <= position {
                self.active.swap_remove(i);
            } else if !data.covers(position, OperandMode::Def) {
                self.inactive.push(interval);
                self.active.swap_remove(i);
            } else {
                i += 1;
            }
        }
        let mut i = 0;
        while i < self.inactive.len() {
            let interval = self.inactive[i];
            let data = &self.intervals[interval];
            if data.to() <= position {
                self.inactive.swap_remove(i);
            } else if data.covers(position, OperandMode::Def) {
                self.active.push(interval);
                self.inactive.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// First conflict between `cur` and an inactive interval.
    ///
    /// A fixed reservation at exactly `cur`'s start whose register is `cur`'s
    /// hint is `cur`'s own fixed-constraint def; the reservation keeps other
    /// values out of the register, not the defined value itself.
    fn first_conflict(
        &self,
        inactive: Interval,
        cur: Interval,
        hint: Option<PhysReg>,
    ) -> Option<ProgramPoint> {
        let data = &self.intervals[inactive];
        let cur_data = &self.intervals[cur];
        let skip_own_def = data.fixed.is_some() && hint == data.fixed.expand();
        let position = cur_data.from();
        let mut best: Option<ProgramPoint> = None;
        for &reserved in &data.ranges {
            if skip_own_def && reserved.from == position {
                continue;
            }
            for &range in &cur_data.ranges {
                if let Some(point) = reserved.first_intersection(range) {
                    best = Some(best.map_or(point, |b| b.min(point)));
                }
            }
        }
        best
    }

    /// Inserts a split child into the unhandled list, keeping it sorted.
    fn push_unhandled(&mut self, interval: Interval) {
        let from = self.intervals[interval].from();
        let idx = self
            .unhandled
            .partition_point(|&i| self.intervals[i].from() > from);
        self.unhandled.insert(idx, interval);
    }

    /// Tries to assign a currently-free register to `cur`.
    ///
    /// Prefers the hinted register when it is free for the interval's whole
    /// lifetime; otherwise picks the register that stays free longest,
    /// splitting `cur` when no register is free all the way to its end.
    fn try_allocate_free_reg<F: Function, R: RegInfo>(
        &mut self,
        ctx: &mut TraceContext<'_, F, R>,
        cur: Interval,
    ) -> bool {
        let position = self.intervals[cur].from();
        let value = self.intervals[cur].value.expect("fixed interval in unhandled");
        let class = ctx.func.value_class(value);
        let order = ctx.reginfo.allocation_order(class);

        self.free_until.clear();
        self.free_until
            .resize(ctx.reginfo.num_regs(), ProgramPoint::MAX);
        for &interval in &self.active {
            if let Some(reg) = self.intervals[interval]
                .alloc
                .expand()
                .and_then(Allocation::as_reg)
            {
                self.free_until[reg.index()] = position;
            }
        }
        let hint = self.intervals[cur].hint.expand();
        for &interval in &self.inactive {
            if let Some(reg) = self.intervals[interval]
                .alloc
                .expand()
                .and_then(Allocation::as_reg)
            {
                if let Some(point) = self.first_conflict(interval, cur, hint) {
                    self.free_until[reg.index()] = self.free_until[reg.index()].min(point);
                }
            }
        }

        let mut best: Option<PhysReg> = None;
        for &reg in order {
            let free = self.free_until[reg.index()];
            if free <= position {
                continue;
            }
            let better = match best {
                None => true,
                Some(b) => {
                    let best_free = self.free_until[b.index()];
                    free > best_free || (free == best_free && Some(reg) == hint)
                }
            };
            if better {
                best = Some(reg);
            }
        }
        // A hinted register that is free for the whole lifetime beats a
        // longer-free arbitrary register: it saves a move.
        if let Some(hint) = hint {
            if order.contains(&hint)
                && self.free_until[hint.index()] >= self.intervals[cur].to()
            {
                best = Some(hint);
            }
        }

        let Some(reg) = best else {
            return false;
        };
        let free = self.free_until[reg.index()];
        if free < self.intervals[cur].to() {
            // Register only available for the first part of the interval.
            let split_pos = free.round_to_before();
            if split_pos <= position {
                return false;
            }
            let child = self.intervals.split_at(cur, split_pos);
            stat!(ctx.stats, interval_splits);
            self.push_unhandled(child);
        }
        trace!("-> assigned {reg}");
        self.intervals[cur].alloc = Some(Allocation::reg(reg)).into();
        self.active.push(cur);
        true
    }

    /// No register is free: spill whichever conflicting interval's next use
    /// is furthest in the future, or `cur` itself if its own first use is
    /// furthest.
    fn allocate_blocked_reg<F: Function, R: RegInfo>(
        &mut self,
        ctx: &mut TraceContext<'_, F, R>,
        cur: Interval,
    ) -> Result<(), RegAllocError> {
        let position = self.intervals[cur].from();
        let value = self.intervals[cur].value.expect("fixed interval in unhandled");
        let class = ctx.func.value_class(value);
        let order = ctx.reginfo.allocation_order(class);

        self.use_pos.clear();
        self.use_pos
            .resize(ctx.reginfo.num_regs(), ProgramPoint::MAX);
        for &interval in &self.active {
            let data = &self.intervals[interval];
            let Some(reg) = data.alloc.expand().and_then(Allocation::as_reg) else {
                continue;
            };
            let pos = if data.fixed.is_some() {
                position
            } else {
                data.next_use_after(position).map_or(ProgramPoint::MAX, |u| u.pos)
            };
            self.use_pos[reg.index()] = self.use_pos[reg.index()].min(pos);
        }
        let hint = self.intervals[cur].hint.expand();
        for &interval in &self.inactive {
            let Some(reg) = self.intervals[interval]
                .alloc
                .expand()
                .and_then(Allocation::as_reg)
            else {
                continue;
            };
            if let Some(point) = self.first_conflict(interval, cur, hint) {
                let data = &self.intervals[interval];
                let pos = if data.fixed.is_some() {
                    point
                } else {
                    data.next_use_after(point).map_or(ProgramPoint::MAX, |u| u.pos)
                };
                self.use_pos[reg.index()] = self.use_pos[reg.index()].min(pos);
            }
        }

        let mut best: Option<PhysReg> = None;
        for &reg in order {
            let better = match best {
                None => true,
                Some(b) => {
                    let best_pos = self.use_pos[b.index()];
                    let pos = self.use_pos[reg.index()];
                    pos > best_pos || (pos == best_pos && Some(reg) == hint)
                }
            };
            if better {
                best = Some(reg);
            }
        }

        let first_use = self.intervals[cur].next_use_after(position);
        let spill_self = match (first_use, best) {
            (None, _) | (_, None) => true,
            (Some(u), Some(b)) => {
                let best_pos = self.use_pos[b.index()];
                u.pos > best_pos || best_pos <= position
            }
        };

        if spill_self {
            // All candidate registers are needed sooner than cur's own first
            // use: cur is the value needed latest, so it lives on the stack.
            self.spill_interval(ctx, cur)?;
        } else {
            let reg = best.unwrap();
            trace!("-> evicting occupants of {reg}");
            self.evict_reg(ctx, reg, position)?;
            self.intervals[cur].alloc = Some(Allocation::reg(reg)).into();
            // The register may become reserved by a fixed interval later in
            // cur's lifetime; hand it back before that happens.
            let mut blocked = ProgramPoint::MAX;
            for i in 0..self.inactive.len() {
                let interval = self.inactive[i];
                if self.intervals[interval].fixed.expand() == Some(reg) {
                    if let Some(point) = self.first_conflict(interval, cur, hint) {
                        blocked = blocked.min(point);
                    }
                }
            }
            if blocked < self.intervals[cur].to() {
                let split_pos = blocked.round_to_before();
                debug_assert!(split_pos > position);
                let child = self.intervals.split_at(cur, split_pos);
                stat!(ctx.stats, interval_splits);
                self.push_unhandled(child);
            }
            self.active.push(cur);
        }
        Ok(())
    }

    /// Moves `interval` to the stack, splitting off an unhandled child
    /// before its next mandatory-register use.
    fn spill_interval<F: Function, R: RegInfo>(
        &mut self,
        ctx: &mut TraceContext<'_, F, R>,
        interval: Interval,
    ) -> Result<(), RegAllocError> {
        let position = self.intervals[interval].from();
        let value = self.intervals[interval].value.unwrap();
        // With spill info sharing, an interval chain that already spilled
        // keeps using the same slot; its stack copy stays valid since SSA
        // values are written only once.
        let slot = match self.intervals[interval].spill_slot.expand() {
            Some(slot) if ctx.options.share_spill_info => slot,
            _ => ctx
                .spill_slots
                .slot_for_value(value, ctx.options.cache_stack_slots, ctx.stats),
        };
        self.intervals[interval].spill_slot = Some(slot).into();
        self.intervals[interval].alloc = Some(Allocation::spillslot(slot)).into();
        stat!(ctx.stats, spilled_intervals);
        trace!("-> spilled {interval} to {slot}");

        if let Some(use_pos) = self.intervals[interval].next_reg_use_after(position) {
            if use_pos.pos <= position {
                // A mandatory-register operand at the current position with
                // no register and no spillable occupant: the constraints
                // cannot be satisfied.
                return Err(RegAllocError::TooManyLiveRegs);
            }
            let split_pos = use_pos.pos.round_to_before();
            debug_assert!(split_pos > position);
            if split_pos < self.intervals[interval].to() {
                let child = self.intervals.split_at(interval, split_pos);
                stat!(ctx.stats, interval_splits);
                // The child must not inherit the stack assignment: it has to
                // compete for a register again for the mandatory use.
                self.intervals[child].alloc = None.into();
                self.push_unhandled(child);
            }
        }
        Ok(())
    }

    /// Splits and spills every non-fixed interval occupying `reg`.
    fn evict_reg<F: Function, R: RegInfo>(
        &mut self,
        ctx: &mut TraceContext<'_, F, R>,
        reg: PhysReg,
        position: ProgramPoint,
    ) -> Result<(), RegAllocError> {
        let mut i = 0;
        while i < self.active.len() {
            let interval = self.active[i];
            let data = &self.intervals[interval];
            if data.alloc.expand() != Some(Allocation::reg(reg)) || data.fixed.is_some() {
                i += 1;
                continue;
            }
            self.active.swap_remove(i);
            if data.from() == position {
                // The occupant starts exactly here; take the register back
                // and spill it whole.
                self.intervals[interval].alloc = None.into();
                self.spill_interval(ctx, interval)?;
            } else {
                let child = self.intervals.split_at(interval, position);
                stat!(ctx.stats, interval_splits);
                self.intervals[child].alloc = None.into();
                self.spill_interval(ctx, child)?;
            }
        }

        // Inactive occupants conflict again when their next range starts;
        // split them there and let the child find a new home.
        let mut i = 0;
        while i < self.inactive.len() {
            let interval = self.inactive[i];
            let data = &self.intervals[interval];
            if data.alloc.expand() != Some(Allocation::reg(reg)) || data.fixed.is_some() {
                i += 1;
                continue;
            }
            // A lifetime hole within a trace only happens for values with
            // disjoint ranges; conflicts are resolved at the resumption
            // point.
            let resume = data
                .ranges
                .iter()
                .find(|r| r.from > position)
                .map(|r| r.from);
            if let Some(resume) = resume {
                let child = self.intervals.split_at(interval, resume.round_to_before());
                stat!(ctx.stats, interval_splits);
                self.intervals[child].alloc = None.into();
                self.push_unhandled(child);
            }
            i += 1;
        }
        Ok(())
    }

    /// Records the location of every live value at each block boundary.
    ///
    /// Consecutive boundaries with identical contents share one location
    /// set; the resolver skips shared boundaries entirely.
    fn record_boundary_locations<F: Function, R: RegInfo>(
        &mut self,
        ctx: &mut TraceContext<'_, F, R>,
        trace: Trace,
    ) {
        let mut prev: Option<LocSet> = None;
        for &block in ctx.traces.blocks(trace) {
            let insts = ctx.func.block_insts(block);
            let entry = ProgramPoint::before(insts.from);
            let exit = ProgramPoint::before(Inst::new(insts.to.index()));

            // Entry locations are those *after* any split landing on the
            // boundary (Def mode selects the incoming child); exit locations
            // are those before it. The resolver sees both sides and emits
            // the connecting move.
            let in_set = self.boundary_set(ctx, block, entry, true, prev);
            ctx.liveness.set_in_set(block, in_set);
            let out_set = self.boundary_set(ctx, block, exit, false, Some(in_set));
            ctx.liveness.set_out_set(block, out_set);
            prev = Some(out_set);
        }
    }

    /// Builds (or reuses) the location set for one block boundary.
    fn boundary_set<F: Function, R: RegInfo>(
        &mut self,
        ctx: &mut TraceContext<'_, F, R>,
        block: Block,
        point: ProgramPoint,
        entry: bool,
        reuse: Option<LocSet>,
    ) -> LocSet {
        let values: Vec<Value> = if entry {
            ctx.liveness.live_in(block).into()
        } else {
            // Outgoing block arguments are not live-out (the successor
            // defines its own parameter) but the resolver still needs their
            // exit location to feed the parameter.
            let mut values: Vec<Value> = ctx.liveness.live_out(block).into();
            for &arg in ctx.func.jump_blockparams(block) {
                if !ctx.func.value_is_constant(arg) {
                    values.push(arg);
                }
            }
            values.sort_unstable();
            values.dedup();
            values
        };
        let mode = if entry {
            OperandMode::Def
        } else {
            OperandMode::Use
        };
        let locs: Vec<VarLocation> = values
            .iter()
            .map(|&value| self.boundary_location(value, point, mode))
            .collect();

        if let Some(reuse) = reuse {
            let data = ctx.liveness.set_data(reuse);
            if data.values == values && data.locs == locs {
                return reuse;
            }
        }
        ctx.liveness.push_set(values, locs)
    }

    /// The location of `value` at a block boundary.
    fn boundary_location(&self, value: Value, point: ProgramPoint, mode: OperandMode) -> VarLocation {
        match self.intervals.location_at(value, point, mode) {
            Some(data) => {
                let mut loc = VarLocation {
                    alloc: data.alloc,
                    shadow: None.into(),
                };
                // Register-resident with an already-written stack copy:
                // shadowed.
                if data.alloc.expand().is_some_and(Allocation::is_reg) {
                    loc.shadow = data.spill_slot;
                }
                loc
            }
            None => VarLocation::none(),
        }
    }

    /// Maps every instruction operand to the allocation of the split child
    /// covering it.
    fn assign_operand_allocations<F: Function, R: RegInfo>(
        &mut self,
        ctx: &mut TraceContext<'_, F, R>,
        trace: Trace,
    ) {
        for &block in ctx.traces.blocks(trace) {
            for inst in ctx.func.block_insts(block).iter() {
                let point = ProgramPoint::before(inst);
                for (idx, operand) in ctx.func.inst_operands(inst).iter().enumerate() {
                    let value = operand.value();
                    let mode = match operand.kind() {
                        OperandKind::Def(_) => OperandMode::Def,
                        OperandKind::Use(_) => OperandMode::Use,
                    };
                    match operand.constraint() {
                        OperandConstraint::Fixed(reg) => {
                            ctx.allocations
                                .set_allocation(inst, idx, Allocation::reg(reg));
                            self.connect_fixed_operand(ctx, inst, point, value, mode, reg);
                        }
                        OperandConstraint::Reg(_) | OperandConstraint::Any(_) => {
                            // A use with no live child is a benign skip:
                            // dead code or a phi input on an eliminated
                            // branch.
                            if let Some(data) = self.intervals.location_at(value, point, mode) {
                                let mut alloc = data.alloc.expand();
                                // At a reload boundary both the stack and
                                // register child hold the value; a
                                // mandatory-register use reads the
                                // register-resident one.
                                if matches!(operand.constraint(), OperandConstraint::Reg(_))
                                    && !alloc.is_some_and(Allocation::is_reg)
                                {
                                    alloc = self
                                        .intervals
                                        .location_at(value, point, OperandMode::Def)
                                        .and_then(|d| d.alloc.expand());
                                }
                                if let Some(alloc) = alloc {
                                    debug_assert!(
                                        alloc.is_reg()
                                            || !matches!(
                                                operand.constraint(),
                                                OperandConstraint::Reg(_)
                                            ),
                                        "mandatory-register operand left on the stack"
                                    );
                                    ctx.allocations.set_allocation(inst, idx, alloc);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Emits the move connecting a fixed operand register with the value's
    /// interval location, when the hint did not already unify them.
    fn connect_fixed_operand<F: Function, R: RegInfo>(
        &mut self,
        ctx: &mut TraceContext<'_, F, R>,
        inst: Inst,
        point: ProgramPoint,
        value: Value,
        mode: OperandMode,
        reg: PhysReg,
    ) {
        let edit = match mode {
            // Read: bring the value into the fixed register just before the
            // instruction.
            OperandMode::Use => {
                let Some(data) = self.intervals.location_at(value, point, mode) else {
                    return;
                };
                let Some(alloc) = data.alloc.expand() else {
                    return;
                };
                if alloc == Allocation::reg(reg) {
                    return;
                }
                (
                    MovePosition::early(inst),
                    Edit {
                        value: Some(value).into(),
                        from: Some(alloc).into(),
                        to: Allocation::reg(reg),
                    },
                )
            }
            // Write: the instruction produces the value in the fixed
            // register; store it to the def interval's home location at the
            // next boundary, unless the value is already dead by then.
            OperandMode::Def => {
                let Some(data) = self.intervals.location_at(value, point, mode) else {
                    return;
                };
                let Some(alloc) = data.alloc.expand() else {
                    return;
                };
                let boundary = ProgramPoint::before(inst.next());
                if alloc == Allocation::reg(reg) || !data.covers(boundary, OperandMode::Use) {
                    return;
                }
                (
                    MovePosition::early(inst.next()),
                    Edit {
                        value: Some(value).into(),
                        from: Some(Allocation::reg(reg)).into(),
                        to: alloc,
                    },
                )
            }
        };
        stat!(ctx.stats, fixed_constraint_moves);
        ctx.edits.push(edit);
    }

    /// Emits the moves that connect consecutive split children within a
    /// block.
    ///
    /// Transitions exactly at a block entry boundary are not connected here:
    /// they are visible in the boundary location sets and the global move
    /// resolver takes care of them.
    fn connect_split_children<F: Function, R: RegInfo>(
        &mut self,
        ctx: &mut TraceContext<'_, F, R>,
        _trace: Trace,
    ) {
        for root in self.intervals.keys() {
            if self.intervals[root].parent.is_some()
                || self.intervals[root].children.is_empty()
            {
                continue;
            }
            let mut prev = root;
            for i in 0..self.intervals[root].children.len() {
                let child = self.intervals[root].children[i];
                let prev_data = &self.intervals[prev];
                let child_data = &self.intervals[child];
                let boundary = child_data.from();
                let connected = prev_data.to() == boundary;
                let prev_alloc = prev_data.alloc.expand();
                let prev_spill = prev_data.spill_slot.expand();
                let value = prev_data.value;
                prev = child;
                if !connected {
                    // Lifetime hole between the halves; the value crosses
                    // blocks and the resolver reconciles it.
                    continue;
                }
                let inst = boundary.inst();
                if ctx.func.block_insts(ctx.func.inst_block(inst)).from == inst {
                    // Block boundary: resolver territory.
                    continue;
                }
                let (Some(from), Some(to)) = (prev_alloc, self.intervals[child].alloc.expand())
                else {
                    continue;
                };
                if from == to {
                    continue;
                }
                // A store into the slot that already shadows the value is a
                // no-op: the stack copy is still current.
                if let AllocationKind::SpillSlot(slot) = to.kind() {
                    if from.is_reg() && prev_spill == Some(slot) {
                        continue;
                    }
                }
                stat!(ctx.stats, split_moves);
                ctx.edits.push((
                    MovePosition::early(inst),
                    Edit {
                        value,
                        from: Some(from).into(),
                        to,
                    },
                ));
            }
        }
    }
}
