//! Live intervals for the per-trace linear scan.
//!
//! An interval represents the program-point ranges over which a single value
//! is live within one trace, together with its use positions. When the
//! allocator must change a value's storage mid-life (spill, reload into a
//! different register), the interval is split: the original interval keeps
//! the leading ranges and a new *split child* takes over from the split
//! point. Parent/child relations are index fields into one arena, so there
//! are no ownership cycles to manage.

use core::fmt;

use smallvec::SmallVec;

use crate::entity::{PackedOption, PrimaryMap, SecondaryMap};
use crate::function::{Inst, Value};
use crate::output::{Allocation, SpillSlot};
use crate::reginfo::PhysReg;

/// A point in the linear instruction space, with two slots per instruction.
///
/// Points are even/odd integers: the even point of an instruction comes
/// *before* it executes and the odd point comes *after*. This orders a use
/// and a def at the same instruction without ambiguity, and gives splits a
/// well-defined landing spot: splits only ever happen at even points.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProgramPoint {
    /// Bit-pack in 32 bits.
    ///
    /// inst:31 slot:1
    bits: u32,
}

impl ProgramPoint {
    /// Largest representable point, used as the identity for minimum
    /// computations.
    pub const MAX: ProgramPoint = ProgramPoint { bits: u32::MAX };

    /// The even point before `inst` executes.
    #[inline]
    pub fn before(inst: Inst) -> Self {
        Self {
            bits: (inst.index() as u32) << 1,
        }
    }

    /// The odd point after `inst` executes.
    #[inline]
    pub fn after(inst: Inst) -> Self {
        Self {
            bits: ((inst.index() as u32) << 1) | 1,
        }
    }

    /// The instruction this point belongs to.
    #[inline]
    pub fn inst(self) -> Inst {
        Inst::new((self.bits >> 1) as usize)
    }

    /// Whether this is the even (before) point of its instruction.
    #[inline]
    pub fn is_before(self) -> bool {
        self.bits & 1 == 0
    }

    /// Rounds down to the even point of the same instruction.
    #[inline]
    pub fn round_to_before(self) -> Self {
        Self {
            bits: self.bits & !1,
        }
    }
}

impl fmt::Display for ProgramPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            self.inst(),
            if self.is_before() { "B" } else { "a" }
        )
    }
}

impl fmt::Debug for ProgramPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A `[from, to)` range of program points.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
    pub from: ProgramPoint,
    pub to: ProgramPoint,
}

impl LiveRange {
    pub fn new(from: ProgramPoint, to: ProgramPoint) -> Self {
        debug_assert!(from < to);
        Self { from, to }
    }

    /// First point at which this range and `other` are both live, if any.
    pub fn first_intersection(self, other: Self) -> Option<ProgramPoint> {
        if other.to <= self.from || self.to <= other.from {
            None
        } else {
            Some(self.from.max(other.from))
        }
    }
}

impl fmt::Display for LiveRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.from, self.to)
    }
}

impl fmt::Debug for LiveRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Whether an operand query refers to a read or a write at its instruction.
///
/// The distinction matters exactly at a split point p: a read at p comes from
/// the interval that was valid up to p, a write at p goes into the interval
/// starting at p.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandMode {
    Use,
    Def,
}

/// How strongly a use position needs a register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum UseKind {
    /// The value may be read from a stack slot at this position.
    Any,

    /// The value must be in a register at this position.
    Reg,
}

/// A position at which an interval's value is read or written.
#[derive(Clone, Copy, Debug)]
pub struct UsePos {
    pub pos: ProgramPoint,
    pub kind: UseKind,
}

entity_def! {
    /// An opaque reference to an interval in the arena.
    pub entity Interval(u32, "int");
}

/// Data for one interval or split child.
pub struct IntervalData {
    /// The value this interval covers, `None` for fixed register
    /// reservations.
    pub value: PackedOption<Value>,

    /// For fixed intervals, the reserved register.
    pub fixed: PackedOption<PhysReg>,

    /// Sorted, disjoint live ranges.
    pub ranges: SmallVec<[LiveRange; 2]>,

    /// Sorted use positions.
    pub uses: SmallVec<[UsePos; 4]>,

    /// Assigned location, if any.
    pub alloc: PackedOption<Allocation>,

    /// Spill slot backing this interval, if the value was spilled.
    pub spill_slot: PackedOption<SpillSlot>,

    /// Back-reference to the original unsplit interval.
    pub parent: PackedOption<Interval>,

    /// Split children in ascending range order. Only maintained on the
    /// original unsplit interval.
    pub children: SmallVec<[Interval; 2]>,

    /// Preferred register, used to avoid a move when it is free.
    pub hint: PackedOption<PhysReg>,
}

impl IntervalData {
    fn empty() -> Self {
        Self {
            value: None.into(),
            fixed: None.into(),
            ranges: SmallVec::new(),
            uses: SmallVec::new(),
            alloc: None.into(),
            spill_slot: None.into(),
            parent: None.into(),
            children: SmallVec::new(),
            hint: None.into(),
        }
    }

    /// Start of the first range.
    pub fn from(&self) -> ProgramPoint {
        self.ranges.first().expect("empty interval").from
    }

    /// End of the last range.
    pub fn to(&self) -> ProgramPoint {
        self.ranges.last().expect("empty interval").to
    }

    /// Whether the interval is live at `point` for the given operand mode.
    ///
    /// In `Def` mode the query matches `[from, to)`; in `Use` mode a range
    /// end is inclusive, so a read exactly at a split boundary matches the
    /// interval ending there.
    pub fn covers(&self, point: ProgramPoint, mode: OperandMode) -> bool {
        self.ranges.iter().any(|range| match mode {
            OperandMode::Def => range.from <= point && point < range.to,
            OperandMode::Use => range.from <= point && point <= range.to,
        })
    }

    /// First use at or after `point`, if any.
    pub fn next_use_after(&self, point: ProgramPoint) -> Option<UsePos> {
        let idx = self.uses.partition_point(|u| u.pos < point);
        self.uses.get(idx).copied()
    }

    /// First use at or after `point` which requires a register, if any.
    pub fn next_reg_use_after(&self, point: ProgramPoint) -> Option<UsePos> {
        let idx = self.uses.partition_point(|u| u.pos < point);
        self.uses[idx..].iter().find(|u| u.kind == UseKind::Reg).copied()
    }
}

/// Arena of intervals for one trace.
pub struct Intervals {
    data: PrimaryMap<Interval, IntervalData>,

    /// Root interval for each value live in the current trace.
    value_intervals: SecondaryMap<Value, PackedOption<Interval>>,
}

impl Intervals {
    pub fn new() -> Self {
        Self {
            data: PrimaryMap::new(),
            value_intervals: SecondaryMap::new(),
        }
    }

    /// Discards all intervals and prepares for a trace over a function with
    /// `num_values` values.
    pub fn clear(&mut self, num_values: usize) {
        self.data.clear();
        self.value_intervals.clear_and_resize(num_values);
    }

    /// Creates a fresh interval for `value` and registers it as the value's
    /// root.
    pub fn create_for_value(&mut self, value: Value) -> Interval {
        debug_assert!(self.value_intervals[value].is_none());
        let interval = self.data.push(IntervalData {
            value: Some(value).into(),
            ..IntervalData::empty()
        });
        self.value_intervals[value] = Some(interval).into();
        interval
    }

    /// Creates a fixed reservation interval for a physical register.
    pub fn create_fixed(&mut self, reg: PhysReg) -> Interval {
        self.data.push(IntervalData {
            fixed: Some(reg).into(),
            alloc: Some(Allocation::reg(reg)).into(),
            ..IntervalData::empty()
        })
    }

    /// Root interval of `value` in the current trace, if it is live here.
    pub fn value_interval(&self, value: Value) -> Option<Interval> {
        self.value_intervals[value].expand()
    }

    /// Root interval of `value`, creating it on first sight.
    pub fn ensure_for_value(&mut self, value: Value) -> Interval {
        match self.value_intervals[value].expand() {
            Some(interval) => interval,
            None => self.create_for_value(value),
        }
    }

    /// Iterator over all intervals in the arena.
    pub fn keys(&self) -> crate::entity::Keys<Interval> {
        self.data.keys()
    }

    /// Extends the interval with the range `[from, to)`, merging with an
    /// existing overlapping or adjacent range.
    ///
    /// Interval building walks the trace backwards, so in the common case
    /// the new range lands in front of all existing ones.
    pub fn add_range(&mut self, interval: Interval, from: ProgramPoint, to: ProgramPoint) {
        debug_assert!(from < to);
        let ranges = &mut self.data[interval].ranges;
        let idx = ranges.partition_point(|r| r.to < from);
        if idx < ranges.len() && ranges[idx].from <= to {
            // Overlaps or touches the range at idx: merge into it.
            ranges[idx].from = ranges[idx].from.min(from);
            ranges[idx].to = ranges[idx].to.max(to);
            // Merging may have bridged the gap to the following range.
            while idx + 1 < ranges.len() && ranges[idx + 1].from <= ranges[idx].to {
                ranges[idx].to = ranges[idx].to.max(ranges[idx + 1].to);
                ranges.remove(idx + 1);
            }
        } else {
            ranges.insert(idx, LiveRange::new(from, to));
        }
    }

    /// Shortens the first range to start at `from`.
    ///
    /// Used when the defining instruction of a value is found while walking
    /// backwards through the block that created the provisional
    /// whole-block range.
    pub fn set_from(&mut self, interval: Interval, from: ProgramPoint) {
        let ranges = &mut self.data[interval].ranges;
        debug_assert!(!ranges.is_empty());
        debug_assert!(from < ranges[0].to);
        if from > ranges[0].from {
            ranges[0].from = from;
        }
    }

    /// Records a use position, keeping the list sorted.
    pub fn add_use(&mut self, interval: Interval, use_pos: UsePos) {
        let uses = &mut self.data[interval].uses;
        let idx = uses.partition_point(|u| u.pos < use_pos.pos);
        uses.insert(idx, use_pos);
    }

    /// Splits `interval` at `at`, which must be an even point strictly
    /// inside the interval.
    ///
    /// The interval keeps the ranges and uses before `at`; the returned
    /// split child takes over from `at` on. Both halves are non-empty and
    /// together cover exactly what the interval covered.
    pub fn split_at(&mut self, interval: Interval, at: ProgramPoint) -> Interval {
        debug_assert!(at.is_before(), "splits must land on an even boundary");
        debug_assert!(at > self.data[interval].from());
        debug_assert!(at < self.data[interval].to());

        let data = &mut self.data[interval];
        let idx = data.ranges.partition_point(|r| r.to <= at);
        let mut child_ranges: SmallVec<[LiveRange; 2]> = SmallVec::new();
        if data.ranges[idx].from < at {
            // The range containing `at` is cut in two.
            child_ranges.push(LiveRange::new(at, data.ranges[idx].to));
            child_ranges.extend(data.ranges.drain(idx + 1..));
            data.ranges[idx].to = at;
        } else {
            // `at` falls in a lifetime hole; the child starts at the next
            // range.
            child_ranges.extend(data.ranges.drain(idx..));
        }

        let use_idx = data.uses.partition_point(|u| u.pos < at);
        let child_uses: SmallVec<[UsePos; 4]> = data.uses.drain(use_idx..).collect();

        let value = data.value;
        let spill_slot = data.spill_slot;
        let root = data.parent.expand().unwrap_or(interval);

        let child = self.data.push(IntervalData {
            value,
            spill_slot,
            ranges: child_ranges,
            uses: child_uses,
            parent: Some(root).into(),
            ..IntervalData::empty()
        });

        // Keep the child list in range order; `split_child_at` relies on it
        // to resolve boundary queries to the earlier child in Use mode.
        let child_from = self.data[child].from();
        debug_assert!(child_from >= at);
        let pos = self.data[root]
            .children
            .iter()
            .position(|&c| self.data[c].from() > child_from)
            .unwrap_or(self.data[root].children.len());
        self.data[root].children.insert(pos, child);

        trace!("split {interval} at {at} -> {child}");
        child
    }

    /// Finds the interval (the root or one of its split children) that is
    /// valid at `point` for the given operand mode.
    ///
    /// Returns `None` when no part of the value's live range covers the
    /// point; callers treat this as a benign skip (dead code or an
    /// unreachable phi input), never an error.
    pub fn split_child_at(
        &self,
        root: Interval,
        point: ProgramPoint,
        mode: OperandMode,
    ) -> Option<Interval> {
        debug_assert!(self.data[root].parent.is_none());
        if self.data[root].covers(point, mode) {
            return Some(root);
        }
        self.data[root]
            .children
            .iter()
            .copied()
            .find(|&child| self.data[child].covers(point, mode))
    }

    /// The location of `value` at `point`, looked up through its split
    /// children.
    pub fn location_at(
        &self,
        value: Value,
        point: ProgramPoint,
        mode: OperandMode,
    ) -> Option<&IntervalData> {
        let root = self.value_interval(value)?;
        let interval = self.split_child_at(root, point, mode)?;
        Some(&self.data[interval])
    }
}

impl core::ops::Index<Interval> for Intervals {
    type Output = IntervalData;

    #[inline]
    fn index(&self, interval: Interval) -> &IntervalData {
        &self.data[interval]
    }
}

impl core::ops::IndexMut<Interval> for Intervals {
    #[inline]
    fn index_mut(&mut self, interval: Interval) -> &mut IntervalData {
        &mut self.data[interval]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pp(bits: usize) -> ProgramPoint {
        if bits % 2 == 0 {
            ProgramPoint::before(Inst::new(bits / 2))
        } else {
            ProgramPoint::after(Inst::new(bits / 2))
        }
    }

    #[test]
    fn add_range_merges() {
        let mut intervals = Intervals::new();
        intervals.clear(4);
        let int = intervals.create_for_value(Value::new(0));
        intervals.add_range(int, pp(8), pp(12));
        intervals.add_range(int, pp(0), pp(4));
        assert_eq!(intervals[int].ranges.len(), 2);
        // Touching ranges merge.
        intervals.add_range(int, pp(4), pp(8));
        assert_eq!(intervals[int].ranges.len(), 1);
        assert_eq!(intervals[int].from(), pp(0));
        assert_eq!(intervals[int].to(), pp(12));
    }

    #[test]
    fn split_produces_non_empty_halves() {
        let mut intervals = Intervals::new();
        intervals.clear(4);
        let int = intervals.create_for_value(Value::new(0));
        intervals.add_range(int, pp(0), pp(10));
        intervals.add_use(int, UsePos { pos: pp(2), kind: UseKind::Reg });
        intervals.add_use(int, UsePos { pos: pp(8), kind: UseKind::Reg });

        let child = intervals.split_at(int, pp(6));
        assert_eq!(intervals[int].from(), pp(0));
        assert_eq!(intervals[int].to(), pp(6));
        assert_eq!(intervals[child].from(), pp(6));
        assert_eq!(intervals[child].to(), pp(10));
        assert_eq!(intervals[int].uses.len(), 1);
        assert_eq!(intervals[child].uses.len(), 1);
        assert_eq!(intervals[child].parent.expand(), Some(int));
        assert_eq!(&intervals[int].children[..], &[child]);
    }

    #[test]
    fn split_child_lookup_at_boundary() {
        let mut intervals = Intervals::new();
        intervals.clear(4);
        let int = intervals.create_for_value(Value::new(0));
        intervals.add_range(int, pp(0), pp(10));
        let child = intervals.split_at(int, pp(6));

        // A read at the split point comes from the earlier child, a write
        // goes into the later one.
        assert_eq!(
            intervals.split_child_at(int, pp(6), OperandMode::Use),
            Some(int)
        );
        assert_eq!(
            intervals.split_child_at(int, pp(6), OperandMode::Def),
            Some(child)
        );
        // Away from the boundary both modes agree.
        assert_eq!(
            intervals.split_child_at(int, pp(8), OperandMode::Use),
            Some(child)
        );
        assert_eq!(
            intervals.split_child_at(int, pp(2), OperandMode::Def),
            Some(int)
        );
        // Outside the live range nothing matches.
        assert_eq!(intervals.split_child_at(int, pp(12), OperandMode::Def), None);
    }

    #[test]
    fn split_in_hole_starts_at_next_range() {
        let mut intervals = Intervals::new();
        intervals.clear(4);
        let int = intervals.create_for_value(Value::new(0));
        intervals.add_range(int, pp(0), pp(4));
        intervals.add_range(int, pp(8), pp(12));
        let child = intervals.split_at(int, pp(6));
        assert_eq!(intervals[int].ranges.len(), 1);
        assert_eq!(intervals[child].from(), pp(8));
        assert_eq!(intervals[child].to(), pp(12));
    }
}
