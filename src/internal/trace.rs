//! Partitioning of the control-flow graph into traces.
//!
//! A trace is an ordered, non-empty sequence of basic blocks forming a
//! single-entry chain: control can only enter through the first block, and
//! consecutive blocks are connected by a CFG edge. Each block belongs to
//! exactly one trace, and blocks inside a trace appear in the same relative
//! order as in the linear block order of the function.
//!
//! Allocating one trace at a time lets the linear-scan sub-allocator treat
//! the trace as straight-line code; divergence between traces is repaired
//! afterwards by the global move resolver.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use ordered_float::OrderedFloat;

use crate::entity::{PackedOption, PrimaryMap, SecondaryMap, Keys};
use crate::function::{Block, Function};
use crate::{Stats, TraceStrategy};

entity_def! {
    /// An opaque reference to a trace.
    pub entity Trace(u32, "trace");
}

/// Per-trace data: the slice of `block_order` holding the trace's blocks and
/// the trivial classification flag.
#[derive(Debug, Clone, Copy)]
struct TraceData {
    from: u32,
    to: u32,
    trivial: bool,
}

/// Result of trace building: the list of traces and the mapping from each
/// block to its owning trace.
pub struct TraceSet {
    traces: PrimaryMap<Trace, TraceData>,

    /// Blocks of all traces, grouped by trace. Within each trace the blocks
    /// are in ascending block index order.
    block_order: Vec<Block>,

    block_to_trace: SecondaryMap<Block, PackedOption<Trace>>,
}

impl TraceSet {
    pub fn new() -> Self {
        Self {
            traces: PrimaryMap::new(),
            block_order: Vec::new(),
            block_to_trace: SecondaryMap::new(),
        }
    }

    /// Partitions the blocks of `func` into traces using the given strategy.
    pub fn compute(&mut self, func: &impl Function, strategy: TraceStrategy, stats: &mut Stats) {
        self.traces.clear();
        self.block_order.clear();
        self.block_to_trace.clear_and_resize(func.num_blocks());

        match strategy {
            TraceStrategy::SingleBlock => self.build_single_block(func),
            TraceStrategy::UniDirectional => self.build_uni_directional(func),
            TraceStrategy::BiDirectional => self.build_bi_directional(func),
        }

        self.classify_trivial(func);

        debug_assert_eq!(self.block_order.len(), func.num_blocks());
        stat!(stats, traces, self.traces.len());
        stat!(
            stats,
            trivial_traces,
            self.traces.values().filter(|t| t.trivial).count()
        );

        if trace_enabled!() {
            for trace in self.traces() {
                trace!(
                    "{trace}{}: {:?}",
                    if self.is_trivial(trace) { " (trivial)" } else { "" },
                    self.blocks(trace)
                );
            }
        }
    }

    /// Every block is its own trace. Always correct, no inter-block benefit.
    fn build_single_block(&mut self, func: &impl Function) {
        for block in func.blocks() {
            self.push_trace(core::iter::once(block));
        }
    }

    /// Single pass over the linear order: a block extends the current trace
    /// only if its sole predecessor is the immediately preceding block.
    fn build_uni_directional(&mut self, func: &impl Function) {
        let mut current: Vec<Block> = Vec::new();
        for block in func.blocks() {
            let extends = match (current.last(), func.block_preds(block)) {
                (Some(&prev), &[pred]) => pred == prev,
                _ => false,
            };
            if !extends && !current.is_empty() {
                self.push_trace(current.drain(..));
            }
            current.push(block);
        }
        if !current.is_empty() {
            self.push_trace(current.drain(..));
        }
    }

    /// Greedily grows traces in both directions from high-frequency seed
    /// blocks so that hot paths stay within one trace.
    ///
    /// Growth is restricted to edges that keep the chain single-entry: a
    /// trace only extends forward into a successor with a single predecessor,
    /// and only extends backward when its head has a single predecessor.
    /// Growth also never moves against the linear order, which keeps blocks
    /// inside the trace sorted by block index.
    fn build_bi_directional(&mut self, func: &impl Function) {
        let mut seeds: Vec<Block> = func.blocks().collect();
        seeds.sort_unstable_by_key(|&block| {
            (
                core::cmp::Reverse(OrderedFloat(func.block_frequency(block))),
                block,
            )
        });

        let mut chain = VecDeque::new();
        for seed in seeds {
            if self.block_to_trace[seed].is_some() {
                continue;
            }

            chain.clear();
            chain.push_back(seed);
            // Reserve the seed before growing so that the loop below never
            // routes another trace through it.
            self.block_to_trace[seed] = Some(self.traces.next_key()).into();

            // Grow forward from the tail along the hottest free edge.
            let mut tail = seed;
            while let Some(succ) = func
                .block_succs(tail)
                .iter()
                .copied()
                .filter(|&s| {
                    self.block_to_trace[s].is_none()
                        && s.index() > tail.index()
                        && func.block_preds(s).len() == 1
                })
                .max_by_key(|&s| OrderedFloat(func.block_frequency(s)))
            {
                chain.push_back(succ);
                self.block_to_trace[succ] = Some(self.traces.next_key()).into();
                tail = succ;
            }

            // Grow backward from the head while the head has a unique
            // predecessor.
            let mut head = seed;
            while let &[pred] = func.block_preds(head) {
                if self.block_to_trace[pred].is_some() || pred.index() >= head.index() {
                    break;
                }
                chain.push_front(pred);
                self.block_to_trace[pred] = Some(self.traces.next_key()).into();
                head = pred;
            }

            self.push_trace(chain.drain(..));
        }
    }

    /// Appends a new trace consisting of the given blocks.
    fn push_trace(&mut self, blocks: impl Iterator<Item = Block>) {
        let from = self.block_order.len() as u32;
        let trace = self.traces.next_key();
        for block in blocks {
            self.block_to_trace[block] = Some(trace).into();
            self.block_order.push(block);
        }
        let to = self.block_order.len() as u32;
        debug_assert!(to > from, "traces must be non-empty");
        debug_assert!(self.block_order[from as usize..to as usize].is_sorted());
        self.traces.push(TraceData {
            from,
            to,
            trivial: false,
        });
    }

    /// Tags single-block pass-through traces as trivial.
    ///
    /// A trivial block performs no value-affecting work: it has no block
    /// parameters and its only instruction is an unconditional jump with no
    /// operands and no clobbers. The trivial fast path additionally needs a
    /// unique predecessor to copy its assignment from.
    fn classify_trivial(&mut self, func: &impl Function) {
        for data in self.traces.values_mut() {
            if data.to - data.from != 1 {
                continue;
            }
            let block = self.block_order[data.from as usize];
            let insts = func.block_insts(block);
            data.trivial = func.block_preds(block).len() == 1
                && func.block_succs(block).len() == 1
                && func.block_params(block).is_empty()
                && insts.len() == 1
                && func.inst_operands(insts.from).is_empty()
                && func.inst_clobbers(insts.from).is_empty();
        }
    }

    /// Iterator over all traces, in allocation processing order.
    pub fn traces(&self) -> Keys<Trace> {
        self.traces.keys()
    }

    /// Number of traces built for the function.
    pub fn num_traces(&self) -> usize {
        self.traces.len()
    }

    /// The blocks of a trace, in ascending block index order.
    pub fn blocks(&self, trace: Trace) -> &[Block] {
        let data = &self.traces[trace];
        &self.block_order[data.from as usize..data.to as usize]
    }

    /// The trace owning the given block.
    pub fn trace_of(&self, block: Block) -> Trace {
        self.block_to_trace[block].expect("block not assigned to a trace")
    }

    /// Whether the trace is a trivial pass-through eligible for the fast
    /// path.
    pub fn is_trivial(&self, trace: Trace) -> bool {
        self.traces[trace].trivial
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;
    use crate::debug_utils::{GenericFunction, GenericRegInfo};
    use crate::function::Operand;
    use crate::reginfo::RegClass;

    /// Diamond with a pass-through block on one arm:
    ///
    /// ```text
    ///      b0
    ///     /  \
    ///    b1  b2      (b2 is a trivial pass-through)
    ///     \  /
    ///      b3
    /// ```
    fn diamond() -> (GenericFunction, RegClass) {
        let (_reginfo, class) = GenericRegInfo::with_reg_count(4);
        let mut func = GenericFunction::new();
        let v0 = func.new_value(class);

        let b0 = func.create_block(1.0);
        let b1 = func.create_block(0.8);
        let b2 = func.create_block(0.2);
        let b3 = func.create_block(1.0);

        func.add_inst(b0, &[Operand::regclass_def(v0, class)]);
        func.add_branch(b0, &[], &[b1, b2]);
        // b1 does real work so that only b2 is a pass-through.
        let v1 = func.new_value(class);
        func.add_inst(b1, &[Operand::regclass_def(v1, class)]);
        func.add_jump(b1, b3, &[]);
        func.add_jump(b2, b3, &[]);
        func.add_ret(b3, &[Operand::regclass_use(v0, class)]);
        (func, class)
    }

    fn check_partition(func: &GenericFunction, traces: &TraceSet) {
        // Every block appears in exactly one trace, in linear order.
        let mut seen = Vec::new();
        for trace in traces.traces() {
            let blocks = traces.blocks(trace);
            assert!(!blocks.is_empty());
            assert!(blocks.is_sorted());
            for &block in blocks {
                assert_eq!(traces.trace_of(block), trace);
                seen.push(block);
            }
        }
        seen.sort_unstable();
        let all: Vec<_> = func.blocks().collect();
        assert_eq!(seen, all);
    }

    #[test]
    fn partition_totality_all_strategies() {
        let (func, _) = diamond();
        let mut stats = crate::Stats::default();
        for strategy in [
            TraceStrategy::SingleBlock,
            TraceStrategy::UniDirectional,
            TraceStrategy::BiDirectional,
        ] {
            let mut traces = TraceSet::new();
            traces.compute(&func, strategy, &mut stats);
            check_partition(&func, &traces);
        }
    }

    #[test]
    fn single_block_strategy_is_one_block_per_trace() {
        let (func, _) = diamond();
        let mut stats = crate::Stats::default();
        let mut traces = TraceSet::new();
        traces.compute(&func, TraceStrategy::SingleBlock, &mut stats);
        assert_eq!(traces.num_traces(), func.num_blocks());
    }

    #[test]
    fn uni_directional_extends_fall_through() {
        let (func, _) = diamond();
        let mut stats = crate::Stats::default();
        let mut traces = TraceSet::new();
        traces.compute(&func, TraceStrategy::UniDirectional, &mut stats);
        // b0 and b1 form one fall-through trace; b2 (not preceded by its
        // predecessor) and b3 (merge) start fresh traces.
        let b0 = Block::new(0);
        let b1 = Block::new(1);
        assert_eq!(traces.trace_of(b0), traces.trace_of(b1));
        assert_eq!(traces.num_traces(), 3);
    }

    #[test]
    fn trivial_classification() {
        let (func, _) = diamond();
        let mut stats = crate::Stats::default();
        let mut traces = TraceSet::new();
        traces.compute(&func, TraceStrategy::SingleBlock, &mut stats);
        // Only b2 is a pure pass-through: one predecessor, one successor, a
        // lone jump and no params.
        for block in func.blocks() {
            let trivial = traces.is_trivial(traces.trace_of(block));
            assert_eq!(trivial, block == Block::new(2), "{block}");
        }
    }

    #[test]
    fn single_block_method() {
        let (_reginfo, class) = GenericRegInfo::with_reg_count(2);
        let mut func = GenericFunction::new();
        let v0 = func.new_value(class);
        let b0 = func.create_block(1.0);
        func.add_inst(b0, &[Operand::regclass_def(v0, class)]);
        func.add_ret(b0, &[Operand::regclass_use(v0, class)]);

        let mut stats = crate::Stats::default();
        for strategy in [
            TraceStrategy::SingleBlock,
            TraceStrategy::UniDirectional,
            TraceStrategy::BiDirectional,
        ] {
            let mut traces = TraceSet::new();
            traces.compute(&func, strategy, &mut stats);
            assert_eq!(traces.num_traces(), 1);
            assert_eq!(traces.blocks(Trace::new(0)), &[b0]);
            assert!(!traces.is_trivial(Trace::new(0)));
        }
    }

    #[test]
    fn bi_directional_keeps_loop_body_in_one_trace() {
        let (_reginfo, class) = GenericRegInfo::with_reg_count(2);
        let mut func = GenericFunction::new();
        let v0 = func.new_value(class);

        // b0 -> b1 -> b2 -> b1 (loop), b2 -> b3
        let b0 = func.create_block(1.0);
        let b1 = func.create_block(10.0);
        let b2 = func.create_block(10.0);
        let b3 = func.create_block(1.0);
        func.set_loop_flags(b1, true, false);
        func.set_loop_flags(b2, false, true);

        func.add_inst(b0, &[Operand::regclass_def(v0, class)]);
        func.add_jump(b0, b1, &[]);
        func.add_jump(b1, b2, &[]);
        func.add_branch(b2, &[], &[b1, b3]);
        func.add_ret(b3, &[Operand::regclass_use(v0, class)]);

        // b1 has two predecessors (b0 and the back-edge), so b1..b2 cannot
        // grow backward past the loop header, but the hot body stays
        // together.
        let mut stats = crate::Stats::default();
        let mut traces = TraceSet::new();
        traces.compute(&func, TraceStrategy::BiDirectional, &mut stats);
        check_partition(&func, &traces);
        assert_eq!(traces.trace_of(b1), traces.trace_of(b2));
    }
}
