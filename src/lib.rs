//! A trace-based register allocator designed to be embedded in an existing
//! compiler code base.
//!
//! This crate is compatible with `#![no_std]` and only requires `alloc`.
//!
//! # Usage
//!
//! To use this register allocator in your project, you will need to define
//! types which implement 2 traits.
//!
//! You will need an implementation of [`RegInfo`] which describes the set of
//! CPU registers available to the allocator and their properties. See the
//! [`reginfo`] module documentation for more details.
//!
//! You will also need an implementation of [`Function`] which describes the
//! code on which the register allocator needs to run. See the [`function`]
//! module documentation for more details.
//!
//! The register allocator is invoked by creating an instance of
//! [`TraceAllocator`] and then calling [`TraceAllocator::allocate_registers`].
//!
//! Once register allocation succeeds, it will return an [`Output`] which
//! describes the registers that have been assigned to each instruction
//! operand and the sequence of move/spill/reload instructions that need to
//! be inserted between the original instructions. See the [`output`] module
//! documentation for more details.
//!
//! # How it works
//!
//! The allocator partitions the control-flow graph into *traces*: linear
//! chains of basic blocks through which control mostly flows straight. Each
//! trace is allocated independently, as if it were straight-line code, by a
//! linear-scan sub-allocator (or, for degenerate pass-through blocks, a
//! constant-time fast path). A final global resolution pass walks every
//! control-flow edge and inserts exactly the moves needed to reconcile the
//! decisions of adjacent traces, materializing all block-parameter (phi)
//! bookkeeping into explicit moves in the process.
//!
//! # Reusing allocations
//!
//! For performance reasons, the [`TraceAllocator`] type doesn't free
//! temporary allocations after a call to
//! [`TraceAllocator::allocate_registers`]. This allows register allocation
//! to be run on multiple functions without further calls to the memory
//! allocator. Drop the [`TraceAllocator`] to release all temporary memory.
//!
//! # Validation
//!
//! When developing a new client of the register allocator, it is highly
//! recommended to use [`debug_utils::validate_function`] to check the input
//! and [`debug_utils::verify_output`] to independently re-check the produced
//! allocation. If inputs fail validation then the register allocator may
//! panic or produce garbage results; validation and verification are
//! relatively expensive and meant for debug builds only.

#![no_std]
#![warn(rust_2018_idioms, missing_docs)]
#![allow(
    clippy::too_many_arguments,
    clippy::collapsible_if,
    clippy::collapsible_else_if,
    clippy::cast_possible_truncation,
    clippy::too_many_lines,
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::doc_markdown
)]
#![warn(
    clippy::explicit_iter_loop,
    clippy::range_plus_one,
    clippy::map_unwrap_or,
    clippy::cloned_instead_of_copied,
    clippy::semicolon_if_nothing_returned,
    clippy::must_use_candidate,
    clippy::uninlined_format_args,
    clippy::ignored_unit_patterns
)]

extern crate alloc;

use core::fmt;

// Even when trace logging is disabled, the trace macro has a significant
// performance cost so we disable it in release builds.
macro_rules! trace {
    ($($tt:tt)*) => {
        if cfg!(feature = "trace-log") {
            ::log::trace!($($tt)*);
        }
    };
}
macro_rules! trace_enabled {
    () => {
        cfg!(feature = "trace-log") && ::log::log_enabled!(::log::Level::Trace)
    };
}

// Macro for collecting statistics.
macro_rules! stat {
    ($stats:expr, $field:ident) => {
        $stats.$field += 1
    };
    ($stats:expr, $field:ident, $count:expr) => {
        $stats.$field += $count
    };
}

#[macro_use]
pub mod entity;

pub mod debug_utils;
pub mod function;
pub mod output;
pub mod reginfo;

mod internal;

use function::Function;
use internal::allocations::Allocations;
use internal::linear_scan::LinearScan;
use internal::liveness::GlobalLiveness;
use internal::move_resolver::MoveResolver;
use internal::spill_slots::SpillSlots;
use internal::trace::TraceSet;
use internal::trivial;
use internal::TraceContext;
use output::Output;
use reginfo::RegInfo;

/// Structure holding persistent memory allocations that can be reused across
/// multiple invocations of the register allocator.
///
/// This avoids repeated calls to the memory allocator when compiling
/// multiple functions.
pub struct TraceAllocator {
    traces: TraceSet,
    liveness: GlobalLiveness,
    linear_scan: LinearScan,
    spill_slots: SpillSlots,
    allocations: Allocations,
    move_resolver: MoveResolver,
    stats: Stats,
}

impl Default for TraceAllocator {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl TraceAllocator {
    /// Creates a new `TraceAllocator` instance.
    #[must_use]
    pub fn new() -> Self {
        Self {
            traces: TraceSet::new(),
            liveness: GlobalLiveness::new(),
            linear_scan: LinearScan::new(),
            spill_slots: SpillSlots::new(),
            allocations: Allocations::new(),
            move_resolver: MoveResolver::new(),
            stats: Stats::default(),
        }
    }

    /// Runs the register allocator on the given function.
    pub fn allocate_registers<'a, F, R>(
        &'a mut self,
        func: &'a F,
        reginfo: &'a R,
        options: &Options,
    ) -> Result<Output<'a, F, R>, RegAllocError>
    where
        F: Function,
        R: RegInfo,
    {
        trace!(
            "Input function:\n{}",
            debug_utils::DisplayFunction(func)
        );

        if func.num_blocks() > function::MAX_BLOCKS
            || func.num_insts() > function::MAX_INSTS
            || func.num_values() > function::MAX_VALUES
        {
            return Err(RegAllocError::FunctionTooBig);
        }

        // Reset stats and gather initial information.
        self.stats = Stats::default();
        stat!(self.stats, blocks, func.num_blocks());
        stat!(self.stats, input_insts, func.num_insts());
        stat!(self.stats, values, func.num_values());

        // Partition the CFG into traces.
        self.traces.compute(func, options.trace_strategy, &mut self.stats);

        // Compute per-block live-in/live-out sets.
        self.liveness.compute(func, &mut self.stats);

        // Reserve space for allocation results in the allocation map.
        self.allocations.compute_offsets(func, &mut self.stats)?;

        self.spill_slots.clear(func.num_values());
        self.move_resolver.clear();

        // Allocate each trace with the appropriate strategy. Trivial traces
        // can optionally be processed first so that their shared state is
        // available to every later trace.
        let mut ctx = TraceContext {
            func,
            reginfo,
            options,
            traces: &self.traces,
            liveness: &mut self.liveness,
            spill_slots: &mut self.spill_slots,
            allocations: &mut self.allocations,
            edits: self.move_resolver.edits_mut(),
            stats: &mut self.stats,
        };
        let early = options.schedule_trivial_traces_early;
        for round in 0..2 {
            for trace in ctx.traces.traces() {
                let trivial = ctx.traces.is_trivial(trace);
                // With early scheduling, trivial traces run in round 0 and
                // everything else in round 1; otherwise a single pass in
                // trace order.
                let due_now = if early {
                    (round == 0) == trivial
                } else {
                    round == 0
                };
                if !due_now {
                    continue;
                }
                // The fast path declines when its predecessor has not been
                // allocated yet; the full allocator handles the trace then.
                if trivial && trivial::run(&mut ctx, trace) {
                    continue;
                }
                self.linear_scan.run(&mut ctx, trace)?;
            }
        }

        // Insert the moves reconciling per-trace decisions at every
        // control-flow edge.
        self.move_resolver.resolve(
            func,
            reginfo,
            &self.liveness,
            &mut self.spill_slots,
            &mut self.stats,
        );

        let output = Output {
            regalloc: self,
            func,
            reginfo,
        };
        trace!("Output:\n{output}");
        trace!("{}", self.stats);
        Ok(output)
    }
}

/// Trace building strategy.
///
/// Each strategy reaches an equivalent, correct allocation; they differ in
/// how much inter-block context the linear scan gets to exploit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TraceStrategy {
    /// Every block is its own trace. The baseline: always correct, no
    /// inter-block benefit.
    SingleBlock,

    /// One pass over the linear block order, extending the current trace
    /// through fall-through edges.
    UniDirectional,

    /// Grow traces in both directions from high-frequency seed blocks.
    ///
    /// This is the default since it keeps hot paths (in particular loop
    /// bodies) within single traces.
    #[default]
    BiDirectional,
}

/// Configuration options for the register allocator.
///
/// Each option changes *how* an equivalent, correct answer is reached, never
/// correctness itself.
#[derive(Debug, Clone)]
pub struct Options {
    /// How the CFG is partitioned into traces.
    pub trace_strategy: TraceStrategy,

    /// Allocate trivial traces before all others so that every later trace
    /// can see their (shared) boundary state.
    pub schedule_trivial_traces_early: bool,

    /// Hint values entering a trace towards the register they occupy at the
    /// end of an already-allocated predecessor trace.
    pub inter_trace_hints: bool,

    /// Keep using a value's existing stack slot when re-spilling it later in
    /// the same trace.
    pub share_spill_info: bool,

    /// Reuse one stack slot for a value across all traces, first writer
    /// wins.
    pub cache_stack_slots: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            trace_strategy: TraceStrategy::default(),
            schedule_trivial_traces_early: false,
            inter_trace_hints: true,
            share_spill_info: true,
            cache_stack_slots: true,
        }
    }
}

/// Error returned by the register allocator if allocation is impossible.
///
/// This does not cover invalid input functions: those are caught by
/// [`debug_utils::validate_function`], and feeding unvalidated malformed
/// input to the allocator may panic.
#[derive(Debug)]
#[non_exhaustive]
pub enum RegAllocError {
    /// More registers are needed by an instruction's operands than the
    /// target provides.
    ///
    /// Generally this can only occur due to excessive and/or invalid
    /// constraints on instruction operands, and should be considered a bug
    /// in the client. Re-running allocation cannot succeed; an outer policy
    /// may fall back to a lower compilation tier.
    TooManyLiveRegs,

    /// The size of the function exceeded internal limits of the allocator.
    FunctionTooBig,
}

impl fmt::Display for RegAllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegAllocError::TooManyLiveRegs => {
                write!(f, "too many live registers in a single instruction")
            }
            RegAllocError::FunctionTooBig => {
                write!(f, "function size exceeded implementation limits")
            }
        }
    }
}

/// Statistics collected by the register allocator.
///
/// This is an opaque type since the set of statistics may vary between
/// versions of the register allocator. The only supported operations are
/// default initialization and printing with `Debug` or `Display`.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    // Stats from the input function.
    blocks: usize,
    input_insts: usize,
    operands: usize,
    values: usize,

    // Stats from trace building.
    traces: usize,
    trivial_traces: usize,

    // Stats from liveness.
    live_in_values: usize,
    live_out_values: usize,

    // Stats from per-trace allocation.
    linear_scan_traces: usize,
    trivial_fast_path: usize,
    intervals_built: usize,
    interval_splits: usize,
    spilled_intervals: usize,
    split_moves: usize,
    fixed_constraint_moves: usize,

    // Stats from stack slot management.
    cached_spill_slots: usize,
    trace_spill_slots: usize,
    emergency_spill_slots: usize,

    // Stats from move resolution.
    resolved_edges: usize,
    resolution_moves: usize,
    remat_moves: usize,
    stack_to_stack_moves: usize,
    move_cycles: usize,
    scratch_evictions: usize,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:#?}")
    }
}
