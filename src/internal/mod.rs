//! Modules used internally by the register allocator.

pub mod allocations;
pub mod intervals;
pub mod linear_scan;
pub mod liveness;
pub mod move_resolver;
pub mod parallel_moves;
pub mod spill_slots;
pub mod trace;
pub mod trivial;

use alloc::vec::Vec;

use crate::output::{Edit, MovePosition};
use crate::{Options, Stats};

use self::allocations::Allocations;
use self::liveness::GlobalLiveness;
use self::spill_slots::SpillSlots;
use self::trace::TraceSet;

/// Context threaded through the per-trace allocation strategies.
///
/// Every field is always present once trace building and liveness have run;
/// strategies never need to probe for optional state. Both strategies
/// (trivial fast path and linear scan) run against this same contract.
pub struct TraceContext<'a, F, R> {
    pub func: &'a F,
    pub reginfo: &'a R,
    pub options: &'a Options,
    pub traces: &'a TraceSet,
    pub liveness: &'a mut GlobalLiveness,
    pub spill_slots: &'a mut SpillSlots,
    pub allocations: &'a mut Allocations,

    /// Edits emitted while allocating, e.g. to connect split intervals
    /// within a block. The global move resolver appends to this and finally
    /// sorts it by position.
    pub edits: &'a mut Vec<(MovePosition, Edit)>,

    pub stats: &'a mut Stats,
}
