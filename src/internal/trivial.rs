//! Fast path for trivial traces.
//!
//! A trivial trace is a single pass-through block: no block parameters and a
//! lone unconditional jump with no operands. Such a block changes no value,
//! so the predecessor's post-block location assignment is also this block's
//! assignment, on entry and on exit. Instead of building intervals, the fast
//! path shares the predecessor's out-location set as this block's in *and*
//! out set. Outgoing phi values on the jump need no rewriting here: the
//! resolver locates them in the shared set by binary search over the sorted
//! value array.

use crate::function::Function;
use crate::internal::trace::Trace;
use crate::internal::TraceContext;
use crate::reginfo::RegInfo;

/// Allocates a trivial trace by reusing the predecessor's assignment.
///
/// Returns `false` when the predecessor's trace has not been allocated yet,
/// in which case the caller must fall back to the full linear scan.
pub fn run<F: Function, R: RegInfo>(ctx: &mut TraceContext<'_, F, R>, trace: Trace) -> bool {
    debug_assert!(ctx.traces.is_trivial(trace));
    let block = ctx.traces.blocks(trace)[0];
    let &[pred] = ctx.func.block_preds(block) else {
        // Trivial classification guarantees a unique predecessor.
        return false;
    };
    let Some(out_set) = ctx.liveness.out_set(pred) else {
        return false;
    };

    trace!("{trace}: trivial fast path, sharing exit state of {pred}");
    stat!(ctx.stats, trivial_fast_path);
    ctx.liveness.set_in_set(block, out_set);
    ctx.liveness.set_out_set(block, out_set);
    true
}
