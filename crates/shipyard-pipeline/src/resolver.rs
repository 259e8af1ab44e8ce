//! Transition resolution.
//!
//! Given the current state, an incoming trigger and the run context, pick the
//! single table entry to apply: filter to the `(state, trigger)` pair, walk the
//! survivors in declaration order, and take the first one whose guard is
//! absent or holds.

use shipyard_types::{PipelineRunContext, PipelineState, Trigger};

use crate::table::{TransitionDef, TransitionTable};

/// Find the transition to apply, or `None` when the trigger is not legal in
/// `state` for this context.
///
/// Pure: the context is only read.
pub fn find<'a>(
    table: &'a TransitionTable,
    state: PipelineState,
    trigger: Trigger,
    ctx: &PipelineRunContext,
) -> Option<&'a TransitionDef> {
    table
        .matching(state, trigger)
        .find(|def| def.guard.map_or(true, |guard| guard.evaluate(ctx)))
}
