//! Applying a trigger: resolve, then compute the run's next context.
//!
//! The table never mutates context. The only context changes a transition
//! carries are made here, on a copy:
//!
//! - entering `Fixing` from a gate bumps `fix_cycle_count` by one and records
//!   that gate in `gate_name`;
//! - nothing else changes. The counter is never reset within a run, and
//!   `gate_name` stays set after leaving `Fixing`.

use shipyard_types::{
    PipelineRunContext, PipelineState, Result, ShipyardError, SideEffect, Trigger,
};

use crate::resolver::find;
use crate::table::{TransitionDef, TransitionTable};

/// The outcome of a successfully resolved trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedTransition {
    pub def: TransitionDef,
    /// The run context after the transition. The input context is untouched.
    pub context: PipelineRunContext,
}

impl AppliedTransition {
    pub fn next_state(&self) -> PipelineState {
        self.def.to
    }

    pub fn side_effect(&self) -> Option<SideEffect> {
        self.def.side_effect
    }
}

/// Resolve `trigger` in `state` and return the next state, its side effect,
/// and the updated context.
///
/// Returns [`ShipyardError::IllegalTrigger`] when no entry matches.
pub fn apply_trigger(
    table: &TransitionTable,
    ctx: &PipelineRunContext,
    state: PipelineState,
    trigger: Trigger,
) -> Result<AppliedTransition> {
    let def = *find(table, state, trigger, ctx)
        .ok_or(ShipyardError::IllegalTrigger { state, trigger })?;
    let context = next_context(&def, ctx);
    Ok(AppliedTransition { def, context })
}

fn next_context(def: &TransitionDef, ctx: &PipelineRunContext) -> PipelineRunContext {
    let mut next = ctx.clone();
    if def.to == PipelineState::Fixing {
        if let Some(gate) = def.from.gate() {
            next.fix_cycle_count = next.fix_cycle_count.saturating_add(1);
            next.gate_name = Some(gate);
        }
    }
    next
}
