//! Guard policies: the closed set of predicates a transition may require.
//!
//! Guards only read the run context. The policies:
//!
//! ```text
//! FixCycleUnderBudget   fix_cycle_count <  max_fix_cycles
//! FixCycleExhausted     fix_cycle_count >= max_fix_cycles
//! GateNameEquals(g)     gate_name == g
//! ```

use std::fmt;

use shipyard_types::{GateName, PipelineRunContext};

/// A named predicate over [`PipelineRunContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Guard {
    FixCycleUnderBudget,
    FixCycleExhausted,
    GateNameEquals(GateName),
}

impl Guard {
    /// Evaluate this guard against a run context.
    pub fn evaluate(&self, ctx: &PipelineRunContext) -> bool {
        match self {
            Guard::FixCycleUnderBudget => ctx.fix_cycle_count < ctx.max_fix_cycles,
            Guard::FixCycleExhausted => ctx.fix_cycle_count >= ctx.max_fix_cycles,
            Guard::GateNameEquals(gate) => ctx.gate_name == Some(*gate),
        }
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Guard::FixCycleUnderBudget => f.write_str("fix_cycle_count < max_fix_cycles"),
            Guard::FixCycleExhausted => f.write_str("fix_cycle_count >= max_fix_cycles"),
            Guard::GateNameEquals(gate) => write!(f, "gate_name == \"{gate}\""),
        }
    }
}
