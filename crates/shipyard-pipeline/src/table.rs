//! The release graph as data.
//!
//! Every legal `(state, trigger) -> (state, side effect)` mapping is declared
//! once in [`TransitionTable::standard`]. Entries sharing a `(from, trigger)`
//! pair are told apart by their guards, and declaration order is the
//! tie-break the resolver honors.

use shipyard_types::{GateName, PipelineState, SideEffect, Trigger};

use crate::guard::Guard;

/// One edge of the release graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionDef {
    pub from: PipelineState,
    pub trigger: Trigger,
    pub to: PipelineState,
    pub guard: Option<Guard>,
    pub side_effect: Option<SideEffect>,
}

impl TransitionDef {
    pub fn new(from: PipelineState, trigger: Trigger, to: PipelineState) -> Self {
        Self {
            from,
            trigger,
            to,
            guard: None,
            side_effect: None,
        }
    }

    pub fn with_guard(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn with_effect(mut self, effect: SideEffect) -> Self {
        self.side_effect = Some(effect);
        self
    }
}

/// An immutable, ordered list of [`TransitionDef`]s.
#[derive(Debug, Clone)]
pub struct TransitionTable {
    defs: Vec<TransitionDef>,
}

impl TransitionTable {
    /// Build a table from arbitrary definitions. Callers that want the
    /// structural guarantees should run [`crate::validate_or_raise`] on it.
    pub fn from_defs(defs: Vec<TransitionDef>) -> Self {
        Self { defs }
    }

    /// The fixed release pipeline.
    pub fn standard() -> Self {
        use PipelineState::*;
        use SideEffect::*;
        use Trigger::*;

        let t = TransitionDef::new;

        let mut defs = vec![
            // Happy path
            t(Created, PrOpened, UnitPactGate).with_effect(DispatchUnitPactGate),
            t(UnitPactGate, GatePassed, DevDeploying).with_effect(DispatchDevDeploy),
            t(DevDeploying, DeployCompleted, DevDeployed),
            t(DevDeployed, GatePassed, IntegrationGate).with_effect(DispatchIntegrationGate),
            t(IntegrationGate, GatePassed, E2eGate).with_effect(DispatchE2eGate),
            t(E2eGate, GatePassed, StagingPromoting).with_effect(MergeToStaging),
            t(StagingPromoting, MergeCompleted, StagingDeploying).with_effect(DispatchStagingDeploy),
            t(StagingDeploying, DeployCompleted, StagingDeployed),
            t(StagingDeployed, GatePassed, RegressionGate).with_effect(DispatchRegressionGate),
            t(RegressionGate, GatePassed, ReadyForProd).with_effect(CreateReleasePr),
            t(ReadyForProd, HumanApproved, ProdDeploying).with_effect(DispatchProdDeploy),
            t(ProdDeploying, DeployCompleted, ProdDeployed),
            t(ProdDeployed, GatePassed, Done),
            // Non-critical gate failures keep promoting and record a defect
            t(UnitPactGate, GateNonCriticalFail, DevDeploying).with_effect(CreateDefectAndDeployDev),
            t(IntegrationGate, GateNonCriticalFail, E2eGate).with_effect(CreateDefectAndDispatchE2e),
            t(E2eGate, GateNonCriticalFail, StagingPromoting).with_effect(CreateDefectAndMergeStaging),
            t(RegressionGate, GateNonCriticalFail, ReadyForProd)
                .with_effect(CreateDefectAndCreateReleasePr),
        ];

        // Critical gate failures: fix while under budget, fail once exhausted
        for gate in GateName::ALL {
            defs.push(
                t(gate.state(), GateCriticalFail, Fixing)
                    .with_guard(Guard::FixCycleUnderBudget)
                    .with_effect(LaunchFixAgent),
            );
            defs.push(
                t(gate.state(), GateCriticalFail, Failed)
                    .with_guard(Guard::FixCycleExhausted)
                    .with_effect(CreateDefect),
            );
        }

        // A pushed fix goes back to the gate that failed
        for gate in GateName::ALL {
            defs.push(
                t(Fixing, FixAgentPushed, gate.state())
                    .with_guard(Guard::GateNameEquals(gate))
                    .with_effect(gate.dispatch_effect()),
            );
        }

        defs.extend([
            t(Fixing, FixAgentFailed, Failed).with_effect(CreateDefect),
            t(Fixing, FixAgentTimeout, Failed).with_effect(CreateDefect),
            t(Fixing, ManualAbort, Failed),
            // Merge conflict escalation
            t(StagingPromoting, MergeConflict, Judging).with_effect(LaunchJudgeAgent),
            t(Judging, JudgeResolved, StagingPromoting).with_effect(MergeToStaging),
            t(Judging, JudgeFailed, Failed).with_effect(CreateDefect),
            // Deploy failures are terminal and record nothing here
            t(DevDeploying, DeployFailed, Failed),
            t(StagingDeploying, DeployFailed, Failed),
            t(ProdDeploying, DeployFailed, Failed),
        ]);

        Self { defs }
    }

    pub fn defs(&self) -> &[TransitionDef] {
        &self.defs
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// All entries leaving `state`, in declaration order.
    pub fn outgoing(&self, state: PipelineState) -> impl Iterator<Item = &TransitionDef> {
        self.defs.iter().filter(move |d| d.from == state)
    }

    /// All entries for a `(state, trigger)` pair, in declaration order.
    pub fn matching(
        &self,
        state: PipelineState,
        trigger: Trigger,
    ) -> impl Iterator<Item = &TransitionDef> {
        self.defs
            .iter()
            .filter(move |d| d.from == state && d.trigger == trigger)
    }

    /// Distinct triggers accepted in `state`, in first-declared order.
    pub fn triggers_from(&self, state: PipelineState) -> Vec<Trigger> {
        let mut triggers = Vec::new();
        for def in self.outgoing(state) {
            if !triggers.contains(&def.trigger) {
                triggers.push(def.trigger);
            }
        }
        triggers
    }
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::standard()
    }
}
