//! Side-effect dispatch: the seam between the state machine and the systems
//! that actually run gates, deploy, merge, and remediate.
//!
//! Each catalog entry in [`SideEffect`] maps to calls on a [`Collaborators`]
//! implementation through one exhaustive `match`, so adding a catalog entry
//! without deciding how to dispatch it does not compile.

use std::sync::Mutex;

use async_trait::async_trait;

use shipyard_types::{
    DefectReport, DefectSeverity, Environment, GateName, PipelineRunContext, Result,
    ShipyardError, SideEffect,
};

use crate::table::TransitionDef;

// ---------------------------------------------------------------------------
// Collaborators trait
// ---------------------------------------------------------------------------

/// The external systems the pipeline drives. Every method is fire-and-continue:
/// it starts the work and returns; the outcome arrives later as a trigger.
#[async_trait]
pub trait Collaborators: Send + Sync {
    /// Start the given test gate.
    async fn run_gate(&self, gate: GateName, ctx: &PipelineRunContext) -> Result<()>;

    /// Start a deployment to `env`.
    async fn deploy(&self, env: Environment, ctx: &PipelineRunContext) -> Result<()>;

    async fn merge_to_staging(&self, ctx: &PipelineRunContext) -> Result<()>;

    async fn create_release_pr(&self, ctx: &PipelineRunContext) -> Result<()>;

    async fn create_defect(&self, defect: &DefectReport, ctx: &PipelineRunContext) -> Result<()>;

    /// Ask the fix agent to repair the failure reported by `gate`.
    async fn launch_fix_agent(&self, gate: GateName, ctx: &PipelineRunContext) -> Result<()>;

    /// Ask the judge agent to resolve a staging merge conflict.
    async fn launch_judge_agent(&self, ctx: &PipelineRunContext) -> Result<()>;
}

// ---------------------------------------------------------------------------
// dispatch
// ---------------------------------------------------------------------------

/// Build the defect report for a transition that records one.
pub fn defect_for(def: &TransitionDef, ctx: &PipelineRunContext) -> DefectReport {
    DefectReport {
        pipeline_run_id: ctx.pipeline_run_id.clone(),
        pr_number: ctx.pr_number,
        state: def.from,
        trigger: def.trigger,
        gate: def.from.gate().or(ctx.gate_name),
        severity: DefectSeverity::from_trigger(def.trigger),
        fix_cycle_count: ctx.fix_cycle_count,
    }
}

/// The gate a fix agent is launched for. Only gate states enter `Fixing`;
/// the context's recorded gate is the fallback for hand-built tables.
fn fix_target(def: &TransitionDef, ctx: &PipelineRunContext) -> Result<GateName> {
    def.from.gate().or(ctx.gate_name).ok_or_else(|| {
        ShipyardError::Other(format!(
            "launchFixAgent dispatched from {} with no gate to fix",
            def.from
        ))
    })
}

/// Perform the side effect `effect` for the transition `def`, with `ctx` being
/// the run context after the transition.
///
/// Compound `createDefectAnd*` effects record the defect first and then start
/// the next stage; if recording fails the next stage is not started.
pub async fn dispatch(
    effect: SideEffect,
    def: &TransitionDef,
    ctx: &PipelineRunContext,
    collaborators: &dyn Collaborators,
) -> Result<()> {
    match effect {
        SideEffect::DispatchUnitPactGate => collaborators.run_gate(GateName::UnitPact, ctx).await,
        SideEffect::DispatchIntegrationGate => {
            collaborators.run_gate(GateName::Integration, ctx).await
        }
        SideEffect::DispatchE2eGate => collaborators.run_gate(GateName::E2e, ctx).await,
        SideEffect::DispatchRegressionGate => {
            collaborators.run_gate(GateName::Regression, ctx).await
        }
        SideEffect::DispatchDevDeploy => collaborators.deploy(Environment::Dev, ctx).await,
        SideEffect::DispatchStagingDeploy => collaborators.deploy(Environment::Staging, ctx).await,
        SideEffect::DispatchProdDeploy => collaborators.deploy(Environment::Prod, ctx).await,
        SideEffect::MergeToStaging => collaborators.merge_to_staging(ctx).await,
        SideEffect::CreateReleasePr => collaborators.create_release_pr(ctx).await,
        SideEffect::CreateDefect => collaborators.create_defect(&defect_for(def, ctx), ctx).await,
        SideEffect::CreateDefectAndDeployDev => {
            collaborators.create_defect(&defect_for(def, ctx), ctx).await?;
            collaborators.deploy(Environment::Dev, ctx).await
        }
        SideEffect::CreateDefectAndDispatchE2e => {
            collaborators.create_defect(&defect_for(def, ctx), ctx).await?;
            collaborators.run_gate(GateName::E2e, ctx).await
        }
        SideEffect::CreateDefectAndMergeStaging => {
            collaborators.create_defect(&defect_for(def, ctx), ctx).await?;
            collaborators.merge_to_staging(ctx).await
        }
        SideEffect::CreateDefectAndCreateReleasePr => {
            collaborators.create_defect(&defect_for(def, ctx), ctx).await?;
            collaborators.create_release_pr(ctx).await
        }
        SideEffect::LaunchFixAgent => {
            let gate = fix_target(def, ctx)?;
            collaborators.launch_fix_agent(gate, ctx).await
        }
        SideEffect::LaunchJudgeAgent => collaborators.launch_judge_agent(ctx).await,
    }
}

// ---------------------------------------------------------------------------
// LoggingCollaborators
// ---------------------------------------------------------------------------

/// Dry-run collaborators: every call is logged and succeeds.
pub struct LoggingCollaborators;

#[async_trait]
impl Collaborators for LoggingCollaborators {
    async fn run_gate(&self, gate: GateName, ctx: &PipelineRunContext) -> Result<()> {
        tracing::info!(run_id = %ctx.pipeline_run_id, %gate, commit = %ctx.commit_sha, "Gate dispatched");
        Ok(())
    }

    async fn deploy(&self, env: Environment, ctx: &PipelineRunContext) -> Result<()> {
        tracing::info!(run_id = %ctx.pipeline_run_id, %env, commit = %ctx.commit_sha, "Deploy dispatched");
        Ok(())
    }

    async fn merge_to_staging(&self, ctx: &PipelineRunContext) -> Result<()> {
        tracing::info!(run_id = %ctx.pipeline_run_id, branch = %ctx.branch, "Merge to staging dispatched");
        Ok(())
    }

    async fn create_release_pr(&self, ctx: &PipelineRunContext) -> Result<()> {
        tracing::info!(run_id = %ctx.pipeline_run_id, target = %ctx.target_branch, "Release PR requested");
        Ok(())
    }

    async fn create_defect(&self, defect: &DefectReport, ctx: &PipelineRunContext) -> Result<()> {
        tracing::info!(
            run_id = %ctx.pipeline_run_id,
            state = %defect.state,
            trigger = %defect.trigger,
            severity = ?defect.severity,
            "Defect recorded"
        );
        Ok(())
    }

    async fn launch_fix_agent(&self, gate: GateName, ctx: &PipelineRunContext) -> Result<()> {
        tracing::info!(
            run_id = %ctx.pipeline_run_id,
            %gate,
            cycle = ctx.fix_cycle_count,
            max = ctx.max_fix_cycles,
            "Fix agent launched"
        );
        Ok(())
    }

    async fn launch_judge_agent(&self, ctx: &PipelineRunContext) -> Result<()> {
        tracing::info!(run_id = %ctx.pipeline_run_id, "Judge agent launched");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingCollaborators
// ---------------------------------------------------------------------------

/// A single call received by [`RecordingCollaborators`].
#[derive(Debug, Clone, PartialEq)]
pub enum CollaboratorCall {
    RunGate(GateName),
    Deploy(Environment),
    MergeToStaging,
    CreateReleasePr,
    CreateDefect(DefectReport),
    LaunchFixAgent(GateName),
    LaunchJudgeAgent,
}

/// Collaborators that remember every call, for tests and simulations. One
/// kind of call can be made to fail.
#[derive(Default)]
pub struct RecordingCollaborators {
    calls: Mutex<Vec<CollaboratorCall>>,
    failing: Mutex<Option<&'static str>>,
}

impl RecordingCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call to the named collaborator method (`"deploy"`,
    /// `"run_gate"`, ...) fail from now on.
    pub fn fail_on(&self, method: &'static str) {
        *self.failing.lock().unwrap() = Some(method);
    }

    pub fn clear_failure(&self) {
        *self.failing.lock().unwrap() = None;
    }

    pub fn calls(&self) -> Vec<CollaboratorCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn take_calls(&self) -> Vec<CollaboratorCall> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    fn record(&self, method: &'static str, call: CollaboratorCall) -> Result<()> {
        if *self.failing.lock().unwrap() == Some(method) {
            return Err(ShipyardError::CollaboratorError {
                collaborator: method.to_string(),
                message: "injected failure".into(),
            });
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

#[async_trait]
impl Collaborators for RecordingCollaborators {
    async fn run_gate(&self, gate: GateName, _ctx: &PipelineRunContext) -> Result<()> {
        self.record("run_gate", CollaboratorCall::RunGate(gate))
    }

    async fn deploy(&self, env: Environment, _ctx: &PipelineRunContext) -> Result<()> {
        self.record("deploy", CollaboratorCall::Deploy(env))
    }

    async fn merge_to_staging(&self, _ctx: &PipelineRunContext) -> Result<()> {
        self.record("merge_to_staging", CollaboratorCall::MergeToStaging)
    }

    async fn create_release_pr(&self, _ctx: &PipelineRunContext) -> Result<()> {
        self.record("create_release_pr", CollaboratorCall::CreateReleasePr)
    }

    async fn create_defect(&self, defect: &DefectReport, _ctx: &PipelineRunContext) -> Result<()> {
        self.record("create_defect", CollaboratorCall::CreateDefect(defect.clone()))
    }

    async fn launch_fix_agent(&self, gate: GateName, _ctx: &PipelineRunContext) -> Result<()> {
        self.record("launch_fix_agent", CollaboratorCall::LaunchFixAgent(gate))
    }

    async fn launch_judge_agent(&self, _ctx: &PipelineRunContext) -> Result<()> {
        self.record("launch_judge_agent", CollaboratorCall::LaunchJudgeAgent)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
