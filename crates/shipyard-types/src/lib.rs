//! Shared types, errors, run context, and run records for the Shipyard release pipeline.
//!
//! This crate provides the vocabulary used by every other Shipyard crate:
//! - `ShipyardError`: unified error taxonomy
//! - `PipelineState` / `Trigger`: the nodes and edge labels of the release graph
//! - `SideEffect`: the closed catalog of collaborator dispatches
//! - `PipelineRunContext`: per-run counters and identifiers read by guards
//! - `PipelineRunRecord`: the persisted shape of one run, with its audit history

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unified error type for all Shipyard subsystems.
#[derive(Debug, thiserror::Error)]
pub enum ShipyardError {
    // === State machine ===
    #[error("Trigger {trigger} is not valid in state {state}")]
    IllegalTrigger {
        state: PipelineState,
        trigger: Trigger,
    },

    #[error("Pipeline validation failed: {0}")]
    ValidationError(String),

    // === Runs ===
    #[error("Pipeline run '{run_id}' not found")]
    RunNotFound { run_id: String },

    #[error("PR #{pr_number} already has an active pipeline run '{run_id}'")]
    RunAlreadyActive { pr_number: u64, run_id: String },

    #[error("Pipeline run '{run_id}' was modified concurrently (expected version {expected}, found {found})")]
    VersionConflict {
        run_id: String,
        expected: u64,
        found: u64,
    },

    // === Collaborators ===
    #[error("Side effect '{effect}' failed for run '{run_id}': {message}")]
    SideEffectFailed {
        run_id: String,
        effect: String,
        message: String,
    },

    #[error("Collaborator '{collaborator}' error: {message}")]
    CollaboratorError {
        collaborator: String,
        message: String,
    },

    // === Parsing ===
    #[error("Unknown {kind} '{value}'")]
    InvalidName { kind: &'static str, value: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl ShipyardError {
    /// Returns `true` when the error means "this trigger was refused", as
    /// opposed to something having broken.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ShipyardError::IllegalTrigger { .. })
    }

    /// Returns `true` if the caller may retry the same operation and expect
    /// a different result.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ShipyardError::VersionConflict { .. } | ShipyardError::CollaboratorError { .. }
        )
    }
}

/// A convenience alias for `Result<T, ShipyardError>`.
pub type Result<T> = std::result::Result<T, ShipyardError>;

/// Case- and separator-insensitive key used by the `FromStr` impls, so that
/// `UnitPactGate`, `unit_pact_gate` and `unit-pact-gate` all match.
fn normalize_name(s: &str) -> String {
    s.trim()
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

// ---------------------------------------------------------------------------
// GateName / Environment
// ---------------------------------------------------------------------------

/// One of the four automated test gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateName {
    UnitPact,
    Integration,
    E2e,
    Regression,
}

impl GateName {
    pub const ALL: [GateName; 4] = [
        GateName::UnitPact,
        GateName::Integration,
        GateName::E2e,
        GateName::Regression,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GateName::UnitPact => "unit_pact",
            GateName::Integration => "integration",
            GateName::E2e => "e2e",
            GateName::Regression => "regression",
        }
    }

    /// The pipeline state in which this gate runs.
    pub fn state(self) -> PipelineState {
        match self {
            GateName::UnitPact => PipelineState::UnitPactGate,
            GateName::Integration => PipelineState::IntegrationGate,
            GateName::E2e => PipelineState::E2eGate,
            GateName::Regression => PipelineState::RegressionGate,
        }
    }

    /// The side effect that (re-)runs this gate.
    pub fn dispatch_effect(self) -> SideEffect {
        match self {
            GateName::UnitPact => SideEffect::DispatchUnitPactGate,
            GateName::Integration => SideEffect::DispatchIntegrationGate,
            GateName::E2e => SideEffect::DispatchE2eGate,
            GateName::Regression => SideEffect::DispatchRegressionGate,
        }
    }
}

impl fmt::Display for GateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GateName {
    type Err = ShipyardError;

    fn from_str(s: &str) -> Result<Self> {
        let key = normalize_name(s);
        GateName::ALL
            .into_iter()
            .find(|g| normalize_name(g.as_str()) == key)
            .ok_or_else(|| ShipyardError::InvalidName {
                kind: "gate",
                value: s.to_string(),
            })
    }
}

/// Deployment target environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Dev => f.write_str("dev"),
            Environment::Staging => f.write_str("staging"),
            Environment::Prod => f.write_str("prod"),
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineState
// ---------------------------------------------------------------------------

/// A node of the release graph. `Created` is the only initial state; `Done`
/// and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Created,
    UnitPactGate,
    DevDeploying,
    DevDeployed,
    IntegrationGate,
    E2eGate,
    StagingPromoting,
    StagingDeploying,
    StagingDeployed,
    RegressionGate,
    ReadyForProd,
    ProdDeploying,
    ProdDeployed,
    Done,
    Fixing,
    Judging,
    Failed,
}

impl PipelineState {
    pub const ALL: [PipelineState; 17] = [
        PipelineState::Created,
        PipelineState::UnitPactGate,
        PipelineState::DevDeploying,
        PipelineState::DevDeployed,
        PipelineState::IntegrationGate,
        PipelineState::E2eGate,
        PipelineState::StagingPromoting,
        PipelineState::StagingDeploying,
        PipelineState::StagingDeployed,
        PipelineState::RegressionGate,
        PipelineState::ReadyForProd,
        PipelineState::ProdDeploying,
        PipelineState::ProdDeployed,
        PipelineState::Done,
        PipelineState::Fixing,
        PipelineState::Judging,
        PipelineState::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }

    /// The gate that runs in this state, if it is one of the four gate states.
    pub fn gate(self) -> Option<GateName> {
        match self {
            PipelineState::UnitPactGate => Some(GateName::UnitPact),
            PipelineState::IntegrationGate => Some(GateName::Integration),
            PipelineState::E2eGate => Some(GateName::E2e),
            PipelineState::RegressionGate => Some(GateName::Regression),
            _ => None,
        }
    }

    /// States the driver leaves immediately with a synthetic `GatePassed`:
    /// a finished deploy needs no further external signal.
    pub fn auto_advances(self) -> bool {
        matches!(
            self,
            PipelineState::DevDeployed | PipelineState::StagingDeployed | PipelineState::ProdDeployed
        )
    }

    pub fn is_deploying(self) -> bool {
        matches!(
            self,
            PipelineState::DevDeploying
                | PipelineState::StagingDeploying
                | PipelineState::ProdDeploying
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for PipelineState {
    type Err = ShipyardError;

    fn from_str(s: &str) -> Result<Self> {
        let key = normalize_name(s);
        PipelineState::ALL
            .into_iter()
            .find(|st| normalize_name(&st.to_string()) == key)
            .ok_or_else(|| ShipyardError::InvalidName {
                kind: "state",
                value: s.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// An event reported by an external collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    PrOpened,
    GatePassed,
    GateNonCriticalFail,
    GateCriticalFail,
    DeployCompleted,
    DeployFailed,
    MergeCompleted,
    MergeConflict,
    FixAgentPushed,
    FixAgentFailed,
    FixAgentTimeout,
    JudgeResolved,
    JudgeFailed,
    HumanApproved,
    ManualAbort,
}

impl Trigger {
    pub const ALL: [Trigger; 15] = [
        Trigger::PrOpened,
        Trigger::GatePassed,
        Trigger::GateNonCriticalFail,
        Trigger::GateCriticalFail,
        Trigger::DeployCompleted,
        Trigger::DeployFailed,
        Trigger::MergeCompleted,
        Trigger::MergeConflict,
        Trigger::FixAgentPushed,
        Trigger::FixAgentFailed,
        Trigger::FixAgentTimeout,
        Trigger::JudgeResolved,
        Trigger::JudgeFailed,
        Trigger::HumanApproved,
        Trigger::ManualAbort,
    ];
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for Trigger {
    type Err = ShipyardError;

    fn from_str(s: &str) -> Result<Self> {
        let key = normalize_name(s);
        Trigger::ALL
            .into_iter()
            .find(|t| normalize_name(&t.to_string()) == key)
            .ok_or_else(|| ShipyardError::InvalidName {
                kind: "trigger",
                value: s.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// SideEffect: the collaborator catalog
// ---------------------------------------------------------------------------

/// A named dispatch to an external collaborator. Serialized as its catalog
/// name (`"dispatchUnitPactGate"`, `"createReleasePR"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SideEffect {
    DispatchUnitPactGate,
    DispatchDevDeploy,
    MergeToStaging,
    DispatchStagingDeploy,
    #[serde(rename = "createReleasePR")]
    CreateReleasePr,
    DispatchProdDeploy,
    CreateDefectAndDeployDev,
    CreateDefectAndDispatchE2e,
    CreateDefectAndMergeStaging,
    #[serde(rename = "createDefectAndCreateReleasePR")]
    CreateDefectAndCreateReleasePr,
    LaunchFixAgent,
    CreateDefect,
    LaunchJudgeAgent,
    DispatchIntegrationGate,
    DispatchE2eGate,
    DispatchRegressionGate,
}

impl SideEffect {
    pub const ALL: [SideEffect; 16] = [
        SideEffect::DispatchUnitPactGate,
        SideEffect::DispatchDevDeploy,
        SideEffect::MergeToStaging,
        SideEffect::DispatchStagingDeploy,
        SideEffect::CreateReleasePr,
        SideEffect::DispatchProdDeploy,
        SideEffect::CreateDefectAndDeployDev,
        SideEffect::CreateDefectAndDispatchE2e,
        SideEffect::CreateDefectAndMergeStaging,
        SideEffect::CreateDefectAndCreateReleasePr,
        SideEffect::LaunchFixAgent,
        SideEffect::CreateDefect,
        SideEffect::LaunchJudgeAgent,
        SideEffect::DispatchIntegrationGate,
        SideEffect::DispatchE2eGate,
        SideEffect::DispatchRegressionGate,
    ];

    /// The catalog name collaborators are registered under.
    pub fn name(self) -> &'static str {
        match self {
            SideEffect::DispatchUnitPactGate => "dispatchUnitPactGate",
            SideEffect::DispatchDevDeploy => "dispatchDevDeploy",
            SideEffect::MergeToStaging => "mergeToStaging",
            SideEffect::DispatchStagingDeploy => "dispatchStagingDeploy",
            SideEffect::CreateReleasePr => "createReleasePR",
            SideEffect::DispatchProdDeploy => "dispatchProdDeploy",
            SideEffect::CreateDefectAndDeployDev => "createDefectAndDeployDev",
            SideEffect::CreateDefectAndDispatchE2e => "createDefectAndDispatchE2e",
            SideEffect::CreateDefectAndMergeStaging => "createDefectAndMergeStaging",
            SideEffect::CreateDefectAndCreateReleasePr => "createDefectAndCreateReleasePR",
            SideEffect::LaunchFixAgent => "launchFixAgent",
            SideEffect::CreateDefect => "createDefect",
            SideEffect::LaunchJudgeAgent => "launchJudgeAgent",
            SideEffect::DispatchIntegrationGate => "dispatchIntegrationGate",
            SideEffect::DispatchE2eGate => "dispatchE2eGate",
            SideEffect::DispatchRegressionGate => "dispatchRegressionGate",
        }
    }

    /// Whether dispatching this effect records a defect.
    pub fn records_defect(self) -> bool {
        matches!(
            self,
            SideEffect::CreateDefect
                | SideEffect::CreateDefectAndDeployDev
                | SideEffect::CreateDefectAndDispatchE2e
                | SideEffect::CreateDefectAndMergeStaging
                | SideEffect::CreateDefectAndCreateReleasePr
        )
    }
}

impl fmt::Display for SideEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SideEffect {
    type Err = ShipyardError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        SideEffect::ALL
            .into_iter()
            .find(|e| e.name() == trimmed)
            .ok_or_else(|| ShipyardError::InvalidName {
                kind: "side effect",
                value: s.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Defects
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefectSeverity {
    /// A gate failure that does not block promotion.
    NonCritical,
    /// A gate failure that blocks promotion (recorded once the fix budget is spent).
    Critical,
    /// A collaborator (fix agent, judge agent) gave up or timed out.
    Infrastructure,
}

impl DefectSeverity {
    pub fn from_trigger(trigger: Trigger) -> Self {
        match trigger {
            Trigger::GateNonCriticalFail => DefectSeverity::NonCritical,
            Trigger::GateCriticalFail => DefectSeverity::Critical,
            _ => DefectSeverity::Infrastructure,
        }
    }
}

/// What the defect collaborator receives. The defect's own schema belongs to
/// the collaborator; this is only what the state machine knows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefectReport {
    pub pipeline_run_id: String,
    pub pr_number: u64,
    pub state: PipelineState,
    pub trigger: Trigger,
    pub gate: Option<GateName>,
    pub severity: DefectSeverity,
    pub fix_cycle_count: u32,
}

// ---------------------------------------------------------------------------
// PipelineRunContext
// ---------------------------------------------------------------------------

/// Per-run data read by guards and handed to collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunContext {
    pub pipeline_run_id: String,
    pub pr_number: u64,
    pub branch: String,
    pub target_branch: String,
    pub commit_sha: String,
    /// Number of entries into `Fixing` so far. Never decreases within a run.
    pub fix_cycle_count: u32,
    pub max_fix_cycles: u32,
    /// The gate that most recently routed the run into `Fixing`.
    pub gate_name: Option<GateName>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl PipelineRunContext {
    /// Create a context with a fresh run id and zeroed counters.
    pub fn new(
        pr_number: u64,
        branch: impl Into<String>,
        target_branch: impl Into<String>,
        commit_sha: impl Into<String>,
        max_fix_cycles: u32,
    ) -> Self {
        Self {
            pipeline_run_id: uuid::Uuid::new_v4().to_string(),
            pr_number,
            branch: branch.into(),
            target_branch: target_branch.into(),
            commit_sha: commit_sha.into(),
            fix_cycle_count: 0,
            max_fix_cycles,
            gate_name: None,
            metadata: HashMap::new(),
        }
    }

    pub fn fix_budget_remaining(&self) -> u32 {
        self.max_fix_cycles.saturating_sub(self.fix_cycle_count)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// PipelineRunRecord: persisted run state
// ---------------------------------------------------------------------------

/// One applied transition, as kept in the run's audit history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: PipelineState,
    pub trigger: Trigger,
    pub to: PipelineState,
    pub side_effect: Option<SideEffect>,
    /// `true` when the driver issued the trigger itself (deploy auto-advance).
    pub synthetic: bool,
    pub fix_cycle_count: u32,
    pub at: DateTime<Utc>,
}

/// Everything persisted for a run, keyed by `context.pipeline_run_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRunRecord {
    pub context: PipelineRunContext,
    pub state: PipelineState,
    /// Bumped on every applied transition; stores use it for optimistic
    /// concurrency.
    pub version: u64,
    pub history: Vec<TransitionRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRunRecord {
    /// A new run in `Created`, version 0, with empty history.
    pub fn new(context: PipelineRunContext) -> Self {
        let now = Utc::now();
        Self {
            context,
            state: PipelineState::Created,
            version: 0,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.context.pipeline_run_id
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn last_transition(&self) -> Option<&TransitionRecord> {
        self.history.last()
    }
}
