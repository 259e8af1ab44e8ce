//! The orchestration driver: owns each run's lifecycle.
//!
//! A trigger goes through load, resolve, persist, dispatch. States that only
//! mark a finished deploy are left at once with a synthetic `GatePassed`, so
//! one external trigger may apply several transitions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use shipyard_types::{
    PipelineRunContext, PipelineRunRecord, PipelineState, Result, ShipyardError, TransitionRecord,
    Trigger,
};

use crate::apply::apply_trigger;
use crate::dispatch::{dispatch, Collaborators};
use crate::events::{EventEmitter, PipelineEvent};
use crate::store::RunStore;
use crate::table::TransitionTable;
use crate::validation::validate_or_raise;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Driver-wide settings.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Fix budget given to runs that do not ask for their own.
    pub max_fix_cycles: u32,
    pub event_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_fix_cycles: 3,
            event_capacity: 256,
        }
    }
}

/// What is known about a PR when its run is opened.
#[derive(Debug, Clone, Default)]
pub struct NewRun {
    pub pr_number: u64,
    pub branch: String,
    pub target_branch: String,
    pub commit_sha: String,
    /// Overrides [`DriverConfig::max_fix_cycles`] for this run.
    pub max_fix_cycles: Option<u32>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl NewRun {
    pub fn new(
        pr_number: u64,
        branch: impl Into<String>,
        target_branch: impl Into<String>,
        commit_sha: impl Into<String>,
    ) -> Self {
        Self {
            pr_number,
            branch: branch.into(),
            target_branch: target_branch.into(),
            commit_sha: commit_sha.into(),
            ..Self::default()
        }
    }

    pub fn with_max_fix_cycles(mut self, max: u32) -> Self {
        self.max_fix_cycles = Some(max);
        self
    }
}

/// The result of handling one external trigger.
#[derive(Debug, Clone)]
pub struct TriggerOutcome {
    pub run_id: String,
    /// The state the run rests in afterwards.
    pub state: PipelineState,
    /// Every transition applied, including synthetic auto-advances.
    pub applied: Vec<TransitionRecord>,
}

// ---------------------------------------------------------------------------
// PipelineDriver
// ---------------------------------------------------------------------------

pub struct PipelineDriver {
    table: TransitionTable,
    store: Arc<dyn RunStore>,
    collaborators: Arc<dyn Collaborators>,
    emitter: EventEmitter,
    config: DriverConfig,
    run_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    open_lock: Mutex<()>,
}

impl PipelineDriver {
    /// Create a driver for `table`. Fails if the table does not validate.
    pub fn new(
        table: TransitionTable,
        store: Arc<dyn RunStore>,
        collaborators: Arc<dyn Collaborators>,
        config: DriverConfig,
    ) -> Result<Self> {
        validate_or_raise(&table)?;
        Ok(Self {
            table,
            store,
            collaborators,
            emitter: EventEmitter::new(config.event_capacity),
            config,
            run_locks: Mutex::new(HashMap::new()),
            open_lock: Mutex::new(()),
        })
    }

    /// Create a driver for the standard release table.
    pub fn standard(
        store: Arc<dyn RunStore>,
        collaborators: Arc<dyn Collaborators>,
        config: DriverConfig,
    ) -> Result<Self> {
        Self::new(TransitionTable::standard(), store, collaborators, config)
    }

    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.emitter.subscribe()
    }

    /// Start a run for a newly opened PR and apply `PrOpened` to it.
    ///
    /// Returns [`ShipyardError::RunAlreadyActive`] while the PR still has a
    /// run that has not reached `Done` or `Failed`.
    pub async fn open_run(&self, new_run: NewRun) -> Result<TriggerOutcome> {
        let run_id = {
            let _guard = self.open_lock.lock().await;

            let active = self
                .store
                .list()
                .await?
                .into_iter()
                .find(|r| r.context.pr_number == new_run.pr_number && !r.is_terminal());
            if let Some(active) = active {
                return Err(ShipyardError::RunAlreadyActive {
                    pr_number: new_run.pr_number,
                    run_id: active.run_id().to_string(),
                });
            }

            let mut context = PipelineRunContext::new(
                new_run.pr_number,
                new_run.branch,
                new_run.target_branch,
                new_run.commit_sha,
                new_run.max_fix_cycles.unwrap_or(self.config.max_fix_cycles),
            );
            context.metadata = new_run.metadata;
            let record = PipelineRunRecord::new(context);
            self.store.insert(&record).await?;
            record.run_id().to_string()
        };

        tracing::info!(run_id = %run_id, pr = new_run.pr_number, "Pipeline run opened");
        self.emitter.emit(PipelineEvent::RunOpened {
            run_id: run_id.clone(),
            pr_number: new_run.pr_number,
        });

        self.handle_trigger(&run_id, Trigger::PrOpened).await
    }

    /// Apply an external trigger to a run.
    ///
    /// Triggers for the same run are applied one at a time. An illegal
    /// trigger leaves the record untouched and returns
    /// [`ShipyardError::IllegalTrigger`]. If a side effect cannot be
    /// dispatched, the transition stays persisted and
    /// [`ShipyardError::SideEffectFailed`] is returned.
    pub async fn handle_trigger(&self, run_id: &str, trigger: Trigger) -> Result<TriggerOutcome> {
        // Unknown ids never get a lock entry
        self.load(run_id).await?;

        let lock = self.run_lock(run_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.apply_locked(run_id, trigger).await
        };

        let finished = match &result {
            Ok(outcome) => outcome.state.is_terminal(),
            Err(ShipyardError::IllegalTrigger { state, .. }) => state.is_terminal(),
            Err(ShipyardError::SideEffectFailed { .. }) => self
                .store
                .load(run_id)
                .await
                .ok()
                .flatten()
                .is_some_and(|r| r.is_terminal()),
            Err(_) => false,
        };
        if finished {
            self.run_locks.lock().await.remove(run_id);
        }
        result
    }

    async fn apply_locked(&self, run_id: &str, trigger: Trigger) -> Result<TriggerOutcome> {
        let mut record = self.load(run_id).await?;
        let mut applied = Vec::new();
        let mut next = trigger;
        let mut synthetic = false;

        loop {
            let step = match apply_trigger(&self.table, &record.context, record.state, next) {
                Ok(step) => step,
                Err(err) => {
                    if err.is_rejection() {
                        tracing::warn!(
                            run_id = %run_id,
                            state = %record.state,
                            trigger = %next,
                            "Trigger rejected"
                        );
                        self.emitter.emit(PipelineEvent::TriggerRejected {
                            run_id: run_id.to_string(),
                            state: record.state,
                            trigger: next,
                        });
                    }
                    return Err(err);
                }
            };

            let def = step.def;
            let expected = record.version;
            let now = Utc::now();
            let transition = TransitionRecord {
                from: def.from,
                trigger: def.trigger,
                to: def.to,
                side_effect: def.side_effect,
                synthetic,
                fix_cycle_count: step.context.fix_cycle_count,
                at: now,
            };
            record.state = def.to;
            record.context = step.context;
            record.version += 1;
            record.updated_at = now;
            record.history.push(transition.clone());
            self.store.save(&record, expected).await?;

            tracing::info!(
                run_id = %run_id,
                from = %def.from,
                trigger = %def.trigger,
                to = %def.to,
                synthetic,
                fix_cycle = record.context.fix_cycle_count,
                "Transition applied"
            );
            self.emitter.emit(PipelineEvent::TransitionApplied {
                run_id: run_id.to_string(),
                from: def.from,
                trigger: def.trigger,
                to: def.to,
                side_effect: def.side_effect,
                synthetic,
            });
            applied.push(transition);

            if let Some(effect) = def.side_effect {
                if let Err(err) =
                    dispatch(effect, &def, &record.context, self.collaborators.as_ref()).await
                {
                    tracing::warn!(run_id = %run_id, %effect, error = %err, "Side effect failed");
                    self.emitter.emit(PipelineEvent::SideEffectFailed {
                        run_id: run_id.to_string(),
                        effect,
                        error: err.to_string(),
                    });
                    return Err(ShipyardError::SideEffectFailed {
                        run_id: run_id.to_string(),
                        effect: effect.name().to_string(),
                        message: err.to_string(),
                    });
                }
                self.emitter.emit(PipelineEvent::SideEffectDispatched {
                    run_id: run_id.to_string(),
                    effect,
                });
            }

            if record.state.auto_advances() {
                next = Trigger::GatePassed;
                synthetic = true;
                continue;
            }
            break;
        }

        match record.state {
            PipelineState::Done => {
                tracing::info!(run_id = %run_id, transitions = record.history.len(), "Pipeline run completed");
                self.emitter.emit(PipelineEvent::RunCompleted {
                    run_id: run_id.to_string(),
                    transitions: record.history.len(),
                });
            }
            PipelineState::Failed => {
                tracing::warn!(run_id = %run_id, trigger = %next, "Pipeline run failed");
                self.emitter.emit(PipelineEvent::RunFailed {
                    run_id: run_id.to_string(),
                    last_trigger: next,
                });
            }
            _ => {}
        }

        Ok(TriggerOutcome {
            run_id: run_id.to_string(),
            state: record.state,
            applied,
        })
    }

    /// The stored record for a run.
    pub async fn run(&self, run_id: &str) -> Result<PipelineRunRecord> {
        self.load(run_id).await
    }

    pub async fn list_runs(&self) -> Result<Vec<PipelineRunRecord>> {
        self.store.list().await
    }

    /// Non-terminal runs whose last transition is older than `idle_for`.
    pub async fn stale_runs(&self, idle_for: chrono::Duration) -> Result<Vec<PipelineRunRecord>> {
        let Some(cutoff) = Utc::now().checked_sub_signed(idle_for) else {
            return Ok(Vec::new());
        };
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|r| !r.is_terminal() && r.updated_at < cutoff)
            .collect())
    }

    async fn load(&self, run_id: &str) -> Result<PipelineRunRecord> {
        self.store
            .load(run_id)
            .await?
            .ok_or_else(|| ShipyardError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    async fn run_lock(&self, run_id: &str) -> Arc<Mutex<()>> {
        self.run_locks
            .lock()
            .await
            .entry(run_id.to_string())
            .or_default()
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{CollaboratorCall, RecordingCollaborators};
    use crate::store::MemoryRunStore;
    use crate::table::TransitionDef;
    use shipyard_types::{Environment, GateName, SideEffect};

    fn driver() -> (PipelineDriver, Arc<MemoryRunStore>, Arc<RecordingCollaborators>) {
        let store = Arc::new(MemoryRunStore::new());
        let recorder = Arc::new(RecordingCollaborators::new());
        let driver =
            PipelineDriver::standard(store.clone(), recorder.clone(), DriverConfig::default())
                .unwrap();
        (driver, store, recorder)
    }

    fn pr(number: u64) -> NewRun {
        NewRun::new(number, "feature/login", "main", "abc123")
    }

    #[tokio::test]
    async fn open_run_applies_pr_opened() {
        let (driver, _, recorder) = driver();
        let outcome = driver.open_run(pr(1)).await.unwrap();

        assert_eq!(outcome.state, PipelineState::UnitPactGate);
        assert_eq!(outcome.applied.len(), 1);
        assert_eq!(outcome.applied[0].trigger, Trigger::PrOpened);
        assert_eq!(
            recorder.calls(),
            vec![CollaboratorCall::RunGate(GateName::UnitPact)]
        );

        let record = driver.run(&outcome.run_id).await.unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.context.max_fix_cycles, 3);
    }

    #[tokio::test]
    async fn open_run_honors_per_run_fix_budget_and_metadata() {
        let (driver, _, _) = driver();
        let mut new_run = pr(2).with_max_fix_cycles(1);
        new_run
            .metadata
            .insert("ticket".into(), serde_json::json!("REL-9"));
        let outcome = driver.open_run(new_run).await.unwrap();

        let record = driver.run(&outcome.run_id).await.unwrap();
        assert_eq!(record.context.max_fix_cycles, 1);
        assert_eq!(record.context.metadata["ticket"], "REL-9");
    }

    #[tokio::test]
    async fn second_open_for_active_pr_is_refused() {
        let (driver, _, _) = driver();
        let first = driver.open_run(pr(3)).await.unwrap();

        match driver.open_run(pr(3)).await.unwrap_err() {
            ShipyardError::RunAlreadyActive { pr_number, run_id } => {
                assert_eq!(pr_number, 3);
                assert_eq!(run_id, first.run_id);
            }
            other => panic!("Expected RunAlreadyActive, got: {other:?}"),
        }

        // A different PR is unaffected
        driver.open_run(pr(4)).await.unwrap();
    }

    #[tokio::test]
    async fn pr_can_reopen_after_terminal_run() {
        let (driver, _, _) = driver();
        let first = driver.open_run(pr(5)).await.unwrap();
        driver
            .handle_trigger(&first.run_id, Trigger::GatePassed)
            .await
            .unwrap();
        driver
            .handle_trigger(&first.run_id, Trigger::DeployFailed)
            .await
            .unwrap();

        let second = driver.open_run(pr(5)).await.unwrap();
        assert_ne!(second.run_id, first.run_id);
    }

    #[tokio::test]
    async fn deploy_completed_auto_advances_into_next_gate() {
        let (driver, _, recorder) = driver();
        let run = driver.open_run(pr(6)).await.unwrap();
        driver
            .handle_trigger(&run.run_id, Trigger::GatePassed)
            .await
            .unwrap();
        recorder.take_calls();

        let outcome = driver
            .handle_trigger(&run.run_id, Trigger::DeployCompleted)
            .await
            .unwrap();

        assert_eq!(outcome.state, PipelineState::IntegrationGate);
        assert_eq!(outcome.applied.len(), 2);
        assert!(!outcome.applied[0].synthetic);
        assert_eq!(outcome.applied[1].from, PipelineState::DevDeployed);
        assert_eq!(outcome.applied[1].trigger, Trigger::GatePassed);
        assert!(outcome.applied[1].synthetic);
        assert_eq!(
            recorder.calls(),
            vec![CollaboratorCall::RunGate(GateName::Integration)]
        );
    }

    #[tokio::test]
    async fn illegal_trigger_leaves_record_untouched() {
        let (driver, _, _) = driver();
        let mut events = driver.subscribe();
        let run = driver.open_run(pr(7)).await.unwrap();
        let before = driver.run(&run.run_id).await.unwrap();

        let err = driver
            .handle_trigger(&run.run_id, Trigger::HumanApproved)
            .await
            .unwrap_err();
        assert!(err.is_rejection());

        let after = driver.run(&run.run_id).await.unwrap();
        assert_eq!(after.version, before.version);
        assert_eq!(after.state, PipelineState::UnitPactGate);
        assert_eq!(after.history.len(), before.history.len());

        let mut rejected = false;
        while let Ok(event) = events.try_recv() {
            if let PipelineEvent::TriggerRejected { state, trigger, .. } = event {
                assert_eq!(state, PipelineState::UnitPactGate);
                assert_eq!(trigger, Trigger::HumanApproved);
                rejected = true;
            }
        }
        assert!(rejected);
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let (driver, _, _) = driver();
        let err = driver
            .handle_trigger("nope", Trigger::GatePassed)
            .await
            .unwrap_err();
        assert!(matches!(err, ShipyardError::RunNotFound { .. }));
        assert!(matches!(
            driver.run("nope").await.unwrap_err(),
            ShipyardError::RunNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn failed_side_effect_keeps_the_new_state() {
        let (driver, _, recorder) = driver();
        let run = driver.open_run(pr(8)).await.unwrap();
        recorder.fail_on("deploy");

        match driver
            .handle_trigger(&run.run_id, Trigger::GatePassed)
            .await
            .unwrap_err()
        {
            ShipyardError::SideEffectFailed { effect, .. } => {
                assert_eq!(effect, "dispatchDevDeploy");
            }
            other => panic!("Expected SideEffectFailed, got: {other:?}"),
        }

        let record = driver.run(&run.run_id).await.unwrap();
        assert_eq!(record.state, PipelineState::DevDeploying);
        assert_eq!(
            record.last_transition().unwrap().side_effect,
            Some(SideEffect::DispatchDevDeploy)
        );

        // The run can still make progress once the collaborator recovers
        recorder.clear_failure();
        let outcome = driver
            .handle_trigger(&run.run_id, Trigger::DeployCompleted)
            .await
            .unwrap();
        assert_eq!(outcome.state, PipelineState::IntegrationGate);
    }

    #[tokio::test]
    async fn terminal_run_emits_failure_event() {
        let (driver, _, _) = driver();
        let run = driver.open_run(pr(9)).await.unwrap();
        driver
            .handle_trigger(&run.run_id, Trigger::GatePassed)
            .await
            .unwrap();

        let mut events = driver.subscribe();
        let outcome = driver
            .handle_trigger(&run.run_id, Trigger::DeployFailed)
            .await
            .unwrap();
        assert_eq!(outcome.state, PipelineState::Failed);

        let mut failed = false;
        while let Ok(event) = events.try_recv() {
            if let PipelineEvent::RunFailed { last_trigger, .. } = event {
                assert_eq!(last_trigger, Trigger::DeployFailed);
                failed = true;
            }
        }
        assert!(failed);
    }

    #[tokio::test]
    async fn stale_runs_skip_terminal_and_recent_runs() {
        let (driver, store, _) = driver();
        let idle = driver.open_run(pr(10)).await.unwrap();
        let busy = driver.open_run(pr(11)).await.unwrap();

        let mut record = store.load(&idle.run_id).await.unwrap().unwrap();
        let version = record.version;
        record.updated_at = Utc::now() - chrono::Duration::hours(2);
        store.save(&record, version).await.unwrap();

        let stale = driver.stale_runs(chrono::Duration::minutes(30)).await.unwrap();
        let ids: Vec<_> = stale.iter().map(|r| r.run_id().to_string()).collect();
        assert_eq!(ids, vec![idle.run_id.clone()]);
        assert!(!ids.contains(&busy.run_id));
        assert_eq!(driver.list_runs().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stale_runs_with_huge_idle_window_is_empty() {
        let (driver, _, _) = driver();
        driver.open_run(pr(13)).await.unwrap();
        assert!(driver
            .stale_runs(chrono::Duration::MAX)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn unknown_run_ids_leave_no_lock_entries() {
        let (driver, _, _) = driver();
        for i in 0..100 {
            let err = driver
                .handle_trigger(&format!("bogus-{i}"), Trigger::GatePassed)
                .await
                .unwrap_err();
            assert!(matches!(err, ShipyardError::RunNotFound { .. }));
        }
        assert!(driver.run_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn finished_runs_release_their_lock_entry() {
        let (driver, _, recorder) = driver();
        let active = driver.open_run(pr(14)).await.unwrap();
        let failed = driver.open_run(pr(15)).await.unwrap();
        driver
            .handle_trigger(&failed.run_id, Trigger::GatePassed)
            .await
            .unwrap();
        driver
            .handle_trigger(&failed.run_id, Trigger::DeployFailed)
            .await
            .unwrap();

        // Late duplicate webhooks for a finished run
        for _ in 0..10 {
            driver
                .handle_trigger(&failed.run_id, Trigger::DeployFailed)
                .await
                .unwrap_err();
        }

        // A run that fails while recording its defect
        let defect = driver.open_run(pr(16).with_max_fix_cycles(0)).await.unwrap();
        recorder.fail_on("create_defect");
        driver
            .handle_trigger(&defect.run_id, Trigger::GateCriticalFail)
            .await
            .unwrap_err();
        assert_eq!(
            driver.run(&defect.run_id).await.unwrap().state,
            PipelineState::Failed
        );

        let locks = driver.run_locks.lock().await;
        assert_eq!(locks.len(), 1);
        assert!(locks.contains_key(&active.run_id));
    }

    #[test]
    fn driver_refuses_an_invalid_table() {
        let table = TransitionTable::from_defs(vec![TransitionDef::new(
            PipelineState::Created,
            Trigger::PrOpened,
            PipelineState::UnitPactGate,
        )]);
        let result = PipelineDriver::new(
            table,
            Arc::new(MemoryRunStore::new()),
            Arc::new(RecordingCollaborators::new()),
            DriverConfig::default(),
        );
        assert!(matches!(result, Err(ShipyardError::ValidationError(_))));
    }

    #[tokio::test]
    async fn prod_deploy_is_dispatched_on_approval() {
        let (driver, _, recorder) = driver();
        let run = driver.open_run(pr(12)).await.unwrap();
        for trigger in [
            Trigger::GatePassed,
            Trigger::DeployCompleted,
            Trigger::GatePassed,
            Trigger::GatePassed,
            Trigger::MergeCompleted,
            Trigger::DeployCompleted,
            Trigger::GatePassed,
        ] {
            driver.handle_trigger(&run.run_id, trigger).await.unwrap();
        }
        recorder.take_calls();

        let outcome = driver
            .handle_trigger(&run.run_id, Trigger::HumanApproved)
            .await
            .unwrap();
        assert_eq!(outcome.state, PipelineState::ProdDeploying);
        assert_eq!(
            recorder.calls(),
            vec![CollaboratorCall::Deploy(Environment::Prod)]
        );
    }
}
