//! Pipeline event system for observability.
//!
//! Emits [`PipelineEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (notifiers, dashboards, audit sinks) can follow runs
//! without coupling to the driver internals.

use serde::{Deserialize, Serialize};

use shipyard_types::{PipelineState, SideEffect, Trigger};

/// Events emitted while driving pipeline runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    RunOpened {
        run_id: String,
        pr_number: u64,
    },
    TransitionApplied {
        run_id: String,
        from: PipelineState,
        trigger: Trigger,
        to: PipelineState,
        side_effect: Option<SideEffect>,
        synthetic: bool,
    },
    TriggerRejected {
        run_id: String,
        state: PipelineState,
        trigger: Trigger,
    },
    SideEffectDispatched {
        run_id: String,
        effect: SideEffect,
    },
    SideEffectFailed {
        run_id: String,
        effect: SideEffect,
        error: String,
    },
    RunCompleted {
        run_id: String,
        transitions: usize,
    },
    RunFailed {
        run_id: String,
        last_trigger: Trigger,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_sends_and_receives() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(PipelineEvent::RunOpened {
            run_id: "r1".into(),
            pr_number: 77,
        });

        match rx.recv().await.unwrap() {
            PipelineEvent::RunOpened { run_id, pr_number } => {
                assert_eq!(run_id, "r1");
                assert_eq!(pr_number, 77);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let emitter = EventEmitter::new(16);
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        emitter.emit(PipelineEvent::TriggerRejected {
            run_id: "r2".into(),
            state: PipelineState::ReadyForProd,
            trigger: Trigger::GatePassed,
        });

        let json1 = serde_json::to_string(&rx1.recv().await.unwrap()).unwrap();
        let json2 = serde_json::to_string(&rx2.recv().await.unwrap()).unwrap();
        assert_eq!(json1, json2);
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new(16);
        emitter.emit(PipelineEvent::RunFailed {
            run_id: "r3".into(),
            last_trigger: Trigger::DeployFailed,
        });
    }

    #[test]
    fn transition_event_serializes_catalog_names() {
        let event = PipelineEvent::TransitionApplied {
            run_id: "r4".into(),
            from: PipelineState::RegressionGate,
            trigger: Trigger::GatePassed,
            to: PipelineState::ReadyForProd,
            side_effect: Some(SideEffect::CreateReleasePr),
            synthetic: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        let body = &json["TransitionApplied"];
        assert_eq!(body["from"], "regression_gate");
        assert_eq!(body["side_effect"], "createReleasePR");
    }
}
