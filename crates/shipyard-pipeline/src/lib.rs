//! Release pipeline state machine: transition table, guarded resolution,
//! table validation, side-effect dispatch, run persistence, and the
//! orchestration driver.
//!
//! The table and resolver are pure. Everything with I/O sits behind the
//! [`RunStore`] and [`Collaborators`] traits and is sequenced by
//! [`PipelineDriver`].

pub mod apply;
pub mod dispatch;
pub mod driver;
pub mod events;
pub mod guard;
pub mod resolver;
pub mod store;
pub mod table;
pub mod validation;

pub use apply::{apply_trigger, AppliedTransition};
pub use dispatch::{
    defect_for, dispatch, CollaboratorCall, Collaborators, LoggingCollaborators,
    RecordingCollaborators,
};
pub use driver::{DriverConfig, NewRun, PipelineDriver, TriggerOutcome};
pub use events::{EventEmitter, PipelineEvent};
pub use guard::Guard;
pub use resolver::find;
pub use store::{FileRunStore, MemoryRunStore, RunStore};
pub use table::{TransitionDef, TransitionTable};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
