//! Journey progression engine for case-management journeys.
//!
//! Models a client's case as an ordered sequence of stages, tracks each
//! stage's lifecycle, and derives the aggregate progress and the single
//! "next action" a user should take. The engine is invoked in-process by
//! the surrounding application; it owns no wire protocol or CLI.
//!
//! Layering, leaves first:
//! - [`catalog`] — read-only journey templates (usually loaded from YAML)
//! - [`store`] — persistence boundary ([`store::MemoryStore`] built in,
//!   Postgres behind the `database` feature)
//! - [`machine`] — legal transitions for a single stage instance
//! - [`progress`] — pure progress/next-action derivation
//! - [`engine`] — orchestrator tying the above together with per-journey
//!   serialization and an atomic cache refresh on every mutation

pub mod catalog;
pub mod engine;
pub mod machine;
pub mod progress;
pub mod state;
pub mod store;

#[cfg(feature = "database")]
pub mod store_pg;

pub use catalog::{JourneyTemplate, StageTemplate, TemplateCatalog};
pub use engine::{JourneyEngine, JourneyView, StageView};
pub use machine::StageAction;
pub use progress::{ProgressSnapshot, SkippedProgressPolicy};
pub use state::{
    ActionPriority, JourneyInstance, JourneyStatus, NextAction, StageInstance, StageStatus,
    StageTransition,
};
pub use store::{JourneyStore, MemoryStore};

use uuid::Uuid;

/// Errors surfaced by the journey engine.
///
/// All variants are logic or data errors and are never retried
/// automatically; the one exception is `SaveConflict`, which the engine
/// retries a bounded number of times before giving up.
#[derive(Debug, thiserror::Error)]
pub enum JourneyError {
    #[error("Journey not found: {0}")]
    JourneyNotFound(Uuid),

    #[error("Stage instance not found: {0}")]
    StageNotFound(Uuid),

    #[error("Journey template not found: {0}")]
    TemplateNotFound(String),

    #[error("Journey template has no stages: {0}")]
    TemplateHasNoStages(String),

    #[error("Cannot {action} a stage in status '{from}'")]
    InvalidTransition {
        from: StageStatus,
        action: StageAction,
    },

    #[error("Another stage is already in progress: {active}")]
    ConflictingActiveStage { active: Uuid },

    #[error("Journey is {status} and accepts no further commands")]
    JourneyClosed { status: JourneyStatus },

    #[error("Persisted stage set is inconsistent: {0}")]
    InconsistentStageSet(String),

    #[error("Concurrent update detected for journey {0}")]
    SaveConflict(Uuid),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Catalog error: {0}")]
    Catalog(String),
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for JourneyError {
    fn from(e: sqlx::Error) -> Self {
        JourneyError::Storage(e.to_string())
    }
}
