//! Stage State Machine
//!
//! Legal transitions for a single stage instance:
//!
//! ```text
//! pending ──start──▶ in_progress ──complete──▶ completed
//!    │                    │
//!    └──────skip──────────┴──────skip────────▶ skipped
//! ```
//!
//! Each transition mutates exactly one record and stamps its timestamps.
//! Cross-record rules (one active stage per journey) live in the engine,
//! which also invokes the calculator afterwards.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{StageInstance, StageStatus};
use crate::JourneyError;

/// The three commands a stage instance understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageAction {
    Start,
    Complete,
    Skip,
}

impl StageAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Skip => "skip",
        }
    }
}

impl std::fmt::Display for StageAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Start a pending stage: stamp `started_at` and derive `due_at` from the
/// stage's SLA length. Returns the prior status for the audit history.
pub fn start(stage: &mut StageInstance, now: DateTime<Utc>) -> Result<StageStatus, JourneyError> {
    if stage.status != StageStatus::Pending {
        return Err(JourneyError::InvalidTransition {
            from: stage.status,
            action: StageAction::Start,
        });
    }

    // Computed before any mutation so a bad SLA leaves the stage untouched
    let due_at = match stage.sla_days {
        Some(days) => Some(
            now.checked_add_signed(Duration::days(days as i64))
                .ok_or_else(|| {
                    JourneyError::Catalog(format!(
                        "sla_days {} overflows the due timestamp",
                        days
                    ))
                })?,
        ),
        None => None,
    };

    let from = stage.status;
    stage.status = StageStatus::InProgress;
    stage.started_at = Some(now);
    stage.due_at = due_at;
    Ok(from)
}

/// Complete an in-progress stage: stamp `completed_at`, keep notes if given.
pub fn complete(
    stage: &mut StageInstance,
    notes: Option<String>,
    now: DateTime<Utc>,
) -> Result<StageStatus, JourneyError> {
    if stage.status != StageStatus::InProgress {
        return Err(JourneyError::InvalidTransition {
            from: stage.status,
            action: StageAction::Complete,
        });
    }

    let from = stage.status;
    stage.status = StageStatus::Completed;
    stage.completed_at = Some(now);
    if notes.is_some() {
        stage.notes = notes;
    }
    Ok(from)
}

/// Skip a stage from `pending` or `in_progress`. `completed_at` doubles as
/// the terminal timestamp for skipped stages.
pub fn skip(
    stage: &mut StageInstance,
    notes: Option<String>,
    now: DateTime<Utc>,
) -> Result<StageStatus, JourneyError> {
    if stage.status.is_terminal() {
        return Err(JourneyError::InvalidTransition {
            from: stage.status,
            action: StageAction::Skip,
        });
    }

    let from = stage.status;
    stage.status = StageStatus::Skipped;
    stage.completed_at = Some(now);
    if notes.is_some() {
        stage.notes = notes;
    }
    Ok(from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StageTemplate;
    use uuid::Uuid;

    fn pending_stage(sla_days: Option<u32>) -> StageInstance {
        StageInstance::from_template(
            Uuid::new_v4(),
            &StageTemplate {
                order_index: 0,
                title: "Intake interview".to_string(),
                stage_type: "meeting".to_string(),
                sla_days,
            },
        )
    }

    #[test]
    fn test_start_stamps_timestamps() {
        let mut stage = pending_stage(Some(5));
        let now = Utc::now();

        let from = start(&mut stage, now).unwrap();

        assert_eq!(from, StageStatus::Pending);
        assert_eq!(stage.status, StageStatus::InProgress);
        assert_eq!(stage.started_at, Some(now));
        assert_eq!(stage.due_at, Some(now + Duration::days(5)));
        assert!(stage.completed_at.is_none());
    }

    #[test]
    fn test_start_without_sla_leaves_due_null() {
        let mut stage = pending_stage(None);
        start(&mut stage, Utc::now()).unwrap();
        assert!(stage.due_at.is_none());
    }

    #[test]
    fn test_start_with_oversized_sla_errors_without_mutation() {
        // Large enough that now + days overflows the representable range
        let mut stage = pending_stage(Some(4_000_000_000));
        let err = start(&mut stage, Utc::now()).unwrap_err();

        assert!(matches!(err, JourneyError::Catalog(_)));
        assert_eq!(stage.status, StageStatus::Pending);
        assert!(stage.started_at.is_none());
        assert!(stage.due_at.is_none());
    }

    #[test]
    fn test_start_rejects_non_pending() {
        let mut stage = pending_stage(None);
        start(&mut stage, Utc::now()).unwrap();

        let err = start(&mut stage, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            JourneyError::InvalidTransition {
                from: StageStatus::InProgress,
                action: StageAction::Start,
            }
        ));
    }

    #[test]
    fn test_complete_requires_in_progress() {
        let mut stage = pending_stage(None);
        let err = complete(&mut stage, None, Utc::now()).unwrap_err();
        assert!(matches!(err, JourneyError::InvalidTransition { .. }));
        assert_eq!(stage.status, StageStatus::Pending);
    }

    #[test]
    fn test_complete_stamps_and_keeps_notes() {
        let mut stage = pending_stage(Some(3));
        start(&mut stage, Utc::now()).unwrap();

        let now = Utc::now();
        complete(&mut stage, Some("signed off".to_string()), now).unwrap();

        assert_eq!(stage.status, StageStatus::Completed);
        assert_eq!(stage.completed_at, Some(now));
        assert_eq!(stage.notes.as_deref(), Some("signed off"));
    }

    #[test]
    fn test_complete_without_notes_preserves_existing() {
        let mut stage = pending_stage(None);
        stage.notes = Some("earlier note".to_string());
        start(&mut stage, Utc::now()).unwrap();
        complete(&mut stage, None, Utc::now()).unwrap();
        assert_eq!(stage.notes.as_deref(), Some("earlier note"));
    }

    #[test]
    fn test_skip_from_pending() {
        let mut stage = pending_stage(None);
        let now = Utc::now();

        let from = skip(&mut stage, Some("not applicable".to_string()), now).unwrap();

        assert_eq!(from, StageStatus::Pending);
        assert_eq!(stage.status, StageStatus::Skipped);
        assert_eq!(stage.completed_at, Some(now));
        // never passed through in_progress
        assert!(stage.started_at.is_none());
    }

    #[test]
    fn test_skip_from_in_progress() {
        let mut stage = pending_stage(Some(2));
        start(&mut stage, Utc::now()).unwrap();
        skip(&mut stage, None, Utc::now()).unwrap();

        assert_eq!(stage.status, StageStatus::Skipped);
        assert!(stage.started_at.is_some());
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        let mut completed = pending_stage(None);
        start(&mut completed, Utc::now()).unwrap();
        complete(&mut completed, None, Utc::now()).unwrap();

        assert!(start(&mut completed, Utc::now()).is_err());
        assert!(complete(&mut completed, None, Utc::now()).is_err());
        assert!(skip(&mut completed, None, Utc::now()).is_err());

        let mut skipped = pending_stage(None);
        skip(&mut skipped, None, Utc::now()).unwrap();

        assert!(start(&mut skipped, Utc::now()).is_err());
        assert!(complete(&mut skipped, None, Utc::now()).is_err());
        assert!(skip(&mut skipped, None, Utc::now()).is_err());
    }

    #[test]
    fn test_double_complete_leaves_state_unchanged() {
        let mut stage = pending_stage(None);
        start(&mut stage, Utc::now()).unwrap();
        complete(&mut stage, None, Utc::now()).unwrap();

        let before = stage.clone();
        let err = complete(&mut stage, Some("again".to_string()), Utc::now()).unwrap_err();

        assert!(matches!(err, JourneyError::InvalidTransition { .. }));
        assert_eq!(stage.status, before.status);
        assert_eq!(stage.completed_at, before.completed_at);
        assert_eq!(stage.notes, before.notes);
    }
}
