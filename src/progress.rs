//! Progress & Next-Action Calculator
//!
//! Pure derivation over a journey's full stage set. The engine calls this
//! after every mutation and persists the result in the same atomic unit, so
//! the cached fields on `JourneyInstance` never diverge from what this
//! module would produce.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{ActionPriority, NextAction, StageInstance, StageStatus};
use crate::JourneyError;

/// How skipped stages count toward the completion percentage.
///
/// The product behavior is ambiguous here, so it is a policy flag rather
/// than a fixed semantics. Skipped stages never block advancement under
/// either policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkippedProgressPolicy {
    /// Skipped counts as done: `pct = (completed + skipped) / total`
    #[default]
    CountsAsCompleted,
    /// Skipped leaves the calculation entirely: `pct = completed / (total - skipped)`.
    /// An all-skipped journey is 100%.
    ExcludedFromTotal,
}

/// Result of one derivation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Completion percentage, 0–100, rounded to nearest integer
    pub progress_pct: u8,
    /// Recommended next action; `None` once every stage is terminal
    pub next_action: Option<NextAction>,
    /// True when all stages are completed or skipped
    pub all_stages_terminal: bool,
}

/// Priority window: overdue or due within 24h is high, within 72h medium
fn due_priority(due_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> ActionPriority {
    match due_at {
        Some(due) if due <= now + Duration::hours(24) => ActionPriority::High,
        Some(due) if due <= now + Duration::hours(72) => ActionPriority::Medium,
        _ => ActionPriority::Low,
    }
}

/// Derive progress and the next action for a journey's stage set.
///
/// Fails closed with `InconsistentStageSet` instead of guessing when the
/// persisted set is malformed: empty, duplicate or gapped order indices, or
/// more than one stage in progress.
pub fn compute(
    stages: &[StageInstance],
    policy: SkippedProgressPolicy,
    now: DateTime<Utc>,
) -> Result<ProgressSnapshot, JourneyError> {
    if stages.is_empty() {
        return Err(JourneyError::InconsistentStageSet(
            "journey has no stage instances".to_string(),
        ));
    }

    let mut ordered: Vec<&StageInstance> = stages.iter().collect();
    ordered.sort_by_key(|s| s.order_index);

    for (expected, stage) in ordered.iter().enumerate() {
        if stage.order_index != expected as u32 {
            return Err(JourneyError::InconsistentStageSet(format!(
                "order indices are not dense: expected {}, found {}",
                expected, stage.order_index
            )));
        }
    }

    let active: Vec<&&StageInstance> = ordered
        .iter()
        .filter(|s| s.status == StageStatus::InProgress)
        .collect();
    if active.len() > 1 {
        return Err(JourneyError::InconsistentStageSet(format!(
            "{} stages are in progress simultaneously",
            active.len()
        )));
    }

    let completed = ordered
        .iter()
        .filter(|s| s.status == StageStatus::Completed)
        .count();
    let skipped = ordered
        .iter()
        .filter(|s| s.status == StageStatus::Skipped)
        .count();

    let (done, total) = match policy {
        SkippedProgressPolicy::CountsAsCompleted => (completed + skipped, ordered.len()),
        SkippedProgressPolicy::ExcludedFromTotal => (completed, ordered.len() - skipped),
    };
    let progress_pct = if total == 0 {
        100
    } else {
        (100.0 * done as f64 / total as f64).round() as u8
    };

    // First match wins: active stage, then lowest-order pending stage,
    // then nothing left to do.
    let next_action = if let Some(stage) = active.first() {
        Some(NextAction::CompleteStage {
            stage_instance_id: stage.stage_instance_id,
            title: format!("Complete: {}", stage.title),
            description: None,
            due_at: stage.due_at,
            priority: due_priority(stage.due_at, now),
        })
    } else {
        ordered
            .iter()
            .find(|s| s.status == StageStatus::Pending)
            .map(|stage| NextAction::StartStage {
                stage_instance_id: stage.stage_instance_id,
                title: format!("Start: {}", stage.title),
                description: None,
                priority: ActionPriority::Medium,
            })
    };

    let all_stages_terminal = ordered.iter().all(|s| s.status.is_terminal());

    Ok(ProgressSnapshot {
        progress_pct,
        next_action,
        all_stages_terminal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StageTemplate;
    use crate::machine;
    use uuid::Uuid;

    fn stage_set(count: u32) -> Vec<StageInstance> {
        let journey_id = Uuid::new_v4();
        (0..count)
            .map(|i| {
                StageInstance::from_template(
                    journey_id,
                    &StageTemplate {
                        order_index: i,
                        title: format!("Stage {}", i),
                        stage_type: "task".to_string(),
                        sla_days: Some(5),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_fresh_journey_targets_first_stage() {
        let stages = stage_set(3);
        let snapshot = compute(&stages, SkippedProgressPolicy::default(), Utc::now()).unwrap();

        assert_eq!(snapshot.progress_pct, 0);
        assert!(!snapshot.all_stages_terminal);
        match snapshot.next_action.unwrap() {
            NextAction::StartStage {
                stage_instance_id,
                priority,
                ..
            } => {
                assert_eq!(stage_instance_id, stages[0].stage_instance_id);
                assert_eq!(priority, ActionPriority::Medium);
            }
            other => panic!("expected StartStage, got {:?}", other),
        }
    }

    #[test]
    fn test_active_stage_wins_over_pending() {
        let mut stages = stage_set(3);
        let now = Utc::now();
        machine::start(&mut stages[0], now).unwrap();
        machine::complete(&mut stages[0], None, now).unwrap();
        machine::start(&mut stages[1], now).unwrap();

        let snapshot = compute(&stages, SkippedProgressPolicy::default(), now).unwrap();
        assert_eq!(snapshot.progress_pct, 33);
        match snapshot.next_action.unwrap() {
            NextAction::CompleteStage {
                stage_instance_id,
                due_at,
                ..
            } => {
                assert_eq!(stage_instance_id, stages[1].stage_instance_id);
                assert_eq!(due_at, stages[1].due_at);
            }
            other => panic!("expected CompleteStage, got {:?}", other),
        }
    }

    #[test]
    fn test_all_terminal_yields_no_action() {
        let mut stages = stage_set(2);
        let now = Utc::now();
        machine::start(&mut stages[0], now).unwrap();
        machine::complete(&mut stages[0], None, now).unwrap();
        machine::skip(&mut stages[1], None, now).unwrap();

        let snapshot = compute(&stages, SkippedProgressPolicy::default(), now).unwrap();
        assert_eq!(snapshot.progress_pct, 100);
        assert!(snapshot.next_action.is_none());
        assert!(snapshot.all_stages_terminal);
    }

    #[test]
    fn test_skip_only_journey_reaches_100() {
        let mut stages = stage_set(3);
        let now = Utc::now();
        for stage in stages.iter_mut() {
            machine::skip(stage, None, now).unwrap();
        }

        let snapshot = compute(&stages, SkippedProgressPolicy::default(), now).unwrap();
        assert_eq!(snapshot.progress_pct, 100);
        assert!(snapshot.next_action.is_none());

        // Under the exclusion policy an all-skipped journey is still done
        let snapshot = compute(&stages, SkippedProgressPolicy::ExcludedFromTotal, now).unwrap();
        assert_eq!(snapshot.progress_pct, 100);
    }

    #[test]
    fn test_excluded_policy_denominator() {
        let mut stages = stage_set(4);
        let now = Utc::now();
        machine::start(&mut stages[0], now).unwrap();
        machine::complete(&mut stages[0], None, now).unwrap();
        machine::skip(&mut stages[1], None, now).unwrap();

        // counts-as-completed: 2/4 = 50
        let counting = compute(&stages, SkippedProgressPolicy::CountsAsCompleted, now).unwrap();
        assert_eq!(counting.progress_pct, 50);

        // excluded: 1/(4-1) = 33
        let excluded = compute(&stages, SkippedProgressPolicy::ExcludedFromTotal, now).unwrap();
        assert_eq!(excluded.progress_pct, 33);
    }

    #[test]
    fn test_rounding_to_nearest() {
        let mut stages = stage_set(3);
        let now = Utc::now();
        machine::start(&mut stages[0], now).unwrap();
        machine::complete(&mut stages[0], None, now).unwrap();
        machine::start(&mut stages[1], now).unwrap();
        machine::complete(&mut stages[1], None, now).unwrap();

        // 2/3 rounds to 67, not 66
        let snapshot = compute(&stages, SkippedProgressPolicy::default(), now).unwrap();
        assert_eq!(snapshot.progress_pct, 67);
    }

    #[test]
    fn test_priority_windows() {
        let now = Utc::now();

        assert_eq!(due_priority(None, now), ActionPriority::Low);
        assert_eq!(
            due_priority(Some(now - Duration::hours(1)), now),
            ActionPriority::High
        );
        assert_eq!(
            due_priority(Some(now + Duration::hours(12)), now),
            ActionPriority::High
        );
        assert_eq!(
            due_priority(Some(now + Duration::hours(48)), now),
            ActionPriority::Medium
        );
        assert_eq!(
            due_priority(Some(now + Duration::days(5)), now),
            ActionPriority::Low
        );
    }

    #[test]
    fn test_overdue_active_stage_is_high_priority() {
        let mut stages = stage_set(1);
        let started = Utc::now() - Duration::days(10);
        machine::start(&mut stages[0], started).unwrap();

        let snapshot = compute(&stages, SkippedProgressPolicy::default(), Utc::now()).unwrap();
        assert_eq!(
            snapshot.next_action.unwrap().priority(),
            ActionPriority::High
        );
    }

    #[test]
    fn test_empty_set_fails_closed() {
        let err = compute(&[], SkippedProgressPolicy::default(), Utc::now()).unwrap_err();
        assert!(matches!(err, JourneyError::InconsistentStageSet(_)));
    }

    #[test]
    fn test_duplicate_order_index_fails_closed() {
        let mut stages = stage_set(3);
        stages[2].order_index = 1;

        let err = compute(&stages, SkippedProgressPolicy::default(), Utc::now()).unwrap_err();
        assert!(matches!(err, JourneyError::InconsistentStageSet(_)));
    }

    #[test]
    fn test_gapped_order_index_fails_closed() {
        let mut stages = stage_set(3);
        stages[2].order_index = 5;

        let err = compute(&stages, SkippedProgressPolicy::default(), Utc::now()).unwrap_err();
        assert!(matches!(err, JourneyError::InconsistentStageSet(_)));
    }

    #[test]
    fn test_two_active_stages_fail_closed() {
        let mut stages = stage_set(2);
        let now = Utc::now();
        machine::start(&mut stages[0], now).unwrap();
        // Corrupt the second stage directly — the machine would never allow this
        stages[1].status = StageStatus::InProgress;

        let err = compute(&stages, SkippedProgressPolicy::default(), now).unwrap_err();
        assert!(matches!(err, JourneyError::InconsistentStageSet(_)));
    }

    #[test]
    fn test_unordered_input_is_sorted() {
        let mut stages = stage_set(3);
        stages.reverse();

        let snapshot = compute(&stages, SkippedProgressPolicy::default(), Utc::now()).unwrap();
        // Lowest order index still targeted despite input order
        let target = snapshot.next_action.unwrap().stage_instance_id();
        let first = stages.iter().find(|s| s.order_index == 0).unwrap();
        assert_eq!(target, first.stage_instance_id);
    }
}
