//! Journey Persistence
//!
//! `JourneyStore` is the persistence boundary for journey and stage records.
//! The engine operates exclusively through this trait, enabling pluggable
//! backends (`MemoryStore` for tests and single-process deployments,
//! Postgres behind the `database` feature for production).
//!
//! Every save is atomic across the journey row and its mutated stages, and
//! enforces the journey's optimistic version token: a stale save fails with
//! `SaveConflict` and is never partially applied.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::state::{JourneyInstance, StageInstance};
use crate::JourneyError;

/// Persistence boundary for journeys and their stage instances
#[async_trait]
pub trait JourneyStore: Send + Sync {
    /// Persist a brand-new journey with its full pending stage set
    async fn insert_journey_and_stages(
        &self,
        journey: &JourneyInstance,
        stages: &[StageInstance],
    ) -> Result<(), JourneyError>;

    /// Load a journey by ID
    async fn load_journey(&self, journey_id: Uuid) -> Result<JourneyInstance, JourneyError>;

    /// Most recently started non-terminal journey for a case, if any
    async fn find_active_by_case(
        &self,
        case_id: Uuid,
    ) -> Result<Option<JourneyInstance>, JourneyError>;

    /// All stage instances for a journey, ordered by order index
    async fn load_stage_instances(
        &self,
        journey_id: Uuid,
    ) -> Result<Vec<StageInstance>, JourneyError>;

    /// Atomically persist the journey row plus the given (mutated) stages.
    ///
    /// The journey's `version` must match the stored one; on success the
    /// stored version is bumped. A mismatch fails with `SaveConflict` and
    /// writes nothing.
    async fn save_journey_and_stages(
        &self,
        journey: &JourneyInstance,
        stages: &[StageInstance],
    ) -> Result<(), JourneyError>;
}

#[derive(Default)]
struct MemoryInner {
    journeys: HashMap<Uuid, JourneyInstance>,
    /// journey_id → stage instances, kept sorted by order index
    stages: HashMap<Uuid, Vec<StageInstance>>,
}

/// In-memory store — a single lock makes every save trivially atomic
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JourneyStore for MemoryStore {
    async fn insert_journey_and_stages(
        &self,
        journey: &JourneyInstance,
        stages: &[StageInstance],
    ) -> Result<(), JourneyError> {
        let mut inner = self.inner.write().await;
        if inner.journeys.contains_key(&journey.journey_id) {
            return Err(JourneyError::Storage(format!(
                "journey {} already exists",
                journey.journey_id
            )));
        }

        let mut sorted = stages.to_vec();
        sorted.sort_by_key(|s| s.order_index);
        inner.journeys.insert(journey.journey_id, journey.clone());
        inner.stages.insert(journey.journey_id, sorted);
        Ok(())
    }

    async fn load_journey(&self, journey_id: Uuid) -> Result<JourneyInstance, JourneyError> {
        let inner = self.inner.read().await;
        inner
            .journeys
            .get(&journey_id)
            .cloned()
            .ok_or(JourneyError::JourneyNotFound(journey_id))
    }

    async fn find_active_by_case(
        &self,
        case_id: Uuid,
    ) -> Result<Option<JourneyInstance>, JourneyError> {
        let inner = self.inner.read().await;
        Ok(inner
            .journeys
            .values()
            .filter(|j| j.case_id == case_id && !j.status.is_terminal())
            .max_by_key(|j| j.started_at)
            .cloned())
    }

    async fn load_stage_instances(
        &self,
        journey_id: Uuid,
    ) -> Result<Vec<StageInstance>, JourneyError> {
        let inner = self.inner.read().await;
        inner
            .stages
            .get(&journey_id)
            .cloned()
            .ok_or(JourneyError::JourneyNotFound(journey_id))
    }

    async fn save_journey_and_stages(
        &self,
        journey: &JourneyInstance,
        stages: &[StageInstance],
    ) -> Result<(), JourneyError> {
        let mut inner = self.inner.write().await;

        let stored_version = inner
            .journeys
            .get(&journey.journey_id)
            .map(|j| j.version)
            .ok_or(JourneyError::JourneyNotFound(journey.journey_id))?;
        if stored_version != journey.version {
            return Err(JourneyError::SaveConflict(journey.journey_id));
        }

        let mut refreshed = journey.clone();
        refreshed.version += 1;
        inner.journeys.insert(journey.journey_id, refreshed);

        let existing = inner
            .stages
            .get_mut(&journey.journey_id)
            .ok_or(JourneyError::JourneyNotFound(journey.journey_id))?;
        for stage in stages {
            match existing
                .iter_mut()
                .find(|s| s.stage_instance_id == stage.stage_instance_id)
            {
                Some(slot) => *slot = stage.clone(),
                None => {
                    return Err(JourneyError::StageNotFound(stage.stage_instance_id));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StageTemplate;
    use crate::state::JourneyStatus;

    fn make_journey(case_id: Uuid) -> (JourneyInstance, Vec<StageInstance>) {
        let journey = JourneyInstance::new(
            "litigation_standard".to_string(),
            case_id,
            Uuid::new_v4(),
            None,
        );
        let stages = (0..2)
            .map(|i| {
                StageInstance::from_template(
                    journey.journey_id,
                    &StageTemplate {
                        order_index: i,
                        title: format!("Stage {}", i),
                        stage_type: "task".to_string(),
                        sla_days: None,
                    },
                )
            })
            .collect();
        (journey, stages)
    }

    #[tokio::test]
    async fn test_insert_and_load_round_trip() {
        let store = MemoryStore::new();
        let (journey, stages) = make_journey(Uuid::new_v4());

        store
            .insert_journey_and_stages(&journey, &stages)
            .await
            .unwrap();

        let loaded = store.load_journey(journey.journey_id).await.unwrap();
        assert_eq!(loaded.template_id, "litigation_standard");

        let loaded_stages = store
            .load_stage_instances(journey.journey_id)
            .await
            .unwrap();
        assert_eq!(loaded_stages.len(), 2);
        assert_eq!(loaded_stages[0].order_index, 0);
    }

    #[tokio::test]
    async fn test_load_unknown_journey() {
        let store = MemoryStore::new();
        let err = store.load_journey(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, JourneyError::JourneyNotFound(_)));
    }

    #[tokio::test]
    async fn test_save_bumps_version() {
        let store = MemoryStore::new();
        let (journey, stages) = make_journey(Uuid::new_v4());
        store
            .insert_journey_and_stages(&journey, &stages)
            .await
            .unwrap();

        store.save_journey_and_stages(&journey, &[]).await.unwrap();

        let loaded = store.load_journey(journey.journey_id).await.unwrap();
        assert_eq!(loaded.version, journey.version + 1);
    }

    #[tokio::test]
    async fn test_stale_save_conflicts() {
        let store = MemoryStore::new();
        let (journey, stages) = make_journey(Uuid::new_v4());
        store
            .insert_journey_and_stages(&journey, &stages)
            .await
            .unwrap();

        // First save wins, second (same version token) conflicts
        store.save_journey_and_stages(&journey, &[]).await.unwrap();
        let err = store
            .save_journey_and_stages(&journey, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, JourneyError::SaveConflict(_)));
    }

    #[tokio::test]
    async fn test_find_active_prefers_latest_non_terminal() {
        let store = MemoryStore::new();
        let case_id = Uuid::new_v4();

        let (mut old, old_stages) = make_journey(case_id);
        old.status = JourneyStatus::Cancelled;
        store
            .insert_journey_and_stages(&old, &old_stages)
            .await
            .unwrap();

        let (current, current_stages) = make_journey(case_id);
        store
            .insert_journey_and_stages(&current, &current_stages)
            .await
            .unwrap();

        let found = store.find_active_by_case(case_id).await.unwrap().unwrap();
        assert_eq!(found.journey_id, current.journey_id);

        assert!(store
            .find_active_by_case(Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_save_unknown_stage_rejected() {
        let store = MemoryStore::new();
        let (journey, stages) = make_journey(Uuid::new_v4());
        store
            .insert_journey_and_stages(&journey, &stages)
            .await
            .unwrap();

        let foreign = StageInstance::from_template(
            journey.journey_id,
            &StageTemplate {
                order_index: 9,
                title: "Foreign".to_string(),
                stage_type: "task".to_string(),
                sla_days: None,
            },
        );
        let err = store
            .save_journey_and_stages(&journey, &[foreign])
            .await
            .unwrap_err();
        assert!(matches!(err, JourneyError::StageNotFound(_)));
    }
}
