//! Journey Progression Engine
//!
//! Orchestrates journey commands: each one loads the journey and its full
//! stage set, applies a single stage transition through the state machine,
//! recomputes the progress/next-action snapshot, and persists the mutated
//! stage plus the refreshed journey cache in one atomic save.
//!
//! Serializability per journey comes from a per-journey async lock held for
//! the whole load-mutate-save sequence; the store's optimistic version check
//! covers deployments where several processes share one database. Commands
//! on different journeys run in parallel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::TemplateCatalog;
use crate::machine;
use crate::progress::{self, SkippedProgressPolicy};
use crate::state::{
    JourneyInstance, JourneyStatus, NextAction, StageInstance, StageStatus, StageTransition,
};
use crate::store::JourneyStore;
use crate::JourneyError;

/// Save attempts before a version conflict surfaces to the caller
const MAX_SAVE_RETRIES: u32 = 3;

/// What a command does to its target stage
enum StageCommand {
    Start,
    Complete { notes: Option<String> },
    Skip { notes: Option<String> },
    Assign { assignee: Option<String> },
}

/// The journey progression engine
pub struct JourneyEngine {
    store: Arc<dyn JourneyStore>,
    catalog: Arc<TemplateCatalog>,
    policy: SkippedProgressPolicy,
    /// Per-journey mutual exclusion for load-mutate-save sequences
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl JourneyEngine {
    /// Create an engine with the default skipped-progress policy
    pub fn new(store: Arc<dyn JourneyStore>, catalog: Arc<TemplateCatalog>) -> Self {
        Self {
            store,
            catalog,
            policy: SkippedProgressPolicy::default(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Override how skipped stages count toward progress
    pub fn with_policy(mut self, policy: SkippedProgressPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Enroll a case in a journey: create the journey plus one pending stage
    /// per template stage, with the initial snapshot already computed.
    pub async fn create_journey(
        &self,
        template_id: &str,
        case_id: Uuid,
        client_id: Uuid,
        created_by: Option<String>,
    ) -> Result<JourneyView, JourneyError> {
        debug!(template_id, case_id = %case_id, "Creating journey");

        let template = self
            .catalog
            .get(template_id)
            .ok_or_else(|| JourneyError::TemplateNotFound(template_id.to_string()))?;
        if template.stages.is_empty() {
            return Err(JourneyError::TemplateHasNoStages(template_id.to_string()));
        }

        let mut journey =
            JourneyInstance::new(template_id.to_string(), case_id, client_id, created_by);
        let stages: Vec<StageInstance> = template
            .ordered_stages()
            .into_iter()
            .map(|t| StageInstance::from_template(journey.journey_id, t))
            .collect();

        let snapshot = progress::compute(&stages, self.policy, Utc::now())?;
        journey.progress_pct = snapshot.progress_pct;
        journey.next_action = snapshot.next_action;

        self.store
            .insert_journey_and_stages(&journey, &stages)
            .await?;

        info!(
            journey_id = %journey.journey_id,
            template_id,
            stages = stages.len(),
            "Journey created"
        );
        Ok(self.build_view(&journey, &stages))
    }

    /// Start a pending stage. Also moves a freshly created journey to
    /// `in_progress`.
    pub async fn start_stage(
        &self,
        journey_id: Uuid,
        stage_instance_id: Uuid,
    ) -> Result<JourneyView, JourneyError> {
        self.apply(journey_id, stage_instance_id, StageCommand::Start)
            .await
    }

    /// Complete the stage that is currently in progress
    pub async fn complete_stage(
        &self,
        journey_id: Uuid,
        stage_instance_id: Uuid,
        notes: Option<String>,
    ) -> Result<JourneyView, JourneyError> {
        self.apply(
            journey_id,
            stage_instance_id,
            StageCommand::Complete { notes },
        )
        .await
    }

    /// Skip a stage from `pending` or `in_progress`
    pub async fn skip_stage(
        &self,
        journey_id: Uuid,
        stage_instance_id: Uuid,
        notes: Option<String>,
    ) -> Result<JourneyView, JourneyError> {
        self.apply(journey_id, stage_instance_id, StageCommand::Skip { notes })
            .await
    }

    /// Set or clear the assignee on a stage. Pure bookkeeping — no state
    /// machine transition and no change to the derived snapshot targets.
    pub async fn assign_stage(
        &self,
        journey_id: Uuid,
        stage_instance_id: Uuid,
        assignee: Option<String>,
    ) -> Result<JourneyView, JourneyError> {
        self.apply(
            journey_id,
            stage_instance_id,
            StageCommand::Assign { assignee },
        )
        .await
    }

    /// Abandon a journey: terminal `cancelled` status, no further commands
    pub async fn cancel_journey(
        &self,
        journey_id: Uuid,
        reason: Option<String>,
    ) -> Result<JourneyView, JourneyError> {
        let lock = self.lock_for(journey_id).await;
        let _guard = lock.lock().await;

        let mut journey = self.store.load_journey(journey_id).await?;
        if journey.status.is_terminal() {
            return Err(JourneyError::JourneyClosed {
                status: journey.status,
            });
        }

        let now = Utc::now();
        journey.status = JourneyStatus::Cancelled;
        journey.ended_at = Some(now);
        journey.cancel_reason = reason;
        journey.next_action = None;
        journey.updated_at = now;

        self.store.save_journey_and_stages(&journey, &[]).await?;

        info!(journey_id = %journey_id, reason = ?journey.cancel_reason, "Journey cancelled");
        let stages = self.store.load_stage_instances(journey_id).await?;
        Ok(self.build_view(&journey, &stages))
    }

    /// Active journey for a case: most recently started, not yet terminal.
    /// `created` counts as active so a fresh journey is immediately visible.
    pub async fn get_journey(&self, case_id: Uuid) -> Result<Option<JourneyView>, JourneyError> {
        let Some(journey) = self.store.find_active_by_case(case_id).await? else {
            return Ok(None);
        };
        let stages = self.store.load_stage_instances(journey.journey_id).await?;
        Ok(Some(self.build_view(&journey, &stages)))
    }

    /// Load any journey by ID, regardless of status
    pub async fn get_journey_by_id(&self, journey_id: Uuid) -> Result<JourneyView, JourneyError> {
        let journey = self.store.load_journey(journey_id).await?;
        let stages = self.store.load_stage_instances(journey_id).await?;
        Ok(self.build_view(&journey, &stages))
    }

    /// Shared command path: lock, load, transition, recompute, save.
    /// Retries the whole sequence on an optimistic save conflict.
    async fn apply(
        &self,
        journey_id: Uuid,
        stage_instance_id: Uuid,
        command: StageCommand,
    ) -> Result<JourneyView, JourneyError> {
        let lock = self.lock_for(journey_id).await;
        let _guard = lock.lock().await;

        let mut attempt = 0;
        loop {
            match self
                .apply_once(journey_id, stage_instance_id, &command)
                .await
            {
                Err(JourneyError::SaveConflict(_)) if attempt < MAX_SAVE_RETRIES => {
                    attempt += 1;
                    warn!(
                        journey_id = %journey_id,
                        attempt,
                        "Save conflict, reloading and retrying command"
                    );
                }
                other => return other,
            }
        }
    }

    async fn apply_once(
        &self,
        journey_id: Uuid,
        stage_instance_id: Uuid,
        command: &StageCommand,
    ) -> Result<JourneyView, JourneyError> {
        let mut journey = self.store.load_journey(journey_id).await?;
        if journey.status.is_terminal() {
            return Err(JourneyError::JourneyClosed {
                status: journey.status,
            });
        }

        let mut stages = self.store.load_stage_instances(journey_id).await?;
        let stage_idx = stages
            .iter()
            .position(|s| s.stage_instance_id == stage_instance_id)
            .ok_or(JourneyError::StageNotFound(stage_instance_id))?;

        let now = Utc::now();
        let transition = match command {
            StageCommand::Start => {
                // Single active front: reject while a sibling is running.
                // The target itself is excluded so starting an already
                // active stage reports InvalidTransition, not a conflict.
                if let Some(active) = stages.iter().find(|s| {
                    s.status == StageStatus::InProgress
                        && s.stage_instance_id != stage_instance_id
                }) {
                    return Err(JourneyError::ConflictingActiveStage {
                        active: active.stage_instance_id,
                    });
                }
                let from = machine::start(&mut stages[stage_idx], now)?;
                if journey.status == JourneyStatus::Created {
                    journey.status = JourneyStatus::InProgress;
                }
                Some((from, None))
            }
            StageCommand::Complete { notes } => {
                let from = machine::complete(&mut stages[stage_idx], notes.clone(), now)?;
                Some((from, notes.clone()))
            }
            StageCommand::Skip { notes } => {
                let from = machine::skip(&mut stages[stage_idx], notes.clone(), now)?;
                Some((from, notes.clone()))
            }
            StageCommand::Assign { assignee } => {
                stages[stage_idx].assignee = assignee.clone();
                None
            }
        };

        if let Some((from, notes)) = transition {
            let to = stages[stage_idx].status;
            journey.record_transition(stage_instance_id, from, to, notes);
            debug!(
                journey_id = %journey_id,
                stage_instance_id = %stage_instance_id,
                from = %from,
                to = %to,
                "Stage transition applied"
            );
        }

        // Refresh the derived cache in the same atomic unit as the mutation
        let snapshot = progress::compute(&stages, self.policy, now)?;
        journey.progress_pct = snapshot.progress_pct;
        journey.next_action = snapshot.next_action;
        if snapshot.all_stages_terminal && !journey.status.is_terminal() {
            journey.status = JourneyStatus::Completed;
            journey.ended_at = Some(now);
            info!(journey_id = %journey_id, "Journey completed");
        }
        journey.updated_at = now;

        let mutated = stages[stage_idx].clone();
        self.store
            .save_journey_and_stages(&journey, std::slice::from_ref(&mutated))
            .await?;

        Ok(self.build_view(&journey, &stages))
    }

    async fn lock_for(&self, journey_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        // Drop entries no command currently holds so the map tracks only
        // in-flight journeys rather than every journey ever touched
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(journey_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn build_view(&self, journey: &JourneyInstance, stages: &[StageInstance]) -> JourneyView {
        let template_name = self
            .catalog
            .get(&journey.template_id)
            .map(|t| t.name.clone())
            .unwrap_or_else(|| journey.template_id.clone());

        let mut stage_views: Vec<StageView> = stages.iter().map(StageView::from).collect();
        stage_views.sort_by_key(|s| s.order_index);

        JourneyView {
            journey_id: journey.journey_id,
            template_id: journey.template_id.clone(),
            template_name,
            case_id: journey.case_id,
            client_id: journey.client_id,
            status: journey.status,
            progress_pct: journey.progress_pct,
            next_action: journey.next_action.clone(),
            ended_at: journey.ended_at,
            cancel_reason: journey.cancel_reason.clone(),
            stages: stage_views,
            history: journey.history.clone(),
        }
    }
}

/// Full journey view returned by every command and query
#[derive(Debug, Clone, Serialize)]
pub struct JourneyView {
    pub journey_id: Uuid,
    pub template_id: String,
    pub template_name: String,
    pub case_id: Uuid,
    pub client_id: Uuid,
    pub status: JourneyStatus,
    pub progress_pct: u8,
    pub next_action: Option<NextAction>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub stages: Vec<StageView>,
    pub history: Vec<StageTransition>,
}

/// Stage-level view row
#[derive(Debug, Clone, Serialize)]
pub struct StageView {
    pub stage_instance_id: Uuid,
    pub order_index: u32,
    pub title: String,
    pub stage_type: String,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub due_at: Option<DateTime<Utc>>,
    pub assignee: Option<String>,
    pub notes: Option<String>,
}

impl From<&StageInstance> for StageView {
    fn from(stage: &StageInstance) -> Self {
        Self {
            stage_instance_id: stage.stage_instance_id,
            order_index: stage.order_index,
            title: stage.title.clone(),
            stage_type: stage.stage_type.clone(),
            status: stage.status,
            started_at: stage.started_at,
            completed_at: stage.completed_at,
            due_at: stage.due_at,
            assignee: stage.assignee.clone(),
            notes: stage.notes.clone(),
        }
    }
}
