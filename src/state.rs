//! Journey State Types
//!
//! Core state for journey and stage instances. A journey is one running
//! multi-stage workflow for a case; each stage instance mirrors one template
//! stage and moves through a small lifecycle. The derived fields
//! (`progress_pct`, `next_action`) are caches refreshed by the engine on
//! every mutation — they are never computed lazily.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::StageTemplate;

/// Lifecycle status of a journey instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "database", derive(sqlx::Type))]
#[cfg_attr(
    feature = "database",
    sqlx(type_name = "text", rename_all = "snake_case")
)]
pub enum JourneyStatus {
    Created,
    InProgress,
    Completed,
    Cancelled,
}

impl JourneyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal journeys accept no further commands
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl std::fmt::Display for JourneyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<String> for JourneyStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "created" => Ok(Self::Created),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown journey status: {}", s)),
        }
    }
}

/// Lifecycle status of a stage instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "database", derive(sqlx::Type))]
#[cfg_attr(
    feature = "database",
    sqlx(type_name = "text", rename_all = "snake_case")
)]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
        }
    }

    /// Completed and skipped stages never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<String> for StageStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Unknown stage status: {}", s)),
        }
    }
}

/// Urgency of the recommended next action
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionPriority {
    Low,
    Medium,
    High,
}

impl ActionPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl std::fmt::Display for ActionPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The single derived recommendation for advancing a journey.
///
/// Tagged variant rather than a bag of optional fields so the calculator's
/// branches stay exhaustive. Serializes as `{"type": "start_stage", ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum NextAction {
    /// Begin the lowest-order pending stage
    StartStage {
        stage_instance_id: Uuid,
        title: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        priority: ActionPriority,
    },
    /// Finish the stage that is currently in progress
    CompleteStage {
        stage_instance_id: Uuid,
        title: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        due_at: Option<DateTime<Utc>>,
        priority: ActionPriority,
    },
}

impl NextAction {
    /// Stage instance this action targets
    pub fn stage_instance_id(&self) -> Uuid {
        match self {
            Self::StartStage {
                stage_instance_id, ..
            }
            | Self::CompleteStage {
                stage_instance_id, ..
            } => *stage_instance_id,
        }
    }

    pub fn priority(&self) -> ActionPriority {
        match self {
            Self::StartStage { priority, .. } | Self::CompleteStage { priority, .. } => *priority,
        }
    }
}

/// One running instance of a journey template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyInstance {
    /// Unique journey ID
    pub journey_id: Uuid,
    /// Journey template ID (e.g., "litigation_standard")
    pub template_id: String,
    /// Case this journey advances
    pub case_id: Uuid,
    /// Client the case belongs to
    pub client_id: Uuid,

    /// Current lifecycle status
    pub status: JourneyStatus,
    /// When the journey was started (creation time)
    pub started_at: DateTime<Utc>,
    /// When the journey reached a terminal status
    pub ended_at: Option<DateTime<Utc>>,
    /// Why the journey was cancelled; only set for `cancelled` journeys
    pub cancel_reason: Option<String>,

    /// Derived completion percentage (0–100), cached
    pub progress_pct: u8,
    /// Derived recommendation, cached; `None` once every stage is terminal
    pub next_action: Option<NextAction>,

    /// History of stage transitions, newest last. Journey-level lifecycle
    /// events are carried by `status`/`ended_at`/`cancel_reason` instead.
    pub history: Vec<StageTransition>,

    /// Who enrolled the case
    pub created_by: Option<String>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency token, bumped on every save
    pub version: i64,
}

impl JourneyInstance {
    /// Create a new journey instance in `Created` status with an empty cache.
    /// The engine computes and persists the real snapshot before the instance
    /// becomes visible.
    pub fn new(
        template_id: String,
        case_id: Uuid,
        client_id: Uuid,
        created_by: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            journey_id: Uuid::new_v4(),
            template_id,
            case_id,
            client_id,
            status: JourneyStatus::Created,
            started_at: now,
            ended_at: None,
            cancel_reason: None,
            progress_pct: 0,
            next_action: None,
            history: Vec::new(),
            created_by,
            updated_at: now,
            version: 0,
        }
    }

    /// Record a stage transition in the journey's history
    pub fn record_transition(
        &mut self,
        stage_instance_id: Uuid,
        from: StageStatus,
        to: StageStatus,
        notes: Option<String>,
    ) {
        let now = Utc::now();
        self.history.push(StageTransition {
            stage_instance_id,
            from,
            to,
            transitioned_at: now,
            notes,
        });
        self.updated_at = now;
    }
}

/// Record of one stage transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTransition {
    /// Stage instance that moved
    pub stage_instance_id: Uuid,
    /// Status transitioned from
    pub from: StageStatus,
    /// Status transitioned to
    pub to: StageStatus,
    /// When the transition occurred
    pub transitioned_at: DateTime<Utc>,
    /// Operator notes captured with the transition
    pub notes: Option<String>,
}

/// One ordered step of a running journey
///
/// Template attributes (order, title, type, SLA) are denormalized at
/// instantiation so transitions and views need no catalog lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageInstance {
    /// Unique stage instance ID
    pub stage_instance_id: Uuid,
    /// Owning journey
    pub journey_id: Uuid,

    /// Position within the journey (unique, dense from 0)
    pub order_index: u32,
    /// Display title from the template
    pub title: String,
    /// Stage type code — drives UI affordances, not engine logic
    pub stage_type: String,
    /// Target duration in days once started; `None` = no SLA
    pub sla_days: Option<u32>,

    /// Current lifecycle status
    pub status: StageStatus,
    /// Set when the stage enters `in_progress`
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal timestamp — set on completion or skip
    pub completed_at: Option<DateTime<Utc>>,
    /// `started_at + sla_days`; `None` until started or without an SLA
    pub due_at: Option<DateTime<Utc>>,

    /// User responsible for the stage
    pub assignee: Option<String>,
    /// Free-text operator notes
    pub notes: Option<String>,
}

impl StageInstance {
    /// Instantiate a pending stage from its template
    pub fn from_template(journey_id: Uuid, template: &StageTemplate) -> Self {
        Self {
            stage_instance_id: Uuid::new_v4(),
            journey_id,
            order_index: template.order_index,
            title: template.title.clone(),
            stage_type: template.stage_type.clone(),
            sla_days: template.sla_days,
            status: StageStatus::Pending,
            started_at: None,
            completed_at: None,
            due_at: None,
            assignee: None,
            notes: None,
        }
    }
}
