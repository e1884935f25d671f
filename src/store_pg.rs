//! Postgres Journey Store
//!
//! `JourneyStore` backed by Postgres. Expected tables (created by
//! migrations owned by the surrounding application):
//!
//! - `case_journeys(journey_id uuid pk, template_id text, case_id uuid,
//!   client_id uuid, status text, started_at timestamptz, ended_at
//!   timestamptz, cancel_reason text, progress_pct smallint, next_action
//!   jsonb, history jsonb, created_by text, updated_at timestamptz,
//!   version bigint)`
//! - `journey_stage_instances(stage_instance_id uuid pk, journey_id uuid,
//!   order_index int, title text, stage_type text, sla_days int, status
//!   text, started_at timestamptz, completed_at timestamptz, due_at
//!   timestamptz, assignee text, notes text)`
//!
//! NOTE: All queries use runtime-checked sqlx::query() instead of
//! compile-time sqlx::query!() macros because the tables are created by
//! migrations that may not exist at compile time.
//!
//! Atomicity: every multi-row write runs in a transaction, and the journey
//! update carries a `version = $expected` guard so a stale writer fails with
//! `SaveConflict` without touching anything.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::state::{JourneyInstance, NextAction, StageInstance, StageTransition};
use crate::store::JourneyStore;
use crate::JourneyError;

/// Postgres-backed journey store
pub struct PgJourneyStore {
    pool: PgPool,
}

impl PgJourneyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct JourneyRow {
    journey_id: Uuid,
    template_id: String,
    case_id: Uuid,
    client_id: Uuid,
    status: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    cancel_reason: Option<String>,
    progress_pct: i16,
    next_action: Option<serde_json::Value>,
    history: serde_json::Value,
    created_by: Option<String>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl TryFrom<JourneyRow> for JourneyInstance {
    type Error = JourneyError;

    fn try_from(row: JourneyRow) -> Result<Self, Self::Error> {
        let status = row.status.try_into().map_err(JourneyError::Storage)?;
        let next_action: Option<NextAction> = row
            .next_action
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| JourneyError::Storage(format!("bad next_action json: {}", e)))?;
        let history: Vec<StageTransition> = serde_json::from_value(row.history)
            .map_err(|e| JourneyError::Storage(format!("bad history json: {}", e)))?;
        let progress_pct = u8::try_from(row.progress_pct)
            .map_err(|_| JourneyError::Storage(format!("bad progress_pct {}", row.progress_pct)))?;

        Ok(JourneyInstance {
            journey_id: row.journey_id,
            template_id: row.template_id,
            case_id: row.case_id,
            client_id: row.client_id,
            status,
            started_at: row.started_at,
            ended_at: row.ended_at,
            cancel_reason: row.cancel_reason,
            progress_pct,
            next_action,
            history,
            created_by: row.created_by,
            updated_at: row.updated_at,
            version: row.version,
        })
    }
}

#[derive(Debug, FromRow)]
struct StageRow {
    stage_instance_id: Uuid,
    journey_id: Uuid,
    order_index: i32,
    title: String,
    stage_type: String,
    sla_days: Option<i32>,
    status: String,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    due_at: Option<DateTime<Utc>>,
    assignee: Option<String>,
    notes: Option<String>,
}

impl TryFrom<StageRow> for StageInstance {
    type Error = JourneyError;

    fn try_from(row: StageRow) -> Result<Self, Self::Error> {
        let status = row.status.try_into().map_err(JourneyError::Storage)?;
        let order_index = u32::try_from(row.order_index)
            .map_err(|_| JourneyError::Storage(format!("bad order_index {}", row.order_index)))?;
        let sla_days = row
            .sla_days
            .map(|d| {
                u32::try_from(d)
                    .map_err(|_| JourneyError::Storage(format!("bad sla_days {}", d)))
            })
            .transpose()?;

        Ok(StageInstance {
            stage_instance_id: row.stage_instance_id,
            journey_id: row.journey_id,
            order_index,
            title: row.title,
            stage_type: row.stage_type,
            sla_days,
            status,
            started_at: row.started_at,
            completed_at: row.completed_at,
            due_at: row.due_at,
            assignee: row.assignee,
            notes: row.notes,
        })
    }
}

fn next_action_json(journey: &JourneyInstance) -> Result<Option<serde_json::Value>, JourneyError> {
    journey
        .next_action
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| JourneyError::Storage(format!("cannot encode next_action: {}", e)))
}

fn history_json(journey: &JourneyInstance) -> Result<serde_json::Value, JourneyError> {
    serde_json::to_value(&journey.history)
        .map_err(|e| JourneyError::Storage(format!("cannot encode history: {}", e)))
}

async fn insert_stage(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    stage: &StageInstance,
) -> Result<(), JourneyError> {
    sqlx::query(
        r#"
        INSERT INTO journey_stage_instances
            (stage_instance_id, journey_id, order_index, title, stage_type,
             sla_days, status, started_at, completed_at, due_at, assignee, notes)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(stage.stage_instance_id)
    .bind(stage.journey_id)
    .bind(stage.order_index as i32)
    .bind(&stage.title)
    .bind(&stage.stage_type)
    .bind(stage.sla_days.map(|d| d as i32))
    .bind(stage.status.as_str())
    .bind(stage.started_at)
    .bind(stage.completed_at)
    .bind(stage.due_at)
    .bind(&stage.assignee)
    .bind(&stage.notes)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl JourneyStore for PgJourneyStore {
    async fn insert_journey_and_stages(
        &self,
        journey: &JourneyInstance,
        stages: &[StageInstance],
    ) -> Result<(), JourneyError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO case_journeys
                (journey_id, template_id, case_id, client_id, status, started_at,
                 ended_at, cancel_reason, progress_pct, next_action, history,
                 created_by, updated_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(journey.journey_id)
        .bind(&journey.template_id)
        .bind(journey.case_id)
        .bind(journey.client_id)
        .bind(journey.status.as_str())
        .bind(journey.started_at)
        .bind(journey.ended_at)
        .bind(&journey.cancel_reason)
        .bind(journey.progress_pct as i16)
        .bind(next_action_json(journey)?)
        .bind(history_json(journey)?)
        .bind(&journey.created_by)
        .bind(journey.updated_at)
        .bind(journey.version)
        .execute(&mut *tx)
        .await?;

        for stage in stages {
            insert_stage(&mut tx, stage).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_journey(&self, journey_id: Uuid) -> Result<JourneyInstance, JourneyError> {
        let row: Option<JourneyRow> =
            sqlx::query_as(r#"SELECT * FROM case_journeys WHERE journey_id = $1"#)
                .bind(journey_id)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or(JourneyError::JourneyNotFound(journey_id))?
            .try_into()
    }

    async fn find_active_by_case(
        &self,
        case_id: Uuid,
    ) -> Result<Option<JourneyInstance>, JourneyError> {
        let row: Option<JourneyRow> = sqlx::query_as(
            r#"
            SELECT * FROM case_journeys
            WHERE case_id = $1 AND status IN ('created', 'in_progress')
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(case_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JourneyInstance::try_from).transpose()
    }

    async fn load_stage_instances(
        &self,
        journey_id: Uuid,
    ) -> Result<Vec<StageInstance>, JourneyError> {
        let rows: Vec<StageRow> = sqlx::query_as(
            r#"
            SELECT * FROM journey_stage_instances
            WHERE journey_id = $1
            ORDER BY order_index
            "#,
        )
        .bind(journey_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            // Distinguish "journey unknown" from "journey without stages"
            let exists: Option<(Uuid,)> =
                sqlx::query_as(r#"SELECT journey_id FROM case_journeys WHERE journey_id = $1"#)
                    .bind(journey_id)
                    .fetch_optional(&self.pool)
                    .await?;
            if exists.is_none() {
                return Err(JourneyError::JourneyNotFound(journey_id));
            }
        }

        rows.into_iter().map(StageInstance::try_from).collect()
    }

    async fn save_journey_and_stages(
        &self,
        journey: &JourneyInstance,
        stages: &[StageInstance],
    ) -> Result<(), JourneyError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE case_journeys
            SET status = $2,
                ended_at = $3,
                cancel_reason = $4,
                progress_pct = $5,
                next_action = $6,
                history = $7,
                updated_at = $8,
                version = version + 1
            WHERE journey_id = $1 AND version = $9
            "#,
        )
        .bind(journey.journey_id)
        .bind(journey.status.as_str())
        .bind(journey.ended_at)
        .bind(&journey.cancel_reason)
        .bind(journey.progress_pct as i16)
        .bind(next_action_json(journey)?)
        .bind(history_json(journey)?)
        .bind(journey.updated_at)
        .bind(journey.version)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            let exists: Option<(Uuid,)> =
                sqlx::query_as(r#"SELECT journey_id FROM case_journeys WHERE journey_id = $1"#)
                    .bind(journey.journey_id)
                    .fetch_optional(&self.pool)
                    .await?;
            return match exists {
                Some(_) => Err(JourneyError::SaveConflict(journey.journey_id)),
                None => Err(JourneyError::JourneyNotFound(journey.journey_id)),
            };
        }

        for stage in stages {
            let updated = sqlx::query(
                r#"
                UPDATE journey_stage_instances
                SET status = $2,
                    started_at = $3,
                    completed_at = $4,
                    due_at = $5,
                    assignee = $6,
                    notes = $7
                WHERE stage_instance_id = $1 AND journey_id = $8
                "#,
            )
            .bind(stage.stage_instance_id)
            .bind(stage.status.as_str())
            .bind(stage.started_at)
            .bind(stage.completed_at)
            .bind(stage.due_at)
            .bind(&stage.assignee)
            .bind(&stage.notes)
            .bind(stage.journey_id)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                tx.rollback().await?;
                return Err(JourneyError::StageNotFound(stage.stage_instance_id));
            }
        }

        tx.commit().await?;
        Ok(())
    }
}
