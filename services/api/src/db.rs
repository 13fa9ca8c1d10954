//! Data Access Layer
//!
//! All Postgres access for the service, using `sqlx` with runtime-checked
//! queries and connection pooling. The scheduler and stream bridge go through
//! the narrower [`CallStore`] trait so their logic is testable against an
//! in-memory double.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;
use wellcall_core::sentiment::SentimentScores;

use crate::error::CallError;
use crate::models::{CallRecord, CallSentiment, ScheduleStatus, ScheduledCall, Transcript};

/// The persistence operations touched by the scheduler and the stream bridge.
///
/// Bridge writes (transcript) and scheduler writes (duration/status) touch
/// disjoint field groups of `call_records`, so each method is an independent
/// partial update rather than a transactional merge.
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Pending schedules whose time has come (cutoff includes the sweep buffer).
    async fn due_schedules(&self, cutoff: DateTime<Utc>) -> Result<Vec<ScheduledCall>, CallError>;

    /// In-progress schedules whose call record started before the cutoff and
    /// was never finalized. These are reconciliations lost to a transient
    /// failure or a restart, returned as (schedule id, provider call id).
    async fn unreconciled_calls(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(Uuid, String)>, CallError>;

    /// Atomically claims a pending schedule for dispatch. Returns `false` if
    /// another sweep already claimed it.
    async fn claim_schedule(&self, id: Uuid) -> Result<bool, CallError>;

    /// Moves a claimed schedule to a terminal state.
    async fn mark_schedule(&self, id: Uuid, status: ScheduleStatus) -> Result<(), CallError>;

    /// Records the provider's acceptance of an outbound call.
    async fn create_call_record(
        &self,
        schedule: &ScheduledCall,
        provider_call_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<CallRecord, CallError>;

    async fn find_call_record(
        &self,
        provider_call_id: &str,
    ) -> Result<Option<CallRecord>, CallError>;

    /// Flushes a session's utterance buffers into the matching record.
    async fn save_transcript(
        &self,
        provider_call_id: &str,
        transcript: &Transcript,
    ) -> Result<(), CallError>;

    /// Writes the reconciled duration, end time, and terminal status.
    async fn finalize_call_record(
        &self,
        provider_call_id: &str,
        duration_seconds: Option<i32>,
        ended_at: Option<DateTime<Utc>>,
        call_status: &str,
    ) -> Result<(), CallError>;

    /// Creates or replaces the sentiment row for a record (upsert semantics:
    /// recomputing replaces prior values, never accumulates).
    async fn upsert_sentiment(
        &self,
        call_record_id: Uuid,
        scores: &SentimentScores,
        impact: f64,
    ) -> Result<(), CallError>;
}

/// A wrapper around the `PgPool` to provide a clear data access interface.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<(), CallError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CallError::Session(format!("migration failure: {e}")))?;
        Ok(())
    }

    pub async fn create_schedule(
        &self,
        user_id: &str,
        phone_number: &str,
        scheduled_time: DateTime<Utc>,
        custom_prompt: Option<&str>,
        first_message: Option<&str>,
    ) -> Result<ScheduledCall, CallError> {
        let schedule = sqlx::query_as::<_, ScheduledCall>(
            r#"
            INSERT INTO call_schedules
                (user_id, phone_number, scheduled_time, custom_prompt, first_message)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(phone_number)
        .bind(scheduled_time)
        .bind(custom_prompt)
        .bind(first_message)
        .fetch_one(&self.pool)
        .await?;
        Ok(schedule)
    }

    pub async fn get_schedule(&self, id: Uuid) -> Result<Option<ScheduledCall>, CallError> {
        let schedule =
            sqlx::query_as::<_, ScheduledCall>("SELECT * FROM call_schedules WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(schedule)
    }

    pub async fn list_schedules(&self, user_id: &str) -> Result<Vec<ScheduledCall>, CallError> {
        let schedules = sqlx::query_as::<_, ScheduledCall>(
            "SELECT * FROM call_schedules WHERE user_id = $1 ORDER BY scheduled_time DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(schedules)
    }

    /// Cancels a schedule, allowed only while it is still pending. Returns
    /// `false` if it was already dispatched, finished, or does not exist.
    pub async fn cancel_schedule(&self, id: Uuid, user_id: &str) -> Result<bool, CallError> {
        let result = sqlx::query(
            r#"
            UPDATE call_schedules
            SET status = 'cancelled', updated_at = now()
            WHERE id = $1 AND user_id = $2 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn list_call_records(&self, user_id: &str) -> Result<Vec<CallRecord>, CallError> {
        let records = sqlx::query_as::<_, CallRecord>(
            "SELECT * FROM call_records WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn get_call_record(
        &self,
        id: Uuid,
        user_id: &str,
    ) -> Result<Option<CallRecord>, CallError> {
        let record = sqlx::query_as::<_, CallRecord>(
            "SELECT * FROM call_records WHERE id = $1 AND user_id = $2",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn get_sentiment(
        &self,
        call_record_id: Uuid,
    ) -> Result<Option<CallSentiment>, CallError> {
        let sentiment = sqlx::query_as::<_, CallSentiment>(
            "SELECT * FROM call_sentiments WHERE call_record_id = $1",
        )
        .bind(call_record_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sentiment)
    }
}

#[async_trait]
impl CallStore for Db {
    async fn due_schedules(&self, cutoff: DateTime<Utc>) -> Result<Vec<ScheduledCall>, CallError> {
        let schedules = sqlx::query_as::<_, ScheduledCall>(
            r#"
            SELECT * FROM call_schedules
            WHERE status = 'pending' AND scheduled_time <= $1
            ORDER BY scheduled_time ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(schedules)
    }

    async fn unreconciled_calls(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(Uuid, String)>, CallError> {
        let lost = sqlx::query_as::<_, (Uuid, String)>(
            r#"
            SELECT s.id, r.provider_call_id
            FROM call_schedules s
            JOIN call_records r ON r.schedule_id = s.id
            WHERE s.status = 'in_progress'
              AND r.call_status IS NULL
              AND r.started_at <= $1
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(lost)
    }

    async fn claim_schedule(&self, id: Uuid) -> Result<bool, CallError> {
        // The status guard makes the claim atomic under concurrent sweeps.
        let result = sqlx::query(
            r#"
            UPDATE call_schedules
            SET status = 'in_progress', updated_at = now()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_schedule(&self, id: Uuid, status: ScheduleStatus) -> Result<(), CallError> {
        sqlx::query(
            r#"
            UPDATE call_schedules
            SET status = $2, updated_at = now()
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(id)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_call_record(
        &self,
        schedule: &ScheduledCall,
        provider_call_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<CallRecord, CallError> {
        let record = sqlx::query_as::<_, CallRecord>(
            r#"
            INSERT INTO call_records (schedule_id, user_id, provider_call_id, started_at)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(schedule.id)
        .bind(&schedule.user_id)
        .bind(provider_call_id)
        .bind(started_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn find_call_record(
        &self,
        provider_call_id: &str,
    ) -> Result<Option<CallRecord>, CallError> {
        let record = sqlx::query_as::<_, CallRecord>(
            "SELECT * FROM call_records WHERE provider_call_id = $1",
        )
        .bind(provider_call_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn save_transcript(
        &self,
        provider_call_id: &str,
        transcript: &Transcript,
    ) -> Result<(), CallError> {
        let result = sqlx::query(
            r#"
            UPDATE call_records
            SET caller_transcript = $2,
                agent_responses = $3,
                transcript = $4,
                updated_at = now()
            WHERE provider_call_id = $1
            "#,
        )
        .bind(provider_call_id)
        .bind(transcript.caller.join(" "))
        .bind(transcript.agent.join(" "))
        .bind(Json(transcript))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CallError::NotFound(provider_call_id.to_string()));
        }
        Ok(())
    }

    async fn finalize_call_record(
        &self,
        provider_call_id: &str,
        duration_seconds: Option<i32>,
        ended_at: Option<DateTime<Utc>>,
        call_status: &str,
    ) -> Result<(), CallError> {
        let result = sqlx::query(
            r#"
            UPDATE call_records
            SET duration_seconds = $2,
                ended_at = $3,
                call_status = $4,
                updated_at = now()
            WHERE provider_call_id = $1
            "#,
        )
        .bind(provider_call_id)
        .bind(duration_seconds)
        .bind(ended_at)
        .bind(call_status)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CallError::NotFound(provider_call_id.to_string()));
        }
        Ok(())
    }

    async fn upsert_sentiment(
        &self,
        call_record_id: Uuid,
        scores: &SentimentScores,
        impact: f64,
    ) -> Result<(), CallError> {
        sqlx::query(
            r#"
            INSERT INTO call_sentiments
                (call_record_id, positive_score, negative_score, neutral_score,
                 emotions_detected, key_phrases, mental_health_impact,
                 analysis_confidence, analyzed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())
            ON CONFLICT (call_record_id) DO UPDATE
            SET positive_score = EXCLUDED.positive_score,
                negative_score = EXCLUDED.negative_score,
                neutral_score = EXCLUDED.neutral_score,
                emotions_detected = EXCLUDED.emotions_detected,
                key_phrases = EXCLUDED.key_phrases,
                mental_health_impact = EXCLUDED.mental_health_impact,
                analysis_confidence = EXCLUDED.analysis_confidence,
                analyzed_at = now()
            "#,
        )
        .bind(call_record_id)
        .bind(scores.positive)
        .bind(scores.negative)
        .bind(scores.neutral)
        .bind(Json(&scores.emotions_detected))
        .bind(Json(&scores.key_phrases))
        .bind(impact)
        .bind(scores.confidence)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
