//! API and Database Models
//!
//! Core data structures mapped to Postgres with `sqlx` and exposed through
//! the OpenAPI document with `utoipa`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

/// Lifecycle state of a scheduled call.
///
/// Transitions are monotonic: pending -> in_progress -> {completed, failed},
/// or pending -> cancelled. There is no way out of a terminal state.
#[derive(sqlx::Type, Debug, Serialize, Deserialize, ToSchema, Clone, Copy, PartialEq)]
#[sqlx(type_name = "schedule_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl ScheduleStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScheduleStatus::Completed | ScheduleStatus::Failed | ScheduleStatus::Cancelled
        )
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleStatus::Pending => write!(f, "pending"),
            ScheduleStatus::InProgress => write!(f, "in_progress"),
            ScheduleStatus::Completed => write!(f, "completed"),
            ScheduleStatus::Failed => write!(f, "failed"),
            ScheduleStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A user's request for an AI wellness check-in call.
#[derive(Serialize, Deserialize, ToSchema, FromRow, Debug, Clone)]
pub struct ScheduledCall {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    pub user_id: String,
    pub phone_number: String,
    pub scheduled_time: DateTime<Utc>,
    #[schema(value_type = String, example = "pending")]
    pub status: ScheduleStatus,
    /// Custom focus for the AI conversation (e.g. "stress management").
    /// Most provider agent configurations ignore overrides.
    pub custom_prompt: Option<String>,
    /// Custom greeting; same override caveat as `custom_prompt`.
    pub first_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The two parallel, speaker-tagged utterance sequences of one call.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    pub caller: Vec<String>,
    pub agent: Vec<String>,
}

impl Transcript {
    pub fn is_empty(&self) -> bool {
        self.caller.is_empty() && self.agent.is_empty()
    }
}

/// One realized telephony call attempt and its captured conversation.
#[derive(Serialize, Deserialize, ToSchema, FromRow, Debug, Clone)]
pub struct CallRecord {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    #[schema(value_type = String, format = Uuid)]
    pub schedule_id: Uuid,
    pub user_id: String,
    /// The telephony provider's call identifier (unique per attempt).
    pub provider_call_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i32>,
    pub caller_transcript: String,
    pub agent_responses: String,
    #[schema(value_type = Transcript)]
    pub transcript: Json<Transcript>,
    /// Terminal provider call status string, once reconciled.
    pub call_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Derived sentiment for a finished call, 1:1 with a `CallRecord`.
#[derive(Serialize, Deserialize, ToSchema, FromRow, Debug, Clone)]
pub struct CallSentiment {
    #[schema(value_type = String, format = Uuid)]
    pub call_record_id: Uuid,
    pub positive_score: f64,
    pub negative_score: f64,
    pub neutral_score: f64,
    #[schema(value_type = Vec<String>)]
    pub emotions_detected: Json<Vec<String>>,
    #[schema(value_type = Vec<String>)]
    pub key_phrases: Json<Vec<String>>,
    pub contributes_to_wellness_score: bool,
    /// Signed contribution to the overall wellness score, in [-25, +25].
    pub mental_health_impact: Option<f64>,
    pub analysis_confidence: f64,
    pub analyzed_at: DateTime<Utc>,
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct ScheduleCallPayload {
    #[schema(example = "+15550002222")]
    pub phone_number: String,
    pub scheduled_time: DateTime<Utc>,
    pub custom_prompt: Option<String>,
    pub first_message: Option<String>,
}

/// Call record plus its sentiment, for the history detail endpoint.
#[derive(Serialize, ToSchema)]
pub struct CallRecordDetail {
    #[serde(flatten)]
    pub record: CallRecord,
    pub sentiment: Option<CallSentiment>,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ScheduleStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        let status: ScheduleStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(status, ScheduleStatus::Cancelled);
    }

    #[test]
    fn schedule_status_terminality() {
        assert!(!ScheduleStatus::Pending.is_terminal());
        assert!(!ScheduleStatus::InProgress.is_terminal());
        assert!(ScheduleStatus::Completed.is_terminal());
        assert!(ScheduleStatus::Failed.is_terminal());
        assert!(ScheduleStatus::Cancelled.is_terminal());
    }

    #[test]
    fn schedule_status_display_matches_wire_form() {
        assert_eq!(ScheduleStatus::InProgress.to_string(), "in_progress");
        assert_eq!(ScheduleStatus::Pending.to_string(), "pending");
    }

    #[test]
    fn invalid_status_fails_deserialization() {
        let result: Result<ScheduleStatus, _> = serde_json::from_str("\"paused\"");
        assert!(result.is_err());
    }

    #[test]
    fn transcript_emptiness_requires_both_sides_empty() {
        let mut transcript = Transcript::default();
        assert!(transcript.is_empty());
        transcript.agent.push("Hello, how are you feeling?".into());
        assert!(!transcript.is_empty());
    }

    #[test]
    fn scheduled_call_round_trips_through_json() {
        let now = Utc::now();
        let call = ScheduledCall {
            id: Uuid::new_v4(),
            user_id: "user-7".into(),
            phone_number: "+15550002222".into(),
            scheduled_time: now,
            status: ScheduleStatus::Pending,
            custom_prompt: Some("stress management".into()),
            first_message: None,
            created_at: now,
            updated_at: now,
        };

        let json = serde_json::to_string(&call).unwrap();
        let back: ScheduledCall = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, call.id);
        assert_eq!(back.phone_number, call.phone_number);
        assert_eq!(back.status, call.status);
        assert_eq!(back.custom_prompt, call.custom_prompt);
    }

    #[test]
    fn schedule_payload_requires_time_and_number() {
        let json = r#"{"phone_number": "+15550002222"}"#;
        let result: Result<ScheduleCallPayload, _> = serde_json::from_str(json);
        assert!(result.is_err());

        let json = r#"{"phone_number": "+15550002222", "scheduled_time": "2026-08-29T10:00:00Z"}"#;
        let payload: ScheduleCallPayload = serde_json::from_str(json).unwrap();
        assert!(payload.custom_prompt.is_none());
    }
}
