//! API and Database Models
//!
//! This module defines the core data structures used for both database mapping
//! with `sqlx` and for generating OpenAPI documentation with `utoipa`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use utoipa::ToSchema;

#[derive(sqlx::Type, Debug, Serialize, Deserialize, ToSchema, Clone, Copy, PartialEq)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    InProgress,
    Completed,
    Failed,
}

// Implement Display for easy conversion to a string, useful for logging and debugging.
impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallStatus::InProgress => write!(f, "in_progress"),
            CallStatus::Completed => write!(f, "completed"),
            CallStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One call's persisted record. Written when the call is answered and
/// completed with transcript and latency stats when it ends.
#[derive(Serialize, Deserialize, ToSchema, FromRow, Debug, Clone)]
pub struct CallRecord {
    pub id: i64,
    /// Telephony platform call id.
    pub call_id: String,
    pub caller: String,
    pub called: String,
    #[schema(value_type = String, example = "completed")]
    pub status: CallStatus,
    pub transcript: Option<String>,
    /// Mean speech-stopped-to-first-audio latency across turns, in ms.
    pub avg_response_ms: Option<f64>,
    /// Per-turn race laps (provider, elapsed, won), for observability.
    #[schema(value_type = Object)]
    pub race_history: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, ToSchema)]
pub struct ActiveCallsResponse {
    pub count: usize,
    pub call_ids: Vec<String>,
}

#[derive(Serialize, ToSchema)]
pub struct StatusResponse {
    pub status: String,
    pub active_calls: usize,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_call_status_serialization() {
        assert_eq!(
            serde_json::to_string(&CallStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(
            serde_json::to_string(&CallStatus::Completed).unwrap(),
            "\"completed\""
        );

        let status: CallStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(status, CallStatus::Failed);
    }

    #[test]
    fn test_call_status_display() {
        assert_eq!(CallStatus::InProgress.to_string(), "in_progress");
        assert_eq!(CallStatus::Completed.to_string(), "completed");
        assert_eq!(CallStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn test_call_record_serialization() {
        let record = CallRecord {
            id: 7,
            call_id: "abc-123".to_string(),
            caller: "15550001111".to_string(),
            called: "15550002222".to_string(),
            status: CallStatus::Completed,
            transcript: Some("caller: hi\nagent: hello".to_string()),
            avg_response_ms: Some(912.5),
            race_history: Some(serde_json::json!([
                {"provider": "openrouter/model-a", "elapsed_ms": 912, "won": true}
            ])),
            started_at: Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap(),
            ended_at: Some(Utc.with_ymd_and_hms(2026, 8, 1, 12, 3, 30).unwrap()),
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["call_id"], "abc-123");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["avg_response_ms"], 912.5);
        assert_eq!(json["race_history"][0]["won"], true);
    }
}
