//! Data Access Layer
//!
//! All PostgreSQL access for the gateway. Call logging is strictly
//! observability: callers treat failures here as log-and-continue, a broken
//! database must never affect a live call.

use anyhow::Result;
use sqlx::PgPool;
use voicegate_core::RaceLap;

use crate::models::{CallRecord, CallStatus};

/// A wrapper around the `PgPool` to provide a clear data access interface.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Creates a new `Db` instance.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Records an answered call. A repeated call id resets the row, matching
    /// the registry's force-close-then-create behavior.
    pub async fn log_call_start(&self, call_id: &str, caller: &str, called: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO calls (call_id, caller, called, status)
            VALUES ($1, $2, $3, 'in_progress')
            ON CONFLICT (call_id) DO UPDATE SET
                caller = EXCLUDED.caller,
                called = EXCLUDED.called,
                status = 'in_progress',
                started_at = now(),
                ended_at = NULL,
                transcript = NULL,
                avg_response_ms = NULL,
                race_history = NULL
            "#,
        )
        .bind(call_id)
        .bind(caller)
        .bind(called)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Completes a call's record with its transcript and latency stats.
    pub async fn log_call_end(
        &self,
        call_id: &str,
        status: CallStatus,
        transcript: Option<&str>,
        avg_response_ms: Option<f64>,
        race_history: &[RaceLap],
    ) -> Result<()> {
        let history = if race_history.is_empty() {
            None
        } else {
            Some(serde_json::to_value(race_history)?)
        };
        sqlx::query(
            r#"
            UPDATE calls SET
                status = $2,
                ended_at = now(),
                transcript = $3,
                avg_response_ms = $4,
                race_history = $5
            WHERE call_id = $1
            "#,
        )
        .bind(call_id)
        .bind(status)
        .bind(transcript)
        .bind(avg_response_ms)
        .bind(history)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent calls, newest first.
    pub async fn recent_calls(&self, limit: i64) -> Result<Vec<CallRecord>> {
        let records = sqlx::query_as::<_, CallRecord>(
            r#"
            SELECT id, call_id, caller, called, status, transcript,
                   avg_response_ms, race_history, started_at, ended_at
            FROM calls
            ORDER BY started_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}
