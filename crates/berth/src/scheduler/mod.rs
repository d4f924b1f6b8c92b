//! Durable deferred cleanup tasks.
//!
//! Tasks live in the `scheduled_tasks` table, one row per key. A poller scans
//! for due rows on a coarse interval and hands each to the registered
//! [`TaskHandler`]. Delivery is at-least-once: a row is deleted only after its
//! handler returns, so a crash in between redelivers it. Handlers must
//! re-validate live state before acting.
//!
//! Every `schedule` call stamps the row with a fresh token. Completion deletes
//! by key *and* token, so a task re-scheduled while its previous incarnation
//! was being handled is never lost.

mod cleanup;

pub use cleanup::SessionCleanup;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::retry::Transient;
use crate::session::registry::is_transient_sqlx;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),

    #[error("task store error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("invalid task payload for {key}: {source}")]
    Payload {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("fire time out of range for {0}")]
    FireTime(String),

    #[error("no task handler registered")]
    NoHandler,
}

impl From<sqlx::Error> for SchedulerError {
    fn from(err: sqlx::Error) -> Self {
        if is_transient_sqlx(&err) {
            SchedulerError::Unavailable(err)
        } else {
            SchedulerError::Database(err)
        }
    }
}

impl Transient for SchedulerError {
    fn is_transient(&self) -> bool {
        matches!(self, SchedulerError::Unavailable(_))
    }
}

/// What a cleanup task needs to find and destroy its session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupPayload {
    pub user_id: String,
    pub container_id: String,
    pub container_name: String,
}

/// A pending task.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTask {
    pub key: String,
    pub fire_at: DateTime<Utc>,
    pub payload: CleanupPayload,
    /// Identifies this incarnation of the task.
    pub token: String,
    /// How many times delivery has been attempted.
    pub attempts: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    task_key: String,
    fire_at: i64,
    payload: String,
    token: String,
    attempts: i64,
}

impl TryFrom<TaskRow> for ScheduledTask {
    type Error = SchedulerError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let payload = serde_json::from_str(&row.payload).map_err(|source| SchedulerError::Payload {
            key: row.task_key.clone(),
            source,
        })?;
        let fire_at = DateTime::from_timestamp_millis(row.fire_at)
            .ok_or_else(|| SchedulerError::FireTime(row.task_key.clone()))?;
        Ok(ScheduledTask {
            key: row.task_key,
            fire_at,
            payload,
            token: row.token,
            attempts: row.attempts,
        })
    }
}

/// Invoked once per due task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, key: &str, payload: &CleanupPayload);
}

/// Scheduler over the `scheduled_tasks` table.
#[derive(Clone)]
pub struct ExpiryScheduler {
    pool: SqlitePool,
    handler: Arc<RwLock<Option<Arc<dyn TaskHandler>>>>,
    batch_size: u32,
}

impl std::fmt::Debug for ExpiryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiryScheduler")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl ExpiryScheduler {
    pub fn new(db: &Database, batch_size: u32) -> Self {
        Self {
            pool: db.pool().clone(),
            handler: Arc::new(RwLock::new(None)),
            batch_size: batch_size.max(1),
        }
    }

    /// Register the handler invoked for due tasks. Replaces any previous one.
    pub fn on_fire(&self, handler: Arc<dyn TaskHandler>) {
        let mut slot = self.handler.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(handler);
    }

    fn current_handler(&self) -> Option<Arc<dyn TaskHandler>> {
        self.handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Schedule a task, replacing any existing task for `key`.
    /// Returns the token of the new incarnation.
    pub async fn schedule(
        &self,
        key: &str,
        fire_at: DateTime<Utc>,
        payload: &CleanupPayload,
    ) -> Result<String, SchedulerError> {
        let body = serde_json::to_string(payload).map_err(|source| SchedulerError::Payload {
            key: key.to_string(),
            source,
        })?;
        let token = uuid::Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO scheduled_tasks (task_key, fire_at, payload, token, attempts, created_at)
            VALUES (?, ?, ?, ?, 0, ?)
            ON CONFLICT(task_key) DO UPDATE SET
                fire_at = excluded.fire_at,
                payload = excluded.payload,
                token = excluded.token,
                attempts = 0,
                created_at = excluded.created_at
            "#,
        )
        .bind(key)
        .bind(fire_at.timestamp_millis())
        .bind(&body)
        .bind(&token)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!("scheduled task {} at {}", key, fire_at);
        Ok(token)
    }

    /// Cancel the task for `key`. Returns whether one was pending.
    pub async fn cancel(&self, key: &str) -> Result<bool, SchedulerError> {
        let result = sqlx::query("DELETE FROM scheduled_tasks WHERE task_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        let cancelled = result.rows_affected() > 0;
        if cancelled {
            debug!("cancelled task {}", key);
        }
        Ok(cancelled)
    }

    pub async fn get(&self, key: &str) -> Result<Option<ScheduledTask>, SchedulerError> {
        let row = sqlx::query_as::<_, TaskRow>(
            "SELECT task_key, fire_at, payload, token, attempts FROM scheduled_tasks WHERE task_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ScheduledTask::try_from).transpose()
    }

    pub async fn list(&self) -> Result<Vec<ScheduledTask>, SchedulerError> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT task_key, fire_at, payload, token, attempts FROM scheduled_tasks ORDER BY fire_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ScheduledTask::try_from).collect()
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<TaskRow>, SchedulerError> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT task_key, fire_at, payload, token, attempts
            FROM scheduled_tasks
            WHERE fire_at <= ?
            ORDER BY fire_at
            LIMIT ?
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(i64::from(self.batch_size))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Deliver every task due at `now`. Returns how many tasks were consumed.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let handler = self.current_handler().ok_or(SchedulerError::NoHandler)?;
        let mut consumed = 0;

        loop {
            let rows = self.due(now).await?;
            if rows.is_empty() {
                break;
            }
            let batch_len = rows.len();

            for row in rows {
                let key = row.task_key.clone();
                let token = row.token.clone();

                sqlx::query(
                    "UPDATE scheduled_tasks SET attempts = attempts + 1 WHERE task_key = ? AND token = ?",
                )
                .bind(&key)
                .bind(&token)
                .execute(&self.pool)
                .await?;

                match ScheduledTask::try_from(row) {
                    Ok(task) => {
                        debug!(
                            "firing task {} (attempt {}, due {})",
                            task.key,
                            task.attempts + 1,
                            task.fire_at
                        );
                        handler.handle(&task.key, &task.payload).await;
                    }
                    Err(err) => warn!("discarding unreadable task {}: {}", key, err),
                }

                // Consumed regardless of handler outcome.
                let result =
                    sqlx::query("DELETE FROM scheduled_tasks WHERE task_key = ? AND token = ?")
                        .bind(&key)
                        .bind(&token)
                        .execute(&self.pool)
                        .await?;
                if result.rows_affected() == 0 {
                    debug!("task {} was re-scheduled while firing; keeping new one", key);
                }
                consumed += 1;
            }

            if batch_len < self.batch_size as usize {
                break;
            }
        }

        Ok(consumed)
    }

    /// Start the background poller. Stops when `shutdown` is cancelled.
    pub fn spawn_poller(
        &self,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        info!("Starting expiry scheduler (poll every {:?})", poll_interval);
        let scheduler = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                match scheduler.run_due(Utc::now()).await {
                    Ok(0) => {}
                    Ok(n) => info!("Expiry scheduler consumed {} task(s)", n),
                    Err(e) => warn!("Expiry scheduler pass failed: {}", e),
                }
            }

            info!("Expiry scheduler stopped");
        })
    }
}
