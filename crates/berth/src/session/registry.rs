//! Durable user → session mapping with compare-and-set transitions.
//!
//! Every write bumps the row's `revision`; a transition reads the row, checks
//! the caller's expectation, and writes back only if the revision is
//! unchanged. That makes transitions linearizable per user without any
//! process-wide lock.

use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;

use super::models::{Expiry, RecordPatch, SessionRecord, SessionRow, SessionState};
use crate::db::Database;
use crate::retry::Transient;

/// How many times a transition re-reads after losing a write race while the
/// expectation still holds.
const CAS_ATTEMPTS: usize = 3;

const SELECT_COLUMNS: &str = "SELECT user_id, container_id, container_name, lesson_path, \
     lesson_type, state, expires_at, owner_connection_id, revision, created_at, updated_at \
     FROM sessions";

#[derive(Debug, Error)]
pub enum RegistryError {
    /// The record is not in the state the caller expected.
    #[error("session for {user_id} is {found}, expected {expected}")]
    Conflict {
        user_id: String,
        expected: String,
        found: String,
    },

    /// Transient store failure (busy, locked, pool exhausted).
    #[error("session store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),

    #[error("no session for user {0}")]
    NotFound(String),

    /// A stored row could not be decoded.
    #[error("corrupt session record for {user_id}: {reason}")]
    Corrupt { user_id: String, reason: String },

    /// The write would break a record invariant.
    #[error("invalid session record: {0}")]
    Invalid(String),

    #[error("session store error: {0}")]
    Database(#[source] sqlx::Error),
}

impl From<sqlx::Error> for RegistryError {
    fn from(err: sqlx::Error) -> Self {
        if is_transient_sqlx(&err) {
            RegistryError::Unavailable(err)
        } else {
            RegistryError::Database(err)
        }
    }
}

impl Transient for RegistryError {
    fn is_transient(&self) -> bool {
        matches!(self, RegistryError::Unavailable(_))
    }
}

/// SQLite busy/locked errors and pool exhaustion are worth retrying.
pub(crate) fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => {
            let code_busy = matches!(
                db.code().as_deref(),
                Some("5") | Some("6") | Some("261") | Some("262") | Some("517")
            );
            let message = db.message().to_ascii_lowercase();
            code_busy || message.contains("database is locked") || message.contains("busy")
        }
        _ => false,
    }
}

/// What the caller believes the current record looks like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expect {
    /// No record exists for the user.
    Absent,
    /// A record exists in this state.
    State(SessionState),
    /// `Active` and owned by this connection.
    Owner(String),
    /// In `state` and bound to this container.
    Container {
        state: SessionState,
        container_id: String,
    },
}

impl Expect {
    pub fn matches(&self, current: Option<&SessionRecord>) -> bool {
        match (self, current) {
            (Expect::Absent, None) => true,
            (Expect::State(state), Some(rec)) => rec.state == *state,
            (Expect::Owner(conn), Some(rec)) => {
                rec.state == SessionState::Active
                    && rec.owner_connection_id.as_deref() == Some(conn.as_str())
            }
            (
                Expect::Container {
                    state,
                    container_id,
                },
                Some(rec),
            ) => rec.state == *state && rec.container_id.as_deref() == Some(container_id.as_str()),
            _ => false,
        }
    }
}

impl std::fmt::Display for Expect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expect::Absent => f.write_str("absent"),
            Expect::State(state) => write!(f, "{state}"),
            Expect::Owner(conn) => write!(f, "active (owner {conn})"),
            Expect::Container {
                state,
                container_id,
            } => write!(f, "{state} (container {container_id})"),
        }
    }
}

fn describe(current: Option<&SessionRecord>) -> String {
    match current {
        None => "absent".to_string(),
        Some(rec) => match (rec.state, &rec.owner_connection_id) {
            (SessionState::Active, Some(owner)) => format!("active (owner {owner})"),
            (state, _) => state.to_string(),
        },
    }
}

/// Session registry backed by the `sessions` table.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    pool: SqlitePool,
}

impl SessionRegistry {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn lookup(&self, user_id: &str) -> Result<Option<SessionRecord>, RegistryError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!("{SELECT_COLUMNS} WHERE user_id = ?"))
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(decode).transpose()
    }

    /// Find the record bound to a container.
    pub async fn lookup_by_container(
        &self,
        container_id: &str,
    ) -> Result<Option<SessionRecord>, RegistryError> {
        let row =
            sqlx::query_as::<_, SessionRow>(&format!("{SELECT_COLUMNS} WHERE container_id = ?"))
                .bind(container_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(decode).transpose()
    }

    pub async fn list(&self) -> Result<Vec<SessionRecord>, RegistryError> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!("{SELECT_COLUMNS} ORDER BY user_id"))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(decode).collect()
    }

    pub async fn list_by_state(
        &self,
        state: SessionState,
    ) -> Result<Vec<SessionRecord>, RegistryError> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "{SELECT_COLUMNS} WHERE state = ? ORDER BY user_id"
        ))
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(decode).collect()
    }

    /// Create or replace the user's record. Returns the stored record.
    pub async fn upsert(&self, record: &SessionRecord) -> Result<SessionRecord, RegistryError> {
        record.check_invariants().map_err(RegistryError::Invalid)?;
        let now = now_string();

        sqlx::query(
            r#"
            INSERT INTO sessions (
                user_id, container_id, container_name, lesson_path, lesson_type,
                state, expires_at, owner_connection_id, revision, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                container_id = excluded.container_id,
                container_name = excluded.container_name,
                lesson_path = excluded.lesson_path,
                lesson_type = excluded.lesson_type,
                state = excluded.state,
                expires_at = excluded.expires_at,
                owner_connection_id = excluded.owner_connection_id,
                revision = sessions.revision + 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.user_id)
        .bind(&record.container_id)
        .bind(&record.container_name)
        .bind(&record.lesson_path)
        .bind(&record.lesson_type)
        .bind(record.state.as_str())
        .bind(record.expires_at.to_millis())
        .bind(&record.owner_connection_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.lookup(&record.user_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(record.user_id.clone()))
    }

    /// Compare-and-set transition.
    ///
    /// Fails with [`RegistryError::Conflict`] when the current record does not
    /// match `expect`. With [`Expect::Absent`] a new record is inserted and
    /// `patch` must supply the container name and lesson.
    ///
    /// Owner and expiry are normalised for the target state: owner is cleared
    /// outside `Active`, and expiry is `Never` for `Provisioning`/`Active`.
    pub async fn transition(
        &self,
        user_id: &str,
        expect: Expect,
        new_state: SessionState,
        patch: RecordPatch,
    ) -> Result<SessionRecord, RegistryError> {
        for _ in 0..CAS_ATTEMPTS {
            let current = self.lookup(user_id).await?;
            if !expect.matches(current.as_ref()) {
                return Err(RegistryError::Conflict {
                    user_id: user_id.to_string(),
                    expected: expect.to_string(),
                    found: describe(current.as_ref()),
                });
            }

            let now = now_string();
            let next = build_next(user_id, current.as_ref(), new_state, &patch, &now)?;
            next.check_invariants().map_err(RegistryError::Invalid)?;

            let written = match current {
                None => self.insert_if_absent(&next).await?,
                Some(ref cur) => self.update_if_revision(&next, cur.revision).await?,
            };

            if written {
                log::debug!(
                    "session {}: {} -> {} (revision {})",
                    user_id,
                    describe(current.as_ref()),
                    next.state,
                    next.revision
                );
                return Ok(next);
            }

            log::debug!("session {}: lost write race, re-reading", user_id);
        }

        let current = self.lookup(user_id).await?;
        Err(RegistryError::Conflict {
            user_id: user_id.to_string(),
            expected: expect.to_string(),
            found: describe(current.as_ref()),
        })
    }

    /// Delete the user's record unconditionally.
    pub async fn delete(&self, user_id: &str) -> Result<bool, RegistryError> {
        let result = sqlx::query("DELETE FROM sessions WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete the record only if it still matches `expect`.
    pub async fn delete_if(&self, user_id: &str, expect: &Expect) -> Result<bool, RegistryError> {
        let Some(current) = self.lookup(user_id).await? else {
            return Ok(false);
        };
        if !expect.matches(Some(&current)) {
            return Ok(false);
        }

        let result = sqlx::query("DELETE FROM sessions WHERE user_id = ? AND revision = ?")
            .bind(user_id)
            .bind(current.revision)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_if_absent(&self, record: &SessionRecord) -> Result<bool, RegistryError> {
        let result = sqlx::query(
            r#"
            INSERT INTO sessions (
                user_id, container_id, container_name, lesson_path, lesson_type,
                state, expires_at, owner_connection_id, revision, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO NOTHING
            "#,
        )
        .bind(&record.user_id)
        .bind(&record.container_id)
        .bind(&record.container_name)
        .bind(&record.lesson_path)
        .bind(&record.lesson_type)
        .bind(record.state.as_str())
        .bind(record.expires_at.to_millis())
        .bind(&record.owner_connection_id)
        .bind(record.revision)
        .bind(&record.created_at)
        .bind(&record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_if_revision(
        &self,
        record: &SessionRecord,
        expected_revision: i64,
    ) -> Result<bool, RegistryError> {
        let result = sqlx::query(
            r#"
            UPDATE sessions SET
                container_id = ?,
                container_name = ?,
                lesson_path = ?,
                lesson_type = ?,
                state = ?,
                expires_at = ?,
                owner_connection_id = ?,
                revision = ?,
                created_at = ?,
                updated_at = ?
            WHERE user_id = ? AND revision = ?
            "#,
        )
        .bind(&record.container_id)
        .bind(&record.container_name)
        .bind(&record.lesson_path)
        .bind(&record.lesson_type)
        .bind(record.state.as_str())
        .bind(record.expires_at.to_millis())
        .bind(&record.owner_connection_id)
        .bind(record.revision)
        .bind(&record.created_at)
        .bind(&record.updated_at)
        .bind(&record.user_id)
        .bind(expected_revision)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

fn decode(row: SessionRow) -> Result<SessionRecord, RegistryError> {
    let user_id = row.user_id.clone();
    SessionRecord::try_from(row).map_err(|reason| RegistryError::Corrupt { user_id, reason })
}

fn now_string() -> String {
    Utc::now().to_rfc3339()
}

/// Apply `patch` on top of `current` for the target state.
fn build_next(
    user_id: &str,
    current: Option<&SessionRecord>,
    new_state: SessionState,
    patch: &RecordPatch,
    now: &str,
) -> Result<SessionRecord, RegistryError> {
    let missing = |field: &str| RegistryError::Invalid(format!("{field} is required for {user_id}"));

    let container_name = patch
        .container_name
        .clone()
        .or_else(|| current.map(|c| c.container_name.clone()))
        .ok_or_else(|| missing("container name"))?;
    let lesson_path = patch
        .lesson_path
        .clone()
        .or_else(|| current.map(|c| c.lesson_path.clone()))
        .ok_or_else(|| missing("lesson path"))?;
    let lesson_type = patch
        .lesson_type
        .clone()
        .or_else(|| current.map(|c| c.lesson_type.clone()))
        .ok_or_else(|| missing("lesson type"))?;
    let container_id = match &patch.container_id {
        Some(id) => id.clone(),
        None => current.and_then(|c| c.container_id.clone()),
    };

    let owner_connection_id = if new_state == SessionState::Active {
        match &patch.owner_connection_id {
            Some(owner) => owner.clone(),
            None => current.and_then(|c| c.owner_connection_id.clone()),
        }
    } else {
        None
    };

    let expires_at = if new_state.is_live() {
        Expiry::Never
    } else {
        patch
            .expires_at
            .or_else(|| current.map(|c| c.expires_at))
            .unwrap_or(Expiry::Never)
    };

    // An expired record being replaced starts a new session.
    let created_at = match current {
        Some(cur) if cur.state != SessionState::Expired => cur.created_at.clone(),
        _ => now.to_string(),
    };

    Ok(SessionRecord {
        user_id: user_id.to_string(),
        container_id,
        container_name,
        lesson_path,
        lesson_type,
        state: new_state,
        expires_at,
        owner_connection_id,
        revision: current.map(|c| c.revision + 1).unwrap_or(0),
        created_at,
        updated_at: now.to_string(),
    })
}
