//! Session data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Prefix of every container name; volumes append [`VOLUME_SUFFIX`].
pub const CONTAINER_PREFIX: &str = "berth-";
pub const VOLUME_SUFFIX: &str = "-home";

/// Lifecycle state of a user's session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// A connection has claimed the session and a container is being prepared.
    Provisioning,
    /// A connection owns the session and its terminal is attached.
    Active,
    /// Container stopped, record kept until it expires.
    Parked,
    /// Cleanup has claimed the record and is destroying its resources.
    Expired,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Provisioning => "provisioning",
            SessionState::Active => "active",
            SessionState::Parked => "parked",
            SessionState::Expired => "expired",
        }
    }

    /// States whose `expires_at` must be [`Expiry::Never`].
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Provisioning | SessionState::Active)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "provisioning" => Ok(SessionState::Provisioning),
            "active" => Ok(SessionState::Active),
            "parked" => Ok(SessionState::Parked),
            "expired" => Ok(SessionState::Expired),
            _ => Err(format!("unknown session state: {}", s)),
        }
    }
}

/// When a parked session's resources may be destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "at")]
pub enum Expiry {
    Never,
    At(DateTime<Utc>),
}

impl Expiry {
    const NEVER_MILLIS: i64 = -1;

    pub fn to_millis(self) -> i64 {
        match self {
            Expiry::Never => Self::NEVER_MILLIS,
            Expiry::At(at) => at.timestamp_millis(),
        }
    }

    /// Decode the stored representation. Negative values mean "never".
    pub fn from_millis(millis: i64) -> Option<Self> {
        if millis < 0 {
            return Some(Expiry::Never);
        }
        DateTime::from_timestamp_millis(millis).map(Expiry::At)
    }

    pub fn at(self) -> Option<DateTime<Utc>> {
        match self {
            Expiry::Never => None,
            Expiry::At(at) => Some(at),
        }
    }

    pub fn is_after(self, now: DateTime<Utc>) -> bool {
        match self {
            Expiry::Never => true,
            Expiry::At(at) => at > now,
        }
    }
}

/// The single current session of one user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub user_id: String,
    /// Engine container id, once one has been created.
    pub container_id: Option<String>,
    /// Container name, `berth-<slug>`. The volume name is derived from it.
    pub container_name: String,
    pub lesson_path: String,
    pub lesson_type: String,
    pub state: SessionState,
    pub expires_at: Expiry,
    /// Connection that owns the session. Set only while `Active`.
    pub owner_connection_id: Option<String>,
    /// Bumped on every write; the compare-and-set token.
    pub revision: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl SessionRecord {
    /// Volume mounted into this session's container.
    pub fn volume_name(&self) -> String {
        volume_name_for(&self.container_name)
    }

    /// Check the record-level invariants.
    pub fn check_invariants(&self) -> Result<(), String> {
        if (self.state == SessionState::Active) != self.owner_connection_id.is_some() {
            return Err(format!(
                "owner must be set exactly when active (state {}, owner {:?})",
                self.state, self.owner_connection_id
            ));
        }
        if self.state.is_live() != matches!(self.expires_at, Expiry::Never) {
            return Err(format!(
                "expiry must be never exactly when provisioning or active (state {}, expires {:?})",
                self.state, self.expires_at
            ));
        }
        if self.container_name.is_empty() || self.user_id.is_empty() {
            return Err("user id and container name are required".to_string());
        }
        Ok(())
    }
}

/// Container name for a slug.
pub fn container_name_for(slug: &str) -> String {
    format!("{CONTAINER_PREFIX}{slug}")
}

/// Volume name for a container name.
pub fn volume_name_for(container_name: &str) -> String {
    format!("{container_name}{VOLUME_SUFFIX}")
}

/// Raw row as stored in SQLite.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct SessionRow {
    pub user_id: String,
    pub container_id: Option<String>,
    pub container_name: String,
    pub lesson_path: String,
    pub lesson_type: String,
    pub state: String,
    pub expires_at: i64,
    pub owner_connection_id: Option<String>,
    pub revision: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<SessionRow> for SessionRecord {
    type Error = String;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let state = row.state.parse()?;
        let expires_at = Expiry::from_millis(row.expires_at)
            .ok_or_else(|| format!("expires_at out of range: {}", row.expires_at))?;
        Ok(SessionRecord {
            user_id: row.user_id,
            container_id: row.container_id,
            container_name: row.container_name,
            lesson_path: row.lesson_path,
            lesson_type: row.lesson_type,
            state,
            expires_at,
            owner_connection_id: row.owner_connection_id,
            revision: row.revision,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Fields a transition may change. `None` leaves the field as it was.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub container_id: Option<Option<String>>,
    pub container_name: Option<String>,
    pub lesson_path: Option<String>,
    pub lesson_type: Option<String>,
    pub expires_at: Option<Expiry>,
    pub owner_connection_id: Option<Option<String>>,
}

impl RecordPatch {
    pub fn owner(mut self, connection_id: impl Into<String>) -> Self {
        self.owner_connection_id = Some(Some(connection_id.into()));
        self
    }

    pub fn container(mut self, container_id: Option<String>) -> Self {
        self.container_id = Some(container_id);
        self
    }

    pub fn container_name(mut self, name: impl Into<String>) -> Self {
        self.container_name = Some(name.into());
        self
    }

    pub fn lesson(mut self, path: impl Into<String>, lesson_type: impl Into<String>) -> Self {
        self.lesson_path = Some(path.into());
        self.lesson_type = Some(lesson_type.into());
        self
    }

    pub fn expires(mut self, expiry: Expiry) -> Self {
        self.expires_at = Some(expiry);
        self
    }
}
