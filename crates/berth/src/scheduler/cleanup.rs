//! Cleanup handler fired when a parked session expires.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};

use super::{CleanupPayload, TaskHandler};
use crate::container::ContainerEngine;
use crate::retry::{RetryPolicy, retry_transient};
use crate::session::models::{RecordPatch, SessionState, volume_name_for};
use crate::session::registry::{Expect, RegistryError, SessionRegistry};

/// Destroys an expired session's container, volume, and record.
///
/// The record is first claimed by moving it from `Parked` (with the same
/// container) to `Expired`. A reconnect that claimed it earlier makes the
/// fire a no-op; a reconnect arriving later sees `Expired` and starts fresh.
pub struct SessionCleanup {
    registry: SessionRegistry,
    engine: Arc<dyn ContainerEngine>,
    retry: RetryPolicy,
}

/// Outcome of one cleanup attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Container, volume, and record were removed (each best-effort).
    Reaped,
    /// The record moved on; nothing was touched.
    Skipped,
}

impl SessionCleanup {
    pub fn new(registry: SessionRegistry, engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            registry,
            engine,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Validate live state and destroy the session if it is still parked.
    pub async fn reap(&self, payload: &CleanupPayload) -> Result<CleanupOutcome, RegistryError> {
        let user_id = payload.user_id.as_str();
        let container_id = payload.container_id.as_str();

        let current = retry_transient(self.retry, "cleanup lookup", || {
            self.registry.lookup(user_id)
        })
        .await?;

        let Some(record) = current else {
            debug!("cleanup {}: no record for {}, nothing to do", container_id, user_id);
            return Ok(CleanupOutcome::Skipped);
        };
        if record.container_id.as_deref() != Some(container_id) {
            debug!(
                "cleanup {}: record for {} now uses {:?}, skipping",
                container_id, user_id, record.container_id
            );
            return Ok(CleanupOutcome::Skipped);
        }

        match record.state {
            SessionState::Parked => {
                if record.expires_at.is_after(Utc::now()) {
                    debug!(
                        "cleanup {}: session {} not yet expired ({:?}), skipping",
                        container_id, user_id, record.expires_at
                    );
                    return Ok(CleanupOutcome::Skipped);
                }

                let expect = Expect::Container {
                    state: SessionState::Parked,
                    container_id: container_id.to_string(),
                };
                let claimed = retry_transient(self.retry, "cleanup claim", || {
                    self.registry.transition(
                        user_id,
                        expect.clone(),
                        SessionState::Expired,
                        RecordPatch::default(),
                    )
                })
                .await;
                match claimed {
                    Ok(_) => {}
                    Err(RegistryError::Conflict { found, .. }) => {
                        debug!(
                            "cleanup {}: session {} became {} first, skipping",
                            container_id, user_id, found
                        );
                        return Ok(CleanupOutcome::Skipped);
                    }
                    Err(err) => return Err(err),
                }
            }
            // A previous delivery claimed it and did not finish.
            SessionState::Expired => {}
            state => {
                debug!(
                    "cleanup {}: session {} is {}, skipping",
                    container_id, user_id, state
                );
                return Ok(CleanupOutcome::Skipped);
            }
        }

        self.destroy(payload).await;
        Ok(CleanupOutcome::Reaped)
    }

    /// Remove container, volume, and record. Each step is attempted
    /// independently; failures are logged.
    async fn destroy(&self, payload: &CleanupPayload) {
        let container_id = payload.container_id.as_str();
        let volume = volume_name_for(&payload.container_name);

        match self.engine.remove(container_id).await {
            Ok(()) => debug!("removed container {}", container_id),
            Err(e) if e.is_not_found() => debug!("container {} already gone", container_id),
            Err(e) => warn!("failed to remove container {}: {}", container_id, e),
        }

        match self.engine.remove_volume(&volume).await {
            Ok(()) => debug!("removed volume {}", volume),
            Err(e) if e.is_not_found() => debug!("volume {} already gone", volume),
            Err(e) => warn!("failed to remove volume {}: {}", volume, e),
        }

        let expect = Expect::Container {
            state: SessionState::Expired,
            container_id: container_id.to_string(),
        };
        match retry_transient(self.retry, "cleanup delete", || {
            self.registry.delete_if(&payload.user_id, &expect)
        })
        .await
        {
            Ok(true) => info!(
                "Session for {} expired; container {} and volume {} removed",
                payload.user_id, container_id, volume
            ),
            Ok(false) => debug!("session record for {} already replaced", payload.user_id),
            Err(e) => warn!(
                "failed to delete expired session record for {}: {}",
                payload.user_id, e
            ),
        }
    }
}

#[async_trait]
impl TaskHandler for SessionCleanup {
    async fn handle(&self, key: &str, payload: &CleanupPayload) {
        if key != payload.container_id {
            warn!(
                "cleanup task key {} does not match payload container {}",
                key, payload.container_id
            );
        }
        if let Err(e) = self.reap(payload).await {
            warn!("cleanup for {} failed: {}", payload.user_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerEngine, ContainerSpec};
    use crate::db::Database;
    use crate::session::models::{Expiry, container_name_for};
    use crate::testing::FakeEngine;
    use chrono::Duration;

    struct Fixture {
        engine: Arc<FakeEngine>,
        registry: SessionRegistry,
        cleanup: SessionCleanup,
    }

    async fn fixture() -> Fixture {
        let db = Database::in_memory().await.unwrap();
        let registry = SessionRegistry::new(&db);
        let engine = FakeEngine::new();
        let cleanup = SessionCleanup::new(registry.clone(), engine.clone())
            .with_retry(RetryPolicy::immediate(1));
        Fixture {
            engine,
            registry,
            cleanup,
        }
    }

    /// Create a container and park the user's session on it.
    async fn park(f: &Fixture, expires: Expiry) -> CleanupPayload {
        let name = container_name_for("brave-quiet-otter");
        let volume = volume_name_for(&name);
        f.engine.create_volume(&volume).await.unwrap();
        let id = f
            .engine
            .create(&ContainerSpec {
                image: "berth-ubuntu".to_string(),
                name: name.clone(),
                volume,
                mount_path: "/home/learner".to_string(),
                memory_mb: 32,
                cpu_cores: 1.0,
            })
            .await
            .unwrap();

        f.registry
            .transition(
                "u1",
                Expect::Absent,
                SessionState::Active,
                RecordPatch::default()
                    .owner("c1")
                    .container_name(name.clone())
                    .lesson("intro", "ubuntu")
                    .container(Some(id.clone())),
            )
            .await
            .unwrap();
        f.registry
            .transition(
                "u1",
                Expect::Owner("c1".to_string()),
                SessionState::Parked,
                RecordPatch::default().expires(expires),
            )
            .await
            .unwrap();

        CleanupPayload {
            user_id: "u1".to_string(),
            container_id: id,
            container_name: name,
        }
    }

    fn past() -> Expiry {
        Expiry::At(Utc::now() - Duration::seconds(5))
    }

    #[tokio::test]
    async fn test_expired_session_is_destroyed() {
        let f = fixture().await;
        let payload = park(&f, past()).await;

        assert_eq!(f.cleanup.reap(&payload).await.unwrap(), CleanupOutcome::Reaped);
        assert!(f.engine.containers().is_empty());
        assert!(f.engine.volumes().is_empty());
        assert!(f.registry.lookup("u1").await.unwrap().is_none());
        assert_eq!(f.engine.count_calls("remove "), 1);
        assert_eq!(f.engine.count_calls("remove_volume"), 1);

        // A second delivery finds nothing to do.
        assert_eq!(f.cleanup.reap(&payload).await.unwrap(), CleanupOutcome::Skipped);
        assert_eq!(f.engine.count_calls("remove "), 1);
    }

    #[tokio::test]
    async fn test_not_yet_expired_is_skipped() {
        let f = fixture().await;
        let payload = park(&f, Expiry::At(Utc::now() + Duration::hours(1))).await;

        assert_eq!(f.cleanup.reap(&payload).await.unwrap(), CleanupOutcome::Skipped);
        assert_eq!(f.engine.containers().len(), 1);
        assert_eq!(
            f.registry.lookup("u1").await.unwrap().unwrap().state,
            SessionState::Parked
        );
    }

    #[tokio::test]
    async fn test_reclaimed_session_is_skipped() {
        let f = fixture().await;
        let payload = park(&f, past()).await;
        f.registry
            .transition(
                "u1",
                Expect::State(SessionState::Parked),
                SessionState::Active,
                RecordPatch::default().owner("c2"),
            )
            .await
            .unwrap();

        assert_eq!(f.cleanup.reap(&payload).await.unwrap(), CleanupOutcome::Skipped);
        assert_eq!(f.engine.containers().len(), 1);
        assert_eq!(f.engine.volumes().len(), 1);
    }

    #[tokio::test]
    async fn test_different_container_is_skipped() {
        let f = fixture().await;
        let mut payload = park(&f, past()).await;
        payload.container_id = "c9999".to_string();

        assert_eq!(f.cleanup.reap(&payload).await.unwrap(), CleanupOutcome::Skipped);
        assert!(f.registry.lookup("u1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_interrupted_cleanup_finishes_on_redelivery() {
        let f = fixture().await;
        let payload = park(&f, past()).await;
        f.registry
            .transition(
                "u1",
                Expect::State(SessionState::Parked),
                SessionState::Expired,
                RecordPatch::default(),
            )
            .await
            .unwrap();

        assert_eq!(f.cleanup.reap(&payload).await.unwrap(), CleanupOutcome::Reaped);
        assert!(f.registry.lookup("u1").await.unwrap().is_none());
        assert!(f.engine.containers().is_empty());
    }

    #[tokio::test]
    async fn test_missing_container_still_deletes_record() {
        let f = fixture().await;
        let payload = park(&f, past()).await;
        f.engine.forget_container(&payload.container_id);

        f.cleanup
            .handle(&payload.container_id, &payload)
            .await;
        assert!(f.registry.lookup("u1").await.unwrap().is_none());
        assert!(f.engine.volumes().is_empty());
    }
}
