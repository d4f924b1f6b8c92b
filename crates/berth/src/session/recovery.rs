//! Startup reconciliation of the registry against the engine.
//!
//! No connection survives a restart, so anything still `Active` is parked,
//! parked containers are stopped and their cleanup re-armed, and half-finished
//! cleanups are driven to completion.

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, info, warn};

use super::coordinator::SessionManager;
use super::models::{SessionRecord, SessionState};
use super::registry::Expect;
use crate::retry::retry_transient;
use crate::scheduler::{CleanupPayload, SessionCleanup};

/// What startup recovery did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Orphaned live sessions that were parked.
    pub parked: usize,
    /// Parked containers found running and stopped.
    pub stopped: usize,
    /// Cleanup tasks re-armed for parked sessions.
    pub rescheduled: usize,
    /// Interrupted cleanups finished.
    pub reaped: usize,
    /// Records without a container that were dropped.
    pub deleted: usize,
}

impl SessionManager {
    /// Reconcile persisted sessions. Call once before accepting connections.
    pub async fn startup_recovery(&self) -> Result<RecoveryReport> {
        info!("Running startup recovery...");
        let records = retry_transient(self.retry_policy(), "list sessions", || {
            self.registry().list()
        })
        .await
        .context("listing sessions")?;

        let mut report = RecoveryReport::default();
        for record in records {
            match record.state {
                SessionState::Active | SessionState::Provisioning => {
                    self.recover_live(&record, &mut report).await
                }
                SessionState::Parked => self.recover_parked(&record, &mut report).await,
                SessionState::Expired => self.recover_expired(&record, &mut report).await,
            }
        }

        info!(
            "Startup recovery complete: {} parked, {} stopped, {} rescheduled, {} reaped, {} deleted",
            report.parked, report.stopped, report.rescheduled, report.reaped, report.deleted
        );
        Ok(report)
    }

    async fn recover_live(&self, record: &SessionRecord, report: &mut RecoveryReport) {
        let expect = match &record.owner_connection_id {
            Some(owner) => Expect::Owner(owner.clone()),
            None => Expect::State(record.state),
        };

        let Some(container_id) = record.container_id.as_deref() else {
            self.drop_record(record, &expect, report).await;
            return;
        };

        if let Err(e) = self
            .engine()
            .stop(container_id, self.config().stop_grace_seconds)
            .await
        {
            debug!("stopping orphaned container {}: {}", container_id, e);
        }

        let expires_at = Utc::now() + self.lifetime_delta();
        match self
            .park(
                &record.user_id,
                expect,
                container_id,
                &record.container_name,
                expires_at,
            )
            .await
        {
            Ok(()) => {
                info!(
                    "Parked orphaned session of {} ({})",
                    record.user_id, record.container_name
                );
                report.parked += 1;
            }
            Err(e) => warn!(
                "failed to park orphaned session of {}: {}",
                record.user_id, e
            ),
        }
    }

    async fn recover_parked(&self, record: &SessionRecord, report: &mut RecoveryReport) {
        let Some(container_id) = record.container_id.as_deref() else {
            self.drop_record(record, &Expect::State(SessionState::Parked), report)
                .await;
            return;
        };

        match self.engine().container_state(container_id).await {
            Ok(state) if state.is_running() => {
                match self
                    .engine()
                    .stop(container_id, self.config().stop_grace_seconds)
                    .await
                {
                    Ok(()) => report.stopped += 1,
                    Err(e) => warn!("failed to stop parked container {}: {}", container_id, e),
                }
            }
            Ok(_) => {}
            Err(e) => debug!("could not inspect {}: {}", container_id, e),
        }

        let Some(fire_at) = record.expires_at.at() else {
            warn!("parked session of {} has no expiry", record.user_id);
            return;
        };
        let payload = CleanupPayload {
            user_id: record.user_id.clone(),
            container_id: container_id.to_string(),
            container_name: record.container_name.clone(),
        };
        match retry_transient(self.retry_policy(), "reschedule cleanup", || {
            self.scheduler().schedule(container_id, fire_at, &payload)
        })
        .await
        {
            Ok(_) => report.rescheduled += 1,
            Err(e) => warn!("failed to reschedule cleanup of {}: {}", container_id, e),
        }
    }

    async fn recover_expired(&self, record: &SessionRecord, report: &mut RecoveryReport) {
        let Some(container_id) = record.container_id.as_deref() else {
            self.drop_record(record, &Expect::State(SessionState::Expired), report)
                .await;
            return;
        };

        let cleanup = SessionCleanup::new(self.registry().clone(), self.engine().clone())
            .with_retry(self.retry_policy());
        let payload = CleanupPayload {
            user_id: record.user_id.clone(),
            container_id: container_id.to_string(),
            container_name: record.container_name.clone(),
        };
        match cleanup.reap(&payload).await {
            Ok(_) => report.reaped += 1,
            Err(e) => warn!("failed to finish cleanup of {}: {}", record.user_id, e),
        }
    }

    async fn drop_record(&self, record: &SessionRecord, expect: &Expect, report: &mut RecoveryReport) {
        match self.registry().delete_if(&record.user_id, expect).await {
            Ok(true) => {
                info!(
                    "Dropped {} session of {} without a container",
                    record.state, record.user_id
                );
                report.deleted += 1;
            }
            Ok(false) => {}
            Err(e) => warn!("failed to drop session of {}: {}", record.user_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::container::{ContainerEngine, ContainerSpec, ContainerState};
    use crate::db::Database;
    use crate::retry::RetryPolicy;
    use crate::scheduler::ExpiryScheduler;
    use crate::session::models::{Expiry, RecordPatch, container_name_for, volume_name_for};
    use crate::session::registry::SessionRegistry;
    use crate::settings::SandboxConfig;
    use crate::testing::{FakeEngine, FakeSpawner};
    use chrono::TimeDelta;
    use tokio_util::sync::CancellationToken;

    async fn manager() -> (SessionManager, Arc<FakeEngine>) {
        let db = Database::in_memory().await.unwrap();
        let engine = FakeEngine::new();
        let manager = SessionManager::new(
            SessionRegistry::new(&db),
            ExpiryScheduler::new(&db, 16),
            engine.clone(),
            FakeSpawner::new(),
            Arc::new(SandboxConfig::default()),
            CancellationToken::new(),
        )
        .with_retry(RetryPolicy::immediate(1));
        (manager, engine)
    }

    async fn container(engine: &FakeEngine, slug: &str) -> String {
        let name = container_name_for(slug);
        engine.create_volume(&volume_name_for(&name)).await.unwrap();
        let id = engine
            .create(&ContainerSpec {
                image: "berth-ubuntu".to_string(),
                name: name.clone(),
                volume: volume_name_for(&name),
                mount_path: "/home/learner".to_string(),
                memory_mb: 32,
                cpu_cores: 1.0,
            })
            .await
            .unwrap();
        engine.start(&id).await.unwrap();
        id
    }

    async fn active(m: &SessionManager, user: &str, slug: &str, container_id: Option<String>) {
        m.registry()
            .transition(
                user,
                Expect::Absent,
                SessionState::Active,
                RecordPatch::default()
                    .owner("gone")
                    .container_name(container_name_for(slug))
                    .lesson("intro", "ubuntu")
                    .container(container_id),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_orphaned_active_session_is_parked() {
        let (m, engine) = manager().await;
        let id = container(&engine, "brave-quiet-otter").await;
        active(&m, "u1", "brave-quiet-otter", Some(id.clone())).await;

        let report = m.startup_recovery().await.unwrap();
        assert_eq!(report.parked, 1);

        let rec = m.registry().lookup("u1").await.unwrap().unwrap();
        assert_eq!(rec.state, SessionState::Parked);
        assert_eq!(engine.container(&id).unwrap().state, ContainerState::Exited);
        assert!(m.scheduler().get(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_running_parked_container_is_stopped_and_rescheduled() {
        let (m, engine) = manager().await;
        let id = container(&engine, "brave-quiet-otter").await;
        active(&m, "u1", "brave-quiet-otter", Some(id.clone())).await;
        let expires = Expiry::from_millis((Utc::now() + TimeDelta::minutes(30)).timestamp_millis())
            .unwrap();
        m.registry()
            .transition(
                "u1",
                Expect::Owner("gone".to_string()),
                SessionState::Parked,
                RecordPatch::default().expires(expires),
            )
            .await
            .unwrap();

        let report = m.startup_recovery().await.unwrap();
        assert_eq!(report.stopped, 1);
        assert_eq!(report.rescheduled, 1);
        let task = m.scheduler().get(&id).await.unwrap().unwrap();
        assert_eq!(Expiry::At(task.fire_at), expires);

        // Running it again changes nothing but the task token.
        let again = m.startup_recovery().await.unwrap();
        assert_eq!(again.stopped, 0);
        assert_eq!(m.scheduler().list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_interrupted_cleanup_is_finished() {
        let (m, engine) = manager().await;
        let id = container(&engine, "brave-quiet-otter").await;
        active(&m, "u1", "brave-quiet-otter", Some(id.clone())).await;
        m.registry()
            .transition(
                "u1",
                Expect::Owner("gone".to_string()),
                SessionState::Parked,
                RecordPatch::default().expires(Expiry::At(Utc::now())),
            )
            .await
            .unwrap();
        m.registry()
            .transition(
                "u1",
                Expect::State(SessionState::Parked),
                SessionState::Expired,
                RecordPatch::default(),
            )
            .await
            .unwrap();

        let report = m.startup_recovery().await.unwrap();
        assert_eq!(report.reaped, 1);
        assert!(m.registry().lookup("u1").await.unwrap().is_none());
        assert!(engine.containers().is_empty());
        assert!(engine.volumes().is_empty());
    }

    #[tokio::test]
    async fn test_session_without_container_is_dropped() {
        let (m, _engine) = manager().await;
        active(&m, "u1", "brave-quiet-otter", None).await;

        let report = m.startup_recovery().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(m.registry().lookup("u1").await.unwrap().is_none());
    }
}
