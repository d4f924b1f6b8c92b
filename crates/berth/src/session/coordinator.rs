//! Per-connection session state machine.
//!
//! Each connection runs one [`Coordinator`]:
//! `Uninitialized -> Initialized -> Provisioning -> Attached -> Terminated`.
//! Coordinators never share mutable state. Everything that crosses
//! connections goes through the registry's compare-and-set transitions, the
//! scheduler, and the [`ConnectionHub`] for takeover notices.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use berth_protocol::{ClientEvent, InitPayload, ServerEvent};
use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::hub::{ConnectionHandle, ConnectionHub, Takeover};
use super::models::{Expiry, RecordPatch, SessionRecord, SessionState, container_name_for};
use super::provisioner::{ProvisionError, Provisioner};
use super::registry::{Expect, RegistryError, SessionRegistry};
use crate::bridge::{BridgeError, TtyBridge, TtySpawner};
use crate::container::ContainerEngine;
use crate::retry::{RetryPolicy, retry_transient};
use crate::scheduler::{CleanupPayload, ExpiryScheduler, SessionCleanup};
use crate::settings::SandboxConfig;
use crate::wordlist::generate_slug;

pub const STATUS_SPAWNING: &str = "Spawning Sandbox Instance...";
pub const STATUS_CONNECTING: &str = "Connecting to Sandbox Instance...";
pub const STATUS_CONNECTED: &str = "Connected.";
pub const NEW_SESSION_NOTICE: &str =
    "This sandbox was opened in another window. This session has been closed.";

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("could not start sandbox: {0}")]
    Provision(#[from] ProvisionError),

    #[error("session for {0} is held by another connection")]
    Conflict(String),

    #[error("session store unavailable: {0}")]
    RegistryUnavailable(#[source] RegistryError),

    #[error("{0}")]
    Protocol(String),

    #[error("could not attach terminal: {0}")]
    Bridge(#[from] BridgeError),

    #[error("connection closed during setup")]
    Cancelled,
}

impl From<RegistryError> for SetupError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Conflict { user_id, .. } => SetupError::Conflict(user_id),
            other => SetupError::RegistryUnavailable(other),
        }
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Uninitialized,
    Initialized,
    Provisioning,
    Attached,
    Terminated,
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnState::Uninitialized => "uninitialized",
            ConnState::Initialized => "initialized",
            ConnState::Provisioning => "provisioning",
            ConnState::Attached => "attached",
            ConnState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// What `init` bound the connection to.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    init: InitPayload,
    user_id: String,
    lesson_path: String,
    lesson_type: String,
}

/// Where a claimed record came from, for rolling the claim back.
#[derive(Debug, Clone, PartialEq)]
enum ClaimOrigin {
    /// Inserted, or replaced an expired or half-provisioned record.
    Fresh,
    /// Was parked with this expiry.
    Parked {
        container_id: Option<String>,
        expires_at: Expiry,
    },
    /// Was active under a connection that is gone.
    Stale { container_id: Option<String> },
}

/// The session this connection owns.
#[derive(Debug, Clone)]
struct OwnedSession {
    user_id: String,
    container_id: Option<String>,
    container_name: String,
}

/// Shared services behind every connection.
pub struct SessionManager {
    registry: SessionRegistry,
    scheduler: ExpiryScheduler,
    provisioner: Provisioner,
    engine: Arc<dyn ContainerEngine>,
    spawner: Arc<dyn TtySpawner>,
    hub: ConnectionHub,
    config: Arc<SandboxConfig>,
    retry: RetryPolicy,
    shutdown: CancellationToken,
}

impl SessionManager {
    /// Wire the services together and register the cleanup handler.
    pub fn new(
        registry: SessionRegistry,
        scheduler: ExpiryScheduler,
        engine: Arc<dyn ContainerEngine>,
        spawner: Arc<dyn TtySpawner>,
        config: Arc<SandboxConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        scheduler.on_fire(Arc::new(SessionCleanup::new(
            registry.clone(),
            engine.clone(),
        )));
        let provisioner = Provisioner::new(engine.clone(), registry.clone(), config.clone());
        Self {
            registry,
            scheduler,
            provisioner,
            engine,
            spawner,
            hub: ConnectionHub::new(shutdown.clone()),
            config,
            retry: RetryPolicy::default(),
            shutdown,
        }
    }

    /// Override the retry policy for registry and scheduler calls.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self.provisioner = self.provisioner.with_retry(retry);
        self.scheduler.on_fire(Arc::new(
            SessionCleanup::new(self.registry.clone(), self.engine.clone()).with_retry(retry),
        ));
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &ExpiryScheduler {
        &self.scheduler
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub fn hub(&self) -> &ConnectionHub {
        &self.hub
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Accept a connection. Returns its coordinator and the stream of events
    /// for the client.
    pub fn open(self: &Arc<Self>) -> (Coordinator, mpsc::Receiver<ServerEvent>) {
        let (handle, outbound) = self.hub.register();
        debug!("Accepted connection {}", handle.connection_id);
        let coordinator = Coordinator {
            manager: self.clone(),
            handle,
            state: ConnState::Uninitialized,
            binding: None,
            session: None,
            bridge: None,
        };
        (coordinator, outbound)
    }

    /// Cancel every connection and wait for them to park their sessions.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.cancel();
        let drained = self.hub.drain(timeout).await;
        if !drained {
            warn!(
                "{} connection(s) still tearing down after {:?}",
                self.hub.len(),
                timeout
            );
        }
        drained
    }

    pub(crate) fn lifetime_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.config.container_lifetime).unwrap_or(TimeDelta::hours(1))
    }

    /// Move `user_id`'s record from `expect` to Parked and schedule its cleanup.
    pub(crate) async fn park(
        &self,
        user_id: &str,
        expect: Expect,
        container_id: &str,
        container_name: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        retry_transient(self.retry, "park session", || {
            self.registry.transition(
                user_id,
                expect.clone(),
                SessionState::Parked,
                RecordPatch::default().expires(Expiry::At(expires_at)),
            )
        })
        .await?;

        self.schedule_cleanup(user_id, container_id, container_name, expires_at)
            .await;
        Ok(())
    }

    /// Arm the cleanup task for `container_id`, replacing any earlier one.
    pub(crate) async fn schedule_cleanup(
        &self,
        user_id: &str,
        container_id: &str,
        container_name: &str,
        expires_at: DateTime<Utc>,
    ) -> bool {
        let payload = CleanupPayload {
            user_id: user_id.to_string(),
            container_id: container_id.to_string(),
            container_name: container_name.to_string(),
        };
        match retry_transient(self.retry, "schedule cleanup", || {
            self.scheduler.schedule(container_id, expires_at, &payload)
        })
        .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    "failed to schedule cleanup of {} for {}: {}",
                    container_id, user_id, e
                );
                false
            }
        }
    }
}

/// One connection's state machine.
pub struct Coordinator {
    manager: Arc<SessionManager>,
    handle: ConnectionHandle,
    state: ConnState,
    binding: Option<Binding>,
    session: Option<OwnedSession>,
    bridge: Option<TtyBridge>,
}

impl Coordinator {
    pub fn connection_id(&self) -> &str {
        &self.handle.connection_id
    }

    /// Fire this to disconnect.
    pub fn cancel_token(&self) -> CancellationToken {
        self.handle.cancel.clone()
    }

    /// Fires once the connection has torn down.
    pub fn terminated(&self) -> CancellationToken {
        self.handle.terminated.clone()
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Sender for events to this connection's client.
    pub fn outbound(&self) -> mpsc::Sender<ServerEvent> {
        self.handle.outbound.clone()
    }

    /// Drive the connection until disconnect, takeover or shell exit, then
    /// tear down.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<ClientEvent>) {
        let cancel = self.handle.cancel.clone();
        let superseded = self.handle.superseded.clone();

        loop {
            let closed = self.bridge.as_ref().map(TtyBridge::closed);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("connection {} cancelled", self.handle.connection_id);
                    break;
                }
                _ = superseded.cancelled() => {
                    info!("connection {} superseded", self.handle.connection_id);
                    break;
                }
                _ = wait_closed(closed.as_ref()) => {
                    info!("terminal of connection {} closed", self.handle.connection_id);
                    break;
                }
                event = inbound.recv() => match event {
                    Some(event) => {
                        if self.handle_event(event).await.is_break() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        self.terminate().await;
    }

    async fn handle_event(&mut self, event: ClientEvent) -> ControlFlow<()> {
        match event {
            ClientEvent::Init(payload) => {
                if let Err(e) = self.on_init(payload) {
                    self.send(ServerEvent::error(e.to_string()));
                }
                ControlFlow::Continue(())
            }
            ClientEvent::Ready => match self.on_ready().await {
                Ok(()) => ControlFlow::Continue(()),
                Err(SetupError::Protocol(message)) => {
                    self.send(ServerEvent::error(message));
                    ControlFlow::Continue(())
                }
                Err(SetupError::Cancelled) => ControlFlow::Break(()),
                Err(e) => {
                    warn!(
                        "setup failed for connection {}: {}",
                        self.handle.connection_id, e
                    );
                    self.send(ServerEvent::error(e.to_string()));
                    ControlFlow::Break(())
                }
            },
            ClientEvent::Stdin(bytes) => {
                match (&self.bridge, self.state) {
                    (Some(bridge), ConnState::Attached) => {
                        if let Err(e) = bridge.send_input(bytes) {
                            debug!("dropping input: {}", e);
                        }
                    }
                    _ => debug!(
                        "ignoring {} input bytes while {}",
                        bytes.len(),
                        self.state
                    ),
                }
                ControlFlow::Continue(())
            }
        }
    }

    fn on_init(&mut self, init: InitPayload) -> Result<(), SetupError> {
        match self.state {
            ConnState::Uninitialized => {}
            ConnState::Initialized => {
                return match &self.binding {
                    Some(binding) if binding.init == init => Ok(()),
                    _ => Err(SetupError::Protocol(
                        "already initialized with a different session".to_string(),
                    )),
                };
            }
            state => {
                return Err(SetupError::Protocol(format!(
                    "init is not allowed while {state}"
                )));
            }
        }

        let user_id = init.user.uid.trim().to_string();
        let lesson_path = init.path.trim().to_string();
        if user_id.is_empty() || lesson_path.is_empty() {
            return Err(SetupError::Protocol(
                "init requires a user id and a lesson path".to_string(),
            ));
        }
        let lesson_type = self
            .manager
            .config
            .lessons
            .resolve(&lesson_path, init.lesson_type.as_deref());

        info!(
            "Connection {} bound to user {} (lesson {}, type {})",
            self.handle.connection_id, user_id, lesson_path, lesson_type
        );
        self.binding = Some(Binding {
            init,
            user_id,
            lesson_path,
            lesson_type,
        });
        self.state = ConnState::Initialized;
        Ok(())
    }

    async fn on_ready(&mut self) -> Result<(), SetupError> {
        let binding = match (self.state, &self.binding) {
            (ConnState::Initialized, Some(binding)) => binding.clone(),
            (ConnState::Uninitialized, _) => {
                return Err(SetupError::Protocol("ready received before init".to_string()));
            }
            (state, _) => {
                return Err(SetupError::Protocol(format!(
                    "ready is not allowed while {state}"
                )));
            }
        };
        let manager = self.manager.clone();
        let me = self.handle.connection_id.clone();

        self.state = ConnState::Provisioning;
        self.send(ServerEvent::status(STATUS_SPAWNING));

        let (claimed, origin) = self.claim(&binding).await?;
        if self.interrupted() {
            self.rollback(&binding.user_id, &claimed, origin).await;
            return Err(SetupError::Cancelled);
        }

        // A reused container must not be destroyed by its pending cleanup
        // after it was started again.
        if let ClaimOrigin::Parked {
            container_id: Some(container_id),
            ..
        } = &origin
        {
            match retry_transient(manager.retry, "cancel cleanup", || {
                manager.scheduler.cancel(container_id)
            })
            .await
            {
                Ok(true) => debug!("cancelled pending cleanup of {}", container_id),
                Ok(false) => {}
                Err(e) => warn!("failed to cancel cleanup of {}: {}", container_id, e),
            }
        }

        let provisioned = match manager
            .provisioner
            .ensure_container(&binding.user_id, &binding.lesson_type)
            .await
        {
            Ok(p) => p,
            Err(e) => {
                self.rollback(&binding.user_id, &claimed, origin).await;
                return Err(e.into());
            }
        };

        let commit = retry_transient(manager.retry, "commit session", || {
            manager.registry.transition(
                &binding.user_id,
                Expect::Owner(me.clone()),
                SessionState::Active,
                RecordPatch::default()
                    .container(Some(provisioned.container_id.clone()))
                    .container_name(provisioned.container_name.clone())
                    .lesson(binding.lesson_path.clone(), binding.lesson_type.clone()),
            )
        })
        .await;
        if let Err(e) = commit {
            if provisioned.reused {
                if self
                    .held_elsewhere(&binding.user_id, &provisioned.container_id)
                    .await
                {
                    info!(
                        "container {} now belongs to another connection, leaving it running",
                        provisioned.container_id
                    );
                } else if let Err(stop) = manager
                    .engine
                    .stop(&provisioned.container_id, manager.config.stop_grace_seconds)
                    .await
                {
                    debug!("stopping {}: {}", provisioned.container_id, stop);
                }
            } else {
                manager.provisioner.discard(&provisioned.container_id).await;
            }
            self.rollback(&binding.user_id, &claimed, origin).await;
            return Err(e.into());
        }

        if let Some(stale) = provisioned.stale.clone() {
            manager.provisioner.retire(stale);
        }
        self.session = Some(OwnedSession {
            user_id: binding.user_id.clone(),
            container_id: Some(provisioned.container_id.clone()),
            container_name: provisioned.container_name.clone(),
        });

        // Committed; teardown parks it.
        if self.interrupted() {
            debug!("connection {} closed during provisioning", me);
            return Ok(());
        }

        self.send(ServerEvent::status(STATUS_CONNECTING));
        let argv = manager
            .engine
            .tty_command(&provisioned.container_id, &manager.config.shell);
        let spawner = manager.spawner.clone();
        let process = tokio::task::spawn_blocking(move || spawner.spawn(&argv))
            .await
            .map_err(|e| BridgeError::SpawnFailed(e.to_string()))??;
        let bridge = TtyBridge::attach(process, self.handle.outbound.clone())?;

        self.bridge = Some(bridge);
        self.state = ConnState::Attached;
        self.send(ServerEvent::status(STATUS_CONNECTED));
        info!(
            "Connection {} attached to {} for {}",
            me, provisioned.container_name, binding.user_id
        );
        Ok(())
    }

    /// Take ownership of the user's record, superseding a live owner first.
    async fn claim(&self, binding: &Binding) -> Result<(SessionRecord, ClaimOrigin), SetupError> {
        let manager = self.manager.clone();
        let me = self.handle.connection_id.clone();
        let user_id = binding.user_id.as_str();
        let mut conflicts = 0;

        loop {
            let mut current = retry_transient(manager.retry, "session lookup", || {
                manager.registry.lookup(user_id)
            })
            .await?;

            if let Some(owner) = foreign_owner(current.as_ref(), &me) {
                match manager
                    .hub
                    .supersede(
                        &owner,
                        NEW_SESSION_NOTICE,
                        manager.config.takeover_timeout,
                        manager.config.release_timeout,
                        &self.handle.cancel,
                    )
                    .await
                {
                    Takeover::Abandoned => return Err(SetupError::Cancelled),
                    Takeover::Released | Takeover::Forced => {
                        current = retry_transient(manager.retry, "session lookup", || {
                            manager.registry.lookup(user_id)
                        })
                        .await?;
                    }
                    Takeover::Stuck => return Err(SetupError::Conflict(user_id.to_string())),
                    Takeover::NotConnected => {
                        info!("Claiming session of {} from stale owner {}", user_id, owner);
                    }
                }
            }

            let (expect, patch, origin) = self.plan_claim(binding, current.as_ref());
            let result = retry_transient(manager.retry, "claim session", || {
                manager.registry.transition(
                    user_id,
                    expect.clone(),
                    SessionState::Active,
                    patch.clone(),
                )
            })
            .await;

            match result {
                Ok(record) => {
                    debug!("connection {} claimed session of {} ({})", me, user_id, expect);
                    return Ok((record, origin));
                }
                Err(RegistryError::Conflict { found, .. }) if conflicts == 0 => {
                    debug!("claim of {} lost to {}, retrying once", user_id, found);
                    conflicts += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn plan_claim(
        &self,
        binding: &Binding,
        current: Option<&SessionRecord>,
    ) -> (Expect, RecordPatch, ClaimOrigin) {
        let me = self.handle.connection_id.as_str();
        let fresh = || {
            RecordPatch::default()
                .owner(me)
                .container(None)
                .container_name(container_name_for(&generate_slug()))
                .lesson(binding.lesson_path.clone(), binding.lesson_type.clone())
        };

        match current {
            None => (Expect::Absent, fresh(), ClaimOrigin::Fresh),
            Some(rec) => match rec.state {
                SessionState::Parked => (
                    Expect::State(SessionState::Parked),
                    RecordPatch::default().owner(me),
                    ClaimOrigin::Parked {
                        container_id: rec.container_id.clone(),
                        expires_at: rec.expires_at,
                    },
                ),
                SessionState::Active => (
                    Expect::Owner(rec.owner_connection_id.clone().unwrap_or_default()),
                    RecordPatch::default().owner(me),
                    ClaimOrigin::Stale {
                        container_id: rec.container_id.clone(),
                    },
                ),
                state @ (SessionState::Expired | SessionState::Provisioning) => {
                    (Expect::State(state), fresh(), ClaimOrigin::Fresh)
                }
            },
        }
    }

    /// Undo a claim after setup failed.
    async fn rollback(&mut self, user_id: &str, claimed: &SessionRecord, origin: ClaimOrigin) {
        let manager = self.manager.clone();
        let me = Expect::Owner(self.handle.connection_id.clone());

        let park_until = match origin {
            ClaimOrigin::Fresh => None,
            ClaimOrigin::Parked {
                container_id: Some(_),
                expires_at,
            } => Some(expires_at.at().unwrap_or_else(Utc::now)),
            ClaimOrigin::Stale {
                container_id: Some(_),
            } => Some(Utc::now() + manager.lifetime_delta()),
            _ => None,
        };

        match (park_until, claimed.container_id.as_deref()) {
            (Some(expires_at), Some(container_id)) => {
                match manager
                    .park(
                        user_id,
                        me,
                        container_id,
                        &claimed.container_name,
                        expires_at,
                    )
                    .await
                {
                    Ok(()) => debug!("returned session of {} to parked", user_id),
                    Err(e) => warn!("failed to roll back claim of {}: {}", user_id, e),
                }
            }
            _ => match retry_transient(manager.retry, "roll back claim", || {
                manager.registry.delete_if(user_id, &me)
            })
            .await
            {
                Ok(_) => debug!("removed claimed record of {}", user_id),
                Err(e) => warn!("failed to roll back claim of {}: {}", user_id, e),
            },
        }
        self.session = None;
    }

    /// Stop the container, park the record, schedule cleanup, kill the
    /// terminal.
    async fn terminate(&mut self) {
        let manager = self.manager.clone();
        let me = self.handle.connection_id.clone();
        let bridge = self.bridge.take();
        let mut bridge_killed = false;

        if let Some(session) = self.session.take() {
            let owned = retry_transient(manager.retry, "session lookup", || {
                manager.registry.lookup(&session.user_id)
            })
            .await
            .map(|rec| Expect::Owner(me.clone()).matches(rec.as_ref()));

            match (owned, session.container_id.as_deref()) {
                (Ok(true), Some(container_id)) => {
                    self.stop_with_bridge(container_id, bridge.as_ref()).await;
                    bridge_killed = true;

                    let expires_at = Utc::now() + manager.lifetime_delta();
                    match manager
                        .park(
                            &session.user_id,
                            Expect::Owner(me.clone()),
                            container_id,
                            &session.container_name,
                            expires_at,
                        )
                        .await
                    {
                        Ok(()) => info!(
                            "Parked session of {} ({}) until {}",
                            session.user_id, session.container_name, expires_at
                        ),
                        Err(RegistryError::Conflict { found, .. }) => info!(
                            "session of {} is now {}, not parking",
                            session.user_id, found
                        ),
                        Err(e) => warn!("failed to park session of {}: {}", session.user_id, e),
                    }
                }
                (Ok(true), None) => {
                    if let Err(e) = manager
                        .registry
                        .delete_if(&session.user_id, &Expect::Owner(me.clone()))
                        .await
                    {
                        warn!("failed to drop unprovisioned session: {}", e);
                    }
                }
                (Ok(false), _) => info!(
                    "connection {} no longer owns the session of {}",
                    me, session.user_id
                ),
                // Nobody claims a session whose owner is still registered,
                // so the container is still ours to stop.
                (Err(e), Some(container_id)) => {
                    warn!(
                        "could not read session of {} during teardown: {}",
                        session.user_id, e
                    );
                    self.stop_with_bridge(container_id, bridge.as_ref()).await;
                    bridge_killed = true;

                    let expires_at = Utc::now() + manager.lifetime_delta();
                    match manager
                        .park(
                            &session.user_id,
                            Expect::Owner(me.clone()),
                            container_id,
                            &session.container_name,
                            expires_at,
                        )
                        .await
                    {
                        Ok(()) => info!(
                            "Parked session of {} ({}) until {}",
                            session.user_id, session.container_name, expires_at
                        ),
                        Err(park) => {
                            warn!("failed to park session of {}: {}", session.user_id, park);
                            manager
                                .schedule_cleanup(
                                    &session.user_id,
                                    container_id,
                                    &session.container_name,
                                    expires_at,
                                )
                                .await;
                        }
                    }
                }
                (Err(e), None) => warn!(
                    "could not read session of {} during teardown: {}",
                    session.user_id, e
                ),
            }
        }

        if let (Some(bridge), false) = (&bridge, bridge_killed) {
            bridge.kill();
        }
        drop(bridge);

        self.state = ConnState::Terminated;
        manager.hub.unregister(&me);
        self.handle.terminated.cancel();
        debug!("connection {} terminated", me);
    }

    /// Stop the container, killing the terminal alongside. Stop failures
    /// are logged only.
    async fn stop_with_bridge(&self, container_id: &str, bridge: Option<&TtyBridge>) {
        let stop = self
            .manager
            .engine
            .stop(container_id, self.manager.config.stop_grace_seconds);
        let kill = async {
            if let Some(bridge) = bridge {
                bridge.kill();
            }
        };
        let (stopped, ()) = tokio::join!(stop, kill);
        if let Err(e) = stopped {
            warn!("failed to stop container {}: {}", container_id, e);
        }
    }

    /// Whether the current record hands `container_id` to another live
    /// connection. Unreadable records count as held.
    async fn held_elsewhere(&self, user_id: &str, container_id: &str) -> bool {
        match self.manager.registry.lookup(user_id).await {
            Ok(Some(rec)) => {
                rec.state == SessionState::Active
                    && rec.container_id.as_deref() == Some(container_id)
                    && rec.owner_connection_id.as_deref() != Some(self.handle.connection_id.as_str())
            }
            Ok(None) => false,
            Err(e) => {
                debug!("could not read session of {}: {}", user_id, e);
                true
            }
        }
    }

    fn interrupted(&self) -> bool {
        self.handle.cancel.is_cancelled() || self.handle.superseded.is_cancelled()
    }

    fn send(&self, event: ServerEvent) {
        if let Err(e) = self.handle.outbound.try_send(event) {
            debug!(
                "dropping event for connection {}: {}",
                self.handle.connection_id, e
            );
        }
    }
}

/// Owner of `current` if it is active under another connection.
fn foreign_owner(current: Option<&SessionRecord>, me: &str) -> Option<String> {
    let rec = current?;
    match (&rec.state, rec.owner_connection_id.as_deref()) {
        (SessionState::Active, Some(owner)) if owner != me => Some(owner.to_string()),
        _ => None,
    }
}

async fn wait_closed(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::container::ContainerState;
    use crate::testing::{FailOp, FakeEngine, FakeSpawner};
    use berth_protocol::UserRef;
    use bytes::Bytes;

    struct Harness {
        db: Database,
        manager: Arc<SessionManager>,
        engine: Arc<FakeEngine>,
        spawner: Arc<FakeSpawner>,
    }

    struct Client {
        id: String,
        tx: mpsc::Sender<ClientEvent>,
        rx: mpsc::Receiver<ServerEvent>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    impl Harness {
        async fn new() -> Self {
            Self::with_config(SandboxConfig::default()).await
        }

        async fn with_config(config: SandboxConfig) -> Self {
            let db = Database::in_memory().await.unwrap();
            let engine = FakeEngine::new();
            let spawner = FakeSpawner::new();
            let manager = SessionManager::new(
                SessionRegistry::new(&db),
                ExpiryScheduler::new(&db, 16),
                engine.clone(),
                spawner.clone(),
                Arc::new(config),
                CancellationToken::new(),
            )
            .with_retry(RetryPolicy::immediate(1));
            Self {
                db,
                manager: Arc::new(manager),
                engine,
                spawner,
            }
        }

        async fn record(&self, user_id: &str) -> Option<SessionRecord> {
            self.manager.registry().lookup(user_id).await.unwrap()
        }

        /// Poll until `user_id`'s record is active under `owner`.
        async fn wait_for_owner(&self, user_id: &str, owner: &str) {
            for _ in 0..500 {
                if let Some(rec) = self.record(user_id).await {
                    if rec.owner_connection_id.as_deref() == Some(owner) {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("{owner} never owned the session of {user_id}");
        }

        async fn wait_for_call(&self, prefix: &str) {
            for _ in 0..500 {
                if self.engine.count_calls(prefix) > 0 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("engine never saw {prefix:?}");
        }

        fn connect(&self) -> Client {
            let (coordinator, rx) = self.manager.open();
            let (tx, inbound) = mpsc::channel(16);
            Client {
                id: coordinator.connection_id().to_string(),
                cancel: coordinator.cancel_token(),
                task: tokio::spawn(coordinator.run(inbound)),
                tx,
                rx,
            }
        }
    }

    fn init(uid: &str, path: &str, lesson_type: Option<&str>) -> ClientEvent {
        ClientEvent::Init(InitPayload {
            user: UserRef {
                uid: uid.to_string(),
            },
            path: path.to_string(),
            lesson_type: lesson_type.map(str::to_string),
        })
    }

    impl Client {
        async fn send(&self, event: ClientEvent) {
            self.tx.send(event).await.unwrap();
        }

        async fn next(&mut self) -> ServerEvent {
            tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("connection closed")
        }

        async fn until(&mut self, wanted: &ServerEvent) -> Vec<ServerEvent> {
            let mut seen = Vec::new();
            loop {
                let event = self.next().await;
                let done = &event == wanted;
                seen.push(event);
                if done {
                    return seen;
                }
            }
        }

        async fn close(self) {
            self.cancel.cancel();
            self.task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_ready_before_init_is_rejected() {
        let h = Harness::new().await;
        let mut c = h.connect();
        c.send(ClientEvent::Ready).await;
        assert_eq!(
            c.next().await,
            ServerEvent::error("ready received before init")
        );
        assert!(h.engine.calls().is_empty());
        assert!(h.manager.registry().list().await.unwrap().is_empty());
        c.close().await;
    }

    #[tokio::test]
    async fn test_init_with_different_payload_is_rejected() {
        let h = Harness::new().await;
        let mut c = h.connect();
        c.send(init("u1", "intro", None)).await;
        c.send(init("u1", "intro", None)).await;
        c.send(init("u2", "intro", None)).await;
        assert_eq!(
            c.next().await,
            ServerEvent::error("already initialized with a different session")
        );
        c.close().await;
    }

    #[tokio::test]
    async fn test_init_requires_user() {
        let h = Harness::new().await;
        let mut c = h.connect();
        c.send(init("  ", "intro", None)).await;
        assert!(matches!(c.next().await, ServerEvent::Error { .. }));
        c.send(ClientEvent::Ready).await;
        assert_eq!(
            c.next().await,
            ServerEvent::error("ready received before init")
        );
        c.close().await;
    }

    #[tokio::test]
    async fn test_setup_attach_and_park_on_disconnect() {
        let h = Harness::new().await;
        let mut c = h.connect();
        c.send(init("u1", "intro", Some("nodejs"))).await;
        c.send(ClientEvent::Ready).await;

        let events = c.until(&ServerEvent::status(STATUS_CONNECTED)).await;
        assert_eq!(
            events,
            vec![
                ServerEvent::status(STATUS_SPAWNING),
                ServerEvent::status(STATUS_CONNECTING),
                ServerEvent::status(STATUS_CONNECTED),
            ]
        );

        let rec = h.manager.registry().lookup("u1").await.unwrap().unwrap();
        assert_eq!(rec.state, SessionState::Active);
        assert_eq!(rec.owner_connection_id.as_deref(), Some(c.id.as_str()));
        assert_eq!(rec.lesson_type, "nodejs");
        let container_id = rec.container_id.clone().unwrap();

        let term = h.spawner.last().unwrap();
        assert_eq!(term.argv[3], container_id);
        c.send(ClientEvent::Stdin(Bytes::from_static(b"ls\r"))).await;
        term.wait_for_input(3).await;
        assert_eq!(term.input(), b"ls\r");
        term.emit(b"file.txt\r\n");
        assert_eq!(
            c.next().await,
            ServerEvent::Stdout(Bytes::from_static(b"file.txt\r\n"))
        );

        c.close().await;

        let rec = h.manager.registry().lookup("u1").await.unwrap().unwrap();
        assert_eq!(rec.state, SessionState::Parked);
        assert!(rec.owner_connection_id.is_none());
        let expires = rec.expires_at.at().unwrap();
        let lifetime = expires - Utc::now();
        assert!(lifetime > TimeDelta::minutes(59) && lifetime <= TimeDelta::hours(1));

        let task = h.manager.scheduler().get(&container_id).await.unwrap().unwrap();
        assert_eq!(task.fire_at.timestamp_millis(), expires.timestamp_millis());
        assert_eq!(task.payload.user_id, "u1");
        assert_eq!(task.payload.container_name, rec.container_name);
        assert!(term.killed());
        assert_eq!(h.engine.count_calls(&format!("stop {container_id}")), 1);
        assert!(h.manager.hub().is_empty());
    }

    #[tokio::test]
    async fn test_stdin_before_attach_is_ignored() {
        let h = Harness::new().await;
        let mut c = h.connect();
        c.send(ClientEvent::Stdin(Bytes::from_static(b"early"))).await;
        c.send(init("u1", "intro", None)).await;
        c.send(ClientEvent::Ready).await;
        c.until(&ServerEvent::status(STATUS_CONNECTED)).await;
        assert!(h.spawner.last().unwrap().input().is_empty());
        c.close().await;
    }

    #[tokio::test]
    async fn test_provision_failure_rolls_back_fresh_claim() {
        let h = Harness::new().await;
        h.engine.fail(FailOp::Create);
        let mut c = h.connect();
        c.send(init("u1", "intro", None)).await;
        c.send(ClientEvent::Ready).await;

        assert_eq!(c.next().await, ServerEvent::status(STATUS_SPAWNING));
        assert!(matches!(c.next().await, ServerEvent::Error { .. }));
        c.task.await.unwrap();

        assert!(h.manager.registry().lookup("u1").await.unwrap().is_none());
        assert!(h.spawner.terminals().is_empty());

        h.engine.heal(FailOp::Create);
        let mut c = h.connect();
        c.send(init("u1", "intro", None)).await;
        c.send(ClientEvent::Ready).await;
        c.until(&ServerEvent::status(STATUS_CONNECTED)).await;
        c.close().await;
    }

    #[tokio::test]
    async fn test_provision_failure_returns_parked_record() {
        let h = Harness::new().await;
        let mut c = h.connect();
        c.send(init("u1", "intro", None)).await;
        c.send(ClientEvent::Ready).await;
        c.until(&ServerEvent::status(STATUS_CONNECTED)).await;
        c.close().await;
        let parked = h.manager.registry().lookup("u1").await.unwrap().unwrap();
        let container_id = parked.container_id.clone().unwrap();

        // The old container vanished and a new one cannot be created.
        h.engine.forget_container(&container_id);
        h.engine.fail(FailOp::Create);
        let mut c = h.connect();
        c.send(init("u1", "intro", None)).await;
        c.send(ClientEvent::Ready).await;
        c.until(&ServerEvent::status(STATUS_SPAWNING)).await;
        assert!(matches!(c.next().await, ServerEvent::Error { .. }));
        c.task.await.unwrap();

        let rec = h.manager.registry().lookup("u1").await.unwrap().unwrap();
        assert_eq!(rec.state, SessionState::Parked);
        assert_eq!(rec.expires_at, parked.expires_at);
        assert_eq!(rec.container_id, parked.container_id);
        assert!(h.manager.scheduler().get(&container_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_shell_exit_terminates_connection() {
        let h = Harness::new().await;
        let mut c = h.connect();
        c.send(init("u1", "intro", None)).await;
        c.send(ClientEvent::Ready).await;
        c.until(&ServerEvent::status(STATUS_CONNECTED)).await;

        h.spawner.last().unwrap().hang_up();
        tokio::time::timeout(Duration::from_secs(5), c.task)
            .await
            .unwrap()
            .unwrap();
        let rec = h.manager.registry().lookup("u1").await.unwrap().unwrap();
        assert_eq!(rec.state, SessionState::Parked);
    }

    #[tokio::test]
    async fn test_shutdown_parks_live_sessions() {
        let h = Harness::new().await;
        let mut c = h.connect();
        c.send(init("u1", "intro", None)).await;
        c.send(ClientEvent::Ready).await;
        c.until(&ServerEvent::status(STATUS_CONNECTED)).await;

        assert!(h.manager.shutdown(Duration::from_secs(5)).await);
        let rec = h.manager.registry().lookup("u1").await.unwrap().unwrap();
        assert_eq!(rec.state, SessionState::Parked);
    }

    fn fast_takeover() -> SandboxConfig {
        SandboxConfig {
            takeover_timeout: Duration::from_millis(50),
            ..SandboxConfig::default()
        }
    }

    #[tokio::test]
    async fn test_forced_takeover_of_reused_container() {
        let h = Harness::with_config(fast_takeover()).await;
        let mut first = h.connect();
        first.send(init("u1", "intro", None)).await;
        first.send(ClientEvent::Ready).await;
        first.until(&ServerEvent::status(STATUS_CONNECTED)).await;
        first.close().await;
        let container_id = h.record("u1").await.unwrap().container_id.unwrap();

        // A is stuck in `start` well past the takeover timeout.
        h.engine.set_start_delay(Duration::from_millis(400));
        let mut a = h.connect();
        a.send(init("u1", "intro", None)).await;
        a.send(ClientEvent::Ready).await;
        a.until(&ServerEvent::status(STATUS_SPAWNING)).await;
        h.wait_for_owner("u1", &a.id).await;

        let mut b = h.connect();
        b.send(init("u1", "intro", None)).await;
        b.send(ClientEvent::Ready).await;
        b.until(&ServerEvent::status(STATUS_CONNECTED)).await;

        // A tore down before B attached and never touched B's container.
        assert_eq!(h.manager.hub().len(), 1);
        assert_eq!(h.spawner.terminals().len(), 2);
        a.until(&ServerEvent::NewSession {
            notice: NEW_SESSION_NOTICE.to_string(),
        })
        .await;
        a.task.await.unwrap();

        let rec = h.record("u1").await.unwrap();
        assert_eq!(rec.state, SessionState::Active);
        assert_eq!(rec.owner_connection_id.as_deref(), Some(b.id.as_str()));
        assert_eq!(rec.container_id.as_deref(), Some(container_id.as_str()));
        assert_eq!(
            h.engine.container(&container_id).unwrap().state,
            ContainerState::Running
        );
        assert_eq!(
            h.engine.calls().last().cloned(),
            Some(format!("start {container_id}"))
        );
        assert!(h.manager.scheduler().list().await.unwrap().is_empty());
        b.close().await;
    }

    #[tokio::test]
    async fn test_forced_takeover_during_fresh_provisioning() {
        let h = Harness::with_config(fast_takeover()).await;
        h.engine.set_start_delay(Duration::from_millis(400));

        let mut a = h.connect();
        a.send(init("u1", "intro", None)).await;
        a.send(ClientEvent::Ready).await;
        h.wait_for_owner("u1", &a.id).await;

        let mut b = h.connect();
        b.send(init("u1", "intro", None)).await;
        b.send(ClientEvent::Ready).await;
        b.until(&ServerEvent::status(STATUS_CONNECTED)).await;

        let events = a
            .until(&ServerEvent::NewSession {
                notice: NEW_SESSION_NOTICE.to_string(),
            })
            .await;
        assert!(!events.iter().any(|e| matches!(e, ServerEvent::Error { .. })));
        a.task.await.unwrap();

        // B picked up the container A finished provisioning.
        let rec = h.record("u1").await.unwrap();
        assert_eq!(rec.owner_connection_id.as_deref(), Some(b.id.as_str()));
        assert_eq!(h.engine.count_calls("create "), 1);
        let containers = h.engine.containers();
        assert_eq!(containers.len(), 1);
        assert_eq!(
            containers[rec.container_id.as_deref().unwrap()].state,
            ContainerState::Running
        );
        assert_eq!(h.spawner.terminals().len(), 1);
        b.close().await;
    }

    #[tokio::test]
    async fn test_disconnect_during_provisioning_parks_container() {
        let h = Harness::new().await;
        h.engine.set_start_delay(Duration::from_millis(200));

        let c = h.connect();
        c.send(init("u1", "intro", None)).await;
        c.send(ClientEvent::Ready).await;
        h.wait_for_call("create ").await;
        c.close().await;

        let rec = h.record("u1").await.unwrap();
        assert_eq!(rec.state, SessionState::Parked);
        let container_id = rec.container_id.unwrap();
        assert_eq!(
            h.engine.container(&container_id).unwrap().state,
            ContainerState::Exited
        );
        assert!(h.manager.scheduler().get(&container_id).await.unwrap().is_some());
        assert!(h.spawner.terminals().is_empty());
        assert!(h.manager.hub().is_empty());
    }

    #[tokio::test]
    async fn test_stop_failure_still_parks() {
        let h = Harness::new().await;
        let mut c = h.connect();
        c.send(init("u1", "intro", None)).await;
        c.send(ClientEvent::Ready).await;
        c.until(&ServerEvent::status(STATUS_CONNECTED)).await;
        let term = h.spawner.last().unwrap();

        h.engine.fail(FailOp::Stop);
        c.close().await;

        let rec = h.record("u1").await.unwrap();
        assert_eq!(rec.state, SessionState::Parked);
        let container_id = rec.container_id.unwrap();
        assert_eq!(h.engine.count_calls(&format!("stop {container_id}")), 1);
        assert!(h.manager.scheduler().get(&container_id).await.unwrap().is_some());
        assert!(term.killed());
    }

    #[tokio::test]
    async fn test_teardown_without_registry_still_stops_container() {
        let h = Harness::new().await;
        let mut c = h.connect();
        c.send(init("u1", "intro", None)).await;
        c.send(ClientEvent::Ready).await;
        c.until(&ServerEvent::status(STATUS_CONNECTED)).await;
        let container_id = h.record("u1").await.unwrap().container_id.unwrap();
        let term = h.spawner.last().unwrap();

        h.db.pool().close().await;
        c.close().await;

        assert_eq!(h.engine.count_calls(&format!("stop {container_id}")), 1);
        assert_eq!(
            h.engine.container(&container_id).unwrap().state,
            ContainerState::Exited
        );
        assert!(term.killed());
        assert!(h.manager.hub().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_parks_session() {
        let h = Harness::new().await;
        h.spawner.set_fail(true);
        let mut c = h.connect();
        c.send(init("u1", "intro", None)).await;
        c.send(ClientEvent::Ready).await;

        let events = c.until(&ServerEvent::status(STATUS_CONNECTING)).await;
        assert_eq!(events[0], ServerEvent::status(STATUS_SPAWNING));
        assert!(matches!(c.next().await, ServerEvent::Error { .. }));
        c.task.await.unwrap();

        let rec = h.record("u1").await.unwrap();
        assert_eq!(rec.state, SessionState::Parked);
        assert!(h.spawner.terminals().is_empty());
    }
}
