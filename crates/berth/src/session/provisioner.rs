//! Ensures a running container exists for a claimed session.

use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use super::models::{container_name_for, volume_name_for};
use super::registry::{RegistryError, SessionRegistry};
use crate::container::{ContainerEngine, ContainerError, ContainerSpec};
use crate::retry::{RetryPolicy, retry_transient};
use crate::settings::SandboxConfig;
use crate::wordlist::generate_slug;

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// An engine call failed. Nothing was committed to the registry.
    #[error("container engine failed to {step}: {cause}")]
    Engine {
        step: &'static str,
        #[source]
        cause: ContainerError,
    },

    #[error("reading session record failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("no session record for {0}")]
    NoRecord(String),
}

impl ProvisionError {
    fn engine(step: &'static str) -> impl FnOnce(ContainerError) -> Self {
        move |cause| ProvisionError::Engine { step, cause }
    }
}

/// Resources of a previous container that must go once the new one is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleResources {
    pub container_id: Option<String>,
    pub volume: Option<String>,
}

/// A running container for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    pub container_id: String,
    pub container_name: String,
    /// The record's existing container was started again.
    pub reused: bool,
    /// Left over from a lesson-type migration or an unusable container.
    pub stale: Option<StaleResources>,
}

/// Chooses between restarting a session's container and creating a new one.
pub struct Provisioner {
    engine: Arc<dyn ContainerEngine>,
    registry: SessionRegistry,
    config: Arc<SandboxConfig>,
    retry: RetryPolicy,
}

impl Provisioner {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: SessionRegistry,
        config: Arc<SandboxConfig>,
    ) -> Self {
        Self {
            engine,
            registry,
            config,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Make sure a container of `lesson_type` is running for `user_id`.
    ///
    /// The caller must already own the session record. This never writes to
    /// the registry; the caller commits the returned container, then passes
    /// any [`StaleResources`] to [`Provisioner::retire`].
    pub async fn ensure_container(
        &self,
        user_id: &str,
        lesson_type: &str,
    ) -> Result<Provisioned, ProvisionError> {
        let record = retry_transient(self.retry, "provision lookup", || {
            self.registry.lookup(user_id)
        })
        .await?
        .ok_or_else(|| ProvisionError::NoRecord(user_id.to_string()))?;

        let same_type = record.lesson_type == lesson_type;

        if let (true, Some(container_id)) = (same_type, record.container_id.as_deref()) {
            match self.engine.start(container_id).await {
                Ok(()) => {
                    info!(
                        "Reusing container {} ({}) for {}",
                        record.container_name, container_id, user_id
                    );
                    return Ok(Provisioned {
                        container_id: container_id.to_string(),
                        container_name: record.container_name.clone(),
                        reused: true,
                        stale: None,
                    });
                }
                Err(e) => warn!(
                    "Existing container {} for {} could not be started, recreating: {}",
                    container_id, user_id, e
                ),
            }

            // Same lesson: keep the slug and its volume so user files survive.
            // The old container holds the name, so it has to go first.
            match self.engine.remove(container_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(
                        "Could not remove unusable container {}, switching to a new name: {}",
                        container_id, e
                    );
                    let stale = StaleResources {
                        container_id: Some(container_id.to_string()),
                        volume: Some(record.volume_name()),
                    };
                    return self
                        .create_fresh(user_id, lesson_type, &container_name_for(&generate_slug()))
                        .await
                        .map(|p| Provisioned {
                            stale: Some(stale),
                            ..p
                        });
                }
            }
            return self
                .create_fresh(user_id, lesson_type, &record.container_name)
                .await;
        }

        if same_type {
            return self
                .create_fresh(user_id, lesson_type, &record.container_name)
                .await;
        }

        // Lesson type changed: new slug, old container and volume retire.
        info!(
            "Session for {} moves from lesson type {} to {}",
            user_id, record.lesson_type, lesson_type
        );
        let stale = StaleResources {
            container_id: record.container_id.clone(),
            volume: Some(record.volume_name()),
        };
        let provisioned = self
            .create_fresh(user_id, lesson_type, &container_name_for(&generate_slug()))
            .await?;
        Ok(Provisioned {
            stale: Some(stale),
            ..provisioned
        })
    }

    /// Create volume, image (if needed) and container, then start it.
    async fn create_fresh(
        &self,
        user_id: &str,
        lesson_type: &str,
        container_name: &str,
    ) -> Result<Provisioned, ProvisionError> {
        let volume = volume_name_for(container_name);
        self.engine
            .create_volume(&volume)
            .await
            .map_err(ProvisionError::engine("create volume"))?;

        let image = self.config.image_tag(lesson_type);
        let exists = self
            .engine
            .image_exists(&image)
            .await
            .map_err(ProvisionError::engine("inspect image"))?;
        if !exists {
            self.engine
                .build_image(&image, &self.config.dockerfile_path(lesson_type))
                .await
                .map_err(ProvisionError::engine("build image"))?;
        }

        let spec = ContainerSpec {
            image,
            name: container_name.to_string(),
            volume,
            mount_path: self.config.workdir.clone(),
            memory_mb: self.config.max_memory_mb,
            cpu_cores: self.config.max_cpu_cores,
        };
        let container_id = self
            .engine
            .create(&spec)
            .await
            .map_err(ProvisionError::engine("create container"))?;

        if let Err(cause) = self.engine.start(&container_id).await {
            // Never leave a container behind that no record points to.
            if let Err(e) = self.engine.remove(&container_id).await {
                warn!(
                    "failed to remove container {} after start failure: {}",
                    container_id, e
                );
            }
            return Err(ProvisionError::Engine {
                step: "start container",
                cause,
            });
        }

        info!(
            "Created container {} ({}) for {} with {} MB / {} CPU",
            container_name, container_id, user_id, spec.memory_mb, spec.cpu_cores
        );
        Ok(Provisioned {
            container_id,
            container_name: container_name.to_string(),
            reused: false,
            stale: None,
        })
    }

    /// Stop and remove stale resources in the background.
    pub fn retire(&self, stale: StaleResources) -> tokio::task::JoinHandle<()> {
        let engine = self.engine.clone();
        let grace = self.config.stop_grace_seconds;
        tokio::spawn(async move {
            if let Some(ref id) = stale.container_id {
                if let Err(e) = engine.stop(id, grace).await {
                    debug!("stopping stale container {}: {}", id, e);
                }
                match engine.remove(id).await {
                    Ok(()) => debug!("removed stale container {}", id),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!("failed to remove stale container {}: {}", id, e),
                }
            }
            if let Some(ref volume) = stale.volume {
                match engine.remove_volume(volume).await {
                    Ok(()) => debug!("removed stale volume {}", volume),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => warn!("failed to remove stale volume {}: {}", volume, e),
                }
            }
        })
    }

    /// Remove a container that could not be committed to the registry.
    pub async fn discard(&self, container_id: &str) {
        if let Err(e) = self.engine.remove(container_id).await {
            warn!("failed to remove uncommitted container {}: {}", container_id, e);
        }
    }
}
