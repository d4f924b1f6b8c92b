//! Session lifecycle: registry, provisioning, per-connection coordination.

mod coordinator;
mod hub;
pub mod models;
mod provisioner;
mod recovery;
pub mod registry;

pub use coordinator::{
    ConnState, Coordinator, NEW_SESSION_NOTICE, STATUS_CONNECTED, STATUS_CONNECTING,
    STATUS_SPAWNING, SessionManager, SetupError,
};
pub use hub::{ConnectionHandle, ConnectionHub, Takeover};
pub use models::{Expiry, RecordPatch, SessionRecord, SessionState};
pub use provisioner::{ProvisionError, Provisioned, Provisioner, StaleResources};
pub use recovery::RecoveryReport;
pub use registry::{Expect, RegistryError, SessionRegistry};
