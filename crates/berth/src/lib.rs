//! Per-user sandboxed terminal sessions backed by containers.
//!
//! A browser connects over WebSocket, names a user and a lesson, and gets a
//! shell inside a resource-capped container. Disconnecting parks the
//! container; reconnecting within its lifetime resumes it, otherwise a
//! durable cleanup task destroys it.

pub mod api;
pub mod bridge;
pub mod container;
pub mod db;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod settings;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod wordlist;
pub mod ws;
