//! Application state shared across handlers.

use std::sync::Arc;

use crate::session::SessionManager;

#[derive(Clone)]
pub struct AppState {
    /// Session services; every WebSocket gets a coordinator from here.
    pub sessions: Arc<SessionManager>,
}

impl AppState {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}
