//! HTTP API module.
//!
//! Health, an operator view of the session registry, and the terminal
//! WebSocket endpoint.

mod error;
pub mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
