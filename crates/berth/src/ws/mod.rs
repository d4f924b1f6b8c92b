//! WebSocket transport for terminal sessions.

mod handler;

pub use handler::ws_handler;
