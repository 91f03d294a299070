//! Development message broker for the Souk chat layer.
//!
//! Speaks the broker side of the wire protocol over WebSocket and serves the
//! chat REST endpoints (room snapshot, leave room, image upload) from memory.

pub mod domain;
pub mod ui;

pub use ui::{AppState, Server, router, serve};
