//! HTTP / WebSocket surface of the broker.

mod handler;
mod server;
mod signal;
mod state;

pub use server::{Server, router, serve};
pub use state::AppState;
