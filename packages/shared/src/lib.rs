//! Shared building blocks for the Souk chat client and development broker.

pub mod logger;
pub mod protocol;
pub mod time;
