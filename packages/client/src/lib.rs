//! Real-time room chat layer.
//!
//! One shared, reconnecting broker connection ([`ConnectionManager`]) carries
//! the subscriptions of every open room ([`RoomSubscriptionRegistry`]); each
//! room viewed by the user is driven by a [`ChatSession`]. [`ChatClient`] ties
//! them together for one application session.

pub mod api;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod domain;
pub mod error;
pub mod message_log;
pub mod reconnect;
pub mod registry;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ChatApi, HttpChatApi};
pub use client::ChatClient;
pub use config::{ChatConfig, ReconnectPolicy};
pub use connection::ConnectionManager;
pub use credentials::{CredentialSource, SharedCredentials, StaticCredentials};
pub use domain::{
    ChatIdentity, ChatMessage, ConnectionState, ImageUpload, MessageKind, RoomId, RoomInfo,
    RoomSnapshot, SessionState,
};
pub use error::ChatError;
pub use registry::RoomSubscriptionRegistry;
pub use session::{ChatSession, SessionContext};
