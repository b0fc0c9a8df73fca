//! # parley-client
//!
//! Optimistic cache synchronization for the Parley chat client.
//!
//! A [`Session`] sits between a view and the conversation backend. The view
//! reads conversations and threads from the session's cache without waiting
//! on the network, and issues mutations (submit, create, delete, update)
//! that show up in the cache at once and are reconciled with the server
//! when the remote call resolves, or rolled back if it fails. The active
//! conversation pointer is kept consistent with the cached list through all
//! of it.
//!
//! Library code only emits `tracing` events; installing a subscriber is left
//! to the binary.

pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod selection;
pub mod session;
pub mod state;

pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use events::{MutationOutcome, SessionEvent};
pub use pipeline::{MutationHandle, MutationId, MutationKind, MutationStatus};
pub use session::Session;

pub use parley_gateway::{ErrorKind, GatewayError, HttpGateway, RemoteGateway};
pub use parley_shared::{
    Conversation, ConversationId, ConversationParams, Message, MessageId, Model, Role,
};
pub use parley_store::{CacheKey, ReadStatus};
