//! # parley-gateway
//!
//! The client's only view of the conversation backend. [`RemoteGateway`] is
//! the async contract the sync layer programs against; [`HttpGateway`]
//! speaks the backend's JSON API over reqwest. Transport failures never
//! escape as panics: every call resolves to a [`GatewayError`] classified as
//! not-found, transport, or validation.
//!
//! With the `testing` feature the crate also exports a scripted gateway
//! whose calls are answered explicitly by the test.

pub mod error;
pub mod gateway;
pub mod http;
pub mod wire;

#[cfg(any(test, feature = "testing"))]
pub mod scripted;

pub use error::{ErrorKind, GatewayError, GatewayResult};
pub use gateway::RemoteGateway;
pub use http::HttpGateway;
