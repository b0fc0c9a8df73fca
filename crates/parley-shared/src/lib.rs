//! # parley-shared
//!
//! Domain types shared by every Parley crate: conversations, messages and
//! their identifiers, completion parameters, and client-side validation.

pub mod constants;
pub mod error;
pub mod types;

pub use error::ValidationError;
pub use types::*;
