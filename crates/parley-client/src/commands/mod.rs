//! User intents exposed to the view layer.
//!
//! Each sub-module adds the commands of one domain to [`Session`] and the
//! settle step that runs when the matching remote call resolves. Commands
//! validate and stage under the session lock, then hand the remote call to
//! a background task and return a [`MutationHandle`] at once.
//!
//! [`Session`]: crate::Session
//! [`MutationHandle`]: crate::MutationHandle

pub mod conversations;
pub mod messaging;
