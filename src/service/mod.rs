//! Service layer
//!
//! Contains business logic separated from HTTP handlers.

pub mod accounts;
pub mod idempotency;

pub use accounts::{create_local_actor, create_local_actor_with_key, ensure_local_actors};
