//! Admin route handlers.

pub mod health;
pub mod replay;

pub use health::{liveness, readiness};
pub use replay::{replay_failed, replay_one, requeue};
