//! Isolated execution contexts.
//!
//! A context is a dedicated OS thread that owns one interpreter and one
//! in-memory filesystem. The orchestrator reaches it only through a
//! [`ContextHandle`], and destroys it by cancelling the handle's kill token.
//!
//! An interpreter that never calls back into its [`Host`] cannot observe the
//! kill token. Its thread is left to finish on its own, and whatever it
//! eventually produces is discarded.

mod bridge;
mod rpc;
mod worker;

pub use bridge::Host;
pub use rpc::ContextId;
pub(crate) use rpc::{ContextEvent, ContextHandle};
