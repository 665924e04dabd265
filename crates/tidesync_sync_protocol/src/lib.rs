//! # TideSync Sync Protocol
//!
//! Pure decision logic and wire types shared by the sync engine and remote
//! gateways.
//!
//! This crate provides:
//! - [`ConflictResolver`] with the [`LastWriterWins`] default and the
//!   [`ListUnionMerge`] field-level resolver
//! - [`resolve_conflict`], which validates a resolver's decision
//! - [`PushOutcome`] and [`GatewayError`], the results of a push
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod error;
mod messages;

pub use conflict::{
    resolve_conflict, ConflictPolicy, ConflictResolver, Decision, LastWriterWins, ListUnionMerge,
};
pub use error::ResolveError;
pub use messages::{GatewayError, PushOutcome};
