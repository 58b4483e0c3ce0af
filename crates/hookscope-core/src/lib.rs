//! hookscope core - Shared types for Claude Code hook event monitoring
//!
//! This crate provides the domain types shared between the wire decoder
//! (hookscope-protocol) and the ingestion client (hookscope-client).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod connection;
pub mod error;
pub mod event;
pub mod hook;

// Re-exports for convenience
pub use connection::{ConnectionState, ReconnectState};
pub use error::DomainError;
pub use event::{metadata_keys, EventId, HookEvent, HookEventBuilder, SessionId, Severity};
pub use hook::HookCategory;
