//! # cirrus-id
//!
//! Typed identifiers for the cirrus orchestration services.
//!
//! ## Design Principles
//!
//! - Every identifier is a UUID, the same value the compute agents and the
//!   placement service use on the wire
//! - Identifiers are typed so an instance id can never be handed to a
//!   migration lookup by accident
//! - The canonical string form is the lowercase hyphenated UUID; parsing
//!   also accepts the simple (unhyphenated) and braced forms
//!
//! Examples:
//! - `InstanceId`: `0d6bd4a8-3e7f-4c6b-9f2e-0b7d8d5e7c11`
//! - `MigrationId`: `6c0f7e6f-81c4-4c07-a3e5-4f0b1c1d2a90`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export uuid for consumers that need raw UUID operations
pub use uuid::Uuid;
