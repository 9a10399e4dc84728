//! # cirrus-events
//!
//! Notification types emitted by the cirrus orchestration services.
//!
//! ## Design Principles
//!
//! - Notifications are fire-and-forget observations; nothing in the
//!   orchestration path waits for, or fails because of, their delivery
//! - Every notification names the instance it is about
//! - Payloads carry strings for states so consumers do not need the
//!   conductor's model types
//!
//! ## Envelope
//!
//! All notifications share a common envelope with:
//! - A unique `message_id`
//! - The `publisher_id` (service and host that emitted it)
//! - A `priority` (`info`, `warn`, `error`)
//! - The dotted `event_type` (e.g. `compute_task.migrate_server`)
//!
//! ## Event Types
//!
//! - Orchestration failures (`compute_task.*`), always `error` priority
//! - Instance action events (`instance.action_event.*`)
//! - Instance usage (`compute.instance.*`)

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
