//! cirrus compute task conductor.
//!
//! Orchestrates instance lifecycle operations that span several compute
//! hosts: live and cold migration, resize, batch builds, rebuilds and
//! unshelves. The `conductor` binary serves these over HTTP; the library
//! surface exists for integration testing and embedding.

pub mod api;
pub mod compute;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod hosts;
pub mod images;
pub mod model;
pub mod notifier;
pub mod scheduler;
pub mod state;
pub mod tasks;
