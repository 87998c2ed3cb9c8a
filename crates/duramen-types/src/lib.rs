//! Shared domain types for the Duramen durable workflow core.
//!
//! This crate contains the records that flow between the execution engine
//! and the persistence layer: journal events and their payloads, workflow
//! state and state deltas, snapshots, leases, step attempts/completions,
//! savepoints, and the configuration types accepted at workflow start.
//!
//! Zero infrastructure dependencies -- only serde, serde_json, uuid,
//! chrono, thiserror.

pub mod delta;
pub mod error;
pub mod event;
pub mod lease;
pub mod savepoint;
pub mod snapshot;
pub mod state;
pub mod step;
pub mod workflow;
