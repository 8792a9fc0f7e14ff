//! Metric Routing
//!
//! Picks the single backend that answers queries for a metric key.
//!
//! - [`PriorityIndex`]: candidates for one key, best first
//! - [`BackendRegistry`]: all indices plus per-backend records under one lock
//!
//! # Selection Policy
//!
//! Lower priority wins. On equal priority the longest-registered backend
//! (earliest `created_at`) wins; exact ties fall back to the backend identity
//! `(namespace, name)` in ascending order.

mod priority;
mod registry;

pub use priority::{CandidateEntry, PriorityIndex};
pub use registry::{
    BackendProperties, BackendRegistry, BackendSnapshot, RegistrySnapshot, RegistrySummary,
    ResolvedBackend, UpsertSummary,
};
