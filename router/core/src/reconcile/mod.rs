//! Reconciliation
//!
//! Keeps the [`BackendRegistry`](crate::routing::BackendRegistry) in line with
//! the registrations a [`DescriptorStore`] holds and with each backend's own
//! metric catalog.
//!
//! # Flow
//!
//! ```text
//!  RegistrationEvent ──► ReconcileController::handle_event
//!        │                    │ Added/Updated       │ Deleted
//!        │                    ▼                     ▼
//!        │               WorkQueue (dedup)     registry.remove + queue.discard
//!        │                    │
//!        │              worker: store.get ──► to_descriptor ──► discover ──► registry.upsert
//!        │                    │ failure
//!        │                    └──► add_rate_limited (exponential backoff)
//!  resync tick ──► enqueue every id in store.list()
//! ```

mod backoff;
mod controller;
mod queue;
mod stats;

use async_trait::async_trait;

use crate::descriptor::{BackendId, BackendSource};
use crate::error::RouterError;

pub use backoff::Backoff;
pub use controller::{ControllerOptions, ReconcileController, ReconcileState};
pub use queue::WorkQueue;
pub use stats::{ControllerStats, StatsSnapshot};

/// A change to the set of registered backends
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistrationEvent {
    /// A backend registration appeared
    Added(BackendSource),
    /// A backend registration changed
    Updated(BackendSource),
    /// A backend registration went away
    Deleted(BackendId),
}

impl RegistrationEvent {
    /// Identity the event is about
    #[must_use]
    pub fn id(&self) -> BackendId {
        match self {
            Self::Added(source) | Self::Updated(source) => source.id(),
            Self::Deleted(id) => id.clone(),
        }
    }
}

/// Lookup of the desired state of each backend
#[async_trait]
pub trait DescriptorStore: Send + Sync {
    /// Current registration for `id`, `None` if it no longer exists
    async fn get(&self, id: &BackendId) -> Result<Option<BackendSource>, RouterError>;

    /// Identities of every current registration
    async fn list(&self) -> Result<Vec<BackendId>, RouterError>;
}
