//! Router Core - Metric-Key Routing for Metrics Backends
//!
//! This crate routes custom and external metric queries to exactly one of
//! many dynamically registered metrics backends. Several backends may claim
//! the same metric; the registry deterministically picks one by priority and
//! registration age.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐        ┌───────────────────────────────┐
//! │   Registration Sources       │        │        Query Callers          │
//! │  FileSourceStore (polled)    │        │  (metrics API server, tests)  │
//! │  MemorySourceStore           │        └───────────────┬───────────────┘
//! └──────────────┬───────────────┘                        │
//!                │ RegistrationEvent                      │ get_*_metric
//!                ▼                                        ▼
//! ┌──────────────────────────────┐        ┌───────────────────────────────┐
//! │     ReconcileController      │        │        RoutedProvider         │
//! │  WorkQueue (dedup, backoff)  │        │  resolve ──► client.query     │
//! │  workers ──► discover()      │        └───────────────┬───────────────┘
//! └──────────────┬───────────────┘                        │
//!                │ upsert / remove                        │ resolve
//!                ▼                                        ▼
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                          BackendRegistry                               │
//! │   properties ─ custom_index ─ external_index   (one RwLock)            │
//! └───────────────────────────────────────────────────────────────────────┘
//!                ▲
//!                │ connect / list keys (outside the lock)
//! ┌──────────────┴───────────────┐
//! │  DiscoveryGateway            │
//! │  HttpDiscoveryGateway        │
//! │  InMemoryGateway             │
//! └──────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`BackendRegistry`]: concurrently readable metric-key to backend table
//! - [`ReconcileController`]: keeps the registry in line with registrations
//! - [`RoutedProvider`]: forwards metric queries to the chosen backend
//! - [`DiscoveryGateway`]: builds backend clients
//! - [`DescriptorStore`]: desired set of backend registrations
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use router_core::{
//!     BackendRegistry, ControllerOptions, FileSourceStore, HttpDiscoveryGateway,
//!     ReconcileController, RoutedProvider,
//! };
//!
//! let registry = BackendRegistry::new();
//! let store = FileSourceStore::open("backends.toml").await?;
//! let gateway = HttpDiscoveryGateway::new(std::time::Duration::from_secs(10));
//! let controller = Arc::new(ReconcileController::new(
//!     registry.clone(),
//!     Arc::new(store.clone()),
//!     Arc::new(gateway),
//!     ControllerOptions::default(),
//! ));
//!
//! let (event_tx, event_rx) = tokio::sync::mpsc::channel(64);
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! tokio::spawn(Arc::clone(&controller).run(event_rx, shutdown_rx.clone()));
//!
//! let provider = RoutedProvider::new(registry);
//! ```
//!
//! # Module Overview
//!
//! - [`metric`]: metric keys
//! - [`descriptor`]: backend identities, registrations and descriptors
//! - [`discovery`]: backend client and gateway traits, metric values
//! - [`routing`]: priority indices and the backend registry
//! - [`reconcile`]: work queue, backoff and the reconcile controller
//! - [`sources`]: registration stores
//! - [`provider`]: routed metric queries
//! - [`config`]: TOML and environment configuration
//! - [`error`]: routing and reconciliation errors

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod descriptor;
pub mod discovery;
pub mod error;
pub mod metric;
pub mod provider;
pub mod reconcile;
pub mod routing;
pub mod sources;

// Re-exports for convenience
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, DaemonConfig, DiscoveryConfig, ReconcileConfig, RouterConfig, SourcesConfig,
};
pub use descriptor::{BackendDescriptor, BackendId, BackendSource, MetricType};
pub use discovery::{
    discover, BackendClient, DiscoveredBackend, DiscoveryError, DiscoveryGateway,
    ExternalMetricValue, HttpDiscoveryGateway, InMemoryBackend, InMemoryGateway,
    MetricIdentifier, MetricValue, NamespacedName, ObjectReference,
};
pub use error::RouterError;
pub use metric::{CustomMetricKey, ExternalMetricKey, GroupResource, MetricKey, MetricKind};
pub use provider::{ProviderError, RoutedProvider};
pub use reconcile::{
    Backoff, ControllerOptions, ControllerStats, DescriptorStore, ReconcileController,
    ReconcileState, RegistrationEvent, StatsSnapshot, WorkQueue,
};
pub use routing::{
    BackendRegistry, CandidateEntry, PriorityIndex, RegistrySnapshot, RegistrySummary,
    ResolvedBackend,
};
pub use sources::{FileSourceStore, MemorySourceStore, SourceError};
