//! In-Memory Gateway
//!
//! Serves fixed metric catalogs without any network I/O. Used when the router
//! is embedded next to backends living in the same process, and by tests that
//! need to script discovery outcomes.
//!
//! # Usage
//!
//! ```ignore
//! let gateway = InMemoryGateway::new();
//! gateway.insert(
//!     BackendId::new("monitoring", "adapter"),
//!     InMemoryBackend::new().with_external(ExternalMetricKey::new("queue_depth")),
//! );
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{
    BackendClient, DiscoveryError, DiscoveryGateway, ExternalMetricValue, MetricValue,
    NamespacedName,
};
use crate::descriptor::{BackendDescriptor, BackendId};
use crate::metric::{CustomMetricKey, ExternalMetricKey};

/// Catalog and canned values for one in-memory backend
#[derive(Clone, Debug, Default)]
pub struct InMemoryBackend {
    custom: HashMap<CustomMetricKey, Vec<MetricValue>>,
    external: HashMap<ExternalMetricKey, Vec<ExternalMetricValue>>,
    listing_error: Option<DiscoveryError>,
}

impl InMemoryBackend {
    /// Create an empty backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose a custom metric with no values
    #[must_use]
    pub fn with_custom(mut self, key: CustomMetricKey) -> Self {
        self.custom.entry(key).or_default();
        self
    }

    /// Expose a custom metric and answer queries with `value`
    #[must_use]
    pub fn with_custom_value(mut self, key: CustomMetricKey, value: MetricValue) -> Self {
        self.custom.entry(key).or_default().push(value);
        self
    }

    /// Expose an external metric with no values
    #[must_use]
    pub fn with_external(mut self, key: ExternalMetricKey) -> Self {
        self.external.entry(key).or_default();
        self
    }

    /// Expose an external metric and answer queries with `value`
    #[must_use]
    pub fn with_external_value(
        mut self,
        key: ExternalMetricKey,
        value: ExternalMetricValue,
    ) -> Self {
        self.external.entry(key).or_default().push(value);
        self
    }

    /// Fail every catalog listing with `error`
    #[must_use]
    pub fn with_listing_error(mut self, error: DiscoveryError) -> Self {
        self.listing_error = Some(error);
        self
    }
}

#[derive(Default)]
struct GatewayState {
    backends: HashMap<BackendId, InMemoryBackend>,
    connect_failures: HashMap<BackendId, DiscoveryError>,
    connects: HashMap<BackendId, usize>,
}

/// Gateway handing out clients over [`InMemoryBackend`] catalogs
///
/// Cheap to clone; clones share the same catalogs. A client snapshots its
/// backend at connect time, so changing a catalog only takes effect on the
/// next reconcile of that backend.
#[derive(Clone, Default)]
pub struct InMemoryGateway {
    state: Arc<RwLock<GatewayState>>,
    total_connects: Arc<AtomicUsize>,
}

impl InMemoryGateway {
    /// Create a gateway with no backends
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a backend's catalog
    pub fn insert(&self, id: BackendId, backend: InMemoryBackend) {
        self.state.write().backends.insert(id, backend);
    }

    /// Drop a backend's catalog; later connects fail with `ConnectionFailed`
    pub fn remove(&self, id: &BackendId) {
        self.state.write().backends.remove(id);
    }

    /// Make connects to `id` fail with `error` until [`Self::clear_connect_failure`]
    pub fn fail_connect(&self, id: BackendId, error: DiscoveryError) {
        self.state.write().connect_failures.insert(id, error);
    }

    /// Let connects to `id` succeed again
    pub fn clear_connect_failure(&self, id: &BackendId) {
        self.state.write().connect_failures.remove(id);
    }

    /// Number of connect attempts made for `id`
    #[must_use]
    pub fn connect_count(&self, id: &BackendId) -> usize {
        self.state.read().connects.get(id).copied().unwrap_or(0)
    }

    /// Number of connect attempts across all backends
    #[must_use]
    pub fn total_connects(&self) -> usize {
        self.total_connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiscoveryGateway for InMemoryGateway {
    async fn connect(
        &self,
        descriptor: &BackendDescriptor,
    ) -> Result<Arc<dyn BackendClient>, DiscoveryError> {
        self.total_connects.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.write();
        *state.connects.entry(descriptor.id().clone()).or_insert(0) += 1;

        if let Some(error) = state.connect_failures.get(descriptor.id()) {
            return Err(error.clone());
        }

        let backend = state.backends.get(descriptor.id()).cloned().ok_or_else(|| {
            DiscoveryError::ConnectionFailed(format!(
                "no in-memory backend registered for {}",
                descriptor.id()
            ))
        })?;

        Ok(Arc::new(InMemoryClient { backend }))
    }
}

struct InMemoryClient {
    backend: InMemoryBackend,
}

impl InMemoryClient {
    fn custom_values(&self, key: &CustomMetricKey) -> Result<&[MetricValue], DiscoveryError> {
        self.backend
            .custom
            .get(key)
            .map(Vec::as_slice)
            .ok_or_else(|| DiscoveryError::NotFound(key.to_string()))
    }
}

#[async_trait]
impl BackendClient for InMemoryClient {
    async fn list_custom_metric_keys(&self) -> Result<HashSet<CustomMetricKey>, DiscoveryError> {
        if let Some(error) = &self.backend.listing_error {
            return Err(error.clone());
        }
        Ok(self.backend.custom.keys().cloned().collect())
    }

    async fn list_external_metric_keys(
        &self,
    ) -> Result<HashSet<ExternalMetricKey>, DiscoveryError> {
        if let Some(error) = &self.backend.listing_error {
            return Err(error.clone());
        }
        Ok(self.backend.external.keys().cloned().collect())
    }

    async fn get_metric_by_name(
        &self,
        object: &NamespacedName,
        key: &CustomMetricKey,
        _metric_selector: Option<&str>,
    ) -> Result<MetricValue, DiscoveryError> {
        self.custom_values(key)?
            .iter()
            .find(|value| {
                value.described_object.name == object.name
                    && value.described_object.namespace == object.namespace
            })
            .cloned()
            .ok_or_else(|| DiscoveryError::NotFound(format!("{key} for {object}")))
    }

    // Label selectors are not evaluated; every value in the namespace matches.
    async fn get_metric_by_selector(
        &self,
        namespace: &str,
        _selector: Option<&str>,
        key: &CustomMetricKey,
        _metric_selector: Option<&str>,
    ) -> Result<Vec<MetricValue>, DiscoveryError> {
        Ok(self
            .custom_values(key)?
            .iter()
            .filter(|value| value.described_object.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn get_external_metric(
        &self,
        _namespace: &str,
        _metric_selector: Option<&str>,
        key: &ExternalMetricKey,
    ) -> Result<Vec<ExternalMetricValue>, DiscoveryError> {
        self.backend
            .external
            .get(key)
            .cloned()
            .ok_or_else(|| DiscoveryError::NotFound(key.to_string()))
    }
}
