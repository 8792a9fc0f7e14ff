//! Routed Metrics Provider
//!
//! The query-facing side of the router. Each call picks one backend through
//! the [`BackendRegistry`] and forwards the query to that backend's client.
//! Values are passed back untouched; nothing is cached or merged.

use thiserror::Error;

use crate::descriptor::BackendId;
use crate::discovery::{DiscoveryError, ExternalMetricValue, MetricValue, NamespacedName};
use crate::error::RouterError;
use crate::metric::{CustomMetricKey, ExternalMetricKey, MetricKey};
use crate::routing::{BackendRegistry, ResolvedBackend};

/// Resolve attempts made when the winning backend vanishes mid-lookup
const MAX_RESOLVE_ATTEMPTS: usize = 3;

/// Errors returned to metric query callers
#[derive(Debug, Error)]
pub enum ProviderError {
    /// No backend serves the metric
    #[error(transparent)]
    Routing(#[from] RouterError),

    /// The chosen backend failed to answer
    #[error("metrics backend {backend} failed to answer for {metric}: {source}")]
    Backend {
        /// Backend the query was sent to
        backend: BackendId,
        /// Queried metric
        metric: MetricKey,
        /// Backend failure
        source: DiscoveryError,
    },
}

impl ProviderError {
    /// Whether callers should report "metric not found"
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Routing(e) => e.is_not_found(),
            Self::Backend { source, .. } => matches!(source, DiscoveryError::NotFound(_)),
        }
    }
}

/// Dispatches metric queries to the backend the registry picks
#[derive(Clone, Debug)]
pub struct RoutedProvider {
    registry: BackendRegistry,
}

impl RoutedProvider {
    /// Create a provider reading from `registry`
    #[must_use]
    pub fn new(registry: BackendRegistry) -> Self {
        Self { registry }
    }

    /// Resolve `metric`, retrying when the winner disappears mid-lookup
    ///
    /// An empty index is reported like a missing one.
    fn resolve(&self, metric: &MetricKey) -> Result<ResolvedBackend, RouterError> {
        let mut attempt = 1;
        loop {
            match self.registry.resolve(metric) {
                Ok(resolved) => return Ok(resolved),
                Err(RouterError::NoCandidate { metric }) => {
                    return Err(RouterError::NoRouteForMetric { metric });
                }
                Err(RouterError::BackendPropertiesMissing { backend })
                    if attempt < MAX_RESOLVE_ATTEMPTS =>
                {
                    tracing::debug!(
                        backend = %backend,
                        metric = %metric,
                        attempt,
                        "Resolved backend vanished, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backend_error(
        resolved: ResolvedBackend,
        metric: MetricKey,
        source: DiscoveryError,
    ) -> ProviderError {
        tracing::warn!(
            backend = %resolved.id,
            metric = %metric,
            error = %source,
            "Metrics backend query failed"
        );
        ProviderError::Backend {
            backend: resolved.id,
            metric,
            source,
        }
    }

    /// Fetch a custom metric for one object
    ///
    /// # Errors
    ///
    /// [`ProviderError::Routing`] when no backend serves `key`,
    /// [`ProviderError::Backend`] when the chosen backend fails.
    pub async fn get_metric_by_name(
        &self,
        object: &NamespacedName,
        key: &CustomMetricKey,
        metric_selector: Option<&str>,
    ) -> Result<MetricValue, ProviderError> {
        let metric = MetricKey::Custom(key.clone());
        let resolved = self.resolve(&metric)?;
        match resolved
            .client
            .get_metric_by_name(object, key, metric_selector)
            .await
        {
            Ok(value) => Ok(value),
            Err(e) => Err(Self::backend_error(resolved, metric, e)),
        }
    }

    /// Fetch a custom metric for every object matching `selector` in `namespace`
    ///
    /// # Errors
    ///
    /// See [`Self::get_metric_by_name`].
    pub async fn get_metric_by_selector(
        &self,
        namespace: &str,
        selector: Option<&str>,
        key: &CustomMetricKey,
        metric_selector: Option<&str>,
    ) -> Result<Vec<MetricValue>, ProviderError> {
        let metric = MetricKey::Custom(key.clone());
        let resolved = self.resolve(&metric)?;
        match resolved
            .client
            .get_metric_by_selector(namespace, selector, key, metric_selector)
            .await
        {
            Ok(values) => Ok(values),
            Err(e) => Err(Self::backend_error(resolved, metric, e)),
        }
    }

    /// Fetch an external metric
    ///
    /// # Errors
    ///
    /// See [`Self::get_metric_by_name`].
    pub async fn get_external_metric(
        &self,
        namespace: &str,
        metric_selector: Option<&str>,
        key: &ExternalMetricKey,
    ) -> Result<Vec<ExternalMetricValue>, ProviderError> {
        let metric = MetricKey::External(key.clone());
        let resolved = self.resolve(&metric)?;
        match resolved
            .client
            .get_external_metric(namespace, metric_selector, key)
            .await
        {
            Ok(values) => Ok(values),
            Err(e) => Err(Self::backend_error(resolved, metric, e)),
        }
    }

    /// Every custom metric some backend serves
    #[must_use]
    pub fn list_all_metrics(&self) -> Vec<CustomMetricKey> {
        self.registry.list_custom_metrics()
    }

    /// Every external metric some backend serves
    #[must_use]
    pub fn list_all_external_metrics(&self) -> Vec<ExternalMetricKey> {
        self.registry.list_external_metrics()
    }
}
