//! Backend Discovery and Query Clients
//!
//! The router never talks to a metrics backend directly. It goes through two
//! seams:
//!
//! - [`DiscoveryGateway`]: a factory that turns a [`BackendDescriptor`] into a
//!   connected [`BackendClient`]. Called by the reconcile controller, never
//!   while the registry lock is held.
//! - [`BackendClient`]: the per-backend handle. It lists the backend's metric
//!   catalog and answers metric queries once the registry has picked it.
//!
//! # Available Gateways
//!
//! - [`HttpDiscoveryGateway`]: custom/external metrics APIs over HTTPS
//! - [`InMemoryGateway`]: fixed catalogs held in memory (embedding and tests)

mod http;
mod memory;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::descriptor::BackendDescriptor;
use crate::metric::{CustomMetricKey, ExternalMetricKey};

pub use http::HttpDiscoveryGateway;
pub use memory::{InMemoryBackend, InMemoryGateway};

// ============================================================================
// Errors
// ============================================================================

/// Errors from client construction, discovery, or metric queries
#[derive(Clone, Debug, Error, PartialEq)]
pub enum DiscoveryError {
    /// The client could not be built from the descriptor
    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),

    /// The backend could not be reached
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The backend answered with a non-success status
    #[error("request to {url} failed with status {status}")]
    Status {
        /// Requested URL
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// The response body could not be decoded
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// The backend has no value for the requested metric/object
    #[error("metric not found: {0}")]
    NotFound(String),
}

// ============================================================================
// Metric Values
// ============================================================================

/// Reference to a namespaced object a custom metric is queried for
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespacedName {
    /// Object namespace (empty for cluster-scoped objects)
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl NamespacedName {
    /// Create an object reference
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// The object a metric value describes
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    /// Object kind
    #[serde(default)]
    pub kind: String,
    /// Object namespace
    #[serde(default)]
    pub namespace: String,
    /// Object name
    #[serde(default)]
    pub name: String,
    /// API version of the object
    #[serde(default)]
    pub api_version: String,
}

/// Name and optional selector of a reported metric
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricIdentifier {
    /// Metric name
    pub name: String,
    /// Label selector the value was computed for, passed through as-is
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<serde_json::Value>,
}

/// A custom metric value for one object
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricValue {
    /// Object the value describes
    pub described_object: ObjectReference,
    /// Metric identity
    pub metric: MetricIdentifier,
    /// When the value was sampled
    pub timestamp: DateTime<Utc>,
    /// Window the value was aggregated over
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_seconds: Option<i64>,
    /// Quantity string (e.g. `"1500m"`)
    pub value: String,
}

/// An external metric value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalMetricValue {
    /// Metric name
    pub metric_name: String,
    /// Labels identifying this series
    #[serde(default)]
    pub metric_labels: BTreeMap<String, String>,
    /// When the value was sampled
    pub timestamp: DateTime<Utc>,
    /// Window the value was aggregated over
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_seconds: Option<i64>,
    /// Quantity string
    pub value: String,
}

// ============================================================================
// Client and Gateway Traits
// ============================================================================

/// Handle to one metrics backend
///
/// Owned by the backend's registry record and replaced, never mutated, when
/// the backend is re-registered.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// List the custom metrics the backend currently exposes
    async fn list_custom_metric_keys(&self) -> Result<HashSet<CustomMetricKey>, DiscoveryError>;

    /// List the external metrics the backend currently exposes
    async fn list_external_metric_keys(
        &self,
    ) -> Result<HashSet<ExternalMetricKey>, DiscoveryError>;

    /// Fetch a custom metric for a single named object
    async fn get_metric_by_name(
        &self,
        object: &NamespacedName,
        key: &CustomMetricKey,
        metric_selector: Option<&str>,
    ) -> Result<MetricValue, DiscoveryError>;

    /// Fetch a custom metric for every object matching `selector`
    async fn get_metric_by_selector(
        &self,
        namespace: &str,
        selector: Option<&str>,
        key: &CustomMetricKey,
        metric_selector: Option<&str>,
    ) -> Result<Vec<MetricValue>, DiscoveryError>;

    /// Fetch an external metric
    async fn get_external_metric(
        &self,
        namespace: &str,
        metric_selector: Option<&str>,
        key: &ExternalMetricKey,
    ) -> Result<Vec<ExternalMetricValue>, DiscoveryError>;
}

/// Factory for backend clients
#[async_trait]
pub trait DiscoveryGateway: Send + Sync {
    /// Build (and validate) a client for the descriptor's connection parameters
    async fn connect(
        &self,
        descriptor: &BackendDescriptor,
    ) -> Result<Arc<dyn BackendClient>, DiscoveryError>;
}

/// Outcome of discovering one backend
pub struct DiscoveredBackend {
    /// Connected client, to be owned by the registry record
    pub client: Arc<dyn BackendClient>,
    /// Custom metrics the backend exposes (empty unless it serves them)
    pub custom: HashSet<CustomMetricKey>,
    /// External metrics the backend exposes (empty unless it serves them)
    pub external: HashSet<ExternalMetricKey>,
}

/// Connect to a backend and list the catalogs its descriptor declares
///
/// Both catalogs are fetched concurrently; either failing fails the whole
/// discovery so the registry is never updated from a half-known catalog.
///
/// # Errors
///
/// Returns the first connection or listing failure.
pub async fn discover(
    gateway: &dyn DiscoveryGateway,
    descriptor: &BackendDescriptor,
) -> Result<DiscoveredBackend, DiscoveryError> {
    let client = gateway.connect(descriptor).await?;

    let custom = async {
        if descriptor.serves_custom() {
            client.list_custom_metric_keys().await
        } else {
            Ok(HashSet::new())
        }
    };
    let external = async {
        if descriptor.serves_external() {
            client.list_external_metric_keys().await
        } else {
            Ok(HashSet::new())
        }
    };
    let (custom, external) = futures::try_join!(custom, external)?;

    Ok(DiscoveredBackend {
        client,
        custom,
        external,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{BackendId, MetricType};
    use crate::metric::GroupResource;

    fn pods(metric: &str) -> CustomMetricKey {
        CustomMetricKey::new(GroupResource::parse("pods"), true, metric)
    }

    #[tokio::test]
    async fn test_discover_respects_metric_types() {
        let id = BackendId::new("monitoring", "adapter");
        let gateway = InMemoryGateway::new();
        gateway.insert(
            id.clone(),
            InMemoryBackend::new()
                .with_custom(pods("http_requests"))
                .with_external(ExternalMetricKey::new("queue_depth")),
        );

        let custom_only = BackendDescriptor::new(id.clone(), "adapter", 443)
            .with_metric_type(MetricType::CustomMetrics);
        let discovered = discover(&gateway, &custom_only).await.unwrap();
        assert_eq!(discovered.custom.len(), 1);
        assert!(discovered.external.is_empty());

        let both = custom_only.with_metric_type(MetricType::ExternalMetrics);
        let discovered = discover(&gateway, &both).await.unwrap();
        assert_eq!(discovered.custom.len(), 1);
        assert_eq!(discovered.external.len(), 1);
    }

    #[tokio::test]
    async fn test_discover_propagates_listing_failure() {
        let id = BackendId::new("monitoring", "adapter");
        let gateway = InMemoryGateway::new();
        gateway.insert(
            id.clone(),
            InMemoryBackend::new().with_listing_error(DiscoveryError::ConnectionFailed(
                "connection refused".into(),
            )),
        );

        let descriptor =
            BackendDescriptor::new(id, "adapter", 443).with_metric_type(MetricType::CustomMetrics);
        let result = discover(&gateway, &descriptor).await;
        assert!(matches!(result, Err(DiscoveryError::ConnectionFailed(_))));
    }

    #[test]
    fn test_metric_value_wire_format() {
        let json = r#"{
            "describedObject": {"kind": "Pod", "namespace": "web", "name": "web-0", "apiVersion": "v1"},
            "metric": {"name": "http_requests"},
            "timestamp": "2024-01-01T00:00:00Z",
            "windowSeconds": 60,
            "value": "1500m"
        }"#;
        let value: MetricValue = serde_json::from_str(json).unwrap();
        assert_eq!(value.described_object.name, "web-0");
        assert_eq!(value.window_seconds, Some(60));
        assert_eq!(value.value, "1500m");
        assert!(value.metric.selector.is_none());
    }
}
