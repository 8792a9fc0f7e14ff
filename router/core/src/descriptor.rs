//! Backend Descriptors
//!
//! A [`BackendSource`] is the declarative registration object as an operator
//! writes it (strings, optional fields). [`BackendSource::to_descriptor`]
//! validates it into an immutable [`BackendDescriptor`], the only form the
//! registry and controller work with.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RouterError;

/// Identity of a registered backend
///
/// Ordered by `(namespace, name)`, which is also the final tie-break between
/// candidates with identical priority and creation time.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendId {
    /// Namespace or scope of the registration
    pub namespace: String,
    /// Registration name
    pub name: String,
}

impl BackendId {
    /// Create a backend identity
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Metric family a backend declares support for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MetricType {
    /// Serves the custom metrics API
    CustomMetrics,
    /// Serves the external metrics API
    ExternalMetrics,
}

impl MetricType {
    /// Wire name of this metric type
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CustomMetrics => "CustomMetrics",
            Self::ExternalMetrics => "ExternalMetrics",
        }
    }
}

impl FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CustomMetrics" => Ok(Self::CustomMetrics),
            "ExternalMetrics" => Ok(Self::ExternalMetrics),
            other => Err(format!(
                "unknown metric type {other:?} (expected CustomMetrics or ExternalMetrics)"
            )),
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated, immutable description of a registered backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendDescriptor {
    id: BackendId,
    host: String,
    port: u16,
    insecure_skip_tls_verify: bool,
    priority: i32,
    created_at: DateTime<Utc>,
    metric_types: BTreeSet<MetricType>,
}

impl BackendDescriptor {
    /// Create a descriptor with priority 0, created now, serving no metric types
    pub fn new(id: BackendId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            insecure_skip_tls_verify: false,
            priority: 0,
            created_at: Utc::now(),
            metric_types: BTreeSet::new(),
        }
    }

    /// Set the selection priority (lower wins)
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the registration timestamp
    #[must_use]
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Declare a served metric type
    #[must_use]
    pub fn with_metric_type(mut self, metric_type: MetricType) -> Self {
        self.metric_types.insert(metric_type);
        self
    }

    /// Skip TLS certificate verification for this backend
    #[must_use]
    pub fn with_insecure_skip_tls_verify(mut self, insecure: bool) -> Self {
        self.insecure_skip_tls_verify = insecure;
        self
    }

    /// Backend identity
    #[must_use]
    pub fn id(&self) -> &BackendId {
        &self.id
    }

    /// Backend host
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Backend port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether TLS verification is disabled
    #[must_use]
    pub fn insecure_skip_tls_verify(&self) -> bool {
        self.insecure_skip_tls_verify
    }

    /// Selection priority (lower wins)
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Registration timestamp
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the backend serves custom metrics
    #[must_use]
    pub fn serves_custom(&self) -> bool {
        self.metric_types.contains(&MetricType::CustomMetrics)
    }

    /// Whether the backend serves external metrics
    #[must_use]
    pub fn serves_external(&self) -> bool {
        self.metric_types.contains(&MetricType::ExternalMetrics)
    }

    /// Base URL of the backend's API
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

/// Declarative backend registration as written by an operator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSource {
    /// Registration name
    pub name: String,
    /// Registration namespace
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Host the backend's API listens on
    pub host: String,
    /// Port the backend's API listens on
    pub port: u16,
    /// Skip TLS certificate verification
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
    /// Selection priority (lower wins)
    #[serde(default)]
    pub priority: i32,
    /// Served metric types (`CustomMetrics`, `ExternalMetrics`)
    #[serde(default)]
    pub metric_types: Vec<String>,
    /// Registration timestamp, stamped by the store when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl BackendSource {
    /// Identity of this registration
    #[must_use]
    pub fn id(&self) -> BackendId {
        BackendId::new(self.namespace.clone(), self.name.clone())
    }

    /// Validate into a descriptor
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::MalformedDescriptor`] for an empty name or host,
    /// a zero port, an unknown metric type, or a missing creation timestamp.
    pub fn to_descriptor(&self) -> Result<BackendDescriptor, RouterError> {
        let malformed = |reason: String| RouterError::MalformedDescriptor {
            backend: self.id(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(malformed("name must not be empty".into()));
        }
        if self.host.trim().is_empty() {
            return Err(malformed("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(malformed("port must be non-zero".into()));
        }
        let created_at = self
            .created_at
            .ok_or_else(|| malformed("creation timestamp is missing".into()))?;

        let mut descriptor = BackendDescriptor::new(self.id(), self.host.clone(), self.port)
            .with_priority(self.priority)
            .with_created_at(created_at)
            .with_insecure_skip_tls_verify(self.insecure_skip_tls_verify);
        for raw in &self.metric_types {
            let metric_type = raw.parse::<MetricType>().map_err(malformed)?;
            descriptor = descriptor.with_metric_type(metric_type);
        }
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn source() -> BackendSource {
        BackendSource {
            name: "prometheus-adapter".into(),
            namespace: "monitoring".into(),
            host: "prometheus-adapter.monitoring".into(),
            port: 443,
            insecure_skip_tls_verify: true,
            priority: 2,
            metric_types: vec!["CustomMetrics".into(), "ExternalMetrics".into()],
            created_at: Some(Utc.timestamp_opt(100, 0).unwrap()),
        }
    }

    #[test]
    fn test_backend_id_display_and_order() {
        let a = BackendId::new("alpha", "zeta");
        let b = BackendId::new("beta", "alpha");
        assert_eq!(a.to_string(), "alpha/zeta");
        assert!(a < b);
    }

    #[test]
    fn test_to_descriptor() {
        let descriptor = source().to_descriptor().unwrap();
        assert_eq!(descriptor.id(), &BackendId::new("monitoring", "prometheus-adapter"));
        assert_eq!(descriptor.priority(), 2);
        assert!(descriptor.serves_custom());
        assert!(descriptor.serves_external());
        assert!(descriptor.insecure_skip_tls_verify());
        assert_eq!(
            descriptor.base_url(),
            "https://prometheus-adapter.monitoring:443"
        );
    }

    #[test]
    fn test_unknown_metric_type_is_malformed() {
        let mut src = source();
        src.metric_types = vec!["CustomMetrics".into(), "Bogus".into()];
        let err = src.to_descriptor().unwrap_err();
        assert!(matches!(err, RouterError::MalformedDescriptor { .. }));
        assert!(err.to_string().contains("Bogus"));
    }

    #[test]
    fn test_missing_fields_are_malformed() {
        let mut src = source();
        src.port = 0;
        assert!(src.to_descriptor().is_err());

        let mut src = source();
        src.created_at = None;
        assert!(src.to_descriptor().is_err());

        let mut src = source();
        src.host = "  ".into();
        assert!(src.to_descriptor().is_err());
    }

    #[test]
    fn test_no_metric_types_is_valid() {
        let mut src = source();
        src.metric_types.clear();
        let descriptor = src.to_descriptor().unwrap();
        assert!(!descriptor.serves_custom());
        assert!(!descriptor.serves_external());
    }

    #[test]
    fn test_source_toml_defaults() {
        let src: BackendSource = toml::from_str(
            r#"
            name = "keda"
            host = "keda-metrics.keda"
            port = 6443
            "#,
        )
        .unwrap();
        assert_eq!(src.namespace, "default");
        assert_eq!(src.priority, 0);
        assert!(!src.insecure_skip_tls_verify);
        assert!(src.metric_types.is_empty());
        assert!(src.created_at.is_none());
    }
}
