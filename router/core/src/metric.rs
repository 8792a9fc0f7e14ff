//! Metric Keys
//!
//! Identifying tuples for the metrics a backend can serve. A custom metric is
//! scoped to a resource kind (`pods`, `deployments.apps`, ...) and may be
//! namespaced; an external metric is identified by its name alone.
//!
//! The namespace a query runs in is *not* part of the key: two queries for
//! `pods/http_requests` in different namespaces route through the same index.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A Kubernetes-style group-qualified resource (`deployments.apps`)
///
/// The core group is the empty string, so `pods` has `group == ""`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupResource {
    /// API group (empty for the core group)
    pub group: String,
    /// Plural resource name
    pub resource: String,
}

impl GroupResource {
    /// Create a group resource from its parts
    pub fn new(group: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            resource: resource.into(),
        }
    }

    /// Parse the `resource[.group]` form used in discovery documents
    ///
    /// Everything after the first dot is the group, so
    /// `horizontalpodautoscalers.autoscaling.k8s.io` keeps its dotted group.
    #[must_use]
    pub fn parse(qualified: &str) -> Self {
        match qualified.split_once('.') {
            Some((resource, group)) => Self::new(group, resource),
            None => Self::new("", qualified),
        }
    }
}

impl fmt::Display for GroupResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.resource)
        } else {
            write!(f, "{}.{}", self.resource, self.group)
        }
    }
}

/// Key of a custom (object-scoped) metric
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CustomMetricKey {
    /// Resource kind the metric describes
    pub group_resource: GroupResource,
    /// Whether the described objects live in a namespace
    pub namespaced: bool,
    /// Metric name
    pub metric: String,
}

impl CustomMetricKey {
    /// Create a custom metric key
    pub fn new(group_resource: GroupResource, namespaced: bool, metric: impl Into<String>) -> Self {
        Self {
            group_resource,
            namespaced,
            metric: metric.into(),
        }
    }
}

impl fmt::Display for CustomMetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group_resource, self.metric)?;
        if !self.namespaced {
            write!(f, " (cluster)")?;
        }
        Ok(())
    }
}

/// Key of an external metric
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalMetricKey {
    /// Metric name
    pub metric: String,
}

impl ExternalMetricKey {
    /// Create an external metric key
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
        }
    }
}

impl fmt::Display for ExternalMetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.metric)
    }
}

/// Which of the two metric families a key belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricKind {
    /// Object-scoped custom metrics
    Custom,
    /// External metrics
    External,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom => write!(f, "custom"),
            Self::External => write!(f, "external"),
        }
    }
}

/// A metric key of either family
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MetricKey {
    /// Custom metric key
    Custom(CustomMetricKey),
    /// External metric key
    External(ExternalMetricKey),
}

impl MetricKey {
    /// Family of this key
    #[must_use]
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Custom(_) => MetricKind::Custom,
            Self::External(_) => MetricKind::External,
        }
    }

    /// Bare metric name
    #[must_use]
    pub fn metric_name(&self) -> &str {
        match self {
            Self::Custom(key) => &key.metric,
            Self::External(key) => &key.metric,
        }
    }
}

impl From<CustomMetricKey> for MetricKey {
    fn from(key: CustomMetricKey) -> Self {
        Self::Custom(key)
    }
}

impl From<ExternalMetricKey> for MetricKey {
    fn from(key: ExternalMetricKey) -> Self {
        Self::External(key)
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom(key) => write!(f, "{key}"),
            Self::External(key) => write!(f, "external:{key}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_resource_parse_core_group() {
        let gr = GroupResource::parse("pods");
        assert_eq!(gr.group, "");
        assert_eq!(gr.resource, "pods");
        assert_eq!(gr.to_string(), "pods");
    }

    #[test]
    fn test_group_resource_parse_dotted_group() {
        let gr = GroupResource::parse("horizontalpodautoscalers.autoscaling.k8s.io");
        assert_eq!(gr.resource, "horizontalpodautoscalers");
        assert_eq!(gr.group, "autoscaling.k8s.io");
        assert_eq!(
            gr.to_string(),
            "horizontalpodautoscalers.autoscaling.k8s.io"
        );
    }

    #[test]
    fn test_metric_key_kind_and_name() {
        let custom: MetricKey =
            CustomMetricKey::new(GroupResource::parse("pods"), true, "http_requests").into();
        let external: MetricKey = ExternalMetricKey::new("queue_depth").into();

        assert_eq!(custom.kind(), MetricKind::Custom);
        assert_eq!(custom.metric_name(), "http_requests");
        assert_eq!(external.kind(), MetricKind::External);
        assert_eq!(external.to_string(), "external:queue_depth");
    }

    #[test]
    fn test_namespaced_flag_distinguishes_keys() {
        let namespaced = CustomMetricKey::new(GroupResource::parse("nodes"), true, "load");
        let cluster = CustomMetricKey::new(GroupResource::parse("nodes"), false, "load");
        assert_ne!(namespaced, cluster);
        assert_eq!(cluster.to_string(), "nodes/load (cluster)");
    }
}
