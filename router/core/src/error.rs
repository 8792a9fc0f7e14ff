//! Router Errors
//!
//! One error type covers both the query path and reconciliation. Query-path
//! callers only ever see the first three variants; the rest are produced and
//! consumed by the reconcile controller.

use thiserror::Error;

use crate::descriptor::BackendId;
use crate::discovery::DiscoveryError;
use crate::metric::MetricKey;

/// Errors produced by the routing registry and the reconcile controller
#[derive(Debug, Error)]
pub enum RouterError {
    /// No backend currently claims this metric
    #[error("metric {metric} is not provided by any metrics backend")]
    NoRouteForMetric {
        /// The metric that was looked up
        metric: MetricKey,
    },

    /// The metric's index exists but holds no candidates
    #[error("no backend candidate for metric {metric}")]
    NoCandidate {
        /// The metric that was looked up
        metric: MetricKey,
    },

    /// The winning candidate was removed between index and properties lookup
    #[error("properties for metrics backend {backend} are missing")]
    BackendPropertiesMissing {
        /// The backend that vanished
        backend: BackendId,
    },

    /// Client construction or discovery against the backend failed
    #[error("metrics backend {backend} is unreachable: {source}")]
    BackendUnreachable {
        /// The backend being reconciled
        backend: BackendId,
        /// Underlying discovery failure
        source: DiscoveryError,
    },

    /// The registration object cannot be turned into a descriptor
    #[error("malformed descriptor for {backend}: {reason}")]
    MalformedDescriptor {
        /// The offending registration
        backend: BackendId,
        /// What is wrong with it
        reason: String,
    },
}

impl RouterError {
    /// Whether callers should report "metric not found"
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NoRouteForMetric { .. } | Self::NoCandidate { .. }
        )
    }

    /// Whether retrying the same operation later can succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendPropertiesMissing { .. } | Self::BackendUnreachable { .. }
        )
    }
}
