//! Backend Registry
//!
//! Owns every [`PriorityIndex`] plus the per-backend [`BackendProperties`]
//! records, all behind one readers-writer lock.
//!
//! # Architecture
//!
//! ```text
//!                        BackendRegistry
//!        ┌──────────────────────────────────────────────────┐
//!        │  Arc<RwLock<Inner>>                              │
//!        │                                                  │
//!        │  properties:     BackendId        → Properties   │
//!        │  custom_index:   CustomMetricKey  → PriorityIndex│
//!        │  external_index: ExternalMetricKey→ PriorityIndex│
//!        └──────────────────────────────────────────────────┘
//!             ▲ write (upsert/remove)      ▲ read (resolve/list)
//!             │                            │
//!      ReconcileController           RoutedProvider
//! ```
//!
//! # Thread Safety
//!
//! Every public operation takes the lock exactly once for its whole logical
//! step, so readers never see a backend half-moved between indices. No I/O
//! happens under the lock: discovery runs before [`BackendRegistry::upsert`]
//! is called, and resolved clients are cloned out before any query is sent.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use super::priority::{CandidateEntry, PriorityIndex};
use crate::descriptor::{BackendDescriptor, BackendId};
use crate::discovery::BackendClient;
use crate::error::RouterError;
use crate::metric::{CustomMetricKey, ExternalMetricKey, MetricKey, MetricKind};

/// Per-backend record, replaced wholesale on every successful reconcile
pub struct BackendProperties {
    descriptor: BackendDescriptor,
    custom: HashSet<CustomMetricKey>,
    external: HashSet<ExternalMetricKey>,
    client: Arc<dyn BackendClient>,
}

impl BackendProperties {
    /// Descriptor the record was built from
    #[must_use]
    pub fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    /// Selection priority
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.descriptor.priority()
    }

    /// Custom metrics last discovered from this backend
    #[must_use]
    pub fn custom_keys(&self) -> &HashSet<CustomMetricKey> {
        &self.custom
    }

    /// External metrics last discovered from this backend
    #[must_use]
    pub fn external_keys(&self) -> &HashSet<ExternalMetricKey> {
        &self.external
    }
}

impl fmt::Debug for BackendProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendProperties")
            .field("descriptor", &self.descriptor)
            .field("custom", &self.custom.len())
            .field("external", &self.external.len())
            .finish_non_exhaustive()
    }
}

/// A backend picked by [`BackendRegistry::resolve`]
#[derive(Clone)]
pub struct ResolvedBackend {
    /// Identity of the winning backend
    pub id: BackendId,
    /// Client to send the query through
    pub client: Arc<dyn BackendClient>,
}

impl fmt::Debug for ResolvedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedBackend")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// What an upsert changed in the indices
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    /// Whether a previous record was replaced
    pub replaced: bool,
    /// Custom keys the backend now claims
    pub custom: usize,
    /// External keys the backend now claims
    pub external: usize,
    /// Custom keys the backend no longer claims
    pub stale_custom: usize,
    /// External keys the backend no longer claims
    pub stale_external: usize,
    /// Indices deleted because they became empty
    pub pruned: usize,
}

/// Counts for heartbeat logging
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySummary {
    /// Registered backends
    pub backends: usize,
    /// Routed custom metrics
    pub custom_metrics: usize,
    /// Routed external metrics
    pub external_metrics: usize,
}

impl fmt::Display for RegistrySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} backends, {} custom metrics, {} external metrics",
            self.backends, self.custom_metrics, self.external_metrics
        )
    }
}

/// A backend record inside a [`RegistrySnapshot`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BackendSnapshot {
    /// Selection priority
    pub priority: i32,
    /// Registration timestamp
    pub created_at: DateTime<Utc>,
    /// Claimed custom metrics
    pub custom: BTreeSet<CustomMetricKey>,
    /// Claimed external metrics
    pub external: BTreeSet<ExternalMetricKey>,
}

/// Point-in-time copy of the whole registry, taken under one read lock
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
    /// Backend records by identity
    pub backends: BTreeMap<BackendId, BackendSnapshot>,
    /// Custom metric candidates, best first
    pub custom_index: BTreeMap<CustomMetricKey, Vec<CandidateEntry>>,
    /// External metric candidates, best first
    pub external_index: BTreeMap<ExternalMetricKey, Vec<CandidateEntry>>,
}

impl RegistrySnapshot {
    /// Describe every way the snapshot breaks the registry's consistency rules
    ///
    /// Empty when the indices exactly mirror the backend records, every index
    /// is sorted, and no index is empty.
    #[must_use]
    pub fn violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        check_family(
            &self.custom_index,
            &self.backends,
            |b| &b.custom,
            "custom",
            &mut violations,
        );
        check_family(
            &self.external_index,
            &self.backends,
            |b| &b.external,
            "external",
            &mut violations,
        );
        violations
    }
}

fn check_family<K>(
    index: &BTreeMap<K, Vec<CandidateEntry>>,
    backends: &BTreeMap<BackendId, BackendSnapshot>,
    claims_of: impl Fn(&BackendSnapshot) -> &BTreeSet<K>,
    family: &str,
    violations: &mut Vec<String>,
) where
    K: Ord + fmt::Display,
{
    for (key, entries) in index {
        if entries.is_empty() {
            violations.push(format!("{family} index for {key} is empty"));
        }
        let sorted = entries.windows(2).all(|w| {
            (w[0].priority, w[0].created_at, &w[0].backend)
                < (w[1].priority, w[1].created_at, &w[1].backend)
        });
        if !sorted {
            violations.push(format!("{family} index for {key} is out of order"));
        }
        for entry in entries {
            match backends.get(&entry.backend) {
                None => violations.push(format!(
                    "{family} index for {key} lists unregistered backend {}",
                    entry.backend
                )),
                Some(backend) if !claims_of(backend).contains(key) => violations.push(format!(
                    "{family} index for {key} lists {} which does not claim it",
                    entry.backend
                )),
                Some(_) => {}
            }
        }
    }

    for (id, backend) in backends {
        for key in claims_of(backend) {
            let listed = index
                .get(key)
                .map_or(0, |entries| entries.iter().filter(|e| &e.backend == id).count());
            if listed != 1 {
                violations.push(format!(
                    "{family} metric {key} claimed by {id} is indexed {listed} times"
                ));
            }
        }
    }
}

#[derive(Default)]
struct Inner {
    properties: HashMap<BackendId, BackendProperties>,
    custom_index: HashMap<CustomMetricKey, PriorityIndex>,
    external_index: HashMap<ExternalMetricKey, PriorityIndex>,
}

/// Drop `backend` from the index of every key in `keys`, pruning emptied indices
///
/// Returns the number of pruned indices.
fn unindex<'a, K>(
    index: &mut HashMap<K, PriorityIndex>,
    keys: impl IntoIterator<Item = &'a K>,
    backend: &BackendId,
) -> usize
where
    K: Eq + Hash + fmt::Display + 'a,
{
    let mut pruned = 0;
    for key in keys {
        let Some(candidates) = index.get_mut(key) else {
            continue;
        };
        if candidates.remove(backend) {
            index.remove(key);
            pruned += 1;
            tracing::debug!(backend = %backend, metric = %key, "Pruned empty metric index");
        }
    }
    pruned
}

fn reindex<'a, K>(
    index: &mut HashMap<K, PriorityIndex>,
    keys: impl IntoIterator<Item = &'a K>,
    entry: &CandidateEntry,
) where
    K: Eq + Hash + Clone + 'a,
{
    for key in keys {
        index.entry(key.clone()).or_default().upsert(entry.clone());
    }
}

fn best_of<K>(
    index: &HashMap<K, PriorityIndex>,
    key: &K,
    metric: impl Fn() -> MetricKey,
) -> Result<BackendId, RouterError>
where
    K: Eq + Hash,
{
    let candidates = index
        .get(key)
        .ok_or_else(|| RouterError::NoRouteForMetric { metric: metric() })?;
    candidates
        .best()
        .map(|entry| entry.backend.clone())
        .ok_or_else(|| RouterError::NoCandidate { metric: metric() })
}

fn snapshot_index<K>(index: &HashMap<K, PriorityIndex>) -> BTreeMap<K, Vec<CandidateEntry>>
where
    K: Ord + Clone,
{
    index
        .iter()
        .map(|(key, candidates)| (key.clone(), candidates.entries().to_vec()))
        .collect()
}

/// Concurrently readable routing table from metric key to backend
///
/// Cheap to clone; clones share the same state.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl BackendRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a backend's record and index entries with a fresh discovery
    ///
    /// Keys the backend claimed before but not in `custom`/`external` lose the
    /// backend's entry (and disappear if it was their only candidate). Every
    /// discovered key gets a fresh entry carrying the descriptor's current
    /// priority and creation time.
    pub fn upsert(
        &self,
        descriptor: BackendDescriptor,
        custom: HashSet<CustomMetricKey>,
        external: HashSet<ExternalMetricKey>,
        client: Arc<dyn BackendClient>,
    ) -> UpsertSummary {
        let id = descriptor.id().clone();
        let entry = CandidateEntry::from_descriptor(&descriptor);

        let mut inner = self.inner.write();
        let inner = &mut *inner;

        let mut summary = UpsertSummary {
            custom: custom.len(),
            external: external.len(),
            ..UpsertSummary::default()
        };

        if let Some(previous) = inner.properties.get(&id) {
            summary.replaced = true;
            let stale_custom: Vec<&CustomMetricKey> = previous.custom.difference(&custom).collect();
            let stale_external: Vec<&ExternalMetricKey> =
                previous.external.difference(&external).collect();
            summary.stale_custom = stale_custom.len();
            summary.stale_external = stale_external.len();
            summary.pruned += unindex(&mut inner.custom_index, stale_custom, &id);
            summary.pruned += unindex(&mut inner.external_index, stale_external, &id);
        }

        reindex(&mut inner.custom_index, &custom, &entry);
        reindex(&mut inner.external_index, &external, &entry);

        inner.properties.insert(
            id.clone(),
            BackendProperties {
                descriptor,
                custom,
                external,
                client,
            },
        );

        tracing::info!(
            backend = %id,
            priority = entry.priority,
            custom = summary.custom,
            external = summary.external,
            stale_custom = summary.stale_custom,
            stale_external = summary.stale_external,
            replaced = summary.replaced,
            "Metrics backend registered"
        );
        summary
    }

    /// Drop a backend and all of its index entries
    ///
    /// Returns whether the backend was registered. Removing an unknown
    /// backend is a no-op.
    pub fn remove(&self, id: &BackendId) -> bool {
        let mut inner = self.inner.write();
        let inner = &mut *inner;

        let Some(previous) = inner.properties.remove(id) else {
            tracing::debug!(backend = %id, "Ignoring removal of unregistered backend");
            return false;
        };

        let pruned = unindex(&mut inner.custom_index, &previous.custom, id)
            + unindex(&mut inner.external_index, &previous.external, id);

        tracing::info!(
            backend = %id,
            custom = previous.custom.len(),
            external = previous.external.len(),
            pruned,
            "Metrics backend removed"
        );
        true
    }

    /// Pick the backend that answers queries for `metric`
    ///
    /// # Errors
    ///
    /// - [`RouterError::NoRouteForMetric`] when no backend claims the metric
    /// - [`RouterError::NoCandidate`] when the index exists but is empty
    /// - [`RouterError::BackendPropertiesMissing`] when the winner has no record
    pub fn resolve(&self, metric: &MetricKey) -> Result<ResolvedBackend, RouterError> {
        let inner = self.inner.read();

        let backend = match metric {
            MetricKey::Custom(key) => best_of(&inner.custom_index, key, || metric.clone())?,
            MetricKey::External(key) => best_of(&inner.external_index, key, || metric.clone())?,
        };

        let properties = inner
            .properties
            .get(&backend)
            .ok_or_else(|| RouterError::BackendPropertiesMissing {
                backend: backend.clone(),
            })?;

        Ok(ResolvedBackend {
            id: backend,
            client: Arc::clone(&properties.client),
        })
    }

    /// [`Self::resolve`] for a custom metric
    ///
    /// # Errors
    ///
    /// See [`Self::resolve`].
    pub fn resolve_custom(&self, key: &CustomMetricKey) -> Result<ResolvedBackend, RouterError> {
        self.resolve(&MetricKey::Custom(key.clone()))
    }

    /// [`Self::resolve`] for an external metric
    ///
    /// # Errors
    ///
    /// See [`Self::resolve`].
    pub fn resolve_external(
        &self,
        key: &ExternalMetricKey,
    ) -> Result<ResolvedBackend, RouterError> {
        self.resolve(&MetricKey::External(key.clone()))
    }

    /// Every metric of `kind` that currently has a route, unordered
    #[must_use]
    pub fn list_metric_keys(&self, kind: MetricKind) -> Vec<MetricKey> {
        let inner = self.inner.read();
        match kind {
            MetricKind::Custom => inner
                .custom_index
                .keys()
                .cloned()
                .map(MetricKey::Custom)
                .collect(),
            MetricKind::External => inner
                .external_index
                .keys()
                .cloned()
                .map(MetricKey::External)
                .collect(),
        }
    }

    /// Every routed custom metric, unordered
    #[must_use]
    pub fn list_custom_metrics(&self) -> Vec<CustomMetricKey> {
        self.inner.read().custom_index.keys().cloned().collect()
    }

    /// Every routed external metric, unordered
    #[must_use]
    pub fn list_external_metrics(&self) -> Vec<ExternalMetricKey> {
        self.inner.read().external_index.keys().cloned().collect()
    }

    /// Whether `id` has a record
    #[must_use]
    pub fn contains(&self, id: &BackendId) -> bool {
        self.inner.read().properties.contains_key(id)
    }

    /// Identities of every registered backend
    #[must_use]
    pub fn backend_ids(&self) -> Vec<BackendId> {
        self.inner.read().properties.keys().cloned().collect()
    }

    /// Backend and metric counts
    #[must_use]
    pub fn summary(&self) -> RegistrySummary {
        let inner = self.inner.read();
        RegistrySummary {
            backends: inner.properties.len(),
            custom_metrics: inner.custom_index.len(),
            external_metrics: inner.external_index.len(),
        }
    }

    /// Copy the full state under one read lock
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.read();
        RegistrySnapshot {
            backends: inner
                .properties
                .iter()
                .map(|(id, props)| {
                    (
                        id.clone(),
                        BackendSnapshot {
                            priority: props.priority(),
                            created_at: props.descriptor.created_at(),
                            custom: props.custom.iter().cloned().collect(),
                            external: props.external.iter().cloned().collect(),
                        },
                    )
                })
                .collect(),
            custom_index: snapshot_index(&inner.custom_index),
            external_index: snapshot_index(&inner.external_index),
        }
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("summary", &self.summary())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{DiscoveryGateway, InMemoryBackend, InMemoryGateway};
    use crate::metric::GroupResource;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    async fn client(id: &BackendId) -> Arc<dyn BackendClient> {
        let gateway = InMemoryGateway::new();
        gateway.insert(id.clone(), InMemoryBackend::new());
        gateway
            .connect(&BackendDescriptor::new(id.clone(), "localhost", 443))
            .await
            .unwrap()
    }

    fn descriptor(name: &str, priority: i32, created: i64) -> BackendDescriptor {
        BackendDescriptor::new(BackendId::new("ns", name), format!("{name}.ns"), 443)
            .with_priority(priority)
            .with_created_at(Utc.timestamp_opt(created, 0).unwrap())
    }

    fn pods(metric: &str) -> CustomMetricKey {
        CustomMetricKey::new(GroupResource::parse("pods"), true, metric)
    }

    fn custom(keys: &[&str]) -> HashSet<CustomMetricKey> {
        keys.iter().map(|k| pods(k)).collect()
    }

    fn external(keys: &[&str]) -> HashSet<ExternalMetricKey> {
        keys.iter().map(|k| ExternalMetricKey::new(*k)).collect()
    }

    async fn upsert(
        registry: &BackendRegistry,
        descriptor: BackendDescriptor,
        custom_keys: &[&str],
        external_keys: &[&str],
    ) -> UpsertSummary {
        let client = client(descriptor.id()).await;
        registry.upsert(descriptor, custom(custom_keys), external(external_keys), client)
    }

    #[tokio::test]
    async fn test_resolve_prefers_lower_priority() {
        let registry = BackendRegistry::new();
        upsert(&registry, descriptor("a", 2, 0), &["m"], &[]).await;
        upsert(&registry, descriptor("b", 1, 10), &["m"], &[]).await;

        let resolved = registry.resolve_custom(&pods("m")).unwrap();
        assert_eq!(resolved.id.name, "b");
        assert!(registry.snapshot().violations().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_unknown_metric() {
        let registry = BackendRegistry::new();
        let err = registry
            .resolve_external(&ExternalMetricKey::new("missing"))
            .unwrap_err();
        assert!(matches!(err, RouterError::NoRouteForMetric { .. }));
    }

    #[tokio::test]
    async fn test_shrinking_catalog_prunes_stale_keys() {
        let registry = BackendRegistry::new();
        upsert(&registry, descriptor("a", 1, 0), &["x", "y"], &["q"]).await;
        upsert(&registry, descriptor("b", 1, 5), &["y"], &[]).await;

        let summary = upsert(&registry, descriptor("a", 1, 0), &["y"], &[]).await;
        assert!(summary.replaced);
        assert_eq!(summary.stale_custom, 1);
        assert_eq!(summary.stale_external, 1);
        assert_eq!(summary.pruned, 2);

        let snapshot = registry.snapshot();
        assert!(!snapshot.custom_index.contains_key(&pods("x")));
        assert!(snapshot.external_index.is_empty());
        assert_eq!(snapshot.custom_index[&pods("y")].len(), 2);
        assert!(snapshot.violations().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_updates_priority_in_place() {
        let registry = BackendRegistry::new();
        upsert(&registry, descriptor("a", 1, 0), &[], &["q"]).await;
        upsert(&registry, descriptor("b", 2, 0), &[], &["q"]).await;
        assert_eq!(
            registry.resolve_external(&ExternalMetricKey::new("q")).unwrap().id.name,
            "a"
        );

        upsert(&registry, descriptor("a", 3, 0), &[], &["q"]).await;
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.external_index[&ExternalMetricKey::new("q")].len(), 2);
        assert_eq!(
            registry.resolve_external(&ExternalMetricKey::new("q")).unwrap().id.name,
            "b"
        );
    }

    #[tokio::test]
    async fn test_remove_covers_both_families() {
        let registry = BackendRegistry::new();
        upsert(&registry, descriptor("a", 1, 0), &["m"], &["q"]).await;

        assert!(registry.remove(&BackendId::new("ns", "a")));
        assert_eq!(registry.summary(), RegistrySummary::default());
        assert!(registry.list_metric_keys(MetricKind::Custom).is_empty());
        assert!(registry.list_metric_keys(MetricKind::External).is_empty());

        assert!(!registry.remove(&BackendId::new("ns", "a")));
    }

    #[tokio::test]
    async fn test_backend_without_metric_types_has_record_only() {
        let registry = BackendRegistry::new();
        upsert(&registry, descriptor("idle", 0, 0), &[], &[]).await;

        assert!(registry.contains(&BackendId::new("ns", "idle")));
        let summary = registry.summary();
        assert_eq!(summary.backends, 1);
        assert_eq!(summary.custom_metrics, 0);
        assert_eq!(summary.external_metrics, 0);
    }

    #[tokio::test]
    async fn test_violations_detects_inconsistency() {
        let registry = BackendRegistry::new();
        upsert(&registry, descriptor("a", 1, 0), &["m"], &[]).await;

        let mut snapshot = registry.snapshot();
        snapshot.custom_index.insert(pods("orphan"), Vec::new());
        snapshot
            .backends
            .get_mut(&BackendId::new("ns", "a"))
            .unwrap()
            .external
            .insert(ExternalMetricKey::new("unindexed"));

        assert_eq!(snapshot.violations().len(), 2);
    }

    #[test]
    fn test_summary_display() {
        let summary = RegistrySummary {
            backends: 2,
            custom_metrics: 3,
            external_metrics: 1,
        };
        assert_eq!(
            summary.to_string(),
            "2 backends, 3 custom metrics, 1 external metrics"
        );
    }
}
