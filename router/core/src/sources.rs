//! Registration Sources
//!
//! [`DescriptorStore`] implementations that hold the desired set of backends.
//!
//! - [`FileSourceStore`]: a TOML file of `[[backend]]` tables, polled for changes
//! - [`MemorySourceStore`]: registrations managed in code
//!
//! # Backends File
//!
//! ```toml
//! [[backend]]
//! name = "prometheus-adapter"
//! namespace = "monitoring"
//! host = "prometheus-adapter.monitoring.svc"
//! port = 443
//! priority = 1
//! metric_types = ["CustomMetrics", "ExternalMetrics"]
//! ```
//!
//! Registrations without `created_at` are stamped the first time they are
//! seen; the stamp survives later reloads as long as the entry stays in the
//! file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::descriptor::{BackendId, BackendSource};
use crate::error::RouterError;
use crate::reconcile::{DescriptorStore, RegistrationEvent};

/// Errors reading a backends file
#[derive(Debug, Error)]
pub enum SourceError {
    /// The file could not be read
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The file is not valid TOML or has the wrong shape
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: toml::de::Error,
    },
}

#[derive(Debug, Default, Deserialize)]
struct BackendsFile {
    #[serde(default, rename = "backend")]
    backends: Vec<BackendSource>,
}

type Registrations = BTreeMap<BackendId, BackendSource>;

/// Replace `current` with `next`, returning the events that describe the change
fn apply(current: &mut Registrations, mut next: Registrations) -> Vec<RegistrationEvent> {
    let now = Utc::now();
    for (id, source) in &mut next {
        if source.created_at.is_none() {
            source.created_at = current
                .get(id)
                .and_then(|previous| previous.created_at)
                .or(Some(now));
        }
    }

    let mut events = Vec::new();
    for (id, source) in &next {
        match current.get(id) {
            None => events.push(RegistrationEvent::Added(source.clone())),
            Some(previous) if previous != source => {
                events.push(RegistrationEvent::Updated(source.clone()));
            }
            Some(_) => {}
        }
    }
    for id in current.keys() {
        if !next.contains_key(id) {
            events.push(RegistrationEvent::Deleted(id.clone()));
        }
    }

    *current = next;
    events
}

/// Registrations loaded from a TOML file
///
/// Cheap to clone; clones share the same state.
#[derive(Clone, Debug)]
pub struct FileSourceStore {
    path: PathBuf,
    state: Arc<RwLock<Registrations>>,
}

impl FileSourceStore {
    /// Create a store for `path` without reading it
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Create a store and load `path` once
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the file cannot be read or parsed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SourceError> {
        let store = Self::new(path);
        store.reload().await?;
        Ok(store)
    }

    /// Path of the backends file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of registrations currently held
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    /// Whether no registrations are held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().is_empty()
    }

    /// Re-read the file and return what changed
    ///
    /// On error the previously loaded registrations are kept.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the file cannot be read or parsed.
    pub async fn reload(&self) -> Result<Vec<RegistrationEvent>, SourceError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SourceError::Io {
                path: self.path.clone(),
                source,
            })?;
        self.replace_with(&raw)
    }

    /// Parse `raw` as a backends file and diff it against the held state
    fn replace_with(&self, raw: &str) -> Result<Vec<RegistrationEvent>, SourceError> {
        let file: BackendsFile = toml::from_str(raw).map_err(|source| SourceError::Parse {
            path: self.path.clone(),
            source,
        })?;

        let mut next = Registrations::new();
        for source in file.backends {
            let id = source.id();
            if next.insert(id.clone(), source).is_some() {
                tracing::warn!(
                    backend = %id,
                    path = %self.path.display(),
                    "Duplicate registration in backends file; keeping the last one"
                );
            }
        }

        let events = apply(&mut self.state.write(), next);
        if !events.is_empty() {
            tracing::debug!(
                path = %self.path.display(),
                changes = events.len(),
                "Backends file changed"
            );
        }
        Ok(events)
    }

    /// Poll the file every `interval`, forwarding changes to `events`
    ///
    /// Returns when `shutdown` flips to `true`, its sender is dropped, or the
    /// event receiver goes away.
    pub async fn watch(
        &self,
        interval: Duration,
        events: mpsc::Sender<RegistrationEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let period = interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    let changes = match self.reload().await {
                        Ok(changes) => changes,
                        Err(e) => {
                            tracing::warn!(error = %e, "Keeping previous registrations");
                            continue;
                        }
                    };
                    for event in changes {
                        if events.send(event).await.is_err() {
                            tracing::debug!("Registration event receiver closed; stopping watcher");
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl DescriptorStore for FileSourceStore {
    async fn get(&self, id: &BackendId) -> Result<Option<BackendSource>, RouterError> {
        Ok(self.state.read().get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<BackendId>, RouterError> {
        Ok(self.state.read().keys().cloned().collect())
    }
}

/// Registrations managed in code
///
/// Cheap to clone; clones share the same state.
#[derive(Clone, Debug, Default)]
pub struct MemorySourceStore {
    state: Arc<RwLock<Registrations>>,
}

impl MemorySourceStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a registration, stamping `created_at` when absent
    ///
    /// Returns the event to feed to the controller.
    pub fn upsert(&self, mut source: BackendSource) -> RegistrationEvent {
        let id = source.id();
        let mut state = self.state.write();
        let previous = state.get(&id).and_then(|p| p.created_at);
        if source.created_at.is_none() {
            source.created_at = previous.or_else(|| Some(Utc::now()));
        }
        let existed = state.insert(id, source.clone()).is_some();
        if existed {
            RegistrationEvent::Updated(source)
        } else {
            RegistrationEvent::Added(source)
        }
    }

    /// Drop a registration
    ///
    /// Returns the event to feed to the controller, `None` if it was unknown.
    pub fn remove(&self, id: &BackendId) -> Option<RegistrationEvent> {
        self.state
            .write()
            .remove(id)
            .map(|_| RegistrationEvent::Deleted(id.clone()))
    }
}

#[async_trait]
impl DescriptorStore for MemorySourceStore {
    async fn get(&self, id: &BackendId) -> Result<Option<BackendSource>, RouterError> {
        Ok(self.state.read().get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<BackendId>, RouterError> {
        Ok(self.state.read().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(file: &tempfile::NamedTempFile, contents: &str) {
        std::fs::write(file.path(), contents).unwrap();
    }

    const TWO_BACKENDS: &str = r#"
        [[backend]]
        name = "adapter"
        namespace = "monitoring"
        host = "adapter.monitoring"
        port = 443
        priority = 1
        metric_types = ["CustomMetrics"]

        [[backend]]
        name = "keda"
        namespace = "keda"
        host = "keda-metrics.keda"
        port = 6443
        metric_types = ["ExternalMetrics"]
    "#;

    #[tokio::test]
    async fn test_open_loads_and_stamps() {
        let file = tempfile::NamedTempFile::new().unwrap();
        write(&file, TWO_BACKENDS);

        let store = FileSourceStore::open(file.path()).await.unwrap();
        assert_eq!(store.len(), 2);
        let state = store.state.read();
        assert!(state.values().all(|s| s.created_at.is_some()));
    }

    #[tokio::test]
    async fn test_reload_diffs_changes() {
        let file = tempfile::NamedTempFile::new().unwrap();
        write(&file, TWO_BACKENDS);
        let store = FileSourceStore::new(file.path());

        let events = store.reload().await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, RegistrationEvent::Added(_))));

        let stamped = store.state.read()[&BackendId::new("keda", "keda")].created_at;

        write(
            &file,
            r#"
            [[backend]]
            name = "keda"
            namespace = "keda"
            host = "keda-metrics.keda"
            port = 6443
            priority = 5
            metric_types = ["ExternalMetrics"]
            "#,
        );
        let events = store.reload().await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.contains(&RegistrationEvent::Deleted(BackendId::new(
            "monitoring",
            "adapter"
        ))));
        let updated = events
            .iter()
            .find_map(|e| match e {
                RegistrationEvent::Updated(source) => Some(source.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(updated.priority, 5);
        assert_eq!(updated.created_at, stamped);

        assert!(store.reload().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_file_keeps_previous_state() {
        let file = tempfile::NamedTempFile::new().unwrap();
        write(&file, TWO_BACKENDS);
        let store = FileSourceStore::open(file.path()).await.unwrap();

        write(&file, "[[backend]]\nname = ");
        let err = store.reload().await.unwrap_err();
        assert!(matches!(err, SourceError::Parse { .. }));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileSourceStore::open(dir.path().join("absent.toml"))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Io { .. }));
    }

    #[tokio::test]
    async fn test_watch_forwards_changes() {
        let file = tempfile::NamedTempFile::new().unwrap();
        write(&file, "");
        let store = FileSourceStore::open(file.path()).await.unwrap();
        assert!(store.is_empty());

        let (tx, mut rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .watch(Duration::from_millis(10), tx, shutdown_rx)
                    .await;
            })
        };

        write(&file, TWO_BACKENDS);
        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, RegistrationEvent::Added(_)));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), watcher)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_memory_store_events() {
        let store = MemorySourceStore::new();
        let source = BackendSource {
            name: "a".into(),
            namespace: "ns".into(),
            host: "a.ns".into(),
            port: 443,
            insecure_skip_tls_verify: false,
            priority: 0,
            metric_types: Vec::new(),
            created_at: None,
        };

        assert!(matches!(
            store.upsert(source.clone()),
            RegistrationEvent::Added(_)
        ));
        let stamped = store.get(&source.id()).await.unwrap().unwrap().created_at;
        assert!(stamped.is_some());

        match store.upsert(source.clone()) {
            RegistrationEvent::Updated(updated) => assert_eq!(updated.created_at, stamped),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert!(store.remove(&source.id()).is_some());
        assert!(store.remove(&source.id()).is_none());
    }
}
