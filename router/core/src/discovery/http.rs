//! HTTP Gateway
//!
//! Talks to backends that serve the Kubernetes custom and external metrics
//! APIs over HTTPS.
//!
//! # Endpoints
//!
//! - `GET /apis/custom.metrics.k8s.io/v1beta1` - custom metric catalog
//! - `GET /apis/external.metrics.k8s.io/v1beta1` - external metric catalog
//! - `GET /apis/custom.metrics.k8s.io/v1beta2/[namespaces/{ns}/]{resource}/{name}/{metric}`
//! - `GET /apis/external.metrics.k8s.io/v1beta1/namespaces/{ns}/{metric}`

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{
    BackendClient, DiscoveryError, DiscoveryGateway, ExternalMetricValue, MetricValue,
    NamespacedName,
};
use crate::config::DiscoveryConfig;
use crate::descriptor::{BackendDescriptor, BackendId};
use crate::metric::{CustomMetricKey, ExternalMetricKey, GroupResource};

const CUSTOM_DISCOVERY_PATH: [&str; 3] = ["apis", "custom.metrics.k8s.io", "v1beta1"];
const CUSTOM_QUERY_PATH: [&str; 3] = ["apis", "custom.metrics.k8s.io", "v1beta2"];
const EXTERNAL_PATH: [&str; 3] = ["apis", "external.metrics.k8s.io", "v1beta1"];

/// Gateway producing [`reqwest`]-backed clients
#[derive(Clone, Debug)]
pub struct HttpDiscoveryGateway {
    timeout: Duration,
    bearer_token_file: Option<PathBuf>,
    ca_cert_file: Option<PathBuf>,
}

impl HttpDiscoveryGateway {
    /// Create a gateway with the given per-request timeout and no credentials
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            bearer_token_file: None,
            ca_cert_file: None,
        }
    }

    /// Create a gateway from the `[discovery]` configuration section
    #[must_use]
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.request_timeout_secs),
            bearer_token_file: config.bearer_token_file.clone(),
            ca_cert_file: config.ca_cert_file.clone(),
        }
    }

    /// Authenticate with the token stored in `path`
    #[must_use]
    pub fn with_bearer_token_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.bearer_token_file = Some(path.into());
        self
    }

    /// Trust the PEM root certificate stored in `path`
    #[must_use]
    pub fn with_ca_cert_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_file = Some(path.into());
        self
    }

    async fn read_file(path: &PathBuf, what: &str) -> Result<Vec<u8>, DiscoveryError> {
        tokio::fs::read(path).await.map_err(|e| {
            DiscoveryError::InvalidConfig(format!("failed to read {what} {}: {e}", path.display()))
        })
    }
}

#[async_trait]
impl DiscoveryGateway for HttpDiscoveryGateway {
    async fn connect(
        &self,
        descriptor: &BackendDescriptor,
    ) -> Result<Arc<dyn BackendClient>, DiscoveryError> {
        let mut builder = reqwest::Client::builder().timeout(self.timeout);

        if descriptor.insecure_skip_tls_verify() {
            builder = builder.danger_accept_invalid_certs(true);
        } else if let Some(path) = &self.ca_cert_file {
            let pem = Self::read_file(path, "CA certificate").await?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                DiscoveryError::InvalidConfig(format!("invalid CA certificate: {e}"))
            })?;
            builder = builder.add_root_certificate(cert);
        }

        let token = match &self.bearer_token_file {
            Some(path) => {
                let raw = Self::read_file(path, "bearer token").await?;
                Some(String::from_utf8_lossy(&raw).trim().to_string())
            }
            None => None,
        };

        let http = builder.build().map_err(|e| {
            DiscoveryError::InvalidConfig(format!("failed to build HTTP client: {e}"))
        })?;

        tracing::debug!(
            backend = %descriptor.id(),
            url = %descriptor.base_url(),
            "Built metrics client"
        );

        Ok(Arc::new(HttpBackendClient {
            id: descriptor.id().clone(),
            base_url: descriptor.base_url(),
            token,
            http,
        }))
    }
}

/// Client for one backend's metrics APIs
struct HttpBackendClient {
    id: BackendId,
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl HttpBackendClient {
    async fn get_json<T, I>(&self, path: I, query: &[(&str, &str)]) -> Result<T, DiscoveryError>
    where
        T: DeserializeOwned,
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let endpoint = endpoint(&self.base_url, path)?;
        let url = endpoint.to_string();
        let mut request = self.http.get(endpoint).query(query);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DiscoveryError::ConnectionFailed(format!("{url}: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(DiscoveryError::NotFound(url));
        }
        if !status.is_success() {
            return Err(DiscoveryError::Status {
                url,
                status: status.as_u16(),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| DiscoveryError::Decode(format!("{url}: {e}")))
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn list_custom_metric_keys(&self) -> Result<HashSet<CustomMetricKey>, DiscoveryError> {
        let list: ApiResourceList = self.get_json(CUSTOM_DISCOVERY_PATH, &[]).await?;
        Ok(parse_custom_resources(&self.id, &list))
    }

    async fn list_external_metric_keys(
        &self,
    ) -> Result<HashSet<ExternalMetricKey>, DiscoveryError> {
        let list: ApiResourceList = self.get_json(EXTERNAL_PATH, &[]).await?;
        Ok(parse_external_resources(&list))
    }

    async fn get_metric_by_name(
        &self,
        object: &NamespacedName,
        key: &CustomMetricKey,
        metric_selector: Option<&str>,
    ) -> Result<MetricValue, DiscoveryError> {
        let path = custom_metric_path(key, &object.namespace, &object.name);
        let query = selector_query(None, metric_selector);
        let list: ValueList<MetricValue> = self.get_json(path, &query).await?;
        list.items
            .into_iter()
            .next()
            .ok_or_else(|| DiscoveryError::NotFound(format!("{key} for {object}")))
    }

    async fn get_metric_by_selector(
        &self,
        namespace: &str,
        selector: Option<&str>,
        key: &CustomMetricKey,
        metric_selector: Option<&str>,
    ) -> Result<Vec<MetricValue>, DiscoveryError> {
        let path = custom_metric_path(key, namespace, "*");
        let query = selector_query(selector, metric_selector);
        let list: ValueList<MetricValue> = self.get_json(path, &query).await?;
        Ok(list.items)
    }

    async fn get_external_metric(
        &self,
        namespace: &str,
        metric_selector: Option<&str>,
        key: &ExternalMetricKey,
    ) -> Result<Vec<ExternalMetricValue>, DiscoveryError> {
        let path = EXTERNAL_PATH
            .into_iter()
            .chain(["namespaces", namespace, key.metric.as_str()]);
        let query = selector_query(None, metric_selector);
        let list: ValueList<ExternalMetricValue> = self.get_json(path, &query).await?;
        Ok(list.items)
    }
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ApiResourceList {
    #[serde(default)]
    resources: Vec<ApiResource>,
}

#[derive(Debug, Deserialize)]
struct ApiResource {
    name: String,
    #[serde(default)]
    namespaced: bool,
}

#[derive(Debug, Deserialize)]
struct ValueList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

/// Parse `{resource}/{metric}` names; the metric part may itself contain `/`
fn parse_custom_resources(
    backend: &BackendId,
    list: &ApiResourceList,
) -> HashSet<CustomMetricKey> {
    let mut keys = HashSet::new();
    for resource in &list.resources {
        let parsed = resource
            .name
            .split_once('/')
            .filter(|(qualified, metric)| !qualified.is_empty() && !metric.is_empty());
        let Some((qualified, metric)) = parsed else {
            tracing::warn!(
                backend = %backend,
                name = %resource.name,
                "Backend returned a malformed custom metric name"
            );
            continue;
        };
        keys.insert(CustomMetricKey::new(
            GroupResource::parse(qualified),
            resource.namespaced,
            metric,
        ));
    }
    keys
}

fn parse_external_resources(list: &ApiResourceList) -> HashSet<ExternalMetricKey> {
    list.resources
        .iter()
        .filter(|resource| !resource.name.is_empty())
        .map(|resource| ExternalMetricKey::new(resource.name.clone()))
        .collect()
}

fn custom_metric_path(key: &CustomMetricKey, namespace: &str, name: &str) -> Vec<String> {
    let mut path: Vec<String> = CUSTOM_QUERY_PATH.iter().map(ToString::to_string).collect();
    if key.namespaced {
        path.push("namespaces".into());
        path.push(namespace.into());
    }
    path.push(key.group_resource.to_string());
    path.push(name.into());
    path.push(key.metric.clone());
    path
}

/// Append `segments` to `base_url`, percent-encoding each one
fn endpoint<I>(base_url: &str, segments: I) -> Result<reqwest::Url, DiscoveryError>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut url = reqwest::Url::parse(base_url).map_err(|e| {
        DiscoveryError::InvalidConfig(format!("invalid backend URL {base_url}: {e}"))
    })?;
    url.path_segments_mut()
        .map_err(|()| {
            DiscoveryError::InvalidConfig(format!("backend URL {base_url} cannot carry a path"))
        })?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn selector_query<'a>(
    selector: Option<&'a str>,
    metric_selector: Option<&'a str>,
) -> Vec<(&'static str, &'a str)> {
    let mut query = Vec::new();
    if let Some(selector) = selector.filter(|s| !s.is_empty()) {
        query.push(("labelSelector", selector));
    }
    if let Some(selector) = metric_selector.filter(|s| !s.is_empty()) {
        query.push(("metricLabelSelector", selector));
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(json: &str) -> ApiResourceList {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_parse_custom_resources_skips_malformed_names() {
        let list = resources(
            r#"{"kind": "APIResourceList", "resources": [
                {"name": "pods/http_requests", "namespaced": true},
                {"name": "deployments.apps/replicas_ready", "namespaced": true},
                {"name": "nodes/load", "namespaced": false},
                {"name": "no_slash", "namespaced": true},
                {"name": "/empty", "namespaced": true},
                {"name": "pods/", "namespaced": true}
            ]}"#,
        );
        let keys = parse_custom_resources(&BackendId::new("ns", "svc"), &list);

        assert_eq!(keys.len(), 3);
        assert!(keys.contains(&CustomMetricKey::new(
            GroupResource::new("", "pods"),
            true,
            "http_requests"
        )));
        assert!(keys.contains(&CustomMetricKey::new(
            GroupResource::new("apps", "deployments"),
            true,
            "replicas_ready"
        )));
        assert!(keys.contains(&CustomMetricKey::new(
            GroupResource::new("", "nodes"),
            false,
            "load"
        )));
    }

    #[test]
    fn test_parse_custom_resources_keeps_slashes_in_metric() {
        let list = resources(
            r#"{"resources": [
                {"name": "jobs.batch/queue/depth", "namespaced": true},
                {"name": "services/http/requests/total", "namespaced": true}
            ]}"#,
        );
        let keys = parse_custom_resources(&BackendId::new("ns", "svc"), &list);

        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&CustomMetricKey::new(
            GroupResource::new("batch", "jobs"),
            true,
            "queue/depth"
        )));
        assert!(keys.contains(&CustomMetricKey::new(
            GroupResource::new("", "services"),
            true,
            "http/requests/total"
        )));
    }

    #[test]
    fn test_parse_external_resources() {
        let list = resources(
            r#"{"resources": [{"name": "queue_depth"}, {"name": "lag", "namespaced": true}]}"#,
        );
        let keys = parse_external_resources(&list);
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&ExternalMetricKey::new("queue_depth")));
    }

    #[test]
    fn test_empty_resource_list() {
        let list = resources(r#"{"kind": "APIResourceList"}"#);
        assert!(parse_external_resources(&list).is_empty());
    }

    const BASE: &str = "https://metrics.monitoring.svc:443";

    #[test]
    fn test_custom_metric_path() {
        let namespaced =
            CustomMetricKey::new(GroupResource::parse("deployments.apps"), true, "replicas");
        let url = endpoint(BASE, custom_metric_path(&namespaced, "web", "*")).unwrap();
        assert_eq!(
            url.path(),
            "/apis/custom.metrics.k8s.io/v1beta2/namespaces/web/deployments.apps/*/replicas"
        );

        let cluster = CustomMetricKey::new(GroupResource::parse("nodes"), false, "load");
        let url = endpoint(BASE, custom_metric_path(&cluster, "ignored", "node-1")).unwrap();
        assert_eq!(url.path(), "/apis/custom.metrics.k8s.io/v1beta2/nodes/node-1/load");
    }

    #[test]
    fn test_endpoint_encodes_each_segment() {
        let key = CustomMetricKey::new(GroupResource::parse("jobs.batch"), true, "queue/depth");
        let url = endpoint(BASE, custom_metric_path(&key, "team a", "job?1")).unwrap();
        assert_eq!(
            url.path(),
            concat!(
                "/apis/custom.metrics.k8s.io/v1beta2",
                "/namespaces/team%20a/jobs.batch/job%3F1/queue%2Fdepth"
            )
        );
        assert_eq!(url.query(), None);

        let url = endpoint(
            BASE,
            EXTERNAL_PATH.into_iter().chain(["namespaces", "web", "lag#p0"]),
        )
        .unwrap();
        assert_eq!(
            url.path(),
            "/apis/external.metrics.k8s.io/v1beta1/namespaces/web/lag%23p0"
        );
    }

    #[test]
    fn test_endpoint_rejects_invalid_base() {
        let result = endpoint("not a url", CUSTOM_DISCOVERY_PATH);
        assert!(matches!(result, Err(DiscoveryError::InvalidConfig(_))));
    }

    #[test]
    fn test_selector_query_skips_empty() {
        assert!(selector_query(None, Some("")).is_empty());
        assert_eq!(
            selector_query(Some("app=web"), Some("queue=a")),
            vec![("labelSelector", "app=web"), ("metricLabelSelector", "queue=a")]
        );
    }

    #[tokio::test]
    async fn test_connect_fails_on_missing_token_file() {
        let gateway = HttpDiscoveryGateway::new(Duration::from_secs(1))
            .with_bearer_token_file("/nonexistent/metrics-router/token");
        let descriptor = BackendDescriptor::new(BackendId::new("ns", "svc"), "localhost", 6443);
        let result = gateway.connect(&descriptor).await;
        assert!(matches!(result, Err(DiscoveryError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_connect_reads_token_file() {
        let dir = tempfile::tempdir().unwrap();
        let token = dir.path().join("token");
        std::fs::write(&token, "secret\n").unwrap();

        let gateway =
            HttpDiscoveryGateway::new(Duration::from_secs(1)).with_bearer_token_file(&token);
        let descriptor = BackendDescriptor::new(BackendId::new("ns", "svc"), "localhost", 6443)
            .with_insecure_skip_tls_verify(true);
        assert!(gateway.connect(&descriptor).await.is_ok());
    }
}
