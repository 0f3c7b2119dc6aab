//! Cluster API server adapter.
//!
//! Speaks the control plane's REST surface over `reqwest`:
//! - List-then-watch for nodes and workload units, decoding the
//!   newline-delimited JSON watch body
//! - Reconnect with exponential backoff. An expired resource version (410)
//!   forces an immediate relist; in-stream errors and repeated expiries back
//!   off first. Objects missing from the relist are reported deleted
//! - Node resync by re-delivering the cached nodes every resync interval
//! - `POST .../pods/{name}/binding` with the unit's uid as a precondition
//!
//! Only the fields the bridge mirrors are decoded.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::stream::{self, StreamExt};
use kbind_events::{
    NodeSnapshot, ObjectMeta, ResourceKind, Snapshot, Taint, WatchEvent, WatchFault,
    WorkloadPhase, WorkloadUnitSnapshot,
};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Interval;
use tracing::{debug, info, warn};

use super::{
    resync_interval, ApiError, BindingRequest, ClientError, ClusterClient, CurrentBinding,
    WatchStream,
};
use crate::retry::Backoff;

/// Server-side watch timeout; the loop re-watches when the server closes.
const WATCH_TIMEOUT_SECS: u64 = 300;

/// API server adapter configuration.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Base URL of the API server, e.g. `https://10.0.0.1:6443`.
    pub base_url: String,

    /// Bearer token; sent as `Authorization: Bearer ...`.
    pub token: Option<String>,

    /// Deadline for non-watch requests.
    pub request_timeout: Duration,

    /// Reconnect schedule for watches.
    pub reconnect: Backoff,

    /// Only watch workload units naming this scheduler.
    pub scheduler_name: Option<String>,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8001".to_string(),
            token: None,
            request_timeout: Duration::from_secs(10),
            reconnect: Backoff::Exponential {
                base: Duration::from_millis(100),
                max: Duration::from_secs(30),
            },
            scheduler_name: None,
        }
    }
}

/// Cluster client backed by the API server.
#[derive(Clone)]
pub struct ApiServerClient {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    reconnect: Backoff,
    scheduler_name: Option<String>,
}

impl ApiServerClient {
    /// Build a client. Fails on a malformed URL or token.
    pub fn new(config: &ApiServerConfig) -> Result<Self, ClientError> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        reqwest::Url::parse(&base_url)
            .map_err(|e| ClientError::Config(format!("invalid API server URL {base_url}: {e}")))?;

        let mut headers = HeaderMap::new();
        if let Some(token) = &config.token {
            let raw = token.trim();
            let bearer = if raw.starts_with("Bearer ") || raw.starts_with("bearer ") {
                raw.to_string()
            } else {
                format!("Bearer {raw}")
            };
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&bearer)
                    .map_err(|e| ClientError::Config(format!("invalid API token: {e}")))?,
            );
        }

        // No client-wide timeout: watches are long-lived. Plain requests set
        // their own deadline.
        let http = reqwest::Client::builder()
            .user_agent("kbind-bridge/0.1.0")
            .default_headers(headers)
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            request_timeout: config.request_timeout,
            reconnect: config.reconnect.clone(),
            scheduler_name: config.scheduler_name.clone(),
        })
    }

    fn map_send_error(&self, err: reqwest::Error) -> ApiError {
        if err.is_timeout() {
            ApiError::Timeout(self.request_timeout)
        } else {
            ApiError::Transport(err.to_string())
        }
    }

    async fn error_from_response(resp: reqwest::Response) -> ApiError {
        let code = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiStatus>(&body)
            .map(|s| s.message)
            .unwrap_or(body);

        match code {
            StatusCode::NOT_FOUND => ApiError::NotFound(message),
            StatusCode::CONFLICT => ApiError::Conflict(message),
            other => ApiError::Status {
                code: other.as_u16(),
                message,
            },
        }
    }

    fn field_selector<S: ApiResource>(&self) -> Option<String> {
        match (S::kind(), &self.scheduler_name) {
            (ResourceKind::WorkloadUnit, Some(name)) => Some(format!("spec.schedulerName={name}")),
            _ => None,
        }
    }

    async fn list<S: ApiResource>(&self) -> Result<(Vec<S>, String), ApiError> {
        let url = format!("{}{}", self.base_url, S::PATH);
        let mut req = self.http.get(&url);
        if let Some(selector) = self.field_selector::<S>() {
            req = req.query(&[("fieldSelector", selector)]);
        }
        let resp = req
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp).await);
        }

        let list: ApiList = resp.json().await.map_err(|e| self.map_send_error(e))?;
        let mut items = Vec::with_capacity(list.items.len());
        for raw in list.items {
            match S::from_api(raw) {
                Ok(item) => items.push(item),
                Err(e) => warn!(kind = %S::kind(), error = %e, "Skipping undecodable list item"),
            }
        }

        Ok((items, list.metadata.resource_version.unwrap_or_default()))
    }

    async fn open_watch<S: ApiResource>(
        &self,
        resource_version: &str,
    ) -> Result<reqwest::Response, ApiError> {
        let url = format!("{}{}", self.base_url, S::PATH);
        let timeout = WATCH_TIMEOUT_SECS.to_string();
        let mut req = self.http.get(&url);
        if let Some(selector) = self.field_selector::<S>() {
            req = req.query(&[("fieldSelector", selector)]);
        }
        let resp = req
            .query(&[
                ("watch", "true"),
                ("allowWatchBookmarks", "true"),
                ("resourceVersion", resource_version),
                ("timeoutSeconds", timeout.as_str()),
            ])
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp).await);
        }

        Ok(resp)
    }

    fn spawn_watch<S: ApiResource>(&self, resync: Option<Duration>) -> WatchStream<S> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.clone();
        tokio::spawn(async move {
            client.run_watch::<S>(tx, resync).await;
            debug!(kind = %S::kind(), "Watch loop exited");
        });

        Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }

    /// List-then-watch until the consumer drops its stream.
    async fn run_watch<S: ApiResource>(
        &self,
        tx: mpsc::UnboundedSender<WatchEvent<S>>,
        resync: Option<Duration>,
    ) {
        let mut cache: BTreeMap<String, S> = BTreeMap::new();
        let mut failures: u32 = 0;
        let mut resync_timer = resync.map(resync_interval);

        'relist: loop {
            if tx.is_closed() {
                return;
            }

            let (items, mut resource_version) = match self.list::<S>().await {
                Ok(listed) => listed,
                Err(e) => {
                    report_fault(&tx, S::kind(), &e);
                    self.pause(failures).await;
                    failures = failures.saturating_add(1);
                    continue 'relist;
                }
            };
            reconcile_listing(&mut cache, items, &tx);
            info!(kind = %S::kind(), count = cache.len(), resource_version = %resource_version, "Listed resources");

            loop {
                let resp = match self.open_watch::<S>(&resource_version).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        report_fault(&tx, S::kind(), &e);
                        self.pause(failures).await;
                        failures = failures.saturating_add(1);
                        continue 'relist;
                    }
                };

                let mut body = Box::pin(resp.bytes_stream());
                let mut buf = BytesMut::new();

                loop {
                    let chunk = tokio::select! {
                        _ = tx.closed() => return,
                        _ = tick(&mut resync_timer) => {
                            debug!(kind = %S::kind(), count = cache.len(), "Resync");
                            for item in cache.values() {
                                let _ = tx.send(WatchEvent::Modified(item.clone()));
                            }
                            continue;
                        }
                        chunk = body.next() => chunk,
                    };

                    let bytes = match chunk {
                        None => break,
                        Some(Err(e)) => {
                            report_fault(&tx, S::kind(), &self.map_send_error(e));
                            break;
                        }
                        Some(Ok(bytes)) => bytes,
                    };

                    buf.extend_from_slice(&bytes);
                    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                        let line = buf.split_to(pos + 1);
                        match apply_watch_line(&line, &mut cache, &tx) {
                            LineOutcome::Continue(Some(rv)) => {
                                resource_version = rv;
                                failures = 0;
                            }
                            LineOutcome::Continue(None) => {}
                            LineOutcome::Expired if failures == 0 => {
                                failures = 1;
                                continue 'relist;
                            }
                            LineOutcome::Expired | LineOutcome::Relist => {
                                self.pause(failures).await;
                                failures = failures.saturating_add(1);
                                continue 'relist;
                            }
                        }
                    }
                }

                debug!(kind = %S::kind(), resource_version = %resource_version, "Watch closed; re-watching");
            }
        }
    }

    async fn pause(&self, failures: u32) {
        let delay = self.reconnect.delay(failures);
        warn!(delay_ms = delay.as_millis() as u64, failures, "Backing off before reconnect");
        tokio::time::sleep(delay).await;
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn report_fault<S>(tx: &mpsc::UnboundedSender<WatchEvent<S>>, kind: ResourceKind, err: &ApiError) {
    let code = match err {
        ApiError::Status { code, .. } => Some(*code),
        ApiError::NotFound(_) => Some(404),
        ApiError::Conflict(_) => Some(409),
        ApiError::Timeout(_) | ApiError::Transport(_) => None,
    };
    let _ = tx.send(WatchEvent::Error(WatchFault {
        kind,
        code,
        message: err.to_string(),
    }));
}

/// Fold a fresh listing into the cache, emitting what changed since the last
/// one.
fn reconcile_listing<S: ApiResource>(
    cache: &mut BTreeMap<String, S>,
    items: Vec<S>,
    tx: &mpsc::UnboundedSender<WatchEvent<S>>,
) {
    let mut fresh: BTreeMap<String, S> = BTreeMap::new();
    for item in items {
        fresh.insert(item.identity(), item);
    }

    for (identity, old) in cache.iter() {
        if !fresh.contains_key(identity) {
            let _ = tx.send(WatchEvent::Deleted(old.clone()));
        }
    }

    for (identity, item) in &fresh {
        let event = match cache.get(identity) {
            None => WatchEvent::Added(item.clone()),
            Some(old) if old.meta().resource_version != item.meta().resource_version => {
                WatchEvent::Modified(item.clone())
            }
            Some(_) => continue,
        };
        let _ = tx.send(event);
    }

    *cache = fresh;
}

/// What the watch loop does after one line. `Continue` carries the resource
/// version to resume from, if the line advanced it.
#[derive(Debug, PartialEq, Eq)]
enum LineOutcome {
    Continue(Option<String>),
    /// The resume point is too old (410). Relist at once unless the last
    /// relist made no progress.
    Expired,
    /// Any other in-stream error. Relist after backing off.
    Relist,
}

fn apply_watch_line<S: ApiResource>(
    line: &[u8],
    cache: &mut BTreeMap<String, S>,
    tx: &mpsc::UnboundedSender<WatchEvent<S>>,
) -> LineOutcome {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return LineOutcome::Continue(None);
    }

    let raw: RawWatchEvent = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(kind = %S::kind(), error = %e, "Undecodable watch line");
            return LineOutcome::Continue(None);
        }
    };

    match raw.event_type.as_str() {
        "ERROR" => {
            let status: ApiStatus = serde_json::from_value(raw.object).unwrap_or_default();
            let _ = tx.send(WatchEvent::Error(WatchFault {
                kind: S::kind(),
                code: status.code,
                message: status.message,
            }));
            if status.code == Some(StatusCode::GONE.as_u16()) {
                LineOutcome::Expired
            } else {
                LineOutcome::Relist
            }
        }
        "BOOKMARK" => {
            let rv = raw
                .object
                .pointer("/metadata/resourceVersion")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            LineOutcome::Continue(rv)
        }
        kind @ ("ADDED" | "MODIFIED" | "DELETED") => {
            let item = match S::from_api(raw.object) {
                Ok(item) => item,
                Err(e) => {
                    warn!(kind = %S::kind(), error = %e, "Undecodable watch object");
                    return LineOutcome::Continue(None);
                }
            };
            let rv = item.meta().resource_version.clone();
            let event = match kind {
                "DELETED" => {
                    cache.remove(&item.identity());
                    WatchEvent::Deleted(item)
                }
                "ADDED" => {
                    cache.insert(item.identity(), item.clone());
                    WatchEvent::Added(item)
                }
                _ => {
                    cache.insert(item.identity(), item.clone());
                    WatchEvent::Modified(item)
                }
            };
            let _ = tx.send(event);
            LineOutcome::Continue(rv)
        }
        other => {
            debug!(kind = %S::kind(), event_type = other, "Ignoring watch event type");
            LineOutcome::Continue(None)
        }
    }
}

#[async_trait]
impl ClusterClient for ApiServerClient {
    async fn watch_nodes(&self, resync: Duration) -> Result<WatchStream<NodeSnapshot>, ClientError> {
        Ok(self.spawn_watch::<NodeSnapshot>(Some(resync)))
    }

    async fn watch_workload_units(&self) -> Result<WatchStream<WorkloadUnitSnapshot>, ClientError> {
        Ok(self.spawn_watch::<WorkloadUnitSnapshot>(None))
    }

    async fn create_binding(&self, request: &BindingRequest) -> Result<(), ApiError> {
        let url = format!(
            "{}/api/v1/namespaces/{}/pods/{}/binding",
            self.base_url, request.namespace, request.workload_unit_name
        );
        let body = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Binding",
            "metadata": {
                "name": request.workload_unit_name,
                "namespace": request.namespace,
                "uid": request.workload_unit_uid,
            },
            "target": {
                "apiVersion": "v1",
                "kind": "Node",
                "name": request.node_name,
            },
        });

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp).await);
        }
        Ok(())
    }

    async fn current_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CurrentBinding>, ApiError> {
        let url = format!("{}/api/v1/namespaces/{namespace}/pods/{name}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp).await);
        }

        let raw: serde_json::Value = resp.json().await.map_err(|e| self.map_send_error(e))?;
        let unit = WorkloadUnitSnapshot::from_api(raw)
            .map_err(|e| ApiError::Transport(format!("undecodable pod: {e}")))?;
        Ok(Some(CurrentBinding {
            uid: unit.meta.uid,
            node_name: unit.node_name,
        }))
    }
}

// =============================================================================
// Wire types
// =============================================================================

/// A resource the adapter can list and watch.
trait ApiResource: Snapshot {
    /// Collection path under the API server root.
    const PATH: &'static str;

    fn from_api(raw: serde_json::Value) -> Result<Self, serde_json::Error>;
}

#[derive(Debug, Deserialize)]
struct RawWatchEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    object: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ApiList {
    #[serde(default)]
    metadata: ApiListMeta,
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiListMeta {
    #[serde(default)]
    resource_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    uid: String,
    #[serde(default)]
    resource_version: Option<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    owner_references: Vec<ApiOwnerRef>,
}

#[derive(Debug, Deserialize)]
struct ApiOwnerRef {
    name: String,
    #[serde(default)]
    controller: Option<bool>,
}

impl From<ApiMeta> for ObjectMeta {
    fn from(meta: ApiMeta) -> Self {
        let owner = meta
            .owner_references
            .iter()
            .find(|o| o.controller.unwrap_or(false))
            .or_else(|| meta.owner_references.first())
            .map(|o| o.name.clone());

        ObjectMeta {
            name: meta.name,
            namespace: meta.namespace,
            uid: meta.uid,
            resource_version: meta.resource_version,
            labels: meta.labels,
            owner,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiPod {
    metadata: ApiMeta,
    #[serde(default)]
    spec: ApiPodSpec,
    #[serde(default)]
    status: ApiPodStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiPodSpec {
    #[serde(default)]
    node_name: Option<String>,
    #[serde(default)]
    scheduler_name: Option<String>,
    #[serde(default)]
    priority: Option<i32>,
    #[serde(default)]
    containers: Vec<ApiContainer>,
    #[serde(default)]
    node_selector: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiContainer {
    #[serde(default)]
    resources: ApiResources,
}

#[derive(Debug, Default, Deserialize)]
struct ApiResources {
    #[serde(default)]
    requests: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiPodStatus {
    #[serde(default)]
    phase: Option<String>,
}

impl ApiResource for WorkloadUnitSnapshot {
    const PATH: &'static str = "/api/v1/pods";

    fn from_api(raw: serde_json::Value) -> Result<Self, serde_json::Error> {
        let pod: ApiPod = serde_json::from_value(raw)?;
        let mut cpu = 0;
        let mut memory = 0;
        for container in &pod.spec.containers {
            if let Some(q) = container.resources.requests.get("cpu") {
                cpu += parse_cpu_millis(q).unwrap_or(0);
            }
            if let Some(q) = container.resources.requests.get("memory") {
                memory += parse_memory_bytes(q).unwrap_or(0);
            }
        }

        Ok(WorkloadUnitSnapshot {
            meta: pod.metadata.into(),
            phase: pod
                .status
                .phase
                .as_deref()
                .map(WorkloadPhase::from_api)
                .unwrap_or_default(),
            node_name: pod.spec.node_name.filter(|n| !n.is_empty()),
            scheduler_name: pod
                .spec
                .scheduler_name
                .unwrap_or_else(|| "default-scheduler".to_string()),
            priority: pod.spec.priority.unwrap_or(0),
            cpu_request_millis: cpu,
            memory_request_bytes: memory,
            node_selector: pod.spec.node_selector,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiNode {
    metadata: ApiMeta,
    #[serde(default)]
    spec: ApiNodeSpec,
    #[serde(default)]
    status: ApiNodeStatus,
}

#[derive(Debug, Default, Deserialize)]
struct ApiNodeSpec {
    #[serde(default)]
    unschedulable: bool,
    #[serde(default)]
    taints: Vec<ApiTaint>,
}

#[derive(Debug, Deserialize)]
struct ApiTaint {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    effect: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiNodeStatus {
    #[serde(default)]
    allocatable: BTreeMap<String, String>,
    #[serde(default)]
    conditions: Vec<ApiCondition>,
}

#[derive(Debug, Deserialize)]
struct ApiCondition {
    #[serde(rename = "type")]
    condition_type: String,
    status: String,
}

impl ApiResource for NodeSnapshot {
    const PATH: &'static str = "/api/v1/nodes";

    fn from_api(raw: serde_json::Value) -> Result<Self, serde_json::Error> {
        let node: ApiNode = serde_json::from_value(raw)?;
        let allocatable = &node.status.allocatable;
        let ready = node
            .status
            .conditions
            .iter()
            .any(|c| c.condition_type == "Ready" && c.status == "True");

        Ok(NodeSnapshot {
            cpu_allocatable_millis: allocatable
                .get("cpu")
                .and_then(|q| parse_cpu_millis(q))
                .unwrap_or(0),
            memory_allocatable_bytes: allocatable
                .get("memory")
                .and_then(|q| parse_memory_bytes(q))
                .unwrap_or(0),
            pods_allocatable: allocatable
                .get("pods")
                .and_then(|q| q.parse().ok())
                .unwrap_or(0),
            meta: node.metadata.into(),
            unschedulable: node.spec.unschedulable,
            ready,
            taints: node
                .spec
                .taints
                .into_iter()
                .map(|t| Taint {
                    key: t.key,
                    value: t.value,
                    effect: t.effect,
                })
                .collect(),
        })
    }
}

/// Parse a CPU quantity (`"500m"`, `"2"`, `"0.5"`) into millicores.
fn parse_cpu_millis(quantity: &str) -> Option<i64> {
    let q = quantity.trim();
    if let Some(millis) = q.strip_suffix('m') {
        return millis.parse().ok();
    }
    q.parse::<f64>().ok().map(|cores| (cores * 1000.0).round() as i64)
}

/// Parse a memory quantity (`"128Mi"`, `"1G"`, `"1048576"`) into bytes.
fn parse_memory_bytes(quantity: &str) -> Option<i64> {
    const SUFFIXES: &[(&str, i64)] = &[
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("k", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];

    let q = quantity.trim();
    for (suffix, multiplier) in SUFFIXES {
        if let Some(number) = q.strip_suffix(suffix) {
            return number
                .parse::<f64>()
                .ok()
                .map(|n| (n * *multiplier as f64).round() as i64);
        }
    }
    q.parse::<f64>().ok().map(|n| n.round() as i64)
}
