//! # Remote Replicas
//!
//! The peer side of replication: a revision-tracked document database
//! with a changes feed.
//!
//! ## Wire Protocol (CouchDB-compatible)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        HttpReplica Requests                             │
//! │                                                                         │
//! │  ping             GET  <url>/                 2xx, 401, 403 → reachable │
//! │  ensure_database  PUT  <url>/<db>             201, 202, 412 → ok        │
//! │  changes          GET  <url>/<db>/_changes?include_docs=true            │
//! │                                  &since=<seq>&limit=<n>                 │
//! │  bulk_docs        POST <url>/<db>/_bulk_docs                            │
//! │                   { "docs": [...], "new_edits": false }                 │
//! │                                                                         │
//! │  new_edits:false keeps the revisions we send, so both sides converge   │
//! │  on the same `_rev` for every document.                                 │
//! │                                                                         │
//! │  Authorization: Basic <user:password> when credentials are set         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use tally_core::Document;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Configuration
// =============================================================================

/// Where and how to reach the remote database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Server base URL, e.g. `https://sync.example.com`.
    pub url: String,
    /// Database name on that server.
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl RemoteConfig {
    pub fn new(url: impl Into<String>, database: impl Into<String>) -> Self {
        RemoteConfig {
            url: url.into(),
            database: database.into(),
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Parses the server URL; only `http` and `https` are accepted.
    pub fn validate(&self) -> SyncResult<Url> {
        let url = Url::parse(&self.url)?;

        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(SyncError::InvalidUrl(format!(
                    "unsupported scheme '{}' in {}",
                    other, self.url
                )))
            }
        }

        if url.host_str().is_none() {
            return Err(SyncError::InvalidUrl(format!("missing host in {}", self.url)));
        }

        if self.database.is_empty() {
            return Err(SyncError::InvalidConfig("remote database name is empty".into()));
        }

        Ok(url)
    }

    /// `<url>/<database>`.
    pub fn database_url(&self) -> SyncResult<Url> {
        let mut base = self.validate()?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(base.join(&self.database)?)
    }
}

// =============================================================================
// Replica Trait
// =============================================================================

/// One page of the remote changes feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangesBatch {
    pub docs: Vec<Document>,
    /// Opaque checkpoint to resume from.
    pub last_seq: String,
}

/// A document the remote refused to store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeniedDoc {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkReport {
    /// Documents accepted by the remote.
    pub written: usize,
    pub denied: Vec<DeniedDoc>,
}

/// Remote document database used as the replication peer.
#[async_trait]
pub trait RemoteReplica: Send + Sync {
    /// Database URL; part of the replication id.
    fn url(&self) -> &str;

    /// Reachability probe.
    async fn ping(&self) -> SyncResult<()>;

    /// Creates the database if it does not exist.
    async fn ensure_database(&self) -> SyncResult<()>;

    /// Changes after `since` (from the start when `None`), at most `limit`.
    async fn changes(&self, since: Option<&str>, limit: usize) -> SyncResult<ChangesBatch>;

    /// Stores documents with their revisions preserved.
    async fn bulk_docs(&self, docs: Vec<Document>) -> SyncResult<BulkReport>;
}

/// Builds a replica from configuration.
pub trait ReplicaConnector: Send + Sync {
    fn connect(&self, config: &RemoteConfig) -> SyncResult<Arc<dyn RemoteReplica>>;
}

/// Connector for [`HttpReplica`].
#[derive(Debug, Clone)]
pub struct HttpConnector {
    pub probe_timeout: Duration,
    pub request_timeout: Duration,
}

impl HttpConnector {
    pub fn new(probe_timeout: Duration, request_timeout: Duration) -> Self {
        HttpConnector {
            probe_timeout,
            request_timeout,
        }
    }
}

impl ReplicaConnector for HttpConnector {
    fn connect(&self, config: &RemoteConfig) -> SyncResult<Arc<dyn RemoteReplica>> {
        let replica = HttpReplica::new(config, self.probe_timeout)?.with_request_timeout(self.request_timeout);
        Ok(Arc::new(replica))
    }
}

// =============================================================================
// HTTP Replica
// =============================================================================

#[derive(Deserialize)]
struct ChangesResponse {
    #[serde(default)]
    results: Vec<ChangeRow>,
    #[serde(default)]
    last_seq: Value,
}

#[derive(Deserialize)]
struct ChangeRow {
    id: String,
    #[serde(default)]
    doc: Option<Value>,
}

#[derive(Deserialize)]
struct BulkRow {
    #[serde(default)]
    id: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// CouchDB-compatible replica over `reqwest`.
pub struct HttpReplica {
    client: reqwest::Client,
    server: Url,
    database: Url,
    database_url: String,
    username: Option<String>,
    password: Option<String>,
    probe_timeout: Duration,
    request_timeout: Duration,
}

/// Applied to every request except the reachability probe.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

impl HttpReplica {
    pub fn new(config: &RemoteConfig, probe_timeout: Duration) -> SyncResult<Self> {
        let server = config.validate()?;
        let database = config.database_url()?;

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| SyncError::ConnectionFailed(e.to_string()))?;

        Ok(HttpReplica {
            client,
            server,
            database_url: database.to_string(),
            database,
            username: config.username.clone(),
            password: config.password.clone(),
            probe_timeout,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Bounds `_changes`, `_bulk_docs` and database creation.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.client.request(method, url).timeout(self.request_timeout);
        match &self.username {
            Some(username) => request.basic_auth(username, self.password.as_ref()),
            None => request,
        }
    }

    fn endpoint(&self, segment: &str) -> SyncResult<Url> {
        let mut url = self.database.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidUrl(self.database_url.clone()))?
            .push(segment);
        Ok(url)
    }

    async fn status_error(response: reqwest::Response) -> SyncError {
        let status = response.status().as_u16();
        let reason = response.text().await.unwrap_or_default();
        SyncError::RemoteStatus { status, reason }
    }
}

#[async_trait]
impl RemoteReplica for HttpReplica {
    fn url(&self) -> &str {
        &self.database_url
    }

    async fn ping(&self) -> SyncResult<()> {
        let response = self
            .request(Method::GET, self.server.clone())
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SyncError::Timeout(self.probe_timeout.as_secs())
                } else {
                    SyncError::from(e)
                }
            })?;

        let status = response.status();
        if status.is_success() || status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            debug!(url = %self.server, status = status.as_u16(), "Remote reachable");
            Ok(())
        } else {
            Err(Self::status_error(response).await)
        }
    }

    async fn ensure_database(&self) -> SyncResult<()> {
        let response = self.request(Method::PUT, self.database.clone()).send().await?;

        match response.status() {
            StatusCode::CREATED | StatusCode::ACCEPTED => {
                debug!(database = %self.database_url, "Remote database created");
                Ok(())
            }
            StatusCode::PRECONDITION_FAILED => Ok(()),
            _ => Err(Self::status_error(response).await),
        }
    }

    async fn changes(&self, since: Option<&str>, limit: usize) -> SyncResult<ChangesBatch> {
        let mut url = self.endpoint("_changes")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("include_docs", "true");
            query.append_pair("limit", &limit.to_string());
            if let Some(since) = since {
                query.append_pair("since", since);
            }
        }

        let response = self.request(Method::GET, url).send().await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let body: ChangesResponse = response.json().await?;
        let mut docs = Vec::with_capacity(body.results.len());
        for row in body.results {
            let Some(doc) = row.doc else {
                continue;
            };
            match serde_json::from_value::<Document>(doc) {
                Ok(doc) => docs.push(doc),
                Err(e) => debug!(id = %row.id, reason = %e, "Skipping foreign document"),
            }
        }

        let last_seq = match body.last_seq {
            Value::String(seq) => seq,
            Value::Null => since.unwrap_or("0").to_string(),
            other => other.to_string(),
        };

        Ok(ChangesBatch { docs, last_seq })
    }

    async fn bulk_docs(&self, docs: Vec<Document>) -> SyncResult<BulkReport> {
        if docs.is_empty() {
            return Ok(BulkReport::default());
        }

        let sent = docs.len();
        let url = self.endpoint("_bulk_docs")?;
        let response = self
            .request(Method::POST, url)
            .json(&json!({ "docs": docs, "new_edits": false }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let rows: Vec<BulkRow> = response.json().await?;
        let mut report = BulkReport {
            written: sent,
            denied: Vec::new(),
        };

        for row in rows {
            let Some(error) = row.error else {
                continue;
            };
            report.written = report.written.saturating_sub(1);
            let reason = row.reason.unwrap_or_else(|| error.clone());
            match error.as_str() {
                "forbidden" | "unauthorized" => report.denied.push(DeniedDoc { id: row.id, reason }),
                _ => warn!(id = %row.id, error = %error, reason = %reason, "Remote rejected document"),
            }
        }

        Ok(report)
    }
}

// =============================================================================
// In-Memory Replica
// =============================================================================

#[derive(Default)]
struct MemoryState {
    /// id → (remote seq, document)
    docs: BTreeMap<String, (u64, Document)>,
    update_seq: u64,
    created: bool,
}

struct MemoryInner {
    name: String,
    url: String,
    reachable: AtomicBool,
    denied: Mutex<HashSet<String>>,
    state: Mutex<MemoryState>,
}

/// In-process peer. Clones share the same database.
///
/// Keeps the highest revision per id, the way a revision-tracked
/// database picks its winner.
#[derive(Clone)]
pub struct MemoryReplica {
    inner: Arc<MemoryInner>,
}

impl MemoryReplica {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        MemoryReplica {
            inner: Arc::new(MemoryInner {
                url: format!("memory://{}", name),
                name,
                reachable: AtomicBool::new(true),
                denied: Mutex::new(HashSet::new()),
                state: Mutex::new(MemoryState::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Simulates the network path to this peer going up or down.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Refuse writes to `id` from now on.
    pub fn deny(&self, id: impl Into<String>) {
        self.inner.denied.lock().insert(id.into());
    }

    /// Every stored document in remote sequence order.
    pub fn docs(&self) -> Vec<Document> {
        let state = self.inner.state.lock();
        let mut docs: Vec<(u64, Document)> = state.docs.values().cloned().collect();
        docs.sort_by_key(|(seq, _)| *seq);
        docs.into_iter().map(|(_, doc)| doc).collect()
    }

    pub fn get(&self, id: &str) -> Option<Document> {
        self.inner.state.lock().docs.get(id).map(|(_, doc)| doc.clone())
    }

    pub fn is_created(&self) -> bool {
        self.inner.state.lock().created
    }

    fn check_reachable(&self) -> SyncResult<()> {
        if self.inner.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::ConnectionFailed(format!("{} is unreachable", self.inner.url)))
        }
    }

    fn store(&self, state: &mut MemoryState, doc: Document) {
        let newer = match state.docs.get(&doc.id) {
            Some((_, existing)) => doc.rev > existing.rev,
            None => true,
        };
        if newer {
            state.update_seq += 1;
            let seq = state.update_seq;
            state.docs.insert(doc.id.clone(), (seq, doc));
        }
    }
}

impl ReplicaConnector for MemoryReplica {
    fn connect(&self, _config: &RemoteConfig) -> SyncResult<Arc<dyn RemoteReplica>> {
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl RemoteReplica for MemoryReplica {
    fn url(&self) -> &str {
        &self.inner.url
    }

    async fn ping(&self) -> SyncResult<()> {
        self.check_reachable()
    }

    async fn ensure_database(&self) -> SyncResult<()> {
        self.check_reachable()?;
        self.inner.state.lock().created = true;
        Ok(())
    }

    async fn changes(&self, since: Option<&str>, limit: usize) -> SyncResult<ChangesBatch> {
        self.check_reachable()?;
        let since_seq = since.and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);

        let state = self.inner.state.lock();
        let mut rows: Vec<&(u64, Document)> = state
            .docs
            .values()
            .filter(|(seq, _)| *seq > since_seq)
            .collect();
        rows.sort_by_key(|(seq, _)| *seq);
        rows.truncate(limit);

        let last_seq = rows.last().map(|(seq, _)| *seq).unwrap_or(since_seq);
        Ok(ChangesBatch {
            docs: rows.into_iter().map(|(_, doc)| doc.clone()).collect(),
            last_seq: last_seq.to_string(),
        })
    }

    async fn bulk_docs(&self, docs: Vec<Document>) -> SyncResult<BulkReport> {
        self.check_reachable()?;
        let denied_ids = self.inner.denied.lock().clone();
        let mut report = BulkReport::default();

        let mut state = self.inner.state.lock();
        for doc in docs {
            if denied_ids.contains(&doc.id) {
                report.denied.push(DeniedDoc {
                    id: doc.id,
                    reason: "forbidden by validation".to_string(),
                });
                continue;
            }
            if doc.rev.is_none() {
                report.denied.push(DeniedDoc {
                    id: doc.id,
                    reason: "missing _rev".to_string(),
                });
                continue;
            }
            self.store(&mut state, doc);
            report.written += 1;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use axum::extract::Query;
    use axum::http::{HeaderMap, StatusCode as HttpStatus};
    use axum::routing::{get, post, put};
    use axum::{Json, Router};
    use tally_core::{Event, Revision};

    fn doc(id: &str, rev: &str, total: i64) -> Document {
        Document::from_event(Event {
            id: id.to_string(),
            seq: 1,
            event_type: "sale.recorded".to_string(),
            at: 1_700_000_000_000,
            payload: json!({ "total": total }),
            aggregate: None,
            version: None,
        })
        .with_rev(rev.parse::<Revision>().unwrap())
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn replica(url: &str) -> HttpReplica {
        HttpReplica::new(&RemoteConfig::new(url, "tally_events_main"), Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn test_remote_config_validation() {
        assert!(RemoteConfig::new("https://sync.example.com", "db").validate().is_ok());
        assert!(matches!(
            RemoteConfig::new("sync.example.com", "db").validate(),
            Err(SyncError::InvalidUrl(_))
        ));
        assert!(matches!(
            RemoteConfig::new("ws://sync.example.com", "db").validate(),
            Err(SyncError::InvalidUrl(_))
        ));
        assert!(RemoteConfig::new("http://sync.example.com", "").validate().is_err());
    }

    #[test]
    fn test_database_url_joins_path() {
        let plain = RemoteConfig::new("https://sync.example.com", "tally_events_main");
        assert_eq!(
            plain.database_url().unwrap().as_str(),
            "https://sync.example.com/tally_events_main"
        );

        let nested = RemoteConfig::new("https://sync.example.com/couch", "tally_events_main");
        assert_eq!(
            nested.database_url().unwrap().as_str(),
            "https://sync.example.com/couch/tally_events_main"
        );
    }

    #[tokio::test]
    async fn test_ping_accepts_auth_challenge() {
        let ok = serve(Router::new().route("/", get(|| async { "{}" }))).await;
        let challenge = serve(Router::new().route("/", get(|| async { HttpStatus::UNAUTHORIZED }))).await;
        let broken = serve(Router::new().route("/", get(|| async { HttpStatus::INTERNAL_SERVER_ERROR }))).await;

        assert!(replica(&ok).ping().await.is_ok());
        assert!(replica(&challenge).ping().await.is_ok());
        assert!(matches!(
            replica(&broken).ping().await,
            Err(SyncError::RemoteStatus { status: 500, .. })
        ));
    }

    #[tokio::test]
    async fn test_ping_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = replica(&format!("http://{}", addr)).ping().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_ensure_database_sends_basic_auth() {
        let router = Router::new().route(
            "/tally_events_main",
            put(|headers: HeaderMap| async move {
                match headers.get("authorization").and_then(|v| v.to_str().ok()) {
                    Some("Basic YWRtaW46c2VjcmV0") => HttpStatus::PRECONDITION_FAILED,
                    _ => HttpStatus::UNAUTHORIZED,
                }
            }),
        );
        let url = serve(router).await;

        assert!(replica(&url).ensure_database().await.is_err());

        let config = RemoteConfig::new(url.as_str(), "tally_events_main").with_credentials("admin", "secret");
        let authed = HttpReplica::new(&config, Duration::from_secs(2)).unwrap();
        assert!(authed.ensure_database().await.is_ok());
    }

    #[tokio::test]
    async fn test_stalled_changes_feed_times_out() {
        let router = Router::new().route(
            "/tally_events_main/_changes",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Json(json!({ "results": [], "last_seq": "0" }))
            }),
        );
        let url = serve(router).await;

        let replica = replica(&url).with_request_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = replica.changes(None, 10).await.unwrap_err();

        assert!(matches!(err, SyncError::Timeout(_)));
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_changes_parses_feed() {
        let feed = json!({
            "results": [
                { "seq": 1, "id": "k1", "doc": serde_json::to_value(doc("k1", "1-a", 10)).unwrap() },
                { "seq": 2, "id": "design", "doc": { "_id": "_design/app", "_rev": "1-x" } },
                { "seq": 3, "id": "k2", "doc": serde_json::to_value(doc("k2", "2-b", 20)).unwrap() }
            ],
            "last_seq": "3-g1AAAA"
        });
        let router = Router::new().route(
            "/tally_events_main/_changes",
            get(move |Query(params): Query<HashMap<String, String>>| {
                let feed = feed.clone();
                async move {
                    assert_eq!(params.get("include_docs").map(String::as_str), Some("true"));
                    assert_eq!(params.get("since").map(String::as_str), Some("0"));
                    Json(feed)
                }
            }),
        );
        let url = serve(router).await;

        let batch = replica(&url).changes(Some("0"), 50).await.unwrap();
        let ids: Vec<&str> = batch.docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["k1", "k2"]);
        assert_eq!(batch.docs[1].rev.as_ref().unwrap().to_string(), "2-b");
        assert_eq!(batch.last_seq, "3-g1AAAA");
    }

    #[tokio::test]
    async fn test_bulk_docs_reports_denied() {
        let router = Router::new().route(
            "/tally_events_main/_bulk_docs",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["new_edits"], false);
                assert_eq!(body["docs"].as_array().unwrap().len(), 3);
                (
                    HttpStatus::CREATED,
                    Json(json!([
                        { "id": "k2", "error": "forbidden", "reason": "read only" },
                        { "id": "k3", "error": "conflict" }
                    ])),
                )
            }),
        );
        let url = serve(router).await;

        let report = replica(&url)
            .bulk_docs(vec![doc("k1", "1-a", 1), doc("k2", "1-b", 2), doc("k3", "1-c", 3)])
            .await
            .unwrap();

        assert_eq!(report.written, 1);
        assert_eq!(
            report.denied,
            vec![DeniedDoc { id: "k2".into(), reason: "read only".into() }]
        );
    }

    #[tokio::test]
    async fn test_memory_replica_keeps_highest_revision() {
        let remote = MemoryReplica::new("branch");
        remote.bulk_docs(vec![doc("k1", "1-b", 10)]).await.unwrap();
        remote.bulk_docs(vec![doc("k1", "1-a", 99)]).await.unwrap();
        assert_eq!(remote.get("k1").unwrap().event.payload, json!({ "total": 10 }));

        remote.bulk_docs(vec![doc("k1", "2-a", 11)]).await.unwrap();
        assert_eq!(remote.get("k1").unwrap().event.payload, json!({ "total": 11 }));

        // Only the winning writes advance the feed.
        let batch = remote.changes(None, 10).await.unwrap();
        assert_eq!(batch.docs.len(), 1);
        assert_eq!(batch.last_seq, "2");
    }

    #[tokio::test]
    async fn test_memory_replica_feed_and_reachability() {
        let remote = MemoryReplica::new("branch");
        remote
            .bulk_docs(vec![doc("a", "1-a", 1), doc("b", "1-b", 2), doc("c", "1-c", 3)])
            .await
            .unwrap();

        let first = remote.changes(None, 2).await.unwrap();
        assert_eq!(first.docs.len(), 2);
        let rest = remote.changes(Some(&first.last_seq), 2).await.unwrap();
        assert_eq!(rest.docs.len(), 1);
        assert_eq!(rest.docs[0].id, "c");
        let empty = remote.changes(Some(&rest.last_seq), 2).await.unwrap();
        assert!(empty.docs.is_empty());
        assert_eq!(empty.last_seq, rest.last_seq);

        remote.deny("d");
        let report = remote.bulk_docs(vec![doc("d", "1-d", 4)]).await.unwrap();
        assert_eq!(report.written, 0);
        assert_eq!(report.denied.len(), 1);

        remote.set_reachable(false);
        assert!(remote.ping().await.is_err());
        assert!(remote.changes(None, 10).await.is_err());
        remote.set_reachable(true);
        assert!(remote.ensure_database().await.is_ok());
        assert!(remote.is_created());
    }
}
