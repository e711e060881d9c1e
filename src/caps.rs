//! The capability table: the bundle of host services made available to every
//! running job.
//!
//! Each field is an `Arc<dyn Trait>` so a per-job override is a shallow clone
//! that shares every sub-capability by reference and replaces only the field
//! being overridden. Jobs never mutate capabilities.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;

use crate::error::JobError;
use crate::job::{Job, JobResult};

/// HTTP verb crossing the FFI as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn from_i32(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(HttpMethod::Get),
            1 => Some(HttpMethod::Post),
            2 => Some(HttpMethod::Patch),
            3 => Some(HttpMethod::Delete),
            _ => None,
        }
    }
}

/// Log severity crossing the FFI as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn from_i32(raw: i32) -> Self {
        match raw {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            3 => LogLevel::Warn,
            4 => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, msg: &str);
}

#[async_trait]
pub trait HttpFetch: Send + Sync {
    async fn fetch(
        &self,
        method: HttpMethod,
        url: &str,
        body: Vec<u8>,
        authorization: Option<String>,
    ) -> anyhow::Result<Vec<u8>>;
}

#[async_trait]
pub trait GraphQlFetch: Send + Sync {
    async fn query(
        &self,
        endpoint: &str,
        query: &str,
        authorization: Option<String>,
    ) -> anyhow::Result<serde_json::Value>;
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn set(&self, key: &str, value: Vec<u8>, ttl_seconds: Option<u32>) -> anyhow::Result<()>;
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
}

pub trait FileSource: Send + Sync {
    fn static_file(&self, name: &str) -> anyhow::Result<Vec<u8>>;
}

pub trait RequestAccessor: Send + Sync {
    fn field(&self, field_type: i32, key: &str) -> anyhow::Result<Vec<u8>>;
}

pub trait ResponseMutator: Send + Sync {
    fn set_header(&self, key: &str, value: &str) -> anyhow::Result<()>;
}

pub trait AuthProvider: Send + Sync {
    fn authorization_for(&self, url: &str) -> Option<String>;
}

pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Handle back into the scheduler so a running job can submit chained jobs.
pub(crate) type Dispatcher = Arc<dyn Fn(Job) -> Result<JobResult, JobError> + Send + Sync>;

/// Bundle of host services passed by reference into every running job.
#[derive(Clone)]
pub struct Capabilities {
    pub logger: Arc<dyn LogSink>,
    pub http: Arc<dyn HttpFetch>,
    pub graphql: Arc<dyn GraphQlFetch>,
    pub cache: Arc<dyn CacheStore>,
    pub file: Arc<dyn FileSource>,
    pub request: Arc<dyn RequestAccessor>,
    pub response: Arc<dyn ResponseMutator>,
    pub auth: Arc<dyn AuthProvider>,
    pub config: Arc<dyn ConfigSource>,
    pub(crate) dispatch: Option<Dispatcher>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            logger: Arc::new(TracingLog),
            http: Arc::new(HttpFetcher::default()),
            graphql: Arc::new(GraphQlFetcher::default()),
            cache: Arc::new(InMemoryCache::default()),
            file: Arc::new(NoFiles),
            request: Arc::new(Unbound),
            response: Arc::new(Unbound),
            auth: Arc::new(NoAuth),
            config: Arc::new(EnvConfig),
            dispatch: None,
        }
    }
}

impl Capabilities {
    pub fn with_http(mut self, http: Arc<dyn HttpFetch>) -> Self {
        self.http = http;
        self
    }

    pub fn with_graphql(mut self, graphql: Arc<dyn GraphQlFetch>) -> Self {
        self.graphql = graphql;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_file(mut self, file: Arc<dyn FileSource>) -> Self {
        self.file = file;
        self
    }

    pub fn with_request(mut self, request: Arc<dyn RequestAccessor>) -> Self {
        self.request = request;
        self
    }

    pub fn with_response(mut self, response: Arc<dyn ResponseMutator>) -> Self {
        self.response = response;
        self
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_config(mut self, config: Arc<dyn ConfigSource>) -> Self {
        self.config = config;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn LogSink>) -> Self {
        self.logger = logger;
        self
    }

    /// Submit a chained job through the scheduler that owns this table.
    pub fn dispatch_job(&self, job: Job) -> Result<JobResult, JobError> {
        match &self.dispatch {
            Some(dispatch) => dispatch(job),
            None => Err(JobError::NoWorker("no dispatcher bound".into())),
        }
    }
}

// ----------------------------------------------------------------------------
// Bundled implementations
// ----------------------------------------------------------------------------

/// Forwards guest log lines into the host's tracing subscriber.
pub struct TracingLog;

impl LogSink for TracingLog {
    fn log(&self, level: LogLevel, msg: &str) {
        match level {
            LogLevel::Trace => tracing::trace!(target: "hive::guest", "{msg}"),
            LogLevel::Debug => tracing::debug!(target: "hive::guest", "{msg}"),
            LogLevel::Info => tracing::info!(target: "hive::guest", "{msg}"),
            LogLevel::Warn => tracing::warn!(target: "hive::guest", "{msg}"),
            LogLevel::Error => tracing::error!(target: "hive::guest", "{msg}"),
        }
    }
}

/// reqwest-backed HTTP fetcher with a response size cap.
pub struct HttpFetcher {
    client: reqwest::Client,
    max_resp_bytes: usize,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
            max_resp_bytes: 50 * 1024 * 1024,
        }
    }
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client, max_resp_bytes: usize) -> Self {
        Self {
            client,
            max_resp_bytes,
        }
    }
}

#[async_trait]
impl HttpFetch for HttpFetcher {
    async fn fetch(
        &self,
        method: HttpMethod,
        url: &str,
        body: Vec<u8>,
        authorization: Option<String>,
    ) -> anyhow::Result<Vec<u8>> {
        let mut req = match method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => self.client.post(url),
            HttpMethod::Patch => self.client.patch(url),
            HttpMethod::Delete => self.client.delete(url),
        };
        if let Some(header) = authorization {
            req = req.header(AUTHORIZATION, header);
        }
        if !body.is_empty() {
            req = req.body(body);
        }
        let resp = req.send().await.context("failed to send request")?;
        let status = resp.status();
        let bytes = resp.bytes().await.context("failed to read response body")?;
        if bytes.len() > self.max_resp_bytes {
            bail!("response exceeds {} byte cap", self.max_resp_bytes);
        }
        if !status.is_success() {
            bail!("request to {url} failed with status {status}");
        }
        Ok(bytes.to_vec())
    }
}

/// GraphQL client posting `{"query": …}` and returning the JSON reply.
pub struct GraphQlFetcher {
    client: reqwest::Client,
}

impl Default for GraphQlFetcher {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl GraphQlFetch for GraphQlFetcher {
    async fn query(
        &self,
        endpoint: &str,
        query: &str,
        authorization: Option<String>,
    ) -> anyhow::Result<serde_json::Value> {
        let mut req = self
            .client
            .post(endpoint)
            .json(&serde_json::json!({ "query": query }));
        if let Some(header) = authorization {
            req = req.header(AUTHORIZATION, header);
        }
        let resp = req.send().await.context("failed to send query")?;
        let status = resp.status();
        if !status.is_success() {
            bail!("query to {endpoint} failed with status {status}");
        }
        resp.json().await.context("failed to parse query response")
    }
}

struct CacheEntry {
    value: Vec<u8>,
    expires: Option<Instant>,
}

/// In-process cache with per-entry TTL.
#[derive(Default)]
pub struct InMemoryCache {
    entries: parking_lot::Mutex<HashMap<String, CacheEntry>>,
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn set(&self, key: &str, value: Vec<u8>, ttl_seconds: Option<u32>) -> anyhow::Result<()> {
        let expires = ttl_seconds
            .filter(|ttl| *ttl > 0)
            .map(|ttl| Instant::now() + Duration::from_secs(ttl as u64));
        self.entries
            .lock()
            .insert(key.to_string(), CacheEntry { value, expires });
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(key) {
            if entry.expires.is_some_and(|at| Instant::now() >= at) {
                entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }
}

/// Serves static files from a directory root.
/// Rules: no absolute paths, no `..` segments, no backslash separators.
pub struct DirFileSource {
    root: PathBuf,
}

impl DirFileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, name: &str) -> anyhow::Result<PathBuf> {
        if name.is_empty() {
            bail!("empty file name");
        }
        if Path::new(name).is_absolute() {
            bail!("absolute paths not allowed");
        }
        let mut buf = self.root.clone();
        for seg in name.split('/') {
            if seg.is_empty() || seg == "." {
                continue;
            }
            if seg == ".." {
                bail!("parent traversal not allowed");
            }
            if seg.contains('\\') {
                bail!("invalid separator in path");
            }
            buf.push(seg);
        }
        Ok(buf)
    }
}

impl FileSource for DirFileSource {
    fn static_file(&self, name: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.resolve(name)?;
        std::fs::read(&path).with_context(|| format!("read static file: {}", path.display()))
    }
}

/// Default file source; every lookup fails until a real source is configured.
pub struct NoFiles;

impl FileSource for NoFiles {
    fn static_file(&self, name: &str) -> anyhow::Result<Vec<u8>> {
        bail!("no file source configured (requested '{name}')")
    }
}

/// Default request/response binding; jobs not triggered by a request get this.
pub struct Unbound;

impl RequestAccessor for Unbound {
    fn field(&self, field_type: i32, key: &str) -> anyhow::Result<Vec<u8>> {
        bail!("no request bound to this job (field type {field_type}, key '{key}')")
    }
}

impl ResponseMutator for Unbound {
    fn set_header(&self, key: &str, _value: &str) -> anyhow::Result<()> {
        bail!("no response bound to this job (header '{key}')")
    }
}

pub struct NoAuth;

impl AuthProvider for NoAuth {
    fn authorization_for(&self, _url: &str) -> Option<String> {
        None
    }
}

/// Static bearer token applied to every outbound request.
pub struct BearerAuth {
    token: String,
}

impl BearerAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl AuthProvider for BearerAuth {
    fn authorization_for(&self, _url: &str) -> Option<String> {
        Some(format!("Bearer {}", self.token))
    }
}

/// Configuration source backed by process environment variables.
pub struct EnvConfig;

impl ConfigSource for EnvConfig {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Fixed key/value configuration, mainly for tests.
pub struct StaticConfig(pub HashMap<String, String>);

impl ConfigSource for StaticConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn override_is_a_shallow_clone() {
        let base = Capabilities::default();
        let overridden = base.clone().with_file(Arc::new(NoFiles));
        // The untouched sub-capabilities are shared by reference.
        assert!(Arc::ptr_eq(&base.cache, &overridden.cache));
        assert!(Arc::ptr_eq(&base.http, &overridden.http));
        assert!(!Arc::ptr_eq(&base.file, &overridden.file));
    }

    #[tokio::test]
    async fn cache_honors_ttl() {
        let cache = InMemoryCache::default();
        cache.set("k", b"v".to_vec(), None).await.expect("set");
        assert_eq!(cache.get("k").await.expect("get"), Some(b"v".to_vec()));

        cache
            .set("short", b"gone".to_vec(), Some(1))
            .await
            .expect("set");
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(cache.get("short").await.expect("get"), None);
    }

    #[test]
    fn dir_file_source_rejects_traversal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut f = std::fs::File::create(dir.path().join("asset.txt")).expect("create");
        f.write_all(b"data").expect("write");

        let source = DirFileSource::new(dir.path());
        assert_eq!(source.static_file("asset.txt").expect("read"), b"data");
        assert!(source.static_file("../etc/passwd").is_err());
        assert!(source.static_file("/etc/passwd").is_err());
    }

    #[test]
    fn http_method_mapping() {
        assert_eq!(HttpMethod::from_i32(0), Some(HttpMethod::Get));
        assert_eq!(HttpMethod::from_i32(3), Some(HttpMethod::Delete));
        assert_eq!(HttpMethod::from_i32(9), None);
    }
}
