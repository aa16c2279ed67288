//! Collaborator interfaces and in-memory implementations
//!
//! The runtime never talks to a database, network or model directly: it
//! goes through these traits. The `Unconfigured*` defaults fail every call;
//! the in-memory implementations back the CLI `--fixtures` option and the
//! test suite.

use crate::types::Value;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A statement parameter, passed separately from the statement text
#[derive(Debug, Clone, PartialEq)]
pub struct BoundParam {
    pub name: String,
    pub value: Value,
}

/// Rows returned by a datasource
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Value>,
}

impl RowSet {
    /// Build from object rows; columns come from the first row
    pub fn from_rows(rows: Vec<Value>) -> Self {
        let columns = rows
            .first()
            .and_then(Value::as_object)
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default();
        Self { columns, rows }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        let mut response = Self::new(status, body.to_string());
        response
            .headers
            .push(("content-type".to_string(), "application/json".to_string()));
        response
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GenerationParams {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

#[async_trait]
pub trait DatasourceProvider: Send + Sync {
    async fn query(&self, datasource: &str, statement: &str, params: &[BoundParam]) -> Result<RowSet>;
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<String>;
}

/// Destination for rendered output
pub trait OutputSink: Send {
    /// Called with each top-level fragment as it is produced
    fn write(&mut self, fragment: &str) -> Result<()>;

    /// Called once with the complete document
    fn finish(&mut self, _document: &str) -> Result<()> {
        Ok(())
    }
}

/// The collaborators handed to the operation engine
#[derive(Clone)]
pub struct Providers {
    pub datasource: Arc<dyn DatasourceProvider>,
    pub http: Arc<dyn HttpTransport>,
    pub model: Arc<dyn ModelProvider>,
}

impl Default for Providers {
    fn default() -> Self {
        Self {
            datasource: Arc::new(UnconfiguredDatasource),
            http: Arc::new(UnconfiguredTransport),
            model: Arc::new(UnconfiguredModel),
        }
    }
}

impl std::fmt::Debug for Providers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Providers").finish_non_exhaustive()
    }
}

// =============================================================================
// UNCONFIGURED DEFAULTS
// =============================================================================

pub struct UnconfiguredDatasource;

#[async_trait]
impl DatasourceProvider for UnconfiguredDatasource {
    async fn query(&self, datasource: &str, _statement: &str, _params: &[BoundParam]) -> Result<RowSet> {
        bail!("no datasource provider configured for '{}'", datasource)
    }
}

pub struct UnconfiguredTransport;

#[async_trait]
impl HttpTransport for UnconfiguredTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        bail!("no HTTP transport configured for {} {}", request.method, request.url)
    }
}

pub struct UnconfiguredModel;

#[async_trait]
impl ModelProvider for UnconfiguredModel {
    async fn generate(&self, model: &str, _messages: &[ChatMessage], _params: &GenerationParams) -> Result<String> {
        bail!("no model provider configured for '{}'", model)
    }
}

// =============================================================================
// IN-MEMORY IMPLEMENTATIONS
// =============================================================================

fn normalize_statement(statement: &str) -> String {
    statement.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A statement the memory datasource received
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedQuery {
    pub datasource: String,
    pub statement: String,
    pub params: Vec<BoundParam>,
}

/// Datasource answering from registered rows
#[derive(Default)]
pub struct MemoryDatasource {
    /// (datasource, normalized statement) → rows; an empty statement is the
    /// datasource-wide fallback
    tables: Mutex<HashMap<(String, String), Vec<Value>>>,
    executed: Mutex<Vec<ExecutedQuery>>,
    failures: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl MemoryDatasource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows returned for any statement on `datasource`
    pub fn with_rows(self, datasource: &str, rows: Vec<Value>) -> Self {
        self.insert(datasource, "", rows);
        self
    }

    /// Rows returned for one statement (whitespace-insensitive)
    pub fn with_statement(self, datasource: &str, statement: &str, rows: Vec<Value>) -> Self {
        self.insert(datasource, statement, rows);
        self
    }

    /// Fail the next `count` queries
    pub fn failing(self, count: usize) -> Self {
        self.failures.store(count, Ordering::SeqCst);
        self
    }

    /// Sleep before answering
    pub fn delayed(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
        self
    }

    pub fn insert(&self, datasource: &str, statement: &str, rows: Vec<Value>) {
        self.tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((datasource.to_string(), normalize_statement(statement)), rows);
    }

    /// Number of queries received, failed ones included
    pub fn call_count(&self) -> usize {
        self.executed.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn executed(&self) -> Vec<ExecutedQuery> {
        self.executed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl DatasourceProvider for MemoryDatasource {
    async fn query(&self, datasource: &str, statement: &str, params: &[BoundParam]) -> Result<RowSet> {
        self.executed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ExecutedQuery {
                datasource: datasource.to_string(),
                statement: statement.to_string(),
                params: params.to_vec(),
            });

        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            bail!("connection to '{}' refused", datasource);
        }

        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let exact = (datasource.to_string(), normalize_statement(statement));
        let fallback = (datasource.to_string(), String::new());
        match tables.get(&exact).or_else(|| tables.get(&fallback)) {
            Some(rows) => Ok(RowSet::from_rows(rows.clone())),
            None => bail!("unknown datasource '{}'", datasource),
        }
    }
}

/// Transport answering from registered responses
#[derive(Default)]
pub struct StaticTransport {
    /// (METHOD, url) → response
    routes: Mutex<HashMap<(String, String), HttpResponse>>,
    requests: Mutex<Vec<HttpRequest>>,
    failures: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl StaticTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(self, method: &str, url: &str, response: HttpResponse) -> Self {
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((method.to_ascii_uppercase(), url.to_string()), response);
        self
    }

    /// Fail the next `count` requests at the transport level
    pub fn failing(self, count: usize) -> Self {
        self.failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn delayed(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl HttpTransport for StaticTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            bail!("connection reset by {}", request.url);
        }

        // Query strings are ignored when matching
        let path = request.url.split('?').next().unwrap_or_default().to_string();
        let routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        let key = (request.method.to_ascii_uppercase(), request.url.clone());
        let fallback = (request.method.to_ascii_uppercase(), path);
        Ok(routes
            .get(&key)
            .or_else(|| routes.get(&fallback))
            .cloned()
            .unwrap_or_else(|| HttpResponse::new(404, "not found")))
    }
}

/// Model that echoes the last user message
#[derive(Debug, Default)]
pub struct EchoModel {
    pub prefix: String,
}

impl EchoModel {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl ModelProvider for EchoModel {
    async fn generate(&self, _model: &str, messages: &[ChatMessage], _params: &GenerationParams) -> Result<String> {
        let last = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        Ok(format!("{}{}", self.prefix, last))
    }
}

/// Sink collecting every fragment
#[derive(Debug, Clone, Default)]
pub struct BufferSink {
    buffer: Arc<Mutex<String>>,
    finished: Arc<Mutex<Option<String>>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far
    pub fn contents(&self) -> String {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The document passed to `finish`, once the render completed
    pub fn finished(&self) -> Option<String> {
        self.finished.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl OutputSink for BufferSink {
    fn write(&mut self, fragment: &str) -> Result<()> {
        self.buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_str(fragment);
        Ok(())
    }

    fn finish(&mut self, document: &str) -> Result<()> {
        *self.finished.lock().unwrap_or_else(|e| e.into_inner()) = Some(document.to_string());
        Ok(())
    }
}

// =============================================================================
// FIXTURES
// =============================================================================

#[derive(Debug, Deserialize)]
struct FixtureQuery {
    datasource: String,
    #[serde(default)]
    statement: String,
    rows: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct FixtureRoute {
    #[serde(default = "default_method")]
    method: String,
    url: String,
    #[serde(default = "default_status")]
    status: u16,
    body: serde_json::Value,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_status() -> u16 {
    200
}

/// JSON fixture file wiring the in-memory collaborators
///
/// ```json
/// {
///   "queries": [{"datasource": "main", "statement": "SELECT ...", "rows": [{"id": 1}]}],
///   "http": [{"method": "GET", "url": "https://api.test/users", "body": [{"id": 1}]}],
///   "model_prefix": "echo: "
/// }
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct Fixtures {
    #[serde(default)]
    queries: Vec<FixtureQuery>,
    #[serde(default)]
    http: Vec<FixtureRoute>,
    #[serde(default)]
    model_prefix: Option<String>,
}

impl Fixtures {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid fixtures file")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fixtures {}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn into_providers(self) -> Providers {
        let datasource = MemoryDatasource::new();
        for query in self.queries {
            let rows = query.rows.into_iter().map(Value::from_json).collect();
            datasource.insert(&query.datasource, &query.statement, rows);
        }

        let mut transport = StaticTransport::new();
        for route in self.http {
            let response = match route.body {
                serde_json::Value::String(text) => HttpResponse::new(route.status, text),
                body => HttpResponse::json(route.status, &body),
            };
            transport = transport.with_route(&route.method, &route.url, response);
        }

        Providers {
            datasource: Arc::new(datasource),
            http: Arc::new(transport),
            model: Arc::new(EchoModel::new(self.model_prefix.unwrap_or_default())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<Value> {
        vec![Value::from_json(serde_json::json!({"id": 1, "name": "ann"}))]
    }

    #[tokio::test]
    async fn test_memory_datasource_matches_statements() {
        let ds = MemoryDatasource::new()
            .with_rows("main", vec![])
            .with_statement("main", "SELECT *  FROM users", rows());

        let set = ds.query("main", "SELECT * FROM\n users", &[]).await.unwrap();
        assert_eq!(set.rows.len(), 1);
        assert_eq!(set.columns, vec!["id".to_string(), "name".to_string()]);

        let other = ds.query("main", "SELECT 1", &[]).await.unwrap();
        assert!(other.rows.is_empty());
        assert!(ds.query("missing", "SELECT 1", &[]).await.is_err());
        assert_eq!(ds.call_count(), 3);
    }

    #[tokio::test]
    async fn test_failures_are_consumed() {
        let ds = MemoryDatasource::new().with_rows("main", rows()).failing(2);
        assert!(ds.query("main", "q", &[]).await.is_err());
        assert!(ds.query("main", "q", &[]).await.is_err());
        assert!(ds.query("main", "q", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_static_transport_routes() {
        let transport = StaticTransport::new().with_route(
            "get",
            "https://api.test/users",
            HttpResponse::json(200, &serde_json::json!([1, 2])),
        );
        let ok = transport
            .send(HttpRequest::new("GET", "https://api.test/users?page=2"))
            .await
            .unwrap();
        assert!(ok.is_success());
        assert_eq!(ok.header("Content-Type"), Some("application/json"));

        let missing = transport
            .send(HttpRequest::new("GET", "https://api.test/nope"))
            .await
            .unwrap();
        assert_eq!(missing.status, 404);
    }

    #[tokio::test]
    async fn test_fixtures_wire_providers() {
        let fixtures = Fixtures::from_json(
            r#"{
                "queries": [{"datasource": "main", "rows": [{"id": 1}, {"id": 2}]}],
                "http": [{"url": "https://api.test/ping", "body": "pong"}],
                "model_prefix": "> "
            }"#,
        )
        .unwrap();
        let providers = fixtures.into_providers();

        let set = providers.datasource.query("main", "anything", &[]).await.unwrap();
        assert_eq!(set.rows.len(), 2);

        let response = providers
            .http
            .send(HttpRequest::new("GET", "https://api.test/ping"))
            .await
            .unwrap();
        assert_eq!(response.body, "pong");

        let messages = vec![ChatMessage {
            role: "user".to_string(),
            content: "hi".to_string(),
        }];
        let reply = providers
            .model
            .generate("m", &messages, &GenerationParams::default())
            .await
            .unwrap();
        assert_eq!(reply, "> hi");
    }
}
