//! Declarative I/O engine
//!
//! Every operation kind runs through [`OperationEngine::execute`]: cache
//! lookup, bounded retries with an optional per-attempt timeout, the
//! transform pipeline and finally a [`ResultObject`]. Collaborator failures
//! never escape as errors; they are recorded in the Result Object. Only
//! failures that abort the whole render (raised while running a local
//! function or component) are returned as [`RenderError`].

use crate::cache::ResultCache;
use crate::config::RuntimeConfig;
use crate::error::RenderError;
use crate::import;
use crate::operations::{Auth, ImportSource, Operation, ResponseType, Target};
use crate::providers::{HttpRequest, HttpResponse, Providers};
use crate::result::{ErrorKind, OperationError, ResultObject};
use crate::transform;
use crate::types::Value;
use async_trait::async_trait;
use base64::Engine as _;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

type Attempt = Result<(Value, Option<u16>), OperationError>;

/// Runs local targets (functions and components) on behalf of the engine
#[async_trait]
pub trait ExecutionHost: Send {
    async fn call_function(
        &mut self,
        name: &str,
        args: &BTreeMap<String, Value>,
    ) -> Result<Result<Value, OperationError>, RenderError>;

    async fn render_component(
        &mut self,
        name: &str,
        args: &BTreeMap<String, Value>,
    ) -> Result<Result<Value, OperationError>, RenderError>;
}

/// Host for operations running outside a render (pollers)
#[derive(Debug, Default)]
pub struct DetachedHost;

#[async_trait]
impl ExecutionHost for DetachedHost {
    async fn call_function(
        &mut self,
        name: &str,
        _args: &BTreeMap<String, Value>,
    ) -> Result<Result<Value, OperationError>, RenderError> {
        Ok(Err(OperationError::new(
            ErrorKind::TargetResolution,
            format!("function '{}' is not available outside a render", name),
        )))
    }

    async fn render_component(
        &mut self,
        name: &str,
        _args: &BTreeMap<String, Value>,
    ) -> Result<Result<Value, OperationError>, RenderError> {
        Ok(Err(OperationError::new(
            ErrorKind::TargetResolution,
            format!("component '{}' is not available outside a render", name),
        )))
    }
}

#[derive(Debug, Clone)]
struct AccessToken {
    token: String,
    expires_at: Instant,
}

/// Shared I/O service: one per runtime
pub struct OperationEngine {
    config: Arc<RuntimeConfig>,
    providers: Providers,
    cache: ResultCache,
    tokens: Mutex<HashMap<String, AccessToken>>,
}

impl OperationEngine {
    pub fn new(config: Arc<RuntimeConfig>, providers: Providers) -> Self {
        Self {
            cache: ResultCache::new(config.cache.capacity),
            config,
            providers,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn providers(&self) -> &Providers {
        &self.providers
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Execute an operation to completion
    pub async fn execute(
        &self,
        op: &Operation,
        host: &mut dyn ExecutionHost,
    ) -> Result<ResultObject, RenderError> {
        let started = Instant::now();
        let Some(policy) = op.policy.cache.as_ref().filter(|_| !op.is_local()) else {
            return self.run(op, host, started).await;
        };

        if let Some(hit) = self.cached(op, &policy.key, started) {
            return Ok(hit);
        }

        // One execution per key at a time; waiters re-check the cache
        let lock = self.cache.key_lock(&policy.key);
        let _guard = lock.lock().await;
        if let Some(hit) = self.cached(op, &policy.key, started) {
            return Ok(hit);
        }

        debug!(operation = %op.kind, key = %policy.key, "cache miss");
        let result = self.run(op, host, started).await?;
        if result.success {
            self.cache.put(&policy.key, result.clone(), policy.ttl);
        }
        Ok(result)
    }

    fn cached(&self, op: &Operation, key: &str, started: Instant) -> Option<ResultObject> {
        let mut hit = self.cache.get(key)?;
        debug!(operation = %op.kind, key = %key, "cache hit");
        hit.execution_time = started.elapsed();
        Some(hit)
    }

    async fn run(
        &self,
        op: &Operation,
        host: &mut dyn ExecutionHost,
        started: Instant,
    ) -> Result<ResultObject, RenderError> {
        let local = op.is_local();
        let max_attempts = if local { 1 } else { op.policy.max_attempts.max(1) };
        let timeout = op.policy.timeout.filter(|_| !local);

        let mut attempts = 0;
        let outcome = loop {
            attempts += 1;
            debug!(operation = %op.kind, target = %op.target.describe(), attempt = attempts, "executing");

            let attempt = self.attempt(op, &mut *host);
            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, attempt).await {
                    Ok(outcome) => outcome?,
                    Err(_) => Err(OperationError::new(
                        ErrorKind::Timeout,
                        format!("timed out after {}ms", limit.as_millis()),
                    )),
                },
                None => attempt.await?,
            };

            match outcome {
                Ok(data) => break Ok(data),
                Err(error) if attempts < max_attempts => {
                    warn!(
                        operation = %op.kind,
                        attempt = attempts,
                        max_attempts,
                        error = %error,
                        "attempt failed, retrying"
                    );
                    if !op.policy.retry_delay.is_zero() {
                        tokio::time::sleep(op.policy.retry_delay).await;
                    }
                }
                Err(error) => break Err(error),
            }
        };

        let mut result = match outcome {
            Ok((data, status)) => {
                let result = self.finish(op, data);
                if result.success {
                    result.with_status(status)
                } else {
                    result
                }
            }
            Err(error) => {
                warn!(operation = %op.kind, attempts, error = %error, "operation failed");
                ResultObject::failure(error)
            }
        };
        result.attempts = attempts;
        result.execution_time = started.elapsed();
        Ok(result)
    }

    /// Run the transform pipeline over a successful payload
    fn finish(&self, op: &Operation, data: Value) -> ResultObject {
        if op.transforms.is_empty() {
            return ResultObject::success(data);
        }
        let rows = match data {
            Value::Array(rows) => rows,
            Value::Undefined | Value::Null => Vec::new(),
            other => vec![other],
        };
        match transform::apply(&op.transforms, rows) {
            Ok(rows) => ResultObject::success(Value::Array(rows)),
            Err(error) => ResultObject::failure(OperationError::new(
                ErrorKind::Execution,
                format!("transform failed: {}", error),
            )),
        }
    }

    async fn attempt(
        &self,
        op: &Operation,
        host: &mut dyn ExecutionHost,
    ) -> Result<Attempt, RenderError> {
        let outcome = match &op.target {
            Target::Function(name) => host.call_function(name, &op.args).await?.map(|v| (v, None)),
            Target::Component(name) => host
                .render_component(name, &op.args)
                .await?
                .map(|v| (v, None)),
            Target::Http {
                request,
                response_type,
            } => {
                self.send_http(request.clone(), *response_type, op.policy.auth.as_ref())
                    .await
            }
            Target::Sql {
                datasource,
                statement,
                params,
            } => self
                .providers
                .datasource
                .query(datasource, statement, params)
                .await
                .map(|set| (Value::Array(set.rows), None))
                .map_err(|e| OperationError::wrap(ErrorKind::Database, &e)),
            Target::Import { source, options } => self.import(source, options.as_ref()).await,
            Target::Model {
                model,
                messages,
                params,
            } => self
                .providers
                .model
                .generate(model, messages, params)
                .await
                .map(|text| (Value::String(text), None))
                .map_err(|e| OperationError::wrap(ErrorKind::Model, &e)),
        };
        Ok(outcome)
    }

    async fn send_http(
        &self,
        mut request: HttpRequest,
        response_type: ResponseType,
        auth: Option<&Auth>,
    ) -> Attempt {
        if let Some(auth) = auth {
            self.authorize(&mut request, auth).await?;
        }
        let url = request.url.clone();
        let response = self
            .providers
            .http
            .send(request)
            .await
            .map_err(|e| OperationError::wrap(ErrorKind::Http, &e))?;
        if !response.is_success() {
            return Err(OperationError::new(
                ErrorKind::Http,
                format!("HTTP {} from {}", response.status, url),
            )
            .with_status(response.status));
        }
        let data = parse_body(&response, response_type)?;
        Ok((data, Some(response.status)))
    }

    async fn authorize(&self, request: &mut HttpRequest, auth: &Auth) -> Result<(), OperationError> {
        let (name, value) = match auth {
            Auth::Bearer(token) => ("Authorization".to_string(), format!("Bearer {}", token)),
            Auth::ApiKey { header, key } => (header.clone(), key.clone()),
            Auth::Basic { username, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", username, password));
                ("Authorization".to_string(), format!("Basic {}", encoded))
            }
            Auth::OAuth2 {
                token_url,
                client_id,
                client_secret,
                scope,
            } => {
                let token = self
                    .oauth_token(token_url, client_id, client_secret, scope.as_deref())
                    .await?;
                ("Authorization".to_string(), format!("Bearer {}", token))
            }
        };
        request.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        request.headers.push((name, value));
        Ok(())
    }

    /// Client-credentials exchange, cached until shortly before expiry
    async fn oauth_token(
        &self,
        token_url: &str,
        client_id: &str,
        client_secret: &str,
        scope: Option<&str>,
    ) -> Result<String, OperationError> {
        let cache_key = format!("{}|{}", token_url, client_id);
        {
            let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(token) = tokens.get(&cache_key) {
                if token.expires_at > Instant::now() {
                    return Ok(token.token.clone());
                }
            }
        }

        let mut form = vec![
            "grant_type=client_credentials".to_string(),
            format!("client_id={}", urlencoding::encode(client_id)),
            format!("client_secret={}", urlencoding::encode(client_secret)),
        ];
        if let Some(scope) = scope {
            form.push(format!("scope={}", urlencoding::encode(scope)));
        }
        let mut request = HttpRequest::new("POST", token_url);
        request.headers.push((
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        ));
        request.body = Some(form.join("&"));

        let failed = |message: String| {
            OperationError::new(ErrorKind::Http, format!("oauth2 token request failed: {}", message))
        };
        let response = self
            .providers
            .http
            .send(request)
            .await
            .map_err(|e| failed(format!("{:#}", e)))?;
        if !response.is_success() {
            return Err(failed(format!("HTTP {}", response.status)).with_status(response.status));
        }
        let body: serde_json::Value =
            serde_json::from_str(&response.body).map_err(|e| failed(e.to_string()))?;
        let token = body
            .get("access_token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| failed("response has no access_token".to_string()))?
            .to_string();
        let lifetime = body
            .get("expires_in")
            .and_then(|e| e.as_u64())
            .unwrap_or(3600);

        let expires_at = Instant::now() + Duration::from_secs(lifetime.saturating_sub(30).max(1));
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                cache_key,
                AccessToken {
                    token: token.clone(),
                    expires_at,
                },
            );
        Ok(token)
    }

    async fn import(
        &self,
        source: &ImportSource,
        options: Option<&import::ImportOptions>,
    ) -> Attempt {
        let text = match source {
            ImportSource::Rows(value) => return rows_from_scope(value, options),
            ImportSource::Inline(text) => text.clone(),
            ImportSource::File(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                OperationError::new(
                    ErrorKind::Io,
                    format!("cannot read {}: {}", path.display(), e),
                )
            })?,
            ImportSource::Url(url) => {
                let response = self
                    .providers
                    .http
                    .send(HttpRequest::new("GET", url.clone()))
                    .await
                    .map_err(|e| OperationError::wrap(ErrorKind::Http, &e))?;
                if !response.is_success() {
                    return Err(OperationError::new(
                        ErrorKind::Http,
                        format!("HTTP {} from {}", response.status, url),
                    )
                    .with_status(response.status));
                }
                response.body
            }
        };
        parse_rows(&text, options)
    }
}

impl std::fmt::Debug for OperationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationEngine")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

fn parse_rows(text: &str, options: Option<&import::ImportOptions>) -> Attempt {
    let options = options
        .ok_or_else(|| OperationError::new(ErrorKind::Import, "Data source has no type"))?;
    import::import(text, options)
        .map(|rows| (Value::Array(rows), None))
        .map_err(|e| OperationError::wrap(ErrorKind::Import, &e))
}

/// Rows held by a variable: an array, a Result Object or unparsed text
fn rows_from_scope(value: &Value, options: Option<&import::ImportOptions>) -> Attempt {
    let rows = match value {
        Value::Object(map) if map.contains_key("success") && map.contains_key("data") => {
            value.member("data")
        }
        other => other.clone(),
    };
    match rows {
        Value::Array(_) => Ok((rows, None)),
        Value::String(text) if options.is_some() => parse_rows(&text, options),
        Value::Undefined => Err(OperationError::new(
            ErrorKind::Import,
            "datasource variable is undefined",
        )),
        other => Ok((Value::Array(vec![other]), None)),
    }
}

fn parse_body(response: &HttpResponse, response_type: ResponseType) -> Result<Value, OperationError> {
    let parse_json = || {
        serde_json::from_str::<serde_json::Value>(&response.body)
            .map(Value::from_json)
            .map_err(|e| {
                OperationError::new(ErrorKind::Http, format!("invalid JSON response: {}", e))
                    .with_status(response.status)
            })
    };
    match response_type {
        ResponseType::Text => Ok(Value::String(response.body.clone())),
        ResponseType::Json => parse_json(),
        ResponseType::Auto => {
            let declared = response
                .header("content-type")
                .is_some_and(|t| t.contains("json"));
            let looks_like = matches!(response.body.trim_start().chars().next(), Some('{' | '['));
            if declared || looks_like {
                parse_json().or_else(|e| {
                    if declared {
                        Err(e)
                    } else {
                        Ok(Value::String(response.body.clone()))
                    }
                })
            } else {
                Ok(Value::String(response.body.clone()))
            }
        }
    }
}

// =============================================================================
// INSTANCE STATE
// =============================================================================

/// Lifecycle of one operation instance
#[derive(Debug, Clone, PartialEq)]
pub enum OperationState {
    Idle,
    Loading,
    Success(ResultObject),
    Error(ResultObject),
}

impl OperationState {
    pub fn from_result(result: ResultObject) -> Self {
        if result.success {
            OperationState::Success(result)
        } else {
            OperationState::Error(result)
        }
    }

    pub fn result(&self) -> Option<&ResultObject> {
        match self {
            OperationState::Success(result) | OperationState::Error(result) => Some(result),
            OperationState::Idle | OperationState::Loading => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, OperationState::Loading)
    }
}

/// State machine `Idle -> Loading -> {Success, Error}`; a refetch or poll
/// tick goes back to `Loading`. `Idle` is never re-entered.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationInstance {
    state: OperationState,
}

impl Default for OperationInstance {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationInstance {
    pub fn new() -> Self {
        Self {
            state: OperationState::Idle,
        }
    }

    pub fn state(&self) -> &OperationState {
        &self.state
    }

    pub fn begin(&mut self) -> &OperationState {
        self.state = OperationState::Loading;
        &self.state
    }

    pub fn complete(&mut self, result: ResultObject) -> &OperationState {
        self.state = OperationState::from_result(result);
        &self.state
    }
}

// =============================================================================
// POLLING
// =============================================================================

/// A polling operation started by an `interval` attribute
///
/// Each tick (or [`LiveOperation::refetch`]) starts a new attempt and
/// cancels the one in flight, so the latest trigger wins. Dropping the
/// handle stops the poller.
pub struct LiveOperation {
    name: String,
    state: watch::Receiver<OperationState>,
    refetch: Arc<Notify>,
    task: JoinHandle<()>,
}

impl LiveOperation {
    pub fn spawn(
        engine: Arc<OperationEngine>,
        op: Operation,
        interval: Duration,
        first: ResultObject,
    ) -> Self {
        let name = op.name.clone().unwrap_or_else(|| "result".to_string());
        let mut instance = OperationInstance::new();
        instance.begin();
        let (tx, rx) = watch::channel(instance.complete(first).clone());
        let refetch = Arc::new(Notify::new());
        let trigger = Arc::clone(&refetch);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick is immediate; the inline execution covered it
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = trigger.notified() => {}
                }
                loop {
                    tx.send_replace(instance.begin().clone());
                    let mut host = DetachedHost;
                    let attempt = engine.execute(&op, &mut host);
                    tokio::select! {
                        outcome = attempt => {
                            let result = outcome.unwrap_or_else(|e| {
                                ResultObject::failure(OperationError::new(ErrorKind::Execution, e.to_string()))
                            });
                            tx.send_replace(instance.complete(result).clone());
                            break;
                        }
                        _ = ticker.tick() => debug!(operation = %op.kind, "poll superseded by tick"),
                        _ = trigger.notified() => debug!(operation = %op.kind, "poll superseded by refetch"),
                    }
                }
                if tx.is_closed() {
                    break;
                }
            }
        });

        Self {
            name,
            state: rx,
            refetch,
            task,
        }
    }

    /// Name the result is bound under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest published state
    pub fn state(&self) -> OperationState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<OperationState> {
        self.state.clone()
    }

    /// Trigger an attempt now, superseding any in flight
    pub fn refetch(&self) {
        self.refetch.notify_one();
    }

    /// Stop polling. The last published state stays readable from
    /// existing subscribers.
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for LiveOperation {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for LiveOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveOperation")
            .field("name", &self.name)
            .field("state", &*self.state.borrow())
            .finish()
    }
}
