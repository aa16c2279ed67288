//! Runtime shell
//!
//! A [`Runtime`] owns the services shared by every render: configuration,
//! the operation engine (with its result cache), the application scope and
//! the session scopes. Each render gets its own [`RenderState`].
//!
//! ```no_run
//! use tessera::{parse_str, RenderRequest, Runtime};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let runtime = Runtime::builder().build();
//! let doc = parse_str(r#"<p>Hello {name}</p>"#)?;
//! let output = runtime
//!     .render(&doc, RenderRequest::new().variable("name", "Ada"))
//!     .await?;
//! assert_eq!(output.body, "<p>Hello Ada</p>");
//! # Ok(())
//! # }
//! ```

use crate::ast::{Document, SourceSpan};
use crate::cache::DocumentCache;
use crate::compiler::CompiledUnit;
use crate::config::RuntimeConfig;
use crate::context::{shared_scope, ExecutionContext, ScopeKind, SharedScope};
use crate::directives::{bind_arguments, Iteration, LogRecord, ParamSpec};
use crate::engine::{ExecutionHost, LiveOperation, OperationEngine};
use crate::error::{ParamError, RenderError};
use crate::interpreter::Interpreter;
use crate::operations::{OperationSpec, Resolved};
use crate::providers::{DatasourceProvider, HttpTransport, ModelProvider, OutputSink, Providers};
use crate::result::{ErrorKind, OperationError, ResultObject};
use crate::types::Value;
use futures::future::{abortable, AbortHandle};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

// =============================================================================
// PER-RENDER STATE
// =============================================================================

/// Render output buffer with capture frames for function bodies
pub struct Output {
    buffer: String,
    captures: Vec<String>,
    sink: Option<Box<dyn OutputSink>>,
    sink_error: Option<String>,
}

impl Output {
    pub fn new(sink: Option<Box<dyn OutputSink>>) -> Self {
        Self {
            buffer: String::new(),
            captures: Vec::new(),
            sink,
            sink_error: None,
        }
    }

    /// Append a fragment. Uncaptured fragments are forwarded to the sink.
    pub fn write(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(capture) = self.captures.last_mut() {
            capture.push_str(text);
            return;
        }
        self.buffer.push_str(text);
        if self.sink_error.is_some() {
            return;
        }
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.write(text) {
                self.sink_error = Some(format!("{:#}", e));
            }
        }
    }

    pub fn begin_capture(&mut self) {
        self.captures.push(String::new());
    }

    pub fn end_capture(&mut self) -> String {
        self.captures.pop().unwrap_or_default()
    }

    /// Text written so far outside any capture
    pub fn as_str(&self) -> &str {
        &self.buffer
    }

    fn finish(mut self) -> Result<String, RenderError> {
        if let Some(error) = self.sink_error.take() {
            return Err(RenderError::Output(error));
        }
        if let Some(sink) = self.sink.as_mut() {
            sink.finish(&self.buffer)
                .map_err(|e| RenderError::Output(format!("{:#}", e)))?;
        }
        Ok(self.buffer)
    }
}

impl std::fmt::Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Output")
            .field("len", &self.buffer.len())
            .field("captures", &self.captures.len())
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

/// Everything one render owns
#[derive(Debug)]
pub struct RenderState {
    pub engine: Arc<OperationEngine>,
    pub config: Arc<RuntimeConfig>,
    pub ctx: ExecutionContext,
    pub output: Output,
    pub logs: Vec<LogRecord>,
    /// Pollers started by operations with an `interval`
    pub live: Vec<LiveOperation>,
}

impl RenderState {
    pub fn new(
        engine: Arc<OperationEngine>,
        config: Arc<RuntimeConfig>,
        ctx: ExecutionContext,
        sink: Option<Box<dyn OutputSink>>,
    ) -> Self {
        Self {
            engine,
            config,
            ctx,
            output: Output::new(sink),
            logs: Vec::new(),
            live: Vec::new(),
        }
    }
}

/// How a block finished
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    Continue,
    /// A Return ran; unwinds to the enclosing function or component
    Return(Value),
}

/// A backend that owns a [`RenderState`] and can run local targets
pub trait RenderHost: ExecutionHost {
    fn state(&mut self) -> &mut RenderState;
}

// =============================================================================
// SHARED NODE SEMANTICS
// =============================================================================

/// Resolve and execute an I/O node, then bind its Result Object under the
/// node's name and `result` before the next sibling runs
pub async fn perform<H: RenderHost>(host: &mut H, spec: &OperationSpec) -> Result<(), RenderError> {
    let resolved = {
        let state = host.state();
        spec.resolve(&state.ctx, &state.config)?
    };

    let (result, live) = match resolved {
        Resolved::Rejected(error) => (ResultObject::failure(error), None),
        Resolved::Ready(op) => {
            let engine = Arc::clone(&host.state().engine);
            let result = engine.execute(&op, host).await?;
            let live = op
                .policy
                .interval
                .map(|interval| LiveOperation::spawn(Arc::clone(&engine), op, interval, result.clone()));
            (result, live)
        }
    };

    let state = host.state();
    bind_result(&mut state.ctx, spec.name.as_deref(), &result);
    state.live.extend(live);
    Ok(())
}

fn bind_result(ctx: &mut ExecutionContext, name: Option<&str>, result: &ResultObject) {
    let value = result.to_value();
    if let Some(name) = name {
        ctx.assign(name, value.clone());
    }
    ctx.assign("result", value);
}

/// Open a loop frame holding one iteration's bindings
pub fn enter_iteration(ctx: &mut ExecutionContext, iteration: Iteration) {
    ctx.enter_scope(ScopeKind::Loop);
    for (name, value) in iteration {
        ctx.declare_local(&name, value);
    }
}

/// Prepare a function or component call: depth check, argument binding,
/// a fresh function frame and an output capture.
///
/// Binding failures are returned as the Invoke's operation error.
pub fn enter_call(
    state: &mut RenderState,
    params: &[ParamSpec],
    args: &BTreeMap<String, Value>,
    span: SourceSpan,
) -> Result<Result<(), OperationError>, RenderError> {
    let limit = state.config.max_call_depth;
    if state.ctx.call_depth() >= limit {
        return Err(RenderError::CallDepth { limit, span });
    }

    let bound = match bind_arguments(params, args, &state.ctx) {
        Ok(bound) => bound,
        Err(error) => {
            let kind = match error {
                ParamError::Type { .. } => ErrorKind::Type,
                _ => ErrorKind::Validation,
            };
            return Ok(Err(OperationError::new(kind, error.to_string())));
        }
    };

    state.ctx.enter_function();
    for (name, value) in bound {
        state.ctx.declare_local(&name, value);
    }
    state.output.begin_capture();
    Ok(Ok(()))
}

/// Close a call opened by [`enter_call`]. The value is the Return value if
/// one ran, otherwise the captured output.
pub fn exit_call(state: &mut RenderState, flow: Result<Flow, RenderError>) -> Result<Value, RenderError> {
    let captured = state.output.end_capture();
    state.ctx.exit_function();
    match flow? {
        Flow::Return(value) => Ok(value),
        Flow::Continue => Ok(Value::String(captured)),
    }
}

/// Bind an entry component's parameters in the page scope from seeded
/// variables and defaults
pub fn bind_entry(state: &mut RenderState, params: &[ParamSpec], span: SourceSpan) -> Result<(), RenderError> {
    let bound = bind_arguments(params, &BTreeMap::new(), &state.ctx)
        .map_err(|source| RenderError::Parameter { source, span })?;
    for (name, value) in bound {
        state.ctx.declare(&name, value, ScopeKind::Page);
    }
    Ok(())
}

// =============================================================================
// REQUESTS AND OUTPUT
// =============================================================================

/// Inputs of one render
#[derive(Default)]
pub struct RenderRequest {
    pub variables: Vec<(String, Value)>,
    /// Component to render instead of the default entry point
    pub component: Option<String>,
    /// Session whose scope the render shares
    pub session: Option<String>,
    pub sink: Option<Box<dyn OutputSink>>,
}

impl RenderRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a page variable
    pub fn variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.push((name.into(), value.into()));
        self
    }

    pub fn component(mut self, name: impl Into<String>) -> Self {
        self.component = Some(name.into());
        self
    }

    pub fn session(mut self, id: impl Into<String>) -> Self {
        self.session = Some(id.into());
        self
    }

    /// Stream uncaptured output to `sink` as it is produced
    pub fn sink(mut self, sink: Box<dyn OutputSink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

impl std::fmt::Debug for RenderRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderRequest")
            .field("variables", &self.variables)
            .field("component", &self.component)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// Result of a completed render
#[derive(Debug)]
pub struct RenderOutput {
    pub body: String,
    /// Page scope at the end of the render
    pub variables: BTreeMap<String, Value>,
    pub logs: Vec<LogRecord>,
    pub live: Vec<LiveOperation>,
    pub render_id: Uuid,
    pub elapsed: Duration,
}

impl RenderOutput {
    pub fn variable(&self, name: &str) -> Value {
        self.variables.get(name).cloned().unwrap_or_default()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let variables: serde_json::Map<String, serde_json::Value> = self
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        serde_json::json!({
            "id": self.render_id.to_string(),
            "body": self.body,
            "variables": variables,
            "logs": self.logs,
            "elapsed_ms": self.elapsed.as_secs_f64() * 1000.0,
        })
    }
}

// =============================================================================
// RUNTIME
// =============================================================================

/// Shared services for many concurrent renders
pub struct Runtime {
    config: Arc<RuntimeConfig>,
    engine: Arc<OperationEngine>,
    application: SharedScope,
    sessions: Mutex<HashMap<String, SharedScope>>,
    documents: DocumentCache,
}

/// Builder for [`Runtime`]
#[derive(Debug, Default)]
pub struct RuntimeBuilder {
    config: Option<RuntimeConfig>,
    providers: Providers,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn providers(mut self, providers: Providers) -> Self {
        self.providers = providers;
        self
    }

    pub fn datasource(mut self, datasource: Arc<dyn DatasourceProvider>) -> Self {
        self.providers.datasource = datasource;
        self
    }

    pub fn http(mut self, http: Arc<dyn HttpTransport>) -> Self {
        self.providers.http = http;
        self
    }

    pub fn model(mut self, model: Arc<dyn ModelProvider>) -> Self {
        self.providers.model = model;
        self
    }

    pub fn build(self) -> Runtime {
        let config = Arc::new(self.config.unwrap_or_default());
        Runtime {
            engine: Arc::new(OperationEngine::new(Arc::clone(&config), self.providers)),
            config,
            application: shared_scope(),
            sessions: Mutex::new(HashMap::new()),
            documents: DocumentCache::default(),
        }
    }
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<OperationEngine> {
        &self.engine
    }

    pub fn application(&self) -> &SharedScope {
        &self.application
    }

    /// Scope of a session, created on first use
    pub fn session(&self, id: &str) -> SharedScope {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(sessions.entry(id.to_string()).or_insert_with(shared_scope))
    }

    /// Drop a session's scope; returns whether it existed
    pub fn end_session(&self, id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some()
    }

    /// Parse a file, reusing the parsed tree while the file is unchanged
    pub fn load(&self, path: &Path) -> anyhow::Result<Arc<Document>> {
        self.documents.get_or_parse(path, crate::parse_file)
    }

    /// Render by walking the document tree
    pub async fn render(&self, doc: &Document, request: RenderRequest) -> Result<RenderOutput, RenderError> {
        let render_id = Uuid::new_v4();
        let span = info_span!("render", id = %render_id, backend = "interpreter");
        async move {
            let started = Instant::now();
            let (state, component) = self.prepare(request);
            let state = Interpreter::new(doc).run(state, component.as_deref()).await?;
            complete(state, render_id, started)
        }
        .instrument(span)
        .await
    }

    /// Render a unit produced by [`crate::compile`]
    pub async fn render_compiled(
        &self,
        unit: &CompiledUnit,
        request: RenderRequest,
    ) -> Result<RenderOutput, RenderError> {
        let render_id = Uuid::new_v4();
        let span = info_span!("render", id = %render_id, backend = "compiled");
        async move {
            let started = Instant::now();
            let (state, component) = self.prepare(request);
            let state = unit.run(state, component.as_deref()).await?;
            complete(state, render_id, started)
        }
        .instrument(span)
        .await
    }

    /// A render that can be cancelled through the returned handle.
    /// Outstanding I/O is dropped and the render ends with
    /// [`RenderError::Cancelled`].
    pub fn render_abortable<'a>(
        &'a self,
        doc: &'a Document,
        request: RenderRequest,
    ) -> (
        impl Future<Output = Result<RenderOutput, RenderError>> + Send + 'a,
        AbortHandle,
    ) {
        let (render, handle) = abortable(self.render(doc, request));
        let render = async move { render.await.unwrap_or(Err(RenderError::Cancelled)) };
        (render, handle)
    }

    fn prepare(&self, request: RenderRequest) -> (RenderState, Option<String>) {
        let session = match &request.session {
            Some(id) => self.session(id),
            None => shared_scope(),
        };
        let mut ctx = ExecutionContext::new(Arc::clone(&self.application), session);
        ctx.seed(request.variables);
        info!(component = request.component.as_deref(), "render started");
        let state = RenderState::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.config),
            ctx,
            request.sink,
        );
        (state, request.component)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::builder().build()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

fn complete(state: RenderState, render_id: Uuid, started: Instant) -> Result<RenderOutput, RenderError> {
    let RenderState {
        ctx,
        output,
        logs,
        live,
        ..
    } = state;
    let body = output.finish()?;
    let elapsed = started.elapsed();
    info!(
        bytes = body.len(),
        elapsed_ms = elapsed.as_millis() as u64,
        "render finished"
    );
    Ok(RenderOutput {
        body,
        variables: ctx.page().vars().clone(),
        logs,
        live,
        render_id,
        elapsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::providers::BufferSink;

    #[tokio::test]
    async fn test_render_seeds_and_returns_page_variables() {
        let runtime = Runtime::default();
        let doc = parse(r#"<q:set name="greeting" value="Hello {name}"/>{greeting}"#).unwrap();
        let output = runtime
            .render(&doc, RenderRequest::new().variable("name", "Ada"))
            .await
            .unwrap();
        assert_eq!(output.body, "Hello Ada");
        assert_eq!(output.variable("greeting"), Value::from("Hello Ada"));
    }

    #[tokio::test]
    async fn test_session_scope_persists_between_renders() {
        let runtime = Runtime::default();
        let doc = parse(r#"<q:set name="session.visits" operation="increment"/>{session.visits}"#).unwrap();
        let first = runtime.render(&doc, RenderRequest::new().session("s1")).await.unwrap();
        let second = runtime.render(&doc, RenderRequest::new().session("s1")).await.unwrap();
        let other = runtime.render(&doc, RenderRequest::new().session("s2")).await.unwrap();
        assert_eq!(first.body, "1");
        assert_eq!(second.body, "2");
        assert_eq!(other.body, "1");
        assert!(runtime.end_session("s1"));
        assert!(!runtime.end_session("s1"));
    }

    #[tokio::test]
    async fn test_sink_receives_uncaptured_output() {
        let runtime = Runtime::default();
        let sink = BufferSink::new();
        let doc = parse(
            r#"<q:function name="f">inside</q:function><p>a</p><q:invoke name="r" function="f"/><p>{r.data}</p>"#,
        )
        .unwrap();
        let output = runtime
            .render(&doc, RenderRequest::new().sink(Box::new(sink.clone())))
            .await
            .unwrap();
        assert_eq!(output.body, "<p>a</p><p>inside</p>");
        assert_eq!(sink.contents(), output.body);
        assert_eq!(sink.finished().as_deref(), Some(output.body.as_str()));
    }

    #[tokio::test]
    async fn test_aborted_render_is_cancelled() {
        let runtime = Runtime::default();
        let doc = parse("<p>x</p>").unwrap();
        let (render, handle) = runtime.render_abortable(&doc, RenderRequest::new());
        handle.abort();
        assert!(matches!(render.await, Err(RenderError::Cancelled)));
    }

    #[test]
    fn test_output_capture_is_not_forwarded() {
        let mut output = Output::new(None);
        output.write("a");
        output.begin_capture();
        output.write("b");
        assert_eq!(output.end_capture(), "b");
        output.write("c");
        assert_eq!(output.as_str(), "ac");
    }
}
