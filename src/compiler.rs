//! Ahead-of-time backend
//!
//! [`compile`] lowers a document once into a tree of closures. Nodes without
//! I/O become [`Step::Sync`] closures over the render state; I/O nodes, and
//! any block containing one, become [`Step::Async`] closures returning boxed
//! futures. Runs of literal text are merged into a single write.
//!
//! The directives are the same ones the interpreter lowers on each visit, so
//! a compiled unit renders byte-identical output.

use crate::ast::{Document, Expression, Node, NodeKind, SourceSpan};
use crate::directives::{
    select_arm, Callable, DumpDirective, ElementDirective, IfDirective, LogDirective, LoopDirective,
    ParamSpec, ReturnDirective, SetDirective, TextDirective,
};
use crate::engine::ExecutionHost;
use crate::error::{ParseError, RenderError};
use crate::operations::OperationSpec;
use crate::result::{ErrorKind, OperationError};
use crate::runtime::{bind_entry, enter_call, enter_iteration, exit_call, perform, Flow, RenderHost, RenderState};
use crate::types::Value;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

type SyncFn = Box<dyn Fn(&mut RenderState) -> Result<Flow, RenderError> + Send + Sync>;
type AsyncFn =
    Box<dyn for<'a> Fn(&'a mut UnitHost) -> BoxFuture<'a, Result<Flow, RenderError>> + Send + Sync>;

/// One lowered node
enum Step {
    Sync(SyncFn),
    Async(AsyncFn),
}

fn sync_step<F>(f: F) -> Step
where
    F: Fn(&mut RenderState) -> Result<Flow, RenderError> + Send + Sync + 'static,
{
    Step::Sync(Box::new(f))
}

fn async_step<F>(f: F) -> Step
where
    F: for<'a> Fn(&'a mut UnitHost) -> BoxFuture<'a, Result<Flow, RenderError>> + Send + Sync + 'static,
{
    Step::Async(Box::new(f))
}

/// A lowered sibling list
enum Block {
    /// No I/O anywhere below; runs without suspending
    Sync(Vec<SyncFn>),
    Mixed(Vec<Step>),
}

impl Block {
    fn new(steps: Vec<Step>) -> Self {
        if steps.iter().all(|s| matches!(s, Step::Sync(_))) {
            Block::Sync(
                steps
                    .into_iter()
                    .filter_map(|s| match s {
                        Step::Sync(f) => Some(f),
                        Step::Async(_) => None,
                    })
                    .collect(),
            )
        } else {
            Block::Mixed(steps)
        }
    }

    fn run<'a>(&'a self, host: &'a mut UnitHost) -> BoxFuture<'a, Result<Flow, RenderError>> {
        Box::pin(async move {
            let steps = match self {
                Block::Sync(steps) => return run_sync(steps, &mut host.state),
                Block::Mixed(steps) => steps,
            };
            for step in steps {
                let flow = match step {
                    Step::Sync(f) => f(&mut host.state)?,
                    Step::Async(f) => f(host).await?,
                };
                if let Flow::Return(value) = flow {
                    return Ok(Flow::Return(value));
                }
            }
            Ok(Flow::Continue)
        })
    }

    fn len(&self) -> usize {
        match self {
            Block::Sync(steps) => steps.len(),
            Block::Mixed(steps) => steps.len(),
        }
    }
}

fn run_sync(steps: &[SyncFn], state: &mut RenderState) -> Result<Flow, RenderError> {
    for step in steps {
        if let Flow::Return(value) = step(state)? {
            return Ok(Flow::Return(value));
        }
    }
    Ok(Flow::Continue)
}

/// Split blocks into their synchronous steps when none of them does I/O
fn all_sync(blocks: Vec<Block>) -> Result<Vec<Vec<SyncFn>>, Vec<Block>> {
    if !blocks.iter().all(|b| matches!(b, Block::Sync(_))) {
        return Err(blocks);
    }
    Ok(blocks
        .into_iter()
        .filter_map(|b| match b {
            Block::Sync(steps) => Some(steps),
            Block::Mixed(_) => None,
        })
        .collect())
}

// =============================================================================
// LOWERING
// =============================================================================

fn lower_block(nodes: &[Node]) -> Result<Block, ParseError> {
    let mut steps = Vec::new();
    let mut pending = String::new();

    for node in nodes {
        if node.kind == NodeKind::Text {
            let text = TextDirective::from_node(node)?;
            if let Some(literal) = text.template.as_literal() {
                pending.push_str(&literal);
                continue;
            }
            flush(&mut pending, &mut steps);
            steps.push(sync_step(move |state| {
                text.execute(state)?;
                Ok(Flow::Continue)
            }));
            continue;
        }
        if let Some(step) = lower(node)? {
            flush(&mut pending, &mut steps);
            steps.push(step);
        }
    }
    flush(&mut pending, &mut steps);
    Ok(Block::new(steps))
}

fn flush(pending: &mut String, steps: &mut Vec<Step>) {
    if pending.is_empty() {
        return;
    }
    let text = std::mem::take(pending);
    steps.push(sync_step(move |state| {
        state.output.write(&text);
        Ok(Flow::Continue)
    }));
}

fn lower(node: &Node) -> Result<Option<Step>, ParseError> {
    let step = match node.kind {
        NodeKind::Element => lower_element(node)?,
        NodeKind::Set => {
            let set = SetDirective::from_node(node)?;
            sync_step(move |state| {
                set.execute(state)?;
                Ok(Flow::Continue)
            })
        }
        NodeKind::If => lower_if(node)?,
        NodeKind::Loop => lower_loop(node)?,
        NodeKind::Return => {
            let directive = ReturnDirective::from_node(node)?;
            sync_step(move |state| Ok(Flow::Return(directive.evaluate(&state.ctx)?)))
        }
        NodeKind::Dump => {
            let dump = DumpDirective::from_node(node)?;
            sync_step(move |state| {
                dump.execute(state)?;
                Ok(Flow::Continue)
            })
        }
        NodeKind::Log => {
            let log = LogDirective::from_node(node)?;
            sync_step(move |state| {
                log.execute(state)?;
                Ok(Flow::Continue)
            })
        }
        NodeKind::Query | NodeKind::Data | NodeKind::Fetch | NodeKind::Invoke | NodeKind::Llm => {
            let spec = Arc::new(OperationSpec::from_node(node)?);
            async_step(move |host| {
                let spec = Arc::clone(&spec);
                Box::pin(async move {
                    perform(host, &spec).await?;
                    Ok(Flow::Continue)
                })
            })
        }
        NodeKind::Text
        | NodeKind::Component
        | NodeKind::Function
        | NodeKind::Param
        | NodeKind::ElseIf
        | NodeKind::Else
        | NodeKind::Message
        | NodeKind::Header
        | NodeKind::Transform
        | NodeKind::Filter
        | NodeKind::Sort
        | NodeKind::Limit
        | NodeKind::Compute
        | NodeKind::Field => return Ok(None),
    };
    Ok(Some(step))
}

fn lower_element(node: &Node) -> Result<Step, ParseError> {
    let element = ElementDirective::from_node(node)?;
    let step = match lower_block(&node.children)? {
        Block::Sync(body) => sync_step(move |state| {
            element.write_open(state)?;
            let flow = run_sync(&body, state)?;
            element.write_close(state);
            Ok(flow)
        }),
        body => {
            let shared = Arc::new((element, body));
            async_step(move |host| {
                let shared = Arc::clone(&shared);
                Box::pin(async move {
                    let (element, body) = &*shared;
                    element.write_open(&mut host.state)?;
                    let flow = body.run(host).await?;
                    element.write_close(&mut host.state);
                    Ok(flow)
                })
            })
        }
    };
    Ok(step)
}

type Conditions = Vec<(Option<Expression>, SourceSpan)>;

fn selected(conditions: &Conditions, state: &RenderState) -> Result<Option<usize>, RenderError> {
    select_arm(
        conditions.iter().map(|(condition, span)| (condition.as_ref(), *span)),
        &state.ctx,
    )
}

fn lower_if(node: &Node) -> Result<Step, ParseError> {
    let directive = IfDirective::from_node(node)?;
    let conditions: Conditions = directive
        .arms
        .iter()
        .map(|arm| (arm.condition.clone(), arm.span))
        .collect();
    let bodies = directive
        .arms
        .iter()
        .map(|arm| lower_block(arm.body))
        .collect::<Result<Vec<_>, _>>()?;

    let step = match all_sync(bodies) {
        Ok(bodies) => sync_step(move |state| match selected(&conditions, state)? {
            Some(index) => run_sync(&bodies[index], state),
            None => Ok(Flow::Continue),
        }),
        Err(bodies) => {
            let shared = Arc::new((conditions, bodies));
            async_step(move |host| {
                let shared = Arc::clone(&shared);
                Box::pin(async move {
                    let (conditions, bodies) = &*shared;
                    match selected(conditions, &host.state)? {
                        Some(index) => bodies[index].run(host).await,
                        None => Ok(Flow::Continue),
                    }
                })
            })
        }
    };
    Ok(step)
}

fn lower_loop(node: &Node) -> Result<Step, ParseError> {
    let directive = LoopDirective::from_node(node)?;
    let step = match lower_block(&node.children)? {
        Block::Sync(body) => sync_step(move |state| {
            for iteration in directive.iterations(&state.ctx)? {
                enter_iteration(&mut state.ctx, iteration);
                let flow = run_sync(&body, state);
                state.ctx.exit_scope();
                if let Flow::Return(value) = flow? {
                    return Ok(Flow::Return(value));
                }
            }
            Ok(Flow::Continue)
        }),
        body => {
            let shared = Arc::new((directive, body));
            async_step(move |host| {
                let shared = Arc::clone(&shared);
                Box::pin(async move {
                    let (directive, body) = &*shared;
                    for iteration in directive.iterations(&host.state.ctx)? {
                        enter_iteration(&mut host.state.ctx, iteration);
                        let flow = body.run(host).await;
                        host.state.ctx.exit_scope();
                        if let Flow::Return(value) = flow? {
                            return Ok(Flow::Return(value));
                        }
                    }
                    Ok(Flow::Continue)
                })
            })
        }
    };
    Ok(step)
}

// =============================================================================
// UNITS
// =============================================================================

struct CompiledCallable {
    params: Vec<ParamSpec>,
    body: Block,
    span: SourceSpan,
}

impl CompiledCallable {
    fn lower(node: &Node) -> Result<(String, Self), ParseError> {
        let callable = Callable::from_node(node)?;
        let compiled = Self {
            body: lower_block(callable.body)?,
            params: callable.params,
            span: callable.span,
        };
        Ok((callable.name, compiled))
    }
}

#[derive(Default)]
struct CallTable {
    functions: HashMap<String, Arc<CompiledCallable>>,
    components: HashMap<String, Arc<CompiledCallable>>,
}

/// A document lowered once, renderable any number of times
pub struct CompiledUnit {
    main: Block,
    calls: Arc<CallTable>,
    first_component: Option<Arc<CompiledCallable>>,
    top_level_content: bool,
}

/// Lower a parsed document
pub fn compile(doc: &Document) -> Result<CompiledUnit, ParseError> {
    let mut calls = CallTable::default();
    // The first definition of a name wins, as in the tree walk
    for node in doc.functions() {
        let (name, callable) = CompiledCallable::lower(node)?;
        calls.functions.entry(name).or_insert_with(|| Arc::new(callable));
    }
    let mut first_component = None;
    for node in doc.components() {
        let (name, callable) = CompiledCallable::lower(node)?;
        let callable = Arc::clone(calls.components.entry(name).or_insert_with(|| Arc::new(callable)));
        first_component.get_or_insert(callable);
    }

    Ok(CompiledUnit {
        main: lower_block(&doc.nodes)?,
        calls: Arc::new(calls),
        first_component,
        top_level_content: doc.has_top_level_content(),
    })
}

impl CompiledUnit {
    /// Render the entry point: top-level content, the requested component,
    /// or the first component
    pub(crate) async fn run(&self, state: RenderState, component: Option<&str>) -> Result<RenderState, RenderError> {
        let mut host = UnitHost {
            calls: Arc::clone(&self.calls),
            state,
        };

        let entry = match component {
            Some(name) => Some(
                self.calls
                    .components
                    .get(name)
                    .cloned()
                    .ok_or_else(|| RenderError::UnknownComponent(name.to_string()))?,
            ),
            None if self.top_level_content => None,
            None => self.first_component.clone(),
        };

        match entry {
            Some(component) => {
                bind_entry(&mut host.state, &component.params, component.span)?;
                component.body.run(&mut host).await?;
            }
            None => {
                self.main.run(&mut host).await?;
            }
        }
        Ok(host.state)
    }

    pub fn function_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.calls.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn component_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.calls.components.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Whether rendering the entry point can suspend on I/O
    pub fn is_async(&self) -> bool {
        matches!(self.main, Block::Mixed(_))
    }
}

impl std::fmt::Debug for CompiledUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledUnit")
            .field("steps", &self.main.len())
            .field("functions", &self.function_names())
            .field("components", &self.component_names())
            .finish()
    }
}

struct UnitHost {
    calls: Arc<CallTable>,
    state: RenderState,
}

impl UnitHost {
    async fn call(
        &mut self,
        callable: Arc<CompiledCallable>,
        args: &BTreeMap<String, Value>,
    ) -> Result<Result<Value, OperationError>, RenderError> {
        if let Err(error) = enter_call(&mut self.state, &callable.params, args, callable.span)? {
            return Ok(Err(error));
        }
        let flow = callable.body.run(self).await;
        exit_call(&mut self.state, flow).map(Ok)
    }
}

#[async_trait]
impl ExecutionHost for UnitHost {
    async fn call_function(
        &mut self,
        name: &str,
        args: &BTreeMap<String, Value>,
    ) -> Result<Result<Value, OperationError>, RenderError> {
        match self.calls.functions.get(name).cloned() {
            Some(callable) => self.call(callable, args).await,
            None => Ok(Err(OperationError::new(
                ErrorKind::TargetResolution,
                format!("Unknown function '{}'", name),
            ))),
        }
    }

    async fn render_component(
        &mut self,
        name: &str,
        args: &BTreeMap<String, Value>,
    ) -> Result<Result<Value, OperationError>, RenderError> {
        match self.calls.components.get(name).cloned() {
            Some(callable) => self.call(callable, args).await,
            None => Ok(Err(OperationError::new(
                ErrorKind::TargetResolution,
                format!("Unknown component '{}'", name),
            ))),
        }
    }
}

impl RenderHost for UnitHost {
    fn state(&mut self) -> &mut RenderState {
        &mut self.state
    }
}
