//! Tree-walking backend
//!
//! Nodes are lowered through their `from_node` constructors on every visit;
//! the compiler lowers the same constructors once.

use crate::ast::{Document, Node, NodeKind};
use crate::directives::{
    select_arm, Callable, DumpDirective, ElementDirective, IfDirective, LogDirective, LoopDirective,
    ReturnDirective, SetDirective, TextDirective,
};
use crate::engine::ExecutionHost;
use crate::error::RenderError;
use crate::operations::OperationSpec;
use crate::result::{ErrorKind, OperationError};
use crate::runtime::{bind_entry, enter_call, enter_iteration, exit_call, perform, Flow, RenderHost, RenderState};
use crate::types::Value;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::BTreeMap;

/// Walks one document
#[derive(Debug, Clone, Copy)]
pub struct Interpreter<'d> {
    doc: &'d Document,
}

impl<'d> Interpreter<'d> {
    pub fn new(doc: &'d Document) -> Self {
        Self { doc }
    }

    /// Render the entry point: top-level content, the requested component,
    /// or the first component
    pub async fn run(self, state: RenderState, component: Option<&str>) -> Result<RenderState, RenderError> {
        let mut host = TreeHost {
            doc: self.doc,
            state,
        };

        let entry = match component {
            Some(name) => Some(
                self.doc
                    .component(name)
                    .ok_or_else(|| RenderError::UnknownComponent(name.to_string()))?,
            ),
            None if self.doc.has_top_level_content() => None,
            None => self.doc.components().next(),
        };

        match entry {
            Some(node) => {
                let callable = Callable::from_node(node)?;
                bind_entry(&mut host.state, &callable.params, callable.span)?;
                host.walk(callable.body).await?;
            }
            None => {
                host.walk(&self.doc.nodes).await?;
            }
        }
        Ok(host.state)
    }
}

struct TreeHost<'d> {
    doc: &'d Document,
    state: RenderState,
}

impl<'d> TreeHost<'d> {
    fn walk<'a>(&'a mut self, nodes: &'d [Node]) -> BoxFuture<'a, Result<Flow, RenderError>> {
        Box::pin(async move {
            for node in nodes {
                if let Flow::Return(value) = self.visit(node).await? {
                    return Ok(Flow::Return(value));
                }
            }
            Ok(Flow::Continue)
        })
    }

    async fn visit(&mut self, node: &'d Node) -> Result<Flow, RenderError> {
        match node.kind {
            NodeKind::Text => TextDirective::from_node(node)?.execute(&mut self.state)?,
            NodeKind::Element => {
                let element = ElementDirective::from_node(node)?;
                element.write_open(&mut self.state)?;
                let flow = self.walk(&node.children).await?;
                element.write_close(&mut self.state);
                return Ok(flow);
            }
            NodeKind::Set => SetDirective::from_node(node)?.execute(&mut self.state)?,
            NodeKind::If => {
                let directive = IfDirective::from_node(node)?;
                let arms = directive.arms.iter().map(|a| (a.condition.as_ref(), a.span));
                if let Some(index) = select_arm(arms, &self.state.ctx)? {
                    return self.walk(directive.arms[index].body).await;
                }
            }
            NodeKind::Loop => {
                let directive = LoopDirective::from_node(node)?;
                for iteration in directive.iterations(&self.state.ctx)? {
                    enter_iteration(&mut self.state.ctx, iteration);
                    let flow = self.walk(&node.children).await;
                    self.state.ctx.exit_scope();
                    if let Flow::Return(value) = flow? {
                        return Ok(Flow::Return(value));
                    }
                }
            }
            NodeKind::Return => {
                let value = ReturnDirective::from_node(node)?.evaluate(&self.state.ctx)?;
                return Ok(Flow::Return(value));
            }
            NodeKind::Dump => DumpDirective::from_node(node)?.execute(&mut self.state)?,
            NodeKind::Log => LogDirective::from_node(node)?.execute(&mut self.state)?,
            NodeKind::Query | NodeKind::Data | NodeKind::Fetch | NodeKind::Invoke | NodeKind::Llm => {
                let spec = OperationSpec::from_node(node)?;
                perform(self, &spec).await?;
            }
            // Definitions and children consumed by their parent
            NodeKind::Component
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
            | NodeKind::Field => {}
        }
        Ok(Flow::Continue)
    }

    async fn call(
        &mut self,
        node: &'d Node,
        args: &BTreeMap<String, Value>,
    ) -> Result<Result<Value, OperationError>, RenderError> {
        let callable = Callable::from_node(node)?;
        if let Err(error) = enter_call(&mut self.state, &callable.params, args, callable.span)? {
            return Ok(Err(error));
        }
        let flow = self.walk(callable.body).await;
        exit_call(&mut self.state, flow).map(Ok)
    }
}

fn unknown(kind: &str, name: &str) -> OperationError {
    OperationError::new(ErrorKind::TargetResolution, format!("Unknown {} '{}'", kind, name))
}

#[async_trait]
impl<'d> ExecutionHost for TreeHost<'d> {
    async fn call_function(
        &mut self,
        name: &str,
        args: &BTreeMap<String, Value>,
    ) -> Result<Result<Value, OperationError>, RenderError> {
        match self.doc.function(name) {
            Some(node) => self.call(node, args).await,
            None => Ok(Err(unknown("function", name))),
        }
    }

    async fn render_component(
        &mut self,
        name: &str,
        args: &BTreeMap<String, Value>,
    ) -> Result<Result<Value, OperationError>, RenderError> {
        match self.doc.component(name) {
            Some(node) => self.call(node, args).await,
            None => Ok(Err(unknown("component", name))),
        }
    }
}

impl<'d> RenderHost for TreeHost<'d> {
    fn state(&mut self) -> &mut RenderState {
        &mut self.state
    }
}

#[cfg(test)]
mod tests {
    use crate::parser::parse;
    use crate::runtime::{RenderRequest, Runtime};
    use crate::types::Value;
    use pretty_assertions::assert_eq;

    async fn render(source: &str) -> String {
        let doc = parse(source).unwrap();
        Runtime::default()
            .render(&doc, RenderRequest::new())
            .await
            .unwrap()
            .body
    }

    #[tokio::test]
    async fn test_if_chain_runs_one_arm() {
        let source = r#"<q:set name="n" value="5"/><q:if condition="n > 10">big<q:elseif condition="n > 3">medium</q:elseif><q:else>small</q:else></q:if>"#;
        assert_eq!(render(source).await, "medium");
    }

    #[tokio::test]
    async fn test_return_unwinds_loop() {
        let source = r#"<q:function name="first_even">
                <q:loop items="{[1, 3, 4, 6]}" item="n">
                    <q:if condition="n % 2 == 0"><q:return value="{n}"/></q:if>
                </q:loop>
                <q:return value="none"/>
            </q:function>
            <q:invoke name="r" function="first_even"/>{r.data}"#;
        assert_eq!(render(source).await, "4");
    }

    #[tokio::test]
    async fn test_function_missing_parameter_is_validation_error() {
        let source = r#"<q:function name="greet"><q:param name="who" required="true"/>hi {who}</q:function>
            <q:invoke name="r" function="greet"/>{r.success} {r.error.kind}"#;
        assert_eq!(render(source).await, "false validation");
    }

    #[tokio::test]
    async fn test_function_does_not_see_caller_loop_locals() {
        let source = r#"<q:function name="peek">[{item}]</q:function>
            <q:loop list="a,b" item="item"><q:invoke name="r" function="peek"/>{r.data}</q:loop>"#;
        assert_eq!(render(source).await, "[][]");
    }

    #[tokio::test]
    async fn test_entry_component_binds_params() {
        let doc = parse(
            r#"<q:component name="card"><q:param name="title" default="Untitled"/><h1>{title}</h1></q:component>"#,
        )
        .unwrap();
        let runtime = Runtime::default();
        let plain = runtime.render(&doc, RenderRequest::new()).await.unwrap();
        assert_eq!(plain.body, "<h1>Untitled</h1>");
        let seeded = runtime
            .render(&doc, RenderRequest::new().variable("title", "News"))
            .await
            .unwrap();
        assert_eq!(seeded.body, "<h1>News</h1>");
        assert_eq!(seeded.variable("title"), Value::from("News"));
    }

    #[tokio::test]
    async fn test_unknown_component_request() {
        let doc = parse(r#"<q:component name="a">x</q:component>"#).unwrap();
        let err = Runtime::default()
            .render(&doc, RenderRequest::new().component("b"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "unknown component 'b'");
    }

    #[tokio::test]
    async fn test_recursion_depth_is_bounded() {
        let doc = parse(r#"<q:function name="f"><q:invoke function="f"/></q:function><q:invoke function="f"/>"#).unwrap();
        let err = Runtime::default()
            .render(&doc, RenderRequest::new())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("maximum call depth of 64 exceeded"));
    }
}
