//! Lowering of structural nodes
//!
//! Every language node is lowered into a small directive struct by a
//! `from_node` constructor that performs all attribute validation. The
//! parser calls these constructors to validate, the interpreter calls them
//! on every visit and the compiler calls them once; because all three share
//! the same code, both backends see identical semantics and produce
//! identical output.

use crate::ast::{Expression, Node, NodeKind, SourceSpan, Template};
use crate::context::{ExecutionContext, ScopeKind};
use crate::error::{EvalError, ParamError, ParseError, ParseErrorKind, RenderError};
use crate::evaluator::{apply_binary, Evaluator, Resolver};
use crate::functions;
use crate::operations::{HeaderSpec, MessageSpec, OperationSpec};
use crate::import::FieldSpec;
use crate::runtime::RenderState;
use crate::token_parser::{parse_expression, parse_template};
use crate::transform::TransformStep;
use crate::ast::BinaryOperator;
use crate::types::{coerce, TypeHint, Value};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;

/// Validate a single node whose children are already known
pub fn validate(node: &Node) -> Result<(), ParseError> {
    match node.kind {
        NodeKind::Text => TextDirective::from_node(node).map(drop),
        NodeKind::Element => ElementDirective::from_node(node).map(drop),
        NodeKind::Set => SetDirective::from_node(node).map(drop),
        NodeKind::If => IfDirective::from_node(node).map(drop),
        NodeKind::ElseIf => required_expression(node, "condition").map(drop),
        NodeKind::Else | NodeKind::Transform => Ok(()),
        NodeKind::Loop => LoopDirective::from_node(node).map(drop),
        NodeKind::Function | NodeKind::Component => Callable::from_node(node).map(drop),
        NodeKind::Param => ParamSpec::from_node(node).map(drop),
        NodeKind::Return => ReturnDirective::from_node(node).map(drop),
        NodeKind::Dump => DumpDirective::from_node(node).map(drop),
        NodeKind::Log => LogDirective::from_node(node).map(drop),
        NodeKind::Query | NodeKind::Data | NodeKind::Fetch | NodeKind::Invoke | NodeKind::Llm => {
            OperationSpec::from_node(node).map(drop)
        }
        NodeKind::Header => HeaderSpec::from_node(node).map(drop),
        NodeKind::Message => MessageSpec::from_node(node).map(drop),
        NodeKind::Field => FieldSpec::from_node(node).map(drop),
        NodeKind::Filter | NodeKind::Sort | NodeKind::Limit | NodeKind::Compute => {
            TransformStep::from_node(node).map(drop)
        }
    }
}

// =============================================================================
// ATTRIBUTE HELPERS
// =============================================================================

fn expression_error(node: &Node, attr: &str, message: String) -> ParseError {
    ParseError {
        kind: ParseErrorKind::Syntax,
        node: Some(node.kind),
        attribute: Some(attr.to_string()),
        reason: message,
        span: Some(node.attr_span(attr)),
    }
}

fn check_calls(node: &Node, attr: &str, names: Vec<String>) -> Result<(), ParseError> {
    match names.into_iter().find(|name| !functions::is_builtin(name)) {
        Some(name) => Err(ParseError::target(
            node.kind,
            attr,
            format!("Unknown function '{}'", name),
            node.attr_span(attr),
        )),
        None => Ok(()),
    }
}

/// Optional templated attribute
pub fn template_attr(node: &Node, attr: &str) -> Result<Option<Template>, ParseError> {
    let Some(raw) = node.attr(attr) else {
        return Ok(None);
    };
    let template = parse_template(raw).map_err(|e| {
        expression_error(node, attr, format!("invalid expression in '{}': {}", attr, e))
    })?;
    check_calls(node, attr, template.call_names())?;
    Ok(Some(template))
}

/// Required templated attribute
pub fn required_template(node: &Node, attr: &str) -> Result<Template, ParseError> {
    template_attr(node, attr)?.ok_or_else(|| ParseError::missing_attribute(node.kind, attr, node.span))
}

/// Attribute holding one expression, written bare (`x > 1`) or braced (`{x > 1}`)
pub fn expression_attr(node: &Node, attr: &str) -> Result<Option<Expression>, ParseError> {
    let Some(raw) = node.attr(attr) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    let invalid = |e: crate::error::ExpressionError| {
        expression_error(node, attr, format!("invalid expression in '{}': {}", attr, e))
    };

    let expr = if trimmed.starts_with('{') && !trimmed.starts_with("{{") {
        let template = parse_template(trimmed).map_err(invalid)?;
        template.single_expression().cloned().ok_or_else(|| {
            expression_error(
                node,
                attr,
                format!("'{}' must hold a single expression", attr),
            )
        })?
    } else {
        parse_expression(trimmed).map_err(invalid)?
    };

    let mut names = Vec::new();
    expr.call_names(&mut names);
    check_calls(node, attr, names)?;
    Ok(Some(expr))
}

pub fn required_expression(node: &Node, attr: &str) -> Result<Expression, ParseError> {
    expression_attr(node, attr)?.ok_or_else(|| ParseError::missing_attribute(node.kind, attr, node.span))
}

/// Required plain (non-templated) attribute
pub fn required_attr<'n>(node: &'n Node, attr: &str) -> Result<&'n str, ParseError> {
    match node.attr(attr) {
        Some(value) if !value.trim().is_empty() => Ok(value.trim()),
        _ => Err(ParseError::missing_attribute(node.kind, attr, node.span)),
    }
}

/// Optional non-negative integer attribute
pub fn uint_attr(node: &Node, attr: &str) -> Result<Option<u64>, ParseError> {
    let Some(raw) = node.attr(attr) else {
        return Ok(None);
    };
    raw.trim().parse::<u64>().map(Some).map_err(|_| {
        ParseError::attribute(
            node.kind,
            attr,
            format!("{} attribute '{}' must be a non-negative integer", node.kind, attr),
            node.attr_span(attr),
        )
    })
}

/// Optional boolean attribute (`true/false/yes/no/1/0`)
pub fn flag_attr(node: &Node, attr: &str) -> Result<Option<bool>, ParseError> {
    let Some(raw) = node.attr(attr) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(Some(true)),
        "false" | "no" | "0" => Ok(Some(false)),
        _ => Err(ParseError::attribute(
            node.kind,
            attr,
            format!("{} attribute '{}' must be true or false", node.kind, attr),
            node.attr_span(attr),
        )),
    }
}

/// Optional type hint attribute
pub fn type_attr(node: &Node, attr: &str) -> Result<Option<TypeHint>, ParseError> {
    let Some(raw) = node.attr(attr) else {
        return Ok(None);
    };
    TypeHint::parse(raw).map(Some).ok_or_else(|| {
        ParseError::attribute(
            node.kind,
            attr,
            format!("{} has unknown type '{}'", node.kind, raw.trim()),
            node.attr_span(attr),
        )
    })
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

/// Required identifier attribute (`name`, `item`, ...)
pub fn identifier_attr(node: &Node, attr: &str) -> Result<String, ParseError> {
    let name = required_attr(node, attr)?;
    if !is_identifier(name) {
        return Err(ParseError::attribute(
            node.kind,
            attr,
            format!("{} attribute '{}' is not a valid name: '{}'", node.kind, attr, name),
            node.attr_span(attr),
        ));
    }
    Ok(name.to_string())
}

fn optional_identifier(node: &Node, attr: &str) -> Result<Option<String>, ParseError> {
    if node.has_attr(attr) {
        identifier_attr(node, attr).map(Some)
    } else {
        Ok(None)
    }
}

// =============================================================================
// VALUES
// =============================================================================

/// Typed reading of a literal attribute value
pub fn infer_literal(text: &str) -> Value {
    if let Ok(i) = text.parse::<i64>() {
        if i.to_string() == text {
            return Value::Integer(i);
        }
    }
    let numeric_shape = !text.is_empty()
        && text.chars().all(|c| c.is_ascii_digit() || c == '.' || c == '-')
        && text.chars().filter(|c| *c == '.').count() == 1;
    if numeric_shape {
        if let Ok(d) = text.parse::<f64>() {
            return Value::Decimal(d);
        }
    }
    match text {
        "true" => Value::Boolean(true),
        "false" => Value::Boolean(false),
        _ => Value::String(text.to_string()),
    }
}

/// A templated attribute read as a value: a lone `{expr}` keeps its type,
/// a plain literal is read as a number or boolean when it looks like one,
/// anything else is a string
#[derive(Debug, Clone, PartialEq)]
pub struct ValueExpr {
    pub template: Template,
}

impl ValueExpr {
    pub fn new(template: Template) -> Self {
        Self { template }
    }

    pub fn evaluate(&self, scope: &dyn Resolver) -> Result<Value, EvalError> {
        if let Some(text) = self.template.as_literal() {
            return Ok(infer_literal(&text));
        }
        Evaluator::new(scope).value_of(&self.template)
    }
}

fn value_attr(node: &Node, attr: &str) -> Result<Option<ValueExpr>, ParseError> {
    Ok(template_attr(node, attr)?.map(ValueExpr::new))
}

// =============================================================================
// OUTPUT
// =============================================================================

/// Interpolated text
#[derive(Debug, Clone)]
pub struct TextDirective {
    pub template: Template,
    pub span: SourceSpan,
}

impl TextDirective {
    pub fn from_node(node: &Node) -> Result<Self, ParseError> {
        let raw = node.text.as_deref().unwrap_or_default();
        let template = parse_template(raw).map_err(|e| ParseError {
            kind: ParseErrorKind::Syntax,
            node: Some(NodeKind::Text),
            attribute: None,
            reason: format!("invalid expression in text: {}", e),
            span: Some(node.span),
        })?;
        let names = template.call_names();
        if let Some(name) = names.iter().find(|n| !functions::is_builtin(n)) {
            return Err(ParseError {
                kind: ParseErrorKind::TargetResolution,
                node: Some(NodeKind::Text),
                attribute: None,
                reason: format!("Unknown function '{}'", name),
                span: Some(node.span),
            });
        }
        Ok(Self {
            template,
            span: node.span,
        })
    }

    pub fn execute(&self, state: &mut RenderState) -> Result<(), RenderError> {
        let text = Evaluator::new(&state.ctx)
            .render(&self.template)
            .map_err(|e| RenderError::eval(e, self.span))?;
        state.output.write(&text);
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum MarkupSegment {
    Literal(String),
    /// Attribute value, escaped when written
    Value(Template),
}

/// Output markup element, pre-split into literal and templated segments
#[derive(Debug, Clone)]
pub struct ElementDirective {
    open: Vec<MarkupSegment>,
    close: Option<String>,
    span: SourceSpan,
}

impl ElementDirective {
    pub fn from_node(node: &Node) -> Result<Self, ParseError> {
        let mut open = Vec::new();
        let mut literal = format!("<{}", node.tag);

        for attribute in node.attributes.iter() {
            let template = required_template(node, &attribute.name)?;
            literal.push_str(&format!(" {}=\"", attribute.name));
            match template.as_literal() {
                Some(text) => literal.push_str(&escape_attribute(&text)),
                None => {
                    open.push(MarkupSegment::Literal(std::mem::take(&mut literal)));
                    open.push(MarkupSegment::Value(template));
                }
            }
            literal.push('"');
        }

        let empty = node.self_closing && node.children.is_empty();
        literal.push_str(if empty { "/>" } else { ">" });
        open.push(MarkupSegment::Literal(literal));

        Ok(Self {
            open,
            close: (!empty).then(|| format!("</{}>", node.tag)),
            span: node.span,
        })
    }

    pub fn write_open(&self, state: &mut RenderState) -> Result<(), RenderError> {
        let mut out = String::new();
        for segment in &self.open {
            match segment {
                MarkupSegment::Literal(text) => out.push_str(text),
                MarkupSegment::Value(template) => {
                    let value = Evaluator::new(&state.ctx)
                        .render(template)
                        .map_err(|e| RenderError::eval(e, self.span))?;
                    out.push_str(&escape_attribute(&value));
                }
            }
        }
        state.output.write(&out);
        Ok(())
    }

    pub fn write_close(&self, state: &mut RenderState) {
        if let Some(close) = &self.close {
            state.output.write(close);
        }
    }
}

fn escape_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
}

// =============================================================================
// SET
// =============================================================================

/// Operation applied by a Set node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOperation {
    Assign,
    Add,
    Subtract,
    Multiply,
    Divide,
    Increment,
    Decrement,
    Append,
    Json,
}

impl SetOperation {
    pub fn parse(name: &str) -> Option<SetOperation> {
        let op = match name.trim().to_ascii_lowercase().as_str() {
            "assign" | "set" => SetOperation::Assign,
            "add" => SetOperation::Add,
            "subtract" => SetOperation::Subtract,
            "multiply" => SetOperation::Multiply,
            "divide" => SetOperation::Divide,
            "increment" => SetOperation::Increment,
            "decrement" => SetOperation::Decrement,
            "append" => SetOperation::Append,
            "json" => SetOperation::Json,
            _ => return None,
        };
        Some(op)
    }
}

/// `<q:set name value operation type scope>`
#[derive(Debug, Clone)]
pub struct SetDirective {
    pub path: Vec<String>,
    pub level: Option<ScopeKind>,
    pub value: Option<ValueExpr>,
    pub operation: SetOperation,
    pub type_hint: Option<TypeHint>,
    pub span: SourceSpan,
}

impl SetDirective {
    pub fn from_node(node: &Node) -> Result<Self, ParseError> {
        let name = required_attr(node, "name")?;
        let mut path: Vec<String> = name.split('.').map(str::to_string).collect();
        if !path.iter().all(|segment| is_identifier(segment)) {
            return Err(ParseError::attribute(
                NodeKind::Set,
                "name",
                format!("Set attribute 'name' is not a valid name: '{}'", name),
                node.attr_span("name"),
            ));
        }

        let mut level = match node.attr("scope") {
            Some(raw) => Some(ScopeKind::parse(raw).ok_or_else(|| {
                ParseError::attribute(
                    NodeKind::Set,
                    "scope",
                    format!("Set has unknown scope '{}'", raw.trim()),
                    node.attr_span("scope"),
                )
            })?),
            None => None,
        };
        if path.len() > 1 {
            let qualifier = ScopeKind::parse(&path[0])
                .filter(|k| matches!(k, ScopeKind::Application | ScopeKind::Session | ScopeKind::Page));
            if let Some(qualifier) = qualifier {
                if level.is_some_and(|l| l != qualifier) {
                    return Err(ParseError::attribute(
                        NodeKind::Set,
                        "scope",
                        "Set can only specify one scope",
                        node.attr_span("scope"),
                    ));
                }
                level = Some(qualifier);
                path.remove(0);
            }
        }

        let operation = match node.attr("operation") {
            Some(raw) => SetOperation::parse(raw).ok_or_else(|| {
                ParseError::attribute(
                    NodeKind::Set,
                    "operation",
                    format!("Set has unknown operation '{}'", raw.trim()),
                    node.attr_span("operation"),
                )
            })?,
            None => SetOperation::Assign,
        };

        let value = value_attr(node, "value")?;
        if value.is_none()
            && !matches!(operation, SetOperation::Increment | SetOperation::Decrement)
        {
            return Err(ParseError::missing_attribute(NodeKind::Set, "value", node.span));
        }

        Ok(Self {
            path,
            level,
            value,
            operation,
            type_hint: type_attr(node, "type")?,
            span: node.span,
        })
    }

    /// Current value at the target path (undefined when unset)
    fn current(&self, ctx: &ExecutionContext) -> Value {
        let Some((root, rest)) = self.path.split_first() else {
            return Value::Undefined;
        };
        rest.iter()
            .fold(ctx.current(root, self.level), |value, field| value.member(field))
    }

    pub fn execute(&self, state: &mut RenderState) -> Result<(), RenderError> {
        let eval_error = |e| RenderError::eval(e, self.span);
        let operand = match &self.value {
            Some(value) => Some(value.evaluate(&state.ctx).map_err(eval_error)?),
            None => None,
        };

        let numeric_current = || match self.current(&state.ctx) {
            Value::Undefined | Value::Null => Value::Integer(0),
            other => other,
        };

        let result = match self.operation {
            SetOperation::Assign => operand.unwrap_or_default(),
            SetOperation::Add => apply_binary(BinaryOperator::Add, numeric_current(), operand.unwrap_or_default()).map_err(eval_error)?,
            SetOperation::Subtract => apply_binary(BinaryOperator::Subtract, numeric_current(), operand.unwrap_or_default()).map_err(eval_error)?,
            SetOperation::Multiply => apply_binary(BinaryOperator::Multiply, numeric_current(), operand.unwrap_or_default()).map_err(eval_error)?,
            SetOperation::Divide => apply_binary(BinaryOperator::Divide, numeric_current(), operand.unwrap_or_default()).map_err(eval_error)?,
            SetOperation::Increment => apply_binary(
                BinaryOperator::Add,
                numeric_current(),
                operand.unwrap_or(Value::Integer(1)),
            )
            .map_err(eval_error)?,
            SetOperation::Decrement => apply_binary(
                BinaryOperator::Subtract,
                numeric_current(),
                operand.unwrap_or(Value::Integer(1)),
            )
            .map_err(eval_error)?,
            SetOperation::Append => {
                let item = operand.unwrap_or_default();
                match self.current(&state.ctx) {
                    Value::Array(mut items) => {
                        items.push(item);
                        Value::Array(items)
                    }
                    Value::Undefined | Value::Null => Value::Array(vec![item]),
                    other => Value::Array(vec![other, item]),
                }
            }
            SetOperation::Json => coerce(operand.unwrap_or_default(), TypeHint::Json)
                .map_err(|source| RenderError::Type {
                    source,
                    span: self.span,
                })?,
        };

        let result = match self.type_hint {
            Some(hint) => coerce(result, hint).map_err(|source| RenderError::Type {
                source,
                span: self.span,
            })?,
            None => result,
        };

        state.ctx.assign_path(&self.path, result, self.level);
        Ok(())
    }
}

// =============================================================================
// CONDITIONALS
// =============================================================================

/// One branch of an If chain; `condition` is `None` for Else
#[derive(Debug, Clone)]
pub struct Arm<'n> {
    pub condition: Option<Expression>,
    pub body: &'n [Node],
    pub span: SourceSpan,
}

/// `<q:if condition>` with trailing `<q:elseif>` / `<q:else>` children
#[derive(Debug, Clone)]
pub struct IfDirective<'n> {
    pub arms: Vec<Arm<'n>>,
}

impl<'n> IfDirective<'n> {
    pub fn from_node(node: &'n Node) -> Result<Self, ParseError> {
        let condition = required_expression(node, "condition")?;
        let first_branch = node
            .children
            .iter()
            .position(|c| matches!(c.kind, NodeKind::ElseIf | NodeKind::Else))
            .unwrap_or(node.children.len());

        let mut arms = vec![Arm {
            condition: Some(condition),
            body: &node.children[..first_branch],
            span: node.span,
        }];

        let mut seen_else = false;
        for child in &node.children[first_branch..] {
            match child.kind {
                NodeKind::ElseIf if seen_else => {
                    return Err(ParseError::structure(
                        NodeKind::ElseIf,
                        "ElseIf cannot follow Else",
                        child.span,
                    ))
                }
                NodeKind::Else if seen_else => {
                    return Err(ParseError::structure(
                        NodeKind::Else,
                        "If can only have one Else",
                        child.span,
                    ))
                }
                NodeKind::ElseIf => arms.push(Arm {
                    condition: Some(required_expression(child, "condition")?),
                    body: &child.children,
                    span: child.span,
                }),
                NodeKind::Else => {
                    seen_else = true;
                    arms.push(Arm {
                        condition: None,
                        body: &child.children,
                        span: child.span,
                    });
                }
                _ => {
                    return Err(ParseError::structure(
                        NodeKind::If,
                        "If body must come before ElseIf and Else",
                        child.span,
                    ))
                }
            }
        }

        Ok(Self { arms })
    }
}

/// Index of the arm to run: the first truthy condition, else the Else arm
pub fn select_arm<'a>(
    conditions: impl IntoIterator<Item = (Option<&'a Expression>, SourceSpan)>,
    ctx: &ExecutionContext,
) -> Result<Option<usize>, RenderError> {
    let evaluator = Evaluator::new(ctx);
    for (index, (condition, span)) in conditions.into_iter().enumerate() {
        match condition {
            None => return Ok(Some(index)),
            Some(expr) => {
                if evaluator
                    .evaluate(expr)
                    .map_err(|e| RenderError::eval(e, span))?
                    .is_truthy()
                {
                    return Ok(Some(index));
                }
            }
        }
    }
    Ok(None)
}

// =============================================================================
// LOOPS
// =============================================================================

/// Where a Loop's iterations come from
#[derive(Debug, Clone)]
pub enum LoopSource {
    /// Array (objects iterate `{key, value}` entries)
    Items(Expression),
    /// Delimited list
    List { list: Template, delimiter: String },
    /// Rows of a prior Query/Data result bound under this name
    Query(String),
    /// Inclusive integer range
    Range {
        from: ValueExpr,
        to: ValueExpr,
        step: Option<ValueExpr>,
    },
}

/// `<q:loop>`
#[derive(Debug, Clone)]
pub struct LoopDirective {
    pub source: LoopSource,
    pub item: Option<String>,
    pub index: Option<String>,
    pub span: SourceSpan,
}

/// Names bound in one iteration's loop frame
pub type Iteration = Vec<(String, Value)>;

impl LoopDirective {
    pub fn from_node(node: &Node) -> Result<Self, ParseError> {
        let sources = ["items", "list", "query", "from"];
        let present: Vec<&str> = sources
            .iter()
            .copied()
            .filter(|attr| node.has_attr(attr))
            .collect();
        if present.len() > 1 {
            return Err(ParseError::attribute(
                NodeKind::Loop,
                present[1],
                "Loop can only specify one source",
                node.attr_span(present[1]),
            ));
        }

        let source = match present.first().copied() {
            Some("items") => LoopSource::Items(required_expression(node, "items")?),
            Some("list") => LoopSource::List {
                list: required_template(node, "list")?,
                delimiter: node.attr("delimiter").unwrap_or(",").to_string(),
            },
            Some("query") => LoopSource::Query(identifier_attr(node, "query")?),
            Some(_) => LoopSource::Range {
                from: ValueExpr::new(required_template(node, "from")?),
                to: ValueExpr::new(required_template(node, "to")?),
                step: value_attr(node, "step")?,
            },
            None => {
                return Err(ParseError::attribute(
                    NodeKind::Loop,
                    "items",
                    "Loop requires a source (items, list, query or from/to)",
                    node.span,
                ))
            }
        };

        let item = optional_identifier(node, "item")?;
        let index = optional_identifier(node, "index")?;
        Ok(Self {
            item: item.or_else(|| match source {
                LoopSource::Query(_) => None,
                _ => Some("item".to_string()),
            }),
            source,
            index,
            span: node.span,
        })
    }

    /// Bindings for each iteration. Collection sources are read before the
    /// body runs; ranges are stepped lazily.
    pub fn iterations(
        &self,
        ctx: &ExecutionContext,
    ) -> Result<Box<dyn Iterator<Item = Iteration> + Send + '_>, RenderError> {
        let eval_error = |e| RenderError::eval(e, self.span);
        let values: Box<dyn Iterator<Item = (Value, Iteration)> + Send> = match &self.source {
            LoopSource::Items(expr) => {
                let values: Vec<(Value, Iteration)> = match Evaluator::new(ctx).evaluate(expr).map_err(eval_error)? {
                    Value::Array(items) => items.into_iter().map(|v| (v, Vec::new())).collect(),
                    Value::Object(map) => map
                        .into_iter()
                        .map(|(key, value)| {
                            let mut entry = BTreeMap::new();
                            entry.insert("key".to_string(), Value::String(key));
                            entry.insert("value".to_string(), value);
                            (Value::Object(entry), Vec::new())
                        })
                        .collect(),
                    Value::Undefined | Value::Null => Vec::new(),
                    other => vec![(other, Vec::new())],
                };
                Box::new(values.into_iter())
            }
            LoopSource::List { list, delimiter } => {
                let text = Evaluator::new(ctx).render(list).map_err(eval_error)?;
                Box::new(
                    split_list(&text, delimiter)
                        .into_iter()
                        .map(|s| (Value::String(s), Vec::new())),
                )
            }
            LoopSource::Query(name) => {
                let result = ctx.resolve(name);
                let rows = match result.member("data") {
                    Value::Array(rows) => rows,
                    _ => result.as_array().cloned().unwrap_or_default(),
                };
                let columns = result.member("columnList");
                let count = rows.len() as i64;
                let rows: Vec<(Value, Iteration)> = rows
                    .into_iter()
                    .enumerate()
                    .map(|(i, row)| {
                        let mut bound = row.as_object().cloned().unwrap_or_default();
                        bound.insert("recordCount".to_string(), Value::Integer(count));
                        bound.insert("currentRow".to_string(), Value::Integer(i as i64 + 1));
                        if !columns.is_undefined() {
                            bound.insert("columnList".to_string(), columns.clone());
                        }
                        (row, vec![(name.clone(), Value::Object(bound))])
                    })
                    .collect();
                Box::new(rows.into_iter())
            }
            LoopSource::Range { from, to, step } => {
                let bound = |expr: &ValueExpr, what: &str| -> Result<i64, RenderError> {
                    let value = expr.evaluate(ctx).map_err(eval_error)?;
                    value.as_i64().ok_or_else(|| {
                        RenderError::eval(
                            EvalError::Type(format!(
                                "Loop '{}' must be an integer, got '{}'",
                                what, value
                            )),
                            self.span,
                        )
                    })
                };
                let start = bound(from, "from")?;
                let end = bound(to, "to")?;
                let step = match step {
                    Some(step) => bound(step, "step")?,
                    None => 1,
                };
                if step == 0 {
                    return Err(RenderError::eval(
                        EvalError::Type("Loop 'step' cannot be zero".to_string()),
                        self.span,
                    ));
                }
                Box::new(
                    RangeSteps {
                        next: Some(start),
                        end,
                        step,
                    }
                    .map(|i| (Value::Integer(i), Vec::new())),
                )
            }
        };

        Ok(Box::new(values.enumerate().map(
            move |(index, (value, mut bindings))| {
                if let Some(item) = &self.item {
                    bindings.push((item.clone(), value));
                }
                if let Some(name) = &self.index {
                    bindings.push((name.clone(), Value::Integer(index as i64)));
                }
                bindings
            },
        )))
    }
}

/// Inclusive integer range with a signed, non-zero step
struct RangeSteps {
    next: Option<i64>,
    end: i64,
    step: i64,
}

impl Iterator for RangeSteps {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        let current = self.next?;
        let in_range = if self.step > 0 {
            current <= self.end
        } else {
            current >= self.end
        };
        if !in_range {
            self.next = None;
            return None;
        }
        self.next = current.checked_add(self.step);
        Some(current)
    }
}

fn split_list(text: &str, delimiter: &str) -> Vec<String> {
    let pieces: Vec<&str> = if delimiter.is_empty() {
        vec![text]
    } else {
        text.split(delimiter).collect()
    };
    pieces
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// =============================================================================
// CALLABLES
// =============================================================================

/// Declared parameter of a Function or Component, or an argument passed to
/// an operation (`value` set)
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub type_hint: Option<TypeHint>,
    pub required: bool,
    pub default: Option<ValueExpr>,
    pub value: Option<ValueExpr>,
    pub pattern: Option<Regex>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub span: SourceSpan,
}

impl ParamSpec {
    pub fn from_node(node: &Node) -> Result<Self, ParseError> {
        let name = identifier_attr(node, "name")?;
        let pattern = match node.attr("pattern") {
            Some(raw) => Some(Regex::new(&format!("^(?:{})$", raw)).map_err(|e| {
                ParseError::attribute(
                    NodeKind::Param,
                    "pattern",
                    format!("Param has invalid pattern: {}", e),
                    node.attr_span("pattern"),
                )
            })?),
            None => None,
        };
        let bound = |attr: &str| -> Result<Option<f64>, ParseError> {
            match node.attr(attr) {
                Some(raw) => raw.trim().parse::<f64>().map(Some).map_err(|_| {
                    ParseError::attribute(
                        NodeKind::Param,
                        attr,
                        format!("Param attribute '{}' must be a number", attr),
                        node.attr_span(attr),
                    )
                }),
                None => Ok(None),
            }
        };

        Ok(Self {
            name,
            type_hint: type_attr(node, "type")?,
            required: flag_attr(node, "required")?.unwrap_or(false),
            default: value_attr(node, "default")?,
            value: value_attr(node, "value")?,
            pattern,
            min: bound("min")?,
            max: bound("max")?,
            span: node.span,
        })
    }

    /// Coerce and check a bound value
    pub fn validate(&self, value: Value) -> Result<Value, ParamError> {
        let value = match self.type_hint {
            Some(hint) => coerce(value, hint).map_err(|source| ParamError::Type {
                name: self.name.clone(),
                source,
            })?,
            None => value,
        };
        if value.is_undefined() {
            return Ok(value);
        }

        if let Some(pattern) = &self.pattern {
            let text = value.to_string();
            if !pattern.is_match(&text) {
                return Err(ParamError::Invalid {
                    name: self.name.clone(),
                    reason: format!("'{}' does not match the required pattern", text),
                });
            }
        }

        let measure = match &value {
            Value::Integer(_) | Value::Decimal(_) => value.as_f64(),
            Value::String(s) => Some(s.chars().count() as f64),
            Value::Array(items) => Some(items.len() as f64),
            _ => None,
        };
        if let Some(measure) = measure {
            if let Some(min) = self.min.filter(|min| measure < *min) {
                return Err(ParamError::Invalid {
                    name: self.name.clone(),
                    reason: format!("must be at least {}", min),
                });
            }
            if let Some(max) = self.max.filter(|max| measure > *max) {
                return Err(ParamError::Invalid {
                    name: self.name.clone(),
                    reason: format!("must be at most {}", max),
                });
            }
        }
        Ok(value)
    }
}

/// Bind a callable's parameters. Each value comes from the explicit
/// arguments, then the caller's context, then the declared default.
/// Undeclared explicit arguments are passed through.
pub fn bind_arguments(
    params: &[ParamSpec],
    explicit: &BTreeMap<String, Value>,
    caller: &ExecutionContext,
) -> Result<Vec<(String, Value)>, ParamError> {
    let mut bound = Vec::new();
    for param in params {
        let supplied = explicit
            .get(&param.name)
            .filter(|v| !v.is_undefined())
            .cloned()
            .or_else(|| Some(caller.resolve(&param.name)).filter(|v| !v.is_undefined()));

        let value = match (supplied, &param.default) {
            (Some(value), _) => value,
            (None, Some(default)) => default.evaluate(caller).map_err(|e| ParamError::Invalid {
                name: param.name.clone(),
                reason: e.to_string(),
            })?,
            (None, None) if param.required => return Err(ParamError::Missing(param.name.clone())),
            (None, None) => continue,
        };
        bound.push((param.name.clone(), param.validate(value)?));
    }

    for (name, value) in explicit {
        if !params.iter().any(|p| &p.name == name) {
            bound.push((name.clone(), value.clone()));
        }
    }
    Ok(bound)
}

/// A Function or Component definition
#[derive(Debug, Clone)]
pub struct Callable<'n> {
    pub kind: NodeKind,
    pub name: String,
    pub params: Vec<ParamSpec>,
    /// All children; Param and nested Function nodes are no-ops when walked
    pub body: &'n [Node],
    pub span: SourceSpan,
}

impl<'n> Callable<'n> {
    pub fn from_node(node: &'n Node) -> Result<Self, ParseError> {
        let params = node
            .children_of(NodeKind::Param)
            .map(ParamSpec::from_node)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            kind: node.kind,
            name: identifier_attr(node, "name")?,
            params,
            body: &node.children,
            span: node.span,
        })
    }
}

/// `<q:return value>`
#[derive(Debug, Clone)]
pub struct ReturnDirective {
    pub value: Option<ValueExpr>,
    pub span: SourceSpan,
}

impl ReturnDirective {
    pub fn from_node(node: &Node) -> Result<Self, ParseError> {
        Ok(Self {
            value: value_attr(node, "value")?,
            span: node.span,
        })
    }

    pub fn evaluate(&self, ctx: &ExecutionContext) -> Result<Value, RenderError> {
        match &self.value {
            Some(value) => value
                .evaluate(ctx)
                .map_err(|e| RenderError::eval(e, self.span)),
            None => Ok(Value::Undefined),
        }
    }
}

// =============================================================================
// DIAGNOSTICS
// =============================================================================

/// `<q:dump var label depth>`
#[derive(Debug, Clone)]
pub struct DumpDirective {
    pub var: Expression,
    pub label: Option<Template>,
    pub default_label: String,
    pub depth: Option<usize>,
    pub span: SourceSpan,
}

impl DumpDirective {
    pub fn from_node(node: &Node) -> Result<Self, ParseError> {
        let var = required_expression(node, "var")?;
        let raw = node.attr("var").unwrap_or_default().trim();
        let default_label = raw
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .unwrap_or(raw)
            .trim()
            .to_string();
        Ok(Self {
            var,
            label: template_attr(node, "label")?,
            default_label,
            depth: uint_attr(node, "depth")?.map(|d| d as usize),
            span: node.span,
        })
    }

    pub fn execute(&self, state: &mut RenderState) -> Result<(), RenderError> {
        let evaluator = Evaluator::new(&state.ctx);
        let value = evaluator
            .evaluate(&self.var)
            .map_err(|e| RenderError::eval(e, self.span))?;
        let label = match &self.label {
            Some(label) => evaluator
                .render(label)
                .map_err(|e| RenderError::eval(e, self.span))?,
            None => self.default_label.clone(),
        };
        let depth = self.depth.unwrap_or(state.config.dump.depth);
        let line = format!("{} => {}\n", label, dump_repr(&value, depth));
        state.output.write(&line);
        Ok(())
    }
}

/// Bounded-depth representation used by Dump
pub fn dump_repr(value: &Value, depth: usize) -> String {
    let mut out = String::new();
    write_repr(value, depth, &mut out);
    out
}

fn write_repr(value: &Value, depth: usize, out: &mut String) {
    match value {
        Value::Undefined => out.push_str("undefined"),
        Value::Null => out.push_str("null"),
        Value::String(s) => {
            out.push('"');
            out.push_str(s);
            out.push('"');
        }
        Value::Array(items) if items.is_empty() => out.push_str("[]"),
        Value::Array(_) if depth == 0 => out.push_str("[...]"),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_repr(item, depth - 1, out);
            }
            out.push(']');
        }
        Value::Object(map) if map.is_empty() => out.push_str("{}"),
        Value::Object(_) if depth == 0 => out.push_str("{...}"),
        Value::Object(map) => {
            out.push('{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(key);
                out.push_str(": ");
                write_repr(item, depth - 1, out);
            }
            out.push('}');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Severity of a Log node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(name: &str) -> Option<LogLevel> {
        let level = match name.trim().to_ascii_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => return None,
        };
        Some(level)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

/// A message recorded by a Log node
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
}

/// `<q:log message level>`
#[derive(Debug, Clone)]
pub struct LogDirective {
    pub message: Template,
    pub level: LogLevel,
    pub span: SourceSpan,
}

impl LogDirective {
    pub fn from_node(node: &Node) -> Result<Self, ParseError> {
        let level = match node.attr("level") {
            Some(raw) => LogLevel::parse(raw).ok_or_else(|| {
                ParseError::attribute(
                    NodeKind::Log,
                    "level",
                    format!("Log has unknown level '{}'", raw.trim()),
                    node.attr_span("level"),
                )
            })?,
            None => LogLevel::Info,
        };
        Ok(Self {
            message: required_template(node, "message")?,
            level,
            span: node.span,
        })
    }

    pub fn execute(&self, state: &mut RenderState) -> Result<(), RenderError> {
        let message = Evaluator::new(&state.ctx)
            .render(&self.message)
            .map_err(|e| RenderError::eval(e, self.span))?;
        let line = self.span.line;
        match self.level {
            LogLevel::Trace => tracing::trace!(target: "tessera::log", line, "{}", message),
            LogLevel::Debug => tracing::debug!(target: "tessera::log", line, "{}", message),
            LogLevel::Info => tracing::info!(target: "tessera::log", line, "{}", message),
            LogLevel::Warn => tracing::warn!(target: "tessera::log", line, "{}", message),
            LogLevel::Error => tracing::error!(target: "tessera::log", line, "{}", message),
        }
        state.logs.push(LogRecord {
            level: self.level,
            message,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn first(source: &str) -> Node {
        parse(source).unwrap().nodes.remove(0)
    }

    fn reason(source: &str) -> String {
        parse(source).unwrap_err().reason
    }

    #[test]
    fn test_infer_literal() {
        assert_eq!(infer_literal("42"), Value::Integer(42));
        assert_eq!(infer_literal("-1.5"), Value::Decimal(-1.5));
        assert_eq!(infer_literal("007"), Value::from("007"));
        assert_eq!(infer_literal("true"), Value::Boolean(true));
        assert_eq!(infer_literal("1.2.3"), Value::from("1.2.3"));
    }

    #[test]
    fn test_set_lowering() {
        let set = SetDirective::from_node(&first(
            r#"<q:set name="session.user.name" value="{n}" type="string"/>"#,
        ))
        .unwrap();
        assert_eq!(set.level, Some(ScopeKind::Session));
        assert_eq!(set.path, vec!["user".to_string(), "name".to_string()]);
        assert_eq!(set.type_hint, Some(TypeHint::String));
    }

    #[test]
    fn test_set_validation_reasons() {
        assert_eq!(reason(r#"<q:set value="1"/>"#), "Set requires 'name' attribute");
        assert_eq!(reason(r#"<q:set name="a"/>"#), "Set requires 'value' attribute");
        assert_eq!(
            reason(r#"<q:set name="a" value="1" operation="explode"/>"#),
            "Set has unknown operation 'explode'"
        );
        assert_eq!(
            reason(r#"<q:set name="a" value="1" type="float64"/>"#),
            "Set has unknown type 'float64'"
        );
        assert!(parse(r#"<q:set name="a" operation="increment"/>"#).is_ok());
    }

    #[test]
    fn test_if_chain_rules() {
        let node = first(
            r#"<q:if condition="a">A<q:elseif condition="{b}">B</q:elseif><q:else>C</q:else></q:if>"#,
        );
        let directive = IfDirective::from_node(&node).unwrap();
        assert_eq!(directive.arms.len(), 3);
        assert!(directive.arms[2].condition.is_none());

        assert_eq!(
            reason(r#"<q:if condition="a"><q:else>x</q:else><q:else>y</q:else></q:if>"#),
            "If can only have one Else"
        );
        assert_eq!(
            reason(r#"<q:if condition="a"><q:else>x</q:else>tail</q:if>"#),
            "If body must come before ElseIf and Else"
        );
        assert_eq!(reason(r#"<q:if>x</q:if>"#), "If requires 'condition' attribute");
    }

    #[test]
    fn test_loop_sources() {
        assert_eq!(
            reason(r#"<q:loop items="{a}" list="x,y">z</q:loop>"#),
            "Loop can only specify one source"
        );
        assert_eq!(
            reason(r#"<q:loop item="x">z</q:loop>"#),
            "Loop requires a source (items, list, query or from/to)"
        );
        assert_eq!(reason(r#"<q:loop from="1">z</q:loop>"#), "Loop requires 'to' attribute");

        let ctx = ExecutionContext::isolated();
        let directive =
            LoopDirective::from_node(&first(r#"<q:loop from="1" to="5" step="2" index="i">x</q:loop>"#))
                .unwrap();
        let iterations: Vec<Iteration> = directive.iterations(&ctx).unwrap().collect();
        assert_eq!(iterations.len(), 3);
        assert_eq!(
            iterations[2],
            vec![
                ("item".to_string(), Value::Integer(5)),
                ("i".to_string(), Value::Integer(2))
            ]
        );

        let directive =
            LoopDirective::from_node(&first(r#"<q:loop list="a; b;;c" delimiter=";">x</q:loop>"#))
                .unwrap();
        assert_eq!(directive.iterations(&ctx).unwrap().count(), 3);

        let directive = LoopDirective::from_node(&first(
            r#"<q:loop from="9223372036854775806" to="9223372036854775807">x</q:loop>"#,
        ))
        .unwrap();
        assert_eq!(directive.iterations(&ctx).unwrap().count(), 2);
    }

    #[test]
    fn test_range_is_stepped_lazily() {
        let ctx = ExecutionContext::isolated();
        let directive = LoopDirective::from_node(&first(
            r#"<q:loop from="1" to="9000000000000000000" index="i">x</q:loop>"#,
        ))
        .unwrap();
        let mut iterations = directive.iterations(&ctx).unwrap();
        assert_eq!(iterations.next().unwrap()[0], ("item".to_string(), Value::Integer(1)));
        let third = iterations.nth(1).unwrap();
        assert_eq!(third[1], ("i".to_string(), Value::Integer(2)));

        let directive =
            LoopDirective::from_node(&first(r#"<q:loop from="3" to="1">x</q:loop>"#)).unwrap();
        assert_eq!(directive.iterations(&ctx).unwrap().count(), 0);
    }

    #[test]
    fn test_query_loop_bindings() {
        let mut ctx = ExecutionContext::isolated();
        let rows = Value::Array(vec![
            Value::from_json(serde_json::json!({"id": 1})),
            Value::from_json(serde_json::json!({"id": 2})),
        ]);
        let mut result = BTreeMap::new();
        result.insert("data".to_string(), rows);
        ctx.assign("users", Value::Object(result));

        let directive =
            LoopDirective::from_node(&first(r#"<q:loop query="users">x</q:loop>"#)).unwrap();
        let iterations: Vec<Iteration> = directive.iterations(&ctx).unwrap().collect();
        assert_eq!(iterations.len(), 2);
        let (name, row) = &iterations[1][0];
        assert_eq!(name, "users");
        assert_eq!(row.member("id"), Value::Integer(2));
        assert_eq!(row.member("currentRow"), Value::Integer(2));
        assert_eq!(row.member("recordCount"), Value::Integer(2));
    }

    #[test]
    fn test_param_validation() {
        let node = first(
            r#"<q:function name="f"><q:param name="age" type="integer" min="0" max="150"/><q:param name="code" pattern="[A-Z]{3}"/></q:function>"#,
        );
        let callable = Callable::from_node(&node).unwrap();
        let age = &callable.params[0];
        assert_eq!(age.validate(Value::from("42")).unwrap(), Value::Integer(42));
        assert!(matches!(age.validate(Value::from("x")), Err(ParamError::Type { .. })));
        assert!(matches!(age.validate(Value::Integer(200)), Err(ParamError::Invalid { .. })));

        let code = &callable.params[1];
        assert!(code.validate(Value::from("ABC")).is_ok());
        assert!(code.validate(Value::from("ABCD")).is_err());
    }

    #[test]
    fn test_bind_arguments_order() {
        let node = first(
            r#"<q:function name="f"><q:param name="a" required="true"/><q:param name="b" default="7"/><q:param name="c"/></q:function>"#,
        );
        let callable = Callable::from_node(&node).unwrap();
        let mut caller = ExecutionContext::isolated();
        caller.assign("a", Value::from("from caller"));

        let bound = bind_arguments(&callable.params, &BTreeMap::new(), &caller).unwrap();
        assert_eq!(
            bound,
            vec![
                ("a".to_string(), Value::from("from caller")),
                ("b".to_string(), Value::Integer(7)),
            ]
        );

        let empty = ExecutionContext::isolated();
        assert_eq!(
            bind_arguments(&callable.params, &BTreeMap::new(), &empty),
            Err(ParamError::Missing("a".to_string()))
        );
    }

    #[test]
    fn test_dump_repr_is_bounded() {
        let value = Value::from_json(serde_json::json!({"a": [1, [2, [3]]], "s": "x"}));
        assert_eq!(dump_repr(&value, 3), r#"{a: [1, [2, [...]]], s: "x"}"#);
        assert_eq!(dump_repr(&value, 0), "{...}");
        assert_eq!(dump_repr(&Value::Undefined, 3), "undefined");
    }

    #[test]
    fn test_unknown_builtin_in_attribute() {
        let err = parse(r#"<p title="{shout(x)}">x</p>"#).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::TargetResolution);
        assert_eq!(err.reason, "Unknown function 'shout'");
    }
}
