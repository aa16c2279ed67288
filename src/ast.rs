//! Abstract Syntax Tree definitions for Tessera
//!
//! A parsed source file is a [`Document`]: a tree of [`Node`]s. Language
//! tags (`<q:set>`, `<q:loop>`, ...) map to a [`NodeKind`]; any other tag is
//! an [`NodeKind::Element`] that renders as markup. Attribute values are
//! kept raw; expressions inside them are parsed into [`Template`]s by the
//! consumers (interpreter, compiler), never stored in the tree.

use crate::types::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Source location information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceSpan {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
    pub length: usize,
}

impl fmt::Display for SourceSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A parsed source file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub nodes: Vec<Node>,
}

impl Document {
    /// Top-level component definitions, in source order
    pub fn components(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.kind == NodeKind::Component)
    }

    /// Find a top-level component by name
    pub fn component(&self, name: &str) -> Option<&Node> {
        self.components().find(|c| c.attr("name") == Some(name))
    }

    /// Find a function declared at the top level or directly inside a component
    pub fn function(&self, name: &str) -> Option<&Node> {
        self.functions().find(|f| f.attr("name") == Some(name))
    }

    /// All hoisted function declarations
    pub fn functions(&self) -> impl Iterator<Item = &Node> {
        let top = self.nodes.iter().filter(|n| n.kind == NodeKind::Function);
        let nested = self
            .components()
            .flat_map(|c| c.children.iter())
            .filter(|n| n.kind == NodeKind::Function);
        top.chain(nested)
    }

    /// Whether the document has executable content outside component and
    /// function definitions
    pub fn has_top_level_content(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| !matches!(n.kind, NodeKind::Component | NodeKind::Function))
    }
}

/// Node kinds. `Text` and `Element` are output; the rest are language tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Text,
    Element,
    Component,
    Set,
    If,
    ElseIf,
    Else,
    Loop,
    Function,
    Param,
    Return,
    Query,
    Data,
    Fetch,
    Invoke,
    Llm,
    Message,
    Header,
    Transform,
    Filter,
    Sort,
    Limit,
    Compute,
    Field,
    Dump,
    Log,
}

/// Prefix that marks a tag as a language tag
pub const LANGUAGE_PREFIX: &str = "q:";

impl NodeKind {
    /// Map the local part of a `q:` tag to its kind (case-insensitive)
    pub fn from_tag(local: &str) -> Option<NodeKind> {
        let kind = match local.to_ascii_lowercase().as_str() {
            "component" => NodeKind::Component,
            "set" => NodeKind::Set,
            "if" => NodeKind::If,
            "elseif" => NodeKind::ElseIf,
            "else" => NodeKind::Else,
            "loop" => NodeKind::Loop,
            "function" => NodeKind::Function,
            "param" => NodeKind::Param,
            "return" => NodeKind::Return,
            "query" => NodeKind::Query,
            "data" => NodeKind::Data,
            "fetch" => NodeKind::Fetch,
            "invoke" => NodeKind::Invoke,
            "llm" => NodeKind::Llm,
            "message" => NodeKind::Message,
            "header" => NodeKind::Header,
            "transform" => NodeKind::Transform,
            "filter" => NodeKind::Filter,
            "sort" => NodeKind::Sort,
            "limit" => NodeKind::Limit,
            "compute" => NodeKind::Compute,
            "field" => NodeKind::Field,
            "dump" => NodeKind::Dump,
            "log" => NodeKind::Log,
            _ => return None,
        };
        Some(kind)
    }

    /// Display name used in diagnostics ("Field requires 'xpath' attribute")
    pub fn name(self) -> &'static str {
        match self {
            NodeKind::Text => "Text",
            NodeKind::Element => "Element",
            NodeKind::Component => "Component",
            NodeKind::Set => "Set",
            NodeKind::If => "If",
            NodeKind::ElseIf => "ElseIf",
            NodeKind::Else => "Else",
            NodeKind::Loop => "Loop",
            NodeKind::Function => "Function",
            NodeKind::Param => "Param",
            NodeKind::Return => "Return",
            NodeKind::Query => "Query",
            NodeKind::Data => "Data",
            NodeKind::Fetch => "Fetch",
            NodeKind::Invoke => "Invoke",
            NodeKind::Llm => "Llm",
            NodeKind::Message => "Message",
            NodeKind::Header => "Header",
            NodeKind::Transform => "Transform",
            NodeKind::Filter => "Filter",
            NodeKind::Sort => "Sort",
            NodeKind::Limit => "Limit",
            NodeKind::Compute => "Compute",
            NodeKind::Field => "Field",
            NodeKind::Dump => "Dump",
            NodeKind::Log => "Log",
        }
    }

    /// Declarative I/O operations sharing the execute/cache/retry contract
    pub fn is_operation(self) -> bool {
        matches!(
            self,
            NodeKind::Query | NodeKind::Data | NodeKind::Fetch | NodeKind::Invoke | NodeKind::Llm
        )
    }

    /// Kinds that never take children
    pub fn is_self_closing(self) -> bool {
        matches!(
            self,
            NodeKind::Dump
                | NodeKind::Log
                | NodeKind::Header
                | NodeKind::Param
                | NodeKind::Return
                | NodeKind::Field
                | NodeKind::Filter
                | NodeKind::Sort
                | NodeKind::Limit
                | NodeKind::Compute
        )
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single raw attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: String,
    pub span: SourceSpan,
}

/// Ordered attribute list with case-insensitive lookup
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Attributes(Vec<Attribute>);

impl Attributes {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, attribute: Attribute) {
        self.0.push(attribute);
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.0.iter().find(|a| a.name.eq_ignore_ascii_case(name))
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).map(|a| a.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A node of the document tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    /// Tag name as written in the source (empty for text)
    pub tag: String,
    pub attributes: Attributes,
    pub children: Vec<Node>,
    /// Raw text for `Text` nodes
    pub text: Option<String>,
    pub self_closing: bool,
    pub span: SourceSpan,
}

impl Node {
    /// Create a text node
    pub fn text(text: impl Into<String>, span: SourceSpan) -> Self {
        Self {
            kind: NodeKind::Text,
            tag: String::new(),
            attributes: Attributes::new(),
            children: Vec::new(),
            text: Some(text.into()),
            self_closing: false,
            span,
        }
    }

    /// Raw attribute value
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.value(name)
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attributes.contains(name)
    }

    /// Span of an attribute, falling back to the node's span
    pub fn attr_span(&self, name: &str) -> SourceSpan {
        self.attributes.get(name).map(|a| a.span).unwrap_or(self.span)
    }

    /// Direct children of a given kind
    pub fn children_of(&self, kind: NodeKind) -> impl Iterator<Item = &Node> {
        self.children.iter().filter(move |c| c.kind == kind)
    }

    /// Concatenated raw text of the direct text children
    pub fn text_content(&self) -> String {
        self.children
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<String>()
    }
}

/// Expression (produces a value)
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Literal value
    Literal(Value),

    /// Variable reference
    Variable(String),

    /// Member access: `obj.field`
    Member {
        object: Box<Expression>,
        field: String,
    },

    /// Index access: `list[0]` or `map["key"]`
    Index {
        object: Box<Expression>,
        index: Box<Expression>,
    },

    /// Builtin function call: `upper(name)`
    Call { name: String, args: Vec<Expression> },

    /// Unary operation: `NOT a`, `-a`
    Unary {
        op: UnaryOperator,
        operand: Box<Expression>,
    },

    /// Binary operation: `a + b`, `a == b`, etc.
    Binary {
        op: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },

    /// Ternary conditional: `condition ? then_expr : else_expr`
    Ternary {
        condition: Box<Expression>,
        then_expr: Box<Expression>,
        else_expr: Box<Expression>,
    },

    /// Array literal: `[1, 2, 3]`
    Array(Vec<Expression>),
}

impl Expression {
    /// Visit every builtin call name in this expression
    pub fn call_names(&self, out: &mut Vec<String>) {
        match self {
            Expression::Literal(_) | Expression::Variable(_) => {}
            Expression::Member { object, .. } => object.call_names(out),
            Expression::Index { object, index } => {
                object.call_names(out);
                index.call_names(out);
            }
            Expression::Call { name, args } => {
                out.push(name.clone());
                args.iter().for_each(|a| a.call_names(out));
            }
            Expression::Unary { operand, .. } => operand.call_names(out),
            Expression::Binary { left, right, .. } => {
                left.call_names(out);
                right.call_names(out);
            }
            Expression::Ternary {
                condition,
                then_expr,
                else_expr,
            } => {
                condition.call_names(out);
                then_expr.call_names(out);
                else_expr.call_names(out);
            }
            Expression::Array(items) => items.iter().for_each(|a| a.call_names(out)),
        }
    }
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    // Arithmetic
    Add,      // +
    Subtract, // -
    Multiply, // *
    Divide,   // /
    Modulo,   // %

    // String concatenation
    Concat, // &

    // Comparison
    Equal,              // ==
    NotEqual,           // !=
    LessThan,           // <
    LessThanOrEqual,    // <=
    GreaterThan,        // >
    GreaterThanOrEqual, // >=

    // Logical
    And, // AND, &&
    Or,  // OR, ||
}

impl BinaryOperator {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Subtract => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
            BinaryOperator::Modulo => "%",
            BinaryOperator::Concat => "&",
            BinaryOperator::Equal => "==",
            BinaryOperator::NotEqual => "!=",
            BinaryOperator::LessThan => "<",
            BinaryOperator::LessThanOrEqual => "<=",
            BinaryOperator::GreaterThan => ">",
            BinaryOperator::GreaterThanOrEqual => ">=",
            BinaryOperator::And => "AND",
            BinaryOperator::Or => "OR",
        }
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,    // NOT, !
    Negate, // -
}

/// Part of an interpolated attribute or text value
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Literal(String),
    Expr(Expression),
}

/// A raw value split into literal text and `{expr}` segments
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Template {
    pub parts: Vec<TemplatePart>,
}

impl Template {
    /// A template holding only literal text
    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            parts: vec![TemplatePart::Literal(text.into())],
        }
    }

    /// The expression when the whole template is exactly one `{expr}`
    pub fn single_expression(&self) -> Option<&Expression> {
        match self.parts.as_slice() {
            [TemplatePart::Expr(expr)] => Some(expr),
            _ => None,
        }
    }

    /// The text when the template contains no expressions
    pub fn as_literal(&self) -> Option<String> {
        self.parts
            .iter()
            .map(|p| match p {
                TemplatePart::Literal(s) => Some(s.as_str()),
                TemplatePart::Expr(_) => None,
            })
            .collect::<Option<String>>()
    }

    pub fn is_literal(&self) -> bool {
        self.parts
            .iter()
            .all(|p| matches!(p, TemplatePart::Literal(_)))
    }

    /// Builtin call names used anywhere in the template
    pub fn call_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for part in &self.parts {
            if let TemplatePart::Expr(expr) = part {
                expr.call_names(&mut names);
            }
        }
        names
    }
}
