//! Error types and diagnostic formatting for Tessera
//!
//! Structural problems (bad markup, missing attributes, unknown targets) are
//! [`ParseError`]s and abort before anything runs. Runtime failures of
//! structural nodes abort the render as a [`RenderError`] carrying the source
//! span. I/O failures never show up here: they are recovered into Result
//! Objects by the operation engine.

use crate::ast::{NodeKind, SourceSpan};
use crate::types::{TypeHint, Value};
use colored::Colorize;
use thiserror::Error;

/// Category of a parse failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Malformed markup or expression text
    Syntax,
    /// Missing, conflicting or malformed attribute
    Attribute,
    /// Node placed where its kind is not allowed
    Structure,
    /// Invocation target that does not exist
    TargetResolution,
}

/// Error produced while parsing and validating a document
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{reason}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub node: Option<NodeKind>,
    pub attribute: Option<String>,
    pub reason: String,
    pub span: Option<SourceSpan>,
}

impl ParseError {
    pub fn syntax(reason: impl Into<String>, span: SourceSpan) -> Self {
        Self {
            kind: ParseErrorKind::Syntax,
            node: None,
            attribute: None,
            reason: reason.into(),
            span: Some(span),
        }
    }

    pub fn attribute(
        node: NodeKind,
        attribute: &str,
        reason: impl Into<String>,
        span: SourceSpan,
    ) -> Self {
        Self {
            kind: ParseErrorKind::Attribute,
            node: Some(node),
            attribute: Some(attribute.to_string()),
            reason: reason.into(),
            span: Some(span),
        }
    }

    /// `"{Kind} requires '{attr}' attribute"`
    pub fn missing_attribute(node: NodeKind, attribute: &str, span: SourceSpan) -> Self {
        Self::attribute(
            node,
            attribute,
            format!("{} requires '{}' attribute", node, attribute),
            span,
        )
    }

    pub fn structure(node: NodeKind, reason: impl Into<String>, span: SourceSpan) -> Self {
        Self {
            kind: ParseErrorKind::Structure,
            node: Some(node),
            attribute: None,
            reason: reason.into(),
            span: Some(span),
        }
    }

    pub fn target(node: NodeKind, attribute: &str, reason: impl Into<String>, span: SourceSpan) -> Self {
        Self {
            kind: ParseErrorKind::TargetResolution,
            node: Some(node),
            attribute: Some(attribute.to_string()),
            reason: reason.into(),
            span: Some(span),
        }
    }

    /// Attach a node kind when the error came from a nested helper
    pub fn on_node(mut self, node: NodeKind) -> Self {
        self.node.get_or_insert(node);
        self
    }
}

/// Malformed expression text
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} at column {column}")]
pub struct ExpressionError {
    pub message: String,
    /// One-based column within the expression text
    pub column: usize,
}

impl ExpressionError {
    pub fn new(message: impl Into<String>, column: usize) -> Self {
        Self {
            message: message.into(),
            column,
        }
    }
}

/// A value that cannot be coerced to a declared type hint
#[derive(Debug, Clone, PartialEq, Error)]
#[error("cannot convert '{value}' ({found}) to {expected}")]
pub struct TypeError {
    pub expected: TypeHint,
    pub found: &'static str,
    pub value: String,
}

impl TypeError {
    pub fn new(expected: TypeHint, value: &Value) -> Self {
        let mut text = value.to_string();
        if text.chars().count() > 60 {
            text = text.chars().take(57).collect::<String>() + "...";
        }
        Self {
            expected,
            found: value.type_name(),
            value: text,
        }
    }
}

/// Expression evaluation failure
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("invalid expression: {0}")]
    Syntax(#[from] ExpressionError),

    #[error("{0}")]
    Type(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("{message}")]
    Function { name: String, message: String },
}

impl EvalError {
    pub fn function(name: &str, message: impl Into<String>) -> Self {
        EvalError::Function {
            name: name.to_string(),
            message: message.into(),
        }
    }
}

/// Parameter binding failure
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParamError {
    #[error("missing required parameter '{0}'")]
    Missing(String),

    #[error("parameter '{name}': {source}")]
    Type {
        name: String,
        #[source]
        source: TypeError,
    },

    #[error("parameter '{name}': {reason}")]
    Invalid { name: String, reason: String },
}

/// Failure that aborts a render
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RenderError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("{source} (at {span})")]
    Eval { source: EvalError, span: SourceSpan },

    #[error("{source} (at {span})")]
    Type { source: TypeError, span: SourceSpan },

    #[error("{source} (at {span})")]
    Parameter { source: ParamError, span: SourceSpan },

    #[error("{reason} (at {span})")]
    TargetResolution { reason: String, span: SourceSpan },

    #[error("unknown component '{0}'")]
    UnknownComponent(String),

    #[error("maximum call depth of {limit} exceeded (at {span})")]
    CallDepth { limit: usize, span: SourceSpan },

    #[error("output sink failed: {0}")]
    Output(String),

    #[error("render cancelled")]
    Cancelled,
}

impl RenderError {
    pub fn eval(source: EvalError, span: SourceSpan) -> Self {
        RenderError::Eval { source, span }
    }

    /// Source location of the failing node, if known
    pub fn span(&self) -> Option<SourceSpan> {
        match self {
            RenderError::Parse(err) => err.span,
            RenderError::Eval { span, .. }
            | RenderError::Type { span, .. }
            | RenderError::Parameter { span, .. }
            | RenderError::TargetResolution { span, .. }
            | RenderError::CallDepth { span, .. } => Some(*span),
            RenderError::UnknownComponent(_) | RenderError::Output(_) | RenderError::Cancelled => {
                None
            }
        }
    }
}

/// Format a parse error with the offending source line
pub fn format_parse_error(error: &ParseError, source: &str) -> String {
    let mut output = String::new();

    let title = match error.kind {
        ParseErrorKind::Syntax => "Syntax error:",
        ParseErrorKind::Attribute => "Attribute error:",
        ParseErrorKind::Structure => "Structure error:",
        ParseErrorKind::TargetResolution => "Unresolved target:",
    };
    output.push_str(&format!("{} {}\n", title.red().bold(), error.reason));

    if let Some(span) = error.span {
        push_snippet(&mut output, source, span);
    }

    if let Some(node) = error.node {
        output.push_str(&format!("  {} {}", "Node:".green().bold(), node));
        if let Some(attribute) = &error.attribute {
            output.push_str(&format!(" ({} '{}')", "attribute".dimmed(), attribute));
        }
        output.push('\n');
    }

    output.push_str(&get_error_hint(error));
    output
}

/// Format a render error, with source context when a span is known
pub fn format_render_error(error: &RenderError, source: &str) -> String {
    if let RenderError::Parse(parse) = error {
        return format_parse_error(parse, source);
    }

    let mut output = format!("{} {}\n", "Render error:".red().bold(), error);
    if let Some(span) = error.span() {
        push_snippet(&mut output, source, span);
    }
    output
}

fn push_snippet(output: &mut String, source: &str, span: SourceSpan) {
    let (line, col) = (span.line, span.column.max(1));

    output.push_str(&format!(
        "  {} {}:{}\n",
        "-->".blue().bold(),
        "input".dimmed(),
        format!("{}:{}", line, col).cyan()
    ));

    let lines: Vec<&str> = source.lines().collect();
    if line == 0 || line > lines.len() {
        return;
    }
    let line_idx = line - 1;

    output.push_str(&format!("   {}\n", "|".blue()));

    if line_idx > 0 {
        output.push_str(&format!(
            " {} | {}\n",
            format!("{:3}", line - 1).blue().dimmed(),
            lines[line_idx - 1].dimmed()
        ));
    }

    output.push_str(&format!(
        " {} | {}\n",
        format!("{:3}", line).blue().bold(),
        lines[line_idx]
    ));

    let indicator = format!("{}^", " ".repeat(col - 1 + 7));
    output.push_str(&format!("   {} {}\n", "|".blue(), indicator.red().bold()));

    if line_idx + 1 < lines.len() {
        output.push_str(&format!(
            " {} | {}\n",
            format!("{:3}", line + 1).blue().dimmed(),
            lines[line_idx + 1].dimmed()
        ));
    }

    output.push_str(&format!("   {}\n", "|".blue()));
}

/// Get a helpful hint based on the error
fn get_error_hint(error: &ParseError) -> String {
    let hint = match (error.kind, error.node) {
        (ParseErrorKind::Syntax, _) if error.reason.starts_with("mismatched closing tag") => {
            "Every opened tag must be closed in reverse order"
        }
        (ParseErrorKind::Syntax, _) if error.reason.starts_with("unknown language tag") => {
            "Tags with the 'q:' prefix are reserved for the language"
        }
        (ParseErrorKind::Attribute, Some(NodeKind::Invoke | NodeKind::Fetch))
            if error.reason.contains("target") =>
        {
            "Name exactly one of function, component, url, endpoint or service"
        }
        (ParseErrorKind::Structure, Some(NodeKind::ElseIf | NodeKind::Else)) => {
            "ElseIf and Else must be the last children of an If"
        }
        (ParseErrorKind::TargetResolution, _) => {
            "Functions and components must be declared in the same document"
        }
        _ => return String::new(),
    };
    format!("\n  {} {}\n", "Hint:".yellow().bold(), hint)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(line: usize, column: usize) -> SourceSpan {
        SourceSpan {
            line,
            column,
            offset: 0,
            length: 1,
        }
    }

    #[test]
    fn test_missing_attribute_reason() {
        let err = ParseError::missing_attribute(NodeKind::Field, "xpath", span(1, 1));
        assert_eq!(err.to_string(), "Field requires 'xpath' attribute");
        assert_eq!(err.kind, ParseErrorKind::Attribute);
        assert_eq!(err.attribute.as_deref(), Some("xpath"));
    }

    #[test]
    fn test_format_parse_error_shows_line() {
        colored::control::set_override(false);
        let source = "<p>\n<q:dump>x</q:dump>\n</p>";
        let err = ParseError::structure(NodeKind::Dump, "Dump must be self-closing", span(2, 1));
        let formatted = format_parse_error(&err, source);
        assert!(formatted.contains("Structure error: Dump must be self-closing"));
        assert!(formatted.contains("  2 | <q:dump>x</q:dump>"));
        assert!(formatted.contains("input:2:1"));
    }

    #[test]
    fn test_render_error_span() {
        let err = RenderError::eval(EvalError::DivisionByZero, span(3, 4));
        assert_eq!(err.span(), Some(span(3, 4)));
        assert_eq!(err.to_string(), "division by zero (at 3:4)");
        assert_eq!(RenderError::Cancelled.span(), None);
    }
}
