//! Parser for Tessera markup
//!
//! The pest grammar in `markup.pest` tokenizes the source into tags, text
//! and comments. [`TreeBuilder`] nests them, checks that closing tags match
//! and validates every node as soon as its children are known, so a
//! [`Document`] that comes out of [`parse`] is structurally sound: every
//! attribute and text template parses, every language node carries what its
//! kind requires, and every local invocation target exists.

use crate::ast::{Attribute, Attributes, Document, Node, NodeKind, SourceSpan, LANGUAGE_PREFIX};
use crate::directives;
use crate::error::{ParseError, ParseErrorKind};
use pest::error::{Error as PestError, LineColLocation};
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use std::collections::HashSet;

#[derive(Parser)]
#[grammar = "markup.pest"]
pub struct MarkupParser;

/// Parse and validate a document
pub fn parse(source: &str) -> Result<Document, ParseError> {
    let mut pairs = MarkupParser::parse(Rule::document, source).map_err(syntax_error)?;
    let mut builder = TreeBuilder::default();

    if let Some(document) = pairs.next() {
        for pair in document.into_inner() {
            match pair.as_rule() {
                Rule::open_tag => builder.open(pair)?,
                Rule::close_tag => builder.close(pair)?,
                Rule::text => builder.text(pair)?,
                Rule::declaration => {
                    let span = span_of(&pair);
                    builder.attach(Node::text(pair.as_str(), span))?;
                }
                _ => {}
            }
        }
    }

    let document = builder.finish()?;
    check_document(&document)?;
    Ok(document)
}

fn span_of(pair: &Pair<'_, Rule>) -> SourceSpan {
    let (line, column) = pair.line_col();
    let span = pair.as_span();
    SourceSpan {
        line,
        column,
        offset: span.start(),
        length: span.end() - span.start(),
    }
}

fn syntax_error(error: PestError<Rule>) -> ParseError {
    let (line, column) = match error.line_col {
        LineColLocation::Pos((line, col)) => (line, col),
        LineColLocation::Span((line, col), _) => (line, col),
    };
    let offset = match error.location {
        pest::error::InputLocation::Pos(pos) => pos,
        pest::error::InputLocation::Span((start, _)) => start,
    };
    let error = error.renamed_rules(format_rule_name);
    ParseError::syntax(
        format!("malformed markup: {}", error.variant.message()),
        SourceSpan {
            line,
            column,
            offset,
            length: 1,
        },
    )
}

/// Format a rule name to be more user-friendly
fn format_rule_name(rule: &Rule) -> String {
    match rule {
        Rule::EOI => "end of input".to_string(),
        Rule::open_tag => "tag".to_string(),
        Rule::close_tag => "closing tag".to_string(),
        Rule::tag_name => "tag name".to_string(),
        Rule::attribute | Rule::attr_name => "attribute".to_string(),
        Rule::attr_value => "quoted attribute value".to_string(),
        Rule::self_close => "'/>'".to_string(),
        Rule::text => "text".to_string(),
        Rule::comment => "comment".to_string(),
        _ => format!("{:?}", rule).to_lowercase(),
    }
}

/// Decode the entities allowed inside attribute values
fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    raw.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Nests tag tokens into a tree and validates nodes as they close
#[derive(Default)]
pub struct TreeBuilder {
    stack: Vec<Node>,
    roots: Vec<Node>,
}

impl TreeBuilder {
    fn open(&mut self, pair: Pair<'_, Rule>) -> Result<(), ParseError> {
        let span = span_of(&pair);
        let mut inner = pair.into_inner();
        let tag = inner.next().map(|p| p.as_str().to_string()).unwrap_or_default();

        let kind = match strip_language_prefix(&tag) {
            Some(local) => NodeKind::from_tag(local).ok_or_else(|| {
                ParseError::syntax(format!("unknown language tag '<{}>'", tag), span)
            })?,
            None => NodeKind::Element,
        };

        let mut attributes = Attributes::new();
        let mut self_closing = false;
        for part in inner {
            match part.as_rule() {
                Rule::attribute => {
                    let attr_span = span_of(&part);
                    let mut fields = part.into_inner();
                    let name = fields.next().map(|p| p.as_str().to_string()).unwrap_or_default();
                    let value = fields
                        .next()
                        .and_then(|v| v.into_inner().next())
                        .map(|v| decode_entities(v.as_str()))
                        .unwrap_or_default();
                    if attributes.contains(&name) {
                        return Err(ParseError::attribute(
                            kind,
                            &name,
                            format!("duplicate attribute '{}'", name),
                            attr_span,
                        ));
                    }
                    attributes.push(Attribute {
                        name,
                        value,
                        span: attr_span,
                    });
                }
                Rule::self_close => self_closing = true,
                _ => {}
            }
        }

        let node = Node {
            kind,
            tag,
            attributes,
            children: Vec::new(),
            text: None,
            self_closing,
            span,
        };

        if self_closing {
            self.attach(node)
        } else {
            self.stack.push(node);
            Ok(())
        }
    }

    fn close(&mut self, pair: Pair<'_, Rule>) -> Result<(), ParseError> {
        let span = span_of(&pair);
        let tag = pair
            .into_inner()
            .next()
            .map(|p| p.as_str().to_string())
            .unwrap_or_default();

        let Some(node) = self.stack.pop() else {
            return Err(ParseError::syntax(
                format!("unexpected closing tag '</{}>'", tag),
                span,
            ));
        };
        if !node.tag.eq_ignore_ascii_case(&tag) {
            return Err(ParseError::syntax(
                format!(
                    "mismatched closing tag '</{}>', expected '</{}>'",
                    tag, node.tag
                ),
                span,
            ));
        }
        self.attach(node)
    }

    fn text(&mut self, pair: Pair<'_, Rule>) -> Result<(), ParseError> {
        let raw = pair.as_str();
        if raw.trim().is_empty() {
            return Ok(());
        }
        let span = span_of(&pair);
        self.attach(Node::text(raw, span))
    }

    /// Validate a complete node and hand it to its parent
    fn attach(&mut self, node: Node) -> Result<(), ParseError> {
        let parent = self.stack.last().map(|n| n.kind);
        check_placement(&node, parent, &self.stack)?;

        if node.kind.is_self_closing() && !node.children.is_empty() {
            return Err(ParseError::structure(
                node.kind,
                format!("{} must be self-closing", node.kind),
                node.span,
            ));
        }
        // Statements and inline data are raw text, never templates
        let raw_text = node.kind == NodeKind::Text
            && matches!(parent, Some(NodeKind::Query | NodeKind::Data));
        if !raw_text {
            directives::validate(&node)?;
        }

        match self.stack.last_mut() {
            Some(parent) => parent.children.push(node),
            None => self.roots.push(node),
        }
        Ok(())
    }

    fn finish(self) -> Result<Document, ParseError> {
        if let Some(open) = self.stack.last() {
            return Err(ParseError::syntax(
                format!("unclosed tag '<{}>'", open.tag),
                open.span,
            ));
        }
        Ok(Document { nodes: self.roots })
    }
}

fn strip_language_prefix(tag: &str) -> Option<&str> {
    let prefix_len = LANGUAGE_PREFIX.len();
    if tag.len() > prefix_len && tag[..prefix_len].eq_ignore_ascii_case(LANGUAGE_PREFIX) {
        Some(&tag[prefix_len..])
    } else {
        None
    }
}

fn check_placement(node: &Node, parent: Option<NodeKind>, ancestors: &[Node]) -> Result<(), ParseError> {
    let misplaced = |reason: &str| Err(ParseError::structure(node.kind, reason, node.span));

    match node.kind {
        NodeKind::ElseIf | NodeKind::Else if parent != Some(NodeKind::If) => {
            misplaced(&format!("{} must be inside an If", node.kind))
        }
        NodeKind::Param
            if !matches!(parent, Some(NodeKind::Function | NodeKind::Component))
                && !parent.is_some_and(NodeKind::is_operation) =>
        {
            misplaced("Param must be inside a Function, Component or operation")
        }
        NodeKind::Header if !matches!(parent, Some(NodeKind::Fetch | NodeKind::Invoke)) => {
            misplaced("Header must be inside a Fetch or Invoke")
        }
        NodeKind::Transform | NodeKind::Field if parent != Some(NodeKind::Data) => {
            misplaced(&format!("{} must be inside a Data", node.kind))
        }
        NodeKind::Filter | NodeKind::Sort | NodeKind::Limit | NodeKind::Compute
            if parent != Some(NodeKind::Transform) =>
        {
            misplaced(&format!("{} must be inside a Transform", node.kind))
        }
        NodeKind::Message if parent != Some(NodeKind::Llm) => {
            misplaced("Message must be inside an Llm")
        }
        NodeKind::Function if !matches!(parent, None | Some(NodeKind::Component)) => {
            misplaced("Function must be declared at top level or directly inside a Component")
        }
        NodeKind::Component if parent.is_some() => {
            misplaced("Component must be declared at top level")
        }
        NodeKind::Return
            if !ancestors
                .iter()
                .any(|a| matches!(a.kind, NodeKind::Function | NodeKind::Component)) =>
        {
            misplaced("Return must be inside a Function or Component")
        }
        _ => Ok(()),
    }
}

/// Document-wide checks: unique callable names and resolvable targets
fn check_document(document: &Document) -> Result<(), ParseError> {
    let mut components = HashSet::new();
    for component in document.components() {
        let name = component.attr("name").unwrap_or_default().to_string();
        if !components.insert(name.clone()) {
            return Err(ParseError::attribute(
                NodeKind::Component,
                "name",
                format!("duplicate component '{}'", name),
                component.attr_span("name"),
            ));
        }
    }

    let mut functions = HashSet::new();
    for function in document.functions() {
        let name = function.attr("name").unwrap_or_default().to_string();
        if !functions.insert(name.clone()) {
            return Err(ParseError::attribute(
                NodeKind::Function,
                "name",
                format!("duplicate function '{}'", name),
                function.attr_span("name"),
            ));
        }
    }

    let mut pending: Vec<&Node> = document.nodes.iter().collect();
    while let Some(node) = pending.pop() {
        if node.kind == NodeKind::Invoke {
            if let Some(name) = node.attr("function") {
                if !functions.contains(name) {
                    return Err(ParseError::target(
                        NodeKind::Invoke,
                        "function",
                        format!("Unknown function '{}'", name),
                        node.attr_span("function"),
                    ));
                }
            }
            if let Some(name) = node.attr("component") {
                if !components.contains(name) {
                    return Err(ParseError::target(
                        NodeKind::Invoke,
                        "component",
                        format!("Unknown component '{}'", name),
                        node.attr_span("component"),
                    ));
                }
            }
        }
        pending.extend(node.children.iter());
    }

    Ok(())
}

/// True when the error came from the tag grammar rather than validation
pub fn is_syntax_error(error: &ParseError) -> bool {
    error.kind == ParseErrorKind::Syntax
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_nested_tree() {
        let doc = parse(
            r#"<div class="box">
                 <q:set name="count" value="1"/>
                 <p>Count: {count}</p>
               </div>"#,
        )
        .unwrap();
        assert_eq!(doc.nodes.len(), 1);
        let div = &doc.nodes[0];
        assert_eq!(div.kind, NodeKind::Element);
        assert_eq!(div.attr("class"), Some("box"));
        assert_eq!(div.children.len(), 2);
        assert_eq!(div.children[0].kind, NodeKind::Set);
        assert!(div.children[0].self_closing);
        assert_eq!(div.children[1].children[0].text.as_deref(), Some("Count: {count}"));
    }

    #[test]
    fn test_spans_and_comments() {
        let doc = parse("<!-- note -->\n<q:set name=\"a\" value=\"1\"/>").unwrap();
        assert_eq!(doc.nodes.len(), 1);
        assert_eq!(doc.nodes[0].span.line, 2);
        assert_eq!(doc.nodes[0].span.column, 1);
        assert_eq!(doc.nodes[0].attr_span("value").column, 17);
    }

    #[test]
    fn test_entities_and_single_quotes() {
        let doc = parse(r#"<q:set name='msg' value="&quot;hi&quot; &amp; bye"/>"#).unwrap();
        assert_eq!(doc.nodes[0].attr("value"), Some("\"hi\" & bye"));
    }

    #[test]
    fn test_language_tags_are_case_insensitive() {
        let doc = parse(r#"<Q:SET name="a" value="1"/>"#).unwrap();
        assert_eq!(doc.nodes[0].kind, NodeKind::Set);
    }

    #[test]
    fn test_mismatched_and_unclosed_tags() {
        let err = parse("<div><p></div>").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::Syntax);
        assert_eq!(err.reason, "mismatched closing tag '</div>', expected '</p>'");

        let err = parse("<div>").unwrap_err();
        assert_eq!(err.reason, "unclosed tag '<div>'");

        let err = parse("</div>").unwrap_err();
        assert_eq!(err.reason, "unexpected closing tag '</div>'");
    }

    #[test]
    fn test_unknown_language_tag() {
        let err = parse("<q:frobnicate/>").unwrap_err();
        assert_eq!(err.reason, "unknown language tag '<q:frobnicate>'");
    }

    #[test]
    fn test_self_closing_kinds_reject_children() {
        let err = parse(r#"<q:dump var="x">text</q:dump>"#).unwrap_err();
        assert_eq!(err.reason, "Dump must be self-closing");
        assert_eq!(err.node, Some(NodeKind::Dump));
    }

    #[test]
    fn test_placement_rules() {
        let err = parse(r#"<q:else/>"#).unwrap_err();
        assert_eq!(err.reason, "Else must be inside an If");
        assert_eq!(err.kind, ParseErrorKind::Structure);

        let err = parse(r#"<q:header name="a" value="b"/>"#).unwrap_err();
        assert_eq!(err.reason, "Header must be inside a Fetch or Invoke");

        let err = parse(r#"<q:return value="1"/>"#).unwrap_err();
        assert_eq!(err.reason, "Return must be inside a Function or Component");
    }

    #[test]
    fn test_unknown_invoke_target() {
        let err = parse(r#"<q:invoke name="r" function="missing"/>"#).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::TargetResolution);
        assert_eq!(err.reason, "Unknown function 'missing'");
    }

    #[test]
    fn test_whitespace_text_is_dropped() {
        let doc = parse("<ul>\n  <li>a</li>\n  <li>b</li>\n</ul>").unwrap();
        assert_eq!(doc.nodes[0].children.len(), 2);
    }

    #[test]
    fn test_doctype_is_kept_verbatim() {
        let doc = parse("<!DOCTYPE html><p>x</p>").unwrap();
        assert_eq!(doc.nodes[0].text.as_deref(), Some("<!DOCTYPE html>"));
    }

    #[test]
    fn test_malformed_markup() {
        let err = parse(r#"<p class=unquoted>x</p>"#).unwrap_err();
        assert!(is_syntax_error(&err));
        assert!(err.reason.starts_with("malformed markup"));
    }
}
