//! Row transform pipeline for Data operations
//!
//! Steps run in declaration order; each consumes the rows produced by the
//! previous one. Step expressions see only the fields of the current row.

use crate::ast::{Expression, Node, NodeKind};
use crate::directives::{identifier_attr, required_attr, required_expression, uint_attr};
use crate::error::{EvalError, ParseError};
use crate::evaluator::Evaluator;
use crate::types::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum TransformStep {
    Filter { condition: Expression },
    Sort { by: String, descending: bool },
    Limit { value: usize, offset: usize },
    Compute { field: String, expression: Expression },
}

impl TransformStep {
    pub fn from_node(node: &Node) -> Result<Self, ParseError> {
        match node.kind {
            NodeKind::Filter => Ok(TransformStep::Filter {
                condition: required_expression(node, "condition")?,
            }),
            NodeKind::Sort => {
                let by = required_attr(node, "by")?.to_string();
                let descending = match node.attr("order").map(|o| o.trim().to_ascii_lowercase()) {
                    None => false,
                    Some(order) if order == "asc" => false,
                    Some(order) if order == "desc" => true,
                    Some(order) => {
                        return Err(ParseError::attribute(
                            NodeKind::Sort,
                            "order",
                            format!("Sort order must be 'asc' or 'desc', got '{}'", order),
                            node.attr_span("order"),
                        ))
                    }
                };
                Ok(TransformStep::Sort { by, descending })
            }
            NodeKind::Limit => {
                let value = uint_attr(node, "value")?
                    .ok_or_else(|| ParseError::missing_attribute(NodeKind::Limit, "value", node.span))?;
                Ok(TransformStep::Limit {
                    value: value as usize,
                    offset: uint_attr(node, "offset")?.unwrap_or(0) as usize,
                })
            }
            NodeKind::Compute => Ok(TransformStep::Compute {
                field: identifier_attr(node, "field")?,
                expression: required_expression(node, "expression")?,
            }),
            other => Err(ParseError::structure(
                other,
                format!("{} is not a transform step", other),
                node.span,
            )),
        }
    }
}

/// Steps declared under a node's `<q:transform>` children
pub fn steps_of(node: &Node) -> Result<Vec<TransformStep>, ParseError> {
    node.children_of(NodeKind::Transform)
        .flat_map(|t| t.children.iter())
        .map(TransformStep::from_node)
        .collect()
}

fn row_scope(row: &Value) -> BTreeMap<String, Value> {
    match row {
        Value::Object(fields) => fields.clone(),
        other => BTreeMap::from([("value".to_string(), other.clone())]),
    }
}

/// Run the pipeline over a set of rows
pub fn apply(steps: &[TransformStep], mut rows: Vec<Value>) -> Result<Vec<Value>, EvalError> {
    for step in steps {
        rows = match step {
            TransformStep::Filter { condition } => {
                let mut kept = Vec::with_capacity(rows.len());
                for row in rows {
                    let scope = row_scope(&row);
                    if Evaluator::new(&scope).evaluate(condition)?.is_truthy() {
                        kept.push(row);
                    }
                }
                kept
            }
            TransformStep::Sort { by, descending } => {
                rows.sort_by(|a, b| {
                    let order = compare_keys(&a.member(by), &b.member(by));
                    if *descending {
                        order.reverse()
                    } else {
                        order
                    }
                });
                rows
            }
            TransformStep::Limit { value, offset } => {
                rows.into_iter().skip(*offset).take(*value).collect()
            }
            TransformStep::Compute { field, expression } => {
                let mut computed = Vec::with_capacity(rows.len());
                for row in rows {
                    let mut scope = row_scope(&row);
                    let value = Evaluator::new(&scope).evaluate(expression)?;
                    scope.insert(field.clone(), value);
                    computed.push(Value::Object(scope));
                }
                computed
            }
        };
    }
    Ok(rows)
}

/// Absent keys sort after present ones
fn compare_keys(a: &Value, b: &Value) -> Ordering {
    match (a.is_absent(), b.is_absent()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.compare(b).unwrap_or(Ordering::Equal),
    }
}
