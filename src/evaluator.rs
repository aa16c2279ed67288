//! Evaluator for embedded expressions
//!
//! Resolves names through a [`Resolver`] (normally the render's
//! [`ExecutionContext`](crate::context::ExecutionContext)). An undefined name
//! is a value, not an error: arithmetic, concatenation, ordering, member
//! access, indexing and builtin calls on `undefined` yield `undefined`.
//! Logical operators and ternary conditions use truthiness.

use crate::ast::{BinaryOperator, Expression, Template, TemplatePart, UnaryOperator};
use crate::error::EvalError;
use crate::functions;
use crate::token_parser::{parse_expression, parse_template};
use crate::types::{Number, Value};
use std::collections::BTreeMap;
use std::collections::HashMap;

/// Name lookup used by the evaluator
pub trait Resolver {
    fn resolve(&self, name: &str) -> Value;
}

impl Resolver for HashMap<String, Value> {
    fn resolve(&self, name: &str) -> Value {
        self.get(name).cloned().unwrap_or_default()
    }
}

impl Resolver for BTreeMap<String, Value> {
    fn resolve(&self, name: &str) -> Value {
        self.get(name).cloned().unwrap_or_default()
    }
}

/// Evaluator bound to one resolver
pub struct Evaluator<'a> {
    scope: &'a dyn Resolver,
}

impl<'a> Evaluator<'a> {
    pub fn new(scope: &'a dyn Resolver) -> Self {
        Self { scope }
    }

    /// Evaluate an expression
    pub fn evaluate(&self, expr: &Expression) -> Result<Value, EvalError> {
        match expr {
            Expression::Literal(value) => Ok(value.clone()),
            Expression::Variable(name) => Ok(self.scope.resolve(name)),
            Expression::Member { object, field } => Ok(self.evaluate(object)?.member(field)),
            Expression::Index { object, index } => {
                let object = self.evaluate(object)?;
                let index = self.evaluate(index)?;
                if index.is_undefined() {
                    return Ok(Value::Undefined);
                }
                Ok(object.index(&index))
            }
            Expression::Call { name, args } => self.call(name, args),
            Expression::Unary { op, operand } => {
                let value = self.evaluate(operand)?;
                unary(*op, value)
            }
            Expression::Binary { op, left, right } => self.binary(*op, left, right),
            Expression::Ternary {
                condition,
                then_expr,
                else_expr,
            } => {
                if self.evaluate(condition)?.is_truthy() {
                    self.evaluate(then_expr)
                } else {
                    self.evaluate(else_expr)
                }
            }
            Expression::Array(items) => items
                .iter()
                .map(|item| self.evaluate(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
        }
    }

    /// Render a template to text; undefined renders as nothing
    pub fn render(&self, template: &Template) -> Result<String, EvalError> {
        let mut out = String::new();
        self.render_into(template, &mut out)?;
        Ok(out)
    }

    /// Render a template, appending to `out`
    pub fn render_into(&self, template: &Template, out: &mut String) -> Result<(), EvalError> {
        for part in &template.parts {
            match part {
                TemplatePart::Literal(text) => out.push_str(text),
                TemplatePart::Expr(expr) => {
                    let value = self.evaluate(expr)?;
                    if !value.is_undefined() {
                        out.push_str(&value.to_string());
                    }
                }
            }
        }
        Ok(())
    }

    /// Typed value of a template: a lone `{expr}` keeps its type,
    /// anything else becomes a string
    pub fn value_of(&self, template: &Template) -> Result<Value, EvalError> {
        match template.single_expression() {
            Some(expr) => self.evaluate(expr),
            None => self.render(template).map(Value::String),
        }
    }

    fn call(&self, name: &str, args: &[Expression]) -> Result<Value, EvalError> {
        if !functions::is_builtin(name) {
            return Err(EvalError::UnknownFunction(name.to_string()));
        }
        let values = args
            .iter()
            .map(|arg| self.evaluate(arg))
            .collect::<Result<Vec<_>, _>>()?;
        if !functions::accepts_undefined(name) && values.iter().any(Value::is_undefined) {
            return Ok(Value::Undefined);
        }
        functions::call_builtin(name, &values)
            .map_err(|e| EvalError::function(name, e.to_string()))
    }

    fn binary(
        &self,
        op: BinaryOperator,
        left: &Expression,
        right: &Expression,
    ) -> Result<Value, EvalError> {
        // Short-circuit logical operators
        match op {
            BinaryOperator::And => {
                let left = self.evaluate(left)?;
                if !left.is_truthy() {
                    return Ok(Value::Boolean(false));
                }
                return Ok(Value::Boolean(self.evaluate(right)?.is_truthy()));
            }
            BinaryOperator::Or => {
                let left = self.evaluate(left)?;
                if left.is_truthy() {
                    return Ok(Value::Boolean(true));
                }
                return Ok(Value::Boolean(self.evaluate(right)?.is_truthy()));
            }
            _ => {}
        }

        let left = self.evaluate(left)?;
        let right = self.evaluate(right)?;
        apply_binary(op, left, right)
    }
}

/// Apply a non-logical binary operator to two evaluated operands
pub fn apply_binary(op: BinaryOperator, left: Value, right: Value) -> Result<Value, EvalError> {
    match op {
        BinaryOperator::Equal => return Ok(Value::Boolean(left.loose_eq(&right))),
        BinaryOperator::NotEqual => return Ok(Value::Boolean(!left.loose_eq(&right))),
        BinaryOperator::And => return Ok(Value::Boolean(left.is_truthy() && right.is_truthy())),
        BinaryOperator::Or => return Ok(Value::Boolean(left.is_truthy() || right.is_truthy())),
        _ => {}
    }

    if left.is_undefined() || right.is_undefined() {
        return Ok(Value::Undefined);
    }

    match op {
        BinaryOperator::Concat => Ok(Value::String(format!("{}{}", left, right))),
        BinaryOperator::LessThan
        | BinaryOperator::LessThanOrEqual
        | BinaryOperator::GreaterThan
        | BinaryOperator::GreaterThanOrEqual => {
            let ordering = left.compare(&right).ok_or_else(|| {
                EvalError::Type(format!(
                    "cannot compare {} with {}",
                    left.type_name(),
                    right.type_name()
                ))
            })?;
            let result = match op {
                BinaryOperator::LessThan => ordering.is_lt(),
                BinaryOperator::LessThanOrEqual => ordering.is_le(),
                BinaryOperator::GreaterThan => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            Ok(Value::Boolean(result))
        }
        BinaryOperator::Add => match (left.as_number(), right.as_number()) {
            (Some(a), Some(b)) => Ok(arithmetic(op, a, b)?.into_value()),
            _ if matches!(left, Value::String(_)) || matches!(right, Value::String(_)) => {
                Ok(Value::String(format!("{}{}", left, right)))
            }
            _ => Err(operand_error(op, &left, &right)),
        },
        _ => match (left.as_number(), right.as_number()) {
            (Some(a), Some(b)) => Ok(arithmetic(op, a, b)?.into_value()),
            _ => Err(operand_error(op, &left, &right)),
        },
    }
}

fn operand_error(op: BinaryOperator, left: &Value, right: &Value) -> EvalError {
    EvalError::Type(format!(
        "cannot apply '{}' to {} and {}",
        op.symbol(),
        left.type_name(),
        right.type_name()
    ))
}

/// Numeric arithmetic; integer overflow promotes to decimal
fn arithmetic(op: BinaryOperator, a: Number, b: Number) -> Result<Number, EvalError> {
    if let (Number::Integer(x), Number::Integer(y)) = (a, b) {
        let exact = match op {
            BinaryOperator::Add => x.checked_add(y),
            BinaryOperator::Subtract => x.checked_sub(y),
            BinaryOperator::Multiply => x.checked_mul(y),
            BinaryOperator::Divide => {
                if y == 0 {
                    return Err(EvalError::DivisionByZero);
                }
                match x.checked_rem(y) {
                    Some(0) => x.checked_div(y),
                    _ => None,
                }
            }
            BinaryOperator::Modulo => {
                if y == 0 {
                    return Err(EvalError::DivisionByZero);
                }
                x.checked_rem(y)
            }
            _ => None,
        };
        if let Some(result) = exact {
            return Ok(Number::Integer(result));
        }
    }

    let (x, y) = (a.as_f64(), b.as_f64());
    let result = match op {
        BinaryOperator::Add => x + y,
        BinaryOperator::Subtract => x - y,
        BinaryOperator::Multiply => x * y,
        BinaryOperator::Divide | BinaryOperator::Modulo if y == 0.0 => {
            return Err(EvalError::DivisionByZero)
        }
        BinaryOperator::Divide => x / y,
        BinaryOperator::Modulo => x % y,
        other => {
            return Err(EvalError::Type(format!(
                "'{}' is not an arithmetic operator",
                other.symbol()
            )))
        }
    };
    Ok(Number::Decimal(result))
}

fn unary(op: UnaryOperator, value: Value) -> Result<Value, EvalError> {
    match op {
        UnaryOperator::Not => Ok(Value::Boolean(!value.is_truthy())),
        UnaryOperator::Negate => {
            if value.is_undefined() {
                return Ok(Value::Undefined);
            }
            match value.as_number() {
                Some(Number::Integer(i)) => Ok(i
                    .checked_neg()
                    .map(Value::Integer)
                    .unwrap_or(Value::Decimal(-(i as f64)))),
                Some(Number::Decimal(d)) => Ok(Value::Decimal(-d)),
                None => Err(EvalError::Type(format!(
                    "cannot negate {}",
                    value.type_name()
                ))),
            }
        }
    }
}

/// Parse and evaluate expression text
pub fn evaluate(text: &str, scope: &dyn Resolver) -> Result<Value, EvalError> {
    let expr = parse_expression(text)?;
    Evaluator::new(scope).evaluate(&expr)
}

/// Parse and render a raw templated value
pub fn interpolate(raw: &str, scope: &dyn Resolver) -> Result<String, EvalError> {
    let template = parse_template(raw)?;
    Evaluator::new(scope).render(&template)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> HashMap<String, Value> {
        let mut vars = HashMap::new();
        vars.insert("count".to_string(), Value::Integer(5));
        vars.insert("name".to_string(), Value::from("Ada"));
        vars.insert("price".to_string(), Value::from("2.5"));
        vars.insert(
            "items".to_string(),
            Value::Array(vec![Value::Integer(10), Value::Integer(20)]),
        );
        let mut user = BTreeMap::new();
        user.insert("role".to_string(), Value::from("admin"));
        vars.insert("user".to_string(), Value::Object(user));
        vars
    }

    fn eval(text: &str) -> Value {
        evaluate(text, &scope()).unwrap()
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("count + 1"), Value::Integer(6));
        assert_eq!(eval("count * price"), Value::Decimal(12.5));
        assert_eq!(eval("10 / 4"), Value::Decimal(2.5));
        assert_eq!(eval("10 / 5"), Value::Integer(2));
        assert_eq!(eval("7 % 3"), Value::Integer(1));
        assert_eq!(eval("-count"), Value::Integer(-5));
    }

    #[test]
    fn test_overflow_promotes_to_decimal() {
        assert_eq!(
            eval("9223372036854775807 + 1"),
            Value::Decimal(9223372036854775808.0)
        );
    }

    #[test]
    fn test_plus_concatenates_non_numeric_strings() {
        assert_eq!(eval("'Hi ' + name"), Value::from("Hi Ada"));
        assert_eq!(eval("'1' + 2"), Value::Integer(3));
        assert_eq!(eval("name & count"), Value::from("Ada5"));
    }

    #[test]
    fn test_undefined_propagates() {
        assert_eq!(eval("missing + 1"), Value::Undefined);
        assert_eq!(eval("missing.field"), Value::Undefined);
        assert_eq!(eval("missing[0]"), Value::Undefined);
        assert_eq!(eval("upper(missing)"), Value::Undefined);
        assert_eq!(eval("missing > 1"), Value::Undefined);
        assert_eq!(eval("missing & 'x'"), Value::Undefined);
        assert_eq!(eval("missing == null"), Value::Boolean(true));
        assert_eq!(eval("isdefined(missing)"), Value::Boolean(false));
    }

    #[test]
    fn test_logical_operators_use_truthiness() {
        assert_eq!(eval("missing OR count > 3"), Value::Boolean(true));
        assert_eq!(eval("missing && true"), Value::Boolean(false));
        assert_eq!(eval("NOT missing"), Value::Boolean(true));
        assert_eq!(eval("count > 3 ? 'big' : 'small'"), Value::from("big"));
    }

    #[test]
    fn test_member_and_index() {
        assert_eq!(eval("user.role"), Value::from("admin"));
        assert_eq!(eval("items[1]"), Value::Integer(20));
        assert_eq!(eval("items.length"), Value::Integer(2));
        assert_eq!(eval("user['role']"), Value::from("admin"));
    }

    #[test]
    fn test_errors() {
        let scope = scope();
        assert_eq!(evaluate("1 / 0", &scope), Err(EvalError::DivisionByZero));
        assert!(matches!(
            evaluate("nope(1)", &scope),
            Err(EvalError::UnknownFunction(name)) if name == "nope"
        ));
        assert!(matches!(evaluate("items - 1", &scope), Err(EvalError::Type(_))));
        assert!(matches!(evaluate("1 +", &scope), Err(EvalError::Syntax(_))));
    }

    #[test]
    fn test_templates() {
        let scope = scope();
        assert_eq!(
            interpolate("Hello {name}, you have {count + 1} items{missing}", &scope).unwrap(),
            "Hello Ada, you have 6 items"
        );

        let template = parse_template("{items}").unwrap();
        assert_eq!(
            Evaluator::new(&scope).value_of(&template).unwrap(),
            Value::Array(vec![Value::Integer(10), Value::Integer(20)])
        );
        let template = parse_template("n={count}").unwrap();
        assert_eq!(
            Evaluator::new(&scope).value_of(&template).unwrap(),
            Value::from("n=5")
        );
    }
}
