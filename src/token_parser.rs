//! Token-based parser for embedded expressions and templates
//!
//! Recursive descent over the lexer's token stream. Precedence, loosest
//! first: ternary, `OR`, `AND`, equality, comparison, `&` concatenation,
//! `+ -`, `* / %`, unary, postfix (member, index, call).
//!
//! [`parse_template`] splits a raw attribute or text value into literal
//! segments and `{expr}` segments; `{{` and `}}` stand for literal braces.

use crate::ast::{BinaryOperator, Expression, Template, TemplatePart, UnaryOperator};
use crate::error::ExpressionError;
use crate::lexer::{Token, TokenKind};
use crate::types::Value;

/// Parser that consumes tokens to produce an expression
pub struct TokenParser {
    tokens: Vec<Token>,
    position: usize,
}

impl TokenParser {
    /// Create a new parser from a token stream
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    /// Parse a complete expression; trailing tokens are an error
    pub fn parse(&mut self) -> Result<Expression, ExpressionError> {
        if self.is_at_end() {
            return Err(self.error("empty expression"));
        }
        let expr = self.parse_expression()?;
        if !self.is_at_end() {
            return Err(self.error(format!("unexpected '{}'", self.current().span.text)));
        }
        Ok(expr)
    }

    fn parse_expression(&mut self) -> Result<Expression, ExpressionError> {
        self.parse_ternary()
    }

    /// Parse ternary expression: expr ? expr : expr
    fn parse_ternary(&mut self) -> Result<Expression, ExpressionError> {
        let condition = self.parse_or()?;

        if self.check(&TokenKind::Question) {
            self.advance();
            let then_expr = self.parse_expression()?;
            self.expect(&TokenKind::Colon, "':'")?;
            let else_expr = self.parse_expression()?;
            return Ok(Expression::Ternary {
                condition: Box::new(condition),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
            });
        }

        Ok(condition)
    }

    /// Parse or expression
    fn parse_or(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.parse_and()?;

        while self.check(&TokenKind::Or) || self.check(&TokenKind::OrOr) {
            self.advance();
            let right = self.parse_and()?;
            left = binary(BinaryOperator::Or, left, right);
        }

        Ok(left)
    }

    /// Parse and expression
    fn parse_and(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.parse_equality()?;

        while self.check(&TokenKind::And) || self.check(&TokenKind::AndAnd) {
            self.advance();
            let right = self.parse_equality()?;
            left = binary(BinaryOperator::And, left, right);
        }

        Ok(left)
    }

    /// Parse equality expression
    fn parse_equality(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.parse_comparison()?;

        loop {
            let op = match self.current().kind {
                TokenKind::EqualEqual => BinaryOperator::Equal,
                TokenKind::NotEqual => BinaryOperator::NotEqual,
                _ => break,
            };
            self.advance();
            let right = self.parse_comparison()?;
            left = binary(op, left, right);
        }

        Ok(left)
    }

    /// Parse comparison expression
    fn parse_comparison(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.parse_concat()?;

        loop {
            let op = match self.current().kind {
                TokenKind::Less => BinaryOperator::LessThan,
                TokenKind::LessEqual => BinaryOperator::LessThanOrEqual,
                TokenKind::Greater => BinaryOperator::GreaterThan,
                TokenKind::GreaterEqual => BinaryOperator::GreaterThanOrEqual,
                _ => break,
            };
            self.advance();
            let right = self.parse_concat()?;
            left = binary(op, left, right);
        }

        Ok(left)
    }

    /// Parse string concatenation
    fn parse_concat(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.parse_addition()?;

        while self.check(&TokenKind::Ampersand) {
            self.advance();
            let right = self.parse_addition()?;
            left = binary(BinaryOperator::Concat, left, right);
        }

        Ok(left)
    }

    /// Parse addition/subtraction
    fn parse_addition(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.parse_multiplication()?;

        loop {
            let op = match self.current().kind {
                TokenKind::Plus => BinaryOperator::Add,
                TokenKind::Minus => BinaryOperator::Subtract,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplication()?;
            left = binary(op, left, right);
        }

        Ok(left)
    }

    /// Parse multiplication/division
    fn parse_multiplication(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match self.current().kind {
                TokenKind::Star => BinaryOperator::Multiply,
                TokenKind::Slash => BinaryOperator::Divide,
                TokenKind::Percent => BinaryOperator::Modulo,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }

        Ok(left)
    }

    /// Parse unary expression
    fn parse_unary(&mut self) -> Result<Expression, ExpressionError> {
        let op = match self.current().kind {
            TokenKind::Minus => UnaryOperator::Negate,
            TokenKind::Not | TokenKind::Bang => UnaryOperator::Not,
            _ => return self.parse_postfix(),
        };
        self.advance();
        let operand = self.parse_unary()?;

        // Fold negative numeric literals
        if op == UnaryOperator::Negate {
            match operand {
                Expression::Literal(Value::Integer(i)) => {
                    return Ok(Expression::Literal(Value::Integer(-i)))
                }
                Expression::Literal(Value::Decimal(d)) => {
                    return Ok(Expression::Literal(Value::Decimal(-d)))
                }
                _ => {}
            }
        }

        Ok(Expression::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    /// Parse postfix expressions (calls, member access, indexing)
    fn parse_postfix(&mut self) -> Result<Expression, ExpressionError> {
        let mut expr = self.parse_primary()?;

        loop {
            match self.current().kind {
                TokenKind::LeftParen => {
                    // Calls only on bare names
                    let Expression::Variable(name) = expr else {
                        return Err(self.error("only named functions can be called"));
                    };
                    self.advance();
                    let args = self.parse_list(&TokenKind::RightParen, "')'")?;
                    expr = Expression::Call { name, args };
                }
                TokenKind::Dot => {
                    self.advance();
                    let field = self.parse_field_name()?;
                    expr = Expression::Member {
                        object: Box::new(expr),
                        field,
                    };
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let index = self.parse_expression()?;
                    self.expect(&TokenKind::RightBracket, "']'")?;
                    expr = Expression::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                _ => break,
            }
        }

        Ok(expr)
    }

    /// Parse a primary expression (literal, variable, group, array)
    fn parse_primary(&mut self) -> Result<Expression, ExpressionError> {
        let token = self.current().clone();
        let expr = match token.kind {
            TokenKind::Integer(i) => Expression::Literal(Value::Integer(i)),
            TokenKind::Decimal(d) => Expression::Literal(Value::Decimal(d)),
            TokenKind::String(s) => Expression::Literal(Value::String(s)),
            TokenKind::True => Expression::Literal(Value::Boolean(true)),
            TokenKind::False => Expression::Literal(Value::Boolean(false)),
            TokenKind::Null => Expression::Literal(Value::Null),
            TokenKind::Identifier(name) => Expression::Variable(name),
            TokenKind::LeftParen => {
                self.advance();
                let inner = self.parse_expression()?;
                self.expect(&TokenKind::RightParen, "')'")?;
                return Ok(inner);
            }
            TokenKind::LeftBracket => {
                self.advance();
                let items = self.parse_list(&TokenKind::RightBracket, "']'")?;
                return Ok(Expression::Array(items));
            }
            TokenKind::Eof => return Err(self.error("unexpected end of expression")),
            _ => return Err(self.error(format!("unexpected '{}'", token.span.text))),
        };
        self.advance();
        Ok(expr)
    }

    /// Comma-separated expressions up to a closing token (consumed)
    fn parse_list(
        &mut self,
        close: &TokenKind,
        close_text: &str,
    ) -> Result<Vec<Expression>, ExpressionError> {
        let mut items = Vec::new();
        if self.check(close) {
            self.advance();
            return Ok(items);
        }
        loop {
            items.push(self.parse_expression()?);
            if self.check(&TokenKind::Comma) {
                self.advance();
                continue;
            }
            self.expect(close, close_text)?;
            return Ok(items);
        }
    }

    /// Field names after `.` may be any word, keywords included
    fn parse_field_name(&mut self) -> Result<String, ExpressionError> {
        let token = self.current();
        let is_word = token
            .span
            .text
            .chars()
            .next()
            .is_some_and(|c| c.is_alphabetic() || c == '_' || c == '$');
        if !is_word {
            return Err(self.error("expected field name after '.'"));
        }
        let name = token.span.text.clone();
        self.advance();
        Ok(name)
    }

    // Helper methods

    fn current(&self) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.position.min(last)]
    }

    fn is_at_end(&self) -> bool {
        matches!(self.current().kind, TokenKind::Eof)
    }

    fn advance(&mut self) {
        if !self.is_at_end() {
            self.position += 1;
        }
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.current().kind) == std::mem::discriminant(kind)
    }

    fn expect(&mut self, kind: &TokenKind, text: &str) -> Result<(), ExpressionError> {
        if self.check(kind) {
            self.advance();
            Ok(())
        } else if self.is_at_end() {
            Err(self.error(format!("expected {} before end of expression", text)))
        } else {
            Err(self.error(format!(
                "expected {}, found '{}'",
                text,
                self.current().span.text
            )))
        }
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::new(message, self.current().span.start.column)
    }
}

fn binary(op: BinaryOperator, left: Expression, right: Expression) -> Expression {
    Expression::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

/// Parse expression text using the token-based parser
pub fn parse_expression(source: &str) -> Result<Expression, ExpressionError> {
    let tokens = crate::lexer::tokenize(source)?;
    TokenParser::new(tokens).parse()
}

/// Split a raw value into literal text and `{expr}` parts
pub fn parse_template(raw: &str) -> Result<Template, ExpressionError> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut chars = raw.char_indices().peekable();
    let column_of = |byte: usize| raw[..byte].chars().count() + 1;

    while let Some((offset, c)) = chars.next() {
        match c {
            '{' if chars.peek().map(|(_, n)| *n) == Some('{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek().map(|(_, n)| *n) == Some('}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let start = offset + 1;
                let mut quote: Option<char> = None;
                let mut end = None;
                while let Some((i, ch)) = chars.next() {
                    match (quote, ch) {
                        (Some(_), '\\') => {
                            chars.next();
                        }
                        (Some(q), ch) if ch == q => quote = None,
                        (Some(_), _) => {}
                        (None, '\'' | '"') => quote = Some(ch),
                        (None, '}') => {
                            end = Some(i);
                            break;
                        }
                        (None, _) => {}
                    }
                }
                let Some(end) = end else {
                    return Err(ExpressionError::new("unclosed '{' in template", column_of(offset)));
                };

                let source = &raw[start..end];
                let expr = parse_expression(source).map_err(|e| {
                    ExpressionError::new(e.message, column_of(start) + e.column - 1)
                })?;
                if !literal.is_empty() {
                    parts.push(TemplatePart::Literal(std::mem::take(&mut literal)));
                }
                parts.push(TemplatePart::Expr(expr));
            }
            other => literal.push(other),
        }
    }

    if !literal.is_empty() || parts.is_empty() {
        parts.push(TemplatePart::Literal(literal));
    }
    Ok(Template { parts })
}
