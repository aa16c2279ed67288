//! Lexer for embedded expressions
//!
//! Expressions live inside `{...}` segments of attribute values and text,
//! so they are tokenized separately from the markup grammar, by the pest
//! grammar in `lexer.pest`. Keywords (`AND`, `OR`, `NOT`, `true`, `false`,
//! `null`) are matched case-insensitively.

use crate::error::ExpressionError;
use pest::Parser;
use pest_derive::Parser;

#[derive(Parser)]
#[grammar = "lexer.pest"]
struct LexerParser;

/// Position information for a token
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    /// One-based column (characters)
    pub column: usize,
    /// Byte offset into the expression text
    pub offset: usize,
}

/// Span of source text
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub start: Position,
    pub end: Position,
    pub text: String,
}

/// A token with its value and position
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

/// Token types
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Keywords
    And,
    Or,
    Not,
    True,
    False,
    Null,

    // Literals
    Identifier(String),
    Integer(i64),
    Decimal(f64),
    String(String),

    // Operators
    Plus,         // +
    Minus,        // -
    Star,         // *
    Slash,        // /
    Percent,      // %
    Ampersand,    // &
    EqualEqual,   // ==
    NotEqual,     // !=
    Less,         // <
    LessEqual,    // <=
    Greater,      // >
    GreaterEqual, // >=
    AndAnd,       // &&
    OrOr,         // ||
    Bang,         // !
    Question,     // ?
    Colon,        // :

    // Punctuation
    LeftParen,    // (
    RightParen,   // )
    LeftBracket,  // [
    RightBracket, // ]
    Comma,        // ,
    Dot,          // .

    Eof,
}

impl TokenKind {
    fn keyword(word: &str) -> Option<TokenKind> {
        let kind = match word.to_ascii_lowercase().as_str() {
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "not" => TokenKind::Not,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "null" => TokenKind::Null,
            _ => return None,
        };
        Some(kind)
    }
}

/// Lexer that converts expression text to tokens
pub struct Lexer<'a> {
    source: &'a str,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    /// Create a new lexer for the given expression text
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            tokens: Vec::new(),
        }
    }

    /// Tokenize the expression
    pub fn tokenize(mut self) -> Result<Vec<Token>, ExpressionError> {
        let pairs = LexerParser::parse(Rule::tokens, self.source).map_err(|e| {
            let offset = match e.location {
                pest::error::InputLocation::Pos(pos) => pos,
                pest::error::InputLocation::Span((start, _)) => start,
            };
            ExpressionError::new("unexpected input", self.position_from_offset(offset).column)
        })?;

        for pair in pairs {
            if pair.as_rule() == Rule::tokens {
                for inner in pair.into_inner() {
                    if inner.as_rule() == Rule::token {
                        let token = self.process_token(inner)?;
                        self.tokens.push(token);
                    }
                }
            }
        }

        let end = self.position_from_offset(self.source.len());
        self.tokens.push(Token {
            kind: TokenKind::Eof,
            span: Span {
                start: end,
                end,
                text: String::new(),
            },
        });
        Ok(self.tokens)
    }

    /// Process a single token pair
    fn process_token(&self, pair: pest::iterators::Pair<Rule>) -> Result<Token, ExpressionError> {
        let span = self.span_from_pair(&pair);
        let column = span.start.column;
        let inner = pair
            .into_inner()
            .next()
            .ok_or_else(|| ExpressionError::new("empty token", column))?;
        let text = inner.as_str();

        let kind = match inner.as_rule() {
            Rule::decimal_token => text
                .parse::<f64>()
                .map(TokenKind::Decimal)
                .map_err(|_| ExpressionError::new(format!("invalid number '{}'", text), column))?,

            // Literals too large for i64 degrade to decimals
            Rule::integer_token => text
                .parse::<i64>()
                .map(TokenKind::Integer)
                .unwrap_or_else(|_| TokenKind::Decimal(text.parse::<f64>().unwrap_or(f64::MAX))),

            Rule::string_token => TokenKind::String(unescape(&text[1..text.len() - 1])),

            Rule::word_token => {
                TokenKind::keyword(text).unwrap_or_else(|| TokenKind::Identifier(text.to_string()))
            }

            Rule::operator_token => match text {
                "==" => TokenKind::EqualEqual,
                "!=" | "<>" => TokenKind::NotEqual,
                "<=" => TokenKind::LessEqual,
                ">=" => TokenKind::GreaterEqual,
                "&&" => TokenKind::AndAnd,
                "||" => TokenKind::OrOr,
                "+" => TokenKind::Plus,
                "-" => TokenKind::Minus,
                "*" => TokenKind::Star,
                "/" => TokenKind::Slash,
                "%" => TokenKind::Percent,
                "&" => TokenKind::Ampersand,
                "<" => TokenKind::Less,
                ">" => TokenKind::Greater,
                "!" => TokenKind::Bang,
                "?" => TokenKind::Question,
                ":" => TokenKind::Colon,
                "=" => return Err(ExpressionError::new("use '==' for comparison", column)),
                op => return Err(ExpressionError::new(format!("unknown operator '{}'", op), column)),
            },

            Rule::punctuation_token => match text {
                "(" => TokenKind::LeftParen,
                ")" => TokenKind::RightParen,
                "[" => TokenKind::LeftBracket,
                "]" => TokenKind::RightBracket,
                "," => TokenKind::Comma,
                "." => TokenKind::Dot,
                p => return Err(ExpressionError::new(format!("unknown punctuation '{}'", p), column)),
            },

            Rule::unterminated_token => {
                return Err(ExpressionError::new("unterminated string literal", column))
            }

            _ => {
                return Err(ExpressionError::new(
                    format!("unexpected character '{}'", text),
                    column,
                ))
            }
        };

        Ok(Token { kind, span })
    }

    /// Create a Span from a pest Pair
    fn span_from_pair(&self, pair: &pest::iterators::Pair<Rule>) -> Span {
        let pest_span = pair.as_span();
        Span {
            start: self.position_from_offset(pest_span.start()),
            end: self.position_from_offset(pest_span.end()),
            text: pair.as_str().to_string(),
        }
    }

    /// Column (in characters) of a byte offset
    fn position_from_offset(&self, offset: usize) -> Position {
        let prefix = self.source.get(..offset).unwrap_or(self.source);
        Position {
            column: prefix.chars().count() + 1,
            offset,
        }
    }
}

/// Resolve backslash escapes inside a string literal body
fn unescape(body: &str) -> String {
    let mut result = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => result.push('\n'),
            Some('t') => result.push('\t'),
            Some('r') => result.push('\r'),
            Some(other) => result.push(other),
            None => result.push('\\'),
        }
    }
    result
}

/// Convenience function to tokenize expression text
pub fn tokenize(source: &str) -> Result<Vec<Token>, ExpressionError> {
    Lexer::new(source).tokenize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_keywords_are_case_insensitive() {
        assert_eq!(
            kinds("a and B OR not True"),
            vec![
                TokenKind::Identifier("a".to_string()),
                TokenKind::And,
                TokenKind::Identifier("B".to_string()),
                TokenKind::Or,
                TokenKind::Not,
                TokenKind::True,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers_and_member_access() {
        assert_eq!(
            kinds("1.5 + items.length"),
            vec![
                TokenKind::Decimal(1.5),
                TokenKind::Plus,
                TokenKind::Identifier("items".to_string()),
                TokenKind::Dot,
                TokenKind::Identifier("length".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#"'it\'s' & "a\nb""#),
            vec![
                TokenKind::String("it's".to_string()),
                TokenKind::Ampersand,
                TokenKind::String("a\nb".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_two_character_operators() {
        assert_eq!(
            kinds("a <= b && c != d || !e"),
            vec![
                TokenKind::Identifier("a".to_string()),
                TokenKind::LessEqual,
                TokenKind::Identifier("b".to_string()),
                TokenKind::AndAnd,
                TokenKind::Identifier("c".to_string()),
                TokenKind::NotEqual,
                TokenKind::Identifier("d".to_string()),
                TokenKind::OrOr,
                TokenKind::Bang,
                TokenKind::Identifier("e".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_errors_carry_column() {
        let err = tokenize("a = 1").unwrap_err();
        assert_eq!(err.column, 3);
        let err = tokenize("'open").unwrap_err();
        assert_eq!(err.message, "unterminated string literal");
        assert_eq!(err.column, 1);
        assert!(tokenize("a # b").is_err());
    }

    #[test]
    fn test_spans() {
        let tokens = tokenize("ab + 12").unwrap();
        assert_eq!(tokens[2].span.text, "12");
        assert_eq!(tokens[2].span.start.column, 6);
    }

    #[test]
    fn test_whitespace_and_alternate_not_equal() {
        assert_eq!(
            kinds("\tcount <>\n 3 "),
            vec![
                TokenKind::Identifier("count".to_string()),
                TokenKind::NotEqual,
                TokenKind::Integer(3),
                TokenKind::Eof,
            ]
        );
        assert_eq!(kinds("1."), vec![TokenKind::Integer(1), TokenKind::Dot, TokenKind::Eof]);
    }
}
