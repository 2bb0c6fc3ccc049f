//! Tokenizer and recursive-descent parser for condition expressions.
//!
//! The grammar, lowest precedence first:
//!
//! ```text
//! expression := term [OR expression]
//! term       := factor [AND term]
//! factor     := [NOT] comparison
//! comparison := '(' expression ')' | value [compare-op value]
//! value      := number | identifier | literal | version
//! ```
//!
//! Keywords are uppercase. Comparison operators may carry a `~` prefix for
//! case-insensitive string comparison.

use nom::{
    bytes::complete::{take_while, take_while1},
    IResult, Parser,
};

use ember_bundle_types::version::version_parser;

use crate::{CompareKind, CompareOp, ConditionError, Expr, Operand};

/// One lexed symbol with its byte position in the source.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub position: usize,
    pub kind: TokenKind,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Or,
    And,
    Not,
    Compare(CompareOp),
    LParen,
    RParen,
    Number(i64),
    Identifier(String),
    Literal(String),
    Version(ember_bundle_types::BundleVersion),
}

fn is_identifier_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

fn identifier(input: &str) -> IResult<&str, &str> {
    let (rest, _) = take_while1(is_identifier_start).parse(input)?;
    let consumed = input.len() - rest.len();
    let (rest, tail) = take_while(is_identifier_char).parse(rest)?;
    Ok((rest, &input[..consumed + tail.len()]))
}

// Longest operators first so `<=` does not lex as `<` `=`.
const COMPARE_OPERATORS: [(&str, CompareKind); 9] = [
    ("<=", CompareKind::Le),
    ("<>", CompareKind::Ne),
    ("<<", CompareKind::HiEq),
    (">=", CompareKind::Ge),
    ("><", CompareKind::Band),
    (">>", CompareKind::LoEq),
    ("<", CompareKind::Lt),
    (">", CompareKind::Gt),
    ("=", CompareKind::Eq),
];

fn compare_operator(input: &str) -> IResult<&str, CompareKind> {
    for (text, kind) in COMPARE_OPERATORS {
        if let Some(rest) = input.strip_prefix(text) {
            return Ok((rest, kind));
        }
    }
    Err(nom::Err::Error(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Tag,
    )))
}

/// Lexes the whole condition into tokens.
pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let mut rest = source;

    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        let position = source.len() - rest.len();
        let first = rest.chars().next().unwrap_or_default();

        // Case-insensitive operator prefix.
        if first == '~' {
            let after = &rest[1..];
            match compare_operator(after) {
                Ok((remaining, kind)) => {
                    tokens.push(Token {
                        position,
                        kind: TokenKind::Compare(CompareOp {
                            kind,
                            insensitive: true,
                        }),
                    });
                    rest = remaining;
                    continue;
                }
                Err(_) => return Err(ConditionError::UnexpectedCharacter { position }),
            }
        }

        if let Ok((remaining, kind)) = compare_operator(rest) {
            tokens.push(Token {
                position,
                kind: TokenKind::Compare(CompareOp {
                    kind,
                    insensitive: false,
                }),
            });
            rest = remaining;
            continue;
        }

        match first {
            '(' => {
                tokens.push(Token {
                    position,
                    kind: TokenKind::LParen,
                });
                rest = &rest[1..];
            }
            ')' => {
                tokens.push(Token {
                    position,
                    kind: TokenKind::RParen,
                });
                rest = &rest[1..];
            }
            '"' => {
                let body = &rest[1..];
                match body.find('"') {
                    Some(end) => {
                        tokens.push(Token {
                            position,
                            kind: TokenKind::Literal(body[..end].to_owned()),
                        });
                        rest = &body[end + 1..];
                    }
                    None => return Err(ConditionError::UnterminatedLiteral { position }),
                }
            }
            c if c.is_ascii_digit() => {
                let (remaining, digits) =
                    take_while1::<_, _, nom::error::Error<&str>>(|c: char| c.is_ascii_digit())
                        .parse(rest)
                        .map_err(|_| ConditionError::UnexpectedCharacter { position })?;
                let value: i64 = digits
                    .parse()
                    .map_err(|_| ConditionError::InvalidNumber { position })?;
                tokens.push(Token {
                    position,
                    kind: TokenKind::Number(value),
                });
                rest = remaining;
            }
            'v' if rest[1..].starts_with(|c: char| c.is_ascii_digit()) => {
                match version_parser(rest) {
                    Ok((remaining, version)) => {
                        tokens.push(Token {
                            position,
                            kind: TokenKind::Version(version),
                        });
                        rest = remaining;
                    }
                    Err(_) => return Err(ConditionError::InvalidVersion { position }),
                }
            }
            c if is_identifier_start(c) => {
                let (remaining, name) = identifier(rest)
                    .map_err(|_| ConditionError::UnexpectedCharacter { position })?;
                let kind = match name {
                    "AND" => TokenKind::And,
                    "OR" => TokenKind::Or,
                    "NOT" => TokenKind::Not,
                    _ => TokenKind::Identifier(name.to_owned()),
                };
                tokens.push(Token { position, kind });
                rest = remaining;
            }
            _ => return Err(ConditionError::UnexpectedCharacter { position }),
        }
    }

    Ok(tokens)
}

pub(crate) struct TokenStream<'t> {
    tokens: &'t [Token],
    index: usize,
    source_len: usize,
}

impl<'t> TokenStream<'t> {
    pub fn new(tokens: &'t [Token], source_len: usize) -> Self {
        Self {
            tokens,
            index: 0,
            source_len,
        }
    }

    fn peek(&self) -> Option<&'t TokenKind> {
        self.tokens.get(self.index).map(|t| &t.kind)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.index)
            .map(|t| t.position)
            .unwrap_or(self.source_len)
    }

    fn advance(&mut self) -> Option<&'t TokenKind> {
        let token = self.tokens.get(self.index).map(|t| &t.kind);
        self.index += 1;
        token
    }

    pub fn at_end(&self) -> bool {
        self.index >= self.tokens.len()
    }

    pub fn parse_expression(&mut self) -> Result<Expr, ConditionError> {
        let left = self.parse_term()?;
        if matches!(self.peek(), Some(TokenKind::Or)) {
            self.advance();
            let right = self.parse_expression()?;
            return Ok(Expr::Or(Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, ConditionError> {
        let left = self.parse_factor()?;
        if matches!(self.peek(), Some(TokenKind::And)) {
            self.advance();
            let right = self.parse_term()?;
            return Ok(Expr::And(Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr, ConditionError> {
        if matches!(self.peek(), Some(TokenKind::Not)) {
            self.advance();
            let inner = self.parse_comparison()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ConditionError> {
        if matches!(self.peek(), Some(TokenKind::LParen)) {
            self.advance();
            let inner = self.parse_expression()?;
            match self.advance() {
                Some(TokenKind::RParen) => return Ok(inner),
                _ => {
                    return Err(ConditionError::UnexpectedToken {
                        position: self.position(),
                    })
                }
            }
        }

        let left = self.parse_value()?;
        if let Some(TokenKind::Compare(op)) = self.peek() {
            let op = *op;
            self.advance();
            let right = self.parse_value()?;
            return Ok(Expr::Compare { op, left, right });
        }
        Ok(Expr::Truthy(left))
    }

    fn parse_value(&mut self) -> Result<Operand, ConditionError> {
        let position = self.position();
        match self.advance() {
            Some(TokenKind::Identifier(name)) => Ok(Operand::Variable(name.clone())),
            Some(TokenKind::Number(value)) => Ok(Operand::Number(*value)),
            Some(TokenKind::Literal(text)) => Ok(Operand::Literal(text.clone())),
            Some(TokenKind::Version(version)) => Ok(Operand::Version(*version)),
            _ => Err(ConditionError::UnexpectedToken { position }),
        }
    }

    pub fn expect_end(&self) -> Result<(), ConditionError> {
        if self.at_end() {
            Ok(())
        } else {
            Err(ConditionError::ExpectedEnd {
                position: self.position(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{tokenize, TokenKind};
    use crate::ConditionError;

    #[test]
    fn test_tokenize_operators() {
        let tokens = tokenize("a <> b ~= c << 2 >> 3").unwrap();
        let compares: Vec<_> = tokens
            .iter()
            .filter_map(|t| match &t.kind {
                TokenKind::Compare(op) => Some((op.kind, op.insensitive)),
                _ => None,
            })
            .collect();
        use crate::CompareKind::*;
        assert_eq!(
            compares,
            vec![(Ne, false), (Eq, true), (HiEq, false), (LoEq, false)]
        );
    }

    #[test]
    fn test_unterminated_literal_reports_position() {
        assert_matches!(
            tokenize("x = \"abc"),
            Err(ConditionError::UnterminatedLiteral { position: 4 })
        );
    }

    #[test]
    fn test_version_literal_vs_identifier() {
        let tokens = tokenize("v1.2 vFoo").unwrap();
        assert_matches!(tokens[0].kind, TokenKind::Version(_));
        assert_matches!(tokens[1].kind, TokenKind::Identifier(ref name) if name == "vFoo");
    }

    #[test]
    fn test_literal_with_spaces() {
        let tokens = tokenize("\"hello world\"").unwrap();
        assert_matches!(tokens[0].kind, TokenKind::Literal(ref s) if s == "hello world");
    }
}
