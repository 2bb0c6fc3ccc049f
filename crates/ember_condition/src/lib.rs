#![deny(missing_docs)]

//! Parser and evaluator for the boolean condition expressions bundles use to
//! gate detection, installation and searches.
//!
//! A condition is parsed once into an [`Condition`] and evaluated against a
//! [`Variables`] store. Operands are numbers, quoted string literals,
//! `v`-prefixed version literals, and variable identifiers; comparisons
//! between mixed types coerce one side, and a coercion that fails yields the
//! *not equal* outcome rather than an error.
//!
//! ```
//! use ember_bundle_types::Variables;
//! use ember_condition::Condition;
//!
//! let mut vars = Variables::new();
//! vars.set_numeric("InstallLevel", 3);
//! let condition = Condition::parse("InstallLevel >= 2").unwrap();
//! assert!(condition.evaluate(&vars));
//! ```

mod eval;
mod parse;

use thiserror::Error;

use ember_bundle_types::{BundleVersion, Variables};

/// An error produced while parsing a condition expression. Every variant
/// carries the byte position in the source text where parsing stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConditionError {
    /// A character that cannot start any token.
    #[error("unexpected character at position {position}")]
    UnexpectedCharacter {
        /// Byte offset into the condition text.
        position: usize,
    },

    /// A string literal with no closing quote.
    #[error("unterminated literal at position {position}")]
    UnterminatedLiteral {
        /// Byte offset of the opening quote.
        position: usize,
    },

    /// A `v`-prefixed version literal that does not parse.
    #[error("invalid version literal at position {position}")]
    InvalidVersion {
        /// Byte offset of the literal.
        position: usize,
    },

    /// A numeric literal that overflows a 64-bit integer.
    #[error("invalid number at position {position}")]
    InvalidNumber {
        /// Byte offset of the literal.
        position: usize,
    },

    /// A token that does not fit the grammar at this point.
    #[error("unexpected token at position {position}")]
    UnexpectedToken {
        /// Byte offset of the token.
        position: usize,
    },

    /// Input remained after a complete expression.
    #[error("expected end of condition at position {position}")]
    ExpectedEnd {
        /// Byte offset of the first trailing token.
        position: usize,
    },
}

/// The comparison half of an operator: what relation is tested.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompareKind {
    /// `<`
    Lt,
    /// `>`
    Gt,
    /// `<=`
    Le,
    /// `>=`
    Ge,
    /// `=`
    Eq,
    /// `<>`
    Ne,
    /// `><`: substring for strings, bitwise-and for numerics.
    Band,
    /// `<<`: prefix for strings, high-16-bit equality for numerics.
    HiEq,
    /// `>>`: suffix for strings, low-16-bit equality for numerics.
    LoEq,
}

/// A comparison operator, optionally `~`-prefixed for case-insensitive
/// string comparison.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CompareOp {
    /// The relation tested.
    pub kind: CompareKind,
    /// Compare strings without case.
    pub insensitive: bool,
}

/// A leaf operand of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// A variable read from the store at evaluation time.
    Variable(String),
    /// A numeric literal.
    Number(i64),
    /// A quoted string literal.
    Literal(String),
    /// A `v`-prefixed version literal.
    Version(BundleVersion),
}

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Logical or; right operand evaluated only when needed.
    Or(Box<Expr>, Box<Expr>),
    /// Logical and.
    And(Box<Expr>, Box<Expr>),
    /// Logical negation.
    Not(Box<Expr>),
    /// A two-operand comparison.
    Compare {
        /// The operator.
        op: CompareOp,
        /// Left operand.
        left: Operand,
        /// Right operand.
        right: Operand,
    },
    /// A bare operand tested for truthiness: defined and non-zero,
    /// non-empty.
    Truthy(Operand),
}

/// A condition expression, parsed once and evaluated any number of times.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parses a condition expression.
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let tokens = parse::tokenize(source)?;
        let mut stream = parse::TokenStream::new(&tokens, source.len());
        let expr = stream.parse_expression()?;
        stream.expect_end()?;
        Ok(Self {
            source: source.to_owned(),
            expr,
        })
    }

    /// The original source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the condition against a variable store.
    pub fn evaluate(&self, variables: &Variables) -> bool {
        let result = eval::evaluate_expr(&self.expr, variables);
        tracing::debug!(condition = %self.source, result, "evaluated condition");
        result
    }
}

/// Parses and evaluates a condition in one call.
pub fn evaluate_condition(source: &str, variables: &Variables) -> Result<bool, ConditionError> {
    Ok(Condition::parse(source)?.evaluate(variables))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use rstest::rstest;

    use ember_bundle_types::{BundleVersion, Variables};

    use super::{evaluate_condition, Condition, ConditionError};

    fn spec_variables() -> Variables {
        let mut vars = Variables::new();
        vars.set_numeric("a", 1);
        vars.set_numeric("b", 2);
        vars.set_string("c", "1.2.3.4");
        vars
    }

    #[rstest]
    #[case("a = 1", true)]
    #[case("a < b AND NOT (b = 2)", false)]
    #[case("v1.2.3.4 = c", true)]
    #[case("\"foo\" >< \"oo\"", true)]
    #[case("a < b OR b < a", true)]
    #[case("NOT (a = 1) OR b = 2", true)]
    #[case("a = 1 AND b = 2 AND c", true)]
    fn test_spec_laws(#[case] source: &str, #[case] expected: bool) {
        let vars = spec_variables();
        assert_eq!(evaluate_condition(source, &vars), Ok(expected), "{source}");
    }

    #[test]
    fn test_literal_with_embedded_spaces() {
        let mut vars = Variables::new();
        vars.set_string("Name", "hello world");
        assert_eq!(
            evaluate_condition("Name = \"hello world\"", &vars),
            Ok(true)
        );
    }

    #[test]
    fn test_unterminated_literal_is_positioned_error() {
        let vars = Variables::new();
        assert_matches!(
            evaluate_condition("x = \"oops", &vars),
            Err(ConditionError::UnterminatedLiteral { position: 4 })
        );
    }

    #[rstest]
    // 0x0001_0002: high 16 bits 1, low 16 bits 2.
    #[case("x << 1", true)]
    #[case("x >> 2", true)]
    #[case("x << 2", false)]
    #[case("x >> 1", false)]
    #[case("x >< 2", true)]
    #[case("x >< 4", false)]
    fn test_numeric_bit_operators(#[case] source: &str, #[case] expected: bool) {
        let mut vars = Variables::new();
        vars.set_numeric("x", 0x0001_0002);
        assert_eq!(evaluate_condition(source, &vars), Ok(expected), "{source}");
    }

    #[rstest]
    #[case("s << \"ab\"", true)]
    #[case("s >> \"ef\"", true)]
    #[case("s >< \"cd\"", true)]
    #[case("s << \"ef\"", false)]
    fn test_string_affix_operators(#[case] source: &str, #[case] expected: bool) {
        let mut vars = Variables::new();
        vars.set_string("s", "abcdef");
        assert_eq!(evaluate_condition(source, &vars), Ok(expected), "{source}");
    }

    #[test]
    fn test_case_insensitive_operators() {
        let mut vars = Variables::new();
        vars.set_string("s", "Value");
        assert_eq!(evaluate_condition("s = \"value\"", &vars), Ok(false));
        assert_eq!(evaluate_condition("s ~= \"value\"", &vars), Ok(true));
        assert_eq!(evaluate_condition("s ~>< \"ALU\"", &vars), Ok(true));
    }

    #[test]
    fn test_undefined_variable() {
        let vars = Variables::new();
        // Bare undefined identifier is false.
        assert_eq!(evaluate_condition("Missing", &vars), Ok(false));
        // Comparisons against an undefined variable yield not-equal.
        assert_eq!(evaluate_condition("Missing = 1", &vars), Ok(false));
        assert_eq!(evaluate_condition("Missing <> 1", &vars), Ok(true));
    }

    #[test]
    fn test_version_string_coercion_failure_is_not_equal() {
        let mut vars = Variables::new();
        vars.set_string("s", "not a version");
        assert_eq!(evaluate_condition("v1.0 = s", &vars), Ok(false));
        assert_eq!(evaluate_condition("v1.0 <> s", &vars), Ok(true));
    }

    #[test]
    fn test_numeric_version_comparison() {
        let mut vars = Variables::new();
        vars.set_version("v", BundleVersion::new(0, 0, 0, 5));
        // The numeric is reinterpreted as a packed version quad.
        assert_eq!(evaluate_condition("v = 5", &vars), Ok(true));
    }

    #[test]
    fn test_parse_reports_trailing_tokens() {
        assert_matches!(
            Condition::parse("a = 1 b"),
            Err(ConditionError::ExpectedEnd { .. })
        );
    }

    #[test]
    fn test_truthiness() {
        let mut vars = Variables::new();
        vars.set_numeric("zero", 0);
        vars.set_numeric("one", 1);
        vars.set_string("empty", "");
        vars.set_string("text", "x");
        assert_eq!(evaluate_condition("zero", &vars), Ok(false));
        assert_eq!(evaluate_condition("one", &vars), Ok(true));
        assert_eq!(evaluate_condition("empty", &vars), Ok(false));
        assert_eq!(evaluate_condition("text", &vars), Ok(true));
    }
}
