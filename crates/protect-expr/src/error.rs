//! Parse and evaluation errors

use thiserror::Error;

/// Errors produced while turning source text into an AST.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    /// The source is empty or only whitespace.
    #[error("empty expression")]
    Empty,

    /// A character that starts no token.
    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedCharacter {
        /// Offending character
        ch: char,
        /// Byte offset into the source
        offset: usize,
    },

    /// A string literal without its closing quote.
    #[error("unterminated string starting at offset {offset}")]
    UnterminatedString {
        /// Byte offset of the opening quote
        offset: usize,
    },

    /// A numeric literal that does not parse.
    #[error("invalid number '{text}' at offset {offset}")]
    InvalidNumber {
        /// Literal text
        text: String,
        /// Byte offset into the source
        offset: usize,
    },

    /// A token that does not fit the grammar at this point.
    #[error("unexpected {found} at offset {offset}, expected {expected}")]
    UnexpectedToken {
        /// Description of the token found
        found: String,
        /// What the parser was looking for
        expected: &'static str,
        /// Byte offset into the source
        offset: usize,
    },

    /// Nesting exceeds the parser's recursion limit.
    #[error("expression nested too deeply at offset {offset}")]
    TooDeep {
        /// Byte offset where the limit was hit
        offset: usize,
    },
}

/// Errors produced while evaluating an AST.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    /// Identifier is not bound in the scope.
    #[error("{0} is not defined")]
    UnknownVariable(String),

    /// Property read on `null` or `undefined`.
    #[error("cannot read property '{property}' of {on}")]
    NullAccess {
        /// Property being read
        property: String,
        /// `null` or `undefined`
        on: &'static str,
    },

    /// Method does not exist on the receiver type.
    #[error("{on}.{method} is not a function")]
    UnknownMethod {
        /// Method name
        method: String,
        /// Receiver type name
        on: String,
    },

    /// Method called with the wrong number of arguments.
    #[error("{method} expects {expected} argument(s), got {found}")]
    Arity {
        /// Method name
        method: String,
        /// Expected argument count
        expected: usize,
        /// Supplied argument count
        found: usize,
    },

    /// Operand or argument has the wrong type.
    #[error("{context}: expected {expected}, got {found}")]
    Type {
        /// Operator or method being applied
        context: String,
        /// Expected type name
        expected: &'static str,
        /// Actual type name
        found: String,
    },
}

impl EvalError {
    pub(crate) fn type_error(context: impl Into<String>, expected: &'static str, found: &str) -> Self {
        Self::Type {
            context: context.into(),
            expected,
            found: found.to_string(),
        }
    }
}
