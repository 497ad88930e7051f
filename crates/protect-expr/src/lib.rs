//! Restricted predicate-expression language.
//!
//! Expressions are parsed once into an AST and evaluated against a [`Scope`]
//! of named variables. There is no way to reach the host process from an
//! expression: the only side-effect free operations are literals, variable
//! lookups, member/index access, a fixed set of methods and boolean,
//! equality and ordering operators.
//!
//! ```
//! use std::collections::HashMap;
//! use protect_expr::{Expression, Value};
//!
//! let expr = Expression::parse("user.name.startsWith('al') && user.age >= 18").unwrap();
//!
//! let mut scope = HashMap::new();
//! scope.insert(
//!     "user".to_string(),
//!     Value::from(serde_json::json!({"name": "alice", "age": 30})),
//! );
//!
//! assert!(expr.matches(&scope).unwrap());
//! ```
//!
//! # Grammar
//!
//! ```text
//! expression  ::= conditional
//! conditional ::= or ( '?' expression ':' expression )?
//! or          ::= and ( '||' and )*
//! and         ::= equality ( '&&' equality )*
//! equality    ::= comparison ( ( '==' | '!=' | '===' | '!==' ) comparison )*
//! comparison  ::= unary ( ( '<' | '<=' | '>' | '>=' ) unary )*
//! unary       ::= ( '!' | '-' ) unary | postfix
//! postfix     ::= primary ( '.' ident ( '(' args? ')' )? | '[' expression ']' )*
//! primary     ::= number | string | 'true' | 'false' | 'null' | 'undefined'
//!               | ident | '(' expression ')' | '[' args? ']'
//! args        ::= expression ( ',' expression )*
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod ast;
pub mod error;
mod eval;
mod lexer;
mod parser;
pub mod value;

use std::collections::{BTreeSet, HashMap};
use std::fmt;

pub use ast::Expr;
pub use error::{EvalError, ParseError};
pub use eval::arity;
pub use value::{HostObject, Value};

/// Variable bindings an expression is evaluated against.
pub trait Scope {
    /// Resolve a free identifier. `None` means the variable is not bound.
    fn lookup(&self, name: &str) -> Option<Value>;
}

impl Scope for HashMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// A parsed expression, ready to be evaluated any number of times.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    /// Parse `source` into an expression.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] on any lexical or syntactic error, including an
    /// empty source and nesting deeper than the parser allows.
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        let ast = parser::Parser::new(source)?.parse()?;
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    /// Evaluate against `scope` and return the resulting value.
    pub fn evaluate(&self, scope: &dyn Scope) -> Result<Value, EvalError> {
        eval::evaluate(&self.ast, scope)
    }

    /// Evaluate against `scope` and return the truthiness of the result.
    pub fn matches(&self, scope: &dyn Scope) -> Result<bool, EvalError> {
        self.evaluate(scope).map(|v| v.is_truthy())
    }

    /// The original source text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The parsed syntax tree.
    #[must_use]
    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    /// Free variables referenced by the expression, sorted.
    #[must_use]
    pub fn variables(&self) -> BTreeSet<String> {
        let mut vars = BTreeSet::new();
        self.ast.collect_variables(&mut vars);
        vars
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
