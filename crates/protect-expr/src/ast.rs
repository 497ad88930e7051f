//! Syntax tree

use std::collections::BTreeSet;

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `!`
    Not,
    /// `-`
    Neg,
}

/// Binary operators that evaluate both operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `==` or `===`
    Eq,
    /// `!=` or `!==`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

/// Short-circuiting operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    /// `&&`
    And,
    /// `||`
    Or,
}

/// Literal constants.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// `true` / `false`
    Bool(bool),
    /// Numeric literal
    Number(f64),
    /// String literal
    String(String),
}

/// Expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Constant
    Literal(Literal),
    /// Free variable
    Ident(String),
    /// `[a, b, c]`
    Array(Vec<Expr>),
    /// `object.property`
    Member {
        /// Receiver
        object: Box<Expr>,
        /// Property name
        property: String,
    },
    /// `object[index]`
    Index {
        /// Receiver
        object: Box<Expr>,
        /// Index expression
        index: Box<Expr>,
    },
    /// `receiver.method(args)`
    Call {
        /// Receiver
        receiver: Box<Expr>,
        /// Method name
        method: String,
        /// Arguments
        args: Vec<Expr>,
    },
    /// `!x`, `-x`
    Unary {
        /// Operator
        op: UnaryOp,
        /// Operand
        operand: Box<Expr>,
    },
    /// Equality and ordering
    Binary {
        /// Operator
        op: BinaryOp,
        /// Left operand
        left: Box<Expr>,
        /// Right operand
        right: Box<Expr>,
    },
    /// `&&`, `||`
    Logical {
        /// Operator
        op: LogicalOp,
        /// Left operand
        left: Box<Expr>,
        /// Right operand, evaluated only when needed
        right: Box<Expr>,
    },
    /// `test ? then : otherwise`
    Conditional {
        /// Condition
        test: Box<Expr>,
        /// Value when truthy
        then: Box<Expr>,
        /// Value when falsy
        otherwise: Box<Expr>,
    },
}

impl Expr {
    /// Add every free identifier referenced by this node to `out`.
    pub fn collect_variables(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::Literal(_) => {}
            Self::Ident(name) => {
                out.insert(name.clone());
            }
            Self::Array(items) => items.iter().for_each(|e| e.collect_variables(out)),
            Self::Member { object, .. } => object.collect_variables(out),
            Self::Index { object, index } => {
                object.collect_variables(out);
                index.collect_variables(out);
            }
            Self::Call { receiver, args, .. } => {
                receiver.collect_variables(out);
                args.iter().for_each(|e| e.collect_variables(out));
            }
            Self::Unary { operand, .. } => operand.collect_variables(out),
            Self::Binary { left, right, .. } | Self::Logical { left, right, .. } => {
                left.collect_variables(out);
                right.collect_variables(out);
            }
            Self::Conditional {
                test,
                then,
                otherwise,
            } => {
                test.collect_variables(out);
                then.collect_variables(out);
                otherwise.collect_variables(out);
            }
        }
    }
}
