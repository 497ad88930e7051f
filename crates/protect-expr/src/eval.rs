//! Tree-walking evaluator

use std::cmp::Ordering;

use crate::Scope;
use crate::ast::{BinaryOp, Expr, Literal, LogicalOp, UnaryOp};
use crate::error::EvalError;
use crate::value::Value;

pub(crate) fn evaluate(expr: &Expr, scope: &dyn Scope) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(lit) => Ok(literal(lit)),
        Expr::Ident(name) => scope
            .lookup(name)
            .ok_or_else(|| EvalError::UnknownVariable(name.clone())),
        Expr::Array(items) => items
            .iter()
            .map(|e| evaluate(e, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Member { object, property } => {
            let object = evaluate(object, scope)?;
            member(&object, property)
        }
        Expr::Index { object, index } => {
            let object = evaluate(object, scope)?;
            let index = evaluate(index, scope)?;
            index_into(&object, &index)
        }
        Expr::Call {
            receiver,
            method,
            args,
        } => {
            let receiver = evaluate(receiver, scope)?;
            let args = args
                .iter()
                .map(|e| evaluate(e, scope))
                .collect::<Result<Vec<_>, _>>()?;
            call(&receiver, method, &args)
        }
        Expr::Unary { op, operand } => {
            let value = evaluate(operand, scope)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
                UnaryOp::Neg => match value {
                    Value::Number(n) => Ok(Value::Number(-n)),
                    other => Err(EvalError::type_error("unary -", "number", other.type_name())),
                },
            }
        }
        Expr::Binary { op, left, right } => {
            let left = evaluate(left, scope)?;
            let right = evaluate(right, scope)?;
            Ok(Value::Bool(binary(*op, &left, &right)))
        }
        Expr::Logical { op, left, right } => {
            let left = evaluate(left, scope)?;
            match (op, left.is_truthy()) {
                (LogicalOp::And, false) | (LogicalOp::Or, true) => Ok(left),
                _ => evaluate(right, scope),
            }
        }
        Expr::Conditional {
            test,
            then,
            otherwise,
        } => {
            if evaluate(test, scope)?.is_truthy() {
                evaluate(then, scope)
            } else {
                evaluate(otherwise, scope)
            }
        }
    }
}

fn literal(lit: &Literal) -> Value {
    match lit {
        Literal::Undefined => Value::Undefined,
        Literal::Null => Value::Null,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Number(n) => Value::Number(*n),
        Literal::String(s) => Value::String(s.clone()),
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> bool {
    match op {
        BinaryOp::Eq => left.strict_eq(right),
        BinaryOp::NotEq => !left.strict_eq(right),
        BinaryOp::Lt => compare(left, right).is_some_and(Ordering::is_lt),
        BinaryOp::Le => compare(left, right).is_some_and(Ordering::is_le),
        BinaryOp::Gt => compare(left, right).is_some_and(Ordering::is_gt),
        BinaryOp::Ge => compare(left, right).is_some_and(Ordering::is_ge),
    }
}

/// Numbers with numbers, strings with strings; anything else is unordered.
fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn nullish_name(value: &Value) -> &'static str {
    if matches!(value, Value::Null) { "null" } else { "undefined" }
}

fn member(object: &Value, property: &str) -> Result<Value, EvalError> {
    match object {
        Value::Undefined | Value::Null => Err(EvalError::NullAccess {
            property: property.to_string(),
            on: nullish_name(object),
        }),
        Value::String(s) if property == "length" => Ok(length(s.chars().count())),
        Value::Array(items) if property == "length" => Ok(length(items.len())),
        Value::Object(map) => Ok(map.get(property).cloned().unwrap_or_default()),
        Value::Host(host) => Ok(host.get(property)),
        _ => Ok(Value::Undefined),
    }
}

fn index_into(object: &Value, index: &Value) -> Result<Value, EvalError> {
    match (object, index) {
        (Value::Undefined | Value::Null, _) => Err(EvalError::NullAccess {
            property: index.to_string(),
            on: nullish_name(object),
        }),
        (Value::Array(items), Value::Number(n)) => {
            Ok(as_index(*n).and_then(|i| items.get(i)).cloned().unwrap_or_default())
        }
        (Value::String(s), Value::Number(n)) => Ok(as_index(*n)
            .and_then(|i| s.chars().nth(i))
            .map(|c| Value::String(c.to_string()))
            .unwrap_or_default()),
        (_, Value::String(key)) => member(object, key),
        _ => Ok(Value::Undefined),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn as_index(n: f64) -> Option<usize> {
    (n >= 0.0 && n.fract() == 0.0 && n < 4_294_967_295.0).then_some(n as usize)
}

#[allow(clippy::cast_precision_loss)]
fn length(n: usize) -> Value {
    Value::Number(n as f64)
}

fn call(receiver: &Value, method: &str, args: &[Value]) -> Result<Value, EvalError> {
    match receiver {
        Value::Undefined | Value::Null => Err(EvalError::NullAccess {
            property: method.to_string(),
            on: nullish_name(receiver),
        }),
        Value::Host(host) => host.call(method, args).unwrap_or_else(|| {
            Err(EvalError::UnknownMethod {
                method: method.to_string(),
                on: host.type_name().to_string(),
            })
        }),
        Value::String(s) => string_method(s, method, args),
        Value::Array(items) => array_method(items, method, args),
        other => Err(EvalError::UnknownMethod {
            method: method.to_string(),
            on: other.type_name().to_string(),
        }),
    }
}

fn string_method(s: &str, method: &str, args: &[Value]) -> Result<Value, EvalError> {
    match method {
        "toLowerCase" => {
            arity(method, args, 0)?;
            Ok(Value::String(s.to_lowercase()))
        }
        "toUpperCase" => {
            arity(method, args, 0)?;
            Ok(Value::String(s.to_uppercase()))
        }
        "startsWith" | "endsWith" | "includes" => {
            arity(method, args, 1)?;
            let needle = string_arg(method, &args[0])?;
            let found = match method {
                "startsWith" => s.starts_with(needle),
                "endsWith" => s.ends_with(needle),
                _ => s.contains(needle),
            };
            Ok(Value::Bool(found))
        }
        _ => Err(EvalError::UnknownMethod {
            method: method.to_string(),
            on: "string".to_string(),
        }),
    }
}

fn array_method(items: &[Value], method: &str, args: &[Value]) -> Result<Value, EvalError> {
    match method {
        "includes" => {
            arity(method, args, 1)?;
            Ok(Value::Bool(items.iter().any(|v| v.strict_eq(&args[0]))))
        }
        "indexOf" => {
            arity(method, args, 1)?;
            #[allow(clippy::cast_precision_loss)]
            let position = items
                .iter()
                .position(|v| v.strict_eq(&args[0]))
                .map_or(-1.0, |i| i as f64);
            Ok(Value::Number(position))
        }
        _ => Err(EvalError::UnknownMethod {
            method: method.to_string(),
            on: "array".to_string(),
        }),
    }
}

/// Check the argument count of a method call.
///
/// # Errors
///
/// [`EvalError::Arity`] when `args` does not have exactly `expected` items.
pub fn arity(method: &str, args: &[Value], expected: usize) -> Result<(), EvalError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(EvalError::Arity {
            method: method.to_string(),
            expected,
            found: args.len(),
        })
    }
}

fn string_arg<'a>(method: &str, arg: &'a Value) -> Result<&'a str, EvalError> {
    arg.as_str()
        .ok_or_else(|| EvalError::type_error(method, "string", arg.type_name()))
}
