//! Recursive-descent parser

use crate::ast::{BinaryOp, Expr, Literal, LogicalOp, UnaryOp};
use crate::error::ParseError;
use crate::lexer::{Lexer, Spanned, Token};

const MAX_DEPTH: usize = 64;

pub(crate) struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    pub fn new(source: &str) -> Result<Self, ParseError> {
        Ok(Self {
            tokens: Lexer::new(source).tokenize()?,
            pos: 0,
            depth: 0,
        })
    }

    pub fn parse(mut self) -> Result<Expr, ParseError> {
        if self.peek() == &Token::Eof {
            return Err(ParseError::Empty);
        }
        let expr = self.expression()?;
        if self.peek() != &Token::Eof {
            return Err(self.unexpected("end of input"));
        }
        Ok(expr)
    }

    fn peek(&self) -> &Token {
        &self.current().token
    }

    fn current(&self) -> &Spanned {
        // tokenize() always ends with Eof and advance() never moves past it
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token != Token::Eof {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == expected {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token, what: &'static str) -> Result<(), ParseError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn unexpected(&self, expected: &'static str) -> ParseError {
        let current = self.current();
        ParseError::UnexpectedToken {
            found: current.token.to_string(),
            expected,
            offset: current.offset,
        }
    }

    fn enter(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ParseError::TooDeep {
                offset: self.current().offset,
            });
        }
        Ok(())
    }

    fn expression(&mut self) -> Result<Expr, ParseError> {
        self.enter()?;
        let result = self.conditional();
        self.depth -= 1;
        result
    }

    fn conditional(&mut self) -> Result<Expr, ParseError> {
        let test = self.or()?;
        if !self.eat(&Token::Question) {
            return Ok(test);
        }
        let then = self.expression()?;
        self.expect(&Token::Colon, "':'")?;
        let otherwise = self.expression()?;
        Ok(Expr::Conditional {
            test: Box::new(test),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.and()?;
        while self.eat(&Token::OrOr) {
            let right = self.and()?;
            left = Expr::Logical {
                op: LogicalOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.equality()?;
        while self.eat(&Token::AndAnd) {
            let right = self.equality()?;
            left = Expr::Logical {
                op: LogicalOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.comparison()?;
        loop {
            let op = match self.peek() {
                Token::EqEq | Token::EqEqEq => BinaryOp::Eq,
                Token::NotEq | Token::NotEqEq => BinaryOp::NotEq,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.comparison()?;
            left = binary(op, left, right);
        }
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            left = binary(op, left, right);
        }
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek() {
            Token::Not => UnaryOp::Not,
            Token::Minus => UnaryOp::Neg,
            _ => return self.postfix(),
        };
        self.advance();
        self.enter()?;
        let operand = self.unary();
        self.depth -= 1;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand?),
        })
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let Token::Ident(name) = self.peek().clone() else {
                    return Err(self.unexpected("property name"));
                };
                self.advance();
                if self.eat(&Token::LParen) {
                    let args = self.arguments(&Token::RParen, "')'")?;
                    expr = Expr::Call {
                        receiver: Box::new(expr),
                        method: name,
                        args,
                    };
                } else {
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property: name,
                    };
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.expression()?;
                self.expect(&Token::RBracket, "']'")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                return Ok(expr);
            }
        }
    }

    /// Comma-separated expressions up to and including `close`.
    fn arguments(&mut self, close: &Token, what: &'static str) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if self.eat(close) {
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            if self.eat(close) {
                return Ok(args);
            }
            self.expect(&Token::Comma, what)?;
        }
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let expr = match self.peek().clone() {
            Token::Number(n) => Expr::Literal(Literal::Number(n)),
            Token::Str(s) => Expr::Literal(Literal::String(s)),
            Token::True => Expr::Literal(Literal::Bool(true)),
            Token::False => Expr::Literal(Literal::Bool(false)),
            Token::Null => Expr::Literal(Literal::Null),
            Token::Undefined => Expr::Literal(Literal::Undefined),
            Token::Ident(name) => Expr::Ident(name),
            Token::LParen => {
                self.advance();
                let inner = self.expression()?;
                self.expect(&Token::RParen, "')'")?;
                return Ok(inner);
            }
            Token::LBracket => {
                self.advance();
                self.enter()?;
                let items = self.arguments(&Token::RBracket, "']'");
                self.depth -= 1;
                return Ok(Expr::Array(items?));
            }
            _ => return Err(self.unexpected("an expression")),
        };
        self.advance();
        Ok(expr)
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(src: &str) -> Result<Expr, ParseError> {
        Parser::new(src)?.parse()
    }

    fn ident(name: &str) -> Box<Expr> {
        Box::new(Expr::Ident(name.to_string()))
    }

    #[test]
    fn method_call_on_identifier() {
        assert_eq!(
            parse("token.hasRole('admin')").unwrap(),
            Expr::Call {
                receiver: ident("token"),
                method: "hasRole".into(),
                args: vec![Expr::Literal(Literal::String("admin".into()))],
            }
        );
    }

    #[test]
    fn and_binds_tighter_than_or() {
        // a || b && c  ==>  a || (b && c)
        let Expr::Logical { op, left, right } = parse("a || b && c").unwrap() else {
            panic!("expected logical");
        };
        assert_eq!(op, LogicalOp::Or);
        assert_eq!(left, ident("a"));
        assert!(matches!(*right, Expr::Logical { op: LogicalOp::And, .. }));
    }

    #[test]
    fn comparison_binds_tighter_than_equality() {
        let Expr::Binary { op, right, .. } = parse("a == b < c").unwrap() else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Eq);
        assert!(matches!(*right, Expr::Binary { op: BinaryOp::Lt, .. }));
    }

    #[test]
    fn conditional_is_right_associative() {
        let Expr::Conditional { otherwise, .. } = parse("a ? b : c ? d : e").unwrap() else {
            panic!("expected conditional");
        };
        assert!(matches!(*otherwise, Expr::Conditional { .. }));
    }

    #[test]
    fn index_and_array_literal() {
        assert_eq!(
            parse("['a', 'b'][0]").unwrap(),
            Expr::Index {
                object: Box::new(Expr::Array(vec![
                    Expr::Literal(Literal::String("a".into())),
                    Expr::Literal(Literal::String("b".into())),
                ])),
                index: Box::new(Expr::Literal(Literal::Number(0.0))),
            }
        );
    }

    #[test]
    fn empty_source_is_rejected() {
        assert_eq!(parse("   ").unwrap_err(), ParseError::Empty);
    }

    #[test]
    fn trailing_tokens_are_rejected() {
        let err = parse("a b").unwrap_err();
        assert!(matches!(
            err,
            ParseError::UnexpectedToken { expected: "end of input", offset: 2, .. }
        ));
    }

    #[test]
    fn assignment_and_function_calls_are_not_expressions() {
        assert!(parse("a = 1").is_err());
        assert!(parse("process.exit()").is_ok_and(|e| matches!(e, Expr::Call { .. })));
        assert!(parse("require('fs')").is_err());
    }

    #[test]
    fn unbalanced_parens() {
        assert!(parse("(a && b").is_err());
        assert!(parse("a)").is_err());
        assert!(parse("token.hasRole('x'").is_err());
    }

    #[test]
    fn deep_nesting_is_bounded() {
        let src = format!("{}a{}", "(".repeat(200), ")".repeat(200));
        assert!(matches!(parse(&src), Err(ParseError::TooDeep { .. })));

        let negations = format!("{}a", "!".repeat(200));
        assert!(matches!(parse(&negations), Err(ParseError::TooDeep { .. })));

        let ok = format!("{}a{}", "(".repeat(10), ")".repeat(10));
        assert_eq!(parse(&ok).unwrap(), Expr::Ident("a".into()));
    }
}
