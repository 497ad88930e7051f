//! Tokenizer over expression source.

use std::fmt;

use crate::error::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Undefined,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
    Question,
    Colon,
    Not,
    Minus,
    AndAnd,
    OrOr,
    EqEq,
    EqEqEq,
    NotEq,
    NotEqEq,
    Lt,
    Le,
    Gt,
    Ge,
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "number {n}"),
            Self::Str(s) => write!(f, "string '{s}'"),
            Self::Ident(s) => write!(f, "identifier '{s}'"),
            Self::True => f.write_str("'true'"),
            Self::False => f.write_str("'false'"),
            Self::Null => f.write_str("'null'"),
            Self::Undefined => f.write_str("'undefined'"),
            Self::LParen => f.write_str("'('"),
            Self::RParen => f.write_str("')'"),
            Self::LBracket => f.write_str("'['"),
            Self::RBracket => f.write_str("']'"),
            Self::Dot => f.write_str("'.'"),
            Self::Comma => f.write_str("','"),
            Self::Question => f.write_str("'?'"),
            Self::Colon => f.write_str("':'"),
            Self::Not => f.write_str("'!'"),
            Self::Minus => f.write_str("'-'"),
            Self::AndAnd => f.write_str("'&&'"),
            Self::OrOr => f.write_str("'||'"),
            Self::EqEq => f.write_str("'=='"),
            Self::EqEqEq => f.write_str("'==='"),
            Self::NotEq => f.write_str("'!='"),
            Self::NotEqEq => f.write_str("'!=='"),
            Self::Lt => f.write_str("'<'"),
            Self::Le => f.write_str("'<='"),
            Self::Gt => f.write_str("'>'"),
            Self::Ge => f.write_str("'>='"),
            Self::Eof => f.write_str("end of input"),
        }
    }
}

/// Token with the byte offset where it starts.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Spanned {
    pub token: Token,
    pub offset: usize,
}

pub(crate) struct Lexer<'a> {
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
        }
    }

    /// Tokenize the whole source. The last token is always `Eof`.
    pub fn tokenize(mut self) -> Result<Vec<Spanned>, ParseError> {
        let mut tokens = Vec::new();
        loop {
            let next = self.next_token()?;
            let done = next.token == Token::Eof;
            tokens.push(next);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn next_token(&mut self) -> Result<Spanned, ParseError> {
        while self.chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}

        let Some((offset, ch)) = self.chars.next() else {
            return Ok(Spanned {
                token: Token::Eof,
                offset: self.source.len(),
            });
        };

        let token = match ch {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '.' => Token::Dot,
            ',' => Token::Comma,
            '?' => Token::Question,
            ':' => Token::Colon,
            '-' => Token::Minus,
            '&' => {
                self.expect_char('&', offset, ch)?;
                Token::AndAnd
            }
            '|' => {
                self.expect_char('|', offset, ch)?;
                Token::OrOr
            }
            '=' => {
                self.expect_char('=', offset, ch)?;
                if self.eat('=') { Token::EqEqEq } else { Token::EqEq }
            }
            '!' => {
                if self.eat('=') {
                    if self.eat('=') { Token::NotEqEq } else { Token::NotEq }
                } else {
                    Token::Not
                }
            }
            '<' => {
                if self.eat('=') { Token::Le } else { Token::Lt }
            }
            '>' => {
                if self.eat('=') { Token::Ge } else { Token::Gt }
            }
            '\'' | '"' => self.read_string(ch, offset)?,
            '0'..='9' => self.read_number(offset)?,
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => self.read_word(offset),
            other => {
                return Err(ParseError::UnexpectedCharacter { ch: other, offset });
            }
        };

        Ok(Spanned { token, offset })
    }

    fn eat(&mut self, expected: char) -> bool {
        self.chars.next_if(|(_, c)| *c == expected).is_some()
    }

    fn expect_char(&mut self, expected: char, offset: usize, ch: char) -> Result<(), ParseError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(ParseError::UnexpectedCharacter { ch, offset })
        }
    }

    fn read_string(&mut self, quote: char, start: usize) -> Result<Token, ParseError> {
        let mut value = String::new();
        loop {
            match self.chars.next() {
                None => return Err(ParseError::UnterminatedString { offset: start }),
                Some((_, c)) if c == quote => return Ok(Token::Str(value)),
                Some((_, '\\')) => match self.chars.next() {
                    None => return Err(ParseError::UnterminatedString { offset: start }),
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, 't')) => value.push('\t'),
                    Some((_, 'r')) => value.push('\r'),
                    Some((_, other)) => value.push(other),
                },
                Some((_, c)) => value.push(c),
            }
        }
    }

    fn read_number(&mut self, start: usize) -> Result<Token, ParseError> {
        let mut end = start + 1;
        let mut seen_dot = false;
        while let Some(&(i, c)) = self.chars.peek() {
            if c.is_ascii_digit() {
                end = i + 1;
                self.chars.next();
            } else if c == '.' && !seen_dot && self.digit_follows(i) {
                seen_dot = true;
                end = i + 1;
                self.chars.next();
            } else {
                break;
            }
        }
        let text = &self.source[start..end];
        text.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| ParseError::InvalidNumber {
                text: text.to_string(),
                offset: start,
            })
    }

    /// `1.foo` lexes as number, dot, identifier; only `1.5` is a fraction.
    fn digit_follows(&self, dot_offset: usize) -> bool {
        self.source[dot_offset + 1..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit())
    }

    fn read_word(&mut self, start: usize) -> Token {
        let mut end = start + 1;
        while let Some(&(i, c)) = self.chars.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
                end = i + c.len_utf8();
                self.chars.next();
            } else {
                break;
            }
        }
        match &self.source[start..end] {
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            "undefined" => Token::Undefined,
            word => Token::Ident(word.to_string()),
        }
    }
}
