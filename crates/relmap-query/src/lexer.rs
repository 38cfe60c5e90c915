//! Tokenizer for the object query language.
//!
//! Keywords are not distinguished from identifiers here; the parser matches
//! them case-insensitively. Every token carries the byte offset at which it
//! starts so syntax errors can point at the offending input.

use relmap_core::{Error, QuerySyntaxError};
use std::fmt;

/// Kind of a lexical token.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Identifier(String),
    Integer(i64),
    Float(f64),
    /// Single-quoted string literal, quotes removed and `''` unescaped
    String(String),
    /// `:name`
    NamedParameter(String),
    /// `?1`
    PositionalParameter(usize),
    Comma,
    Dot,
    LeftParen,
    RightParen,
    Equals,
    NotEquals,
    Less,
    LessEquals,
    Greater,
    GreaterEquals,
    Plus,
    Minus,
    Star,
    Slash,
    Eof,
}

/// A token and where it starts in the query text.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub position: usize,
}

impl Token {
    /// Whether this token is the keyword `keyword` (case-insensitive).
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(&self.kind, TokenKind::Identifier(name) if name.eq_ignore_ascii_case(keyword))
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Identifier(name) => write!(f, "{name}"),
            TokenKind::Integer(n) => write!(f, "{n}"),
            TokenKind::Float(n) => write!(f, "{n}"),
            TokenKind::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            TokenKind::NamedParameter(name) => write!(f, ":{name}"),
            TokenKind::PositionalParameter(n) => write!(f, "?{n}"),
            TokenKind::Comma => f.write_str(","),
            TokenKind::Dot => f.write_str("."),
            TokenKind::LeftParen => f.write_str("("),
            TokenKind::RightParen => f.write_str(")"),
            TokenKind::Equals => f.write_str("="),
            TokenKind::NotEquals => f.write_str("<>"),
            TokenKind::Less => f.write_str("<"),
            TokenKind::LessEquals => f.write_str("<="),
            TokenKind::Greater => f.write_str(">"),
            TokenKind::GreaterEquals => f.write_str(">="),
            TokenKind::Plus => f.write_str("+"),
            TokenKind::Minus => f.write_str("-"),
            TokenKind::Star => f.write_str("*"),
            TokenKind::Slash => f.write_str("/"),
            TokenKind::Eof => f.write_str("end of input"),
        }
    }
}

/// Reserved words that may not be used as identification variables.
pub const RESERVED: &[&str] = &[
    "SELECT", "DISTINCT", "FROM", "WHERE", "GROUP", "BY", "HAVING", "ORDER", "ASC", "DESC", "AS",
    "JOIN", "INNER", "LEFT", "OUTER", "FETCH", "WITH", "UPDATE", "SET", "DELETE", "AND", "OR",
    "NOT", "BETWEEN", "IN", "LIKE", "IS", "NULL", "TRUE", "FALSE",
];

pub fn is_reserved(word: &str) -> bool {
    RESERVED.iter().any(|kw| kw.eq_ignore_ascii_case(word))
}

/// Split `input` into tokens, ending with [`TokenKind::Eof`].
pub fn tokenize(input: &str) -> Result<Vec<Token>, Error> {
    Lexer::new(input).run()
}

struct Lexer<'a> {
    input: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            bytes: input.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn run(mut self) -> Result<Vec<Token>, Error> {
        let mut tokens = Vec::new();
        loop {
            while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
                self.pos += 1;
            }
            let start = self.pos;
            let Some(byte) = self.peek() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    position: start,
                });
                return Ok(tokens);
            };
            let kind = match byte {
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.identifier(),
                b'0'..=b'9' => self.number(start)?,
                b'\'' => self.string(start)?,
                b':' => {
                    self.pos += 1;
                    let name = self.identifier_text();
                    if name.is_empty() {
                        return Err(syntax("expected parameter name after ':'", start, ":"));
                    }
                    TokenKind::NamedParameter(name.to_string())
                }
                b'?' => {
                    self.pos += 1;
                    let digits = self.digits();
                    let index = digits.parse::<usize>().ok().filter(|n| *n > 0).ok_or_else(|| {
                        syntax("expected parameter position after '?'", start, "?")
                    })?;
                    TokenKind::PositionalParameter(index)
                }
                b',' => self.single(TokenKind::Comma),
                b'.' => self.single(TokenKind::Dot),
                b'(' => self.single(TokenKind::LeftParen),
                b')' => self.single(TokenKind::RightParen),
                b'+' => self.single(TokenKind::Plus),
                b'-' => self.single(TokenKind::Minus),
                b'*' => self.single(TokenKind::Star),
                b'/' => self.single(TokenKind::Slash),
                b'=' => self.single(TokenKind::Equals),
                b'<' => match self.peek_at(1) {
                    Some(b'=') => self.double(TokenKind::LessEquals),
                    Some(b'>') => self.double(TokenKind::NotEquals),
                    _ => self.single(TokenKind::Less),
                },
                b'>' => match self.peek_at(1) {
                    Some(b'=') => self.double(TokenKind::GreaterEquals),
                    _ => self.single(TokenKind::Greater),
                },
                b'!' if self.peek_at(1) == Some(b'=') => self.double(TokenKind::NotEquals),
                _ => {
                    let ch = self.input[start..].chars().next().unwrap_or('?');
                    return Err(syntax("unexpected character", start, ch.to_string()));
                }
            };
            tokens.push(Token {
                kind,
                position: start,
            });
        }
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.pos += 1;
        kind
    }

    fn double(&mut self, kind: TokenKind) -> TokenKind {
        self.pos += 2;
        kind
    }

    fn identifier_text(&mut self) -> &'a str {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            self.pos += 1;
        }
        &self.input[start..self.pos]
    }

    fn identifier(&mut self) -> TokenKind {
        TokenKind::Identifier(self.identifier_text().to_string())
    }

    fn digits(&mut self) -> &'a str {
        let start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        &self.input[start..self.pos]
    }

    fn number(&mut self, start: usize) -> Result<TokenKind, Error> {
        self.digits();
        let is_float = self.peek() == Some(b'.') && self.peek_at(1).is_some_and(|b| b.is_ascii_digit());
        if is_float {
            self.pos += 1;
            self.digits();
        }
        let text = &self.input[start..self.pos];
        if is_float {
            text.parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| syntax("invalid number", start, text))
        } else {
            text.parse::<i64>()
                .map(TokenKind::Integer)
                .map_err(|_| syntax("integer literal out of range", start, text))
        }
    }

    fn string(&mut self, start: usize) -> Result<TokenKind, Error> {
        self.pos += 1;
        let mut value = String::new();
        let mut segment = self.pos;
        loop {
            match self.peek() {
                None => {
                    return Err(syntax(
                        "unterminated string literal",
                        start,
                        &self.input[start..],
                    ));
                }
                Some(b'\'') if self.peek_at(1) == Some(b'\'') => {
                    value.push_str(&self.input[segment..=self.pos]);
                    self.pos += 2;
                    segment = self.pos;
                }
                Some(b'\'') => {
                    value.push_str(&self.input[segment..self.pos]);
                    self.pos += 1;
                    return Ok(TokenKind::String(value));
                }
                Some(_) => self.pos += 1,
            }
        }
    }
}

fn syntax(message: &str, position: usize, token: impl Into<String>) -> Error {
    QuerySyntaxError::at_token(message, position, token).into()
}
