//! Encoding and decoding of values crossing the REPL channel.
//!
//! The device returns results as printed literals (`repr()` output); this
//! module parses the subset the filesystem primitives produce: `None`,
//! booleans, integers, strings, bytes and (possibly nested) tuples and
//! lists. In the other direction it renders host strings and byte buffers
//! as quoted literals so snippet arguments are substituted escaped, never
//! concatenated raw.

use bytes::Bytes;

use crate::error::{Error, Result};

/// A value decoded from the device's printed output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Bytes),
    Tuple(Vec<Value>),
    List(Vec<Value>),
}

impl Value {
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Self::Int(n) => Ok(*n),
            other => Err(type_error("int", other)),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Self::Str(s) => Ok(s),
            other => Err(type_error("str", other)),
        }
    }

    pub fn as_bytes(&self) -> Result<&Bytes> {
        match self {
            Self::Bytes(b) => Ok(b),
            other => Err(type_error("bytes", other)),
        }
    }

    /// Elements of a tuple or list value.
    pub fn items(&self) -> Result<&[Value]> {
        match self {
            Self::Tuple(v) | Self::List(v) => Ok(v),
            other => Err(type_error("sequence", other)),
        }
    }
}

fn type_error(expected: &str, got: &Value) -> Error {
    Error::Protocol(format!("expected {expected}, device returned {got:?}"))
}

/// Parse a single literal. Trailing whitespace is permitted (the REPL output
/// usually carries a trailing newline), anything else after the value is a
/// protocol error.
pub fn parse(src: &str) -> Result<Value> {
    let mut p = Parser {
        src: src.as_bytes(),
        pos: 0,
    };
    p.skip_ws();
    let value = p.value()?;
    p.skip_ws();
    if p.pos != p.src.len() {
        return Err(p.error("trailing data after literal"));
    }
    Ok(value)
}

/// Render `s` as a quoted string literal the device can evaluate.
pub fn quote_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Render a byte buffer as a bytes literal the device can evaluate.
pub fn quote_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() + 3);
    out.push_str("b'");
    for &b in data {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            b => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out.push('\'');
    out
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, msg: &str) -> Error {
        Error::Protocol(format!("{msg} at offset {}", self.pos))
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.src[self.pos..].starts_with(kw.as_bytes()) {
            self.pos += kw.len();
            true
        } else {
            false
        }
    }

    fn value(&mut self) -> Result<Value> {
        self.skip_ws();
        match self.peek() {
            None => Err(self.error("unexpected end of literal")),
            Some(b'N') if self.eat_keyword("None") => Ok(Value::None),
            Some(b'T') if self.eat_keyword("True") => Ok(Value::Bool(true)),
            Some(b'F') if self.eat_keyword("False") => Ok(Value::Bool(false)),
            Some(b'-' | b'0'..=b'9') => self.int(),
            Some(b'\'' | b'"') => Ok(Value::Str(self.quoted()?)),
            Some(b'b') => {
                self.pos += 1;
                Ok(Value::Bytes(Bytes::from(self.quoted_raw()?)))
            }
            Some(b'(') => self.sequence(b'(', b')').map(Value::Tuple),
            Some(b'[') => self.sequence(b'[', b']').map(Value::List),
            Some(c) => Err(self.error(&format!("unexpected byte {:?}", c as char))),
        }
    }

    fn int(&mut self) -> Result<Value> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| self.error("invalid integer"))?;
        text.parse()
            .map(Value::Int)
            .map_err(|_| self.error("invalid integer"))
    }

    fn quoted(&mut self) -> Result<String> {
        let raw = self.quoted_raw()?;
        String::from_utf8(raw).map_err(|_| self.error("string is not valid utf-8"))
    }

    fn quoted_raw(&mut self) -> Result<Vec<u8>> {
        let quote = self.bump().ok_or_else(|| self.error("expected quote"))?;
        if quote != b'\'' && quote != b'"' {
            return Err(self.error("expected quote"));
        }
        let mut out = Vec::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(b) if b == quote => return Ok(out),
                Some(b'\\') => match self.bump() {
                    None => return Err(self.error("unterminated escape")),
                    Some(b'n') => out.push(b'\n'),
                    Some(b'r') => out.push(b'\r'),
                    Some(b't') => out.push(b'\t'),
                    Some(b'0') => out.push(0),
                    Some(b'x') => {
                        let hi = self.hex_digit()?;
                        let lo = self.hex_digit()?;
                        out.push(hi * 16 + lo);
                    }
                    Some(c) => out.push(c),
                },
                Some(b) => out.push(b),
            }
        }
    }

    fn hex_digit(&mut self) -> Result<u8> {
        match self.bump() {
            Some(c @ b'0'..=b'9') => Ok(c - b'0'),
            Some(c @ b'a'..=b'f') => Ok(c - b'a' + 10),
            Some(c @ b'A'..=b'F') => Ok(c - b'A' + 10),
            _ => Err(self.error("invalid hex escape")),
        }
    }

    fn sequence(&mut self, open: u8, close: u8) -> Result<Vec<Value>> {
        debug_assert_eq!(self.peek(), Some(open));
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.pos += 1;
                return Ok(items);
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                }
                Some(c) if c == close => {}
                _ => return Err(self.error("expected ',' or close bracket")),
            }
        }
    }
}
