//! A minimal s-expression reader and writer.
//!
//! Supports exactly what the wire protocol needs: symbols, integers,
//! floats, strings with `\\`, `\"`, `\n`, `\t` escapes, and proper lists
//! including the empty list `nil`/`()`. Values are tagged Rust variants
//! rather than a dynamically typed blob, per the design notes: the reader
//! interns symbol text so equality is a name comparison, matching the
//! "symbol identity" requirement of the protocol.

use epc_prelude::*;

use crate::error::FramingError;

use std::fmt::Write as _;

use derive_more::Display;
use shrinkwraprs::Shrinkwrap;

/// An interned symbol. Two symbols are equal iff their names are equal.
/// `Shrinkwrap` gives read access to the interned `str` directly (e.g.
/// `symbol.len()`) without a hand-written `Deref` impl.
#[derive(Clone, Debug, Display, Eq, PartialEq, Hash, Shrinkwrap)]
pub struct Symbol(Rc<str>);

impl Symbol {
    /// Intern a new symbol with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Symbol(Rc::from(name.into()))
    }

    /// The symbol's name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::new(s)
    }
}

/// A parsed s-expression value.
///
/// The empty list and `nil` are the same value: `Sexp::List(vec![])`. There
/// is deliberately no separate `Nil` variant -- the wire dialect only has
/// one such value and giving it two representations would just invite bugs
/// where `decode(encode(v)) != v`.
#[derive(Clone, Debug, PartialEq)]
pub enum Sexp {
    /// A signed integer.
    Int(i64),
    /// A floating point number.
    Float(f64),
    /// A string, already unescaped.
    Str(String),
    /// An interned symbol.
    Symbol(Symbol),
    /// A proper list. An empty vector represents `nil`.
    List(Vec<Sexp>),
}

impl Sexp {
    /// Shorthand for constructing a symbol value.
    pub fn symbol(name: impl Into<String>) -> Self {
        Sexp::Symbol(Symbol::new(name))
    }

    /// Shorthand for `nil` / the empty list.
    pub fn nil() -> Self {
        Sexp::List(Vec::new())
    }

    /// View this value as a list's elements, if it is one.
    pub fn as_list(&self) -> Option<&[Sexp]> {
        match self {
            Sexp::List(items) => Some(items),
            _ => None,
        }
    }

    /// View this value as an integer, if it is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Sexp::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// View this value as a string, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Sexp::Str(s) => Some(s),
            _ => None,
        }
    }

    /// View this value as a symbol, if it is one.
    pub fn as_symbol(&self) -> Option<&Symbol> {
        match self {
            Sexp::Symbol(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Sexp {
    fn from(n: i64) -> Self {
        Sexp::Int(n)
    }
}

impl From<String> for Sexp {
    fn from(s: String) -> Self {
        Sexp::Str(s)
    }
}

impl From<&str> for Sexp {
    fn from(s: &str) -> Self {
        Sexp::Str(s.to_owned())
    }
}

impl From<Vec<Sexp>> for Sexp {
    fn from(items: Vec<Sexp>) -> Self {
        Sexp::List(items)
    }
}

// ==============
// === Writer ===
// ==============

/// Serialize a value to s-expression text.
///
/// Non-ASCII characters are emitted unescaped, and embedded newlines inside
/// a string are emitted as a literal newline byte rather than a `\n`
/// escape -- framing is by byte length, not by line, so this is safe and
/// keeps the printer simple.
pub fn print(v: &Sexp) -> String {
    let mut out = String::new();
    print_into(v, &mut out);
    out
}

fn print_into(v: &Sexp, out: &mut String) {
    match v {
        Sexp::Int(n) => {
            let _ = write!(out, "{}", n);
        }
        Sexp::Float(x) => {
            let _ = write!(out, "{}", format_float(*x));
        }
        Sexp::Str(s) => {
            out.push('"');
            for c in s.chars() {
                match c {
                    '\\' => out.push_str("\\\\"),
                    '"' => out.push_str("\\\""),
                    _ => out.push(c),
                }
            }
            out.push('"');
        }
        Sexp::Symbol(sym) => out.push_str(sym.name()),
        Sexp::List(items) => {
            if items.is_empty() {
                out.push_str("nil");
            } else {
                out.push('(');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    print_into(item, out);
                }
                out.push(')');
            }
        }
    }
}

fn format_float(x: f64) -> String {
    if x.fract() == 0.0 && x.is_finite() {
        format!("{:.1}", x)
    } else {
        format!("{}", x)
    }
}

// ==============
// === Reader ===
// ==============

/// Parse a single s-expression from `text`. The whole string must be
/// exactly one value (plus optional leading/trailing whitespace).
pub fn parse(text: &str) -> Result<Sexp, FramingError> {
    let mut p = Parser::new(text);
    p.skip_ws();
    let v = p.parse_value()?;
    p.skip_ws();
    if !p.at_end() {
        return Err(FramingError::SexpSyntax(format!(
            "trailing garbage after value: {:?}",
            &p.rest()[..p.rest().len().min(32)]
        )));
    }
    Ok(v)
}

struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    text: &'a str,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Parser { chars: text.chars().collect(), pos: 0, text }
    }

    fn rest(&self) -> &str {
        // Best-effort diagnostic slice; not used for parsing itself.
        self.text
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn parse_value(&mut self) -> Result<Sexp, FramingError> {
        match self.peek() {
            None => Err(FramingError::SexpSyntax("unexpected end of input".into())),
            Some('(') => self.parse_list(),
            Some('"') => self.parse_string(),
            Some(c) if is_symbol_start(c) || c == '-' || c.is_ascii_digit() => self.parse_atom(),
            Some(c) => Err(FramingError::SexpSyntax(format!("unexpected character {:?}", c))),
        }
    }

    fn parse_list(&mut self) -> Result<Sexp, FramingError> {
        self.bump(); // consume '('
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None => return Err(FramingError::SexpSyntax("unterminated list".into())),
                Some(')') => {
                    self.bump();
                    return Ok(Sexp::List(items));
                }
                _ => items.push(self.parse_value()?),
            }
        }
    }

    fn parse_string(&mut self) -> Result<Sexp, FramingError> {
        self.bump(); // consume opening quote
        let mut s = String::new();
        loop {
            match self.bump() {
                None => return Err(FramingError::SexpSyntax("unterminated string".into())),
                Some('"') => return Ok(Sexp::Str(s)),
                Some('\\') => match self.bump() {
                    Some('\\') => s.push('\\'),
                    Some('"') => s.push('"'),
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some(other) => s.push(other),
                    None => return Err(FramingError::SexpSyntax("unterminated escape".into())),
                },
                Some(c) => s.push(c),
            }
        }
    }

    fn parse_atom(&mut self) -> Result<Sexp, FramingError> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.bump();
        }
        while matches!(self.peek(), Some(c) if is_symbol_char(c)) {
            self.bump();
        }
        let atom: String = self.chars[start..self.pos].iter().collect();
        if atom == "-" {
            return Ok(Sexp::Symbol(Symbol::new(atom)));
        }
        if atom == "nil" {
            return Ok(Sexp::List(Vec::new()));
        }
        if let Ok(n) = atom.parse::<i64>() {
            return Ok(Sexp::Int(n));
        }
        if looks_like_float(&atom) {
            if let Ok(x) = atom.parse::<f64>() {
                return Ok(Sexp::Float(x));
            }
        }
        Ok(Sexp::Symbol(Symbol::new(atom)))
    }
}

fn is_symbol_start(c: char) -> bool {
    c.is_alphabetic() || "+*/_<>=!?.:".contains(c)
}

fn is_symbol_char(c: char) -> bool {
    !c.is_whitespace() && c != '(' && c != ')' && c != '"'
}

fn looks_like_float(atom: &str) -> bool {
    let body = atom.strip_prefix('-').unwrap_or(atom);
    !body.is_empty()
        && body.chars().all(|c| c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || c == '+' || c == '-')
        && (body.contains('.') || body.contains('e') || body.contains('E'))
        && body.chars().next().map_or(false, |c| c.is_ascii_digit() || c == '.')
}
