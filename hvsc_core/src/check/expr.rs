//! Restricted boolean expression language.
//!
//! Conditions are written in a small Python-flavoured grammar:
//! arithmetic (`+ - * / %`), chained comparisons
//! (`0 <= x.vset <= 300`), boolean `and`/`or`/`not`, string and
//! numeric literals, and calls to a fixed builtin set
//! (`abs`, `int`, `float`, `str`, `bool`). Identifiers are dotted
//! channel attributes (`gemtop.vset`) or bare channel names; they are
//! resolved at evaluation time through a [`Bindings`] source, never at
//! parse time.
//!
//! Name resolution is strict: before an expression is evaluated, every
//! identifier it mentions must resolve, including ones a short-circuit
//! would skip. A typo in a condition is a hard error, never a silently
//! passing check.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Builtin functions callable from a condition.
pub const BUILTINS: &[&str] = &["abs", "int", "float", "str", "bool"];

/// Parse failure, reported with the byte offset it occurred at.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message} at offset {offset}")]
pub struct ParseError {
    pub message: String,
    pub offset: usize,
}

impl ParseError {
    fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

/// Evaluation failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    /// An identifier did not resolve to a bound value.
    #[error("name '{0}' is not defined")]
    Name(String),
    /// An operation was applied to an unsuitable value.
    #[error("type error: {0}")]
    Type(String),
    /// Resolving a live value failed at the hardware facade.
    #[error("read failed: {0}")]
    Read(String),
}

// ─── Values ─────────────────────────────────────────────────────────

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Num(f64),
    Bool(bool),
    Str(String),
}

impl Value {
    /// Truth of a value, Python-style: zero, false and the empty
    /// string are falsy, everything else truthy.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Num(n) => *n != 0.0,
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty(),
        }
    }

    /// Numeric view; booleans coerce to 0/1, strings do not coerce.
    fn as_num(&self) -> Result<f64, EvalError> {
        match self {
            Value::Num(n) => Ok(*n),
            Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::Str(s) => Err(EvalError::Type(format!("'{s}' is not a number"))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Num(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Str(s) => write!(f, "{s}"),
        }
    }
}

/// Source of identifier values at evaluation time.
pub trait Bindings {
    fn resolve(&self, ident: &str) -> Result<Value, EvalError>;

    /// Check that `ident` would resolve, without needing its value.
    fn validate(&self, ident: &str) -> Result<(), EvalError> {
        self.resolve(ident).map(|_| ())
    }
}

impl Bindings for BTreeMap<String, Value> {
    fn resolve(&self, ident: &str) -> Result<Value, EvalError> {
        self.get(ident)
            .cloned()
            .ok_or_else(|| EvalError::Name(ident.to_string()))
    }
}

// ─── AST ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

/// Parsed condition tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Str(String),
    Bool(bool),
    Ident(String),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// Chained comparison: `a < b <= c` holds pairwise.
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
    Call(String, Vec<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    /// Parse a condition.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let tokens = lex(text)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or_expr()?;
        if let Some(tok) = parser.peek() {
            return Err(ParseError::new(
                format!("unexpected trailing input '{}'", tok.text()),
                tok.offset(),
            ));
        }
        Ok(expr)
    }

    /// Every identifier and called name the expression mentions.
    pub fn names(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_names(&mut out);
        out.sort();
        out.dedup();
        out
    }

    fn collect_names(&self, out: &mut Vec<String>) {
        match self {
            Expr::Num(_) | Expr::Str(_) | Expr::Bool(_) => {}
            Expr::Ident(name) => out.push(name.clone()),
            Expr::Neg(e) | Expr::Not(e) => e.collect_names(out),
            Expr::Binary(_, a, b) => {
                a.collect_names(out);
                b.collect_names(out);
            }
            Expr::Compare(first, rest) => {
                first.collect_names(out);
                for (_, e) in rest {
                    e.collect_names(out);
                }
            }
            Expr::Call(name, args) => {
                out.push(name.clone());
                for a in args {
                    a.collect_names(out);
                }
            }
            Expr::And(parts) | Expr::Or(parts) => {
                for e in parts {
                    e.collect_names(out);
                }
            }
        }
    }

    /// Evaluate against `bindings`, validating the full name set first
    /// so short-circuiting never hides an unbound identifier.
    pub fn eval(&self, bindings: &dyn Bindings) -> Result<Value, EvalError> {
        for name in self.names() {
            if BUILTINS.contains(&name.as_str()) {
                continue;
            }
            bindings.validate(&name)?;
        }
        self.eval_inner(bindings)
    }

    fn eval_inner(&self, bindings: &dyn Bindings) -> Result<Value, EvalError> {
        match self {
            Expr::Num(n) => Ok(Value::Num(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Ident(name) => bindings.resolve(name),
            Expr::Neg(e) => Ok(Value::Num(-e.eval_inner(bindings)?.as_num()?)),
            Expr::Binary(op, a, b) => {
                let a = a.eval_inner(bindings)?.as_num()?;
                let b = b.eval_inner(bindings)?.as_num()?;
                let out = match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => a / b,
                    BinOp::Rem => a % b,
                };
                Ok(Value::Num(out))
            }
            Expr::Compare(first, rest) => {
                let mut left = first.eval_inner(bindings)?;
                for (op, right_expr) in rest {
                    let right = right_expr.eval_inner(bindings)?;
                    if !compare(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::Call(name, args) => call_builtin(name, args, bindings),
            Expr::And(parts) => {
                // Python returns the deciding operand, not a bool.
                let mut last = Value::Bool(true);
                for e in parts {
                    last = e.eval_inner(bindings)?;
                    if !last.truthy() {
                        return Ok(last);
                    }
                }
                Ok(last)
            }
            Expr::Or(parts) => {
                let mut last = Value::Bool(false);
                for e in parts {
                    last = e.eval_inner(bindings)?;
                    if last.truthy() {
                        return Ok(last);
                    }
                }
                Ok(last)
            }
            Expr::Not(e) => Ok(Value::Bool(!e.eval_inner(bindings)?.truthy())),
        }
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, EvalError> {
    use CmpOp::*;
    // Equality across incompatible types is false, never an error;
    // ordering across incompatible types is a type error.
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Ok(match op {
            Lt => a < b,
            Le => a <= b,
            Gt => a > b,
            Ge => a >= b,
            Eq => a == b,
            Ne => a != b,
        }),
        (Value::Str(_), _) | (_, Value::Str(_)) => match op {
            Eq => Ok(false),
            Ne => Ok(true),
            _ => Err(EvalError::Type(format!(
                "cannot order {left} against {right}"
            ))),
        },
        _ => {
            let a = left.as_num()?;
            let b = right.as_num()?;
            Ok(match op {
                Lt => a < b,
                Le => a <= b,
                Gt => a > b,
                Ge => a >= b,
                Eq => a == b,
                Ne => a != b,
            })
        }
    }
}

fn call_builtin(name: &str, args: &[Expr], bindings: &dyn Bindings) -> Result<Value, EvalError> {
    if !BUILTINS.contains(&name) {
        return Err(EvalError::Name(name.to_string()));
    }
    if args.len() != 1 {
        return Err(EvalError::Type(format!(
            "{name}() takes exactly one argument"
        )));
    }
    let arg = args[0].eval_inner(bindings)?;
    match name {
        "abs" => Ok(Value::Num(arg.as_num()?.abs())),
        "int" => match &arg {
            Value::Str(s) => s
                .trim()
                .parse::<i64>()
                .map(|n| Value::Num(n as f64))
                .map_err(|_| EvalError::Type(format!("int() cannot parse '{s}'"))),
            _ => Ok(Value::Num(arg.as_num()?.trunc())),
        },
        "float" => match &arg {
            Value::Str(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Num)
                .map_err(|_| EvalError::Type(format!("float() cannot parse '{s}'"))),
            _ => Ok(Value::Num(arg.as_num()?)),
        },
        "str" => Ok(Value::Str(arg.to_string())),
        "bool" => Ok(Value::Bool(arg.truthy())),
        _ => unreachable!("builtin set checked above"),
    }
}

// ─── Lexer ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Str(String),
    Ident(String),
    And,
    Or,
    Not,
    True,
    False,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,
    LParen,
    RParen,
    Comma,
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    tok: Tok,
    offset: usize,
}

impl Token {
    fn offset(&self) -> usize {
        self.offset
    }

    fn text(&self) -> String {
        match &self.tok {
            Tok::Num(n) => n.to_string(),
            Tok::Str(s) => format!("'{s}'"),
            Tok::Ident(s) => s.clone(),
            Tok::And => "and".into(),
            Tok::Or => "or".into(),
            Tok::Not => "not".into(),
            Tok::True => "True".into(),
            Tok::False => "False".into(),
            Tok::Plus => "+".into(),
            Tok::Minus => "-".into(),
            Tok::Star => "*".into(),
            Tok::Slash => "/".into(),
            Tok::Percent => "%".into(),
            Tok::Lt => "<".into(),
            Tok::Le => "<=".into(),
            Tok::Gt => ">".into(),
            Tok::Ge => ">=".into(),
            Tok::EqEq => "==".into(),
            Tok::Ne => "!=".into(),
            Tok::LParen => "(".into(),
            Tok::RParen => ")".into(),
            Tok::Comma => ",".into(),
        }
    }
}

fn lex(text: &str) -> Result<Vec<Token>, ParseError> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        let offset = i;
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
            }
            '(' => {
                out.push(Token { tok: Tok::LParen, offset });
                i += 1;
            }
            ')' => {
                out.push(Token { tok: Tok::RParen, offset });
                i += 1;
            }
            ',' => {
                out.push(Token { tok: Tok::Comma, offset });
                i += 1;
            }
            '+' => {
                out.push(Token { tok: Tok::Plus, offset });
                i += 1;
            }
            '-' => {
                out.push(Token { tok: Tok::Minus, offset });
                i += 1;
            }
            '*' => {
                out.push(Token { tok: Tok::Star, offset });
                i += 1;
            }
            '/' => {
                out.push(Token { tok: Tok::Slash, offset });
                i += 1;
            }
            '%' => {
                out.push(Token { tok: Tok::Percent, offset });
                i += 1;
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push(Token { tok: Tok::Le, offset });
                    i += 2;
                } else {
                    out.push(Token { tok: Tok::Lt, offset });
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push(Token { tok: Tok::Ge, offset });
                    i += 2;
                } else {
                    out.push(Token { tok: Tok::Gt, offset });
                    i += 1;
                }
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push(Token { tok: Tok::EqEq, offset });
                    i += 2;
                } else {
                    return Err(ParseError::new("assignment is not allowed", offset));
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push(Token { tok: Tok::Ne, offset });
                    i += 2;
                } else {
                    return Err(ParseError::new("unexpected '!'", offset));
                }
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < bytes.len() && bytes[j] as char != quote {
                    j += 1;
                }
                if j >= bytes.len() {
                    return Err(ParseError::new("unterminated string literal", offset));
                }
                out.push(Token {
                    tok: Tok::Str(text[start..j].to_string()),
                    offset,
                });
                i = j + 1;
            }
            '0'..='9' => {
                let mut j = i;
                let mut seen_dot = false;
                while j < bytes.len() {
                    match bytes[j] as char {
                        '0'..='9' => j += 1,
                        '.' if !seen_dot => {
                            seen_dot = true;
                            j += 1;
                        }
                        _ => break,
                    }
                }
                let num: f64 = text[i..j]
                    .parse()
                    .map_err(|_| ParseError::new("malformed number", offset))?;
                out.push(Token {
                    tok: Tok::Num(num),
                    offset,
                });
                i = j;
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let mut j = i;
                while j < bytes.len() {
                    let c = bytes[j] as char;
                    if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                        j += 1;
                    } else {
                        break;
                    }
                }
                let word = &text[i..j];
                let tok = match word {
                    "and" => Tok::And,
                    "or" => Tok::Or,
                    "not" => Tok::Not,
                    "True" => Tok::True,
                    "False" => Tok::False,
                    _ => Tok::Ident(word.to_string()),
                };
                out.push(Token { tok, offset });
                i = j;
            }
            _ => {
                return Err(ParseError::new(format!("unexpected character '{c}'"), offset));
            }
        }
    }
    Ok(out)
}

// ─── Parser ─────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_tok(&self) -> Option<&Tok> {
        self.peek().map(|t| &t.tok)
    }

    fn bump(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, want: Tok, what: &str) -> Result<(), ParseError> {
        match self.bump() {
            Some(t) if t.tok == want => Ok(()),
            Some(t) => Err(ParseError::new(
                format!("expected {what}, found '{}'", t.text()),
                t.offset,
            )),
            None => Err(ParseError::new(
                format!("expected {what}, found end of input"),
                self.end_offset(),
            )),
        }
    }

    fn end_offset(&self) -> usize {
        self.tokens.last().map(|t| t.offset + 1).unwrap_or(0)
    }

    fn or_expr(&mut self) -> Result<Expr, ParseError> {
        let first = self.and_expr()?;
        if self.peek_tok() != Some(&Tok::Or) {
            return Ok(first);
        }
        let mut parts = vec![first];
        while self.peek_tok() == Some(&Tok::Or) {
            self.bump();
            parts.push(self.and_expr()?);
        }
        Ok(Expr::Or(parts))
    }

    fn and_expr(&mut self) -> Result<Expr, ParseError> {
        let first = self.not_expr()?;
        if self.peek_tok() != Some(&Tok::And) {
            return Ok(first);
        }
        let mut parts = vec![first];
        while self.peek_tok() == Some(&Tok::And) {
            self.bump();
            parts.push(self.not_expr()?);
        }
        Ok(Expr::And(parts))
    }

    fn not_expr(&mut self) -> Result<Expr, ParseError> {
        if self.peek_tok() == Some(&Tok::Not) {
            self.bump();
            return Ok(Expr::Not(Box::new(self.not_expr()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let first = self.arith()?;
        let mut chain = Vec::new();
        loop {
            let op = match self.peek_tok() {
                Some(Tok::Lt) => CmpOp::Lt,
                Some(Tok::Le) => CmpOp::Le,
                Some(Tok::Gt) => CmpOp::Gt,
                Some(Tok::Ge) => CmpOp::Ge,
                Some(Tok::EqEq) => CmpOp::Eq,
                Some(Tok::Ne) => CmpOp::Ne,
                _ => break,
            };
            self.bump();
            chain.push((op, self.arith()?));
        }
        if chain.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare(Box::new(first), chain))
        }
    }

    fn arith(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek_tok() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek_tok() {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                Some(Tok::Percent) => BinOp::Rem,
                _ => break,
            };
            self.bump();
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        match self.peek_tok() {
            Some(Tok::Minus) => {
                self.bump();
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Tok::Plus) => {
                self.bump();
                self.unary()
            }
            _ => self.atom(),
        }
    }

    fn atom(&mut self) -> Result<Expr, ParseError> {
        let Some(token) = self.bump() else {
            return Err(ParseError::new(
                "expected expression, found end of input",
                self.end_offset(),
            ));
        };
        match token.tok {
            Tok::Num(n) => Ok(Expr::Num(n)),
            Tok::Str(s) => Ok(Expr::Str(s)),
            Tok::True => Ok(Expr::Bool(true)),
            Tok::False => Ok(Expr::Bool(false)),
            Tok::LParen => {
                let inner = self.or_expr()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(inner)
            }
            Tok::Ident(name) => {
                if self.peek_tok() == Some(&Tok::LParen) {
                    self.bump();
                    let mut args = Vec::new();
                    if self.peek_tok() != Some(&Tok::RParen) {
                        loop {
                            args.push(self.or_expr()?);
                            if self.peek_tok() == Some(&Tok::Comma) {
                                self.bump();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(Tok::RParen, "')'")?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            other => Err(ParseError::new(
                format!("expected expression, found '{}'", Token { tok: other, offset: token.offset }.text()),
                token.offset,
            )),
        }
    }
}
