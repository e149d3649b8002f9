//! Formula lexing, dependency extraction, syntax validation and parsing.
//!
//! Formulas are a restricted arithmetic grammar:
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := ('+' | '-') unary | primary
//! primary := NUMBER | IDENT | IDENT '(' args ')' | '(' expr ')'
//! ```
//!
//! Only the functions in [`FUNCTIONS`] may be called. Dependency extraction
//! ([`extract_variables`]) is purely lexical and never fails; every identifier that is not a
//! known function name counts as a variable reference, even when it is used with call syntax.

use std::collections::BTreeSet;
use std::fmt;

/// The fixed function vocabulary.
pub const FUNCTIONS: &[&str] = &[
    "sin", "cos", "tan", "sqrt", "pow", "abs", "round", "floor", "ceil", "min", "max",
];

/// Deepest allowed nesting of parentheses, call argument lists and unary signs.
pub const MAX_NESTING_DEPTH: usize = 256;

/// Tallest allowed expression tree. Long operator chains nest to the left, one level per operator.
pub const MAX_EXPR_DEPTH: usize = 1024;

#[must_use]
pub fn is_function_name(name: &str) -> bool {
    FUNCTIONS.contains(&name)
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Call { name: String, args: Vec<Expr> },
    Unary { op: UnaryOp, expr: Box<Expr> },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Negate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Number(f64),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
    /// A character outside the formula alphabet. Kept so lexing never fails.
    Unknown(char),
}

impl TokenKind {
    fn is_binary_operator(&self) -> bool {
        matches!(
            self,
            TokenKind::Plus | TokenKind::Minus | TokenKind::Star | TokenKind::Slash
        )
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(name) => write!(f, "identifier `{name}`"),
            TokenKind::Number(n) => write!(f, "number `{n}`"),
            TokenKind::Plus => f.write_str("`+`"),
            TokenKind::Minus => f.write_str("`-`"),
            TokenKind::Star => f.write_str("`*`"),
            TokenKind::Slash => f.write_str("`/`"),
            TokenKind::LParen => f.write_str("`(`"),
            TokenKind::RParen => f.write_str("`)`"),
            TokenKind::Comma => f.write_str("`,`"),
            TokenKind::Unknown(c) => write!(f, "unexpected character {c:?}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Character offset of the token start.
    pub offset: usize,
}

/// Syntax error produced by [`check_formula`] / [`parse_formula`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntaxError {
    pub message: String,
    pub offset: usize,
}

impl SyntaxError {
    fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.message, self.offset)
    }
}

impl std::error::Error for SyntaxError {}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    offset: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
            offset: 0,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        self.offset += 1;
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn consume_while<F>(&mut self, mut predicate: F) -> String
    where
        F: FnMut(char) -> bool,
    {
        let mut buf = String::new();
        while let Some(ch) = self.peek() {
            if !predicate(ch) {
                break;
            }
            buf.push(ch);
            self.bump();
        }
        buf
    }

    fn next_token(&mut self) -> Option<Token> {
        self.consume_while(char::is_whitespace);
        let offset = self.offset;
        let ch = self.peek()?;

        let kind = match ch {
            '+' | '-' | '*' | '/' | '(' | ')' | ',' => {
                self.bump();
                match ch {
                    '+' => TokenKind::Plus,
                    '-' => TokenKind::Minus,
                    '*' => TokenKind::Star,
                    '/' => TokenKind::Slash,
                    '(' => TokenKind::LParen,
                    ')' => TokenKind::RParen,
                    _ => TokenKind::Comma,
                }
            }
            c if c.is_ascii_digit() || c == '.' => self.lex_number(),
            c if is_ident_start(c) => TokenKind::Ident(self.consume_while(is_ident_part)),
            other => {
                self.bump();
                TokenKind::Unknown(other)
            }
        };

        Some(Token { kind, offset })
    }

    /// Integer or decimal literal: `12`, `3.5`, `.5`, `4.`.
    fn lex_number(&mut self) -> TokenKind {
        let mut seen_dot = false;
        let text = self.consume_while(|c| {
            if c == '.' {
                if seen_dot {
                    return false;
                }
                seen_dot = true;
                return true;
            }
            c.is_ascii_digit()
        });
        match text.parse::<f64>() {
            Ok(n) => TokenKind::Number(n),
            // A lone `.` is the only digit-free spelling that reaches here.
            Err(_) => TokenKind::Unknown('.'),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_part(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Tokenize a formula. Never fails: characters outside the alphabet become
/// [`TokenKind::Unknown`].
#[must_use]
pub fn lex(formula: &str) -> Vec<Token> {
    let mut lexer = Lexer::new(formula);
    let mut out = Vec::new();
    while let Some(token) = lexer.next_token() {
        out.push(token);
    }
    out
}

/// Collect the distinct variable names referenced by `formula`.
///
/// Empty or whitespace-only formulas and bare literals yield an empty set.
#[must_use]
pub fn extract_variables(formula: &str) -> BTreeSet<String> {
    lex(formula)
        .into_iter()
        .filter_map(|token| match token.kind {
            TokenKind::Ident(name) if !is_function_name(&name) => Some(name),
            _ => None,
        })
        .collect()
}

/// Returns `true` when `formula` passes [`check_formula`].
#[must_use]
pub fn validate_formula(formula: &str) -> bool {
    check_formula(formula).is_ok()
}

/// Syntax validation.
///
/// Checks, in order: characters outside the alphabet, balanced parentheses, adjacent binary
/// operators (a `+`/`-` directly after another operator is a unary sign and is accepted), calls
/// to functions outside [`FUNCTIONS`], and finally that the whole formula parses.
pub fn check_formula(formula: &str) -> Result<(), SyntaxError> {
    let tokens = lex(formula);

    if let Some(token) = tokens
        .iter()
        .find(|t| matches!(t.kind, TokenKind::Unknown(_)))
    {
        return Err(SyntaxError::new(token.kind.to_string(), token.offset));
    }

    let mut depth = 0usize;
    for token in &tokens {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    SyntaxError::new("unmatched closing parenthesis", token.offset)
                })?;
            }
            _ => {}
        }
    }
    if depth > 0 {
        return Err(SyntaxError::new(
            format!("{depth} unclosed parenthesis"),
            formula.chars().count(),
        ));
    }

    for pair in tokens.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if prev.kind.is_binary_operator()
            && matches!(next.kind, TokenKind::Star | TokenKind::Slash)
        {
            return Err(SyntaxError::new(
                format!("adjacent operators {} and {}", prev.kind, next.kind),
                next.offset,
            ));
        }
        if let (TokenKind::Ident(name), TokenKind::LParen) = (&prev.kind, &next.kind) {
            if !is_function_name(name) {
                return Err(SyntaxError::new(
                    format!("unknown function `{name}`"),
                    prev.offset,
                ));
            }
        }
    }

    Parser::new(tokens, formula.chars().count()).parse().map(|_| ())
}

/// Parse a formula into an [`Expr`].
pub fn parse_formula(formula: &str) -> Result<Expr, SyntaxError> {
    Parser::new(lex(formula), formula.chars().count()).parse()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>, end: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            end,
            depth: 0,
        }
    }

    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |t| t.offset)
    }

    fn bump(&mut self) -> Option<TokenKind> {
        let token = self.tokens.get(self.pos)?.kind.clone();
        self.pos += 1;
        Some(token)
    }

    fn expect(&mut self, expected: TokenKind) -> Result<(), SyntaxError> {
        match self.peek() {
            Some(kind) if *kind == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(kind) => Err(SyntaxError::new(
                format!("expected {expected}, found {kind}"),
                self.offset(),
            )),
            None => Err(SyntaxError::new(
                format!("expected {expected}, found end of formula"),
                self.end,
            )),
        }
    }

    fn enter(&mut self, offset: usize) -> Result<(), SyntaxError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(SyntaxError::new(
                format!("expression nesting exceeds the limit of {MAX_NESTING_DEPTH}"),
                offset,
            ));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn parse(&mut self) -> Result<Expr, SyntaxError> {
        if self.tokens.is_empty() {
            return Err(SyntaxError::new("empty formula", 0));
        }
        let (expr, _) = self.parse_expr(0)?;
        if let Some(kind) = self.peek() {
            return Err(SyntaxError::new(
                format!("unexpected {kind}"),
                self.offset(),
            ));
        }
        Ok(expr)
    }

    /// Returns the expression together with the height of its tree.
    fn parse_expr(&mut self, min_prec: u8) -> Result<(Expr, usize), SyntaxError> {
        let (mut left, mut height) = self.parse_prefix()?;
        while let Some((op, prec)) = self.infix_binding_power() {
            if prec < min_prec {
                break;
            }
            let offset = self.offset();
            self.bump();
            let (right, right_height) = self.parse_expr(prec + 1)?;
            height = grow(height.max(right_height), offset)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok((left, height))
    }

    fn parse_unary(&mut self, op: UnaryOp, offset: usize) -> Result<(Expr, usize), SyntaxError> {
        self.enter(offset)?;
        let (expr, height) = self.parse_expr(3)?;
        self.leave();
        let expr = Expr::Unary {
            op,
            expr: Box::new(expr),
        };
        Ok((expr, grow(height, offset)?))
    }

    fn parse_prefix(&mut self) -> Result<(Expr, usize), SyntaxError> {
        let offset = self.offset();
        match self.bump() {
            Some(TokenKind::Number(n)) => Ok((Expr::Number(n), 1)),
            Some(TokenKind::Minus) => self.parse_unary(UnaryOp::Negate, offset),
            Some(TokenKind::Plus) => self.parse_unary(UnaryOp::Plus, offset),
            Some(TokenKind::LParen) => {
                self.enter(offset)?;
                let inner = self.parse_expr(0)?;
                self.expect(TokenKind::RParen)?;
                self.leave();
                Ok(inner)
            }
            Some(TokenKind::Ident(name)) => {
                if self.peek() != Some(&TokenKind::LParen) {
                    return Ok((Expr::Variable(name), 1));
                }
                self.bump();
                self.enter(offset)?;
                let mut args = Vec::new();
                let mut height = 0;
                if self.peek() != Some(&TokenKind::RParen) {
                    loop {
                        let (arg, arg_height) = self.parse_expr(0)?;
                        height = height.max(arg_height);
                        args.push(arg);
                        if self.peek() == Some(&TokenKind::Comma) {
                            self.bump();
                            continue;
                        }
                        break;
                    }
                }
                self.expect(TokenKind::RParen)?;
                self.leave();
                Ok((Expr::Call { name, args }, grow(height, offset)?))
            }
            Some(other) => Err(SyntaxError::new(
                format!("unexpected {other} in expression"),
                offset,
            )),
            None => Err(SyntaxError::new("unexpected end of formula", self.end)),
        }
    }

    fn infix_binding_power(&self) -> Option<(BinaryOp, u8)> {
        match self.peek()? {
            TokenKind::Plus => Some((BinaryOp::Add, 1)),
            TokenKind::Minus => Some((BinaryOp::Subtract, 1)),
            TokenKind::Star => Some((BinaryOp::Multiply, 2)),
            TokenKind::Slash => Some((BinaryOp::Divide, 2)),
            _ => None,
        }
    }
}

/// Height of a node sitting on top of a subtree of `height`.
fn grow(height: usize, offset: usize) -> Result<usize, SyntaxError> {
    let height = height + 1;
    if height > MAX_EXPR_DEPTH {
        return Err(SyntaxError::new(
            format!("expression depth exceeds the limit of {MAX_EXPR_DEPTH}"),
            offset,
        ));
    }
    Ok(height)
}
