//! Recursive-descent parser for unit expressions.
//!
//! Grammar:
//! ```text
//! Expr   := Factor (('*' | '/') Factor)*
//! Factor := Thing ('^' Integer)?
//! Thing  := '1' | '(' Expr ')' | Identifier
//! ```
//! There is no AST; productions fold directly into a [`UnitProduct`].

use super::UnitProduct;
use crate::error::{MathError, Result};

/// Glyphs allowed in identifiers beyond plain letters.
const IDENT_GLYPHS: &[char] = &['°', 'µ', 'Å'];

fn is_ident_char(c: char) -> bool {
    c.is_alphabetic() || IDENT_GLYPHS.contains(&c)
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Int(i64),
    Op(char),
    End,
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

/// One-token-lookahead lexer with explicit pushback.
struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    pushed: Option<Token>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            pushed: None,
        }
    }

    fn push_back(&mut self, token: Token) {
        debug_assert!(self.pushed.is_none());
        self.pushed = Some(token);
    }

    fn next(&mut self) -> Result<Token> {
        if let Some(token) = self.pushed.take() {
            return Ok(token);
        }
        let rest = &self.src[self.pos..];
        let skipped = rest.len() - rest.trim_start().len();
        self.pos += skipped;

        let offset = self.pos;
        let mut chars = self.src[self.pos..].chars();
        let Some(first) = chars.next() else {
            return Ok(Token {
                kind: TokenKind::End,
                offset,
            });
        };

        if is_ident_char(first) {
            let tail = self.src[self.pos..]
                .char_indices()
                .find(|(_, c)| !is_ident_char(*c))
                .map(|(i, _)| i)
                .unwrap_or(self.src.len() - self.pos);
            let name = &self.src[self.pos..self.pos + tail];
            self.pos += tail;
            return Ok(Token {
                kind: TokenKind::Ident(name.to_string()),
                offset,
            });
        }

        if first.is_ascii_digit() || first == '-' {
            let digits_start = if first == '-' { self.pos + 1 } else { self.pos };
            let tail = self.src[digits_start..]
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(self.src.len() - digits_start);
            let end = digits_start + tail;
            let value: i64 = self.src[self.pos..end]
                .parse()
                .map_err(|_| MathError::UnitParse { offset })?;
            self.pos = end;
            return Ok(Token {
                kind: TokenKind::Int(value),
                offset,
            });
        }

        // Any other character is a one-character operator token.
        self.pos += first.len_utf8();
        Ok(Token {
            kind: TokenKind::Op(first),
            offset,
        })
    }
}

/// Parse a unit expression into a [`UnitProduct`].
pub fn parse(text: &str) -> Result<UnitProduct> {
    let mut lexer = Lexer::new(text);
    let product = parse_expr(&mut lexer)?;
    let token = lexer.next()?;
    if token.kind != TokenKind::End {
        return Err(MathError::UnitParse {
            offset: token.offset,
        });
    }
    Ok(product)
}

fn parse_expr(lexer: &mut Lexer) -> Result<UnitProduct> {
    let mut acc = parse_factor(lexer)?;
    loop {
        let token = lexer.next()?;
        match token.kind {
            TokenKind::Op('*') => {
                let factor = parse_factor(lexer)?;
                acc.mul(&factor);
            }
            TokenKind::Op('/') => {
                let mut factor = parse_factor(lexer)?;
                factor.pow(-1);
                acc.mul(&factor);
            }
            _ => {
                lexer.push_back(token);
                return Ok(acc);
            }
        }
    }
}

fn parse_factor(lexer: &mut Lexer) -> Result<UnitProduct> {
    let mut thing = parse_thing(lexer)?;
    let token = lexer.next()?;
    if token.kind == TokenKind::Op('^') {
        let exponent = lexer.next()?;
        match exponent.kind {
            TokenKind::Int(n) if i32::try_from(n).is_ok() => thing.pow(n as i32),
            _ => {
                return Err(MathError::UnitParse {
                    offset: exponent.offset,
                })
            }
        }
    } else {
        lexer.push_back(token);
    }
    Ok(thing)
}

fn parse_thing(lexer: &mut Lexer) -> Result<UnitProduct> {
    let token = lexer.next()?;
    match token.kind {
        // The literal 1 is the dimensionless unit.
        TokenKind::Int(1) => Ok(UnitProduct::new()),
        TokenKind::Ident(name) => {
            let mut product = UnitProduct::new();
            product.push_term(&name, 1);
            Ok(product)
        }
        TokenKind::Op('(') => {
            let inner = parse_expr(lexer)?;
            let close = lexer.next()?;
            if close.kind == TokenKind::Op(')') {
                Ok(inner)
            } else {
                Err(MathError::UnitParse {
                    offset: close.offset,
                })
            }
        }
        _ => Err(MathError::UnitParse {
            offset: token.offset,
        }),
    }
}
