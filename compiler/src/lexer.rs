// Tokens of the textual module format.
//
// `%`-sigiled names, shapes such as `f32[2,3]{1,0}` and attribute lists all
// break down into the handful of tokens below. Whitespace and both comment
// styles are skipped. Characters outside the token set are collected as
// spans; the parser turns them into diagnostics so the rest of the file is
// still checked.

use logos::Logos;
use std::fmt;

use crate::ast::Span;

/// Lexer output. `unknown` holds the span of every character that matched
/// no token.
#[derive(Debug, Default)]
pub struct Lexed {
    pub tokens: Vec<(Token, Span)>,
    pub unknown: Vec<Span>,
}

/// A token of module text. `Name` drops the `%`; `Ident` and `Float` are
/// read back from the source through their span.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+|//[^\n]*|/\*([^*]|\*+[^*/])*\*+/")]
pub enum Token {
    // ── Keywords ──
    #[token("HloModule")]
    HloModule,
    #[token("ENTRY")]
    Entry,
    #[token("ROOT")]
    Root,

    // ── Symbols ──
    #[token("->")]
    Arrow,
    #[token(":")]
    Colon,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token("=")]
    Equals,

    // ── Names ──
    /// Instruction or computation reference: `%fusion.1`.
    #[regex(r"%[A-Za-z_][A-Za-z0-9_.\-]*", |lex| lex.slice()[1..].to_string())]
    Name(String),

    // ── Literals ──
    /// Float literal; must precede Int so the longer match wins.
    #[regex(r"-?[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?")]
    Float,

    /// Integer literal (dimensions, indices, parameter numbers).
    #[regex(r"-?[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    /// String literal with `\"` and `\\` escapes.
    #[regex(r#""([^"\\]|\\.)*""#, unquote)]
    Str(String),

    // ── Identifier ──
    //
    // Opcodes (`get-tuple-element`), attribute keys (`control-predecessors`),
    // element types and enum values all lex as identifiers.
    /// Identifier: `[a-zA-Z_][a-zA-Z0-9_.-]*`
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_.\-]*")]
    Ident,
}

impl Token {
    /// Fixed spelling of keyword and punctuation tokens.
    fn fixed_text(&self) -> Option<&'static str> {
        Some(match self {
            Token::HloModule => "HloModule",
            Token::Entry => "ENTRY",
            Token::Root => "ROOT",
            Token::Arrow => "->",
            Token::Colon => ":",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::Comma => ",",
            Token::Equals => "=",
            _ => return None,
        })
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(text) = self.fixed_text() {
            return f.write_str(text);
        }
        match self {
            Token::Name(n) => write!(f, "%{n}"),
            Token::Int(v) => write!(f, "{v}"),
            Token::Str(s) => write!(f, "{s:?}"),
            Token::Float => f.write_str("floating-point literal"),
            _ => f.write_str("identifier"),
        }
    }
}

/// Body of a quoted literal. Only `\"` and `\\` are escapes; anything else
/// after a backslash rejects the token.
fn unquote(lex: &mut logos::Lexer<'_, Token>) -> Option<String> {
    let body = lex.slice().strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(body.len());
    let mut escaped = false;
    for c in body.chars() {
        match (escaped, c) {
            (false, '\\') => escaped = true,
            (false, c) => out.push(c),
            (true, '"' | '\\') => {
                out.push(c);
                escaped = false;
            }
            (true, _) => return None,
        }
    }
    Some(out)
}

/// Tokenize `source`. Never stops early: unknown characters are recorded in
/// [`Lexed::unknown`] and skipped.
pub fn lex(source: &str) -> Lexed {
    let mut lexed = Lexed::default();
    for (token, range) in Token::lexer(source).spanned() {
        let span = Span::from(range);
        match token {
            Ok(token) => lexed.tokens.push((token, span)),
            Err(()) => lexed.unknown.push(span),
        }
    }
    lexed
}

// ── Tests ──
