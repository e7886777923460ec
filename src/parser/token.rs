//! Tokens and token validation.
//!
//! Every token carries its source text, a semantic kind, and the source line
//! it came from. Tokens whose values can embed `$(name)` references are
//! segmented into alternating literal and variable parts at upgrade time.

use std::collections::HashSet;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use super::{ParseError, Result};

/// Words that cannot be used as variable or function names.
pub static KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "load", "fn", "co", "var", "args", "for", "if", "switch", "case", "default", "event",
    ]
    .into_iter()
    .collect()
});

/// Semantic kind of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// Not yet classified.
    Unknown,
    /// Bare identifier.
    Ident,
    /// Run of symbol characters.
    Symbol,
    /// Numeric literal.
    Number,
    /// String literal (quotes stripped).
    Str,
    /// `$(name)` reference.
    RefVar,
    /// Key position of a map body entry.
    MapKey,
    /// Operator such as `=`, `<-`, `->`.
    Operator,
    /// Name of a loadable function.
    FunctionName,
    /// `driver:path[@version]` location string.
    Load,
    /// Reserved keyword.
    Keyword,
    /// Name of a variable.
    VarName,
    /// Composed expression (tail of `var`, `for`, `if`, `case`, rewrite).
    Expr,
}

impl TokenKind {
    fn pattern(self) -> &'static Regex {
        static UNKNOWN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)^.*$").unwrap());
        static IDENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.]*$").unwrap());
        static SYMBOL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[{}():=<>+\-*/&|!,]+$").unwrap());
        static NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)?$").unwrap());
        static STR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)^.*$").unwrap());
        static REFVAR: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^\$\([A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z0-9_]+)?\)$").unwrap()
        });
        static OPERATOR: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^(<-|->|==|!=|>=|<=|=|>|<|\+|-|\*|/|&&|\|\||!)$").unwrap());
        static NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());
        static LOAD: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^[A-Za-z][A-Za-z0-9_\-]*:[^@\s]+(@[A-Za-z0-9_.\-]+)?$").unwrap()
        });
        static KEYWORD: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^(load|fn|co|var|args|for|if|switch|case|default|event)$").unwrap()
        });

        match self {
            TokenKind::Unknown | TokenKind::Str | TokenKind::MapKey | TokenKind::Expr => &UNKNOWN,
            TokenKind::Ident => &IDENT,
            TokenKind::Symbol => &SYMBOL,
            TokenKind::Number => &NUMBER,
            TokenKind::RefVar => &REFVAR,
            TokenKind::Operator => &OPERATOR,
            TokenKind::FunctionName | TokenKind::VarName => &NAME,
            TokenKind::Load => &LOAD,
            TokenKind::Keyword => &KEYWORD,
        }
    }

    /// Whether keyword strings are forbidden for this kind.
    fn rejects_keywords(self) -> bool {
        matches!(
            self,
            TokenKind::FunctionName | TokenKind::VarName | TokenKind::Ident
        )
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenKind::Unknown => "unknown",
            TokenKind::Ident => "ident",
            TokenKind::Symbol => "symbol",
            TokenKind::Number => "number",
            TokenKind::Str => "string",
            TokenKind::RefVar => "refvar",
            TokenKind::MapKey => "mapkey",
            TokenKind::Operator => "operator",
            TokenKind::FunctionName => "functionname",
            TokenKind::Load => "load",
            TokenKind::Keyword => "keyword",
            TokenKind::VarName => "varname",
            TokenKind::Expr => "expr",
        };
        f.write_str(name)
    }
}

/// One alternating piece of a segmented token value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seg {
    /// Literal text, emitted verbatim.
    Lit(String),
    /// A `$(name)` or `$(name.field)` reference, parentheses stripped.
    Var(String),
}

/// A lexed token.
#[derive(Debug, Clone)]
pub struct Token {
    /// Source text. Strings are stored without their surrounding quotes.
    pub text: String,
    /// Semantic kind, upgraded by the parser from the lexer's raw kind.
    pub kind: TokenKind,
    /// 1-based source line.
    pub line: usize,
    /// Alternating literal/variable parts, filled for string and expr values.
    pub segments: Vec<Seg>,
}

impl Token {
    /// Construct a token with no segmentation.
    pub fn new(text: impl Into<String>, kind: TokenKind, line: usize) -> Self {
        Self {
            text: text.into(),
            kind,
            line,
            segments: Vec::new(),
        }
    }

    /// An empty placeholder token for unused header slots.
    pub fn empty() -> Self {
        Self::new("", TokenKind::Unknown, 0)
    }

    /// Whether the token is an empty placeholder.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Validate the token text against the pattern of `kind`, then adopt it.
    ///
    /// Keyword strings are rejected where a function name, variable name, or
    /// ident is required.
    pub fn upgrade(&mut self, kind: TokenKind) -> Result<()> {
        if kind.rejects_keywords() && KEYWORDS.contains(self.text.as_str()) {
            return Err(ParseError::KeywordAsName {
                line: self.line,
                kind,
                text: self.text.clone(),
            });
        }
        if !kind.pattern().is_match(&self.text) {
            return Err(ParseError::TokenPattern {
                line: self.line,
                kind,
                text: self.text.clone(),
            });
        }
        self.kind = kind;
        Ok(())
    }

    /// Re-check that the current kind still accepts the text.
    pub fn validate(&self) -> Result<()> {
        if !self.kind.pattern().is_match(&self.text) {
            return Err(ParseError::TokenPattern {
                line: self.line,
                kind: self.kind,
                text: self.text.clone(),
            });
        }
        Ok(())
    }

    /// Split the token text into literal / `$(name)` segments.
    ///
    /// A backslash immediately before `$(` escapes the reference and emits a
    /// literal `$(`. References with more than one `.`-separated field are
    /// rejected as malformed.
    pub fn resolve_segments(&mut self) -> Result<()> {
        self.segments = segment(&self.text)?;
        Ok(())
    }

    /// Names referenced by this token's segments.
    pub fn referenced_vars(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|seg| match seg {
            Seg::Var(name) => Some(name.as_str()),
            Seg::Lit(_) => None,
        })
    }

    /// Whether any segment is a variable reference.
    pub fn has_refs(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Seg::Var(_)))
    }
}

/// Scan `text` into alternating literal/variable segments.
pub fn segment(text: &str) -> Result<Vec<Seg>> {
    let mut segs = Vec::new();
    let mut lit = String::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if ch == '\\' && i + 2 < chars.len() && chars[i + 1] == '$' && chars[i + 2] == '(' {
            lit.push_str("$(");
            i += 3;
            continue;
        }
        if ch == '$' && i + 1 < chars.len() && chars[i + 1] == '(' {
            let close = chars[i + 2..]
                .iter()
                .position(|&c| c == ')')
                .map(|p| p + i + 2);
            if let Some(end) = close {
                let name: String = chars[i + 2..end].iter().collect();
                if name.matches('.').count() > 1 {
                    return Err(ParseError::MalformedFieldPath {
                        text: format!("$({name})"),
                    });
                }
                if !lit.is_empty() {
                    segs.push(Seg::Lit(std::mem::take(&mut lit)));
                }
                segs.push(Seg::Var(name));
                i = end + 1;
                continue;
            }
        }
        lit.push(ch);
        i += 1;
    }
    if !lit.is_empty() {
        segs.push(Seg::Lit(lit));
    }
    Ok(segs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_split_literals_and_refs() {
        let segs = segment("a $(b) c $(d.e)").unwrap();
        assert_eq!(
            segs,
            vec![
                Seg::Lit("a ".into()),
                Seg::Var("b".into()),
                Seg::Lit(" c ".into()),
                Seg::Var("d.e".into()),
            ]
        );
    }

    #[test]
    fn backslash_escapes_reference() {
        let segs = segment(r"\$(x) stays").unwrap();
        assert_eq!(segs, vec![Seg::Lit("$(x) stays".into())]);
    }

    #[test]
    fn deep_field_path_is_malformed() {
        assert!(matches!(
            segment("$(a.b.c)"),
            Err(ParseError::MalformedFieldPath { .. })
        ));
    }

    #[test]
    fn keyword_rejected_as_varname() {
        let mut tok = Token::new("for", TokenKind::Ident, 3);
        assert!(matches!(
            tok.upgrade(TokenKind::VarName),
            Err(ParseError::KeywordAsName { .. })
        ));
    }

    #[test]
    fn number_pattern() {
        let mut tok = Token::new("3.14", TokenKind::Ident, 1);
        tok.upgrade(TokenKind::Number).unwrap();
        let mut bad = Token::new("3.1.4", TokenKind::Ident, 1);
        assert!(bad.upgrade(TokenKind::Number).is_err());
    }

    #[test]
    fn load_location_pattern() {
        let mut tok = Token::new("go:function1", TokenKind::Str, 1);
        tok.upgrade(TokenKind::Load).unwrap();
        let mut versioned = Token::new("shell:/tmp/f.sh@v1.2", TokenKind::Str, 1);
        versioned.upgrade(TokenKind::Load).unwrap();
        let mut bad = Token::new("nodriver", TokenKind::Str, 1);
        assert!(bad.upgrade(TokenKind::Load).is_err());
    }
}
