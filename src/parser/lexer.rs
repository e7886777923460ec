//! Character-level lexer for flowl source text.
//!
//! The lexer is a state machine over the raw character stream. It emits
//! [`Token`]s grouped by the source line they start on; the parser consumes
//! those groups one statement at a time.

use super::token::{Token, TokenKind};
use super::{ParseError, Result};

/// Tokens that start on one source line.
#[derive(Debug, Clone)]
pub struct TokenLine {
    /// 1-based source line number.
    pub line: usize,
    /// Tokens in source order.
    pub tokens: Vec<Token>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unknown,
    Ident,
    Symbol,
    Str,
    StrEscape,
    RefVar1,
    RefVar2,
    Comment,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::Unknown => "unknown",
            State::Ident => "ident",
            State::Symbol => "symbol",
            State::Str => "string",
            State::StrEscape => "string_backslash",
            State::RefVar1 => "refvar1",
            State::RefVar2 => "refvar2",
            State::Comment => "comment",
        }
    }
}

fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '.'
}

fn is_symbol_char(ch: char) -> bool {
    matches!(
        ch,
        '{' | '}' | '(' | ')' | ':' | '=' | '<' | '>' | '+' | '-' | '*' | '/' | '&' | '|' | '!'
    )
}

/// Lex `source` into per-line token groups.
pub fn lex(source: &str) -> Result<Vec<TokenLine>> {
    Lexer::new().run(source)
}

struct Lexer {
    state: State,
    line: usize,
    /// Line the token currently being accumulated started on.
    token_line: usize,
    buf: String,
    out: Vec<Token>,
}

impl Lexer {
    fn new() -> Self {
        Self {
            state: State::Unknown,
            line: 1,
            token_line: 1,
            buf: String::new(),
            out: Vec::new(),
        }
    }

    fn run(mut self, source: &str) -> Result<Vec<TokenLine>> {
        // A synthetic trailing newline terminates any open ident or symbol.
        for ch in source.chars().chain(std::iter::once('\n')) {
            self.step(ch)?;
            if ch == '\n' {
                self.line += 1;
            }
        }
        match self.state {
            State::Unknown => Ok(group_by_line(self.out)),
            other => Err(ParseError::Lex {
                line: self.line,
                state: other.name(),
                ch: '\n',
            }),
        }
    }

    fn step(&mut self, ch: char) -> Result<()> {
        match self.state {
            State::Unknown => self.step_unknown(ch),
            State::Ident => self.step_ident(ch),
            State::Symbol => self.step_symbol(ch),
            State::Str => {
                match ch {
                    '"' => self.emit(TokenKind::Str),
                    '\\' => self.state = State::StrEscape,
                    _ => self.buf.push(ch),
                }
                Ok(())
            }
            State::StrEscape => {
                // `\"` collapses to a quote; any other escape keeps both chars.
                if ch == '"' {
                    self.buf.push('"');
                } else {
                    self.buf.push('\\');
                    self.buf.push(ch);
                }
                self.state = State::Str;
                Ok(())
            }
            State::RefVar1 => {
                if ch == '(' {
                    self.buf.push(ch);
                    self.state = State::RefVar2;
                    Ok(())
                } else {
                    Err(self.illegal(ch))
                }
            }
            State::RefVar2 => {
                if is_ident_char(ch) {
                    self.buf.push(ch);
                    Ok(())
                } else if ch == ')' {
                    self.buf.push(ch);
                    self.emit(TokenKind::RefVar);
                    Ok(())
                } else {
                    Err(self.illegal(ch))
                }
            }
            State::Comment => {
                if ch == '\n' {
                    self.emit(TokenKind::Str);
                } else {
                    self.buf.push(ch);
                }
                Ok(())
            }
        }
    }

    fn step_unknown(&mut self, ch: char) -> Result<()> {
        if ch.is_whitespace() {
            return Ok(());
        }
        self.token_line = self.line;
        match ch {
            '"' => self.state = State::Str,
            '$' => {
                self.buf.push('$');
                self.state = State::RefVar1;
            }
            c if is_ident_char(c) => {
                self.buf.push(c);
                self.state = State::Ident;
            }
            c if is_symbol_char(c) => {
                self.buf.push(c);
                self.state = State::Symbol;
            }
            c => return Err(self.illegal(c)),
        }
        Ok(())
    }

    fn step_ident(&mut self, ch: char) -> Result<()> {
        if is_ident_char(ch) {
            self.buf.push(ch);
            return Ok(());
        }
        self.emit_ident();
        if ch.is_whitespace() {
            return Ok(());
        }
        self.step_unknown(ch)
    }

    fn step_symbol(&mut self, ch: char) -> Result<()> {
        if is_symbol_char(ch) {
            self.buf.push(ch);
            // The rest of the line after `//` is one string token.
            if self.buf == "//" {
                self.emit(TokenKind::Symbol);
                self.token_line = self.line;
                self.state = State::Comment;
            }
            return Ok(());
        }
        self.emit(TokenKind::Symbol);
        if ch.is_whitespace() {
            return Ok(());
        }
        self.step_unknown(ch)
    }

    /// Emit the buffered ident, downgrading to `number` when it parses as a
    /// float literal. Words like `inf` parse as floats but stay idents.
    fn emit_ident(&mut self) {
        let leading_digit = self
            .buf
            .chars()
            .next()
            .map(|c| c.is_ascii_digit())
            .unwrap_or(false);
        let kind = if leading_digit && self.buf.parse::<f64>().is_ok() {
            TokenKind::Number
        } else {
            TokenKind::Ident
        };
        self.emit(kind);
    }

    fn emit(&mut self, kind: TokenKind) {
        let text = std::mem::take(&mut self.buf);
        self.out.push(Token::new(text, kind, self.token_line));
        self.state = State::Unknown;
    }

    fn illegal(&self, ch: char) -> ParseError {
        ParseError::Lex {
            line: self.line,
            state: self.state.name(),
            ch,
        }
    }
}

fn group_by_line(tokens: Vec<Token>) -> Vec<TokenLine> {
    let mut lines: Vec<TokenLine> = Vec::new();
    for token in tokens {
        match lines.last_mut() {
            Some(group) if group.line == token.line => group.tokens.push(token),
            _ => lines.push(TokenLine {
                line: token.line,
                tokens: vec![token],
            }),
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(src: &str) -> Vec<Token> {
        lex(src)
            .unwrap()
            .into_iter()
            .flat_map(|l| l.tokens)
            .collect()
    }

    #[test]
    fn lexes_load_line() {
        let toks = flat("load \"go:function1\"\n");
        assert_eq!(toks.len(), 2);
        assert_eq!(toks[0].text, "load");
        assert_eq!(toks[0].kind, TokenKind::Ident);
        assert_eq!(toks[1].text, "go:function1");
        assert_eq!(toks[1].kind, TokenKind::Str);
    }

    #[test]
    fn coalesces_symbol_runs() {
        let toks = flat("a <- $(a) + 1");
        let kinds: Vec<_> = toks.iter().map(|t| (t.text.as_str(), t.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                ("a", TokenKind::Ident),
                ("<-", TokenKind::Symbol),
                ("$(a)", TokenKind::RefVar),
                ("+", TokenKind::Symbol),
                ("1", TokenKind::Number),
            ]
        );
    }

    #[test]
    fn numbers_are_classified() {
        let toks = flat("var pi = 3.14");
        assert_eq!(toks[3].kind, TokenKind::Number);
        assert_eq!(toks[3].text, "3.14");
    }

    #[test]
    fn strings_span_lines_and_keep_escapes() {
        let toks = flat("\"line one\nline \\\"two\\\"\"\n");
        assert_eq!(toks.len(), 1);
        assert_eq!(toks[0].kind, TokenKind::Str);
        assert_eq!(toks[0].text, "line one\nline \"two\"");
    }

    #[test]
    fn unknown_backslash_escape_keeps_both_chars() {
        let toks = flat(r#""a\tb""#);
        assert_eq!(toks[0].text, "a\\tb");
    }

    #[test]
    fn comment_becomes_string_token() {
        let toks = flat("// a flow description\nco f\n");
        assert_eq!(toks[0].text, "//");
        assert_eq!(toks[0].kind, TokenKind::Symbol);
        assert_eq!(toks[1].text, " a flow description");
        assert_eq!(toks[1].kind, TokenKind::Str);
    }

    #[test]
    fn dollar_requires_open_paren() {
        let err = lex("$x\n").unwrap_err();
        assert!(matches!(err, ParseError::Lex { state: "refvar1", .. }));
    }

    #[test]
    fn eof_closes_open_ident() {
        let toks = flat("abc");
        assert_eq!(toks.len(), 1);
        assert_eq!(toks[0].text, "abc");
    }

    #[test]
    fn unterminated_string_fails() {
        assert!(lex("\"oops\n").is_err());
    }

    #[test]
    fn groups_tokens_by_starting_line() {
        let lines = lex("co a\nco b\n").unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line, 1);
        assert_eq!(lines[1].line, 2);
        assert_eq!(lines[0].tokens.len(), 2);
    }
}
