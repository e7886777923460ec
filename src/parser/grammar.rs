//! Parser state machine: token lines in, block tree out.
//!
//! For each statement the parser selects a pattern from the current state,
//! validates token counts, kinds and literal values, upgrades token kinds to
//! their semantic meaning, resolves variable segments, and emits blocks.
//! Multi-token expression tails are composed into a single `expr` token.
//! After the scan a validation pass checks fn/co usage, reference
//! resolvability, and variable-table acyclicity.

use std::collections::HashMap;

use super::block::{Ast, Block, BlockId, BlockKind, Body, Statement, StatementKind};
use super::lexer::lex;
use super::token::{Token, TokenKind};
use super::vars::{
    RESERVED_CONDITION_VAR, VarNode, detect_cycle_from, resolve_children, resolve_ref,
};
use super::{ParseError, Result};

/// Built-in directives usable as statements.
pub const DIRECTIVES: [&str; 4] = ["sleep", "println", "exit", "if_none_exit"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Global,
    CoBody,
    FnBody,
    ArgsBody,
    ForBody,
    IfBody,
    SwitchBody,
    CaseBody,
    DefaultBody,
    EventBody,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::Global => "global",
            State::CoBody => "co_body",
            State::FnBody => "fn_body",
            State::ArgsBody => "args_body",
            State::ForBody => "for_body",
            State::IfBody => "if_body",
            State::SwitchBody => "switch_body",
            State::CaseBody => "case_body",
            State::DefaultBody => "default_body",
            State::EventBody => "event_body",
        }
    }
}

/// Declarative shape of a fixed-arity statement head.
struct Pattern {
    rule: &'static str,
    kinds: &'static [&'static [TokenKind]],
    literals: &'static [Option<&'static str>],
    upgrades: &'static [Option<TokenKind>],
}

impl Pattern {
    fn apply(&self, state: State, tokens: &mut [Token]) -> Result<()> {
        if tokens.len() < self.kinds.len() {
            let line = tokens.first().map(|t| t.line).unwrap_or(0);
            return Err(ParseError::Statement {
                line,
                state: state.name(),
                detail: format!(
                    "rule {} needs {} tokens, got {}",
                    self.rule,
                    self.kinds.len(),
                    tokens.len()
                ),
            });
        }
        for (i, token) in tokens.iter_mut().enumerate().take(self.kinds.len()) {
            if !self.kinds[i].contains(&token.kind) {
                return Err(ParseError::TokenMismatch {
                    line: token.line,
                    expected: self.kinds[i][0],
                    got: token.kind,
                    text: token.text.clone(),
                    rule: self.rule,
                });
            }
            if let Some(lit) = self.literals[i] {
                if token.text != lit {
                    return Err(ParseError::TokenMismatch {
                        line: token.line,
                        expected: token.kind,
                        got: token.kind,
                        text: token.text.clone(),
                        rule: self.rule,
                    });
                }
            }
            if let Some(kind) = self.upgrades[i] {
                token.upgrade(kind)?;
            }
        }
        Ok(())
    }
}

const IDENT: &[TokenKind] = &[TokenKind::Ident];
const STR: &[TokenKind] = &[TokenKind::Str];
const SYMBOL: &[TokenKind] = &[TokenKind::Symbol];

static LOAD_PATTERN: Pattern = Pattern {
    rule: "load",
    kinds: &[IDENT, STR],
    literals: &[Some("load"), None],
    upgrades: &[Some(TokenKind::Keyword), Some(TokenKind::Load)],
};

static FN_PATTERN: Pattern = Pattern {
    rule: "fn",
    kinds: &[IDENT, IDENT, SYMBOL, IDENT, SYMBOL],
    literals: &[Some("fn"), None, Some("="), None, Some("{")],
    upgrades: &[
        Some(TokenKind::Keyword),
        Some(TokenKind::FunctionName),
        Some(TokenKind::Operator),
        Some(TokenKind::FunctionName),
        None,
    ],
};

static ARGS_PATTERN: Pattern = Pattern {
    rule: "args",
    kinds: &[IDENT, SYMBOL, SYMBOL],
    literals: &[Some("args"), Some("="), Some("{")],
    upgrades: &[Some(TokenKind::Keyword), Some(TokenKind::Operator), None],
};

static KV_PATTERN: Pattern = Pattern {
    rule: "kv",
    kinds: &[STR, SYMBOL, STR],
    literals: &[None, Some(":"), None],
    upgrades: &[Some(TokenKind::MapKey), None, None],
};

/// Parse flowl source text into a validated [`Ast`].
pub fn parse(source: &str) -> Result<Ast> {
    let tokens: Vec<Token> = lex(source)?.into_iter().flat_map(|l| l.tokens).collect();
    let mut parser = Parser {
        cursor: Cursor { tokens, idx: 0 },
        ast: Ast::new(),
        stack: Vec::new(),
        switch_cases: HashMap::new(),
        seen_block: false,
    };
    parser.run()?;
    validate(&parser.ast)?;
    Ok(parser.ast)
}

struct Cursor {
    tokens: Vec<Token>,
    idx: usize,
}

impl Cursor {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.idx)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.idx + offset)
    }

    fn bump(&mut self) -> Token {
        let tok = self.tokens[self.idx].clone();
        self.idx += 1;
        tok
    }

    /// Whether the next token sits on `line` and matches `text`.
    fn next_is(&self, line: usize, text: &str) -> bool {
        self.peek()
            .map(|t| t.line == line && t.text == text && t.kind == TokenKind::Symbol)
            .unwrap_or(false)
    }

    /// Take the remaining tokens of `line`.
    fn take_line(&mut self, line: usize) -> Vec<Token> {
        let mut out = Vec::new();
        while self.peek().map(|t| t.line == line).unwrap_or(false) {
            out.push(self.bump());
        }
        out
    }

    /// Take tokens of `line` until (not including) a symbol `stop`.
    fn take_line_until(&mut self, line: usize, stop: &str) -> Vec<Token> {
        let mut out = Vec::new();
        while let Some(t) = self.peek() {
            if t.line != line || (t.kind == TokenKind::Symbol && t.text == stop) {
                break;
            }
            out.push(self.bump());
        }
        out
    }
}

struct Parser {
    cursor: Cursor,
    ast: Ast,
    /// Open blocks, innermost last. Empty means global scope.
    stack: Vec<(State, BlockId)>,
    /// Case condition texts per open switch, for default synthesis.
    switch_cases: HashMap<BlockId, (Vec<String>, bool)>,
    seen_block: bool,
}

impl Parser {
    fn state(&self) -> State {
        self.stack.last().map(|(s, _)| *s).unwrap_or(State::Global)
    }

    fn scope(&self) -> BlockId {
        self.stack
            .last()
            .map(|(_, b)| *b)
            .unwrap_or_else(|| self.ast.global())
    }

    fn run(&mut self) -> Result<()> {
        while self.cursor.peek().is_some() {
            match self.state() {
                State::Global
                | State::ForBody
                | State::IfBody
                | State::CaseBody
                | State::DefaultBody => self.statement_context()?,
                State::FnBody => self.fn_body()?,
                State::CoBody | State::ArgsBody => self.map_body()?,
                State::SwitchBody => self.switch_body()?,
                State::EventBody => self.event_body()?,
            }
        }
        if let Some((state, _)) = self.stack.last() {
            return Err(ParseError::Unbalanced {
                state: state.name(),
            });
        }
        Ok(())
    }

    fn err(&self, line: usize, detail: impl Into<String>) -> ParseError {
        ParseError::Statement {
            line,
            state: self.state().name(),
            detail: detail.into(),
        }
    }

    /// Take exactly `count` head tokens, all on `line`.
    fn take_head(&mut self, line: usize, count: usize) -> Result<Vec<Token>> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            match self.cursor.peek() {
                Some(t) if t.line == line => out.push(self.cursor.bump()),
                _ => return Err(self.err(line, format!("statement needs {count} tokens"))),
            }
        }
        Ok(out)
    }

    /// States whose bodies hold full statements: global, for, if, case,
    /// default.
    fn statement_context(&mut self) -> Result<()> {
        let tok = self.cursor.peek().expect("peeked in run").clone();
        match tok.text.as_str() {
            "//" if tok.kind == TokenKind::Symbol => self.comment(),
            "}" if tok.kind == TokenKind::Symbol => {
                self.cursor.bump();
                self.close_block(tok.line)
            }
            "load" if self.state() == State::Global => self.load_stmt(),
            "fn" if self.state() == State::Global => self.fn_stmt(),
            "event" if self.state() == State::Global => self.event_stmt(),
            "co" => self.co_stmt(false),
            "var" => self.var_stmt(),
            "for" => self.for_stmt(),
            "if" => self.if_stmt(),
            "switch" => self.switch_stmt(),
            name if DIRECTIVES.contains(&name) => self.directive_stmt(),
            _ if self.is_rewrite_head() => self.rewrite_stmt(),
            other => Err(self.err(
                tok.line,
                format!("unknown statement starting with {other:?}"),
            )),
        }
    }

    fn is_rewrite_head(&self) -> bool {
        let Some(head) = self.cursor.peek() else {
            return false;
        };
        if head.kind != TokenKind::Ident {
            return false;
        }
        self.cursor
            .peek_at(1)
            .map(|t| t.kind == TokenKind::Symbol && t.text == "<-" && t.line == head.line)
            .unwrap_or(false)
    }

    fn comment(&mut self) -> Result<()> {
        let marker = self.cursor.bump();
        if let Some(next) = self.cursor.peek() {
            if next.kind == TokenKind::Str && next.line == marker.line {
                let text = self.cursor.bump().text;
                // The file's leading comment becomes the flow description.
                if !self.seen_block && self.ast.desc.is_empty() {
                    self.ast.desc = text.trim().to_string();
                }
            }
        }
        Ok(())
    }

    fn close_block(&mut self, line: usize) -> Result<()> {
        let Some((state, id)) = self.stack.pop() else {
            return Err(self.err(line, "unmatched '}'"));
        };
        if state == State::SwitchBody {
            self.switch_cases.remove(&id);
        }
        Ok(())
    }

    fn load_stmt(&mut self) -> Result<()> {
        self.seen_block = true;
        let line = self.cursor.peek().unwrap().line;
        let mut tokens = vec![self.cursor.bump()];
        match self.cursor.peek() {
            Some(t) if t.line == line && t.kind == TokenKind::Str => tokens.push(self.cursor.bump()),
            _ => return Err(self.err(line, "load needs a \"driver:path\" string")),
        }
        LOAD_PATTERN.apply(self.state(), &mut tokens)?;
        let mut block = Block::new(BlockKind::Load, None, line);
        block.target1 = tokens[1].clone();
        self.ast.push_block(self.ast.global(), block);
        Ok(())
    }

    fn fn_stmt(&mut self) -> Result<()> {
        self.seen_block = true;
        let line = self.cursor.peek().unwrap().line;
        let mut tokens = self.take_head(line, 5)?;
        FN_PATTERN.apply(self.state(), &mut tokens)?;
        let mut block = Block::new(BlockKind::Fn, None, line);
        block.target1 = tokens[1].clone();
        block.operator = tokens[2].clone();
        block.target2 = tokens[3].clone();
        block.body = Some(Body::Plain(Vec::new()));
        block.check_targets()?;
        let id = self.ast.push_block(self.ast.global(), block);
        self.stack.push((State::FnBody, id));
        Ok(())
    }

    fn event_stmt(&mut self) -> Result<()> {
        self.seen_block = true;
        let line = self.cursor.peek().unwrap().line;
        self.cursor.bump();
        if !self.cursor.next_is(line, "{") {
            return Err(self.err(line, "event needs `{`"));
        }
        self.cursor.bump();
        if self
            .ast
            .ids()
            .any(|id| self.ast.block(id).kind == BlockKind::Event)
        {
            return Err(ParseError::IdentConflict {
                line,
                detail: "more than one event block".into(),
            });
        }
        let block = Block::new(BlockKind::Event, None, line);
        let id = self.ast.push_block(self.ast.global(), block);
        self.stack.push((State::EventBody, id));
        Ok(())
    }

    fn co_stmt(&mut self, in_event: bool) -> Result<()> {
        self.seen_block = true;
        let line = self.cursor.peek().unwrap().line;
        let kw = self.cursor.bump();
        debug_assert_eq!(kw.text, "co");

        // Parallel-group form: `co { a b c }`.
        if self.cursor.next_is(line, "{") {
            if in_event {
                return Err(self.err(line, "parallel co group not allowed in event block"));
            }
            self.cursor.bump();
            let mut elements = Vec::new();
            loop {
                match self.cursor.peek() {
                    Some(t) if t.kind == TokenKind::Symbol && t.text == "}" => {
                        self.cursor.bump();
                        break;
                    }
                    Some(t) if t.kind == TokenKind::Ident => {
                        let mut el = self.cursor.bump();
                        el.upgrade(TokenKind::FunctionName)?;
                        elements.push(el);
                    }
                    Some(t) => {
                        let (l, s) = (t.line, t.text.clone());
                        return Err(self.err(l, format!("unexpected {s:?} in co group")));
                    }
                    None => return Err(ParseError::Unbalanced { state: "co_body" }),
                }
            }
            if elements.is_empty() {
                return Err(self.err(line, "empty co group"));
            }
            let mut block = Block::new(BlockKind::Co, None, line);
            block.body = Some(Body::List(elements));
            self.ast.push_block(self.scope(), block);
            return Ok(());
        }

        let mut name = match self.cursor.peek() {
            Some(t) if t.line == line && t.kind == TokenKind::Ident => self.cursor.bump(),
            _ => return Err(self.err(line, "co needs a function name")),
        };
        name.upgrade(TokenKind::FunctionName)?;

        let mut block = Block::new(BlockKind::Co, None, line);
        block.target1 = name;

        // Return-capture form: `co NAME -> VAR`.
        if self.cursor.next_is(line, "->") {
            let mut op = self.cursor.bump();
            op.upgrade(TokenKind::Operator)?;
            let mut var = match self.cursor.peek() {
                Some(t) if t.line == line && t.kind == TokenKind::Ident => self.cursor.bump(),
                _ => return Err(self.err(line, "`->` needs a variable name")),
            };
            var.upgrade(TokenKind::VarName)?;
            block.operator = op;
            block.target2 = var;
        }
        block.check_targets()?;

        // Inline argument map: `co NAME { "k" : "v" … }`.
        if self.cursor.next_is(line, "{") {
            self.cursor.bump();
            block.body = Some(Body::Map(Vec::new()));
            let id = self.ast.push_block(self.scope(), block);
            self.stack.push((State::CoBody, id));
        } else {
            self.ast.push_block(self.scope(), block);
        }
        Ok(())
    }

    fn var_stmt(&mut self) -> Result<()> {
        let line = self.cursor.peek().unwrap().line;
        let mut tokens = self.cursor.take_line(line);
        if tokens.len() < 2 {
            return Err(self.err(line, "var needs a name"));
        }
        tokens[0].upgrade(TokenKind::Keyword)?;
        tokens[1].upgrade(TokenKind::VarName)?;
        let name = tokens[1].text.clone();

        let node = if tokens.len() == 2 {
            VarNode::new(&name, line, Vec::new(), false)
        } else {
            if tokens[2].text != "=" || tokens[2].kind != TokenKind::Symbol {
                return Err(ParseError::TokenMismatch {
                    line,
                    expected: TokenKind::Operator,
                    got: tokens[2].kind,
                    text: tokens[2].text.clone(),
                    rule: "var",
                });
            }
            tokens[2].upgrade(TokenKind::Operator)?;
            let tail = compose_value(&tokens[3..], self.state(), line)?;
            let as_expr = tail.kind == TokenKind::Expr;
            let node = VarNode::new(&name, line, tail.segments.clone(), as_expr);
            tokens.truncate(3);
            tokens.push(tail);
            node
        };

        let scope = self.scope();
        self.ast.block(scope).vars.define(node)?;
        append_statement(self.ast.block_mut(scope), Statement::new(StatementKind::Var, tokens));
        Ok(())
    }

    fn rewrite_stmt(&mut self) -> Result<()> {
        let line = self.cursor.peek().unwrap().line;
        if !matches!(self.state(), State::Global | State::FnBody | State::ForBody) {
            return Err(self.err(line, "rewrite is only allowed at file, fn, or for scope"));
        }
        let mut tokens = self.cursor.take_line(line);
        if tokens.len() < 3 {
            return Err(self.err(line, "rewrite needs a right-hand side"));
        }
        tokens[0].upgrade(TokenKind::VarName)?;
        tokens[1].upgrade(TokenKind::Operator)?;
        let tail = compose_value(&tokens[2..], self.state(), line)?;
        tokens.truncate(2);
        tokens.push(tail);

        let scope = self.scope();
        append_statement(
            self.ast.block_mut(scope),
            Statement::new(StatementKind::RewriteVar, tokens),
        );
        Ok(())
    }

    fn for_stmt(&mut self) -> Result<()> {
        self.seen_block = true;
        let line = self.cursor.peek().unwrap().line;
        self.cursor.bump();
        let cond = self.cursor.take_line_until(line, "{");
        if !self.cursor.next_is(line, "{") {
            return Err(self.err(line, "for needs `{` on the same line"));
        }
        self.cursor.bump();

        let mut block = Block::new(BlockKind::For, None, line);
        block.body = Some(Body::Plain(Vec::new()));
        let id = self.ast.push_block(self.scope(), block);
        if !cond.is_empty() {
            self.define_condition(id, &cond, line)?;
        }
        self.stack.push((State::ForBody, id));
        Ok(())
    }

    fn if_stmt(&mut self) -> Result<()> {
        self.seen_block = true;
        let line = self.cursor.peek().unwrap().line;
        self.cursor.bump();
        let cond = self.cursor.take_line_until(line, "{");
        if cond.is_empty() {
            return Err(self.err(line, "if needs a condition"));
        }
        if !self.cursor.next_is(line, "{") {
            return Err(self.err(line, "if needs `{` on the same line"));
        }
        self.cursor.bump();

        let mut block = Block::new(BlockKind::If, None, line);
        block.body = Some(Body::Plain(Vec::new()));
        let id = self.ast.push_block(self.scope(), block);
        self.define_condition(id, &cond, line)?;
        self.stack.push((State::IfBody, id));
        Ok(())
    }

    fn switch_stmt(&mut self) -> Result<()> {
        self.seen_block = true;
        let line = self.cursor.peek().unwrap().line;
        self.cursor.bump();
        if !self.cursor.next_is(line, "{") {
            return Err(self.err(line, "switch needs `{`"));
        }
        self.cursor.bump();
        let block = Block::new(BlockKind::Switch, None, line);
        let id = self.ast.push_block(self.scope(), block);
        self.switch_cases.insert(id, (Vec::new(), false));
        self.stack.push((State::SwitchBody, id));
        Ok(())
    }

    fn switch_body(&mut self) -> Result<()> {
        let tok = self.cursor.peek().unwrap().clone();
        match tok.text.as_str() {
            "//" if tok.kind == TokenKind::Symbol => self.comment(),
            "}" if tok.kind == TokenKind::Symbol => {
                self.cursor.bump();
                self.close_block(tok.line)
            }
            "case" => {
                let line = tok.line;
                self.cursor.bump();
                let cond = self.cursor.take_line_until(line, "{");
                if cond.is_empty() {
                    return Err(self.err(line, "case needs a condition"));
                }
                if !self.cursor.next_is(line, "{") {
                    return Err(self.err(line, "case needs `{` on the same line"));
                }
                self.cursor.bump();
                let switch = self.scope();
                let mut block = Block::new(BlockKind::Case, None, line);
                block.body = Some(Body::Plain(Vec::new()));
                let id = self.ast.push_block(switch, block);
                let text = self.define_condition(id, &cond, line)?;
                if let Some((cases, _)) = self.switch_cases.get_mut(&switch) {
                    cases.push(text);
                }
                self.stack.push((State::CaseBody, id));
                Ok(())
            }
            "default" => {
                let line = tok.line;
                self.cursor.bump();
                if !self.cursor.next_is(line, "{") {
                    return Err(self.err(line, "default needs `{`"));
                }
                self.cursor.bump();
                let switch = self.scope();
                let (cases, has_default) = self
                    .switch_cases
                    .get(&switch)
                    .cloned()
                    .unwrap_or((Vec::new(), false));
                if has_default {
                    return Err(ParseError::IdentConflict {
                        line,
                        detail: "switch already has a default".into(),
                    });
                }
                let mut block = Block::new(BlockKind::Default, None, line);
                block.body = Some(Body::Plain(Vec::new()));
                let id = self.ast.push_block(switch, block);

                // default fires when no preceding case condition held.
                let text = if cases.is_empty() {
                    "true".to_string()
                } else {
                    cases
                        .iter()
                        .map(|c| format!("!({c})"))
                        .collect::<Vec<_>>()
                        .join(" && ")
                };
                let mut cond = Token::new(text, TokenKind::Expr, line);
                cond.resolve_segments()?;
                self.ast
                    .block(id)
                    .vars
                    .define(VarNode::new(
                        RESERVED_CONDITION_VAR,
                        line,
                        cond.segments.clone(),
                        true,
                    ))?;
                if let Some(entry) = self.switch_cases.get_mut(&switch) {
                    entry.1 = true;
                }
                self.stack.push((State::DefaultBody, id));
                Ok(())
            }
            other => Err(self.err(
                tok.line,
                format!("only case/default allowed in switch, got {other:?}"),
            )),
        }
    }

    fn fn_body(&mut self) -> Result<()> {
        let tok = self.cursor.peek().unwrap().clone();
        match tok.text.as_str() {
            "//" if tok.kind == TokenKind::Symbol => self.comment(),
            "}" if tok.kind == TokenKind::Symbol => {
                self.cursor.bump();
                self.close_block(tok.line)
            }
            "args" => {
                let line = tok.line;
                let mut tokens = self.take_head(line, 3)?;
                ARGS_PATTERN.apply(self.state(), &mut tokens)?;
                let mut block = Block::new(BlockKind::Args, None, line);
                block.body = Some(Body::Map(Vec::new()));
                let id = self.ast.push_block(self.scope(), block);
                self.stack.push((State::ArgsBody, id));
                Ok(())
            }
            "var" => self.var_stmt(),
            _ if self.is_rewrite_head() => self.rewrite_stmt(),
            other => Err(self.err(
                tok.line,
                format!("only args/var/rewrite allowed in fn, got {other:?}"),
            )),
        }
    }

    fn map_body(&mut self) -> Result<()> {
        let tok = self.cursor.peek().unwrap().clone();
        match tok.text.as_str() {
            "//" if tok.kind == TokenKind::Symbol => self.comment(),
            "}" if tok.kind == TokenKind::Symbol => {
                self.cursor.bump();
                self.close_block(tok.line)
            }
            _ => {
                let mut tokens = Vec::new();
                for _ in 0..3 {
                    match self.cursor.peek() {
                        Some(_) => tokens.push(self.cursor.bump()),
                        None => return Err(ParseError::Unbalanced { state: "map_body" }),
                    }
                }
                KV_PATTERN.apply(self.state(), &mut tokens)?;
                let key = tokens[0].clone();
                let mut value = tokens[2].clone();
                value.resolve_segments()?;
                let scope = self.scope();
                if let Some(Body::Map(pairs)) = &mut self.ast.block_mut(scope).body {
                    pairs.push((key, value));
                }
                Ok(())
            }
        }
    }

    fn event_body(&mut self) -> Result<()> {
        let tok = self.cursor.peek().unwrap().clone();
        match tok.text.as_str() {
            "//" if tok.kind == TokenKind::Symbol => self.comment(),
            "}" if tok.kind == TokenKind::Symbol => {
                self.cursor.bump();
                self.close_block(tok.line)
            }
            "co" => self.co_stmt(true),
            other => Err(self.err(
                tok.line,
                format!("only co allowed in event block, got {other:?}"),
            )),
        }
    }

    fn directive_stmt(&mut self) -> Result<()> {
        self.seen_block = true;
        let line = self.cursor.peek().unwrap().line;
        let name = self.cursor.bump();
        let mut args = self.cursor.take_line(line);
        if args.len() > 2 {
            return Err(self.err(line, format!("{} takes at most two arguments", name.text)));
        }
        for arg in &mut args {
            if !matches!(
                arg.kind,
                TokenKind::Str | TokenKind::Number | TokenKind::RefVar
            ) {
                return Err(ParseError::TokenMismatch {
                    line: arg.line,
                    expected: TokenKind::Str,
                    got: arg.kind,
                    text: arg.text.clone(),
                    rule: "directive",
                });
            }
            arg.resolve_segments()?;
        }
        let mut block = Block::new(BlockKind::Directive, None, line);
        block.target1 = name;
        block.body = Some(Body::List(args));
        self.ast.push_block(self.scope(), block);
        Ok(())
    }

    /// Compose condition tokens into one expr token and register it as the
    /// block's reserved condition variable. Returns the composed text.
    fn define_condition(&mut self, block: BlockId, cond: &[Token], line: usize) -> Result<String> {
        let composed = compose_expr(cond, line)?;
        let text = composed.text.clone();
        self.ast.block(block).vars.define(VarNode::new(
            RESERVED_CONDITION_VAR,
            line,
            composed.segments,
            true,
        ))?;
        Ok(text)
    }
}

fn append_statement(block: &mut Block, statement: Statement) {
    match &mut block.body {
        Some(Body::Plain(stmts)) => stmts.push(statement),
        None => block.body = Some(Body::Plain(vec![statement])),
        _ => {}
    }
}

/// Compose a value tail: a single literal stays a plain token, anything
/// longer becomes one expression token.
fn compose_value(tokens: &[Token], state: State, line: usize) -> Result<Token> {
    match tokens {
        [] => Err(ParseError::Statement {
            line,
            state: state.name(),
            detail: "missing value".into(),
        }),
        [single]
            if matches!(
                single.kind,
                TokenKind::Str | TokenKind::Number | TokenKind::RefVar
            ) =>
        {
            let mut tok = single.clone();
            tok.resolve_segments()?;
            Ok(tok)
        }
        many => compose_expr(many, line),
    }
}

/// Join expression tokens back into one source string, re-quoting string
/// literals so the evaluator sees them as single operands.
fn compose_expr(tokens: &[Token], line: usize) -> Result<Token> {
    let mut parts = Vec::with_capacity(tokens.len());
    for tok in tokens {
        match tok.kind {
            TokenKind::Str => parts.push(format!("\"{}\"", tok.text.replace('"', "\\\""))),
            _ => parts.push(tok.text.clone()),
        }
    }
    let mut composed = Token::new(parts.join(" "), TokenKind::Expr, line);
    composed.resolve_segments()?;
    Ok(composed)
}

/// Post-scan validation: reference resolvability, variable acyclicity, and
/// fn/co usage rules.
fn validate(ast: &Ast) -> Result<()> {
    // Wire variable children, then check every root for cycles.
    for id in ast.ids() {
        for node in ast.block(id).vars.nodes() {
            resolve_children(ast, id, &node)?;
        }
    }
    for node in ast.all_var_nodes() {
        detect_cycle_from(&node)?;
    }

    // Every `$(name)` in bodies must resolve; rewrite targets must exist;
    // a co's return target must be visible in the task's scope.
    for id in ast.ids() {
        let block = ast.block(id);
        if block.kind == BlockKind::Co
            && !block.target2.is_empty()
            && ast.lookup_var(id, &block.target2.text).is_none()
        {
            return Err(ParseError::UndefinedVariable {
                line: block.target2.line,
                name: block.target2.text.clone(),
            });
        }
        let Some(body) = &block.body else { continue };
        match body {
            Body::Map(pairs) => {
                for (_, value) in pairs {
                    validate_token_refs(ast, id, value)?;
                }
            }
            Body::List(items) => {
                for item in items {
                    validate_token_refs(ast, id, item)?;
                }
            }
            Body::Plain(stmts) => {
                for stmt in stmts {
                    if stmt.kind == StatementKind::RewriteVar {
                        let target = &stmt.tokens[0];
                        if ast.lookup_var(id, &target.text).is_none() {
                            return Err(ParseError::UndefinedVariable {
                                line: target.line,
                                name: target.text.clone(),
                            });
                        }
                        validate_token_refs(ast, id, &stmt.tokens[2])?;
                    }
                }
            }
        }
    }

    // A function may be configured by at most one fn, and a configured fn
    // may be invoked at most once across the whole flow.
    let mut fn_aliases: HashMap<String, usize> = HashMap::new();
    let mut configured_fns: HashMap<String, usize> = HashMap::new();
    for id in ast.ids() {
        let block = ast.block(id);
        if block.kind == BlockKind::Fn {
            let alias = block.target1.text.clone();
            let fname = block.target2.text.clone();
            if fn_aliases.insert(alias.clone(), block.line).is_some() {
                return Err(ParseError::IdentConflict {
                    line: block.line,
                    detail: format!("duplicate fn {alias:?}"),
                });
            }
            if configured_fns.insert(fname.clone(), block.line).is_some() {
                return Err(ParseError::IdentConflict {
                    line: block.line,
                    detail: format!("function {fname:?} configured by more than one fn"),
                });
            }
        }
    }
    let mut invocations: HashMap<String, usize> = HashMap::new();
    for id in ast.ids() {
        let block = ast.block(id);
        if block.kind != BlockKind::Co {
            continue;
        }
        let mut record = |name: &str, line: usize| -> Result<()> {
            if fn_aliases.contains_key(name) {
                let count = invocations.entry(name.to_string()).or_insert(0);
                *count += 1;
                if *count > 1 {
                    return Err(ParseError::IdentConflict {
                        line,
                        detail: format!("fn {name:?} invoked more than once"),
                    });
                }
            }
            Ok(())
        };
        if !block.target1.is_empty() {
            record(&block.target1.text, block.line)?;
        }
        if let Some(Body::List(items)) = &block.body {
            for item in items {
                record(&item.text, item.line)?;
            }
        }
    }
    Ok(())
}

fn validate_token_refs(ast: &Ast, block: BlockId, token: &Token) -> Result<()> {
    for name in token.referenced_vars() {
        resolve_ref(ast, block, name, token.line)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scenario_a_shape() {
        let src = r#"
load "go:function1"
load "go:function2"
load "shell:/tmp/function3"

fn f1 = function1 { args = { "k": "v1" "hello": "world" } }

co f1
co function2 { "k" : "v2" }
co { function1 function2 }
"#;
        let ast = parse(src).unwrap();
        let global = ast.global();
        let kinds: Vec<_> = ast.block(global)
            .children
            .iter()
            .map(|&id| ast.block(id).kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                BlockKind::Load,
                BlockKind::Load,
                BlockKind::Load,
                BlockKind::Fn,
                BlockKind::Co,
                BlockKind::Co,
                BlockKind::Co,
            ]
        );
    }

    #[test]
    fn fn_args_map_is_recorded() {
        let src = "load \"go:f\"\nfn a = f { args = { \"k\": \"v\" } }\nco a\n";
        let ast = parse(src).unwrap();
        let fn_id = ast
            .ids()
            .find(|&id| ast.block(id).kind == BlockKind::Fn)
            .unwrap();
        let args_id = ast.block(fn_id).children[0];
        let block = ast.block(args_id);
        assert_eq!(block.kind, BlockKind::Args);
        let pairs = block.body.as_ref().unwrap().pairs();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0.text, "k");
        assert_eq!(pairs[0].1.text, "v");
    }

    #[test]
    fn multiple_loads_on_one_line() {
        let src = "load \"go:a\" load \"go:b\" load \"go:c\"\n";
        let ast = parse(src).unwrap();
        assert_eq!(ast.block(ast.global()).children.len(), 3);
    }

    #[test]
    fn for_block_with_inline_statements() {
        let src = "load \"go:time\"\nvar t\nfor { co time -> t\n co time }\n";
        let err = parse(src);
        // `time` is invoked twice but has no fn config, so this is legal.
        assert!(err.is_ok(), "{err:?}");
    }

    #[test]
    fn undefined_variable_fails_validation() {
        let src = "load \"go:p\"\nco p { \"k\": \"$(missing)\" }\n";
        assert!(matches!(
            parse(src),
            Err(ParseError::UndefinedVariable { .. })
        ));
    }

    #[test]
    fn cycle_rejected() {
        let src = "var a = $(b)\nvar b = $(a)\n";
        assert!(matches!(parse(src), Err(ParseError::VariableCycle { .. })));
    }

    #[test]
    fn duplicate_var_in_block_rejected() {
        let src = "var a = 1\nvar a = 2\n";
        assert!(matches!(
            parse(src),
            Err(ParseError::DuplicateVariable { .. })
        ));
    }

    #[test]
    fn switch_allows_single_default() {
        let src = "var v = 1\nload \"go:f\"\nload \"go:g\"\nswitch {\ncase $(v) == 1 { co f }\ndefault { co g }\n}\n";
        let ast = parse(src).unwrap();
        let switch = ast
            .ids()
            .find(|&id| ast.block(id).kind == BlockKind::Switch)
            .unwrap();
        assert_eq!(ast.block(switch).children.len(), 2);
    }

    #[test]
    fn second_default_rejected() {
        let src = "load \"go:f\"\nswitch {\ndefault { co f }\ndefault { co f }\n}\n";
        assert!(matches!(parse(src), Err(ParseError::IdentConflict { .. })));
    }

    #[test]
    fn unbalanced_terminator_rejected() {
        let src = "for {\n co x\n";
        assert!(matches!(parse(src), Err(ParseError::Unbalanced { .. })));
    }

    #[test]
    fn keyword_cannot_name_a_function() {
        let src = "co for\n";
        assert!(matches!(parse(src), Err(ParseError::KeywordAsName { .. })));
    }

    #[test]
    fn rewrite_target_must_exist() {
        let src = "a <- 1\n";
        assert!(matches!(
            parse(src),
            Err(ParseError::UndefinedVariable { .. })
        ));
    }

    #[test]
    fn description_comes_from_leading_comment() {
        let src = "// nightly build pipeline\nload \"go:f\"\nco f\n";
        let ast = parse(src).unwrap();
        assert_eq!(ast.desc, "nightly build pipeline");
    }

    #[test]
    fn fn_invoked_twice_rejected() {
        let src = "load \"go:f\"\nfn a = f { args = { \"k\": \"v\" } }\nco a\nco a\n";
        assert!(matches!(parse(src), Err(ParseError::IdentConflict { .. })));
    }

    #[test]
    fn default_condition_negates_cases() {
        let src = "var v = 3\nload \"go:f\"\nload \"go:g\"\nswitch {\ncase $(v) == 1 { co f }\ndefault { co g }\n}\n";
        let ast = parse(src).unwrap();
        let default = ast
            .ids()
            .find(|&id| ast.block(id).kind == BlockKind::Default)
            .unwrap();
        let cond = ast
            .block(default)
            .vars
            .get(RESERVED_CONDITION_VAR)
            .unwrap();
        assert_eq!(cond.calc().unwrap(), "true");
    }
}
