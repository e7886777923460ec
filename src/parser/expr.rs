//! Restricted expression evaluator.
//!
//! Conditions and `var` initializers use a small grammar: integer/float
//! arithmetic, string comparison, boolean and/or, unary `!`/`-`, and
//! parentheses. The evaluator runs over a source string in which every
//! `$(name)` reference has already been substituted, and returns a
//! stringified result (`true`/`false` or a decimal string).

use super::{ParseError, Result};

/// Evaluate `src` and stringify the result.
pub fn eval_expr(src: &str) -> Result<String> {
    let tokens = scan(src)?;
    let mut parser = Pratt {
        tokens,
        index: 0,
        src,
    };
    let value = parser.expression(0)?;
    if parser.index != parser.tokens.len() {
        return Err(parser.error("trailing tokens"));
    }
    Ok(value.stringify())
}

/// Evaluate `src` and coerce the result to a boolean.
///
/// Condition gates treat exactly the string `"true"` as true.
pub fn eval_bool(src: &str) -> Result<bool> {
    Ok(eval_expr(src)? == "true")
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Num(f64),
    Str(String),
    Bool(bool),
}

impl Value {
    fn stringify(&self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Str(s) => s.clone(),
            Value::Num(n) => format_num(*n),
        }
    }

    fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            Value::Str(s) => s.trim().parse::<f64>().ok(),
            Value::Bool(_) => None,
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Str(s) => match s.trim() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            Value::Num(_) => None,
        }
    }
}

fn format_num(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ExprToken {
    Num(f64),
    Str(String),
    Word(String),
    Op(&'static str),
    Open,
    Close,
}

fn scan(src: &str) -> Result<Vec<ExprToken>> {
    let chars: Vec<char> = src.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if ch.is_whitespace() {
            i += 1;
            continue;
        }
        match ch {
            '(' => {
                out.push(ExprToken::Open);
                i += 1;
            }
            ')' => {
                out.push(ExprToken::Close);
                i += 1;
            }
            '"' => {
                let mut buf = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') if chars.get(i + 1) == Some(&'"') => {
                            buf.push('"');
                            i += 2;
                        }
                        Some(&c) => {
                            buf.push(c);
                            i += 1;
                        }
                        None => {
                            return Err(ParseError::Expr(format!(
                                "unterminated string in expression {src:?}"
                            )));
                        }
                    }
                }
                out.push(ExprToken::Str(buf));
            }
            _ => {
                if let Some(op) = scan_op(&chars, i) {
                    out.push(ExprToken::Op(op));
                    i += op.len();
                } else if ch.is_ascii_digit() {
                    let start = i;
                    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                        i += 1;
                    }
                    let text: String = chars[start..i].iter().collect();
                    let n = text.parse::<f64>().map_err(|_| {
                        ParseError::Expr(format!("invalid number {text:?} in {src:?}"))
                    })?;
                    out.push(ExprToken::Num(n));
                } else if ch.is_alphanumeric() || ch == '_' || ch == '.' {
                    let start = i;
                    while i < chars.len()
                        && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                    {
                        i += 1;
                    }
                    out.push(ExprToken::Word(chars[start..i].iter().collect()));
                } else {
                    return Err(ParseError::Expr(format!(
                        "illegal character {ch:?} in expression {src:?}"
                    )));
                }
            }
        }
    }
    Ok(out)
}

fn scan_op(chars: &[char], i: usize) -> Option<&'static str> {
    let two = |a: char, b: char| chars.get(i) == Some(&a) && chars.get(i + 1) == Some(&b);
    for (a, b, op) in [
        ('=', '=', "=="),
        ('!', '=', "!="),
        ('>', '=', ">="),
        ('<', '=', "<="),
        ('&', '&', "&&"),
        ('|', '|', "||"),
    ] {
        if two(a, b) {
            return Some(op);
        }
    }
    match chars[i] {
        '>' => Some(">"),
        '<' => Some("<"),
        '+' => Some("+"),
        '-' => Some("-"),
        '*' => Some("*"),
        '/' => Some("/"),
        '!' => Some("!"),
        _ => None,
    }
}

fn binding_power(op: &str) -> Option<(u8, u8)> {
    let bp = match op {
        "||" => (1, 2),
        "&&" => (3, 4),
        "==" | "!=" | ">" | "<" | ">=" | "<=" => (5, 6),
        "+" | "-" => (7, 8),
        "*" | "/" => (9, 10),
        _ => return None,
    };
    Some(bp)
}

struct Pratt<'a> {
    tokens: Vec<ExprToken>,
    index: usize,
    src: &'a str,
}

impl Pratt<'_> {
    fn peek(&self) -> Option<&ExprToken> {
        self.tokens.get(self.index)
    }

    fn next(&mut self) -> Option<ExprToken> {
        let tok = self.tokens.get(self.index).cloned();
        if tok.is_some() {
            self.index += 1;
        }
        tok
    }

    fn error(&self, detail: &str) -> ParseError {
        ParseError::Expr(format!("{detail} in expression {:?}", self.src))
    }

    fn expression(&mut self, min_bp: u8) -> Result<Value> {
        let mut lhs = self.prefix()?;

        while let Some(ExprToken::Op(op)) = self.peek() {
            let op = *op;
            let Some((left_bp, right_bp)) = binding_power(op) else {
                return Err(self.error(&format!("{op:?} is not a binary operator")));
            };
            if left_bp < min_bp {
                break;
            }
            self.next();
            let rhs = self.expression(right_bp)?;
            lhs = self.apply(op, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<Value> {
        match self.next() {
            Some(ExprToken::Num(n)) => Ok(Value::Num(n)),
            Some(ExprToken::Str(s)) => Ok(Value::Str(s)),
            Some(ExprToken::Word(w)) => Ok(match w.as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                // Bare words are substituted variable values.
                _ => Value::Str(w),
            }),
            Some(ExprToken::Open) => {
                let inner = self.expression(0)?;
                match self.next() {
                    Some(ExprToken::Close) => Ok(inner),
                    _ => Err(self.error("expected ')'")),
                }
            }
            Some(ExprToken::Op("!")) => {
                let operand = self.expression(11)?;
                let b = operand
                    .as_bool()
                    .ok_or_else(|| self.error("'!' needs a boolean operand"))?;
                Ok(Value::Bool(!b))
            }
            Some(ExprToken::Op("-")) => {
                let operand = self.expression(11)?;
                let n = operand
                    .as_num()
                    .ok_or_else(|| self.error("'-' needs a numeric operand"))?;
                Ok(Value::Num(-n))
            }
            Some(other) => Err(self.error(&format!("unexpected {other:?}"))),
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn apply(&self, op: &str, lhs: Value, rhs: Value) -> Result<Value> {
        match op {
            "+" | "-" | "*" | "/" => {
                let (a, b) = self.numeric_pair(op, &lhs, &rhs)?;
                let n = match op {
                    "+" => a + b,
                    "-" => a - b,
                    "*" => a * b,
                    "/" => {
                        if b == 0.0 {
                            return Err(self.error("division by zero"));
                        }
                        a / b
                    }
                    _ => unreachable!(),
                };
                Ok(Value::Num(n))
            }
            "&&" | "||" => {
                let a = lhs
                    .as_bool()
                    .ok_or_else(|| self.error(&format!("{op:?} needs boolean operands")))?;
                let b = rhs
                    .as_bool()
                    .ok_or_else(|| self.error(&format!("{op:?} needs boolean operands")))?;
                Ok(Value::Bool(if op == "&&" { a && b } else { a || b }))
            }
            "==" | "!=" | ">" | "<" | ">=" | "<=" => {
                // Numeric comparison when both sides are numbers, string
                // comparison otherwise.
                let ord = match (lhs.as_num(), rhs.as_num()) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => Some(lhs.stringify().cmp(&rhs.stringify())),
                };
                let Some(ord) = ord else {
                    return Err(self.error("incomparable operands"));
                };
                let b = match op {
                    "==" => ord.is_eq(),
                    "!=" => ord.is_ne(),
                    ">" => ord.is_gt(),
                    "<" => ord.is_lt(),
                    ">=" => ord.is_ge(),
                    "<=" => ord.is_le(),
                    _ => unreachable!(),
                };
                Ok(Value::Bool(b))
            }
            other => Err(self.error(&format!("unsupported operator {other:?}"))),
        }
    }

    fn numeric_pair(&self, op: &str, lhs: &Value, rhs: &Value) -> Result<(f64, f64)> {
        match (lhs.as_num(), rhs.as_num()) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(self.error(&format!("{op:?} needs numeric operands"))),
        }
    }
}
