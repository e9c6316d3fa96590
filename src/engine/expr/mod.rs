// Weft Engine — Expression Evaluator
//
// A sandboxed, side-effect-free expression language used by every guard,
// every interpolated string, and every field the spec types as `expression`.
// Supports member access, arithmetic, comparison, boolean logic, ternary,
// array/object literals, calls into the fixed transform set, and the pipe
// form `value | transform:arg1:arg2`.
//
// Three entry points:
//   evaluate(expr, ctx)        — raw expression text → value (used by `when`)
//   interpolate(template, ctx) — replace every ${…} and stringify
//   evaluate_field(text, ctx)  — literal-or-template: a full-span ${…}
//                                 yields the typed value, embedded ${…}
//                                 interpolates, anything else is a literal
//
// Evaluation is deterministic for a fixed context and clock, and never
// mutates the context.

pub mod safety;
pub mod transforms;
pub mod value;

use crate::atoms::error::{EngineError, EngineResult};
use serde_json::{Map, Value};
use value::{as_number, compare, is_truthy, loose_eq, number, to_display_string};

// ── Tokens ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Question,
    Colon,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Pipe,
    OrOr,
    AndAnd,
    EqEq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
}

fn lex(src: &str) -> EngineResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    // A dot not followed by a digit is member access, not a decimal.
                    if chars[i] == '.' && !chars.get(i + 1).map(|d| d.is_ascii_digit()).unwrap_or(false) {
                        break;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| EngineError::expression(format!("bad number '{text}'")))?;
                tokens.push(Token::Num(n));
            }
            '\'' | '"' => {
                let quote = c;
                i += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err(EngineError::expression("unterminated string")),
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            i += 1;
                            match chars.get(i) {
                                Some('n') => s.push('\n'),
                                Some('t') => s.push('\t'),
                                Some(&e) => s.push(e),
                                None => return Err(EngineError::expression("unterminated escape")),
                            }
                            i += 1;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            'a'..='z' | 'A'..='Z' | '_' | '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    tokens.push(Token::Pipe);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(EngineError::expression("single '&' is not an operator"));
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(EngineError::expression("assignment is not allowed in expressions"));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Lte);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Gte);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '?' => {
                tokens.push(Token::Question);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '{' => {
                tokens.push(Token::LBrace);
                i += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
                i += 1;
            }
            other => {
                return Err(EngineError::expression(format!("unexpected character '{other}'")));
            }
        }
    }
    Ok(tokens)
}

// ── AST ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Ident(String),
    /// Bare word in pipe-argument position: resolves from context, falling
    /// back to its literal text (`filter:status:active` style).
    PipeWord(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Unary(char, Box<Expr>),
    Binary(&'static str, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Call(String, Vec<Expr>),
    Pipe(Box<Expr>, Vec<(String, Vec<Expr>)>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, t: &Token) -> bool {
        if self.peek() == Some(t) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, t: Token, what: &str) -> EngineResult<()> {
        if self.eat(&t) {
            Ok(())
        } else {
            Err(EngineError::expression(format!("expected {what}")))
        }
    }

    fn parse_expr(&mut self) -> EngineResult<Expr> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> EngineResult<Expr> {
        let cond = self.parse_or()?;
        if self.eat(&Token::Question) {
            let then = self.parse_expr()?;
            self.expect(Token::Colon, "':' in ternary")?;
            let otherwise = self.parse_expr()?;
            return Ok(Expr::Ternary(Box::new(cond), Box::new(then), Box::new(otherwise)));
        }
        Ok(cond)
    }

    fn parse_or(&mut self) -> EngineResult<Expr> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::OrOr) {
            let right = self.parse_and()?;
            left = Expr::Binary("||", Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> EngineResult<Expr> {
        let mut left = self.parse_equality()?;
        while self.eat(&Token::AndAnd) {
            let right = self.parse_equality()?;
            left = Expr::Binary("&&", Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> EngineResult<Expr> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => "==",
                Some(Token::NotEq) => "!=",
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> EngineResult<Expr> {
        let mut left = self.parse_pipe()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => "<",
                Some(Token::Lte) => "<=",
                Some(Token::Gt) => ">",
                Some(Token::Gte) => ">=",
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_pipe()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // Pipes bind looser than arithmetic so `count + 1 | ordinal` transforms
    // the sum, but tighter than comparison so `items | length > 3` compares
    // the length.
    fn parse_pipe(&mut self) -> EngineResult<Expr> {
        let input = self.parse_additive()?;
        let mut stages: Vec<(String, Vec<Expr>)> = Vec::new();
        while self.eat(&Token::Pipe) {
            let name = match self.next() {
                Some(Token::Ident(name)) => name,
                _ => return Err(EngineError::expression("expected transform name after '|'")),
            };
            let mut args = Vec::new();
            while self.eat(&Token::Colon) {
                args.push(self.parse_pipe_arg()?);
            }
            stages.push((name, args));
        }
        if stages.is_empty() {
            Ok(input)
        } else {
            Ok(Expr::Pipe(Box::new(input), stages))
        }
    }

    /// A pipe argument is a literal, a (possibly dotted) bare word, or a
    /// parenthesized expression. Bare words resolve from context with a
    /// literal-text fallback.
    fn parse_pipe_arg(&mut self) -> EngineResult<Expr> {
        let negate = self.eat(&Token::Minus);
        let arg = match self.next() {
            Some(Token::Num(n)) => Expr::Literal(number(n)),
            Some(Token::Str(s)) => Expr::Literal(Value::String(s)),
            Some(Token::True) => Expr::Literal(Value::Bool(true)),
            Some(Token::False) => Expr::Literal(Value::Bool(false)),
            Some(Token::Null) => Expr::Literal(Value::Null),
            Some(Token::Ident(first)) => {
                let mut path = first;
                while self.eat(&Token::Dot) {
                    match self.next() {
                        Some(Token::Ident(seg)) => {
                            path.push('.');
                            path.push_str(&seg);
                        }
                        Some(Token::Num(n)) if n.fract() == 0.0 => {
                            path.push('.');
                            path.push_str(&(n as i64).to_string());
                        }
                        _ => return Err(EngineError::expression("bad path in transform argument")),
                    }
                }
                Expr::PipeWord(path)
            }
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen, "')'")?;
                inner
            }
            _ => return Err(EngineError::expression("expected transform argument after ':'")),
        };
        if negate {
            Ok(Expr::Unary('-', Box::new(arg)))
        } else {
            Ok(arg)
        }
    }

    fn parse_additive(&mut self) -> EngineResult<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => "+",
                Some(Token::Minus) => "-",
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> EngineResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => "*",
                Some(Token::Slash) => "/",
                Some(Token::Percent) => "%",
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> EngineResult<Expr> {
        if self.eat(&Token::Bang) {
            return Ok(Expr::Unary('!', Box::new(self.parse_unary()?)));
        }
        if self.eat(&Token::Minus) {
            return Ok(Expr::Unary('-', Box::new(self.parse_unary()?)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> EngineResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let name = match self.next() {
                    Some(Token::Ident(name)) => name,
                    Some(Token::Num(n)) if n.fract() == 0.0 => (n as i64).to_string(),
                    _ => return Err(EngineError::expression("expected member name after '.'")),
                };
                expr = Expr::Member(Box::new(expr), name);
            } else if self.eat(&Token::LBracket) {
                let index = self.parse_expr()?;
                self.expect(Token::RBracket, "']'")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if self.peek() == Some(&Token::LParen) {
                // Call form of a transform: `upper(name)`, `truncate(s, 10)`.
                let name = match &expr {
                    Expr::Ident(name) => name.clone(),
                    _ => return Err(EngineError::expression("only transforms are callable")),
                };
                self.pos += 1;
                let mut args = Vec::new();
                if !self.eat(&Token::RParen) {
                    loop {
                        args.push(self.parse_expr()?);
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(Token::RParen, "')'")?;
                        break;
                    }
                }
                expr = Expr::Call(name, args);
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> EngineResult<Expr> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Expr::Literal(number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.parse_expr()?);
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(Token::RBracket, "']'")?;
                        break;
                    }
                }
                Ok(Expr::Array(items))
            }
            Some(Token::LBrace) => {
                let mut pairs = Vec::new();
                if !self.eat(&Token::RBrace) {
                    loop {
                        let key = match self.next() {
                            Some(Token::Ident(k)) => k,
                            Some(Token::Str(k)) => k,
                            _ => return Err(EngineError::expression("expected object key")),
                        };
                        self.expect(Token::Colon, "':' after object key")?;
                        pairs.push((key, self.parse_expr()?));
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(Token::RBrace, "'}'")?;
                        break;
                    }
                }
                Ok(Expr::Object(pairs))
            }
            other => Err(EngineError::expression(format!("unexpected token {other:?}"))),
        }
    }
}

// ── Evaluation ─────────────────────────────────────────────────────────────

fn eval(expr: &Expr, ctx: &Map<String, Value>) -> EngineResult<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ident(name) => Ok(ctx.get(name).cloned().unwrap_or(Value::Null)),
        Expr::PipeWord(path) => {
            let root = Value::Object(ctx.clone());
            let got = value::get_path(&root, path);
            if got.is_null() {
                Ok(Value::String(path.clone()))
            } else {
                Ok(got.clone())
            }
        }
        Expr::Member(obj, name) => {
            let base = eval(obj, ctx)?;
            Ok(value::get_path(&base, name).clone())
        }
        Expr::Index(obj, index) => {
            let base = eval(obj, ctx)?;
            let idx = eval(index, ctx)?;
            Ok(match (&base, &idx) {
                (Value::Array(items), _) => as_number(&idx)
                    .and_then(|n| items.get(n as usize))
                    .cloned()
                    .unwrap_or(Value::Null),
                (Value::Object(map), Value::String(key)) => {
                    map.get(key).cloned().unwrap_or(Value::Null)
                }
                _ => Value::Null,
            })
        }
        Expr::Unary(op, inner) => {
            let v = eval(inner, ctx)?;
            Ok(match op {
                '!' => Value::Bool(!is_truthy(&v)),
                '-' => as_number(&v).map(|n| number(-n)).unwrap_or(Value::Null),
                _ => Value::Null,
            })
        }
        Expr::Binary(op, left_expr, right_expr) => {
            // Short-circuit the boolean operators, JS-style (operands pass
            // through rather than collapsing to bool).
            if *op == "&&" {
                let left = eval(left_expr, ctx)?;
                return if is_truthy(&left) { eval(right_expr, ctx) } else { Ok(left) };
            }
            if *op == "||" {
                let left = eval(left_expr, ctx)?;
                return if is_truthy(&left) { Ok(left) } else { eval(right_expr, ctx) };
            }
            let left = eval(left_expr, ctx)?;
            let right = eval(right_expr, ctx)?;
            Ok(match *op {
                "==" => Value::Bool(loose_eq(&left, &right)),
                "!=" => Value::Bool(!loose_eq(&left, &right)),
                "<" => Value::Bool(compare(&left, &right) == Some(std::cmp::Ordering::Less)),
                "<=" => Value::Bool(matches!(
                    compare(&left, &right),
                    Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
                )),
                ">" => Value::Bool(compare(&left, &right) == Some(std::cmp::Ordering::Greater)),
                ">=" => Value::Bool(matches!(
                    compare(&left, &right),
                    Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
                )),
                "+" => match (as_number(&left), as_number(&right)) {
                    (Some(a), Some(b))
                        if !matches!(left, Value::String(_)) && !matches!(right, Value::String(_)) =>
                    {
                        number(a + b)
                    }
                    _ => Value::String(to_display_string(&left) + &to_display_string(&right)),
                },
                "-" => numeric_op(&left, &right, |a, b| a - b),
                "*" => numeric_op(&left, &right, |a, b| a * b),
                "/" => match (as_number(&left), as_number(&right)) {
                    (Some(_), Some(b)) if b == 0.0 => Value::Null,
                    (Some(a), Some(b)) => number(a / b),
                    _ => Value::Null,
                },
                "%" => match (as_number(&left), as_number(&right)) {
                    (Some(_), Some(b)) if b == 0.0 => Value::Null,
                    (Some(a), Some(b)) => number(a % b),
                    _ => Value::Null,
                },
                _ => Value::Null,
            })
        }
        Expr::Ternary(cond, then, otherwise) => {
            if is_truthy(&eval(cond, ctx)?) {
                eval(then, ctx)
            } else {
                eval(otherwise, ctx)
            }
        }
        Expr::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, ctx)?);
            }
            Ok(Value::Array(out))
        }
        Expr::Object(pairs) => {
            let mut map = Map::new();
            for (k, v) in pairs {
                map.insert(k.clone(), eval(v, ctx)?);
            }
            Ok(Value::Object(map))
        }
        Expr::Call(name, args) => {
            if args.is_empty() {
                return Err(EngineError::expression(format!(
                    "transform '{name}' called with no input"
                )));
            }
            let input = eval(&args[0], ctx)?;
            let mut rest = Vec::with_capacity(args.len() - 1);
            for a in &args[1..] {
                rest.push(eval(a, ctx)?);
            }
            transforms::apply(name, input, &rest)
        }
        Expr::Pipe(input, stages) => {
            let mut acc = eval(input, ctx)?;
            for (name, arg_exprs) in stages {
                let mut args = Vec::with_capacity(arg_exprs.len());
                for a in arg_exprs {
                    args.push(eval(a, ctx)?);
                }
                acc = transforms::apply(name, acc, &args)?;
            }
            Ok(acc)
        }
    }
}

fn numeric_op(left: &Value, right: &Value, f: impl Fn(f64, f64) -> f64) -> Value {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => number(f(a, b)),
        _ => Value::Null,
    }
}

// ── Public API ─────────────────────────────────────────────────────────────

/// Evaluate a raw expression against a context. The context is read-only.
/// A full-span `${…}` wrapper is unwrapped first, so guards and switch
/// values may be written either bare or in template form.
pub fn evaluate(expr: &str, ctx: &Map<String, Value>) -> EngineResult<Value> {
    let trimmed = expr.trim();
    let unwrapped: Option<String> = if trimmed.starts_with("${") && trimmed.ends_with('}') {
        let chars: Vec<char> = trimmed.chars().collect();
        (find_close(&chars, 1) == Some(chars.len() - 1))
            .then(|| chars[2..chars.len() - 1].iter().collect())
    } else {
        None
    };
    let text = unwrapped.as_deref().unwrap_or(trimmed).trim();
    if text.is_empty() {
        return Ok(Value::Null);
    }
    let tokens = lex(text)?;
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(EngineError::expression(format!("trailing input in '{text}'")));
    }
    eval(&ast, ctx)
}

/// Evaluate a `when` guard: absent guards pass, evaluation errors fail
/// closed (the action is skipped, never run on a broken guard).
pub fn guard_passes(when: Option<&str>, ctx: &Map<String, Value>) -> bool {
    match when {
        None => true,
        Some(expr) => match evaluate(expr, ctx) {
            Ok(v) => is_truthy(&v),
            Err(e) => {
                log::warn!("[expr] Guard '{expr}' failed to evaluate: {e}");
                false
            }
        },
    }
}

/// Find the `}` closing the interpolation whose opening `{` sits at `open`.
/// Tracks nested braces and string literals. Returns the index of the
/// closing brace.
fn find_close(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 1usize; // counts the '{' at `open`
    let mut quote: Option<char> = None;
    let mut i = open + 1;
    while i < chars.len() {
        let c = chars[i];
        match quote {
            Some(q) => {
                if c == '\\' {
                    i += 1;
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            },
        }
        i += 1;
    }
    None
}

/// Interpolate every `${…}` in a template, stringifying results.
/// Characters outside `${…}` pass through untouched; an unbalanced `${`
/// is a recoverable expression error.
pub fn interpolate(template: &str, ctx: &Map<String, Value>) -> EngineResult<String> {
    if !template.contains("${") {
        return Ok(template.to_string());
    }
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '$' && chars.get(i + 1) == Some(&'{') {
            let close = find_close(&chars, i + 1)
                .ok_or_else(|| EngineError::expression("unbalanced '${' in template"))?;
            let inner: String = chars[i + 2..close].iter().collect();
            let v = evaluate(&inner, ctx)?;
            out.push_str(&to_display_string(&v));
            i = close + 1;
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    Ok(out)
}

/// Literal-or-template field evaluation:
///   "${expr}"      → the typed value of expr
///   "a ${b} c"     → interpolated string
///   anything else  → the literal string unchanged
pub fn evaluate_field(text: &str, ctx: &Map<String, Value>) -> EngineResult<Value> {
    let trimmed = text.trim();
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        let chars: Vec<char> = trimmed.chars().collect();
        // Only a full-span ${…} yields a typed value; `${a} ${b}` does not.
        if find_close(&chars, 1) == Some(chars.len() - 1) {
            let inner: String = chars[2..chars.len() - 1].iter().collect();
            return evaluate(&inner, ctx);
        }
    }
    if text.contains("${") {
        return interpolate(text, ctx).map(Value::String);
    }
    Ok(Value::String(text.to_string()))
}

/// Deep-walk a parameter value, applying `evaluate_field` to every string.
/// Arrays and objects recurse; non-string leaves pass through.
pub fn interpolate_value(v: &Value, ctx: &Map<String, Value>) -> EngineResult<Value> {
    Ok(match v {
        Value::String(s) => evaluate_field(s, ctx)?,
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(interpolate_value(item, ctx)?);
            }
            Value::Array(out)
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, val) in map {
                out.insert(k.clone(), interpolate_value(val, ctx)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}
