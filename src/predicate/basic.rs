//! Small boolean expression language for security predicates.
//!
//! Supports comparisons (`=`, `<>`, `!=`, `<`, `<=`, `>`, `>=`), `LIKE`, `MATCHES`, `IN [..]`,
//! `CONTAINS`, `IS [NOT] NULL`, `AND`/`OR`/`NOT`, parentheses, literals, property paths
//! (`owner.name`, `@rid`, `@class`) and variables (`$currentUser`, `$currentUser.name`).
//! Expressions built only from literals are folded to constants at parse time.

use std::cmp::Ordering;

use anyhow::{anyhow, bail, Result};
use regex::Regex;

use super::{EvalContext, Expression, PredicateParser};
use crate::record::{Document, RecordId, Value};

const CURRENT_USER: &str = "$currentuser";

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
}

fn lex(input: &str) -> Result<Vec<Tok>> {
    let chars: Vec<char> = input.chars().collect();
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() { i += 1; continue; }
        match c {
            '(' => { out.push(Tok::LParen); i += 1; }
            ')' => { out.push(Tok::RParen); i += 1; }
            '[' => { out.push(Tok::LBracket); i += 1; }
            ']' => { out.push(Tok::RBracket); i += 1; }
            ',' => { out.push(Tok::Comma); i += 1; }
            '.' => { out.push(Tok::Dot); i += 1; }
            '=' => { out.push(Tok::Op("=")); i += 1; }
            '<' => {
                match chars.get(i + 1) {
                    Some('=') => { out.push(Tok::Op("<=")); i += 2; }
                    Some('>') => { out.push(Tok::Op("<>")); i += 2; }
                    _ => { out.push(Tok::Op("<")); i += 1; }
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') { out.push(Tok::Op(">=")); i += 2; } else { out.push(Tok::Op(">")); i += 1; }
            }
            '!' if chars.get(i + 1) == Some(&'=') => { out.push(Tok::Op("<>")); i += 2; }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    let Some(&ch) = chars.get(i) else { bail!("unterminated string literal") };
                    if ch == '\\' {
                        if let Some(&next) = chars.get(i + 1) { s.push(next); i += 2; continue; }
                    }
                    if ch == quote {
                        // doubled quote escapes itself
                        if chars.get(i + 1) == Some(&quote) { s.push(quote); i += 2; continue; }
                        i += 1;
                        break;
                    }
                    s.push(ch);
                    i += 1;
                }
                out.push(Tok::Str(s));
            }
            '-' | '0'..='9' => {
                let start = i;
                if c == '-' {
                    if !chars.get(i + 1).map(|d| d.is_ascii_digit()).unwrap_or(false) { bail!("unexpected '-'"); }
                    i += 1;
                }
                while i < chars.len() && chars[i].is_ascii_digit() { i += 1; }
                let mut is_float = false;
                if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                    is_float = true;
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() { i += 1; }
                }
                let text: String = chars[start..i].iter().collect();
                if is_float { out.push(Tok::Float(text.parse()?)); } else { out.push(Tok::Int(text.parse()?)); }
            }
            '`' => {
                let mut s = String::new();
                i += 1;
                loop {
                    let Some(&ch) = chars.get(i) else { bail!("unterminated quoted identifier") };
                    i += 1;
                    if ch == '`' { break; }
                    s.push(ch);
                }
                out.push(Tok::Ident(s));
            }
            c if c.is_alphabetic() || c == '_' || c == '@' || c == '$' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') { i += 1; }
                out.push(Tok::Ident(chars[start..i].iter().collect()));
            }
            other => bail!("unexpected character '{}'", other),
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Literal(Value),
    Path(Vec<String>),
    List(Vec<Operand>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Contains,
}

#[derive(Debug, Clone)]
enum Node {
    Const(bool),
    Cmp(Operand, CmpOp, Operand),
    // LIKE / MATCHES with a literal pattern, compiled once
    Pattern(Operand, Regex),
    // LIKE / MATCHES with a computed pattern
    DynPattern { left: Operand, right: Operand, like: bool },
    IsNull(Operand, bool),
    Truthy(Operand),
    Not(Box<Node>),
    And(Vec<Node>),
    Or(Vec<Node>),
}

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> { self.toks.get(self.pos) }

    fn next(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn peek_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Tok::Ident(s)) if s.eq_ignore_ascii_case(kw))
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.peek_kw(kw) { self.pos += 1; true } else { false }
    }

    fn expect(&mut self, tok: Tok) -> Result<()> {
        match self.next() {
            Some(t) if t == tok => Ok(()),
            Some(t) => bail!("expected {:?}, found {:?}", tok, t),
            None => bail!("expected {:?}, found end of input", tok),
        }
    }

    fn parse_or(&mut self) -> Result<Node> {
        let mut parts = vec![self.parse_and()?];
        while self.eat_kw("or") { parts.push(self.parse_and()?); }
        Ok(if parts.len() == 1 { parts.remove(0) } else { Node::Or(parts) })
    }

    fn parse_and(&mut self) -> Result<Node> {
        let mut parts = vec![self.parse_not()?];
        while self.eat_kw("and") { parts.push(self.parse_not()?); }
        Ok(if parts.len() == 1 { parts.remove(0) } else { Node::And(parts) })
    }

    fn parse_not(&mut self) -> Result<Node> {
        if self.eat_kw("not") { return Ok(Node::Not(Box::new(self.parse_not()?))); }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Node> {
        if self.peek() == Some(&Tok::LParen) {
            self.pos += 1;
            let inner = self.parse_or()?;
            self.expect(Tok::RParen)?;
            return Ok(inner);
        }
        let left = self.parse_operand()?;
        let op = match self.peek() {
            Some(Tok::Op(o)) => {
                let o = *o;
                self.pos += 1;
                match o {
                    "=" => CmpOp::Eq,
                    "<>" => CmpOp::Ne,
                    "<" => CmpOp::Lt,
                    "<=" => CmpOp::Le,
                    ">" => CmpOp::Gt,
                    _ => CmpOp::Ge,
                }
            }
            Some(Tok::Ident(k)) if k.eq_ignore_ascii_case("in") => { self.pos += 1; CmpOp::In }
            Some(Tok::Ident(k)) if k.eq_ignore_ascii_case("contains") => { self.pos += 1; CmpOp::Contains }
            Some(Tok::Ident(k)) if k.eq_ignore_ascii_case("like") || k.eq_ignore_ascii_case("matches") => {
                let like = k.eq_ignore_ascii_case("like");
                self.pos += 1;
                let right = self.parse_operand()?;
                return match right {
                    Operand::Literal(Value::String(p)) => Ok(Node::Pattern(left, compile_pattern(&p, like)?)),
                    other => Ok(Node::DynPattern { left, right: other, like }),
                };
            }
            Some(Tok::Ident(k)) if k.eq_ignore_ascii_case("is") => {
                self.pos += 1;
                let negated = self.eat_kw("not");
                if !self.eat_kw("null") { bail!("expected NULL after IS"); }
                return Ok(Node::IsNull(left, negated));
            }
            _ => return Ok(Node::Truthy(left)),
        };
        let right = self.parse_operand()?;
        Ok(Node::Cmp(left, op, right))
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        match self.next() {
            Some(Tok::Str(s)) => Ok(Operand::Literal(Value::String(s))),
            Some(Tok::Int(n)) => Ok(Operand::Literal(Value::Integer(n))),
            Some(Tok::Float(f)) => Ok(Operand::Literal(Value::Float(f))),
            Some(Tok::LBracket) => {
                let mut items = Vec::new();
                if self.peek() == Some(&Tok::RBracket) { self.pos += 1; return Ok(Operand::List(items)); }
                loop {
                    items.push(self.parse_operand()?);
                    match self.next() {
                        Some(Tok::Comma) => continue,
                        Some(Tok::RBracket) => break,
                        _ => bail!("expected ',' or ']' in list"),
                    }
                }
                Ok(Operand::List(items))
            }
            Some(Tok::Ident(id)) => {
                if id.eq_ignore_ascii_case("true") { return Ok(Operand::Literal(Value::Bool(true))); }
                if id.eq_ignore_ascii_case("false") { return Ok(Operand::Literal(Value::Bool(false))); }
                if id.eq_ignore_ascii_case("null") { return Ok(Operand::Literal(Value::Null)); }
                if is_keyword(&id) { bail!("unexpected keyword '{}'", id); }
                let mut path = vec![id];
                while self.peek() == Some(&Tok::Dot) {
                    self.pos += 1;
                    match self.next() {
                        Some(Tok::Ident(seg)) => path.push(seg),
                        _ => bail!("expected a name after '.'"),
                    }
                }
                Ok(Operand::Path(path))
            }
            Some(t) => bail!("unexpected token {:?}", t),
            None => bail!("unexpected end of input"),
        }
    }
}

fn is_keyword(id: &str) -> bool {
    ["and", "or", "not", "in", "contains", "like", "matches", "is"].iter().any(|k| id.eq_ignore_ascii_case(k))
}

fn compile_pattern(pattern: &str, like: bool) -> Result<Regex> {
    let source = if like {
        let mut s = String::from("^");
        for ch in pattern.chars() {
            match ch {
                '%' => s.push_str(".*"),
                '_' => s.push('.'),
                c => s.push_str(&regex::escape(&c.to_string())),
            }
        }
        s.push('$');
        s
    } else {
        format!("^(?:{})$", pattern)
    };
    Regex::new(&source).map_err(|e| anyhow!("invalid pattern: {}", e))
}

// ---- constant folding ----

fn literal_value(o: &Operand) -> Option<Value> {
    match o {
        Operand::Literal(v) => Some(v.clone()),
        Operand::List(items) => items.iter().map(literal_value).collect::<Option<Vec<_>>>().map(Value::List),
        Operand::Path(_) => None,
    }
}

fn fold(node: Node) -> Node {
    match node {
        Node::Cmp(l, op, r) => match (literal_value(&l), literal_value(&r)) {
            (Some(a), Some(b)) => Node::Const(compare(&a, op, &b)),
            _ => Node::Cmp(l, op, r),
        },
        Node::Pattern(l, re) => match literal_value(&l) {
            Some(Value::String(s)) => Node::Const(re.is_match(&s)),
            Some(_) => Node::Const(false),
            None => Node::Pattern(l, re),
        },
        Node::IsNull(o, neg) => match literal_value(&o) {
            Some(v) => Node::Const(v.is_null() != neg),
            None => Node::IsNull(o, neg),
        },
        Node::Truthy(o) => match literal_value(&o) {
            Some(v) => Node::Const(v == Value::Bool(true)),
            None => Node::Truthy(o),
        },
        Node::Not(inner) => match fold(*inner) {
            Node::Const(b) => Node::Const(!b),
            other => Node::Not(Box::new(other)),
        },
        Node::And(parts) => {
            let mut kept = Vec::new();
            for p in parts {
                match fold(p) {
                    Node::Const(false) => return Node::Const(false),
                    Node::Const(true) => {}
                    other => kept.push(other),
                }
            }
            if kept.is_empty() { Node::Const(true) } else if kept.len() == 1 { kept.remove(0) } else { Node::And(kept) }
        }
        Node::Or(parts) => {
            let mut kept = Vec::new();
            for p in parts {
                match fold(p) {
                    Node::Const(true) => return Node::Const(true),
                    Node::Const(false) => {}
                    other => kept.push(other),
                }
            }
            if kept.is_empty() { Node::Const(false) } else if kept.len() == 1 { kept.remove(0) } else { Node::Or(kept) }
        }
        other => other,
    }
}

fn operand_cacheable(o: &Operand) -> bool {
    match o {
        Operand::Literal(_) => true,
        Operand::List(items) => items.iter().all(operand_cacheable),
        Operand::Path(p) => match p.first() {
            Some(head) if head.starts_with('$') => head.eq_ignore_ascii_case(CURRENT_USER),
            _ => true,
        },
    }
}

fn node_cacheable(n: &Node) -> bool {
    match n {
        Node::Const(_) => true,
        Node::Cmp(l, _, r) => operand_cacheable(l) && operand_cacheable(r),
        Node::Pattern(l, _) | Node::IsNull(l, _) | Node::Truthy(l) => operand_cacheable(l),
        Node::DynPattern { left, right, .. } => operand_cacheable(left) && operand_cacheable(right),
        Node::Not(inner) => node_cacheable(inner),
        Node::And(v) | Node::Or(v) => v.iter().all(node_cacheable),
    }
}

// ---- evaluation ----

fn navigate(start: Value, rest: &[String], ctx: &EvalContext<'_>) -> Result<Value> {
    let mut cur = start;
    for seg in rest {
        cur = match cur {
            Value::Link(id) => match ctx.load(&id)? {
                Some(rec) => rec.property(seg).unwrap_or(Value::Null),
                None => Value::Null,
            },
            Value::Map(m) => m.get(seg.as_str()).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        };
    }
    Ok(cur)
}

fn resolve(o: &Operand, target: &dyn Document, ctx: &EvalContext<'_>) -> Result<Value> {
    match o {
        Operand::Literal(v) => Ok(v.clone()),
        Operand::List(items) => Ok(Value::List(items.iter().map(|i| resolve(i, target, ctx)).collect::<Result<Vec<_>>>()?)),
        Operand::Path(path) => {
            let (head, rest) = match path.split_first() {
                Some(split) => split,
                None => return Ok(Value::Null),
            };
            if head.eq_ignore_ascii_case(CURRENT_USER) {
                let Some(user) = ctx.current_user() else { return Ok(Value::Null) };
                return match rest.split_first() {
                    None => Ok(Value::Link(user.id())),
                    Some((first, more)) => navigate(user.property(first).unwrap_or(Value::Null), more, ctx),
                };
            }
            if let Some(var) = head.strip_prefix('$') {
                let start = ctx.variable(var).cloned().unwrap_or(Value::Null);
                return navigate(start, rest, ctx);
            }
            navigate(target.property(head).unwrap_or(Value::Null), rest, ctx)
        }
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Integer(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn as_link(v: &Value) -> Option<RecordId> {
    match v {
        Value::Link(id) => Some(*id),
        Value::String(s) if s.starts_with('#') => s.parse().ok(),
        _ => None,
    }
}

fn items(v: &Value) -> Option<Vec<Value>> {
    match v {
        Value::List(items) => Some(items.clone()),
        Value::LinkSet(ids) => Some(ids.iter().map(|i| Value::Link(*i)).collect()),
        Value::LinkBag(bag) => Some(bag.materialize().into_iter().map(Value::Link).collect()),
        Value::Map(m) => Some(m.values().cloned().collect()),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) { return x == y; }
    match (a, b) {
        (Value::Link(_), _) | (_, Value::Link(_)) => match (as_link(a), as_link(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        _ => a.unboxed() == b.unboxed(),
    }
}

fn ordering(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) { return x.partial_cmp(&y); }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn compare(a: &Value, op: CmpOp, b: &Value) -> bool {
    match op {
        CmpOp::Eq => values_equal(a, b),
        CmpOp::Ne => !values_equal(a, b),
        CmpOp::Lt => ordering(a, b) == Some(Ordering::Less),
        CmpOp::Le => matches!(ordering(a, b), Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Gt => ordering(a, b) == Some(Ordering::Greater),
        CmpOp::Ge => matches!(ordering(a, b), Some(Ordering::Greater | Ordering::Equal)),
        CmpOp::In => items(b).map(|xs| xs.iter().any(|x| values_equal(a, x))).unwrap_or(false),
        CmpOp::Contains => items(a).map(|xs| xs.iter().any(|x| values_equal(x, b))).unwrap_or(false),
    }
}

fn eval(node: &Node, target: &dyn Document, ctx: &EvalContext<'_>) -> Result<bool> {
    Ok(match node {
        Node::Const(b) => *b,
        Node::Cmp(l, op, r) => compare(&resolve(l, target, ctx)?, *op, &resolve(r, target, ctx)?),
        Node::Pattern(l, re) => match resolve(l, target, ctx)? {
            Value::String(s) => re.is_match(&s),
            _ => false,
        },
        Node::DynPattern { left, right, like } => {
            let pattern = match resolve(right, target, ctx)? {
                Value::String(p) => p,
                Value::Null => return Ok(false),
                _ => bail!("pattern operand is not a string"),
            };
            let re = compile_pattern(&pattern, *like)?;
            match resolve(left, target, ctx)? {
                Value::String(s) => re.is_match(&s),
                _ => false,
            }
        }
        Node::IsNull(o, negated) => resolve(o, target, ctx)?.is_null() != *negated,
        Node::Truthy(o) => resolve(o, target, ctx)? == Value::Bool(true),
        Node::Not(inner) => !eval(inner, target, ctx)?,
        Node::And(parts) => {
            for p in parts {
                if !eval(p, target, ctx)? { return Ok(false); }
            }
            true
        }
        Node::Or(parts) => {
            for p in parts {
                if eval(p, target, ctx)? { return Ok(true); }
            }
            false
        }
    })
}

#[derive(Debug, Clone)]
pub struct BasicExpression {
    root: Node,
    cacheable: bool,
}

impl Expression for BasicExpression {
    fn evaluate(&self, target: &dyn Document, ctx: &EvalContext<'_>) -> Result<bool> { eval(&self.root, target, ctx) }
    fn is_always_true(&self) -> bool { matches!(self.root, Node::Const(true)) }
    fn is_cacheable(&self) -> bool { self.cacheable }
    fn copy(&self) -> Box<dyn Expression> { Box::new(self.clone()) }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BasicPredicateParser;

impl BasicPredicateParser {
    pub fn parse_expression(&self, text: &str) -> Result<BasicExpression> {
        let toks = lex(text)?;
        if toks.is_empty() { bail!("empty predicate"); }
        let mut p = Parser { toks, pos: 0 };
        let root = p.parse_or()?;
        if p.pos < p.toks.len() { bail!("unexpected trailing input"); }
        let root = fold(root);
        let cacheable = node_cacheable(&root);
        Ok(BasicExpression { root, cacheable })
    }
}

impl PredicateParser for BasicPredicateParser {
    fn parse(&self, text: &str) -> Result<Box<dyn Expression>> { Ok(Box::new(self.parse_expression(text)?)) }
}
