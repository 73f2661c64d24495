//! Predicates: the constants, the opaque expression seam and the evaluation context.

pub mod basic;
pub mod cache;

use std::collections::HashMap;
use std::fmt;

use once_cell::unsync::OnceCell;

use crate::record::{Document, Record, RecordId, RecordStore, Value};

/// A parsed predicate expression supplied by the parser collaborator.
pub trait Expression: Send + Sync + fmt::Debug {
    fn evaluate(&self, target: &dyn Document, ctx: &EvalContext<'_>) -> anyhow::Result<bool>;
    fn is_always_true(&self) -> bool;
    /// False when the expression depends on session state other than the current user.
    fn is_cacheable(&self) -> bool;
    fn copy(&self) -> Box<dyn Expression>;
}

pub trait PredicateParser: Send + Sync {
    fn parse(&self, text: &str) -> anyhow::Result<Box<dyn Expression>>;
}

/// Combined predicate produced by resolution. Cloning deep-copies parsed expressions.
#[derive(Debug)]
pub enum Predicate {
    True,
    False,
    Expr(Box<dyn Expression>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Clone for Predicate {
    fn clone(&self) -> Self {
        match self {
            Predicate::True => Predicate::True,
            Predicate::False => Predicate::False,
            Predicate::Expr(e) => Predicate::Expr(e.copy()),
            Predicate::And(v) => Predicate::And(v.clone()),
            Predicate::Or(v) => Predicate::Or(v.clone()),
        }
    }
}

impl Predicate {
    pub fn is_true(&self) -> bool { matches!(self, Predicate::True) }
    pub fn is_false(&self) -> bool { matches!(self, Predicate::False) }

    pub fn is_always_true(&self) -> bool {
        match self {
            Predicate::True => true,
            Predicate::False => false,
            Predicate::Expr(e) => e.is_always_true(),
            Predicate::And(v) => v.iter().all(|p| p.is_always_true()),
            Predicate::Or(v) => v.iter().any(|p| p.is_always_true()),
        }
    }

    pub fn is_cacheable(&self) -> bool {
        match self {
            Predicate::True | Predicate::False => true,
            Predicate::Expr(e) => e.is_cacheable(),
            Predicate::And(v) | Predicate::Or(v) => v.iter().all(|p| p.is_cacheable()),
        }
    }

    /// Conjunction of parts; any FALSE wins, TRUE parts drop out.
    pub fn all(parts: Vec<Predicate>) -> Predicate {
        let mut kept = Vec::with_capacity(parts.len());
        for p in parts {
            match p {
                Predicate::False => return Predicate::False,
                Predicate::True => {}
                other => kept.push(other),
            }
        }
        match kept.len() {
            0 => Predicate::True,
            1 => kept.pop().unwrap_or(Predicate::True),
            _ => Predicate::And(kept),
        }
    }

    /// Disjunction of parts; any TRUE wins, FALSE parts drop out.
    pub fn any(parts: Vec<Predicate>) -> Predicate {
        let mut kept = Vec::with_capacity(parts.len());
        for p in parts {
            match p {
                Predicate::True => return Predicate::True,
                Predicate::False => {}
                other => kept.push(other),
            }
        }
        match kept.len() {
            0 => Predicate::False,
            1 => kept.pop().unwrap_or(Predicate::False),
            _ => Predicate::Or(kept),
        }
    }

    pub fn evaluate(&self, target: &dyn Document, ctx: &EvalContext<'_>) -> anyhow::Result<bool> {
        match self {
            Predicate::True => Ok(true),
            Predicate::False => Ok(false),
            Predicate::Expr(e) => e.evaluate(target, ctx),
            Predicate::And(v) => {
                for p in v {
                    if !p.evaluate(target, ctx)? { return Ok(false); }
                }
                Ok(true)
            }
            Predicate::Or(v) => {
                for p in v {
                    if p.evaluate(target, ctx)? { return Ok(true); }
                }
                Ok(false)
            }
        }
    }
}

type UserLoader<'a> = Box<dyn Fn() -> Option<Record> + 'a>;

/// Per-evaluation bindings. `$currentUser` is loaded on first reference only.
pub struct EvalContext<'a> {
    store: Option<&'a dyn RecordStore>,
    user_loader: Option<UserLoader<'a>>,
    current_user: OnceCell<Option<Record>>,
    variables: HashMap<String, Value>,
}

impl Default for EvalContext<'_> {
    fn default() -> Self { Self { store: None, user_loader: None, current_user: OnceCell::new(), variables: HashMap::new() } }
}

impl<'a> EvalContext<'a> {
    pub fn new() -> Self { Self::default() }

    pub fn with_store(mut self, store: &'a dyn RecordStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_current_user<F: Fn() -> Option<Record> + 'a>(mut self, loader: F) -> Self {
        self.user_loader = Some(Box::new(loader));
        self
    }

    pub fn with_variable<S: Into<String>>(mut self, name: S, value: Value) -> Self {
        self.variables.insert(name.into().to_ascii_lowercase(), value);
        self
    }

    pub fn current_user(&self) -> Option<&Record> {
        self.current_user.get_or_init(|| self.user_loader.as_ref().and_then(|load| load())).as_ref()
    }

    pub fn current_user_loaded(&self) -> bool { self.current_user.get().is_some() }

    pub fn variable(&self, name: &str) -> Option<&Value> { self.variables.get(&name.to_ascii_lowercase()) }

    pub fn load(&self, id: &RecordId) -> anyhow::Result<Option<Record>> {
        match self.store {
            Some(s) => s.load(id),
            None => Ok(None),
        }
    }
}
