//! Predicate resolution: which combined predicate applies to a (resource, scope, roles) triple.
//!
//! Class and property resources first walk the schema class hierarchy inside one role, then the
//! wildcard resources, then the role's parent. Functions skip the class step. Resolutions for
//! class and property resources are memoized per role and catalog revision until
//! [`ResolutionEngine::clear_caches`]; a snapshot from an older revision never reads or
//! overwrites entries of a newer one.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{SecurityError, SecurityResult};
use crate::policy::Scope;
use crate::predicate::cache::PredicateCache;
use crate::predicate::{EvalContext, Predicate, PredicateParser};
use crate::privileged::run_without_authorization;
use crate::record::Document;
use crate::resource::{Resource, Target};
use crate::schema::SchemaCatalog;
use crate::snapshot::{ImmutablePolicy, ImmutableRole};

/// Outcome of one class-hierarchy step before defaults apply.
enum Found {
    Absent,
    Present(Predicate),
}

/// Memoized resolutions of one role, valid for a single catalog revision.
struct RoleResolutions {
    revision: u64,
    entries: HashMap<String, Predicate>,
}

#[derive(Clone, Copy)]
enum Column<'a> {
    Class,
    Property(&'a str),
}

pub struct ResolutionEngine {
    schema: Arc<dyn SchemaCatalog>,
    parser: Arc<dyn PredicateParser>,
    predicates: PredicateCache,
    // role name (lowercase) -> resolutions keyed by lowercase resolution key
    resolved: RwLock<HashMap<String, RoleResolutions>>,
}

impl ResolutionEngine {
    pub fn new(schema: Arc<dyn SchemaCatalog>, parser: Arc<dyn PredicateParser>, predicate_cache_size: usize) -> Self {
        Self { schema, parser, predicates: PredicateCache::new(predicate_cache_size), resolved: RwLock::new(HashMap::new()) }
    }

    pub fn schema(&self) -> &Arc<dyn SchemaCatalog> { &self.schema }
    pub fn predicate_cache(&self) -> &PredicateCache { &self.predicates }

    /// Parses rule text through the bounded cache.
    pub fn parse(&self, text: &str) -> SecurityResult<Predicate> {
        self.predicates.parse(text, self.parser.as_ref()).map_err(SecurityError::predicate)
    }

    fn parse_rule(&self, policy: &ImmutablePolicy, text: &str) -> SecurityResult<Predicate> {
        self.predicates.parse(text, self.parser.as_ref()).map_err(|e| {
            tracing::warn!(target: "rowsec::predicate", policy = %policy.name(), "security policy rule failed to parse");
            SecurityError::predicate(e)
        })
    }

    pub fn clear_caches(&self) {
        self.resolved.write().clear();
        self.predicates.clear();
    }

    pub fn resolved_len(&self) -> usize { self.resolved.read().values().map(|m| m.entries.len()).sum() }

    /// Combined predicate for the role set; never absent. Zero roles yield FALSE.
    pub fn resolve(&self, resource: &Resource, scope: Scope, roles: &[Arc<ImmutableRole>]) -> SecurityResult<Predicate> {
        if roles.is_empty() { return Ok(Predicate::False); }
        match resource {
            Resource::Class(Target::Named(class)) => {
                let Some(known) = self.schema.class(class) else { return Ok(Predicate::True) };
                combine(roles, |r| self.for_role(r, &known.name, Column::Class, scope))
            }
            Resource::Property { class: Target::Named(class), property: Target::Named(prop) } => {
                let Some(known) = self.schema.class(class) else { return Ok(Predicate::True) };
                combine(roles, |r| self.for_role(r, &known.name, Column::Property(prop), scope))
            }
            Resource::Function(Target::Named(name)) => {
                Ok(self.resolve_function(name, scope, roles)?.unwrap_or(Predicate::False))
            }
            Resource::Class(Target::Any) | Resource::Property { .. } => Ok(Predicate::True),
            _ => Ok(Predicate::False),
        }
    }

    /// Function resolution; `None` when no role in the set (or their ancestors) binds a policy.
    pub fn resolve_function(&self, name: &str, scope: Scope, roles: &[Arc<ImmutableRole>]) -> SecurityResult<Option<Predicate>> {
        let exact = Resource::function(name);
        let any = Resource::Function(Target::Any);
        let mut parts = Vec::new();
        for role in roles {
            let mut found = None;
            'chain: for r in role.lineage() {
                for res in [&exact, &any] {
                    if let Some(policy) = r.policy(res) {
                        if let Some(text) = policy.rule(scope) {
                            found = Some(self.parse_rule(policy, text)?);
                            break 'chain;
                        }
                    }
                }
            }
            match found {
                Some(p) if p.is_true() => return Ok(Some(Predicate::True)),
                Some(p) => parts.push(p),
                None => {}
            }
        }
        if parts.is_empty() { Ok(None) } else { Ok(Some(Predicate::any(parts))) }
    }

    fn cache_key(class: &str, column: Column<'_>, scope: Scope) -> String {
        match column {
            Column::Class => format!("$CLASS${}${}", class, scope).to_ascii_lowercase(),
            Column::Property(p) => format!("$CLASS${}$PROP${}${}", class, p, scope).to_ascii_lowercase(),
        }
    }

    fn cached(&self, role: &ImmutableRole, key: &str) -> Option<Predicate> {
        if role.id().is_none() { return None; }
        let resolved = self.resolved.read();
        let slot = resolved.get(&role.name().to_ascii_lowercase())?;
        if slot.revision != role.revision() { return None; }
        slot.entries.get(key).cloned()
    }

    /// Stores a resolution unless a newer snapshot of the same role already owns the slot.
    fn remember(&self, role: &ImmutableRole, key: String, predicate: &Predicate) {
        if role.id().is_none() || !predicate.is_cacheable() { return; }
        let mut resolved = self.resolved.write();
        let slot = resolved
            .entry(role.name().to_ascii_lowercase())
            .or_insert_with(|| RoleResolutions { revision: role.revision(), entries: HashMap::new() });
        if slot.revision > role.revision() { return; }
        if slot.revision < role.revision() {
            slot.revision = role.revision();
            slot.entries.clear();
        }
        slot.entries.insert(key, predicate.clone());
    }

    fn for_role(&self, role: &ImmutableRole, class: &str, column: Column<'_>, scope: Scope) -> SecurityResult<Predicate> {
        let key = Self::cache_key(class, column, scope);
        if let Some(hit) = self.cached(role, &key) { return Ok(hit); }

        let mut path = Vec::new();
        let found = match self.class_hierarchy(role, class, column, scope, &mut path)? {
            Found::Present(p) => Some(p),
            Found::Absent => self.wildcards(role, class, column, scope)?,
        };
        let result = match found {
            Some(p) => p,
            None => match role.parent() {
                Some(parent) => self.for_role(parent, class, column, scope)?,
                None => match column {
                    Column::Class => Predicate::False,
                    Column::Property(_) => Predicate::True,
                },
            },
        };
        self.remember(role, key, &result);
        Ok(result)
    }

    fn bound_rule<'r>(role: &'r ImmutableRole, resource: &Resource, scope: Scope) -> Option<(&'r ImmutablePolicy, &'r str)> {
        let policy = role.policy(resource)?;
        policy.rule(scope).map(|text| (policy, text))
    }

    fn class_hierarchy(
        &self,
        role: &ImmutableRole,
        class: &str,
        column: Column<'_>,
        scope: Scope,
        path: &mut Vec<String>,
    ) -> SecurityResult<Found> {
        let lower = class.to_ascii_lowercase();
        if path.contains(&lower) { return Ok(Found::Absent); }

        let resource = match column {
            Column::Class => Resource::class(class),
            Column::Property(p) => Resource::property(class, p),
        };
        if let Some((policy, text)) = Self::bound_rule(role, &resource, scope) {
            return Ok(Found::Present(self.parse_rule(policy, text)?));
        }

        let supers = self.schema.class(class).map(|c| c.superclasses).unwrap_or_default();
        path.push(lower);
        let out = match supers.len() {
            0 => Found::Absent,
            1 => self.class_hierarchy(role, &supers[0], column, scope, path)?,
            _ => {
                let mut parts = Vec::with_capacity(supers.len());
                let mut missing = false;
                for s in &supers {
                    match self.class_hierarchy(role, s, column, scope, path)? {
                        Found::Present(p) => parts.push(p),
                        Found::Absent => missing = true,
                    }
                }
                if parts.is_empty() {
                    Found::Absent
                } else if missing {
                    // one unrestricted superclass column makes the whole column visible
                    match column {
                        Column::Class => Found::Present(Predicate::False),
                        Column::Property(_) => Found::Present(Predicate::True),
                    }
                } else {
                    Found::Present(Predicate::all(parts))
                }
            }
        };
        path.pop();
        Ok(out)
    }

    fn wildcards(&self, role: &ImmutableRole, class: &str, column: Column<'_>, scope: Scope) -> SecurityResult<Option<Predicate>> {
        let order: Vec<Resource> = match column {
            Column::Class => vec![Resource::Class(Target::Any), Resource::All],
            Column::Property(p) => vec![
                Resource::Property { class: Target::Named(class.to_string()), property: Target::Any },
                Resource::Property { class: Target::Any, property: Target::Named(p.to_string()) },
                Resource::Property { class: Target::Any, property: Target::Any },
                Resource::All,
            ],
        };
        for res in &order {
            if let Some((policy, text)) = Self::bound_rule(role, res, scope) {
                return Ok(Some(self.parse_rule(policy, text)?));
            }
        }
        Ok(None)
    }

    /// Evaluates against a private copy of `candidate` in privileged mode.
    /// Constants short-circuit without touching the candidate.
    pub fn evaluate<D: Document + Clone>(&self, predicate: &Predicate, candidate: &D, ctx: &EvalContext<'_>) -> SecurityResult<bool> {
        match predicate {
            Predicate::True => return Ok(true),
            Predicate::False => return Ok(false),
            _ => {}
        }
        let copy = candidate.clone();
        run_without_authorization(|| predicate.evaluate(&copy, ctx)).map_err(|e| {
            tracing::warn!(
                target: "rowsec::predicate",
                record = ?copy.identity(),
                class = copy.class_name().unwrap_or(""),
                "security predicate evaluation failed"
            );
            SecurityError::predicate(e)
        })
    }
}

/// OR across roles with a TRUE short-circuit.
fn combine<F>(roles: &[Arc<ImmutableRole>], mut per_role: F) -> SecurityResult<Predicate>
where
    F: FnMut(&ImmutableRole) -> SecurityResult<Predicate>,
{
    match roles {
        [] => Ok(Predicate::False),
        [only] => per_role(only),
        _ => {
            let mut parts = Vec::with_capacity(roles.len());
            for r in roles {
                let p = per_role(r)?;
                if p.is_true() { return Ok(Predicate::True); }
                parts.push(p);
            }
            Ok(Predicate::any(parts))
        }
    }
}
