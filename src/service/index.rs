//! Optimization index: which (role, class) pairs carry a policy that is not unconditionally true.
//! Gates skip predicate resolution entirely for pairs the index does not mark.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::catalog::SecurityCatalog;
use crate::engine::ResolutionEngine;
use crate::policy::{Scope, SecurityPolicy};
use crate::resource::{Resource, Target};
use crate::schema::SchemaCatalog;
use crate::snapshot::ImmutableRole;

#[derive(Debug, Default, Clone)]
pub struct OptimizationIndex {
    // role name -> classes with a restricting policy, all lowercase
    restricted: HashMap<String, HashSet<String>>,
    version: u64,
}

impl OptimizationIndex {
    /// Scans every role's own and inherited policy bindings against every schema class.
    pub fn build(catalog: &SecurityCatalog, schema: &dyn SchemaCatalog, engine: &ResolutionEngine, version: u64) -> Self {
        let classes = schema.class_names();
        let mut restricted: HashMap<String, HashSet<String>> = HashMap::new();
        for role in catalog.roles() {
            let entry = restricted.entry(role.name().to_ascii_lowercase()).or_default();
            for (resource, pid) in catalog.effective_policies(role.id()) {
                let Some(policy) = catalog.policy(pid) else { continue };
                if is_all_allowed(policy, engine) { continue; }
                for class in &classes {
                    if is_class_involved(schema, class, &resource) { entry.insert(class.to_ascii_lowercase()); }
                }
            }
        }
        tracing::debug!(target: "rowsec::index", roles = restricted.len(), version, "optimization index rebuilt");
        Self { restricted, version }
    }

    pub fn version(&self) -> u64 { self.version }

    pub fn is_restricted(&self, role: &str, class: &str) -> bool {
        self.restricted
            .get(&role.to_ascii_lowercase())
            .map(|set| set.contains(&class.to_ascii_lowercase()))
            .unwrap_or(false)
    }

    /// True when any of the roles has no restricting policy for the class.
    pub fn is_all_allowed(&self, roles: &[Arc<ImmutableRole>], class: &str) -> bool {
        roles.iter().any(|r| !self.is_restricted(r.name(), class))
    }

    pub fn is_class_involved(&self, roles: &[Arc<ImmutableRole>], class: &str) -> bool {
        roles.iter().any(|r| self.is_restricted(r.name(), class))
    }

    pub fn restricted_classes(&self, role: &str) -> Vec<String> {
        let mut out: Vec<String> = self.restricted.get(&role.to_ascii_lowercase()).map(|s| s.iter().cloned().collect()).unwrap_or_default();
        out.sort();
        out
    }
}

/// Every present scope parses to an always-true predicate. Unparseable rules restrict.
fn is_all_allowed(policy: &SecurityPolicy, engine: &ResolutionEngine) -> bool {
    Scope::ALL.iter().all(|s| match policy.rule(*s) {
        None => true,
        Some(text) => match engine.parse(text) {
            Ok(p) => p.is_always_true(),
            Err(_) => {
                tracing::warn!(target: "rowsec::index", policy = %policy.name(), scope = %s, "policy rule does not parse; treated as restricting");
                false
            }
        },
    })
}

fn is_class_involved(schema: &dyn SchemaCatalog, class: &str, resource: &Resource) -> bool {
    match resource {
        Resource::All | Resource::Class(Target::Any) => true,
        Resource::Property { class: Target::Any, .. } => true,
        Resource::Class(Target::Named(c)) | Resource::Property { class: Target::Named(c), .. } => schema.is_subclass_of(class, c),
        _ => false,
    }
}

/// Property resources whose READ rule is set and is not the literal `true`.
pub fn all_filtered_properties(catalog: &SecurityCatalog) -> HashSet<Resource> {
    let mut out = HashSet::new();
    for role in catalog.roles() {
        for b in role.policies() {
            if !matches!(b.resource, Resource::Property { .. }) { continue; }
            let Some(policy) = catalog.policy(b.policy) else { continue };
            if let Some(read) = policy.rule(Scope::Read) {
                if !read.trim().eq_ignore_ascii_case("true") { out.insert(b.resource.clone()); }
            }
        }
    }
    out
}
