//! Immutable snapshots of roles, principals and policies.
//! Built once per authentication from the live catalog; they have no mutators and are shared
//! freely across threads behind `Arc`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::catalog::SecurityCatalog;
use crate::error::{SecurityError, SecurityResult};
use crate::policy::{effective, Scope, SecurityPolicy};
use crate::record::RecordId;
use crate::resource::Resource;
use crate::role::{AllowMode, RoleId};
use crate::rule::{check_local, legacy_resource, Permission, PermissionRule, ResourceGeneric};
use crate::user::{denied_message, inactive_message, no_role_message, AccountStatus, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImmutablePolicy {
    name: String,
    active: bool,
    rules: BTreeMap<Scope, String>,
}

impl ImmutablePolicy {
    pub fn of(policy: &SecurityPolicy) -> Self {
        let rules = Scope::ALL.iter().filter_map(|s| policy.raw_rule(*s).map(|r| (*s, r.to_string()))).collect();
        Self { name: policy.name().to_string(), active: policy.is_active(), rules }
    }

    fn allow_all(name: &str) -> Self {
        Self { name: name.to_string(), active: true, rules: Scope::ALL.iter().map(|s| (*s, "true".to_string())).collect() }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn is_active(&self) -> bool { self.active }
    pub fn rule(&self, scope: Scope) -> Option<&str> { effective(self.active, self.rules.get(&scope).map(|s| s.as_str())) }
}

#[derive(Debug, Clone)]
pub struct BoundPolicy {
    pub resource: Resource,
    pub policy: Arc<ImmutablePolicy>,
}

#[derive(Debug, Clone)]
pub struct ImmutableRole {
    id: Option<RoleId>,
    revision: u64,
    name: String,
    mode: AllowMode,
    parent: Option<Arc<ImmutableRole>>,
    rules: HashMap<ResourceGeneric, PermissionRule>,
    policies: HashMap<String, BoundPolicy>,
}

impl ImmutableRole {
    /// Deep snapshot of a live role including its whole parent chain.
    pub fn snapshot(catalog: &SecurityCatalog, id: RoleId) -> Option<Arc<ImmutableRole>> {
        let mut visiting = HashSet::new();
        Self::snapshot_inner(catalog, id, &mut visiting)
    }

    fn snapshot_inner(catalog: &SecurityCatalog, id: RoleId, visiting: &mut HashSet<RoleId>) -> Option<Arc<ImmutableRole>> {
        if !visiting.insert(id) { return None; }
        let role = catalog.role(id)?;
        let parent = role.parent().and_then(|p| Self::snapshot_inner(catalog, p, visiting));
        let policies = role
            .policies()
            .filter_map(|b| {
                let p = catalog.policy(b.policy)?;
                Some((b.resource.key(), BoundPolicy { resource: b.resource.clone(), policy: Arc::new(ImmutablePolicy::of(p)) }))
            })
            .collect();
        Some(Arc::new(ImmutableRole {
            id: Some(id),
            revision: catalog.revision(),
            name: role.name().to_string(),
            mode: role.mode(),
            parent,
            rules: role.rule_map().clone(),
            policies,
        }))
    }

    /// Synthetic role for accounts defined outside the database. `"*"` grants ALL on every
    /// generic resource plus an all-true wildcard policy; otherwise each comma separated
    /// legacy resource gets ALL.
    pub fn root(name: &str, resources: &str) -> SecurityResult<ImmutableRole> {
        let mut rules = HashMap::new();
        let mut policies = HashMap::new();
        if resources.trim() == "*" {
            for g in ResourceGeneric::VALUES {
                rules.insert(g, PermissionRule::with_access(g, None, Permission::ALL));
            }
            policies.insert(Resource::All.key(), BoundPolicy { resource: Resource::All, policy: Arc::new(ImmutablePolicy::allow_all("root_all")) });
        } else {
            for item in resources.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let (generic, specific) = legacy_resource(item).ok_or_else(|| {
                    SecurityError::invalid_resource(item, anyhow::anyhow!("unknown legacy resource"))
                })?;
                rules
                    .entry(generic)
                    .or_insert_with(|| PermissionRule::new(generic))
                    .grant_access(specific.as_deref(), Permission::ALL);
            }
        }
        Ok(ImmutableRole { id: None, revision: 0, name: name.to_string(), mode: AllowMode::AllowAllButSpecified, parent: None, rules, policies })
    }

    pub fn id(&self) -> Option<RoleId> { self.id }
    /// Catalog revision the snapshot was taken at.
    pub fn revision(&self) -> u64 { self.revision }
    pub fn name(&self) -> &str { &self.name }
    pub fn identity(&self) -> Option<RecordId> { self.id.map(|i| i.identity()) }
    pub fn mode(&self) -> AllowMode { self.mode }
    pub fn parent(&self) -> Option<&ImmutableRole> { self.parent.as_deref() }
    pub fn rule(&self, generic: ResourceGeneric) -> Option<&PermissionRule> { self.rules.get(&generic) }

    pub fn has_rule(&self, generic: ResourceGeneric, specific: Option<&str>) -> bool {
        match (self.rules.get(&generic), specific) {
            (None, _) => false,
            (Some(rule), Some(name)) => rule.contains_specific_resource(name),
            (Some(_), None) => true,
        }
    }

    pub fn allow(&self, generic: ResourceGeneric, specific: Option<&str>, op: Permission) -> bool {
        let mut cursor = Some(self);
        while let Some(role) = cursor {
            if let Some(v) = check_local(&role.rules, generic, specific, op) { return v; }
            cursor = role.parent();
        }
        false
    }

    pub fn policy(&self, resource: &Resource) -> Option<&ImmutablePolicy> { self.policy_by_key(&resource.key()) }
    pub(crate) fn policy_by_key(&self, key: &str) -> Option<&ImmutablePolicy> { self.policies.get(key).map(|b| b.policy.as_ref()) }
    pub fn policies(&self) -> impl Iterator<Item = &BoundPolicy> { self.policies.values() }

    /// Self then ancestors.
    pub fn lineage(&self) -> impl Iterator<Item = &ImmutableRole> {
        let mut cursor = Some(self);
        std::iter::from_fn(move || {
            let cur = cursor?;
            cursor = cur.parent();
            Some(cur)
        })
    }
}

#[derive(Debug, Clone)]
pub struct ImmutablePrincipal {
    id: Option<UserId>,
    name: String,
    status: AccountStatus,
    roles: Vec<Arc<ImmutableRole>>,
}

impl ImmutablePrincipal {
    /// Snapshot of a live user; dangling role references are skipped with a warning.
    pub fn snapshot(catalog: &SecurityCatalog, id: UserId) -> Option<ImmutablePrincipal> {
        let user = catalog.user(id)?;
        let mut roles = Vec::with_capacity(user.roles().len());
        for rid in user.roles() {
            match ImmutableRole::snapshot(catalog, *rid) {
                Some(r) => roles.push(r),
                None => tracing::warn!(target: "rowsec::auth", user = %user.name(), role = rid.0, "user references a missing role; skipped"),
            }
        }
        Some(ImmutablePrincipal { id: Some(id), name: user.name().to_string(), status: user.status(), roles })
    }

    /// Account defined outside the database, backed by a synthetic root role.
    pub fn server_account(name: &str, resources: &str) -> SecurityResult<ImmutablePrincipal> {
        let role = ImmutableRole::root(name, resources)?;
        Ok(ImmutablePrincipal { id: None, name: name.to_string(), status: AccountStatus::Active, roles: vec![Arc::new(role)] })
    }

    pub fn id(&self) -> Option<UserId> { self.id }
    pub fn name(&self) -> &str { &self.name }
    pub fn status(&self) -> AccountStatus { self.status }
    pub fn is_active(&self) -> bool { self.status == AccountStatus::Active }
    pub fn identity(&self) -> Option<RecordId> { self.id.map(|i| i.identity()) }
    pub fn roles(&self) -> &[Arc<ImmutableRole>] { &self.roles }

    pub fn check_active(&self) -> SecurityResult<()> {
        if self.is_active() { Ok(()) } else { Err(SecurityError::access_denied(inactive_message(&self.name))) }
    }

    pub fn has_role(&self, name: &str, include_inherited: bool) -> bool {
        self.roles.iter().any(|r| {
            if include_inherited { r.lineage().any(|l| l.name().eq_ignore_ascii_case(name)) } else { r.name().eq_ignore_ascii_case(name) }
        })
    }

    /// First role that allows the operation.
    pub fn allow(&self, generic: ResourceGeneric, specific: Option<&str>, op: Permission) -> SecurityResult<&Arc<ImmutableRole>> {
        if self.roles.is_empty() { return Err(SecurityError::access_denied(no_role_message(&self.name))); }
        self.roles
            .iter()
            .find(|r| r.allow(generic, specific, op))
            .ok_or_else(|| SecurityError::access_denied(denied_message(&self.name, generic, specific, op)))
    }

    pub fn is_rule_defined(&self, generic: ResourceGeneric, specific: Option<&str>) -> bool {
        self.roles.iter().any(|r| r.lineage().any(|l| l.has_rule(generic, specific)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> SecurityCatalog {
        let mut c = SecurityCatalog::new();
        c.create_role("base", None).unwrap();
        c.create_role("child", Some("base")).unwrap();
        c.grant("base", ResourceGeneric::Class, None, Permission::READ).unwrap();
        let p = c.create_policy("p").unwrap();
        c.policy_mut("p").unwrap().set_rule(Scope::Read, Some("true"));
        c.attach_policy("child", Resource::class("Doc"), p).unwrap();
        c.create_user("alice", String::new(), &["child"]).unwrap();
        c
    }

    #[test]
    fn snapshot_is_disconnected_from_live_graph() {
        let mut c = catalog();
        let alice = c.user_id("alice").unwrap();
        let snap = ImmutablePrincipal::snapshot(&c, alice).unwrap();
        c.grant("base", ResourceGeneric::Class, None, Permission::DELETE).unwrap();
        c.policy_mut("p").unwrap().set_rule(Scope::Read, Some("false"));
        let child = &snap.roles()[0];
        assert!(!child.allow(ResourceGeneric::Class, Some("Doc"), Permission::DELETE));
        assert_eq!(child.policy(&Resource::class("doc")).unwrap().rule(Scope::Read), Some("true"));
        assert_eq!(child.parent().unwrap().name(), "base");
    }

    #[test]
    fn principal_allow_returns_role() {
        let c = catalog();
        let snap = ImmutablePrincipal::snapshot(&c, c.user_id("alice").unwrap()).unwrap();
        let role = snap.allow(ResourceGeneric::Class, Some("Doc"), Permission::READ).unwrap();
        assert_eq!(role.name(), "child");
        assert!(snap.allow(ResourceGeneric::Class, Some("Doc"), Permission::UPDATE).is_err());
        assert!(snap.has_role("base", true));
        assert!(!snap.has_role("base", false));
        assert!(snap.is_rule_defined(ResourceGeneric::Class, Some("Doc")));
    }

    #[test]
    fn root_role_all() {
        let p = ImmutablePrincipal::server_account("root", "*").unwrap();
        let r = &p.roles()[0];
        for g in ResourceGeneric::VALUES {
            assert!(r.allow(g, None, Permission::ALL), "{}", g);
        }
        let wildcard = r.policy(&Resource::All).unwrap();
        for s in Scope::ALL { assert_eq!(wildcard.rule(s), Some("true")); }
    }

    #[test]
    fn root_role_from_resource_list() {
        let p = ImmutablePrincipal::server_account("ops", "database.class.Doc, server").unwrap();
        let r = &p.roles()[0];
        assert!(r.allow(ResourceGeneric::Class, Some("Doc"), Permission::DELETE));
        assert!(!r.allow(ResourceGeneric::Class, Some("Other"), Permission::READ));
        assert!(r.allow(ResourceGeneric::Server, None, Permission::READ));
        assert!(r.policies().next().is_none());
        assert!(ImmutablePrincipal::server_account("x", "bogus").is_err());
    }
}
