//! Live security graph: an arena of roles, users and policies addressed by stable ids.
//! Mutated by admin operations under the service's catalog lock; sessions never read it directly
//! and work from immutable snapshots instead.

pub mod records;

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{SecurityError, SecurityResult};
use crate::policy::{PolicyId, SecurityPolicy};
use crate::record::{Record, Value};
use crate::resource::Resource;
use crate::role::{Role, RoleId};
use crate::rule::{Permission, PermissionRule, ResourceGeneric};
use crate::schema::USER_CLASS;
use crate::user::{denied_message, no_role_message, AccountStatus, User, UserId};

#[derive(Debug, Clone, Default)]
pub struct SecurityCatalog {
    roles: HashMap<RoleId, Role>,
    role_names: HashMap<String, RoleId>,
    users: HashMap<UserId, User>,
    user_names: HashMap<String, UserId>,
    policies: HashMap<PolicyId, SecurityPolicy>,
    policy_names: HashMap<String, PolicyId>,
    next_id: u64,
    // bumped by the service on every write; not persisted
    revision: u64,
}

impl SecurityCatalog {
    pub fn new() -> Self { Self::default() }

    /// Write counter stamped onto every snapshot taken from this catalog.
    pub fn revision(&self) -> u64 { self.revision }

    pub(crate) fn touch(&mut self) { self.revision += 1; }

    /// Carries the revision forward when this catalog replaces `previous`.
    pub(crate) fn succeed(&mut self, previous: &SecurityCatalog) { self.revision = previous.revision.max(self.revision) + 1; }

    fn alloc(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    // ---- roles ----

    pub fn create_role(&mut self, name: &str, parent: Option<&str>) -> SecurityResult<RoleId> {
        let key = name.to_ascii_lowercase();
        if self.role_names.contains_key(&key) {
            return Err(SecurityError::configuration(format!("role '{}' already exists", name)));
        }
        let parent_id = match parent {
            Some(p) => Some(self.role_id(p).ok_or_else(|| SecurityError::not_found("role", p))?),
            None => None,
        };
        let id = RoleId(self.alloc());
        let mut role = Role::new(id, name);
        role.set_parent(parent_id);
        self.roles.insert(id, role);
        self.role_names.insert(key, id);
        Ok(id)
    }

    /// Children lose their parent link; users keep the now dangling reference.
    pub fn drop_role(&mut self, name: &str) -> SecurityResult<RoleId> {
        let id = self.role_id(name).ok_or_else(|| SecurityError::not_found("role", name))?;
        self.roles.remove(&id);
        self.role_names.remove(&name.to_ascii_lowercase());
        for r in self.roles.values_mut() {
            if r.parent() == Some(id) { r.set_parent(None); }
        }
        Ok(id)
    }

    pub fn role(&self, id: RoleId) -> Option<&Role> { self.roles.get(&id) }
    pub fn role_id(&self, name: &str) -> Option<RoleId> { self.role_names.get(&name.to_ascii_lowercase()).copied() }
    pub fn role_by_name(&self, name: &str) -> Option<&Role> { self.role_id(name).and_then(|id| self.roles.get(&id)) }
    pub fn roles(&self) -> impl Iterator<Item = &Role> { self.roles.values() }

    fn role_mut(&mut self, name: &str) -> SecurityResult<&mut Role> {
        let id = self.role_id(name).ok_or_else(|| SecurityError::not_found("role", name))?;
        self.roles.get_mut(&id).ok_or_else(|| SecurityError::not_found("role", name))
    }

    pub fn set_parent(&mut self, role: &str, parent: Option<&str>) -> SecurityResult<()> {
        let id = self.role_id(role).ok_or_else(|| SecurityError::not_found("role", role))?;
        let parent_id = match parent {
            Some(p) => Some(self.role_id(p).ok_or_else(|| SecurityError::not_found("role", p))?),
            None => None,
        };
        let mut cursor = parent_id;
        let mut guard = 0usize;
        while let Some(p) = cursor {
            if p == id {
                return Err(SecurityError::configuration(format!("setting parent of role '{}' would create a cycle", role)));
            }
            guard += 1;
            if guard > self.roles.len() { break; }
            cursor = self.roles.get(&p).and_then(|r| r.parent());
        }
        self.role_mut(role)?.set_parent(parent_id);
        Ok(())
    }

    pub fn set_mode(&mut self, role: &str, mode: crate::role::AllowMode) -> SecurityResult<()> {
        self.role_mut(role)?.set_mode(mode);
        Ok(())
    }

    pub fn grant(&mut self, role: &str, generic: ResourceGeneric, specific: Option<&str>, bits: Permission) -> SecurityResult<()> {
        self.role_mut(role)?.grant(generic, specific, bits);
        Ok(())
    }

    pub fn revoke(&mut self, role: &str, generic: ResourceGeneric, specific: Option<&str>, bits: Permission) -> SecurityResult<()> {
        self.role_mut(role)?.revoke(generic, specific, bits);
        Ok(())
    }

    pub fn add_rule(&mut self, role: &str, rule: PermissionRule) -> SecurityResult<()> {
        self.role_mut(role)?.add_rule(rule);
        Ok(())
    }

    /// Role chain walk: local rule, then ALL, then the parent; `false` at the root.
    pub fn role_allow(&self, id: RoleId, generic: ResourceGeneric, specific: Option<&str>, op: Permission) -> bool {
        let mut cursor = Some(id);
        let mut visited: HashSet<RoleId> = HashSet::new();
        while let Some(cur) = cursor {
            if !visited.insert(cur) { return false; }
            let Some(role) = self.roles.get(&cur) else { return false };
            if let Some(v) = role.local_allow(generic, specific, op) { return v; }
            cursor = role.parent();
        }
        false
    }

    /// Parent chain starting at `id`, nearest first.
    pub fn lineage(&self, id: RoleId) -> Vec<&Role> {
        let mut out: Vec<&Role> = Vec::new();
        let mut cursor = Some(id);
        while let Some(cur) = cursor {
            let Some(role) = self.roles.get(&cur) else { break };
            if out.iter().any(|r| r.id() == cur) { break; }
            out.push(role);
            cursor = role.parent();
        }
        out
    }

    /// Own bindings plus inherited ones; the nearest role wins per resource.
    pub fn effective_policies(&self, id: RoleId) -> Vec<(Resource, PolicyId)> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        for role in self.lineage(id) {
            for b in role.policies() {
                if seen.insert(b.resource.key()) { out.push((b.resource.clone(), b.policy)); }
            }
        }
        out
    }

    pub fn attach_policy(&mut self, role: &str, resource: Resource, policy: PolicyId) -> SecurityResult<()> {
        if !self.policies.contains_key(&policy) { return Err(SecurityError::not_found("policy", policy.0.to_string())); }
        self.role_mut(role)?.bind_policy(resource, policy);
        Ok(())
    }

    pub fn detach_policy(&mut self, role: &str, resource: &Resource) -> SecurityResult<Option<PolicyId>> {
        Ok(self.role_mut(role)?.unbind_policy(resource))
    }

    // ---- policies ----

    pub fn create_policy(&mut self, name: &str) -> SecurityResult<PolicyId> {
        let key = name.to_ascii_lowercase();
        if self.policy_names.contains_key(&key) {
            return Err(SecurityError::configuration(format!("security policy '{}' already exists", name)));
        }
        let id = PolicyId(self.alloc());
        self.policies.insert(id, SecurityPolicy::new(id, name));
        self.policy_names.insert(key, id);
        Ok(id)
    }

    /// Inserts or replaces a policy by name, keeping the id of an existing one.
    pub fn save_policy(&mut self, policy: SecurityPolicy) -> PolicyId {
        let key = policy.name().to_ascii_lowercase();
        let id = match self.policy_names.get(&key) {
            Some(id) => *id,
            None => {
                let id = PolicyId(self.alloc());
                self.policy_names.insert(key, id);
                id
            }
        };
        let mut stored = SecurityPolicy::new(id, policy.name());
        stored.set_active(policy.is_active());
        for s in crate::policy::Scope::ALL { stored.set_rule(s, policy.raw_rule(s)); }
        self.policies.insert(id, stored);
        id
    }

    pub fn delete_policy(&mut self, name: &str) -> SecurityResult<PolicyId> {
        let id = self.policy_names.remove(&name.to_ascii_lowercase()).ok_or_else(|| SecurityError::not_found("policy", name))?;
        self.policies.remove(&id);
        for r in self.roles.values_mut() { r.unbind_policy_id(id); }
        Ok(id)
    }

    pub fn policy(&self, id: PolicyId) -> Option<&SecurityPolicy> { self.policies.get(&id) }
    pub fn policy_by_name(&self, name: &str) -> Option<&SecurityPolicy> {
        self.policy_names.get(&name.to_ascii_lowercase()).and_then(|id| self.policies.get(id))
    }
    pub fn policy_mut(&mut self, name: &str) -> SecurityResult<&mut SecurityPolicy> {
        let id = *self.policy_names.get(&name.to_ascii_lowercase()).ok_or_else(|| SecurityError::not_found("policy", name))?;
        self.policies.get_mut(&id).ok_or_else(|| SecurityError::not_found("policy", name))
    }
    pub fn policies(&self) -> impl Iterator<Item = &SecurityPolicy> { self.policies.values() }

    // ---- users ----

    pub fn create_user(&mut self, name: &str, password_hash: String, roles: &[&str]) -> SecurityResult<UserId> {
        let key = name.to_ascii_lowercase();
        if self.user_names.contains_key(&key) {
            return Err(SecurityError::configuration(format!("user '{}' already exists", name)));
        }
        let mut role_ids = Vec::with_capacity(roles.len());
        for r in roles {
            role_ids.push(self.role_id(r).ok_or_else(|| SecurityError::not_found("role", *r))?);
        }
        let id = UserId(self.alloc());
        let mut user = User::new(id, name, password_hash);
        for r in role_ids { user.add_role(r); }
        self.users.insert(id, user);
        self.user_names.insert(key, id);
        Ok(id)
    }

    pub fn drop_user(&mut self, name: &str) -> SecurityResult<UserId> {
        let id = self.user_names.remove(&name.to_ascii_lowercase()).ok_or_else(|| SecurityError::not_found("user", name))?;
        self.users.remove(&id);
        Ok(id)
    }

    pub fn user(&self, id: UserId) -> Option<&User> { self.users.get(&id) }
    pub fn user_id(&self, name: &str) -> Option<UserId> { self.user_names.get(&name.to_ascii_lowercase()).copied() }
    pub fn user_by_name(&self, name: &str) -> Option<&User> { self.user_id(name).and_then(|id| self.users.get(&id)) }
    pub fn users(&self) -> impl Iterator<Item = &User> { self.users.values() }

    fn user_mut(&mut self, name: &str) -> SecurityResult<&mut User> {
        let id = self.user_id(name).ok_or_else(|| SecurityError::not_found("user", name))?;
        self.users.get_mut(&id).ok_or_else(|| SecurityError::not_found("user", name))
    }

    pub fn set_user_status(&mut self, name: &str, status: AccountStatus) -> SecurityResult<()> {
        self.user_mut(name)?.set_status(status);
        Ok(())
    }

    pub fn set_user_password_hash(&mut self, name: &str, hash: String) -> SecurityResult<()> {
        self.user_mut(name)?.set_password_hash(hash);
        Ok(())
    }

    pub fn add_user_role(&mut self, user: &str, role: &str) -> SecurityResult<bool> {
        let rid = self.role_id(role).ok_or_else(|| SecurityError::not_found("role", role))?;
        Ok(self.user_mut(user)?.add_role(rid))
    }

    pub fn remove_user_role(&mut self, user: &str, role: &str) -> SecurityResult<bool> {
        let rid = self.role_id(role).ok_or_else(|| SecurityError::not_found("role", role))?;
        Ok(self.user_mut(user)?.remove_role(rid))
    }

    /// OR across the user's roles; returns the first role that allows. Dangling roles are skipped.
    pub fn user_allow(&self, id: UserId, generic: ResourceGeneric, specific: Option<&str>, op: Permission) -> SecurityResult<RoleId> {
        let user = self.users.get(&id).ok_or_else(|| SecurityError::not_found("user", id.0.to_string()))?;
        if user.roles().is_empty() { return Err(SecurityError::access_denied(no_role_message(user.name()))); }
        for rid in user.roles() {
            if !self.roles.contains_key(rid) {
                tracing::warn!(target: "rowsec::auth", user = %user.name(), role = rid.0, "user references a missing role; skipped");
                continue;
            }
            if self.role_allow(*rid, generic, specific, op) { return Ok(*rid); }
        }
        Err(SecurityError::access_denied(denied_message(user.name(), generic, specific, op)))
    }

    /// The user as an `OUser` document, bound to `$currentUser` during predicate evaluation.
    pub fn user_record(&self, id: UserId) -> Option<Record> {
        let user = self.users.get(&id)?;
        let roles: Vec<_> = user.roles().iter().filter(|r| self.roles.contains_key(*r)).map(|r| r.identity()).collect();
        let mut rec = Record::new(USER_CLASS)
            .with_id(user.identity())
            .with_field("name", user.name())
            .with_field("status", user.status().as_str())
            .with_field("roles", Value::LinkSet(roles));
        rec.clear_dirty();
        Some(rec)
    }

    /// Every parent link resolves and no chain loops.
    pub fn validate(&self) -> SecurityResult<()> {
        for role in self.roles.values() {
            let mut seen: HashSet<RoleId> = HashSet::new();
            let mut cursor = Some(role.id());
            while let Some(cur) = cursor {
                if !seen.insert(cur) {
                    return Err(SecurityError::configuration(format!("role '{}' has a cyclic parent chain", role.name())));
                }
                let r = self.roles.get(&cur).ok_or_else(|| {
                    SecurityError::configuration(format!("role '{}' inherits from a missing role", role.name()))
                })?;
                cursor = r.parent();
            }
            for b in role.policies() {
                if !self.policies.contains_key(&b.policy) {
                    return Err(SecurityError::configuration(format!("role '{}' binds a missing policy on {}", role.name(), b.resource)));
                }
            }
        }
        Ok(())
    }

    /// Role names sorted, for stable listings.
    pub fn role_names(&self) -> Vec<String> {
        let sorted: BTreeMap<String, ()> = self.roles.values().map(|r| (r.name().to_string(), ())).collect();
        sorted.into_keys().collect()
    }

    pub(crate) fn force_parent(&mut self, role: RoleId, parent: Option<RoleId>) {
        if let Some(r) = self.roles.get_mut(&role) { r.set_parent(parent); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> SecurityCatalog {
        let mut c = SecurityCatalog::new();
        c.create_role("base", None).unwrap();
        c.create_role("child", Some("base")).unwrap();
        c.create_role("other", None).unwrap();
        c
    }

    #[test]
    fn no_rule_no_parent_is_false() {
        let c = catalog();
        let other = c.role_id("other").unwrap();
        assert!(!c.role_allow(other, ResourceGeneric::Class, Some("X"), Permission::READ));
    }

    #[test]
    fn child_delegates_to_parent() {
        let mut c = catalog();
        c.grant("base", ResourceGeneric::Class, None, Permission::READ).unwrap();
        let child = c.role_id("child").unwrap();
        let base = c.role_id("base").unwrap();
        for op in [Permission::READ, Permission::CREATE] {
            assert_eq!(
                c.role_allow(child, ResourceGeneric::Class, Some("Foo"), op),
                c.role_allow(base, ResourceGeneric::Class, Some("Foo"), op)
            );
        }
        // a local ALL rule stops delegation
        c.grant("child", ResourceGeneric::All, None, Permission::NONE).unwrap();
        assert!(!c.role_allow(child, ResourceGeneric::Class, Some("Foo"), Permission::READ));
    }

    #[test]
    fn user_allow_is_or_across_roles() {
        let mut c = catalog();
        c.grant("base", ResourceGeneric::Class, None, Permission::READ).unwrap();
        c.grant("other", ResourceGeneric::Class, None, Permission::CREATE).unwrap();
        let u = c.create_user("u", String::new(), &["base", "other"]).unwrap();
        assert!(c.user_allow(u, ResourceGeneric::Class, Some("Foo"), Permission::READ).is_ok());
        assert_eq!(c.user_allow(u, ResourceGeneric::Class, Some("Foo"), Permission::CREATE).unwrap(), c.role_id("other").unwrap());
        let err = c.user_allow(u, ResourceGeneric::Class, Some("Foo"), Permission::DELETE).unwrap_err();
        assert!(err.is_access_denied());
        let lonely = c.create_user("lonely", String::new(), &[]).unwrap();
        let err = c.user_allow(lonely, ResourceGeneric::Class, None, Permission::READ).unwrap_err();
        assert_eq!(err.to_string(), "User 'lonely' has no role defined");
    }

    #[test]
    fn dangling_role_is_skipped() {
        let mut c = catalog();
        c.grant("other", ResourceGeneric::Class, None, Permission::READ).unwrap();
        let u = c.create_user("u", String::new(), &["base", "other"]).unwrap();
        c.drop_role("base").unwrap();
        assert!(c.user_allow(u, ResourceGeneric::Class, None, Permission::READ).is_ok());
        assert!(c.role_by_name("child").unwrap().parent().is_none());
    }

    #[test]
    fn cycles_are_rejected() {
        let mut c = catalog();
        let err = c.set_parent("base", Some("child")).unwrap_err();
        assert_eq!(err.code_str(), "configuration");
        c.set_parent("other", Some("child")).unwrap();
        assert!(c.validate().is_ok());
        let base = c.role_id("base").unwrap();
        let other = c.role_id("other").unwrap();
        c.force_parent(base, Some(other));
        assert!(c.validate().is_err());
    }

    #[test]
    fn effective_policies_nearest_wins() {
        let mut c = catalog();
        let p1 = c.create_policy("p1").unwrap();
        let p2 = c.create_policy("p2").unwrap();
        c.attach_policy("base", Resource::class("Foo"), p1).unwrap();
        c.attach_policy("base", Resource::class("Bar"), p1).unwrap();
        c.attach_policy("child", Resource::class("foo"), p2).unwrap();
        let eff = c.effective_policies(c.role_id("child").unwrap());
        assert_eq!(eff.len(), 2);
        assert!(eff.contains(&(Resource::class("foo"), p2)));
        assert!(eff.contains(&(Resource::class("Bar"), p1)));
        c.delete_policy("p1").unwrap();
        assert_eq!(c.effective_policies(c.role_id("child").unwrap()).len(), 1);
    }

    #[test]
    fn user_record_shape() {
        let mut c = catalog();
        let u = c.create_user("alice", String::new(), &["base"]).unwrap();
        let rec = c.user_record(u).unwrap();
        assert_eq!(rec.class(), Some(USER_CLASS));
        assert_eq!(rec.field("name"), Some(&Value::from("alice")));
        assert_eq!(rec.field("roles"), Some(&Value::LinkSet(vec![c.role_id("base").unwrap().identity()])));
        assert_eq!(rec.id(), u.identity());
    }
}
