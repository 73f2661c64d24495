//! Administration of the live security graph: roles, users, policies and the default bootstrap.
//!
//! Every change to roles, users or policies bumps the security version: cached resolutions are
//! dropped and open sessions re-snapshot on their next gate call.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::SecurityService;
use crate::catalog::SecurityCatalog;
use crate::error::{SecurityError, SecurityResult};
use crate::policy::{bitmask_policy_name, PolicyId, Scope, SecurityPolicy};
use crate::resource::{Resource, Target};
use crate::role::{AllowMode, RoleId};
use crate::rule::{Permission, ResourceGeneric};
use crate::snapshot::ImmutableRole;
use crate::user::{AccountStatus, UserId};

pub const ADMIN_ROLE: &str = "admin";
pub const READER_ROLE: &str = "reader";
pub const WRITER_ROLE: &str = "writer";

// Clears the bootstrap suppression flag on every exit path.
struct SkipRebuild<'a>(&'a SecurityService);

impl<'a> SkipRebuild<'a> {
    fn enter(svc: &'a SecurityService) -> Self {
        svc.skip_rebuild.store(true, Ordering::Release);
        Self(svc)
    }
}

impl Drop for SkipRebuild<'_> {
    fn drop(&mut self) { self.0.skip_rebuild.store(false, Ordering::Release); }
}

fn bitmask_policy(cat: &mut SecurityCatalog, bits: Permission) -> PolicyId {
    match cat.policy_by_name(&bitmask_policy_name(bits)) {
        Some(p) => p.id(),
        None => cat.save_policy(SecurityPolicy::from_bitmask(PolicyId(0), bits)),
    }
}

fn bootstrap_admin(cat: &mut SecurityCatalog) -> SecurityResult<()> {
    if cat.role_id(ADMIN_ROLE).is_some() { return Ok(()); }
    cat.create_role(ADMIN_ROLE, None)?;
    cat.set_mode(ADMIN_ROLE, AllowMode::AllowAllButSpecified)?;
    for g in ResourceGeneric::VALUES {
        cat.grant(ADMIN_ROLE, g, None, Permission::ALL)?;
    }
    let all = bitmask_policy(cat, Permission::ALL);
    cat.attach_policy(ADMIN_ROLE, Resource::All, all)
}

fn bootstrap_reader(cat: &mut SecurityCatalog) -> SecurityResult<()> {
    if cat.role_id(READER_ROLE).is_some() { return Ok(()); }
    cat.create_role(READER_ROLE, None)?;
    for g in [
        ResourceGeneric::Database,
        ResourceGeneric::Schema,
        ResourceGeneric::Cluster,
        ResourceGeneric::Class,
        ResourceGeneric::Command,
        ResourceGeneric::RecordHook,
        ResourceGeneric::Function,
    ] {
        cat.grant(READER_ROLE, g, None, Permission::READ)?;
    }
    cat.grant(READER_ROLE, ResourceGeneric::Class, Some(crate::schema::USER_CLASS), Permission::NONE)?;
    cat.grant(READER_ROLE, ResourceGeneric::SystemClusters, None, Permission::NONE)?;
    let read = bitmask_policy(cat, Permission::READ);
    for r in ["database.class.*.*", "database.class.*", "database.function.*"] {
        cat.attach_policy(READER_ROLE, Resource::parse(r)?, read)?;
    }
    Ok(())
}

fn bootstrap_writer(cat: &mut SecurityCatalog) -> SecurityResult<()> {
    if cat.role_id(WRITER_ROLE).is_some() { return Ok(()); }
    cat.create_role(WRITER_ROLE, None)?;
    cat.grant(WRITER_ROLE, ResourceGeneric::Database, None, Permission::ALL)?;
    cat.grant(WRITER_ROLE, ResourceGeneric::Schema, None, Permission::READ | Permission::CREATE | Permission::UPDATE)?;
    for g in [ResourceGeneric::Cluster, ResourceGeneric::Class, ResourceGeneric::Command, ResourceGeneric::RecordHook] {
        cat.grant(WRITER_ROLE, g, None, Permission::ALL)?;
    }
    cat.grant(WRITER_ROLE, ResourceGeneric::Class, Some(crate::schema::USER_CLASS), Permission::READ)?;
    cat.grant(WRITER_ROLE, ResourceGeneric::Function, None, Permission::READ)?;
    cat.grant(WRITER_ROLE, ResourceGeneric::SystemClusters, None, Permission::NONE)?;
    let all = bitmask_policy(cat, Permission::ALL);
    for r in ["database.class.*.*", "database.class.*"] {
        cat.attach_policy(WRITER_ROLE, Resource::parse(r)?, all)?;
    }
    Ok(())
}

impl SecurityService {
    fn mutate<T>(&self, f: impl FnOnce(&mut SecurityCatalog) -> SecurityResult<T>) -> SecurityResult<T> {
        let mut cat = self.catalog.write();
        let out = f(&mut cat);
        cat.touch();
        out
    }

    fn mutate_and_bump<T>(&self, f: impl FnOnce(&mut SecurityCatalog) -> SecurityResult<T>) -> SecurityResult<T> {
        let out = self.mutate(f)?;
        self.increment_version()?;
        Ok(out)
    }

    /// Creates the default roles (and users when configured) if they are missing, then builds
    /// the optimization structures once.
    pub fn bootstrap(&self) -> SecurityResult<()> {
        {
            let _skip = SkipRebuild::enter(self);
            let with_users = self.config.create_default_users;
            let mut hashes = Vec::new();
            if with_users {
                for name in [ADMIN_ROLE, READER_ROLE, WRITER_ROLE] {
                    if self.catalog.read().user_id(name).is_none() {
                        hashes.push((name, self.hasher.hash(name)?));
                    }
                }
            }
            self.mutate(|cat| {
                bootstrap_admin(cat)?;
                bootstrap_reader(cat)?;
                bootstrap_writer(cat)?;
                for (name, hash) in hashes {
                    cat.create_user(name, hash, &[name])?;
                }
                cat.validate()
            })?;
        }
        self.rebuild_optimizations()?;
        tracing::info!(target: "rowsec::admin", version = self.version(), default_users = self.config.create_default_users, "security bootstrap complete");
        Ok(())
    }

    /// Synthetic root role for an account defined outside the database.
    pub fn create_root_role(&self, name: &str, resources: &str) -> SecurityResult<Arc<ImmutableRole>> {
        ImmutableRole::root(name, resources).map(Arc::new)
    }

    // ---- roles ----

    pub fn create_role(&self, name: &str, parent: Option<&str>) -> SecurityResult<RoleId> {
        let id = self.mutate_and_bump(|c| c.create_role(name, parent))?;
        tracing::info!(target: "rowsec::admin", role = %name, parent = ?parent, "role created");
        Ok(id)
    }

    pub fn drop_role(&self, name: &str) -> SecurityResult<RoleId> {
        let id = self.mutate_and_bump(|c| c.drop_role(name))?;
        tracing::info!(target: "rowsec::admin", role = %name, "role dropped");
        Ok(id)
    }

    pub fn set_role_parent(&self, role: &str, parent: Option<&str>) -> SecurityResult<()> {
        self.mutate_and_bump(|c| c.set_parent(role, parent))
    }

    pub fn set_role_mode(&self, role: &str, mode: AllowMode) -> SecurityResult<()> {
        self.mutate_and_bump(|c| c.set_mode(role, mode))
    }

    pub fn grant(&self, role: &str, generic: ResourceGeneric, specific: Option<&str>, bits: Permission) -> SecurityResult<()> {
        self.mutate_and_bump(|c| c.grant(role, generic, specific, bits))?;
        tracing::debug!(target: "rowsec::admin", role = %role, resource = %generic, specific = ?specific, bits = %bits.describe(), "granted");
        Ok(())
    }

    /// Revoking `Permission::NONE` changes nothing.
    pub fn revoke(&self, role: &str, generic: ResourceGeneric, specific: Option<&str>, bits: Permission) -> SecurityResult<()> {
        self.mutate_and_bump(|c| c.revoke(role, generic, specific, bits))?;
        tracing::debug!(target: "rowsec::admin", role = %role, resource = %generic, specific = ?specific, bits = %bits.describe(), "revoked");
        Ok(())
    }

    // ---- users ----

    pub fn create_user(&self, name: &str, password: &str, roles: &[&str]) -> SecurityResult<UserId> {
        let hash = self.hasher.hash(password)?;
        let id = self.mutate_and_bump(|c| c.create_user(name, hash, roles))?;
        tracing::info!(target: "rowsec::admin", user = %name, roles = roles.len(), "user created");
        Ok(id)
    }

    /// Drops the user and revokes every token issued to them.
    pub fn drop_user(&self, name: &str) -> SecurityResult<UserId> {
        let id = self.mutate_and_bump(|c| c.drop_user(name))?;
        let revoked = self.tokens.revoke_user(name);
        tracing::info!(target: "rowsec::admin", user = %name, revoked, "user dropped");
        Ok(id)
    }

    pub fn set_password(&self, name: &str, password: &str) -> SecurityResult<()> {
        let hash = self.hasher.hash(password)?;
        self.mutate(|c| c.set_user_password_hash(name, hash))
    }

    pub fn set_user_status(&self, name: &str, status: AccountStatus) -> SecurityResult<()> {
        self.mutate_and_bump(|c| c.set_user_status(name, status))?;
        if status != AccountStatus::Active {
            self.tokens.revoke_user(name);
        }
        Ok(())
    }

    pub fn add_user_role(&self, user: &str, role: &str) -> SecurityResult<bool> {
        self.mutate_and_bump(|c| c.add_user_role(user, role))
    }

    pub fn remove_user_role(&self, user: &str, role: &str) -> SecurityResult<bool> {
        self.mutate_and_bump(|c| c.remove_user_role(user, role))
    }

    // ---- policies ----

    pub fn create_security_policy(&self, name: &str) -> SecurityResult<PolicyId> { self.mutate_and_bump(|c| c.create_policy(name)) }

    /// Inserts or replaces a policy by name.
    pub fn save_security_policy(&self, policy: SecurityPolicy) -> SecurityResult<PolicyId> {
        self.mutate_and_bump(|c| Ok(c.save_policy(policy)))
    }

    pub fn set_policy_rule(&self, policy: &str, scope: Scope, rule: Option<&str>) -> SecurityResult<()> {
        self.mutate_and_bump(|c| {
            c.policy_mut(policy)?.set_rule(scope, rule);
            Ok(())
        })
    }

    pub fn set_policy_active(&self, policy: &str, active: bool) -> SecurityResult<()> {
        self.mutate_and_bump(|c| {
            c.policy_mut(policy)?.set_active(active);
            Ok(())
        })
    }

    /// Deletes the policy and unbinds it from every role.
    pub fn delete_security_policy(&self, name: &str) -> SecurityResult<PolicyId> {
        let id = self.mutate_and_bump(|c| c.delete_policy(name))?;
        tracing::info!(target: "rowsec::admin", policy = %name, "security policy deleted");
        Ok(id)
    }

    /// Names of composite indexes on the class, its superclasses or its subclasses that
    /// include `property`.
    fn composite_indexes_with(&self, class: &str, property: &str) -> Vec<String> {
        let mut classes = vec![class.to_string()];
        classes.extend(self.schema.superclasses_of(class));
        classes.extend(self.schema.subclasses_of(class));
        let mut names: Vec<String> = classes
            .iter()
            .flat_map(|c| self.schema.indexes_of(c))
            .filter(|i| i.is_composite() && i.involves(property))
            .map(|i| i.name)
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Binds `policy` to `resource` on `role`. Property policies are refused on columns that
    /// take part in a composite index anywhere in the class hierarchy.
    pub fn set_security_policy(&self, role: &str, resource: &str, policy: &str) -> SecurityResult<()> {
        let parsed = self.resolver.resolve(resource)?;
        if let Resource::Property { class: Target::Named(class), property: Target::Named(prop) } = parsed.as_ref() {
            let clashing = self.composite_indexes_with(class, prop);
            if !clashing.is_empty() {
                return Err(SecurityError::configuration(format!(
                    "Cannot bind security policy on {} because of existing composite indexes: {}",
                    resource,
                    clashing.join(", ")
                )));
            }
        }
        self.mutate_and_bump(|c| {
            let id = c.policy_by_name(policy).map(|p| p.id()).ok_or_else(|| SecurityError::not_found("policy", policy))?;
            c.attach_policy(role, parsed.as_ref().clone(), id)
        })?;
        tracing::info!(target: "rowsec::admin", role = %role, resource = %parsed, policy = %policy, "security policy bound");
        Ok(())
    }

    /// Binds the shared `default_<bits>` policy, creating it on first use.
    pub fn set_security_policy_with_bitmask(&self, role: &str, resource: &str, bits: Permission) -> SecurityResult<()> {
        let parsed = self.resolver.resolve(resource)?;
        self.mutate_and_bump(|c| {
            let id = bitmask_policy(c, bits);
            c.attach_policy(role, parsed.as_ref().clone(), id)
        })
    }

    /// Unbinds whatever policy `role` has on `resource`; returns whether one was bound.
    pub fn remove_security_policy(&self, role: &str, resource: &str) -> SecurityResult<bool> {
        let parsed = self.resolver.resolve(resource)?;
        let removed = self.mutate_and_bump(|c| c.detach_policy(role, parsed.as_ref()))?;
        tracing::info!(target: "rowsec::admin", role = %role, resource = %parsed, removed = removed.is_some(), "security policy unbound");
        Ok(removed.is_some())
    }

    // ---- persistence ----

    pub fn export_json(&self) -> SecurityResult<String> { self.catalog.read().to_json() }

    /// Replaces the whole catalog and bumps the version.
    pub fn load_json(&self, text: &str) -> SecurityResult<()> {
        let mut loaded = SecurityCatalog::from_json(text)?;
        {
            let mut cat = self.catalog.write();
            loaded.succeed(&cat);
            *cat = loaded;
        }
        self.tokens.clear();
        self.increment_version()?;
        tracing::info!(target: "rowsec::admin", version = self.version(), "security catalog loaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use crate::record::MemoryRecordStore;
    use crate::schema::MemorySchema;

    fn open(users: bool) -> (Arc<SecurityService>, Arc<MemorySchema>) {
        let schema = Arc::new(MemorySchema::new());
        schema.create_class("Person", &[]).unwrap();
        schema.create_class("Employee", &["Person"]).unwrap();
        schema.add_index("Employee", "Employee.name_dept", &["name", "dept"]).unwrap();
        let cfg = SecurityConfig { create_default_users: users, ..Default::default() };
        let svc = SecurityService::open(cfg, schema.clone(), Arc::new(MemoryRecordStore::new())).unwrap();
        (svc, schema)
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let (svc, _) = open(false);
        svc.bootstrap().unwrap();
        let names = svc.read_catalog(|c| c.role_names());
        assert_eq!(names, vec!["admin", "reader", "writer"]);
        assert!(svc.read_catalog(|c| c.policy_by_name("default_31").is_some()));
        assert!(svc.optimization_index().is_some());
        assert!(!svc.skip_rebuild.load(Ordering::Acquire));
    }

    #[test]
    fn reader_defaults() {
        let (svc, _) = open(false);
        svc.read_catalog(|c| {
            let reader = c.role_id(READER_ROLE).unwrap();
            assert!(c.role_allow(reader, ResourceGeneric::Class, Some("Person"), Permission::READ));
            assert!(!c.role_allow(reader, ResourceGeneric::Class, Some("OUser"), Permission::READ));
            assert!(!c.role_allow(reader, ResourceGeneric::Class, Some("Person"), Permission::CREATE));
        });
        let idx = svc.optimization_index().unwrap();
        assert!(idx.is_restricted("reader", "Person"));
        assert!(!idx.is_restricted("writer", "Person"));
    }

    #[test]
    fn composite_index_blocks_property_policy() {
        let (svc, _) = open(false);
        svc.create_security_policy("hide").unwrap();
        let err = svc.set_security_policy("reader", "database.class.Person.dept", "hide").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot bind security policy on database.class.Person.dept because of existing composite indexes: Employee.name_dept"
        );
        svc.set_security_policy("reader", "database.class.Person.salary", "hide").unwrap();
        assert!(svc.remove_security_policy("reader", "database.class.Person.salary").unwrap());
        assert!(!svc.remove_security_policy("reader", "database.class.Person.salary").unwrap());
    }

    #[test]
    fn policy_changes_bump_version() {
        let (svc, _) = open(false);
        let v = svc.version();
        svc.set_security_policy_with_bitmask("writer", "database.class.Person", Permission::READ).unwrap();
        assert_eq!(svc.version(), v + 1);
        svc.create_security_policy("p").unwrap();
        svc.set_policy_rule("p", Scope::Read, Some("true")).unwrap();
        svc.set_policy_active("p", false).unwrap();
        svc.set_security_policy("reader", "database.class.Person", "p").unwrap();
        assert!(svc.remove_security_policy("reader", "database.class.Person").unwrap());
        assert_eq!(svc.version(), v + 6);
        svc.grant("writer", ResourceGeneric::Function, None, Permission::EXECUTE).unwrap();
        assert_eq!(svc.version(), v + 7);
        assert!(svc.optimization_index().unwrap().is_restricted("writer", "Employee"));
    }

    #[test]
    fn writes_advance_catalog_revision() {
        let (svc, _) = open(false);
        let r = svc.read_catalog(|c| c.revision());
        svc.create_role("auditor", None).unwrap();
        assert!(svc.create_role("auditor", None).is_err());
        assert_eq!(svc.read_catalog(|c| c.revision()), r + 2);
        let json = svc.export_json().unwrap();
        svc.load_json(&json).unwrap();
        assert_eq!(svc.read_catalog(|c| c.revision()), r + 3);
    }

    #[test]
    fn export_and_reload() {
        let (svc, _) = open(false);
        svc.create_role("auditor", Some("reader")).unwrap();
        let json = svc.export_json().unwrap();
        let (other, _) = open(false);
        other.load_json(&json).unwrap();
        assert!(other.read_catalog(|c| c.role_id("auditor").is_some()));
        assert!(other.load_json("{ not json").is_err());
    }
}
