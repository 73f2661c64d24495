//! Persisted shape of the security catalog and JSON round-tripping.

use std::collections::BTreeMap;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use super::SecurityCatalog;
use crate::error::{SecurityError, SecurityResult};
use crate::policy::{Scope, SecurityPolicy};
use crate::resource::Resource;
use crate::role::AllowMode;
use crate::rule::{Permission, PermissionRule, ResourceGeneric};
use crate::user::AccountStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleRecord {
    pub resource_generic: String,
    #[serde(default)]
    pub access: Option<u8>,
    #[serde(default)]
    pub specific_resources: BTreeMap<String, u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleRecord {
    pub name: String,
    #[serde(default)]
    pub mode: u8,
    #[serde(default)]
    pub rules: Vec<RuleRecord>,
    #[serde(default)]
    pub inherited_role: Option<String>,
    /// resource string -> policy name
    #[serde(default)]
    pub policies: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRecord {
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub create: Option<String>,
    #[serde(default)]
    pub read: Option<String>,
    #[serde(default)]
    pub before_update: Option<String>,
    #[serde(default)]
    pub after_update: Option<String>,
    #[serde(default)]
    pub delete: Option<String>,
    #[serde(default)]
    pub execute: Option<String>,
}

fn default_active() -> bool { true }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub name: String,
    /// Password hash, never the clear text
    pub password: String,
    pub status: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CatalogDocument {
    #[serde(default)]
    pub policies: Vec<PolicyRecord>,
    #[serde(default)]
    pub roles: Vec<RoleRecord>,
    #[serde(default)]
    pub users: Vec<UserRecord>,
}

impl PolicyRecord {
    fn from_policy(p: &SecurityPolicy) -> Self {
        let get = |s: Scope| p.raw_rule(s).map(|r| r.to_string());
        PolicyRecord {
            name: p.name().to_string(),
            active: p.is_active(),
            create: get(Scope::Create),
            read: get(Scope::Read),
            before_update: get(Scope::BeforeUpdate),
            after_update: get(Scope::AfterUpdate),
            delete: get(Scope::Delete),
            execute: get(Scope::Execute),
        }
    }
}

impl SecurityCatalog {
    pub fn to_document(&self) -> CatalogDocument {
        let mut policies: Vec<PolicyRecord> = self.policies().map(PolicyRecord::from_policy).collect();
        policies.sort_by(|a, b| a.name.cmp(&b.name));

        let mut roles: Vec<RoleRecord> = self
            .roles()
            .map(|r| {
                let mut rules: Vec<RuleRecord> = r
                    .rules()
                    .map(|rule| RuleRecord {
                        resource_generic: rule.generic().name().to_string(),
                        access: rule.access().map(|a| a.bits()),
                        specific_resources: rule.specific_resources().map(|(k, v)| (k.to_string(), v.bits())).collect(),
                    })
                    .collect();
                rules.sort_by(|a, b| a.resource_generic.cmp(&b.resource_generic));
                RoleRecord {
                    name: r.name().to_string(),
                    mode: r.mode().code(),
                    rules,
                    inherited_role: r.parent().and_then(|p| self.role(p)).map(|p| p.name().to_string()),
                    policies: r
                        .policies()
                        .filter_map(|b| self.policy(b.policy).map(|p| (b.resource.to_string(), p.name().to_string())))
                        .collect(),
                }
            })
            .collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));

        let mut users: Vec<UserRecord> = self
            .users()
            .map(|u| UserRecord {
                name: u.name().to_string(),
                password: u.password_hash().to_string(),
                status: u.status().as_str().to_string(),
                roles: u.roles().iter().filter_map(|r| self.role(*r)).map(|r| r.name().to_string()).collect(),
            })
            .collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));

        CatalogDocument { policies, roles, users }
    }

    /// Rebuilds a catalog from its persisted shape; role parent chains are validated.
    pub fn from_document(doc: &CatalogDocument) -> SecurityResult<Self> {
        let mut cat = SecurityCatalog::new();
        for p in &doc.policies {
            let mut policy = SecurityPolicy::new(crate::policy::PolicyId(0), p.name.as_str());
            policy.set_active(p.active);
            policy.set_rule(Scope::Create, p.create.as_deref());
            policy.set_rule(Scope::Read, p.read.as_deref());
            policy.set_rule(Scope::BeforeUpdate, p.before_update.as_deref());
            policy.set_rule(Scope::AfterUpdate, p.after_update.as_deref());
            policy.set_rule(Scope::Delete, p.delete.as_deref());
            policy.set_rule(Scope::Execute, p.execute.as_deref());
            cat.save_policy(policy);
        }
        for r in &doc.roles {
            cat.create_role(&r.name, None)?;
            cat.set_mode(&r.name, AllowMode::from_code(r.mode))?;
            for rule in &r.rules {
                let generic = ResourceGeneric::from_name(&rule.resource_generic).ok_or_else(|| {
                    SecurityError::configuration(format!("role '{}' has a rule on unknown resource '{}'", r.name, rule.resource_generic))
                })?;
                let mut pr = PermissionRule::new(generic);
                if let Some(bits) = rule.access {
                    pr.grant_access(None, Permission::from_bits_truncate(bits));
                }
                for (name, bits) in &rule.specific_resources {
                    pr.grant_access(Some(name), Permission::from_bits_truncate(*bits));
                }
                cat.add_rule(&r.name, pr)?;
            }
        }
        for r in &doc.roles {
            if let Some(parent) = &r.inherited_role {
                let child = cat.role_id(&r.name).ok_or_else(|| SecurityError::not_found("role", r.name.as_str()))?;
                let pid = cat.role_id(parent).ok_or_else(|| {
                    SecurityError::configuration(format!("role '{}' inherits from missing role '{}'", r.name, parent))
                })?;
                cat.force_parent(child, Some(pid));
            }
            for (resource, policy_name) in &r.policies {
                let res = Resource::parse(resource)?;
                let pid = cat
                    .policy_by_name(policy_name)
                    .map(|p| p.id())
                    .ok_or_else(|| SecurityError::configuration(format!("role '{}' binds missing policy '{}'", r.name, policy_name)))?;
                cat.attach_policy(&r.name, res, pid)?;
            }
        }
        for u in &doc.users {
            let roles: Vec<&str> = u.roles.iter().map(|s| s.as_str()).collect();
            cat.create_user(&u.name, u.password.clone(), &roles)?;
            let status = AccountStatus::parse(&u.status)
                .ok_or_else(|| SecurityError::configuration(format!("user '{}' has unknown status '{}'", u.name, u.status)))?;
            cat.set_user_status(&u.name, status)?;
        }
        cat.validate()?;
        Ok(cat)
    }

    pub fn to_json(&self) -> SecurityResult<String> { Ok(serde_json::to_string_pretty(&self.to_document())?) }

    pub fn from_json(text: &str) -> SecurityResult<Self> {
        let doc: CatalogDocument = serde_json::from_str(text).map_err(|e| SecurityError::storage(anyhow!(e)))?;
        Self::from_document(&doc)
    }
}
