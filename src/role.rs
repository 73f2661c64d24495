use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::policy::PolicyId;
use crate::record::RecordId;
use crate::resource::Resource;
use crate::rule::{check_local, Permission, PermissionRule, ResourceGeneric};

pub const ROLE_CLUSTER: i32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoleId(pub u64);

impl RoleId {
    /// Backing record identity, used by restricted-record identity sets.
    pub fn identity(self) -> RecordId { RecordId::new(ROLE_CLUSTER, self.0 as i64) }
}

/// Legacy role mode flag. Carried and persisted; rule evaluation does not consult it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AllowMode {
    #[default]
    DenyAllButSpecified,
    AllowAllButSpecified,
}

impl AllowMode {
    pub fn code(self) -> u8 {
        match self {
            AllowMode::DenyAllButSpecified => 0,
            AllowMode::AllowAllButSpecified => 1,
        }
    }

    pub fn from_code(code: u8) -> AllowMode {
        if code == 1 { AllowMode::AllowAllButSpecified } else { AllowMode::DenyAllButSpecified }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyBinding {
    pub resource: Resource,
    pub policy: PolicyId,
}

/// Live, mutable role record. Parents are referenced by id inside the owning catalog.
#[derive(Debug, Clone)]
pub struct Role {
    id: RoleId,
    name: String,
    mode: AllowMode,
    parent: Option<RoleId>,
    rules: HashMap<ResourceGeneric, PermissionRule>,
    // keyed by Resource::key()
    policies: BTreeMap<String, PolicyBinding>,
}

impl Role {
    pub fn new<S: Into<String>>(id: RoleId, name: S) -> Self {
        Self { id, name: name.into(), mode: AllowMode::default(), parent: None, rules: HashMap::new(), policies: BTreeMap::new() }
    }

    pub fn id(&self) -> RoleId { self.id }
    pub fn name(&self) -> &str { &self.name }
    pub fn identity(&self) -> RecordId { self.id.identity() }
    pub fn mode(&self) -> AllowMode { self.mode }
    pub fn set_mode(&mut self, mode: AllowMode) { self.mode = mode; }
    pub fn parent(&self) -> Option<RoleId> { self.parent }

    // Acyclicity is checked by the catalog, which owns the arena.
    pub(crate) fn set_parent(&mut self, parent: Option<RoleId>) { self.parent = parent; }

    pub fn rules(&self) -> impl Iterator<Item = &PermissionRule> { self.rules.values() }
    pub(crate) fn rule_map(&self) -> &HashMap<ResourceGeneric, PermissionRule> { &self.rules }
    pub fn rule(&self, generic: ResourceGeneric) -> Option<&PermissionRule> { self.rules.get(&generic) }

    pub fn has_rule(&self, generic: ResourceGeneric, specific: Option<&str>) -> bool {
        match (self.rules.get(&generic), specific) {
            (None, _) => false,
            (Some(rule), Some(name)) => rule.contains_specific_resource(name),
            (Some(_), None) => true,
        }
    }

    pub fn add_rule(&mut self, rule: PermissionRule) { self.rules.insert(rule.generic(), rule); }

    pub fn grant(&mut self, generic: ResourceGeneric, specific: Option<&str>, bits: Permission) {
        self.rules.entry(generic).or_insert_with(|| PermissionRule::new(generic)).grant_access(specific, bits);
    }

    pub fn revoke(&mut self, generic: ResourceGeneric, specific: Option<&str>, bits: Permission) {
        if bits.is_empty() { return; }
        self.rules.entry(generic).or_insert_with(|| PermissionRule::new(generic)).revoke_access(specific, bits);
    }

    /// This role's own opinion only; `None` delegates to the parent.
    pub fn local_allow(&self, generic: ResourceGeneric, specific: Option<&str>, op: Permission) -> Option<bool> {
        check_local(&self.rules, generic, specific, op)
    }

    pub fn policies(&self) -> impl Iterator<Item = &PolicyBinding> { self.policies.values() }
    pub fn policy(&self, resource: &Resource) -> Option<PolicyId> { self.policies.get(&resource.key()).map(|b| b.policy) }

    pub(crate) fn bind_policy(&mut self, resource: Resource, policy: PolicyId) {
        self.policies.insert(resource.key(), PolicyBinding { resource, policy });
    }

    pub(crate) fn unbind_policy(&mut self, resource: &Resource) -> Option<PolicyId> {
        self.policies.remove(&resource.key()).map(|b| b.policy)
    }

    pub(crate) fn unbind_policy_id(&mut self, policy: PolicyId) { self.policies.retain(|_, b| b.policy != policy); }

    /// Legacy rule encoding: resource string to bitmask.
    pub fn encoded_rules(&self) -> BTreeMap<String, u8> {
        let mut out = BTreeMap::new();
        for rule in self.rules.values() { rule.encode(&mut out); }
        out
    }
}
