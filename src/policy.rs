use std::fmt;

use serde::{Deserialize, Serialize};

use crate::rule::Permission;

/// When a predicate policy applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scope {
    Create,
    Read,
    BeforeUpdate,
    AfterUpdate,
    Delete,
    Execute,
}

impl Scope {
    pub const ALL: [Scope; 6] = [Scope::Create, Scope::Read, Scope::BeforeUpdate, Scope::AfterUpdate, Scope::Delete, Scope::Execute];

    fn index(self) -> usize {
        match self {
            Scope::Create => 0,
            Scope::Read => 1,
            Scope::BeforeUpdate => 2,
            Scope::AfterUpdate => 3,
            Scope::Delete => 4,
            Scope::Execute => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Create => "CREATE",
            Scope::Read => "READ",
            Scope::BeforeUpdate => "BEFORE_UPDATE",
            Scope::AfterUpdate => "AFTER_UPDATE",
            Scope::Delete => "DELETE",
            Scope::Execute => "EXECUTE",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyId(pub u64);

/// A named set of per-scope predicate rules. This is the live, editable form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityPolicy {
    id: PolicyId,
    name: String,
    active: bool,
    rules: [Option<String>; 6],
}

impl SecurityPolicy {
    pub fn new<S: Into<String>>(id: PolicyId, name: S) -> Self {
        Self { id, name: name.into(), active: true, rules: Default::default() }
    }

    /// `default_<bits>` policy used by bitmask grants; UPDATE drives both update scopes.
    pub fn from_bitmask(id: PolicyId, bits: Permission) -> Self {
        let mut p = Self::new(id, bitmask_policy_name(bits));
        let lit = |b: Permission| if bits.contains(b) { "true" } else { "false" };
        p.set_rule(Scope::Create, Some(lit(Permission::CREATE)));
        p.set_rule(Scope::Read, Some(lit(Permission::READ)));
        p.set_rule(Scope::BeforeUpdate, Some(lit(Permission::UPDATE)));
        p.set_rule(Scope::AfterUpdate, Some(lit(Permission::UPDATE)));
        p.set_rule(Scope::Delete, Some(lit(Permission::DELETE)));
        p.set_rule(Scope::Execute, Some(lit(Permission::EXECUTE)));
        p
    }

    /// Every scope set to the literal `"true"`.
    pub fn allow_all(id: PolicyId, name: &str) -> Self {
        let mut p = Self::new(id, name);
        for s in Scope::ALL { p.set_rule(s, Some("true")); }
        p
    }

    pub fn id(&self) -> PolicyId { self.id }
    pub fn name(&self) -> &str { &self.name }
    pub fn is_active(&self) -> bool { self.active }
    pub fn set_active(&mut self, active: bool) { self.active = active; }

    pub fn set_rule(&mut self, scope: Scope, rule: Option<&str>) {
        self.rules[scope.index()] = rule.map(|r| r.to_string());
    }

    /// The rule text as stored, regardless of the active flag.
    pub fn raw_rule(&self, scope: Scope) -> Option<&str> { self.rules[scope.index()].as_deref() }

    /// Effective rule: inactive policies and blank rules contribute nothing.
    pub fn rule(&self, scope: Scope) -> Option<&str> { effective(self.active, self.raw_rule(scope)) }
}

pub fn bitmask_policy_name(bits: Permission) -> String { format!("default_{}", bits.bits()) }

pub(crate) fn effective(active: bool, raw: Option<&str>) -> Option<&str> {
    if !active { return None; }
    raw.filter(|r| !r.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmask_policy_rules() {
        let p = SecurityPolicy::from_bitmask(PolicyId(1), Permission::READ | Permission::UPDATE);
        assert_eq!(p.name(), "default_6");
        assert_eq!(p.rule(Scope::Create), Some("false"));
        assert_eq!(p.rule(Scope::Read), Some("true"));
        assert_eq!(p.rule(Scope::BeforeUpdate), Some("true"));
        assert_eq!(p.rule(Scope::AfterUpdate), Some("true"));
        assert_eq!(p.rule(Scope::Delete), Some("false"));
        assert_eq!(p.rule(Scope::Execute), Some("false"));
    }

    #[test]
    fn inactive_and_blank_rules_are_absent() {
        let mut p = SecurityPolicy::new(PolicyId(2), "p");
        p.set_rule(Scope::Read, Some("   "));
        assert_eq!(p.rule(Scope::Read), None);
        p.set_rule(Scope::Read, Some("owner = $currentUser"));
        assert!(p.rule(Scope::Read).is_some());
        p.set_active(false);
        assert_eq!(p.rule(Scope::Read), None);
        assert_eq!(p.raw_rule(Scope::Read), Some("owner = $currentUser"));
    }
}
