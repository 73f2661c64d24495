//! Legacy bitmask permissions: generic resources, per-specific-name overrides and the string adapter.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Permission: u8 {
        const CREATE = 0b0_0001;
        const READ = 0b0_0010;
        const UPDATE = 0b0_0100;
        const DELETE = 0b0_1000;
        const EXECUTE = 0b1_0000;
    }
}

impl Permission {
    pub const NONE: Permission = Permission::empty();
    pub const ALL: Permission = Permission::all();

    /// Human readable rendering used in denial messages.
    pub fn describe(self) -> String {
        if self.is_empty() { return "<none>".to_string(); }
        if self == Permission::ALL { return "All".to_string(); }
        let mut parts = Vec::new();
        if self.contains(Permission::CREATE) { parts.push("Create"); }
        if self.contains(Permission::READ) { parts.push("Read"); }
        if self.contains(Permission::UPDATE) { parts.push("Update"); }
        if self.contains(Permission::DELETE) { parts.push("Delete"); }
        if self.contains(Permission::EXECUTE) { parts.push("Execute"); }
        parts.join(", ")
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.describe()) }
}

/// Resource categories of the bitmask model. Each has a legacy dotted path prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceGeneric {
    All,
    Function,
    Class,
    Cluster,
    BypassRestricted,
    Database,
    Schema,
    Command,
    CommandGremlin,
    RecordHook,
    SystemClusters,
    Server,
    DatabaseCopy,
    DatabaseCreate,
    DatabaseDrop,
    DatabaseExists,
    DatabaseFreeze,
    DatabaseRelease,
    DatabasePassthrough,
}

impl ResourceGeneric {
    pub const VALUES: [ResourceGeneric; 19] = [
        ResourceGeneric::All,
        ResourceGeneric::Function,
        ResourceGeneric::Class,
        ResourceGeneric::Cluster,
        ResourceGeneric::BypassRestricted,
        ResourceGeneric::Database,
        ResourceGeneric::Schema,
        ResourceGeneric::Command,
        ResourceGeneric::CommandGremlin,
        ResourceGeneric::RecordHook,
        ResourceGeneric::SystemClusters,
        ResourceGeneric::Server,
        ResourceGeneric::DatabaseCopy,
        ResourceGeneric::DatabaseCreate,
        ResourceGeneric::DatabaseDrop,
        ResourceGeneric::DatabaseExists,
        ResourceGeneric::DatabaseFreeze,
        ResourceGeneric::DatabaseRelease,
        ResourceGeneric::DatabasePassthrough,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ResourceGeneric::All => "ALL",
            ResourceGeneric::Function => "FUNCTION",
            ResourceGeneric::Class => "CLASS",
            ResourceGeneric::Cluster => "CLUSTER",
            ResourceGeneric::BypassRestricted => "BYPASS_RESTRICTED",
            ResourceGeneric::Database => "DATABASE",
            ResourceGeneric::Schema => "SCHEMA",
            ResourceGeneric::Command => "COMMAND",
            ResourceGeneric::CommandGremlin => "COMMAND_GREMLIN",
            ResourceGeneric::RecordHook => "RECORD_HOOK",
            ResourceGeneric::SystemClusters => "SYSTEM_CLUSTERS",
            ResourceGeneric::Server => "SERVER",
            ResourceGeneric::DatabaseCopy => "DATABASE_COPY",
            ResourceGeneric::DatabaseCreate => "DATABASE_CREATE",
            ResourceGeneric::DatabaseDrop => "DATABASE_DROP",
            ResourceGeneric::DatabaseExists => "DATABASE_EXISTS",
            ResourceGeneric::DatabaseFreeze => "DATABASE_FREEZE",
            ResourceGeneric::DatabaseRelease => "DATABASE_RELEASE",
            ResourceGeneric::DatabasePassthrough => "DATABASE_PASSTHROUGH",
        }
    }

    pub fn legacy_name(self) -> &'static str {
        match self {
            ResourceGeneric::All => "*",
            ResourceGeneric::Function => "database.function",
            ResourceGeneric::Class => "database.class",
            ResourceGeneric::Cluster => "database.cluster",
            ResourceGeneric::BypassRestricted => "database.bypassRestricted",
            ResourceGeneric::Database => "database",
            ResourceGeneric::Schema => "database.schema",
            ResourceGeneric::Command => "database.command",
            ResourceGeneric::CommandGremlin => "database.command.gremlin",
            ResourceGeneric::RecordHook => "database.hook.record",
            ResourceGeneric::SystemClusters => "database.systemclusters",
            ResourceGeneric::Server => "server",
            ResourceGeneric::DatabaseCopy => "database.copy",
            ResourceGeneric::DatabaseCreate => "database.create",
            ResourceGeneric::DatabaseDrop => "database.drop",
            ResourceGeneric::DatabaseExists => "database.exists",
            ResourceGeneric::DatabaseFreeze => "database.freeze",
            ResourceGeneric::DatabaseRelease => "database.release",
            ResourceGeneric::DatabasePassthrough => "database.passthrough",
        }
    }

    pub fn from_name(name: &str) -> Option<ResourceGeneric> {
        Self::VALUES.iter().copied().find(|g| g.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for ResourceGeneric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.name()) }
}

/// Maps a legacy resource string such as `database.class.OUser` to its generic resource and
/// optional specific name. The longest matching legacy prefix wins; `*` or nothing after the
/// prefix means the generic resource itself.
pub fn legacy_resource(text: &str) -> Option<(ResourceGeneric, Option<String>)> {
    let trimmed = text.trim();
    if trimmed == "*" { return Some((ResourceGeneric::All, None)); }
    let lower = trimmed.to_ascii_lowercase();
    let mut best: Option<ResourceGeneric> = None;
    for g in ResourceGeneric::VALUES {
        if g == ResourceGeneric::All { continue; }
        let prefix = g.legacy_name().to_ascii_lowercase();
        let hit = lower == prefix || (lower.starts_with(&prefix) && lower.as_bytes().get(prefix.len()) == Some(&b'.'));
        if hit && best.map(|b| b.legacy_name().len() < prefix.len()).unwrap_or(true) {
            best = Some(g);
        }
    }
    let generic = best?;
    let plen = generic.legacy_name().len();
    let specific = if trimmed.len() > plen + 1 { Some(&trimmed[plen + 1..]) } else { None };
    let specific = specific.filter(|s| *s != "*").map(|s| s.to_string());
    Some((generic, specific))
}

/// Permission bits for one generic resource, with per-specific-name overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRule {
    generic: ResourceGeneric,
    access: Option<Permission>,
    specific: HashMap<String, Permission>,
}

fn specific_key(name: Option<&str>) -> Option<String> {
    name.filter(|n| *n != "*").map(|n| n.to_ascii_lowercase())
}

impl PermissionRule {
    pub fn new(generic: ResourceGeneric) -> Self { Self { generic, access: None, specific: HashMap::new() } }

    pub fn with_access(generic: ResourceGeneric, specific: Option<&str>, bits: Permission) -> Self {
        let mut rule = Self::new(generic);
        rule.grant_access(specific, bits);
        rule
    }

    pub fn generic(&self) -> ResourceGeneric { self.generic }
    pub fn access(&self) -> Option<Permission> { self.access }
    pub fn specific_resources(&self) -> impl Iterator<Item = (&str, Permission)> {
        self.specific.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn grant_access(&mut self, specific: Option<&str>, bits: Permission) {
        match specific_key(specific) {
            None => self.access = Some(self.access.unwrap_or(Permission::NONE) | bits),
            Some(name) => {
                let cur = self.specific.entry(name).or_insert(Permission::NONE);
                *cur |= bits;
            }
        }
    }

    /// Clears `bits` in the targeted bucket. Revoking NONE leaves the rule untouched; revoking on an
    /// unset bucket records an explicit empty mask.
    pub fn revoke_access(&mut self, specific: Option<&str>, bits: Permission) {
        if bits.is_empty() { return; }
        match specific_key(specific) {
            None => self.access = Some(self.access.unwrap_or(Permission::NONE).difference(bits)),
            Some(name) => {
                let cur = self.specific.entry(name).or_insert(Permission::NONE);
                *cur = cur.difference(bits);
            }
        }
    }

    /// `None` means no bucket had an opinion; callers delegate instead of denying.
    pub fn is_allowed(&self, specific: Option<&str>, op: Permission) -> Option<bool> {
        let Some(name) = specific_key(specific) else { return self.generic_allowed(op) };
        if self.specific.is_empty() { return self.generic_allowed(op); }
        match self.specific.get(&name) {
            Some(mask) => Some(mask.contains(op)),
            None => self.generic_allowed(op),
        }
    }

    fn generic_allowed(&self, op: Permission) -> Option<bool> { self.access.map(|mask| mask.contains(op)) }

    pub fn contains_specific_resource(&self, name: &str) -> bool {
        if self.specific.is_empty() { return true; }
        self.specific.contains_key(&name.to_ascii_lowercase())
    }

    /// Legacy encoding: `database.class` for the generic bucket, `database.class.<name>` per override.
    pub fn encode(&self, out: &mut BTreeMap<String, u8>) {
        let prefix = self.generic.legacy_name();
        if let Some(a) = self.access { out.insert(prefix.to_string(), a.bits()); }
        for (name, mask) in &self.specific {
            if self.generic == ResourceGeneric::All {
                out.insert(name.clone(), mask.bits());
            } else {
                out.insert(format!("{}.{}", prefix, name), mask.bits());
            }
        }
    }
}

/// Local rule check for one rule map: the generic rule first, then the `ALL` rule.
pub(crate) fn check_local(rules: &HashMap<ResourceGeneric, PermissionRule>, generic: ResourceGeneric, specific: Option<&str>, op: Permission) -> Option<bool> {
    if let Some(r) = rules.get(&generic) {
        if let Some(v) = r.is_allowed(specific, op) { return Some(v); }
    }
    if generic != ResourceGeneric::All {
        if let Some(r) = rules.get(&ResourceGeneric::All) {
            if let Some(v) = r.is_allowed(specific, op) { return Some(v); }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_is_not_false() {
        let rule = PermissionRule::new(ResourceGeneric::Class);
        assert_eq!(rule.is_allowed(None, Permission::READ), None);
        assert_eq!(rule.is_allowed(Some("Foo"), Permission::READ), None);
    }

    #[test]
    fn grant_generic_and_specific() {
        let mut rule = PermissionRule::new(ResourceGeneric::Class);
        rule.grant_access(None, Permission::READ);
        rule.grant_access(Some("OUser"), Permission::NONE);
        assert_eq!(rule.is_allowed(None, Permission::READ), Some(true));
        assert_eq!(rule.is_allowed(None, Permission::CREATE), Some(false));
        // specific bucket exists for ouser (case folded) and wins
        assert_eq!(rule.is_allowed(Some("ouser"), Permission::READ), Some(false));
        // unknown specific falls back to the generic bucket
        assert_eq!(rule.is_allowed(Some("Widget"), Permission::READ), Some(true));
        rule.grant_access(None, Permission::CREATE | Permission::UPDATE);
        assert_eq!(rule.is_allowed(None, Permission::CREATE | Permission::READ), Some(true));
    }

    #[test]
    fn revoke_none_is_noop() {
        let mut rule = PermissionRule::with_access(ResourceGeneric::Class, None, Permission::ALL);
        let before = rule.clone();
        rule.revoke_access(None, Permission::NONE);
        assert_eq!(rule, before);
        rule.revoke_access(None, Permission::DELETE);
        assert_eq!(rule.is_allowed(None, Permission::DELETE), Some(false));
        assert_eq!(rule.is_allowed(None, Permission::READ), Some(true));
    }

    #[test]
    fn revoke_on_unset_bucket_records_explicit_deny() {
        let mut rule = PermissionRule::new(ResourceGeneric::Cluster);
        rule.revoke_access(Some("internal"), Permission::READ);
        assert_eq!(rule.is_allowed(Some("internal"), Permission::READ), Some(false));
        assert_eq!(rule.is_allowed(None, Permission::READ), None);
    }

    #[test]
    fn star_specific_means_generic() {
        let rule = PermissionRule::with_access(ResourceGeneric::Function, Some("*"), Permission::EXECUTE);
        assert_eq!(rule.access(), Some(Permission::EXECUTE));
        assert_eq!(rule.specific_resources().count(), 0);
    }

    #[test]
    fn legacy_prefix_mapping() {
        assert_eq!(legacy_resource("*"), Some((ResourceGeneric::All, None)));
        assert_eq!(legacy_resource("database"), Some((ResourceGeneric::Database, None)));
        assert_eq!(legacy_resource("database.class"), Some((ResourceGeneric::Class, None)));
        assert_eq!(legacy_resource("database.class.*"), Some((ResourceGeneric::Class, None)));
        assert_eq!(legacy_resource("database.class.OUser"), Some((ResourceGeneric::Class, Some("OUser".into()))));
        assert_eq!(legacy_resource("database.command.gremlin"), Some((ResourceGeneric::CommandGremlin, None)));
        assert_eq!(legacy_resource("database.bypassRestricted"), Some((ResourceGeneric::BypassRestricted, None)));
        assert_eq!(legacy_resource("DATABASE.CLUSTER.internal"), Some((ResourceGeneric::Cluster, Some("internal".into()))));
        // "database.classic" must not be read as database.class + "ic"
        assert_eq!(legacy_resource("database.classic"), Some((ResourceGeneric::Database, Some("classic".into()))));
        assert_eq!(legacy_resource("nothing"), None);
    }

    #[test]
    fn describe_bits() {
        assert_eq!(Permission::NONE.describe(), "<none>");
        assert_eq!(Permission::ALL.describe(), "All");
        assert_eq!((Permission::READ | Permission::DELETE).describe(), "Read, Delete");
    }

    #[test]
    fn encode_legacy_map() {
        let mut rule = PermissionRule::with_access(ResourceGeneric::Class, None, Permission::READ);
        rule.grant_access(Some("OUser"), Permission::NONE);
        let mut out = BTreeMap::new();
        rule.encode(&mut out);
        assert_eq!(out.get("database.class"), Some(&2));
        assert_eq!(out.get("database.class.ouser"), Some(&0));
    }
}
