//! Schema catalog seam and an in-memory implementation.
//! Class names are case-insensitive throughout.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::RwLock;

use crate::error::{SecurityError, SecurityResult};

pub const IDENTITY_CLASS: &str = "OIdentity";
pub const ROLE_CLASS: &str = "ORole";
pub const USER_CLASS: &str = "OUser";
pub const POLICY_CLASS: &str = "OSecurityPolicy";
pub const RESTRICTED_CLASS: &str = "ORestricted";
pub const FUNCTION_CLASS: &str = "OFunction";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDefinition {
    pub name: String,
    pub fields: Vec<String>,
}

impl IndexDefinition {
    pub fn is_composite(&self) -> bool { self.fields.len() > 1 }
    pub fn involves(&self, property: &str) -> bool { self.fields.iter().any(|f| f.eq_ignore_ascii_case(property)) }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchemaClass {
    pub name: String,
    pub superclasses: Vec<String>,
    pub properties: Vec<String>,
    /// Free-form custom attributes, e.g. `onCreate.identityType`
    pub custom: BTreeMap<String, String>,
    pub indexes: Vec<IndexDefinition>,
}

pub trait SchemaCatalog: Send + Sync {
    fn class(&self, name: &str) -> Option<SchemaClass>;
    fn class_names(&self) -> Vec<String>;

    fn exists_class(&self, name: &str) -> bool { self.class(name).is_some() }

    /// Reflexive: a class is a subclass of itself.
    fn is_subclass_of(&self, class: &str, ancestor: &str) -> bool {
        if class.eq_ignore_ascii_case(ancestor) { return true; }
        self.superclasses_of(class).iter().any(|s| s.eq_ignore_ascii_case(ancestor))
    }

    /// All transitive superclasses, nearest first.
    fn superclasses_of(&self, name: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: Vec<String> = self.class(name).map(|c| c.superclasses).unwrap_or_default();
        while !queue.is_empty() {
            let next = queue.remove(0);
            if !seen.insert(next.to_ascii_lowercase()) { continue; }
            if let Some(c) = self.class(&next) {
                queue.extend(c.superclasses.iter().cloned());
                out.push(c.name);
            }
        }
        out
    }

    fn subclasses_of(&self, name: &str) -> Vec<String> {
        self.class_names()
            .into_iter()
            .filter(|c| !c.eq_ignore_ascii_case(name) && self.is_subclass_of(c, name))
            .collect()
    }

    fn exists_property(&self, class: &str, property: &str) -> bool {
        let mut lineage = vec![class.to_string()];
        lineage.extend(self.superclasses_of(class));
        lineage.iter().filter_map(|c| self.class(c)).any(|c| c.properties.iter().any(|p| p.eq_ignore_ascii_case(property)))
    }

    fn indexes_of(&self, class: &str) -> Vec<IndexDefinition> { self.class(class).map(|c| c.indexes).unwrap_or_default() }
}

/// Thread-safe in-memory schema. Starts with the security classes registered.
pub struct MemorySchema {
    classes: RwLock<HashMap<String, SchemaClass>>,
}

impl Default for MemorySchema {
    fn default() -> Self { Self::new() }
}

impl MemorySchema {
    pub fn new() -> Self {
        let schema = Self { classes: RwLock::new(HashMap::new()) };
        {
            let mut m = schema.classes.write();
            let mut put = |name: &str, supers: &[&str], props: &[&str]| {
                m.insert(
                    name.to_ascii_lowercase(),
                    SchemaClass {
                        name: name.to_string(),
                        superclasses: supers.iter().map(|s| s.to_string()).collect(),
                        properties: props.iter().map(|s| s.to_string()).collect(),
                        ..Default::default()
                    },
                );
            };
            put(IDENTITY_CLASS, &[], &[]);
            put(ROLE_CLASS, &[IDENTITY_CLASS], &["name", "mode", "rules", "inheritedRole", "policies"]);
            put(USER_CLASS, &[IDENTITY_CLASS], &["name", "password", "status", "roles"]);
            put(POLICY_CLASS, &[], &["name", "active", "create", "read", "beforeUpdate", "afterUpdate", "delete", "execute"]);
            put(RESTRICTED_CLASS, &[], &["_allow", "_allowRead", "_allowUpdate", "_allowDelete"]);
            put(FUNCTION_CLASS, &[], &["name", "code", "language"]);
        }
        schema
    }

    pub fn create_class(&self, name: &str, superclasses: &[&str]) -> SecurityResult<()> {
        let mut m = self.classes.write();
        for s in superclasses {
            if !m.contains_key(&s.to_ascii_lowercase()) {
                return Err(SecurityError::configuration(format!("superclass '{}' of '{}' does not exist", s, name)));
            }
        }
        let key = name.to_ascii_lowercase();
        if m.contains_key(&key) { return Err(SecurityError::configuration(format!("class '{}' already exists", name))); }
        m.insert(key, SchemaClass { name: name.to_string(), superclasses: superclasses.iter().map(|s| s.to_string()).collect(), ..Default::default() });
        Ok(())
    }

    pub fn drop_class(&self, name: &str) -> bool { self.classes.write().remove(&name.to_ascii_lowercase()).is_some() }

    pub fn add_property(&self, class: &str, property: &str) -> SecurityResult<()> {
        self.with_class(class, |c| {
            if !c.properties.iter().any(|p| p.eq_ignore_ascii_case(property)) { c.properties.push(property.to_string()); }
        })
    }

    pub fn set_custom(&self, class: &str, key: &str, value: &str) -> SecurityResult<()> {
        self.with_class(class, |c| {
            c.custom.insert(key.to_string(), value.to_string());
        })
    }

    pub fn add_index(&self, class: &str, name: &str, fields: &[&str]) -> SecurityResult<()> {
        self.with_class(class, |c| c.indexes.push(IndexDefinition { name: name.to_string(), fields: fields.iter().map(|f| f.to_string()).collect() }))
    }

    fn with_class<F: FnOnce(&mut SchemaClass)>(&self, class: &str, f: F) -> SecurityResult<()> {
        let mut m = self.classes.write();
        let c = m.get_mut(&class.to_ascii_lowercase()).ok_or_else(|| SecurityError::not_found("class", class))?;
        f(c);
        Ok(())
    }
}

impl SchemaCatalog for MemorySchema {
    fn class(&self, name: &str) -> Option<SchemaClass> { self.classes.read().get(&name.to_ascii_lowercase()).cloned() }
    fn class_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.classes.read().values().map(|c| c.name.clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> MemorySchema {
        let s = MemorySchema::new();
        s.create_class("Base", &[]).unwrap();
        s.create_class("Left", &["Base"]).unwrap();
        s.create_class("Right", &["Base"]).unwrap();
        s.create_class("Both", &["Left", "Right"]).unwrap();
        s
    }

    #[test]
    fn hierarchy_queries() {
        let s = diamond();
        assert!(s.is_subclass_of("Both", "base"));
        assert!(s.is_subclass_of("Left", "Left"));
        assert!(!s.is_subclass_of("Base", "Left"));
        assert_eq!(s.superclasses_of("Both"), vec!["Left".to_string(), "Right".to_string(), "Base".to_string()]);
        let mut subs = s.subclasses_of("Base");
        subs.sort();
        assert_eq!(subs, vec!["Both".to_string(), "Left".to_string(), "Right".to_string()]);
        assert!(s.is_subclass_of("OUser", IDENTITY_CLASS));
    }

    #[test]
    fn properties_and_indexes() {
        let s = diamond();
        s.add_property("Base", "name").unwrap();
        assert!(s.exists_property("Both", "NAME"));
        s.add_index("Left", "Left.name_age", &["name", "age"]).unwrap();
        let idx = s.indexes_of("Left");
        assert_eq!(idx.len(), 1);
        assert!(idx[0].is_composite());
        assert!(idx[0].involves("Age"));
        assert!(s.add_property("Missing", "x").is_err());
    }

    #[test]
    fn create_class_validates() {
        let s = MemorySchema::new();
        assert!(s.create_class("Child", &["Nope"]).is_err());
        s.create_class("Thing", &[]).unwrap();
        assert!(s.create_class("thing", &[]).is_err());
        assert!(s.drop_class("THING"));
    }
}
