//! Record-level identity sets for classes extending `ORestricted`.

use crate::error::{SecurityError, SecurityResult};
use crate::record::{Record, RecordId, Value};
use crate::rule::Permission;
use crate::schema::{SchemaCatalog, SchemaClass, RESTRICTED_CLASS};
use crate::snapshot::ImmutablePrincipal;

pub const ALLOW_ALL_FIELD: &str = "_allow";
pub const ALLOW_READ_FIELD: &str = "_allowRead";
pub const ALLOW_UPDATE_FIELD: &str = "_allowUpdate";
pub const ALLOW_DELETE_FIELD: &str = "_allowDelete";

const ON_CREATE_IDENTITY: &str = "onCreate.identityType";
const ON_CREATE_FIELDS: &str = "onCreate.fields";

pub fn op_field(op: Permission) -> Option<&'static str> {
    if op == Permission::READ {
        Some(ALLOW_READ_FIELD)
    } else if op == Permission::UPDATE {
        Some(ALLOW_UPDATE_FIELD)
    } else if op == Permission::DELETE {
        Some(ALLOW_DELETE_FIELD)
    } else {
        None
    }
}

pub fn is_restricted(schema: &dyn SchemaCatalog, class: Option<&str>) -> bool {
    class.map(|c| schema.is_subclass_of(c, RESTRICTED_CLASS)).unwrap_or(false)
}

fn identities(record: &Record, field: Option<&str>) -> Vec<RecordId> {
    field.and_then(|f| record.field(f)).and_then(Value::links).unwrap_or_default()
}

/// True when both identity sets are empty, when there is no principal, or when the user or any
/// role in a role's parent chain is listed.
pub fn is_allowed(principal: Option<&ImmutablePrincipal>, record: &Record, op: Permission) -> bool {
    let all = identities(record, Some(ALLOW_ALL_FIELD));
    let specific = identities(record, op_field(op));
    if all.is_empty() && specific.is_empty() { return true; }
    let Some(p) = principal else { return true };
    let listed = |id: RecordId| all.contains(&id) || specific.contains(&id);
    if p.identity().map(listed).unwrap_or(false) { return true; }
    p.roles().iter().any(|r| r.lineage().any(|l| l.identity().map(listed).unwrap_or(false)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityType {
    User,
    Role,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestrictedDefaults {
    pub identity_type: IdentityType,
    pub fields: Vec<String>,
}

impl RestrictedDefaults {
    pub fn from_class(class: &SchemaClass) -> SecurityResult<Self> {
        let identity_type = match class.custom.get(ON_CREATE_IDENTITY).map(|s| s.trim()) {
            None | Some("") => IdentityType::User,
            Some(t) if t.eq_ignore_ascii_case("user") => IdentityType::User,
            Some(t) if t.eq_ignore_ascii_case("role") => IdentityType::Role,
            Some(t) => {
                return Err(SecurityError::configuration(format!(
                    "Wrong custom field '{}' in class '{}' with value '{}'. Supported values are: 'user', 'role'",
                    ON_CREATE_IDENTITY, class.name, t
                )))
            }
        };
        let fields: Vec<String> = class
            .custom
            .get(ON_CREATE_FIELDS)
            .map(|f| f.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect())
            .unwrap_or_default();
        let fields = if fields.is_empty() { vec![ALLOW_ALL_FIELD.to_string()] } else { fields };
        Ok(Self { identity_type, fields })
    }
}

/// Stamps the creating identity onto a new restricted record.
pub fn on_create(schema: &dyn SchemaCatalog, principal: Option<&ImmutablePrincipal>, record: &mut Record) -> SecurityResult<()> {
    let Some(class_name) = record.class().map(str::to_string) else { return Ok(()) };
    if !schema.is_subclass_of(&class_name, RESTRICTED_CLASS) { return Ok(()); }
    let Some(class) = schema.class(&class_name) else { return Ok(()) };
    let defaults = RestrictedDefaults::from_class(&class)?;
    let Some(p) = principal else { return Ok(()) };
    let identity = match defaults.identity_type {
        IdentityType::User => p.identity(),
        IdentityType::Role => p.roles().first().and_then(|r| r.identity()),
    };
    let Some(identity) = identity else { return Ok(()) };
    for field in &defaults.fields {
        let mut ids = record.field(field).and_then(Value::links).unwrap_or_default();
        if !ids.contains(&identity) { ids.push(identity); }
        record.set(field.as_str(), Value::LinkSet(ids));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SecurityCatalog;
    use crate::schema::MemorySchema;

    fn principal() -> (SecurityCatalog, ImmutablePrincipal) {
        let mut c = SecurityCatalog::new();
        c.create_role("base", None).unwrap();
        c.create_role("staff", Some("base")).unwrap();
        c.create_user("alice", String::new(), &["staff"]).unwrap();
        let p = ImmutablePrincipal::snapshot(&c, c.user_id("alice").unwrap()).unwrap();
        (c, p)
    }

    #[test]
    fn empty_sets_allow_everyone() {
        let (_, p) = principal();
        assert!(is_allowed(Some(&p), &Record::new("Secret"), Permission::READ));
    }

    #[test]
    fn user_and_inherited_role_identities() {
        let (c, p) = principal();
        let stranger = RecordId::new(5, 999);
        let only_other = Record::new("Secret").with_field(ALLOW_ALL_FIELD, Value::LinkSet(vec![stranger]));
        assert!(!is_allowed(Some(&p), &only_other, Permission::READ));
        assert!(is_allowed(None, &only_other, Permission::READ));

        let mine = Record::new("Secret").with_field(ALLOW_READ_FIELD, Value::LinkSet(vec![p.identity().unwrap()]));
        assert!(is_allowed(Some(&p), &mine, Permission::READ));
        assert!(!is_allowed(Some(&p), &mine, Permission::DELETE));

        let base = c.role_id("base").unwrap().identity();
        let by_ancestor = Record::new("Secret").with_field(ALLOW_DELETE_FIELD, Value::LinkSet(vec![base]));
        assert!(is_allowed(Some(&p), &by_ancestor, Permission::DELETE));
    }

    #[test]
    fn on_create_defaults() {
        let (_, p) = principal();
        let schema = MemorySchema::new();
        schema.create_class("Secret", &[RESTRICTED_CLASS]).unwrap();
        let mut rec = Record::new("Secret");
        on_create(&schema, Some(&p), &mut rec).unwrap();
        assert_eq!(rec.field(ALLOW_ALL_FIELD), Some(&Value::LinkSet(vec![p.identity().unwrap()])));

        schema.set_custom("Secret", ON_CREATE_IDENTITY, "role").unwrap();
        schema.set_custom("Secret", ON_CREATE_FIELDS, "_allowRead, _allowUpdate").unwrap();
        let mut rec = Record::new("Secret");
        on_create(&schema, Some(&p), &mut rec).unwrap();
        let role = p.roles()[0].identity().unwrap();
        assert_eq!(rec.field(ALLOW_READ_FIELD), Some(&Value::LinkSet(vec![role])));
        assert_eq!(rec.field(ALLOW_UPDATE_FIELD), Some(&Value::LinkSet(vec![role])));
        assert!(rec.field(ALLOW_ALL_FIELD).is_none());
    }

    #[test]
    fn unknown_identity_type_is_configuration_error() {
        let (_, p) = principal();
        let schema = MemorySchema::new();
        schema.create_class("Secret", &[RESTRICTED_CLASS]).unwrap();
        schema.set_custom("Secret", ON_CREATE_IDENTITY, "group").unwrap();
        let err = on_create(&schema, Some(&p), &mut Record::new("Secret")).unwrap_err();
        assert_eq!(err.code_str(), "configuration");
    }

    #[test]
    fn plain_classes_are_untouched() {
        let schema = MemorySchema::new();
        schema.create_class("Plain", &[]).unwrap();
        let mut rec = Record::new("Plain");
        on_create(&schema, None, &mut rec).unwrap();
        assert_eq!(rec.fields().count(), 0);
        assert!(!is_restricted(&schema, Some("Plain")));
    }
}
