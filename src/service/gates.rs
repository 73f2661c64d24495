//! Record and function gates. Every gate allows when there is no principal or the thread runs
//! in privileged mode; gating for those cases happens earlier in the pipeline.

use std::collections::BTreeSet;

use super::SecurityService;
use crate::error::SecurityResult;
use crate::policy::Scope;
use crate::predicate::Predicate;
use crate::privileged::is_privileged;
use crate::record::{Projection, Record};
use crate::resource::Resource;
use crate::schema::POLICY_CLASS;
use crate::snapshot::ImmutablePrincipal;

fn acting(principal: Option<&ImmutablePrincipal>) -> Option<&ImmutablePrincipal> {
    if is_privileged() { None } else { principal }
}

impl SecurityService {
    /// True when the optimization index says no role of the principal is restricted on `class`.
    fn fast_path(&self, principal: &ImmutablePrincipal, class: &str) -> bool {
        match self.index.read().as_ref() {
            Some(idx) => idx.is_all_allowed(principal.roles(), class),
            None => false,
        }
    }

    fn check_scope(&self, principal: &ImmutablePrincipal, resource: &Resource, scope: Scope, candidate: &Record) -> SecurityResult<bool> {
        let predicate = self.engine.resolve(resource, scope, principal.roles())?;
        self.engine.evaluate(&predicate, candidate, &self.eval_context(principal))
    }

    fn check_before_update(&self, principal: &ImmutablePrincipal, resource: &Resource, record: &Record) -> SecurityResult<bool> {
        let predicate = self.engine.resolve(resource, Scope::BeforeUpdate, principal.roles())?;
        if let Predicate::True | Predicate::False = predicate {
            return Ok(predicate.is_true());
        }
        let before = Projection::before_update(record);
        self.engine.evaluate(&predicate, &before, &self.eval_context(principal))
    }

    fn record_gate(&self, principal: Option<&ImmutablePrincipal>, record: &Record, scope: Scope) -> SecurityResult<bool> {
        let Some(p) = acting(principal) else { return Ok(true) };
        let Some(class) = record.class() else { return Ok(true) };
        if scope == Scope::Read && class.eq_ignore_ascii_case(POLICY_CLASS) { return Ok(true); }
        if self.fast_path(p, class) { return Ok(true); }
        let resource = Resource::class(class);
        let allowed = match scope {
            Scope::BeforeUpdate | Scope::AfterUpdate => {
                self.check_before_update(p, &resource, record)? && self.check_scope(p, &resource, Scope::AfterUpdate, record)?
            }
            _ => self.check_scope(p, &resource, scope, record)?,
        };
        tracing::debug!(target: "rowsec::gate", user = %p.name(), class = %class, scope = %scope, allowed, "record gate");
        if !allowed {
            self.audit(Some(p.name()), scope.as_str(), &resource.to_string(), false);
        }
        Ok(allowed)
    }

    pub fn can_create(&self, principal: Option<&ImmutablePrincipal>, record: &Record) -> SecurityResult<bool> {
        self.record_gate(principal, record, Scope::Create)
    }

    /// Records of the policy storage class are always readable.
    pub fn can_read(&self, principal: Option<&ImmutablePrincipal>, record: &Record) -> SecurityResult<bool> {
        self.record_gate(principal, record, Scope::Read)
    }

    /// BEFORE_UPDATE against the pre-mutation projection, then AFTER_UPDATE against `record`.
    pub fn can_update(&self, principal: Option<&ImmutablePrincipal>, record: &Record) -> SecurityResult<bool> {
        self.record_gate(principal, record, Scope::AfterUpdate)
    }

    pub fn can_delete(&self, principal: Option<&ImmutablePrincipal>, record: &Record) -> SecurityResult<bool> {
        self.record_gate(principal, record, Scope::Delete)
    }

    /// EXECUTE gate for a function; allowed when no role binds a function policy at all.
    pub fn can_execute(&self, principal: Option<&ImmutablePrincipal>, function: &str, document: &Record) -> SecurityResult<bool> {
        let Some(p) = acting(principal) else { return Ok(true) };
        let Some(predicate) = self.engine.resolve_function(function, Scope::Execute, p.roles())? else { return Ok(true) };
        let allowed = self.engine.evaluate(&predicate, document, &self.eval_context(p))?;
        if !allowed {
            self.audit(Some(p.name()), Scope::Execute.as_str(), &Resource::function(function).to_string(), false);
        }
        Ok(allowed)
    }

    /// Properties of `record` whose READ predicate fails for this principal.
    pub fn filtered_properties(&self, principal: Option<&ImmutablePrincipal>, record: &Record) -> SecurityResult<BTreeSet<String>> {
        let mut hidden = BTreeSet::new();
        let Some(p) = acting(principal) else { return Ok(hidden) };
        let Some(class) = record.class() else { return Ok(hidden) };
        let Some(known) = self.schema.class(class) else { return Ok(hidden) };
        if known.name.eq_ignore_ascii_case(POLICY_CLASS) || self.fast_path(p, &known.name) { return Ok(hidden); }
        let ctx = self.eval_context(p);
        for name in record.field_names() {
            let predicate = self.engine.resolve(&Resource::property(known.name.as_str(), name), Scope::Read, p.roles())?;
            if !self.engine.evaluate(&predicate, record, &ctx)? {
                hidden.insert(name.to_string());
            }
        }
        if !hidden.is_empty() {
            tracing::debug!(target: "rowsec::gate", user = %p.name(), class = %known.name, hidden = hidden.len(), "properties filtered");
        }
        Ok(hidden)
    }

    /// Column write check. New records need CREATE; existing ones need READ, then BEFORE_UPDATE
    /// on the pre-mutation projection, then AFTER_UPDATE.
    pub fn is_allowed_write(&self, principal: Option<&ImmutablePrincipal>, record: &Record, property: &str) -> SecurityResult<bool> {
        let Some(p) = acting(principal) else { return Ok(true) };
        let Some(class) = record.class() else { return Ok(true) };
        let Some(known) = self.schema.class(class) else { return Ok(true) };
        if self.fast_path(p, &known.name) { return Ok(true); }
        let resource = Resource::property(known.name.as_str(), property);
        let allowed = if record.is_new() {
            self.check_scope(p, &resource, Scope::Create, record)?
        } else {
            self.check_scope(p, &resource, Scope::Read, record)?
                && self.check_before_update(p, &resource, record)?
                && self.check_scope(p, &resource, Scope::AfterUpdate, record)?
        };
        if !allowed {
            self.audit(Some(p.name()), "write", &resource.to_string(), false);
        }
        Ok(allowed)
    }

    /// True iff the READ predicate resolved for `resource` is anything other than the TRUE constant.
    pub fn is_read_restricted_by_security_policy(&self, principal: Option<&ImmutablePrincipal>, resource: &str) -> SecurityResult<bool> {
        let Some(p) = acting(principal) else { return Ok(false) };
        let resource = self.resolver.resolve(resource)?;
        let predicate = self.engine.resolve(&resource, Scope::Read, p.roles())?;
        Ok(!predicate.is_true())
    }

    /// Whether any role of the principal may carry a restricting policy on `class`. An unbuilt
    /// index answers yes.
    pub fn could_have_active_predicate_security_roles(&self, principal: Option<&ImmutablePrincipal>, class: &str) -> bool {
        let Some(p) = acting(principal) else { return false };
        match self.index.read().as_ref() {
            Some(idx) => idx.is_class_involved(p.roles(), class),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::catalog::SecurityCatalog;
    use crate::config::SecurityConfig;
    use crate::privileged::run_without_authorization;
    use crate::record::{MemoryRecordStore, RecordId};
    use crate::schema::MemorySchema;

    fn service(catalog: SecurityCatalog) -> (SecurityService, ImmutablePrincipal) {
        let schema = Arc::new(MemorySchema::new());
        schema.create_class("Doc", &[]).unwrap();
        schema.create_class("Memo", &["Doc"]).unwrap();
        let svc = SecurityService::new(SecurityConfig::default(), schema, Arc::new(MemoryRecordStore::new()))
            .with_catalog(catalog)
            .unwrap();
        svc.rebuild_optimizations().unwrap();
        let p = svc.read_catalog(|c| ImmutablePrincipal::snapshot(c, c.user_id("alice").unwrap())).unwrap();
        (svc, p)
    }

    fn catalog(rules: &[(&str, Scope, &str)]) -> SecurityCatalog {
        let mut c = SecurityCatalog::new();
        c.create_role("r", None).unwrap();
        for (resource, scope, text) in rules {
            let res = Resource::parse(resource).unwrap();
            let name = res.key();
            if c.policy_by_name(&name).is_none() {
                let id = c.create_policy(&name).unwrap();
                c.attach_policy("r", res, id).unwrap();
            }
            c.policy_mut(&name).unwrap().set_rule(*scope, Some(text));
        }
        c.create_user("alice", String::new(), &["r"]).unwrap();
        c
    }

    fn doc(fields: &[(&str, &str)]) -> Record {
        let mut r = Record::new("Doc").with_id(RecordId::new(9, 1));
        for (k, v) in fields { r = r.with_field(*k, *v); }
        r
    }

    #[test]
    fn no_principal_and_privileged_mode_allow() {
        let (svc, p) = service(catalog(&[("database.class.Doc", Scope::Read, "false")]));
        let d = doc(&[]);
        assert!(svc.can_read(None, &d).unwrap());
        assert!(!svc.can_read(Some(&p), &d).unwrap());
        assert!(run_without_authorization(|| svc.can_read(Some(&p), &d).unwrap()));
    }

    #[test]
    fn read_gate_evaluates_record() {
        let (svc, p) = service(catalog(&[("database.class.Doc", Scope::Read, "status = 'open'")]));
        assert!(svc.can_read(Some(&p), &doc(&[("status", "open")])).unwrap());
        assert!(!svc.can_read(Some(&p), &doc(&[("status", "closed")])).unwrap());
        assert!(svc.can_read(Some(&p), &Record::new(POLICY_CLASS)).unwrap());
    }

    #[test]
    fn update_checks_original_then_new_values() {
        let (svc, p) = service(catalog(&[
            ("database.class.Doc", Scope::BeforeUpdate, "status = 'draft'"),
            ("database.class.Doc", Scope::AfterUpdate, "status <> 'locked'"),
        ]));
        let mut d = doc(&[("status", "draft")]);
        d.set("status", "final");
        assert!(svc.can_update(Some(&p), &d).unwrap());
        let mut d = doc(&[("status", "final")]);
        d.set("status", "draft");
        assert!(!svc.can_update(Some(&p), &d).unwrap());
    }

    #[test]
    fn fast_path_skips_unrestricted_classes() {
        let (svc, p) = service(catalog(&[("database.class.Memo", Scope::Read, "false")]));
        assert!(!svc.could_have_active_predicate_security_roles(Some(&p), "Doc"));
        assert!(svc.could_have_active_predicate_security_roles(Some(&p), "Memo"));
        assert!(svc.can_delete(Some(&p), &doc(&[])).unwrap());
    }

    #[test]
    fn execute_defaults_to_allow_without_policy() {
        let (svc, p) = service(catalog(&[("database.function.audit", Scope::Execute, "false")]));
        assert!(svc.can_execute(Some(&p), "other", &Record::untyped()).unwrap());
        assert!(!svc.can_execute(Some(&p), "audit", &Record::untyped()).unwrap());
    }

    #[test]
    fn property_filtering_and_write_checks() {
        let (svc, p) = service(catalog(&[
            ("database.class.Doc.salary", Scope::Read, "false"),
            ("database.class.Doc.name", Scope::Create, "false"),
        ]));
        let d = doc(&[("name", "x"), ("salary", "10")]);
        let hidden = svc.filtered_properties(Some(&p), &d).unwrap();
        assert_eq!(hidden.into_iter().collect::<Vec<_>>(), vec!["salary".to_string()]);
        let fresh = Record::new("Doc").with_field("name", "y");
        assert!(!svc.is_allowed_write(Some(&p), &fresh, "name").unwrap());
        assert!(svc.is_allowed_write(Some(&p), &d, "name").unwrap());
        assert!(!svc.is_allowed_write(Some(&p), &d, "salary").unwrap());
        assert!(svc.is_read_restricted_by_security_policy(Some(&p), "database.class.Doc.salary").unwrap());
        assert!(!svc.is_read_restricted_by_security_policy(Some(&p), "database.class.Doc.name").unwrap());
        assert!(svc.is_read_restricted_by_security_policy(Some(&p), "database.class.").is_err());
    }
}
