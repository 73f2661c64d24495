//! Per-connection security state: the acting principal's immutable snapshot plus the gate and
//! pipeline helpers that run on its behalf.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use super::SecurityService;
use crate::error::{SecurityError, SecurityResult};
use crate::privileged::is_privileged;
use crate::record::Record;
use crate::restricted;
use crate::rule::{Permission, ResourceGeneric};
use crate::snapshot::ImmutablePrincipal;
use crate::user::{denied_message, inactive_message};

/// Fixed throttle applied to every failed authentication.
pub const AUTH_FAILURE_DELAY: Duration = Duration::from_millis(200);

pub struct SecuritySession {
    service: Arc<SecurityService>,
    principal: RwLock<Option<Arc<ImmutablePrincipal>>>,
    snapshot_version: AtomicU64,
    token: Mutex<Option<String>>,
}

impl std::fmt::Debug for SecuritySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecuritySession")
            .field("principal", &*self.principal.read())
            .field("snapshot_version", &self.snapshot_version.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Clears the session principal and puts it back on drop, on every exit path.
struct PrincipalSwap<'a> {
    session: &'a SecuritySession,
    saved: Option<Arc<ImmutablePrincipal>>,
}

impl Drop for PrincipalSwap<'_> {
    fn drop(&mut self) { *self.session.principal.write() = self.saved.take(); }
}

fn auth_failure(service: &SecurityService, user: &str, err: SecurityError) -> SecurityError {
    service.audit(Some(user), "authenticate", "server", false);
    tracing::info!(target: "rowsec::auth", user = %user, code = err.code_str(), "authentication failed");
    std::thread::sleep(AUTH_FAILURE_DELAY);
    err
}

impl SecurityService {
    /// Verifies the password and returns a session bound to a fresh principal snapshot.
    /// Every failure blocks the calling thread for [`AUTH_FAILURE_DELAY`].
    pub fn authenticate(self: &Arc<Self>, user: &str, password: &str) -> SecurityResult<SecuritySession> {
        let attempt = {
            let cat = self.catalog.read();
            match cat.user_by_name(user) {
                None => Err(SecurityError::access_denied(format!("User or password not valid for username: {}", user))),
                Some(u) if !self.hasher.verify(u.password_hash(), password) => {
                    Err(SecurityError::access_denied(format!("User or password not valid for username: {}", user)))
                }
                Some(u) if !u.is_active() => Err(SecurityError::access_denied(inactive_message(u.name()))),
                Some(u) => ImmutablePrincipal::snapshot(&cat, u.id()).ok_or_else(|| SecurityError::not_found("user", user)),
            }
        };
        let principal = attempt.map_err(|e| auth_failure(self, user, e))?;
        tracing::debug!(target: "rowsec::auth", user = %principal.name(), roles = principal.roles().len(), "authenticated");
        self.audit(Some(principal.name()), "authenticate", "server", true);
        Ok(SecuritySession::bound(self.clone(), principal))
    }

    /// Session for a token previously issued by [`SecuritySession::issue_token`].
    pub fn authenticate_token(self: &Arc<Self>, token: &str) -> SecurityResult<SecuritySession> {
        let Some(user) = self.tokens.validate(token) else {
            return Err(auth_failure(self, "<token>", SecurityError::access_denied("Token not valid")));
        };
        let attempt = {
            let cat = self.catalog.read();
            match cat.user_by_name(&user) {
                None => Err(SecurityError::access_denied(format!("User '{}' not found", user))),
                Some(u) if !u.is_active() => Err(SecurityError::access_denied(inactive_message(u.name()))),
                Some(u) => ImmutablePrincipal::snapshot(&cat, u.id()).ok_or_else(|| SecurityError::not_found("user", user.as_str())),
            }
        };
        let principal = attempt.map_err(|e| auth_failure(self, &user, e))?;
        self.audit(Some(principal.name()), "authenticate_token", "server", true);
        let session = SecuritySession::bound(self.clone(), principal);
        *session.token.lock() = Some(token.to_string());
        Ok(session)
    }

    pub fn logout(&self, token: &str) -> bool { self.tokens.revoke(token) }

    /// Session for an account defined outside the database, backed by a synthetic root role.
    pub fn server_session(self: &Arc<Self>, name: &str, resources: &str) -> SecurityResult<SecuritySession> {
        let principal = ImmutablePrincipal::server_account(name, resources)?;
        Ok(SecuritySession::bound(self.clone(), principal))
    }

    /// Session with no principal: every gate allows (gating happened earlier in the pipeline).
    pub fn unauthenticated(self: &Arc<Self>) -> SecuritySession {
        SecuritySession {
            service: self.clone(),
            principal: RwLock::new(None),
            snapshot_version: AtomicU64::new(self.version()),
            token: Mutex::new(None),
        }
    }
}

impl SecuritySession {
    fn bound(service: Arc<SecurityService>, principal: ImmutablePrincipal) -> Self {
        let v = service.version();
        Self { service, principal: RwLock::new(Some(Arc::new(principal))), snapshot_version: AtomicU64::new(v), token: Mutex::new(None) }
    }

    pub fn service(&self) -> &Arc<SecurityService> { &self.service }

    /// Current principal snapshot, re-taken when the service version has moved since it was built.
    pub fn principal(&self) -> SecurityResult<Option<Arc<ImmutablePrincipal>>> {
        let current = self.service.version();
        if self.snapshot_version.load(Ordering::Acquire) < current {
            self.refresh(current)?;
        }
        Ok(self.principal.read().clone())
    }

    /// A cleared principal (no user, or inside [`run_unfiltered`](Self::run_unfiltered)) leaves
    /// the snapshot version alone so the restored principal still refreshes.
    fn refresh(&self, version: u64) -> SecurityResult<()> {
        let Some(p) = self.principal.read().clone() else { return Ok(()) };
        if let Some(id) = p.id() {
            let fresh = {
                let cat = self.service.catalog.read();
                ImmutablePrincipal::snapshot(&cat, id)
            };
            let fresh = fresh.ok_or_else(|| SecurityError::access_denied(format!("User '{}' no longer exists", p.name())))?;
            tracing::debug!(target: "rowsec::auth", user = %fresh.name(), version, "principal snapshot refreshed");
            *self.principal.write() = Some(Arc::new(fresh));
        }
        self.snapshot_version.fetch_max(version, Ordering::AcqRel);
        Ok(())
    }

    pub fn user_name(&self) -> Option<String> { self.principal.read().as_ref().map(|p| p.name().to_string()) }

    /// Issues a bearer token for this session's user.
    pub fn issue_token(&self) -> SecurityResult<String> {
        let name = self.user_name().ok_or_else(|| SecurityError::access_denied("No authenticated user"))?;
        let token = self.service.tokens.issue(&name)?;
        *self.token.lock() = Some(token.clone());
        Ok(token)
    }

    pub fn token(&self) -> Option<String> { self.token.lock().clone() }

    pub fn logout(&self) -> bool {
        match self.token.lock().take() {
            Some(t) => self.service.logout(&t),
            None => false,
        }
    }

    /// Runs `f` with the principal cleared, restoring it afterwards even if `f` panics.
    pub fn run_unfiltered<T>(&self, f: impl FnOnce(&SecuritySession) -> T) -> T {
        let saved = self.principal.write().take();
        let _swap = PrincipalSwap { session: self, saved };
        f(self)
    }

    // ---- legacy bitmask checks ----

    /// Legacy rule check; no principal or privileged mode allows.
    pub fn check_security(&self, generic: ResourceGeneric, specific: Option<&str>, op: Permission) -> SecurityResult<()> {
        if is_privileged() { return Ok(()); }
        let Some(p) = self.principal()? else { return Ok(()) };
        match p.allow(generic, specific, op) {
            Ok(_) => Ok(()),
            Err(e) => {
                let resource = match specific {
                    Some(s) => format!("{}.{}", generic.legacy_name(), s),
                    None => generic.legacy_name().to_string(),
                };
                self.service.audit(Some(p.name()), &op.describe(), &resource, false);
                Err(e)
            }
        }
    }

    pub fn is_allowed(&self, generic: ResourceGeneric, specific: Option<&str>, op: Permission) -> SecurityResult<bool> {
        Ok(self.check_security(generic, specific, op).is_ok())
    }

    // ---- predicate gates ----

    pub fn can_create(&self, record: &Record) -> SecurityResult<bool> { self.service.can_create(self.principal()?.as_deref(), record) }
    pub fn can_read(&self, record: &Record) -> SecurityResult<bool> { self.service.can_read(self.principal()?.as_deref(), record) }
    pub fn can_update(&self, record: &Record) -> SecurityResult<bool> { self.service.can_update(self.principal()?.as_deref(), record) }
    pub fn can_delete(&self, record: &Record) -> SecurityResult<bool> { self.service.can_delete(self.principal()?.as_deref(), record) }

    pub fn can_execute(&self, function: &str, document: &Record) -> SecurityResult<bool> {
        self.service.can_execute(self.principal()?.as_deref(), function, document)
    }

    pub fn filtered_properties(&self, record: &Record) -> SecurityResult<BTreeSet<String>> {
        self.service.filtered_properties(self.principal()?.as_deref(), record)
    }

    pub fn is_allowed_write(&self, record: &Record, property: &str) -> SecurityResult<bool> {
        self.service.is_allowed_write(self.principal()?.as_deref(), record, property)
    }

    pub fn is_read_restricted_by_security_policy(&self, resource: &str) -> SecurityResult<bool> {
        self.service.is_read_restricted_by_security_policy(self.principal()?.as_deref(), resource)
    }

    pub fn could_have_active_predicate_security_roles(&self, class: &str) -> SecurityResult<bool> {
        Ok(self.service.could_have_active_predicate_security_roles(self.principal()?.as_deref(), class))
    }

    // ---- record pipeline helpers ----

    fn authorize(&self, record: &Record, op: Permission, allowed: bool) -> SecurityResult<()> {
        if allowed { return Ok(()); }
        let name = self.user_name().unwrap_or_default();
        let class = record.class().unwrap_or("");
        self.service.audit(Some(&name), &op.describe(), &format!("database.class.{}", class), false);
        Err(SecurityError::access_denied(denied_message(&name, ResourceGeneric::Class, Some(class), op)))
    }

    fn restricted_allows(&self, record: &Record, op: Permission) -> SecurityResult<bool> {
        if !restricted::is_restricted(self.service.schema().as_ref(), record.class()) { return Ok(true); }
        let principal = self.principal()?;
        let Some(p) = principal.as_deref() else { return Ok(true) };
        if p.allow(ResourceGeneric::BypassRestricted, None, op).is_ok() { return Ok(true); }
        Ok(restricted::is_allowed(Some(p), record, op))
    }

    fn legacy_class_check(&self, record: &Record, op: Permission) -> SecurityResult<()> {
        match record.class() {
            Some(class) => self.check_security(ResourceGeneric::Class, Some(class), op),
            None => Ok(()),
        }
    }

    /// Legacy CLASS check, CREATE predicate gate, then stamps restricted-record identities.
    pub fn authorize_create(&self, record: &mut Record) -> SecurityResult<()> {
        if is_privileged() { return Ok(()); }
        self.legacy_class_check(record, Permission::CREATE)?;
        let ok = self.can_create(record)?;
        self.authorize(record, Permission::CREATE, ok)?;
        let principal = self.principal()?;
        restricted::on_create(self.service.schema().as_ref(), principal.as_deref(), record)
    }

    pub fn authorize_read(&self, record: &Record) -> SecurityResult<()> {
        if is_privileged() { return Ok(()); }
        self.legacy_class_check(record, Permission::READ)?;
        let ok = self.can_read(record)? && self.restricted_allows(record, Permission::READ)?;
        self.authorize(record, Permission::READ, ok)
    }

    pub fn authorize_update(&self, record: &Record) -> SecurityResult<()> {
        if is_privileged() { return Ok(()); }
        self.legacy_class_check(record, Permission::UPDATE)?;
        let ok = self.can_update(record)? && self.restricted_allows(record, Permission::UPDATE)?;
        self.authorize(record, Permission::UPDATE, ok)
    }

    pub fn authorize_delete(&self, record: &Record) -> SecurityResult<()> {
        if is_privileged() { return Ok(()); }
        self.legacy_class_check(record, Permission::DELETE)?;
        let ok = self.can_delete(record)? && self.restricted_allows(record, Permission::DELETE)?;
        self.authorize(record, Permission::DELETE, ok)
    }

    /// Copy of `record` with the properties this principal may not read removed.
    pub fn filter_record(&self, record: &Record) -> SecurityResult<Record> {
        let hidden = self.filtered_properties(record)?;
        let mut out = record.clone();
        for name in &hidden {
            out.remove(name);
        }
        out.clear_dirty();
        Ok(out)
    }
}
