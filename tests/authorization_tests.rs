//! Authorization integration tests: authentication, legacy bitmask checks, default roles,
//! tokens and restricted records, driven through SecurityService sessions.

use std::sync::Arc;
use std::time::Instant;

use rowsec::record::{MemoryRecordStore, Record, Value};
use rowsec::restricted::ALLOW_ALL_FIELD;
use rowsec::schema::{MemorySchema, RESTRICTED_CLASS, USER_CLASS};
use rowsec::security::PasswordHashing;
use rowsec::service::session::AUTH_FAILURE_DELAY;
use rowsec::user::AccountStatus;
use rowsec::{Permission, ResourceGeneric, SecurityConfig, SecurityResult, SecurityService};

// Cheap reversible hashing so the tests do not pay for argon2 on every user.
struct PlainHasher;

impl PasswordHashing for PlainHasher {
    fn hash(&self, password: &str) -> SecurityResult<String> { Ok(format!("plain:{}", password)) }
    fn verify(&self, hash: &str, password: &str) -> bool { hash == format!("plain:{}", password) }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter("rowsec=debug").try_init();
}

fn service() -> (Arc<SecurityService>, Arc<MemorySchema>) {
    init_tracing();
    let schema = Arc::new(MemorySchema::new());
    let svc = SecurityService::new(SecurityConfig::default(), schema.clone(), Arc::new(MemoryRecordStore::new()))
        .with_hasher(Arc::new(PlainHasher));
    let svc = Arc::new(svc);
    svc.bootstrap().unwrap();
    (svc, schema)
}

#[test]
fn principal_allow_is_or_across_roles() {
    let (svc, _) = service();
    svc.create_role("a", None).unwrap();
    svc.create_role("b", None).unwrap();
    svc.grant("a", ResourceGeneric::Class, None, Permission::READ).unwrap();
    svc.grant("b", ResourceGeneric::Class, Some("Invoice"), Permission::DELETE).unwrap();
    svc.create_user("carol", "pw", &["a", "b"]).unwrap();
    let s = svc.authenticate("carol", "pw").unwrap();
    assert!(s.check_security(ResourceGeneric::Class, Some("Invoice"), Permission::READ).is_ok());
    assert!(s.check_security(ResourceGeneric::Class, Some("Invoice"), Permission::DELETE).is_ok());
    assert!(s.check_security(ResourceGeneric::Class, Some("Other"), Permission::DELETE).is_err());
    let err = s.check_security(ResourceGeneric::Class, Some("Invoice"), Permission::UPDATE).unwrap_err();
    assert_eq!(
        err.to_string(),
        "User 'carol' does not have permission to execute the operation 'Update' against the resource: database.class.Invoice"
    );
}

#[test]
fn role_inheritance_delegates_to_parent() {
    let (svc, _) = service();
    svc.create_role("base", None).unwrap();
    svc.create_role("child", Some("base")).unwrap();
    svc.grant("base", ResourceGeneric::Schema, None, Permission::UPDATE).unwrap();
    svc.create_user("dan", "pw", &["child"]).unwrap();
    let s = svc.authenticate("dan", "pw").unwrap();
    assert!(s.is_allowed(ResourceGeneric::Schema, None, Permission::UPDATE).unwrap());
    assert!(!s.is_allowed(ResourceGeneric::Cluster, None, Permission::READ).unwrap());
    assert!(svc.set_role_parent("base", Some("child")).is_err());
}

#[test]
fn user_without_roles_is_denied() {
    let (svc, _) = service();
    svc.create_user("nobody", "pw", &[]).unwrap();
    let s = svc.authenticate("nobody", "pw").unwrap();
    let err = s.check_security(ResourceGeneric::Class, None, Permission::READ).unwrap_err();
    assert_eq!(err.to_string(), "User 'nobody' has no role defined");
}

#[test]
fn writer_creates_any_class_reader_cannot_create_users() {
    let (svc, schema) = service();
    schema.create_class("Widget", &[]).unwrap();

    let writer = svc.authenticate("writer", "writer").unwrap();
    let mut widget = Record::new("Widget").with_field("size", 3i64);
    writer.authorize_create(&mut widget).unwrap();
    assert!(writer.can_create(&widget).unwrap());

    let reader = svc.authenticate("reader", "reader").unwrap();
    let mut user = Record::new(USER_CLASS).with_field("name", "eve");
    let err = reader.authorize_create(&mut user).unwrap_err();
    assert!(err.is_access_denied());
    assert!(reader.check_security(ResourceGeneric::Class, Some(USER_CLASS), Permission::READ).is_err());
    assert!(reader.check_security(ResourceGeneric::Class, Some("Widget"), Permission::READ).is_ok());
}

#[test]
fn authentication_failures() {
    let (svc, _) = service();
    let err = svc.authenticate("admin", "wrong").unwrap_err();
    assert_eq!(err.to_string(), "User or password not valid for username: admin");
    assert!(svc.authenticate("ghost", "x").unwrap_err().is_access_denied());

    svc.set_user_status("writer", AccountStatus::Suspended).unwrap();
    let err = svc.authenticate("writer", "writer").unwrap_err();
    assert_eq!(err.to_string(), "User 'writer' is not active");
}

#[test]
fn failed_authentication_is_throttled() {
    let (svc, _) = service();
    let started = Instant::now();
    assert!(svc.authenticate("admin", "wrong").is_err());
    assert!(started.elapsed() >= AUTH_FAILURE_DELAY);

    let started = Instant::now();
    assert!(svc.authenticate_token("not-a-token").is_err());
    assert!(started.elapsed() >= AUTH_FAILURE_DELAY);
}

#[test]
fn token_lifecycle() {
    let (svc, _) = service();
    let s = svc.authenticate("reader", "reader").unwrap();
    let token = s.issue_token().unwrap();
    let again = svc.authenticate_token(&token).unwrap();
    assert_eq!(again.user_name().as_deref(), Some("reader"));
    assert!(svc.logout(&token));
    assert_eq!(svc.authenticate_token(&token).unwrap_err().to_string(), "Token not valid");

    let t2 = s.issue_token().unwrap();
    svc.drop_user("reader").unwrap();
    assert!(svc.authenticate_token(&t2).is_err());
}

#[test]
fn session_sees_grants_after_version_bump() {
    let (svc, _) = service();
    svc.create_role("ops", None).unwrap();
    svc.create_user("olga", "pw", &["ops"]).unwrap();
    let s = svc.authenticate("olga", "pw").unwrap();
    assert!(!s.is_allowed(ResourceGeneric::Server, None, Permission::READ).unwrap());
    svc.grant("ops", ResourceGeneric::Server, None, Permission::READ).unwrap();
    assert!(s.is_allowed(ResourceGeneric::Server, None, Permission::READ).unwrap());
}

#[test]
fn unfiltered_block_does_not_swallow_a_pending_refresh() {
    let (svc, _) = service();
    svc.create_role("ops", None).unwrap();
    svc.create_user("olga", "pw", &["ops"]).unwrap();
    let s = svc.authenticate("olga", "pw").unwrap();
    svc.grant("ops", ResourceGeneric::Class, None, Permission::READ).unwrap();

    let inside = s.run_unfiltered(|inner| inner.principal().unwrap());
    assert!(inside.is_none());
    assert!(s.check_security(ResourceGeneric::Class, Some("Any"), Permission::READ).is_ok());
}

#[test]
fn restricted_records_are_stamped_and_enforced() {
    let (svc, schema) = service();
    schema.create_class("Note", &[RESTRICTED_CLASS]).unwrap();
    svc.create_user("alice", "pw", &["writer"]).unwrap();
    svc.create_user("bob", "pw", &["writer"]).unwrap();

    let alice = svc.authenticate("alice", "pw").unwrap();
    let bob = svc.authenticate("bob", "pw").unwrap();
    let admin = svc.authenticate("admin", "admin").unwrap();

    let mut note = Record::new("Note").with_field("text", "mine");
    alice.authorize_create(&mut note).unwrap();
    let owner = alice.principal().unwrap().unwrap().identity().unwrap();
    assert_eq!(note.field(ALLOW_ALL_FIELD), Some(&Value::LinkSet(vec![owner])));

    alice.authorize_read(&note).unwrap();
    assert!(bob.authorize_read(&note).unwrap_err().is_access_denied());
    assert!(bob.authorize_delete(&note).is_err());
    admin.authorize_delete(&note).unwrap();
}

#[test]
fn restricted_identity_type_is_validated() {
    let (svc, schema) = service();
    schema.create_class("Ticket", &[RESTRICTED_CLASS]).unwrap();
    schema.set_custom("Ticket", "onCreate.identityType", "group").unwrap();
    let writer = svc.authenticate("writer", "writer").unwrap();
    let err = writer.authorize_create(&mut Record::new("Ticket")).unwrap_err();
    assert!(err.to_string().contains("Supported values are: 'user', 'role'"));
}

#[test]
fn server_account_from_resource_list() {
    let (svc, _) = service();
    let s = svc.server_session("backup", "database.class.Doc, server").unwrap();
    assert!(s.check_security(ResourceGeneric::Server, None, Permission::ALL).is_ok());
    assert!(s.check_security(ResourceGeneric::Class, Some("Doc"), Permission::DELETE).is_ok());
    assert!(s.check_security(ResourceGeneric::Class, Some("Other"), Permission::READ).is_err());
    let root = svc.server_session("root", "*").unwrap();
    assert!(root.check_security(ResourceGeneric::BypassRestricted, None, Permission::READ).is_ok());
}

#[test]
fn argon2_backed_open() {
    init_tracing();
    let svc = SecurityService::open(
        SecurityConfig { create_default_users: true, ..Default::default() },
        Arc::new(MemorySchema::new()),
        Arc::new(MemoryRecordStore::new()),
    )
    .unwrap();
    let s = svc.authenticate("admin", "admin").unwrap();
    assert!(s.check_security(ResourceGeneric::Database, None, Permission::ALL).is_ok());
    let hash = svc.read_catalog(|c| c.user_by_name("admin").unwrap().password_hash().to_string());
    assert!(hash.starts_with("$argon2"));
}
