//! Concurrency: gate calls from many threads while the security version is bumped and
//! policies are rebound to the same resources.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use rand::{rngs::StdRng, Rng, SeedableRng};
use rowsec::record::{MemoryRecordStore, Record, RecordId};
use rowsec::schema::MemorySchema;
use rowsec::security::PasswordHashing;
use rowsec::{Scope, SecurityConfig, SecurityResult, SecurityService};

struct PlainHasher;

impl PasswordHashing for PlainHasher {
    fn hash(&self, password: &str) -> SecurityResult<String> { Ok(format!("plain:{}", password)) }
    fn verify(&self, hash: &str, password: &str) -> bool { hash == format!("plain:{}", password) }
}

const CLASSES: usize = 16;

fn setup() -> Arc<SecurityService> {
    let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter("rowsec=info").try_init();
    let schema = Arc::new(MemorySchema::new());
    for i in 0..CLASSES {
        schema.create_class(&format!("C{}", i), &[]).unwrap();
    }
    let svc = SecurityService::new(SecurityConfig::default(), schema, Arc::new(MemoryRecordStore::new()))
        .with_hasher(Arc::new(PlainHasher));
    let svc = Arc::new(svc);
    svc.bootstrap().unwrap();
    svc.create_security_policy("even").unwrap();
    svc.set_policy_rule("even", Scope::Read, Some("n < 50")).unwrap();
    for i in (0..CLASSES).step_by(2) {
        svc.set_security_policy("reader", &format!("database.class.C{}", i), "even").unwrap();
    }
    svc
}

#[test]
fn read_gates_survive_version_bumps() {
    let svc = setup();
    let stop = Arc::new(AtomicBool::new(false));
    let mut readers = Vec::new();
    for t in 0..8u64 {
        let svc = svc.clone();
        let stop = stop.clone();
        readers.push(thread::spawn(move || {
            let session = svc.authenticate("reader", "reader").unwrap();
            let mut rng = StdRng::seed_from_u64(t);
            let mut checks = 0usize;
            while !stop.load(Ordering::Relaxed) || checks < 200 {
                let class = rng.gen_range(0..CLASSES);
                let n: i64 = rng.gen_range(0..100);
                let rec = Record::new(format!("C{}", class)).with_id(RecordId::new(30, checks as i64)).with_field("n", n);
                let allowed = session.can_read(&rec).unwrap();
                if class % 2 == 1 {
                    assert!(allowed, "odd classes are unrestricted");
                } else {
                    assert_eq!(allowed, n < 50);
                }
                checks += 1;
            }
            checks
        }));
    }

    for _ in 0..25 {
        svc.increment_version().unwrap();
        svc.set_security_policy("reader", "database.class.C0", "even").unwrap();
    }
    stop.store(true, Ordering::Relaxed);

    let total: usize = readers.into_iter().map(|h| h.join().unwrap()).sum();
    assert!(total >= 8 * 200);
    assert!(svc.optimization_index().unwrap().is_restricted("reader", "C0"));
}

#[test]
fn close_clears_service_caches() {
    let svc = setup();
    let session = svc.authenticate("reader", "reader").unwrap();
    let rec = Record::new("C2").with_id(RecordId::new(30, 1)).with_field("n", 10i64);
    assert!(session.can_read(&rec).unwrap());
    assert!(svc.engine().resolved_len() > 0);
    svc.close();
    assert_eq!(svc.engine().resolved_len(), 0);
    assert!(svc.optimization_index().is_none());
    assert!(svc.resolver().is_empty());
    // gates still answer with the index gone
    assert!(session.can_read(&rec).unwrap());
}
