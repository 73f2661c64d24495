use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::Arc;

use rowsec::record::{MemoryRecordStore, Record, RecordId};
use rowsec::schema::MemorySchema;
use rowsec::security::PasswordHashing;
use rowsec::{Scope, SecurityConfig, SecurityResult, SecurityService, SecuritySession};

struct PlainHasher;

impl PasswordHashing for PlainHasher {
    fn hash(&self, password: &str) -> SecurityResult<String> { Ok(password.to_string()) }
    fn verify(&self, hash: &str, password: &str) -> bool { hash == password }
}

fn setup(classes: usize) -> (Arc<SecurityService>, SecuritySession, SecuritySession) {
    let schema = Arc::new(MemorySchema::new());
    for i in 0..classes {
        schema.create_class(&format!("C{}", i), &[]).unwrap();
        schema.add_property(&format!("C{}", i), "n").unwrap();
    }
    let svc = Arc::new(
        SecurityService::new(SecurityConfig::default(), schema, Arc::new(MemoryRecordStore::new())).with_hasher(Arc::new(PlainHasher)),
    );
    svc.bootstrap().unwrap();
    svc.create_security_policy("small").unwrap();
    svc.set_policy_rule("small", Scope::Read, Some("n < 500 AND @class <> 'Other'")).unwrap();
    for i in 0..classes {
        svc.set_security_policy("reader", &format!("database.class.C{}.n", i), "small").unwrap();
        svc.set_security_policy("reader", &format!("database.class.C{}", i), "small").unwrap();
    }
    svc.increment_version().unwrap();
    let writer = svc.authenticate("writer", "writer").unwrap();
    let reader = svc.authenticate("reader", "reader").unwrap();
    (svc, writer, reader)
}

fn records(classes: usize, n: usize, seed: u64) -> Vec<Record> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            Record::new(format!("C{}", rng.gen_range(0..classes)))
                .with_id(RecordId::new(50, i as i64))
                .with_field("n", rng.gen_range(0..1000i64))
        })
        .collect()
}

fn bench_gates(c: &mut Criterion) {
    let classes = 32usize;
    let (_svc, writer, reader) = setup(classes);
    let recs = records(classes, 1_000, 0xC0FFEE);

    let mut group = c.benchmark_group("gates");
    group.sample_size(30);
    group.throughput(Throughput::Elements(recs.len() as u64));

    group.bench_with_input(BenchmarkId::new("can_read_fast_path", recs.len()), &recs, |b, recs| {
        b.iter(|| {
            let allowed = recs.iter().filter(|r| writer.can_read(r).unwrap()).count();
            criterion::black_box(allowed);
        });
    });

    group.bench_with_input(BenchmarkId::new("can_read_predicate", recs.len()), &recs, |b, recs| {
        b.iter(|| {
            let allowed = recs.iter().filter(|r| reader.can_read(r).unwrap()).count();
            criterion::black_box(allowed);
        });
    });

    group.bench_with_input(BenchmarkId::new("filtered_properties", recs.len()), &recs, |b, recs| {
        b.iter(|| {
            let hidden: usize = recs.iter().map(|r| reader.filtered_properties(r).unwrap().len()).sum();
            criterion::black_box(hidden);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_gates);
criterion_main!(benches);
