use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use psu_crypto::hashing::{content_hash, key_to_node_id};
use psu_crypto::{init, sign_bytes, verify_signature, NodeIdentity};

fn bench_identity(c: &mut Criterion) {
    init().unwrap();
    c.bench_function("identity/from_seed", |b| {
        b.iter(|| NodeIdentity::from_seed(black_box(&[42u8; 32])).unwrap());
    });
    c.bench_function("identity/dht_key", |b| {
        b.iter(|| key_to_node_id(black_box("peer:alice")));
    });
}

fn bench_signatures(c: &mut Criterion) {
    init().unwrap();
    let identity = NodeIdentity::from_seed(&[7u8; 32]).unwrap();
    let public_key = identity.public_key_bytes();

    let mut group = c.benchmark_group("signature");
    for size in [128usize, 4 * 1024, 64 * 1024] {
        let envelope = vec![0xA5u8; size];
        let signature = sign_bytes(&identity, &envelope);
        group.bench_with_input(BenchmarkId::new("sign", size), &envelope, |b, bytes| {
            b.iter(|| sign_bytes(&identity, black_box(bytes)));
        });
        group.bench_with_input(BenchmarkId::new("verify", size), &envelope, |b, bytes| {
            b.iter(|| verify_signature(&public_key, black_box(bytes), &signature).is_ok());
        });
    }
    group.finish();
}

fn bench_content_hash(c: &mut Criterion) {
    let chunk = vec![0x5Au8; 64 * 1024];
    c.bench_function("content_hash/64KiB", |b| {
        b.iter(|| content_hash(black_box(&chunk)));
    });
}

criterion_group!(benches, bench_identity, bench_signatures, bench_content_hash);
criterion_main!(benches);
