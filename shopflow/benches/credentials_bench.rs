//! Benchmarks for credential-set serialization and output-tail capture.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use shopflow::credentials::CredentialSet;
use shopflow::pipeline::LineTail;

fn credential_payload(tenants: usize) -> Vec<u8> {
    let records: Vec<serde_json::Value> = (0..tenants)
        .map(|i| {
            serde_json::json!({
                "tenant_id": format!("tenant-{i}"),
                "client_id": format!("client-{i}"),
                "client_secret": "s3cret",
                "refresh_token": format!("refresh-{i}"),
                "access_token": format!("access-{i}"),
                "expires_at": "2026-03-01T00:00:00Z",
                "shop_domain": format!("shop-{i}.example.test"),
            })
        })
        .collect();
    serde_json::to_vec(&records).unwrap_or_default()
}

fn credentials_benchmark(c: &mut Criterion) {
    let payload = credential_payload(200);

    c.bench_function("credential_set_from_bytes_200", |b| {
        b.iter(|| CredentialSet::from_bytes(black_box(&payload)))
    });

    c.bench_function("credential_set_to_bytes_200", |b| {
        b.iter_batched(
            || CredentialSet::from_bytes(&payload),
            |set| set.map(|s| s.to_bytes()),
            BatchSize::SmallInput,
        )
    });
}

fn tail_benchmark(c: &mut Criterion) {
    c.bench_function("line_tail_push_10k", |b| {
        b.iter(|| {
            let mut tail = LineTail::new(50);
            for i in 0..10_000 {
                tail.push(format!("line {i}"));
            }
            black_box(tail.to_vec())
        })
    });
}

criterion_group!(benches, credentials_benchmark, tail_benchmark);
criterion_main!(benches);
