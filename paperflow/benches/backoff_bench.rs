//! Benchmarks for backoff computation and fingerprint hashing.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use paperflow::core::RetryPolicy;
use paperflow::idempotency::StageFingerprint;
use paperflow::resilience::backoff;

fn backoff_benchmark(c: &mut Criterion) {
    let policy = RetryPolicy::new("inference", 5, 2_000);

    c.bench_function("retry_delay", |b| {
        b.iter(|| {
            for n in 0..5 {
                black_box(backoff::retry_delay(&policy, black_box(n)));
            }
        })
    });

    c.bench_function("fingerprint_hash", |b| {
        let fingerprint = StageFingerprint::new("doc-1", "cafe01", 4_096)
            .with_upstream(
                "classification",
                serde_json::json!({"doc_type": "parts_catalog", "confidence": 0.93}),
            )
            .with_upstream("text_extraction", serde_json::json!({"pages": 120}));

        b.iter(|| black_box(fingerprint.hash()))
    });
}

criterion_group!(benches, backoff_benchmark);
criterion_main!(benches);
