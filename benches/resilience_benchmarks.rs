//! Resilience hot-path benchmarks
//!
//! Every protected call pays for an admission check and an outcome record;
//! every job submission pays for key derivation.

use campus_core::clock::system_clock;
use campus_core::jobs::{derive_job_key, JobType};
use campus_core::policy::PolicyRegistry;
use campus_core::resilience::{
    CircuitBreakers, CircuitMetricsCollector, CircuitStateStore, Feature, InMemoryCircuitStore,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use std::sync::Arc;

fn breakers() -> (CircuitBreakers, Arc<InMemoryCircuitStore>) {
    let policies = Arc::new(PolicyRegistry::defaults());
    let metrics = Arc::new(CircuitMetricsCollector::new());
    let store = Arc::new(InMemoryCircuitStore::new(
        policies.clone(),
        system_clock(),
        metrics.clone(),
    ));
    (
        CircuitBreakers::new(policies, store.clone(), metrics),
        store,
    )
}

fn benchmark_can_execute(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let (_, store) = breakers();

    c.bench_function("store_can_execute_closed", |b| {
        b.iter(|| runtime.block_on(store.can_execute(black_box(Feature::AiInsights))))
    });
}

fn benchmark_breaker_execute(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let (breakers, _) = breakers();
    let closed = breakers.breaker(Feature::AnalyticsEngine);
    let open = breakers.breaker(Feature::DocumentExport);
    runtime.block_on(open.force_open());

    c.bench_function("breaker_execute_closed", |b| {
        b.iter(|| {
            runtime.block_on(closed.execute(|| async { Ok::<_, String>(black_box(42)) }))
        })
    });

    c.bench_function("breaker_execute_open_fallback", |b| {
        b.iter(|| {
            runtime.block_on(open.execute(|| async { Ok::<_, String>(black_box(42)) }))
        })
    });
}

fn benchmark_job_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("derive_job_key");
    for students in [1usize, 32] {
        let params = json!({
            "student_ids": (0..students).map(|i| format!("s-{i}")).collect::<Vec<_>>(),
            "term": "2026-T1",
        });
        group.bench_with_input(BenchmarkId::from_parameter(students), &params, |b, params| {
            b.iter(|| derive_job_key(JobType::AiInsight, black_box("tenant-1"), params))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    benchmark_can_execute,
    benchmark_breaker_execute,
    benchmark_job_key
);
criterion_main!(benches);
