use criterion::{Criterion, criterion_group, criterion_main};
use futures_util::future::BoxFuture;
use saga::{BoxError, SagaCoordinator};
use stores::{
    InMemoryMetadataStore, InMemorySession, InMemoryTimeSeriesStore, InMemoryTransactionLog,
    Payload,
};

fn make_payload(rows: usize) -> Payload {
    Payload::new(
        (0..rows)
            .map(|minute| serde_json::json!({ "symbol": "600000.SH", "minute": minute, "close": 7.23 }))
            .collect(),
    )
}

fn record_sync(session: &mut InMemorySession) -> BoxFuture<'_, Result<(), BoxError>> {
    Box::pin(async move {
        session
            .upsert("sync_state", "600000.SH", serde_json::json!({ "last": "20240101" }))
            .await?;
        Ok::<(), BoxError>(())
    })
}

fn reject(_session: &mut InMemorySession) -> BoxFuture<'_, Result<(), BoxError>> {
    Box::pin(async { Err::<(), BoxError>("rejected".into()) })
}

fn coordinator()
-> SagaCoordinator<InMemoryTimeSeriesStore, InMemoryMetadataStore, InMemoryTransactionLog> {
    let log = InMemoryTransactionLog::new();
    SagaCoordinator::new(
        InMemoryTimeSeriesStore::new(),
        InMemoryMetadataStore::new(log.clone()),
        log,
    )
}

fn bench_commit_path(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("saga/execute_sync_commit_240_rows", |b| {
        b.iter(|| {
            rt.block_on(async {
                let coordinator = coordinator();
                let ok = coordinator
                    .execute_sync("600000.SH", make_payload(240), "minute_kline", record_sync)
                    .await;
                assert!(ok);
            });
        });
    });
}

fn bench_compensation_path(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("saga/execute_sync_compensate_240_rows", |b| {
        b.iter(|| {
            rt.block_on(async {
                let coordinator = coordinator();
                let ok = coordinator
                    .execute_sync("600000.SH", make_payload(240), "minute_kline", reject)
                    .await;
                assert!(!ok);
            });
        });
    });
}

criterion_group!(benches, bench_commit_path, bench_compensation_path);
criterion_main!(benches);
