//! # Session Benchmarks
//!
//! Performance benchmarks for warden-core session operations.
//!
//! Run with: `cargo bench -p warden-core`

use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use warden_core::{
    Cascade, EntityId, FieldValue, MemoryPersistence, ModelDef, RelationDef, RelationSpec,
    SessionId, Workspace, fields,
};

/// A workspace holding one list with `size` loaded tasks.
fn create_list(size: usize) -> (Workspace, EntityId, Vec<EntityId>) {
    let mut ws = Workspace::new(Arc::new(MemoryPersistence::new()));
    ws.define_model(ModelDef::new("list").relation("tasks", RelationDef::has_many("task", "list_id")))
        .expect("list");
    ws.define_model(
        ModelDef::new("task")
            .fields(["name", "list_id"])
            .relation("list", RelationDef::belongs_to("list", "list_id")),
    )
    .expect("task");

    let list = ws.load("list", fields([("id", 0_i64)])).expect("list");
    let tasks = (0..size as i64)
        .map(|n| {
            ws.load(
                "task",
                fields([
                    ("id", FieldValue::Int(n + 1)),
                    ("name", FieldValue::text(format!("task {n}"))),
                    ("list_id", FieldValue::Int(0)),
                ]),
            )
            .expect("task")
        })
        .collect();
    (ws, list, tasks)
}

/// The same list, watched and with every task renamed.
fn create_edited(size: usize) -> (Workspace, SessionId, Vec<EntityId>) {
    let (mut ws, list, tasks) = create_list(size);
    let session = ws.open_session();
    ws.scope(session)
        .expect("scope")
        .watch(list, &RelationSpec::of(["tasks"]))
        .expect("watch");
    for task in &tasks {
        ws.set_field(*task, "name", "edited").expect("edit");
    }
    (ws, session, tasks)
}

fn bench_watch(c: &mut Criterion) {
    let mut group = c.benchmark_group("watch");

    for size in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter_batched(
                || create_list(size),
                |(mut ws, list, _)| {
                    let session = ws.open_session();
                    ws.scope(session)
                        .expect("scope")
                        .watch(list, &RelationSpec::of(["tasks"]))
                        .expect("watch");
                    black_box(ws)
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_discard(c: &mut Criterion) {
    let mut group = c.benchmark_group("discard");

    for size in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter_batched(
                || create_edited(size),
                |(mut ws, session, _)| {
                    ws.scope(session).expect("scope").discard().expect("discard");
                    black_box(ws)
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("flush");
    let runtime = tokio::runtime::Runtime::new().expect("runtime");

    for size in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.to_async(&runtime).iter_batched(
                || {
                    let (mut ws, session, tasks) = create_edited(size);
                    let mut scope = ws.scope(session).expect("scope");
                    for task in &tasks {
                        scope.save_model(*task, Cascade::LOCAL).expect("mark");
                    }
                    (ws, session)
                },
                |(mut ws, session)| async move {
                    let report = ws.scope(session).expect("scope").save(false).await;
                    black_box(report.expect("flush"))
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_watch, bench_discard, bench_flush);

criterion_main!(benches);
