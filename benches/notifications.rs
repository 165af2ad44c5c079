use std::sync::Arc;
use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use sensorgate::sensor::{NodeId, SignalSpec, TriggerContext, TriggerError};
use sensorgate::{
    Event, EventContext, InMemoryVersionedStore, Reconciler, RetryPolicy, Sensor, SensorKey,
    SensorRuntime, SensorSpec, TriggerExecutor, TriggerSpec, TriggerTemplate, VersionedStore,
};

struct Noop;

impl TriggerExecutor for Noop {
    fn execute(&self, _: &TriggerSpec, _: &TriggerContext) -> Result<(), TriggerError> {
        Ok(())
    }
}

fn runtime(signals: &[&str]) -> SensorRuntime {
    let store = Arc::new(InMemoryVersionedStore::new());
    let spec = SensorSpec {
        signals: signals.iter().map(|s| SignalSpec::new(*s)).collect(),
        triggers: vec![TriggerSpec::new("run", TriggerTemplate::Log { message: None })],
        repeat: true,
    };
    store.create(Sensor::new("bench", "default", spec)).unwrap();
    SensorRuntime::start(
        SensorKey::new("default", "bench"),
        Reconciler::new(store, RetryPolicy::immediate(1)),
        Arc::new(Noop),
    )
    .unwrap()
}

fn event(source: &str) -> Event {
    Event::new(
        EventContext::new(source, "push", "v1", "application/json"),
        br#"{"ref":"refs/heads/main","commits":[1,2,3]}"#.to_vec(),
    )
}

fn bench_full_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("notifications");
    group.throughput(Throughput::Elements(1));
    group.bench_function("single_signal_cycle", |b| {
        // Fresh sensor per sample so store versions do not accumulate.
        b.iter_custom(|iters| {
            let rt = runtime(&["webhook"]);
            let e = event("webhook");
            let start = Instant::now();
            for _ in 0..iters {
                let _ = rt.handle_notification(e.clone()).unwrap();
            }
            start.elapsed()
        });
    });
    group.bench_function("duplicate_dropped", |b| {
        b.iter_custom(|iters| {
            let rt = runtime(&["a", "b"]);
            rt.handle_notification(event("a")).unwrap();
            let e = event("a");
            let start = Instant::now();
            for _ in 0..iters {
                let _ = rt.handle_notification(e.clone()).unwrap();
            }
            start.elapsed()
        });
    });
    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let json = serde_json::to_vec(&event("webhook")).unwrap();
    c.bench_function("event/decode_json", |b| {
        b.iter(|| serde_json::from_slice::<Event>(black_box(&json)).unwrap());
    });
    c.bench_function("node_id/derive", |b| {
        b.iter(|| NodeId::derive(black_box("bench"), black_box("webhook")));
    });
}

criterion_group!(benches, bench_full_cycle, bench_codec);
criterion_main!(benches);
