use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;

use sensorgate::bridge::serve_push;
use sensorgate::gateway::{serve_gateway, StaticServiceRegistry, TransformerConfig};
use sensorgate::sensor::{SignalSpec, TriggerContext, TriggerError};
use sensorgate::{
    DispatchReport, EventDispatcher, EventTransformer, Gateway, InMemoryVersionedStore, NodePhase,
    Reconciler, RetryPolicy, Sensor, SensorKey, SensorResolver, SensorRuntime, SensorSpec,
    Shutdown, TriggerExecutor, TriggerSpec, TriggerTemplate, VersionedStore,
};

#[derive(Default)]
struct Recorder {
    contexts: Mutex<Vec<TriggerContext>>,
}

impl TriggerExecutor for Recorder {
    fn execute(&self, _trigger: &TriggerSpec, ctx: &TriggerContext) -> Result<(), TriggerError> {
        self.contexts.lock().unwrap().push(ctx.clone());
        Ok(())
    }
}

/// Starts a sensor waiting on the `webhook` signal and returns its push address.
async fn sensor(name: &str, recorder: Arc<Recorder>) -> (SocketAddr, Arc<SensorRuntime>) {
    let store = Arc::new(InMemoryVersionedStore::new());
    let spec = SensorSpec {
        signals: vec![SignalSpec::new("webhook")],
        triggers: vec![TriggerSpec::new("run", TriggerTemplate::Log { message: None })],
        repeat: false,
    };
    store.create(Sensor::new(name, "ci", spec)).unwrap();
    let runtime = Arc::new(
        SensorRuntime::start(
            SensorKey::new("ci", name),
            Reconciler::new(store, RetryPolicy::immediate(3)),
            recorder,
        )
        .unwrap(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_push(listener, Arc::clone(&runtime), runtime.shutdown_signal()));
    (addr, runtime)
}

async fn gateway(registry: Arc<StaticServiceRegistry>, targets: &[&str], policy: RetryPolicy) -> String {
    let gateway = Gateway::new(
        "webhook-gateway",
        EventTransformer::new(TransformerConfig {
            source: "webhook".to_string(),
            event_type: "push".to_string(),
            event_type_version: "v1".to_string(),
        }),
        EventDispatcher::new(
            reqwest::Client::new(),
            SensorResolver::new(registry, policy),
            targets.iter().map(|t| (*t).to_string()).collect(),
        ),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_gateway(listener, gateway, Shutdown::new()));
    format!("http://{addr}/hooks/github")
}

#[tokio::test(flavor = "multi_thread")]
async fn request_reaches_sensor_and_fires_trigger() {
    let recorder = Arc::new(Recorder::default());
    let (addr, runtime) = sensor("build", Arc::clone(&recorder)).await;
    let registry = Arc::new(StaticServiceRegistry::new().with_address("build", addr.to_string()));
    let url = gateway(registry, &["build"], RetryPolicy::immediate(1)).await;

    let response = reqwest::Client::new()
        .post(&url)
        .header("content-type", "application/json")
        .body(r#"{"ref":"refs/heads/main"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let report: serde_json::Value = response.json().await.unwrap();
    assert_eq!(report["delivered"], serde_json::json!(["build"]));

    let sensor = runtime.snapshot().unwrap();
    assert_eq!(sensor.status.phase, NodePhase::Complete);

    let contexts = recorder.contexts.lock().unwrap();
    assert_eq!(contexts.len(), 1);
    let event = &contexts[0].events["webhook"];
    assert_eq!(event.context.event_type, "push");
    assert_eq!(event.context.content_type, "application/json");
    assert_eq!(event.payload, br#"{"ref":"refs/heads/main"}"#.to_vec());
}

#[tokio::test(flavor = "multi_thread")]
async fn one_failed_target_does_not_block_others() {
    let recorder = Arc::new(Recorder::default());
    let (addr, _runtime) = sensor("build", Arc::clone(&recorder)).await;
    let registry = Arc::new(StaticServiceRegistry::new().with_address("build", addr.to_string()));
    registry.register_pending("deploy");
    let url = gateway(registry, &["build", "deploy"], RetryPolicy::immediate(2)).await;

    let response = reqwest::Client::new()
        .post(&url)
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 502);
    let report: serde_json::Value = response.json().await.unwrap();
    assert_eq!(report["delivered"], serde_json::json!(["build"]));
    assert_eq!(report["failed"][0]["target"], "deploy");
    assert_eq!(recorder.contexts.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn dispatcher_waits_for_late_address() {
    let recorder = Arc::new(Recorder::default());
    let (addr, runtime) = sensor("late", Arc::clone(&recorder)).await;
    let registry = Arc::new(StaticServiceRegistry::new());
    registry.register_pending("late");

    let assign = Arc::clone(&registry);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assign.assign("late", addr.to_string());
    });

    let dispatcher = EventDispatcher::new(
        reqwest::Client::new(),
        SensorResolver::new(
            registry,
            RetryPolicy {
                max_attempts: 20,
                initial_delay_ms: 20,
                max_delay_ms: 50,
                factor: 1.5,
            },
        ),
        vec!["late".to_string()],
    );
    let event = EventTransformer::new(TransformerConfig {
        source: "webhook".to_string(),
        event_type: "push".to_string(),
        event_type_version: String::new(),
    })
    .transform(&axum::http::HeaderMap::new(), b"{}".to_vec());

    let report: DispatchReport = dispatcher.dispatch(&event).await;
    assert!(report.is_success());
    assert_eq!(report.event_id, event.id());
    assert_eq!(runtime.snapshot().unwrap().status.phase, NodePhase::Complete);
}
