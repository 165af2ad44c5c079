//! sensorgate sensor
//!
//! Runs one sensor: the HTTP push endpoint, the stream transport and the
//! watch loop that reconciles with the store.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, Instrument};

use sensorgate::bridge::serve_push;
use sensorgate::observability::sensor_span;
use sensorgate::storage::InMemoryVersionedStore;
use sensorgate::{
    init_logging, ConfigError, DefaultTriggerExecutor, LogFormat, Reconciler, Sensor,
    SensorConfig, SensorRuntime, TriggerExecutor, VersionedStore,
};

#[derive(Debug, Parser)]
#[command(name = "sensorgate-sensor")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Sensor configuration file (.json, .yaml or .yml).
    #[arg(long, short, env = "SENSOR_CONFIG")]
    config: PathBuf,

    /// Override the push endpoint port.
    #[arg(long, short)]
    port: Option<u16>,

    /// Log output format.
    #[arg(long, env = "LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,
}

fn load_config(cli: &Cli) -> Result<SensorConfig, ConfigError> {
    let mut config = SensorConfig::from_file(&cli.config)?;
    config.apply_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let config = load_config(&cli)?;
    let span = sensor_span(&config.namespace, &config.name);
    run(config).instrument(span).await
}

async fn run(config: SensorConfig) -> Result<(), Box<dyn std::error::Error>> {
    let spec = config.spec.clone().ok_or_else(|| ConfigError::Invalid {
        reason: "an embedded store needs the sensor spec in the config file".to_string(),
    })?;
    let sensor = Sensor::new(config.name.clone(), config.namespace.clone(), spec);
    let key = sensor.key();

    let store = Arc::new(InMemoryVersionedStore::new());
    store.create(sensor)?;
    let reconciler = Reconciler::new(store, config.persistence);
    let executor: Arc<dyn TriggerExecutor> = Arc::new(DefaultTriggerExecutor::from_current()?);

    let runtime = Arc::new(
        tokio::task::spawn_blocking(move || SensorRuntime::start(key, reconciler, executor))
            .await??,
    );
    let watch = runtime.spawn_watch(config.watch_interval())?;

    let shutdown = runtime.shutdown_signal();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("received interrupt, shutting down");
        ctrl_c.trigger();
    });

    let push_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    let push_listener = TcpListener::bind(push_addr).await?;
    info!(addr = %push_addr, "push endpoint listening");
    let push = tokio::spawn(
        serve_push(push_listener, Arc::clone(&runtime), shutdown.clone()).in_current_span(),
    );

    #[cfg(feature = "transport-grpc")]
    let stream = {
        use sensorgate::bridge::RendezvousRegistry;
        use sensorgate::transport::{serve_stream, SensorUpdateService};

        let stream_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.stream_port));
        let listener = TcpListener::bind(stream_addr).await?;
        info!(addr = %stream_addr, "stream transport listening");
        let registry = Arc::new(RendezvousRegistry::new(config.handoff_timeout()));
        let service = SensorUpdateService::new(Arc::clone(&runtime), registry);
        tokio::spawn(serve_stream(listener, service, shutdown.clone()).in_current_span())
    };

    push.await??;
    #[cfg(feature = "transport-grpc")]
    stream.await??;

    tokio::task::spawn_blocking(move || watch.stop()).await?;
    info!(sensor = %runtime.key(), "sensor stopped");
    Ok(())
}
