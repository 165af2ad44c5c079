//! sensorgate gateway
//!
//! Accepts inbound requests, turns each one into an event and delivers it to
//! every configured target sensor.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, Instrument};

use sensorgate::gateway::{serve_gateway, DnsServiceRegistry, StaticServiceRegistry};
use sensorgate::observability::gateway_span;
use sensorgate::{
    init_logging, ConfigError, EventDispatcher, EventTransformer, Gateway, GatewayConfig,
    LogFormat, SensorResolver, ServiceRegistry, Shutdown,
};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "sensorgate-gateway")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Gateway configuration file (.json, .yaml or .yml).
    #[arg(long, short, env = "GATEWAY_CONFIG")]
    config: PathBuf,

    /// Additional target sensor (repeatable).
    #[arg(long = "target", short)]
    targets: Vec<String>,

    /// Log output format.
    #[arg(long, env = "LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,
}

fn load_config(cli: &Cli) -> Result<GatewayConfig, ConfigError> {
    let mut config = GatewayConfig::from_file(&cli.config)?;
    config.apply_env()?;
    for target in &cli.targets {
        if !config.targets.contains(target) {
            config.targets.push(target.clone());
        }
    }
    config.validate()?;
    Ok(config)
}

fn registry(config: &GatewayConfig) -> Arc<dyn ServiceRegistry> {
    if config.addresses.is_empty() {
        return Arc::new(DnsServiceRegistry::new(
            config.namespace.clone(),
            config.sensor_port,
        ));
    }
    let registry = config
        .addresses
        .iter()
        .fold(StaticServiceRegistry::new(), |registry, (name, address)| {
            registry.with_address(name.clone(), address.clone())
        });
    Arc::new(registry)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let config = load_config(&cli)?;
    let span = gateway_span(&config.namespace, &config.name);
    run(config).instrument(span).await
}

async fn run(config: GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
    let client = reqwest::Client::builder()
        .timeout(DELIVERY_TIMEOUT)
        .build()?;
    let dispatcher = EventDispatcher::new(
        client,
        SensorResolver::new(registry(&config), config.resolver),
        config.targets.clone(),
    );
    let gateway = Gateway::new(
        config.name.clone(),
        EventTransformer::new(config.transformer()),
        dispatcher,
    );

    let shutdown = Shutdown::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("received interrupt, shutting down");
        ctrl_c.trigger();
    });

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, targets = ?config.targets, "gateway listening");
    serve_gateway(listener, gateway, shutdown).await?;

    info!("gateway stopped");
    Ok(())
}
