//! Sensor address resolution with bounded retry.
//!
//! Sensor endpoints become routable some time after the sensor is created,
//! so a missing address is retried with backoff before giving up.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::retry::RetryPolicy;

/// Default port sensors listen on.
pub const SENSOR_SERVICE_PORT: u16 = 9300;

/// Looks up the network address of a sensor service.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// `Ok(None)` when the service is unknown or has no address yet.
    async fn lookup(&self, name: &str) -> Result<Option<String>, TransportError>;
}

/// Registry backed by an in-process map. Addresses may be assigned later.
#[derive(Debug, Default)]
pub struct StaticServiceRegistry {
    services: RwLock<HashMap<String, Option<String>>>,
}

impl StaticServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `name` resolving to `address`.
    #[must_use]
    pub fn with_address(self, name: impl Into<String>, address: impl Into<String>) -> Self {
        self.assign(name, address);
        self
    }

    /// Registers `name` without an address.
    pub fn register_pending(&self, name: impl Into<String>) {
        if let Ok(mut services) = self.services.write() {
            services.entry(name.into()).or_insert(None);
        }
    }

    /// Assigns (or replaces) the address of `name`.
    pub fn assign(&self, name: impl Into<String>, address: impl Into<String>) {
        if let Ok(mut services) = self.services.write() {
            services.insert(name.into(), Some(address.into()));
        }
    }
}

#[async_trait]
impl ServiceRegistry for StaticServiceRegistry {
    async fn lookup(&self, name: &str) -> Result<Option<String>, TransportError> {
        let services = self
            .services
            .read()
            .map_err(|_| TransportError::ConnectionFailed {
                message: "service registry lock poisoned".to_string(),
            })?;
        Ok(services.get(name).cloned().flatten())
    }
}

/// Registry resolving `<name>.<namespace>.svc.cluster.local:<port>`.
#[derive(Debug, Clone)]
pub struct DnsServiceRegistry {
    namespace: String,
    port: u16,
    domain: String,
}

impl DnsServiceRegistry {
    #[must_use]
    pub fn new(namespace: impl Into<String>, port: u16) -> Self {
        Self {
            namespace: namespace.into(),
            port,
            domain: "svc.cluster.local".to_string(),
        }
    }

    /// Overrides the cluster domain suffix.
    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    #[must_use]
    pub fn host_for(&self, name: &str) -> String {
        format!("{name}.{}.{}:{}", self.namespace, self.domain, self.port)
    }
}

#[async_trait]
impl ServiceRegistry for DnsServiceRegistry {
    async fn lookup(&self, name: &str) -> Result<Option<String>, TransportError> {
        let host = self.host_for(name);
        let found = match tokio::net::lookup_host(host.as_str()).await {
            Ok(mut addrs) => addrs.next().is_some(),
            Err(e) => {
                debug!(service = %name, host = %host, error = %e, "service not resolvable yet");
                false
            }
        };
        Ok(found.then_some(host))
    }
}

/// Resolves sensor names to addresses, retrying while they are unassigned.
#[derive(Clone)]
pub struct SensorResolver {
    registry: Arc<dyn ServiceRegistry>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for SensorResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorResolver")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl SensorResolver {
    #[must_use]
    pub fn new(registry: Arc<dyn ServiceRegistry>, policy: RetryPolicy) -> Self {
        Self { registry, policy }
    }

    /// Resolves `name`, failing with `ResolutionTimeout` once the retry
    /// budget is spent.
    pub async fn resolve(&self, name: &str) -> Result<String, TransportError> {
        let attempts = self.policy.attempts();
        for attempt in 0..attempts {
            match self.registry.lookup(name).await {
                Ok(Some(address)) => {
                    debug!(service = %name, %address, attempt, "service resolved");
                    return Ok(address);
                }
                Ok(None) => {
                    debug!(service = %name, attempt, "service has no address yet");
                }
                Err(e) => {
                    warn!(service = %name, attempt, error = %e, "service lookup failed");
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(self.policy.delay_for(attempt)).await;
            }
        }

        warn!(service = %name, attempts, "service did not become resolvable");
        Err(TransportError::ResolutionTimeout {
            service: name.to_string(),
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn resolves_known_address() {
        let registry = Arc::new(StaticServiceRegistry::new().with_address("build", "127.0.0.1:9300"));
        let resolver = SensorResolver::new(registry, RetryPolicy::immediate(1));
        assert_eq!(resolver.resolve("build").await.unwrap(), "127.0.0.1:9300");
    }

    #[tokio::test]
    async fn never_assigned_times_out() {
        let registry = Arc::new(StaticServiceRegistry::new());
        registry.register_pending("build");
        let resolver = SensorResolver::new(registry, RetryPolicy::immediate(3));
        let err = resolver.resolve("build").await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::ResolutionTimeout { attempts: 3, ref service } if service == "build"
        ));
    }

    #[tokio::test]
    async fn address_assigned_during_backoff() {
        let registry = Arc::new(StaticServiceRegistry::new());
        registry.register_pending("build");
        let resolver = SensorResolver::new(
            registry.clone(),
            RetryPolicy {
                max_attempts: 50,
                initial_delay_ms: 5,
                max_delay_ms: 20,
                factor: 2.0,
            },
        );

        let assign = tokio::spawn({
            let registry = registry.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                registry.assign("build", "10.0.0.7:9300");
            }
        });

        assert_eq!(resolver.resolve("build").await.unwrap(), "10.0.0.7:9300");
        assign.await.unwrap();
    }

    #[test]
    fn dns_host_format() {
        let registry = DnsServiceRegistry::new("argo-events", SENSOR_SERVICE_PORT);
        assert_eq!(
            registry.host_for("build"),
            "build.argo-events.svc.cluster.local:9300"
        );
    }

    #[tokio::test]
    async fn dns_lookup_of_unknown_host_is_pending() {
        let registry = DnsServiceRegistry::new("ci", SENSOR_SERVICE_PORT).with_domain("invalid");
        assert_eq!(registry.lookup("build").await.unwrap(), None);
    }
}
