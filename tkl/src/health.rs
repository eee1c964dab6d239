//! Liveness checking for running containers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::Container;
use libruntime::ContainerRuntime;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Runs the container's liveness probe. `pod_ip` is the sandbox
    /// address for http probes; `container_id` the runtime id for exec
    /// probes.
    async fn health_check(
        &self,
        container_id: &str,
        pod_ip: &str,
        container: &Container,
    ) -> anyhow::Result<HealthStatus>;
}

/// Probes over HTTP or by exec-ing inside the container.
pub struct ProbeHealthChecker {
    runtime: Arc<dyn ContainerRuntime>,
    http: reqwest::Client,
}

impl ProbeHealthChecker {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        ProbeHealthChecker {
            runtime,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl HealthChecker for ProbeHealthChecker {
    async fn health_check(
        &self,
        container_id: &str,
        pod_ip: &str,
        container: &Container,
    ) -> anyhow::Result<HealthStatus> {
        let Some(probe) = &container.liveness_probe else {
            return Ok(HealthStatus::Healthy);
        };

        if let Some(http_get) = &probe.http_get {
            let host = if !http_get.host.is_empty() {
                http_get.host.as_str()
            } else if !pod_ip.is_empty() {
                pod_ip
            } else {
                return Ok(HealthStatus::Unknown);
            };
            let url = format!("http://{}:{}{}", host, http_get.port, http_get.path);
            debug!(container = %container.name, url = %url, "http liveness probe");
            return match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => Ok(HealthStatus::Healthy),
                Ok(_) => Ok(HealthStatus::Unhealthy),
                Err(_) => Ok(HealthStatus::Unhealthy),
            };
        }

        if let Some(exec) = &probe.exec {
            debug!(container = %container.name, "exec liveness probe");
            return match self.runtime.exec(container_id, &exec.command).await {
                Ok(_) => Ok(HealthStatus::Healthy),
                Err(_) => Ok(HealthStatus::Unhealthy),
            };
        }

        Ok(HealthStatus::Unknown)
    }
}

/// Reports everything healthy. Used where no checker is configured.
pub struct AlwaysHealthy;

#[async_trait]
impl HealthChecker for AlwaysHealthy {
    async fn health_check(
        &self,
        _container_id: &str,
        _pod_ip: &str,
        _container: &Container,
    ) -> anyhow::Result<HealthStatus> {
        Ok(HealthStatus::Healthy)
    }
}
