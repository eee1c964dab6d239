//! HTTP clients for the external registry (pods, minions, bindings) and
//! for node agents. These implement the seams the scheduler and the pod
//! cache consume.

use std::time::Duration;

use async_trait::async_trait;
use common::{Binding, Minion, MinionList, Pod, PodInfo, PodPhase};
use libscheduler::{Binder, FailureHandler, MinionLister, PodLister, PodSource, StatusUpdater};
use log::{debug, warn};
use serde::Deserialize;

use crate::cache::{IpGetter, MinionGetter, PodInfoGetter, PodRegistry};

#[derive(Debug, Deserialize, Default)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

/// Client for the cluster registry's REST surface.
pub struct RegistryClient {
    base: String,
    http: reqwest::Client,
    /// Delay between polls while waiting for a pending pod.
    pending_poll_interval: Duration,
}

impl RegistryClient {
    pub fn new(endpoint: &str) -> Self {
        RegistryClient {
            base: endpoint.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            pending_poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_pending_poll_interval(mut self, interval: Duration) -> Self {
        self.pending_poll_interval = interval;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get_json<R: serde::de::DeserializeOwned>(&self, path: &str) -> anyhow::Result<R> {
        let resp = self.http.get(self.url(path)).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("registry returned {} for {}", resp.status(), path);
        }
        Ok(resp.json().await?)
    }

    async fn all_pods(&self) -> anyhow::Result<Vec<Pod>> {
        let list: PodList = self.get_json("/api/pods").await?;
        Ok(list.items)
    }

    /// Stores the pod back (status included), requeueing it for another
    /// scheduling attempt.
    async fn store_pod(&self, pod: &Pod) -> anyhow::Result<()> {
        let path = format!(
            "/api/pods/{}/{}",
            pod.metadata.namespace, pod.metadata.name
        );
        let resp = self.http.put(self.url(&path)).json(pod).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("registry returned {} storing pod", resp.status());
        }
        Ok(())
    }
}

#[async_trait]
impl MinionLister for RegistryClient {
    async fn list(&self) -> anyhow::Result<MinionList> {
        self.get_json("/api/minions").await
    }
}

#[async_trait]
impl PodLister for RegistryClient {
    async fn list_pods(&self) -> anyhow::Result<Vec<Pod>> {
        self.all_pods().await
    }
}

#[async_trait]
impl Binder for RegistryClient {
    async fn bind(&self, binding: &Binding) -> anyhow::Result<()> {
        let resp = self
            .http
            .post(self.url("/api/bindings"))
            .json(binding)
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("registry rejected binding: {}", resp.status());
        }
        Ok(())
    }
}

#[async_trait]
impl StatusUpdater for RegistryClient {
    async fn update_pod_status(&self, pod: &Pod) -> anyhow::Result<()> {
        self.store_pod(pod).await
    }
}

#[async_trait]
impl PodSource for RegistryClient {
    /// Polls the registry for the oldest pending, unassigned pod. The pod
    /// is fetched fresh at each attempt rather than queued ahead of time.
    async fn next_pod(&self) -> anyhow::Result<Pod> {
        loop {
            match self.all_pods().await {
                Ok(pods) => {
                    if let Some(pod) = pods.into_iter().find(|pod| {
                        pod.status.phase == PodPhase::Pending && pod.status.host.is_empty()
                    }) {
                        debug!("next pending pod: {}", pod.metadata.name);
                        return Ok(pod);
                    }
                }
                Err(err) => warn!("listing pods failed, retrying: {err:#}"),
            }
            tokio::time::sleep(self.pending_poll_interval).await;
        }
    }
}

#[async_trait]
impl FailureHandler for RegistryClient {
    async fn error(&self, pod: Pod, err: anyhow::Error) {
        warn!(
            "scheduling {} failed (attempt {}): {err:#}",
            pod.metadata.name, pod.status.scheduler_failure_count
        );
        if let Err(err) = self.store_pod(&pod).await {
            warn!("requeueing pod {} failed: {err:#}", pod.metadata.name);
        }
    }
}

#[async_trait]
impl PodRegistry for RegistryClient {
    async fn list_pods(&self) -> anyhow::Result<Vec<Pod>> {
        self.all_pods().await
    }
}

#[async_trait]
impl MinionGetter for RegistryClient {
    async fn get_minion(&self, name: &str) -> anyhow::Result<Option<Minion>> {
        let resp = self
            .http
            .get(self.url(&format!("/api/minions/{name}")))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            anyhow::bail!("registry returned {} for minion {name}", resp.status());
        }
        Ok(Some(resp.json().await?))
    }
}

/// Client for the `/podInfo` endpoint every node agent serves.
pub struct AgentClient {
    http: reqwest::Client,
    agent_port: u16,
}

impl AgentClient {
    pub fn new(agent_port: u16) -> Self {
        AgentClient {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            agent_port,
        }
    }
}

#[async_trait]
impl PodInfoGetter for AgentClient {
    async fn get_pod_info(
        &self,
        host: &str,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<PodInfo> {
        let url = format!(
            "http://{}:{}/podInfo?podID={}&podNamespace={}",
            host, self.agent_port, name, namespace
        );
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("agent on {host} returned {}", resp.status());
        }
        Ok(resp.json().await?)
    }
}

/// Resolves node names through the system resolver.
pub struct DnsIpGetter;

impl IpGetter for DnsIpGetter {
    fn get_instance_ip(&self, host: &str) -> String {
        use std::net::ToSocketAddrs;
        (host, 0)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .map(|addr| addr.ip().to_string())
            .unwrap_or_default()
    }
}
