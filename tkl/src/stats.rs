//! Machine and container statistics, proxied from a cadvisor-style
//! collector. The stats payloads are opaque JSON to the agent.

use async_trait::async_trait;

#[async_trait]
pub trait StatsProvider: Send + Sync {
    /// Static machine description (cores, memory, topology).
    async fn machine_info(&self) -> anyhow::Result<serde_json::Value>;

    /// Whole-machine usage counters.
    async fn machine_stats(&self) -> anyhow::Result<serde_json::Value>;

    /// Usage counters for one container.
    async fn container_stats(&self, container_id: &str) -> anyhow::Result<serde_json::Value>;
}

/// HTTP client against a cadvisor endpoint on the same host.
pub struct CadvisorClient {
    base: String,
    http: reqwest::Client,
}

impl CadvisorClient {
    pub fn new(endpoint: &str) -> Self {
        CadvisorClient {
            base: endpoint.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn get(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        let url = format!("{}{}", self.base, path);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("cadvisor returned {} for {}", resp.status(), url);
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl StatsProvider for CadvisorClient {
    async fn machine_info(&self) -> anyhow::Result<serde_json::Value> {
        self.get("/api/v1.2/machine").await
    }

    async fn machine_stats(&self) -> anyhow::Result<serde_json::Value> {
        self.get("/api/v1.2/containers/").await
    }

    async fn container_stats(&self, container_id: &str) -> anyhow::Result<serde_json::Value> {
        self.get(&format!("/api/v1.2/docker/{container_id}")).await
    }
}

/// Placeholder when no collector is configured.
pub struct NoStats;

#[async_trait]
impl StatsProvider for NoStats {
    async fn machine_info(&self) -> anyhow::Result<serde_json::Value> {
        anyhow::bail!("no stats collector configured")
    }

    async fn machine_stats(&self) -> anyhow::Result<serde_json::Value> {
        anyhow::bail!("no stats collector configured")
    }

    async fn container_stats(&self, _container_id: &str) -> anyhow::Result<serde_json::Value> {
        anyhow::bail!("no stats collector configured")
    }
}
