use std::fs;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Registry REST endpoint, e.g. `http://127.0.0.1:8080`.
    pub registry_endpoint: String,

    /// Port node agents listen on.
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,

    /// Scheduling attempts before a pod is marked Failed.
    #[serde(default = "default_max_retry_times")]
    pub max_retry_times: i32,

    /// Seconds between pod cache sweeps.
    #[serde(default = "default_cache_refresh_secs")]
    pub cache_refresh_secs: u64,
}

fn default_agent_port() -> u16 {
    10250
}

fn default_max_retry_times() -> i32 {
    3
}

fn default_cache_refresh_secs() -> u64 {
    30
}

pub fn load_config(path: &str) -> anyhow::Result<Config> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read config from {path}"))?;
    serde_yaml::from_str(&content).context("failed to parse YAML config")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in() {
        let cfg: Config =
            serde_yaml::from_str("registry_endpoint: http://127.0.0.1:8080").unwrap();
        assert_eq!(cfg.agent_port, 10250);
        assert_eq!(cfg.max_retry_times, 3);
        assert_eq!(cfg.cache_refresh_secs, 30);
    }
}
