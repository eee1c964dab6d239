use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry from the runtime's container listing.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ApiContainer {
    #[serde(rename = "Id")]
    pub id: String,
    /// Names as listed by the runtime, with a leading `/`.
    #[serde(rename = "Names", default)]
    pub names: Vec<String>,
    #[serde(rename = "Image", default)]
    pub image: String,
    /// Creation time, unix seconds.
    #[serde(rename = "Created", default)]
    pub created: i64,
    #[serde(rename = "Status", default)]
    pub status: String,
}

impl ApiContainer {
    /// The primary listed name, `/` stripped.
    pub fn name(&self) -> &str {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/'))
            .unwrap_or("")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ContainerState {
    #[serde(rename = "Running", default)]
    pub running: bool,
    #[serde(rename = "Pid", default)]
    pub pid: i32,
    #[serde(rename = "ExitCode", default)]
    pub exit_code: i32,
    #[serde(rename = "StartedAt", default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "FinishedAt", default)]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct NetworkSettings {
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
}

/// Full inspect result for one container.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ContainerDetail {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Created", default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(rename = "State", default)]
    pub state: ContainerState,
    #[serde(rename = "Config", default)]
    pub config: ContainerConfig,
    #[serde(rename = "HostConfig", default)]
    pub host_config: HostConfig,
    #[serde(rename = "NetworkSettings", default)]
    pub network_settings: NetworkSettings,
    #[serde(rename = "Image", default)]
    pub image: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ContainerConfig {
    #[serde(rename = "Hostname", default)]
    pub hostname: String,
    #[serde(rename = "Image", default)]
    pub image: String,
    #[serde(rename = "Cmd", default)]
    pub cmd: Vec<String>,
    #[serde(rename = "Env", default)]
    pub env: Vec<String>,
    /// Keys like `"80/tcp"`.
    #[serde(rename = "ExposedPorts", default)]
    pub exposed_ports: HashMap<String, serde_json::Value>,
    #[serde(rename = "Memory", default)]
    pub memory: i64,
    #[serde(rename = "CpuShares", default)]
    pub cpu_shares: i64,
    #[serde(rename = "CpuSet", default)]
    pub cpu_set: String,
    #[serde(rename = "WorkingDir", default)]
    pub working_dir: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PortBinding {
    #[serde(rename = "HostIp", default)]
    pub host_ip: String,
    #[serde(rename = "HostPort", default)]
    pub host_port: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct HostConfig {
    #[serde(rename = "Binds", default)]
    pub binds: Vec<String>,
    #[serde(rename = "PortBindings", default)]
    pub port_bindings: HashMap<String, Vec<PortBinding>>,
    #[serde(rename = "NetworkMode", default)]
    pub network_mode: String,
    #[serde(rename = "Privileged", default)]
    pub privileged: bool,
    #[serde(rename = "CapAdd", default)]
    pub cap_add: Vec<String>,
    #[serde(rename = "CapDrop", default)]
    pub cap_drop: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateContainerOptions {
    pub name: String,
    pub config: ContainerConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Image {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Parent", default)]
    pub parent: String,
    #[serde(rename = "Size", default)]
    pub size: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AuthConfiguration {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Default)]
pub struct PushImageOptions {
    pub name: String,
    pub tag: String,
    pub registry: String,
}

#[derive(Debug, Clone, Default)]
pub struct ImportImageOptions {
    pub repository: String,
    /// Path of a local tarball. The file must be readable up front.
    pub source: String,
    pub tag: String,
}

/// Include/exclude filters for a commit.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ChangeOptions {
    #[serde(rename = "Includes", default)]
    pub includes: Vec<String>,
    #[serde(rename = "Excludes", default)]
    pub excludes: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CommitContainerOptions {
    pub container: String,
    pub repository: String,
    pub tag: String,
    pub message: String,
    pub author: String,
    pub options: Option<ChangeOptions>,
}

#[derive(Debug, Clone, Default)]
pub struct MergeImageOptions {
    pub container: String,
    pub current_image: String,
    pub repository: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct CgroupResponse {
    #[serde(rename = "Group", default)]
    pub group: String,
    #[serde(rename = "Subsystem", default)]
    pub subsystem: String,
    #[serde(rename = "Out", default)]
    pub out: String,
    #[serde(rename = "Status", default)]
    pub status: i32,
}
