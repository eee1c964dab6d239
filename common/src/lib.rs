use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod exec;
pub mod util;
pub mod validation;

/// Annotation key naming the config source a bound pod was delivered from.
pub const CONFIG_SOURCE_ANNOTATION_KEY: &str = "kubernetes/config.source";

/// Reserved name of the per-pod network sandbox container.
pub const NETWORK_CONTAINER_NAME: &str = "net";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    Host,
    #[default]
    Bridge,
    Nat,
    Sriov,
    None,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestartPolicy {
    #[default]
    Always,
    OnFailure,
    Never,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Failed,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum PullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Port {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "containerPort")]
    pub container_port: i32,
    #[serde(rename = "hostPort", default)]
    pub host_port: i32,
    #[serde(rename = "hostIP", default)]
    pub host_ip: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct VolumeMount {
    pub name: String,
    #[serde(rename = "mountPath")]
    pub mount_path: String,
    #[serde(rename = "readOnly", default)]
    pub read_only: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Volume {
    pub name: String,
    #[serde(default)]
    pub source: Option<VolumeSource>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct VolumeSource {
    #[serde(rename = "hostDir", default)]
    pub host_dir: Option<HostDir>,
    #[serde(rename = "emptyDir", default)]
    pub empty_dir: Option<EmptyDir>,
    #[serde(rename = "persistentDisk", default)]
    pub persistent_disk: Option<PersistentDisk>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct HostDir {
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct EmptyDir {}

/// A network-attached disk mounted exclusively by one pod per host.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PersistentDisk {
    #[serde(rename = "pdName")]
    pub pd_name: String,
    #[serde(rename = "readOnly", default)]
    pub read_only: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Blkio {
    #[serde(rename = "readBPSDevice", default)]
    pub read_bps_device: u64,
    #[serde(rename = "writeBPSDevice", default)]
    pub write_bps_device: u64,
    #[serde(rename = "readIOPSDevice", default)]
    pub read_iops_device: u64,
    #[serde(rename = "writeIOPSDevice", default)]
    pub write_iops_device: u64,
    #[serde(rename = "weightDevice", default)]
    pub weight_device: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ExecAction {
    #[serde(default)]
    pub command: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct HttpGetAction {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub port: i32,
    #[serde(default)]
    pub host: String,
}

/// One lifecycle or probe action. Exactly one member should be set.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Handler {
    #[serde(default)]
    pub exec: Option<ExecAction>,
    #[serde(rename = "httpGet", default)]
    pub http_get: Option<HttpGetAction>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Lifecycle {
    #[serde(rename = "postStart", default)]
    pub post_start: Option<Handler>,
    #[serde(rename = "preStop", default)]
    pub pre_stop: Option<Handler>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct LivenessProbe {
    #[serde(default)]
    pub exec: Option<ExecAction>,
    #[serde(rename = "httpGet", default)]
    pub http_get: Option<HttpGetAction>,
    #[serde(rename = "initialDelaySeconds", default)]
    pub initial_delay_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(rename = "workingDir", default)]
    pub working_dir: String,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub ports: Vec<Port>,
    #[serde(rename = "volumeMounts", default)]
    pub volume_mounts: Vec<VolumeMount>,
    /// CPU request in millicores.
    #[serde(default)]
    pub cpu: i64,
    /// Memory request in bytes.
    #[serde(default)]
    pub memory: i64,
    /// Number of whole cores to pin. Zero means no cpuset pinning.
    #[serde(default)]
    pub core: i64,
    /// Disk quota in GB. Zero means no quota.
    #[serde(default)]
    pub disk: i64,
    #[serde(default)]
    pub blkio: Option<Blkio>,
    #[serde(rename = "capAdd", default)]
    pub cap_add: Vec<String>,
    #[serde(rename = "capDrop", default)]
    pub cap_drop: Vec<String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub lifecycle: Option<Lifecycle>,
    #[serde(rename = "livenessProbe", default)]
    pub liveness_probe: Option<LivenessProbe>,
    #[serde(rename = "imagePullPolicy", default)]
    pub image_pull_policy: PullPolicy,
    #[serde(rename = "terminationMessagePath", default)]
    pub termination_message_path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PodSpec {
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(rename = "nodeSelector", default)]
    pub node_selector: HashMap<String, String>,
    #[serde(rename = "restartPolicy", default)]
    pub restart_policy: RestartPolicy,
    #[serde(rename = "networkMode", default)]
    pub network_mode: NetworkMode,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Network {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub bridge: String,
    #[serde(default)]
    pub mode: NetworkMode,
    #[serde(rename = "macAddress", default)]
    pub mac_address: String,
    #[serde(rename = "vfID", default)]
    pub vf_id: String,
    #[serde(rename = "vlanID", default)]
    pub vlan_id: i32,
}

/// Per-container runtime observation, keyed by container name in [`PodInfo`].
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ContainerStatus {
    #[serde(default)]
    pub state: ContainerState,
    #[serde(rename = "restartCount", default)]
    pub restart_count: i32,
    #[serde(rename = "podIP", default)]
    pub pod_ip: String,
    #[serde(rename = "containerID", default)]
    pub container_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ContainerState {
    #[serde(default)]
    pub running: Option<RunningState>,
    #[serde(default)]
    pub termination: Option<TerminationState>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct RunningState {
    #[serde(rename = "startedAt", default)]
    pub started_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct TerminationState {
    #[serde(rename = "exitCode", default)]
    pub exit_code: i32,
    #[serde(rename = "finishedAt", default)]
    pub finished_at: String,
}

pub type PodInfo = HashMap<String, ContainerStatus>;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,
    #[serde(default)]
    pub host: String,
    #[serde(rename = "podIP", default)]
    pub pod_ip: String,
    #[serde(rename = "hostIP", default)]
    pub host_ip: String,
    #[serde(default)]
    pub info: PodInfo,
    #[serde(rename = "schedulerFailureCount", default)]
    pub scheduler_failure_count: i32,
    #[serde(rename = "cpuSet", default)]
    pub cpu_set: String,
    #[serde(default)]
    pub network: Network,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Pod {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

/// Node resource capacity. Zero means unlimited for fit checks; the numa
/// selector falls back to [`Capacity::core_or`] / [`Capacity::cpu_node_or`]
/// defaults when unset.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Capacity {
    /// Schedulable CPU in whole cores (fractional allowed).
    #[serde(default)]
    pub cpu: f64,
    /// Memory in bytes.
    #[serde(default)]
    pub memory: i64,
    /// Pinnable physical cores.
    #[serde(default)]
    pub core: i64,
    /// Number of NUMA nodes.
    #[serde(rename = "cpuNode", default)]
    pub cpu_node: i64,
    /// Disk in GB.
    #[serde(default)]
    pub disk: i64,
}

impl Capacity {
    pub fn core_or(&self, default: usize) -> usize {
        if self.core > 0 { self.core as usize } else { default }
    }

    pub fn cpu_node_or(&self, default: usize) -> usize {
        if self.cpu_node > 0 {
            self.cpu_node as usize
        } else {
            default
        }
    }
}

/// A bridge-network slot a minion offers. Used by at most one active pod.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct VmSlot {
    pub address: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(rename = "vlanID", default)]
    pub vlan_id: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct MinionSpec {
    #[serde(default)]
    pub capacity: Capacity,
    #[serde(rename = "vms", default)]
    pub vms: Vec<VmSlot>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Minion {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub spec: MinionSpec,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct MinionList {
    #[serde(default)]
    pub items: Vec<Minion>,
}

/// The scheduler's decision for one pod.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Binding {
    #[serde(default)]
    pub namespace: String,
    #[serde(rename = "podID")]
    pub pod_id: String,
    pub host: String,
    #[serde(default)]
    pub network: Network,
    #[serde(rename = "cpuSet", default)]
    pub cpu_set: String,
}

/// Resources assigned at binding time, delivered alongside the pod spec.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct BoundResources {
    #[serde(rename = "cpuSet", default)]
    pub cpu_set: String,
    #[serde(default)]
    pub network: Network,
}

/// A pod after binding, as the node agent sees it.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct BoundPod {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub res: BoundResources,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct BoundPods {
    #[serde(default)]
    pub items: Vec<BoundPod>,
}

impl BoundPod {
    /// Uniquely identifies the pod across config sources:
    /// `name.namespace.source`.
    pub fn full_name(&self) -> String {
        let source = self
            .metadata
            .annotations
            .get(CONFIG_SOURCE_ANNOTATION_KEY)
            .map(String::as_str)
            .unwrap_or("");
        format!("{}.{}.{}", self.metadata.name, self.metadata.namespace, source)
    }
}

/// Builds the full name for a pod known only by id and namespace, assuming
/// the registry delivery channel.
pub fn full_name_from_parts(name: &str, namespace: &str) -> String {
    format!("{name}.{namespace}.etcd")
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PodOperation {
    /// Replace the full desired set.
    Set,
    /// Reserved.
    Add,
    /// Reserved.
    Remove,
    /// Merge by UID into the current desired set.
    Update,
}

/// One event on the node agent's update channel.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PodUpdate {
    pub pods: Vec<BoundPod>,
    pub op: PodOperation,
}

/// Result envelope for agent operations. `code` is 0 on success, 1 on
/// error, independent of the HTTP status.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PodOpResult {
    pub op: String,
    pub code: i32,
    #[serde(rename = "errorMsg", default)]
    pub error_msg: String,
}

impl PodOpResult {
    pub fn ok(op: &str) -> Self {
        PodOpResult {
            op: op.to_string(),
            code: 0,
            error_msg: String::new(),
        }
    }

    pub fn error(op: &str, err: impl std::fmt::Display) -> Self {
        PodOpResult {
            op: op.to_string(),
            code: 1,
            error_msg: err.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PushImageParams {
    #[serde(rename = "podID")]
    pub pod_id: String,
    #[serde(rename = "podNamespace", default)]
    pub pod_namespace: String,
    pub image: String,
    #[serde(default)]
    pub author: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct KvPair {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PodConfig {
    #[serde(rename = "podID")]
    pub pod_id: String,
    #[serde(rename = "podNamespace", default)]
    pub pod_namespace: String,
    #[serde(rename = "writeSubsystem", default)]
    pub write_subsystem: Vec<KvPair>,
}

/// Sum of per-container resource asks across a pod spec.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceRequest {
    pub milli_cpu: i64,
    pub memory: i64,
    pub core: i64,
    pub disk: i64,
}

pub fn resource_request(spec: &PodSpec) -> ResourceRequest {
    let mut req = ResourceRequest::default();
    for c in &spec.containers {
        req.milli_cpu += c.cpu;
        req.memory += c.memory;
        req.core += c.core;
        req.disk += c.disk;
    }
    req
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_name_uses_config_source_annotation() {
        let mut pod = BoundPod {
            metadata: ObjectMeta {
                name: "web".to_string(),
                namespace: "prod".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        pod.metadata
            .annotations
            .insert(CONFIG_SOURCE_ANNOTATION_KEY.to_string(), "etcd".to_string());
        assert_eq!(pod.full_name(), "web.prod.etcd");
    }

    #[test]
    fn full_name_tolerates_missing_source() {
        let pod = BoundPod {
            metadata: ObjectMeta {
                name: "web".to_string(),
                namespace: "prod".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(pod.full_name(), "web.prod.");
    }

    #[test]
    fn network_mode_defaults_to_bridge() {
        let spec: PodSpec = serde_yaml::from_str("containers: []").unwrap();
        assert_eq!(spec.network_mode, NetworkMode::Bridge);
    }

    #[test]
    fn pod_operation_wire_names() {
        assert_eq!(serde_json::to_string(&PodOperation::Set).unwrap(), "\"SET\"");
        assert_eq!(
            serde_json::to_string(&PodOperation::Update).unwrap(),
            "\"UPDATE\""
        );
    }

    #[test]
    fn resource_request_sums_containers() {
        let spec = PodSpec {
            containers: vec![
                Container {
                    cpu: 250,
                    memory: 1 << 30,
                    core: 2,
                    disk: 10,
                    ..Default::default()
                },
                Container {
                    cpu: 750,
                    core: 2,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let req = resource_request(&spec);
        assert_eq!(req.milli_cpu, 1000);
        assert_eq!(req.memory, 1 << 30);
        assert_eq!(req.core, 4);
        assert_eq!(req.disk, 10);
    }
}
