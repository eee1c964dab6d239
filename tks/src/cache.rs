//! Background aggregator of observed pod status. One sweep probes every
//! known pod concurrently and refreshes the `(namespace, name) → status`
//! map the REST layer reads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::{Minion, NETWORK_CONTAINER_NAME, Pod, PodInfo, PodPhase, PodSpec, PodStatus};
use log::{error, warn};
use tokio::task::JoinSet;

/// Resolves a node name to its instance IP.
pub trait IpGetter: Send + Sync {
    fn get_instance_ip(&self, host: &str) -> String;
}

/// Fetches per-pod container info from the node agent on `host`.
#[async_trait]
pub trait PodInfoGetter: Send + Sync {
    async fn get_pod_info(
        &self,
        host: &str,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<PodInfo>;
}

#[async_trait]
pub trait MinionGetter: Send + Sync {
    /// `Ok(None)` means the node does not exist; errors mean the lookup
    /// itself failed.
    async fn get_minion(&self, name: &str) -> anyhow::Result<Option<Minion>>;
}

#[async_trait]
pub trait PodRegistry: Send + Sync {
    async fn list_pods(&self) -> anyhow::Result<Vec<Pod>>;
}

#[derive(Default)]
struct CacheState {
    pod_status: HashMap<(String, String), PodStatus>,
    /// Node-existence answers for the current sweep.
    current_nodes: HashMap<String, bool>,
}

pub struct PodCache {
    ip_getter: Arc<dyn IpGetter>,
    container_info: Arc<dyn PodInfoGetter>,
    minions: Arc<dyn MinionGetter>,
    pods: Arc<dyn PodRegistry>,
    state: Mutex<CacheState>,
}

impl PodCache {
    pub fn new(
        ip_getter: Arc<dyn IpGetter>,
        container_info: Arc<dyn PodInfoGetter>,
        minions: Arc<dyn MinionGetter>,
        pods: Arc<dyn PodRegistry>,
    ) -> Arc<Self> {
        Arc::new(PodCache {
            ip_getter,
            container_info,
            minions,
            pods,
            state: Mutex::new(CacheState::default()),
        })
    }

    /// The last observed status for a pod, if any sweep has seen it.
    pub fn get_pod_status(&self, namespace: &str, name: &str) -> Option<PodStatus> {
        self.state
            .lock()
            .unwrap()
            .pod_status
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn node_exists_in_cache(&self, name: &str) -> Option<bool> {
        self.state
            .lock()
            .unwrap()
            .current_nodes
            .get(name)
            .copied()
    }

    async fn node_exists(&self, name: &str) -> bool {
        if let Some(exists) = self.node_exists_in_cache(name) {
            return exists;
        }
        let exists = match self.minions.get_minion(name).await {
            Ok(minion) => minion.is_some(),
            Err(err) => {
                warn!("unexpected error verifying minion {name} existence: {err:#}");
                false
            }
        };
        self.state
            .lock()
            .unwrap()
            .current_nodes
            .insert(name.to_string(), exists);
        exists
    }

    /// Always produces a status, even when probing fails.
    async fn compute_pod_status(&self, pod: &Pod) -> PodStatus {
        let mut status = pod.status.clone();

        if pod.status.host.is_empty() {
            // Not assigned (or assignment failed): keep whatever phase the
            // scheduler recorded.
            return status;
        }

        if !self.node_exists(&pod.status.host).await {
            status.phase = PodPhase::Failed;
            return status;
        }

        status.host_ip = self.ip_getter.get_instance_ip(&pod.status.host);
        match self
            .container_info
            .get_pod_info(&pod.status.host, &pod.metadata.namespace, &pod.metadata.name)
            .await
        {
            Err(_) => {
                status.phase = PodPhase::Failed;
            }
            Ok(info) => {
                status.phase = get_phase(&pod.spec, Some(&info));
                if let Some(net_info) = info.get(NETWORK_CONTAINER_NAME) {
                    if !net_info.pod_ip.is_empty() {
                        status.pod_ip = net_info.pod_ip.clone();
                    }
                }
                status.info = info;
            }
        }
        status
    }

    async fn update_pod_status(&self, pod: &Pod) {
        let status = self.compute_pod_status(pod).await;
        self.state.lock().unwrap().pod_status.insert(
            (pod.metadata.namespace.clone(), pod.metadata.name.clone()),
            status,
        );
    }

    /// One sweep: clears the node-existence cache, lists all pods and
    /// probes each concurrently. Callers should let one sweep finish
    /// before starting the next.
    pub async fn update_all_containers(self: &Arc<Self>) {
        self.state.lock().unwrap().current_nodes.clear();

        let pods = match self.pods.list_pods().await {
            Ok(pods) => pods,
            Err(err) => {
                error!("error getting pod list: {err:#}");
                return;
            }
        };

        let mut sweep = JoinSet::new();
        for pod in pods {
            let cache = self.clone();
            sweep.spawn(async move { cache.update_pod_status(&pod).await });
        }
        while sweep.join_next().await.is_some() {}
    }
}

/// Derives the pod phase from per-container runtime observations.
pub fn get_phase(spec: &PodSpec, info: Option<&PodInfo>) -> PodPhase {
    let Some(info) = info else {
        return PodPhase::Pending;
    };
    let mut running = 0;
    let mut stopped = 0;
    let mut unknown = 0;
    for container in &spec.containers {
        match info.get(&container.name) {
            Some(status) if status.state.running.is_some() => running += 1,
            Some(status) if status.state.termination.is_some() => stopped += 1,
            _ => unknown += 1,
        }
    }
    match (running, stopped, unknown) {
        (r, _, 0) if r > 0 => PodPhase::Running,
        (0, s, 0) if s > 0 => PodPhase::Failed,
        _ => PodPhase::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Container, ContainerStatus, ObjectMeta, RunningState, TerminationState};

    fn spec_with(names: &[&str]) -> PodSpec {
        PodSpec {
            containers: names
                .iter()
                .map(|name| Container {
                    name: name.to_string(),
                    image: "busybox".to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn running_status() -> ContainerStatus {
        ContainerStatus {
            state: common::ContainerState {
                running: Some(RunningState::default()),
                termination: None,
            },
            ..Default::default()
        }
    }

    fn stopped_status(exit_code: i32) -> ContainerStatus {
        ContainerStatus {
            state: common::ContainerState {
                running: None,
                termination: Some(TerminationState {
                    exit_code,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }
    }

    #[test]
    fn phase_table() {
        let spec = spec_with(&["a", "b"]);

        assert_eq!(get_phase(&spec, None), PodPhase::Pending);

        let mut info = PodInfo::new();
        info.insert("a".to_string(), running_status());
        info.insert("b".to_string(), running_status());
        assert_eq!(get_phase(&spec, Some(&info)), PodPhase::Running);

        let mut info = PodInfo::new();
        info.insert("a".to_string(), running_status());
        info.insert("b".to_string(), stopped_status(1));
        assert_eq!(get_phase(&spec, Some(&info)), PodPhase::Running);

        let mut info = PodInfo::new();
        info.insert("a".to_string(), stopped_status(0));
        info.insert("b".to_string(), stopped_status(1));
        assert_eq!(get_phase(&spec, Some(&info)), PodPhase::Failed);

        // one container unknown keeps the pod pending
        let mut info = PodInfo::new();
        info.insert("a".to_string(), running_status());
        assert_eq!(get_phase(&spec, Some(&info)), PodPhase::Pending);
    }

    struct FixedIp;
    impl IpGetter for FixedIp {
        fn get_instance_ip(&self, _host: &str) -> String {
            "192.168.0.10".to_string()
        }
    }

    struct FakeInfo {
        info: Option<PodInfo>,
    }

    #[async_trait]
    impl PodInfoGetter for FakeInfo {
        async fn get_pod_info(
            &self,
            _host: &str,
            _namespace: &str,
            _name: &str,
        ) -> anyhow::Result<PodInfo> {
            self.info
                .clone()
                .ok_or_else(|| anyhow::anyhow!("agent unreachable"))
        }
    }

    struct FakeMinions {
        names: Vec<String>,
    }

    #[async_trait]
    impl MinionGetter for FakeMinions {
        async fn get_minion(&self, name: &str) -> anyhow::Result<Option<Minion>> {
            Ok(self.names.iter().any(|n| n == name).then(|| Minion {
                name: name.to_string(),
                ..Default::default()
            }))
        }
    }

    struct FakePods {
        pods: Vec<Pod>,
    }

    #[async_trait]
    impl PodRegistry for FakePods {
        async fn list_pods(&self) -> anyhow::Result<Vec<Pod>> {
            Ok(self.pods.clone())
        }
    }

    fn pod_on(name: &str, host: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: "default".to_string(),
                ..Default::default()
            },
            spec: spec_with(&["app"]),
            status: PodStatus {
                host: host.to_string(),
                ..Default::default()
            },
        }
    }

    fn cache_of(
        info: Option<PodInfo>,
        nodes: &[&str],
        pods: Vec<Pod>,
    ) -> Arc<PodCache> {
        PodCache::new(
            Arc::new(FixedIp),
            Arc::new(FakeInfo { info }),
            Arc::new(FakeMinions {
                names: nodes.iter().map(|n| n.to_string()).collect(),
            }),
            Arc::new(FakePods { pods }),
        )
    }

    #[tokio::test]
    async fn pods_on_vanished_node_go_failed() {
        let mut info = PodInfo::new();
        info.insert("app".to_string(), running_status());
        let cache = cache_of(
            Some(info),
            &["node-y"],
            vec![pod_on("on-x", "node-x"), pod_on("on-y", "node-y")],
        );

        cache.update_all_containers().await;

        assert_eq!(
            cache.get_pod_status("default", "on-x").unwrap().phase,
            PodPhase::Failed
        );
        assert_eq!(
            cache.get_pod_status("default", "on-y").unwrap().phase,
            PodPhase::Running
        );
    }

    #[tokio::test]
    async fn unassigned_pod_keeps_scheduler_phase() {
        let mut failed = pod_on("doomed", "");
        failed.status.phase = PodPhase::Failed;
        let cache = cache_of(None, &[], vec![failed, pod_on("waiting", "")]);

        cache.update_all_containers().await;

        assert_eq!(
            cache.get_pod_status("default", "doomed").unwrap().phase,
            PodPhase::Failed
        );
        assert_eq!(
            cache.get_pod_status("default", "waiting").unwrap().phase,
            PodPhase::Pending
        );
    }

    #[tokio::test]
    async fn agent_errors_mark_pod_failed_but_fill_host_ip() {
        let cache = cache_of(None, &["node-x"], vec![pod_on("p", "node-x")]);

        cache.update_all_containers().await;

        let status = cache.get_pod_status("default", "p").unwrap();
        assert_eq!(status.phase, PodPhase::Failed);
        assert_eq!(status.host_ip, "192.168.0.10");
    }

    #[tokio::test]
    async fn pod_ip_comes_from_net_container() {
        let mut info = PodInfo::new();
        info.insert("app".to_string(), running_status());
        let mut net = running_status();
        net.pod_ip = "10.8.0.4".to_string();
        info.insert("net".to_string(), net);

        let cache = cache_of(Some(info), &["node-x"], vec![pod_on("p", "node-x")]);
        cache.update_all_containers().await;

        let status = cache.get_pod_status("default", "p").unwrap();
        assert_eq!(status.pod_ip, "10.8.0.4");
        assert_eq!(status.phase, PodPhase::Running);
    }
}
