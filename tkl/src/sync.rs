//! The agent's main loop: consumes PodUpdate events, keeps the desired
//! set, and fans reconciliation out through the worker pool.

use std::collections::HashMap;
use std::sync::Arc;

use common::validation::accumulate_unique_ports;
use common::{BoundPod, NetworkMode, PodOperation, PodUpdate};
use libruntime::containers::managed_containers;
use libruntime::naming::parse_container_name;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::kubelet::Kubelet;

/// Drops pods whose containers collide on a non-zero HostPort with an
/// earlier-accepted pod.
pub fn filter_host_port_conflicts(pods: Vec<BoundPod>) -> Vec<BoundPod> {
    let mut filtered = Vec::new();
    let mut ports = HashMap::new();
    for pod in pods {
        let mut errs = Vec::new();
        accumulate_unique_ports(&pod.spec.containers, &mut ports, &mut errs);
        if !errs.is_empty() {
            warn!(
                pod = %pod.full_name(),
                "host port is already allocated, ignoring pod: {errs:?}"
            );
            continue;
        }
        filtered.push(pod);
    }
    filtered
}

/// Merges an UPDATE event into the current set: entries with a matching
/// UID are replaced, everything else is kept unchanged.
pub fn update_bound_pods(changed: Vec<BoundPod>, current: Vec<BoundPod>) -> Vec<BoundPod> {
    let mut by_uid: HashMap<String, BoundPod> = changed
        .into_iter()
        .map(|pod| (pod.metadata.uid.clone(), pod))
        .collect();

    current
        .into_iter()
        .map(|pod| match by_uid.remove(&pod.metadata.uid) {
            Some(updated) => {
                debug!(uid = %updated.metadata.uid, "pod has a new spec");
                updated
            }
            None => pod,
        })
        .collect()
}

impl Kubelet {
    /// Synchronizes the desired pod set with the runtime: dispatches one
    /// reconciliation per desired pod, kills containers belonging to no
    /// desired pod, and cleans up volumes and per-pod host state.
    pub async fn sync_pods(self: &Arc<Self>, pods: &[BoundPod]) -> anyhow::Result<()> {
        debug!(desired = pods.len(), "syncing pods");
        let mut desired_pods: HashMap<String, ()> = HashMap::new();
        let mut desired_containers: HashMap<(String, String, String), ()> = HashMap::new();

        let containers = managed_containers(self.runtime.as_ref(), false)
            .await
            .map_err(|err| {
                error!("error listing containers: {err}");
                err
            })?;

        for pod in pods {
            let pod_full_name = pod.full_name();
            let uid = pod.metadata.uid.clone();
            desired_pods.insert(uid.clone(), ());
            self.pod_destroyed.insert(uid.clone(), pod.clone());

            desired_containers.insert(
                (
                    pod_full_name.clone(),
                    uid.clone(),
                    libruntime::NETWORK_CONTAINER_NAME.to_string(),
                ),
                (),
            );
            for container in &pod.spec.containers {
                desired_containers
                    .insert((pod_full_name.clone(), uid.clone(), container.name.clone()), ());
            }

            let kubelet = self.clone();
            let pod = pod.clone();
            let listing = containers.clone();
            self.pod_workers.run(pod_full_name, async move {
                if let Err(err) = kubelet.sync_pod(&pod, listing).await {
                    error!(pod = %pod.full_name(), "error syncing pod, skipping: {err:#}");
                }
            });
        }

        // Kill any container we don't need.
        for container in containers.iter() {
            let Some(parsed) = parse_container_name(container.name()) else {
                continue;
            };
            if desired_pods.contains_key(&parsed.uid) {
                // sync_pod handles this pod's own strays.
                continue;
            }
            let key = (
                parsed.pod_full_name.clone(),
                parsed.uid.clone(),
                parsed.container_name.clone(),
            );
            if !desired_containers.contains_key(&key) {
                info!(
                    pod = %parsed.pod_full_name,
                    container = %parsed.container_name,
                    "killing unwanted container"
                );
                if let Err(err) = self.kill_container(container).await {
                    error!(id = %container.id, "error killing container: {err:#}");
                }
            }
        }

        crate::volume::reconcile_volumes(pods, &self.root_dir).await;
        self.clean_pod_related_info(pods).await;
        Ok(())
    }

    /// Finishes teardown for pods that have left the desired set: stops
    /// their lxcfs instance and resets the VF MAC for sriov pods.
    pub(crate) async fn clean_pod_related_info(&self, pods: &[BoundPod]) {
        let desired: HashMap<&str, ()> = pods
            .iter()
            .map(|pod| (pod.metadata.uid.as_str(), ()))
            .collect();

        let departed: Vec<(String, BoundPod)> = self
            .pod_destroyed
            .iter()
            .filter(|entry| !desired.contains_key(entry.key().as_str()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (uid, pod) in departed {
            if let Err(err) = libcgroup::lxcfs::op_lxcfs(
                &self.executor,
                &pod.metadata.name,
                libcgroup::lxcfs::LxcfsOp::Stop,
            )
            .await
            {
                error!(pod = %pod.metadata.name, "failed to stop lxcfs: {err:#}");
            }
            if pod.res.network.mode == NetworkMode::Sriov {
                if let Err(err) = self.network_binder.reset_vf_mac(&pod.res.network).await {
                    error!(pod = %pod.metadata.name, "failed to reset vf mac address: {err:#}");
                }
            }
            self.pod_destroyed.remove(&uid);
        }
    }
}

/// Single-threaded consumer of pod updates. SET replaces the desired set,
/// UPDATE merges by UID; a periodic tick re-reconciles the last desired
/// set. ADD and REMOVE are reserved.
pub async fn sync_loop(kubelet: Arc<Kubelet>, mut updates: mpsc::UnboundedReceiver<PodUpdate>) {
    let mut interval = tokio::time::interval(kubelet.resync_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.reset();

    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else {
                    info!("update channel closed, sync loop exiting");
                    return;
                };
                let current = kubelet.bound_pods().await;
                let next = match update.op {
                    PodOperation::Set => {
                        debug!("SET: containers changed");
                        filter_host_port_conflicts(update.pods)
                    }
                    PodOperation::Update => {
                        debug!("UPDATE: containers changed");
                        filter_host_port_conflicts(update_bound_pods(update.pods, current))
                    }
                    op => panic!("sync loop does not support incremental changes: {op:?}"),
                };
                kubelet.set_bound_pods(next).await;
            }
            _ = interval.tick() => {
                debug!("periodic sync");
                if kubelet.bound_pods().await.is_empty() {
                    continue;
                }
            }
        }

        let desired = kubelet.bound_pods().await;
        if let Err(err) = kubelet.sync_pods(&desired).await {
            error!("couldn't sync containers: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Container, ObjectMeta, PodSpec, Port};

    fn pod_with_port(name: &str, uid: &str, host_port: i32) -> BoundPod {
        BoundPod {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: "default".to_string(),
                uid: uid.to_string(),
                ..Default::default()
            },
            spec: PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    image: "busybox".to_string(),
                    ports: vec![Port {
                        container_port: 80,
                        host_port,
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn host_port_conflicts_drop_later_pods() {
        let pods = vec![
            pod_with_port("a", "u1", 8080),
            pod_with_port("b", "u2", 8080),
            pod_with_port("c", "u3", 9090),
        ];
        let filtered = filter_host_port_conflicts(pods);
        let names: Vec<&str> = filtered.iter().map(|p| p.metadata.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn zero_host_ports_never_conflict() {
        let pods = vec![pod_with_port("a", "u1", 0), pod_with_port("b", "u2", 0)];
        assert_eq!(filter_host_port_conflicts(pods).len(), 2);
    }

    #[test]
    fn update_merges_by_uid() {
        let current = vec![pod_with_port("a", "u1", 1000), pod_with_port("b", "u2", 2000)];
        let changed = vec![pod_with_port("a2", "u1", 1500)];

        let merged = update_bound_pods(changed, current);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].metadata.name, "a2");
        assert_eq!(merged[0].spec.containers[0].ports[0].host_port, 1500);
        assert_eq!(merged[1].metadata.name, "b");
    }
}
