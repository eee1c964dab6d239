//! Predicate filtering, NUMA cpu selection and network allocation for one
//! pod at a time.

use std::sync::{Arc, Mutex};

use anyhow::{Context, bail};
use async_trait::async_trait;
use common::{Minion, MinionList, Network, NetworkMode, Pod};
use rand::rngs::StdRng;
use tracing::debug;

use crate::bitmap::NumaBitmap;
use crate::predicates::{FitPredicate, map_pods_to_machines};
use crate::{MinionLister, PodLister, ScheduleAlgorithm};

const DEFAULT_CORES: usize = 24;
const DEFAULT_NUMA_NODES: usize = 2;

/// The algorithm's decision: target node, allocated network, cpuset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectedMachine {
    pub name: String,
    pub network: Network,
    pub cpu_set: String,
}

pub struct GenericScheduler {
    predicates: Vec<Box<dyn FitPredicate>>,
    pods: Arc<dyn PodLister>,
    // Reserved for randomized tie-breaking; shared with callers that
    // schedule from several tasks.
    #[allow(dead_code)]
    random: Mutex<StdRng>,
}

impl GenericScheduler {
    pub fn new(
        predicates: Vec<Box<dyn FitPredicate>>,
        pods: Arc<dyn PodLister>,
        random: StdRng,
    ) -> Self {
        GenericScheduler {
            predicates,
            pods,
            random: Mutex::new(random),
        }
    }

    fn find_nodes_that_fit(
        &self,
        pod: &Pod,
        machine_to_pods: &std::collections::HashMap<String, Vec<Pod>>,
        nodes: MinionList,
    ) -> anyhow::Result<Vec<Minion>> {
        let empty = Vec::new();
        let mut filtered = Vec::new();
        for node in nodes.items {
            let existing = machine_to_pods.get(&node.name).unwrap_or(&empty);
            let mut fits = true;
            for predicate in &self.predicates {
                if !predicate
                    .fits(pod, existing, &node)
                    .with_context(|| format!("predicate {} failed", predicate.name()))?
                {
                    fits = false;
                    break;
                }
            }
            if fits {
                filtered.push(node);
            }
        }
        Ok(filtered)
    }

    /// Picks the node and cpuset for `pod` out of `nodes`, preferring the
    /// first node that can satisfy the request inside a single NUMA node
    /// and falling back to the first node with enough free cores anywhere.
    fn numa_cpu_select(
        &self,
        pod: &Pod,
        machine_to_pods: &std::collections::HashMap<String, Vec<Pod>>,
        nodes: &[Minion],
    ) -> anyhow::Result<(usize, Vec<String>)> {
        let req_core: usize = pod
            .spec
            .containers
            .iter()
            .map(|c| c.core.max(0) as usize)
            .sum();
        if req_core == 0 {
            return Ok((0, Vec::new()));
        }

        let empty = Vec::new();
        let mut fallback: Option<(usize, Vec<String>)> = None;

        for (index, minion) in nodes.iter().enumerate() {
            let existing = machine_to_pods.get(&minion.name).unwrap_or(&empty);
            let capacity = &minion.spec.capacity;
            let mut cpu_map = NumaBitmap::new(
                capacity.core_or(DEFAULT_CORES),
                capacity.cpu_node_or(DEFAULT_NUMA_NODES),
            );
            for pod in existing {
                cpu_map.mark_cpu_set(&pod.status.cpu_set);
            }

            let free = cpu_map.free_cores();
            if free.len() < req_core {
                continue;
            }
            if fallback.is_none() {
                let set = free[..req_core].iter().map(ToString::to_string).collect();
                fallback = Some((index, set));
            }

            for offs in cpu_map.free_cores_per_numa() {
                if offs.len() >= req_core {
                    let set: Vec<String> =
                        offs[..req_core].iter().map(ToString::to_string).collect();
                    debug!(
                        minion = %minion.name,
                        cpu_set = %set.join(","),
                        "selected numa-coherent cpu set"
                    );
                    return Ok((index, set));
                }
            }
        }

        match fallback {
            Some((index, set)) => {
                debug!(
                    minion = %nodes[index].name,
                    cpu_set = %set.join(","),
                    "selected cpu set across numa nodes"
                );
                Ok((index, set))
            }
            None => bail!("no minion offers {req_core} free cores"),
        }
    }

    /// Allocates the pod's network on the chosen node. Bridge mode claims
    /// the first VM slot whose address no pod on the node is using; every
    /// other mode only records itself.
    fn alloc_network(
        &self,
        pod: &Pod,
        machine_to_pods: &std::collections::HashMap<String, Vec<Pod>>,
        node: &Minion,
    ) -> Network {
        if pod.spec.network_mode != NetworkMode::Bridge {
            return Network {
                mode: pod.spec.network_mode,
                ..Default::default()
            };
        }

        let empty = Vec::new();
        let existing = machine_to_pods.get(&node.name).unwrap_or(&empty);
        let mut network = Network::default();
        for vm in &node.spec.vms {
            let used = existing
                .iter()
                .any(|pod| pod.status.network.address == vm.address);
            if !used {
                network.address = vm.address.clone();
                network.gateway = vm.gateway.clone();
                network.bridge = format!("br{}", vm.vlan_id);
                network.mode = pod.spec.network_mode;
                break;
            }
        }
        network
    }
}

#[async_trait]
impl ScheduleAlgorithm for GenericScheduler {
    async fn schedule(
        &self,
        pod: &Pod,
        minion_lister: &dyn MinionLister,
    ) -> anyhow::Result<SelectedMachine> {
        let minions = minion_lister.list().await?;
        if minions.items.is_empty() {
            bail!("schedule minion list is empty");
        }

        let all_pods = self.pods.list_pods().await?;
        let machine_to_pods = map_pods_to_machines(&all_pods);

        let filtered = self.find_nodes_that_fit(pod, &machine_to_pods, minions)?;
        if filtered.is_empty() {
            bail!("no minion fits pod {}", pod.metadata.name);
        }
        debug!(
            minions = ?filtered.iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
            "filtered minions"
        );

        let (index, set) = self.numa_cpu_select(pod, &machine_to_pods, &filtered)?;
        let selected = &filtered[index];
        let network = self.alloc_network(pod, &machine_to_pods, selected);

        Ok(SelectedMachine {
            name: selected.name.clone(),
            network,
            cpu_set: set.join(","),
        })
    }

    async fn check_scheduled_pod(&self, pod_name: &str) -> anyhow::Result<bool> {
        let pods = self.pods.list_pods().await?;
        Ok(pods
            .iter()
            .any(|pod| pod.metadata.name == pod_name && !pod.status.host.is_empty()))
    }
}
