//! Pure fit predicates. The scheduler ANDs all of them over each candidate
//! minion; the first failing predicate disqualifies the node.

use std::collections::{HashMap, HashSet};

use common::{Minion, NetworkMode, Pod, resource_request};
use tracing::debug;

pub trait FitPredicate: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether `pod` fits on `minion` given the pods already bound there.
    fn fits(&self, pod: &Pod, existing: &[Pod], minion: &Minion) -> anyhow::Result<bool>;
}

/// Pivots all known pods into host → pods-on-host.
pub fn map_pods_to_machines(pods: &[Pod]) -> HashMap<String, Vec<Pod>> {
    let mut machine_to_pods: HashMap<String, Vec<Pod>> = HashMap::new();
    for pod in pods {
        if pod.status.host.is_empty() {
            continue;
        }
        machine_to_pods
            .entry(pod.status.host.clone())
            .or_default()
            .push(pod.clone());
    }
    machine_to_pods
}

/// No two pods on one node may mount the same persistent disk.
pub struct NoDiskConflict;

impl NoDiskConflict {
    fn pod_mounts_disk(pod: &Pod, pd_name: &str) -> bool {
        pod.spec.volumes.iter().any(|v| {
            v.source
                .as_ref()
                .and_then(|s| s.persistent_disk.as_ref())
                .is_some_and(|pd| pd.pd_name == pd_name)
        })
    }
}

impl FitPredicate for NoDiskConflict {
    fn name(&self) -> &'static str {
        "NoDiskConflict"
    }

    fn fits(&self, pod: &Pod, existing: &[Pod], _minion: &Minion) -> anyhow::Result<bool> {
        for volume in &pod.spec.volumes {
            let Some(pd) = volume
                .source
                .as_ref()
                .and_then(|s| s.persistent_disk.as_ref())
            else {
                continue;
            };
            if existing
                .iter()
                .any(|other| Self::pod_mounts_disk(other, &pd.pd_name))
            {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Requested resources must fit in what the node has left. Zero capacity
/// in a dimension means unlimited. Bridge-mode pods additionally need a
/// free VM slot.
pub struct PodFitsResources;

impl FitPredicate for PodFitsResources {
    fn name(&self) -> &'static str {
        "PodFitsResources"
    }

    fn fits(&self, pod: &Pod, existing: &[Pod], minion: &Minion) -> anyhow::Result<bool> {
        // Bridge pods consume one VM slot each, whatever else they ask for.
        if pod.spec.network_mode == NetworkMode::Bridge
            && minion.spec.vms.len() <= existing.len()
        {
            return Ok(false);
        }

        let request = resource_request(&pod.spec);
        if request == Default::default() {
            return Ok(true);
        }

        let mut used = common::ResourceRequest::default();
        for other in existing {
            let r = resource_request(&other.spec);
            used.milli_cpu += r.milli_cpu;
            used.memory += r.memory;
            used.core += r.core;
            used.disk += r.disk;
        }

        let capacity = &minion.spec.capacity;
        let total_milli_cpu = (capacity.cpu * 1000.0) as i64;
        let fits_cpu =
            total_milli_cpu == 0 || total_milli_cpu - used.milli_cpu >= request.milli_cpu;
        let fits_memory =
            capacity.memory == 0 || capacity.memory - used.memory >= request.memory;
        let fits_core = capacity.core == 0 || capacity.core - used.core >= request.core;
        let fits_disk = capacity.disk == 0 || capacity.disk - used.disk >= request.disk;
        debug!(
            minion = %minion.name,
            fits_cpu, fits_memory, fits_core, fits_disk,
            "calculated resource fit"
        );
        Ok(fits_cpu && fits_memory && fits_core && fits_disk)
    }
}

/// Node label selection: subset match, plus the `whitelist` escape hatch,
/// the `active=false` blacklist and sriov-node reservation.
pub struct PodSelectorMatches;

impl FitPredicate for PodSelectorMatches {
    fn name(&self) -> &'static str {
        "PodSelectorMatches"
    }

    fn fits(&self, pod: &Pod, _existing: &[Pod], minion: &Minion) -> anyhow::Result<bool> {
        let selector = &pod.spec.node_selector;
        if selector.is_empty() {
            return Ok(true);
        }

        // An explicit whitelist names the only admissible nodes.
        if let Some(whitelist) = selector.get("whitelist") {
            return Ok(whitelist.split(',').any(|host| host == minion.name));
        }

        let active = minion.labels.get("active").map(String::as_str) != Some("false");

        // sriov-capable nodes are reserved for pods that ask for them.
        if !selector.contains_key("sriov")
            && minion.labels.get("sriov").map(String::as_str) == Some("1")
        {
            return Ok(false);
        }

        let matches = selector
            .iter()
            .all(|(k, v)| minion.labels.get(k) == Some(v));
        Ok(matches && active)
    }
}

fn used_ports(pods: &[Pod]) -> HashSet<i32> {
    let mut ports = HashSet::new();
    for pod in pods {
        for container in &pod.spec.containers {
            for port in &container.ports {
                ports.insert(port.host_port);
            }
        }
    }
    ports
}

/// No collision on non-zero HostPorts with pods already on the node.
pub struct PodFitsPorts;

impl FitPredicate for PodFitsPorts {
    fn name(&self) -> &'static str {
        "PodFitsPorts"
    }

    fn fits(&self, pod: &Pod, existing: &[Pod], _minion: &Minion) -> anyhow::Result<bool> {
        let existing_ports = used_ports(existing);
        for want in used_ports(std::slice::from_ref(pod)) {
            if want == 0 {
                continue;
            }
            if existing_ports.contains(&want) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Pods sharing a `jobid` annotation are spread across nodes.
pub struct NoPodAffinity;

impl FitPredicate for NoPodAffinity {
    fn name(&self) -> &'static str {
        "NoPodAffinity"
    }

    fn fits(&self, pod: &Pod, existing: &[Pod], minion: &Minion) -> anyhow::Result<bool> {
        let Some(jobid) = pod.metadata.annotations.get("jobid") else {
            return Ok(true);
        };
        for scheduled in existing {
            if scheduled.metadata.annotations.get("jobid") == Some(jobid) {
                debug!(jobid = %jobid, minion = %minion.name, "affinity fit failed");
                return Ok(false);
            }
        }
        Ok(true)
    }
}

pub fn default_predicates() -> Vec<Box<dyn FitPredicate>> {
    vec![
        Box::new(NoDiskConflict),
        Box::new(PodFitsResources),
        Box::new(PodSelectorMatches),
        Box::new(PodFitsPorts),
        Box::new(NoPodAffinity),
    ]
}
