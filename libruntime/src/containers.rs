//! Helpers over the raw runtime listing: filtering to managed containers,
//! locating a pod's containers and distilling per-pod runtime state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::naming::parse_container_name;
use crate::types::{ApiContainer, ContainerDetail};
use crate::{ContainerRuntime, RuntimeError};

/// The managed subset of one runtime listing, keyed by container id.
#[derive(Debug, Default, Clone)]
pub struct ManagedContainers {
    items: HashMap<String, ApiContainer>,
}

impl ManagedContainers {
    pub fn iter(&self) -> impl Iterator<Item = &ApiContainer> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Finds the container for `(pod_full_name, uid, container_name)`.
    /// An empty `uid` matches any pod instance.
    pub fn find_pod_container(
        &self,
        pod_full_name: &str,
        uid: &str,
        container_name: &str,
    ) -> Option<&ApiContainer> {
        self.items.values().find(|c| {
            parse_container_name(c.name()).is_some_and(|parsed| {
                parsed.pod_full_name == pod_full_name
                    && parsed.container_name == container_name
                    && (uid.is_empty() || parsed.uid == uid)
            })
        })
    }
}

/// Lists containers carrying the managed naming scheme. `all` includes
/// exited containers.
pub async fn managed_containers(
    runtime: &dyn ContainerRuntime,
    all: bool,
) -> Result<ManagedContainers, RuntimeError> {
    let listed = runtime.list_containers(all).await?;
    let items = listed
        .into_iter()
        .filter(|c| parse_container_name(c.name()).is_some())
        .map(|c| (c.id.clone(), c))
        .collect();
    Ok(ManagedContainers { items })
}

/// All containers (running or exited) for one `(pod_full_name, uid,
/// container_name)`, inspected and sorted newest first.
pub async fn recent_containers_with_name_and_uid(
    runtime: &dyn ContainerRuntime,
    pod_full_name: &str,
    uid: &str,
    container_name: &str,
) -> Result<Vec<ContainerDetail>, RuntimeError> {
    let listed = runtime.list_containers(true).await?;
    let mut details = Vec::new();
    for container in listed {
        let Some(parsed) = parse_container_name(container.name()) else {
            continue;
        };
        if parsed.pod_full_name != pod_full_name
            || parsed.container_name != container_name
            || (!uid.is_empty() && parsed.uid != uid)
        {
            continue;
        }
        details.push(runtime.inspect_container(&container.id).await?);
    }
    details.sort_by(|a, b| b.created.cmp(&a.created));
    Ok(details)
}

fn format_time(t: &Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339()).unwrap_or_default()
}

/// Distills runtime state for every container of a pod into the API's
/// per-container status map.
pub async fn runtime_pod_info(
    runtime: &dyn ContainerRuntime,
    pod_full_name: &str,
    uid: &str,
) -> Result<common::PodInfo, RuntimeError> {
    let listed = runtime.list_containers(true).await?;
    let mut info: common::PodInfo = HashMap::new();
    let mut created: HashMap<String, i64> = HashMap::new();

    for container in listed {
        let Some(parsed) = parse_container_name(container.name()) else {
            continue;
        };
        if parsed.pod_full_name != pod_full_name || (!uid.is_empty() && parsed.uid != uid) {
            continue;
        }
        // Several generations of a container can coexist; report the newest.
        if created
            .get(&parsed.container_name)
            .is_some_and(|&seen| seen >= container.created)
        {
            continue;
        }
        let detail = runtime.inspect_container(&container.id).await?;
        let mut status = common::ContainerStatus {
            container_id: detail.id.clone(),
            pod_ip: detail.network_settings.ip_address.clone(),
            ..Default::default()
        };
        if detail.state.running {
            status.state.running = Some(common::RunningState {
                started_at: format_time(&detail.state.started_at),
            });
        } else {
            status.state.termination = Some(common::TerminationState {
                exit_code: detail.state.exit_code,
                finished_at: format_time(&detail.state.finished_at),
            });
        }
        created.insert(parsed.container_name.clone(), container.created);
        info.insert(parsed.container_name, status);
    }

    if info.is_empty() {
        return Err(RuntimeError::NoContainersInPod);
    }
    Ok(info)
}
