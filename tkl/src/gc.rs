//! Garbage collection of exited sandbox containers. Application
//! containers share their sandbox's lifetime, so retention is tracked per
//! `(uid, net)` group only.

use chrono::Utc;
use libruntime::NETWORK_CONTAINER_NAME;
use libruntime::containers::managed_containers;
use libruntime::naming::parse_container_name;
use std::collections::HashMap;
use tracing::debug;

use crate::kubelet::Kubelet;

impl Kubelet {
    /// Prunes each sandbox group down to `max_container_count` entries,
    /// never touching running containers or those newer than
    /// `minimum_gc_age`.
    pub async fn garbage_collect_containers(&self) -> anyhow::Result<()> {
        if self.max_container_count == 0 {
            return Ok(());
        }
        let containers = managed_containers(self.runtime.as_ref(), true).await?;

        let mut groups: HashMap<String, Vec<String>> = HashMap::new();
        for container in containers.iter() {
            let Some(parsed) = parse_container_name(container.name()) else {
                continue;
            };
            if parsed.container_name != NETWORK_CONTAINER_NAME {
                continue;
            }
            groups
                .entry(format!("{}.{}", parsed.uid, parsed.container_name))
                .or_default()
                .push(container.id.clone());
        }

        for (group, ids) in groups {
            if ids.len() <= self.max_container_count {
                continue;
            }
            debug!(group = %group, count = ids.len(), "pruning sandbox group");
            self.purge_oldest(ids).await?;
        }
        Ok(())
    }

    async fn purge_oldest(&self, ids: Vec<String>) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut removable = Vec::new();
        for id in ids {
            let detail = self.runtime.inspect_container(&id).await?;
            if detail.state.running {
                continue;
            }
            let old_enough = self.minimum_gc_age.is_zero()
                || detail
                    .state
                    .finished_at
                    .is_none_or(|finished| now - finished > self.minimum_gc_age);
            if old_enough {
                removable.push(detail);
            }
        }

        removable.sort_by(|a, b| b.created.cmp(&a.created));
        if removable.len() <= self.max_container_count {
            return Ok(());
        }
        for detail in removable.split_off(self.max_container_count) {
            debug!(id = %detail.id, "removing container");
            self.runtime.remove_container(&detail.id).await?;
        }
        Ok(())
    }
}
