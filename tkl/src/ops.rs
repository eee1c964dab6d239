//! Operator-facing pod operations behind the agent HTTP surface:
//! start/stop, image push and merge, online cgroup and disk updates.

use anyhow::{Context, bail};
use common::{KvPair, NetworkMode, PodConfig, PushImageParams};
use libcgroup::lxcfs::{LxcfsOp, op_lxcfs};
use libruntime::containers::{managed_containers, recent_containers_with_name_and_uid};
use libruntime::{
    AuthConfiguration, CommitContainerOptions, HostConfig, MergeImageOptions,
    NETWORK_CONTAINER_NAME, PushImageOptions, RuntimeError,
};
use tracing::{debug, error, info};

use crate::kubelet::Kubelet;

impl Kubelet {
    /// Stops or starts the containers of a bound pod in place.
    pub async fn op_pod(&self, pod_full_name: &str, op: &str) -> anyhow::Result<()> {
        let pod = self
            .find_bound_pod(pod_full_name)
            .await
            .with_context(|| format!("op_pod can't find pod {pod_full_name}"))?;

        match op {
            "stop" => self.op_pod_stop(&pod).await,
            "start" => self.op_pod_start(&pod).await,
            other => bail!("op_pod does not support {other}"),
        }
    }

    /// Kills the app containers, then the net container.
    async fn op_pod_stop(&self, pod: &common::BoundPod) -> anyhow::Result<()> {
        let containers = managed_containers(self.runtime.as_ref(), false).await?;
        let pod_full_name = pod.full_name();

        let count = self.kill_containers_in_pod(pod, &containers).await?;
        info!(pod = %pod.metadata.name, count, "stopped containers in pod");

        if let Some(net) = containers.find_pod_container(
            &pod_full_name,
            &pod.metadata.uid,
            NETWORK_CONTAINER_NAME,
        ) {
            self.kill_container(net)
                .await
                .with_context(|| format!("failed to stop network container {pod_full_name}"))?;
        }
        Ok(())
    }

    /// Restarts a stopped pod: the most recent dead generation of each
    /// container is started again with its recorded host configuration,
    /// re-attached to the net namespace, with quota/sriov/blkio
    /// reapplied.
    async fn op_pod_start(&self, pod: &common::BoundPod) -> anyhow::Result<()> {
        let containers = managed_containers(self.runtime.as_ref(), false).await?;
        let pod_full_name = pod.full_name();
        let uid = &pod.metadata.uid;

        let net_id = match containers.find_pod_container(
            &pod_full_name,
            uid,
            NETWORK_CONTAINER_NAME,
        ) {
            Some(net) => net.id.clone(),
            None => {
                let net_id = self
                    .create_network_container(pod)
                    .await
                    .context("failed to start network container")?;
                if !pod.res.network.address.is_empty() {
                    self.network_binder
                        .setup_network(&net_id, &pod.res.network)
                        .await
                        .with_context(|| {
                            format!("failed to set up network for pod {pod_full_name}")
                        })?;
                } else {
                    debug!(pod = %pod_full_name, "skipping network setup");
                }
                net_id
            }
        };
        debug!(net_id = %net_id, "network container is up");

        for container in &pod.spec.containers {
            if containers
                .find_pod_container(&pod_full_name, uid, &container.name)
                .is_some()
            {
                debug!(
                    pod = %pod_full_name,
                    container = %container.name,
                    "container is running, skipped"
                );
                continue;
            }

            let dead = recent_containers_with_name_and_uid(
                self.runtime.as_ref(),
                &pod_full_name,
                uid,
                &container.name,
            )
            .await?;
            let latest = dead.first().with_context(|| {
                format!("no previous container for {pod_full_name}--{}", container.name)
            })?;

            op_lxcfs(&self.executor, &container.name, LxcfsOp::Start)
                .await
                .with_context(|| format!("failed to start lxcfs for {}", container.name))?;

            let host_config = HostConfig {
                port_bindings: latest.host_config.port_bindings.clone(),
                binds: latest.host_config.binds.clone(),
                network_mode: format!("container:{net_id}"),
                privileged: latest.host_config.privileged,
                cap_add: latest.host_config.cap_add.clone(),
                cap_drop: latest.host_config.cap_drop.clone(),
            };
            self.runtime
                .start_container(&latest.id, &host_config)
                .await
                .with_context(|| {
                    format!(
                        "start container {pod_full_name}--{} ({})",
                        container.name, latest.id
                    )
                })?;

            let detail = self.runtime.inspect_container(&latest.id).await?;
            self.disk_quota
                .add(detail.state.pid, &container.name, container.disk)
                .await
                .context("failed to set up disk quota")?;
            if pod.res.network.mode == NetworkMode::Sriov {
                self.network_binder
                    .setup_sriov(&latest.id, &pod.res.network.vf_id, &detail.config.cpu_set)
                    .await
                    .context("failed to set up sriov")?;
            }
            if let Some(blkio) = &container.blkio {
                self.blkio
                    .set_up(&latest.id, blkio)
                    .await
                    .context("failed to set up blkio")?;
            }
        }
        Ok(())
    }

    /// Commits a pod's container and pushes the result to the local hub.
    /// Fails up front when the target image already exists.
    pub async fn push_image(&self, params: &PushImageParams) -> anyhow::Result<()> {
        match self.runtime.inspect_image(&params.image).await {
            Ok(_) => bail!("image {} already exists, can't push again", params.image),
            Err(RuntimeError::NoSuchImage { .. }) => {}
            Err(_) => bail!("failed to inspect image {}", params.image),
        }

        let pod_full_name =
            common::full_name_from_parts(&params.pod_id, &params.pod_namespace);
        let pod = self
            .find_bound_pod(&pod_full_name)
            .await
            .with_context(|| format!("can't find pod {pod_full_name}"))?;

        let containers = managed_containers(self.runtime.as_ref(), false).await?;
        let mut container_id = String::new();
        for container in &pod.spec.containers {
            if let Some(found) =
                containers.find_pod_container(&pod_full_name, &pod.metadata.uid, &container.name)
            {
                container_id = found.id.clone();
                break;
            }
            let commit_candidates = recent_containers_with_name_and_uid(
                self.runtime.as_ref(),
                &pod_full_name,
                &pod.metadata.uid,
                &container.name,
            )
            .await
            .with_context(|| {
                format!("error listing recent containers for {pod_full_name}")
            })?;
            match commit_candidates.first() {
                Some(candidate) => {
                    container_id = candidate.id.clone();
                    break;
                }
                None => bail!(
                    "container {}--{}--{} doesn't exist",
                    pod_full_name,
                    pod.metadata.uid,
                    container.name
                ),
            }
        }
        debug!(container_id = %container_id, "committing container");

        let (registry, repo, tag) = libruntime::naming::parse_image_name(&params.image);
        self.runtime
            .commit_container(CommitContainerOptions {
                container: container_id.clone(),
                repository: repo.clone(),
                tag: tag.clone(),
                author: params.author.clone(),
                message: "push custom image".to_string(),
                options: None,
            })
            .await
            .with_context(|| format!("failed to commit container {container_id}"))?;
        info!("commit successful");

        let auth = self.keyring.lookup(&repo).unwrap_or_else(|| {
            info!(repo = %repo, "pushing image without credentials");
            AuthConfiguration::default()
        });
        self.runtime
            .push_image(
                PushImageOptions {
                    name: repo,
                    tag,
                    registry,
                },
                &auth,
            )
            .await
            .context("failed to push image")?;
        info!("push successful");

        self.runtime
            .update_container_config(
                &container_id,
                &[KvPair {
                    key: "image".to_string(),
                    value: params.image.clone(),
                }],
            )
            .await?;
        Ok(())
    }

    /// Applies a new image onto a pod's running containers. `op` is
    /// `pull` (fetch and apply) or `diff` (pull, diff against the current
    /// image, apply the difference).
    pub async fn merge_container(
        &self,
        pod_full_name: &str,
        image: &str,
        op: &str,
    ) -> anyhow::Result<()> {
        let pod = self
            .find_bound_pod(pod_full_name)
            .await
            .with_context(|| format!("can't find pod {pod_full_name}"))?;

        let (_, repo, tag) = libruntime::naming::parse_image_name(image);
        if tag.is_empty() {
            bail!("missing tag: {image}");
        }

        let containers = managed_containers(self.runtime.as_ref(), false).await?;
        for container in &pod.spec.containers {
            let Some(found) =
                containers.find_pod_container(pod_full_name, &pod.metadata.uid, &container.name)
            else {
                continue;
            };
            let detail = self.runtime.inspect_container(&found.id).await?;
            let current = self
                .runtime
                .inspect_image(&detail.config.image)
                .await
                .with_context(|| format!("failed to inspect image {}", detail.config.image))?;

            let opts = MergeImageOptions {
                container: found.id.clone(),
                current_image: current.id.clone(),
                repository: image.to_string(),
            };
            match op {
                "pull" => {
                    let auth = self.keyring.lookup(&repo).unwrap_or_else(|| {
                        info!(repo = %repo, "pulling image without credentials");
                        AuthConfiguration::default()
                    });
                    self.runtime.pull_image_and_apply(opts, &auth).await?;
                }
                "diff" => {
                    self.puller.pull(image).await?;
                    self.runtime.diff_image_and_apply(opts).await?;
                }
                other => bail!("parameter error: op => {other}"),
            }

            let conf = [KvPair {
                key: "image".to_string(),
                value: image.to_string(),
            }];
            debug!(container = %found.id, "updating container config");
            self.runtime
                .update_container_config(&found.id, &conf)
                .await?;
        }
        Ok(())
    }

    /// Online cgroup rewrite for every running container of a pod. When a
    /// cpuset key changes on a sriov pod, IRQ affinity is wired again.
    pub async fn update_pod_cgroup(
        &self,
        pod_full_name: &str,
        pod_config: &PodConfig,
    ) -> anyhow::Result<()> {
        let pod = self
            .find_bound_pod(pod_full_name)
            .await
            .with_context(|| format!("can't find pod {pod_full_name}"))?;
        let containers = managed_containers(self.runtime.as_ref(), false).await?;

        let is_update_cpu = pod_config
            .write_subsystem
            .iter()
            .any(|pair| pair.key.contains("cpuset"));

        for container in &pod.spec.containers {
            let Some(found) =
                containers.find_pod_container(pod_full_name, &pod.metadata.uid, &container.name)
            else {
                continue;
            };
            let resp = self
                .runtime
                .update_container_cgroup(&found.id, &pod_config.write_subsystem)
                .await
                .with_context(|| {
                    format!(
                        "update cgroup on container {pod_full_name}--{} ({})",
                        container.name, found.id
                    )
                })?;
            debug!(
                container = %container.name,
                id = %found.id,
                result = ?resp,
                "updated container cgroup"
            );

            if is_update_cpu && pod.res.network.mode == NetworkMode::Sriov {
                let detail = self.runtime.inspect_container(&found.id).await?;
                self.network_binder
                    .setup_sriov(&found.id, &pod.res.network.vf_id, &detail.config.cpu_set)
                    .await
                    .context("failed to set up sriov")?;
            }
        }
        Ok(())
    }

    /// Online disk-quota resize driven by the `disk_new_size` key.
    pub async fn update_pod_disk(
        &self,
        pod_full_name: &str,
        pod_config: &PodConfig,
    ) -> anyhow::Result<()> {
        let pod = self
            .find_bound_pod(pod_full_name)
            .await
            .with_context(|| format!("can't find pod {pod_full_name}"))?;

        let mut disk: i64 = 0;
        for pair in &pod_config.write_subsystem {
            if pair.key == "disk_new_size" {
                disk = pair.value.parse().unwrap_or_else(|err| {
                    error!(value = %pair.value, "cannot parse disk size: {err}");
                    0
                });
            }
        }
        if disk <= 0 {
            debug!(pod = %pod_full_name, disk, "disk unset, skipping quota update");
            return Ok(());
        }

        for container in &pod.spec.containers {
            self.disk_quota.update_limit(&container.name, disk).await?;
        }
        Ok(())
    }
}
