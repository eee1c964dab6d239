//! The kubelet core: owns the bound-pod set and reconciles each pod's
//! containers against the runtime.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::Utc;
use common::exec::SystemExecutor;
use common::{BoundPod, Container, Handler, NetworkMode, PodUpdate, RestartPolicy};
use dashmap::DashMap;
use libcgroup::lxcfs::{LxcfsOp, op_lxcfs};
use libcgroup::{BlkioGroup, DiskQuota};
use libnetwork::NetworkBinder;
use libruntime::containers::{
    ManagedContainers, managed_containers, recent_containers_with_name_and_uid,
    runtime_pod_info,
};
use libruntime::naming::build_container_name;
use libruntime::{
    ApiContainer, AuthConfiguration, ContainerConfig, ContainerRuntime, CreateContainerOptions,
    HostConfig, ImagePuller, NETWORK_CONTAINER_NAME, PortBinding, RuntimeError,
};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, info, warn};

use crate::health::{HealthChecker, HealthStatus};
use crate::stats::StatsProvider;
use crate::volume::VolumeMap;
use crate::workers::PodWorkers;

const MIN_SHARES: i64 = 2;
const SHARES_PER_CPU: i64 = 1024;
const MILLI_CPU_TO_CPU: i64 = 1000;

const STOP_TIMEOUT_SECS: u32 = 10;

/// Registry credentials lookup for pushes and merges.
pub trait Keyring: Send + Sync {
    fn lookup(&self, repo: &str) -> Option<AuthConfiguration>;
}

/// Keyring with no credentials; pushes go out unauthenticated.
pub struct EmptyKeyring;

impl Keyring for EmptyKeyring {
    fn lookup(&self, _repo: &str) -> Option<AuthConfiguration> {
        None
    }
}

/// Where a runtime container came from, for event reporting after its pod
/// is gone from the desired set.
#[derive(Debug, Clone)]
pub struct ContainerRef {
    pub pod_full_name: String,
    pub container_name: String,
}

pub struct KubeletDeps {
    pub hostname: String,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub puller: Arc<dyn ImagePuller>,
    pub executor: Arc<dyn SystemExecutor>,
    pub health_checker: Arc<dyn HealthChecker>,
    pub stats: Arc<dyn StatsProvider>,
    pub keyring: Arc<dyn Keyring>,
    pub disk_quota: DiskQuota,
    pub blkio: BlkioGroup,
    pub root_dir: PathBuf,
    pub network_container_image: String,
    pub resync_interval: Duration,
    pub max_container_count: usize,
    pub minimum_gc_age: chrono::Duration,
    pub allow_privileged: bool,
}

pub struct Kubelet {
    pub(crate) hostname: String,
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) puller: Arc<dyn ImagePuller>,
    pub(crate) executor: Arc<dyn SystemExecutor>,
    pub(crate) health_checker: Arc<dyn HealthChecker>,
    pub(crate) stats: Arc<dyn StatsProvider>,
    pub(crate) keyring: Arc<dyn Keyring>,
    pub(crate) root_dir: PathBuf,
    pub(crate) network_container_image: String,
    pub(crate) resync_interval: Duration,
    pub(crate) max_container_count: usize,
    pub(crate) minimum_gc_age: chrono::Duration,
    pub(crate) allow_privileged: bool,

    pub(crate) network_binder: NetworkBinder,
    pub(crate) disk_quota: DiskQuota,
    pub(crate) blkio: BlkioGroup,

    /// Current desired set, replaced by the sync loop.
    pub(crate) pods: RwLock<Vec<BoundPod>>,
    pub(crate) pod_workers: PodWorkers,
    /// Container id → origin, for reporting on containers whose pod has
    /// already been dropped from the desired set.
    pub(crate) container_refs: DashMap<String, ContainerRef>,
    /// Pods seen bound here, retained until teardown bookkeeping runs.
    pub(crate) pod_destroyed: DashMap<String, BoundPod>,
}

impl Kubelet {
    pub fn new(deps: KubeletDeps) -> Arc<Self> {
        Arc::new(Kubelet {
            hostname: deps.hostname,
            network_binder: NetworkBinder::new(deps.executor.clone()),
            disk_quota: deps.disk_quota,
            blkio: deps.blkio,
            runtime: deps.runtime,
            puller: deps.puller,
            executor: deps.executor,
            health_checker: deps.health_checker,
            stats: deps.stats,
            keyring: deps.keyring,
            root_dir: deps.root_dir,
            network_container_image: deps.network_container_image,
            resync_interval: deps.resync_interval,
            max_container_count: deps.max_container_count,
            minimum_gc_age: deps.minimum_gc_age,
            allow_privileged: deps.allow_privileged,
            pods: RwLock::new(Vec::new()),
            pod_workers: PodWorkers::new(),
            container_refs: DashMap::new(),
            pod_destroyed: DashMap::new(),
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Runs the agent's sync loop until the update channel closes.
    pub async fn run(self: &Arc<Self>, updates: mpsc::UnboundedReceiver<PodUpdate>) {
        crate::sync::sync_loop(self.clone(), updates).await;
    }

    pub async fn bound_pods(&self) -> Vec<BoundPod> {
        self.pods.read().await.clone()
    }

    /// Replaces the desired set. Called by the sync loop after it applies
    /// an update event.
    pub async fn set_bound_pods(&self, pods: Vec<BoundPod>) {
        *self.pods.write().await = pods;
    }

    /// The per-pod worker pool (exposed for observability).
    pub fn workers(&self) -> &PodWorkers {
        &self.pod_workers
    }

    pub(crate) async fn find_bound_pod(&self, pod_full_name: &str) -> Option<BoundPod> {
        self.pods
            .read()
            .await
            .iter()
            .find(|pod| pod.full_name() == pod_full_name)
            .cloned()
    }

    /// Runtime-observed state of every container in a pod.
    pub async fn get_pod_info(
        &self,
        pod_full_name: &str,
        uid: &str,
    ) -> Result<common::PodInfo, RuntimeError> {
        runtime_pod_info(self.runtime.as_ref(), pod_full_name, uid).await
    }

    /// One-shot exec in a pod's container.
    pub async fn run_in_container(
        &self,
        pod_full_name: &str,
        uid: &str,
        container_name: &str,
        cmd: &[String],
    ) -> anyhow::Result<Vec<u8>> {
        let containers = managed_containers(self.runtime.as_ref(), false).await?;
        let container = containers
            .find_pod_container(pod_full_name, uid, container_name)
            .with_context(|| format!("container not found ({container_name})"))?;
        Ok(self.runtime.exec(&container.id, cmd).await?)
    }

    /// Streams a container's logs.
    pub async fn container_logs(
        &self,
        pod_full_name: &str,
        container_name: &str,
        tail: &str,
        follow: bool,
    ) -> anyhow::Result<libruntime::LogStream> {
        if let Err(RuntimeError::NoContainersInPod) =
            self.get_pod_info(pod_full_name, "").await
        {
            bail!("pod not found ({pod_full_name})");
        }
        let containers = managed_containers(self.runtime.as_ref(), true).await?;
        let container = containers
            .find_pod_container(pod_full_name, "", container_name)
            .with_context(|| format!("container not found ({container_name})"))?;
        Ok(self
            .runtime
            .container_logs(&container.id, tail, follow)
            .await?)
    }

    pub(crate) fn set_ref(&self, id: &str, pod: &BoundPod, container_name: &str) {
        self.container_refs.insert(
            id.to_string(),
            ContainerRef {
                pod_full_name: pod.full_name(),
                container_name: container_name.to_string(),
            },
        );
    }

    // ---- container lifecycle -------------------------------------------

    /// Runs a lifecycle handler against a started container.
    async fn run_handler(
        &self,
        container_id: &str,
        pod_ip: &str,
        handler: &Handler,
    ) -> anyhow::Result<()> {
        if let Some(exec) = &handler.exec {
            self.runtime.exec(container_id, &exec.command).await?;
            return Ok(());
        }
        if let Some(http_get) = &handler.http_get {
            let host = if !http_get.host.is_empty() {
                http_get.host.as_str()
            } else {
                pod_ip
            };
            let url = format!("http://{}:{}{}", host, http_get.port, http_get.path);
            let resp = reqwest::get(&url).await?;
            if !resp.status().is_success() {
                bail!("handler {url} returned {}", resp.status());
            }
            return Ok(());
        }
        bail!("invalid handler: neither exec nor httpGet set")
    }

    /// Creates and starts one container of a pod, applying lxcfs, the
    /// termination-message bind, resource knobs and post-start wiring.
    /// Returns the runtime container id.
    pub(crate) async fn run_container(
        &self,
        pod: &BoundPod,
        container: &Container,
        volumes: &VolumeMap,
        net_mode: &str,
        pod_ip: &str,
    ) -> anyhow::Result<String> {
        let pod_full_name = pod.full_name();

        if container.name != NETWORK_CONTAINER_NAME {
            op_lxcfs(&self.executor, &container.name, LxcfsOp::Start)
                .await
                .with_context(|| format!("starting lxcfs for {}", container.name))?;
        }

        let env = make_environment_variables(container);
        let mut binds = make_binds(container, volumes);
        let (exposed_ports, port_bindings) = make_ports_and_bindings(container);

        let opts = CreateContainerOptions {
            name: build_container_name(&pod.metadata.uid, &pod_full_name, container),
            config: ContainerConfig {
                hostname: pod.metadata.name.clone(),
                image: container.image.clone(),
                cmd: container.command.clone(),
                env,
                exposed_ports,
                memory: container.memory,
                cpu_shares: milli_cpu_to_shares(container.cpu),
                cpu_set: pod.res.cpu_set.clone(),
                working_dir: container.working_dir.clone(),
            },
        };
        let created = match self.runtime.create_container(opts).await {
            Ok(created) => created,
            Err(err) => {
                error!(
                    pod = %pod_full_name,
                    container = %container.name,
                    "failed to create container: {err}"
                );
                return Err(err.into());
            }
        };
        let id = created.id.clone();
        self.set_ref(&id, pod, &container.name);
        info!(pod = %pod_full_name, container = %container.name, id = %id, "created");

        if !container.termination_message_path.is_empty() {
            match self.termination_log_bind(pod, container, &id).await {
                Ok(bind) => binds.push(bind),
                Err(err) => {
                    error!(
                        container = %container.name,
                        "error creating termination-log file: {err:#}"
                    );
                }
            }
        }

        let privileged = if self.allow_privileged {
            container.privileged
        } else if container.privileged {
            bail!("container requested privileged mode, but it is disallowed globally");
        } else {
            false
        };

        let host_config = HostConfig {
            binds,
            port_bindings,
            network_mode: net_mode.to_string(),
            privileged,
            cap_add: container.cap_add.clone(),
            cap_drop: container.cap_drop.clone(),
        };
        if let Err(err) = self.runtime.start_container(&id, &host_config).await {
            error!(
                pod = %pod_full_name,
                container = %container.name,
                id = %id,
                "failed to start container: {err}"
            );
            return Err(err.into());
        }
        info!(pod = %pod_full_name, container = %container.name, id = %id, "started");

        if let Some(post_start) = container
            .lifecycle
            .as_ref()
            .and_then(|l| l.post_start.as_ref())
        {
            if let Err(err) = self.run_handler(&id, pod_ip, post_start).await {
                self.kill_container_by_id(&id, "").await.ok();
                bail!("failed to call event handler: {err:#}");
            }
        }

        if container.name != NETWORK_CONTAINER_NAME {
            let detail = self.runtime.inspect_container(&id).await?;
            self.disk_quota
                .add(detail.state.pid, &container.name, container.disk)
                .await
                .context("failed to set up disk quota")?;

            if pod.res.network.mode == NetworkMode::Sriov {
                self.network_binder
                    .setup_sriov(&id, &pod.res.network.vf_id, &detail.config.cpu_set)
                    .await
                    .context("failed to set up sriov")?;
            }
            if let Some(blkio) = &container.blkio {
                self.blkio
                    .set_up(&id, blkio)
                    .await
                    .context("failed to set up blkio")?;
            }
        }

        Ok(id)
    }

    async fn termination_log_bind(
        &self,
        pod: &BoundPod,
        container: &Container,
        container_id: &str,
    ) -> anyhow::Result<String> {
        let dir = self.root_dir.join(&pod.metadata.name).join(&container.name);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let log_path = dir.join(container_id);
        tokio::fs::File::create(&log_path)
            .await
            .with_context(|| format!("creating {}", log_path.display()))?;
        Ok(format!(
            "{}:{}",
            log_path.display(),
            container.termination_message_path
        ))
    }

    pub(crate) async fn kill_container(&self, container: &ApiContainer) -> anyhow::Result<()> {
        self.kill_container_by_id(&container.id, container.name())
            .await
    }

    pub(crate) async fn kill_container_by_id(
        &self,
        id: &str,
        name: &str,
    ) -> anyhow::Result<()> {
        info!(id = %id, name = %name, "killing container");

        if let Some(parsed) = libruntime::naming::parse_container_name(name) {
            if parsed.container_name != NETWORK_CONTAINER_NAME {
                let detail = self.runtime.inspect_container(id).await?;
                self.disk_quota
                    .remove(detail.state.pid, &parsed.container_name)
                    .await
                    .context("failed to clean up disk quota")?;
            }
        }

        let result = self.runtime.stop_container(id, STOP_TIMEOUT_SECS).await;
        if name.is_empty() {
            return Ok(result?);
        }

        match self.container_refs.get(id) {
            Some(origin) => info!(
                pod = %origin.pod_full_name,
                container = %origin.container_name,
                id = %id,
                "killed"
            ),
            None => warn!(id = %id, name = %name, "no ref for killed container"),
        }
        Ok(result?)
    }

    /// Kills the spec'd containers of one pod. Returns how many were
    /// running.
    pub(crate) async fn kill_containers_in_pod(
        &self,
        pod: &BoundPod,
        containers: &ManagedContainers,
    ) -> anyhow::Result<usize> {
        let pod_full_name = pod.full_name();
        let mut count = 0;
        let mut errs = Vec::new();
        for container in &pod.spec.containers {
            if let Some(found) =
                containers.find_pod_container(&pod_full_name, &pod.metadata.uid, &container.name)
            {
                count += 1;
                if let Err(err) = self.kill_container(found).await {
                    error!(
                        pod = %pod_full_name,
                        container = %container.name,
                        "failed to delete container: {err:#}"
                    );
                    errs.push(err);
                }
            }
        }
        if !errs.is_empty() {
            bail!("failed to delete {} containers in {pod_full_name}", errs.len());
        }
        Ok(count)
    }

    /// Starts the pod's network sandbox container, pulling the pause
    /// image if needed. The sandbox exports the union of all container
    /// ports.
    pub(crate) async fn create_network_container(
        &self,
        pod: &BoundPod,
    ) -> anyhow::Result<String> {
        let mut ports = Vec::new();
        for container in &pod.spec.containers {
            ports.extend(container.ports.iter().cloned());
        }
        let net_container = Container {
            name: NETWORK_CONTAINER_NAME.to_string(),
            image: self.network_container_image.clone(),
            ports,
            ..Default::default()
        };

        let present = self
            .puller
            .is_image_present(&net_container.image)
            .await
            .with_context(|| format!("failed to inspect image {}", net_container.image))?;
        if !present {
            self.puller
                .pull(&net_container.image)
                .await
                .with_context(|| format!("failed to pull image {}", net_container.image))?;
        }

        self.run_container(pod, &net_container, &VolumeMap::new(), "", "")
            .await
    }

    async fn healthy(
        &self,
        pod_ip: &str,
        container: &Container,
        api: &ApiContainer,
    ) -> HealthStatus {
        let Some(probe) = &container.liveness_probe else {
            return HealthStatus::Healthy;
        };
        // Start-up grace period before probing.
        if Utc::now().timestamp() - api.created < probe.initial_delay_seconds {
            return HealthStatus::Healthy;
        }
        match self
            .health_checker
            .health_check(&api.id, pod_ip, container)
            .await
        {
            Ok(status) => status,
            Err(err) => {
                error!(container = %container.name, "health check errored: {err:#}");
                HealthStatus::Unknown
            }
        }
    }

    /// Whether the restart policy allows recreating a container that has
    /// run before.
    async fn should_recreate(
        &self,
        pod: &BoundPod,
        container: &Container,
        pod_full_name: &str,
    ) -> bool {
        if pod.spec.restart_policy == RestartPolicy::Always {
            return true;
        }
        let recent = match recent_containers_with_name_and_uid(
            self.runtime.as_ref(),
            pod_full_name,
            &pod.metadata.uid,
            &container.name,
        )
        .await
        {
            Ok(recent) => recent,
            Err(err) => {
                error!(
                    pod = %pod_full_name,
                    container = %container.name,
                    "error listing recent containers: {err}"
                );
                Vec::new()
            }
        };
        if recent.is_empty() {
            return true;
        }
        match pod.spec.restart_policy {
            RestartPolicy::Never => {
                debug!(
                    pod = %pod_full_name,
                    container = %container.name,
                    "already ran container, doing nothing"
                );
                false
            }
            RestartPolicy::OnFailure => {
                if recent[0].state.exit_code == 0 {
                    debug!(
                        pod = %pod_full_name,
                        container = %container.name,
                        "already ran container successfully, doing nothing"
                    );
                    false
                } else {
                    true
                }
            }
            RestartPolicy::Always => true,
        }
    }

    /// Obeys the image pull policy before a container (re)creation.
    /// Returns false when the pod should skip this container for the
    /// tick.
    async fn ensure_image(&self, container: &Container, pod_full_name: &str) -> bool {
        if container.image_pull_policy == common::PullPolicy::Never {
            return true;
        }
        let present = match self.puller.is_image_present(&container.image).await {
            Ok(present) => present,
            Err(err) => {
                error!(
                    pod = %pod_full_name,
                    image = %container.image,
                    "failed to inspect image: {err}; skipping container"
                );
                return false;
            }
        };
        let latest = libruntime::naming::require_latest_image(&container.image);
        let must_pull = container.image_pull_policy == common::PullPolicy::Always
            || (container.image_pull_policy == common::PullPolicy::IfNotPresent
                && (!present || latest));
        if must_pull {
            if let Err(err) = self.puller.pull(&container.image).await {
                error!(
                    pod = %pod_full_name,
                    image = %container.image,
                    "failed to pull image: {err}; skipping container"
                );
                return false;
            }
            info!(pod = %pod_full_name, image = %container.image, "pulled image");
        }
        true
    }

    // ---- per-pod reconciliation ----------------------------------------

    /// Reconciles one pod against the runtime. `containers` is the
    /// listing taken at the start of the sync pass.
    pub async fn sync_pod(
        &self,
        pod: &BoundPod,
        containers: ManagedContainers,
    ) -> anyhow::Result<()> {
        if pod.res.network.mode == NetworkMode::Host {
            return self.sync_pod_host_network(pod, containers).await;
        }
        let mut containers = containers;

        let pod_full_name = pod.full_name();
        let uid = &pod.metadata.uid;
        let mut keep: HashSet<String> = HashSet::new();
        let killed: HashSet<String> = HashSet::new();

        // Make sure the pod has a network sandbox.
        let running_net = containers
            .find_pod_container(&pod_full_name, uid, NETWORK_CONTAINER_NAME)
            .map(|net| net.id.clone());
        let net_id = if let Some(net_id) = running_net {
            net_id
        } else {
            let recent = recent_containers_with_name_and_uid(
                self.runtime.as_ref(),
                &pod_full_name,
                uid,
                NETWORK_CONTAINER_NAME,
            )
            .await
            .with_context(|| {
                format!("error listing net containers for {pod_full_name}--{uid}")
            })?;

            if let Some(existing) = recent.first() {
                existing.id.clone()
            } else {
                debug!(pod = %pod_full_name, "network container doesn't exist, re-creating pod");
                let count = self.kill_containers_in_pod(pod, &containers).await?;
                let net_id = self
                    .create_network_container(pod)
                    .await
                    .context("failed to start network container")?;
                if count > 0 {
                    containers = managed_containers(self.runtime.as_ref(), false)
                        .await
                        .context("error listing containers")?;
                }

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
        keep.insert(net_id.clone());

        let volumes = match crate::volume::mount_external_volumes(pod, &self.root_dir).await {
            Ok(volumes) => volumes,
            Err(err) => {
                error!(
                    pod = %pod_full_name,
                    "unable to mount volumes: {err:#}; skipping pod"
                );
                return Err(err);
            }
        };

        let pod_ip = match self.get_pod_info(&pod_full_name, uid).await {
            Ok(info) => info
                .get(NETWORK_CONTAINER_NAME)
                .map(|net| net.pod_ip.clone())
                .unwrap_or_default(),
            Err(_) => {
                warn!(
                    pod = %pod_full_name,
                    "unable to get pod info, health checks may be invalid"
                );
                String::new()
            }
        };

        for container in &pod.spec.containers {
            if let Some(found) =
                containers.find_pod_container(&pod_full_name, uid, &container.name)
            {
                let status = self.healthy(&pod_ip, container, found).await;
                if status == HealthStatus::Healthy {
                    debug!(container = %container.name, id = %found.id, "container is healthy");
                }
                keep.insert(found.id.clone());
                continue;
            }

            if !self.should_recreate(pod, container, &pod_full_name).await {
                continue;
            }
            if !self.ensure_image(container, &pod_full_name).await {
                continue;
            }

            debug!(
                pod = %pod_full_name,
                container = %container.name,
                "container doesn't exist, creating"
            );
            match self
                .run_container(
                    pod,
                    container,
                    &volumes,
                    &format!("container:{net_id}"),
                    &pod_ip,
                )
                .await
            {
                Ok(id) => {
                    keep.insert(id);
                }
                Err(err) => {
                    error!(
                        pod = %pod_full_name,
                        container = %container.name,
                        "error running container: {err:#}"
                    );
                }
            }
        }

        self.kill_unwanted_in_pod(&pod_full_name, uid, &containers, &keep, &killed)
            .await;
        Ok(())
    }

    /// Host-network variant: no sandbox; unhealthy containers are killed
    /// and recreated per restart policy.
    async fn sync_pod_host_network(
        &self,
        pod: &BoundPod,
        containers: ManagedContainers,
    ) -> anyhow::Result<()> {
        let pod_full_name = pod.full_name();
        let uid = &pod.metadata.uid;
        let mut keep: HashSet<String> = HashSet::new();
        let mut killed: HashSet<String> = HashSet::new();

        let volumes = crate::volume::mount_external_volumes(pod, &self.root_dir)
            .await
            .map_err(|err| {
                error!(pod = %pod_full_name, "unable to mount volumes: {err:#}; skipping pod");
                err
            })?;

        for container in &pod.spec.containers {
            if let Some(found) =
                containers.find_pod_container(&pod_full_name, uid, &container.name)
            {
                let id = found.id.clone();
                let recorded_hash = libruntime::naming::parse_container_name(found.name())
                    .map(|parsed| parsed.hash)
                    .unwrap_or(0);
                let expected_hash = libruntime::naming::hash_container(container);
                if recorded_hash == 0 || recorded_hash == expected_hash {
                    let status = self.healthy("", container, found).await;
                    if status != HealthStatus::Unhealthy {
                        keep.insert(id);
                        continue;
                    }
                    info!(
                        pod = %pod_full_name,
                        container = %container.name,
                        "container is unhealthy"
                    );
                } else {
                    debug!(
                        pod = %pod_full_name,
                        container = %container.name,
                        "container spec changed"
                    );
                }
                if let Err(err) = self.kill_container(found).await {
                    warn!(id = %id, "failed to kill container: {err:#}");
                    continue;
                }
                killed.insert(id);
            }

            if !self.should_recreate(pod, container, &pod_full_name).await {
                continue;
            }
            if !self.ensure_image(container, &pod_full_name).await {
                continue;
            }

            match self
                .run_container(pod, container, &volumes, "host", "")
                .await
            {
                Ok(id) => {
                    keep.insert(id);
                }
                Err(err) => {
                    error!(
                        pod = %pod_full_name,
                        container = %container.name,
                        "error running container: {err:#}"
                    );
                }
            }
        }

        self.kill_unwanted_in_pod(&pod_full_name, uid, &containers, &keep, &killed)
            .await;
        Ok(())
    }

    /// Kills this pod's runtime containers that are neither kept nor
    /// already killed (guards against duplicates).
    async fn kill_unwanted_in_pod(
        &self,
        pod_full_name: &str,
        uid: &str,
        containers: &ManagedContainers,
        keep: &HashSet<String>,
        killed: &HashSet<String>,
    ) {
        for container in containers.iter() {
            let Some(parsed) = libruntime::naming::parse_container_name(container.name())
            else {
                continue;
            };
            if parsed.pod_full_name != pod_full_name || parsed.uid != uid {
                continue;
            }
            if keep.contains(&container.id) || killed.contains(&container.id) {
                continue;
            }
            info!(
                pod = %pod_full_name,
                id = %container.id,
                "killing unwanted container in pod"
            );
            if let Err(err) = self.kill_container(container).await {
                error!(id = %container.id, "error killing container: {err:#}");
            }
        }
    }

    /// Per-pod stats distilled from the collector, keyed to the pod's
    /// first live container.
    pub async fn get_pod_stats(
        &self,
        pod_full_name: &str,
    ) -> anyhow::Result<serde_json::Value> {
        let pod = self
            .find_bound_pod(pod_full_name)
            .await
            .with_context(|| format!("can't find pod {pod_full_name}"))?;
        let containers = managed_containers(self.runtime.as_ref(), false).await?;
        for container in &pod.spec.containers {
            if let Some(found) =
                containers.find_pod_container(pod_full_name, &pod.metadata.uid, &container.name)
            {
                return self.stats.container_stats(&found.id).await;
            }
        }
        bail!("no running containers in pod {pod_full_name}")
    }
}

// ---- pure helpers ------------------------------------------------------

pub(crate) fn make_environment_variables(container: &Container) -> Vec<String> {
    container
        .env
        .iter()
        .map(|env| format!("{}={}", env.name, env.value))
        .collect()
}

pub(crate) fn make_binds(container: &Container, volumes: &VolumeMap) -> Vec<String> {
    let mut binds = Vec::new();
    for mount in &container.volume_mounts {
        let Some(volume) = volumes.get(&mount.name) else {
            continue;
        };
        let mut bind = format!("{}:{}", volume.path().display(), mount.mount_path);
        if mount.read_only {
            bind.push_str(":ro");
        }
        binds.push(bind);
    }
    binds
}

pub(crate) fn make_ports_and_bindings(
    container: &Container,
) -> (
    HashMap<String, serde_json::Value>,
    HashMap<String, Vec<PortBinding>>,
) {
    let mut exposed = HashMap::new();
    let mut bindings = HashMap::new();
    for port in &container.ports {
        // No binding when HostPort is unset.
        if port.host_port == 0 {
            continue;
        }
        let protocol = match port.protocol.to_uppercase().as_str() {
            "UDP" => "/udp",
            "TCP" => "/tcp",
            other => {
                warn!(protocol = %other, "unknown protocol, defaulting to TCP");
                "/tcp"
            }
        };
        let key = format!("{}{}", port.container_port, protocol);
        exposed.insert(key.clone(), serde_json::json!({}));
        bindings.insert(
            key,
            vec![PortBinding {
                host_ip: port.host_ip.clone(),
                host_port: port.host_port.to_string(),
            }],
        );
    }
    (exposed, bindings)
}

pub(crate) fn milli_cpu_to_shares(milli_cpu: i64) -> i64 {
    if milli_cpu == 0 {
        // Unset: let the kernel default apply.
        return 0;
    }
    let shares = (milli_cpu * SHARES_PER_CPU) / MILLI_CPU_TO_CPU;
    shares.max(MIN_SHARES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{EnvVar, Port, VolumeMount};

    #[test]
    fn shares_scale_and_clamp() {
        assert_eq!(milli_cpu_to_shares(0), 0);
        assert_eq!(milli_cpu_to_shares(1), MIN_SHARES);
        assert_eq!(milli_cpu_to_shares(1000), 1024);
        assert_eq!(milli_cpu_to_shares(2500), 2560);
    }

    #[test]
    fn env_pairs_keep_order() {
        let container = Container {
            env: vec![
                EnvVar {
                    name: "A".to_string(),
                    value: "1".to_string(),
                },
                EnvVar {
                    name: "B".to_string(),
                    value: "2".to_string(),
                },
            ],
            ..Default::default()
        };
        assert_eq!(
            make_environment_variables(&container),
            vec!["A=1".to_string(), "B=2".to_string()]
        );
    }

    #[tokio::test]
    async fn binds_skip_unknown_volumes_and_mark_read_only() {
        let container = Container {
            volume_mounts: vec![
                VolumeMount {
                    name: "data".to_string(),
                    mount_path: "/data".to_string(),
                    read_only: true,
                },
                VolumeMount {
                    name: "missing".to_string(),
                    mount_path: "/missing".to_string(),
                    read_only: false,
                },
            ],
            ..Default::default()
        };
        let mut volumes = VolumeMap::new();
        let dir = tempfile::tempdir().unwrap();
        let pod = BoundPod {
            spec: common::PodSpec {
                volumes: vec![common::Volume {
                    name: "data".to_string(),
                    source: Some(common::VolumeSource {
                        host_dir: Some(common::HostDir {
                            path: dir.path().display().to_string(),
                        }),
                        ..Default::default()
                    }),
                }],
                ..Default::default()
            },
            ..Default::default()
        };
        let built = crate::volume::mount_external_volumes(&pod, dir.path())
            .await
            .unwrap();
        volumes.extend(built);

        let binds = make_binds(&container, &volumes);
        assert_eq!(binds, vec![format!("{}:/data:ro", dir.path().display())]);
    }

    #[test]
    fn port_bindings_skip_zero_host_port_and_default_tcp() {
        let container = Container {
            ports: vec![
                Port {
                    container_port: 80,
                    host_port: 8080,
                    host_ip: "1.2.3.4".to_string(),
                    protocol: "weird".to_string(),
                    ..Default::default()
                },
                Port {
                    container_port: 53,
                    host_port: 5353,
                    protocol: "udp".to_string(),
                    ..Default::default()
                },
                Port {
                    container_port: 9090,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let (exposed, bindings) = make_ports_and_bindings(&container);
        assert_eq!(exposed.len(), 2);
        assert!(exposed.contains_key("80/tcp"));
        assert!(exposed.contains_key("53/udp"));
        assert_eq!(bindings["80/tcp"][0].host_port, "8080");
        assert_eq!(bindings["80/tcp"][0].host_ip, "1.2.3.4");
        assert!(!bindings.contains_key("9090/tcp"));
    }
}
