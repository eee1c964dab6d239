//! In-memory [`ContainerRuntime`] used by agent and scheduler tests. Keeps
//! a call log so tests can assert on the exact sequence of runtime
//! operations a code path issued.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use common::KvPair;
use futures_util::stream;

use crate::types::*;
use crate::{ContainerRuntime, LogStream, RuntimeError};

#[derive(Debug, Clone)]
struct FakeContainer {
    api: ApiContainer,
    detail: ContainerDetail,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<String>,
    containers: Vec<FakeContainer>,
    images: HashSet<String>,
    pulled: Vec<String>,
    stopped: Vec<String>,
    removed: Vec<String>,
    created_names: Vec<String>,
    committed: Vec<String>,
    config_updates: Vec<(String, Vec<KvPair>)>,
    cgroup_updates: Vec<(String, Vec<KvPair>)>,
    merges: Vec<(String, String)>,
    execs: Vec<(String, Vec<String>)>,
    errors: HashMap<String, String>,
    next_id: u64,
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        FakeRuntime::default()
    }

    fn record(&self, call: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call.to_string());
        if let Some(message) = state.errors.get(call) {
            return Err(RuntimeError::Api {
                status: 500,
                message: message.clone(),
            });
        }
        Ok(())
    }

    /// Makes every future `method` call fail with `message`.
    pub fn set_fail(&self, method: &str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .errors
            .insert(method.to_string(), message.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn add_image(&self, name: &str) {
        self.state.lock().unwrap().images.insert(name.to_string());
    }

    pub fn has_image(&self, name: &str) -> bool {
        self.state.lock().unwrap().images.contains(name)
    }

    pub fn pulled(&self) -> Vec<String> {
        self.state.lock().unwrap().pulled.clone()
    }

    /// Seeds a container. `name` is the full runtime name (without the
    /// leading slash); returns the assigned id.
    pub fn add_container(
        &self,
        name: &str,
        running: bool,
        exit_code: i32,
        created_unix: i64,
    ) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        let api = ApiContainer {
            id: id.clone(),
            names: vec![format!("/{name}")],
            created: created_unix,
            ..Default::default()
        };
        let detail = ContainerDetail {
            id: id.clone(),
            name: format!("/{name}"),
            created: chrono::DateTime::from_timestamp(created_unix, 0),
            state: ContainerState {
                running,
                pid: 100 + state.next_id as i32,
                exit_code,
                finished_at: if running {
                    None
                } else {
                    chrono::DateTime::from_timestamp(created_unix + 1, 0)
                },
                ..Default::default()
            },
            ..Default::default()
        };
        state.containers.push(FakeContainer { api, detail });
        id
    }

    pub fn set_cpu_set(&self, id: &str, cpu_set: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.containers.iter_mut().find(|c| c.detail.id == id) {
            c.detail.config.cpu_set = cpu_set.to_string();
        }
    }

    pub fn set_finished_at(&self, id: &str, finished_at: chrono::DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.containers.iter_mut().find(|c| c.detail.id == id) {
            c.detail.state.finished_at = Some(finished_at);
        }
    }

    pub fn set_ip_address(&self, id: &str, ip: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.containers.iter_mut().find(|c| c.detail.id == id) {
            c.detail.network_settings.ip_address = ip.to_string();
        }
    }

    pub fn running_names(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .iter()
            .filter(|c| c.detail.state.running)
            .map(|c| c.api.name().to_string())
            .collect()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.state.lock().unwrap().stopped.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn created_names(&self) -> Vec<String> {
        self.state.lock().unwrap().created_names.clone()
    }

    pub fn committed(&self) -> Vec<String> {
        self.state.lock().unwrap().committed.clone()
    }

    pub fn config_updates(&self) -> Vec<(String, Vec<KvPair>)> {
        self.state.lock().unwrap().config_updates.clone()
    }

    pub fn cgroup_updates(&self) -> Vec<(String, Vec<KvPair>)> {
        self.state.lock().unwrap().cgroup_updates.clone()
    }

    pub fn merges(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().merges.clone()
    }

    pub fn execs(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().unwrap().execs.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(&self, all: bool) -> Result<Vec<ApiContainer>, RuntimeError> {
        self.record("list")?;
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .filter(|c| all || c.detail.state.running)
            .map(|c| c.api.clone())
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetail, RuntimeError> {
        self.record("inspect_container")?;
        let state = self.state.lock().unwrap();
        state
            .containers
            .iter()
            .find(|c| c.detail.id == id)
            .map(|c| c.detail.clone())
            .ok_or_else(|| RuntimeError::NoSuchContainer { id: id.to_string() })
    }

    async fn create_container(
        &self,
        opts: CreateContainerOptions,
    ) -> Result<ContainerDetail, RuntimeError> {
        self.record("create")?;
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        let api = ApiContainer {
            id: id.clone(),
            names: vec![format!("/{}", opts.name)],
            image: opts.config.image.clone(),
            created: Utc::now().timestamp(),
            ..Default::default()
        };
        let detail = ContainerDetail {
            id: id.clone(),
            name: format!("/{}", opts.name),
            created: Some(Utc::now()),
            config: opts.config,
            state: ContainerState {
                pid: 100 + state.next_id as i32,
                ..Default::default()
            },
            ..Default::default()
        };
        state.created_names.push(opts.name);
        state.containers.push(FakeContainer { api, detail });
        Ok(state.containers.last().unwrap().detail.clone())
    }

    async fn start_container(
        &self,
        id: &str,
        host_config: &HostConfig,
    ) -> Result<(), RuntimeError> {
        self.record("start")?;
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .iter_mut()
            .find(|c| c.detail.id == id)
            .ok_or_else(|| RuntimeError::NoSuchContainer { id: id.to_string() })?;
        container.detail.state.running = true;
        container.detail.state.started_at = Some(Utc::now());
        container.detail.host_config = host_config.clone();
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout_secs: u32) -> Result<(), RuntimeError> {
        self.record("stop")?;
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .iter_mut()
            .find(|c| c.detail.id == id)
            .ok_or_else(|| RuntimeError::NoSuchContainer { id: id.to_string() })?;
        container.detail.state.running = false;
        container.detail.state.finished_at = Some(Utc::now());
        state.stopped.push(id.to_string());
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.record("remove")?;
        let mut state = self.state.lock().unwrap();
        let before = state.containers.len();
        state.containers.retain(|c| c.detail.id != id);
        if state.containers.len() == before {
            return Err(RuntimeError::NoSuchContainer { id: id.to_string() });
        }
        state.removed.push(id.to_string());
        Ok(())
    }

    async fn inspect_image(&self, name: &str) -> Result<Image, RuntimeError> {
        self.record("inspect_image")?;
        let state = self.state.lock().unwrap();
        if state.images.contains(name) {
            Ok(Image {
                id: name.to_string(),
                ..Default::default()
            })
        } else {
            Err(RuntimeError::NoSuchImage {
                name: name.to_string(),
            })
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.record("pull")?;
        let mut state = self.state.lock().unwrap();
        state.pulled.push(image.to_string());
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn push_image(
        &self,
        opts: PushImageOptions,
        _auth: &AuthConfiguration,
    ) -> Result<(), RuntimeError> {
        self.record("push")?;
        let mut state = self.state.lock().unwrap();
        state.pulled.push(format!("push:{}", opts.name));
        Ok(())
    }

    async fn import_image(&self, opts: ImportImageOptions) -> Result<(), RuntimeError> {
        self.record("import")?;
        let mut state = self.state.lock().unwrap();
        state.images.insert(opts.repository);
        Ok(())
    }

    async fn commit_container(
        &self,
        opts: CommitContainerOptions,
    ) -> Result<Image, RuntimeError> {
        self.record("commit")?;
        let mut state = self.state.lock().unwrap();
        state.committed.push(opts.container.clone());
        Ok(Image {
            id: format!("committed-{}", opts.container),
            ..Default::default()
        })
    }

    async fn update_container_config(
        &self,
        id: &str,
        pairs: &[KvPair],
    ) -> Result<(), RuntimeError> {
        self.record("update_config")?;
        self.state
            .lock()
            .unwrap()
            .config_updates
            .push((id.to_string(), pairs.to_vec()));
        Ok(())
    }

    async fn update_container_cgroup(
        &self,
        id: &str,
        pairs: &[KvPair],
    ) -> Result<Vec<CgroupResponse>, RuntimeError> {
        self.record("update_cgroup")?;
        self.state
            .lock()
            .unwrap()
            .cgroup_updates
            .push((id.to_string(), pairs.to_vec()));
        Ok(Vec::new())
    }

    async fn pull_image_and_apply(
        &self,
        opts: MergeImageOptions,
        _auth: &AuthConfiguration,
    ) -> Result<(), RuntimeError> {
        self.record("merge_pull")?;
        self.state
            .lock()
            .unwrap()
            .merges
            .push(("pull".to_string(), opts.repository));
        Ok(())
    }

    async fn diff_image_and_apply(&self, opts: MergeImageOptions) -> Result<(), RuntimeError> {
        self.record("merge_diff")?;
        self.state
            .lock()
            .unwrap()
            .merges
            .push(("diff".to_string(), opts.repository));
        Ok(())
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<Vec<u8>, RuntimeError> {
        self.record("exec")?;
        self.state
            .lock()
            .unwrap()
            .execs
            .push((id.to_string(), cmd.to_vec()));
        Ok(b"ok".to_vec())
    }

    async fn container_logs(
        &self,
        _id: &str,
        _tail: &str,
        _follow: bool,
    ) -> Result<LogStream, RuntimeError> {
        self.record("logs")?;
        let chunk = bytes::Bytes::from_static(b"fake logs\n");
        Ok(Box::pin(stream::iter(vec![Ok(chunk)])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::{managed_containers, recent_containers_with_name_and_uid};
    use crate::naming::build_container_name;

    fn named(uid: &str, full: &str, container: &str) -> String {
        build_container_name(
            uid,
            full,
            &common::Container {
                name: container.to_string(),
                image: "busybox".to_string(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn find_pod_container_matches_identity() {
        let rt = FakeRuntime::new();
        rt.add_container(&named("u1", "web.prod.etcd", "net"), true, 0, 10);
        rt.add_container(&named("u1", "web.prod.etcd", "app"), true, 0, 11);
        rt.add_container("unmanaged", true, 0, 12);

        let managed = managed_containers(&rt, false).await.unwrap();
        assert_eq!(managed.len(), 2);
        assert!(managed.find_pod_container("web.prod.etcd", "u1", "net").is_some());
        assert!(managed.find_pod_container("web.prod.etcd", "u2", "net").is_none());
        assert!(managed.find_pod_container("web.prod.etcd", "", "app").is_some());
    }

    #[tokio::test]
    async fn recent_containers_sorted_newest_first() {
        let rt = FakeRuntime::new();
        rt.add_container(&named("u1", "web.prod.etcd", "app"), false, 1, 100);
        rt.add_container(&named("u1", "web.prod.etcd", "app"), false, 0, 200);

        let recent = recent_containers_with_name_and_uid(&rt, "web.prod.etcd", "u1", "app")
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].created > recent[1].created);
        assert_eq!(recent[0].state.exit_code, 0);
    }

    #[tokio::test]
    async fn pod_info_reports_newest_generation() {
        let rt = FakeRuntime::new();
        rt.add_container(&named("u1", "web.prod.etcd", "net"), true, 0, 50);
        rt.add_container(&named("u1", "web.prod.etcd", "app"), false, 3, 10);
        rt.add_container(&named("u1", "web.prod.etcd", "app"), true, 0, 20);

        let info = crate::containers::runtime_pod_info(&rt, "web.prod.etcd", "u1")
            .await
            .unwrap();
        assert!(info["net"].state.running.is_some());
        assert!(info["app"].state.running.is_some());
    }

    #[tokio::test]
    async fn injected_errors_surface() {
        let rt = FakeRuntime::new();
        rt.set_fail("list", "daemon down");
        let err = rt.list_containers(true).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Api { status: 500, .. }));
    }
}
