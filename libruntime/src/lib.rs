//! Client side of the container runtime's REST API, plus the naming scheme
//! and listing helpers the node agent uses to recognize the containers it
//! manages. [`FakeRuntime`] stands in for the real daemon in tests.

pub mod client;
pub mod containers;
pub mod fake;
pub mod naming;
pub mod puller;
pub mod types;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use common::KvPair;
use futures_util::Stream;

pub use client::RuntimeClient;
pub use fake::FakeRuntime;
pub use puller::{ImagePuller, RuntimePuller};
pub use types::*;

pub use common::NETWORK_CONTAINER_NAME;

pub type LogStream = Pin<Box<dyn Stream<Item = Result<Bytes, RuntimeError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("no such container: {id}")]
    NoSuchContainer { id: String },
    #[error("no such image: {name}")]
    NoSuchImage { name: String },
    #[error("no containers found for pod")]
    NoContainersInPod,
    #[error("runtime API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("runtime HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("runtime JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// The subset of the runtime REST surface the control plane drives. The
/// production implementation is [`RuntimeClient`]; tests use
/// [`FakeRuntime`].
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list_containers(&self, all: bool) -> Result<Vec<ApiContainer>, RuntimeError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetail, RuntimeError>;

    async fn create_container(
        &self,
        opts: CreateContainerOptions,
    ) -> Result<ContainerDetail, RuntimeError>;

    /// Starts a created container with its host configuration.
    async fn start_container(
        &self,
        id: &str,
        host_config: &HostConfig,
    ) -> Result<(), RuntimeError>;

    async fn stop_container(&self, id: &str, timeout_secs: u32) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn inspect_image(&self, name: &str) -> Result<Image, RuntimeError>;

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    async fn push_image(
        &self,
        opts: PushImageOptions,
        auth: &AuthConfiguration,
    ) -> Result<(), RuntimeError>;

    async fn import_image(&self, opts: ImportImageOptions) -> Result<(), RuntimeError>;

    async fn commit_container(
        &self,
        opts: CommitContainerOptions,
    ) -> Result<Image, RuntimeError>;

    /// Rewrites recorded container configuration keys
    /// (`/containers/<id>/set`).
    async fn update_container_config(
        &self,
        id: &str,
        pairs: &[KvPair],
    ) -> Result<(), RuntimeError>;

    /// Online cgroup rewrite (`/containers/<id>/cgroup?w=1`).
    async fn update_container_cgroup(
        &self,
        id: &str,
        pairs: &[KvPair],
    ) -> Result<Vec<CgroupResponse>, RuntimeError>;

    /// Pulls `opts.repository` and applies it onto the running container.
    async fn pull_image_and_apply(
        &self,
        opts: MergeImageOptions,
        auth: &AuthConfiguration,
    ) -> Result<(), RuntimeError>;

    /// Applies the difference between the current image and
    /// `opts.repository` onto the running container.
    async fn diff_image_and_apply(&self, opts: MergeImageOptions) -> Result<(), RuntimeError>;

    /// One-shot exec inside a running container; returns combined output.
    async fn exec(&self, id: &str, cmd: &[String]) -> Result<Vec<u8>, RuntimeError>;

    async fn container_logs(
        &self,
        id: &str,
        tail: &str,
        follow: bool,
    ) -> Result<LogStream, RuntimeError>;
}
