//! HTTP client for the container runtime daemon.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use common::KvPair;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::types::*;
use crate::{ContainerRuntime, LogStream, RuntimeError};

pub struct RuntimeClient {
    base: String,
    http: reqwest::Client,
}

impl RuntimeClient {
    /// `endpoint` is the daemon address, e.g. `http://127.0.0.1:2375`.
    pub fn new(endpoint: &str) -> Self {
        RuntimeClient {
            base: endpoint.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R, RuntimeError> {
        debug!(path, "runtime GET");
        let resp = self.http.get(self.url(path)).send().await?;
        Self::read_json(resp).await
    }

    async fn post(
        &self,
        path: &str,
        body: Option<serde_json::Value>,
        auth: Option<&AuthConfiguration>,
    ) -> Result<(StatusCode, bytes::Bytes), RuntimeError> {
        debug!(path, "runtime POST");
        let mut req = self.http.post(self.url(path));
        if let Some(body) = body {
            req = req.json(&body);
        }
        if let Some(auth) = auth {
            let encoded = URL_SAFE.encode(serde_json::to_vec(auth)?);
            req = req.header("X-Registry-Auth", encoded);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        Ok((status, bytes))
    }

    async fn read_json<R: DeserializeOwned>(resp: reqwest::Response) -> Result<R, RuntimeError> {
        let status = resp.status();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            return Err(RuntimeError::Api {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn check(status: StatusCode, body: &[u8]) -> Result<(), RuntimeError> {
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            Ok(())
        } else {
            Err(RuntimeError::Api {
                status: status.as_u16(),
                message: String::from_utf8_lossy(body).into_owned(),
            })
        }
    }
}

fn container_not_found(err: RuntimeError, id: &str) -> RuntimeError {
    match err {
        RuntimeError::Api { status: 404, .. } => RuntimeError::NoSuchContainer {
            id: id.to_string(),
        },
        other => other,
    }
}

fn image_not_found(err: RuntimeError, name: &str) -> RuntimeError {
    match err {
        RuntimeError::Api { status: 404, .. } => RuntimeError::NoSuchImage {
            name: name.to_string(),
        },
        other => other,
    }
}

#[async_trait]
impl ContainerRuntime for RuntimeClient {
    async fn list_containers(&self, all: bool) -> Result<Vec<ApiContainer>, RuntimeError> {
        let all = if all { 1 } else { 0 };
        self.get_json(&format!("/containers/json?all={all}")).await
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetail, RuntimeError> {
        self.get_json(&format!("/containers/{id}/json"))
            .await
            .map_err(|e| container_not_found(e, id))
    }

    async fn create_container(
        &self,
        opts: CreateContainerOptions,
    ) -> Result<ContainerDetail, RuntimeError> {
        let path = format!("/containers/create?name={}", opts.name);
        let (status, body) = self
            .post(&path, Some(serde_json::to_value(&opts.config)?), None)
            .await?;
        Self::check(status, &body).map_err(|e| image_not_found(e, &opts.config.image))?;
        #[derive(serde::Deserialize)]
        struct Created {
            #[serde(rename = "Id")]
            id: String,
        }
        let created: Created = serde_json::from_slice(&body)?;
        self.inspect_container(&created.id).await
    }

    async fn start_container(
        &self,
        id: &str,
        host_config: &HostConfig,
    ) -> Result<(), RuntimeError> {
        let (status, body) = self
            .post(
                &format!("/containers/{id}/start"),
                Some(serde_json::to_value(host_config)?),
                None,
            )
            .await?;
        Self::check(status, &body).map_err(|e| container_not_found(e, id))
    }

    async fn stop_container(&self, id: &str, timeout_secs: u32) -> Result<(), RuntimeError> {
        let (status, body) = self
            .post(&format!("/containers/{id}/stop?t={timeout_secs}"), None, None)
            .await?;
        Self::check(status, &body).map_err(|e| container_not_found(e, id))
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let resp = self
            .http
            .delete(self.url(&format!("/containers/{id}")))
            .send()
            .await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        Self::check(status, &body).map_err(|e| container_not_found(e, id))
    }

    async fn inspect_image(&self, name: &str) -> Result<Image, RuntimeError> {
        self.get_json(&format!("/images/{name}/json"))
            .await
            .map_err(|e| image_not_found(e, name))
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let (_, repo, tag) = crate::naming::parse_image_name(image);
        let (status, body) = self
            .post(
                &format!("/images/create?fromImage={repo}&tag={tag}"),
                None,
                None,
            )
            .await?;
        Self::check(status, &body).map_err(|e| image_not_found(e, image))
    }

    async fn push_image(
        &self,
        opts: PushImageOptions,
        auth: &AuthConfiguration,
    ) -> Result<(), RuntimeError> {
        if opts.name.is_empty() {
            return Err(RuntimeError::NoSuchImage {
                name: String::new(),
            });
        }
        let path = format!(
            "/images/{}/push?tag={}&registry={}",
            opts.name, opts.tag, opts.registry
        );
        let (status, body) = self.post(&path, None, Some(auth)).await?;
        Self::check(status, &body).map_err(|e| image_not_found(e, &opts.name))
    }

    async fn import_image(&self, opts: ImportImageOptions) -> Result<(), RuntimeError> {
        if opts.repository.is_empty() {
            return Err(RuntimeError::NoSuchImage {
                name: String::new(),
            });
        }
        // The source tarball must be readable before anything is sent.
        let payload = tokio::fs::read(&opts.source).await?;
        let path = format!(
            "/images/create?fromSrc=-&repo={}&tag={}",
            opts.repository, opts.tag
        );
        let resp = self.http.post(self.url(&path)).body(payload).send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        Self::check(status, &body)
    }

    async fn commit_container(
        &self,
        opts: CommitContainerOptions,
    ) -> Result<Image, RuntimeError> {
        let path = format!(
            "/commit?container={}&repo={}&tag={}&m={}&author={}",
            opts.container, opts.repository, opts.tag, opts.message, opts.author
        );
        // The daemon reads commit filters from a changeOptions wrapper.
        let body = serde_json::json!({ "changeOptions": opts.options });
        let (status, bytes) = self.post(&path, Some(body), None).await?;
        Self::check(status, &bytes).map_err(|e| container_not_found(e, &opts.container))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn update_container_config(
        &self,
        id: &str,
        pairs: &[KvPair],
    ) -> Result<(), RuntimeError> {
        let body = serde_json::json!({ "config": pairs });
        let (status, bytes) = self
            .post(&format!("/containers/{id}/set?"), Some(body), None)
            .await?;
        Self::check(status, &bytes).map_err(|e| container_not_found(e, id))?;

        #[derive(serde::Deserialize)]
        struct SetResult {
            #[serde(rename = "Key", default)]
            key: String,
            #[serde(rename = "Err", default)]
            err: String,
            #[serde(rename = "Status", default)]
            status: i32,
        }
        let results: Vec<SetResult> = serde_json::from_slice(&bytes)?;
        let failed: Vec<String> = results
            .iter()
            .filter(|r| r.status > 0)
            .map(|r| format!("update {} err:{}", r.key, r.err))
            .collect();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(RuntimeError::Api {
                status: 500,
                message: failed.join(";"),
            })
        }
    }

    async fn update_container_cgroup(
        &self,
        id: &str,
        pairs: &[KvPair],
    ) -> Result<Vec<CgroupResponse>, RuntimeError> {
        let body = serde_json::json!({ "WriteSubsystem": pairs });
        let (status, bytes) = self
            .post(&format!("/containers/{id}/cgroup?w=1"), Some(body), None)
            .await?;
        Self::check(status, &bytes).map_err(|e| container_not_found(e, id))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn pull_image_and_apply(
        &self,
        opts: MergeImageOptions,
        auth: &AuthConfiguration,
    ) -> Result<(), RuntimeError> {
        if opts.repository.is_empty() {
            return Err(RuntimeError::NoSuchImage {
                name: String::new(),
            });
        }
        let path = format!(
            "/images/applypull?container={}&currentImage={}&fromImage={}",
            opts.container, opts.current_image, opts.repository
        );
        let (status, body) = self.post(&path, None, Some(auth)).await?;
        Self::check(status, &body)
    }

    async fn diff_image_and_apply(&self, opts: MergeImageOptions) -> Result<(), RuntimeError> {
        if opts.repository.is_empty() {
            return Err(RuntimeError::NoSuchImage {
                name: String::new(),
            });
        }
        let path = format!(
            "/images/applydiff?container={}&currentImage={}&fromImage={}",
            opts.container, opts.current_image, opts.repository
        );
        let (status, body) = self.post(&path, None, None).await?;
        Self::check(status, &body)
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<Vec<u8>, RuntimeError> {
        let body = serde_json::json!({
            "AttachStdout": true,
            "AttachStderr": true,
            "Cmd": cmd,
        });
        let (status, bytes) = self
            .post(&format!("/containers/{id}/exec"), Some(body), None)
            .await?;
        Self::check(status, &bytes).map_err(|e| container_not_found(e, id))?;
        #[derive(serde::Deserialize)]
        struct ExecCreated {
            #[serde(rename = "Id")]
            id: String,
        }
        let created: ExecCreated = serde_json::from_slice(&bytes)?;

        let (status, out) = self
            .post(
                &format!("/exec/{}/start", created.id),
                Some(serde_json::json!({ "Detach": false })),
                None,
            )
            .await?;
        Self::check(status, &out)?;
        Ok(out.to_vec())
    }

    async fn container_logs(
        &self,
        id: &str,
        tail: &str,
        follow: bool,
    ) -> Result<LogStream, RuntimeError> {
        let tail = if tail.is_empty() { "all" } else { tail };
        let follow = if follow { 1 } else { 0 };
        let path = format!(
            "/containers/{id}/logs?stdout=1&stderr=1&tail={tail}&follow={follow}"
        );
        let resp = self.http.get(self.url(&path)).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.bytes().await?;
            return Err(container_not_found(
                RuntimeError::Api {
                    status: status.as_u16(),
                    message: String::from_utf8_lossy(&body).into_owned(),
                },
                id,
            ));
        }
        Ok(Box::pin(resp.bytes_stream().map(|r| r.map_err(RuntimeError::Http))))
    }
}
