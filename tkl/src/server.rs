//! The agent HTTP surface. Operation endpoints always answer 200 with a
//! `{op, code, errorMsg}` envelope; errors ride in the body.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use common::{
    BoundPod, BoundPods, Container, ObjectMeta, PodConfig, PodOpResult, PodOperation, PodSpec,
    PodUpdate, PushImageParams, RestartPolicy, Volume, full_name_from_parts,
};
use libruntime::RuntimeError;
use libruntime::containers::managed_containers;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::kubelet::Kubelet;

const LOG_ROOT: &str = "/var/log";

#[derive(Clone)]
pub struct AppState {
    pub kubelet: Arc<Kubelet>,
    pub updates: mpsc::UnboundedSender<PodUpdate>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handle_healthz))
        .route("/boundPods", get(handle_bound_pods))
        .route("/podInfo", get(handle_pod_info))
        .route("/stats/", get(handle_machine_stats))
        .route("/stats/*rest", get(handle_stats))
        .route("/spec/", get(handle_spec))
        .route("/logs/", get(handle_logs_root))
        .route("/logs/*path", get(handle_logs))
        .route("/containerLogs/:ns/:pod/:container", get(handle_container_logs))
        .route("/podOp", post(handle_pod_op))
        .route("/image/push", post(handle_image_push))
        .route("/podUpgrade/:kind", post(handle_pod_upgrade))
        .route("/run/*rest", post(handle_run))
        .route("/container", post(handle_container))
        .route("/containers", post(handle_containers))
        .with_state(state)
}

/// Binds and serves until the process exits.
pub async fn serve(
    address: &str,
    port: u16,
    kubelet: Arc<Kubelet>,
    updates: mpsc::UnboundedSender<PodUpdate>,
) -> anyhow::Result<()> {
    let state = AppState { kubelet, updates };
    let listener = tokio::net::TcpListener::bind(format!("{address}:{port}")).await?;
    info!(address, port, "agent server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn internal_error(err: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Internal Error: {err}"),
    )
        .into_response()
}

async fn handle_healthz() -> &'static str {
    "ok"
}

async fn handle_bound_pods(State(state): State<AppState>) -> Response {
    let items = state.kubelet.bound_pods().await;
    axum::Json(BoundPods { items }).into_response()
}

async fn handle_pod_info(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let pod_id = params.get("podID").cloned().unwrap_or_default();
    let uid = params.get("UUID").cloned().unwrap_or_default();
    let namespace = params.get("podNamespace").cloned().unwrap_or_default();
    if pod_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing 'podID=' query entry.").into_response();
    }
    if namespace.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing 'podNamespace=' query entry.")
            .into_response();
    }

    let pod_full_name = full_name_from_parts(&pod_id, &namespace);
    match state.kubelet.get_pod_info(&pod_full_name, &uid).await {
        Ok(info) => axum::Json(info).into_response(),
        Err(RuntimeError::NoContainersInPod) => {
            (StatusCode::NOT_FOUND, "pod does not exist").into_response()
        }
        Err(err) => internal_error(err),
    }
}

async fn handle_machine_stats(State(state): State<AppState>) -> Response {
    match state.kubelet.stats.machine_stats().await {
        Ok(stats) => axum::Json(stats).into_response(),
        Err(err) => internal_error(err),
    }
}

async fn container_stats_response(
    state: &AppState,
    pod_full_name: &str,
    uid: &str,
    container_name: &str,
) -> Response {
    let containers = match managed_containers(state.kubelet.runtime.as_ref(), false).await {
        Ok(containers) => containers,
        Err(err) => return internal_error(err),
    };
    let Some(found) = containers.find_pod_container(pod_full_name, uid, container_name) else {
        return (
            StatusCode::NOT_FOUND,
            format!("container not found ({container_name})"),
        )
            .into_response();
    };
    match state.kubelet.stats.container_stats(&found.id).await {
        Ok(stats) => axum::Json(stats).into_response(),
        Err(err) => internal_error(err),
    }
}

/// 1/2/3/4 path components: machine, pod, pod+container, full identity.
async fn handle_stats(
    State(state): State<AppState>,
    AxumPath(rest): AxumPath<String>,
) -> Response {
    let components: Vec<&str> = rest.split('/').filter(|c| !c.is_empty()).collect();
    match components.as_slice() {
        [] => handle_machine_stats(State(state)).await,
        [pod_id] => {
            let pod_full_name = full_name_from_parts(pod_id, "default");
            match state.kubelet.get_pod_stats(&pod_full_name).await {
                Ok(stats) => axum::Json(stats).into_response(),
                Err(err) => internal_error(err),
            }
        }
        [pod_id, container] => {
            let pod_full_name = full_name_from_parts(pod_id, "default");
            container_stats_response(&state, &pod_full_name, "", container).await
        }
        [namespace, pod_id, uid, container] => {
            let pod_full_name = full_name_from_parts(pod_id, namespace);
            container_stats_response(&state, &pod_full_name, uid, container).await
        }
        _ => (StatusCode::NOT_FOUND, "unknown resource").into_response(),
    }
}

async fn handle_spec(State(state): State<AppState>) -> Response {
    match state.kubelet.stats.machine_info().await {
        Ok(info) => axum::Json(info).into_response(),
        Err(err) => internal_error(err),
    }
}

fn safe_log_path(relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(Path::new(LOG_ROOT).join(relative))
}

async fn serve_log_path(path: PathBuf) -> Response {
    if path.is_dir() {
        let mut names = Vec::new();
        match tokio::fs::read_dir(&path).await {
            Ok(mut entries) => {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
            Err(err) => return internal_error(err),
        }
        names.sort();
        return names.join("\n").into_response();
    }
    match tokio::fs::read(&path).await {
        Ok(bytes) => bytes.into_response(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            (StatusCode::NOT_FOUND, "not found").into_response()
        }
        Err(err) => internal_error(err),
    }
}

async fn handle_logs_root() -> Response {
    serve_log_path(PathBuf::from(LOG_ROOT)).await
}

async fn handle_logs(AxumPath(path): AxumPath<String>) -> Response {
    match safe_log_path(&path) {
        Some(path) => serve_log_path(path).await,
        None => (StatusCode::BAD_REQUEST, "invalid log path").into_response(),
    }
}

async fn handle_container_logs(
    State(state): State<AppState>,
    AxumPath((namespace, pod_id, container)): AxumPath<(String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let follow = params
        .get("follow")
        .is_some_and(|v| v.parse().unwrap_or(false));
    let tail = params.get("tail").cloned().unwrap_or_default();

    let pod_full_name = full_name_from_parts(&pod_id, &namespace);
    match state
        .kubelet
        .container_logs(&pod_full_name, &container, &tail, follow)
        .await
    {
        Ok(stream) => Body::from_stream(stream).into_response(),
        Err(err) => internal_error(err),
    }
}

async fn handle_pod_op(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let pod_id = params.get("podID").cloned().unwrap_or_default();
    let op = params.get("op").cloned().unwrap_or_default();
    let namespace = params.get("podNamespace").cloned().unwrap_or_default();
    if pod_id.is_empty() || op.is_empty() || namespace.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            "Missing 'podID=', 'op=' or 'podNamespace=' query entry.",
        )
            .into_response();
    }

    let pod_full_name = full_name_from_parts(&pod_id, &namespace);
    let result = match state.kubelet.op_pod(&pod_full_name, &op).await {
        Ok(()) => PodOpResult::ok(&op),
        Err(err) => {
            error!(pod = %pod_full_name, op = %op, "pod op failed: {err:#}");
            PodOpResult::error(&op, err)
        }
    };
    axum::Json(result).into_response()
}

async fn handle_image_push(
    State(state): State<AppState>,
    axum::Json(params): axum::Json<PushImageParams>,
) -> Response {
    let result = match state.kubelet.push_image(&params).await {
        Ok(()) => PodOpResult::ok("push"),
        Err(err) => {
            error!(image = %params.image, "image push failed: {err:#}");
            PodOpResult::error("push", err)
        }
    };
    axum::Json(result).into_response()
}

#[derive(Debug, Deserialize)]
struct MergeParams {
    #[serde(rename = "podID")]
    pod_id: String,
    #[serde(rename = "podNamespace", default)]
    pod_namespace: String,
    image: String,
    op: String,
}

async fn handle_pod_upgrade(
    State(state): State<AppState>,
    AxumPath(kind): AxumPath<String>,
    body: String,
) -> Response {
    let result = match kind.as_str() {
        "cgroup" | "disk" => {
            let config: PodConfig = match serde_json::from_str(&body) {
                Ok(config) => config,
                Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
            };
            let pod_full_name =
                full_name_from_parts(&config.pod_id, &config.pod_namespace);
            let outcome = if kind == "cgroup" {
                state.kubelet.update_pod_cgroup(&pod_full_name, &config).await
            } else {
                state.kubelet.update_pod_disk(&pod_full_name, &config).await
            };
            match outcome {
                Ok(()) => PodOpResult::ok(&kind),
                Err(err) => {
                    error!(pod = %pod_full_name, kind = %kind, "pod upgrade failed: {err:#}");
                    PodOpResult::error(&kind, err)
                }
            }
        }
        "merge" => {
            let params: MergeParams = match serde_json::from_str(&body) {
                Ok(params) => params,
                Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
            };
            let pod_full_name =
                full_name_from_parts(&params.pod_id, &params.pod_namespace);
            match state
                .kubelet
                .merge_container(&pod_full_name, &params.image, &params.op)
                .await
            {
                Ok(()) => PodOpResult::ok("merge"),
                Err(err) => {
                    error!(pod = %pod_full_name, "merge failed: {err:#}");
                    PodOpResult::error("merge", err)
                }
            }
        }
        other => {
            return (
                StatusCode::NOT_FOUND,
                format!("unknown upgrade kind {other}"),
            )
                .into_response();
        }
    };
    axum::Json(result).into_response()
}

/// `/run/<ns>/<podID>[/<uuid>]/<container>?cmd=...`. The uuid segment is
/// optional, so the path is parsed by hand.
async fn handle_run(
    State(state): State<AppState>,
    AxumPath(rest): AxumPath<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    let components: Vec<&str> = rest.split('/').filter(|c| !c.is_empty()).collect();
    let (namespace, pod_id, uid, container) = match components.as_slice() {
        [ns, pod, container] => (*ns, *pod, "", *container),
        [ns, pod, uid, container] => (*ns, *pod, *uid, *container),
        _ => {
            return (StatusCode::BAD_REQUEST, "unexpected path for command running")
                .into_response();
        }
    };

    let cmd: Vec<String> = params
        .into_iter()
        .filter(|(key, _)| key == "cmd")
        .map(|(_, value)| value)
        .collect();

    let pod_full_name = full_name_from_parts(pod_id, namespace);
    match state
        .kubelet
        .run_in_container(&pod_full_name, uid, container, &cmd)
        .await
    {
        Ok(output) => output.into_response(),
        Err(err) => internal_error(err),
    }
}

/// Legacy single-manifest submission (debug surface).
#[derive(Debug, Deserialize)]
struct ContainerManifest {
    #[serde(default)]
    id: String,
    #[serde(default)]
    uuid: String,
    #[serde(default)]
    containers: Vec<Container>,
    #[serde(default)]
    volumes: Vec<Volume>,
    #[serde(rename = "restartPolicy", default)]
    restart_policy: RestartPolicy,
}

async fn handle_container(State(state): State<AppState>, body: String) -> Response {
    let manifest: ContainerManifest = match serde_yaml::from_str(&body) {
        Ok(manifest) => manifest,
        Err(err) => return internal_error(err),
    };
    let mut pod = BoundPod {
        metadata: ObjectMeta {
            name: manifest.id,
            uid: manifest.uuid,
            ..Default::default()
        },
        spec: PodSpec {
            containers: manifest.containers,
            volumes: manifest.volumes,
            restart_policy: manifest.restart_policy,
            ..Default::default()
        },
        ..Default::default()
    };
    if pod.metadata.name.is_empty() {
        pod.metadata.name = "1".to_string();
    }
    if pod.metadata.uid.is_empty() {
        pod.metadata.uid = "1".to_string();
    }

    if let Err(err) = state.updates.send(PodUpdate {
        pods: vec![pod],
        op: PodOperation::Set,
    }) {
        return internal_error(err);
    }
    StatusCode::OK.into_response()
}

/// Legacy multi-spec submission (debug surface).
async fn handle_containers(State(state): State<AppState>, body: String) -> Response {
    let specs: Vec<PodSpec> = match serde_yaml::from_str(&body) {
        Ok(specs) => specs,
        Err(err) => return internal_error(err),
    };
    let pods = specs
        .into_iter()
        .enumerate()
        .map(|(i, spec)| BoundPod {
            metadata: ObjectMeta {
                name: format!("{}", i + 1),
                uid: format!("{}", i + 1),
                ..Default::default()
            },
            spec,
            ..Default::default()
        })
        .collect();

    if let Err(err) = state.updates.send(PodUpdate {
        pods,
        op: PodOperation::Set,
    }) {
        return internal_error(err);
    }
    StatusCode::OK.into_response()
}
