use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use common::exec::CommandExecutor;
use libruntime::{RuntimeClient, RuntimePuller};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tkl::config::AgentConfig;
use tkl::health::ProbeHealthChecker;
use tkl::kubelet::{EmptyKeyring, Kubelet, KubeletDeps};
use tkl::stats::{CadvisorClient, NoStats, StatsProvider};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AgentConfig::parse();
    info!(hostname = %config.hostname, "starting node agent");

    let runtime: Arc<dyn libruntime::ContainerRuntime> =
        Arc::new(RuntimeClient::new(&config.runtime_endpoint));
    let stats: Arc<dyn StatsProvider> = match &config.cadvisor_endpoint {
        Some(endpoint) => Arc::new(CadvisorClient::new(endpoint)),
        None => Arc::new(NoStats),
    };

    let executor: Arc<dyn common::exec::SystemExecutor> = Arc::new(CommandExecutor);
    let kubelet = Kubelet::new(KubeletDeps {
        hostname: config.hostname.clone(),
        puller: Arc::new(RuntimePuller::new(runtime.clone())),
        health_checker: Arc::new(ProbeHealthChecker::new(runtime.clone())),
        runtime,
        disk_quota: libcgroup::DiskQuota::new(executor.clone()),
        blkio: libcgroup::BlkioGroup::new(executor.clone()),
        executor,
        stats,
        keyring: Arc::new(EmptyKeyring),
        root_dir: config.root_dir.clone(),
        network_container_image: config.network_container_image.clone(),
        resync_interval: Duration::from_secs(config.resync_interval_secs),
        max_container_count: config.max_container_count,
        minimum_gc_age: chrono::Duration::seconds(config.minimum_gc_age_secs),
        allow_privileged: config.allow_privileged,
    });

    let (updates_tx, updates_rx) = tokio::sync::mpsc::unbounded_channel();

    let server_kubelet = kubelet.clone();
    let server_updates = updates_tx.clone();
    let address = config.address.clone();
    let port = config.port;
    tokio::spawn(async move {
        if let Err(err) = tkl::server::serve(&address, port, server_kubelet, server_updates).await
        {
            error!("agent server exited: {err:#}");
        }
    });

    let gc_kubelet = kubelet.clone();
    tokio::spawn(common::util::forever(
        move || {
            let kubelet = gc_kubelet.clone();
            async move {
                if let Err(err) = kubelet.garbage_collect_containers().await {
                    error!("garbage collection failed: {err:#}");
                }
            }
        },
        Duration::from_secs(config.gc_interval_secs),
    ));

    kubelet.run(updates_rx).await;
    Ok(())
}
