use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use libscheduler::predicates::default_predicates;
use libscheduler::{GenericScheduler, Scheduler};
use log::info;
use rand::SeedableRng;
use rand::rngs::StdRng;

use tks::cache::PodCache;
use tks::config::load_config;
use tks::registry::{AgentClient, DnsIpGetter, RegistryClient};

#[derive(Parser)]
#[command(name = "tks", about = "scheduler and pod status cache")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Start {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match &cli.command {
        Commands::Start { config } => {
            let cfg = load_config(config.to_str().unwrap())?;
            info!("starting scheduler against {}", cfg.registry_endpoint);

            let registry = Arc::new(RegistryClient::new(&cfg.registry_endpoint));
            let algorithm = Arc::new(GenericScheduler::new(
                default_predicates(),
                registry.clone(),
                StdRng::from_entropy(),
            ));

            let scheduler = Scheduler::new(libscheduler::Config {
                minion_lister: registry.clone(),
                algorithm,
                binder: registry.clone(),
                status: registry.clone(),
                pod_source: registry.clone(),
                failure: registry.clone(),
                max_retry_times: cfg.max_retry_times,
                poll_interval: Duration::from_secs(1),
            });
            scheduler.run();

            let pod_cache = PodCache::new(
                Arc::new(DnsIpGetter),
                Arc::new(AgentClient::new(cfg.agent_port)),
                registry.clone(),
                registry.clone(),
            );
            let sweep_cache = pod_cache.clone();
            tokio::spawn(common::util::forever(
                move || {
                    let cache = sweep_cache.clone();
                    async move { cache.update_all_containers().await }
                },
                Duration::from_secs(cfg.cache_refresh_secs),
            ));

            tokio::signal::ctrl_c().await?;
            info!("received ctrl-c, shutting down");
        }
    }
    Ok(())
}
