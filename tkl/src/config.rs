use std::path::PathBuf;

use clap::Parser;

/// Node agent command-line configuration.
#[derive(Debug, Parser)]
#[command(name = "tkl", about = "node agent")]
pub struct AgentConfig {
    /// Address the agent HTTP server binds.
    #[arg(long, default_value = "0.0.0.0")]
    pub address: String,

    /// Port the agent HTTP server binds.
    #[arg(long, default_value_t = 10250)]
    pub port: u16,

    /// Name this node registers under.
    #[arg(long, env = "HOSTNAME", default_value = "localhost")]
    pub hostname: String,

    /// Container runtime daemon endpoint.
    #[arg(long, default_value = "http://127.0.0.1:2375")]
    pub runtime_endpoint: String,

    /// Directory for per-pod state (volumes, termination logs).
    #[arg(long, default_value = "/var/lib/tkl")]
    pub root_dir: PathBuf,

    /// Image used for pod network sandbox containers.
    #[arg(long, default_value = "kubernetes/pause:latest")]
    pub network_container_image: String,

    /// Seconds between periodic re-reconciliations.
    #[arg(long, default_value_t = 10)]
    pub resync_interval_secs: u64,

    /// Exited sandbox containers retained per pod. Zero disables GC.
    #[arg(long, default_value_t = 5)]
    pub max_container_count: usize,

    /// Minimum age before an exited container may be collected.
    #[arg(long, default_value_t = 60)]
    pub minimum_gc_age_secs: i64,

    /// Seconds between garbage-collection passes.
    #[arg(long, default_value_t = 60)]
    pub gc_interval_secs: u64,

    /// Whether containers may request privileged mode.
    #[arg(long, default_value_t = false)]
    pub allow_privileged: bool,

    /// Optional cadvisor endpoint for stats and machine spec.
    #[arg(long)]
    pub cadvisor_endpoint: Option<String>,
}
