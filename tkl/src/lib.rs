//! The node agent: reconciles pods bound to this host against the
//! container runtime, wires sandbox networking and cgroup limits, and
//! serves the agent HTTP surface.

pub mod config;
pub mod gc;
pub mod health;
pub mod kubelet;
pub mod ops;
pub mod server;
pub mod stats;
pub mod sync;
pub mod volume;
pub mod workers;

pub use kubelet::Kubelet;
