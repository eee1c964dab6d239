//! Pod scheduling: fit predicates, NUMA-aware cpu selection, bridge/sriov
//! network allocation and the retry-bounded scheduling loop.

pub mod bitmap;
pub mod generic;
pub mod predicates;
pub mod scheduler;

pub use bitmap::NumaBitmap;
pub use generic::{GenericScheduler, SelectedMachine};
pub use scheduler::{Config, Scheduler};

use async_trait::async_trait;
use common::{Binding, MinionList, Pod};

#[async_trait]
pub trait MinionLister: Send + Sync {
    async fn list(&self) -> anyhow::Result<MinionList>;
}

#[async_trait]
pub trait PodLister: Send + Sync {
    /// Every pod known to the cluster, scheduled or not.
    async fn list_pods(&self) -> anyhow::Result<Vec<Pod>>;
}

/// Writes a binding back to the registry.
#[async_trait]
pub trait Binder: Send + Sync {
    async fn bind(&self, binding: &Binding) -> anyhow::Result<()>;
}

/// Publishes terminal pod status (used when retries are exhausted).
#[async_trait]
pub trait StatusUpdater: Send + Sync {
    async fn update_pod_status(&self, pod: &Pod) -> anyhow::Result<()>;
}

/// Hands out the next pod to schedule. Implementations must compute the
/// pod on demand when asked, not buffer ahead, so the scheduler never
/// works from a stale snapshot.
#[async_trait]
pub trait PodSource: Send + Sync {
    async fn next_pod(&self) -> anyhow::Result<Pod>;
}

/// Invoked with the failed pod (failure count already bumped) so it can be
/// requeued for another attempt.
#[async_trait]
pub trait FailureHandler: Send + Sync {
    async fn error(&self, pod: Pod, err: anyhow::Error);
}

#[async_trait]
pub trait ScheduleAlgorithm: Send + Sync {
    async fn schedule(
        &self,
        pod: &Pod,
        minion_lister: &dyn MinionLister,
    ) -> anyhow::Result<SelectedMachine>;

    /// Whether the registry has observed the binding for `pod_name`.
    async fn check_scheduled_pod(&self, pod_name: &str) -> anyhow::Result<bool>;
}
