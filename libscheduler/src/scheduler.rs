//! The scheduling control loop: one pod at a time, bounded retries,
//! binding emission and the scheduled-confirmation poll.

use std::sync::Arc;
use std::time::Duration;

use common::{Binding, PodPhase};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    Binder, FailureHandler, MinionLister, PodSource, ScheduleAlgorithm, StatusUpdater,
};

pub struct Config {
    pub minion_lister: Arc<dyn MinionLister>,
    pub algorithm: Arc<dyn ScheduleAlgorithm>,
    pub binder: Arc<dyn Binder>,
    pub status: Arc<dyn StatusUpdater>,
    /// Blocks until the next pod is available. Must compute the pod on
    /// demand rather than buffering, so it is never stale.
    pub pod_source: Arc<dyn PodSource>,
    pub failure: Arc<dyn FailureHandler>,
    /// Scheduling attempts before a pod is marked Failed.
    pub max_retry_times: i32,
    /// Interval between scheduled-confirmation polls after a bind.
    pub poll_interval: Duration,
}

pub struct Scheduler {
    config: Config,
}

impl Scheduler {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Scheduler { config })
    }

    /// Starts the single scheduling task. One pod is scheduled per
    /// iteration; panics are recovered so the loop never dies.
    pub fn run(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            common::util::forever(
                move || {
                    let scheduler = scheduler.clone();
                    async move { scheduler.schedule_one().await }
                },
                Duration::ZERO,
            )
            .await
        })
    }

    /// Pulls one pod and drives it through schedule → bind → confirm.
    pub async fn schedule_one(&self) {
        let mut pod = match self.config.pod_source.next_pod().await {
            Ok(pod) => pod,
            Err(err) => {
                warn!("failed to fetch next pod: {err:#}");
                return;
            }
        };
        debug!(pod = %pod.metadata.name, "attempting to schedule");

        let dest = match self
            .config
            .algorithm
            .schedule(&pod, self.config.minion_lister.as_ref())
            .await
        {
            Ok(dest) => dest,
            Err(err) => {
                warn!(
                    pod = %pod.metadata.name,
                    attempts = pod.status.scheduler_failure_count,
                    "failed to schedule: {err:#}"
                );
                if pod.status.scheduler_failure_count < self.config.max_retry_times {
                    pod.status.scheduler_failure_count += 1;
                    self.config.failure.error(pod, err).await;
                } else {
                    info!(
                        pod = %pod.metadata.name,
                        "retries exhausted, marking pod Failed"
                    );
                    pod.status.scheduler_failure_count += 1;
                    pod.status.phase = PodPhase::Failed;
                    if let Err(err) = self.config.status.update_pod_status(&pod).await {
                        warn!(pod = %pod.metadata.name, "failed to update pod status: {err:#}");
                    }
                }
                return;
            }
        };

        let binding = Binding {
            namespace: pod.metadata.namespace.clone(),
            pod_id: pod.metadata.name.clone(),
            host: dest.name.clone(),
            network: dest.network.clone(),
            cpu_set: dest.cpu_set.clone(),
        };
        if let Err(err) = self.config.binder.bind(&binding).await {
            warn!(pod = %pod.metadata.name, "binding rejected: {err:#}");
            pod.status.scheduler_failure_count += 1;
            self.config.failure.error(pod, err).await;
            return;
        }

        // The binding is asynchronous on the registry side; wait for it to
        // surface before pulling the next pod so per-node bookkeeping is
        // stable for the next iteration.
        loop {
            match self
                .config
                .algorithm
                .check_scheduled_pod(&pod.metadata.name)
                .await
            {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => {
                    debug!(pod = %pod.metadata.name, "check scheduled pod: {err:#}");
                }
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
        info!(
            pod = %pod.metadata.name,
            host = %dest.name,
            cpu_set = %dest.cpu_set,
            "scheduled"
        );
    }
}
