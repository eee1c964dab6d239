//! Per-pod reconciliation workers: at most one in flight per pod full
//! name. A dispatch for a pod that already has a worker is a no-op; the
//! next syncLoop tick picks the new desired state up again.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tracing::{debug, error};

#[derive(Default, Clone)]
pub struct PodWorkers {
    active: Arc<Mutex<HashSet<String>>>,
}

impl PodWorkers {
    pub fn new() -> Self {
        PodWorkers::default()
    }

    /// Dispatches `action` for `pod_full_name` unless a worker for that
    /// pod is already running. Returns whether the action was dispatched.
    /// A panicking action is logged and its slot released.
    pub fn run<F>(&self, pod_full_name: String, action: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        {
            let mut active = self.active.lock().unwrap();
            if active.contains(&pod_full_name) {
                debug!(pod = %pod_full_name, "worker already running, skipping dispatch");
                return false;
            }
            active.insert(pod_full_name.clone());
        }

        let active = self.active.clone();
        tokio::spawn(async move {
            // The inner task absorbs panics so the slot is always freed.
            if let Err(err) = tokio::spawn(action).await {
                if err.is_panic() {
                    error!(pod = %pod_full_name, "pod worker panicked: {err}");
                }
            }
            active.lock().unwrap().remove(&pod_full_name);
        });
        true
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn at_most_one_worker_per_pod() {
        let workers = PodWorkers::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let counted = runs.clone();
        assert!(workers.run("web.prod.etcd".to_string(), async move {
            counted.fetch_add(1, Ordering::SeqCst);
            let _ = release_rx.await;
        }));

        // Same pod: dropped. Different pod: dispatched.
        let counted = runs.clone();
        assert!(!workers.run("web.prod.etcd".to_string(), async move {
            counted.fetch_add(1, Ordering::SeqCst);
        }));
        let counted = runs.clone();
        assert!(workers.run("db.prod.etcd".to_string(), async move {
            counted.fetch_add(1, Ordering::SeqCst);
        }));

        release_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while workers.active_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_worker_frees_its_slot() {
        let workers = PodWorkers::new();
        assert!(workers.run("web.prod.etcd".to_string(), async {
            panic!("sync blew up");
        }));

        tokio::time::timeout(Duration::from_secs(1), async {
            while workers.active_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // The pod can be dispatched again afterwards.
        assert!(workers.run("web.prod.etcd".to_string(), async {}));
    }
}
