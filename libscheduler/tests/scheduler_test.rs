//! End-to-end scheduling scenarios over an in-memory registry.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{
    Binding, Capacity, Container, Minion, MinionList, MinionSpec, NetworkMode, ObjectMeta, Pod,
    PodPhase, PodSpec, PodStatus, VmSlot,
};
use libscheduler::predicates::default_predicates;
use libscheduler::{
    Binder, Config, FailureHandler, GenericScheduler, MinionLister, PodLister, PodSource,
    ScheduleAlgorithm, Scheduler, StatusUpdater,
};
use rand::SeedableRng;
use rand::rngs::StdRng;

#[derive(Default)]
struct TestRegistry {
    minions: Mutex<MinionList>,
    pods: Mutex<Vec<Pod>>,
    queue: Mutex<VecDeque<Pod>>,
    bindings: Mutex<Vec<Binding>>,
    requeued: Mutex<Vec<(String, String)>>,
    status_updates: Mutex<Vec<Pod>>,
}

impl TestRegistry {
    fn new(minions: Vec<Minion>) -> Arc<Self> {
        let registry = TestRegistry::default();
        registry.minions.lock().unwrap().items = minions;
        Arc::new(registry)
    }

    fn add_scheduled_pod(&self, pod: Pod) {
        self.pods.lock().unwrap().push(pod);
    }

    fn enqueue(&self, pod: Pod) {
        self.queue.lock().unwrap().push_back(pod.clone());
        self.pods.lock().unwrap().push(pod);
    }

    fn bindings(&self) -> Vec<Binding> {
        self.bindings.lock().unwrap().clone()
    }
}

#[async_trait]
impl MinionLister for TestRegistry {
    async fn list(&self) -> anyhow::Result<MinionList> {
        Ok(self.minions.lock().unwrap().clone())
    }
}

#[async_trait]
impl PodLister for TestRegistry {
    async fn list_pods(&self) -> anyhow::Result<Vec<Pod>> {
        Ok(self.pods.lock().unwrap().clone())
    }
}

#[async_trait]
impl Binder for TestRegistry {
    async fn bind(&self, binding: &Binding) -> anyhow::Result<()> {
        self.bindings.lock().unwrap().push(binding.clone());
        // Apply the binding the way the registry would.
        let mut pods = self.pods.lock().unwrap();
        if let Some(pod) = pods.iter_mut().find(|p| p.metadata.name == binding.pod_id) {
            pod.status.host = binding.host.clone();
            pod.status.cpu_set = binding.cpu_set.clone();
            pod.status.network = binding.network.clone();
        }
        Ok(())
    }
}

#[async_trait]
impl StatusUpdater for TestRegistry {
    async fn update_pod_status(&self, pod: &Pod) -> anyhow::Result<()> {
        self.status_updates.lock().unwrap().push(pod.clone());
        Ok(())
    }
}

#[async_trait]
impl PodSource for TestRegistry {
    async fn next_pod(&self) -> anyhow::Result<Pod> {
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no pending pods"))
    }
}

#[async_trait]
impl FailureHandler for TestRegistry {
    async fn error(&self, pod: Pod, err: anyhow::Error) {
        self.requeued
            .lock()
            .unwrap()
            .push((pod.metadata.name.clone(), err.to_string()));
        self.queue.lock().unwrap().push_back(pod);
    }
}

fn minion(name: &str, core: i64, cpu_node: i64) -> Minion {
    Minion {
        name: name.to_string(),
        labels: HashMap::new(),
        spec: MinionSpec {
            capacity: Capacity {
                core,
                cpu_node,
                ..Default::default()
            },
            vms: Vec::new(),
        },
    }
}

fn pod(name: &str, req_core: i64, mode: NetworkMode) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: name.to_string(),
            namespace: "default".to_string(),
            ..Default::default()
        },
        spec: PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                image: "busybox".to_string(),
                core: req_core,
                ..Default::default()
            }],
            network_mode: mode,
            ..Default::default()
        },
        status: PodStatus::default(),
    }
}

fn pinned_pod(name: &str, host: &str, cpu_set: &str) -> Pod {
    let mut pod = pod(name, 0, NetworkMode::Host);
    pod.status.host = host.to_string();
    pod.status.cpu_set = cpu_set.to_string();
    pod
}

fn algorithm(registry: &Arc<TestRegistry>) -> GenericScheduler {
    GenericScheduler::new(
        default_predicates(),
        registry.clone(),
        StdRng::seed_from_u64(0),
    )
}

fn assert_numa_coherent(cpu_set: &str, cores_per_node: usize) {
    let cores: Vec<usize> = cpu_set.split(',').map(|c| c.parse().unwrap()).collect();
    let node = cores[0] / cores_per_node;
    for core in &cores {
        assert_eq!(
            core / cores_per_node,
            node,
            "cpu set {cpu_set} crosses numa nodes"
        );
    }
}

#[tokio::test]
async fn four_cores_land_in_one_numa_half() {
    // 24-core, 2-numa machine with 12 free cores per numa node.
    let registry = TestRegistry::new(vec![minion("m1", 24, 2)]);
    let target = pod("p1", 4, NetworkMode::Host);

    let dest = algorithm(&registry)
        .schedule(&target, registry.as_ref())
        .await
        .unwrap();

    assert_eq!(dest.name, "m1");
    let cores: Vec<usize> = dest.cpu_set.split(',').map(|c| c.parse().unwrap()).collect();
    assert_eq!(cores.len(), 4);
    assert_numa_coherent(&dest.cpu_set, 12);
}

#[tokio::test]
async fn numa_coherent_node_beats_fragmented_one() {
    // Node A has 8 free cores split 4/4 across numa nodes; node B has 8
    // free inside one numa node.
    let registry = TestRegistry::new(vec![minion("a", 16, 2), minion("b", 16, 2)]);
    registry.add_scheduled_pod(pinned_pod("fill-a", "a", "4,5,6,7,12,13,14,15"));
    registry.add_scheduled_pod(pinned_pod("fill-b", "b", "0,1,2,3,4,5,6,7"));

    let target = pod("p1", 8, NetworkMode::Host);
    let dest = algorithm(&registry)
        .schedule(&target, registry.as_ref())
        .await
        .unwrap();

    assert_eq!(dest.name, "b");
    assert_eq!(dest.cpu_set, "8,9,10,11,12,13,14,15");
}

#[tokio::test]
async fn falls_back_to_split_cpu_set_when_no_node_is_coherent() {
    let registry = TestRegistry::new(vec![minion("a", 16, 2)]);
    registry.add_scheduled_pod(pinned_pod("fill-a", "a", "4,5,6,7,12,13,14,15"));

    let target = pod("p1", 8, NetworkMode::Host);
    let dest = algorithm(&registry)
        .schedule(&target, registry.as_ref())
        .await
        .unwrap();

    assert_eq!(dest.name, "a");
    assert_eq!(dest.cpu_set, "0,1,2,3,8,9,10,11");
}

#[tokio::test]
async fn allocated_cpu_sets_stay_disjoint() {
    let registry = TestRegistry::new(vec![minion("m1", 8, 2)]);
    registry.add_scheduled_pod(pinned_pod("p0", "m1", "0,1"));

    let target = pod("p1", 2, NetworkMode::Host);
    let dest = algorithm(&registry)
        .schedule(&target, registry.as_ref())
        .await
        .unwrap();

    for core in dest.cpu_set.split(',') {
        assert!(!"0,1".split(',').any(|used| used == core));
    }
}

#[tokio::test]
async fn bridge_pod_claims_first_free_vm_slot() {
    let mut node = minion("m1", 0, 0);
    node.spec.vms = vec![
        VmSlot {
            address: "10.0.0.2".to_string(),
            gateway: "10.0.0.1".to_string(),
            vlan_id: 7,
        },
        VmSlot {
            address: "10.0.0.3".to_string(),
            gateway: "10.0.0.1".to_string(),
            vlan_id: 7,
        },
    ];
    let registry = TestRegistry::new(vec![node]);

    let mut occupant = pinned_pod("p0", "m1", "");
    occupant.status.network.address = "10.0.0.2".to_string();
    registry.add_scheduled_pod(occupant);

    let target = pod("p1", 0, NetworkMode::Bridge);
    let dest = algorithm(&registry)
        .schedule(&target, registry.as_ref())
        .await
        .unwrap();

    assert_eq!(dest.network.address, "10.0.0.3");
    assert_eq!(dest.network.gateway, "10.0.0.1");
    assert_eq!(dest.network.bridge, "br7");
    assert_eq!(dest.network.mode, NetworkMode::Bridge);
}

#[tokio::test]
async fn sriov_pod_records_mode_only() {
    let registry = TestRegistry::new(vec![minion("m1", 0, 0)]);
    let target = pod("p1", 0, NetworkMode::Sriov);
    let dest = algorithm(&registry)
        .schedule(&target, registry.as_ref())
        .await
        .unwrap();
    assert_eq!(dest.network.mode, NetworkMode::Sriov);
    assert!(dest.network.address.is_empty());
}

#[tokio::test]
async fn only_fitting_node_is_always_chosen() {
    let mut labeled = minion("special", 0, 0);
    labeled.labels.insert("disk".to_string(), "ssd".to_string());
    let registry = TestRegistry::new(vec![minion("m1", 0, 0), labeled, minion("m3", 0, 0)]);

    let mut target = pod("p1", 0, NetworkMode::Host);
    target
        .spec
        .node_selector
        .insert("disk".to_string(), "ssd".to_string());

    for _ in 0..5 {
        let dest = algorithm(&registry)
            .schedule(&target, registry.as_ref())
            .await
            .unwrap();
        assert_eq!(dest.name, "special");
    }
}

fn loop_config(registry: &Arc<TestRegistry>, max_retry_times: i32) -> Config {
    Config {
        minion_lister: registry.clone(),
        algorithm: Arc::new(algorithm(registry)),
        binder: registry.clone(),
        status: registry.clone(),
        pod_source: registry.clone(),
        failure: registry.clone(),
        max_retry_times,
        poll_interval: Duration::from_millis(10),
    }
}

#[tokio::test]
async fn schedule_one_emits_exactly_one_binding() {
    let registry = TestRegistry::new(vec![minion("m1", 24, 2)]);
    registry.enqueue(pod("p1", 2, NetworkMode::Host));

    let scheduler = Scheduler::new(loop_config(&registry, 3));
    scheduler.schedule_one().await;

    let bindings = registry.bindings();
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].pod_id, "p1");
    assert_eq!(bindings[0].host, "m1");
    assert_eq!(bindings[0].cpu_set, "0,1");

    // Nothing left in the queue; a second iteration is a no-op.
    scheduler.schedule_one().await;
    assert_eq!(registry.bindings().len(), 1);
}

#[tokio::test]
async fn failed_scheduling_requeues_until_retries_exhausted() {
    // No minions at all: every attempt fails.
    let registry = TestRegistry::new(Vec::new());
    registry.enqueue(pod("p1", 0, NetworkMode::Host));

    let max_retry_times = 2;
    let scheduler = Scheduler::new(loop_config(&registry, max_retry_times));

    // Attempts 1 and 2 requeue with a bumped failure count.
    for attempt in 1..=max_retry_times {
        scheduler.schedule_one().await;
        let requeued = registry.requeued.lock().unwrap().len();
        assert_eq!(requeued as i32, attempt);
        assert!(registry.status_updates.lock().unwrap().is_empty());
    }

    // The next attempt exhausts the budget and reports Failed.
    scheduler.schedule_one().await;
    let updates = registry.status_updates.lock().unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].status.phase, PodPhase::Failed);
    assert!(registry.bindings().is_empty());
}
