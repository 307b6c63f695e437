use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pace_assistant::ble::simulated::SimulatedBackend;
use pace_assistant::ble::DeviceInfo;
use pace_assistant::conflated::{self, ConflatedReceiver};
use pace_assistant::heart_rate::HEART_RATE_SERVICE_UUID;
use pace_assistant::platform::{GrantedPermission, KeepAlive};
use pace_assistant::state::State;
use pace_assistant::worker::{Collaborators, Worker, WorkerHandle, WorkerOptions};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const WAIT_LIMIT: Duration = Duration::from_secs(3);

#[derive(Default)]
pub struct RecordingKeepAlive {
    pub requests: AtomicUsize,
    pub releases: AtomicUsize,
}

#[allow(dead_code)]
impl RecordingKeepAlive {
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl KeepAlive for RecordingKeepAlive {
    fn request_keep_alive(&self, _assist_start: Instant) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }

    fn release_keep_alive(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Harness {
    pub sim: SimulatedBackend,
    pub permission: Arc<GrantedPermission>,
    pub keep_alive: Arc<RecordingKeepAlive>,
    pub handle: WorkerHandle,
    pub announcements: ConflatedReceiver<u16>,
}

/// Builds a worker over `sim`, with a short scan interval so reconnects are quick.
pub fn harness(sim: SimulatedBackend, assist_on_start: bool) -> (Worker, Harness) {
    harness_with(sim, options(assist_on_start), true)
}

#[allow(dead_code)]
pub fn harness_with_permission(
    sim: SimulatedBackend,
    assist_on_start: bool,
    granted: bool,
) -> (Worker, Harness) {
    harness_with(sim, options(assist_on_start), granted)
}

pub fn options(assist_on_start: bool) -> WorkerOptions {
    WorkerOptions {
        min_scan_interval: Duration::from_millis(10),
        assist_on_start,
        ..Default::default()
    }
}

pub fn harness_with(
    sim: SimulatedBackend,
    options: WorkerOptions,
    granted: bool,
) -> (Worker, Harness) {
    let permission = Arc::new(GrantedPermission::new(granted));
    let keep_alive = Arc::new(RecordingKeepAlive::default());
    let collaborators = Collaborators::simulated(&sim, permission.clone(), keep_alive.clone());
    let (announce_tx, announcements) = conflated::channel();
    let (worker, handle) = Worker::build(collaborators, options, announce_tx);
    (
        worker,
        Harness {
            sim,
            permission,
            keep_alive,
            handle,
            announcements,
        },
    )
}

#[allow(dead_code)]
pub fn hrm_device(id: &str, name: &str) -> DeviceInfo {
    DeviceInfo::new(id, Some(name), vec![HEART_RATE_SERVICE_UUID])
}

/// Drives the worker alongside `script`, shutting it down once the script ends.
pub async fn run_with<F>(worker: Worker, script: F)
where
    F: Future<Output = ()>,
{
    let cancel = CancellationToken::new();
    let run = worker.run(cancel.clone());
    let script = async move {
        script.await;
        cancel.cancel();
    };
    tokio::join!(run, script);
}

/// Waits until the published state satisfies `predicate`.
pub async fn wait_for_state<P>(handle: &WorkerHandle, predicate: P) -> State
where
    P: Fn(&State) -> bool,
{
    let mut states = handle.observe_state();
    let state = tokio::time::timeout(
        WAIT_LIMIT,
        states.wait_for(|state| state.as_ref().is_some_and(&predicate)),
    )
    .await
    .expect("timed out waiting for state")
    .expect("worker went away");
    (*state).clone().unwrap()
}

/// Polls `condition` until it holds.
#[allow(dead_code)]
pub async fn eventually<C>(what: &str, condition: C)
where
    C: Fn() -> bool,
{
    let deadline = Instant::now() + WAIT_LIMIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
