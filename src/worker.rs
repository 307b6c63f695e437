//! The session state machine.
//!
//! [`Worker::run`] owns the connection lifecycle: it waits for the adapter,
//! for permission and for someone to be interested, scans, connects and then
//! republishes every heart rate sample until nobody needs the session
//! anymore. Everything else talks to it through a cloneable [`WorkerHandle`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ble::device::DeviceSession;
use crate::ble::scan::ScanCoordinator;
use crate::ble::simulated::SimulatedBackend;
use crate::ble::{AdapterSource, AdapterState, Connector, DeviceFilter, DeviceInfo, Scanner};
use crate::conflated::ConflatedSender;
use crate::control::ControlThread;
use crate::errors::AppError;
use crate::heart_rate::measurement::parse_hrm;
use crate::heart_rate::{HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE_UUID};
use crate::platform::{KeepAlive, PermissionOracle};
use crate::settings::Settings;
use crate::state::State;

type Subscribers = BTreeMap<String, usize>;

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Everything the worker needs from the outside world.
#[derive(Clone)]
pub struct Collaborators {
    pub adapter: Arc<dyn AdapterSource>,
    pub scanner: Arc<dyn Scanner>,
    pub connector: Arc<dyn Connector>,
    pub permission: Arc<dyn PermissionOracle>,
    pub keep_alive: Arc<dyn KeepAlive>,
}

impl Collaborators {
    /// Uses one backend as adapter source, scanner and connector.
    pub fn from_backend<B>(
        backend: Arc<B>,
        permission: Arc<dyn PermissionOracle>,
        keep_alive: Arc<dyn KeepAlive>,
    ) -> Self
    where
        B: AdapterSource + Scanner + Connector + 'static,
    {
        Self {
            adapter: backend.clone(),
            scanner: backend.clone(),
            connector: backend,
            permission,
            keep_alive,
        }
    }

    pub fn simulated(
        sim: &SimulatedBackend,
        permission: Arc<dyn PermissionOracle>,
        keep_alive: Arc<dyn KeepAlive>,
    ) -> Self {
        Self::from_backend(Arc::new(sim.clone()), permission, keep_alive)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub filter: DeviceFilter,
    /// Minimum time between the starts of two scans
    pub min_scan_interval: Duration,
    pub assist_on_start: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            filter: DeviceFilter::for_service(HEART_RATE_SERVICE_UUID),
            min_scan_interval: Duration::from_secs(1),
            assist_on_start: true,
        }
    }
}

impl WorkerOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            filter: DeviceFilter::for_service(HEART_RATE_SERVICE_UUID)
                .with_name_prefix(settings.ble.device_name_prefix.clone()),
            min_scan_interval: Duration::from_millis(settings.ble.min_scan_interval_ms),
            assist_on_start: settings.announce.assist_on_start,
        }
    }
}

struct Shared {
    control: ControlThread,
    state: watch::Sender<Option<State>>,
    subscribers: watch::Sender<Subscribers>,
    assist: watch::Sender<bool>,
    permission_changed: Notify,
    keep_alive: Arc<dyn KeepAlive>,
    keep_alive_held: AtomicBool,
}

impl Shared {
    fn request_keep_alive(&self, assist_start: Instant) {
        if !self.keep_alive_held.swap(true, Ordering::SeqCst) {
            self.keep_alive.request_keep_alive(assist_start);
        }
    }

    fn release_keep_alive(&self) {
        if self.keep_alive_held.swap(false, Ordering::SeqCst) {
            self.keep_alive.release_keep_alive();
        }
    }

    fn is_keep_alive_held(&self) -> bool {
        self.keep_alive_held.load(Ordering::SeqCst)
    }
}

/// Cheap access to a running [`Worker`].
///
/// Reads work from anywhere. Mutators must be called on the worker's control
/// thread and panic elsewhere. They only write a `watch` slot or a `Notify`
/// permit, which the worker picks up at its next await point.
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<Shared>,
}

impl WorkerHandle {
    /// Registers interest in the session. Dropping the token unregisters it.
    pub fn subscribe(&self, key: impl Into<String>) -> Subscription {
        self.shared.control.check();
        let key = key.into();
        self.shared
            .subscribers
            .send_modify(|subscribers| *subscribers.entry(key.clone()).or_insert(0) += 1);
        debug!("Subscriber {key:?} joined");
        Subscription {
            shared: self.shared.clone(),
            key,
        }
    }

    /// `None` until the worker publishes its first state.
    pub fn current_state(&self) -> Option<State> {
        self.shared.state.borrow().clone()
    }

    pub fn observe_state(&self) -> watch::Receiver<Option<State>> {
        self.shared.state.subscribe()
    }

    pub fn set_assist(&self, assist: bool) {
        self.shared.control.check();
        info!("Assist {}", if assist { "enabled" } else { "disabled" });
        self.shared.assist.send_replace(assist);
    }

    pub fn is_assisting(&self) -> bool {
        *self.shared.assist.borrow()
    }

    /// Turns assist off, and with `also_release_keep_alive` lets the process
    /// go to sleep in the background.
    pub fn stop(&self, also_release_keep_alive: bool) {
        self.set_assist(false);
        if also_release_keep_alive {
            // The session won't release it again
            self.shared.keep_alive_held.store(false, Ordering::SeqCst);
            self.shared.keep_alive.release_keep_alive();
        }
    }

    pub fn notify_permission_changed(&self) {
        self.shared.control.check();
        self.shared.permission_changed.notify_one();
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.borrow().values().sum()
    }
}

/// Unsubscribes on drop.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    shared: Arc<Shared>,
    key: String,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.control.check();
        self.shared.subscribers.send_modify(|subscribers| {
            if let Some(count) = subscribers.get_mut(&self.key) {
                *count -= 1;
                if *count == 0 {
                    subscribers.remove(&self.key);
                }
            }
        });
        debug!("Subscriber {:?} left", self.key);
    }
}

// Per-connection bookkeeping for the published state
struct BeatTracker {
    device_name: String,
    last_beat: Option<u16>,
    assist_start: Option<Instant>,
}

async fn until_no_subscribers(subscribers: &mut watch::Receiver<Subscribers>) {
    let _ = subscribers.wait_for(|s| s.is_empty()).await;
}

pub struct Worker {
    control: ControlThread,
    shared: Arc<Shared>,
    coordinator: ScanCoordinator,
    connector: Arc<dyn Connector>,
    permission: Arc<dyn PermissionOracle>,
    options: WorkerOptions,
    announcements: ConflatedSender<u16>,
    last_scan: Option<Instant>,
}

impl Worker {
    /// Must be called on the thread that will drive [`Worker::run`].
    pub fn build(
        collaborators: Collaborators,
        options: WorkerOptions,
        announcements: ConflatedSender<u16>,
    ) -> (Worker, WorkerHandle) {
        let (state, _) = watch::channel(None);
        let (subscribers, _) = watch::channel(Subscribers::new());
        let (assist, _) = watch::channel(options.assist_on_start);
        let control = ControlThread::current();
        let shared = Arc::new(Shared {
            control,
            state,
            subscribers,
            assist,
            permission_changed: Notify::new(),
            keep_alive: collaborators.keep_alive,
            keep_alive_held: AtomicBool::new(false),
        });
        let worker = Worker {
            control,
            shared: shared.clone(),
            coordinator: ScanCoordinator::new(collaborators.adapter, collaborators.scanner),
            connector: collaborators.connector,
            permission: collaborators.permission,
            options,
            announcements,
            last_scan: None,
        };
        (worker, WorkerHandle { shared })
    }

    /// Runs until `cancel` fires, or forever-ish. Returns right away (after
    /// publishing [`State::NoBluetooth`]) when there is no adapter.
    pub async fn run(mut self, cancel: CancellationToken) {
        self.control.check();
        info!("Session worker started");
        if !self.coordinator.is_adapter_present().await {
            error!("No Bluetooth adapters found!");
            self.publish(State::NoBluetooth);
            return;
        }

        'session: loop {
            if cancel.is_cancelled() {
                break 'session;
            }
            if let Err(e) = self.step(&cancel).await {
                warn!("Session error: {e}");
                tokio::select! {
                    _ = cancel.cancelled() => break 'session,
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        }
        info!("Shutting down session worker thread!");
    }

    /// One pass through the state machine. Every wait ends the pass, so the
    /// next one re-checks adapter, permission and subscribers from the top.
    async fn step(&mut self, cancel: &CancellationToken) -> Result<(), AppError> {
        self.control.check();
        let coordinator = self.coordinator.clone();

        if !coordinator.is_adapter_enabled().await? {
            self.publish(State::AdapterOff);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                result = coordinator.wait_for_adapter_state(AdapterState::On) => result?,
            }
            return Ok(());
        }

        if !self.permission.has_required_permission() {
            self.publish(State::NoPermission);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = self.shared.permission_changed.notified() => {}
                result = coordinator.wait_for_adapter_state(AdapterState::Off) => result?,
            }
            return Ok(());
        }

        let mut subscribers = self.shared.subscribers.subscribe();
        if subscribers.borrow_and_update().is_empty() {
            debug!("No subscribers, idling");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = subscribers.changed() => {}
                _ = self.shared.permission_changed.notified() => {}
                result = coordinator.wait_for_adapter_state(AdapterState::Off) => result?,
            }
            return Ok(());
        }

        if let Some(last_scan) = self.last_scan {
            let wait = self.options.min_scan_interval.saturating_sub(last_scan.elapsed());
            if !wait.is_zero() {
                debug!("Waiting {wait:?} before scanning again");
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
        self.last_scan = Some(Instant::now());

        self.publish(State::Scanning);
        let Some(device) = self.scan(cancel, &mut subscribers).await? else {
            return Ok(());
        };
        self.monitor(device, cancel).await
    }

    /// Races the scan against the reasons to abandon it. A lost race cancels
    /// the scan and waits for it so the scanner is stopped before returning.
    async fn scan(
        &self,
        cancel: &CancellationToken,
        subscribers: &mut watch::Receiver<Subscribers>,
    ) -> Result<Option<DeviceInfo>, AppError> {
        let scan_cancel = cancel.child_token();
        let scan = self
            .coordinator
            .scan_for_first_match(&self.options.filter, scan_cancel.clone());
        tokio::pin!(scan);

        let outcome = tokio::select! {
            biased;
            _ = until_no_subscribers(subscribers) => {
                info!("All subscribers left, cancelling scan");
                Ok(())
            }
            result = self.coordinator.wait_for_adapter_state(AdapterState::Off) => {
                info!("Adapter turned off, cancelling scan");
                result
            }
            found = &mut scan => return found,
        };

        scan_cancel.cancel();
        if let Ok(Some(device)) = scan.await {
            debug!("Dropping {} found while cancelling", device.display_name());
        }
        outcome.map(|()| None)
    }

    async fn monitor(&self, device: DeviceInfo, cancel: &CancellationToken) -> Result<(), AppError> {
        self.control.check();
        let mut session = DeviceSession::new(self.control, self.connector.clone(), device);
        let mut tracker = BeatTracker {
            device_name: session.device().display_name(),
            last_beat: None,
            assist_start: None,
        };
        let mut beats = session.subscribe(HEART_RATE_MEASUREMENT, parse_hrm)?;

        let mut subscribers = self.shared.subscribers.subscribe();
        let mut assist = self.shared.assist.subscribe();
        let adapter_off = self.coordinator.wait_for_adapter_state(AdapterState::Off);
        tokio::pin!(adapter_off);

        let outcome = 'monitor: loop {
            let has_subscribers = !subscribers.borrow_and_update().is_empty();
            let assisting = *assist.borrow_and_update();
            if !has_subscribers && !assisting {
                info!("Nobody needs the session anymore, closing it");
                break 'monitor Ok(());
            }
            if !has_subscribers && !self.shared.is_keep_alive_held() {
                self.request_keep_alive(&tracker);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'monitor Ok(()),
                _ = subscribers.changed() => {}
                result = &mut adapter_off => {
                    info!("Adapter turned off, closing session");
                    break 'monitor result;
                }
                _ = assist.changed() => {
                    let assisting = *assist.borrow();
                    match tracker.last_beat {
                        Some(beat) => self.update_state(&mut tracker, beat, false),
                        None if !assisting => tracker.assist_start = None,
                        None => {}
                    }
                }
                event = session.next_event() => session.handle_event(event),
                measurement = beats.recv() => match measurement {
                    Some(measurement) => {
                        if !measurement.rr_intervals.is_empty() {
                            debug!("RR intervals: {:?}", measurement.rr_intervals);
                        }
                        self.update_state(&mut tracker, measurement.heart_rate, true);
                    }
                    None => {
                        info!("Heart rate stream from {} ended", tracker.device_name);
                        break 'monitor Ok(());
                    }
                },
            }
        };

        session.close();
        self.shared.release_keep_alive();
        outcome
    }

    /// Publishes `beat` as Monitoring or Assisting. Only fresh sensor samples
    /// are forwarded to the announcer.
    fn update_state(&self, tracker: &mut BeatTracker, beat: u16, from_sensor: bool) {
        tracker.last_beat = Some(beat);
        if *self.shared.assist.borrow() {
            let assist_start_time = *tracker.assist_start.get_or_insert_with(Instant::now);
            self.publish(State::Assisting {
                beat,
                device_name: tracker.device_name.clone(),
                assist_start_time,
            });
            if from_sensor {
                self.announcements.send(beat);
            }
        } else {
            tracker.assist_start = None;
            self.publish(State::Monitoring {
                beat,
                device_name: tracker.device_name.clone(),
            });
        }
    }

    fn request_keep_alive(&self, tracker: &BeatTracker) {
        let start = tracker.assist_start.unwrap_or_else(Instant::now);
        info!("No subscribers left, keeping the session alive for assist");
        self.shared.request_keep_alive(start);
    }

    fn publish(&self, state: State) {
        self.shared.state.send_if_modified(|current| {
            if current.as_ref() == Some(&state) {
                return false;
            }
            debug!("Publishing state: {state}");
            *current = Some(state);
            true
        });
    }
}
