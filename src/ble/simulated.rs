//! An in-memory Bluetooth stack.
//!
//! Drives the `dummy` subcommand and the tests: the adapter can be powered
//! on and off, devices can be advertised, links dropped and notifications
//! pushed, all while counting what the session asked the "hardware" to do.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

use super::{
    AdapterSource, AdapterState, CharacteristicId, Connector, DeviceFilter, DeviceInfo,
    GattTransport, Scanner, TransportEvent, TransportEvents,
};
use crate::errors::AppError;
use crate::heart_rate::HEART_RATE_MEASUREMENT;

/// Snapshot of how often each hardware operation was requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub scans_started: usize,
    pub scans_stopped: usize,
    pub observers_registered: usize,
    pub observers_unregistered: usize,
    pub connects: usize,
    pub closes: usize,
    pub discoveries: usize,
    pub notifications_enabled: usize,
    pub reads: usize,
}

#[derive(Debug, Default)]
struct Counters {
    scans_started: AtomicUsize,
    scans_stopped: AtomicUsize,
    observers_registered: AtomicUsize,
    observers_unregistered: AtomicUsize,
    connects: AtomicUsize,
    closes: AtomicUsize,
    discoveries: AtomicUsize,
    notifications_enabled: AtomicUsize,
    reads: AtomicUsize,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

impl Counters {
    fn snapshot(&self) -> SimStats {
        let load = |c: &AtomicUsize| c.load(Ordering::SeqCst);
        SimStats {
            scans_started: load(&self.scans_started),
            scans_stopped: load(&self.scans_stopped),
            observers_registered: load(&self.observers_registered),
            observers_unregistered: load(&self.observers_unregistered),
            connects: load(&self.connects),
            closes: load(&self.closes),
            discoveries: load(&self.discoveries),
            notifications_enabled: load(&self.notifications_enabled),
            reads: load(&self.reads),
        }
    }
}

struct SimLink {
    generation: u64,
    device_id: String,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    notifying: HashSet<CharacteristicId>,
}

impl SimLink {
    fn send(&self, event: TransportEvent) {
        // The session may already have dropped its receiver
        let _ = self.events_tx.send(event);
    }
}

struct SimInner {
    present: bool,
    powered: watch::Sender<bool>,
    advertising: watch::Sender<Vec<DeviceInfo>>,
    gatt_table: HashSet<CharacteristicId>,
    scanning: AtomicBool,
    auto_connect: AtomicBool,
    fail_discovery: AtomicBool,
    last_values: Mutex<HashMap<CharacteristicId, Vec<u8>>>,
    link: Mutex<Option<SimLink>>,
    ready: watch::Sender<bool>,
    next_generation: AtomicU64,
    counters: Counters,
}

impl SimInner {
    fn link(&self) -> MutexGuard<'_, Option<SimLink>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn last_values(&self) -> MutexGuard<'_, HashMap<CharacteristicId, Vec<u8>>> {
        self.last_values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_usable(&self) -> Result<(), AppError> {
        if !self.present {
            return Err(AppError::NoAdapter);
        }
        if !*self.powered.borrow() {
            return Err(AppError::AdapterOff);
        }
        Ok(())
    }

    fn drop_link(&self) -> bool {
        let link = self.link().take();
        self.ready.send_replace(false);
        match link {
            Some(link) => {
                info!("Simulated link to {} dropped", link.device_id);
                link.send(TransportEvent::Disconnected);
                true
            }
            None => false,
        }
    }
}

/// Cheap to clone; every clone controls the same simulated stack.
#[derive(Clone)]
pub struct SimulatedBackend {
    inner: Arc<SimInner>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    /// A powered adapter whose peripherals expose the Heart Rate Measurement characteristic.
    pub fn new() -> Self {
        Self::build(true, true)
    }

    pub fn without_adapter() -> Self {
        Self::build(false, false)
    }

    pub fn powered_off() -> Self {
        Self::build(true, false)
    }

    fn build(present: bool, powered: bool) -> Self {
        let (powered, _) = watch::channel(powered);
        let (advertising, _) = watch::channel(Vec::new());
        let (ready, _) = watch::channel(false);
        Self {
            inner: Arc::new(SimInner {
                present,
                powered,
                advertising,
                gatt_table: HashSet::from([HEART_RATE_MEASUREMENT]),
                scanning: AtomicBool::new(false),
                auto_connect: AtomicBool::new(true),
                fail_discovery: AtomicBool::new(false),
                last_values: Mutex::new(HashMap::new()),
                link: Mutex::new(None),
                ready,
                next_generation: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    pub fn stats(&self) -> SimStats {
        self.inner.counters.snapshot()
    }

    /// Powering off drops the current link, like a real radio would.
    pub fn set_powered(&self, on: bool) {
        let changed = self.inner.powered.send_if_modified(|powered| {
            let changed = *powered != on;
            *powered = on;
            changed
        });
        if changed {
            info!("Simulated adapter turned {}", if on { "on" } else { "off" });
        }
        if !on {
            self.inner.scanning.store(false, Ordering::SeqCst);
            self.inner.drop_link();
        }
    }

    pub fn advertise(&self, device: DeviceInfo) {
        self.inner.advertising.send_modify(|devices| {
            devices.retain(|d| d.id != device.id);
            devices.push(device);
        });
    }

    pub fn stop_advertising(&self, id: &str) {
        self.inner
            .advertising
            .send_modify(|devices| devices.retain(|d| d.id != id));
    }

    /// When disabled, `connect()` never reports `Connected` on its own.
    pub fn set_auto_connect(&self, auto_connect: bool) {
        self.inner
            .auto_connect
            .store(auto_connect, Ordering::SeqCst);
    }

    pub fn set_fail_discovery(&self, fail: bool) {
        self.inner.fail_discovery.store(fail, Ordering::SeqCst);
    }

    /// Reports `Connected` on the current link.
    pub fn accept_connection(&self) -> bool {
        match self.inner.link().as_ref() {
            Some(link) => {
                link.send(TransportEvent::Connected);
                true
            }
            None => false,
        }
    }

    /// Pushes a value as the peripheral would. Only delivered if notifications
    /// were enabled on the current link, but always remembered for reads.
    pub fn notify(&self, id: CharacteristicId, value: &[u8]) -> bool {
        self.inner.last_values().insert(id, value.to_vec());
        match self.inner.link().as_ref() {
            Some(link) if link.notifying.contains(&id) => {
                trace!("Simulated notification on {id}: {value:?}");
                link.send(TransportEvent::CharacteristicValue {
                    id,
                    value: value.to_vec(),
                });
                true
            }
            _ => false,
        }
    }

    pub fn notify_heart_rate(&self, value: &[u8]) -> bool {
        self.notify(HEART_RATE_MEASUREMENT, value)
    }

    /// Simulates the peripheral going out of range.
    pub fn disconnect(&self) -> bool {
        self.inner.drop_link()
    }

    /// Simulates a "service changed" indication.
    pub fn rediscover(&self) -> bool {
        match self.inner.link().as_ref() {
            Some(link) => {
                link.send(TransportEvent::ServicesDiscovered { success: true });
                true
            }
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.link().is_some()
    }

    pub fn connected_device(&self) -> Option<String> {
        self.inner.link().as_ref().map(|l| l.device_id.clone())
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanning.load(Ordering::SeqCst)
    }

    /// Flips to `true` once the current link has notifications enabled.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.inner.ready.subscribe()
    }

    pub async fn wait_until_ready(&self) {
        let mut ready = self.ready();
        let _ = ready.wait_for(|ready| *ready).await;
    }
}

struct ObserverGuard(Arc<SimInner>);

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        bump(&self.0.counters.observers_unregistered);
    }
}

#[async_trait]
impl AdapterSource for SimulatedBackend {
    async fn is_present(&self) -> bool {
        self.inner.present
    }

    async fn is_enabled(&self) -> Result<bool, AppError> {
        if !self.inner.present {
            return Err(AppError::NoAdapter);
        }
        Ok(*self.inner.powered.borrow())
    }

    async fn observe_state_changes(&self) -> Result<BoxStream<'static, AdapterState>, AppError> {
        if !self.inner.present {
            return Err(AppError::NoAdapter);
        }
        bump(&self.inner.counters.observers_registered);
        let guard = ObserverGuard(self.inner.clone());
        let powered = self.inner.powered.subscribe();
        Ok(stream::unfold((powered, guard), |(mut powered, guard)| async move {
            powered.changed().await.ok()?;
            let state = AdapterState::from(*powered.borrow_and_update());
            Some((state, (powered, guard)))
        })
        .boxed())
    }
}

#[async_trait]
impl Scanner for SimulatedBackend {
    async fn start_scan(
        &self,
        filter: &DeviceFilter,
    ) -> Result<BoxStream<'static, DeviceInfo>, AppError> {
        self.inner.check_usable()?;
        self.inner.scanning.store(true, Ordering::SeqCst);
        bump(&self.inner.counters.scans_started);
        debug!("Simulated scan started for {filter}");

        // Like a platform scan filter, only the service list is applied here
        let services = filter.services.clone();
        let advertising = self.inner.advertising.subscribe();
        let pending: VecDeque<DeviceInfo> = advertising.borrow().iter().cloned().collect();
        Ok(stream::unfold(
            (advertising, pending),
            move |(mut advertising, mut pending)| {
                let services = services.clone();
                async move {
                    loop {
                        while let Some(device) = pending.pop_front() {
                            if services.is_empty()
                                || device.services.iter().any(|s| services.contains(s))
                            {
                                return Some((device, (advertising, pending)));
                            }
                        }
                        advertising.changed().await.ok()?;
                        pending.extend(advertising.borrow_and_update().iter().cloned());
                    }
                }
            },
        )
        .boxed())
    }

    async fn stop_scan(&self) -> Result<(), AppError> {
        if self.inner.scanning.swap(false, Ordering::SeqCst) {
            bump(&self.inner.counters.scans_stopped);
            debug!("Simulated scan stopped");
            Ok(())
        } else {
            Err(AppError::ScanNotRunning)
        }
    }
}

impl Connector for SimulatedBackend {
    fn connect(
        &self,
        device: &DeviceInfo,
    ) -> Result<(Box<dyn GattTransport>, TransportEvents), AppError> {
        self.inner.check_usable()?;
        bump(&self.inner.counters.connects);
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let link = SimLink {
            generation,
            device_id: device.id.clone(),
            events_tx,
            notifying: HashSet::new(),
        };
        if self.inner.auto_connect.load(Ordering::SeqCst) {
            link.send(TransportEvent::Connected);
        }
        if let Some(old) = self.inner.link().replace(link) {
            old.send(TransportEvent::Disconnected);
        }
        self.inner.ready.send_replace(false);
        info!("Simulated link to {} opened", device.id);

        let transport = SimTransport {
            inner: self.inner.clone(),
            generation,
        };
        Ok((Box::new(transport), events_rx))
    }
}

struct SimTransport {
    inner: Arc<SimInner>,
    generation: u64,
}

impl SimTransport {
    fn with_link<R>(&self, f: impl FnOnce(&mut SimLink) -> R) -> Result<R, AppError> {
        match self.inner.link().as_mut() {
            Some(link) if link.generation == self.generation => Ok(f(link)),
            _ => Err(AppError::NotConnected),
        }
    }
}

impl GattTransport for SimTransport {
    fn discover_services(&mut self) -> Result<(), AppError> {
        bump(&self.inner.counters.discoveries);
        let success = !self.inner.fail_discovery.load(Ordering::SeqCst);
        self.with_link(|link| link.send(TransportEvent::ServicesDiscovered { success }))
    }

    fn enable_notifications(&mut self, id: CharacteristicId) -> Result<(), AppError> {
        bump(&self.inner.counters.notifications_enabled);
        let known = self.inner.gatt_table.contains(&id);
        self.with_link(|link| {
            if known {
                link.notifying.insert(id);
            }
        })?;
        if known {
            self.inner.ready.send_replace(true);
        }
        Ok(())
    }

    fn read_characteristic(&mut self, id: CharacteristicId) -> Result<(), AppError> {
        bump(&self.inner.counters.reads);
        let inner = self.inner.clone();
        self.with_link(|link| {
            if let Some(value) = inner.last_values().get(&id) {
                link.send(TransportEvent::CharacteristicValue {
                    id,
                    value: value.clone(),
                });
            }
        })
    }

    fn close(&mut self) {
        bump(&self.inner.counters.closes);
        let mut link = self.inner.link();
        if link.as_ref().is_some_and(|l| l.generation == self.generation) {
            *link = None;
            drop(link);
            self.inner.ready.send_replace(false);
        }
    }
}
