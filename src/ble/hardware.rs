use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, PeripheralProperties, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    AdapterSource, AdapterState, CharacteristicId, Connector, DeviceFilter, DeviceInfo,
    GattTransport, Scanner, TransportEvent, TransportEvents,
};
use crate::errors::AppError;

/// Adapter, scanner and connector backed by the first system Bluetooth adapter.
pub struct BtleplugBackend {
    // Some platforms tear the adapters down with the manager
    _manager: Manager,
    central: Option<Adapter>,
    scanning: AtomicBool,
}

impl BtleplugBackend {
    pub async fn new() -> Result<Self, AppError> {
        let manager = Manager::new().await?;
        let central = manager.adapters().await?.into_iter().next();
        match &central {
            Some(central) => match central.adapter_info().await {
                Ok(info) => info!("Using Bluetooth adapter: {info}"),
                Err(e) => warn!("Couldn't read adapter info: {e}"),
            },
            None => error!("No Bluetooth adapters found!"),
        }
        Ok(Self {
            _manager: manager,
            central,
            scanning: AtomicBool::new(false),
        })
    }

    fn central(&self) -> Result<&Adapter, AppError> {
        self.central.as_ref().ok_or(AppError::NoAdapter)
    }
}

#[async_trait]
impl AdapterSource for BtleplugBackend {
    async fn is_present(&self) -> bool {
        self.central.is_some()
    }

    async fn is_enabled(&self) -> Result<bool, AppError> {
        // Some backends only ever report Unknown, treat that as usable
        Ok(self.central()?.adapter_state().await? != CentralState::PoweredOff)
    }

    async fn observe_state_changes(&self) -> Result<BoxStream<'static, AdapterState>, AppError> {
        let events = self.central()?.events().await?;
        Ok(events
            .filter_map(|event| async move {
                match event {
                    CentralEvent::StateUpdate(CentralState::PoweredOn) => Some(AdapterState::On),
                    CentralEvent::StateUpdate(CentralState::PoweredOff) => Some(AdapterState::Off),
                    _ => None,
                }
            })
            .boxed())
    }
}

#[async_trait]
impl Scanner for BtleplugBackend {
    async fn start_scan(
        &self,
        filter: &DeviceFilter,
    ) -> Result<BoxStream<'static, DeviceInfo>, AppError> {
        let central = self.central()?.clone();
        // Subscribe before starting so nothing found early is missed
        let events = central.events().await?;
        central
            .start_scan(ScanFilter {
                services: filter.services.clone(),
            })
            .await?;
        self.scanning.store(true, Ordering::SeqCst);
        debug!("Hardware scan started");

        Ok(events
            .filter_map(move |event| {
                let central = central.clone();
                async move {
                    match event {
                        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                            let device = central.peripheral(&id).await.ok()?;
                            let properties = device
                                .properties()
                                .await
                                .ok()
                                .flatten()
                                .unwrap_or(PeripheralProperties::default());
                            Some(DeviceInfo {
                                id: id.to_string(),
                                name: properties.local_name,
                                address: properties.address.to_string(),
                                rssi: properties.rssi,
                                services: properties.services,
                                device: Some(device),
                            })
                        }
                        _ => None,
                    }
                }
            })
            .boxed())
    }

    async fn stop_scan(&self) -> Result<(), AppError> {
        if !self.scanning.swap(false, Ordering::SeqCst) {
            return Err(AppError::ScanNotRunning);
        }
        self.central()?.stop_scan().await?;
        debug!("Hardware scan stopped");
        Ok(())
    }
}

impl Connector for BtleplugBackend {
    fn connect(
        &self,
        device: &DeviceInfo,
    ) -> Result<(Box<dyn GattTransport>, TransportEvents), AppError> {
        let central = self.central()?.clone();
        let peripheral = device.device.clone().ok_or(AppError::MissingPeripheral)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let link = tokio::spawn(link_thread(central, peripheral.clone(), events_tx.clone()));
        let transport = BtleplugTransport {
            peripheral,
            events_tx,
            tasks: vec![link],
        };
        Ok((Box::new(transport), events_rx))
    }
}

/// Connects, then forwards notifications and disconnects until the link drops.
async fn link_thread(
    central: Adapter,
    peripheral: Peripheral,
    events_tx: UnboundedSender<TransportEvent>,
) {
    let mut central_events = match central.events().await {
        Ok(events) => events,
        Err(e) => {
            error!("BLE failure: {}", e);
            let _ = events_tx.send(TransportEvent::Disconnected);
            return;
        }
    };
    if let Err(e) = peripheral.connect().await {
        error!("BLE Connection error: {}", e);
        let _ = events_tx.send(TransportEvent::Disconnected);
        return;
    }
    let _ = events_tx.send(TransportEvent::Connected);

    let mut notifications = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to get BLE notification stream: {}", e);
            let _ = events_tx.send(TransportEvent::Disconnected);
            return;
        }
    };

    'link: loop {
        tokio::select! {
            Some(event) = central_events.next() => {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral.id() {
                        warn!("Device disconnected: {}", id);
                        let _ = events_tx.send(TransportEvent::Disconnected);
                        break 'link;
                    }
                }
            }
            Some(notification) = notifications.next() => {
                // Notifications only carry the characteristic UUID
                let service = peripheral
                    .characteristics()
                    .into_iter()
                    .find(|c| c.uuid == notification.uuid)
                    .map(|c| c.service_uuid);
                match service {
                    Some(service) => {
                        let _ = events_tx.send(TransportEvent::CharacteristicValue {
                            id: CharacteristicId::new(service, notification.uuid),
                            value: notification.value,
                        });
                    }
                    None => debug!("Notification from unknown characteristic {}", notification.uuid),
                }
            }
            _ = events_tx.closed() => {
                info!("Shutting down BLE link thread!");
                break 'link;
            }
            else => {
                let _ = events_tx.send(TransportEvent::Disconnected);
                break 'link;
            }
        }
    }
}

fn find_characteristic(peripheral: &Peripheral, id: CharacteristicId) -> Option<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == id.characteristic && c.service_uuid == id.service)
}

struct BtleplugTransport {
    peripheral: Peripheral,
    events_tx: UnboundedSender<TransportEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl BtleplugTransport {
    fn spawn<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(tokio::spawn(task));
    }
}

impl GattTransport for BtleplugTransport {
    fn discover_services(&mut self) -> Result<(), AppError> {
        let peripheral = self.peripheral.clone();
        let events_tx = self.events_tx.clone();
        self.spawn(async move {
            let success = match peripheral.discover_services().await {
                Ok(()) => {
                    debug!("Found {} characteristics", peripheral.characteristics().len());
                    true
                }
                Err(e) => {
                    error!("Couldn't read services from connected device: {}", e);
                    false
                }
            };
            let _ = events_tx.send(TransportEvent::ServicesDiscovered { success });
        });
        Ok(())
    }

    fn enable_notifications(&mut self, id: CharacteristicId) -> Result<(), AppError> {
        let peripheral = self.peripheral.clone();
        self.spawn(async move {
            let Some(characteristic) = find_characteristic(&peripheral, id) else {
                warn!("Didn't find {id} during notification setup!");
                return;
            };
            if let Err(e) = peripheral.subscribe(&characteristic).await {
                error!("Failed to subscribe to {id}: {e}");
            }
        });
        Ok(())
    }

    fn read_characteristic(&mut self, id: CharacteristicId) -> Result<(), AppError> {
        let peripheral = self.peripheral.clone();
        let events_tx = self.events_tx.clone();
        self.spawn(async move {
            let Some(characteristic) = find_characteristic(&peripheral, id) else {
                return;
            };
            if !characteristic.properties.contains(CharPropFlags::READ) {
                debug!("{id} is not readable, skipping initial read");
                return;
            }
            match peripheral.read(&characteristic).await {
                Ok(value) => {
                    let _ = events_tx.send(TransportEvent::CharacteristicValue { id, value });
                }
                Err(e) => warn!("Failed to read {id}: {e}"),
            }
        });
        Ok(())
    }

    fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let peripheral = self.peripheral.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    debug!("Disconnect on close failed: {e}");
                }
            });
        }
    }
}
