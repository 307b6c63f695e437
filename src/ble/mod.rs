pub mod hardware;
pub mod device;
pub mod scan;
pub mod simulated;

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::errors::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    On,
    Off,
}

impl From<bool> for AdapterState {
    fn from(enabled: bool) -> Self {
        if enabled {
            AdapterState::On
        } else {
            AdapterState::Off
        }
    }
}

/// A GATT characteristic, addressed by the service that contains it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacteristicId {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicId {
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// A peripheral found while scanning.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub id: String,
    pub name: Option<String>,
    pub address: String,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
    /// Only present for devices found by the real adapter
    pub device: Option<btleplug::platform::Peripheral>,
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>, name: Option<&str>, services: Vec<Uuid>) -> Self {
        let id = id.into();
        Self {
            address: id.clone(),
            id,
            name: name.map(str::to_owned),
            services,
            ..Default::default()
        }
    }

    /// Local name if advertised, otherwise the address.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => self.address.clone(),
        }
    }
}

/// Which scan results are worth connecting to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    /// Any of these services must be advertised. Empty accepts everything.
    pub services: Vec<Uuid>,
    pub name_prefix: Option<String>,
}

impl DeviceFilter {
    pub fn for_service(service: Uuid) -> Self {
        Self {
            services: vec![service],
            name_prefix: None,
        }
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.name_prefix = (!prefix.is_empty()).then_some(prefix);
        self
    }

    pub fn matches(&self, device: &DeviceInfo) -> bool {
        let service_ok = self.services.is_empty()
            || device.services.iter().any(|s| self.services.contains(s));
        let name_ok = match &self.name_prefix {
            Some(prefix) => device
                .name
                .as_deref()
                .is_some_and(|name| name.starts_with(prefix.as_str())),
            None => true,
        };
        service_ok && name_ok
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "services {:?}", self.services)?;
        if let Some(prefix) = &self.name_prefix {
            write!(f, ", name starting with {prefix:?}")?;
        }
        Ok(())
    }
}

/// Everything a GATT client reports back, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    ServicesDiscovered { success: bool },
    /// Result of a read or a notification
    CharacteristicValue {
        id: CharacteristicId,
        value: Vec<u8>,
    },
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Power state of the local adapter.
#[async_trait]
pub trait AdapterSource: Send + Sync {
    async fn is_present(&self) -> bool;
    async fn is_enabled(&self) -> Result<bool, AppError>;
    /// Registers an observer. Dropping the stream unregisters it.
    async fn observe_state_changes(&self) -> Result<BoxStream<'static, AdapterState>, AppError>;
}

#[async_trait]
pub trait Scanner: Send + Sync {
    async fn start_scan(
        &self,
        filter: &DeviceFilter,
    ) -> Result<BoxStream<'static, DeviceInfo>, AppError>;
    /// May fail if no scan is running.
    async fn stop_scan(&self) -> Result<(), AppError>;
}

/// Opens GATT links. Connecting doesn't wait: progress arrives as
/// [`TransportEvent`]s on the returned receiver.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        device: &DeviceInfo,
    ) -> Result<(Box<dyn GattTransport>, TransportEvents), AppError>;
}

/// Requests against an open GATT link. Each one completes asynchronously,
/// with its outcome reported on the link's event stream.
pub trait GattTransport: Send {
    fn discover_services(&mut self) -> Result<(), AppError>;
    /// Writes the client characteristic configuration descriptor.
    fn enable_notifications(&mut self, id: CharacteristicId) -> Result<(), AppError>;
    fn read_characteristic(&mut self, id: CharacteristicId) -> Result<(), AppError>;
    fn close(&mut self);
}
