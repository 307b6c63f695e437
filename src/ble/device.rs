//! One physical connection, shared by any number of characteristic subscriptions.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use super::{CharacteristicId, Connector, DeviceInfo, GattTransport, TransportEvent, TransportEvents};
use crate::conflated::{self, ConflatedReceiver, ConflatedSender};
use crate::control::ControlThread;
use crate::errors::AppError;

type Decoder<T> = Box<dyn Fn(&[u8]) -> Result<T, AppError> + Send>;

trait Armable: Send {
    fn id(&self) -> CharacteristicId;
    fn deliver(&mut self, value: &[u8]);
    fn close(&mut self);
}

struct CharacteristicSubscription<T> {
    id: CharacteristicId,
    decode: Decoder<T>,
    tx: Option<ConflatedSender<T>>,
}

impl<T: Send + Sync> Armable for CharacteristicSubscription<T> {
    fn id(&self) -> CharacteristicId {
        self.id
    }

    fn deliver(&mut self, value: &[u8]) {
        let Some(tx) = &self.tx else {
            return;
        };
        match (self.decode)(value) {
            Ok(decoded) => tx.send(decoded),
            Err(e) => warn!("Dropping undecodable value from {}: {e}", self.id),
        }
    }

    fn close(&mut self) {
        // Dropping the sender is the end-of-stream signal
        self.tx = None;
    }
}

struct Link {
    transport: Box<dyn GattTransport>,
    events: TransportEvents,
    services_discovered: bool,
}

impl Link {
    fn arm(&mut self, subscription: &dyn Armable) {
        let id = subscription.id();
        debug!("Arming notifications for {id}");
        if let Err(e) = self.transport.enable_notifications(id) {
            warn!("Couldn't enable notifications for {id}: {e}");
            return;
        }
        if let Err(e) = self.transport.read_characteristic(id) {
            warn!("Initial read of {id} failed: {e}");
        }
    }
}

/// Owns the connection to a single device and multiplexes characteristic
/// subscriptions over it.
///
/// The session does nothing on its own: whoever owns it pulls events with
/// [`DeviceSession::next_event`] and hands them back to
/// [`DeviceSession::handle_event`] from the control thread.
pub struct DeviceSession {
    control: ControlThread,
    connector: Arc<dyn Connector>,
    device: DeviceInfo,
    link: Option<Link>,
    subscriptions: Vec<Box<dyn Armable>>,
    closed: bool,
}

impl DeviceSession {
    pub fn new(control: ControlThread, connector: Arc<dyn Connector>, device: DeviceInfo) -> Self {
        control.check();
        Self {
            control,
            connector,
            device,
            link: None,
            subscriptions: Vec::new(),
            closed: false,
        }
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn services_discovered(&self) -> bool {
        self.link.as_ref().is_some_and(|l| l.services_discovered)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Registers interest in `id`, connecting first if needed.
    ///
    /// The returned stream yields every decoded value and ends when the device
    /// disconnects or the session is closed.
    pub fn subscribe<T, F>(
        &mut self,
        id: CharacteristicId,
        decode: F,
    ) -> Result<ConflatedReceiver<T>, AppError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&[u8]) -> Result<T, AppError> + Send + 'static,
    {
        self.control.check();
        assert!(!self.closed, "subscribe() on a closed device session");

        if self.link.is_none() {
            info!(
                "Connecting to {} ({})",
                self.device.display_name(),
                self.device.address
            );
            let (transport, events) = self.connector.connect(&self.device)?;
            self.link = Some(Link {
                transport,
                events,
                services_discovered: false,
            });
        }

        let (tx, rx) = conflated::channel();
        let subscription = CharacteristicSubscription {
            id,
            decode: Box::new(decode),
            tx: Some(tx),
        };
        if let Some(link) = self.link.as_mut().filter(|l| l.services_discovered) {
            link.arm(&subscription);
        }
        self.subscriptions.push(Box::new(subscription));
        Ok(rx)
    }

    /// Waits for the next transport event. Never resolves without a link.
    ///
    /// Cancel safe. A transport that drops its event channel is reported as
    /// [`TransportEvent::Disconnected`].
    pub async fn next_event(&mut self) -> TransportEvent {
        match self.link.as_mut() {
            Some(link) => link
                .events
                .recv()
                .await
                .unwrap_or(TransportEvent::Disconnected),
            None => std::future::pending().await,
        }
    }

    pub fn handle_event(&mut self, event: TransportEvent) {
        self.control.check();
        let Some(link) = self.link.as_mut() else {
            trace!("Ignoring {event:?} without a link");
            return;
        };
        match event {
            TransportEvent::Connected => {
                info!("Connected to {}", self.device.display_name());
                if let Err(e) = link.transport.discover_services() {
                    warn!("Service discovery request failed: {e}");
                }
            }
            TransportEvent::ServicesDiscovered { success: true } => {
                debug!("Services discovered, arming {} subscription(s)", self.subscriptions.len());
                link.services_discovered = true;
                for subscription in &self.subscriptions {
                    link.arm(subscription.as_ref());
                }
            }
            TransportEvent::ServicesDiscovered { success: false } => {
                warn!("Service discovery failed on {}", self.device.display_name());
            }
            TransportEvent::Disconnected => {
                info!("{} disconnected", self.device.display_name());
                self.teardown();
            }
            TransportEvent::CharacteristicValue { id, value } => {
                for subscription in self.subscriptions.iter_mut().filter(|s| s.id() == id) {
                    subscription.deliver(&value);
                }
            }
        }
    }

    /// Drops the link and ends every subscription stream.
    ///
    /// # Panics
    ///
    /// Off the control thread, or when called a second time.
    pub fn close(&mut self) {
        self.control.check();
        assert!(!self.closed, "device session closed twice");
        self.closed = true;
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.transport.close();
        }
        for mut subscription in self.subscriptions.drain(..) {
            subscription.close();
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if !self.closed {
            self.teardown();
        }
    }
}
