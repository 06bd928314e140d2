use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bluest::{Adapter, AdvertisingDevice, Characteristic, Device, Uuid};
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::error::{ConnectError, TransportError};

/// Write-only characteristic taking one JSON command per write.
pub const COMMAND_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000c304_0000_1000_8000_00805f9b34fb);
/// Characteristic the hub pushes JSON notifications on.
pub const NOTIFY_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000c305_0000_1000_8000_00805f9b34fb);

// Notifications buffered between the BLE stack and the dispatcher
const NOTIFICATION_BUFFER: usize = 64;
const CONNECT_RETRIES: u32 = 2;

/// A BLE device seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertiser {
    pub address: String,
    pub name: Option<String>,
}

/// The BLE operations the rest of the crate needs. One connected device at a time.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Collect every advertiser visible during `duration`.
    async fn scan(&self, duration: Duration) -> Result<Vec<Advertiser>, TransportError>;

    /// Return the first advertiser accepted by `predicate`, or `None` once `timeout` elapses.
    async fn scan_for(
        &self,
        predicate: &(dyn for<'a> Fn(&'a Advertiser) -> bool + Send + Sync),
        timeout: Duration,
    ) -> Result<Option<Advertiser>, TransportError>;

    /// Connect to a previously scanned device and locate the hub's characteristics.
    async fn connect(&self, address: &str) -> Result<(), ConnectError>;

    /// Start notifications. The receiver closes when the link drops.
    async fn subscribe(&self) -> Result<mpsc::Receiver<Vec<u8>>, TransportError>;

    async fn unsubscribe(&self) -> Result<(), TransportError>;

    /// Write without response.
    async fn write(&self, payload: &[u8]) -> Result<(), TransportError>;

    async fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

struct Link {
    device: Device,
    command: Characteristic,
    notify: Characteristic,
    forwarder: Option<JoinHandle<()>>,
}

/// [`Transport`] on top of the platform Bluetooth stack.
pub struct BluestTransport {
    adapter: Adapter,
    seen: Mutex<HashMap<String, Device>>,
    link: tokio::sync::Mutex<Option<Link>>,
}

impl BluestTransport {
    /// Open the default adapter and wait until it is powered on.
    pub async fn new() -> Result<Self, TransportError> {
        let adapter = Adapter::default().await.ok_or(TransportError::NoAdapter)?;
        adapter.wait_available().await?;
        debug!("bluetooth adapter available");
        log_connected_devices(&adapter).await;

        Ok(Self {
            adapter,
            seen: Mutex::new(HashMap::new()),
            link: tokio::sync::Mutex::new(None),
        })
    }

    async fn remember(&self, advertising: AdvertisingDevice) -> Advertiser {
        let name = match advertising.adv_data.local_name {
            Some(name) => Some(name),
            None => advertising.device.name_async().await.ok(),
        };
        let address = format!("{:?}", advertising.device.id());
        if let Ok(mut seen) = self.seen.lock() {
            seen.insert(address.clone(), advertising.device);
        }
        Advertiser { address, name }
    }

    fn seen_device(&self, address: &str) -> Option<Device> {
        self.seen.lock().ok().and_then(|seen| seen.get(address).cloned())
    }

    async fn connect_with_retries(&self, device: &Device) -> Result<(), bluest::Error> {
        if device.is_connected().await {
            return Ok(());
        }
        let mut retries = CONNECT_RETRIES;
        loop {
            match self.adapter.connect_device(device).await {
                Ok(()) => return Ok(()),
                Err(err) if retries > 0 => {
                    warn!(%err, retries, "failed to connect, retrying");
                    retries -= 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn find_characteristics(
        device: &Device,
    ) -> Result<(Option<Characteristic>, Option<Characteristic>), bluest::Error> {
        let mut command = None;
        let mut notify = None;
        for service in device.discover_services().await? {
            debug!(service = %service.uuid(), "service available");
            for characteristic in service.discover_characteristics().await? {
                let uuid = characteristic.uuid();
                if uuid == COMMAND_CHARACTERISTIC {
                    command = Some(characteristic);
                } else if uuid == NOTIFY_CHARACTERISTIC {
                    notify = Some(characteristic);
                }
            }
        }
        Ok((command, notify))
    }
}

// A hub already held by another central (usually the phone app) will not advertise.
async fn log_connected_devices(adapter: &Adapter) {
    match adapter.connected_devices().await {
        Ok(devices) if devices.is_empty() => debug!("no devices connected to the adapter"),
        Ok(devices) => {
            for device in devices {
                let name = device.name_async().await.unwrap_or_default();
                debug!(id = ?device.id(), %name, "device already connected to the adapter");
            }
        }
        Err(err) => debug!(%err, "could not list connected devices"),
    }
}

#[async_trait]
impl Transport for BluestTransport {
    async fn scan(&self, duration: Duration) -> Result<Vec<Advertiser>, TransportError> {
        let mut events = self.adapter.scan(&[]).await?;
        let deadline = Instant::now() + duration;
        let mut found: Vec<Advertiser> = Vec::new();

        while let Ok(Some(advertising)) = timeout_at(deadline, events.next()).await {
            let advertiser = self.remember(advertising).await;
            match found.iter_mut().find(|known| known.address == advertiser.address) {
                Some(known) if known.name.is_none() => known.name = advertiser.name,
                Some(_) => {}
                None => found.push(advertiser),
            }
        }

        Ok(found)
    }

    async fn scan_for(
        &self,
        predicate: &(dyn for<'a> Fn(&'a Advertiser) -> bool + Send + Sync),
        timeout: Duration,
    ) -> Result<Option<Advertiser>, TransportError> {
        let mut events = self.adapter.scan(&[]).await?;
        let deadline = Instant::now() + timeout;

        while let Ok(Some(advertising)) = timeout_at(deadline, events.next()).await {
            let advertiser = self.remember(advertising).await;
            if predicate(&advertiser) {
                return Ok(Some(advertiser));
            }
        }

        Ok(None)
    }

    async fn connect(&self, address: &str) -> Result<(), ConnectError> {
        let unreachable = |reason: String| ConnectError::Unreachable {
            address: address.to_string(),
            reason,
        };

        let device = self
            .seen_device(address)
            .ok_or_else(|| unreachable(TransportError::UnknownDevice(address.to_string()).to_string()))?;

        self.connect_with_retries(&device)
            .await
            .map_err(|err| unreachable(err.to_string()))?;

        let (command, notify) = Self::find_characteristics(&device)
            .await
            .map_err(|err| unreachable(err.to_string()))?;
        let command = command.ok_or_else(|| ConnectError::ProtocolMismatch {
            address: address.to_string(),
            missing: "command",
        })?;
        let notify = notify.ok_or_else(|| ConnectError::ProtocolMismatch {
            address: address.to_string(),
            missing: "notify",
        })?;

        info!(address, "connected");
        *self.link.lock().await = Some(Link { device, command, notify, forwarder: None });
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(TransportError::NotConnected)?;
        if let Some(previous) = link.forwarder.take() {
            previous.abort();
        }

        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();
        let notify = link.notify.clone();

        // The notification stream borrows the characteristic, so it lives inside the task.
        let forwarder = tokio::spawn(async move {
            let mut stream = match notify.notify().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            while let Some(item) = stream.next().await {
                match item {
                    Ok(data) => {
                        trace!(rx = %hex::encode(&data), "notification");
                        if tx.send(data).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(%err, "notification error");
                        break;
                    }
                }
            }
            debug!("notification stream ended");
        });

        match ready_rx.await {
            Ok(Ok(())) => {
                link.forwarder = Some(forwarder);
                Ok(rx)
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(TransportError::NotificationsUnavailable),
        }
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(TransportError::NotConnected)?;
        // Dropping the stream ends the subscription.
        if let Some(forwarder) = link.forwarder.take() {
            forwarder.abort();
        }
        Ok(())
    }

    async fn write(&self, payload: &[u8]) -> Result<(), TransportError> {
        let guard = self.link.lock().await;
        let link = guard.as_ref().ok_or(TransportError::NotConnected)?;
        trace!(tx = %String::from_utf8_lossy(payload), "write");
        link.command.write_without_response(payload).await?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        match self.link.lock().await.as_ref() {
            Some(link) => link.device.is_connected().await,
            None => false,
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(mut link) = self.link.lock().await.take() else {
            return Ok(());
        };
        if let Some(forwarder) = link.forwarder.take() {
            forwarder.abort();
        }
        self.adapter.disconnect_device(&link.device).await?;
        Ok(())
    }
}
