//! BLE client for provisioning Improv devices
//!
//! Scans for devices advertising the Improv service, connects through
//! btleplug, and drives a [`Session`] over the connection.

use std::collections::HashMap;
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, Characteristic as GattCharacteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{StreamExt, future, stream};
use improv_proto::{Characteristic, Credentials};
use log::{debug, info};
use uuid::Uuid;

use crate::config::ProvisionConfig;
use crate::device::DeviceHandle;
use crate::outcome::Outcome;
use crate::registry::{ConcurrentSessionError, SessionRegistry};
use crate::session::{Session, SessionError, State};
use crate::transport::{Notification, NotificationStream, Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("no Bluetooth adapter found")]
    NoAdapter,
    #[error("no Improv devices found")]
    NoDevicesFound,
    #[error("no device matching {0:?}")]
    NotFound(String),
    #[error(transparent)]
    Ble(#[from] btleplug::Error),
}

/// A device seen during a scan
#[derive(Debug, Clone)]
pub struct ImprovDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
    /// Advertises the Improv service
    pub is_improv: bool,
    peripheral: Peripheral,
}

impl ImprovDevice {
    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle::new(&self.address, &self.name)
    }
}

fn service_uuid() -> Uuid {
    Uuid::from_u128(Characteristic::service_u128())
}

/// Get the default Bluetooth adapter
pub async fn get_adapter() -> Result<Adapter, DiscoveryError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(DiscoveryError::NoAdapter)
}

/// Scan for BLE devices
///
/// Returns everything seen. Improv devices have `is_improv = true`.
pub async fn scan(
    adapter: &Adapter,
    duration: Duration,
) -> Result<Vec<ImprovDevice>, DiscoveryError> {
    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(duration).await;

    let peripherals = adapter.peripherals().await?;
    let mut devices = Vec::new();

    for peripheral in peripherals {
        if let Some(props) = peripheral.properties().await? {
            let name = props.local_name.unwrap_or_else(|| "Unknown".to_string());
            let address = peripheral.address().to_string();
            let is_improv = props.services.contains(&service_uuid());

            devices.push(ImprovDevice {
                name,
                address,
                rssi: props.rssi,
                is_improv,
                peripheral,
            });
        }
    }

    adapter.stop_scan().await?;
    debug!("scan found {} devices", devices.len());
    Ok(devices)
}

/// Improv devices in range, strongest signal first
pub async fn discover(
    adapter: &Adapter,
    duration: Duration,
) -> Result<Vec<ImprovDevice>, DiscoveryError> {
    let mut devices: Vec<_> = scan(adapter, duration)
        .await?
        .into_iter()
        .filter(|d| d.is_improv)
        .collect();
    if devices.is_empty() {
        return Err(DiscoveryError::NoDevicesFound);
    }
    devices.sort_by_key(|d| std::cmp::Reverse(d.rssi.unwrap_or(i16::MIN)));
    Ok(devices)
}

/// Find a device by name/address pattern, or the first Improv device
pub async fn find_device(
    adapter: &Adapter,
    target: Option<&str>,
    duration: Duration,
) -> Result<ImprovDevice, DiscoveryError> {
    let mut devices = scan(adapter, duration).await?;
    devices.sort_by_key(|d| std::cmp::Reverse(d.rssi.unwrap_or(i16::MIN)));

    match devices
        .into_iter()
        .find(|d| matches(target, &d.name, &d.address, d.is_improv))
    {
        Some(device) => Ok(device),
        None => match target {
            Some(t) => Err(DiscoveryError::NotFound(t.to_string())),
            None => Err(DiscoveryError::NoDevicesFound),
        },
    }
}

/// A named device is taken even if it does not advertise the service,
/// negotiation decides whether it is usable
fn matches(target: Option<&str>, name: &str, address: &str, is_improv: bool) -> bool {
    match target {
        Some(t) => name.contains(t) || address.eq_ignore_ascii_case(t),
        None => is_improv,
    }
}

/// [`Transport`] over a connected btleplug peripheral
pub struct BtleTransport {
    adapter: Adapter,
    peripheral: Peripheral,
    characteristics: HashMap<Characteristic, GattCharacteristic>,
}

impl BtleTransport {
    /// Connect and discover the Improv characteristics the device exposes
    pub async fn connect(
        adapter: &Adapter,
        device: &ImprovDevice,
    ) -> Result<Self, TransportError> {
        let peripheral = device.peripheral.clone();
        peripheral.connect().await.map_err(ble_err)?;
        peripheral.discover_services().await.map_err(ble_err)?;

        let service = service_uuid();
        let characteristics: HashMap<_, _> = peripheral
            .characteristics()
            .into_iter()
            .filter(|c| c.service_uuid == service)
            .filter_map(|c| Characteristic::from_u128(c.uuid.as_u128()).map(|k| (k, c)))
            .collect();
        debug!("{}: found {} Improv characteristics", device.address, characteristics.len());

        Ok(Self {
            adapter: adapter.clone(),
            peripheral,
            characteristics,
        })
    }
}

fn ble_err(e: btleplug::Error) -> TransportError {
    TransportError::Ble(e.to_string())
}

impl Transport for BtleTransport {
    async fn read(
        &mut self,
        characteristic: Characteristic,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let Some(gatt) = self.characteristics.get(&characteristic) else {
            return Ok(None);
        };
        self.peripheral
            .read(gatt)
            .await
            .map(Some)
            .map_err(|e| TransportError::Read(characteristic, e.to_string()))
    }

    async fn write(
        &mut self,
        characteristic: Characteristic,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let gatt = self.characteristics.get(&characteristic).ok_or_else(|| {
            TransportError::Write(characteristic, "not exposed by device".to_string())
        })?;
        self.peripheral
            .write(gatt, data, WriteType::WithResponse)
            .await
            .map_err(|e| TransportError::Write(characteristic, e.to_string()))
    }

    async fn subscribe(
        &mut self,
        characteristics: &[Characteristic],
    ) -> Result<NotificationStream, TransportError> {
        // take the stream first so nothing sent right after subscribing is lost
        let values = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        let events = self.adapter.events().await.map_err(ble_err)?;

        for characteristic in characteristics {
            match self.characteristics.get(characteristic) {
                Some(gatt) => self
                    .peripheral
                    .subscribe(gatt)
                    .await
                    .map_err(|e| TransportError::Subscribe(e.to_string()))?,
                None => debug!("{characteristic:?} not exposed, not subscribing"),
            }
        }

        let values = values.filter_map(|n| {
            let characteristic = Characteristic::from_u128(n.uuid.as_u128());
            future::ready(characteristic.map(|c| Some(Notification::new(c, n.value))))
        });
        let id = self.peripheral.id();
        let gone = events.filter_map(move |event| {
            future::ready(match event {
                CentralEvent::DeviceDisconnected(d) if d == id => Some(None),
                _ => None,
            })
        });

        Ok(stream::select(values, gone)
            .take_while(|n| future::ready(n.is_some()))
            .filter_map(future::ready)
            .boxed())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.peripheral.disconnect().await.map_err(ble_err)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Concurrent(#[from] ConcurrentSessionError),
    #[error("failed to connect: {0}")]
    Connect(#[from] TransportError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl ProvisionError {
    /// The user-facing key for this error
    pub fn outcome(&self) -> Outcome {
        match self {
            ProvisionError::Discovery(e) => Outcome::from_discovery_error(e),
            ProvisionError::Session(SessionError::Failed(reason)) => Outcome::from_failure(reason),
            _ => Outcome::Unknown,
        }
    }
}

/// Claim the device, connect and negotiate
///
/// The returned session may already be terminal, e.g. `characteristic_missing`;
/// check [`Session::outcome`].
pub async fn open_session(
    adapter: &Adapter,
    device: &ImprovDevice,
    registry: &SessionRegistry,
    config: &ProvisionConfig,
) -> Result<Session<BtleTransport>, ProvisionError> {
    let guard = registry.acquire(&device.address)?;
    info!("connecting to {} ({})", device.name, device.address);
    let transport = BtleTransport::connect(adapter, device).await?;

    let mut session = Session::new(transport, device.handle(), config.clone(), guard);
    session.start().await;
    Ok(session)
}

/// Provision a device with Wi-Fi credentials
///
/// # Arguments
/// * `target` - Device name/address pattern, or None to use the first Improv device
/// * `credentials` - Network to join
/// * `observe` - Called once the session reaches the menu, before credentials
///   are sent. Use it to take a [`CancelHandle`](crate::CancelHandle) or
///   [`Session::watch`] the flow.
pub async fn provision<F>(
    target: Option<&str>,
    credentials: &Credentials,
    registry: &SessionRegistry,
    config: &ProvisionConfig,
    observe: F,
) -> Result<Outcome, ProvisionError>
where
    F: FnOnce(&Session<BtleTransport>),
{
    let adapter = get_adapter().await?;
    let device = find_device(&adapter, target, config.scan_duration).await?;
    let mut session = open_session(&adapter, &device, registry, config).await?;
    if let Some(outcome) = session.outcome() {
        return Ok(outcome);
    }
    observe(&session);
    Ok(session.provision(credentials).await?)
}

/// Ask a device to identify itself, then disconnect
pub async fn identify(
    target: Option<&str>,
    registry: &SessionRegistry,
    config: &ProvisionConfig,
) -> Result<(), ProvisionError> {
    let adapter = get_adapter().await?;
    let device = find_device(&adapter, target, config.scan_duration).await?;
    let mut session = open_session(&adapter, &device, registry, config).await?;
    if let State::Failed(reason) = session.state() {
        return Err(SessionError::Failed(reason).into());
    }
    session.identify().await?;
    session.close().await;
    Ok(())
}
