//! The `btleplug`-backed [`Transport`] implementation (§6.3), feature
//! gated behind `ble` since it needs a platform BLE stack unavailable
//! in a typical test runner.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time;
use uuid::Uuid;

use super::protocol::{parse_peer_id, CHARACTERISTIC_UUID, SERVICE_UUID};
use crate::transport::{Transport, TransportEvent};

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
const SCAN_RESTART_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct PeripheralConnection {
    peripheral: Peripheral,
    characteristic: Characteristic,
    last_activity: Instant,
}

/// Scans, connects, and exchanges packets over Bluetooth LE.
///
/// Every field is independently `Arc`-shared so the background scan
/// loop and per-peripheral notification loops can each hold a cheap
/// clone of this struct rather than borrowing `&self` across a
/// `tokio::spawn` boundary, mirroring the handle-cloning shape the
/// rest of this module's teacher code used for its service struct.
pub struct BleTransport {
    adapter: Arc<Mutex<Option<Adapter>>>,
    connections: Arc<RwLock<HashMap<PeripheralId, PeripheralConnection>>>,
    peer_to_device: Arc<RwLock<HashMap<[u8; 8], PeripheralId>>>,
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
    running: Arc<RwLock<bool>>,
}

impl BleTransport {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            adapter: Arc::new(Mutex::new(None)),
            connections: Arc::new(RwLock::new(HashMap::new())),
            peer_to_device: Arc::new(RwLock::new(HashMap::new())),
            service_uuid: Uuid::parse_str(SERVICE_UUID)?,
            characteristic_uuid: Uuid::parse_str(CHARACTERISTIC_UUID)?,
            running: Arc::new(RwLock::new(false)),
        })
    }

    async fn attempt_connection(
        &self,
        device_id: PeripheralId,
        events: &mpsc::Sender<TransportEvent>,
    ) -> anyhow::Result<()> {
        if self.connections.read().await.contains_key(&device_id) {
            return Ok(());
        }

        let adapter_guard = self.adapter.lock().await;
        let adapter = adapter_guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("adapter not initialized"))?;
        let peripheral = adapter.peripheral(&device_id).await?;
        drop(adapter_guard);

        debug!("attempting connection to {:?}", device_id);
        match tokio::time::timeout(CONNECTION_TIMEOUT, peripheral.connect()).await {
            Ok(Ok(())) => {
                self.setup_connection(peripheral, events).await?;
            }
            Ok(Err(e)) => warn!("failed to connect to {:?}: {}", device_id, e),
            Err(_) => warn!("connection timeout for {:?}", device_id),
        }
        Ok(())
    }

    async fn setup_connection(
        &self,
        peripheral: Peripheral,
        events: &mpsc::Sender<TransportEvent>,
    ) -> anyhow::Result<()> {
        let device_id = peripheral.id();
        peripheral.discover_services().await?;

        let services = peripheral.services();
        let service = services
            .iter()
            .find(|s| s.uuid == self.service_uuid)
            .ok_or_else(|| anyhow::anyhow!("mesh service not advertised by this peripheral"))?;
        let characteristic = service
            .characteristics
            .iter()
            .find(|c| c.uuid == self.characteristic_uuid)
            .ok_or_else(|| anyhow::anyhow!("mesh characteristic missing"))?
            .clone();

        peripheral.subscribe(&characteristic).await?;

        self.connections.write().await.insert(
            device_id.clone(),
            PeripheralConnection {
                peripheral: peripheral.clone(),
                characteristic,
                last_activity: Instant::now(),
            },
        );

        let properties = peripheral.properties().await?;
        let peer_id = properties
            .as_ref()
            .and_then(|p| p.local_name.as_deref())
            .and_then(parse_peer_id);

        if let Some(peer_id) = peer_id {
            self.peer_to_device.write().await.insert(peer_id, device_id.clone());
            let digest = properties
                .as_ref()
                .and_then(|p| p.manufacturer_data.values().next())
                .and_then(|bytes| bytes.clone().try_into().ok());
            let rssi = properties.as_ref().and_then(|p| p.rssi);
            let _ = events
                .send(TransportEvent::PeerDiscovered { peer_id, digest, rssi })
                .await;
        }

        let handle = self.shared_handle();
        let events = events.clone();
        let device_id_for_task = device_id.clone();
        let peripheral_for_task = peripheral.clone();
        tokio::spawn(async move {
            let Ok(mut notifications) = peripheral_for_task.notifications().await else {
                return;
            };
            while let Some(notification) = notifications.next().await {
                handle.handle_bytes(&device_id_for_task, notification.value, &events).await;
            }
            handle.handle_disconnect(&device_id_for_task, &events).await;
        });

        info!("connection established with {:?}", device_id);
        Ok(())
    }

    async fn handle_bytes(
        &self,
        device_id: &PeripheralId,
        bytes: Vec<u8>,
        events: &mpsc::Sender<TransportEvent>,
    ) {
        if let Some(connection) = self.connections.write().await.get_mut(device_id) {
            connection.last_activity = Instant::now();
        }

        let peer_id = self
            .peer_to_device
            .read()
            .await
            .iter()
            .find(|(_, d)| *d == device_id)
            .map(|(peer, _)| *peer);

        if let Some(peer_id) = peer_id {
            let _ = events.send(TransportEvent::BytesReceived { peer_id, bytes }).await;
        } else {
            debug!("dropping bytes from unidentified device {:?}", device_id);
        }
    }

    async fn handle_disconnect(&self, device_id: &PeripheralId, events: &mpsc::Sender<TransportEvent>) {
        self.connections.write().await.remove(device_id);
        let mut peer_to_device = self.peer_to_device.write().await;
        let peer_id = peer_to_device
            .iter()
            .find(|(_, d)| *d == device_id)
            .map(|(peer, _)| *peer);
        if let Some(peer_id) = peer_id {
            peer_to_device.remove(&peer_id);
            drop(peer_to_device);
            let _ = events.send(TransportEvent::PeerLost { peer_id }).await;
        }
    }

    /// A cheap clone sharing the same underlying state, for handing to
    /// spawned background tasks.
    fn shared_handle(&self) -> Self {
        Self {
            adapter: self.adapter.clone(),
            connections: self.connections.clone(),
            peer_to_device: self.peer_to_device.clone(),
            service_uuid: self.service_uuid,
            characteristic_uuid: self.characteristic_uuid,
            running: self.running.clone(),
        }
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn start(&self, events: mpsc::Sender<TransportEvent>) -> anyhow::Result<()> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no Bluetooth adapter found"))?;

        let scan_filter = ScanFilter {
            services: vec![self.service_uuid],
        };
        adapter.start_scan(scan_filter).await?;

        let scan_events = adapter.events().await?;
        *self.adapter.lock().await = Some(adapter);
        *self.running.write().await = true;

        let handle = self.shared_handle();
        let events_for_scan = events.clone();
        tokio::spawn(async move {
            let mut scan_events = scan_events;
            while let Some(event) = scan_events.next().await {
                if let CentralEvent::DeviceDiscovered(id) = event {
                    if let Err(e) = handle.attempt_connection(id, &events_for_scan).await {
                        error!("error attempting connection: {}", e);
                    }
                }
            }
        });

        let handle = self.shared_handle();
        tokio::spawn(async move {
            let mut interval = time::interval(SCAN_RESTART_INTERVAL);
            loop {
                interval.tick().await;
                if !*handle.running.read().await {
                    break;
                }
                let adapter_guard = handle.adapter.lock().await;
                if let Some(adapter) = adapter_guard.as_ref() {
                    let _ = adapter.stop_scan().await;
                    let scan_filter = ScanFilter {
                        services: vec![handle.service_uuid],
                    };
                    let _ = adapter.start_scan(scan_filter).await;
                }
            }
        });

        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        *self.running.write().await = false;
        if let Some(adapter) = self.adapter.lock().await.as_ref() {
            let _ = adapter.stop_scan().await;
        }
        let connections = self.connections.read().await;
        for connection in connections.values() {
            let _ = connection.peripheral.disconnect().await;
        }
        drop(connections);
        self.connections.write().await.clear();
        self.peer_to_device.write().await.clear();
        Ok(())
    }

    async fn emit(&self, peer_id: Option<[u8; 8]>, bytes: Vec<u8>) -> anyhow::Result<()> {
        match peer_id {
            Some(peer_id) => {
                let device_id = self
                    .peer_to_device
                    .read()
                    .await
                    .get(&peer_id)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("no open connection to peer"))?;
                let connections = self.connections.read().await;
                let connection = connections
                    .get(&device_id)
                    .ok_or_else(|| anyhow::anyhow!("connection dropped"))?;
                connection
                    .peripheral
                    .write(&connection.characteristic, &bytes, WriteType::WithoutResponse)
                    .await?;
            }
            None => {
                let connections = self.connections.read().await;
                for connection in connections.values() {
                    if let Err(e) = connection
                        .peripheral
                        .write(&connection.characteristic, &bytes, WriteType::WithoutResponse)
                        .await
                    {
                        warn!("broadcast write failed: {}", e);
                    }
                }
            }
        }
        Ok(())
    }
}
