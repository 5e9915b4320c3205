//! btleplug backend.
//!
//! Selection scans for the configured scan window and picks the first
//! peripheral whose advertised name starts with the filter prefix. There is no
//! chooser dialog on a headless host, so [`TransportError::UserCancelled`] is
//! never produced here.
//!
//! Link loss is taken from the adapter's `DeviceDisconnected` events and merged
//! into the session's notification stream.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic as GattCharacteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    BleCentral, BlePeripheral, DeviceFilter, GattSession, LinkEvent, LinkEventStream,
    TransportError, TransportResult,
};

fn gatt(e: btleplug::Error) -> TransportError {
    TransportError::Gatt(e.to_string())
}

/// First Bluetooth adapter of the host.
pub struct BtleCentral {
    adapter: Adapter,
}

impl BtleCentral {
    /// Opens the first adapter, or fails with `Unavailable`.
    pub async fn new() -> TransportResult<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Unavailable("no Bluetooth adapter found".into()))?;
        Ok(Self { adapter })
    }
}

#[async_trait]
impl BleCentral for BtleCentral {
    async fn request_device(&self, filter: &DeviceFilter) -> TransportResult<Arc<dyn BlePeripheral>> {
        info!(prefix = %filter.name_prefix, window = ?filter.scan_window, "Scanning");
        self.adapter
            .start_scan(ScanFilter {
                services: vec![filter.service],
            })
            .await
            .map_err(gatt)?;
        tokio::time::sleep(filter.scan_window).await;

        let peripherals = self.adapter.peripherals().await.map_err(gatt);
        let _ = self.adapter.stop_scan().await;

        for peripheral in peripherals? {
            let Ok(Some(props)) = peripheral.properties().await else {
                continue;
            };
            let Some(name) = props.local_name else {
                continue;
            };
            if name.starts_with(&filter.name_prefix) {
                debug!(device = %name, "Matched advertisement");
                let found: Arc<dyn BlePeripheral> = Arc::new(BtlePeripheral {
                    adapter: self.adapter.clone(),
                    peripheral,
                    name,
                });
                return Ok(found);
            }
        }
        Err(TransportError::DeviceNotFound(filter.name_prefix.clone()))
    }
}

/// Remembered peripheral.
pub struct BtlePeripheral {
    adapter: Adapter,
    peripheral: Peripheral,
    name: String,
}

#[async_trait]
impl BlePeripheral for BtlePeripheral {
    fn id(&self) -> String {
        format!("{:?}", self.peripheral.id())
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn connect(&self, service: Uuid) -> TransportResult<Arc<dyn GattSession>> {
        if !self.peripheral.is_connected().await.map_err(gatt)? {
            self.peripheral.connect().await.map_err(gatt)?;
        }
        self.peripheral.discover_services().await.map_err(gatt)?;

        let characteristics: BTreeSet<GattCharacteristic> = self
            .peripheral
            .characteristics()
            .into_iter()
            .filter(|c| c.service_uuid == service)
            .collect();
        let session: Arc<dyn GattSession> = Arc::new(BtleSession {
            adapter: self.adapter.clone(),
            peripheral: self.peripheral.clone(),
            characteristics,
            events_taken: Mutex::new(false),
        });
        Ok(session)
    }
}

struct BtleSession {
    adapter: Adapter,
    peripheral: Peripheral,
    characteristics: BTreeSet<GattCharacteristic>,
    events_taken: Mutex<bool>,
}

impl BtleSession {
    fn find(&self, uuid: Uuid) -> TransportResult<&GattCharacteristic> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::MissingCharacteristic(uuid))
    }
}

#[async_trait]
impl GattSession for BtleSession {
    fn characteristics(&self) -> Vec<Uuid> {
        self.characteristics.iter().map(|c| c.uuid).collect()
    }

    async fn read(&self, characteristic: Uuid) -> TransportResult<Bytes> {
        let c = self.find(characteristic)?;
        let value = self.peripheral.read(c).await.map_err(gatt)?;
        Ok(Bytes::from(value))
    }

    async fn write(&self, characteristic: Uuid, value: &[u8]) -> TransportResult<()> {
        let c = self.find(characteristic)?;
        self.peripheral
            .write(c, value, WriteType::WithResponse)
            .await
            .map_err(gatt)
    }

    async fn subscribe(&self, characteristic: Uuid) -> TransportResult<()> {
        let c = self.find(characteristic)?;
        self.peripheral.subscribe(c).await.map_err(gatt)
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> TransportResult<()> {
        let c = self.find(characteristic)?;
        self.peripheral.unsubscribe(c).await.map_err(gatt)
    }

    async fn events(&self) -> TransportResult<LinkEventStream> {
        {
            let mut taken = self.events_taken.lock();
            if *taken {
                return Err(TransportError::Closed);
            }
            *taken = true;
        }

        let notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(gatt)?
            .map(|n| LinkEvent::Notification {
                characteristic: n.uuid,
                value: Bytes::from(n.value),
            });

        let id = self.peripheral.id();
        let disconnects = self
            .adapter
            .events()
            .await
            .map_err(gatt)?
            .filter_map(move |event| {
                let hit = matches!(&event, CentralEvent::DeviceDisconnected(p) if *p == id);
                async move {
                    hit.then(|| LinkEvent::Disconnected {
                        cause: "peripheral disconnected".to_string(),
                    })
                }
            });

        // Nothing after the first disconnect belongs to this session
        let mut seen_disconnect = false;
        let merged = futures::stream::select(notifications, disconnects).take_while(move |event| {
            let keep = !seen_disconnect;
            if matches!(event, LinkEvent::Disconnected { .. }) {
                seen_disconnect = true;
            }
            futures::future::ready(keep)
        });
        Ok(merged.boxed())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.peripheral.disconnect().await.map_err(gatt)
    }
}
