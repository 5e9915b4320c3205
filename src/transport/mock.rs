//! In-memory Edge AI peripheral.
//!
//! Simulates the board's GATT surface without a radio: characteristic values,
//! notification subscriptions, a scripted model-status queue, and injectable
//! faults (failed connects, failed writes, link drops, chooser cancellation).
//! Every write is recorded so tests can assert on exact wire traffic.
//!
//! All delays use `tokio::time::sleep`, so tests with a paused clock run
//! instantly.
//!
//! # Example
//!
//! ```rust,ignore
//! let device = MockPeripheral::edge_ai("SevernEdgeAI-3");
//! let central = MockCentral::new(device.clone());
//! let manager = ConnectionManager::open(Arc::new(central), LinkConfig::default())?;
//! manager.connect().await?;
//! device.notify(SENSOR_CHAR_UUID, RawSample::default().to_frame().to_vec());
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use super::{
    BleCentral, BlePeripheral, DeviceFilter, GattSession, LinkEvent, LinkEventStream,
    TransportError, TransportResult,
};
use crate::protocol::{
    Characteristic, DeviceConfig, UploadPhase, UploadResultCode, UploadStatus, BATTERY_POWERED,
    MODEL_STATUS_CHAR_UUID,
};

// =============================================================================
// MockCentral
// =============================================================================

/// Device chooser that always offers one peripheral.
pub struct MockCentral {
    peripheral: Arc<MockPeripheral>,
    cancel_next: AtomicBool,
    unavailable: Mutex<Option<String>>,
    requests: AtomicUsize,
}

impl MockCentral {
    /// Central whose chooser always offers `peripheral`.
    pub fn new(peripheral: Arc<MockPeripheral>) -> Self {
        Self {
            peripheral,
            cancel_next: AtomicBool::new(false),
            unavailable: Mutex::new(None),
            requests: AtomicUsize::new(0),
        }
    }

    /// The next chooser is dismissed by the "user".
    pub fn cancel_next_request(&self) {
        self.cancel_next.store(true, Ordering::SeqCst);
    }

    /// Every request fails as if no Bluetooth stack were present.
    pub fn set_unavailable(&self, message: impl Into<String>) {
        *self.unavailable.lock() = Some(message.into());
    }

    /// Number of chooser invocations so far.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BleCentral for MockCentral {
    async fn request_device(&self, filter: &DeviceFilter) -> TransportResult<Arc<dyn BlePeripheral>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.unavailable.lock().clone() {
            return Err(TransportError::Unavailable(message));
        }
        if self.cancel_next.swap(false, Ordering::SeqCst) {
            return Err(TransportError::UserCancelled);
        }
        if !self.peripheral.name.starts_with(&filter.name_prefix) {
            return Err(TransportError::DeviceNotFound(filter.name_prefix.clone()));
        }
        let peripheral: Arc<dyn BlePeripheral> = self.peripheral.clone();
        Ok(peripheral)
    }
}

// =============================================================================
// MockPeripheral
// =============================================================================

struct LinkHandle {
    id: u64,
    open: AtomicBool,
    tx: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
    subscriptions: Mutex<HashSet<Uuid>>,
}

impl LinkHandle {
    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.tx.lock().take();
        self.subscriptions.lock().clear();
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[derive(Default)]
struct DeviceState {
    characteristics: Vec<Uuid>,
    values: HashMap<Uuid, Bytes>,
    status_queue: VecDeque<Bytes>,
    writes: Vec<(Uuid, Bytes)>,
    write_counts: HashMap<Uuid, usize>,
    failing_writes: HashMap<Uuid, usize>,
    failing_connects: u32,
    connect_delay: Duration,
    connects: u32,
    next_link_id: u64,
    link: Option<Arc<LinkHandle>>,
}

/// Simulated Edge AI board.
pub struct MockPeripheral {
    name: String,
    state: Arc<Mutex<DeviceState>>,
}

impl MockPeripheral {
    /// Board exposing every Edge AI characteristic with plausible values.
    pub fn edge_ai(name: impl Into<String>) -> Arc<Self> {
        let mut state = DeviceState {
            characteristics: Characteristic::ALL.iter().map(|c| c.uuid()).collect(),
            ..Default::default()
        };
        state.values.insert(
            Characteristic::DeviceInfo.uuid(),
            Bytes::from(default_device_info()),
        );
        let config = DeviceConfig {
            sample_rate_hz: 50,
            window_size: 100,
        };
        if let Ok(bytes) = config.encode() {
            state
                .values
                .insert(Characteristic::Config.uuid(), Bytes::copy_from_slice(&bytes));
        }
        let idle = UploadStatus {
            phase: UploadPhase::Idle,
            progress: 0,
            code: UploadResultCode::Ready,
        };
        state
            .values
            .insert(MODEL_STATUS_CHAR_UUID, Bytes::copy_from_slice(&idle.encode()));

        Arc::new(Self {
            name: name.into(),
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Removes a characteristic from the service table.
    pub fn remove_characteristic(&self, uuid: Uuid) {
        self.state.lock().characteristics.retain(|c| *c != uuid);
    }

    /// Sets the value returned by reads of `uuid`.
    pub fn set_value(&self, uuid: Uuid, value: impl Into<Bytes>) {
        self.state.lock().values.insert(uuid, value.into());
    }

    /// Queues a status record; each status read pops one until the queue is
    /// empty, after which the last popped value keeps being returned.
    pub fn push_status(&self, status: UploadStatus) {
        self.state
            .lock()
            .status_queue
            .push_back(Bytes::copy_from_slice(&status.encode()));
    }

    /// The next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().failing_connects = count;
    }

    /// Connection attempts take `delay` before resolving.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    /// The write with 0-based index `nth` (counted per characteristic from
    /// now) fails.
    pub fn fail_write(&self, uuid: Uuid, nth: usize) {
        let mut state = self.state.lock();
        let done = state.write_counts.get(&uuid).copied().unwrap_or(0);
        state.failing_writes.insert(uuid, done + nth);
    }

    /// Successful connections so far.
    pub fn connect_count(&self) -> u32 {
        self.state.lock().connects
    }

    /// Whether a link is open.
    pub fn is_connected(&self) -> bool {
        self.state
            .lock()
            .link
            .as_ref()
            .is_some_and(|l| l.open.load(Ordering::SeqCst))
    }

    /// Whether the open link has notifications enabled on `uuid`.
    pub fn is_subscribed(&self, uuid: Uuid) -> bool {
        self.state
            .lock()
            .link
            .as_ref()
            .is_some_and(|l| l.subscriptions.lock().contains(&uuid))
    }

    /// Every successful write, in order.
    pub fn writes(&self) -> Vec<(Uuid, Bytes)> {
        self.state.lock().writes.clone()
    }

    /// Successful writes to one characteristic, in order.
    pub fn writes_to(&self, uuid: Uuid) -> Vec<Bytes> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|(u, _)| *u == uuid)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Pushes a notification. Returns `false` when nobody is subscribed.
    pub fn notify(&self, uuid: Uuid, value: impl Into<Bytes>) -> bool {
        let link = self.state.lock().link.clone();
        let Some(link) = link else {
            return false;
        };
        if !link.open.load(Ordering::SeqCst) || !link.subscriptions.lock().contains(&uuid) {
            return false;
        }
        let event = LinkEvent::Notification {
            characteristic: uuid,
            value: value.into(),
        };
        let sent = link
            .tx
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok());
        sent
    }

    /// Drops the live link as the radio would: emits `Disconnected` and ends
    /// the session's event stream.
    pub fn drop_link(&self, cause: impl Into<String>) {
        let link = self.state.lock().link.take();
        if let Some(link) = link {
            if let Some(tx) = link.tx.lock().as_ref() {
                let _ = tx.send(LinkEvent::Disconnected {
                    cause: cause.into(),
                });
            }
            link.close();
        }
    }
}

#[async_trait]
impl BlePeripheral for MockPeripheral {
    fn id(&self) -> String {
        format!("mock:{}", self.name)
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn connect(&self, _service: Uuid) -> TransportResult<Arc<dyn GattSession>> {
        let delay = self.state.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.connects += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(TransportError::Gatt("Connection attempt failed".into()));
        }

        if let Some(old) = state.link.take() {
            old.close();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.next_link_id += 1;
        let link = Arc::new(LinkHandle {
            id: state.next_link_id,
            open: AtomicBool::new(true),
            tx: Mutex::new(Some(tx)),
            subscriptions: Mutex::new(HashSet::new()),
        });
        state.link = Some(link.clone());

        let session: Arc<dyn GattSession> = Arc::new(MockSession {
            characteristics: state.characteristics.clone(),
            device: self.state.clone(),
            link,
            rx: Mutex::new(Some(rx)),
        });
        Ok(session)
    }
}

// =============================================================================
// MockSession
// =============================================================================

struct MockSession {
    characteristics: Vec<Uuid>,
    device: Arc<Mutex<DeviceState>>,
    link: Arc<LinkHandle>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
}

impl MockSession {
    fn ensure_known(&self, uuid: Uuid) -> TransportResult<()> {
        if self.characteristics.contains(&uuid) {
            Ok(())
        } else {
            Err(TransportError::MissingCharacteristic(uuid))
        }
    }
}

#[async_trait]
impl GattSession for MockSession {
    fn characteristics(&self) -> Vec<Uuid> {
        self.characteristics.clone()
    }

    async fn read(&self, characteristic: Uuid) -> TransportResult<Bytes> {
        self.link.ensure_open()?;
        self.ensure_known(characteristic)?;
        let mut state = self.device.lock();
        if characteristic == MODEL_STATUS_CHAR_UUID {
            if let Some(next) = state.status_queue.pop_front() {
                state.values.insert(characteristic, next.clone());
                return Ok(next);
            }
        }
        Ok(state.values.get(&characteristic).cloned().unwrap_or_default())
    }

    async fn write(&self, characteristic: Uuid, value: &[u8]) -> TransportResult<()> {
        self.link.ensure_open()?;
        self.ensure_known(characteristic)?;
        let mut state = self.device.lock();
        let index = {
            let count = state.write_counts.entry(characteristic).or_insert(0);
            let index = *count;
            *count += 1;
            index
        };
        if state.failing_writes.get(&characteristic) == Some(&index) {
            state.failing_writes.remove(&characteristic);
            return Err(TransportError::Gatt("GATT write failed".into()));
        }
        let value = Bytes::copy_from_slice(value);
        state.writes.push((characteristic, value.clone()));
        if characteristic != Characteristic::ModelUpload.uuid() {
            state.values.insert(characteristic, value);
        }
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid) -> TransportResult<()> {
        self.link.ensure_open()?;
        self.ensure_known(characteristic)?;
        self.link.subscriptions.lock().insert(characteristic);
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> TransportResult<()> {
        self.link.ensure_open()?;
        self.link.subscriptions.lock().remove(&characteristic);
        Ok(())
    }

    async fn events(&self) -> TransportResult<LinkEventStream> {
        let rx = self.rx.lock().take().ok_or(TransportError::Closed)?;
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.link.close();
        let mut state = self.device.lock();
        if state.link.as_ref().is_some_and(|l| l.id == self.link.id) {
            state.link = None;
        }
        Ok(())
    }
}

/// 24-byte descriptor of a powered Rev2 board on firmware 1.2 with no model.
fn default_device_info() -> Vec<u8> {
    let mut info = vec![1, 2, 1, BATTERY_POWERED];
    info.extend_from_slice(&100u16.to_le_bytes());
    info.extend_from_slice(&50u16.to_le_bytes());
    info.extend_from_slice(&0u32.to_le_bytes());
    info.extend_from_slice(&0u32.to_le_bytes());
    info.extend_from_slice(&0u32.to_le_bytes());
    info.extend_from_slice(&[0, 0, 0, 0]);
    info
}
