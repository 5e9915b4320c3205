//! Connection Manager
//!
//! Owns the wireless link: device selection, connect, characteristic binding,
//! notification dispatch, drop detection and the bounded silent reconnect.
//!
//! # State machine
//!
//! ```text
//! Disconnected --connect()--> Connecting --ok--> Connected
//!                                  \--err--> Error
//! Connected --unexpected drop--> Reconnecting --ok--> Connected
//!                                     \--budget spent--> NeedsUserAction
//! Connected --disconnect()--> Disconnected (reason = user)
//! NeedsUserAction / Error --connect()--> Connecting
//! ```
//!
//! # Invariants
//!
//! - The bound link (session + reader task) is installed and cleared as one
//!   unit under a single lock. No caller ever sees a partly bound link, and
//!   every data operation fails with [`LinkError::NotConnected`] while nothing
//!   is bound.
//! - Each bound link carries an epoch. Notifications and drop events from an
//!   older epoch are discarded, so a dead link can never reach a handler.
//! - At most one reconnect loop runs. A drop reported while one is in flight
//!   joins it and receives the same outcome. The slot is cleared in the same
//!   critical section that installs the new link, so a drop of that link
//!   starts a fresh loop.
//! - Handlers run without the stream slot locked. A stop waits out a call in
//!   progress, so no notification reaches a handler after its stop returns.
//! - The active stream (mode + handler) is the user's intent. It survives link
//!   loss and is re-subscribed on the next successful bind; only
//!   [`ConnectionManager::stop_stream`] or a user disconnect clears it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::reconnect::{retry_with_policy, ReconnectPolicy, Recoverable, RetryOutcome};
use super::state::{ConnectionState, ConnectionStatus, DisconnectReason, StatusCell};
use crate::config::LinkConfig;
use crate::error::{AppResult, LinkError};
use crate::protocol::{decode_device_info, Characteristic, DeviceConfig, DeviceInfo, StreamMode};
use crate::transport::{
    BleCentral, BlePeripheral, GattSession, LinkEvent, LinkEventStream, TransportError,
};

/// Callback receiving raw notification payloads of the active stream.
///
/// Runs on the link's reader task and must not block. It may read manager
/// state such as [`ConnectionManager::active_stream`]; stopping the stream
/// from inside the handler must be spawned, not awaited.
pub type NotificationHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Result of a user-initiated [`ConnectionManager::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new link is bound
    Connected,
    /// A link was already bound; nothing changed
    AlreadyConnected,
    /// The user dismissed the chooser; the previous state is restored
    Cancelled,
}

/// Result of handling a link drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// Silent reconnect succeeded on the given attempt
    Reconnected { attempt: u32 },
    /// Budget spent; state is now NeedsUserAction
    GaveUp { attempts: u32 },
    /// The user disconnected or the manager closed while reconnecting
    Abandoned,
    /// The drop referred to a link that is no longer bound
    Ignored,
}

/// The reconnect loop in flight. `id` tells a finishing loop whether the
/// slot still holds it.
struct PendingReconnect {
    id: u64,
    outcome: Shared<BoxFuture<'static, ReconnectOutcome>>,
}

struct BoundLink {
    epoch: u64,
    session: Arc<dyn GattSession>,
    reader: JoinHandle<()>,
}

struct ActiveStream {
    mode: StreamMode,
    handler: NotificationHandler,
}

struct Inner {
    central: Arc<dyn BleCentral>,
    config: LinkConfig,
    policy: ReconnectPolicy,
    status: StatusCell,
    link: Mutex<Option<BoundLink>>,
    device: Mutex<Option<Arc<dyn BlePeripheral>>>,
    stream: Mutex<Option<ActiveStream>>,
    /// Held while a handler runs. Never taken together with `stream`.
    handler_gate: Mutex<()>,
    reconnect: Mutex<Option<PendingReconnect>>,
    reconnect_ids: AtomicU64,
    epoch: AtomicU64,
    /// Bumped by every user connect/disconnect; a reconnect loop started
    /// under an older generation must not touch state.
    generation: AtomicU64,
    open: AtomicBool,
    /// Serializes user-driven transitions and stream changes.
    ops: tokio::sync::Mutex<()>,
}

/// Context object owning the link. Cheap to clone; clones share the link.
///
/// # Example
///
/// ```rust,ignore
/// let manager = ConnectionManager::open(central, LinkConfig::load()?)?;
/// match manager.connect().await? {
///     ConnectOutcome::Cancelled => return Ok(()),
///     _ => {}
/// }
/// let info = manager.get_device_info().await?;
/// manager.close().await;
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("status", &self.inner.status.get())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Validates `config` and opens a manager in the Disconnected state.
    pub fn open(central: Arc<dyn BleCentral>, config: LinkConfig) -> AppResult<Self> {
        config.validate()?;
        let policy = ReconnectPolicy::from(&config.reconnect);
        Ok(Self {
            inner: Arc::new(Inner {
                central,
                config,
                policy,
                status: StatusCell::new(),
                link: Mutex::new(None),
                device: Mutex::new(None),
                stream: Mutex::new(None),
                handler_gate: Mutex::new(()),
                reconnect: Mutex::new(None),
                reconnect_ids: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                open: AtomicBool::new(true),
                ops: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Disconnects and rejects every further operation with [`LinkError::Closed`].
    pub async fn close(&self) {
        if self.inner.open.swap(false, Ordering::SeqCst) {
            let _ops = self.inner.ops.lock().await;
            self.inner.teardown_by_user().await;
            info!("Connection manager closed");
        }
    }

    /// Configuration the manager was opened with.
    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    /// Current status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.get()
    }

    /// Current state only.
    pub fn state(&self) -> ConnectionState {
        self.inner.status.state()
    }

    /// Receiver notified on every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Whether characteristic handles are currently bound.
    pub fn is_connected(&self) -> bool {
        self.inner.link.lock().is_some()
    }

    /// Mode of the active stream, if any.
    pub fn active_stream(&self) -> Option<StreamMode> {
        self.inner.stream.lock().as_ref().map(|s| s.mode)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Asks the user for a device and connects to it.
    ///
    /// A dismissed chooser is not an error: the previous state is restored and
    /// [`ConnectOutcome::Cancelled`] returned. Any other failure moves the
    /// state to Error and returns the transport's message unchanged.
    #[instrument(skip(self), fields(prefix = %self.inner.config.discovery.name_prefix))]
    pub async fn connect(&self) -> AppResult<ConnectOutcome> {
        self.inner.ensure_open()?;
        let _ops = self.inner.ops.lock().await;

        match self.inner.status.state() {
            ConnectionState::Connected => return Ok(ConnectOutcome::AlreadyConnected),
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                return Err(LinkError::ConnectInProgress)
            }
            _ => {}
        }

        let previous = self.inner.status.get();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.status.update(|s| {
            s.state = ConnectionState::Connecting;
            s.last_error = None;
            s.reconnect_attempt = 0;
        });

        let filter = self.inner.config.device_filter();
        let device = match self.inner.central.request_device(&filter).await {
            Ok(device) => device,
            Err(TransportError::UserCancelled) => {
                info!("Device selection cancelled by user");
                self.inner.status.set(previous);
                return Ok(ConnectOutcome::Cancelled);
            }
            Err(e) => return Err(self.inner.fail_connect(e.into())),
        };

        info!(device = %device.name(), "Device selected");
        *self.inner.device.lock() = Some(device.clone());
        self.inner
            .status
            .update(|s| s.device_name = Some(device.name()));

        match self.inner.establish(device, generation).await {
            Ok(()) => Ok(ConnectOutcome::Connected),
            Err(e) => Err(self.inner.fail_connect(e)),
        }
    }

    /// User-initiated disconnect. Stops the active stream first.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) -> AppResult<()> {
        let _ops = self.inner.ops.lock().await;
        self.inner.teardown_by_user().await;
        Ok(())
    }

    /// Reports that the current link is gone (e.g. a platform event seen
    /// outside the session stream). Starts or joins the silent reconnect.
    pub async fn report_link_lost(&self, cause: impl Into<String>) -> ReconnectOutcome {
        self.inner.clone().link_lost(None, cause.into()).await
    }

    // =========================================================================
    // Data operations
    // =========================================================================

    /// Reads `characteristic` on the bound link.
    pub async fn read(&self, characteristic: Characteristic) -> AppResult<Bytes> {
        let session = self.inner.session()?;
        Ok(session.read(characteristic.uuid()).await?)
    }

    /// Writes `value` with response.
    pub async fn write(&self, characteristic: Characteristic, value: &[u8]) -> AppResult<()> {
        let session = self.inner.session()?;
        Ok(session.write(characteristic.uuid(), value).await?)
    }

    /// Enables notifications. Payloads reach the active stream handler only.
    pub async fn subscribe(&self, characteristic: Characteristic) -> AppResult<()> {
        let session = self.inner.session()?;
        Ok(session.subscribe(characteristic.uuid()).await?)
    }

    /// Disables notifications.
    pub async fn unsubscribe(&self, characteristic: Characteristic) -> AppResult<()> {
        let session = self.inner.session()?;
        Ok(session.unsubscribe(characteristic.uuid()).await?)
    }

    /// Reads and decodes the device descriptor.
    pub async fn get_device_info(&self) -> AppResult<DeviceInfo> {
        let raw = self.read(Characteristic::DeviceInfo).await?;
        decode_device_info(&raw)
    }

    /// Reads sample rate and window size.
    pub async fn read_config(&self) -> AppResult<DeviceConfig> {
        let raw = self.read(Characteristic::Config).await?;
        DeviceConfig::decode(&raw)
    }

    /// Validates and writes sample rate and window size.
    pub async fn write_config(&self, config: DeviceConfig) -> AppResult<()> {
        let bytes = config.encode()?;
        self.write(Characteristic::Config, &bytes).await
    }

    // =========================================================================
    // Streams
    // =========================================================================

    /// Selects `mode` on the device and routes its notifications to `handler`.
    ///
    /// Restarting the active mode replaces the handler. Starting the other mode
    /// while one is active fails with [`LinkError::StreamConflict`].
    pub async fn start_stream(&self, mode: StreamMode, handler: NotificationHandler) -> AppResult<()> {
        let _ops = self.inner.ops.lock().await;
        let session = self.inner.session()?;

        {
            let mut stream = self.inner.stream.lock();
            match stream.as_mut() {
                Some(active) if active.mode == mode => {
                    active.handler = handler;
                    drop(stream);
                    self.inner.quiesce_handler();
                    debug!(%mode, "Replaced stream handler");
                    return Ok(());
                }
                Some(active) => {
                    return Err(LinkError::StreamConflict {
                        active: active.mode,
                        requested: mode,
                    })
                }
                None => {}
            }
        }

        session
            .write(Characteristic::Mode.uuid(), &[mode.mode_byte()])
            .await?;
        *self.inner.stream.lock() = Some(ActiveStream { mode, handler });
        if let Err(e) = session.subscribe(mode.characteristic().uuid()).await {
            self.inner.stream.lock().take();
            return Err(e.into());
        }
        info!(%mode, "Stream started");
        Ok(())
    }

    /// Clears the handler of `mode`, then unsubscribes.
    ///
    /// Once this returns no notification reaches the old handler. Stopping a
    /// mode that is not active is a no-op.
    pub async fn stop_stream(&self, mode: StreamMode) -> AppResult<()> {
        let _ops = self.inner.ops.lock().await;
        self.inner.stop_stream(Some(mode)).await;
        Ok(())
    }
}

impl Inner {
    fn ensure_open(&self) -> AppResult<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LinkError::Closed)
        }
    }

    fn session(&self) -> AppResult<Arc<dyn GattSession>> {
        self.ensure_open()?;
        self.link
            .lock()
            .as_ref()
            .map(|l| l.session.clone())
            .ok_or(LinkError::NotConnected)
    }

    fn still_wanted(&self, generation: u64) -> bool {
        self.open.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }

    fn fail_connect(&self, e: LinkError) -> LinkError {
        error!(error = %e, "Connection failed");
        let message = e.to_string();
        self.status.update(|s| {
            s.state = ConnectionState::Error;
            s.last_error = Some(message);
        });
        e
    }

    /// Connects to `device`, binds every characteristic, re-subscribes the
    /// active stream and installs the link if `generation` is still current.
    async fn establish(
        self: &Arc<Self>,
        device: Arc<dyn BlePeripheral>,
        generation: u64,
    ) -> AppResult<()> {
        let session = device.connect(self.config.discovery.service_uuid).await?;
        let events = match self.bind(&session).await {
            Ok(events) => events,
            Err(e) => {
                let _ = session.disconnect().await;
                return Err(e);
            }
        };

        let name = device.name();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let installed = {
            let mut reconnect = self.reconnect.lock();
            let mut link = self.link.lock();
            if self.still_wanted(generation) {
                // A drop of this link must start a fresh loop, not join the
                // one finishing here.
                reconnect.take();
                if let Some(old) = link.take() {
                    old.reader.abort();
                }
                let reader = tokio::spawn(read_loop(Arc::downgrade(self), epoch, events));
                *link = Some(BoundLink {
                    epoch,
                    session: session.clone(),
                    reader,
                });
                self.status.update(|s| {
                    s.state = ConnectionState::Connected;
                    s.device_name = Some(name.clone());
                    s.last_error = None;
                    s.reconnect_attempt = 0;
                    s.disconnect_reason = DisconnectReason::None;
                });
                true
            } else {
                false
            }
        };

        if !installed {
            debug!(epoch, "Discarding link established after user disconnect");
            let _ = session.disconnect().await;
            return Err(LinkError::Superseded);
        }
        info!(device = %name, epoch, "Link established");
        Ok(())
    }

    /// All-or-nothing characteristic check, event stream, stream rehydration.
    async fn bind(&self, session: &Arc<dyn GattSession>) -> AppResult<LinkEventStream> {
        let available = session.characteristics();
        if let Some(missing) = Characteristic::ALL
            .iter()
            .map(|c| c.uuid())
            .find(|uuid| !available.contains(uuid))
        {
            return Err(TransportError::MissingCharacteristic(missing).into());
        }

        let events = session.events().await?;

        let intent = self.stream.lock().as_ref().map(|s| s.mode);
        if let Some(mode) = intent {
            info!(%mode, "Re-subscribing active stream");
            session
                .write(Characteristic::Mode.uuid(), &[mode.mode_byte()])
                .await?;
            session.subscribe(mode.characteristic().uuid()).await?;
        }
        Ok(events)
    }

    /// Routes a notification to the active handler if it belongs to the
    /// current link and the active mode.
    fn dispatch(&self, epoch: u64, characteristic: Uuid, value: Bytes) {
        if self.link.lock().as_ref().map(|l| l.epoch) != Some(epoch) {
            debug!(epoch, "Dropping notification from stale link");
            return;
        }
        // The slot is read under the gate, so once a stop has passed the
        // gate no later call can see the cleared handler.
        let _gate = self.handler_gate.lock();
        let handler = self
            .stream
            .lock()
            .as_ref()
            .filter(|active| active.mode.characteristic().uuid() == characteristic)
            .map(|active| active.handler.clone());
        match handler {
            Some(handler) => handler(value),
            None => debug!(%characteristic, "Notification without active handler"),
        }
    }

    /// Returns once no handler call is in progress.
    fn quiesce_handler(&self) {
        drop(self.handler_gate.lock());
    }

    async fn stop_stream(&self, mode: Option<StreamMode>) {
        let removed = {
            let mut stream = self.stream.lock();
            match (stream.as_ref(), mode) {
                (Some(active), Some(wanted)) if active.mode != wanted => None,
                _ => stream.take(),
            }
        };
        let Some(active) = removed else {
            return;
        };
        self.quiesce_handler();

        let session = self.link.lock().as_ref().map(|l| l.session.clone());
        if let Some(session) = session {
            let uuid = active.mode.characteristic().uuid();
            if let Err(e) = session.unsubscribe(uuid).await {
                debug!(error = %e, "Unsubscribe failed; handler already cleared");
            }
        }
        info!(mode = %active.mode, "Stream stopped");
    }

    async fn teardown_by_user(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.stop_stream(None).await;

        let link = self.link.lock().take();
        if let Some(link) = link {
            link.reader.abort();
            if let Err(e) = link.session.disconnect().await {
                debug!(error = %e, "Disconnect reported an error");
            }
        }
        self.status.update(|s| {
            s.state = ConnectionState::Disconnected;
            s.disconnect_reason = DisconnectReason::User;
            s.reconnect_attempt = 0;
            s.last_error = None;
        });
        info!("Disconnected by user");
    }

    /// Tears down the link identified by `epoch` (or the current one) and
    /// starts the reconnect loop, or joins the loop already running.
    ///
    /// Returns a boxed future: the reader task spawns this, and the reconnect
    /// loop spawns reader tasks, so the type has to be named.
    fn link_lost(
        self: Arc<Self>,
        epoch: Option<u64>,
        cause: String,
    ) -> BoxFuture<'static, ReconnectOutcome> {
        let pending = {
            let mut slot = self.reconnect.lock();
            if let Some(existing) = slot.as_ref() {
                debug!("Link loss reported during reconnect; joining");
                existing.outcome.clone()
            } else {
                let stale = {
                    let mut link = self.link.lock();
                    match (link.as_ref(), epoch) {
                        (Some(bound), Some(e)) if bound.epoch != e => None,
                        _ => link.take(),
                    }
                };
                let Some(stale) = stale else {
                    return futures::future::ready(ReconnectOutcome::Ignored).boxed();
                };
                stale.reader.abort();

                let reason = classify_cause(&cause);
                warn!(epoch = stale.epoch, cause = %cause, "Link lost unexpectedly");
                let generation = self.generation.load(Ordering::SeqCst);
                self.status.update(|s| {
                    s.state = ConnectionState::Reconnecting;
                    s.disconnect_reason = reason;
                    s.last_error = Some(cause.clone());
                    s.reconnect_attempt = 0;
                });

                let id = self.reconnect_ids.fetch_add(1, Ordering::SeqCst);
                let outcome = self
                    .clone()
                    .reconnect_loop(id, generation, stale.session)
                    .boxed()
                    .shared();
                *slot = Some(PendingReconnect {
                    id,
                    outcome: outcome.clone(),
                });
                tokio::spawn(outcome.clone());
                outcome
            }
        };
        pending.boxed()
    }

    async fn reconnect_loop(
        self: Arc<Self>,
        id: u64,
        generation: u64,
        stale: Arc<dyn GattSession>,
    ) -> ReconnectOutcome {
        let _ = stale.disconnect().await;

        let device = self.device.lock().clone();
        let outcome = match device {
            Some(device) => {
                let attempt = SilentReconnect {
                    inner: self.clone(),
                    device,
                    generation,
                };
                retry_with_policy(&attempt, &self.policy).await
            }
            None => RetryOutcome::Exhausted {
                attempts: 0,
                last_error: None,
            },
        };

        let result = match outcome {
            RetryOutcome::Recovered { attempt } => {
                info!(attempt, "Silent reconnect succeeded");
                ReconnectOutcome::Reconnected { attempt }
            }
            RetryOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                let detail = last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no remembered device".to_string());
                let message = format!(
                    "Connection lost and {attempts} reconnect attempt(s) failed ({detail}). \
                     Select the device again to reconnect."
                );
                warn!(attempts, "Reconnect budget exhausted");
                self.status.update(|s| {
                    if self.still_wanted(generation) {
                        s.state = ConnectionState::NeedsUserAction;
                        s.last_error = Some(message);
                        s.reconnect_attempt = attempts;
                    }
                });
                ReconnectOutcome::GaveUp { attempts }
            }
            RetryOutcome::Abandoned => {
                debug!("Reconnect abandoned");
                ReconnectOutcome::Abandoned
            }
        };

        let mut slot = self.reconnect.lock();
        if slot.as_ref().is_some_and(|p| p.id == id) {
            slot.take();
        }
        drop(slot);
        result
    }
}

/// One silent attempt against the remembered device.
struct SilentReconnect {
    inner: Arc<Inner>,
    device: Arc<dyn BlePeripheral>,
    generation: u64,
}

#[async_trait]
impl Recoverable<LinkError> for SilentReconnect {
    async fn recover(&self, attempt: u32) -> AppResult<()> {
        info!(attempt, device = %self.device.name(), "Attempting silent reconnect");
        self.inner.status.update(|s| {
            if self.inner.still_wanted(self.generation) {
                s.reconnect_attempt = attempt;
            }
        });
        self.inner
            .establish(self.device.clone(), self.generation)
            .await
    }

    fn still_wanted(&self) -> bool {
        self.inner.still_wanted(self.generation)
    }
}

/// Reader task of one bound link.
async fn read_loop(inner: Weak<Inner>, epoch: u64, mut events: LinkEventStream) {
    let cause = loop {
        match events.next().await {
            Some(LinkEvent::Notification {
                characteristic,
                value,
            }) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.dispatch(epoch, characteristic, value);
            }
            Some(LinkEvent::Disconnected { cause }) => break cause,
            None => break "link closed".to_string(),
        }
    };

    // link_lost aborts this task, so it runs on its own
    if let Some(inner) = inner.upgrade() {
        tokio::spawn(async move {
            inner.link_lost(Some(epoch), cause).await;
        });
    }
}

fn classify_cause(cause: &str) -> DisconnectReason {
    if cause.to_lowercase().contains("timeout") {
        DisconnectReason::Timeout
    } else {
        DisconnectReason::Transport
    }
}
