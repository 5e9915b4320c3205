//! Wireless transport abstraction.
//!
//! The connection manager never talks to a Bluetooth stack directly. It drives
//! three small async traits:
//!
//! - [`BleCentral`] selects a device. On platforms where selection needs a user
//!   gesture this is the only way to obtain a new [`BlePeripheral`].
//! - [`BlePeripheral`] is a remembered device handle that can be reconnected
//!   without another selection.
//! - [`GattSession`] is one live link: characteristic reads, writes,
//!   notification subscriptions and a single event stream.
//!
//! Backends:
//! - [`mock`]: in-memory peripheral used by the test-suite and the CLI demo.
//! - `btle`: btleplug (BlueZ, CoreBluetooth, WinRT), behind the `ble` feature.
//!
//! Errors carry the platform's own message in [`TransportError::Gatt`] and
//! [`TransportError::Unavailable`]; callers surface it verbatim.

#[cfg(feature = "ble")]
pub mod btle;
pub mod mock;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised at the transport boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No usable wireless stack or adapter on this host.
    #[error("Bluetooth unavailable: {0}")]
    Unavailable(String),

    /// The user dismissed the device chooser.
    #[error("Device selection cancelled")]
    UserCancelled,

    /// Nothing matching the filter was found.
    #[error("No device found with name prefix '{0}'")]
    DeviceNotFound(String),

    /// The connected device lacks a required characteristic.
    #[error("Required characteristic {0} not found on device")]
    MissingCharacteristic(Uuid),

    /// Operation failed inside the stack. Message is the platform's.
    #[error("{0}")]
    Gatt(String),

    /// The link is gone.
    #[error("Link closed")]
    Closed,
}

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Discovery criteria. Deployment configuration, not protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFilter {
    /// Advertised name must start with this
    pub name_prefix: String,
    /// Primary service to filter on
    pub service: Uuid,
    /// How long a scanning backend listens for advertisements
    pub scan_window: Duration,
}

/// Something that happened on a live link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Value pushed on a subscribed characteristic
    Notification {
        characteristic: Uuid,
        value: Bytes,
    },
    /// The link dropped without the host asking for it
    Disconnected { cause: String },
}

/// Event stream of one session. Ends when the link is gone.
pub type LinkEventStream = BoxStream<'static, LinkEvent>;

/// Device selection.
#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Lets the user pick a device matching `filter`.
    ///
    /// Returns [`TransportError::UserCancelled`] when the chooser is dismissed.
    async fn request_device(&self, filter: &DeviceFilter) -> TransportResult<Arc<dyn BlePeripheral>>;
}

/// A selected device that can be connected repeatedly.
#[async_trait]
pub trait BlePeripheral: Send + Sync {
    /// Stable platform identifier.
    fn id(&self) -> String;

    /// Advertised name for display.
    fn name(&self) -> String;

    /// Opens a link and resolves the characteristics of `service`.
    async fn connect(&self, service: Uuid) -> TransportResult<Arc<dyn GattSession>>;
}

/// One live link to a peripheral.
#[async_trait]
pub trait GattSession: Send + Sync {
    /// Characteristic UUIDs discovered under the requested service.
    fn characteristics(&self) -> Vec<Uuid>;

    async fn read(&self, characteristic: Uuid) -> TransportResult<Bytes>;

    /// Write with response. Resolves once the peer acknowledged.
    async fn write(&self, characteristic: Uuid, value: &[u8]) -> TransportResult<()>;

    async fn subscribe(&self, characteristic: Uuid) -> TransportResult<()>;

    async fn unsubscribe(&self, characteristic: Uuid) -> TransportResult<()>;

    /// Takes the session's event stream. Only the first call succeeds.
    async fn events(&self) -> TransportResult<LinkEventStream>;

    /// Closes the link. Does not emit [`LinkEvent::Disconnected`].
    async fn disconnect(&self) -> TransportResult<()>;
}
