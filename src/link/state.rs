//! Observable connection state.
//!
//! One [`ConnectionStatus`] value lives in a `tokio::sync::watch` channel
//! owned by the connection manager. Any component may read or subscribe;
//! only the manager writes.

use serde::Serialize;
use tokio::sync::watch;

/// Lifecycle of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Silent reconnect in progress after an unexpected drop
    Reconnecting,
    /// Reconnect budget exhausted; the user has to pick the device again
    NeedsUserAction,
    /// Last connect attempt failed
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::NeedsUserAction => "needs user action",
            ConnectionState::Error => "error",
        };
        f.write_str(label)
    }
}

/// Why the last link ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    None,
    User,
    Transport,
    Timeout,
}

/// Snapshot published to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    /// Where the state machine is
    pub state: ConnectionState,
    /// Display name of the bound (or last bound) device
    pub device_name: Option<String>,
    /// Human-readable text of the last failure
    pub last_error: Option<String>,
    /// 1-based attempt number while reconnecting, 0 otherwise
    pub reconnect_attempt: u32,
    /// Why the last link ended
    pub disconnect_reason: DisconnectReason,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            device_name: None,
            last_error: None,
            reconnect_attempt: 0,
            disconnect_reason: DisconnectReason::None,
        }
    }
}

impl ConnectionStatus {
    /// Whether the state is Connected.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Write side of the status channel.
#[derive(Debug)]
pub(crate) struct StatusCell {
    sender: watch::Sender<ConnectionStatus>,
}

impl StatusCell {
    pub(crate) fn new() -> Self {
        let (sender, _) = watch::channel(ConnectionStatus::default());
        Self { sender }
    }

    pub(crate) fn get(&self) -> ConnectionStatus {
        self.sender.borrow().clone()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.sender.borrow().state
    }

    /// Replaces the whole snapshot.
    pub(crate) fn set(&self, status: ConnectionStatus) {
        self.log_transition(status.state);
        self.sender.send_replace(status);
    }

    /// Edits the snapshot in place and notifies subscribers.
    pub(crate) fn update(&self, f: impl FnOnce(&mut ConnectionStatus)) {
        self.sender.send_modify(|status| {
            let before = status.state;
            f(status);
            if before != status.state {
                tracing::info!(from = %before, to = %status.state, "Connection state changed");
            }
        });
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.sender.subscribe()
    }

    fn log_transition(&self, to: ConnectionState) {
        let from = self.state();
        if from != to {
            tracing::info!(from = %from, to = %to, "Connection state changed");
        }
    }
}
