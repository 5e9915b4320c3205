//! Connection Manager: link lifecycle, observable state and silent reconnect.

pub mod manager;
pub mod reconnect;
pub mod state;

pub use manager::{ConnectOutcome, ConnectionManager, NotificationHandler, ReconnectOutcome};
pub use reconnect::{retry_with_policy, ReconnectPolicy, Recoverable, RetryOutcome};
pub use state::{ConnectionState, ConnectionStatus, DisconnectReason};
