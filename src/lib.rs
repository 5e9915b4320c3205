//! # Edge Link
//!
//! Host-side communication layer for the Edge AI sensor board: the byte-exact
//! wire protocol, the connection state machine with silent reconnect, the two
//! notification streams and the chunked model upload.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: Wire constants, GATT identifiers and the frame codec
//!   (CRC-8 sensor frames, device info, inference results, device config,
//!   upload commands and status). Pure functions, no I/O.
//! - **`model`**: The weight packer. Turns a trained classifier into the
//!   fixed-size blob the firmware loads, and parses such blobs back.
//! - **`transport`**: Async traits over the Bluetooth stack, an in-memory
//!   mock board, and the btleplug backend (`ble` feature).
//! - **`link`**: `ConnectionManager`, the single owner of the link and its
//!   observable `ConnectionStatus`.
//! - **`stream`**: `StreamMultiplexer`, raw-sensor and inference streaming.
//! - **`upload`**: `UploadService`, the chunked model upload.
//! - **`config`**: `LinkConfig`, loaded with figment from TOML and the
//!   environment.
//! - **`error`**: The `LinkError` enum shared by every module.
//! - **`logging`**: tracing-subscriber setup.

pub mod config;
pub mod error;
pub mod link;
pub mod logging;
pub mod model;
pub mod protocol;
pub mod stream;
pub mod transport;
pub mod upload;

pub use error::{AppResult, LinkError};
pub use link::{ConnectOutcome, ConnectionManager, ConnectionState, ConnectionStatus};
pub use stream::{StreamMultiplexer, StreamStats};
pub use upload::{UploadProgress, UploadService};
