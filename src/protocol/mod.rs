//! Wire protocol shared with the board firmware.
//!
//! Every constant in this module is part of the binary contract with the device.
//! Both sides compute checksums independently and no negotiation happens, so
//! changing any of them breaks compatibility with deployed firmware.
//!
//! # Layout summary (all integers little-endian)
//!
//! | Packet | Size | Layout |
//! |---|---|---|
//! | Sensor frame | 17 B | i16 ax,ay,az,gx,gy,gz; u16 seq; u16 ts; u8 crc8 |
//! | Device info | 20 B (24 B extended) | u8 fw major, u8 fw minor, u8 variant, u8 battery, u16 window, u16 rate, u32 uptime, u32 samples, u32 inferences |
//! | Inference result | >= 2 B | u8 class, u8 confidence |
//! | Device config | 4 B | u16 rate, u16 window |
//! | Upload command | 1 + payload | see [`upload`] |
//! | Upload status | 3 B | u8 phase, u8 progress, u8 result |

pub mod checksum;
pub mod frames;
pub mod sequence;
pub mod upload;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use checksum::{checksum32, checksum8};
pub use frames::{
    decode_device_info, decode_inference_result, decode_sensor_frame, Battery, DeviceConfig,
    DeviceInfo, HardwareVariant, InferenceResult, RawSample, SensorFrame, StoredModel,
};
pub use sequence::{SequenceEvent, SequenceStats, SequenceTracker};
pub use upload::{UploadCommand, UploadPhase, UploadResultCode, UploadStatus};

// =============================================================================
// Packet sizes
// =============================================================================

/// Sensor frame length including the trailing CRC-8 byte.
pub const SENSOR_FRAME_LEN: usize = 17;

/// Device info layout length.
pub const DEVICE_INFO_LEN: usize = 20;

/// Device info length when the firmware appends stored-model fields.
pub const DEVICE_INFO_EXTENDED_LEN: usize = 24;

/// Minimum inference result length.
pub const INFERENCE_RESULT_MIN_LEN: usize = 2;

/// Device config characteristic length.
pub const DEVICE_CONFIG_LEN: usize = 4;

/// Upload status record length.
pub const UPLOAD_STATUS_LEN: usize = 3;

// =============================================================================
// Scaling and sensor limits
// =============================================================================

/// Raw accelerometer counts per g (±4 g range).
pub const ACCEL_SCALE: f32 = 8192.0;

/// Raw gyroscope counts per degree/second (±2000 dps range).
pub const GYRO_SCALE: f32 = 16.4;

/// Lowest sample rate the firmware accepts.
pub const MIN_SAMPLE_RATE_HZ: u16 = 10;

/// Highest sample rate the firmware accepts.
pub const MAX_SAMPLE_RATE_HZ: u16 = 50;

/// Battery byte meaning "USB powered, no battery monitoring".
pub const BATTERY_POWERED: u8 = 255;

/// Forward sequence gaps larger than this are a stream restart, not loss.
pub const SEQUENCE_DISCONTINUITY_THRESHOLD: u16 = 100;

// =============================================================================
// Device model layout
// =============================================================================

/// Input width of the on-device classifier (100 samples × 6 axes).
pub const NN_INPUT_SIZE: usize = 600;

/// Hidden layer width of the on-device classifier.
pub const NN_HIDDEN_SIZE: usize = 32;

/// Maximum number of classes the device allocates for.
pub const NN_MAX_CLASSES: usize = 8;

/// Width of one label slot, including the NUL terminator.
pub const LABEL_SLOT_LEN: usize = 16;

/// Model blob magic: "SNNN" read as a little-endian u32.
pub const MODEL_MAGIC: u32 = 0x4E4E_4E53;

/// Largest blob the device upload buffer holds.
pub const MAX_MODEL_SIZE: usize = 85_000;

// =============================================================================
// GATT identifiers
// =============================================================================

/// Advertised Edge AI service.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x19b1_0000_e8f2_537e_4f6c_d104_768a_1214);

/// Mode select (read/write, one byte).
pub const MODE_CHAR_UUID: Uuid = Uuid::from_u128(0x19b1_0001_e8f2_537e_4f6c_d104_768a_1214);

/// Raw sensor frames (notify).
pub const SENSOR_CHAR_UUID: Uuid = Uuid::from_u128(0x19b1_0002_e8f2_537e_4f6c_d104_768a_1214);

/// On-device inference results (notify).
pub const INFERENCE_CHAR_UUID: Uuid = Uuid::from_u128(0x19b1_0003_e8f2_537e_4f6c_d104_768a_1214);

/// Device descriptor (read).
pub const DEVICE_INFO_CHAR_UUID: Uuid =
    Uuid::from_u128(0x19b1_0004_e8f2_537e_4f6c_d104_768a_1214);

/// Sample rate / window config (read/write).
pub const CONFIG_CHAR_UUID: Uuid = Uuid::from_u128(0x19b1_0005_e8f2_537e_4f6c_d104_768a_1214);

/// Model upload commands (write).
pub const MODEL_UPLOAD_CHAR_UUID: Uuid =
    Uuid::from_u128(0x19b1_0006_e8f2_537e_4f6c_d104_768a_1214);

/// Model upload status (read/notify).
pub const MODEL_STATUS_CHAR_UUID: Uuid =
    Uuid::from_u128(0x19b1_0007_e8f2_537e_4f6c_d104_768a_1214);

/// Default advertised name prefix ("SevernEdgeAI-<n>").
pub const DEVICE_NAME_PREFIX: &str = "SevernEdgeAI";

/// Named characteristics of the Edge AI service.
///
/// The connection manager binds all of them or none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Characteristic {
    /// Mode select
    Mode,
    /// Sensor stream
    Sensor,
    /// Inference stream
    Inference,
    /// Device info
    DeviceInfo,
    /// Device config
    Config,
    /// Model upload commands
    ModelUpload,
    /// Model upload status
    ModelStatus,
}

impl Characteristic {
    /// Every characteristic required for a usable link.
    pub const ALL: [Characteristic; 7] = [
        Characteristic::Mode,
        Characteristic::Sensor,
        Characteristic::Inference,
        Characteristic::DeviceInfo,
        Characteristic::Config,
        Characteristic::ModelUpload,
        Characteristic::ModelStatus,
    ];

    /// GATT UUID of this characteristic.
    pub const fn uuid(self) -> Uuid {
        match self {
            Characteristic::Mode => MODE_CHAR_UUID,
            Characteristic::Sensor => SENSOR_CHAR_UUID,
            Characteristic::Inference => INFERENCE_CHAR_UUID,
            Characteristic::DeviceInfo => DEVICE_INFO_CHAR_UUID,
            Characteristic::Config => CONFIG_CHAR_UUID,
            Characteristic::ModelUpload => MODEL_UPLOAD_CHAR_UUID,
            Characteristic::ModelStatus => MODEL_STATUS_CHAR_UUID,
        }
    }

    /// Reverse lookup from a notification's UUID.
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == uuid)
    }
}

/// Logical streaming mode written to the mode characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Raw sensor frames for training data collection
    Collect,
    /// On-device classification results
    Inference,
}

impl StreamMode {
    /// Byte written to the mode characteristic.
    pub const fn mode_byte(self) -> u8 {
        match self {
            StreamMode::Collect => 0,
            StreamMode::Inference => 1,
        }
    }

    /// Characteristic whose notifications carry this mode's records.
    pub const fn characteristic(self) -> Characteristic {
        match self {
            StreamMode::Collect => Characteristic::Sensor,
            StreamMode::Inference => Characteristic::Inference,
        }
    }
}

impl std::fmt::Display for StreamMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            StreamMode::Collect => "sensor",
            StreamMode::Inference => "inference",
        };
        write!(f, "{}", label)
    }
}
