//! Fixed-size records exchanged over the link.
//!
//! Sensor frames arrive on a noisy radio link, so a bad frame is routine: the
//! decoder logs it and returns `None`. Device info, inference results and the
//! config record are single reads or rare notifications whose layout must match
//! the firmware; a short buffer there is a [`LinkError::Length`].
//!
//! All decoders read only the slice they are given. A notification payload may
//! be a view into a larger pooled buffer and nothing outside the slice is part
//! of the record.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use super::checksum::checksum8;
use super::{
    ACCEL_SCALE, BATTERY_POWERED, DEVICE_CONFIG_LEN, DEVICE_INFO_EXTENDED_LEN, DEVICE_INFO_LEN,
    GYRO_SCALE, INFERENCE_RESULT_MIN_LEN, MAX_SAMPLE_RATE_HZ, MIN_SAMPLE_RATE_HZ,
    SENSOR_FRAME_LEN,
};
use crate::error::{AppResult, LinkError};

// =============================================================================
// Sensor frame
// =============================================================================

/// One motion sample in physical units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorFrame {
    /// Acceleration x/y/z in g
    pub accel: [f32; 3],
    /// Angular rate x/y/z in degrees/second
    pub gyro: [f32; 3],
    /// Wrapping 16-bit frame counter
    pub sequence: u16,
    /// Device milliseconds modulo 65536
    pub timestamp_ms: u16,
}

/// Raw counts as the firmware samples them.
///
/// Used to build frames for simulated peripherals and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawSample {
    /// Accelerometer counts (8192 per g)
    pub accel: [i16; 3],
    /// Gyroscope counts (16.4 per dps)
    pub gyro: [i16; 3],
    /// Frame counter
    pub sequence: u16,
    /// Device milliseconds modulo 65536
    pub timestamp_ms: u16,
}

impl RawSample {
    /// Serializes the sample into a 17-byte frame with its trailing CRC-8.
    pub fn to_frame(&self) -> [u8; SENSOR_FRAME_LEN] {
        let mut out = [0u8; SENSOR_FRAME_LEN];
        {
            let mut buf = &mut out[..SENSOR_FRAME_LEN - 1];
            for v in self.accel.iter().chain(self.gyro.iter()) {
                buf.put_i16_le(*v);
            }
            buf.put_u16_le(self.sequence);
            buf.put_u16_le(self.timestamp_ms);
        }
        out[SENSOR_FRAME_LEN - 1] = checksum8(&out[..SENSOR_FRAME_LEN - 1]);
        out
    }
}

/// Decodes a sensor notification.
///
/// Returns `None` when the slice is not exactly 17 bytes or when its trailing
/// byte is not the CRC-8 of its own leading 16 bytes.
pub fn decode_sensor_frame(buffer: &[u8]) -> Option<SensorFrame> {
    if buffer.len() != SENSOR_FRAME_LEN {
        tracing::debug!(len = buffer.len(), "Dropping sensor frame with wrong length");
        return None;
    }

    let (body, trailer) = buffer.split_at(SENSOR_FRAME_LEN - 1);
    let expected = checksum8(body);
    if trailer[0] != expected {
        tracing::debug!(
            received = trailer[0],
            expected,
            "Dropping sensor frame with bad checksum"
        );
        return None;
    }

    let mut cur = body;
    let mut axis = [0f32; 6];
    for (i, slot) in axis.iter_mut().enumerate() {
        let scale = if i < 3 { ACCEL_SCALE } else { GYRO_SCALE };
        *slot = f32::from(cur.get_i16_le()) / scale;
    }
    let sequence = cur.get_u16_le();
    let timestamp_ms = cur.get_u16_le();

    Some(SensorFrame {
        accel: [axis[0], axis[1], axis[2]],
        gyro: [axis[3], axis[4], axis[5]],
        sequence,
        timestamp_ms,
    })
}

// =============================================================================
// Device info
// =============================================================================

/// Sensor board revision reported in the device descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareVariant {
    /// Rev1 board with the LSM9DS1 IMU
    Rev1Lsm9ds1,
    /// Rev2 board with the BMI270 IMU
    Rev2Bmi270,
    /// Tag this host does not know about
    Unknown(u8),
}

impl From<u8> for HardwareVariant {
    fn from(tag: u8) -> Self {
        match tag {
            0 => HardwareVariant::Rev1Lsm9ds1,
            1 => HardwareVariant::Rev2Bmi270,
            other => HardwareVariant::Unknown(other),
        }
    }
}

/// Battery byte: a percentage, or 255 when running from USB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Battery {
    /// Charge level, 0-100
    Percent(u8),
    /// Running from USB
    Powered,
}

impl From<u8> for Battery {
    fn from(raw: u8) -> Self {
        if raw == BATTERY_POWERED {
            Battery::Powered
        } else {
            Battery::Percent(raw)
        }
    }
}

/// Stored-model fields appended by newer firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredModel {
    /// Whether a model is committed to flash
    pub loaded: bool,
    /// Size of the committed blob in bytes (24-bit on the wire)
    pub size_bytes: u32,
}

/// Device descriptor read once per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Firmware major version
    pub firmware_major: u8,
    /// Firmware minor version
    pub firmware_minor: u8,
    /// Board revision
    pub variant: HardwareVariant,
    /// Battery state
    pub battery: Battery,
    /// Samples per inference window
    pub window_size: u16,
    /// IMU sample rate
    pub sample_rate_hz: u16,
    /// Seconds since boot
    pub uptime_s: u32,
    /// Samples taken since boot
    pub total_samples: u32,
    /// Inferences run since boot
    pub inference_count: u32,
    /// Present only when the firmware sends the 24-byte layout
    pub stored_model: Option<StoredModel>,
}

impl DeviceInfo {
    /// "major.minor" firmware string.
    pub fn firmware_version(&self) -> String {
        format!("{}.{}", self.firmware_major, self.firmware_minor)
    }
}

/// Decodes the device info characteristic.
pub fn decode_device_info(buffer: &[u8]) -> AppResult<DeviceInfo> {
    if buffer.len() < DEVICE_INFO_LEN {
        return Err(LinkError::length("device info", DEVICE_INFO_LEN, buffer.len()));
    }

    let mut cur = &buffer[..DEVICE_INFO_LEN];
    let firmware_major = cur.get_u8();
    let firmware_minor = cur.get_u8();
    let variant = HardwareVariant::from(cur.get_u8());
    let battery = Battery::from(cur.get_u8());
    let window_size = cur.get_u16_le();
    let sample_rate_hz = cur.get_u16_le();
    let uptime_s = cur.get_u32_le();
    let total_samples = cur.get_u32_le();
    let inference_count = cur.get_u32_le();

    let stored_model = (buffer.len() >= DEVICE_INFO_EXTENDED_LEN).then(|| {
        let ext = &buffer[DEVICE_INFO_LEN..DEVICE_INFO_EXTENDED_LEN];
        StoredModel {
            loaded: ext[0] != 0,
            size_bytes: u32::from_le_bytes([ext[1], ext[2], ext[3], 0]),
        }
    });

    Ok(DeviceInfo {
        firmware_major,
        firmware_minor,
        variant,
        battery,
        window_size,
        sample_rate_hz,
        uptime_s,
        total_samples,
        inference_count,
        stored_model,
    })
}

// =============================================================================
// Inference result
// =============================================================================

/// On-device classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceResult {
    /// 0-based index into the uploaded label table
    pub class_index: u8,
    /// Percentage, 0-100
    pub confidence: u8,
}

/// Decodes an inference notification. Trailing bytes are ignored.
pub fn decode_inference_result(buffer: &[u8]) -> AppResult<InferenceResult> {
    if buffer.len() < INFERENCE_RESULT_MIN_LEN {
        return Err(LinkError::length(
            "inference result",
            INFERENCE_RESULT_MIN_LEN,
            buffer.len(),
        ));
    }
    Ok(InferenceResult {
        class_index: buffer[0],
        confidence: buffer[1],
    })
}

// =============================================================================
// Device config
// =============================================================================

/// Sample rate and window size record of the config characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// IMU sample rate, 10-50 Hz
    pub sample_rate_hz: u16,
    /// Samples per inference window
    pub window_size: u16,
}

impl DeviceConfig {
    /// Decodes the 4-byte config record.
    pub fn decode(buffer: &[u8]) -> AppResult<Self> {
        if buffer.len() < DEVICE_CONFIG_LEN {
            return Err(LinkError::length("device config", DEVICE_CONFIG_LEN, buffer.len()));
        }
        let mut cur = buffer;
        Ok(Self {
            sample_rate_hz: cur.get_u16_le(),
            window_size: cur.get_u16_le(),
        })
    }

    /// Validates against firmware limits and serializes.
    pub fn encode(&self) -> AppResult<[u8; DEVICE_CONFIG_LEN]> {
        if !(MIN_SAMPLE_RATE_HZ..=MAX_SAMPLE_RATE_HZ).contains(&self.sample_rate_hz) {
            return Err(LinkError::Protocol(format!(
                "sample rate {} Hz outside supported range {}..={} Hz",
                self.sample_rate_hz, MIN_SAMPLE_RATE_HZ, MAX_SAMPLE_RATE_HZ
            )));
        }
        if self.window_size == 0 {
            return Err(LinkError::Protocol("window size must be non-zero".into()));
        }
        let mut out = [0u8; DEVICE_CONFIG_LEN];
        let mut buf = &mut out[..];
        buf.put_u16_le(self.sample_rate_hz);
        buf.put_u16_le(self.window_size);
        Ok(out)
    }
}
