//! Model upload commands and the status record.
//!
//! Commands are writes to the model upload characteristic, first byte is the
//! opcode:
//!
//! | Command | Layout |
//! |---|---|
//! | Start | `01` u32 size, u32 crc32, u8 class count, count × 16 B label slots |
//! | Chunk | `02` u32 offset, payload |
//! | Complete | `03` |
//! | Cancel | `04` |
//!
//! The status characteristic answers `[phase, progress, result code]` (newer
//! firmware appends a reserved byte).

use bytes::{BufMut, Bytes, BytesMut};

use super::{LABEL_SLOT_LEN, NN_MAX_CLASSES, UPLOAD_STATUS_LEN};
use crate::error::{AppResult, LinkError};

/// Opcode of the Start command.
pub const CMD_START: u8 = 0x01;
/// Opcode of the Chunk command.
pub const CMD_CHUNK: u8 = 0x02;
/// Opcode of the Complete command.
pub const CMD_COMPLETE: u8 = 0x03;
/// Opcode of the Cancel command.
pub const CMD_CANCEL: u8 = 0x04;

/// Opcode plus offset preceding every chunk payload.
pub const CHUNK_HEADER_LEN: usize = 5;

/// Start command size without labels.
pub const START_HEADER_LEN: usize = 10;

/// Payload bytes per chunk for a given transport write limit.
pub const fn chunk_payload_len(max_write_size: usize) -> usize {
    max_write_size.saturating_sub(CHUNK_HEADER_LEN)
}

/// One write to the upload characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadCommand {
    /// Announces a transfer
    Start {
        /// Total blob length in bytes
        size: u32,
        /// CRC-32 of the whole blob
        crc32: u32,
        /// Class labels; more than the device maximum are dropped
        labels: Vec<String>,
    },
    /// One fragment of the blob
    Chunk {
        /// Byte offset of `payload` within the blob
        offset: u32,
        /// Fragment bytes
        payload: Bytes,
    },
    /// All chunks sent
    Complete,
    /// Abort the transfer
    Cancel,
}

impl UploadCommand {
    /// Serializes the command.
    pub fn encode(&self) -> Bytes {
        let opcode = self.opcode();
        match self {
            UploadCommand::Start { size, crc32, labels } => {
                let count = labels.len().min(NN_MAX_CLASSES);
                let mut buf = BytesMut::with_capacity(START_HEADER_LEN + count * LABEL_SLOT_LEN);
                buf.put_u8(opcode);
                buf.put_u32_le(*size);
                buf.put_u32_le(*crc32);
                buf.put_u8(count as u8);
                for label in labels.iter().take(count) {
                    buf.put_slice(&label_slot(label));
                }
                buf.freeze()
            }
            UploadCommand::Chunk { offset, payload } => {
                let mut buf = BytesMut::with_capacity(CHUNK_HEADER_LEN + payload.len());
                buf.put_u8(opcode);
                buf.put_u32_le(*offset);
                buf.put_slice(payload);
                buf.freeze()
            }
            UploadCommand::Complete | UploadCommand::Cancel => Bytes::copy_from_slice(&[opcode]),
        }
    }

    /// Opcode byte of this command.
    pub fn opcode(&self) -> u8 {
        match self {
            UploadCommand::Start { .. } => CMD_START,
            UploadCommand::Chunk { .. } => CMD_CHUNK,
            UploadCommand::Complete => CMD_COMPLETE,
            UploadCommand::Cancel => CMD_CANCEL,
        }
    }
}

/// Fixed-width NUL-padded label slot.
///
/// At most 15 bytes of the label are kept, cut on a character boundary, so
/// the slot always ends with a terminator.
pub fn label_slot(label: &str) -> [u8; LABEL_SLOT_LEN] {
    let mut end = label.len().min(LABEL_SLOT_LEN - 1);
    while !label.is_char_boundary(end) {
        end -= 1;
    }
    let mut slot = [0u8; LABEL_SLOT_LEN];
    slot[..end].copy_from_slice(&label.as_bytes()[..end]);
    slot
}

/// Reads a label back out of a slot.
pub fn label_from_slot(slot: &[u8]) -> String {
    let end = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
    String::from_utf8_lossy(&slot[..end]).into_owned()
}

// =============================================================================
// Status
// =============================================================================

/// Transfer phase byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
        Idle,
    Receiving,
    Complete,
    Error,
    Unknown(u8),
}

impl From<u8> for UploadPhase {
    fn from(raw: u8) -> Self {
        match raw {
            0 => UploadPhase::Idle,
            1 => UploadPhase::Receiving,
            2 => UploadPhase::Complete,
            3 => UploadPhase::Error,
            other => UploadPhase::Unknown(other),
        }
    }
}

/// Result code byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadResultCode {
    /// 0: idle, or a transfer was discarded
    Ready,
    /// 1
    Receiving,
    /// 2: checking the CRC
    Validating,
    /// 3: committing to flash
    Saving,
    /// 4
    Success,
    /// 10: blob exceeds the device buffer
    SizeError,
    /// 11
    CrcError,
    /// 12
    FlashError,
    /// 13: header or dimensions rejected
    FormatError,
    /// Any other byte
    Unknown(u8),
}

impl From<u8> for UploadResultCode {
    fn from(raw: u8) -> Self {
        match raw {
            0 => UploadResultCode::Ready,
            1 => UploadResultCode::Receiving,
            2 => UploadResultCode::Validating,
            3 => UploadResultCode::Saving,
            4 => UploadResultCode::Success,
            10 => UploadResultCode::SizeError,
            11 => UploadResultCode::CrcError,
            12 => UploadResultCode::FlashError,
            13 => UploadResultCode::FormatError,
            other => UploadResultCode::Unknown(other),
        }
    }
}

impl UploadResultCode {
    /// Wire value.
    pub fn raw(self) -> u8 {
        match self {
            UploadResultCode::Ready => 0,
            UploadResultCode::Receiving => 1,
            UploadResultCode::Validating => 2,
            UploadResultCode::Saving => 3,
            UploadResultCode::Success => 4,
            UploadResultCode::SizeError => 10,
            UploadResultCode::CrcError => 11,
            UploadResultCode::FlashError => 12,
            UploadResultCode::FormatError => 13,
            UploadResultCode::Unknown(raw) => raw,
        }
    }

    /// Codes the device reports while still working on a transfer.
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            UploadResultCode::Receiving | UploadResultCode::Validating | UploadResultCode::Saving
        )
    }

    /// Whether the model was committed.
    pub fn is_success(self) -> bool {
        self == UploadResultCode::Success
    }

    /// Human-readable name used in errors and progress messages.
    pub fn reason(self) -> &'static str {
        match self {
            UploadResultCode::Ready => "device idle",
            UploadResultCode::Receiving => "receiving",
            UploadResultCode::Validating => "validating",
            UploadResultCode::Saving => "saving",
            UploadResultCode::Success => "success",
            UploadResultCode::SizeError => "model too large",
            UploadResultCode::CrcError => "CRC mismatch",
            UploadResultCode::FlashError => "flash write failed",
            UploadResultCode::FormatError => "invalid model format",
            UploadResultCode::Unknown(_) => "unknown status",
        }
    }
}

/// Decoded status characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadStatus {
    /// Transfer phase
    pub phase: UploadPhase,
    /// Percentage the device has received
    pub progress: u8,
    /// Result of the last transfer step
    pub code: UploadResultCode,
}

impl UploadStatus {
    /// Decodes the 3-byte status record. Trailing bytes are ignored.
    pub fn decode(buffer: &[u8]) -> AppResult<Self> {
        if buffer.len() < UPLOAD_STATUS_LEN {
            return Err(LinkError::length("upload status", UPLOAD_STATUS_LEN, buffer.len()));
        }
        Ok(Self {
            phase: UploadPhase::from(buffer[0]),
            progress: buffer[1],
            code: UploadResultCode::from(buffer[2]),
        })
    }

    /// Serialized form, as a simulated device would publish it.
    pub fn encode(&self) -> [u8; UPLOAD_STATUS_LEN] {
        let phase = match self.phase {
            UploadPhase::Idle => 0,
            UploadPhase::Receiving => 1,
            UploadPhase::Complete => 2,
            UploadPhase::Error => 3,
            UploadPhase::Unknown(raw) => raw,
        };
        [phase, self.progress, self.code.raw()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_command_layout() {
        let cmd = UploadCommand::Start {
            size: 78_128,
            crc32: 0xDEAD_BEEF,
            labels: vec!["wave".into(), "a_very_long_gesture_name".into()],
        };
        let bytes = cmd.encode();
        assert_eq!(bytes.len(), START_HEADER_LEN + 2 * LABEL_SLOT_LEN);
        assert_eq!(bytes[0], CMD_START);
        assert_eq!(&bytes[1..5], &78_128u32.to_le_bytes());
        assert_eq!(&bytes[5..9], &0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(bytes[9], 2);

        let first = &bytes[10..26];
        assert_eq!(&first[..5], b"wave\0");
        assert!(first[4..].iter().all(|&b| b == 0));

        let second = &bytes[26..42];
        assert_eq!(&second[..15], b"a_very_long_ges");
        assert_eq!(second[15], 0);
    }

    #[test]
    fn test_start_command_caps_class_count() {
        let labels = (0..12).map(|i| format!("c{i}")).collect();
        let bytes = UploadCommand::Start {
            size: 1,
            crc32: 0,
            labels,
        }
        .encode();
        assert_eq!(bytes[9] as usize, NN_MAX_CLASSES);
        assert_eq!(bytes.len(), START_HEADER_LEN + NN_MAX_CLASSES * LABEL_SLOT_LEN);
    }

    #[test]
    fn test_label_truncation_respects_char_boundaries() {
        // 14 ASCII bytes then a 2-byte character straddling the limit
        let slot = label_slot("abcdefghijklmné");
        assert_eq!(label_from_slot(&slot), "abcdefghijklmn");
        assert_eq!(slot[15], 0);
    }

    #[test]
    fn test_chunk_and_control_commands() {
        let chunk = UploadCommand::Chunk {
            offset: 239,
            payload: Bytes::from_static(&[9, 8, 7]),
        };
        assert_eq!(&chunk.encode()[..], &[CMD_CHUNK, 239, 0, 0, 0, 9, 8, 7]);
        assert_eq!(&UploadCommand::Complete.encode()[..], &[CMD_COMPLETE]);
        assert_eq!(&UploadCommand::Cancel.encode()[..], &[CMD_CANCEL]);
        assert_eq!(chunk_payload_len(244), 239);
    }

    #[test]
    fn test_status_decoding() {
        let status = UploadStatus::decode(&[2, 100, 4, 0]).unwrap();
        assert_eq!(status.phase, UploadPhase::Complete);
        assert_eq!(status.progress, 100);
        assert!(status.code.is_success());

        let crc = UploadStatus::decode(&[3, 100, 11]).unwrap();
        assert_eq!(crc.code, UploadResultCode::CrcError);
        assert_eq!(crc.code.reason(), "CRC mismatch");
        assert!(!crc.code.is_in_progress());

        assert!(UploadResultCode::from(2).is_in_progress());
        assert_eq!(UploadResultCode::from(99).raw(), 99);
        assert!(UploadStatus::decode(&[1, 2]).is_err());
    }
}
