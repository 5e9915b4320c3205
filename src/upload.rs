//! Upload Protocol
//!
//! Drives a packed model blob through the upload characteristic:
//!
//! ```text
//! idle -> starting -> uploading -> completing -> success
//!                \          \           \------> error
//!                 \----------\---------------> error
//! ```
//!
//! 1. `Start` announces size, CRC-32 and the label table.
//! 2. `Chunk` commands carry the blob in increasing offset order, each write
//!    awaited before the next, with a pause between chunks for the link's
//!    queue to drain.
//! 3. `Complete`, then a settling delay while the device verifies the CRC and
//!    commits to flash.
//! 4. The status characteristic is polled until it reports a terminal code.
//!
//! Any failure sends a best-effort `Cancel` and returns the original error.
//! Progress is observable only through the caller's callback.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::UploadConfig;
use crate::error::{AppResult, LinkError};
use crate::link::ConnectionManager;
use crate::model::ModelBlob;
use crate::protocol::{Characteristic, UploadCommand, UploadStatus, MAX_MODEL_SIZE};

/// Progress milestone reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum UploadProgress {
    /// Start command about to be sent
    Starting { total: usize },
    /// A chunk was acknowledged
    Uploading { sent: usize, total: usize },
    /// All chunks sent; waiting for the device to verify
    Completing { total: usize },
    /// Device reported success
    Success { total: usize },
    /// Transfer failed or was cancelled
    Error {
        sent: usize,
        total: usize,
        message: String,
    },
}

impl UploadProgress {
    /// Bytes acknowledged so far.
    pub fn sent(&self) -> usize {
        match self {
            UploadProgress::Starting { .. } => 0,
            UploadProgress::Uploading { sent, .. } | UploadProgress::Error { sent, .. } => *sent,
            UploadProgress::Completing { total } | UploadProgress::Success { total } => *total,
        }
    }

    /// Blob size in bytes.
    pub fn total(&self) -> usize {
        match self {
            UploadProgress::Starting { total }
            | UploadProgress::Uploading { total, .. }
            | UploadProgress::Completing { total }
            | UploadProgress::Success { total }
            | UploadProgress::Error { total, .. } => *total,
        }
    }

    /// Success or Error.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadProgress::Success { .. } | UploadProgress::Error { .. }
        )
    }
}

impl fmt::Display for UploadProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadProgress::Starting { total } => write!(f, "Starting upload of {total} bytes"),
            UploadProgress::Uploading { sent, total } => {
                let percent = if *total == 0 { 100 } else { sent * 100 / total };
                write!(f, "Uploading {sent}/{total} bytes ({percent}%)")
            }
            UploadProgress::Completing { .. } => write!(f, "Verifying model on device"),
            UploadProgress::Success { total } => write!(f, "Model uploaded ({total} bytes)"),
            UploadProgress::Error { message, .. } => write!(f, "Upload failed: {message}"),
        }
    }
}

/// Bookkeeping for the transfer in flight.
#[derive(Debug, Clone, Copy, Default)]
struct UploadSession {
    total: usize,
    offset: usize,
}

/// Clears the in-flight flag when the upload future finishes or is dropped.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Sends model blobs to the connected device. One transfer at a time.
pub struct UploadService {
    manager: ConnectionManager,
    config: UploadConfig,
    in_flight: AtomicBool,
    cancelled: AtomicBool,
    session: Mutex<UploadSession>,
}

impl UploadService {
    /// Uses the manager's `[upload]` configuration.
    pub fn new(manager: ConnectionManager) -> Self {
        let config = manager.config().upload.clone();
        Self::with_config(manager, config)
    }

    /// Uses `config` instead of the manager's.
    pub fn with_config(manager: ConnectionManager, config: UploadConfig) -> Self {
        Self {
            manager,
            config,
            in_flight: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            session: Mutex::new(UploadSession::default()),
        }
    }

    /// Whether a transfer is in flight.
    pub fn is_uploading(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Uploads `blob`, reporting every milestone to `progress`.
    ///
    /// Fails with [`LinkError::UploadInProgress`] without touching the link
    /// when another upload is running.
    #[instrument(skip_all, fields(size = blob.len(), classes = blob.class_count()))]
    pub async fn upload_model<F>(&self, blob: &ModelBlob, progress: F) -> AppResult<()>
    where
        F: Fn(UploadProgress) + Send + Sync,
    {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(LinkError::UploadInProgress);
        }
        let _guard = InFlight(&self.in_flight);
        self.cancelled.store(false, Ordering::SeqCst);
        *self.session.lock() = UploadSession {
            total: blob.len(),
            offset: 0,
        };

        match self.transfer(blob, &progress).await {
            Ok(()) => {
                info!(bytes = blob.len(), "Model upload succeeded");
                progress(UploadProgress::Success { total: blob.len() });
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Model upload failed");
                if !self.cancelled.load(Ordering::SeqCst) {
                    self.send_cancel().await;
                }
                let session = *self.session.lock();
                progress(UploadProgress::Error {
                    sent: session.offset,
                    total: session.total,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Aborts the transfer in flight. No-op when idle.
    ///
    /// The running upload stops before its next protocol step and fails with
    /// [`LinkError::UploadCancelled`]. Failure to deliver the Cancel command
    /// is ignored.
    pub async fn cancel_upload(&self) {
        if !self.is_uploading() {
            return;
        }
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            info!("Cancelling model upload");
            self.send_cancel().await;
        }
    }

    async fn transfer<F>(&self, blob: &ModelBlob, progress: &F) -> AppResult<()>
    where
        F: Fn(UploadProgress) + Send + Sync,
    {
        let total = blob.len();
        if total > MAX_MODEL_SIZE {
            return Err(LinkError::Protocol(format!(
                "model blob is {total} bytes; device buffer holds {MAX_MODEL_SIZE}"
            )));
        }
        let size = u32::try_from(total)
            .map_err(|_| LinkError::Protocol(format!("model blob of {total} bytes")))?;

        progress(UploadProgress::Starting { total });
        let start = UploadCommand::Start {
            size,
            crc32: blob.crc32(),
            labels: blob.labels().to_vec(),
        };
        self.send(&start).await?;
        debug!(crc32 = format_args!("{:#010x}", blob.crc32()), "Start sent");

        let step = self.config.chunk_payload_len();
        let bytes = blob.as_bytes();
        let mut offset = 0usize;
        while offset < total {
            self.ensure_not_cancelled()?;
            let end = (offset + step).min(total);
            let chunk = UploadCommand::Chunk {
                offset: offset as u32,
                payload: bytes.slice(offset..end),
            };
            self.send(&chunk).await?;
            offset = end;
            self.session.lock().offset = offset;
            progress(UploadProgress::Uploading {
                sent: offset,
                total,
            });
            if offset < total {
                sleep(self.config.chunk_delay()).await;
            }
        }

        self.ensure_not_cancelled()?;
        progress(UploadProgress::Completing { total });
        self.send(&UploadCommand::Complete).await?;
        sleep(self.config.settle_delay()).await;

        self.await_verdict().await
    }

    /// Polls the status characteristic until the device reports a terminal
    /// code.
    async fn await_verdict(&self) -> AppResult<()> {
        let attempts = self.config.status_poll_attempts;
        let mut last = None;
        for attempt in 1..=attempts {
            self.ensure_not_cancelled()?;
            let raw = self.manager.read(Characteristic::ModelStatus).await?;
            let status = UploadStatus::decode(&raw)?;
            debug!(
                attempt,
                code = status.code.raw(),
                progress = status.progress,
                "Upload status"
            );

            if status.code.is_success() {
                return Ok(());
            }
            if !status.code.is_in_progress() {
                return Err(LinkError::UploadRejected {
                    code: status.code.raw(),
                    reason: status.code.reason(),
                });
            }
            last = Some(status.code);
            if attempt < attempts {
                sleep(self.config.status_poll_interval()).await;
            }
        }

        let state = last.map(|c| c.reason()).unwrap_or("busy");
        Err(LinkError::UploadTimeout(format!(
            "device still {state} after {attempts} status reads"
        )))
    }

    fn ensure_not_cancelled(&self) -> AppResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(LinkError::UploadCancelled)
        } else {
            Ok(())
        }
    }

    async fn send(&self, command: &UploadCommand) -> AppResult<()> {
        trace!(opcode = command.opcode(), "Upload command");
        self.manager
            .write(Characteristic::ModelUpload, &command.encode())
            .await
    }

    async fn send_cancel(&self) {
        if let Err(e) = self.send(&UploadCommand::Cancel).await {
            debug!(error = %e, "Cancel command not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::LinkConfig;
    use crate::model::{pack, DeviceWeights, SimpleNet};
    use crate::protocol::{UploadPhase, UploadResultCode, MODEL_UPLOAD_CHAR_UUID};
    use crate::transport::mock::{MockCentral, MockPeripheral};

    fn blob() -> ModelBlob {
        let net = SimpleNet::new(600, 32, 3, 7);
        let weights = DeviceWeights::extract(&net).unwrap();
        pack(&weights, &["idle".into(), "wave".into(), "shake".into()]).unwrap()
    }

    fn status(code: UploadResultCode) -> UploadStatus {
        UploadStatus {
            phase: UploadPhase::Complete,
            progress: 100,
            code,
        }
    }

    async fn service() -> (Arc<MockPeripheral>, UploadService) {
        let device = MockPeripheral::edge_ai("SevernEdgeAI-4");
        let central = Arc::new(MockCentral::new(device.clone()));
        let manager = ConnectionManager::open(central, LinkConfig::default()).unwrap();
        manager.connect().await.unwrap();
        (device, UploadService::new(manager))
    }

    #[test]
    fn test_progress_messages_are_readable() {
        let p = UploadProgress::Uploading {
            sent: 239,
            total: 478,
        };
        assert_eq!(p.to_string(), "Uploading 239/478 bytes (50%)");
        assert_eq!(p.sent(), 239);
        assert!(!p.is_terminal());
        assert!(UploadProgress::Success { total: 1 }.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_through_busy_codes_until_success() {
        let (device, service) = service().await;
        device.push_status(status(UploadResultCode::Validating));
        device.push_status(status(UploadResultCode::Saving));
        device.push_status(status(UploadResultCode::Success));

        service.upload_model(&blob(), |_| {}).await.unwrap();
        let writes = device.writes_to(MODEL_UPLOAD_CHAR_UUID);
        assert_eq!(writes.last().map(|w| w.to_vec()), Some(vec![3]));
        assert!(!service.is_uploading());
    }

    #[tokio::test(start_paused = true)]
    async fn test_crc_failure_reports_code_and_cancels() {
        let (device, service) = service().await;
        device.push_status(status(UploadResultCode::CrcError));

        let events = Mutex::new(Vec::new());
        let err = service
            .upload_model(&blob(), |p| events.lock().push(p))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::UploadRejected { code: 11, .. }));

        let writes = device.writes_to(MODEL_UPLOAD_CHAR_UUID);
        assert_eq!(writes.last().map(|w| w.to_vec()), Some(vec![4]));
        let events = events.into_inner();
        assert!(matches!(events.last(), Some(UploadProgress::Error { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_settling_device_times_out() {
        let (device, service) = service().await;
        device.push_status(status(UploadResultCode::Validating));

        let err = service.upload_model(&blob(), |_| {}).await.unwrap_err();
        assert!(matches!(err, LinkError::UploadTimeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_upload_is_refused_and_cancel_stops_the_first() {
        let (device, service) = service().await;
        let service = Arc::new(service);
        let blob = blob();

        let running = {
            let service = service.clone();
            let blob = blob.clone();
            tokio::spawn(async move { service.upload_model(&blob, |_| {}).await })
        };
        while !service.is_uploading() {
            tokio::task::yield_now().await;
        }

        let before = device.writes_to(MODEL_UPLOAD_CHAR_UUID).len();
        let err = service.upload_model(&blob, |_| {}).await.unwrap_err();
        assert!(matches!(err, LinkError::UploadInProgress));

        service.cancel_upload().await;
        let result = running.await.unwrap();
        assert!(matches!(result, Err(LinkError::UploadCancelled)));
        assert!(!service.is_uploading());

        let writes = device.writes_to(MODEL_UPLOAD_CHAR_UUID);
        assert!(writes.len() > before);
        let cancels = writes.iter().filter(|w| w[..] == [4]).count();
        assert_eq!(cancels, 1);
    }

    #[tokio::test]
    async fn test_cancel_when_idle_is_a_noop() {
        let (device, service) = service().await;
        service.cancel_upload().await;
        assert!(device.writes_to(MODEL_UPLOAD_CHAR_UUID).is_empty());
    }
}
