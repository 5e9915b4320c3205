//! Stream Multiplexer
//!
//! Raw-sensor streaming and on-device inference streaming share the link's
//! mode characteristic, so only one of them runs at a time. This module turns
//! raw notifications into typed records for the caller's callback and keeps
//! per-stream statistics.
//!
//! Corrupt sensor frames are routine on a radio link: they are counted and
//! dropped. Short inference records mean firmware mismatch: they are counted
//! and logged at warn, and the callback does not run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::AppResult;
use crate::link::{ConnectionManager, NotificationHandler};
use crate::protocol::{
    decode_inference_result, decode_sensor_frame, InferenceResult, SensorFrame, SequenceEvent,
    SequenceTracker, StreamMode,
};

/// Counters for the current stream session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    /// Sensor frames that passed length and checksum checks
    pub accepted: u64,
    /// Sensor frames dropped as corrupt or wrong length
    pub rejected: u64,
    /// Frames missing according to the sequence counter
    pub lost: u64,
    /// Sequence jumps too large to count as loss
    pub discontinuities: u64,
    /// Inference notifications that failed to decode
    pub protocol_errors: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    protocol_errors: AtomicU64,
    sequence: Mutex<SequenceTracker>,
}

/// Typed front-end over the manager's stream slot.
#[derive(Clone)]
pub struct StreamMultiplexer {
    manager: ConnectionManager,
    /// Counters of the last stream started through this multiplexer.
    counters: Arc<Mutex<Arc<Counters>>>,
}

impl StreamMultiplexer {
    /// Streams over `manager`'s link.
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            counters: Arc::new(Mutex::new(Arc::new(Counters::default()))),
        }
    }

    /// Installs `handler` with the fresh `counters` it feeds. The previous
    /// counters stay in place if the start fails.
    async fn start(
        &self,
        mode: StreamMode,
        handler: NotificationHandler,
        counters: Arc<Counters>,
    ) -> AppResult<()> {
        self.manager.start_stream(mode, handler).await?;
        *self.counters.lock() = counters;
        Ok(())
    }

    /// Starts raw-sensor streaming. `on_frame` sees only frames that passed
    /// validation.
    ///
    /// Statistics restart with each successful call.
    pub async fn start_sensor_stream<F>(&self, on_frame: F) -> AppResult<()>
    where
        F: Fn(SensorFrame) + Send + Sync + 'static,
    {
        let fresh = Arc::new(Counters::default());
        let counters = fresh.clone();
        let handler: NotificationHandler = Arc::new(move |value: Bytes| {
            let Some(frame) = decode_sensor_frame(&value) else {
                counters.rejected.fetch_add(1, Ordering::Relaxed);
                return;
            };
            counters.accepted.fetch_add(1, Ordering::Relaxed);
            if let SequenceEvent::Lost(missing) = counters.sequence.lock().observe(frame.sequence) {
                debug!(missing, sequence = frame.sequence, "Sensor frames lost");
            }
            on_frame(frame);
        });

        self.start(StreamMode::Collect, handler, fresh).await
    }

    /// Stops raw-sensor streaming and logs the session's counters.
    pub async fn stop_sensor_stream(&self) -> AppResult<()> {
        self.manager.stop_stream(StreamMode::Collect).await?;
        let stats = self.stats();
        info!(
            accepted = stats.accepted,
            rejected = stats.rejected,
            lost = stats.lost,
            "Sensor stream stopped"
        );
        Ok(())
    }

    /// Starts on-device inference streaming.
    pub async fn start_inference<F>(&self, on_result: F) -> AppResult<()>
    where
        F: Fn(InferenceResult) + Send + Sync + 'static,
    {
        let fresh = Arc::new(Counters::default());
        let counters = fresh.clone();
        let handler: NotificationHandler = Arc::new(move |value: Bytes| {
            match decode_inference_result(&value) {
                Ok(result) => on_result(result),
                Err(e) => {
                    counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Dropping inference notification");
                }
            }
        });

        self.start(StreamMode::Inference, handler, fresh).await
    }

    /// Stops inference streaming.
    pub async fn stop_inference(&self) -> AppResult<()> {
        self.manager.stop_stream(StreamMode::Inference).await
    }

    /// Mode currently streaming, if any.
    pub fn active_mode(&self) -> Option<StreamMode> {
        self.manager.active_stream()
    }

    /// Counters of the most recently started stream.
    pub fn stats(&self) -> StreamStats {
        let counters = self.counters.lock().clone();
        let sequence = counters.sequence.lock().stats();
        StreamStats {
            accepted: counters.accepted.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            lost: sequence.lost,
            discontinuities: sequence.discontinuities,
            protocol_errors: counters.protocol_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::LinkConfig;
    use crate::error::LinkError;
    use crate::protocol::{RawSample, INFERENCE_CHAR_UUID, MODE_CHAR_UUID, SENSOR_CHAR_UUID};
    use crate::transport::mock::{MockCentral, MockPeripheral};

    async fn connected() -> (Arc<MockPeripheral>, StreamMultiplexer) {
        let device = MockPeripheral::edge_ai("SevernEdgeAI-2");
        let central = Arc::new(MockCentral::new(device.clone()));
        let manager = ConnectionManager::open(central, LinkConfig::default()).unwrap();
        manager.connect().await.unwrap();
        (device, StreamMultiplexer::new(manager))
    }

    fn frame(sequence: u16) -> Vec<u8> {
        RawSample {
            accel: [8192, 0, -8192],
            gyro: [164, 0, 0],
            sequence,
            timestamp_ms: sequence.wrapping_mul(20),
        }
        .to_frame()
        .to_vec()
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_stream_counts_loss_and_corruption() {
        let (device, mux) = connected().await;
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        mux.start_sensor_stream(move |f| sink.lock().push(f))
            .await
            .unwrap();

        assert_eq!(device.writes_to(MODE_CHAR_UUID).last().map(|b| b[0]), Some(0));
        assert!(device.is_subscribed(SENSOR_CHAR_UUID));

        let mut corrupt = frame(101);
        corrupt[3] ^= 0x10;
        for payload in [frame(100), corrupt, frame(105), vec![1, 2, 3]] {
            assert!(device.notify(SENSOR_CHAR_UUID, payload));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stats = mux.stats();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.rejected, 2);
        assert_eq!(stats.lost, 4);
        let received = frames.lock();
        assert_eq!(received.len(), 2);
        assert!((received[0].accel[0] - 1.0).abs() < 1e-6);
        assert!((received[0].gyro[0] - 10.0).abs() < 1e-4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_modes_are_mutually_exclusive() {
        let (device, mux) = connected().await;
        mux.start_inference(|_| {}).await.unwrap();
        assert_eq!(device.writes_to(MODE_CHAR_UUID).last().map(|b| b[0]), Some(1));

        let err = mux.start_sensor_stream(|_| {}).await.unwrap_err();
        assert!(matches!(
            err,
            LinkError::StreamConflict {
                active: StreamMode::Inference,
                requested: StreamMode::Collect
            }
        ));

        mux.stop_inference().await.unwrap();
        assert!(!device.is_subscribed(INFERENCE_CHAR_UUID));
        assert_eq!(mux.active_mode(), None);
        mux.start_sensor_stream(|_| {}).await.unwrap();
        assert_eq!(mux.active_mode(), Some(StreamMode::Collect));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_inference_records_are_counted() {
        let (device, mux) = connected().await;
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        mux.start_inference(move |r| sink.lock().push(r)).await.unwrap();

        device.notify(INFERENCE_CHAR_UUID, vec![2u8, 87]);
        device.notify(INFERENCE_CHAR_UUID, vec![2u8]);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            *results.lock(),
            vec![InferenceResult {
                class_index: 2,
                confidence: 87
            }]
        );
        assert_eq!(mux.stats().protocol_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_start_keeps_running_stats() {
        let (device, mux) = connected().await;
        mux.start_sensor_stream(|_| {}).await.unwrap();
        for seq in [10u16, 11, 14] {
            device.notify(SENSOR_CHAR_UUID, frame(seq));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(mux.start_inference(|_| {}).await.is_err());
        let stats = mux.stats();
        assert_eq!(stats.accepted, 3);
        assert_eq!(stats.lost, 2);

        // A successful restart begins from zero
        mux.start_sensor_stream(|_| {}).await.unwrap();
        assert_eq!(mux.stats(), StreamStats::default());
    }
}
