//! Integration tests for the chunked model upload against the simulated board.

use std::sync::Arc;

use bytes::{Buf, Bytes};
use edge_link::config::LinkConfig;
use edge_link::model::{pack, DeviceWeights, ModelBlob, SimpleNet, MODEL_BLOB_LEN};
use edge_link::protocol::upload::{label_from_slot, CMD_CANCEL, CMD_CHUNK, CMD_COMPLETE, CMD_START};
use edge_link::protocol::{
    checksum32, UploadPhase, UploadResultCode, UploadStatus, LABEL_SLOT_LEN,
    MODEL_UPLOAD_CHAR_UUID, NN_HIDDEN_SIZE, NN_INPUT_SIZE,
};
use edge_link::transport::mock::{MockCentral, MockPeripheral};
use edge_link::transport::TransportError;
use edge_link::{ConnectionManager, LinkError, UploadProgress, UploadService};
use parking_lot::Mutex;

fn blob(labels: &[&str]) -> ModelBlob {
    let net = SimpleNet::new(NN_INPUT_SIZE, NN_HIDDEN_SIZE, labels.len(), 11);
    let weights = DeviceWeights::extract(&net).expect("Extraction failed");
    let labels: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
    pack(&weights, &labels).expect("Pack failed")
}

fn success() -> UploadStatus {
    UploadStatus {
        phase: UploadPhase::Complete,
        progress: 100,
        code: UploadResultCode::Success,
    }
}

async fn connected() -> (Arc<MockPeripheral>, ConnectionManager) {
    let device = MockPeripheral::edge_ai("SevernEdgeAI-5");
    let central = Arc::new(MockCentral::new(device.clone()));
    let manager =
        ConnectionManager::open(central, LinkConfig::default()).expect("Config should be valid");
    manager.connect().await.expect("Connect failed");
    (device, manager)
}

#[tokio::test(start_paused = true)]
async fn test_wire_traffic_covers_blob_exactly_once() {
    let (device, manager) = connected().await;
    device.push_status(success());
    let blob = blob(&["rest", "wave", "shake"]);

    let events = Mutex::new(Vec::new());
    UploadService::new(manager)
        .upload_model(&blob, |p| events.lock().push(p))
        .await
        .expect("Upload failed");

    let writes = device.writes_to(MODEL_UPLOAD_CHAR_UUID);
    let (start, rest) = writes.split_first().expect("No writes recorded");

    // Start: opcode, size, crc, count, label slots
    let mut header = start.clone();
    assert_eq!(header.get_u8(), CMD_START);
    assert_eq!(header.get_u32_le() as usize, MODEL_BLOB_LEN);
    assert_eq!(header.get_u32_le(), checksum32(blob.as_bytes()));
    assert_eq!(header.get_u8(), 3);
    assert_eq!(header.len(), 3 * LABEL_SLOT_LEN);
    assert_eq!(label_from_slot(&header[LABEL_SLOT_LEN..2 * LABEL_SLOT_LEN]), "wave");

    let (complete, chunks) = rest.split_last().expect("No Complete written");
    assert_eq!(complete[..], [CMD_COMPLETE]);

    let mut reassembled = Vec::with_capacity(MODEL_BLOB_LEN);
    for chunk in chunks {
        assert!(chunk.len() <= 244);
        let mut cur: Bytes = chunk.clone();
        assert_eq!(cur.get_u8(), CMD_CHUNK);
        assert_eq!(cur.get_u32_le() as usize, reassembled.len());
        reassembled.extend_from_slice(&cur);
    }
    assert_eq!(chunks.len(), MODEL_BLOB_LEN.div_ceil(239));
    assert_eq!(&reassembled[..], &blob.as_bytes()[..]);

    let events = events.into_inner();
    assert_eq!(
        events.first(),
        Some(&UploadProgress::Starting {
            total: MODEL_BLOB_LEN
        })
    );
    assert_eq!(
        events.last(),
        Some(&UploadProgress::Success {
            total: MODEL_BLOB_LEN
        })
    );
    let uploading: Vec<usize> = events
        .iter()
        .filter_map(|p| match p {
            UploadProgress::Uploading { sent, .. } => Some(*sent),
            _ => None,
        })
        .collect();
    assert_eq!(uploading.len(), chunks.len());
    assert!(uploading.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(uploading.last(), Some(&MODEL_BLOB_LEN));
}

#[tokio::test(start_paused = true)]
async fn test_write_failure_sends_cancel_and_reraises() {
    let (device, manager) = connected().await;
    device.fail_write(MODEL_UPLOAD_CHAR_UUID, 5);

    let events = Mutex::new(Vec::new());
    let err = UploadService::new(manager)
        .upload_model(&blob(&["a", "b"]), |p| events.lock().push(p))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        LinkError::Transport(TransportError::Gatt(ref msg)) if msg == "GATT write failed"
    ));
    let writes = device.writes_to(MODEL_UPLOAD_CHAR_UUID);
    assert_eq!(writes.len(), 6);
    assert_eq!(writes.last().map(|w| w[0]), Some(CMD_CANCEL));
    match events.into_inner().last() {
        Some(UploadProgress::Error { sent, message, .. }) => {
            assert_eq!(*sent, 4 * 239);
            assert!(message.contains("GATT write failed"));
        }
        other => panic!("Expected error milestone, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_idle_status_after_complete_is_rejected() {
    let (device, manager) = connected().await;

    let err = UploadService::new(manager)
        .upload_model(&blob(&["a"]), |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::UploadRejected { code: 0, .. }));
    let writes = device.writes_to(MODEL_UPLOAD_CHAR_UUID);
    assert_eq!(writes.last().map(|w| w[0]), Some(CMD_CANCEL));
}

#[tokio::test(start_paused = true)]
async fn test_upload_requires_connection() {
    let device = MockPeripheral::edge_ai("SevernEdgeAI-5");
    let central = Arc::new(MockCentral::new(device.clone()));
    let manager =
        ConnectionManager::open(central, LinkConfig::default()).expect("Config should be valid");
    let service = UploadService::new(manager);

    let err = service.upload_model(&blob(&["a"]), |_| {}).await.unwrap_err();
    assert!(matches!(err, LinkError::NotConnected));
    assert!(!service.is_uploading());
    assert!(device.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_long_labels_are_truncated_in_start() {
    let (device, manager) = connected().await;
    device.push_status(success());

    UploadService::new(manager)
        .upload_model(&blob(&["a_very_long_gesture_name", "ok"]), |_| {})
        .await
        .expect("Upload failed");

    let start = device.writes_to(MODEL_UPLOAD_CHAR_UUID)[0].clone();
    let slot = &start[10..10 + LABEL_SLOT_LEN];
    assert_eq!(slot[15], 0);
    assert_eq!(label_from_slot(slot), "a_very_long_ges");
}

#[test]
fn test_packed_blob_survives_file_round_trip() {
    let blob = blob(&["rest", "wave"]);
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("model.bin");
    std::fs::write(&path, blob.as_bytes()).expect("Failed to write blob");

    let bytes = std::fs::read(&path).expect("Failed to read blob");
    let reloaded = ModelBlob::from_bytes(Bytes::from(bytes)).expect("Blob should validate");
    assert_eq!(reloaded.crc32(), blob.crc32());
    assert_eq!(reloaded.labels(), blob.labels());
}
