//! Device model blob.
//!
//! The firmware loads a fixed-layout little-endian structure:
//!
//! ```text
//! u32 magic "SNNN" | u32 class count | u32 input size | u32 hidden size
//! f32 hidden weights  [hidden][input]
//! f32 hidden bias     [hidden]
//! f32 output weights  [max classes][hidden]   zero rows past class count
//! f32 output bias     [max classes]           zero past class count
//! u8  labels          [max classes][16]       NUL padded
//! ```
//!
//! The length never depends on the class count, so the device can allocate
//! it statically. Training frameworks keep dense kernels as `[input][output]`;
//! the device wants `[output][input]`, hence [`transpose_for_device`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::network::{argmax, softmax};
use super::Matrix;
use crate::error::{AppResult, LinkError};
use crate::protocol::checksum::checksum32;
use crate::protocol::upload::{label_from_slot, label_slot};
use crate::protocol::{LABEL_SLOT_LEN, MODEL_MAGIC, NN_HIDDEN_SIZE, NN_INPUT_SIZE, NN_MAX_CLASSES};

const HEADER_LEN: usize = 16;
const F32_LEN: usize = 4;

/// Total blob length: 78 128 bytes with the current constants.
pub const MODEL_BLOB_LEN: usize = HEADER_LEN
    + NN_HIDDEN_SIZE * NN_INPUT_SIZE * F32_LEN
    + NN_HIDDEN_SIZE * F32_LEN
    + NN_MAX_CLASSES * NN_HIDDEN_SIZE * F32_LEN
    + NN_MAX_CLASSES * F32_LEN
    + NN_MAX_CLASSES * LABEL_SLOT_LEN;

/// One dense layer in training layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    /// `[input][output]`
    pub kernel: Matrix,
    /// `[output]`
    pub bias: Vec<f32>,
}

impl DenseLayer {
    pub(crate) fn check(&self) -> AppResult<()> {
        if self.bias.len() != self.kernel.cols() {
            return Err(LinkError::Dimension {
                what: "layer bias".into(),
                expected: self.kernel.cols(),
                actual: self.bias.len(),
            });
        }
        Ok(())
    }
}

/// A trained model whose dense layers can be read out.
///
/// Implementations return copies. Extraction must leave the model usable for
/// further prediction and training.
pub trait WeightSource {
    /// Dense layers in forward order.
    fn dense_layers(&self) -> Vec<DenseLayer>;
}

/// Reindexes a `[input][output]` kernel to `[output][input]`.
pub fn transpose_for_device(kernel: &Matrix) -> Matrix {
    let mut out = Matrix::zeros(kernel.cols(), kernel.rows());
    for i in 0..kernel.rows() {
        for o in 0..kernel.cols() {
            out.set(o, i, kernel.get(i, o));
        }
    }
    out
}

/// Weights already in device layout, unpadded.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceWeights {
    /// `[hidden][input]`
    pub hidden_weights: Matrix,
    /// `[hidden]`
    pub hidden_bias: Vec<f32>,
    /// `[classes][hidden]`
    pub output_weights: Matrix,
    /// `[classes]`
    pub output_bias: Vec<f32>,
}

impl DeviceWeights {
    /// Reads and transposes the two dense layers of `source`.
    pub fn extract<S: WeightSource + ?Sized>(source: &S) -> AppResult<Self> {
        let layers = source.dense_layers();
        let [hidden, output] = <[DenseLayer; 2]>::try_from(layers).map_err(|layers| {
            LinkError::Dimension {
                what: "dense layer count".into(),
                expected: 2,
                actual: layers.len(),
            }
        })?;
        Ok(Self {
            hidden_weights: transpose_for_device(&hidden.kernel),
            hidden_bias: hidden.bias,
            output_weights: transpose_for_device(&output.kernel),
            output_bias: output.bias,
        })
    }

    /// Rows of the output layer.
    pub fn class_count(&self) -> usize {
        self.output_weights.rows()
    }

    /// Checks every dimension against the device layout.
    pub fn validate(&self) -> AppResult<()> {
        let checks = [
            ("hidden weight rows", NN_HIDDEN_SIZE, self.hidden_weights.rows()),
            ("hidden weight columns", NN_INPUT_SIZE, self.hidden_weights.cols()),
            ("hidden bias", NN_HIDDEN_SIZE, self.hidden_bias.len()),
            ("output weight columns", NN_HIDDEN_SIZE, self.output_weights.cols()),
            ("output bias", self.output_weights.rows(), self.output_bias.len()),
        ];
        for (what, expected, actual) in checks {
            if expected != actual {
                return Err(LinkError::Dimension {
                    what: what.into(),
                    expected,
                    actual,
                });
            }
        }
        let classes = self.class_count();
        if classes == 0 || classes > NN_MAX_CLASSES {
            return Err(LinkError::Dimension {
                what: "class count (1..=8)".into(),
                expected: NN_MAX_CLASSES,
                actual: classes,
            });
        }
        Ok(())
    }
}

/// Serialized device model plus the metadata the upload needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelBlob {
    bytes: Bytes,
    class_count: usize,
    labels: Vec<String>,
}

impl ModelBlob {
    /// Exact bytes to upload.
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Blob size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Classes written into the header.
    pub fn class_count(&self) -> usize {
        self.class_count
    }

    /// Labels in class order.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// CRC-32 of the whole blob, as sent in the upload Start command.
    pub fn crc32(&self) -> u32 {
        checksum32(&self.bytes)
    }

    /// Wraps previously exported bytes after validating them.
    pub fn from_bytes(bytes: Bytes) -> AppResult<Self> {
        let model = Self::parse(&bytes)?;
        Ok(Self {
            bytes,
            class_count: model.class_count,
            labels: model.labels,
        })
    }

    /// Validates a blob the way the firmware loader does and decodes it.
    pub fn parse(bytes: &[u8]) -> AppResult<DeviceModel> {
        if bytes.len() != MODEL_BLOB_LEN {
            return Err(LinkError::Dimension {
                what: "model blob length".into(),
                expected: MODEL_BLOB_LEN,
                actual: bytes.len(),
            });
        }

        let mut cur = bytes;
        let magic = cur.get_u32_le();
        if magic != MODEL_MAGIC {
            return Err(LinkError::Protocol(format!(
                "bad model magic 0x{magic:08X}, expected 0x{MODEL_MAGIC:08X}"
            )));
        }
        let class_count = cur.get_u32_le() as usize;
        let input_size = cur.get_u32_le() as usize;
        let hidden_size = cur.get_u32_le() as usize;

        if input_size != NN_INPUT_SIZE {
            return Err(LinkError::Dimension {
                what: "blob input size".into(),
                expected: NN_INPUT_SIZE,
                actual: input_size,
            });
        }
        if hidden_size != NN_HIDDEN_SIZE {
            return Err(LinkError::Dimension {
                what: "blob hidden size".into(),
                expected: NN_HIDDEN_SIZE,
                actual: hidden_size,
            });
        }
        if class_count == 0 || class_count > NN_MAX_CLASSES {
            return Err(LinkError::Dimension {
                what: "blob class count (1..=8)".into(),
                expected: NN_MAX_CLASSES,
                actual: class_count,
            });
        }

        let hidden_weights = read_f32s(&mut cur, NN_HIDDEN_SIZE * NN_INPUT_SIZE);
        let hidden_bias = read_f32s(&mut cur, NN_HIDDEN_SIZE);
        let output_weights = read_f32s(&mut cur, NN_MAX_CLASSES * NN_HIDDEN_SIZE);
        let output_bias = read_f32s(&mut cur, NN_MAX_CLASSES);
        let labels = cur
            .chunks_exact(LABEL_SLOT_LEN)
            .take(class_count)
            .map(label_from_slot)
            .collect();

        Ok(DeviceModel {
            class_count,
            hidden_weights,
            hidden_bias,
            output_weights,
            output_bias,
            labels,
        })
    }
}

fn read_f32s(cur: &mut &[u8], count: usize) -> Vec<f32> {
    (0..count).map(|_| cur.get_f32_le()).collect()
}

/// Serializes `weights` and `labels` into the device layout.
///
/// Fails before writing anything if any dimension is off or the label count
/// differs from the class count.
pub fn pack(weights: &DeviceWeights, labels: &[String]) -> AppResult<ModelBlob> {
    weights.validate()?;
    let class_count = weights.class_count();
    if labels.len() != class_count {
        return Err(LinkError::Dimension {
            what: "label count".into(),
            expected: class_count,
            actual: labels.len(),
        });
    }

    let mut buf = BytesMut::with_capacity(MODEL_BLOB_LEN);
    buf.put_u32_le(MODEL_MAGIC);
    buf.put_u32_le(class_count as u32);
    buf.put_u32_le(NN_INPUT_SIZE as u32);
    buf.put_u32_le(NN_HIDDEN_SIZE as u32);

    for w in weights.hidden_weights.as_slice() {
        buf.put_f32_le(*w);
    }
    for b in &weights.hidden_bias {
        buf.put_f32_le(*b);
    }

    for w in weights.output_weights.as_slice() {
        buf.put_f32_le(*w);
    }
    buf.put_bytes(0, (NN_MAX_CLASSES - class_count) * NN_HIDDEN_SIZE * F32_LEN);
    for b in &weights.output_bias {
        buf.put_f32_le(*b);
    }
    buf.put_bytes(0, (NN_MAX_CLASSES - class_count) * F32_LEN);

    for label in labels {
        buf.put_slice(&label_slot(label));
    }
    buf.put_bytes(0, (NN_MAX_CLASSES - class_count) * LABEL_SLOT_LEN);

    debug_assert_eq!(buf.len(), MODEL_BLOB_LEN);
    tracing::debug!(class_count, len = buf.len(), "Packed device model");

    Ok(ModelBlob {
        bytes: buf.freeze(),
        class_count,
        labels: labels.to_vec(),
    })
}

/// Result of the device forward pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    /// Argmax over the used classes
    pub class_index: usize,
    /// Probability of `class_index`
    pub confidence: f32,
    /// Softmax output, one per used class
    pub probabilities: Vec<f32>,
}

/// Decoded blob able to run the firmware's forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceModel {
    /// Classes in use, at most the padded maximum
    pub class_count: usize,
    /// `[hidden][input]`, flat
    pub hidden_weights: Vec<f32>,
    /// `[hidden]`
    pub hidden_bias: Vec<f32>,
    /// `[max classes][hidden]`, flat and padded
    pub output_weights: Vec<f32>,
    /// `[max classes]`, padded
    pub output_bias: Vec<f32>,
    /// One per used class
    pub labels: Vec<String>,
}

impl DeviceModel {
    /// Dense + ReLU, dense, softmax, argmax over the used classes.
    pub fn predict(&self, input: &[f32]) -> AppResult<Prediction> {
        if input.len() != NN_INPUT_SIZE {
            return Err(LinkError::Dimension {
                what: "input vector".into(),
                expected: NN_INPUT_SIZE,
                actual: input.len(),
            });
        }

        let hidden = dense_device(
            input,
            &self.hidden_weights,
            &self.hidden_bias,
            NN_HIDDEN_SIZE,
            true,
        );
        let mut probabilities = dense_device(
            &hidden,
            &self.output_weights,
            &self.output_bias,
            self.class_count,
            false,
        );
        softmax(&mut probabilities);
        let class_index = argmax(&probabilities);

        Ok(Prediction {
            class_index,
            confidence: probabilities[class_index],
            probabilities,
        })
    }

    /// Label of a class index reported by the device.
    pub fn label(&self, class_index: usize) -> Option<&str> {
        self.labels.get(class_index).map(String::as_str)
    }
}

/// Forward pass over a `[output][input]` flat kernel.
fn dense_device(input: &[f32], weights: &[f32], bias: &[f32], outputs: usize, relu: bool) -> Vec<f32> {
    let width = input.len();
    (0..outputs)
        .map(|o| {
            let row = &weights[o * width..(o + 1) * width];
            let sum = bias[o] + row.iter().zip(input).map(|(w, x)| w * x).sum::<f32>();
            if relu {
                sum.max(0.0)
            } else {
                sum
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SimpleNet;

    fn labels(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("gesture_{i}")).collect()
    }

    fn device_net(classes: usize) -> SimpleNet {
        SimpleNet::new(NN_INPUT_SIZE, NN_HIDDEN_SIZE, classes, 42)
    }

    fn offset_output_weights() -> usize {
        HEADER_LEN + (NN_HIDDEN_SIZE * NN_INPUT_SIZE + NN_HIDDEN_SIZE) * F32_LEN
    }

    fn offset_output_bias() -> usize {
        offset_output_weights() + NN_MAX_CLASSES * NN_HIDDEN_SIZE * F32_LEN
    }

    fn offset_labels() -> usize {
        offset_output_bias() + NN_MAX_CLASSES * F32_LEN
    }

    #[test]
    fn test_blob_length_is_fixed() {
        assert_eq!(MODEL_BLOB_LEN, 78_128);
        for classes in [1, 3, NN_MAX_CLASSES] {
            let w = DeviceWeights::extract(&device_net(classes)).unwrap();
            let blob = pack(&w, &labels(classes)).unwrap();
            assert_eq!(blob.len(), MODEL_BLOB_LEN);
            assert_eq!(blob.class_count(), classes);
        }
    }

    #[test]
    fn test_transpose_swaps_indices() {
        let src = Matrix::new(3, 2, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let dst = transpose_for_device(&src);
        assert_eq!((dst.rows(), dst.cols()), (2, 3));
        for i in 0..3 {
            for h in 0..2 {
                assert_eq!(dst.get(h, i), src.get(i, h));
            }
        }
    }

    #[test]
    fn test_header_and_padding_layout() {
        let net = device_net(3);
        let w = DeviceWeights::extract(&net).unwrap();
        let blob = pack(&w, &labels(3)).unwrap();
        let b = blob.as_bytes();

        assert_eq!(&b[0..4], b"SNNN");
        assert_eq!(u32::from_le_bytes([b[4], b[5], b[6], b[7]]), 3);
        assert_eq!(u32::from_le_bytes([b[8], b[9], b[10], b[11]]), 600);
        assert_eq!(u32::from_le_bytes([b[12], b[13], b[14], b[15]]), 32);

        // First hidden weight is device[0][0] == training[0][0]
        let first = f32::from_le_bytes([b[16], b[17], b[18], b[19]]);
        assert_eq!(first, net.dense_layers()[0].kernel.get(0, 0));

        let used_out = offset_output_weights() + 3 * NN_HIDDEN_SIZE * F32_LEN;
        assert!(b[used_out..offset_output_bias()].iter().all(|&x| x == 0));
        let used_bias = offset_output_bias() + 3 * F32_LEN;
        assert!(b[used_bias..offset_labels()].iter().all(|&x| x == 0));
        let used_labels = offset_labels() + 3 * LABEL_SLOT_LEN;
        assert!(b[used_labels..].iter().all(|&x| x == 0));

        assert_eq!(&b[offset_labels()..offset_labels() + 10], b"gesture_0\0");
    }

    #[test]
    fn test_dimension_mismatches_are_rejected() {
        let small = SimpleNet::new(10, NN_HIDDEN_SIZE, 2, 1);
        let w = DeviceWeights::extract(&small).unwrap();
        assert!(matches!(
            pack(&w, &labels(2)),
            Err(LinkError::Dimension { expected: 600, actual: 10, .. })
        ));

        let wide = SimpleNet::new(NN_INPUT_SIZE, 16, 2, 1);
        let w = DeviceWeights::extract(&wide).unwrap();
        assert!(pack(&w, &labels(2)).is_err());

        let too_many = device_net(9);
        let w = DeviceWeights::extract(&too_many).unwrap();
        assert!(pack(&w, &labels(9)).is_err());

        let w = DeviceWeights::extract(&device_net(3)).unwrap();
        assert!(matches!(
            pack(&w, &labels(2)),
            Err(LinkError::Dimension { expected: 3, actual: 2, .. })
        ));
    }

    #[test]
    fn test_extraction_leaves_model_usable() {
        let mut net = device_net(3);
        let input: Vec<f32> = (0..NN_INPUT_SIZE).map(|i| (i as f32 * 0.01).sin()).collect();
        let before = net.predict(&input).unwrap();

        let w = DeviceWeights::extract(&net).unwrap();
        let _blob = pack(&w, &labels(3)).unwrap();

        assert_eq!(net.predict(&input).unwrap(), before);
        net.train_step(&input, 1, 0.01).unwrap();
    }

    #[test]
    fn test_parsed_blob_predicts_like_source() {
        let net = device_net(4);
        let blob = pack(&DeviceWeights::extract(&net).unwrap(), &labels(4)).unwrap();
        let model = ModelBlob::parse(blob.as_bytes()).unwrap();
        assert_eq!(model.class_count, 4);
        assert_eq!(model.label(2), Some("gesture_2"));

        let input: Vec<f32> = (0..NN_INPUT_SIZE).map(|i| ((i % 17) as f32 - 8.0) / 8.0).collect();
        let host = net.predict(&input).unwrap();
        let device = model.predict(&input).unwrap();
        assert_eq!(device.class_index, argmax(&host));
        for (a, b) in host.iter().zip(&device.probabilities) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn test_parse_rejects_bad_blobs() {
        assert!(ModelBlob::parse(&[0u8; 16]).is_err());
        let net = device_net(2);
        let blob = pack(&DeviceWeights::extract(&net).unwrap(), &labels(2)).unwrap();

        let mut bad_magic = blob.as_bytes().to_vec();
        bad_magic[0] = 0;
        assert!(matches!(ModelBlob::parse(&bad_magic), Err(LinkError::Protocol(_))));

        let roundtrip = ModelBlob::from_bytes(blob.as_bytes().clone()).unwrap();
        assert_eq!(roundtrip.labels(), blob.labels());
        assert_eq!(roundtrip.crc32(), blob.crc32());
    }
}
