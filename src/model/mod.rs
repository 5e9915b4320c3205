//! Classifier weights: extraction from a trained model and the device blob.
//!
//! - [`packer`] turns dense-layer weights into the fixed-layout `ModelBlob`
//!   the firmware loads, and parses blobs back for inspection.
//! - [`network`] is a small dense classifier with the same topology as the
//!   device model. It stands in for the training side when packing from the
//!   CLI and in tests.

pub mod network;
pub mod packer;

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, LinkError};

pub use network::SimpleNet;
pub use packer::{
    pack, transpose_for_device, DenseLayer, DeviceModel, DeviceWeights, ModelBlob, Prediction,
    WeightSource, MODEL_BLOB_LEN,
};

/// Dense row-major `f32` matrix.
///
/// Serializes as nested rows, the shape weight exports use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<f32>>", into = "Vec<Vec<f32>>")]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Matrix {
    /// Wraps `data` as a `rows × cols` matrix.
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> AppResult<Self> {
        if data.len() != rows * cols {
            return Err(LinkError::Dimension {
                what: format!("{rows}x{cols} matrix data"),
                expected: rows * cols,
                actual: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// All-zero matrix.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Builds a matrix from nested rows, as found in JSON weight exports.
    pub fn from_rows(rows: &[Vec<f32>]) -> AppResult<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (r, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(LinkError::Dimension {
                    what: format!("row {r} width"),
                    expected: cols,
                    actual: row.len(),
                });
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data,
        })
    }

    /// Row count.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Column count.
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: f32) {
        self.data[row * self.cols + col] = value;
    }

    /// Row-major backing storage.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

impl TryFrom<Vec<Vec<f32>>> for Matrix {
    type Error = LinkError;

    fn try_from(rows: Vec<Vec<f32>>) -> AppResult<Self> {
        Self::from_rows(&rows)
    }
}

impl From<Matrix> for Vec<Vec<f32>> {
    fn from(matrix: Matrix) -> Self {
        if matrix.cols == 0 {
            return vec![Vec::new(); matrix.rows];
        }
        matrix.data.chunks(matrix.cols).map(<[f32]>::to_vec).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_json_uses_nested_rows() {
        let m = Matrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]).unwrap();
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, "[[1.0,2.0],[3.0,4.0],[5.0,6.0]]");

        let back: Matrix = serde_json::from_str(&json).unwrap();
        assert_eq!(back.rows(), 3);
        assert_eq!(back.get(2, 1), 6.0);
    }

    #[test]
    fn test_ragged_rows_are_rejected() {
        assert!(serde_json::from_str::<Matrix>("[[1.0,2.0],[3.0]]").is_err());
        assert!(matches!(
            Matrix::new(2, 2, vec![0.0; 3]),
            Err(LinkError::Dimension { expected: 4, actual: 3, .. })
        ));
    }
}
