//! Element-type tags for leaf data buffers.
//!
//! Leaf nodes own raw byte buffers; a `DType` tag tells the evaluator how to
//! decode them. The expression core otherwise treats leaf data as opaque.

use crate::shape::ShapeError;

/// The element type of a tensor's data buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    F32,
    F64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn byte_width(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }

    /// Decodes a little-endian byte buffer into `f64` values.
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<f64>, ShapeError> {
        let width = self.byte_width();
        if bytes.len() % width != 0 {
            return Err(ShapeError::ByteLength {
                len: bytes.len(),
                width,
            });
        }
        let out = match self {
            DType::F32 => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
                .collect(),
            DType::F64 => bytes
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        };
        Ok(out)
    }

    /// Encodes `f64` values into a little-endian byte buffer of this type.
    pub fn encode(&self, values: &[f64]) -> Vec<u8> {
        match self {
            DType::F32 => values
                .iter()
                .flat_map(|v| (*v as f32).to_le_bytes())
                .collect(),
            DType::F64 => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
