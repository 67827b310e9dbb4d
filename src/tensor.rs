//! In-memory tensors and storage precision
//!
//! A [`Tensor`] keeps the raw little-endian bytes exactly as they were read
//! from disk. Key and shape surgery works on those bytes directly, so values
//! are never upcast or downcast behind the caller's back. Arithmetic goes
//! through [`Tensor::to_f32_vec`] / [`Tensor::from_f32`] and the target
//! [`Precision`] is chosen explicitly at that boundary.

use half::{bf16, f16};
use ndarray::ArrayD;
use safetensors::tensor::TensorView;
use safetensors::Dtype;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{ForgeError, Result};

/// Storage precision for tensors produced by arithmetic transforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Fp32,
    Fp16,
    #[default]
    Bf16,
}

impl Precision {
    pub fn dtype(&self) -> Dtype {
        match self {
            Precision::Fp32 => Dtype::F32,
            Precision::Fp16 => Dtype::F16,
            Precision::Bf16 => Dtype::BF16,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Precision::Fp32 => "fp32",
            Precision::Fp16 => "fp16",
            Precision::Bf16 => "bf16",
        }
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fp32" | "f32" | "float32" => Ok(Self::Fp32),
            "fp16" | "f16" | "float16" => Ok(Self::Fp16),
            "bf16" | "bfloat16" => Ok(Self::Bf16),
            _ => Err(format!("Unknown precision: {s} (expected fp32, fp16 or bf16)")),
        }
    }
}

/// Size in bytes of one element, `None` for packed sub-byte dtypes (F4, F6)
pub fn element_size(dtype: Dtype) -> Option<usize> {
    let bits = dtype.bitsize();
    (bits % 8 == 0).then_some(bits / 8)
}

/// Bytes needed to store `numel` elements, packed dtypes rounded up
pub fn storage_len(dtype: Dtype, numel: usize) -> usize {
    (numel * dtype.bitsize()).div_ceil(8)
}

/// Short display name used in reports (`F32`, `BF16`, ...)
pub fn dtype_name(dtype: Dtype) -> String {
    format!("{:?}", dtype)
}

fn is_float(dtype: Dtype) -> bool {
    matches!(dtype, Dtype::F32 | Dtype::F16 | Dtype::BF16 | Dtype::F64)
}

/// A named-tensor dictionary entry: dtype, shape and raw bytes
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: Dtype,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl Tensor {
    /// Any safetensors dtype is accepted; bytes are kept as they are
    pub fn new(dtype: Dtype, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let expected = storage_len(dtype, shape.iter().product());
        if data.len() != expected {
            return Err(ForgeError::DataLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    /// Zero-filled tensor; all-zero bytes are 0.0 for every float dtype
    pub fn zeros(dtype: Dtype, shape: Vec<usize>) -> Self {
        let len = storage_len(dtype, shape.iter().product());
        Self {
            dtype,
            shape,
            data: vec![0u8; len],
        }
    }

    /// Encode f32 values into the given float dtype
    pub fn from_f32(shape: Vec<usize>, values: &[f32], dtype: Dtype) -> Result<Self> {
        let numel = shape.iter().product::<usize>();
        if values.len() != numel {
            return Err(ForgeError::DataLength {
                expected: numel,
                actual: values.len(),
            });
        }

        let data: Vec<u8> = match dtype {
            Dtype::F32 => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Dtype::F16 => values
                .iter()
                .flat_map(|v| f16::from_f32(*v).to_bits().to_le_bytes())
                .collect(),
            Dtype::BF16 => values
                .iter()
                .flat_map(|v| bf16::from_f32(*v).to_bits().to_le_bytes())
                .collect(),
            Dtype::F64 => values
                .iter()
                .flat_map(|v| (*v as f64).to_le_bytes())
                .collect(),
            other => return Err(ForgeError::UnsupportedDtype(dtype_name(other))),
        };

        Ok(Self { dtype, shape, data })
    }

    /// 0-D f32 tensor, used for LoRA `alpha` entries
    pub fn scalar_f32(value: f32) -> Self {
        Self {
            dtype: Dtype::F32,
            shape: Vec::new(),
            data: value.to_le_bytes().to_vec(),
        }
    }

    pub fn from_array(array: &ArrayD<f32>, dtype: Dtype) -> Result<Self> {
        let values: Vec<f32> = array.iter().copied().collect();
        Self::from_f32(array.shape().to_vec(), &values, dtype)
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn element_size(&self) -> Option<usize> {
        element_size(self.dtype)
    }

    pub fn is_float(&self) -> bool {
        is_float(self.dtype)
    }

    /// Decode into f32 values (row-major)
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        let values = match self.dtype {
            Dtype::F32 => self
                .data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            Dtype::F16 => self
                .data
                .chunks_exact(2)
                .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect(),
            Dtype::BF16 => self
                .data
                .chunks_exact(2)
                .map(|c| bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect(),
            Dtype::F64 => self
                .data
                .chunks_exact(8)
                .map(|c| {
                    let mut arr = [0u8; 8];
                    arr.copy_from_slice(c);
                    f64::from_le_bytes(arr) as f32
                })
                .collect(),
            other => return Err(ForgeError::UnsupportedDtype(dtype_name(other))),
        };
        Ok(values)
    }

    /// Convert to another dtype; identical dtype returns an exact copy
    pub fn cast(&self, dtype: Dtype) -> Result<Tensor> {
        if dtype == self.dtype {
            return Ok(self.clone());
        }
        let values = self.to_f32_vec()?;
        Self::from_f32(self.shape.clone(), &values, dtype)
    }

    pub fn view(&self) -> Result<TensorView<'_>> {
        Ok(TensorView::new(self.dtype, self.shape.clone(), &self.data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_roundtrip_is_exact() {
        let values = [0.0f32, -1.5, 3.25, 1e-7];
        let t = Tensor::from_f32(vec![2, 2], &values, Dtype::F32).unwrap();
        assert_eq!(t.to_f32_vec().unwrap(), values);
        assert_eq!(t.element_size(), Some(4));
    }

    #[test]
    fn test_bf16_encoding() {
        let t = Tensor::from_f32(vec![3], &[1.0, -2.0, 0.5], Precision::Bf16.dtype()).unwrap();
        assert_eq!(t.dtype(), Dtype::BF16);
        assert_eq!(t.data().len(), 6);
        assert_eq!(t.to_f32_vec().unwrap(), vec![1.0, -2.0, 0.5]);
    }

    #[test]
    fn test_new_rejects_wrong_length() {
        let err = Tensor::new(Dtype::F16, vec![2, 2], vec![0u8; 6]).unwrap_err();
        assert!(matches!(err, ForgeError::DataLength { expected: 8, actual: 6 }));
    }

    #[test]
    fn test_exotic_dtypes_keep_raw_bytes() {
        let scale = Tensor::new(Dtype::F8_E8M0, vec![4], vec![127, 128, 126, 130]).unwrap();
        assert_eq!(scale.element_size(), Some(1));
        assert_eq!(scale.data(), &[127, 128, 126, 130]);
        assert!(matches!(scale.to_f32_vec(), Err(ForgeError::UnsupportedDtype(_))));

        // two F4 values per byte
        let packed = Tensor::zeros(Dtype::F4, vec![2, 3]);
        assert_eq!(packed.data().len(), 3);
        assert_eq!(packed.element_size(), None);
    }

    #[test]
    fn test_scalar_has_empty_shape() {
        let t = Tensor::scalar_f32(16.0);
        assert_eq!(t.ndim(), 0);
        assert_eq!(t.numel(), 1);
        assert_eq!(t.to_f32_vec().unwrap(), vec![16.0]);
    }

    #[test]
    fn test_cast_same_dtype_is_identity() {
        let t = Tensor::from_f32(vec![2], &[0.1, 0.2], Dtype::F16).unwrap();
        assert_eq!(t.cast(Dtype::F16).unwrap(), t);
        let up = t.cast(Dtype::F32).unwrap();
        assert_eq!(up.dtype(), Dtype::F32);
        assert_eq!(up.shape(), &[2]);
    }

    #[test]
    fn test_precision_parse() {
        assert_eq!("bf16".parse::<Precision>().unwrap(), Precision::Bf16);
        assert_eq!("FP32".parse::<Precision>().unwrap(), Precision::Fp32);
        assert!("int8".parse::<Precision>().is_err());
    }
}
