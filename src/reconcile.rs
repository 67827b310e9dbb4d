//! Crop or zero-pad tensors between two model size variants
//!
//! A [`ShapeProfile`] lists named dimension pairs (`old` for the smaller
//! architecture, `new` for the larger one). Only axes whose length equals a
//! profiled size are touched. Everything happens on raw element bytes, so
//! the dtype never changes and surviving values stay bit-identical.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{ForgeError, Result};
use crate::store::TensorDict;
use crate::tensor::{dtype_name, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// `new`-sized axes are sliced down to `[0:old]`
    Crop,
    /// `old`-sized axes are zero-extended to `new`
    Pad,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileDim {
    pub name: String,
    pub old: usize,
    pub new: usize,
}

impl FromStr for ProfileDim {
    type Err = String;

    /// `hidden=1536:5120` or `1536:5120`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (name, sizes) = match s.split_once('=') {
            Some((name, sizes)) => (name.trim().to_string(), sizes),
            None => (String::from("dim"), s),
        };
        let (old, new) = sizes
            .split_once(':')
            .ok_or_else(|| format!("Expected OLD:NEW, got {s}"))?;
        let old: usize = old.trim().parse().map_err(|e| format!("Bad old size in {s}: {e}"))?;
        let new: usize = new.trim().parse().map_err(|e| format!("Bad new size in {s}: {e}"))?;
        if old == 0 || new == 0 {
            return Err(format!("Dimension sizes must be positive: {s}"));
        }
        Ok(Self { name, old, new })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShapeProfile {
    pub dims: Vec<ProfileDim>,
}

impl ShapeProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dim(mut self, name: &str, old: usize, new: usize) -> Self {
        self.dims.push(ProfileDim {
            name: name.to_string(),
            old,
            new,
        });
        self
    }

    /// Wan 2.1 1.3B (hidden 1536, ffn 8960) against 14B (hidden 5120, ffn 13824)
    pub fn wan_1_3b_to_14b() -> Self {
        Self::new()
            .with_dim("hidden", 1536, 5120)
            .with_dim("ffn", 8960, 13824)
    }

    fn usable(&self) -> impl Iterator<Item = &ProfileDim> {
        self.dims.iter().filter(|d| d.old > 0 && d.new > 0)
    }

    /// Target length of one axis of a 2-D tensor
    fn axis_target(&self, len: usize, mode: Mode) -> usize {
        let hit = self.usable().find(|d| match mode {
            Mode::Crop => d.new == len,
            Mode::Pad => d.old == len,
        });
        match (hit, mode) {
            (Some(d), Mode::Crop) => d.old,
            (Some(d), Mode::Pad) => d.new,
            (None, _) => len,
        }
    }

    /// Target length of a 1-D tensor, scaled by whole multiples
    fn flat_target(&self, len: usize, mode: Mode) -> usize {
        for d in self.usable() {
            let (from, to) = match mode {
                Mode::Crop => (d.new, d.old),
                Mode::Pad => (d.old, d.new),
            };
            if len > 0 && len % from == 0 {
                return to * (len / from);
            }
        }
        len
    }
}

/// Crop or pad one tensor. Ranks other than 1 and 2 come back as exact copies.
pub fn reconcile(tensor: &Tensor, profile: &ShapeProfile, mode: Mode) -> Result<Tensor> {
    match tensor.shape() {
        [rows, cols] => {
            let target = (profile.axis_target(*rows, mode), profile.axis_target(*cols, mode));
            if target == (*rows, *cols) {
                return Ok(tensor.clone());
            }
            resize_2d(tensor, target.0, target.1)
        }
        [len] => {
            let target = profile.flat_target(*len, mode);
            if target == *len {
                return Ok(tensor.clone());
            }
            resize_1d(tensor, target)
        }
        _ => Ok(tensor.clone()),
    }
}

/// Packed sub-byte dtypes can't be sliced per element
fn byte_width(tensor: &Tensor) -> Result<usize> {
    tensor
        .element_size()
        .ok_or_else(|| ForgeError::UnsupportedDtype(dtype_name(tensor.dtype())))
}

/// Copy the overlapping top-left region into a zero-filled `rows x cols` tensor
fn resize_2d(tensor: &Tensor, rows: usize, cols: usize) -> Result<Tensor> {
    let (src_rows, src_cols) = match tensor.shape() {
        [r, c] => (*r, *c),
        other => {
            return Err(ForgeError::InvalidParameter(format!(
                "expected a 2-D tensor, got shape {other:?}"
            )))
        }
    };
    let es = byte_width(tensor)?;
    let keep_rows = src_rows.min(rows);
    let row_bytes = src_cols.min(cols) * es;

    let src = tensor.data();
    let mut data = vec![0u8; rows * cols * es];
    for r in 0..keep_rows {
        let from = r * src_cols * es;
        let to = r * cols * es;
        data[to..to + row_bytes].copy_from_slice(&src[from..from + row_bytes]);
    }
    Tensor::new(tensor.dtype(), vec![rows, cols], data)
}

fn resize_1d(tensor: &Tensor, len: usize) -> Result<Tensor> {
    let es = byte_width(tensor)?;
    let keep = tensor.numel().min(len) * es;
    let mut data = vec![0u8; len * es];
    data[..keep].copy_from_slice(&tensor.data()[..keep]);
    Tensor::new(tensor.dtype(), vec![len], data)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub changed: usize,
    pub unchanged: usize,
    pub dropped: usize,
}

/// Reconcile every tensor of a dictionary. With `max_blocks`, keys under
/// `blocks.N.` with `N >= max_blocks` are discarded.
pub fn reconcile_dict(
    dict: TensorDict,
    profile: &ShapeProfile,
    mode: Mode,
    max_blocks: Option<usize>,
) -> Result<(TensorDict, ReconcileReport)> {
    let block_re =
        Regex::new(r"blocks\.(\d+)\.").map_err(|e| ForgeError::InvalidRule(e.to_string()))?;
    let label = match mode {
        Mode::Crop => "CROP",
        Mode::Pad => "PAD",
    };

    let mut report = ReconcileReport::default();
    let mut out = TensorDict::new();
    out.set_metadata(dict.metadata().clone());

    for (key, tensor) in dict.into_sorted_entries() {
        if let Some(limit) = max_blocks {
            let index = block_re
                .captures(&key)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<usize>().ok());
            if matches!(index, Some(i) if i >= limit) {
                debug!("[SKIP] {} (layer >= {})", key, limit);
                report.dropped += 1;
                continue;
            }
        }

        let reshaped = reconcile(&tensor, profile, mode)?;
        if reshaped.shape() != tensor.shape() {
            debug!("[{}] {}: {:?} -> {:?}", label, key, tensor.shape(), reshaped.shape());
            report.changed += 1;
        } else {
            report.unchanged += 1;
        }
        out.insert(key, reshaped);
    }

    info!(
        "✔ {}: {} reshaped, {} unchanged, {} dropped",
        label, report.changed, report.unchanged, report.dropped
    );
    Ok((out, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use safetensors::Dtype;

    fn small_profile() -> ShapeProfile {
        ShapeProfile::new().with_dim("hidden", 2, 4).with_dim("ffn", 3, 6)
    }

    fn seq(shape: Vec<usize>, dtype: Dtype) -> Tensor {
        let n: usize = shape.iter().product();
        let values: Vec<f32> = (0..n).map(|i| i as f32 + 1.0).collect();
        Tensor::from_f32(shape, &values, dtype).unwrap()
    }

    #[test]
    fn test_crop_2d_top_left() {
        let t = seq(vec![4, 6], Dtype::F32);
        let out = reconcile(&t, &small_profile(), Mode::Crop).unwrap();
        assert_eq!(out.shape(), &[2, 3]);
        assert_eq!(out.to_f32_vec().unwrap(), vec![1.0, 2.0, 3.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_pad_2d_zero_fill() {
        let t = seq(vec![2, 5], Dtype::BF16);
        let out = reconcile(&t, &small_profile(), Mode::Pad).unwrap();
        // 5 is not profiled, only rows grow
        assert_eq!(out.shape(), &[4, 5]);
        assert_eq!(out.dtype(), Dtype::BF16);
        let v = out.to_f32_vec().unwrap();
        assert_eq!(&v[..10], &t.to_f32_vec().unwrap()[..]);
        assert!(v[10..].iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_crop_of_pad_roundtrips() {
        let t = seq(vec![2, 3], Dtype::F16);
        let padded = reconcile(&t, &small_profile(), Mode::Pad).unwrap();
        assert_eq!(padded.shape(), &[4, 6]);
        let back = reconcile(&padded, &small_profile(), Mode::Crop).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_1d_scales_by_multiples() {
        let t = seq(vec![12], Dtype::F32);
        // 12 % 4 == 0 -> 3 * 2 = 6
        let out = reconcile(&t, &small_profile(), Mode::Crop).unwrap();
        assert_eq!(out.shape(), &[6]);
        assert_eq!(out.to_f32_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let odd = seq(vec![7], Dtype::F32);
        assert_eq!(reconcile(&odd, &small_profile(), Mode::Crop).unwrap(), odd);
    }

    #[test]
    fn test_other_ranks_untouched() {
        let t = seq(vec![4, 4, 4], Dtype::F32);
        assert_eq!(reconcile(&t, &small_profile(), Mode::Crop).unwrap(), t);
        let s = Tensor::scalar_f32(1.0);
        assert_eq!(reconcile(&s, &small_profile(), Mode::Pad).unwrap(), s);
    }

    #[test]
    fn test_wan_square_crop() {
        // each element holds its own flat index, so positions are checkable
        let n = 5120;
        let data: Vec<u8> = (0..(n * n) as i32).flat_map(|i| i.to_le_bytes()).collect();
        let t = Tensor::new(Dtype::I32, vec![n, n], data).unwrap();
        let profile = ShapeProfile::new().with_dim("hidden", 1536, 5120);

        let out = reconcile(&t, &profile, Mode::Crop).unwrap();
        assert_eq!(out.shape(), &[1536, 1536]);
        assert_eq!(out.dtype(), Dtype::I32);
        let at = |r: usize, c: usize| {
            let i = (r * 1536 + c) * 4;
            let bytes: [u8; 4] = out.data()[i..i + 4].try_into().unwrap();
            i32::from_le_bytes(bytes)
        };
        for (r, c) in [(0, 0), (0, 1535), (1, 0), (777, 42), (1535, 1535)] {
            assert_eq!(at(r, c), (r * n + c) as i32);
        }
    }

    #[test]
    fn test_packed_dtypes_only_fail_when_resized() {
        let fp8 = Tensor::new(Dtype::F8_E8M0, vec![4], vec![1, 2, 3, 4]).unwrap();
        let out = reconcile(&fp8, &small_profile(), Mode::Crop).unwrap();
        assert_eq!(out.data(), &[1, 2]);

        let packed = Tensor::zeros(Dtype::F4, vec![4, 4]);
        let err = reconcile(&packed, &small_profile(), Mode::Crop).unwrap_err();
        assert!(matches!(err, ForgeError::UnsupportedDtype(_)));
        let untouched = Tensor::zeros(Dtype::F4, vec![5, 5]);
        assert_eq!(reconcile(&untouched, &small_profile(), Mode::Crop).unwrap(), untouched);
    }

    #[test]
    fn test_profile_dim_parse() {
        let d: ProfileDim = "hidden=1536:5120".parse().unwrap();
        assert_eq!(d, ProfileDim { name: "hidden".into(), old: 1536, new: 5120 });
        assert!("1536".parse::<ProfileDim>().is_err());
        assert!("x=0:4".parse::<ProfileDim>().is_err());
    }

    #[test]
    fn test_reconcile_dict_drops_high_blocks() {
        let mut dict = TensorDict::new();
        dict.insert("blocks.0.ffn.weight", seq(vec![4, 6], Dtype::F32));
        dict.insert("blocks.30.ffn.weight", seq(vec![4, 6], Dtype::F32));
        dict.insert("head.bias", seq(vec![5], Dtype::F32));

        let (out, report) = reconcile_dict(dict, &small_profile(), Mode::Crop, Some(30)).unwrap();
        assert_eq!(report, ReconcileReport { changed: 1, unchanged: 1, dropped: 1 });
        assert!(!out.contains_key("blocks.30.ffn.weight"));
        assert_eq!(out.get("blocks.0.ffn.weight").unwrap().shape(), &[2, 3]);
    }
}
