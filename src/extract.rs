//! Low-rank (LoRA) extraction of the difference between two checkpoints
//!
//! For each matching weight the difference `tuned - base` is taken in f32,
//! optionally sparsified by magnitude, and factored with a truncated SVD:
//!
//! ```text
//! diff ≈ up @ down,   up = U[:, :r] * S[:r],   down = Vh[:r, :]
//! ```
//!
//! Convolution kernels `(out, in, kh, kw)` are flattened to `(out, in*kh*kw)`
//! first, and the factors are reshaped back to `(r, in, kh, kw)` and
//! `(out, r, 1, 1)`. All arithmetic stays in f32; the storage [`Precision`]
//! is applied only when factors become tensors.

use nalgebra::DMatrix;
use ndarray::{Array2, ArrayD, IxDyn};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use tracing::{debug, error, info, warn};

use crate::error::{ForgeError, Result};
use crate::store::TensorDict;
use crate::tensor::{Precision, Tensor};

/// Weight suffixes targeted by default (Flux / DiT style blocks)
pub const DEFAULT_TARGET_MODULES: [&str; 13] = [
    ".attn.qkv.weight",
    ".attn.proj.weight",
    ".img_attn.qkv.weight",
    ".img_attn.proj.weight",
    ".txt_attn.qkv.weight",
    ".txt_attn.proj.weight",
    ".img_mod.lin.weight",
    ".txt_mod.lin.weight",
    ".modulation.lin.weight",
    "ffn.1.weight",
    "ffn.2.weight",
    "mlp.fc1.weight",
    "mlp.fc2.weight",
];

const SVD_MIN_ITERATIONS: usize = 10_000;

/// Truncated factorization of one weight difference
#[derive(Debug, Clone)]
pub struct LoraFactors {
    /// `(r, in)` or `(r, in, kh, kw)`
    pub down: ArrayD<f32>,
    /// `(out, r)` or `(out, r, 1, 1)`
    pub up: ArrayD<f32>,
    /// Effective rank, `min(rank, out, in)`
    pub rank: usize,
    /// Equal to the effective rank, so `alpha / rank == 1`
    pub alpha: f32,
}

impl LoraFactors {
    /// `up @ down` as a 2-D matrix (flattened kernel for 4-D weights)
    pub fn product(&self) -> Result<Array2<f32>> {
        let out_dim = self.up.shape()[0];
        let in_dim = self.down.len() / self.rank;
        let up = self.up.view().into_shape((out_dim, self.rank))?;
        let down = self.down.view().into_shape((self.rank, in_dim))?;
        Ok(up.dot(&down))
    }

    /// `(down, up)` encoded in the requested precision
    pub fn to_tensors(&self, precision: Precision) -> Result<(Tensor, Tensor)> {
        let dtype = precision.dtype();
        Ok((
            Tensor::from_array(&self.down, dtype)?,
            Tensor::from_array(&self.up, dtype)?,
        ))
    }
}

/// Zero every entry whose magnitude is below the `rate` percentile.
///
/// The threshold is the k-th smallest `|v|` with `k = floor(len * rate)`.
/// Surviving entries are not rescaled. Returns the number of zeroed entries.
pub fn prune_by_magnitude(values: &mut [f32], rate: f32) -> usize {
    let k = (values.len() as f64 * rate as f64).floor() as usize;
    if k == 0 {
        return 0;
    }
    let k = k.min(values.len());

    let mut magnitudes: Vec<f32> = values.iter().map(|v| v.abs()).collect();
    let (_, kth, _) = magnitudes.select_nth_unstable_by(k - 1, |a, b| a.total_cmp(b));
    let threshold = *kth;

    let mut zeroed = 0;
    for v in values.iter_mut() {
        if v.abs() < threshold {
            *v = 0.0;
            zeroed += 1;
        }
    }
    zeroed
}

/// Factor `tuned - base` into a rank-`rank` LoRA pair.
///
/// `Ok(None)` means the pair is not eligible: shapes differ, the tensor is
/// not 2-D or 4-D, it is empty, or `rank` is 0. A decomposition that fails
/// to converge is an error the caller is expected to log and skip.
pub fn extract_lora(
    base: &Tensor,
    tuned: &Tensor,
    rank: usize,
    prune_rate: f32,
) -> Result<Option<LoraFactors>> {
    if !(0.0..=1.0).contains(&prune_rate) {
        return Err(ForgeError::InvalidParameter(format!(
            "prune rate must be within [0, 1], got {prune_rate}"
        )));
    }
    if rank == 0
        || base.shape() != tuned.shape()
        || !matches!(base.ndim(), 2 | 4)
        || base.numel() == 0
    {
        return Ok(None);
    }

    let shape = base.shape().to_vec();
    let base_values = base.to_f32_vec()?;
    let mut diff: Vec<f32> = tuned
        .to_f32_vec()?
        .iter()
        .zip(&base_values)
        .map(|(t, b)| t - b)
        .collect();
    drop(base_values);

    if prune_rate > 0.0 {
        let zeroed = prune_by_magnitude(&mut diff, prune_rate);
        debug!("   pruned {}/{} entries", zeroed, diff.len());
    }

    let rows = shape[0];
    let cols = diff.len() / rows;
    let (up, down) = truncated_svd(&diff, rows, cols, rank)?;
    let r = up.ncols();

    let (up, down) = if shape.len() == 4 {
        (
            up.into_shape(IxDyn(&[rows, r, 1, 1]))?,
            down.into_shape(IxDyn(&[r, shape[1], shape[2], shape[3]]))?,
        )
    } else {
        (up.into_dyn(), down.into_dyn())
    };

    Ok(Some(LoraFactors {
        down,
        up,
        rank: r,
        alpha: r as f32,
    }))
}

/// `(U * S, Vh)` truncated to the leading `rank` singular triplets
fn truncated_svd(
    values: &[f32],
    rows: usize,
    cols: usize,
    rank: usize,
) -> Result<(Array2<f32>, Array2<f32>)> {
    let matrix = DMatrix::<f32>::from_row_slice(rows, cols, values);
    let max_niter = SVD_MIN_ITERATIONS.max(50 * rows.max(cols));
    let svd = matrix
        .try_svd(true, true, f32::EPSILON, max_niter)
        .ok_or_else(|| {
            ForgeError::Decomposition(format!("no convergence after {max_niter} iterations"))
        })?;

    let u = svd
        .u
        .ok_or_else(|| ForgeError::Decomposition("left singular vectors missing".to_string()))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| ForgeError::Decomposition("right singular vectors missing".to_string()))?;
    let s = svd.singular_values;

    let mut order: Vec<usize> = (0..s.len()).collect();
    order.sort_by(|&a, &b| s[b].total_cmp(&s[a]));
    order.truncate(rank.min(s.len()));
    let r = order.len();

    let up = Array2::from_shape_fn((rows, r), |(i, j)| u[(i, order[j])] * s[order[j]]);
    let down = Array2::from_shape_fn((r, cols), |(j, c)| v_t[(order[j], c)]);

    if up.iter().chain(down.iter()).any(|v| !v.is_finite()) {
        return Err(ForgeError::Decomposition("non-finite values in factors".to_string()));
    }
    Ok((up, down))
}

/// Output key scheme for extracted factors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoraNaming {
    /// `double_blocks.0.attn.proj.weight` -> `double_blocks.0.attn.proj.lora_down.weight`
    #[default]
    Stem,
    /// `double_blocks.0.attn.proj.weight` -> `lora_unet_double_blocks_0_attn_proj.lora_down.weight`
    KohyaUnet,
}

impl LoraNaming {
    pub fn prefix(&self, key: &str) -> String {
        match self {
            LoraNaming::Stem => key
                .rsplit_once('.')
                .map(|(stem, _)| stem)
                .unwrap_or(key)
                .to_string(),
            LoraNaming::KohyaUnet => {
                format!("lora_unet_{}", key.replace(".weight", "").replace('.', "_"))
            }
        }
    }
}

impl FromStr for LoraNaming {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stem" => Ok(Self::Stem),
            "kohya" | "kohya-unet" | "lora_unet" => Ok(Self::KohyaUnet),
            _ => Err(format!("Unknown naming scheme: {s} (expected stem or kohya)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractConfig {
    pub rank: usize,
    /// `None` uses each key's effective rank
    pub alpha: Option<f32>,
    pub prune_rate: f32,
    pub precision: Precision,
    /// Key suffixes to extract; empty means every common key
    pub targets: Vec<String>,
    pub naming: LoraNaming,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            rank: 128,
            alpha: None,
            prune_rate: 0.0,
            precision: Precision::Bf16,
            targets: DEFAULT_TARGET_MODULES.iter().map(|s| s.to_string()).collect(),
            naming: LoraNaming::Stem,
        }
    }
}

impl ExtractConfig {
    pub fn is_target(&self, key: &str) -> bool {
        self.targets.is_empty() || self.targets.iter().any(|t| key.ends_with(t.as_str()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractReport {
    pub processed: usize,
    pub extracted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub arch_keys: usize,
}

pub struct ExtractionOutput {
    pub lora: TensorDict,
    /// Layers only the tuned model has, stored in the requested precision
    pub arch_patch: TensorDict,
    pub report: ExtractReport,
}

/// `ss_network_*` entries. When every layer ended up with the same
/// effective rank that rank is recorded; mixed ranks record the requested
/// rank and the per-layer `alpha` tensors carry the real values.
fn network_metadata(config: &ExtractConfig, ranks: &BTreeSet<usize>) -> HashMap<String, String> {
    let rank = match (ranks.len(), ranks.first()) {
        (1, Some(r)) => *r,
        _ => config.rank,
    };
    let alpha = config
        .alpha
        .map(|a| a.to_string())
        .unwrap_or_else(|| rank.to_string());
    HashMap::from([
        ("ss_network_module".to_string(), "networks.lora".to_string()),
        ("ss_network_rank".to_string(), rank.to_string()),
        ("ss_network_alpha".to_string(), alpha),
    ])
}

/// Extract a LoRA for every targeted key both checkpoints share, plus an
/// architecture patch of the layers only `tuned` has
pub fn extract_dict(
    base: &TensorDict,
    tuned: &TensorDict,
    config: &ExtractConfig,
) -> Result<ExtractionOutput> {
    if !(0.0..=1.0).contains(&config.prune_rate) {
        return Err(ForgeError::InvalidParameter(format!(
            "prune rate must be within [0, 1], got {}",
            config.prune_rate
        )));
    }
    if config.rank == 0 {
        return Err(ForgeError::InvalidParameter("rank must be positive".to_string()));
    }

    let mut report = ExtractReport::default();
    let mut arch_patch = TensorDict::new();
    let mut lora = TensorDict::new();
    let mut ranks = BTreeSet::new();

    for key in tuned.sorted_keys() {
        if base.contains_key(key) {
            continue;
        }
        let tensor = &tuned[key.as_str()];
        let stored = if tensor.is_float() {
            tensor.cast(config.precision.dtype())?
        } else {
            tensor.clone()
        };
        arch_patch.insert(key.clone(), stored);
        report.arch_keys += 1;
    }
    if report.arch_keys > 0 {
        info!(
            "🧩 {} layers only in the tuned model go to the architecture patch",
            report.arch_keys
        );
    }

    for key in base.sorted_keys() {
        let Some(tuned_tensor) = tuned.get(key) else { continue };
        if !config.is_target(key) {
            continue;
        }
        report.processed += 1;
        let base_tensor = &base[key.as_str()];

        match extract_lora(base_tensor, tuned_tensor, config.rank, config.prune_rate) {
            Ok(Some(factors)) => {
                let prefix = config.naming.prefix(key);
                let (down, up) = factors.to_tensors(config.precision)?;
                let alpha = config.alpha.unwrap_or(factors.alpha);
                debug!("{} -> {} (rank {})", key, prefix, factors.rank);
                lora.insert(format!("{prefix}.lora_down.weight"), down);
                lora.insert(format!("{prefix}.lora_up.weight"), up);
                lora.insert(format!("{prefix}.alpha"), Tensor::scalar_f32(alpha));
                ranks.insert(factors.rank);
                report.extracted += 1;
            }
            Ok(None) => {
                debug!(
                    "{}: not eligible ({:?} vs {:?})",
                    key,
                    base_tensor.shape(),
                    tuned_tensor.shape()
                );
                report.skipped += 1;
            }
            Err(e) => {
                error!("🔥 SVD error on layer {}: {}. Skipping.", key, e);
                report.failed += 1;
            }
        }
    }

    lora.set_metadata(network_metadata(config, &ranks));

    if report.extracted == 0 {
        warn!("❌ No LoRA layers were created, check the target modules");
    } else {
        info!(
            "✅ {} layers processed: {} extracted, {} skipped, {} failed",
            report.processed, report.extracted, report.skipped, report.failed
        );
    }

    Ok(ExtractionOutput {
        lora,
        arch_patch,
        report,
    })
}
