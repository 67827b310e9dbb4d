//! Structure analysis and key comparison of tensor files

use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::Result;
use crate::stats::{CounterSnapshot, Outcome, RunCounters};
use crate::store::TensorDict;
use crate::tensor::{dtype_name, Tensor};

/// Key naming convention a LoRA file follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoraFormat {
    /// `diffusion_model.blocks.*`
    ComfyUi,
    /// `blocks.*` without the `diffusion_model` prefix
    DiffSynth,
    /// `lora_unet_*`
    Kohya,
    Unknown,
}

impl LoraFormat {
    pub fn detect<'a, I>(keys: I) -> Self
    where
        I: IntoIterator<Item = &'a String>,
        I::IntoIter: Clone,
    {
        let keys = keys.into_iter();
        if keys.clone().any(|k| k.contains("diffusion_model.blocks.")) {
            LoraFormat::ComfyUi
        } else if keys.clone().any(|k| k.starts_with("blocks.")) {
            LoraFormat::DiffSynth
        } else if keys.clone().any(|k| k.contains("lora_unet")) {
            LoraFormat::Kohya
        } else {
            LoraFormat::Unknown
        }
    }

    pub fn description(&self) -> &str {
        match self {
            LoraFormat::ComfyUi => "ComfyUI/WAN format (diffusion_model.blocks.*)",
            LoraFormat::DiffSynth => "DiffSynth format (blocks.* without diffusion_model prefix)",
            LoraFormat::Kohya => "Kohya/diffusers format (lora_unet_*)",
            LoraFormat::Unknown => "Unknown format",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TensorSummary {
    pub key: String,
    pub shape: Vec<usize>,
    pub dtype: String,
    pub params: usize,
    /// `None` for non-float dtypes
    pub abs_max: Option<f32>,
    pub mean_abs: Option<f32>,
}

impl fmt::Display for TensorSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}  {:?}  {}  {} params", self.key, self.shape, self.dtype, self.params)
    }
}

/// Keys listed by `inspect` unless a detailed listing is requested
pub const PREVIEW_KEYS: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct LoraAnalysis {
    pub total_keys: usize,
    pub total_parameters: usize,
    pub format: LoraFormat,
    pub key_patterns: BTreeMap<String, usize>,
    pub component_types: BTreeMap<String, usize>,
    pub layer_types: BTreeMap<String, usize>,
    pub block_numbers: BTreeMap<usize, usize>,
    pub tensors: Vec<TensorSummary>,
    /// processed = stats computed, skipped = non-float, failed = non-finite values
    pub tensor_stats: CounterSnapshot,
}

fn layer_type(key: &str) -> Option<&'static str> {
    ["lora_A", "lora_B", "alpha", "lora_down", "lora_up"]
        .into_iter()
        .find(|t| key.contains(t))
}

fn key_pattern(key: &str) -> &'static str {
    if key.contains("diffusion_model") {
        "diffusion_model.*"
    } else if key.contains("blocks.") {
        "blocks.*"
    } else {
        "other"
    }
}

fn summarize(key: &str, tensor: &Tensor, counters: &RunCounters) -> TensorSummary {
    let (abs_max, mean_abs) = match tensor.to_f32_vec() {
        Ok(values) if !values.is_empty() => {
            if values.iter().any(|v| !v.is_finite()) {
                counters.record(Outcome::Failed);
            } else {
                counters.record(Outcome::Processed);
            }
            let abs_max = values.iter().fold(0.0f32, |m, v| m.max(v.abs()));
            let mean_abs = values.iter().map(|v| v.abs() as f64).sum::<f64>() / values.len() as f64;
            (Some(abs_max), Some(mean_abs as f32))
        }
        Ok(_) => {
            counters.record(Outcome::Processed);
            (None, None)
        }
        Err(_) => {
            counters.record(Outcome::Skipped);
            (None, None)
        }
    };

    TensorSummary {
        key: key.to_string(),
        shape: tensor.shape().to_vec(),
        dtype: dtype_name(tensor.dtype()),
        params: tensor.numel(),
        abs_max,
        mean_abs,
    }
}

/// Key-structure statistics plus per-tensor magnitude summaries.
/// Summaries are computed in parallel; each tensor is read by one worker.
pub fn analyze(dict: &TensorDict) -> LoraAnalysis {
    let mut key_patterns = BTreeMap::new();
    let mut component_types = BTreeMap::new();
    let mut layer_types = BTreeMap::new();
    let mut block_numbers = BTreeMap::new();

    let keys = dict.sorted_keys();
    for key in &keys {
        let parts: Vec<&str> = key.split('.').collect();
        if parts.len() >= 4 && parts[0] == "diffusion_model" && parts[1] == "blocks" {
            if let Ok(block) = parts[2].parse::<usize>() {
                *block_numbers.entry(block).or_insert(0) += 1;
            }
            if parts.len() >= 5 {
                *component_types.entry(parts[3].to_string()).or_insert(0) += 1;
            }
        }
        if let Some(layer) = layer_type(key) {
            *layer_types.entry(layer.to_string()).or_insert(0) += 1;
        }
        *key_patterns.entry(key_pattern(key).to_string()).or_insert(0) += 1;
    }

    let counters = RunCounters::new();
    let tensors: Vec<TensorSummary> = keys
        .par_iter()
        .map(|key| summarize(key, &dict[key.as_str()], &counters))
        .collect();

    LoraAnalysis {
        total_keys: dict.len(),
        total_parameters: dict.total_parameters(),
        format: LoraFormat::detect(keys.iter().copied()),
        key_patterns,
        component_types,
        layer_types,
        block_numbers,
        tensors,
        tensor_stats: counters.snapshot(),
    }
}

/// `<dir>/<stem>_analysis.json` next to the analysed file
pub fn analysis_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string());
    input.with_file_name(format!("{stem}_analysis.json"))
}

pub fn export_json(analysis: &LoraAnalysis, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, serde_json::to_string_pretty(analysis)?)?;
    info!("💾 Analysis exported to {}", path.display());
    Ok(())
}

#[derive(Default)]
struct KeyNode<'a> {
    children: BTreeMap<&'a str, KeyNode<'a>>,
    leaf: Option<&'a TensorSummary>,
}

impl KeyNode<'_> {
    fn render(&self, depth: usize, lines: &mut Vec<String>) {
        let indent = "  ".repeat(depth);
        for (name, child) in &self.children {
            if let Some(leaf) = child.leaf {
                lines.push(format!("{indent}{name}  {:?}  {}", leaf.shape, leaf.dtype));
            }
            if !child.children.is_empty() {
                lines.push(format!("{indent}{name} ({})", child.children.len()));
                child.render(depth + 1, lines);
            }
        }
    }
}

/// Dot-separated keys folded into an indented hierarchy.
/// Branches carry their child count, leaves their shape and dtype.
pub fn render_tree(tensors: &[TensorSummary]) -> Vec<String> {
    let mut root = KeyNode::default();
    for summary in tensors {
        let mut node = &mut root;
        for part in summary.key.split('.') {
            node = node.children.entry(part).or_default();
        }
        node.leaf = Some(summary);
    }

    let mut lines = Vec::new();
    root.render(0, &mut lines);
    lines
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShapeDifference {
    pub key: String,
    pub left: Vec<usize>,
    pub right: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeyComparison {
    pub common: usize,
    pub only_in_a: Vec<String>,
    pub only_in_b: Vec<String>,
    pub shape_differences: Vec<ShapeDifference>,
}

/// Layer names and shapes of two dictionaries, side by side
pub fn compare(a: &TensorDict, b: &TensorDict) -> KeyComparison {
    let keys_a: BTreeSet<&String> = a.sorted_keys().into_iter().collect();
    let keys_b: BTreeSet<&String> = b.sorted_keys().into_iter().collect();

    let shape_differences = keys_a
        .intersection(&keys_b)
        .filter_map(|key| {
            let (left, right) = (a[key.as_str()].shape(), b[key.as_str()].shape());
            (left != right).then(|| ShapeDifference {
                key: key.to_string(),
                left: left.to_vec(),
                right: right.to_vec(),
            })
        })
        .collect();

    KeyComparison {
        common: keys_a.intersection(&keys_b).count(),
        only_in_a: keys_a.difference(&keys_b).map(|k| k.to_string()).collect(),
        only_in_b: keys_b.difference(&keys_a).map(|k| k.to_string()).collect(),
        shape_differences,
    }
}
