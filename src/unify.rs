//! Pack the WAN 2.2 high-noise and low-noise experts into one file
//!
//! Tensors are namespaced under `high_noise.` / `low_noise.` without any
//! weight merging. Two JSON documents in the safetensors metadata block
//! describe the bundle and the recommended switch thresholds.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use tracing::info;

use crate::error::{ForgeError, Result};
use crate::store::TensorDict;

pub const UNIFIED_METADATA_KEY: &str = "__wan22_unified_metadata__";
pub const THRESHOLD_CONFIG_KEY: &str = "__wan22_threshold_config__";
const METADATA_PREFIX: &str = "__wan22_";
const FORMAT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseLevel {
    High,
    Low,
}

impl NoiseLevel {
    pub fn prefix(&self) -> &'static str {
        match self {
            NoiseLevel::High => "high_noise.",
            NoiseLevel::Low => "low_noise.",
        }
    }
}

impl FromStr for NoiseLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Self::High),
            "low" => Ok(Self::Low),
            _ => Err(format!("Unknown noise level: {s} (expected high or low)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedMetadata {
    pub version: String,
    pub created_at: String,
    pub high_noise_model: String,
    pub low_noise_model: String,
    pub default_threshold: f64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub default: f64,
    pub recommended: BTreeMap<String, f64>,
}

impl ThresholdConfig {
    pub fn with_default(default: f64) -> Self {
        let recommended = [
            ("general", 0.5),
            ("high_detail", 0.3),
            ("fast_generation", 0.7),
            ("artistic", 0.4),
            ("photorealistic", 0.6),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self { default, recommended }
    }
}

/// Combine both experts. `names` are the source file names recorded in
/// the metadata.
pub fn unify(
    high: TensorDict,
    low: TensorDict,
    names: (&str, &str),
    threshold: f64,
) -> Result<TensorDict> {
    let mut unified = TensorDict::new();
    for (level, dict) in [(NoiseLevel::High, high), (NoiseLevel::Low, low)] {
        for (key, tensor) in dict.into_sorted_entries() {
            unified.insert(format!("{}{}", level.prefix(), key), tensor);
        }
    }

    let metadata = UnifiedMetadata {
        version: FORMAT_VERSION.to_string(),
        created_at: Local::now().to_rfc3339(),
        high_noise_model: names.0.to_string(),
        low_noise_model: names.1.to_string(),
        default_threshold: threshold,
        description: "WAN 2.2 Unified Model - Contains both High and Low Noise models".to_string(),
    };
    unified.set_metadata(HashMap::from([
        (UNIFIED_METADATA_KEY.to_string(), serde_json::to_string(&metadata)?),
        (
            THRESHOLD_CONFIG_KEY.to_string(),
            serde_json::to_string(&ThresholdConfig::with_default(threshold))?,
        ),
    ]));

    info!(
        "🔗 Unified model: {} high noise keys, {} low noise keys, {} parameters",
        count_prefixed(&unified, NoiseLevel::High),
        count_prefixed(&unified, NoiseLevel::Low),
        unified.total_parameters()
    );
    Ok(unified)
}

fn count_prefixed(dict: &TensorDict, level: NoiseLevel) -> usize {
    dict.iter().filter(|(k, _)| k.starts_with(level.prefix())).count()
}

/// Pull one expert back out, with its prefix removed
pub fn split(unified: TensorDict, level: NoiseLevel) -> Result<TensorDict> {
    let extracted: TensorDict = unified
        .into_sorted_entries()
        .into_iter()
        .filter_map(|(key, tensor)| {
            key.strip_prefix(level.prefix())
                .map(|rest| (rest.to_string(), tensor))
        })
        .collect();

    if extracted.is_empty() {
        return Err(ForgeError::NothingToWrite(format!(
            "no {} tensors in unified file",
            level.prefix().trim_end_matches('.')
        )));
    }
    Ok(extracted)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnifiedSummary {
    pub high_noise_keys: usize,
    pub low_noise_keys: usize,
    pub metadata_keys: usize,
    pub total_keys: usize,
    pub metadata: Option<UnifiedMetadata>,
    pub thresholds: Option<ThresholdConfig>,
}

pub fn inspect_unified(dict: &TensorDict) -> Result<UnifiedSummary> {
    let metadata = dict
        .metadata()
        .get(UNIFIED_METADATA_KEY)
        .map(|s| serde_json::from_str::<UnifiedMetadata>(s))
        .transpose()?;
    let thresholds = dict
        .metadata()
        .get(THRESHOLD_CONFIG_KEY)
        .map(|s| serde_json::from_str::<ThresholdConfig>(s))
        .transpose()?;

    Ok(UnifiedSummary {
        high_noise_keys: count_prefixed(dict, NoiseLevel::High),
        low_noise_keys: count_prefixed(dict, NoiseLevel::Low),
        metadata_keys: dict
            .metadata()
            .keys()
            .filter(|k| k.starts_with(METADATA_PREFIX))
            .count(),
        total_keys: dict.len(),
        metadata,
        thresholds,
    })
}
