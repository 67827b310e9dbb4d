//! lora_forge - safetensors surgery for diffusion model checkpoints and LoRAs
//!
//! Rename keys through declarative rule sets, crop or pad tensors between
//! model sizes, merge and upgrade checkpoints, extract low-rank deltas with
//! SVD, and inspect or bundle LoRA files. Everything runs on the CPU.

pub mod error;
pub mod extract;
pub mod inspect;
pub mod merge;
pub mod reconcile;
pub mod rules;
pub mod stats;
pub mod store;
pub mod tensor;
pub mod unify;

pub use error::{ForgeError, Result};
pub use extract::{
    extract_dict, extract_lora, ExtractConfig, ExtractReport, LoraFactors, LoraNaming,
};
pub use inspect::{analyze, compare, KeyComparison, LoraAnalysis, LoraFormat};
pub use merge::{merge, upgrade, ConflictPolicy, MergeReport, UpgradeReport};
pub use reconcile::{reconcile, reconcile_dict, Mode, ProfileDim, ShapeProfile};
pub use rules::{convert_diffsynth, rename_dict, KeyMatcher, RuleSet, UnmatchedPolicy};
pub use stats::{CounterSnapshot, PhaseTimer, RunCounters};
pub use store::{LazyReader, TensorDict};
pub use tensor::{Precision, Tensor};
pub use unify::{inspect_unified, split, unify, NoiseLevel};
