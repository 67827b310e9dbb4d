//! Key renaming rules
//!
//! Renaming policy is data: an ordered [`RuleSet`] of `(predicate, actions)`
//! pairs plus an explicit [`UnmatchedPolicy`]. Rule sets deserialize from
//! JSON, e.g.
//!
//! ```json
//! {
//!   "rules": [
//!     { "when": { "suffix": ".lora_A.default.weight" },
//!       "then": [ { "replace": { "from": ".lora_A.default.weight", "to": ".lora_A.weight" } },
//!                 { "add_prefix": "diffusion_model." } ] }
//!   ],
//!   "unmatched": "drop"
//! }
//! ```
//!
//! [`RuleSet::compile`] turns the data into a [`KeyMatcher`]. The first rule
//! whose predicate matches fires; later rules are never consulted for that key.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::{ForgeError, Result};
use crate::store::TensorDict;
use crate::tensor::Tensor;

pub const DEFAULT_STRIP_PREFIXES: [&str; 2] = ["model.diffusion_model.", "diffusion_model."];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Suffix(String),
    Prefix(String),
    Contains(String),
    Regex(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Literal replacement of every occurrence
    Replace { from: String, to: String },
    /// Regex replacement, `$1` style captures allowed in `to`
    RegexReplace { pattern: String, to: String },
    StripPrefix(String),
    AddPrefix(String),
    AddSuffix(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub when: Predicate,
    #[serde(default)]
    pub then: Vec<Action>,
}

/// What happens to keys no rule matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedPolicy {
    Drop,
    PassThrough,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
    pub unmatched: UnmatchedPolicy,
}

impl RuleSet {
    pub fn new(unmatched: UnmatchedPolicy) -> Self {
        Self {
            rules: Vec::new(),
            unmatched,
        }
    }

    pub fn rule(mut self, when: Predicate, then: Vec<Action>) -> Self {
        self.rules.push(Rule { when, then });
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ForgeError::InputNotFound(path.to_path_buf()));
        }
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// DiffSynth LoRA keys to ComfyUI (WAN) keys.
    ///
    /// `blocks.4.cross_attn.k.lora_A.default.weight` becomes
    /// `diffusion_model.blocks.4.cross_attn.k.lora_A.weight`. The `lora_A`
    /// rule is tried before `lora_B`; anything else is dropped.
    pub fn diffsynth_to_comfyui() -> Self {
        Self::new(UnmatchedPolicy::Drop)
            .rule(
                Predicate::Suffix(".lora_A.default.weight".to_string()),
                vec![
                    Action::Replace {
                        from: ".lora_A.default.weight".to_string(),
                        to: ".lora_A.weight".to_string(),
                    },
                    Action::AddPrefix("diffusion_model.".to_string()),
                ],
            )
            .rule(
                Predicate::Suffix(".lora_B.default.weight".to_string()),
                vec![
                    Action::Replace {
                        from: ".lora_B.default.weight".to_string(),
                        to: ".lora_B.weight".to_string(),
                    },
                    Action::AddPrefix("diffusion_model.".to_string()),
                ],
            )
    }

    /// Strip the first listed prefix a key starts with; other keys pass through
    pub fn strip_prefixes<S: AsRef<str>>(prefixes: &[S]) -> Self {
        prefixes.iter().fold(Self::new(UnmatchedPolicy::PassThrough), |set, prefix| {
            let prefix = prefix.as_ref().to_string();
            set.rule(
                Predicate::Prefix(prefix.clone()),
                vec![Action::StripPrefix(prefix)],
            )
        })
    }

    /// Namespace every key under `prefix`
    pub fn add_prefix(prefix: &str) -> Self {
        Self::new(UnmatchedPolicy::PassThrough).rule(
            Predicate::Prefix(String::new()),
            vec![Action::AddPrefix(prefix.to_string())],
        )
    }

    pub fn compile(&self) -> Result<KeyMatcher> {
        let rules = self
            .rules
            .iter()
            .map(|rule| {
                let matcher = Matcher::compile(&rule.when)?;
                let ops = rule
                    .then
                    .iter()
                    .map(Op::compile)
                    .collect::<Result<Vec<_>>>()?;
                Ok((matcher, ops))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(KeyMatcher {
            rules,
            unmatched: self.unmatched,
        })
    }
}

fn compile_regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| ForgeError::InvalidRule(format!("{pattern}: {e}")))
}

#[derive(Debug)]
enum Matcher {
    Suffix(String),
    Prefix(String),
    Contains(String),
    Regex(Regex),
}

impl Matcher {
    fn compile(predicate: &Predicate) -> Result<Self> {
        Ok(match predicate {
            Predicate::Suffix(s) => Matcher::Suffix(s.clone()),
            Predicate::Prefix(s) => Matcher::Prefix(s.clone()),
            Predicate::Contains(s) => Matcher::Contains(s.clone()),
            Predicate::Regex(r) => Matcher::Regex(compile_regex(r)?),
        })
    }

    fn matches(&self, key: &str) -> bool {
        match self {
            Matcher::Suffix(s) => key.ends_with(s.as_str()),
            Matcher::Prefix(s) => key.starts_with(s.as_str()),
            Matcher::Contains(s) => key.contains(s.as_str()),
            Matcher::Regex(r) => r.is_match(key),
        }
    }
}

#[derive(Debug)]
enum Op {
    Replace(String, String),
    RegexReplace(Regex, String),
    StripPrefix(String),
    AddPrefix(String),
    AddSuffix(String),
}

impl Op {
    fn compile(action: &Action) -> Result<Self> {
        Ok(match action {
            Action::Replace { from, to } => {
                if from.is_empty() {
                    return Err(ForgeError::InvalidRule("replace with empty `from`".to_string()));
                }
                Op::Replace(from.clone(), to.clone())
            }
            Action::RegexReplace { pattern, to } => {
                Op::RegexReplace(compile_regex(pattern)?, to.clone())
            }
            Action::StripPrefix(p) => Op::StripPrefix(p.clone()),
            Action::AddPrefix(p) => Op::AddPrefix(p.clone()),
            Action::AddSuffix(s) => Op::AddSuffix(s.clone()),
        })
    }

    fn apply(&self, key: String) -> String {
        match self {
            Op::Replace(from, to) => key.replace(from.as_str(), to),
            Op::RegexReplace(re, to) => re.replace_all(&key, to.as_str()).into_owned(),
            Op::StripPrefix(p) => match key.strip_prefix(p.as_str()) {
                Some(rest) => rest.to_string(),
                None => key,
            },
            Op::AddPrefix(p) => format!("{p}{key}"),
            Op::AddSuffix(s) => format!("{key}{s}"),
        }
    }
}

/// Compiled, ready-to-run form of a [`RuleSet`]
#[derive(Debug)]
pub struct KeyMatcher {
    rules: Vec<(Matcher, Vec<Op>)>,
    unmatched: UnmatchedPolicy,
}

impl KeyMatcher {
    /// `None` means "drop this key"
    pub fn rename(&self, key: &str) -> Option<String> {
        match self.rules.iter().find(|(matcher, _)| matcher.matches(key)) {
            Some((_, ops)) => Some(ops.iter().fold(key.to_string(), |k, op| op.apply(k))),
            None => match self.unmatched {
                UnmatchedPolicy::Drop => None,
                UnmatchedPolicy::PassThrough => Some(key.to_string()),
            },
        }
    }

    pub fn unmatched(&self) -> UnmatchedPolicy {
        self.unmatched
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RenameReport {
    pub renamed: usize,
    pub unchanged: usize,
    pub dropped: usize,
}

/// Rename every key. Tensor bytes move across untouched; metadata is kept.
pub fn rename_dict(dict: TensorDict, matcher: &KeyMatcher) -> Result<(TensorDict, RenameReport)> {
    let metadata = dict.metadata().clone();
    let mut report = RenameReport::default();
    let mut out = TensorDict::new();
    out.set_metadata(metadata);

    for (key, tensor) in dict.into_sorted_entries() {
        match matcher.rename(&key) {
            Some(new_key) => {
                if out.contains_key(&new_key) {
                    return Err(ForgeError::KeyCollision { key: new_key });
                }
                if new_key == key {
                    report.unchanged += 1;
                } else {
                    debug!("{} -> {}", key, new_key);
                    report.renamed += 1;
                }
                out.insert(new_key, tensor);
            }
            None => {
                report.dropped += 1;
                if report.dropped <= 5 {
                    warn!("⚠️  Key not converted: {}", key);
                }
            }
        }
    }

    if report.dropped > 5 {
        warn!("⚠️  ... and {} more keys not converted", report.dropped - 5);
    }
    Ok((out, report))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConvertReport {
    pub converted: usize,
    pub alphas_added: usize,
    pub skipped: usize,
    pub total_keys: usize,
}

/// DiffSynth -> ComfyUI conversion, inserting a default `alpha` scalar next
/// to every `lora_A` entry that doesn't already carry one
pub fn convert_diffsynth(dict: TensorDict, alpha: f32) -> Result<(TensorDict, ConvertReport)> {
    let matcher = RuleSet::diffsynth_to_comfyui().compile()?;
    let (mut out, renamed) = rename_dict(dict, &matcher)?;

    let alpha_keys: Vec<String> = out
        .sorted_keys()
        .into_iter()
        .filter_map(|k| k.strip_suffix(".lora_A.weight").map(|stem| format!("{stem}.alpha")))
        .collect();

    let mut alphas_added = 0;
    for key in alpha_keys {
        if !out.contains_key(&key) {
            out.insert(key, Tensor::scalar_f32(alpha));
            alphas_added += 1;
        }
    }

    if out.is_empty() {
        return Err(ForgeError::NothingToWrite(
            "no keys were converted, check the input format".to_string(),
        ));
    }

    let report = ConvertReport {
        converted: renamed.renamed + renamed.unchanged,
        alphas_added,
        skipped: renamed.dropped,
        total_keys: out.len(),
    };
    info!(
        "📊 Converted {} keys, added {} alphas, skipped {}",
        report.converted, report.alphas_added, report.skipped
    );
    Ok((out, report))
}

/// Renamed-key lookup table, handy for dry runs
pub fn preview(keys: &[String], matcher: &KeyMatcher) -> HashMap<String, Option<String>> {
    keys.iter()
        .map(|k| (k.clone(), matcher.rename(k)))
        .collect()
}
