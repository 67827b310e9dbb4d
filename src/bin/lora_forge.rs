// lora_forge - command line front end
// Every subcommand reads safetensors files, applies one library operation and
// writes the result, printing a summary with counters at the end.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use lora_forge::extract::{ExtractConfig, LoraNaming, DEFAULT_TARGET_MODULES};
use lora_forge::inspect::{self, analysis_path, PREVIEW_KEYS};
use lora_forge::merge::{self, ConflictPolicy};
use lora_forge::reconcile::{reconcile_dict, Mode, ProfileDim, ShapeProfile};
use lora_forge::rules::{self, RuleSet, UnmatchedPolicy, DEFAULT_STRIP_PREFIXES};
use lora_forge::store::{LazyReader, TensorDict};
use lora_forge::tensor::Precision;
use lora_forge::unify::{self, NoiseLevel};
use lora_forge::PhaseTimer;

#[derive(Parser)]
#[command(
    name = "lora_forge",
    version,
    about = "Safetensors surgery for diffusion checkpoints and LoRAs"
)]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Convert a DiffSynth LoRA to ComfyUI key names, adding alpha scalars
    Convert {
        #[command(flatten)]
        io: InOut,
        /// Value of the alpha scalar inserted next to each lora_A
        #[arg(long, default_value_t = 1.0)]
        alpha: f32,
    },
    /// Remove leading key prefixes
    StripPrefix {
        #[command(flatten)]
        io: InOut,
        /// Prefix to strip (repeatable, first match wins)
        #[arg(long = "prefix")]
        prefixes: Vec<String>,
    },
    /// Prepend a namespace to every key
    AddPrefix {
        #[command(flatten)]
        io: InOut,
        /// e.g. `diffusion_model.`
        #[arg(long)]
        prefix: String,
    },
    /// Rename keys with a JSON rule file
    Rename {
        #[command(flatten)]
        io: InOut,
        #[arg(long)]
        rules: PathBuf,
        /// Override the rule file's policy for unmatched keys
        #[arg(long, value_enum)]
        unmatched: Option<Unmatched>,
        /// Print the renames without writing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Slice tensors from the larger model size down to the smaller one
    Crop(ReshapeArgs),
    /// Zero-pad tensors from the smaller model size up to the larger one
    Pad(ReshapeArgs),
    /// Add keys missing from the primary file out of a secondary file
    Merge {
        #[arg(long)]
        primary: PathBuf,
        #[arg(long)]
        secondary: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Let the secondary file overwrite keys whose shapes differ
        #[arg(long)]
        allow_conflicts: bool,
    },
    /// Update a base checkpoint with a tuned one, streaming the tuned file
    Upgrade {
        #[arg(long)]
        base: PathBuf,
        #[arg(long)]
        tuned: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Extract a LoRA from the difference of two checkpoints
    Extract(ExtractArgs),
    /// Analyse the key structure and tensor magnitudes of a file
    Inspect {
        input: PathBuf,
        /// Write `<stem>_analysis.json` next to the input
        #[arg(long)]
        export: bool,
        /// Explicit JSON output path (implies --export)
        #[arg(long)]
        export_path: Option<PathBuf>,
        /// List every key instead of the first few
        #[arg(long)]
        detailed: bool,
        /// Print keys as a dot-separated hierarchy
        #[arg(long)]
        tree: bool,
    },
    /// Compare layer names and shapes of two files
    Compare { a: PathBuf, b: PathBuf },
    /// Bundle WAN 2.2 high and low noise experts into one file
    Unify {
        #[arg(long)]
        high: PathBuf,
        #[arg(long)]
        low: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, default_value_t = 0.5)]
        threshold: f64,
    },
    /// Pull one expert back out of a unified file
    Split {
        #[command(flatten)]
        io: InOut,
        #[arg(long, value_enum)]
        level: Level,
    },
    /// Show what a unified file contains
    InspectUnified { input: PathBuf },
}

#[derive(Args)]
struct InOut {
    #[arg(short, long)]
    input: PathBuf,
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args)]
struct ReshapeArgs {
    #[command(flatten)]
    io: InOut,
    /// `name=old:new` size pair (repeatable); defaults to Wan 1.3B vs 14B
    #[arg(long = "dim")]
    dims: Vec<ProfileDim>,
    /// Drop keys under `blocks.N.` with N at or above this index
    #[arg(long)]
    max_blocks: Option<usize>,
}

#[derive(Args)]
struct ExtractArgs {
    #[arg(long)]
    base: PathBuf,
    #[arg(long)]
    tuned: PathBuf,
    #[arg(short, long)]
    output: PathBuf,
    /// Where to write layers only the tuned model has
    #[arg(long)]
    arch_output: Option<PathBuf>,
    #[arg(long, default_value_t = 128)]
    rank: usize,
    /// Fixed alpha; defaults to each layer's effective rank
    #[arg(long)]
    alpha: Option<f32>,
    /// Fraction of smallest-magnitude delta entries to zero before SVD
    #[arg(long, default_value_t = 0.0)]
    prune_rate: f32,
    /// fp32, fp16 or bf16
    #[arg(long, default_value = "bf16")]
    precision: Precision,
    /// Weight suffix to extract (repeatable); defaults to the DiT block layers
    #[arg(long = "target")]
    targets: Vec<String>,
    /// Extract every layer both checkpoints share
    #[arg(long, conflicts_with = "targets")]
    all_layers: bool,
    /// stem or kohya
    #[arg(long, default_value = "stem")]
    naming: LoraNaming,
}

#[derive(Clone, Copy, ValueEnum)]
enum Unmatched {
    Drop,
    Keep,
}

impl From<Unmatched> for UnmatchedPolicy {
    fn from(u: Unmatched) -> Self {
        match u {
            Unmatched::Drop => UnmatchedPolicy::Drop,
            Unmatched::Keep => UnmatchedPolicy::PassThrough,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Level {
    High,
    Low,
}

impl From<Level> for NoiseLevel {
    fn from(l: Level) -> Self {
        match l {
            Level::High => NoiseLevel::High,
            Level::Low => NoiseLevel::Low,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level))
        )
        .init();

    let mut timer = PhaseTimer::start();
    match cli.command {
        Command::Convert { io, alpha } => convert(&io, alpha)?,
        Command::StripPrefix { io, prefixes } => strip_prefix(&io, prefixes)?,
        Command::AddPrefix { io, prefix } => add_prefix(&io, &prefix)?,
        Command::Rename { io, rules, unmatched, dry_run } => {
            rename(&io, &rules, unmatched, dry_run)?
        }
        Command::Crop(args) => reshape(&args, Mode::Crop)?,
        Command::Pad(args) => reshape(&args, Mode::Pad)?,
        Command::Merge { primary, secondary, output, allow_conflicts } => {
            merge_files(&primary, &secondary, &output, allow_conflicts)?
        }
        Command::Upgrade { base, tuned, output } => upgrade_files(&base, &tuned, &output)?,
        Command::Extract(args) => extract(&args, &mut timer)?,
        Command::Inspect { input, export, export_path, detailed, tree } => {
            let listing = Listing { detailed, tree };
            inspect_file(&input, export, export_path, listing)?
        }
        Command::Compare { a, b } => compare_files(&a, &b)?,
        Command::Unify { high, low, output, threshold } => {
            unify_files(&high, &low, &output, threshold)?
        }
        Command::Split { io, level } => split_file(&io, level.into())?,
        Command::InspectUnified { input } => inspect_unified_file(&input)?,
    }
    for (phase, took) in timer.phases() {
        debug!("   {phase}: {} ms", took.as_millis());
    }
    info!("⏱  Done in {} ms", timer.total().as_millis());
    Ok(())
}

fn load(path: &Path) -> Result<TensorDict> {
    TensorDict::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

fn save(dict: &TensorDict, path: &Path) -> Result<()> {
    dict.save(path)
        .with_context(|| format!("Failed to save {}", path.display()))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn convert(io: &InOut, alpha: f32) -> Result<()> {
    let dict = load(&io.input)?;
    let (out, report) = rules::convert_diffsynth(dict, alpha).context("Conversion failed")?;
    save(&out, &io.output)?;

    println!("✅ Converted LoRA saved to {}", io.output.display());
    println!("   Converted keys: {}", report.converted);
    println!("   Alpha values added: {}", report.alphas_added);
    println!("   Skipped keys: {}", report.skipped);
    println!("   Total keys in output: {}", report.total_keys);
    Ok(())
}

fn strip_prefix(io: &InOut, prefixes: Vec<String>) -> Result<()> {
    let prefixes = if prefixes.is_empty() {
        DEFAULT_STRIP_PREFIXES.iter().map(|p| p.to_string()).collect()
    } else {
        prefixes
    };
    let matcher = RuleSet::strip_prefixes(&prefixes).compile()?;

    let dict = load(&io.input)?;
    let (out, report) = rules::rename_dict(dict, &matcher)?;
    save(&out, &io.output)?;

    println!("✅ Prefixes stripped: {} renamed, {} unchanged", report.renamed, report.unchanged);
    Ok(())
}

fn add_prefix(io: &InOut, prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        bail!("--prefix must not be empty");
    }
    let matcher = RuleSet::add_prefix(prefix).compile()?;

    let dict = load(&io.input)?;
    let (out, report) = rules::rename_dict(dict, &matcher)?;
    save(&out, &io.output)?;

    println!("✅ Prefixed {} keys with {prefix}", report.renamed);
    Ok(())
}

fn rename(
    io: &InOut,
    rules_path: &Path,
    unmatched: Option<Unmatched>,
    dry_run: bool,
) -> Result<()> {
    let mut rule_set = RuleSet::from_file(rules_path)
        .with_context(|| format!("Failed to read rules from {}", rules_path.display()))?;
    if let Some(policy) = unmatched {
        rule_set.unmatched = policy.into();
    }
    let matcher = rule_set.compile().context("Invalid rule set")?;

    if dry_run {
        let keys: Vec<String> = LazyReader::open(&io.input)?.keys()?;
        let renames = rules::preview(&keys, &matcher);
        for key in &keys {
            match renames.get(key).and_then(|r| r.as_deref()) {
                Some(new) if new == key => println!("  = {key}"),
                Some(new) => println!("  {key} -> {new}"),
                None => println!("  - {key} (dropped)"),
            }
        }
        return Ok(());
    }

    let dict = load(&io.input)?;
    let (out, report) = rules::rename_dict(dict, &matcher)?;
    if out.is_empty() {
        bail!("No keys survived renaming, refusing to write an empty file");
    }
    save(&out, &io.output)?;

    println!(
        "✅ Renamed {}, unchanged {}, dropped {}",
        report.renamed, report.unchanged, report.dropped
    );
    Ok(())
}

fn reshape(args: &ReshapeArgs, mode: Mode) -> Result<()> {
    let profile = if args.dims.is_empty() {
        ShapeProfile::wan_1_3b_to_14b()
    } else {
        ShapeProfile { dims: args.dims.clone() }
    };

    let dict = load(&args.io.input)?;
    let (out, report) = reconcile_dict(dict, &profile, mode, args.max_blocks)?;
    if out.is_empty() {
        bail!("Every key was dropped, nothing to write");
    }
    save(&out, &args.io.output)?;

    println!("✅ Saved to {}", args.io.output.display());
    println!("   Reshaped: {}", report.changed);
    println!("   Unchanged: {}", report.unchanged);
    println!("   Dropped: {}", report.dropped);
    Ok(())
}

fn merge_files(
    primary: &Path,
    secondary: &Path,
    output: &Path,
    allow_conflicts: bool,
) -> Result<()> {
    let policy = if allow_conflicts {
        ConflictPolicy::Overwrite
    } else {
        ConflictPolicy::KeepPrimary
    };
    let (merged, report) = merge::merge(&load(primary)?, &load(secondary)?, policy);
    save(&merged, output)?;

    println!("✅ Merged model saved to {}", output.display());
    println!("   Added: {}", report.added);
    println!("   Already present: {}", report.skipped);
    println!("   Shape conflicts kept: {}", report.conflict_kept);
    println!("   Shape conflicts overwritten: {}", report.conflict_overwritten);
    Ok(())
}

fn upgrade_files(base: &Path, tuned: &Path, output: &Path) -> Result<()> {
    let base_dict = load(base)?;
    let reader = LazyReader::open(tuned)
        .with_context(|| format!("Failed to open {}", tuned.display()))?;
    let (out, report) = merge::upgrade(base_dict, &reader)?;
    save(&out, output)?;

    println!("✅ Upgraded model saved to {}", output.display());
    println!("   Updated: {}", report.updated);
    println!("   Taken verbatim (new shape or dtype): {}", report.replaced);
    println!("   Added: {}", report.added);
    println!("   Kept from base: {}", report.kept);
    Ok(())
}

fn extract(args: &ExtractArgs, timer: &mut PhaseTimer) -> Result<()> {
    let targets = if args.all_layers {
        Vec::new()
    } else if args.targets.is_empty() {
        DEFAULT_TARGET_MODULES.iter().map(|t| t.to_string()).collect()
    } else {
        args.targets.clone()
    };
    let config = ExtractConfig {
        rank: args.rank,
        alpha: args.alpha,
        prune_rate: args.prune_rate,
        precision: args.precision,
        targets,
        naming: args.naming,
    };

    info!("🔍 Extracting rank {} LoRA ({})", config.rank, config.precision.as_str());
    let base = load(&args.base)?;
    let tuned = load(&args.tuned)?;
    timer.lap("load");
    let output = lora_forge::extract_dict(&base, &tuned, &config)?;
    drop(base);
    drop(tuned);
    timer.lap("decompose");

    if output.report.extracted == 0 {
        bail!("No LoRA layers were created, check --target or use --all-layers");
    }
    save(&output.lora, &args.output)?;

    match (&args.arch_output, output.arch_patch.is_empty()) {
        (Some(path), false) => save(&output.arch_patch, path)?,
        (None, false) => warn!(
            "⚠️  {} layers exist only in the tuned model; pass --arch-output to keep them",
            output.arch_patch.len()
        ),
        (_, true) => {}
    }
    timer.lap("save");

    let r = &output.report;
    println!("✅ LoRA saved to {}", args.output.display());
    println!("   Layers processed: {}", r.processed);
    println!("   Extracted: {}", r.extracted);
    println!("   Skipped: {}", r.skipped);
    println!("   Failed: {}", r.failed);
    println!("   Architecture patch layers: {}", r.arch_keys);
    Ok(())
}

#[derive(Clone, Copy)]
struct Listing {
    detailed: bool,
    tree: bool,
}

fn inspect_file(
    input: &Path,
    export: bool,
    export_path: Option<PathBuf>,
    listing: Listing,
) -> Result<()> {
    let dict = load(input)?;
    let analysis = inspect::analyze(&dict);

    println!("📊 {}", input.display());
    println!("   Format: {}", analysis.format.description());
    println!("   Total keys: {}", analysis.total_keys);
    println!("   Total parameters: {}", analysis.total_parameters);
    println!("   Key patterns:");
    for (pattern, count) in &analysis.key_patterns {
        println!("     {pattern}: {count}");
    }
    if !analysis.layer_types.is_empty() {
        println!("   Layer types:");
        for (layer, count) in &analysis.layer_types {
            println!("     {layer}: {count}");
        }
    }
    if !analysis.component_types.is_empty() {
        println!("   Components:");
        for (component, count) in &analysis.component_types {
            println!("     {component}: {count}");
        }
    }
    if let (Some((first, _)), Some((last, _))) =
        (analysis.block_numbers.first_key_value(), analysis.block_numbers.last_key_value())
    {
        println!("   Blocks: {} ({first}..={last})", analysis.block_numbers.len());
    }
    let s = analysis.tensor_stats;
    println!(
        "   Tensor stats: {} ok, {} non-float, {} non-finite",
        s.processed, s.skipped, s.failed
    );

    let shown = if listing.detailed {
        analysis.tensors.len()
    } else {
        PREVIEW_KEYS.min(analysis.tensors.len())
    };
    println!("   Keys:");
    for summary in &analysis.tensors[..shown] {
        println!("     {summary}");
    }
    if shown < analysis.tensors.len() {
        println!("     ... and {} more (--detailed)", analysis.tensors.len() - shown);
    }
    if listing.tree {
        println!("   Hierarchy:");
        for line in inspect::render_tree(&analysis.tensors) {
            println!("     {line}");
        }
    }

    if export || export_path.is_some() {
        let path = export_path.unwrap_or_else(|| analysis_path(input));
        inspect::export_json(&analysis, &path)?;
        println!("💾 Analysis written to {}", path.display());
    }
    Ok(())
}

fn compare_files(a: &Path, b: &Path) -> Result<()> {
    let cmp = inspect::compare(&load(a)?, &load(b)?);

    println!("🔎 Common keys: {}", cmp.common);
    println!("   Only in {}: {}", file_name(a), cmp.only_in_a.len());
    for key in &cmp.only_in_a {
        println!("     {key}");
    }
    println!("   Only in {}: {}", file_name(b), cmp.only_in_b.len());
    for key in &cmp.only_in_b {
        println!("     {key}");
    }
    println!("   Shape differences: {}", cmp.shape_differences.len());
    for diff in &cmp.shape_differences {
        println!("     {}: {:?} vs {:?}", diff.key, diff.left, diff.right);
    }
    Ok(())
}

fn unify_files(high: &Path, low: &Path, output: &Path, threshold: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&threshold) {
        bail!("Threshold must be within [0, 1], got {threshold}");
    }
    let (high_name, low_name) = (file_name(high), file_name(low));
    let unified = unify::unify(
        load(high)?,
        load(low)?,
        (high_name.as_str(), low_name.as_str()),
        threshold,
    )?;
    save(&unified, output)?;

    let summary = unify::inspect_unified(&unified)?;
    println!("✅ Unified model saved to {}", output.display());
    println!("   High noise keys: {}", summary.high_noise_keys);
    println!("   Low noise keys: {}", summary.low_noise_keys);
    println!("   Default threshold: {threshold}");
    Ok(())
}

fn split_file(io: &InOut, level: NoiseLevel) -> Result<()> {
    let extracted = unify::split(load(&io.input)?, level).context("Split failed")?;
    save(&extracted, &io.output)?;

    println!(
        "✅ {} model saved to {} ({} keys)",
        level.prefix().trim_end_matches('.'),
        io.output.display(),
        extracted.len()
    );
    Ok(())
}

fn inspect_unified_file(input: &Path) -> Result<()> {
    let summary = unify::inspect_unified(&load(input)?)?;

    println!("📊 {}", input.display());
    println!("   Total keys: {}", summary.total_keys);
    println!("   High noise keys: {}", summary.high_noise_keys);
    println!("   Low noise keys: {}", summary.low_noise_keys);
    println!("   Metadata keys: {}", summary.metadata_keys);
    match &summary.metadata {
        Some(meta) => {
            println!("   Version: {}", meta.version);
            println!("   Created: {}", meta.created_at);
            println!("   High noise model: {}", meta.high_noise_model);
            println!("   Low noise model: {}", meta.low_noise_model);
            println!("   Default threshold: {}", meta.default_threshold);
        }
        None => warn!("⚠️  No unified metadata found, this may not be a unified file"),
    }
    if let Some(thresholds) = &summary.thresholds {
        println!("   Recommended thresholds:");
        for (use_case, value) in &thresholds.recommended {
            println!("     {use_case}: {value}");
        }
    }
    Ok(())
}
