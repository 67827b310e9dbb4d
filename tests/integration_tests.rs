//! End-to-end tests: real safetensors files in a temp directory, driven
//! through the library the same way the CLI does

use lora_forge::extract::ExtractConfig;
use lora_forge::inspect::{self, analysis_path, LoraFormat};
use lora_forge::merge::{self, ConflictPolicy};
use lora_forge::reconcile::{reconcile_dict, Mode, ShapeProfile};
use lora_forge::rules::{self, RuleSet, DEFAULT_STRIP_PREFIXES};
use lora_forge::store::{read_metadata, LazyReader, TensorDict};
use lora_forge::tensor::{Precision, Tensor};
use lora_forge::unify::{self, NoiseLevel};
use lora_forge::{extract_dict, ForgeError};
use safetensors::Dtype;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn seq(shape: Vec<usize>, dtype: Dtype) -> Tensor {
    let n: usize = shape.iter().product();
    let values: Vec<f32> = (0..n).map(|i| i as f32 + 1.0).collect();
    Tensor::from_f32(shape, &values, dtype).unwrap()
}

fn write(dir: &TempDir, name: &str, dict: &TensorDict) -> PathBuf {
    let path = dir.path().join(name);
    dict.save(&path).unwrap();
    path
}

#[test]
fn test_convert_diffsynth_file() {
    let dir = TempDir::new().unwrap();
    let mut dict = TensorDict::new();
    dict.insert("blocks.0.cross_attn.k.lora_A.default.weight", seq(vec![4, 8], Dtype::BF16));
    dict.insert("blocks.0.cross_attn.k.lora_B.default.weight", seq(vec![8, 4], Dtype::BF16));
    dict.insert("text_encoder.proj.weight", seq(vec![2], Dtype::BF16));
    let input = write(&dir, "diffsynth.safetensors", &dict);

    let (out, report) = rules::convert_diffsynth(TensorDict::load(&input).unwrap(), 1.0).unwrap();
    let output = write(&dir, "comfy.safetensors", &out);
    let loaded = TensorDict::load(&output).unwrap();

    assert_eq!(report.converted, 2);
    assert_eq!(report.alphas_added, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(loaded.len(), 3);
    assert_eq!(
        loaded["diffusion_model.blocks.0.cross_attn.k.lora_A.weight"],
        dict["blocks.0.cross_attn.k.lora_A.default.weight"]
    );
    let alpha = &loaded["diffusion_model.blocks.0.cross_attn.k.alpha"];
    assert_eq!(alpha.dtype(), Dtype::F32);
    assert!(alpha.shape().is_empty());
    assert_eq!(alpha.to_f32_vec().unwrap(), vec![1.0]);
}

#[test]
fn test_convert_wrong_format_writes_nothing() {
    let mut dict = TensorDict::new();
    dict.insert("lora_unet_blocks_0.lora_down.weight", seq(vec![2, 2], Dtype::F32));
    let err = rules::convert_diffsynth(dict, 1.0).unwrap_err();
    assert!(matches!(err, ForgeError::NothingToWrite(_)));
}

#[test]
fn test_rename_with_rule_file() {
    let dir = TempDir::new().unwrap();
    let rules_path = dir.path().join("rules.json");
    fs::write(
        &rules_path,
        r#"{
            "rules": [
                { "when": { "regex": "^layers\\.(\\d+)\\." },
                  "then": [ { "regex_replace": {
                      "pattern": "^layers\\.(\\d+)\\.",
                      "to": "blocks.$1."
                  } } ] }
            ],
            "unmatched": "pass_through"
        }"#,
    )
    .unwrap();

    let mut dict = TensorDict::new();
    dict.insert("layers.7.attn.weight", seq(vec![2], Dtype::F32));
    dict.insert("head.weight", seq(vec![2], Dtype::F32));
    dict.metadata_mut().insert("format".to_string(), "pt".to_string());

    let matcher = RuleSet::from_file(&rules_path).unwrap().compile().unwrap();
    let (out, report) = rules::rename_dict(dict, &matcher).unwrap();
    let output = write(&dir, "renamed.safetensors", &out);

    let loaded = TensorDict::load(&output).unwrap();
    assert!(loaded.contains_key("blocks.7.attn.weight"));
    assert!(loaded.contains_key("head.weight"));
    assert_eq!(report.renamed, 1);
    assert_eq!(report.unchanged, 1);
    assert_eq!(read_metadata(&output).unwrap().get("format").map(String::as_str), Some("pt"));
}

#[test]
fn test_strip_prefix_keeps_microscaling_scales() {
    let dir = TempDir::new().unwrap();
    let scales = vec![127u8, 128, 126, 130];

    let mut dict = TensorDict::new();
    let scale = Tensor::new(Dtype::F8_E8M0, vec![4], scales.clone()).unwrap();
    dict.insert("diffusion_model.blocks.0.ffn.weight_scale", scale);
    dict.insert("diffusion_model.blocks.0.ffn.bias", seq(vec![4], Dtype::BF16));
    let input = write(&dir, "mx.safetensors", &dict);

    let matcher = RuleSet::strip_prefixes(&DEFAULT_STRIP_PREFIXES).compile().unwrap();
    let (out, report) = rules::rename_dict(TensorDict::load(&input).unwrap(), &matcher).unwrap();
    let output = write(&dir, "stripped.safetensors", &out);
    let loaded = TensorDict::load(&output).unwrap();

    assert_eq!(report.renamed, 2);
    let scale = &loaded["blocks.0.ffn.weight_scale"];
    assert_eq!(scale.dtype(), Dtype::F8_E8M0);
    assert_eq!(scale.shape(), &[4]);
    assert_eq!(scale.data(), scales.as_slice());
    assert_eq!(loaded["blocks.0.ffn.bias"], dict["diffusion_model.blocks.0.ffn.bias"]);
}

#[test]
fn test_add_prefix_file() {
    let dir = TempDir::new().unwrap();
    let mut dict = TensorDict::new();
    dict.insert("blocks.0.attn.weight", seq(vec![2, 2], Dtype::F16));
    let input = write(&dir, "bare.safetensors", &dict);

    let matcher = RuleSet::add_prefix("diffusion_model.").compile().unwrap();
    let (out, report) = rules::rename_dict(TensorDict::load(&input).unwrap(), &matcher).unwrap();
    let loaded = TensorDict::load(write(&dir, "prefixed.safetensors", &out)).unwrap();

    assert_eq!(report.renamed, 1);
    assert_eq!(loaded.sorted_keys(), vec!["diffusion_model.blocks.0.attn.weight"]);
    assert_eq!(LoraFormat::detect(loaded.sorted_keys()), LoraFormat::ComfyUi);
}

#[test]
fn test_crop_then_pad_files() {
    let dir = TempDir::new().unwrap();
    let profile = ShapeProfile::new().with_dim("hidden", 2, 4);

    let mut dict = TensorDict::new();
    dict.insert("blocks.0.attn.weight", seq(vec![4, 4], Dtype::F16));
    dict.insert("blocks.0.norm.weight", seq(vec![4], Dtype::F16));
    dict.insert("blocks.3.attn.weight", seq(vec![4, 4], Dtype::F16));
    dict.insert("head.bias", seq(vec![3], Dtype::F16));
    let input = write(&dir, "large.safetensors", &dict);

    let loaded = TensorDict::load(&input).unwrap();
    let (small, report) = reconcile_dict(loaded, &profile, Mode::Crop, Some(2)).unwrap();
    assert_eq!(report.changed, 2);
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.dropped, 1);
    let small_path = write(&dir, "small.safetensors", &small);

    let small = TensorDict::load(&small_path).unwrap();
    assert_eq!(small["blocks.0.attn.weight"].shape(), &[2, 2]);
    assert_eq!(small["blocks.0.attn.weight"].dtype(), Dtype::F16);
    assert_eq!(small["blocks.0.attn.weight"].to_f32_vec().unwrap(), vec![1.0, 2.0, 5.0, 6.0]);
    assert_eq!(small["blocks.0.norm.weight"].shape(), &[2]);
    assert!(!small.contains_key("blocks.3.attn.weight"));

    let (padded, _) = reconcile_dict(small, &profile, Mode::Pad, None).unwrap();
    let weight = &padded["blocks.0.attn.weight"];
    assert_eq!(weight.shape(), &[4, 4]);
    assert_eq!(
        weight.to_f32_vec().unwrap(),
        vec![1.0, 2.0, 0.0, 0.0, 5.0, 6.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
    );
    assert_eq!(padded["head.bias"], dict["head.bias"]);
}

#[test]
fn test_merge_files_keeps_primary_on_conflict() {
    let dir = TempDir::new().unwrap();
    let mut primary = TensorDict::new();
    primary.insert("shared.weight", seq(vec![2], Dtype::F32));
    let mut secondary = TensorDict::new();
    secondary.insert("shared.weight", seq(vec![3], Dtype::F32));
    secondary.insert("extra.weight", seq(vec![2, 2], Dtype::BF16));
    let p = write(&dir, "primary.safetensors", &primary);
    let s = write(&dir, "secondary.safetensors", &secondary);

    let (merged, report) = merge::merge(
        &TensorDict::load(&p).unwrap(),
        &TensorDict::load(&s).unwrap(),
        ConflictPolicy::KeepPrimary,
    );
    assert_eq!(report.added, 1);
    assert_eq!(report.conflict_kept, 1);
    assert_eq!(merged["shared.weight"].shape(), &[2]);
    assert_eq!(merged["extra.weight"], secondary["extra.weight"]);
}

#[test]
fn test_upgrade_streams_tuned_file() {
    let dir = TempDir::new().unwrap();
    let mut base = TensorDict::new();
    base.insert("w", Tensor::from_f32(vec![2], &[1.0, 2.0], Dtype::F32).unwrap());
    base.insert("bias", seq(vec![2], Dtype::BF16));
    base.insert("only_base", seq(vec![1], Dtype::F32));

    let mut tuned = TensorDict::new();
    tuned.insert("w", Tensor::from_f32(vec![2], &[3.0, 4.0], Dtype::BF16).unwrap());
    tuned.insert("bias", seq(vec![3], Dtype::BF16));
    tuned.insert("new_head", seq(vec![2], Dtype::BF16));
    tuned.metadata_mut().insert("version".to_string(), "2".to_string());
    let tuned_path = write(&dir, "tuned.safetensors", &tuned);

    let reader = LazyReader::open(&tuned_path).unwrap();
    let (out, report) = merge::upgrade(base, &reader).unwrap();

    assert_eq!(report.updated, 1);
    assert_eq!(report.replaced, 1);
    assert_eq!(report.added, 1);
    assert_eq!(report.kept, 1);
    assert_eq!(out["w"].dtype(), Dtype::F32);
    assert_eq!(out["w"].to_f32_vec().unwrap(), vec![3.0, 4.0]);
    assert_eq!(out["bias"].shape(), &[3]);
    assert!(out.contains_key("only_base"));
    assert_eq!(out.metadata().get("version").map(String::as_str), Some("2"));
}

#[test]
fn test_extract_lora_and_arch_patch() {
    let dir = TempDir::new().unwrap();
    let (rows, cols) = (8, 6);
    let base_values: Vec<f32> =
        (0..rows * cols).map(|i| ((i * 7 % 11) as f32 - 5.0) * 0.1).collect();
    let u: Vec<f32> = (0..rows).map(|i| i as f32 * 0.1 + 0.2).collect();
    let v: Vec<f32> = (0..cols).map(|j| 0.5 - j as f32 * 0.15).collect();
    let delta: Vec<f32> = (0..rows * cols).map(|i| u[i / cols] * v[i % cols]).collect();
    let tuned_values: Vec<f32> = base_values.iter().zip(&delta).map(|(b, d)| b + d).collect();

    let mut base = TensorDict::new();
    let base_qkv = Tensor::from_f32(vec![rows, cols], &base_values, Dtype::F32).unwrap();
    base.insert("blocks.0.attn.qkv.weight", base_qkv);
    base.insert("blocks.0.norm.weight", seq(vec![cols], Dtype::F32));
    let mut tuned = TensorDict::new();
    let tuned_qkv = Tensor::from_f32(vec![rows, cols], &tuned_values, Dtype::F32).unwrap();
    tuned.insert("blocks.0.attn.qkv.weight", tuned_qkv);
    tuned.insert("blocks.0.norm.weight", seq(vec![cols], Dtype::F32));
    tuned.insert("blocks.0.extra_proj.weight", seq(vec![2, 2], Dtype::F32));
    let base_path = write(&dir, "base.safetensors", &base);
    let tuned_path = write(&dir, "tuned.safetensors", &tuned);

    let config = ExtractConfig {
        rank: 4,
        precision: Precision::Fp32,
        ..ExtractConfig::default()
    };
    let output = extract_dict(
        &TensorDict::load(&base_path).unwrap(),
        &TensorDict::load(&tuned_path).unwrap(),
        &config,
    )
    .unwrap();

    assert_eq!(output.report.processed, 1);
    assert_eq!(output.report.extracted, 1);
    assert_eq!(output.report.arch_keys, 1);
    assert!(output.arch_patch.contains_key("blocks.0.extra_proj.weight"));

    let lora_path = write(&dir, "lora.safetensors", &output.lora);
    let lora = TensorDict::load(&lora_path).unwrap();
    let down = &lora["blocks.0.attn.qkv.lora_down.weight"];
    let up = &lora["blocks.0.attn.qkv.lora_up.weight"];
    assert_eq!(down.shape(), &[4, cols]);
    assert_eq!(up.shape(), &[rows, 4]);
    assert_eq!(lora["blocks.0.attn.qkv.alpha"].to_f32_vec().unwrap(), vec![4.0]);
    let metadata = read_metadata(&lora_path).unwrap();
    assert_eq!(metadata.get("ss_network_rank").map(String::as_str), Some("4"));

    let (down, up) = (down.to_f32_vec().unwrap(), up.to_f32_vec().unwrap());
    for i in 0..rows {
        for j in 0..cols {
            let product: f32 = (0..4).map(|k| up[i * 4 + k] * down[k * cols + j]).sum();
            assert!((product - delta[i * cols + j]).abs() < 1e-4, "mismatch at ({i}, {j})");
        }
    }
}

#[test]
fn test_unify_and_split_files() {
    let dir = TempDir::new().unwrap();
    let mut high = TensorDict::new();
    high.insert("blocks.0.ffn.0.weight", seq(vec![2, 2], Dtype::BF16));
    let mut low = TensorDict::new();
    low.insert("blocks.0.ffn.0.weight", seq(vec![2, 2], Dtype::F16));
    low.insert("head.weight", seq(vec![2], Dtype::F16));

    let names = ("high.safetensors", "low.safetensors");
    let unified = unify::unify(high.clone(), low.clone(), names, 0.4).unwrap();
    let unified_path = write(&dir, "unified.safetensors", &unified);

    let metadata = read_metadata(&unified_path).unwrap();
    assert!(metadata.contains_key(unify::UNIFIED_METADATA_KEY));
    assert!(metadata.contains_key(unify::THRESHOLD_CONFIG_KEY));

    let loaded = TensorDict::load(&unified_path).unwrap();
    let summary = unify::inspect_unified(&loaded).unwrap();
    assert_eq!(summary.high_noise_keys, 1);
    assert_eq!(summary.low_noise_keys, 2);
    assert_eq!(summary.metadata.unwrap().default_threshold, 0.4);

    let low_back = unify::split(loaded.clone(), NoiseLevel::Low).unwrap();
    let low_path = write(&dir, "low_back.safetensors", &low_back);
    assert_eq!(TensorDict::load(&low_path).unwrap(), low);
    assert_eq!(unify::split(loaded, NoiseLevel::High).unwrap(), high);
}

#[test]
fn test_inspect_export_json() {
    let dir = TempDir::new().unwrap();
    let mut dict = TensorDict::new();
    dict.insert("diffusion_model.blocks.2.self_attn.q.lora_A.weight", seq(vec![2, 4], Dtype::BF16));
    dict.insert("diffusion_model.blocks.2.self_attn.q.lora_B.weight", seq(vec![4, 2], Dtype::BF16));
    dict.insert("diffusion_model.blocks.2.self_attn.q.alpha", Tensor::scalar_f32(2.0));
    let input = write(&dir, "style.safetensors", &dict);

    let analysis = inspect::analyze(&TensorDict::load(&input).unwrap());
    assert_eq!(analysis.format, LoraFormat::ComfyUi);
    assert_eq!(analysis.block_numbers.get(&2), Some(&3));

    let json_path = analysis_path(&input);
    assert_eq!(json_path, dir.path().join("style_analysis.json"));
    inspect::export_json(&analysis, &json_path).unwrap();

    let json = fs::read_to_string(&json_path).unwrap();
    let exported: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(exported["total_keys"], 3);
    assert_eq!(exported["total_parameters"], 17);
    assert_eq!(exported["format"], "comfy_ui");
    assert_eq!(exported["layer_types"]["alpha"], 1);
    assert_eq!(exported["tensor_stats"]["processed"], 3);
}

#[test]
fn test_missing_input_file() {
    let err = TensorDict::load("/nonexistent/lora.safetensors").unwrap_err();
    assert!(matches!(err, ForgeError::InputNotFound(_)));
    assert!(matches!(
        LazyReader::open("/nonexistent/lora.safetensors"),
        Err(ForgeError::InputNotFound(_))
    ));
}
