//! Merging tensor dictionaries

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::{LazyReader, TensorDict};

/// What to do when a key exists in both dictionaries with different shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    #[default]
    KeepPrimary,
    /// Only under an explicit "allow conflicts" request
    Overwrite,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub added: usize,
    pub skipped: usize,
    pub conflict_kept: usize,
    pub conflict_overwritten: usize,
}

/// Fill `primary` with whatever `secondary` has that it lacks.
///
/// Keys present in both with equal shapes always keep the primary value,
/// whatever the policy. Metadata from `secondary` only fills missing entries.
pub fn merge(
    primary: &TensorDict,
    secondary: &TensorDict,
    policy: ConflictPolicy,
) -> (TensorDict, MergeReport) {
    let mut merged = primary.clone();
    let mut report = MergeReport::default();

    for key in secondary.sorted_keys() {
        let Some(incoming) = secondary.get(key) else { continue };

        match merged.get(key) {
            None => {
                merged.insert(key.clone(), incoming.clone());
                report.added += 1;
            }
            Some(existing) if existing.shape() == incoming.shape() => {
                report.skipped += 1;
            }
            Some(existing) => match policy {
                ConflictPolicy::KeepPrimary => {
                    warn!(
                        "⛔ Shape mismatch, keeping original: {} {:?} vs {:?}",
                        key,
                        existing.shape(),
                        incoming.shape()
                    );
                    report.conflict_kept += 1;
                }
                ConflictPolicy::Overwrite => {
                    warn!("⚠️ Conflict on shape, replacing anyway: {}", key);
                    merged.insert(key.clone(), incoming.clone());
                    report.conflict_overwritten += 1;
                }
            },
        }
    }

    for (k, v) in secondary.metadata() {
        merged
            .metadata_mut()
            .entry(k.clone())
            .or_insert_with(|| v.clone());
    }

    info!(
        "✅ Merge: {} added, {} skipped (same shape), {} conflicts kept, {} conflicts overwritten",
        report.added, report.skipped, report.conflict_kept, report.conflict_overwritten
    );
    (merged, report)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpgradeReport {
    pub updated: usize,
    pub replaced: usize,
    pub added: usize,
    pub kept: usize,
}

/// Bring `base` up to date with a tuned checkpoint streamed from disk.
///
/// Common keys with equal shapes take the tuned values stored in the base
/// tensor's dtype. Common keys with different shapes, and keys only the
/// tuned file has, are copied verbatim. An equal-shape key whose dtype
/// can't be converted (integer or packed storage) is also taken verbatim
/// and counted as replaced. The tuned file's metadata wins.
pub fn upgrade(base: TensorDict, tuned: &LazyReader) -> Result<(TensorDict, UpgradeReport)> {
    let mut out = base;
    let mut report = UpgradeReport::default();
    let tuned_keys = tuned.keys()?;

    for key in &tuned_keys {
        let incoming = tuned.get(key)?;
        let next = match out.get(key) {
            Some(existing) if existing.shape() == incoming.shape() => {
                match incoming.cast(existing.dtype()) {
                    Ok(converted) => {
                        report.updated += 1;
                        converted
                    }
                    Err(e) => {
                        warn!(
                            "⚠️  {}: cannot store {:?} as {:?} ({}), taking tuned tensor as is",
                            key,
                            incoming.dtype(),
                            existing.dtype(),
                            e
                        );
                        report.replaced += 1;
                        incoming
                    }
                }
            }
            Some(existing) => {
                debug!(
                    "{}: shape {:?} -> {:?}, taking tuned tensor",
                    key,
                    existing.shape(),
                    incoming.shape()
                );
                report.replaced += 1;
                incoming
            }
            None => {
                report.added += 1;
                incoming
            }
        };
        out.insert(key.clone(), next);
    }
    report.kept = out.len() - tuned_keys.len();
    out.set_metadata(tuned.metadata().clone());

    info!(
        "✅ Upgrade: {} updated, {} replaced (shape or dtype change), {} added, {} kept from base",
        report.updated, report.replaced, report.added, report.kept
    );
    Ok((out, report))
}
