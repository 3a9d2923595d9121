//! Classical leveled compaction (L → L+1 streaming merge).
//!
//! Picks an input level by the size-score priority from
//! [`crate::compaction::scheduler`], selects the overlapping input set in
//! `L` and `L+1`, merges it, and commits the result as a single
//! [`VersionEdit`]. A single-run, non-overlapping input is promoted via a
//! metadata-only trivial move instead of a rewrite.

use std::sync::Arc;

use crate::compaction::{dedup_records, full_range_scan_iters, CompactionError};
use crate::engine::EngineConfig;
use crate::manifest::version::{RunMeta, Version, VersionEdit, VersionSet, NUM_LEVELS};
use crate::manifest::Manifest;
use crate::sstable::{self, SSTable};

/// Bytes budget for level `L >= 1`: `max_bytes_base * level_size_multiplier^(L-1)`.
pub fn max_bytes_for_level(level: usize, config: &EngineConfig) -> u64 {
    if level == 0 {
        return u64::MAX;
    }
    let mut bytes = config.max_bytes_base as f64;
    for _ in 1..level {
        bytes *= config.level_size_multiplier;
    }
    bytes as u64
}

/// Picks the level most in need of compaction, scored the way
/// [`crate::compaction::scheduler`] describes: L0 by file count against
/// `l0_compaction_trigger`, L>=1 by bytes against [`max_bytes_for_level`].
/// Returns `None` if no level exceeds its threshold.
pub fn pick_level(version: &Version, config: &EngineConfig) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;

    let l0_score = version.levels.first().map(|r| r.len()).unwrap_or(0) as f64
        / config.l0_compaction_trigger as f64;
    if l0_score >= 1.0 {
        best = Some((0, l0_score));
    }

    for level in 1..version.levels.len().min(NUM_LEVELS) {
        let score = version.level_bytes(level) as f64 / max_bytes_for_level(level, config) as f64;
        if score >= 1.0 && best.as_ref().map(|(_, b)| score > *b).unwrap_or(true) {
            best = Some((level, score));
        }
    }

    best.map(|(level, _)| level)
}

/// The input/output set for one compaction round: runs consumed from `L`
/// and `L+1`, and the output level.
pub struct CompactionInputs {
    pub level: usize,
    pub from_level: Vec<Arc<RunMeta>>,
    pub from_next_level: Vec<Arc<RunMeta>>,
}

/// Selects the input set for compacting `level` into `level + 1`.
///
/// For L0, every L0 run participates (they may overlap each other) plus
/// any L1 run overlapping their combined range. For L>=1, one run is
/// picked starting at the level's compaction cursor (round-robin), then
/// the L set is expanded to the union of L+1-overlapping runs so the
/// output never re-splits an L+1 run across two compactions.
pub fn select_inputs(version: &Version, level: usize) -> CompactionInputs {
    if level == 0 {
        let from_level: Vec<Arc<RunMeta>> = version.levels[0].clone();
        let (start, end) = combined_range(&from_level);
        let from_next_level = version.overlapping_at_level(1, &start, &end);
        return CompactionInputs {
            level,
            from_level,
            from_next_level,
        };
    }

    let runs = &version.levels[level];
    if runs.is_empty() {
        return CompactionInputs {
            level,
            from_level: Vec::new(),
            from_next_level: Vec::new(),
        };
    }

    let cursor = version.compaction_pointer.get(level).cloned().flatten();
    let start_idx = match cursor {
        Some(ref key) => runs
            .iter()
            .position(|r| r.smallest.0.as_slice() > key.as_slice())
            .unwrap_or(0),
        None => 0,
    };
    let first = runs[start_idx].clone();

    let mut from_level = vec![first];
    loop {
        let (start, end) = combined_range(&from_level);
        let from_next_level = version.overlapping_at_level(level + 1, &start, &end);
        // Re-expand `from_level` to cover everything overlapping the L+1 set.
        let (nstart, nend) = combined_range(&from_next_level);
        let expanded: Vec<Arc<RunMeta>> = if from_next_level.is_empty() {
            from_level.clone()
        } else {
            version.overlapping_at_level(level, &nstart, &nend)
        };
        if expanded.len() == from_level.len() {
            return CompactionInputs {
                level,
                from_level,
                from_next_level,
            };
        }
        from_level = expanded;
    }
}

fn combined_range(runs: &[Arc<RunMeta>]) -> (Vec<u8>, Vec<u8>) {
    let start = runs
        .iter()
        .map(|r| r.smallest.0.clone())
        .min()
        .unwrap_or_default();
    let end = runs
        .iter()
        .map(|r| r.largest.0.clone())
        .max()
        .unwrap_or_default();
    (start, end)
}

/// Whether this input set qualifies for a metadata-only trivial move:
/// exactly one input run at `level`, zero overlap in `level + 1`, and the
/// run's overlap with grandparent (`level + 2`) runs stays within
/// `grandparent_overlap_cap * max_file_size`.
pub fn is_trivial_move(version: &Version, inputs: &CompactionInputs, config: &EngineConfig) -> bool {
    if inputs.from_level.len() != 1 || !inputs.from_next_level.is_empty() {
        return false;
    }
    let run = &inputs.from_level[0];
    let grandparent_bytes: u64 = version
        .overlapping_at_level(inputs.level + 2, &run.smallest.0, &run.largest.0)
        .iter()
        .map(|r| r.file_size)
        .sum();
    grandparent_bytes <= config.grandparent_overlap_cap * config.max_file_size
}

/// Executes one classical compaction round for `level`, committing the
/// result durably via [`VersionSet::log_and_apply`]. Returns `Ok(None)`
/// when `level` has nothing eligible to compact.
pub fn compact_level(
    version: &Version,
    level: usize,
    sstables: &[SSTable],
    manifest: &mut Manifest,
    data_dir: &str,
    config: &EngineConfig,
) -> Result<Option<Version>, CompactionError> {
    let inputs = select_inputs(version, level);
    if inputs.from_level.is_empty() {
        return Ok(None);
    }

    let mut edit = VersionEdit::new();
    for run in &inputs.from_level {
        edit.delete_file(level as u32, run.id);
    }
    for run in &inputs.from_next_level {
        edit.delete_file((level + 1) as u32, run.id);
    }

    if is_trivial_move(version, &inputs, config) {
        let run = &inputs.from_level[0];
        edit.add_file(RunMeta {
            id: run.id,
            level: (level + 1) as u32,
            path: run.path.clone(),
            file_size: run.file_size,
            smallest: run.smallest.clone(),
            largest: run.largest.clone(),
        });
    } else {
        let all_ids: Vec<u64> = inputs
            .from_level
            .iter()
            .chain(inputs.from_next_level.iter())
            .map(|r| r.id)
            .collect();
        let selected: Vec<&SSTable> = sstables
            .iter()
            .filter(|s| all_ids.contains(&s.id))
            .collect();
        let merged = full_range_scan_iters(&selected)?;
        let merge_iter = crate::compaction::MergeIterator::new(merged);
        let (point_entries, range_tombstones) = dedup_records(merge_iter);

        if !point_entries.is_empty() || !range_tombstones.is_empty() {
            let new_sst_id = manifest.allocate_sst_id()?;
            let new_sst_path = format!(
                "{}/{}/{:06}.sst",
                data_dir,
                crate::engine::SSTABLE_DIR,
                new_sst_id
            );
            let point_count = point_entries.len();
            let range_count = range_tombstones.len();
            sstable::SstWriter::new(&new_sst_path).build(
                point_entries.into_iter(),
                point_count,
                range_tombstones.into_iter(),
                range_count,
            )?;
            let new_sst = SSTable::open(&new_sst_path)?;
            edit.add_file(RunMeta {
                id: new_sst_id,
                level: (level + 1) as u32,
                path: new_sst_path.into(),
                file_size: new_sst.file_size(),
                smallest: new_sst.smallest_internal(),
                largest: new_sst.largest_internal(),
            });
        }
    }

    if let Some(last) = inputs.from_level.last() {
        edit.new_compaction_pointer = Some((level as u32, last.largest.0.clone()));
    }

    VersionSet::log_and_apply(manifest, &edit)?;
    remove_files(data_dir, &edit.deleted_files);

    Ok(Some(version.apply_edit(&edit)))
}

fn remove_files(data_dir: &str, deleted: &[(u32, u64)]) {
    for (_, id) in deleted {
        let path = format!("{}/{}/{:06}.sst", data_dir, crate::engine::SSTABLE_DIR, id);
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(id, %e, "failed to remove old SSTable file during leveled compaction");
        }
    }
}
