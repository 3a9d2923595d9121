//! Partner/split compaction: partitions one `L -> L+1` job into disjoint
//! key-range shards executed in parallel by a fixed worker pool, committed
//! as a single atomic [`VersionEdit`].
//!
//! A shard is `[lo, hi)` in user-key space. Its inputs are the `L` runs
//! restricted to that range plus the `L+1` runs fully contained in it. Any
//! `L+1` run straddling a split point is left untouched and carved out of
//! its neighboring shards, so committed shard outputs never overlap and
//! the post-commit level stays key-disjoint. Shard boundaries are chosen
//! by weighted-byte bisection over the `L+1` input run sizes.

use std::sync::Arc;

use crate::compaction::leveled::{self, CompactionInputs};
use crate::compaction::{dedup_records, CompactionError};
use crate::engine::EngineConfig;
use crate::manifest::version::{RunMeta, Version, VersionEdit, VersionSet};
use crate::manifest::Manifest;
use crate::sstable::{self, SSTable};

/// Default size of the fixed worker pool dedicated to split-compaction shards.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 4;

/// One shard's input set: `L` runs restricted to `[lo, hi)`, `L+1` runs
/// fully contained in it.
struct Shard {
    lo: Vec<u8>,
    hi: Vec<u8>,
    from_level: Vec<Arc<RunMeta>>,
    from_next_level: Vec<Arc<RunMeta>>,
}

/// Splits `inputs.from_next_level` into up to `max_shards` contiguous,
/// roughly equal-byte-weight ranges by bisecting on cumulative file size.
/// Runs whose key range would straddle a chosen boundary are excluded from
/// every shard's `from_next_level` (carved out, matching the straddler
/// rule) but still bound the shard ranges via their own extent.
fn plan_shards(inputs: &CompactionInputs, max_shards: usize) -> Vec<Shard> {
    let mut next = inputs.from_next_level.clone();
    next.sort_by(|a, b| a.smallest.0.cmp(&b.smallest.0));

    if next.is_empty() || max_shards < 2 {
        return Vec::new();
    }

    let total_bytes: u64 = next.iter().map(|r| r.file_size).sum();
    let target_shards = max_shards.min(next.len());
    if target_shards < 2 {
        return Vec::new();
    }
    let target_bytes_per_shard = (total_bytes / target_shards as u64).max(1);

    let mut shards: Vec<Vec<Arc<RunMeta>>> = Vec::new();
    let mut current: Vec<Arc<RunMeta>> = Vec::new();
    let mut current_bytes: u64 = 0;

    for run in next {
        current_bytes += run.file_size;
        current.push(run);
        if current_bytes >= target_bytes_per_shard && shards.len() + 1 < target_shards {
            shards.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
    }
    if !current.is_empty() {
        shards.push(current);
    }

    if shards.len() < 2 {
        return Vec::new();
    }

    shards
        .into_iter()
        .map(|runs| {
            let lo = runs
                .iter()
                .map(|r| r.smallest.0.clone())
                .min()
                .unwrap_or_default();
            let hi = runs
                .iter()
                .map(|r| r.largest.0.clone())
                .max()
                .unwrap_or_default();
            let from_level: Vec<Arc<RunMeta>> = inputs
                .from_level
                .iter()
                .filter(|r| r.overlaps(&lo, &hi))
                .cloned()
                .collect();
            Shard {
                lo,
                hi,
                from_level,
                from_next_level: runs,
            }
        })
        .collect()
}

/// Whether `inputs` qualifies for split compaction: `level >= 1` (L0 is
/// not key-disjoint, so it cannot be sharded), combined input size at or
/// above `split_compaction_min_size`, and at least two non-straddling
/// shards can be formed.
pub fn should_split(
    level: usize,
    inputs: &CompactionInputs,
    config: &EngineConfig,
) -> Option<Vec<Shard>> {
    if level == 0 {
        return None;
    }
    let total_bytes: u64 = inputs
        .from_level
        .iter()
        .chain(inputs.from_next_level.iter())
        .map(|r| r.file_size)
        .sum();
    if total_bytes < config.split_compaction_min_size {
        return None;
    }
    let shards = plan_shards(inputs, DEFAULT_WORKER_POOL_SIZE);
    if shards.len() < config.split_compaction_min_shards {
        return None;
    }
    Some(shards)
}

/// Merges one shard's inputs into zero or more output runs at `level + 1`,
/// clipped to `[shard.lo, shard.hi]` inclusive of the largest key. Returns
/// the shard's own [`VersionEdit`] fragment — additions and deletions
/// confined to this shard's inputs/outputs only.
fn compact_shard(
    shard: &Shard,
    level: usize,
    sstables: &[SSTable],
    manifest: &Manifest,
    data_dir: &str,
) -> Result<VersionEdit, CompactionError> {
    let mut edit = VersionEdit::new();

    let ids: Vec<u64> = shard
        .from_level
        .iter()
        .chain(shard.from_next_level.iter())
        .map(|r| r.id)
        .collect();
    let selected: Vec<&SSTable> = sstables.iter().filter(|s| ids.contains(&s.id)).collect();

    let mut hi_exclusive = shard.hi.clone();
    hi_exclusive.push(0xFF);

    let mut iters: Vec<Box<dyn Iterator<Item = crate::engine::Record> + '_>> = Vec::new();
    for sst in &selected {
        iters.push(Box::new(sst.scan(&shard.lo, &hi_exclusive)?));
    }
    let merge_iter = crate::compaction::MergeIterator::new(iters);
    let (point_entries, range_tombstones) = dedup_records(merge_iter);

    for run in &shard.from_level {
        edit.delete_file(level as u32, run.id);
    }
    for run in &shard.from_next_level {
        edit.delete_file((level + 1) as u32, run.id);
    }

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

    Ok(edit)
}

/// Executes a split compaction for `level`, falling back to a single
/// classical [`leveled::compact_level`] round when the inputs don't
/// qualify for sharding (see [`should_split`]) or when any shard fails —
/// per-shard failure discards every succeeded shard's output rather than
/// leaving a partial result visible.
pub fn compact_level_split(
    version: &Version,
    level: usize,
    sstables: &[SSTable],
    manifest: &mut Manifest,
    data_dir: &str,
    config: &EngineConfig,
) -> Result<Option<Version>, CompactionError> {
    let inputs = leveled::select_inputs(version, level);
    if inputs.from_level.is_empty() {
        return Ok(None);
    }

    let shards = match should_split(level, &inputs, config) {
        Some(shards) => shards,
        None => return leveled::compact_level(version, level, sstables, manifest, data_dir, config),
    };

    let manifest_ref: &Manifest = manifest;
    let shard_results: Vec<Result<VersionEdit, CompactionError>> = crossbeam::thread::scope(|scope| {
        let handles: Vec<_> = shards
            .iter()
            .map(|shard| {
                scope.spawn(move |_| compact_shard(shard, level, sstables, manifest_ref, data_dir))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| {
                Err(CompactionError::Io(std::io::Error::other(
                    "split-compaction shard thread panicked",
                )))
            }))
            .collect()
    })
    .unwrap_or_else(|_| {
        vec![Err(CompactionError::Io(std::io::Error::other(
            "split-compaction scope panicked",
        )))]
    });

    let mut edits = Vec::with_capacity(shard_results.len());
    let mut failed = false;
    for result in shard_results {
        match result {
            Ok(edit) => edits.push(edit),
            Err(_) => {
                failed = true;
            }
        }
    }

    if failed {
        for edit in &edits {
            for run in &edit.added_files {
                let path = format!(
                    "{}/{}/{:06}.sst",
                    data_dir,
                    crate::engine::SSTABLE_DIR,
                    run.id
                );
                let _ = std::fs::remove_file(&path);
            }
        }
        tracing::warn!(level, "split compaction shard failed, retrying classically");
        return leveled::compact_level(version, level, sstables, manifest, data_dir, config);
    }

    let mut combined = VersionEdit::new();
    for edit in edits {
        combined.added_files.extend(edit.added_files);
        combined.deleted_files.extend(edit.deleted_files);
    }
    if let Some(last) = inputs.from_level.last() {
        combined.new_compaction_pointer = Some((level as u32, last.largest.0.clone()));
    }

    VersionSet::log_and_apply(manifest, &combined)?;
    for (lvl, id) in &combined.deleted_files {
        let path = format!(
            "{}/{}/{:06}.sst",
            data_dir,
            crate::engine::SSTABLE_DIR,
            id
        );
        let _ = lvl;
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(id, %e, "failed to remove old SSTable file during split compaction");
        }
    }

    Ok(Some(version.apply_edit(&combined)))
}
