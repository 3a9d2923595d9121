//! Leveled catalog: [`Version`], [`VersionEdit`], and the commit path
//! ([`log_and_apply`]) that turns an edit into durable manifest state.
//!
//! A [`Version`] is an immutable snapshot of "which runs live at which
//! level" plus each level's compaction cursor. It never mutates in place —
//! compaction produces a [`VersionEdit`] describing the runs it added and
//! removed, which is committed through the manifest's existing WAL-backed
//! durability path and then materialized into a fresh `Version`.
//!
//! This module does not own a separate persistent log. [`ManifestSstEntry`]
//! already carries a `level` field, and [`Manifest::apply_compaction`] /
//! [`Manifest::set_compaction_pointer`] already append+apply through the
//! manifest's real WAL. `log_and_apply` is a thin, typed wrapper around
//! that existing commit path.

use std::path::PathBuf;
use std::sync::Arc;

use crate::manifest::{Manifest, ManifestError, ManifestSstEntry};
use crate::sstable::SSTable;

/// Number of levels in the catalog, L0..=L6.
pub const NUM_LEVELS: usize = 7;

/// Metadata describing one immutable run (SSTable) as known to the catalog.
///
/// Everything except `path`/`level`/`id` is read directly off the already-
/// opened [`SSTable`] handle — the catalog does not duplicate block-level
/// bookkeeping, only what compaction needs to plan overlaps.
#[derive(Debug, Clone)]
pub struct RunMeta {
    pub id: u64,
    pub level: u32,
    pub path: PathBuf,
    pub file_size: u64,
    /// `(user_key, sequence)` of the smallest internal key in the run.
    pub smallest: (Vec<u8>, u64),
    /// `(user_key, sequence)` of the largest internal key in the run.
    pub largest: (Vec<u8>, u64),
}

impl RunMeta {
    /// Builds a [`RunMeta`] from a manifest entry paired with its already
    /// opened run. Callers are responsible for matching `entry.id ==
    /// sstable.id` before calling this.
    pub fn from_sstable(entry: &ManifestSstEntry, sstable: &SSTable) -> Self {
        Self {
            id: entry.id,
            level: entry.level,
            path: entry.path.clone(),
            file_size: sstable.file_size(),
            smallest: sstable.smallest_internal(),
            largest: sstable.largest_internal(),
        }
    }

    /// Whether this run's key range `[smallest, largest]` overlaps the
    /// given user-key range, ignoring sequence numbers.
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        self.smallest.0.as_slice() <= end && start <= self.largest.0.as_slice()
    }
}

/// Immutable snapshot of the leveled catalog: which runs live at which
/// level, and each level's compaction round-robin cursor.
#[derive(Debug, Clone, Default)]
pub struct Version {
    /// `levels[0]` is L0 (unsorted, may overlap); `levels[L>=1]` are kept
    /// sorted by smallest key and are mutually non-overlapping by
    /// construction (leveled compaction's job is to preserve this).
    pub levels: Vec<Vec<Arc<RunMeta>>>,
    /// Per-level compaction cursor (largest key consumed last round).
    pub compaction_pointer: Vec<Option<Vec<u8>>>,
}

impl Version {
    /// Builds an empty version with [`NUM_LEVELS`] empty levels.
    pub fn empty() -> Self {
        Self {
            levels: vec![Vec::new(); NUM_LEVELS],
            compaction_pointer: vec![None; NUM_LEVELS],
        }
    }

    /// Total bytes resident at a level.
    pub fn level_bytes(&self, level: usize) -> u64 {
        self.levels
            .get(level)
            .map(|runs| runs.iter().map(|r| r.file_size).sum())
            .unwrap_or(0)
    }

    /// Runs at `level` whose key range overlaps `[start, end]`.
    pub fn overlapping_at_level(&self, level: usize, start: &[u8], end: &[u8]) -> Vec<Arc<RunMeta>> {
        self.levels
            .get(level)
            .map(|runs| {
                runs.iter()
                    .filter(|r| r.overlaps(start, end))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Checks the two invariants a leveled catalog must maintain: levels
    /// `>= 1` are sorted by smallest key, and runs within such a level do
    /// not overlap. L0 is exempt (flushes land there unsorted).
    pub fn check_invariants(&self) -> Result<(), String> {
        for (level, runs) in self.levels.iter().enumerate().skip(1) {
            for w in runs.windows(2) {
                if w[0].largest.0 >= w[1].smallest.0 {
                    return Err(format!(
                        "level {level} runs {} and {} overlap or are out of order",
                        w[0].id, w[1].id
                    ));
                }
            }
        }
        Ok(())
    }

    /// Applies an edit in place, producing the next version. Deletions are
    /// matched by `(level, id)`; additions are inserted at their level and
    /// the level is re-sorted by smallest key (a no-op for L0, which is
    /// never queried in sorted order).
    pub fn apply_edit(&self, edit: &VersionEdit) -> Version {
        let mut next = self.clone();
        for (level, id) in &edit.deleted_files {
            if let Some(runs) = next.levels.get_mut(*level as usize) {
                runs.retain(|r| r.id != *id);
            }
        }
        for run in &edit.added_files {
            let level = run.level as usize;
            if level >= next.levels.len() {
                next.levels.resize(level + 1, Vec::new());
            }
            next.levels[level].push(Arc::new(run.clone()));
            if level >= 1 {
                next.levels[level].sort_by(|a, b| a.smallest.0.cmp(&b.smallest.0));
            }
        }
        if let Some((level, ref key)) = edit.new_compaction_pointer {
            let level = level as usize;
            if level >= next.compaction_pointer.len() {
                next.compaction_pointer.resize(level + 1, None);
            }
            next.compaction_pointer[level] = Some(key.clone());
        }
        next
    }
}

/// Describes one atomic transition of the catalog: runs added, runs
/// removed, and (optionally) an updated per-level compaction cursor.
#[derive(Debug, Clone, Default)]
pub struct VersionEdit {
    pub added_files: Vec<RunMeta>,
    pub deleted_files: Vec<(u32, u64)>,
    pub new_compaction_pointer: Option<(u32, Vec<u8>)>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, run: RunMeta) {
        self.added_files.push(run);
    }

    pub fn delete_file(&mut self, level: u32, id: u64) {
        self.deleted_files.push((level, id));
    }
}

/// Builds a [`Version`] from the manifest's current durable state and a
/// set of already-opened runs, and commits [`VersionEdit`]s durably.
///
/// `VersionSet` holds no state of its own — every call re-derives or
/// re-commits against the manifest, which is the actual source of truth.
/// This mirrors how [`Manifest`] itself works: callers re-read through its
/// accessors rather than caching a private copy that could drift.
pub struct VersionSet;

impl VersionSet {
    /// Materializes the current [`Version`] by pairing each manifest SSTable
    /// entry with its opened run. Entries with no matching opened SSTable
    /// (e.g. a run deleted on disk but not yet compacted out of the
    /// manifest) are skipped rather than causing a hard failure — the next
    /// successful compaction will reconcile the catalog.
    pub fn materialize(manifest: &Manifest, sstables: &[SSTable]) -> Result<Version, ManifestError> {
        let entries = manifest.get_sstables()?;
        let mut version = Version::empty();

        for entry in &entries {
            let Some(sst) = sstables.iter().find(|s| s.id == entry.id) else {
                continue;
            };
            let level = entry.level as usize;
            if level >= version.levels.len() {
                version.levels.resize(level + 1, Vec::new());
            }
            version.levels[level].push(Arc::new(RunMeta::from_sstable(entry, sst)));
        }
        for runs in version.levels.iter_mut().skip(1) {
            runs.sort_by(|a, b| a.smallest.0.cmp(&b.smallest.0));
        }

        for level in 0..version.compaction_pointer.len() {
            version.compaction_pointer[level] = manifest.get_compaction_pointer(level as u32)?;
        }

        Ok(version)
    }

    /// Commits a [`VersionEdit`] through the manifest's real WAL-append +
    /// apply + checkpoint path. This is the only way a `Version` ever
    /// changes — there is no in-memory-only mutation.
    pub fn log_and_apply(manifest: &mut Manifest, edit: &VersionEdit) -> Result<(), ManifestError> {
        let added = edit
            .added_files
            .iter()
            .map(|r| ManifestSstEntry {
                id: r.id,
                path: r.path.clone(),
                level: r.level,
            })
            .collect();
        let removed = edit.deleted_files.iter().map(|(_, id)| *id).collect();

        manifest.apply_compaction(added, removed)?;

        if let Some((level, ref key)) = edit.new_compaction_pointer {
            manifest.set_compaction_pointer(level, Some(key.clone()))?;
        }

        manifest.checkpoint()?;
        Ok(())
    }
}
