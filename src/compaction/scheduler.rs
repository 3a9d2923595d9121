//! Compaction scheduling: decides *what* to compact next.
//!
//! Priority order, matching a conventional leveled compactor: a pending
//! flush beats a user's manual range request, which beats size-driven
//! leveled compaction, which beats seek-driven compaction. Only one
//! piece of work is returned per call — the caller drives the actual
//! merge via [`crate::compaction::leveled`] or [`crate::compaction::split`].

use crate::engine::EngineConfig;
use crate::manifest::version::{Version, NUM_LEVELS};

/// One unit of compaction work chosen by [`pick_job`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// A level scored above its budget; see [`crate::compaction::leveled::pick_level`].
    SizeDriven { level: usize },
    /// A run was seek-charged past `seek_compaction_threshold`.
    SeekDriven { level: usize, run_id: u64 },
}

/// A user-requested range compaction, honored ahead of size/seek-driven work.
#[derive(Debug, Clone)]
pub struct ManualRequest {
    pub level: usize,
    pub begin: Option<Vec<u8>>,
    pub end: Option<Vec<u8>>,
}

/// Per-run seek-miss counters, indexed the same way `Version::levels` is.
/// A "seek miss" is a read that had to fall through this run to find (or
/// fail to find) its answer in a lower level — see
/// [`crate::engine::EngineConfig::seek_compaction_threshold`].
#[derive(Debug, Clone, Default)]
pub struct SeekStats {
    pub charges: Vec<Vec<(u64, u64)>>,
}

impl SeekStats {
    pub fn new() -> Self {
        Self {
            charges: vec![Vec::new(); NUM_LEVELS],
        }
    }

    /// Records one seek-miss against `run_id` at `level`.
    pub fn charge(&mut self, level: usize, run_id: u64) {
        if level >= self.charges.len() {
            self.charges.resize(level + 1, Vec::new());
        }
        let entry = self.charges[level].iter_mut().find(|(id, _)| *id == run_id);
        match entry {
            Some((_, count)) => *count += 1,
            None => self.charges[level].push((run_id, 1)),
        }
    }

    fn most_charged(&self, threshold: u64) -> Option<(usize, u64)> {
        self.charges
            .iter()
            .enumerate()
            .flat_map(|(level, runs)| runs.iter().map(move |(id, count)| (level, *id, *count)))
            .filter(|(_, _, count)| *count >= threshold)
            .max_by_key(|(_, _, count)| *count)
            .map(|(level, id, _)| (level, id))
    }
}

/// Picks the next compaction job in priority order. Flush (minor
/// compaction of the active/frozen memtable) is handled directly by
/// [`crate::engine::Engine`] before this is ever consulted — by the time
/// a [`Version`] exists to scan, there is no pending memtable flush left
/// to prioritize over it.
pub fn pick_job(
    version: &Version,
    config: &EngineConfig,
    manual: Option<&ManualRequest>,
    seeks: &SeekStats,
) -> Option<Job> {
    if let Some(req) = manual {
        return Some(Job::SizeDriven { level: req.level });
    }

    if let Some(level) = crate::compaction::leveled::pick_level(version, config) {
        return Some(Job::SizeDriven { level });
    }

    seeks
        .most_charged(config.seek_compaction_threshold)
        .map(|(level, run_id)| Job::SeekDriven { level, run_id })
}
