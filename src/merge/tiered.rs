//! Size-tiered merge policy.
//!
//! Segments are sorted by size and grouped into tiers that grow by
//! `max_merge_at_once` each step. When a tier holds more than
//! `segments_per_tier` segments, the cheapest window of up to
//! `max_merge_at_once` adjacent segments is merged. Cheap means roughly equal
//! sizes, a small result and many deletes reclaimed.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{QuireError, Result};
use crate::index::catalog::SegmentCatalog;
use crate::index::segment::SegmentCommitInfo;
use crate::merge::one_merge::OneMerge;
use crate::merge::policy::{MergeContext, MergePolicy, MergeSpecification, MergeTrigger};

const MB: f64 = 1024.0 * 1024.0;

/// Tunables of [`TieredMergePolicy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieredMergePolicyConfig {
    /// Most segments merged at once during normal indexing.
    pub max_merge_at_once: usize,

    /// Most segments merged at once by a forced merge.
    pub max_merge_at_once_explicit: usize,

    /// Merged segments stay below roughly this size, in megabytes.
    pub max_merged_segment_mb: f64,

    /// Smaller segments are treated as this big, in megabytes.
    pub floor_segment_mb: f64,

    /// Segments allowed per tier before a merge is wanted.
    pub segments_per_tier: f64,

    /// `force_merge_deletes` leaves segments with at most this percentage of
    /// deleted documents alone.
    pub force_merge_deletes_pct_allowed: f64,

    /// How strongly reclaiming deletes is favoured; 0 ignores them.
    pub reclaim_deletes_weight: f64,

    /// Merged segments bigger than this fraction of the index are not
    /// written as compound files.
    pub no_cfs_ratio: f64,

    /// Merged segments bigger than this, in megabytes, are never compound.
    pub max_cfs_segment_size_mb: f64,

    /// Write merged segments as compound files at all.
    pub use_compound_file: bool,
}

impl Default for TieredMergePolicyConfig {
    fn default() -> Self {
        TieredMergePolicyConfig {
            max_merge_at_once: 10,
            max_merge_at_once_explicit: 30,
            max_merged_segment_mb: 5.0 * 1024.0,
            floor_segment_mb: 2.0,
            segments_per_tier: 10.0,
            force_merge_deletes_pct_allowed: 10.0,
            reclaim_deletes_weight: 2.0,
            no_cfs_ratio: 0.1,
            max_cfs_segment_size_mb: f64::MAX / MB,
            use_compound_file: true,
        }
    }
}

impl TieredMergePolicyConfig {
    fn validate(&self) -> Result<()> {
        if self.max_merge_at_once < 2 {
            return Err(QuireError::invalid_argument(format!(
                "max_merge_at_once must be > 1 (got {})",
                self.max_merge_at_once
            )));
        }
        if self.max_merge_at_once_explicit < 2 {
            return Err(QuireError::invalid_argument(format!(
                "max_merge_at_once_explicit must be > 1 (got {})",
                self.max_merge_at_once_explicit
            )));
        }
        if self.segments_per_tier < 2.0 {
            return Err(QuireError::invalid_argument(format!(
                "segments_per_tier must be >= 2.0 (got {})",
                self.segments_per_tier
            )));
        }
        if self.max_merged_segment_mb < 0.0 || self.floor_segment_mb <= 0.0 {
            return Err(QuireError::invalid_argument(
                "segment sizes must be positive",
            ));
        }
        if !(0.0..=100.0).contains(&self.force_merge_deletes_pct_allowed) {
            return Err(QuireError::invalid_argument(format!(
                "force_merge_deletes_pct_allowed must be between 0.0 and 100.0 (got {})",
                self.force_merge_deletes_pct_allowed
            )));
        }
        if self.reclaim_deletes_weight < 0.0 {
            return Err(QuireError::invalid_argument(
                "reclaim_deletes_weight must be >= 0.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.no_cfs_ratio) {
            return Err(QuireError::invalid_argument(format!(
                "no_cfs_ratio must be between 0.0 and 1.0 (got {})",
                self.no_cfs_ratio
            )));
        }
        Ok(())
    }
}

/// Default merge policy; merges segments of roughly equal size.
#[derive(Debug, Clone)]
pub struct TieredMergePolicy {
    config: TieredMergePolicyConfig,
}

impl Default for TieredMergePolicy {
    fn default() -> Self {
        TieredMergePolicy {
            config: TieredMergePolicyConfig::default(),
        }
    }
}

/// A segment together with its deletes-discounted size.
struct SizedSegment<'a> {
    record: &'a SegmentCommitInfo,
    size: u64,
}

impl TieredMergePolicy {
    pub fn new(config: TieredMergePolicyConfig) -> Result<Self> {
        config.validate()?;
        Ok(TieredMergePolicy { config })
    }

    pub fn config(&self) -> &TieredMergePolicyConfig {
        &self.config
    }

    fn max_merged_segment_bytes(&self) -> f64 {
        self.config.max_merged_segment_mb * MB
    }

    fn floor_size(&self, bytes: u64) -> f64 {
        (bytes as f64).max(self.config.floor_segment_mb * MB)
    }

    /// Segments of `catalog` with their sizes, biggest first.
    fn sorted_by_size<'a>(
        &self,
        segments: impl Iterator<Item = &'a SegmentCommitInfo>,
        ctx: &MergeContext<'_>,
    ) -> Result<Vec<SizedSegment<'a>>> {
        let mut sized = Vec::new();
        for record in segments {
            sized.push(SizedSegment {
                record,
                size: ctx.size(record)?,
            });
        }
        // Ties broken by name so the choice is deterministic.
        sized.sort_by(|a, b| {
            b.size
                .cmp(&a.size)
                .then_with(|| a.record.name().cmp(b.record.name()))
        });
        Ok(sized)
    }

    /// Lower is better.
    fn score(&self, candidate: &[&SizedSegment<'_>], hit_too_large: bool, ctx: &MergeContext<'_>) -> Result<f64> {
        let mut before = 0u64;
        let mut after = 0u64;
        let mut after_floored = 0f64;
        for segment in candidate {
            after += segment.size;
            after_floored += self.floor_size(segment.size);
            before += ctx.size_in_bytes(segment.record)?;
        }

        // Roughly 1 / number of segments merged when sizes are equal;
        // close to 1 when one segment dominates.
        let skew = if hit_too_large {
            1.0 / self.config.max_merge_at_once as f64
        } else {
            self.floor_size(candidate[0].size) / after_floored
        };

        let mut score = skew;
        // Gently favour smaller merges.
        score *= (after as f64).powf(0.05);

        let non_del_ratio = if before == 0 {
            1.0
        } else {
            after as f64 / before as f64
        };
        score *= non_del_ratio.powf(self.config.reclaim_deletes_weight);
        Ok(score)
    }

    /// Whether `record` already is what a forced merge would produce.
    fn is_merged(
        &self,
        catalog: &SegmentCatalog,
        record: &SegmentCommitInfo,
        ctx: &MergeContext<'_>,
    ) -> Result<bool> {
        if ctx.num_deleted_docs(record) > 0 {
            return Ok(false);
        }
        Ok(self.use_compound_file(catalog, record, ctx)? == record.info().use_compound_file)
    }
}

impl MergePolicy for TieredMergePolicy {
    fn find_merges(
        &self,
        trigger: MergeTrigger,
        catalog: &SegmentCatalog,
        ctx: &MergeContext<'_>,
    ) -> Result<Option<MergeSpecification>> {
        if catalog.is_empty() {
            return Ok(None);
        }

        let sorted = self.sorted_by_size(catalog.segments().iter(), ctx)?;
        let max_merged = self.max_merged_segment_bytes();

        let mut total_bytes: f64 = sorted.iter().map(|s| s.size as f64).sum();
        let min_segment_bytes = sorted.iter().map(|s| s.size).min().unwrap_or(0);

        // Segments close to the maximum are left out of the tiers.
        let mut too_big_count = 0;
        while too_big_count < sorted.len() && sorted[too_big_count].size as f64 >= max_merged / 2.0 {
            total_bytes -= sorted[too_big_count].size as f64;
            too_big_count += 1;
        }

        let mut level_size = self.floor_size(min_segment_bytes);
        let mut bytes_left = total_bytes;
        let mut allowed_seg_count = 0.0;
        loop {
            let seg_count_level = bytes_left / level_size;
            if seg_count_level < self.config.segments_per_tier {
                allowed_seg_count += seg_count_level.ceil();
                break;
            }
            allowed_seg_count += self.config.segments_per_tier;
            bytes_left -= self.config.segments_per_tier * level_size;
            level_size *= self.config.max_merge_at_once as f64;
        }
        let allowed_seg_count = allowed_seg_count as usize;

        let mut spec: Option<MergeSpecification> = None;
        let mut to_be_merged: BTreeSet<&str> = BTreeSet::new();

        loop {
            let mut merging_bytes = 0u64;
            let mut eligible: Vec<&SizedSegment<'_>> = Vec::new();
            for segment in &sorted[too_big_count..] {
                if ctx.is_merging(segment.record.name()) {
                    merging_bytes += segment.size;
                } else if !to_be_merged.contains(segment.record.name()) {
                    eligible.push(segment);
                }
            }
            let max_merge_is_running = merging_bytes as f64 >= max_merged;

            if eligible.is_empty() || eligible.len() <= allowed_seg_count {
                return Ok(spec);
            }
            if eligible.len() < self.config.max_merge_at_once {
                return Ok(spec);
            }

            let mut best: Option<(Vec<&SizedSegment<'_>>, f64)> = None;
            for start in 0..=eligible.len() - self.config.max_merge_at_once {
                let mut after = 0u64;
                let mut candidate = Vec::new();
                let mut hit_too_large = false;
                for segment in &eligible[start..] {
                    if candidate.len() >= self.config.max_merge_at_once {
                        break;
                    }
                    if (after + segment.size) as f64 > max_merged {
                        // Keep going: a smaller segment may still fit.
                        hit_too_large = true;
                        continue;
                    }
                    candidate.push(*segment);
                    after += segment.size;
                }
                if candidate.is_empty() {
                    continue;
                }

                let score = self.score(&candidate, hit_too_large, ctx)?;
                let better = best.as_ref().is_none_or(|(_, best_score)| score < *best_score);
                if better && (!hit_too_large || !max_merge_is_running) {
                    best = Some((candidate, score));
                }
            }

            let Some((best, score)) = best else {
                return Ok(spec);
            };
            debug!(
                "tiered merge ({trigger:?}): {} segments, score {score:.3}",
                best.len()
            );
            for segment in &best {
                to_be_merged.insert(segment.record.name());
            }
            let records = best.iter().map(|s| s.record.clone()).collect();
            spec.get_or_insert_with(MergeSpecification::new)
                .add(OneMerge::new(records));
        }
    }

    fn find_forced_merges(
        &self,
        catalog: &SegmentCatalog,
        max_segment_count: usize,
        segments_to_merge: &BTreeMap<String, bool>,
        ctx: &MergeContext<'_>,
    ) -> Result<Option<MergeSpecification>> {
        let mut candidates = Vec::new();
        let mut force_merge_running = false;
        let mut segment_is_original = false;
        for record in catalog.segments() {
            if let Some(is_original) = segments_to_merge.get(record.name()) {
                segment_is_original = *is_original;
                if ctx.is_merging(record.name()) {
                    force_merge_running = true;
                } else {
                    candidates.push(record);
                }
            }
        }

        if candidates.is_empty() {
            return Ok(None);
        }
        if (max_segment_count > 1 && candidates.len() <= max_segment_count)
            || (max_segment_count == 1
                && candidates.len() == 1
                && (!segment_is_original || self.is_merged(catalog, candidates[0], ctx)?))
        {
            debug!("forced merge: already merged");
            return Ok(None);
        }

        let eligible = self.sorted_by_size(candidates.into_iter(), ctx)?;
        let explicit = self.config.max_merge_at_once_explicit;
        let mut spec: Option<MergeSpecification> = None;

        // Full-width merges first, from the small end.
        let mut end = eligible.len();
        while end + 1 >= explicit + max_segment_count {
            let records = eligible[end - explicit..end]
                .iter()
                .map(|s| s.record.clone())
                .collect();
            spec.get_or_insert_with(MergeSpecification::new)
                .add(OneMerge::new(records));
            end -= explicit;
        }

        if spec.is_none() && !force_merge_running {
            let num_to_merge = end + 1 - max_segment_count;
            let records = eligible[end - num_to_merge..end]
                .iter()
                .map(|s| s.record.clone())
                .collect();
            spec.get_or_insert_with(MergeSpecification::new)
                .add(OneMerge::new(records));
        }
        Ok(spec)
    }

    fn find_forced_deletes_merges(
        &self,
        catalog: &SegmentCatalog,
        ctx: &MergeContext<'_>,
    ) -> Result<Option<MergeSpecification>> {
        let candidates: Vec<&SegmentCommitInfo> = catalog
            .segments()
            .iter()
            .filter(|record| {
                let pct_deletes = if record.doc_count() == 0 {
                    0.0
                } else {
                    100.0 * ctx.num_deleted_docs(record) as f64 / record.doc_count() as f64
                };
                pct_deletes > self.config.force_merge_deletes_pct_allowed
                    && !ctx.is_merging(record.name())
            })
            .collect();

        if candidates.is_empty() {
            return Ok(None);
        }

        let eligible = self.sorted_by_size(candidates.into_iter(), ctx)?;
        let mut spec = MergeSpecification::new();
        for chunk in eligible.chunks(self.config.max_merge_at_once_explicit) {
            spec.add(OneMerge::new(chunk.iter().map(|s| s.record.clone()).collect()));
        }
        Ok(Some(spec))
    }

    fn use_compound_file(
        &self,
        catalog: &SegmentCatalog,
        merged: &SegmentCommitInfo,
        ctx: &MergeContext<'_>,
    ) -> Result<bool> {
        if !self.config.use_compound_file {
            return Ok(false);
        }
        let merged_size = ctx.size(merged)? as f64;
        if merged_size > self.config.max_cfs_segment_size_mb * MB {
            return Ok(false);
        }
        if self.config.no_cfs_ratio >= 1.0 {
            return Ok(true);
        }
        let mut total = 0f64;
        for record in catalog.segments() {
            total += ctx.size(record)? as f64;
        }
        Ok(merged_size <= self.config.no_cfs_ratio * total)
    }
}
