//! Folds batch files into one master mapping under a dedup policy.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use indexmap::map::Entry;
use jobfit_batch::{load_batches, BatchFile, SkippedFile};
use jobfit_core::{
    score_or_sentinel, ChosenBy, ConflictRecord, DedupPolicy, JobRecord, LinkDecision,
    MasterMapping, Occurrence, ScoreDecision,
};
use serde::Serialize;
use tracing::{debug, info_span, warn};

use crate::registry::{LinkOutcome, LinkRegistry};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOptions {
    pub policy: DedupPolicy,
    /// Record every `(file, timestamp, score)` sighting on the stored record.
    pub track_provenance: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub files_loaded: usize,
    pub files_skipped: usize,
    pub malformed_entries: usize,
    pub role_entries: usize,
    pub unique_keys: usize,
    pub duplicate_encounters: usize,
    pub replacements: usize,
    pub links_registered: usize,
    pub link_collisions: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub master: MasterMapping,
    pub conflicts: Vec<ConflictRecord>,
    pub links: LinkRegistry,
    pub stats: MergeStats,
    pub skipped: Vec<SkippedFile>,
}

impl MergeOutcome {
    pub fn link_collisions(&self) -> usize {
        self.conflicts.iter().filter(|c| c.is_link_collision()).count()
    }
}

pub struct MergeEngine {
    options: MergeOptions,
}

impl MergeEngine {
    pub fn new(options: MergeOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> MergeOptions {
        self.options
    }

    /// Load and fold `paths` in the given order. Files that cannot be loaded
    /// are skipped with a warning and listed in [`MergeOutcome::skipped`].
    pub fn merge_paths(&self, paths: &[PathBuf]) -> MergeOutcome {
        let (batches, skipped) = load_batches(paths);
        self.fold(&batches, skipped)
    }

    /// Fold already-loaded batches in slice order.
    pub fn merge_batches(&self, batches: &[BatchFile]) -> MergeOutcome {
        self.fold(batches, Vec::new())
    }

    fn fold(&self, batches: &[BatchFile], skipped: Vec<SkippedFile>) -> MergeOutcome {
        let mut state = MergeState::new(self.options);
        for batch in batches {
            state.absorb(batch);
        }
        state.finish(skipped)
    }
}

struct MergeState {
    options: MergeOptions,
    master: MasterMapping,
    conflicts: Vec<ConflictRecord>,
    links: LinkRegistry,
    stats: MergeStats,
    /// File that supplied the currently stored record of each key.
    origins: HashMap<(String, String), String>,
}

impl MergeState {
    fn new(options: MergeOptions) -> Self {
        Self {
            options,
            master: MasterMapping::new(),
            conflicts: Vec::new(),
            links: LinkRegistry::new(),
            stats: MergeStats::default(),
            origins: HashMap::new(),
        }
    }

    fn absorb(&mut self, batch: &BatchFile) {
        let span = info_span!("merge_batch", file = %batch.name);
        let _guard = span.enter();

        self.stats.files_loaded += 1;
        self.stats.malformed_entries += batch.skipped_entries;
        for section in &batch.companies {
            self.master.entry(section.company.clone()).or_default();
            for (role, detail) in &section.roles {
                self.stats.role_entries += 1;
                self.merge_one(batch, &section.company, role, detail);
            }
        }
        debug!(roles = batch.role_count(), "batch merged");
    }

    fn merge_one(&mut self, batch: &BatchFile, company: &str, role: &str, detail: &JobRecord) {
        let policy = self.options.policy;
        let track = self.options.track_provenance;
        let occurrence = || Occurrence {
            file: batch.name.clone(),
            timestamp: batch.modified_at,
            score: detail.score.clone(),
        };
        let key = (company.to_string(), role.to_string());
        let roles = self.master.entry(company.to_string()).or_default();

        let existing = match roles.entry(role.to_string()) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                let mut record = detail.clone();
                record.clear_merge_markers();
                record.chosen_by = Some(ChosenBy::Initial);
                if track {
                    record.provenance.push(occurrence());
                }
                claim_link(
                    &mut self.links,
                    &mut self.conflicts,
                    &mut self.stats,
                    &mut record,
                    company,
                    role,
                    &batch.name,
                    batch.modified_at,
                );
                slot.insert(record);
                self.origins.insert(key, batch.name.clone());
                return;
            }
        };

        let existing_score = score_or_sentinel(existing.parsed_score());
        let new_score = score_or_sentinel(detail.parsed_score());
        let replace = match policy {
            DedupPolicy::Latest => true,
            DedupPolicy::HigherScore => new_score > existing_score,
        };
        let existing_file = self.origins.get(&key).cloned().unwrap_or_default();

        let decision = if replace {
            let mut record = detail.clone();
            record.clear_merge_markers();
            record.chosen_by = Some(match policy {
                DedupPolicy::Latest => ChosenBy::Latest,
                DedupPolicy::HigherScore => ChosenBy::HigherScore,
            });
            if track {
                let mut provenance = std::mem::take(&mut existing.provenance);
                provenance.push(occurrence());
                record.provenance = provenance;
            }
            claim_link(
                &mut self.links,
                &mut self.conflicts,
                &mut self.stats,
                &mut record,
                company,
                role,
                &batch.name,
                batch.modified_at,
            );
            *existing = record;
            self.origins.insert(key, batch.name.clone());
            self.stats.replacements += 1;
            ScoreDecision::Replaced
        } else {
            // only a record no dedup decision has touched yet gets the kept tag
            if matches!(existing.chosen_by, None | Some(ChosenBy::Initial)) {
                existing.chosen_by = Some(ChosenBy::KeptByHigherScore);
            }
            if track {
                existing.provenance.push(occurrence());
            }
            ScoreDecision::Kept
        };

        self.stats.duplicate_encounters += 1;
        self.conflicts.push(ConflictRecord::ScoreConflict {
            company: company.to_string(),
            role: role.to_string(),
            existing_score,
            new_score,
            new_file: batch.name.clone(),
            existing_file,
            decision,
            chosen_by: policy,
        });
    }

    fn finish(mut self, skipped: Vec<SkippedFile>) -> MergeOutcome {
        self.stats.files_skipped = skipped.len();
        self.stats.unique_keys = self.master.values().map(|roles| roles.len()).sum();
        MergeOutcome {
            master: self.master,
            conflicts: self.conflicts,
            links: self.links,
            stats: self.stats,
            skipped,
        }
    }
}

/// Register the record's link for `(company, role)`. On collision the record
/// loses its link and the collision is logged; the registry is unchanged.
#[allow(clippy::too_many_arguments)]
fn claim_link(
    links: &mut LinkRegistry,
    conflicts: &mut Vec<ConflictRecord>,
    stats: &mut MergeStats,
    record: &mut JobRecord,
    company: &str,
    role: &str,
    file: &str,
    timestamp: DateTime<Utc>,
) {
    let Some(link) = record.link_key().map(str::to_string) else {
        return;
    };
    match links.register(&link, company, role, file, timestamp) {
        LinkOutcome::Registered => stats.links_registered += 1,
        LinkOutcome::SameOwner | LinkOutcome::Ignored => {}
        LinkOutcome::Collision(owner) => {
            warn!(
                %link,
                existing_company = %owner.company,
                existing_role = %owner.role,
                new_company = company,
                new_role = role,
                "link already owned by another role; keeping existing owner"
            );
            conflicts.push(ConflictRecord::LinkCollision {
                link,
                existing_company: owner.company.clone(),
                existing_role: owner.role.clone(),
                existing_file: owner.file.clone(),
                new_company: company.to_string(),
                new_role: role.to_string(),
                new_file: file.to_string(),
                decision: LinkDecision::KeepExisting,
            });
            record.mark_link_conflict(owner);
            stats.link_collisions += 1;
        }
    }
}

/// A single batch as a master mapping, records untouched (no merge tags).
pub fn master_from_batch(batch: &BatchFile) -> MasterMapping {
    let mut master = MasterMapping::new();
    for section in &batch.companies {
        let roles = master.entry(section.company.clone()).or_default();
        for (role, record) in &section.roles {
            roles.insert(role.clone(), record.clone());
        }
    }
    master
}
