// Property-based tests for the merge engine and flatten stage.
// CI: 256 cases (default). Soak: PROPTEST_CASES=10000 cargo test --release

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use jobfit_batch::{BatchFile, CompanyBatch};
use jobfit_core::{
    score_or_sentinel, ConflictRecord, DedupPolicy, JobRecord, MIN_REPORT_SCORE,
};
use jobfit_merge::{flatten_and_sort, MergeEngine, MergeOptions};
use proptest::prelude::*;
use serde_json::{json, Value as JsonValue};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn config_256() -> ProptestConfig {
    ProptestConfig {
        cases: std::env::var("PROPTEST_CASES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(256),
        failure_persistence: None,
        ..ProptestConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Generators
// ---------------------------------------------------------------------------

const COMPANIES: [&str; 3] = ["Acme", "Beta", "Gamma"];
const ROLES: [&str; 3] = ["Eng", "Ops", "QA"];

#[derive(Debug, Clone)]
struct Entry {
    company: usize,
    role: usize,
    score: JsonValue,
    link: Option<usize>,
}

/// Score of any shape the loader has to cope with.
fn arb_score() -> impl Strategy<Value = JsonValue> {
    prop_oneof![
        3 => (0u32..120).prop_map(|n| json!(n)),
        1 => (0u32..120).prop_map(|n| json!(format!("{n} out of 100"))),
        1 => Just(JsonValue::Null),
        1 => Just(json!("strong match")),
    ]
}

fn arb_entry() -> impl Strategy<Value = Entry> {
    (0..COMPANIES.len(), 0..ROLES.len(), arb_score(), proptest::option::of(0usize..4)).prop_map(
        |(company, role, score, link)| Entry {
            company,
            role,
            score,
            link,
        },
    )
}

fn arb_files() -> impl Strategy<Value = Vec<Vec<Entry>>> {
    proptest::collection::vec(proptest::collection::vec(arb_entry(), 0..6), 1..5)
}

/// Materialize generated entries as batches. Every detail carries a unique
/// `seq` so tests can tell which occurrence ended up stored. A repeated key
/// inside one file keeps only its first entry, as a JSON object would.
fn build_batches(files: &[Vec<Entry>]) -> (Vec<BatchFile>, Vec<(String, String, JobRecord)>) {
    let mut seq = 0u64;
    let mut batches = Vec::new();
    let mut occurrences = Vec::new();
    for (file_idx, entries) in files.iter().enumerate() {
        let mut companies: Vec<CompanyBatch> = Vec::new();
        for entry in entries {
            let company = COMPANIES[entry.company];
            let role = ROLES[entry.role];
            let mut detail = serde_json::Map::new();
            detail.insert("score".into(), entry.score.clone());
            if let Some(link) = entry.link {
                detail.insert("link".into(), json!(format!("http://x/{link}")));
            }
            detail.insert("seq".into(), json!(seq));
            seq += 1;
            let record = JobRecord::from_json_map(detail);

            let idx = match companies.iter().position(|c| c.company == company) {
                Some(idx) => idx,
                None => {
                    companies.push(CompanyBatch {
                        company: company.to_string(),
                        roles: Vec::new(),
                    });
                    companies.len() - 1
                }
            };
            if companies[idx].roles.iter().any(|(r, _)| r == role) {
                continue;
            }
            companies[idx].roles.push((role.to_string(), record));
        }
        let batch = BatchFile {
            name: format!("batch_{file_idx:03}.json"),
            path: PathBuf::from(format!("batch_{file_idx:03}.json")),
            modified_at: Utc
                .with_ymd_and_hms(2025, 11, 3, 9, file_idx as u32, 0)
                .single()
                .unwrap(),
            sha256: String::new(),
            companies,
            skipped_entries: 0,
        };
        // grouping by company reorders entries; the engine reads file order
        occurrences.extend(
            batch
                .entries()
                .map(|(company, role, record)| (company.to_string(), role.to_string(), record.clone())),
        );
        batches.push(batch);
    }
    (batches, occurrences)
}

fn seq_of(record: &JobRecord) -> u64 {
    record.extra["seq"].as_u64().unwrap()
}

fn merge(policy: DedupPolicy, batches: &[BatchFile]) -> jobfit_merge::MergeOutcome {
    MergeEngine::new(MergeOptions {
        policy,
        track_provenance: false,
    })
    .merge_batches(batches)
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(config_256())]

    #[test]
    fn merging_twice_gives_identical_results(files in arb_files(), latest in any::<bool>()) {
        let policy = if latest { DedupPolicy::Latest } else { DedupPolicy::HigherScore };
        let (batches, _) = build_batches(&files);
        let first = merge(policy, &batches);
        let second = merge(policy, &batches);
        prop_assert_eq!(&first.master, &second.master);
        prop_assert_eq!(&first.conflicts, &second.conflicts);
        prop_assert_eq!(&first.links, &second.links);
    }

    #[test]
    fn one_record_per_key_and_one_score_conflict_per_duplicate(files in arb_files()) {
        let (batches, occurrences) = build_batches(&files);
        let out = merge(DedupPolicy::HigherScore, &batches);

        let mut keys: Vec<_> = occurrences.iter().map(|(c, r, _)| (c.clone(), r.clone())).collect();
        keys.sort();
        keys.dedup();
        prop_assert_eq!(out.stats.unique_keys, keys.len());

        let score_conflicts = out
            .conflicts
            .iter()
            .filter(|c| matches!(c, ConflictRecord::ScoreConflict { .. }))
            .count();
        prop_assert_eq!(score_conflicts, occurrences.len() - keys.len());
    }

    #[test]
    fn higher_score_keeps_the_earliest_maximum(files in arb_files()) {
        let (batches, occurrences) = build_batches(&files);
        let out = merge(DedupPolicy::HigherScore, &batches);

        let mut best: HashMap<(String, String), (f64, u64)> = HashMap::new();
        for (company, role, record) in &occurrences {
            let score = score_or_sentinel(record.parsed_score());
            let slot = best.entry((company.clone(), role.clone())).or_insert((score, seq_of(record)));
            if score > slot.0 {
                *slot = (score, seq_of(record));
            }
        }
        for ((company, role), (score, seq)) in best {
            let stored = &out.master[&company][&role];
            prop_assert_eq!(score_or_sentinel(stored.parsed_score()), score);
            prop_assert_eq!(seq_of(stored), seq);
        }
    }

    #[test]
    fn latest_keeps_the_last_occurrence(files in arb_files()) {
        let (batches, occurrences) = build_batches(&files);
        let out = merge(DedupPolicy::Latest, &batches);

        let mut last: HashMap<(String, String), u64> = HashMap::new();
        for (company, role, record) in &occurrences {
            last.insert((company.clone(), role.clone()), seq_of(record));
        }
        for ((company, role), seq) in last {
            prop_assert_eq!(seq_of(&out.master[&company][&role]), seq);
        }
    }

    #[test]
    fn links_belong_to_their_first_presenter(files in arb_files()) {
        let (batches, occurrences) = build_batches(&files);
        // under `latest` every occurrence is stored, so every link is presented
        let out = merge(DedupPolicy::Latest, &batches);

        let mut first: HashMap<String, (String, String)> = HashMap::new();
        for (company, role, record) in &occurrences {
            if let Some(link) = record.link_key() {
                first.entry(link.to_string()).or_insert((company.clone(), role.clone()));
            }
        }
        prop_assert_eq!(out.links.len(), first.len());
        for (link, (company, role)) in &first {
            let owner = out.links.owner(link).unwrap();
            prop_assert!(owner.owns(company, role));
        }

        for (company, roles) in &out.master {
            for (role, record) in roles {
                if let Some(link) = record.link_key() {
                    prop_assert!(out.links.owner(link).unwrap().owns(company, role));
                }
                if record.link_conflict {
                    prop_assert!(record.link.is_none());
                    let owner = record.link_conflict_with.as_ref().unwrap();
                    prop_assert!(!owner.owns(company, role));
                }
            }
        }
    }

    #[test]
    fn flattened_rows_pass_the_floor_and_are_ordered(files in arb_files(), descending in any::<bool>()) {
        let (batches, _) = build_batches(&files);
        let out = merge(DedupPolicy::HigherScore, &batches);
        let sorted = flatten_and_sort(&out.master, descending);

        prop_assert_eq!(sorted.len(), out.master.len());
        for (company, rows) in &sorted {
            let expected = out.master[company]
                .values()
                .filter(|r| r.parsed_score().map_or(false, |s| s >= MIN_REPORT_SCORE))
                .count();
            prop_assert_eq!(rows.len(), expected);
            for pair in rows.windows(2) {
                prop_assert!(pair[0].score >= MIN_REPORT_SCORE);
                if descending {
                    prop_assert!(pair[0].score >= pair[1].score);
                } else {
                    prop_assert!(pair[0].score <= pair[1].score);
                }
                if pair[0].score == pair[1].score {
                    let roles: Vec<_> = out.master[company].keys().collect();
                    let a = roles.iter().position(|r| **r == pair[0].role_name).unwrap();
                    let b = roles.iter().position(|r| **r == pair[1].role_name).unwrap();
                    prop_assert!(a < b);
                }
            }
            prop_assert!(rows.iter().all(|r| r.score >= MIN_REPORT_SCORE));
        }
    }
}
