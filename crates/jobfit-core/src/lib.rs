//! Core record model, score normalization and conflict types for jobfit.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

pub const CRATE_NAME: &str = "jobfit-core";

/// Stand-in for a missing score wherever a strict comparable is required.
pub const MISSING_SCORE_SENTINEL: f64 = -1.0;

/// Rows below this score never reach the sorted report.
pub const MIN_REPORT_SCORE: f64 = 80.0;

static SCORE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-+]?\d+(?:\.\d+)?").expect("score pattern is valid"));

/// Normalize a score of unknown shape. Numbers pass through unchanged, strings
/// yield their first decimal number, everything else is missing.
pub fn parse_score(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            SCORE_PATTERN
                .find(s)
                .and_then(|m| m.as_str().parse::<f64>().ok())
        }
        _ => None,
    }
}

pub fn score_or_sentinel(score: Option<f64>) -> f64 {
    score.unwrap_or(MISSING_SCORE_SENTINEL)
}

pub type RoleMap = IndexMap<String, JobRecord>;

/// Fully merged `company -> role -> record` structure, in first-seen order.
pub type MasterMapping = IndexMap<String, RoleMap>;

/// Flatten/sort output: `company -> rows`, rows ordered by score.
pub type SortedByCompany = IndexMap<String, Vec<RoleRow>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    Latest,
    HigherScore,
}

impl DedupPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Latest => "latest",
            Self::HigherScore => "higher_score",
        }
    }
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self::HigherScore
    }
}

impl fmt::Display for DedupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDedupPolicy(pub String);

impl fmt::Display for UnknownDedupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown dedup policy '{}' (expected 'latest' or 'higher_score')",
            self.0
        )
    }
}

impl std::error::Error for UnknownDedupPolicy {}

impl FromStr for DedupPolicy {
    type Err = UnknownDedupPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "latest" => Ok(Self::Latest),
            "higher_score" | "higher-score" => Ok(Self::HigherScore),
            other => Err(UnknownDedupPolicy(other.to_string())),
        }
    }
}

/// Which merge decision put a record into the master mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChosenBy {
    Initial,
    Latest,
    HigherScore,
    KeptByHigherScore,
}

/// The `(company, role)` pair that owns a job link, plus where it was first seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkOwner {
    pub company: String,
    pub role: String,
    pub file: String,
    pub timestamp: DateTime<Utc>,
}

impl LinkOwner {
    pub fn owns(&self, company: &str, role: &str) -> bool {
        self.company == company && self.role == role
    }
}

/// One sighting of a `(company, role)` key in a batch file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Occurrence {
    pub file: String,
    pub timestamp: DateTime<Utc>,
    pub score: Option<JsonValue>,
}

/// A scored job posting nested under `company -> role` in a batch file.
///
/// Named fields are the ones the merge engine reasons about; anything else in
/// the source object is carried verbatim, in source order, through `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct JobRecord {
    /// Raw score exactly as it arrived; see [`parse_score`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fit_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_skills: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chosen_by: Option<ChosenBy>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub link_conflict: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_conflict_with: Option<LinkOwner>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub provenance: Vec<Occurrence>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl JobRecord {
    /// Build a record from a detail object without ever failing. Named fields
    /// with an unexpected shape are coerced or dropped; they never end up in
    /// `extra`, so serialization cannot emit duplicate keys.
    pub fn from_json_map(mut map: JsonMap<String, JsonValue>) -> Self {
        let score = map.shift_remove("score");
        JobRecord {
            score,
            fit_reason: map.shift_remove("fit_reason").and_then(coerce_text),
            missing_skills: map.shift_remove("missing_skills").and_then(coerce_text_list),
            link: match map.shift_remove("link") {
                Some(JsonValue::String(s)) => Some(s),
                _ => None,
            },
            chosen_by: map
                .shift_remove("chosen_by")
                .and_then(|v| serde_json::from_value(v).ok()),
            link_conflict: matches!(map.shift_remove("link_conflict"), Some(JsonValue::Bool(true))),
            link_conflict_with: map
                .shift_remove("link_conflict_with")
                .and_then(|v| serde_json::from_value(v).ok()),
            provenance: map
                .shift_remove("provenance")
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default(),
            extra: map,
        }
    }

    /// `None` when the value is not a JSON object.
    pub fn from_json_value(value: JsonValue) -> Option<Self> {
        match value {
            JsonValue::Object(map) => Some(Self::from_json_map(map)),
            _ => None,
        }
    }

    pub fn parsed_score(&self) -> Option<f64> {
        self.score.as_ref().and_then(parse_score)
    }

    /// Trimmed link when it is usable as a registry key.
    pub fn link_key(&self) -> Option<&str> {
        self.link.as_deref().map(str::trim).filter(|l| !l.is_empty())
    }

    /// Drop the link and point at the pair that already owns it.
    pub fn mark_link_conflict(&mut self, owner: LinkOwner) {
        self.link = None;
        self.link_conflict = true;
        self.link_conflict_with = Some(owner);
    }

    /// Forget conflict flags and provenance read from an earlier merge's
    /// output. Only the current run may set them.
    pub fn clear_merge_markers(&mut self) {
        self.link_conflict = false;
        self.link_conflict_with = None;
        self.provenance.clear();
    }
}

fn coerce_text(value: JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn coerce_text_list(value: JsonValue) -> Option<Vec<String>> {
    match value {
        JsonValue::Array(items) => Some(
            items
                .into_iter()
                .map(|item| match item {
                    JsonValue::String(s) => s,
                    other => other.to_string(),
                })
                .collect(),
        ),
        JsonValue::String(s) => Some(vec![s]),
        _ => None,
    }
}

/// One row of the sorted, report-ready output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoleRow {
    pub company: String,
    pub role_name: String,
    pub score: f64,
    pub fit_reason: Option<String>,
    pub missing_skills: Option<Vec<String>>,
    pub link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chosen_by: Option<ChosenBy>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub link_conflict: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_conflict_with: Option<LinkOwner>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub provenance: Vec<Occurrence>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl RoleRow {
    pub fn from_record(company: &str, role_name: &str, score: f64, record: &JobRecord) -> Self {
        let mut extra = record.extra.clone();
        // the row's own identity always wins over same-named detail fields
        extra.shift_remove("company");
        extra.shift_remove("role_name");
        Self {
            company: company.to_string(),
            role_name: role_name.to_string(),
            score,
            fit_reason: record.fit_reason.clone(),
            missing_skills: record.missing_skills.clone(),
            link: record.link.clone(),
            chosen_by: record.chosen_by,
            link_conflict: record.link_conflict,
            link_conflict_with: record.link_conflict_with.clone(),
            provenance: record.provenance.clone(),
            extra,
        }
    }
}

/// Audit entry produced while merging batch files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConflictRecord {
    LinkCollision {
        link: String,
        existing_company: String,
        existing_role: String,
        existing_file: String,
        new_company: String,
        new_role: String,
        new_file: String,
        decision: LinkDecision,
    },
    ScoreConflict {
        company: String,
        role: String,
        existing_score: f64,
        new_score: f64,
        new_file: String,
        /// File that supplied the stored record before this encounter.
        existing_file: String,
        decision: ScoreDecision,
        chosen_by: DedupPolicy,
    },
}

impl ConflictRecord {
    pub fn is_link_collision(&self) -> bool {
        matches!(self, Self::LinkCollision { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkDecision {
    KeepExisting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreDecision {
    Replaced,
    Kept,
}
