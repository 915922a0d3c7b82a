//! Batch file discovery and lenient loading of LLM scoring outputs.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use jobfit_core::JobRecord;
use jobfit_storage::sha256_hex;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "jobfit-batch";

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("input folder not found: {}", .0.display())]
    InputDirMissing(PathBuf),
    #[error("no files found in {} matching {pattern}", .dir.display())]
    NoInputFiles { dir: PathBuf, pattern: String },
    #[error("invalid glob pattern {pattern}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{}: {message}", .path.display())]
    Shape { path: PathBuf, message: String },
}

/// Roles of one company, in file order.
#[derive(Debug, Clone, PartialEq)]
pub struct CompanyBatch {
    pub company: String,
    pub roles: Vec<(String, JobRecord)>,
}

/// One partial-results file from a single scoring run.
#[derive(Debug, Clone)]
pub struct BatchFile {
    /// Base file name; this is what conflict records and the link map cite.
    pub name: String,
    pub path: PathBuf,
    pub modified_at: DateTime<Utc>,
    pub sha256: String,
    pub companies: Vec<CompanyBatch>,
    /// Companies or details that were not JSON objects.
    pub skipped_entries: usize,
}

impl BatchFile {
    /// `(company, role, record)` triples in file order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, &JobRecord)> + '_ {
        self.companies.iter().flat_map(|c| {
            c.roles
                .iter()
                .map(move |(role, record)| (c.company.as_str(), role.as_str(), record))
        })
    }

    pub fn role_count(&self) -> usize {
        self.companies.iter().map(|c| c.roles.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub file: String,
    pub reason: String,
}

/// Files in `dir` whose names match `pattern`, in lexical name order.
pub fn discover_batch_files(dir: impl AsRef<Path>, pattern: &str) -> Result<Vec<PathBuf>, BatchError> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(BatchError::InputDirMissing(dir.to_path_buf()));
    }
    let matcher = glob::Pattern::new(pattern).map_err(|source| BatchError::Pattern {
        pattern: pattern.to_string(),
        source,
    })?;
    let match_opts = glob::MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: true,
    };

    let entries = fs::read_dir(dir).map_err(|source| BatchError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut files = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| matcher.matches_with(name, match_opts))
                .unwrap_or(false)
        })
        .map(|entry| entry.path())
        .collect::<Vec<_>>();
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    if files.is_empty() {
        return Err(BatchError::NoInputFiles {
            dir: dir.to_path_buf(),
            pattern: pattern.to_string(),
        });
    }
    Ok(files)
}

/// Read and parse one batch file. Malformed companies and details are skipped
/// with a warning; only an unreadable file or a non-object top level fails.
pub fn load_batch_file(path: impl AsRef<Path>) -> Result<BatchFile, BatchError> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|source| BatchError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let modified_at = fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| DateTime::<Utc>::from(std::time::UNIX_EPOCH));
    let value: JsonValue = serde_json::from_slice(&bytes).map_err(|source| BatchError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let JsonValue::Object(top) = value else {
        return Err(BatchError::Shape {
            path: path.to_path_buf(),
            message: "top level is not a JSON object of companies".to_string(),
        });
    };

    let (companies, skipped_entries) = companies_from_object(path, top);
    Ok(BatchFile {
        name: file_name_of(path),
        path: path.to_path_buf(),
        modified_at,
        sha256: sha256_hex(&bytes),
        companies,
        skipped_entries,
    })
}

fn companies_from_object(path: &Path, top: JsonMap<String, JsonValue>) -> (Vec<CompanyBatch>, usize) {
    let mut skipped = 0usize;
    let mut companies = Vec::with_capacity(top.len());
    for (company, roles) in top {
        let JsonValue::Object(roles) = roles else {
            warn!(file = %path.display(), %company, "company entry is not an object of roles; skipping");
            skipped += 1;
            continue;
        };
        let mut parsed = Vec::with_capacity(roles.len());
        for (role, detail) in roles {
            match JobRecord::from_json_value(detail) {
                Some(record) => parsed.push((role, record)),
                None => {
                    warn!(file = %path.display(), %company, %role, "role detail is not an object; skipping");
                    skipped += 1;
                }
            }
        }
        companies.push(CompanyBatch {
            company,
            roles: parsed,
        });
    }
    (companies, skipped)
}

/// Load every path in order, skipping (and reporting) the ones that fail.
pub fn load_batches(paths: &[PathBuf]) -> (Vec<BatchFile>, Vec<SkippedFile>) {
    let mut batches = Vec::with_capacity(paths.len());
    let mut skipped = Vec::new();
    for path in paths {
        match load_batch_file(path) {
            Ok(batch) => batches.push(batch),
            Err(err) => {
                warn!(file = %path.display(), error = %err, "failed to load batch file; skipping");
                skipped.push(SkippedFile {
                    file: file_name_of(path),
                    reason: err.to_string(),
                });
            }
        }
    }
    (batches, skipped)
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Identifier of a batch inside its series: the file stem minus the literal
/// prefix of the glob pattern (`llm_data_X_*.json` + `llm_data_X_007.json` -> `007`).
pub fn batch_id_from_file_name(name: &str, pattern: &str) -> String {
    let stem = Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string());
    let prefix_end = pattern.find(['*', '?', '[']).unwrap_or(pattern.len());
    let prefix = &pattern[..prefix_end];
    match stem.strip_prefix(prefix) {
        Some(rest) if !prefix.is_empty() && !rest.is_empty() => rest.to_string(),
        _ => stem,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateKey {
    pub company: String,
    pub role: String,
    pub count: usize,
}

/// Occurrence statistics for `(company, role)` keys across loaded batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyScan {
    pub files_scanned: usize,
    pub total_role_entries: usize,
    pub unique_keys: usize,
    /// Keys seen more than once, most frequent first.
    pub duplicates: Vec<DuplicateKey>,
}

pub fn scan_batches(batches: &[BatchFile]) -> KeyScan {
    let mut occurrences: IndexMap<(String, String), usize> = IndexMap::new();
    let mut total_role_entries = 0usize;
    for batch in batches {
        for (company, role, _) in batch.entries() {
            total_role_entries += 1;
            *occurrences
                .entry((company.trim().to_string(), role.trim().to_string()))
                .or_default() += 1;
        }
    }

    let mut duplicates = occurrences
        .iter()
        .filter(|(_, count)| **count > 1)
        .map(|((company, role), count)| DuplicateKey {
            company: company.clone(),
            role: role.clone(),
            count: *count,
        })
        .collect::<Vec<_>>();
    duplicates.sort_by(|a, b| b.count.cmp(&a.count));

    KeyScan {
        files_scanned: batches.len(),
        total_role_entries,
        unique_keys: occurrences.len(),
        duplicates,
    }
}

/// A combined summary read back from disk, in either the plain
/// `company -> rows` form or wrapped as `{by_company, link_map}`.
#[derive(Debug, Clone, Default)]
pub struct SummaryFile {
    pub by_company: IndexMap<String, Vec<JsonValue>>,
    pub link_map: Option<JsonMap<String, JsonValue>>,
}

pub fn load_summary_file(path: impl AsRef<Path>) -> Result<SummaryFile, BatchError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| BatchError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: JsonValue = serde_json::from_str(&text).map_err(|source| BatchError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let JsonValue::Object(mut top) = value else {
        return Err(BatchError::Shape {
            path: path.to_path_buf(),
            message: "summary is not a JSON object".to_string(),
        });
    };

    let wrapped = matches!(top.get("by_company"), Some(JsonValue::Object(_)));
    let (companies, link_map) = if wrapped {
        let link_map = match top.shift_remove("link_map") {
            Some(JsonValue::Object(map)) => Some(map),
            _ => None,
        };
        match top.shift_remove("by_company") {
            Some(JsonValue::Object(map)) => (map, link_map),
            _ => (JsonMap::new(), link_map),
        }
    } else {
        (top, None)
    };

    let mut by_company = IndexMap::new();
    for (company, rows) in companies {
        match rows {
            JsonValue::Array(rows) => {
                by_company.insert(company, rows);
            }
            _ => warn!(file = %path.display(), %company, "summary entry is not a list of rows; skipping"),
        }
    }
    Ok(SummaryFile {
        by_company,
        link_map,
    })
}
