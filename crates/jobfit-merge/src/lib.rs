//! Batch merge pipeline: load partial scoring results, reconcile duplicates,
//! then flatten, sort and write the reports.

pub mod engine;
pub mod flatten;
pub mod registry;
pub mod report;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jobfit_batch::{
    batch_id_from_file_name, discover_batch_files, load_batch_file, load_batches, scan_batches,
    BatchError, BatchFile, KeyScan, SkippedFile,
};
use jobfit_core::{DedupPolicy, SortedByCompany, UnknownDedupPolicy};
use jobfit_storage::OutputStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use engine::{master_from_batch, MergeEngine, MergeOptions, MergeOutcome, MergeStats};
pub use flatten::{count_rows, flatten_and_sort};
pub use registry::{LinkOutcome, LinkRegistry};
pub use report::{CombinedSummary, ConflictReport, RankedJob, ReportHeader};

pub const CRATE_NAME: &str = "jobfit-merge";
pub const CONFIG_FILE_NAME: &str = "jobfit.yaml";
pub const DEFAULT_INPUT_DIR: &str = "JobData/ClearanceJobs/llmIn";
pub const DEFAULT_GLOB_PATTERN: &str = "llm_data_ClearenceJobs_*.json";
pub const DEFAULT_OUTPUT_JSON: &str = "sorted_by_company.json";
pub const DEFAULT_CONFLICT_REPORT: &str = "merge_conflicts.json";
/// Always written next to the conflict report.
pub const LINK_MAP_FILE_NAME: &str = "link_map.json";
pub const DEFAULT_TOP_N: usize = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Policy(#[from] UnknownDedupPolicy),
    #[error("{var}: expected a boolean, got '{value}'")]
    Bool { var: String, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeConfig {
    pub input_dir: PathBuf,
    pub glob_pattern: String,
    pub dedup_policy: DedupPolicy,
    pub descending: bool,
    pub output_json: PathBuf,
    pub output_csv: Option<PathBuf>,
    pub output_markdown: Option<PathBuf>,
    pub parquet_dir: Option<PathBuf>,
    /// Also write each batch flattened on its own into this directory.
    pub per_file_dir: Option<PathBuf>,
    pub conflict_report: PathBuf,
    pub pretty: bool,
    pub track_provenance: bool,
    pub top_n: Option<usize>,
    pub min_score: Option<f64>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from(DEFAULT_INPUT_DIR),
            glob_pattern: DEFAULT_GLOB_PATTERN.to_string(),
            dedup_policy: DedupPolicy::HigherScore,
            descending: true,
            output_json: PathBuf::from(DEFAULT_OUTPUT_JSON),
            output_csv: None,
            output_markdown: None,
            parquet_dir: None,
            per_file_dir: None,
            conflict_report: PathBuf::from(DEFAULT_CONFLICT_REPORT),
            pretty: true,
            track_provenance: false,
            top_n: Some(DEFAULT_TOP_N),
            min_score: None,
        }
    }
}

/// On-disk shape of `jobfit.yaml`; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct MergeConfigFile {
    input_dir: Option<PathBuf>,
    glob_pattern: Option<String>,
    dedup_policy: Option<String>,
    descending: Option<bool>,
    output_json: Option<PathBuf>,
    output_csv: Option<PathBuf>,
    output_markdown: Option<PathBuf>,
    parquet_dir: Option<PathBuf>,
    per_file_dir: Option<PathBuf>,
    conflict_report: Option<PathBuf>,
    pretty: Option<bool>,
    track_provenance: Option<bool>,
    top_n: Option<usize>,
    min_score: Option<f64>,
}

impl MergeConfig {
    /// Defaults, then `jobfit.yaml` under `workspace_root` when present, then
    /// `JOBFIT_*` environment variables.
    pub fn load(workspace_root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let path = workspace_root.as_ref().join(CONFIG_FILE_NAME);
        if path.is_file() {
            config.apply_yaml_file(&path)?;
        }
        config.apply_env_from(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_yaml_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: MergeConfigFile = if text.trim().is_empty() {
            MergeConfigFile::default()
        } else {
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        };

        if let Some(v) = file.input_dir {
            self.input_dir = v;
        }
        if let Some(v) = file.glob_pattern {
            self.glob_pattern = v;
        }
        if let Some(v) = file.dedup_policy {
            self.dedup_policy = v.parse()?;
        }
        if let Some(v) = file.descending {
            self.descending = v;
        }
        if let Some(v) = file.output_json {
            self.output_json = v;
        }
        if file.output_csv.is_some() {
            self.output_csv = file.output_csv;
        }
        if file.output_markdown.is_some() {
            self.output_markdown = file.output_markdown;
        }
        if file.parquet_dir.is_some() {
            self.parquet_dir = file.parquet_dir;
        }
        if file.per_file_dir.is_some() {
            self.per_file_dir = file.per_file_dir;
        }
        if let Some(v) = file.conflict_report {
            self.conflict_report = v;
        }
        if let Some(v) = file.pretty {
            self.pretty = v;
        }
        if let Some(v) = file.track_provenance {
            self.track_provenance = v;
        }
        if file.top_n.is_some() {
            self.top_n = file.top_n;
        }
        if file.min_score.is_some() {
            self.min_score = file.min_score;
        }
        Ok(())
    }

    /// Apply `JOBFIT_*` overrides read through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("JOBFIT_INPUT_DIR") {
            self.input_dir = PathBuf::from(v);
        }
        if let Some(v) = var("JOBFIT_GLOB_PATTERN") {
            self.glob_pattern = v;
        }
        if let Some(v) = var("JOBFIT_DEDUP_POLICY") {
            self.dedup_policy = v.parse()?;
        }
        if let Some(v) = var("JOBFIT_OUTPUT_JSON") {
            self.output_json = PathBuf::from(v);
        }
        if let Some(v) = var("JOBFIT_OUTPUT_CSV") {
            self.output_csv = Some(PathBuf::from(v));
        }
        if let Some(v) = var("JOBFIT_PARQUET_DIR") {
            self.parquet_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("JOBFIT_TRACK_PROVENANCE") {
            self.track_provenance = parse_bool("JOBFIT_TRACK_PROVENANCE", &v)?;
        }
        if let Some(v) = var("JOBFIT_PRETTY") {
            self.pretty = parse_bool("JOBFIT_PRETTY", &v)?;
        }
        Ok(())
    }

    pub fn merge_options(&self) -> MergeOptions {
        MergeOptions {
            policy: self.dedup_policy,
            track_provenance: self.track_provenance,
        }
    }
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Bool {
            var: var.to_string(),
            value: value.to_string(),
        }),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub policy: DedupPolicy,
    pub stats: MergeStats,
    pub scan: KeyScan,
    pub skipped: Vec<SkippedFile>,
    pub companies: usize,
    pub rows: usize,
    pub score_conflicts: usize,
    pub link_collisions: usize,
    pub summary_path: PathBuf,
    pub conflict_report: Option<PathBuf>,
    pub link_map: Option<PathBuf>,
    pub csv: Option<PathBuf>,
    pub markdown: Option<PathBuf>,
    pub parquet_manifest: Option<PathBuf>,
    pub per_file_outputs: Vec<PathBuf>,
    /// Console summary lines honoring `top_n` and `min_score`.
    #[serde(skip)]
    pub highlights: Vec<String>,
}

pub struct MergePipeline {
    config: MergeConfig,
    store: OutputStore,
}

impl MergePipeline {
    pub fn new(config: MergeConfig) -> Self {
        let store = OutputStore::new(config.input_dir.clone());
        Self { config, store }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    pub fn store(&self) -> &OutputStore {
        &self.store
    }

    pub fn link_map_path(&self) -> PathBuf {
        let conflicts = self.store.resolve(&self.config.conflict_report);
        match conflicts.parent() {
            Some(dir) => dir.join(LINK_MAP_FILE_NAME),
            None => PathBuf::from(LINK_MAP_FILE_NAME),
        }
    }

    pub async fn run_once(&self) -> Result<MergeRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("merge_run", %run_id, policy = %self.config.dedup_policy);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<MergeRunSummary> {
        let started_at = Utc::now();
        let config = &self.config;

        let (paths, batches, skipped) =
            load_input_folder(config.input_dir.clone(), config.glob_pattern.clone()).await?;
        info!(files = paths.len(), dir = %config.input_dir.display(), "discovered batch files");

        let scan = scan_batches(&batches);
        let mut outcome = MergeEngine::new(config.merge_options()).merge_batches(&batches);
        outcome.stats.files_skipped = skipped.len();
        outcome.skipped = skipped;

        let sorted = flatten_and_sort(&outcome.master, config.descending);
        let link_collisions = outcome.link_collisions();
        let score_conflicts = outcome.conflicts.len() - link_collisions;

        let conflict_report = self
            .write_or_clear(
                self.store.resolve(&config.conflict_report),
                (!outcome.conflicts.is_empty()).then(|| ConflictReport {
                    conflicts: &outcome.conflicts,
                }),
            )
            .await;
        let link_map = self
            .write_or_clear(self.link_map_path(), (!outcome.links.is_empty()).then_some(&outcome.links))
            .await;

        let summary = CombinedSummary::new(&sorted, outcome.links.links());
        let summary_path = self
            .store
            .write_json(&config.output_json, &summary, config.pretty)
            .await
            .context("writing combined summary")?
            .path;

        let csv = match &config.output_csv {
            Some(path) => self.write_csv(path, &sorted).await?,
            None => None,
        };

        let markdown = match &config.output_markdown {
            Some(path) => {
                let header = ReportHeader {
                    run_id,
                    generated_at: Utc::now(),
                    policy: config.dedup_policy,
                    files_loaded: outcome.stats.files_loaded,
                    score_conflicts,
                    link_collisions,
                };
                let text = report::markdown_report(&header, &sorted, config.top_n, config.min_score);
                Some(
                    self.store
                        .write_atomic(path, text.as_bytes())
                        .await
                        .context("writing markdown report")?
                        .path,
                )
            }
            None => None,
        };

        let parquet_manifest = match &config.parquet_dir {
            Some(dir) => Some(
                report::export_parquet_snapshot(&self.store, dir, run_id, &sorted, outcome.links.links())
                    .await?,
            ),
            None => None,
        };

        let mut per_file_outputs = Vec::new();
        if let Some(dir) = &config.per_file_dir {
            let dir = self.store.resolve(dir);
            for batch in &batches {
                let id = batch_id_from_file_name(&batch.name, &config.glob_pattern);
                let sorted = flatten_and_sort(&master_from_batch(batch), config.descending);
                let written = self
                    .store
                    .write_json(dir.join(format!("sorted_by_company_{id}.json")), &sorted, config.pretty)
                    .await
                    .with_context(|| format!("writing per-file summary for {}", batch.name))?;
                per_file_outputs.push(written.path);
            }
        }

        let finished_at = Utc::now();
        info!(
            files_loaded = outcome.stats.files_loaded,
            files_skipped = outcome.stats.files_skipped,
            unique_keys = outcome.stats.unique_keys,
            score_conflicts,
            link_collisions,
            rows = count_rows(&sorted),
            summary = %summary_path.display(),
            "merge run completed"
        );

        Ok(MergeRunSummary {
            run_id,
            started_at,
            finished_at,
            policy: config.dedup_policy,
            companies: sorted.len(),
            rows: count_rows(&sorted),
            highlights: report::summary_lines(&sorted, config.top_n, config.min_score),
            stats: outcome.stats,
            scan,
            skipped: outcome.skipped,
            score_conflicts,
            link_collisions,
            summary_path,
            conflict_report,
            link_map,
            csv,
            markdown,
            parquet_manifest,
            per_file_outputs,
        })
    }

    /// Write `value` when there is one, otherwise remove a stale copy. Failures
    /// are logged and never abort the run.
    async fn write_or_clear<T: Serialize>(&self, path: PathBuf, value: Option<T>) -> Option<PathBuf> {
        match value {
            Some(value) => match self.store.write_json(&path, &value, self.config.pretty).await {
                Ok(written) => {
                    info!(path = %written.path.display(), unchanged = written.unchanged, "wrote audit file");
                    Some(written.path)
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %format!("{err:#}"), "failed to write audit file");
                    None
                }
            },
            None => {
                if let Err(err) = self.store.remove_stale(&path).await {
                    warn!(path = %path.display(), error = %format!("{err:#}"), "failed to remove stale audit file");
                }
                None
            }
        }
    }

    async fn write_csv(&self, path: &Path, sorted: &SortedByCompany) -> Result<Option<PathBuf>> {
        match report::csv_bytes(sorted)? {
            Some(bytes) => {
                let written = self
                    .store
                    .write_atomic(path, &bytes)
                    .await
                    .context("writing csv export")?;
                Ok(Some(written.path))
            }
            None => {
                warn!(path = %path.display(), "no rows to write to CSV");
                Ok(None)
            }
        }
    }
}

pub async fn run_merge_from_config(config: MergeConfig) -> Result<MergeRunSummary> {
    MergePipeline::new(config).run_once().await
}

#[derive(Debug, Clone)]
pub struct SortRunSummary {
    pub output: PathBuf,
    pub sorted: SortedByCompany,
}

/// Flatten and sort one already-merged master file without any dedup pass.
/// Bare output names land next to `input`.
pub async fn sort_master_file(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    descending: bool,
    pretty: bool,
) -> Result<SortRunSummary> {
    let input = input.as_ref();
    let owned = input.to_path_buf();
    let batch = tokio::task::spawn_blocking(move || load_batch_file(&owned))
        .await
        .context("batch loading task failed")??;
    let sorted = flatten_and_sort(&master_from_batch(&batch), descending);
    let root = input.parent().map(Path::to_path_buf).unwrap_or_default();
    let written = OutputStore::new(root)
        .write_json(output, &sorted, pretty)
        .await
        .context("writing sorted summary")?;
    info!(input = %input.display(), output = %written.path.display(), rows = count_rows(&sorted), "sorted master file");
    Ok(SortRunSummary {
        output: written.path,
        sorted,
    })
}

/// Discover and parse the batch files on the blocking pool.
async fn load_input_folder(
    dir: PathBuf,
    pattern: String,
) -> Result<(Vec<PathBuf>, Vec<BatchFile>, Vec<SkippedFile>)> {
    let loaded = tokio::task::spawn_blocking(move || {
        let paths = discover_batch_files(&dir, &pattern)?;
        let (batches, skipped) = load_batches(&paths);
        Ok::<_, BatchError>((paths, batches, skipped))
    })
    .await
    .context("batch loading task failed")??;
    Ok(loaded)
}

/// Key occurrence statistics over the configured batch files.
pub fn scan_input_folder(dir: impl AsRef<Path>, pattern: &str) -> Result<(KeyScan, Vec<SkippedFile>)> {
    let paths = discover_batch_files(dir, pattern)?;
    let (batches, skipped) = load_batches(&paths);
    Ok((scan_batches(&batches), skipped))
}
