//! Output formats for the merged, sorted dataset. Pure formatting plus the
//! snapshot export; file placement goes through [`OutputStore`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use jobfit_batch::SummaryFile;
use jobfit_core::{parse_score, ConflictRecord, DedupPolicy, LinkOwner, RoleRow, SortedByCompany};
use jobfit_storage::OutputStore;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const ROLE_ROWS_PARQUET: &str = "role_rows.parquet";
pub const LINK_MAP_PARQUET: &str = "link_map.parquet";
pub const SNAPSHOT_MANIFEST: &str = "manifest.json";

/// Combined summary as written to disk: the plain `company -> rows` mapping,
/// or wrapped together with the link map when any link was registered.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum CombinedSummary<'a> {
    Plain(&'a SortedByCompany),
    WithLinks {
        by_company: &'a SortedByCompany,
        link_map: &'a IndexMap<String, LinkOwner>,
    },
}

impl<'a> CombinedSummary<'a> {
    pub fn new(by_company: &'a SortedByCompany, link_map: &'a IndexMap<String, LinkOwner>) -> Self {
        if link_map.is_empty() {
            Self::Plain(by_company)
        } else {
            Self::WithLinks {
                by_company,
                link_map,
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConflictReport<'a> {
    pub conflicts: &'a [ConflictRecord],
}

/// CSV export of every row, or `None` when there is nothing to write.
pub fn csv_bytes(sorted: &SortedByCompany) -> Result<Option<Vec<u8>>> {
    if sorted.values().all(Vec::is_empty) {
        return Ok(None);
    }
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(["company", "role_name", "score", "fit_reason", "missing_skills", "link"])
        .context("writing csv header")?;
    for row in sorted.values().flatten() {
        let skills = serde_json::to_string(row.missing_skills.as_deref().unwrap_or_default())
            .context("encoding missing_skills")?;
        let score = format_score(row.score);
        writer
            .write_record([
                row.company.as_str(),
                row.role_name.as_str(),
                score.as_str(),
                row.fit_reason.as_deref().unwrap_or_default(),
                skills.as_str(),
                row.link.as_deref().unwrap_or_default(),
            ])
            .with_context(|| format!("writing csv row for {} / {}", row.company, row.role_name))?;
    }
    let bytes = writer.into_inner().context("flushing csv output")?;
    Ok(Some(bytes))
}

fn format_score(score: f64) -> String {
    if score.fract() == 0.0 && score.abs() < 1e15 {
        format!("{score:.1}")
    } else {
        score.to_string()
    }
}

/// Up to `top_n` rows at or above `min_score`, in their sorted order.
pub fn select_rows(rows: &[RoleRow], top_n: Option<usize>, min_score: Option<f64>) -> Vec<&RoleRow> {
    rows.iter()
        .filter(|row| min_score.map_or(true, |min| row.score >= min))
        .take(top_n.unwrap_or(usize::MAX))
        .collect()
}

/// Console summary: totals first, then each company that still has rows
/// after `top_n` and `min_score` are applied.
pub fn summary_lines(sorted: &SortedByCompany, top_n: Option<usize>, min_score: Option<f64>) -> Vec<String> {
    let total_roles: usize = sorted.values().map(Vec::len).sum();
    let mut lines = vec![format!("Companies: {}, Roles: {}", sorted.len(), total_roles)];
    for (company, rows) in sorted {
        let shown = select_rows(rows, top_n, min_score);
        if shown.is_empty() {
            continue;
        }
        lines.push(String::new());
        lines.push(format!("{company} ({} roles shown)", shown.len()));
        for row in shown {
            lines.push(format!(
                "  - {} | score: {:.1} | link: {}",
                row.role_name,
                row.score,
                row.link.as_deref().unwrap_or("n/a")
            ));
        }
    }
    lines
}

#[derive(Debug, Clone)]
pub struct ReportHeader {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub policy: DedupPolicy,
    pub files_loaded: usize,
    pub score_conflicts: usize,
    pub link_collisions: usize,
}

pub fn markdown_report(
    header: &ReportHeader,
    sorted: &SortedByCompany,
    top_n: Option<usize>,
    min_score: Option<f64>,
) -> String {
    let mut lines = vec![
        "# Job Fit Report".to_string(),
        String::new(),
        format!("- Run ID: `{}`", header.run_id),
        format!("- Generated: {}", header.generated_at.to_rfc3339()),
        format!("- Dedup policy: `{}`", header.policy),
        format!("- Batch files merged: {}", header.files_loaded),
        format!("- Score conflicts: {}", header.score_conflicts),
        format!("- Link collisions: {}", header.link_collisions),
    ];
    for (company, rows) in sorted {
        let shown = select_rows(rows, top_n, min_score);
        if shown.is_empty() {
            continue;
        }
        lines.push(String::new());
        lines.push(format!("## {}", md_cell(company)));
        lines.push(String::new());
        lines.push("| Score | Role | Link | Missing skills |".to_string());
        lines.push("|---:|---|---|---|".to_string());
        for row in shown {
            let skills = row.missing_skills.as_deref().unwrap_or_default().join(", ");
            lines.push(format!(
                "| {:.1} | {} | {} | {} |",
                row.score,
                md_cell(&row.role_name),
                md_cell(row.link.as_deref().unwrap_or("")),
                md_cell(&skills)
            ));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

fn md_cell(text: &str) -> String {
    text.replace('|', "\\|").replace(['\r', '\n'], " ")
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `role_rows.parquet`, `link_map.parquet` and a sha256 manifest into
/// `dir`. Returns the manifest path.
pub async fn export_parquet_snapshot(
    store: &OutputStore,
    dir: impl AsRef<Path>,
    run_id: Uuid,
    sorted: &SortedByCompany,
    link_map: &IndexMap<String, LinkOwner>,
) -> Result<PathBuf> {
    let dir = store.resolve(dir);
    let mut files = Vec::new();
    for (name, file_name, batch) in [
        ("role_rows", ROLE_ROWS_PARQUET, role_rows_batch(sorted)?),
        ("link_map", LINK_MAP_PARQUET, link_map_batch(link_map)?),
    ] {
        let bytes = parquet_bytes(&batch).with_context(|| format!("encoding {file_name}"))?;
        let written = store.write_atomic(dir.join(file_name), &bytes).await?;
        files.push(SnapshotManifestFile {
            name: name.to_string(),
            path: file_name.to_string(),
            sha256: written.sha256,
            bytes: written.byte_size as u64,
        });
    }

    let manifest = SnapshotManifest {
        schema_version: 1,
        run_id,
        files,
    };
    let written = store
        .write_json(dir.join(SNAPSHOT_MANIFEST), &manifest, true)
        .await
        .context("writing parquet manifest")?;
    Ok(written.path)
}

fn parquet_bytes(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)
        .context("opening parquet writer")?;
    writer.write(batch).context("writing record batch")?;
    writer.into_inner().context("closing parquet writer")
}

fn role_rows_batch(sorted: &SortedByCompany) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("company", DataType::Utf8, false),
        ArrowField::new("role_name", DataType::Utf8, false),
        ArrowField::new("score", DataType::Float64, false),
        ArrowField::new("fit_reason", DataType::Utf8, true),
        ArrowField::new("missing_skills", DataType::Utf8, true),
        ArrowField::new("link", DataType::Utf8, true),
        ArrowField::new("chosen_by", DataType::Utf8, true),
        ArrowField::new("link_conflict", DataType::Boolean, false),
    ]));

    let rows = sorted.values().flatten().collect::<Vec<_>>();
    let companies = StringArray::from(rows.iter().map(|r| Some(r.company.as_str())).collect::<Vec<_>>());
    let roles = StringArray::from(rows.iter().map(|r| Some(r.role_name.as_str())).collect::<Vec<_>>());
    let scores = Float64Array::from(rows.iter().map(|r| r.score).collect::<Vec<_>>());
    let reasons = StringArray::from(rows.iter().map(|r| r.fit_reason.as_deref()).collect::<Vec<_>>());
    let skills = StringArray::from(
        rows.iter()
            .map(|r| {
                r.missing_skills
                    .as_ref()
                    .and_then(|skills| serde_json::to_string(skills).ok())
            })
            .collect::<Vec<_>>(),
    );
    let links = StringArray::from(rows.iter().map(|r| r.link.as_deref()).collect::<Vec<_>>());
    let chosen_by = StringArray::from(
        rows.iter()
            .map(|r| {
                r.chosen_by.and_then(|c| match serde_json::to_value(c) {
                    Ok(JsonValue::String(s)) => Some(s),
                    _ => None,
                })
            })
            .collect::<Vec<_>>(),
    );
    let conflicts = BooleanArray::from(rows.iter().map(|r| r.link_conflict).collect::<Vec<_>>());

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(companies),
            Arc::new(roles),
            Arc::new(scores),
            Arc::new(reasons),
            Arc::new(skills),
            Arc::new(links),
            Arc::new(chosen_by),
            Arc::new(conflicts),
        ],
    )
    .context("building role_rows record batch")
}

fn link_map_batch(link_map: &IndexMap<String, LinkOwner>) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("link", DataType::Utf8, false),
        ArrowField::new("company", DataType::Utf8, false),
        ArrowField::new("role", DataType::Utf8, false),
        ArrowField::new("file", DataType::Utf8, false),
        ArrowField::new("first_seen_at", DataType::Utf8, false),
    ]));

    let links = StringArray::from(link_map.keys().map(|k| Some(k.as_str())).collect::<Vec<_>>());
    let companies = StringArray::from(link_map.values().map(|o| Some(o.company.as_str())).collect::<Vec<_>>());
    let roles = StringArray::from(link_map.values().map(|o| Some(o.role.as_str())).collect::<Vec<_>>());
    let files = StringArray::from(link_map.values().map(|o| Some(o.file.as_str())).collect::<Vec<_>>());
    let seen = StringArray::from(
        link_map
            .values()
            .map(|o| Some(o.timestamp.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(links),
            Arc::new(companies),
            Arc::new(roles),
            Arc::new(files),
            Arc::new(seen),
        ],
    )
    .context("building link_map record batch")
}

/// One line of the cross-company ranking built from a combined summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedJob {
    pub score: i64,
    pub company: String,
    pub role_name: Option<String>,
    pub location: Option<String>,
    pub link: Option<String>,
}

/// Flatten every company of a summary into one list, highest score first and
/// company name ascending among equal scores. Unparseable scores count as 0.
pub fn ranked_jobs(summary: &SummaryFile) -> Vec<RankedJob> {
    let mut jobs = Vec::new();
    for (company, rows) in &summary.by_company {
        for row in rows {
            let JsonValue::Object(row) = row else {
                continue;
            };
            if row.is_empty() {
                continue;
            }
            let score = row.get("score").and_then(parse_score).unwrap_or(0.0);
            jobs.push(RankedJob {
                score: score as i64,
                company: text_field(row.get("company")).unwrap_or_else(|| company.clone()),
                role_name: text_field(row.get("role_name")),
                location: text_field(row.get("location")),
                link: text_field(row.get("link")),
            });
        }
    }
    jobs.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.company.cmp(&b.company)));
    jobs
}

fn text_field(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Fixed-width text table of the first `limit` ranked jobs.
pub fn render_ranked_table(jobs: &[RankedJob], limit: Option<usize>) -> String {
    const HEADERS: [&str; 5] = ["score", "company", "role_name", "location", "link"];
    let cells = jobs
        .iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(|job| {
            [
                job.score.to_string(),
                job.company.clone(),
                job.role_name.clone().unwrap_or_default(),
                job.location.clone().unwrap_or_default(),
                job.link.clone().unwrap_or_default(),
            ]
        })
        .collect::<Vec<_>>();

    let mut widths = HEADERS.map(str::len);
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let render = |row: &[String]| {
        row.iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };
    let mut lines = vec![render(&HEADERS.map(String::from))];
    lines.extend(cells.iter().map(|row| render(row)));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jobfit_core::JobRecord;
    use serde_json::json;

    fn row(company: &str, role: &str, score: f64, extra: JsonValue) -> RoleRow {
        let record = JobRecord::from_json_value(extra).unwrap();
        RoleRow::from_record(company, role, score, &record)
    }

    fn sample() -> SortedByCompany {
        let mut sorted = SortedByCompany::new();
        sorted.insert(
            "Acme".to_string(),
            vec![
                row("Acme", "Eng | Lead", 92.0, json!({"link": "http://x/1", "missing_skills": ["Go", "K8s"]})),
                row("Acme", "Analyst", 85.5, json!({"fit_reason": "solid"})),
            ],
        );
        sorted.insert("Quiet Co".to_string(), Vec::new());
        sorted
    }

    fn owner() -> LinkOwner {
        LinkOwner {
            company: "Acme".into(),
            role: "Eng | Lead".into(),
            file: "a.json".into(),
            timestamp: Utc.with_ymd_and_hms(2025, 11, 3, 9, 30, 0).single().unwrap(),
        }
    }

    #[test]
    fn combined_summary_wraps_only_with_links() {
        let sorted = sample();
        let empty = IndexMap::new();
        let plain = serde_json::to_value(CombinedSummary::new(&sorted, &empty)).unwrap();
        assert!(plain.get("Acme").is_some());
        assert!(plain.get("by_company").is_none());

        let mut links = IndexMap::new();
        links.insert("http://x/1".to_string(), owner());
        let wrapped = serde_json::to_value(CombinedSummary::new(&sorted, &links)).unwrap();
        assert_eq!(wrapped["by_company"]["Acme"][0]["score"], 92.0);
        assert_eq!(wrapped["link_map"]["http://x/1"]["company"], "Acme");
        assert_eq!(wrapped["by_company"]["Quiet Co"], json!([]));
    }

    #[test]
    fn csv_has_fixed_columns_and_json_skills() {
        let bytes = csv_bytes(&sample()).unwrap().expect("rows present");
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "company,role_name,score,fit_reason,missing_skills,link");
        assert_eq!(lines[1], r#"Acme,Eng | Lead,92.0,,"[""Go"",""K8s""]",http://x/1"#);
        assert_eq!(lines[2], "Acme,Analyst,85.5,solid,[],");
    }

    #[test]
    fn csv_skips_empty_datasets() {
        let mut sorted = SortedByCompany::new();
        sorted.insert("Quiet Co".to_string(), Vec::new());
        assert!(csv_bytes(&sorted).unwrap().is_none());
    }

    #[test]
    fn selection_honors_top_n_and_min_score() {
        let sorted = sample();
        assert_eq!(select_rows(&sorted["Acme"], Some(1), None).len(), 1);
        assert_eq!(select_rows(&sorted["Acme"], None, Some(90.0)).len(), 1);
        assert_eq!(select_rows(&sorted["Acme"], None, None).len(), 2);

        let lines = summary_lines(&sorted, Some(5), Some(90.0));
        assert_eq!(lines[0], "Companies: 2, Roles: 2");
        assert!(lines.iter().any(|l| l == "Acme (1 roles shown)"));
        assert!(!lines.iter().any(|l| l.starts_with("Quiet Co")));
    }

    #[test]
    fn markdown_escapes_pipes() {
        let header = ReportHeader {
            run_id: Uuid::nil(),
            generated_at: Utc.with_ymd_and_hms(2025, 11, 3, 10, 0, 0).single().unwrap(),
            policy: DedupPolicy::HigherScore,
            files_loaded: 3,
            score_conflicts: 1,
            link_collisions: 0,
        };
        let md = markdown_report(&header, &sample(), Some(5), None);
        assert!(md.starts_with("# Job Fit Report"));
        assert!(md.contains("- Dedup policy: `higher_score`"));
        assert!(md.contains("| 92.0 | Eng \\| Lead | http://x/1 | Go, K8s |"));
        assert!(!md.contains("## Quiet Co"));
    }

    #[test]
    fn ranked_jobs_sort_by_score_then_company() {
        let mut summary = SummaryFile::default();
        summary.by_company.insert(
            "Zeta".to_string(),
            vec![json!({"score": 90.7, "role_name": "Z1", "location": "Remote"})],
        );
        summary.by_company.insert(
            "Acme".to_string(),
            vec![
                json!({"score": "90", "role_name": "A1", "link": "http://x/1"}),
                json!({"score": "n/a", "role_name": "A2"}),
                json!({}),
                json!("junk"),
            ],
        );
        let jobs = ranked_jobs(&summary);
        let order: Vec<_> = jobs.iter().map(|j| (j.score, j.company.as_str())).collect();
        assert_eq!(order, vec![(90, "Acme"), (90, "Zeta"), (0, "Acme")]);

        let table = render_ranked_table(&jobs, Some(2));
        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("score  company  role_name"));
        assert!(lines[2].contains("Remote"));
    }

    #[tokio::test]
    async fn parquet_snapshot_writes_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let store = OutputStore::new(dir.path());
        let mut links = IndexMap::new();
        links.insert("http://x/1".to_string(), owner());

        let manifest_path = export_parquet_snapshot(&store, "snapshots", Uuid::nil(), &sample(), &links)
            .await
            .unwrap();
        assert_eq!(manifest_path, dir.path().join("snapshots").join(SNAPSHOT_MANIFEST));

        let manifest: JsonValue =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        let files = manifest["files"].as_array().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0]["path"], ROLE_ROWS_PARQUET);
        assert_eq!(files[0]["sha256"].as_str().unwrap().len(), 64);
        let parquet = std::fs::read(dir.path().join("snapshots").join(ROLE_ROWS_PARQUET)).unwrap();
        assert_eq!(&parquet[..4], b"PAR1");
    }
}
