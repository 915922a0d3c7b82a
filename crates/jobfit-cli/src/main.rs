use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use jobfit_core::DedupPolicy;
use jobfit_merge::{report, MergeConfig, DEFAULT_OUTPUT_JSON};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "jobfit-cli")]
#[command(about = "Merge, dedup and rank LLM job-fit batch results")]
struct Cli {
    /// Directory searched for jobfit.yaml.
    #[arg(long, global = true, default_value = ".")]
    workspace_root: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge every matching batch file into one sorted summary (default).
    Merge(MergeArgs),
    /// Flatten and sort a single master JSON without merging.
    Sort(SortArgs),
    /// Count (company, role) occurrences across batch files.
    Scan(ScanArgs),
    /// Ranked table over a combined summary file.
    Report(ReportArgs),
}

#[derive(Debug, Default, Args)]
struct MergeArgs {
    #[arg(long)]
    input_folder: Option<PathBuf>,
    #[arg(long)]
    glob_pattern: Option<String>,
    /// latest | higher_score
    #[arg(long)]
    dedup_policy: Option<DedupPolicy>,
    #[arg(long)]
    output_json: Option<PathBuf>,
    #[arg(long)]
    output_csv: Option<PathBuf>,
    #[arg(long)]
    output_markdown: Option<PathBuf>,
    #[arg(long)]
    parquet_dir: Option<PathBuf>,
    /// Also write sorted_by_company_<batch>.json per input file here.
    #[arg(long)]
    per_file_dir: Option<PathBuf>,
    #[arg(long)]
    conflict_report: Option<PathBuf>,
    #[arg(long)]
    ascending: bool,
    #[arg(long)]
    no_pretty: bool,
    /// Record every occurrence of each key on the stored record.
    #[arg(long)]
    provenance: bool,
    #[arg(long)]
    top_n: Option<usize>,
    #[arg(long)]
    min_score: Option<f64>,
}

impl MergeArgs {
    fn apply(self, config: &mut MergeConfig) {
        if let Some(v) = self.input_folder {
            config.input_dir = v;
        }
        if let Some(v) = self.glob_pattern {
            config.glob_pattern = v;
        }
        if let Some(v) = self.dedup_policy {
            config.dedup_policy = v;
        }
        if let Some(v) = self.output_json {
            config.output_json = v;
        }
        if let Some(v) = self.conflict_report {
            config.conflict_report = v;
        }
        config.output_csv = self.output_csv.or(config.output_csv.take());
        config.output_markdown = self.output_markdown.or(config.output_markdown.take());
        config.parquet_dir = self.parquet_dir.or(config.parquet_dir.take());
        config.per_file_dir = self.per_file_dir.or(config.per_file_dir.take());
        if self.ascending {
            config.descending = false;
        }
        if self.no_pretty {
            config.pretty = false;
        }
        if self.provenance {
            config.track_provenance = true;
        }
        if self.top_n.is_some() {
            config.top_n = self.top_n;
        }
        if self.min_score.is_some() {
            config.min_score = self.min_score;
        }
    }
}

#[derive(Debug, Args)]
struct SortArgs {
    #[arg(long, short = 'i')]
    input: PathBuf,
    #[arg(long, default_value = DEFAULT_OUTPUT_JSON)]
    output_json: PathBuf,
    #[arg(long)]
    ascending: bool,
    #[arg(long)]
    no_pretty: bool,
    #[arg(long, default_value_t = jobfit_merge::DEFAULT_TOP_N)]
    top_n: usize,
    #[arg(long)]
    min_score: Option<f64>,
}

#[derive(Debug, Args)]
struct ScanArgs {
    #[arg(long)]
    input_folder: Option<PathBuf>,
    #[arg(long)]
    glob_pattern: Option<String>,
    /// Duplicate keys to list.
    #[arg(long, default_value_t = 10)]
    top: usize,
}

#[derive(Debug, Args)]
struct ReportArgs {
    #[arg(long)]
    summary: PathBuf,
    #[arg(long)]
    limit: Option<usize>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command.unwrap_or(Commands::Merge(MergeArgs::default())) {
        Commands::Merge(args) => {
            let mut config = MergeConfig::load(&cli.workspace_root).context("loading configuration")?;
            args.apply(&mut config);
            info!(input = %config.input_dir.display(), policy = %config.dedup_policy, "starting merge");

            let summary = jobfit_merge::run_merge_from_config(config).await?;
            println!(
                "merge complete: run_id={} files={} skipped={} entries={} unique_keys={} duplicate_keys={}",
                summary.run_id,
                summary.stats.files_loaded,
                summary.stats.files_skipped,
                summary.scan.total_role_entries,
                summary.scan.unique_keys,
                summary.scan.duplicates.len()
            );
            println!(
                "conflicts: score={} link={} summary={}",
                summary.score_conflicts,
                summary.link_collisions,
                summary.summary_path.display()
            );
            for path in [
                &summary.conflict_report,
                &summary.link_map,
                &summary.csv,
                &summary.markdown,
                &summary.parquet_manifest,
            ]
            .into_iter()
            .flatten()
            {
                println!("wrote {}", path.display());
            }
            for line in &summary.highlights {
                println!("{line}");
            }
        }
        Commands::Sort(args) => {
            let result = jobfit_merge::sort_master_file(
                &args.input,
                &args.output_json,
                !args.ascending,
                !args.no_pretty,
            )
            .await?;
            println!("sorted summary written to {}", result.output.display());
            for line in report::summary_lines(&result.sorted, Some(args.top_n), args.min_score) {
                println!("{line}");
            }
        }
        Commands::Scan(args) => {
            let config = MergeConfig::load(&cli.workspace_root).context("loading configuration")?;
            let dir = args.input_folder.unwrap_or(config.input_dir);
            let pattern = args.glob_pattern.unwrap_or(config.glob_pattern);
            let (scan, skipped) = jobfit_merge::scan_input_folder(&dir, &pattern)?;
            println!(
                "files={} skipped={} entries={} unique_keys={}",
                scan.files_scanned,
                skipped.len(),
                scan.total_role_entries,
                scan.unique_keys
            );
            for dup in scan.duplicates.iter().take(args.top) {
                println!("  {:>4}  {} / {}", dup.count, dup.company, dup.role);
            }
        }
        Commands::Report(args) => {
            let summary = jobfit_batch::load_summary_file(&args.summary)?;
            let jobs = report::ranked_jobs(&summary);
            if jobs.is_empty() {
                println!("no job rows found in {}", args.summary.display());
            } else {
                println!("{}", report::render_ranked_table(&jobs, args.limit));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn merge_flags_override_loaded_config() {
        let cli = Cli::try_parse_from([
            "jobfit-cli",
            "merge",
            "--dedup-policy",
            "latest",
            "--ascending",
            "--no-pretty",
            "--top-n",
            "3",
        ])
        .unwrap();
        let Some(Commands::Merge(args)) = cli.command else {
            panic!("expected merge");
        };
        let mut config = MergeConfig {
            output_csv: Some(PathBuf::from("from_yaml.csv")),
            ..MergeConfig::default()
        };
        args.apply(&mut config);
        assert_eq!(config.dedup_policy, DedupPolicy::Latest);
        assert!(!config.descending);
        assert!(!config.pretty);
        assert_eq!(config.top_n, Some(3));
        assert_eq!(config.output_csv, Some(PathBuf::from("from_yaml.csv")));
    }

    #[test]
    fn unknown_policy_is_rejected_at_parse_time() {
        let err = Cli::try_parse_from(["jobfit-cli", "merge", "--dedup-policy", "newest"]).unwrap_err();
        assert!(err.to_string().contains("newest"));
    }

    #[test]
    fn no_subcommand_means_merge() {
        let cli = Cli::try_parse_from(["jobfit-cli"]).unwrap();
        assert!(cli.command.is_none());
    }
}
