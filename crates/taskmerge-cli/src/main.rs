use anyhow::Context;
use clap::{Parser, Subcommand};
use merge_engine::{FileMergePipeline, FileMergeReport, FileMergeRequest, SemanticAnalyzer};
use serde_json::Value;
use std::path::{Path, PathBuf};
use taskmerge_core::config::Settings;
use taskmerge_core::logging::init_logging;
use taskmerge_core::progress::{ProgressReporter, Stage};

#[derive(Parser)]
#[command(
    name = "taskmerge",
    about = "Semantic merging of files edited by concurrent tasks"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a settings.json file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to <dir>/taskmerge.log
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge one file; progress lines go to stdout
    Merge {
        /// Merge request JSON (file path, baseline, task edits)
        #[arg(long)]
        request: PathBuf,
        /// Write the report here instead of printing a result line
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the semantic changes between two versions of a file
    Analyze {
        /// Path used for language detection and reporting
        #[arg(long)]
        file: String,
        #[arg(long)]
        before: PathBuf,
        #[arg(long)]
        after: PathBuf,
    },
    /// List compatible change pairs and their merge strategies
    Rules,
    /// Explain the conflicts in a merge request without merging
    Explain {
        #[arg(long)]
        request: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_or_default(cli.config.as_deref())
        .with_context(|| format!("loading settings from {:?}", cli.config))?;
    let log_dir = cli.log_dir.clone().or_else(|| settings.logging.dir.clone());
    let _guard = init_logging(log_dir.as_deref(), &settings.logging.level)?;

    match &cli.command {
        Commands::Merge { request, output } => {
            cmd_merge(&settings, request, output.as_deref()).await
        }
        Commands::Analyze {
            file,
            before,
            after,
        } => cmd_analyze(&settings, file, before, after).await,
        Commands::Rules => cmd_rules(&settings),
        Commands::Explain { request } => cmd_explain(&settings, request).await,
    }
}

async fn load_request(path: &Path) -> anyhow::Result<FileMergeRequest> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading merge request {}", path.display()))?;
    let request = serde_json::from_str(&content)
        .with_context(|| format!("parsing merge request {}", path.display()))?;
    Ok(request)
}

/// The report as a single `{"type":"result",...}` line.
fn result_line(report: &FileMergeReport) -> anyhow::Result<String> {
    let mut value = serde_json::to_value(report)?;
    if let Value::Object(map) = &mut value {
        map.insert("type".into(), Value::from("result"));
    }
    Ok(serde_json::to_string(&value)?)
}

async fn cmd_merge(
    settings: &Settings,
    request_path: &Path,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let mut reporter = ProgressReporter::stdout();

    let request = match load_request(request_path).await {
        Ok(request) => request,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load merge request");
            reporter.fail(format!("{:#}", e), None)?;
            std::process::exit(1);
        }
    };

    let pipeline = FileMergePipeline::from_settings(settings);
    let report = match pipeline.run(&request, &mut reporter) {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(error = %e, file = %request.file_path, "Merge failed");
            if reporter.current_stage() != Some(Stage::Error) {
                let _ = reporter.fail(e.to_string(), None);
            }
            std::process::exit(1);
        }
    };

    match output {
        Some(path) => {
            let json = serde_json::to_string_pretty(&report)?;
            tokio::fs::write(path, json)
                .await
                .with_context(|| format!("writing report to {}", path.display()))?;
            tracing::info!(path = %path.display(), "Report written");
        }
        None => println!("{}", result_line(&report)?),
    }
    Ok(())
}

async fn cmd_analyze(
    settings: &Settings,
    file: &str,
    before: &Path,
    after: &Path,
) -> anyhow::Result<()> {
    let before = tokio::fs::read_to_string(before)
        .await
        .with_context(|| format!("reading {}", before.display()))?;
    let after = tokio::fs::read_to_string(after)
        .await
        .with_context(|| format!("reading {}", after.display()))?;

    let analyzer = SemanticAnalyzer::from_settings(&settings.analyzer);
    let analysis = analyzer.analyze_path(file, &before, &after);
    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(())
}

fn cmd_rules(settings: &Settings) -> anyhow::Result<()> {
    let pipeline = FileMergePipeline::from_settings(settings);
    let pairs = pipeline.detector().get_compatible_pairs();
    println!("{:<18} {:<18} Strategy", "Change A", "Change B");
    for (a, b, strategy) in pairs {
        println!("{:<18} {:<18} {}", a.as_str(), b.as_str(), strategy);
    }
    Ok(())
}

async fn cmd_explain(settings: &Settings, request_path: &Path) -> anyhow::Result<()> {
    let request = load_request(request_path).await?;
    let pipeline = FileMergePipeline::from_settings(settings);
    let detection = pipeline.detect(&request)?;

    if detection.conflicts.is_empty() {
        println!("No conflicts in {}", request.file_path);
        return Ok(());
    }
    for conflict in &detection.conflicts {
        println!("{}\n", pipeline.detector().explain_conflict(conflict));
    }
    Ok(())
}
