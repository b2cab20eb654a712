//! Diagnostic command line for nzb-triage.
//!
//! Reads settings from the `NZB_TRIAGE_*` environment (a `.env` file is honoured).

use clap::{Parser, Subcommand};
use nzb_triage::{
    ArchiveFinding, CandidateRunner, Config, Decision, RawSearchResult, TriageConfig,
    TriageEngine, TriageMetrics, TriageOutcome,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const MAX_LISTED_FINDINGS: usize = 10;
const PRE_WARM_SESSIONS: usize = 4;

#[derive(Parser)]
#[command(name = "nzb-triage", version, about = "Usenet NZB availability triage")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Triage every .nzb file in a directory
    Triage {
        /// Directory holding the manifests
        #[arg(default_value = "nzbs")]
        dir: PathBuf,

        /// Run the same batch several times over one shared connection pool
        #[arg(long, default_value_t = 1, env = "NZB_TRIAGE_REPEAT")]
        repeat: usize,
    },
    /// Rank and triage a JSON array of search results
    Rank {
        /// File holding the search results
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Triage { dir, repeat } => triage_dir(&dir, repeat).await,
        Command::Rank { file } => rank_file(&file).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config() -> Result<Config, Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    config.validate()?;
    Ok(config)
}

async fn triage_dir(dir: &Path, repeat: usize) -> Result<(), Box<dyn std::error::Error>> {
    if !dir.is_dir() {
        return Err(format!("expected nzb folder at {}, but it was not found", dir.display()).into());
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("nzb"))
        })
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(format!("no .nzb files found in {}", dir.display()).into());
    }

    let payloads = files
        .iter()
        .map(std::fs::read)
        .collect::<Result<Vec<_>, _>>()?;
    let names: Vec<String> = files
        .iter()
        .map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default())
        .collect();

    let config = load_config()?;
    let repeat = repeat.max(1);
    let mut triage = config.runner.triage;
    if repeat > 1 {
        triage.reuse_pool = true;
    }

    let engine = engine_with_shared_pool(triage);

    for run in 0..repeat {
        if repeat > 1 {
            println!("\nRun {} / {}", run + 1, repeat);
        }

        let summary = match engine.triage(&payloads).await {
            TriageOutcome::Completed(summary) => summary,
            TriageOutcome::TimedOut => {
                println!("triage timed out after {:?}", engine.config().health_check_timeout);
                continue;
            }
        };

        for (index, name) in names.iter().enumerate() {
            match summary.decision(index) {
                Some(decision) => println!("{}", format_decision_row(name, decision)),
                None => println!("NZB: {} | decision: not-evaluated", name),
            }
        }

        println!("\nSummary:");
        println!("  accepted: {}", summary.accepted);
        println!("  rejected: {}", summary.rejected);
        println!("  processed: {} / {}", summary.decisions.len(), names.len());
        println!("  elapsed: {} ms", summary.elapsed.as_millis());
        print_counts("blockers", &summary.blocker_counts);
        print_counts("warnings", &summary.warning_counts);
        print_metrics(&summary.metrics);
    }

    if let Some(pool) = engine.shared_pool() {
        pool.close_all().await;
    }
    Ok(())
}

async fn rank_file(file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let raw = std::fs::read(file)?;
    let results: Vec<RawSearchResult> = serde_json::from_slice(&raw)?;

    let config = load_config()?;
    let engine = Arc::new(engine_with_shared_pool(config.runner.triage.clone()));

    let runner = CandidateRunner::with_http_fetcher(config.runner, Arc::clone(&engine))?;
    let report = runner.run(&results).await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(pool) = engine.shared_pool() {
        pool.close_all().await;
    }
    Ok(())
}

/// Attach a shared pool when reuse is on and start opening sessions while the
/// manifests are still being read or downloaded
fn engine_with_shared_pool(config: TriageConfig) -> TriageEngine {
    let engine = TriageEngine::from_config(config);
    if !engine.config().reuse_pool {
        return engine;
    }
    match engine.build_shared_pool() {
        Some(pool) => {
            pool.spawn_pre_warm(engine.config().max_connections.min(PRE_WARM_SESSIONS));
            engine.with_shared_pool(pool)
        }
        None => engine,
    }
}

fn format_decision_row(name: &str, decision: &Decision) -> String {
    let join = |items: Vec<&str>| {
        if items.is_empty() {
            "none".to_string()
        } else {
            items.join(", ")
        }
    };
    let file_count = decision
        .file_count
        .map_or_else(|| "-".to_string(), |n| n.to_string());
    [
        format!("NZB: {}", name),
        format!("title: {}", decision.nzb_title.as_deref().unwrap_or("(no title)")),
        format!("decision: {}", decision.decision.as_str()),
        format!("status: {}", decision.status()),
        format!("files: {}", file_count),
        format!("blockers: {}", join(decision.blockers.iter().map(|b| b.as_str()).collect())),
        format!("warnings: {}", join(decision.warnings.iter().map(|w| w.as_str()).collect())),
        format!("archives: {}", summarize_findings(&decision.archive_findings)),
    ]
    .join(" | ")
}

fn summarize_findings(findings: &[ArchiveFinding]) -> String {
    if findings.is_empty() {
        return "none".to_string();
    }
    let positive = findings.iter().filter(|f| f.status.is_positive()).count();
    let listed = findings
        .iter()
        .take(MAX_LISTED_FINDINGS)
        .map(|f| format!("{}:{}", f.filename.as_deref().unwrap_or(&f.subject), f.status.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    let more = if findings.len() > MAX_LISTED_FINDINGS { ", ..." } else { "" };
    format!("ok {}/{} [{}{}]", positive, findings.len(), listed, more)
}

fn print_counts(label: &str, counts: &BTreeMap<String, usize>) {
    if counts.is_empty() {
        println!("  {}: none", label);
        return;
    }
    println!("  {}:", label);
    let mut entries: Vec<_> = counts.iter().collect();
    entries.sort_by(|a, b| b.1.cmp(a.1));
    for (flag, count) in entries {
        println!("    {}: {}", flag, count);
    }
}

fn print_metrics(metrics: &TriageMetrics) {
    println!("  nntp-calls:");
    println!(
        "    stat: {} (ok {}, missing {}, other {}) avg {} ms",
        metrics.stat_calls,
        metrics.stat_successes,
        metrics.stat_missing,
        metrics.stat_errors,
        metrics.avg_stat_ms()
    );
    println!(
        "    body: {} (ok {}, missing {}, other {}) avg {} ms, {} bytes read, {} decoded",
        metrics.body_calls,
        metrics.body_successes,
        metrics.body_missing,
        metrics.body_errors,
        metrics.avg_body_ms(),
        metrics.body_bytes,
        metrics.decoded_bytes
    );
    println!(
        "  pool: created {}, reused {}, closed {}, acquisitions {}",
        metrics.pool_creates, metrics.pool_reuses, metrics.pool_closes, metrics.client_acquisitions
    );
    println!(
        "  pool-totals: created {}, reused {}, closed {}",
        metrics.pool_totals.created, metrics.pool_totals.reused, metrics.pool_totals.closed
    );
}
