//! Prodplan CLI - ingestion and analytics core entry points

use anyhow::Result;
use clap::Parser;
use prodplan_common::config::Config;
use prodplan_common::db::{create_pool, DbConfig};
use prodplan_common::logging::{init_logging, LogConfig, LogLevel};
use prodplan_ingest::reports::ValidationStatus;
use prodplan_ingest::{feature_gates, gate, inspector::Inspector, worker, TurboIngestion};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "prodplan")]
#[command(author, version, about = "Production-planning ingestion and analytics core")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Run the full ingestion pipeline (extract, load, merge, validate)
    IngestTurbo,

    /// Profile the source workbook and write the inspection reports
    Inspector,

    /// Run the release gate; exits non-zero and writes RELEASE_BLOCKED.md on failure
    ReleaseGate,

    /// Apply migrations to head
    Migrate,

    /// Regenerate FEATURE_GATES.json from the relationships report
    EvaluateFeatureGates,

    /// Run the background maintenance worker (aggregates, partitions, backfills)
    Worker,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::from_env(default_level)?;
    init_logging(&log_config)?;

    let config = Config::load()?;

    match cli.command {
        Command::IngestTurbo => ingest_turbo(&config).await,
        Command::Inspector => {
            let inspector = Inspector::new(&config.source_path);
            inspector.generate_reports(&config.inspector_dir)?;
            Ok(())
        }
        Command::ReleaseGate => release_gate(&config).await,
        Command::Migrate => migrate(&config).await,
        Command::EvaluateFeatureGates => {
            feature_gates::evaluate_from_files(
                &config.inspector_dir.join("RELATIONSHIPS_REPORT.json"),
                &config.feature_gates_path,
            )?;
            Ok(())
        }
        Command::Worker => {
            let pool = create_pool(&DbConfig::new(&config.database_url)).await?;
            worker::run(pool, worker::WorkerConfig::default()).await
        }
    }
}

async fn ingest_turbo(config: &Config) -> Result<()> {
    let orchestrator = TurboIngestion::connect(config).await?;
    let report = orchestrator.run().await?;

    info!(
        run_id = report.run_id,
        total_processed = report.total_processed,
        total_rejected = report.total_rejected,
        idempotent = report.idempotent_hit,
        "ingestion finished"
    );

    let failed_sheets = report.load.failed_sheets + report.merge.failed_sheets;
    if failed_sheets > 0 {
        anyhow::bail!("{failed_sheets} sheet(s) failed; see ingestion_report.json");
    }
    if report.validation.status == ValidationStatus::Failed {
        anyhow::bail!("count contract violated: {}", report.validation.message);
    }
    Ok(())
}

async fn release_gate(config: &Config) -> Result<()> {
    let outcome = gate::run(config).await?;
    if outcome.is_release_ready() {
        info!(checks = outcome.passed.len(), "release gate passed");
        Ok(())
    } else {
        let names: Vec<&str> = outcome.failed.iter().map(|c| c.name.as_str()).collect();
        anyhow::bail!(
            "release gate failed ({} check(s)): {}",
            outcome.failed.len(),
            names.join(", ")
        );
    }
}

async fn migrate(config: &Config) -> Result<()> {
    let pool = create_pool(&DbConfig::new(&config.database_url)).await?;
    sqlx::migrate!("../../migrations").run(&pool).await?;
    info!("migrations applied to head");
    Ok(())
}
