//! Prodplan Ingestion & Analytics Core
//!
//! Three tightly coupled subsystems over a partitioned PostgreSQL store:
//!
//! 1. **Turbo ingestion pipeline** - Extract (workbook -> CSV.gz) -> Load
//!    (COPY into UNLOGGED text staging) -> Merge (typed upsert with per-row
//!    reject classification), idempotent by source checksum.
//! 2. **Incremental aggregate engine** - watermark-driven daily aggregates
//!    with monoid combine rules, plus a full-recompute WIP snapshot.
//! 3. **Data contract + release gate** - count reconciliation per sheet and
//!    a composite gate that refuses promotion on any contract breach.
//!
//! # Example
//!
//! ```no_run
//! use prodplan_ingest::orchestrator::TurboIngestion;
//! use prodplan_common::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let orchestrator = TurboIngestion::connect(&config).await?;
//!     let report = orchestrator.run().await?;
//!     tracing::info!(run_id = report.run_id, "ingestion finished");
//!     Ok(())
//! }
//! ```

pub mod aggregates;
pub mod derived;
pub mod extract;
pub mod feature_gates;
pub mod gate;
pub mod inspector;
pub mod load;
pub mod lock;
pub mod merge;
pub mod orchestrator;
pub mod partitions;
pub mod reports;
pub mod sheets;
pub mod validate;
pub mod worker;

pub use orchestrator::TurboIngestion;
