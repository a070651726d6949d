//! Turbo ingestion orchestrator: Extract -> Load -> Merge -> Derived ->
//! Validate -> cache bump -> initial aggregates, under the distributed
//! ingestion lock, idempotent by source checksum.

use crate::aggregates::{IncrementalAggregates, DEFAULT_WINDOW_DAYS};
use crate::derived;
use crate::extract::SheetExtractor;
use crate::load::StagingLoader;
use crate::lock::IngestionLock;
use crate::merge::CoreMerger;
use crate::reports::{
    write_json, ExtractionReport, IngestionReport, LoadReport, MergeReport, SheetStatus,
    ValidationStatus, ValidationSummary,
};
use crate::sheets::SHEETS;
use crate::validate::{write_critical_mismatches, CountValidator};
use anyhow::{Context, Result};
use prodplan_common::config::Config;
use prodplan_common::db::{create_pool, DbConfig};
use sqlx::PgPool;
use std::time::Instant;
use tracing::{error, info, warn};

/// Orchestrates one ingestion invocation end to end.
pub struct TurboIngestion {
    pool: PgPool,
    config: Config,
}

impl TurboIngestion {
    /// Connect the orchestrator to the store.
    pub async fn connect(config: &Config) -> Result<Self> {
        let pool = create_pool(&DbConfig::new(&config.database_url)).await?;
        Ok(Self {
            pool,
            config: config.clone(),
        })
    }

    pub fn with_pool(pool: PgPool, config: Config) -> Self {
        Self { pool, config }
    }

    /// Run the full pipeline under the ingestion lock.
    pub async fn run(&self) -> Result<IngestionReport> {
        let mut lock = IngestionLock::connect(self.config.redis_url.as_deref()).await;
        lock.acquire().await?;
        let result = self.run_locked().await;
        lock.release().await;
        result
    }

    async fn run_locked(&self) -> Result<IngestionReport> {
        let started = Instant::now();

        // PHASE 1: EXTRACT (run-fatal on failure; nothing written yet)
        info!("starting EXTRACT phase");
        let extractor = SheetExtractor::new(&self.config.source_path, &self.config.processed_dir);
        let extraction = extractor.extract_all().context("extract stage failed")?;
        write_json(
            &self.config.processed_dir.join("extraction_report.json"),
            &extraction,
        )?;

        // Idempotency: a completed run with the same source hash short-circuits
        if let Some(run_id) = self.find_completed_run(&extraction.source_sha256).await? {
            info!(run_id, checksum = %extraction.source_sha256, "idempotent run detected");
            let report = IngestionReport {
                run_id,
                source_sha256: extraction.source_sha256.clone(),
                idempotent_hit: true,
                total_processed: 0,
                total_rejected: 0,
                elapsed_seconds: started.elapsed().as_secs_f64(),
                extraction,
                load: LoadReport::default(),
                merge: MergeReport::default(),
                validation: ValidationSummary {
                    status: ValidationStatus::Passed,
                    message: "source already ingested by a completed run".to_string(),
                },
            };
            write_json(
                &self.config.processed_dir.join("ingestion_report.json"),
                &report,
            )?;
            return Ok(report);
        }

        let run_id = self.create_run(&extraction.source_sha256).await?;
        info!(run_id, checksum = %extraction.source_sha256, "ingestion run created");

        match self.run_stages(run_id, &extraction, started).await {
            Ok(report) => Ok(report),
            Err(e) => {
                let merger = CoreMerger::new(self.pool.clone(), run_id);
                merger
                    .update_run_status("failed", Some(&e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        run_id: i64,
        extraction: &ExtractionReport,
        started: Instant,
    ) -> Result<IngestionReport> {
        // PHASE 2: LOAD
        info!("starting LOAD phase");
        let loader = StagingLoader::new(self.pool.clone(), &self.config.processed_dir);
        let load = loader.load_all(extraction).await?;
        write_json(&self.config.processed_dir.join("load_report.json"), &load)?;

        // PHASE 3: MERGE (+ derived columns)
        info!("starting MERGE phase");
        let merger = CoreMerger::new(self.pool.clone(), run_id);
        let merge = merger.merge_all(&load).await?;
        write_json(&self.config.processed_dir.join("merge_report.json"), &merge)?;

        info!("populating derived columns");
        derived::populate_all(&self.pool).await?;

        self.record_sheet_runs(run_id, extraction, &load, &merge)
            .await?;

        // PHASE 4: VALIDATE COUNTS
        info!("starting VALIDATION phase");
        let validator = CountValidator::new(self.pool.clone());
        let validation_report = validator.validate_all().await?;
        let has_mismatches = write_critical_mismatches(
            &validation_report,
            &self.config.docs_dir.join("CRITICAL_MISMATCHES.md"),
        )?;
        let validation = if has_mismatches {
            ValidationSummary {
                status: ValidationStatus::Failed,
                message: format!(
                    "{} sheet(s) failed the count contract - see docs/CRITICAL_MISMATCHES.md",
                    validation_report.mismatches.len()
                ),
            }
        } else {
            ValidationSummary {
                status: ValidationStatus::Passed,
                message: "all sheet counts reconcile against the source".to_string(),
            }
        };

        // PHASE 5: CACHE VERSION
        derived::increment_cache_version(&self.pool).await?;

        // PHASE 6: INITIAL AGGREGATES (failures logged, never fatal)
        info!("computing initial aggregates");
        let aggregates = IncrementalAggregates::new(self.pool.clone());
        if let Err(e) = aggregates.refresh_window(DEFAULT_WINDOW_DAYS, Some(run_id)).await {
            warn!(error = %e, "initial aggregate computation failed");
        }

        // finalize the run record
        let sheets_failed = load.failed_sheets + merge.failed_sheets;
        let final_status = if sheets_failed > 0 { "failed" } else { "completed" };
        self.finalize_run(run_id, final_status, &merge).await?;

        let report = IngestionReport {
            run_id,
            source_sha256: extraction.source_sha256.clone(),
            idempotent_hit: false,
            total_processed: merge.total_processed,
            total_rejected: merge.total_rejected,
            elapsed_seconds: started.elapsed().as_secs_f64(),
            extraction: extraction.clone(),
            load,
            merge,
            validation,
        };

        write_json(
            &self.config.processed_dir.join("ingestion_report.json"),
            &report,
        )?;

        if sheets_failed > 0 {
            error!(run_id, sheets_failed, "ingestion completed with failed sheets");
        } else {
            info!(
                run_id,
                total_processed = report.total_processed,
                total_rejected = report.total_rejected,
                elapsed_seconds = format!("{:.2}", report.elapsed_seconds),
                "ingestion completed"
            );
        }

        Ok(report)
    }

    async fn find_completed_run(&self, source_sha256: &str) -> Result<Option<i64>> {
        let run_id: Option<i64> = sqlx::query_scalar(
            "SELECT run_id FROM ingestion_runs\n\
             WHERE source_sha256 = $1 AND status = 'completed'\n\
             ORDER BY run_id DESC LIMIT 1",
        )
        .bind(source_sha256)
        .fetch_optional(&self.pool)
        .await?;
        Ok(run_id)
    }

    async fn create_run(&self, source_sha256: &str) -> Result<i64> {
        let run_id: i64 = sqlx::query_scalar(
            "INSERT INTO ingestion_runs (status, total_sheets, source_sha256)\n\
             VALUES ('running', $1, $2)\n\
             RETURNING run_id",
        )
        .bind(SHEETS.len() as i32)
        .bind(source_sha256)
        .fetch_one(&self.pool)
        .await?;
        Ok(run_id)
    }

    async fn finalize_run(&self, run_id: i64, status: &str, merge: &MergeReport) -> Result<()> {
        sqlx::query(
            "UPDATE ingestion_runs\n\
             SET status = $1,\n\
                 processed_rows = $2,\n\
                 rejected_rows = $3,\n\
                 completed_at = now()\n\
             WHERE run_id = $4",
        )
        .bind(status)
        .bind(merge.total_processed as i64)
        .bind(merge.total_rejected as i64)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// One ingestion_sheet_runs row per sheet, carrying the per-stage counts.
    async fn record_sheet_runs(
        &self,
        run_id: i64,
        extraction: &ExtractionReport,
        load: &LoadReport,
        merge: &MergeReport,
    ) -> Result<()> {
        for spec in SHEETS {
            let extracted = extraction
                .sheets
                .get(spec.sheet_name)
                .map(|s| s.row_count as i64)
                .unwrap_or(0);
            let loaded = load.results.get(spec.sheet_name);
            let merged = merge.results.get(spec.sheet_name);

            let failed = loaded.is_some_and(|l| l.status == SheetStatus::Failed)
                || merged.is_some_and(|m| m.status == SheetStatus::Failed);
            let error_message = loaded
                .and_then(|l| l.error.clone())
                .or_else(|| merged.and_then(|m| m.error.clone()));

            sqlx::query(
                "INSERT INTO ingestion_sheet_runs\n\
                   (run_id, sheet_name, status, rows_extracted, rows_loaded, rows_merged,\n\
                    rows_rejected, error_message, completed_at)\n\
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())",
            )
            .bind(run_id)
            .bind(spec.sheet_name)
            .bind(if failed { "failed" } else { "completed" })
            .bind(extracted)
            .bind(loaded.map(|l| l.row_count as i64).unwrap_or(0))
            .bind(merged.map(|m| m.processed as i64).unwrap_or(0))
            .bind(merged.map(|m| m.rejected as i64).unwrap_or(0))
            .bind(error_message)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}
