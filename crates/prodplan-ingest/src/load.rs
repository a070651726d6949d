//! Load stage: bulk-load each CSV.gz artifact into its UNLOGGED staging
//! table via native COPY. Each sheet commits on its own; a COPY failure
//! marks only that sheet FAILED and the run continues (the gate will catch
//! it).

use crate::extract::read_csv_gz_header;
use crate::reports::{ExtractionReport, LoadReport, SheetLoad, SheetStatus};
use crate::sheets::{SheetSpec, SHEETS};
use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use sqlx::PgPool;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};

/// COPY is fed in chunks of this size.
const COPY_CHUNK_BYTES: usize = 64 * 1024;

/// Loads extracted CSV.gz files into staging.
pub struct StagingLoader {
    pool: PgPool,
    processed_dir: PathBuf,
}

impl StagingLoader {
    pub fn new(pool: PgPool, processed_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            processed_dir: processed_dir.into(),
        }
    }

    /// Load every extracted sheet that has a staging mapping.
    pub async fn load_all(&self, extraction: &ExtractionReport) -> Result<LoadReport> {
        let mut report = LoadReport::default();

        for spec in SHEETS {
            let Some(sheet) = extraction.sheets.get(spec.sheet_name) else {
                warn!(sheet = spec.sheet_name, "sheet missing from extraction report");
                continue;
            };

            let csv_gz_path = self
                .processed_dir
                .join(Path::new(&sheet.file_path).file_name().unwrap_or_default());
            let path = if csv_gz_path.exists() {
                csv_gz_path
            } else {
                PathBuf::from(&sheet.file_path)
            };

            match self.load_sheet(spec, &path).await {
                Ok(result) => {
                    report.loaded_sheets += 1;
                    report.results.insert(spec.sheet_name.to_string(), result);
                }
                Err(e) => {
                    error!(sheet = spec.sheet_name, error = %e, "load failed for sheet");
                    report.failed_sheets += 1;
                    report.results.insert(
                        spec.sheet_name.to_string(),
                        SheetLoad {
                            sheet_name: spec.sheet_name.to_string(),
                            staging_table: spec.staging_table.to_string(),
                            row_count: 0,
                            elapsed_seconds: 0.0,
                            status: SheetStatus::Failed,
                            error: Some(e.to_string()),
                        },
                    );
                }
            }
        }

        Ok(report)
    }

    /// TRUNCATE + COPY one sheet within a single transaction.
    async fn load_sheet(&self, spec: &SheetSpec, csv_gz_path: &Path) -> Result<SheetLoad> {
        info!(sheet = spec.sheet_name, table = spec.staging_table, "loading sheet");
        let started = Instant::now();

        if !csv_gz_path.exists() {
            bail!("CSV.gz artifact not found: {}", csv_gz_path.display());
        }
        verify_header(spec, csv_gz_path)?;

        let mut conn = self.pool.acquire().await?;

        // session tuning for the bulk load; staging is UNLOGGED and owned by
        // this process, durability of the load itself is irrelevant
        for setting in [
            "SET synchronous_commit = off",
            "SET maintenance_work_mem = '256MB'",
            "SET work_mem = '64MB'",
            "SET statement_timeout = '1h'",
        ] {
            sqlx::query(setting).execute(&mut *conn).await?;
        }

        let mut tx = sqlx::Connection::begin(&mut *conn).await?;

        sqlx::query(&format!(
            "TRUNCATE TABLE {} RESTART IDENTITY",
            spec.staging_table
        ))
        .execute(&mut *tx)
        .await?;

        let copy_sql = format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT csv, HEADER true, DELIMITER ',', QUOTE '\"')",
            spec.staging_table,
            spec.staging_columns.join(", ")
        );

        let mut sink = tx
            .copy_in_raw(&copy_sql)
            .await
            .with_context(|| format!("COPY into {} failed to start", spec.staging_table))?;

        let file = std::fs::File::open(csv_gz_path)?;
        let mut decoder = GzDecoder::new(file);
        let mut buffer = vec![0u8; COPY_CHUNK_BYTES];
        loop {
            let n = decoder.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            sink.send(&buffer[..n])
                .await
                .with_context(|| format!("COPY into {} failed mid-stream", spec.staging_table))?;
        }
        let row_count = sink
            .finish()
            .await
            .with_context(|| format!("COPY into {} failed to finish", spec.staging_table))?;

        tx.commit().await?;

        let elapsed = started.elapsed().as_secs_f64();
        let throughput = if elapsed > 0.0 {
            row_count as f64 / elapsed
        } else {
            0.0
        };
        info!(
            sheet = spec.sheet_name,
            rows = row_count,
            elapsed_seconds = format!("{elapsed:.2}"),
            rows_per_sec = format!("{throughput:.0}"),
            "sheet loaded"
        );

        Ok(SheetLoad {
            sheet_name: spec.sheet_name.to_string(),
            staging_table: spec.staging_table.to_string(),
            row_count,
            elapsed_seconds: elapsed,
            status: SheetStatus::Completed,
            error: None,
        })
    }
}

/// Column names are matched case-sensitively against the declared ingestion
/// map; a drifted workbook fails the sheet before any COPY.
fn verify_header(spec: &SheetSpec, csv_gz_path: &Path) -> Result<()> {
    let header = read_csv_gz_header(csv_gz_path)?;
    if header != spec.headers {
        bail!(
            "header mismatch for sheet {}: expected [{}], found [{}]",
            spec.sheet_name,
            spec.headers.join(", "),
            header.join(", ")
        );
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn write_csv_gz(path: &Path, header: &[&str]) {
        let file = std::fs::File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut writer = csv::Writer::from_writer(encoder);
        writer.write_record(header).unwrap();
        writer.flush().unwrap();
        writer.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_verify_header_accepts_declared_map() {
        let spec = crate::sheets::sheet_by_name("Workers").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Workers.csv.gz");
        write_csv_gz(&path, &["Worker_Id", "Worker_Name", "Worker_Active"]);
        assert!(verify_header(spec, &path).is_ok());
    }

    #[test]
    fn test_verify_header_rejects_case_drift() {
        let spec = crate::sheets::sheet_by_name("Workers").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Workers.csv.gz");
        // case-sensitive match: lowercased headers must fail
        write_csv_gz(&path, &["worker_id", "worker_name", "worker_active"]);
        let err = verify_header(spec, &path).unwrap_err();
        assert!(err.to_string().contains("header mismatch"));
    }

    #[test]
    fn test_verify_header_rejects_reordered_columns() {
        let spec = crate::sheets::sheet_by_name("Workers").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Workers.csv.gz");
        write_csv_gz(&path, &["Worker_Name", "Worker_Id", "Worker_Active"]);
        assert!(verify_header(spec, &path).is_err());
    }
}
