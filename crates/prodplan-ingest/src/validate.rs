//! Count validator: the data contract that `expected == core + rejects`
//! per sheet, within a 1% tolerance. On mismatch it writes
//! `CRITICAL_MISMATCHES.md` naming each sheet, the diff, and likely causes;
//! the release gate refuses to pass until the contract holds.

use crate::sheets::SHEETS;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{error, info};

/// Allowed deviation between expected and observed totals.
pub const COUNT_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountResult {
    pub sheet: String,
    pub table: String,
    pub expected: i64,
    pub core_count: i64,
    pub rejected_count: i64,
    pub total_count: i64,
    pub diff: i64,
    pub diff_pct: f64,
    pub tolerance: f64,
    pub is_valid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountMismatch {
    #[serde(flatten)]
    pub result: CountResult,
    pub possible_causes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub results: BTreeMap<String, CountResult>,
    pub mismatches: Vec<CountMismatch>,
    pub all_valid: bool,
}

/// Compare one sheet's observed totals against its declared count.
pub fn evaluate_count(
    sheet: &str,
    table: &str,
    expected: i64,
    core_count: i64,
    rejected_count: i64,
) -> CountResult {
    let total_count = core_count + rejected_count;
    let diff = total_count - expected;
    let diff_pct = if expected > 0 {
        diff as f64 / expected as f64 * 100.0
    } else {
        0.0
    };
    let tolerance = expected as f64 * COUNT_TOLERANCE;
    let is_valid = (diff.unsigned_abs() as f64) <= tolerance;

    CountResult {
        sheet: sheet.to_string(),
        table: table.to_string(),
        expected,
        core_count,
        rejected_count,
        total_count,
        diff,
        diff_pct: (diff_pct * 100.0).round() / 100.0,
        tolerance,
        is_valid,
    }
}

fn suggest_causes(result: &CountResult) -> Vec<String> {
    let mut causes = Vec::new();
    if result.diff < 0 {
        causes.push(format!(
            "Missing {} rows - possible ingestion errors or data quality issues",
            result.diff.unsigned_abs()
        ));
        if result.rejected_count > 0 {
            causes.push(format!(
                "{} rows rejected - check {}_rejects reason codes",
                result.rejected_count, result.table
            ));
        }
    } else if result.diff > 0 {
        causes.push(format!(
            "Extra {} rows - possible duplicates or data corruption",
            result.diff
        ));
    }
    causes.push("Check ingestion logs for errors".to_string());
    causes.push("Verify the source file has not changed (compare source_sha256)".to_string());
    causes
}

/// Queries core and reject counts and evaluates the contract per sheet.
pub struct CountValidator {
    pool: PgPool,
}

impl CountValidator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Validate every sheet against its declared expected count.
    pub async fn validate_all(&self) -> Result<ValidationReport> {
        let latest_run_id = self.latest_run_id().await?;

        let mut results = BTreeMap::new();
        let mut mismatches = Vec::new();

        for spec in SHEETS {
            let core_count = self.table_count(spec.core_table).await?;
            let rejected_count = self
                .rejected_count(spec.core_table, latest_run_id)
                .await?;

            let result = evaluate_count(
                spec.sheet_name,
                spec.core_table,
                spec.expected_rows,
                core_count,
                rejected_count,
            );

            if !result.is_valid {
                mismatches.push(CountMismatch {
                    possible_causes: suggest_causes(&result),
                    result: result.clone(),
                });
            }
            results.insert(spec.sheet_name.to_string(), result);
        }

        let all_valid = mismatches.is_empty();
        if all_valid {
            info!("count contract holds for all sheets");
        } else {
            error!(mismatches = mismatches.len(), "count contract violated");
        }

        Ok(ValidationReport {
            results,
            mismatches,
            all_valid,
        })
    }

    async fn latest_run_id(&self) -> Result<Option<i64>> {
        let run_id: Option<i64> =
            sqlx::query_scalar("SELECT run_id FROM ingestion_runs ORDER BY run_id DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(run_id)
    }

    async fn table_count(&self, table: &str) -> Result<i64> {
        let exists: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
            .bind(table)
            .fetch_one(&self.pool)
            .await?;
        if exists.is_none() {
            return Ok(0);
        }
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Reject count for the latest run only; older runs' rejects are history.
    async fn rejected_count(&self, table: &str, latest_run_id: Option<i64>) -> Result<i64> {
        let Some(run_id) = latest_run_id else {
            return Ok(0);
        };
        let reject_table = format!("{table}_rejects");
        let exists: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
            .bind(&reject_table)
            .fetch_one(&self.pool)
            .await?;
        if exists.is_none() {
            return Ok(0);
        }
        let count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {reject_table} WHERE run_id = $1"))
                .bind(run_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

/// Write `CRITICAL_MISMATCHES.md` when the contract is violated.
/// Returns true when mismatches were found (and the report written).
pub fn write_critical_mismatches(report: &ValidationReport, output_path: &Path) -> Result<bool> {
    if report.all_valid {
        return Ok(false);
    }

    let mut md = String::new();
    md.push_str("# CRITICAL MISMATCHES - ACTION REQUIRED\n\n");
    md.push_str("**Status**: count contract violated\n\n");
    md.push_str(&format!(
        "## Summary\n\n{} sheet(s) do not reconcile against the declared source counts.\n\n## Mismatches\n\n",
        report.mismatches.len()
    ));

    for mismatch in &report.mismatches {
        let r = &mismatch.result;
        md.push_str(&format!("### {} -> {}\n\n", r.sheet, r.table));
        md.push_str(&format!("- **Expected (source)**: {}\n", r.expected));
        md.push_str(&format!("- **Core (accepted)**: {}\n", r.core_count));
        md.push_str(&format!("- **Rejected**: {}\n", r.rejected_count));
        md.push_str(&format!("- **Total (core + rejects)**: {}\n", r.total_count));
        md.push_str(&format!("- **Diff**: {} ({:.2}%)\n\n", r.diff, r.diff_pct));
        md.push_str("**Possible causes**:\n");
        for cause in &mismatch.possible_causes {
            md.push_str(&format!("- {cause}\n"));
        }
        md.push('\n');
    }

    md.push_str(
        "## Remediation\n\n\
         1. Inspect `ingestion_runs` and the per-entity `_rejects` tables for the latest run.\n\
         2. Re-run the inspector and compare the profile report row counts.\n\
         3. Re-run `prodplan ingest-turbo` once the cause is addressed.\n\n\
         ## RELEASE BLOCKED\n\n\
         This build must not be promoted until the mismatches are resolved or justified.\n",
    );

    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output_path, md)?;
    error!(path = %output_path.display(), "critical mismatches report written");

    Ok(true)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_within_tolerance_passes() {
        // 27000 accepted + 200 rejected vs 27380 expected: diff 180 < 1% (273.8)
        let result = evaluate_count("Orders", "orders", 27_380, 27_000, 200);
        assert_eq!(result.total_count, 27_200);
        assert_eq!(result.diff, -180);
        assert!(result.is_valid);
    }

    #[test]
    fn test_outside_tolerance_fails() {
        // same observation vs 28000 expected: diff 800 > 1% (280)
        let result = evaluate_count("Orders", "orders", 28_000, 27_000, 200);
        assert_eq!(result.diff, -800);
        assert!(!result.is_valid);
    }

    #[test]
    fn test_exact_match_passes() {
        let result = evaluate_count("Phases", "phases", 71, 71, 0);
        assert_eq!(result.diff, 0);
        assert!(result.is_valid);
    }

    #[test]
    fn test_boundary_is_inclusive() {
        // tolerance of 10000 expected is exactly 100
        let result = evaluate_count("S", "t", 10_000, 9_900, 0);
        assert_eq!(result.diff, -100);
        assert!(result.is_valid);
        let result = evaluate_count("S", "t", 10_000, 9_899, 0);
        assert!(!result.is_valid);
    }

    #[test]
    fn test_extra_rows_also_fail() {
        let result = evaluate_count("S", "t", 1_000, 1_200, 0);
        assert_eq!(result.diff, 200);
        assert!(!result.is_valid);
    }

    #[test]
    fn test_causes_mention_rejects_when_present() {
        let result = evaluate_count("Orders", "orders", 28_000, 27_000, 200);
        let causes = suggest_causes(&result);
        assert!(causes.iter().any(|c| c.contains("orders_rejects")));
        assert!(causes.iter().any(|c| c.contains("Missing 800 rows")));
    }

    #[test]
    fn test_write_critical_mismatches_skips_when_valid() {
        let report = ValidationReport {
            results: BTreeMap::new(),
            mismatches: Vec::new(),
            all_valid: true,
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("CRITICAL_MISMATCHES.md");
        assert!(!write_critical_mismatches(&report, &path).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_write_critical_mismatches_lists_each_sheet() {
        let result = evaluate_count("Orders", "orders", 28_000, 27_000, 200);
        let report = ValidationReport {
            results: BTreeMap::new(),
            mismatches: vec![CountMismatch {
                possible_causes: suggest_causes(&result),
                result,
            }],
            all_valid: false,
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docs/CRITICAL_MISMATCHES.md");
        assert!(write_critical_mismatches(&report, &path).unwrap());
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("### Orders -> orders"));
        assert!(content.contains("RELEASE BLOCKED"));
    }
}
