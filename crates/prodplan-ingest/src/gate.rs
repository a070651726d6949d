//! Release gate: the composite check that refuses promotion when any data
//! contract, migration, partition layout, or feature-gate condition fails.
//! On failure it writes `RELEASE_BLOCKED.md` naming the failing checks.

use crate::feature_gates;
use crate::partitions::partition_count;
use crate::validate::CountValidator;
use anyhow::Result;
use chrono::Utc;
use prodplan_common::config::{validate_database_url, Config};
use prodplan_common::db::{create_pool, DbConfig};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::path::Path;
use tracing::{error, info};

/// Version of the newest migration; the gate refuses to run against a store
/// that is not at head.
pub const LATEST_MIGRATION_VERSION: i64 = 5;

/// Expected partition layout.
const ERRORS_HASH_PARTITIONS: i64 = 32;
const PHASE_WORKERS_HASH_PARTITIONS: i64 = 16;
const ORDER_PHASES_MIN_RANGE_PARTITIONS: i64 = 60;

const CORE_TABLES: &[&str] = &[
    "products",
    "phases",
    "workers",
    "worker_phase_skills",
    "product_phase_standards",
    "orders",
    "order_phases",
    "phase_workers",
    "errors",
    "ingestion_runs",
];

const AGGREGATE_TABLES: &[&str] = &[
    "agg_phase_stats_daily",
    "agg_order_stats_daily",
    "agg_quality_daily",
    "agg_wip_current",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateOutcome {
    pub passed: Vec<CheckResult>,
    pub failed: Vec<CheckResult>,
}

impl GateOutcome {
    pub fn is_release_ready(&self) -> bool {
        self.failed.is_empty()
    }

    fn check(&mut self, name: &str, passed: bool, detail: Option<String>) {
        let result = CheckResult {
            name: name.to_string(),
            passed,
            detail,
        };
        if passed {
            info!(check = name, "gate check passed");
            self.passed.push(result);
        } else {
            error!(check = name, detail = ?result.detail, "gate check failed");
            self.failed.push(result);
        }
    }
}

/// Run every gate check. Always returns an outcome; connection-level
/// failures surface as failed checks rather than errors.
pub async fn run(config: &Config) -> Result<GateOutcome> {
    let mut outcome = GateOutcome::default();

    // A1 - prerequisites and schema
    if let Err(e) = validate_database_url(&config.database_url) {
        outcome.check("database_url_is_postgresql", false, Some(e.to_string()));
        write_release_blocked(&outcome, &config.docs_dir.join("RELEASE_BLOCKED.md"))?;
        return Ok(outcome);
    }
    outcome.check("database_url_is_postgresql", true, None);

    let pool = match create_pool(&DbConfig::new(&config.database_url)).await {
        Ok(pool) => {
            outcome.check("database_connection", true, None);
            pool
        }
        Err(e) => {
            outcome.check("database_connection", false, Some(e.to_string()));
            write_release_blocked(&outcome, &config.docs_dir.join("RELEASE_BLOCKED.md"))?;
            return Ok(outcome);
        }
    };

    check_migration_head(&pool, &mut outcome).await;
    check_partitions(&pool, &mut outcome).await;
    check_tables_exist(&pool, &mut outcome, CORE_TABLES, "core_table").await;
    check_tables_exist(&pool, &mut outcome, AGGREGATE_TABLES, "aggregate_table").await;

    // A2 - ingestion and data contract
    check_count_contract(&pool, &mut outcome).await;
    check_ingestion_report(config, &mut outcome);

    // A3 - performance artifacts (presence required, SLO values consulted only)
    check_benchmarks(config, &mut outcome);

    // A4 - feature gating
    check_feature_gates(config, &mut outcome);

    if outcome.is_release_ready() {
        info!(
            passed = outcome.passed.len(),
            "release gate passed, build is release-ready"
        );
    } else {
        write_release_blocked(&outcome, &config.docs_dir.join("RELEASE_BLOCKED.md"))?;
    }

    Ok(outcome)
}

async fn check_migration_head(pool: &PgPool, outcome: &mut GateOutcome) {
    let head: Result<Option<i64>, sqlx::Error> = sqlx::query_scalar(
        "SELECT version FROM _sqlx_migrations WHERE success ORDER BY version DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await;

    match head {
        Ok(Some(version)) if version == LATEST_MIGRATION_VERSION => {
            outcome.check(
                "migration_head_applied",
                true,
                Some(format!("version {version}")),
            );
        }
        Ok(Some(version)) => outcome.check(
            "migration_head_applied",
            false,
            Some(format!(
                "store is at migration {version}, head is {LATEST_MIGRATION_VERSION}; run `prodplan migrate`"
            )),
        ),
        Ok(None) => outcome.check(
            "migration_head_applied",
            false,
            Some("_sqlx_migrations is empty; run `prodplan migrate`".to_string()),
        ),
        Err(e) => outcome.check(
            "migration_head_applied",
            false,
            Some(format!("cannot read _sqlx_migrations ({e}); run `prodplan migrate`")),
        ),
    }
}

async fn check_partitions(pool: &PgPool, outcome: &mut GateOutcome) {
    for (parent, expected, exact) in [
        ("errors", ERRORS_HASH_PARTITIONS, true),
        ("phase_workers", PHASE_WORKERS_HASH_PARTITIONS, true),
        ("order_phases", ORDER_PHASES_MIN_RANGE_PARTITIONS, false),
    ] {
        let name = format!("partitions_{parent}");
        match partition_count(pool, parent).await {
            Ok(count) => {
                let ok = if exact { count == expected } else { count >= expected };
                let relation = if exact { "==" } else { ">=" };
                outcome.check(
                    &name,
                    ok,
                    Some(format!("{count} partitions (expected {relation} {expected})")),
                );
            }
            Err(e) => outcome.check(&name, false, Some(e.to_string())),
        }
    }
}

async fn check_tables_exist(
    pool: &PgPool,
    outcome: &mut GateOutcome,
    tables: &[&str],
    prefix: &str,
) {
    for table in tables {
        let exists: Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT to_regclass($1)::text")
                .bind(table)
                .fetch_one(pool)
                .await;
        let found = matches!(exists, Ok(Some(_)));
        outcome.check(&format!("{prefix}_{table}"), found, None);
    }
}

async fn check_count_contract(pool: &PgPool, outcome: &mut GateOutcome) {
    let validator = CountValidator::new(pool.clone());
    match validator.validate_all().await {
        Ok(report) => {
            outcome.check("count_contract", report.all_valid, None);
            for mismatch in &report.mismatches {
                let r = &mismatch.result;
                outcome.check(
                    &format!("count_{}", r.sheet),
                    false,
                    Some(format!(
                        "expected {}, core {}, rejects {}, diff {}",
                        r.expected, r.core_count, r.rejected_count, r.diff
                    )),
                );
            }
        }
        Err(e) => outcome.check("count_contract", false, Some(e.to_string())),
    }
}

fn check_ingestion_report(config: &Config, outcome: &mut GateOutcome) {
    let report_path = config.processed_dir.join("ingestion_report.json");
    if !report_path.exists() {
        outcome.check(
            "ingestion_report_exists",
            false,
            Some(format!("{} not found; run `prodplan ingest-turbo`", report_path.display())),
        );
        return;
    }
    outcome.check("ingestion_report_exists", true, None);

    match std::fs::read_to_string(&report_path)
        .map_err(anyhow::Error::from)
        .and_then(|c| serde_json::from_str::<serde_json::Value>(&c).map_err(Into::into))
    {
        Ok(report) => {
            outcome.check(
                "ingestion_report_has_run_id",
                report.get("run_id").is_some(),
                None,
            );
            let validation_passed = report
                .pointer("/validation/status")
                .and_then(|s| s.as_str())
                .is_some_and(|s| s == "PASSED");
            outcome.check("ingestion_validation_passed", validation_passed, None);
        }
        Err(e) => outcome.check("ingestion_report_parses", false, Some(e.to_string())),
    }
}

fn check_benchmarks(config: &Config, outcome: &mut GateOutcome) {
    let perf_dir = config.docs_dir.join("perf");
    let entries: Vec<String> = std::fs::read_dir(&perf_dir)
        .map(|dir| {
            dir.filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();

    let benchmark_files: Vec<&String> = entries
        .iter()
        .filter(|name| {
            name.starts_with("benchmarks") && (name.ends_with(".md") || name.ends_with(".json"))
        })
        .collect();
    outcome.check(
        "benchmark_files_present",
        !benchmark_files.is_empty(),
        Some(if benchmark_files.is_empty() {
            format!("no benchmarks*.md/json under {}", perf_dir.display())
        } else {
            format!("{} file(s)", benchmark_files.len())
        }),
    );

    // measured SLOs are consulted, not enforced
    for name in &benchmark_files {
        if name.ends_with(".json") {
            if let Ok(content) = std::fs::read_to_string(perf_dir.join(name.as_str())) {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(&content) {
                    info!(file = name.as_str(), slos = %value, "benchmark SLOs");
                }
            }
        }
    }

    let explain_count = entries
        .iter()
        .filter(|name| name.starts_with("EXPLAIN_") && name.ends_with(".md"))
        .count();
    outcome.check(
        "explain_plans_present",
        explain_count > 0,
        Some(format!("{explain_count} EXPLAIN file(s)")),
    );
}

fn check_feature_gates(config: &Config, outcome: &mut GateOutcome) {
    match feature_gates::load(&config.feature_gates_path) {
        Ok(gates) => {
            outcome.check("feature_gates_present", true, None);
            for (name, gate) in &gates.gates {
                if gate.critical {
                    outcome.check(
                        &format!("feature_gate_{name}"),
                        gate.enabled,
                        Some(format!(
                            "match rate {:.1}% vs threshold {:.0}%",
                            gate.match_rate * 100.0,
                            gate.threshold * 100.0
                        )),
                    );
                }
            }
        }
        Err(e) => outcome.check(
            "feature_gates_present",
            false,
            Some(format!(
                "{} unreadable ({e}); run `prodplan evaluate-feature-gates`",
                config.feature_gates_path.display()
            )),
        ),
    }
}

/// Write `RELEASE_BLOCKED.md` naming the failing checks.
pub fn write_release_blocked(outcome: &GateOutcome, path: &Path) -> Result<()> {
    let mut md = String::new();
    md.push_str("# Release Blocked\n\n");
    md.push_str(&format!("**Date**: {}\n\n", Utc::now().to_rfc3339()));
    md.push_str("## Failing checks\n\n");
    for check in &outcome.failed {
        match &check.detail {
            Some(detail) => md.push_str(&format!("- **{}**: {}\n", check.name, detail)),
            None => md.push_str(&format!("- **{}**\n", check.name)),
        }
    }
    md.push_str(
        "\n## Action Required\n\n\
         1. Fix the issues above\n\
         2. Re-run: `prodplan release-gate`\n\
         3. Ensure all checks pass before releasing\n",
    );

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, md)?;
    error!(path = %path.display(), failed = outcome.failed.len(), "release blocked");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_collects_passed_and_failed() {
        let mut outcome = GateOutcome::default();
        outcome.check("a", true, None);
        outcome.check("b", false, Some("broken".to_string()));
        assert!(!outcome.is_release_ready());
        assert_eq!(outcome.passed.len(), 1);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].name, "b");
    }

    #[test]
    fn test_release_blocked_names_failing_checks() {
        let mut outcome = GateOutcome::default();
        outcome.check("count_Orders", false, Some("diff 800".to_string()));
        outcome.check("feature_gate_worker_productivity", false, None);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docs/RELEASE_BLOCKED.md");
        write_release_blocked(&outcome, &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("count_Orders"));
        assert!(content.contains("diff 800"));
        assert!(content.contains("feature_gate_worker_productivity"));
        assert!(content.contains("prodplan release-gate"));
    }

    #[test]
    fn test_latest_migration_matches_migration_files() {
        // migrations/ carries files 0001..000N; the gate pins N
        let dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../migrations");
        let mut versions: Vec<i64> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.split('_').next().and_then(|v| v.parse().ok())
            })
            .collect();
        versions.sort_unstable();
        assert_eq!(versions.last().copied(), Some(LATEST_MIGRATION_VERSION));
    }
}
