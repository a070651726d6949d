//! Merge stage: staging text -> typed core with per-row reject
//! classification and idempotent upserts.
//!
//! Staging is intentionally all-text; typing happens in the cast expressions
//! built here from the target catalog (column UDT + nullability). Every
//! staging row either reaches the core table through the single
//! INSERT ... ON CONFLICT statement or lands in the entity's rejects table
//! with a typed reason code - no row silently vanishes.

use crate::reports::{LoadReport, MergeReport, SheetMerge, SheetStatus};
use crate::sheets::{SheetSpec, SHEETS};
use anyhow::{Context, Result};
use prodplan_common::checksum::fingerprint;
use prodplan_common::error::ProdplanError;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{error, info, warn};

/// Batch size for the application-side errors fallback insert.
const ERRORS_INSERT_CHUNK: usize = 500;

/// Target column type read from the catalog.
#[derive(Debug, Clone)]
pub struct ColumnType {
    pub udt: String,
    pub nullable: bool,
}

/// Kind of unique column set found on a target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UniqueKind {
    PrimaryKey,
    UniqueConstraint,
    UniqueIndex,
}

/// Merges staging sheets into the typed core store.
pub struct CoreMerger {
    pool: PgPool,
    run_id: i64,
}

impl CoreMerger {
    pub fn new(pool: PgPool, run_id: i64) -> Self {
        Self { pool, run_id }
    }

    /// Merge every sheet the load stage completed, in dependency order.
    /// A failing sheet is recorded and the remaining sheets continue.
    pub async fn merge_all(&self, load_report: &LoadReport) -> Result<MergeReport> {
        self.update_run_status("merge_running", None).await;

        let mut report = MergeReport {
            run_id: self.run_id,
            ..Default::default()
        };

        for spec in SHEETS {
            let loaded = load_report
                .results
                .get(spec.sheet_name)
                .is_some_and(|r| r.status == SheetStatus::Completed);
            if !loaded {
                continue;
            }

            match self.merge_sheet(spec).await {
                Ok(result) => {
                    report.total_processed += result.processed;
                    report.total_rejected += result.rejected;
                    report.merged_sheets += 1;
                    report.results.insert(spec.sheet_name.to_string(), result);
                }
                Err(e) => {
                    error!(sheet = spec.sheet_name, error = %e, "merge failed for sheet");
                    report.failed_sheets += 1;
                    report.results.insert(
                        spec.sheet_name.to_string(),
                        SheetMerge {
                            sheet_name: spec.sheet_name.to_string(),
                            staging_count: 0,
                            processed: 0,
                            rejected: 0,
                            elapsed_seconds: 0.0,
                            status: SheetStatus::Failed,
                            error: Some(e.to_string()),
                        },
                    );
                }
            }
        }

        if report.failed_sheets > 0 {
            self.update_run_status("merge_failed", Some(&format!("{} sheet(s) failed", report.failed_sheets)))
                .await;
        } else {
            self.update_run_status("merge_done", None).await;
        }

        Ok(report)
    }

    /// Merge a single sheet inside one transaction: reject classification,
    /// then the upsert. The transaction is the commit boundary - a failing
    /// sheet leaves no partial state.
    pub async fn merge_sheet(&self, spec: &SheetSpec) -> Result<SheetMerge> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query("SET LOCAL statement_timeout = '1h'")
            .execute(&mut *tx)
            .await?;

        let staging_q = resolve_table(&mut tx, spec.staging_table, &["staging"]).await?;
        let core_q = resolve_table(&mut tx, spec.core_table, &["public", "core"]).await?;
        let rejects_q = ensure_rejects_table(&mut tx, &core_q).await?;

        let staging_count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {staging_q}"))
                .fetch_one(&mut *tx)
                .await?;

        let conflict_cols = {
            let uniques = unique_sets(&mut tx, &core_q).await?;
            choose_conflict_target(&core_q, &uniques, spec.conflict_key)?
        };
        let core_types = column_types(&mut tx, &core_q).await?;

        let (processed, rejected) = if spec.is_errors {
            self.merge_errors(&mut tx, spec, &staging_q, &core_q, &rejects_q, &conflict_cols)
                .await?
        } else {
            self.merge_standard(
                &mut tx,
                spec,
                &staging_q,
                &core_q,
                &rejects_q,
                &conflict_cols,
                &core_types,
            )
            .await?
        };

        tx.commit().await?;

        let elapsed = started.elapsed().as_secs_f64();
        info!(
            sheet = spec.sheet_name,
            staging = %staging_q,
            core = %core_q,
            staging_count,
            processed,
            rejected,
            elapsed_seconds = format!("{elapsed:.2}"),
            "sheet merged"
        );

        Ok(SheetMerge {
            sheet_name: spec.sheet_name.to_string(),
            staging_count,
            processed,
            rejected,
            elapsed_seconds: elapsed,
            status: SheetStatus::Completed,
            error: None,
        })
    }

    /// Standard (non-errors) merge path.
    #[allow(clippy::too_many_arguments)]
    async fn merge_standard(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        spec: &SheetSpec,
        staging_q: &str,
        core_q: &str,
        rejects_q: &str,
        conflict_cols: &[String],
        core_types: &HashMap<String, ColumnType>,
    ) -> Result<(u64, u64)> {
        let mut rejected = 0u64;

        // 1. NULL_CONFLICT_KEY - conflict columns that are NOT NULL in the
        //    target must survive nullify; nullable conflict columns (the
        //    partition edge of order_phases) legitimately carry NULL.
        let mut null_checks = Vec::new();
        for core_col in conflict_cols {
            let not_null = core_types.get(core_col).is_some_and(|t| !t.nullable);
            if let (Some(stg_col), true) = (spec.staging_column_for(core_col), not_null) {
                null_checks.push(null_key_check(stg_col));
            }
        }
        let mut where_valid = if null_checks.is_empty() {
            "TRUE".to_string()
        } else {
            rejected += self
                .insert_rejects(
                    tx,
                    rejects_q,
                    staging_q,
                    spec.sheet_name,
                    "NULL_CONFLICT_KEY",
                    &format!("conflict key column(s) empty: {}", conflict_cols.join(", ")),
                    &null_checks.join(" OR "),
                )
                .await?;
            null_checks
                .iter()
                .map(|c| format!("NOT ({c})"))
                .collect::<Vec<_>>()
                .join(" AND ")
        };

        // 2. NULL_REQUIRED_FIELD - NOT NULL target columns whose cast yields NULL
        for (stg_col, core_col) in spec.mapping {
            let Some(col_type) = core_types.get(*core_col) else {
                continue;
            };
            if col_type.nullable || conflict_cols.iter().any(|c| c == core_col) {
                continue;
            }
            let cast = cast_value_expr(stg_col, &col_type.udt);
            rejected += self
                .insert_rejects(
                    tx,
                    rejects_q,
                    staging_q,
                    spec.sheet_name,
                    "NULL_REQUIRED_FIELD",
                    &format!("required column {core_col} is NULL after cast"),
                    &format!("{where_valid} AND ({cast} IS NULL)"),
                )
                .await?;
            where_valid = format!("{where_valid} AND ({cast} IS NOT NULL)");
        }

        // 3. INVALID_TIME_RANGE - order_phases only, inclusive bound
        if spec.core_table == "order_phases" {
            let started = cast_value_expr("started_at", "timestamptz");
            let finished = cast_value_expr("finished_at", "timestamptz");
            rejected += self
                .insert_rejects(
                    tx,
                    rejects_q,
                    staging_q,
                    spec.sheet_name,
                    "INVALID_TIME_RANGE",
                    "finished_at < started_at",
                    &format!(
                        "{where_valid} AND {finished} IS NOT NULL AND {started} IS NOT NULL AND {finished} < {started}"
                    ),
                )
                .await?;
            where_valid = format!(
                "{where_valid} AND ({finished} IS NULL OR {started} IS NULL OR {finished} >= {started})"
            );
        }

        // 4. FOREIGN_KEY_VIOLATION - phase_workers must reference a known worker
        if spec.core_table == "phase_workers" {
            let workers_q = resolve_table(tx, "workers", &["public", "core"]).await?;
            let udt = core_types
                .get("worker_id")
                .map(|t| t.udt.clone())
                .unwrap_or_else(|| "int4".to_string());
            let fk_cast = cast_value_expr("worker_id", &udt);
            let exists =
                format!("EXISTS (SELECT 1 FROM {workers_q} w WHERE w.worker_id = {fk_cast})");
            rejected += self
                .insert_rejects(
                    tx,
                    rejects_q,
                    staging_q,
                    spec.sheet_name,
                    "FOREIGN_KEY_VIOLATION",
                    "worker_id does not exist in workers",
                    &format!("{where_valid} AND {fk_cast} IS NOT NULL AND NOT {exists}"),
                )
                .await?;
            where_valid = format!("{where_valid} AND ({fk_cast} IS NULL OR {exists})");
        }

        // 5 + 6. single-winner dedup inside the sheet, then the upsert
        let select_exprs: Vec<String> = spec
            .mapping
            .iter()
            .map(|(stg, core)| {
                let udt = core_types
                    .get(*core)
                    .map(|t| t.udt.as_str())
                    .unwrap_or("text");
                cast_select_expr(stg, core, udt)
            })
            .collect();
        let core_cols: Vec<&str> = spec.mapping.iter().map(|(_, core)| *core).collect();

        let distinct_on: Vec<String> = conflict_cols
            .iter()
            .filter_map(|c| spec.staging_column_for(c))
            .map(|stg| format!("t.{stg}"))
            .collect();
        let distinct_clause = if distinct_on.is_empty() {
            "t.staging_row".to_string()
        } else {
            distinct_on.join(", ")
        };

        let sql = format!(
            "INSERT INTO {core_q} ({cols})\n\
             SELECT DISTINCT ON ({distinct}) {exprs}\n\
             FROM {staging_q} t\n\
             WHERE {where_valid}\n\
             ORDER BY {distinct}, t.staging_row\n\
             ON CONFLICT ({conflict}) DO UPDATE SET {update_set}",
            cols = core_cols.join(", "),
            distinct = distinct_clause,
            exprs = select_exprs.join(",\n  "),
            conflict = conflict_cols.join(", "),
            update_set = build_update_set(&core_cols, conflict_cols),
        );

        let processed = sqlx::query(&sql)
            .execute(&mut **tx)
            .await
            .with_context(|| format!("upsert into {core_q} failed"))?
            .rows_affected();

        Ok((processed, rejected))
    }

    /// Errors merge path: fingerprint dedup key, pgcrypto digest when the
    /// extension is present, byte-identical application-side hash otherwise.
    async fn merge_errors(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        spec: &SheetSpec,
        staging_q: &str,
        core_q: &str,
        rejects_q: &str,
        conflict_cols: &[String],
    ) -> Result<(u64, u64)> {
        let mut rejected = 0u64;

        // NULL_REQUIRED - an error without description or order is meaningless
        let required = format!(
            "{} OR {}",
            null_key_check("description"),
            null_key_check("order_id")
        );
        rejected += self
            .insert_rejects(
                tx,
                rejects_q,
                staging_q,
                spec.sheet_name,
                "NULL_REQUIRED",
                "description or order_id is NULL",
                &required,
            )
            .await?;
        let mut where_valid = format!("NOT ({required})");

        // INVALID_GRAVIDADE - severity must cast to one of {1,2,3}
        let severity = cast_value_expr("severity", "int4");
        rejected += self
            .insert_rejects(
                tx,
                rejects_q,
                staging_q,
                spec.sheet_name,
                "INVALID_GRAVIDADE",
                "severity outside {1,2,3}",
                &format!("{where_valid} AND ({severity} IS NULL OR {severity} NOT IN (1, 2, 3))"),
            )
            .await?;
        where_valid = format!("{where_valid} AND {severity} IN (1, 2, 3)");

        // FOREIGN_KEY_VIOLATION - the order must exist; without this the
        // count contract would leak rows
        let orders_q = resolve_table(tx, "orders", &["public", "core"]).await?;
        let order_exists =
            format!("EXISTS (SELECT 1 FROM {orders_q} o WHERE o.order_id = trim(t.order_id))");
        rejected += self
            .insert_rejects(
                tx,
                rejects_q,
                staging_q,
                spec.sheet_name,
                "FOREIGN_KEY_VIOLATION",
                "order_id does not exist in orders",
                &format!("{where_valid} AND NOT {order_exists}"),
            )
            .await?;
        where_valid = format!("{where_valid} AND {order_exists}");

        let processed = if pgcrypto_available(tx).await? {
            let sql = errors_upsert_sql(staging_q, core_q, conflict_cols, &where_valid);
            sqlx::query(&sql)
                .execute(&mut **tx)
                .await
                .context("errors upsert (SQL digest) failed")?
                .rows_affected()
        } else {
            warn!("pgcrypto unavailable, computing error fingerprints in application code");
            self.merge_errors_fallback(tx, staging_q, core_q, conflict_cols, &where_valid)
                .await?
        };

        Ok((processed, rejected))
    }

    /// Application-side fingerprint path: fetch accepted rows, hash, dedup,
    /// and upsert in chunks.
    async fn merge_errors_fallback(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        staging_q: &str,
        core_q: &str,
        conflict_cols: &[String],
        where_valid: &str,
    ) -> Result<u64> {
        let sql = format!(
            "SELECT t.description, t.order_id, t.eval_phase_id, t.severity,\n\
                    t.eval_phase_event_id, t.blamed_phase_event_id\n\
             FROM {staging_q} t\n\
             WHERE {where_valid}\n\
             ORDER BY t.staging_row"
        );
        let rows = sqlx::query(&sql).fetch_all(&mut **tx).await?;

        // first occurrence per (fingerprint, order_id) wins
        let mut seen: HashMap<(String, String), ErrorRow> = HashMap::new();
        let mut ordered_keys = Vec::new();
        for row in rows {
            let raw: [Option<String>; 6] = [
                row.try_get("description")?,
                row.try_get("order_id")?,
                row.try_get("eval_phase_id")?,
                row.try_get("severity")?,
                row.try_get("eval_phase_event_id")?,
                row.try_get("blamed_phase_event_id")?,
            ];
            let parts: Vec<&str> = raw.iter().map(|v| v.as_deref().unwrap_or("")).collect();
            let fp = fingerprint(&parts);
            let order_id = raw[1].as_deref().unwrap_or("").trim().to_string();
            let key = (fp.clone(), order_id.clone());
            seen.entry(key.clone()).or_insert_with(|| {
                ordered_keys.push(key);
                ErrorRow {
                    description: nullify_value(raw[0].as_deref()),
                    order_id,
                    eval_phase_id: parse_int(raw[2].as_deref()),
                    severity: parse_int(raw[3].as_deref()),
                    eval_phase_event_id: nullify_value(raw[4].as_deref()),
                    blamed_phase_event_id: nullify_value(raw[5].as_deref()),
                    fingerprint: fp,
                }
            });
        }

        let mut processed = 0u64;
        for chunk in ordered_keys.chunks(ERRORS_INSERT_CHUNK) {
            let mut placeholders = Vec::new();
            for i in 0..chunk.len() {
                let base = i * 7;
                placeholders.push(format!(
                    "(${}, ${}, ${}, ${}, ${}, ${}, ${})",
                    base + 1,
                    base + 2,
                    base + 3,
                    base + 4,
                    base + 5,
                    base + 6,
                    base + 7
                ));
            }
            let sql = format!(
                "INSERT INTO {core_q} (description, order_id, eval_phase_id, severity,\n\
                        eval_phase_event_id, blamed_phase_event_id, fingerprint)\n\
                 VALUES {values}\n\
                 ON CONFLICT ({conflict}) DO UPDATE SET {update_set}",
                values = placeholders.join(", "),
                conflict = conflict_cols.join(", "),
                update_set = errors_update_set(),
            );
            let mut query = sqlx::query(&sql);
            for key in chunk {
                let row = &seen[key];
                query = query
                    .bind(row.description.as_deref())
                    .bind(&row.order_id)
                    .bind(row.eval_phase_id)
                    .bind(row.severity)
                    .bind(row.eval_phase_event_id.as_deref())
                    .bind(row.blamed_phase_event_id.as_deref())
                    .bind(&row.fingerprint);
            }
            processed += query.execute(&mut **tx).await?.rows_affected();
        }

        Ok(processed)
    }

    /// Insert matching staging rows into the rejects table with the raw
    /// payload, returning how many rows were classified.
    #[allow(clippy::too_many_arguments)]
    async fn insert_rejects(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        rejects_q: &str,
        staging_q: &str,
        sheet: &str,
        code: &str,
        detail: &str,
        where_sql: &str,
    ) -> Result<u64> {
        let sql = format!(
            "INSERT INTO {rejects_q} (run_id, sheet_name, row_number, reason_code, reason_detail, payload)\n\
             SELECT $1, $2, t.staging_row, $3, $4, to_jsonb(t) - 'staging_row'\n\
             FROM {staging_q} t\n\
             WHERE {where_sql}"
        );
        let count = sqlx::query(&sql)
            .bind(self.run_id)
            .bind(sheet)
            .bind(code)
            .bind(detail)
            .execute(&mut **tx)
            .await
            .with_context(|| format!("reject insert ({code}) into {rejects_q} failed"))?
            .rows_affected();
        Ok(count)
    }

    /// Best-effort run status transition; a failed update never aborts the
    /// pipeline.
    pub async fn update_run_status(&self, status: &str, error_message: Option<&str>) {
        let result = sqlx::query(
            "UPDATE ingestion_runs\n\
             SET status = $1,\n\
                 error_message = $2,\n\
                 completed_at = CASE WHEN $1 IN ('merge_done', 'completed', 'failed') THEN now() ELSE completed_at END\n\
             WHERE run_id = $3",
        )
        .bind(status)
        .bind(error_message)
        .bind(self.run_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(status, error = %e, "failed to update ingestion_runs status");
        }
    }
}

struct ErrorRow {
    description: Option<String>,
    order_id: String,
    eval_phase_id: Option<i32>,
    severity: Option<i32>,
    eval_phase_event_id: Option<String>,
    blamed_phase_event_id: Option<String>,
    fingerprint: String,
}

// ---------------------------------------------------------------------------
// catalog introspection
// ---------------------------------------------------------------------------

fn split_qualified(qualified: &str) -> (&str, &str) {
    match qualified.split_once('.') {
        Some((schema, rel)) => (schema, rel),
        None => ("public", qualified),
    }
}

/// Resolve a table name to its schema-qualified form via `to_regclass`.
pub async fn resolve_table(
    tx: &mut Transaction<'_, Postgres>,
    raw: &str,
    schemas: &[&str],
) -> Result<String> {
    let candidates: Vec<String> = if raw.contains('.') {
        vec![raw.to_string()]
    } else {
        schemas
            .iter()
            .map(|s| format!("{s}.{raw}"))
            .chain(std::iter::once(raw.to_string()))
            .collect()
    };

    for candidate in &candidates {
        let found: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
            .bind(candidate)
            .fetch_one(&mut **tx)
            .await?;
        if found.is_some() {
            return Ok(candidate.clone());
        }
    }

    Err(ProdplanError::TableNotFound(format!("{raw} (searched {})", schemas.join(", "))).into())
}

/// Column name, UDT, and nullability of the target table.
pub async fn column_types(
    tx: &mut Transaction<'_, Postgres>,
    qualified: &str,
) -> Result<HashMap<String, ColumnType>> {
    let (schema, rel) = split_qualified(qualified);
    let rows = sqlx::query(
        "SELECT column_name::text AS name, udt_name::text AS udt, is_nullable::text AS nullable\n\
         FROM information_schema.columns\n\
         WHERE table_schema = $1 AND table_name = $2\n\
         ORDER BY ordinal_position",
    )
    .bind(schema)
    .bind(rel)
    .fetch_all(&mut **tx)
    .await?;

    let mut out = HashMap::new();
    for row in rows {
        let name: String = row.try_get("name")?;
        let udt: String = row.try_get("udt")?;
        let nullable: String = row.try_get("nullable")?;
        out.insert(
            name,
            ColumnType {
                udt,
                nullable: nullable == "YES",
            },
        );
    }
    Ok(out)
}

/// Unique constraints and unique indexes on the target.
pub async fn unique_sets(
    tx: &mut Transaction<'_, Postgres>,
    qualified: &str,
) -> Result<Vec<(UniqueKind, Vec<String>)>> {
    let (schema, rel) = split_qualified(qualified);
    let mut out = Vec::new();

    let rows = sqlx::query(
        "SELECT c.contype::text AS kind,\n\
                array_agg(a.attname::text ORDER BY array_position(c.conkey, a.attnum)) AS cols\n\
         FROM pg_constraint c\n\
         JOIN pg_class t ON c.conrelid = t.oid\n\
         JOIN pg_namespace n ON t.relnamespace = n.oid\n\
         JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(c.conkey)\n\
         WHERE n.nspname = $1 AND t.relname = $2 AND c.contype IN ('p', 'u')\n\
         GROUP BY c.contype, c.conkey",
    )
    .bind(schema)
    .bind(rel)
    .fetch_all(&mut **tx)
    .await?;
    for row in rows {
        let kind: String = row.try_get("kind")?;
        let cols: Vec<String> = row.try_get("cols")?;
        let kind = if kind == "p" {
            UniqueKind::PrimaryKey
        } else {
            UniqueKind::UniqueConstraint
        };
        out.push((kind, cols));
    }

    let rows = sqlx::query(
        "SELECT array_agg(a.attname::text ORDER BY array_position(i.indkey::int2[], a.attnum)) AS cols\n\
         FROM pg_index i\n\
         JOIN pg_class t ON i.indrelid = t.oid\n\
         JOIN pg_namespace n ON t.relnamespace = n.oid\n\
         JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(i.indkey)\n\
         WHERE n.nspname = $1 AND t.relname = $2 AND i.indisunique = true\n\
         GROUP BY i.indkey",
    )
    .bind(schema)
    .bind(rel)
    .fetch_all(&mut **tx)
    .await?;
    for row in rows {
        let cols: Option<Vec<String>> = row.try_get("cols")?;
        if let Some(cols) = cols {
            out.push((UniqueKind::UniqueIndex, cols));
        }
    }

    Ok(out)
}

/// Pick the ON CONFLICT target: exact match against the preferred set,
/// else the primary key, else fail listing what exists.
pub fn choose_conflict_target(
    table: &str,
    uniques: &[(UniqueKind, Vec<String>)],
    preferred: &[&str],
) -> Result<Vec<String>> {
    let wanted: std::collections::BTreeSet<&str> = preferred.iter().copied().collect();

    for (_, cols) in uniques {
        let set: std::collections::BTreeSet<&str> = cols.iter().map(|c| c.as_str()).collect();
        if set == wanted {
            return Ok(cols.clone());
        }
    }

    for (kind, cols) in uniques {
        if *kind == UniqueKind::PrimaryKey {
            return Ok(cols.clone());
        }
    }

    let available = uniques
        .iter()
        .map(|(kind, cols)| format!("{kind:?}({})", cols.join(", ")))
        .collect::<Vec<_>>()
        .join("; ");
    Err(ProdplanError::NoConflictTarget {
        table: table.to_string(),
        available,
    }
    .into())
}

async fn pgcrypto_available(tx: &mut Transaction<'_, Postgres>) -> Result<bool> {
    let available: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'pgcrypto')")
            .fetch_one(&mut **tx)
            .await?;
    Ok(available)
}

/// Make sure the rejects table exists even when the sheet's migration
/// predates it.
async fn ensure_rejects_table(
    tx: &mut Transaction<'_, Postgres>,
    core_q: &str,
) -> Result<String> {
    let (schema, rel) = split_qualified(core_q);
    let rejects_q = format!("{schema}.{rel}_rejects");
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {rejects_q} (\n\
             reject_id BIGINT GENERATED ALWAYS AS IDENTITY,\n\
             run_id BIGINT NOT NULL,\n\
             sheet_name VARCHAR(100) NOT NULL,\n\
             row_number BIGINT NOT NULL,\n\
             reason_code VARCHAR(50) NOT NULL,\n\
             reason_detail TEXT,\n\
             payload JSONB NOT NULL,\n\
             created_at TIMESTAMPTZ NOT NULL DEFAULT now(),\n\
             PRIMARY KEY (reject_id)\n\
         )"
    );
    sqlx::query(&sql).execute(&mut **tx).await?;
    Ok(rejects_q)
}

// ---------------------------------------------------------------------------
// cast expression builders (pure; the typed boundary of the pipeline)
// ---------------------------------------------------------------------------

/// Map `''`, `'NULL'`, `'NONE'`, `'NIL'` (case-insensitive) to NULL and trim
/// everything else. Applied before every predicate and cast.
pub fn nullify_expr(expr: &str) -> String {
    format!(
        "CASE WHEN {expr} IS NULL THEN NULL \
         WHEN trim({expr}) = '' THEN NULL \
         WHEN upper(trim({expr})) IN ('NULL', 'NONE', 'NIL') THEN NULL \
         ELSE trim({expr}) END"
    )
}

/// Predicate matching rows whose value is missing after nullify.
pub fn null_key_check(stg_col: &str) -> String {
    format!(
        "(t.{stg_col} IS NULL OR trim(t.{stg_col}) = '' OR upper(trim(t.{stg_col})) IN ('NULL', 'NONE', 'NIL'))"
    )
}

/// Cast a staging text column to the target UDT, yielding NULL when the
/// value does not parse.
pub fn cast_value_expr(stg_col: &str, udt: &str) -> String {
    let e = format!("t.{stg_col}");
    let n = nullify_expr(&e);
    match udt {
        // strict integer shape only; decimals and garbage become NULL
        "int2" | "int4" | "int8" => format!(
            "(CASE WHEN {n} ~ '^[0-9]+$' THEN ({n})::bigint ELSE NULL END)"
        ),
        "numeric" | "float4" | "float8" => format!(
            "(CASE WHEN {n} ~ '^-?[0-9]+(\\.[0-9]+)?$' THEN ({n})::numeric ELSE NULL END)"
        ),
        "date" => format!("(CASE WHEN {n} ~ '^[0-9]{{4}}-[0-9]{{2}}-[0-9]{{2}}' THEN substring({n} from 1 for 10)::date ELSE NULL END)"),
        "timestamp" => format!("(CASE WHEN {n} ~ '^[0-9]{{4}}-[0-9]{{2}}-[0-9]{{2}}' THEN ({n})::timestamp ELSE NULL END)"),
        "timestamptz" => format!("(CASE WHEN {n} ~ '^[0-9]{{4}}-[0-9]{{2}}-[0-9]{{2}}' THEN ({n})::timestamptz ELSE NULL END)"),
        "bool" => format!(
            "(CASE WHEN upper(trim({e})) IN ('TRUE', 'T', '1', 'YES', 'Y') THEN true \
              WHEN upper(trim({e})) IN ('FALSE', 'F', '0', 'NO', 'N') THEN false \
              ELSE NULL END)"
        ),
        // text/varchar and everything else keeps the cleaned text
        _ => format!("({n})"),
    }
}

/// Cast expression with the target column alias, for the upsert SELECT list.
pub fn cast_select_expr(stg_col: &str, core_col: &str, udt: &str) -> String {
    format!("{} AS {core_col}", cast_value_expr(stg_col, udt))
}

/// `SET` clause of the upsert: every non-key column from EXCLUDED; a
/// key-only table degenerates to a self-assignment so DO UPDATE stays valid.
pub fn build_update_set(core_cols: &[&str], conflict_cols: &[String]) -> String {
    let assignments: Vec<String> = core_cols
        .iter()
        .filter(|c| !conflict_cols.iter().any(|k| k == *c))
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect();
    if assignments.is_empty() {
        format!("{0} = EXCLUDED.{0}", conflict_cols[0])
    } else {
        assignments.join(", ")
    }
}

/// SQL-side fingerprint: normalize each field exactly like
/// `prodplan_common::checksum::fingerprint` (lowercase, collapse
/// whitespace, trim, join with `|`) and digest with pgcrypto. Collapse runs
/// before trim: Postgres `trim()` only strips spaces, so tabs and newlines
/// at the edges must first become spaces or the two paths diverge.
pub fn sql_fingerprint_expr(cols: &[&str]) -> String {
    let normalized: Vec<String> = cols
        .iter()
        .map(|c| format!("trim(regexp_replace(lower(coalesce(t.{c}, '')), '\\s+', ' ', 'g'))"))
        .collect();
    format!(
        "encode(digest({}, 'sha256'), 'hex')",
        normalized.join(" || '|' || ")
    )
}

/// Full errors upsert statement for the pgcrypto path.
pub fn errors_upsert_sql(
    staging_q: &str,
    core_q: &str,
    conflict_cols: &[String],
    where_valid: &str,
) -> String {
    let fp = sql_fingerprint_expr(&[
        "description",
        "order_id",
        "eval_phase_id",
        "severity",
        "eval_phase_event_id",
        "blamed_phase_event_id",
    ]);
    format!(
        "INSERT INTO {core_q} (description, order_id, eval_phase_id, severity,\n\
                eval_phase_event_id, blamed_phase_event_id, fingerprint)\n\
         SELECT DISTINCT ON (s.fingerprint, s.order_id)\n\
                s.description, s.order_id, s.eval_phase_id, s.severity,\n\
                s.eval_phase_event_id, s.blamed_phase_event_id, s.fingerprint\n\
         FROM (\n\
             SELECT {description} AS description,\n\
                    trim(t.order_id) AS order_id,\n\
                    {eval_phase} AS eval_phase_id,\n\
                    {severity} AS severity,\n\
                    {eval_event} AS eval_phase_event_id,\n\
                    {blamed_event} AS blamed_phase_event_id,\n\
                    {fp} AS fingerprint,\n\
                    t.staging_row\n\
             FROM {staging_q} t\n\
             WHERE {where_valid}\n\
         ) s\n\
         ORDER BY s.fingerprint, s.order_id, s.staging_row\n\
         ON CONFLICT ({conflict}) DO UPDATE SET {update_set}",
        description = nullify_expr("t.description"),
        eval_phase = cast_value_expr("eval_phase_id", "int4"),
        severity = cast_value_expr("severity", "int4"),
        eval_event = nullify_expr("t.eval_phase_event_id"),
        blamed_event = nullify_expr("t.blamed_phase_event_id"),
        conflict = conflict_cols.join(", "),
        update_set = errors_update_set(),
    )
}

fn errors_update_set() -> String {
    [
        "description",
        "eval_phase_id",
        "severity",
        "eval_phase_event_id",
        "blamed_phase_event_id",
    ]
    .iter()
    .map(|c| format!("{c} = EXCLUDED.{c}"))
    .collect::<Vec<_>>()
    .join(", ")
}

// application-side equivalents of the nullify/int casts, used by the
// fingerprint fallback

fn nullify_value(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.to_uppercase().as_str() {
        "NULL" | "NONE" | "NIL" => None,
        _ => Some(trimmed.to_string()),
    }
}

fn parse_int(value: Option<&str>) -> Option<i32> {
    let cleaned = nullify_value(value)?;
    if cleaned.chars().all(|c| c.is_ascii_digit()) {
        cleaned.parse().ok()
    } else {
        None
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_nullify_expr_handles_literals() {
        let sql = nullify_expr("t.order_id");
        assert!(sql.contains("upper(trim(t.order_id)) IN ('NULL', 'NONE', 'NIL')"));
        assert!(sql.contains("trim(t.order_id) = ''"));
        assert!(sql.ends_with("ELSE trim(t.order_id) END"));
    }

    #[test]
    fn test_int_cast_is_strict() {
        let sql = cast_value_expr("phase_id", "int4");
        assert!(sql.contains("~ '^[0-9]+$'"));
        assert!(sql.contains("::bigint"));
        // a decimal like "2.5" must not match the integer shape
        assert!(!sql.contains("::int4"));
    }

    #[test]
    fn test_numeric_cast_allows_decimals() {
        let sql = cast_value_expr("mass", "numeric");
        assert!(sql.contains("::numeric"));
        assert!(sql.contains("-?[0-9]+(\\.[0-9]+)?"));
    }

    #[test]
    fn test_bool_cast_accepts_declared_tokens() {
        let sql = cast_value_expr("active", "bool");
        assert!(sql.contains("('TRUE', 'T', '1', 'YES', 'Y')"));
        assert!(sql.contains("('FALSE', 'F', '0', 'NO', 'N')"));
    }

    #[test]
    fn test_text_cast_keeps_cleaned_text() {
        let sql = cast_select_expr("order_id", "order_id", "varchar");
        assert!(sql.ends_with("AS order_id"));
        assert!(sql.contains("trim(t.order_id)"));
    }

    #[test]
    fn test_timestamptz_cast_guards_shape() {
        let sql = cast_value_expr("finished_at", "timestamptz");
        assert!(sql.contains("::timestamptz"));
        assert!(sql.contains("^[0-9]{4}-[0-9]{2}-[0-9]{2}"));
    }

    #[test]
    fn test_choose_conflict_target_prefers_exact_match() {
        let uniques = vec![
            (UniqueKind::PrimaryKey, vec!["error_id".to_string(), "order_id".to_string()]),
            (
                UniqueKind::UniqueIndex,
                vec!["fingerprint".to_string(), "order_id".to_string()],
            ),
        ];
        let target =
            choose_conflict_target("errors", &uniques, &["fingerprint", "order_id"]).unwrap();
        assert_eq!(target, vec!["fingerprint".to_string(), "order_id".to_string()]);
    }

    #[test]
    fn test_choose_conflict_target_falls_back_to_pk() {
        let uniques = vec![(UniqueKind::PrimaryKey, vec!["order_id".to_string()])];
        let target = choose_conflict_target("orders", &uniques, &["missing_col"]).unwrap();
        assert_eq!(target, vec!["order_id".to_string()]);
    }

    #[test]
    fn test_choose_conflict_target_errors_listing_available() {
        let uniques = vec![(UniqueKind::UniqueIndex, vec!["a".to_string(), "b".to_string()])];
        let err = choose_conflict_target("orders", &uniques, &["x"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("No ON CONFLICT target"));
        assert!(msg.contains("a, b"));
    }

    #[test]
    fn test_build_update_set_excludes_key_columns() {
        let set = build_update_set(
            &["order_id", "created_at", "finished_at"],
            &["order_id".to_string()],
        );
        assert_eq!(set, "created_at = EXCLUDED.created_at, finished_at = EXCLUDED.finished_at");
    }

    #[test]
    fn test_build_update_set_key_only_table() {
        let set = build_update_set(
            &["worker_id", "phase_id"],
            &["worker_id".to_string(), "phase_id".to_string()],
        );
        assert_eq!(set, "worker_id = EXCLUDED.worker_id");
    }

    #[test]
    fn test_null_key_check_covers_missing_forms() {
        let sql = null_key_check("order_id");
        assert!(sql.contains("t.order_id IS NULL"));
        assert!(sql.contains("trim(t.order_id) = ''"));
        assert!(sql.contains("('NULL', 'NONE', 'NIL')"));
    }

    #[test]
    fn test_sql_fingerprint_expr_joins_with_pipes() {
        let sql = sql_fingerprint_expr(&["description", "order_id"]);
        assert!(sql.starts_with("encode(digest("));
        assert!(sql.ends_with(", 'sha256'), 'hex')"));
        assert!(sql.contains("|| '|' ||"));
        assert!(sql.contains("trim(regexp_replace(lower(coalesce(t.description, '')), '\\s+', ' ', 'g'))"));
    }

    #[test]
    fn test_sql_fingerprint_expr_trims_after_collapsing() {
        // trim must wrap the collapse: Postgres trim() only strips spaces,
        // so a trailing tab has to become a space first. A field like
        // "Crack on hull\t" then hashes identically on both paths.
        let sql = sql_fingerprint_expr(&["description"]);
        let field = "trim(regexp_replace(lower(coalesce(t.description, '')), '\\s+', ' ', 'g'))";
        assert!(sql.contains(field));
        assert!(!sql.contains("lower(trim("));
    }

    #[test]
    fn test_errors_upsert_sql_dedups_before_conflict() {
        let sql = errors_upsert_sql(
            "staging.errors_raw",
            "public.errors",
            &["fingerprint".to_string(), "order_id".to_string()],
            "TRUE",
        );
        assert!(sql.contains("DISTINCT ON (s.fingerprint, s.order_id)"));
        assert!(sql.contains("ON CONFLICT (fingerprint, order_id) DO UPDATE"));
        assert!(sql.contains("ORDER BY s.fingerprint, s.order_id, s.staging_row"));
    }

    #[test]
    fn test_nullify_value_matches_sql_semantics() {
        assert_eq!(nullify_value(Some("  OF1 ")), Some("OF1".to_string()));
        assert_eq!(nullify_value(Some("NULL")), None);
        assert_eq!(nullify_value(Some("none")), None);
        assert_eq!(nullify_value(Some("NIL")), None);
        assert_eq!(nullify_value(Some("   ")), None);
        assert_eq!(nullify_value(None), None);
    }

    #[test]
    fn test_parse_int_strictness() {
        assert_eq!(parse_int(Some("42")), Some(42));
        assert_eq!(parse_int(Some(" 42 ")), Some(42));
        assert_eq!(parse_int(Some("2.5")), None);
        assert_eq!(parse_int(Some("-1")), None);
        assert_eq!(parse_int(Some("NULL")), None);
    }

    #[test]
    fn test_split_qualified() {
        assert_eq!(split_qualified("staging.orders_raw"), ("staging", "orders_raw"));
        assert_eq!(split_qualified("orders"), ("public", "orders"));
    }
}
