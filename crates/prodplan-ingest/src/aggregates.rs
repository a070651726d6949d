//! Incremental aggregate engine.
//!
//! For each aggregate and candidate day the engine reads the watermark for
//! the (source table, source column) pair, computes partials over rows with
//! `DATE(col) = day AND col >= watermark`, combines them into the stored
//! aggregate with monoid rules (counts/sums/sums-of-squares add, min/max via
//! LEAST/GREATEST), and advances the watermark to the day's maximum event
//! time. Watermarks only move forward; re-running a day without lowering the
//! watermark is a no-op on the sources and therefore on the aggregates.
//!
//! The current-WIP aggregate is small (bounded by open phase-events) and is
//! recomputed in full and overwritten each cycle.

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::info;

/// Candidate days recomputed per refresh cycle.
pub const DEFAULT_WINDOW_DAYS: i64 = 7;

/// One refresh cycle's row counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateSummary {
    pub phase_stats: u64,
    pub order_stats: u64,
    pub quality_stats: u64,
    pub wip_current: u64,
}

/// Watermark-driven aggregate computer.
pub struct IncrementalAggregates {
    pool: PgPool,
}

impl IncrementalAggregates {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Watermark name for a (table, column) pair.
    fn watermark_name(source_table: &str, source_column: &str) -> String {
        format!("{source_table}.{source_column}")
    }

    /// Read the last consumed timestamp for a source.
    pub async fn get_watermark(
        &self,
        source_table: &str,
        source_column: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let last_ts: Option<Option<DateTime<Utc>>> =
            sqlx::query_scalar("SELECT last_ts FROM analytics_watermarks WHERE name = $1")
                .bind(Self::watermark_name(source_table, source_column))
                .fetch_optional(&self.pool)
                .await?;
        Ok(last_ts.flatten())
    }

    /// Advance a watermark. GREATEST keeps it monotone even if days are
    /// refreshed out of order.
    pub async fn update_watermark(
        &self,
        source_table: &str,
        source_column: &str,
        last_ts: DateTime<Utc>,
        run_id: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO analytics_watermarks (name, last_ts, last_run_id)\n\
             VALUES ($1, $2, $3)\n\
             ON CONFLICT (name) DO UPDATE SET\n\
               last_ts = GREATEST(analytics_watermarks.last_ts, EXCLUDED.last_ts),\n\
               last_run_id = EXCLUDED.last_run_id,\n\
               updated_at = now()",
        )
        .bind(Self::watermark_name(source_table, source_column))
        .bind(last_ts)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Daily phase duration stats, grouped by product and phase.
    pub async fn compute_phase_stats_daily(
        &self,
        snapshot_date: NaiveDate,
        since_watermark: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        let rows = sqlx::query(
            "INSERT INTO agg_phase_stats_daily\n\
               (snapshot_date, product_id, phase_id, n, sum_duration_seconds, sum_duration_sq,\n\
                min_duration_seconds, max_duration_seconds)\n\
             SELECT $1, o.product_id, op.phase_id,\n\
                    COUNT(*),\n\
                    SUM(op.duration_seconds),\n\
                    SUM(op.duration_seconds * op.duration_seconds),\n\
                    MIN(op.duration_seconds),\n\
                    MAX(op.duration_seconds)\n\
             FROM order_phases op\n\
             JOIN orders o ON op.order_id = o.order_id\n\
             WHERE DATE(op.event_time) = $1\n\
               AND op.duration_seconds IS NOT NULL\n\
               AND op.duration_seconds > 0\n\
               AND o.product_id IS NOT NULL\n\
               AND op.phase_id IS NOT NULL\n\
               AND ($2::timestamptz IS NULL OR op.event_time >= $2)\n\
             GROUP BY o.product_id, op.phase_id\n\
             ON CONFLICT (snapshot_date, product_id, phase_id) DO UPDATE SET\n\
               n = agg_phase_stats_daily.n + EXCLUDED.n,\n\
               sum_duration_seconds = agg_phase_stats_daily.sum_duration_seconds + EXCLUDED.sum_duration_seconds,\n\
               sum_duration_sq = agg_phase_stats_daily.sum_duration_sq + EXCLUDED.sum_duration_sq,\n\
               min_duration_seconds = LEAST(agg_phase_stats_daily.min_duration_seconds, EXCLUDED.min_duration_seconds),\n\
               max_duration_seconds = GREATEST(agg_phase_stats_daily.max_duration_seconds, EXCLUDED.max_duration_seconds),\n\
               updated_at = now()",
        )
        .bind(snapshot_date)
        .bind(since_watermark)
        .execute(&self.pool)
        .await?
        .rows_affected();

        info!(date = %snapshot_date, rows, "agg_phase_stats_daily computed");
        Ok(rows)
    }

    /// Daily order lead-time stats, grouped by product.
    pub async fn compute_order_stats_daily(
        &self,
        snapshot_date: NaiveDate,
        since_watermark: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        let rows = sqlx::query(
            "INSERT INTO agg_order_stats_daily\n\
               (snapshot_date, product_id, n, sum_leadtime_seconds, sum_leadtime_sq,\n\
                on_time_count, late_count)\n\
             SELECT $1, o.product_id,\n\
                    COUNT(*),\n\
                    SUM(EXTRACT(EPOCH FROM (o.finished_at - o.created_at))),\n\
                    SUM(EXTRACT(EPOCH FROM (o.finished_at - o.created_at))\n\
                        * EXTRACT(EPOCH FROM (o.finished_at - o.created_at))),\n\
                    COUNT(*) FILTER (WHERE o.transport_at IS NOT NULL AND o.finished_at <= o.transport_at),\n\
                    COUNT(*) FILTER (WHERE o.transport_at IS NOT NULL AND o.finished_at > o.transport_at)\n\
             FROM orders o\n\
             WHERE DATE(o.finished_at) = $1\n\
               AND o.created_at IS NOT NULL\n\
               AND o.finished_at IS NOT NULL\n\
               AND o.finished_at >= o.created_at\n\
               AND o.product_id IS NOT NULL\n\
               AND ($2::timestamptz IS NULL OR o.finished_at >= $2)\n\
             GROUP BY o.product_id\n\
             ON CONFLICT (snapshot_date, product_id) DO UPDATE SET\n\
               n = agg_order_stats_daily.n + EXCLUDED.n,\n\
               sum_leadtime_seconds = agg_order_stats_daily.sum_leadtime_seconds + EXCLUDED.sum_leadtime_seconds,\n\
               sum_leadtime_sq = agg_order_stats_daily.sum_leadtime_sq + EXCLUDED.sum_leadtime_sq,\n\
               on_time_count = agg_order_stats_daily.on_time_count + EXCLUDED.on_time_count,\n\
               late_count = agg_order_stats_daily.late_count + EXCLUDED.late_count,\n\
               updated_at = now()",
        )
        .bind(snapshot_date)
        .bind(since_watermark)
        .execute(&self.pool)
        .await?
        .rows_affected();

        info!(date = %snapshot_date, rows, "agg_order_stats_daily computed");
        Ok(rows)
    }

    /// Daily quality stats, grouped by product, evaluation phase and the
    /// blamed phase-event key (an opaque string; its referential integrity
    /// is unproven).
    pub async fn compute_quality_daily(
        &self,
        snapshot_date: NaiveDate,
        since_watermark: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        let rows = sqlx::query(
            "INSERT INTO agg_quality_daily\n\
               (snapshot_date, product_id, eval_phase_id, blamed_phase_event_key,\n\
                n_errors, sum_severity, affected_orders_count)\n\
             SELECT $1, o.product_id, e.eval_phase_id,\n\
                    COALESCE(e.blamed_phase_event_id, ''),\n\
                    COUNT(*),\n\
                    SUM(e.severity),\n\
                    COUNT(DISTINCT e.order_id)\n\
             FROM errors e\n\
             JOIN orders o ON e.order_id = o.order_id\n\
             WHERE DATE(e.event_time) = $1\n\
               AND e.eval_phase_id IS NOT NULL\n\
               AND o.product_id IS NOT NULL\n\
               AND ($2::timestamptz IS NULL OR e.event_time >= $2)\n\
             GROUP BY o.product_id, e.eval_phase_id, COALESCE(e.blamed_phase_event_id, '')\n\
             ON CONFLICT (snapshot_date, product_id, eval_phase_id, blamed_phase_event_key) DO UPDATE SET\n\
               n_errors = agg_quality_daily.n_errors + EXCLUDED.n_errors,\n\
               sum_severity = agg_quality_daily.sum_severity + EXCLUDED.sum_severity,\n\
               affected_orders_count = GREATEST(agg_quality_daily.affected_orders_count, EXCLUDED.affected_orders_count),\n\
               updated_at = now()",
        )
        .bind(snapshot_date)
        .bind(since_watermark)
        .execute(&self.pool)
        .await?
        .rows_affected();

        info!(date = %snapshot_date, rows, "agg_quality_daily computed");
        Ok(rows)
    }

    /// Current WIP snapshot: full recompute. The table is cleared and
    /// rebuilt in one transaction so groups whose open phases drop to zero
    /// disappear instead of keeping a stale row.
    pub async fn compute_wip_current(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM agg_wip_current")
            .execute(&mut *tx)
            .await?;

        let rows = sqlx::query(
            "INSERT INTO agg_wip_current\n\
               (phase_id, product_id, wip_count, sum_age_seconds, sum_age_sq,\n\
                min_age_seconds, max_age_seconds, oldest_event_time)\n\
             SELECT op.phase_id, o.product_id,\n\
                    COUNT(*),\n\
                    SUM(EXTRACT(EPOCH FROM (now() - op.started_at))),\n\
                    SUM(EXTRACT(EPOCH FROM (now() - op.started_at))\n\
                        * EXTRACT(EPOCH FROM (now() - op.started_at))),\n\
                    MIN(EXTRACT(EPOCH FROM (now() - op.started_at))),\n\
                    MAX(EXTRACT(EPOCH FROM (now() - op.started_at))),\n\
                    MIN(op.started_at)\n\
             FROM order_phases op\n\
             JOIN orders o ON op.order_id = o.order_id\n\
             WHERE op.is_open = true\n\
               AND op.phase_id IS NOT NULL\n\
               AND o.product_id IS NOT NULL\n\
             GROUP BY op.phase_id, o.product_id",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        info!(rows, "agg_wip_current recomputed");
        Ok(rows)
    }

    /// Compute all aggregates for one snapshot day, then advance the
    /// watermarks to the day's maximum event times.
    pub async fn compute_all_incremental(
        &self,
        snapshot_date: NaiveDate,
        run_id: Option<i64>,
    ) -> Result<AggregateSummary> {
        let wm_phase = self.get_watermark("order_phases", "event_time").await?;
        let wm_order = self.get_watermark("orders", "finished_at").await?;
        let wm_error = self.get_watermark("errors", "event_time").await?;

        let summary = AggregateSummary {
            phase_stats: self.compute_phase_stats_daily(snapshot_date, wm_phase).await?,
            order_stats: self.compute_order_stats_daily(snapshot_date, wm_order).await?,
            quality_stats: self.compute_quality_daily(snapshot_date, wm_error).await?,
            wip_current: self.compute_wip_current().await?,
        };

        for (table, column) in [
            ("order_phases", "event_time"),
            ("orders", "finished_at"),
            ("errors", "event_time"),
        ] {
            if let Some(max_ts) = self.max_timestamp(table, column, snapshot_date).await? {
                self.update_watermark(table, column, max_ts, run_id).await?;
            }
        }

        Ok(summary)
    }

    /// Refresh the trailing window, oldest day first so the watermarks end
    /// at the newest consumed timestamp.
    pub async fn refresh_window(
        &self,
        days: i64,
        run_id: Option<i64>,
    ) -> Result<AggregateSummary> {
        let today = Utc::now().date_naive();
        let mut total = AggregateSummary::default();
        for offset in (0..days).rev() {
            let snapshot_date = today - Duration::days(offset);
            let summary = self.compute_all_incremental(snapshot_date, run_id).await?;
            total.phase_stats += summary.phase_stats;
            total.order_stats += summary.order_stats;
            total.quality_stats += summary.quality_stats;
            total.wip_current = summary.wip_current;
        }
        Ok(total)
    }

    /// Maximum source timestamp observed for a snapshot day.
    async fn max_timestamp(
        &self,
        table: &str,
        column: &str,
        snapshot_date: NaiveDate,
    ) -> Result<Option<DateTime<Utc>>> {
        let sql = format!("SELECT MAX({column}) FROM {table} WHERE DATE({column}) = $1");
        let max: Option<DateTime<Utc>> = sqlx::query_scalar(&sql)
            .bind(snapshot_date)
            .fetch_one(&self.pool)
            .await?;
        Ok(max)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// In-memory mirror of the ON CONFLICT combine rules, used to check the
    /// monoid laws the SQL relies on.
    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Partial {
        n: i64,
        sum: f64,
        sum_sq: f64,
        min: Option<f64>,
        max: Option<f64>,
    }

    impl Partial {
        fn of(values: &[f64]) -> Self {
            Self {
                n: values.len() as i64,
                sum: values.iter().sum(),
                sum_sq: values.iter().map(|v| v * v).sum(),
                min: values.iter().copied().reduce(f64::min),
                max: values.iter().copied().reduce(f64::max),
            }
        }

        fn combine(self, other: Self) -> Self {
            Self {
                n: self.n + other.n,
                sum: self.sum + other.sum,
                sum_sq: self.sum_sq + other.sum_sq,
                min: match (self.min, other.min) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                },
                max: match (self.max, other.max) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                },
            }
        }
    }

    #[test]
    fn test_two_disjoint_ranges_equal_full_recompute() {
        let morning = [120.0, 240.0, 90.0];
        let evening = [300.0, 60.0];
        let all: Vec<f64> = morning.iter().chain(evening.iter()).copied().collect();

        let combined = Partial::of(&morning).combine(Partial::of(&evening));
        let full = Partial::of(&all);
        assert_eq!(combined, full);
    }

    #[test]
    fn test_combine_is_associative() {
        let a = Partial::of(&[10.0, 20.0]);
        let b = Partial::of(&[5.0]);
        let c = Partial::of(&[40.0, 80.0, 160.0]);
        assert_eq!(a.combine(b).combine(c), a.combine(b.combine(c)));
    }

    #[test]
    fn test_combine_with_empty_is_identity() {
        let a = Partial::of(&[42.0]);
        let empty = Partial::of(&[]);
        assert_eq!(a.combine(empty), a);
        assert_eq!(empty.combine(a), a);
    }

    #[test]
    fn test_recombining_same_partial_doubles_sum_of_squares() {
        // combining a partial with itself is not idempotent; the watermark
        // must advance between runs
        let a = Partial::of(&[10.0, 20.0]);
        let doubled = a.combine(a);
        assert_eq!(doubled.n, 2 * a.n);
        assert_eq!(doubled.sum_sq, 2.0 * a.sum_sq);
        assert_ne!(doubled, a);
    }

    #[test]
    fn test_watermark_name_is_table_dot_column() {
        assert_eq!(
            IncrementalAggregates::watermark_name("order_phases", "event_time"),
            "order_phases.event_time"
        );
    }

    #[test]
    fn test_refresh_window_iterates_oldest_first() {
        // (0..7).rev() visits offset 6 (oldest) down to 0 (today)
        let offsets: Vec<i64> = (0..DEFAULT_WINDOW_DAYS).rev().collect();
        assert_eq!(offsets.first(), Some(&6));
        assert_eq!(offsets.last(), Some(&0));
    }
}
