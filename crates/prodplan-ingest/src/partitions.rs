//! Partition maintenance. Monthly RANGE partitions for `order_phases` must
//! exist ahead of the data or COPY/merge fails with "no partition for given
//! value"; the maintenance job keeps a six-month horizon. HASH partition
//! counts are fixed by the migrations and only verified here.

use anyhow::Result;
use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::info;

/// Months of future partitions kept ahead of today.
pub const PARTITION_HORIZON_MONTHS: u32 = 6;

/// First day of the month following `date`.
pub fn next_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    // day 1 of a valid month always exists
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date)
}

/// First day of `date`'s month.
pub fn month_floor(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date)
}

/// Partition name for the month of `date`.
pub fn partition_name(parent: &str, date: NaiveDate) -> String {
    format!("{parent}_p_{:04}_{:02}", date.year(), date.month())
}

/// Create missing monthly partitions for `order_phases` out to the horizon.
/// Returns the names created.
pub async fn ensure_partitions_ahead(pool: &PgPool) -> Result<Vec<String>> {
    let today = Utc::now().date_naive();
    let horizon = {
        let mut d = month_floor(today);
        for _ in 0..PARTITION_HORIZON_MONTHS {
            d = next_month(d);
        }
        d
    };

    let mut created = Vec::new();
    let mut current = month_floor(today);
    while current <= horizon {
        let name = partition_name("order_phases", current);
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (\n\
               SELECT 1 FROM pg_class c\n\
               JOIN pg_namespace n ON c.relnamespace = n.oid\n\
               WHERE c.relname = $1 AND n.nspname IN ('public', 'core')\n\
             )",
        )
        .bind(&name)
        .fetch_one(pool)
        .await?;

        if !exists {
            let upper = next_month(current);
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {name} PARTITION OF order_phases\n\
                 FOR VALUES FROM ('{current}') TO ('{upper}')"
            );
            sqlx::query(&sql).execute(pool).await?;
            info!(partition = name.as_str(), "partition created");
            created.push(name);
        }
        current = next_month(current);
    }

    Ok(created)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionHealth {
    pub parent: String,
    pub children: i64,
}

/// Count child partitions of a partitioned parent.
pub async fn partition_count(pool: &PgPool, parent: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*)\n\
         FROM pg_inherits i\n\
         JOIN pg_class p ON i.inhparent = p.oid\n\
         WHERE p.relname = $1",
    )
    .bind(parent)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Child counts for every partitioned parent.
pub async fn partition_health(pool: &PgPool) -> Result<Vec<PartitionHealth>> {
    let mut out = Vec::new();
    for parent in ["order_phases", "phase_workers", "errors"] {
        out.push(PartitionHealth {
            parent: parent.to_string(),
            children: partition_count(pool, parent).await?,
        });
    }
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_next_month_rolls_over_year() {
        assert_eq!(next_month(d(2025, 12, 1)), d(2026, 1, 1));
        assert_eq!(next_month(d(2025, 7, 15)), d(2025, 8, 1));
    }

    #[test]
    fn test_month_floor() {
        assert_eq!(month_floor(d(2025, 7, 31)), d(2025, 7, 1));
    }

    #[test]
    fn test_partition_name_zero_pads() {
        assert_eq!(partition_name("order_phases", d(2026, 3, 1)), "order_phases_p_2026_03");
        assert_eq!(partition_name("order_phases", d(2025, 11, 1)), "order_phases_p_2025_11");
    }

    #[test]
    fn test_horizon_spans_six_months() {
        let mut date = d(2025, 10, 1);
        for _ in 0..PARTITION_HORIZON_MONTHS {
            date = next_month(date);
        }
        assert_eq!(date, d(2026, 4, 1));
    }
}
