//! Background worker: a single-slot loop driving the periodic maintenance
//! jobs - incremental aggregates, current-WIP refresh, partition
//! maintenance, derived-column backfill. Jobs run one at a time and each is
//! wrapped in a timeout so a wedged statement cannot stall the loop.

use crate::aggregates::{IncrementalAggregates, DEFAULT_WINDOW_DAYS};
use crate::derived;
use crate::partitions;
use anyhow::Result;
use sqlx::PgPool;
use std::time::Duration;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{error, info, warn};

/// Per-job timeout.
pub const JOB_TIMEOUT_SECS: u64 = 300;

/// Worker schedule, overridable for tests.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub aggregates_every: Duration,
    pub wip_every: Duration,
    pub partitions_every: Duration,
    pub backfill_every: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            aggregates_every: Duration::from_secs(15 * 60),
            wip_every: Duration::from_secs(5 * 60),
            partitions_every: Duration::from_secs(24 * 60 * 60),
            backfill_every: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    RefreshAggregates,
    RefreshWip,
    EnsurePartitions,
    BackfillDerived,
}

impl Job {
    pub fn name(self) -> &'static str {
        match self {
            Job::RefreshAggregates => "refresh_aggregates",
            Job::RefreshWip => "refresh_wip",
            Job::EnsurePartitions => "ensure_partitions",
            Job::BackfillDerived => "backfill_derived",
        }
    }
}

/// Execute one job against the store.
pub async fn run_job(pool: &PgPool, job: Job) -> Result<()> {
    match job {
        Job::RefreshAggregates => {
            let aggregates = IncrementalAggregates::new(pool.clone());
            let summary = aggregates.refresh_window(DEFAULT_WINDOW_DAYS, None).await?;
            info!(?summary, "aggregates refreshed");
        }
        Job::RefreshWip => {
            let aggregates = IncrementalAggregates::new(pool.clone());
            aggregates.compute_wip_current().await?;
        }
        Job::EnsurePartitions => {
            let created = partitions::ensure_partitions_ahead(pool).await?;
            if !created.is_empty() {
                info!(created = created.len(), "partitions created ahead of horizon");
            }
            for health in partitions::partition_health(pool).await? {
                info!(parent = health.parent.as_str(), children = health.children, "partition health");
            }
        }
        Job::BackfillDerived => {
            derived::populate_all(pool).await?;
        }
    }
    Ok(())
}

async fn run_with_timeout(pool: &PgPool, job: Job) {
    info!(job = job.name(), "job started");
    match timeout(Duration::from_secs(JOB_TIMEOUT_SECS), run_job(pool, job)).await {
        Ok(Ok(())) => info!(job = job.name(), "job completed"),
        Ok(Err(e)) => error!(job = job.name(), error = %e, "job failed"),
        Err(_) => warn!(job = job.name(), timeout_secs = JOB_TIMEOUT_SECS, "job timed out"),
    }
}

/// Run the worker loop until the process is stopped. Partition maintenance
/// fires first so the ingestion window never sees a missing partition.
pub async fn run(pool: PgPool, config: WorkerConfig) -> Result<()> {
    info!("background worker started");

    run_with_timeout(&pool, Job::EnsurePartitions).await;

    let mut aggregates_tick = interval(config.aggregates_every);
    let mut wip_tick = interval(config.wip_every);
    let mut partitions_tick = interval(config.partitions_every);
    let mut backfill_tick = interval(config.backfill_every);
    for tick in [
        &mut aggregates_tick,
        &mut wip_tick,
        &mut partitions_tick,
        &mut backfill_tick,
    ] {
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // push the immediate first tick out one full period
        tick.reset();
    }

    loop {
        tokio::select! {
            _ = aggregates_tick.tick() => run_with_timeout(&pool, Job::RefreshAggregates).await,
            _ = wip_tick.tick() => run_with_timeout(&pool, Job::RefreshWip).await,
            _ = partitions_tick.tick() => run_with_timeout(&pool, Job::EnsurePartitions).await,
            _ = backfill_tick.tick() => run_with_timeout(&pool, Job::BackfillDerived).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_names_are_stable() {
        assert_eq!(Job::RefreshAggregates.name(), "refresh_aggregates");
        assert_eq!(Job::EnsurePartitions.name(), "ensure_partitions");
    }

    #[test]
    fn test_default_schedule_orders_of_magnitude() {
        let config = WorkerConfig::default();
        assert!(config.wip_every < config.aggregates_every);
        assert!(config.aggregates_every < config.partitions_every);
    }
}
