//! Feature-gate evaluator: turns relationship match rates into
//! `FEATURE_GATES.json`. Downstream services consult this document and
//! short-circuit endpoints whose gate is disabled, returning a structured
//! `NOT_SUPPORTED_BY_DATA` payload instead of computed numbers.

use crate::inspector::RelationshipsReport;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// worker_productivity joins phase-events to their workers; below this the
/// numbers would be fiction.
pub const WORKER_PRODUCTIVITY_THRESHOLD: f64 = 0.90;

/// product_join tolerates orphans but flags itself degraded below this.
pub const PRODUCT_JOIN_THRESHOLD: f64 = 0.95;

const WORKER_PRODUCTIVITY_RELATIONSHIP: &str = "PhaseWorker_PhaseEventId -> PhaseEvent_Id";
const PRODUCT_JOIN_RELATIONSHIP: &str = "Product_Id -> Order_ProductId";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureGate {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<bool>,
    pub match_rate: f64,
    pub threshold: f64,
    pub reason: String,
    pub relationship: String,
    /// Critical gates block the release when disabled.
    pub critical: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orphan_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureGates {
    pub generated_at: DateTime<Utc>,
    pub gates: BTreeMap<String, FeatureGate>,
}

/// The payload a gated endpoint returns instead of computed results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotSupportedByData {
    pub status: String,
    pub reason: String,
    pub match_rate: f64,
    pub suggestion: String,
}

impl NotSupportedByData {
    pub fn from_gate(feature: &str, gate: &FeatureGate) -> Self {
        Self {
            status: "NOT_SUPPORTED_BY_DATA".to_string(),
            reason: format!(
                "{feature} depends on '{}' with match rate {:.1}% below threshold {:.0}%",
                gate.relationship,
                gate.match_rate * 100.0,
                gate.threshold * 100.0
            ),
            match_rate: gate.match_rate,
            suggestion: "Re-run the inspector after the source data improves".to_string(),
        }
    }
}

fn match_rate_of(report: &RelationshipsReport, relationship: &str) -> (f64, Option<usize>) {
    report
        .relationships
        .get(relationship)
        .map(|r| (r.match_rate.unwrap_or(0.0), Some(r.orphan_count)))
        .unwrap_or((0.0, None))
}

/// Evaluate all gates from a relationships report.
pub fn evaluate(report: &RelationshipsReport) -> FeatureGates {
    let mut gates = BTreeMap::new();

    let (rate, orphans) = match_rate_of(report, WORKER_PRODUCTIVITY_RELATIONSHIP);
    let enabled = rate >= WORKER_PRODUCTIVITY_THRESHOLD;
    gates.insert(
        "worker_productivity".to_string(),
        FeatureGate {
            enabled,
            degraded: None,
            match_rate: rate,
            threshold: WORKER_PRODUCTIVITY_THRESHOLD,
            reason: format!(
                "Match rate {:.1}% {} threshold {:.0}%",
                rate * 100.0,
                if enabled { "meets" } else { "below" },
                WORKER_PRODUCTIVITY_THRESHOLD * 100.0
            ),
            relationship: WORKER_PRODUCTIVITY_RELATIONSHIP.to_string(),
            critical: true,
            orphan_count: orphans,
        },
    );

    let (rate, orphans) = match_rate_of(report, PRODUCT_JOIN_RELATIONSHIP);
    let degraded = rate < PRODUCT_JOIN_THRESHOLD;
    gates.insert(
        "product_join".to_string(),
        FeatureGate {
            // always enabled; consumers see the degraded flag instead
            enabled: true,
            degraded: Some(degraded),
            match_rate: rate,
            threshold: PRODUCT_JOIN_THRESHOLD,
            reason: format!(
                "Match rate {:.1}% {} threshold {:.0}% (degraded mode)",
                rate * 100.0,
                if degraded { "below" } else { "meets" },
                PRODUCT_JOIN_THRESHOLD * 100.0
            ),
            relationship: PRODUCT_JOIN_RELATIONSHIP.to_string(),
            critical: false,
            orphan_count: orphans,
        },
    );

    FeatureGates {
        generated_at: Utc::now(),
        gates,
    }
}

/// Regenerate `FEATURE_GATES.json` from the relationships report on disk.
/// A missing report evaluates to disabled gates (cold start).
pub fn evaluate_from_files(relationships_path: &Path, output_path: &Path) -> Result<FeatureGates> {
    let gates = match std::fs::read_to_string(relationships_path) {
        Ok(content) => {
            let report: RelationshipsReport = serde_json::from_str(&content)?;
            evaluate(&report)
        }
        Err(_) => {
            warn!(
                path = %relationships_path.display(),
                "relationships report not found, generating disabled gates"
            );
            evaluate(&empty_report())
        }
    };

    crate::reports::write_json(output_path, &gates)?;
    for (name, gate) in &gates.gates {
        info!(
            gate = name.as_str(),
            enabled = gate.enabled,
            degraded = gate.degraded.unwrap_or(false),
            match_rate = gate.match_rate,
            "feature gate evaluated"
        );
    }
    Ok(gates)
}

/// Load a previously generated FEATURE_GATES.json.
pub fn load(path: &Path) -> Result<FeatureGates> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn empty_report() -> RelationshipsReport {
    RelationshipsReport {
        generated_at: Utc::now(),
        relationships: BTreeMap::new(),
        summary: crate::inspector::RelationshipsSummary {
            total_relationships: 0,
            validated: 0,
            high_match_rate: 0,
            low_match_rate: 0,
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::inspector::RelationshipResult;

    fn report_with(rate: f64) -> RelationshipsReport {
        let mut report = empty_report();
        report.relationships.insert(
            WORKER_PRODUCTIVITY_RELATIONSHIP.to_string(),
            RelationshipResult {
                from_sheet: "OrderPhases".into(),
                from_col: "PhaseEvent_Id".into(),
                to_sheet: "PhaseWorkers".into(),
                to_col: "PhaseWorker_PhaseEventId".into(),
                critical: true,
                match_rate: Some(rate),
                matches: 0,
                total_from: 0,
                total_to: 0,
                orphan_count: 42,
                orphans: Vec::new(),
                error: None,
            },
        );
        report.relationships.insert(
            PRODUCT_JOIN_RELATIONSHIP.to_string(),
            RelationshipResult {
                from_sheet: "Products".into(),
                from_col: "Product_Id".into(),
                to_sheet: "Orders".into(),
                to_col: "Order_ProductId".into(),
                critical: true,
                match_rate: Some(0.97),
                matches: 0,
                total_from: 0,
                total_to: 0,
                orphan_count: 3,
                orphans: Vec::new(),
                error: None,
            },
        );
        report
    }

    #[test]
    fn test_low_match_rate_disables_worker_productivity() {
        // the S5 scenario: a critical relationship at 32.3%
        let gates = evaluate(&report_with(0.323));
        let gate = &gates.gates["worker_productivity"];
        assert!(!gate.enabled);
        assert!(gate.critical);
        assert_eq!(gate.match_rate, 0.323);
        assert!(gate.reason.contains("below"));
    }

    #[test]
    fn test_high_match_rate_enables_worker_productivity() {
        let gates = evaluate(&report_with(0.95));
        assert!(gates.gates["worker_productivity"].enabled);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let gates = evaluate(&report_with(0.90));
        assert!(gates.gates["worker_productivity"].enabled);
    }

    #[test]
    fn test_product_join_stays_enabled_but_degrades() {
        let mut report = report_with(0.95);
        report
            .relationships
            .get_mut(PRODUCT_JOIN_RELATIONSHIP)
            .unwrap()
            .match_rate = Some(0.80);
        let gates = evaluate(&report);
        let gate = &gates.gates["product_join"];
        assert!(gate.enabled);
        assert_eq!(gate.degraded, Some(true));
    }

    #[test]
    fn test_missing_relationship_means_disabled() {
        let gates = evaluate(&empty_report());
        assert!(!gates.gates["worker_productivity"].enabled);
        assert_eq!(gates.gates["worker_productivity"].match_rate, 0.0);
    }

    #[test]
    fn test_not_supported_payload_shape() {
        let gates = evaluate(&report_with(0.323));
        let payload =
            NotSupportedByData::from_gate("worker_productivity", &gates.gates["worker_productivity"]);
        assert_eq!(payload.status, "NOT_SUPPORTED_BY_DATA");
        assert_eq!(payload.match_rate, 0.323);
        assert!(payload.reason.contains("32.3%"));
    }

    #[test]
    fn test_round_trip_through_json() {
        let gates = evaluate(&report_with(0.91));
        let json = serde_json::to_string_pretty(&gates).unwrap();
        let back: FeatureGates = serde_json::from_str(&json).unwrap();
        assert_eq!(back.gates["worker_productivity"].enabled, true);
        assert_eq!(back.gates.len(), 2);
    }
}
