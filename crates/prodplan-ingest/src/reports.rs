//! Pipeline report artifacts.
//!
//! Every stage writes a JSON report under `data/processed/`; the final
//! `ingestion_report.json` embeds the stage reports so a failed run is
//! diagnosable from a single file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Per-sheet result of the extract stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetExtraction {
    pub sheet_name: String,
    pub file_path: String,
    pub row_count: u64,
    pub sha256: String,
    pub compressed_bytes: u64,
}

/// Extract stage report (`extraction_report.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionReport {
    pub source_path: String,
    /// File-level SHA-256 over the raw workbook bytes; the idempotency key.
    pub source_sha256: String,
    pub per_sheet_sha256: BTreeMap<String, String>,
    pub sheets: BTreeMap<String, SheetExtraction>,
    pub total_rows_extracted: u64,
    pub extracted_at: DateTime<Utc>,
}

/// Per-sheet result of the load stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetLoad {
    pub sheet_name: String,
    pub staging_table: String,
    pub row_count: u64,
    pub elapsed_seconds: f64,
    pub status: SheetStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Load stage report (`load_report.json`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoadReport {
    pub loaded_sheets: usize,
    pub failed_sheets: usize,
    pub results: BTreeMap<String, SheetLoad>,
}

/// Per-sheet result of the merge stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetMerge {
    pub sheet_name: String,
    pub staging_count: i64,
    pub processed: u64,
    pub rejected: u64,
    pub elapsed_seconds: f64,
    pub status: SheetStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Merge stage report (`merge_report.json`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MergeReport {
    pub run_id: i64,
    pub merged_sheets: usize,
    pub failed_sheets: usize,
    pub total_processed: u64,
    pub total_rejected: u64,
    pub results: BTreeMap<String, SheetMerge>,
}

/// Sheet-level outcome; a failed sheet does not abort the run but fails the
/// gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SheetStatus {
    Completed,
    Failed,
}

/// Count-contract outcome embedded in the ingestion report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub status: ValidationStatus,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValidationStatus {
    Passed,
    Failed,
}

/// Final run report (`ingestion_report.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionReport {
    pub run_id: i64,
    pub source_sha256: String,
    /// True when this invocation short-circuited to a prior completed run.
    pub idempotent_hit: bool,
    pub total_processed: u64,
    pub total_rejected: u64,
    pub elapsed_seconds: f64,
    pub extraction: ExtractionReport,
    pub load: LoadReport,
    pub merge: MergeReport,
    pub validation: ValidationSummary,
}

/// Serialize a report to pretty JSON at `path`, creating parent directories.
pub fn write_json<T: Serialize>(path: &Path, report: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json)?;
    tracing::info!(path = %path.display(), "report written");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sheet_status_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&SheetStatus::Failed).unwrap(), "\"FAILED\"");
        assert_eq!(
            serde_json::to_string(&ValidationStatus::Passed).unwrap(),
            "\"PASSED\""
        );
    }

    #[test]
    fn test_load_report_round_trip() {
        let mut report = LoadReport::default();
        report.results.insert(
            "Orders".to_string(),
            SheetLoad {
                sheet_name: "Orders".to_string(),
                staging_table: "staging.orders_raw".to_string(),
                row_count: 27_380,
                elapsed_seconds: 1.5,
                status: SheetStatus::Completed,
                error: None,
            },
        );
        report.loaded_sheets = 1;

        let json = serde_json::to_string(&report).unwrap();
        let back: LoadReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.results["Orders"].row_count, 27_380);
        assert_eq!(back.results["Orders"].status, SheetStatus::Completed);
    }

    #[test]
    fn test_write_json_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/reports/load_report.json");
        write_json(&path, &LoadReport::default()).unwrap();
        assert!(path.exists());
    }
}
