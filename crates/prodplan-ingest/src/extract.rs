//! Extract stage: stream every workbook sheet to a gzipped CSV with a stable
//! header, computing per-sheet and file-level SHA-256 checksums. The
//! file-level checksum is the idempotency key of the ingestion run.

use crate::reports::{ExtractionReport, SheetExtraction};
use anyhow::{Context, Result};
use calamine::{open_workbook, Data, Reader, Xlsx};
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use prodplan_common::checksum::{file_sha256, RollingSha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Extracts workbook sheets to CSV.gz artifacts.
pub struct SheetExtractor {
    source_path: PathBuf,
    output_dir: PathBuf,
}

impl SheetExtractor {
    pub fn new(source_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            output_dir: output_dir.into(),
        }
    }

    /// Extract all sheets and assemble the extraction report.
    pub fn extract_all(&self) -> Result<ExtractionReport> {
        std::fs::create_dir_all(&self.output_dir)?;

        let mut workbook: Xlsx<_> = open_workbook(&self.source_path)
            .with_context(|| format!("cannot open source workbook {}", self.source_path.display()))?;

        let mut sheets = BTreeMap::new();
        let mut per_sheet_sha256 = BTreeMap::new();
        let mut total_rows = 0u64;

        for sheet_name in workbook.sheet_names() {
            let range = workbook
                .worksheet_range(&sheet_name)
                .with_context(|| format!("cannot read sheet {sheet_name}"))?;
            let extraction = self.extract_sheet(&sheet_name, &range)?;
            total_rows += extraction.row_count;
            per_sheet_sha256.insert(sheet_name.clone(), extraction.sha256.clone());
            sheets.insert(sheet_name, extraction);
        }

        let source_sha256 = file_sha256(&self.source_path)?;

        Ok(ExtractionReport {
            source_path: self.source_path.display().to_string(),
            source_sha256,
            per_sheet_sha256,
            sheets,
            total_rows_extracted: total_rows,
            extracted_at: Utc::now(),
        })
    }

    fn extract_sheet(
        &self,
        sheet_name: &str,
        range: &calamine::Range<Data>,
    ) -> Result<SheetExtraction> {
        info!(sheet = sheet_name, "extracting sheet");

        let mut rows = range.rows();
        let headers: Vec<String> = match rows.next() {
            Some(header_row) => header_row
                .iter()
                .enumerate()
                .map(|(i, cell)| match cell {
                    Data::Empty => format!("col_{}", i + 1),
                    other => normalize_cell(other).trim().to_string(),
                })
                .collect(),
            None => Vec::new(),
        };

        let csv_gz_path = self.output_dir.join(format!("{sheet_name}.csv.gz"));
        let file = std::fs::File::create(&csv_gz_path)?;
        let encoder = GzEncoder::new(file, Compression::new(6));
        let mut writer = csv::Writer::from_writer(encoder);

        let mut sha = RollingSha256::new();
        let mut row_count = 0u64;

        if !headers.is_empty() {
            writer.write_record(&headers)?;
            sha.update(headers.join(",").as_bytes());
        }

        for row in rows {
            let normalized: Vec<String> = row.iter().map(normalize_cell).collect();
            writer.write_record(&normalized)?;
            sha.update(normalized.join(",").as_bytes());
            row_count += 1;
        }

        writer.flush()?;
        let encoder = writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("csv writer flush failed: {e}"))?;
        encoder.finish()?;

        let sha256 = sha.finish();
        let compressed_bytes = std::fs::metadata(&csv_gz_path)?.len();

        info!(
            sheet = sheet_name,
            rows = row_count,
            bytes = compressed_bytes,
            %sha256,
            "sheet extracted"
        );

        Ok(SheetExtraction {
            sheet_name: sheet_name.to_string(),
            file_path: csv_gz_path.display().to_string(),
            row_count,
            sha256,
            compressed_bytes,
        })
    }
}

/// Normalize one cell to its CSV text form: missing cells become the empty
/// string, datetimes ISO-8601, integral floats lose the fractional part.
pub fn normalize_cell(data: &Data) -> String {
    match data {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
                format!("{}", *f as i64)
            } else {
                f.to_string()
            }
        }
        Data::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|ndt| ndt.format("%Y-%m-%dT%H:%M:%S").to_string())
            .unwrap_or_else(|| dt.as_f64().to_string()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Error(e) => e.to_string(),
    }
}

/// Decompress the header line of a CSV.gz artifact.
pub fn read_csv_gz_header(path: &Path) -> Result<Vec<String>> {
    use flate2::read::GzDecoder;
    use std::io::{BufRead, BufReader};

    let file = std::fs::File::open(path)
        .with_context(|| format!("cannot open {}", path.display()))?;
    let mut reader = BufReader::new(GzDecoder::new(file));
    let mut line = String::new();
    reader.read_line(&mut line)?;

    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(line.as_bytes());
    let record = csv_reader
        .records()
        .next()
        .transpose()?
        .unwrap_or_default();
    Ok(record.iter().map(|s| s.to_string()).collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_cell_empty_and_text() {
        assert_eq!(normalize_cell(&Data::Empty), "");
        assert_eq!(normalize_cell(&Data::String("OF1001".into())), "OF1001");
    }

    #[test]
    fn test_normalize_cell_numbers() {
        assert_eq!(normalize_cell(&Data::Int(42)), "42");
        // integral floats are rendered without a fractional part
        assert_eq!(normalize_cell(&Data::Float(42.0)), "42");
        assert_eq!(normalize_cell(&Data::Float(3.25)), "3.25");
    }

    #[test]
    fn test_normalize_cell_bool() {
        assert_eq!(normalize_cell(&Data::Bool(true)), "TRUE");
        assert_eq!(normalize_cell(&Data::Bool(false)), "FALSE");
    }

    #[test]
    fn test_csv_gz_round_trip_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Orders.csv.gz");

        let file = std::fs::File::create(&path).unwrap();
        let encoder = GzEncoder::new(file, Compression::new(6));
        let mut writer = csv::Writer::from_writer(encoder);
        writer
            .write_record(["Order_Id", "Order_CreatedAt", "Order_FinishedAt"])
            .unwrap();
        writer.write_record(["OF1", "2024-01-01T00:00:00", ""]).unwrap();
        writer.flush().unwrap();
        writer.into_inner().unwrap().finish().unwrap();

        let header = read_csv_gz_header(&path).unwrap();
        assert_eq!(header, vec!["Order_Id", "Order_CreatedAt", "Order_FinishedAt"]);
    }
}
