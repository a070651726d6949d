//! Inspector: profiles every sheet of the source workbook and validates the
//! declared cross-sheet relationships. Read-only; writes nothing to the
//! store. Emits three reports: a human-readable data dictionary, a JSON
//! profile, and a JSON relationships report.

use crate::sheets::{RelationshipSpec, RELATIONSHIPS};
use anyhow::Result;
use calamine::{open_workbook, Data, Reader, Xlsx};
use chrono::{DateTime, NaiveDateTime, Utc};
use prodplan_common::checksum::file_sha256;
use prodplan_common::error::ProdplanError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::info;

/// Rows sampled per sheet for column profiling; distinct counts are exact up
/// to this sample and approximate beyond it.
const PROFILE_SAMPLE_ROWS: usize = 10_000;

/// Non-null values sampled for type inference.
const TYPE_SAMPLE_VALUES: usize = 1_000;

/// Rows scanned per sheet when collecting relationship value sets.
const RELATIONSHIP_SCAN_ROWS: usize = 100_000;

/// Orphan values listed per relationship.
const MAX_ORPHANS_LISTED: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TopValue {
    pub value: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnProfile {
    pub inferred_type: String,
    pub null_rate: f64,
    pub null_count: u64,
    pub distinct_approx: usize,
    pub cardinality_rate: f64,
    pub examples: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_date: Option<String>,
    pub top_values: Vec<TopValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetProfile {
    pub sheet_name: String,
    pub headers: Vec<String>,
    pub row_count: u64,
    pub column_count: usize,
    pub columns: BTreeMap<String, ColumnProfile>,
    pub pk_candidates: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileReport {
    pub generated_at: DateTime<Utc>,
    pub source_path: String,
    pub source_sha256: String,
    pub sheets: BTreeMap<String, SheetProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipResult {
    pub from_sheet: String,
    pub from_col: String,
    pub to_sheet: String,
    pub to_col: String,
    pub critical: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_rate: Option<f64>,
    pub matches: usize,
    pub total_from: usize,
    pub total_to: usize,
    pub orphan_count: usize,
    pub orphans: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipsSummary {
    pub total_relationships: usize,
    pub validated: usize,
    pub high_match_rate: usize,
    pub low_match_rate: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipsReport {
    pub generated_at: DateTime<Utc>,
    pub relationships: BTreeMap<String, RelationshipResult>,
    pub summary: RelationshipsSummary,
}

/// Workbook inspector.
pub struct Inspector {
    source_path: PathBuf,
}

impl Inspector {
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
        }
    }

    /// Profile all sheets, validate relationships, and write the three
    /// reports into `output_dir`.
    pub fn generate_reports(&self, output_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(output_dir)?;

        let mut workbook: Xlsx<_> = open_workbook(&self.source_path).map_err(|e| {
            ProdplanError::InspectorRead(format!("{}: {e}", self.source_path.display()))
        })?;

        let mut sheet_profiles = BTreeMap::new();
        for sheet_name in workbook.sheet_names() {
            info!(sheet = %sheet_name, "inspecting sheet");
            let range = workbook
                .worksheet_range(&sheet_name)
                .map_err(|e| ProdplanError::InspectorRead(format!("{sheet_name}: {e}")))?;
            let profile = profile_sheet(&sheet_name, &range)?;
            sheet_profiles.insert(sheet_name, profile);
        }

        info!("validating declared relationships");
        let relationships = self.validate_relationships(&mut workbook)?;

        let profile = ProfileReport {
            generated_at: Utc::now(),
            source_path: self.source_path.display().to_string(),
            source_sha256: file_sha256(&self.source_path)?,
            sheets: sheet_profiles,
        };

        crate::reports::write_json(&output_dir.join("PROFILE_REPORT.json"), &profile)?;
        crate::reports::write_json(&output_dir.join("RELATIONSHIPS_REPORT.json"), &relationships)?;
        std::fs::write(
            output_dir.join("DATA_DICTIONARY.md"),
            render_data_dictionary(&profile),
        )?;

        info!(dir = %output_dir.display(), "inspection reports written");
        Ok(())
    }

    /// Compute match rates and orphans for every declared relationship.
    fn validate_relationships(
        &self,
        workbook: &mut Xlsx<std::io::BufReader<std::fs::File>>,
    ) -> Result<RelationshipsReport> {
        // column value sets are only collected for columns a relationship touches
        let mut wanted: HashMap<&str, BTreeSet<&str>> = HashMap::new();
        for rel in RELATIONSHIPS {
            wanted.entry(rel.from_sheet).or_default().insert(rel.from_col);
            wanted.entry(rel.to_sheet).or_default().insert(rel.to_col);
        }

        let mut value_sets: HashMap<(String, String), HashSet<String>> = HashMap::new();
        for (sheet_name, cols) in &wanted {
            let range = match workbook.worksheet_range(sheet_name) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let mut rows = range.rows();
            let headers: Vec<String> = rows
                .next()
                .map(|r| r.iter().map(cell_text).collect())
                .unwrap_or_default();

            let indices: Vec<(usize, String)> = headers
                .iter()
                .enumerate()
                .filter(|(_, h)| cols.contains(h.as_str()))
                .map(|(i, h)| (i, h.clone()))
                .collect();

            for row in rows.take(RELATIONSHIP_SCAN_ROWS) {
                for (idx, header) in &indices {
                    if let Some(cell) = row.get(*idx) {
                        let text = cell_text(cell);
                        let trimmed = text.trim();
                        if !trimmed.is_empty() {
                            value_sets
                                .entry((sheet_name.to_string(), header.clone()))
                                .or_default()
                                .insert(trimmed.to_string());
                        }
                    }
                }
            }
        }

        let mut relationships = BTreeMap::new();
        for rel in RELATIONSHIPS {
            relationships.insert(rel.name.to_string(), evaluate_relationship(rel, &value_sets));
        }

        let validated = relationships
            .values()
            .filter(|r| r.match_rate.is_some())
            .count();
        let high = relationships
            .values()
            .filter(|r| r.match_rate.is_some_and(|m| m > 0.99))
            .count();
        let low = relationships
            .values()
            .filter(|r| r.match_rate.is_some_and(|m| m < 0.9))
            .count();

        Ok(RelationshipsReport {
            generated_at: Utc::now(),
            summary: RelationshipsSummary {
                total_relationships: relationships.len(),
                validated,
                high_match_rate: high,
                low_match_rate: low,
            },
            relationships,
        })
    }
}

fn cell_text(data: &Data) -> String {
    crate::extract::normalize_cell(data)
}

/// Match rate of one relationship: the fraction of distinct referencing
/// values resolvable against the referenced column, with up to 100 orphans.
fn evaluate_relationship(
    rel: &RelationshipSpec,
    value_sets: &HashMap<(String, String), HashSet<String>>,
) -> RelationshipResult {
    let mut result = RelationshipResult {
        from_sheet: rel.from_sheet.to_string(),
        from_col: rel.from_col.to_string(),
        to_sheet: rel.to_sheet.to_string(),
        to_col: rel.to_col.to_string(),
        critical: rel.critical,
        match_rate: None,
        matches: 0,
        total_from: 0,
        total_to: 0,
        orphan_count: 0,
        orphans: Vec::new(),
        error: None,
    };

    let from_key = (rel.from_sheet.to_string(), rel.from_col.to_string());
    let to_key = (rel.to_sheet.to_string(), rel.to_col.to_string());

    let (Some(from_values), Some(to_values)) = (value_sets.get(&from_key), value_sets.get(&to_key))
    else {
        result.error = Some(format!(
            "column not found: {}.{} or {}.{}",
            rel.from_sheet, rel.from_col, rel.to_sheet, rel.to_col
        ));
        return result;
    };

    let matches = to_values.intersection(from_values).count();
    result.matches = matches;
    result.total_from = from_values.len();
    result.total_to = to_values.len();
    result.match_rate = Some(if to_values.is_empty() {
        0.0
    } else {
        round4(matches as f64 / to_values.len() as f64)
    });

    let mut orphans: Vec<String> = to_values.difference(from_values).cloned().collect();
    orphans.sort();
    result.orphan_count = orphans.len();
    orphans.truncate(MAX_ORPHANS_LISTED);
    result.orphans = orphans;

    result
}

/// Profile one sheet from its cell range.
pub fn profile_sheet(sheet_name: &str, range: &calamine::Range<Data>) -> Result<SheetProfile> {
    let mut rows = range.rows();
    let header_row = rows.next().ok_or_else(|| {
        ProdplanError::InspectorRead(format!("sheet {sheet_name} has no header row"))
    })?;
    let headers: Vec<String> = header_row
        .iter()
        .enumerate()
        .map(|(i, cell)| match cell {
            Data::Empty => format!("col_{}", i + 1),
            other => cell_text(other).trim().to_string(),
        })
        .collect();

    let total_rows = range.height().saturating_sub(1) as u64;

    let mut samples: Vec<Vec<Data>> = Vec::new();
    for row in rows.take(PROFILE_SAMPLE_ROWS) {
        samples.push(row.to_vec());
    }

    let columns = profile_columns(&headers, &samples);

    let pk_candidates: Vec<String> = columns
        .iter()
        .filter(|(_, p)| p.null_rate < 0.01 && p.cardinality_rate > 0.95)
        .map(|(name, _)| name.clone())
        .collect();

    Ok(SheetProfile {
        sheet_name: sheet_name.to_string(),
        column_count: headers.len(),
        headers,
        row_count: total_rows,
        columns,
        pk_candidates,
    })
}

/// Per-column statistics over a row sample.
fn profile_columns(headers: &[String], samples: &[Vec<Data>]) -> BTreeMap<String, ColumnProfile> {
    let mut columns = BTreeMap::new();

    for (col_idx, header) in headers.iter().enumerate() {
        let values: Vec<&Data> = samples
            .iter()
            .map(|row| row.get(col_idx).unwrap_or(&Data::Empty))
            .collect();

        let non_null: Vec<&Data> = values
            .iter()
            .copied()
            .filter(|v| !is_null_cell(v))
            .collect();
        let null_count = (values.len() - non_null.len()) as u64;
        let null_rate = if values.is_empty() {
            0.0
        } else {
            null_count as f64 / values.len() as f64
        };

        let inferred_type = infer_type(&non_null);

        let mut distinct: BTreeSet<String> = BTreeSet::new();
        let mut counts: HashMap<String, u64> = HashMap::new();
        for v in &non_null {
            let text = cell_text(v).trim().to_string();
            *counts.entry(text.clone()).or_default() += 1;
            distinct.insert(text);
        }
        let cardinality = distinct.len();
        let cardinality_rate = if non_null.is_empty() {
            0.0
        } else {
            cardinality as f64 / non_null.len() as f64
        };

        let examples: Vec<String> = distinct.iter().take(5).cloned().collect();

        let (min_date, max_date) = if inferred_type == "date" {
            date_bounds(&non_null)
        } else {
            (None, None)
        };

        // low cardinality reads as categorical
        let top_values = if cardinality_rate < 0.1 && !non_null.is_empty() {
            let mut pairs: Vec<(String, u64)> = counts.into_iter().collect();
            pairs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            pairs
                .into_iter()
                .take(10)
                .map(|(value, count)| TopValue { value, count })
                .collect()
        } else {
            Vec::new()
        };

        columns.insert(
            header.clone(),
            ColumnProfile {
                inferred_type,
                null_rate: round4(null_rate),
                null_count,
                distinct_approx: cardinality,
                cardinality_rate: round4(cardinality_rate),
                examples,
                min_date,
                max_date,
                top_values,
            },
        );
    }

    columns
}

fn is_null_cell(data: &Data) -> bool {
    match data {
        Data::Empty => true,
        Data::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Majority-vote type inference, priority date > integer > float > string.
fn infer_type(non_null: &[&Data]) -> String {
    let mut date_count = 0usize;
    let mut numeric_count = 0usize;
    let mut int_count = 0usize;
    let sample_len = non_null.len().min(TYPE_SAMPLE_VALUES);

    for v in non_null.iter().take(TYPE_SAMPLE_VALUES) {
        match v {
            Data::DateTime(_) | Data::DateTimeIso(_) => date_count += 1,
            Data::Int(_) => {
                numeric_count += 1;
                int_count += 1;
            }
            Data::Float(f) => {
                numeric_count += 1;
                if f.fract() == 0.0 {
                    int_count += 1;
                }
            }
            _ => {}
        }
    }

    if sample_len == 0 {
        return "string".to_string();
    }
    let threshold = (sample_len as f64 * 0.8) as usize;
    if date_count > threshold {
        "date".to_string()
    } else if numeric_count > threshold {
        if int_count as f64 > numeric_count as f64 * 0.9 {
            "integer".to_string()
        } else {
            "float".to_string()
        }
    } else {
        "string".to_string()
    }
}

fn date_bounds(non_null: &[&Data]) -> (Option<String>, Option<String>) {
    let mut min: Option<NaiveDateTime> = None;
    let mut max: Option<NaiveDateTime> = None;
    for v in non_null {
        if let Data::DateTime(dt) = v {
            if let Some(ndt) = dt.as_datetime() {
                min = Some(min.map_or(ndt, |m| m.min(ndt)));
                max = Some(max.map_or(ndt, |m| m.max(ndt)));
            }
        }
    }
    (
        min.map(|d| d.format("%Y-%m-%dT%H:%M:%S").to_string()),
        max.map(|d| d.format("%Y-%m-%dT%H:%M:%S").to_string()),
    )
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

/// Render the human-readable data dictionary.
pub fn render_data_dictionary(profile: &ProfileReport) -> String {
    let mut md = String::new();
    md.push_str("# Data Dictionary\n\n");
    md.push_str(&format!("**Generated at:** {}\n", profile.generated_at));
    md.push_str(&format!("**Source file:** {}\n\n---\n\n", profile.source_path));

    for (sheet_name, sheet) in &profile.sheets {
        md.push_str(&format!("## Sheet: `{sheet_name}`\n\n"));
        md.push_str(&format!("- **Row count:** {}\n", sheet.row_count));
        md.push_str(&format!("- **Column count:** {}\n", sheet.column_count));
        if !sheet.pk_candidates.is_empty() {
            md.push_str(&format!(
                "- **Primary key candidates:** {}\n",
                sheet.pk_candidates.join(", ")
            ));
        }
        md.push_str("\n### Columns\n\n");
        md.push_str("| Column Name | Type | Null Rate | Distinct | Cardinality Rate | Min Date | Max Date |\n");
        md.push_str("|-------------|------|-----------|----------|------------------|----------|----------|\n");
        for (col_name, col) in &sheet.columns {
            md.push_str(&format!(
                "| `{}` | {} | {:.2}% | {} | {:.2}% | {} | {} |\n",
                col_name,
                col.inferred_type,
                col.null_rate * 100.0,
                col.distinct_approx,
                col.cardinality_rate * 100.0,
                col.min_date.as_deref().unwrap_or(""),
                col.max_date.as_deref().unwrap_or(""),
            ));
        }
        md.push_str("\n---\n\n");
    }

    md
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_type_integer() {
        let values = vec![Data::Int(1), Data::Int(2), Data::Float(3.0)];
        let refs: Vec<&Data> = values.iter().collect();
        assert_eq!(infer_type(&refs), "integer");
    }

    #[test]
    fn test_infer_type_float() {
        let values = vec![Data::Float(1.5), Data::Float(2.25), Data::Float(3.75)];
        let refs: Vec<&Data> = values.iter().collect();
        assert_eq!(infer_type(&refs), "float");
    }

    #[test]
    fn test_infer_type_string_on_mixed() {
        let values = vec![
            Data::String("a".into()),
            Data::String("b".into()),
            Data::Int(1),
        ];
        let refs: Vec<&Data> = values.iter().collect();
        assert_eq!(infer_type(&refs), "string");
    }

    #[test]
    fn test_profile_columns_null_rate_and_cardinality() {
        let headers = vec!["Order_Id".to_string(), "Order_FinishedAt".to_string()];
        let samples = vec![
            vec![Data::String("OF1".into()), Data::Empty],
            vec![Data::String("OF2".into()), Data::Empty],
            vec![Data::String("OF3".into()), Data::String("".into())],
            vec![Data::String("OF4".into()), Data::Empty],
        ];
        let columns = profile_columns(&headers, &samples);

        let id = &columns["Order_Id"];
        assert_eq!(id.null_count, 0);
        assert_eq!(id.distinct_approx, 4);
        assert_eq!(id.cardinality_rate, 1.0);

        let finished = &columns["Order_FinishedAt"];
        assert_eq!(finished.null_count, 4);
        assert_eq!(finished.null_rate, 1.0);
    }

    #[test]
    fn test_pk_candidate_rule() {
        // null-rate < 1% and distinct-rate > 95% qualifies
        let headers = vec!["Worker_Id".to_string(), "Worker_Active".to_string()];
        let samples: Vec<Vec<Data>> = (0..200)
            .map(|i| vec![Data::Int(i), Data::Int(i % 2)])
            .collect();
        let columns = profile_columns(&headers, &samples);
        assert!(columns["Worker_Id"].cardinality_rate > 0.95);
        assert!(columns["Worker_Active"].cardinality_rate < 0.95);
    }

    #[test]
    fn test_top_values_for_low_cardinality() {
        let headers = vec!["Severity".to_string()];
        let samples: Vec<Vec<Data>> = (0..100)
            .map(|i| vec![Data::Int(if i < 60 { 1 } else if i < 90 { 2 } else { 3 })])
            .collect();
        let columns = profile_columns(&headers, &samples);
        let top = &columns["Severity"].top_values;
        assert_eq!(top[0].value, "1");
        assert_eq!(top[0].count, 60);
        assert_eq!(top[1].value, "2");
    }

    #[test]
    fn test_evaluate_relationship_match_rate_and_orphans() {
        let rel = RelationshipSpec {
            name: "Order_Id -> PhaseEvent_OrderId",
            from_sheet: "Orders",
            from_col: "Order_Id",
            to_sheet: "OrderPhases",
            to_col: "PhaseEvent_OrderId",
            critical: false,
        };
        let mut value_sets: HashMap<(String, String), HashSet<String>> = HashMap::new();
        value_sets.insert(
            ("Orders".into(), "Order_Id".into()),
            ["OF1", "OF2", "OF3"].iter().map(|s| s.to_string()).collect(),
        );
        value_sets.insert(
            ("OrderPhases".into(), "PhaseEvent_OrderId".into()),
            ["OF1", "OF2", "OF9", "OF10"].iter().map(|s| s.to_string()).collect(),
        );

        let result = evaluate_relationship(&rel, &value_sets);
        assert_eq!(result.match_rate, Some(0.5));
        assert_eq!(result.orphan_count, 2);
        assert_eq!(result.orphans, vec!["OF10".to_string(), "OF9".to_string()]);
    }

    #[test]
    fn test_evaluate_relationship_missing_column() {
        let rel = RELATIONSHIPS[0];
        let result = evaluate_relationship(&rel, &HashMap::new());
        assert!(result.match_rate.is_none());
        assert!(result.error.is_some());
    }

    #[test]
    fn test_data_dictionary_renders_sheet_sections() {
        let mut sheets = BTreeMap::new();
        sheets.insert(
            "Orders".to_string(),
            SheetProfile {
                sheet_name: "Orders".to_string(),
                headers: vec!["Order_Id".to_string()],
                row_count: 3,
                column_count: 1,
                columns: BTreeMap::new(),
                pk_candidates: vec!["Order_Id".to_string()],
            },
        );
        let profile = ProfileReport {
            generated_at: Utc::now(),
            source_path: "data/raw/source.xlsx".to_string(),
            source_sha256: "abc".to_string(),
            sheets,
        };
        let md = render_data_dictionary(&profile);
        assert!(md.contains("## Sheet: `Orders`"));
        assert!(md.contains("Primary key candidates:** Order_Id"));
    }
}
