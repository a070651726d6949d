//! The declared ingestion map: every sheet of the source workbook, its
//! staging table, its core table, the preferred conflict key, the
//! staging-to-core column mapping, and the expected row count used by the
//! count contract. Column names are matched case-sensitively against the
//! workbook header row.
//!
//! Sheets are listed in merge dependency order: catalogs before orders,
//! orders before phase-events, phase-events before their edges.

/// One sheet of the source workbook and its ingestion mapping.
#[derive(Debug, Clone, Copy)]
pub struct SheetSpec {
    /// Sheet name in the workbook
    pub sheet_name: &'static str,
    /// Expected header row, original column order
    pub headers: &'static [&'static str],
    /// Schema-qualified staging table
    pub staging_table: &'static str,
    /// Staging column list, aligned with `headers` (COPY column list)
    pub staging_columns: &'static [&'static str],
    /// Core table name (resolved against public/core at merge time)
    pub core_table: &'static str,
    /// Preferred ON CONFLICT column set on the core table
    pub conflict_key: &'static [&'static str],
    /// Staging column -> core column mapping
    pub mapping: &'static [(&'static str, &'static str)],
    /// Declared row count of the sheet, for the count contract
    pub expected_rows: i64,
    /// The errors sheet takes the fingerprint merge path
    pub is_errors: bool,
}

impl SheetSpec {
    /// Reverse lookup: staging column feeding a core column.
    pub fn staging_column_for(&self, core_col: &str) -> Option<&'static str> {
        self.mapping
            .iter()
            .find(|(_, core)| *core == core_col)
            .map(|(stg, _)| *stg)
    }
}

/// All sheets, in merge dependency order.
pub const SHEETS: &[SheetSpec] = &[
    SheetSpec {
        sheet_name: "Phases",
        headers: &[
            "Phase_Id",
            "Phase_Name",
            "Phase_Sequence",
            "Phase_IsProduction",
            "Phase_IsAutomatic",
        ],
        staging_table: "staging.phases_raw",
        staging_columns: &[
            "phase_id",
            "phase_name",
            "phase_sequence",
            "phase_is_production",
            "phase_is_automatic",
        ],
        core_table: "phases",
        conflict_key: &["phase_id"],
        mapping: &[
            ("phase_id", "phase_id"),
            ("phase_name", "name"),
            ("phase_sequence", "sequence"),
            ("phase_is_production", "is_production"),
            ("phase_is_automatic", "is_automatic"),
        ],
        expected_rows: 71,
        is_errors: false,
    },
    SheetSpec {
        sheet_name: "Products",
        headers: &[
            "Product_Id",
            "Product_Name",
            "Product_WeightDemold",
            "Product_WeightFinish",
            "Product_QtyGelDeck",
            "Product_QtyGelHull",
        ],
        staging_table: "staging.products_raw",
        staging_columns: &[
            "product_id",
            "product_name",
            "product_weight_demold",
            "product_weight_finish",
            "product_qty_gel_deck",
            "product_qty_gel_hull",
        ],
        core_table: "products",
        conflict_key: &["product_id"],
        mapping: &[
            ("product_id", "product_id"),
            ("product_name", "name"),
            ("product_weight_demold", "weight_demold"),
            ("product_weight_finish", "weight_finish"),
            ("product_qty_gel_deck", "qty_gel_deck"),
            ("product_qty_gel_hull", "qty_gel_hull"),
        ],
        expected_rows: 894,
        is_errors: false,
    },
    SheetSpec {
        sheet_name: "Workers",
        headers: &["Worker_Id", "Worker_Name", "Worker_Active"],
        staging_table: "staging.workers_raw",
        staging_columns: &["worker_id", "worker_name", "worker_active"],
        core_table: "workers",
        conflict_key: &["worker_id"],
        mapping: &[
            ("worker_id", "worker_id"),
            ("worker_name", "name"),
            ("worker_active", "active"),
        ],
        expected_rows: 902,
        is_errors: false,
    },
    SheetSpec {
        sheet_name: "WorkerPhaseSkills",
        headers: &["Worker_Id", "Phase_Id", "WorkerPhase_SinceDate"],
        staging_table: "staging.worker_phase_skills_raw",
        staging_columns: &["worker_id", "phase_id", "since_date"],
        core_table: "worker_phase_skills",
        conflict_key: &["worker_id", "phase_id"],
        mapping: &[
            ("worker_id", "worker_id"),
            ("phase_id", "phase_id"),
            ("since_date", "since_date"),
        ],
        expected_rows: 902,
        is_errors: false,
    },
    SheetSpec {
        sheet_name: "ProductPhaseStandards",
        headers: &[
            "Product_Id",
            "Phase_Id",
            "Standard_Sequence",
            "Standard_Coefficient",
            "Standard_CoefficientX",
        ],
        staging_table: "staging.product_phase_standards_raw",
        staging_columns: &["product_id", "phase_id", "sequence", "coefficient", "coefficient_x"],
        core_table: "product_phase_standards",
        conflict_key: &["product_id", "phase_id", "sequence"],
        mapping: &[
            ("product_id", "product_id"),
            ("phase_id", "phase_id"),
            ("sequence", "sequence"),
            ("coefficient", "coefficient"),
            ("coefficient_x", "coefficient_x"),
        ],
        expected_rows: 15347,
        is_errors: false,
    },
    SheetSpec {
        sheet_name: "Orders",
        headers: &[
            "Order_Id",
            "Order_CreatedAt",
            "Order_FinishedAt",
            "Order_ProductId",
            "Order_PhaseId",
            "Order_TransportAt",
        ],
        staging_table: "staging.orders_raw",
        staging_columns: &[
            "order_id",
            "created_at",
            "finished_at",
            "product_id",
            "phase_id",
            "transport_at",
        ],
        core_table: "orders",
        conflict_key: &["order_id"],
        mapping: &[
            ("order_id", "order_id"),
            ("created_at", "created_at"),
            ("finished_at", "finished_at"),
            ("product_id", "product_id"),
            ("phase_id", "phase_id"),
            ("transport_at", "transport_at"),
        ],
        expected_rows: 27380,
        is_errors: false,
    },
    SheetSpec {
        sheet_name: "OrderPhases",
        headers: &[
            "PhaseEvent_Id",
            "PhaseEvent_OrderId",
            "PhaseEvent_StartedAt",
            "PhaseEvent_FinishedAt",
            "PhaseEvent_PlannedDate",
            "PhaseEvent_Coefficient",
            "PhaseEvent_CoefficientX",
            "PhaseEvent_PhaseId",
            "PhaseEvent_Shift",
            "PhaseEvent_Returned",
            "PhaseEvent_Mass",
            "PhaseEvent_Sequence",
        ],
        staging_table: "staging.order_phases_raw",
        staging_columns: &[
            "phase_event_id",
            "order_id",
            "started_at",
            "finished_at",
            "planned_date",
            "coefficient",
            "coefficient_x",
            "phase_id",
            "shift",
            "returned",
            "mass",
            "sequence",
        ],
        core_table: "order_phases",
        conflict_key: &["phase_event_id", "finished_at"],
        mapping: &[
            ("phase_event_id", "phase_event_id"),
            ("order_id", "order_id"),
            ("started_at", "started_at"),
            ("finished_at", "finished_at"),
            ("planned_date", "planned_date"),
            ("coefficient", "coefficient"),
            ("coefficient_x", "coefficient_x"),
            ("phase_id", "phase_id"),
            ("shift", "shift"),
            ("returned", "returned"),
            ("mass", "mass"),
            ("sequence", "sequence"),
        ],
        expected_rows: 519_079,
        is_errors: false,
    },
    SheetSpec {
        sheet_name: "PhaseWorkers",
        headers: &["PhaseWorker_PhaseEventId", "PhaseWorker_WorkerId", "PhaseWorker_IsChief"],
        staging_table: "staging.phase_workers_raw",
        staging_columns: &["phase_event_id", "worker_id", "is_chief"],
        core_table: "phase_workers",
        conflict_key: &["phase_event_id", "worker_id"],
        mapping: &[
            ("phase_event_id", "phase_event_id"),
            ("worker_id", "worker_id"),
            ("is_chief", "is_chief"),
        ],
        expected_rows: 423_769,
        is_errors: false,
    },
    SheetSpec {
        sheet_name: "OrderErrors",
        headers: &[
            "Error_Description",
            "Error_OrderId",
            "Error_EvalPhaseId",
            "Error_Severity",
            "Error_EvalPhaseEventId",
            "Error_BlamedPhaseEventId",
        ],
        staging_table: "staging.errors_raw",
        staging_columns: &[
            "description",
            "order_id",
            "eval_phase_id",
            "severity",
            "eval_phase_event_id",
            "blamed_phase_event_id",
        ],
        core_table: "errors",
        conflict_key: &["fingerprint", "order_id"],
        mapping: &[
            ("description", "description"),
            ("order_id", "order_id"),
            ("eval_phase_id", "eval_phase_id"),
            ("severity", "severity"),
            ("eval_phase_event_id", "eval_phase_event_id"),
            ("blamed_phase_event_id", "blamed_phase_event_id"),
        ],
        expected_rows: 89_836,
        is_errors: true,
    },
];

/// Find a sheet spec by workbook sheet name.
pub fn sheet_by_name(name: &str) -> Option<&'static SheetSpec> {
    SHEETS.iter().find(|s| s.sheet_name == name)
}

/// A declared foreign-key-like relationship between two sheets, checked by
/// the inspector. `critical` relationships drive the feature gates.
#[derive(Debug, Clone, Copy)]
pub struct RelationshipSpec {
    pub name: &'static str,
    pub from_sheet: &'static str,
    pub from_col: &'static str,
    pub to_sheet: &'static str,
    pub to_col: &'static str,
    pub critical: bool,
}

/// All declared relationships. Match rate is the fraction of distinct
/// referencing values (`to`) found among the referenced values (`from`).
pub const RELATIONSHIPS: &[RelationshipSpec] = &[
    RelationshipSpec {
        name: "Order_Id -> PhaseEvent_OrderId",
        from_sheet: "Orders",
        from_col: "Order_Id",
        to_sheet: "OrderPhases",
        to_col: "PhaseEvent_OrderId",
        critical: false,
    },
    RelationshipSpec {
        name: "Phase_Id -> PhaseEvent_PhaseId",
        from_sheet: "Phases",
        from_col: "Phase_Id",
        to_sheet: "OrderPhases",
        to_col: "PhaseEvent_PhaseId",
        critical: false,
    },
    RelationshipSpec {
        name: "Product_Id -> Order_ProductId",
        from_sheet: "Products",
        from_col: "Product_Id",
        to_sheet: "Orders",
        to_col: "Order_ProductId",
        critical: true,
    },
    RelationshipSpec {
        name: "Product_Id -> Standard_ProductId",
        from_sheet: "Products",
        from_col: "Product_Id",
        to_sheet: "ProductPhaseStandards",
        to_col: "Product_Id",
        critical: false,
    },
    RelationshipSpec {
        name: "Phase_Id -> Standard_PhaseId",
        from_sheet: "Phases",
        from_col: "Phase_Id",
        to_sheet: "ProductPhaseStandards",
        to_col: "Phase_Id",
        critical: false,
    },
    RelationshipSpec {
        name: "Worker_Id -> WorkerPhase_WorkerId",
        from_sheet: "Workers",
        from_col: "Worker_Id",
        to_sheet: "WorkerPhaseSkills",
        to_col: "Worker_Id",
        critical: false,
    },
    RelationshipSpec {
        name: "Worker_Id -> PhaseWorker_WorkerId",
        from_sheet: "Workers",
        from_col: "Worker_Id",
        to_sheet: "PhaseWorkers",
        to_col: "PhaseWorker_WorkerId",
        critical: false,
    },
    RelationshipSpec {
        name: "PhaseWorker_PhaseEventId -> PhaseEvent_Id",
        from_sheet: "OrderPhases",
        from_col: "PhaseEvent_Id",
        to_sheet: "PhaseWorkers",
        to_col: "PhaseWorker_PhaseEventId",
        critical: true,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nine_sheets_in_dependency_order() {
        assert_eq!(SHEETS.len(), 9);
        let names: Vec<_> = SHEETS.iter().map(|s| s.sheet_name).collect();
        // catalogs first, facts after their parents
        let orders = names.iter().position(|n| *n == "Orders").unwrap();
        let phases = names.iter().position(|n| *n == "OrderPhases").unwrap();
        let workers_edge = names.iter().position(|n| *n == "PhaseWorkers").unwrap();
        let errors = names.iter().position(|n| *n == "OrderErrors").unwrap();
        assert!(orders < phases && phases < workers_edge && workers_edge < errors);
    }

    #[test]
    fn test_headers_align_with_staging_columns() {
        for sheet in SHEETS {
            assert_eq!(
                sheet.headers.len(),
                sheet.staging_columns.len(),
                "sheet {} header/staging mismatch",
                sheet.sheet_name
            );
        }
    }

    #[test]
    fn test_mapping_covers_conflict_key() {
        // errors is special: its fingerprint key column is synthesized
        for sheet in SHEETS.iter().filter(|s| !s.is_errors) {
            for key_col in sheet.conflict_key {
                assert!(
                    sheet.staging_column_for(key_col).is_some(),
                    "sheet {} conflict column {} has no staging source",
                    sheet.sheet_name,
                    key_col
                );
            }
        }
    }

    #[test]
    fn test_expected_totals() {
        let total: i64 = SHEETS.iter().map(|s| s.expected_rows).sum();
        // ~1.1M rows across the nine sheets
        assert!(total > 1_000_000 && total < 1_200_000);
    }

    #[test]
    fn test_two_critical_relationships() {
        assert_eq!(RELATIONSHIPS.iter().filter(|r| r.critical).count(), 2);
    }

    #[test]
    fn test_relationship_sheets_exist() {
        for rel in RELATIONSHIPS {
            assert!(sheet_by_name(rel.from_sheet).is_some(), "{}", rel.name);
            assert!(sheet_by_name(rel.to_sheet).is_some(), "{}", rel.name);
        }
    }
}
