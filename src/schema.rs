//! Raw input tables and their schema checks.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use thiserror::Error;

pub const PATIENT_ID_COLUMN: &str = "anonymous_pat_id";

pub const PATIENT_TABLE: &str = "patient_table";
pub const CRISIS_TABLE: &str = "crisis_table";
pub const CRISIS_SEVERITY_TABLE: &str = "crisis_severity";
pub const CONTACTS_TABLE: &str = "contacts_table";
pub const CONTACT_EVENT_CODE_TABLE: &str = "contact_eventformat_code";
pub const SERVICE_CODE_TABLE: &str = "service_code";
pub const RISK_TABLE: &str = "risk_screening_table";
pub const WELLBEING_TABLE: &str = "wellbeing_screening_table";
pub const DIAGNOSIS_TABLE: &str = "diagnosis_table";
pub const DIAGNOSIS_BROAD_CODES_TABLE: &str = "diagnosis_broad_codes";
pub const DIAGNOSIS_GRANULAR_CODES_TABLE: &str = "diagnosis_granular_codes";
pub const MHA_TABLE: &str = "mha_table";
pub const HOSPITALIZATION_TABLE: &str = "hospitalization_table";
pub const BED_DAY_ACTIVITY_CODE_TABLE: &str = "bed_day_activity_category_code";
pub const REFERRAL_TABLE: &str = "referral_table";
pub const REFERRAL_DISCHARGE_CODE_TABLE: &str = "discharge_code";
pub const REFERRAL_SOURCE_CODE_TABLE: &str = "source_code";
pub const CRISIS_PLAN_TABLE: &str = "crisis_plan_table";

/// Every table the loader knows how to read.
pub const TABLE_NAMES: [&str; 18] = [
    PATIENT_TABLE,
    CRISIS_TABLE,
    CRISIS_SEVERITY_TABLE,
    CONTACTS_TABLE,
    CONTACT_EVENT_CODE_TABLE,
    SERVICE_CODE_TABLE,
    RISK_TABLE,
    WELLBEING_TABLE,
    DIAGNOSIS_TABLE,
    DIAGNOSIS_BROAD_CODES_TABLE,
    DIAGNOSIS_GRANULAR_CODES_TABLE,
    MHA_TABLE,
    HOSPITALIZATION_TABLE,
    BED_DAY_ACTIVITY_CODE_TABLE,
    REFERRAL_TABLE,
    REFERRAL_DISCHARGE_CODE_TABLE,
    REFERRAL_SOURCE_CODE_TABLE,
    CRISIS_PLAN_TABLE,
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("{table} table not passed to {consumer}")]
    MissingTable { table: String, consumer: String },
    #[error("{table} table passed to {consumer} missing the {column} column")]
    MissingColumn {
        table: String,
        column: String,
        consumer: String,
    },
    #[error("output of {consumer} missing the {column} column")]
    MissingOutputColumn { column: String, consumer: String },
    #[error("{table} row {row} has {found} cells, expected {expected}")]
    RaggedRow {
        table: String,
        row: usize,
        found: usize,
        expected: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRequirement {
    pub table: &'static str,
    pub columns: Vec<&'static str>,
}

impl TableRequirement {
    pub fn new(table: &'static str, columns: &[&'static str]) -> Self {
        Self {
            table,
            columns: columns.to_vec(),
        }
    }
}

/// String-celled table as delivered by the loading layer; an empty cell is
/// a missing value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTable {
    pub name: String,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new(name: impl Into<String>, headers: Vec<String>) -> Self {
        Self {
            name: name.into(),
            headers,
            rows: Vec::new(),
        }
    }

    pub fn from_rows(
        name: impl Into<String>,
        headers: &[&str],
        rows: &[&[&str]],
    ) -> Result<Self, SchemaError> {
        let mut table = Self::new(name, headers.iter().map(|h| h.to_string()).collect());
        for row in rows {
            table.push_row(row.iter().map(|cell| cell.to_string()).collect())?;
        }
        Ok(table)
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push_row(&mut self, row: Vec<String>) -> Result<(), SchemaError> {
        if row.len() != self.headers.len() {
            return Err(SchemaError::RaggedRow {
                table: self.name.clone(),
                row: self.rows.len(),
                found: row.len(),
                expected: self.headers.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == column)
    }

    pub fn cell<'a>(&'a self, row: &'a [String], column: &str) -> Option<&'a str> {
        let idx = self.column_index(column)?;
        let value = row.get(idx)?.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("nan") {
            None
        } else {
            Some(value)
        }
    }

    pub fn first_missing_column(&self, columns: &[&str]) -> Option<String> {
        columns
            .iter()
            .find(|c| self.column_index(c).is_none())
            .map(|c| c.to_string())
    }

    /// Appends a derived column computed from each row.
    pub fn add_column(&mut self, column: impl Into<String>, f: impl Fn(&RawTable, &[String]) -> String) {
        let column = column.into();
        let values: Vec<String> = self.rows.iter().map(|row| f(self, row.as_slice())).collect();
        match self.column_index(&column) {
            Some(idx) => {
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row[idx] = value;
                }
            }
            None => {
                self.headers.push(column);
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row.push(value);
                }
            }
        }
    }

    pub fn retain_rows(&mut self, f: impl Fn(&RawTable, &[String]) -> bool) {
        let keep: Vec<bool> = self.rows.iter().map(|row| f(self, row.as_slice())).collect();
        let mut flags = keep.into_iter();
        self.rows.retain(|_| flags.next().unwrap_or(false));
    }

    pub fn sort_rows_by_key<K: Ord>(&mut self, f: impl Fn(&RawTable, &[String]) -> K) {
        let mut keyed: Vec<(K, Vec<String>)> = std::mem::take(&mut self.rows)
            .into_iter()
            .map(|row| (f(self, row.as_slice()), row))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        self.rows = keyed.into_iter().map(|(_, row)| row).collect();
    }

    pub fn rename_headers(&mut self, f: impl Fn(&str) -> String) {
        for header in &mut self.headers {
            *header = f(header);
        }
    }

    pub fn filter_patient(&self, patient_id: i64) -> RawTable {
        let Some(idx) = self.column_index(PATIENT_ID_COLUMN) else {
            return self.clone();
        };
        RawTable {
            name: self.name.clone(),
            headers: self.headers.clone(),
            rows: self
                .rows
                .iter()
                .filter(|row| parse_patient_id(&row[idx]) == Some(patient_id))
                .cloned()
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSet {
    tables: BTreeMap<String, RawTable>,
}

impl TableSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: RawTable) {
        self.tables.insert(table.name.clone(), table);
    }

    pub fn with(mut self, table: RawTable) -> Self {
        self.insert(table);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.tables.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn get(&self, name: &str, consumer: &str) -> Result<&RawTable, SchemaError> {
        self.tables.get(name).ok_or_else(|| SchemaError::MissingTable {
            table: name.to_string(),
            consumer: consumer.to_string(),
        })
    }

    pub fn get_mut(&mut self, name: &str, consumer: &str) -> Result<&mut RawTable, SchemaError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| SchemaError::MissingTable {
                table: name.to_string(),
                consumer: consumer.to_string(),
            })
    }

    /// Every required table must be present and carry every required
    /// column. Tables without rows pass: they select the all-default path.
    pub fn require(&self, requirements: &[TableRequirement], consumer: &str) -> Result<(), SchemaError> {
        for requirement in requirements {
            let table = self.get(requirement.table, consumer)?;
            if table.is_empty() {
                continue;
            }
            if let Some(column) = table.first_missing_column(&requirement.columns) {
                return Err(SchemaError::MissingColumn {
                    table: requirement.table.to_string(),
                    column,
                    consumer: consumer.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn patient_ids(&self, table: &str) -> Result<Vec<i64>, SchemaError> {
        let patients = self.get(table, "TableSet::patient_ids")?;
        let idx = patients
            .column_index(PATIENT_ID_COLUMN)
            .ok_or_else(|| SchemaError::MissingColumn {
                table: table.to_string(),
                column: PATIENT_ID_COLUMN.to_string(),
                consumer: "TableSet::patient_ids".to_string(),
            })?;
        let mut ids: Vec<i64> = patients
            .rows
            .iter()
            .filter_map(|row| parse_patient_id(&row[idx]))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Splits patient-keyed tables into one set per patient in a single
    /// pass. Tables without a patient id column are shared unchanged, and
    /// rows of patients outside `patient_ids` are dropped.
    pub fn partition_by_patient(&self, patient_ids: &[i64]) -> BTreeMap<i64, TableSet> {
        let mut sets: BTreeMap<i64, TableSet> = patient_ids.iter().map(|id| (*id, TableSet::new())).collect();
        for (name, table) in &self.tables {
            let Some(idx) = table.column_index(PATIENT_ID_COLUMN) else {
                for set in sets.values_mut() {
                    set.tables.insert(name.clone(), table.clone());
                }
                continue;
            };

            for set in sets.values_mut() {
                set.tables
                    .insert(name.clone(), RawTable::new(table.name.clone(), table.headers.clone()));
            }
            for row in &table.rows {
                let Some(id) = parse_patient_id(&row[idx]) else {
                    continue;
                };
                if let Some(part) = sets.get_mut(&id).and_then(|set| set.tables.get_mut(name)) {
                    part.rows.push(row.clone());
                }
            }
        }
        sets
    }

    pub fn for_patient(&self, patient_id: i64) -> TableSet {
        TableSet {
            tables: self
                .tables
                .iter()
                .map(|(name, table)| (name.clone(), table.filter_patient(patient_id)))
                .collect(),
        }
    }
}

pub fn parse_patient_id(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    trimmed
        .parse::<i64>()
        .ok()
        .or_else(|| trimmed.strip_suffix(".0").and_then(|s| s.parse().ok()))
}

pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(parsed);
        }
    }
    parse_date(trimmed).and_then(|d| d.and_hms_opt(0, 0, 0))
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    let date_part = trimmed.get(..10).unwrap_or(trimmed);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

pub fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

struct SnakeCasePatterns {
    non_letters: Regex,
    camel_boundary: Regex,
    word_gap: Regex,
}

fn snake_case_patterns() -> &'static SnakeCasePatterns {
    static PATTERNS: OnceLock<SnakeCasePatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| SnakeCasePatterns {
        non_letters: Regex::new(r"[^a-zA-Z\s_]").expect("literal pattern compiles"),
        camel_boundary: Regex::new(r"([a-z0-9])([A-Z])").expect("literal pattern compiles"),
        word_gap: Regex::new(r"([a-z])\s([a-z])").expect("literal pattern compiles"),
    })
}

/// `WellBeingSocial / Score` → `well_being_social`, `Not applicable` →
/// `not_applicable`.
pub fn to_snake_case(raw: &str) -> String {
    let patterns = snake_case_patterns();
    let head = raw.split(" /").next().unwrap_or(raw);
    let letters = patterns.non_letters.replace_all(head, "");
    let camel = patterns
        .camel_boundary
        .replace_all(&letters, "${1}_${2}")
        .to_lowercase();
    let spaced = patterns.word_gap.replace_all(&camel, "${1}_${2}");
    spaced.chars().filter(|c| !c.is_whitespace()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contacts() -> RawTable {
        RawTable::from_rows(
            "contacts_table",
            &["anonymous_pat_id", "contacts_datetime", "attendance"],
            &[
                &["1", "2021-01-05 10:00:00", "Attended"],
                &["2", "2021-01-06 10:00:00", "Attended"],
                &["1", "2021-01-07", ""],
            ],
        )
        .expect("table")
    }

    #[test]
    fn require_reports_missing_table_then_first_missing_column() {
        let set = TableSet::new().with(contacts());
        let err = set
            .require(&[TableRequirement::new("crisis_table", &["anonymous_pat_id"])], "Crisis")
            .expect_err("missing table");
        assert_eq!(
            err,
            SchemaError::MissingTable {
                table: "crisis_table".to_string(),
                consumer: "Crisis".to_string()
            }
        );

        let err = set
            .require(
                &[TableRequirement::new(
                    "contacts_table",
                    &["anonymous_pat_id", "service", "event_code"],
                )],
                "Contacts",
            )
            .expect_err("missing column");
        assert!(matches!(err, SchemaError::MissingColumn { ref column, .. } if column == "service"));
    }

    #[test]
    fn empty_tables_without_headers_pass_requirements() {
        let set = TableSet::new().with(RawTable::new("mha_table", Vec::new()));
        set.require(&[TableRequirement::new("mha_table", &["start_date_time"])], "Mha")
            .expect("empty table is not an error");
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let err = RawTable::from_rows("t", &["a", "b"], &[&["1"]]).expect_err("ragged");
        assert!(matches!(err, SchemaError::RaggedRow { found: 1, expected: 2, .. }));
    }

    #[test]
    fn patient_split_and_cells() {
        let set = TableSet::new().with(contacts());
        assert_eq!(set.patient_ids("contacts_table").expect("ids"), vec![1, 2]);

        let one = set.for_patient(1);
        let table = one.get("contacts_table", "test").expect("table");
        assert_eq!(table.len(), 2);
        assert_eq!(table.cell(&table.rows()[1], "attendance"), None);
        assert_eq!(table.cell(&table.rows()[0], "attendance"), Some("Attended"));
    }

    #[test]
    fn partition_matches_per_patient_filtering() {
        let lookup = RawTable::from_rows("service_code", &["service", "Category"], &[&["A1", "Crisis"]])
            .expect("lookup");
        let set = TableSet::new().with(contacts()).with(lookup);
        let parts = set.partition_by_patient(&[1, 2, 3]);

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[&1], set.for_patient(1));
        assert_eq!(parts[&2].get("contacts_table", "test").expect("table").len(), 1);
        assert!(parts[&3].get("contacts_table", "test").expect("table").is_empty());
        assert_eq!(parts[&3].get("service_code", "test").expect("lookup").len(), 1);
    }

    #[test]
    fn parses_supported_date_formats() {
        assert!(parse_datetime("2021-01-05 10:00:00").is_some());
        assert!(parse_datetime("2021-01-05T10:00:00").is_some());
        assert!(parse_datetime("2021-01-05").is_some());
        assert_eq!(parse_date("2021-01-05 10:00:00"), NaiveDate::from_ymd_opt(2021, 1, 5));
        assert_eq!(parse_datetime("05/01/2021"), None);
    }

    #[test]
    fn snake_case_matches_column_conventions() {
        assert_eq!(to_snake_case("Suicide"), "suicide");
        assert_eq!(to_snake_case("SelfHarm"), "self_harm");
        assert_eq!(to_snake_case("FourFactorTotal / Score"), "four_factor_total");
        assert_eq!(to_snake_case("cto_status_Not applicable"), "cto_status_not_applicable");
        assert_eq!(
            to_snake_case("crisis_contact_allocation_BM_BedMngmnt_Day_max"),
            "crisis_contact_allocation_bm_bed_mngmnt_day_max"
        );
    }

    #[test]
    fn snake_case_is_stable_across_repeated_calls() {
        for _ in 0..3 {
            assert_eq!(to_snake_case("referral_category_NoMH"), "referral_category_no_mh");
            assert_eq!(to_snake_case("source_Local Authority"), "source_local_authority");
            assert_eq!(to_snake_case("source_GP"), "source_gp");
        }
    }
}
