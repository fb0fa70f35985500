//! Table preprocessing steps run once over the whole cohort before any
//! feature family sees the data.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::schema::{
    parse_datetime, parse_patient_id, to_snake_case, RawTable, SchemaError, TableRequirement, TableSet,
    CONTACTS_TABLE, DIAGNOSIS_BROAD_CODES_TABLE, DIAGNOSIS_GRANULAR_CODES_TABLE, DIAGNOSIS_TABLE,
    PATIENT_ID_COLUMN,
};

pub const DIAGNOSIS_CODE_COLUMNS: [&str; 14] = [
    "Diagnosis01Code",
    "Diagnosis02Code",
    "Diagnosis03Code",
    "Diagnosis04Code",
    "Diagnosis05Code",
    "Diagnosis06Code",
    "Diagnosis07Code",
    "Diagnosis08Code",
    "Diagnosis09Code",
    "Diagnosis10Code",
    "Diagnosis11Code",
    "Diagnosis12Code",
    "Diagnosis13Code",
    "Diagnosis14Code",
];

pub trait Preprocessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn requirements(&self) -> Vec<TableRequirement>;

    fn apply(&self, tables: &mut TableSet) -> Result<(), SchemaError>;
}

/// Removes contacts cancelled by either side before they count as contacts.
#[derive(Debug, Clone, Default)]
pub struct DropCancelledContacts;

impl DropCancelledContacts {
    const CANCELLED: [&'static str; 2] = ["Trust cancelled", "Patient cancelled"];
}

impl Preprocessor for DropCancelledContacts {
    fn name(&self) -> &'static str {
        "DropCancelledContacts"
    }

    fn requirements(&self) -> Vec<TableRequirement> {
        vec![TableRequirement::new(CONTACTS_TABLE, &["attendance"])]
    }

    fn apply(&self, tables: &mut TableSet) -> Result<(), SchemaError> {
        let contacts = tables.get_mut(CONTACTS_TABLE, self.name())?;
        let before = contacts.len();
        contacts.retain_rows(|table, row| {
            !matches!(table.cell(row, "attendance"), Some(value) if Self::CANCELLED.contains(&value))
        });
        debug!(
            component = "preprocess",
            event = "preprocess.contacts.cancelled_dropped",
            dropped = before - contacts.len(),
            remaining = contacts.len()
        );
        Ok(())
    }
}

/// Maps `source_column` through a key/value lookup table into
/// `target_column`. Unmapped keys leave the target empty.
#[derive(Debug, Clone)]
pub struct LookupMapping {
    pub table: &'static str,
    pub source_column: &'static str,
    pub target_column: &'static str,
    pub lookup_table: &'static str,
    pub lookup_key: &'static str,
    pub lookup_value: &'static str,
}

impl LookupMapping {
    fn lookup(&self, tables: &TableSet) -> Result<BTreeMap<String, String>, SchemaError> {
        let lookup = tables.get(self.lookup_table, self.name())?;
        let mut mapping = BTreeMap::new();
        for row in lookup.rows() {
            if let (Some(key), Some(value)) = (
                lookup.cell(row, self.lookup_key),
                lookup.cell(row, self.lookup_value),
            ) {
                mapping.insert(key.to_string(), value.to_string());
            }
        }
        Ok(mapping)
    }
}

impl Preprocessor for LookupMapping {
    fn name(&self) -> &'static str {
        "LookupMapping"
    }

    fn requirements(&self) -> Vec<TableRequirement> {
        vec![
            TableRequirement::new(self.table, &[self.source_column]),
            TableRequirement::new(self.lookup_table, &[self.lookup_key, self.lookup_value]),
        ]
    }

    fn apply(&self, tables: &mut TableSet) -> Result<(), SchemaError> {
        let mapping = self.lookup(tables)?;
        let target = tables.get_mut(self.table, self.name())?;
        let source = self.source_column;
        target.add_column(self.target_column, |table, row| {
            table
                .cell(row, source)
                .and_then(|key| mapping.get(key))
                .cloned()
                .unwrap_or_default()
        });
        debug!(
            component = "preprocess",
            event = "preprocess.lookup.mapped",
            table = self.table,
            source = self.source_column,
            target = self.target_column,
            lookup_entries = mapping.len()
        );
        Ok(())
    }
}

/// Derives one 0/1 column per diagnosis category by substring matching the
/// diagnosis code columns against each category's code roots.
#[derive(Debug, Clone)]
pub struct DiagnosisCodeCategories {
    pub prefix: &'static str,
    pub codes_table: &'static str,
    /// Categories always materialised, even when absent from the lookup.
    pub known_categories: Vec<String>,
}

impl DiagnosisCodeCategories {
    pub fn broad(known_categories: Vec<String>) -> Self {
        Self {
            prefix: "diagnosis_broad",
            codes_table: DIAGNOSIS_BROAD_CODES_TABLE,
            known_categories,
        }
    }

    pub fn granular(known_categories: Vec<String>) -> Self {
        Self {
            prefix: "diagnosis_granular",
            codes_table: DIAGNOSIS_GRANULAR_CODES_TABLE,
            known_categories,
        }
    }

    fn code_roots(&self, tables: &TableSet) -> Result<BTreeMap<String, BTreeSet<String>>, SchemaError> {
        let codes = tables.get(self.codes_table, self.name())?;
        let mut roots: BTreeMap<String, BTreeSet<String>> = self
            .known_categories
            .iter()
            .map(|category| (category.clone(), BTreeSet::new()))
            .collect();
        for row in codes.rows() {
            if let (Some(category), Some(root)) =
                (codes.cell(row, "Category"), codes.cell(row, "DiagnosisCodeRoot"))
            {
                roots
                    .entry(category.to_lowercase())
                    .or_default()
                    .insert(root.to_string());
            }
        }
        Ok(roots)
    }
}

impl Preprocessor for DiagnosisCodeCategories {
    fn name(&self) -> &'static str {
        "DiagnosisCodeCategories"
    }

    fn requirements(&self) -> Vec<TableRequirement> {
        vec![
            TableRequirement::new(DIAGNOSIS_TABLE, &[PATIENT_ID_COLUMN]),
            TableRequirement::new(self.codes_table, &["Category", "DiagnosisCodeRoot"]),
        ]
    }

    fn apply(&self, tables: &mut TableSet) -> Result<(), SchemaError> {
        let roots = self.code_roots(tables)?;
        let diagnosis = tables.get_mut(DIAGNOSIS_TABLE, self.name())?;
        for (category, codes) in &roots {
            diagnosis.add_column(format!("{}_{}", self.prefix, category), |table, row| {
                let matched = DIAGNOSIS_CODE_COLUMNS.iter().any(|column| {
                    table
                        .cell(row, column)
                        .is_some_and(|value| codes.iter().any(|code| value.contains(code.as_str())))
                });
                let flag = if matched { "1" } else { "0" };
                flag.to_string()
            });
        }
        debug!(
            component = "preprocess",
            event = "preprocess.diagnosis.categorised",
            prefix = self.prefix,
            categories = roots.len(),
            rows = diagnosis.len()
        );
        Ok(())
    }
}

/// Stable sort by patient id, then by a date column. Unparsable dates sort
/// first.
#[derive(Debug, Clone)]
pub struct SortByColumn {
    pub table: &'static str,
    pub date_column: &'static str,
}

impl Preprocessor for SortByColumn {
    fn name(&self) -> &'static str {
        "SortByColumn"
    }

    fn requirements(&self) -> Vec<TableRequirement> {
        vec![TableRequirement::new(self.table, &[PATIENT_ID_COLUMN, self.date_column])]
    }

    fn apply(&self, tables: &mut TableSet) -> Result<(), SchemaError> {
        let date_column = self.date_column;
        let table = tables.get_mut(self.table, self.name())?;
        table.sort_rows_by_key(|table, row| {
            (
                table.cell(row, PATIENT_ID_COLUMN).and_then(parse_patient_id),
                table.cell(row, date_column).and_then(parse_datetime),
            )
        });
        Ok(())
    }
}

/// Snake-cases every header outside `keep`, after removing `strip` and
/// before adding `prefix` (`RiskSelfHarm` → `risk_self_harm`).
#[derive(Debug, Clone)]
pub struct NormalizeHeaders {
    pub table: &'static str,
    pub prefix: &'static str,
    pub strip: &'static str,
    pub keep: Vec<&'static str>,
}

impl NormalizeHeaders {
    pub fn normalize(&self, header: &str) -> String {
        if self.keep.contains(&header) {
            return header.to_string();
        }
        let stripped = if self.strip.is_empty() {
            header.to_string()
        } else {
            header.replace(self.strip, "")
        };
        format!("{}{}", self.prefix, to_snake_case(&stripped))
    }
}

impl Preprocessor for NormalizeHeaders {
    fn name(&self) -> &'static str {
        "NormalizeHeaders"
    }

    fn requirements(&self) -> Vec<TableRequirement> {
        vec![TableRequirement::new(self.table, &self.keep)]
    }

    fn apply(&self, tables: &mut TableSet) -> Result<(), SchemaError> {
        let table: &mut RawTable = tables.get_mut(self.table, self.name())?;
        table.rename_headers(|header| self.normalize(header));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CONTACT_EVENT_CODE_TABLE, RISK_TABLE};

    fn contacts() -> RawTable {
        RawTable::from_rows(
            CONTACTS_TABLE,
            &["anonymous_pat_id", "contacts_datetime", "attendance", "event_code"],
            &[
                &["1", "2021-01-05 10:00:00", "Attended", "F2F"],
                &["1", "2021-01-06 10:00:00", "Trust cancelled", "F2F"],
                &["1", "2021-01-04 09:00:00", "Patient cancelled", "TEL"],
                &["2", "2021-01-03 09:00:00", "Did not attend (DNA) or not in", "XYZ"],
            ],
        )
        .expect("contacts")
    }

    #[test]
    fn cancelled_contacts_are_dropped() {
        let mut tables = TableSet::new().with(contacts());
        DropCancelledContacts.apply(&mut tables).expect("apply");
        assert_eq!(tables.get(CONTACTS_TABLE, "test").expect("table").len(), 2);
    }

    #[test]
    fn lookup_mapping_adds_target_column_and_leaves_unmapped_empty() {
        let lookup = RawTable::from_rows(
            CONTACT_EVENT_CODE_TABLE,
            &["event_code", "Category"],
            &[&["F2F", "FSO"], &["TEL", "TS"]],
        )
        .expect("lookup");
        let mut tables = TableSet::new().with(contacts()).with(lookup);
        let step = LookupMapping {
            table: CONTACTS_TABLE,
            source_column: "event_code",
            target_column: "contact_event_code",
            lookup_table: CONTACT_EVENT_CODE_TABLE,
            lookup_key: "event_code",
            lookup_value: "Category",
        };
        step.apply(&mut tables).expect("apply");

        let table = tables.get(CONTACTS_TABLE, "test").expect("table");
        let mapped: Vec<Option<&str>> = table
            .rows()
            .iter()
            .map(|row| table.cell(row, "contact_event_code"))
            .collect();
        assert_eq!(mapped, vec![Some("FSO"), Some("FSO"), Some("TS"), None]);
    }

    #[test]
    fn diagnosis_categories_match_code_roots_in_any_code_column() {
        let diagnosis = RawTable::from_rows(
            DIAGNOSIS_TABLE,
            &["anonymous_pat_id", "Diagnosis01Code", "Diagnosis02Code"],
            &[&["1", "F200", ""], &["1", "Z000", "F101"], &["1", "", ""]],
        )
        .expect("diagnosis");
        let codes = RawTable::from_rows(
            DIAGNOSIS_BROAD_CODES_TABLE,
            &["Category", "DiagnosisCodeRoot"],
            &[&["Psychotic", "F2"], &["Substance_misuse", "F1"]],
        )
        .expect("codes");
        let mut tables = TableSet::new().with(diagnosis).with(codes);
        DiagnosisCodeCategories::broad(vec!["mood".to_string()])
            .apply(&mut tables)
            .expect("apply");

        let table = tables.get(DIAGNOSIS_TABLE, "test").expect("table");
        let column = |name: &str| -> Vec<Option<&str>> {
            table.rows().iter().map(|row| table.cell(row, name)).collect()
        };
        assert_eq!(column("diagnosis_broad_psychotic"), vec![Some("1"), Some("0"), Some("0")]);
        assert_eq!(
            column("diagnosis_broad_substance_misuse"),
            vec![Some("0"), Some("1"), Some("0")]
        );
        assert_eq!(column("diagnosis_broad_mood"), vec![Some("0"); 3]);
    }

    #[test]
    fn sort_orders_by_patient_then_date() {
        let mut tables = TableSet::new().with(contacts());
        SortByColumn {
            table: CONTACTS_TABLE,
            date_column: "contacts_datetime",
        }
        .apply(&mut tables)
        .expect("apply");

        let table = tables.get(CONTACTS_TABLE, "test").expect("table");
        let order: Vec<Option<&str>> = table
            .rows()
            .iter()
            .map(|row| table.cell(row, "contacts_datetime"))
            .collect();
        assert_eq!(
            order,
            vec![
                Some("2021-01-04 09:00:00"),
                Some("2021-01-05 10:00:00"),
                Some("2021-01-06 10:00:00"),
                Some("2021-01-03 09:00:00"),
            ]
        );
    }

    #[test]
    fn headers_are_normalised_outside_kept_columns() {
        let risk = RawTable::from_rows(
            RISK_TABLE,
            &["anonymous_pat_id", "screening_datetime", "RiskSuicide", "RiskOfHarmFromOthers"],
            &[],
        )
        .expect("risk");
        let mut tables = TableSet::new().with(risk);
        NormalizeHeaders {
            table: RISK_TABLE,
            prefix: "risk_",
            strip: "Risk",
            keep: vec!["anonymous_pat_id", "screening_datetime"],
        }
        .apply(&mut tables)
        .expect("apply");

        assert_eq!(
            tables.get(RISK_TABLE, "test").expect("table").headers(),
            &[
                "anonymous_pat_id",
                "screening_datetime",
                "risk_suicide",
                "risk_of_harm_from_others"
            ]
        );
    }
}
