//! Feature families: each turns one patient's tables into a fixed set of
//! weekly columns.

mod assessments;
mod bed_days;
mod contacts;
mod crises;
mod crisis_plan;
mod diagnosis;
mod mha;
mod patient;
mod referrals;

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use thiserror::Error;

use crate::calendar::{death_month, end_date_for, first_known_date, parse_year_month, CalendarError, PatientCalendar};
use crate::config::FeatureConfig;
use crate::crisis::CrisisError;
use crate::schema::{
    parse_date, parse_datetime, parse_number, parse_patient_id, RawTable, SchemaError, TableRequirement,
    TableSet, PATIENT_ID_COLUMN, PATIENT_TABLE,
};
use crate::table::{FeatureColumn, TableError, WeeklyTable};

pub use assessments::{RiskAssessmentEventFeature, WellbeingAssessmentStateFeature, RISK_COLUMNS, WELLBEING_COLUMNS};
pub use bed_days::{
    bed_day_stays, bed_days_during_period, BedDayEventFeatures, BedDayStay, LastCrisisBedDaysFeatures,
    BED_DAY_ACTIVITY_CATEGORIES,
};
pub use contacts::{ContactEventFeatures, CONTACT_EVENT_CODE_CATEGORIES};
pub use crises::{CrisisEventFeatures, CrisisInNWeeks, DuringCrisisFeatures, InCrisisPeriod, LastCrisisFeatures};
pub use crisis_plan::{CrisisPlanEventFeatures, CRISIS_PLAN_CURRENT_WEEKS};
pub use diagnosis::{DiagnosisStateFeatures, BROAD_CATEGORIES, GRANULAR_CATEGORIES};
pub use mha::MhaEpisodeStateFeatures;
pub use patient::{PatientTimeInSystemFeatures, AGE_BINS};
pub use referrals::{
    ReferralDischargeEventFeatures, ReferralStateFeatures, REFERRAL_DISCHARGE_CATEGORIES, REFERRAL_SOURCE_CATEGORIES,
};

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Crisis(#[from] CrisisError),
    #[error(transparent)]
    Calendar(#[from] CalendarError),
    #[error("{table}.{column} holds unparsable value '{value}'")]
    ParseField {
        table: String,
        column: String,
        value: String,
    },
    #[error("patient {0} is not present in the patient table")]
    UnknownPatient(i64),
}

pub trait FeatureFamily: Send + Sync {
    fn name(&self) -> String;

    fn requirements(&self) -> Vec<TableRequirement>;

    /// Exact columns, in order, the family emits for every calendar week.
    fn output_schema(&self) -> Vec<FeatureColumn>;

    fn transform(&self, ctx: &PatientContext<'_>) -> Result<WeeklyTable, FeatureError>;
}

/// One patient's tables, calendar and the outputs of families that already
/// ran for that patient.
#[derive(Debug)]
pub struct PatientContext<'a> {
    pub patient_id: i64,
    pub tables: TableSet,
    pub calendar: PatientCalendar,
    pub config: &'a FeatureConfig,
    /// Unclamped first-known month.
    pub first_known: NaiveDate,
    /// Month of death, when recorded. The calendar stops after it.
    pub death: Option<NaiveDate>,
    outputs: BTreeMap<String, WeeklyTable>,
}

impl<'a> PatientContext<'a> {
    pub fn new(patient_id: i64, tables: TableSet, config: &'a FeatureConfig) -> Result<Self, FeatureError> {
        let patients = tables.get(PATIENT_TABLE, "PatientContext")?;
        let row = patients
            .rows()
            .iter()
            .find(|row| patients.cell(row, PATIENT_ID_COLUMN).and_then(parse_patient_id) == Some(patient_id))
            .ok_or(FeatureError::UnknownPatient(patient_id))?;
        let raw = required_cell(patients, row, "first_year_month")?;
        let first_known = parse_year_month(raw)?;
        let death = death_month(patients.cell(row, "month_year_death"))?;
        let calendar = PatientCalendar::new(
            patient_id,
            first_known_date(raw, config.min_start_date)?,
            end_date_for(config.end_date, death),
            config.min_start_date,
        );

        Ok(Self {
            patient_id,
            tables,
            calendar,
            config,
            first_known,
            death,
            outputs: BTreeMap::new(),
        })
    }

    pub fn table(&self, name: &str, consumer: &str) -> Result<&RawTable, SchemaError> {
        self.tables.get(name, consumer)
    }

    pub fn output(&self, family: &str, consumer: &str) -> Result<&WeeklyTable, SchemaError> {
        self.outputs.get(family).ok_or_else(|| SchemaError::MissingTable {
            table: family.to_string(),
            consumer: consumer.to_string(),
        })
    }

    pub fn record_output(&mut self, family: String, table: WeeklyTable) {
        self.outputs.insert(family, table);
    }

    pub fn into_outputs(self) -> BTreeMap<String, WeeklyTable> {
        self.outputs
    }
}

pub(crate) fn required_cell<'a>(
    table: &'a RawTable,
    row: &'a [String],
    column: &str,
) -> Result<&'a str, FeatureError> {
    table.cell(row, column).ok_or_else(|| FeatureError::ParseField {
        table: table.name.clone(),
        column: column.to_string(),
        value: String::new(),
    })
}

fn parse_field<T>(
    table: &RawTable,
    row: &[String],
    column: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, FeatureError> {
    let raw = required_cell(table, row, column)?;
    parse(raw).ok_or_else(|| FeatureError::ParseField {
        table: table.name.clone(),
        column: column.to_string(),
        value: raw.to_string(),
    })
}

pub(crate) fn event_time(table: &RawTable, row: &[String], column: &str) -> Result<NaiveDateTime, FeatureError> {
    parse_field(table, row, column, parse_datetime)
}

/// Start and end dates of a state row; an empty end is open-ended and runs
/// to `open_end`.
pub(crate) fn interval_bounds(
    table: &RawTable,
    row: &[String],
    start_column: &str,
    end_column: &str,
    open_end: NaiveDate,
) -> Result<(NaiveDate, NaiveDate), FeatureError> {
    let start = parse_field(table, row, start_column, parse_date)?;
    let end = match table.cell(row, end_column) {
        None => open_end,
        Some(_) => parse_field(table, row, end_column, parse_date)?,
    };
    Ok((start, end))
}

pub(crate) fn optional_number(table: &RawTable, row: &[String], column: &str) -> Option<f64> {
    table.cell(row, column).and_then(parse_number)
}

/// 0 for counts and flags, missing for recency columns.
pub(crate) fn event_defaults(schema: &[FeatureColumn]) -> Vec<(FeatureColumn, Option<f64>)> {
    schema
        .iter()
        .map(|column| {
            let value = if column.name.starts_with("time_since_last") {
                None
            } else {
                Some(0.0)
            };
            (column.clone(), value)
        })
        .collect()
}

pub(crate) fn constant_defaults(schema: &[FeatureColumn], value: Option<f64>) -> Vec<(FeatureColumn, Option<f64>)> {
    schema.iter().map(|column| (column.clone(), value)).collect()
}

pub(crate) fn flag_values(flags: impl IntoIterator<Item = bool>) -> Vec<Option<f64>> {
    flags
        .into_iter()
        .map(|flag| Some(if flag { 1.0 } else { 0.0 }))
        .collect()
}

pub(crate) fn recency_column(column: &str) -> String {
    format!("time_since_last_{column}")
}
