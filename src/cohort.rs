//! Cohort eligibility: which patients get a feature matrix at all.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::calendar::{death_month, parse_year_month, CalendarError};
use crate::config::{CohortCriteria, FeatureConfig};
use crate::schema::{
    parse_datetime, parse_patient_id, SchemaError, TableSet, CRISIS_TABLE, PATIENT_ID_COLUMN, PATIENT_TABLE,
};

const CONSUMER: &str = "select_cohort";

#[derive(Debug, Error)]
pub enum CohortError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("patient {patient_id}: {source}")]
    Calendar {
        patient_id: i64,
        #[source]
        source: CalendarError,
    },
    #[error("{table}.event_date holds unparsable value '{value}'")]
    InvalidEventDate { table: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientEligibility {
    pub patient_id: i64,
    pub crises: u32,
    pub days_known: i64,
    pub dead: bool,
}

impl PatientEligibility {
    pub fn meets(&self, criteria: &CohortCriteria) -> bool {
        self.crises >= criteria.min_crises
            && self.days_known >= i64::from(criteria.min_days_known)
            && !(criteria.exclude_dead && self.dead)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CohortSelection {
    /// Ascending patient ids.
    pub eligible: Vec<i64>,
    pub excluded: Vec<PatientEligibility>,
}

/// Crisis events per patient dated on or after `min_start`.
fn crisis_counts(tables: &TableSet, min_start: NaiveDate) -> Result<BTreeMap<i64, u32>, CohortError> {
    let crises = tables.get(CRISIS_TABLE, CONSUMER)?;
    let mut counts = BTreeMap::new();
    for row in crises.rows() {
        let Some(patient_id) = crises.cell(row, PATIENT_ID_COLUMN).and_then(parse_patient_id) else {
            continue;
        };
        let Some(raw) = crises.cell(row, "event_date") else {
            continue;
        };
        let timestamp = parse_datetime(raw).ok_or_else(|| CohortError::InvalidEventDate {
            table: crises.name.clone(),
            value: raw.to_string(),
        })?;
        if timestamp.date() >= min_start {
            *counts.entry(patient_id).or_insert(0) += 1;
        }
    }
    Ok(counts)
}

/// Eligibility facts for every patient in the patient table. The crisis
/// table is only read when the criteria ask for a crisis count.
pub fn patient_eligibility(
    tables: &TableSet,
    config: &FeatureConfig,
) -> Result<Vec<PatientEligibility>, CohortError> {
    let counts = if config.cohort.min_crises > 0 || tables.contains(CRISIS_TABLE) {
        crisis_counts(tables, config.min_start_date)?
    } else {
        BTreeMap::new()
    };
    let reference = config.end_date.with_day(1).unwrap_or(config.end_date);

    let patients = tables.get(PATIENT_TABLE, CONSUMER)?;
    let mut facts: Vec<PatientEligibility> = Vec::new();
    for row in patients.rows() {
        let Some(patient_id) = patients.cell(row, PATIENT_ID_COLUMN).and_then(parse_patient_id) else {
            continue;
        };
        if facts.iter().any(|fact| fact.patient_id == patient_id) {
            continue;
        }
        let calendar_error = |source| CohortError::Calendar { patient_id, source };
        let first_known = parse_year_month(patients.cell(row, "first_year_month").unwrap_or_default())
            .map_err(calendar_error)?;
        let death = death_month(patients.cell(row, "month_year_death")).map_err(calendar_error)?;

        facts.push(PatientEligibility {
            patient_id,
            crises: counts.get(&patient_id).copied().unwrap_or(0),
            days_known: (reference - first_known).num_days(),
            dead: death.is_some(),
        });
    }
    facts.sort_by_key(|fact| fact.patient_id);
    Ok(facts)
}

/// Splits the patient table into eligible and excluded patients under
/// `config.cohort`.
pub fn select_cohort(tables: &TableSet, config: &FeatureConfig) -> Result<CohortSelection, CohortError> {
    let mut selection = CohortSelection::default();
    for fact in patient_eligibility(tables, config)? {
        if fact.meets(&config.cohort) {
            selection.eligible.push(fact.patient_id);
        } else {
            debug!(
                component = "cohort",
                event = "cohort.patient.excluded",
                patient_id = fact.patient_id,
                crises = fact.crises,
                days_known = fact.days_known,
                dead = fact.dead
            );
            selection.excluded.push(fact);
        }
    }

    info!(
        component = "cohort",
        event = "cohort.selected",
        eligible = selection.eligible.len(),
        excluded = selection.excluded.len(),
        min_crises = config.cohort.min_crises,
        min_days_known = config.cohort.min_days_known,
        exclude_dead = config.cohort.exclude_dead
    );
    Ok(selection)
}
