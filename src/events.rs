//! Irregular event records aggregated onto the weekly calendar.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calendar::{PatientCalendar, WeekKey};
use crate::table::{infer_dtype, FeatureDType, TableError, WeeklyTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stat {
    Sum,
    Max,
    Min,
}

impl Stat {
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Max => "max",
            Self::Min => "min",
        }
    }

    fn reduce(self, values: &[f64]) -> f64 {
        match self {
            Self::Sum => values.iter().sum(),
            Self::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Self::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatSpec {
    pub column: String,
    pub stats: Vec<Stat>,
}

impl StatSpec {
    pub fn new(column: impl Into<String>, stats: &[Stat]) -> Self {
        Self {
            column: column.into(),
            stats: stats.to_vec(),
        }
    }

    pub fn output_names(&self) -> Vec<String> {
        self.stats
            .iter()
            .map(|stat| format!("{}_{}", self.column, stat.suffix()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub patient_id: i64,
    pub timestamp: NaiveDateTime,
    pub attributes: BTreeMap<String, f64>,
}

impl EventRecord {
    pub fn new(patient_id: i64, timestamp: NaiveDateTime) -> Self {
        Self {
            patient_id,
            timestamp,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with(mut self, column: impl Into<String>, value: f64) -> Self {
        self.attributes.insert(column.into(), value);
        self
    }

    pub fn week(&self) -> WeekKey {
        WeekKey::of(self.timestamp.date())
    }
}

/// One row per calendar week. `occurrence_column` is an implicit attribute
/// worth 1 on every event; weeks without events reduce to 0 for every
/// requested statistic. Expects events for the calendar's patient only.
pub fn aggregate_events(
    events: &[EventRecord],
    calendar: &PatientCalendar,
    occurrence_column: &str,
    specs: &[StatSpec],
) -> Result<WeeklyTable, TableError> {
    let mut per_week: Vec<Vec<&EventRecord>> = vec![Vec::new(); calendar.len()];
    let mut dropped = 0usize;
    for event in events {
        match calendar.position(event.week()) {
            Some(idx) => per_week[idx].push(event),
            None => dropped += 1,
        }
    }

    let mut table = WeeklyTable::new(calendar);
    for spec in specs {
        let weekly_inputs: Vec<Vec<f64>> = per_week
            .iter()
            .map(|bucket| {
                bucket
                    .iter()
                    .map(|event| attribute_value(event, &spec.column, occurrence_column))
                    .collect()
            })
            .collect();

        for stat in &spec.stats {
            let values: Vec<Option<f64>> = weekly_inputs
                .iter()
                .map(|inputs| {
                    if inputs.is_empty() {
                        Some(0.0)
                    } else {
                        Some(stat.reduce(inputs))
                    }
                })
                .collect();
            let dtype = if spec.column == occurrence_column {
                FeatureDType::Int
            } else {
                infer_dtype(&values)
            };
            table.insert(format!("{}_{}", spec.column, stat.suffix()), dtype, values)?;
        }
    }

    debug!(
        component = "events",
        event = "events.aggregated",
        patient_id = calendar.patient_id,
        input_events = events.len(),
        dropped_outside_calendar = dropped,
        weeks = calendar.len(),
        columns = table.columns().len()
    );

    Ok(table)
}

fn attribute_value(event: &EventRecord, column: &str, occurrence_column: &str) -> f64 {
    if column == occurrence_column {
        return 1.0;
    }
    match event.attributes.get(column) {
        Some(v) if v.is_finite() => *v,
        _ => 0.0,
    }
}
