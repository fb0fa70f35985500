//! Interval-valued clinical states expanded onto the weekly calendar.

use std::collections::BTreeMap;

use chrono::{Duration as ChronoDuration, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calendar::{monday_of, PatientCalendar, WeekKey};
use crate::table::{infer_dtype, TableError, WeeklyTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateReducer {
    /// Last non-missing value in interval order.
    Last,
    Max,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateInterval {
    pub patient_id: i64,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub attributes: BTreeMap<String, Option<f64>>,
}

impl StateInterval {
    pub fn new(patient_id: i64, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            patient_id,
            start,
            end,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with(mut self, column: impl Into<String>, value: Option<f64>) -> Self {
        self.attributes.insert(column.into(), value);
        self
    }
}

/// Weeks covered by an interval: every Monday from the start week up to the
/// earlier of the end week and `end_date`. A degenerate range yields the
/// start week alone.
pub fn expand_interval(interval: &StateInterval, end_date: NaiveDate) -> Vec<WeekKey> {
    let first = monday_of(interval.start);
    let last = monday_of(interval.end).min(end_date);

    let mut weeks = Vec::new();
    let mut monday = first;
    while monday <= last {
        weeks.push(WeekKey::of(monday));
        monday += ChronoDuration::weeks(1);
    }

    if weeks.is_empty() {
        weeks.push(WeekKey::of(interval.start));
    }
    weeks
}

/// Reduces the expanded intervals per calendar week. Weeks no interval
/// covers stay missing; callers choose whether to fill them.
pub fn aggregate_state(
    intervals: &[StateInterval],
    calendar: &PatientCalendar,
    end_date: NaiveDate,
    columns: &[String],
    reducer: StateReducer,
) -> Result<WeeklyTable, TableError> {
    let mut covering: Vec<Vec<&StateInterval>> = vec![Vec::new(); calendar.len()];
    let mut expanded_rows = 0usize;
    for interval in intervals {
        for week in expand_interval(interval, end_date) {
            expanded_rows += 1;
            if let Some(idx) = calendar.position(week) {
                covering[idx].push(interval);
            }
        }
    }

    let mut table = WeeklyTable::new(calendar);
    for column in columns {
        let values: Vec<Option<f64>> = covering
            .iter()
            .map(|rows| {
                let present = rows
                    .iter()
                    .filter_map(|interval| interval.attributes.get(column).copied().flatten());
                match reducer {
                    StateReducer::Last => present.last(),
                    StateReducer::Max => present.reduce(f64::max),
                }
            })
            .collect();
        let dtype = infer_dtype(&values);
        table.insert(column.clone(), dtype, values)?;
    }

    debug!(
        component = "state",
        event = "state.aggregated",
        patient_id = calendar.patient_id,
        intervals = intervals.len(),
        expanded_rows,
        weeks = calendar.len(),
        reducer = ?reducer
    );

    Ok(table)
}
