//! Crisis bursts and crisis periods.
//!
//! A burst starts on a crisis week whose previous week was at least
//! `weeks_before_new_burst` weeks clear of any crisis (or had no crisis
//! history at all). The crisis period opened by a burst lasts while the
//! weeks since the last crisis stay below the threshold.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::calendar::PatientCalendar;
use crate::events::EventRecord;
use crate::recency::time_since_last;
use crate::table::{FeatureColumn, TableError, WeeklyTable};

pub const CRISIS_INDICATOR_COLUMN: &str = "crisis_max";
pub const CRISIS_RECENCY_COLUMN: &str = "time_since_last_crisis";
pub const SEVERITY_ATTRIBUTE: &str = "severity";

#[derive(Debug, Error, PartialEq)]
pub enum CrisisError {
    #[error("weeks_before_new_burst must be >= 1, got {0}")]
    InvalidThreshold(u32),
    #[error("indicator has {indicator} weeks but recency has {recency}")]
    LengthMismatch { indicator: usize, recency: usize },
    #[error("recency disagrees with crisis indicator at position {position}")]
    InconsistentRecency { position: usize },
    #[error("{column} holds {value:?} at position {position}, expected a non-negative count")]
    InvalidCount {
        column: String,
        position: usize,
        value: Option<f64>,
    },
    #[error(transparent)]
    Table(#[from] TableError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrisisSegmentation {
    pub weeks_before_new_burst: u32,
    pub burst_start: Vec<bool>,
    /// Ordinal of the burst whose period covers the week, 0 outside periods.
    pub burst_number: Vec<u32>,
    pub in_crisis_period: Vec<bool>,
    pub bursts_passed: Vec<u32>,
}

impl CrisisSegmentation {
    pub fn burst_count(&self) -> u32 {
        self.bursts_passed.last().copied().unwrap_or(0)
    }
}

pub fn segment_crises(
    indicator: &[bool],
    recency: &[Option<u32>],
    weeks_before_new_burst: u32,
) -> Result<CrisisSegmentation, CrisisError> {
    if weeks_before_new_burst == 0 {
        return Err(CrisisError::InvalidThreshold(weeks_before_new_burst));
    }
    if indicator.len() != recency.len() {
        return Err(CrisisError::LengthMismatch {
            indicator: indicator.len(),
            recency: recency.len(),
        });
    }
    if let Some(position) = indicator
        .iter()
        .zip(recency)
        .position(|(active, r)| *active != (*r == Some(0)))
    {
        return Err(CrisisError::InconsistentRecency { position });
    }

    let len = indicator.len();
    let mut out = CrisisSegmentation {
        weeks_before_new_burst,
        burst_start: Vec::with_capacity(len),
        burst_number: Vec::with_capacity(len),
        in_crisis_period: Vec::with_capacity(len),
        bursts_passed: Vec::with_capacity(len),
    };

    let mut bursts = 0u32;
    let mut current = 0u32;
    let mut previous_recency: Option<u32> = None;
    for (active, r) in indicator.iter().zip(recency) {
        let quiet_long_enough = previous_recency.map_or(true, |prev| prev >= weeks_before_new_burst);
        let starts = *active && quiet_long_enough;

        if starts {
            bursts += 1;
            current = bursts;
        } else if r.map_or(true, |weeks| weeks == weeks_before_new_burst) {
            current = 0;
        }

        out.burst_start.push(starts);
        out.burst_number.push(current);
        out.in_crisis_period.push(current != 0);
        out.bursts_passed.push(bursts);
        previous_recency = *r;
    }

    Ok(out)
}

pub fn burst_column(weeks_before_new_burst: u32) -> String {
    format!("crisis_burst_{weeks_before_new_burst}week")
}

pub fn burst_number_column(weeks_before_new_burst: u32) -> String {
    format!("number_crisis_burst_{weeks_before_new_burst}week")
}

pub fn in_period_column(weeks_before_new_burst: u32) -> String {
    format!("in_crisis_period_burst_{weeks_before_new_burst}week")
}

pub fn bursts_passed_column(weeks_before_new_burst: u32) -> String {
    format!("number_crises_burst_{weeks_before_new_burst}week_passed")
}

pub fn segmentation_schema(weeks_before_new_burst: u32) -> Vec<FeatureColumn> {
    vec![
        FeatureColumn::int(burst_column(weeks_before_new_burst)),
        FeatureColumn::int(burst_number_column(weeks_before_new_burst)),
        FeatureColumn::int(in_period_column(weeks_before_new_burst)),
        FeatureColumn::int(bursts_passed_column(weeks_before_new_burst)),
    ]
}

/// Segments the weekly crisis table produced by the crisis event family.
pub fn segment_crisis_table(
    crisis_features: &WeeklyTable,
    weeks_before_new_burst: u32,
) -> Result<CrisisSegmentation, CrisisError> {
    crisis_features.ensure_ascending_weeks()?;
    let indicator = crisis_features.indicator(CRISIS_INDICATOR_COLUMN)?;
    let recency = match crisis_features.column(CRISIS_RECENCY_COLUMN) {
        Some(column) => column
            .values
            .iter()
            .map(|v| v.map(|weeks| weeks as u32))
            .collect(),
        None => time_since_last(&indicator),
    };

    let segmentation = segment_crises(&indicator, &recency, weeks_before_new_burst)?;
    debug!(
        component = "crisis",
        event = "crisis.segmented",
        patient_id = crisis_features.patient_id(),
        weeks_before_new_burst,
        bursts = segmentation.burst_count(),
        weeks = indicator.len()
    );
    Ok(segmentation)
}

pub fn segmentation_table(
    calendar: &PatientCalendar,
    segmentation: &CrisisSegmentation,
) -> Result<WeeklyTable, TableError> {
    let n = segmentation.weeks_before_new_burst;
    let mut table = WeeklyTable::new(calendar);
    table.insert_flags(burst_column(n), &segmentation.burst_start)?;
    table.insert_counts(burst_number_column(n), &segmentation.burst_number)?;
    table.insert_flags(in_period_column(n), &segmentation.in_crisis_period)?;
    table.insert_counts(bursts_passed_column(n), &segmentation.bursts_passed)?;
    Ok(table)
}

/// Reads back a segmentation cached by `segmentation_table`.
pub fn segmentation_from_table(
    periods: &WeeklyTable,
    weeks_before_new_burst: u32,
) -> Result<CrisisSegmentation, CrisisError> {
    periods.ensure_ascending_weeks()?;
    let n = weeks_before_new_burst;
    Ok(CrisisSegmentation {
        weeks_before_new_burst: n,
        burst_start: periods.indicator(&burst_column(n))?,
        burst_number: counts(periods, &burst_number_column(n))?,
        in_crisis_period: periods.indicator(&in_period_column(n))?,
        bursts_passed: counts(periods, &bursts_passed_column(n))?,
    })
}

fn counts(table: &WeeklyTable, column: &str) -> Result<Vec<u32>, CrisisError> {
    table
        .values(column)?
        .iter()
        .enumerate()
        .map(|(position, value)| match value {
            Some(v) if *v >= 0.0 && v.fract() == 0.0 => Ok(*v as u32),
            other => Err(CrisisError::InvalidCount {
                column: column.to_string(),
                position,
                value: *other,
            }),
        })
        .collect()
}

pub fn label_column(n_weeks: u32) -> String {
    format!("crisis_in_{n_weeks}_weeks")
}

/// 1 when a burst starts in one of the next `n_weeks` weeks. Weeks whose
/// look-ahead runs past the end of history resolve to 0.
pub fn crisis_in_n_weeks(burst_start: &[bool], n_weeks: u32) -> Vec<Option<f64>> {
    let n = n_weeks as usize;
    (0..burst_start.len())
        .map(|idx| {
            let complete = idx + n < burst_start.len();
            let hit = complete && burst_start[idx + 1..=idx + n].iter().any(|b| *b);
            Some(if hit { 1.0 } else { 0.0 })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrisisPeriodSummary {
    pub burst_number: u32,
    pub start_week_index: usize,
    pub end_week_index: usize,
    pub start_monday: Option<NaiveDate>,
    pub end_monday: Option<NaiveDate>,
    pub number_of_crisis: u32,
    pub number_of_days_in_crisis: u32,
    pub max_severity: Option<f64>,
}

impl CrisisPeriodSummary {
    pub fn weeks_in_period(&self) -> u32 {
        (self.end_week_index - self.start_week_index + 1) as u32
    }
}

fn events_per_week<'a>(calendar: &PatientCalendar, events: &'a [EventRecord]) -> Vec<Vec<&'a EventRecord>> {
    let mut per_week: Vec<Vec<&EventRecord>> = vec![Vec::new(); calendar.len()];
    for event in events {
        if let Some(idx) = calendar.position(event.week()) {
            per_week[idx].push(event);
        }
    }
    per_week
}

fn max_severity(current: Option<f64>, event: &EventRecord) -> Option<f64> {
    match (current, event.attributes.get(SEVERITY_ATTRIBUTE)) {
        (Some(max), Some(severity)) => Some(max.max(*severity)),
        (None, Some(severity)) => Some(*severity),
        (max, None) => max,
    }
}

pub fn summarize_crisis_periods(
    calendar: &PatientCalendar,
    segmentation: &CrisisSegmentation,
    crisis_events: &[EventRecord],
) -> Vec<CrisisPeriodSummary> {
    let per_week = events_per_week(calendar, crisis_events);

    let mut summaries: Vec<CrisisPeriodSummary> = Vec::new();
    let mut days: Vec<BTreeSet<NaiveDate>> = Vec::new();
    for (idx, number) in segmentation.burst_number.iter().enumerate() {
        if *number == 0 || idx >= calendar.len() {
            continue;
        }
        let monday = calendar.weeks()[idx].monday();
        let open_new = summaries.last().map_or(true, |s| s.burst_number != *number);
        if open_new {
            summaries.push(CrisisPeriodSummary {
                burst_number: *number,
                start_week_index: idx,
                end_week_index: idx,
                start_monday: monday,
                end_monday: monday,
                number_of_crisis: 0,
                number_of_days_in_crisis: 0,
                max_severity: None,
            });
            days.push(BTreeSet::new());
        }

        let (Some(summary), Some(period_days)) = (summaries.last_mut(), days.last_mut()) else {
            continue;
        };
        summary.end_week_index = idx;
        summary.end_monday = monday;
        for event in &per_week[idx] {
            summary.number_of_crisis += 1;
            period_days.insert(event.timestamp.date());
            summary.max_severity = max_severity(summary.max_severity, event);
        }
        summary.number_of_days_in_crisis = period_days.len() as u32;
    }
    summaries
}

pub fn last_crisis_schema() -> Vec<FeatureColumn> {
    vec![
        FeatureColumn::int("number_of_crisis_last_crisis"),
        FeatureColumn::int("number_of_days_in_crisis_last_crisis"),
        FeatureColumn::float("max_severity_crisis_last_crisis"),
        FeatureColumn::int("weeks_in_crisis_last_crisis"),
    ]
}

pub fn during_crisis_schema() -> Vec<FeatureColumn> {
    vec![
        FeatureColumn::int("number_of_crisis_current_crisis"),
        FeatureColumn::int("number_of_days_in_crisis_current_crisis"),
        FeatureColumn::float("max_severity_crisis_current_crisis"),
        FeatureColumn::int("weeks_in_current_crisis"),
    ]
}

/// Running totals of the crisis period covering each week, up to and
/// including that week. Weeks outside a period hold 0 and no severity.
pub fn during_crisis_features(
    calendar: &PatientCalendar,
    segmentation: &CrisisSegmentation,
    crisis_events: &[EventRecord],
) -> Result<WeeklyTable, TableError> {
    let len = calendar.len();
    let per_week = events_per_week(calendar, crisis_events);
    let mut count = vec![Some(0.0); len];
    let mut days = vec![Some(0.0); len];
    let mut severity = vec![None; len];
    let mut weeks = vec![Some(0.0); len];

    let mut current = 0u32;
    let mut crises = 0u32;
    let mut crisis_days: BTreeSet<NaiveDate> = BTreeSet::new();
    let mut period_severity: Option<f64> = None;
    let mut period_weeks = 0u32;
    for (idx, number) in segmentation.burst_number.iter().take(len).enumerate() {
        if *number == 0 {
            current = 0;
            continue;
        }
        if *number != current {
            current = *number;
            crises = 0;
            crisis_days.clear();
            period_severity = None;
            period_weeks = 0;
        }
        period_weeks += 1;
        for event in &per_week[idx] {
            crises += 1;
            crisis_days.insert(event.timestamp.date());
            period_severity = max_severity(period_severity, event);
        }
        count[idx] = Some(f64::from(crises));
        days[idx] = Some(crisis_days.len() as f64);
        severity[idx] = period_severity;
        weeks[idx] = Some(f64::from(period_weeks));
    }

    let mut table = WeeklyTable::new(calendar);
    for (column, values) in during_crisis_schema().into_iter().zip([count, days, severity, weeks]) {
        table.insert(column.name, column.dtype, values)?;
    }
    Ok(table)
}

/// For every week, the row of the most recent period that ended strictly
/// before it. Weeks before the first finished period are missing.
pub fn carry_forward_after_periods(
    calendar: &PatientCalendar,
    schema: &[FeatureColumn],
    periods: &[(usize, Vec<Option<f64>>)],
) -> Result<WeeklyTable, TableError> {
    let len = calendar.len();
    let mut columns: Vec<Vec<Option<f64>>> = vec![vec![None; len]; schema.len()];

    let mut next = 0usize;
    let mut latest: Option<&Vec<Option<f64>>> = None;
    for idx in 0..len {
        while next < periods.len() && periods[next].0 < idx {
            latest = Some(&periods[next].1);
            next += 1;
        }
        if let Some(row) = latest {
            for (column, value) in columns.iter_mut().zip(row) {
                column[idx] = *value;
            }
        }
    }

    let mut table = WeeklyTable::new(calendar);
    for (column, values) in schema.iter().zip(columns) {
        table.insert(column.name.clone(), column.dtype, values)?;
    }
    Ok(table)
}

/// Carries forward the summary of the most recent period that ended
/// strictly before each week.
pub fn last_crisis_features(
    calendar: &PatientCalendar,
    summaries: &[CrisisPeriodSummary],
) -> Result<WeeklyTable, TableError> {
    let periods: Vec<(usize, Vec<Option<f64>>)> = summaries
        .iter()
        .map(|summary| {
            (
                summary.end_week_index,
                vec![
                    Some(f64::from(summary.number_of_crisis)),
                    Some(f64::from(summary.number_of_days_in_crisis)),
                    summary.max_severity,
                    Some(f64::from(summary.weeks_in_period())),
                ],
            )
        })
        .collect();
    carry_forward_after_periods(calendar, &last_crisis_schema(), &periods)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::WeekKey;
    use crate::table::FeatureDType;

    fn flags(raw: &[u8]) -> Vec<bool> {
        raw.iter().map(|v| *v != 0).collect()
    }

    fn segment(raw: &[u8], threshold: u32) -> CrisisSegmentation {
        let indicator = flags(raw);
        let recency = time_since_last(&indicator);
        segment_crises(&indicator, &recency, threshold).expect("segmentation")
    }

    #[test]
    fn one_week_threshold_splits_three_bursts() {
        let seg = segment(&[0, 1, 0, 0, 1, 1, 0, 0, 0, 0, 1], 1);
        assert_eq!(seg.burst_start, flags(&[0, 1, 0, 0, 1, 0, 0, 0, 0, 0, 1]));
        assert_eq!(seg.in_crisis_period, flags(&[0, 1, 0, 0, 1, 1, 0, 0, 0, 0, 1]));
        assert_eq!(seg.burst_number, vec![0, 1, 0, 0, 2, 2, 0, 0, 0, 0, 3]);
        assert_eq!(seg.bursts_passed, vec![0, 1, 1, 1, 2, 2, 2, 2, 2, 2, 3]);
    }

    #[test]
    fn two_week_threshold_keeps_period_open_for_one_quiet_week() {
        let seg = segment(&[1, 0, 1, 0, 0, 1], 2);
        // Week 2 follows a single quiet week, so it continues burst 1.
        assert_eq!(seg.burst_start, flags(&[1, 0, 0, 0, 0, 1]));
        assert_eq!(seg.in_crisis_period, flags(&[1, 1, 1, 1, 0, 1]));
        assert_eq!(seg.burst_number, vec![1, 1, 1, 1, 0, 2]);
    }

    #[test]
    fn rejects_zero_threshold_and_mismatched_inputs() {
        assert_eq!(
            segment_crises(&[true], &[Some(0)], 0),
            Err(CrisisError::InvalidThreshold(0))
        );
        assert_eq!(
            segment_crises(&[true, false], &[Some(0)], 1),
            Err(CrisisError::LengthMismatch {
                indicator: 2,
                recency: 1
            })
        );
        assert_eq!(
            segment_crises(&[true, false], &[Some(0), Some(0)], 1),
            Err(CrisisError::InconsistentRecency { position: 1 })
        );
    }

    fn crisis_table(weeks: &[(i32, u32)], crisis_max: &[f64]) -> WeeklyTable {
        let weeks = weeks.iter().map(|(y, w)| WeekKey::new(*y, *w)).collect();
        let mut table = WeeklyTable::from_weeks(7, weeks);
        table
            .insert(
                CRISIS_INDICATOR_COLUMN,
                FeatureDType::Int,
                crisis_max.iter().copied().map(Some).collect(),
            )
            .expect("insert");
        table
    }

    #[test]
    fn segmenting_a_table_rejects_descending_weeks() {
        let table = crisis_table(&[(2021, 1), (2021, 3), (2021, 2)], &[1.0, 0.0, 1.0]);
        assert_eq!(
            segment_crisis_table(&table, 1),
            Err(CrisisError::Table(TableError::WeeksOutOfOrder { position: 2 }))
        );
    }

    #[test]
    fn segmenting_a_table_rejects_non_binary_indicator() {
        let table = crisis_table(&[(2021, 1), (2021, 2)], &[0.0, 2.0]);
        assert_eq!(
            segment_crisis_table(&table, 1),
            Err(CrisisError::Table(TableError::NonBoolean {
                column: CRISIS_INDICATOR_COLUMN.to_string(),
                year: 2021,
                week: 2,
                value: Some(2.0),
            }))
        );
    }

    fn calendar(len: u32) -> PatientCalendar {
        PatientCalendar::from_weeks(7, (1..=len).map(|w| WeekKey::new(2021, w)).collect())
    }

    fn crisis_event(y: i32, m: u32, d: u32, severity: f64) -> EventRecord {
        let at = NaiveDate::from_ymd_opt(y, m, d)
            .and_then(|date| date.and_hms_opt(9, 0, 0))
            .expect("valid timestamp");
        EventRecord::new(7, at).with(SEVERITY_ATTRIBUTE, severity)
    }

    #[test]
    fn cached_segmentation_reads_back_unchanged() {
        let cal = calendar(6);
        let seg = segment(&[1, 1, 0, 0, 1, 0], 1);
        let table = segmentation_table(&cal, &seg).expect("table");
        assert_eq!(segmentation_from_table(&table, 1), Ok(seg));

        let mut broken = table.clone();
        broken
            .map_column(&burst_number_column(1), |v| v.map(|n| n - 0.5))
            .expect("map");
        assert!(matches!(
            segmentation_from_table(&broken, 1),
            Err(CrisisError::InvalidCount { position: 0, .. })
        ));
    }

    #[test]
    fn during_crisis_totals_run_within_each_period() {
        let cal = calendar(6);
        let seg = segment(&[1, 1, 0, 0, 1, 0], 1);
        // 2021-W01 runs from Jan 4; W02 from Jan 11; W05 from Feb 1.
        let events = vec![
            crisis_event(2021, 1, 4, 2.0),
            crisis_event(2021, 1, 4, 1.0),
            crisis_event(2021, 1, 12, 3.0),
            crisis_event(2021, 2, 2, 1.0),
        ];
        let table = during_crisis_features(&cal, &seg, &events).expect("during crisis");

        assert_eq!(
            table.values("number_of_crisis_current_crisis").expect("count"),
            &[Some(2.0), Some(3.0), Some(0.0), Some(0.0), Some(1.0), Some(0.0)]
        );
        assert_eq!(
            table.values("number_of_days_in_crisis_current_crisis").expect("days"),
            &[Some(1.0), Some(2.0), Some(0.0), Some(0.0), Some(1.0), Some(0.0)]
        );
        assert_eq!(
            table.values("max_severity_crisis_current_crisis").expect("severity"),
            &[Some(2.0), Some(3.0), None, None, Some(1.0), None]
        );
        assert_eq!(
            table.values("weeks_in_current_crisis").expect("weeks"),
            &[Some(1.0), Some(2.0), Some(0.0), Some(0.0), Some(1.0), Some(0.0)]
        );
    }

    #[test]
    fn carry_forward_starts_the_week_after_a_period_ends() {
        let cal = calendar(5);
        let schema = vec![FeatureColumn::int("stays_last_crisis")];
        let periods = vec![(1, vec![Some(4.0)]), (3, vec![Some(0.0)])];
        let table = carry_forward_after_periods(&cal, &schema, &periods).expect("carry forward");
        assert_eq!(
            table.values("stays_last_crisis").expect("column"),
            &[None, None, Some(4.0), Some(4.0), Some(0.0)]
        );
    }

    #[test]
    fn label_looks_ahead_and_zeroes_incomplete_tail() {
        let starts = flags(&[0, 0, 1, 0, 0, 0, 1]);
        assert_eq!(
            crisis_in_n_weeks(&starts, 2),
            vec![Some(1.0), Some(1.0), Some(0.0), Some(0.0), Some(1.0), Some(0.0), Some(0.0)]
        );
    }
}
