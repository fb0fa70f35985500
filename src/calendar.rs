//! Monday-aligned ISO week calendar per patient.

use std::collections::HashMap;

use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WeekKey {
    pub year: i32,
    pub week: u32,
}

impl WeekKey {
    pub fn new(year: i32, week: u32) -> Self {
        Self { year, week }
    }

    pub fn of(date: NaiveDate) -> Self {
        let iso = date.iso_week();
        Self {
            year: iso.year(),
            week: iso.week(),
        }
    }

    pub fn monday(self) -> Option<NaiveDate> {
        NaiveDate::from_isoywd_opt(self.year, self.week, Weekday::Mon)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CalendarError {
    #[error("invalid year-month value: '{0}' (expected YYYYMM)")]
    InvalidYearMonth(String),
}

pub fn default_min_start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2012, 1, 1).unwrap_or(NaiveDate::MIN)
}

pub fn parse_year_month(raw: &str) -> Result<NaiveDate, CalendarError> {
    let trimmed = raw.trim();
    // Numeric exports sometimes carry a trailing ".0".
    let digits = trimmed.strip_suffix(".0").unwrap_or(trimmed);
    if digits.len() != 6 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CalendarError::InvalidYearMonth(raw.to_string()));
    }

    let year: i32 = digits[..4]
        .parse()
        .map_err(|_| CalendarError::InvalidYearMonth(raw.to_string()))?;
    let month: u32 = digits[4..]
        .parse()
        .map_err(|_| CalendarError::InvalidYearMonth(raw.to_string()))?;
    NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| CalendarError::InvalidYearMonth(raw.to_string()))
}

pub fn first_known_date(raw: &str, min_start: NaiveDate) -> Result<NaiveDate, CalendarError> {
    Ok(parse_year_month(raw)?.max(min_start))
}

/// Death months from this year-month on are the export's placeholder for a
/// living patient.
pub const ALIVE_YEAR_MONTH: (i32, u32) = (2900, 12);

/// Month of death from a `month_year_death` cell; `None` when the cell is
/// empty or holds the living placeholder.
pub fn death_month(raw: Option<&str>) -> Result<Option<NaiveDate>, CalendarError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let month = parse_year_month(raw)?;
    if (month.year(), month.month()) >= ALIVE_YEAR_MONTH {
        return Ok(None);
    }
    Ok(Some(month))
}

pub fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
}

/// Calendar end for a patient: the configured end date, pulled back to the
/// first day after the month of death.
pub fn end_date_for(end_date: NaiveDate, death: Option<NaiveDate>) -> NaiveDate {
    death
        .and_then(first_of_next_month)
        .map_or(end_date, |after_death| after_death.min(end_date))
}

pub fn monday_of(date: NaiveDate) -> NaiveDate {
    date - ChronoDuration::days(i64::from(date.weekday().num_days_from_monday()))
}

/// Weeks from the Monday of the (clamped) first-known week up to, and
/// excluding, the Monday of the week containing `end_date`.
pub fn build_calendar(
    first_known: NaiveDate,
    end_date: NaiveDate,
    min_start: NaiveDate,
) -> Vec<WeekKey> {
    let start = monday_of(first_known.max(min_start));
    let stop = monday_of(end_date);

    let mut weeks = Vec::new();
    let mut monday = start;
    while monday < stop {
        weeks.push(WeekKey::of(monday));
        monday += ChronoDuration::weeks(1);
    }
    weeks
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientCalendar {
    pub patient_id: i64,
    weeks: Vec<WeekKey>,
    positions: HashMap<WeekKey, usize>,
}

impl PatientCalendar {
    pub fn new(
        patient_id: i64,
        first_known: NaiveDate,
        end_date: NaiveDate,
        min_start: NaiveDate,
    ) -> Self {
        let weeks = build_calendar(first_known, end_date, min_start);
        debug!(
            component = "calendar",
            event = "calendar.built",
            patient_id,
            first_known = %first_known,
            end_date = %end_date,
            week_count = weeks.len()
        );
        Self::from_weeks(patient_id, weeks)
    }

    pub fn from_weeks(patient_id: i64, weeks: Vec<WeekKey>) -> Self {
        let positions = weeks
            .iter()
            .enumerate()
            .map(|(idx, week)| (*week, idx))
            .collect();
        Self {
            patient_id,
            weeks,
            positions,
        }
    }

    pub fn weeks(&self) -> &[WeekKey] {
        &self.weeks
    }

    pub fn len(&self) -> usize {
        self.weeks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weeks.is_empty()
    }

    pub fn position(&self, week: WeekKey) -> Option<usize> {
        self.positions.get(&week).copied()
    }

    pub fn position_of_date(&self, date: NaiveDate) -> Option<usize> {
        self.position(WeekKey::of(date))
    }

    pub fn mondays(&self) -> Vec<NaiveDate> {
        self.weeks.iter().filter_map(|week| week.monday()).collect()
    }
}
