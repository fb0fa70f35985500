//! Inpatient bed days: weekly hospitalization events, and stays summarised
//! over crisis periods.

use std::iter;

use chrono::{Duration as ChronoDuration, NaiveDate};

use crate::crisis::{carry_forward_after_periods, summarize_crisis_periods, CrisisPeriodSummary};
use crate::events::{aggregate_events, EventRecord, Stat, StatSpec};
use crate::recency::{recency_values, time_since_last};
use crate::schema::{parse_number, RawTable, TableRequirement, HOSPITALIZATION_TABLE, PATIENT_TABLE};
use crate::table::{FeatureColumn, FeatureDType, WeeklyTable};
use crate::window::{cumulative, ever_column, WindowReducer};

use super::crises::cached_segmentation;
use super::{event_defaults, event_time, recency_column, FeatureError, FeatureFamily, PatientContext};

pub const BED_DAY_ACTIVITY_CATEGORIES: [&str; 7] = [
    "acute_assessment",
    "medium_secure",
    "rehab",
    "hdu",
    "picu",
    "continuing_care",
    "other",
];

const OBSERVATION_LEVELS: [u8; 4] = [1, 2, 3, 4];
const OCCURRENCE_COLUMN: &str = "hospitalization";

fn activity_column(category: &str) -> String {
    format!("hospitalization_activity_{category}")
}

fn observation_column(level: u8) -> String {
    format!("hospitalization_level_of_obs_{level}")
}

/// `LEVEL1` .. `LEVEL4`; anything else counts as level 1.
fn observation_level(raw: Option<&str>) -> u8 {
    match raw {
        Some("LEVEL2") => 2,
        Some("LEVEL3") => 3,
        Some("LEVEL4") => 4,
        _ => 1,
    }
}

fn dummy_columns() -> Vec<String> {
    BED_DAY_ACTIVITY_CATEGORIES
        .iter()
        .map(|category| activity_column(category))
        .chain(OBSERVATION_LEVELS.iter().map(|level| observation_column(*level)))
        .collect()
}

fn sum_column(column: &str) -> String {
    format!("{column}_sum")
}

fn bed_day_events(table: &RawTable, patient_id: i64) -> Result<Vec<EventRecord>, FeatureError> {
    table
        .rows()
        .iter()
        .map(|row| {
            let mut event = EventRecord::new(patient_id, event_time(table, row, "date_in_bed")?);
            if let Some(activity) = table.cell(row, "hospitalization_activity") {
                let activity = activity.to_lowercase();
                if BED_DAY_ACTIVITY_CATEGORIES.contains(&activity.as_str()) {
                    event = event.with(activity_column(&activity), 1.0);
                }
            }
            let level = observation_level(table.cell(row, "level_of_observation"));
            Ok(event.with(observation_column(level), 1.0))
        })
        .collect()
}

/// Weekly bed-day counts by ward activity and observation level, with
/// recency and cumulative totals.
#[derive(Debug, Clone, Default)]
pub struct BedDayEventFeatures;

impl BedDayEventFeatures {
    pub const NAME: &'static str = "BedDayEventFeatures";

    fn counted_columns() -> Vec<String> {
        iter::once(OCCURRENCE_COLUMN.to_string())
            .chain(dummy_columns())
            .map(|column| sum_column(&column))
            .collect()
    }
}

impl FeatureFamily for BedDayEventFeatures {
    fn name(&self) -> String {
        Self::NAME.to_string()
    }

    fn requirements(&self) -> Vec<TableRequirement> {
        vec![
            TableRequirement::new(PATIENT_TABLE, &["anonymous_pat_id", "first_year_month"]),
            TableRequirement::new(
                HOSPITALIZATION_TABLE,
                &["anonymous_pat_id", "date_in_bed", "level_of_observation"],
            ),
        ]
    }

    fn output_schema(&self) -> Vec<FeatureColumn> {
        let dummies = dummy_columns();
        let mut columns = vec![
            "hospitalization_sum".to_string(),
            "hospitalization_max".to_string(),
            recency_column(OCCURRENCE_COLUMN),
        ];
        columns.extend(dummies.iter().map(|column| recency_column(column)));
        columns.extend(dummies.iter().map(|column| sum_column(column)));
        columns.extend(Self::counted_columns().iter().map(|column| ever_column(column)));
        columns.into_iter().map(FeatureColumn::int).collect()
    }

    fn transform(&self, ctx: &PatientContext<'_>) -> Result<WeeklyTable, FeatureError> {
        let hospital = ctx.table(HOSPITALIZATION_TABLE, Self::NAME)?;
        if hospital.is_empty() {
            return Ok(WeeklyTable::filled(&ctx.calendar, &event_defaults(&self.output_schema())));
        }

        let events = bed_day_events(hospital, ctx.patient_id)?;
        let mut specs = vec![StatSpec::new(OCCURRENCE_COLUMN, &[Stat::Sum, Stat::Max])];
        specs.extend(dummy_columns().into_iter().map(|column| StatSpec::new(column, &[Stat::Sum])));
        let mut table = aggregate_events(&events, &ctx.calendar, OCCURRENCE_COLUMN, &specs)?;

        for source in iter::once(OCCURRENCE_COLUMN.to_string()).chain(dummy_columns()) {
            let recency = time_since_last(&table.truthy(&sum_column(&source))?);
            table.insert(recency_column(&source), FeatureDType::Int, recency_values(&recency))?;
        }
        for column in Self::counted_columns() {
            let ever = cumulative(table.values(&column)?, WindowReducer::Sum);
            table.insert(ever_column(&column), FeatureDType::Int, ever)?;
        }
        Ok(table)
    }
}

/// One inpatient stay: consecutive bed days opened by an admission day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BedDayStay {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub bed_days: u32,
    pub leave_days: u32,
    pub max_level: u8,
    pub days_at_level: [u32; 4],
}

impl BedDayStay {
    fn opened(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
            bed_days: 0,
            leave_days: 0,
            max_level: 0,
            days_at_level: [0; 4],
        }
    }

    fn add_day(&mut self, date: NaiveDate, on_leave: bool, level: u8) {
        self.start = self.start.min(date);
        self.end = self.end.max(date);
        self.bed_days += 1;
        self.leave_days += u32::from(on_leave);
        self.max_level = self.max_level.max(level);
        self.days_at_level[usize::from(level - 1)] += 1;
    }
}

fn is_set(table: &RawTable, row: &[String], column: &str) -> bool {
    table.cell(row, column).and_then(parse_number) == Some(1.0)
}

/// Groups bed days into stays in date order. Every admission day opens a
/// new stay; bed days before the first admission belong to none.
pub fn bed_day_stays(table: &RawTable) -> Result<Vec<BedDayStay>, FeatureError> {
    let mut days = table
        .rows()
        .iter()
        .map(|row| {
            Ok((
                event_time(table, row, "date_in_bed")?.date(),
                is_set(table, row, "date_admission"),
                is_set(table, row, "date_leave"),
                observation_level(table.cell(row, "level_of_observation")),
            ))
        })
        .collect::<Result<Vec<_>, FeatureError>>()?;
    days.sort_by_key(|(date, ..)| *date);

    let mut stays: Vec<BedDayStay> = Vec::new();
    for (date, admitted, on_leave, level) in days {
        if admitted {
            stays.push(BedDayStay::opened(date));
        }
        if let Some(stay) = stays.last_mut() {
            stay.add_day(date, on_leave, level);
        }
    }
    Ok(stays)
}

const PERIOD_BED_DAY_COLUMNS: [&str; 4] = [
    "number_of_bed_days",
    "number_of_leave_days",
    "level_of_obs_max",
    "max_length_stay",
];

fn period_bed_day_columns() -> Vec<String> {
    PERIOD_BED_DAY_COLUMNS
        .iter()
        .map(|column| column.to_string())
        .chain(OBSERVATION_LEVELS.iter().map(|level| format!("level_of_obs_{level}")))
        .chain(
            OBSERVATION_LEVELS
                .iter()
                .map(|level| format!("level_of_obs_{level}_number_of_days")),
        )
        .collect()
}

/// Totals over the stays lying wholly inside a crisis period, in
/// `period_bed_day_columns` order. A period with no stays sums to 0.
pub fn bed_days_during_period(period: &CrisisPeriodSummary, stays: &[BedDayStay]) -> Vec<Option<f64>> {
    let (Some(first), Some(last)) = (period.start_monday, period.end_monday) else {
        return vec![Some(0.0); period_bed_day_columns().len()];
    };
    let last = last + ChronoDuration::days(6);
    let inside: Vec<&BedDayStay> = stays
        .iter()
        .filter(|stay| stay.start >= first && stay.end <= last)
        .collect();

    let total = |f: fn(&BedDayStay) -> u32| Some(f64::from(inside.iter().map(|s| f(s)).sum::<u32>()));
    let mut row = vec![
        total(|s| s.bed_days),
        total(|s| s.leave_days),
        Some(f64::from(inside.iter().map(|s| s.max_level).max().unwrap_or(0))),
        Some(f64::from(inside.iter().map(|s| s.bed_days).max().unwrap_or(0))),
    ];
    row.extend(OBSERVATION_LEVELS.iter().map(|level| {
        let idx = usize::from(level - 1);
        let seen = inside.iter().any(|s| s.days_at_level[idx] > 0);
        Some(if seen { 1.0 } else { 0.0 })
    }));
    row.extend(OBSERVATION_LEVELS.iter().map(|level| {
        let idx = usize::from(level - 1);
        Some(f64::from(inside.iter().map(|s| s.days_at_level[idx]).sum::<u32>()))
    }));
    row
}

/// Bed-day totals of the most recent finished crisis period, carried
/// forward.
#[derive(Debug, Clone)]
pub struct LastCrisisBedDaysFeatures {
    weeks_before_new_burst: u32,
}

impl LastCrisisBedDaysFeatures {
    pub const NAME: &'static str = "LastCrisisBedDaysFeatures";

    pub fn new(weeks_before_new_burst: u32) -> Self {
        Self {
            weeks_before_new_burst,
        }
    }
}

impl FeatureFamily for LastCrisisBedDaysFeatures {
    fn name(&self) -> String {
        Self::NAME.to_string()
    }

    fn requirements(&self) -> Vec<TableRequirement> {
        vec![TableRequirement::new(
            HOSPITALIZATION_TABLE,
            &[
                "anonymous_pat_id",
                "date_in_bed",
                "level_of_observation",
                "date_admission",
                "date_leave",
            ],
        )]
    }

    fn output_schema(&self) -> Vec<FeatureColumn> {
        period_bed_day_columns()
            .into_iter()
            .map(|column| FeatureColumn::int(format!("{column}_last_crisis")))
            .collect()
    }

    fn transform(&self, ctx: &PatientContext<'_>) -> Result<WeeklyTable, FeatureError> {
        let segmentation = cached_segmentation(ctx, self.weeks_before_new_burst, Self::NAME)?;
        let stays = bed_day_stays(ctx.table(HOSPITALIZATION_TABLE, Self::NAME)?)?;
        let periods: Vec<(usize, Vec<Option<f64>>)> = summarize_crisis_periods(&ctx.calendar, &segmentation, &[])
            .iter()
            .map(|period| (period.end_week_index, bed_days_during_period(period, &stays)))
            .collect();
        Ok(carry_forward_after_periods(
            &ctx.calendar,
            &self.output_schema(),
            &periods,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crisis::{segment_crises, segmentation_table};
    use crate::families::crises::InCrisisPeriod;
    use crate::families::test_support::{config, patient_tables};

    fn hospital_table() -> RawTable {
        RawTable::from_rows(
            HOSPITALIZATION_TABLE,
            &[
                "anonymous_pat_id",
                "date_in_bed",
                "hospitalization_activity",
                "level_of_observation",
                "date_admission",
                "date_leave",
            ],
            &[
                &["7", "2021-01-06", "Rehab", "", "0", "1"],
                &["7", "2021-01-05", "Rehab", "LEVEL2", "1", "0"],
                &["7", "2021-01-07", "Rehab", "LEVEL3", "0", "0"],
                &["7", "2021-02-10", "PICU", "LEVEL1", "1", "0"],
            ],
        )
        .expect("hospitalization table")
    }

    fn some(raw: &[f64]) -> Vec<Option<f64>> {
        raw.iter().copied().map(Some).collect()
    }

    #[test]
    fn weekly_bed_days_count_activity_and_observation() {
        let config = config();
        let ctx = PatientContext::new(7, patient_tables().with(hospital_table()), &config).expect("context");
        let family = BedDayEventFeatures;
        let table = family
            .transform(&ctx)
            .expect("transform")
            .select(&family.output_schema())
            .expect("schema");

        assert_eq!(
            table.values("hospitalization_sum").expect("sum"),
            some(&[0.0, 3.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0]).as_slice()
        );
        assert_eq!(table.values("hospitalization_max").expect("max")[1], Some(1.0));
        assert_eq!(
            table.values("hospitalization_activity_rehab_sum").expect("rehab")[1],
            Some(3.0)
        );
        assert_eq!(
            table.values("hospitalization_level_of_obs_1_sum").expect("level 1"),
            some(&[0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0]).as_slice()
        );
        assert_eq!(
            table.values("time_since_last_hospitalization").expect("recency"),
            &[
                None,
                Some(0.0),
                Some(1.0),
                Some(2.0),
                Some(3.0),
                Some(4.0),
                Some(0.0),
                Some(1.0),
                Some(2.0)
            ]
        );
        assert_eq!(
            table.values("hospitalization_sum_ever").expect("ever"),
            some(&[0.0, 3.0, 3.0, 3.0, 3.0, 3.0, 4.0, 4.0, 4.0]).as_slice()
        );
        assert!(table
            .values("time_since_last_hospitalization_activity_hdu")
            .expect("hdu recency")
            .iter()
            .all(Option::is_none));
    }

    #[test]
    fn stays_open_on_admission_days() {
        let stays = bed_day_stays(&hospital_table()).expect("stays");
        assert_eq!(stays.len(), 2);
        assert_eq!(stays[0].bed_days, 3);
        assert_eq!(stays[0].leave_days, 1);
        assert_eq!(stays[0].max_level, 3);
        assert_eq!(stays[0].days_at_level, [1, 1, 1, 0]);
        assert_eq!(stays[1].bed_days, 1);

        let headless = RawTable::from_rows(
            HOSPITALIZATION_TABLE,
            &["anonymous_pat_id", "date_in_bed", "date_admission"],
            &[&["7", "2021-01-04", "0"], &["7", "2021-01-05", "1"]],
        )
        .expect("table");
        let stays = bed_day_stays(&headless).expect("stays");
        assert_eq!(stays.len(), 1);
        assert_eq!(stays[0].bed_days, 1);
    }

    #[test]
    fn last_crisis_bed_days_use_cached_periods() {
        let config = config();
        let mut ctx = PatientContext::new(7, patient_tables().with(hospital_table()), &config).expect("context");
        let indicator: Vec<bool> = [0, 1, 1, 0, 0, 0, 1, 0, 0].iter().map(|v| *v == 1).collect();
        let seg = segment_crises(&indicator, &time_since_last(&indicator), 1).expect("segmentation");
        ctx.record_output(
            InCrisisPeriod::name_for(1),
            segmentation_table(&ctx.calendar, &seg).expect("cached"),
        );

        let family = LastCrisisBedDaysFeatures::new(1);
        let table = family
            .transform(&ctx)
            .expect("transform")
            .select(&family.output_schema())
            .expect("schema");

        assert_eq!(
            table.values("number_of_bed_days_last_crisis").expect("bed days"),
            &[None, None, None, Some(3.0), Some(3.0), Some(3.0), Some(3.0), Some(1.0), Some(1.0)]
        );
        assert_eq!(table.values("level_of_obs_max_last_crisis").expect("max")[3], Some(3.0));
        assert_eq!(table.values("level_of_obs_max_last_crisis").expect("max")[7], Some(1.0));
        assert_eq!(table.values("number_of_leave_days_last_crisis").expect("leave")[3], Some(1.0));
        assert_eq!(table.values("level_of_obs_4_last_crisis").expect("level 4")[3], Some(0.0));
        assert_eq!(
            table
                .values("level_of_obs_2_number_of_days_last_crisis")
                .expect("level 2 days")[3],
            Some(1.0)
        );
    }

    #[test]
    fn last_crisis_bed_days_without_stays_are_zero_after_a_period() {
        let config = config();
        let empty = RawTable::new(
            HOSPITALIZATION_TABLE,
            vec!["anonymous_pat_id".to_string(), "date_in_bed".to_string()],
        );
        let mut ctx = PatientContext::new(7, patient_tables().with(empty), &config).expect("context");
        let indicator: Vec<bool> = [1, 0, 0, 0, 0, 0, 0, 0, 0].iter().map(|v| *v == 1).collect();
        let seg = segment_crises(&indicator, &time_since_last(&indicator), 1).expect("segmentation");
        ctx.record_output(
            InCrisisPeriod::name_for(1),
            segmentation_table(&ctx.calendar, &seg).expect("cached"),
        );

        let table = LastCrisisBedDaysFeatures::new(1).transform(&ctx).expect("transform");
        let values = table.values("max_length_stay_last_crisis").expect("stay");
        assert_eq!(values[0], None);
        assert!(values[1..].iter().all(|v| *v == Some(0.0)));
    }
}
