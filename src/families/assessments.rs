use crate::events::{aggregate_events, EventRecord, Stat, StatSpec};
use crate::recency::{recency_values, time_since_last};
use crate::schema::{RawTable, TableRequirement, PATIENT_TABLE, RISK_TABLE, WELLBEING_TABLE};
use crate::state::{aggregate_state, StateInterval, StateReducer};
use crate::table::{FeatureColumn, FeatureDType, WeeklyTable};

use super::{
    constant_defaults, event_time, interval_bounds, optional_number, recency_column, FeatureError, FeatureFamily,
    PatientContext,
};

pub const RISK_COLUMNS: [&str; 11] = [
    "risk_suicide",
    "risk_substance_misuse",
    "risk_self_neglect",
    "risk_forensic_care",
    "risk_self_harm",
    "risk_to_children",
    "risk_of_absconding",
    "risk_med_phys",
    "risk_of_violence",
    "risk_of_accident",
    "risk_of_harm_from_others",
];

pub const WELLBEING_COLUMNS: [&str; 5] = [
    "wellbeing_emotional",
    "wellbeing_four_factor_total",
    "wellbeing_personal",
    "wellbeing_severe_disturbance",
    "wellbeing_social",
];

const RISK_OCCURRENCE_COLUMN: &str = "risk";
const RISK_ASSESSMENT_COLUMN: &str = "risk_assessment";
const NOT_UP_TO_DATE_COLUMN: &str = "risk_assessment_not_up_to_date";

fn risk_flag(raw: &str) -> Option<f64> {
    match raw {
        "Y" | "DN" => Some(1.0),
        "N" => Some(0.0),
        _ => None,
    }
}

fn risk_events(risk: &RawTable, patient_id: i64) -> Result<Vec<EventRecord>, FeatureError> {
    risk.rows()
        .iter()
        .map(|row| {
            let mut event = EventRecord::new(patient_id, event_time(risk, row, "screening_datetime")?);
            for column in RISK_COLUMNS {
                if let Some(flag) = risk.cell(row, column).and_then(risk_flag) {
                    event = event.with(column, flag);
                }
            }
            Ok(event)
        })
        .collect()
}

/// Weekly risk screening flags. Screenings older than the stale threshold
/// no longer count: their flags become missing.
#[derive(Debug, Clone)]
pub struct RiskAssessmentEventFeature {
    stale_after_weeks: u32,
}

impl RiskAssessmentEventFeature {
    pub const NAME: &'static str = "RiskAssessmentEventFeature";

    pub fn new(stale_after_weeks: u32) -> Self {
        Self { stale_after_weeks }
    }

    fn value_columns() -> impl Iterator<Item = &'static str> {
        RISK_COLUMNS.into_iter().chain([RISK_ASSESSMENT_COLUMN])
    }

    fn empty_defaults(&self) -> Vec<(FeatureColumn, Option<f64>)> {
        self.output_schema()
            .into_iter()
            .map(|column| {
                let value = match column.name.as_str() {
                    RISK_ASSESSMENT_COLUMN => Some(0.0),
                    NOT_UP_TO_DATE_COLUMN => Some(1.0),
                    _ => None,
                };
                (column, value)
            })
            .collect()
    }
}

impl FeatureFamily for RiskAssessmentEventFeature {
    fn name(&self) -> String {
        Self::NAME.to_string()
    }

    fn requirements(&self) -> Vec<TableRequirement> {
        vec![
            TableRequirement::new(PATIENT_TABLE, &["anonymous_pat_id", "first_year_month"]),
            TableRequirement::new(RISK_TABLE, &["anonymous_pat_id", "screening_datetime"]),
        ]
    }

    fn output_schema(&self) -> Vec<FeatureColumn> {
        let mut schema: Vec<FeatureColumn> = Self::value_columns().map(FeatureColumn::int).collect();
        schema.extend(Self::value_columns().map(|column| FeatureColumn::int(recency_column(column))));
        schema.push(FeatureColumn::int(NOT_UP_TO_DATE_COLUMN));
        schema
    }

    fn transform(&self, ctx: &PatientContext<'_>) -> Result<WeeklyTable, FeatureError> {
        let risk = ctx.table(RISK_TABLE, Self::NAME)?;
        if risk.is_empty() {
            return Ok(WeeklyTable::filled(&ctx.calendar, &self.empty_defaults()));
        }

        let events = risk_events(risk, ctx.patient_id)?;
        let specs: Vec<StatSpec> = RISK_COLUMNS
            .into_iter()
            .chain([RISK_OCCURRENCE_COLUMN])
            .map(|column| StatSpec::new(column, &[Stat::Max]))
            .collect();
        let mut table = aggregate_events(&events, &ctx.calendar, RISK_OCCURRENCE_COLUMN, &specs)?;
        for column in RISK_COLUMNS {
            table.rename(&format!("{column}_max"), column)?;
        }
        table.rename(&format!("{RISK_OCCURRENCE_COLUMN}_max"), RISK_ASSESSMENT_COLUMN)?;

        for column in Self::value_columns() {
            let recency = time_since_last(&table.truthy(column)?);
            table.insert(recency_column(column), FeatureDType::Int, recency_values(&recency))?;
        }

        let stale_after = f64::from(self.stale_after_weeks);
        let stale: Vec<bool> = table
            .values(&recency_column(RISK_ASSESSMENT_COLUMN))?
            .iter()
            .map(|weeks| !matches!(weeks, Some(w) if *w < stale_after))
            .collect();
        table.insert_flags(NOT_UP_TO_DATE_COLUMN, &stale)?;

        for column in RISK_COLUMNS {
            mask_stale(&mut table, column, &stale, None)?;
        }
        mask_stale(&mut table, RISK_ASSESSMENT_COLUMN, &stale, Some(0.0))?;
        Ok(table)
    }
}

fn mask_stale(
    table: &mut WeeklyTable,
    column: &str,
    stale: &[bool],
    replacement: Option<f64>,
) -> Result<(), FeatureError> {
    let values: Vec<Option<f64>> = table
        .values(column)?
        .iter()
        .zip(stale)
        .map(|(value, is_stale)| if *is_stale { replacement } else { *value })
        .collect();
    table.insert(column, FeatureDType::Int, values)?;
    Ok(())
}

/// Wellbeing scores of the review period covering each week. Weeks outside
/// every review period stay missing.
#[derive(Debug, Clone, Default)]
pub struct WellbeingAssessmentStateFeature;

impl WellbeingAssessmentStateFeature {
    pub const NAME: &'static str = "WellbeingAssessmentStateFeature";
}

impl FeatureFamily for WellbeingAssessmentStateFeature {
    fn name(&self) -> String {
        Self::NAME.to_string()
    }

    fn requirements(&self) -> Vec<TableRequirement> {
        vec![
            TableRequirement::new(PATIENT_TABLE, &["anonymous_pat_id", "first_year_month"]),
            TableRequirement::new(
                WELLBEING_TABLE,
                &[
                    "anonymous_pat_id",
                    "review_period_start_date",
                    "review_period_end_date",
                ],
            ),
        ]
    }

    fn output_schema(&self) -> Vec<FeatureColumn> {
        WELLBEING_COLUMNS.into_iter().map(FeatureColumn::float).collect()
    }

    fn transform(&self, ctx: &PatientContext<'_>) -> Result<WeeklyTable, FeatureError> {
        let wellbeing = ctx.table(WELLBEING_TABLE, Self::NAME)?;
        if wellbeing.is_empty() {
            return Ok(WeeklyTable::filled(
                &ctx.calendar,
                &constant_defaults(&self.output_schema(), None),
            ));
        }

        let mut intervals = Vec::with_capacity(wellbeing.len());
        for row in wellbeing.rows() {
            let (start, end) = interval_bounds(
                wellbeing,
                row,
                "review_period_start_date",
                "review_period_end_date",
                ctx.config.end_date,
            )?;
            let mut interval = StateInterval::new(ctx.patient_id, start, end);
            for column in WELLBEING_COLUMNS {
                interval = interval.with(column, optional_number(wellbeing, row, column));
            }
            intervals.push(interval);
        }
        intervals.sort_by_key(|interval| (interval.start, interval.end));

        let columns: Vec<String> = WELLBEING_COLUMNS.iter().map(|c| c.to_string()).collect();
        Ok(aggregate_state(
            &intervals,
            &ctx.calendar,
            ctx.config.end_date,
            &columns,
            StateReducer::Last,
        )?)
    }
}
