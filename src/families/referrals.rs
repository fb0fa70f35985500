use std::ops::Range;

use crate::config::FeatureConfig;
use crate::events::{aggregate_events, EventRecord, Stat, StatSpec};
use crate::recency::{recency_values, time_since_last, within_last};
use crate::schema::{to_snake_case, RawTable, TableRequirement, PATIENT_TABLE, REFERRAL_TABLE};
use crate::state::{aggregate_state, StateInterval, StateReducer};
use crate::table::{FeatureColumn, FeatureDType, WeeklyTable};
use crate::window::{add_window_features, window_column_names, WindowReducer, WindowSpec};

use super::{
    constant_defaults, event_defaults, event_time, interval_bounds, recency_column, FeatureError, FeatureFamily,
    PatientContext,
};

pub const REFERRAL_DISCHARGE_CATEGORIES: [&str; 8] = [
    "Complete",
    "DNA",
    "Declined",
    "Internal",
    "NoMH",
    "Not Suitable",
    "Other",
    "Security",
];

pub const REFERRAL_SOURCE_CATEGORIES: [&str; 11] = [
    "Acute",
    "Ambulance",
    "Carer",
    "Community",
    "GP",
    "Internal",
    "Local Authority",
    "Mental_Health",
    "Other Agency",
    "Primary Care",
    "Self",
];

const OCCURRENCE_COLUMN: &str = "referral_discharge";
const WITHIN_LAST_WEEKS: [u32; 2] = [4, 8];

fn discharge_column(category: &str) -> String {
    to_snake_case(&format!("referral_event_discharge_category_{category}"))
}

fn source_column(category: &str) -> String {
    to_snake_case(&format!("referral_state_source_category_{category}"))
}

fn discharge_events(referrals: &RawTable, patient_id: i64) -> Result<Vec<EventRecord>, FeatureError> {
    referrals
        .rows()
        .iter()
        .filter(|row| referrals.cell(row, "discharge_date").is_some())
        .map(|row| {
            let mut event = EventRecord::new(patient_id, event_time(referrals, row, "discharge_date")?);
            if let Some(category) = referrals.cell(row, "discharge_category") {
                if REFERRAL_DISCHARGE_CATEGORIES.contains(&category) {
                    event = event.with(discharge_column(category), 1.0);
                }
            }
            Ok(event)
        })
        .collect()
}

/// Weekly referral discharges by discharge category, with recency and
/// look-back windows. Referrals still open are not events.
#[derive(Debug, Clone)]
pub struct ReferralDischargeEventFeatures {
    t_weeks: Vec<u32>,
    retained_offsets: Range<u32>,
}

impl ReferralDischargeEventFeatures {
    pub const NAME: &'static str = "ReferralDischargeEventFeatures";

    pub fn new(config: &FeatureConfig) -> Self {
        Self {
            t_weeks: config.t_weeks.clone(),
            retained_offsets: config.retained_offsets.clone(),
        }
    }

    fn window_specs() -> Vec<WindowSpec> {
        vec![WindowSpec::new("referral_discharge_sum", WindowReducer::Sum)]
    }

    fn flag_columns() -> Vec<String> {
        REFERRAL_DISCHARGE_CATEGORIES
            .iter()
            .map(|category| discharge_column(category))
            .chain(std::iter::once(OCCURRENCE_COLUMN.to_string()))
            .collect()
    }
}

impl FeatureFamily for ReferralDischargeEventFeatures {
    fn name(&self) -> String {
        Self::NAME.to_string()
    }

    fn requirements(&self) -> Vec<TableRequirement> {
        vec![
            TableRequirement::new(PATIENT_TABLE, &["anonymous_pat_id", "first_year_month"]),
            TableRequirement::new(
                REFERRAL_TABLE,
                &["anonymous_pat_id", "referral_date", "discharge_date", "discharge_category"],
            ),
        ]
    }

    fn output_schema(&self) -> Vec<FeatureColumn> {
        let flags = Self::flag_columns();
        let mut columns: Vec<String> = flags.clone();
        columns.push("referral_discharge_sum".to_string());
        columns.extend(flags.iter().map(|column| recency_column(column)));
        columns.extend(
            WITHIN_LAST_WEEKS
                .iter()
                .map(|weeks| format!("referral_discharge_within_last_{weeks}_weeks")),
        );
        columns.extend(window_column_names(
            &Self::window_specs(),
            &self.t_weeks,
            &self.retained_offsets,
        ));
        columns.into_iter().map(FeatureColumn::int).collect()
    }

    fn transform(&self, ctx: &PatientContext<'_>) -> Result<WeeklyTable, FeatureError> {
        let referrals = ctx.table(REFERRAL_TABLE, Self::NAME)?;
        if referrals.is_empty() {
            return Ok(WeeklyTable::filled(&ctx.calendar, &event_defaults(&self.output_schema())));
        }

        let events = discharge_events(referrals, ctx.patient_id)?;
        let mut specs = vec![StatSpec::new(OCCURRENCE_COLUMN, &[Stat::Sum, Stat::Max])];
        specs.extend(
            REFERRAL_DISCHARGE_CATEGORIES
                .iter()
                .map(|category| StatSpec::new(discharge_column(category), &[Stat::Max])),
        );
        let mut table = aggregate_events(&events, &ctx.calendar, OCCURRENCE_COLUMN, &specs)?;
        for column in Self::flag_columns() {
            table.rename(&format!("{column}_max"), &column)?;
        }

        for column in Self::flag_columns() {
            let recency = time_since_last(&table.truthy(&column)?);
            table.insert(recency_column(&column), FeatureDType::Int, recency_values(&recency))?;
        }
        let discharge_recency = time_since_last(&table.truthy(OCCURRENCE_COLUMN)?);
        for weeks in WITHIN_LAST_WEEKS {
            table.insert(
                format!("referral_discharge_within_last_{weeks}_weeks"),
                FeatureDType::Int,
                within_last(&discharge_recency, weeks),
            )?;
        }
        add_window_features(&mut table, &Self::window_specs(), &self.t_weeks, &self.retained_offsets)?;
        Ok(table)
    }
}

/// Open referrals per week, one flag per referral source.
#[derive(Debug, Clone, Default)]
pub struct ReferralStateFeatures;

impl ReferralStateFeatures {
    pub const NAME: &'static str = "ReferralStateFeatures";

    fn columns() -> Vec<String> {
        REFERRAL_SOURCE_CATEGORIES
            .iter()
            .map(|category| source_column(category))
            .collect()
    }
}

impl FeatureFamily for ReferralStateFeatures {
    fn name(&self) -> String {
        Self::NAME.to_string()
    }

    fn requirements(&self) -> Vec<TableRequirement> {
        vec![
            TableRequirement::new(PATIENT_TABLE, &["anonymous_pat_id", "first_year_month"]),
            TableRequirement::new(
                REFERRAL_TABLE,
                &["anonymous_pat_id", "referral_date", "discharge_date", "source_category"],
            ),
        ]
    }

    fn output_schema(&self) -> Vec<FeatureColumn> {
        Self::columns().into_iter().map(FeatureColumn::int).collect()
    }

    fn transform(&self, ctx: &PatientContext<'_>) -> Result<WeeklyTable, FeatureError> {
        let referrals = ctx.table(REFERRAL_TABLE, Self::NAME)?;
        if referrals.is_empty() {
            return Ok(WeeklyTable::filled(
                &ctx.calendar,
                &constant_defaults(&self.output_schema(), Some(0.0)),
            ));
        }

        let intervals = referrals
            .rows()
            .iter()
            .map(|row| {
                let (start, end) =
                    interval_bounds(referrals, row, "referral_date", "discharge_date", ctx.config.end_date)?;
                let source = referrals.cell(row, "source_category");
                Ok(REFERRAL_SOURCE_CATEGORIES
                    .iter()
                    .fold(StateInterval::new(ctx.patient_id, start, end), |interval, category| {
                        interval.with(
                            source_column(category),
                            Some(if source == Some(*category) { 1.0 } else { 0.0 }),
                        )
                    }))
            })
            .collect::<Result<Vec<_>, FeatureError>>()?;
        let columns = Self::columns();
        let mut table = aggregate_state(
            &intervals,
            &ctx.calendar,
            ctx.config.end_date,
            &columns,
            StateReducer::Max,
        )?;
        for column in &columns {
            table.map_column(column, |value| value.or(Some(0.0)))?;
        }
        Ok(table)
    }
}
