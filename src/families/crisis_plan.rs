use crate::events::{aggregate_events, EventRecord, Stat, StatSpec};
use crate::recency::{recency_values, time_since_last, within_last};
use crate::schema::{TableRequirement, CRISIS_PLAN_TABLE, PATIENT_TABLE};
use crate::table::{FeatureColumn, FeatureDType, WeeklyTable};

use super::{event_defaults, event_time, recency_column, FeatureError, FeatureFamily, PatientContext};

/// A plan updated within this many weeks counts as up to date.
pub const CRISIS_PLAN_CURRENT_WEEKS: u32 = 52;

const OCCURRENCE_COLUMN: &str = "crisis_plan_update";
const UP_TO_DATE_COLUMN: &str = "crisis_plan_up_to_date";

/// Weekly crisis plan updates and whether the plan is still current.
#[derive(Debug, Clone, Default)]
pub struct CrisisPlanEventFeatures;

impl CrisisPlanEventFeatures {
    pub const NAME: &'static str = "CrisisPlanEventFeatures";
}

impl FeatureFamily for CrisisPlanEventFeatures {
    fn name(&self) -> String {
        Self::NAME.to_string()
    }

    fn requirements(&self) -> Vec<TableRequirement> {
        vec![
            TableRequirement::new(PATIENT_TABLE, &["anonymous_pat_id", "first_year_month"]),
            TableRequirement::new(CRISIS_PLAN_TABLE, &["anonymous_pat_id", "plan_updated_date"]),
        ]
    }

    fn output_schema(&self) -> Vec<FeatureColumn> {
        [
            OCCURRENCE_COLUMN.to_string(),
            recency_column(OCCURRENCE_COLUMN),
            UP_TO_DATE_COLUMN.to_string(),
        ]
        .into_iter()
        .map(FeatureColumn::int)
        .collect()
    }

    fn transform(&self, ctx: &PatientContext<'_>) -> Result<WeeklyTable, FeatureError> {
        let plans = ctx.table(CRISIS_PLAN_TABLE, Self::NAME)?;
        if plans.is_empty() {
            return Ok(WeeklyTable::filled(&ctx.calendar, &event_defaults(&self.output_schema())));
        }

        let events = plans
            .rows()
            .iter()
            .map(|row| Ok(EventRecord::new(ctx.patient_id, event_time(plans, row, "plan_updated_date")?)))
            .collect::<Result<Vec<_>, FeatureError>>()?;
        let mut table = aggregate_events(
            &events,
            &ctx.calendar,
            OCCURRENCE_COLUMN,
            &[StatSpec::new(OCCURRENCE_COLUMN, &[Stat::Max])],
        )?;
        table.rename(&format!("{OCCURRENCE_COLUMN}_max"), OCCURRENCE_COLUMN)?;

        let recency = time_since_last(&table.truthy(OCCURRENCE_COLUMN)?);
        table.insert(
            recency_column(OCCURRENCE_COLUMN),
            FeatureDType::Int,
            recency_values(&recency),
        )?;
        table.insert(
            UP_TO_DATE_COLUMN,
            FeatureDType::Int,
            within_last(&recency, CRISIS_PLAN_CURRENT_WEEKS),
        )?;
        Ok(table)
    }
}
