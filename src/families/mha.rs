use crate::schema::{parse_number, RawTable, TableRequirement, MHA_TABLE, PATIENT_TABLE};
use crate::state::{aggregate_state, StateInterval, StateReducer};
use crate::table::{FeatureColumn, WeeklyTable};

use super::{constant_defaults, interval_bounds, FeatureError, FeatureFamily, PatientContext};

const CTO_STATUSES: [(&str, &str); 3] = [
    ("Active", "cto_status_active"),
    ("Not applicable", "cto_status_not_applicable"),
    ("Recalled", "cto_status_recalled"),
];

fn flag(raw: &str) -> Option<f64> {
    match raw.to_ascii_lowercase().as_str() {
        "y" | "yes" | "true" => Some(1.0),
        "n" | "no" | "false" => Some(0.0),
        _ => parse_number(raw),
    }
}

fn episode_interval(
    mha: &RawTable,
    row: &[String],
    ctx: &PatientContext<'_>,
) -> Result<StateInterval, FeatureError> {
    let (start, end) = interval_bounds(mha, row, "start_date_time", "end_date_time", ctx.config.end_date)?;
    let section = mha.cell(row, "mha_section_code");
    let status = mha.cell(row, "cto_status");

    let mut interval = StateInterval::new(ctx.patient_id, start, end)
        .with(
            "on_conditional_discharge",
            mha.cell(row, "on_conditional_discharge").and_then(flag),
        )
        .with(
            "mha_section_code",
            Some(if section == Some("Inf") { 0.0 } else { 1.0 }),
        );
    for (category, column) in CTO_STATUSES {
        interval = interval.with(column, Some(if status == Some(category) { 1.0 } else { 0.0 }));
    }
    Ok(interval)
}

/// Mental Health Act episode state per week: conditional discharge,
/// detention under a non-informal section and community treatment order
/// status.
#[derive(Debug, Clone, Default)]
pub struct MhaEpisodeStateFeatures;

impl MhaEpisodeStateFeatures {
    pub const NAME: &'static str = "MhaEpisodeStateFeatures";

    fn columns() -> Vec<String> {
        ["on_conditional_discharge", "mha_section_code"]
            .into_iter()
            .chain(CTO_STATUSES.iter().map(|(_, column)| *column))
            .map(String::from)
            .collect()
    }
}

impl FeatureFamily for MhaEpisodeStateFeatures {
    fn name(&self) -> String {
        Self::NAME.to_string()
    }

    fn requirements(&self) -> Vec<TableRequirement> {
        vec![
            TableRequirement::new(PATIENT_TABLE, &["anonymous_pat_id", "first_year_month"]),
            TableRequirement::new(
                MHA_TABLE,
                &[
                    "anonymous_pat_id",
                    "start_date_time",
                    "end_date_time",
                    "cto_status",
                    "on_conditional_discharge",
                    "mha_section_code",
                ],
            ),
        ]
    }

    fn output_schema(&self) -> Vec<FeatureColumn> {
        Self::columns().into_iter().map(FeatureColumn::int).collect()
    }

    fn transform(&self, ctx: &PatientContext<'_>) -> Result<WeeklyTable, FeatureError> {
        let mha = ctx.table(MHA_TABLE, Self::NAME)?;
        if mha.is_empty() {
            return Ok(WeeklyTable::filled(
                &ctx.calendar,
                &constant_defaults(&self.output_schema(), Some(0.0)),
            ));
        }

        let intervals = mha
            .rows()
            .iter()
            .map(|row| episode_interval(mha, row, ctx))
            .collect::<Result<Vec<_>, _>>()?;
        let columns = Self::columns();
        let mut table = aggregate_state(
            &intervals,
            &ctx.calendar,
            ctx.config.end_date,
            &columns,
            StateReducer::Last,
        )?;
        for column in &columns {
            table.map_column(column, |value| value.or(Some(0.0)))?;
        }
        Ok(table)
    }
}
