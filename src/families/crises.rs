use std::ops::Range;

use crate::config::FeatureConfig;
use crate::crisis::{
    burst_column, crisis_in_n_weeks, during_crisis_features, during_crisis_schema, label_column,
    last_crisis_features, last_crisis_schema, segment_crisis_table, segmentation_from_table,
    segmentation_schema, segmentation_table, summarize_crisis_periods, CrisisSegmentation,
    CRISIS_INDICATOR_COLUMN, CRISIS_RECENCY_COLUMN, SEVERITY_ATTRIBUTE,
};
use crate::events::{aggregate_events, EventRecord, Stat, StatSpec};
use crate::recency::{recency_values, time_since_last, within_last};
use crate::schema::{to_snake_case, RawTable, TableRequirement, CRISIS_TABLE, PATIENT_TABLE};
use crate::table::{FeatureColumn, FeatureDType, WeeklyTable};
use crate::window::{add_window_features, window_column_names, WindowReducer, WindowSpec};

use super::{event_defaults, event_time, optional_number, FeatureError, FeatureFamily, PatientContext};

const OCCURRENCE_COLUMN: &str = "crisis";
const TYPE_CODES: [&str; 4] = ["TR", "BM", "IP", "OOA"];
const CONTACT_METHODS: [&str; 8] = [
    "Contact",
    "BM_BedMngmnt_Day",
    "IP_BedDay",
    "ST",
    "BM_PDU_Day",
    "BM_PoS_Day",
    "OOA",
    "RNC",
];
const WITHIN_LAST_WEEKS: [u32; 2] = [4, 8];

/// (source column, category, raw dummy column) for every crisis dummy.
fn dummy_columns() -> Vec<(&'static str, &'static str, String)> {
    let types = TYPE_CODES
        .iter()
        .map(|code| ("crisis_type", *code, format!("crisis_type_{code}")));
    let methods = CONTACT_METHODS.iter().map(|method| {
        (
            "crisis_contact_allocation",
            *method,
            format!("crisis_contact_allocation_{method}"),
        )
    });
    types.chain(methods).collect()
}

fn crisis_events(crisis: &RawTable, patient_id: i64) -> Result<Vec<EventRecord>, FeatureError> {
    let dummies = dummy_columns();
    crisis
        .rows()
        .iter()
        .map(|row| {
            let mut event = EventRecord::new(patient_id, event_time(crisis, row, "event_date")?);
            if let Some(severity) = optional_number(crisis, row, SEVERITY_ATTRIBUTE) {
                event = event.with(SEVERITY_ATTRIBUTE, severity);
            }
            for (source, category, column) in &dummies {
                if crisis.cell(row, source) == Some(*category) {
                    event = event.with(column.clone(), 1.0);
                }
            }
            Ok(event)
        })
        .collect()
}

fn window_dtype(column: &str) -> FeatureDType {
    if column.starts_with(SEVERITY_ATTRIBUTE) {
        FeatureDType::Float
    } else {
        FeatureDType::Int
    }
}

/// Weekly crisis counts, severity, type and allocation dummies, recency and
/// look-back windows.
#[derive(Debug, Clone)]
pub struct CrisisEventFeatures {
    t_weeks: Vec<u32>,
    retained_offsets: Range<u32>,
}

impl CrisisEventFeatures {
    pub const NAME: &'static str = "CrisisEventFeatures";

    pub fn new(config: &FeatureConfig) -> Self {
        Self {
            t_weeks: config.t_weeks.clone(),
            retained_offsets: config.retained_offsets.clone(),
        }
    }

    fn window_specs() -> Vec<WindowSpec> {
        vec![
            WindowSpec::new("crisis_sum", WindowReducer::Sum),
            WindowSpec::new("severity_max", WindowReducer::Max),
        ]
    }
}

impl FeatureFamily for CrisisEventFeatures {
    fn name(&self) -> String {
        Self::NAME.to_string()
    }

    fn requirements(&self) -> Vec<TableRequirement> {
        vec![
            TableRequirement::new(PATIENT_TABLE, &["anonymous_pat_id", "first_year_month"]),
            TableRequirement::new(
                CRISIS_TABLE,
                &[
                    "anonymous_pat_id",
                    "event_date",
                    "crisis_type",
                    "crisis_contact_allocation",
                    SEVERITY_ATTRIBUTE,
                ],
            ),
        ]
    }

    fn output_schema(&self) -> Vec<FeatureColumn> {
        let mut schema: Vec<FeatureColumn> = dummy_columns()
            .iter()
            .map(|(_, _, column)| FeatureColumn::int(to_snake_case(&format!("{column}_max"))))
            .collect();
        schema.extend([
            FeatureColumn::int(CRISIS_INDICATOR_COLUMN),
            FeatureColumn::int("crisis_min"),
            FeatureColumn::int("crisis_sum"),
            FeatureColumn::float("severity_max"),
            FeatureColumn::int(CRISIS_RECENCY_COLUMN),
        ]);
        schema.extend(
            WITHIN_LAST_WEEKS
                .iter()
                .map(|weeks| FeatureColumn::int(format!("crisis_within_last_{weeks}_weeks"))),
        );
        schema.extend(
            window_column_names(&Self::window_specs(), &self.t_weeks, &self.retained_offsets)
                .into_iter()
                .map(|name| FeatureColumn {
                    dtype: window_dtype(&name),
                    name,
                }),
        );
        schema
    }

    fn transform(&self, ctx: &PatientContext<'_>) -> Result<WeeklyTable, FeatureError> {
        let crisis = ctx.table(CRISIS_TABLE, Self::NAME)?;
        if crisis.is_empty() {
            return Ok(WeeklyTable::filled(&ctx.calendar, &event_defaults(&self.output_schema())));
        }

        let events = crisis_events(crisis, ctx.patient_id)?;
        let mut specs = vec![
            StatSpec::new(OCCURRENCE_COLUMN, &[Stat::Sum, Stat::Min, Stat::Max]),
            StatSpec::new(SEVERITY_ATTRIBUTE, &[Stat::Max]),
        ];
        specs.extend(
            dummy_columns()
                .into_iter()
                .map(|(_, _, column)| StatSpec::new(column, &[Stat::Max])),
        );

        let mut table = aggregate_events(&events, &ctx.calendar, OCCURRENCE_COLUMN, &specs)?;
        let names: Vec<String> = table.column_names().iter().map(|name| name.to_string()).collect();
        for name in names {
            table.rename(&name, &to_snake_case(&name))?;
        }

        let recency = time_since_last(&table.truthy(CRISIS_INDICATOR_COLUMN)?);
        table.insert(CRISIS_RECENCY_COLUMN, FeatureDType::Int, recency_values(&recency))?;
        add_window_features(&mut table, &Self::window_specs(), &self.t_weeks, &self.retained_offsets)?;
        for weeks in WITHIN_LAST_WEEKS {
            table.insert(
                format!("crisis_within_last_{weeks}_weeks"),
                FeatureDType::Int,
                within_last(&recency, weeks),
            )?;
        }
        Ok(table)
    }
}

/// Burst and crisis-period columns for one `weeks_before_new_burst`
/// threshold, derived from the crisis event features.
#[derive(Debug, Clone)]
pub struct InCrisisPeriod {
    weeks_before_new_burst: u32,
}

impl InCrisisPeriod {
    pub fn new(weeks_before_new_burst: u32) -> Self {
        Self {
            weeks_before_new_burst,
        }
    }

    pub fn name_for(weeks_before_new_burst: u32) -> String {
        format!("InCrisisPeriod{weeks_before_new_burst}Week")
    }
}

impl FeatureFamily for InCrisisPeriod {
    fn name(&self) -> String {
        Self::name_for(self.weeks_before_new_burst)
    }

    fn requirements(&self) -> Vec<TableRequirement> {
        Vec::new()
    }

    fn output_schema(&self) -> Vec<FeatureColumn> {
        segmentation_schema(self.weeks_before_new_burst)
    }

    fn transform(&self, ctx: &PatientContext<'_>) -> Result<WeeklyTable, FeatureError> {
        let crisis = ctx.output(CrisisEventFeatures::NAME, &self.name())?;
        let segmentation = segment_crisis_table(crisis, self.weeks_before_new_burst)?;
        Ok(segmentation_table(&ctx.calendar, &segmentation)?)
    }
}

/// Target label: a burst starts within the next `horizon_weeks` weeks.
#[derive(Debug, Clone)]
pub struct CrisisInNWeeks {
    horizon_weeks: u32,
    weeks_before_new_burst: u32,
}

impl CrisisInNWeeks {
    pub fn new(horizon_weeks: u32, weeks_before_new_burst: u32) -> Self {
        Self {
            horizon_weeks,
            weeks_before_new_burst,
        }
    }
}

impl FeatureFamily for CrisisInNWeeks {
    fn name(&self) -> String {
        "CrisisInNWeeks".to_string()
    }

    fn requirements(&self) -> Vec<TableRequirement> {
        Vec::new()
    }

    fn output_schema(&self) -> Vec<FeatureColumn> {
        vec![FeatureColumn::float(label_column(self.horizon_weeks))]
    }

    fn transform(&self, ctx: &PatientContext<'_>) -> Result<WeeklyTable, FeatureError> {
        let periods = ctx.output(&InCrisisPeriod::name_for(self.weeks_before_new_burst), &self.name())?;
        let starts = periods.indicator(&burst_column(self.weeks_before_new_burst))?;

        let mut table = WeeklyTable::new(&ctx.calendar);
        table.insert(
            label_column(self.horizon_weeks),
            FeatureDType::Float,
            crisis_in_n_weeks(&starts, self.horizon_weeks),
        )?;
        Ok(table)
    }
}

/// Segmentation cached by the `InCrisisPeriod` family for `weeks_before_new_burst`.
pub(crate) fn cached_segmentation(
    ctx: &PatientContext<'_>,
    weeks_before_new_burst: u32,
    consumer: &str,
) -> Result<CrisisSegmentation, FeatureError> {
    let periods = ctx.output(&InCrisisPeriod::name_for(weeks_before_new_burst), consumer)?;
    Ok(segmentation_from_table(periods, weeks_before_new_burst)?)
}

fn crisis_requirement() -> TableRequirement {
    TableRequirement::new(CRISIS_TABLE, &["anonymous_pat_id", "event_date", SEVERITY_ATTRIBUTE])
}

/// Running crisis counts, crisis days and severity of the period a week
/// belongs to.
#[derive(Debug, Clone)]
pub struct DuringCrisisFeatures {
    weeks_before_new_burst: u32,
}

impl DuringCrisisFeatures {
    pub const NAME: &'static str = "DuringCrisisFeatures";

    pub fn new(weeks_before_new_burst: u32) -> Self {
        Self {
            weeks_before_new_burst,
        }
    }
}

impl FeatureFamily for DuringCrisisFeatures {
    fn name(&self) -> String {
        Self::NAME.to_string()
    }

    fn requirements(&self) -> Vec<TableRequirement> {
        vec![crisis_requirement()]
    }

    fn output_schema(&self) -> Vec<FeatureColumn> {
        during_crisis_schema()
    }

    fn transform(&self, ctx: &PatientContext<'_>) -> Result<WeeklyTable, FeatureError> {
        let segmentation = cached_segmentation(ctx, self.weeks_before_new_burst, Self::NAME)?;
        let events = crisis_events(ctx.table(CRISIS_TABLE, Self::NAME)?, ctx.patient_id)?;
        Ok(during_crisis_features(&ctx.calendar, &segmentation, &events)?)
    }
}

/// Summary of the most recent finished crisis period, carried forward.
#[derive(Debug, Clone)]
pub struct LastCrisisFeatures {
    weeks_before_new_burst: u32,
}

impl LastCrisisFeatures {
    pub const NAME: &'static str = "LastCrisisFeatures";

    pub fn new(weeks_before_new_burst: u32) -> Self {
        Self {
            weeks_before_new_burst,
        }
    }
}

impl FeatureFamily for LastCrisisFeatures {
    fn name(&self) -> String {
        Self::NAME.to_string()
    }

    fn requirements(&self) -> Vec<TableRequirement> {
        vec![crisis_requirement()]
    }

    fn output_schema(&self) -> Vec<FeatureColumn> {
        last_crisis_schema()
    }

    fn transform(&self, ctx: &PatientContext<'_>) -> Result<WeeklyTable, FeatureError> {
        let segmentation = cached_segmentation(ctx, self.weeks_before_new_burst, Self::NAME)?;
        let events = crisis_events(ctx.table(CRISIS_TABLE, Self::NAME)?, ctx.patient_id)?;
        let summaries = summarize_crisis_periods(&ctx.calendar, &segmentation, &events);
        Ok(last_crisis_features(&ctx.calendar, &summaries)?)
    }
}
