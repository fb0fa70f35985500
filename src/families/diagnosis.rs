use crate::schema::{TableRequirement, DIAGNOSIS_TABLE, PATIENT_TABLE};
use crate::state::{aggregate_state, StateInterval, StateReducer};
use crate::table::{FeatureColumn, FeatureDType, WeeklyTable};

use super::{constant_defaults, interval_bounds, optional_number, FeatureError, FeatureFamily, PatientContext};

pub const GRANULAR_CATEGORIES: [&str; 59] = [
    "dementia",
    "amnesia",
    "delirium",
    "hallucinations",
    "catatonic",
    "schizophrenia",
    "affective",
    "anxiety",
    "dissociative",
    "borderline",
    "other_organic",
    "personality",
    "alcohol",
    "substance_other",
    "delusional",
    "bipolar",
    "depression",
    "psychotic",
    "mania",
    "mood_other",
    "obsessive",
    "stress",
    "somatoform",
    "other_neurotic",
    "eating",
    "sleep",
    "sexual_dysfunction",
    "other_behaviour",
    "paranoid",
    "other_personality",
    "impulsive",
    "gender",
    "sexual",
    "factitious",
    "intellectual_disabilities",
    "development",
    "adhd",
    "conduct",
    "tic",
    "other",
    "infectious",
    "neoplasm",
    "nutritional",
    "nervous_system",
    "eye_ear",
    "circulatory",
    "respiratory",
    "digestive",
    "skin",
    "musculoskeletal",
    "genitals",
    "pregnancy",
    "congenital",
    "abnormal",
    "injury",
    "self_harm",
    "assaulted",
    "drugs",
    "other_assessments",
];

pub const BROAD_CATEGORIES: [&str; 12] = [
    "physiological",
    "substance_misuse",
    "psychotic",
    "mood",
    "anxiety_stress",
    "behaviour",
    "personality",
    "gender",
    "intellectual_disabilities",
    "pervasive",
    "other",
    "non_psychological",
];

const SUBSTANCE_MISUSE_COLUMN: &str = "current_diagnosis_broad_substance_misuse";
const CURRENT_DUAL_COLUMN: &str = "current_dual_diagnosis";
const EVER_DUAL_COLUMN: &str = "ever_dual_diagnosis";

fn granular_columns() -> impl Iterator<Item = String> {
    GRANULAR_CATEGORIES
        .iter()
        .map(|category| format!("diagnosis_granular_{category}"))
}

fn broad_columns() -> impl Iterator<Item = String> {
    BROAD_CATEGORIES
        .iter()
        .map(|category| format!("diagnosis_broad_{category}"))
}

fn state_columns() -> Vec<String> {
    granular_columns().chain(broad_columns()).collect()
}

fn current_column(column: &str) -> String {
    format!("current_{column}")
}

fn ever_column(column: &str) -> String {
    format!("ever_{}", column.replace("diagnosis", "diagnosed"))
}

/// Carries the last non-zero value forward; 0 until the first one.
fn sticky(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut last = None;
    values
        .iter()
        .map(|value| {
            if let Some(v) = value.filter(|v| *v != 0.0) {
                last = Some(v);
            }
            Some(last.unwrap_or(0.0))
        })
        .collect()
}

fn row_sums(table: &WeeklyTable, columns: &[String]) -> Result<Vec<Option<f64>>, FeatureError> {
    let mut sums = vec![0.0; table.len()];
    for column in columns {
        for (sum, value) in sums.iter_mut().zip(table.values(column)?) {
            *sum += value.unwrap_or(0.0);
        }
    }
    Ok(sums.into_iter().map(Some).collect())
}

/// Current and ever-held diagnosis categories per week, with category
/// counts and dual diagnosis flags.
#[derive(Debug, Clone, Default)]
pub struct DiagnosisStateFeatures;

impl DiagnosisStateFeatures {
    pub const NAME: &'static str = "DiagnosisStateFeatures";

    fn summary_columns() -> [&'static str; 6] {
        [
            "number_of_current_broad_diagnosis",
            "number_of_current_granular_diagnosis",
            CURRENT_DUAL_COLUMN,
            EVER_DUAL_COLUMN,
            "number_of_ever_broad_diagnosis",
            "number_of_ever_granular_diagnosis",
        ]
    }

    fn add_current_summaries(table: &mut WeeklyTable) -> Result<(), FeatureError> {
        let current_broad: Vec<String> = broad_columns().map(|c| current_column(&c)).collect();
        let current_granular: Vec<String> = granular_columns().map(|c| current_column(&c)).collect();
        let broad_counts = row_sums(table, &current_broad)?;
        let granular_counts = row_sums(table, &current_granular)?;
        table.insert("number_of_current_broad_diagnosis", FeatureDType::Int, broad_counts)?;
        table.insert("number_of_current_granular_diagnosis", FeatureDType::Int, granular_counts)?;

        let psychological: Vec<String> = current_broad
            .into_iter()
            .filter(|column| !column.contains("non_psycho"))
            .collect();
        let psychological_counts = row_sums(table, &psychological)?;
        let substance_misuse = table.values(SUBSTANCE_MISUSE_COLUMN)?;
        let dual: Vec<bool> = psychological_counts
            .iter()
            .zip(substance_misuse)
            .map(|(count, substance)| count.unwrap_or(0.0) >= 2.0 && *substance == Some(1.0))
            .collect();
        table.insert_flags(CURRENT_DUAL_COLUMN, &dual)?;
        Ok(())
    }

    fn add_ever_summaries(table: &mut WeeklyTable) -> Result<(), FeatureError> {
        let dual = sticky(table.values(CURRENT_DUAL_COLUMN)?);
        table.insert(EVER_DUAL_COLUMN, FeatureDType::Int, dual)?;
        for column in state_columns() {
            let ever = sticky(table.values(&current_column(&column))?);
            table.insert(ever_column(&column), FeatureDType::Int, ever)?;
        }

        let ever_broad: Vec<String> = broad_columns().map(|c| ever_column(&c)).collect();
        let ever_granular: Vec<String> = granular_columns().map(|c| ever_column(&c)).collect();
        let broad_counts = row_sums(table, &ever_broad)?;
        let granular_counts = row_sums(table, &ever_granular)?;
        table.insert("number_of_ever_broad_diagnosis", FeatureDType::Int, broad_counts)?;
        table.insert("number_of_ever_granular_diagnosis", FeatureDType::Int, granular_counts)?;
        Ok(())
    }
}

impl FeatureFamily for DiagnosisStateFeatures {
    fn name(&self) -> String {
        Self::NAME.to_string()
    }

    fn requirements(&self) -> Vec<TableRequirement> {
        vec![
            TableRequirement::new(PATIENT_TABLE, &["anonymous_pat_id", "first_year_month"]),
            TableRequirement::new(
                DIAGNOSIS_TABLE,
                &["anonymous_pat_id", "diagnosis_start_date", "diagnosis_end_date"],
            ),
        ]
    }

    fn output_schema(&self) -> Vec<FeatureColumn> {
        let columns = state_columns();
        let mut schema: Vec<FeatureColumn> = columns
            .iter()
            .map(|column| FeatureColumn::int(current_column(column)))
            .collect();
        schema.extend(columns.iter().map(|column| FeatureColumn::int(ever_column(column))));
        schema.extend(Self::summary_columns().into_iter().map(FeatureColumn::int));
        schema
    }

    fn transform(&self, ctx: &PatientContext<'_>) -> Result<WeeklyTable, FeatureError> {
        let diagnosis = ctx.table(DIAGNOSIS_TABLE, Self::NAME)?;
        if diagnosis.is_empty() {
            return Ok(WeeklyTable::filled(
                &ctx.calendar,
                &constant_defaults(&self.output_schema(), Some(0.0)),
            ));
        }

        let columns = state_columns();
        let mut intervals = Vec::with_capacity(diagnosis.len());
        for row in diagnosis.rows() {
            let (start, end) = interval_bounds(
                diagnosis,
                row,
                "diagnosis_start_date",
                "diagnosis_end_date",
                ctx.config.end_date,
            )?;
            let mut interval = StateInterval::new(ctx.patient_id, start, end);
            for column in &columns {
                interval = interval.with(column.clone(), optional_number(diagnosis, row, column));
            }
            intervals.push(interval);
        }

        let mut table = aggregate_state(
            &intervals,
            &ctx.calendar,
            ctx.config.end_date,
            &columns,
            StateReducer::Last,
        )?;
        for column in &columns {
            table.map_column(column, |value| value.or(Some(0.0)))?;
            table.rename(column, &current_column(column))?;
        }

        Self::add_current_summaries(&mut table)?;
        Self::add_ever_summaries(&mut table)?;
        Ok(table)
    }
}
