//! Ordered preprocessing and feature families run over a patient cohort.

use std::collections::BTreeSet;
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::cohort::{select_cohort, CohortError};
use crate::config::{validate_config, ConfigError, FeatureConfig};
use crate::families::{
    BedDayEventFeatures, ContactEventFeatures, CrisisEventFeatures, CrisisInNWeeks, CrisisPlanEventFeatures,
    DiagnosisStateFeatures, DuringCrisisFeatures, FeatureError, FeatureFamily, InCrisisPeriod,
    LastCrisisBedDaysFeatures, LastCrisisFeatures, MhaEpisodeStateFeatures, PatientContext,
    PatientTimeInSystemFeatures, ReferralDischargeEventFeatures, ReferralStateFeatures,
    RiskAssessmentEventFeature, WellbeingAssessmentStateFeature, BROAD_CATEGORIES, GRANULAR_CATEGORIES,
};
use crate::preprocess::{
    DiagnosisCodeCategories, DropCancelledContacts, LookupMapping, NormalizeHeaders, Preprocessor, SortByColumn,
};
use crate::schema::{
    SchemaError, TableSet, BED_DAY_ACTIVITY_CODE_TABLE, CONTACTS_TABLE, CONTACT_EVENT_CODE_TABLE,
    CRISIS_PLAN_TABLE, CRISIS_SEVERITY_TABLE, CRISIS_TABLE, DIAGNOSIS_TABLE, HOSPITALIZATION_TABLE, MHA_TABLE,
    PATIENT_ID_COLUMN, PATIENT_TABLE, REFERRAL_DISCHARGE_CODE_TABLE, REFERRAL_SOURCE_CODE_TABLE, REFERRAL_TABLE,
    RISK_TABLE, SERVICE_CODE_TABLE, WELLBEING_TABLE,
};
use crate::table::{FeatureColumn, FeatureRow, TableError, WeeklyTable};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Cohort(#[from] CohortError),
    #[error("pipeline has no feature families")]
    NoFamilies,
    #[error(transparent)]
    Incompatible(#[from] SchemaCompatibilityError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaCompatibilityError {
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

/// Cohort-wide weekly features, sorted by (patient_id, year, week).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    pub schema: FeatureSchema,
    pub rows: Vec<FeatureRow>,
}

impl FeatureMatrix {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.schema.columns.iter().position(|column| column.name == name)
    }

    pub fn patient_rows(&self, patient_id: i64) -> impl Iterator<Item = &FeatureRow> {
        self.rows.iter().filter(move |row| row.patient_id == patient_id)
    }

    pub fn patient_count(&self) -> usize {
        self.rows
            .iter()
            .map(|row| row.patient_id)
            .collect::<BTreeSet<_>>()
            .len()
    }
}

pub struct Pipeline {
    config: FeatureConfig,
    preprocessors: Vec<Box<dyn Preprocessor>>,
    families: Vec<Box<dyn FeatureFamily>>,
}

impl Pipeline {
    /// An empty pipeline; steps run in the order they are added.
    pub fn new(config: FeatureConfig) -> Result<Self, PipelineError> {
        validate_config(&config)?;
        Ok(Self {
            config,
            preprocessors: Vec::new(),
            families: Vec::new(),
        })
    }

    pub fn with_preprocessor(mut self, step: impl Preprocessor + 'static) -> Self {
        self.preprocessors.push(Box::new(step));
        self
    }

    pub fn with_family(mut self, family: impl FeatureFamily + 'static) -> Self {
        self.families.push(Box::new(family));
        self
    }

    pub fn standard(config: FeatureConfig) -> Result<Self, PipelineError> {
        let primary = config.primary_burst_threshold();
        let mut pipeline = Self::new(config.clone())?
            .with_preprocessor(DropCancelledContacts)
            .with_preprocessor(LookupMapping {
                table: CONTACTS_TABLE,
                source_column: "event_code",
                target_column: "contact_event_code",
                lookup_table: CONTACT_EVENT_CODE_TABLE,
                lookup_key: "event_code",
                lookup_value: "Category",
            })
            .with_preprocessor(LookupMapping {
                table: CONTACTS_TABLE,
                source_column: "service",
                target_column: "contact_service_code",
                lookup_table: SERVICE_CODE_TABLE,
                lookup_key: "service",
                lookup_value: "Category",
            })
            .with_preprocessor(LookupMapping {
                table: CRISIS_TABLE,
                source_column: "crisis_contact_allocation",
                target_column: "severity",
                lookup_table: CRISIS_SEVERITY_TABLE,
                lookup_key: "crisis_contact_allocation",
                lookup_value: "Severity",
            })
            .with_preprocessor(LookupMapping {
                table: HOSPITALIZATION_TABLE,
                source_column: "activity_category",
                target_column: "hospitalization_activity",
                lookup_table: BED_DAY_ACTIVITY_CODE_TABLE,
                lookup_key: "activity_category",
                lookup_value: "Category",
            })
            .with_preprocessor(LookupMapping {
                table: REFERRAL_TABLE,
                source_column: "discharge_reason",
                target_column: "discharge_category",
                lookup_table: REFERRAL_DISCHARGE_CODE_TABLE,
                lookup_key: "discharge_reason",
                lookup_value: "Category",
            })
            .with_preprocessor(LookupMapping {
                table: REFERRAL_TABLE,
                source_column: "referral_source",
                target_column: "source_category",
                lookup_table: REFERRAL_SOURCE_CODE_TABLE,
                lookup_key: "referral_source",
                lookup_value: "Category",
            })
            .with_preprocessor(DiagnosisCodeCategories::broad(
                BROAD_CATEGORIES.iter().map(|c| c.to_string()).collect(),
            ))
            .with_preprocessor(DiagnosisCodeCategories::granular(
                GRANULAR_CATEGORIES.iter().map(|c| c.to_string()).collect(),
            ))
            .with_preprocessor(NormalizeHeaders {
                table: RISK_TABLE,
                prefix: "risk_",
                strip: "Risk",
                keep: vec![PATIENT_ID_COLUMN, "screening_datetime"],
            })
            .with_preprocessor(NormalizeHeaders {
                table: WELLBEING_TABLE,
                prefix: "wellbeing_",
                strip: "WellBeing",
                keep: vec![PATIENT_ID_COLUMN, "review_period_start_date", "review_period_end_date"],
            });

        for (table, date_column) in [
            (CRISIS_TABLE, "event_date"),
            (CONTACTS_TABLE, "contacts_datetime"),
            (RISK_TABLE, "screening_datetime"),
            (DIAGNOSIS_TABLE, "diagnosis_start_date"),
            (MHA_TABLE, "start_date_time"),
            (HOSPITALIZATION_TABLE, "date_in_bed"),
            (REFERRAL_TABLE, "referral_date"),
            (CRISIS_PLAN_TABLE, "plan_updated_date"),
        ] {
            pipeline = pipeline.with_preprocessor(SortByColumn { table, date_column });
        }

        pipeline = pipeline.with_family(CrisisEventFeatures::new(&config));
        for threshold in &config.burst_thresholds {
            pipeline = pipeline.with_family(InCrisisPeriod::new(*threshold));
        }
        Ok(pipeline
            .with_family(CrisisInNWeeks::new(config.label_horizon_weeks, primary))
            .with_family(DuringCrisisFeatures::new(primary))
            .with_family(LastCrisisFeatures::new(primary))
            .with_family(LastCrisisBedDaysFeatures::new(primary))
            .with_family(BedDayEventFeatures)
            .with_family(ContactEventFeatures::new(&config))
            .with_family(CrisisPlanEventFeatures)
            .with_family(RiskAssessmentEventFeature::new(config.risk_stale_after_weeks))
            .with_family(WellbeingAssessmentStateFeature)
            .with_family(ReferralDischargeEventFeatures::new(&config))
            .with_family(ReferralStateFeatures)
            .with_family(DiagnosisStateFeatures)
            .with_family(MhaEpisodeStateFeatures)
            .with_family(PatientTimeInSystemFeatures))
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    pub fn family_names(&self) -> Vec<String> {
        self.families.iter().map(|family| family.name()).collect()
    }

    /// Every table some preprocessor or family reads.
    pub fn required_tables(&self) -> Vec<&'static str> {
        let mut tables = BTreeSet::from([PATIENT_TABLE]);
        for step in &self.preprocessors {
            tables.extend(step.requirements().iter().map(|r| r.table));
        }
        for family in &self.families {
            tables.extend(family.requirements().iter().map(|r| r.table));
        }
        tables.into_iter().collect()
    }

    pub fn schema(&self) -> FeatureSchema {
        let columns: Vec<FeatureColumn> = self
            .families
            .iter()
            .flat_map(|family| family.output_schema())
            .collect();
        let fingerprint = schema_fingerprint(&self.config, &columns);

        info!(
            component = "pipeline",
            event = "pipeline.schema.built",
            version = self.config.schema_version,
            families = self.families.len(),
            column_count = columns.len(),
            fingerprint = fingerprint
        );

        FeatureSchema {
            version: self.config.schema_version,
            fingerprint,
            columns,
        }
    }

    /// Applies every preprocessor in order, checking each step's inputs
    /// first.
    pub fn preprocess(&self, tables: &mut TableSet) -> Result<(), PipelineError> {
        for step in &self.preprocessors {
            tables.require(&step.requirements(), step.name())?;
            step.apply(tables)?;
            debug!(component = "pipeline", event = "pipeline.preprocess.step", step = step.name());
        }
        Ok(())
    }

    pub fn validate(&self, tables: &TableSet) -> Result<(), PipelineError> {
        for family in &self.families {
            tables.require(&family.requirements(), &family.name())?;
        }
        Ok(())
    }

    /// Runs each family for one patient of preprocessed tables. Later
    /// families see the outputs of earlier ones.
    pub fn transform_patient(
        &self,
        tables: &TableSet,
        patient_id: i64,
    ) -> Result<Vec<(String, WeeklyTable)>, PipelineError> {
        self.transform_partition(tables.for_patient(patient_id), patient_id)
    }

    fn transform_partition(
        &self,
        tables: TableSet,
        patient_id: i64,
    ) -> Result<Vec<(String, WeeklyTable)>, PipelineError> {
        let mut ctx = PatientContext::new(patient_id, tables, &self.config)?;
        let mut names = Vec::with_capacity(self.families.len());
        for family in &self.families {
            let name = family.name();
            let raw = family.transform(&ctx)?;
            let table = select_output(&raw, &family.output_schema(), &name)?;
            ctx.record_output(name.clone(), table);
            names.push(name);
        }

        let mut outputs = ctx.into_outputs();
        Ok(names
            .into_iter()
            .filter_map(|name| outputs.remove(&name).map(|table| (name, table)))
            .collect())
    }

    /// Joins family tables column-wise on their shared weekly index.
    pub fn assemble(outputs: Vec<(String, WeeklyTable)>) -> Result<WeeklyTable, PipelineError> {
        let mut tables = outputs.into_iter().map(|(_, table)| table);
        let mut assembled = tables.next().ok_or(PipelineError::NoFamilies)?;
        for table in tables {
            assembled.hconcat(table)?;
        }
        assembled.ensure_ascending_weeks()?;
        Ok(assembled)
    }

    pub fn build_patient(&self, tables: &TableSet, patient_id: i64) -> Result<WeeklyTable, PipelineError> {
        Self::assemble(self.transform_patient(tables, patient_id)?)
    }

    pub fn build_cohort(&self, tables: &TableSet) -> Result<FeatureMatrix, PipelineError> {
        if self.families.is_empty() {
            return Err(PipelineError::NoFamilies);
        }
        let started = Instant::now();
        let schema = self.schema();

        let mut prepared = tables.clone();
        self.preprocess(&mut prepared)?;
        self.validate(&prepared)?;

        let selection = select_cohort(&prepared, &self.config)?;
        let patient_ids = selection.eligible;
        info!(
            component = "pipeline",
            event = "pipeline.cohort.start",
            patients = patient_ids.len(),
            excluded = selection.excluded.len(),
            families = self.families.len(),
            end_date = %self.config.end_date
        );

        let partitions = prepared.partition_by_patient(&patient_ids);
        let per_patient: Vec<Vec<FeatureRow>> = partitions
            .into_par_iter()
            .map(|(patient_id, tables)| -> Result<Vec<FeatureRow>, PipelineError> {
                let table = Self::assemble(self.transform_partition(tables, patient_id)?)?;
                debug!(
                    component = "pipeline",
                    event = "pipeline.patient.finish",
                    patient_id,
                    weeks = table.len(),
                    columns = table.columns().len()
                );
                Ok(table.to_rows())
            })
            .collect::<Result<_, _>>()?;

        let mut rows: Vec<FeatureRow> = per_patient.into_iter().flatten().collect();
        rows.sort_by_key(|row| (row.patient_id, row.year, row.week));

        info!(
            component = "pipeline",
            event = "pipeline.cohort.finish",
            patients = patient_ids.len(),
            rows = rows.len(),
            columns = schema.columns.len(),
            elapsed_ms = started.elapsed().as_millis() as u64
        );

        Ok(FeatureMatrix { schema, rows })
    }
}

fn select_output(table: &WeeklyTable, schema: &[FeatureColumn], family: &str) -> Result<WeeklyTable, PipelineError> {
    table.select(schema).map_err(|err| match err {
        TableError::MissingColumn(column) => PipelineError::Schema(SchemaError::MissingOutputColumn {
            column,
            consumer: family.to_string(),
        }),
        other => PipelineError::Table(other),
    })
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), SchemaCompatibilityError> {
    if expected_version != actual.version {
        return Err(SchemaCompatibilityError::VersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(SchemaCompatibilityError::FingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

fn schema_fingerprint(cfg: &FeatureConfig, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{};", cfg.schema_version));
    hasher.update("t_weeks:");
    for horizon in &cfg.t_weeks {
        hasher.update(format!("{horizon},"));
    }
    hasher.update(format!(
        ";retained:{}..{};",
        cfg.retained_offsets.start, cfg.retained_offsets.end
    ));
    hasher.update("bursts:");
    for threshold in &cfg.burst_thresholds {
        hasher.update(format!("{threshold},"));
    }
    hasher.update(format!(
        ";label:{};risk_stale:{};",
        cfg.label_horizon_weeks, cfg.risk_stale_after_weeks
    ));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(format!(":{};", column.dtype.as_str()));
    }
    hex::encode(hasher.finalize())
}
