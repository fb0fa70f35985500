use std::fs;
use std::path::Path;

use chrono::NaiveDate;
use crisis_features::{
    check_store_compatible, load_table_set, read_matrix_sqlite, read_store_schema, write_matrix_sqlite,
    CohortCriteria, FeatureConfig, FeatureMatrix, Pipeline, PipelineError, SchemaError, TableSet,
    CONTACTS_TABLE, PATIENT_TABLE,
};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid test date")
}

/// Weeks 2020-W53 .. 2021-W08 for patient 7, 2021-W05 .. 2021-W08 for
/// patient 9.
fn config() -> FeatureConfig {
    FeatureConfig {
        t_weeks: vec![2, 4],
        retained_offsets: 1..3,
        ..FeatureConfig::with_end_date(date(2021, 3, 1))
    }
}

fn write_tables(dir: &Path) {
    let files = [
        (
            "patient_table",
            "anonymous_pat_id,first_year_month,month_year_birth\n7,202101,195006\n9,202102,\n",
        ),
        (
            "crisis_table",
            "anonymous_pat_id,event_date,crisis_type,crisis_contact_allocation\n\
             7,2021-01-05 11:00:00,TR,Contact\n\
             7,2021-01-20 08:00:00,IP,IP_BedDay\n",
        ),
        ("crisis_severity", "crisis_contact_allocation,Severity\nContact,1\nIP_BedDay,3\n"),
        (
            "contacts_table",
            "anonymous_pat_id,contacts_datetime,attendance,event_code,service\n\
             7,2021-01-06 10:00:00,Attended,F2F,S1\n\
             7,2021-01-13 10:00:00,Did not attend (DNA) or not in,F2F,S2\n\
             7,2021-01-14 10:00:00,Patient cancelled,F2F,S1\n",
        ),
        ("contact_eventformat_code", "event_code,Category\nF2F,FSO\n"),
        ("service_code", "service,Category\nS1,Planned\nS2,Unplanned\n"),
        (
            "risk_screening_table",
            "anonymous_pat_id,screening_datetime,RiskSuicide,RiskSelfHarm\n7,2021-01-07 09:00:00,Y,N\n",
        ),
        (
            "wellbeing_screening_table",
            "anonymous_pat_id,review_period_start_date,review_period_end_date,WellBeingEmotional,\
             WellBeingFourFactorTotal,WellBeingPersonal,WellBeingSevereDisturbance,WellBeingSocial\n\
             7,2021-01-04,2021-01-31,3,12,2,1,4\n",
        ),
        (
            "diagnosis_table",
            "anonymous_pat_id,diagnosis_start_date,diagnosis_end_date,Diagnosis01Code,Diagnosis02Code\n\
             7,2021-01-04,,F20.0,F10.2\n",
        ),
        ("diagnosis_broad_codes", "Category,DiagnosisCodeRoot\nPsychotic,F2\nSubstance_misuse,F1\n"),
        ("diagnosis_granular_codes", "Category,DiagnosisCodeRoot\nSchizophrenia,F20\nAlcohol,F10\n"),
        (
            "mha_table",
            "anonymous_pat_id,start_date_time,end_date_time,cto_status,on_conditional_discharge,mha_section_code\n\
             7,2021-02-01 00:00:00,2021-02-15 00:00:00,Active,N,3\n",
        ),
        (
            "hospitalization_table",
            "anonymous_pat_id,date_in_bed,activity_category,level_of_observation,date_admission,date_leave\n\
             7,2021-01-20,ACU,LEVEL2,1,0\n\
             7,2021-01-21,ACU,LEVEL2,0,0\n\
             7,2021-01-22,ACU,,0,1\n",
        ),
        ("bed_day_activity_category_code", "activity_category,Category\nACU,Acute_Assessment\n"),
        (
            "referral_table",
            "anonymous_pat_id,referral_date,discharge_date,discharge_reason,referral_source\n\
             7,2021-01-04,2021-01-13,R1,SRC1\n\
             7,2021-02-01,,,SRC2\n",
        ),
        ("discharge_code", "discharge_reason,Category\nR1,NoMH\n"),
        ("source_code", "referral_source,Category\nSRC1,GP\nSRC2,Self\n"),
        ("crisis_plan_table", "anonymous_pat_id,plan_updated_date\n7,2021-01-12\n"),
    ];
    for (name, body) in files {
        fs::write(dir.join(format!("{name}.csv")), body).expect("write table");
    }
}

fn load(dir: &Path) -> TableSet {
    write_tables(dir);
    load_table_set(dir).expect("load tables")
}

fn value(matrix: &FeatureMatrix, patient_id: i64, year: i32, week: u32, column: &str) -> Option<f64> {
    let idx = matrix
        .column_index(column)
        .unwrap_or_else(|| panic!("missing column {column}"));
    matrix
        .rows
        .iter()
        .find(|row| row.patient_id == patient_id && row.year == year && row.week == week)
        .unwrap_or_else(|| panic!("missing row {patient_id} {year}-W{week}"))
        .values[idx]
}

#[test]
fn standard_pipeline_builds_a_complete_matrix() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tables = load(dir.path());
    let pipeline = Pipeline::standard(config()).expect("pipeline");
    let matrix = pipeline.build_cohort(&tables).expect("cohort");

    assert_eq!(matrix.schema, pipeline.schema());
    assert_eq!(matrix.patient_count(), 2);
    assert_eq!(matrix.patient_rows(7).count(), 9);
    assert_eq!(matrix.patient_rows(9).count(), 4);
    assert!(matrix
        .rows
        .iter()
        .all(|row| row.values.len() == matrix.schema.columns.len()));

    // Crises and their severity lookup.
    assert_eq!(value(&matrix, 7, 2021, 1, "crisis_max"), Some(1.0));
    assert_eq!(value(&matrix, 7, 2021, 1, "severity_max"), Some(1.0));
    assert_eq!(value(&matrix, 7, 2021, 3, "severity_max"), Some(3.0));
    assert_eq!(value(&matrix, 7, 2021, 2, "time_since_last_crisis"), Some(1.0));
    assert_eq!(value(&matrix, 7, 2020, 53, "crisis_in_4_weeks"), Some(1.0));
    assert_eq!(value(&matrix, 7, 2021, 5, "crisis_in_4_weeks"), Some(0.0));

    // Cancelled contacts are dropped before counting.
    assert_eq!(value(&matrix, 7, 2021, 1, "contacts_sum"), Some(1.0));
    assert_eq!(value(&matrix, 7, 2021, 2, "contacts_sum"), Some(1.0));
    assert_eq!(value(&matrix, 7, 2021, 2, "contact_dna_sum"), Some(1.0));

    assert_eq!(value(&matrix, 7, 2021, 1, "risk_assessment"), Some(1.0));
    assert_eq!(value(&matrix, 7, 2020, 53, "risk_assessment_not_up_to_date"), Some(1.0));
    assert_eq!(value(&matrix, 7, 2021, 2, "wellbeing_four_factor_total"), Some(12.0));
    assert_eq!(value(&matrix, 7, 2021, 5, "wellbeing_four_factor_total"), None);

    assert_eq!(value(&matrix, 7, 2021, 1, "current_dual_diagnosis"), Some(1.0));
    assert_eq!(value(&matrix, 7, 2021, 8, "ever_diagnosed_granular_alcohol"), Some(1.0));
    assert_eq!(value(&matrix, 7, 2021, 5, "cto_status_active"), Some(1.0));
    assert_eq!(value(&matrix, 7, 2021, 1, "current_age"), Some(70.0));
    assert_eq!(value(&matrix, 7, 2021, 1, "current_age_bin_elder"), Some(1.0));

    // Two one-week crisis periods, W01 and W03, under the first threshold.
    assert_eq!(value(&matrix, 7, 2021, 3, "number_of_crisis_current_crisis"), Some(1.0));
    assert_eq!(value(&matrix, 7, 2021, 2, "number_of_crisis_current_crisis"), Some(0.0));
    assert_eq!(value(&matrix, 7, 2021, 2, "number_of_crisis_last_crisis"), Some(1.0));
    assert_eq!(value(&matrix, 7, 2021, 1, "number_of_crisis_last_crisis"), None);

    // The W03 stay falls inside the second period.
    assert_eq!(value(&matrix, 7, 2021, 3, "hospitalization_sum"), Some(3.0));
    assert_eq!(value(&matrix, 7, 2021, 3, "hospitalization_activity_acute_assessment_sum"), Some(3.0));
    assert_eq!(value(&matrix, 7, 2021, 5, "time_since_last_hospitalization"), Some(2.0));
    assert_eq!(value(&matrix, 7, 2021, 3, "number_of_bed_days_last_crisis"), Some(0.0));
    assert_eq!(value(&matrix, 7, 2021, 4, "number_of_bed_days_last_crisis"), Some(3.0));
    assert_eq!(value(&matrix, 7, 2021, 4, "level_of_obs_max_last_crisis"), Some(2.0));
    assert_eq!(value(&matrix, 7, 2021, 4, "number_of_leave_days_last_crisis"), Some(1.0));

    // Referral lookups and the crisis plan.
    assert_eq!(value(&matrix, 7, 2021, 2, "referral_event_discharge_category_no_mh"), Some(1.0));
    assert_eq!(value(&matrix, 7, 2021, 1, "referral_state_source_category_gp"), Some(1.0));
    assert_eq!(value(&matrix, 7, 2021, 3, "referral_state_source_category_gp"), Some(0.0));
    assert_eq!(value(&matrix, 7, 2021, 8, "referral_state_source_category_self"), Some(1.0));
    assert_eq!(value(&matrix, 7, 2021, 2, "crisis_plan_update"), Some(1.0));
    assert_eq!(value(&matrix, 7, 2021, 8, "crisis_plan_up_to_date"), Some(1.0));

    // Patients without events still get every column, defaulted.
    assert_eq!(value(&matrix, 9, 2021, 5, "crisis_max"), Some(0.0));
    assert_eq!(value(&matrix, 9, 2021, 5, "time_since_last_crisis"), None);
    assert_eq!(value(&matrix, 9, 2021, 6, "current_diagnosis_broad_psychotic"), Some(0.0));
    assert_eq!(value(&matrix, 9, 2021, 6, "current_age"), None);
    assert_eq!(value(&matrix, 9, 2021, 6, "number_of_bed_days_last_crisis"), None);
    assert_eq!(value(&matrix, 9, 2021, 6, "crisis_plan_up_to_date"), Some(0.0));
    assert_eq!(value(&matrix, 9, 2021, 6, "referral_discharge"), Some(0.0));
}

#[test]
fn death_truncates_the_calendar_and_can_exclude_the_patient() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_tables(dir.path());
    fs::write(
        dir.path().join(format!("{PATIENT_TABLE}.csv")),
        "anonymous_pat_id,first_year_month,month_year_birth,month_year_death\n\
         7,202101,195006,202101\n\
         9,202102,,290012\n",
    )
    .expect("rewrite patients");
    let tables = load_table_set(dir.path()).expect("load");

    let matrix = Pipeline::standard(config())
        .expect("pipeline")
        .build_cohort(&tables)
        .expect("cohort");
    // Died in January 2021: weeks 2020-W53 .. 2021-W04.
    assert_eq!(matrix.patient_rows(7).count(), 5);
    assert_eq!(matrix.patient_rows(9).count(), 4);

    let mut cfg = config();
    cfg.cohort = CohortCriteria {
        exclude_dead: true,
        ..CohortCriteria::default()
    };
    let matrix = Pipeline::standard(cfg)
        .expect("pipeline")
        .build_cohort(&tables)
        .expect("cohort");
    assert_eq!(matrix.patient_rows(7).count(), 0);
    assert_eq!(matrix.patient_rows(9).count(), 4);
}

#[test]
fn matrix_round_trips_through_the_sqlite_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tables = load(dir.path());
    let pipeline = Pipeline::standard(config()).expect("pipeline");
    let matrix = pipeline.build_cohort(&tables).expect("cohort");

    let store = dir.path().join("store/features.sqlite");
    write_matrix_sqlite(&store, &matrix).expect("write store");
    assert_eq!(read_store_schema(&store).expect("schema"), matrix.schema);
    assert_eq!(read_matrix_sqlite(&store).expect("read store"), matrix);

    let mut other = config();
    other.t_weeks = vec![4, 8];
    let drifted = Pipeline::standard(other).expect("pipeline").schema();
    assert!(check_store_compatible(&store, &drifted).is_err());
    check_store_compatible(&store, &matrix.schema).expect("same schema");
}

#[test]
fn missing_input_table_is_reported_before_any_patient_runs() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_tables(dir.path());
    fs::remove_file(dir.path().join(format!("{CONTACTS_TABLE}.csv"))).expect("remove contacts");
    let tables = load_table_set(dir.path()).expect("load");

    let err = Pipeline::standard(config())
        .expect("pipeline")
        .build_cohort(&tables)
        .expect_err("contacts are required");
    assert!(matches!(
        err,
        PipelineError::Schema(SchemaError::MissingTable { ref table, .. }) if table == CONTACTS_TABLE
    ));
}

#[test]
fn missing_required_column_names_the_first_gap() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_tables(dir.path());
    fs::write(
        dir.path().join(format!("{PATIENT_TABLE}.csv")),
        "anonymous_pat_id,month_year_birth\n7,195006\n",
    )
    .expect("rewrite patients");
    let tables = load_table_set(dir.path()).expect("load");

    let err = Pipeline::standard(config())
        .expect("pipeline")
        .build_cohort(&tables)
        .expect_err("first_year_month is required");
    assert!(matches!(
        err,
        PipelineError::Schema(SchemaError::MissingColumn { ref column, .. }) if column == "first_year_month"
    ));
}
