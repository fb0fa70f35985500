//! Weekly per-patient feature matrices for crisis prediction.
//!
//! Current implemented scope:
//! - ISO-week calendars per patient and weekly tables keyed by (patient, year, week)
//! - event/state aggregation, recency, look-back windows and crisis burst segmentation
//! - feature families, ordered preprocessing, cohort eligibility, cohort pipeline and CSV/SQLite store

mod calendar;
mod cohort;
mod config;
mod crisis;
mod events;
mod families;
mod observability;
mod pipeline;
mod preprocess;
mod recency;
mod schema;
mod state;
mod store;
mod table;
mod window;

pub use calendar::{
    build_calendar, death_month, default_min_start_date, end_date_for, first_known_date, first_of_next_month,
    monday_of, parse_year_month, CalendarError, PatientCalendar, WeekKey, ALIVE_YEAR_MONTH,
};
pub use cohort::{patient_eligibility, select_cohort, CohortError, CohortSelection, PatientEligibility};
pub use config::{
    feature_config_from_env, load_feature_config, validate_config, CohortCriteria, ConfigError, FeatureConfig,
    FEATURE_SCHEMA_VERSION,
};
pub use crisis::{
    burst_column, burst_number_column, bursts_passed_column, carry_forward_after_periods, crisis_in_n_weeks,
    during_crisis_features, during_crisis_schema, in_period_column, label_column, last_crisis_features,
    last_crisis_schema, segment_crises, segment_crisis_table, segmentation_from_table, segmentation_schema,
    segmentation_table, summarize_crisis_periods, CrisisError, CrisisPeriodSummary, CrisisSegmentation,
    CRISIS_INDICATOR_COLUMN, CRISIS_RECENCY_COLUMN, SEVERITY_ATTRIBUTE,
};
pub use events::{aggregate_events, EventRecord, Stat, StatSpec};
pub use families::{
    bed_day_stays, bed_days_during_period, BedDayEventFeatures, BedDayStay, ContactEventFeatures,
    CrisisEventFeatures, CrisisInNWeeks, CrisisPlanEventFeatures, DiagnosisStateFeatures, DuringCrisisFeatures,
    FeatureError, FeatureFamily, InCrisisPeriod, LastCrisisBedDaysFeatures, LastCrisisFeatures,
    MhaEpisodeStateFeatures, PatientContext, PatientTimeInSystemFeatures, ReferralDischargeEventFeatures,
    ReferralStateFeatures, RiskAssessmentEventFeature, WellbeingAssessmentStateFeature, AGE_BINS,
    BED_DAY_ACTIVITY_CATEGORIES, BROAD_CATEGORIES, CONTACT_EVENT_CODE_CATEGORIES, CRISIS_PLAN_CURRENT_WEEKS,
    GRANULAR_CATEGORIES, REFERRAL_DISCHARGE_CATEGORIES, REFERRAL_SOURCE_CATEGORIES, RISK_COLUMNS,
    WELLBEING_COLUMNS,
};
pub use observability::{
    init_logging, log_run_finish, log_run_start, log_tables_loaded, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use pipeline::{
    assert_schema_compatible, FeatureMatrix, FeatureSchema, Pipeline, PipelineError, SchemaCompatibilityError,
};
pub use preprocess::{
    DiagnosisCodeCategories, DropCancelledContacts, LookupMapping, NormalizeHeaders, Preprocessor, SortByColumn,
    DIAGNOSIS_CODE_COLUMNS,
};
pub use recency::{recency_values, time_since_last, within_last};
pub use schema::{
    parse_date, parse_datetime, parse_number, parse_patient_id, to_snake_case, RawTable, SchemaError,
    TableRequirement, TableSet, BED_DAY_ACTIVITY_CODE_TABLE, CONTACTS_TABLE, CONTACT_EVENT_CODE_TABLE,
    CRISIS_PLAN_TABLE, CRISIS_SEVERITY_TABLE, CRISIS_TABLE, DIAGNOSIS_BROAD_CODES_TABLE,
    DIAGNOSIS_GRANULAR_CODES_TABLE, DIAGNOSIS_TABLE, HOSPITALIZATION_TABLE, MHA_TABLE, PATIENT_ID_COLUMN,
    PATIENT_TABLE, REFERRAL_DISCHARGE_CODE_TABLE, REFERRAL_SOURCE_CODE_TABLE, REFERRAL_TABLE, RISK_TABLE,
    SERVICE_CODE_TABLE, TABLE_NAMES, WELLBEING_TABLE,
};
pub use state::{aggregate_state, expand_interval, StateInterval, StateReducer};
pub use store::{
    check_store_compatible, load_table_set, read_csv_table, read_matrix_sqlite, read_store_schema,
    write_matrix_csv, write_matrix_sqlite, StoreError, FEATURES_TABLE, SCHEMA_TABLE,
};
pub use table::{FeatureColumn, FeatureDType, FeatureRow, TableError, WeeklyColumn, WeeklyTable};
pub use window::{
    add_window_features, cumulative, ever_column, in_last_column, lagged, weeks_ago_column, window_column_names,
    window_stats, WindowReducer, WindowSpec, WindowStats,
};
