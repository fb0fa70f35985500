//! Subscriber setup and the lifecycle events of a feature build.

use std::env;
use std::path::Path;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::pipeline::{FeatureMatrix, Pipeline};
use crate::schema::TableSet;

/// Directive that surfaces the per-patient debug events.
const PATIENT_DETAIL_DIRECTIVE: &str = "crisis_features::pipeline=debug";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, e.g. `info` or `crisis_features::store=debug`.
    pub filter: String,
    pub format: LogFormat,
    /// Log one event per patient as the cohort is built.
    pub patient_detail: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Compact,
            patient_detail: false,
        }
    }
}

impl LoggingConfig {
    pub fn directives(&self) -> String {
        if self.patient_detail {
            format!("{},{PATIENT_DETAIL_DIRECTIVE}", self.filter)
        } else {
            self.filter.clone()
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Reads `CRISIS_LOG`, `CRISIS_LOG_FORMAT` and `CRISIS_LOG_PATIENTS`.
/// Unparsable values keep the default.
pub fn logging_config_from_env() -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Ok(filter) = env::var("CRISIS_LOG") {
        let trimmed = filter.trim();
        if !trimmed.is_empty() {
            config.filter = trimmed.to_string();
        }
    }
    if let Some(format) = env::var("CRISIS_LOG_FORMAT").ok().as_deref().and_then(parse_log_format) {
        config.format = format;
    }
    if let Some(detail) = env::var("CRISIS_LOG_PATIENTS").ok().as_deref().and_then(parse_bool) {
        config.patient_detail = detail;
    }

    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter = EnvFilter::try_new(config.directives()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(!matches!(config.format, LogFormat::Json));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
        LogFormat::Compact => tracing::subscriber::set_global_default(builder.compact().finish())?,
    }

    Ok(())
}

pub fn log_run_start(logging: &LoggingConfig, pipeline: &Pipeline, data_dir: &Path) {
    let features = pipeline.config();
    info!(
        component = "build_features",
        event = "build.start",
        log_filter = %logging.directives(),
        log_format = ?logging.format,
        data_dir = %data_dir.display(),
        end_date = %features.end_date,
        min_start_date = %features.min_start_date,
        families = pipeline.family_names().len(),
        burst_thresholds = ?features.burst_thresholds,
        primary_burst_threshold = features.primary_burst_threshold(),
        label_horizon_weeks = features.label_horizon_weeks,
        min_crises = features.cohort.min_crises,
        min_days_known = features.cohort.min_days_known,
        exclude_dead = features.cohort.exclude_dead
    );
}

/// Loaded tables and row totals, plus the tables the pipeline reads that
/// the data directory did not provide.
pub fn log_tables_loaded(tables: &TableSet, pipeline: &Pipeline) {
    let names = tables.names();
    let rows: usize = names
        .iter()
        .filter_map(|name| tables.get(name, "build_features").ok())
        .map(|table| table.len())
        .sum();
    let missing: Vec<&str> = pipeline
        .required_tables()
        .into_iter()
        .filter(|table| !tables.contains(table))
        .collect();
    info!(
        component = "build_features",
        event = "build.tables.loaded",
        table_count = names.len(),
        rows,
        missing_tables = ?missing
    );
}

pub fn log_run_finish(matrix: &FeatureMatrix, store_path: &Path, elapsed_ms: u64) {
    let patients = matrix.patient_count();
    info!(
        component = "build_features",
        event = "build.finish",
        patients,
        weekly_rows = matrix.len(),
        mean_weeks_per_patient = if patients == 0 { 0 } else { matrix.len() / patients },
        feature_columns = matrix.schema.columns.len(),
        fingerprint = %matrix.schema.fingerprint,
        store_path = %store_path.display(),
        elapsed_ms
    );
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        "compact" | "text" => Some(LogFormat::Compact),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    const KEYS: [&str; 3] = ["CRISIS_LOG", "CRISIS_LOG_FORMAT", "CRISIS_LOG_PATIENTS"];

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn config_with(values: [Option<&str>; 3]) -> LoggingConfig {
        let _guard = env_lock().lock().expect("env lock should not be poisoned");
        let previous: Vec<Option<String>> = KEYS.iter().map(|key| env::var(key).ok()).collect();
        for (key, value) in KEYS.iter().zip(values) {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        let config = logging_config_from_env();

        for (key, value) in KEYS.iter().zip(previous) {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
        config
    }

    #[test]
    fn defaults_to_compact_info_without_patient_detail() {
        let cfg = config_with([None, None, None]);
        assert_eq!(cfg, LoggingConfig::default());
        assert_eq!(cfg.directives(), "info");
    }

    #[test]
    fn patient_detail_adds_the_pipeline_debug_directive() {
        let cfg = config_with([Some("warn,crisis_features::store=debug"), Some("json"), Some("yes")]);
        assert_eq!(cfg.format, LogFormat::Json);
        assert!(cfg.patient_detail);
        assert_eq!(
            cfg.directives(),
            "warn,crisis_features::store=debug,crisis_features::pipeline=debug"
        );
    }

    #[test]
    fn unparsable_values_keep_defaults() {
        let cfg = config_with([Some("  "), Some("yaml"), Some("sometimes")]);
        assert_eq!(cfg.filter, "info");
        assert_eq!(cfg.format, LogFormat::Compact);
        assert!(!cfg.patient_detail);
    }
}
