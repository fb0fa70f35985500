//! Feature extraction configuration.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::ops::Range;
use std::path::Path;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::calendar::default_min_start_date;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

/// Which patients enter the cohort. The default admits everyone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CohortCriteria {
    /// Crisis events on or after `min_start_date`.
    pub min_crises: u32,
    /// Days between the first-known month and the month of `end_date`.
    pub min_days_known: u32,
    pub exclude_dead: bool,
}

impl CohortCriteria {
    /// Patients with enough history to train a crisis model on.
    pub fn training() -> Self {
        Self {
            min_crises: 10,
            min_days_known: 150,
            exclude_dead: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub end_date: NaiveDate,
    pub min_start_date: NaiveDate,
    pub t_weeks: Vec<u32>,
    pub retained_offsets: Range<u32>,
    /// Weeks without a crisis that close a crisis period, one segmentation
    /// per entry. Only the first entry feeds the label, during-crisis and
    /// last-crisis families; see `primary_burst_threshold`.
    pub burst_thresholds: Vec<u32>,
    pub label_horizon_weeks: u32,
    pub risk_stale_after_weeks: u32,
    pub cohort: CohortCriteria,
    pub schema_version: u32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            end_date: Utc::now().date_naive(),
            min_start_date: default_min_start_date(),
            t_weeks: vec![4, 8, 12, 16, 20, 24],
            retained_offsets: 4..12,
            burst_thresholds: vec![1, 2],
            label_horizon_weeks: 4,
            risk_stale_after_weeks: 52,
            cohort: CohortCriteria::default(),
            schema_version: FEATURE_SCHEMA_VERSION,
        }
    }
}

impl FeatureConfig {
    pub fn with_end_date(end_date: NaiveDate) -> Self {
        Self {
            end_date,
            ..Self::default()
        }
    }

    pub fn max_horizon(&self) -> u32 {
        self.t_weeks.iter().copied().max().unwrap_or(0)
    }

    /// The first configured threshold, 1 when none is set. Its burst starts
    /// drive `CrisisInNWeeks`, and its cached segmentation is the one
    /// `DuringCrisisFeatures`, `LastCrisisFeatures` and
    /// `LastCrisisBedDaysFeatures` read. Other thresholds only add their own
    /// `InCrisisPeriod` columns.
    pub fn primary_burst_threshold(&self) -> u32 {
        self.burst_thresholds.first().copied().unwrap_or(1)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid feature config: {0}")]
    Invalid(String),
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn feature_config_from_env() -> FeatureConfig {
    let mut config = FeatureConfig::default();

    if let Some(date) = env_date("CRISIS_END_DATE") {
        config.end_date = date;
    }
    if let Some(date) = env_date("CRISIS_MIN_START_DATE") {
        config.min_start_date = date;
    }
    if let Ok(raw) = env::var("CRISIS_T_WEEKS") {
        match parse_u32_list(&raw) {
            Some(weeks) => config.t_weeks = weeks,
            None => warn!(
                component = "config",
                event = "config.env.ignored",
                key = "CRISIS_T_WEEKS",
                value = %raw
            ),
        }
    }
    if let Some(weeks) = env_u32("CRISIS_LABEL_WEEKS") {
        config.label_horizon_weeks = weeks;
    }
    if let Some(crises) = env_u32("CRISIS_MIN_CRISES") {
        config.cohort.min_crises = crises;
    }
    if let Some(days) = env_u32("CRISIS_MIN_DAYS_KNOWN") {
        config.cohort.min_days_known = days;
    }
    if let Ok(raw) = env::var("CRISIS_EXCLUDE_DEAD") {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => config.cohort.exclude_dead = true,
            "0" | "false" | "no" => config.cohort.exclude_dead = false,
            _ => warn!(
                component = "config",
                event = "config.env.ignored",
                key = "CRISIS_EXCLUDE_DEAD",
                value = %raw
            ),
        }
    }

    config
}

pub fn load_feature_config(path: &Path) -> Result<FeatureConfig, ConfigError> {
    let raw = fs::read_to_string(path)?;
    let config: FeatureConfig = serde_json::from_str(&raw)?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(cfg: &FeatureConfig) -> Result<(), ConfigError> {
    if cfg.end_date <= cfg.min_start_date {
        return Err(ConfigError::Invalid(
            "end_date must be after min_start_date".to_string(),
        ));
    }

    if cfg.schema_version != FEATURE_SCHEMA_VERSION {
        return Err(ConfigError::Invalid(format!(
            "schema_version must equal FEATURE_SCHEMA_VERSION ({FEATURE_SCHEMA_VERSION})"
        )));
    }

    let mut seen = HashSet::new();
    for weeks in &cfg.t_weeks {
        if *weeks == 0 {
            return Err(ConfigError::Invalid("t_weeks entries must be > 0".to_string()));
        }
        if !seen.insert(*weeks) {
            return Err(ConfigError::Invalid("t_weeks entries must be unique".to_string()));
        }
    }

    let retained = &cfg.retained_offsets;
    if retained.start == 0 || retained.start >= retained.end || retained.end > cfg.max_horizon() + 1 {
        return Err(ConfigError::Invalid(format!(
            "retained_offsets {}..{} must be a non-empty range within 1..={}",
            retained.start,
            retained.end,
            cfg.max_horizon()
        )));
    }

    if cfg.burst_thresholds.is_empty() {
        return Err(ConfigError::Invalid(
            "burst_thresholds must not be empty".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for threshold in &cfg.burst_thresholds {
        if *threshold == 0 {
            return Err(ConfigError::Invalid(
                "burst_thresholds entries must be > 0".to_string(),
            ));
        }
        if !seen.insert(*threshold) {
            return Err(ConfigError::Invalid(
                "burst_thresholds entries must be unique".to_string(),
            ));
        }
    }

    if cfg.label_horizon_weeks == 0 {
        return Err(ConfigError::Invalid(
            "label_horizon_weeks must be > 0".to_string(),
        ));
    }

    Ok(())
}

fn env_date(key: &str) -> Option<NaiveDate> {
    let raw = env::var(key).ok()?;
    match NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d") {
        Ok(date) => Some(date),
        Err(_) => {
            warn!(
                component = "config",
                event = "config.env.ignored",
                key,
                value = %raw
            );
            None
        }
    }
}

fn env_u32(key: &str) -> Option<u32> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse::<u32>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(
                component = "config",
                event = "config.env.ignored",
                key,
                value = %raw
            );
            None
        }
    }
}

fn parse_u32_list(raw: &str) -> Option<Vec<u32>> {
    let values: Result<Vec<u32>, _> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse::<u32>)
        .collect();
    values.ok().filter(|v| !v.is_empty())
}
