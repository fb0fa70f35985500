//! Trailing look-back windows and cumulative "ever" rollups.
//!
//! A window of `k` weeks covers weeks `t-k ..= t-1`. Weeks before the start
//! of history contribute nothing: a partial window sums the weeks that
//! exist (an empty window sums to 0) and maxes to missing when no week is
//! available.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::table::{infer_dtype, TableError, WeeklyTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowReducer {
    Sum,
    Max,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub column: String,
    pub reducer: WindowReducer,
}

impl WindowSpec {
    pub fn new(column: impl Into<String>, reducer: WindowReducer) -> Self {
        Self {
            column: column.into(),
            reducer,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowStats {
    pub horizons: Vec<(u32, Vec<Option<f64>>)>,
    pub ever: Vec<Option<f64>>,
}

pub fn lagged(series: &[Option<f64>], offset: usize) -> Vec<Option<f64>> {
    (0..series.len())
        .map(|idx| idx.checked_sub(offset).and_then(|src| series[src]))
        .collect()
}

pub fn window_stats(series: &[Option<f64>], horizons: &[u32], reducer: WindowReducer) -> WindowStats {
    let horizons = horizons
        .iter()
        .map(|k| {
            let k_usize = *k as usize;
            let values = (0..series.len())
                .map(|idx| {
                    let start = idx.saturating_sub(k_usize);
                    let available = series[start..idx].iter().flatten().copied();
                    match reducer {
                        WindowReducer::Sum => Some(available.sum()),
                        WindowReducer::Max => available.reduce(f64::max),
                    }
                })
                .collect();
            (*k, values)
        })
        .collect();

    WindowStats {
        horizons,
        ever: cumulative(series, reducer),
    }
}

/// Running reducer including the current week; missing weeks stay missing
/// and do not reset the running value.
pub fn cumulative(series: &[Option<f64>], reducer: WindowReducer) -> Vec<Option<f64>> {
    let mut running: Option<f64> = None;
    series
        .iter()
        .map(|value| {
            let v = (*value)?;
            running = Some(match (reducer, running) {
                (_, None) => v,
                (WindowReducer::Sum, Some(acc)) => acc + v,
                (WindowReducer::Max, Some(acc)) => acc.max(v),
            });
            running
        })
        .collect()
}

pub fn weeks_ago_column(column: &str, offset: u32) -> String {
    format!("{column}_{offset}_weeks_ago")
}

pub fn in_last_column(column: &str, weeks: u32) -> String {
    format!("{column}_in_last_{weeks}_weeks")
}

pub fn ever_column(column: &str) -> String {
    format!("{column}_ever")
}

/// Output names in the order `add_window_features` materialises them.
pub fn window_column_names(specs: &[WindowSpec], horizons: &[u32], retained: &Range<u32>) -> Vec<String> {
    let mut names = Vec::new();
    for spec in specs {
        names.extend(retained.clone().map(|offset| weeks_ago_column(&spec.column, offset)));
        names.push(ever_column(&spec.column));
        names.extend(horizons.iter().map(|k| in_last_column(&spec.column, *k)));
    }
    names
}

/// Adds lagged, horizon and "ever" columns for each spec. Only the lagged
/// offsets inside `retained` are kept on the table.
pub fn add_window_features(
    table: &mut WeeklyTable,
    specs: &[WindowSpec],
    horizons: &[u32],
    retained: &Range<u32>,
) -> Result<(), TableError> {
    for spec in specs {
        let series = table.values(&spec.column)?.to_vec();
        let dtype = infer_dtype(&series);

        for offset in retained.clone() {
            table.insert(
                weeks_ago_column(&spec.column, offset),
                dtype,
                lagged(&series, offset as usize),
            )?;
        }

        let stats = window_stats(&series, horizons, spec.reducer);
        table.insert(ever_column(&spec.column), dtype, stats.ever)?;
        for (k, values) in stats.horizons {
            table.insert(in_last_column(&spec.column, k), dtype, values)?;
        }
    }
    Ok(())
}
