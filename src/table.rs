//! Weekly feature tables keyed by (patient_id, year, week).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calendar::{PatientCalendar, WeekKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    Int,
    Float,
}

impl FeatureDType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

impl FeatureColumn {
    pub fn int(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dtype: FeatureDType::Int,
        }
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dtype: FeatureDType::Float,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeeklyColumn {
    pub name: String,
    pub dtype: FeatureDType,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub patient_id: i64,
    pub year: i32,
    pub week: u32,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Error, PartialEq)]
pub enum TableError {
    #[error("column {column} has {found} values, expected {expected}")]
    LengthMismatch {
        column: String,
        found: usize,
        expected: usize,
    },
    #[error("missing column {0}")]
    MissingColumn(String),
    #[error("duplicate column {0}")]
    DuplicateColumn(String),
    #[error("weekly index mismatch: patient {left} vs {right}")]
    IndexMismatch { left: i64, right: i64 },
    #[error("column {column} holds non-boolean value {value:?} at week {year}-W{week:02}")]
    NonBoolean {
        column: String,
        year: i32,
        week: u32,
        value: Option<f64>,
    },
    #[error("integer column {column} holds non-integral value {value} at week {year}-W{week:02}")]
    NonIntegral {
        column: String,
        year: i32,
        week: u32,
        value: f64,
    },
    #[error("weeks out of order at position {position}")]
    WeeksOutOfOrder { position: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeeklyTable {
    patient_id: i64,
    weeks: Vec<WeekKey>,
    columns: Vec<WeeklyColumn>,
}

impl WeeklyTable {
    pub fn new(calendar: &PatientCalendar) -> Self {
        Self::from_weeks(calendar.patient_id, calendar.weeks().to_vec())
    }

    pub fn from_weeks(patient_id: i64, weeks: Vec<WeekKey>) -> Self {
        Self {
            patient_id,
            weeks,
            columns: Vec::new(),
        }
    }

    /// Full-history table with every declared column set to its default.
    pub fn filled(calendar: &PatientCalendar, defaults: &[(FeatureColumn, Option<f64>)]) -> Self {
        let mut table = Self::new(calendar);
        for (column, value) in defaults {
            table.columns.push(WeeklyColumn {
                name: column.name.clone(),
                dtype: column.dtype,
                values: vec![*value; calendar.len()],
            });
        }
        table
    }

    pub fn patient_id(&self) -> i64 {
        self.patient_id
    }

    pub fn weeks(&self) -> &[WeekKey] {
        &self.weeks
    }

    pub fn len(&self) -> usize {
        self.weeks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weeks.is_empty()
    }

    pub fn columns(&self) -> &[WeeklyColumn] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn schema(&self) -> Vec<FeatureColumn> {
        self.columns
            .iter()
            .map(|c| FeatureColumn {
                name: c.name.clone(),
                dtype: c.dtype,
            })
            .collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&WeeklyColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn values(&self, name: &str) -> Result<&[Option<f64>], TableError> {
        self.column(name)
            .map(|c| c.values.as_slice())
            .ok_or_else(|| TableError::MissingColumn(name.to_string()))
    }

    /// Inserts a column, replacing any existing column with the same name.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        dtype: FeatureDType,
        values: Vec<Option<f64>>,
    ) -> Result<(), TableError> {
        let name = name.into();
        if values.len() != self.weeks.len() {
            return Err(TableError::LengthMismatch {
                column: name,
                found: values.len(),
                expected: self.weeks.len(),
            });
        }

        let column = WeeklyColumn {
            name,
            dtype,
            values,
        };
        match self.columns.iter_mut().find(|c| c.name == column.name) {
            Some(existing) => *existing = column,
            None => self.columns.push(column),
        }
        Ok(())
    }

    pub fn insert_flags(&mut self, name: impl Into<String>, flags: &[bool]) -> Result<(), TableError> {
        let values = flags
            .iter()
            .map(|flag| Some(if *flag { 1.0 } else { 0.0 }))
            .collect();
        self.insert(name, FeatureDType::Int, values)
    }

    pub fn insert_counts(&mut self, name: impl Into<String>, counts: &[u32]) -> Result<(), TableError> {
        let values = counts.iter().map(|c| Some(f64::from(*c))).collect();
        self.insert(name, FeatureDType::Int, values)
    }

    /// Strict 0/1 view of a column; anything else is a validation error.
    pub fn indicator(&self, name: &str) -> Result<Vec<bool>, TableError> {
        let values = self.values(name)?;
        values
            .iter()
            .zip(&self.weeks)
            .map(|(value, week)| match value {
                Some(v) if *v == 0.0 => Ok(false),
                Some(v) if *v == 1.0 => Ok(true),
                other => Err(TableError::NonBoolean {
                    column: name.to_string(),
                    year: week.year,
                    week: week.week,
                    value: *other,
                }),
            })
            .collect()
    }

    /// Lenient boolean view: present and non-zero.
    pub fn truthy(&self, name: &str) -> Result<Vec<bool>, TableError> {
        Ok(self
            .values(name)?
            .iter()
            .map(|value| matches!(value, Some(v) if *v != 0.0))
            .collect())
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), TableError> {
        if from == to {
            return Ok(());
        }
        if self.has_column(to) {
            return Err(TableError::DuplicateColumn(to.to_string()));
        }
        let column = self
            .columns
            .iter_mut()
            .find(|c| c.name == from)
            .ok_or_else(|| TableError::MissingColumn(from.to_string()))?;
        column.name = to.to_string();
        Ok(())
    }

    pub fn map_column(
        &mut self,
        name: &str,
        f: impl Fn(Option<f64>) -> Option<f64>,
    ) -> Result<(), TableError> {
        let column = self
            .columns
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| TableError::MissingColumn(name.to_string()))?;
        for value in &mut column.values {
            *value = f(*value);
        }
        Ok(())
    }

    pub fn ensure_ascending_weeks(&self) -> Result<(), TableError> {
        for (position, pair) in self.weeks.windows(2).enumerate() {
            if pair[0] >= pair[1] {
                return Err(TableError::WeeksOutOfOrder {
                    position: position + 1,
                });
            }
        }
        Ok(())
    }

    /// Projects onto `schema`: every declared column must exist; integer
    /// columns must hold integral values (missing is allowed).
    pub fn select(&self, schema: &[FeatureColumn]) -> Result<WeeklyTable, TableError> {
        let mut out = Self::from_weeks(self.patient_id, self.weeks.clone());
        for declared in schema {
            let column = self
                .column(&declared.name)
                .ok_or_else(|| TableError::MissingColumn(declared.name.clone()))?;
            if declared.dtype == FeatureDType::Int {
                for (value, week) in column.values.iter().zip(&self.weeks) {
                    if let Some(v) = value {
                        if v.fract() != 0.0 || !v.is_finite() {
                            return Err(TableError::NonIntegral {
                                column: declared.name.clone(),
                                year: week.year,
                                week: week.week,
                                value: *v,
                            });
                        }
                    }
                }
            }
            out.columns.push(WeeklyColumn {
                name: declared.name.clone(),
                dtype: declared.dtype,
                values: column.values.clone(),
            });
        }
        Ok(out)
    }

    /// Appends the columns of a table sharing the same weekly index.
    pub fn hconcat(&mut self, other: WeeklyTable) -> Result<(), TableError> {
        if other.patient_id != self.patient_id {
            return Err(TableError::IndexMismatch {
                left: self.patient_id,
                right: other.patient_id,
            });
        }
        if other.weeks != self.weeks {
            return Err(TableError::IndexMismatch {
                left: self.patient_id,
                right: other.patient_id,
            });
        }
        for column in other.columns {
            if self.has_column(&column.name) {
                return Err(TableError::DuplicateColumn(column.name));
            }
            self.columns.push(column);
        }
        Ok(())
    }

    pub fn to_rows(&self) -> Vec<FeatureRow> {
        self.weeks
            .iter()
            .enumerate()
            .map(|(idx, week)| FeatureRow {
                patient_id: self.patient_id,
                year: week.year,
                week: week.week,
                values: self.columns.iter().map(|c| c.values[idx]).collect(),
            })
            .collect()
    }
}

/// Integer when every present value is integral.
pub(crate) fn infer_dtype(values: &[Option<f64>]) -> FeatureDType {
    if values.iter().flatten().all(|v| v.fract() == 0.0) {
        FeatureDType::Int
    } else {
        FeatureDType::Float
    }
}
