use chrono::{Datelike, NaiveDate};

use crate::calendar::{parse_year_month, WeekKey};
use crate::schema::{parse_patient_id, TableRequirement, PATIENT_ID_COLUMN, PATIENT_TABLE};
use crate::table::{FeatureColumn, WeeklyTable};

use super::{FeatureError, FeatureFamily, PatientContext};

/// Average number of ISO weeks per calendar month.
const WEEKS_PER_MONTH: f64 = 4.42;
const RETIREMENT_AGE: i32 = 65;

/// Age bins as `(name, exclusive lower, inclusive upper)`.
pub const AGE_BINS: [(&str, i32, i32); 6] = [
    ("child", 0, 14),
    ("teen_adult", 14, 25),
    ("young_adult", 25, 34),
    ("middle_age_adult", 34, 45),
    ("older_adult", 45, 64),
    ("elder", 64, 200),
];

fn age_bin_column(bin: &str) -> String {
    format!("current_age_bin_{bin}")
}

fn months_since_known(week: WeekKey, first_known: NaiveDate) -> i64 {
    let month_of_week = (f64::from(week.week) / WEEKS_PER_MONTH).ceil() as i64;
    let months = i64::from(week.year - first_known.year()) * 12 + month_of_week - i64::from(first_known.month());
    months.max(0)
}

fn age_at(monday: NaiveDate, birth: NaiveDate) -> i32 {
    let before_birthday_month = monday.month() < birth.month();
    monday.year() - birth.year() - i32::from(before_birthday_month)
}

/// Time since the patient became known to services, and age.
#[derive(Debug, Clone, Default)]
pub struct PatientTimeInSystemFeatures;

impl PatientTimeInSystemFeatures {
    pub const NAME: &'static str = "PatientTimeInSystemFeatures";

    fn birth_month(ctx: &PatientContext<'_>) -> Result<Option<NaiveDate>, FeatureError> {
        let patients = ctx.table(PATIENT_TABLE, Self::NAME)?;
        let raw = patients
            .rows()
            .iter()
            .find(|row| patients.cell(row, PATIENT_ID_COLUMN).and_then(parse_patient_id) == Some(ctx.patient_id))
            .and_then(|row| patients.cell(row, "month_year_birth"));
        match raw {
            Some(raw) => Ok(Some(parse_year_month(raw)?)),
            None => Ok(None),
        }
    }
}

impl FeatureFamily for PatientTimeInSystemFeatures {
    fn name(&self) -> String {
        Self::NAME.to_string()
    }

    fn requirements(&self) -> Vec<TableRequirement> {
        vec![TableRequirement::new(
            PATIENT_TABLE,
            &["anonymous_pat_id", "first_year_month", "month_year_birth"],
        )]
    }

    fn output_schema(&self) -> Vec<FeatureColumn> {
        ["years_since_known", "months_since_known", "current_age", "older_than_65"]
            .into_iter()
            .map(String::from)
            .chain(AGE_BINS.iter().map(|(bin, ..)| age_bin_column(bin)))
            .map(FeatureColumn::int)
            .collect()
    }

    fn transform(&self, ctx: &PatientContext<'_>) -> Result<WeeklyTable, FeatureError> {
        let birth = Self::birth_month(ctx)?;
        let weeks = ctx.calendar.weeks();

        let years: Vec<Option<f64>> = weeks
            .iter()
            .map(|week| Some(f64::from(week.year - ctx.first_known.year())))
            .collect();
        let months: Vec<Option<f64>> = weeks
            .iter()
            .map(|week| Some(months_since_known(*week, ctx.first_known) as f64))
            .collect();
        let ages: Vec<Option<i32>> = weeks
            .iter()
            .map(|week| {
                let birth = birth?;
                week.monday().map(|monday| age_at(monday, birth))
            })
            .collect();

        let mut columns: Vec<Vec<Option<f64>>> = vec![
            years,
            months,
            ages.iter().map(|age| age.map(f64::from)).collect(),
            ages.iter()
                .map(|age| age.map(|age| if age >= RETIREMENT_AGE { 1.0 } else { 0.0 }))
                .collect(),
        ];
        columns.extend(AGE_BINS.iter().map(|(_, lower, upper)| {
            ages.iter()
                .map(|age| age.map(|age| if age > *lower && age <= *upper { 1.0 } else { 0.0 }))
                .collect()
        }));

        let mut table = WeeklyTable::new(&ctx.calendar);
        for (column, values) in self.output_schema().into_iter().zip(columns) {
            table.insert(column.name, column.dtype, values)?;
        }
        Ok(table)
    }
}
