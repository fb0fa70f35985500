use std::ops::Range;

use crate::config::FeatureConfig;
use crate::events::{aggregate_events, EventRecord, Stat, StatSpec};
use crate::recency::{recency_values, time_since_last, within_last};
use crate::schema::{RawTable, TableRequirement, CONTACTS_TABLE, PATIENT_TABLE};
use crate::table::{FeatureColumn, FeatureDType, WeeklyTable};
use crate::window::{add_window_features, ever_column, window_column_names, WindowReducer, WindowSpec};

use super::{event_defaults, event_time, flag_values, recency_column, FeatureError, FeatureFamily, PatientContext};

pub const CONTACT_EVENT_CODE_CATEGORIES: [&str; 6] = ["fso", "gro", "ts", "carer", "rev", "other"];

const OCCURRENCE_COLUMN: &str = "contacts";
const DNA_ATTENDANCE: &str = "Did not attend (DNA) or not in";
const WITHIN_LAST_WEEKS: [u32; 2] = [4, 24];
const WITHOUT_FOLLOWUP_COLUMN: &str = "contact_dna_without_followup";
const RISK_DNA_COLUMN: &str = "contact_risk_dna_indicator";

fn event_code_column(category: &str) -> String {
    format!("contact_event_code_{category}")
}

fn contact_events(contacts: &RawTable, patient_id: i64) -> Result<Vec<EventRecord>, FeatureError> {
    contacts
        .rows()
        .iter()
        .map(|row| {
            let mut event = EventRecord::new(patient_id, event_time(contacts, row, "contacts_datetime")?);
            let dna = contacts.cell(row, "attendance") == Some(DNA_ATTENDANCE);
            event = event.with("contact_dna", if dna { 1.0 } else { 0.0 });
            match contacts.cell(row, "contact_service_code") {
                Some("Unplanned") => event = event.with("contact_unplanned", 1.0),
                Some("Planned") => event = event.with("contact_unplanned", 0.0),
                _ => {}
            }
            if let Some(code) = contacts.cell(row, "contact_event_code") {
                let code = code.to_lowercase();
                if CONTACT_EVENT_CODE_CATEGORIES.contains(&code.as_str()) {
                    event = event.with(event_code_column(&code), 1.0);
                }
            }
            Ok(event)
        })
        .collect()
}

/// Weekly contact counts, did-not-attend and unplanned indicators, event
/// code categories, recency and look-back windows.
#[derive(Debug, Clone)]
pub struct ContactEventFeatures {
    t_weeks: Vec<u32>,
    retained_offsets: Range<u32>,
}

impl ContactEventFeatures {
    pub const NAME: &'static str = "ContactEventFeatures";

    pub fn new(config: &FeatureConfig) -> Self {
        Self {
            t_weeks: config.t_weeks.clone(),
            retained_offsets: config.retained_offsets.clone(),
        }
    }

    fn window_specs() -> Vec<WindowSpec> {
        ["contacts_sum", "contact_unplanned_sum", "contact_dna_sum"]
            .into_iter()
            .map(|column| WindowSpec::new(column, WindowReducer::Sum))
            .collect()
    }

    fn recency_sources() -> Vec<String> {
        CONTACT_EVENT_CODE_CATEGORIES
            .iter()
            .map(|category| event_code_column(category))
            .chain(
                ["contacts_max", "contact_unplanned_max", "contact_dna_max"]
                    .into_iter()
                    .map(String::from),
            )
            .collect()
    }

    fn without_followup(table: &WeeklyTable) -> Result<Vec<Option<f64>>, FeatureError> {
        let dna_recency = table.values(&recency_column("contact_dna_max"))?;
        let contact_recency = table.values(&recency_column("contacts_max"))?;
        let dna_sum = table.values("contact_dna_sum")?;
        let contacts_sum = table.values("contacts_sum")?;
        let contacts_max = table.values("contacts_max")?;

        let flags = (0..table.len()).map(|idx| {
            let last_contact_was_dna =
                matches!((dna_recency[idx], contact_recency[idx]), (Some(d), Some(c)) if d == c);
            let no_attended_contact = dna_sum[idx] == contacts_sum[idx] || contacts_max[idx] == Some(0.0);
            last_contact_was_dna && no_attended_contact
        });
        Ok(flag_values(flags))
    }

    /// `(1 - dna_ever / contacts_ever) * without_followup`; 0 while no
    /// contact has happened.
    fn risk_dna_indicator(table: &WeeklyTable) -> Result<Vec<Option<f64>>, FeatureError> {
        let dna_ever = table.values(&ever_column("contact_dna_sum"))?;
        let contacts_ever = table.values(&ever_column("contacts_sum"))?;
        let followup = table.values(WITHOUT_FOLLOWUP_COLUMN)?;

        Ok((0..table.len())
            .map(|idx| match (dna_ever[idx], contacts_ever[idx], followup[idx]) {
                (Some(dna), Some(total), Some(flag)) if total != 0.0 => Some((1.0 - dna / total) * flag),
                _ => Some(0.0),
            })
            .collect())
    }
}

impl FeatureFamily for ContactEventFeatures {
    fn name(&self) -> String {
        Self::NAME.to_string()
    }

    fn requirements(&self) -> Vec<TableRequirement> {
        vec![
            TableRequirement::new(PATIENT_TABLE, &["anonymous_pat_id", "first_year_month"]),
            TableRequirement::new(
                CONTACTS_TABLE,
                &[
                    "anonymous_pat_id",
                    "contacts_datetime",
                    "attendance",
                    "contact_service_code",
                    "contact_event_code",
                ],
            ),
        ]
    }

    fn output_schema(&self) -> Vec<FeatureColumn> {
        let mut schema: Vec<FeatureColumn> = [
            "contacts_sum",
            "contacts_min",
            "contacts_max",
            "contact_unplanned_sum",
            "contact_unplanned_max",
            "contact_dna_sum",
            "contact_dna_max",
            "time_since_last_contacts_max",
            "time_since_last_contact_dna_max",
            "time_since_last_contact_unplanned_max",
            "contact_within_last_4_weeks",
            "contact_within_last_24_weeks",
            WITHOUT_FOLLOWUP_COLUMN,
        ]
        .into_iter()
        .map(FeatureColumn::int)
        .collect();
        schema.push(FeatureColumn::float(RISK_DNA_COLUMN));
        schema.extend(
            CONTACT_EVENT_CODE_CATEGORIES
                .iter()
                .map(|category| FeatureColumn::int(event_code_column(category))),
        );
        schema.extend(
            CONTACT_EVENT_CODE_CATEGORIES
                .iter()
                .map(|category| FeatureColumn::int(recency_column(&event_code_column(category)))),
        );
        schema.extend(
            window_column_names(&Self::window_specs(), &self.t_weeks, &self.retained_offsets)
                .into_iter()
                .map(FeatureColumn::int),
        );
        schema
    }

    fn transform(&self, ctx: &PatientContext<'_>) -> Result<WeeklyTable, FeatureError> {
        let contacts = ctx.table(CONTACTS_TABLE, Self::NAME)?;
        if contacts.is_empty() {
            return Ok(WeeklyTable::filled(&ctx.calendar, &event_defaults(&self.output_schema())));
        }

        let events = contact_events(contacts, ctx.patient_id)?;
        let mut specs = vec![
            StatSpec::new(OCCURRENCE_COLUMN, &[Stat::Sum, Stat::Min, Stat::Max]),
            StatSpec::new("contact_unplanned", &[Stat::Sum, Stat::Max]),
            StatSpec::new("contact_dna", &[Stat::Sum, Stat::Max]),
        ];
        specs.extend(
            CONTACT_EVENT_CODE_CATEGORIES
                .iter()
                .map(|category| StatSpec::new(event_code_column(category), &[Stat::Max])),
        );

        let mut table = aggregate_events(&events, &ctx.calendar, OCCURRENCE_COLUMN, &specs)?;
        for category in CONTACT_EVENT_CODE_CATEGORIES {
            let column = event_code_column(category);
            table.rename(&format!("{column}_max"), &column)?;
        }

        for source in Self::recency_sources() {
            let recency = time_since_last(&table.truthy(&source)?);
            table.insert(recency_column(&source), FeatureDType::Int, recency_values(&recency))?;
        }

        let contact_recency = time_since_last(&table.truthy("contacts_max")?);
        for weeks in WITHIN_LAST_WEEKS {
            table.insert(
                format!("contact_within_last_{weeks}_weeks"),
                FeatureDType::Int,
                within_last(&contact_recency, weeks),
            )?;
        }

        let followup = Self::without_followup(&table)?;
        table.insert(WITHOUT_FOLLOWUP_COLUMN, FeatureDType::Int, followup)?;
        add_window_features(&mut table, &Self::window_specs(), &self.t_weeks, &self.retained_offsets)?;
        let risk_dna = Self::risk_dna_indicator(&table)?;
        table.insert(RISK_DNA_COLUMN, FeatureDType::Float, risk_dna)?;
        Ok(table)
    }
}
