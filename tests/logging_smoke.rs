use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use crisis_features::{
    load_table_set, log_run_finish, log_run_start, log_tables_loaded, FeatureConfig, LoggingConfig, Pipeline,
    PatientTimeInSystemFeatures, PATIENT_TABLE,
};
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn config() -> FeatureConfig {
    FeatureConfig {
        t_weeks: vec![2, 4],
        retained_offsets: 1..3,
        ..FeatureConfig::with_end_date(NaiveDate::from_ymd_opt(2021, 3, 1).expect("valid date"))
    }
}

fn write_patients(dir: &Path) {
    std::fs::write(
        dir.join(format!("{PATIENT_TABLE}.csv")),
        "anonymous_pat_id,first_year_month,month_year_birth\n7,202101,195006\n",
    )
    .expect("write patients");
}

#[test]
fn run_lifecycle_helpers_emit_baseline_events() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_patients(dir.path());

    let logs = capture_logs(Level::INFO, || {
        let tables = load_table_set(dir.path()).expect("load");
        let pipeline = Pipeline::new(config())
            .expect("pipeline")
            .with_family(PatientTimeInSystemFeatures);

        log_run_start(&LoggingConfig::default(), &pipeline, dir.path());
        log_tables_loaded(&tables, &pipeline);
        let matrix = pipeline.build_cohort(&tables).expect("cohort");
        log_run_finish(&matrix, &dir.path().join("features.sqlite"), 12);
    });

    assert!(logs.contains("\"event\":\"build.start\""));
    assert!(logs.contains("\"event\":\"build.tables.loaded\""));
    assert!(logs.contains("\"event\":\"cohort.selected\""));
    assert!(logs.contains("\"event\":\"pipeline.schema.built\""));
    assert!(logs.contains("\"event\":\"pipeline.cohort.start\""));
    assert!(logs.contains("\"event\":\"pipeline.cohort.finish\""));
    assert!(logs.contains("\"event\":\"build.finish\""));
    assert!(logs.contains("\"component\":\"build_features\""));
    assert!(logs.contains("\"missing_tables\":\"[]\""));
}

#[test]
fn per_patient_events_appear_at_debug() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_patients(dir.path());

    let logs = capture_logs(Level::DEBUG, || {
        let tables = load_table_set(dir.path()).expect("load");
        Pipeline::new(config())
            .expect("pipeline")
            .with_family(PatientTimeInSystemFeatures)
            .build_cohort(&tables)
            .expect("cohort");
    });
    assert!(logs.contains("\"event\":\"pipeline.patient.finish\""));
    assert!(logs.contains("\"patient_id\":7"));
}

#[test]
fn absent_tables_warn_and_loaded_tables_log_at_debug() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_patients(dir.path());

    let warn_logs = capture_logs(Level::WARN, || {
        load_table_set(dir.path()).expect("load");
    });
    assert!(warn_logs.contains("\"event\":\"store.table.absent\""));
    assert!(warn_logs.contains("\"table\":\"crisis_table\""));
    assert!(!warn_logs.contains("\"event\":\"store.table.loaded\""));

    let debug_logs = capture_logs(Level::DEBUG, || {
        load_table_set(dir.path()).expect("load");
    });
    assert!(debug_logs.contains("\"event\":\"store.table.loaded\""));
}
