use std::path::PathBuf;
use std::time::Instant;

use crisis_features::{
    check_store_compatible, feature_config_from_env, init_logging, load_feature_config, load_table_set,
    log_run_finish, log_run_start, log_tables_loaded, logging_config_from_env, write_matrix_csv,
    write_matrix_sqlite, Pipeline, StoreError,
};
use tracing::warn;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let started = Instant::now();
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let data_dir = std::env::var("CRISIS_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/tables"));
    let store_path = std::env::var("CRISIS_STORE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/features.sqlite"));
    let feature_cfg = match std::env::var("CRISIS_CONFIG_PATH") {
        Ok(path) => load_feature_config(PathBuf::from(path).as_path())?,
        Err(_) => feature_config_from_env(),
    };
    let pipeline = Pipeline::standard(feature_cfg)?;
    log_run_start(&logging_cfg, &pipeline, &data_dir);

    let tables = load_table_set(&data_dir)?;
    log_tables_loaded(&tables, &pipeline);

    let matrix = pipeline.build_cohort(&tables)?;

    if store_path.is_file() {
        match check_store_compatible(&store_path, &matrix.schema) {
            Ok(()) | Err(StoreError::MissingSchema(_)) => {}
            Err(StoreError::Incompatible(err)) => warn!(
                component = "build_features",
                event = "store.schema.replaced",
                store_path = %store_path.display(),
                reason = %err
            ),
            Err(err) => return Err(err.into()),
        }
    }
    write_matrix_sqlite(&store_path, &matrix)?;
    if let Ok(csv_out) = std::env::var("CRISIS_CSV_OUT") {
        write_matrix_csv(PathBuf::from(csv_out).as_path(), &matrix)?;
    }

    log_run_finish(&matrix, &store_path, started.elapsed().as_millis() as u64);
    println!(
        "Built {} weekly rows x {} features for {} patients into {} (schema {})",
        matrix.len(),
        matrix.schema.columns.len(),
        matrix.patient_count(),
        store_path.display(),
        matrix.schema.fingerprint
    );

    Ok(())
}
