//! CSV input tables and CSV/SQLite feature matrix output.

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pipeline::{assert_schema_compatible, FeatureMatrix, FeatureSchema, SchemaCompatibilityError};
use crate::schema::{RawTable, SchemaError, TableSet, TABLE_NAMES};
use crate::table::{FeatureColumn, FeatureDType, FeatureRow};

pub const FEATURES_TABLE: &str = "weekly_features";
pub const SCHEMA_TABLE: &str = "feature_schema";

const KEY_COLUMNS: [&str; 3] = ["patient_id", "year", "week"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("data directory {0} does not exist")]
    MissingDataDir(PathBuf),
    #[error("store at {0} has no feature schema")]
    MissingSchema(PathBuf),
    #[error("invalid feature schema entry {key}: '{value}'")]
    InvalidSchemaEntry { key: String, value: String },
    #[error(transparent)]
    Incompatible(#[from] SchemaCompatibilityError),
}

/// Reads `<table>.csv` for every known table under `dir`. Absent files are
/// skipped; the pipeline reports them when a step requires them.
pub fn load_table_set(dir: &Path) -> Result<TableSet, StoreError> {
    if !dir.is_dir() {
        return Err(StoreError::MissingDataDir(dir.to_path_buf()));
    }

    let mut tables = TableSet::new();
    for name in TABLE_NAMES {
        let path = dir.join(format!("{name}.csv"));
        if !path.is_file() {
            warn!(
                component = "store",
                event = "store.table.absent",
                table = name,
                path = %path.display()
            );
            continue;
        }
        let table = read_csv_table(name, &path)?;
        debug!(
            component = "store",
            event = "store.table.loaded",
            table = name,
            rows = table.len(),
            columns = table.headers().len()
        );
        tables.insert(table);
    }
    Ok(tables)
}

pub fn read_csv_table(name: &str, path: &Path) -> Result<RawTable, StoreError> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
    let headers = reader.headers()?.iter().map(str::to_string).collect();
    let mut table = RawTable::new(name, headers);
    for record in reader.records() {
        let record = record?;
        table.push_row(record.iter().map(str::to_string).collect())?;
    }
    Ok(table)
}

fn format_value(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

pub fn write_matrix_csv(path: &Path, matrix: &FeatureMatrix) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut writer = csv::Writer::from_path(path)?;
    let header = KEY_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(matrix.schema.columns.iter().map(|c| c.name.clone()));
    writer.write_record(header)?;
    for row in &matrix.rows {
        let record = [row.patient_id.to_string(), row.year.to_string(), row.week.to_string()]
            .into_iter()
            .chain(row.values.iter().map(|v| format_value(*v)));
        writer.write_record(record)?;
    }
    writer.flush()?;

    info!(
        component = "store",
        event = "store.write.finish",
        format = "csv",
        path = %path.display(),
        rows = matrix.rows.len(),
        columns = matrix.schema.columns.len()
    );
    Ok(())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_type(dtype: FeatureDType) -> &'static str {
    match dtype {
        FeatureDType::Int => "INTEGER",
        FeatureDType::Float => "REAL",
    }
}

fn sql_value(dtype: FeatureDType, value: Option<f64>) -> Value {
    match (dtype, value) {
        (_, None) => Value::Null,
        (FeatureDType::Int, Some(v)) => Value::Integer(v as i64),
        (FeatureDType::Float, Some(v)) => Value::Real(v),
    }
}

fn open_store(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    conn.execute_batch(
        "
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA temp_store=MEMORY;
        ",
    )?;
    Ok(conn)
}

/// Replaces the feature table and schema metadata in the store at `path`.
pub fn write_matrix_sqlite(path: &Path, matrix: &FeatureMatrix) -> Result<(), StoreError> {
    let mut conn = open_store(path)?;
    let columns = &matrix.schema.columns;

    info!(
        component = "store",
        event = "store.write.start",
        format = "sqlite",
        path = %path.display(),
        rows = matrix.rows.len(),
        columns = columns.len()
    );

    let column_ddl: Vec<String> = columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), sql_type(c.dtype)))
        .collect();
    let create = format!(
        "CREATE TABLE {FEATURES_TABLE} (
            patient_id INTEGER NOT NULL,
            year INTEGER NOT NULL,
            week INTEGER NOT NULL,
            {}{}
            PRIMARY KEY (patient_id, year, week)
        ) WITHOUT ROWID",
        column_ddl.join(",\n            "),
        if column_ddl.is_empty() { "" } else { "," },
    );
    let placeholders: Vec<String> = (1..=KEY_COLUMNS.len() + columns.len())
        .map(|idx| format!("?{idx}"))
        .collect();
    let insert = format!(
        "INSERT INTO {FEATURES_TABLE} VALUES ({})",
        placeholders.join(", ")
    );

    let tx = conn.transaction()?;
    tx.execute_batch(&format!(
        "DROP TABLE IF EXISTS {FEATURES_TABLE};
         DROP TABLE IF EXISTS {SCHEMA_TABLE};
         CREATE TABLE {SCHEMA_TABLE} (key TEXT PRIMARY KEY, value TEXT NOT NULL);"
    ))?;
    tx.execute_batch(&create)?;
    {
        let mut stmt = tx.prepare(&insert)?;
        for row in &matrix.rows {
            let values = [
                Value::Integer(row.patient_id),
                Value::Integer(i64::from(row.year)),
                Value::Integer(i64::from(row.week)),
            ]
            .into_iter()
            .chain(
                columns
                    .iter()
                    .zip(&row.values)
                    .map(|(column, value)| sql_value(column.dtype, *value)),
            );
            stmt.execute(params_from_iter(values))?;
        }

        let mut meta = tx.prepare(&format!("INSERT INTO {SCHEMA_TABLE} (key, value) VALUES (?1, ?2)"))?;
        meta.execute(params!["version", matrix.schema.version.to_string()])?;
        meta.execute(params!["fingerprint", matrix.schema.fingerprint])?;
        meta.execute(params!["columns", serde_json::to_string(columns)?])?;
    }
    tx.commit()?;

    info!(
        component = "store",
        event = "store.write.finish",
        format = "sqlite",
        path = %path.display(),
        rows = matrix.rows.len()
    );
    Ok(())
}

fn schema_entry(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    let value = conn
        .query_row(
            &format!("SELECT value FROM {SCHEMA_TABLE} WHERE key = ?1"),
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

fn schema_table_exists(conn: &Connection) -> Result<bool, StoreError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1 LIMIT 1",
            params![SCHEMA_TABLE],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    Ok(exists)
}

fn read_schema(conn: &Connection, path: &Path) -> Result<FeatureSchema, StoreError> {
    if !schema_table_exists(conn)? {
        return Err(StoreError::MissingSchema(path.to_path_buf()));
    }
    let missing = || StoreError::MissingSchema(path.to_path_buf());

    let raw_version = schema_entry(conn, "version")?.ok_or_else(missing)?;
    let version = raw_version
        .parse::<u32>()
        .map_err(|_| StoreError::InvalidSchemaEntry {
            key: "version".to_string(),
            value: raw_version.clone(),
        })?;
    let fingerprint = schema_entry(conn, "fingerprint")?.ok_or_else(missing)?;
    let columns: Vec<FeatureColumn> = serde_json::from_str(&schema_entry(conn, "columns")?.ok_or_else(missing)?)?;

    Ok(FeatureSchema {
        version,
        fingerprint,
        columns,
    })
}

pub fn read_store_schema(path: &Path) -> Result<FeatureSchema, StoreError> {
    let conn = Connection::open(path)?;
    read_schema(&conn, path)
}

/// Fails when the store was written under a different schema.
pub fn check_store_compatible(path: &Path, expected: &FeatureSchema) -> Result<(), StoreError> {
    let stored = read_store_schema(path)?;
    assert_schema_compatible(expected.version, &expected.fingerprint, &stored)?;
    Ok(())
}

pub fn read_matrix_sqlite(path: &Path) -> Result<FeatureMatrix, StoreError> {
    let conn = Connection::open(path)?;
    let schema = read_schema(&conn, path)?;
    let width = schema.columns.len();

    let mut stmt = conn.prepare(&format!(
        "SELECT * FROM {FEATURES_TABLE} ORDER BY patient_id, year, week"
    ))?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            let value: Option<f64> = row.get(KEY_COLUMNS.len() + idx)?;
            values.push(value);
        }
        out.push(FeatureRow {
            patient_id: row.get(0)?,
            year: row.get(1)?,
            week: row.get(2)?,
            values,
        });
    }

    Ok(FeatureMatrix { schema, rows: out })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PATIENT_TABLE;

    fn matrix() -> FeatureMatrix {
        FeatureMatrix {
            schema: FeatureSchema {
                version: 1,
                fingerprint: "abc123".to_string(),
                columns: vec![FeatureColumn::int("crisis_max"), FeatureColumn::float("severity_max")],
            },
            rows: vec![
                FeatureRow {
                    patient_id: 7,
                    year: 2021,
                    week: 1,
                    values: vec![Some(1.0), Some(2.5)],
                },
                FeatureRow {
                    patient_id: 7,
                    year: 2021,
                    week: 2,
                    values: vec![Some(0.0), None],
                },
            ],
        }
    }

    #[test]
    fn loads_present_tables_and_skips_absent_ones() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join(format!("{PATIENT_TABLE}.csv")),
            "anonymous_pat_id,first_year_month\n7,202101\n8,\n",
        )
        .expect("write csv");

        let tables = load_table_set(dir.path()).expect("load");
        assert_eq!(tables.names(), vec![PATIENT_TABLE]);
        let patients = tables.get(PATIENT_TABLE, "test").expect("patients");
        assert_eq!(patients.len(), 2);
        assert_eq!(patients.cell(&patients.rows()[1], "first_year_month"), None);
    }

    #[test]
    fn missing_data_dir_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = load_table_set(&dir.path().join("absent")).expect_err("missing dir");
        assert!(matches!(err, StoreError::MissingDataDir(_)));
    }

    #[test]
    fn writes_csv_with_keys_and_empty_missing_cells() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out/features.csv");
        write_matrix_csv(&path, &matrix()).expect("write");

        let text = fs::read_to_string(&path).expect("read back");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "patient_id,year,week,crisis_max,severity_max");
        assert_eq!(lines[1], "7,2021,1,1,2.5");
        assert_eq!(lines[2], "7,2021,2,0,");
    }

    #[test]
    fn sqlite_store_keeps_rows_and_schema() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("features.sqlite");
        let expected = matrix();
        write_matrix_sqlite(&path, &expected).expect("write");
        // Rewriting replaces rather than appends.
        write_matrix_sqlite(&path, &expected).expect("rewrite");

        assert_eq!(read_store_schema(&path).expect("schema"), expected.schema);
        assert_eq!(read_matrix_sqlite(&path).expect("matrix"), expected);
        check_store_compatible(&path, &expected.schema).expect("compatible");

        let mut drifted = expected.schema.clone();
        drifted.fingerprint = "other".to_string();
        assert!(matches!(
            check_store_compatible(&path, &drifted),
            Err(StoreError::Incompatible(SchemaCompatibilityError::FingerprintMismatch { .. }))
        ));
    }

    #[test]
    fn store_without_schema_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.sqlite");
        Connection::open(&path).expect("create");
        assert!(matches!(read_store_schema(&path), Err(StoreError::MissingSchema(_))));
    }
}
