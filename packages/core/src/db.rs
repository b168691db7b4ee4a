//! SQLite pool creation and schema migrations.
//!
//! Migrations are applied in two levels. [`SchemaLevel::Basic`] creates the
//! tables with the basic exam columns; [`SchemaLevel::Extended`] adds the
//! extended exam columns. Deployments that have not yet run the extended
//! migration keep working through the sync engine's basic-tier fallback.

use std::collections::HashSet;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::schema::EXTENDED_COLUMNS;

/// How far the schema migrations should be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaLevel {
    Basic,
    Extended,
}

impl FromStr for SchemaLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(SchemaLevel::Basic),
            "extended" => Ok(SchemaLevel::Extended),
            other => Err(format!("Invalid schema level: {}", other)),
        }
    }
}

const BASIC_MIGRATION: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS patients (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        external_id TEXT UNIQUE,
        name TEXT NOT NULL,
        weight_kg REAL,
        height_cm REAL,
        therapy_sessions_used INTEGER,
        therapy_sessions_prescribed INTEGER,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS exams (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        external_id TEXT NOT NULL UNIQUE,
        exam_key TEXT,
        patient_id INTEGER REFERENCES patients(id),
        patient_external_id TEXT,
        exam_type TEXT NOT NULL,
        status TEXT NOT NULL,
        exam_date TEXT NOT NULL,
        weight_kg REAL,
        height_cm REAL,
        bmi REAL,
        apnea_index REAL,
        apnea_category TEXT,
        spo2_min REAL,
        spo2_avg REAL,
        spo2_max REAL,
        snoring_score REAL,
        content_hash TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_exams_patient_date ON exams (patient_id, exam_type, exam_date)",
    "CREATE TABLE IF NOT EXISTS alerts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        alert_type TEXT NOT NULL,
        urgency TEXT NOT NULL,
        title TEXT NOT NULL,
        message TEXT NOT NULL,
        patient_id INTEGER,
        exam_id INTEGER,
        rule_key TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        payload TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        resolved_at TEXT,
        resolved_by TEXT
    )",
    // At most one pending alert per (rule, patient, exam).
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_alerts_pending_unique
        ON alerts (rule_key, COALESCE(patient_id, 0), COALESCE(exam_id, 0))
        WHERE status = 'pending'",
    "CREATE INDEX IF NOT EXISTS idx_alerts_status_resolved ON alerts (status, resolved_at)",
];

/// Open a pool and apply every migration.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    create_pool_with_schema(database_url, SchemaLevel::Extended).await
}

/// Open a pool and apply migrations up to `level`.
pub async fn create_pool_with_schema(
    database_url: &str,
    level: SchemaLevel,
) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    // Each connection to `:memory:` is its own database, so keep exactly one
    // alive for the lifetime of the pool.
    let in_memory = database_url.contains(":memory:");
    let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
    if in_memory {
        pool_options = pool_options.idle_timeout(None).max_lifetime(None);
    }

    let pool = pool_options.connect_with(options).await?;

    migrate(&pool, level).await?;
    Ok(pool)
}

/// Apply migrations up to `level`. Safe to run repeatedly.
pub async fn migrate(pool: &SqlitePool, level: SchemaLevel) -> Result<(), sqlx::Error> {
    for statement in BASIC_MIGRATION {
        sqlx::query(statement).execute(pool).await?;
    }

    if level == SchemaLevel::Extended {
        let existing = exam_columns(pool).await?;
        for (name, sql_type) in EXTENDED_COLUMNS {
            if existing.contains(*name) {
                continue;
            }
            let statement = format!("ALTER TABLE exams ADD COLUMN {} {}", name, sql_type);
            sqlx::query(&statement).execute(pool).await?;
        }
    }

    tracing::debug!("Schema migrated to {:?} level", level);
    Ok(())
}

/// Names of the columns currently present on the `exams` table.
pub async fn exam_columns(pool: &SqlitePool) -> Result<HashSet<String>, sqlx::Error> {
    let rows = sqlx::query("PRAGMA table_info(exams)").fetch_all(pool).await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| row.try_get::<String, _>("name").ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn basic_level_has_no_extended_columns() {
        let pool = create_pool_with_schema("sqlite::memory:", SchemaLevel::Basic)
            .await
            .unwrap();
        let columns = exam_columns(&pool).await.unwrap();
        assert!(columns.contains("apnea_index"));
        assert!(!columns.contains("hr_min"));
    }

    #[tokio::test]
    async fn extended_level_adds_columns_and_is_idempotent() {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        migrate(&pool, SchemaLevel::Extended).await.unwrap();

        let columns = exam_columns(&pool).await.unwrap();
        for (name, _) in EXTENDED_COLUMNS {
            assert!(columns.contains(*name), "missing {}", name);
        }
    }

    #[test]
    fn schema_level_parses() {
        assert_eq!("basic".parse::<SchemaLevel>().unwrap(), SchemaLevel::Basic);
        assert_eq!("extended".parse::<SchemaLevel>().unwrap(), SchemaLevel::Extended);
        assert!("full".parse::<SchemaLevel>().is_err());
    }
}
