//! Run history in DuckDB: one row per coordinator run, one per entity outcome.
//!
//! This is an audit trail only. Nothing reads it back to decide what to
//! scrape, and a ledger failure never fails a run.

use crate::models::PipelineId;
use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};
use duckdb::{Connection, params};
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE SEQUENCE IF NOT EXISTS scrape_runs_id_seq START 1;

CREATE TABLE IF NOT EXISTS scrape_runs (
    id              BIGINT PRIMARY KEY DEFAULT nextval('scrape_runs_id_seq'),
    pipeline        VARCHAR NOT NULL,
    started_at      TIMESTAMP NOT NULL,
    finished_at     TIMESTAMP,
    status          VARCHAR NOT NULL DEFAULT 'running',
    entities        INTEGER DEFAULT 0,
    rows_written    INTEGER DEFAULT 0,
    suspects        INTEGER DEFAULT 0,
    still_suspect   INTEGER DEFAULT 0,
    artifact        VARCHAR,
    error_msg       VARCHAR
);

CREATE TABLE IF NOT EXISTS extraction_log (
    run_id      BIGINT NOT NULL,
    entity      VARCHAR NOT NULL,
    stage       VARCHAR NOT NULL,
    outcome     VARCHAR NOT NULL,
    rows        INTEGER NOT NULL DEFAULT 0,
    detail      VARCHAR,
    logged_at   TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_runs_pipeline ON scrape_runs (pipeline);
CREATE INDEX IF NOT EXISTS idx_log_run       ON extraction_log (run_id);
"#;

/// Counters written when a run finishes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunTotals {
    pub entities: usize,
    pub rows_written: usize,
    pub suspects: usize,
    pub still_suspect: usize,
    pub artifact: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunRow {
    pub id: i64,
    pub pipeline: String,
    pub started_at: NaiveDateTime,
    pub finished_at: Option<NaiveDateTime>,
    pub status: String,
    pub entities: i64,
    pub rows_written: i64,
    pub suspects: i64,
    pub still_suspect: i64,
    pub artifact: Option<String>,
    pub error_msg: Option<String>,
}

// ── Repository ────────────────────────────────────────────────────────────────

pub struct Repository {
    conn: Connection,
}

impl Repository {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB at {:?}", path))?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    pub fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(DDL).context("DDL failed")?;
        self.conn.execute_batch(INDEXES).context("Index creation failed")?;
        self.conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Utc::now().naive_utc()],
        )?;
        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────────────

    pub fn begin_run(&self, pipeline: PipelineId) -> Result<i64> {
        let id: i64 = self.conn.query_row(
            "INSERT INTO scrape_runs (pipeline, started_at, status) VALUES (?, ?, 'running') RETURNING id",
            params![pipeline.as_str(), Utc::now().naive_utc()],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn finish_run(&self, run_id: i64, totals: &RunTotals, error: Option<&str>) -> Result<()> {
        self.conn.execute(
            r#"UPDATE scrape_runs SET
               finished_at = ?, status = ?,
               entities = ?, rows_written = ?, suspects = ?, still_suspect = ?,
               artifact = ?, error_msg = ?
               WHERE id = ?"#,
            params![
                Utc::now().naive_utc(),
                if error.is_none() { "success" } else { "error" },
                totals.entities as i64,
                totals.rows_written as i64,
                totals.suspects as i64,
                totals.still_suspect as i64,
                totals.artifact,
                error,
                run_id,
            ],
        )?;
        Ok(())
    }

    pub fn log_outcome(
        &self,
        run_id: i64,
        entity: &str,
        stage: &str,
        outcome: &str,
        rows: usize,
        detail: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            r#"INSERT INTO extraction_log (run_id, entity, stage, outcome, rows, detail, logged_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
            params![run_id, entity, stage, outcome, rows as i64, detail, Utc::now().naive_utc()],
        )?;
        Ok(())
    }

    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunRow>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT id, pipeline, started_at, finished_at, status,
                      entities, rows_written, suspects, still_suspect, artifact, error_msg
               FROM scrape_runs ORDER BY id DESC LIMIT ?"#,
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |r| {
                Ok(RunRow {
                    id: r.get(0)?,
                    pipeline: r.get(1)?,
                    started_at: r.get(2)?,
                    finished_at: r.get(3)?,
                    status: r.get(4)?,
                    entities: r.get::<_, Option<i64>>(5)?.unwrap_or(0),
                    rows_written: r.get::<_, Option<i64>>(6)?.unwrap_or(0),
                    suspects: r.get::<_, Option<i64>>(7)?.unwrap_or(0),
                    still_suspect: r.get::<_, Option<i64>>(8)?.unwrap_or(0),
                    artifact: r.get(9)?,
                    error_msg: r.get(10)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Outcome → count for one run.
    pub fn outcome_counts(&self, run_id: i64) -> Result<Vec<(String, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT outcome, COUNT(*) FROM extraction_log WHERE run_id = ? GROUP BY outcome ORDER BY outcome",
        )?;
        let counts = stmt
            .query_map(params![run_id], |r| Ok((r.get(0)?, r.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(counts)
    }
}

// ── Shared ledger ─────────────────────────────────────────────────────────────

/// Thread-safe front of the repository whose writes never fail the caller.
pub struct RunLedger {
    repo: Mutex<Repository>,
}

impl RunLedger {
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::open(path)?;
        repo.run_migrations()?;
        info!("Run ledger at {:?}", path);
        Ok(Self::from_repository(repo))
    }

    /// Throwaway ledger, migrated and ready.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let repo = Repository::open_in_memory()?;
        repo.run_migrations()?;
        Ok(Self::from_repository(repo))
    }

    pub fn from_repository(repo: Repository) -> Self {
        Self { repo: Mutex::new(repo) }
    }

    fn with<T>(&self, what: &str, f: impl FnOnce(&Repository) -> Result<T>) -> Option<T> {
        match f(&self.repo()) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Run ledger {} failed: {:#}", what, e);
                None
            }
        }
    }

    pub fn begin(&self, pipeline: PipelineId) -> Option<i64> {
        self.with("begin", |r| r.begin_run(pipeline))
    }

    pub fn finish(&self, run_id: Option<i64>, totals: &RunTotals, error: Option<&str>) {
        if let Some(id) = run_id {
            self.with("finish", |r| r.finish_run(id, totals, error));
        }
    }

    pub fn outcome(&self, run_id: Option<i64>, entity: &str, stage: &str, outcome: &str, rows: usize, detail: Option<&str>) {
        if let Some(id) = run_id {
            self.with("log", |r| r.log_outcome(id, entity, stage, outcome, rows, detail));
        }
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<RunRow>> {
        self.repo().recent_runs(limit)
    }

    pub fn outcomes(&self, run_id: i64) -> Result<Vec<(String, i64)>> {
        self.repo().outcome_counts(run_id)
    }

    fn repo(&self) -> std::sync::MutexGuard<'_, Repository> {
        self.repo.lock().unwrap_or_else(|p| p.into_inner())
    }
}
