//! Report pipelines and the engine they share.
//!
//! A pipeline only says *what* to scrape: which entities exist, the filter
//! sequence reaching each one, and the artifact layout. The [`Engine`] does
//! the rest for every pipeline alike:
//!
//!   1. enumerate entities
//!   2. drive the form once per entity, collecting rows
//!   3. write the artifact
//!   4. audit the written artifact for zero/missing values
//!   5. re-scrape suspects once and regenerate the artifact
//!
//! Per-entity failures are logged and skipped; only a failure to enumerate
//! or to write the artifact fails the run.

pub mod ibprs;
pub mod publikasi;
pub mod sindikasi;

use crate::artifact::OutputSchema;
use crate::audit::{self, ValueHeuristic};
use crate::browser::Session;
use crate::config::FormConfig;
use crate::models::{ExtractionResult, PipelineId, ReportEntity, ResultSet, RowRecord};
use crate::scraper::Sequencer;
use crate::storage::{RunLedger, RunTotals};
use crate::utils::Timer;
use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub use self::ibprs::Ibprs;
pub use self::publikasi::Publikasi;
pub use self::sindikasi::Sindikasi;

use crate::models::FilterSequence;

/// Entities found by a pipeline, plus any rows already read while finding them.
#[derive(Debug, Default)]
pub struct Discovered {
    pub entities: Vec<ReportEntity>,
    pub prefetched: ResultSet,
}

#[async_trait]
pub trait ReportPipeline: Send + Sync {
    fn id(&self) -> PipelineId;
    fn form(&self) -> &FormConfig;
    fn output_schema(&self) -> &OutputSchema;
    fn artifact_name(&self) -> String;

    fn max_pages(&self) -> usize {
        1
    }

    async fn enumerate_entities(&self, session: &Session) -> Result<Discovered>;

    fn filter_sequence_for(&self, entity: &ReportEntity) -> FilterSequence;

    /// Entity named by a raw row, for result pages listing many entities.
    fn entity_of_row(&self, _row: &RowRecord) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub pipeline: Option<PipelineId>,
    pub artifact: PathBuf,
    pub entities: usize,
    pub rows: usize,
    pub no_data: usize,
    pub failures: usize,
    pub suspects: usize,
    pub still_suspect: usize,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn totals(&self) -> RunTotals {
        RunTotals {
            entities: self.entities,
            rows_written: self.rows,
            suspects: self.suspects,
            still_suspect: self.still_suspect,
            artifact: Some(self.artifact.display().to_string()),
        }
    }
}

pub struct Engine<'a> {
    session: &'a Session,
    pipeline: &'a dyn ReportPipeline,
    heuristic: &'a dyn ValueHeuristic,
    ledger: Option<&'a RunLedger>,
    run_id: Option<i64>,
}

impl<'a> Engine<'a> {
    pub fn new(session: &'a Session, pipeline: &'a dyn ReportPipeline, heuristic: &'a dyn ValueHeuristic) -> Self {
        Self {
            session,
            pipeline,
            heuristic,
            ledger: None,
            run_id: None,
        }
    }

    pub fn with_ledger(mut self, ledger: Option<&'a RunLedger>, run_id: Option<i64>) -> Self {
        self.ledger = ledger;
        self.run_id = run_id;
        self
    }

    pub fn pipeline(&self) -> &dyn ReportPipeline {
        self.pipeline
    }

    pub fn heuristic(&self) -> &dyn ValueHeuristic {
        self.heuristic
    }

    fn record(&self, entity: &str, stage: &str, outcome: &str, rows: usize, detail: Option<&str>) {
        if let Some(ledger) = self.ledger {
            ledger.outcome(self.run_id, entity, stage, outcome, rows, detail);
        }
    }

    /// Drive the form to one entity's results. `None` when the form itself
    /// failed (already logged); extraction outcomes come back as values.
    pub async fn scrape_entity(&self, entity: &ReportEntity, stage: &str) -> Option<ExtractionResult> {
        let seq = self.pipeline.filter_sequence_for(entity);
        let mut sequencer = Sequencer::new(self.session, self.pipeline.form());

        let result = match sequencer.run(&seq, self.pipeline.max_pages()).await {
            Ok(r) => r,
            Err(e) => {
                warn!("{} [{}]: form failed at {:?}: {}", entity.name, stage, sequencer.state().stage(), e);
                debug!("{} [{}]: {:?}", entity.name, stage, e);
                self.record(&entity.name, stage, "error", 0, Some(&e.to_string()));
                return None;
            }
        };

        let result = match (result, &seq.keep_rows_for) {
            (ExtractionResult::Success(rows), Some(wanted)) => {
                let rows: Vec<RowRecord> = rows
                    .into_iter()
                    .filter(|r| {
                        self.pipeline
                            .entity_of_row(r)
                            .is_some_and(|n| n.eq_ignore_ascii_case(wanted.trim()))
                    })
                    .collect();
                if rows.is_empty() {
                    ExtractionResult::NoData(format!("{wanted} not listed in results"))
                } else {
                    ExtractionResult::Success(rows)
                }
            }
            (other, _) => other,
        };

        let detail = match &result {
            ExtractionResult::Success(rows) => {
                debug!("{} [{}]: {} rows", entity.name, stage, rows.len());
                None
            }
            ExtractionResult::NoData(reason) => {
                info!("{} [{}]: no data ({})", entity.name, stage, reason);
                Some(reason.as_str())
            }
            ExtractionResult::TransientFailure(reason) => {
                warn!("{} [{}]: extraction failed: {}", entity.name, stage, reason);
                Some(reason.as_str())
            }
        };
        self.record(&entity.name, stage, result.kind(), result.row_count(), detail);
        Some(result)
    }

    /// Enumerate and scrape every entity into a fresh result set. Entities
    /// whose form or extraction failed come back separately for the retry pass.
    pub async fn scrape(&self, summary: &mut RunSummary) -> Result<(ResultSet, Vec<ReportEntity>)> {
        let Discovered { entities, prefetched } = self.pipeline.enumerate_entities(self.session).await?;
        let mut results = prefetched;
        for group in results.iter() {
            self.record(&group.entity.name, "discover", "success", group.rows.len(), None);
        }
        info!(
            "{}: {} entities to scrape, {} already read",
            self.pipeline.id(),
            entities.iter().filter(|e| !results.contains(e)).count(),
            results.len()
        );

        summary.entities = entities.len().max(results.len());
        let mut failed = Vec::new();
        for entity in entities {
            if results.contains(&entity) {
                continue;
            }
            match self.scrape_entity(&entity, "scrape").await {
                Some(ExtractionResult::Success(rows)) => results.insert(entity, rows),
                Some(ExtractionResult::NoData(_)) => summary.no_data += 1,
                Some(ExtractionResult::TransientFailure(_)) | None => failed.push(entity),
            }
        }
        summary.failures = failed.len();
        Ok((results, failed))
    }

    /// Audit `path`, retry its suspects and the `failed` entities once and
    /// regenerate it from `results`.
    async fn audit_and_retry(
        &self,
        path: &Path,
        results: &mut ResultSet,
        failed: &[ReportEntity],
        summary: &mut RunSummary,
    ) -> Result<()> {
        let schema = self.pipeline.output_schema();
        let suspects = audit::audit_artifact(path, schema, self.heuristic)?;
        summary.suspects = suspects.len();
        if suspects.is_empty() && failed.is_empty() {
            info!("{}: no suspect entities", self.pipeline.id());
            return Ok(());
        }

        info!(
            "{}: {} suspect and {} failed entities, retrying once",
            self.pipeline.id(),
            suspects.len(),
            failed.len()
        );
        let report = audit::retry(self, &suspects, failed, results).await;
        summary.still_suspect = report.still_suspect.len();
        summary.failures = report.still_failing.len();
        info!(
            "{}: retried {}, replaced {}, still suspect {}, still failing {}",
            self.pipeline.id(),
            report.attempted,
            report.replaced,
            report.still_suspect.len(),
            report.still_failing.len()
        );
        schema.write(path, results)?;
        Ok(())
    }

    /// Scrape, write, audit, retry, rewrite.
    pub async fn run_full(&self, out_dir: &Path) -> Result<RunSummary> {
        let timer = Timer::start(format!("{} run", self.pipeline.id()));
        let mut summary = RunSummary {
            pipeline: Some(self.pipeline.id()),
            artifact: out_dir.join(self.pipeline.artifact_name()),
            ..Default::default()
        };

        let (mut results, failed) = self.scrape(&mut summary).await?;
        self.pipeline.output_schema().write(&summary.artifact, &results)?;
        self.audit_and_retry(&summary.artifact.clone(), &mut results, &failed, &mut summary)
            .await?;

        summary.rows = results.total_rows();
        summary.elapsed = timer.elapsed();
        Ok(summary)
    }

    /// Audit and retry an artifact written by an earlier run.
    pub async fn retry_artifact(&self, path: &Path) -> Result<RunSummary> {
        let timer = Timer::start(format!("{} retry of {:?}", self.pipeline.id(), path));
        let mut results = self.pipeline.output_schema().load_results(path)?;
        let mut summary = RunSummary {
            pipeline: Some(self.pipeline.id()),
            artifact: path.to_path_buf(),
            entities: results.len(),
            ..Default::default()
        };

        self.audit_and_retry(path, &mut results, &[], &mut summary).await?;
        summary.rows = results.total_rows();
        summary.elapsed = timer.elapsed();
        Ok(summary)
    }
}
