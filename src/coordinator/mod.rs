//! Run coordinator: one entry point per trigger, at most one run per
//! pipeline at a time, and a browser session that is always torn down.

pub mod schedule;

use crate::audit::ZeroValueHeuristic;
use crate::browser::chrome::ChromeDriver;
use crate::browser::cleanup::kill_orphaned_browsers;
use crate::browser::Session;
use crate::config::{AppConfig, BrowserSettings, Timing};
use crate::models::{Period, PipelineId};
use crate::pipeline::{Engine, Ibprs, Publikasi, ReportPipeline, RunSummary, Sindikasi};
use crate::queue;
use crate::storage::{RunLedger, RunTotals};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{FixedOffset, NaiveDate, Offset, Utc};
use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

// ── Run registry ──────────────────────────────────────────────────────────────

/// Pipelines currently running. The lock covers only the check-and-set.
#[derive(Debug, Default)]
pub struct RunRegistry {
    running: Mutex<HashSet<PipelineId>>,
}

impl RunRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn running(&self) -> std::sync::MutexGuard<'_, HashSet<PipelineId>> {
        self.running.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Mark `id` running, or `None` if it already is.
    pub fn try_acquire(self: &Arc<Self>, id: PipelineId) -> Option<RunPermit> {
        if !self.running().insert(id) {
            return None;
        }
        Some(RunPermit {
            registry: Arc::clone(self),
            id,
        })
    }

    #[cfg(test)]
    pub fn is_running(&self, id: PipelineId) -> bool {
        self.running().contains(&id)
    }
}

/// Clears the running flag when dropped, however the run ended.
#[derive(Debug)]
pub struct RunPermit {
    registry: Arc<RunRegistry>,
    id: PipelineId,
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.registry.running().remove(&self.id);
        debug!("{} no longer running", self.id);
    }
}

// ── Sessions ──────────────────────────────────────────────────────────────────

#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self) -> Result<Session>;

    /// Called after the session of a run has been closed.
    fn after_close(&self) {}
}

pub struct ChromeLauncher {
    settings: BrowserSettings,
    timing: Timing,
}

impl ChromeLauncher {
    pub fn new(settings: BrowserSettings, timing: Timing) -> Self {
        Self { settings, timing }
    }

    fn sweep(&self) {
        if !self.settings.kill_orphans {
            return;
        }
        let killed = kill_orphaned_browsers(&self.settings.process_names, Some(&self.settings.user_data_dir));
        if killed > 0 {
            info!("Terminated {} leftover browser processes", killed);
        }
    }
}

#[async_trait]
impl SessionLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Session> {
        self.sweep();
        let driver = ChromeDriver::launch(&self.settings).await?;
        Ok(Session::new(Box::new(driver), self.timing))
    }

    fn after_close(&self) {
        self.sweep();
    }
}

// ── Coordinator ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum RunOutcome {
    Completed(Vec<RunSummary>),
    /// The pipeline was already running; nothing was done
    Skipped,
}

enum Job<'a> {
    Full(&'a Path),
    Retry(&'a Path),
}

pub struct Coordinator {
    config: AppConfig,
    registry: Arc<RunRegistry>,
    launcher: Arc<dyn SessionLauncher>,
    ledger: Option<Arc<RunLedger>>,
}

impl Coordinator {
    pub fn new(config: AppConfig, launcher: Arc<dyn SessionLauncher>, ledger: Option<Arc<RunLedger>>) -> Self {
        Self {
            config,
            registry: RunRegistry::new(),
            launcher,
            ledger,
        }
    }

    /// Coordinator driving real Chrome, with the ledger if storage is enabled.
    pub fn from_config(config: AppConfig) -> Self {
        let launcher = ChromeLauncher::new(config.browser.clone(), Timing::from(&config.timing));
        let ledger = if config.storage.enabled {
            match RunLedger::open(&config.storage.db_path) {
                Ok(l) => Some(Arc::new(l)),
                Err(e) => {
                    warn!("Run history disabled: {:#}", e);
                    None
                }
            }
        } else {
            None
        };
        Self::new(config, Arc::new(launcher), ledger)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Today on the configured wall clock.
    pub fn today(&self) -> NaiveDate {
        let offset = FixedOffset::east_opt(self.config.schedule.utc_offset_hours * 3600)
            .unwrap_or_else(|| Utc.fix());
        Utc::now().with_timezone(&offset).date_naive()
    }

    /// Run a pipeline once. `period` overrides the latest published quarter
    /// for the publication report.
    pub async fn run(&self, id: PipelineId, out_dir: &Path, period: Option<Period>) -> Result<RunOutcome> {
        let Some(_permit) = self.registry.try_acquire(id) else {
            info!("{} is already running; skipping this activation", id);
            return Ok(RunOutcome::Skipped);
        };

        match id {
            PipelineId::Publikasi => {
                let period = period.unwrap_or_else(|| Period::target_quarter(self.today()));
                let pipeline = Publikasi::new(self.config.publikasi.clone(), period);
                let summary = self.execute(&pipeline, Job::Full(out_dir)).await?;
                Ok(RunOutcome::Completed(vec![summary]))
            }
            PipelineId::Ibprs => {
                let pipeline = Ibprs::new(self.config.ibprs.clone());
                let summary = self.execute(&pipeline, Job::Full(out_dir)).await?;
                Ok(RunOutcome::Completed(vec![summary]))
            }
            PipelineId::Sindikasi => self.run_queue(out_dir).await.map(RunOutcome::Completed),
        }
    }

    /// Every triggered queue item, one session each. Each trigger is cleared
    /// afterwards whatever happened to its run.
    async fn run_queue(&self, out_dir: &Path) -> Result<Vec<RunSummary>> {
        let cfg = &self.config.sindikasi;
        let items = queue::pending_items(&cfg.queue_dir, &cfg.file_prefix)?;
        if items.is_empty() {
            debug!("No triggered queue items in {:?}", cfg.queue_dir);
            return Ok(vec![]);
        }
        info!("{} queue items to process", items.len());

        let mut summaries = Vec::new();
        let mut failed = Vec::new();
        for item in &items {
            let pipeline = Sindikasi::for_item(cfg.clone(), item);
            match self.execute(&pipeline, Job::Full(out_dir)).await {
                Ok(summary) => summaries.push(summary),
                Err(e) => {
                    error!("Queue item {:?} failed: {:#}", item.path, e);
                    failed.push(item.name.clone());
                }
            }
            if let Err(e) = queue::clear_trigger(&item.path) {
                error!("Could not clear trigger in {:?}: {:#}", item.path, e);
            }
        }

        if !failed.is_empty() {
            bail!("{} of {} queue items failed: {}", failed.len(), items.len(), failed.join(", "));
        }
        Ok(summaries)
    }

    /// Audit an existing artifact and retry its suspects.
    pub async fn retry_artifact(&self, id: PipelineId, path: &Path) -> Result<RunOutcome> {
        let Some(_permit) = self.registry.try_acquire(id) else {
            info!("{} is already running; not retrying {:?}", id, path);
            return Ok(RunOutcome::Skipped);
        };
        let pipeline = pipeline_for_artifact(&self.config, id, path)?;
        let summary = self.execute(pipeline.as_ref(), Job::Retry(path)).await?;
        Ok(RunOutcome::Completed(vec![summary]))
    }

    /// One session around one job; the session is closed on every path out.
    async fn execute(&self, pipeline: &dyn ReportPipeline, job: Job<'_>) -> Result<RunSummary> {
        let ledger = self.ledger.as_deref();
        let run_id = ledger.and_then(|l| l.begin(pipeline.id()));

        let session = match self.launcher.launch().await {
            Ok(s) => s,
            Err(e) => {
                let e = e.context("browser session did not start");
                if let Some(l) = ledger {
                    l.finish(run_id, &RunTotals::default(), Some(&format!("{:#}", e)));
                }
                return Err(e);
            }
        };

        let outcome = AssertUnwindSafe(async {
            let engine = Engine::new(&session, pipeline, &ZeroValueHeuristic).with_ledger(ledger, run_id);
            match job {
                Job::Full(dir) => engine.run_full(dir).await,
                Job::Retry(path) => engine.retry_artifact(path).await,
            }
        })
        .catch_unwind()
        .await;

        session.close().await;
        self.launcher.after_close();

        let result = match outcome {
            Ok(r) => r,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(anyhow!("{} run panicked: {}", pipeline.id(), msg))
            }
        };

        if let Some(l) = ledger {
            match &result {
                Ok(summary) => l.finish(run_id, &summary.totals(), None),
                Err(e) => l.finish(run_id, &RunTotals::default(), Some(&format!("{:#}", e))),
            }
        }
        result
    }
}

/// Pipeline that produced the artifact at `path`, reconstructed from its name.
pub fn pipeline_for_artifact(config: &AppConfig, id: PipelineId, path: &Path) -> Result<Box<dyn ReportPipeline>> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Bad artifact path {:?}", path))?;

    match id {
        PipelineId::Ibprs => Ok(Box::new(Ibprs::new(config.ibprs.clone()))),
        PipelineId::Publikasi => {
            let period = Period::from_artifact_name(file_name)
                .with_context(|| format!("{:?} does not end in _MM_YYYY.csv", file_name))?;
            Ok(Box::new(Publikasi::new(config.publikasi.clone(), period)))
        }
        PipelineId::Sindikasi => {
            let period = Period::from_artifact_name(file_name)
                .with_context(|| format!("{:?} does not end in _MM_YYYY.csv", file_name))?;
            let stem = file_name.rsplit_once('.').map(|(s, _)| s).unwrap_or(file_name);
            let name = stem
                .strip_prefix("Sindikasi_")
                .and_then(|s| s.strip_suffix(&format!("_{}", period.tag())))
                .with_context(|| format!("{:?} is not a Sindikasi_<name>_MM_YYYY.csv name", file_name))?;
            Ok(Box::new(Sindikasi::for_artifact(config.sindikasi.clone(), name, period)))
        }
    }
}

/// Artifact directory: the explicit one, else the configured one.
pub fn output_dir(config: &AppConfig, explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| config.output.dir.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fake::{FakeDriver, FakeLauncher, report_html, test_form};
    use crate::config::PublikasiConfig;

    fn config(queue_dir: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.publikasi = PublikasiConfig {
            url: "https://cfs.example/Report.aspx".into(),
            provinces: vec!["Bali".into()],
            form: test_form(),
            ..Default::default()
        };
        config.sindikasi.url_konvensional = "https://cfs.example/Report.aspx?BankTypeCode=BPK".into();
        config.sindikasi.url_syariah = "https://cfs.example/Report.aspx?BankTypeCode=BPS".into();
        config.sindikasi.form = test_form();
        config.sindikasi.queue_dir = queue_dir.to_path_buf();
        config
    }

    fn coordinator(config: AppConfig, launcher: &Arc<FakeLauncher>) -> Coordinator {
        Coordinator::new(config, launcher.clone(), Some(Arc::new(RunLedger::in_memory().unwrap())))
    }

    #[test]
    fn test_permit_release_on_drop() {
        let registry = RunRegistry::new();
        let permit = registry.try_acquire(PipelineId::Ibprs).unwrap();
        assert!(registry.try_acquire(PipelineId::Ibprs).is_none());
        assert!(registry.try_acquire(PipelineId::Publikasi).is_some());
        drop(permit);
        assert!(!registry.is_running(PipelineId::Ibprs));
    }

    #[tokio::test]
    async fn test_reentrant_run_is_skipped_without_a_session() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new(FakeDriver::with_form()));
        let c = coordinator(config(dir.path()), &launcher);

        let _held = c.registry.try_acquire(PipelineId::Publikasi).unwrap();
        let outcome = c.run(PipelineId::Publikasi, dir.path(), None).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Skipped));
        assert_eq!(launcher.launches(), 0);
    }

    #[tokio::test]
    async fn test_run_writes_artifact_and_closes_session() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FakeDriver::with_form();
        driver.add_bank("Bali", "Kab. Badung", "PT BPR Kuta");
        driver.set_report("PT BPR Kuta", vec![report_html(&[["Kas", "4", "3"]])]);
        let launcher = Arc::new(FakeLauncher::new(driver.clone()));
        let c = coordinator(config(dir.path()), &launcher);

        let period = Period::new(9, 2024);
        let RunOutcome::Completed(summaries) = c.run(PipelineId::Publikasi, dir.path(), period).await.unwrap() else {
            panic!("run was skipped");
        };
        assert!(summaries[0].artifact.ends_with("Publikasi_09_2024.csv"));
        assert!(summaries[0].artifact.exists());
        assert_eq!(driver.close_count(), 1);
        assert!(!c.registry.is_running(PipelineId::Publikasi));

        let runs = c.ledger.as_ref().unwrap().recent(5).unwrap();
        assert_eq!(runs[0].status, "success");
        assert_eq!(runs[0].rows_written, 1);
    }

    #[tokio::test]
    async fn test_failed_queue_item_still_clears_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sindikasi_Riau_05_02_2025.txt");
        std::fs::write(&path, "SCRAPE = TRUE\nNAME = Riau\nPT BPR Lestari Pekanbaru\n").unwrap();

        let driver = FakeDriver::with_form();
        driver.fail_navigation();
        let launcher = Arc::new(FakeLauncher::new(driver.clone()));
        let c = coordinator(config(dir.path()), &launcher);

        // every bank search fails, so discovery finds nothing and the run
        // still completes with an empty artifact
        let outcome = c.run(PipelineId::Sindikasi, dir.path(), None).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed(ref s) if s.len() == 1));
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("SCRAPE = FALSE\n"));
        assert_eq!(driver.close_count(), 1);

        // nothing left to do on the next activation
        let outcome = c.run(PipelineId::Sindikasi, dir.path(), None).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed(ref s) if s.is_empty()));
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test]
    async fn test_launch_failure_is_a_failed_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sindikasi_Riau_05_02_2025.txt");
        std::fs::write(&path, "SCRAPE = TRUE\nNAME = Riau\nPT BPR Lestari Pekanbaru\n").unwrap();
        let launcher = Arc::new(FakeLauncher::failing());
        let c = coordinator(config(dir.path()), &launcher);

        let err = c.run(PipelineId::Sindikasi, dir.path(), None).await.unwrap_err();
        assert!(err.to_string().contains("1 of 1 queue items failed"));
        assert!(std::fs::read_to_string(&path).unwrap().starts_with("SCRAPE = FALSE"));
        assert!(!c.registry.is_running(PipelineId::Sindikasi));
        assert_eq!(c.ledger.as_ref().unwrap().recent(1).unwrap()[0].status, "error");
    }

    #[test]
    fn test_pipeline_from_artifact_name() {
        let config = AppConfig::default();
        let p = pipeline_for_artifact(&config, PipelineId::Sindikasi, Path::new("out/Sindikasi_Kelompok Riau_12_2024.csv")).unwrap();
        assert_eq!(p.artifact_name(), "Sindikasi_Kelompok Riau_12_2024.csv");
        let p = pipeline_for_artifact(&config, PipelineId::Publikasi, Path::new("Publikasi_03_2025.csv")).unwrap();
        assert_eq!(p.artifact_name(), "Publikasi_03_2025.csv");
        assert!(pipeline_for_artifact(&config, PipelineId::Publikasi, Path::new("IBPRS.csv")).is_err());
    }
}
