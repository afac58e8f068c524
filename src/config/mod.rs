pub mod forms;

use crate::models::PipelineId;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub use self::forms::{By, ControlKind, ControlLocator, ControlSpec, FormConfig, Strategy};

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub browser: BrowserSettings,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub publikasi: PublikasiConfig,
    #[serde(default)]
    pub sindikasi: SindikasiConfig,
    #[serde(default)]
    pub ibprs: IbprsConfig,
}

/// Browser process settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrowserSettings {
    /// Falls back to `CHROME_EXECUTABLE`, then PATH, then well-known paths
    #[serde(default)]
    pub executable: Option<String>,

    #[serde(default = "default_true")]
    pub headless: bool,

    #[serde(default = "default_window_width")]
    pub window_width: u32,

    #[serde(default = "default_window_height")]
    pub window_height: u32,

    #[serde(default = "default_user_data_dir")]
    pub user_data_dir: PathBuf,

    /// Kill leftover browser processes before and after each run
    #[serde(default = "default_true")]
    pub kill_orphans: bool,

    #[serde(default = "default_process_names")]
    pub process_names: Vec<String>,
}

/// Waits and politeness delays
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimingConfig {
    #[serde(default = "default_element_timeout_secs")]
    pub element_timeout_secs: u64,

    #[serde(default = "default_postback_timeout_secs")]
    pub postback_timeout_secs: u64,

    #[serde(default = "default_staleness_timeout_secs")]
    pub staleness_timeout_secs: u64,

    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_locate_retries")]
    pub locate_retries: usize,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

/// Run-history ledger
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_jobs")]
    pub jobs: Vec<ScheduledJob>,

    #[serde(default = "default_queue_poll_secs")]
    pub queue_poll_secs: u64,

    /// Offset of the wall clock the job times are written in (WIB = +7)
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,
}

/// A weekly trigger, e.g. `{ pipeline = "publikasi", weekday = "tue", at = "15:00" }`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScheduledJob {
    pub pipeline: PipelineId,
    pub weekday: String,
    pub at: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PublikasiConfig {
    #[serde(default = "default_publikasi_url")]
    pub url: String,

    #[serde(default = "default_publikasi_tab")]
    pub tab: String,

    /// Empty means every province the form offers
    #[serde(default)]
    pub provinces: Vec<String>,

    #[serde(default = "default_konvensional_reports")]
    pub report_types: Vec<usize>,

    #[serde(default = "forms::cfs_report_form")]
    pub form: FormConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SindikasiConfig {
    #[serde(default = "default_publikasi_url")]
    pub url_konvensional: String,

    #[serde(default = "default_syariah_url")]
    pub url_syariah: String,

    #[serde(default = "default_konvensional_reports")]
    pub reports_konvensional: Vec<usize>,

    #[serde(default = "default_syariah_reports")]
    pub reports_syariah: Vec<usize>,

    #[serde(default = "default_queue_dir")]
    pub queue_dir: PathBuf,

    #[serde(default = "default_queue_prefix")]
    pub file_prefix: String,

    #[serde(default = "forms::cfs_report_form")]
    pub form: FormConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IbprsConfig {
    #[serde(default = "default_ibprs_url")]
    pub url: String,

    #[serde(default = "default_ibprs_provinces")]
    pub provinces: Vec<String>,

    #[serde(default = "default_max_pages")]
    pub max_pages: usize,

    #[serde(default = "forms::ibprs_form")]
    pub form: FormConfig,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}
fn default_window_width() -> u32 {
    1920
}
fn default_window_height() -> u32 {
    1080
}
fn default_user_data_dir() -> PathBuf {
    std::env::temp_dir().join("ojk-report-scraper-profile")
}
fn default_process_names() -> Vec<String> {
    ["chrome", "chromium", "chromium-browser", "google-chrome", "chromedriver"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_element_timeout_secs() -> u64 {
    30
}
fn default_postback_timeout_secs() -> u64 {
    30
}
fn default_staleness_timeout_secs() -> u64 {
    10
}
fn default_settle_delay_ms() -> u64 {
    3000
}
fn default_jitter_ms() -> u64 {
    1000
}
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_locate_retries() -> usize {
    3
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/ojk_runs.duckdb")
}
fn default_jobs() -> Vec<ScheduledJob> {
    ["tue", "thu"]
        .iter()
        .map(|day| ScheduledJob {
            pipeline: PipelineId::Publikasi,
            weekday: day.to_string(),
            at: "15:00".to_string(),
        })
        .collect()
}
fn default_queue_poll_secs() -> u64 {
    60
}
fn default_utc_offset_hours() -> i32 {
    7
}
fn default_publikasi_url() -> String {
    "https://cfs.ojk.go.id/cfs/Report.aspx?BankTypeCode=BPK&BankTypeName=BPR%20Konvensional"
        .to_string()
}
fn default_syariah_url() -> String {
    "https://cfs.ojk.go.id/cfs/Report.aspx?BankTypeCode=BPS&BankTypeName=BPR%20Syariah".to_string()
}
fn default_publikasi_tab() -> String {
    "BPR Konvensional".to_string()
}
fn default_konvensional_reports() -> Vec<usize> {
    vec![0, 1, 2]
}
fn default_syariah_reports() -> Vec<usize> {
    vec![0, 1, 3]
}
fn default_queue_dir() -> PathBuf {
    PathBuf::from("queue")
}
fn default_queue_prefix() -> String {
    "sindikasi".to_string()
}
fn default_ibprs_url() -> String {
    "https://ibpr-s.ojk.go.id/DataKeuangan".to_string()
}
fn default_ibprs_provinces() -> Vec<String> {
    vec!["Kep. Riau".to_string()]
}
fn default_max_pages() -> usize {
    200
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            executable: None,
            headless: true,
            window_width: default_window_width(),
            window_height: default_window_height(),
            user_data_dir: default_user_data_dir(),
            kill_orphans: true,
            process_names: default_process_names(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            element_timeout_secs: default_element_timeout_secs(),
            postback_timeout_secs: default_postback_timeout_secs(),
            staleness_timeout_secs: default_staleness_timeout_secs(),
            settle_delay_ms: default_settle_delay_ms(),
            jitter_ms: default_jitter_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            locate_retries: default_locate_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { dir: default_output_dir() }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            enabled: true,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            queue_poll_secs: default_queue_poll_secs(),
            utc_offset_hours: default_utc_offset_hours(),
        }
    }
}

impl Default for PublikasiConfig {
    fn default() -> Self {
        Self {
            url: default_publikasi_url(),
            tab: default_publikasi_tab(),
            provinces: Vec::new(),
            report_types: default_konvensional_reports(),
            form: forms::cfs_report_form(),
        }
    }
}

impl Default for SindikasiConfig {
    fn default() -> Self {
        Self {
            url_konvensional: default_publikasi_url(),
            url_syariah: default_syariah_url(),
            reports_konvensional: default_konvensional_reports(),
            reports_syariah: default_syariah_reports(),
            queue_dir: default_queue_dir(),
            file_prefix: default_queue_prefix(),
            form: forms::cfs_report_form(),
        }
    }
}

impl Default for IbprsConfig {
    fn default() -> Self {
        Self {
            url: default_ibprs_url(),
            provinces: default_ibprs_provinces(),
            max_pages: default_max_pages(),
            form: forms::ibprs_form(),
        }
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("OJK").separator("__"))
            .build()
            .context("Failed to read configuration sources")?;

        cfg.try_deserialize()
            .context("Invalid configuration (check config/*.toml and OJK__* variables)")
    }
}

// ── Runtime timing ───────────────────────────────────────────────────────────

/// `TimingConfig` converted to durations, shared by every wait in a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    pub element_timeout: Duration,
    pub postback_timeout: Duration,
    pub staleness_timeout: Duration,
    pub settle_delay: Duration,
    pub jitter: Duration,
    pub poll_interval: Duration,
    pub locate_retries: usize,
    pub retry_backoff: Duration,
}

impl From<&TimingConfig> for Timing {
    fn from(c: &TimingConfig) -> Self {
        Self {
            element_timeout: Duration::from_secs(c.element_timeout_secs),
            postback_timeout: Duration::from_secs(c.postback_timeout_secs),
            staleness_timeout: Duration::from_secs(c.staleness_timeout_secs),
            settle_delay: Duration::from_millis(c.settle_delay_ms),
            jitter: Duration::from_millis(c.jitter_ms),
            poll_interval: Duration::from_millis(c.poll_interval_ms.max(1)),
            locate_retries: c.locate_retries,
            retry_backoff: Duration::from_millis(c.retry_backoff_ms),
        }
    }
}

#[cfg(test)]
impl Timing {
    /// Near-zero waits for driving the in-memory fake.
    pub fn instant() -> Self {
        Self {
            element_timeout: Duration::from_millis(20),
            postback_timeout: Duration::from_millis(20),
            staleness_timeout: Duration::from_millis(20),
            settle_delay: Duration::ZERO,
            jitter: Duration::ZERO,
            poll_interval: Duration::from_millis(1),
            locate_retries: 2,
            retry_backoff: Duration::from_millis(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_any_source() {
        let cfg: AppConfig = config::Config::builder()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.timing.settle_delay_ms, 3000);
        assert_eq!(cfg.schedule.jobs.len(), 2);
        assert_eq!(cfg.schedule.queue_poll_secs, 60);
        assert_eq!(cfg.sindikasi.reports_syariah, vec![0, 1, 3]);
        assert_eq!(cfg.ibprs.provinces, vec!["Kep. Riau".to_string()]);
        assert!(cfg.publikasi.form.tab.is_some());
    }

    #[test]
    fn test_overrides_from_toml() {
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
                [timing]
                settle_delay_ms = 500

                [[schedule.jobs]]
                pipeline = "ibprs"
                weekday = "mon"
                at = "08:30"
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.timing.settle_delay_ms, 500);
        assert_eq!(cfg.timing.jitter_ms, 1000);
        assert_eq!(cfg.schedule.jobs[0].pipeline, PipelineId::Ibprs);
        assert_eq!(cfg.schedule.jobs.len(), 1);
    }

    #[test]
    fn test_timing_conversion() {
        let t = Timing::from(&TimingConfig::default());
        assert_eq!(t.settle_delay, Duration::from_secs(3));
        assert_eq!(t.poll_interval, Duration::from_millis(250));
    }
}
