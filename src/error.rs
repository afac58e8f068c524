use std::time::Duration;
use thiserror::Error;

/// Failures raised by the browser-facing layers (session, sequencer).
///
/// `NoData` and `TransientFailure` live in
/// [`crate::models::ExtractionResult`] as extraction outcomes.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("element not found: {0}")]
    NotFound(String),

    #[error("stale element reference: {0}")]
    StaleReference(String),

    #[error("value {value:?} not offered by {control} (available: {})", .available.join(", "))]
    ValueNotFound {
        control: String,
        value: String,
        available: Vec<String>,
    },

    #[error("timed out after {waited:?} waiting for {what}")]
    TimedOut { what: String, waited: Duration },

    #[error("browser driver error: {0}")]
    Driver(String),

    #[error("form misconfigured: {0}")]
    Config(String),
}

impl ScrapeError {
    /// Errors worth re-locating and trying again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StaleReference(_) | Self::Driver(_))
    }
}

pub type ScrapeResult<T> = Result<T, ScrapeError>;
