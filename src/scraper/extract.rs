//! Extraction gate: turns the results container into an [`ExtractionResult`].

use crate::browser::Session;
use crate::config::ControlLocator;
use crate::error::ScrapeError;
use crate::models::{ExtractionResult, RowRecord};
use ::scraper::{ElementRef, Html, Selector};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("invalid selector {0:?}")]
    Selector(String),
}

pub struct ExtractionGate<'s> {
    session: &'s Session,
    container: &'s ControlLocator,
}

impl<'s> ExtractionGate<'s> {
    pub fn new(session: &'s Session, container: &'s ControlLocator) -> Self {
        Self { session, container }
    }

    /// Never fails: a missing or empty container is `NoData`, anything
    /// unexpected is a `TransientFailure` carrying the original message.
    pub async fn extract(&self, timeout: Duration) -> ExtractionResult {
        let retries = self.session.timing().locate_retries;
        let mut attempt = 0;

        let html = loop {
            let el = match self.session.locate(self.container, timeout).await {
                Ok(el) => el,
                Err(ScrapeError::NotFound(_)) => {
                    return ExtractionResult::NoData("results container never appeared".into());
                }
                Err(e) => return ExtractionResult::TransientFailure(e.to_string()),
            };
            match self.session.driver().inner_html(el).await {
                Ok(html) => break html,
                // Replaced by a late postback between lookup and read.
                Err(ScrapeError::StaleReference(_)) if attempt < retries => {
                    attempt += 1;
                    debug!("results container went stale, re-reading ({})", attempt);
                }
                Err(e) => return ExtractionResult::TransientFailure(format!("reading results: {e}")),
            }
        };

        if html.trim().is_empty() {
            return ExtractionResult::NoData("results container is empty".into());
        }

        match parse_table(&html) {
            Ok(rows) if rows.is_empty() => ExtractionResult::NoData("no data rows in results".into()),
            Ok(rows) => ExtractionResult::Success(rows),
            Err(e) => ExtractionResult::TransientFailure(e.to_string()),
        }
    }
}

// ── Table parsing ─────────────────────────────────────────────────────────────

fn selector(css: &str) -> Result<Selector, TableError> {
    Selector::parse(css).map_err(|_| TableError::Selector(css.to_string()))
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Header labels made usable as keys: a blank label becomes its positional
/// `Column_N`, a repeated one gets a `_2`, `_3`, ... suffix.
fn unique_labels(raw: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for (i, label) in raw.into_iter().enumerate() {
        let base = if label.is_empty() { format!("Column_{}", i + 1) } else { label };
        let mut key = base.clone();
        let mut n = 1;
        while out.contains(&key) {
            n += 1;
            key = format!("{base}_{n}");
        }
        out.push(key);
    }
    out
}

/// Parse the rows of a results fragment.
///
/// The first row is a header only if one of its cells is a `<th>`. With a
/// header every record is keyed by exactly those labels; without one, keys
/// are `Column_1`, `Column_2`, ... Rows without any text are skipped.
pub fn parse_table(html: &str) -> Result<Vec<RowRecord>, TableError> {
    // Bare rows (a tbody's inner HTML) are dropped by the parser outside a table.
    let source = if html.contains("<table") {
        html.to_string()
    } else {
        format!("<table>{html}</table>")
    };
    let doc = Html::parse_fragment(&source);
    let row_sel = selector("tr")?;
    let cell_sel = selector("th, td")?;
    let th_sel = selector("th")?;

    let mut headers: Option<Vec<String>> = None;
    let mut records = Vec::new();
    let mut first = true;

    for row in doc.select(&row_sel) {
        let cells: Vec<String> = row.select(&cell_sel).map(cell_text).collect();
        if cells.is_empty() {
            continue;
        }
        if first {
            first = false;
            if row.select(&th_sel).next().is_some() {
                headers = Some(unique_labels(cells));
                continue;
            }
        }
        if cells.iter().all(|c| c.is_empty()) {
            continue;
        }

        let record: RowRecord = match &headers {
            Some(labels) => labels
                .iter()
                .enumerate()
                .map(|(i, label)| (label.clone(), cells.get(i).cloned().unwrap_or_default()))
                .collect(),
            None => cells
                .into_iter()
                .enumerate()
                .map(|(i, v)| (format!("Column_{}", i + 1), v))
                .collect(),
        };
        records.push(record);
    }

    Ok(records)
}
