//! Queue marker files for on-demand syndication reports.
//!
//! One file per request, named `<prefix>_<name>_<DD>_<MM>_<YYYY>.txt`:
//!
//! ```text
//! SCRAPE = TRUE
//! NAME = Kelompok Riau
//! BPRS Syarikat Madani
//! PT BPR Lestari
//! ```
//!
//! Lines after `NAME` are the banks to report on. Only the `SCRAPE` value is
//! ever rewritten; every other byte of the file is preserved.

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub path: PathBuf,
    /// Request name from the file name
    pub name: String,
    /// Request date from the file name
    pub date: NaiveDate,
    pub scrape: bool,
    /// `NAME` value from the body
    pub title: String,
    pub banks: Vec<String>,
}

/// `(name, date)` from a marker file name, or `None` if it does not follow
/// the naming scheme.
pub fn parse_file_name(prefix: &str, file_name: &str) -> Option<(String, NaiveDate)> {
    let stem = file_name.strip_suffix(".txt")?;
    let rest = stem.strip_prefix(prefix)?.strip_prefix('_')?;
    let mut parts = rest.rsplitn(4, '_');
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u32 = parts.next()?.parse().ok()?;
    let day: u32 = parts.next()?.parse().ok()?;
    let name = parts.next()?.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), NaiveDate::from_ymd_opt(year, month, day)?))
}

fn key_value(line: &str) -> Option<(String, &str)> {
    let (key, value) = line.split_once('=')?;
    Some((key.trim().to_uppercase(), value.trim()))
}

/// `(scrape, title, banks)` from a marker file body.
pub fn parse_body(text: &str) -> (bool, String, Vec<String>) {
    let mut scrape = false;
    let mut title = String::new();
    let mut banks = Vec::new();

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match key_value(line) {
            Some((key, value)) if key == "SCRAPE" => scrape = value.eq_ignore_ascii_case("TRUE"),
            Some((key, value)) if key == "NAME" => title = value.to_string(),
            _ if !title.is_empty() => banks.push(line.to_string()),
            _ => debug!("ignoring queue line before NAME: {}", line),
        }
    }
    (scrape, title, banks)
}

pub fn load(path: &Path, prefix: &str) -> Result<QueueItem> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Bad queue path {:?}", path))?;
    let Some((name, date)) = parse_file_name(prefix, file_name) else {
        bail!("{:?} does not match {}_<name>_<DD>_<MM>_<YYYY>.txt", file_name, prefix);
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    let (scrape, title, banks) = parse_body(&text);
    Ok(QueueItem {
        path: path.to_path_buf(),
        name,
        date,
        scrape,
        title,
        banks,
    })
}

/// Every well-formed marker file in `dir`, sorted by path.
pub fn list(dir: &Path, prefix: &str) -> Result<Vec<QueueItem>> {
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list {:?}", dir))? {
        let path = entry?.path();
        if path.is_file() && path.extension().map(|e| e == "txt").unwrap_or(false) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut items = Vec::new();
    for path in paths {
        match load(&path, prefix) {
            Ok(item) => items.push(item),
            Err(e) => warn!("Skipping queue file: {:#}", e),
        }
    }
    Ok(items)
}

/// Marker files whose trigger flag is set.
pub fn pending_items(dir: &Path, prefix: &str) -> Result<Vec<QueueItem>> {
    Ok(list(dir, prefix)?.into_iter().filter(|i| i.scrape).collect())
}

/// Rewrite the value of the `SCRAPE` line to `FALSE`, leaving every other
/// byte untouched. Returns whether the file changed.
pub fn clear_trigger(path: &Path) -> Result<bool> {
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;

    let mut changed = false;
    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        match rewrite_scrape_line(line) {
            Some(new) if !changed && new != line => {
                out.push_str(&new);
                changed = true;
            }
            _ => out.push_str(line),
        }
    }

    if !changed {
        return Ok(false);
    }

    // Write beside the original and swap, so a crash never leaves half a file.
    let tmp = path.with_extension("txt.tmp");
    {
        let mut f = std::fs::File::create(&tmp).with_context(|| format!("Failed to create {:?}", tmp))?;
        f.write_all(out.as_bytes())?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path).with_context(|| format!("Failed to replace {:?}", path))?;
    debug!("Cleared SCRAPE flag in {:?}", path);
    Ok(true)
}

/// The line with its value replaced by `FALSE`, or `None` if it is not the
/// `SCRAPE` line.
fn rewrite_scrape_line(line: &str) -> Option<String> {
    let (key, _) = line.split_once('=')?;
    if !key.trim().eq_ignore_ascii_case("SCRAPE") {
        return None;
    }
    let eq = line.find('=')? + 1;
    let after = &line[eq..];
    let lead = after.len() - after.trim_start_matches([' ', '\t']).len();
    let value_start = eq + lead;
    let value_end = value_start
        + line[value_start..]
            .find(|c: char| c.is_whitespace())
            .unwrap_or(line.len() - value_start);
    Some(format!("{}FALSE{}", &line[..value_start], &line[value_end..]))
}
