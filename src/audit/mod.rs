//! Zero-value auditor and the single-pass retry driver.
//!
//! A zero in a financial report is far more often a failed extraction than
//! a real balance, but the two cannot be told apart. The auditor therefore
//! only flags entities; the retry driver re-scrapes each flagged entity once
//! and accepts whatever comes back.

use crate::artifact::{self, ArtifactGroup, OutputSchema};
use crate::models::{ExtractionResult, ReportEntity, ResultSet};
use crate::pipeline::Engine;
use crate::scraper::cleaner::parse_amount;
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};

/// Decides whether a monitored cell, or a group's length, makes its entity suspect.
pub trait ValueHeuristic: Send + Sync {
    fn is_suspect(&self, cell: &str) -> bool;

    /// `usual` is the row count most groups of the same kind have.
    fn is_short(&self, rows: usize, usual: usize) -> bool {
        rows < usual
    }
}

/// Empty, dash and numeric-zero cells are suspect; other text is not.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroValueHeuristic;

impl ValueHeuristic for ZeroValueHeuristic {
    fn is_suspect(&self, cell: &str) -> bool {
        let cell = cell.trim();
        if cell.is_empty() || cell == "-" || cell == "—" {
            return true;
        }
        matches!(parse_amount(cell), Some(v) if v == 0.0)
    }
}

/// Row count shared by most lengths, when one count clearly dominates.
fn usual_length(lengths: impl Iterator<Item = usize>) -> Option<usize> {
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for n in lengths {
        *counts.entry(n).or_default() += 1;
    }
    let mut ranked: Vec<(usize, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    match ranked.as_slice() {
        [(len, seen), rest @ ..] if *seen >= 2 && rest.first().is_none_or(|(_, other)| other < seen) => Some(*len),
        _ => None,
    }
}

/// Suspect entity names among already grouped rows.
///
/// A group is suspect when a monitored cell is zero or absent, or when it
/// has fewer rows than most groups of its kind (same `class` cell, if any).
pub fn audit_groups(
    groups: &[ArtifactGroup],
    monitored: &[usize],
    class: Option<usize>,
    heuristic: &dyn ValueHeuristic,
) -> BTreeSet<String> {
    let kind = |g: &ArtifactGroup| -> String {
        class
            .and_then(|i| g.rows.first().and_then(|r| r.get(i)))
            .map(|c| c.trim().to_string())
            .unwrap_or_default()
    };
    let mut usual: HashMap<String, Option<usize>> = HashMap::new();
    for g in groups {
        let k = kind(g);
        if !usual.contains_key(&k) {
            let lengths = groups.iter().filter(|o| kind(o) == k).map(|o| o.rows.len());
            let n = usual_length(lengths);
            usual.insert(k, n);
        }
    }

    groups
        .iter()
        .filter(|g| {
            let short = usual
                .get(&kind(g))
                .copied()
                .flatten()
                .is_some_and(|n| heuristic.is_short(g.rows.len(), n));
            if short {
                debug!("{}: {} rows, fewer than usual", g.entity, g.rows.len());
            }
            short
                || g.rows.iter().any(|row| {
                    monitored
                        .iter()
                        .any(|&i| heuristic.is_suspect(row.get(i).map(String::as_str).unwrap_or("")))
                })
        })
        .map(|g| g.entity.clone())
        .collect()
}

/// Audit a written artifact.
pub fn audit_artifact(
    path: &Path,
    schema: &OutputSchema,
    heuristic: &dyn ValueHeuristic,
) -> Result<BTreeSet<String>> {
    let groups = artifact::group_rows(&artifact::read(path)?);
    let suspects = audit_groups(&groups, &schema.monitored_indices(), schema.class_index(), heuristic);
    debug!("{:?}: {} groups, {} suspect", path, groups.len(), suspects.len());
    Ok(suspects)
}

/// Audit rows still held in memory, exactly as they would be written.
pub fn audit_results(
    results: &ResultSet,
    schema: &OutputSchema,
    heuristic: &dyn ValueHeuristic,
) -> BTreeSet<String> {
    let groups = artifact::group_rows(&schema.table(results));
    audit_groups(&groups, &schema.monitored_indices(), schema.class_index(), heuristic)
}

// ── Retry ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct RetryReport {
    pub attempted: usize,
    pub replaced: usize,
    pub still_suspect: BTreeSet<String>,
    pub still_failing: Vec<String>,
}

/// Re-scrape every suspect and every `failed` entity once, overwriting
/// their rows in `results`. Whatever is still suspect or missing afterwards
/// is logged and left as it is.
pub async fn retry(
    engine: &Engine<'_>,
    suspects: &BTreeSet<String>,
    failed: &[ReportEntity],
    results: &mut ResultSet,
) -> RetryReport {
    let mut report = RetryReport::default();

    // A suspect name covers every location listed under it.
    let mut queue: Vec<ReportEntity> = Vec::new();
    for name in suspects {
        let known: Vec<ReportEntity> = results.named(name).map(|g| g.entity.clone()).collect();
        if known.is_empty() {
            queue.push(ReportEntity::new(name));
        } else {
            queue.extend(known);
        }
    }
    let failed_only: Vec<ReportEntity> = failed
        .iter()
        .filter(|e| !queue.iter().any(|q| q.same_as(e)))
        .cloned()
        .collect();
    queue.extend(failed_only);

    for entity in queue {
        report.attempted += 1;
        info!("Retrying {} ({})", entity.name, entity.regime.label());

        match engine.scrape_entity(&entity, "retry").await {
            Some(ExtractionResult::Success(rows)) => {
                results.insert(entity, rows);
                report.replaced += 1;
            }
            Some(other) => debug!("{}: retry kept old rows ({})", entity.name, other.kind()),
            None => {}
        }
    }

    let pipeline = engine.pipeline();
    report.still_suspect = audit_results(results, pipeline.output_schema(), engine.heuristic())
        .intersection(suspects)
        .cloned()
        .collect();
    for name in &report.still_suspect {
        warn!("{} still has zero or missing values after retry; keeping as is", name);
    }
    report.still_failing = failed
        .iter()
        .filter(|e| !results.contains(e))
        .map(|e| e.name.clone())
        .collect();
    for name in &report.still_failing {
        warn!("{} failed again on retry; left out of the artifact", name);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ColumnSpec;

    fn r(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_zero_heuristic() {
        let h = ZeroValueHeuristic;
        assert!(h.is_suspect("0"));
        assert!(h.is_suspect("0,00"));
        assert!(h.is_suspect(" "));
        assert!(h.is_suspect("-"));
        assert!(!h.is_suspect("1.234"));
        assert!(!h.is_suspect("(5)"));
        assert!(!h.is_suspect("n.a. lihat catatan"));
    }

    #[test]
    fn test_grouped_suspects() {
        let records = vec![
            r(&["A", "m1", "10", "5"]),
            r(&["A", "m2", "0", "3"]),
            r(&["", "", "", ""]),
            r(&["B", "m1", "1", "1"]),
        ];
        let groups = artifact::group_rows(&records);
        let suspects = audit_groups(&groups, &[2, 3], None, &ZeroValueHeuristic);
        assert_eq!(suspects, BTreeSet::from(["A".to_string()]));
    }

    #[test]
    fn test_suspect_reported_once_and_missing_cells_count() {
        let records = vec![
            r(&["A", "m1", "0", "0"]),
            r(&["", "m2", "0", "3"]),
            r(&["B", "m1", "4"]),
            r(&["C", "m1", "4", "4"]),
        ];
        let groups = artifact::group_rows(&records);
        let suspects = audit_groups(&groups, &[2, 3], None, &ZeroValueHeuristic);
        assert_eq!(suspects.len(), 2);
        assert!(suspects.contains("A") && suspects.contains("B"));
    }

    #[test]
    fn test_short_group_is_suspect() {
        let records = vec![
            r(&["A", "Kas", "1", "1"]),
            r(&["", "Giro", "2", "2"]),
            r(&["", "Kredit", "3", "3"]),
            r(&["", "", "", ""]),
            r(&["B", "Kas", "1", "1"]),
            r(&["", "Kredit", "3", "3"]),
            r(&["", "", "", ""]),
            r(&["C", "Kas", "1", "1"]),
            r(&["", "Giro", "2", "2"]),
            r(&["", "Kredit", "3", "3"]),
        ];
        let groups = artifact::group_rows(&records);
        let suspects = audit_groups(&groups, &[2, 3], None, &ZeroValueHeuristic);
        assert_eq!(suspects, BTreeSet::from(["B".to_string()]));
    }

    #[test]
    fn test_usual_length_is_per_class() {
        // column 1 is the regime; syariah reports are one row shorter
        let records = vec![
            r(&["K1", "BPR", "Kas", "1"]),
            r(&["", "", "Giro", "1"]),
            r(&["", "", "", ""]),
            r(&["K2", "BPR", "Kas", "1"]),
            r(&["", "", "Giro", "1"]),
            r(&["", "", "", ""]),
            r(&["S1", "BPR Syariah", "Kas", "1"]),
            r(&["", "", "", ""]),
            r(&["S2", "BPR Syariah", "Kas", "1"]),
            r(&["", "", "", ""]),
            r(&["K3", "BPR", "Kas", "1"]),
        ];
        let groups = artifact::group_rows(&records);
        let suspects = audit_groups(&groups, &[3], Some(1), &ZeroValueHeuristic);
        assert_eq!(suspects, BTreeSet::from(["K3".to_string()]));
        // mixed together, the short syariah groups set the usual length
        assert!(audit_groups(&groups, &[3], None, &ZeroValueHeuristic).is_empty());
    }

    #[test]
    fn test_audit_written_artifact() {
        let schema = OutputSchema::new(
            "Nama",
            vec![
                ColumnSpec::cell("Pos", &[], Some(0)),
                ColumnSpec::cell("Terkini", &[], Some(1)),
                ColumnSpec::cell("Sebelumnya", &[], Some(2)),
            ],
            &["Terkini", "Sebelumnya"],
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.csv");
        std::fs::write(&path, "Nama,Pos,Terkini,Sebelumnya\nA,m1,10,5\n,m2,0,3\n,,,\nB,m1,1,1\n").unwrap();
        let suspects = audit_artifact(&path, &schema, &ZeroValueHeuristic).unwrap();
        assert_eq!(suspects, BTreeSet::from(["A".to_string()]));
    }
}
