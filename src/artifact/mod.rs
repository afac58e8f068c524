//! CSV artifacts: rendering a [`ResultSet`] into grouped rows and reading
//! them back.
//!
//! Layout: one header line, then one block of rows per entity. Entity
//! columns (name, location, regime) are filled on the first row of a block
//! only; a fully blank row separates blocks.

use crate::models::{EntityRows, Regime, ReportEntity, ResultSet, RowRecord};
use anyhow::{Context, Result, anyhow};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ── Schema ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityField {
    Name,
    Province,
    City,
    Regime,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Entity(EntityField),
    /// First present key wins, then the cell at `position`
    Cell { keys: Vec<String>, position: Option<usize> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub header: String,
    pub source: Source,
}

impl ColumnSpec {
    pub fn entity(header: &str, field: EntityField) -> Self {
        Self {
            header: header.to_string(),
            source: Source::Entity(field),
        }
    }

    pub fn cell(header: &str, keys: &[&str], position: Option<usize>) -> Self {
        Self {
            header: header.to_string(),
            source: Source::Cell {
                keys: keys.iter().map(|k| k.to_string()).collect(),
                position,
            },
        }
    }

    fn resolve(&self, entity: &ReportEntity, row: &RowRecord) -> String {
        match &self.source {
            Source::Entity(EntityField::Name) => entity.name.clone(),
            Source::Entity(EntityField::Province) => entity.province.clone().unwrap_or_default(),
            Source::Entity(EntityField::City) => entity.city.clone().unwrap_or_default(),
            Source::Entity(EntityField::Regime) => entity.regime.label().to_string(),
            Source::Cell { keys, position } => std::iter::once(&self.header)
                .chain(keys)
                .find_map(|k| row.get(k))
                .or_else(|| position.and_then(|p| row.nth(p)))
                .unwrap_or_default()
                .trim()
                .to_string(),
        }
    }
}

/// Column layout of one pipeline's artifact. The first column is always
/// the entity name.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSchema {
    columns: Vec<ColumnSpec>,
    monitored: Vec<String>,
}

impl OutputSchema {
    /// `columns` follow the name column; `monitored` are headers checked by the auditor.
    pub fn new(name_header: &str, columns: Vec<ColumnSpec>, monitored: &[&str]) -> Self {
        let mut all = vec![ColumnSpec::entity(name_header, EntityField::Name)];
        all.extend(columns);
        Self {
            columns: all,
            monitored: monitored.iter().map(|m| m.to_string()).collect(),
        }
    }

    pub fn headers(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.header.as_str()).collect()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Positions of the monitored columns.
    pub fn monitored_indices(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| self.monitored.contains(&c.header))
            .map(|(i, _)| i)
            .collect()
    }

    /// Position of the column telling groups of different shape apart.
    pub fn class_index(&self) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.source == Source::Entity(EntityField::Regime))
    }

    fn render_group(&self, group: &EntityRows, out: &mut Vec<Vec<String>>) {
        for (i, row) in group.rows.iter().enumerate() {
            let record = self
                .columns
                .iter()
                .map(|col| match col.source {
                    Source::Entity(_) if i > 0 => String::new(),
                    _ => col.resolve(&group.entity, row),
                })
                .collect();
            out.push(record);
        }
    }

    /// The body rows (no header) exactly as they are written.
    pub fn table(&self, results: &ResultSet) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        for group in results.iter().filter(|g| !g.rows.is_empty()) {
            if !out.is_empty() {
                out.push(vec![String::new(); self.width()]);
            }
            self.render_group(group, &mut out);
        }
        out
    }

    /// Serialise the whole artifact. Same input, same bytes.
    pub fn render(&self, results: &ResultSet) -> Result<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
        writer.write_record(self.headers())?;
        for record in self.table(results) {
            writer.write_record(&record)?;
        }
        writer
            .into_inner()
            .map_err(|e| anyhow!("Flushing CSV failed: {}", e.error()))
    }

    /// Regenerate the artifact at `path` from scratch.
    pub fn write(&self, path: &Path, results: &ResultSet) -> Result<PathBuf> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let bytes = self.render(results)?;
        std::fs::write(path, bytes).with_context(|| format!("Failed to write {:?}", path))?;
        info!(
            "Wrote {:?}: {} entities, {} rows",
            path,
            results.iter().filter(|g| !g.rows.is_empty()).count(),
            results.total_rows()
        );
        Ok(path.to_path_buf())
    }

    /// Rebuild the in-memory result set from a written artifact.
    pub fn load_results(&self, path: &Path) -> Result<ResultSet> {
        let records = read(path)?;
        let mut results = ResultSet::new();
        for group in group_rows(&records) {
            let first = group.rows.first();
            let field = |f: EntityField| -> Option<String> {
                let idx = self
                    .columns
                    .iter()
                    .position(|c| c.source == Source::Entity(f))?;
                first.and_then(|r| r.get(idx)).cloned()
            };

            let mut entity = ReportEntity::new(&group.entity)
                .with_location(field(EntityField::Province), field(EntityField::City));
            if let Some(regime) = field(EntityField::Regime).and_then(|r| Regime::from_label(&r)) {
                entity.regime = regime;
            }

            let rows = group
                .rows
                .iter()
                .map(|cells| {
                    self.columns
                        .iter()
                        .enumerate()
                        .filter(|(_, c)| matches!(c.source, Source::Cell { .. }))
                        .map(|(i, c)| (c.header.clone(), cells.get(i).cloned().unwrap_or_default()))
                        .collect::<RowRecord>()
                })
                .collect();
            results.insert(entity, rows);
        }
        debug!("Loaded {} entities from {:?}", results.len(), path);
        Ok(results)
    }
}

// ── Reading ───────────────────────────────────────────────────────────────────

/// Body records of an artifact (header line dropped). Ragged lines are kept.
pub fn read(path: &Path) -> Result<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open artifact {:?}", path))?;

    let mut records = Vec::new();
    for (i, result) in reader.records().enumerate() {
        match result {
            Ok(r) => records.push(r.iter().map(|s| s.to_string()).collect()),
            Err(e) => warn!("Row {} in {:?}: {}", i + 1, path, e),
        }
    }
    Ok(records)
}

/// Consecutive rows belonging to one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactGroup {
    pub entity: String,
    pub rows: Vec<Vec<String>>,
}

fn is_blank(record: &[String]) -> bool {
    record.iter().all(|c| c.trim().is_empty())
}

/// Group rows by the entity in the leading column. A row without a name
/// continues the current group, a blank row closes it. Rows before any
/// named row are dropped.
pub fn group_rows(records: &[Vec<String>]) -> Vec<ArtifactGroup> {
    let mut groups: Vec<ArtifactGroup> = Vec::new();
    let mut open = false;

    for record in records {
        if is_blank(record) {
            open = false;
            continue;
        }
        let name = record.first().map(|s| s.trim()).unwrap_or_default();
        if !name.is_empty() {
            match groups.last_mut() {
                Some(g) if open && g.entity == name => g.rows.push(record.clone()),
                _ => groups.push(ArtifactGroup {
                    entity: name.to_string(),
                    rows: vec![record.clone()],
                }),
            }
            open = true;
        } else if open {
            if let Some(g) = groups.last_mut() {
                g.rows.push(record.clone());
            }
        }
    }
    groups
}
