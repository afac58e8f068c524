use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ── Pipelines ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PipelineId {
    /// Quarterly BPR Konvensional publication report
    Publikasi,
    /// Queue-driven per-bank publication report (both regimes)
    Sindikasi,
    /// Monthly IBPRS regional financial summary
    Ibprs,
}

impl PipelineId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publikasi => "publikasi",
            Self::Sindikasi => "sindikasi",
            Self::Ibprs => "ibprs",
        }
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Filter dimensions ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Tab,
    Month,
    Year,
    Province,
    City,
    Bank,
    ReportTypes,
}

impl Dimension {
    pub const ALL: [Dimension; 7] = [
        Self::Tab,
        Self::Month,
        Self::Year,
        Self::Province,
        Self::City,
        Self::Bank,
        Self::ReportTypes,
    ];

    /// Dimensions whose value is invalidated when this one changes.
    /// Already transitive: province lists bank as well as city.
    pub fn dependents(self) -> &'static [Dimension] {
        match self {
            Self::Tab => &[
                Self::Month,
                Self::Year,
                Self::Province,
                Self::City,
                Self::Bank,
                Self::ReportTypes,
            ],
            Self::Province => &[Self::City, Self::Bank],
            Self::City => &[Self::Bank],
            Self::Month | Self::Year | Self::Bank | Self::ReportTypes => &[],
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Tab => "tab",
            Self::Month => "month",
            Self::Year => "year",
            Self::Province => "province",
            Self::City => "city",
            Self::Bank => "bank",
            Self::ReportTypes => "report types",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Position of the selection sequencer in the filter form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SequencerState {
    Init,
    TabSelected,
    MonthSet,
    YearSet,
    GeographySet,
    ReportTypesSet,
    Submitted,
    ResultsReady,
    NoResults,
}

impl SequencerState {
    fn after(dim: Dimension) -> Self {
        match dim {
            Dimension::Tab => Self::TabSelected,
            Dimension::Month => Self::MonthSet,
            Dimension::Year => Self::YearSet,
            Dimension::Province | Dimension::City | Dimension::Bank => Self::GeographySet,
            Dimension::ReportTypes => Self::ReportTypesSet,
        }
    }
}

/// Current value of every UI filter dimension. Lives for one sequence.
#[derive(Debug, Clone)]
pub struct FilterState {
    values: BTreeMap<Dimension, String>,
    stage: SequencerState,
}

impl Default for FilterState {
    fn default() -> Self {
        Self {
            values: BTreeMap::new(),
            stage: SequencerState::Init,
        }
    }
}

impl FilterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a value and unset everything that depends on `dim`.
    pub fn set(&mut self, dim: Dimension, value: impl Into<String>) {
        for dep in dim.dependents() {
            self.values.remove(dep);
        }
        self.values.insert(dim, value.into());
        self.stage = SequencerState::after(dim);
    }

    pub fn get(&self, dim: Dimension) -> Option<&str> {
        self.values.get(&dim).map(String::as_str)
    }

    #[cfg(test)]
    pub fn is_set(&self, dim: Dimension) -> bool {
        self.values.contains_key(&dim)
    }

    pub fn stage(&self) -> SequencerState {
        self.stage
    }

    pub fn mark_submitted(&mut self) {
        self.stage = SequencerState::Submitted;
    }

    pub fn mark_results(&mut self, found: bool) {
        self.stage = if found {
            SequencerState::ResultsReady
        } else {
            SequencerState::NoResults
        };
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ── Extraction ────────────────────────────────────────────────────────────────

/// One extracted table row: column label → cell text, in source column order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RowRecord {
    cells: Vec<(String, String)>,
}

impl RowRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a cell. A repeated label keeps its first value.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if self.cells.iter().any(|(k, _)| *k == key) {
            return;
        }
        self.cells.push((key, value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn nth(&self, idx: usize) -> Option<&str> {
        self.cells.get(idx).map(|(_, v)| v.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RowRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = RowRecord::new();
        for (k, v) in iter {
            row.push(k, v);
        }
        row
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionResult {
    Success(Vec<RowRecord>),
    /// Legitimate absence of rows for the filter combination
    NoData(String),
    /// Something unexpected broke while reading the table
    TransientFailure(String),
}

impl ExtractionResult {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::NoData(_) => "no_data",
            Self::TransientFailure(_) => "transient_failure",
        }
    }

    pub fn row_count(&self) -> usize {
        match self {
            Self::Success(rows) => rows.len(),
            _ => 0,
        }
    }
}

// ── Entities ──────────────────────────────────────────────────────────────────

/// Regulatory regime; decides which sub-site and report types apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    Konvensional,
    Syariah,
}

impl Regime {
    pub fn classify(name: &str) -> Self {
        let upper = name.to_uppercase();
        if upper.contains("BPRS") || upper.contains("SYARIAH") {
            Self::Syariah
        } else {
            Self::Konvensional
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Konvensional => "BPR Konvensional",
            Self::Syariah => "BPR Syariah",
        }
    }

    pub fn from_label(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("BPR Konvensional") || s.eq_ignore_ascii_case("konvensional") {
            Some(Self::Konvensional)
        } else if s.eq_ignore_ascii_case("BPR Syariah") || s.eq_ignore_ascii_case("syariah") {
            Some(Self::Syariah)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEntity {
    /// Display name as offered by the site, trimmed
    pub name: String,
    pub regime: Regime,
    pub province: Option<String>,
    pub city: Option<String>,
    /// Search term that listed this entity, when it was found by searching
    pub search: Option<String>,
}

impl ReportEntity {
    pub fn new(name: &str) -> Self {
        let name = name.trim().to_string();
        Self {
            regime: Regime::classify(&name),
            name,
            province: None,
            city: None,
            search: None,
        }
    }

    pub fn with_location(mut self, province: Option<String>, city: Option<String>) -> Self {
        self.province = province.filter(|s| !s.trim().is_empty());
        self.city = city.filter(|s| !s.trim().is_empty());
        self
    }

    /// Same institution: banks sharing a name in different cities are not.
    pub fn same_as(&self, other: &ReportEntity) -> bool {
        self.name == other.name && self.province == other.province && self.city == other.city
    }
}

// ── Reporting period ──────────────────────────────────────────────────────────

pub const MONTHS: [&str; 12] = [
    "Januari",
    "Februari",
    "Maret",
    "April",
    "Mei",
    "Juni",
    "Juli",
    "Agustus",
    "September",
    "Oktober",
    "November",
    "Desember",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Period {
    pub month: u32,
    pub year: i32,
}

impl Period {
    pub fn new(month: u32, year: i32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { month, year })
    }

    pub fn month_name(&self) -> &'static str {
        MONTHS[(self.month as usize).saturating_sub(1).min(11)]
    }

    /// Latest quarter-end the regulator has published as of `date`.
    /// Jan-Mar → Desember (previous year), Apr-Jun → Maret,
    /// Jul-Sep → Juni, Oct-Dec → September.
    pub fn target_quarter(date: NaiveDate) -> Self {
        match date.month() {
            1..=3 => Self { month: 12, year: date.year() - 1 },
            4..=6 => Self { month: 3, year: date.year() },
            7..=9 => Self { month: 6, year: date.year() },
            _ => Self { month: 9, year: date.year() },
        }
    }

    /// `MM_YYYY`, as used in artifact names.
    pub fn tag(&self) -> String {
        format!("{:02}_{}", self.month, self.year)
    }

    /// Recover the period from an artifact name ending in `_MM_YYYY.<ext>`.
    pub fn from_artifact_name(name: &str) -> Option<Self> {
        let stem = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name);
        let mut parts = stem.rsplitn(3, '_');
        let year = parts.next()?.parse().ok()?;
        let month = parts.next()?.parse().ok()?;
        Self::new(month, year)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.month_name(), self.year)
    }
}

// ── Filter sequences ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum FilterStep {
    Set(Dimension, String),
    ReportTypes(Vec<usize>),
}

/// Everything needed to drive the form to one entity's results.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterSequence {
    pub url: String,
    pub steps: Vec<FilterStep>,
    /// Keep only rows naming this entity (pages that list many entities)
    pub keep_rows_for: Option<String>,
}

impl FilterSequence {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            steps: Vec::new(),
            keep_rows_for: None,
        }
    }

    pub fn set(mut self, dim: Dimension, value: impl Into<String>) -> Self {
        self.steps.push(FilterStep::Set(dim, value.into()));
        self
    }

    pub fn report_types(mut self, indices: Vec<usize>) -> Self {
        self.steps.push(FilterStep::ReportTypes(indices));
        self
    }

    pub fn keep_rows_for(mut self, name: impl Into<String>) -> Self {
        self.keep_rows_for = Some(name.into());
        self
    }
}

// ── Result set ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct EntityRows {
    pub entity: ReportEntity,
    pub rows: Vec<RowRecord>,
}

/// Rows accumulated during a run, one group per entity, in discovery order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    groups: Vec<EntityRows>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entity's rows, replacing any earlier rows for the same entity in place.
    pub fn insert(&mut self, entity: ReportEntity, rows: Vec<RowRecord>) {
        match self.groups.iter_mut().find(|g| g.entity.same_as(&entity)) {
            Some(group) => {
                group.entity = entity;
                group.rows = rows;
            }
            None => self.groups.push(EntityRows { entity, rows }),
        }
    }

    /// First group under `name`.
    pub fn get(&self, name: &str) -> Option<&EntityRows> {
        self.groups.iter().find(|g| g.entity.name == name)
    }

    /// Every group under `name`, one per location.
    pub fn named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a EntityRows> + 'a {
        self.groups.iter().filter(move |g| g.entity.name == name)
    }

    pub fn contains(&self, entity: &ReportEntity) -> bool {
        self.groups.iter().any(|g| g.entity.same_as(entity))
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRows> {
        self.groups.iter()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn total_rows(&self) -> usize {
        self.groups.iter().map(|g| g.rows.len()).sum()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
