//! On-demand syndication report for a list of banks from a queue file.
//!
//! Each requested name is classified into a regime, searched in that
//! regime's bank tree, and every plausible match becomes an entity.

use super::publikasi::{VALUE_HEADERS, value_columns};
use super::{Discovered, ReportPipeline};
use crate::artifact::{ColumnSpec, EntityField, OutputSchema};
use crate::browser::Session;
use crate::config::{FormConfig, SindikasiConfig};
use crate::models::{Dimension, FilterSequence, FilterStep, PipelineId, Period, Regime, ReportEntity};
use crate::queue::QueueItem;
use crate::scraper::Sequencer;
use crate::scraper::cleaner::{fuzzy_match_bank, looks_like_bank_option, strip_bank_prefix};
use crate::utils::{polite_pause, sanitize_filename};
use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

pub struct Sindikasi {
    cfg: SindikasiConfig,
    name: String,
    period: Period,
    banks: Vec<String>,
    schema: OutputSchema,
}

impl Sindikasi {
    /// Pipeline for one queue item; the period is the latest published
    /// quarter as of the item's date.
    pub fn for_item(cfg: SindikasiConfig, item: &QueueItem) -> Self {
        let name = if item.title.is_empty() { &item.name } else { &item.title };
        let mut pipeline = Self::for_artifact(cfg, name, Period::target_quarter(item.date));
        pipeline.banks = item.banks.clone();
        pipeline
    }

    /// Pipeline without a bank list, for re-working an existing artifact.
    pub fn for_artifact(cfg: SindikasiConfig, name: &str, period: Period) -> Self {
        let mut columns = vec![ColumnSpec::entity("Jenis", EntityField::Regime)];
        columns.extend(value_columns());
        Self {
            cfg,
            name: name.trim().to_string(),
            period,
            banks: Vec::new(),
            schema: OutputSchema::new("Nama Bank", columns, &VALUE_HEADERS),
        }
    }

    fn url(&self, regime: Regime) -> &str {
        match regime {
            Regime::Konvensional => &self.cfg.url_konvensional,
            Regime::Syariah => &self.cfg.url_syariah,
        }
    }

    fn reports(&self, regime: Regime) -> Vec<usize> {
        match regime {
            Regime::Konvensional => self.cfg.reports_konvensional.clone(),
            Regime::Syariah => self.cfg.reports_syariah.clone(),
        }
    }

    fn period_steps(&self) -> Vec<FilterStep> {
        vec![
            FilterStep::Set(Dimension::Month, self.period.month_name().to_string()),
            FilterStep::Set(Dimension::Year, self.period.year.to_string()),
        ]
    }
}

/// Report-group captions that show up in each regime's bank tree.
fn tree_noise(regime: Regime) -> &'static [&'static str] {
    match regime {
        Regime::Konvensional => &["BPK-BPR Konvensional"],
        Regime::Syariah => &["Komitmen dan Kontijensi"],
    }
}

#[async_trait]
impl ReportPipeline for Sindikasi {
    fn id(&self) -> PipelineId {
        PipelineId::Sindikasi
    }

    fn form(&self) -> &FormConfig {
        &self.cfg.form
    }

    fn output_schema(&self) -> &OutputSchema {
        &self.schema
    }

    fn artifact_name(&self) -> String {
        format!("Sindikasi_{}_{}.csv", sanitize_filename(&self.name), self.period.tag())
    }

    async fn enumerate_entities(&self, session: &Session) -> Result<Discovered> {
        let steps = self.period_steps();
        let mut entities: Vec<ReportEntity> = Vec::new();

        for wanted in &self.banks {
            let regime = Regime::classify(wanted);
            let query = strip_bank_prefix(wanted);
            let mut sequencer = Sequencer::new(session, &self.cfg.form);
            let offered = match sequencer
                .discover(self.url(regime), &steps, Dimension::Bank, Some(&query))
                .await
            {
                Ok(o) => o,
                Err(e) => {
                    warn!("{}: bank search failed: {}", wanted, e);
                    continue;
                }
            };

            let candidates: Vec<String> = offered
                .into_iter()
                .filter(|c| looks_like_bank_option(c, tree_noise(regime)))
                .collect();
            let matches = fuzzy_match_bank(wanted, &candidates);
            if matches.is_empty() {
                warn!("{}: no matching bank among {} options", wanted, candidates.len());
            }
            for name in matches {
                if entities.iter().any(|e| e.name == name.trim()) {
                    continue;
                }
                debug!("{} → {}", wanted, name);
                let mut entity = ReportEntity::new(name);
                entity.regime = regime;
                entities.push(entity);
            }
            polite_pause(session.timing().settle_delay, session.timing().jitter).await;
        }

        info!(
            "Sindikasi {} ({}): {} of {} requested banks found",
            self.name,
            self.period,
            entities.len(),
            self.banks.len()
        );
        Ok(Discovered {
            entities,
            ..Default::default()
        })
    }

    fn filter_sequence_for(&self, entity: &ReportEntity) -> FilterSequence {
        let mut seq = FilterSequence::new(self.url(entity.regime));
        seq.steps = self.period_steps();
        seq.set(Dimension::Bank, &entity.name)
            .report_types(self.reports(entity.regime))
    }
}
