//! Quarterly BPR Konvensional publication report.
//!
//! Entities come from walking the geography controls: every configured
//! province (or every offered one), then each province's cities, then each
//! city's banks. Each bank is re-driven through the whole form on its own.

use super::{Discovered, ReportPipeline};
use crate::artifact::{ColumnSpec, EntityField, OutputSchema};
use crate::browser::Session;
use crate::config::{FormConfig, PublikasiConfig};
use crate::models::{Dimension, FilterSequence, FilterStep, PipelineId, Period, ReportEntity};
use crate::scraper::Sequencer;
use crate::utils::polite_pause;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::{debug, info, warn};

pub struct Publikasi {
    cfg: PublikasiConfig,
    period: Period,
    schema: OutputSchema,
}

/// Pos / current / previous, shared with the syndication report.
pub(super) fn value_columns() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::cell("Pos", &["Keterangan", "Uraian"], Some(0)),
        ColumnSpec::cell("Posisi Terkini", &[], Some(1)),
        ColumnSpec::cell("Posisi Sebelumnya", &[], Some(2)),
    ]
}

pub(super) const VALUE_HEADERS: [&str; 2] = ["Posisi Terkini", "Posisi Sebelumnya"];

impl Publikasi {
    pub fn new(cfg: PublikasiConfig, period: Period) -> Self {
        let mut columns = vec![
            ColumnSpec::entity("Provinsi", EntityField::Province),
            ColumnSpec::entity("Kota/Kab", EntityField::City),
        ];
        columns.extend(value_columns());
        Self {
            cfg,
            period,
            schema: OutputSchema::new("Nama Bank", columns, &VALUE_HEADERS),
        }
    }

    fn tab_step(&self) -> Vec<FilterStep> {
        if self.cfg.form.tab.is_some() && !self.cfg.tab.is_empty() {
            vec![FilterStep::Set(Dimension::Tab, self.cfg.tab.clone())]
        } else {
            vec![]
        }
    }

    async fn list(&self, session: &Session, steps: &[FilterStep], dim: Dimension) -> Result<Vec<String>> {
        let mut sequencer = Sequencer::new(session, &self.cfg.form);
        let found = sequencer
            .discover(&self.cfg.url, steps, dim, None)
            .await
            .with_context(|| format!("listing {}", dim))?;
        polite_pause(session.timing().settle_delay, session.timing().jitter).await;
        Ok(found)
    }
}

#[async_trait]
impl ReportPipeline for Publikasi {
    fn id(&self) -> PipelineId {
        PipelineId::Publikasi
    }

    fn form(&self) -> &FormConfig {
        &self.cfg.form
    }

    fn output_schema(&self) -> &OutputSchema {
        &self.schema
    }

    fn artifact_name(&self) -> String {
        format!("Publikasi_{}.csv", self.period.tag())
    }

    async fn enumerate_entities(&self, session: &Session) -> Result<Discovered> {
        let tab = self.tab_step();
        let provinces = if self.cfg.provinces.is_empty() {
            self.list(session, &tab, Dimension::Province).await?
        } else {
            self.cfg.provinces.clone()
        };
        if provinces.is_empty() {
            bail!("the form offered no provinces");
        }

        let mut entities: Vec<ReportEntity> = Vec::new();
        for province in &provinces {
            let mut steps = tab.clone();
            steps.push(FilterStep::Set(Dimension::Province, province.clone()));
            let cities = match self.list(session, &steps, Dimension::City).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("{}: cities unavailable, skipping province: {:#}", province, e);
                    continue;
                }
            };

            for city in cities {
                let mut steps = steps.clone();
                steps.push(FilterStep::Set(Dimension::City, city.clone()));
                let banks = match self.list(session, &steps, Dimension::Bank).await {
                    Ok(b) => b,
                    Err(e) => {
                        warn!("{} / {}: banks unavailable: {:#}", province, city, e);
                        continue;
                    }
                };
                debug!("{} / {}: {} banks", province, city, banks.len());
                for bank in banks {
                    let entity = ReportEntity::new(&bank).with_location(Some(province.clone()), Some(city.clone()));
                    if !entities.iter().any(|e| e.same_as(&entity)) {
                        entities.push(entity);
                    }
                }
            }
        }

        info!("Publikasi {}: {} banks across {} provinces", self.period, entities.len(), provinces.len());
        Ok(Discovered {
            entities,
            ..Default::default()
        })
    }

    fn filter_sequence_for(&self, entity: &ReportEntity) -> FilterSequence {
        let mut seq = FilterSequence::new(&self.cfg.url);
        seq.steps = self.tab_step();
        seq = seq
            .set(Dimension::Month, self.period.month_name())
            .set(Dimension::Year, self.period.year.to_string());
        if let Some(province) = &entity.province {
            seq = seq.set(Dimension::Province, province);
        }
        if let Some(city) = &entity.city {
            seq = seq.set(Dimension::City, city);
        }
        seq.set(Dimension::Bank, &entity.name)
            .report_types(self.cfg.report_types.clone())
    }
}
