//! Monthly IBPRS regional summary.
//!
//! One search per province returns every institution in it across plain
//! numbered pages, so entities are found and read in the same pass. A retry
//! repeats the province search and keeps only the retried institution.

use super::{Discovered, ReportPipeline};
use crate::artifact::{ColumnSpec, EntityField, OutputSchema};
use crate::browser::Session;
use crate::config::{FormConfig, IbprsConfig};
use crate::models::{Dimension, ExtractionResult, FilterSequence, PipelineId, ReportEntity, RowRecord};
use crate::scraper::Sequencer;
use crate::scraper::cleaner::normalise_entity;
use crate::utils::polite_pause;
use anyhow::{Result, bail};
use async_trait::async_trait;
use tracing::{info, warn};

const NAME: &str = "NAMA BPR/S";
const CITY_POS: usize = 2;
const PROVINCE_POS: usize = 3;

pub struct Ibprs {
    cfg: IbprsConfig,
    schema: OutputSchema,
}

impl Ibprs {
    pub fn new(cfg: IbprsConfig) -> Self {
        let schema = OutputSchema::new(
            NAME,
            vec![
                ColumnSpec::cell("JENIS", &[], Some(1)),
                ColumnSpec::entity("KAB/KOTA", EntityField::City),
                ColumnSpec::entity("PROVINSI", EntityField::Province),
                ColumnSpec::cell("ASET", &["TOTAL ASET"], Some(4)),
                ColumnSpec::cell("DANA PIHAK KETIGA", &["DPK"], Some(5)),
                ColumnSpec::cell("KREDIT/PEMBIAYAAN", &["KREDIT", "PEMBIAYAAN"], Some(6)),
            ],
            &["ASET", "DANA PIHAK KETIGA", "KREDIT/PEMBIAYAAN"],
        );
        Self { cfg, schema }
    }

    fn search(&self, province: &str) -> FilterSequence {
        FilterSequence::new(&self.cfg.url).set(Dimension::Province, province)
    }

    /// The configured province that finds `entity` again. Entities read back
    /// from an artifact only carry the displayed province, which is matched
    /// against the configured terms loosely.
    fn search_term(&self, entity: &ReportEntity) -> String {
        let configured = || {
            let shown = entity.province.as_deref()?;
            self.cfg
                .provinces
                .iter()
                .find(|p| same_place(p, shown))
                .cloned()
        };
        entity
            .search
            .clone()
            .or_else(configured)
            .or_else(|| entity.province.clone())
            .or_else(|| self.cfg.provinces.first().cloned())
            .unwrap_or_default()
    }
}

fn same_place(a: &str, b: &str) -> bool {
    let key = |s: &str| -> String {
        s.chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(char::to_lowercase)
            .collect()
    };
    key(a) == key(b)
}

fn cell(row: &RowRecord, key: &str, pos: usize) -> Option<String> {
    row.get(key)
        .or_else(|| row.nth(pos))
        .map(normalise_entity)
        .filter(|s| !s.is_empty())
}

#[async_trait]
impl ReportPipeline for Ibprs {
    fn id(&self) -> PipelineId {
        PipelineId::Ibprs
    }

    fn form(&self) -> &FormConfig {
        &self.cfg.form
    }

    fn output_schema(&self) -> &OutputSchema {
        &self.schema
    }

    fn artifact_name(&self) -> String {
        "IBPRS.csv".to_string()
    }

    fn max_pages(&self) -> usize {
        self.cfg.max_pages.max(1)
    }

    async fn enumerate_entities(&self, session: &Session) -> Result<Discovered> {
        let mut found = Discovered::default();
        let mut failed = 0;

        for province in &self.cfg.provinces {
            let mut sequencer = Sequencer::new(session, &self.cfg.form);
            let rows = match sequencer.run(&self.search(province), self.max_pages()).await {
                Ok(ExtractionResult::Success(rows)) => rows,
                Ok(ExtractionResult::NoData(reason)) => {
                    info!("{}: no institutions listed ({})", province, reason);
                    continue;
                }
                Ok(ExtractionResult::TransientFailure(reason)) => {
                    warn!("{}: results unreadable: {}", province, reason);
                    failed += 1;
                    continue;
                }
                Err(e) => {
                    warn!("{}: search failed: {}", province, e);
                    failed += 1;
                    continue;
                }
            };

            let before = found.entities.len();
            for row in rows {
                let Some(name) = self.entity_of_row(&row) else { continue };
                match found.prefetched.get(&name) {
                    Some(group) => {
                        let mut rows = group.rows.clone();
                        rows.push(row);
                        let entity = group.entity.clone();
                        found.prefetched.insert(entity, rows);
                    }
                    None => {
                        let mut entity = ReportEntity::new(&name).with_location(
                            cell(&row, "PROVINSI", PROVINCE_POS).or_else(|| Some(province.clone())),
                            cell(&row, "KAB/KOTA", CITY_POS),
                        );
                        entity.search = Some(province.clone());
                        found.entities.push(entity.clone());
                        found.prefetched.insert(entity, vec![row]);
                    }
                }
            }
            info!("{}: {} institutions", province, found.entities.len() - before);
            polite_pause(session.timing().settle_delay, session.timing().jitter).await;
        }

        if failed > 0 && failed == self.cfg.provinces.len() {
            bail!("every province search failed");
        }
        Ok(found)
    }

    fn filter_sequence_for(&self, entity: &ReportEntity) -> FilterSequence {
        self.search(&self.search_term(entity)).keep_rows_for(&entity.name)
    }

    fn entity_of_row(&self, row: &RowRecord) -> Option<String> {
        cell(row, NAME, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::ZeroValueHeuristic;
    use crate::browser::fake::{FakeDriver, test_search_form};
    use crate::config::Timing;
    use crate::pipeline::Engine;

    fn row(name: &str, aset: &str) -> String {
        format!(
            "<tr><td>{name}</td><td>BPR</td><td>Kota Batam</td><td>Kep. Riau</td>\
             <td>{aset}</td><td>80</td><td>70</td></tr>"
        )
    }

    fn pipeline() -> Ibprs {
        Ibprs::new(IbprsConfig {
            url: "https://ibpr-s.example/DataKeuangan".into(),
            provinces: vec!["Kep. Riau".into()],
            max_pages: 10,
            form: test_search_form(),
        })
    }

    #[tokio::test]
    async fn test_pages_become_entities() {
        let driver = FakeDriver::search_page();
        driver.add_province("Kep. Riau");
        driver.set_report(
            "Kep. Riau",
            vec![row("PT BPR Batam Jaya", "100") + &row("PT BPR Bintan", "90"), row("BPRS Kepri", "75")],
        );
        let s = Session::new(Box::new(driver.clone()), Timing::instant());

        let found = pipeline().enumerate_entities(&s).await.unwrap();
        assert_eq!(found.entities.len(), 3);
        assert_eq!(found.prefetched.total_rows(), 3);
        let bintan = &found.prefetched.get("PT BPR Bintan").unwrap().entity;
        assert_eq!(bintan.city.as_deref(), Some("Kota Batam"));
        assert_eq!(bintan.province.as_deref(), Some("Kep. Riau"));
    }

    #[tokio::test]
    async fn test_retry_keeps_only_the_suspect_rows() {
        let driver = FakeDriver::search_page();
        driver.add_province("Kep. Riau");
        driver.set_report("Kep. Riau", vec![row("PT BPR Batam Jaya", "100") + &row("PT BPR Bintan", "0")]);
        let s = Session::new(Box::new(driver.clone()), Timing::instant());
        let p = pipeline();
        let dir = tempfile::tempdir().unwrap();

        let summary = Engine::new(&s, &p, &ZeroValueHeuristic)
            .run_full(dir.path())
            .await
            .unwrap();
        assert_eq!(summary.suspects, 1);
        assert_eq!(summary.still_suspect, 1);
        // one search to discover, one to retry
        assert_eq!(driver.submits().len(), 2);

        let text = std::fs::read_to_string(&summary.artifact).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "NAMA BPR/S,JENIS,KAB/KOTA,PROVINSI,ASET,DANA PIHAK KETIGA,KREDIT/PEMBIAYAAN",
                "PT BPR Batam Jaya,BPR,Kota Batam,Kep. Riau,100,80,70",
                ",,,,,,",
                "PT BPR Bintan,BPR,Kota Batam,Kep. Riau,0,80,70",
            ]
        );
    }

    #[tokio::test]
    async fn test_retry_searches_the_configured_province() {
        let driver = FakeDriver::search_page();
        driver.add_province("Kep. Riau");
        driver.set_report(
            "Kep. Riau",
            vec!["<tr><td>PT BPR Natuna</td><td>BPR</td><td>Kab. Natuna</td><td>KEPULAUAN RIAU</td>\
                  <td>0</td><td>80</td><td>70</td></tr>"
                .to_string()],
        );
        let s = Session::new(Box::new(driver.clone()), Timing::instant());
        let p = pipeline();
        let dir = tempfile::tempdir().unwrap();

        let summary = Engine::new(&s, &p, &ZeroValueHeuristic)
            .run_full(dir.path())
            .await
            .unwrap();
        assert_eq!(summary.suspects, 1);
        let searched: Vec<String> = driver.submits().iter().map(|s| s["province"].clone()).collect();
        assert_eq!(searched, vec!["Kep. Riau", "Kep. Riau"]);
        let text = std::fs::read_to_string(&summary.artifact).unwrap();
        assert!(text.contains("PT BPR Natuna,BPR,Kab. Natuna,KEPULAUAN RIAU,0,80,70"));
    }

    #[test]
    fn test_artifact_entities_map_back_to_configured_term() {
        let p = pipeline();
        let loaded = ReportEntity::new("PT BPR Bintan").with_location(Some("KEPULAUAN RIAU".into()), None);
        assert_eq!(p.search_term(&loaded), "KEPULAUAN RIAU");
        let loaded = ReportEntity::new("PT BPR Bintan").with_location(Some("Kep Riau".into()), None);
        assert_eq!(p.search_term(&loaded), "Kep. Riau");
        assert_eq!(p.search_term(&ReportEntity::new("PT BPR Bintan")), "Kep. Riau");
    }

    #[tokio::test]
    async fn test_province_without_results_is_not_an_error() {
        let driver = FakeDriver::search_page();
        driver.add_province("Kep. Riau");
        let s = Session::new(Box::new(driver.clone()), Timing::instant());
        let found = pipeline().enumerate_entities(&s).await.unwrap();
        assert!(found.entities.is_empty());
    }
}
