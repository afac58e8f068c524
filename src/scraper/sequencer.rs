//! Selection sequencer: drives the report form through
//! tab → month → year → geography → report types → submit.

use super::extract::ExtractionGate;
use super::postback::{Settle, await_settle};
use crate::browser::{ElementHandle, Session};
use crate::config::{ControlKind, ControlSpec, FormConfig};
use crate::error::{ScrapeError, ScrapeResult};
use crate::models::{Dimension, ExtractionResult, FilterSequence, FilterState, FilterStep};
use std::future::Future;
use tokio_retry::RetryIf;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, warn};

pub struct Sequencer<'s> {
    session: &'s Session,
    form: &'s FormConfig,
    state: FilterState,
}

impl<'s> Sequencer<'s> {
    pub fn new(session: &'s Session, form: &'s FormConfig) -> Self {
        Self {
            session,
            form,
            state: FilterState::new(),
        }
    }

    pub fn state(&self) -> &FilterState {
        &self.state
    }

    /// Load the form afresh; all filter state is forgotten.
    pub async fn begin(&mut self, url: &str) -> ScrapeResult<()> {
        self.state.reset();
        self.session.navigate(url).await
    }

    /// Full pass for one filter sequence: load, select, submit, read every page.
    ///
    /// The form lives in a sub-document; it is entered once, before the first
    /// selection, and left only when the pass ends.
    pub async fn run(&mut self, seq: &FilterSequence, max_pages: usize) -> ScrapeResult<ExtractionResult> {
        self.begin(&seq.url).await?;
        let (session, form) = (self.session, self.form);
        session
            .with_sub_document(&form.frame, async {
                self.apply(&seq.steps).await?;
                let first = self.submit().await?;
                Ok(self.follow_pages(first, max_pages).await)
            })
            .await
    }

    /// Load the form, apply `steps`, then list what `dim` offers.
    pub async fn discover(
        &mut self,
        url: &str,
        steps: &[FilterStep],
        dim: Dimension,
        query: Option<&str>,
    ) -> ScrapeResult<Vec<String>> {
        self.begin(url).await?;
        let (session, form) = (self.session, self.form);
        session
            .with_sub_document(&form.frame, async {
                self.apply(steps).await?;
                self.options(dim, query).await
            })
            .await
    }

    pub async fn apply(&mut self, steps: &[FilterStep]) -> ScrapeResult<()> {
        for step in steps {
            match step {
                FilterStep::Set(dim, value) => self.set(*dim, value).await?,
                FilterStep::ReportTypes(indices) => self.set_report_types(indices).await?,
            }
        }
        Ok(())
    }

    // ── Field transitions ─────────────────────────────────────────────────────

    /// Apply `value` to the control for `dim`, wait for the postback, then
    /// clear every dependent dimension.
    pub async fn set(&mut self, dim: Dimension, value: &str) -> ScrapeResult<()> {
        let ctl = self.control(dim)?;
        debug!("set {} = {}", dim, value);

        let this = &*self;
        let prior = this
            .retrying(dim.label(), move || this.apply_value(dim, ctl, value))
            .await?;

        let successor = (!ctl.successor.is_empty()).then_some(&ctl.successor);
        let timeout = self.session.timing().postback_timeout;
        if await_settle(self.session, prior, successor, timeout).await == Settle::TimedOut {
            debug!("{} postback did not confirm; continuing", dim);
        }

        self.state.set(dim, value);
        Ok(())
    }

    /// Tick exactly the checkboxes at `indices`, untick the rest.
    pub async fn set_report_types(&mut self, indices: &[usize]) -> ScrapeResult<()> {
        let ctl = self.control(Dimension::ReportTypes)?;
        let this = &*self;
        this.retrying("report types", move || this.apply_checkboxes(ctl, indices))
            .await?;
        await_settle(self.session, None, None, self.session.timing().postback_timeout).await;

        let label: Vec<String> = indices.iter().map(|i| i.to_string()).collect();
        self.state.set(Dimension::ReportTypes, label.join(","));
        Ok(())
    }

    /// Click the action control and hand over to the extraction gate.
    pub async fn submit(&mut self) -> ScrapeResult<ExtractionResult> {
        let timing = *self.session.timing();
        let (session, form) = (self.session, self.form);
        let submit = self
            .retrying("submit", move || async move {
                let el = session.locate(&form.submit.locator, timing.element_timeout).await?;
                session.driver().click(el).await?;
                Ok(el)
            })
            .await?;
        self.state.mark_submitted();

        await_settle(self.session, Some(submit), Some(&self.form.results), timing.postback_timeout).await;

        let result = self.gate().extract(timing.element_timeout).await;
        self.state.mark_results(matches!(result, ExtractionResult::Success(_)));
        Ok(result)
    }

    /// Keep clicking the pagination control while it is enabled, appending rows.
    pub async fn follow_pages(&mut self, first: ExtractionResult, max_pages: usize) -> ExtractionResult {
        let ExtractionResult::Success(mut rows) = first else {
            return first;
        };
        if self.form.next_page.is_empty() {
            return ExtractionResult::Success(rows);
        }

        let timing = *self.session.timing();
        for page in 2..=max_pages {
            match self.next_page().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!("Pagination stopped before page {}: {}", page, e);
                    break;
                }
            }
            match self.gate().extract(timing.element_timeout).await {
                ExtractionResult::Success(more) => {
                    debug!("page {}: {} rows", page, more.len());
                    rows.extend(more);
                }
                ExtractionResult::NoData(reason) => {
                    debug!("page {} empty: {}", page, reason);
                    break;
                }
                ExtractionResult::TransientFailure(reason) => {
                    warn!("Page {} unreadable, keeping {} rows: {}", page, rows.len(), reason);
                    break;
                }
            }
        }
        ExtractionResult::Success(rows)
    }

    /// Advance one page; `false` when there is no enabled next control.
    async fn next_page(&self) -> ScrapeResult<bool> {
        let Some(next) = self.session.try_locate(&self.form.next_page).await? else {
            return Ok(false);
        };
        if !self.session.driver().is_enabled(next).await? {
            return Ok(false);
        }
        let container = self.session.try_locate(&self.form.results).await?;
        self.session.driver().click(next).await?;
        let timing = self.session.timing();
        await_settle(self.session, container, Some(&self.form.results), timing.postback_timeout).await;
        Ok(true)
    }

    // ── Option discovery ──────────────────────────────────────────────────────

    /// Captions currently offered by the control for `dim`, optionally
    /// narrowed through its search box.
    pub async fn options(&self, dim: Dimension, query: Option<&str>) -> ScrapeResult<Vec<String>> {
        let ctl = self.control(dim)?;
        self.retrying(dim.label(), move || self.read_options(ctl, query)).await
    }

    async fn read_options(&self, ctl: &ControlSpec, query: Option<&str>) -> ScrapeResult<Vec<String>> {
        let timing = self.session.timing();
        let driver = self.session.driver();
        match ctl.kind {
            ControlKind::Select => {
                let el = self.session.locate(&ctl.locator, timing.element_timeout).await?;
                driver.options(el).await
            }
            ControlKind::Combo | ControlKind::Tree => {
                let trigger = self.open_list(ctl, query).await?;
                let items = self.session.find_all_now(&ctl.items).await?;
                let mut captions = Vec::with_capacity(items.len());
                for item in items {
                    let text = driver.text(item).await?;
                    if !text.is_empty() {
                        captions.push(text);
                    }
                }
                self.close_list(trigger).await;
                Ok(captions)
            }
            other => Err(ScrapeError::Config(format!("{other:?} control has no options"))),
        }
    }

    // ── Control primitives ────────────────────────────────────────────────────

    fn control(&self, dim: Dimension) -> ScrapeResult<&'s ControlSpec> {
        self.form
            .control(dim)
            .ok_or_else(|| ScrapeError::NotFound(format!("no {} control configured", dim)))
    }

    fn gate(&self) -> ExtractionGate<'s> {
        ExtractionGate::new(self.session, &self.form.results)
    }

    /// Returns the node a postback is expected to replace.
    async fn apply_value(&self, dim: Dimension, ctl: &ControlSpec, value: &str) -> ScrapeResult<Option<ElementHandle>> {
        let timing = self.session.timing();
        let driver = self.session.driver();
        let wanted = value.trim();

        match ctl.kind {
            ControlKind::Select => {
                let el = self.session.locate(&ctl.locator, timing.element_timeout).await?;
                let offered = driver.options(el).await?;
                if !offered.iter().any(|o| o.trim() == wanted) || !driver.select_option(el, wanted).await? {
                    return Err(value_not_found(dim, wanted, offered));
                }
                Ok(Some(el))
            }
            ControlKind::Combo | ControlKind::Tree => {
                let query = (ctl.kind == ControlKind::Tree).then_some(wanted);
                let trigger = self.open_list(ctl, query).await?;
                let mut offered = Vec::new();
                for item in self.session.find_all_now(&ctl.items).await? {
                    let text = driver.text(item).await?;
                    if text.trim() == wanted {
                        driver.click(item).await?;
                        return Ok(Some(trigger));
                    }
                    offered.push(text);
                }
                self.close_list(trigger).await;
                Err(value_not_found(dim, wanted, offered))
            }
            ControlKind::Text => {
                let el = self.session.locate(&ctl.locator, timing.element_timeout).await?;
                driver.type_text(el, wanted, true).await?;
                Ok(Some(el))
            }
            ControlKind::Button => {
                let el = self
                    .session
                    .locate(&ctl.locator.with_value(wanted), timing.element_timeout)
                    .await?;
                driver.click(el).await?;
                Ok(Some(el))
            }
            ControlKind::Checkboxes => Err(ScrapeError::Config(format!(
                "{} is a checkbox group; use report type indices",
                dim
            ))),
        }
    }

    async fn apply_checkboxes(&self, ctl: &ControlSpec, indices: &[usize]) -> ScrapeResult<()> {
        let driver = self.session.driver();
        let boxes = self
            .session
            .locate_all(&ctl.locator, self.session.timing().element_timeout)
            .await?;

        if let Some(missing) = indices.iter().find(|i| **i >= boxes.len()) {
            return Err(value_not_found(
                Dimension::ReportTypes,
                &missing.to_string(),
                (0..boxes.len()).map(|i| i.to_string()).collect(),
            ));
        }

        for (i, el) in boxes.into_iter().enumerate() {
            let wanted = indices.contains(&i);
            if driver.is_checked(el).await? != wanted {
                driver.click(el).await?;
            }
        }
        Ok(())
    }

    /// Click the trigger and wait for list entries; types `query` into the
    /// search box first when the control has one.
    async fn open_list(&self, ctl: &ControlSpec, query: Option<&str>) -> ScrapeResult<ElementHandle> {
        let timing = self.session.timing();
        let driver = self.session.driver();
        let trigger = self.session.locate(&ctl.trigger, timing.element_timeout).await?;
        driver.click(trigger).await?;

        if let (Some(q), false) = (query, ctl.search.is_empty()) {
            let search = self.session.locate(&ctl.search, timing.element_timeout).await?;
            driver.type_text(search, q, false).await?;
            await_settle(self.session, None, None, timing.postback_timeout).await;
        }

        if self.session.locate_all(&ctl.items, timing.element_timeout).await.is_err() {
            debug!("list {} opened without entries", ctl.items);
        }
        Ok(trigger)
    }

    async fn close_list(&self, trigger: ElementHandle) {
        if let Err(e) = self.session.driver().click(trigger).await {
            debug!("closing list: {}", e);
        }
    }

    /// Retry transient lookup failures with backoff; a node that keeps going
    /// stale is reported as not found.
    async fn retrying<T, F, Fut>(&self, what: &str, action: F) -> ScrapeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ScrapeResult<T>>,
    {
        let timing = self.session.timing();
        let base = (timing.retry_backoff.as_millis() as u64 / 2).max(1);
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(base)
            .max_delay(timing.retry_backoff * 8)
            .map(jitter)
            .take(timing.locate_retries);

        RetryIf::spawn(strategy, action, |e: &ScrapeError| {
            let again = e.is_transient();
            if again {
                debug!("{}: {}, retrying", what, e);
            }
            again
        })
        .await
        .map_err(|e| match e {
            ScrapeError::StaleReference(detail) => {
                ScrapeError::NotFound(format!("{what} kept going stale ({detail})"))
            }
            other => other,
        })
    }
}

fn value_not_found(dim: Dimension, value: &str, available: Vec<String>) -> ScrapeError {
    ScrapeError::ValueNotFound {
        control: dim.label().to_string(),
        value: value.to_string(),
        available,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fake::{FakeDriver, report_html, test_form, test_search_form};
    use crate::config::Timing;
    use crate::models::SequencerState;

    const URL: &str = "https://cfs.example/Report.aspx";

    fn session(driver: &FakeDriver) -> Session {
        Session::new(Box::new(driver.clone()), Timing::instant())
    }

    fn full_sequence(bank: &str) -> FilterSequence {
        FilterSequence::new(URL)
            .set(Dimension::Tab, "BPR Konvensional")
            .set(Dimension::Month, "Desember")
            .set(Dimension::Year, "2024")
            .set(Dimension::Province, "Jawa Barat")
            .set(Dimension::City, "Kota Bandung")
            .set(Dimension::Bank, bank)
            .report_types(vec![0, 1, 2])
    }

    #[tokio::test]
    async fn test_full_sequence_reaches_results() {
        let driver = FakeDriver::with_form();
        driver.add_bank("Jawa Barat", "Kota Bandung", "PT BPR Sukamaju");
        driver.set_report("PT BPR Sukamaju", vec![report_html(&[["Kas", "1.000", "900"]])]);

        let s = session(&driver);
        let form = test_form();
        let mut seq = Sequencer::new(&s, &form);
        let result = seq.run(&full_sequence("PT BPR Sukamaju"), 5).await.unwrap();

        assert_eq!(result.row_count(), 1);
        assert_eq!(seq.state().stage(), SequencerState::ResultsReady);
        assert_eq!(driver.checked_boxes(), vec![0, 1, 2]);
        let submitted = &driver.submits()[0];
        assert_eq!(submitted["month"], "Desember");
        assert_eq!(submitted["year"], "2024");
        assert_eq!(submitted["city"], "Kota Bandung");
        // left the frame once the pass finished
        assert_eq!(driver.frame_depth(), 0);
    }

    #[tokio::test]
    async fn test_unknown_option_is_value_not_found() {
        let driver = FakeDriver::with_form();
        driver.add_bank("Jawa Barat", "Kota Bandung", "PT BPR Sukamaju");
        let s = session(&driver);
        let form = test_form();
        let mut seq = Sequencer::new(&s, &form);

        let err = seq
            .run(&FilterSequence::new(URL).set(Dimension::Province, "Atlantis"), 1)
            .await
            .unwrap_err();
        match err {
            ScrapeError::ValueNotFound { control, available, .. } => {
                assert_eq!(control, "province");
                assert_eq!(available, vec!["Jawa Barat".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(driver.frame_depth(), 0);
        assert!(driver.submits().is_empty());
    }

    #[tokio::test]
    async fn test_changing_province_clears_city_and_bank() {
        let driver = FakeDriver::with_form();
        driver.add_bank("Jawa Barat", "Kota Bandung", "PT BPR Sukamaju");
        driver.add_bank("Bali", "Kab. Badung", "PT BPR Kuta");
        let s = session(&driver);
        let form = test_form();
        let mut seq = Sequencer::new(&s, &form);

        seq.begin(URL).await.unwrap();
        s.enter_sub_document(&form.frame).await.unwrap();
        seq.set(Dimension::Province, "Jawa Barat").await.unwrap();
        seq.set(Dimension::City, "Kota Bandung").await.unwrap();
        seq.set(Dimension::Bank, "PT BPR Sukamaju").await.unwrap();
        seq.set(Dimension::Province, "Bali").await.unwrap();

        assert_eq!(seq.state().get(Dimension::Province), Some("Bali"));
        assert!(!seq.state().is_set(Dimension::City));
        assert!(!seq.state().is_set(Dimension::Bank));
        assert_eq!(driver.selection("city"), None);
        assert_eq!(seq.options(Dimension::City, None).await.unwrap(), vec!["Kab. Badung"]);
    }

    #[tokio::test]
    async fn test_discover_bank_through_search() {
        let driver = FakeDriver::with_form();
        driver.add_bank("Jawa Barat", "Kota Bandung", "PT BPR Sukamaju");
        driver.add_bank("Jawa Barat", "Kota Bogor", "PT BPR Sukamakmur");
        driver.add_bank("Bali", "Kab. Badung", "PT BPR Kuta");
        let s = session(&driver);
        let form = test_form();
        let mut seq = Sequencer::new(&s, &form);

        let mut found = seq
            .discover(URL, &[], Dimension::Bank, Some("sukama"))
            .await
            .unwrap();
        found.sort();
        assert_eq!(found, vec!["PT BPR Sukamaju", "PT BPR Sukamakmur"]);
    }

    #[tokio::test]
    async fn test_empty_container_ends_in_no_results() {
        let driver = FakeDriver::with_form();
        driver.add_bank("DKI Jakarta", "Jakarta Pusat", "PT BPR Kosong");
        driver.set_report("PT BPR Kosong", vec!["   ".into()]);
        let s = session(&driver);
        let form = test_form();
        let mut seq = Sequencer::new(&s, &form);

        let result = seq
            .run(
                &FilterSequence::new(URL)
                    .set(Dimension::Month, "Januari")
                    .set(Dimension::Year, "2025")
                    .set(Dimension::Province, "DKI Jakarta")
                    .set(Dimension::City, "Jakarta Pusat")
                    .set(Dimension::Bank, "PT BPR Kosong"),
                1,
            )
            .await
            .unwrap();
        assert!(matches!(result, ExtractionResult::NoData(_)));
        assert_eq!(seq.state().stage(), SequencerState::NoResults);
    }

    #[tokio::test]
    async fn test_pagination_collects_every_page() {
        let driver = FakeDriver::search_page();
        driver.add_province("Kep. Riau");
        let page = |name: &str| {
            format!("<tr><td>{name}</td><td>BPR</td><td>Kota Batam</td><td>Kep. Riau</td></tr>")
        };
        driver.set_report("Kep. Riau", vec![page("A"), page("B"), page("C")]);
        let s = session(&driver);
        let form = test_search_form();
        let mut seq = Sequencer::new(&s, &form);

        let seq_def = FilterSequence::new("https://ibpr-s.example/DataKeuangan")
            .set(Dimension::Province, "Kep. Riau");
        assert_eq!(seq.run(&seq_def, 10).await.unwrap().row_count(), 3);
        assert_eq!(seq.run(&seq_def, 2).await.unwrap().row_count(), 2);
    }
}
