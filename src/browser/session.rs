use super::wait::await_condition;
use super::{Driver, ElementHandle};
use crate::config::{ControlLocator, Timing};
use crate::error::{ScrapeError, ScrapeResult};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// One browser-session lifetime.
///
/// All interaction is sequential; the session is shared by reference across
/// the sequencer, the extraction gate and the pipelines of a single run.
pub struct Session {
    driver: Box<dyn Driver>,
    timing: Timing,
    frame_depth: AtomicUsize,
    closed: AtomicBool,
}

impl Session {
    pub fn new(driver: Box<dyn Driver>, timing: Timing) -> Self {
        Self {
            driver,
            timing,
            frame_depth: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn in_sub_document(&self) -> bool {
        self.frame_depth.load(Ordering::SeqCst) > 0
    }

    pub async fn navigate(&self, url: &str) -> ScrapeResult<()> {
        url::Url::parse(url).map_err(|e| ScrapeError::Config(format!("bad url {url}: {e}")))?;
        debug!("navigate → {}", url);
        self.driver.navigate(url).await?;
        // A fresh document always starts at the top context.
        self.frame_depth.store(0, Ordering::SeqCst);
        Ok(())
    }

    // ── Lookup ────────────────────────────────────────────────────────────────

    /// Single pass over the strategies; first live match wins.
    pub async fn try_locate(&self, locator: &ControlLocator) -> ScrapeResult<Option<ElementHandle>> {
        for strategy in locator.strategies() {
            for el in self.driver.find_all(strategy).await? {
                if !self.driver.is_stale(el).await? {
                    return Ok(Some(el));
                }
            }
        }
        Ok(None)
    }

    /// Wait for the control to appear; `NotFound` once `timeout` passes.
    pub async fn locate(&self, locator: &ControlLocator, timeout: Duration) -> ScrapeResult<ElementHandle> {
        if locator.is_empty() {
            return Err(ScrapeError::NotFound("empty locator".into()));
        }
        let what = locator.to_string();
        await_condition(move || self.try_locate(locator), &what, timeout, self.timing.poll_interval)
            .await
            .map_err(|e| match e {
                ScrapeError::TimedOut { .. } => ScrapeError::NotFound(what.clone()),
                other => other,
            })
    }

    /// All matches of the first strategy that matches anything, right now.
    pub async fn find_all_now(&self, locator: &ControlLocator) -> ScrapeResult<Vec<ElementHandle>> {
        for strategy in locator.strategies() {
            let found = self.driver.find_all(strategy).await?;
            if !found.is_empty() {
                return Ok(found);
            }
        }
        Ok(Vec::new())
    }

    /// Like [`find_all_now`](Self::find_all_now) but waits for at least one match.
    pub async fn locate_all(&self, locator: &ControlLocator, timeout: Duration) -> ScrapeResult<Vec<ElementHandle>> {
        let what = locator.to_string();
        await_condition(
            move || async move {
                let found = self.find_all_now(locator).await?;
                Ok((!found.is_empty()).then_some(found))
            },
            &what,
            timeout,
            self.timing.poll_interval,
        )
        .await
        .map_err(|e| match e {
            ScrapeError::TimedOut { .. } => ScrapeError::NotFound(what.clone()),
            other => other,
        })
    }

    // ── Sub-documents ─────────────────────────────────────────────────────────

    /// Enter the frame hosting the form and stay there.
    pub async fn enter_sub_document(&self, frame: &ControlLocator) -> ScrapeResult<()> {
        let what = format!("frame {}", frame);
        await_condition(
            move || async move {
                for strategy in frame.strategies() {
                    if self.driver.enter_frame(strategy).await? {
                        return Ok(Some(()));
                    }
                }
                Ok(None)
            },
            &what,
            self.timing.element_timeout,
            self.timing.poll_interval,
        )
        .await
        .map_err(|e| match e {
            ScrapeError::TimedOut { .. } => ScrapeError::NotFound(what.clone()),
            other => other,
        })?;
        self.frame_depth.fetch_add(1, Ordering::SeqCst);
        debug!("entered {}", what);
        Ok(())
    }

    pub async fn exit_sub_document(&self) -> ScrapeResult<()> {
        if self.frame_depth.load(Ordering::SeqCst) == 0 {
            return Ok(());
        }
        self.frame_depth.fetch_sub(1, Ordering::SeqCst);
        self.driver.exit_frame().await
    }

    /// Run `body` inside the sub-document and return to the outer context
    /// on every exit path. `body` is not polled until the frame is entered.
    pub async fn with_sub_document<T, Fut>(&self, frame: &ControlLocator, body: Fut) -> ScrapeResult<T>
    where
        Fut: Future<Output = ScrapeResult<T>>,
    {
        if frame.is_empty() {
            return body.await;
        }
        self.enter_sub_document(frame).await?;
        let result = body.await;
        if let Err(e) = self.exit_sub_document().await {
            warn!("Could not leave sub-document: {}", e);
        }
        result
    }

    // ── Teardown ──────────────────────────────────────────────────────────────

    /// Release the browser. Safe to call repeatedly.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.driver.close().await {
            warn!("Browser close reported: {}", e);
        }
        debug!("session closed");
    }
}
