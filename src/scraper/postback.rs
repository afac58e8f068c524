//! Postback synchronisation.
//!
//! The ExtJS/ASP.NET form gives no "update finished" event. Completion is
//! approximated by: the old node going stale, the expected successor node
//! appearing, then a fixed settle delay plus jitter for trailing script work.

use crate::browser::{ElementHandle, Session, await_condition};
use crate::config::ControlLocator;
use crate::utils;
use std::time::Duration;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    Ok,
    /// The successor never showed up; only the settle delay was applied
    TimedOut,
}

/// Wait for the partial page update triggered by the last UI action.
///
/// Never fails: an unobservable update degrades to the settle delay.
pub async fn await_settle(
    session: &Session,
    prior: Option<ElementHandle>,
    successor: Option<&ControlLocator>,
    timeout: Duration,
) -> Settle {
    let timing = *session.timing();
    let mut outcome = Settle::Ok;

    if let Some(el) = prior {
        // Bounded by the staleness timeout, not the caller's.
        let stale = await_condition(
            move || async move {
                let gone = session.driver().is_stale(el).await?;
                Ok(gone.then_some(()))
            },
            "prior element to detach",
            timing.staleness_timeout,
            timing.poll_interval,
        )
        .await;
        if stale.is_err() {
            trace!("prior element still attached; the update may have been in place");
        }
    }

    if let Some(locator) = successor.filter(|l| !l.is_empty()) {
        if let Err(e) = session.locate(locator, timeout).await {
            debug!("postback successor not seen: {}", e);
            outcome = Settle::TimedOut;
        }
    }

    utils::polite_pause(timing.settle_delay, timing.jitter).await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fake::{FakeDriver, test_form};
    use crate::config::Timing;

    async fn ready_session(driver: &FakeDriver) -> Session {
        let s = Session::new(Box::new(driver.clone()), Timing::instant());
        s.navigate("https://cfs.example/Report.aspx").await.unwrap();
        s.enter_sub_document(&test_form().frame).await.unwrap();
        s
    }

    #[tokio::test]
    async fn test_settles_after_postback_replaces_node() {
        let driver = FakeDriver::with_form();
        let s = ready_session(&driver).await;
        let form = test_form();
        let year = s.locate(&form.year.unwrap().locator, Duration::from_millis(10)).await.unwrap();
        s.driver().type_text(year, "2025", true).await.unwrap();

        let settled = await_settle(&s, Some(year), Some(&form.submit.locator), Duration::from_millis(20)).await;
        assert_eq!(settled, Settle::Ok);
        assert!(s.driver().is_stale(year).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_successor_degrades_without_error() {
        let driver = FakeDriver::with_form();
        let s = ready_session(&driver).await;
        let settled = await_settle(&s, None, Some(&test_form().results), Duration::from_millis(5)).await;
        assert_eq!(settled, Settle::TimedOut);
    }

    #[tokio::test]
    async fn test_never_stale_prior_is_tolerated() {
        let driver = FakeDriver::with_form();
        let s = ready_session(&driver).await;
        let form = test_form();
        let submit = s.locate(&form.submit.locator, Duration::from_millis(10)).await.unwrap();
        assert_eq!(await_settle(&s, Some(submit), None, Duration::from_millis(5)).await, Settle::Ok);
    }
}
