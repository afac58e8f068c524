use crate::error::{ScrapeError, ScrapeResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Poll `check` until it yields a value or `timeout` elapses.
///
/// The check runs at least once. Transient driver errors (stale nodes,
/// protocol hiccups) count as "not yet"; any other error ends the wait
/// immediately. Expiry is reported as `TimedOut`, unless the last check
/// failed, in which case that failure is returned.
pub async fn await_condition<T, F, Fut>(
    mut check: F,
    what: &str,
    timeout: Duration,
    poll: Duration,
) -> ScrapeResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ScrapeResult<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;
    let mut last_err = None;

    loop {
        attempts += 1;
        match check().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => last_err = None,
            Err(e) if e.is_transient() => {
                trace!("{}: transient ({}), polling on", what, e);
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }

        let now = Instant::now();
        if now >= deadline {
            trace!("{}: gave up after {} checks", what, attempts);
            if let Some(e) = last_err {
                return Err(e);
            }
            return Err(ScrapeError::TimedOut {
                what: what.to_string(),
                waited: timeout,
            });
        }
        tokio::time::sleep(poll.min(deadline - now)).await;
    }
}
