//! Browser session layer.
//!
//! Everything above this module talks to a [`Session`], which wraps a
//! [`Driver`]. The production driver is [`chrome::ChromeDriver`]; tests use
//! an in-memory fake that models postbacks and stale nodes.

pub mod chrome;
pub mod cleanup;
pub mod session;
pub mod wait;

#[cfg(test)]
pub mod fake;

use crate::config::Strategy;
use crate::error::ScrapeResult;
use async_trait::async_trait;

pub use self::session::Session;
pub use self::wait::await_condition;

/// Opaque reference to a node located in the current document.
///
/// A handle outlives its node: once a postback replaces the node every
/// operation on the handle fails with `StaleReference`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementHandle(pub u64);

/// Low-level page automation primitives.
///
/// All lookups run against the current browsing context, which starts at the
/// top document after `navigate` and moves with `enter_frame`/`exit_frame`.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn navigate(&self, url: &str) -> ScrapeResult<()>;

    /// Every node matching the strategy, in document order.
    async fn find_all(&self, strategy: &Strategy) -> ScrapeResult<Vec<ElementHandle>>;

    async fn is_stale(&self, el: ElementHandle) -> ScrapeResult<bool>;
    async fn is_displayed(&self, el: ElementHandle) -> ScrapeResult<bool>;
    async fn is_enabled(&self, el: ElementHandle) -> ScrapeResult<bool>;
    async fn is_checked(&self, el: ElementHandle) -> ScrapeResult<bool>;

    async fn click(&self, el: ElementHandle) -> ScrapeResult<()>;

    /// Clear the field, type `text`, optionally commit with Enter.
    async fn type_text(&self, el: ElementHandle, text: &str, commit: bool) -> ScrapeResult<()>;

    /// Visible text, whitespace-trimmed.
    async fn text(&self, el: ElementHandle) -> ScrapeResult<String>;
    async fn inner_html(&self, el: ElementHandle) -> ScrapeResult<String>;

    /// Option captions of a native `<select>`.
    async fn options(&self, el: ElementHandle) -> ScrapeResult<Vec<String>>;

    /// Select the option whose caption equals `text`; `false` if none does.
    async fn select_option(&self, el: ElementHandle, text: &str) -> ScrapeResult<bool>;

    /// Switch into the first frame matching the strategy; `false` if none does.
    async fn enter_frame(&self, frame: &Strategy) -> ScrapeResult<bool>;

    /// Switch back to the parent browsing context.
    async fn exit_frame(&self) -> ScrapeResult<()>;

    async fn close(&self) -> ScrapeResult<()>;
}
